//! Process-wide setup.
//!
//! Call [`init`] once before creating transports and [`cleanup`] at shutdown.
//! Both are idempotent. Transports never call them implicitly.

use std::sync::atomic::{AtomicBool, Ordering};

static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Install the process crypto provider. Returns false if already initialized.
pub fn init() -> bool {
    if INITIALIZED.swap(true, Ordering::AcqRel) {
        return false;
    }
    // Fails only if another provider is already installed, which is fine.
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    log::debug!("QUIC data-channel library initialized");
    true
}

/// Release global state. Returns false if not initialized.
///
/// The rustls provider cannot be uninstalled; a later [`init`] is a no-op
/// for it.
pub fn cleanup() -> bool {
    if !INITIALIZED.swap(false, Ordering::AcqRel) {
        return false;
    }
    log::debug!("QUIC data-channel library cleaned up");
    true
}

pub fn is_initialized() -> bool {
    INITIALIZED.load(Ordering::Acquire)
}
