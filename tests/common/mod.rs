//! Shared helpers for integration tests.

#![allow(dead_code)]

use parking_lot::Mutex;
use quic_datachannel::{Message, Transport, TransportBase, TransportState};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
        .is_test(true)
        .try_init();
    quic_datachannel::global::init();
}

/// One end of an in-memory datagram pipe.
///
/// `send` hands the datagram straight to the other end's receive hook.
pub struct PipeEnd {
    base: TransportBase,
    peer: Mutex<Weak<PipeEnd>>,
    /// Drop every datagram while set.
    blackhole: AtomicBool,
    pub datagrams: AtomicUsize,
}

impl PipeEnd {
    fn new() -> Arc<Self> {
        let end = Arc::new(Self {
            base: TransportBase::new(None, None),
            peer: Mutex::new(Weak::new()),
            blackhole: AtomicBool::new(false),
            datagrams: AtomicUsize::new(0),
        });
        end.base.change_state(TransportState::Connected);
        end
    }

    pub fn set_blackhole(&self, enabled: bool) {
        self.blackhole.store(enabled, Ordering::SeqCst);
    }
}

impl Transport for PipeEnd {
    fn base(&self) -> &TransportBase {
        &self.base
    }

    fn send(&self, message: Message) -> bool {
        if self.blackhole.load(Ordering::SeqCst) {
            return true;
        }
        let peer = self.peer.lock().upgrade();
        match peer {
            Some(peer) => {
                self.datagrams.fetch_add(1, Ordering::Relaxed);
                peer.incoming(message);
                true
            }
            None => false,
        }
    }
}

/// Two connected pipe ends.
pub fn pipe() -> (Arc<PipeEnd>, Arc<PipeEnd>) {
    let a = PipeEnd::new();
    let b = PipeEnd::new();
    *a.peer.lock() = Arc::downgrade(&b);
    *b.peer.lock() = Arc::downgrade(&a);
    (a, b)
}

/// Poll `condition` until it holds or five seconds pass.
pub async fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
