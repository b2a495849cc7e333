//! Transport configuration.
//!
//! Two layers:
//! - [`Configuration`] and [`QuicSettings`] are the runtime values handed to
//!   [`QuicTransport::new`](crate::quic::QuicTransport::new).
//! - [`ConfigFile`] is the optional TOML form with `[transport]` and `[quic]`
//!   sections. All fields are optional; `resolve()` fills in defaults after
//!   `validate()` has range-checked what was given.

use crate::quic::tls::{normalize_fingerprint, Identity};
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Largest message accepted when none is configured (64 KB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 65536;

/// Upper bound on a configured message size (16 MB).
pub const MAX_MESSAGE_SIZE_LIMIT: usize = 16 * 1024 * 1024;

/// Default concurrent stream limit in each direction.
pub const DEFAULT_MAX_STREAMS: u64 = 100;

/// Logical stream ids are 16-bit.
pub const MAX_STREAMS_LIMIT: u64 = u16::MAX as u64 + 1;

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_PING_PERIOD: Duration = Duration::from_secs(30);

/// SNI sent by the client. The certificate is pinned by fingerprint, so
/// the name only has to match what the identity was issued for.
pub const DEFAULT_SERVER_NAME: &str = "datachannel.local";

// ============================================================================
// Runtime configuration
// ============================================================================

/// Peer-connection level options shared by all transports.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Configuration {
    pub max_message_size: Option<usize>,
}

impl Configuration {
    /// Configured message size limit, or [`DEFAULT_MAX_MESSAGE_SIZE`].
    pub fn max_message_size(&self) -> usize {
        self.max_message_size.unwrap_or(DEFAULT_MAX_MESSAGE_SIZE)
    }
}

/// Which side of the QUIC handshake this endpoint plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Client,
    Server,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Client => "client",
            Role::Server => "server",
        }
    }
}

/// QUIC engine settings.
#[derive(Clone)]
pub struct QuicSettings {
    pub role: Role,
    /// Concurrent streams the peer may open.
    pub max_streams_in: u64,
    /// Concurrent streams we expect to open.
    pub max_streams_out: u64,
    pub handshake_timeout: Duration,
    pub idle_timeout: Duration,
    pub ping_period: Duration,
    /// Accepted for compatibility; zero-length connection ids are not negotiated.
    pub support_tcid0: bool,
    /// Accepted for compatibility; no effect on the engine.
    pub support_nstp: bool,
    /// Accepted for compatibility; acknowledgement timing is left to the engine.
    pub delayed_acks: bool,
    pub server_name: String,
    /// Server certificate. Generated on demand when absent.
    pub identity: Option<Identity>,
    /// SHA-256 fingerprint (hex) the peer certificate must match.
    /// `None` accepts any certificate.
    pub remote_fingerprint: Option<String>,
}

impl QuicSettings {
    pub fn client() -> Self {
        Self {
            role: Role::Client,
            ..Self::default()
        }
    }

    pub fn server() -> Self {
        Self {
            role: Role::Server,
            ..Self::default()
        }
    }

    pub fn with_identity(mut self, identity: Identity) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn with_remote_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.remote_fingerprint = Some(fingerprint.into());
        self
    }
}

impl Default for QuicSettings {
    fn default() -> Self {
        Self {
            role: Role::Client,
            max_streams_in: DEFAULT_MAX_STREAMS,
            max_streams_out: DEFAULT_MAX_STREAMS,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            ping_period: DEFAULT_PING_PERIOD,
            support_tcid0: true,
            support_nstp: true,
            delayed_acks: true,
            server_name: DEFAULT_SERVER_NAME.to_string(),
            identity: None,
            remote_fingerprint: None,
        }
    }
}

impl std::fmt::Debug for QuicSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuicSettings")
            .field("role", &self.role)
            .field("max_streams_in", &self.max_streams_in)
            .field("max_streams_out", &self.max_streams_out)
            .field("handshake_timeout", &self.handshake_timeout)
            .field("idle_timeout", &self.idle_timeout)
            .field("ping_period", &self.ping_period)
            .field("server_name", &self.server_name)
            .field("identity", &self.identity.as_ref().map(|id| id.fingerprint()))
            .field("remote_fingerprint", &self.remote_fingerprint)
            .finish()
    }
}

// ============================================================================
// Configuration file
// ============================================================================

/// `[transport]` section.
#[derive(Deserialize, Default, Clone, Debug)]
pub struct TransportSection {
    /// Largest message a channel may send or receive, in bytes (default: 65536)
    pub max_message_size: Option<usize>,
}

/// `[quic]` section.
#[derive(Deserialize, Default, Clone, Debug)]
pub struct QuicSection {
    pub role: Option<Role>,
    /// Streams the peer may open (default: 100)
    pub max_streams_in: Option<u64>,
    /// Streams we may open (default: 100)
    pub max_streams_out: Option<u64>,
    pub handshake_timeout_secs: Option<u64>,
    pub idle_timeout_secs: Option<u64>,
    pub ping_period_secs: Option<u64>,
    pub support_tcid0: Option<bool>,
    pub support_nstp: Option<bool>,
    pub delayed_acks: Option<bool>,
    pub server_name: Option<String>,
    /// SHA-256 fingerprint of the peer certificate, hex with optional colons.
    pub remote_fingerprint: Option<String>,
}

/// Top-level TOML document.
#[derive(Deserialize, Default, Clone, Debug)]
pub struct ConfigFile {
    pub transport: Option<TransportSection>,
    pub quic: Option<QuicSection>,
}

fn validate_streams(value: u64, field: &str) -> Result<()> {
    if value == 0 || value > MAX_STREAMS_LIMIT {
        anyhow::bail!(
            "[quic] '{}' must be between 1 and {}, got {}",
            field,
            MAX_STREAMS_LIMIT,
            value
        );
    }
    Ok(())
}

fn validate_secs(value: u64, field: &str) -> Result<()> {
    if value == 0 {
        anyhow::bail!("[quic] '{}' must be greater than 0", field);
    }
    Ok(())
}

impl ConfigFile {
    /// Range-check every value that is present.
    pub fn validate(&self) -> Result<()> {
        if let Some(transport) = &self.transport {
            if let Some(size) = transport.max_message_size {
                if size == 0 || size > MAX_MESSAGE_SIZE_LIMIT {
                    anyhow::bail!(
                        "[transport] 'max_message_size' must be between 1 and {}, got {}",
                        MAX_MESSAGE_SIZE_LIMIT,
                        size
                    );
                }
            }
        }

        if let Some(quic) = &self.quic {
            if let Some(value) = quic.max_streams_in {
                validate_streams(value, "max_streams_in")?;
            }
            if let Some(value) = quic.max_streams_out {
                validate_streams(value, "max_streams_out")?;
            }
            if let Some(value) = quic.handshake_timeout_secs {
                validate_secs(value, "handshake_timeout_secs")?;
            }
            if let Some(value) = quic.idle_timeout_secs {
                validate_secs(value, "idle_timeout_secs")?;
            }
            if let Some(value) = quic.ping_period_secs {
                validate_secs(value, "ping_period_secs")?;
            }

            let idle = quic
                .idle_timeout_secs
                .unwrap_or(DEFAULT_IDLE_TIMEOUT.as_secs());
            let ping = quic.ping_period_secs.unwrap_or(DEFAULT_PING_PERIOD.as_secs());
            if ping >= idle {
                anyhow::bail!(
                    "[quic] 'ping_period_secs' ({}) must be less than 'idle_timeout_secs' ({})",
                    ping,
                    idle
                );
            }

            if let Some(name) = &quic.server_name {
                if name.trim().is_empty() {
                    anyhow::bail!("[quic] 'server_name' must not be empty");
                }
            }
            if let Some(fingerprint) = &quic.remote_fingerprint {
                normalize_fingerprint(fingerprint).with_context(|| {
                    format!(
                        "[quic] 'remote_fingerprint' '{}' is not a SHA-256 hex digest",
                        fingerprint
                    )
                })?;
            }
        }

        Ok(())
    }

    /// Validate, then build runtime values with defaults filled in.
    pub fn resolve(&self) -> Result<(Configuration, QuicSettings)> {
        self.validate()?;

        let config = Configuration {
            max_message_size: self
                .transport
                .as_ref()
                .and_then(|transport| transport.max_message_size),
        };

        let mut settings = QuicSettings::default();
        if let Some(quic) = &self.quic {
            if let Some(role) = quic.role {
                settings.role = role;
            }
            if let Some(value) = quic.max_streams_in {
                settings.max_streams_in = value;
            }
            if let Some(value) = quic.max_streams_out {
                settings.max_streams_out = value;
            }
            if let Some(secs) = quic.handshake_timeout_secs {
                settings.handshake_timeout = Duration::from_secs(secs);
            }
            if let Some(secs) = quic.idle_timeout_secs {
                settings.idle_timeout = Duration::from_secs(secs);
            }
            if let Some(secs) = quic.ping_period_secs {
                settings.ping_period = Duration::from_secs(secs);
            }
            if let Some(flag) = quic.support_tcid0 {
                settings.support_tcid0 = flag;
            }
            if let Some(flag) = quic.support_nstp {
                settings.support_nstp = flag;
            }
            if let Some(flag) = quic.delayed_acks {
                settings.delayed_acks = flag;
            }
            if let Some(name) = &quic.server_name {
                settings.server_name = name.trim().to_string();
            }
            settings.remote_fingerprint = quic
                .remote_fingerprint
                .as_deref()
                .and_then(normalize_fingerprint);
        }

        Ok((config, settings))
    }
}

// ============================================================================
// Path Expansion
// ============================================================================

/// Expand tilde (~) in paths to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();
    if let Some(stripped) = path_str.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    } else if path_str == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    path.to_path_buf()
}

// ============================================================================
// Config Loading
// ============================================================================

/// Resolve the default config path (~/.config/quic-datachannel/transport.toml).
pub fn default_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| {
        home.join(".config")
            .join("quic-datachannel")
            .join("transport.toml")
    })
}

fn read_config(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Load and validate a config file.
///
/// - `path`: Some(path) loads from the specified path (tilde-expanded)
/// - `path`: None loads from the default path (~/.config/quic-datachannel/transport.toml)
pub fn load_config(path: Option<&Path>) -> Result<ConfigFile> {
    let config_path = match path {
        Some(p) => expand_tilde(p),
        None => default_config_path()
            .ok_or_else(|| anyhow::anyhow!("Could not find default config path."))?,
    };
    let config = read_config(&config_path)?;
    config
        .validate()
        .with_context(|| format!("Invalid config file: {}", config_path.display()))?;
    Ok(config)
}
