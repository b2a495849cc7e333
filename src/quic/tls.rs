//! TLS identity and QUIC crypto configuration.
//!
//! Peers authenticate each other the way WebRTC does: certificates are
//! self-signed and the client pins the server certificate's SHA-256
//! fingerprint, exchanged out of band.

use crate::config::QuicSettings;
use crate::error::{TransportError, TransportResult};
use quinn_proto::crypto::rustls::{QuicClientConfig, QuicServerConfig};
use quinn_proto::{IdleTimeout, VarInt};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// ALPN identifiers offered and accepted on the data-channel connection.
pub const ALPN_PROTOCOLS: &[&[u8]] = &[b"webrtc-datachannel"];

/// Subject name used for generated certificates.
pub const DEFAULT_CERT_NAME: &str = "datachannel.local";

/// Default QUIC receive window size (2 MB).
const DEFAULT_RECEIVE_WINDOW: u32 = 2 * 1024 * 1024;

/// Default QUIC send window size (2 MB).
const DEFAULT_SEND_WINDOW: u32 = 2 * 1024 * 1024;

fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::aws_lc_rs::default_provider())
}

/// Lowercase hex SHA-256 digest of a DER certificate.
pub fn cert_fingerprint_hex(cert_der: &[u8]) -> String {
    let digest = Sha256::digest(cert_der);
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

/// Canonical form of a fingerprint: 64 lowercase hex digits.
///
/// Accepts the colon-separated form used in SDP (`AB:CD:...`).
pub fn normalize_fingerprint(value: &str) -> Option<String> {
    let hex: String = value
        .chars()
        .filter(|c| *c != ':' && !c.is_whitespace())
        .map(|c| c.to_ascii_lowercase())
        .collect();
    if hex.len() == 64 && hex.chars().all(|c| c.is_ascii_hexdigit()) {
        Some(hex)
    } else {
        None
    }
}

/// A certificate and its private key.
pub struct Identity {
    cert: CertificateDer<'static>,
    key: PrivatePkcs8KeyDer<'static>,
    fingerprint: String,
}

impl Identity {
    /// Generate a self-signed certificate for `names`.
    pub fn generate(names: Vec<String>) -> TransportResult<Self> {
        let rcgen::CertifiedKey { cert, key_pair } = rcgen::generate_simple_self_signed(names)
            .map_err(|e| {
                TransportError::Tls(format!("Failed to generate self-signed certificate: {}", e))
            })?;
        Ok(Self::from_der(
            cert.der().to_vec(),
            key_pair.serialize_der(),
        ))
    }

    /// Generate a certificate for [`DEFAULT_CERT_NAME`].
    pub fn generate_default() -> TransportResult<Self> {
        Self::generate(vec![DEFAULT_CERT_NAME.to_string()])
    }

    /// Wrap an existing DER certificate and PKCS#8 key.
    pub fn from_der(cert_der: Vec<u8>, pkcs8_key_der: Vec<u8>) -> Self {
        let fingerprint = cert_fingerprint_hex(&cert_der);
        Self {
            cert: CertificateDer::from(cert_der),
            key: PrivatePkcs8KeyDer::from(pkcs8_key_der),
            fingerprint,
        }
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn certificate_der(&self) -> &[u8] {
        self.cert.as_ref()
    }
}

impl Clone for Identity {
    fn clone(&self) -> Self {
        Self {
            cert: self.cert.clone(),
            key: self.key.clone_key(),
            fingerprint: self.fingerprint.clone(),
        }
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

/// Transport parameters shared by both roles.
pub fn transport_config(settings: &QuicSettings) -> TransportResult<quinn_proto::TransportConfig> {
    let mut transport = quinn_proto::TransportConfig::default();
    let idle = IdleTimeout::try_from(settings.idle_timeout).map_err(|_| {
        TransportError::Config(format!(
            "idle_timeout {:?} is out of range",
            settings.idle_timeout
        ))
    })?;
    transport.max_idle_timeout(Some(idle));
    transport.keep_alive_interval(Some(settings.ping_period));

    let incoming = VarInt::from_u64(settings.max_streams_in).map_err(|_| {
        TransportError::Config(format!(
            "max_streams_in {} is out of range",
            settings.max_streams_in
        ))
    })?;
    transport.max_concurrent_bidi_streams(incoming);
    // Data channels only use bidirectional streams.
    transport.max_concurrent_uni_streams(0_u8.into());

    transport.receive_window(VarInt::from_u32(DEFAULT_RECEIVE_WINDOW));
    transport.send_window(u64::from(DEFAULT_SEND_WINDOW));
    Ok(transport)
}

fn alpn_protocols() -> Vec<Vec<u8>> {
    ALPN_PROTOCOLS.iter().map(|p| p.to_vec()).collect()
}

/// Client-side QUIC config verifying the server against `remote_fingerprint`.
pub fn client_config(settings: &QuicSettings) -> TransportResult<quinn_proto::ClientConfig> {
    let verifier = PeerCertVerifier::new(settings.remote_fingerprint.as_deref())?;
    let mut tls = rustls::ClientConfig::builder_with_provider(crypto_provider())
        .with_protocol_versions(&[&rustls::version::TLS13])?
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_no_client_auth();
    tls.alpn_protocols = alpn_protocols();

    let quic = QuicClientConfig::try_from(tls)
        .map_err(|e| TransportError::Tls(format!("Failed to build QUIC client config: {}", e)))?;
    let mut client_config = quinn_proto::ClientConfig::new(Arc::new(quic));
    client_config.transport_config(Arc::new(transport_config(settings)?));
    Ok(client_config)
}

/// Server-side QUIC config presenting `identity`.
pub fn server_config(
    settings: &QuicSettings,
    identity: &Identity,
) -> TransportResult<quinn_proto::ServerConfig> {
    let mut tls = rustls::ServerConfig::builder_with_provider(crypto_provider())
        .with_protocol_versions(&[&rustls::version::TLS13])?
        .with_no_client_auth()
        .with_single_cert(
            vec![identity.cert.clone()],
            PrivateKeyDer::Pkcs8(identity.key.clone_key()),
        )?;
    tls.alpn_protocols = alpn_protocols();

    let quic = QuicServerConfig::try_from(tls)
        .map_err(|e| TransportError::Tls(format!("Failed to build QUIC server config: {}", e)))?;
    let mut server_config = quinn_proto::ServerConfig::with_crypto(Arc::new(quic));
    server_config.transport_config(Arc::new(transport_config(settings)?));
    Ok(server_config)
}

/// Checks the server certificate against a pinned fingerprint.
///
/// With no fingerprint configured every certificate is accepted; signatures
/// are still verified so the handshake proves possession of the key.
#[derive(Debug)]
struct PeerCertVerifier {
    expected: Option<String>,
    crypto: Arc<CryptoProvider>,
}

impl PeerCertVerifier {
    fn new(expected: Option<&str>) -> TransportResult<Arc<Self>> {
        let expected = match expected {
            Some(value) => Some(normalize_fingerprint(value).ok_or_else(|| {
                TransportError::Tls(format!("Invalid certificate fingerprint '{}'", value))
            })?),
            None => {
                log::warn!("No remote fingerprint configured, peer certificate is not verified");
                None
            }
        };
        Ok(Arc::new(Self {
            expected,
            crypto: crypto_provider(),
        }))
    }

    fn matches(&self, cert: &CertificateDer<'_>) -> bool {
        match &self.expected {
            Some(expected) => cert_fingerprint_hex(cert.as_ref()) == *expected,
            None => true,
        }
    }
}

impl rustls::client::danger::ServerCertVerifier for PeerCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp: &[u8],
        _now: UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        if !self.matches(end_entity) {
            log::warn!("Peer certificate fingerprint mismatch");
            return Err(rustls::Error::General(
                "certificate fingerprint mismatch".into(),
            ));
        }
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.crypto.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.crypto.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.crypto
            .signature_verification_algorithms
            .supported_schemes()
    }
}
