//! Custom TLS dialer.
//!
//! Composes one connection attempt: raw dial through a caller-supplied
//! dialer, optional obfuscator layering, a TLS handshake shaped by the
//! selected fingerprint profile, and certificate verification, all raced
//! against the caller's cancellation token. The dialer never retries;
//! candidate retry policy belongs to the iterator.

use std::io;
use std::net::IpAddr;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use parking_lot::Mutex;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::{ClientSessionMemoryCache, Resumption, WebPkiServerVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::obfuscation::{ObfuscatedStream, Obfuscator, ObfuscatorConfig, Seed};
use crate::params::Parameters;

use super::hello::ClientHelloSpec;
use super::profiles::{
    is_randomized_profile, is_tls13_profile, make_client_hello_spec, profile_uses_obfuscator,
    select_tls_profile, HelloInputs,
};
use super::ticket::{decode_ticket_key, new_obfuscated_session_state};
use super::DialError;

/// A byte stream usable under TLS.
pub trait TransportStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> TransportStream for T {}

/// The raw network dialer the TLS layer runs over. Swapping this out is how
/// fronted and proxied first hops plug in.
#[async_trait]
pub trait RawDialer: Send + Sync {
    async fn dial(&self, network: &str, addr: &str) -> io::Result<Box<dyn TransportStream>>;
}

/// Plain TCP dialer.
pub struct TcpDialer;

#[async_trait]
impl RawDialer for TcpDialer {
    async fn dial(&self, _network: &str, addr: &str) -> io::Result<Box<dyn TransportStream>> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true).ok();
        Ok(Box::new(stream))
    }
}

/// Obfuscator layering inputs for profiles that call for it.
#[derive(Clone)]
pub struct ObfuscationLayer {
    pub keyword: String,
    /// Padding seed; generated fresh (and reported on the returned
    /// connection) when absent.
    pub padding_seed: Option<Seed>,
    pub min_padding: Option<usize>,
    pub max_padding: Option<usize>,
}

/// Parameters determining the behavior of [`dial`].
pub struct CustomTlsConfig {
    /// Active parameters; a snapshot is taken per dial.
    pub params: Arc<Parameters>,
    /// Overrides the dial address passed to the raw dialer.
    pub dial_addr: Option<String>,
    /// Always present the dial host name in SNI.
    pub use_dial_addr_sni: bool,
    /// SNI to present when `use_dial_addr_sni` is unset. Ignored when a
    /// legacy certificate pin is configured. Empty omits SNI.
    pub sni_server_name: Option<String>,
    /// Disable certificate verification entirely.
    pub skip_verify: bool,
    /// Legacy pinned self-signed certificate: the server must present
    /// exactly this DER certificate. No chain, no SANs, no constraints.
    pub verify_legacy_certificate: Option<CertificateDer<'static>>,
    /// Pinned TLS profile; selected per-dial when absent. Pinning keeps a
    /// group of related dials consistent.
    pub tls_profile: Option<String>,
    /// Seed for randomized profiles; fresh when absent.
    pub randomized_hello_seed: Option<Seed>,
    /// PEM file of trusted root CAs; platform roots when absent.
    pub trusted_ca_certificates_file: Option<PathBuf>,
    /// Hex key enabling obfuscated session tickets.
    pub obfuscated_session_ticket_key: Option<String>,
    /// Obfuscator layering for non-TLS 1.3 profiles.
    pub obfuscation: Option<ObfuscationLayer>,

    session_store: Mutex<Option<Arc<ClientSessionMemoryCache>>>,
}

impl CustomTlsConfig {
    pub fn new(params: Arc<Parameters>) -> Self {
        CustomTlsConfig {
            params,
            dial_addr: None,
            use_dial_addr_sni: false,
            sni_server_name: None,
            skip_verify: false,
            verify_legacy_certificate: None,
            tls_profile: None,
            randomized_hello_seed: None,
            trusted_ca_certificates_file: None,
            obfuscated_session_ticket_key: None,
            obfuscation: None,
            session_store: Mutex::new(None),
        }
    }

    /// Pin the TLS profile now and prime the session cache, enabling
    /// resumption across multiple dials through this config.
    pub fn enable_client_session_cache(&mut self) {
        if self.tls_profile.is_none() {
            self.tls_profile = select_tls_profile(&self.params.get());
        }
        self.session_store();
    }

    fn session_store(&self) -> Arc<ClientSessionMemoryCache> {
        let mut guard = self.session_store.lock();
        guard
            .get_or_insert_with(|| Arc::new(ClientSessionMemoryCache::new(256)))
            .clone()
    }
}

/// An established, verified TLS connection.
pub struct TunnelConn {
    stream: TlsStream<Box<dyn TransportStream>>,
    tls_profile: String,
    hello_seed: Option<Seed>,
    sni_server_name: String,
    obfuscator_padding_seed: Option<Seed>,
    client_hello: ClientHelloSpec,
}

impl TunnelConn {
    /// The profile this connection dialed with.
    pub fn tls_profile(&self) -> &str {
        &self.tls_profile
    }

    /// The randomized hello seed used, for replay.
    pub fn hello_seed(&self) -> Option<&Seed> {
        self.hello_seed.as_ref()
    }

    /// The SNI actually presented; empty when SNI was omitted.
    pub fn sni_server_name(&self) -> &str {
        &self.sni_server_name
    }

    /// The obfuscator padding seed used, for replay.
    pub fn obfuscator_padding_seed(&self) -> Option<&Seed> {
        self.obfuscator_padding_seed.as_ref()
    }

    /// JA3 hash of the profile's hello image.
    pub fn ja3_hash(&self) -> String {
        self.client_hello.ja3_hash()
    }

    /// The peer's certificate chain.
    pub fn peer_certificates(&self) -> Vec<CertificateDer<'static>> {
        self.stream
            .get_ref()
            .1
            .peer_certificates()
            .map(|certs| certs.iter().map(|cert| cert.clone().into_owned()).collect())
            .unwrap_or_default()
    }

    /// True iff ALPN negotiated "h2" with the peer.
    pub fn is_http2(&self) -> bool {
        self.stream.get_ref().1.alpn_protocol() == Some(b"h2".as_slice())
    }

    pub async fn close(mut self) -> io::Result<()> {
        self.stream.shutdown().await
    }
}

impl AsyncRead for TunnelConn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for TunnelConn {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

/// Dial `addr` and establish a verified TLS connection per `config`.
///
/// Cancellation via `token` aborts the attempt wherever it is (raw dial,
/// obfuscator send, or TLS handshake), closing the connection in progress;
/// no work outlives the return. Every failure closes the raw connection.
/// The dialer itself never retries.
pub async fn dial(
    token: &CancellationToken,
    network: &str,
    addr: &str,
    config: &CustomTlsConfig,
    raw_dialer: &dyn RawDialer,
) -> Result<TunnelConn, DialError> {
    tokio::select! {
        result = dial_inner(network, addr, config, raw_dialer) => result,
        // Dropping the dial future tears down any connection it owns.
        _ = token.cancelled() => Err(DialError::Canceled),
    }
}

async fn dial_inner(
    network: &str,
    addr: &str,
    config: &CustomTlsConfig,
    raw_dialer: &dyn RawDialer,
) -> Result<TunnelConn, DialError> {
    let snapshot = config.params.get();

    let dial_addr = config.dial_addr.clone().unwrap_or_else(|| addr.to_string());
    let (hostname, _port) = split_host_port(&dial_addr)?;

    let tls_profile = match &config.tls_profile {
        Some(profile) => profile.clone(),
        None => select_tls_profile(&snapshot)
            .ok_or_else(|| DialError::Config("no TLS profile available".to_string()))?,
    };

    let mut hello_seed = config.randomized_hello_seed;
    if is_randomized_profile(&tls_profile) && hello_seed.is_none() {
        hello_seed = Some(
            Seed::new().map_err(|err| DialError::Config(err.to_string()))?,
        );
    }

    let sni = decide_sni(config, &hostname);

    // Obfuscated session tickets fabricate a TLS 1.2 session, so they only
    // attach on pre-1.3 profiles; a ticket claiming 1.2 inside a 1.3
    // negotiation would contradict the handshake. The 1.3 path encrypts
    // the server certificate on its own.
    let session_ticket = match &config.obfuscated_session_ticket_key {
        Some(hex_key) if !hex_key.is_empty() && !is_tls13_profile(&tls_profile) => {
            let key = decode_ticket_key(hex_key)?;
            Some(new_obfuscated_session_state(&key)?.session_ticket)
        }
        _ => None,
    };

    let mut hello_random = [0u8; 32];
    ring::rand::SecureRandom::fill(&ring::rand::SystemRandom::new(), &mut hello_random)
        .map_err(|_| DialError::Config("entropy source failed".to_string()))?;

    let client_hello = make_client_hello_spec(
        &tls_profile,
        &HelloInputs {
            server_name: sni.server_name.as_deref(),
            session_ticket,
            random: &hello_random,
            hello_seed: hello_seed.as_ref(),
        },
    )
    .ok_or_else(|| DialError::Config(format!("unknown TLS profile: {tls_profile}")))?;

    debug!(
        profile = tls_profile.as_str(),
        ja3 = client_hello.ja3_hash().as_str(),
        "assembled client hello"
    );

    let root_store = load_root_store(config)?;
    let tls_config = build_rustls_config(config, &tls_profile, &client_hello, &sni, &root_store)?;

    let raw_conn = raw_dialer
        .dial(network, &dial_addr)
        .await
        .map_err(DialError::Transport)?;

    // Layer the obfuscator for profile classes that require it. TLS 1.3
    // encrypts enough of the exchange on its own.
    let mut obfuscator_padding_seed = None;
    let stream: Box<dyn TransportStream> = match &config.obfuscation {
        Some(layer) if profile_uses_obfuscator(&tls_profile) => {
            let padding_seed = match layer.padding_seed {
                Some(seed) => seed,
                None => Seed::new().map_err(|err| DialError::Config(err.to_string()))?,
            };
            obfuscator_padding_seed = Some(padding_seed);
            let obfuscator_config =
                ObfuscatorConfig::new(&layer.keyword, layer.min_padding, layer.max_padding)
                    .map_err(|err| DialError::Config(err.to_string()))?
                    .with_padding_seed(padding_seed);
            let obfuscator = Obfuscator::new_client(&obfuscator_config)
                .map_err(|err| DialError::Config(err.to_string()))?;
            Box::new(ObfuscatedStream::new(raw_conn, obfuscator))
        }
        _ => raw_conn,
    };

    let connector = TlsConnector::from(Arc::new(tls_config));
    let server_name = connect_server_name(&sni, &hostname)?;
    let tls_stream = connector
        .connect(server_name, stream)
        .await
        .map_err(map_handshake_error)?;

    // Verification was deferred when SNI was omitted or a legacy pin is in
    // play; enforce it now, before the connection is handed out.
    if !config.skip_verify && sni.verify_after_handshake {
        let certificates: Vec<CertificateDer<'static>> = tls_stream
            .get_ref()
            .1
            .peer_certificates()
            .map(|certs| certs.iter().map(|cert| cert.clone().into_owned()).collect())
            .unwrap_or_default();

        if let Some(pinned) = &config.verify_legacy_certificate {
            verify_legacy_certificate(&certificates, pinned)?;
        } else {
            verify_server_certificates(&certificates, &hostname, &root_store)?;
        }
    }

    Ok(TunnelConn {
        stream: tls_stream,
        tls_profile,
        hello_seed,
        sni_server_name: sni.server_name.clone().unwrap_or_default(),
        obfuscator_padding_seed,
        client_hello,
    })
}

/// Outcome of the SNI precedence rules.
#[derive(Debug, PartialEq)]
struct SniDecision {
    /// SNI to present; `None` omits it.
    server_name: Option<String>,
    /// Disable rustls's built-in verification for this dial.
    rustls_insecure: bool,
    /// Run manual verification once the handshake completes.
    verify_after_handshake: bool,
}

fn decide_sni(config: &CustomTlsConfig, hostname: &str) -> SniDecision {
    if config.use_dial_addr_sni {
        return SniDecision {
            server_name: Some(hostname.to_string()),
            rustls_insecure: config.skip_verify,
            verify_after_handshake: false,
        };
    }
    match &config.sni_server_name {
        Some(sni) if !sni.is_empty() && config.verify_legacy_certificate.is_none() => {
            SniDecision {
                server_name: Some(sni.clone()),
                rustls_insecure: config.skip_verify,
                verify_after_handshake: false,
            }
        }
        _ => {
            // No SNI. The library cannot verify without a reference name, so
            // verification runs manually after the handshake.
            SniDecision {
                server_name: None,
                rustls_insecure: true,
                verify_after_handshake: !config.skip_verify,
            }
        }
    }
}

fn split_host_port(addr: &str) -> Result<(String, u16), DialError> {
    let (host, port) = if let Some(rest) = addr.strip_prefix('[') {
        // Bracketed IPv6 literal.
        let (host, port) = rest
            .split_once("]:")
            .ok_or_else(|| DialError::Config(format!("invalid address: {addr}")))?;
        (host.to_string(), port)
    } else {
        let (host, port) = addr
            .rsplit_once(':')
            .ok_or_else(|| DialError::Config(format!("invalid address: {addr}")))?;
        (host.to_string(), port)
    };
    let port: u16 = port
        .parse()
        .map_err(|_| DialError::Config(format!("invalid port in address: {addr}")))?;
    Ok((host, port))
}

fn load_root_store(config: &CustomTlsConfig) -> Result<Arc<RootCertStore>, DialError> {
    let mut roots = RootCertStore::empty();
    match &config.trusted_ca_certificates_file {
        Some(path) if !config.skip_verify && config.verify_legacy_certificate.is_none() => {
            let file = std::fs::File::open(path).map_err(|err| {
                DialError::Config(format!("cannot open trusted CA file: {err}"))
            })?;
            let mut reader = std::io::BufReader::new(file);
            for cert in rustls_pemfile::certs(&mut reader) {
                let cert =
                    cert.map_err(|err| DialError::Config(format!("invalid CA PEM: {err}")))?;
                roots
                    .add(cert)
                    .map_err(|err| DialError::Config(format!("invalid CA certificate: {err}")))?;
            }
        }
        _ => {
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        }
    }
    Ok(Arc::new(roots))
}

fn build_rustls_config(
    config: &CustomTlsConfig,
    tls_profile: &str,
    client_hello: &ClientHelloSpec,
    sni: &SniDecision,
    root_store: &Arc<RootCertStore>,
) -> Result<ClientConfig, DialError> {
    let provider = CryptoProvider {
        cipher_suites: rustls_cipher_suites(tls_profile),
        ..rustls::crypto::ring::default_provider()
    };

    let versions: &[&rustls::SupportedProtocolVersion] = if is_tls13_profile(tls_profile) {
        &[&rustls::version::TLS13]
    } else {
        &[&rustls::version::TLS12]
    };

    let builder = ClientConfig::builder_with_provider(Arc::new(provider))
        .with_protocol_versions(versions)
        .map_err(|err| DialError::Config(err.to_string()))?;

    let mut tls_config = if sni.rustls_insecure {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NullVerifier))
            .with_no_client_auth()
    } else {
        builder
            .with_root_certificates(root_store.clone())
            .with_no_client_auth()
    };

    if let Some(protocols) = client_hello.alpn_protocols() {
        tls_config.alpn_protocols = protocols
            .iter()
            .map(|protocol| protocol.as_bytes().to_vec())
            .collect();
    }

    // Session cache created if absent; resumption makes the exchange look
    // like repeat browser traffic.
    tls_config.resumption = Resumption::store(config.session_store());

    Ok(tls_config)
}

fn rustls_cipher_suites(tls_profile: &str) -> Vec<rustls::SupportedCipherSuite> {
    use rustls::crypto::ring::cipher_suite as suite;
    use super::profiles::*;

    if is_tls13_profile(tls_profile) {
        return vec![
            suite::TLS13_AES_128_GCM_SHA256,
            suite::TLS13_AES_256_GCM_SHA384,
            suite::TLS13_CHACHA20_POLY1305_SHA256,
        ];
    }

    match tls_profile {
        TLS_PROFILE_FIREFOX_55 | TLS_PROFILE_FIREFOX_56 => vec![
            suite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
            suite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
            suite::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
            suite::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
            suite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
            suite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
        ],
        TLS_PROFILE_IOS_SAFARI_11 => vec![
            suite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
            suite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
            suite::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
            suite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
            suite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
            suite::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
        ],
        // Chrome, Android, and randomized profiles share Chrome's AEAD
        // preference order; rustls cannot express the rest of the list.
        _ => vec![
            suite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
            suite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
            suite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
            suite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
            suite::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
            suite::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
        ],
    }
}

fn connect_server_name(
    sni: &SniDecision,
    hostname: &str,
) -> Result<ServerName<'static>, DialError> {
    match &sni.server_name {
        Some(name) => ServerName::try_from(name.clone())
            .map_err(|err| DialError::Config(format!("invalid SNI: {err}"))),
        None => {
            // No SNI: dial hosts are IP literals, for which the library
            // omits server_name on its own.
            match hostname.parse::<IpAddr>() {
                Ok(ip) => Ok(ServerName::IpAddress(ip.into())),
                Err(_) => ServerName::try_from(hostname.to_string())
                    .map_err(|err| DialError::Config(format!("invalid host: {err}"))),
            }
        }
    }
}

fn map_handshake_error(err: io::Error) -> DialError {
    let is_tls_error = err
        .get_ref()
        .map(|inner| inner.is::<rustls::Error>())
        .unwrap_or(false);
    if is_tls_error {
        DialError::HandshakeRejected(err.to_string())
    } else {
        DialError::Transport(err)
    }
}

fn verify_legacy_certificate(
    certificates: &[CertificateDer<'static>],
    expected: &CertificateDer<'static>,
) -> Result<(), DialError> {
    let Some(presented) = certificates.first() else {
        return Err(DialError::UntrustedPeer("no certificate to verify".to_string()));
    };
    if presented.as_ref() != expected.as_ref() {
        return Err(DialError::UntrustedPeer("unexpected certificate".to_string()));
    }
    Ok(())
}

fn verify_server_certificates(
    certificates: &[CertificateDer<'static>],
    hostname: &str,
    root_store: &Arc<RootCertStore>,
) -> Result<(), DialError> {
    let Some((end_entity, intermediates)) = certificates.split_first() else {
        return Err(DialError::UntrustedPeer("no certificate to verify".to_string()));
    };

    let verifier = WebPkiServerVerifier::builder(root_store.clone())
        .build()
        .map_err(|err| DialError::Config(err.to_string()))?;

    let server_name = ServerName::try_from(hostname.to_string())
        .map_err(|err| DialError::UntrustedPeer(format!("invalid verification host: {err}")))?;

    verifier
        .verify_server_cert(
            end_entity,
            intermediates,
            &server_name,
            &[],
            UnixTime::now(),
        )
        .map_err(|err| DialError::UntrustedPeer(err.to_string()))?;
    Ok(())
}

/// Accepts any server certificate. Used when verification is disabled or
/// deferred to the post-handshake checks.
#[derive(Debug)]
struct NullVerifier;

impl ServerCertVerifier for NullVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::RSA_PKCS1_SHA1,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> CustomTlsConfig {
        CustomTlsConfig::new(Arc::new(Parameters::new()))
    }

    #[test]
    fn test_split_host_port() {
        assert_eq!(
            split_host_port("192.0.2.1:443").unwrap(),
            ("192.0.2.1".to_string(), 443)
        );
        assert_eq!(
            split_host_port("[2001:db8::1]:8443").unwrap(),
            ("2001:db8::1".to_string(), 8443)
        );
        assert!(split_host_port("no-port").is_err());
        assert!(split_host_port("host:badport").is_err());
    }

    #[test]
    fn test_sni_precedence_dial_addr_wins() {
        let mut cfg = config();
        cfg.use_dial_addr_sni = true;
        cfg.sni_server_name = Some("decoy.example.org".to_string());
        let decision = decide_sni(&cfg, "192.0.2.1");
        assert_eq!(decision.server_name.as_deref(), Some("192.0.2.1"));
        assert!(!decision.verify_after_handshake);
    }

    #[test]
    fn test_sni_precedence_configured_sni() {
        let mut cfg = config();
        cfg.sni_server_name = Some("decoy.example.org".to_string());
        let decision = decide_sni(&cfg, "192.0.2.1");
        assert_eq!(decision.server_name.as_deref(), Some("decoy.example.org"));
        assert!(!decision.rustls_insecure);
        assert!(!decision.verify_after_handshake);
    }

    #[test]
    fn test_sni_omitted_defers_verification() {
        let cfg = config();
        let decision = decide_sni(&cfg, "192.0.2.1");
        assert_eq!(decision.server_name, None);
        assert!(decision.rustls_insecure);
        assert!(decision.verify_after_handshake);
    }

    #[test]
    fn test_legacy_pin_suppresses_configured_sni() {
        let mut cfg = config();
        cfg.sni_server_name = Some("decoy.example.org".to_string());
        cfg.verify_legacy_certificate =
            Some(CertificateDer::from(vec![0x30, 0x82, 0x01, 0x00]));
        let decision = decide_sni(&cfg, "192.0.2.1");
        assert_eq!(decision.server_name, None);
        assert!(decision.verify_after_handshake);
    }

    #[test]
    fn test_skip_verify_skips_deferred_check() {
        let mut cfg = config();
        cfg.skip_verify = true;
        let decision = decide_sni(&cfg, "192.0.2.1");
        assert!(decision.rustls_insecure);
        assert!(!decision.verify_after_handshake);
    }

    #[test]
    fn test_legacy_certificate_byte_equality() {
        let pinned = CertificateDer::from(vec![1u8, 2, 3, 4]);
        let matching = vec![CertificateDer::from(vec![1u8, 2, 3, 4])];
        let mismatched = vec![CertificateDer::from(vec![1u8, 2, 3, 5])];

        assert!(verify_legacy_certificate(&matching, &pinned).is_ok());
        assert!(matches!(
            verify_legacy_certificate(&mismatched, &pinned),
            Err(DialError::UntrustedPeer(_))
        ));
        assert!(matches!(
            verify_legacy_certificate(&[], &pinned),
            Err(DialError::UntrustedPeer(_))
        ));
    }

    #[test]
    fn test_session_store_created_once() {
        let cfg = config();
        let a = cfg.session_store();
        let b = cfg.session_store();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn test_dial_canceled_before_start() {
        let cfg = config();
        let token = CancellationToken::new();
        token.cancel();
        let result = dial(&token, "tcp", "192.0.2.1:443", &cfg, &TcpDialer).await;
        assert!(matches!(result, Err(DialError::Canceled)));
    }

    #[tokio::test]
    async fn test_randomized_seed_generated_when_absent() {
        // A randomized profile dial against an unreachable address still
        // exercises seed generation before the transport error surfaces.
        let mut cfg = config();
        cfg.tls_profile = Some(super::super::profiles::TLS_PROFILE_RANDOMIZED.to_string());
        assert!(cfg.randomized_hello_seed.is_none());

        struct FailingDialer;
        #[async_trait]
        impl RawDialer for FailingDialer {
            async fn dial(
                &self,
                _network: &str,
                _addr: &str,
            ) -> io::Result<Box<dyn TransportStream>> {
                Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"))
            }
        }

        let token = CancellationToken::new();
        let result = dial(&token, "tcp", "192.0.2.1:443", &cfg, &FailingDialer).await;
        assert!(matches!(result, Err(DialError::Transport(_))));
    }
}
