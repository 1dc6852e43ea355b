//! Byte-stream transport: TCP, optionally wrapped in TLS.
//!
//! A [`Transport`] starts as plain TCP (STARTTLS endpoints) or TLS (direct
//! TLS endpoints). STARTTLS consumes the plain transport and returns the
//! upgraded one, so a half-upgraded socket is never observable.

pub mod dns;

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::{error, info, warn};

use crate::error::XmppError;
pub use dns::{ConnectionMode, Endpoint};

/// Install the ring crypto provider as process default (once).
fn init_crypto_provider() {
    use std::sync::Once;
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// TLS certificate verifier that accepts all certificates without validation.
///
/// **DANGEROUS**: only used when `dangerous_insecure_tls` is configured, for
/// test servers with self-signed certificates.
#[derive(Debug)]
struct InsecureCertVerifier(Arc<rustls::crypto::CryptoProvider>);

impl rustls::client::danger::ServerCertVerifier for InsecureCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

/// Create a TLS connector trusting the system's native root certificates, or
/// trusting everything when `insecure` is set.
pub fn create_tls_connector(insecure: bool) -> Result<TlsConnector, XmppError> {
    init_crypto_provider();
    if insecure {
        warn!("TLS certificate verification DISABLED (dangerous_insecure_tls)");
        let provider = rustls::crypto::ring::default_provider();
        let config = ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(InsecureCertVerifier(Arc::new(provider))))
            .with_no_client_auth();
        return Ok(TlsConnector::from(Arc::new(config)));
    }

    let mut root_store = RootCertStore::empty();
    let native_certs = rustls_native_certs::load_native_certs();
    if native_certs.certs.is_empty() {
        return Err(XmppError::Tls(
            "No system root certificates found. Ensure CA certificates are installed \
            (e.g., ca-certificates package on Linux)."
                .to_string(),
        ));
    }
    for cert in native_certs.certs {
        root_store
            .add(cert)
            .map_err(|e| XmppError::Tls(format!("Failed to add cert: {e}")))?;
    }

    let config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(config)))
}

pub enum Transport {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl Transport {
    pub fn is_secure(&self) -> bool {
        matches!(self, Transport::Tls(_))
    }

    /// Run the TLS handshake over a plain transport, using `tls_name` for SNI
    /// and certificate verification.
    pub async fn upgrade_to_tls(self, tls_name: &str, insecure: bool) -> Result<Transport, XmppError> {
        let tcp = match self {
            Transport::Plain(tcp) => tcp,
            Transport::Tls(_) => return Err(XmppError::Tls("stream is already encrypted".to_string())),
        };
        let connector = create_tls_connector(insecure)?;
        let server_name = ServerName::try_from(tls_name.to_string())
            .map_err(|e| XmppError::Tls(format!("Invalid server name {tls_name}: {e}")))?;

        let tls = connector.connect(server_name, tcp).await.map_err(|e| {
            let detail = e.to_string();
            let classification = if detail.contains("ertificate") {
                "certificate_error"
            } else if detail.contains("refused") || detail.contains("reset") {
                "connection_refused"
            } else {
                "other"
            };
            error!(host = tls_name, error = %e, error_class = classification, "TLS handshake failed");
            XmppError::Tls(format!(
                "TLS handshake failed with {tls_name} ({classification}): {e}"
            ))
        })?;
        Ok(Transport::Tls(Box::new(tls)))
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transport::Plain(tcp) => f.debug_tuple("Plain").field(&tcp.peer_addr().ok()).finish(),
            Transport::Tls(tls) => f
                .debug_tuple("Tls")
                .field(&tls.get_ref().0.peer_addr().ok())
                .finish(),
        }
    }
}

impl AsyncRead for Transport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(tcp) => Pin::new(tcp).poll_read(cx, buf),
            Transport::Tls(tls) => Pin::new(tls.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Transport::Plain(tcp) => Pin::new(tcp).poll_write(cx, buf),
            Transport::Tls(tls) => Pin::new(tls.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(tcp) => Pin::new(tcp).poll_flush(cx),
            Transport::Tls(tls) => Pin::new(tls.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(tcp) => Pin::new(tcp).poll_shutdown(cx),
            Transport::Tls(tls) => Pin::new(tls.as_mut()).poll_shutdown(cx),
        }
    }
}

async fn connect_endpoint(
    endpoint: &Endpoint,
    connect_timeout: Duration,
    insecure: bool,
) -> Result<Transport, XmppError> {
    let mode = match endpoint.mode {
        ConnectionMode::StartTls => "starttls",
        ConnectionMode::DirectTls => "direct_tls",
    };
    let tcp = tokio::time::timeout(
        connect_timeout,
        TcpStream::connect((endpoint.host.as_str(), endpoint.port)),
    )
    .await
    .map_err(|_| {
        error!(
            host = %endpoint.host, port = endpoint.port, mode,
            timeout_secs = connect_timeout.as_secs(),
            "TCP connect timed out"
        );
        XmppError::ConnectTimeout {
            host: endpoint.host.clone(),
            port: endpoint.port,
            timeout: connect_timeout,
        }
    })?
    .map_err(|e| {
        error!(
            host = %endpoint.host, port = endpoint.port, mode,
            error = %e, error_kind = ?e.kind(),
            "TCP connect failed"
        );
        XmppError::Io(e)
    })?;
    // Stanzas are small and latency-sensitive
    if let Err(e) = tcp.set_nodelay(true) {
        warn!(error = %e, "Failed to set TCP_NODELAY");
    }

    match endpoint.mode {
        ConnectionMode::StartTls => {
            info!(host = %endpoint.host, port = endpoint.port, "Connected (TCP)");
            Ok(Transport::Plain(tcp))
        }
        ConnectionMode::DirectTls => {
            // SNI uses the XMPP domain, not the SRV target host
            let transport = Transport::Plain(tcp)
                .upgrade_to_tls(endpoint.tls_name(), insecure)
                .await?;
            info!(host = %endpoint.host, port = endpoint.port,
                tls_name = endpoint.tls_name(), "Connected (direct TLS)");
            Ok(transport)
        }
    }
}

/// Connect to the first reachable endpoint, in order.
pub async fn connect(
    endpoints: &[Endpoint],
    connect_timeout: Duration,
    insecure: bool,
) -> Result<(Transport, Endpoint), XmppError> {
    let started = Instant::now();
    let mut last_error = XmppError::Resolve("no endpoint to connect to".to_string());
    for (index, endpoint) in endpoints.iter().enumerate() {
        match connect_endpoint(endpoint, connect_timeout, insecure).await {
            Ok(transport) => {
                info!(
                    host = %endpoint.host,
                    port = endpoint.port,
                    attempt = index + 1,
                    connect_ms = started.elapsed().as_millis() as u64,
                    "Transport established"
                );
                return Ok((transport, endpoint.clone()));
            }
            Err(e) => {
                if index + 1 < endpoints.len() {
                    warn!(host = %endpoint.host, port = endpoint.port, error = %e,
                        "Endpoint failed, trying next");
                }
                last_error = e;
            }
        }
    }
    Err(last_error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn endpoint(port: u16) -> Endpoint {
        Endpoint {
            host: "127.0.0.1".to_string(),
            port,
            mode: ConnectionMode::StartTls,
            domain: Some("example.com".to_string()),
        }
    }

    #[test]
    fn test_create_insecure_tls_connector() {
        assert!(create_tls_connector(true).is_ok());
    }

    #[tokio::test]
    async fn test_connect_falls_through_to_next_endpoint() {
        // Reserve a port and close it so the first endpoint refuses
        let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let closed_port = closed.local_addr().unwrap().port();
        drop(closed);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let open_port = listener.local_addr().unwrap().port();

        let (transport, used) = connect(
            &[endpoint(closed_port), endpoint(open_port)],
            Duration::from_secs(5),
            false,
        )
        .await
        .unwrap();
        assert_eq!(used.port, open_port);
        assert!(!transport.is_secure());
    }

    #[tokio::test]
    async fn test_connect_reports_last_error() {
        let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = closed.local_addr().unwrap().port();
        drop(closed);
        let err = connect(&[endpoint(port)], Duration::from_secs(5), false)
            .await
            .unwrap_err();
        assert!(matches!(err, XmppError::Io(_)));
        assert!(err.allows_reconnect());
    }

    #[tokio::test]
    async fn test_connect_without_endpoints() {
        let err = connect(&[], Duration::from_secs(1), false).await.unwrap_err();
        assert!(matches!(err, XmppError::Resolve(_)));
    }
}
