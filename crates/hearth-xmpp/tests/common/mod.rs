//! Test utilities for stream server integration tests.
//!
//! Provides helpers for starting test servers on ephemeral ports, generating
//! TLS certificates, and driving raw stream connections.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use hearth_xmpp::{
    ConnectionRegistry, KarmaConfig, RateLimitConfig, RegistryBuilder, Router, RouterConfig,
    XmppServer, XmppServerConfig,
};
use rcgen::{generate_simple_self_signed, CertifiedKey};
use rustls::pki_types::CertificateDer;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::{
    rustls::{ClientConfig, RootCertStore},
    TlsConnector,
};
use tokio_util::sync::CancellationToken;

/// Default timeout for test operations.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Install the ring crypto provider for rustls.
/// Must be called once before any TLS operations.
pub fn install_crypto_provider() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        rustls::crypto::ring::default_provider()
            .install_default()
            .expect("Failed to install crypto provider");
    });
}

/// Initialize tracing and crypto provider for tests (only once).
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        install_crypto_provider();

        let _ = tracing_subscriber::fmt()
            .with_env_filter("debug")
            .with_test_writer()
            .try_init();
    });
}

/// Client stream header for domain `to`, optionally claiming `from`.
pub fn stream_header(to: &str, from: Option<&str>) -> String {
    let from = from
        .map(|f| format!(" from='{}'", f))
        .unwrap_or_default();
    format!(
        "<?xml version='1.0'?>\
        <stream:stream \
        xmlns='jabber:client' \
        xmlns:stream='http://etherx.jabber.org/streams' \
        to='{}'{} \
        version='1.0'>",
        to, from
    )
}

/// Generated TLS credentials for testing.
pub struct TestTlsCredentials {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub cert_der: CertificateDer<'static>,
    _dir: tempfile::TempDir,
}

impl TestTlsCredentials {
    /// Generate self-signed credentials and write them as PEM files.
    pub fn generate(domain: &str) -> Self {
        let subject_alt_names = vec![domain.to_string(), "localhost".to_string()];
        let CertifiedKey { cert, key_pair } = generate_simple_self_signed(subject_alt_names)
            .expect("Failed to generate test certificate");

        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let cert_path = dir.path().join("server.crt");
        let key_path = dir.path().join("server.key");
        std::fs::write(&cert_path, cert.pem()).expect("Failed to write cert");
        std::fs::write(&key_path, key_pair.serialize_pem()).expect("Failed to write key");

        Self {
            cert_path,
            key_path,
            cert_der: CertificateDer::from(cert.der().to_vec()),
            _dir: dir,
        }
    }

    /// Create a TLS connector (client-side) that trusts this certificate.
    pub fn tls_connector(&self) -> TlsConnector {
        let mut root_store = RootCertStore::empty();
        root_store.add(self.cert_der.clone()).expect("Failed to add cert");

        let client_config = ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        TlsConnector::from(Arc::new(client_config))
    }
}

/// Options for [`TestServer::start_with`].
pub struct TestServerOptions {
    pub domain: String,
    pub karma: KarmaConfig,
    pub rate: RateLimitConfig,
    pub tls: bool,
}

impl Default for TestServerOptions {
    fn default() -> Self {
        Self {
            domain: "localhost".to_string(),
            karma: KarmaConfig::default(),
            // Tests open many connections from one address.
            rate: RateLimitConfig {
                max_points: 1000,
                window: Duration::from_secs(1),
            },
            tls: false,
        }
    }
}

/// Test server handle. The server stops when this is dropped.
pub struct TestServer {
    pub addr: SocketAddr,
    pub tls_addr: Option<SocketAddr>,
    pub domain: String,
    pub router: Arc<Router>,
    pub registry: Arc<ConnectionRegistry>,
    pub tls_credentials: Option<TestTlsCredentials>,
    shutdown: CancellationToken,
}

impl TestServer {
    /// Start a server whose instances are set up by `build`.
    pub async fn start<F>(build: F) -> Self
    where
        F: FnOnce(&mut RegistryBuilder, &Arc<ConnectionRegistry>),
    {
        Self::start_with(TestServerOptions::default(), build).await
    }

    /// Start a server with custom options.
    ///
    /// The routing registry is published after binding so handlers can
    /// reach the server's connection registry.
    pub async fn start_with<F>(options: TestServerOptions, build: F) -> Self
    where
        F: FnOnce(&mut RegistryBuilder, &Arc<ConnectionRegistry>),
    {
        init_tracing();

        let tls_credentials = options
            .tls
            .then(|| TestTlsCredentials::generate(&options.domain));

        let config = XmppServerConfig {
            c2s_addr: "127.0.0.1:0".parse().unwrap(),
            tls_addr: tls_credentials
                .as_ref()
                .map(|_| "127.0.0.1:0".parse().unwrap()),
            tls_cert_path: tls_credentials.as_ref().map(|c| c.cert_path.clone()),
            tls_key_path: tls_credentials.as_ref().map(|c| c.key_path.clone()),
            domain: options.domain.clone(),
            karma: options.karma,
            rate: options.rate,
            ..Default::default()
        };

        let router = Arc::new(Router::new(
            RouterConfig {
                default_domain: options.domain.clone(),
            },
            Default::default(),
        ));

        let server = XmppServer::bind(config, Arc::clone(&router))
            .await
            .expect("Failed to bind test server");

        let registry = Arc::clone(server.connection_registry());
        let mut builder = RegistryBuilder::default();
        build(&mut builder, &registry);
        router.publish(builder.build().expect("Invalid test registry"));

        let addr = server.local_addr().expect("Failed to get local addr");
        let tls_addr = server.tls_local_addr();
        let shutdown = server.shutdown_token();

        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                tracing::error!(error = %e, "Test server failed");
            }
        });

        Self {
            addr,
            tls_addr,
            domain: options.domain,
            router,
            registry,
            tls_credentials,
            shutdown,
        }
    }

    /// Stop accepting and close every stream.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// A simple client that operates directly on streams for precise control.
pub struct RawXmppClient {
    tcp: Option<TcpStream>,
    tls: Option<tokio_rustls::client::TlsStream<TcpStream>>,
    buffer: String,
}

impl RawXmppClient {
    /// Connect to a server.
    pub async fn connect(addr: SocketAddr) -> std::io::Result<Self> {
        let tcp = TcpStream::connect(addr).await?;
        Ok(Self {
            tcp: Some(tcp),
            tls: None,
            buffer: String::new(),
        })
    }

    /// Connect to a direct-TLS listener.
    pub async fn connect_tls(
        addr: SocketAddr,
        connector: TlsConnector,
        domain: &str,
    ) -> std::io::Result<Self> {
        let tcp = TcpStream::connect(addr).await?;
        let server_name: rustls::pki_types::ServerName<'static> =
            domain.to_string().try_into().map_err(|_| {
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "Invalid server name")
            })?;
        let tls = connector.connect(server_name, tcp).await?;
        Ok(Self {
            tcp: None,
            tls: Some(tls),
            buffer: String::new(),
        })
    }

    /// Send raw data.
    pub async fn send(&mut self, data: &str) -> std::io::Result<()> {
        if let Some(ref mut tls) = self.tls {
            tls.write_all(data.as_bytes()).await?;
            tls.flush().await?;
        } else if let Some(ref mut tcp) = self.tcp {
            tcp.write_all(data.as_bytes()).await?;
            tcp.flush().await?;
        }
        Ok(())
    }

    /// Read with timeout. Returns an empty string at end of stream.
    pub async fn read(&mut self, timeout_dur: Duration) -> std::io::Result<String> {
        let mut buf = [0u8; 4096];
        let n = timeout(timeout_dur, async {
            if let Some(ref mut tls) = self.tls {
                tls.read(&mut buf).await
            } else if let Some(ref mut tcp) = self.tcp {
                tcp.read(&mut buf).await
            } else {
                Err(std::io::Error::new(std::io::ErrorKind::NotConnected, "Not connected"))
            }
        })
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "Timeout"))??;

        let data = String::from_utf8_lossy(&buf[..n]).to_string();
        self.buffer.push_str(&data);
        Ok(data)
    }

    /// Read until pattern found.
    pub async fn read_until(&mut self, pattern: &str, timeout_dur: Duration) -> std::io::Result<String> {
        let start = std::time::Instant::now();
        while !self.buffer.contains(pattern) {
            if start.elapsed() > timeout_dur {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("Timeout waiting for: {}", pattern),
                ));
            }
            let remaining = timeout_dur.saturating_sub(start.elapsed());
            if self.read(remaining).await?.is_empty() {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("Connection closed waiting for: {}", pattern),
                ));
            }
        }
        Ok(self.buffer.clone())
    }

    /// Wait until the server closes the connection.
    pub async fn read_to_eof(&mut self, timeout_dur: Duration) -> std::io::Result<String> {
        let start = std::time::Instant::now();
        loop {
            let remaining = timeout_dur.saturating_sub(start.elapsed());
            match self.read(remaining).await {
                Ok(data) if data.is_empty() => return Ok(self.buffer.clone()),
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::ConnectionReset => {
                    return Ok(self.buffer.clone())
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Take the buffer.
    pub fn take_buffer(&mut self) -> String {
        std::mem::take(&mut self.buffer)
    }

    /// Check if using TLS.
    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }
}

/// Helper to validate the server's stream header reply.
pub fn validate_stream_header(response: &str) -> Result<(), String> {
    if !response.contains("xmlns='jabber:client'") {
        return Err("Missing xmlns='jabber:client'".to_string());
    }
    if !response.contains("xmlns:stream='http://etherx.jabber.org/streams'") {
        return Err("Missing xmlns:stream".to_string());
    }
    if !response.contains("version='1.0'") {
        return Err("Missing or incorrect version attribute".to_string());
    }
    if !response.contains("id='") {
        return Err("Missing id attribute".to_string());
    }
    if !response.contains("from='") {
        return Err("Missing from attribute".to_string());
    }
    Ok(())
}
