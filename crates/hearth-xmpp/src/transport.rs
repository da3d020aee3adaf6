//! Transport strategies: plain TCP and direct TLS.
//!
//! A [`Transport`] is what a connection task reads from and writes to. The
//! TLS variant hides record framing behind the same `AsyncRead`/`AsyncWrite`
//! surface. tokio-rustls registers interest in whichever socket direction a
//! handshake or record flush actually needs, so a TLS write that has to read
//! first (or the reverse) simply stays pending until the socket is ready.

use std::fs::File;
use std::io::{self, BufReader};
use std::net::SocketAddr;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tracing::debug;

use crate::types;
use crate::XmppError;

/// An accepted socket, plain or TLS-wrapped.
pub enum Transport {
    /// Direct TCP
    Plain(TcpStream),
    /// TLS over TCP, handshake already complete
    Tls(Box<TlsStream<TcpStream>>),
}

impl Transport {
    /// Wrap a socket according to `kind`.
    ///
    /// For [`types::Transport::TcpTls`] this runs the server handshake.
    pub async fn accept(
        stream: TcpStream,
        kind: types::Transport,
        acceptor: Option<&TlsAcceptor>,
    ) -> Result<Self, XmppError> {
        match kind {
            types::Transport::Tcp => Ok(Transport::Plain(stream)),
            types::Transport::TcpTls => {
                let acceptor = acceptor
                    .ok_or_else(|| XmppError::config("TLS listener without a TLS acceptor"))?;
                let tls = acceptor.accept(stream).await?;
                debug!("TLS handshake complete");
                Ok(Transport::Tls(Box::new(tls)))
            }
        }
    }

    /// Which strategy this is.
    pub fn kind(&self) -> types::Transport {
        match self {
            Transport::Plain(_) => types::Transport::Tcp,
            Transport::Tls(_) => types::Transport::TcpTls,
        }
    }

    /// Remote address of the underlying socket.
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        match self {
            Transport::Plain(s) => s.peer_addr(),
            Transport::Tls(s) => s.get_ref().0.peer_addr(),
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
            Transport::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
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
            Transport::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_flush(cx),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Load a TLS acceptor from PEM certificate chain and PKCS#8 key files.
pub fn load_tls_acceptor(
    cert_path: impl AsRef<Path>,
    key_path: impl AsRef<Path>,
) -> Result<TlsAcceptor, XmppError> {
    use rustls_pemfile::{certs, pkcs8_private_keys};
    use tokio_rustls::rustls::{pki_types::PrivateKeyDer, ServerConfig};

    let cert_path = cert_path.as_ref();
    let key_path = key_path.as_ref();

    let cert_file = File::open(cert_path).map_err(|e| {
        XmppError::config(format!("Failed to open cert file {}: {}", cert_path.display(), e))
    })?;
    let key_file = File::open(key_path).map_err(|e| {
        XmppError::config(format!("Failed to open key file {}: {}", key_path.display(), e))
    })?;

    let certs: Vec<_> = certs(&mut BufReader::new(cert_file))
        .filter_map(|r| r.ok())
        .collect();
    if certs.is_empty() {
        return Err(XmppError::config(format!(
            "No certificates found in {}",
            cert_path.display()
        )));
    }

    let key = pkcs8_private_keys(&mut BufReader::new(key_file))
        .filter_map(|r| r.ok())
        .next()
        .ok_or_else(|| XmppError::config("No private key found"))?;

    let server_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, PrivateKeyDer::Pkcs8(key))?;

    Ok(TlsAcceptor::from(Arc::new(server_config)))
}
