//! Stream server: listeners, accept-rate limiting and the shared heartbeat.
//!
//! The server listens on a plain TCP port (default 5222) and, when a
//! certificate is configured, on a direct-TLS port. Every accepted socket
//! gets its own task; see [`crate::connection`].

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::future::try_join_all;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::connection::{handle_connection, ConnectionContext, StreamAuthorizer};
use crate::heartbeat::Heartbeat;
use crate::karma::KarmaConfig;
use crate::limiter::{is_limited, RateLimitConfig, RateLimiter};
use crate::parser::ParserLimits;
use crate::registry::ConnectionRegistry;
use crate::routing::{HandlerResult, Router};
use crate::transport::load_tls_acceptor;
use crate::types::Transport;
use crate::{metrics, XmppError};

/// Interval of the server's heartbeat tick.
const HEARTBEAT_TICK: Duration = Duration::from_secs(1);

/// Stream server configuration.
#[derive(Debug, Clone)]
pub struct XmppServerConfig {
    /// Address to bind for plain connections (default: 0.0.0.0:5222)
    pub c2s_addr: SocketAddr,
    /// Address to bind for direct-TLS connections; needs cert and key
    pub tls_addr: Option<SocketAddr>,
    /// TLS certificate path (PEM format)
    pub tls_cert_path: Option<PathBuf>,
    /// TLS private key path (PEM, PKCS#8)
    pub tls_key_path: Option<PathBuf>,
    /// Domain announced to peers that do not name one
    pub domain: String,
    /// Per-connection karma
    pub karma: KarmaConfig,
    /// Accept-rate limiting per source IP; a zero window disables it
    pub rate: RateLimitConfig,
    /// Per-connection parser limits
    pub limits: ParserLimits,
    /// Capacity of each connection's outbound queue
    pub outbound_queue: usize,
    /// How often the connection gauge is flushed
    pub stats_interval: Duration,
}

impl Default for XmppServerConfig {
    fn default() -> Self {
        Self {
            c2s_addr: SocketAddr::from(([0, 0, 0, 0], 5222)),
            tls_addr: None,
            tls_cert_path: None,
            tls_key_path: None,
            domain: "localhost".to_string(),
            karma: KarmaConfig::default(),
            rate: RateLimitConfig::default(),
            limits: ParserLimits::default(),
            outbound_queue: 256,
            stats_interval: Duration::from_secs(10),
        }
    }
}

impl XmppServerConfig {
    /// Check settings that would otherwise fail at bind or accept time.
    pub fn validate(&self) -> Result<(), XmppError> {
        self.karma.validate()?;
        if self.domain.is_empty() {
            return Err(XmppError::config("server domain must not be empty"));
        }
        if self.outbound_queue == 0 {
            return Err(XmppError::config("outbound queue size must be non-zero"));
        }
        if self.stats_interval.is_zero() {
            return Err(XmppError::config("statistics interval must be non-zero"));
        }
        if self.tls_addr.is_some() && (self.tls_cert_path.is_none() || self.tls_key_path.is_none()) {
            return Err(XmppError::config(
                "a TLS listener needs both tls_cert_path and tls_key_path",
            ));
        }
        Ok(())
    }
}

/// A bound listener and the transport it hands out.
struct Listener {
    inner: TcpListener,
    kind: Transport,
    acceptor: Option<TlsAcceptor>,
}

/// Stream server instance.
pub struct XmppServer {
    config: XmppServerConfig,
    ctx: Arc<ConnectionContext>,
    heartbeat: Arc<Heartbeat>,
    limiter: Option<Arc<RateLimiter>>,
    listeners: Vec<Listener>,
    shutdown: CancellationToken,
}

impl XmppServer {
    /// Bind the configured listeners. Nothing is accepted until [`run`](Self::run).
    pub async fn bind(config: XmppServerConfig, router: Arc<Router>) -> Result<Self, XmppError> {
        Self::bind_with(config, router, None).await
    }

    /// [`bind`](Self::bind) with a custom stream authorizer.
    pub async fn bind_with(
        config: XmppServerConfig,
        router: Arc<Router>,
        authorizer: Option<Arc<dyn StreamAuthorizer>>,
    ) -> Result<Self, XmppError> {
        config.validate()?;

        let registry = Arc::new(ConnectionRegistry::new());
        let mut ctx = ConnectionContext::new(router, registry, config.domain.clone())
            .with_karma(config.karma)
            .with_limits(config.limits)
            .with_outbound_queue(config.outbound_queue);
        if let Some(authorizer) = authorizer {
            ctx = ctx.with_authorizer(authorizer);
        }

        let mut listeners = Vec::new();
        let plain = TcpListener::bind(config.c2s_addr).await?;
        info!(addr = %plain.local_addr()?, "Plain listener bound");
        listeners.push(Listener {
            inner: plain,
            kind: Transport::Tcp,
            acceptor: None,
        });

        if let (Some(addr), Some(cert), Some(key)) =
            (config.tls_addr, &config.tls_cert_path, &config.tls_key_path)
        {
            let acceptor = load_tls_acceptor(cert, key)?;
            let tls = TcpListener::bind(addr).await?;
            info!(addr = %tls.local_addr()?, "Direct-TLS listener bound");
            listeners.push(Listener {
                inner: tls,
                kind: Transport::TcpTls,
                acceptor: Some(acceptor),
            });
        }

        let limiter = RateLimiter::new(config.rate).map(Arc::new);
        if limiter.is_none() {
            info!("Connection rate limiting disabled");
        }

        Ok(Self {
            config,
            ctx: Arc::new(ctx),
            heartbeat: Arc::new(Heartbeat::new()),
            limiter,
            listeners,
            shutdown: CancellationToken::new(),
        })
    }

    /// Get the server configuration.
    pub fn config(&self) -> &XmppServerConfig {
        &self.config
    }

    /// Get the connection registry.
    pub fn connection_registry(&self) -> &Arc<ConnectionRegistry> {
        &self.ctx.registry
    }

    /// Get the router connections dispatch into.
    pub fn router(&self) -> &Arc<Router> {
        &self.ctx.router
    }

    /// Get the heartbeat, to register further periodic work.
    pub fn heartbeat(&self) -> &Arc<Heartbeat> {
        &self.heartbeat
    }

    /// Token that stops the server when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Local address of the plain listener.
    pub fn local_addr(&self) -> Result<SocketAddr, XmppError> {
        self.listener_addr(Transport::Tcp)
    }

    /// Local address of the direct-TLS listener, if bound.
    pub fn tls_local_addr(&self) -> Option<SocketAddr> {
        self.listener_addr(Transport::TcpTls).ok()
    }

    fn listener_addr(&self, kind: Transport) -> Result<SocketAddr, XmppError> {
        let listener = self
            .listeners
            .iter()
            .find(|l| l.kind == kind)
            .ok_or_else(|| XmppError::internal(format!("no {} listener", kind)))?;
        Ok(listener.inner.local_addr()?)
    }

    fn register_beats(&self) -> Result<(), XmppError> {
        let ctx = Arc::clone(&self.ctx);
        self.heartbeat.register(self.config.stats_interval, move || {
            let active = ctx.active_connections();
            metrics::record_connection_count(active as i64);
            debug!(
                active,
                bound = ctx.registry.connection_count(),
                "Statistics flush"
            );
            HandlerResult::Pass
        })?;

        let registry = Arc::clone(&self.ctx.registry);
        self.heartbeat.register(Duration::from_secs(60), move || {
            registry.cleanup_stale();
            HandlerResult::Pass
        })?;
        Ok(())
    }

    /// Accept connections until the shutdown token is cancelled.
    pub async fn run(self) -> Result<(), XmppError> {
        self.register_beats()?;

        let heartbeat = tokio::spawn(
            Arc::clone(&self.heartbeat).run(HEARTBEAT_TICK, self.shutdown.clone()),
        );

        let handles: Vec<JoinHandle<Result<(), XmppError>>> = self
            .listeners
            .into_iter()
            .map(|listener| {
                let ctx = Arc::clone(&self.ctx);
                let limiter = self.limiter.clone();
                let shutdown = self.shutdown.clone();
                tokio::spawn(accept_loop(listener, ctx, limiter, shutdown))
            })
            .collect();

        let result = try_join_all(handles.into_iter().map(|h| async move {
            h.await
                .map_err(|e| XmppError::internal(format!("Listener task failed: {}", e)))?
        }))
        .await;

        // A failed listener takes the rest of the server down with it.
        self.shutdown.cancel();
        if let Err(e) = heartbeat.await {
            warn!(error = %e, "Heartbeat task failed");
        }

        info!("Server stopped");
        result.map(|_| ())
    }
}

async fn accept_loop(
    listener: Listener,
    ctx: Arc<ConnectionContext>,
    limiter: Option<Arc<RateLimiter>>,
    shutdown: CancellationToken,
) -> Result<(), XmppError> {
    let Listener {
        inner,
        kind,
        acceptor,
    } = listener;
    info!(addr = %inner.local_addr()?, transport = %kind, "Accepting connections");

    loop {
        let (socket, peer) = tokio::select! {
            _ = shutdown.cancelled() => {
                info!(transport = %kind, "Listener shutting down");
                return Ok(());
            }
            accepted = inner.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(error = %e, "Failed to accept connection");
                    continue;
                }
            },
        };

        if is_limited(limiter.as_deref(), &peer.ip().to_string(), 1) {
            warn!(peer = %peer, "Connection rate exceeded, closing socket");
            metrics::record_rate_limited();
            drop(socket);
            continue;
        }

        let ctx = Arc::clone(&ctx);
        let acceptor = acceptor.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(
            async move {
                if let Err(e) = handle_connection(socket, peer, kind, acceptor, ctx, shutdown).await {
                    warn!(error = %e, "Connection error");
                }
            }
            .instrument(info_span!(
                "xmpp.connection.lifecycle",
                client_ip = %peer,
                transport = %kind,
            )),
        );
    }
}
