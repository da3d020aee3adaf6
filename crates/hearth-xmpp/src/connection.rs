//! Per-connection task: reads, karma, parsing, dispatch and writes.
//!
//! Each accepted socket is owned by one task running [`Connection::run`].
//! The task waits on four things at once: the shutdown token, its outbound
//! queue, the karma heartbeat tick and (unless karma has gone bad) the
//! socket. Every wake-up does at most one read-then-feed cycle followed by
//! one write drain.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use jid::Jid;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::error::{escape, generate_stream_error, stream_errors};
use crate::karma::{Karma, KarmaConfig};
use crate::metrics;
use crate::parser::{element_to_string, ns, ParserLimits, StreamEvent, StreamHeader, StreamParser};
use crate::registry::{ConnectionRegistry, OutboundStanza};
use crate::routing::Router;
use crate::stanza::Stanza;
use crate::transport::Transport;
use crate::types::{self, ConnectionState};
use crate::XmppError;

const READ_BUFFER_SIZE: usize = 8192;

/// Outcome of admitting a stream root.
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    /// Open the stream, binding the given address (if any) for delivery
    Accept(Option<Jid>),
    /// Refuse the stream with this stream error condition
    Reject(&'static str),
}

/// Decides whether a stream root is accepted and what address it binds.
pub trait StreamAuthorizer: Send + Sync {
    /// Inspect an opened stream root.
    fn authorize(&self, header: &StreamHeader) -> Admission;
}

/// Accepts every stream and binds its `from` address when it parses.
#[derive(Debug, Default, Clone, Copy)]
pub struct BindFrom;

impl StreamAuthorizer for BindFrom {
    fn authorize(&self, header: &StreamHeader) -> Admission {
        match header.from().map(str::parse::<Jid>) {
            Some(Ok(jid)) => Admission::Accept(Some(jid)),
            Some(Err(_)) => Admission::Reject(stream_errors::NOT_AUTHORIZED),
            None => Admission::Accept(None),
        }
    }
}

/// Everything connections share.
pub struct ConnectionContext {
    /// Routing core
    pub router: Arc<Router>,
    /// Live streams, for delivery
    pub registry: Arc<ConnectionRegistry>,
    /// Stream admission
    pub authorizer: Arc<dyn StreamAuthorizer>,
    /// Karma settings for new connections
    pub karma: KarmaConfig,
    /// Parser limits for new connections
    pub limits: ParserLimits,
    /// Outbound queue capacity per connection
    pub outbound_queue: usize,
    /// Domain announced when the peer did not name one
    pub domain: String,
    /// Number of live connections
    pub active: AtomicUsize,
}

impl ConnectionContext {
    /// Context with default karma, limits and admission.
    pub fn new(router: Arc<Router>, registry: Arc<ConnectionRegistry>, domain: impl Into<String>) -> Self {
        Self {
            router,
            registry,
            authorizer: Arc::new(BindFrom),
            karma: KarmaConfig::default(),
            limits: ParserLimits::default(),
            outbound_queue: 256,
            domain: domain.into(),
            active: AtomicUsize::new(0),
        }
    }

    /// Replace the stream authorizer.
    pub fn with_authorizer(mut self, authorizer: Arc<dyn StreamAuthorizer>) -> Self {
        self.authorizer = authorizer;
        self
    }

    /// Replace the karma settings.
    pub fn with_karma(mut self, karma: KarmaConfig) -> Self {
        self.karma = karma;
        self
    }

    /// Replace the parser limits.
    pub fn with_limits(mut self, limits: ParserLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Replace the outbound queue capacity.
    pub fn with_outbound_queue(mut self, size: usize) -> Self {
        self.outbound_queue = size.max(1);
        self
    }

    /// Number of connections currently running.
    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }
}

struct ActiveGuard<'a>(&'a AtomicUsize);

impl<'a> ActiveGuard<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter)
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Accept handling for one socket: wrap it in its transport and run it.
#[instrument(
    name = "xmpp.connection.handle",
    skip(socket, acceptor, ctx, shutdown),
    fields(peer = %peer, stream_id = tracing::field::Empty)
)]
pub async fn handle_connection(
    socket: TcpStream,
    peer: SocketAddr,
    kind: types::Transport,
    acceptor: Option<TlsAcceptor>,
    ctx: Arc<ConnectionContext>,
    shutdown: CancellationToken,
) -> Result<(), XmppError> {
    info!("New connection from {}", peer);
    let transport = Transport::accept(socket, kind, acceptor.as_ref()).await?;
    Connection::new(transport, kind, peer, ctx).run(shutdown).await
}

/// One live connection.
pub struct Connection<T> {
    io: T,
    kind: types::Transport,
    peer: SocketAddr,
    state: ConnectionState,
    parser: StreamParser,
    karma: Karma,
    ctx: Arc<ConnectionContext>,
    stream_id: String,
    header_sent: bool,
    bound: Option<Jid>,
    outbound_tx: mpsc::Sender<OutboundStanza>,
    outbound_rx: mpsc::Receiver<OutboundStanza>,
    write_buf: Vec<u8>,
}

impl<T> Connection<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Set up parser, karma and outbound queue for an accepted transport.
    pub fn new(io: T, kind: types::Transport, peer: SocketAddr, ctx: Arc<ConnectionContext>) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(ctx.outbound_queue.max(1));
        Self {
            io,
            kind,
            peer,
            state: ConnectionState::Accepting,
            parser: StreamParser::with_limits(ctx.limits),
            karma: Karma::new(ctx.karma),
            stream_id: uuid::Uuid::new_v4().to_string(),
            header_sent: false,
            bound: None,
            outbound_tx,
            outbound_rx,
            write_buf: Vec::new(),
            ctx,
        }
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Drive the connection until it closes.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<(), XmppError> {
        let ctx = Arc::clone(&self.ctx);
        let _active = ActiveGuard::new(&ctx.active);
        self.state = ConnectionState::Connected;
        tracing::Span::current().record("stream_id", self.stream_id.as_str());

        let result = self.drive(&shutdown).await;
        self.teardown().await;

        info!(peer = %self.peer, "Connection closed");
        result
    }

    async fn drive(&mut self, shutdown: &CancellationToken) -> Result<(), XmppError> {
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        let period = self.ctx.karma.heartbeat.max(Duration::from_millis(10));
        let mut tick = tokio::time::interval(period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        while self.state.is_readable() {
            let throttled = self.karma.is_bad();

            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("Shutdown requested, closing stream");
                    self.close_stream(Some(stream_errors::SYSTEM_SHUTDOWN));
                }
                Some(outbound) = self.outbound_rx.recv() => {
                    self.queue_stanza(&outbound.stanza);
                }
                deadline = tick.tick() => {
                    // Scheduled deadlines are exactly one period apart.
                    self.karma.heartbeat_at(deadline.into_std());
                    if throttled && !self.karma.is_bad() {
                        debug!(karma = self.karma.value(), "Karma restored, resuming reads");
                    }
                }
                read = self.io.read(&mut buf), if !throttled => match read {
                    Ok(0) => {
                        debug!("Peer closed the socket");
                        self.state = ConnectionState::Closing;
                    }
                    Ok(n) => self.on_read(&buf[..n]),
                    Err(e) => {
                        warn!(error = %e, "Read failed");
                        self.state = ConnectionState::Closing;
                    }
                },
            }

            self.flush().await?;
        }

        Ok(())
    }

    fn on_read(&mut self, data: &[u8]) {
        let was_bad = self.karma.is_bad();
        self.karma.record_read(data.len());
        if !was_bad && self.karma.is_bad() {
            warn!(
                karma = self.karma.value(),
                bytes = self.karma.bytes(),
                "Karma exhausted, suspending reads"
            );
            metrics::record_karma_throttle(self.kind);
        }

        for event in self.parser.feed(data) {
            if !self.state.is_readable() {
                break;
            }
            self.on_event(event);
        }
    }

    fn on_event(&mut self, event: StreamEvent) {
        match event {
            StreamEvent::Root(header) => self.on_root(header),
            StreamEvent::Stanza(element) => {
                let mut stanza = Stanza::new(element);
                if stanza.from().is_none() {
                    if let Some(bound) = &self.bound {
                        stanza.set_from(Some(bound));
                    }
                }
                let delivery = self.ctx.router.deliver(stanza, None);
                debug!(outcome = delivery.outcome.label(), "Stanza dispatched");
                if let Some(bounce) = delivery.returned {
                    self.queue_stanza(&bounce);
                }
            }
            StreamEvent::Closed => {
                debug!("Peer closed the stream");
                self.close_stream(None);
            }
            StreamEvent::Error(e) => {
                warn!(error = %e, "Stream parse error");
                metrics::record_parse_error();
                self.close_stream(Some(e.stream_condition()));
            }
        }
    }

    fn on_root(&mut self, header: StreamHeader) {
        debug!(to = ?header.to(), from = ?header.from(), "Stream opened");

        let admission = match header.rejection() {
            Some(condition) => Admission::Reject(condition),
            None if !self.serves(header.to()) => Admission::Reject(stream_errors::HOST_UNKNOWN),
            None => self.ctx.authorizer.authorize(&header),
        };

        self.send_header(Some(&header));
        match admission {
            Admission::Reject(condition) => {
                info!(condition = %condition, "Refusing stream");
                self.close_stream(Some(condition));
            }
            Admission::Accept(bound) => {
                if let Some(jid) = bound {
                    self.ctx.registry.register(
                        jid.clone(),
                        self.stream_id.clone(),
                        self.outbound_tx.clone(),
                    );
                    info!(jid = %jid, "Stream bound");
                    self.bound = Some(jid);
                }
            }
        }
    }

    /// Whether some instance answers for the stream's `to` domain. A stream
    /// without `to` is addressed to the default domain.
    fn serves(&self, to: Option<&str>) -> bool {
        to.map_or(true, |domain| self.ctx.router.snapshot().resolve(domain).is_some())
    }

    fn send_header(&mut self, header: Option<&StreamHeader>) {
        if self.header_sent {
            return;
        }
        let content_ns = header
            .map(|h| h.content_ns.as_str())
            .filter(|ns| !ns.is_empty())
            .unwrap_or(ns::JABBER_CLIENT);
        let from = header.and_then(|h| h.to()).unwrap_or(self.ctx.domain.as_str());

        let reply = format!(
            "<?xml version='1.0'?><stream:stream xmlns='{}' xmlns:stream='{}' id='{}' from='{}' version='1.0'>",
            escape(content_ns),
            ns::STREAM,
            self.stream_id,
            escape(from),
        );
        self.write_buf.extend_from_slice(reply.as_bytes());
        self.header_sent = true;
    }

    /// Queue the stream's closing bytes and stop reading.
    fn close_stream(&mut self, error: Option<&str>) {
        if self.state == ConnectionState::Closing {
            return;
        }
        match error {
            Some(condition) => {
                self.send_header(None);
                self.write_buf
                    .extend_from_slice(generate_stream_error(condition, None).as_bytes());
            }
            None if self.header_sent => self.write_buf.extend_from_slice(b"</stream:stream>"),
            None => {}
        }
        self.state = ConnectionState::Closing;
    }

    fn queue_stanza(&mut self, stanza: &Stanza) {
        match element_to_string(stanza.element()) {
            Ok(xml) => self.write_buf.extend_from_slice(xml.as_bytes()),
            Err(e) => warn!(error = %e, "Dropping unserializable outbound stanza"),
        }
    }

    async fn flush(&mut self) -> Result<(), XmppError> {
        if self.write_buf.is_empty() {
            return Ok(());
        }
        self.io.write_all(&self.write_buf).await?;
        self.io.flush().await?;
        self.write_buf.clear();
        Ok(())
    }

    async fn teardown(&mut self) {
        self.state = ConnectionState::Closing;
        if let Some(jid) = self.bound.take() {
            self.ctx.registry.unregister(&jid, &self.stream_id);
        }

        // Deliver what was already queued for us before going away.
        self.outbound_rx.close();
        while let Ok(outbound) = self.outbound_rx.try_recv() {
            if self.header_sent {
                self.queue_stanza(&outbound.stanza);
            }
        }

        if let Err(e) = self.flush().await {
            debug!(error = %e, "Failed to flush on close");
        }
        if let Err(e) = self.io.shutdown().await {
            debug!(error = %e, "Socket shutdown failed");
        }
        self.state = ConnectionState::Closed;
    }
}
