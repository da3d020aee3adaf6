//! # hearth-xmpp
//!
//! Core of an XML-stream server: connections that each carry one long-lived
//! `<stream:stream>` document, and a router that hands every completed
//! stanza to the instance owning its destination domain.
//!
//! ## Architecture
//!
//! - **Server**: plain TCP listener (5222) and an optional direct-TLS
//!   listener, with per-IP accept-rate limiting
//! - **Connections**: one tokio task per socket, owning its parser, karma
//!   and outbound queue
//! - **Parser**: push-based incremental XML, chunk-boundary independent
//! - **Karma**: per-connection byte-rate reputation that suspends reads
//! - **Routing**: instances matched by domain pattern, each with
//!   pre-delivery, conditional and delivery handler chains
//! - **Heartbeat**: shared periodic work (statistics, cleanup)
//!
//! ```text
//! socket ─► karma ─► StreamParser ─► Stanza ─► Router ─► instance chains
//!                                                            │
//!                          ConnectionRegistry ◄─ SessionDelivery
//! ```

pub mod connection;
pub mod handlers;
pub mod heartbeat;
pub mod karma;
pub mod limiter;
pub mod metrics;
pub mod parser;
pub mod registry;
pub mod routing;
pub mod server;
pub mod stanza;
pub mod storage;
pub mod transport;

mod error;
mod types;

pub use connection::{Admission, BindFrom, ConnectionContext, StreamAuthorizer};
pub use error::{
    error_element, generate_stream_error, stream_errors, StanzaErrorCondition, StanzaErrorType,
    XmppError,
};
pub use heartbeat::{BeatId, Heartbeat};
pub use karma::{Karma, KarmaConfig};
pub use limiter::{RateLimitConfig, RateLimiter};
pub use parser::{ns, ParseError, ParserLimits, StreamEvent, StreamHeader, StreamParser};
pub use registry::{ConnectionRegistry, OutboundStanza, SendResult};
pub use routing::{
    Delivery, DispatchOutcome, DomainPattern, Handler, HandlerResult, InstanceRegistry, Packet, Phase,
    RegistryBuilder, Router, RouterConfig,
};
pub use server::{XmppServer, XmppServerConfig};
pub use stanza::Stanza;
pub use storage::{MemoryStorage, Storage, StorageError};
pub use types::*;
