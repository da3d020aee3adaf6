//! Connection Registry for delivering stanzas to live streams.
//!
//! Each connection registers its outbound queue once its stream is open and
//! an address is bound. Delivery handlers look the destination up here and
//! queue the stanza; the connection task writes it out.
//!
//! ```text
//! Router ──► SessionDelivery ──► ConnectionRegistry ──► mpsc::Sender ──► Connection task
//!                                  DashMap<Jid, ...>
//! ```

mod connection_registry;

pub use connection_registry::{ConnectionEntry, ConnectionRegistry, OutboundStanza, SendResult};
