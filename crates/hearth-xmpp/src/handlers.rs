//! Built-in routing handlers.
//!
//! | Handler          | Phase        | Effect                                   |
//! |------------------|--------------|------------------------------------------|
//! | `NormalizeBody`  | PreDelivery  | trims `<body/>`, folds CRLF to LF        |
//! | `Blocklist`      | Conditional  | rejects senders from listed domains      |
//! | `MaxBodyLength`  | Conditional  | rejects bodies over a character limit    |
//! | `SessionDelivery`| Delivery     | hands stanzas to live streams            |
//!
//! [`ClassFilter`] wraps any handler so it only sees one class of packet.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::registry::{ConnectionRegistry, SendResult};
use crate::routing::{Handler, HandlerResult, Packet};
use crate::stanza::Stanza;
use crate::types::StanzaType;

fn body_text(stanza: &Stanza) -> Option<String> {
    let element = stanza.element();
    let ns = element.ns();
    element.get_child("body", ns.as_str()).map(|body| body.text())
}

/// Delivers stanzas to the stream bound to their exact destination.
///
/// Unknown destinations pass, so a later delivery handler can claim them.
/// A recipient whose queue is full fails the chain and the sender gets
/// `service-unavailable`.
pub struct SessionDelivery {
    registry: Arc<ConnectionRegistry>,
}

impl SessionDelivery {
    /// Deliver through `registry`.
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }
}

impl Handler for SessionDelivery {
    fn handle(&self, packet: &mut Packet) -> HandlerResult {
        let Some(to) = packet.stanza.to() else {
            return HandlerResult::Pass;
        };

        match self.registry.send_to(to, packet.stanza.clone()) {
            SendResult::Sent => HandlerResult::Done,
            SendResult::ChannelFull => {
                warn!(to = %to, "Recipient queue full");
                HandlerResult::Last
            }
            SendResult::NotConnected | SendResult::ChannelClosed => HandlerResult::Pass,
        }
    }

    fn name(&self) -> &str {
        "session-delivery"
    }
}

/// Rejects stanzas whose sender domain is listed.
#[derive(Debug, Clone, Default)]
pub struct Blocklist {
    domains: HashSet<String>,
}

impl Blocklist {
    /// Block every domain in `domains`. Matching ignores ASCII case.
    pub fn new<I, S>(domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            domains: domains
                .into_iter()
                .map(|d| d.into().to_ascii_lowercase())
                .collect(),
        }
    }

    /// Whether stanzas from `domain` are refused.
    pub fn is_blocked(&self, domain: &str) -> bool {
        self.domains.contains(&domain.to_ascii_lowercase())
    }
}

impl Handler for Blocklist {
    fn handle(&self, packet: &mut Packet) -> HandlerResult {
        match packet.stanza.from() {
            Some(from) if self.is_blocked(from.domain().as_str()) => {
                debug!(from = %from, "Sender domain is blocked");
                HandlerResult::Last
            }
            _ => HandlerResult::Pass,
        }
    }

    fn name(&self) -> &str {
        "blocklist"
    }
}

/// Rejects stanzas whose `<body/>` is longer than `max` characters.
#[derive(Debug, Clone, Copy)]
pub struct MaxBodyLength {
    max: usize,
}

impl MaxBodyLength {
    /// Accept bodies of up to `max` characters.
    pub fn new(max: usize) -> Self {
        Self { max }
    }
}

impl Handler for MaxBodyLength {
    fn handle(&self, packet: &mut Packet) -> HandlerResult {
        match body_text(&packet.stanza) {
            Some(body) if body.chars().count() > self.max => {
                debug!(len = body.chars().count(), max = self.max, "Body too long");
                HandlerResult::Last
            }
            _ => HandlerResult::Pass,
        }
    }

    fn name(&self) -> &str {
        "max-body-length"
    }
}

/// Trims surrounding whitespace from `<body/>` and folds CRLF to LF.
#[derive(Debug, Clone, Copy, Default)]
pub struct NormalizeBody;

impl NormalizeBody {
    fn normalize(text: &str) -> String {
        text.trim().replace("\r\n", "\n")
    }
}

impl Handler for NormalizeBody {
    fn handle(&self, packet: &mut Packet) -> HandlerResult {
        let Some(text) = body_text(&packet.stanza) else {
            return HandlerResult::Pass;
        };
        let normalized = Self::normalize(&text);
        if normalized == text {
            return HandlerResult::Pass;
        }

        let element = packet.stanza.element_mut();
        let ns = element.ns();
        if let Some(body) = element.get_child_mut("body", ns.as_str()) {
            let mut replacement = Some(normalized);
            for node in body.texts_mut() {
                *node = replacement.take().unwrap_or_default();
            }
        }
        HandlerResult::Pass
    }

    fn name(&self) -> &str {
        "normalize-body"
    }
}

/// A class of packets a [`ClassFilter`] selects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketClass {
    /// Stanzas of one kind
    Kind(StanzaType),
    /// Stanzas carrying a direct child in this namespace
    Namespace(String),
    /// Stanzas whose `type` attribute has this value
    Type(String),
}

impl PacketClass {
    /// Whether `stanza` belongs to the class.
    pub fn matches(&self, stanza: &Stanza) -> bool {
        match self {
            PacketClass::Kind(kind) => stanza.kind() == *kind,
            PacketClass::Namespace(ns) => stanza.element().children().any(|c| c.ns() == *ns),
            PacketClass::Type(value) => stanza.element().attr("type") == Some(value.as_str()),
        }
    }
}

/// Runs the wrapped handler for packets in any of its classes and passes
/// the rest.
pub struct ClassFilter<H> {
    classes: Vec<PacketClass>,
    inner: H,
}

impl<H: Handler> ClassFilter<H> {
    /// Filter `inner` to `classes`. An empty class list matches nothing.
    pub fn new<I>(classes: I, inner: H) -> Self
    where
        I: IntoIterator<Item = PacketClass>,
    {
        Self {
            classes: classes.into_iter().collect(),
            inner,
        }
    }
}

impl<H: Handler> Handler for ClassFilter<H> {
    fn handle(&self, packet: &mut Packet) -> HandlerResult {
        if self.classes.iter().any(|class| class.matches(&packet.stanza)) {
            self.inner.handle(packet)
        } else {
            HandlerResult::Pass
        }
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}
