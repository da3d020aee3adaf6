//! Common types for the stream server.

/// Connection state in the stream lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Socket accepted, transport not yet ready (TLS handshake)
    Accepting,
    /// Transport ready, reading and writing
    Connected,
    /// Reads stopped, draining queued writes
    Closing,
    /// Terminal; resources released
    Closed,
}

impl ConnectionState {
    /// Whether reads may still be issued.
    pub fn is_readable(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Accepting => write!(f, "accepting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Closing => write!(f, "closing"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

/// Transport type for the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// Plain TCP
    Tcp,
    /// TCP with TLS from the first byte
    TcpTls,
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transport::Tcp => write!(f, "tcp"),
            Transport::TcpTls => write!(f, "tcp+tls"),
        }
    }
}

/// Stanza kind used for routing decisions, metrics and tracing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaType {
    /// Message stanza
    Message,
    /// Presence stanza that is not a subscription request
    Presence,
    /// IQ (info/query) stanza
    Iq,
    /// Presence of type subscribe, subscribed, unsubscribe or unsubscribed
    Subscription,
    /// Anything else
    Unknown,
}

impl StanzaType {
    /// Classify by element name and `type` attribute.
    pub fn classify(name: &str, type_attr: Option<&str>) -> Self {
        match name {
            "message" => StanzaType::Message,
            "iq" => StanzaType::Iq,
            "presence" => match type_attr {
                Some("subscribe" | "subscribed" | "unsubscribe" | "unsubscribed") => {
                    StanzaType::Subscription
                }
                _ => StanzaType::Presence,
            },
            _ => StanzaType::Unknown,
        }
    }
}

impl std::fmt::Display for StanzaType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StanzaType::Message => write!(f, "message"),
            StanzaType::Presence => write!(f, "presence"),
            StanzaType::Iq => write!(f, "iq"),
            StanzaType::Subscription => write!(f, "s10n"),
            StanzaType::Unknown => write!(f, "unknown"),
        }
    }
}

/// Stanza subtype, derived from the `type` attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaSubtype {
    /// No or unrecognised `type`
    None,
    /// `type='error'`, on any stanza kind
    Error,
    /// message: normal
    Normal,
    /// message: chat
    Chat,
    /// message: groupchat
    Groupchat,
    /// message: headline
    Headline,
    /// presence: available (no type attribute)
    Available,
    /// presence: unavailable
    Unavailable,
    /// presence: probe
    Probe,
    /// presence: invisible
    Invisible,
    /// subscription: subscribe
    Subscribe,
    /// subscription: subscribed
    Subscribed,
    /// subscription: unsubscribe
    Unsubscribe,
    /// subscription: unsubscribed
    Unsubscribed,
    /// iq: get
    Get,
    /// iq: set
    Set,
    /// iq: result
    Result,
}

impl StanzaSubtype {
    /// Derive the subtype for a stanza of `kind`.
    pub fn classify(kind: StanzaType, type_attr: Option<&str>) -> Self {
        if type_attr == Some("error") {
            return StanzaSubtype::Error;
        }
        match (kind, type_attr) {
            (StanzaType::Message, None | Some("normal")) => StanzaSubtype::Normal,
            (StanzaType::Message, Some("chat")) => StanzaSubtype::Chat,
            (StanzaType::Message, Some("groupchat")) => StanzaSubtype::Groupchat,
            (StanzaType::Message, Some("headline")) => StanzaSubtype::Headline,
            (StanzaType::Presence, None | Some("available")) => StanzaSubtype::Available,
            (StanzaType::Presence, Some("unavailable")) => StanzaSubtype::Unavailable,
            (StanzaType::Presence, Some("probe")) => StanzaSubtype::Probe,
            (StanzaType::Presence, Some("invisible")) => StanzaSubtype::Invisible,
            (StanzaType::Subscription, Some("subscribe")) => StanzaSubtype::Subscribe,
            (StanzaType::Subscription, Some("subscribed")) => StanzaSubtype::Subscribed,
            (StanzaType::Subscription, Some("unsubscribe")) => StanzaSubtype::Unsubscribe,
            (StanzaType::Subscription, Some("unsubscribed")) => StanzaSubtype::Unsubscribed,
            (StanzaType::Iq, Some("get")) => StanzaSubtype::Get,
            (StanzaType::Iq, Some("set")) => StanzaSubtype::Set,
            (StanzaType::Iq, Some("result")) => StanzaSubtype::Result,
            _ => StanzaSubtype::None,
        }
    }
}
