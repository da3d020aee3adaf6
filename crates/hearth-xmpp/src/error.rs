//! Error types for the stream server core.

use minidom::Element;
use thiserror::Error;

use crate::parser::{ns, ParseError};

/// Stream server errors.
#[derive(Debug, Error)]
pub enum XmppError {
    /// IO error (network, file)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS error
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// XML parsing error
    #[error("XML parse error: {0}")]
    XmlParse(#[from] ParseError),

    /// Stream error
    #[error("Stream error: {0}")]
    Stream(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal server error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl XmppError {
    /// Create a new stream error.
    pub fn stream(msg: impl Into<String>) -> Self {
        Self::Stream(msg.into())
    }

    /// Create a new configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

/// Stanza error conditions a bounce can carry (RFC 6120 Section 8.3.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaErrorCondition {
    /// A handler failed while processing the stanza
    InternalServerError,
    /// The destination address does not parse
    JidMalformed,
    /// A conditional handler rejected the stanza
    NotAllowed,
    /// No instance answers for the destination domain
    RemoteServerNotFound,
    /// A delivery handler refused the stanza, or the recipient queue is full
    ServiceUnavailable,
}

impl StanzaErrorCondition {
    /// Get the element name for this condition.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InternalServerError => "internal-server-error",
            Self::JidMalformed => "jid-malformed",
            Self::NotAllowed => "not-allowed",
            Self::RemoteServerNotFound => "remote-server-not-found",
            Self::ServiceUnavailable => "service-unavailable",
        }
    }

    /// The error type a bounce carries for this condition.
    pub fn default_type(&self) -> StanzaErrorType {
        match self {
            Self::JidMalformed => StanzaErrorType::Modify,
            Self::InternalServerError => StanzaErrorType::Wait,
            Self::NotAllowed | Self::RemoteServerNotFound | Self::ServiceUnavailable => {
                StanzaErrorType::Cancel
            }
        }
    }
}

impl std::fmt::Display for StanzaErrorCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// XMPP stanza error types (RFC 6120 Section 8.3.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaErrorType {
    /// Do not retry (unrecoverable error)
    Cancel,
    /// Retry after changing the data sent
    Modify,
    /// Retry after waiting (temporary error)
    Wait,
}

impl StanzaErrorType {
    /// Get the type attribute value.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cancel => "cancel",
            Self::Modify => "modify",
            Self::Wait => "wait",
        }
    }
}

impl std::fmt::Display for StanzaErrorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Build the `<error/>` child appended to a bounced stanza.
///
/// The stanza's own namespace is used for the wrapper so it serializes
/// without a redundant `xmlns` declaration.
pub fn error_element(
    stanza_ns: &str,
    condition: StanzaErrorCondition,
    text: Option<&str>,
) -> Element {
    let mut error = Element::builder("error", stanza_ns)
        .attr("type", condition.default_type().as_str())
        .build();
    error.append_child(Element::builder(condition.as_str(), ns::STANZAS).build());

    if let Some(text) = text {
        let mut text_el = Element::builder("text", ns::STANZAS).build();
        text_el.append_text_node(text);
        error.append_child(text_el);
    }

    error
}

/// Generate a stream error and close tag.
///
/// Stream errors are fatal and must be followed by closing the stream.
pub fn generate_stream_error(condition: &str, text: Option<&str>) -> String {
    let mut error = format!("<stream:error><{} xmlns='{}'/>", condition, ns::STREAMS);

    if let Some(t) = text {
        error.push_str(&format!(
            "<text xmlns='{}' xml:lang='en'>{}</text>",
            ns::STREAMS,
            escape(t)
        ));
    }

    error.push_str("</stream:error></stream:stream>");
    error
}

/// Escape character data for inclusion in hand-built XML.
pub(crate) fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\'' => out.push_str("&apos;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

/// Common stream error conditions.
pub mod stream_errors {
    /// Stream error: host unknown
    pub const HOST_UNKNOWN: &str = "host-unknown";
    /// Stream error: invalid namespace
    pub const INVALID_NAMESPACE: &str = "invalid-namespace";
    /// Stream error: not authorized
    pub const NOT_AUTHORIZED: &str = "not-authorized";
    /// Stream error: not well-formed
    pub const NOT_WELL_FORMED: &str = "not-well-formed";
    /// Stream error: policy violation
    pub const POLICY_VIOLATION: &str = "policy-violation";
    /// Stream error: restricted XML
    pub const RESTRICTED_XML: &str = "restricted-xml";
    /// Stream error: system shutdown
    pub const SYSTEM_SHUTDOWN: &str = "system-shutdown";
    /// Stream error: unsupported version
    pub const UNSUPPORTED_VERSION: &str = "unsupported-version";
}
