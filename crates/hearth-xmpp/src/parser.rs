//! Incremental XML parsing for XMPP-style streams.
//!
//! A connection carries one long-lived document: a stream root that stays
//! open for the whole session, with every depth-1 child being a stanza. The
//! parser is push-based. Bytes arrive in chunks of any size, split anywhere
//! (inside a tag name, an attribute value, an entity or a multi-byte UTF-8
//! sequence). Tokenizing is done by [`rxml::RawParser`], which keeps partial
//! tokens across [`StreamParser::feed`] calls; its events are assembled into
//! trees by minidom's [`TreeBuilder`].
//!
//! rxml parses restricted XML: comments, processing instructions and DTDs
//! are refused, as RFC 6120 requires of a stream.
//!
//! Each completed stanza is handed out as a whole [`minidom::Element`] tree;
//! the parser keeps nothing of it afterwards.

use std::collections::{BTreeMap, HashSet};
use std::io;

use minidom::tree_builder::TreeBuilder;
use minidom::Element;
use rxml::{Parse, RawEvent, RawParser, WithOptions};
use thiserror::Error;

use crate::error::stream_errors;
use crate::XmppError;

/// Namespace URIs used on the wire
pub mod ns {
    /// Client stream content namespace
    pub const JABBER_CLIENT: &str = "jabber:client";
    /// Server stream content namespace; also the fallback default
    pub const JABBER_SERVER: &str = "jabber:server";
    /// Stream root namespace (`stream:` prefix)
    pub const STREAM: &str = "http://etherx.jabber.org/streams";
    /// Dialback namespace (`db:` prefix)
    pub const DIALBACK: &str = "jabber:server:dialback";
    /// Stream error condition namespace
    pub const STREAMS: &str = "urn:ietf:params:xml:ns:xmpp-streams";
    /// Stanza error condition namespace
    pub const STANZAS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";
    /// The reserved `xml:` prefix
    pub const XML: &str = "http://www.w3.org/XML/1998/namespace";
}

/// Why a stream could not be parsed. Always fatal for the stream.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    /// Bytes that are not valid UTF-8
    #[error("invalid UTF-8 byte 0x{0:02x}")]
    InvalidUtf8(u8),

    /// Markup that is not well-formed
    #[error("malformed markup: {0}")]
    Malformed(String),

    /// End tag does not match the open element
    #[error("end tag does not match the open element")]
    MismatchedEndTag,

    /// Entity reference that is not predefined or numeric
    #[error("undeclared entity reference")]
    UnknownEntity,

    /// Element prefix with no namespace in scope
    #[error("unbound namespace prefix '{0}'")]
    UnboundPrefix(String),

    /// Comments, processing instructions and DTDs
    #[error("restricted XML: {0}")]
    Restricted(&'static str),

    /// Nesting deeper than the configured limit
    #[error("element nesting exceeds {0} levels")]
    TooDeep(usize),

    /// A single stanza larger than the configured limit
    #[error("stanza exceeds {0} bytes")]
    StanzaTooLarge(usize),
}

impl ParseError {
    /// Stream error condition reported to the peer.
    pub fn stream_condition(&self) -> &'static str {
        match self {
            ParseError::Restricted(_) => stream_errors::RESTRICTED_XML,
            ParseError::TooDeep(_) | ParseError::StanzaTooLarge(_) => {
                stream_errors::POLICY_VIOLATION
            }
            _ => stream_errors::NOT_WELL_FORMED,
        }
    }
}

impl From<rxml::Error> for ParseError {
    fn from(err: rxml::Error) -> Self {
        match err {
            rxml::Error::InvalidUtf8Byte(b) => ParseError::InvalidUtf8(b),
            rxml::Error::RestrictedXml(what) => ParseError::Restricted(what),
            rxml::Error::Xml(rxml::error::XmlError::ElementMismatch) => ParseError::MismatchedEndTag,
            rxml::Error::Xml(rxml::error::XmlError::UndeclaredEntity) => ParseError::UnknownEntity,
            other => ParseError::Malformed(other.to_string()),
        }
    }
}

/// Resource limits applied per stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParserLimits {
    /// Maximum element depth, counting the stream root.
    pub max_depth: usize,
    /// Maximum bytes in one stanza, markup included.
    pub max_stanza_bytes: usize,
}

impl Default for ParserLimits {
    fn default() -> Self {
        Self {
            max_depth: 100,
            max_stanza_bytes: 1_000_000,
        }
    }
}

/// The stream root, as seen when it was opened.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamHeader {
    /// Local name of the root (normally `stream`)
    pub name: String,
    /// Namespace of the root (normally [`ns::STREAM`])
    pub namespace: String,
    /// Default namespace for the stream content (`jabber:client`, ...)
    pub content_ns: String,
    /// Attributes other than namespace declarations
    pub attributes: BTreeMap<String, String>,
}

impl StreamHeader {
    fn from_root(root: &Element) -> Self {
        let content_ns = root
            .prefixes
            .declared_prefixes()
            .get(&None)
            .cloned()
            .unwrap_or_else(|| ns::JABBER_SERVER.to_string());
        Self {
            name: root.name().to_string(),
            namespace: root.ns(),
            content_ns,
            attributes: root
                .attrs()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    fn attr(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    /// The 'to' attribute (target domain)
    pub fn to(&self) -> Option<&str> {
        self.attr("to")
    }

    /// The 'from' attribute (source address)
    pub fn from(&self) -> Option<&str> {
        self.attr("from")
    }

    /// The 'id' attribute (stream ID, set by the receiving side)
    pub fn id(&self) -> Option<&str> {
        self.attr("id")
    }

    /// The 'version' attribute
    pub fn version(&self) -> Option<&str> {
        self.attr("version")
    }

    /// The 'xml:lang' attribute
    pub fn lang(&self) -> Option<&str> {
        self.attr("xml:lang")
    }

    /// The stream error condition this header must be refused with, if any.
    pub fn rejection(&self) -> Option<&'static str> {
        if self.name != "stream" || self.namespace != ns::STREAM {
            return Some(stream_errors::INVALID_NAMESPACE);
        }
        let major = self
            .version()
            .map(|v| v.split('.').next().and_then(|m| m.parse::<u32>().ok()));
        match major {
            Some(None) => Some(stream_errors::UNSUPPORTED_VERSION),
            Some(Some(m)) if m > 1 => Some(stream_errors::UNSUPPORTED_VERSION),
            _ => None,
        }
    }

    /// Validate the stream header.
    pub fn validate(&self) -> Result<(), XmppError> {
        match self.rejection() {
            Some(condition) => Err(XmppError::stream(format!(
                "rejected stream root <{}> ({})",
                self.name, condition
            ))),
            None => Ok(()),
        }
    }
}

/// Something the parser recognised in the byte stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// The stream root was opened.
    Root(StreamHeader),
    /// A depth-1 element was closed.
    Stanza(Element),
    /// The stream root was closed.
    Closed,
    /// The stream is not well-formed. Emitted once; the rest is discarded.
    Error(ParseError),
}

/// Where the parser is in the stream as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserState {
    /// Nothing but the XML declaration seen so far
    AwaitingRoot,
    /// Root open, stanzas flowing
    InStream,
    /// Root closed; further input is ignored
    Closed,
    /// A parse error was reported; further input is ignored
    Errored,
}

/// Prefixes in scope before the root declares anything.
fn fallback_prefixes() -> BTreeMap<Option<String>, String> {
    BTreeMap::from([
        (None, ns::JABBER_SERVER.to_string()),
        (Some("stream".to_string()), ns::STREAM.to_string()),
        (Some("db".to_string()), ns::DIALBACK.to_string()),
        (Some("xml".to_string()), ns::XML.to_string()),
    ])
}

/// Push parser for one stream. See the module docs.
pub struct StreamParser {
    limits: ParserLimits,
    state: ParserState,
    lexer: RawParser,
    tree: TreeBuilder,
    /// Prefix of the element whose header is being read
    head_prefix: Option<String>,
    /// Attribute names seen in the current element header
    head_attrs: HashSet<String>,
    /// Bytes consumed since the last stanza boundary
    stanza_bytes: usize,
}

impl StreamParser {
    /// Parser with default limits.
    pub fn new() -> Self {
        Self::with_limits(ParserLimits::default())
    }

    /// Parser with explicit limits.
    pub fn with_limits(limits: ParserLimits) -> Self {
        let options = rxml::Options {
            max_token_length: limits.max_stanza_bytes.max(1),
            context: None,
        };
        Self {
            limits,
            state: ParserState::AwaitingRoot,
            lexer: RawParser::with_options(options),
            tree: TreeBuilder::new().with_prefixes_stack(vec![fallback_prefixes().into()]),
            head_prefix: None,
            head_attrs: HashSet::new(),
            stanza_bytes: 0,
        }
    }

    /// Current stream-level state.
    pub fn state(&self) -> ParserState {
        self.state
    }

    /// Depth below the root (0 between stanzas).
    pub fn depth(&self) -> usize {
        self.tree.depth().saturating_sub(1)
    }

    fn finished(&self) -> bool {
        matches!(self.state, ParserState::Closed | ParserState::Errored)
    }

    /// Feed a chunk. Returns the events completed by this chunk, in order.
    pub fn feed(&mut self, data: &[u8]) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        let mut buf = data;

        while !self.finished() {
            let before = buf.len();
            let result = self.lexer.parse(&mut buf, false);
            self.stanza_bytes += before - buf.len();

            if self.stanza_bytes > self.limits.max_stanza_bytes {
                self.fail(ParseError::StanzaTooLarge(self.limits.max_stanza_bytes), &mut events);
                break;
            }

            match result {
                Ok(Some(event)) => {
                    if let Err(e) = self.handle(event, &mut events) {
                        self.fail(e, &mut events);
                    }
                }
                Ok(None) => {
                    self.state = ParserState::Closed;
                }
                Err(rxml::Error::IO(e)) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => self.fail(e.into(), &mut events),
            }
        }

        events
    }

    fn handle(&mut self, event: RawEvent, events: &mut Vec<StreamEvent>) -> Result<(), ParseError> {
        match &event {
            RawEvent::ElementHeadOpen(_, (prefix, _)) => {
                if self.tree.depth() + 1 > self.limits.max_depth {
                    return Err(ParseError::TooDeep(self.limits.max_depth));
                }
                self.head_prefix = prefix.as_ref().map(|p| p.as_str().to_owned());
                self.head_attrs.clear();
            }
            RawEvent::Attribute(_, (prefix, name), _) => {
                let qualified = match prefix {
                    Some(p) => format!("{}:{}", p.as_str(), name.as_str()),
                    None => name.as_str().to_owned(),
                };
                if !self.head_attrs.insert(qualified.clone()) {
                    return Err(ParseError::Malformed(format!("duplicate attribute '{}'", qualified)));
                }
            }
            // Whitespace keepalives and stray text between stanzas.
            RawEvent::Text(..) if self.tree.depth() <= 1 => {
                self.stanza_bytes = 0;
                return Ok(());
            }
            _ => {}
        }

        let is_head_close = matches!(event, RawEvent::ElementHeadClose(_));
        let is_foot = matches!(event, RawEvent::ElementFoot(_));

        self.tree.process_event(event).map_err(|e| match e {
            minidom::Error::MissingNamespace => {
                ParseError::UnboundPrefix(self.head_prefix.clone().unwrap_or_default())
            }
            other => ParseError::Malformed(other.to_string()),
        })?;

        if is_head_close && self.state == ParserState::AwaitingRoot && self.tree.depth() == 1 {
            let header = self.tree.top().map(StreamHeader::from_root).unwrap_or_default();
            self.state = ParserState::InStream;
            self.stanza_bytes = 0;
            events.push(StreamEvent::Root(header));
        } else if is_foot && self.state == ParserState::InStream {
            match self.tree.depth() {
                0 => {
                    self.tree.root = None;
                    self.state = ParserState::Closed;
                    events.push(StreamEvent::Closed);
                }
                1 => {
                    if let Some(stanza) = self.tree.unshift_child() {
                        events.push(StreamEvent::Stanza(stanza));
                    }
                    self.stanza_bytes = 0;
                }
                _ => {}
            }
        }

        Ok(())
    }

    fn fail(&mut self, error: ParseError, events: &mut Vec<StreamEvent>) {
        tracing::debug!(error = %error, "Stream parse failed");
        self.state = ParserState::Errored;
        events.push(StreamEvent::Error(error));
    }
}

impl Default for StreamParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Convert a minidom Element back to an XML string.
pub fn element_to_string(element: &Element) -> Result<String, XmppError> {
    let mut output = Vec::new();
    element
        .write_to(&mut output)
        .map_err(|e| XmppError::internal(format!("Failed to serialize element: {}", e)))?;
    String::from_utf8(output).map_err(|e| XmppError::internal(format!("Invalid UTF-8: {}", e)))
}
