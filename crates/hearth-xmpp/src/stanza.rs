//! Routable stanzas: a parsed element tree plus the fields routing needs.

use jid::Jid;
use minidom::Element;

use crate::error::{error_element, StanzaErrorCondition};
use crate::types::{StanzaSubtype, StanzaType};

/// A completed top-level element and its derived routing fields.
///
/// The derived fields are computed from the element's name and its `to`,
/// `from` and `type` attributes. Handlers that edit those attributes
/// through [`Stanza::element_mut`] must call [`Stanza::refresh`] afterwards;
/// the `set_*` helpers do it for them.
#[derive(Debug, Clone, PartialEq)]
pub struct Stanza {
    element: Element,
    kind: StanzaType,
    subtype: StanzaSubtype,
    to: Option<Jid>,
    from: Option<Jid>,
}

impl Stanza {
    /// Wrap a parsed element.
    pub fn new(element: Element) -> Self {
        let mut stanza = Self {
            element,
            kind: StanzaType::Unknown,
            subtype: StanzaSubtype::None,
            to: None,
            from: None,
        };
        stanza.refresh();
        stanza
    }

    /// Recompute the derived fields from the element.
    pub fn refresh(&mut self) {
        let type_attr = self.element.attr("type");
        self.kind = StanzaType::classify(self.element.name(), type_attr);
        self.subtype = StanzaSubtype::classify(self.kind, type_attr);
        self.to = self.element.attr("to").and_then(|s| s.parse::<Jid>().ok());
        self.from = self.element.attr("from").and_then(|s| s.parse::<Jid>().ok());
    }

    /// The element tree.
    pub fn element(&self) -> &Element {
        &self.element
    }

    /// Mutable access to the element tree.
    pub fn element_mut(&mut self) -> &mut Element {
        &mut self.element
    }

    /// Give up the routing fields and keep the tree.
    pub fn into_element(self) -> Element {
        self.element
    }

    /// Stanza kind.
    pub fn kind(&self) -> StanzaType {
        self.kind
    }

    /// Stanza subtype.
    pub fn subtype(&self) -> StanzaSubtype {
        self.subtype
    }

    /// Parsed destination address.
    pub fn to(&self) -> Option<&Jid> {
        self.to.as_ref()
    }

    /// Parsed source address.
    pub fn from(&self) -> Option<&Jid> {
        self.from.as_ref()
    }

    /// `true` when a `to` attribute is present but is not a valid address.
    pub fn has_malformed_to(&self) -> bool {
        self.to.is_none() && self.element.attr("to").is_some()
    }

    /// Domain of the destination address.
    pub fn to_domain(&self) -> Option<&str> {
        self.to.as_ref().map(|jid| jid.domain().as_str())
    }

    /// Whether this stanza is itself an error.
    pub fn is_error(&self) -> bool {
        self.subtype == StanzaSubtype::Error
    }

    /// Set or clear the destination.
    pub fn set_to(&mut self, to: Option<&Jid>) {
        put_attr(&mut self.element, "to", to.map(|j| j.to_string()));
        self.refresh();
    }

    /// Set or clear the source.
    pub fn set_from(&mut self, from: Option<&Jid>) {
        put_attr(&mut self.element, "from", from.map(|j| j.to_string()));
        self.refresh();
    }

    /// Set or clear the `type` attribute.
    pub fn set_type(&mut self, type_attr: Option<&str>) {
        put_attr(&mut self.element, "type", type_attr.map(str::to_string));
        self.refresh();
    }

    /// Build the error reply for this stanza: addresses swapped,
    /// `type='error'` and an `<error/>` child carrying `condition`.
    ///
    /// Error stanzas are never bounced, so this returns `None` for them.
    /// A missing `from` leaves the reply without a `to`.
    pub fn bounce(&self, condition: StanzaErrorCondition, text: Option<&str>) -> Option<Stanza> {
        if self.is_error() {
            return None;
        }

        let mut element = self.element.clone();
        let to = element.attr("to").map(str::to_string);
        let from = element.attr("from").map(str::to_string);
        put_attr(&mut element, "to", from);
        put_attr(&mut element, "from", to);
        put_attr(&mut element, "type", Some("error".to_string()));

        let stanza_ns = element.ns().to_string();
        element.append_child(error_element(&stanza_ns, condition, text));

        Some(Stanza::new(element))
    }
}

/// Set `name` to `value`, or remove it when `value` is `None`.
///
/// `Element::set_attr` cannot remove an attribute that is already present,
/// so removal rebuilds the element without it.
fn put_attr(element: &mut Element, name: &str, value: Option<String>) {
    match value {
        Some(value) => element.set_attr(name, value),
        None if element.attr(name).is_some() => {
            let mut rebuilt = element
                .attrs()
                .filter(|(key, _)| *key != name)
                .fold(Element::builder(element.name(), element.ns()), |b, (k, v)| b.attr(k, v))
                .build();
            rebuilt.prefixes = element.prefixes.clone();
            for node in element.take_nodes() {
                rebuilt.append_node(node);
            }
            *element = rebuilt;
        }
        None => {}
    }
}

impl From<Element> for Stanza {
    fn from(element: Element) -> Self {
        Stanza::new(element)
    }
}

impl From<Stanza> for Element {
    fn from(stanza: Stanza) -> Self {
        stanza.element
    }
}
