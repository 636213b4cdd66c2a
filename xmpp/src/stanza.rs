// Copyright (c) 2025 skald contributors
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The stanza abstraction over raw XML documents.

use minidom::Element;
use rand::{thread_rng, Rng};

use crate::ns;

fn make_id() -> String {
    let id: u64 = thread_rng().gen();
    format!("{}", id)
}

/// The three stanza kinds of `jabber:client`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StanzaKind {
    /// An `<iq/>` request or response.
    Iq,
    /// A `<message/>`.
    Message,
    /// A `<presence/>`.
    Presence,
}

impl StanzaKind {
    fn from_name(name: &str) -> Option<StanzaKind> {
        match name {
            "iq" => Some(StanzaKind::Iq),
            "message" => Some(StanzaKind::Message),
            "presence" => Some(StanzaKind::Presence),
            _ => None,
        }
    }
}

/// A stanza: an XML document whose root is `<iq/>`, `<message/>` or
/// `<presence/>` in the `jabber:client` namespace.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Stanza {
    element: Element,
}

impl Stanza {
    /// The stanza kind.
    pub fn kind(&self) -> StanzaKind {
        StanzaKind::from_name(self.element.name()).expect("checked at construction")
    }

    /// The `id` attribute.
    pub fn id(&self) -> Option<&str> {
        self.element.attr("id")
    }

    /// The `from` attribute.
    pub fn from(&self) -> Option<&str> {
        self.element.attr("from")
    }

    /// The `to` attribute.
    pub fn to(&self) -> Option<&str> {
        self.element.attr("to")
    }

    /// The `type` attribute.
    pub fn type_(&self) -> Option<&str> {
        self.element.attr("type")
    }

    /// For an `<iq/>`, its payload: the first child element, whose name and
    /// namespace define the request.
    pub fn iq_payload(&self) -> Option<&Element> {
        match self.kind() {
            StanzaKind::Iq => self.element.children().next(),
            _ => None,
        }
    }

    /// Assigns a random id if none is set, and returns the id.
    pub fn ensure_id(&mut self) -> &str {
        if self.element.attr("id").is_none() {
            self.element.set_attr("id", make_id());
        }
        self.element.attr("id").expect("id was just set")
    }

    /// Derives the result template of this stanza: same kind, `from` and
    /// `to` swapped, `type` set to `result`, same id, empty body.
    pub fn make_result(&self) -> Stanza {
        let element = Element::builder(self.element.name(), ns::CLIENT)
            .attr("from", self.to())
            .attr("to", self.from())
            .attr("id", self.id())
            .attr("type", "result")
            .build();
        Stanza { element }
    }

    /// A borrow of the underlying document.
    pub fn element(&self) -> &Element {
        &self.element
    }

    /// Unwraps into the underlying document.
    pub fn into_element(self) -> Element {
        self.element
    }
}

impl TryFrom<Element> for Stanza {
    type Error = Element;

    /// Wraps a document, handing it back if its root is not a stanza.
    fn try_from(element: Element) -> Result<Stanza, Element> {
        if element.has_ns(ns::CLIENT) && StanzaKind::from_name(element.name()).is_some() {
            Ok(Stanza { element })
        } else {
            Err(element)
        }
    }
}

impl From<Stanza> for Element {
    fn from(stanza: Stanza) -> Element {
        stanza.element
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iq() -> Element {
        Element::builder("iq", ns::CLIENT)
            .attr("from", "romeo@example.net/orchard")
            .attr("to", "juliet@example.com/balcony")
            .attr("id", "probe-1")
            .attr("type", "get")
            .append(
                Element::builder("ping", "urn:xmpp:ping").build(),
            )
            .build()
    }

    #[test]
    fn wraps_stanzas_only() {
        assert!(Stanza::try_from(iq()).is_ok());
        assert!(Stanza::try_from(
            Element::builder("message", ns::CLIENT).build()
        )
        .is_ok());
        assert!(Stanza::try_from(
            Element::builder("presence", ns::CLIENT).build()
        )
        .is_ok());

        let open = Element::builder("open", ns::FRAMING).build();
        assert!(Stanza::try_from(open).is_err());
        let foreign = Element::builder("iq", "jabber:server").build();
        assert!(Stanza::try_from(foreign).is_err());
    }

    #[test]
    fn accessors() {
        let stanza = Stanza::try_from(iq()).unwrap();
        assert_eq!(stanza.kind(), StanzaKind::Iq);
        assert_eq!(stanza.id(), Some("probe-1"));
        assert_eq!(stanza.from(), Some("romeo@example.net/orchard"));
        assert_eq!(stanza.to(), Some("juliet@example.com/balcony"));
        assert_eq!(stanza.type_(), Some("get"));
        let payload = stanza.iq_payload().unwrap();
        assert!(payload.is("ping", "urn:xmpp:ping"));
    }

    #[test]
    fn result_template() {
        let stanza = Stanza::try_from(iq()).unwrap();
        let result = stanza.make_result();
        assert_eq!(result.kind(), StanzaKind::Iq);
        assert_eq!(result.from(), Some("juliet@example.com/balcony"));
        assert_eq!(result.to(), Some("romeo@example.net/orchard"));
        assert_eq!(result.id(), Some("probe-1"));
        assert_eq!(result.type_(), Some("result"));
        assert_eq!(result.iq_payload(), None);
    }

    #[test]
    fn ensure_id_is_sticky() {
        let mut stanza =
            Stanza::try_from(Element::builder("message", ns::CLIENT).build()).unwrap();
        assert_eq!(stanza.id(), None);
        let id = stanza.ensure_id().to_owned();
        assert!(!id.is_empty());
        assert_eq!(stanza.ensure_id(), id);
    }
}
