// Copyright (c) 2025 skald contributors
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Stream errors as specified in RFC 6120 §4.9.

use core::fmt;
use std::error::Error as StdError;

use minidom::Element;

use crate::ns;

/// The closed set of stream error conditions this library knows.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Condition {
    /// The entity has sent XML that cannot be processed.
    BadFormat,

    /// A new stream conflicts with this one, or a stream header was
    /// repeated on an already negotiated stream.
    Conflict,

    /// The `from` attribute does not match the negotiated identity.
    InvalidFrom,

    /// The entity has sent invalid XML over the stream.
    InvalidXml,

    /// Data was sent before the stream was authorized for it.
    NotAuthorized,

    /// The entity has violated a local service policy.
    PolicyViolation,

    /// The error condition is not one of the defined conditions.
    UndefinedCondition,

    /// A mandatory-to-negotiate feature cannot be satisfied.
    UnsupportedFeature,

    /// A first-level stream child was not understood.
    UnsupportedStanzaType,

    /// The `version` of the stream header is not supported.
    UnsupportedVersion,
}

impl Condition {
    const ALL: [Condition; 10] = [
        Condition::BadFormat,
        Condition::Conflict,
        Condition::InvalidFrom,
        Condition::InvalidXml,
        Condition::NotAuthorized,
        Condition::PolicyViolation,
        Condition::UndefinedCondition,
        Condition::UnsupportedFeature,
        Condition::UnsupportedStanzaType,
        Condition::UnsupportedVersion,
    ];

    /// The element name of this condition.
    pub fn name(&self) -> &'static str {
        match self {
            Condition::BadFormat => "bad-format",
            Condition::Conflict => "conflict",
            Condition::InvalidFrom => "invalid-from",
            Condition::InvalidXml => "invalid-xml",
            Condition::NotAuthorized => "not-authorized",
            Condition::PolicyViolation => "policy-violation",
            Condition::UndefinedCondition => "undefined-condition",
            Condition::UnsupportedFeature => "unsupported-feature",
            Condition::UnsupportedStanzaType => "unsupported-stanza-type",
            Condition::UnsupportedVersion => "unsupported-version",
        }
    }

    /// Looks a condition up by its element name.
    pub fn from_name(name: &str) -> Option<Condition> {
        Condition::ALL.iter().copied().find(|c| c.name() == name)
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A stream error, sent or received as a stream-level `<error/>`.
///
/// Receiving or sending one of these always terminates the stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamError {
    /// The defined condition.
    pub condition: Condition,
    /// Optional human-readable text.
    pub text: Option<String>,
}

impl StreamError {
    /// Creates a stream error without descriptive text.
    pub fn new(condition: Condition) -> StreamError {
        StreamError {
            condition,
            text: None,
        }
    }

    /// Creates a stream error with descriptive text.
    pub fn with_text(condition: Condition, text: impl Into<String>) -> StreamError {
        StreamError {
            condition,
            text: Some(text.into()),
        }
    }

    /// Serializes to a stream-level `<error/>` element.
    pub fn to_element(&self) -> Element {
        let mut builder = Element::builder("error", ns::STREAM)
            .append(Element::builder(self.condition.name(), ns::STREAM_ERRORS).build());
        if let Some(ref text) = self.text {
            builder = builder.append(
                Element::builder("text", ns::STREAM_ERRORS)
                    .append(text.clone())
                    .build(),
            );
        }
        builder.build()
    }
}

impl TryFrom<&Element> for StreamError {
    type Error = crate::Error;

    fn try_from(element: &Element) -> Result<StreamError, crate::Error> {
        if !element.is("error", ns::STREAM) {
            return Err(crate::Error::InvalidState);
        }
        let mut condition = Condition::UndefinedCondition;
        let mut text = None;
        for child in element.children() {
            if !child.has_ns(ns::STREAM_ERRORS) {
                continue;
            }
            if child.name() == "text" {
                text = Some(child.text());
            } else if let Some(known) = Condition::from_name(child.name()) {
                condition = known;
            }
        }
        Ok(StreamError { condition, text })
    }
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        <Condition as fmt::Display>::fmt(&self.condition, f)?;
        if let Some(ref text) = self.text {
            write!(f, " ({:?})", text)?;
        }
        Ok(())
    }
}

impl StdError for StreamError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let error = StreamError::with_text(Condition::PolicyViolation, "too many streams");
        let element = error.to_element();
        assert!(element.is("error", ns::STREAM));
        assert_eq!(StreamError::try_from(&element).unwrap(), error);
    }

    #[test]
    fn parse_without_text() {
        let element: Element = format!(
            "<stream:error xmlns:stream='{}'><conflict xmlns='{}'/></stream:error>",
            ns::STREAM,
            ns::STREAM_ERRORS
        )
        .parse()
        .unwrap();
        let error = StreamError::try_from(&element).unwrap();
        assert_eq!(error.condition, Condition::Conflict);
        assert_eq!(error.text, None);
    }

    #[test]
    fn unknown_condition_becomes_undefined() {
        let element: Element = format!(
            "<error xmlns='{}'><beyond-standard xmlns='{}'/></error>",
            ns::STREAM,
            ns::STREAM_ERRORS
        )
        .parse()
        .unwrap();
        let error = StreamError::try_from(&element).unwrap();
        assert_eq!(error.condition, Condition::UndefinedCondition);
    }

    #[test]
    fn condition_names_roundtrip() {
        for condition in Condition::ALL {
            assert_eq!(Condition::from_name(condition.name()), Some(condition));
        }
        assert_eq!(Condition::from_name("made-up"), None);
    }
}
