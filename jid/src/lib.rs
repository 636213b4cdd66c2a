// Copyright (c) 2025 skald contributors
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

#![deny(missing_docs)]

//! Provides a type for XMPP addresses, historically called Jabber IDs.
//!
//! For usage, check the documentation on the `Jid` struct.

use core::fmt;
use core::str::FromStr;

use memchr::memchr;

mod error;
pub use crate::error::InvalidJidSyntax;

/// An XMPP address of the form `local@domain/resource`.
///
/// Any of the three parts may be empty; the textual form omits `local@` when
/// the local part is empty and `/resource` when the resource is empty. A
/// `Jid` whose parts are all empty is the *empty Jid*, rendered as the empty
/// string.
///
/// No stringprep or Unicode normalization is applied: the parts compare and
/// hash exactly as supplied.
///
/// # Examples
///
/// ```
/// use skald_jid::Jid;
/// # use skald_jid::InvalidJidSyntax;
///
/// # fn main() -> Result<(), InvalidJidSyntax> {
/// let jid: Jid = "juliet@example.com/balcony".parse()?;
///
/// assert_eq!(jid.local(), "juliet");
/// assert_eq!(jid.domain(), "example.com");
/// assert_eq!(jid.resource(), "balcony");
/// assert_eq!(jid.to_bare().to_string(), "juliet@example.com");
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Jid {
    local: String,
    domain: String,
    resource: String,
}

impl Jid {
    /// Constructs a Jid from its three parts, without validation.
    pub fn new<L, D, R>(local: L, domain: D, resource: R) -> Jid
    where
        L: Into<String>,
        D: Into<String>,
        R: Into<String>,
    {
        Jid {
            local: local.into(),
            domain: domain.into(),
            resource: resource.into(),
        }
    }

    /// Constructs the empty Jid.
    pub fn empty() -> Jid {
        Jid::default()
    }

    /// The local part, empty if absent.
    pub fn local(&self) -> &str {
        &self.local
    }

    /// The domain part, empty if absent.
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// The resource part, empty if absent.
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Whether all three parts are empty.
    pub fn is_empty(&self) -> bool {
        self.local.is_empty() && self.domain.is_empty() && self.resource.is_empty()
    }

    /// Whether the resource part is empty.
    pub fn is_bare(&self) -> bool {
        self.resource.is_empty()
    }

    /// Returns a copy of this Jid with the resource part emptied.
    pub fn to_bare(&self) -> Jid {
        Jid {
            local: self.local.clone(),
            domain: self.domain.clone(),
            resource: String::new(),
        }
    }
}

impl FromStr for Jid {
    type Err = InvalidJidSyntax;

    /// Parses a Jid from its textual form.
    ///
    /// The first `/` separates the resource from the bare Jid; within the
    /// bare Jid, the first `@` separates the local part from the domain.
    /// Whitespace-only input yields the empty Jid. A leading `@`, or a
    /// separator that leaves the domain empty next to a non-empty local part
    /// or a resource marker, is a syntax error.
    fn from_str(s: &str) -> Result<Jid, InvalidJidSyntax> {
        if s.trim().is_empty() {
            return Ok(Jid::empty());
        }
        let bytes = s.as_bytes();
        let (bare, resource, slash) = match memchr(b'/', bytes) {
            Some(pos) => (&s[..pos], &s[pos + 1..], true),
            None => (s, "", false),
        };
        let (local, domain, at) = match memchr(b'@', bare.as_bytes()) {
            Some(pos) => (&bare[..pos], &bare[pos + 1..], true),
            None => ("", bare, false),
        };
        if at && local.is_empty() {
            return Err(InvalidJidSyntax::EmptyLocal);
        }
        if domain.is_empty() && (at || slash || !local.is_empty() || !resource.is_empty()) {
            return Err(InvalidJidSyntax::EmptyDomain);
        }
        Ok(Jid::new(local, domain, resource))
    }
}

impl TryFrom<&str> for Jid {
    type Error = InvalidJidSyntax;

    fn try_from(s: &str) -> Result<Jid, InvalidJidSyntax> {
        s.parse()
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        if !self.local.is_empty() {
            write!(fmt, "{}@", self.local)?;
        }
        fmt.write_str(&self.domain)?;
        if !self.resource.is_empty() {
            write!(fmt, "/{}", self.resource)?;
        }
        Ok(())
    }
}

impl From<Jid> for String {
    fn from(jid: Jid) -> String {
        jid.to_string()
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for Jid {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

#[cfg(feature = "serde")]
impl<'de> serde::Deserialize<'de> for Jid {
    fn deserialize<D>(deserializer: D) -> Result<Jid, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = <String as serde::Deserialize>::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_jid() {
        let jid: Jid = "juliet@example.com/balcony".parse().unwrap();
        assert_eq!(jid.local(), "juliet");
        assert_eq!(jid.domain(), "example.com");
        assert_eq!(jid.resource(), "balcony");
        assert_eq!(jid.to_string(), "juliet@example.com/balcony");
        assert!(!jid.is_bare());
    }

    #[test]
    fn domain_only() {
        let jid: Jid = "example.com".parse().unwrap();
        assert_eq!(jid, Jid::new("", "example.com", ""));
        assert_eq!(jid.to_string(), "example.com");
        assert!(jid.is_bare());
    }

    #[test]
    fn bare_jid() {
        let jid: Jid = "juliet@example.com".parse().unwrap();
        assert_eq!(jid, Jid::new("juliet", "example.com", ""));
        assert_eq!(jid.to_string(), "juliet@example.com");
    }

    #[test]
    fn domain_and_resource() {
        let jid: Jid = "example.com/mirror".parse().unwrap();
        assert_eq!(jid, Jid::new("", "example.com", "mirror"));
        assert_eq!(jid.to_string(), "example.com/mirror");
    }

    #[test]
    fn invalid_jids() {
        assert_eq!(
            "@example.com".parse::<Jid>(),
            Err(InvalidJidSyntax::EmptyLocal)
        );
        assert_eq!("@".parse::<Jid>(), Err(InvalidJidSyntax::EmptyLocal));
        assert_eq!("/".parse::<Jid>(), Err(InvalidJidSyntax::EmptyDomain));
        assert_eq!("/balcony".parse::<Jid>(), Err(InvalidJidSyntax::EmptyDomain));
        assert_eq!("juliet@".parse::<Jid>(), Err(InvalidJidSyntax::EmptyDomain));
        assert_eq!("juliet@/balcony".parse::<Jid>(), Err(InvalidJidSyntax::EmptyDomain));
    }

    #[test]
    fn whitespace_only_is_empty() {
        assert_eq!("".parse::<Jid>().unwrap(), Jid::empty());
        assert_eq!("   ".parse::<Jid>().unwrap(), Jid::empty());
        assert_eq!("\t\n".parse::<Jid>().unwrap(), Jid::empty());
        assert!("  ".parse::<Jid>().unwrap().is_empty());
        assert_eq!(Jid::empty().to_string(), "");
    }

    #[test]
    fn resource_may_contain_separators() {
        // Only the first separator of each kind splits.
        let jid: Jid = "juliet@example.com/home@night/stage".parse().unwrap();
        assert_eq!(jid.local(), "juliet");
        assert_eq!(jid.domain(), "example.com");
        assert_eq!(jid.resource(), "home@night/stage");
    }

    #[test]
    fn to_bare_zeroes_resource() {
        let jid: Jid = "juliet@example.com/balcony".parse().unwrap();
        let bare = jid.to_bare();
        assert_eq!(bare, Jid::new("juliet", "example.com", ""));
        assert_eq!(bare.to_bare(), bare);
    }

    #[test]
    fn parse_render_roundtrip() {
        for text in [
            "juliet@example.com/balcony",
            "example.com",
            "juliet@example.com",
            "example.com/orchard",
            "",
        ] {
            let jid: Jid = text.parse().unwrap();
            let rendered = jid.to_string();
            assert_eq!(rendered.parse::<Jid>().unwrap(), jid);
        }
    }

    #[test]
    fn construct_render_roundtrip() {
        let jid = Jid::new("romeo", "example.net", "garden");
        assert_eq!(jid.to_string().parse::<Jid>().unwrap(), jid);
        let jid = Jid::new("", "example.net", "");
        assert_eq!(jid.to_string().parse::<Jid>().unwrap(), jid);
    }

    #[test]
    fn equality_is_componentwise() {
        assert_eq!(
            Jid::new("a", "b", "c"),
            "a@b/c".parse::<Jid>().unwrap()
        );
        assert_ne!(Jid::new("a", "b", "c"), Jid::new("a", "b", ""));
        assert_ne!(Jid::new("a", "b", ""), Jid::new("", "b", ""));
    }
}
