// Copyright (c) 2025 skald contributors
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Namespace constants of the XMPP core.

/// RFC 7395 stream framing: `<open/>` and `<close/>`.
pub const FRAMING: &str = "urn:ietf:params:xml:ns:xmpp-framing";

/// Stream-level elements: `<features/>` and `<error/>`.
pub const STREAM: &str = "http://etherx.jabber.org/streams";

/// Stream error defined-conditions and `<text/>`.
pub const STREAM_ERRORS: &str = "urn:ietf:params:xml:ns:xmpp-streams";

/// Client stanzas: `<iq/>`, `<message/>` and `<presence/>`.
pub const CLIENT: &str = "jabber:client";

/// StartTLS negotiation.
pub const TLS: &str = "urn:ietf:params:xml:ns:xmpp-tls";

/// SASL negotiation.
pub const SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";

/// Resource binding.
pub const BIND: &str = "urn:ietf:params:xml:ns:xmpp-bind";

/// XEP-0198 stream management advertisement.
pub const SM: &str = "urn:xmpp:sm:3";

/// RFC 6121 roster versioning advertisement.
pub const ROSTER_VER: &str = "urn:xmpp:features:rosterver";

/// RFC 6121 pre-approved subscriptions advertisement.
pub const PRE_APPROVAL: &str = "urn:xmpp:features:pre-approval";
