// Copyright (c) 2025 skald contributors
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Negotiable stream features advertised in `<stream:features/>`.

use crate::ns;

/// A stream feature this library recognizes.
///
/// A feature is identified by the `(namespace, local name)` of its
/// advertisement element. Mandatory features must all be negotiated before
/// the handshake completes; informational features require no negotiation
/// and are recorded as soon as they are advertised.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StreamFeature {
    /// TLS on the existing connection, RFC 6120 §5.
    StartTls,
    /// SASL authentication, RFC 6120 §6.
    Sasl,
    /// Resource binding, RFC 6120 §7.
    ResourceBinding,
    /// Stream management availability, XEP-0198.
    StreamManagement,
    /// Roster versioning availability, RFC 6121 §2.6.
    RosterVersioning,
    /// Pre-approved presence subscriptions, RFC 6121 §3.4.
    PreApprovedSubscriptions,
}

impl StreamFeature {
    /// The fixed order in which negotiable features are attempted.
    pub const NEGOTIATION_ORDER: [StreamFeature; 3] = [
        StreamFeature::StartTls,
        StreamFeature::Sasl,
        StreamFeature::ResourceBinding,
    ];

    const ALL: [StreamFeature; 6] = [
        StreamFeature::StartTls,
        StreamFeature::Sasl,
        StreamFeature::ResourceBinding,
        StreamFeature::StreamManagement,
        StreamFeature::RosterVersioning,
        StreamFeature::PreApprovedSubscriptions,
    ];

    /// The namespace of the advertisement element.
    pub fn namespace(&self) -> &'static str {
        match self {
            StreamFeature::StartTls => ns::TLS,
            StreamFeature::Sasl => ns::SASL,
            StreamFeature::ResourceBinding => ns::BIND,
            StreamFeature::StreamManagement => ns::SM,
            StreamFeature::RosterVersioning => ns::ROSTER_VER,
            StreamFeature::PreApprovedSubscriptions => ns::PRE_APPROVAL,
        }
    }

    /// The local name of the advertisement element.
    pub fn local_name(&self) -> &'static str {
        match self {
            StreamFeature::StartTls => "starttls",
            StreamFeature::Sasl => "mechanisms",
            StreamFeature::ResourceBinding => "bind",
            StreamFeature::StreamManagement => "sm",
            StreamFeature::RosterVersioning => "ver",
            StreamFeature::PreApprovedSubscriptions => "sub",
        }
    }

    /// Whether the handshake must negotiate this feature when advertised.
    pub fn mandatory(&self) -> bool {
        matches!(
            self,
            StreamFeature::StartTls | StreamFeature::Sasl | StreamFeature::ResourceBinding
        )
    }

    /// Whether this feature is purely informational.
    pub fn informational(&self) -> bool {
        !self.mandatory()
    }

    /// Looks a feature up by the identity of its advertisement element.
    pub fn lookup(namespace: &str, local_name: &str) -> Option<StreamFeature> {
        StreamFeature::ALL
            .iter()
            .copied()
            .find(|f| f.namespace() == namespace && f.local_name() == local_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_by_identity() {
        assert_eq!(
            StreamFeature::lookup(ns::TLS, "starttls"),
            Some(StreamFeature::StartTls)
        );
        assert_eq!(
            StreamFeature::lookup(ns::SASL, "mechanisms"),
            Some(StreamFeature::Sasl)
        );
        assert_eq!(
            StreamFeature::lookup(ns::BIND, "bind"),
            Some(StreamFeature::ResourceBinding)
        );
        assert_eq!(StreamFeature::lookup(ns::SASL, "starttls"), None);
    }

    #[test]
    fn starttls_is_attempted_before_sasl() {
        let order = StreamFeature::NEGOTIATION_ORDER;
        let starttls = order.iter().position(|f| *f == StreamFeature::StartTls);
        let sasl = order.iter().position(|f| *f == StreamFeature::Sasl);
        let bind = order.iter().position(|f| *f == StreamFeature::ResourceBinding);
        assert!(starttls < sasl && sasl < bind);
    }

    #[test]
    fn informational_features_are_not_mandatory() {
        for feature in StreamFeature::ALL {
            assert_ne!(feature.mandatory(), feature.informational());
        }
        assert!(StreamFeature::StreamManagement.informational());
        assert!(!StreamFeature::Sasl.informational());
    }
}
