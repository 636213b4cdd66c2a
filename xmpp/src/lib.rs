// Copyright (c) 2025 skald contributors
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The skald XMPP client core.
//!
//! This crate takes a freshly opened bidirectional channel to an XMPP
//! server and drives it through stream opening, feature negotiation
//! (StartTLS, SASL, resource binding), steady-state stanza exchange and
//! orderly shutdown. It is built around three subsystems:
//!
//! - a full-duplex [`Pipeline`] routing XML documents through an ordered,
//!   dynamically mutable chain of [`Pipe`]s,
//! - the [`HandshakerPipe`], a pipe holding the stream negotiation state
//!   machine,
//! - the [`Session`], which owns the pipeline and a transport and exposes
//!   login, disconnect and the stanza streams.
//!
//! Concrete transports (TCP, WebSocket) are external collaborators
//! implementing the [`Connector`] and [`Transport`] traits; XML documents
//! are [`minidom::Element`]s. Wire framing follows RFC 7395 (`<open/>` and
//! `<close/>` in the framing namespace), so a transport only ever hands
//! over complete top-level elements.

#![deny(unsafe_code, missing_docs, bare_trait_objects)]

pub use jid;
pub use minidom;
pub use sasl;

pub mod error;
mod feature;
mod handshaker;
pub mod ns;
mod pipeline;
mod session;
mod stanza;
mod stream_error;

#[doc(inline)]
pub use crate::error::Error;
pub use crate::feature::StreamFeature;
pub use crate::handshaker::{HandshakeState, HandshakerConfig, HandshakerPipe};
pub use crate::pipeline::{
    BlankPipe, Direction, MutationReceipt, Object, Pipe, PipeError, Pipeline, PipelineError,
    PipelineEvent, PipelineHandle, PipelineState,
};
pub use crate::session::{
    Connector, Session, SessionCommand, SessionConfig, SessionEvent, SessionState, Transport,
    TransportHandle, HANDSHAKER_PIPE,
};
pub use crate::stanza::{Stanza, StanzaKind};
pub use crate::stream_error::{Condition, StreamError};

#[cfg(test)]
mod tests {
    #[test]
    fn reexports() {
        #[allow(unused_imports)]
        use crate::jid;
        #[allow(unused_imports)]
        use crate::minidom;
        #[allow(unused_imports)]
        use crate::sasl;
    }
}
