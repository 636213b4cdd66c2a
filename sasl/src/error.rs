// Copyright (c) 2025 skald contributors
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Error types produced by a SASL exchange.

use std::error::Error as StdError;
use std::fmt;

/// An error raised while authenticating, by either party.
///
/// Once a party has recorded one of these it is completed; the exchange
/// cannot be resumed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthenticationError {
    /// The peer sent a message that cannot be decoded, lacks a required
    /// field, carries an unsupported gs2 channel-binding flag, or announces
    /// a mandatory extension we do not know.
    MalformedRequest(String),

    /// The server nonce does not begin with the client nonce.
    ServerNonceMismatch,

    /// The `v=` value of the server-final message does not match the
    /// expected server signature.
    ServerSignatureMismatch,

    /// The nonce of the client-final message does not match the full nonce
    /// sent in the server-first message.
    ClientNonceMismatch,

    /// The channel-binding field of the client-final message does not match
    /// the gs2 header of the client-first message.
    ChannelBindingMismatch,

    /// The client proof did not verify against the stored key.
    InvalidProof,

    /// The credential retriever provided neither a salted password nor a
    /// plaintext password for the authenticating identity.
    CredentialsNotFound,

    /// The server reported failure in its final message (`e=` value).
    ServerReported(String),

    /// A party method was invoked in a state it is not valid in.
    InvalidState,

    /// The platform randomness source failed.
    NonceGeneration,
}

impl AuthenticationError {
    /// The `server-error-value` to put into an `e=` field when the server
    /// reports this failure to the client.
    pub fn server_error_value(&self) -> &'static str {
        match self {
            AuthenticationError::MalformedRequest(_) => "invalid-encoding",
            AuthenticationError::InvalidProof => "invalid-proof",
            AuthenticationError::ChannelBindingMismatch => "channel-bindings-dont-match",
            AuthenticationError::CredentialsNotFound => "unknown-user",
            _ => "other-error",
        }
    }
}

impl StdError for AuthenticationError {}

impl fmt::Display for AuthenticationError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AuthenticationError::MalformedRequest(detail) => {
                write!(fmt, "malformed request: {}", detail)
            }
            AuthenticationError::ServerNonceMismatch => {
                write!(fmt, "server nonce does not extend the client nonce")
            }
            AuthenticationError::ServerSignatureMismatch => {
                write!(fmt, "server signature mismatch")
            }
            AuthenticationError::ClientNonceMismatch => {
                write!(fmt, "client-final nonce does not match the full nonce")
            }
            AuthenticationError::ChannelBindingMismatch => {
                write!(fmt, "channel-binding field does not match the gs2 header")
            }
            AuthenticationError::InvalidProof => write!(fmt, "client proof did not verify"),
            AuthenticationError::CredentialsNotFound => {
                write!(fmt, "no credentials available for this identity")
            }
            AuthenticationError::ServerReported(reason) => {
                write!(fmt, "server reported failure: {}", reason)
            }
            AuthenticationError::InvalidState => write!(fmt, "invalid state for this operation"),
            AuthenticationError::NonceGeneration => write!(fmt, "could not generate a nonce"),
        }
    }
}
