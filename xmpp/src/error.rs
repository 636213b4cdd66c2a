// Copyright (c) 2025 skald contributors
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Detailed error types.

use std::error::Error as StdError;
use std::fmt;

use sasl::AuthenticationError;

use crate::stream_error::StreamError;

/// Top-level error type.
#[derive(Clone, Debug)]
pub enum Error {
    /// Error parsing an XMPP address.
    JidParse(jid::InvalidJidSyntax),
    /// Protocol-level error.
    Protocol(ProtocolError),
    /// Authentication error.
    Auth(AuthError),
    /// The peer closed the stream with a stream error.
    StreamErrorReceived(StreamError),
    /// We closed the stream with a stream error.
    StreamErrorSent(StreamError),
    /// Connection closed.
    Disconnected,
    /// Operation invoked in a state it is not valid in.
    InvalidState,
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::JidParse(e) => write!(fmt, "jid parse error: {}", e),
            Error::Protocol(e) => write!(fmt, "protocol error: {}", e),
            Error::Auth(e) => write!(fmt, "authentication error: {}", e),
            Error::StreamErrorReceived(e) => write!(fmt, "received stream error: {}", e),
            Error::StreamErrorSent(e) => write!(fmt, "sent stream error: {}", e),
            Error::Disconnected => write!(fmt, "disconnected"),
            Error::InvalidState => write!(fmt, "invalid state"),
        }
    }
}

impl StdError for Error {}

impl From<jid::InvalidJidSyntax> for Error {
    fn from(e: jid::InvalidJidSyntax) -> Self {
        Error::JidParse(e)
    }
}

impl From<ProtocolError> for Error {
    fn from(e: ProtocolError) -> Self {
        Error::Protocol(e)
    }
}

impl From<AuthError> for Error {
    fn from(e: AuthError) -> Self {
        Error::Auth(e)
    }
}

/// XMPP protocol-level error.
#[derive(Clone, Debug)]
pub enum ProtocolError {
    /// Invalid response to resource binding.
    InvalidBindResponse,
    /// The peer answered the stream opener with an unsupported version.
    UnsupportedVersion(Option<String>),
    /// The `from` of the stream opener does not match the expected domain.
    WrongFrom(String),
    /// The peer refused to start TLS.
    TlsNegotiationFailed,
    /// Resource binding failed with a stanza error, named by its condition.
    BindFailure(String),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ProtocolError::InvalidBindResponse => {
                write!(fmt, "invalid response to resource binding")
            }
            ProtocolError::UnsupportedVersion(version) => match version {
                Some(version) => write!(fmt, "unsupported stream version {}", version),
                None => write!(fmt, "stream opener carries no version"),
            },
            ProtocolError::WrongFrom(from) => {
                write!(fmt, "stream opener from unexpected peer {}", from)
            }
            ProtocolError::TlsNegotiationFailed => write!(fmt, "the peer refused to start TLS"),
            ProtocolError::BindFailure(condition) => {
                write!(fmt, "resource binding failed: {}", condition)
            }
        }
    }
}

impl StdError for ProtocolError {}

/// Authentication error.
#[derive(Clone, Debug)]
pub enum AuthError {
    /// No matching SASL mechanism available.
    NoMechanism,
    /// Local SASL party error.
    Sasl(AuthenticationError),
    /// Failure reported by the server, with the defined-condition name.
    Fail(String),
}

impl StdError for AuthError {}

impl fmt::Display for AuthError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AuthError::NoMechanism => write!(fmt, "no matching SASL mechanism available"),
            AuthError::Sasl(e) => write!(fmt, "local SASL party error: {}", e),
            AuthError::Fail(condition) => write!(fmt, "failure from the server: {}", condition),
        }
    }
}

impl From<AuthenticationError> for AuthError {
    fn from(e: AuthenticationError) -> Self {
        AuthError::Sasl(e)
    }
}

impl From<AuthenticationError> for Error {
    fn from(e: AuthenticationError) -> Self {
        Error::Auth(AuthError::Sasl(e))
    }
}
