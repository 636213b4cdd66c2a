// Copyright (c) 2025 skald contributors
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::error::Error as StdError;
use std::fmt;

/// An error that signifies that a `Jid` cannot be parsed from a string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidJidSyntax {
    /// Happens when the text starts with a `@`, so the local part marker is
    /// present but the local part itself is empty.
    EmptyLocal,

    /// Happens when a `@` or `/` leaves the domain empty while a local part
    /// or resource marker is present, e.g. `user@` or `/balcony`.
    EmptyDomain,
}

impl StdError for InvalidJidSyntax {}

impl fmt::Display for InvalidJidSyntax {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(
            fmt,
            "{}",
            match self {
                InvalidJidSyntax::EmptyLocal => "local part empty despite the presence of a @",
                InvalidJidSyntax::EmptyDomain => "domain empty despite the presence of a @ or /",
            }
        )
    }
}
