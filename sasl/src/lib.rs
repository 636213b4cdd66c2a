// Copyright (c) 2025 skald contributors
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

#![deny(missing_docs)]

//! SCRAM authentication (RFC 5802) for both the client and the server role.
//!
//! The [`common::scram`] module holds the stateless cryptographic kernel; the
//! [`client`] and [`server`] modules hold the stateful SASL parties driving
//! the message exchange. Channel binding is not supported: the client always
//! sends the `n,,` gs2 header and the server requires it.
//!
//! Credentials are pulled on demand through a [`common::CredentialRetriever`],
//! which lets callers supply either a plaintext password or a previously
//! derived `(salt, salted password, iteration count)` triple.

pub mod client;
pub mod common;
pub mod error;
pub mod server;

pub use crate::common::{Credential, CredentialKey, CredentialRetriever, NegotiatedProperties};
pub use crate::error::AuthenticationError;
