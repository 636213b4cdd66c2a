// Copyright (c) 2025 skald contributors
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Pieces shared between the client and the server party.

use std::collections::HashMap;

use crate::error::AuthenticationError;

pub mod scram;

/// The kind of credential a party asks its retriever for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CredentialKey {
    /// The plaintext password.
    Password,
    /// A password already salted with [`CredentialKey::Salt`] and
    /// [`CredentialKey::Iteration`].
    SaltedPassword,
    /// The salt belonging to the stored salted password.
    Salt,
    /// The iteration count belonging to the stored salted password.
    Iteration,
}

/// A credential produced by a [`CredentialRetriever`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Credential {
    /// A plaintext password.
    Password(String),
    /// A salted password.
    SaltedPassword(Vec<u8>),
    /// A salt.
    Salt(Vec<u8>),
    /// An iteration count.
    Iteration(u32),
}

/// Source of credentials for a SASL party.
///
/// A party queries this by `(authentication id, mechanism name, key)` and
/// treats `None` as "not stored". Every closure with the matching signature
/// is a retriever.
pub trait CredentialRetriever: Send + Sync {
    /// Looks up one credential; `None` if it is not stored.
    fn retrieve(&self, authn_id: &str, mechanism: &str, key: CredentialKey) -> Option<Credential>;
}

impl<F> CredentialRetriever for F
where
    F: Fn(&str, &str, CredentialKey) -> Option<Credential> + Send + Sync,
{
    fn retrieve(&self, authn_id: &str, mechanism: &str, key: CredentialKey) -> Option<Credential> {
        self(authn_id, mechanism, key)
    }
}

/// Parameters fixed by a successful SCRAM exchange.
///
/// Callers may cache these and hand them back through a
/// [`CredentialRetriever`] later, so that the plaintext password does not
/// need to be retained.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NegotiatedProperties {
    /// The salt used to derive the salted password.
    pub salt: Vec<u8>,
    /// The derived salted password.
    pub salted_password: Vec<u8>,
    /// The iteration count used for the derivation.
    pub iterations: u32,
}

/// XORs two equal-length byte strings.
pub fn xor(a: &[u8], b: &[u8]) -> Vec<u8> {
    debug_assert_eq!(a.len(), b.len());
    a.iter().zip(b).map(|(a, b)| a ^ b).collect()
}

/// Compares two byte strings without short-circuiting on the first
/// difference.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (a, b)| acc | (a ^ b)) == 0
}

/// Escapes an authentication or authorization id for use in a SCRAM
/// message: `,` becomes `=2C` and `=` becomes `=3D`.
pub fn saslname_escape(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        match c {
            ',' => out.push_str("=2C"),
            '=' => out.push_str("=3D"),
            c => out.push(c),
        }
    }
    out
}

/// Reverses [`saslname_escape`]. Any `=` not followed by `2C` or `3D` is a
/// malformed request.
pub fn saslname_decode(name: &str) -> Result<String, AuthenticationError> {
    let mut out = String::with_capacity(name.len());
    let mut rest = name;
    while let Some(pos) = rest.find('=') {
        out.push_str(&rest[..pos]);
        match rest.get(pos + 1..pos + 3) {
            Some("2C") => out.push(','),
            Some("3D") => out.push('='),
            _ => {
                return Err(AuthenticationError::MalformedRequest(format!(
                    "invalid escape sequence in saslname `{}`",
                    name
                )))
            }
        }
        rest = &rest[pos + 3..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Decodes the `key=value` fields of a SCRAM message into a map.
///
/// Fields split on the *first* `=` only. The caller must have stripped any
/// gs2 header beforehand (see [`strip_gs2_header`]).
pub fn parse_fields(message: &[u8]) -> Result<HashMap<String, String>, AuthenticationError> {
    let message = std::str::from_utf8(message)
        .map_err(|_| AuthenticationError::MalformedRequest("message is not UTF-8".to_owned()))?;
    let mut fields = HashMap::new();
    for part in message.split(',') {
        match part.split_once('=') {
            Some((key, value)) => {
                fields.insert(key.to_owned(), value.to_owned());
            }
            None => {
                return Err(AuthenticationError::MalformedRequest(format!(
                    "field `{}` has no value",
                    part
                )))
            }
        }
    }
    Ok(fields)
}

/// Splits a client-first message into its gs2 header (flag and authzid
/// field, including the trailing `,`) and the bare remainder.
///
/// The first field must be the channel-binding flag `n`, `y` or `p=…`; the
/// second is the (possibly empty) `a=` authorization field.
pub fn strip_gs2_header(message: &[u8]) -> Result<(&[u8], &[u8]), AuthenticationError> {
    let mut commas = message
        .iter()
        .enumerate()
        .filter(|(_, &b)| b == b',')
        .map(|(idx, _)| idx);
    let first = commas.next();
    let second = commas.next();
    match (message.first(), first, second) {
        (Some(b'n') | Some(b'y'), Some(1), Some(end)) | (Some(b'p'), Some(_), Some(end)) => {
            Ok((&message[..end + 1], &message[end + 1..]))
        }
        _ => Err(AuthenticationError::MalformedRequest(
            "missing or invalid gs2 header".to_owned(),
        )),
    }
}
