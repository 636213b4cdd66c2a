// Copyright (c) 2025 skald contributors
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The stateless SCRAM kernel: digests, key derivation and message
//! assembly, shared by the client and the server party.

use base64::{engine::general_purpose::STANDARD as Base64, Engine};
use getrandom::getrandom;
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2;
use sha1::{Digest, Sha1 as Sha1Hash};
use sha2::Sha256 as Sha256Hash;

use crate::common::{saslname_escape, xor};
use crate::error::AuthenticationError;

/// A digest family usable with SCRAM.
pub trait ScramDigest {
    /// The hash name as it appears in the mechanism name, e.g. `SHA-1`.
    const NAME: &'static str;

    /// The digest output length in octets.
    const OUTPUT_LEN: usize;

    /// Hashes `data` with the digest.
    fn hash(data: &[u8]) -> Vec<u8>;

    /// Computes `HMAC(key, data)` with the digest.
    fn hmac(key: &[u8], data: &[u8]) -> Vec<u8>;

    /// Iterated salted hashing, equivalent to PBKDF2 with this digest's
    /// HMAC; the output length equals the digest length.
    fn derive(password: &[u8], salt: &[u8], iterations: u32) -> Vec<u8>;
}

/// SCRAM-SHA-1.
pub struct Sha1;

impl ScramDigest for Sha1 {
    const NAME: &'static str = "SHA-1";
    const OUTPUT_LEN: usize = 20;

    fn hash(data: &[u8]) -> Vec<u8> {
        Sha1Hash::digest(data).to_vec()
    }

    fn hmac(key: &[u8], data: &[u8]) -> Vec<u8> {
        let mut mac =
            Hmac::<Sha1Hash>::new_from_slice(key).expect("HMAC can take key of any size");
        mac.update(data);
        mac.finalize().into_bytes().to_vec()
    }

    fn derive(password: &[u8], salt: &[u8], iterations: u32) -> Vec<u8> {
        let mut out = vec![0u8; Self::OUTPUT_LEN];
        let _ = pbkdf2::<Hmac<Sha1Hash>>(password, salt, iterations, &mut out);
        out
    }
}

/// SCRAM-SHA-256.
pub struct Sha256;

impl ScramDigest for Sha256 {
    const NAME: &'static str = "SHA-256";
    const OUTPUT_LEN: usize = 32;

    fn hash(data: &[u8]) -> Vec<u8> {
        Sha256Hash::digest(data).to_vec()
    }

    fn hmac(key: &[u8], data: &[u8]) -> Vec<u8> {
        let mut mac =
            Hmac::<Sha256Hash>::new_from_slice(key).expect("HMAC can take key of any size");
        mac.update(data);
        mac.finalize().into_bytes().to_vec()
    }

    fn derive(password: &[u8], salt: &[u8], iterations: u32) -> Vec<u8> {
        let mut out = vec![0u8; Self::OUTPUT_LEN];
        let _ = pbkdf2::<Hmac<Sha256Hash>>(password, salt, iterations, &mut out);
        out
    }
}

/// The mechanism name for a digest, e.g. `SCRAM-SHA-1`.
pub fn mechanism_name<D: ScramDigest>() -> String {
    format!("SCRAM-{}", D::NAME)
}

/// Generates a nonce of 16 base64 characters (12 random octets).
pub fn generate_nonce() -> Result<String, AuthenticationError> {
    let mut data = [0u8; 12];
    getrandom(&mut data).map_err(|_| AuthenticationError::NonceGeneration)?;
    Ok(Base64.encode(data))
}

/// Generates the 8-octet salt a server uses when it has no stored one.
pub fn generate_salt() -> Result<Vec<u8>, AuthenticationError> {
    let mut data = vec![0u8; 8];
    getrandom(&mut data).map_err(|_| AuthenticationError::NonceGeneration)?;
    Ok(data)
}

/// `SaltedPassword := Hi(password, salt, i)`.
pub fn salted_password<D: ScramDigest>(password: &str, salt: &[u8], iterations: u32) -> Vec<u8> {
    D::derive(password.as_bytes(), salt, iterations)
}

/// `ClientKey := HMAC(SaltedPassword, "Client Key")`.
pub fn client_key<D: ScramDigest>(salted_password: &[u8]) -> Vec<u8> {
    D::hmac(salted_password, b"Client Key")
}

/// `ServerKey := HMAC(SaltedPassword, "Server Key")`.
pub fn server_key<D: ScramDigest>(salted_password: &[u8]) -> Vec<u8> {
    D::hmac(salted_password, b"Server Key")
}

/// `StoredKey := H(ClientKey)`.
pub fn stored_key<D: ScramDigest>(client_key: &[u8]) -> Vec<u8> {
    D::hash(client_key)
}

/// `ClientSignature := HMAC(StoredKey, AuthMessage)`.
pub fn client_signature<D: ScramDigest>(stored_key: &[u8], auth_message: &[u8]) -> Vec<u8> {
    D::hmac(stored_key, auth_message)
}

/// `ServerSignature := HMAC(ServerKey, AuthMessage)`.
pub fn server_signature<D: ScramDigest>(server_key: &[u8], auth_message: &[u8]) -> Vec<u8> {
    D::hmac(server_key, auth_message)
}

/// `ClientProof := ClientKey XOR ClientSignature`.
pub fn client_proof(client_key: &[u8], client_signature: &[u8]) -> Vec<u8> {
    xor(client_key, client_signature)
}

/// Assembles the canonical `AuthMessage`:
/// `client-first-bare , server-first , client-final-without-proof`.
///
/// The three messages are reconstructed from their parts, with the
/// authentication id escaped the way it was transmitted.
pub fn auth_message(
    authn_id: &str,
    client_nonce: &str,
    full_nonce: &str,
    salt: &[u8],
    iterations: u32,
    gs2_header: &[u8],
) -> Vec<u8> {
    let mut message = Vec::new();
    message.extend(b"n=");
    message.extend(saslname_escape(authn_id).bytes());
    message.extend(b",r=");
    message.extend(client_nonce.bytes());
    message.extend(b",r=");
    message.extend(full_nonce.bytes());
    message.extend(b",s=");
    message.extend(Base64.encode(salt).bytes());
    message.extend(b",i=");
    message.extend(iterations.to_string().bytes());
    message.extend(b",c=");
    message.extend(Base64.encode(gs2_header).bytes());
    message.extend(b",r=");
    message.extend(full_nonce.bytes());
    message
}

#[cfg(test)]
mod tests {
    use super::*;

    // Values from the RFC 5802 example exchange.
    const PASSWORD: &str = "pencil";
    const SALT_B64: &str = "QSXCR+Q6sek8bf92";
    const CLIENT_NONCE: &str = "fyko+d2lbbFgONRv9qkxdawL";
    const FULL_NONCE: &str = "fyko+d2lbbFgONRv9qkxdawL3rfcNHYJY1ZVvWVs7j";

    fn salt() -> Vec<u8> {
        Base64.decode(SALT_B64).unwrap()
    }

    #[test]
    fn auth_message_matches_rfc_exchange() {
        let message = auth_message("user", CLIENT_NONCE, FULL_NONCE, &salt(), 4096, b"n,,");
        assert_eq!(
            std::str::from_utf8(&message).unwrap(),
            "n=user,r=fyko+d2lbbFgONRv9qkxdawL,\
             r=fyko+d2lbbFgONRv9qkxdawL3rfcNHYJY1ZVvWVs7j,s=QSXCR+Q6sek8bf92,i=4096,\
             c=biws,r=fyko+d2lbbFgONRv9qkxdawL3rfcNHYJY1ZVvWVs7j"
        );
    }

    #[test]
    fn sha1_proof_and_signature_match_rfc_vector() {
        let sp = salted_password::<Sha1>(PASSWORD, &salt(), 4096);
        let ck = client_key::<Sha1>(&sp);
        let sk = stored_key::<Sha1>(&ck);
        let am = auth_message("user", CLIENT_NONCE, FULL_NONCE, &salt(), 4096, b"n,,");
        let cs = client_signature::<Sha1>(&sk, &am);
        let proof = client_proof(&ck, &cs);
        assert_eq!(Base64.encode(&proof), "v0X8v3Bz2T0CJGbJQyF0X+HI4Ts=");

        let sig = server_signature::<Sha1>(&server_key::<Sha1>(&sp), &am);
        assert_eq!(Base64.encode(&sig), "rmF9pqV8S7suAoZWja4dJRkFsKQ=");
    }

    #[test]
    fn nonce_has_sixteen_base64_chars() {
        let nonce = generate_nonce().unwrap();
        assert_eq!(nonce.len(), 16);
        assert_ne!(nonce, generate_nonce().unwrap());
    }

    #[test]
    fn digest_output_lengths() {
        assert_eq!(Sha1::hash(b"x").len(), Sha1::OUTPUT_LEN);
        assert_eq!(Sha256::hash(b"x").len(), Sha256::OUTPUT_LEN);
        assert_eq!(Sha1::hmac(b"k", b"x").len(), Sha1::OUTPUT_LEN);
        assert_eq!(Sha256::hmac(b"k", b"x").len(), Sha256::OUTPUT_LEN);
    }
}
