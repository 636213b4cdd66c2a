// Copyright (c) 2025 skald contributors
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The server side of a SASL exchange.

use std::marker::PhantomData;
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as Base64, Engine};

use crate::common::scram::{
    auth_message, client_key, client_proof, client_signature, generate_nonce, generate_salt,
    mechanism_name, salted_password, server_key, server_signature, stored_key, ScramDigest,
};
use crate::common::{
    constant_time_eq, parse_fields, saslname_decode, strip_gs2_header, Credential, CredentialKey,
    CredentialRetriever, NegotiatedProperties,
};
use crate::error::AuthenticationError;

/// The iteration count used when deriving a fresh salted password.
pub const DEFAULT_ITERATIONS: u32 = 4096;

/// A server-side SASL party.
///
/// Implementations are not thread-safe; drive them from a single task.
pub trait Mechanism: Send {
    /// The mechanism name, e.g. `SCRAM-SHA-1`.
    fn mechanism(&self) -> &str;

    /// Consumes a response received from the client.
    fn accept_response(&mut self, response: &[u8]) -> Result<(), AuthenticationError>;

    /// Produces the next message to send to the client.
    fn challenge(&mut self) -> Result<Vec<u8>, AuthenticationError>;

    /// Whether the exchange has terminated, successfully or not.
    fn is_completed(&self) -> bool;

    /// The error that terminated the exchange, if any.
    fn error(&self) -> Option<&AuthenticationError>;

    /// The authenticated identity, available after success.
    fn identity(&self) -> Option<&str>;

    /// The properties fixed by a successful exchange.
    fn negotiated_properties(&self) -> Option<&NegotiatedProperties>;
}

enum ServerState {
    Initial,
    FirstResponseReceived {
        gs2_header: Vec<u8>,
        client_nonce: String,
    },
    ChallengeSent {
        gs2_header: Vec<u8>,
        client_nonce: String,
        full_nonce: String,
        salted_password: Vec<u8>,
        salt: Vec<u8>,
        iterations: u32,
    },
    FinalResponseReceived {
        server_signature: Vec<u8>,
    },
    Completed,
}

/// A SCRAM server (RFC 5802), without channel binding.
pub struct ScramServer<D: ScramDigest> {
    mechanism: String,
    retriever: Arc<dyn CredentialRetriever>,
    state: ServerState,
    authn_id: Option<String>,
    error: Option<AuthenticationError>,
    properties: Option<NegotiatedProperties>,
    _marker: PhantomData<fn() -> D>,
}

impl<D: ScramDigest> ScramServer<D> {
    /// Creates a server pulling stored credentials from `retriever`.
    pub fn new(retriever: Arc<dyn CredentialRetriever>) -> ScramServer<D> {
        ScramServer {
            mechanism: mechanism_name::<D>(),
            retriever,
            state: ServerState::Initial,
            authn_id: None,
            error: None,
            properties: None,
            _marker: PhantomData,
        }
    }

    fn fail(&mut self, error: AuthenticationError) -> AuthenticationError {
        self.error = Some(error.clone());
        error
    }

    /// Looks up the stored `(salted password, salt, iterations)` triple, or
    /// derives a fresh one from the plaintext password with a random salt.
    fn resolve_credentials(
        &self,
        authn_id: &str,
    ) -> Result<(Vec<u8>, Vec<u8>, u32), AuthenticationError> {
        let stored_salted = match self
            .retriever
            .retrieve(authn_id, &self.mechanism, CredentialKey::SaltedPassword)
        {
            Some(Credential::SaltedPassword(salted)) => Some(salted),
            _ => None,
        };
        let stored_salt = match self
            .retriever
            .retrieve(authn_id, &self.mechanism, CredentialKey::Salt)
        {
            Some(Credential::Salt(salt)) => Some(salt),
            _ => None,
        };
        let stored_iterations = match self
            .retriever
            .retrieve(authn_id, &self.mechanism, CredentialKey::Iteration)
        {
            Some(Credential::Iteration(iterations)) => Some(iterations),
            _ => None,
        };
        if let (Some(salted), Some(salt), Some(iterations)) =
            (stored_salted, stored_salt, stored_iterations)
        {
            return Ok((salted, salt, iterations));
        }
        match self
            .retriever
            .retrieve(authn_id, &self.mechanism, CredentialKey::Password)
        {
            Some(Credential::Password(password)) => {
                let salt = generate_salt()?;
                let salted = salted_password::<D>(&password, &salt, DEFAULT_ITERATIONS);
                Ok((salted, salt, DEFAULT_ITERATIONS))
            }
            _ => Err(AuthenticationError::CredentialsNotFound),
        }
    }

    fn accept_client_first(&mut self, response: &[u8]) -> Result<(), AuthenticationError> {
        let (gs2_header, bare) = strip_gs2_header(response)?;
        if gs2_header[0] != b'n' {
            return Err(AuthenticationError::MalformedRequest(
                "channel binding is not supported".to_owned(),
            ));
        }
        let fields = parse_fields(bare)?;
        if fields.contains_key("m") {
            return Err(AuthenticationError::MalformedRequest(
                "unsupported mandatory extension".to_owned(),
            ));
        }
        let username = fields.get("n").ok_or_else(|| {
            AuthenticationError::MalformedRequest("client-first lacks a username".to_owned())
        })?;
        let authn_id = saslname_decode(username)?;
        if authn_id.is_empty() {
            return Err(AuthenticationError::MalformedRequest(
                "empty username".to_owned(),
            ));
        }
        let client_nonce = fields.get("r").ok_or_else(|| {
            AuthenticationError::MalformedRequest("client-first lacks a nonce".to_owned())
        })?;
        self.authn_id = Some(authn_id);
        self.state = ServerState::FirstResponseReceived {
            gs2_header: gs2_header.to_vec(),
            client_nonce: client_nonce.clone(),
        };
        Ok(())
    }

    fn accept_client_final(
        &mut self,
        response: &[u8],
        gs2_header: Vec<u8>,
        client_nonce: String,
        full_nonce: String,
        salted_password: Vec<u8>,
        salt: Vec<u8>,
        iterations: u32,
    ) -> Result<(), AuthenticationError> {
        let fields = parse_fields(response)?;
        let channel_binding = fields.get("c").ok_or_else(|| {
            AuthenticationError::MalformedRequest(
                "client-final lacks a channel-binding field".to_owned(),
            )
        })?;
        if channel_binding != &Base64.encode(&gs2_header) {
            return Err(AuthenticationError::ChannelBindingMismatch);
        }
        match fields.get("r") {
            Some(nonce) if nonce == &full_nonce => {}
            _ => return Err(AuthenticationError::ClientNonceMismatch),
        }
        let proof = fields
            .get("p")
            .and_then(|p| Base64.decode(p).ok())
            .ok_or_else(|| {
                AuthenticationError::MalformedRequest("client-final lacks a valid proof".to_owned())
            })?;

        let authn_id = self.authn_id.as_deref().unwrap_or_default();
        let auth_message = auth_message(
            authn_id,
            &client_nonce,
            &full_nonce,
            &salt,
            iterations,
            &gs2_header,
        );
        let client_key = client_key::<D>(&salted_password);
        let stored_key = stored_key::<D>(&client_key);
        let signature = client_signature::<D>(&stored_key, &auth_message);
        let expected = client_proof(&client_key, &signature);
        if !constant_time_eq(&proof, &expected) {
            return Err(AuthenticationError::InvalidProof);
        }
        let server_signature = server_signature::<D>(&server_key::<D>(&salted_password), &auth_message);
        self.properties = Some(NegotiatedProperties {
            salt,
            salted_password,
            iterations,
        });
        self.state = ServerState::FinalResponseReceived { server_signature };
        Ok(())
    }
}

impl<D: ScramDigest> Mechanism for ScramServer<D> {
    fn mechanism(&self) -> &str {
        &self.mechanism
    }

    fn accept_response(&mut self, response: &[u8]) -> Result<(), AuthenticationError> {
        match std::mem::replace(&mut self.state, ServerState::Completed) {
            ServerState::Initial => {
                self.state = ServerState::Initial;
                match self.accept_client_first(response) {
                    Ok(()) => Ok(()),
                    Err(e) => {
                        // Keep going so that challenge() can report `e=`.
                        self.state = ServerState::FinalResponseReceived {
                            server_signature: Vec::new(),
                        };
                        Err(self.fail(e))
                    }
                }
            }
            ServerState::ChallengeSent {
                gs2_header,
                client_nonce,
                full_nonce,
                salted_password,
                salt,
                iterations,
            } => match self.accept_client_final(
                response,
                gs2_header,
                client_nonce,
                full_nonce,
                salted_password,
                salt,
                iterations,
            ) {
                Ok(()) => Ok(()),
                Err(e) => {
                    self.state = ServerState::FinalResponseReceived {
                        server_signature: Vec::new(),
                    };
                    Err(self.fail(e))
                }
            },
            state => {
                self.state = state;
                Err(self.fail(AuthenticationError::InvalidState))
            }
        }
    }

    fn challenge(&mut self) -> Result<Vec<u8>, AuthenticationError> {
        match std::mem::replace(&mut self.state, ServerState::Completed) {
            ServerState::FirstResponseReceived {
                gs2_header,
                client_nonce,
            } => {
                let authn_id = self.authn_id.clone().unwrap_or_default();
                let (salted_password, salt, iterations) =
                    match self.resolve_credentials(&authn_id) {
                        Ok(resolved) => resolved,
                        Err(e) => {
                            self.state = ServerState::FinalResponseReceived {
                                server_signature: Vec::new(),
                            };
                            return Err(self.fail(e));
                        }
                    };
                let server_nonce = match generate_nonce() {
                    Ok(nonce) => nonce,
                    Err(e) => return Err(self.fail(e)),
                };
                let full_nonce = format!("{}{}", client_nonce, server_nonce);

                let mut message = Vec::new();
                message.extend(b"r=");
                message.extend(full_nonce.bytes());
                message.extend(b",s=");
                message.extend(Base64.encode(&salt).bytes());
                message.extend(b",i=");
                message.extend(iterations.to_string().bytes());

                self.state = ServerState::ChallengeSent {
                    gs2_header,
                    client_nonce,
                    full_nonce,
                    salted_password,
                    salt,
                    iterations,
                };
                Ok(message)
            }
            ServerState::FinalResponseReceived { server_signature } => {
                let mut message = Vec::new();
                match self.error {
                    Some(ref error) => {
                        message.extend(b"e=");
                        message.extend(error.server_error_value().bytes());
                    }
                    None => {
                        message.extend(b"v=");
                        message.extend(Base64.encode(&server_signature).bytes());
                    }
                }
                self.state = ServerState::Completed;
                Ok(message)
            }
            state => {
                self.state = state;
                Err(self.fail(AuthenticationError::InvalidState))
            }
        }
    }

    fn is_completed(&self) -> bool {
        self.error.is_some() || matches!(self.state, ServerState::Completed)
    }

    fn error(&self) -> Option<&AuthenticationError> {
        self.error.as_ref()
    }

    fn identity(&self) -> Option<&str> {
        if self.error.is_none() {
            self.authn_id.as_deref()
        } else {
            None
        }
    }

    fn negotiated_properties(&self) -> Option<&NegotiatedProperties> {
        if self.error.is_none() && matches!(self.state, ServerState::Completed) {
            self.properties.as_ref()
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{Mechanism as ClientMechanism, ScramClient};
    use crate::common::scram::{Sha1, Sha256};

    fn password_store(password: &str) -> Arc<dyn CredentialRetriever> {
        let password = password.to_owned();
        Arc::new(move |_: &str, _: &str, key: CredentialKey| match key {
            CredentialKey::Password => Some(Credential::Password(password.clone())),
            _ => None,
        })
    }

    fn run_exchange<D: ScramDigest>(
        client: &mut ScramClient<D>,
        server: &mut ScramServer<D>,
    ) -> Result<(), AuthenticationError> {
        let client_first = client.respond()?;
        server.accept_response(&client_first)?;
        let server_first = server.challenge()?;
        client.accept_challenge(&server_first)?;
        let client_final = client.respond()?;
        server.accept_response(&client_final)?;
        let server_final = server.challenge()?;
        client.accept_challenge(&server_final)?;
        Ok(())
    }

    #[test]
    fn full_exchange_sha1() {
        let mut client =
            ScramClient::<Sha1>::new("user", None, password_store("pencil")).unwrap();
        let mut server = ScramServer::<Sha1>::new(password_store("pencil"));
        run_exchange(&mut client, &mut server).unwrap();
        assert!(client.is_completed() && server.is_completed());
        assert!(client.error().is_none() && server.error().is_none());
        assert_eq!(server.identity(), Some("user"));
        assert_eq!(
            client.negotiated_properties(),
            server.negotiated_properties()
        );
        let props = server.negotiated_properties().unwrap();
        assert_eq!(props.iterations, DEFAULT_ITERATIONS);
        assert_eq!(props.salt.len(), 8);
    }

    #[test]
    fn full_exchange_sha256() {
        let mut client =
            ScramClient::<Sha256>::new("user", None, password_store("pencil")).unwrap();
        let mut server = ScramServer::<Sha256>::new(password_store("pencil"));
        run_exchange(&mut client, &mut server).unwrap();
        assert!(server.error().is_none());
    }

    #[test]
    fn full_exchange_with_stored_credentials() {
        let salt = b"saltsalt".to_vec();
        let salted = salted_password::<Sha1>("pencil", &salt, 8192);
        let store_salt = salt.clone();
        let retriever = Arc::new(move |_: &str, _: &str, key: CredentialKey| match key {
            CredentialKey::SaltedPassword => Some(Credential::SaltedPassword(salted.clone())),
            CredentialKey::Salt => Some(Credential::Salt(store_salt.clone())),
            CredentialKey::Iteration => Some(Credential::Iteration(8192)),
            CredentialKey::Password => None,
        });
        let mut client =
            ScramClient::<Sha1>::new("user", None, password_store("pencil")).unwrap();
        let mut server = ScramServer::<Sha1>::new(retriever);
        run_exchange(&mut client, &mut server).unwrap();
        let props = server.negotiated_properties().unwrap();
        assert_eq!(props.iterations, 8192);
        assert_eq!(props.salt, salt);
    }

    #[test]
    fn wrong_password_yields_invalid_proof() {
        let mut client =
            ScramClient::<Sha1>::new("user", None, password_store("pancil")).unwrap();
        let mut server = ScramServer::<Sha1>::new(password_store("pencil"));

        let client_first = client.respond().unwrap();
        server.accept_response(&client_first).unwrap();
        let server_first = server.challenge().unwrap();
        client.accept_challenge(&server_first).unwrap();
        let client_final = client.respond().unwrap();
        let err = server.accept_response(&client_final).unwrap_err();
        assert_eq!(err, AuthenticationError::InvalidProof);

        // The failure is reported to the client in the final message.
        let server_final = server.challenge().unwrap();
        assert_eq!(&server_final, b"e=invalid-proof");
        assert!(server.is_completed());
        assert_eq!(server.identity(), None);
        assert!(server.negotiated_properties().is_none());
    }

    #[test]
    fn escaped_username_roundtrips() {
        let mut client =
            ScramClient::<Sha1>::new("who,what=why", None, password_store("secret")).unwrap();
        let mut server = ScramServer::<Sha1>::new(password_store("secret"));
        run_exchange(&mut client, &mut server).unwrap();
        assert_eq!(server.identity(), Some("who,what=why"));
    }

    #[test]
    fn rejects_channel_binding_flag() {
        let mut server = ScramServer::<Sha1>::new(password_store("pencil"));
        let err = server
            .accept_response(b"y,,n=user,r=clientnonce")
            .unwrap_err();
        assert!(matches!(err, AuthenticationError::MalformedRequest(_)));
        let server_final = server.challenge().unwrap();
        assert_eq!(&server_final, b"e=invalid-encoding");
    }

    #[test]
    fn rejects_mandatory_extension() {
        let mut server = ScramServer::<Sha1>::new(password_store("pencil"));
        let err = server
            .accept_response(b"n,,n=user,r=clientnonce,m=future")
            .unwrap_err();
        assert!(matches!(err, AuthenticationError::MalformedRequest(_)));
    }

    #[test]
    fn rejects_empty_username() {
        let mut server = ScramServer::<Sha1>::new(password_store("pencil"));
        let err = server.accept_response(b"n,,n=,r=clientnonce").unwrap_err();
        assert!(matches!(err, AuthenticationError::MalformedRequest(_)));
    }

    #[test]
    fn rejects_tampered_nonce_in_client_final() {
        let mut client =
            ScramClient::<Sha1>::new("user", None, password_store("pencil")).unwrap();
        let mut server = ScramServer::<Sha1>::new(password_store("pencil"));
        let client_first = client.respond().unwrap();
        server.accept_response(&client_first).unwrap();
        let server_first = server.challenge().unwrap();
        client.accept_challenge(&server_first).unwrap();
        let _ = client.respond().unwrap();
        let err = server
            .accept_response(b"c=biws,r=forged,p=AAAA")
            .unwrap_err();
        assert_eq!(err, AuthenticationError::ClientNonceMismatch);
    }
}
