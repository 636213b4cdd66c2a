// Copyright (c) 2025 skald contributors
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The client side of a SASL exchange.

use std::marker::PhantomData;
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as Base64, Engine};

use crate::common::scram::{
    auth_message, client_key, client_proof, client_signature, generate_nonce, mechanism_name,
    salted_password, server_key, server_signature, stored_key, ScramDigest,
};
use crate::common::{
    constant_time_eq, parse_fields, saslname_escape, Credential, CredentialKey,
    CredentialRetriever, NegotiatedProperties,
};
use crate::error::AuthenticationError;

/// A client-side SASL party.
///
/// Implementations are not thread-safe; drive them from a single task.
pub trait Mechanism: Send {
    /// The mechanism name, e.g. `SCRAM-SHA-1`.
    fn mechanism(&self) -> &str;

    /// Whether this mechanism sends the first message of the exchange.
    fn is_client_first(&self) -> bool;

    /// Produces the next message to send to the server.
    fn respond(&mut self) -> Result<Vec<u8>, AuthenticationError>;

    /// Consumes a challenge (or additional data) received from the server.
    fn accept_challenge(&mut self, challenge: &[u8]) -> Result<(), AuthenticationError>;

    /// Whether the exchange has terminated, successfully or not.
    fn is_completed(&self) -> bool;

    /// The error that terminated the exchange, if any.
    fn error(&self) -> Option<&AuthenticationError>;

    /// The properties fixed by a successful exchange.
    fn negotiated_properties(&self) -> Option<&NegotiatedProperties>;
}

enum ClientState {
    Initial,
    AwaitingChallenge {
        gs2_header: Vec<u8>,
    },
    FinalPending {
        gs2_header: Vec<u8>,
        full_nonce: String,
        salt: Vec<u8>,
        iterations: u32,
    },
    AwaitingFinal {
        server_signature: Vec<u8>,
    },
    Completed,
}

/// A SCRAM client (RFC 5802), without channel binding.
pub struct ScramClient<D: ScramDigest> {
    mechanism: String,
    authn_id: String,
    authz_id: Option<String>,
    retriever: Arc<dyn CredentialRetriever>,
    client_nonce: String,
    state: ClientState,
    error: Option<AuthenticationError>,
    properties: Option<NegotiatedProperties>,
    _marker: PhantomData<fn() -> D>,
}

impl<D: ScramDigest> ScramClient<D> {
    /// Creates a client for `authn_id`, optionally authorizing as
    /// `authz_id`, pulling credentials from `retriever`.
    pub fn new(
        authn_id: impl Into<String>,
        authz_id: Option<String>,
        retriever: Arc<dyn CredentialRetriever>,
    ) -> Result<ScramClient<D>, AuthenticationError> {
        let client_nonce = generate_nonce()?;
        Ok(Self::with_nonce(authn_id, authz_id, retriever, client_nonce))
    }

    #[doc(hidden)]
    pub fn with_nonce(
        authn_id: impl Into<String>,
        authz_id: Option<String>,
        retriever: Arc<dyn CredentialRetriever>,
        client_nonce: String,
    ) -> ScramClient<D> {
        ScramClient {
            mechanism: mechanism_name::<D>(),
            authn_id: authn_id.into(),
            authz_id,
            retriever,
            client_nonce,
            state: ClientState::Initial,
            error: None,
            properties: None,
            _marker: PhantomData,
        }
    }

    fn fail(&mut self, error: AuthenticationError) -> AuthenticationError {
        self.error = Some(error.clone());
        error
    }

    fn gs2_header(&self) -> Vec<u8> {
        let mut header = Vec::new();
        header.extend(b"n,");
        if let Some(ref authz_id) = self.authz_id {
            header.extend(b"a=");
            header.extend(saslname_escape(authz_id).bytes());
        }
        header.push(b',');
        header
    }

    fn resolve_salted_password(
        &self,
        salt: &[u8],
        iterations: u32,
    ) -> Result<Vec<u8>, AuthenticationError> {
        match self
            .retriever
            .retrieve(&self.authn_id, &self.mechanism, CredentialKey::SaltedPassword)
        {
            Some(Credential::SaltedPassword(salted)) => return Ok(salted),
            Some(_) | None => {}
        }
        match self
            .retriever
            .retrieve(&self.authn_id, &self.mechanism, CredentialKey::Password)
        {
            Some(Credential::Password(password)) => {
                Ok(salted_password::<D>(&password, salt, iterations))
            }
            Some(_) | None => Err(AuthenticationError::CredentialsNotFound),
        }
    }
}

impl<D: ScramDigest> Mechanism for ScramClient<D> {
    fn mechanism(&self) -> &str {
        &self.mechanism
    }

    fn is_client_first(&self) -> bool {
        true
    }

    fn respond(&mut self) -> Result<Vec<u8>, AuthenticationError> {
        match std::mem::replace(&mut self.state, ClientState::Completed) {
            ClientState::Initial => {
                let gs2_header = self.gs2_header();
                let mut message = gs2_header.clone();
                message.extend(b"n=");
                message.extend(saslname_escape(&self.authn_id).bytes());
                message.extend(b",r=");
                message.extend(self.client_nonce.bytes());
                self.state = ClientState::AwaitingChallenge { gs2_header };
                Ok(message)
            }
            ClientState::FinalPending {
                gs2_header,
                full_nonce,
                salt,
                iterations,
            } => {
                let salted = match self.resolve_salted_password(&salt, iterations) {
                    Ok(salted) => salted,
                    Err(e) => return Err(self.fail(e)),
                };
                let auth_message = auth_message(
                    &self.authn_id,
                    &self.client_nonce,
                    &full_nonce,
                    &salt,
                    iterations,
                    &gs2_header,
                );
                let client_key = client_key::<D>(&salted);
                let stored_key = stored_key::<D>(&client_key);
                let signature = client_signature::<D>(&stored_key, &auth_message);
                let proof = client_proof(&client_key, &signature);
                let server_signature =
                    server_signature::<D>(&server_key::<D>(&salted), &auth_message);

                let mut message = Vec::new();
                message.extend(b"c=");
                message.extend(Base64.encode(&gs2_header).bytes());
                message.extend(b",r=");
                message.extend(full_nonce.bytes());
                message.extend(b",p=");
                message.extend(Base64.encode(&proof).bytes());

                self.properties = Some(NegotiatedProperties {
                    salt,
                    salted_password: salted,
                    iterations,
                });
                self.state = ClientState::AwaitingFinal { server_signature };
                Ok(message)
            }
            state => {
                self.state = state;
                Err(self.fail(AuthenticationError::InvalidState))
            }
        }
    }

    fn accept_challenge(&mut self, challenge: &[u8]) -> Result<(), AuthenticationError> {
        match std::mem::replace(&mut self.state, ClientState::Completed) {
            ClientState::AwaitingChallenge { gs2_header } => {
                let fields = match parse_fields(challenge) {
                    Ok(fields) => fields,
                    Err(e) => return Err(self.fail(e)),
                };
                let full_nonce = match fields.get("r") {
                    Some(nonce) => nonce.clone(),
                    None => {
                        return Err(self.fail(AuthenticationError::MalformedRequest(
                            "server-first lacks a nonce".to_owned(),
                        )))
                    }
                };
                if !full_nonce.starts_with(&self.client_nonce) {
                    return Err(self.fail(AuthenticationError::ServerNonceMismatch));
                }
                let salt = match fields.get("s").and_then(|s| Base64.decode(s).ok()) {
                    Some(salt) => salt,
                    None => {
                        return Err(self.fail(AuthenticationError::MalformedRequest(
                            "server-first lacks a valid salt".to_owned(),
                        )))
                    }
                };
                let iterations = match fields.get("i").and_then(|i| i.parse().ok()) {
                    Some(iterations) => iterations,
                    None => {
                        return Err(self.fail(AuthenticationError::MalformedRequest(
                            "server-first lacks a valid iteration count".to_owned(),
                        )))
                    }
                };
                self.state = ClientState::FinalPending {
                    gs2_header,
                    full_nonce,
                    salt,
                    iterations,
                };
                Ok(())
            }
            ClientState::AwaitingFinal { server_signature } => {
                let fields = match parse_fields(challenge) {
                    Ok(fields) => fields,
                    Err(e) => return Err(self.fail(e)),
                };
                if let Some(reason) = fields.get("e") {
                    return Err(self.fail(AuthenticationError::ServerReported(reason.clone())));
                }
                match fields.get("v").and_then(|v| Base64.decode(v).ok()) {
                    Some(signature) if constant_time_eq(&signature, &server_signature) => {
                        self.state = ClientState::Completed;
                        Ok(())
                    }
                    Some(_) => Err(self.fail(AuthenticationError::ServerSignatureMismatch)),
                    None => Err(self.fail(AuthenticationError::MalformedRequest(
                        "server-final lacks a valid signature".to_owned(),
                    ))),
                }
            }
            state => {
                self.state = state;
                Err(self.fail(AuthenticationError::InvalidState))
            }
        }
    }

    fn is_completed(&self) -> bool {
        self.error.is_some() || matches!(self.state, ClientState::Completed)
    }

    fn error(&self) -> Option<&AuthenticationError> {
        self.error.as_ref()
    }

    fn negotiated_properties(&self) -> Option<&NegotiatedProperties> {
        if self.error.is_none() && matches!(self.state, ClientState::Completed) {
            self.properties.as_ref()
        } else {
            None
        }
    }
}
