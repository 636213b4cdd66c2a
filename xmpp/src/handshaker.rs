// Copyright (c) 2025 skald contributors
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! # Stream negotiation
//!
//! The [`HandshakerPipe`] is a [`Pipe`] holding the XMPP stream state
//! machine. Installed into a session's pipeline, it consumes and produces
//! XML documents to drive the stream through opening, StartTLS, SASL
//! authentication and resource binding, and gates application traffic until
//! negotiation has completed.

use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex, Weak};

use base64::{engine::general_purpose::STANDARD as Base64, Engine};
use jid::Jid;
use minidom::Element;
use sasl::client::{Mechanism, ScramClient};
use sasl::common::scram::{Sha1, Sha256};
use sasl::{AuthenticationError, CredentialRetriever, NegotiatedProperties};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::{AuthError, Error, ProtocolError};
use crate::feature::StreamFeature;
use crate::ns;
use crate::pipeline::{Object, Pipe, PipeError, PipelineHandle, PipelineState};
use crate::session::{SessionCommand, SessionEvent};
use crate::stream_error::{Condition, StreamError};

/// Where the handshake currently stands.
///
/// Transitions only ever move forward in declaration order, with the one
/// exception that a connection loss forces [`StreamClosed`][`HandshakeState::StreamClosed`]
/// from any state but [`Disposed`][`HandshakeState::Disposed`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum HandshakeState {
    /// Constructed, no stream opener sent yet.
    Initialized,
    /// Stream opener sent, awaiting the responding opener.
    Started,
    /// Openers exchanged, negotiating features.
    Negotiating,
    /// All mandatory features negotiated; stanzas flow freely.
    Completed,
    /// A `<close/>` was sent, awaiting the peer's.
    StreamClosing,
    /// The stream is closed.
    StreamClosed,
    /// Removed from its pipeline; terminal.
    Disposed,
}

/// Construction parameters for a [`HandshakerPipe`].
pub struct HandshakerConfig {
    /// The authentication Jid; its local part is the SASL authentication
    /// id, its domain the peer to open the stream to.
    pub jid: Jid,
    /// Optional authorization Jid.
    pub authorization: Option<Jid>,
    /// Source of SASL credentials.
    pub retriever: Arc<dyn CredentialRetriever>,
    /// SASL mechanisms to try, most preferred first.
    pub preferred_mechanisms: Vec<String>,
    /// Resource to request at bind time; the server chooses otherwise.
    pub resource: Option<String>,
    /// In-band registration is unsupported; this must be `false`.
    pub registering: bool,
}

impl HandshakerConfig {
    /// A configuration with the default mechanism list and no preset
    /// resource.
    pub fn new(jid: Jid, retriever: Arc<dyn CredentialRetriever>) -> HandshakerConfig {
        HandshakerConfig {
            jid,
            authorization: None,
            retriever,
            preferred_mechanisms: vec!["SCRAM-SHA-1".to_owned()],
            resource: None,
            registering: false,
        }
    }
}

/// Mutable negotiation state, guarded by a single mutex.
#[derive(Default)]
struct Negotiation {
    negotiated: HashSet<StreamFeature>,
    /// Features that must be negotiated before completion: SASL and
    /// resource binding from the start, StartTLS once announced.
    required: HashSet<StreamFeature>,
    negotiating: Option<StreamFeature>,
    sasl: Option<Box<dyn Mechanism>>,
    bind_id: Option<String>,
    jid: Option<Jid>,
    client_stream_error: Option<StreamError>,
    server_stream_error: Option<StreamError>,
    handshake_error: Option<Error>,
}

struct Shared {
    config: HandshakerConfig,
    state_tx: watch::Sender<HandshakeState>,
    negotiation: StdMutex<Negotiation>,
    pipeline: StdMutex<Option<PipelineHandle>>,
    commands: mpsc::UnboundedSender<SessionCommand>,
    events: broadcast::Sender<SessionEvent>,
    feature_events: broadcast::Sender<StreamFeature>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

/// The pipe implementing the stream handshake state machine.
///
/// Cloning yields another handle to the same handshaker, which is how a
/// session keeps hold of the instance it installed into its pipeline.
#[derive(Clone)]
pub struct HandshakerPipe {
    shared: Arc<Shared>,
}

impl HandshakerPipe {
    /// Creates a handshaker.
    ///
    /// `commands` carries requests back to the owning session (TLS
    /// deployment); `events` is the session's event stream, which the
    /// handshaker subscribes to for `StartTlsHandshakeCompleted` and
    /// `ConnectionTerminated`.
    pub fn new(
        config: HandshakerConfig,
        commands: mpsc::UnboundedSender<SessionCommand>,
        events: broadcast::Sender<SessionEvent>,
    ) -> Result<HandshakerPipe, Error> {
        if config.registering {
            return Err(Error::InvalidState);
        }
        let (state_tx, _) = watch::channel(HandshakeState::Initialized);
        let (feature_events, _) = broadcast::channel(16);
        let negotiation = Negotiation {
            required: [StreamFeature::Sasl, StreamFeature::ResourceBinding]
                .into_iter()
                .collect(),
            ..Negotiation::default()
        };
        Ok(HandshakerPipe {
            shared: Arc::new(Shared {
                config,
                state_tx,
                negotiation: StdMutex::new(negotiation),
                pipeline: StdMutex::new(None),
                commands,
                events,
                feature_events,
                tasks: StdMutex::new(Vec::new()),
            }),
        })
    }

    /// The current handshake state.
    pub fn state(&self) -> HandshakeState {
        *self.shared.state_tx.borrow()
    }

    /// A watch over the handshake state.
    pub fn state_stream(&self) -> watch::Receiver<HandshakeState> {
        self.shared.state_tx.subscribe()
    }

    /// Emits a `FeatureNegotiated` event per negotiated feature.
    pub fn feature_events(&self) -> broadcast::Receiver<StreamFeature> {
        self.shared.feature_events.subscribe()
    }

    /// The features negotiated so far.
    pub fn negotiated_features(&self) -> HashSet<StreamFeature> {
        self.shared.negotiation.lock().expect("poisoned").negotiated.clone()
    }

    /// The feature currently being negotiated.
    pub fn negotiating_feature(&self) -> Option<StreamFeature> {
        self.shared.negotiation.lock().expect("poisoned").negotiating
    }

    /// The full Jid assigned at resource binding.
    pub fn negotiated_jid(&self) -> Option<Jid> {
        self.shared.negotiation.lock().expect("poisoned").jid.clone()
    }

    /// The last stream error this side sent.
    pub fn client_stream_error(&self) -> Option<StreamError> {
        self.shared
            .negotiation
            .lock()
            .expect("poisoned")
            .client_stream_error
            .clone()
    }

    /// The last stream error the peer sent.
    pub fn server_stream_error(&self) -> Option<StreamError> {
        self.shared
            .negotiation
            .lock()
            .expect("poisoned")
            .server_stream_error
            .clone()
    }

    /// The error that aborted the handshake, if any.
    pub fn handshake_error(&self) -> Option<Error> {
        self.shared
            .negotiation
            .lock()
            .expect("poisoned")
            .handshake_error
            .clone()
    }

    /// The SCRAM parameters fixed by a successful authentication, usable to
    /// cache credentials without retaining the password.
    pub fn sasl_properties(&self) -> Option<NegotiatedProperties> {
        self.shared
            .negotiation
            .lock()
            .expect("poisoned")
            .sasl
            .as_ref()
            .and_then(|party| party.negotiated_properties().cloned())
    }

    /// Sends the stream opener.
    ///
    /// Precondition: state is [`HandshakeState::Initialized`].
    pub fn start(&self) -> Result<(), Error> {
        if self.state() != HandshakeState::Initialized {
            return Err(Error::InvalidState);
        }
        self.shared.set_state(HandshakeState::Started);
        self.shared.send_opener();
        Ok(())
    }

    /// Sends a stream error and closes the stream.
    pub fn send_stream_error(&self, error: StreamError) {
        self.shared.send_stream_error(error);
    }

    /// Closes the stream.
    ///
    /// Idempotent: completes immediately when the stream is already closed
    /// or was never opened; fails once the handshaker is disposed.
    /// Otherwise a `<close/>` goes out and the returned future resolves
    /// when the peer's `<close/>` (or a connection loss) arrives.
    pub async fn close_stream(&self) -> Result<(), Error> {
        eprintln!("DIAG close_stream entered");
        let mut state_rx = self.shared.state_tx.subscribe();
        match *state_rx.borrow_and_update() {
            HandshakeState::Disposed => return Err(Error::InvalidState),
            HandshakeState::Initialized | HandshakeState::StreamClosed => return Ok(()),
            _ => self.shared.begin_close(),
        }
        loop {
            match *state_rx.borrow_and_update() {
                HandshakeState::StreamClosed | HandshakeState::Disposed => return Ok(()),
                _ => {}
            }
            if state_rx.changed().await.is_err() {
                return Ok(());
            }
        }
    }
}

impl Pipe for HandshakerPipe {
    fn on_added(&self, pipeline: &PipelineHandle) {
        *self.shared.pipeline.lock().expect("poisoned") = Some(pipeline.clone());

        let weak = Arc::downgrade(&self.shared);
        let mut tasks = self.shared.tasks.lock().expect("poisoned");

        // Start now, or as soon as the pipeline runs.
        if pipeline.state() == PipelineState::Running {
            if self.state() == HandshakeState::Initialized {
                self.shared.set_state(HandshakeState::Started);
                self.shared.send_opener();
            }
        } else if let Some(state_rx) = pipeline.state_stream() {
            tasks.push(tokio::spawn(start_when_running(weak.clone(), state_rx)));
        }

        // React to session events until removed.
        let events = self.shared.events.subscribe();
        tasks.push(tokio::spawn(watch_session_events(weak, events)));
    }

    fn on_removed(&self, _pipeline: &PipelineHandle) {
        self.shared.set_state(HandshakeState::Disposed);
        let mut tasks = self.shared.tasks.lock().expect("poisoned");
        for task in tasks.drain(..) {
            task.abort();
        }
        *self.shared.pipeline.lock().expect("poisoned") = None;
    }

    fn on_reading(
        &self,
        _pipeline: &PipelineHandle,
        obj: Object,
        out: &mut Vec<Object>,
    ) -> Result<(), PipeError> {
        match obj.downcast::<Element>() {
            Ok(element) => {
                self.shared.dispatch(*element, out);
                Ok(())
            }
            Err(obj) => {
                out.push(obj);
                Ok(())
            }
        }
    }

    fn on_writing(
        &self,
        _pipeline: &PipelineHandle,
        obj: Object,
        out: &mut Vec<Object>,
    ) -> Result<(), PipeError> {
        match obj.downcast::<Element>() {
            Ok(element) => {
                if self.shared.may_write(&element) {
                    out.push(element);
                } else {
                    log::debug!(
                        "dropping outbound <{}/> while the stream is not negotiated",
                        element.name()
                    );
                }
                Ok(())
            }
            Err(obj) => {
                out.push(obj);
                Ok(())
            }
        }
    }
}

async fn start_when_running(
    weak: Weak<Shared>,
    mut state_rx: watch::Receiver<PipelineState>,
) {
    loop {
        if *state_rx.borrow_and_update() == PipelineState::Running {
            if let Some(shared) = weak.upgrade() {
                if *shared.state_tx.borrow() == HandshakeState::Initialized {
                    shared.set_state(HandshakeState::Started);
                    shared.send_opener();
                }
            }
            return;
        }
        if state_rx.changed().await.is_err() {
            return;
        }
    }
}

async fn watch_session_events(
    weak: Weak<Shared>,
    mut events: broadcast::Receiver<SessionEvent>,
) {
    loop {
        match events.recv().await {
            Ok(SessionEvent::StartTlsHandshakeCompleted) => {
                let Some(shared) = weak.upgrade() else { return };
                // The transport is now encrypted; restart the stream so the
                // server re-advertises its features.
                log::debug!("TLS deployed, restarting stream");
                shared.send_opener();
            }
            Ok(SessionEvent::ConnectionTerminated) => {
                let Some(shared) = weak.upgrade() else { return };
                shared.set_state(HandshakeState::StreamClosed);
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

impl Shared {
    fn state(&self) -> HandshakeState {
        *self.state_tx.borrow()
    }

    /// Moves the state forward; backward transitions are ignored, and
    /// nothing leaves `Disposed`.
    fn set_state(&self, new: HandshakeState) {
        self.state_tx.send_if_modified(|state| {
            if *state == HandshakeState::Disposed || new <= *state {
                false
            } else {
                log::debug!("handshaker {:?} -> {:?}", state, new);
                *state = new;
                true
            }
        });
    }

    fn send(&self, element: Element) {
        let pipeline = self.pipeline.lock().expect("poisoned");
        match pipeline.as_ref() {
            Some(pipeline) => pipeline.write(element),
            None => log::warn!("handshaker has no pipeline, dropping outbound element"),
        }
    }

    fn send_opener(&self) {
        self.send(
            Element::builder("open", ns::FRAMING)
                .attr("to", self.config.jid.domain())
                .attr("version", "1.0")
                .build(),
        );
    }

    fn record_error(&self, error: Error) {
        let mut negotiation = self.negotiation.lock().expect("poisoned");
        if negotiation.handshake_error.is_none() {
            negotiation.handshake_error = Some(error);
        }
    }

    fn begin_close(&self) {
        eprintln!("DIAG begin_close called, state={:?}", self.state());
        let proceed = matches!(
            self.state(),
            HandshakeState::Started | HandshakeState::Negotiating | HandshakeState::Completed
        );
        if proceed {
            self.send(Element::builder("close", ns::FRAMING).build());
            self.set_state(HandshakeState::StreamClosing);
        }
    }

    fn send_stream_error(&self, error: StreamError) {
        log::warn!("sending stream error: {}", error);
        {
            let mut negotiation = self.negotiation.lock().expect("poisoned");
            negotiation.client_stream_error = Some(error.clone());
        }
        if self.state() < HandshakeState::Completed {
            self.record_error(Error::StreamErrorSent(error.clone()));
        }
        self.send(error.to_element());
        self.begin_close();
    }

    /// Outbound gate: before completion only negotiation traffic passes.
    fn may_write(&self, element: &Element) -> bool {
        if self.state() == HandshakeState::Completed {
            return true;
        }
        let ns = element.ns();
        if ns == ns::FRAMING || ns == ns::STREAM || ns == ns::TLS || ns == ns::SASL {
            return true;
        }
        if element.is("iq", ns::CLIENT) {
            let negotiation = self.negotiation.lock().expect("poisoned");
            return negotiation.bind_id.is_some()
                && element.attr("id") == negotiation.bind_id.as_deref();
        }
        false
    }

    fn dispatch(&self, element: Element, out: &mut Vec<Object>) {
        let state = self.state();
        if state >= HandshakeState::StreamClosed {
            log::trace!("stream closed, ignoring inbound <{}/>", element.name());
            return;
        }
        let name = element.name().to_owned();
        let namespace = element.ns();
        let negotiating = self
            .negotiation
            .lock()
            .expect("poisoned")
            .negotiating;
        match (name.as_str(), namespace.as_str()) {
            ("open", ns::FRAMING) => self.handle_open(&element, state),
            ("close", ns::FRAMING) => self.handle_close(state),
            ("features", ns::STREAM) => {
                if state == HandshakeState::Negotiating {
                    self.handle_features(&element);
                } else {
                    self.send_stream_error(StreamError::new(Condition::PolicyViolation));
                }
            }
            ("error", ns::STREAM) => self.handle_stream_error(&element),
            (_, ns::TLS) if negotiating == Some(StreamFeature::StartTls) => {
                self.handle_starttls(&element);
            }
            (_, ns::SASL) if negotiating == Some(StreamFeature::Sasl) => {
                self.handle_sasl(&element);
            }
            ("iq", ns::CLIENT) if negotiating == Some(StreamFeature::ResourceBinding) => {
                self.handle_bind(&element);
            }
            _ if state == HandshakeState::Completed
                && matches!(name.as_str(), "iq" | "message" | "presence")
                && namespace == ns::CLIENT =>
            {
                out.push(Box::new(element));
            }
            _ => {
                log::warn!("unsupported inbound <{}/> in namespace {}", name, namespace);
                self.send_stream_error(StreamError::new(Condition::UnsupportedStanzaType));
            }
        }
    }

    fn handle_open(&self, element: &Element, state: HandshakeState) {
        match state {
            HandshakeState::Started | HandshakeState::Negotiating => {
                if !element
                    .attr("version")
                    .map(|version| version == "1.0")
                    .unwrap_or(false)
                {
                    let version = element.attr("version").map(str::to_owned);
                    self.record_error(Error::Protocol(ProtocolError::UnsupportedVersion(
                        version,
                    )));
                    self.send_stream_error(StreamError::new(Condition::UnsupportedVersion));
                    return;
                }
                if let Some(from) = element.attr("from") {
                    if from != self.config.jid.domain() {
                        self.record_error(Error::Protocol(ProtocolError::WrongFrom(
                            from.to_owned(),
                        )));
                        self.send_stream_error(StreamError::new(Condition::InvalidFrom));
                        return;
                    }
                }
                self.set_state(HandshakeState::Negotiating);
            }
            HandshakeState::Completed => {
                self.send_stream_error(StreamError::new(Condition::Conflict));
            }
            _ => log::warn!("ignoring <open/> in state {:?}", state),
        }
    }

    fn handle_close(&self, state: HandshakeState) {
        if state != HandshakeState::StreamClosing {
            self.send(Element::builder("close", ns::FRAMING).build());
        }
        self.set_state(HandshakeState::StreamClosed);
    }

    fn handle_stream_error(&self, element: &Element) {
        let error = StreamError::try_from(element)
            .unwrap_or_else(|_| StreamError::new(Condition::UndefinedCondition));
        log::warn!("received stream error: {}", error);
        {
            let mut negotiation = self.negotiation.lock().expect("poisoned");
            negotiation.server_stream_error = Some(error.clone());
        }
        self.record_error(Error::StreamErrorReceived(error));
        self.begin_close();
    }

    fn handle_features(&self, element: &Element) {
        // First pass: record announced mandatory features and absorb the
        // informational ones.
        let mut newly_negotiated = Vec::new();
        {
            let mut negotiation = self.negotiation.lock().expect("poisoned");
            for child in element.children() {
                let Some(feature) = StreamFeature::lookup(&child.ns(), child.name()) else {
                    continue;
                };
                if feature.mandatory() {
                    negotiation.required.insert(feature);
                } else if negotiation.negotiated.insert(feature) {
                    newly_negotiated.push(feature);
                }
            }
        }
        for feature in newly_negotiated {
            log::debug!("informational feature negotiated: {:?}", feature);
            let _ = self.feature_events.send(feature);
        }

        // Second pass: pick the first selectable feature in fixed order.
        for feature in StreamFeature::NEGOTIATION_ORDER {
            let already = {
                let negotiation = self.negotiation.lock().expect("poisoned");
                negotiation.negotiated.contains(&feature)
            };
            if already {
                continue;
            }
            let advertised = element
                .children()
                .find(|child| child.is(feature.local_name(), feature.namespace()));
            if let Some(advertisement) = advertised {
                log::debug!("negotiating {:?}", feature);
                self.negotiation.lock().expect("poisoned").negotiating = Some(feature);
                match feature {
                    StreamFeature::StartTls => self.initiate_starttls(),
                    StreamFeature::Sasl => self.initiate_sasl(advertisement),
                    StreamFeature::ResourceBinding => self.initiate_bind(),
                    _ => unreachable!("only negotiable features are selectable"),
                }
                return;
            }
        }

        // Nothing selectable.
        if self.mandatory_satisfied() {
            self.complete();
        } else {
            self.send_stream_error(StreamError::new(Condition::UnsupportedFeature));
        }
    }

    fn mandatory_satisfied(&self) -> bool {
        let negotiation = self.negotiation.lock().expect("poisoned");
        negotiation.required.is_subset(&negotiation.negotiated)
    }

    fn complete(&self) {
        debug_assert!(self.mandatory_satisfied());
        log::info!("stream negotiation completed");
        self.set_state(HandshakeState::Completed);
    }

    fn initiate_starttls(&self) {
        self.send(Element::builder("starttls", ns::TLS).build());
    }

    fn initiate_sasl(&self, advertisement: &Element) {
        let offered: Vec<String> = advertisement
            .children()
            .filter(|child| child.is("mechanism", ns::SASL))
            .map(|child| child.text())
            .collect();
        let selected = self
            .config
            .preferred_mechanisms
            .iter()
            .find(|preferred| offered.iter().any(|m| m == *preferred));
        let Some(selected) = selected else {
            log::warn!("no acceptable SASL mechanism among {:?}", offered);
            self.record_error(Error::Auth(AuthError::NoMechanism));
            self.send(Element::builder("abort", ns::SASL).build());
            self.send_stream_error(StreamError::new(Condition::PolicyViolation));
            return;
        };
        let party = match self.create_sasl_party(selected) {
            Ok(party) => party,
            Err(e) => {
                self.record_error(Error::Auth(AuthError::Sasl(e)));
                self.send_stream_error(StreamError::new(Condition::NotAuthorized));
                return;
            }
        };
        let mut negotiation = self.negotiation.lock().expect("poisoned");
        let party = negotiation.sasl.insert(party);
        if party.is_client_first() {
            match party.respond() {
                Ok(response) => {
                    let encoded = if response.is_empty() {
                        "=".to_owned()
                    } else {
                        Base64.encode(&response)
                    };
                    let auth = Element::builder("auth", ns::SASL)
                        .attr("mechanism", selected.as_str())
                        .append(encoded)
                        .build();
                    drop(negotiation);
                    self.send(auth);
                }
                Err(e) => {
                    drop(negotiation);
                    self.record_error(Error::Auth(AuthError::Sasl(e)));
                    self.send_stream_error(StreamError::new(Condition::NotAuthorized));
                }
            }
        }
    }

    fn create_sasl_party(
        &self,
        mechanism: &str,
    ) -> Result<Box<dyn Mechanism>, AuthenticationError> {
        let authn_id = self.config.jid.local().to_owned();
        let authz_id = self
            .config
            .authorization
            .as_ref()
            .map(|jid| jid.to_string());
        let retriever = Arc::clone(&self.config.retriever);
        match mechanism {
            "SCRAM-SHA-1" => {
                ScramClient::<Sha1>::new(authn_id, authz_id, retriever).map(|c| Box::new(c) as _)
            }
            "SCRAM-SHA-256" => {
                ScramClient::<Sha256>::new(authn_id, authz_id, retriever).map(|c| Box::new(c) as _)
            }
            _ => Err(AuthenticationError::InvalidState),
        }
    }

    fn handle_sasl(&self, element: &Element) {
        match element.name() {
            "challenge" => self.handle_sasl_challenge(element),
            "success" => self.handle_sasl_success(element),
            "failure" => {
                let condition = element
                    .children()
                    .next()
                    .map(|child| child.name().to_owned())
                    .unwrap_or_else(|| "not-authorized".to_owned());
                log::warn!("authentication failed: {}", condition);
                self.record_error(Error::Auth(AuthError::Fail(condition)));
                self.begin_close();
            }
            _ => {
                self.send_stream_error(StreamError::new(Condition::UnsupportedStanzaType));
            }
        }
    }

    fn handle_sasl_challenge(&self, element: &Element) {
        let data = match decode_sasl_text(element) {
            Ok(data) => data,
            Err(e) => {
                self.sasl_abort(e);
                return;
            }
        };
        let mut negotiation = self.negotiation.lock().expect("poisoned");
        let Some(party) = negotiation.sasl.as_mut() else {
            drop(negotiation);
            self.send_stream_error(StreamError::new(Condition::PolicyViolation));
            return;
        };
        match party.accept_challenge(&data) {
            Ok(()) => {
                if !party.is_completed() {
                    match party.respond() {
                        Ok(response) => {
                            let response = Element::builder("response", ns::SASL)
                                .append(Base64.encode(&response))
                                .build();
                            drop(negotiation);
                            self.send(response);
                        }
                        Err(e) => {
                            drop(negotiation);
                            self.sasl_abort(e);
                        }
                    }
                }
            }
            Err(e) => {
                drop(negotiation);
                self.sasl_abort(e);
            }
        }
    }

    fn handle_sasl_success(&self, element: &Element) {
        let data = match decode_sasl_text(element) {
            Ok(data) => data,
            Err(e) => {
                self.sasl_abort(e);
                return;
            }
        };
        let verified = {
            let mut negotiation = self.negotiation.lock().expect("poisoned");
            match negotiation.sasl.as_mut() {
                Some(party) => {
                    // A non-empty success doubles as the final challenge.
                    let accepted = if data.is_empty() {
                        Ok(())
                    } else {
                        party.accept_challenge(&data)
                    };
                    match accepted {
                        Ok(()) if party.is_completed() && party.error().is_none() => true,
                        Ok(()) => false,
                        Err(_) => false,
                    }
                }
                None => false,
            }
        };
        if !verified {
            let error = {
                let negotiation = self.negotiation.lock().expect("poisoned");
                negotiation
                    .sasl
                    .as_ref()
                    .and_then(|party| party.error().cloned())
                    .unwrap_or(AuthenticationError::InvalidState)
            };
            self.record_error(Error::Auth(AuthError::Sasl(error)));
            self.send_stream_error(StreamError::new(Condition::NotAuthorized));
            return;
        }
        {
            let mut negotiation = self.negotiation.lock().expect("poisoned");
            negotiation.negotiated.insert(StreamFeature::Sasl);
            negotiation.negotiating = None;
        }
        log::debug!("authenticated, restarting stream");
        let _ = self.feature_events.send(StreamFeature::Sasl);
        self.send_opener();
    }

    fn sasl_abort(&self, error: AuthenticationError) {
        log::warn!("aborting authentication: {}", error);
        self.record_error(Error::Auth(AuthError::Sasl(error)));
        self.send(Element::builder("abort", ns::SASL).build());
        self.send_stream_error(StreamError::new(Condition::NotAuthorized));
    }

    fn handle_starttls(&self, element: &Element) {
        match element.name() {
            "proceed" => {
                {
                    let mut negotiation = self.negotiation.lock().expect("poisoned");
                    negotiation.negotiated.insert(StreamFeature::StartTls);
                    negotiation.negotiating = None;
                }
                let _ = self.feature_events.send(StreamFeature::StartTls);
                log::debug!("server agreed to TLS, asking the session to deploy it");
                let _ = self.commands.send(SessionCommand::DeployTls);
            }
            "failure" => {
                log::warn!("server refused TLS");
                self.record_error(Error::Protocol(ProtocolError::TlsNegotiationFailed));
                self.begin_close();
            }
            _ => {
                self.send_stream_error(StreamError::new(Condition::UnsupportedStanzaType));
            }
        }
    }

    fn initiate_bind(&self) {
        let id = Uuid::new_v4().to_string();
        let mut bind = Element::builder("bind", ns::BIND);
        if let Some(ref resource) = self.config.resource {
            bind = bind.append(
                Element::builder("resource", ns::BIND)
                    .append(resource.clone())
                    .build(),
            );
        }
        let iq = Element::builder("iq", ns::CLIENT)
            .attr("type", "set")
            .attr("id", id.as_str())
            .append(bind.build())
            .build();
        self.negotiation.lock().expect("poisoned").bind_id = Some(id);
        self.send(iq);
    }

    fn handle_bind(&self, element: &Element) {
        let id_matches = {
            let negotiation = self.negotiation.lock().expect("poisoned");
            negotiation.bind_id.is_some() && element.attr("id") == negotiation.bind_id.as_deref()
        };
        if !id_matches {
            self.send_stream_error(StreamError::new(Condition::NotAuthorized));
            return;
        }
        match element.attr("type") {
            Some("result") => {
                let jid = element
                    .get_child("bind", ns::BIND)
                    .and_then(|bind| bind.get_child("jid", ns::BIND))
                    .and_then(|jid| jid.text().trim().parse::<Jid>().ok());
                match jid {
                    Some(jid) => {
                        log::info!("bound to {}", jid);
                        {
                            let mut negotiation = self.negotiation.lock().expect("poisoned");
                            negotiation.jid = Some(jid);
                            negotiation.negotiated.insert(StreamFeature::ResourceBinding);
                            negotiation.negotiating = None;
                        }
                        let _ = self.feature_events.send(StreamFeature::ResourceBinding);
                        if self.mandatory_satisfied() {
                            self.complete();
                        }
                    }
                    None => {
                        self.record_error(Error::Protocol(ProtocolError::InvalidBindResponse));
                        self.send_stream_error(StreamError::new(Condition::InvalidXml));
                    }
                }
            }
            Some("error") => {
                let condition = element
                    .get_child("error", ns::CLIENT)
                    .and_then(|error| error.children().next())
                    .map(|child| child.name().to_owned())
                    .unwrap_or_else(|| "undefined-condition".to_owned());
                log::warn!("resource binding failed: {}", condition);
                self.record_error(Error::Protocol(ProtocolError::BindFailure(condition)));
                self.begin_close();
            }
            _ => {
                self.send_stream_error(StreamError::new(Condition::UnsupportedStanzaType));
            }
        }
    }
}

fn decode_sasl_text(element: &Element) -> Result<Vec<u8>, AuthenticationError> {
    let text = element.text();
    let text = text.trim();
    if text.is_empty() || text == "=" {
        return Ok(Vec::new());
    }
    Base64
        .decode(text)
        .map_err(|_| AuthenticationError::MalformedRequest("invalid base64 payload".to_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Pipeline;
    use futures::StreamExt;
    use sasl::server::{Mechanism as ServerMechanism, ScramServer};
    use sasl::{Credential, CredentialKey};
    use tokio_stream::wrappers::BroadcastStream;

    struct Harness {
        pipeline: Pipeline<Element, Element>,
        handshaker: HandshakerPipe,
        outbound: BroadcastStream<Element>,
        commands: mpsc::UnboundedReceiver<SessionCommand>,
        events: broadcast::Sender<SessionEvent>,
    }

    fn pencil() -> Arc<dyn CredentialRetriever> {
        Arc::new(|_: &str, _: &str, key: CredentialKey| match key {
            CredentialKey::Password => Some(Credential::Password("pencil".to_owned())),
            _ => None,
        })
    }

    fn config() -> HandshakerConfig {
        HandshakerConfig::new("juliet@example.com".parse().unwrap(), pencil())
    }

    async fn harness(config: HandshakerConfig) -> Harness {
        let _ = env_logger::builder().is_test(true).try_init();
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(16);
        let pipeline = Pipeline::new();
        let outbound = pipeline.outbound_stream();
        let handshaker = HandshakerPipe::new(config, commands_tx, events.clone()).unwrap();
        pipeline
            .add_last(Some("handshaker".to_owned()), handshaker.clone())
            .await
            .unwrap();
        pipeline.start();
        Harness {
            pipeline,
            handshaker,
            outbound,
            commands,
            events,
        }
    }

    impl Harness {
        async fn expect(&mut self) -> Element {
            self.outbound.next().await.unwrap().unwrap()
        }

        fn feed(&self, element: Element) {
            self.pipeline.read(element);
        }

        fn feed_server_open(&self) {
            self.feed(
                Element::builder("open", ns::FRAMING)
                    .attr("from", "example.com")
                    .attr("id", "stream-1")
                    .attr("version", "1.0")
                    .build(),
            );
        }

        fn feed_features(&self, children: Vec<Element>) {
            self.feed(
                Element::builder("features", ns::STREAM)
                    .append_all(children)
                    .build(),
            );
        }

        /// Drives the stream to `Negotiating` and authenticates with a
        /// scripted SCRAM server, ending on the post-SASL stream restart.
        async fn authenticate(&mut self) {
            let open = self.expect().await;
            assert!(open.is("open", ns::FRAMING));
            self.feed_server_open();
            self.feed_features(vec![mechanisms(&["SCRAM-SHA-1"])]);

            let auth = self.expect().await;
            assert!(auth.is("auth", ns::SASL));
            let mut party = ScramServer::<Sha1>::new(pencil());
            party.accept_response(&sasl_payload(&auth)).unwrap();
            let challenge = party.challenge().unwrap();
            self.feed(
                Element::builder("challenge", ns::SASL)
                    .append(Base64.encode(&challenge))
                    .build(),
            );

            let response = self.expect().await;
            assert!(response.is("response", ns::SASL));
            party.accept_response(&sasl_payload(&response)).unwrap();
            let signature = party.challenge().unwrap();
            self.feed(
                Element::builder("success", ns::SASL)
                    .append(Base64.encode(&signature))
                    .build(),
            );

            // Stream restart after authentication.
            let reopen = self.expect().await;
            assert!(reopen.is("open", ns::FRAMING));
            self.feed_server_open();
        }

        /// Continues from [`authenticate`][`Harness::authenticate`] through
        /// resource binding to `Completed`.
        async fn bind(&mut self, jid: &str) {
            self.feed_features(vec![Element::builder("bind", ns::BIND).build()]);
            let iq = self.expect().await;
            assert!(iq.is("iq", ns::CLIENT));
            assert_eq!(iq.attr("type"), Some("set"));
            let id = iq.attr("id").unwrap().to_owned();
            self.feed(bind_result(&id, jid));
            let mut state = self.handshaker.state_stream();
            state
                .wait_for(|s| *s == HandshakeState::Completed)
                .await
                .unwrap();
        }
    }

    fn mechanisms(names: &[&str]) -> Element {
        Element::builder("mechanisms", ns::SASL)
            .append_all(names.iter().map(|name| {
                Element::builder("mechanism", ns::SASL)
                    .append((*name).to_owned())
                    .build()
            }))
            .build()
    }

    fn sasl_payload(element: &Element) -> Vec<u8> {
        let text = element.text();
        let text = text.trim().to_owned();
        if text.is_empty() || text == "=" {
            Vec::new()
        } else {
            Base64.decode(text).unwrap()
        }
    }

    fn bind_result(id: &str, jid: &str) -> Element {
        Element::builder("iq", ns::CLIENT)
            .attr("type", "result")
            .attr("id", id)
            .append(
                Element::builder("bind", ns::BIND)
                    .append(Element::builder("jid", ns::BIND).append(jid.to_owned()).build())
                    .build(),
            )
            .build()
    }

    #[tokio::test]
    async fn start_sends_the_stream_opener() {
        let mut h = harness(config()).await;
        let open = h.expect().await;
        assert!(open.is("open", ns::FRAMING));
        assert_eq!(open.attr("to"), Some("example.com"));
        assert_eq!(open.attr("version"), Some("1.0"));
        assert_eq!(h.handshaker.state(), HandshakeState::Started);

        h.feed_server_open();
        let mut state = h.handshaker.state_stream();
        state
            .wait_for(|s| *s == HandshakeState::Negotiating)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn starttls_is_selected_before_sasl() {
        let mut h = harness(config()).await;
        let _ = h.expect().await;
        h.feed_server_open();
        // SASL listed first; the fixed order still picks StartTLS.
        h.feed_features(vec![
            mechanisms(&["SCRAM-SHA-1"]),
            Element::builder("starttls", ns::TLS).build(),
        ]);
        let request = h.expect().await;
        assert!(request.is("starttls", ns::TLS));
        assert_eq!(
            h.handshaker.negotiating_feature(),
            Some(StreamFeature::StartTls)
        );
    }

    #[tokio::test]
    async fn proceed_asks_the_session_for_tls_and_restarts_after() {
        let mut h = harness(config()).await;
        let _ = h.expect().await;
        h.feed_server_open();
        h.feed_features(vec![Element::builder("starttls", ns::TLS).build()]);
        let _ = h.expect().await; // <starttls/>
        h.feed(Element::builder("proceed", ns::TLS).build());

        assert_eq!(h.commands.recv().await, Some(SessionCommand::DeployTls));
        assert!(h
            .handshaker
            .negotiated_features()
            .contains(&StreamFeature::StartTls));

        // The session signals TLS completion; a new opener goes out.
        h.events
            .send(SessionEvent::StartTlsHandshakeCompleted)
            .unwrap();
        let reopen = h.expect().await;
        assert!(reopen.is("open", ns::FRAMING));
    }

    #[tokio::test]
    async fn authenticates_and_binds_to_the_server_jid() {
        let mut h = harness(config()).await;
        h.authenticate().await;
        h.bind("juliet@example.com/balcony-2").await;

        assert_eq!(
            h.handshaker.negotiated_jid(),
            Some("juliet@example.com/balcony-2".parse().unwrap())
        );
        let negotiated = h.handshaker.negotiated_features();
        assert!(negotiated.contains(&StreamFeature::Sasl));
        assert!(negotiated.contains(&StreamFeature::ResourceBinding));
        assert!(h.handshaker.sasl_properties().is_some());
        assert!(h.handshaker.handshake_error().is_none());
    }

    #[tokio::test]
    async fn preset_resource_is_requested() {
        let mut cfg = config();
        cfg.resource = Some("balcony".to_owned());
        let mut h = harness(cfg).await;
        h.authenticate().await;
        h.feed_features(vec![Element::builder("bind", ns::BIND).build()]);
        let iq = h.expect().await;
        let resource = iq
            .get_child("bind", ns::BIND)
            .and_then(|bind| bind.get_child("resource", ns::BIND))
            .map(|resource| resource.text());
        assert_eq!(resource.as_deref(), Some("balcony"));
    }

    #[tokio::test]
    async fn bind_result_with_foreign_id_is_not_authorized() {
        let mut h = harness(config()).await;
        h.authenticate().await;
        h.feed_features(vec![Element::builder("bind", ns::BIND).build()]);
        let _ = h.expect().await;
        h.feed(bind_result("not-the-right-id", "juliet@example.com/x"));

        let error = h.expect().await;
        assert!(error.is("error", ns::STREAM));
        assert_eq!(
            StreamError::try_from(&error).unwrap().condition,
            Condition::NotAuthorized
        );
        let close = h.expect().await;
        assert!(close.is("close", ns::FRAMING));
    }

    #[tokio::test]
    async fn sasl_failure_aborts_the_handshake() {
        let mut h = harness(config()).await;
        let _ = h.expect().await;
        h.feed_server_open();
        h.feed_features(vec![mechanisms(&["SCRAM-SHA-1"])]);
        let _ = h.expect().await; // <auth/>
        h.feed(
            Element::builder("failure", ns::SASL)
                .append(Element::builder("not-authorized", ns::SASL).build())
                .build(),
        );

        let close = h.expect().await;
        assert!(close.is("close", ns::FRAMING));
        assert!(matches!(
            h.handshaker.handshake_error(),
            Some(Error::Auth(AuthError::Fail(_)))
        ));
    }

    #[tokio::test]
    async fn no_common_mechanism_is_a_policy_violation() {
        let mut h = harness(config()).await;
        let _ = h.expect().await;
        h.feed_server_open();
        h.feed_features(vec![mechanisms(&["PLAIN"])]);

        let abort = h.expect().await;
        assert!(abort.is("abort", ns::SASL));
        let error = h.expect().await;
        assert_eq!(
            StreamError::try_from(&error).unwrap().condition,
            Condition::PolicyViolation
        );
        assert!(matches!(
            h.handshaker.handshake_error(),
            Some(Error::Auth(AuthError::NoMechanism))
        ));
    }

    #[tokio::test]
    async fn unknown_features_only_is_unsupported_feature() {
        let mut h = harness(config()).await;
        let _ = h.expect().await;
        h.feed_server_open();
        h.feed_features(vec![Element::builder("exotic", "urn:example:exotic").build()]);

        let error = h.expect().await;
        assert_eq!(
            StreamError::try_from(&error).unwrap().condition,
            Condition::UnsupportedFeature
        );
    }

    #[tokio::test]
    async fn informational_features_are_absorbed() {
        let mut h = harness(config()).await;
        let mut feature_events = h.handshaker.feature_events();
        let _ = h.expect().await;
        h.feed_server_open();
        h.feed_features(vec![
            Element::builder("sm", ns::SM).build(),
            mechanisms(&["SCRAM-SHA-1"]),
        ]);
        assert_eq!(
            feature_events.recv().await.unwrap(),
            StreamFeature::StreamManagement
        );
        let auth = h.expect().await;
        assert!(auth.is("auth", ns::SASL));
    }

    #[tokio::test]
    async fn features_outside_negotiating_is_policy_violation() {
        let mut h = harness(config()).await;
        let _ = h.expect().await;
        // No responding <open/> yet, so features are out of order.
        h.feed_features(vec![mechanisms(&["SCRAM-SHA-1"])]);
        let error = h.expect().await;
        assert_eq!(
            StreamError::try_from(&error).unwrap().condition,
            Condition::PolicyViolation
        );
    }

    #[tokio::test]
    async fn wrong_stream_version_is_rejected() {
        let mut h = harness(config()).await;
        let _ = h.expect().await;
        h.feed(
            Element::builder("open", ns::FRAMING)
                .attr("from", "example.com")
                .attr("version", "0.9")
                .build(),
        );
        let error = h.expect().await;
        assert_eq!(
            StreamError::try_from(&error).unwrap().condition,
            Condition::UnsupportedVersion
        );
        assert!(matches!(
            h.handshaker.handshake_error(),
            Some(Error::Protocol(ProtocolError::UnsupportedVersion(_)))
        ));
    }

    #[tokio::test]
    async fn wrong_from_is_rejected() {
        let mut h = harness(config()).await;
        let _ = h.expect().await;
        h.feed(
            Element::builder("open", ns::FRAMING)
                .attr("from", "evil.example.net")
                .attr("version", "1.0")
                .build(),
        );
        let error = h.expect().await;
        assert_eq!(
            StreamError::try_from(&error).unwrap().condition,
            Condition::InvalidFrom
        );
    }

    #[tokio::test]
    async fn open_after_completion_is_a_conflict() {
        let mut h = harness(config()).await;
        h.authenticate().await;
        h.bind("juliet@example.com/attic").await;

        h.feed_server_open();
        let error = h.expect().await;
        assert_eq!(
            StreamError::try_from(&error).unwrap().condition,
            Condition::Conflict
        );
    }

    #[tokio::test]
    async fn received_stream_error_is_recorded_and_closes() {
        let mut h = harness(config()).await;
        let _ = h.expect().await;
        h.feed_server_open();
        h.feed(
            StreamError::with_text(Condition::PolicyViolation, "be gone").to_element(),
        );
        let close = h.expect().await;
        assert!(close.is("close", ns::FRAMING));
        assert_eq!(
            h.handshaker.server_stream_error(),
            Some(StreamError::with_text(Condition::PolicyViolation, "be gone"))
        );
    }

    #[tokio::test]
    async fn outbound_stanzas_are_gated_until_completion() {
        let mut h = harness(config()).await;

        // A stanza written during negotiation is quarantined.
        h.pipeline.write(
            Element::builder("presence", ns::CLIENT).build(),
        );
        h.authenticate().await;
        h.bind("juliet@example.com/attic").await;

        // After completion stanzas pass.
        h.pipeline.write(
            Element::builder("message", ns::CLIENT).build(),
        );
        let out = h.expect().await;
        assert!(out.is("message", ns::CLIENT));
    }

    #[tokio::test]
    async fn inbound_stanzas_are_forwarded_after_completion() {
        let mut h = harness(config()).await;
        let mut inbound = h.pipeline.inbound_stream();
        h.authenticate().await;
        h.bind("juliet@example.com/attic").await;

        h.feed(
            Element::builder("message", ns::CLIENT)
                .attr("from", "romeo@example.net")
                .build(),
        );
        let message = inbound.next().await.unwrap().unwrap();
        assert!(message.is("message", ns::CLIENT));
    }

    #[tokio::test]
    async fn close_stream_is_idempotent_and_resolves_on_peer_close() {
        let mut h = harness(config()).await;
        h.authenticate().await;
        h.bind("juliet@example.com/attic").await;

        let handshaker = h.handshaker.clone();
        let closer = tokio::spawn(async move { handshaker.close_stream().await });
        let close = h.expect().await;
        assert!(close.is("close", ns::FRAMING));
        assert_eq!(h.handshaker.state(), HandshakeState::StreamClosing);

        h.feed(Element::builder("close", ns::FRAMING).build());
        closer.await.unwrap().unwrap();
        assert_eq!(h.handshaker.state(), HandshakeState::StreamClosed);

        // Closing again completes immediately.
        h.handshaker.close_stream().await.unwrap();
    }

    #[tokio::test]
    async fn peer_close_is_answered() {
        let mut h = harness(config()).await;
        let _ = h.expect().await;
        h.feed_server_open();
        h.feed(Element::builder("close", ns::FRAMING).build());
        let close = h.expect().await;
        assert!(close.is("close", ns::FRAMING));
        assert_eq!(h.handshaker.state(), HandshakeState::StreamClosed);
    }

    #[tokio::test]
    async fn connection_loss_forces_stream_closed() {
        let mut h = harness(config()).await;
        let _ = h.expect().await;
        h.feed_server_open();
        h.events.send(SessionEvent::ConnectionTerminated).unwrap();
        let mut state = h.handshaker.state_stream();
        state
            .wait_for(|s| *s == HandshakeState::StreamClosed)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn removal_disposes_the_handshaker() {
        let h = harness(config()).await;
        h.pipeline.remove("handshaker").await.unwrap();
        let mut state = h.handshaker.state_stream();
        state
            .wait_for(|s| *s == HandshakeState::Disposed)
            .await
            .unwrap();
        assert!(matches!(
            h.handshaker.close_stream().await,
            Err(Error::InvalidState)
        ));
    }

    #[tokio::test]
    async fn registering_is_refused() {
        let mut cfg = config();
        cfg.registering = true;
        let (commands_tx, _commands) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(16);
        assert!(HandshakerPipe::new(cfg, commands_tx, events).is_err());
    }
}
