// Copyright (c) 2025 skald contributors
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! # Session lifecycle
//!
//! A [`Session`] owns one XML [`Pipeline`] and one transport, drives the
//! handshake through a [`HandshakerPipe`] and exposes the steady-state
//! stanza exchange. The concrete transport (TCP, WebSocket, …) is an
//! external collaborator implementing [`Connector`] and [`Transport`].

use core::time::Duration;
use std::error::Error as StdError;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};

use futures::StreamExt;
use jid::Jid;
use minidom::Element;
use sasl::{Credential, CredentialKey, CredentialRetriever};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use crate::error::Error;
use crate::handshaker::{HandshakeState, HandshakerConfig, HandshakerPipe};
use crate::pipeline::{BlankPipe, Pipe, Pipeline, PipelineEvent, PipelineHandle};
use crate::stanza::Stanza;
use crate::stream_error::StreamError;

/// The well-known pipeline entry name the handshaker lives under.
pub const HANDSHAKER_PIPE: &str = "handshaker";

/// How long an orderly stream closure may take before the connection is
/// torn down anyway.
const LOCAL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Where the session currently stands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// No connection.
    Disconnected,
    /// Opening the transport.
    Connecting,
    /// Transport open, handshake not yet started.
    Connected,
    /// Stream negotiation in progress.
    Handshaking,
    /// Negotiation completed; stanzas flow.
    Online,
    /// Orderly shutdown in progress.
    Disconnecting,
    /// Released; terminal.
    Disposed,
}

/// Out-of-band event emitted by a session.
#[derive(Clone, Debug)]
pub enum SessionEvent {
    /// The transport reported connection loss.
    ConnectionTerminated,
    /// The transport finished deploying TLS after `<proceed/>`.
    StartTlsHandshakeCompleted,
    /// An exception fell off the end of the pipeline.
    ExceptionCaught(Arc<dyn StdError + Send + Sync>),
}

/// A request the handshaker sends to its owning session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionCommand {
    /// Negotiate TLS on the transport, then signal
    /// [`SessionEvent::StartTlsHandshakeCompleted`].
    DeployTls,
}

/// The session's side of the transport contract, given to a transport
/// adapter at connect time.
///
/// Each handle belongs to one connection attempt. Once the session has
/// moved on (reconnect, disconnect), signals from the old handle are
/// silently discarded.
#[derive(Clone)]
pub struct TransportHandle {
    pipeline: PipelineHandle,
    notices: mpsc::UnboundedSender<(u64, SessionEvent)>,
    current: Arc<AtomicU64>,
    generation: u64,
}

impl TransportHandle {
    fn is_current(&self) -> bool {
        self.current.load(Ordering::SeqCst) == self.generation
    }

    /// Delivers one received top-level XML element to the session.
    pub fn feed_xml_pipeline(&self, document: Element) {
        if self.is_current() {
            self.pipeline.read(document);
        } else {
            log::trace!("discarding document from a stale transport");
        }
    }

    /// Reports loss of the connection.
    pub fn connection_terminated(&self) {
        let _ = self
            .notices
            .send((self.generation, SessionEvent::ConnectionTerminated));
    }

    /// Reports that TLS deployment finished.
    pub fn tls_deployed(&self) {
        let _ = self
            .notices
            .send((self.generation, SessionEvent::StartTlsHandshakeCompleted));
    }
}

/// An established connection to an XMPP server.
pub trait Transport: Send + Sync + 'static {
    /// Queues one top-level document for transmission.
    fn send(&self, document: Element);

    /// Starts deploying TLS on the connection; completion is reported
    /// through [`TransportHandle::tls_deployed`].
    fn deploy_tls(&self);

    /// Tears the connection down.
    fn close(&self);
}

/// Opens connections to an XMPP server, perhaps multiple times.
///
/// When connecting with direct TLS, verifying the server certificate is
/// the connector's responsibility; the session never sees raw sockets.
pub trait Connector: Send + Sync + 'static {
    /// The transport this connector produces.
    type Transport: Transport;

    /// Opens a connection to `domain`'s server. The returned transport must
    /// feed everything it receives through `handle`.
    fn connect(
        &self,
        domain: &str,
        handle: TransportHandle,
    ) -> impl Future<Output = Result<Self::Transport, Error>> + Send;
}

/// Session configuration.
pub struct SessionConfig {
    /// The account to authenticate as; the domain decides where to
    /// connect.
    pub jid: Jid,
    /// SASL mechanisms to try, most preferred first.
    pub preferred_mechanisms: Vec<String>,
    /// Resource to request at bind time; the server chooses otherwise.
    pub resource: Option<String>,
}

impl SessionConfig {
    /// A configuration with the default mechanism list.
    pub fn new(jid: Jid) -> SessionConfig {
        SessionConfig {
            jid,
            preferred_mechanisms: vec!["SCRAM-SHA-1".to_owned()],
            resource: None,
        }
    }
}

struct SessionInner<C: Connector> {
    connector: C,
    config: SessionConfig,
    pipeline: Pipeline<Element, Element>,
    state_tx: watch::Sender<SessionState>,
    events: broadcast::Sender<SessionEvent>,
    /// Transport signals are tagged with the connection generation they
    /// belong to; anything older than `generation` is stale.
    notices: mpsc::UnboundedSender<(u64, SessionEvent)>,
    generation: Arc<AtomicU64>,
    transport: StdMutex<Option<Arc<C::Transport>>>,
    handshaker: StdMutex<Option<HandshakerPipe>>,
    jid: StdMutex<Option<Jid>>,
    /// Per-login background tasks: outbound pump and command worker.
    workers: StdMutex<Vec<JoinHandle<()>>>,
}

/// An XMPP client session.
///
/// Must be created inside a tokio runtime. Cloning yields another handle
/// to the same session.
pub struct Session<C: Connector> {
    inner: Arc<SessionInner<C>>,
}

impl<C: Connector> Clone for Session<C> {
    fn clone(&self) -> Self {
        Session {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Connector> Session<C> {
    /// Creates a disconnected session.
    pub fn new(config: SessionConfig, connector: C) -> Session<C> {
        let pipeline = Pipeline::new();
        let _ = pipeline.add_last(Some(HANDSHAKER_PIPE.to_owned()), BlankPipe);
        let (events, _) = broadcast::channel(64);
        let (state_tx, _) = watch::channel(SessionState::Disconnected);
        let (notices, notices_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(SessionInner {
            connector,
            config,
            pipeline,
            state_tx,
            events,
            notices,
            generation: Arc::new(AtomicU64::new(0)),
            transport: StdMutex::new(None),
            handshaker: StdMutex::new(None),
            jid: StdMutex::new(None),
            workers: StdMutex::new(Vec::new()),
        });
        tokio::spawn(forward_pipeline_exceptions(
            inner.pipeline.events(),
            inner.events.clone(),
        ));
        tokio::spawn(watch_transport_notices(Arc::downgrade(&inner), notices_rx));
        Session { inner }
    }

    /// The current session state.
    pub fn state(&self) -> SessionState {
        *self.inner.state_tx.borrow()
    }

    /// A watch over the session state.
    pub fn state_stream(&self) -> watch::Receiver<SessionState> {
        self.inner.state_tx.subscribe()
    }

    /// Subscribes to session events.
    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// The Jid negotiated at resource binding, while online.
    pub fn jid(&self) -> Option<Jid> {
        self.inner.jid.lock().expect("poisoned").clone()
    }

    /// The stream of inbound stanzas.
    ///
    /// Non-stanza documents surfacing at the inbound end are skipped.
    pub fn inbound_stanzas(&self) -> impl futures::Stream<Item = Stanza> + Send + 'static {
        self.inner.pipeline.inbound_stream().filter_map(|item| async move {
            match item {
                Ok(element) => Stanza::try_from(element).ok(),
                Err(_) => None,
            }
        })
    }

    /// Delivers one received top-level XML element into the pipeline.
    ///
    /// This is what [`TransportHandle::feed_xml_pipeline`] calls.
    pub fn feed_xml_pipeline(&self, document: Element) {
        self.inner.pipeline.read(document);
    }

    /// Logs in with a plaintext password.
    ///
    /// Precondition: the session is [`SessionState::Disconnected`].
    /// Resolves to the Jid bound by the server once the session is
    /// [`SessionState::Online`].
    pub async fn login(&self, password: impl Into<String>) -> Result<Jid, Error> {
        let password = password.into();
        let retriever: Arc<dyn CredentialRetriever> =
            Arc::new(move |_: &str, _: &str, key: CredentialKey| match key {
                CredentialKey::Password => Some(Credential::Password(password.clone())),
                _ => None,
            });
        let resource = self.inner.config.resource.clone();
        self.login_with(retriever, resource, false).await
    }

    /// Logs in with credentials pulled from `retriever`, requesting
    /// `resource` at bind time.
    ///
    /// In-band registration is a non-goal; `registering` must be `false`.
    pub async fn login_with(
        &self,
        retriever: Arc<dyn CredentialRetriever>,
        resource: Option<String>,
        registering: bool,
    ) -> Result<Jid, Error> {
        if registering {
            return Err(Error::InvalidState);
        }
        let entered = self.inner.state_tx.send_if_modified(|state| {
            if *state == SessionState::Disconnected {
                *state = SessionState::Connecting;
                true
            } else {
                false
            }
        });
        if !entered {
            return Err(Error::InvalidState);
        }
        // If this future is dropped mid-login, tear the connection down.
        let mut guard = LoginGuard {
            inner: Some(Arc::clone(&self.inner)),
        };
        let result = self.do_login(retriever, resource).await;
        guard.inner = None;
        match result {
            Ok(jid) => Ok(jid),
            Err(e) => {
                log::warn!("login failed: {}", e);
                self.inner.kill_connection().await;
                Err(e)
            }
        }
    }

    async fn do_login(
        &self,
        retriever: Arc<dyn CredentialRetriever>,
        resource: Option<String>,
    ) -> Result<Jid, Error> {
        let inner = &self.inner;

        // Open the transport.
        let handle = TransportHandle {
            pipeline: inner.pipeline.handle(),
            notices: inner.notices.clone(),
            current: Arc::clone(&inner.generation),
            generation: inner.generation.load(Ordering::SeqCst),
        };
        let domain = inner.config.jid.domain().to_owned();
        let transport = Arc::new(inner.connector.connect(&domain, handle).await?);
        *inner.transport.lock().expect("poisoned") = Some(Arc::clone(&transport));
        inner.set_state(SessionState::Connected);

        // Pump outbound documents into the transport.
        let mut outbound = inner.pipeline.outbound_stream();
        let pump_transport = Arc::clone(&transport);
        let pump = tokio::spawn(async move {
            while let Some(item) = outbound.next().await {
                match item {
                    Ok(document) => pump_transport.send(document),
                    Err(e) => log::warn!("outbound pump lagging: {}", e),
                }
            }
        });

        // Serve the handshaker's requests.
        let (commands_tx, mut commands_rx) = mpsc::unbounded_channel();
        let command_transport = Arc::clone(&transport);
        let commands = tokio::spawn(async move {
            while let Some(command) = commands_rx.recv().await {
                match command {
                    SessionCommand::DeployTls => command_transport.deploy_tls(),
                }
            }
        });
        {
            let mut workers = inner.workers.lock().expect("poisoned");
            workers.push(pump);
            workers.push(commands);
        }

        // Install a fresh handshaker in place of the blank pipe and run
        // the pipeline.
        let mut config = HandshakerConfig::new(inner.config.jid.clone(), retriever);
        config.preferred_mechanisms = inner.config.preferred_mechanisms.clone();
        config.resource = resource;
        let handshaker = HandshakerPipe::new(config, commands_tx, inner.events.clone())?;
        *inner.handshaker.lock().expect("poisoned") = Some(handshaker.clone());
        inner
            .pipeline
            .replace_shared(HANDSHAKER_PIPE, Arc::new(handshaker.clone()) as Arc<dyn Pipe>)
            .await
            .map_err(|_| Error::InvalidState)?;
        inner.pipeline.start();
        inner.set_state(SessionState::Handshaking);

        // Wait for the handshake to conclude, one way or the other.
        let mut handshake = handshaker.state_stream();
        let outcome = handshake
            .wait_for(|state| {
                matches!(
                    state,
                    HandshakeState::Completed
                        | HandshakeState::StreamClosed
                        | HandshakeState::Disposed
                )
            })
            .await;
        match outcome.as_deref() {
            Ok(HandshakeState::Completed) => {
                let jid = handshaker
                    .negotiated_jid()
                    .unwrap_or_else(|| inner.config.jid.clone());
                *inner.jid.lock().expect("poisoned") = Some(jid.clone());
                inner.set_state(SessionState::Online);
                log::info!("online as {}", jid);
                Ok(jid)
            }
            _ => Err(handshaker
                .handshake_error()
                .unwrap_or(Error::Disconnected)),
        }
    }

    /// Sends a stanza.
    pub fn send(&self, stanza: Stanza) -> Result<(), Error> {
        if self.state() == SessionState::Disposed {
            return Err(Error::InvalidState);
        }
        self.inner.pipeline.write(stanza.into_element());
        Ok(())
    }

    /// Sends a stream error and closes the stream.
    pub fn send_stream_error(&self, error: StreamError) -> Result<(), Error> {
        let handshaker = self.inner.handshaker.lock().expect("poisoned").clone();
        match handshaker {
            Some(handshaker) => {
                handshaker.send_stream_error(error);
                Ok(())
            }
            None => Err(Error::InvalidState),
        }
    }

    /// Disconnects, preferring an orderly stream closure. Idempotent.
    pub async fn disconnect(&self) {
        let entered = self.inner.state_tx.send_if_modified(|state| match state {
            SessionState::Disconnected | SessionState::Disposed => false,
            _ => {
                *state = SessionState::Disconnecting;
                true
            }
        });
        if !entered {
            return;
        }
        let handshaker = self.inner.handshaker.lock().expect("poisoned").clone();
        if let Some(handshaker) = handshaker {
            match tokio::time::timeout(LOCAL_SHUTDOWN_TIMEOUT, handshaker.close_stream()).await {
                Ok(Ok(())) => log::debug!("stream closed cleanly"),
                Ok(Err(e)) => log::debug!("stream closure failed: {}", e),
                Err(_) => log::debug!("giving up on clean stream closure after timeout"),
            }
        }
        self.inner.kill_connection().await;
    }

    /// Disconnects if needed, then releases the session. Terminal.
    pub async fn dispose(&self) {
        if self.state() == SessionState::Disposed {
            return;
        }
        self.disconnect().await;
        self.inner.state_tx.send_replace(SessionState::Disposed);
        log::debug!("session disposed");
    }
}

struct LoginGuard<C: Connector> {
    inner: Option<Arc<SessionInner<C>>>,
}

impl<C: Connector> Drop for LoginGuard<C> {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            log::debug!("login cancelled, killing the connection");
            tokio::spawn(async move { inner.kill_connection().await });
        }
    }
}

impl<C: Connector> SessionInner<C> {
    fn set_state(&self, new: SessionState) {
        self.state_tx.send_if_modified(|state| {
            if *state == SessionState::Disposed || *state == new {
                false
            } else {
                log::debug!("session {:?} -> {:?}", state, new);
                *state = new;
                true
            }
        });
    }

    /// Tears everything down and returns to `Disconnected`.
    async fn kill_connection(&self) {
        // Everything the current transport still signals is stale now.
        self.generation.fetch_add(1, Ordering::SeqCst);
        let handshaker = self.handshaker.lock().expect("poisoned").take();
        if handshaker.is_some() {
            // Detach the handshaker (disposing it) before the transport
            // goes away, restoring the placeholder for the next login.
            let _ = self.pipeline.replace(HANDSHAKER_PIPE, BlankPipe).await;
        }
        self.pipeline.stop_now().await;
        if let Some(transport) = self.transport.lock().expect("poisoned").take() {
            transport.close();
        }
        let workers = std::mem::take(&mut *self.workers.lock().expect("poisoned"));
        for worker in workers {
            worker.abort();
        }
        *self.jid.lock().expect("poisoned") = None;
        self.set_state(SessionState::Disconnected);
    }
}

async fn forward_pipeline_exceptions(
    mut pipeline_events: broadcast::Receiver<PipelineEvent>,
    events: broadcast::Sender<SessionEvent>,
) {
    loop {
        match pipeline_events.recv().await {
            Ok(PipelineEvent::ExceptionCaught { error, .. }) => {
                let _ = events.send(SessionEvent::ExceptionCaught(error));
            }
            Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

/// Validates transport signals against the connection generation they were
/// sent for, publishes the surviving ones as session events and reacts to
/// connection loss.
async fn watch_transport_notices<C: Connector>(
    weak: Weak<SessionInner<C>>,
    mut notices: mpsc::UnboundedReceiver<(u64, SessionEvent)>,
) {
    while let Some((generation, event)) = notices.recv().await {
        let Some(inner) = weak.upgrade() else { return };
        if inner.generation.load(Ordering::SeqCst) != generation {
            log::trace!("discarding {:?} from a stale transport", event);
            continue;
        }
        let terminated = matches!(event, SessionEvent::ConnectionTerminated);
        let _ = inner.events.send(event);
        if terminated {
            log::warn!("connection terminated");
            inner.kill_connection().await;
        }
    }
}
