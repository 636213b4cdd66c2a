// Copyright (c) 2025 skald contributors
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! # Duplex processing pipeline
//!
//! A [`Pipeline`] routes objects through an ordered, dynamically mutable
//! chain of [`Pipe`]s in two independent directions: *reading* (inbound,
//! from the server) and *writing* (outbound, to the server).
//!
//! The entry list is ordered from the outbound end (transport side) to the
//! inbound end (application side). Reading traverses it front to back,
//! writing back to front. The terminal output of each direction is published
//! on a broadcast stream whose element type is fixed by the pipeline;
//! objects of another runtime type arriving at a terminal are silently
//! dropped.
//!
//! One reader task and one writer task run per pipeline. Both take objects
//! from their queue and thread them through the pipes under a shared lock on
//! the entry list; structural mutations take the exclusive lock on a
//! dedicated control task, so a pipe may reconfigure the pipeline from
//! within its own hooks without blocking.

use core::any::Any;
use core::fmt;
use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll};
use std::error::Error as StdError;
use std::sync::{Arc, Mutex as StdMutex, Weak};

use tokio::sync::{broadcast, mpsc, oneshot, watch, RwLock};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;

/// An object travelling through a pipeline.
pub type Object = Box<dyn Any + Send>;

/// An error raised by a pipe hook.
pub type PipeError = Box<dyn StdError + Send + Sync>;

/// Capacity of the terminal and event broadcast channels.
const STREAM_BUFFER: usize = 2048;

/// A processing stage of a [`Pipeline`].
///
/// Every hook has a default implementation, so a pipe only implements the
/// hooks it cares about; the defaults forward objects untouched and rethrow
/// exceptions. Emitting zero successors from a processing hook drops the
/// object.
pub trait Pipe: Send + Sync + 'static {
    /// Called after this pipe was inserted into a pipeline.
    fn on_added(&self, _pipeline: &PipelineHandle) {}

    /// Called after this pipe was removed from a pipeline.
    fn on_removed(&self, _pipeline: &PipelineHandle) {}

    /// Processes an object travelling inbound; successors go into `out`.
    fn on_reading(
        &self,
        _pipeline: &PipelineHandle,
        obj: Object,
        out: &mut Vec<Object>,
    ) -> Result<(), PipeError> {
        out.push(obj);
        Ok(())
    }

    /// Processes an object travelling outbound; successors go into `out`.
    fn on_writing(
        &self,
        _pipeline: &PipelineHandle,
        obj: Object,
        out: &mut Vec<Object>,
    ) -> Result<(), PipeError> {
        out.push(obj);
        Ok(())
    }

    /// Offered an exception raised by an earlier pipe of the reading
    /// direction; returning `Ok` stops the propagation.
    fn catch_reading_exception(
        &self,
        _pipeline: &PipelineHandle,
        cause: PipeError,
    ) -> Result<(), PipeError> {
        Err(cause)
    }

    /// Offered an exception raised by an earlier pipe of the writing
    /// direction; returning `Ok` stops the propagation.
    fn catch_writing_exception(
        &self,
        _pipeline: &PipelineHandle,
        cause: PipeError,
    ) -> Result<(), PipeError> {
        Err(cause)
    }
}

/// A pipe that forwards everything untouched.
///
/// Useful as a placeholder to be replaced later.
#[derive(Debug, Default)]
pub struct BlankPipe;

impl Pipe for BlankPipe {}

/// The processing direction an object travels in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Inbound, from the server towards the application.
    Reading,
    /// Outbound, from the application towards the server.
    Writing,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Direction::Reading => f.write_str("reading"),
            Direction::Writing => f.write_str("writing"),
        }
    }
}

/// Whether the worker tasks of a pipeline are running.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineState {
    /// No worker tasks; queued objects wait.
    Stopped,
    /// Reader and writer tasks are draining the queues.
    Running,
}

/// Out-of-band event emitted by a pipeline.
#[derive(Clone, Debug)]
pub enum PipelineEvent {
    /// An exception travelled past the last pipe of a direction without
    /// being caught.
    ExceptionCaught {
        /// The direction the failing object travelled in.
        direction: Direction,
        /// The cause, as rethrown by the last pipe.
        error: Arc<dyn StdError + Send + Sync>,
    },
}

/// An error applying a structural pipeline mutation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PipelineError {
    /// The requested name is already taken by another entry.
    NameInUse(String),
    /// No entry has the given name.
    NoSuchEntry(String),
    /// The pipeline has no entries.
    Empty,
    /// The pipeline was dropped before the mutation could be applied.
    Dropped,
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PipelineError::NameInUse(name) => write!(f, "pipe name `{}` already in use", name),
            PipelineError::NoSuchEntry(name) => write!(f, "no pipe named `{}`", name),
            PipelineError::Empty => write!(f, "the pipeline has no entries"),
            PipelineError::Dropped => write!(f, "the pipeline is gone"),
        }
    }
}

impl StdError for PipelineError {}

/// Completion token of an enqueued structural mutation.
///
/// Awaiting it yields the outcome of the mutation. Dropping it is fine; the
/// mutation is applied either way. A pipe must not await a receipt from
/// within one of its own hooks.
#[derive(Debug)]
pub struct MutationReceipt {
    rx: oneshot::Receiver<Result<(), PipelineError>>,
}

impl Future for MutationReceipt {
    type Output = Result<(), PipelineError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|result| match result {
            Ok(result) => result,
            Err(_) => Err(PipelineError::Dropped),
        })
    }
}

struct Entry {
    name: Option<String>,
    pipe: Arc<dyn Pipe>,
}

enum MutationKind {
    AddFirst {
        name: Option<String>,
        pipe: Arc<dyn Pipe>,
    },
    AddLast {
        name: Option<String>,
        pipe: Arc<dyn Pipe>,
    },
    AddBefore {
        anchor: String,
        name: Option<String>,
        pipe: Arc<dyn Pipe>,
    },
    AddAfter {
        anchor: String,
        name: Option<String>,
        pipe: Arc<dyn Pipe>,
    },
    Remove {
        name: String,
    },
    RemoveFirst,
    RemoveLast,
    Replace {
        name: String,
        pipe: Arc<dyn Pipe>,
    },
}

struct Mutation {
    kind: MutationKind,
    ack: oneshot::Sender<Result<(), PipelineError>>,
}

struct Inner {
    entries: RwLock<Vec<Entry>>,
    state_tx: watch::Sender<PipelineState>,
    read_tx: mpsc::UnboundedSender<Object>,
    write_tx: mpsc::UnboundedSender<Object>,
    control_tx: mpsc::UnboundedSender<Mutation>,
    event_tx: broadcast::Sender<PipelineEvent>,
    read_rx: StdMutex<Option<mpsc::UnboundedReceiver<Object>>>,
    write_rx: StdMutex<Option<mpsc::UnboundedReceiver<Object>>>,
    workers: StdMutex<Vec<JoinHandle<()>>>,
}

/// A type-erased, weak view of a pipeline, handed to pipe hooks.
///
/// All operations become no-ops (or resolve to
/// [`PipelineError::Dropped`]) once the pipeline itself is gone, which
/// breaks the ownership cycle between a pipeline and pipes that keep a
/// handle to it.
#[derive(Clone)]
pub struct PipelineHandle {
    inner: Weak<Inner>,
}

impl PipelineHandle {
    /// Feeds an object into the reading direction.
    pub fn read<T: Any + Send>(&self, obj: T) {
        if let Some(inner) = self.inner.upgrade() {
            let _ = inner.read_tx.send(Box::new(obj));
        }
    }

    /// Feeds an object into the writing direction.
    pub fn write<T: Any + Send>(&self, obj: T) {
        eprintln!("DIAG handle.write called, upgrade={:?}", self.inner.upgrade().is_some());
        if let Some(inner) = self.inner.upgrade() {
            let r = inner.write_tx.send(Box::new(obj));
            eprintln!("DIAG handle.write send result={:?}", r.is_ok());
        }
    }

    /// The current pipeline state.
    pub fn state(&self) -> PipelineState {
        match self.inner.upgrade() {
            Some(inner) => *inner.state_tx.borrow(),
            None => PipelineState::Stopped,
        }
    }

    /// A watch over the pipeline state, if the pipeline is still alive.
    pub fn state_stream(&self) -> Option<watch::Receiver<PipelineState>> {
        self.inner.upgrade().map(|inner| inner.state_tx.subscribe())
    }

    /// Subscribes to pipeline events, if the pipeline is still alive.
    pub fn events(&self) -> Option<broadcast::Receiver<PipelineEvent>> {
        self.inner.upgrade().map(|inner| inner.event_tx.subscribe())
    }

    fn mutate(&self, kind: MutationKind) -> MutationReceipt {
        let (ack, rx) = oneshot::channel();
        if let Some(inner) = self.inner.upgrade() {
            let _ = inner.control_tx.send(Mutation { kind, ack });
        }
        MutationReceipt { rx }
    }

    /// Inserts a pipe at the outbound end.
    pub fn add_first(&self, name: Option<String>, pipe: impl Pipe) -> MutationReceipt {
        self.mutate(MutationKind::AddFirst {
            name,
            pipe: Arc::new(pipe),
        })
    }

    /// Inserts a pipe at the inbound end.
    pub fn add_last(&self, name: Option<String>, pipe: impl Pipe) -> MutationReceipt {
        self.mutate(MutationKind::AddLast {
            name,
            pipe: Arc::new(pipe),
        })
    }

    /// Inserts a pipe on the outbound side of the named entry.
    pub fn add_before(
        &self,
        anchor: impl Into<String>,
        name: Option<String>,
        pipe: impl Pipe,
    ) -> MutationReceipt {
        self.mutate(MutationKind::AddBefore {
            anchor: anchor.into(),
            name,
            pipe: Arc::new(pipe),
        })
    }

    /// Inserts a pipe on the inbound side of the named entry.
    pub fn add_after(
        &self,
        anchor: impl Into<String>,
        name: Option<String>,
        pipe: impl Pipe,
    ) -> MutationReceipt {
        self.mutate(MutationKind::AddAfter {
            anchor: anchor.into(),
            name,
            pipe: Arc::new(pipe),
        })
    }

    /// Removes the named entry.
    pub fn remove(&self, name: impl Into<String>) -> MutationReceipt {
        self.mutate(MutationKind::Remove { name: name.into() })
    }

    /// Removes the entry at the outbound end.
    pub fn remove_first(&self) -> MutationReceipt {
        self.mutate(MutationKind::RemoveFirst)
    }

    /// Removes the entry at the inbound end.
    pub fn remove_last(&self) -> MutationReceipt {
        self.mutate(MutationKind::RemoveLast)
    }

    /// Swaps the pipe of the named entry, keeping the name.
    pub fn replace(&self, name: impl Into<String>, pipe: impl Pipe) -> MutationReceipt {
        self.mutate(MutationKind::Replace {
            name: name.into(),
            pipe: Arc::new(pipe),
        })
    }

    /// Swaps the pipe of the named entry with an already shared pipe.
    pub fn replace_shared(
        &self,
        name: impl Into<String>,
        pipe: Arc<dyn Pipe>,
    ) -> MutationReceipt {
        self.mutate(MutationKind::Replace {
            name: name.into(),
            pipe,
        })
    }
}

/// A duplex, thread-safe chain of pipes.
///
/// `I` is the element type of the inbound terminal stream, `O` of the
/// outbound one.
pub struct Pipeline<I, O> {
    inner: Arc<Inner>,
    inbound_tx: broadcast::Sender<I>,
    outbound_tx: broadcast::Sender<O>,
}

impl<I, O> Clone for Pipeline<I, O> {
    fn clone(&self) -> Self {
        Pipeline {
            inner: Arc::clone(&self.inner),
            inbound_tx: self.inbound_tx.clone(),
            outbound_tx: self.outbound_tx.clone(),
        }
    }
}

impl<I, O> Pipeline<I, O>
where
    I: Any + Clone + Send + 'static,
    O: Any + Clone + Send + 'static,
{
    /// Creates a stopped, empty pipeline.
    ///
    /// Must be called inside a tokio runtime.
    pub fn new() -> Pipeline<I, O> {
        let (read_tx, read_rx) = mpsc::unbounded_channel();
        let (write_tx, write_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (event_tx, _) = broadcast::channel(STREAM_BUFFER);
        let (inbound_tx, _) = broadcast::channel(STREAM_BUFFER);
        let (outbound_tx, _) = broadcast::channel(STREAM_BUFFER);
        let (state_tx, _) = watch::channel(PipelineState::Stopped);
        let inner = Arc::new(Inner {
            entries: RwLock::new(Vec::new()),
            state_tx,
            read_tx,
            write_tx,
            control_tx,
            event_tx,
            read_rx: StdMutex::new(Some(read_rx)),
            write_rx: StdMutex::new(Some(write_rx)),
            workers: StdMutex::new(Vec::new()),
        });
        tokio::spawn(control_worker(Arc::downgrade(&inner), control_rx));
        Pipeline {
            inner,
            inbound_tx,
            outbound_tx,
        }
    }

    /// A weak, type-erased handle, as handed to pipe hooks.
    pub fn handle(&self) -> PipelineHandle {
        PipelineHandle {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Feeds an object into the reading direction.
    pub fn read<T: Any + Send>(&self, obj: T) {
        let _ = self.inner.read_tx.send(Box::new(obj));
    }

    /// Feeds an object into the writing direction.
    pub fn write<T: Any + Send>(&self, obj: T) {
        let _ = self.inner.write_tx.send(Box::new(obj));
    }

    /// The current state.
    pub fn state(&self) -> PipelineState {
        *self.inner.state_tx.borrow()
    }

    /// A watch over the state.
    pub fn state_stream(&self) -> watch::Receiver<PipelineState> {
        self.inner.state_tx.subscribe()
    }

    /// Subscribes to out-of-band pipeline events.
    pub fn events(&self) -> broadcast::Receiver<PipelineEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Subscribes to the inbound terminal.
    ///
    /// Listeners observe objects in the order they exited the pipeline.
    pub fn inbound_stream(&self) -> BroadcastStream<I> {
        BroadcastStream::new(self.inbound_tx.subscribe())
    }

    /// Subscribes to the outbound terminal.
    pub fn outbound_stream(&self) -> BroadcastStream<O> {
        BroadcastStream::new(self.outbound_tx.subscribe())
    }

    /// Spawns the reader and writer tasks. A no-op if already running.
    pub fn start(&self) {
        let changed = self.inner.state_tx.send_if_modified(|state| {
            if *state == PipelineState::Stopped {
                *state = PipelineState::Running;
                true
            } else {
                false
            }
        });
        if !changed {
            return;
        }
        log::debug!("pipeline starting");
        let read_rx = self
            .inner
            .read_rx
            .lock()
            .expect("pipeline poisoned")
            .take()
            .expect("reader queue in use despite stopped state");
        let write_rx = self
            .inner
            .write_rx
            .lock()
            .expect("pipeline poisoned")
            .take()
            .expect("writer queue in use despite stopped state");
        let reader = tokio::spawn(run_worker(
            Arc::downgrade(&self.inner),
            Direction::Reading,
            read_rx,
            terminal_fn(self.inbound_tx.clone(), Direction::Reading),
        ));
        let writer = tokio::spawn(run_worker(
            Arc::downgrade(&self.inner),
            Direction::Writing,
            write_rx,
            terminal_fn(self.outbound_tx.clone(), Direction::Writing),
        ));
        let mut workers = self.inner.workers.lock().expect("pipeline poisoned");
        workers.push(reader);
        workers.push(writer);
    }

    async fn park_workers(&self) {
        let changed = self.inner.state_tx.send_if_modified(|state| {
            if *state == PipelineState::Running {
                *state = PipelineState::Stopped;
                true
            } else {
                false
            }
        });
        if !changed {
            return;
        }
        let workers = {
            let mut workers = self.inner.workers.lock().expect("pipeline poisoned");
            std::mem::take(&mut *workers)
        };
        for worker in workers {
            let _ = worker.await;
        }
        log::debug!("pipeline stopped");
    }

    /// Parks the worker tasks after their in-flight objects finish.
    ///
    /// Queued objects stay put and are processed by a later [`start`][`Pipeline::start`].
    pub async fn stop(&self) {
        self.park_workers().await;
    }

    /// Like [`stop`][`Pipeline::stop`], but abandons all queued objects.
    pub async fn stop_now(&self) {
        self.park_workers().await;
        for slot in [&self.inner.read_rx, &self.inner.write_rx] {
            if let Some(rx) = slot.lock().expect("pipeline poisoned").as_mut() {
                while rx.try_recv().is_ok() {}
            }
        }
    }

    /// Inserts a pipe at the outbound end.
    pub fn add_first(&self, name: Option<String>, pipe: impl Pipe) -> MutationReceipt {
        self.handle().add_first(name, pipe)
    }

    /// Inserts a pipe at the inbound end.
    pub fn add_last(&self, name: Option<String>, pipe: impl Pipe) -> MutationReceipt {
        self.handle().add_last(name, pipe)
    }

    /// Inserts a pipe on the outbound side of the named entry.
    pub fn add_before(
        &self,
        anchor: impl Into<String>,
        name: Option<String>,
        pipe: impl Pipe,
    ) -> MutationReceipt {
        self.handle().add_before(anchor, name, pipe)
    }

    /// Inserts a pipe on the inbound side of the named entry.
    pub fn add_after(
        &self,
        anchor: impl Into<String>,
        name: Option<String>,
        pipe: impl Pipe,
    ) -> MutationReceipt {
        self.handle().add_after(anchor, name, pipe)
    }

    /// Removes the named entry.
    pub fn remove(&self, name: impl Into<String>) -> MutationReceipt {
        self.handle().remove(name)
    }

    /// Removes the entry at the outbound end.
    pub fn remove_first(&self) -> MutationReceipt {
        self.handle().remove_first()
    }

    /// Removes the entry at the inbound end.
    pub fn remove_last(&self) -> MutationReceipt {
        self.handle().remove_last()
    }

    /// Swaps the pipe of the named entry, keeping the name.
    pub fn replace(&self, name: impl Into<String>, pipe: impl Pipe) -> MutationReceipt {
        self.handle().replace(name, pipe)
    }

    /// Swaps the pipe of the named entry with an already shared pipe.
    pub fn replace_shared(
        &self,
        name: impl Into<String>,
        pipe: Arc<dyn Pipe>,
    ) -> MutationReceipt {
        self.handle().replace_shared(name, pipe)
    }
}

impl<I, O> Default for Pipeline<I, O>
where
    I: Any + Clone + Send + 'static,
    O: Any + Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

fn terminal_fn<T: Any + Clone + Send + 'static>(
    tx: broadcast::Sender<T>,
    direction: Direction,
) -> Box<dyn Fn(Object) + Send + Sync> {
    Box::new(move |obj: Object| match obj.downcast::<T>() {
        Ok(obj) => {
            // No receivers is fine; the object simply goes unobserved.
            let _ = tx.send(*obj);
        }
        Err(_) => {
            log::trace!("dropping type-mismatched object at the {} terminal", direction);
        }
    })
}

async fn control_worker(weak: Weak<Inner>, mut control_rx: mpsc::UnboundedReceiver<Mutation>) {
    while let Some(Mutation { kind, ack }) = control_rx.recv().await {
        let Some(inner) = weak.upgrade() else {
            let _ = ack.send(Err(PipelineError::Dropped));
            continue;
        };
        let handle = PipelineHandle {
            inner: weak.clone(),
        };
        let result = apply_mutation(&inner, &handle, kind).await;
        let _ = ack.send(result);
    }
}

async fn apply_mutation(
    inner: &Inner,
    handle: &PipelineHandle,
    kind: MutationKind,
) -> Result<(), PipelineError> {
    fn check_name(entries: &[Entry], name: &Option<String>) -> Result<(), PipelineError> {
        match name {
            Some(name) if entries.iter().any(|e| e.name.as_deref() == Some(name.as_str())) => {
                Err(PipelineError::NameInUse(name.clone()))
            }
            _ => Ok(()),
        }
    }

    fn position(entries: &[Entry], name: &str) -> Result<usize, PipelineError> {
        entries
            .iter()
            .position(|e| e.name.as_deref() == Some(name))
            .ok_or_else(|| PipelineError::NoSuchEntry(name.to_owned()))
    }

    let mut added: Option<Arc<dyn Pipe>> = None;
    let mut removed: Option<Arc<dyn Pipe>> = None;
    let result = {
        let mut entries = inner.entries.write().await;
        match kind {
            MutationKind::AddFirst { name, pipe } => check_name(&entries, &name).map(|()| {
                added = Some(Arc::clone(&pipe));
                entries.insert(0, Entry { name, pipe });
            }),
            MutationKind::AddLast { name, pipe } => check_name(&entries, &name).map(|()| {
                added = Some(Arc::clone(&pipe));
                entries.push(Entry { name, pipe });
            }),
            MutationKind::AddBefore { anchor, name, pipe } => check_name(&entries, &name)
                .and_then(|()| position(&entries, &anchor))
                .map(|idx| {
                    added = Some(Arc::clone(&pipe));
                    entries.insert(idx, Entry { name, pipe });
                }),
            MutationKind::AddAfter { anchor, name, pipe } => check_name(&entries, &name)
                .and_then(|()| position(&entries, &anchor))
                .map(|idx| {
                    added = Some(Arc::clone(&pipe));
                    entries.insert(idx + 1, Entry { name, pipe });
                }),
            MutationKind::Remove { name } => position(&entries, &name).map(|idx| {
                removed = Some(entries.remove(idx).pipe);
            }),
            MutationKind::RemoveFirst => {
                if entries.is_empty() {
                    Err(PipelineError::Empty)
                } else {
                    removed = Some(entries.remove(0).pipe);
                    Ok(())
                }
            }
            MutationKind::RemoveLast => match entries.pop() {
                Some(entry) => {
                    removed = Some(entry.pipe);
                    Ok(())
                }
                None => Err(PipelineError::Empty),
            },
            MutationKind::Replace { name, pipe } => position(&entries, &name).map(|idx| {
                added = Some(Arc::clone(&pipe));
                removed = Some(std::mem::replace(&mut entries[idx].pipe, pipe));
            }),
        }
    };
    // Hooks run outside the exclusive lock so they may mutate in turn.
    if let Some(pipe) = removed {
        pipe.on_removed(handle);
    }
    if let Some(pipe) = added {
        pipe.on_added(handle);
    }
    result
}

async fn run_worker(
    weak: Weak<Inner>,
    direction: Direction,
    mut rx: mpsc::UnboundedReceiver<Object>,
    terminal: Box<dyn Fn(Object) + Send + Sync>,
) {
    let mut state_rx = match weak.upgrade() {
        Some(inner) => inner.state_tx.subscribe(),
        None => return,
    };
    loop {
        if *state_rx.borrow_and_update() != PipelineState::Running {
            break;
        }
        tokio::select! {
            biased;
            changed = state_rx.changed() => {
                if changed.is_err() {
                    return;
                }
                // Loop around to re-check the state.
            }
            obj = rx.recv() => match obj {
                Some(obj) => {
                    let Some(inner) = weak.upgrade() else { return };
                    let handle = PipelineHandle { inner: weak.clone() };
                    process(&inner, &handle, direction, obj, &*terminal).await;
                }
                None => return,
            },
        }
    }
    // Parked: hand the queue back for a later start.
    if let Some(inner) = weak.upgrade() {
        let slot = match direction {
            Direction::Reading => &inner.read_rx,
            Direction::Writing => &inner.write_rx,
        };
        *slot.lock().expect("pipeline poisoned") = Some(rx);
    }
}

async fn process(
    inner: &Inner,
    handle: &PipelineHandle,
    direction: Direction,
    obj: Object,
    terminal: &(dyn Fn(Object) + Send + Sync),
) {
    let entries = inner.entries.read().await;
    let order: Vec<usize> = match direction {
        Direction::Reading => (0..entries.len()).collect(),
        Direction::Writing => (0..entries.len()).rev().collect(),
    };
    let mut objs = vec![obj];
    for (pos, &idx) in order.iter().enumerate() {
        let entry = &entries[idx];
        let mut out = Vec::new();
        let mut failure = None;
        for obj in objs {
            let result = match direction {
                Direction::Reading => entry.pipe.on_reading(handle, obj, &mut out),
                Direction::Writing => entry.pipe.on_writing(handle, obj, &mut out),
            };
            if let Err(e) = result {
                failure = Some(e);
                break;
            }
        }
        if let Some(mut cause) = failure {
            for &later in &order[pos + 1..] {
                let entry = &entries[later];
                let result = match direction {
                    Direction::Reading => entry.pipe.catch_reading_exception(handle, cause),
                    Direction::Writing => entry.pipe.catch_writing_exception(handle, cause),
                };
                match result {
                    Ok(()) => return,
                    Err(e) => cause = e,
                }
            }
            log::debug!("uncaught {} exception: {}", direction, cause);
            let _ = inner.event_tx.send(PipelineEvent::ExceptionCaught {
                direction,
                error: Arc::from(cause),
            });
            return;
        }
        objs = out;
        if objs.is_empty() {
            log::trace!("object dropped while {}", direction);
            return;
        }
    }
    drop(entries);
    for obj in objs {
        terminal(obj);
    }
}
