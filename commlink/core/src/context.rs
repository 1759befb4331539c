//! Application Context
//!
//! The context owns one worker and everything derived from it: bound
//! listeners, pending connect operations and established endpoints. All of
//! it lives behind a single mutex; nothing runs unless the caller invokes
//! [`ApplicationContext::progress`].
//!
//! # Progress Step
//!
//! ```text
//! progress()
//!   ├─ lock worker state
//!   │    ├─ worker.progress()            → engine events
//!   │    ├─ Connected / ConnectFailed    → settle driver slots (collect wakers)
//!   │    └─ Accepted                     → build endpoints (collect deliveries)
//!   ├─ unlock
//!   ├─ wake connect futures
//!   └─ invoke accept callbacks, one at a time
//! ```
//!
//! Callbacks run after the state lock is released, so a callback may create
//! endpoints or listeners, drop its listener, or reset the context.
//!
//! # Teardown
//!
//! [`ApplicationContext::shutdown`] (also run when the last handle is
//! dropped) cancels every pending operation, stops every listener, closes
//! every endpoint and releases the worker, in that order.

use std::cell::Cell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::task::Waker;

use parking_lot::{Mutex, ReentrantMutex};

use crate::driver::{ConnectFuture, ConnectionDriver};
use crate::endpoint::{Endpoint, EndpointOrigin, EndpointShared};
use crate::engine::{
    target_string, EngineConfig, EngineEvent, ListenerId, OperationId, TransportEngine, WorkerId,
};
use crate::error::{CommError, Result};
use crate::listener::{AcceptCallback, Listener, ListenerEntry};
use crate::options::{self, Options};
use crate::worker::Worker;

/// Everything that exists only while the context is active
struct WorkerState {
    worker: Worker,
    driver: ConnectionDriver,
    listeners: HashMap<ListenerId, ListenerEntry>,
    endpoints: Vec<Weak<EndpointShared>>,
}

impl WorkerState {
    fn track(&mut self, endpoint: &Endpoint) {
        self.endpoints.push(Arc::downgrade(endpoint.shared()));
    }
}

/// An endpoint waiting to be handed to its listener's callback
struct Delivery {
    callback: Arc<Mutex<AcceptCallback>>,
    active: Arc<AtomicBool>,
    endpoint: Endpoint,
}

pub(crate) struct ContextInner {
    worker_id: WorkerId,
    options: Options,
    state: Mutex<Option<WorkerState>>,
    /// Serializes progress calls; the flag marks a progress step in flight
    progress_guard: ReentrantMutex<Cell<bool>>,
}

impl ContextInner {
    pub(crate) fn remove_listener(&self, id: ListenerId) {
        let entry = {
            let mut guard = self.state.lock();
            let Some(state) = guard.as_mut() else {
                return;
            };
            let entry = state.listeners.remove(&id);
            if let Some(entry) = &entry {
                entry.deactivate();
                state.worker.unlisten(id);
                tracing::debug!(worker = %self.worker_id, listener = %id, "Listener released");
            }
            entry
        };
        // The callback may own listeners or futures of this context.
        drop(entry);
    }

    /// Cancel an operation whose future was dropped
    pub(crate) fn cancel_operation(&self, op: OperationId) {
        let waker = {
            let mut guard = self.state.lock();
            let Some(state) = guard.as_mut() else {
                return;
            };
            let waker = state.driver.cancel(op);
            state.worker.cancel(op);
            waker
        };
        // The only task that could await this operation is the one dropping
        // it. Released unlocked: it may be the last reference to that task.
        drop(waker);
    }

    fn progress_once(&self) -> Result<bool> {
        let mut wakers: Vec<Waker> = Vec::new();
        let mut deliveries: Vec<Delivery> = Vec::new();

        let did_work = {
            let mut guard = self.state.lock();
            let state = guard.as_mut().ok_or(CommError::NotInitialized)?;

            let events = state.worker.progress();
            let did_work = !events.is_empty();
            let worker_id = state.worker.id();

            for event in events {
                match event {
                    EngineEvent::Connected { op, connection } => {
                        let endpoints = &mut state.endpoints;
                        let waker = state.driver.complete(op, |address, port| {
                            let endpoint = Endpoint::new(
                                worker_id,
                                EndpointOrigin::Outbound {
                                    address: address.to_string(),
                                    port,
                                },
                                connection,
                            );
                            endpoints.push(Arc::downgrade(endpoint.shared()));
                            endpoint
                        });
                        wakers.extend(waker);
                    }
                    EngineEvent::ConnectFailed { op, reason } => {
                        wakers.extend(state.driver.fail(op, &reason));
                    }
                    EngineEvent::Accepted {
                        listener,
                        connection,
                    } => {
                        let Some(entry) = state.listeners.get(&listener) else {
                            tracing::debug!(listener = %listener, "Dropping connection for released listener");
                            continue;
                        };
                        let delivery = Delivery {
                            callback: Arc::clone(&entry.callback),
                            active: Arc::clone(&entry.active),
                            endpoint: Endpoint::new(
                                worker_id,
                                EndpointOrigin::Inbound { listener },
                                connection,
                            ),
                        };
                        state.track(&delivery.endpoint);
                        deliveries.push(delivery);
                    }
                }
            }

            state.endpoints.retain(|shared| shared.strong_count() > 0);
            did_work
        };

        for waker in wakers {
            waker.wake();
        }

        for delivery in deliveries {
            if !delivery.active.load(Ordering::SeqCst) {
                continue;
            }
            tracing::debug!(endpoint = %delivery.endpoint.id(), peer = ?delivery.endpoint.peer_addr(), "Delivering accepted endpoint");
            let mut callback = delivery.callback.lock();
            (*callback)(delivery.endpoint);
        }

        Ok(did_work)
    }

    fn teardown(&self) {
        let Some(mut state) = self.state.lock().take() else {
            return;
        };

        let cancelled = state.driver.cancel_all();
        for (op, _) in &cancelled {
            state.worker.cancel(*op);
        }

        let listeners = state.listeners.len();
        for (id, entry) in state.listeners.drain() {
            entry.deactivate();
            state.worker.unlisten(id);
        }

        let mut endpoints = 0;
        for shared in state.endpoints.drain(..).filter_map(|weak| weak.upgrade()) {
            if shared.close() {
                endpoints += 1;
            }
        }

        tracing::info!(
            worker = %self.worker_id,
            cancelled = cancelled.len(),
            listeners,
            endpoints,
            "Communication context torn down"
        );
        drop(state);

        for waker in cancelled.into_iter().filter_map(|(_, waker)| waker) {
            waker.wake();
        }
    }
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        self.teardown();
    }
}

struct ProgressScope<'a>(&'a Cell<bool>);

impl<'a> ProgressScope<'a> {
    fn enter(flag: &'a Cell<bool>) -> Self {
        flag.set(true);
        Self(flag)
    }
}

impl Drop for ProgressScope<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

/// Handle to a communication context
///
/// Cloning is cheap; all clones share one worker. The process-wide instance
/// is managed by [`crate::api`]; standalone contexts are useful for embedding
/// and for talking to the process-wide one from the same process.
#[derive(Clone)]
pub struct ApplicationContext {
    inner: Arc<ContextInner>,
}

impl ApplicationContext {
    /// Create a context from explicit options and `COMMLINK_*` variables
    pub fn new(options: &Options, env_takes_precedence: bool) -> Result<Self> {
        Self::with_env(options, &options::env_options(), env_takes_precedence)
    }

    /// Create a context from explicit options and an explicit environment
    pub fn with_env(options: &Options, env: &Options, env_takes_precedence: bool) -> Result<Self> {
        let resolved = options::resolve(options, env, env_takes_precedence);
        let config = EngineConfig::from_options(&resolved)?;
        Ok(Self::build(resolved, Worker::new(config)))
    }

    /// Create a context from an already validated configuration
    #[must_use]
    pub fn from_config(config: EngineConfig) -> Self {
        Self::build(config.to_options(), Worker::new(config))
    }

    /// Create a context on a caller-supplied engine
    #[must_use]
    pub fn with_engine(engine: Arc<dyn TransportEngine>, config: EngineConfig) -> Self {
        Self::build(config.to_options(), Worker::with_engine(engine, config))
    }

    fn build(options: Options, worker: Worker) -> Self {
        let worker_id = worker.id();
        tracing::info!(
            worker = %worker_id,
            engine = worker.engine_name(),
            "Communication context created"
        );

        Self {
            inner: Arc::new(ContextInner {
                worker_id,
                options,
                state: Mutex::new(Some(WorkerState {
                    worker,
                    driver: ConnectionDriver::new(),
                    listeners: HashMap::new(),
                    endpoints: Vec::new(),
                })),
                progress_guard: ReentrantMutex::new(Cell::new(false)),
            }),
        }
    }

    /// Whether the worker is still alive
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.inner.state.lock().is_some()
    }

    /// The resolved options this context was created with
    #[must_use]
    pub fn options(&self) -> &Options {
        &self.inner.options
    }

    /// Numeric identity of the worker, for external reactor integration
    pub fn worker_handle(&self) -> Result<u64> {
        self.with_state(|state| Ok(state.worker.handle()))
    }

    /// Effective configuration of the worker
    pub fn config(&self) -> Result<Options> {
        self.with_state(|state| Ok(state.worker.config()))
    }

    /// Bind a listener and deliver every accepted connection to `callback`
    ///
    /// `port` of `None` lets the engine choose a free port; read it back with
    /// [`Listener::port`]. The listener stays active until it is dropped.
    pub fn create_listener<F>(&self, callback: F, port: Option<u16>) -> Result<Listener>
    where
        F: FnMut(Endpoint) + Send + 'static,
    {
        let id = ListenerId::new();
        // Declared before the guard: a rejected callback is dropped unlocked.
        let callback: AcceptCallback = Box::new(callback);
        let mut guard = self.inner.state.lock();
        let state = guard.as_mut().ok_or(CommError::NotInitialized)?;
        let local_addr = state.worker.listen(id, port)?;
        let entry = ListenerEntry::new(callback);
        let active = Arc::clone(&entry.active);
        state.listeners.insert(id, entry);
        drop(guard);

        tracing::info!(worker = %self.inner.worker_id, listener = %id, addr = %local_addr, "Listener created");
        Ok(Listener::new(
            id,
            local_addr,
            active,
            Arc::downgrade(&self.inner),
        ))
    }

    /// Start connecting to `address:port`
    ///
    /// Returns immediately. The future resolves only while the caller keeps
    /// calling [`progress`](Self::progress); failures, including an
    /// unparsable address, surface from the future, never from this call.
    pub fn create_endpoint(&self, address: &str, port: u16) -> ConnectFuture {
        let op = OperationId::new();
        let mut guard = self.inner.state.lock();
        let Some(state) = guard.as_mut() else {
            return ConnectFuture::failed(
                op,
                target_string(address, port),
                CommError::NotInitialized,
            );
        };

        let slot = state.driver.register(op, address, port);
        state.worker.connect(op, address, port);
        drop(guard);

        tracing::debug!(worker = %self.inner.worker_id, op = %op, target = %target_string(address, port), "Connect registered");
        ConnectFuture::new(op, slot, Arc::downgrade(&self.inner))
    }

    /// Advance the worker by one bounded step
    ///
    /// Completes ready connects (waking their futures) and invokes accept
    /// callbacks. Returns whether any work was done. A call made from inside
    /// an accept callback returns `Ok(false)` without doing anything.
    pub fn progress(&self) -> Result<bool> {
        let guard = self.inner.progress_guard.lock();
        if guard.get() {
            tracing::trace!("Ignoring re-entrant progress call");
            return Ok(false);
        }
        let _scope = ProgressScope::enter(&guard);
        self.inner.progress_once()
    }

    /// Number of connect operations not yet settled
    #[must_use]
    pub fn pending_operations(&self) -> usize {
        self.inner
            .state
            .lock()
            .as_ref()
            .map_or(0, |state| state.driver.len())
    }

    /// Number of active listeners
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.inner
            .state
            .lock()
            .as_ref()
            .map_or(0, |state| state.listeners.len())
    }

    /// Tear the context down; later calls fail with `NotInitialized`
    ///
    /// Cancels all pending operations, stops all listeners, closes all
    /// endpoints and releases the worker. Never fails; idempotent.
    pub fn shutdown(&self) {
        self.inner.teardown();
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut WorkerState) -> Result<T>) -> Result<T> {
        let mut guard = self.inner.state.lock();
        let state = guard.as_mut().ok_or(CommError::NotInitialized)?;
        f(state)
    }
}

impl std::fmt::Debug for ApplicationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApplicationContext")
            .field("worker", &self.inner.worker_id)
            .field("active", &self.is_active())
            .finish()
    }
}
