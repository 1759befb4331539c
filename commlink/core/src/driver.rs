//! Async Connection Driver
//!
//! Bridges the poll-based progress step to futures. Each outbound connect is
//! a [`PendingOperation`] in the driver table, keyed by [`OperationId`], with
//! a single-assignment completion slot shared with the caller's
//! [`ConnectFuture`].
//!
//! ```text
//!   create_endpoint() ──register──► driver table ◄──settle── progress()
//!          │                             │
//!          ▼                             ▼
//!    ConnectFuture ◄───── CompletionSlot (pending → completed | failed | cancelled)
//! ```
//!
//! A slot leaves the pending state exactly once. Only progress (completed,
//! failed) and cancellation (future dropped, context reset) settle slots.
//! Nothing in this module runs on its own: no thread, no timer.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::mem;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll, Waker};
use std::time::Instant;

use parking_lot::Mutex;

use crate::context::ContextInner;
use crate::endpoint::Endpoint;
use crate::engine::{target_string, OperationId};
use crate::error::{CommError, Result};

/// Observable state of a connect operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationStatus {
    /// Waiting for progress to complete it
    Pending,
    /// Resolved to an endpoint
    Completed,
    /// Resolved to a connect error
    Failed,
    /// Abandoned before completion; never resolved afterwards
    Cancelled,
}

enum SlotState {
    Pending(Option<Waker>),
    Completed(Endpoint),
    Failed(CommError),
    Cancelled,
    /// Outcome handed to the awaiting task
    Consumed(OperationStatus),
}

impl SlotState {
    fn status(&self) -> OperationStatus {
        match self {
            Self::Pending(_) => OperationStatus::Pending,
            Self::Completed(_) => OperationStatus::Completed,
            Self::Failed(_) => OperationStatus::Failed,
            Self::Cancelled => OperationStatus::Cancelled,
            Self::Consumed(status) => *status,
        }
    }
}

/// Result of trying to settle a slot
#[derive(Debug)]
pub(crate) enum Settle {
    /// The slot was pending; wake this task, if one is waiting
    Settled(Option<Waker>),
    /// The slot was already settled; the new outcome was dropped
    AlreadySettled,
}

impl Settle {
    pub(crate) fn into_waker(self) -> Option<Waker> {
        match self {
            Self::Settled(waker) => waker,
            Self::AlreadySettled => None,
        }
    }
}

/// Single-assignment completion slot
pub(crate) struct CompletionSlot {
    target: String,
    state: Mutex<SlotState>,
}

impl CompletionSlot {
    fn new(target: String, state: SlotState) -> Arc<Self> {
        Arc::new(Self {
            target,
            state: Mutex::new(state),
        })
    }

    pub(crate) fn status(&self) -> OperationStatus {
        self.state.lock().status()
    }

    fn settle(&self, next: SlotState) -> Settle {
        let mut state = self.state.lock();
        match &mut *state {
            SlotState::Pending(waker) => {
                let waker = waker.take();
                *state = next;
                Settle::Settled(waker)
            }
            _ => Settle::AlreadySettled,
        }
    }

    fn poll(&self, cx: &mut Context<'_>) -> Poll<Result<Endpoint>> {
        let mut state = self.state.lock();
        if let SlotState::Pending(waker) = &mut *state {
            let stale = !waker
                .as_ref()
                .is_some_and(|existing| existing.will_wake(cx.waker()));
            if stale {
                *waker = Some(cx.waker().clone());
            }
            return Poll::Pending;
        }

        let status = state.status();
        match mem::replace(&mut *state, SlotState::Consumed(status)) {
            SlotState::Completed(endpoint) => Poll::Ready(Ok(endpoint)),
            SlotState::Failed(err) => Poll::Ready(Err(err)),
            SlotState::Cancelled => Poll::Ready(Err(CommError::Cancelled {
                target: self.target.clone(),
            })),
            SlotState::Consumed(_) | SlotState::Pending(_) => {
                panic!("ConnectFuture polled after completion")
            }
        }
    }
}

/// One in-flight connect request
pub(crate) struct PendingOperation {
    address: String,
    port: u16,
    target: String,
    slot: Arc<CompletionSlot>,
    registered_at: Instant,
}

/// Driver table of pending operations
#[derive(Default)]
pub(crate) struct ConnectionDriver {
    pending: HashMap<OperationId, PendingOperation>,
}

impl ConnectionDriver {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register a new pending operation and return its slot
    pub(crate) fn register(
        &mut self,
        op: OperationId,
        address: &str,
        port: u16,
    ) -> Arc<CompletionSlot> {
        let target = target_string(address, port);
        let slot = CompletionSlot::new(target.clone(), SlotState::Pending(None));
        self.pending.insert(
            op,
            PendingOperation {
                address: address.to_string(),
                port,
                target,
                slot: Arc::clone(&slot),
                registered_at: Instant::now(),
            },
        );
        slot
    }

    /// Resolve an operation with the endpoint built by `make_endpoint`
    ///
    /// `make_endpoint` receives the address and port the caller asked for.
    /// It is not called for unknown operations (cancelled earlier).
    pub(crate) fn complete(
        &mut self,
        op: OperationId,
        make_endpoint: impl FnOnce(&str, u16) -> Endpoint,
    ) -> Option<Waker> {
        let Some(pending) = self.pending.remove(&op) else {
            tracing::debug!(op = %op, "Dropping connection for cancelled operation");
            return None;
        };
        let endpoint = make_endpoint(&pending.address, pending.port);
        tracing::debug!(
            op = %op,
            target = %pending.target,
            elapsed_ms = u64::try_from(pending.registered_at.elapsed().as_millis()).unwrap_or(u64::MAX),
            "Connect completed"
        );
        pending
            .slot
            .settle(SlotState::Completed(endpoint))
            .into_waker()
    }

    /// Resolve an operation with a connect error
    pub(crate) fn fail(&mut self, op: OperationId, reason: &str) -> Option<Waker> {
        let pending = self.pending.remove(&op)?;
        tracing::debug!(op = %op, target = %pending.target, reason = %reason, "Connect failed");
        let err = CommError::connect(pending.target.clone(), reason);
        pending.slot.settle(SlotState::Failed(err)).into_waker()
    }

    /// Cancel one operation; returns the waker of a task still awaiting it
    pub(crate) fn cancel(&mut self, op: OperationId) -> Option<Waker> {
        let pending = self.pending.remove(&op)?;
        tracing::debug!(op = %op, target = %pending.target, "Connect cancelled");
        pending.slot.settle(SlotState::Cancelled).into_waker()
    }

    /// Cancel every pending operation
    pub(crate) fn cancel_all(&mut self) -> Vec<(OperationId, Option<Waker>)> {
        self.pending
            .drain()
            .map(|(op, pending)| (op, pending.slot.settle(SlotState::Cancelled).into_waker()))
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }
}

/// Future returned by `create_endpoint`
///
/// Resolves once a progress step completes the connect. Dropping it before
/// then cancels the operation and releases its engine resources.
#[must_use = "a connect is cancelled when its future is dropped"]
pub struct ConnectFuture {
    op: OperationId,
    slot: Arc<CompletionSlot>,
    context: Weak<ContextInner>,
}

impl ConnectFuture {
    pub(crate) fn new(
        op: OperationId,
        slot: Arc<CompletionSlot>,
        context: Weak<ContextInner>,
    ) -> Self {
        Self { op, slot, context }
    }

    /// A future that resolves to `err` on first poll
    pub(crate) fn failed(op: OperationId, target: String, err: CommError) -> Self {
        Self {
            op,
            slot: CompletionSlot::new(target, SlotState::Failed(err)),
            context: Weak::new(),
        }
    }

    /// Identity of the underlying pending operation
    #[must_use]
    pub fn id(&self) -> OperationId {
        self.op
    }

    /// `address:port` being connected to
    #[must_use]
    pub fn target(&self) -> &str {
        &self.slot.target
    }

    /// Current state of the operation
    #[must_use]
    pub fn status(&self) -> OperationStatus {
        self.slot.status()
    }

    /// Abandon the connect; same as dropping the future
    pub fn cancel(self) {
        drop(self);
    }
}

impl Future for ConnectFuture {
    type Output = Result<Endpoint>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.slot.poll(cx)
    }
}

impl Drop for ConnectFuture {
    fn drop(&mut self) {
        if self.slot.status() != OperationStatus::Pending {
            return;
        }
        match self.context.upgrade() {
            Some(context) => context.cancel_operation(self.op),
            None => {
                self.slot.settle(SlotState::Cancelled);
            }
        }
    }
}

impl fmt::Debug for ConnectFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectFuture")
            .field("op", &self.op)
            .field("target", &self.slot.target)
            .field("status", &self.status())
            .finish()
    }
}
