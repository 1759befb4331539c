//! Transport Engines
//!
//! The engine is the opaque capability the communication context drives. It
//! knows how to create a worker, bind listeners, start connects and make
//! progress; it knows nothing about futures, callbacks or context lifecycle.
//!
//! - [`tcp`]: non-blocking TCP sockets (default)
//! - [`in_process`]: in-memory connections between workers of one process
//!
//! # Progress Model
//!
//! ```text
//!  EngineWorker::connect(op)   ──► pending in engine
//!  EngineWorker::listen(id)    ──► bound socket
//!
//!  EngineWorker::progress()    ──► Vec<EngineEvent>
//!                                    Connected { op, connection }
//!                                    ConnectFailed { op, reason }
//!                                    Accepted { listener, connection }
//! ```
//!
//! Every call into a worker does a bounded amount of work and never blocks.

pub mod config;
pub mod in_process;
pub mod tcp;

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::Result;

pub use config::{EngineConfig, TransportKind};
pub use in_process::InProcessEngine;
pub use tcp::TcpEngine;

macro_rules! numeric_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(u64);

        impl $name {
            /// Allocate a new process-unique identifier
            #[must_use]
            pub fn new() -> Self {
                static COUNTER: AtomicU64 = AtomicU64::new(1);
                Self(COUNTER.fetch_add(1, Ordering::SeqCst))
            }

            /// Get the raw numeric value
            #[must_use]
            pub fn as_u64(&self) -> u64 {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "-{}"), self.0)
            }
        }
    };
}

numeric_id!(
    /// Identity of a worker (and of the context that owns it)
    WorkerId,
    "worker"
);
numeric_id!(
    /// Identity of a bound listener
    ListenerId,
    "listener"
);
numeric_id!(
    /// Identity of one pending connect operation
    OperationId,
    "op"
);
numeric_id!(
    /// Identity of an established endpoint
    EndpointId,
    "ep"
);

/// An established engine-level connection
///
/// I/O is non-blocking: calls that cannot make progress return
/// `io::ErrorKind::WouldBlock`.
pub trait EngineConnection: Send + fmt::Debug {
    /// Local address of the connection
    fn local_addr(&self) -> Option<SocketAddr>;

    /// Address of the remote peer
    fn peer_addr(&self) -> Option<SocketAddr>;

    /// Send as many bytes as the engine accepts right now
    fn try_send(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Receive available bytes; `Ok(0)` means the peer closed
    fn try_recv(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Close both directions; idempotent
    fn close(&mut self);
}

/// Outcome reported by one progress step
#[derive(Debug)]
pub enum EngineEvent {
    /// An outbound connect completed
    Connected {
        /// Operation that completed
        op: OperationId,
        /// The established connection
        connection: Box<dyn EngineConnection>,
    },

    /// An outbound connect failed
    ConnectFailed {
        /// Operation that failed
        op: OperationId,
        /// Engine-reported reason
        reason: String,
    },

    /// A listener accepted an inbound connection
    Accepted {
        /// Listener that accepted
        listener: ListenerId,
        /// The accepted connection
        connection: Box<dyn EngineConnection>,
    },
}

/// Factory for workers of one engine
pub trait TransportEngine: Send + Sync + fmt::Debug {
    /// Engine name as used in the `TRANSPORT` option
    fn name(&self) -> &'static str;

    /// Build a worker; configuration has already been validated
    fn create_worker(&self, config: EngineConfig) -> Box<dyn EngineWorker>;
}

/// One engine worker: the native resource a context owns
pub trait EngineWorker: Send + fmt::Debug {
    /// Effective configuration of this worker
    fn config(&self) -> &EngineConfig;

    /// Bind a listener synchronously; `None` lets the engine pick a port
    fn listen(&mut self, id: ListenerId, port: Option<u16>) -> Result<SocketAddr>;

    /// Stop a listener and release its port; unknown ids are ignored
    fn unlisten(&mut self, id: ListenerId);

    /// Start an outbound connect
    ///
    /// Never fails synchronously: any failure, including an unparsable
    /// address, is reported as [`EngineEvent::ConnectFailed`] by a later
    /// progress step.
    fn connect(&mut self, op: OperationId, address: &str, port: u16);

    /// Abandon a pending connect, releasing its resources
    ///
    /// Returns whether the operation was still pending in the engine.
    fn cancel(&mut self, op: OperationId) -> bool;

    /// Perform one bounded unit of work, appending completed events
    fn progress(&mut self, events: &mut Vec<EngineEvent>);

    /// Number of connects still pending in the engine
    fn pending_connects(&self) -> usize;

    /// Number of bound listeners
    fn listener_count(&self) -> usize;
}

/// Create the engine selected by `kind`
#[must_use]
pub fn create_engine(kind: TransportKind) -> Arc<dyn TransportEngine> {
    match kind {
        TransportKind::Tcp => Arc::new(TcpEngine),
        TransportKind::InProcess => Arc::new(InProcessEngine),
    }
}

/// Format `address:port` for logs and errors
pub(crate) fn target_string(address: &str, port: u16) -> String {
    if address.contains(':') && !address.starts_with('[') {
        format!("[{address}]:{port}")
    } else {
        format!("{address}:{port}")
    }
}
