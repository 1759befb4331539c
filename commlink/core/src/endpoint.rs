//! Endpoints
//!
//! An endpoint is one established bidirectional connection. Outbound connects
//! and listener accepts produce the same type; once handed to the caller an
//! endpoint has no further tie to the call that created it, only to the
//! context whose teardown closes it.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::engine::{EndpointId, EngineConnection, ListenerId, WorkerId};
use crate::error::{CommError, Result};

/// How an endpoint came to exist
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointOrigin {
    /// Created by `create_endpoint`
    Outbound {
        /// Address the caller asked for
        address: String,
        /// Port the caller asked for
        port: u16,
    },

    /// Delivered to a listener callback
    Inbound {
        /// Listener that accepted the connection
        listener: ListenerId,
    },
}

/// State shared between an endpoint and its context's registry
pub(crate) struct EndpointShared {
    id: EndpointId,
    worker: WorkerId,
    origin: EndpointOrigin,
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
    closed: AtomicBool,
    connection: Mutex<Box<dyn EngineConnection>>,
}

impl EndpointShared {
    /// Close the connection; returns whether this call closed it
    pub(crate) fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.connection.lock().close();
        true
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// An established connection
pub struct Endpoint {
    shared: Arc<EndpointShared>,
}

impl Endpoint {
    pub(crate) fn new(
        worker: WorkerId,
        origin: EndpointOrigin,
        connection: Box<dyn EngineConnection>,
    ) -> Self {
        Self {
            shared: Arc::new(EndpointShared {
                id: EndpointId::new(),
                worker,
                origin,
                local_addr: connection.local_addr(),
                peer_addr: connection.peer_addr(),
                closed: AtomicBool::new(false),
                connection: Mutex::new(connection),
            }),
        }
    }

    pub(crate) fn shared(&self) -> &Arc<EndpointShared> {
        &self.shared
    }

    /// Unique identifier of this endpoint
    #[must_use]
    pub fn id(&self) -> EndpointId {
        self.shared.id
    }

    /// Numeric handle of the worker this endpoint belongs to
    #[must_use]
    pub fn worker_handle(&self) -> u64 {
        self.shared.worker.as_u64()
    }

    /// How this endpoint was created
    #[must_use]
    pub fn origin(&self) -> &EndpointOrigin {
        &self.shared.origin
    }

    /// `(address, port)` the caller connected to, for outbound endpoints
    #[must_use]
    pub fn remote_address(&self) -> Option<(&str, u16)> {
        match &self.shared.origin {
            EndpointOrigin::Outbound { address, port } => Some((address.as_str(), *port)),
            EndpointOrigin::Inbound { .. } => None,
        }
    }

    /// Local address of the connection
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.local_addr
    }

    /// Address of the remote peer
    #[must_use]
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.shared.peer_addr
    }

    /// Whether the endpoint was closed by the caller or by context teardown
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Close the connection; idempotent
    pub fn close(&self) {
        if self.shared.close() {
            tracing::debug!(endpoint = %self.shared.id, "Endpoint closed");
        }
    }

    /// Send without blocking
    ///
    /// Returns the number of bytes the engine accepted; `Ok(0)` when the
    /// engine cannot take more right now.
    pub fn try_send(&self, buf: &[u8]) -> Result<usize> {
        match self.with_connection(|conn| conn.try_send(buf)) {
            Err(CommError::Io(e)) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            other => other,
        }
    }

    /// Receive without blocking
    ///
    /// Returns `Ok(None)` when no data is available yet and `Ok(Some(0))`
    /// when the peer closed the connection.
    pub fn try_recv(&self, buf: &mut [u8]) -> Result<Option<usize>> {
        match self.with_connection(|conn| conn.try_recv(buf)) {
            Ok(n) => Ok(Some(n)),
            Err(CommError::Io(e)) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn with_connection<T>(
        &self,
        op: impl FnOnce(&mut dyn EngineConnection) -> io::Result<T>,
    ) -> Result<T> {
        if self.is_closed() {
            return Err(CommError::EndpointClosed(self.shared.id.to_string()));
        }
        let mut connection = self.shared.connection.lock();
        op(&mut **connection).map_err(CommError::Io)
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.shared.close();
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("id", &self.shared.id)
            .field("origin", &self.shared.origin)
            .field("peer_addr", &self.shared.peer_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}
