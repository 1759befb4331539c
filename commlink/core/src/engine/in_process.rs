//! In-Process Engine
//!
//! Connections between workers living in the same process, with no sockets
//! involved. Listeners register their port in a process-wide table; a connect
//! looks the port up during the connecting worker's progress step and, when a
//! listener is found, queues the server half of a fresh in-memory pipe on that
//! listener. The listener's own worker delivers it on its next progress step.
//!
//! The IP part of a connect target is not interpreted: any address reaches
//! the in-process listener bound to the requested port.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Instant;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;

use super::config::EngineConfig;
use super::{
    target_string, EngineConnection, EngineEvent, EngineWorker, ListenerId, OperationId,
    TransportEngine,
};
use crate::error::{CommError, Result};

/// First port handed out when the engine chooses one
const EPHEMERAL_START: u16 = 49152;

type Backlog = Arc<Mutex<VecDeque<InProcessConnection>>>;

/// A listener visible to every in-process worker
struct PortEntry {
    listener: ListenerId,
    addr: SocketAddr,
    backlog: Backlog,
    capacity: usize,
}

static PORTS: LazyLock<DashMap<u16, PortEntry>> = LazyLock::new(DashMap::new);
static NEXT_PORT: AtomicU16 = AtomicU16::new(EPHEMERAL_START);

fn next_ephemeral_port() -> u16 {
    NEXT_PORT
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |p| {
            Some(if p == u16::MAX { EPHEMERAL_START } else { p + 1 })
        })
        .unwrap_or(EPHEMERAL_START)
}

/// Engine connecting workers of this process through memory
#[derive(Clone, Copy, Debug, Default)]
pub struct InProcessEngine;

impl TransportEngine for InProcessEngine {
    fn name(&self) -> &'static str {
        "inproc"
    }

    fn create_worker(&self, config: EngineConfig) -> Box<dyn EngineWorker> {
        Box::new(InProcessWorker::new(config))
    }
}

#[derive(Debug)]
struct PendingConnect {
    target: String,
    port: std::result::Result<u16, String>,
    started: Instant,
}

/// Worker of the in-process engine
#[derive(Debug)]
pub struct InProcessWorker {
    config: EngineConfig,
    listeners: HashMap<ListenerId, (u16, Backlog)>,
    connects: HashMap<OperationId, PendingConnect>,
}

impl InProcessWorker {
    /// Create a worker with the given configuration
    #[must_use]
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            listeners: HashMap::new(),
            connects: HashMap::new(),
        }
    }

    fn register(&self, id: ListenerId, port: u16, backlog: &Backlog) -> Option<SocketAddr> {
        match PORTS.entry(port) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                let addr = SocketAddr::new(self.config.bind_address, port);
                slot.insert(PortEntry {
                    listener: id,
                    addr,
                    backlog: Arc::clone(backlog),
                    capacity: usize::try_from(self.config.listen_backlog).unwrap_or(1),
                });
                Some(addr)
            }
        }
    }

    fn rendezvous(port: u16) -> std::result::Result<InProcessConnection, String> {
        let entry = PORTS.get(&port).ok_or_else(|| "connection refused".to_string())?;

        let mut backlog = entry.backlog.lock();
        if backlog.len() >= entry.capacity {
            return Err("connection refused: listen backlog full".to_string());
        }

        let client_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), next_ephemeral_port());
        let (client, server) = InProcessConnection::pair(client_addr, entry.addr);
        backlog.push_back(server);
        Ok(client)
    }
}

impl EngineWorker for InProcessWorker {
    fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn listen(&mut self, id: ListenerId, port: Option<u16>) -> Result<SocketAddr> {
        let backlog: Backlog = Arc::default();

        let bound = match port.filter(|p| *p != 0) {
            Some(port) => self.register(id, port, &backlog).ok_or(CommError::Bind {
                port,
                source: io::ErrorKind::AddrInUse.into(),
            })?,
            None => {
                let span = usize::from(u16::MAX - EPHEMERAL_START) + 1;
                (0..span)
                    .find_map(|_| self.register(id, next_ephemeral_port(), &backlog))
                    .ok_or(CommError::Bind {
                        port: 0,
                        source: io::ErrorKind::AddrNotAvailable.into(),
                    })?
            }
        };

        self.listeners.insert(id, (bound.port(), backlog));
        tracing::debug!(listener = %id, addr = %bound, "In-process listener bound");
        Ok(bound)
    }

    fn unlisten(&mut self, id: ListenerId) {
        if let Some((port, backlog)) = self.listeners.remove(&id) {
            PORTS.remove_if(&port, |_, entry| entry.listener == id);
            // Queued peers see the connection close.
            backlog.lock().clear();
            tracing::debug!(listener = %id, port, "In-process listener closed");
        }
    }

    fn connect(&mut self, op: OperationId, address: &str, port: u16) {
        let host = address.trim_start_matches('[').trim_end_matches(']');
        let resolved = host
            .parse::<IpAddr>()
            .map(|_| port)
            .map_err(|e| format!("invalid address {address:?}: {e}"));

        self.connects.insert(
            op,
            PendingConnect {
                target: target_string(address, port),
                port: resolved,
                started: Instant::now(),
            },
        );
    }

    fn cancel(&mut self, op: OperationId) -> bool {
        self.connects.remove(&op).is_some()
    }

    fn progress(&mut self, events: &mut Vec<EngineEvent>) {
        for (op, pending) in self.connects.drain() {
            let outcome = pending.port.clone().and_then(Self::rendezvous);
            match outcome {
                Ok(connection) => {
                    tracing::debug!(op = %op, target = %pending.target, "In-process connect established");
                    events.push(EngineEvent::Connected {
                        op,
                        connection: Box::new(connection),
                    });
                }
                Err(reason) => {
                    tracing::debug!(
                        op = %op,
                        target = %pending.target,
                        waited_ms = pending.started.elapsed().as_millis(),
                        reason = %reason,
                        "In-process connect failed"
                    );
                    events.push(EngineEvent::ConnectFailed { op, reason });
                }
            }
        }

        for (id, (_, backlog)) in &self.listeners {
            let mut backlog = backlog.lock();
            let ready = backlog.len().min(self.config.accept_batch);
            for connection in backlog.drain(..ready) {
                events.push(EngineEvent::Accepted {
                    listener: *id,
                    connection: Box::new(connection),
                });
            }
        }
    }

    fn pending_connects(&self) -> usize {
        self.connects.len()
    }

    fn listener_count(&self) -> usize {
        self.listeners.len()
    }
}

impl Drop for InProcessWorker {
    fn drop(&mut self) {
        let ids: Vec<ListenerId> = self.listeners.keys().copied().collect();
        for id in ids {
            self.unlisten(id);
        }
    }
}

/// Shared state of one in-memory connection
#[derive(Debug, Default)]
struct Pipe {
    /// Bytes waiting for side 0 and side 1 respectively
    inbound: [VecDeque<u8>; 2],
    closed: bool,
}

/// One side of an in-memory connection
#[derive(Debug)]
pub struct InProcessConnection {
    pipe: Arc<Mutex<Pipe>>,
    side: usize,
    local: SocketAddr,
    peer: SocketAddr,
}

impl InProcessConnection {
    fn pair(a: SocketAddr, b: SocketAddr) -> (Self, Self) {
        let pipe = Arc::new(Mutex::new(Pipe::default()));
        (
            Self {
                pipe: Arc::clone(&pipe),
                side: 0,
                local: a,
                peer: b,
            },
            Self {
                pipe,
                side: 1,
                local: b,
                peer: a,
            },
        )
    }
}

impl EngineConnection for InProcessConnection {
    fn local_addr(&self) -> Option<SocketAddr> {
        Some(self.local)
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        Some(self.peer)
    }

    fn try_send(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut pipe = self.pipe.lock();
        if pipe.closed {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        pipe.inbound[1 - self.side].extend(buf);
        Ok(buf.len())
    }

    fn try_recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut pipe = self.pipe.lock();
        let closed = pipe.closed;
        let inbound = &mut pipe.inbound[self.side];

        if inbound.is_empty() {
            return if closed {
                Ok(0)
            } else {
                Err(io::ErrorKind::WouldBlock.into())
            };
        }

        let n = inbound.len().min(buf.len());
        for (dst, src) in buf.iter_mut().zip(inbound.drain(..n)) {
            *dst = src;
        }
        Ok(n)
    }

    fn close(&mut self) {
        self.pipe.lock().closed = true;
    }
}

impl Drop for InProcessConnection {
    fn drop(&mut self) {
        self.close();
    }
}
