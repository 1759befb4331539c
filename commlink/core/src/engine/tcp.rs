//! TCP Engine
//!
//! Default engine. Listeners and connects use non-blocking sockets, so every
//! worker call returns immediately:
//!
//! - `listen` binds and listens synchronously (bind errors surface at once)
//! - `connect` issues a non-blocking connect; its outcome is checked on each
//!   progress step via `SO_ERROR` and the peer address
//! - `progress` drains deferred failures, polls connects (applying the
//!   engine connect timeout) and accepts at most `ACCEPT_BATCH` connections
//!   per listener

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{IpAddr, Shutdown, SocketAddr, TcpListener, TcpStream};
use std::time::Instant;

use socket2::{Domain, Protocol, Socket, Type};

use super::config::EngineConfig;
use super::{
    target_string, EngineConnection, EngineEvent, EngineWorker, ListenerId, OperationId,
    TransportEngine,
};
use crate::error::{CommError, Result};

/// Engine backed by non-blocking TCP sockets
#[derive(Clone, Copy, Debug, Default)]
pub struct TcpEngine;

impl TransportEngine for TcpEngine {
    fn name(&self) -> &'static str {
        "tcp"
    }

    fn create_worker(&self, config: EngineConfig) -> Box<dyn EngineWorker> {
        Box::new(TcpWorker::new(config))
    }
}

/// A connect the kernel is still working on
#[derive(Debug)]
struct PendingConnect {
    socket: Socket,
    target: SocketAddr,
    started: Instant,
}

/// Worker of the TCP engine
#[derive(Debug)]
pub struct TcpWorker {
    config: EngineConfig,
    listeners: HashMap<ListenerId, TcpListener>,
    connects: HashMap<OperationId, PendingConnect>,
    /// Failures detected while starting a connect, reported on next progress
    deferred_failures: Vec<(OperationId, String)>,
}

impl TcpWorker {
    /// Create a worker with the given configuration
    #[must_use]
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            listeners: HashMap::new(),
            connects: HashMap::new(),
            deferred_failures: Vec::new(),
        }
    }

    fn bind_listener(&self, port: u16) -> io::Result<TcpListener> {
        let addr = SocketAddr::new(self.config.bind_address, port);
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        if self.config.reuse_address {
            socket.set_reuse_address(true)?;
        }
        socket.bind(&addr.into())?;
        socket.listen(self.config.listen_backlog)?;
        socket.set_nonblocking(true)?;
        Ok(socket.into())
    }

    fn poll_connects(&mut self, events: &mut Vec<EngineEvent>) {
        let now = Instant::now();
        let timeout = self.config.connect_timeout;

        let finished: Vec<(OperationId, std::result::Result<(), String>)> = self
            .connects
            .iter()
            .filter_map(|(op, pending)| match poll_connect(&pending.socket) {
                Some(Ok(())) => Some((*op, Ok(()))),
                Some(Err(e)) => Some((*op, Err(e.to_string()))),
                None => timeout
                    .filter(|t| now.duration_since(pending.started) >= *t)
                    .map(|t| (*op, Err(format!("timed out after {} ms", t.as_millis())))),
            })
            .collect();

        for (op, outcome) in finished {
            let Some(pending) = self.connects.remove(&op) else {
                continue;
            };

            let outcome = outcome.and_then(|()| {
                TcpConnection::from_stream(pending.socket.into(), self.config.tcp_nodelay)
                    .map_err(|e| e.to_string())
            });

            match outcome {
                Ok(connection) => {
                    tracing::debug!(op = %op, target = %pending.target, "TCP connect established");
                    events.push(EngineEvent::Connected {
                        op,
                        connection: Box::new(connection),
                    });
                }
                Err(reason) => {
                    tracing::debug!(op = %op, target = %pending.target, reason = %reason, "TCP connect failed");
                    events.push(EngineEvent::ConnectFailed { op, reason });
                }
            }
        }
    }

    fn poll_listeners(&self, events: &mut Vec<EngineEvent>) {
        for (id, listener) in &self.listeners {
            for _ in 0..self.config.accept_batch {
                match listener.accept() {
                    Ok((stream, peer)) => {
                        match TcpConnection::from_stream(stream, self.config.tcp_nodelay) {
                            Ok(connection) => {
                                tracing::debug!(listener = %id, peer = %peer, "TCP connection accepted");
                                events.push(EngineEvent::Accepted {
                                    listener: *id,
                                    connection: Box::new(connection),
                                });
                            }
                            Err(e) => {
                                tracing::warn!(listener = %id, peer = %peer, error = %e, "Failed to configure accepted connection");
                            }
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        tracing::warn!(listener = %id, error = %e, "Accept error");
                        break;
                    }
                }
            }
        }
    }
}

impl EngineWorker for TcpWorker {
    fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn listen(&mut self, id: ListenerId, port: Option<u16>) -> Result<SocketAddr> {
        let port = port.unwrap_or(0);
        let bind_error = |source: io::Error| CommError::Bind { port, source };

        let listener = self.bind_listener(port).map_err(bind_error)?;
        let local = listener.local_addr().map_err(bind_error)?;

        self.listeners.insert(id, listener);
        tracing::debug!(listener = %id, addr = %local, "TCP listener bound");
        Ok(local)
    }

    fn unlisten(&mut self, id: ListenerId) {
        if self.listeners.remove(&id).is_some() {
            tracing::debug!(listener = %id, "TCP listener closed");
        }
    }

    fn connect(&mut self, op: OperationId, address: &str, port: u16) {
        let host = address.trim_start_matches('[').trim_end_matches(']');
        let ip: IpAddr = match host.parse() {
            Ok(ip) => ip,
            Err(e) => {
                self.deferred_failures
                    .push((op, format!("invalid address {address:?}: {e}")));
                return;
            }
        };

        let target = SocketAddr::new(ip, port);
        match start_connect(target) {
            Ok(socket) => {
                tracing::trace!(op = %op, target = %target_string(address, port), "TCP connect started");
                self.connects.insert(
                    op,
                    PendingConnect {
                        socket,
                        target,
                        started: Instant::now(),
                    },
                );
            }
            Err(e) => self.deferred_failures.push((op, e.to_string())),
        }
    }

    fn cancel(&mut self, op: OperationId) -> bool {
        if self.connects.remove(&op).is_some() {
            return true;
        }
        let before = self.deferred_failures.len();
        self.deferred_failures.retain(|(pending, _)| *pending != op);
        before != self.deferred_failures.len()
    }

    fn progress(&mut self, events: &mut Vec<EngineEvent>) {
        events.extend(
            self.deferred_failures
                .drain(..)
                .map(|(op, reason)| EngineEvent::ConnectFailed { op, reason }),
        );
        self.poll_connects(events);
        self.poll_listeners(events);
    }

    fn pending_connects(&self) -> usize {
        self.connects.len() + self.deferred_failures.len()
    }

    fn listener_count(&self) -> usize {
        self.listeners.len()
    }
}

fn start_connect(target: SocketAddr) -> io::Result<Socket> {
    let socket = Socket::new(Domain::for_address(target), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    match socket.connect(&target.into()) {
        Ok(()) => Ok(socket),
        Err(e) if connect_in_progress(&e) => Ok(socket),
        Err(e) => Err(e),
    }
}

fn connect_in_progress(err: &io::Error) -> bool {
    #[cfg(unix)]
    let in_progress = err.raw_os_error() == Some(libc::EINPROGRESS);
    #[cfg(not(unix))]
    let in_progress = false;
    in_progress || err.kind() == io::ErrorKind::WouldBlock
}

/// Check a non-blocking connect; `None` while still in progress
fn poll_connect(socket: &Socket) -> Option<io::Result<()>> {
    match socket.take_error() {
        Ok(Some(err)) | Err(err) => return Some(Err(err)),
        Ok(None) => {}
    }

    match socket.peer_addr() {
        Ok(_) => Some(Ok(())),
        Err(e) if e.kind() == io::ErrorKind::NotConnected => None,
        Err(e) => Some(Err(e)),
    }
}

/// Established TCP connection
#[derive(Debug)]
pub struct TcpConnection {
    stream: TcpStream,
    local: Option<SocketAddr>,
    peer: Option<SocketAddr>,
    closed: bool,
}

impl TcpConnection {
    fn from_stream(stream: TcpStream, nodelay: bool) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        if nodelay {
            stream.set_nodelay(true)?;
        }
        Ok(Self {
            local: stream.local_addr().ok(),
            peer: stream.peer_addr().ok(),
            stream,
            closed: false,
        })
    }
}

impl EngineConnection for TcpConnection {
    fn local_addr(&self) -> Option<SocketAddr> {
        self.local
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    fn try_send(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.closed {
            return Err(io::ErrorKind::NotConnected.into());
        }
        self.stream.write(buf)
    }

    fn try_recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.closed {
            return Err(io::ErrorKind::NotConnected.into());
        }
        self.stream.read(buf)
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            // The peer may already be gone; nothing left to report.
            let _ = self.stream.shutdown(Shutdown::Both);
        }
    }
}
