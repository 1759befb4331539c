//! Transport Worker Handle
//!
//! Owns exactly one engine worker for one context and gives it a stable
//! numeric identity for interop with external reactors.

use std::net::SocketAddr;
use std::sync::Arc;

use crate::engine::{
    create_engine, EngineConfig, EngineEvent, EngineWorker, ListenerId, OperationId,
    TransportEngine, WorkerId,
};
use crate::error::Result;
use crate::options::Options;

/// The context's exclusively owned engine worker
#[derive(Debug)]
pub struct Worker {
    id: WorkerId,
    engine: Arc<dyn TransportEngine>,
    inner: Box<dyn EngineWorker>,
}

impl Worker {
    /// Build a worker on the engine selected by `config.transport`
    #[must_use]
    pub fn new(config: EngineConfig) -> Self {
        Self::with_engine(create_engine(config.transport), config)
    }

    /// Build a worker on an explicit engine
    #[must_use]
    pub fn with_engine(engine: Arc<dyn TransportEngine>, config: EngineConfig) -> Self {
        let id = WorkerId::new();
        let inner = engine.create_worker(config);
        tracing::debug!(worker = %id, engine = engine.name(), "Worker created");
        Self { id, engine, inner }
    }

    /// Numeric identity of this worker
    #[must_use]
    pub fn handle(&self) -> u64 {
        self.id.as_u64()
    }

    /// Typed identity of this worker
    #[must_use]
    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Name of the engine backing this worker
    #[must_use]
    pub fn engine_name(&self) -> &'static str {
        self.engine.name()
    }

    /// Effective configuration as an option mapping
    #[must_use]
    pub fn config(&self) -> Options {
        self.inner.config().to_options()
    }

    pub(crate) fn listen(&mut self, id: ListenerId, port: Option<u16>) -> Result<SocketAddr> {
        self.inner.listen(id, port)
    }

    pub(crate) fn unlisten(&mut self, id: ListenerId) {
        self.inner.unlisten(id);
    }

    pub(crate) fn connect(&mut self, op: OperationId, address: &str, port: u16) {
        self.inner.connect(op, address, port);
    }

    pub(crate) fn cancel(&mut self, op: OperationId) -> bool {
        self.inner.cancel(op)
    }

    /// Advance the engine one step, collecting completed events
    pub(crate) fn progress(&mut self) -> Vec<EngineEvent> {
        let mut events = Vec::new();
        self.inner.progress(&mut events);
        events
    }

    /// Connects still pending inside the engine
    #[must_use]
    pub fn pending_connects(&self) -> usize {
        self.inner.pending_connects()
    }

    /// Listeners currently bound
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.inner.listener_count()
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        tracing::debug!(worker = %self.id, "Worker released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::TransportKind;

    #[test]
    fn test_handles_are_distinct() {
        let a = Worker::new(EngineConfig::default());
        let b = Worker::new(EngineConfig::default());
        assert_ne!(a.handle(), b.handle());
        assert_eq!(a.handle(), a.id().as_u64());
    }

    #[test]
    fn test_engine_follows_transport_option() {
        let worker = Worker::new(EngineConfig {
            transport: TransportKind::InProcess,
            ..Default::default()
        });
        assert_eq!(worker.engine_name(), "inproc");
        assert_eq!(worker.config().get("TRANSPORT").map(String::as_str), Some("inproc"));
    }

    #[test]
    fn test_idle_worker_reports_nothing() {
        let mut worker = Worker::new(EngineConfig::default());
        assert!(worker.progress().is_empty());
        assert_eq!(worker.pending_connects(), 0);
        assert_eq!(worker.listener_count(), 0);
    }
}
