//! Listeners
//!
//! A listener binds its port synchronously when created and stays active for
//! exactly as long as the caller holds the [`Listener`] value. Each accepted
//! connection is delivered to the accept callback from inside the progress
//! step that observed it.
//!
//! NB: dropping the `Listener` stops accepting and releases the port, so keep
//! it alive for as long as connections should be accepted.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::context::ContextInner;
use crate::endpoint::Endpoint;
use crate::engine::ListenerId;

/// Callback invoked once per accepted connection
pub type AcceptCallback = Box<dyn FnMut(Endpoint) + Send + 'static>;

/// Registry entry for a bound listener
pub(crate) struct ListenerEntry {
    pub(crate) callback: Arc<Mutex<AcceptCallback>>,
    pub(crate) active: Arc<AtomicBool>,
}

impl ListenerEntry {
    pub(crate) fn new(callback: AcceptCallback) -> Self {
        Self {
            callback: Arc::new(Mutex::new(callback)),
            active: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Stop deliveries already collected by a running progress step
    pub(crate) fn deactivate(&self) {
        self.active.store(false, Ordering::SeqCst);
    }
}

/// A bound listener accepting inbound connections
pub struct Listener {
    id: ListenerId,
    local_addr: SocketAddr,
    active: Arc<AtomicBool>,
    context: Weak<ContextInner>,
}

impl Listener {
    pub(crate) fn new(
        id: ListenerId,
        local_addr: SocketAddr,
        active: Arc<AtomicBool>,
        context: Weak<ContextInner>,
    ) -> Self {
        Self {
            id,
            local_addr,
            active,
            context,
        }
    }

    /// Identifier of this listener
    #[must_use]
    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Port the listener is bound to
    #[must_use]
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Address the listener is bound to
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Whether the listener is still accepting
    ///
    /// False after `close()` or after the owning context was torn down.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Stop accepting and release the port; same as dropping the listener
    pub fn close(self) {
        drop(self);
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.active.store(false, Ordering::SeqCst);
        if let Some(context) = self.context.upgrade() {
            context.remove_listener(self.id);
        }
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("id", &self.id)
            .field("local_addr", &self.local_addr)
            .field("active", &self.is_active())
            .finish()
    }
}
