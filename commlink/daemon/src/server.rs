//! Listen Loop
//!
//! Binds one listener on the process-wide context and pumps `progress()` on
//! a tokio interval until a shutdown signal arrives:
//!
//! ```text
//!   interval tick ──► api::progress() ──► accept callback ──► connections
//!        │
//!        └──────────► service(connections): read, log, echo, reap closed
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use dashmap::DashMap;
use tokio::signal;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use commlink_core::{api, Endpoint, EndpointId};

const READ_CHUNK: usize = 4096;

/// Endpoints accepted by the listener and not yet closed
type Connections = Arc<DashMap<EndpointId, Endpoint>>;

/// Run the listener until Ctrl+C or SIGTERM
pub async fn run(port: Option<u16>, echo: bool, tick: Duration) -> Result<()> {
    let connections: Connections = Arc::new(DashMap::new());

    let accepted = Arc::clone(&connections);
    let listener = api::create_listener(
        move |endpoint| {
            info!(endpoint = %endpoint.id(), peer = ?endpoint.peer_addr(), "Connection accepted");
            accepted.insert(endpoint.id(), endpoint);
        },
        port,
    )
    .context("Failed to bind listener")?;

    let tick_ms = u64::try_from(tick.as_millis()).unwrap_or(u64::MAX);
    info!(addr = %listener.local_addr(), echo, tick_ms, "Listening");
    println!("listening on {}", listener.local_addr());

    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            () = &mut shutdown => break,
            _ = ticker.tick() => {
                api::progress().context("Progress failed")?;
                service(&connections, echo);
            }
        }
    }

    info!(open = connections.len(), "Shutting down listener");
    drop(listener);
    connections.clear();
    Ok(())
}

/// Drain readable endpoints, echoing if requested; drop closed ones
fn service(connections: &Connections, echo: bool) {
    let mut buf = [0u8; READ_CHUNK];

    connections.retain(|id, endpoint| loop {
        match endpoint.try_recv(&mut buf) {
            Ok(None) => return true,
            Ok(Some(0)) => {
                info!(endpoint = %id, "Peer closed connection");
                return false;
            }
            Ok(Some(n)) => {
                debug!(endpoint = %id, bytes = n, "Received");
                println!("{id}: {}", String::from_utf8_lossy(&buf[..n]).trim_end());
                if echo && !send_all(endpoint, &buf[..n]) {
                    return false;
                }
            }
            Err(e) => {
                warn!(endpoint = %id, error = %e, "Receive failed, dropping connection");
                return false;
            }
        }
    });
}

/// Send `data`, giving up when the engine stops accepting bytes
fn send_all(endpoint: &Endpoint, mut data: &[u8]) -> bool {
    while !data.is_empty() {
        match endpoint.try_send(data) {
            Ok(0) => {
                warn!(endpoint = %endpoint.id(), dropped = data.len(), "Send buffer full, echo truncated");
                return true;
            }
            Ok(n) => data = &data[n..],
            Err(e) => {
                warn!(endpoint = %endpoint.id(), error = %e, "Send failed, dropping connection");
                return false;
            }
        }
    }
    true
}

/// Resolves on Ctrl+C or, on Unix, SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C, shutting down"),
        () = terminate => info!("Received SIGTERM, shutting down"),
    }
}
