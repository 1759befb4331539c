//! Connect Probe
//!
//! Opens one outbound endpoint on the process-wide context, racing the
//! connect future against the caller's timeout while pumping `progress()`.
//! The core imposes no timeout of its own; dropping the future on expiry
//! cancels the connect.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info};

use commlink_core::{api, Endpoint};

/// Interval between progress calls while waiting
const TICK: Duration = Duration::from_millis(1);

/// Connect, optionally send `message`, print the reply
pub async fn run(
    address: &str,
    port: u16,
    message: Option<&str>,
    timeout: Duration,
) -> Result<()> {
    let deadline = Instant::now() + timeout;
    let endpoint = connect(address, port, deadline).await?;

    info!(endpoint = %endpoint.id(), local = ?endpoint.local_addr(), peer = ?endpoint.peer_addr(), "Connected");
    println!(
        "connected to {address}:{port} from {}",
        endpoint
            .local_addr()
            .map_or_else(|| "?".to_string(), |addr| addr.to_string())
    );

    if let Some(message) = message {
        send(&endpoint, message.as_bytes(), deadline).await?;
        match receive(&endpoint, deadline).await? {
            Some(reply) => println!("{}", String::from_utf8_lossy(&reply).trim_end()),
            None => println!("no reply"),
        }
    }

    endpoint.close();
    Ok(())
}

async fn connect(address: &str, port: u16, deadline: Instant) -> Result<Endpoint> {
    let connect = api::create_endpoint(address, port);
    tokio::pin!(connect);

    let mut ticker = ticker();
    loop {
        tokio::select! {
            result = &mut connect => {
                return result.with_context(|| format!("Failed to connect to {address}:{port}"));
            }
            () = tokio::time::sleep_until(deadline) => {
                bail!("Timed out connecting to {address}:{port}");
            }
            _ = ticker.tick() => {
                api::progress().context("Progress failed")?;
            }
        }
    }
}

async fn send(endpoint: &Endpoint, mut data: &[u8], deadline: Instant) -> Result<()> {
    let mut ticker = ticker();
    while !data.is_empty() {
        let n = endpoint.try_send(data).context("Send failed")?;
        data = &data[n..];
        if n == 0 {
            if Instant::now() >= deadline {
                bail!("Timed out sending, {} bytes left", data.len());
            }
            ticker.tick().await;
        }
    }
    debug!(endpoint = %endpoint.id(), "Message sent");
    Ok(())
}

/// First chunk the peer sends before `deadline`, if any
async fn receive(endpoint: &Endpoint, deadline: Instant) -> Result<Option<Vec<u8>>> {
    let mut ticker = ticker();
    let mut buf = vec![0u8; 4096];
    loop {
        match endpoint.try_recv(&mut buf).context("Receive failed")? {
            Some(0) => return Ok(None),
            Some(n) => {
                buf.truncate(n);
                return Ok(Some(buf));
            }
            None if Instant::now() >= deadline => return Ok(None),
            None => {
                ticker.tick().await;
            }
        }
    }
}

fn ticker() -> Interval {
    let mut ticker = tokio::time::interval(TICK);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}
