//! Engine Configuration
//!
//! Typed view of the option mapping consumed by the transport engines.
//! Values arrive as strings (explicit options, `COMMLINK_*` variables, option
//! files) and are validated here when a worker is built.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CommError, Result};
use crate::options::Options;

/// Option selecting the engine
pub const TRANSPORT: &str = "TRANSPORT";
/// Address listeners bind to
pub const BIND_ADDRESS: &str = "BIND_ADDRESS";
/// Listen backlog
pub const LISTEN_BACKLOG: &str = "LISTEN_BACKLOG";
/// Maximum accepts per listener per progress step
pub const ACCEPT_BATCH: &str = "ACCEPT_BATCH";
/// Engine connect timeout in milliseconds (0 = none)
pub const CONNECT_TIMEOUT_MS: &str = "CONNECT_TIMEOUT_MS";
/// Disable Nagle on established connections
pub const TCP_NODELAY: &str = "TCP_NODELAY";
/// Set `SO_REUSEADDR` on listeners
pub const REUSE_ADDRESS: &str = "REUSE_ADDRESS";

/// Every option name the engines understand
pub const KNOWN_OPTIONS: &[&str] = &[
    TRANSPORT,
    BIND_ADDRESS,
    LISTEN_BACKLOG,
    ACCEPT_BATCH,
    CONNECT_TIMEOUT_MS,
    TCP_NODELAY,
    REUSE_ADDRESS,
];

/// Engine selection
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportKind {
    /// Non-blocking TCP sockets
    #[default]
    Tcp,

    /// In-memory connections between workers of this process
    InProcess,
}

impl TransportKind {
    /// Option value naming this transport
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::InProcess => "inproc",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "tcp" => Ok(Self::Tcp),
            "inproc" | "in_process" | "inprocess" => Ok(Self::InProcess),
            _ => Err("expected \"tcp\" or \"inproc\"".to_string()),
        }
    }
}

/// Validated engine configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Which engine builds the worker
    pub transport: TransportKind,

    /// Address listeners bind to
    pub bind_address: IpAddr,

    /// Backlog passed to listen(2)
    pub listen_backlog: i32,

    /// Upper bound on accepts per listener in one progress step
    ///
    /// Keeps each progress call bounded under an accept storm.
    pub accept_batch: usize,

    /// How long the engine lets a connect stay pending (None = no limit)
    pub connect_timeout: Option<Duration>,

    /// Disable Nagle's algorithm on established connections
    pub tcp_nodelay: bool,

    /// Allow rebinding a port still in TIME_WAIT
    pub reuse_address: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::default(),
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            listen_backlog: 128,
            accept_batch: 16,
            connect_timeout: Some(Duration::from_millis(10_000)),
            tcp_nodelay: true,
            reuse_address: true,
        }
    }
}

impl EngineConfig {
    /// Build a configuration from an option mapping
    ///
    /// Missing keys keep their defaults. Unknown keys are logged and ignored.
    /// A known key with an unparsable value fails with
    /// [`CommError::InvalidOption`].
    pub fn from_options(options: &Options) -> Result<Self> {
        let mut config = Self::default();

        for (key, value) in options {
            let value = value.trim();
            match key.as_str() {
                TRANSPORT => config.transport = parse_value(key, value)?,
                BIND_ADDRESS => config.bind_address = parse_value(key, value)?,
                LISTEN_BACKLOG => {
                    config.listen_backlog = parse_value(key, value)?;
                    if config.listen_backlog < 1 {
                        return Err(CommError::invalid_option(key, value, "must be at least 1"));
                    }
                }
                ACCEPT_BATCH => {
                    config.accept_batch = parse_value(key, value)?;
                    if config.accept_batch == 0 {
                        return Err(CommError::invalid_option(key, value, "must be at least 1"));
                    }
                }
                CONNECT_TIMEOUT_MS => {
                    let ms: u64 = parse_value(key, value)?;
                    config.connect_timeout = (ms > 0).then_some(Duration::from_millis(ms));
                }
                TCP_NODELAY => config.tcp_nodelay = parse_bool(key, value)?,
                REUSE_ADDRESS => config.reuse_address = parse_bool(key, value)?,
                _ => {
                    tracing::warn!(option = %key, "Ignoring unknown option");
                }
            }
        }

        Ok(config)
    }

    /// Render the configuration back into an option mapping
    #[must_use]
    pub fn to_options(&self) -> Options {
        let timeout_ms = self
            .connect_timeout
            .map_or(0, |t| u64::try_from(t.as_millis()).unwrap_or(u64::MAX));

        [
            (TRANSPORT, self.transport.to_string()),
            (BIND_ADDRESS, self.bind_address.to_string()),
            (LISTEN_BACKLOG, self.listen_backlog.to_string()),
            (ACCEPT_BATCH, self.accept_batch.to_string()),
            (CONNECT_TIMEOUT_MS, timeout_ms.to_string()),
            (TCP_NODELAY, bool_str(self.tcp_nodelay).to_string()),
            (REUSE_ADDRESS, bool_str(self.reuse_address).to_string()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
    }
}

fn parse_value<T>(key: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    value
        .parse()
        .map_err(|e: T::Err| CommError::invalid_option(key, value, e.to_string()))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_lowercase().as_str() {
        "y" | "yes" | "on" | "1" | "true" => Ok(true),
        "n" | "no" | "off" | "0" | "false" => Ok(false),
        _ => Err(CommError::invalid_option(key, value, "expected a boolean")),
    }
}

fn bool_str(value: bool) -> &'static str {
    if value {
        "y"
    } else {
        "n"
    }
}
