//! Commlink Daemon - Command-Line Host for the Communication Context
//!
//! Embeds the process-wide communication context and pumps `progress()`
//! from a tokio loop. The core never polls on its own; this binary is the
//! external scheduler.
//!
//! # Usage
//!
//! ```bash
//! # Accept connections on port 9000 and echo what they send
//! commlink-daemon listen --port 9000 --echo
//!
//! # Connect, send a line and print the reply
//! commlink-daemon connect 127.0.0.1 9000 --message hello
//!
//! # Engine options from the command line or a TOML file
//! commlink-daemon -o ACCEPT_BATCH=4 --config commlink.toml listen
//!
//! # Show what a worker would be configured with
//! commlink-daemon config
//!
//! # Verbose logging
//! RUST_LOG=debug commlink-daemon listen
//! ```
//!
//! # Environment Variables
//!
//! - `COMMLINK_<OPTION>`: engine option override (e.g. `COMMLINK_TRANSPORT`)
//! - `COMMLINKD_CONFIG`: option file path, same as `--config`
//! - `RUST_LOG`: log filter (trace, debug, info, warn, error)
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: graceful shutdown of `listen`

mod probe;
mod server;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use commlink_core::{api, load_options_file, options, EngineConfig, Options};

/// Commlink Daemon - progress-driven listener and connect probe
#[derive(Parser, Debug)]
#[command(name = "commlink-daemon")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Engine option as KEY=VALUE (repeatable, later wins)
    #[arg(short = 'o', long = "option", global = true, value_name = "KEY=VALUE", value_parser = parse_key_value)]
    options: Vec<(String, String)>,

    /// Let COMMLINK_* environment variables override explicit options
    #[arg(long, global = true)]
    env_first: bool,

    /// TOML file with an [options] table
    #[arg(short = 'c', long, global = true, env = "COMMLINKD_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level used when RUST_LOG is unset
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Bind a listener and pump progress until interrupted
    Listen {
        /// Port to bind; the engine picks one when omitted
        #[arg(short, long)]
        port: Option<u16>,

        /// Send received bytes back to the peer
        #[arg(long)]
        echo: bool,

        /// Interval between progress calls, in milliseconds
        #[arg(long, default_value_t = 10)]
        tick_ms: u64,
    },

    /// Connect to ADDRESS:PORT and optionally exchange a message
    Connect {
        /// Remote address
        address: String,

        /// Remote port
        port: u16,

        /// Message to send once connected
        #[arg(short, long)]
        message: Option<String>,

        /// Give up after this many milliseconds
        #[arg(long, default_value_t = 5000)]
        timeout_ms: u64,
    },

    /// Print the effective engine configuration
    Config,
}

fn parse_key_value(s: &str) -> std::result::Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got {s:?}"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty option name in {s:?}"));
    }
    Ok((key.to_string(), value.to_string()))
}

/// Explicit options: the option file first, then `--option` flags
fn explicit_options(config: Option<&Path>, flags: &[(String, String)]) -> Result<Options> {
    let mut explicit = match config {
        Some(path) => load_options_file(path)
            .with_context(|| format!("Failed to load options from {}", path.display()))?,
        None => Options::new(),
    };
    explicit.extend(flags.iter().cloned());
    Ok(explicit)
}

/// Initialize logging with the specified level
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!(
            "commlink_daemon={level},commlink_core={level}"
        ))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

fn print_config(explicit: &Options, env_first: bool) -> Result<()> {
    let config = if explicit.is_empty() {
        api::get_config()
    } else {
        let resolved = options::resolve(explicit, &options::env_options(), env_first);
        EngineConfig::from_options(&resolved)
            .context("Invalid engine options")?
            .to_options()
    };

    for (key, value) in &config {
        println!("{key}={value}");
    }
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    let explicit = explicit_options(args.config.as_deref(), &args.options)?;

    match args.command {
        Command::Config => print_config(&explicit, args.env_first),
        Command::Listen {
            port,
            echo,
            tick_ms,
        } => {
            api::init(&explicit, args.env_first).context("Failed to initialize context")?;
            info!(worker = api::get_worker_handle()?, "Context initialized");
            let result = server::run(port, echo, Duration::from_millis(tick_ms.max(1))).await;
            api::reset();
            result
        }
        Command::Connect {
            address,
            port,
            message,
            timeout_ms,
        } => {
            api::init(&explicit, args.env_first).context("Failed to initialize context")?;
            let result = probe::run(
                &address,
                port,
                message.as_deref(),
                Duration::from_millis(timeout_ms),
            )
            .await;
            api::reset();
            result
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_key_value() {
        assert_eq!(
            parse_key_value("ACCEPT_BATCH=4").unwrap(),
            ("ACCEPT_BATCH".to_string(), "4".to_string())
        );
        assert_eq!(
            parse_key_value("BIND_ADDRESS=::1").unwrap().1,
            "::1".to_string()
        );
        assert!(parse_key_value("NOVALUE").is_err());
        assert!(parse_key_value("=1").is_err());
    }

    #[test]
    fn test_flags_override_option_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[options]\nACCEPT_BATCH = 2\nTRANSPORT = \"inproc\"").unwrap();

        let flags = vec![("ACCEPT_BATCH".to_string(), "9".to_string())];
        let explicit = explicit_options(Some(file.path()), &flags).unwrap();
        assert_eq!(explicit.get("ACCEPT_BATCH").map(String::as_str), Some("9"));
        assert_eq!(explicit.get("TRANSPORT").map(String::as_str), Some("inproc"));
    }

    #[test]
    fn test_missing_option_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.toml");
        assert!(explicit_options(Some(&missing), &[]).is_err());
    }

    #[test]
    fn test_cli_parses_subcommands() {
        let args = Args::try_parse_from([
            "commlink-daemon",
            "-o",
            "TRANSPORT=inproc",
            "connect",
            "127.0.0.1",
            "9000",
            "--message",
            "hi",
        ])
        .unwrap();
        assert_eq!(args.options.len(), 1);
        match args.command {
            Command::Connect { address, port, message, timeout_ms } => {
                assert_eq!(address, "127.0.0.1");
                assert_eq!(port, 9000);
                assert_eq!(message.as_deref(), Some("hi"));
                assert_eq!(timeout_ms, 5000);
            }
            other => panic!("Expected Connect, got: {other:?}"),
        }
    }

    #[test]
    fn test_global_options_follow_subcommand() {
        let args = Args::try_parse_from([
            "commlink-daemon",
            "listen",
            "--port",
            "9000",
            "-o",
            "ACCEPT_BATCH=4",
            "--env-first",
            "--config",
            "commlink.toml",
        ])
        .unwrap();
        assert_eq!(
            args.options,
            vec![("ACCEPT_BATCH".to_string(), "4".to_string())]
        );
        assert!(args.env_first);
        assert_eq!(args.config, Some(PathBuf::from("commlink.toml")));
        assert!(matches!(args.command, Command::Listen { port: Some(9000), .. }));
    }
}
