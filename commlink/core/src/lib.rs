//! Commlink Core - Progress-Driven Communication Context
//!
//! A process-wide communication context that owns one transport worker and
//! lets an application bind listeners, open outbound connections as futures
//! and drive all of it from its own loop. Nothing runs in the background:
//! connects complete and accept callbacks fire only inside
//! [`api::progress`] (or [`ApplicationContext::progress`]).
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       Application                             │
//! │   create_listener(cb)    create_endpoint(addr)    progress()  │
//! └──────────┬────────────────────────┬───────────────────┬───────┘
//!            │                        │                   │
//! ┌──────────┼────────────────────────┼───────────────────┼───────┐
//! │          ▼        ApplicationContext                  ▼       │
//! │   ┌────────────┐   ┌──────────────────┐   ┌────────────────┐  │
//! │   │ Listeners  │   │ ConnectionDriver │   │ progress step  │  │
//! │   │ (callbacks)│   │ (pending ops)    │◄──┤ settle / accept│  │
//! │   └─────┬──────┘   └────────┬─────────┘   └───────┬────────┘  │
//! │         └───────────────────┴─────────────────────┘           │
//! │                             │                                 │
//! │                    Worker (EngineWorker)                      │
//! └─────────────────────────────┼─────────────────────────────────┘
//!                               │
//!                  ┌────────────┴────────────┐
//!                  │   tcp     │   inproc    │
//!                  └─────────────────────────┘
//! ```
//!
//! # Key Types
//!
//! - [`ApplicationContext`]: owns the worker, listeners and pending connects
//! - [`Listener`]: a bound port; dropping it stops accepting
//! - [`Endpoint`]: an established connection
//! - [`ConnectFuture`]: an outbound connect, resolved by progress
//! - [`EngineConfig`]: validated worker configuration
//!
//! # Quick Start
//!
//! ```ignore
//! use commlink_core::{api, Options};
//! use std::pin::pin;
//! use std::time::Duration;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> commlink_core::Result<()> {
//!     api::init(&Options::new(), false)?;
//!
//!     let mut connect = pin!(api::create_endpoint("127.0.0.1", 9000));
//!     let endpoint = loop {
//!         tokio::select! {
//!             result = &mut connect => break result?,
//!             _ = tokio::time::sleep(Duration::from_millis(5)) => {
//!                 api::progress()?;
//!             }
//!         }
//!     };
//!     endpoint.try_send(b"hello")?;
//!
//!     api::reset();
//!     Ok(())
//! }
//! ```

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod api;
pub mod context;
pub mod driver;
pub mod endpoint;
pub mod engine;
pub mod error;
pub mod listener;
pub mod options;
pub mod worker;

pub use context::ApplicationContext;
pub use driver::{ConnectFuture, OperationStatus};
pub use endpoint::{Endpoint, EndpointOrigin};
pub use engine::{
    create_engine, EndpointId, EngineConfig, EngineConnection, EngineEvent, EngineWorker,
    ListenerId, OperationId, TransportEngine, TransportKind, WorkerId,
};
pub use error::{CommError, Result};
pub use listener::{AcceptCallback, Listener};
pub use options::{load_options_file, parse_options_toml, resolve, Options};
pub use worker::Worker;
