//! Process-Wide Context
//!
//! One communication context per process, behind an explicit
//! UNINITIALIZED / ACTIVE state machine:
//!
//! ```text
//!                 init / get_or_create
//!  UNINITIALIZED ──────────────────────► ACTIVE
//!        ▲                                  │
//!        └──────────── reset ───────────────┘
//! ```
//!
//! A slot holding a context that was shut down through its own handle
//! counts as UNINITIALIZED and is replaced on the next `init` or
//! auto-create.
//!
//! Every operation except [`init`], [`reset`], [`is_initialized`] and
//! [`get_config`] creates the context on first use.
//!
//! # Example
//!
//! ```no_run
//! use commlink_core::api;
//!
//! let listener = api::create_listener(|endpoint| {
//!     println!("accepted {:?}", endpoint.peer_addr());
//! }, Some(9000))?;
//!
//! loop {
//!     api::progress()?;
//! #   break;
//! }
//! # drop(listener);
//! # Ok::<(), commlink_core::CommError>(())
//! ```

use parking_lot::Mutex;

use crate::context::ApplicationContext;
use crate::driver::ConnectFuture;
use crate::endpoint::Endpoint;
use crate::engine::EngineConfig;
use crate::error::{CommError, Result};
use crate::listener::Listener;
use crate::options::{self, Options};

static CONTEXT: Mutex<Option<ApplicationContext>> = Mutex::new(None);

/// Create the process-wide context
///
/// Resolves `options` against the `COMMLINK_*` environment, validates the
/// result and builds the worker. Fails with `AlreadyInitialized` while a
/// context is active.
pub fn init(options: &Options, env_takes_precedence: bool) -> Result<ApplicationContext> {
    init_with_env(options, &options::env_options(), env_takes_precedence)
}

/// [`init`] with an explicit environment instead of the process variables
pub fn init_with_env(
    options: &Options,
    env: &Options,
    env_takes_precedence: bool,
) -> Result<ApplicationContext> {
    let mut slot = CONTEXT.lock();
    if live(slot.as_ref()).is_some() {
        return Err(CommError::AlreadyInitialized);
    }

    let context = ApplicationContext::with_env(options, env, env_takes_precedence)?;
    *slot = Some(context.clone());
    Ok(context)
}

/// The live context, created from the environment alone if needed
///
/// Never fails: when the environment holds an invalid option, a warning is
/// logged and engine defaults are used instead.
pub fn get_or_create() -> ApplicationContext {
    let mut slot = CONTEXT.lock();
    if let Some(context) = live(slot.as_ref()) {
        return context.clone();
    }

    let context = match ApplicationContext::with_env(&Options::new(), &options::env_options(), false)
    {
        Ok(context) => context,
        Err(e) => {
            tracing::warn!(error = %e, "Invalid environment options, using engine defaults");
            ApplicationContext::from_config(EngineConfig::default())
        }
    };
    *slot = Some(context.clone());
    context
}

/// Tear down the process-wide context, if any
///
/// Pending connects are cancelled, listeners stop, endpoints close and the
/// worker is released. Handles obtained earlier report `NotInitialized`
/// afterwards. Never fails.
pub fn reset() {
    // Release the slot before teardown so woken tasks may re-initialize.
    let context = CONTEXT.lock().take();
    if let Some(context) = context {
        context.shutdown();
    }
}

/// Whether a process-wide context is active
#[must_use]
pub fn is_initialized() -> bool {
    live(CONTEXT.lock().as_ref()).is_some()
}

fn live(slot: Option<&ApplicationContext>) -> Option<&ApplicationContext> {
    slot.filter(|context| context.is_active())
}

/// Bind a listener on the process-wide context
pub fn create_listener<F>(callback: F, port: Option<u16>) -> Result<Listener>
where
    F: FnMut(Endpoint) + Send + 'static,
{
    get_or_create().create_listener(callback, port)
}

/// Start connecting from the process-wide context
pub fn create_endpoint(address: &str, port: u16) -> ConnectFuture {
    get_or_create().create_endpoint(address, port)
}

/// Advance the process-wide context one bounded step
///
/// Accept callbacks may call back into this module, including [`reset`].
pub fn progress() -> Result<bool> {
    get_or_create().progress()
}

/// Numeric identity of the process-wide worker
pub fn get_worker_handle() -> Result<u64> {
    get_or_create().worker_handle()
}

/// Configuration of the process-wide worker
///
/// While uninitialized, reports what a worker created now would use: engine
/// defaults with environment overrides. No worker is built.
#[must_use]
pub fn get_config() -> Options {
    let active = CONTEXT.lock().clone();
    if let Some(config) = active.and_then(|context| context.config().ok()) {
        return config;
    }
    config_from_env(&options::env_options())
}

/// Engine defaults as an option mapping
#[must_use]
pub fn default_config() -> Options {
    EngineConfig::default().to_options()
}

fn config_from_env(env: &Options) -> Options {
    let resolved = options::resolve(&Options::new(), env, false);
    match EngineConfig::from_options(&resolved) {
        Ok(config) => config.to_options(),
        Err(e) => {
            tracing::warn!(error = %e, "Invalid environment options, reporting engine defaults");
            default_config()
        }
    }
}
