//! Integration tests for the process-wide communication context
//!
//! These tests drive the public API the way an application does: bind,
//! connect, pump `progress()` and tear down. They share the process-wide
//! context, so every test holds `SERIAL` for its whole duration.
//!
//! Most scenarios use the in-process engine so that they are deterministic;
//! the loopback tests at the end exercise the TCP engine.

use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use tempfile::NamedTempFile;
use tokio_test::task;

use commlink_core::{
    api, load_options_file, ApplicationContext, CommError, ConnectFuture, Endpoint, EngineConfig,
    OperationStatus, Options, TransportKind,
};

static SERIAL: Mutex<()> = Mutex::new(());

fn inproc_options() -> Options {
    let mut options = Options::new();
    options.insert("TRANSPORT".into(), "inproc".into());
    options
}

fn inproc_context() -> ApplicationContext {
    ApplicationContext::from_config(EngineConfig {
        transport: TransportKind::InProcess,
        ..Default::default()
    })
}

/// Pump both sides until `future` resolves
fn drive(
    server: &dyn Fn() -> bool,
    client: &ApplicationContext,
    future: ConnectFuture,
) -> commlink_core::Result<Endpoint> {
    let mut future = task::spawn(future);
    for _ in 0..100 {
        if let std::task::Poll::Ready(result) = future.poll() {
            return result;
        }
        client.progress()?;
        server();
    }
    panic!("connect did not resolve after 100 progress rounds");
}

// =============================================================================
// Lifecycle
// =============================================================================

#[test]
fn test_init_reset_init() {
    let _serial = SERIAL.lock();
    api::reset();

    api::init_with_env(&inproc_options(), &Options::new(), false).unwrap();
    let second = api::init_with_env(&inproc_options(), &Options::new(), false);
    assert!(matches!(second, Err(CommError::AlreadyInitialized)));

    api::reset();
    api::init_with_env(&inproc_options(), &Options::new(), false).unwrap();
    api::reset();
}

#[test]
fn test_env_precedence_through_init() {
    let _serial = SERIAL.lock();
    api::reset();

    let mut explicit = inproc_options();
    explicit.insert("ACCEPT_BATCH".into(), "2".into());
    let mut env = Options::new();
    env.insert("ACCEPT_BATCH".into(), "7".into());

    api::init_with_env(&explicit, &env, false).unwrap();
    assert_eq!(
        api::get_config().get("ACCEPT_BATCH").map(String::as_str),
        Some("2")
    );
    api::reset();

    api::init_with_env(&explicit, &env, true).unwrap();
    assert_eq!(
        api::get_config().get("ACCEPT_BATCH").map(String::as_str),
        Some("7")
    );
    api::reset();
}

#[test]
fn test_options_file_feeds_init() {
    let _serial = SERIAL.lock();
    api::reset();

    let mut file = NamedTempFile::new().unwrap();
    writeln!(
        file,
        "[options]\nTRANSPORT = \"inproc\"\nACCEPT_BATCH = 3\nTCP_NODELAY = false"
    )
    .unwrap();

    let options = load_options_file(file.path()).unwrap();
    api::init_with_env(&options, &Options::new(), false).unwrap();

    let config = api::get_config();
    assert_eq!(config.get("ACCEPT_BATCH").map(String::as_str), Some("3"));
    assert_eq!(config.get("TCP_NODELAY").map(String::as_str), Some("n"));
    api::reset();
}

#[test]
fn test_idle_progress_is_false() {
    let _serial = SERIAL.lock();
    api::reset();

    api::init_with_env(&inproc_options(), &Options::new(), false).unwrap();
    assert!(!api::progress().unwrap());
    assert!(!api::progress().unwrap());
    api::reset();
}

// =============================================================================
// End-to-end scenario
// =============================================================================

/// Listener on the process-wide context, connect from a second context,
/// pump both until the connect resolves and the callback ran exactly once.
#[test]
fn test_end_to_end_listener_and_connect() {
    let _serial = SERIAL.lock();
    api::reset();

    api::init_with_env(&inproc_options(), &Options::new(), false).unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let received = Arc::new(Mutex::new(Vec::<Endpoint>::new()));
    let (counter, sink) = (Arc::clone(&calls), Arc::clone(&received));
    let listener = api::create_listener(
        move |endpoint| {
            counter.fetch_add(1, Ordering::SeqCst);
            sink.lock().push(endpoint);
        },
        None,
    )
    .unwrap();

    let client = inproc_context();
    let future = client.create_endpoint("127.0.0.1", listener.port());
    let server = || api::progress().unwrap_or(false);
    let endpoint = drive(&server, &client, future).unwrap();

    while calls.load(Ordering::SeqCst) == 0 {
        assert!(api::progress().unwrap());
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(!api::progress().unwrap());

    assert_eq!(endpoint.try_send(b"ping").unwrap(), 4);
    let mut buf = [0u8; 8];
    {
        let inbound = received.lock();
        assert_eq!(inbound[0].try_recv(&mut buf).unwrap(), Some(4));
        assert_eq!(&buf[..4], b"ping");
    }

    api::reset();
    assert!(!listener.is_active());
    assert!(received.lock()[0].is_closed());
    assert_eq!(api::get_config(), api::default_config());
    assert!(!api::is_initialized());
}

// =============================================================================
// Cancellation
// =============================================================================

#[test]
fn test_reset_cancels_every_pending_connect() {
    let _serial = SERIAL.lock();
    api::reset();

    api::init_with_env(&inproc_options(), &Options::new(), false).unwrap();
    let mut futures: Vec<_> = (0..4)
        .map(|i| task::spawn(api::create_endpoint("127.0.0.1", 2000 + i)))
        .collect();
    for future in &mut futures {
        assert!(future.poll().is_pending());
    }

    api::reset();

    for future in &mut futures {
        assert_eq!(future.status(), OperationStatus::Cancelled);
        assert!(future.is_woken());
        match future.poll() {
            std::task::Poll::Ready(Err(err)) => assert!(err.is_cancelled()),
            other => panic!("Expected cancellation, got: {other:?}"),
        }
    }

    // A fresh context is created on demand and is fully usable.
    let fresh = api::get_or_create();
    assert!(fresh.is_active());
    assert_eq!(fresh.pending_operations(), 0);
    assert!(!api::progress().unwrap());
    api::reset();
}

#[test]
fn test_dropped_future_never_reaches_listener() {
    let _serial = SERIAL.lock();
    api::reset();

    api::init_with_env(&inproc_options(), &Options::new(), false).unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let listener = api::create_listener(
        move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        },
        None,
    )
    .unwrap();

    let client = inproc_context();
    drop(client.create_endpoint("127.0.0.1", listener.port()));
    assert_eq!(client.pending_operations(), 0);

    client.progress().unwrap();
    api::progress().unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    api::reset();
}

#[test]
fn test_callback_may_reset_context() {
    let _serial = SERIAL.lock();
    api::reset();

    api::init_with_env(&inproc_options(), &Options::new(), false).unwrap();
    let listener = api::create_listener(|_| api::reset(), None).unwrap();

    let client = inproc_context();
    let _connect = client.create_endpoint("127.0.0.1", listener.port());
    client.progress().unwrap();

    assert!(api::progress().unwrap());
    assert!(!api::is_initialized());
    assert!(!listener.is_active());
}

// =============================================================================
// Listeners
// =============================================================================

#[test]
fn test_released_port_can_be_bound_again() {
    let _serial = SERIAL.lock();
    api::reset();

    api::init_with_env(&inproc_options(), &Options::new(), false).unwrap();
    let listener = api::create_listener(|_| {}, None).unwrap();
    let port = listener.port();

    let conflict = api::create_listener(|_| {}, Some(port));
    assert!(matches!(conflict, Err(CommError::Bind { .. })));

    listener.close();
    let again = api::create_listener(|_| {}, Some(port)).unwrap();
    assert_eq!(again.port(), port);
    api::reset();
}

#[test]
fn test_failed_connect_leaves_context_usable() {
    let _serial = SERIAL.lock();
    api::reset();

    api::init_with_env(&inproc_options(), &Options::new(), false).unwrap();
    let port = api::create_listener(|_| {}, None).unwrap().port();

    let refused = api::create_endpoint("127.0.0.1", port);
    let server = || false;
    let result = drive(&server, &api::get_or_create(), refused);
    assert!(result.unwrap_err().is_connect_error());

    assert!(api::is_initialized());
    assert!(api::get_worker_handle().is_ok());
    api::reset();
}

// =============================================================================
// TCP loopback
// =============================================================================

fn loopback_context() -> ApplicationContext {
    let mut options = Options::new();
    options.insert("TRANSPORT".into(), "tcp".into());
    options.insert("BIND_ADDRESS".into(), "127.0.0.1".into());
    options.insert("CONNECT_TIMEOUT_MS".into(), "2000".into());
    ApplicationContext::with_env(&options, &Options::new(), false).unwrap()
}

#[tokio::test]
async fn test_tcp_loopback_connect_and_echo() {
    let server = loopback_context();
    let client = loopback_context();

    let accepted = Arc::new(Mutex::new(Vec::<Endpoint>::new()));
    let sink = Arc::clone(&accepted);
    let listener = server
        .create_listener(move |endpoint| sink.lock().push(endpoint), None)
        .unwrap();

    let mut connect = std::pin::pin!(client.create_endpoint("127.0.0.1", listener.port()));
    let deadline = Instant::now() + Duration::from_secs(5);
    let endpoint = loop {
        tokio::select! {
            result = &mut connect => break result.unwrap(),
            () = tokio::time::sleep(Duration::from_millis(1)) => {
                assert!(Instant::now() < deadline, "connect timed out");
                client.progress().unwrap();
                server.progress().unwrap();
            }
        }
    };

    while accepted.lock().is_empty() {
        assert!(Instant::now() < deadline, "accept timed out");
        server.progress().unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    assert_eq!(endpoint.try_send(b"hello").unwrap(), 5);
    let mut buf = [0u8; 16];
    let n = loop {
        if let Some(n) = accepted.lock()[0].try_recv(&mut buf).unwrap() {
            break n;
        }
        assert!(Instant::now() < deadline, "recv timed out");
        tokio::time::sleep(Duration::from_millis(1)).await;
    };
    assert_eq!(&buf[..n], b"hello");

    server.shutdown();
    client.shutdown();
    assert!(endpoint.is_closed());
}

#[tokio::test]
async fn test_tcp_refused_connect_fails_future() {
    let client = loopback_context();
    let port = {
        let probe = loopback_context();
        let listener = probe.create_listener(|_| {}, None).unwrap();
        listener.port()
    };

    let mut connect = std::pin::pin!(client.create_endpoint("127.0.0.1", port));
    let deadline = Instant::now() + Duration::from_secs(5);
    let result = loop {
        tokio::select! {
            result = &mut connect => break result,
            () = tokio::time::sleep(Duration::from_millis(1)) => {
                assert!(Instant::now() < deadline, "connect never failed");
                client.progress().unwrap();
            }
        }
    };
    assert!(result.unwrap_err().is_connect_error());
}
