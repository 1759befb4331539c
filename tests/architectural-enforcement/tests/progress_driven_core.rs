//! Integration Test: Progress-Driven Core
//!
//! The communication core does work only when the caller invokes
//! `progress()`. Production code in `commlink/core` MUST NOT start threads,
//! spawn tasks or sleep; the daemon MUST pace itself with
//! `tokio::time::interval()` instead of sleeping in loops.

use architectural_enforcement::{assert_clean, scan_directory, workspace_path};

const SPAWN_PATTERNS: &[&str] = &[
    "thread::spawn(",
    "thread::Builder",
    "tokio::spawn(",
    "spawn_blocking(",
];

const SLEEP_PATTERNS: &[&str] = &["::sleep(", ".sleep("];

#[test]
fn test_core_has_no_background_work() {
    let core = workspace_path("commlink/core/src");
    assert!(core.exists(), "missing {}", core.display());

    let violations = scan_directory(&core, SPAWN_PATTERNS);
    assert_clean(
        "Core must not run work outside progress() (no threads, no spawned tasks)",
        &violations,
    );
}

#[test]
fn test_core_never_sleeps() {
    let violations = scan_directory(&workspace_path("commlink/core/src"), SLEEP_PATTERNS);
    assert_clean("No sleep in core production code", &violations);
}

#[test]
fn test_daemon_paces_with_intervals() {
    let violations = scan_directory(&workspace_path("commlink/daemon/src"), SLEEP_PATTERNS);
    assert_clean(
        "Daemon loops must wait on tokio::time::interval(), not sleep()",
        &violations,
    );
}
