//! Integration Test: Duration Conversions
//!
//! `Duration::as_millis()` returns `u128`. Production code MUST convert it
//! with `u64::try_from(..)` and saturate, never with an `as` cast.

use architectural_enforcement::{assert_clean, scan_directory, workspace_path};

const TRUNCATING_CASTS: &[&str] = &[
    "as_millis() as ",
    "as_micros() as ",
    "as_nanos() as ",
];

#[test]
fn test_no_truncating_duration_casts() {
    let mut violations = scan_directory(&workspace_path("commlink/core/src"), TRUNCATING_CASTS);
    violations.extend(scan_directory(
        &workspace_path("commlink/daemon/src"),
        TRUNCATING_CASTS,
    ));
    assert_clean(
        "Duration conversions must saturate with u64::try_from, not truncate with `as`",
        &violations,
    );
}
