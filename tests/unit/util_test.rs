//! Tests for utility functions

use prometheus_orchestra::util::{init_tracing, panic_message};

#[test]
fn test_panic_message_unknown_payload() {
    let caught = std::panic::catch_unwind(|| std::panic::panic_any(7_u8)).unwrap_err();
    assert_eq!(panic_message(caught.as_ref()), "unknown panic payload");
}

#[test]
fn test_init_tracing_is_idempotent() {
    init_tracing();
    init_tracing();
    tracing::info!(target: "orchestra::test", "tracing initialized");
}
