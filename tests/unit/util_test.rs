//! Tests for utility functions

use bacnet_iocore::util::{init_tracing, DEFAULT_DIRECTIVE};

#[test]
fn test_init_tracing_is_idempotent() {
    init_tracing();
    init_tracing();
    tracing::info!(target: "bacnet_iocore", "tracing initialised");
}

#[test]
fn test_default_directive_targets_crate() {
    assert!(DEFAULT_DIRECTIVE.starts_with("bacnet_iocore"));
}
