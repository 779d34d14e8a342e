//! Integration tests for logging initialization

use shellstudy_core::logging;

#[test]
fn test_logging_initialization_formats() {
    assert!(logging::init(Some("json")).is_ok());

    // Later calls are no-ops, whatever the format
    assert!(logging::init(Some("text")).is_ok());
    assert!(logging::init(None).is_ok());
    assert!(logging::init(Some("invalid")).is_ok());
    tracing::info!("still logging after repeated init");
}
