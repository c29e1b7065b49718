//! Tests for error types

use std::path::PathBuf;
use std::time::Duration;

use track_store::error::EntityKind;
use track_store::Error;

#[test]
fn test_identity_conflict_error() {
    let error = Error::IdentityConflict {
        kind: EntityKind::TrialGroup,
        uid: "abc123".to_string(),
    };
    let error_str = format!("{error}");
    assert!(error_str.contains("trial_group already exists"));
    assert!(error_str.contains("abc123"));
}

#[test]
fn test_missing_parent_error() {
    let error = Error::MissingParent {
        kind: EntityKind::Trial,
        uid: "deadbeef_0".to_string(),
        parent: "mnist".to_string(),
    };
    let error_str = format!("{error}");
    assert!(error_str.contains("references missing parent mnist"));
    assert!(error_str.contains("strict = false"));
}

#[test]
fn test_not_found_error() {
    let error = Error::NotFound {
        kind: EntityKind::Project,
        uid: "ghost".to_string(),
    };
    assert_eq!(format!("{error}"), "project not found (uid: ghost)");
}

#[test]
fn test_concurrency_timeout_error() {
    let error = Error::ConcurrencyTimeout {
        path: PathBuf::from("/tmp/db.json.lock"),
        waited: Duration::from_millis(250),
    };
    let error_str = format!("{error}");
    assert!(error_str.contains("/tmp/db.json.lock"));
    assert!(error_str.contains("250ms"));
    assert!(error_str.contains("retry later"));
    assert!(error.is_timeout());
}

#[test]
fn test_merge_conflict_error() {
    let error = Error::MergeConflict {
        uid: "abc_0".to_string(),
        reason: "dtype changed".to_string(),
    };
    let error_str = format!("{error}");
    assert!(error_str.contains("Merge conflict on abc_0"));
    assert!(error_str.contains("Please report this issue"));
    assert!(!error.is_timeout());
}

#[test]
fn test_stale_reference_error() {
    let error = Error::StaleReference {
        kind: EntityKind::Trial,
        uid: "abc_1".to_string(),
    };
    assert!(format!("{error}").contains("indexed but not stored"));
}

#[test]
fn test_invalid_query_error() {
    let error = Error::InvalidQuery("unknown operator `$regex`".to_string());
    let error_str = format!("{error}");
    assert!(error_str.contains("Invalid query"));
    assert!(error_str.contains("$regex"));
}

#[test]
fn test_invalid_input_error() {
    let error = Error::InvalidInput("metric `loss` is step-indexed".to_string());
    let error_str = format!("{error}");
    assert!(error_str.contains("Invalid input"));
    assert!(error_str.contains("loss"));
}

#[test]
fn test_config_error() {
    let error = Error::Config("unknown storage option `color`".to_string());
    assert!(format!("{error}").starts_with("Configuration error"));
}

#[test]
fn test_shutting_down_error() {
    let error_str = format!("{}", Error::ShuttingDown);
    assert!(error_str.contains("not committed"));
    assert!(!Error::ShuttingDown.is_timeout());
}

#[test]
fn test_io_error_conversion() {
    let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
    let error: Error = io_error.into();
    let error_str = format!("{error}");
    assert!(error_str.contains("IO error"));
    assert!(error_str.contains("file not found"));
}

#[test]
fn test_json_error_conversion() {
    let json_error = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
    let error: Error = json_error.into();
    assert!(format!("{error}").contains("JSON error"));
}

#[test]
fn test_error_debug() {
    let error = Error::InvalidQuery("test".to_string());
    let debug_str = format!("{error:?}");
    assert!(debug_str.contains("InvalidQuery"));
}
