//! Experiment Schema Tests
//!
//! Identity rules and the persisted shape of projects, trial groups and
//! trials, checked through the public API only.

use serde_json::json;
use track_store::experiment::{
    compute_hash, Aggregator, AggregatorKind, Fields, Project, Record, Status, Trial, TrialGroup,
};

// =============================================================================
// Project Tests
// =============================================================================

#[test]
fn test_project_identity_is_its_name() {
    let project = Project::builder("mnist")
        .description("handwritten digits")
        .metadata("owner", "vision-team")
        .build();

    assert_eq!(project.uid(), "mnist");
    assert_eq!(project.name(), "mnist");
    assert_eq!(project.description(), Some("handwritten digits"));
    assert_eq!(project.metadata()["owner"], json!("vision-team"));
    assert!(project.groups().is_empty());
    assert!(project.trials().is_empty());
}

#[test]
fn test_project_record_embeds_nothing_when_empty() {
    let json = serde_json::to_value(Record::Project(
        track_store::experiment::ProjectRecord::embed(&Project::new("p"), Vec::new(), Vec::new()),
    ))
    .unwrap();
    assert_eq!(json["dtype"], json!("project"));
    assert_eq!(json["name"], json!("p"));
    assert_eq!(json["groups"], json!([]));
    assert_eq!(json["trials"], json!([]));
}

// =============================================================================
// TrialGroup Tests
// =============================================================================

#[test]
fn test_group_uid_depends_on_name_and_project() {
    let a = TrialGroup::new("sweep", "mnist");
    let b = TrialGroup::new("sweep", "mnist");
    let other_project = TrialGroup::new("sweep", "cifar");
    let other_name = TrialGroup::new("ablation", "mnist");

    assert_eq!(a.uid(), b.uid());
    assert_ne!(a.uid(), other_project.uid());
    assert_ne!(a.uid(), other_name.uid());
    assert_eq!(a.uid(), TrialGroup::compute_uid("sweep", "mnist"));
    assert_eq!(a.project_id(), "mnist");
}

#[test]
fn test_group_builder_fields() {
    let group = TrialGroup::builder("sweep", "mnist")
        .description("learning-rate sweep")
        .metadata("budget", 20)
        .build();
    assert_eq!(group.description(), Some("learning-rate sweep"));
    assert_eq!(group.metadata()["budget"], json!(20));
    assert_eq!(group.uid(), TrialGroup::new("sweep", "mnist").uid());
}

// =============================================================================
// Trial Tests
// =============================================================================

#[test]
fn test_trial_hash_covers_name_version_and_parameters() {
    let base = Trial::builder().name("t").version("1").parameter("lr", 0.1).finalize();
    let mut params = Fields::new();
    params.insert("lr".to_string(), json!(0.1));
    assert_eq!(base.hash(), compute_hash(&[json!("t"), json!("1")], &params));
}

#[test]
fn test_trial_hash_keeps_name_and_version_apart() {
    let named = Trial::builder().name("x").finalize();
    let versioned = Trial::builder().version("x").finalize();
    assert_ne!(named.hash(), versioned.hash());
    assert_ne!(named.uid(), versioned.uid());
}

#[test]
fn test_trial_hash_ignores_descriptive_fields() {
    let plain = Trial::builder().name("t").parameter("lr", 0.1).finalize();
    let decorated = Trial::builder()
        .name("t")
        .parameter("lr", 0.1)
        .description("baseline")
        .tag("arch", "cnn")
        .metadata("user", "alice")
        .project("mnist")
        .finalize();
    assert_eq!(plain.hash(), decorated.hash());
}

#[test]
fn test_trial_uid_format() {
    let trial = Trial::builder().name("t").revision(3).finalize();
    assert_eq!(trial.uid(), format!("{}_3", trial.hash()));

    let parsed = Trial::from_uid(&trial.uid()).unwrap();
    assert_eq!(parsed.hash(), trial.hash());
    assert_eq!(parsed.revision(), 3);

    assert!(Trial::from_uid("abc_notanumber").is_err());
}

#[test]
fn test_trial_defaults() {
    let trial = Trial::builder().name("t").finalize();
    assert_eq!(trial.revision(), 0);
    assert_eq!(trial.status(), &Status::CreatedGroup);
    assert!(trial.errors().is_empty());
    assert!(trial.metrics().is_empty());
    assert!(trial.chronos().is_empty());
    assert_eq!(trial.update_count(), 0);
    assert!(trial.last_change().is_none());
}

#[test]
fn test_trial_record_shape() {
    let trial = Trial::builder()
        .name("t")
        .project("mnist")
        .parameter("lr", 0.1)
        .status(Status::custom("reserved", 2))
        .finalize();
    let json = serde_json::to_value(Record::Trial(trial.clone())).unwrap();

    assert_eq!(json["dtype"], json!("trial"));
    assert_eq!(json["uid"], json!(trial.uid()));
    assert_eq!(json["parameters"]["lr"], json!(0.1));
    assert_eq!(json["status"], json!({"name": "reserved", "value": 2}));

    let back: Record = serde_json::from_value(json).unwrap();
    assert_eq!(back.uid(), trial.uid());
}

// =============================================================================
// Status Tests
// =============================================================================

#[test]
fn test_status_names_and_values() {
    let expected = [
        (Status::CreatedGroup, "new", 0),
        (Status::Running, "running", 101),
        (Status::Interrupted, "interrupted", 201),
        (Status::Exception, "exception", 202),
        (Status::Broken, "broken", 203),
        (Status::Suspended, "suspended", 301),
        (Status::Completed, "completed", 302),
    ];
    for (status, name, value) in expected {
        assert_eq!(status.name(), name);
        assert_eq!(status.value(), value);
        assert_eq!(Status::builtin(name), Some(status));
    }
    assert_eq!(Status::builtin("CreatedGroup"), Some(Status::CreatedGroup));
}

#[test]
fn test_custom_status_display() {
    assert_eq!(Status::custom("reserved", 2).to_string(), "CStatus<reserved>");
    assert_eq!(Status::Running.to_string(), "running");
}

// =============================================================================
// Aggregator Tests
// =============================================================================

#[test]
fn test_default_chrono_is_running_stat() {
    let mut chrono = Aggregator::new(AggregatorKind::default());
    chrono.append(10.0);
    chrono.append(2.0);
    chrono.append(4.0);
    assert_eq!(chrono.observations(), 3);
    assert_eq!(chrono.val(), Some(3.0));
}

#[test]
fn test_aggregator_persisted_with_kind_tag() {
    let mut chrono = Aggregator::new(AggregatorKind::TimeSeries);
    chrono.append(1.5);
    let json = serde_json::to_value(&chrono).unwrap();
    assert_eq!(json["kind"], json!("time_series"));
    assert_eq!(json["values"], json!([1.5]));
}
