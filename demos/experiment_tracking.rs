//! Experiment Tracking Example
//!
//! Demonstrates a hyper-parameter sweep recorded in a shared database file:
//! a scheduler registers trials, several worker threads claim and run them,
//! and a final query reports the best trial.
//!
//! Run with: cargo run --example experiment_tracking
//! Verbose:  TRACK_LOG=track_store=debug cargo run --example experiment_tracking

use std::thread;

use anyhow::{Context, Result};
use serde_json::json;
use track_store::config::StorageOptions;
use track_store::experiment::{AggregatorKind, Fields, Project, Status, Trial, TrialGroup};
use track_store::logging::init_tracing;
use track_store::query::Query;
use track_store::storage::{FileStorage, Protocol, TrialUpdate};

const WORKERS: usize = 3;

fn fields(value: serde_json::Value) -> Result<Fields> {
    serde_json::from_value(value).context("metric payload must be an object")
}

/// Claim trials until none are left, "training" each one.
fn worker(id: usize, options: StorageOptions) -> Result<usize> {
    let mut storage = FileStorage::open(options)?;
    let reserved = Status::custom("reserved", 2);
    let pending = Query::all().eq("status", "new");
    let mut done = 0;

    while let Some(trial) =
        storage.fetch_and_update_trial(&pending, TrialUpdate::status(reserved.clone()))?
    {
        storage.log_trial_metadata(&trial, fields(json!({"worker": id}))?)?;
        storage.log_trial_start(&trial)?;

        let lr = trial.parameters()["lr"].as_f64().unwrap_or(0.1);
        let mut loss = 2.0;
        for epoch in 0..5 {
            storage.log_trial_chrono_start(&trial, "epoch", AggregatorKind::default())?;
            loss *= 1.0 - lr;
            storage.log_trial_chrono_finish(&trial, "epoch", None)?;
            storage.log_trial_metrics(&trial, Some(epoch), fields(json!({"loss": loss}))?)?;
        }

        storage.log_trial_finish(&trial, None)?;
        done += 1;
    }
    Ok(done)
}

fn main() -> Result<()> {
    init_tracing("info");
    println!("=== track-store Experiment Tracking ===\n");

    let dir = tempfile::tempdir()?;
    let options = StorageOptions::new(dir.path().join("experiments.json")).with_env_overrides()?;
    let mut storage = FileStorage::open(options.clone())?;

    // -------------------------------------------------------------------------
    // 1. Register the sweep
    // -------------------------------------------------------------------------
    println!("1. Registering sweep...");

    let project = storage.new_project(
        Project::builder("mnist")
            .description("Handwritten digit classification")
            .build(),
    )?;
    let group = storage.new_trial_group(TrialGroup::new("lr-sweep", project.uid()))?;

    for lr in [0.05, 0.1, 0.2, 0.3, 0.5] {
        let trial = Trial::builder()
            .name("mlp")
            .version("v1")
            .project(project.uid())
            .group(group.uid())
            .parameter("lr", lr)
            .register(&mut storage, false)?
            .context("sweep trials are unique")?;
        println!("   Trial {} (lr = {lr})", trial.uid());
    }

    // Same configuration again: stored under the next revision
    let rerun = Trial::builder()
        .name("mlp")
        .version("v1")
        .project(project.uid())
        .group(group.uid())
        .parameter("lr", 0.1)
        .register(&mut storage, true)?
        .context("auto-increment always inserts")?;
    println!("   Re-run of lr = 0.1 stored as revision {}", rerun.revision());

    // -------------------------------------------------------------------------
    // 2. Run workers
    // -------------------------------------------------------------------------
    println!("\n2. Running {WORKERS} workers...");

    let handles: Vec<_> = (0..WORKERS)
        .map(|id| {
            let options = options.clone();
            thread::spawn(move || worker(id, options))
        })
        .collect();
    for (id, handle) in handles.into_iter().enumerate() {
        let done = handle
            .join()
            .map_err(|_| anyhow::anyhow!("worker {id} panicked"))??;
        println!("   Worker {id} finished {done} trials");
    }

    // -------------------------------------------------------------------------
    // 3. Query results
    // -------------------------------------------------------------------------
    println!("\n3. Results...");

    let completed = storage.fetch_trials(&Query::all().eq("status", "completed"))?;
    let best = completed
        .iter()
        .filter_map(|t| {
            let loss = t.metrics().get("loss")?.last()?.as_f64()?;
            Some((t, loss))
        })
        .min_by(|a, b| a.1.total_cmp(&b.1))
        .context("no completed trial logged a loss")?;

    println!("   Completed trials: {}", completed.len());
    println!(
        "   Best: {} lr = {} final loss = {:.4} ({} updates)",
        best.0.uid(),
        best.0.parameters()["lr"],
        best.1,
        best.0.update_count()
    );
    if let Some(epoch) = best.0.chronos().get("epoch") {
        println!("   Mean epoch time: {:?} s", epoch.val());
    }

    println!("\n=== Example Complete ===");
    Ok(())
}
