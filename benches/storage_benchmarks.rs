//! Storage backend benchmarks
//!
//! Benchmarks for the file-backed storage:
//! - Document loading
//! - Query evaluation over loaded trials
//! - Staged commit (serialize + fsync + rename)
//! - One guarded mutation (lock + reload + commit)
//!
//! Toyota Way: Measure before optimizing (Genchi Genbutsu)

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::json;
use tempfile::{tempdir, TempDir};
use track_store::config::StorageOptions;
use track_store::experiment::{Project, Trial, TrialGroup};
use track_store::query::Query;
use track_store::storage::{Entity, FileStorage, LocalStorage, Protocol};

/// In-memory storage with one project, one group and `num_trials` trials
#[allow(clippy::cast_precision_loss)]
fn create_test_storage(num_trials: usize) -> LocalStorage {
    let mut storage = LocalStorage::new();
    let group = TrialGroup::new("sweep", "bench");
    storage.insert(Entity::Project(Project::new("bench"))).unwrap();
    storage.insert(Entity::TrialGroup(group.clone())).unwrap();

    for i in 0..num_trials {
        let trial = Trial::builder()
            .name(format!("trial_{i}"))
            .project("bench")
            .group(group.uid())
            .parameter("lr", i as f64 / num_trials as f64)
            .metadata("user", format!("user_{}", i % 10))
            .finalize();
        storage.insert(Entity::Trial(trial)).unwrap();
    }
    storage
}

/// Persist a test storage to a fresh directory
fn create_test_file(num_trials: usize) -> (TempDir, std::path::PathBuf) {
    let dir = tempdir().unwrap();
    let path = dir.path().join("db.json");
    create_test_storage(num_trials).commit(&path).unwrap();
    (dir, path)
}

/// Benchmark document loading
fn bench_load(c: &mut Criterion) {
    let mut group = c.benchmark_group("load");

    for size in [100, 1_000, 10_000].iter() {
        let (_dir, path) = create_test_file(*size);

        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, _| {
            b.iter(|| {
                let storage = LocalStorage::load(&path).unwrap();
                black_box(storage);
            });
        });
    }

    group.finish();
}

/// Benchmark query evaluation
fn bench_fetch_trials(c: &mut Criterion) {
    let mut group = c.benchmark_group("fetch_trials");
    let query = Query::parse(&json!({
        "status": "new",
        "metadata.user": {"$in": ["user_1", "user_3"]},
        "parameters.lr": {"$lt": 0.5},
    }))
    .unwrap();

    for size in [1_000, 10_000].iter() {
        let storage = create_test_storage(*size);

        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, _| {
            b.iter(|| {
                let found = storage.fetch_trials(&query, false).unwrap();
                black_box(found.len());
            });
        });
    }

    group.finish();
}

/// Benchmark staged commit of a whole snapshot
fn bench_commit(c: &mut Criterion) {
    let mut group = c.benchmark_group("commit");

    for size in [100, 1_000].iter() {
        let storage = create_test_storage(*size);
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.json");

        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, _| {
            b.iter(|| storage.commit(black_box(&path)).unwrap());
        });
    }

    group.finish();
}

/// Benchmark one eager mutation (lock, reload, merge, commit)
fn bench_guarded_mutation(c: &mut Criterion) {
    let mut group = c.benchmark_group("guarded_mutation");
    group.sample_size(20);

    for size in [10, 100].iter() {
        let (_dir, path) = create_test_file(*size);
        let options = StorageOptions::new(&path).signal_handlers(false);
        let mut storage = FileStorage::open(options).unwrap();
        let trial = storage.fetch_trials(&Query::all()).unwrap().remove(0);
        let mut step = 0_i64;

        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, _| {
            b.iter(|| {
                step += 1;
                let values = serde_json::from_value(json!({"loss": 0.5})).unwrap();
                storage.log_trial_metrics(&trial, Some(step), values).unwrap();
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_load,
    bench_fetch_trials,
    bench_commit,
    bench_guarded_mutation
);
criterion_main!(benches);
