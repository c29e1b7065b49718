//! # track-store: Multi-Process Experiment Tracking Storage
//!
//! **Version**: 0.3.0
//!
//! track-store records machine-learning experiments (projects, trial groups
//! and trials) in a single JSON document that many worker processes on one
//! machine can share safely. Every mutation runs under an exclusive file
//! lock, reloads the latest document, merges, and publishes the result with
//! an atomic rename.
//!
//! ## Design Principles (Toyota Way Aligned)
//!
//! - **Poka-Yoke safety**: Readers never observe a half-written document
//! - **Jidoka**: Merge conflicts stop the line instead of silently dropping data
//! - **Genchi Genbutsu**: Every guarded call re-reads the file on disk
//! - **Muda elimination**: Identity is content-derived, so duplicate trials are free
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use track_store::config::StorageOptions;
//! use track_store::experiment::{Project, Status, Trial, TrialGroup};
//! use track_store::query::Query;
//! use track_store::storage::{FileStorage, Protocol, TrialUpdate};
//!
//! let mut storage = FileStorage::open(StorageOptions::new("runs/db.json"))?;
//!
//! let project = storage.new_project(Project::new("mnist"))?;
//! let group = storage.new_trial_group(TrialGroup::new("lr-sweep", project.uid()))?;
//! for lr in [0.1, 0.01, 0.001] {
//!     Trial::builder()
//!         .name("resnet18")
//!         .project(project.uid())
//!         .group(group.uid())
//!         .parameter("lr", lr)
//!         .register(&mut storage, false)?;
//! }
//!
//! // Workers claim trials one at a time.
//! let reserved = Status::custom("reserved", 2);
//! while let Some(trial) = storage
//!     .fetch_and_update_trial(&Query::all().eq("status", "new"), TrialUpdate::status(reserved.clone()))?
//! {
//!     storage.log_trial_start(&trial)?;
//!     storage.log_trial_finish(&trial, None)?;
//! }
//! # Ok::<(), track_store::Error>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod config;
pub mod error;
pub mod experiment;
pub mod logging;
pub mod query;
pub mod storage;

pub use error::{Error, Result};
