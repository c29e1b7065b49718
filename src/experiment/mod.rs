//! Experiment entity model
//!
//! ## Schema Overview
//!
//! ```text
//! Project (1) ──< TrialGroup (N)
//!    │                 │
//!    └────────< Trial (N) >┘   [referenced by uid, never embedded in memory]
//! ```
//!
//! Identity is content-derived:
//!
//! - `Project`: its name
//! - `TrialGroup`: `hash(name, project_id)`
//! - `Trial`: `"{hash}_{revision}"` with `hash = hash(name, version, **parameters)`
//!
//! ## Usage
//!
//! ```rust
//! use track_store::experiment::{Project, Status, Trial, TrialGroup};
//!
//! let project = Project::new("mnist");
//! let group = TrialGroup::new("lr-sweep", project.uid());
//!
//! let trial = Trial::builder()
//!     .name("resnet18")
//!     .project(project.uid())
//!     .group(group.uid())
//!     .parameter("lr", 0.01)
//!     .finalize();
//!
//! assert_eq!(trial.revision(), 0);
//! assert_eq!(trial.status(), &Status::CreatedGroup);
//! ```

mod aggregator;
mod hash;
mod metric;
mod project;
mod record;
mod status;
mod trial;
mod trial_group;

use std::collections::BTreeMap;

/// Open key/value bag used for parameters, metadata and tags
pub type Fields = BTreeMap<String, serde_json::Value>;

pub use aggregator::{Aggregator, AggregatorKind, StatAggregator};
pub use hash::{compute_hash, ContentHasher};
pub use metric::MetricSeries;
pub use project::{Project, ProjectBuilder};
pub use record::{ProjectRecord, Record};
pub use status::{Status, ERROR_GROUP, FINISHED_GROUP, RUNNING_GROUP};
pub use trial::{PendingTrial, Trial, LAST_CHANGE_KEY, UPDATE_COUNT_KEY};
pub use trial_group::{TrialGroup, TrialGroupBuilder};

pub(crate) use trial::now_seconds;
