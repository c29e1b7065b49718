//! The storage interface every backend implements

use crate::experiment::{AggregatorKind, Fields, Project, Status, Trial, TrialGroup};
use crate::query::Query;
use crate::Result;

/// Storage interface shared by the file-backed storage, the multiplexer and
/// any remote backend.
///
/// Arguments passed to `get_*` and `log_*` calls only need their identity
/// fields set: a `Trial::with_identity(hash, revision)` is enough to address
/// a stored trial.
///
/// "Nothing matched" is `Ok(None)`; a `log_*` call naming an unknown entity
/// is `Err(NotFound)`.
pub trait Protocol: Send {
    /// Insert a project, or return the stored one with the same name.
    ///
    /// # Errors
    ///
    /// Lock and IO failures.
    fn new_project(&mut self, project: Project) -> Result<Project>;

    /// Stored project with the same uid
    ///
    /// # Errors
    ///
    /// Lock and IO failures.
    fn get_project(&mut self, project: &Project) -> Result<Option<Project>>;

    /// Insert a trial group and link it into its project.
    ///
    /// # Errors
    ///
    /// `IdentityConflict` for duplicates, `MissingParent` in strict mode.
    fn new_trial_group(&mut self, group: TrialGroup) -> Result<TrialGroup>;

    /// Stored group with the same uid
    ///
    /// # Errors
    ///
    /// Lock and IO failures.
    fn get_trial_group(&mut self, group: &TrialGroup) -> Result<Option<TrialGroup>>;

    /// Insert a trial and link it into its project and group.
    ///
    /// If the uid exists, returns `Ok(None)` unless `auto_increment`, in
    /// which case the trial is stored under the next unused revision.
    ///
    /// # Errors
    ///
    /// `MissingParent` in strict mode.
    fn new_trial(&mut self, trial: Trial, auto_increment: bool) -> Result<Option<Trial>>;

    /// Stored trial with the same uid
    ///
    /// # Errors
    ///
    /// Lock and IO failures.
    fn get_trial(&mut self, trial: &Trial) -> Result<Option<Trial>>;

    /// Attach an existing trial to an existing project.
    ///
    /// # Errors
    ///
    /// `NotFound` if either side is unknown.
    fn add_project_trial(&mut self, project: &Project, trial: &Trial) -> Result<()>;

    /// Attach an existing trial to an existing group.
    ///
    /// # Errors
    ///
    /// `NotFound` if either side is unknown.
    fn add_group_trial(&mut self, group: &TrialGroup, trial: &Trial) -> Result<()>;

    /// Stamp `metadata.start_time` and move to `running`.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown trials.
    fn log_trial_start(&mut self, trial: &Trial) -> Result<()>;

    /// Stamp `metadata.end_time`; `completed`, or `exception` with the
    /// failure recorded.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown trials.
    fn log_trial_finish(&mut self, trial: &Trial, failure: Option<&str>) -> Result<()>;

    /// Start timing the block `name`.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown trials.
    fn log_trial_chrono_start(&mut self, trial: &Trial, name: &str, kind: AggregatorKind) -> Result<()>;

    /// Stop timing `name` and record the elapsed seconds. A failed block
    /// records nothing.
    ///
    /// # Errors
    ///
    /// `InvalidInput` if the chrono was never started.
    fn log_trial_chrono_finish(&mut self, trial: &Trial, name: &str, failure: Option<&str>) -> Result<()>;

    /// Merge into the trial parameters.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown trials.
    fn log_trial_arguments(&mut self, trial: &Trial, arguments: Fields) -> Result<()>;

    /// Merge into the trial metadata.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown trials.
    fn log_trial_metadata(&mut self, trial: &Trial, metadata: Fields) -> Result<()>;

    /// Record metric values, at `step` or appended to flat sequences.
    ///
    /// # Errors
    ///
    /// `InvalidInput` when a value does not fit the metric's shape.
    fn log_trial_metrics(&mut self, trial: &Trial, step: Option<i64>, values: Fields) -> Result<()>;

    /// Set the status, recording `error` if given.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown trials.
    fn set_trial_status(&mut self, trial: &Trial, status: Status, error: Option<&str>) -> Result<()>;

    /// Merge into the trial tags.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown trials.
    fn add_trial_tags(&mut self, trial: &Trial, tags: Fields) -> Result<()>;

    /// Merge into the group metadata.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown groups.
    fn set_group_metadata(&mut self, group: &TrialGroup, metadata: Fields) -> Result<()>;

    /// Trials matching `query`, ordered by uid
    ///
    /// # Errors
    ///
    /// `InvalidQuery` for malformed queries.
    fn fetch_trials(&mut self, query: &Query) -> Result<Vec<Trial>>;

    /// Groups matching `query`, ordered by uid
    ///
    /// # Errors
    ///
    /// `InvalidQuery` for malformed queries.
    fn fetch_groups(&mut self, query: &Query) -> Result<Vec<TrialGroup>>;

    /// Projects matching `query`, ordered by uid
    ///
    /// # Errors
    ///
    /// `InvalidQuery` for malformed queries.
    fn fetch_projects(&mut self, query: &Query) -> Result<Vec<Project>>;

    /// Apply `update` to the first trial matching `query`, atomically with
    /// the lookup. Returns the updated trial, or `None` if nothing matched.
    ///
    /// # Errors
    ///
    /// `InvalidQuery`, or the error of the update itself.
    fn fetch_and_update_trial(&mut self, query: &Query, update: TrialUpdate) -> Result<Option<Trial>>;

    /// Group counterpart of [`fetch_and_update_trial`](Self::fetch_and_update_trial).
    ///
    /// # Errors
    ///
    /// `InvalidQuery`, or the error of the update itself.
    fn fetch_and_update_group(&mut self, query: &Query, update: GroupUpdate) -> Result<Option<TrialGroup>>;

    /// Persist pending changes.
    ///
    /// # Errors
    ///
    /// Lock and IO failures.
    fn commit(&mut self) -> Result<()>;
}

/// Trial mutation applied by `fetch_and_update_trial`
#[derive(Debug, Clone, PartialEq)]
pub enum TrialUpdate {
    /// `set_trial_status`
    SetStatus {
        /// New status
        status: Status,
        /// Failure to record
        error: Option<String>,
    },
    /// `log_trial_metadata`
    LogMetadata(Fields),
    /// `add_trial_tags`
    AddTags(Fields),
    /// `log_trial_arguments`
    LogArguments(Fields),
    /// `log_trial_metrics`
    LogMetrics {
        /// Step, or `None` for flat sequences
        step: Option<i64>,
        /// Metric values by name
        values: Fields,
    },
    /// `log_trial_start`
    Start,
    /// `log_trial_finish`
    Finish {
        /// Failure text, if the trial failed
        failure: Option<String>,
    },
}

impl TrialUpdate {
    /// Shorthand for a status change without error
    #[must_use]
    pub const fn status(status: Status) -> Self {
        Self::SetStatus { status, error: None }
    }

    /// Run the matching protocol call on `trial`.
    ///
    /// # Errors
    ///
    /// Whatever the underlying call returns.
    pub fn apply<P: Protocol + ?Sized>(self, protocol: &mut P, trial: &Trial) -> Result<()> {
        match self {
            Self::SetStatus { status, error } => protocol.set_trial_status(trial, status, error.as_deref()),
            Self::LogMetadata(metadata) => protocol.log_trial_metadata(trial, metadata),
            Self::AddTags(tags) => protocol.add_trial_tags(trial, tags),
            Self::LogArguments(arguments) => protocol.log_trial_arguments(trial, arguments),
            Self::LogMetrics { step, values } => protocol.log_trial_metrics(trial, step, values),
            Self::Start => protocol.log_trial_start(trial),
            Self::Finish { failure } => protocol.log_trial_finish(trial, failure.as_deref()),
        }
    }
}

/// Group mutation applied by `fetch_and_update_group`
#[derive(Debug, Clone, PartialEq)]
pub enum GroupUpdate {
    /// `set_group_metadata`
    SetMetadata(Fields),
}

impl GroupUpdate {
    /// Run the matching protocol call on `group`.
    ///
    /// # Errors
    ///
    /// Whatever the underlying call returns.
    pub fn apply<P: Protocol + ?Sized>(self, protocol: &mut P, group: &TrialGroup) -> Result<()> {
        match self {
            Self::SetMetadata(metadata) => protocol.set_group_metadata(group, metadata),
        }
    }
}
