//! Trial - a single training run, content-addressed by its configuration

use std::collections::BTreeMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{compute_hash, Aggregator, Fields, MetricSeries, Status};
use crate::storage::Protocol;
use crate::{Error, Result};

/// Metadata key holding the optimistic-concurrency version of a trial
pub const UPDATE_COUNT_KEY: &str = "_update_count";

/// Metadata key holding the unix time (seconds) of the last mutation
pub const LAST_CHANGE_KEY: &str = "_last_change";

/// A single training run.
///
/// The uid is `"{hash}_{revision}"` where `hash = hash(name, version,
/// **parameters)`. Re-running an identical configuration produces a new
/// revision instead of overwriting the previous run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "TrialRecord", try_from = "TrialRecord")]
pub struct Trial {
    pub(crate) hash: String,
    pub(crate) revision: u32,
    pub(crate) name: Option<String>,
    pub(crate) description: Option<String>,
    pub(crate) tags: Fields,
    pub(crate) version: Option<String>,
    pub(crate) group_id: Option<String>,
    pub(crate) project_id: Option<String>,
    pub(crate) parameters: Fields,
    pub(crate) metadata: Fields,
    pub(crate) metrics: BTreeMap<String, MetricSeries>,
    pub(crate) chronos: BTreeMap<String, Aggregator>,
    pub(crate) status: Status,
    pub(crate) errors: Vec<String>,
}

impl Trial {
    /// Start building a trial; the hash is computed on `finalize()`.
    #[must_use]
    pub fn builder() -> PendingTrial {
        PendingTrial::default()
    }

    /// A trial carrying only its identity, enough for `get_trial` and the
    /// `log_*` calls.
    #[must_use]
    pub fn with_identity(hash: impl Into<String>, revision: u32) -> Self {
        Self {
            hash: hash.into(),
            revision,
            name: None,
            description: None,
            tags: Fields::new(),
            version: None,
            group_id: None,
            project_id: None,
            parameters: Fields::new(),
            metadata: Fields::new(),
            metrics: BTreeMap::new(),
            chronos: BTreeMap::new(),
            status: Status::default(),
            errors: Vec::new(),
        }
    }

    /// Identity-only trial from a `"{hash}_{revision}"` uid.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if the uid has no numeric revision suffix.
    pub fn from_uid(uid: &str) -> Result<Self> {
        let (hash, revision) = split_uid(uid).map_err(Error::InvalidInput)?;
        Ok(Self::with_identity(hash, revision))
    }

    /// `"{hash}_{revision}"`
    #[must_use]
    pub fn uid(&self) -> String {
        make_uid(&self.hash, self.revision)
    }

    /// Content hash of `(name, version, parameters)` at creation time
    #[must_use]
    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// Revision disambiguating re-runs of the same configuration
    #[must_use]
    pub const fn revision(&self) -> u32 {
        self.revision
    }

    /// Trial name
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Description
    #[must_use]
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Tags
    #[must_use]
    pub const fn tags(&self) -> &Fields {
        &self.tags
    }

    /// Code / version fingerprint
    #[must_use]
    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    /// Owning group uid
    #[must_use]
    pub fn group_id(&self) -> Option<&str> {
        self.group_id.as_deref()
    }

    /// Owning project uid
    #[must_use]
    pub fn project_id(&self) -> Option<&str> {
        self.project_id.as_deref()
    }

    /// Input configuration
    #[must_use]
    pub const fn parameters(&self) -> &Fields {
        &self.parameters
    }

    /// Open bag of run facts, including `_update_count` / `_last_change`
    #[must_use]
    pub const fn metadata(&self) -> &Fields {
        &self.metadata
    }

    /// Named metrics
    #[must_use]
    pub const fn metrics(&self) -> &BTreeMap<String, MetricSeries> {
        &self.metrics
    }

    /// Named elapsed-time aggregators
    #[must_use]
    pub const fn chronos(&self) -> &BTreeMap<String, Aggregator> {
        &self.chronos
    }

    /// Current status
    #[must_use]
    pub const fn status(&self) -> &Status {
        &self.status
    }

    /// Recorded failures
    #[must_use]
    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    /// Number of mutations applied through the storage protocol
    #[must_use]
    pub fn update_count(&self) -> u64 {
        self.version_counter().unwrap_or(0)
    }

    /// Unix time (seconds) of the last mutation, if any
    #[must_use]
    pub fn last_change(&self) -> Option<f64> {
        self.metadata.get(LAST_CHANGE_KEY).and_then(Value::as_f64)
    }

    /// Version counter; a missing counter is version 0, a malformed one
    /// cannot be ordered.
    fn version_counter(&self) -> std::result::Result<u64, String> {
        match self.metadata.get(UPDATE_COUNT_KEY) {
            None => Ok(0),
            Some(value) => value
                .as_u64()
                .ok_or_else(|| format!("{UPDATE_COUNT_KEY} is not a counter: {value}")),
        }
    }

    /// Bump the version counter and stamp the change time.
    pub(crate) fn touch(&mut self) {
        let next = self.update_count() + 1;
        self.metadata.insert(UPDATE_COUNT_KEY.to_string(), Value::from(next));
        self.metadata.insert(LAST_CHANGE_KEY.to_string(), Value::from(now_seconds()));
    }

    /// Make sure a freshly inserted trial carries a version counter.
    pub(crate) fn init_counter(&mut self) {
        self.metadata
            .entry(UPDATE_COUNT_KEY.to_string())
            .or_insert_with(|| Value::from(0_u64));
    }

    /// Fold the on-disk version of this trial into the in-memory one.
    ///
    /// The disk version only applies when its counter is strictly greater.
    /// Status and scalar fields are replaced; parameters, tags, metadata,
    /// metrics and chronos are merged per key so observations recorded on
    /// either side survive.
    ///
    /// Returns whether anything was applied.
    ///
    /// # Errors
    ///
    /// `MergeConflict` when either counter is malformed.
    pub(crate) fn absorb(&mut self, disk: Self) -> Result<bool> {
        let conflict = |reason: String| Error::MergeConflict {
            uid: self.uid(),
            reason,
        };
        let mine = self.version_counter().map_err(&conflict)?;
        let theirs = disk.version_counter().map_err(&conflict)?;
        if theirs <= mine {
            return Ok(false);
        }

        self.name = disk.name;
        self.description = disk.description;
        self.version = disk.version;
        self.group_id = disk.group_id;
        self.project_id = disk.project_id;
        self.status = disk.status;
        self.tags.extend(disk.tags);
        self.parameters.extend(disk.parameters);
        self.metadata.extend(disk.metadata);

        for (key, series) in disk.metrics {
            let merged = match self.metrics.remove(&key) {
                Some(local) => local.merged(series),
                None => series,
            };
            self.metrics.insert(key, merged);
        }
        for (key, chrono) in disk.chronos {
            let merged = match self.chronos.remove(&key) {
                Some(local) => local.merged(chrono),
                None => chrono,
            };
            self.chronos.insert(key, merged);
        }

        let local_errors = std::mem::replace(&mut self.errors, disk.errors);
        for err in local_errors {
            if !self.errors.contains(&err) {
                self.errors.push(err);
            }
        }
        Ok(true)
    }
}

pub(crate) fn make_uid(hash: &str, revision: u32) -> String {
    format!("{hash}_{revision}")
}

pub(crate) fn split_uid(uid: &str) -> std::result::Result<(String, u32), String> {
    let (hash, revision) = uid
        .rsplit_once('_')
        .ok_or_else(|| format!("trial uid `{uid}` has no revision"))?;
    let revision = revision
        .parse()
        .map_err(|_| format!("trial uid `{uid}` has a non numeric revision"))?;
    Ok((hash.to_string(), revision))
}

/// Wall-clock seconds since the epoch, with microsecond precision
#[allow(clippy::cast_precision_loss)]
pub(crate) fn now_seconds() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1e6
}

/// Persisted shape of a trial: identity flattened into one `uid` string.
#[derive(Serialize, Deserialize)]
struct TrialRecord {
    uid: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    tags: Fields,
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    group_id: Option<String>,
    #[serde(default)]
    project_id: Option<String>,
    #[serde(default)]
    parameters: Fields,
    #[serde(default)]
    metadata: Fields,
    #[serde(default)]
    metrics: BTreeMap<String, MetricSeries>,
    #[serde(default)]
    chronos: BTreeMap<String, Aggregator>,
    #[serde(default)]
    status: Status,
    #[serde(default)]
    errors: Vec<String>,
}

impl From<Trial> for TrialRecord {
    fn from(trial: Trial) -> Self {
        Self {
            uid: trial.uid(),
            name: trial.name,
            description: trial.description,
            tags: trial.tags,
            version: trial.version,
            group_id: trial.group_id,
            project_id: trial.project_id,
            parameters: trial.parameters,
            metadata: trial.metadata,
            metrics: trial.metrics,
            chronos: trial.chronos,
            status: trial.status,
            errors: trial.errors,
        }
    }
}

impl TryFrom<TrialRecord> for Trial {
    type Error = String;

    fn try_from(record: TrialRecord) -> std::result::Result<Self, Self::Error> {
        let (hash, revision) = split_uid(&record.uid)?;
        Ok(Self {
            hash,
            revision,
            name: record.name,
            description: record.description,
            tags: record.tags,
            version: record.version,
            group_id: record.group_id,
            project_id: record.project_id,
            parameters: record.parameters,
            metadata: record.metadata,
            metrics: record.metrics,
            chronos: record.chronos,
            status: record.status,
            errors: record.errors,
        })
    }
}

/// A trial that is still accumulating its configuration.
///
/// Nothing is hashed until [`finalize`](Self::finalize), so parameters can be
/// added in any order once they become known.
///
/// ```rust
/// use track_store::experiment::Trial;
/// use serde_json::json;
///
/// let trial = Trial::builder()
///     .name("resnet")
///     .parameter("lr", json!(0.01))
///     .parameter("batch", json!(256))
///     .finalize();
/// assert_eq!(trial.uid(), format!("{}_0", trial.hash()));
/// ```
#[derive(Debug, Clone, Default)]
pub struct PendingTrial {
    name: Option<String>,
    description: Option<String>,
    version: Option<String>,
    project_id: Option<String>,
    group_id: Option<String>,
    revision: u32,
    tags: Fields,
    parameters: Fields,
    metadata: Fields,
    status: Status,
}

impl PendingTrial {
    /// Set the trial name (part of the identity hash).
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the description.
    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Set the code version (part of the identity hash).
    #[must_use]
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Attach to a project.
    #[must_use]
    pub fn project(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    /// Attach to a group.
    #[must_use]
    pub fn group(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    /// Request an explicit revision (defaults to 0).
    #[must_use]
    pub const fn revision(mut self, revision: u32) -> Self {
        self.revision = revision;
        self
    }

    /// Add one parameter (part of the identity hash).
    #[must_use]
    pub fn parameter(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    /// Add several parameters.
    #[must_use]
    pub fn parameters(mut self, parameters: Fields) -> Self {
        self.parameters.extend(parameters);
        self
    }

    /// Add a tag.
    #[must_use]
    pub fn tag(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Add a metadata entry.
    #[must_use]
    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Initial status (defaults to `new`).
    #[must_use]
    pub fn status(mut self, status: Status) -> Self {
        self.status = status;
        self
    }

    /// Compute the identity hash and produce the trial.
    #[must_use]
    pub fn finalize(self) -> Trial {
        let hash = compute_hash(
            &[Value::from(self.name.clone()), Value::from(self.version.clone())],
            &self.parameters,
        );
        Trial {
            hash,
            revision: self.revision,
            name: self.name,
            description: self.description,
            tags: self.tags,
            version: self.version,
            group_id: self.group_id,
            project_id: self.project_id,
            parameters: self.parameters,
            metadata: self.metadata,
            metrics: BTreeMap::new(),
            chronos: BTreeMap::new(),
            status: self.status,
            errors: Vec::new(),
        }
    }

    /// Finalize and insert the trial through a storage protocol.
    ///
    /// # Errors
    ///
    /// Propagates storage errors (missing parent in strict mode, lock
    /// timeout, IO).
    pub fn register<P: Protocol + ?Sized>(
        self,
        protocol: &mut P,
        auto_increment: bool,
    ) -> Result<Option<Trial>> {
        protocol.new_trial(self.finalize(), auto_increment)
    }
}
