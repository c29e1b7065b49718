//! Trial Group - named namespace of trials inside a project

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{compute_hash, Fields};

/// A named set of trials belonging to exactly one project.
///
/// The uid is `hash(name, project_id)`, so the same pair always yields the
/// same group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrialGroup {
    pub(crate) uid: String,
    pub(crate) name: String,
    #[serde(default)]
    pub(crate) description: Option<String>,
    #[serde(default)]
    pub(crate) metadata: Fields,
    #[serde(default)]
    pub(crate) trials: BTreeSet<String>,
    pub(crate) project_id: String,
    #[serde(default, rename = "_update_count")]
    pub(crate) update_count: u64,
}

impl TrialGroup {
    /// Create a group inside the project identified by `project_id`.
    #[must_use]
    pub fn new(name: impl Into<String>, project_id: impl Into<String>) -> Self {
        let name = name.into();
        let project_id = project_id.into();
        Self {
            uid: Self::compute_uid(&name, &project_id),
            name,
            description: None,
            metadata: Fields::new(),
            trials: BTreeSet::new(),
            project_id,
            update_count: 0,
        }
    }

    /// Create a builder for a group with optional fields.
    #[must_use]
    pub fn builder(name: impl Into<String>, project_id: impl Into<String>) -> TrialGroupBuilder {
        TrialGroupBuilder {
            group: Self::new(name, project_id),
        }
    }

    /// Deterministic uid of a `(name, project)` pair
    #[must_use]
    pub fn compute_uid(name: &str, project_id: &str) -> String {
        compute_hash(
            &[Value::from(name), Value::from(project_id)],
            &Fields::new(),
        )
    }

    /// Group uid
    #[must_use]
    pub fn uid(&self) -> &str {
        &self.uid
    }

    /// Group name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Description, if any
    #[must_use]
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Open key/value metadata
    #[must_use]
    pub const fn metadata(&self) -> &Fields {
        &self.metadata
    }

    /// Uids of the trials in this group
    #[must_use]
    pub const fn trials(&self) -> &BTreeSet<String> {
        &self.trials
    }

    /// Owning project uid
    #[must_use]
    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    /// Number of committed mutations (metadata changes and trial links)
    #[must_use]
    pub const fn update_count(&self) -> u64 {
        self.update_count
    }

    pub(crate) fn touch(&mut self) {
        self.update_count += 1;
    }

    /// Fold the on-disk version of this group into the in-memory one.
    ///
    /// Trial references are always unioned. Metadata and description only
    /// come from disk when its update counter is strictly greater, so
    /// uncommitted local changes survive a reload.
    pub(crate) fn absorb(&mut self, disk: Self) {
        self.trials.extend(disk.trials);
        if disk.update_count <= self.update_count {
            return;
        }
        self.update_count = disk.update_count;
        self.metadata.extend(disk.metadata);
        if disk.description.is_some() {
            self.description = disk.description;
        }
    }
}

/// Builder for `TrialGroup`.
#[derive(Debug)]
pub struct TrialGroupBuilder {
    group: TrialGroup,
}

impl TrialGroupBuilder {
    /// Set the description.
    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.group.description = Some(description.into());
        self
    }

    /// Add a metadata entry.
    #[must_use]
    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.group.metadata.insert(key.into(), value.into());
        self
    }

    /// Build the `TrialGroup`.
    #[must_use]
    pub fn build(self) -> TrialGroup {
        self.group
    }
}
