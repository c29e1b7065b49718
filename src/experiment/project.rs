//! Project - top-level namespace owning trial groups and trials

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::Fields;

/// Project owns groups and trials by reference (sets of uids).
///
/// The project name is its identity: two projects with the same name are
/// the same project.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Project {
    pub(crate) name: String,
    #[serde(default)]
    pub(crate) description: Option<String>,
    #[serde(default)]
    pub(crate) metadata: Fields,
    #[serde(default)]
    pub(crate) groups: BTreeSet<String>,
    #[serde(default)]
    pub(crate) trials: BTreeSet<String>,
}

impl Project {
    /// Create a project with the given name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            metadata: Fields::new(),
            groups: BTreeSet::new(),
            trials: BTreeSet::new(),
        }
    }

    /// Create a builder for a project with optional fields.
    #[must_use]
    pub fn builder(name: impl Into<String>) -> ProjectBuilder {
        ProjectBuilder::new(name)
    }

    /// Project uid (derived from the name)
    #[must_use]
    pub fn uid(&self) -> &str {
        &self.name
    }

    /// Get the project name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the description, if any.
    #[must_use]
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Open key/value metadata
    #[must_use]
    pub const fn metadata(&self) -> &Fields {
        &self.metadata
    }

    /// Uids of the groups of this project
    #[must_use]
    pub const fn groups(&self) -> &BTreeSet<String> {
        &self.groups
    }

    /// Uids of the trials of this project
    #[must_use]
    pub const fn trials(&self) -> &BTreeSet<String> {
        &self.trials
    }

    /// Fold the on-disk version of this project into the in-memory one.
    ///
    /// Description and metadata are fixed when the project is created, so
    /// local values win and disk only fills in what is missing. Child
    /// references are unioned.
    pub(crate) fn absorb(&mut self, disk: Self) {
        self.groups.extend(disk.groups);
        self.trials.extend(disk.trials);
        for (key, value) in disk.metadata {
            self.metadata.entry(key).or_insert(value);
        }
        if self.description.is_none() {
            self.description = disk.description;
        }
    }
}

/// Builder for `Project`.
#[derive(Debug)]
pub struct ProjectBuilder {
    project: Project,
}

impl ProjectBuilder {
    /// Create a new builder with the required name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            project: Project::new(name),
        }
    }

    /// Set the description.
    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.project.description = Some(description.into());
        self
    }

    /// Add a metadata entry.
    #[must_use]
    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.project.metadata.insert(key.into(), value.into());
        self
    }

    /// Build the `Project`.
    #[must_use]
    pub fn build(self) -> Project {
        self.project
    }
}
