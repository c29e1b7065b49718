//! On-disk document records
//!
//! The database file is a JSON array of `dtype`-tagged records. A project
//! record embeds its groups and trials inline so the file reads top-down;
//! the loader flattens everything back into uid-addressable entities.

use serde::{Deserialize, Serialize};

use super::{Fields, Project, Trial, TrialGroup};
use crate::error::EntityKind;

/// One entry of the persisted document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "dtype", rename_all = "snake_case")]
pub enum Record {
    /// Project with its groups and trials embedded
    Project(ProjectRecord),
    /// Trial group (nested, or top-level when orphaned)
    TrialGroup(TrialGroup),
    /// Trial (nested, or top-level when orphaned)
    Trial(Trial),
}

impl Record {
    /// Entity kind of this record
    #[must_use]
    pub const fn kind(&self) -> EntityKind {
        match self {
            Self::Project(_) => EntityKind::Project,
            Self::TrialGroup(_) => EntityKind::TrialGroup,
            Self::Trial(_) => EntityKind::Trial,
        }
    }

    /// Uid of the entity held by this record
    #[must_use]
    pub fn uid(&self) -> String {
        match self {
            Self::Project(project) => project.name.clone(),
            Self::TrialGroup(group) => group.uid().to_string(),
            Self::Trial(trial) => trial.uid(),
        }
    }
}

/// Project as persisted: children are embedded records instead of uids
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectRecord {
    name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    #[serde(default)]
    metadata: Fields,
    #[serde(default)]
    groups: Vec<Record>,
    #[serde(default)]
    trials: Vec<Record>,
}

impl ProjectRecord {
    /// Embed the resolved children of `project`.
    #[must_use]
    pub fn embed(project: &Project, groups: Vec<TrialGroup>, trials: Vec<Trial>) -> Self {
        Self {
            name: project.name.clone(),
            description: project.description.clone(),
            metadata: project.metadata.clone(),
            groups: groups.into_iter().map(Record::TrialGroup).collect(),
            trials: trials.into_iter().map(Record::Trial).collect(),
        }
    }

    /// Split into the project (children as uids) and its nested records.
    #[must_use]
    pub fn into_parts(self) -> (Project, Vec<Record>) {
        let mut project = Project::new(self.name);
        project.description = self.description;
        project.metadata = self.metadata;

        let children: Vec<Record> = self.groups.into_iter().chain(self.trials).collect();
        for child in &children {
            match child {
                Record::TrialGroup(group) => {
                    project.groups.insert(group.uid().to_string());
                }
                Record::Trial(trial) => {
                    project.trials.insert(trial.uid());
                }
                Record::Project(_) => {}
            }
        }
        (project, children)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_project_embeds_children_with_dtype() {
        let project = Project::new("mnist");
        let group = TrialGroup::new("sweep", "mnist");
        let trial = Trial::builder().name("t").project("mnist").finalize();

        let record = Record::Project(ProjectRecord::embed(
            &project,
            vec![group.clone()],
            vec![trial.clone()],
        ));
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["dtype"], "project");
        assert_eq!(json["groups"][0]["dtype"], "trial_group");
        assert_eq!(json["trials"][0]["dtype"], "trial");
        assert_eq!(json["trials"][0]["uid"], json!(trial.uid()));

        let back: Record = serde_json::from_value(json).unwrap();
        let Record::Project(back) = back else {
            panic!("expected a project record");
        };
        let (project, children) = back.into_parts();
        assert!(project.groups().contains(group.uid()));
        assert!(project.trials().contains(&trial.uid()));
        assert_eq!(children.len(), 2);
    }

    #[test]
    fn test_record_uid_and_kind() {
        let trial = Trial::builder().name("t").revision(1).finalize();
        let record = Record::Trial(trial.clone());
        assert_eq!(record.kind(), EntityKind::Trial);
        assert_eq!(record.uid(), trial.uid());
    }
}
