//! Fan-out of storage calls over several backends
//!
//! Backends are called in order with identical arguments. Failures of all
//! but the last backend are logged and swallowed; the last backend's result
//! is the one returned.

use tracing::warn;

use super::protocol::{GroupUpdate, Protocol, TrialUpdate};
use crate::experiment::{AggregatorKind, Fields, Project, Status, Trial, TrialGroup};
use crate::query::Query;
use crate::{Error, Result};

/// Replicates every call over an ordered, non-empty list of backends
pub struct ProtocolMultiplexer {
    backends: Vec<Box<dyn Protocol>>,
}

impl std::fmt::Debug for ProtocolMultiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolMultiplexer")
            .field("backends", &self.backends.len())
            .finish()
    }
}

impl ProtocolMultiplexer {
    /// Build a multiplexer; the last backend is authoritative.
    ///
    /// # Errors
    ///
    /// `InvalidInput` for an empty backend list.
    pub fn new(backends: Vec<Box<dyn Protocol>>) -> Result<Self> {
        if backends.is_empty() {
            return Err(Error::InvalidInput(
                "a multiplexer needs at least one backend".to_string(),
            ));
        }
        Ok(Self { backends })
    }

    /// Number of backends
    #[must_use]
    pub fn len(&self) -> usize {
        self.backends.len()
    }

    /// Never true for a constructed multiplexer
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    fn fan_out<T>(&mut self, op: &str, mut call: impl FnMut(&mut dyn Protocol) -> Result<T>) -> Result<T> {
        let (last, rest) = self
            .backends
            .split_last_mut()
            .ok_or_else(|| Error::InvalidInput("multiplexer has no backend".to_string()))?;
        for (index, backend) in rest.iter_mut().enumerate() {
            if let Err(err) = call(backend.as_mut()) {
                warn!(backend = index, op, error = %err, "non-authoritative backend failed");
            }
        }
        call(last.as_mut())
    }
}

impl Protocol for ProtocolMultiplexer {
    fn new_project(&mut self, project: Project) -> Result<Project> {
        self.fan_out("new_project", |b| b.new_project(project.clone()))
    }

    fn get_project(&mut self, project: &Project) -> Result<Option<Project>> {
        self.fan_out("get_project", |b| b.get_project(project))
    }

    fn new_trial_group(&mut self, group: TrialGroup) -> Result<TrialGroup> {
        self.fan_out("new_trial_group", |b| b.new_trial_group(group.clone()))
    }

    fn get_trial_group(&mut self, group: &TrialGroup) -> Result<Option<TrialGroup>> {
        self.fan_out("get_trial_group", |b| b.get_trial_group(group))
    }

    fn new_trial(&mut self, trial: Trial, auto_increment: bool) -> Result<Option<Trial>> {
        self.fan_out("new_trial", |b| b.new_trial(trial.clone(), auto_increment))
    }

    fn get_trial(&mut self, trial: &Trial) -> Result<Option<Trial>> {
        self.fan_out("get_trial", |b| b.get_trial(trial))
    }

    fn add_project_trial(&mut self, project: &Project, trial: &Trial) -> Result<()> {
        self.fan_out("add_project_trial", |b| b.add_project_trial(project, trial))
    }

    fn add_group_trial(&mut self, group: &TrialGroup, trial: &Trial) -> Result<()> {
        self.fan_out("add_group_trial", |b| b.add_group_trial(group, trial))
    }

    fn log_trial_start(&mut self, trial: &Trial) -> Result<()> {
        self.fan_out("log_trial_start", |b| b.log_trial_start(trial))
    }

    fn log_trial_finish(&mut self, trial: &Trial, failure: Option<&str>) -> Result<()> {
        self.fan_out("log_trial_finish", |b| b.log_trial_finish(trial, failure))
    }

    fn log_trial_chrono_start(&mut self, trial: &Trial, name: &str, kind: AggregatorKind) -> Result<()> {
        self.fan_out("log_trial_chrono_start", |b| b.log_trial_chrono_start(trial, name, kind))
    }

    fn log_trial_chrono_finish(&mut self, trial: &Trial, name: &str, failure: Option<&str>) -> Result<()> {
        self.fan_out("log_trial_chrono_finish", |b| b.log_trial_chrono_finish(trial, name, failure))
    }

    fn log_trial_arguments(&mut self, trial: &Trial, arguments: Fields) -> Result<()> {
        self.fan_out("log_trial_arguments", |b| b.log_trial_arguments(trial, arguments.clone()))
    }

    fn log_trial_metadata(&mut self, trial: &Trial, metadata: Fields) -> Result<()> {
        self.fan_out("log_trial_metadata", |b| b.log_trial_metadata(trial, metadata.clone()))
    }

    fn log_trial_metrics(&mut self, trial: &Trial, step: Option<i64>, values: Fields) -> Result<()> {
        self.fan_out("log_trial_metrics", |b| b.log_trial_metrics(trial, step, values.clone()))
    }

    fn set_trial_status(&mut self, trial: &Trial, status: Status, error: Option<&str>) -> Result<()> {
        self.fan_out("set_trial_status", |b| b.set_trial_status(trial, status.clone(), error))
    }

    fn add_trial_tags(&mut self, trial: &Trial, tags: Fields) -> Result<()> {
        self.fan_out("add_trial_tags", |b| b.add_trial_tags(trial, tags.clone()))
    }

    fn set_group_metadata(&mut self, group: &TrialGroup, metadata: Fields) -> Result<()> {
        self.fan_out("set_group_metadata", |b| b.set_group_metadata(group, metadata.clone()))
    }

    fn fetch_trials(&mut self, query: &Query) -> Result<Vec<Trial>> {
        self.fan_out("fetch_trials", |b| b.fetch_trials(query))
    }

    fn fetch_groups(&mut self, query: &Query) -> Result<Vec<TrialGroup>> {
        self.fan_out("fetch_groups", |b| b.fetch_groups(query))
    }

    fn fetch_projects(&mut self, query: &Query) -> Result<Vec<Project>> {
        self.fan_out("fetch_projects", |b| b.fetch_projects(query))
    }

    fn fetch_and_update_trial(&mut self, query: &Query, update: TrialUpdate) -> Result<Option<Trial>> {
        self.fan_out("fetch_and_update_trial", |b| b.fetch_and_update_trial(query, update.clone()))
    }

    fn fetch_and_update_group(&mut self, query: &Query, update: GroupUpdate) -> Result<Option<TrialGroup>> {
        self.fan_out("fetch_and_update_group", |b| b.fetch_and_update_group(query, update.clone()))
    }

    fn commit(&mut self) -> Result<()> {
        self.fan_out("commit", |b| b.commit())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageOptions;
    use crate::storage::FileStorage;
    use tempfile::tempdir;

    /// Backend that fails every call
    struct Broken;

    impl Protocol for Broken {
        fn new_project(&mut self, _: Project) -> Result<Project> {
            Err(Error::InvalidInput("down".into()))
        }
        fn get_project(&mut self, _: &Project) -> Result<Option<Project>> {
            Err(Error::InvalidInput("down".into()))
        }
        fn new_trial_group(&mut self, _: TrialGroup) -> Result<TrialGroup> {
            Err(Error::InvalidInput("down".into()))
        }
        fn get_trial_group(&mut self, _: &TrialGroup) -> Result<Option<TrialGroup>> {
            Err(Error::InvalidInput("down".into()))
        }
        fn new_trial(&mut self, _: Trial, _: bool) -> Result<Option<Trial>> {
            Err(Error::InvalidInput("down".into()))
        }
        fn get_trial(&mut self, _: &Trial) -> Result<Option<Trial>> {
            Err(Error::InvalidInput("down".into()))
        }
        fn add_project_trial(&mut self, _: &Project, _: &Trial) -> Result<()> {
            Err(Error::InvalidInput("down".into()))
        }
        fn add_group_trial(&mut self, _: &TrialGroup, _: &Trial) -> Result<()> {
            Err(Error::InvalidInput("down".into()))
        }
        fn log_trial_start(&mut self, _: &Trial) -> Result<()> {
            Err(Error::InvalidInput("down".into()))
        }
        fn log_trial_finish(&mut self, _: &Trial, _: Option<&str>) -> Result<()> {
            Err(Error::InvalidInput("down".into()))
        }
        fn log_trial_chrono_start(&mut self, _: &Trial, _: &str, _: AggregatorKind) -> Result<()> {
            Err(Error::InvalidInput("down".into()))
        }
        fn log_trial_chrono_finish(&mut self, _: &Trial, _: &str, _: Option<&str>) -> Result<()> {
            Err(Error::InvalidInput("down".into()))
        }
        fn log_trial_arguments(&mut self, _: &Trial, _: Fields) -> Result<()> {
            Err(Error::InvalidInput("down".into()))
        }
        fn log_trial_metadata(&mut self, _: &Trial, _: Fields) -> Result<()> {
            Err(Error::InvalidInput("down".into()))
        }
        fn log_trial_metrics(&mut self, _: &Trial, _: Option<i64>, _: Fields) -> Result<()> {
            Err(Error::InvalidInput("down".into()))
        }
        fn set_trial_status(&mut self, _: &Trial, _: Status, _: Option<&str>) -> Result<()> {
            Err(Error::InvalidInput("down".into()))
        }
        fn add_trial_tags(&mut self, _: &Trial, _: Fields) -> Result<()> {
            Err(Error::InvalidInput("down".into()))
        }
        fn set_group_metadata(&mut self, _: &TrialGroup, _: Fields) -> Result<()> {
            Err(Error::InvalidInput("down".into()))
        }
        fn fetch_trials(&mut self, _: &Query) -> Result<Vec<Trial>> {
            Err(Error::InvalidInput("down".into()))
        }
        fn fetch_groups(&mut self, _: &Query) -> Result<Vec<TrialGroup>> {
            Err(Error::InvalidInput("down".into()))
        }
        fn fetch_projects(&mut self, _: &Query) -> Result<Vec<Project>> {
            Err(Error::InvalidInput("down".into()))
        }
        fn fetch_and_update_trial(&mut self, _: &Query, _: TrialUpdate) -> Result<Option<Trial>> {
            Err(Error::InvalidInput("down".into()))
        }
        fn fetch_and_update_group(&mut self, _: &Query, _: GroupUpdate) -> Result<Option<TrialGroup>> {
            Err(Error::InvalidInput("down".into()))
        }
        fn commit(&mut self) -> Result<()> {
            Err(Error::InvalidInput("down".into()))
        }
    }

    fn file_backend(dir: &std::path::Path, name: &str) -> Box<dyn Protocol> {
        let options = StorageOptions::new(dir.join(name)).signal_handlers(false);
        Box::new(FileStorage::open(options).unwrap())
    }

    #[test]
    fn test_empty_multiplexer_rejected() {
        assert!(ProtocolMultiplexer::new(Vec::new()).is_err());
    }

    #[test]
    fn test_non_last_failures_are_swallowed() {
        let dir = tempdir().unwrap();
        let broken: Box<dyn Protocol> = Box::new(Broken);
        let mut mux = ProtocolMultiplexer::new(vec![broken, file_backend(dir.path(), "a.json")]).unwrap();
        let project = mux.new_project(Project::new("p")).unwrap();
        assert_eq!(project.name(), "p");
    }

    #[test]
    fn test_last_failure_is_returned() {
        let dir = tempdir().unwrap();
        let mut mux =
            ProtocolMultiplexer::new(vec![file_backend(dir.path(), "a.json"), Box::new(Broken)]).unwrap();
        assert!(mux.new_project(Project::new("p")).is_err());
    }

    #[test]
    fn test_every_backend_receives_the_call() {
        let dir = tempdir().unwrap();
        let mut mux = ProtocolMultiplexer::new(vec![
            file_backend(dir.path(), "a.json"),
            file_backend(dir.path(), "b.json"),
        ])
        .unwrap();
        mux.new_project(Project::new("p")).unwrap();

        for name in ["a.json", "b.json"] {
            let mut backend = file_backend(dir.path(), name);
            assert!(backend.get_project(&Project::new("p")).unwrap().is_some());
        }
    }
}
