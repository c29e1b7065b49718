//! File-locked storage protocol
//!
//! Every public call runs inside [`FileStorage::guarded`]. In eager mode the
//! outermost guard takes the lock, reloads what other processes committed,
//! runs the body, commits if the body changed anything, and releases the
//! lock. Nested guarded calls share that single reload and commit, which
//! is what makes `fetch_and_update_*` atomic across processes.
//!
//! If the body fails, nothing is committed and the in-memory state is
//! rebuilt from disk before the lock is released.

use std::time::Instant;

use rustc_hash::FxHashMap;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use super::local::{Entity, LocalStorage};
use super::lock::{publish_while_held, FileLock};
use super::protocol::{GroupUpdate, Protocol, TrialUpdate};
use crate::config::StorageOptions;
use crate::error::EntityKind;
use crate::experiment::{
    now_seconds, Aggregator, AggregatorKind, Fields, MetricSeries, Project, Status, Trial, TrialGroup,
};
use crate::query::Query;
use crate::{Error, Result};

/// Metadata key stamped by `log_trial_start`
pub const START_TIME_KEY: &str = "start_time";
/// Metadata key stamped by `log_trial_finish`
pub const END_TIME_KEY: &str = "end_time";

/// Multi-process safe storage over one JSON file
#[derive(Debug)]
pub struct FileStorage {
    options: StorageOptions,
    local: LocalStorage,
    depth: usize,
    lock: Option<FileLock>,
    dirty: bool,
    chronos: FxHashMap<(String, String), (Instant, AggregatorKind)>,
}

impl FileStorage {
    /// Open the storage described by `options`, loading the current file.
    ///
    /// # Errors
    ///
    /// Lock, IO and JSON failures while loading.
    pub fn open(options: StorageOptions) -> Result<Self> {
        #[cfg(feature = "tokio")]
        if options.installs_signal_handlers() {
            super::signals::install_signal_handlers()?;
        }

        let mut storage = Self {
            options,
            local: LocalStorage::new(),
            depth: 0,
            lock: None,
            dirty: false,
            chronos: FxHashMap::default(),
        };
        if storage.options.is_eager() {
            storage.guarded(|_| Ok(()))?;
        } else {
            storage.local = LocalStorage::load(storage.options.path())?;
        }
        info!(
            path = %storage.options.path().display(),
            strict = storage.options.is_strict(),
            eager = storage.options.is_eager(),
            entities = storage.local.len(),
            "opened storage"
        );
        Ok(storage)
    }

    /// Open from a `file://` URI.
    ///
    /// # Errors
    ///
    /// `Config` for malformed URIs, otherwise see [`open`](Self::open).
    pub fn open_uri(uri: &str) -> Result<Self> {
        Self::open(StorageOptions::from_uri(uri)?)
    }

    /// Options this storage was opened with
    #[must_use]
    pub const fn options(&self) -> &StorageOptions {
        &self.options
    }

    /// In-memory view (as of the last reload)
    #[must_use]
    pub const fn local(&self) -> &LocalStorage {
        &self.local
    }

    /// Run `body` under the lock / reload / commit discipline.
    ///
    /// Only the outermost call locks, reloads and commits. Without eager
    /// mode the body runs directly.
    ///
    /// # Errors
    ///
    /// `ConcurrencyTimeout`, reload or commit failures, or the body's error.
    pub fn guarded<T>(&mut self, body: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        if !self.options.is_eager() {
            return body(self);
        }

        if self.depth == 0 {
            let lock = FileLock::acquire(
                &self.options.lock_path(),
                self.options.get_lock_timeout(),
                self.options.get_poll_interval(),
            )?;
            self.lock = Some(lock);
            self.dirty = false;
            if let Err(err) = self.local.reload(self.options.path()) {
                self.lock = None;
                return Err(err);
            }
        }

        self.depth += 1;
        let result = {
            let mut scope = Scope { storage: self };
            body(&mut *scope.storage)
        };
        if self.depth > 0 {
            return result;
        }

        let dirty = std::mem::take(&mut self.dirty);
        let result = match result {
            Ok(value) if dirty => {
                publish_while_held(|| self.local.commit(self.options.path())).map(|()| value)
            }
            other => other,
        };
        if result.is_err() && dirty {
            self.discard_pending();
        }
        self.lock = None;
        result
    }

    /// Drop uncommitted in-memory changes by re-reading the file.
    fn discard_pending(&mut self) {
        match LocalStorage::load(self.options.path()) {
            Ok(fresh) => {
                debug!(path = %self.options.path().display(), "discarded uncommitted changes");
                self.local = fresh;
            }
            Err(err) => error!(
                path = %self.options.path().display(),
                error = %err,
                "could not reload after a failed operation"
            ),
        }
    }

    /// Run `body` on the live copy of `trial`, then bump its update counter.
    fn update_trial<T>(&mut self, trial: &Trial, body: impl FnOnce(&mut Trial) -> Result<T>) -> Result<T> {
        let uid = trial.uid();
        self.guarded(|storage| {
            let live = storage.local.trial_mut(&uid).ok_or_else(|| Error::NotFound {
                kind: EntityKind::Trial,
                uid: uid.clone(),
            })?;
            storage.dirty = true;
            let value = body(live)?;
            live.touch();
            Ok(value)
        })
    }

    fn update_group(&mut self, group: &TrialGroup, body: impl FnOnce(&mut TrialGroup)) -> Result<()> {
        let uid = group.uid().to_string();
        self.guarded(|storage| {
            let live = storage.local.group_mut(&uid).ok_or_else(|| Error::NotFound {
                kind: EntityKind::TrialGroup,
                uid: uid.clone(),
            })?;
            body(live);
            live.touch();
            storage.dirty = true;
            Ok(())
        })
    }

    /// Known revisions of a trial content hash
    ///
    /// # Errors
    ///
    /// Lock and IO failures.
    pub fn get_trial_revisions(&mut self, hash: &str) -> Result<Vec<u32>> {
        self.guarded(|storage| Ok(storage.local.revisions(hash)))
    }

    /// Run an arbitrary sequence of storage calls on the first trial
    /// matching `query`, inside one critical section.
    ///
    /// ```rust,no_run
    /// use track_store::experiment::Status;
    /// use track_store::query::Query;
    /// use track_store::storage::{FileStorage, Protocol};
    /// use track_store::config::StorageOptions;
    ///
    /// let mut storage = FileStorage::open(StorageOptions::new("db.json"))?;
    /// let claimed = storage.fetch_and_update_trial_with(
    ///     &Query::all().eq("status", "new"),
    ///     |storage, trial| {
    ///         storage.set_trial_status(trial, Status::custom("reserved", 2), None)?;
    ///         storage.log_trial_metadata(trial, serde_json::from_value(serde_json::json!({"worker": 7}))?)
    ///     },
    /// )?;
    /// # Ok::<(), track_store::Error>(())
    /// ```
    ///
    /// # Errors
    ///
    /// `InvalidQuery`, or the first error returned by `update` (in which
    /// case nothing is committed).
    pub fn fetch_and_update_trial_with(
        &mut self,
        query: &Query,
        update: impl FnOnce(&mut Self, &Trial) -> Result<()>,
    ) -> Result<Option<Trial>> {
        self.guarded(|storage| {
            let strict = storage.options.is_strict();
            let Some(target) = storage.local.fetch_trials(query, strict)?.first().map(|t| (*t).clone()) else {
                return Ok(None);
            };
            update(storage, &target)?;
            Ok(storage.local.trial(&target.uid()).cloned())
        })
    }

    fn check_parent(&self, kind: EntityKind, uid: &str, parent_kind: EntityKind, parent: Option<&str>) -> Result<()> {
        let exists = match (parent_kind, parent) {
            (_, None) => false,
            (EntityKind::Project, Some(id)) => self.local.project(id).is_some(),
            (EntityKind::TrialGroup, Some(id)) => self.local.group(id).is_some(),
            (EntityKind::Trial, Some(id)) => self.local.trial(id).is_some(),
        };
        if exists {
            return Ok(());
        }
        let parent = format!("{parent_kind} {}", parent.unwrap_or("<unset>"));
        if self.options.is_strict() {
            return Err(Error::MissingParent {
                kind,
                uid: uid.to_string(),
                parent,
            });
        }
        warn!(%kind, %uid, %parent, "tolerating missing parent");
        Ok(())
    }
}

impl Protocol for FileStorage {
    fn new_project(&mut self, project: Project) -> Result<Project> {
        self.guarded(|storage| {
            if let Some(existing) = storage.local.project(project.uid()) {
                debug!(project = project.uid(), "project exists");
                return Ok(existing.clone());
            }
            storage.local.insert(Entity::Project(project.clone()))?;
            storage.dirty = true;
            Ok(project)
        })
    }

    fn get_project(&mut self, project: &Project) -> Result<Option<Project>> {
        self.guarded(|storage| Ok(storage.local.project(project.uid()).cloned()))
    }

    fn new_trial_group(&mut self, group: TrialGroup) -> Result<TrialGroup> {
        self.guarded(|storage| {
            if storage.local.group(group.uid()).is_some() {
                return Err(Error::IdentityConflict {
                    kind: EntityKind::TrialGroup,
                    uid: group.uid().to_string(),
                });
            }
            storage.check_parent(
                EntityKind::TrialGroup,
                group.uid(),
                EntityKind::Project,
                Some(group.project_id()),
            )?;
            storage.local.insert(Entity::TrialGroup(group.clone()))?;
            if let Some(project) = storage.local.project_mut(group.project_id()) {
                project.groups.insert(group.uid().to_string());
            }
            storage.dirty = true;
            Ok(group)
        })
    }

    fn get_trial_group(&mut self, group: &TrialGroup) -> Result<Option<TrialGroup>> {
        self.guarded(|storage| Ok(storage.local.group(group.uid()).cloned()))
    }

    fn new_trial(&mut self, mut trial: Trial, auto_increment: bool) -> Result<Option<Trial>> {
        self.guarded(|storage| {
            let uid = trial.uid();
            storage.check_parent(EntityKind::Trial, &uid, EntityKind::Project, trial.project_id())?;
            if trial.group_id().is_some() {
                storage.check_parent(EntityKind::Trial, &uid, EntityKind::TrialGroup, trial.group_id())?;
            }

            if storage.local.trial(&uid).is_some() {
                if !auto_increment {
                    debug!(trial = %uid, "trial exists");
                    return Ok(None);
                }
                trial.revision = storage.local.next_revision(trial.hash());
                debug!(from = %uid, revision = trial.revision(), "bumped trial revision");
            }

            trial.init_counter();
            let uid = trial.uid();
            storage.local.insert(Entity::Trial(trial.clone()))?;
            if let Some(project) = trial.project_id().and_then(|id| storage.local.project_mut(id)) {
                project.trials.insert(uid.clone());
            }
            if let Some(group) = trial.group_id().and_then(|id| storage.local.group_mut(id)) {
                group.trials.insert(uid);
            }
            storage.dirty = true;
            Ok(Some(trial))
        })
    }

    fn get_trial(&mut self, trial: &Trial) -> Result<Option<Trial>> {
        let uid = trial.uid();
        self.guarded(|storage| Ok(storage.local.trial(&uid).cloned()))
    }

    fn add_project_trial(&mut self, project: &Project, trial: &Trial) -> Result<()> {
        let project_id = project.uid().to_string();
        let trial_uid = trial.uid();
        self.guarded(|storage| {
            if storage.local.project(&project_id).is_none() {
                return Err(Error::NotFound {
                    kind: EntityKind::Project,
                    uid: project_id.clone(),
                });
            }
            storage.update_trial(trial, |live| {
                live.project_id = Some(project_id.clone());
                Ok(())
            })?;
            if let Some(live) = storage.local.project_mut(&project_id) {
                live.trials.insert(trial_uid);
            }
            Ok(())
        })
    }

    fn add_group_trial(&mut self, group: &TrialGroup, trial: &Trial) -> Result<()> {
        let group_id = group.uid().to_string();
        let trial_uid = trial.uid();
        self.guarded(|storage| {
            if storage.local.group(&group_id).is_none() {
                return Err(Error::NotFound {
                    kind: EntityKind::TrialGroup,
                    uid: group_id.clone(),
                });
            }
            storage.update_trial(trial, |live| {
                live.group_id = Some(group_id.clone());
                Ok(())
            })?;
            storage.update_group(group, |live| {
                live.trials.insert(trial_uid);
            })
        })
    }

    fn log_trial_start(&mut self, trial: &Trial) -> Result<()> {
        self.update_trial(trial, |live| {
            live.metadata.insert(START_TIME_KEY.to_string(), Value::from(now_seconds()));
            live.status = Status::Running;
            Ok(())
        })
    }

    fn log_trial_finish(&mut self, trial: &Trial, failure: Option<&str>) -> Result<()> {
        self.update_trial(trial, |live| {
            live.metadata.insert(END_TIME_KEY.to_string(), Value::from(now_seconds()));
            match failure {
                Some(failure) => {
                    live.status = Status::Exception;
                    live.errors.push(failure.to_string());
                }
                None => live.status = Status::Completed,
            }
            Ok(())
        })
    }

    fn log_trial_chrono_start(&mut self, trial: &Trial, name: &str, kind: AggregatorKind) -> Result<()> {
        self.update_trial(trial, |live| {
            live.chronos
                .entry(name.to_string())
                .or_insert_with(|| Aggregator::new(kind));
            Ok(())
        })?;
        self.chronos
            .insert((trial.uid(), name.to_string()), (Instant::now(), kind));
        Ok(())
    }

    fn log_trial_chrono_finish(&mut self, trial: &Trial, name: &str, failure: Option<&str>) -> Result<()> {
        let key = (trial.uid(), name.to_string());
        let (started, kind) = self
            .chronos
            .remove(&key)
            .ok_or_else(|| Error::InvalidInput(format!("chrono `{name}` was not started")))?;
        if let Some(failure) = failure {
            debug!(trial = %key.0, chrono = name, failure, "chrono block failed, nothing recorded");
            return Ok(());
        }
        let elapsed = started.elapsed().as_secs_f64();
        self.update_trial(trial, |live| {
            live.chronos
                .entry(name.to_string())
                .or_insert_with(|| Aggregator::new(kind))
                .append(elapsed);
            Ok(())
        })
    }

    fn log_trial_arguments(&mut self, trial: &Trial, arguments: Fields) -> Result<()> {
        self.update_trial(trial, |live| {
            live.parameters.extend(arguments);
            Ok(())
        })
    }

    fn log_trial_metadata(&mut self, trial: &Trial, metadata: Fields) -> Result<()> {
        self.update_trial(trial, |live| {
            live.metadata.extend(metadata);
            Ok(())
        })
    }

    fn log_trial_metrics(&mut self, trial: &Trial, step: Option<i64>, values: Fields) -> Result<()> {
        self.update_trial(trial, |live| {
            // Check every shape first so a rejected call changes nothing.
            for name in values.keys() {
                if let Some(series) = live.metrics.get(name) {
                    let fits = matches!(
                        (series, step),
                        (MetricSeries::Steps(_), Some(_)) | (MetricSeries::Sequence(_), None)
                    );
                    if !fits {
                        return Err(Error::InvalidInput(format!(
                            "metric `{name}` does not accept step {step:?}"
                        )));
                    }
                }
            }
            for (name, value) in values {
                live.metrics
                    .entry(name)
                    .or_insert_with(|| MetricSeries::for_step(step))
                    .record(step, value)?;
            }
            Ok(())
        })
    }

    fn set_trial_status(&mut self, trial: &Trial, status: Status, error: Option<&str>) -> Result<()> {
        self.update_trial(trial, |live| {
            live.status = status;
            if let Some(error) = error {
                live.errors.push(error.to_string());
            }
            Ok(())
        })
    }

    fn add_trial_tags(&mut self, trial: &Trial, tags: Fields) -> Result<()> {
        self.update_trial(trial, |live| {
            live.tags.extend(tags);
            Ok(())
        })
    }

    fn set_group_metadata(&mut self, group: &TrialGroup, metadata: Fields) -> Result<()> {
        self.update_group(group, |live| live.metadata.extend(metadata))
    }

    fn fetch_trials(&mut self, query: &Query) -> Result<Vec<Trial>> {
        self.guarded(|storage| {
            let strict = storage.options.is_strict();
            Ok(storage.local.fetch_trials(query, strict)?.into_iter().cloned().collect())
        })
    }

    fn fetch_groups(&mut self, query: &Query) -> Result<Vec<TrialGroup>> {
        self.guarded(|storage| {
            let strict = storage.options.is_strict();
            Ok(storage.local.fetch_groups(query, strict)?.into_iter().cloned().collect())
        })
    }

    fn fetch_projects(&mut self, query: &Query) -> Result<Vec<Project>> {
        self.guarded(|storage| {
            let strict = storage.options.is_strict();
            Ok(storage.local.fetch_projects(query, strict)?.into_iter().cloned().collect())
        })
    }

    fn fetch_and_update_trial(&mut self, query: &Query, update: TrialUpdate) -> Result<Option<Trial>> {
        self.fetch_and_update_trial_with(query, |storage, trial| update.apply(storage, trial))
    }

    fn fetch_and_update_group(&mut self, query: &Query, update: GroupUpdate) -> Result<Option<TrialGroup>> {
        self.guarded(|storage| {
            let strict = storage.options.is_strict();
            let Some(target) = storage.local.fetch_groups(query, strict)?.first().map(|g| (*g).clone()) else {
                return Ok(None);
            };
            update.apply(storage, &target)?;
            Ok(storage.local.group(target.uid()).cloned())
        })
    }

    fn commit(&mut self) -> Result<()> {
        if self.options.is_eager() {
            return self.guarded(|storage| {
                storage.dirty = true;
                Ok(())
            });
        }
        let _lock = FileLock::acquire(
            &self.options.lock_path(),
            self.options.get_lock_timeout(),
            self.options.get_poll_interval(),
        )?;
        self.local.reload(self.options.path())?;
        publish_while_held(|| self.local.commit(self.options.path()))
    }
}

/// One level of [`FileStorage::guarded`] nesting.
///
/// Dropping it restores the depth, also when the body panics. An unwinding
/// outermost scope drops uncommitted changes and releases the lock.
struct Scope<'a> {
    storage: &'a mut FileStorage,
}

impl Drop for Scope<'_> {
    fn drop(&mut self) {
        let storage = &mut *self.storage;
        storage.depth -= 1;
        if storage.depth == 0 && std::thread::panicking() {
            if std::mem::take(&mut storage.dirty) {
                storage.discard_pending();
            }
            storage.lock = None;
            warn!(path = %storage.options.path().display(), "guarded call panicked, lock released");
        }
    }
}
