//! In-memory entity index backed by a JSON document
//!
//! `LocalStorage` owns every entity of one process. Groups and trials are
//! reachable directly by uid even though the persisted document nests them
//! inside their project.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use rustc_hash::FxHashMap;
use tempfile::NamedTempFile;
use tracing::{debug, error, warn};

use crate::error::EntityKind;
use crate::experiment::{Project, ProjectRecord, Record, Trial, TrialGroup};
use crate::query::{Query, Queryable};
use crate::{Error, Result};

/// Any stored entity
#[derive(Debug, Clone, PartialEq)]
pub enum Entity {
    /// Project
    Project(Project),
    /// Trial group
    TrialGroup(TrialGroup),
    /// Trial
    Trial(Trial),
}

impl Entity {
    /// Entity kind
    #[must_use]
    pub const fn kind(&self) -> EntityKind {
        match self {
            Self::Project(_) => EntityKind::Project,
            Self::TrialGroup(_) => EntityKind::TrialGroup,
            Self::Trial(_) => EntityKind::Trial,
        }
    }

    /// Uid of the entity
    #[must_use]
    pub fn uid(&self) -> String {
        match self {
            Self::Project(project) => project.uid().to_string(),
            Self::TrialGroup(group) => group.uid().to_string(),
            Self::Trial(trial) => trial.uid(),
        }
    }

    /// Fold `disk` into `self`; both must describe the same uid.
    fn absorb(&mut self, disk: Self) -> Result<bool> {
        match (self, disk) {
            (Self::Project(mine), Self::Project(theirs)) => {
                let before = mine.clone();
                mine.absorb(theirs);
                Ok(*mine != before)
            }
            (Self::TrialGroup(mine), Self::TrialGroup(theirs)) => {
                let before = mine.clone();
                mine.absorb(theirs);
                Ok(*mine != before)
            }
            (Self::Trial(mine), Self::Trial(theirs)) => mine.absorb(theirs),
            (mine, theirs) => Err(Error::MergeConflict {
                uid: mine.uid(),
                reason: format!("stored as {} but found as {} on disk", mine.kind(), theirs.kind()),
            }),
        }
    }
}

/// Snapshot written to a temporary file next to the database, not yet
/// visible at the target path.
#[derive(Debug)]
pub struct StagedCommit {
    file: NamedTempFile,
    target: PathBuf,
}

impl StagedCommit {
    /// Path of the temporary file
    #[must_use]
    pub fn staged_path(&self) -> &Path {
        self.file.path()
    }

    /// Atomically rename the snapshot over the target path.
    ///
    /// # Errors
    ///
    /// Returns `Persist` if the rename fails; the target is left untouched.
    pub fn publish(self) -> Result<()> {
        self.file.persist(&self.target)?;
        debug!(path = %self.target.display(), "published snapshot");
        Ok(())
    }
}

/// All entities known to one process, plus derived indices
#[derive(Debug, Default)]
pub struct LocalStorage {
    objects: FxHashMap<String, Entity>,
    projects: BTreeSet<String>,
    groups: BTreeSet<String>,
    trials: BTreeSet<String>,
    project_names: FxHashMap<String, String>,
    group_names: FxHashMap<(String, String), String>,
    revisions: FxHashMap<String, BTreeSet<u32>>,
}

impl LocalStorage {
    /// Empty storage
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entities
    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// True when nothing is stored
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Uids of all projects, ordered
    #[must_use]
    pub const fn project_uids(&self) -> &BTreeSet<String> {
        &self.projects
    }

    /// Uids of all groups, ordered
    #[must_use]
    pub const fn group_uids(&self) -> &BTreeSet<String> {
        &self.groups
    }

    /// Uids of all trials, ordered
    #[must_use]
    pub const fn trial_uids(&self) -> &BTreeSet<String> {
        &self.trials
    }

    /// Look up any entity by uid
    #[must_use]
    pub fn get(&self, uid: &str) -> Option<&Entity> {
        self.objects.get(uid)
    }

    /// Project by uid
    #[must_use]
    pub fn project(&self, uid: &str) -> Option<&Project> {
        match self.objects.get(uid) {
            Some(Entity::Project(project)) => Some(project),
            _ => None,
        }
    }

    /// Project uid registered for a name
    #[must_use]
    pub fn project_by_name(&self, name: &str) -> Option<&Project> {
        self.project_names.get(name).and_then(|uid| self.project(uid))
    }

    /// Trial group by uid
    #[must_use]
    pub fn group(&self, uid: &str) -> Option<&TrialGroup> {
        match self.objects.get(uid) {
            Some(Entity::TrialGroup(group)) => Some(group),
            _ => None,
        }
    }

    /// Trial group by `(project, name)`
    #[must_use]
    pub fn group_by_name(&self, project_id: &str, name: &str) -> Option<&TrialGroup> {
        self.group_names
            .get(&(project_id.to_string(), name.to_string()))
            .and_then(|uid| self.group(uid))
    }

    /// Trial by uid
    #[must_use]
    pub fn trial(&self, uid: &str) -> Option<&Trial> {
        match self.objects.get(uid) {
            Some(Entity::Trial(trial)) => Some(trial),
            _ => None,
        }
    }

    pub(crate) fn project_mut(&mut self, uid: &str) -> Option<&mut Project> {
        match self.objects.get_mut(uid) {
            Some(Entity::Project(project)) => Some(project),
            _ => None,
        }
    }

    pub(crate) fn group_mut(&mut self, uid: &str) -> Option<&mut TrialGroup> {
        match self.objects.get_mut(uid) {
            Some(Entity::TrialGroup(group)) => Some(group),
            _ => None,
        }
    }

    pub(crate) fn trial_mut(&mut self, uid: &str) -> Option<&mut Trial> {
        match self.objects.get_mut(uid) {
            Some(Entity::Trial(trial)) => Some(trial),
            _ => None,
        }
    }

    /// Known revisions of a content hash, ascending
    #[must_use]
    pub fn revisions(&self, hash: &str) -> Vec<u32> {
        self.revisions
            .get(hash)
            .map(|revs| revs.iter().copied().collect())
            .unwrap_or_default()
    }

    /// First unused revision for a content hash (`max + 1`, or 0)
    #[must_use]
    pub fn next_revision(&self, hash: &str) -> u32 {
        self.revisions
            .get(hash)
            .and_then(|revs| revs.iter().next_back())
            .map_or(0, |max| max + 1)
    }

    /// Insert a new entity.
    ///
    /// # Errors
    ///
    /// `IdentityConflict` if the uid is already stored.
    pub fn insert(&mut self, entity: Entity) -> Result<()> {
        let uid = entity.uid();
        if self.objects.contains_key(&uid) {
            return Err(Error::IdentityConflict {
                kind: entity.kind(),
                uid,
            });
        }
        self.register(uid, entity);
        Ok(())
    }

    fn register(&mut self, uid: String, entity: Entity) {
        match &entity {
            Entity::Project(project) => {
                if let Some(previous) = self.project_names.get(project.name()) {
                    if previous != &uid {
                        error!(name = project.name(), %previous, %uid, "two projects share a name");
                    }
                }
                self.project_names.insert(project.name().to_string(), uid.clone());
                self.projects.insert(uid.clone());
            }
            Entity::TrialGroup(group) => {
                self.group_names.insert(
                    (group.project_id().to_string(), group.name().to_string()),
                    uid.clone(),
                );
                self.groups.insert(uid.clone());
            }
            Entity::Trial(trial) => {
                self.revisions
                    .entry(trial.hash().to_string())
                    .or_default()
                    .insert(trial.revision());
                self.trials.insert(uid.clone());
            }
        }
        self.objects.insert(uid, entity);
    }

    /// Matching entities of one kind, ordered by uid.
    ///
    /// A uid that is indexed but not stored is skipped with a warning, or
    /// reported as `StaleReference` when `strict`.
    fn select<'a, T: Queryable>(
        &'a self,
        index: &'a BTreeSet<String>,
        pick: fn(&Entity) -> Option<&T>,
        query: &Query,
        strict: bool,
    ) -> Result<Vec<&'a T>> {
        let mut matches = Vec::new();
        for uid in index {
            let Some(entity) = self.objects.get(uid).and_then(pick) else {
                if strict {
                    return Err(Error::StaleReference { kind: T::KIND, uid: uid.clone() });
                }
                warn!(kind = %T::KIND, %uid, "skipping stale reference");
                continue;
            };
            if query.matches(entity)? {
                matches.push(entity);
            }
        }
        Ok(matches)
    }

    /// Trials matching `query`, ordered by uid
    ///
    /// # Errors
    ///
    /// `InvalidQuery`, or `StaleReference` in strict mode.
    pub fn fetch_trials(&self, query: &Query, strict: bool) -> Result<Vec<&Trial>> {
        self.select(
            &self.trials,
            |e| match e {
                Entity::Trial(trial) => Some(trial),
                _ => None,
            },
            query,
            strict,
        )
    }

    /// Groups matching `query`, ordered by uid
    ///
    /// # Errors
    ///
    /// `InvalidQuery`, or `StaleReference` in strict mode.
    pub fn fetch_groups(&self, query: &Query, strict: bool) -> Result<Vec<&TrialGroup>> {
        self.select(
            &self.groups,
            |e| match e {
                Entity::TrialGroup(group) => Some(group),
                _ => None,
            },
            query,
            strict,
        )
    }

    /// Projects matching `query`, ordered by uid
    ///
    /// # Errors
    ///
    /// `InvalidQuery`, or `StaleReference` in strict mode.
    pub fn fetch_projects(&self, query: &Query, strict: bool) -> Result<Vec<&Project>> {
        self.select(
            &self.projects,
            |e| match e {
                Entity::Project(project) => Some(project),
                _ => None,
            },
            query,
            strict,
        )
    }

    /// Read a database file. A missing or empty file is an empty storage.
    ///
    /// # Errors
    ///
    /// `Io` / `Json` on unreadable documents, `MergeConflict` when the
    /// document holds incomparable duplicates.
    pub fn load(path: &Path) -> Result<Self> {
        let mut storage = Self::new();
        let file = match File::open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(storage),
            Err(err) => return Err(err.into()),
        };
        if file.metadata()?.len() == 0 {
            return Ok(storage);
        }
        let records: Vec<Record> = serde_json::from_reader(BufReader::new(file))?;
        for record in records {
            storage.flatten(record)?;
        }
        debug!(path = %path.display(), entities = storage.len(), "loaded database");
        Ok(storage)
    }

    fn flatten(&mut self, record: Record) -> Result<()> {
        let entity = match record {
            Record::Project(project) => {
                let (project, children) = project.into_parts();
                for child in children {
                    self.flatten(child)?;
                }
                Entity::Project(project)
            }
            Record::TrialGroup(group) => Entity::TrialGroup(group),
            Record::Trial(trial) => Entity::Trial(trial),
        };
        let uid = entity.uid();
        match self.objects.get_mut(&uid) {
            Some(existing) => {
                warn!(%uid, kind = %entity.kind(), "duplicate record in database, merging");
                existing.absorb(entity)?;
            }
            None => self.register(uid, entity),
        }
        Ok(())
    }

    /// The persisted document: one record per project with its children
    /// embedded, followed by any orphaned groups and trials.
    #[must_use]
    pub fn to_records(&self) -> Vec<Record> {
        let mut written = BTreeSet::new();
        let mut records = Vec::with_capacity(self.projects.len());

        for uid in &self.projects {
            let Some(project) = self.project(uid) else {
                continue;
            };
            let groups: Vec<TrialGroup> = project
                .groups()
                .iter()
                .filter_map(|g| self.group(g).cloned())
                .collect();
            let trials: Vec<Trial> = project
                .trials()
                .iter()
                .filter_map(|t| self.trial(t).cloned())
                .collect();
            written.extend(groups.iter().map(|g| g.uid().to_string()));
            written.extend(trials.iter().map(Trial::uid));
            records.push(Record::Project(ProjectRecord::embed(project, groups, trials)));
        }

        let orphan_groups = self
            .groups
            .iter()
            .filter(|uid| !written.contains(*uid))
            .filter_map(|uid| self.group(uid).cloned())
            .map(Record::TrialGroup);
        let orphan_trials = self
            .trials
            .iter()
            .filter(|uid| !written.contains(*uid))
            .filter_map(|uid| self.trial(uid).cloned())
            .map(Record::Trial);
        records.extend(orphan_groups);
        records.extend(orphan_trials);
        records
    }

    /// Write the snapshot to a temporary file in the target's directory.
    ///
    /// # Errors
    ///
    /// `Io` / `Json` if the snapshot cannot be written and synced.
    pub fn stage(&self, path: &Path) -> Result<StagedCommit> {
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut file = NamedTempFile::new_in(dir)?;
        {
            let mut writer = BufWriter::new(file.as_file_mut());
            serde_json::to_writer(&mut writer, &self.to_records())?;
            writer.flush()?;
        }
        file.as_file().sync_all()?;
        Ok(StagedCommit {
            file,
            target: path.to_path_buf(),
        })
    }

    /// Stage and publish in one step.
    ///
    /// # Errors
    ///
    /// See [`stage`](Self::stage) and [`StagedCommit::publish`].
    pub fn commit(&self, path: &Path) -> Result<()> {
        self.stage(path)?.publish()
    }

    /// Fold another storage (usually freshly loaded from disk) into this one.
    ///
    /// Unknown entities are inserted; known ones are merged (trials only when
    /// the other side's update counter is strictly greater). Returns the
    /// number of entities added or changed.
    ///
    /// # Errors
    ///
    /// `MergeConflict` for incomparable versions; logged with full context.
    pub fn merge(&mut self, other: Self) -> Result<usize> {
        let mut changed = 0;
        for (uid, entity) in other.objects {
            match self.objects.get_mut(&uid) {
                Some(existing) => match existing.absorb(entity) {
                    Ok(true) => changed += 1,
                    Ok(false) => {}
                    Err(err) => {
                        error!(%uid, error = %err, "merge conflict while reloading");
                        return Err(err);
                    }
                },
                None => {
                    changed += 1;
                    self.register(uid, entity);
                }
            }
        }
        Ok(changed)
    }

    /// Re-read `path` and merge it in.
    ///
    /// # Errors
    ///
    /// See [`load`](Self::load) and [`merge`](Self::merge).
    pub fn reload(&mut self, path: &Path) -> Result<usize> {
        let disk = Self::load(path)?;
        let changed = self.merge(disk)?;
        if changed > 0 {
            debug!(path = %path.display(), changed, "reloaded database");
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::{Status, UPDATE_COUNT_KEY};
    use serde_json::json;
    use tempfile::tempdir;

    fn populated() -> LocalStorage {
        let mut storage = LocalStorage::new();
        let mut project = Project::new("mnist");
        let group = TrialGroup::new("sweep", "mnist");
        let trial = Trial::builder()
            .name("t")
            .project("mnist")
            .group(group.uid())
            .finalize();
        project.groups.insert(group.uid().to_string());
        project.trials.insert(trial.uid());
        storage.insert(Entity::Project(project)).unwrap();
        storage.insert(Entity::TrialGroup(group)).unwrap();
        storage.insert(Entity::Trial(trial)).unwrap();
        storage
    }

    #[test]
    fn test_insert_rejects_duplicates() {
        let mut storage = populated();
        let err = storage.insert(Entity::Project(Project::new("mnist"))).unwrap_err();
        assert!(matches!(err, Error::IdentityConflict { .. }));
    }

    #[test]
    fn test_commit_then_load_flattens_children() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.json");
        let storage = populated();
        storage.commit(&path).unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw.as_array().unwrap().len(), 1, "only the project is top-level");

        let loaded = LocalStorage::load(&path).unwrap();
        assert_eq!(loaded.len(), 3);
        assert_eq!(loaded.trial_uids(), storage.trial_uids());
        assert_eq!(loaded.group_uids(), storage.group_uids());
        assert!(loaded.group_by_name("mnist", "sweep").is_some());
        assert!(loaded.project_by_name("mnist").is_some());
    }

    #[test]
    fn test_orphans_are_top_level() {
        let mut storage = LocalStorage::new();
        storage
            .insert(Entity::Trial(Trial::builder().name("lonely").finalize()))
            .unwrap();
        let records = storage.to_records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind(), EntityKind::Trial);
    }

    #[test]
    fn test_missing_and_empty_files_are_empty_storage() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.json");
        assert!(LocalStorage::load(&path).unwrap().is_empty());
        std::fs::write(&path, "").unwrap();
        assert!(LocalStorage::load(&path).unwrap().is_empty());
    }

    #[test]
    fn test_next_revision() {
        let mut storage = LocalStorage::new();
        let trial = Trial::builder().name("t").finalize();
        let hash = trial.hash().to_string();
        assert_eq!(storage.next_revision(&hash), 0);
        storage.insert(Entity::Trial(trial)).unwrap();
        storage
            .insert(Entity::Trial(Trial::builder().name("t").revision(4).finalize()))
            .unwrap();
        assert_eq!(storage.revisions(&hash), vec![0, 4]);
        assert_eq!(storage.next_revision(&hash), 5);
    }

    #[test]
    fn test_merge_never_regresses() {
        let mut mine = populated();
        let uid = mine.trial_uids().iter().next().unwrap().clone();
        {
            let trial = mine.trial_mut(&uid).unwrap();
            trial.touch();
            trial.touch();
            trial.status = Status::Running;
        }

        let mut disk = populated();
        {
            let trial = disk.trial_mut(&uid).unwrap();
            trial.touch();
            trial.status = Status::Completed;
        }
        disk.insert(Entity::Project(Project::new("cifar"))).unwrap();

        let changed = mine.merge(disk).unwrap();
        assert_eq!(changed, 1, "only the new project");
        assert_eq!(mine.trial(&uid).unwrap().status(), &Status::Running);
        assert!(mine.project("cifar").is_some());
    }

    #[test]
    fn test_merge_kind_mismatch_conflicts() {
        let mut mine = LocalStorage::new();
        mine.insert(Entity::Project(Project::new("x"))).unwrap();
        let mut disk = LocalStorage::new();
        let mut group = TrialGroup::new("g", "p");
        group.uid = "x".into();
        disk.insert(Entity::TrialGroup(group)).unwrap();
        assert!(matches!(mine.merge(disk), Err(Error::MergeConflict { .. })));
    }

    #[test]
    fn test_staged_snapshot_is_invisible_until_published() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.json");
        let mut storage = populated();
        storage.commit(&path).unwrap();
        let before = std::fs::read_to_string(&path).unwrap();

        storage.insert(Entity::Project(Project::new("cifar"))).unwrap();
        let staged = storage.stage(&path).unwrap();
        assert_ne!(staged.staged_path(), path.as_path());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), before);

        staged.publish().unwrap();
        assert_eq!(LocalStorage::load(&path).unwrap().project_uids().len(), 2);
    }

    #[test]
    fn test_stale_reference_policy() {
        let mut storage = populated();
        storage.trials.insert("ghost_0".into());
        assert_eq!(storage.fetch_trials(&Query::all(), false).unwrap().len(), 1);
        assert!(matches!(
            storage.fetch_trials(&Query::all(), true),
            Err(Error::StaleReference { .. })
        ));
    }

    #[test]
    fn test_malformed_counter_on_disk_conflicts() {
        let mut mine = populated();
        let uid = mine.trial_uids().iter().next().unwrap().clone();
        let mut disk = populated();
        disk.trial_mut(&uid)
            .unwrap()
            .metadata
            .insert(UPDATE_COUNT_KEY.into(), json!("x"));
        assert!(mine.merge(disk).is_err());
    }
}
