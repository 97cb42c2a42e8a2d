//! Project façade
//!
//! A [`Project`] owns one manifest for the length of a session and binds it
//! to a directory under the workspace. Lifecycle:
//!
//! - `Unbound`: validated manifest, no directory yet
//! - `Deployed`: directory materialized from a template, start page initialized
//! - `Persisted`: manifest carries an `_id` and has been written to the store
//!
//! Transitions only move forward; a persisted project may be saved again.
//! The store, clock, and directory roots are always passed in.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::archive::{self, ArchiveError};
use crate::clock::Clock;
use crate::config::{Config, ProjkitPaths};
use crate::deploy::{self, DeployError, DeployResult, Substitutions, TemplateDeployer};
use crate::fs_util;
use crate::models::{
    Manifest, ManifestId, ModuleEntry, ProjectKey, StartPageState, VersionRecord,
};
use crate::startpage::{self, StartPageError, StartPagePatch};
use crate::store::{ManifestKey, ManifestQuery, ManifestStore, StoreError};
use crate::validation::{self, ValidationError, REQUIRED_FIELDS};

/// On-disk copy of the manifest inside the project directory
pub const MANIFEST_FILE: &str = "datapackage.json";

/// Ad hoc manifest field that can pin the start page's module list
pub const MODULES_FIELD: &str = "modules";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectState {
    Unbound,
    Deployed,
    Persisted,
}

impl fmt::Display for ProjectState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProjectState::Unbound => write!(f, "unbound"),
            ProjectState::Deployed => write!(f, "deployed"),
            ProjectState::Persisted => write!(f, "persisted"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProjectError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Deploy(#[from] DeployError),

    #[error(transparent)]
    StartPage(#[from] StartPageError),

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error("Project {key} is {state}; cannot {action}")]
    InvalidState {
        key: ProjectKey,
        state: ProjectState,
        action: &'static str,
    },

    #[error("Project {0} has no version history")]
    NoVersions(ProjectKey),

    #[error("Project {key} has no version {number}")]
    VersionNotFound { key: ProjectKey, number: u64 },

    #[error("Version {number} of project {key} has no archive")]
    VersionNotArchived { key: ProjectKey, number: u64 },

    #[error("{0} cannot be used as a module id")]
    InvalidModule(String),

    #[error("No template recorded for project {0}")]
    UnknownTemplate(ProjectKey),

    #[error("Failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to serialize manifest: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Directory roots and start-page defaults a project is bound against
#[derive(Debug, Clone)]
pub struct ProjectLayout {
    pub templates_dir: PathBuf,
    pub workspace_dir: PathBuf,
    /// Scratch area; exports are written here
    pub temp_dir: PathBuf,
    pub archives_dir: PathBuf,
    pub project_url_base: Option<String>,
    pub operations: Vec<String>,
}

impl ProjectLayout {
    pub fn new(
        templates_dir: impl Into<PathBuf>,
        workspace_dir: impl Into<PathBuf>,
        temp_dir: impl Into<PathBuf>,
    ) -> Self {
        let temp_dir = temp_dir.into();
        Self {
            templates_dir: templates_dir.into(),
            workspace_dir: workspace_dir.into(),
            archives_dir: temp_dir.join("archives"),
            temp_dir,
            project_url_base: None,
            operations: Config::default().operations,
        }
    }

    pub fn with_archives_dir(mut self, archives_dir: impl Into<PathBuf>) -> Self {
        self.archives_dir = archives_dir.into();
        self
    }

    pub fn from_config(paths: &ProjkitPaths, config: &Config) -> Self {
        Self {
            templates_dir: paths.templates.clone(),
            workspace_dir: paths.workspace.clone(),
            temp_dir: paths.temp.clone(),
            archives_dir: paths.archives.clone(),
            project_url_base: config.project_url_base.clone(),
            operations: config.operations.clone(),
        }
    }

    /// `<workspace>/<namespace>/<name>`
    pub fn project_dir(&self, key: &ProjectKey) -> PathBuf {
        self.workspace_dir.join(&key.namespace).join(&key.name)
    }

    /// Where a launched version lives: `<workspace>/<namespace>/<version_name>`
    pub fn version_dir(&self, key: &ProjectKey, version_name: &str) -> PathBuf {
        self.workspace_dir.join(&key.namespace).join(version_name)
    }

    /// `<archives>/<namespace>/<name>`
    pub fn archive_dir(&self, key: &ProjectKey) -> PathBuf {
        self.archives_dir.join(&key.namespace).join(&key.name)
    }

    pub fn project_url(&self, key: &ProjectKey) -> String {
        match &self.project_url_base {
            Some(base) => format!("{}/{}/{}", base.trim_end_matches('/'), key.namespace, key.name),
            None => self.project_dir(key).display().to_string(),
        }
    }

    pub fn deployer(&self) -> TemplateDeployer {
        TemplateDeployer::new(&self.templates_dir)
    }
}

/// Outcome of [`Project::checkpoint`]
#[derive(Debug, Clone, PartialEq)]
pub enum Checkpoint {
    /// The directory matches the latest version's archive
    Unchanged(VersionRecord),
    /// The latest version had no archive yet and now has one
    Archived(VersionRecord),
    /// The directory changed, so a new version was recorded and archived
    Bumped(VersionRecord),
}

impl Checkpoint {
    pub fn record(&self) -> &VersionRecord {
        match self {
            Checkpoint::Unchanged(v) | Checkpoint::Archived(v) | Checkpoint::Bumped(v) => v,
        }
    }
}

/// One project, bound to a manifest and (once deployed) a directory
#[derive(Debug, Clone)]
pub struct Project {
    manifest: Manifest,
    layout: ProjectLayout,
    project_dir: Option<PathBuf>,
    state: ProjectState,
}

impl Project {
    /// Validate a manifest stub. The project starts out unbound.
    pub fn new(stub: &Value, layout: ProjectLayout) -> Result<Self, ProjectError> {
        let manifest = validation::validate(stub)?;
        Ok(Self {
            manifest,
            layout,
            project_dir: None,
            state: ProjectState::Unbound,
        })
    }

    /// Validate, deploy `template`, and initialize the start page.
    /// Nothing is written to the store.
    pub fn create(
        stub: &Value,
        layout: ProjectLayout,
        template: &str,
        clock: &dyn Clock,
    ) -> Result<Self, ProjectError> {
        let mut project = Self::new(stub, layout)?;
        project.deploy(template, clock)?;
        Ok(project)
    }

    /// Reopen a deployed project from its directory
    pub fn open(project_dir: &Path, layout: ProjectLayout) -> Result<Self, ProjectError> {
        let path = project_dir.join(MANIFEST_FILE);
        let content = fs::read_to_string(&path).map_err(|source| ProjectError::Io {
            path: path.clone(),
            source,
        })?;
        let raw: Value = serde_json::from_str(&content)?;
        let manifest = validation::validate(&raw)?;
        let state = if manifest.id.is_some() {
            ProjectState::Persisted
        } else {
            ProjectState::Deployed
        };
        Ok(Self {
            manifest,
            layout,
            project_dir: Some(project_dir.to_path_buf()),
            state,
        })
    }

    /// Fetch a persisted project from the store. The directory binding is
    /// derived from the layout and may not exist locally.
    pub fn load(
        store: &dyn ManifestStore,
        key: &ManifestKey,
        layout: ProjectLayout,
    ) -> Result<Option<Self>, ProjectError> {
        let query = match key {
            ManifestKey::Id(id) => ManifestQuery::by_id(id),
            ManifestKey::Name(k) => ManifestQuery::by_key(k),
        };
        let Some(manifest) = store.find_one(&query)? else {
            return Ok(None);
        };
        let project_dir = layout.project_dir(&manifest.key());
        Ok(Some(Self {
            manifest,
            layout,
            project_dir: Some(project_dir),
            state: ProjectState::Persisted,
        }))
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// Mutable access for ad hoc edits; `save` re-validates
    pub fn manifest_mut(&mut self) -> &mut Manifest {
        &mut self.manifest
    }

    pub fn key(&self) -> ProjectKey {
        self.manifest.key()
    }

    pub fn id(&self) -> Option<&ManifestId> {
        self.manifest.id.as_ref()
    }

    pub fn state(&self) -> ProjectState {
        self.state
    }

    pub fn layout(&self) -> &ProjectLayout {
        &self.layout
    }

    pub fn project_dir(&self) -> Option<&Path> {
        self.project_dir.as_deref()
    }

    /// Materialize the project directory from `template`.
    ///
    /// Records version 1 (or the next version) with the template name,
    /// initializes the start page, and writes `datapackage.json`. If anything
    /// after the copy fails, the new directory is removed again.
    pub fn deploy(&mut self, template: &str, clock: &dyn Clock) -> Result<DeployResult, ProjectError> {
        if self.state != ProjectState::Unbound {
            return Err(self.invalid_state("deploy"));
        }

        let key = self.key();
        let dir = self.layout.project_dir(&key);
        let saved_content = self.manifest.content.clone();

        self.manifest.append_version(clock, None);
        if let Some(v) = self.manifest.content.last_mut() {
            v.version_workflow = Some(template.to_string());
        }

        let subs = self.substitutions(&dir, clock);
        let result = match self.layout.deployer().deploy(template, &dir, &subs) {
            Ok(result) => result,
            Err(e) => {
                self.manifest.content = saved_content;
                return Err(e.into());
            }
        };

        let finish = self
            .initial_start_page(&result)
            .and_then(|state| {
                startpage::save(&dir, &state)?;
                Ok(())
            })
            .and_then(|()| write_manifest_file(&dir, &self.manifest));

        if let Err(e) = finish {
            warn!(target = %dir.display(), error = %e, "project setup failed, removing directory");
            if let Err(rm) = fs::remove_dir_all(&dir) {
                warn!(target = %dir.display(), error = %rm, "could not remove project directory");
            }
            self.manifest.content = saved_content;
            return Err(e);
        }

        self.project_dir = Some(dir);
        self.state = ProjectState::Deployed;
        info!(project = %key, template, "project deployed");
        Ok(result)
    }

    /// Validate and write the manifest to the store.
    ///
    /// Inserts on first save and assigns `_id`; afterwards the stored
    /// document is replaced by the in-memory manifest as a whole. A rejected
    /// manifest never reaches the store. Once the store has the document,
    /// failing to refresh `datapackage.json` is only logged.
    pub fn save(&mut self, store: &dyn ManifestStore) -> Result<ManifestId, ProjectError> {
        if self.state == ProjectState::Unbound {
            return Err(self.invalid_state("save"));
        }
        validation::validate_manifest(&self.manifest)?;

        let id = match &self.manifest.id {
            Some(id) if store.replace(id, &self.manifest)? => id.clone(),
            _ => store.insert(&self.manifest)?,
        };

        self.manifest.id = Some(id.clone());
        self.state = ProjectState::Persisted;
        self.refresh_manifest_file();
        info!(project = %self.key(), %id, "project saved");
        Ok(id)
    }

    /// Clone into an independent project under a new name (and optionally a
    /// new namespace). The copy starts over at version 1 and is not persisted.
    pub fn save_as(
        &self,
        new_name: &str,
        new_namespace: Option<&str>,
        clock: &dyn Clock,
    ) -> Result<Project, ProjectError> {
        let Some(src_dir) = self.existing_dir() else {
            return Err(self.invalid_state("save as"));
        };

        let mut manifest = self.manifest.clone();
        manifest.id = None;
        manifest.name = new_name.to_string();
        if let Some(ns) = new_namespace {
            manifest.namespace = ns.to_string();
        }
        manifest.reset_versions(clock, None);
        validation::validate_manifest(&manifest)?;

        let key = manifest.key();
        let dir = self.layout.project_dir(&key);
        deploy::copy_project_dir(src_dir, &dir)?;

        let finish = startpage::update_fields(
            &dir,
            &StartPagePatch::default()
                .name(&manifest.name)
                .project_url(self.layout.project_url(&key)),
        )
        .map_err(ProjectError::from)
        .and_then(|_| write_manifest_file(&dir, &manifest));

        if let Err(e) = finish {
            warn!(target = %dir.display(), error = %e, "save as failed, removing copy");
            if let Err(rm) = fs::remove_dir_all(&dir) {
                warn!(target = %dir.display(), error = %rm, "could not remove copied directory");
            }
            return Err(e);
        }

        info!(from = %self.key(), to = %key, "project copied");
        Ok(Project {
            manifest,
            layout: self.layout.clone(),
            project_dir: Some(dir),
            state: ProjectState::Deployed,
        })
    }

    /// Pretty JSON of the reduced manifest
    pub fn render_manifest(&self) -> Result<String, ProjectError> {
        Ok(serde_json::to_string_pretty(&self.manifest.reduced()?)?)
    }

    /// Print the manifest to stdout
    pub fn print_manifest(&self) -> Result<(), ProjectError> {
        println!("{}", self.render_manifest()?);
        Ok(())
    }

    /// Append a version record. Not persisted to the store by itself.
    pub fn append_version(
        &mut self,
        clock: &dyn Clock,
        version_name: Option<String>,
    ) -> Result<VersionRecord, ProjectError> {
        let record = self.push_version(clock, version_name)?;
        if let Some(dir) = self.existing_dir() {
            write_manifest_file(dir, &self.manifest)?;
        }
        Ok(record)
    }

    /// Delete a version record and its archive.
    ///
    /// A persisted project has its stored `content` updated first; the
    /// in-memory manifest only changes once the store accepted it.
    pub fn delete_version(
        &mut self,
        number: u64,
        store: &dyn ManifestStore,
    ) -> Result<VersionRecord, ProjectError> {
        let mut manifest = self.manifest.clone();
        let record = manifest
            .version(number)
            .cloned()
            .ok_or_else(|| ProjectError::VersionNotFound {
                key: self.key(),
                number,
            })?;
        manifest.remove_version(number);

        if let Some(id) = &self.manifest.id {
            let mut fields = Map::new();
            fields.insert("content".to_string(), serde_json::to_value(&manifest.content)?);
            if !store.update(id, &fields)? {
                warn!(project = %self.key(), %id, "no stored record; version removed locally only");
            }
        }
        self.manifest = manifest;

        if let Some(file) = &record.version_zipfile {
            let path = self.layout.archive_dir(&self.key()).join(file);
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "could not remove version archive"),
            }
        }

        if self.manifest.id.is_some() {
            self.refresh_manifest_file();
        } else if let Some(dir) = self.existing_dir() {
            write_manifest_file(dir, &self.manifest)?;
        }
        info!(project = %self.key(), number, "version deleted");
        Ok(record)
    }

    /// Archive the project directory and record it against a version.
    ///
    /// The archive digest is compared with the latest version's: an identical
    /// tree changes nothing, a version without an archive receives this one,
    /// and otherwise the next version is appended. `datapackage.json` is left
    /// out of the archive since the manifest lives in the store.
    pub fn checkpoint(&mut self, clock: &dyn Clock) -> Result<Checkpoint, ProjectError> {
        let dir = self.require_dir("archive a version")?.to_path_buf();
        let latest = self
            .manifest
            .latest_version()
            .cloned()
            .ok_or_else(|| ProjectError::NoVersions(self.key()))?;

        let bytes = archive::zip_dir(&dir, &[MANIFEST_FILE])?;
        let hash = archive::digest(&bytes);
        if latest.version_hash.as_deref() == Some(hash.as_str()) {
            debug!(project = %self.key(), version = latest.version_number, "no changes since last archive");
            return Ok(Checkpoint::Unchanged(latest));
        }

        let bump = latest.version_zipfile.is_some();
        let saved_content = self.manifest.content.clone();
        if bump {
            self.push_version(clock, None)?;
        }
        let record = match self.store_archive(&bytes, &hash) {
            Ok(record) => record,
            Err(e) => {
                self.manifest.content = saved_content;
                return Err(e);
            }
        };
        write_manifest_file(&dir, &self.manifest)?;

        info!(project = %self.key(), version = record.version_number, bump, "version archived");
        Ok(if bump {
            Checkpoint::Bumped(record)
        } else {
            Checkpoint::Archived(record)
        })
    }

    /// Write `<temp_dir>/<version_name>.zip`. Uses the stored archive when
    /// the version has one; the latest version can also be zipped from the
    /// live directory.
    pub fn export_zip(&self, version: Option<u64>) -> Result<PathBuf, ProjectError> {
        let record = self.version_or_latest(version)?;
        check_version_name(&record.version_name)?;
        let out = self
            .layout
            .temp_dir
            .join(format!("{}.zip", record.version_name));
        if out.exists() {
            return Err(DeployError::TargetAlreadyExists(out).into());
        }

        let is_latest = self.manifest.latest_version_number() == record.version_number;
        let bytes = match (self.archived_bytes(record)?, self.existing_dir()) {
            (Some(bytes), _) => bytes,
            (None, Some(dir)) if is_latest => archive::zip_dir(dir, &[MANIFEST_FILE])?,
            (None, _) => {
                return Err(ProjectError::VersionNotArchived {
                    key: self.key(),
                    number: record.version_number,
                })
            }
        };

        fs::create_dir_all(&self.layout.temp_dir).map_err(|source| ProjectError::Io {
            path: self.layout.temp_dir.clone(),
            source,
        })?;
        fs_util::write_atomic(&out, &bytes).map_err(|source| ProjectError::Io {
            path: out.clone(),
            source,
        })?;
        info!(project = %self.key(), out = %out.display(), "version zip exported");
        Ok(out)
    }

    /// Materialize a stored version at `<workspace>/<namespace>/<version_name>`.
    /// A version that is already live there is returned as it is.
    pub fn launch(&self, version: Option<u64>) -> Result<PathBuf, ProjectError> {
        let record = self.version_or_latest(version)?;
        check_version_name(&record.version_name)?;
        let dir = self.layout.version_dir(&self.key(), &record.version_name);
        if dir.is_dir() {
            debug!(dir = %dir.display(), "version already live");
            return Ok(dir);
        }

        let bytes = self
            .archived_bytes(record)?
            .ok_or_else(|| ProjectError::VersionNotArchived {
                key: self.key(),
                number: record.version_number,
            })?;
        let mut manifest = self.manifest.clone();
        manifest.content = vec![record.clone()];
        let document = serde_json::to_string_pretty(&manifest.reduced()?)?;

        deploy::stage_and_commit(&dir, |staging| {
            archive::extract(&bytes, staging)?;
            fs::write(staging.join(MANIFEST_FILE), &document)
        })?;
        info!(project = %self.key(), version = record.version_number, dir = %dir.display(), "version launched");
        Ok(dir)
    }

    /// Start the next version in the project directory from the latest
    /// archive. The directory must not already hold a project.
    pub fn launch_next(&mut self, clock: &dyn Clock) -> Result<VersionRecord, ProjectError> {
        if self.state == ProjectState::Unbound {
            return Err(self.invalid_state("launch"));
        }
        let key = self.key();
        let dir = self.layout.project_dir(&key);
        deploy::check_target_free(&dir)?;

        let latest = self
            .manifest
            .latest_version()
            .ok_or_else(|| ProjectError::NoVersions(key.clone()))?;
        let bytes = self
            .archived_bytes(latest)?
            .ok_or_else(|| ProjectError::VersionNotArchived {
                key: key.clone(),
                number: latest.version_number,
            })?;

        let saved_content = self.manifest.content.clone();
        let record = self.push_version(clock, None)?;
        let document = serde_json::to_string_pretty(&self.manifest)?;
        let unpacked = deploy::stage_and_commit(&dir, |staging| {
            archive::extract(&bytes, staging)?;
            fs::write(staging.join(MANIFEST_FILE), &document)
        });
        if let Err(e) = unpacked {
            self.manifest.content = saved_content;
            return Err(e.into());
        }

        self.project_dir = Some(dir);
        info!(project = %key, version = record.version_number, "next version launched");
        Ok(record)
    }

    /// Called by processing modules when they produce output.
    ///
    /// `fields` is merge-patched into the manifest under the module id, the
    /// module is listed on the start page, and its visualisation URL is set
    /// when given.
    pub fn record_module_output(
        &mut self,
        module: &str,
        fields: Option<&Value>,
        visualisation_url: Option<&str>,
    ) -> Result<StartPageState, ProjectError> {
        let dir = self.require_dir("record module output")?.to_path_buf();
        check_module_id(module)?;

        if let Some(fields) = fields {
            let entry = self
                .manifest
                .extra
                .entry(module.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            json_patch::merge(entry, fields);
        }

        let current = startpage::load(&dir)?;
        let mut patch = StartPagePatch::default();
        if !current.has_module(module) {
            let mut modules = current.available_modules.clone();
            modules.push(ModuleEntry::module(module));
            patch = patch.available_modules(modules);
        }
        if let Some(url) = visualisation_url {
            patch = patch.visualisation(module, url);
        }

        let state = startpage::update_fields(&dir, &patch)?;
        write_manifest_file(&dir, &self.manifest)?;
        info!(project = %self.key(), module, "module output recorded");
        Ok(state)
    }

    /// Remove a module's visualisation link from the start page
    pub fn clear_visualisation(&self, module: &str) -> Result<StartPageState, ProjectError> {
        let dir = self.require_dir("clear a visualisation")?;
        Ok(startpage::update_fields(
            dir,
            &StartPagePatch::default().remove_visualisation(module),
        )?)
    }

    /// Current start-page state
    pub fn start_page(&self) -> Result<StartPageState, ProjectError> {
        let dir = self.require_dir("read the start page")?;
        Ok(startpage::load(dir)?)
    }

    /// Re-derive the manifest-backed start-page fields and regenerate the page
    pub fn sync_start_page(&self) -> Result<StartPageState, ProjectError> {
        let dir = self.require_dir("sync the start page")?;
        let key = self.key();
        Ok(startpage::update_fields(
            dir,
            &StartPagePatch::default()
                .name(&self.manifest.name)
                .project_url(self.layout.project_url(&key)),
        )?)
    }

    /// Copy one more module out of the project's template
    pub fn deploy_module(
        &mut self,
        module: &str,
        clock: &dyn Clock,
    ) -> Result<DeployResult, ProjectError> {
        let dir = self.require_dir("deploy a module")?.to_path_buf();
        check_module_id(module)?;
        let template = self
            .manifest
            .latest_version()
            .and_then(|v| v.version_workflow.clone())
            .ok_or_else(|| ProjectError::UnknownTemplate(self.key()))?;

        let subs = self.substitutions(&dir, clock);
        let result = self
            .layout
            .deployer()
            .deploy_module(&template, module, &dir, &subs)?;

        let current = startpage::load(&dir)?;
        if !current.has_module(module) {
            let mut modules = current.available_modules;
            modules.push(ModuleEntry::module(module));
            startpage::update_fields(&dir, &StartPagePatch::default().available_modules(modules))?;
        }
        Ok(result)
    }

    /// Whether the store holds this project (by `_id` once persisted, by
    /// name and namespace before)
    pub fn exists(&self, store: &dyn ManifestStore) -> Result<bool, ProjectError> {
        let found = match &self.manifest.id {
            Some(id) => store.exists(id)?,
            None => store.find_one(&ManifestQuery::by_key(&self.key()))?.is_some(),
        };
        Ok(found)
    }

    /// Remove the stored record. The in-memory project and its directory are
    /// left alone.
    pub fn delete(&self, store: &dyn ManifestStore) -> Result<bool, ProjectError> {
        let key = match &self.manifest.id {
            Some(id) => ManifestKey::Id(id.clone()),
            None => ManifestKey::Name(self.key()),
        };
        let deleted = store.delete(&key)?;
        info!(project = %self.key(), deleted, "project delete");
        Ok(deleted)
    }

    /// Write `<temp_dir>/<version_name>/` holding the reduced manifest and a
    /// copy of the project directory. Uses the latest version by default.
    pub fn export(&self, version: Option<u64>) -> Result<PathBuf, ProjectError> {
        let record = self.version_or_latest(version)?;

        let out = self.layout.temp_dir.join(&record.version_name);
        deploy::check_target_free(&out)?;

        let mut manifest = self.manifest.clone();
        manifest.content = vec![record.clone()];
        let document = serde_json::to_string_pretty(&manifest.reduced()?)?;
        let project_dir = self.existing_dir();

        deploy::stage_and_commit(&out, |staging| {
            fs::write(staging.join(MANIFEST_FILE), &document)?;
            if let Some(dir) = project_dir {
                deploy::copy_dir_all(dir, &staging.join("project"))?;
            }
            Ok(())
        })?;

        info!(project = %self.key(), out = %out.display(), "project exported");
        Ok(out)
    }

    fn version_or_latest(&self, version: Option<u64>) -> Result<&VersionRecord, ProjectError> {
        match version {
            Some(number) => self.manifest.version(number).ok_or(ProjectError::VersionNotFound {
                key: self.key(),
                number,
            }),
            None => self
                .manifest
                .latest_version()
                .ok_or_else(|| ProjectError::NoVersions(self.key())),
        }
    }

    /// Append the next version, carrying over the latest version's template
    fn push_version(
        &mut self,
        clock: &dyn Clock,
        version_name: Option<String>,
    ) -> Result<VersionRecord, ProjectError> {
        let workflow = self
            .manifest
            .latest_version()
            .and_then(|v| v.version_workflow.clone());
        self.manifest.append_version(clock, version_name);
        match self.manifest.content.last_mut() {
            Some(v) => {
                v.version_workflow = workflow;
                Ok(v.clone())
            }
            None => Err(ProjectError::NoVersions(self.key())),
        }
    }

    /// Write the archive for the latest version and point the record at it
    fn store_archive(&mut self, bytes: &[u8], hash: &str) -> Result<VersionRecord, ProjectError> {
        let key = self.key();
        let archive_dir = self.layout.archive_dir(&key);
        let Some(record) = self.manifest.content.last_mut() else {
            return Err(ProjectError::NoVersions(key));
        };
        check_version_name(&record.version_name)?;

        let file_name = format!("{}.zip", record.version_name);
        let path = archive_dir.join(&file_name);
        fs::create_dir_all(&archive_dir)
            .and_then(|()| fs_util::write_atomic(&path, bytes))
            .map_err(|source| ProjectError::Io { path, source })?;

        record.version_zipfile = Some(file_name);
        record.version_hash = Some(hash.to_string());
        Ok(record.clone())
    }

    /// Stored archive bytes for `record`, if it has a readable one
    fn archived_bytes(&self, record: &VersionRecord) -> Result<Option<Vec<u8>>, ProjectError> {
        let Some(file) = &record.version_zipfile else {
            return Ok(None);
        };
        let path = self.layout.archive_dir(&self.key()).join(file);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "version archive is missing");
                Ok(None)
            }
            Err(source) => Err(ProjectError::Io { path, source }),
        }
    }

    /// Mirror the manifest into the project directory after a store write
    fn refresh_manifest_file(&self) {
        if let Some(dir) = self.existing_dir() {
            if let Err(e) = write_manifest_file(dir, &self.manifest) {
                warn!(project = %self.key(), error = %e, "could not refresh datapackage.json");
            }
        }
    }

    fn substitutions(&self, dir: &Path, clock: &dyn Clock) -> Substitutions {
        let key = self.key();
        let mut subs = Substitutions::new();
        subs.insert("name".into(), self.manifest.name.clone());
        subs.insert("namespace".into(), self.manifest.namespace.clone());
        subs.insert("title".into(), self.manifest.title.clone());
        subs.insert("project_dir".into(), dir.display().to_string());
        subs.insert("project_url".into(), self.layout.project_url(&key));
        subs.insert("created".into(), clock.version_date());
        if let Some(v) = self.manifest.latest_version() {
            subs.insert("version_name".into(), v.version_name.clone());
        }
        subs
    }

    fn initial_start_page(&self, deployed: &DeployResult) -> Result<StartPageState, ProjectError> {
        let available_modules = match self.manifest.extra.get(MODULES_FIELD) {
            Some(raw) => serde_json::from_value::<Vec<ModuleEntry>>(raw.clone()).map_err(|e| {
                ValidationError {
                    missing: Vec::new(),
                    malformed: vec![validation::FieldProblem {
                        field: MODULES_FIELD.to_string(),
                        reason: e.to_string(),
                    }],
                }
            })?,
            None => deployed
                .modules
                .iter()
                .map(|m| ModuleEntry::module(m.as_str()))
                .collect(),
        };

        Ok(StartPageState {
            name: self.manifest.name.clone(),
            project_url: self.layout.project_url(&self.key()),
            operations: self.layout.operations.clone(),
            available_modules,
            visualisations: Default::default(),
        })
    }

    fn existing_dir(&self) -> Option<&Path> {
        self.project_dir.as_deref().filter(|d| d.is_dir())
    }

    fn require_dir(&self, action: &'static str) -> Result<&Path, ProjectError> {
        self.existing_dir().ok_or_else(|| self.invalid_state(action))
    }

    fn invalid_state(&self, action: &'static str) -> ProjectError {
        ProjectError::InvalidState {
            key: self.key(),
            state: self.state,
            action,
        }
    }
}

/// Version names become directory and file names
fn check_version_name(name: &str) -> Result<(), ProjectError> {
    if name.is_empty() || name.starts_with('.') || name.contains(['/', '\\']) {
        return Err(DeployError::InvalidName(name.to_string()).into());
    }
    Ok(())
}

fn check_module_id(module: &str) -> Result<(), ProjectError> {
    let reserved = REQUIRED_FIELDS.contains(&module)
        || matches!(module, "_id" | "content" | MODULES_FIELD);
    if module.is_empty() || reserved || module.contains(['/', '\\']) || module.starts_with('.') {
        return Err(ProjectError::InvalidModule(module.to_string()));
    }
    Ok(())
}

fn write_manifest_file(dir: &Path, manifest: &Manifest) -> Result<(), ProjectError> {
    let path = dir.join(MANIFEST_FILE);
    let document = serde_json::to_string_pretty(manifest)?;
    fs_util::write_atomic(&path, document.as_bytes())
        .map_err(|source| ProjectError::Io { path, source })
}
