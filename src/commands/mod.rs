//! CLI commands for projkit

use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde_json::{json, Value};

use crate::clock::SystemClock;
use crate::config::{Config, ProjkitPaths};
use crate::models::{Contributor, ProjectKey, PROJECTS_METAPATH};
use crate::project::{Checkpoint, Project, ProjectLayout, MANIFEST_FILE};
use crate::startpage;
use crate::store::{ManifestKey, ManifestQuery, ManifestStore, SqliteStore};
use crate::validation;

#[derive(Debug, Clone, Copy)]
pub enum OutputFormat {
    Json,
    Summary,
}

/// Arguments for `projkit new`
#[derive(Debug, Clone, Default)]
pub struct NewProject {
    pub key: String,
    pub title: Option<String>,
    pub contributors: Vec<String>,
    pub template: Option<String>,
    pub manifest_file: Option<String>,
    pub no_save: bool,
}

/// Everything a command needs once projkit is initialized
struct Workspace {
    config: Config,
    store: SqliteStore,
    layout: ProjectLayout,
}

impl Workspace {
    fn open(paths: &ProjkitPaths) -> Result<Self> {
        ensure_initialized(paths)?;
        let config = paths.load_config()?;
        let paths = paths.clone().with_overrides(&config.dirs);
        let store = SqliteStore::open(&paths.db_file).context("Failed to open project store")?;
        let layout = ProjectLayout::from_config(&paths, &config);
        Ok(Self {
            config,
            store,
            layout,
        })
    }

    /// Resolve `<namespace>/<name>`: the workspace directory wins, the store
    /// is the fallback
    fn project(&self, key: &str) -> Result<Project> {
        let key = parse_key(key)?;
        let dir = self.layout.project_dir(&key);
        if dir.join(MANIFEST_FILE).is_file() {
            return Project::open(&dir, self.layout.clone())
                .with_context(|| format!("Failed to open project at {}", dir.display()));
        }
        Project::load(&self.store, &ManifestKey::Name(key.clone()), self.layout.clone())?
            .with_context(|| format!("Project not found: {}", key))
    }

    /// Write back to the store when the project has been saved before
    fn sync(&self, project: &mut Project) -> Result<()> {
        if project.id().is_some() {
            project.save(&self.store)?;
        }
        Ok(())
    }
}

/// Initialize projkit for first-time setup
pub fn init(paths: &ProjkitPaths) -> Result<()> {
    if paths.is_initialized() {
        println!("projkit is already initialized at {}", paths.root.display());
        return Ok(());
    }

    println!("Initializing projkit at {}...", paths.root.display());

    paths.ensure_dirs()?;
    println!("  Created directory structure");

    let config = Config::default();
    paths.save_config(&config)?;
    println!("  Created config.toml");

    SqliteStore::open(&paths.db_file).context("Failed to create project store")?;
    println!("  Created project store");

    if seed_base_template(&paths.templates.join(&config.default_template))? {
        println!("  Seeded '{}' template", config.default_template);
    }

    println!();
    println!("projkit initialized successfully!");
    println!();
    println!("Next steps:");
    println!("  projkit new <namespace>/<name>   Create and deploy a project");
    println!("  projkit list                     List saved projects");

    Ok(())
}

/// Create, deploy and (unless told otherwise) save a project
pub fn new_project(paths: &ProjkitPaths, args: &NewProject) -> Result<String> {
    let ws = Workspace::open(paths)?;
    let key = parse_key(&args.key)?;

    let mut stub = match &args.manifest_file {
        Some(file) => {
            let content = fs::read_to_string(file)
                .with_context(|| format!("Failed to read manifest file {}", file))?;
            serde_json::from_str::<Value>(&content)
                .with_context(|| format!("Failed to parse manifest file {}", file))?
        }
        None => json!({
            "metapath": PROJECTS_METAPATH,
            "contributors": [],
            "db-query": {},
        }),
    };

    let Some(obj) = stub.as_object_mut() else {
        bail!("Manifest must be a JSON object");
    };
    obj.insert("name".into(), json!(key.name));
    obj.insert("namespace".into(), json!(key.namespace));
    if let Some(title) = &args.title {
        obj.insert("title".into(), json!(title));
    } else if !obj.contains_key("title") {
        obj.insert("title".into(), json!(key.name));
    }
    if !args.contributors.is_empty() {
        let contributors: Vec<Contributor> =
            args.contributors.iter().map(Contributor::named).collect();
        obj.insert("contributors".into(), serde_json::to_value(contributors)?);
    }

    if ws.store.find_one(&ManifestQuery::by_key(&key))?.is_some() {
        bail!("Project {} already exists in the store", key);
    }

    let template = args
        .template
        .as_deref()
        .unwrap_or(&ws.config.default_template);
    let mut project = Project::create(&stub, ws.layout.clone(), template, &SystemClock)?;

    println!("Created project: {}", key);
    if let Some(dir) = project.project_dir() {
        println!("  Directory: {}", dir.display());
    }
    println!("  Template:  {}", template);

    if args.no_save {
        println!("  Not saved (use `projkit save {}`)", key);
        return Ok(key.to_string());
    }

    let id = project.save(&ws.store)?;
    println!("  Saved:     {}", id);
    Ok(id.to_string())
}

/// Show a project
pub fn show(paths: &ProjkitPaths, key: &str, format: OutputFormat) -> Result<()> {
    let ws = Workspace::open(paths)?;
    let project = ws.project(key)?;

    match format {
        OutputFormat::Json => project.print_manifest()?,
        OutputFormat::Summary => print_project_summary(&project),
    }
    Ok(())
}

fn print_project_summary(project: &Project) {
    let m = project.manifest();

    println!("Project: {}", m.key());
    println!("{}", "=".repeat(50));
    println!("Title:    {}", m.title);
    println!(
        "Id:       {}",
        m.id.as_ref().map(|id| id.as_str()).unwrap_or("(not saved)")
    );
    println!("State:    {}", project.state());
    if let Some(dir) = project.project_dir() {
        println!("Dir:      {}", dir.display());
    }

    if !m.contributors.is_empty() {
        println!();
        println!("Contributors: {}", m.contributors.len());
        for c in &m.contributors {
            let role = c.role.as_deref().map(|r| format!(" ({})", r)).unwrap_or_default();
            let title = c.title.as_deref().or(c.email.as_deref()).unwrap_or("?");
            println!("  {}{}", title, role);
        }
    }

    if let Some(latest) = m.latest_version() {
        println!();
        println!("Versions: {}", m.content.len());
        println!("  Latest: {}", latest.version_name);
    }
}

/// Validate a project's manifest
pub fn validate(paths: &ProjkitPaths, key: &str, strict: bool) -> Result<()> {
    let ws = Workspace::open(paths)?;
    let project = ws.project(key)?;

    println!("Validating project: {}", project.key());
    println!();

    print!("Manifest validation... ");
    match validation::validate_manifest(project.manifest()) {
        Ok(()) => println!("✓ passed"),
        Err(e) => {
            println!("✗ failed");
            println!("{}", e);
            bail!("Manifest validation failed");
        }
    }

    print!("Linting... ");
    let warnings = validation::lint_manifest(project.manifest(), project.project_dir());
    if warnings.is_empty() {
        println!("✓ no warnings");
    } else {
        println!("⚠ {} warning(s)", warnings.len());
        for warning in &warnings {
            println!("  ⚠ {}", warning);
        }
        if strict {
            bail!("Validation failed in strict mode due to warnings");
        }
    }

    println!();
    println!("Validation complete!");
    Ok(())
}

/// Push the working manifest to the store
pub fn save(paths: &ProjkitPaths, key: &str) -> Result<()> {
    let ws = Workspace::open(paths)?;
    let mut project = ws.project(key)?;
    let id = project.save(&ws.store)?;
    println!("✓ Saved {} as {}", project.key(), id);
    Ok(())
}

/// Copy a project under a new name and save the copy
pub fn save_as(
    paths: &ProjkitPaths,
    key: &str,
    new_name: &str,
    new_namespace: Option<&str>,
) -> Result<()> {
    let ws = Workspace::open(paths)?;
    let project = ws.project(key)?;

    let new_key = ProjectKey::new(new_namespace.unwrap_or(&project.manifest().namespace), new_name);
    if ws.store.find_one(&ManifestQuery::by_key(&new_key))?.is_some() {
        bail!("Project {} already exists in the store", new_key);
    }

    let mut copy = project.save_as(new_name, new_namespace, &SystemClock)?;
    let id = copy.save(&ws.store)?;

    println!("✓ Copied {} → {}", project.key(), copy.key());
    if let Some(dir) = copy.project_dir() {
        println!("  Directory: {}", dir.display());
    }
    println!("  Saved:     {}", id);
    Ok(())
}

/// Remove a project from the store, and optionally its directory
pub fn delete(paths: &ProjkitPaths, key: &str, purge: bool) -> Result<()> {
    let ws = Workspace::open(paths)?;
    let project = ws.project(key)?;

    if project.delete(&ws.store)? {
        println!("✓ Deleted {} from the store", project.key());
    } else {
        println!("{} was not in the store", project.key());
    }

    if purge {
        if let Some(dir) = project.project_dir().filter(|d| d.is_dir()) {
            fs::remove_dir_all(dir)
                .with_context(|| format!("Failed to remove {}", dir.display()))?;
            println!("✓ Removed {}", dir.display());
        }
    }
    Ok(())
}

/// List saved projects
pub fn list(paths: &ProjkitPaths, namespace: Option<&str>) -> Result<()> {
    let ws = Workspace::open(paths)?;
    let query = match namespace {
        Some(ns) => ManifestQuery::all().in_namespace(ns),
        None => ManifestQuery::all(),
    };
    let manifests = ws.store.find(&query)?;

    if manifests.is_empty() {
        println!("No projects found.");
        println!("Create one with: projkit new <namespace>/<name>");
        return Ok(());
    }

    println!(
        "{:<20} {:<20} {:<28} {:<8}",
        "NAMESPACE", "NAME", "TITLE", "VERSIONS"
    );
    println!("{}", "-".repeat(79));

    for m in manifests {
        println!(
            "{:<20} {:<20} {:<28} {:<8}",
            truncate(&m.namespace, 18),
            truncate(&m.name, 18),
            truncate(&m.title, 26),
            m.content.len()
        );
    }
    Ok(())
}

/// Record a new version
pub fn version(paths: &ProjkitPaths, key: &str, name: Option<&str>) -> Result<()> {
    let ws = Workspace::open(paths)?;
    let mut project = ws.project(key)?;

    let record = project.append_version(&SystemClock, name.map(str::to_string))?;
    ws.sync(&mut project)?;
    println!("✓ Version {}: {}", record.version_number, record.version_name);
    Ok(())
}

/// List a project's versions
pub fn versions(paths: &ProjkitPaths, key: &str) -> Result<()> {
    let ws = Workspace::open(paths)?;
    let project = ws.project(key)?;
    let content = &project.manifest().content;

    if content.is_empty() {
        println!("No versions recorded for {}", project.key());
        return Ok(());
    }

    println!("{:<6} {:<16} {:<12} {}", "NUM", "DATE", "WORKFLOW", "NAME");
    println!("{}", "-".repeat(70));
    for v in content {
        let archived = if v.version_zipfile.is_some() { " (archived)" } else { "" };
        println!(
            "{:<6} {:<16} {:<12} {}{}",
            v.version_number,
            v.version_date,
            truncate(v.version_workflow.as_deref().unwrap_or("-"), 10),
            v.version_name,
            archived
        );
    }
    Ok(())
}

/// Archive the project directory, recording a new version if it changed
pub fn checkpoint(paths: &ProjkitPaths, key: &str) -> Result<()> {
    let ws = Workspace::open(paths)?;
    let mut project = ws.project(key)?;

    let outcome = project.checkpoint(&SystemClock)?;
    ws.sync(&mut project)?;
    let record = outcome.record();
    match &outcome {
        Checkpoint::Unchanged(_) => {
            println!("No changes since version {}", record.version_number)
        }
        Checkpoint::Archived(_) => {
            println!("✓ Archived version {}: {}", record.version_number, record.version_name)
        }
        Checkpoint::Bumped(_) => {
            println!("✓ New version {}: {}", record.version_number, record.version_name)
        }
    }
    Ok(())
}

/// Put a stored version into the workspace, or start the next version from
/// the latest archive
pub fn launch(paths: &ProjkitPaths, key: &str, version: Option<u64>, next: bool) -> Result<()> {
    let ws = Workspace::open(paths)?;
    let mut project = ws.project(key)?;

    if next {
        let record = project.launch_next(&SystemClock)?;
        ws.sync(&mut project)?;
        println!("✓ Started version {}: {}", record.version_number, record.version_name);
        if let Some(dir) = project.project_dir() {
            println!("  Directory: {}", dir.display());
        }
    } else {
        let dir = project.launch(version)?;
        println!("✓ Launched {} at {}", project.key(), dir.display());
    }
    Ok(())
}

/// Delete a version record and its archive
pub fn delete_version(paths: &ProjkitPaths, key: &str, number: u64) -> Result<()> {
    let ws = Workspace::open(paths)?;
    let mut project = ws.project(key)?;
    let record = project.delete_version(number, &ws.store)?;
    println!("✓ Deleted version {} ({}) of {}", number, record.version_name, project.key());
    Ok(())
}

/// Record module output on a project
pub fn module(
    paths: &ProjkitPaths,
    key: &str,
    module: &str,
    fields: Option<&str>,
    url: Option<&str>,
    clear: bool,
) -> Result<()> {
    let ws = Workspace::open(paths)?;
    let mut project = ws.project(key)?;

    let fields: Option<Value> = fields
        .map(|f| serde_json::from_str(f).context("--fields must be a JSON object"))
        .transpose()?;
    if fields.as_ref().is_some_and(|f| !f.is_object()) {
        bail!("--fields must be a JSON object");
    }

    project.record_module_output(module, fields.as_ref(), url)?;
    if clear {
        project.clear_visualisation(module)?;
    }
    ws.sync(&mut project)?;

    println!("✓ Recorded output for module {} on {}", module, project.key());
    Ok(())
}

/// Show the start-page state and check the rendered page against it
pub fn start(paths: &ProjkitPaths, key: &str, format: OutputFormat) -> Result<()> {
    let ws = Workspace::open(paths)?;
    let project = ws.project(key)?;
    let state = project.start_page()?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&state)?),
        OutputFormat::Summary => {
            println!("Start page: {}", state.name);
            println!("{}", "=".repeat(50));
            println!("URL:        {}", state.project_url);
            println!("Operations: {}", state.operations.join(", "));
            println!("Modules:    {}", state.module_ids().join(", "));
            for (module, url) in &state.visualisations {
                println!("  {} → {}", module, url);
            }
        }
    }

    if let Some(dir) = project.project_dir() {
        let page_path = startpage::page_path(dir);
        let page = fs::read_to_string(&page_path)
            .with_context(|| format!("Failed to read {}", page_path.display()))?;
        let drift = startpage::verify_page(&page, &state);
        if !drift.is_clean() {
            println!();
            for id in &drift.unknown {
                println!("⚠ page shows unknown element {}", id);
            }
            for id in &drift.missing {
                println!("⚠ page is missing element {}", id);
            }
            println!("Run `projkit start {} --sync` to regenerate it", project.key());
        }
    }
    Ok(())
}

/// Regenerate the start page from the manifest
pub fn sync_start(paths: &ProjkitPaths, key: &str) -> Result<()> {
    let ws = Workspace::open(paths)?;
    let project = ws.project(key)?;
    project.sync_start_page()?;
    println!("✓ Regenerated start page for {}", project.key());
    Ok(())
}

/// Export a version to the temp directory, as a folder or a zip archive
pub fn export(paths: &ProjkitPaths, key: &str, version: Option<u64>, zip: bool) -> Result<()> {
    let ws = Workspace::open(paths)?;
    let project = ws.project(key)?;
    let out = if zip {
        project.export_zip(version)?
    } else {
        project.export(version)?
    };
    println!("✓ Exported {} to {}", project.key(), out.display());
    Ok(())
}

/// Copy a module folder from the project's template into the project
pub fn redeploy_module(paths: &ProjkitPaths, key: &str, module: &str) -> Result<()> {
    let ws = Workspace::open(paths)?;
    let mut project = ws.project(key)?;
    let result = project.deploy_module(module, &SystemClock)?;
    println!(
        "✓ Deployed module {} ({} files) to {}",
        module,
        result.files_copied,
        result.target.display()
    );
    Ok(())
}

/// List the available templates and their modules
pub fn templates(paths: &ProjkitPaths) -> Result<()> {
    let ws = Workspace::open(paths)?;
    let deployer = ws.layout.deployer();
    let names = deployer
        .list_templates()
        .context("Failed to read templates directory")?;

    if names.is_empty() {
        println!("No templates in {}", deployer.templates_dir().display());
        return Ok(());
    }
    for name in names {
        let modules = deployer.template_modules(&name)?;
        println!("{:<20} {}", name, modules.join(", "));
    }
    Ok(())
}

fn parse_key(key: &str) -> Result<ProjectKey> {
    key.parse::<ProjectKey>()
        .map_err(|e| anyhow::anyhow!(e))
        .with_context(|| format!("Projects are addressed as <namespace>/<name>, got '{}'", key))
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let head: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}

fn ensure_initialized(paths: &ProjkitPaths) -> Result<()> {
    if !paths.is_initialized() {
        bail!("projkit not initialized. Run `projkit init` first.");
    }
    Ok(())
}

const BASE_START_TEMPLATE: &str = r#"<!DOCTYPE html>
<html>
<head><title>{{ title }}</title></head>
<body>
<h1>{{ title }}</h1>
<p>Project {{ namespace }}/{{ name }}, created {{ created }}.</p>
<!-- projkit:start-page -->
<!-- /projkit:start-page -->
</body>
</html>
"#;

const BASE_MODULE_README: &str = "Topic modeling for {{ name }}.\n\nOutputs go in this folder.\n";

/// Write a minimal `base` template unless one exists. Returns whether it wrote.
fn seed_base_template(dir: &Path) -> Result<bool> {
    if dir.exists() {
        return Ok(false);
    }
    let module = dir.join("topic_modeling");
    fs::create_dir_all(&module).context("Failed to create base template")?;
    fs::write(dir.join("start_template"), BASE_START_TEMPLATE)
        .context("Failed to write start_template")?;
    fs::write(module.join("README.md"), BASE_MODULE_README)
        .context("Failed to write module README")?;
    Ok(true)
}
