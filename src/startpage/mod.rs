//! Start-page state manager
//!
//! The state record (`start_state.json`) is the single source of truth for
//! the project's start page. The rendered region of the live `start` file is
//! regenerated from it in full on every write; nothing edits the page
//! element by element.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use jsonschema::JSONSchema;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::deploy::START_FILE;
use crate::fs_util;
use crate::models::{ModuleEntry, StartPageState};

/// State record inside the project directory
pub const STATE_FILE: &str = "start_state.json";

pub const REGION_BEGIN: &str = "<!-- projkit:start-page -->";
pub const REGION_END: &str = "<!-- /projkit:start-page -->";

static STATE_SCHEMA: Lazy<Value> = Lazy::new(|| {
    json!({
        "type": "object",
        "required": ["name", "project_url"],
        "properties": {
            "name": {"type": "string"},
            "project_url": {"type": "string"},
            "operations": {"type": "array", "items": {"type": "string"}},
            "available_modules": {
                "type": "array",
                "items": {
                    "oneOf": [
                        {"type": "string"},
                        {
                            "type": "object",
                            "minProperties": 1,
                            "maxProperties": 1,
                            "additionalProperties": {"type": "array", "items": {"type": "string"}}
                        }
                    ]
                }
            },
            "visualisations": {
                "type": "array",
                "items": {
                    "type": "object",
                    "minProperties": 1,
                    "maxProperties": 1,
                    "additionalProperties": {"type": "string"}
                }
            }
        }
    })
});

static ID_ATTR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"\bid="([^"]*)""#).expect("id attribute pattern"));

#[derive(Debug, thiserror::Error)]
pub enum StartPageError {
    #[error("Failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Start-page state at {path} failed schema validation:\n{errors}")]
    Schema { path: PathBuf, errors: String },
}

/// A partial update. `None` leaves a field alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartPagePatch {
    pub name: Option<String>,
    pub project_url: Option<String>,
    pub operations: Option<Vec<String>>,
    pub available_modules: Option<Vec<ModuleEntry>>,
    /// Per-module URL; `None` removes the module's visualisation
    pub visualisations: BTreeMap<String, Option<String>>,
}

impl StartPagePatch {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn project_url(mut self, url: impl Into<String>) -> Self {
        self.project_url = Some(url.into());
        self
    }

    pub fn operations(mut self, operations: Vec<String>) -> Self {
        self.operations = Some(operations);
        self
    }

    pub fn available_modules(mut self, modules: Vec<ModuleEntry>) -> Self {
        self.available_modules = Some(modules);
        self
    }

    pub fn visualisation(mut self, module: impl Into<String>, url: impl Into<String>) -> Self {
        self.visualisations.insert(module.into(), Some(url.into()));
        self
    }

    pub fn remove_visualisation(mut self, module: impl Into<String>) -> Self {
        self.visualisations.insert(module.into(), None);
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Merge into `state`
    pub fn apply(&self, state: &mut StartPageState) {
        if let Some(name) = &self.name {
            state.name = name.clone();
        }
        if let Some(url) = &self.project_url {
            state.project_url = url.clone();
        }
        if let Some(ops) = &self.operations {
            state.operations = ops.clone();
        }
        if let Some(modules) = &self.available_modules {
            state.available_modules = modules.clone();
        }
        for (module, url) in &self.visualisations {
            match url {
                Some(url) => {
                    state.visualisations.insert(module.clone(), url.clone());
                }
                None => {
                    state.visualisations.remove(module);
                }
            }
        }
    }
}

/// Ids present on one side only
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageDrift {
    /// Rendered ids with no backing state key
    pub unknown: Vec<String>,
    /// State keys the page does not show
    pub missing: Vec<String>,
}

impl PageDrift {
    pub fn is_clean(&self) -> bool {
        self.unknown.is_empty() && self.missing.is_empty()
    }
}

pub fn state_path(project_dir: &Path) -> PathBuf {
    project_dir.join(STATE_FILE)
}

pub fn page_path(project_dir: &Path) -> PathBuf {
    project_dir.join(START_FILE)
}

/// Read and schema-check the state record
pub fn load(project_dir: &Path) -> Result<StartPageState, StartPageError> {
    let path = state_path(project_dir);
    let content = fs::read_to_string(&path).map_err(|source| StartPageError::Io {
        path: path.clone(),
        source,
    })?;
    let value: Value = serde_json::from_str(&content).map_err(|source| StartPageError::Parse {
        path: path.clone(),
        source,
    })?;
    check_schema(&path, &value)?;
    serde_json::from_value(value).map_err(|source| StartPageError::Parse { path, source })
}

/// Write the state record and regenerate the page from it
pub fn save(project_dir: &Path, state: &StartPageState) -> Result<(), StartPageError> {
    let state_file = state_path(project_dir);
    let page_file = page_path(project_dir);

    let state_json = serde_json::to_string_pretty(state).map_err(|source| {
        StartPageError::Parse {
            path: state_file.clone(),
            source,
        }
    })?;
    let shell = match fs::read_to_string(&page_file) {
        Ok(s) => s,
        Err(e) if e.kind() == io::ErrorKind::NotFound => String::new(),
        Err(source) => {
            return Err(StartPageError::Io {
                path: page_file,
                source,
            })
        }
    };
    let page = render_page(&shell, state);

    // Both documents are fully built before either file is replaced
    commit(&state_file, state_json.as_bytes(), &page_file, page.as_bytes())?;

    debug!(project = %project_dir.display(), "start page written");
    Ok(())
}

/// Replace the state file, then the page. If the page cannot be written the
/// previous state file is put back, so state and page never disagree.
fn commit(
    state_file: &Path,
    state: &[u8],
    page_file: &Path,
    page: &[u8],
) -> Result<(), StartPageError> {
    let previous = match fs::read(state_file) {
        Ok(bytes) => Some(bytes),
        Err(e) if e.kind() == io::ErrorKind::NotFound => None,
        Err(source) => {
            return Err(StartPageError::Io {
                path: state_file.to_path_buf(),
                source,
            })
        }
    };

    write_atomic(state_file, state)?;
    if let Err(e) = write_atomic(page_file, page) {
        let restored = match &previous {
            Some(bytes) => fs_util::write_atomic(state_file, bytes),
            None => fs::remove_file(state_file),
        };
        if let Err(restore) = restored {
            warn!(path = %state_file.display(), error = %restore, "could not restore start page state");
        }
        return Err(e);
    }
    Ok(())
}

/// Merge `patch` into the persisted state and rewrite state and page
pub fn update_fields(
    project_dir: &Path,
    patch: &StartPagePatch,
) -> Result<StartPageState, StartPageError> {
    let mut state = load(project_dir)?;
    patch.apply(&mut state);
    save(project_dir, &state)?;
    info!(project = %project_dir.display(), "start page updated");
    Ok(state)
}

/// Every UI element id the rendered page carries for `state`
pub fn element_ids(state: &StartPageState) -> Vec<String> {
    let mut ids = vec![
        "project-name".to_string(),
        "project-url".to_string(),
        "operations".to_string(),
    ];
    ids.extend(state.operations.iter().map(|op| format!("op-{}", op)));
    ids.push("available-modules".to_string());
    for entry in &state.available_modules {
        match entry {
            ModuleEntry::Module(id) => ids.push(format!("module-{}", id)),
            ModuleEntry::Group { name, modules } => {
                ids.push(format!("group-{}", name));
                ids.extend(modules.iter().map(|m| format!("module-{}", m)));
            }
        }
    }
    ids.push("visualisations".to_string());
    ids.extend(state.visualisations.keys().map(|m| format!("vis-{}", m)));
    ids
}

/// The generated region, markers included
pub fn render_region(state: &StartPageState) -> String {
    let mut out = String::new();
    out.push_str(REGION_BEGIN);
    out.push('\n');
    out.push_str(&format!(
        "<h1 id=\"project-name\">{}</h1>\n",
        escape(&state.name)
    ));
    out.push_str(&format!(
        "<p><a id=\"project-url\" href=\"{url}\">{url}</a></p>\n",
        url = escape(&state.project_url)
    ));

    out.push_str("<ul id=\"operations\">\n");
    for op in &state.operations {
        out.push_str(&format!(
            "  <li id=\"op-{id}\">{id}</li>\n",
            id = escape(op)
        ));
    }
    out.push_str("</ul>\n");

    out.push_str("<ul id=\"available-modules\">\n");
    for entry in &state.available_modules {
        match entry {
            ModuleEntry::Module(id) => {
                out.push_str(&format!("  <li id=\"module-{id}\">{id}</li>\n", id = escape(id)));
            }
            ModuleEntry::Group { name, modules } => {
                out.push_str(&format!(
                    "  <li id=\"group-{name}\">{name}\n    <ul>\n",
                    name = escape(name)
                ));
                for m in modules {
                    out.push_str(&format!(
                        "      <li id=\"module-{id}\">{id}</li>\n",
                        id = escape(m)
                    ));
                }
                out.push_str("    </ul>\n  </li>\n");
            }
        }
    }
    out.push_str("</ul>\n");

    out.push_str("<ul id=\"visualisations\">\n");
    for (module, url) in &state.visualisations {
        out.push_str(&format!(
            "  <li id=\"vis-{id}\"><a href=\"{url}\">{id}</a></li>\n",
            id = escape(module),
            url = escape(url)
        ));
    }
    out.push_str("</ul>\n");
    out.push_str(REGION_END);
    out
}

/// Replace the generated region of `shell`, or append one if it has none
pub fn render_page(shell: &str, state: &StartPageState) -> String {
    let region = render_region(state);
    if let Some((before, after)) = split_region(shell) {
        return format!("{}{}{}", before, region, after);
    }
    let mut page = shell.to_string();
    if !page.is_empty() && !page.ends_with('\n') {
        page.push('\n');
    }
    page.push_str(&region);
    page.push('\n');
    page
}

/// Compare the ids in a rendered page with the ones `state` backs
pub fn verify_page(page: &str, state: &StartPageState) -> PageDrift {
    let region = split_region(page)
        .map(|(before, after)| &page[before.len()..page.len() - after.len()])
        .unwrap_or(page);

    let rendered: BTreeSet<String> = ID_ATTR_RE
        .captures_iter(region)
        .map(|c| c[1].to_string())
        .collect();
    let expected: BTreeSet<String> = element_ids(state).iter().map(|id| escape(id)).collect();

    PageDrift {
        unknown: rendered.difference(&expected).cloned().collect(),
        missing: expected.difference(&rendered).cloned().collect(),
    }
}

/// Text before the begin marker and after the end marker
fn split_region(page: &str) -> Option<(&str, &str)> {
    let start = page.find(REGION_BEGIN)?;
    let end_rel = page[start..].find(REGION_END)?;
    let end = start + end_rel + REGION_END.len();
    Some((&page[..start], &page[end..]))
}

fn check_schema(path: &Path, value: &Value) -> Result<(), StartPageError> {
    let compiled = JSONSchema::compile(&STATE_SCHEMA).map_err(|e| StartPageError::Schema {
        path: path.to_path_buf(),
        errors: e.to_string(),
    })?;
    if let Err(errors) = compiled.validate(value) {
        let messages: Vec<String> = errors.map(|e| e.to_string()).collect();
        return Err(StartPageError::Schema {
            path: path.to_path_buf(),
            errors: messages.join("\n"),
        });
    }
    Ok(())
}

fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), StartPageError> {
    fs_util::write_atomic(path, contents).map_err(|source| StartPageError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_state() -> StartPageState {
        StartPageState {
            name: "proj1".to_string(),
            project_url: "http://localhost/proj1".to_string(),
            operations: vec!["save".into(), "export".into()],
            available_modules: vec![
                ModuleEntry::module("topic_modeling"),
                ModuleEntry::group("dfr_browser", vec!["pyldavis".into()]),
            ],
            visualisations: BTreeMap::new(),
        }
    }

    fn project_with_state(state: &StartPageState) -> TempDir {
        let tmp = TempDir::new().unwrap();
        fs::write(
            page_path(tmp.path()),
            format!("<html><body>\n{}\n{}\n</body></html>\n", REGION_BEGIN, REGION_END),
        )
        .unwrap();
        save(tmp.path(), state).unwrap();
        tmp
    }

    #[test]
    fn test_save_then_load() {
        let state = sample_state();
        let tmp = project_with_state(&state);
        assert_eq!(load(tmp.path()).unwrap(), state);

        let page = fs::read_to_string(page_path(tmp.path())).unwrap();
        assert!(page.starts_with("<html><body>\n"));
        assert!(page.ends_with("\n</body></html>\n"));
        assert!(verify_page(&page, &state).is_clean());
    }

    #[test]
    fn test_update_regenerates_whole_region() {
        let tmp = project_with_state(&sample_state());

        let patch = StartPagePatch::default().visualisation("topic_modeling", "http://viz/tm");
        let state = update_fields(tmp.path(), &patch).unwrap();

        let page = fs::read_to_string(page_path(tmp.path())).unwrap();
        assert!(page.contains("id=\"vis-topic_modeling\""));
        assert_eq!(page.matches(REGION_BEGIN).count(), 1);
        assert!(verify_page(&page, &state).is_clean());

        let state = update_fields(
            tmp.path(),
            &StartPagePatch::default().remove_visualisation("topic_modeling"),
        )
        .unwrap();
        let page = fs::read_to_string(page_path(tmp.path())).unwrap();
        assert!(!page.contains("vis-topic_modeling"));
        assert!(verify_page(&page, &state).is_clean());
    }

    #[test]
    fn test_page_write_failure_restores_state() {
        let state = sample_state();
        let tmp = project_with_state(&state);
        let before = fs::read(state_path(tmp.path())).unwrap();

        // A non-empty directory where the page should go cannot be replaced
        let blocked = tmp.path().join("blocked");
        fs::create_dir_all(blocked.join("inner")).unwrap();

        let err = commit(&state_path(tmp.path()), b"{\"name\":\"new\"}", &blocked, b"page")
            .unwrap_err();
        assert!(matches!(err, StartPageError::Io { .. }));
        assert_eq!(fs::read(state_path(tmp.path())).unwrap(), before);
        assert_eq!(load(tmp.path()).unwrap(), state);
    }

    #[test]
    fn test_page_write_failure_removes_new_state() {
        let tmp = TempDir::new().unwrap();
        let blocked = tmp.path().join("blocked");
        fs::create_dir_all(blocked.join("inner")).unwrap();

        assert!(commit(&state_path(tmp.path()), b"{}", &blocked, b"page").is_err());
        assert!(!state_path(tmp.path()).exists());
    }

    #[test]
    fn test_disjoint_patches_commute() {
        let a = StartPagePatch::default().visualisation("topic_modeling", "http://a");
        let b = StartPagePatch::default()
            .name("renamed")
            .visualisation("pyldavis", "http://b");

        let first = project_with_state(&sample_state());
        update_fields(first.path(), &a).unwrap();
        update_fields(first.path(), &b).unwrap();

        let second = project_with_state(&sample_state());
        update_fields(second.path(), &b).unwrap();
        update_fields(second.path(), &a).unwrap();

        assert_eq!(load(first.path()).unwrap(), load(second.path()).unwrap());
        assert_eq!(
            fs::read_to_string(state_path(first.path())).unwrap(),
            fs::read_to_string(state_path(second.path())).unwrap()
        );
    }

    #[test]
    fn test_same_key_last_write_wins() {
        let tmp = project_with_state(&sample_state());
        let patch = StartPagePatch::default().visualisation("topic_modeling", "http://one");
        update_fields(tmp.path(), &patch).unwrap();
        let once = load(tmp.path()).unwrap();
        update_fields(tmp.path(), &patch).unwrap();
        assert_eq!(load(tmp.path()).unwrap(), once);

        update_fields(
            tmp.path(),
            &StartPagePatch::default().visualisation("topic_modeling", "http://two"),
        )
        .unwrap();
        assert_eq!(
            load(tmp.path()).unwrap().visualisations["topic_modeling"],
            "http://two"
        );
    }

    #[test]
    fn test_page_without_markers_gets_region_appended() {
        let page = render_page("<p>intro</p>", &sample_state());
        assert!(page.starts_with("<p>intro</p>\n"));
        assert!(page.contains(REGION_BEGIN));
        assert!(page.trim_end().ends_with(REGION_END));
    }

    #[test]
    fn test_schema_rejects_bad_state() {
        let tmp = TempDir::new().unwrap();
        fs::write(
            state_path(tmp.path()),
            r#"{"name": "p", "project_url": "u", "visualisations": [{"a": 1}]}"#,
        )
        .unwrap();
        assert!(matches!(
            load(tmp.path()),
            Err(StartPageError::Schema { .. })
        ));
    }

    #[test]
    fn test_verify_page_reports_drift() {
        let state = sample_state();
        let page = format!(
            "{}\n<div id=\"stray\"></div>\n{}",
            REGION_BEGIN, REGION_END
        );
        let drift = verify_page(&page, &state);
        assert_eq!(drift.unknown, vec!["stray".to_string()]);
        assert!(drift.missing.contains(&"project-name".to_string()));
    }

    #[test]
    fn test_escaping_in_rendered_ids() {
        let mut state = sample_state();
        state.operations.push("a\"b".into());
        let page = render_page("", &state);
        assert!(page.contains("op-a&quot;b"));
        assert!(verify_page(&page, &state).is_clean());
    }
}
