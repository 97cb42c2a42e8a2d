//! Data models for projkit
//!
//! The manifest is the canonical JSON document stored in the project
//! collection and mirrored to `datapackage.json` inside the project folder.
//! Required fields are typed; anything else rides along in `extra`.

pub mod start_page;

pub use start_page::{ModuleEntry, StartPageState};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::clock::Clock;

/// The only metapath a project manifest may carry
pub const PROJECTS_METAPATH: &str = "Projects";

/// Ad hoc keys with this prefix are form scratch data and never exported
pub const BUILDER_PREFIX: &str = "builder_";

/// Store-assigned identifier. Opaque to everything but the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ManifestId(pub String);

impl ManifestId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ManifestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ManifestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The external identity of a project, stable across persistence
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProjectKey {
    pub namespace: String,
    pub name: String,
}

impl ProjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for ProjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl std::str::FromStr for ProjectKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((ns, name)) if !ns.is_empty() && !name.is_empty() && !name.contains('/') => {
                Ok(ProjectKey::new(ns, name))
            }
            _ => Err(format!("Invalid project key: {}. Use: <namespace>/<name>", s)),
        }
    }
}

/// A person credited on the project
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Contributor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Contributor {
    pub fn named(title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            ..Default::default()
        }
    }
}

/// One entry of the manifest's `content` sequence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionRecord {
    pub version_date: String,
    pub version_number: u64,
    pub version_name: String,
    /// Template the version's directory was deployed from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_workflow: Option<String>,
    /// Archive file name under the project's archive directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_zipfile: Option<String>,
    /// Digest of that archive
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_hash: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Which version field a lookup matches on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionKey<'a> {
    Number(u64),
    Name(&'a str),
    Date(&'a str),
}

/// The project manifest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<ManifestId>,
    pub name: String,
    pub namespace: String,
    pub metapath: String,
    pub title: String,
    pub contributors: Vec<Contributor>,
    /// Forwarded to query collaborators untouched
    #[serde(rename = "db-query")]
    pub db_query: Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub content: Vec<VersionRecord>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Manifest {
    /// Create a manifest with the required fields and nothing else
    pub fn new(
        name: impl Into<String>,
        namespace: impl Into<String>,
        title: impl Into<String>,
    ) -> Self {
        Self {
            id: None,
            name: name.into(),
            namespace: namespace.into(),
            metapath: PROJECTS_METAPATH.to_string(),
            title: title.into(),
            contributors: Vec::new(),
            db_query: Value::Object(Map::new()),
            content: Vec::new(),
            extra: Map::new(),
        }
    }

    pub fn key(&self) -> ProjectKey {
        ProjectKey::new(&self.namespace, &self.name)
    }

    /// Serialize to the store's document shape
    pub fn to_value(&self) -> serde_json::Result<Value> {
        serde_json::to_value(self)
    }

    /// Document with empty ad hoc values and `builder_` keys removed.
    /// Required fields are always kept, even when empty.
    pub fn reduced(&self) -> serde_json::Result<Value> {
        let mut reduced = self.clone();
        reduced
            .extra
            .retain(|k, v| !k.starts_with(BUILDER_PREFIX) && !is_empty_value(v));
        reduced.to_value()
    }

    /// Highest version number in `content`, 0 when there is none
    pub fn latest_version_number(&self) -> u64 {
        self.content
            .iter()
            .map(|v| v.version_number)
            .max()
            .unwrap_or(0)
    }

    pub fn latest_version(&self) -> Option<&VersionRecord> {
        self.content.iter().max_by_key(|v| v.version_number)
    }

    pub fn version(&self, number: u64) -> Option<&VersionRecord> {
        self.version_by(VersionKey::Number(number))
    }

    pub fn version_by(&self, key: VersionKey<'_>) -> Option<&VersionRecord> {
        self.content.iter().find(|v| match key {
            VersionKey::Number(n) => v.version_number == n,
            VersionKey::Name(name) => v.version_name == name,
            VersionKey::Date(date) => v.version_date == date,
        })
    }

    /// Append the next version record and return it.
    ///
    /// The number is one past the current maximum, so repeated calls never
    /// collide. `version_name` defaults to `<date>_v<number>_<name>`.
    pub fn append_version(
        &mut self,
        clock: &dyn Clock,
        version_name: Option<String>,
    ) -> &VersionRecord {
        let number = self.latest_version_number() + 1;
        let date = clock.version_date();
        let name = version_name.unwrap_or_else(|| format_version_name(&date, number, &self.name));
        let idx = self.content.len();
        self.content.push(VersionRecord {
            version_date: date,
            version_number: number,
            version_name: name,
            version_workflow: None,
            version_zipfile: None,
            version_hash: None,
            extra: Map::new(),
        });
        &self.content[idx]
    }

    /// Drop the version with the given number. Returns whether one was removed.
    pub fn remove_version(&mut self, number: u64) -> bool {
        let before = self.content.len();
        self.content.retain(|v| v.version_number != number);
        self.content.len() != before
    }

    /// Replace the version history with a single fresh version 1
    pub fn reset_versions(&mut self, clock: &dyn Clock, workflow: Option<String>) {
        let workflow = workflow.or_else(|| {
            self.latest_version()
                .and_then(|v| v.version_workflow.clone())
        });
        self.content.clear();
        self.append_version(clock, None);
        if let Some(first) = self.content.first_mut() {
            first.version_workflow = workflow;
        }
    }

    /// Module-specific fields recorded under the module id
    pub fn module_fields(&self, module: &str) -> Option<&Value> {
        self.extra.get(module)
    }
}

/// `<date>_v<number>_<name>`
pub fn format_version_name(date: &str, number: u64, name: &str) -> String {
    format!("{}_v{}_{}", date, number, name)
}

static VERSION_NAME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(.+?)_v([0-9]+)_(.+)$").expect("version name pattern")
});

/// Split a version name into date, number, and project name
pub fn parse_version_name(s: &str) -> Option<(String, u64, String)> {
    let caps = VERSION_NAME_RE.captures(s)?;
    let number = caps[2].parse().ok()?;
    Some((caps[1].to_string(), number, caps[3].to_string()))
}

fn is_empty_value(v: &Value) -> bool {
    match v {
        Value::String(s) => s.is_empty(),
        Value::Array(items) => {
            items.is_empty() || (items.len() == 1 && items[0] == Value::String(String::new()))
        }
        _ => false,
    }
}
