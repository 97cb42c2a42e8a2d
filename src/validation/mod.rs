//! Manifest validation
//!
//! `validate` turns a raw JSON document into a typed [`Manifest`] or reports
//! every problem it found at once. Nothing is coerced: a wrong `metapath` is
//! an error, not a default.

use std::collections::HashSet;
use std::path::{Component, Path};

use serde_json::Value;

use crate::models::{Manifest, PROJECTS_METAPATH};

/// Required fields in the order they are reported
pub const REQUIRED_FIELDS: [&str; 6] = [
    "name",
    "namespace",
    "metapath",
    "title",
    "contributors",
    "db-query",
];

/// Resource kinds of the data package convention. Advisory only.
pub const RESOURCE_KINDS: [&str; 4] = ["Sources", "Corpus", "Processes", "Scripts"];

/// A field that is present but unusable
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldProblem {
    pub field: String,
    pub reason: String,
}

/// Why a manifest was rejected
#[derive(Debug, Clone, PartialEq, Eq, Default, thiserror::Error)]
#[error("Invalid manifest{}", describe(.missing, .malformed))]
pub struct ValidationError {
    pub missing: Vec<String>,
    pub malformed: Vec<FieldProblem>,
}

impl ValidationError {
    pub fn is_missing(&self, field: &str) -> bool {
        self.missing.iter().any(|f| f == field)
    }

    pub fn is_malformed(&self, field: &str) -> bool {
        self.malformed.iter().any(|p| p.field == field)
    }

    fn is_empty(&self) -> bool {
        self.missing.is_empty() && self.malformed.is_empty()
    }

    fn malformed(&mut self, field: &str, reason: impl Into<String>) {
        self.malformed.push(FieldProblem {
            field: field.to_string(),
            reason: reason.into(),
        });
    }
}

fn describe(missing: &[String], malformed: &[FieldProblem]) -> String {
    let mut out = String::new();
    if !missing.is_empty() {
        out.push_str("; missing required fields: ");
        out.push_str(&missing.join(", "));
    }
    for problem in malformed {
        out.push_str(&format!("; {}: {}", problem.field, problem.reason));
    }
    out
}

/// Validate a raw manifest document
pub fn validate(raw: &Value) -> Result<Manifest, ValidationError> {
    let mut err = ValidationError::default();

    let Some(obj) = raw.as_object() else {
        err.malformed("manifest", "expected a JSON object");
        return Err(err);
    };

    for field in REQUIRED_FIELDS {
        match obj.get(field) {
            None | Some(Value::Null) => err.missing.push(field.to_string()),
            Some(Value::String(s)) if s.trim().is_empty() => err.missing.push(field.to_string()),
            Some(_) => {}
        }
    }

    for field in ["name", "namespace", "title", "metapath"] {
        if let Some(v) = obj.get(field) {
            if !v.is_null() && !v.is_string() {
                err.malformed(field, "expected a string");
            }
        }
    }

    if let Some(Value::String(metapath)) = obj.get("metapath") {
        if !metapath.trim().is_empty() && metapath != PROJECTS_METAPATH {
            err.malformed(
                "metapath",
                format!("expected \"{}\", found \"{}\"", PROJECTS_METAPATH, metapath),
            );
        }
    }

    for field in ["name", "namespace"] {
        if let Some(Value::String(s)) = obj.get(field) {
            if !s.trim().is_empty() && !is_path_segment(s) {
                err.malformed(field, "must be usable as a single directory name");
            }
        }
    }

    if let Some(v) = obj.get("contributors") {
        if !v.is_null() && !v.is_array() {
            err.malformed("contributors", "expected an array of contributor records");
        }
    }

    if let Some(v) = obj.get("_id") {
        if !v.is_string() {
            err.malformed("_id", "expected a string identifier");
        }
    }

    if let Some(content) = obj.get("content") {
        check_content(content, &mut err);
    }

    if !err.is_empty() {
        return Err(err);
    }

    serde_json::from_value::<Manifest>(raw.clone()).map_err(|e| {
        let mut err = ValidationError::default();
        err.malformed("manifest", e.to_string());
        err
    })
}

/// Re-check an in-memory manifest before it is written anywhere
pub fn validate_manifest(manifest: &Manifest) -> Result<(), ValidationError> {
    let raw = manifest.to_value().map_err(|e| {
        let mut err = ValidationError::default();
        err.malformed("manifest", e.to_string());
        err
    })?;
    validate(&raw).map(|_| ())
}

fn check_content(content: &Value, err: &mut ValidationError) {
    let Some(items) = content.as_array() else {
        err.malformed("content", "expected an array of version records");
        return;
    };
    let mut seen = HashSet::new();
    for item in items {
        match item.get("version_number").and_then(Value::as_u64) {
            Some(n) => {
                if !seen.insert(n) {
                    err.malformed("content", format!("duplicate version_number {}", n));
                }
            }
            None => err.malformed("content", "version record without a numeric version_number"),
        }
    }
}

fn is_path_segment(s: &str) -> bool {
    let mut components = Path::new(s).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    ) && !s.contains(['/', '\\'])
}

/// Advisory checks. Never blocks a save.
///
/// `resources` is treated as open schema: entries are only checked for
/// resolving inside the project directory when one is given.
pub fn lint_manifest(manifest: &Manifest, project_dir: Option<&Path>) -> Vec<String> {
    let mut warnings = Vec::new();

    if manifest.contributors.is_empty() {
        warnings.push("Manifest has no contributors".to_string());
    }

    if manifest.db_query.as_object().is_some_and(|q| q.is_empty()) {
        warnings.push("db-query is empty".to_string());
    }

    if let Some(resources) = manifest.extra.get("resources") {
        match resources {
            Value::Array(items) => {
                for item in items {
                    lint_resource(item, project_dir, &mut warnings);
                }
            }
            _ => warnings.push("resources should be a list".to_string()),
        }
    }

    warnings
}

fn lint_resource(item: &Value, project_dir: Option<&Path>, warnings: &mut Vec<String>) {
    let path = match item {
        Value::String(p) => p.as_str(),
        Value::Object(obj) => match obj.get("path").and_then(Value::as_str) {
            Some(p) => p,
            None => {
                warnings.push("resource entry has no path".to_string());
                return;
            }
        },
        _ => {
            warnings.push(format!("resource entry {} is neither a path nor a record", item));
            return;
        }
    };

    let rel = Path::new(path);
    if rel.is_absolute() || rel.components().any(|c| c == Component::ParentDir) {
        warnings.push(format!("resource {} is not relative to the project root", path));
        return;
    }

    let top = rel
        .components()
        .next()
        .and_then(|c| c.as_os_str().to_str())
        .unwrap_or_default();
    if !RESOURCE_KINDS.contains(&top) {
        warnings.push(format!(
            "resource {} is outside {}",
            path,
            RESOURCE_KINDS.join("/")
        ));
    }

    if let Some(dir) = project_dir {
        if !dir.join(rel).exists() {
            warnings.push(format!("resource {} does not exist in the project", path));
        }
    }
}
