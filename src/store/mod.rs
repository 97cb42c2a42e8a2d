//! Manifest store
//!
//! A document collection keyed by an opaque id. [`ManifestStore`] is the seam
//! the façade talks to; [`SqliteStore`] keeps each manifest as a JSON document
//! in a single `projects` table. Every call is a fresh round trip: nothing is
//! cached between calls.

use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use serde_json::{Map, Value};
use std::path::Path;
use tracing::debug;

use crate::models::{Manifest, ManifestId, ProjectKey};

/// Store failure
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("A project named {0} already exists")]
    Duplicate(ProjectKey),

    #[error("Stored document {id} is not a manifest: {reason}")]
    Corrupt { id: String, reason: String },
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}

/// Filter for `find`. Empty query matches every manifest.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ManifestQuery {
    pub id: Option<ManifestId>,
    pub name: Option<String>,
    pub namespace: Option<String>,
    /// Top-level string fields that must match exactly
    pub fields: Vec<(String, String)>,
}

impl ManifestQuery {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn by_id(id: &ManifestId) -> Self {
        Self {
            id: Some(id.clone()),
            ..Default::default()
        }
    }

    pub fn by_name(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn by_key(key: &ProjectKey) -> Self {
        Self {
            name: Some(key.name.clone()),
            namespace: Some(key.namespace.clone()),
            ..Default::default()
        }
    }

    pub fn in_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.push((key.into(), value.into()));
        self
    }
}

/// How a delete addresses its target
#[derive(Debug, Clone, PartialEq)]
pub enum ManifestKey {
    Id(ManifestId),
    Name(ProjectKey),
}

/// Document store contract
pub trait ManifestStore {
    fn find(&self, query: &ManifestQuery) -> Result<Vec<Manifest>, StoreError>;

    /// Insert and return the store-assigned id. Any `_id` on the input is ignored.
    fn insert(&self, manifest: &Manifest) -> Result<ManifestId, StoreError>;

    /// Merge `fields` into the stored document (`null` removes a key).
    /// Returns false when no document has this id.
    fn update(&self, id: &ManifestId, fields: &Map<String, Value>) -> Result<bool, StoreError>;

    /// Overwrite the stored document with `manifest` as a whole.
    /// Returns false when no document has this id.
    fn replace(&self, id: &ManifestId, manifest: &Manifest) -> Result<bool, StoreError>;

    fn delete(&self, key: &ManifestKey) -> Result<bool, StoreError>;

    fn find_one(&self, query: &ManifestQuery) -> Result<Option<Manifest>, StoreError> {
        Ok(self.find(query)?.into_iter().next())
    }

    fn get(&self, id: &ManifestId) -> Result<Option<Manifest>, StoreError> {
        self.find_one(&ManifestQuery::by_id(id))
    }

    fn exists(&self, id: &ManifestId) -> Result<bool, StoreError> {
        Ok(self.get(id)?.is_some())
    }
}

/// SQLite-backed store
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open (and create if needed) the store at `path`
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS projects (
                id          TEXT PRIMARY KEY,
                name        TEXT NOT NULL,
                namespace   TEXT NOT NULL,
                data        TEXT NOT NULL,
                created_at  INTEGER NOT NULL,
                updated_at  INTEGER NOT NULL,
                UNIQUE (name, namespace)
            )
            "#,
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_projects_namespace ON projects(namespace)",
            [],
        )?;
        Ok(Self { conn })
    }

    fn row_to_manifest(id: String, data: String) -> Result<Manifest, StoreError> {
        let mut value: Value = serde_json::from_str(&data).map_err(|e| StoreError::Corrupt {
            id: id.clone(),
            reason: e.to_string(),
        })?;
        if let Some(obj) = value.as_object_mut() {
            obj.insert("_id".to_string(), Value::String(id.clone()));
        }
        serde_json::from_value(value).map_err(|e| StoreError::Corrupt {
            id,
            reason: e.to_string(),
        })
    }
}

/// Document body without `_id`; the id lives in its own column
fn document_body(manifest: &Manifest) -> Result<Value, StoreError> {
    let mut value = manifest.to_value().map_err(|e| StoreError::Corrupt {
        id: manifest
            .id
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_default(),
        reason: e.to_string(),
    })?;
    if let Some(obj) = value.as_object_mut() {
        obj.remove("_id");
    }
    Ok(value)
}

fn map_constraint(e: rusqlite::Error, key: ProjectKey) -> StoreError {
    match &e {
        rusqlite::Error::SqliteFailure(err, _) if err.code == ErrorCode::ConstraintViolation => {
            StoreError::Duplicate(key)
        }
        _ => e.into(),
    }
}

impl ManifestStore for SqliteStore {
    fn find(&self, query: &ManifestQuery) -> Result<Vec<Manifest>, StoreError> {
        let mut sql = String::from("SELECT id, data FROM projects WHERE 1=1");
        let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(id) = &query.id {
            sql.push_str(" AND id = ?");
            params_vec.push(Box::new(id.0.clone()));
        }
        if let Some(name) = &query.name {
            sql.push_str(" AND name = ?");
            params_vec.push(Box::new(name.clone()));
        }
        if let Some(ns) = &query.namespace {
            sql.push_str(" AND namespace = ?");
            params_vec.push(Box::new(ns.clone()));
        }
        for (key, value) in &query.fields {
            sql.push_str(" AND json_extract(data, ?) = ?");
            params_vec.push(Box::new(format!("$.\"{}\"", key.replace('"', "\\\""))));
            params_vec.push(Box::new(value.clone()));
        }
        sql.push_str(" ORDER BY namespace, name");

        let mut stmt = self.conn.prepare(&sql)?;
        let params_refs: Vec<&dyn rusqlite::ToSql> =
            params_vec.iter().map(|p| p.as_ref()).collect();

        let rows = stmt.query_map(params_refs.as_slice(), |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut manifests = Vec::new();
        for row in rows {
            let (id, data) = row?;
            manifests.push(Self::row_to_manifest(id, data)?);
        }
        debug!(count = manifests.len(), ?query, "store find");
        Ok(manifests)
    }

    fn insert(&self, manifest: &Manifest) -> Result<ManifestId, StoreError> {
        let id = ManifestId::new();
        let body = document_body(manifest)?;
        let now = chrono::Utc::now().timestamp();

        self.conn
            .execute(
                r#"
                INSERT INTO projects (id, name, namespace, data, created_at, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?5)
                "#,
                params![id.0, manifest.name, manifest.namespace, body.to_string(), now],
            )
            .map_err(|e| map_constraint(e, manifest.key()))?;

        debug!(%id, key = %manifest.key(), "store insert");
        Ok(id)
    }

    fn update(&self, id: &ManifestId, fields: &Map<String, Value>) -> Result<bool, StoreError> {
        let tx = self.conn.unchecked_transaction()?;

        let data: Option<String> = tx
            .query_row(
                "SELECT data FROM projects WHERE id = ?1",
                params![id.0],
                |row| row.get(0),
            )
            .optional()?;
        let Some(data) = data else {
            return Ok(false);
        };

        let mut doc: Value = serde_json::from_str(&data).map_err(|e| StoreError::Corrupt {
            id: id.0.clone(),
            reason: e.to_string(),
        })?;
        let mut patch = fields.clone();
        patch.remove("_id");
        json_patch::merge(&mut doc, &Value::Object(patch));

        // Reject patches that would leave a document the façade cannot read back
        let merged = Self::row_to_manifest(id.0.clone(), doc.to_string())?;

        tx.execute(
            r#"
            UPDATE projects
            SET name = ?2, namespace = ?3, data = ?4, updated_at = ?5
            WHERE id = ?1
            "#,
            params![
                id.0,
                merged.name,
                merged.namespace,
                doc.to_string(),
                chrono::Utc::now().timestamp()
            ],
        )
        .map_err(|e| map_constraint(e, merged.key()))?;
        tx.commit()?;

        debug!(%id, "store update");
        Ok(true)
    }

    fn replace(&self, id: &ManifestId, manifest: &Manifest) -> Result<bool, StoreError> {
        let body = document_body(manifest)?;
        let updated = self
            .conn
            .execute(
                r#"
                UPDATE projects
                SET name = ?2, namespace = ?3, data = ?4, updated_at = ?5
                WHERE id = ?1
                "#,
                params![
                    id.0,
                    manifest.name,
                    manifest.namespace,
                    body.to_string(),
                    chrono::Utc::now().timestamp()
                ],
            )
            .map_err(|e| map_constraint(e, manifest.key()))?;

        debug!(%id, updated, "store replace");
        Ok(updated > 0)
    }

    fn delete(&self, key: &ManifestKey) -> Result<bool, StoreError> {
        let deleted = match key {
            ManifestKey::Id(id) => self
                .conn
                .execute("DELETE FROM projects WHERE id = ?1", params![id.0])?,
            ManifestKey::Name(k) => self.conn.execute(
                "DELETE FROM projects WHERE name = ?1 AND namespace = ?2",
                params![k.name, k.namespace],
            )?,
        };
        debug!(?key, deleted, "store delete");
        Ok(deleted > 0)
    }
}
