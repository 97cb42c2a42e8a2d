//! Start-page state record
//!
//! Persisted separately from the manifest, inside the project directory.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// An entry of `available_modules`: a module id, or a named group of ids
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawModuleEntry", into = "RawModuleEntry")]
pub enum ModuleEntry {
    Module(String),
    Group { name: String, modules: Vec<String> },
}

impl ModuleEntry {
    pub fn module(id: impl Into<String>) -> Self {
        ModuleEntry::Module(id.into())
    }

    pub fn group(name: impl Into<String>, modules: Vec<String>) -> Self {
        ModuleEntry::Group {
            name: name.into(),
            modules,
        }
    }

    /// Whether `id` is this module or one of this group's members
    pub fn contains(&self, id: &str) -> bool {
        match self {
            ModuleEntry::Module(m) => m == id,
            ModuleEntry::Group { modules, .. } => modules.iter().any(|m| m == id),
        }
    }
}

/// Wire shape: a bare string or a single-key object
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum RawModuleEntry {
    Module(String),
    Group(BTreeMap<String, Vec<String>>),
}

impl TryFrom<RawModuleEntry> for ModuleEntry {
    type Error = String;

    fn try_from(raw: RawModuleEntry) -> Result<Self, Self::Error> {
        match raw {
            RawModuleEntry::Module(id) => Ok(ModuleEntry::Module(id)),
            RawModuleEntry::Group(map) => {
                if map.len() != 1 {
                    return Err(format!(
                        "module group must have exactly one key, found {}",
                        map.len()
                    ));
                }
                match map.into_iter().next() {
                    Some((name, modules)) => Ok(ModuleEntry::Group { name, modules }),
                    None => Err("module group must have exactly one key".to_string()),
                }
            }
        }
    }
}

impl From<ModuleEntry> for RawModuleEntry {
    fn from(entry: ModuleEntry) -> Self {
        match entry {
            ModuleEntry::Module(id) => RawModuleEntry::Module(id),
            ModuleEntry::Group { name, modules } => {
                RawModuleEntry::Group(BTreeMap::from([(name, modules)]))
            }
        }
    }
}

/// The record behind the rendered start page
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StartPageState {
    pub name: String,
    pub project_url: String,
    #[serde(default)]
    pub operations: Vec<String>,
    #[serde(default)]
    pub available_modules: Vec<ModuleEntry>,
    /// Module id to output URL. Kept sorted so merges commute.
    #[serde(default, with = "visualisation_list")]
    pub visualisations: BTreeMap<String, String>,
}

impl StartPageState {
    pub fn has_module(&self, id: &str) -> bool {
        self.available_modules.iter().any(|e| e.contains(id))
    }

    /// Every module id, groups flattened, in display order
    pub fn module_ids(&self) -> Vec<&str> {
        let mut ids = Vec::new();
        for entry in &self.available_modules {
            match entry {
                ModuleEntry::Module(id) => ids.push(id.as_str()),
                ModuleEntry::Group { modules, .. } => {
                    ids.extend(modules.iter().map(String::as_str))
                }
            }
        }
        ids
    }
}

/// `visualisations` is a list of single-key objects on disk
mod visualisation_list {
    use std::collections::BTreeMap;

    use serde::de::Error as _;
    use serde::ser::SerializeSeq;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(map: &BTreeMap<String, String>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut seq = serializer.serialize_seq(Some(map.len()))?;
        for (module, url) in map {
            seq.serialize_element(&BTreeMap::from([(module, url)]))?;
        }
        seq.end()
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let entries: Vec<BTreeMap<String, String>> = Vec::deserialize(deserializer)?;
        let mut map = BTreeMap::new();
        for entry in entries {
            if entry.len() != 1 {
                return Err(D::Error::custom(format!(
                    "visualisation entry must have exactly one key, found {}",
                    entry.len()
                )));
            }
            map.extend(entry);
        }
        Ok(map)
    }
}
