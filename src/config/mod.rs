//! Configuration management for projkit
//!
//! Handles the ~/.projkit/ directory structure and config.toml

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Namespace used when `new` is not given one
    pub default_namespace: String,
    /// Template deployed when `new` is not given one
    pub default_template: String,
    /// Filter directive for the log subscriber, e.g. "info" or "projkit=debug"
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Prefix for start-page project URLs; the project path is used when unset
    #[serde(default)]
    pub project_url_base: Option<String>,
    /// Project-level actions listed on every new start page
    #[serde(default = "default_operations")]
    pub operations: Vec<String>,
    #[serde(default)]
    pub dirs: DirOverrides,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_namespace: "default".to_string(),
            default_template: "base".to_string(),
            log_level: default_log_level(),
            project_url_base: None,
            operations: default_operations(),
            dirs: DirOverrides::default(),
        }
    }
}

/// Optional replacements for the directories under ~/.projkit
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DirOverrides {
    pub templates: Option<PathBuf>,
    pub workspace: Option<PathBuf>,
    pub temp: Option<PathBuf>,
}

fn default_log_level() -> String {
    "warn".to_string()
}

fn default_operations() -> Vec<String> {
    ["save", "save-as", "export", "delete"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Returns the path to the projkit home directory (~/.projkit)
pub fn projkit_home() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home.join(".projkit"))
}

/// Returns paths to all projkit directories
#[derive(Debug, Clone)]
pub struct ProjkitPaths {
    pub root: PathBuf,
    pub config: PathBuf,
    pub db: PathBuf,
    pub db_file: PathBuf,
    pub templates: PathBuf,
    pub workspace: PathBuf,
    pub temp: PathBuf,
    /// Version archives, one folder per project
    pub archives: PathBuf,
}

impl ProjkitPaths {
    pub fn new() -> Result<Self> {
        let root = projkit_home()?;
        Ok(Self::at(root))
    }

    /// Layout rooted at an arbitrary directory
    pub fn at(root: PathBuf) -> Self {
        Self {
            config: root.join("config.toml"),
            db: root.join("db"),
            db_file: root.join("db/projkit.db"),
            templates: root.join("templates"),
            workspace: root.join("workspace"),
            temp: root.join("tmp"),
            archives: root.join("archives"),
            root,
        }
    }

    /// Apply directory overrides from the config file
    pub fn with_overrides(mut self, overrides: &DirOverrides) -> Self {
        if let Some(p) = &overrides.templates {
            self.templates = p.clone();
        }
        if let Some(p) = &overrides.workspace {
            self.workspace = p.clone();
        }
        if let Some(p) = &overrides.temp {
            self.temp = p.clone();
        }
        self
    }

    /// Create all directories if they don't exist
    pub fn ensure_dirs(&self) -> Result<()> {
        fs::create_dir_all(&self.root).context("Failed to create projkit root")?;
        fs::create_dir_all(&self.db).context("Failed to create db directory")?;
        fs::create_dir_all(&self.templates).context("Failed to create templates directory")?;
        fs::create_dir_all(&self.workspace).context("Failed to create workspace directory")?;
        fs::create_dir_all(&self.temp).context("Failed to create temp directory")?;
        fs::create_dir_all(&self.archives).context("Failed to create archives directory")?;
        Ok(())
    }

    /// Check if projkit has been initialized
    pub fn is_initialized(&self) -> bool {
        self.config.exists() && self.db_file.exists()
    }

    /// Load config.toml, defaults when absent
    pub fn load_config(&self) -> Result<Config> {
        if !self.config.exists() {
            return Ok(Config::default());
        }
        let content = fs::read_to_string(&self.config).context("Failed to read config.toml")?;
        toml::from_str(&content).context("Failed to parse config.toml")
    }

    /// Write config.toml
    pub fn save_config(&self, config: &Config) -> Result<()> {
        let content = toml::to_string_pretty(config).context("Failed to serialize config")?;
        fs::write(&self.config, content).context("Failed to write config.toml")?;
        Ok(())
    }
}
