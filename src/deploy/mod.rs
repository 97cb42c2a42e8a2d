//! Template deployment
//!
//! A template is a directory under the templates root holding a
//! `start_template` file and any number of module subdirectories. Deploying
//! copies it into a fresh project directory, rewriting `{{ key }}` tokens in
//! file names and text contents.
//!
//! Copies are staged in a hidden sibling directory and renamed into place
//! only once complete, so a failed deploy leaves nothing at the target.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use tracing::{debug, info, warn};

/// Seed for the live start page; renamed on first deploy only
pub const START_TEMPLATE_FILE: &str = "start_template";
/// The live start page inside a project
pub const START_FILE: &str = "start";
/// Entries never copied out of a template
pub const IGNORED_ENTRIES: [&str; 2] = [".ipynb_checkpoints", "__pycache__"];

const STAGING_PREFIX: &str = ".projkit-deploy-";

static PLACEHOLDER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_.\-]*)\s*\}\}").expect("placeholder pattern")
});

/// Placeholder name to replacement text
pub type Substitutions = BTreeMap<String, String>;

#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    #[error("Template not found: {0}")]
    TemplateNotFound(PathBuf),

    #[error("Template {template} has no module {module}")]
    ModuleNotFound { template: String, module: String },

    #[error("Invalid template or module name: {0}")]
    InvalidName(String),

    #[error("Target already exists: {0}")]
    TargetAlreadyExists(PathBuf),

    #[error("Template {0} has both a start and a start_template file")]
    AmbiguousStart(PathBuf),

    #[error("Project directory does not exist: {0}")]
    ProjectDirMissing(PathBuf),

    #[error("Deploy into {target} failed and was rolled back: {source}")]
    PartialDeployFailure {
        target: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// What a successful deploy produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployResult {
    pub target: PathBuf,
    pub files_copied: usize,
    /// Files whose name or content had a token replaced
    pub files_substituted: usize,
    /// Set when `start_template` was turned into the live `start` file
    pub start_file: Option<PathBuf>,
    /// Top-level module directories now present under the target
    pub modules: Vec<String>,
}

#[derive(Debug, Default)]
struct CopyStats {
    files_copied: usize,
    files_substituted: usize,
    start_renamed: bool,
}

/// Copies templates out of a templates root
#[derive(Debug, Clone)]
pub struct TemplateDeployer {
    templates_dir: PathBuf,
}

impl TemplateDeployer {
    pub fn new(templates_dir: impl Into<PathBuf>) -> Self {
        Self {
            templates_dir: templates_dir.into(),
        }
    }

    pub fn templates_dir(&self) -> &Path {
        &self.templates_dir
    }

    /// Resolve a template name to its directory
    pub fn template_dir(&self, template_name: &str) -> Result<PathBuf, DeployError> {
        if !is_plain_name(template_name) {
            return Err(DeployError::InvalidName(template_name.to_string()));
        }
        let dir = self.templates_dir.join(template_name);
        if !dir.is_dir() {
            return Err(DeployError::TemplateNotFound(dir));
        }
        Ok(dir)
    }

    /// Names of all templates, sorted
    pub fn list_templates(&self) -> io::Result<Vec<String>> {
        if !self.templates_dir.is_dir() {
            return Ok(Vec::new());
        }
        subdirectories(&self.templates_dir)
    }

    /// Module subdirectories of a template, sorted
    pub fn template_modules(&self, template_name: &str) -> Result<Vec<String>, DeployError> {
        let dir = self.template_dir(template_name)?;
        subdirectories(&dir).map_err(|source| DeployError::PartialDeployFailure {
            target: dir,
            source,
        })
    }

    /// Materialize `template_name` at `target_dir`.
    ///
    /// The target must be absent or an empty directory. On any copy failure
    /// the staged tree is removed before the error is returned.
    pub fn deploy(
        &self,
        template_name: &str,
        target_dir: &Path,
        substitutions: &Substitutions,
    ) -> Result<DeployResult, DeployError> {
        let template = self.template_dir(template_name)?;
        if template.join(START_FILE).exists() && template.join(START_TEMPLATE_FILE).exists() {
            return Err(DeployError::AmbiguousStart(template));
        }
        check_target_free(target_dir)?;

        info!(template = template_name, target = %target_dir.display(), "deploying template");

        let stats = stage_and_commit(target_dir, |staging| {
            let mut stats = CopyStats::default();
            copy_tree(&template, staging, substitutions, true, &mut stats)?;
            Ok(stats)
        })?;

        let modules = subdirectories(target_dir).unwrap_or_default();
        let start_file = stats.start_renamed.then(|| target_dir.join(START_FILE));

        info!(
            target = %target_dir.display(),
            files = stats.files_copied,
            substituted = stats.files_substituted,
            "template deployed"
        );

        Ok(DeployResult {
            target: target_dir.to_path_buf(),
            files_copied: stats.files_copied,
            files_substituted: stats.files_substituted,
            start_file,
            modules,
        })
    }

    /// Copy one module subdirectory of a template into an existing project.
    ///
    /// Never touches the project's `start` file.
    pub fn deploy_module(
        &self,
        template_name: &str,
        module: &str,
        project_dir: &Path,
        substitutions: &Substitutions,
    ) -> Result<DeployResult, DeployError> {
        let template = self.template_dir(template_name)?;
        if !is_plain_name(module) {
            return Err(DeployError::InvalidName(module.to_string()));
        }
        let source = template.join(module);
        if !source.is_dir() {
            return Err(DeployError::ModuleNotFound {
                template: template_name.to_string(),
                module: module.to_string(),
            });
        }
        if !project_dir.is_dir() {
            return Err(DeployError::ProjectDirMissing(project_dir.to_path_buf()));
        }

        let target = project_dir.join(module);
        check_target_free(&target)?;

        info!(template = template_name, module, target = %target.display(), "deploying module");

        let stats = stage_and_commit(&target, |staging| {
            let mut stats = CopyStats::default();
            copy_tree(&source, staging, substitutions, false, &mut stats)?;
            Ok(stats)
        })?;

        Ok(DeployResult {
            target: target.clone(),
            files_copied: stats.files_copied,
            files_substituted: stats.files_substituted,
            start_file: None,
            modules: vec![module.to_string()],
        })
    }
}

/// Replace known `{{ key }}` tokens; unknown tokens are left as written
pub fn substitute(text: &str, substitutions: &Substitutions) -> String {
    PLACEHOLDER_RE
        .replace_all(text, |caps: &Captures<'_>| match substitutions.get(&caps[1]) {
            Some(value) => value.clone(),
            None => caps[0].to_string(),
        })
        .into_owned()
}

/// Whether `text` holds a token the map can fill
pub fn has_placeholder(text: &str, substitutions: &Substitutions) -> bool {
    PLACEHOLDER_RE
        .captures_iter(text)
        .any(|caps| substitutions.contains_key(&caps[1]))
}

/// Copy a directory tree byte-for-byte, with no substitution or renaming
pub fn copy_dir_all(src: &Path, dst: &Path) -> io::Result<()> {
    let mut stats = CopyStats::default();
    copy_tree(src, dst, &Substitutions::new(), false, &mut stats)
}

/// Clone a live project directory to a new, unused location.
///
/// Same all-or-nothing guarantee as [`TemplateDeployer::deploy`]; `start`
/// is copied as it is, never regenerated from a template.
pub fn copy_project_dir(src: &Path, target: &Path) -> Result<(), DeployError> {
    if !src.is_dir() {
        return Err(DeployError::ProjectDirMissing(src.to_path_buf()));
    }
    check_target_free(target)?;
    info!(from = %src.display(), to = %target.display(), "copying project directory");
    stage_and_commit(target, |staging| copy_dir_all(src, staging))
}

/// Stage a copy beside `target` and rename it into place when `fill` succeeds
pub(crate) fn stage_and_commit<T>(
    target: &Path,
    fill: impl FnOnce(&Path) -> io::Result<T>,
) -> Result<T, DeployError> {
    let fail = |source: io::Error| DeployError::PartialDeployFailure {
        target: target.to_path_buf(),
        source,
    };

    let parent = match target.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent).map_err(fail)?;

    let staging = tempfile::Builder::new()
        .prefix(STAGING_PREFIX)
        .tempdir_in(&parent)
        .map_err(fail)?;

    let result = fill(staging.path()).and_then(|value| {
        // An empty target directory is allowed; make room for the rename
        if target.is_dir() {
            fs::remove_dir(target)?;
        }
        fs::rename(staging.path(), target)?;
        Ok(value)
    });

    match result {
        Ok(value) => {
            // The staging path was renamed away; dropping the handle is a no-op
            drop(staging);
            Ok(value)
        }
        Err(source) => {
            warn!(target = %target.display(), error = %source, "deploy failed, removing staged copy");
            if let Err(e) = staging.close() {
                warn!(error = %e, "could not remove staged copy");
            }
            Err(fail(source))
        }
    }
}

pub(crate) fn check_target_free(target: &Path) -> Result<(), DeployError> {
    match fs::symlink_metadata(target) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(DeployError::PartialDeployFailure {
            target: target.to_path_buf(),
            source,
        }),
        Ok(meta) if meta.is_dir() => {
            let empty = fs::read_dir(target)
                .map(|mut entries| entries.next().is_none())
                .unwrap_or(false);
            if empty {
                Ok(())
            } else {
                Err(DeployError::TargetAlreadyExists(target.to_path_buf()))
            }
        }
        Ok(_) => Err(DeployError::TargetAlreadyExists(target.to_path_buf())),
    }
}

fn copy_tree(
    src: &Path,
    dst: &Path,
    substitutions: &Substitutions,
    at_template_root: bool,
    stats: &mut CopyStats,
) -> io::Result<()> {
    fs::create_dir_all(dst)?;

    let mut entries = fs::read_dir(src)?.collect::<io::Result<Vec<_>>>()?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let file_name = entry.file_name();
        let name = file_name.to_string_lossy();
        if IGNORED_ENTRIES.contains(&name.as_ref()) {
            continue;
        }

        let is_start = at_template_root && name == START_TEMPLATE_FILE;
        let (dest_name, renamed): (OsString, bool) = match file_name.to_str() {
            Some(_) if is_start => (START_FILE.into(), false),
            Some(s) if has_placeholder(s, substitutions) => {
                (substitute(s, substitutions).into(), true)
            }
            _ => (file_name.clone(), false),
        };
        let dest = dst.join(&dest_name);
        let path = entry.path();

        if fs::metadata(&path)?.is_dir() {
            copy_tree(&path, &dest, substitutions, false, stats)?;
            continue;
        }

        let bytes = fs::read(&path)?;
        let rewritten = match std::str::from_utf8(&bytes) {
            Ok(text) if has_placeholder(text, substitutions) => {
                fs::write(&dest, substitute(text, substitutions))?;
                true
            }
            _ => {
                fs::copy(&path, &dest)?;
                false
            }
        };

        stats.files_copied += 1;
        if rewritten || renamed {
            stats.files_substituted += 1;
        }
        if is_start {
            stats.start_renamed = true;
        }
        debug!(from = %path.display(), to = %dest.display(), rewritten, "copied");
    }

    Ok(())
}

fn subdirectories(dir: &Path) -> io::Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') || IGNORED_ENTRIES.contains(&name.as_str()) {
            continue;
        }
        if entry.path().is_dir() {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}

fn is_plain_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\'])
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn subs() -> Substitutions {
        Substitutions::from([
            ("name".to_string(), "proj1".to_string()),
            ("title".to_string(), "My Project".to_string()),
        ])
    }

    fn write_template(root: &Path) {
        let base = root.join("base");
        fs::create_dir_all(base.join("topic_modeling/scripts")).unwrap();
        fs::create_dir_all(base.join("__pycache__")).unwrap();
        fs::write(base.join(START_TEMPLATE_FILE), "<h1>{{ title }}</h1>\n").unwrap();
        fs::write(base.join("topic_modeling/README.md"), "Module for {{name}} ({{ unknown }})").unwrap();
        fs::write(base.join("topic_modeling/scripts/{{name}}.cfg"), "static").unwrap();
        fs::write(base.join("topic_modeling/data.bin"), [0u8, 159, 146, 150]).unwrap();
        fs::write(base.join("__pycache__/junk.pyc"), "x").unwrap();
    }

    #[test]
    fn test_substitute_leaves_unknown_tokens() {
        let out = substitute("{{name}} / {{ title }} / {{other}}", &subs());
        assert_eq!(out, "proj1 / My Project / {{other}}");
        assert!(!has_placeholder("{{other}}", &subs()));
    }

    #[test]
    fn test_deploy_copies_and_substitutes() {
        let tmp = TempDir::new().unwrap();
        write_template(tmp.path());
        let target = tmp.path().join("ws/ns1/proj1");

        let deployer = TemplateDeployer::new(tmp.path());
        let result = deployer.deploy("base", &target, &subs()).unwrap();

        assert_eq!(result.start_file, Some(target.join(START_FILE)));
        assert_eq!(result.modules, vec!["topic_modeling".to_string()]);
        assert!(!target.join(START_TEMPLATE_FILE).exists());
        assert_eq!(
            fs::read_to_string(target.join(START_FILE)).unwrap(),
            "<h1>My Project</h1>\n"
        );
        assert_eq!(
            fs::read_to_string(target.join("topic_modeling/README.md")).unwrap(),
            "Module for proj1 ({{ unknown }})"
        );
        assert!(target.join("topic_modeling/scripts/proj1.cfg").exists());
        assert_eq!(
            fs::read(target.join("topic_modeling/data.bin")).unwrap(),
            vec![0u8, 159, 146, 150]
        );
        assert!(!target.join("__pycache__").exists());
        assert_eq!(result.files_copied, 4);
    }

    #[test]
    fn test_missing_template() {
        let tmp = TempDir::new().unwrap();
        let target = tmp.path().join("out");
        let err = TemplateDeployer::new(tmp.path())
            .deploy("nope", &target, &subs())
            .unwrap_err();
        assert!(matches!(err, DeployError::TemplateNotFound(_)));
        assert!(!target.exists());
    }

    #[test]
    fn test_existing_target_untouched() {
        let tmp = TempDir::new().unwrap();
        write_template(tmp.path());
        let target = tmp.path().join("out");
        fs::create_dir_all(&target).unwrap();
        fs::write(target.join("live.txt"), "keep me").unwrap();

        let err = TemplateDeployer::new(tmp.path())
            .deploy("base", &target, &subs())
            .unwrap_err();
        assert!(matches!(err, DeployError::TargetAlreadyExists(_)));
        assert_eq!(fs::read_to_string(target.join("live.txt")).unwrap(), "keep me");
        assert_eq!(fs::read_dir(&target).unwrap().count(), 1);
    }

    #[test]
    fn test_template_with_start_and_start_template_rejected() {
        let tmp = TempDir::new().unwrap();
        write_template(tmp.path());
        fs::write(tmp.path().join("base").join(START_FILE), "<h1>stale</h1>").unwrap();
        let target = tmp.path().join("out");

        let err = TemplateDeployer::new(tmp.path())
            .deploy("base", &target, &subs())
            .unwrap_err();
        assert!(matches!(err, DeployError::AmbiguousStart(_)));
        assert!(!target.exists());
    }

    #[test]
    fn test_empty_target_dir_is_allowed() {
        let tmp = TempDir::new().unwrap();
        write_template(tmp.path());
        let target = tmp.path().join("out");
        fs::create_dir_all(&target).unwrap();

        TemplateDeployer::new(tmp.path())
            .deploy("base", &target, &subs())
            .unwrap();
        assert!(target.join(START_FILE).exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_failed_copy_leaves_no_trace() {
        let tmp = TempDir::new().unwrap();
        write_template(tmp.path());
        std::os::unix::fs::symlink(
            tmp.path().join("does-not-exist"),
            tmp.path().join("base/topic_modeling/zz_dangling"),
        )
        .unwrap();
        let parent = tmp.path().join("ws");
        let target = parent.join("proj1");

        let err = TemplateDeployer::new(tmp.path())
            .deploy("base", &target, &subs())
            .unwrap_err();
        assert!(matches!(err, DeployError::PartialDeployFailure { .. }));
        assert!(!target.exists());
        // No staging directory left behind either
        assert_eq!(fs::read_dir(&parent).unwrap().count(), 0);
    }

    #[test]
    fn test_deploy_module_into_project() {
        let tmp = TempDir::new().unwrap();
        write_template(tmp.path());
        let project = tmp.path().join("proj");
        fs::create_dir_all(&project).unwrap();
        fs::write(project.join(START_FILE), "live").unwrap();

        let deployer = TemplateDeployer::new(tmp.path());
        let result = deployer
            .deploy_module("base", "topic_modeling", &project, &subs())
            .unwrap();
        assert_eq!(result.start_file, None);
        assert!(project.join("topic_modeling/README.md").exists());
        assert_eq!(fs::read_to_string(project.join(START_FILE)).unwrap(), "live");

        let again = deployer
            .deploy_module("base", "topic_modeling", &project, &subs())
            .unwrap_err();
        assert!(matches!(again, DeployError::TargetAlreadyExists(_)));

        let missing = deployer
            .deploy_module("base", "nope", &project, &subs())
            .unwrap_err();
        assert!(matches!(missing, DeployError::ModuleNotFound { .. }));
    }

    #[test]
    fn test_copy_project_dir_keeps_start() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("a");
        fs::create_dir_all(src.join("mod")).unwrap();
        fs::write(src.join(START_FILE), "{{name}}").unwrap();
        fs::write(src.join("mod/x.txt"), "x").unwrap();

        let dst = tmp.path().join("b");
        copy_project_dir(&src, &dst).unwrap();
        assert_eq!(fs::read_to_string(dst.join(START_FILE)).unwrap(), "{{name}}");
        assert!(dst.join("mod/x.txt").exists());

        assert!(matches!(
            copy_project_dir(&src, &dst),
            Err(DeployError::TargetAlreadyExists(_))
        ));
    }

    #[test]
    fn test_list_templates_and_modules() {
        let tmp = TempDir::new().unwrap();
        write_template(tmp.path());
        fs::create_dir_all(tmp.path().join("other")).unwrap();

        let deployer = TemplateDeployer::new(tmp.path());
        assert_eq!(deployer.list_templates().unwrap(), vec!["base", "other"]);
        assert_eq!(deployer.template_modules("base").unwrap(), vec!["topic_modeling"]);
        assert!(matches!(
            deployer.template_dir("../base"),
            Err(DeployError::InvalidName(_))
        ));
    }
}
