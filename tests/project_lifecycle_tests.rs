// Integration tests for the project lifecycle
// Create, deploy, save, copy, module output and export against a temp workspace

use anyhow::Result;
use projkit::clock::FixedClock;
use projkit::models::{ModuleEntry, ProjectKey};
use projkit::project::{
    Checkpoint, Project, ProjectError, ProjectLayout, ProjectState, MANIFEST_FILE,
};
use projkit::startpage;
use projkit::store::{ManifestKey, ManifestQuery, ManifestStore, SqliteStore, StoreError};
use serde_json::{json, Value};
use std::fs;
use tempfile::TempDir;

const START_TEMPLATE: &str = "<html>\n<title>{{ title }}</title>\n<!-- projkit:start-page -->\n<!-- /projkit:start-page -->\n</html>\n";

/// Setup a workspace with a `base` template holding one module
fn setup() -> Result<(TempDir, ProjectLayout, SqliteStore)> {
    let temp_dir = TempDir::new()?;
    let templates = temp_dir.path().join("templates");

    fs::create_dir_all(templates.join("base/topic_modeling"))?;
    fs::create_dir_all(templates.join("base/dfr_browser"))?;
    fs::write(templates.join("base/start_template"), START_TEMPLATE)?;
    fs::write(
        templates.join("base/topic_modeling/settings.txt"),
        "project = {{ name }}\n",
    )?;
    fs::write(templates.join("base/dfr_browser/index.html"), "<p>browser</p>")?;

    let layout = ProjectLayout::new(
        templates,
        temp_dir.path().join("workspace"),
        temp_dir.path().join("tmp"),
    );
    let store = SqliteStore::open_in_memory()?;
    Ok((temp_dir, layout, store))
}

fn stub(name: &str) -> Value {
    json!({
        "name": name,
        "namespace": "ns1",
        "metapath": "Projects",
        "title": "T",
        "contributors": [],
        "db-query": {}
    })
}

fn clock() -> FixedClock {
    FixedClock::at(2024, 3, 9, 14, 5, 7)
}

#[test]
fn test_create_deploys_template_and_start_page() -> Result<()> {
    let (_temp, layout, store) = setup()?;
    let project = Project::create(&stub("proj1"), layout, "base", &clock())?;

    assert_eq!(project.state(), ProjectState::Deployed);
    let dir = project.project_dir().unwrap().to_path_buf();
    assert!(dir.ends_with("ns1/proj1"));

    let start = fs::read_to_string(dir.join("start"))?;
    assert!(start.contains("<title>T</title>"));
    assert!(start.contains("id=\"project-name\">proj1<"));
    assert!(!dir.join("start_template").exists());

    let settings = fs::read_to_string(dir.join("topic_modeling/settings.txt"))?;
    assert_eq!(settings, "project = proj1\n");

    let state = startpage::load(&dir)?;
    assert_eq!(state.name, "proj1");
    assert_eq!(
        state.available_modules,
        vec![
            ModuleEntry::module("dfr_browser"),
            ModuleEntry::module("topic_modeling")
        ]
    );
    assert!(startpage::verify_page(&start, &state).is_clean());

    // Creation never writes to the store
    assert!(store.find(&ManifestQuery::all())?.is_empty());
    assert!(dir.join(MANIFEST_FILE).is_file());

    Ok(())
}

#[test]
fn test_modules_field_pins_start_page_groups() -> Result<()> {
    let (_temp, layout, _store) = setup()?;
    let mut raw = stub("grouped");
    raw["modules"] = json!(["dfr_browser", {"analysis": ["topic_modeling"]}]);

    let project = Project::create(&raw, layout, "base", &clock())?;
    let state = project.start_page()?;
    assert_eq!(
        state.available_modules,
        vec![
            ModuleEntry::module("dfr_browser"),
            ModuleEntry::group("analysis", vec!["topic_modeling".to_string()])
        ]
    );
    Ok(())
}

#[test]
fn test_create_into_occupied_directory_fails() -> Result<()> {
    let (_temp, layout, _store) = setup()?;
    let occupied = layout.project_dir(&ProjectKey::new("ns1", "proj1"));
    fs::create_dir_all(&occupied)?;
    fs::write(occupied.join("notes.txt"), "keep me")?;

    let err = Project::create(&stub("proj1"), layout, "base", &clock()).unwrap_err();
    assert!(matches!(
        err,
        ProjectError::Deploy(projkit::deploy::DeployError::TargetAlreadyExists(_))
    ));
    assert_eq!(fs::read_to_string(occupied.join("notes.txt"))?, "keep me");
    assert!(!occupied.join("start").exists());
    Ok(())
}

#[test]
fn test_save_inserts_then_updates() -> Result<()> {
    let (_temp, layout, store) = setup()?;
    let mut project = Project::create(&stub("proj1"), layout, "base", &clock())?;

    let id = project.save(&store)?;
    assert_eq!(project.state(), ProjectState::Persisted);
    assert_eq!(project.id(), Some(&id));

    project.manifest_mut().title = "Renamed".to_string();
    project
        .manifest_mut()
        .extra
        .insert("notes".to_string(), json!("draft"));
    let again = project.save(&store)?;
    assert_eq!(again, id);

    let stored = store.get(&id)?.unwrap();
    assert_eq!(stored.title, "Renamed");
    assert_eq!(stored.extra["notes"], json!("draft"));
    assert_eq!(store.find(&ManifestQuery::all())?.len(), 1);

    // Dropped ad hoc keys are removed from the stored copy too
    project.manifest_mut().extra.remove("notes");
    project.save(&store)?;
    let stored = store.get(&id)?.unwrap();
    assert!(!stored.extra.contains_key("notes"));

    Ok(())
}

#[test]
fn test_save_replaces_nested_fields_and_keeps_nulls() -> Result<()> {
    let (_temp, layout, store) = setup()?;
    let mut raw = stub("proj1");
    raw["db-query"] = json!({"$and": [{"metapath": "Corpus"}]});
    raw["topic_modeling"] = json!({"k": 20, "old": 1});
    raw["flag"] = json!("x");
    let mut project = Project::create(&raw, layout, "base", &clock())?;
    let id = project.save(&store)?;

    let manifest = project.manifest_mut();
    manifest.db_query = json!({});
    manifest.extra.insert("topic_modeling".to_string(), json!({"k": 20}));
    manifest.extra.insert("flag".to_string(), Value::Null);
    project.save(&store)?;

    let stored = store.get(&id)?.unwrap();
    assert_eq!(&stored, project.manifest());
    assert_eq!(stored.db_query, json!({}));
    assert_eq!(stored.extra["topic_modeling"], json!({"k": 20}));
    assert_eq!(stored.extra.get("flag"), Some(&Value::Null));
    Ok(())
}

#[test]
fn test_save_succeeds_when_directory_copy_cannot_be_written() -> Result<()> {
    let (_temp, layout, store) = setup()?;
    let mut project = Project::create(&stub("proj1"), layout, "base", &clock())?;
    let dir = project.project_dir().unwrap().to_path_buf();

    // A non-empty directory in place of datapackage.json blocks the rename
    fs::remove_file(dir.join(MANIFEST_FILE))?;
    fs::create_dir_all(dir.join(MANIFEST_FILE).join("inner"))?;

    let id = project.save(&store)?;
    assert_eq!(project.state(), ProjectState::Persisted);
    assert_eq!(store.get(&id)?.as_ref(), Some(project.manifest()));
    Ok(())
}

#[test]
fn test_unavailable_store_reaches_caller() -> Result<()> {
    let (temp, layout, _store) = setup()?;
    let db_file = temp.path().join("projects.db");
    let store = SqliteStore::open(&db_file)?;

    let mut project = Project::create(&stub("proj1"), layout.clone(), "base", &clock())?;
    project.save(&store)?;

    rusqlite::Connection::open(&db_file)?.execute("DROP TABLE projects", [])?;

    project.manifest_mut().title = "Changed".to_string();
    let err = project.save(&store).unwrap_err();
    assert!(matches!(err, ProjectError::Store(StoreError::Unavailable(_))));

    let by_name = ManifestKey::Name(ProjectKey::new("ns1", "proj1"));
    let err = Project::load(&store, &by_name, layout).unwrap_err();
    assert!(matches!(err, ProjectError::Store(StoreError::Unavailable(_))));
    Ok(())
}

#[test]
fn test_failed_save_leaves_store_untouched() -> Result<()> {
    let (_temp, layout, store) = setup()?;
    let mut project = Project::create(&stub("proj1"), layout, "base", &clock())?;
    let id = project.save(&store)?;

    project.manifest_mut().metapath = "Corpus".to_string();
    project.manifest_mut().title = "Changed".to_string();
    let err = project.save(&store).unwrap_err();
    assert!(matches!(err, ProjectError::Validation(_)));

    let stored = store.get(&id)?.unwrap();
    assert_eq!(stored.metapath, "Projects");
    assert_eq!(stored.title, "T");
    Ok(())
}

#[test]
fn test_save_as_is_independent() -> Result<()> {
    let (_temp, layout, store) = setup()?;
    let mut original = Project::create(&stub("proj1"), layout, "base", &clock())?;
    original.append_version(&clock(), None)?;
    let original_id = original.save(&store)?;

    let mut copy = original.save_as("proj2", Some("ns2"), &clock())?;
    assert_eq!(copy.state(), ProjectState::Deployed);
    assert!(copy.id().is_none());
    assert_eq!(copy.key(), ProjectKey::new("ns2", "proj2"));

    // Copy starts over at version 1 and keeps the template
    assert_eq!(copy.manifest().content.len(), 1);
    let v1 = copy.manifest().latest_version().unwrap();
    assert_eq!(v1.version_number, 1);
    assert_eq!(v1.version_workflow.as_deref(), Some("base"));

    let copy_dir = copy.project_dir().unwrap().to_path_buf();
    assert!(copy_dir.ends_with("ns2/proj2"));
    assert_eq!(startpage::load(&copy_dir)?.name, "proj2");

    // Original is untouched
    let original_dir = original.project_dir().unwrap();
    assert_eq!(startpage::load(original_dir)?.name, "proj1");
    assert_eq!(original.manifest().content.len(), 2);

    let copy_id = copy.save(&store)?;
    assert_ne!(copy_id, original_id);
    assert_eq!(store.find(&ManifestQuery::all())?.len(), 2);

    Ok(())
}

#[test]
fn test_save_as_into_new_namespace_round_trip() -> Result<()> {
    let (_temp, layout, store) = setup()?;
    let mut original = Project::create(&stub("proj1"), layout, "base", &clock())?;
    original
        .manifest_mut()
        .extra
        .insert("topic_modeling".to_string(), json!({"k": 20, "stop": ["a", "b"]}));
    let original_id = original.save(&store)?;

    let mut copy = original.save_as("proj1", Some("ns2"), &clock())?;
    let copy_id = copy.save(&store)?;

    let stored = store.get(&copy_id)?.unwrap();
    assert_eq!(&stored, copy.manifest());
    assert_eq!(stored.key(), ProjectKey::new("ns2", "proj1"));
    assert_eq!(stored.extra["topic_modeling"], json!({"k": 20, "stop": ["a", "b"]}));

    let by_old_key = store.find_one(&ManifestQuery::by_key(&ProjectKey::new("ns1", "proj1")))?;
    assert_eq!(by_old_key.and_then(|m| m.id), Some(original_id));
    Ok(())
}

#[test]
fn test_save_as_onto_existing_directory_fails() -> Result<()> {
    let (_temp, layout, _store) = setup()?;
    let original = Project::create(&stub("proj1"), layout.clone(), "base", &clock())?;
    Project::create(&stub("proj2"), layout, "base", &clock())?;

    let err = original.save_as("proj2", None, &clock()).unwrap_err();
    assert!(matches!(err, ProjectError::Deploy(_)));
    Ok(())
}

#[test]
fn test_record_module_output() -> Result<()> {
    let (_temp, layout, _store) = setup()?;
    let mut project = Project::create(&stub("proj1"), layout.clone(), "base", &clock())?;

    project.record_module_output(
        "topic_modeling",
        Some(&json!({"num_topics": 50, "seed": 1})),
        Some("topic_modeling/index.html"),
    )?;
    let state = project.record_module_output("pyldavis", Some(&json!({"seed": null})), None)?;

    assert!(state.has_module("pyldavis"));
    assert_eq!(
        state.visualisations.get("topic_modeling").map(String::as_str),
        Some("topic_modeling/index.html")
    );

    project.record_module_output("topic_modeling", Some(&json!({"seed": null})), None)?;
    assert_eq!(
        project.manifest().module_fields("topic_modeling"),
        Some(&json!({"num_topics": 50}))
    );

    // The directory copy of the manifest follows along
    let dir = project.project_dir().unwrap().to_path_buf();
    let reopened = Project::open(&dir, layout)?;
    assert_eq!(reopened.manifest(), project.manifest());

    let state = project.clear_visualisation("topic_modeling")?;
    assert!(state.visualisations.is_empty());
    let page = fs::read_to_string(dir.join("start"))?;
    assert!(!page.contains("vis-topic_modeling"));
    assert!(page.contains("id=\"module-pyldavis\""));

    Ok(())
}

#[test]
fn test_append_version_numbers() -> Result<()> {
    let (_temp, layout, _store) = setup()?;
    let mut project = Project::create(&stub("proj1"), layout, "base", &clock())?;

    let v2 = project.append_version(&clock(), None)?;
    let v3 = project.append_version(&clock(), Some("final".to_string()))?;
    assert_eq!(v2.version_number, 2);
    assert_eq!(v3.version_number, 3);
    assert_eq!(v2.version_name, "20240309140507_v2_proj1");
    assert_eq!(v3.version_name, "final");
    assert_eq!(v3.version_workflow.as_deref(), Some("base"));
    Ok(())
}

#[test]
fn test_load_exists_and_delete() -> Result<()> {
    let (_temp, layout, store) = setup()?;
    let mut project = Project::create(&stub("proj1"), layout.clone(), "base", &clock())?;
    assert!(!project.exists(&store)?);

    let id = project.save(&store)?;
    assert!(project.exists(&store)?);

    let by_name = ManifestKey::Name(ProjectKey::new("ns1", "proj1"));
    let loaded = Project::load(&store, &by_name, layout.clone())?.unwrap();
    assert_eq!(loaded.state(), ProjectState::Persisted);
    assert_eq!(loaded.id(), Some(&id));
    assert_eq!(loaded.project_dir(), project.project_dir());

    assert!(project.delete(&store)?);
    assert!(!project.exists(&store)?);
    assert!(Project::load(&store, &ManifestKey::Id(id), layout)?.is_none());

    // Deleting only touches the store
    assert!(project.project_dir().unwrap().is_dir());
    Ok(())
}

#[test]
fn test_export_version() -> Result<()> {
    let (_temp, layout, _store) = setup()?;
    let mut project = Project::create(&stub("proj1"), layout.clone(), "base", &clock())?;
    project
        .manifest_mut()
        .extra
        .insert("builder_scratch".to_string(), json!("x"));

    let out = project.export(None)?;
    assert_eq!(out, layout.temp_dir.join("20240309140507_v1_proj1"));
    assert!(out.join("project/start").is_file());
    assert!(out.join("project/topic_modeling/settings.txt").is_file());

    let exported: Value = serde_json::from_str(&fs::read_to_string(out.join(MANIFEST_FILE))?)?;
    assert_eq!(exported["name"], json!("proj1"));
    assert!(exported.get("builder_scratch").is_none());
    assert_eq!(exported["content"].as_array().map(Vec::len), Some(1));

    // Same version again collides
    assert!(project.export(Some(1)).is_err());
    assert!(matches!(
        project.export(Some(7)),
        Err(ProjectError::VersionNotFound { number: 7, .. })
    ));
    Ok(())
}

#[test]
fn test_deploy_module_adds_to_start_page() -> Result<()> {
    let (temp, layout, _store) = setup()?;
    let mut project = Project::create(&stub("proj1"), layout, "base", &clock())?;

    fs::create_dir_all(temp.path().join("templates/base/json_to_txt"))?;
    fs::write(
        temp.path().join("templates/base/json_to_txt/run.txt"),
        "{{ namespace }}",
    )?;

    let result = project.deploy_module("json_to_txt", &clock())?;
    assert_eq!(result.files_copied, 1);
    let dir = project.project_dir().unwrap();
    assert_eq!(fs::read_to_string(dir.join("json_to_txt/run.txt"))?, "ns1");
    assert!(project.start_page()?.has_module("json_to_txt"));

    // A second deploy refuses to overwrite
    assert!(project.deploy_module("json_to_txt", &clock()).is_err());
    Ok(())
}

#[test]
fn test_versions_archive_launch_and_delete() -> Result<()> {
    let (_temp, layout, store) = setup()?;
    let mut project = Project::create(&stub("proj1"), layout.clone(), "base", &clock())?;
    let id = project.save(&store)?;
    let dir = project.project_dir().unwrap().to_path_buf();

    let v1 = project.checkpoint(&clock())?;
    assert!(matches!(v1, Checkpoint::Archived(_)));
    fs::write(dir.join("dfr_browser/index.html"), "<p>v2</p>")?;
    let v2 = project.checkpoint(&clock())?;
    assert!(matches!(v2, Checkpoint::Bumped(ref v) if v.version_number == 2));
    project.save(&store)?;

    // Zip export copies the stored archive
    let zip = project.export_zip(Some(1))?;
    assert_eq!(zip, layout.temp_dir.join("20240309140507_v1_proj1.zip"));
    assert!(project.export_zip(Some(1)).is_err());

    // Launch an old version beside the live project
    let launched = project.launch(Some(1))?;
    assert_eq!(launched, layout.version_dir(&project.key(), "20240309140507_v1_proj1"));
    assert_eq!(fs::read_to_string(launched.join("dfr_browser/index.html"))?, "<p>browser</p>");
    assert!(launched.join(MANIFEST_FILE).is_file());
    assert_eq!(project.launch(Some(1))?, launched);

    // Deleting a version updates the stored record and drops the archive
    let archive = layout
        .archive_dir(&project.key())
        .join(v1.record().version_zipfile.as_deref().unwrap());
    project.delete_version(1, &store)?;
    assert!(!archive.exists());
    let stored = store.get(&id)?.unwrap();
    assert_eq!(stored.content.len(), 1);
    assert_eq!(stored.content[0].version_number, 2);
    assert!(matches!(
        project.delete_version(1, &store),
        Err(ProjectError::VersionNotFound { number: 1, .. })
    ));

    // A fresh machine: the directory is gone, the next version comes from the archive
    fs::remove_dir_all(&dir)?;
    let mut loaded = Project::load(&store, &ManifestKey::Id(id), layout)?.unwrap();
    let v3 = loaded.launch_next(&clock())?;
    assert_eq!(v3.version_number, 3);
    assert_eq!(fs::read_to_string(dir.join("dfr_browser/index.html"))?, "<p>v2</p>");
    assert!(matches!(
        loaded.launch_next(&clock()),
        Err(ProjectError::Deploy(_))
    ));
    Ok(())
}

#[test]
fn test_unarchived_version_cannot_launch() -> Result<()> {
    let (_temp, layout, _store) = setup()?;
    let mut project = Project::create(&stub("proj1"), layout, "base", &clock())?;
    project.append_version(&clock(), None)?;

    assert!(matches!(
        project.launch(Some(1)),
        Err(ProjectError::VersionNotArchived { number: 1, .. })
    ));
    // Only the latest version can be zipped from the live directory
    assert!(matches!(
        project.export_zip(Some(1)),
        Err(ProjectError::VersionNotArchived { number: 1, .. })
    ));
    assert!(project.export_zip(None)?.is_file());
    Ok(())
}
