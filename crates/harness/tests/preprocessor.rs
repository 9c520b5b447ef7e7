use rusqlite::types::Value as SqlValue;
use serde_json::json;
use verstate_core::{
    change::EntityKey,
    schema::{PropertyType, Schema},
};
use verstate_engine::EngineError;
use verstate_harness::{TestRepo, int, text};

fn list_schema() -> Schema {
    Schema::new("list", "1.0")
        .property("id", PropertyType::String)
        .property("name", PropertyType::String)
        .primary_key(&["id"])
        .unique(&["name"])
}

fn item_schema() -> Schema {
    Schema::new("item", "1.0")
        .property("id", PropertyType::String)
        .property("list_id", PropertyType::String)
        .property("label", PropertyType::String)
        .primary_key(&["id"])
        .foreign_key(&["list_id"], "list", &["id"])
}

fn lists() -> Result<TestRepo, EngineError> {
    let mut repo = TestRepo::new()?;
    repo.engine.register_schema(list_schema())?;
    repo.engine.register_schema(item_schema())?;
    Ok(repo)
}

// ============================================================================
// Entity views
// ============================================================================

#[test]
fn insert_update_select_round_trip() -> Result<(), Box<dyn std::error::Error>> {
    let mut repo = TestRepo::with_todos()?;

    repo.exec("INSERT INTO todo (id, title) VALUES (?, ?)", &[text("a"), text("draft")])?;
    repo.exec("UPDATE todo SET title = ? WHERE id = ?", &[text("final"), text("a")])?;
    let result = repo.exec("SELECT title FROM todo WHERE id = ?", &[text("a")])?;

    assert_eq!(result.columns, vec!["title"]);
    assert_eq!(result.rows, vec![vec![text("final")]]);
    Ok(())
}

#[test]
fn every_view_write_is_a_commit() -> Result<(), Box<dyn std::error::Error>> {
    let mut repo = TestRepo::with_todos()?;
    let main = repo.main()?.id;
    let root = repo.head(&main)?;

    repo.insert_todo("a", "one")?;
    let first = repo.head(&main)?;
    repo.exec("UPDATE todo SET done = 1 WHERE id = ?", &[text("a")])?;
    let second = repo.head(&main)?;

    assert_ne!(first, root);
    assert_ne!(second, first);
    let parents = repo.engine.storage().conn().query_row(
        "SELECT parent_commit_ids FROM internal_commit WHERE id = ?1",
        [second.as_str()],
        |r| r.get::<_, String>(0),
    )?;
    assert_eq!(parents, format!("[\"{first}\"]"));

    assert_eq!(
        repo.todo(&main, "a")?,
        Some(json!({"id": "a", "title": "one", "done": 1}))
    );
    assert_eq!(repo.count("SELECT COUNT(*) FROM change WHERE entity_id = 'a'")?, 2);
    Ok(())
}

#[test]
fn multi_row_insert_is_one_commit() -> Result<(), Box<dyn std::error::Error>> {
    let mut repo = TestRepo::with_todos()?;
    let main = repo.main()?.id;
    let root = repo.head(&main)?;

    repo.query("INSERT INTO todo (id, title) VALUES ('a', 'one'), ('b', 'two'), ('c', 'three')")?;

    let head = repo.engine.storage().conn().query_row(
        "SELECT parent_commit_ids FROM internal_commit WHERE id = ?1",
        [repo.head(&main)?.as_str()],
        |r| r.get::<_, String>(0),
    )?;
    assert_eq!(head, format!("[\"{root}\"]"));
    assert_eq!(repo.todos(&main)?.len(), 3);
    Ok(())
}

#[test]
fn composite_primary_key_joins_parts() -> Result<(), Box<dyn std::error::Error>> {
    let mut repo = TestRepo::new()?;
    repo.engine.register_schema(
        Schema::new("cell", "1.0")
            .property("sheet", PropertyType::String)
            .property("line", PropertyType::Integer)
            .property("content", PropertyType::Any)
            .primary_key(&["sheet", "line"]),
    )?;

    repo.exec(
        "INSERT INTO cell (sheet, line, content) VALUES (?, ?, ?)",
        &[text("s1"), int(2), text("x")],
    )?;

    let result = repo.query("SELECT sys_entity_id, line FROM cell")?;
    assert_eq!(result.rows, vec![vec![text("s1~2"), int(2)]]);
    Ok(())
}

#[test]
fn updating_the_primary_key_renames_the_entity() -> Result<(), Box<dyn std::error::Error>> {
    let mut repo = TestRepo::with_todos()?;
    let main = repo.main()?.id;
    repo.insert_todo("a", "one")?;

    repo.exec("UPDATE todo SET id = ? WHERE id = ?", &[text("b"), text("a")])?;

    assert_eq!(repo.todo(&main, "a")?, None);
    assert_eq!(repo.title(&main, "b")?.as_deref(), Some("one"));
    Ok(())
}

#[test]
fn defaults_fill_omitted_properties() -> Result<(), Box<dyn std::error::Error>> {
    let mut repo = TestRepo::new()?;
    repo.engine.register_schema(
        Schema::new("task", "1.0")
            .property("id", PropertyType::String)
            .property("done", PropertyType::Boolean)
            .property("tags", PropertyType::Array)
            .primary_key(&["id"])
            .default_value("done", json!(false))
            .default_value("tags", json!([])),
    )?;
    let main = repo.main()?.id;

    repo.query("INSERT INTO task (id) VALUES ('t1')")?;

    let row = repo
        .engine
        .entity(&EntityKey::new("t1", "task", "sys"), &main)?
        .ok_or("task missing")?;
    assert_eq!(row.snapshot_content, json!({"id": "t1", "done": false, "tags": []}));
    Ok(())
}

#[test]
fn routing_override_sets_the_file() -> Result<(), Box<dyn std::error::Error>> {
    let mut repo = TestRepo::new()?;
    repo.engine.register_schema(
        Schema::new("setting", "1.0")
            .property("name", PropertyType::String)
            .property("value", PropertyType::Any)
            .primary_key(&["name"])
            .with_override("sys_file_id", json!("settings.json")),
    )?;
    let main = repo.main()?.id;

    repo.query("INSERT INTO setting (name, value) VALUES ('theme', 'dark')")?;

    let row = repo
        .engine
        .entity(&EntityKey::new("theme", "setting", "settings.json"), &main)?
        .ok_or("setting missing")?;
    assert_eq!(row.snapshot_content["value"], "dark");
    let files = repo.query("SELECT sys_file_id FROM setting")?;
    assert_eq!(files.rows, vec![vec![text("settings.json")]]);
    Ok(())
}

#[test]
fn by_version_view_requires_a_version() -> Result<(), Box<dyn std::error::Error>> {
    let mut repo = TestRepo::with_todos()?;

    let err = repo
        .query("INSERT INTO todo_by_version (id, title) VALUES ('a', 'one')")
        .unwrap_err();
    assert!(matches!(err, EngineError::SchemaValidation { .. }));
    Ok(())
}

#[test]
fn unknown_columns_are_rejected() -> Result<(), Box<dyn std::error::Error>> {
    let mut repo = TestRepo::with_todos()?;

    let err = repo
        .query("INSERT INTO todo (id, colour) VALUES ('a', 'red')")
        .unwrap_err();
    assert!(matches!(err, EngineError::SchemaValidation { .. }));
    Ok(())
}

// ============================================================================
// Immutable schemas
// ============================================================================

fn tags() -> Result<TestRepo, EngineError> {
    let mut repo = TestRepo::new()?;
    repo.engine.register_schema(
        Schema::new("tag", "1.0")
            .property("id", PropertyType::String)
            .primary_key(&["id"])
            .immutable(),
    )?;
    Ok(repo)
}

#[test]
fn immutable_update_is_rejected_even_without_matches() -> Result<(), Box<dyn std::error::Error>> {
    let mut repo = tags()?;

    let err = repo
        .query("UPDATE tag SET id = 'x' WHERE id = 'missing'")
        .unwrap_err();
    assert!(matches!(err, EngineError::ImmutableSchemaViolation { .. }));

    let err = repo.query("DELETE FROM tag").unwrap_err();
    assert!(matches!(err, EngineError::ImmutableSchemaViolation { .. }));
    Ok(())
}

#[test]
fn immutable_entities_are_created_once() -> Result<(), Box<dyn std::error::Error>> {
    let mut repo = tags()?;

    repo.query("INSERT INTO tag (id) VALUES ('urgent')")?;
    let err = repo.query("INSERT INTO tag (id) VALUES ('urgent')").unwrap_err();
    assert!(matches!(err, EngineError::ImmutableSchemaViolation { .. }));
    assert_eq!(repo.count("SELECT COUNT(*) FROM tag")?, 1);
    Ok(())
}

#[test]
fn commit_graph_cannot_be_written() -> Result<(), Box<dyn std::error::Error>> {
    let mut repo = TestRepo::new()?;

    let err = repo.query("DELETE FROM sys_commit").unwrap_err();
    assert!(matches!(err, EngineError::ImmutableSchemaViolation { .. }));
    Ok(())
}

// ============================================================================
// Constraints
// ============================================================================

#[test]
fn foreign_keys_must_resolve() -> Result<(), Box<dyn std::error::Error>> {
    let mut repo = lists()?;

    let err = repo
        .query("INSERT INTO item (id, list_id, label) VALUES ('i1', 'l1', 'milk')")
        .unwrap_err();
    assert!(matches!(err, EngineError::SchemaValidation { .. }));
    assert_eq!(repo.count("SELECT COUNT(*) FROM item")?, 0);

    repo.query("INSERT INTO list (id, name) VALUES ('l1', 'groceries')")?;
    repo.query("INSERT INTO item (id, list_id, label) VALUES ('i1', 'l1', 'milk')")?;

    let err = repo.query("DELETE FROM list WHERE id = 'l1'").unwrap_err();
    assert!(matches!(err, EngineError::SchemaValidation { .. }));
    assert_eq!(repo.count("SELECT COUNT(*) FROM list")?, 1);
    Ok(())
}

#[test]
fn writes_succeed_after_a_rejected_first_write() -> Result<(), Box<dyn std::error::Error>> {
    let mut repo = lists()?;

    // The first statement would create the first child commit and is rolled back
    let err = repo
        .query("INSERT INTO item (id, list_id, label) VALUES ('i1', 'l1', 'milk')")
        .unwrap_err();
    assert!(matches!(err, EngineError::SchemaValidation { .. }));

    repo.query("INSERT INTO list (id, name) VALUES ('l1', 'groceries')")?;
    repo.query("INSERT INTO item (id, list_id, label) VALUES ('i1', 'l1', 'milk')")?;
    assert_eq!(repo.count("SELECT COUNT(*) FROM item")?, 1);
    assert!(repo.count("SELECT COUNT(*) FROM sys_commit_edge")? >= 2);
    Ok(())
}

#[test]
fn unique_sets_are_enforced() -> Result<(), Box<dyn std::error::Error>> {
    let mut repo = lists()?;

    repo.query("INSERT INTO list (id, name) VALUES ('l1', 'groceries')")?;
    let err = repo
        .query("INSERT INTO list (id, name) VALUES ('l2', 'groceries')")
        .unwrap_err();
    assert!(matches!(err, EngineError::SchemaValidation { .. }));

    // Rewriting the same entity keeps its own value
    repo.query("UPDATE list SET name = 'groceries' WHERE id = 'l1'")?;
    Ok(())
}

#[test]
fn joins_across_entity_views() -> Result<(), Box<dyn std::error::Error>> {
    let mut repo = lists()?;
    repo.query("INSERT INTO list (id, name) VALUES ('l1', 'groceries')")?;
    repo.query("INSERT INTO item (id, list_id, label) VALUES ('i1', 'l1', 'milk'), ('i2', 'l1', 'eggs')")?;

    let result = repo.query(
        "SELECT i.label, l.name FROM item i JOIN list l ON l.id = i.list_id ORDER BY i.label",
    )?;
    assert_eq!(
        result.rows,
        vec![
            vec![text("eggs"), text("groceries")],
            vec![text("milk"), text("groceries")],
        ]
    );
    Ok(())
}

// ============================================================================
// State views and pass-through
// ============================================================================

#[test]
fn state_view_reads_and_writes() -> Result<(), Box<dyn std::error::Error>> {
    let mut repo = TestRepo::with_todos()?;
    let main = repo.main()?.id;
    repo.insert_todo("a", "one")?;

    repo.query(
        "INSERT INTO state (entity_id, schema_key, file_id, plugin_key, schema_version, snapshot_content) \
         VALUES ('b', 'todo', 'sys', 'sys_entity', '1.0', '{\"id\":\"b\",\"title\":\"raw\"}')",
    )?;
    assert_eq!(repo.title(&main, "b")?.as_deref(), Some("raw"));

    let result = repo.query(
        "SELECT entity_id FROM state WHERE schema_key = 'todo' ORDER BY entity_id",
    )?;
    assert_eq!(result.rows, vec![vec![text("a")], vec![text("b")]]);
    Ok(())
}

#[test]
fn common_table_expressions_are_expanded() -> Result<(), Box<dyn std::error::Error>> {
    let mut repo = TestRepo::with_todos()?;
    repo.insert_todo("a", "one")?;
    repo.insert_todo("b", "two")?;
    repo.exec("UPDATE todo SET done = 1 WHERE id = ?", &[text("b")])?;

    let pending = repo.count(
        "WITH pending AS (SELECT id FROM todo WHERE done = 0) SELECT COUNT(*) FROM pending",
    )?;
    assert_eq!(pending, 1);
    Ok(())
}

#[test]
fn ddl_and_plain_tables_bypass_rewriting() -> Result<(), Box<dyn std::error::Error>> {
    let mut repo = TestRepo::with_todos()?;

    repo.query("CREATE TABLE notes (id TEXT PRIMARY KEY, body TEXT)")?;
    let inserted = repo.exec("INSERT INTO notes (id, body) VALUES (?, ?)", &[text("n"), text("hi")])?;
    assert_eq!(inserted.rows_affected, 1);
    assert_eq!(repo.count("SELECT COUNT(*) FROM notes")?, 1);

    let version = repo.query("SELECT name FROM active_version")?;
    assert_eq!(version.rows, vec![vec![text("main")]]);
    Ok(())
}

#[test]
fn parameters_are_renumbered() -> Result<(), Box<dyn std::error::Error>> {
    let mut repo = TestRepo::with_todos()?;

    repo.exec(
        "INSERT INTO todo (id, title, done) VALUES (:id, :title, 0)",
        &[text("a"), text("named")],
    )?;
    let result = repo.exec("SELECT ?1 || title FROM todo WHERE id = ?2", &[text(">"), text("a")])?;
    assert_eq!(result.rows, vec![vec![SqlValue::Text(">named".into())]]);
    Ok(())
}
