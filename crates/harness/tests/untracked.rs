use verstate_core::ids::*;
use verstate_harness::{TestRepo, text};

#[test]
fn untracked_writes_stay_out_of_history() -> Result<(), Box<dyn std::error::Error>> {
    let mut repo = TestRepo::with_todos()?;
    let main = repo.main()?.id;
    let head = repo.head(&main)?;

    repo.exec(
        "INSERT INTO todo (id, title, sys_untracked) VALUES (?, ?, 1)",
        &[text("u"), text("draft")],
    )?;
    repo.exec("UPDATE todo SET title = ? WHERE id = ?", &[text("edited"), text("u")])?;

    assert_eq!(repo.head(&main)?, head);
    assert_eq!(repo.count("SELECT COUNT(*) FROM change WHERE schema_key = 'todo'")?, 0);
    assert_eq!(repo.title(&main, "u")?.as_deref(), Some("edited"));
    assert_eq!(
        repo.count("SELECT COUNT(*) FROM todo WHERE sys_untracked = 1")?,
        1
    );
    Ok(())
}

#[test]
fn untracked_row_wins_over_tracked_row() -> Result<(), Box<dyn std::error::Error>> {
    let mut repo = TestRepo::with_todos()?;
    let main = repo.main()?.id;
    repo.insert_todo("a", "tracked")?;

    repo.exec(
        "INSERT INTO todo (id, title, sys_untracked) VALUES (?, ?, 1)",
        &[text("a"), text("scratch")],
    )?;
    assert_eq!(repo.title(&main, "a")?.as_deref(), Some("scratch"));

    // Deleting the untracked row uncovers the tracked one
    repo.exec("DELETE FROM todo WHERE id = ?", &[text("a")])?;
    assert_eq!(repo.title(&main, "a")?.as_deref(), Some("tracked"));
    Ok(())
}

#[test]
fn deleting_inherited_untracked_row_writes_a_tombstone() -> Result<(), Box<dyn std::error::Error>> {
    let mut repo = TestRepo::with_todos()?;
    let global = VersionId::global();
    let main = repo.main()?.id;
    repo.exec(
        "INSERT INTO todo_by_version (id, title, sys_version_id, sys_untracked) VALUES (?, ?, ?, 1)",
        &[text("g"), text("shared"), text(global.as_str())],
    )?;
    assert_eq!(repo.title(&main, "g")?.as_deref(), Some("shared"));

    repo.exec("DELETE FROM todo WHERE id = ?", &[text("g")])?;
    assert_eq!(repo.title(&main, "g")?, None);
    assert_eq!(repo.title(&global, "g")?.as_deref(), Some("shared"));

    // The tombstone is revivable
    repo.exec(
        "INSERT INTO todo (id, title, sys_untracked) VALUES (?, ?, 1)",
        &[text("g"), text("mine")],
    )?;
    assert_eq!(repo.title(&main, "g")?.as_deref(), Some("mine"));
    Ok(())
}
