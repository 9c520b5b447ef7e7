use verstate_core::ids::*;
use verstate_engine::EngineError;
use verstate_harness::{TestRepo, text};

#[test]
fn transition_moves_state_to_the_target() -> Result<(), Box<dyn std::error::Error>> {
    let mut repo = TestRepo::with_todos()?;
    let main = repo.main()?.id;
    repo.insert_todo("a", "one")?;
    let checkpoint = repo.head(&main)?;
    repo.insert_todo("b", "two")?;
    repo.exec("UPDATE todo SET title = ? WHERE id = ?", &[text("uno"), text("a")])?;
    let before = repo.head(&main)?;

    let commit = repo.engine.transition(&main, &checkpoint)?;

    assert_eq!(repo.head(&main)?, commit);
    assert_eq!(repo.title(&main, "a")?.as_deref(), Some("one"));
    assert_eq!(repo.todo(&main, "b")?, None);
    assert_eq!(repo.count("SELECT COUNT(*) FROM todo")?, 1);

    let parents = repo
        .engine
        .storage()
        .conn()
        .query_row(
            "SELECT parent_commit_ids FROM internal_commit WHERE id = ?1",
            [commit.as_str()],
            |r| r.get::<_, String>(0),
        )?;
    assert_eq!(parents, format!("[\"{before}\",\"{checkpoint}\"]"));
    Ok(())
}

#[test]
fn transition_is_idempotent() -> Result<(), Box<dyn std::error::Error>> {
    let mut repo = TestRepo::with_todos()?;
    let main = repo.main()?.id;
    repo.insert_todo("a", "one")?;
    let checkpoint = repo.head(&main)?;
    repo.insert_todo("b", "two")?;

    let first = repo.engine.transition(&main, &checkpoint)?;
    let second = repo.engine.transition(&main, &checkpoint)?;

    assert_eq!(first, second);
    assert_eq!(repo.head(&main)?, first);
    Ok(())
}

#[test]
fn transition_to_the_head_is_a_no_op() -> Result<(), Box<dyn std::error::Error>> {
    let mut repo = TestRepo::with_todos()?;
    let main = repo.main()?.id;
    repo.insert_todo("a", "one")?;
    let head = repo.head(&main)?;

    assert_eq!(repo.engine.transition(&main, &head)?, head);
    assert_eq!(repo.head(&main)?, head);
    Ok(())
}

#[test]
fn transition_restores_deleted_entities() -> Result<(), Box<dyn std::error::Error>> {
    let mut repo = TestRepo::with_todos()?;
    let main = repo.main()?.id;
    repo.insert_todo("a", "one")?;
    let checkpoint = repo.head(&main)?;
    repo.exec("DELETE FROM todo WHERE id = ?", &[text("a")])?;
    assert_eq!(repo.todo(&main, "a")?, None);

    repo.engine.transition(&main, &checkpoint)?;
    assert_eq!(repo.title(&main, "a")?.as_deref(), Some("one"));
    Ok(())
}

#[test]
fn transition_can_target_another_version() -> Result<(), Box<dyn std::error::Error>> {
    let mut repo = TestRepo::with_todos()?;
    let main = repo.main()?.id;
    repo.insert_todo("a", "one")?;
    let feature = repo.branch("feature")?;
    repo.insert_todo_in(&feature.id, "b", "two")?;
    repo.insert_todo("c", "three")?;

    let target = repo.head(&feature.id)?;
    repo.engine.transition(&main, &target)?;

    let ids: Vec<_> = repo.todos(&main)?.into_iter().map(|r| r.entity_id).collect();
    assert_eq!(ids, vec!["a", "b"]);
    // The other version is untouched
    assert_eq!(repo.head(&feature.id)?, target);
    Ok(())
}

#[test]
fn unknown_target_is_rejected() -> Result<(), Box<dyn std::error::Error>> {
    let mut repo = TestRepo::with_todos()?;
    let main = repo.main()?.id;
    let head = repo.head(&main)?;

    let err = repo.engine.transition(&main, &CommitId::new()).unwrap_err();
    assert!(matches!(err, EngineError::CommitNotFound(_)));
    assert_eq!(repo.head(&main)?, head);
    Ok(())
}

#[test]
fn transition_keeps_local_shadowing_of_global_entities() -> Result<(), Box<dyn std::error::Error>> {
    let mut repo = TestRepo::with_todos()?;
    let global = VersionId::global();
    let main = repo.main()?.id;
    let checkpoint = repo.head(&main)?;
    repo.insert_todo_in(&global, "g", "shared")?;
    repo.exec("DELETE FROM todo WHERE id = ?", &[text("g")])?;
    assert_eq!(repo.title(&main, "g")?, None);

    repo.engine.transition(&main, &checkpoint)?;

    assert_eq!(repo.title(&main, "g")?, None);
    repo.engine.rebuild_version(&main)?;
    assert_eq!(repo.title(&main, "g")?, None);
    assert_eq!(repo.title(&global, "g")?.as_deref(), Some("shared"));
    Ok(())
}
