use serde_json::json;
use verstate_core::{
    change::{Change, ChangeSetElement, Commit, EntityKey},
    ids::*,
};
use verstate_storage::{GraphStore, SqliteStorage, StorageError};

fn commit(
    storage: &mut SqliteStorage,
    changes: &[Change],
    parents: Vec<CommitId>,
) -> Result<CommitId, StorageError> {
    storage.append_changes(changes)?;
    let set = ChangeSetId::new();
    let elements: Vec<_> = changes
        .iter()
        .map(|c| ChangeSetElement::for_change(&set, c))
        .collect();
    storage.create_change_set(&set, &elements)?;
    let commit = Commit::new(set, parents);
    storage.create_commit(&commit)?;
    Ok(commit.id)
}

fn change(key: &EntityKey, snapshot: serde_json::Value) -> Change {
    Change::new(key, "1.0", "test_plugin", Some(snapshot))
}

// ============================================================================
// Leaf resolution
// ============================================================================

#[test]
fn later_commit_shadows_earlier_change() -> Result<(), Box<dyn std::error::Error>> {
    let mut storage = SqliteStorage::open_in_memory()?;
    let e1 = EntityKey::new("e1", "k", "f");

    let a = commit(&mut storage, &[change(&e1, json!({"v": 1}))], vec![])?;
    let b = commit(&mut storage, &[change(&e1, json!({"v": 2}))], vec![a.clone()])?;

    let at_b = storage.resolve_leaf_changes(&b)?;
    assert_eq!(at_b[&e1].change.snapshot_content, Some(json!({"v": 2})));
    assert_eq!(at_b[&e1].commit_id, b);
    assert_eq!(at_b[&e1].depth, 0);

    // History is never rewritten
    let at_a = storage.resolve_leaf_changes(&a)?;
    assert_eq!(at_a[&e1].change.snapshot_content, Some(json!({"v": 1})));

    // Repeated resolution is stable
    assert_eq!(storage.resolve_leaf_changes(&b)?, at_b);
    Ok(())
}

#[test]
fn diamond_history_has_a_single_winner() -> Result<(), Box<dyn std::error::Error>> {
    let mut storage = SqliteStorage::open_in_memory()?;
    let e1 = EntityKey::new("e1", "k", "f");
    let e2 = EntityKey::new("e2", "k", "f");

    let root = commit(
        &mut storage,
        &[change(&e1, json!({"v": 0})), change(&e2, json!({"v": 0}))],
        vec![],
    )?;
    let left = commit(&mut storage, &[change(&e1, json!({"v": "left"}))], vec![root.clone()])?;
    let right = commit(&mut storage, &[change(&e2, json!({"v": "right"}))], vec![root.clone()])?;
    let merge = commit(&mut storage, &[], vec![left.clone(), right.clone()])?;

    let leaves = storage.resolve_leaf_changes(&merge)?;
    assert_eq!(leaves.len(), 2);
    assert_eq!(leaves[&e1].change.snapshot_content, Some(json!({"v": "left"})));
    assert_eq!(leaves[&e1].depth, 1);
    assert_eq!(leaves[&e2].change.snapshot_content, Some(json!({"v": "right"})));
    assert_eq!(leaves[&e2].commit_id, right);

    // The root is reachable twice but visited once, at its shortest depth
    let ancestry = storage.ancestry(&merge, None)?;
    let roots: Vec<_> = ancestry.iter().filter(|(id, _)| *id == root).collect();
    assert_eq!(roots, vec![&(root.clone(), 2)]);
    Ok(())
}

#[test]
fn deletion_is_a_leaf_too() -> Result<(), Box<dyn std::error::Error>> {
    let mut storage = SqliteStorage::open_in_memory()?;
    let e1 = EntityKey::new("e1", "k", "f");

    let created = change(&e1, json!({"v": 1}));
    let a = commit(&mut storage, std::slice::from_ref(&created), vec![])?;
    let b = commit(&mut storage, &[created.deletion()], vec![a])?;

    let leaves = storage.resolve_leaf_changes(&b)?;
    assert!(leaves[&e1].change.is_deletion());
    Ok(())
}

// ============================================================================
// Integrity
// ============================================================================

#[test]
fn dangling_parent_is_rejected() -> Result<(), Box<dyn std::error::Error>> {
    let mut storage = SqliteStorage::open_in_memory()?;
    let e1 = EntityKey::new("e1", "k", "f");

    let result = commit(&mut storage, &[change(&e1, json!({"v": 1}))], vec![CommitId::new()]);
    assert!(matches!(result, Err(StorageError::DanglingParentCommit { .. })));
    Ok(())
}

#[test]
fn duplicate_change_id_is_rejected() -> Result<(), Box<dyn std::error::Error>> {
    let mut storage = SqliteStorage::open_in_memory()?;
    let e1 = EntityKey::new("e1", "k", "f");

    let first = change(&e1, json!({"v": 1}));
    storage.append_changes(std::slice::from_ref(&first))?;

    let mut copy = change(&e1, json!({"v": 2}));
    copy.id = first.id.clone();
    let result = storage.append_changes(&[copy]);
    assert!(matches!(result, Err(StorageError::DuplicateChangeId { .. })));

    // The original is untouched
    let stored = storage.get_change(&first.id)?;
    assert_eq!(stored.and_then(|c| c.snapshot_content), Some(json!({"v": 1})));
    Ok(())
}

#[test]
fn history_of_one_entity_is_closest_first() -> Result<(), Box<dyn std::error::Error>> {
    let mut storage = SqliteStorage::open_in_memory()?;
    let e1 = EntityKey::new("e1", "k", "f");
    let e2 = EntityKey::new("e2", "k", "f");

    let a = commit(&mut storage, &[change(&e1, json!({"v": 1}))], vec![])?;
    let b = commit(&mut storage, &[change(&e2, json!({"v": 1}))], vec![a])?;
    let c = commit(&mut storage, &[change(&e1, json!({"v": 2}))], vec![b])?;

    let history = storage.entity_history(&c, &e1, None)?;
    let versions: Vec<_> = history.iter().map(|c| c.snapshot_content.clone()).collect();
    assert_eq!(versions, vec![Some(json!({"v": 2})), Some(json!({"v": 1}))]);

    // A bounded search only sees the closest commits
    let bounded = storage.entity_history(&c, &e1, Some(2))?;
    assert_eq!(bounded.len(), 1);
    Ok(())
}
