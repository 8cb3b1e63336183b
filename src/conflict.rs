//! Conflict detection between a compressed local operation batch and an
//! incoming compressed remote batch (spec §4.5): direct conflicts (same
//! row touched on both sides), dependency conflicts (remote deletes a row
//! a local change still points at), reversed-dependency conflicts (local
//! deletes a row a remote change still points at), and insert conflicts
//! (both sides independently created a row with the same primary key).

use std::collections::HashSet;

use crate::engine::Engine;
use crate::error::Result;
use crate::model::{Command, Operation};
use crate::registry::content_type_id;

pub type RowKey = (u32, i64);

#[derive(Debug, Clone)]
pub struct DirectConflict {
    pub local: Operation,
    pub remote: Operation,
}

#[derive(Debug, Clone)]
pub struct DependencyConflict {
    /// The remote delete that removed a row another row still points at.
    pub remote_delete: Operation,
    /// The local op on the dependent row.
    pub local: Operation,
}

#[derive(Debug, Clone)]
pub struct ReversedDependencyConflict {
    /// The local delete that removed a row another row still points at.
    pub local_delete: Operation,
    /// The remote op on the dependent row.
    pub remote: Operation,
}

#[derive(Debug, Clone)]
pub struct InsertConflict {
    pub local: Operation,
    pub remote: Operation,
}

/// Rows (content_type_id, row_id) in tracked tables that hold a foreign
/// key pointing at `(model_name, pk)`.
fn related_ids(engine: &Engine, model_name: &str, pk: i64) -> Result<HashSet<RowKey>> {
    let mut out = HashSet::new();
    let dependents = engine.registry().dependents_of(model_name);
    for (table, fk_columns) in dependents {
        let ct = content_type_id(table.model_name(), table.table_name());
        for fk_column in fk_columns {
            let ids = {
                let conn = engine.conn();
                table.rows_referencing(&conn, fk_column, pk)?
            };
            out.extend(ids.into_iter().map(|id| (ct, id)));
        }
    }
    Ok(out)
}

fn model_name_of(engine: &Engine, content_type_id: u32) -> Option<String> {
    engine
        .registry()
        .by_content_type(content_type_id)
        .map(|t| t.model_name().to_string())
}

/// Same row touched on both sides, neither side inserting it fresh
/// (insert/insert is an [`InsertConflict`] instead).
pub fn find_direct_conflicts(local_ops: &[Operation], remote_ops: &[Operation]) -> Vec<DirectConflict> {
    let mut out = Vec::new();
    for local in local_ops {
        if local.command == Command::Insert {
            continue;
        }
        for remote in remote_ops {
            if remote.command == Command::Insert {
                continue;
            }
            if remote.content_type_id == local.content_type_id && remote.row_id == local.row_id {
                out.push(DirectConflict { local: local.clone(), remote: remote.clone() });
            }
        }
    }
    out
}

/// A remote delete whose row is still referenced by a locally-touched row.
pub fn find_dependency_conflicts(
    engine: &Engine,
    local_ops: &[Operation],
    remote_ops: &[Operation],
) -> Result<Vec<DependencyConflict>> {
    let mut out = Vec::new();
    for remote_delete in remote_ops.iter().filter(|op| op.command == Command::Delete) {
        let Some(model_name) = model_name_of(engine, remote_delete.content_type_id) else { continue };
        let related = related_ids(engine, &model_name, remote_delete.row_id)?;
        for local in local_ops {
            if local.command == Command::Delete {
                continue;
            }
            if related.contains(&(local.content_type_id, local.row_id)) {
                out.push(DependencyConflict { remote_delete: remote_delete.clone(), local: local.clone() });
            }
        }
    }
    Ok(out)
}

/// A local delete whose row is still referenced by a remotely-touched row.
pub fn find_reversed_dependency_conflicts(
    engine: &Engine,
    local_ops: &[Operation],
    remote_ops: &[Operation],
) -> Result<Vec<ReversedDependencyConflict>> {
    let mut out = Vec::new();
    for local_delete in local_ops.iter().filter(|op| op.command == Command::Delete) {
        let Some(model_name) = model_name_of(engine, local_delete.content_type_id) else { continue };
        let related = related_ids(engine, &model_name, local_delete.row_id)?;
        for remote in remote_ops {
            if remote.command == Command::Delete {
                continue;
            }
            if related.contains(&(remote.content_type_id, remote.row_id)) {
                out.push(ReversedDependencyConflict { local_delete: local_delete.clone(), remote: remote.clone() });
            }
        }
    }
    Ok(out)
}

/// Both sides independently inserted a row under the same primary key.
pub fn find_insert_conflicts(local_ops: &[Operation], remote_ops: &[Operation]) -> Vec<InsertConflict> {
    let mut out = Vec::new();
    for local in local_ops.iter().filter(|op| op.command == Command::Insert) {
        for remote in remote_ops.iter().filter(|op| op.command == Command::Insert) {
            if remote.content_type_id == local.content_type_id && remote.row_id == local.row_id {
                out.push(InsertConflict { local: local.clone(), remote: remote.clone() });
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(ct: u32, row_id: i64, command: Command) -> Operation {
        Operation { order: 1, row_id, content_type_id: ct, command, version_id: None }
    }

    #[test]
    fn direct_conflict_on_update_update() {
        let local = vec![op(1, 5, Command::Update)];
        let remote = vec![op(1, 5, Command::Delete)];
        let conflicts = find_direct_conflicts(&local, &remote);
        assert_eq!(conflicts.len(), 1);
    }

    #[test]
    fn no_direct_conflict_when_remote_inserts() {
        let local = vec![op(1, 5, Command::Update)];
        let remote = vec![op(1, 5, Command::Insert)];
        assert!(find_direct_conflicts(&local, &remote).is_empty());
    }

    #[test]
    fn insert_conflict_on_matching_pk() {
        let local = vec![op(1, 9, Command::Insert)];
        let remote = vec![op(1, 9, Command::Insert)];
        let conflicts = find_insert_conflicts(&local, &remote);
        assert_eq!(conflicts.len(), 1);
    }

    #[test]
    fn no_insert_conflict_on_distinct_pk() {
        let local = vec![op(1, 9, Command::Insert)];
        let remote = vec![op(1, 10, Command::Insert)];
        assert!(find_insert_conflicts(&local, &remote).is_empty());
    }
}
