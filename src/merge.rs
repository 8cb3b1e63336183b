//! Applying a pull to the local database (spec §4.8): compress both sides,
//! detect conflicts, resolve each class, then apply the surviving remote
//! operations and record the versions they arrived in.
//!
//! Conflict dispatch:
//!
//! | local | remote | resolution |
//! |---|---|---|
//! | `u` | `u` | local wins; remote op is dropped |
//! | `u` | `d` | local wins; remote delete is skipped, row stays, local's pending `u` is rewritten to `i` so it reasserts the row's existence on the next push |
//! | `d` | `u` | remote wins; row is resurrected from the pull payload, local delete is purged |
//! | `d` | `d` | already agree; both dropped |
//! | both `i`, same pk | local row is renumbered (insert-conflict) | |
//! | remote `d` on a row local still references | remote delete skipped, a synthetic local `i` is recorded for the parent so the next push reasserts it (dependency conflict) | |
//! | local `d` on a row remote still references | parent resurrected, local delete purged (reversed-dependency conflict) | |

use std::collections::HashSet;

use rusqlite::OptionalExtension;

use crate::codec;
use crate::compression;
use crate::conflict::{self, RowKey};
use crate::engine::Engine;
use crate::error::{Result, SyncError};
use crate::message::pull::PullMessage;
use crate::message::base::{find_object, WrappedObject};
use crate::model::{Command, Operation};
use crate::registry::{Row, TrackedTable};
use crate::tracking;

#[derive(Debug, Default, Clone, Copy)]
pub struct MergeOutcome {
    pub applied: usize,
    pub direct_conflicts: usize,
    pub dependency_conflicts: usize,
    pub reversed_dependency_conflicts: usize,
    pub insert_conflicts: usize,
}

/// Merges `pull` into the local database. Must run with exclusive access
/// to the engine (the caller typically holds the dialect's transaction for
/// the whole sync cycle).
pub fn merge(engine: &Engine, pull: &PullMessage) -> Result<MergeOutcome> {
    let local_ops = compression::compressed_operations(&tracking::pending_operations(engine)?);
    let mut remote_ops = compression::compressed_operations(&pull.operations);

    let direct = conflict::find_direct_conflicts(&local_ops, &remote_ops);
    let dependency = conflict::find_dependency_conflicts(engine, &local_ops, &remote_ops)?;
    let reversed = conflict::find_reversed_dependency_conflicts(engine, &local_ops, &remote_ops)?;
    let insert = conflict::find_insert_conflicts(&local_ops, &remote_ops);

    let mut skip_remote: HashSet<RowKey> = HashSet::new();
    let mut purge_local: HashSet<RowKey> = HashSet::new();
    let mut resurrect: HashSet<RowKey> = HashSet::new();
    let mut rewrite_to_insert: HashSet<RowKey> = HashSet::new();
    // (parent key, the local op to insert the synthetic parent `i` ahead of)
    let mut synthetic_parent_inserts: Vec<(RowKey, RowKey)> = Vec::new();

    for dc in &direct {
        let key = (dc.local.content_type_id, dc.local.row_id);
        match (dc.local.command, dc.remote.command) {
            (Command::Update, Command::Update) => {
                skip_remote.insert(key);
            }
            (Command::Update, Command::Delete) => {
                skip_remote.insert(key);
                rewrite_to_insert.insert(key);
            }
            (Command::Delete, Command::Update) => {
                resurrect.insert(key);
                purge_local.insert(key);
            }
            (Command::Delete, Command::Delete) => {
                skip_remote.insert(key);
                purge_local.insert(key);
            }
            _ => {}
        }
    }

    for depc in &dependency {
        let parent_key = (depc.remote_delete.content_type_id, depc.remote_delete.row_id);
        skip_remote.insert(parent_key);
        let child_key = (depc.local.content_type_id, depc.local.row_id);
        synthetic_parent_inserts.push((parent_key, child_key));
    }

    for rdc in &reversed {
        let key = (rdc.local_delete.content_type_id, rdc.local_delete.row_id);
        resurrect.insert(key);
        purge_local.insert(key);
    }

    // Conflict detection above may lock the connection itself (via FK
    // lookups); it must finish before the single transaction below takes
    // the lock for the rest of the merge, since the mutex isn't reentrant.
    let applied = engine.with_transaction(|conn| {
        for ic in &insert {
            renumber_insert_conflict(engine, conn, ic, &mut remote_ops)?;
        }

        let mut applied = 0usize;
        for op in remote_ops
            .iter()
            .filter(|op| !skip_remote.contains(&(op.content_type_id, op.row_id)))
        {
            apply_remote_operation(engine, conn, pull, op)?;
            applied += 1;
        }

        for key in &resurrect {
            resurrect_row(engine, conn, pull, *key)?;
        }

        for key in &rewrite_to_insert {
            rewrite_local_command(conn, *key, Command::Insert)?;
        }

        for (parent_key, child_key) in &synthetic_parent_inserts {
            insert_synthetic_parent_insert(conn, *child_key, *parent_key)?;
        }

        purge_local_operations(conn, &purge_local)?;
        record_versions(conn, pull)?;
        Ok(applied)
    })?;

    Ok(MergeOutcome {
        applied,
        direct_conflicts: direct.len(),
        dependency_conflicts: dependency.len(),
        reversed_dependency_conflicts: reversed.len(),
        insert_conflicts: insert.len(),
    })
}

pub(crate) fn table_for(engine: &Engine, content_type_id: u32) -> Result<std::sync::Arc<dyn TrackedTable>> {
    engine
        .registry()
        .by_content_type(content_type_id)
        .cloned()
        .ok_or(SyncError::State("unknown content type in remote operation"))
}

pub(crate) fn decode_row(table: &dyn TrackedTable, object: &WrappedObject) -> Result<Row> {
    let mut row = Row::new();
    for col in table.columns() {
        if let Some(value) = object.fields.get(col.name) {
            row.insert(col.name.to_string(), codec::decode(col.ty, value)?);
        }
    }
    Ok(row)
}

fn apply_remote_operation(engine: &Engine, conn: &rusqlite::Connection, pull: &PullMessage, op: &Operation) -> Result<()> {
    let table = table_for(engine, op.content_type_id)?;
    match op.command {
        Command::Insert | Command::Update => {
            let object = find_object(pull.payload(), table.model_name(), op.row_id).ok_or_else(|| {
                SyncError::Operation(format!(
                    "remote {} on {}#{} missing payload row",
                    op.command,
                    table.model_name(),
                    op.row_id
                ))
            })?;
            let row = decode_row(table.as_ref(), object)?;
            if op.command == Command::Insert {
                table.insert(conn, op.row_id, &row)?;
            } else {
                table.update(conn, op.row_id, &row)?;
            }
        }
        Command::Delete => {
            table.delete(conn, op.row_id)?;
        }
    }
    Ok(())
}

/// Restores a row a conflict resolution decided must keep existing. If the
/// row is already present locally (the delete that threatened it never
/// actually reached the table, e.g. a remote delete we chose to skip)
/// nothing needs to happen; otherwise it's rebuilt from the pull payload.
fn resurrect_row(engine: &Engine, conn: &rusqlite::Connection, pull: &PullMessage, key: RowKey) -> Result<()> {
    let (content_type_id, row_id) = key;
    let table = table_for(engine, content_type_id)?;
    if table.exists(conn, row_id)? {
        return Ok(());
    }
    let object = find_object(pull.payload(), table.model_name(), row_id).ok_or_else(|| {
        SyncError::Operation(format!(
            "cannot resurrect {}#{}: no row data in pull payload",
            table.model_name(),
            row_id
        ))
    })?;
    let row = decode_row(table.as_ref(), object)?;
    table.insert(conn, row_id, &row)
}

/// Rewrites the local pending operation for `key` to `command` (e.g. a local
/// `u` that loses a direct conflict against a remote `d` becomes an `i`, so
/// the next push reasserts the row's existence instead of resending a `u`
/// the server will silently ignore against a row it already deleted).
fn rewrite_local_command(conn: &rusqlite::Connection, key: RowKey, command: Command) -> Result<()> {
    let (content_type_id, row_id) = key;
    conn.execute(
        "UPDATE sync_operations SET command = ?1
         WHERE version_id IS NULL AND content_type_id = ?2 AND row_id = ?3",
        rusqlite::params![command.as_char().to_string(), content_type_id, row_id],
    )?;
    Ok(())
}

/// Records a dependency conflict's resolution in the local log: the parent
/// row survives (its remote delete was skipped) but nothing locally ever
/// logged it as existing, so a synthetic `i` is inserted for it, ordered
/// just ahead of the dependent local operation that forced the rescue.
/// Every pending operation from that slot onward is shifted up by one to
/// make room, preserving the log's append order.
fn insert_synthetic_parent_insert(conn: &rusqlite::Connection, child_key: RowKey, parent_key: RowKey) -> Result<()> {
    let (child_ct, child_row_id) = child_key;
    let (parent_ct, parent_row_id) = parent_key;

    let at_order: Option<i64> = conn
        .query_row(
            "SELECT \"order\" FROM sync_operations
             WHERE version_id IS NULL AND content_type_id = ?1 AND row_id = ?2",
            rusqlite::params![child_ct, child_row_id],
            |r| r.get(0),
        )
        .optional()?;
    let Some(at_order) = at_order else { return Ok(()) };

    let mut stmt = conn.prepare(
        "SELECT \"order\" FROM sync_operations WHERE version_id IS NULL AND \"order\" >= ?1 ORDER BY \"order\" DESC",
    )?;
    let to_shift: Vec<i64> = stmt.query_map([at_order], |r| r.get(0))?.collect::<rusqlite::Result<Vec<_>>>()?;
    drop(stmt);
    for order in to_shift {
        conn.execute("UPDATE sync_operations SET \"order\" = \"order\" + 1 WHERE \"order\" = ?1", [order])?;
    }

    conn.execute(
        "INSERT INTO sync_operations (\"order\", row_id, content_type_id, command, version_id)
         VALUES (?1, ?2, ?3, 'i', NULL)",
        rusqlite::params![at_order, parent_row_id, parent_ct],
    )?;
    Ok(())
}

fn purge_local_operations(conn: &rusqlite::Connection, purge: &HashSet<RowKey>) -> Result<()> {
    for (content_type_id, row_id) in purge {
        conn.execute(
            "DELETE FROM sync_operations WHERE version_id IS NULL AND content_type_id = ?1 AND row_id = ?2",
            rusqlite::params![content_type_id, row_id],
        )?;
    }
    Ok(())
}

fn record_versions(conn: &rusqlite::Connection, pull: &PullMessage) -> Result<()> {
    for version in &pull.versions {
        conn.execute(
            "INSERT OR IGNORE INTO sync_versions (version_id, node_id, created) VALUES (?1, ?2, ?3)",
            rusqlite::params![version.version_id, version.node_id, version.created.to_string()],
        )?;
    }
    Ok(())
}

/// Renumbers the locally-inserted row of an insert conflict to a fresh id
/// so the remote row can keep its original primary key, cascading the
/// rewrite to every local row that references it by foreign key (spec
/// §4.8's insert-conflict resolution).
fn renumber_insert_conflict(
    engine: &Engine,
    conn: &rusqlite::Connection,
    ic: &conflict::InsertConflict,
    remote_ops: &mut [Operation],
) -> Result<()> {
    let table = table_for(engine, ic.local.content_type_id)?;
    let old_pk = ic.local.row_id;

    let max_local = match crate::dialect::max_local_fast(conn, table.table_name())? {
        Some(seq) => seq,
        None => table.max_pk(conn)?.unwrap_or(old_pk),
    };
    let max_remote = remote_ops
        .iter()
        .filter(|op| op.content_type_id == ic.local.content_type_id)
        .map(|op| op.row_id)
        .max()
        .unwrap_or(old_pk);
    let new_pk = max_local.max(max_remote) + 1;

    let row = table
        .load(conn, old_pk)?
        .ok_or(SyncError::Operation("insert-conflict row vanished before renumbering".into()))?;

    for (dependent, fk_columns) in engine.registry().dependents_of(table.model_name()) {
        for fk_column in fk_columns {
            dependent.rewrite_fk(conn, fk_column, old_pk, new_pk)?;
        }
    }
    table.delete(conn, old_pk)?;
    table.insert(conn, new_pk, &row)?;

    conn.execute(
        "UPDATE sync_operations SET row_id = ?1
         WHERE version_id IS NULL AND content_type_id = ?2 AND row_id = ?3",
        rusqlite::params![new_pk, ic.local.content_type_id, old_pk],
    )?;

    Ok(())
}
