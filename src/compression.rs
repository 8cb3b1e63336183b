//! Operation log compression (spec §4.3): collapsing a row's command
//! history down to the single command that explains the net effect,
//! without needing to know what changed -- only whether the row existed
//! before the window and whether it exists after.
//!
//! | first | last | result | stamped from |
//! |---|---|---|---|
//! | `i` | `d` | dropped (created and destroyed within the window) | -- |
//! | `i` | `u`/`i` | `i` | first |
//! | `u` | `d` | `d` | last |
//! | `u` | `u`/`i` | `u` | first |
//! | `d` | `d` | `d` | first |
//! | `d` | `u` | `u` | last |
//! | `d` | `i` | `u` (synthetic: never existed as an insert, but the net
//!   effect from here is the same as an update) | last |
//!
//! The row's own identity (`row_id`/`content_type_id`) never changes within
//! a group, so "stamped from" only matters for `order` and `version_id`:
//! which op's slot in the log the collapsed entry takes the place of. This
//! is idempotent: compressing an already-compressed sequence (each group
//! now length 1) returns it unchanged.

use std::collections::BTreeMap;

use rusqlite::Connection;

use crate::engine::Engine;
use crate::error::Result;
use crate::model::{Command, Operation};

/// Checks that a row's command sequence, in `order`, is one a tracked
/// table could actually produce: it can't be updated or deleted again
/// right after being deleted without an intervening insert, and it can't
/// be inserted twice without an intervening delete.
pub fn assert_operation_sequence(ops: &[&Operation]) -> Result<()> {
    let mut last: Option<Command> = None;
    for op in ops {
        if let Some(prev) = last {
            let ok = match prev {
                Command::Delete => op.command == Command::Insert,
                Command::Insert => matches!(op.command, Command::Update | Command::Delete),
                Command::Update => matches!(op.command, Command::Update | Command::Delete),
            };
            if !ok {
                return Err(crate::error::SyncError::Operation(format!(
                    "invalid command sequence: {prev} followed by {}",
                    op.command
                )));
            }
        }
        last = Some(op.command);
    }
    Ok(())
}

fn group_key(op: &Operation) -> (u32, i64) {
    (op.content_type_id, op.row_id)
}

/// Reduces a row's first and last logged operation down to the single
/// operation that represents the group's net effect, or `None` if the row
/// was created and destroyed entirely within the window. The returned
/// operation borrows its `order`/`row_id`/`content_type_id`/`version_id`
/// from whichever of `first`/`last` the table above calls for -- the
/// `command` alone isn't enough to decide that, since two different
/// (first, last) pairs can reduce to the same command.
fn reduce(first: &Operation, last: &Operation) -> Option<Operation> {
    match (first.command, last.command) {
        (Command::Insert, Command::Delete) => None,
        (Command::Insert, Command::Update | Command::Insert) => Some(first.clone()),
        (Command::Update, Command::Delete) => Some(last.clone()),
        (Command::Update, Command::Update | Command::Insert) => Some(first.clone()),
        (Command::Delete, Command::Delete) => Some(first.clone()),
        (Command::Delete, Command::Update) => Some(last.clone()),
        (Command::Delete, Command::Insert) => Some(Operation {
            order: last.order,
            row_id: last.row_id,
            content_type_id: last.content_type_id,
            command: Command::Update,
            version_id: last.version_id,
        }),
    }
}

/// Pure in-memory compression over an arbitrary operation batch. Operations
/// must already be sorted by `order` within the input for the per-row
/// reduction to be meaningful; the returned batch is sorted by `order`.
pub fn compressed_operations(operations: &[Operation]) -> Vec<Operation> {
    let mut groups: BTreeMap<(u32, i64), Vec<&Operation>> = BTreeMap::new();
    for op in operations {
        groups.entry(group_key(op)).or_default().push(op);
    }
    let mut out = Vec::new();
    for ops in groups.into_values() {
        let first = ops.first().unwrap();
        let last = ops.last().unwrap();
        if let Some(op) = reduce(first, last) {
            out.push(op);
        }
    }
    out.sort_by_key(|op| op.order);
    out
}

/// Compresses the unversioned tail of the operation log back to its
/// minimal representative set. Versioned operations are untouched: once a
/// version exists, other nodes may already be merging against it, so its
/// operations can't be rewritten.
pub fn compress_in_db(engine: &Engine) -> Result<()> {
    let pending = crate::tracking::pending_operations(engine)?;
    if pending.is_empty() {
        return Ok(());
    }
    let mut by_row: BTreeMap<(u32, i64), Vec<&Operation>> = BTreeMap::new();
    for op in &pending {
        by_row.entry(group_key(op)).or_default().push(op);
    }
    for ops in by_row.values() {
        assert_operation_sequence(ops)?;
    }
    let compressed = compressed_operations(&pending);

    engine.with_transaction(|conn| {
        delete_pending(conn)?;
        for op in &compressed {
            conn.execute(
                "INSERT INTO sync_operations (row_id, content_type_id, command, version_id)
                 VALUES (?1, ?2, ?3, NULL)",
                rusqlite::params![op.row_id, op.content_type_id, op.command.as_char().to_string()],
            )?;
        }
        Ok(())
    })
}

fn delete_pending(conn: &Connection) -> Result<()> {
    conn.execute("DELETE FROM sync_operations WHERE version_id IS NULL", [])?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(order: i64, row_id: i64, command: Command) -> Operation {
        Operation { order, row_id, content_type_id: 1, command, version_id: None }
    }

    #[test]
    fn insert_then_updates_collapses_to_insert() {
        let ops = vec![op(1, 1, Command::Insert), op(2, 1, Command::Update), op(3, 1, Command::Update)];
        let out = compressed_operations(&ops);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].command, Command::Insert);
        // Stamped from the first op: the row's slot in the log is where it
        // was first inserted, not wherever the last superfluous update landed.
        assert_eq!(out[0].order, 1);
    }

    #[test]
    fn insert_then_delete_vanishes() {
        let ops = vec![op(1, 1, Command::Insert), op(2, 1, Command::Update), op(3, 1, Command::Delete)];
        assert!(compressed_operations(&ops).is_empty());
    }

    #[test]
    fn update_then_delete_collapses_to_delete() {
        let ops = vec![op(1, 1, Command::Update), op(2, 1, Command::Delete)];
        let out = compressed_operations(&ops);
        assert_eq!(out[0].command, Command::Delete);
        // Stamped from the last op: the delete is what's actually applied.
        assert_eq!(out[0].order, 2);
    }

    #[test]
    fn delete_then_reinsert_collapses_to_update() {
        let ops = vec![op(1, 1, Command::Delete), op(2, 1, Command::Insert)];
        let out = compressed_operations(&ops);
        assert_eq!(out[0].command, Command::Update);
        // Synthetic update stamped from the reinsert, not the delete.
        assert_eq!(out[0].order, 2);
    }

    #[test]
    fn delete_reinsert_then_update_is_still_update() {
        let ops = vec![op(1, 1, Command::Delete), op(2, 1, Command::Insert), op(3, 1, Command::Update)];
        let out = compressed_operations(&ops);
        assert_eq!(out[0].command, Command::Update);
        assert_eq!(out[0].order, 3);
    }

    #[test]
    fn plain_updates_collapse_to_one() {
        let ops = vec![op(1, 1, Command::Update), op(2, 1, Command::Update), op(3, 1, Command::Update)];
        let out = compressed_operations(&ops);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].command, Command::Update);
        // Stamped from the first op: stays the original update's slot.
        assert_eq!(out[0].order, 1);
    }

    #[test]
    fn delete_then_update_collapses_to_update_from_last() {
        // Only reachable via a malformed log (a bare delete can't actually
        // precede an update without an intervening insert), but the
        // reduction table still has to pick a side for it.
        let ops = vec![op(1, 1, Command::Delete), op(2, 1, Command::Update)];
        let out = compressed_operations(&ops);
        assert_eq!(out[0].command, Command::Update);
        assert_eq!(out[0].order, 2);
    }

    #[test]
    fn is_idempotent() {
        let ops = vec![op(1, 1, Command::Delete), op(2, 1, Command::Insert), op(3, 1, Command::Update)];
        let once = compressed_operations(&ops);
        let twice = compressed_operations(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn distinct_rows_are_independent() {
        let ops = vec![op(1, 1, Command::Insert), op(2, 2, Command::Insert), op(3, 2, Command::Delete)];
        let out = compressed_operations(&ops);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].row_id, 1);
    }

    #[test]
    fn rejects_update_immediately_after_delete() {
        let ops = vec![op(1, 1, Command::Delete), op(2, 1, Command::Update)];
        let refs: Vec<&Operation> = ops.iter().collect();
        assert!(assert_operation_sequence(&refs).is_err());
    }
}
