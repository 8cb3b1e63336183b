//! Server-side unique-constraint conflict resolution (spec §4.9, class E):
//! a push can legitimately reuse a unique value another node already
//! released, as long as the push also carries the replacement for the row
//! that currently holds it.

use rusqlite::Connection;

use crate::engine::Engine;
use crate::error::{Result, SyncError, UniqueConflict};
use crate::message::base::find_object;
use crate::merge::decode_row;
use crate::message::PushMessage;
use crate::model::Command;

/// A local row whose unique-constraint value collides with an incoming
/// push object, safe to delete first because the push also supplies a
/// replacement row for it.
pub struct UniqueResolution {
    pub model_name: String,
    pub conflicting_pk: i64,
}

/// Scans every non-delete operation's row against the target table's
/// unique constraints. Collisions that the push itself also supplies a
/// replacement object for are returned as resolutions to apply before
/// performing the push's operations; any other collision makes the whole
/// push unprocessable and is reported as [`SyncError::UniqueConstraint`].
pub fn find_unique_conflicts(engine: &Engine, conn: &Connection, message: &PushMessage) -> Result<Vec<UniqueResolution>> {
    let mut resolutions = Vec::new();
    let mut unresolved = Vec::new();

    for op in &message.operations {
        if op.command == Command::Delete {
            continue;
        }
        let table = match engine.registry().by_content_type(op.content_type_id).cloned() {
            Some(t) => t,
            None => continue,
        };
        if table.unique_constraints().is_empty() {
            continue;
        }
        let Some(object) = find_object(message.payload(), table.model_name(), op.row_id) else { continue };
        let row = decode_row(table.as_ref(), object)?;

        for columns in table.unique_constraints() {
            if let Some(conflicting_pk) = table.find_by_unique(conn, columns, &row, op.row_id)? {
                if find_object(message.payload(), table.model_name(), conflicting_pk).is_some() {
                    resolutions.push(UniqueResolution {
                        model_name: table.model_name().to_string(),
                        conflicting_pk,
                    });
                } else {
                    unresolved.push(UniqueConflict {
                        model_name: table.model_name().to_string(),
                        pk: conflicting_pk,
                        columns: columns.iter().map(|s| s.to_string()).collect(),
                    });
                }
            }
        }
    }

    if !unresolved.is_empty() {
        return Err(SyncError::UniqueConstraint(unresolved));
    }
    Ok(resolutions)
}
