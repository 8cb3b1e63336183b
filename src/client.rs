//! Client-facing sync procedures (spec §1/§4.6-§4.8): register, pull,
//! push, repair and the combined `sync_cycle`, each built from a
//! [`Transport`] plus the local engine.
//!
//! An earlier design took push/pull as plain closures over a flat
//! change/remote-op pair. These messages carry enough structure (signing,
//! conflict bookkeeping, version attachment) that a `Transport` trait
//! object is the natural seam instead.

use crate::compression;
use crate::engine::Engine;
use crate::error::{Result, SyncError};
use crate::merge::{self, MergeOutcome};
use crate::message::base::WrappedObject;
use crate::message::{Payload, PullRequestMessage, PushMessage};
use crate::model::{Command, Version};
use crate::net::Transport;
use crate::tracking;

/// Registers this process as a node with the server, storing the returned
/// node id and secret as local identity (spec §4.6 register).
pub fn register(engine: &Engine, transport: &dyn Transport, registry_user_id: Option<i64>) -> Result<()> {
    let response = transport.register(registry_user_id)?;
    engine.save_identity(response.node.node_id, &response.node.secret)?;
    Ok(())
}

/// Pulls everything newer than the local `latest_version_id` and merges it
/// in (spec §4.8). Returns `None` if this node isn't registered yet.
pub fn pull(engine: &Engine, transport: &dyn Transport) -> Result<Option<MergeOutcome>> {
    let Some(node_id) = engine.node_id()? else { return Ok(None) };
    let latest_version_id = engine.get_latest_version_id()?;
    let pending = compression::compressed_operations(&tracking::pending_operations(engine)?);
    let request = PullRequestMessage::new(latest_version_id, Some(node_id), pending);
    let message = transport.pull(&request)?;
    let outcome = merge::merge(engine, &message)?;
    Ok(Some(outcome))
}

/// Builds and signs a [`PushMessage`] from the compressed pending log, then
/// sends it. On success, attaches the returned version id to every
/// operation that was pushed and leaves anything appended meanwhile
/// untouched (spec §4.2's per-commit flush invariant). On
/// [`SyncError::PullSuggested`], the caller is expected to `pull` and retry.
pub fn push(engine: &Engine, transport: &dyn Transport) -> Result<Option<Version>> {
    let node_id = engine.node_id()?.ok_or(SyncError::State("node not registered"))?;
    let secret = engine.secret()?.ok_or(SyncError::State("node not registered"))?;

    compression::compress_in_db(engine)?;
    let pending = tracking::pending_operations(engine)?;
    if pending.is_empty() {
        return Ok(None);
    }
    let upto_order = pending.iter().map(|op| op.order).max().unwrap();
    let latest_version_id = engine.get_latest_version_id()?;

    let mut message = PushMessage::new(chrono::Utc::now().naive_utc(), node_id, latest_version_id);
    let conn = engine.conn();
    for op in &pending {
        message.add_operation(op.clone());
        if op.command == Command::Delete {
            continue;
        }
        let Some(table) = engine.registry().by_content_type(op.content_type_id).cloned() else { continue };
        if let Some(row) = table.load(&conn, op.row_id)? {
            let mut object = WrappedObject::new(table.model_name(), op.row_id);
            for col in table.columns() {
                if let Some(value) = row.get(col.name) {
                    object = object.with_field(col.name, crate::codec::encode(value));
                }
            }
            message.add_object(object);
        }
    }
    drop(conn);
    message.sign(&secret);

    let version = transport.push(&message)?;
    tracking::attach_version(engine, version.version_id, upto_order)?;
    Ok(Some(version))
}

/// Replaces local tracked tables with the server's full snapshot (spec
/// §4.11). Intended for bootstrapping a fresh node or recovering one whose
/// log has drifted beyond repair.
pub fn repair(engine: &Engine, transport: &dyn Transport, exclude_extensions: bool) -> Result<()> {
    let (message, latest_version_id) = transport.repair(exclude_extensions)?;
    let tables: Vec<_> = engine
        .registry()
        .models()
        .filter(|t| engine.registry().is_pulled(t.model_name()))
        .cloned()
        .collect();
    let _guard = engine.with_listening(false);
    engine.with_transaction(|conn| {
        for table in &tables {
            for pk in table.all_pks(conn)? {
                table.delete(conn, pk)?;
            }
        }
        for table in &tables {
            for object in message.query(table.model_name()) {
                let row = merge::decode_row(table.as_ref(), object)?;
                table.insert(conn, object.pk, &row)?;
            }
        }
        conn.execute("DELETE FROM sync_operations WHERE version_id IS NULL", [])?;
        Ok(())
    })?;
    if let Some(node_id) = engine.node_id()? {
        if let Some(latest) = latest_version_id {
            engine.ack_node_version(node_id, latest)?;
        }
    }
    Ok(())
}

/// Ad-hoc equality query against the server (spec §4.7's
/// `<Model>_<column>=value` convention), bypassing the local database.
pub fn query(transport: &dyn Transport, model_name: &str, column: &str, value: &str) -> Result<Payload> {
    transport.query(model_name, column, value)
}

/// Runs one full sync cycle: push local changes, then pull remote ones.
/// If the server reports a stale `latest_version_id`, pulls first and
/// retries the push exactly once (spec §4.6's suggested recovery path).
pub fn sync_cycle(engine: &Engine, transport: &dyn Transport) -> Result<SyncCycleReport> {
    let pushed = match push(engine, transport) {
        Ok(version) => version,
        Err(SyncError::PullSuggested(_)) => {
            pull(engine, transport)?;
            push(engine, transport)?
        }
        Err(err) => return Err(err),
    };
    let merged = pull(engine, transport)?;
    Ok(SyncCycleReport { pushed, merged })
}

#[derive(Debug, Default)]
pub struct SyncCycleReport {
    pub pushed: Option<Version>,
    pub merged: Option<MergeOutcome>,
}
