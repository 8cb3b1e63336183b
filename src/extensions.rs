//! Virtual per-model fields backed by custom load/save/delete hooks (spec
//! §4.12). Extensions live outside the tracked table's own columns -- e.g.
//! a computed field, or a value stored in a side table -- and are wired in
//! by the host rather than discovered reflectively.
//!
//! Save/delete failures are logged and swallowed: an extension is an
//! enrichment of a row, not a condition of the row existing, so one
//! failing extension must not fail the whole sync transaction.

use std::collections::HashMap;

use rusqlite::Connection;

use crate::registry::Row;

type LoadFn = dyn Fn(&Connection, i64) -> crate::error::Result<Option<serde_json::Value>> + Send + Sync;
type SaveFn = dyn Fn(&Connection, i64, &Row) -> crate::error::Result<()> + Send + Sync;
/// `(conn, pk, prior, new)` -- `new` is `None` for an actual delete and
/// `Some` when this fires from an update (the prior row still needs its
/// extension state torn down even though the tracked row itself survives).
type DeleteFn = dyn Fn(&Connection, i64, &Row, Option<&Row>) -> crate::error::Result<()> + Send + Sync;

/// One virtual field attached to a model.
pub struct Extension {
    pub attr: &'static str,
    pub load: Option<Box<LoadFn>>,
    pub save: Option<Box<SaveFn>>,
    pub delete: Option<Box<DeleteFn>>,
}

impl Extension {
    pub fn new(attr: &'static str) -> Self {
        Extension { attr, load: None, save: None, delete: None }
    }

    pub fn with_load(mut self, f: impl Fn(&Connection, i64) -> crate::error::Result<Option<serde_json::Value>> + Send + Sync + 'static) -> Self {
        self.load = Some(Box::new(f));
        self
    }

    pub fn with_save(mut self, f: impl Fn(&Connection, i64, &Row) -> crate::error::Result<()> + Send + Sync + 'static) -> Self {
        self.save = Some(Box::new(f));
        self
    }

    pub fn with_delete(
        mut self,
        f: impl Fn(&Connection, i64, &Row, Option<&Row>) -> crate::error::Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.delete = Some(Box::new(f));
        self
    }
}

#[derive(Default)]
pub struct ExtensionRegistry {
    by_model: HashMap<String, Vec<Extension>>,
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, model_name: impl Into<String>, extension: Extension) {
        self.by_model.entry(model_name.into()).or_default().push(extension);
    }

    pub fn has_extensions(&self, model_name: &str) -> bool {
        self.by_model.get(model_name).is_some_and(|v| !v.is_empty())
    }

    fn has_delete_functions(&self, model_name: &str) -> bool {
        self.by_model
            .get(model_name)
            .is_some_and(|v| v.iter().any(|e| e.delete.is_some()))
    }

    /// Fires every registered `save` hook for `model_name`/`pk`, logging
    /// (not propagating) any failure.
    pub fn save_extensions(&self, conn: &Connection, model_name: &str, pk: i64, row: &Row) {
        let Some(exts) = self.by_model.get(model_name) else { return };
        for ext in exts {
            if let Some(save) = &ext.save {
                if let Err(err) = save(conn, pk, row) {
                    tracing::warn!(model = model_name, attr = ext.attr, pk, %err, "extension save failed");
                }
            }
        }
    }

    /// Fires every registered `delete` hook for `model_name`/`pk`, logging
    /// (not propagating) any failure. No-op if the model has none. Fires
    /// on an actual delete (`new = None`) as well as on an update that
    /// changed the row (`new = Some(..)`), per the row's prior and new
    /// data -- an update can invalidate a virtual field just as much as a
    /// delete can.
    pub fn delete_extensions(&self, conn: &Connection, model_name: &str, pk: i64, prior: &Row, new: Option<&Row>) {
        if !self.has_delete_functions(model_name) {
            return;
        }
        let exts = &self.by_model[model_name];
        for ext in exts {
            if let Some(delete) = &ext.delete {
                if let Err(err) = delete(conn, pk, prior, new) {
                    tracing::warn!(model = model_name, attr = ext.attr, pk, %err, "extension delete failed");
                }
            }
        }
    }

    /// Loads every registered virtual field for `model_name`/`pk` into a
    /// `{attr: value}` map, skipping attrs whose loader errors or is absent.
    pub fn load_extensions(&self, conn: &Connection, model_name: &str, pk: i64) -> HashMap<String, serde_json::Value> {
        let mut out = HashMap::new();
        let Some(exts) = self.by_model.get(model_name) else { return out };
        for ext in exts {
            if let Some(load) = &ext.load {
                match load(conn, pk) {
                    Ok(Some(value)) => {
                        out.insert(ext.attr.to_string(), value);
                    }
                    Ok(None) => {}
                    Err(err) => {
                        tracing::warn!(model = model_name, attr = ext.attr, pk, %err, "extension load failed");
                    }
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_failure_is_swallowed() {
        let conn = Connection::open_in_memory().unwrap();
        let mut registry = ExtensionRegistry::new();
        registry.extend(
            "Trip",
            Extension::new("distance").with_save(|_, _, _| Err(crate::error::SyncError::State("boom"))),
        );
        // Must not panic.
        registry.save_extensions(&conn, "Trip", 1, &Row::new());
    }

    #[test]
    fn has_extensions_false_for_unknown_model() {
        let registry = ExtensionRegistry::new();
        assert!(!registry.has_extensions("Unknown"));
    }
}
