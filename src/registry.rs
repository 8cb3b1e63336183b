//! Registry of tracked models (spec §4.1) and the narrow database
//! interface a host implements per tracked table.
//!
//! The original system relied on an ORM (SQLAlchemy) to provide mapped
//! classes, primary keys, and foreign keys reflectively. This crate has no
//! ORM dependency, so the equivalent seam is a trait: every tracked table
//! is a first-class [`TrackedTable`] implementation the host registers,
//! following spec §9's design note ("Replace [deep inheritance] by explicit
//! polymorphism over the tracked-table registry").

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;

use crate::codec::{ColumnType, SqlValue};
use crate::error::Result;

/// A decoded row: column name to scalar value, ordered for determinism.
pub type Row = BTreeMap<String, SqlValue>;

#[derive(Debug, Clone)]
pub struct ColumnDef {
    pub name: &'static str,
    pub ty: ColumnType,
}

/// A foreign key from this table's `column` to another tracked model's
/// primary key.
#[derive(Debug, Clone)]
pub struct ForeignKeyDef {
    pub column: &'static str,
    pub references_model: &'static str,
}

/// Participation direction for a tracked model (spec §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Direction {
    pub push: bool,
    pub pull: bool,
}

impl Direction {
    pub const BOTH: Direction = Direction { push: true, pull: true };
    pub const PUSH_ONLY: Direction = Direction { push: true, pull: false };
    pub const PULL_ONLY: Direction = Direction { push: false, pull: true };
}

/// The narrow database interface the engine consumes for one tracked
/// table. Implementations perform plain SQL against a single-column
/// integer-keyed table; the engine never constructs SQL beyond what's
/// exposed here.
pub trait TrackedTable: Send + Sync {
    fn model_name(&self) -> &'static str;
    fn table_name(&self) -> &'static str;
    fn primary_key_column(&self) -> &'static str;
    fn columns(&self) -> &[ColumnDef];
    fn foreign_keys(&self) -> &[ForeignKeyDef] {
        &[]
    }
    /// Groups of column names each covered by a unique constraint (spec §4.9E).
    fn unique_constraints(&self) -> &[&[&'static str]] {
        &[]
    }

    fn load(&self, conn: &rusqlite::Connection, pk: i64) -> Result<Option<Row>>;
    fn exists(&self, conn: &rusqlite::Connection, pk: i64) -> Result<bool>;
    fn insert(&self, conn: &rusqlite::Connection, pk: i64, row: &Row) -> Result<()>;
    fn update(&self, conn: &rusqlite::Connection, pk: i64, row: &Row) -> Result<()>;
    fn delete(&self, conn: &rusqlite::Connection, pk: i64) -> Result<()>;
    fn max_pk(&self, conn: &rusqlite::Connection) -> Result<Option<i64>>;

    /// Every primary key currently in the table, for building a full
    /// snapshot (repair, spec §4.7).
    fn all_pks(&self, conn: &rusqlite::Connection) -> Result<Vec<i64>>;

    /// Primary keys of rows in this table whose `fk_column` equals `pk`.
    fn rows_referencing(&self, conn: &rusqlite::Connection, fk_column: &str, pk: i64) -> Result<Vec<i64>>;

    /// Rewrites every row's `fk_column` from `old_pk` to `new_pk` (used by
    /// insert-conflict renumbering, spec §4.8 step 5).
    fn rewrite_fk(&self, conn: &rusqlite::Connection, fk_column: &str, old_pk: i64, new_pk: i64) -> Result<()>;

    /// Finds the pk of a row (if any) matching the given unique-constraint
    /// column values, excluding `exclude_pk` itself.
    fn find_by_unique(
        &self,
        conn: &rusqlite::Connection,
        columns: &[&'static str],
        values: &Row,
        exclude_pk: i64,
    ) -> Result<Option<i64>>;

    /// Primary keys of rows whose `column` equals `value`. Backs ad-hoc
    /// server-side queries; tables with no queryable columns can leave the
    /// default (empty) implementation.
    fn find_by_column(&self, _conn: &rusqlite::Connection, _column: &str, _value: &SqlValue) -> Result<Vec<i64>> {
        Ok(Vec::new())
    }
}

/// `CRC32("<model_name>/<table_name>")`, polynomial IEEE 802.3, seed 0.
/// Stable across processes; this is the only place the id is derived.
pub fn content_type_id(model_name: &str, table_name: &str) -> u32 {
    let key = format!("{model_name}/{table_name}");
    crc32fast::hash(key.as_bytes())
}

/// Index of tracked models, keyed by model name, table name and
/// content-type id (spec §4.1). Registration is idempotent.
#[derive(Default)]
pub struct Registry {
    by_model: HashMap<String, Arc<dyn TrackedTable>>,
    by_table: HashMap<String, Arc<dyn TrackedTable>>,
    by_content_type: HashMap<u32, Arc<dyn TrackedTable>>,
    directions: HashMap<String, Direction>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `table` for the given `direction`. Calling this again for
    /// the same model name is a no-op for the table mapping itself, but
    /// direction flags are not widened automatically -- re-register with
    /// `Direction::BOTH` explicitly if that's desired.
    pub fn register(&mut self, table: Arc<dyn TrackedTable>, direction: Direction) {
        let model = table.model_name().to_string();
        let tname = table.table_name().to_string();
        let ct = content_type_id(&model, &tname);
        self.directions.insert(model.clone(), direction);
        if self.by_model.contains_key(&model) {
            return;
        }
        self.by_model.insert(model, table.clone());
        self.by_table.insert(tname, table.clone());
        self.by_content_type.insert(ct, table);
    }

    pub fn by_model(&self, model_name: &str) -> Option<&Arc<dyn TrackedTable>> {
        self.by_model.get(model_name)
    }

    pub fn by_table(&self, table_name: &str) -> Option<&Arc<dyn TrackedTable>> {
        self.by_table.get(table_name)
    }

    pub fn by_content_type(&self, content_type_id: u32) -> Option<&Arc<dyn TrackedTable>> {
        self.by_content_type.get(&content_type_id)
    }

    pub fn content_type_id_of(&self, model_name: &str) -> Option<u32> {
        self.by_model(model_name)
            .map(|t| content_type_id(t.model_name(), t.table_name()))
    }

    pub fn direction_of(&self, model_name: &str) -> Option<Direction> {
        self.directions.get(model_name).copied()
    }

    pub fn is_pulled(&self, model_name: &str) -> bool {
        self.direction_of(model_name).map(|d| d.pull).unwrap_or(false)
    }

    pub fn is_pushed(&self, model_name: &str) -> bool {
        self.direction_of(model_name).map(|d| d.push).unwrap_or(false)
    }

    pub fn models(&self) -> impl Iterator<Item = &Arc<dyn TrackedTable>> {
        self.by_model.values()
    }

    /// Tables in the registry that declare a foreign key into `model_name`,
    /// paired with the FK column name(s) that reference it.
    pub fn dependents_of(&self, model_name: &str) -> Vec<(&Arc<dyn TrackedTable>, Vec<&'static str>)> {
        self.by_model
            .values()
            .filter_map(|t| {
                let cols: Vec<&'static str> = t
                    .foreign_keys()
                    .iter()
                    .filter(|fk| fk.references_model == model_name)
                    .map(|fk| fk.column)
                    .collect();
                if cols.is_empty() {
                    None
                } else {
                    Some((t, cols))
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_type_id_is_stable() {
        let a = content_type_id("Trip", "trips");
        let b = content_type_id("Trip", "trips");
        assert_eq!(a, b);
        assert_ne!(a, content_type_id("Trip", "other_table"));
    }
}
