use crate::core::{Column, DataError, EntityId, Result, Row, Snapshot, Value};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MvccRow {
    pub row: Row,
    pub xmin: u64,         // Transaction ID that created this version
    pub xmax: Option<u64>, // Transaction ID that deleted/replaced this version
}

/// Versioned row store for one schema.
///
/// Indexes map a column value to the row ids whose retained versions carried
/// it. Callers re-check the visible version, so stale entries are harmless.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Table {
    schema: TableSchema,
    rows: BTreeMap<EntityId, Vec<MvccRow>>,
    next_row_id: EntityId,
    indexes: HashMap<String, BTreeMap<Value, BTreeSet<EntityId>>>,
}

impl Table {
    pub fn new(schema: TableSchema) -> Self {
        Self {
            schema,
            rows: BTreeMap::new(),
            next_row_id: 1,
            indexes: HashMap::new(),
        }
    }

    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    pub fn insert(&mut self, row: Row, snapshot: &Snapshot) -> Result<EntityId> {
        self.validate_row(&row)?;

        let id = self.next_row_id;
        self.next_row_id += 1;

        self.update_indexes(id, &row);
        self.rows.insert(
            id,
            vec![MvccRow {
                row,
                xmin: snapshot.tx_id,
                xmax: None,
            }],
        );

        Ok(id)
    }

    /// Replaces the visible version of `id`. Returns `false` when the row is
    /// gone for this snapshot.
    pub fn update(&mut self, id: EntityId, new_row: Row, snapshot: &Snapshot) -> Result<bool> {
        self.validate_row(&new_row)?;

        let Some(head) = self.writable_head(id, snapshot)? else {
            return Ok(false);
        };

        self.update_indexes(id, &new_row);
        let Some(versions) = self.rows.get_mut(&id) else {
            return Ok(false);
        };

        if versions[head].xmin == snapshot.tx_id {
            // Own uncommitted version: overwrite in place.
            versions[head].row = new_row;
            versions[head].xmax = None;
        } else {
            versions[head].xmax = Some(snapshot.tx_id);
            versions.push(MvccRow {
                row: new_row,
                xmin: snapshot.tx_id,
                xmax: None,
            });
        }

        Ok(true)
    }

    pub fn delete(&mut self, id: EntityId, snapshot: &Snapshot) -> Result<bool> {
        let Some(head) = self.writable_head(id, snapshot)? else {
            return Ok(false);
        };

        if let Some(versions) = self.rows.get_mut(&id) {
            versions[head].xmax = Some(snapshot.tx_id);
            return Ok(true);
        }
        Ok(false)
    }

    /// Undoes the writes of aborted transaction `tx_id` on row `id`. Afterwards
    /// no version of the row mentions `tx_id`.
    pub fn discard(&mut self, id: EntityId, tx_id: u64) {
        let Some(versions) = self.rows.get_mut(&id) else {
            return;
        };
        let (removed, kept): (Vec<MvccRow>, Vec<MvccRow>) =
            versions.drain(..).partition(|version| version.xmin == tx_id);
        *versions = kept;
        for version in versions.iter_mut() {
            if version.xmax == Some(tx_id) {
                version.xmax = None;
            }
        }
        self.drop_versions(id, removed);
    }

    /// Removes versions of `id` replaced or deleted by committed transactions.
    /// Snapshots are taken per statement, so no later reader can see them.
    pub fn prune(&mut self, id: EntityId, snapshot: &Snapshot) {
        let Some(versions) = self.rows.get_mut(&id) else {
            return;
        };
        let (removed, kept): (Vec<MvccRow>, Vec<MvccRow>) = versions
            .drain(..)
            .partition(|version| matches!(version.xmax, Some(xmax) if Self::is_committed(xmax, snapshot)));
        *versions = kept;
        self.drop_versions(id, removed);
    }

    fn drop_versions(&mut self, id: EntityId, removed: Vec<MvccRow>) {
        if removed.is_empty() {
            return;
        }
        if self.rows.get(&id).is_some_and(Vec::is_empty) {
            self.rows.remove(&id);
        }
        self.remove_from_indexes(id, &removed);
    }

    pub fn scan_with_ids(&self, snapshot: &Snapshot) -> Vec<(EntityId, Row)> {
        let mut results = Vec::new();
        for (id, versions) in &self.rows {
            if let Some(row) = Self::visible_version(versions, snapshot) {
                results.push((*id, row.clone()));
            }
        }
        results
    }

    pub fn get_visible_row(&self, id: EntityId, snapshot: &Snapshot) -> Option<Row> {
        self.rows
            .get(&id)
            .and_then(|versions| Self::visible_version(versions, snapshot))
            .cloned()
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn version_count(&self, id: EntityId) -> usize {
        self.rows.get(&id).map_or(0, Vec::len)
    }

    pub fn create_index(&mut self, column_name: &str) -> Result<()> {
        if self.indexes.contains_key(column_name) {
            return Ok(());
        }
        let col_idx = self
            .schema
            .column_index(column_name)
            .ok_or_else(|| DataError::FieldNotFound {
                schema: self.schema.name.clone(),
                field: column_name.to_string(),
            })?;

        let mut index: BTreeMap<Value, BTreeSet<EntityId>> = BTreeMap::new();
        for (id, versions) in &self.rows {
            for version in versions {
                index
                    .entry(version.row[col_idx].clone())
                    .or_default()
                    .insert(*id);
            }
        }
        self.indexes.insert(column_name.to_string(), index);
        self.schema.indexes.push(column_name.to_string());
        Ok(())
    }

    /// Candidate ids for `column = value`, or `None` when the column has no index.
    pub fn index_candidates(&self, column_name: &str, value: &Value) -> Option<Vec<EntityId>> {
        self.indexes.get(column_name).map(|index| {
            index
                .get(value)
                .map(|ids| ids.iter().copied().collect())
                .unwrap_or_default()
        })
    }

    /// Newest version this transaction may replace, or a conflict if another
    /// in-flight transaction owns the row.
    fn writable_head(&self, id: EntityId, snapshot: &Snapshot) -> Result<Option<usize>> {
        let Some(versions) = self.rows.get(&id) else {
            return Ok(None);
        };

        let Some(head) = versions
            .iter()
            .rposition(|version| !snapshot.aborted.contains(&version.xmin))
        else {
            return Ok(None);
        };
        let version = &versions[head];

        if version.xmin != snapshot.tx_id && !Self::is_committed(version.xmin, snapshot) {
            return Err(self.conflict(id));
        }

        match version.xmax {
            Some(xmax) if snapshot.aborted.contains(&xmax) => Ok(Some(head)),
            Some(xmax) if xmax == snapshot.tx_id => Ok(None),
            Some(xmax) if Self::is_committed(xmax, snapshot) => Ok(None),
            Some(_) => Err(self.conflict(id)),
            None => Ok(Some(head)),
        }
    }

    fn conflict(&self, id: EntityId) -> DataError {
        DataError::Persistence(format!(
            "concurrent modification of row {} in '{}'",
            id, self.schema.name
        ))
    }

    fn visible_version<'a>(versions: &'a [MvccRow], snapshot: &Snapshot) -> Option<&'a Row> {
        versions
            .iter()
            .rev()
            .find(|version| Self::is_visible(version, snapshot))
            .map(|version| &version.row)
    }

    fn is_visible(row: &MvccRow, snapshot: &Snapshot) -> bool {
        if row.xmin == snapshot.tx_id {
            return row.xmax != Some(snapshot.tx_id);
        }

        if !Self::is_committed(row.xmin, snapshot) {
            return false;
        }

        if let Some(xmax) = row.xmax {
            if xmax == snapshot.tx_id || Self::is_committed(xmax, snapshot) {
                return false;
            }
        }

        true
    }

    fn is_committed(tx_id: u64, snapshot: &Snapshot) -> bool {
        tx_id < snapshot.max_tx_id
            && !snapshot.active.contains(&tx_id)
            && !snapshot.aborted.contains(&tx_id)
    }

    fn validate_row(&self, row: &Row) -> Result<()> {
        let columns = self.schema.columns();
        if row.len() != columns.len() {
            return Err(DataError::Persistence(format!(
                "Expected {} columns, got {}",
                columns.len(),
                row.len()
            )));
        }
        for (column, value) in columns.iter().zip(row.iter()) {
            column.check(value)?;
        }
        Ok(())
    }

    fn update_indexes(&mut self, id: EntityId, row: &Row) {
        for (col_name, index) in &mut self.indexes {
            if let Some(col_idx) = self.schema.column_index(col_name) {
                index.entry(row[col_idx].clone()).or_default().insert(id);
            }
        }
    }

    /// Drops index entries for values no remaining version of `id` carries.
    fn remove_from_indexes(&mut self, id: EntityId, removed: &[MvccRow]) {
        let remaining = self.rows.get(&id).map(Vec::as_slice).unwrap_or_default();
        for (col_name, index) in &mut self.indexes {
            let Some(col_idx) = self.schema.column_index(col_name) else {
                continue;
            };
            for version in removed {
                let value = &version.row[col_idx];
                if remaining.iter().any(|kept| &kept.row[col_idx] == value) {
                    continue;
                }
                if let Some(ids) = index.get_mut(value) {
                    ids.remove(&id);
                    if ids.is_empty() {
                        index.remove(value);
                    }
                }
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSchema {
    name: String,
    columns: Vec<Column>,
    pub indexes: Vec<String>,
}

impl TableSchema {
    pub fn new(name: impl Into<String>, columns: Vec<Column>) -> Self {
        Self {
            name: name.into(),
            columns,
            indexes: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|column| column.name == name)
    }

    pub fn is_indexed(&self, column: &str) -> bool {
        self.indexes.iter().any(|idx| idx == column)
    }
}
