//! In-process storage backend.
//!
//! Mirrors the behaviour the pipeline relies on from Postgres (duplicate table
//! creation, unknown columns, kind mismatches) and counts every call, which
//! makes it the backend of choice for exercising the reconciler and writer.

use super::{Connector, SqlValue, Storage};
use crate::error::StorageError;
use crate::schema::{ColumnKind, ColumnSpec};
use async_trait::async_trait;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Default, Clone)]
pub struct MemoryTable {
    pub columns: Vec<ColumnSpec>,
    pub rows: Vec<BTreeMap<String, SqlValue>>,
}

impl MemoryTable {
    pub fn column(&self, name: &str) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.name == name)
    }
}

#[derive(Debug, Default)]
pub struct MemoryState {
    pub tables: BTreeMap<String, MemoryTable>,
    pub create_calls: usize,
    pub adapt_calls: usize,
    pub insert_calls: usize,
    pub connects: usize,
    pub closes: usize,
    insert_failures: VecDeque<StorageError>,
    schema_failures: VecDeque<StorageError>,
}

#[derive(Clone, Default)]
pub struct MemoryConnector {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> MutexGuard<'_, MemoryState> {
        lock(&self.state)
    }

    /// Creates a table behind the pipeline's back, as a concurrent producer would.
    pub fn preexisting_table(&self, table: &str, columns: Vec<ColumnSpec>) {
        lock(&self.state).tables.insert(
            table.to_string(),
            MemoryTable {
                columns,
                rows: Vec::new(),
            },
        );
    }

    /// The next insert fails with `err` instead of touching the table.
    pub fn fail_next_insert(&self, err: StorageError) {
        lock(&self.state).insert_failures.push_back(err);
    }

    /// The next create or alter fails with `err`.
    pub fn fail_next_schema_change(&self, err: StorageError) {
        lock(&self.state).schema_failures.push_back(err);
    }

    pub fn rows(&self, table: &str) -> Vec<BTreeMap<String, SqlValue>> {
        lock(&self.state)
            .tables
            .get(table)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    pub fn table(&self, table: &str) -> Option<MemoryTable> {
        lock(&self.state).tables.get(table).cloned()
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<Box<dyn Storage>, StorageError> {
        lock(&self.state).connects += 1;
        Ok(Box::new(MemoryStorage {
            state: self.state.clone(),
        }))
    }
}

pub struct MemoryStorage {
    state: Arc<Mutex<MemoryState>>,
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn create_table(&self, table: &str, columns: &[ColumnSpec]) -> Result<(), StorageError> {
        let mut state = lock(&self.state);
        state.create_calls += 1;
        if let Some(err) = state.schema_failures.pop_front() {
            return Err(err);
        }
        if state.tables.contains_key(table) {
            return Err(StorageError::AlreadyExists(table.to_string()));
        }
        state.tables.insert(
            table.to_string(),
            MemoryTable {
                columns: columns.to_vec(),
                rows: Vec::new(),
            },
        );
        Ok(())
    }

    async fn adapt_table(&self, table: &str, columns: &[ColumnSpec]) -> Result<(), StorageError> {
        let mut state = lock(&self.state);
        state.adapt_calls += 1;
        if let Some(err) = state.schema_failures.pop_front() {
            return Err(err);
        }
        let t = state
            .tables
            .get_mut(table)
            .ok_or_else(|| StorageError::Schema {
                table: table.to_string(),
                reason: "no such table".into(),
            })?;
        for c in columns {
            if t.column(&c.name).is_none() {
                t.columns.push(c.clone());
            }
        }
        Ok(())
    }

    async fn table_columns(&self, table: &str) -> Result<Vec<String>, StorageError> {
        let state = lock(&self.state);
        Ok(state
            .tables
            .get(table)
            .map(|t| t.columns.iter().map(|c| c.name.clone()).collect())
            .unwrap_or_default())
    }

    async fn insert(
        &self,
        table: &str,
        fields: &[String],
        rows: &[Vec<SqlValue>],
    ) -> Result<(), StorageError> {
        let mut state = lock(&self.state);
        state.insert_calls += 1;
        if let Some(err) = state.insert_failures.pop_front() {
            return Err(err);
        }
        let t = state
            .tables
            .get_mut(table)
            .ok_or_else(|| insert_error(table, "no such table".into()))?;
        let mut staged = Vec::with_capacity(rows.len());
        for row in rows {
            if row.len() != fields.len() {
                return Err(insert_error(table, "field/value count mismatch".into()));
            }
            let mut record = BTreeMap::new();
            for (field, value) in fields.iter().zip(row) {
                let column = t
                    .column(field)
                    .ok_or_else(|| insert_error(table, format!("column {field} does not exist")))?;
                if !accepts(column.kind, value) {
                    return Err(insert_error(
                        table,
                        format!("column {field} of kind {} rejects {value:?}", column.kind),
                    ));
                }
                record.insert(field.clone(), value.clone());
            }
            staged.push(record);
        }
        t.rows.extend(staged);
        Ok(())
    }

    async fn close(&self) {
        lock(&self.state).closes += 1;
    }
}

fn accepts(kind: ColumnKind, value: &SqlValue) -> bool {
    match (kind, value) {
        (_, SqlValue::Text(None) | SqlValue::F64(None) | SqlValue::I64(None)) => true,
        (ColumnKind::Text(len), SqlValue::Text(Some(s))) => s.chars().count() <= len as usize,
        (ColumnKind::Integer, SqlValue::I64(_)) => true,
        (ColumnKind::Decimal, SqlValue::F64(_) | SqlValue::I64(_)) => true,
        (ColumnKind::Timestamp, SqlValue::Ts(_)) => true,
        _ => false,
    }
}

fn insert_error(table: &str, reason: String) -> StorageError {
    StorageError::Insert {
        table: table.to_string(),
        reason,
    }
}

fn lock(state: &Mutex<MemoryState>) -> MutexGuard<'_, MemoryState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_duplicate_create_reports_already_exists() {
        let connector = MemoryConnector::new();
        let storage = connector.connect().await.unwrap();
        let cols = vec![ColumnSpec::new("eco_a", ColumnKind::Integer)];
        storage.create_table("t", &cols).await.unwrap();
        let err = storage.create_table("t", &cols).await.unwrap_err();
        assert!(matches!(err, StorageError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_kind_mismatch_rejected() {
        let connector = MemoryConnector::new();
        let storage = connector.connect().await.unwrap();
        storage
            .create_table("t", &[ColumnSpec::new("eco_a", ColumnKind::Integer)])
            .await
            .unwrap();
        let err = storage
            .insert("t", &["eco_a".into()], &[vec![SqlValue::F64(Some(1.5))]])
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Insert { .. }));
        assert!(connector.rows("t").is_empty());
    }
}
