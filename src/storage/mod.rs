pub mod memory;
pub mod postgres;

use crate::error::StorageError;
use crate::schema::ColumnSpec;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// A single bound value in an insert row.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Ts(DateTime<Utc>),
    Text(Option<String>),
    F64(Option<f64>),
    I64(Option<i64>),
}

/// Capability set the pipeline needs from a relational store.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn create_table(&self, table: &str, columns: &[ColumnSpec]) -> Result<(), StorageError>;

    /// Adds columns; never drops or retypes existing ones.
    async fn adapt_table(&self, table: &str, columns: &[ColumnSpec]) -> Result<(), StorageError>;

    async fn table_columns(&self, table: &str) -> Result<Vec<String>, StorageError>;

    /// `fields` and every row in `rows` are positional and must have equal length.
    async fn insert(
        &self,
        table: &str,
        fields: &[String],
        rows: &[Vec<SqlValue>],
    ) -> Result<(), StorageError>;

    async fn close(&self);
}

/// Opens fresh storage handles; used at startup and after a closed connection.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn Storage>, StorageError>;
}
