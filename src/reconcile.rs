//! Schema reconciliation: creates destination tables lazily and grows their
//! column set as new attributes show up.
//!
//! The reconciler is owned by the storage writer task, so the known-column
//! cache is only ever touched by one task at a time.

use crate::error::StorageError;
use crate::sample::Value;
use crate::schema::{infer_columns, ColumnSpec};
use crate::storage::Storage;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
pub struct SchemaReconciler {
    known: BTreeMap<String, BTreeSet<String>>,
}

impl SchemaReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_known(&self, destination: &str) -> bool {
        self.known.contains_key(destination)
    }

    pub fn known_columns(&self, destination: &str) -> Option<&BTreeSet<String>> {
        self.known.get(destination)
    }

    /// Forget everything; used after the storage handle was replaced.
    pub fn reset(&mut self) {
        self.known.clear();
    }

    /// Makes sure `destination` exists with a column for every attribute.
    /// Returns the columns created or added by this call.
    pub async fn ensure_destination(
        &mut self,
        storage: &dyn Storage,
        destination: &str,
        attributes: &BTreeMap<String, Value>,
    ) -> Result<Vec<ColumnSpec>, StorageError> {
        let specs: Vec<ColumnSpec> = infer_columns(attributes)
            .into_values()
            .map(|(spec, _)| spec)
            .collect();
        self.ensure_columns(storage, destination, specs).await
    }

    pub async fn ensure_columns(
        &mut self,
        storage: &dyn Storage,
        destination: &str,
        specs: Vec<ColumnSpec>,
    ) -> Result<Vec<ColumnSpec>, StorageError> {
        if !self.known.contains_key(destination) {
            match storage.create_table(destination, &specs).await {
                Ok(()) => {
                    info!(table = %destination, columns = specs.len(), "created table");
                    self.known.insert(
                        destination.to_string(),
                        specs.iter().map(|c| c.name.clone()).collect(),
                    );
                    return Ok(specs);
                }
                Err(StorageError::AlreadyExists(_)) => {
                    let existing = storage.table_columns(destination).await?;
                    debug!(table = %destination, columns = existing.len(), "table already present");
                    self.known
                        .insert(destination.to_string(), existing.into_iter().collect());
                }
                Err(e) => {
                    warn!(table = %destination, error = %e, "table creation failed");
                    return Err(e);
                }
            }
        }

        let known = self.known.entry(destination.to_string()).or_default();
        let missing: Vec<ColumnSpec> = specs
            .into_iter()
            .filter(|c| !known.contains(&c.name))
            .collect();
        if missing.is_empty() {
            return Ok(missing);
        }

        if let Err(e) = storage.adapt_table(destination, &missing).await {
            warn!(table = %destination, error = %e, "adding columns failed");
            return Err(e);
        }
        info!(
            table = %destination,
            added = ?missing.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(),
            "added columns"
        );
        known.extend(missing.iter().map(|c| c.name.clone()));
        Ok(missing)
    }
}
