//! Single consumer of the ingestion queue.
//!
//! The writer owns the storage handle and the schema reconciler, so samples
//! for one destination are reconciled and inserted strictly one after another.

use crate::error::StorageError;
use crate::reconcile::SchemaReconciler;
use crate::sample::{Sample, Value};
use crate::schema::{infer_columns, ColumnKind, ColumnSpec};
use crate::stats::Stats;
use crate::storage::{Connector, SqlValue, Storage};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// A sample routed to a destination table.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreRequest {
    pub destination: String,
    pub sample: Sample,
}

pub struct StorageWriter {
    connector: Arc<dyn Connector>,
    storage: Option<Box<dyn Storage>>,
    reconciler: SchemaReconciler,
    stats: Stats,
}

impl StorageWriter {
    pub fn new(connector: Arc<dyn Connector>, stats: Stats) -> Self {
        Self {
            connector,
            storage: None,
            reconciler: SchemaReconciler::new(),
            stats,
        }
    }

    /// Consumes requests until every sender is gone, then closes storage.
    pub async fn run(mut self, mut rx: mpsc::Receiver<StoreRequest>) {
        info!("storage writer started");
        while let Some(req) = rx.recv().await {
            // Failures are logged and counted inside store().
            let _ = self.store(&req.destination, &req.sample).await;
        }
        if let Some(storage) = self.storage.take() {
            storage.close().await;
        }
        info!("storage writer stopped");
    }

    /// Reconciles the destination schema and inserts one row for `sample`.
    pub async fn store(&mut self, destination: &str, sample: &Sample) -> Result<(), StorageError> {
        let result = self.try_store(destination, sample).await;
        match &result {
            Ok(()) => self.stats.inserted(destination, 1),
            Err(e) => {
                self.stats.failed(destination);
                if e.is_connection_closed() {
                    warn!(table = %destination, error = %e, "storage connection closed; sample dropped, reconnecting");
                    self.reconnect().await;
                } else {
                    error!(table = %destination, error = %e, "sample dropped");
                }
            }
        }
        result
    }

    async fn try_store(&mut self, destination: &str, sample: &Sample) -> Result<(), StorageError> {
        if self.storage.is_none() {
            self.storage = Some(self.connector.connect().await?);
        }
        let Some(storage) = self.storage.as_deref() else {
            return Err(StorageError::ConnectionClosed("no storage handle".into()));
        };

        let columns = infer_columns(&sample.attributes);
        let specs: Vec<ColumnSpec> = columns.values().map(|(spec, _)| spec.clone()).collect();
        self.reconciler
            .ensure_columns(storage, destination, specs)
            .await?;

        let (fields, values) = row(&columns, sample.captured_at);
        debug!(table = %destination, fields = fields.len(), "inserting");
        storage.insert(destination, &fields, &[values]).await
    }

    async fn reconnect(&mut self) {
        if let Some(old) = self.storage.take() {
            old.close().await;
        }
        self.reconciler.reset();
        match self.connector.connect().await {
            Ok(storage) => {
                info!("storage reconnected");
                self.storage = Some(storage);
            }
            Err(e) => error!(error = %e, "storage reconnect failed; retrying with next sample"),
        }
    }
}

/// Field names and values in column-name order.
fn row(
    columns: &BTreeMap<String, (ColumnSpec, &Value)>,
    captured_at: DateTime<Utc>,
) -> (Vec<String>, Vec<SqlValue>) {
    let mut fields = Vec::with_capacity(columns.len());
    let mut values = Vec::with_capacity(columns.len());
    for (name, (spec, value)) in columns {
        fields.push(name.clone());
        values.push(to_sql(spec.kind, value, captured_at));
    }
    (fields, values)
}

fn to_sql(kind: ColumnKind, value: &Value, captured_at: DateTime<Utc>) -> SqlValue {
    if kind == ColumnKind::Timestamp {
        return SqlValue::Ts(value.as_timestamp().unwrap_or(captured_at));
    }
    match value {
        Value::Text(s) => SqlValue::Text(Some(s.clone())),
        Value::Integer(i) => SqlValue::I64(Some(*i)),
        Value::Decimal(f) if crate::sample::is_integral(*f) => SqlValue::I64(Some(*f as i64)),
        Value::Decimal(f) => SqlValue::F64(Some(*f)),
        Value::Timestamp(ts) => SqlValue::Ts(*ts),
        Value::Nested(json) => SqlValue::Text(Some(json.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryConnector;
    use pretty_assertions::assert_eq;
    use chrono::TimeZone;
    use serde_json::json;

    fn sample(pairs: &[(&str, Value)]) -> Sample {
        Sample::new(
            "HW51",
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        )
    }

    fn writer(connector: &MemoryConnector) -> (StorageWriter, Stats) {
        let stats = Stats::new();
        (
            StorageWriter::new(Arc::new(connector.clone()), stats.clone()),
            stats,
        )
    }

    #[tokio::test]
    async fn test_store_writes_canonical_row() {
        let connector = MemoryConnector::new();
        let (mut writer, stats) = writer(&connector);
        let s = sample(&[
            ("z.last", Value::Integer(7)),
            ("a.first", Value::Decimal(2.0)),
            ("m.list", Value::Nested(json!([1, 2]))),
            ("ratio", Value::Decimal(0.25)),
        ]);
        writer.store("hw51_mqtt", &s).await.unwrap();

        let rows = connector.rows("hw51_mqtt");
        assert_eq!(rows.len(), 1);
        let fields: Vec<&str> = rows[0].keys().map(String::as_str).collect();
        assert_eq!(
            fields,
            vec![
                "eco_a_first",
                "eco_m_list",
                "eco_ratio",
                "eco_z_last",
                "serial_number",
                "timestamp"
            ]
        );
        assert_eq!(rows[0]["eco_a_first"], SqlValue::I64(Some(2)));
        assert_eq!(rows[0]["eco_m_list"], SqlValue::Text(Some("[1,2]".into())));
        assert_eq!(rows[0]["eco_ratio"], SqlValue::F64(Some(0.25)));
        assert_eq!(rows[0]["timestamp"], SqlValue::Ts(s.captured_at));
        assert_eq!(stats.destination("hw51_mqtt").inserted, 1);
    }

    #[tokio::test]
    async fn test_schema_grows_with_samples() {
        let connector = MemoryConnector::new();
        let (mut writer, _) = writer(&connector);
        writer
            .store("t", &sample(&[("a", Value::Integer(1))]))
            .await
            .unwrap();
        writer
            .store("t", &sample(&[("a", Value::Integer(2)), ("b", Value::Text("x".into()))]))
            .await
            .unwrap();

        let table = connector.table("t").unwrap();
        assert_eq!(table.rows.len(), 2);
        assert!(table.column("eco_b").is_some());
        assert!(!table.rows[0].contains_key("eco_b"));
    }

    #[tokio::test]
    async fn test_kind_drift_is_per_insert_failure() {
        let connector = MemoryConnector::new();
        let (mut writer, stats) = writer(&connector);
        writer
            .store("t", &sample(&[("a", Value::Integer(1))]))
            .await
            .unwrap();
        let err = writer
            .store("t", &sample(&[("a", Value::Decimal(1.5))]))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Insert { .. }));
        assert_eq!(connector.table("t").unwrap().column("eco_a").unwrap().kind, ColumnKind::Integer);

        writer
            .store("t", &sample(&[("a", Value::Integer(3))]))
            .await
            .unwrap();
        assert_eq!(
            stats.destination("t"),
            crate::stats::DestinationCounters {
                inserted: 2,
                failed: 1
            }
        );
    }

    #[tokio::test]
    async fn test_closed_connection_reconnects_and_drops_sample() {
        let connector = MemoryConnector::new();
        let (mut writer, _) = writer(&connector);
        writer
            .store("t", &sample(&[("a", Value::Integer(1))]))
            .await
            .unwrap();

        connector.fail_next_insert(StorageError::ConnectionClosed("conn closed".into()));
        assert!(writer
            .store("t", &sample(&[("a", Value::Integer(2))]))
            .await
            .is_err());
        writer
            .store("t", &sample(&[("a", Value::Integer(3))]))
            .await
            .unwrap();

        let state = connector.state();
        assert_eq!(state.connects, 2);
        assert_eq!(state.closes, 1);
        let values: Vec<&SqlValue> = state.tables["t"].rows.iter().map(|r| &r["eco_a"]).collect();
        assert_eq!(values, vec![&SqlValue::I64(Some(1)), &SqlValue::I64(Some(3))]);
    }

    #[tokio::test]
    async fn test_run_drains_queue_then_closes() {
        let connector = MemoryConnector::new();
        let (writer, stats) = writer(&connector);
        let (tx, rx) = mpsc::channel(4);
        let handle = tokio::spawn(writer.run(rx));

        for i in 0..3 {
            tx.send(StoreRequest {
                destination: "device_hw51_quota".into(),
                sample: sample(&[("n", Value::Integer(i))]),
            })
            .await
            .unwrap();
        }
        drop(tx);
        handle.await.unwrap();

        assert_eq!(connector.rows("device_hw51_quota").len(), 3);
        assert_eq!(connector.state().closes, 1);
        assert_eq!(stats.destination("device_hw51_quota").inserted, 3);
    }

    #[test]
    fn test_timestamp_column_falls_back_to_capture_time() {
        let now = Utc::now();
        assert_eq!(
            to_sql(ColumnKind::Timestamp, &Value::Text("garbage".into()), now),
            SqlValue::Ts(now)
        );
        assert_eq!(
            to_sql(ColumnKind::Timestamp, &Value::Integer(0), now),
            SqlValue::Ts(Utc.timestamp_opt(0, 0).unwrap())
        );
    }
}
