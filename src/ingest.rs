//! Turns raw push messages and HTTP quota snapshots into routed samples.

use crate::error::AppError;
use crate::protocol::{decode_frame, split_frames};
use crate::sample::Sample;
use crate::stats::Stats;
use crate::writer::StoreRequest;
use serde_json::{Map, Value as Json};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// Destination table names. All names are lowercase.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DestinationNaming {
    /// Prefix for decoded binary records.
    pub prefix: String,
    /// When set, every sample goes to this one table.
    pub shared: Option<String>,
}

impl DestinationNaming {
    pub fn new(prefix: impl Into<String>, shared: Option<String>) -> Self {
        Self {
            prefix: prefix.into(),
            shared,
        }
    }

    fn route(&self, name: String) -> String {
        match &self.shared {
            Some(table) => table.to_lowercase(),
            None => name.to_lowercase(),
        }
    }

    /// JSON push messages: `{sn}_mqtt`.
    pub fn mqtt(&self, sn: &str) -> String {
        self.route(format!("{sn}_mqtt"))
    }

    /// HTTP quota snapshots: `device_{sn}_quota`.
    pub fn quota(&self, sn: &str) -> String {
        self.route(format!("device_{sn}_quota"))
    }

    /// Decoded binary records: `{prefix}_{sn}_{kind}`.
    pub fn record(&self, sn: &str, kind: &str) -> String {
        if self.prefix.is_empty() {
            self.route(format!("{sn}_{kind}"))
        } else {
            self.route(format!("{}_{sn}_{kind}", self.prefix))
        }
    }
}

/// Extracts the serial number from `topic` using the `{sn}` position in
/// `template`. Falls back to the last topic segment when the shapes differ.
pub fn sn_from_topic(template: &str, topic: &str) -> Option<String> {
    let t: Vec<&str> = template.split('/').collect();
    let parts: Vec<&str> = topic.split('/').collect();
    if t.len() == parts.len() {
        if let Some(idx) = t.iter().position(|seg| *seg == "{sn}") {
            return Some(parts[idx].to_string()).filter(|sn| !sn.is_empty());
        }
    }
    parts
        .last()
        .filter(|sn| !sn.is_empty())
        .map(|sn| sn.to_string())
}

#[derive(Clone)]
pub struct Ingestor {
    tx: mpsc::Sender<StoreRequest>,
    naming: DestinationNaming,
    topic_template: String,
    stats: Stats,
}

impl Ingestor {
    pub fn new(
        tx: mpsc::Sender<StoreRequest>,
        naming: DestinationNaming,
        topic_template: impl Into<String>,
        stats: Stats,
    ) -> Self {
        Self {
            tx,
            naming,
            topic_template: topic_template.into(),
            stats,
        }
    }

    /// Handles one push message and returns the number of samples queued.
    /// Waits for queue capacity when the writer falls behind.
    pub async fn handle_message(&self, topic: &str, payload: &[u8]) -> Result<usize, AppError> {
        let sn = sn_from_topic(&self.topic_template, topic)
            .ok_or_else(|| AppError::Mqtt(format!("no serial number in topic {topic}")))?;
        self.stats.mqtt_received(&sn);
        info!(device = %sn, bytes = payload.len(), "received message");

        match serde_json::from_slice::<Json>(payload) {
            Ok(Json::Object(map)) => self.handle_json(&sn, map).await,
            _ => self.handle_binary(&sn, payload).await,
        }
    }

    async fn handle_json(&self, sn: &str, mut map: Map<String, Json>) -> Result<usize, AppError> {
        debug!(
            cmd_id = ?map.get("cmdId"),
            cmd_func = ?map.get("cmdFunc"),
            version = ?map.get("version"),
            id = ?map.get("id"),
            "json message"
        );
        if let Some(Json::Object(params)) = map.remove("params") {
            map = params;
        }
        let sample = Sample::from_json_map(sn, &map);
        self.send(self.naming.mqtt(sn), sample).await?;
        Ok(1)
    }

    async fn handle_binary(&self, sn: &str, payload: &[u8]) -> Result<usize, AppError> {
        let mut queued = 0;
        for frame in split_frames(payload, sn) {
            let frame = match decode_frame(frame) {
                Ok(f) => f,
                Err(e) => {
                    error!(device = %sn, error = %e, "discarding undecodable frame");
                    continue;
                }
            };
            if !frame.handled() {
                continue;
            }
            let device = frame.device_sn(sn).to_string();
            for record in frame.into_records() {
                let destination = self.naming.record(&device, record.kind());
                self.send(destination, record.into_sample(&device)).await?;
                queued += 1;
            }
        }
        Ok(queued)
    }

    /// Queues a quota snapshot polled over HTTP.
    pub async fn handle_quota(&self, sn: &str, params: &Map<String, Json>) -> Result<(), AppError> {
        self.stats.http_received(sn);
        let sample = Sample::from_json_map(sn, params);
        self.send(self.naming.quota(sn), sample).await
    }

    async fn send(&self, destination: String, sample: Sample) -> Result<(), AppError> {
        self.tx
            .send(StoreRequest {
                destination,
                sample,
            })
            .await
            .map_err(|e| AppError::QueueClosed(format!("dropping sample for {}", e.0.destination)))
    }
}
