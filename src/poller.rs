//! Periodic HTTP quota polling.

use crate::cloud::DeviceApi;
use crate::config::PollerConfig;
use crate::error::AppError;
use crate::ingest::Ingestor;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

/// Devices to poll: the pinned list when given, otherwise every device the
/// cloud reports as online.
pub async fn resolve_devices(
    api: &dyn DeviceApi,
    pinned: &[String],
) -> Result<Vec<String>, AppError> {
    if !pinned.is_empty() {
        return Ok(pinned.to_vec());
    }
    let devices = api.device_list().await?;
    for d in &devices {
        debug!(device = %d.sn, online = d.is_online(), "device");
    }
    Ok(devices
        .into_iter()
        .filter(|d| d.is_online())
        .map(|d| d.sn)
        .collect())
}

pub struct HttpPoller {
    api: Arc<dyn DeviceApi>,
    ingestor: Ingestor,
    pinned: Vec<String>,
    interval: Duration,
}

impl HttpPoller {
    pub fn new(
        api: Arc<dyn DeviceApi>,
        ingestor: Ingestor,
        pinned: Vec<String>,
        cfg: &PollerConfig,
    ) -> Self {
        Self {
            api,
            ingestor,
            pinned,
            interval: Duration::from_secs(cfg.interval_secs),
        }
    }

    /// Polls immediately, then every interval until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = self.interval.as_secs(), "http poller started");
        let mut ticker = interval(self.interval);
        let mut round = 0u64;
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("http poller stopped");
                    return;
                }
                _ = ticker.tick() => {
                    round += 1;
                    match self.poll_once().await {
                        Ok(n) => info!(round, devices = n, "http poll done"),
                        Err(AppError::QueueClosed(e)) => {
                            warn!(error = %e, "ingestion queue closed; http poller exiting");
                            return;
                        }
                        Err(e) => error!(round, error = %e, "http poll failed"),
                    }
                }
            }
        }
    }

    /// One polling round. A failing device is logged and skipped; only a
    /// failed device list or a closed queue fails the round.
    pub async fn poll_once(&self) -> Result<usize, AppError> {
        let devices = resolve_devices(self.api.as_ref(), &self.pinned).await?;
        let mut polled = 0;
        for sn in &devices {
            match self.api.all_parameters(sn).await {
                Ok(params) => {
                    self.ingestor.handle_quota(sn, &params).await?;
                    polled += 1;
                }
                Err(e) => warn!(device = %sn, error = %e, "fetching quota failed"),
            }
        }
        Ok(polled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::Device;
    use crate::ingest::DestinationNaming;
    use crate::stats::Stats;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use serde_json::{json, Map, Value};
    use tokio::sync::mpsc;

    struct FakeApi;

    #[async_trait]
    impl DeviceApi for FakeApi {
        async fn device_list(&self) -> Result<Vec<Device>, AppError> {
            Ok(vec![
                Device {
                    sn: "HW51".into(),
                    online: 1,
                },
                Device {
                    sn: "R331".into(),
                    online: 0,
                },
                Device {
                    sn: "BROKEN".into(),
                    online: 1,
                },
            ])
        }

        async fn all_parameters(&self, sn: &str) -> Result<Map<String, Value>, AppError> {
            if sn == "BROKEN" {
                return Err(AppError::Api("code 1006: device offline".into()));
            }
            Ok(json!({"20_1.pv1InputWatts": 1000, "sn": sn})
                .as_object()
                .cloned()
                .unwrap_or_default())
        }
    }

    #[tokio::test]
    async fn test_resolve_online_or_pinned() {
        assert_eq!(
            resolve_devices(&FakeApi, &[]).await.unwrap(),
            vec!["HW51".to_string(), "BROKEN".to_string()]
        );
        assert_eq!(
            resolve_devices(&FakeApi, &["R331".to_string()]).await.unwrap(),
            vec!["R331".to_string()]
        );
    }

    #[tokio::test]
    async fn test_poll_once_skips_failing_device() {
        let (tx, mut rx) = mpsc::channel(8);
        let stats = Stats::new();
        let ingestor = Ingestor::new(
            tx,
            DestinationNaming::default(),
            "/app/device/property/{sn}",
            stats.clone(),
        );
        let poller = HttpPoller::new(
            Arc::new(FakeApi),
            ingestor,
            Vec::new(),
            &PollerConfig::default(),
        );

        assert_eq!(poller.poll_once().await.unwrap(), 1);
        let req = rx.recv().await.unwrap();
        assert_eq!(req.destination, "device_hw51_quota");
        assert!(rx.try_recv().is_err());
        assert_eq!(stats.device("HW51").http, 1);
        assert_eq!(stats.device("BROKEN").http, 0);
    }
}
