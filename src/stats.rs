//! Message and insert counters, reported periodically.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::interval;
use tracing::info;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeviceCounters {
    pub http: u64,
    pub mqtt: u64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DestinationCounters {
    pub inserted: u64,
    pub failed: u64,
}

#[derive(Debug, Default)]
struct Inner {
    devices: BTreeMap<String, DeviceCounters>,
    destinations: BTreeMap<String, DestinationCounters>,
}

/// Shared counter registry; cloning hands out another handle to the same counters.
#[derive(Debug, Clone, Default)]
pub struct Stats {
    inner: Arc<Mutex<Inner>>,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn http_received(&self, sn: &str) {
        self.lock().devices.entry(sn.to_string()).or_default().http += 1;
    }

    pub fn mqtt_received(&self, sn: &str) {
        self.lock().devices.entry(sn.to_string()).or_default().mqtt += 1;
    }

    pub fn inserted(&self, destination: &str, rows: u64) {
        self.lock()
            .destinations
            .entry(destination.to_string())
            .or_default()
            .inserted += rows;
    }

    pub fn failed(&self, destination: &str) {
        self.lock()
            .destinations
            .entry(destination.to_string())
            .or_default()
            .failed += 1;
    }

    pub fn device(&self, sn: &str) -> DeviceCounters {
        self.lock().devices.get(sn).copied().unwrap_or_default()
    }

    pub fn destination(&self, destination: &str) -> DestinationCounters {
        self.lock()
            .destinations
            .get(destination)
            .copied()
            .unwrap_or_default()
    }

    /// Human readable snapshot of all counters.
    pub fn report(&self) -> String {
        let inner = self.lock();
        let mut out = String::from("Statistics:\n");
        for (sn, c) in &inner.devices {
            out.push_str(&format!(
                "  {sn} got http={:03} mqtt={:03} messages\n",
                c.http, c.mqtt
            ));
        }
        for (dest, c) in &inner.destinations {
            out.push_str(&format!("  {dest} inserted {:03} records", c.inserted));
            if c.failed > 0 {
                out.push_str(&format!(", {:03} failed", c.failed));
            }
            out.push('\n');
        }
        out
    }
}

/// Logs [`Stats::report`] every `every` until shutdown is signalled.
pub async fn run_reporter(stats: Stats, every: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = interval(every);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                info!("statistics stopped");
                return;
            }
            _ = ticker.tick() => {
                info!("{}", stats.report().trim_end());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_report_format() {
        let stats = Stats::new();
        stats.mqtt_received("HW51");
        stats.mqtt_received("HW51");
        stats.http_received("HW51");
        stats.inserted("hw51_mqtt", 2);
        stats.failed("device_r331_quota");

        assert_eq!(
            stats.report(),
            "Statistics:\n  HW51 got http=001 mqtt=002 messages\n  device_r331_quota inserted 000 records, 001 failed\n  hw51_mqtt inserted 002 records\n"
        );
        assert_eq!(stats.device("HW51"), DeviceCounters { http: 1, mqtt: 2 });
        assert_eq!(stats.destination("nope"), DestinationCounters::default());
    }

    #[tokio::test]
    async fn test_reporter_stops_on_shutdown() {
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(run_reporter(Stats::new(), Duration::from_millis(10), rx));
        tokio::time::sleep(Duration::from_millis(35)).await;
        tx.send(true).unwrap();
        tokio_test::assert_ok!(handle.await);
    }
}
