use ecoflow_sink::cloud::{DeviceApi, EcoflowClient, PowerActuator};
use ecoflow_sink::config::Config;
use ecoflow_sink::controller::ThrottleController;
use ecoflow_sink::ingest::{DestinationNaming, Ingestor};
use ecoflow_sink::mqtt::{self, MqttEvent};
use ecoflow_sink::poller::{resolve_devices, HttpPoller};
use ecoflow_sink::shutdown::forward_signal;
use ecoflow_sink::stats::{self, Stats};
use ecoflow_sink::storage::postgres::{self, PgConnector, PgWindowSource};
use ecoflow_sink::storage::Connector;
use ecoflow_sink::writer::StorageWriter;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// `RUST_LOG` wins; otherwise `ENABLE_DEBUG` picks the level.
fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = match std::env::var("ENABLE_DEBUG").as_deref() {
            Ok("debug") | Ok("1") => "debug",
            _ => "info",
        };
        EnvFilter::new(level)
    })
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_target(false)
        .compact()
        .init();

    let cfg_path =
        std::env::var("APP_CONFIG").unwrap_or_else(|_| "config/config.example.yaml".into());
    let cfg = Config::load(&cfg_path)?;
    info!(
        mqtt = cfg.mqtt.enabled,
        poller = cfg.poller.enabled,
        throttle = cfg.throttle.enabled,
        "loaded config"
    );

    let db_options = postgres::connect_options(&cfg.database)?;
    let pool = postgres::connect(db_options.clone(), cfg.database.max_connections).await?;
    sqlx::query("SELECT 1").execute(&pool).await?;
    info!("connected to database");

    let stats = Stats::new();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(forward_signal(shutdown_tx));

    let connector: Arc<dyn Connector> =
        Arc::new(PgConnector::new(db_options, cfg.database.max_connections));
    let (tx, rx) = mpsc::channel(cfg.database.queue_capacity);
    let writer = tokio::spawn(StorageWriter::new(connector, stats.clone()).run(rx));

    let naming = DestinationNaming::new(
        cfg.database.table_prefix.clone(),
        cfg.database.shared_table.clone(),
    );
    let ingestor = Ingestor::new(tx, naming.clone(), cfg.mqtt.topic_template.clone(), stats.clone());

    let client = if cfg.ecoflow.access_key.is_empty() || cfg.ecoflow.secret_key.is_empty() {
        warn!("no cloud API credentials; polling and throttling disabled");
        None
    } else {
        Some(Arc::new(EcoflowClient::new(
            cfg.ecoflow.base_url.clone(),
            cfg.ecoflow.access_key.clone(),
            cfg.ecoflow.secret_key.clone(),
        )?))
    };

    let devices = match &client {
        Some(c) => resolve_devices(c.as_ref(), &cfg.ecoflow.devices).await?,
        None => cfg.ecoflow.devices.clone(),
    };
    info!(devices = ?devices, "device list");

    let mut tasks = Vec::new();

    if let (true, Some(c)) = (cfg.poller.enabled, &client) {
        let api: Arc<dyn DeviceApi> = c.clone();
        let poller = HttpPoller::new(api, ingestor.clone(), cfg.ecoflow.devices.clone(), &cfg.poller);
        let rx = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move { poller.run(rx).await }));
    }

    if cfg.throttle.enabled {
        let Some(c) = &client else {
            anyhow::bail!("throttle.enabled requires ecoflow.access_key and ecoflow.secret_key");
        };
        let t = &cfg.throttle;
        let inverter_table = t
            .inverter_table
            .clone()
            .unwrap_or_else(|| naming.quota(&t.device_sn));
        let battery_table = t
            .battery_table
            .clone()
            .unwrap_or_else(|| naming.quota(&t.battery_sn));
        let source = PgWindowSource::new(
            pool.clone(),
            &inverter_table,
            &battery_table,
            &t.energy_table,
            t.device_sn.clone(),
            t.battery_sn.clone(),
        );
        let actuator: Arc<dyn PowerActuator> = c.clone();
        let controller = ThrottleController::new(Arc::new(source), actuator, t);
        let rx = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move { controller.run(rx).await }));
    }

    tasks.push(tokio::spawn(stats::run_reporter(
        stats.clone(),
        Duration::from_secs(cfg.stats.interval_secs),
        shutdown_rx.clone(),
    )));

    let mut stop = shutdown_rx.clone();
    if cfg.mqtt.enabled {
        let opts = mqtt::build_options(&cfg.mqtt)?;
        let (client, mut eventloop) = mqtt::new(opts);
        loop {
            tokio::select! {
                biased;
                _ = stop.changed() => {
                    info!("shutdown requested");
                    break;
                }
                res = mqtt::next_event(&mut eventloop) => {
                    match res {
                        Ok(MqttEvent::Connected) => {
                            let n = mqtt::subscribe_devices(&client, &cfg.mqtt.topic_template, &devices, cfg.mqtt.qos);
                            info!("connected to broker; subscribed {n} device topic(s)");
                        }
                        Ok(MqttEvent::Publish(msg)) => {
                            let topic_bytes = msg.topic;
                            let payload = msg.payload;
                            let topic = match std::str::from_utf8(&topic_bytes) {
                                Ok(s) => s.to_string(),
                                Err(_) => {
                                    warn!(?topic_bytes, "non-utf8 topic; skipping message");
                                    continue;
                                }
                            };
                            if let Err(e) = ingestor.handle_message(&topic, payload.as_ref()).await {
                                warn!(topic=%topic, error=%e, "processing failed for incoming message");
                            }
                        }
                        Err(e) => {
                            warn!("mqtt error: {e}; reconnecting after short delay");
                            tokio::time::sleep(Duration::from_secs(2)).await;
                        }
                    }
                }
            }
        }
        mqtt::disconnect(&client, &mut eventloop, Duration::from_secs(2)).await;
    } else {
        let _ = stop.changed().await;
        info!("shutdown requested");
    }

    // Producers and timers see the same signal; the writer drains what was queued.
    for task in tasks {
        let _ = task.await;
    }
    drop(ingestor);
    let _ = writer.await;
    pool.close().await;
    info!("{}", stats.report().trim_end());
    Ok(())
}
