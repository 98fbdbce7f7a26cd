use crate::config::MqttConfig;
use crate::error::AppError;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

// Use the MQTT v5 API surface only
use rumqttc::v5 as mqtt5;
use rumqttc::Transport;

pub type MqttOptions = mqtt5::MqttOptions;
pub type AsyncClient = mqtt5::AsyncClient;
pub type EventLoop = mqtt5::EventLoop;
pub type V5Publish = mqtt5::mqttbytes::v5::Publish;
pub type QoS = mqtt5::mqttbytes::QoS;

pub const TOPIC_SN_PLACEHOLDER: &str = "{sn}";

pub fn build_options(cfg: &MqttConfig) -> Result<MqttOptions, AppError> {
    if cfg.host.is_empty() {
        return Err(AppError::Config("mqtt.host is empty".into()));
    }
    let client_id = format!("ecoflow-sink-{}", Uuid::new_v4());
    let mut opts = MqttOptions::new(client_id, cfg.host.clone(), cfg.port);
    opts.set_keep_alive(Duration::from_secs(cfg.keep_alive_secs.unwrap_or(30)));
    opts.set_clean_start(cfg.clean_session.unwrap_or(true));
    if let (Some(u), Some(p)) = (&cfg.username, &cfg.password) {
        opts.set_credentials(u.clone(), p.clone());
    }
    if cfg.port == 8883 {
        opts.set_transport(Transport::tls_with_default_config());
    }
    Ok(opts)
}

pub fn new(options: MqttOptions) -> (AsyncClient, EventLoop) {
    mqtt5::AsyncClient::new(options, 50)
}

pub fn qos(v: u8) -> QoS {
    match v {
        2 => QoS::ExactlyOnce,
        0 => QoS::AtMostOnce,
        _ => QoS::AtLeastOnce,
    }
}

/// Subscription topic for one device.
pub fn topic_for(template: &str, sn: &str) -> String {
    template.replace(TOPIC_SN_PLACEHOLDER, sn)
}

/// Queues a subscription per device without waiting on the event loop, so it
/// can be called from inside the loop that drives it.
pub fn subscribe_devices(
    client: &AsyncClient,
    template: &str,
    devices: &[String],
    qos_level: u8,
) -> usize {
    let mut subscribed = 0;
    for sn in devices {
        let topic = topic_for(template, sn);
        match client.try_subscribe(topic.clone(), qos(qos_level)) {
            Ok(()) => {
                info!(device = %sn, topic = %topic, "subscribed");
                subscribed += 1;
            }
            Err(e) => warn!(device = %sn, topic = %topic, error = %e, "subscribe failed"),
        }
    }
    subscribed
}

#[derive(Debug)]
pub enum MqttEvent {
    /// Broker accepted the connection; subscriptions must be (re)issued.
    Connected,
    Publish(V5Publish),
}

pub async fn next_event(eventloop: &mut EventLoop) -> Result<MqttEvent, AppError> {
    loop {
        match eventloop.poll().await {
            Ok(mqtt5::Event::Incoming(mqtt5::Incoming::ConnAck(_))) => {
                return Ok(MqttEvent::Connected)
            }
            Ok(mqtt5::Event::Incoming(mqtt5::Incoming::Publish(p))) => {
                return Ok(MqttEvent::Publish(p))
            }
            Ok(_) => continue,
            Err(e) => return Err(AppError::Mqtt(e.to_string())),
        }
    }
}

/// Queues a DISCONNECT and keeps polling the event loop until the connection
/// ends or `grace` runs out, so the packet actually reaches the broker.
pub async fn disconnect(client: &AsyncClient, eventloop: &mut EventLoop, grace: Duration) {
    if let Err(e) = client.try_disconnect() {
        warn!(error = %e, "mqtt disconnect failed");
        return;
    }
    let flush = async {
        loop {
            if let Err(e) = eventloop.poll().await {
                debug!(error = %e, "mqtt connection ended");
                return;
            }
        }
    };
    match tokio::time::timeout(grace, flush).await {
        Ok(()) => info!("disconnected from broker"),
        Err(_) => warn!(grace_ms = grace.as_millis() as u64, "mqtt disconnect timed out"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(port: u16) -> MqttConfig {
        MqttConfig {
            enabled: true,
            host: "mqtt-e.ecoflow.com".into(),
            port,
            username: Some("open-abc".into()),
            password: Some("pw".into()),
            keep_alive_secs: Some(45),
            clean_session: None,
            topic_template: "/open/open-abc/{sn}/quota".into(),
            qos: 1,
        }
    }

    #[test]
    fn test_topic_for() {
        assert_eq!(
            topic_for("/open/open-abc/{sn}/quota", "HW51"),
            "/open/open-abc/HW51/quota"
        );
    }

    #[test]
    fn test_build_options() {
        let opts = build_options(&cfg(1883)).unwrap();
        assert!(opts.client_id().starts_with("ecoflow-sink-"));
        assert_eq!(opts.keep_alive(), Duration::from_secs(45));
        assert_eq!(opts.broker_address(), ("mqtt-e.ecoflow.com".to_string(), 1883));

        let mut empty = cfg(8883);
        empty.host.clear();
        assert!(build_options(&empty).is_err());
    }

    #[test]
    fn test_qos_mapping() {
        assert_eq!(qos(0), QoS::AtMostOnce);
        assert_eq!(qos(1), QoS::AtLeastOnce);
        assert_eq!(qos(2), QoS::ExactlyOnce);
        assert_eq!(qos(7), QoS::AtLeastOnce);
    }

    #[tokio::test]
    async fn test_disconnect_returns_without_broker() {
        let mut c = cfg(1);
        c.host = "127.0.0.1".into();
        let (client, mut eventloop) = new(build_options(&c).unwrap());
        tokio::time::timeout(
            Duration::from_secs(5),
            disconnect(&client, &mut eventloop, Duration::from_secs(2)),
        )
        .await
        .unwrap();
    }
}
