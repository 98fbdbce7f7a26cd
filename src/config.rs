use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub mqtt: MqttConfig,
    pub database: DbConfig,
    #[serde(default)]
    pub ecoflow: EcoflowConfig,
    #[serde(default)]
    pub poller: PollerConfig,
    #[serde(default)]
    pub throttle: ThrottleConfig,
    #[serde(default)]
    pub stats: StatsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    #[serde(default = "default_mqtt_enabled")]
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive_secs: Option<u64>,
    pub clean_session: Option<bool>,
    /// Subscription topic per device; `{sn}` is replaced by the serial number.
    #[serde(default = "default_topic_template")]
    pub topic_template: String,
    #[serde(default = "default_qos")]
    pub qos: u8,
}

fn default_mqtt_enabled() -> bool {
    true
}
fn default_topic_template() -> String {
    "/app/device/property/{sn}".into()
}
fn default_qos() -> u8 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbConfig {
    pub url: String,
    /// Used when `url` carries no user name.
    #[serde(default)]
    pub user: Option<String>,
    /// Used when `url` carries no password.
    #[serde(default)]
    pub password: Option<String>,
    /// Prefix for tables holding decoded binary records.
    #[serde(default)]
    pub table_prefix: String,
    /// Route every sample into this one table instead of per-device tables.
    #[serde(default)]
    pub shared_table: Option<String>,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_queue_capacity() -> usize {
    100
}
fn default_max_connections() -> u32 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EcoflowConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub access_key: String,
    #[serde(default)]
    pub secret_key: String,
    /// Pins the device list; when empty the online devices reported by the
    /// cloud API are used.
    #[serde(default)]
    pub devices: Vec<String>,
}

impl Default for EcoflowConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            access_key: String::new(),
            secret_key: String::new(),
            devices: Vec::new(),
        }
    }
}

fn default_base_url() -> String {
    "https://api.ecoflow.com".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_poll_secs")]
    pub interval_secs: u64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_poll_secs(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_poll_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThrottleConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Compute and log decisions without issuing set-points.
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default = "default_throttle_secs")]
    pub interval_secs: u64,
    /// Inverter whose permanent watts are throttled.
    #[serde(default)]
    pub device_sn: String,
    /// Battery pack providing the fill level.
    #[serde(default)]
    pub battery_sn: String,
    #[serde(default = "default_base_watts")]
    pub base_watts: i64,
    #[serde(default = "default_max_watts")]
    pub max_watts: i64,
    #[serde(default = "default_margin_watts")]
    pub margin_watts: i64,
    #[serde(default = "default_window")]
    pub window: usize,
    /// House energy meter table joined into the control window.
    #[serde(default = "default_energy_table")]
    pub energy_table: String,
    /// Defaults to the quota table of `device_sn`.
    #[serde(default)]
    pub inverter_table: Option<String>,
    /// Defaults to the quota table of `battery_sn`.
    #[serde(default)]
    pub battery_table: Option<String>,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            dry_run: false,
            interval_secs: default_throttle_secs(),
            device_sn: String::new(),
            battery_sn: String::new(),
            base_watts: default_base_watts(),
            max_watts: default_max_watts(),
            margin_watts: default_margin_watts(),
            window: default_window(),
            energy_table: default_energy_table(),
            inverter_table: None,
            battery_table: None,
        }
    }
}

fn default_throttle_secs() -> u64 {
    30
}
fn default_base_watts() -> i64 {
    170
}
fn default_max_watts() -> i64 {
    250
}
fn default_margin_watts() -> i64 {
    10
}
fn default_window() -> usize {
    10
}
fn default_energy_table() -> String {
    "home".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsConfig {
    #[serde(default = "default_stats_secs")]
    pub interval_secs: u64,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_stats_secs(),
        }
    }
}

fn default_stats_secs() -> u64 {
    300
}

impl Config {
    /// Load YAML from disk, substitute $(VAR)/${VAR} with env vars, then parse.
    /// Afterwards environment overrides are applied and the result validated.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, anyhow::Error> {
        let raw = fs::read_to_string(path)?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> Result<Self, anyhow::Error> {
        let expanded = expand_env_placeholders(raw)?;
        let mut cfg: Self = serde_yaml::from_str(&expanded)?;
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("DATABASE_URL").or_else(|_| std::env::var("ECOFLOW_DB_URL")) {
            self.database.url = url;
        }
        if self.database.user.is_none() {
            self.database.user = std::env::var("ECOFLOW_DB_USER").ok();
        }
        if self.database.password.is_none() {
            self.database.password = std::env::var("ECOFLOW_DB_PASS").ok();
        }
        if self.database.table_prefix.is_empty() {
            if let Ok(prefix) = std::env::var("ECOFLOW_DB_TABLENAME") {
                self.database.table_prefix = prefix;
            }
        }
        if let Ok(key) = std::env::var("ECOFLOW_ACCESS_KEY") {
            self.ecoflow.access_key = key;
        }
        if let Ok(key) = std::env::var("ECOFLOW_SECRET_KEY") {
            self.ecoflow.secret_key = key;
        }
        if self.mqtt.username.is_none() {
            self.mqtt.username = std::env::var("ECOFLOW_USER").ok();
        }
        if self.mqtt.password.is_none() {
            self.mqtt.password = std::env::var("ECOFLOW_PASSWORD").ok();
        }
    }

    fn validate(&self) -> Result<(), anyhow::Error> {
        anyhow::ensure!(
            self.database.url.starts_with("postgres://")
                || self.database.url.starts_with("postgresql://"),
            "database.url must be a postgres:// URL"
        );
        anyhow::ensure!(
            self.database.queue_capacity >= 1,
            "database.queue_capacity must be at least 1"
        );
        let t = &self.throttle;
        anyhow::ensure!(t.window >= 1, "throttle.window must be at least 1");
        anyhow::ensure!(
            0 <= t.base_watts && t.base_watts <= t.max_watts,
            "throttle.base_watts must lie within 0..=max_watts"
        );
        anyhow::ensure!(
            t.max_watts as f64 <= crate::cloud::MAX_SETPOINT_WATTS,
            "throttle.max_watts exceeds {} W",
            crate::cloud::MAX_SETPOINT_WATTS
        );
        if t.enabled {
            anyhow::ensure!(
                !t.device_sn.is_empty() && !t.battery_sn.is_empty(),
                "throttle requires device_sn and battery_sn"
            );
        }
        anyhow::ensure!(
            self.mqtt.topic_template.contains("{sn}"),
            "mqtt.topic_template must contain {{sn}}"
        );
        Ok(())
    }
}

/// Expand $(VAR) and ${VAR} placeholders using environment variables.
/// Notes:
/// - "{sn}" (topic template) is NOT matched; only "$(" and "${" are.
/// - "$$" becomes a literal "$" (escape).
fn expand_env_placeholders(input: &str) -> Result<String, anyhow::Error> {
    use anyhow::Context;

    let mut out = String::with_capacity(input.len());
    let mut it = input.chars().peekable();

    while let Some(c) = it.next() {
        if c == '$' {
            match it.peek().copied() {
                Some('$') => {
                    it.next();
                    out.push('$');
                }
                Some(open @ ('(' | '{')) => {
                    it.next();
                    let close = if open == '(' { ')' } else { '}' };
                    let var = read_until(&mut it, close)
                        .with_context(|| format!("unterminated env placeholder: missing '{close}'"))?;
                    let val = std::env::var(&var)
                        .with_context(|| format!("missing environment variable: {}", var))?;
                    out.push_str(&val);
                }
                _ => out.push('$'),
            }
        } else {
            out.push(c);
        }
    }

    Ok(out)
}

/// Read characters until we hit `end`, returning the collected string.
/// Consumes the closing delimiter.
fn read_until<I>(it: &mut std::iter::Peekable<I>, end: char) -> Option<String>
where
    I: Iterator<Item = char>,
{
    let mut buf = String::new();
    for ch in it.by_ref() {
        if ch == end {
            return Some(buf);
        }
        buf.push(ch);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const BASE: &str = r#"
mqtt:
  host: "mqtt-e.ecoflow.com"
  port: 8883
  topic_template: "/open/acc/{sn}/quota"

database:
  url: "postgres://localhost/eco"
  table_prefix: "ecoflow"

throttle:
  enabled: true
  device_sn: "HW51ZEH49G9Q1664"
  battery_sn: "R331ZEB5SGBU0300"
  base_watts: 180
"#;

    fn clear_env() {
        for var in [
            "DATABASE_URL",
            "ECOFLOW_DB_URL",
            "ECOFLOW_DB_TABLENAME",
            "ECOFLOW_ACCESS_KEY",
            "ECOFLOW_SECRET_KEY",
            "ECOFLOW_USER",
            "ECOFLOW_PASSWORD",
            "ECOFLOW_DB_USER",
            "ECOFLOW_DB_PASS",
        ] {
            std::env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn test_config_defaults() {
        clear_env();
        let cfg = Config::from_yaml(BASE).unwrap();
        assert_eq!(cfg.throttle.base_watts, 180);
        assert_eq!(cfg.throttle.max_watts, 250);
        assert_eq!(cfg.throttle.margin_watts, 10);
        assert_eq!(cfg.database.queue_capacity, 100);
        assert_eq!(cfg.poller.interval_secs, 60);
        assert_eq!(cfg.stats.interval_secs, 300);
        assert!(cfg.ecoflow.devices.is_empty());
    }

    #[test]
    #[serial]
    fn test_config_env_override() {
        clear_env();
        std::env::set_var("DATABASE_URL", "postgres://override/eco");
        std::env::set_var("ECOFLOW_USER", "me@example.com");
        let cfg = Config::from_yaml(BASE).unwrap();
        assert_eq!(cfg.database.url, "postgres://override/eco");
        assert_eq!(cfg.mqtt.username.as_deref(), Some("me@example.com"));
        clear_env();
    }

    #[test]
    #[serial]
    fn test_db_credentials_from_env() {
        clear_env();
        std::env::set_var("ECOFLOW_DB_USER", "ingest");
        std::env::set_var("ECOFLOW_DB_PASS", "pw");
        let cfg = Config::from_yaml(BASE).unwrap();
        assert_eq!(cfg.database.user.as_deref(), Some("ingest"));
        assert_eq!(cfg.database.password.as_deref(), Some("pw"));

        let yaml = BASE.replace(
            "  table_prefix: \"ecoflow\"",
            "  table_prefix: \"ecoflow\"\n  user: \"owner\"",
        );
        let cfg = Config::from_yaml(&yaml).unwrap();
        assert_eq!(cfg.database.user.as_deref(), Some("owner"));
        assert_eq!(cfg.database.password.as_deref(), Some("pw"));
        clear_env();
    }

    #[test]
    #[serial]
    fn test_config_placeholders() {
        clear_env();
        std::env::set_var("ECOFLOW_TEST_SECRET", "s3cr3t");
        let yaml = format!("{BASE}\necoflow:\n  secret_key: \"${{ECOFLOW_TEST_SECRET}}\"\n  devices: [\"$(ECOFLOW_TEST_SECRET)\", \"a$$b\"]\n");
        let cfg = Config::from_yaml(&yaml).unwrap();
        assert_eq!(cfg.ecoflow.secret_key, "s3cr3t");
        assert_eq!(cfg.ecoflow.devices, vec!["s3cr3t".to_string(), "a$b".to_string()]);
        std::env::remove_var("ECOFLOW_TEST_SECRET");
    }

    #[test]
    #[serial]
    fn test_config_rejects_bad_target() {
        clear_env();
        let yaml = BASE.replace("postgres://localhost/eco", "mysql://localhost/eco");
        assert!(Config::from_yaml(&yaml).is_err());

        let yaml = BASE.replace("base_watts: 180", "base_watts: 400");
        assert!(Config::from_yaml(&yaml).is_err());
    }

    #[test]
    fn test_missing_placeholder_fails() {
        assert!(expand_env_placeholders("x: ${ECOFLOW_SURELY_UNSET_VAR}").is_err());
        assert!(expand_env_placeholders("x: ${UNTERMINATED").is_err());
        assert_eq!(expand_env_placeholders("a/{sn}/b").unwrap(), "a/{sn}/b");
    }
}
