//! Cloud API access: device discovery, quota snapshots and the power set-point.

use crate::error::AppError;
use async_trait::async_trait;
use rand::Rng;
use ring::hmac;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

pub const MAX_SETPOINT_WATTS: f64 = 6000.0;
const SET_PERMANENT_WATTS: &str = "WN511_SET_PERMANENT_WATTS_PACK";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Device {
    pub sn: String,
    #[serde(default)]
    pub online: u8,
}

impl Device {
    pub fn is_online(&self) -> bool {
        self.online == 1
    }
}

#[async_trait]
pub trait DeviceApi: Send + Sync {
    async fn device_list(&self) -> Result<Vec<Device>, AppError>;

    /// Full quota snapshot of one device, keyed by dotted attribute path.
    async fn all_parameters(&self, sn: &str) -> Result<Map<String, Value>, AppError>;
}

#[async_trait]
pub trait PowerActuator: Send + Sync {
    async fn set_power_setpoint(&self, device_sn: &str, watts: f64) -> Result<(), AppError>;
}

/// Rejects set-points outside `0..=6000` W.
pub fn validate_setpoint(watts: f64) -> Result<f64, AppError> {
    if !watts.is_finite() || !(0.0..=MAX_SETPOINT_WATTS).contains(&watts) {
        return Err(AppError::Api(format!(
            "set-point {watts} W outside 0..={MAX_SETPOINT_WATTS} W"
        )));
    }
    Ok(watts)
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    code: String,
    #[serde(default)]
    message: Option<String>,
    data: Option<T>,
}

impl<T> ApiResponse<T> {
    fn into_data(self) -> Result<T, AppError> {
        if self.code != "0" {
            return Err(AppError::Api(format!(
                "code {}: {}",
                self.code,
                self.message.unwrap_or_default()
            )));
        }
        self.data
            .ok_or_else(|| AppError::Api("response carries no data".into()))
    }
}

/// Signed HTTP client for the open IoT API.
pub struct EcoflowClient {
    http: reqwest::Client,
    base_url: String,
    access_key: String,
    secret_key: String,
}

impl EcoflowClient {
    pub fn new(
        base_url: impl Into<String>,
        access_key: impl Into<String>,
        secret_key: impl Into<String>,
    ) -> Result<Self, AppError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            access_key: access_key.into(),
            secret_key: secret_key.into(),
        })
    }

    fn auth_headers(&self, params: &BTreeMap<String, String>) -> Vec<(&'static str, String)> {
        let nonce = rand::thread_rng().gen_range(100_000..1_000_000).to_string();
        let timestamp = chrono::Utc::now().timestamp_millis().to_string();
        let payload = signature_payload(params, &self.access_key, &nonce, &timestamp);
        let sign = sign(&self.secret_key, &payload);
        vec![
            ("accessKey", self.access_key.clone()),
            ("nonce", nonce),
            ("timestamp", timestamp),
            ("sign", sign),
        ]
    }

    async fn get<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, AppError> {
        let params: BTreeMap<String, String> = query
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let mut req = self.http.get(format!("{}{}", self.base_url, path)).query(query);
        for (k, v) in self.auth_headers(&params) {
            req = req.header(k, v);
        }
        let resp: ApiResponse<T> = req.send().await?.error_for_status()?.json().await?;
        resp.into_data()
    }
}

#[async_trait]
impl DeviceApi for EcoflowClient {
    async fn device_list(&self) -> Result<Vec<Device>, AppError> {
        self.get("/iot-open/sign/device/list", &[]).await
    }

    async fn all_parameters(&self, sn: &str) -> Result<Map<String, Value>, AppError> {
        self.get("/iot-open/sign/device/quota/all", &[("sn", sn)])
            .await
    }
}

#[async_trait]
impl PowerActuator for EcoflowClient {
    async fn set_power_setpoint(&self, device_sn: &str, watts: f64) -> Result<(), AppError> {
        let watts = validate_setpoint(watts)?;
        // The device expects deciwatts.
        let body = json!({
            "sn": device_sn,
            "cmdCode": SET_PERMANENT_WATTS,
            "params": { "permanentWatts": (watts * 10.0).round() as i64 },
        });
        let params = flatten_params(&body);
        let mut req = self
            .http
            .put(format!("{}/iot-open/sign/device/quota", self.base_url))
            .json(&body);
        for (k, v) in self.auth_headers(&params) {
            req = req.header(k, v);
        }
        let resp: ApiResponse<Value> = req.send().await?.error_for_status()?.json().await?;
        if resp.code != "0" {
            return Err(AppError::Api(format!(
                "set-point rejected with code {}: {}",
                resp.code,
                resp.message.unwrap_or_default()
            )));
        }
        debug!(device = %device_sn, watts, "set-point acknowledged");
        Ok(())
    }
}

/// Flattens a JSON body into signing parameters: nested keys are joined
/// with `.`, array elements are addressed as `key[i]`.
pub fn flatten_params(value: &Value) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    flatten_into(&mut out, None, value);
    out
}

fn flatten_into(out: &mut BTreeMap<String, String>, prefix: Option<&str>, value: &Value) {
    match value {
        Value::Object(map) => {
            for (k, v) in map {
                let key = match prefix {
                    Some(p) => format!("{p}.{k}"),
                    None => k.clone(),
                };
                flatten_into(out, Some(&key), v);
            }
        }
        Value::Array(items) => {
            for (i, v) in items.iter().enumerate() {
                let key = format!("{}[{i}]", prefix.unwrap_or_default());
                flatten_into(out, Some(&key), v);
            }
        }
        Value::String(s) => {
            if let Some(p) = prefix {
                out.insert(p.to_string(), s.clone());
            }
        }
        Value::Null => {}
        other => {
            if let Some(p) = prefix {
                out.insert(p.to_string(), other.to_string());
            }
        }
    }
}

/// `k1=v1&k2=v2&accessKey=..&nonce=..&timestamp=..` with parameters sorted.
pub fn signature_payload(
    params: &BTreeMap<String, String>,
    access_key: &str,
    nonce: &str,
    timestamp: &str,
) -> String {
    let mut parts: Vec<String> = params.iter().map(|(k, v)| format!("{k}={v}")).collect();
    parts.push(format!("accessKey={access_key}"));
    parts.push(format!("nonce={nonce}"));
    parts.push(format!("timestamp={timestamp}"));
    parts.join("&")
}

/// Lowercase hex HMAC-SHA256.
pub fn sign(secret: &str, payload: &str) -> String {
    let key = hmac::Key::new(hmac::HMAC_SHA256, secret.as_bytes());
    hex::encode(hmac::sign(&key, payload.as_bytes()).as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_validate_setpoint() {
        assert_eq!(validate_setpoint(200.0).unwrap(), 200.0);
        assert!(validate_setpoint(0.0).is_ok());
        assert!(validate_setpoint(6000.0).is_ok());
        assert!(validate_setpoint(-1.0).is_err());
        assert!(validate_setpoint(6000.5).is_err());
        assert!(validate_setpoint(f64::NAN).is_err());
    }

    #[test]
    fn test_flatten_params() {
        let body = json!({
            "sn": "HW51",
            "cmdCode": "WN511_SET_PERMANENT_WATTS_PACK",
            "params": {"permanentWatts": 2000, "list": [1, "a"]}
        });
        let flat = flatten_params(&body);
        let keys: Vec<&str> = flat.keys().map(String::as_str).collect();
        assert_eq!(
            keys,
            vec![
                "cmdCode",
                "params.list[0]",
                "params.list[1]",
                "params.permanentWatts",
                "sn"
            ]
        );
        assert_eq!(flat["params.permanentWatts"], "2000");
        assert_eq!(flat["params.list[1]"], "a");
    }

    #[test]
    fn test_signature_payload_order() {
        let mut params = BTreeMap::new();
        params.insert("sn".to_string(), "HW51".to_string());
        let payload = signature_payload(&params, "ak", "123456", "1700000000000");
        assert_eq!(
            payload,
            "sn=HW51&accessKey=ak&nonce=123456&timestamp=1700000000000"
        );
        let no_params = signature_payload(&BTreeMap::new(), "ak", "1", "2");
        assert_eq!(no_params, "accessKey=ak&nonce=1&timestamp=2");
    }

    #[test]
    fn test_sign_is_deterministic_hex() {
        let a = sign("secret", "accessKey=ak&nonce=1&timestamp=2");
        let b = sign("secret", "accessKey=ak&nonce=1&timestamp=2");
        let c = sign("other", "accessKey=ak&nonce=1&timestamp=2");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|ch| ch.is_ascii_hexdigit() && !ch.is_ascii_uppercase()));
    }

    #[test]
    fn test_api_response_code() {
        let ok: ApiResponse<Vec<Device>> = serde_json::from_value(json!({
            "code": "0",
            "message": "Success",
            "data": [{"sn": "HW51", "online": 1}, {"sn": "R331", "online": 0}]
        }))
        .unwrap();
        let devices = ok.into_data().unwrap();
        assert!(devices[0].is_online());
        assert!(!devices[1].is_online());

        let err: ApiResponse<Vec<Device>> =
            serde_json::from_value(json!({"code": "1006", "message": "bad sign"})).unwrap();
        assert!(err.into_data().is_err());
    }
}
