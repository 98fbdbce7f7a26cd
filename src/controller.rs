//! Power throttling controller.
//!
//! Every cycle reads the newest combined samples (inverter, battery and house
//! meter), derives a new permanent-watts request relative to the previous one
//! and hands it to the actuator when it lies above the floor.

use crate::cloud::{validate_setpoint, PowerActuator};
use crate::config::ThrottleConfig;
use crate::error::StorageError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

/// One row of the control window.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlSample {
    pub timestamp: DateTime<Utc>,
    pub solar_gen: i64,
    pub bat_input: f64,
    pub bat_output: f64,
    pub house_in: i64,
    pub grid_watts: f64,
    pub requested: i64,
    pub bat_req_fill: i64,
    pub power_curr: i64,
    pub power_out: i64,
    pub bat_fill: i64,
}

impl ControlSample {
    pub fn header() -> String {
        format!(
            "{:>15} {:>10} {:>10} {:>10} {:>10} {:>10} {:>10} {:>10} {:>10} {:>10} {:>10}",
            "timestamp",
            "solargen",
            "batinput",
            "batout",
            "housein",
            "gridwatts",
            "requested",
            "batreqfill",
            "powercurr",
            "powerout",
            "batfill"
        )
    }

    pub fn line(&self) -> String {
        format!(
            "{:>15} {:>10} {:>10} {:>10} {:>10} {:>10} {:>10} {:>10} {:>10} {:>10} {:>10}",
            self.timestamp.format("%d.%m. %H:%M:%S"),
            self.solar_gen,
            self.bat_input,
            self.bat_output,
            self.house_in,
            self.grid_watts,
            self.requested,
            self.bat_req_fill,
            self.power_curr,
            self.power_out,
            self.bat_fill
        )
    }
}

/// Source of the control window, newest sample first.
#[async_trait]
pub trait WindowSource: Send + Sync {
    async fn read_window(&self, size: usize) -> Result<Vec<ControlSample>, StorageError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub floor: i64,
    pub ceiling: i64,
    pub margin: i64,
}

impl From<&ThrottleConfig> for Limits {
    fn from(cfg: &ThrottleConfig) -> Self {
        Self {
            floor: cfg.base_watts,
            ceiling: cfg.max_watts,
            margin: cfg.margin_watts,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub working_request: i64,
    pub median_power: f64,
    pub min_power: i64,
    pub max_power: i64,
    pub new_request: i64,
    /// Set-point to issue; `None` when the request sits at the floor.
    pub setpoint: Option<i64>,
}

/// Standard median; `None` for an empty slice. Sorts in place.
pub fn median(values: &mut [i64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_unstable();
    let l = values.len();
    if l % 2 == 0 {
        Some((values[l / 2 - 1] + values[l / 2]) as f64 / 2.0)
    } else {
        Some(values[l / 2] as f64)
    }
}

/// Computes the next request from a window ordered newest first.
pub fn decide(window: &[ControlSample], limits: &Limits) -> Option<Decision> {
    let newest = window.first()?;
    let requested = newest.requested;
    let mut working = requested;

    if newest.power_out > 0 {
        let candidate = requested - newest.power_out - limits.margin;
        debug!(reduce_by = newest.power_out, candidate, "output overshoot");
        working = if candidate > limits.floor {
            candidate
        } else {
            limits.floor
        };
    }

    if newest.house_in == 0 && requested > limits.floor {
        debug!(floor = limits.floor, "no house demand; falling back to base request");
        working = limits.floor;
    }

    let mut powers: Vec<i64> = window.iter().map(|s| s.power_curr).collect();
    let median_power = median(&mut powers)?;
    let min_power = powers[0];
    let max_power = powers[powers.len() - 1];

    let delta = newest.house_in + newest.power_curr - working;
    let new_request = (working + delta).clamp(limits.floor, limits.ceiling);

    Some(Decision {
        working_request: working,
        median_power,
        min_power,
        max_power,
        new_request,
        setpoint: (new_request > limits.floor).then_some(new_request),
    })
}

pub struct ThrottleController {
    source: Arc<dyn WindowSource>,
    actuator: Arc<dyn PowerActuator>,
    device_sn: String,
    limits: Limits,
    window: usize,
    interval: Duration,
    dry_run: bool,
}

impl ThrottleController {
    pub fn new(
        source: Arc<dyn WindowSource>,
        actuator: Arc<dyn PowerActuator>,
        cfg: &ThrottleConfig,
    ) -> Self {
        Self {
            source,
            actuator,
            device_sn: cfg.device_sn.clone(),
            limits: Limits::from(cfg),
            window: cfg.window,
            interval: Duration::from_secs(cfg.interval_secs),
            dry_run: cfg.dry_run,
        }
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            device = %self.device_sn,
            interval_secs = self.interval.as_secs(),
            dry_run = self.dry_run,
            "throttle controller started"
        );
        let mut ticker = interval(self.interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("throttle controller stopped");
                    return;
                }
                _ = ticker.tick() => {
                    self.cycle().await;
                }
            }
        }
    }

    /// Runs one control cycle and returns the decision taken, if any.
    pub async fn cycle(&self) -> Option<Decision> {
        let window = match self.source.read_window(self.window).await {
            Ok(w) => w,
            Err(e) => {
                error!(error = %e, "reading control window failed");
                return None;
            }
        };
        if window.is_empty() {
            debug!("control window empty; skipping cycle");
            return None;
        }
        if tracing::enabled!(tracing::Level::DEBUG) {
            debug!("{}", ControlSample::header());
            for s in &window {
                debug!("{}", s.line());
            }
        }

        let decision = decide(&window, &self.limits)?;
        info!(
            requested = window[0].requested,
            working = decision.working_request,
            median = decision.median_power,
            min = decision.min_power,
            max = decision.max_power,
            new_request = decision.new_request,
            "throttle decision"
        );

        if let Some(watts) = decision.setpoint {
            if self.dry_run {
                info!(device = %self.device_sn, watts, "dry run; set-point not issued");
            } else {
                self.issue(watts).await;
            }
        }
        Some(decision)
    }

    async fn issue(&self, watts: i64) {
        let watts = match validate_setpoint(watts as f64) {
            Ok(w) => w,
            Err(e) => {
                warn!(device = %self.device_sn, error = %e, "set-point rejected");
                return;
            }
        };
        match self.actuator.set_power_setpoint(&self.device_sn, watts).await {
            Ok(()) => info!(device = %self.device_sn, watts, "set-point issued"),
            Err(e) => error!(device = %self.device_sn, error = %e, "set-point failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;
    use std::sync::Mutex;

    const LIMITS: Limits = Limits {
        floor: 170,
        ceiling: 250,
        margin: 10,
    };

    fn sample(requested: i64, power_out: i64, house_in: i64, power_curr: i64) -> ControlSample {
        ControlSample {
            timestamp: Utc::now(),
            solar_gen: 0,
            bat_input: 0.0,
            bat_output: 0.0,
            house_in,
            grid_watts: 0.0,
            requested,
            bat_req_fill: 0,
            power_curr,
            power_out,
            bat_fill: 50,
        }
    }

    #[test]
    fn test_median_even_and_odd() {
        assert_eq!(median(&mut [5, 3, 9, 1]), Some(4.0));
        assert_eq!(median(&mut [7, 2, 9]), Some(7.0));
        assert_eq!(median(&mut []), None);
    }

    #[test]
    fn test_overshoot_clamps_to_floor() {
        let window = vec![sample(200, 30, 100, 50)];
        let d = decide(&window, &LIMITS).unwrap();
        assert_eq!(d.working_request, 170);
    }

    #[test]
    fn test_overshoot_reduces_request() {
        let window = vec![sample(240, 20, 100, 50)];
        let d = decide(&window, &LIMITS).unwrap();
        assert_eq!(d.working_request, 210);
    }

    #[test]
    fn test_no_house_load_returns_to_floor() {
        let window = vec![sample(230, 0, 0, 0)];
        let d = decide(&window, &LIMITS).unwrap();
        assert_eq!(d.working_request, 170);
        assert_eq!(d.new_request, 170);
        assert_eq!(d.setpoint, None);
    }

    #[test]
    fn test_output_always_within_bounds() {
        for requested in [-500, 0, 170, 200, 250, 4000] {
            for power_out in [-50, 0, 30, 400] {
                for house_in in [0, 90, 300, 5000] {
                    for power_curr in [-100, 0, 120, 900] {
                        let window = vec![sample(requested, power_out, house_in, power_curr)];
                        let d = decide(&window, &LIMITS).unwrap();
                        assert!(
                            (170..=250).contains(&d.new_request),
                            "out of bounds: {d:?}"
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn test_new_request_follows_house_and_current_power() {
        let window = vec![
            sample(180, 0, 120, 90),
            sample(180, 0, 110, 10),
            sample(180, 0, 100, 300),
        ];
        let d = decide(&window, &LIMITS).unwrap();
        assert_eq!(d.new_request, 210);
        assert_eq!(d.setpoint, Some(210));
        assert_eq!(d.median_power, 90.0);
        assert_eq!(d.min_power, 10);
        assert_eq!(d.max_power, 300);
    }

    #[test]
    fn test_empty_window_yields_nothing() {
        assert!(decide(&[], &LIMITS).is_none());
    }

    struct FixedWindow(Vec<ControlSample>);

    #[async_trait]
    impl WindowSource for FixedWindow {
        async fn read_window(&self, size: usize) -> Result<Vec<ControlSample>, StorageError> {
            Ok(self.0.iter().take(size).cloned().collect())
        }
    }

    #[derive(Default)]
    struct RecordingActuator(Mutex<Vec<(String, f64)>>);

    #[async_trait]
    impl PowerActuator for RecordingActuator {
        async fn set_power_setpoint(&self, device_sn: &str, watts: f64) -> Result<(), AppError> {
            self.0.lock().unwrap().push((device_sn.to_string(), watts));
            Ok(())
        }
    }

    fn throttle_config(dry_run: bool) -> ThrottleConfig {
        ThrottleConfig {
            enabled: true,
            dry_run,
            device_sn: "HW51".into(),
            ..ThrottleConfig::default()
        }
    }

    #[tokio::test]
    async fn test_cycle_issues_setpoint() {
        let actuator = Arc::new(RecordingActuator::default());
        let controller = ThrottleController::new(
            Arc::new(FixedWindow(vec![sample(180, 0, 150, 50)])),
            actuator.clone(),
            &throttle_config(false),
        );
        let d = controller.cycle().await.unwrap();
        assert_eq!(d.setpoint, Some(200));
        assert_eq!(
            actuator.0.lock().unwrap().as_slice(),
            &[("HW51".to_string(), 200.0)]
        );
    }

    #[tokio::test]
    async fn test_cycle_dry_run_and_floor_suppress() {
        let actuator = Arc::new(RecordingActuator::default());
        let controller = ThrottleController::new(
            Arc::new(FixedWindow(vec![sample(180, 0, 150, 50)])),
            actuator.clone(),
            &throttle_config(true),
        );
        assert!(controller.cycle().await.is_some());

        let controller = ThrottleController::new(
            Arc::new(FixedWindow(vec![sample(170, 0, 0, 0)])),
            actuator.clone(),
            &throttle_config(false),
        );
        assert_eq!(controller.cycle().await.unwrap().setpoint, None);
        assert!(actuator.0.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cycle_skips_empty_window() {
        let actuator = Arc::new(RecordingActuator::default());
        let controller = ThrottleController::new(
            Arc::new(FixedWindow(Vec::new())),
            actuator.clone(),
            &throttle_config(false),
        );
        assert!(controller.cycle().await.is_none());
    }
}
