//! Environment-driven configuration with bounds validation.
//!
//! All knobs come from environment variables with safe defaults.  Validation
//! collects every violation before failing so a misconfigured deployment
//! reports the full list at once rather than one error per restart.

use std::env;
use std::time::Duration;

use anyhow::{bail, Result};
use serde::Serialize;
use tracing::{error, warn};

/// Temperature sanity bounds (°F).  Below freezing or above 130 °F the
/// thresholds cannot describe a real server-shed deployment.
const MIN_TEMP_F: f64 = 32.0;
const MAX_TEMP_F: f64 = 130.0;

/// Duration bounds (seconds).
const MIN_MIST_DURATION_SEC: u64 = 60;
const MAX_MIST_DURATION_SEC: u64 = 7200;
const MIN_CHECK_INTERVAL_SEC: u64 = 10;
const MIN_COOLDOWN_SEC: u64 = 60;

/// Resolved controller configuration.
///
/// Durations are stored as whole seconds so the struct serialises directly
/// into the status payload; accessors return [`Duration`] for callers.
#[derive(Debug, Clone, Serialize)]
pub struct MisterConfig {
    /// Start misting when temperature rises above this (°F).
    pub temp_high_f: f64,
    /// Stop misting when temperature falls below this (°F).
    pub temp_low_f: f64,
    /// Start misting when humidity falls below this (%).
    pub humidity_low_pct: f64,
    /// Stop misting when humidity rises above this (%).
    pub humidity_high_pct: f64,
    /// Maximum length of one misting cycle.
    pub mist_duration_sec: u64,
    /// How often the evaluation loop runs.
    pub check_interval_sec: u64,
    /// Minimum time between the start of one cycle and the next.
    pub cooldown_sec: u64,
    /// Minimum time between any two valve commands (hardware protection).
    pub min_valve_action_sec: u64,
    /// Timeout applied to every sensor/valve collaborator call.
    pub device_timeout_sec: u64,
    /// Where the persisted state record lives.
    #[serde(skip)]
    pub state_file: String,
}

impl MisterConfig {
    /// Read configuration from the environment.  Unparseable values fall
    /// back to their default with an error log; out-of-range values are
    /// caught by [`MisterConfig::validate`].
    pub fn from_env() -> Self {
        let check_interval_sec = env_u64("CHECK_INTERVAL", 60);

        Self {
            temp_high_f: env_f64("TEMP_HIGH", 95.0),
            temp_low_f: env_f64("TEMP_LOW", 95.0),
            humidity_low_pct: env_f64("HUMIDITY_LOW", 35.0),
            humidity_high_pct: env_f64("HUMIDITY_HIGH", 35.0),
            mist_duration_sec: env_u64("MISTER_DURATION", 600),
            check_interval_sec,
            cooldown_sec: env_u64("COOLDOWN_SECONDS", 300),
            min_valve_action_sec: env_u64("MIN_VALVE_ACTION_SECONDS", 30),
            // A hung network call must never outlive the evaluation
            // interval, or stop()/shutdown would be delayed behind it.
            device_timeout_sec: env_u64("DEVICE_TIMEOUT_SECONDS", 15)
                .min(check_interval_sec.max(1)),
            state_file: env::var("STATE_FILE").unwrap_or_else(|_| "./data/state.json".to_string()),
        }
    }

    pub fn mist_duration(&self) -> Duration {
        Duration::from_secs(self.mist_duration_sec)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_sec)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_sec)
    }

    pub fn min_valve_action_interval(&self) -> Duration {
        Duration::from_secs(self.min_valve_action_sec)
    }

    pub fn device_timeout(&self) -> Duration {
        Duration::from_secs(self.device_timeout_sec)
    }

    /// Validate all values.  Returns `Ok(())` or an error describing every
    /// critical violation found (not just the first one).  Hazardous but
    /// permitted combinations are logged as warnings.
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_temperatures(&mut errors);
        self.validate_humidity(&mut errors);
        self.validate_durations(&mut errors);
        self.warn_hazards();

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_temperatures(&self, errors: &mut Vec<String>) {
        for (name, value) in [("TEMP_HIGH", self.temp_high_f), ("TEMP_LOW", self.temp_low_f)] {
            if value < MIN_TEMP_F {
                errors.push(format!(
                    "{name}={value}°F is below freezing ({MIN_TEMP_F}°F)"
                ));
            }
            if value > MAX_TEMP_F {
                errors.push(format!(
                    "{name}={value}°F is dangerously high (max {MAX_TEMP_F}°F)"
                ));
            }
        }
    }

    fn validate_humidity(&self, errors: &mut Vec<String>) {
        for (name, value) in [
            ("HUMIDITY_LOW", self.humidity_low_pct),
            ("HUMIDITY_HIGH", self.humidity_high_pct),
        ] {
            if !(0.0..=100.0).contains(&value) {
                errors.push(format!("{name}={value}% out of range [0, 100]"));
            }
        }
    }

    fn validate_durations(&self, errors: &mut Vec<String>) {
        if self.mist_duration_sec < MIN_MIST_DURATION_SEC {
            errors.push(format!(
                "MISTER_DURATION={}s is too short (minimum {MIN_MIST_DURATION_SEC}s)",
                self.mist_duration_sec
            ));
        } else if self.mist_duration_sec > MAX_MIST_DURATION_SEC {
            errors.push(format!(
                "MISTER_DURATION={}s is too long (maximum {MAX_MIST_DURATION_SEC}s)",
                self.mist_duration_sec
            ));
        }

        if self.check_interval_sec < MIN_CHECK_INTERVAL_SEC {
            errors.push(format!(
                "CHECK_INTERVAL={}s is too short (minimum {MIN_CHECK_INTERVAL_SEC}s)",
                self.check_interval_sec
            ));
        }

        if self.cooldown_sec < MIN_COOLDOWN_SEC {
            errors.push(format!(
                "COOLDOWN_SECONDS={}s is too short (minimum {MIN_COOLDOWN_SEC}s)",
                self.cooldown_sec
            ));
        }

        if self.min_valve_action_sec == 0 {
            errors.push("MIN_VALVE_ACTION_SECONDS must be positive".to_string());
        }

        if self.device_timeout_sec == 0 {
            errors.push("DEVICE_TIMEOUT_SECONDS must be positive".to_string());
        }
    }

    /// Hazardous combinations that remain legal: logged, never fatal.
    fn warn_hazards(&self) {
        if self.temp_low_f > self.temp_high_f {
            warn!(
                temp_low = self.temp_low_f,
                temp_high = self.temp_high_f,
                "TEMP_LOW exceeds TEMP_HIGH — the temperature stop condition \
                 can become unreachable; MISTER_DURATION is the only backstop"
            );
        }
        if self.humidity_low_pct > self.humidity_high_pct {
            warn!(
                humidity_low = self.humidity_low_pct,
                humidity_high = self.humidity_high_pct,
                "HUMIDITY_LOW exceeds HUMIDITY_HIGH — the humidity stop \
                 condition can become unreachable"
            );
        }
        if self.check_interval_sec >= self.mist_duration_sec {
            warn!(
                check_interval = self.check_interval_sec,
                mist_duration = self.mist_duration_sec,
                "check interval is not shorter than the misting duration, so \
                 conditions are never re-checked mid-cycle"
            );
        }
        if self.cooldown_sec < self.mist_duration_sec {
            warn!(
                cooldown = self.cooldown_sec,
                mist_duration = self.mist_duration_sec,
                "cooldown is shorter than the misting duration — back-to-back \
                 cycles are possible"
            );
        }
        if self.cooldown_sec > 3600 {
            warn!(
                cooldown = self.cooldown_sec,
                "cooldown is over an hour — misting will be infrequent"
            );
        }
        if self.temp_high_f < 60.0 {
            warn!(
                temp_high = self.temp_high_f,
                "TEMP_HIGH is unusually low for a misting threshold"
            );
        }
    }

    /// Defaults used throughout the test suite: 95/95 °F, 35/35 %, 600 s
    /// duration, 60 s interval, 300 s cooldown, 30 s valve interval.
    #[cfg(test)]
    pub fn for_tests() -> Self {
        Self {
            temp_high_f: 95.0,
            temp_low_f: 95.0,
            humidity_low_pct: 35.0,
            humidity_high_pct: 35.0,
            mist_duration_sec: 600,
            check_interval_sec: 60,
            cooldown_sec: 300,
            min_valve_action_sec: 30,
            device_timeout_sec: 5,
            state_file: String::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Env parsing helpers
// ---------------------------------------------------------------------------

fn env_f64(key: &str, default: f64) -> f64 {
    match env::var(key) {
        Err(_) => default,
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            error!(%key, value = %raw, %default, "invalid float env value, using default");
            default
        }),
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    match env::var(key) {
        Err(_) => default,
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            error!(%key, value = %raw, %default, "invalid integer env value, using default");
            default
        }),
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// Assert validation fails and the error message contains `needle`.
    fn assert_validation_err(cfg: &MisterConfig, needle: &str) {
        let err = cfg.validate().unwrap_err();
        let msg = format!("{err:#}");
        assert!(
            msg.contains(needle),
            "expected error containing {needle:?}, got: {msg}"
        );
    }

    // -- Valid configs pass -----------------------------------------------

    #[test]
    fn default_config_passes() {
        MisterConfig::for_tests().validate().unwrap();
    }

    #[test]
    fn hysteresis_band_passes() {
        let mut cfg = MisterConfig::for_tests();
        cfg.temp_high_f = 95.0;
        cfg.temp_low_f = 85.0;
        cfg.humidity_low_pct = 30.0;
        cfg.humidity_high_pct = 50.0;
        cfg.validate().unwrap();
    }

    // -- Temperature bounds -----------------------------------------------

    #[test]
    fn temp_high_below_freezing_rejected() {
        let mut cfg = MisterConfig::for_tests();
        cfg.temp_high_f = 20.0;
        assert_validation_err(&cfg, "TEMP_HIGH=20°F is below freezing");
    }

    #[test]
    fn temp_high_too_hot_rejected() {
        let mut cfg = MisterConfig::for_tests();
        cfg.temp_high_f = 150.0;
        assert_validation_err(&cfg, "TEMP_HIGH=150°F is dangerously high");
    }

    #[test]
    fn temp_low_below_freezing_rejected() {
        let mut cfg = MisterConfig::for_tests();
        cfg.temp_low_f = 0.0;
        assert_validation_err(&cfg, "TEMP_LOW=0°F is below freezing");
    }

    #[test]
    fn inverted_temps_accepted_with_warning() {
        // Permitted: the stop condition becomes unreachable by temperature
        // and the duration cap is the backstop.  Hazard, not an error.
        let mut cfg = MisterConfig::for_tests();
        cfg.temp_high_f = 90.0;
        cfg.temp_low_f = 100.0;
        cfg.validate().unwrap();
    }

    #[test]
    fn inverted_humidity_accepted() {
        let mut cfg = MisterConfig::for_tests();
        cfg.humidity_low_pct = 60.0;
        cfg.humidity_high_pct = 40.0;
        cfg.validate().unwrap();
    }

    // -- Humidity bounds --------------------------------------------------

    #[test]
    fn humidity_low_negative_rejected() {
        let mut cfg = MisterConfig::for_tests();
        cfg.humidity_low_pct = -5.0;
        assert_validation_err(&cfg, "HUMIDITY_LOW=-5% out of range");
    }

    #[test]
    fn humidity_high_over_100_rejected() {
        let mut cfg = MisterConfig::for_tests();
        cfg.humidity_high_pct = 101.0;
        assert_validation_err(&cfg, "HUMIDITY_HIGH=101% out of range");
    }

    #[test]
    fn humidity_boundaries_accepted() {
        let mut cfg = MisterConfig::for_tests();
        cfg.humidity_low_pct = 0.0;
        cfg.humidity_high_pct = 100.0;
        cfg.validate().unwrap();
    }

    // -- Duration bounds --------------------------------------------------

    #[test]
    fn mist_duration_too_short_rejected() {
        let mut cfg = MisterConfig::for_tests();
        cfg.mist_duration_sec = 30;
        assert_validation_err(&cfg, "MISTER_DURATION=30s is too short");
    }

    #[test]
    fn mist_duration_too_long_rejected() {
        let mut cfg = MisterConfig::for_tests();
        cfg.mist_duration_sec = 10_000;
        assert_validation_err(&cfg, "MISTER_DURATION=10000s is too long");
    }

    #[test]
    fn check_interval_too_short_rejected() {
        let mut cfg = MisterConfig::for_tests();
        cfg.check_interval_sec = 5;
        assert_validation_err(&cfg, "CHECK_INTERVAL=5s is too short");
    }

    #[test]
    fn cooldown_too_short_rejected() {
        let mut cfg = MisterConfig::for_tests();
        cfg.cooldown_sec = 10;
        assert_validation_err(&cfg, "COOLDOWN_SECONDS=10s is too short");
    }

    #[test]
    fn zero_valve_interval_rejected() {
        let mut cfg = MisterConfig::for_tests();
        cfg.min_valve_action_sec = 0;
        assert_validation_err(&cfg, "MIN_VALVE_ACTION_SECONDS must be positive");
    }

    #[test]
    fn zero_device_timeout_rejected() {
        let mut cfg = MisterConfig::for_tests();
        cfg.device_timeout_sec = 0;
        assert_validation_err(&cfg, "DEVICE_TIMEOUT_SECONDS must be positive");
    }

    // -- Multiple errors collected ----------------------------------------

    #[test]
    fn multiple_errors_collected() {
        let mut cfg = MisterConfig::for_tests();
        cfg.temp_high_f = 200.0;
        cfg.humidity_low_pct = -1.0;
        cfg.mist_duration_sec = 1;
        let err = cfg.validate().unwrap_err();
        let msg = format!("{err:#}");
        assert!(msg.contains("TEMP_HIGH"), "missing temp error in: {msg}");
        assert!(msg.contains("HUMIDITY_LOW"), "missing humidity error in: {msg}");
        assert!(msg.contains("MISTER_DURATION"), "missing duration error in: {msg}");
        assert!(msg.contains("3 errors"), "expected 3 errors in: {msg}");
    }

    // -- Duration accessors -----------------------------------------------

    #[test]
    fn duration_accessors_convert_seconds() {
        let cfg = MisterConfig::for_tests();
        assert_eq!(cfg.mist_duration(), Duration::from_secs(600));
        assert_eq!(cfg.check_interval(), Duration::from_secs(60));
        assert_eq!(cfg.cooldown(), Duration::from_secs(300));
        assert_eq!(cfg.min_valve_action_interval(), Duration::from_secs(30));
    }

    #[test]
    fn config_serializes_thresholds() {
        let cfg = MisterConfig::for_tests();
        let json = serde_json::to_value(&cfg).unwrap();
        assert_eq!(json["temp_high_f"], 95.0);
        assert_eq!(json["cooldown_sec"], 300);
        // state_file is an operational detail, not part of the status echo.
        assert!(json.get("state_file").is_none());
    }
}
