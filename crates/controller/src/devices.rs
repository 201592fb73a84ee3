//! Sensor and valve collaborator seams.
//!
//! The controller only ever sees these two traits.  Vendor API clients
//! (authentication, retries, unit conversion, device addressing) live behind
//! them and are out of scope here; the shipped implementations are
//! development simulators so the binary runs without hardware.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tracing::info;

/// One temperature/humidity sample.  Units are the collaborator's problem;
/// the controller always sees Fahrenheit and percent.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Reading {
    pub temp_f: f64,
    pub humidity_pct: f64,
}

/// Recoverable collaborator failure.  The loop skips the affected cycle and
/// leaves the valve untouched; retry policy belongs to the collaborator.
#[derive(Debug, Error)]
pub enum TransientError {
    #[error("device call timed out")]
    Timeout,
    #[error("device unavailable: {0}")]
    Unavailable(String),
    #[error("malformed device response: {0}")]
    Protocol(String),
}

/// Source of temperature/humidity readings.
#[async_trait]
pub trait SensorSource: Send + Sync {
    async fn read(&self) -> Result<Reading, TransientError>;
}

/// The physical misting valve.
#[async_trait]
pub trait ValveActuator: Send + Sync {
    /// Command the valve open or closed.  `max_duration` is the hardware
    /// fail-safe: an opened valve closes itself after this long even if the
    /// controller never issues a stop.
    async fn set_valve(&self, open: bool, max_duration: Duration) -> Result<(), TransientError>;
}

// ---------------------------------------------------------------------------
// Development simulators
// ---------------------------------------------------------------------------

/// Mean-reverting random-walk simulator for local development.
///
/// Temperature drifts around a configurable center with per-reading noise;
/// humidity walks inversely (hot afternoons are dry ones).  Not a climate
/// model, just enough temporal coherence to exercise the hysteresis bands.
pub struct SimSensor {
    state: Mutex<SimState>,
}

struct SimState {
    temp_f: f64,
    humidity_pct: f64,
    temp_center: f64,
    humidity_center: f64,
}

impl SimSensor {
    pub fn new(temp_center: f64, humidity_center: f64) -> Self {
        Self {
            state: Mutex::new(SimState {
                temp_f: temp_center,
                humidity_pct: humidity_center,
                temp_center,
                humidity_center,
            }),
        }
    }

    /// Centered near the default start thresholds so a dev run actually
    /// crosses them now and then.
    pub fn from_env() -> Self {
        let temp = std::env::var("SIM_TEMP_CENTER")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(94.0);
        let humidity = std::env::var("SIM_HUMIDITY_CENTER")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(36.0);
        Self::new(temp, humidity)
    }
}

#[async_trait]
impl SensorSource for SimSensor {
    async fn read(&self) -> Result<Reading, TransientError> {
        let mut st = self.state.lock().expect("sim sensor lock");

        // Random walk with mean reversion, then clamp to physical ranges.
        let temp_step = (fastrand::f64() - 0.5) * 2.0;
        let humidity_step = (fastrand::f64() - 0.5) * 3.0;
        st.temp_f += temp_step + (st.temp_center - st.temp_f) * 0.1;
        st.humidity_pct += humidity_step + (st.humidity_center - st.humidity_pct) * 0.1;
        st.humidity_pct = st.humidity_pct.clamp(0.0, 100.0);

        Ok(Reading {
            temp_f: st.temp_f,
            humidity_pct: st.humidity_pct,
        })
    }
}

/// Valve simulator: tracks open state and logs every command.
pub struct SimValve {
    open: Mutex<bool>,
}

impl SimValve {
    pub fn new() -> Self {
        Self {
            open: Mutex::new(false),
        }
    }
}

impl Default for SimValve {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ValveActuator for SimValve {
    async fn set_valve(&self, open: bool, max_duration: Duration) -> Result<(), TransientError> {
        let mut state = self.open.lock().expect("sim valve lock");
        *state = open;
        info!(
            open,
            max_duration_sec = max_duration.as_secs(),
            "[sim-valve] valve command"
        );
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
