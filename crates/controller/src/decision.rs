//! Hysteresis-based misting decision logic.
//!
//! Pure functions only — no clocks, no I/O.  The caller supplies the current
//! reading, the configured thresholds, whether misting is active, and how
//! long the current cycle has been running.
//!
//! Start requires BOTH conditions (hot AND dry) so a single noisy sensor
//! cannot trigger a spurious cycle.  Stop requires only ONE condition
//! (cooled, humid enough, or the duration cap) so an active cycle can never
//! be prolonged by waiting for two signals to agree.

use std::time::Duration;

use crate::config::MisterConfig;
use crate::devices::Reading;

/// Outcome of evaluating one sensor reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MisterAction {
    None,
    Start,
    Stop,
}

/// Decide what to do with the valve given the current reading.
///
/// `elapsed_since_start` is the time since the current misting cycle began,
/// or `None` if no start time is known — in that case only the temperature
/// and humidity conditions can stop an active cycle.
pub fn decide(
    reading: &Reading,
    config: &MisterConfig,
    misting_active: bool,
    elapsed_since_start: Option<Duration>,
) -> MisterAction {
    if misting_active {
        if should_stop(reading, config, elapsed_since_start) {
            MisterAction::Stop
        } else {
            MisterAction::None
        }
    } else if should_start(reading, config) {
        MisterAction::Start
    } else {
        MisterAction::None
    }
}

/// Start iff the shed is too hot AND too dry (strict comparisons).
fn should_start(reading: &Reading, config: &MisterConfig) -> bool {
    let too_hot = reading.temp_f > config.temp_high_f;
    let too_dry = reading.humidity_pct < config.humidity_low_pct;
    too_hot && too_dry
}

/// Stop iff cooled down OR humid enough OR the duration cap is reached.
fn should_stop(
    reading: &Reading,
    config: &MisterConfig,
    elapsed_since_start: Option<Duration>,
) -> bool {
    let cool_enough = reading.temp_f < config.temp_low_f;
    let humid_enough = reading.humidity_pct > config.humidity_high_pct;
    let duration_reached = elapsed_since_start
        .map(|e| e >= config.mist_duration())
        .unwrap_or(false);

    cool_enough || humid_enough || duration_reached
}

// ===========================================================================
// Tests
// ===========================================================================
