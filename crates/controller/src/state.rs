//! Shared status snapshot for the control surface.
//!
//! The evaluation loop and the control operations write small updates here;
//! `status()` reads it without ever touching the controller's transition
//! lock, so a slow sensor or valve call cannot block a status query.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

use crate::config::MisterConfig;
use crate::devices::Reading;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

pub type SharedState = Arc<RwLock<SystemState>>;

/// Lifecycle of the evaluation loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ControllerStatus {
    Stopped,
    Running,
    Paused,
}

pub struct SystemState {
    pub started_at: Instant,
    pub status: ControllerStatus,
    pub misting_active: bool,
    pub last_reading: Option<ReadingSnapshot>,
    pub last_mister_start: Option<DateTime<Utc>>,
    pub restart_count: u32,
    pub crash_count: u32,
    pub events: VecDeque<SystemEvent>,
}

#[derive(Clone, Copy, Serialize)]
pub struct ReadingSnapshot {
    pub temp_f: f64,
    pub humidity_pct: f64,
    pub at: DateTime<Utc>,
}

#[derive(Clone, Serialize)]
pub struct SystemEvent {
    pub ts: DateTime<Utc>,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Clone, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Reading,
    Valve,
    Control,
    Error,
    System,
}

/// What `/api/status` returns.
#[derive(Serialize)]
pub struct StatusResponse {
    pub status: ControllerStatus,
    pub misting_active: bool,
    pub current_temp_f: Option<f64>,
    pub current_humidity_pct: Option<f64>,
    pub last_reading_time: Option<DateTime<Utc>>,
    pub last_mister_start: Option<DateTime<Utc>>,
    pub uptime_secs: u64,
    pub restart_count: u32,
    pub crash_count: u32,
    pub config: MisterConfig,
    pub events: Vec<SystemEvent>,
}

impl SystemState {
    pub fn new(restart_count: u32, crash_count: u32) -> Self {
        Self {
            started_at: Instant::now(),
            status: ControllerStatus::Stopped,
            misting_active: false,
            last_reading: None,
            last_mister_start: None,
            restart_count,
            crash_count,
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    /// Record a successful sensor reading.
    pub fn record_reading(&mut self, reading: Reading) {
        self.last_reading = Some(ReadingSnapshot {
            temp_f: reading.temp_f,
            humidity_pct: reading.humidity_pct,
            at: Utc::now(),
        });
        self.push_event(
            EventKind::Reading,
            format!(
                "{:.1}°F / {:.0}%",
                reading.temp_f, reading.humidity_pct
            ),
        );
    }

    /// Record a valve command that was actually issued.
    pub fn record_valve(&mut self, open: bool) {
        self.misting_active = open;
        if open {
            self.last_mister_start = Some(Utc::now());
        }
        self.push_event(
            EventKind::Valve,
            format!("valve {}", if open { "opened" } else { "closed" }),
        );
    }

    /// Record a control-surface transition (start/stop/pause/resume).
    pub fn record_control(&mut self, detail: impl Into<String>) {
        self.push_event(EventKind::Control, detail.into());
    }

    pub fn record_error(&mut self, detail: impl Into<String>) {
        self.push_event(EventKind::Error, detail.into());
    }

    pub fn record_system(&mut self, detail: impl Into<String>) {
        self.push_event(EventKind::System, detail.into());
    }

    /// Build the JSON-serialisable status snapshot, newest events first.
    pub fn to_status(&self, config: &MisterConfig) -> StatusResponse {
        StatusResponse {
            status: self.status,
            misting_active: self.misting_active,
            current_temp_f: self.last_reading.map(|r| r.temp_f),
            current_humidity_pct: self.last_reading.map(|r| r.humidity_pct),
            last_reading_time: self.last_reading.map(|r| r.at),
            last_mister_start: self.last_mister_start,
            uptime_secs: self.started_at.elapsed().as_secs(),
            restart_count: self.restart_count,
            crash_count: self.crash_count,
            config: config.clone(),
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent {
            ts: Utc::now(),
            kind,
            detail,
        });
    }
}

// ===========================================================================
// Tests
// ===========================================================================
