//! The control-loop state machine.
//!
//! One controller instance owns one background evaluation loop.  All
//! transitions (start/stop/pause/resume) and every persisted-state mutation
//! they trigger happen under a single `tokio::sync::Mutex`, so concurrent
//! control calls serialize and at most one loop task is ever alive.
//! `status()` never touches that mutex — it reads the shared snapshot.
//!
//! Safety gates applied before any valve command:
//! 1. Cooldown — a start within `cooldown` of the previous start is skipped.
//! 2. Valve-protection interval — any command within
//!    `min_valve_action_interval` of the previous command is skipped, except
//!    a stop of active misting, which always goes through.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::MisterConfig;
use crate::decision::{decide, MisterAction};
use crate::devices::{Reading, SensorSource, ValveActuator};
use crate::state::{ControllerStatus, SharedState, StatusResponse, SystemState};
use crate::store::{PersistedState, StateStore};

/// How long `stop()` waits for the loop task to wind down after signalling
/// it.  If the join times out the handle is kept so a later `start()` can
/// refuse to run two loops at once.
const LOOP_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Invalid state-transition requests.  Reported to the caller, never fatal.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ControlError {
    #[error("controller is already running")]
    AlreadyRunning,
    #[error("controller is not running")]
    NotRunning,
    #[error("controller is already paused")]
    AlreadyPaused,
    #[error("controller is not paused")]
    NotPaused,
    #[error("previous control loop has not fully stopped")]
    ThreadActive,
}

/// Runtime state guarded by the transition lock.
struct ControlInner {
    status: ControllerStatus,
    persisted: PersistedState,
    /// Most recent instant any valve command was issued (open or close).
    /// Runtime-only: drives the valve-protection interval, not cooldown.
    last_valve_action: Option<Instant>,
    loop_task: Option<JoinHandle<()>>,
    stop_tx: Option<watch::Sender<bool>>,
}

pub struct Controller {
    config: MisterConfig,
    store: StateStore,
    sensor: Arc<dyn SensorSource>,
    valve: Arc<dyn ValveActuator>,
    inner: Arc<Mutex<ControlInner>>,
    shared: SharedState,
}

/// Everything the evaluation loop needs, detached from the controller so
/// the spawned task does not hold a reference cycle.
#[derive(Clone)]
struct LoopCtx {
    config: MisterConfig,
    store: StateStore,
    sensor: Arc<dyn SensorSource>,
    valve: Arc<dyn ValveActuator>,
    inner: Arc<Mutex<ControlInner>>,
    shared: SharedState,
}

impl Controller {
    pub fn new(
        config: MisterConfig,
        store: StateStore,
        persisted: PersistedState,
        sensor: Arc<dyn SensorSource>,
        valve: Arc<dyn ValveActuator>,
    ) -> Self {
        let mut sys = SystemState::new(persisted.restart_count, persisted.crash_count);
        sys.misting_active = persisted.misting_active;
        sys.last_mister_start = persisted.last_start_time;

        Self {
            config,
            store,
            sensor,
            valve,
            inner: Arc::new(Mutex::new(ControlInner {
                status: ControllerStatus::Stopped,
                persisted,
                last_valve_action: None,
                loop_task: None,
                stop_tx: None,
            })),
            shared: Arc::new(RwLock::new(sys)),
        }
    }

    pub fn config(&self) -> &MisterConfig {
        &self.config
    }

    /// Start the evaluation loop, clearing any persisted pause.
    pub async fn start(&self) -> Result<(), ControlError> {
        let mut inner = self.inner.lock().await;
        self.start_locked(&mut inner, false).await
    }

    /// Process-startup variant of [`Controller::start`]: honors the
    /// persisted pause flag, so a deployment paused before a restart comes
    /// back paused (sensors polled, decisions suppressed).
    pub async fn start_on_boot(&self) -> Result<(), ControlError> {
        let mut inner = self.inner.lock().await;
        self.start_locked(&mut inner, true).await
    }

    async fn start_locked(
        &self,
        inner: &mut ControlInner,
        honor_saved_pause: bool,
    ) -> Result<(), ControlError> {
        if inner.status != ControllerStatus::Stopped {
            return Err(ControlError::AlreadyRunning);
        }
        if let Some(handle) = &inner.loop_task {
            if !handle.is_finished() {
                return Err(ControlError::ThreadActive);
            }
            inner.loop_task = None;
        }

        if !honor_saved_pause && inner.persisted.paused {
            inner.persisted.paused = false;
            self.persist(inner);
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        inner.loop_task = Some(tokio::spawn(run_loop(self.loop_ctx(), stop_rx)));
        inner.stop_tx = Some(stop_tx);
        inner.status = if inner.persisted.paused {
            ControllerStatus::Paused
        } else {
            ControllerStatus::Running
        };

        let status = inner.status;
        let mut st = self.shared.write().await;
        st.status = status;
        st.record_control(if status == ControllerStatus::Paused {
            "controller started (paused)"
        } else {
            "controller started"
        });
        info!(?status, "controller started");
        Ok(())
    }

    /// Stop the loop and close the valve unconditionally.  The valve close
    /// bypasses the valve-protection interval: stopping must never be
    /// blocked by a gate meant to protect the hardware.
    pub async fn stop(&self) -> Result<(), ControlError> {
        let mut inner = self.inner.lock().await;
        if inner.status == ControllerStatus::Stopped {
            return Err(ControlError::NotRunning);
        }

        if let Some(tx) = inner.stop_tx.take() {
            let _ = tx.send(true);
        }

        self.close_valve_best_effort(&mut inner).await;
        inner.status = ControllerStatus::Stopped;
        inner.persisted.misting_active = false;
        inner.persisted.last_stop_time = Some(Utc::now());
        self.persist(&mut inner);
        let handle = inner.loop_task.take();

        {
            let mut st = self.shared.write().await;
            st.status = ControllerStatus::Stopped;
            st.misting_active = false;
            st.record_control("controller stopped");
        }
        drop(inner);

        // Join outside the lock: the loop may be waiting on it to finish
        // its final cycle.
        if let Some(mut handle) = handle {
            match timeout(LOOP_JOIN_TIMEOUT, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "evaluation loop task failed"),
                Err(_) => {
                    warn!("evaluation loop did not stop in time; retaining handle");
                    let mut inner = self.inner.lock().await;
                    if inner.loop_task.is_none() {
                        inner.loop_task = Some(handle);
                    }
                }
            }
        }

        info!("controller stopped");
        Ok(())
    }

    /// Suspend decisions; the loop keeps polling sensors.
    pub async fn pause(&self) -> Result<(), ControlError> {
        let mut inner = self.inner.lock().await;
        match inner.status {
            ControllerStatus::Paused => Err(ControlError::AlreadyPaused),
            ControllerStatus::Stopped => Err(ControlError::NotRunning),
            ControllerStatus::Running => {
                inner.status = ControllerStatus::Paused;
                inner.persisted.paused = true;
                self.persist(&mut inner);

                let mut st = self.shared.write().await;
                st.status = ControllerStatus::Paused;
                st.record_control("controller paused");
                info!("controller paused");
                Ok(())
            }
        }
    }

    pub async fn resume(&self) -> Result<(), ControlError> {
        let mut inner = self.inner.lock().await;
        if inner.status != ControllerStatus::Paused {
            return Err(ControlError::NotPaused);
        }
        inner.status = ControllerStatus::Running;
        inner.persisted.paused = false;
        self.persist(&mut inner);

        let mut st = self.shared.write().await;
        st.status = ControllerStatus::Running;
        st.record_control("controller resumed");
        info!("controller resumed");
        Ok(())
    }

    /// Consistent snapshot for the control surface.  Never blocks on the
    /// transition lock or on device I/O.
    pub async fn status(&self) -> StatusResponse {
        self.shared.read().await.to_status(&self.config)
    }

    /// Terminal path for signals and fatal errors: stop the loop if one is
    /// running, close the valve once regardless, and persist the
    /// clean-shutdown marker.
    pub async fn shutdown(&self) {
        info!("shutting down");
        if self.stop().await.is_err() {
            // Not running — still close the valve; the hardware state may
            // predate this process.
            let mut inner = self.inner.lock().await;
            self.close_valve_best_effort(&mut inner).await;
        }

        let mut inner = self.inner.lock().await;
        self.store.mark_clean_shutdown(&mut inner.persisted);
        self.shared.write().await.record_system("shutdown complete");
    }

    async fn close_valve_best_effort(&self, inner: &mut ControlInner) {
        match timeout(
            self.config.device_timeout(),
            self.valve.set_valve(false, self.config.mist_duration()),
        )
        .await
        {
            Ok(Ok(())) => {
                inner.last_valve_action = Some(Instant::now());
                self.shared.write().await.record_valve(false);
            }
            Ok(Err(e)) => warn!(error = %e, "valve close failed during stop"),
            Err(_) => warn!("valve close timed out during stop"),
        }
    }

    fn persist(&self, inner: &mut ControlInner) {
        if let Err(e) = self.store.save(&inner.persisted) {
            warn!(error = %e, "failed to persist state; in-memory state remains authoritative");
        }
    }

    fn loop_ctx(&self) -> LoopCtx {
        LoopCtx {
            config: self.config.clone(),
            store: self.store.clone(),
            sensor: Arc::clone(&self.sensor),
            valve: Arc::clone(&self.valve),
            inner: Arc::clone(&self.inner),
            shared: Arc::clone(&self.shared),
        }
    }
}

// ---------------------------------------------------------------------------
// Evaluation loop
// ---------------------------------------------------------------------------

async fn run_loop(ctx: LoopCtx, mut stop_rx: watch::Receiver<bool>) {
    info!(
        interval_sec = ctx.config.check_interval_sec,
        "evaluation loop started"
    );

    let mut ticker = interval(ctx.config.check_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = stop_rx.changed() => break,
        }
        if *stop_rx.borrow() {
            break;
        }

        // Sensor read happens outside the transition lock and under a
        // timeout, so a hung collaborator cannot wedge stop()/shutdown.
        let reading = match timeout(ctx.config.device_timeout(), ctx.sensor.read()).await {
            Ok(Ok(reading)) => reading,
            Ok(Err(e)) => {
                warn!(error = %e, "sensor read failed, skipping this cycle");
                ctx.shared
                    .write()
                    .await
                    .record_error(format!("sensor read failed: {e}"));
                continue;
            }
            Err(_) => {
                warn!("sensor read timed out, skipping this cycle");
                ctx.shared
                    .write()
                    .await
                    .record_error("sensor read timed out".to_string());
                continue;
            }
        };

        debug!(
            temp_f = reading.temp_f,
            humidity_pct = reading.humidity_pct,
            "sensor reading"
        );
        ctx.shared.write().await.record_reading(reading);

        evaluate(&ctx, reading, &stop_rx).await;
    }

    info!("evaluation loop stopped");
}

/// One decision cycle: decide, gate, actuate.  Holds the transition lock so
/// control operations and persistence stay serialized with actuation.
async fn evaluate(ctx: &LoopCtx, reading: Reading, stop_rx: &watch::Receiver<bool>) {
    let mut inner = ctx.inner.lock().await;

    // stop() may have won the lock race while this cycle was reading.
    if *stop_rx.borrow() {
        return;
    }
    // Paused: sensors are polled, decisions are discarded.
    if inner.status != ControllerStatus::Running {
        return;
    }

    let elapsed = inner
        .persisted
        .last_start_time
        .and_then(|t| (Utc::now() - t).to_std().ok());

    match decide(&reading, &ctx.config, inner.persisted.misting_active, elapsed) {
        MisterAction::None => {}
        MisterAction::Start => apply_start(ctx, &mut inner, reading).await,
        MisterAction::Stop => apply_stop(ctx, &mut inner, reading).await,
    }
}

async fn apply_start(ctx: &LoopCtx, inner: &mut ControlInner, reading: Reading) {
    // Gate 1: cooldown since the previous cycle start.
    if let Some(last) = inner.persisted.last_start_time {
        let since = (Utc::now() - last).to_std().unwrap_or_default();
        if since < ctx.config.cooldown() {
            debug!(
                remaining_sec = (ctx.config.cooldown() - since).as_secs(),
                "start suppressed by cooldown"
            );
            return;
        }
    }

    // Gate 2: valve-protection interval.
    if !valve_gate_open(inner, &ctx.config) {
        debug!("start suppressed by valve-protection interval");
        return;
    }

    info!(
        temp_f = reading.temp_f,
        humidity_pct = reading.humidity_pct,
        duration_sec = ctx.config.mist_duration_sec,
        "starting mister"
    );

    match timeout(
        ctx.config.device_timeout(),
        ctx.valve.set_valve(true, ctx.config.mist_duration()),
    )
    .await
    {
        Ok(Ok(())) => {
            inner.last_valve_action = Some(Instant::now());
            inner.persisted.misting_active = true;
            inner.persisted.last_start_time = Some(Utc::now());
            persist_loop(ctx, inner);
            ctx.shared.write().await.record_valve(true);
        }
        Ok(Err(e)) => {
            // Hardware state unknown: do not flip misting_active on a guess.
            warn!(error = %e, "failed to start mister");
            ctx.shared
                .write()
                .await
                .record_error(format!("valve open failed: {e}"));
        }
        Err(_) => {
            warn!("valve open timed out");
            ctx.shared
                .write()
                .await
                .record_error("valve open timed out".to_string());
        }
    }
}

async fn apply_stop(ctx: &LoopCtx, inner: &mut ControlInner, reading: Reading) {
    // A stop of active misting overrides the valve-protection interval:
    // ending an active cycle must never be blocked.
    if !inner.persisted.misting_active && !valve_gate_open(inner, &ctx.config) {
        debug!("stop suppressed by valve-protection interval");
        return;
    }

    info!(
        temp_f = reading.temp_f,
        humidity_pct = reading.humidity_pct,
        "stopping mister"
    );

    match timeout(
        ctx.config.device_timeout(),
        ctx.valve.set_valve(false, ctx.config.mist_duration()),
    )
    .await
    {
        Ok(Ok(())) => {
            inner.last_valve_action = Some(Instant::now());
            inner.persisted.misting_active = false;
            inner.persisted.last_stop_time = Some(Utc::now());
            persist_loop(ctx, inner);
            ctx.shared.write().await.record_valve(false);
        }
        Ok(Err(e)) => {
            warn!(error = %e, "failed to stop mister");
            ctx.shared
                .write()
                .await
                .record_error(format!("valve close failed: {e}"));
        }
        Err(_) => {
            warn!("valve close timed out");
            ctx.shared
                .write()
                .await
                .record_error("valve close timed out".to_string());
        }
    }
}

fn valve_gate_open(inner: &ControlInner, config: &MisterConfig) -> bool {
    match inner.last_valve_action {
        Some(at) => at.elapsed() >= config.min_valve_action_interval(),
        None => true,
    }
}

fn persist_loop(ctx: &LoopCtx, inner: &mut ControlInner) {
    if let Err(e) = ctx.store.save(&inner.persisted) {
        warn!(error = %e, "failed to persist state; in-memory state remains authoritative");
    }
}

// ===========================================================================
// Tests
// ===========================================================================
