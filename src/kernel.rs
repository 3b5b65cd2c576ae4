//! The tick scheduler.
//!
//! A [`SimulationKernel`] drives a fixed-rate loop: each tick advances
//! simulated time by `tick_duration * time_warp_factor`, asks the position
//! provider where the satellite is, stamps the snapshot and hands it to the
//! [`Broadcaster`]. Deadlines are computed from the previous target rather
//! than from "now", so transient slow ticks do not shift the schedule.
//!
//! ```text
//!   Idle --start()--> Running --stop()--> Stopping --tick done--> Idle
//! ```
//!
//! The loop runs on its own task and owns the [`SatelliteState`]. `stop()`
//! only interrupts the inter-tick sleep; a tick in flight always finishes,
//! broadcast included, before the loop exits. The loop hands its state back
//! through the task's join handle so a later `start()` resumes from the
//! same simulated time.
//!
//! Nothing that happens inside a tick ends the loop. Provider and delivery
//! panics are caught where they happen; anything else is caught around the
//! whole tick and reported as a CRITICAL alert from [`KERNEL_SOURCE`].

use crate::broadcast::{panic_message, BroadcastReport, Broadcaster};
use crate::config::{FidelitySettings, KernelConfig};
use crate::propagator::PositionProvider;
use crate::state::{Alert, SatelliteState};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

pub const KERNEL_SOURCE: &str = "SimulationKernel";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KernelPhase {
    Idle,
    Running,
    Stopping,
}

impl KernelPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => KernelPhase::Running,
            2 => KernelPhase::Stopping,
            _ => KernelPhase::Idle,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            KernelPhase::Idle => 0,
            KernelPhase::Running => 1,
            KernelPhase::Stopping => 2,
        }
    }
}

/// Result of one step inside a tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Completed,
    Failed { source: String, reason: String },
}

/// Running counters describing loop health and scheduling drift.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TickStats {
    pub ticks: u64,
    pub lag_events: u64,
    pub provider_failures: u64,
    /// Ticks the kernel itself could not complete: simulated clock overflow
    /// or a panic outside the provider.
    pub kernel_failures: u64,
    pub broadcast_failures: u64,
    pub last_tick_micros: u64,
    /// How late the most recent tick started relative to its deadline.
    pub last_lateness_micros: u64,
    pub max_lateness_micros: u64,
    pub last_broadcast_delivered: usize,
    pub last_broadcast_evicted: usize,
}

/// Read-only view of the kernel's configuration and progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelStatus {
    pub phase: KernelPhase,
    pub tick_rate_hz: f64,
    pub tick_duration_ms: f64,
    pub time_warp_factor: f64,
    pub fidelity: FidelitySettings,
    pub sim_time: DateTime<Utc>,
    pub connected_clients: usize,
    pub stats: TickStats,
    /// Alerts raised by the most recent tick, including any raised after
    /// its snapshot went out.
    pub alerts: Vec<Alert>,
}

#[derive(Debug)]
struct Progress {
    sim_time: DateTime<Utc>,
    stats: TickStats,
    alerts: Vec<Alert>,
}

/// State shared between the kernel handle and its loop task. Only the loop
/// writes `progress`.
#[derive(Debug)]
struct KernelShared {
    phase: AtomicU8,
    progress: Mutex<Progress>,
}

impl KernelShared {
    fn progress(&self) -> MutexGuard<'_, Progress> {
        self.progress.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_phase(&self, phase: KernelPhase) {
        self.phase.store(phase.as_u8(), Ordering::SeqCst);
    }

    fn phase(&self) -> KernelPhase {
        KernelPhase::from_u8(self.phase.load(Ordering::SeqCst))
    }
}

enum Delivery {
    Sent(BroadcastReport),
    SerializeFailed,
    Skipped,
}

struct TickReport {
    kernel: StepOutcome,
    orbit: StepOutcome,
    delivery: Delivery,
}

/// Puts the phase back to `Idle` if the loop task unwinds, so status never
/// reports a dead loop as running.
struct PhaseReset(Arc<KernelShared>);

impl Drop for PhaseReset {
    fn drop(&mut self) {
        if std::thread::panicking() {
            error!("!!! Simulation loop terminated abnormally");
            self.0.set_phase(KernelPhase::Idle);
        }
    }
}

/// Everything the loop owns while running.
struct TickEngine {
    config: KernelConfig,
    provider: Arc<dyn PositionProvider>,
    broadcaster: Arc<Broadcaster>,
    shared: Arc<KernelShared>,
    state: SatelliteState,
    sim_time: DateTime<Utc>,
}

impl TickEngine {
    async fn run(mut self, mut cancel: watch::Receiver<bool>) -> Self {
        let _reset = PhaseReset(Arc::clone(&self.shared));
        let tick_duration = self.config.tick_duration();
        let mut deadline = Instant::now();

        loop {
            if is_cancelled(&cancel) {
                break;
            }

            let started = Instant::now();
            let lateness = started.saturating_duration_since(deadline);
            let outcome = AssertUnwindSafe(self.tick()).catch_unwind().await;
            let report = match outcome {
                Ok(report) => report,
                Err(payload) => self.abort_tick(&panic_message(payload.as_ref())),
            };
            self.record(&report, started.elapsed(), lateness);

            deadline += tick_duration;
            let now = Instant::now();
            if deadline >= now {
                tokio::select! {
                    _ = sleep_until(deadline) => {}
                    _ = cancel.changed() => break,
                }
            } else {
                warn!(
                    "!!! SIMULATION LAG: Tick took too long! {:?} behind schedule",
                    now - deadline
                );
                self.shared.progress().stats.lag_events += 1;
            }
        }

        self
    }

    async fn tick(&mut self) -> TickReport {
        self.state.begin_tick();

        // Simulated time never moves backwards; at the end of the calendar it stalls.
        let kernel = match self.sim_time.checked_add_signed(self.config.sim_step()) {
            Some(next) => {
                self.sim_time = next;
                StepOutcome::Completed
            }
            None => {
                let reason = format!("Simulated time cannot advance past {}", self.sim_time);
                error!("!!! {} step failed: {}", KERNEL_SOURCE, reason);
                self.state.push_alert(Alert::critical(KERNEL_SOURCE, reason.clone()));
                StepOutcome::Failed {
                    source: KERNEL_SOURCE.to_owned(),
                    reason,
                }
            }
        };

        let orbit = self.step_orbit();
        if let StepOutcome::Failed { source, reason } = &orbit {
            error!("!!! {} step failed: {}", source, reason);
            self.state.push_alert(Alert::critical(source, reason.clone()));
        }

        self.state.timestamp = self.sim_time;

        let delivery = match self.broadcaster.broadcast(&self.state).await {
            Ok(report) => Delivery::Sent(report),
            Err(e) => {
                // Observers never see this alert; it surfaces through status().
                error!("!!! Simulation Tick Failed: {}", e);
                self.state
                    .push_alert(Alert::critical(KERNEL_SOURCE, format!("Tick failed: {}", e)));
                Delivery::SerializeFailed
            }
        };

        TickReport {
            kernel,
            orbit,
            delivery,
        }
    }

    fn abort_tick(&mut self, message: &str) -> TickReport {
        let reason = format!("Tick panicked: {}", message);
        error!("!!! Simulation Tick Failed: {}", reason);
        self.state.push_alert(Alert::critical(KERNEL_SOURCE, reason.clone()));
        TickReport {
            kernel: StepOutcome::Failed {
                source: KERNEL_SOURCE.to_owned(),
                reason,
            },
            orbit: StepOutcome::Completed,
            delivery: Delivery::Skipped,
        }
    }

    fn step_orbit(&mut self) -> StepOutcome {
        let provider = Arc::clone(&self.provider);
        let at = self.sim_time;

        match panic::catch_unwind(AssertUnwindSafe(|| provider.evaluate(at))) {
            Ok(Ok(vector)) => {
                self.state.set_orbit(vector.position, vector.velocity);
                StepOutcome::Completed
            }
            Ok(Err(e)) => StepOutcome::Failed {
                source: provider.name().to_owned(),
                reason: format!("Position update failed: {}", e),
            },
            Err(payload) => StepOutcome::Failed {
                source: provider.name().to_owned(),
                reason: format!("Position provider panicked: {}", panic_message(payload.as_ref())),
            },
        }
    }

    fn record(&self, report: &TickReport, elapsed: Duration, lateness: Duration) {
        let mut progress = self.shared.progress();
        progress.sim_time = self.sim_time;
        progress.alerts.clone_from(&self.state.alerts);

        let stats = &mut progress.stats;
        stats.ticks += 1;
        stats.last_tick_micros = elapsed.as_micros() as u64;
        stats.last_lateness_micros = lateness.as_micros() as u64;
        stats.max_lateness_micros = stats.max_lateness_micros.max(stats.last_lateness_micros);
        if matches!(report.kernel, StepOutcome::Failed { .. }) {
            stats.kernel_failures += 1;
        }
        if matches!(report.orbit, StepOutcome::Failed { .. }) {
            stats.provider_failures += 1;
        }
        match &report.delivery {
            Delivery::Sent(broadcast) => {
                stats.last_broadcast_delivered = broadcast.delivered;
                stats.last_broadcast_evicted = broadcast.evicted.len();
            }
            Delivery::SerializeFailed => stats.broadcast_failures += 1,
            Delivery::Skipped => {}
        }
    }
}

fn is_cancelled(cancel: &watch::Receiver<bool>) -> bool {
    // A dropped sender means the owning kernel is gone.
    *cancel.borrow() || cancel.has_changed().is_err()
}

struct RunHandle {
    cancel: watch::Sender<bool>,
    task: JoinHandle<TickEngine>,
}

#[derive(Default)]
struct Control {
    engine: Option<TickEngine>,
    run: Option<RunHandle>,
}

pub struct SimulationKernel {
    config: KernelConfig,
    provider: Arc<dyn PositionProvider>,
    broadcaster: Arc<Broadcaster>,
    shared: Arc<KernelShared>,
    control: tokio::sync::Mutex<Control>,
}

impl SimulationKernel {
    pub fn new(
        config: KernelConfig,
        provider: Arc<dyn PositionProvider>,
        broadcaster: Arc<Broadcaster>,
    ) -> Self {
        let sim_time = config.start_time().unwrap_or_else(Utc::now);
        let shared = Arc::new(KernelShared {
            phase: AtomicU8::new(KernelPhase::Idle.as_u8()),
            progress: Mutex::new(Progress {
                sim_time,
                stats: TickStats::default(),
                alerts: Vec::new(),
            }),
        });

        info!(
            "SimulationKernel initialized. Tick duration: {:.3}s",
            config.tick_duration().as_secs_f64()
        );
        info!("Time Warp Factor: {}x", config.time_warp_factor());

        let mut kernel = Self {
            config,
            provider,
            broadcaster,
            shared,
            control: tokio::sync::Mutex::new(Control::default()),
        };
        let engine = kernel.build_engine(sim_time);
        kernel.control.get_mut().engine = Some(engine);
        kernel
    }

    fn build_engine(&self, sim_time: DateTime<Utc>) -> TickEngine {
        TickEngine {
            config: self.config.clone(),
            provider: Arc::clone(&self.provider),
            broadcaster: Arc::clone(&self.broadcaster),
            shared: Arc::clone(&self.shared),
            state: SatelliteState::new(sim_time),
            sim_time,
        }
    }

    /// Begin ticking from a fresh schedule baseline. No-op when running.
    pub async fn start(&self) {
        let mut control = self.control.lock().await;
        if let Some(run) = &control.run {
            if !run.task.is_finished() {
                debug!("Simulation already running");
                return;
            }
        }
        // A loop that died on its own still has to be reaped before restarting.
        if let Some(run) = control.run.take() {
            match run.task.await {
                Ok(engine) => control.engine = Some(engine),
                Err(e) => warn!("Previous simulation task ended abnormally: {}", e),
            }
        }

        info!("Starting simulation...");
        let engine = match control.engine.take() {
            Some(engine) => engine,
            None => self.build_engine(self.sim_time()),
        };
        let (cancel, cancel_rx) = watch::channel(false);
        self.shared.set_phase(KernelPhase::Running);
        let task = tokio::spawn(engine.run(cancel_rx));
        control.run = Some(RunHandle { cancel, task });
    }

    /// Cancel the loop and wait for the in-flight tick to finish. No-op when idle.
    pub async fn stop(&self) {
        let mut control = self.control.lock().await;
        let Some(run) = control.run.take() else {
            return;
        };

        info!("Stopping simulation...");
        self.shared.set_phase(KernelPhase::Stopping);
        // The receiver lives as long as the task; a send error means it already exited.
        let _ = run.cancel.send(true);

        match run.task.await {
            Ok(engine) => {
                control.engine = Some(engine);
                debug!("Simulation stopped cleanly");
            }
            Err(e) => error!("Simulation task ended abnormally: {}", e),
        }
        self.shared.set_phase(KernelPhase::Idle);
    }

    pub fn phase(&self) -> KernelPhase {
        self.shared.phase()
    }

    pub fn is_running(&self) -> bool {
        self.phase() == KernelPhase::Running
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// Simulated time of the most recent tick (or the baseline before any).
    pub fn sim_time(&self) -> DateTime<Utc> {
        self.shared.progress().sim_time
    }

    pub fn stats(&self) -> TickStats {
        self.shared.progress().stats
    }

    pub fn status(&self) -> KernelStatus {
        let (sim_time, stats, alerts) = {
            let progress = self.shared.progress();
            (progress.sim_time, progress.stats, progress.alerts.clone())
        };
        KernelStatus {
            phase: self.phase(),
            tick_rate_hz: self.config.tick_rate_hz(),
            tick_duration_ms: self.config.tick_duration().as_secs_f64() * 1000.0,
            time_warp_factor: self.config.time_warp_factor(),
            fidelity: self.config.fidelity(),
            sim_time,
            connected_clients: self.broadcaster.registry().len(),
            stats,
            alerts,
        }
    }
}

impl std::fmt::Debug for SimulationKernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulationKernel")
            .field("config", &self.config)
            .field("phase", &self.phase())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::propagator::{ProviderError, StateVector};
    use crate::registry::ConnectionRegistry;

    struct PanickingProvider;

    impl PositionProvider for PanickingProvider {
        fn name(&self) -> &str {
            "PanickingProvider"
        }

        fn evaluate(&self, _at: DateTime<Utc>) -> Result<StateVector, ProviderError> {
            panic!("ephemeris table corrupted");
        }
    }

    fn engine_with(provider: Arc<dyn PositionProvider>) -> TickEngine {
        let config = KernelConfig::new(10.0, 1.0).unwrap();
        let broadcaster = Arc::new(Broadcaster::new(
            Arc::new(ConnectionRegistry::new()),
            Duration::from_secs(1),
        ));
        let kernel = SimulationKernel::new(config, provider, broadcaster);
        kernel.build_engine(Utc::now())
    }

    #[test]
    fn test_panicking_provider_is_contained() {
        let mut engine = engine_with(Arc::new(PanickingProvider));
        engine.state.set_orbit([1.0, 2.0, 3.0], [4.0, 5.0, 6.0]);

        match engine.step_orbit() {
            StepOutcome::Failed { source, reason } => {
                assert_eq!(source, "PanickingProvider");
                assert!(reason.contains("ephemeris table corrupted"));
            }
            StepOutcome::Completed => panic!("expected failure"),
        }
        // Stale vectors are kept.
        assert_eq!(engine.state.orbit.position, [1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_phase_round_trip() {
        for phase in [KernelPhase::Idle, KernelPhase::Running, KernelPhase::Stopping] {
            assert_eq!(KernelPhase::from_u8(phase.as_u8()), phase);
        }
    }
}
