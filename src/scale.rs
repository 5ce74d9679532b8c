//! Scale-to-zero state machine for web services
//!
//! ```text
//! RUNNING -> SCALING_DOWN -> SLEEPING -> WAKING -> RUNNING
//!     \________ crashlooped (any state) ________> SUSPENDED
//! ```
//!
//! A periodic scan scales idle opted-in services to zero through the status
//! store. A request for a sleeping service starts one wake per service; every
//! request that arrives meanwhile waits on the same outcome, bounded by the
//! wake timeout. Suspended services are only released by the orchestrator
//! clearing the crash-loop flag, never by traffic.

use crate::config::ScaleToZeroConfig;
use crate::routing::{RoutingTable, ServiceInfo, ServiceKey};
use crate::status::{ScaleState, ScaleUpdate, StatusError, StatusStore};
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScalePhase {
    Running,
    ScalingDown,
    Sleeping,
    Waking,
    /// Crash-looping; traffic cannot wake it
    Suspended,
}

#[derive(Debug, thiserror::Error)]
pub enum WakeError {
    #[error("service {0} is suspended")]
    Suspended(ServiceKey),

    #[error("service {key} was not ready within {timeout:?}")]
    Timeout { key: ServiceKey, timeout: Duration },

    #[error("failed to wake {key}: {reason}")]
    Failed { key: ServiceKey, reason: String },
}

#[derive(Debug, Clone)]
enum WakeOutcome {
    Ready,
    Suspended,
    TimedOut,
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct ScaleSettings {
    pub enabled: bool,
    pub idle_threshold: Duration,
    pub scan_interval: Duration,
    pub wake_timeout: Duration,
    pub ready_poll_interval: Duration,
}

impl From<&ScaleToZeroConfig> for ScaleSettings {
    fn from(config: &ScaleToZeroConfig) -> Self {
        Self {
            enabled: config.enabled,
            idle_threshold: config.idle_threshold(),
            scan_interval: config.scan_interval(),
            wake_timeout: config.wake_timeout(),
            ready_poll_interval: config.ready_poll_interval(),
        }
    }
}

struct Tracked {
    phase: ScalePhase,
    last_activity: Instant,
    /// False until the phase has been reconciled with the status store
    synced: bool,
    wake_tx: Option<broadcast::Sender<WakeOutcome>>,
}

struct ServiceScale {
    state: Mutex<Tracked>,
    /// Serialises store writes that change replica counts
    transition: tokio::sync::Mutex<()>,
}

impl ServiceScale {
    fn new() -> Self {
        Self {
            state: Mutex::new(Tracked {
                // Unknown services wake through the store, which confirms readiness first
                phase: ScalePhase::Sleeping,
                last_activity: Instant::now(),
                synced: false,
                wake_tx: None,
            }),
            transition: tokio::sync::Mutex::new(()),
        }
    }
}

/// Outcome of one idle scan
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScanReport {
    pub checked: usize,
    pub scaled_down: usize,
    pub suspended: usize,
}

pub struct ScaleController {
    services: DashMap<ServiceKey, Arc<ServiceScale>>,
    store: Arc<dyn StatusStore>,
    routing: Arc<RoutingTable>,
    settings: ScaleSettings,
}

impl ScaleController {
    pub fn new(settings: ScaleSettings, store: Arc<dyn StatusStore>, routing: Arc<RoutingTable>) -> Arc<Self> {
        Arc::new(Self {
            services: DashMap::new(),
            store,
            routing,
            settings,
        })
    }

    pub fn settings(&self) -> &ScaleSettings {
        &self.settings
    }

    fn entry(&self, key: &ServiceKey) -> Arc<ServiceScale> {
        Arc::clone(
            self.services
                .entry(key.clone())
                .or_insert_with(|| Arc::new(ServiceScale::new()))
                .value(),
        )
    }

    pub fn phase(&self, key: &ServiceKey) -> Option<ScalePhase> {
        self.services.get(key).map(|s| s.state.lock().phase)
    }

    /// Phases of every tracked service, sorted by key
    pub fn phases(&self) -> Vec<(ServiceKey, ScalePhase)> {
        let mut phases: Vec<_> = self
            .services
            .iter()
            .map(|e| (e.key().clone(), e.value().state.lock().phase))
            .collect();
        phases.sort_by(|a, b| a.0.cmp(&b.0));
        phases
    }

    /// Record a request for `service` and make sure it has a ready backend.
    ///
    /// Returns immediately for running services and for services that have
    /// not opted in.
    pub async fn ensure_awake(self: &Arc<Self>, service: &ServiceInfo) -> Result<(), WakeError> {
        if !self.settings.enabled || !service.scale_to_zero {
            return Ok(());
        }

        let key = service.key();
        let entry = self.entry(&key);

        let mut wake_rx = {
            let mut state = entry.state.lock();
            state.last_activity = Instant::now();

            match state.phase {
                ScalePhase::Running => return Ok(()),
                ScalePhase::Suspended => return Err(WakeError::Suspended(key)),
                ScalePhase::Waking => match &state.wake_tx {
                    Some(tx) => tx.subscribe(),
                    None => return Ok(()),
                },
                ScalePhase::Sleeping | ScalePhase::ScalingDown => {
                    let (tx, rx) = broadcast::channel(1);
                    state.phase = ScalePhase::Waking;
                    state.wake_tx = Some(tx);
                    info!(service = %key, "Waking service");

                    let controller = Arc::clone(self);
                    let entry = Arc::clone(&entry);
                    let key = key.clone();
                    tokio::spawn(async move { controller.wake(key, entry).await });
                    rx
                }
            }
        };

        let timeout = self.settings.wake_timeout;
        match tokio::time::timeout(timeout, wake_rx.recv()).await {
            Ok(Ok(WakeOutcome::Ready)) => Ok(()),
            Ok(Ok(WakeOutcome::Suspended)) => Err(WakeError::Suspended(key)),
            Ok(Ok(WakeOutcome::Failed(reason))) => Err(WakeError::Failed { key, reason }),
            Ok(Ok(WakeOutcome::TimedOut)) | Ok(Err(_)) | Err(_) => Err(WakeError::Timeout { key, timeout }),
        }
    }

    /// Drive one wake to completion and tell every waiter the result
    async fn wake(self: Arc<Self>, key: ServiceKey, entry: Arc<ServiceScale>) {
        let _transition = entry.transition.lock().await;
        let started = Instant::now();

        let outcome = match self.perform_wake(&key).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(service = %key, error = %e, "Status store error while waking");
                WakeOutcome::Failed(e.to_string())
            }
        };

        let mut state = entry.state.lock();
        state.synced = true;
        state.phase = match outcome {
            WakeOutcome::Ready => {
                info!(service = %key, elapsed_ms = started.elapsed().as_millis() as u64, "Service awake");
                state.last_activity = Instant::now();
                ScalePhase::Running
            }
            WakeOutcome::Suspended => {
                warn!(service = %key, "Service is crash-looping, not waking");
                ScalePhase::Suspended
            }
            WakeOutcome::TimedOut | WakeOutcome::Failed(_) => {
                warn!(service = %key, "Service did not become ready");
                ScalePhase::Sleeping
            }
        };
        if let Some(tx) = state.wake_tx.take() {
            let _ = tx.send(outcome);
        }
    }

    async fn perform_wake(&self, key: &ServiceKey) -> Result<WakeOutcome, StatusError> {
        let current = self.store.get(key).await?;
        if current.crashlooped {
            return Ok(WakeOutcome::Suspended);
        }
        if is_ready(&current) {
            return Ok(WakeOutcome::Ready);
        }

        self.store.update(key, ScaleUpdate::wake(Utc::now())).await?;

        let deadline = Instant::now() + self.settings.wake_timeout;
        loop {
            let state = self.store.get(key).await?;
            if state.crashlooped {
                return Ok(WakeOutcome::Suspended);
            }
            if state.ready_replicas >= 1 {
                return Ok(WakeOutcome::Ready);
            }
            if Instant::now() >= deadline {
                return Ok(WakeOutcome::TimedOut);
            }
            tokio::time::sleep(self.settings.ready_poll_interval).await;
        }
    }

    /// Reconcile with the status store and scale idle services to zero
    pub async fn scan_once(&self) -> ScanReport {
        let mut report = ScanReport::default();
        let services: Vec<Arc<ServiceInfo>> = self
            .routing
            .services()
            .into_iter()
            .filter(|s| s.scale_to_zero)
            .collect();

        // Forget services that left the table or opted out
        self.services
            .retain(|key, _| services.iter().any(|s| s.namespace == key.namespace && s.name == key.name));

        let mut idle = Vec::new();
        for service in &services {
            report.checked += 1;
            let key = service.key();
            let entry = self.entry(&key);

            let remote = match self.store.get(&key).await {
                Ok(remote) => remote,
                Err(e) => {
                    warn!(service = %key, error = %e, "Status store read failed");
                    continue;
                }
            };

            let publish_activity = {
                let mut state = entry.state.lock();
                if reconcile(&key, &mut state, &remote) {
                    report.suspended += 1;
                }

                let idle_for = state.last_activity.elapsed();
                if state.phase == ScalePhase::Running && idle_for >= self.settings.idle_threshold {
                    info!(service = %key, idle_secs = idle_for.as_secs(), "Service idle, scaling to zero");
                    state.phase = ScalePhase::ScalingDown;
                    idle.push((key.clone(), Arc::clone(&entry)));
                    None
                } else if state.phase == ScalePhase::Running {
                    Some(Utc::now() - chrono::Duration::from_std(idle_for).unwrap_or_else(|_| chrono::Duration::zero()))
                } else {
                    None
                }
            };

            if let Some(at) = publish_activity {
                if let Err(e) = self.store.update(&key, ScaleUpdate::activity(at)).await {
                    debug!(service = %key, error = %e, "Failed to publish activity");
                }
            }
        }

        for (key, entry) in idle {
            if self.scale_down(&key, &entry).await {
                report.scaled_down += 1;
            }
        }

        report
    }

    async fn scale_down(&self, key: &ServiceKey, entry: &ServiceScale) -> bool {
        let _transition = entry.transition.lock().await;
        if entry.state.lock().phase != ScalePhase::ScalingDown {
            // A request arrived first
            return false;
        }

        let result = self.store.update(key, ScaleUpdate::scale_to_zero()).await;

        let mut state = entry.state.lock();
        match result {
            Ok(_) => {
                if state.phase == ScalePhase::ScalingDown {
                    state.phase = ScalePhase::Sleeping;
                }
                info!(service = %key, "Service scaled to zero");
                true
            }
            Err(e) => {
                warn!(service = %key, error = %e, "Failed to scale service down");
                if state.phase == ScalePhase::ScalingDown {
                    state.phase = ScalePhase::Running;
                }
                false
            }
        }
    }

    /// Periodic idle scan until shutdown
    pub async fn run_scanner(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            idle_threshold_secs = self.settings.idle_threshold.as_secs(),
            scan_interval_secs = self.settings.scan_interval.as_secs(),
            "Scale-to-zero scanner started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.settings.scan_interval) => {
                    let report = self.scan_once().await;
                    if report.scaled_down > 0 || report.suspended > 0 {
                        debug!(?report, "Scale-to-zero scan");
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Scale-to-zero scanner shutting down");
                        break;
                    }
                }
            }
        }
    }
}

fn is_ready(state: &ScaleState) -> bool {
    !state.sleeping && state.ready_replicas >= 1
}

/// Fold the store's view into the local phase; true when newly suspended
fn reconcile(key: &ServiceKey, state: &mut Tracked, remote: &ScaleState) -> bool {
    if remote.crashlooped {
        let newly = state.phase != ScalePhase::Suspended;
        if newly {
            warn!(service = %key, "Service flagged crash-looping, suspending scale-to-zero");
        }
        state.phase = ScalePhase::Suspended;
        state.synced = true;
        return newly;
    }

    match state.phase {
        ScalePhase::Suspended => {
            info!(service = %key, "Crash-loop flag cleared");
            state.phase = if remote.sleeping { ScalePhase::Sleeping } else { ScalePhase::Running };
            state.last_activity = Instant::now();
        }
        ScalePhase::Sleeping if !state.synced && is_ready(remote) => {
            state.phase = ScalePhase::Running;
        }
        ScalePhase::Running if remote.sleeping => {
            // Scaled down by someone else
            state.phase = ScalePhase::Sleeping;
        }
        _ => {}
    }
    state.synced = true;
    false
}
