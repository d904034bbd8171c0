//! Container lifecycle event detection.
//!
//! One background loop per detector follows the engine event stream
//! (filtered to `die` and `oom`) and turns it into per-machine stop events:
//!
//! - `oom` records a marker for the container and publishes nothing
//! - `die` publishes [`LifecycleEventKind::Oom`] when a marker younger than
//!   [`OOM_MARKER_EXPIRY`] exists for the container, and
//!   [`LifecycleEventKind::Die`] otherwise
//!
//! Only containers registered through [`LifecycleDetector::start_detection`]
//! produce events. The loop reconnects from the last processed event time on
//! any stream failure, skips events the reconnect replays, and only stops
//! when its cancellation token fires.

use crate::engine::{ContainerEngine, EngineError, Event, EventsParams};
use crate::metrics::ProvisionerMetricsStorage;
use berth_shared::constants::events;
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// How long an OOM signal may precede the matching `die`.
pub const OOM_MARKER_EXPIRY: Duration = Duration::from_secs(10);

/// Delay before reconnecting after a stream error or end of stream.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

const EVENT_CHANNEL_CAPACITY: usize = 256;

// ============================================================================
// Events
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleEventKind {
    /// Main process exited.
    Die,
    /// Main process was killed for exceeding its memory limit.
    Oom,
}

/// A tracked machine's container stopped.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineLifecycleEvent {
    pub container_id: String,
    pub machine_id: String,
    pub workspace_id: String,
    pub kind: LifecycleEventKind,
    /// Engine event time, unix milliseconds.
    pub time_ms: i64,
}

/// Notified synchronously from the detection loop when a machine stops.
pub trait MachineStopListener: Send + Sync {
    fn on_machine_stopped(&self, event: &MachineLifecycleEvent);
}

fn event_time_ms(event: &Event) -> i64 {
    if event.time_nano > 0 {
        event.time_nano / 1_000_000
    } else {
        event.time.saturating_mul(1000)
    }
}

fn event_time_nanos(event: &Event) -> i64 {
    if event.time_nano > 0 {
        event.time_nano
    } else {
        event.time.saturating_mul(1_000_000_000)
    }
}

/// Newest processed event instant, and the events seen at it.
///
/// A reconnect resumes from whole seconds, so the engine sends the events of
/// that second again. Anything older than the newest instant, or already
/// seen at it, is a replay.
#[derive(Debug, Default)]
struct ReplayGuard {
    latest_nanos: i64,
    seen_at_latest: HashSet<(String, String)>,
}

impl ReplayGuard {
    /// Returns `true` and records `event` if it has not been processed yet.
    fn admit(&mut self, event: &Event) -> bool {
        let nanos = event_time_nanos(event);
        let key = (event.id.clone(), event.status.clone());
        match nanos.cmp(&self.latest_nanos) {
            Ordering::Less => false,
            Ordering::Equal => self.seen_at_latest.insert(key),
            Ordering::Greater => {
                self.latest_nanos = nanos;
                self.seen_at_latest.clear();
                self.seen_at_latest.insert(key);
                true
            }
        }
    }
}

// ============================================================================
// OOM markers
// ============================================================================

/// container id → time of the last OOM signal (unix ms).
///
/// Expiry is measured between event timestamps, not wall clock, so a late
/// delivered pair of events is still classified by when they happened.
#[derive(Debug)]
pub struct OomMarkers {
    markers: Mutex<HashMap<String, i64>>,
    expiry_ms: i64,
}

impl OomMarkers {
    pub fn new(expiry: Duration) -> Self {
        Self {
            markers: Mutex::new(HashMap::new()),
            expiry_ms: i64::try_from(expiry.as_millis()).unwrap_or(i64::MAX),
        }
    }

    /// Record an OOM signal and drop markers that can no longer match.
    pub fn record(&self, container_id: &str, time_ms: i64) {
        let mut markers = self.markers.lock();
        let expiry = self.expiry_ms;
        markers.retain(|_, t| time_ms.saturating_sub(*t) <= expiry);
        markers.insert(container_id.to_string(), time_ms);
    }

    /// Remove the marker for `container_id`; `true` if it was fresh at `die_time_ms`.
    pub fn take_if_fresh(&self, container_id: &str, die_time_ms: i64) -> bool {
        match self.markers.lock().remove(container_id) {
            Some(oom_time) => {
                let age = die_time_ms.saturating_sub(oom_time);
                (0..=self.expiry_ms).contains(&age)
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.markers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.markers.lock().is_empty()
    }
}

impl Default for OomMarkers {
    fn default() -> Self {
        Self::new(OOM_MARKER_EXPIRY)
    }
}

// ============================================================================
// Detector
// ============================================================================

struct TrackedMachine {
    machine_id: String,
    workspace_id: String,
    listener: Option<Arc<dyn MachineStopListener>>,
}

/// Follows engine events and publishes stop events of tracked machines.
pub struct LifecycleDetector {
    engine: Arc<dyn ContainerEngine>,
    tracked: RwLock<HashMap<String, TrackedMachine>>,
    oom_markers: OomMarkers,
    sender: broadcast::Sender<MachineLifecycleEvent>,
    metrics: ProvisionerMetricsStorage,
    reconnect_delay: Duration,
}

impl LifecycleDetector {
    pub fn new(engine: Arc<dyn ContainerEngine>, metrics: ProvisionerMetricsStorage) -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            engine,
            tracked: RwLock::new(HashMap::new()),
            oom_markers: OomMarkers::default(),
            sender,
            metrics,
            reconnect_delay: RECONNECT_DELAY,
        }
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Receive every published event from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<MachineLifecycleEvent> {
        self.sender.subscribe()
    }

    /// Start publishing stop events for `container_id`.
    pub fn start_detection(
        &self,
        container_id: &str,
        machine_id: &str,
        workspace_id: &str,
        listener: Option<Arc<dyn MachineStopListener>>,
    ) {
        self.tracked.write().insert(
            container_id.to_string(),
            TrackedMachine {
                machine_id: machine_id.to_string(),
                workspace_id: workspace_id.to_string(),
                listener,
            },
        );
        tracing::debug!(container_id, machine_id, "Started lifecycle detection");
    }

    pub fn stop_detection(&self, container_id: &str) {
        if self.tracked.write().remove(container_id).is_some() {
            tracing::debug!(container_id, "Stopped lifecycle detection");
        }
    }

    pub fn is_tracked(&self, container_id: &str) -> bool {
        self.tracked.read().contains_key(container_id)
    }

    pub fn tracked_count(&self) -> usize {
        self.tracked.read().len()
    }

    /// Classify one engine event. Returns the published event, if any.
    pub fn handle_event(&self, event: &Event) -> Option<MachineLifecycleEvent> {
        if !event.kind.is_empty() && event.kind != events::TYPE_CONTAINER {
            return None;
        }

        let time_ms = event_time_ms(event);
        let kind = match event.status.as_str() {
            events::STATUS_OOM => {
                self.oom_markers.record(&event.id, time_ms);
                tracing::debug!(container_id = %event.id, "Recorded OOM signal");
                return None;
            }
            events::STATUS_DIE => {
                if self.oom_markers.take_if_fresh(&event.id, time_ms) {
                    LifecycleEventKind::Oom
                } else {
                    LifecycleEventKind::Die
                }
            }
            _ => return None,
        };

        let (published, listener) = {
            let tracked = self.tracked.read();
            let machine = tracked.get(&event.id)?;
            (
                MachineLifecycleEvent {
                    container_id: event.id.clone(),
                    machine_id: machine.machine_id.clone(),
                    workspace_id: machine.workspace_id.clone(),
                    kind,
                    time_ms,
                },
                machine.listener.clone(),
            )
        };

        tracing::info!(
            container_id = %published.container_id,
            machine_id = %published.machine_id,
            kind = ?published.kind,
            "Machine container stopped"
        );

        if let Some(listener) = listener {
            listener.on_machine_stopped(&published);
        }
        // No subscribers is fine.
        let _ = self.sender.send(published.clone());
        ProvisionerMetricsStorage::inc(&self.metrics.lifecycle_events_published);
        Some(published)
    }

    /// Spawn the detection loop.
    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let detector = Arc::clone(self);
        tokio::spawn(async move { detector.run(cancel).await })
    }

    /// Detection loop. Returns only when `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut since = chrono::Utc::now().timestamp();
        let mut replay = ReplayGuard::default();
        tracing::info!(since, "Lifecycle detection loop started");

        loop {
            let params = EventsParams {
                since: Some(since),
                until: None,
                types: vec![events::TYPE_CONTAINER.to_string()],
                statuses: vec![events::STATUS_DIE.to_string(), events::STATUS_OOM.to_string()],
            };
            let mut stream = self.engine.events(params);

            let reconnect_now = loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::info!("Lifecycle detection loop stopped");
                        return;
                    }
                    next = stream.next() => match next {
                        Some(Ok(event)) => {
                            since = since.max(event.time);
                            if replay.admit(&event) {
                                self.handle_event(&event);
                            } else {
                                tracing::trace!(
                                    container_id = %event.id,
                                    status = %event.status,
                                    "Skipping replayed event"
                                );
                            }
                        }
                        Some(Err(EngineError::Timeout)) => {
                            tracing::debug!(since, "Event stream timed out, reconnecting");
                            break true;
                        }
                        Some(Err(e)) => {
                            tracing::warn!(since, error = %e, "Event stream failed, reconnecting");
                            break false;
                        }
                        None => {
                            tracing::debug!(since, "Event stream ended, reconnecting");
                            break false;
                        }
                    }
                }
            };

            if !reconnect_now {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::info!("Lifecycle detection loop stopped");
                        return;
                    }
                    _ = tokio::time::sleep(self.reconnect_delay) => {}
                }
            }
        }
    }
}
