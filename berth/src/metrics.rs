//! Provisioner metrics (aggregate across all machines).

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Storage for provisioner-wide counters.
///
/// Shared by the provisioner, the lifecycle detector and every log streaming
/// task. All counters are monotonic.
#[derive(Clone, Debug, Default)]
pub struct ProvisionerMetricsStorage {
    /// Machines whose container reached the running state
    pub(crate) machines_started: Arc<AtomicU64>,
    /// `start_service` calls that returned an error
    pub(crate) machines_failed: Arc<AtomicU64>,
    /// Log streams stopped by the error budget
    pub(crate) log_streams_aborted: Arc<AtomicU64>,
    /// Die/OOM events delivered for tracked containers
    pub(crate) lifecycle_events_published: Arc<AtomicU64>,
    /// Snapshots committed
    pub(crate) snapshots_saved: Arc<AtomicU64>,
}

impl ProvisionerMetricsStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Handle for querying provisioner metrics.
///
/// Cloneable, lightweight handle (only Arc pointers).
#[derive(Clone, Debug)]
pub struct ProvisionerMetrics {
    storage: ProvisionerMetricsStorage,
}

impl ProvisionerMetrics {
    pub fn new(storage: ProvisionerMetricsStorage) -> Self {
        Self { storage }
    }

    /// Total machines started since the provisioner was created.
    pub fn machines_started_total(&self) -> u64 {
        self.storage.machines_started.load(Ordering::Relaxed)
    }

    /// Total machines that failed to start.
    ///
    /// Counts every error returned from `start_service`, including image
    /// preparation failures that happen before a container exists.
    pub fn machines_failed_total(&self) -> u64 {
        self.storage.machines_failed.load(Ordering::Relaxed)
    }

    pub fn log_streams_aborted_total(&self) -> u64 {
        self.storage.log_streams_aborted.load(Ordering::Relaxed)
    }

    pub fn lifecycle_events_published_total(&self) -> u64 {
        self.storage.lifecycle_events_published.load(Ordering::Relaxed)
    }

    pub fn snapshots_saved_total(&self) -> u64 {
        self.storage.snapshots_saved.load(Ordering::Relaxed)
    }
}
