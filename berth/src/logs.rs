//! Machine container log streaming.
//!
//! One task per provisioned container follows its log stream and re-emits
//! every line through tracing (target `berth::machine`) and, optionally, a
//! channel. The task survives transient failures:
//!
//! - timeout: reconnect immediately from the time of the timeout
//! - container not found, or the stream ends: the container is gone, stop
//! - any other error: counted by an [`ErrorBudget`]; too many errors inside
//!   the window stop the task, otherwise wait and retry

use crate::engine::{ContainerEngine, EngineError, LogMessage, LogsParams, StreamKind};
use crate::metrics::ProvisionerMetricsStorage;
use futures::StreamExt;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Sliding window over which stream errors are counted.
pub const ERROR_WINDOW: Duration = Duration::from_secs(20);
/// Errors inside [`ERROR_WINDOW`] that stop the stream.
pub const MAX_ERRORS_IN_WINDOW: usize = 5;
/// Pause after a counted error before reconnecting.
pub const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Tracing target for re-emitted container output.
pub const MACHINE_LOG_TARGET: &str = "berth::machine";

// ============================================================================
// Error budget
// ============================================================================

/// Counts errors over a sliding time window.
#[derive(Debug, Clone)]
pub struct ErrorBudget {
    window: Duration,
    max_errors: usize,
    errors: VecDeque<Instant>,
}

impl ErrorBudget {
    pub fn new(window: Duration, max_errors: usize) -> Self {
        Self {
            window,
            max_errors,
            errors: VecDeque::with_capacity(max_errors),
        }
    }

    /// Record an error at `now`. Returns `true` once the budget is exhausted.
    pub fn record(&mut self, now: Instant) -> bool {
        while let Some(&oldest) = self.errors.front() {
            if now.saturating_duration_since(oldest) > self.window {
                self.errors.pop_front();
            } else {
                break;
            }
        }
        self.errors.push_back(now);
        self.errors.len() >= self.max_errors
    }

    /// Errors currently inside the window (as of the last `record`).
    pub fn recent_errors(&self) -> usize {
        self.errors.len()
    }
}

impl Default for ErrorBudget {
    fn default() -> Self {
        Self::new(ERROR_WINDOW, MAX_ERRORS_IN_WINDOW)
    }
}

// ============================================================================
// Streaming task
// ============================================================================

/// One line of machine output, as delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineLogLine {
    pub container_id: String,
    pub machine_name: String,
    pub stream: StreamKind,
    pub line: String,
}

/// Why a log streaming task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStreamExit {
    /// The engine no longer knows the container.
    ContainerGone,
    /// The follow stream finished, which happens when the container stops.
    StreamEnded,
    /// Too many errors inside the window.
    BudgetExhausted,
}

/// Follows the logs of one container.
pub struct LogStreamer {
    engine: Arc<dyn ContainerEngine>,
    container_id: String,
    machine_name: String,
    output: Option<mpsc::UnboundedSender<MachineLogLine>>,
    metrics: ProvisionerMetricsStorage,
    budget: ErrorBudget,
    retry_delay: Duration,
}

impl LogStreamer {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        container_id: impl Into<String>,
        machine_name: impl Into<String>,
        metrics: ProvisionerMetricsStorage,
    ) -> Self {
        Self {
            engine,
            container_id: container_id.into(),
            machine_name: machine_name.into(),
            output: None,
            metrics,
            budget: ErrorBudget::default(),
            retry_delay: RETRY_DELAY,
        }
    }

    pub fn with_output(mut self, output: mpsc::UnboundedSender<MachineLogLine>) -> Self {
        self.output = Some(output);
        self
    }

    pub fn with_budget(mut self, budget: ErrorBudget, retry_delay: Duration) -> Self {
        self.budget = budget;
        self.retry_delay = retry_delay;
        self
    }

    pub fn spawn(self) -> JoinHandle<LogStreamExit> {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) -> LogStreamExit {
        let mut since = 0i64;
        tracing::debug!(container_id = %self.container_id, "Log streaming started");

        loop {
            let mut stream = self.engine.container_logs(LogsParams {
                container: self.container_id.clone(),
                follow: true,
                since,
            });

            let error = loop {
                match stream.next().await {
                    Some(Ok(message)) => {
                        since = chrono::Utc::now().timestamp();
                        self.emit(message);
                    }
                    Some(Err(EngineError::Timeout)) => {
                        since = chrono::Utc::now().timestamp();
                        break None;
                    }
                    Some(Err(EngineError::ContainerNotFound(_))) => {
                        tracing::debug!(container_id = %self.container_id, "Container gone, log streaming stopped");
                        return LogStreamExit::ContainerGone;
                    }
                    Some(Err(e)) => {
                        since = chrono::Utc::now().timestamp();
                        break Some(e);
                    }
                    None => {
                        tracing::debug!(container_id = %self.container_id, "Log stream ended");
                        return LogStreamExit::StreamEnded;
                    }
                }
            };

            let Some(error) = error else {
                tracing::trace!(container_id = %self.container_id, since, "Log stream timed out, reconnecting");
                continue;
            };

            if self.budget.record(Instant::now()) {
                tracing::warn!(
                    container_id = %self.container_id,
                    errors = self.budget.recent_errors(),
                    error = %error,
                    "Too many log streaming errors, giving up"
                );
                ProvisionerMetricsStorage::inc(&self.metrics.log_streams_aborted);
                return LogStreamExit::BudgetExhausted;
            }

            tracing::debug!(
                container_id = %self.container_id,
                error = %error,
                "Log streaming error, retrying"
            );
            tokio::time::sleep(self.retry_delay).await;
        }
    }

    fn emit(&self, message: LogMessage) {
        let cleaned = strip_ansi_codes(&message.content);
        for line in cleaned.lines().filter(|l| !l.trim().is_empty()) {
            match message.stream {
                StreamKind::Stderr => tracing::warn!(
                    target: MACHINE_LOG_TARGET,
                    machine = %self.machine_name,
                    "{}",
                    line
                ),
                _ => tracing::debug!(
                    target: MACHINE_LOG_TARGET,
                    machine = %self.machine_name,
                    "{}",
                    line
                ),
            }

            if let Some(output) = &self.output {
                // Receiver gone means nobody is listening any more.
                let _ = output.send(MachineLogLine {
                    container_id: self.container_id.clone(),
                    machine_name: self.machine_name.clone(),
                    stream: message.stream,
                    line: line.to_string(),
                });
            }
        }
    }
}

/// Strip `ESC[...m` color sequences.
fn strip_ansi_codes(text: &str) -> String {
    let mut result = String::with_capacity(text.len());
    let mut chars = text.chars();

    while let Some(c) = chars.next() {
        if c == '\x1b' {
            if chars.next() == Some('[') {
                for next_char in chars.by_ref() {
                    if next_char == 'm' {
                        break;
                    }
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}
