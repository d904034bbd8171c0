//! Processes inside machine containers.
//!
//! A process has no native handle. It is a shell convention on top of exec:
//! the start script writes its own pid into a pid file and installs an exit
//! trap that kills spawned jobs and removes that file. Liveness and kill are
//! separate execs that read the pid file.
//!
//! ```text
//! Created --start()--> Started --(pid file gone)--> Terminated
//! ```

use crate::engine::{ContainerEngine, CreateExecParams, LogMessage, LogSender};
use crate::lifecycle::{MachineLifecycleEvent, MachineStopListener};
use berth_shared::constants::pid_files;
use berth_shared::errors::{BerthError, BerthResult};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::mpsc;

/// Default shell used to run process scripts.
pub const DEFAULT_SHELL: &str = "/bin/sh";

// ============================================================================
// Pid sequence
// ============================================================================

/// Provider-assigned process ids. Not OS pids.
///
/// Owned by one provisioner. Uniqueness across containers is not needed since
/// each container has its own `/tmp`.
#[derive(Debug)]
pub struct PidSequence {
    next: AtomicU64,
}

impl PidSequence {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    pub fn starting_at(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first),
        }
    }

    pub fn next_pid(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for PidSequence {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Command
// ============================================================================

/// What a process runs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessCommand {
    pub name: String,
    pub command_line: String,
    /// Free-form type tag (e.g. `agent`, `custom`).
    #[serde(default)]
    pub kind: Option<String>,
}

impl ProcessCommand {
    pub fn new(name: impl Into<String>, command_line: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command_line: command_line.into(),
            kind: None,
        }
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }
}

/// Shell script that records its pid and cleans up after itself.
pub fn start_script(pid_file: &str, command_line: &str) -> String {
    format!(
        "trap '[ -z \"$(jobs -p)\" ] || kill $(jobs -p); [ -e {pf} ] && rm {pf}' EXIT; echo $$>{pf}; {cmd}",
        pf = pid_file,
        cmd = command_line
    )
}

/// Prints nothing when the process is alive.
pub fn check_alive_script(pid_file: &str, pid: u64) -> String {
    format!(
        "[ -r {pf} ] && kill -0 $(cat {pf}) || echo 'Process with pid {pid} not found'",
        pf = pid_file,
        pid = pid
    )
}

pub fn kill_script(pid_file: &str) -> String {
    format!("kill $(cat {})", pid_file)
}

// ============================================================================
// Exec helper
// ============================================================================

/// Run `cmd` attached and return its combined output.
///
/// Failures carry the command and container id.
pub(crate) async fn exec_output(
    engine: &dyn ContainerEngine,
    container: &str,
    cmd: Vec<String>,
) -> BerthResult<String> {
    let (tx, mut rx) = mpsc::unbounded_channel::<LogMessage>();
    let exec_error = |message: String| BerthError::Exec {
        container: container.to_string(),
        command: cmd.clone(),
        message,
    };

    let exec = engine
        .create_exec(CreateExecParams::attached(container, cmd.clone()))
        .await
        .map_err(|e| exec_error(e.to_string()))?;
    engine
        .start_exec(&exec.id, false, Some(tx))
        .await
        .map_err(|e| exec_error(e.to_string()))?;

    let mut output = String::new();
    while let Ok(message) = rx.try_recv() {
        output.push_str(&message.content);
    }
    Ok(output)
}

fn shell_command(shell: &str, script: String) -> Vec<String> {
    vec![shell.to_string(), "-c".to_string(), script]
}

// ============================================================================
// Process
// ============================================================================

/// A process inside one container.
pub struct ContainerProcess {
    engine: Arc<dyn ContainerEngine>,
    container: String,
    pid: u64,
    command: ProcessCommand,
    shell: String,
    pid_file: String,
    started: AtomicBool,
}

impl std::fmt::Debug for ContainerProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerProcess")
            .field("container", &self.container)
            .field("pid", &self.pid)
            .field("command", &self.command)
            .field("started", &self.is_started())
            .finish()
    }
}

impl ContainerProcess {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        container: impl Into<String>,
        pid: u64,
        command: ProcessCommand,
        shell: Option<String>,
    ) -> Self {
        Self {
            engine,
            container: container.into(),
            pid,
            command,
            shell: shell.unwrap_or_else(|| DEFAULT_SHELL.to_string()),
            pid_file: pid_files::pid_file_path(pid),
            started: AtomicBool::new(false),
        }
    }

    pub fn pid(&self) -> u64 {
        self.pid
    }

    pub fn container(&self) -> &str {
        &self.container
    }

    pub fn command(&self) -> &ProcessCommand {
        &self.command
    }

    pub fn pid_file(&self) -> &str {
        &self.pid_file
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Run the command. Returns when it exits; output goes to `output`.
    pub async fn start(&self, output: Option<LogSender>) -> BerthResult<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(BerthError::ProcessConflict(format!(
                "process {} in container {} has already been started",
                self.pid, self.container
            )));
        }

        let cmd = shell_command(
            &self.shell,
            start_script(&self.pid_file, &self.command.command_line),
        );
        tracing::debug!(
            container_id = %self.container,
            pid = self.pid,
            name = %self.command.name,
            "Starting process"
        );

        let exec_error = |message: String| BerthError::Exec {
            container: self.container.clone(),
            command: cmd.clone(),
            message,
        };
        let exec = self
            .engine
            .create_exec(CreateExecParams::attached(&self.container, cmd.clone()))
            .await
            .map_err(|e| exec_error(e.to_string()))?;
        self.engine
            .start_exec(&exec.id, false, output)
            .await
            .map_err(|e| exec_error(e.to_string()))?;

        tracing::debug!(container_id = %self.container, pid = self.pid, "Process exited");
        Ok(())
    }

    /// `Ok` when the pid file exists and its pid is alive.
    pub async fn check_alive(&self) -> BerthResult<()> {
        let cmd = shell_command(DEFAULT_SHELL, check_alive_script(&self.pid_file, self.pid));
        let output = exec_output(self.engine.as_ref(), &self.container, cmd.clone()).await?;
        let output = output.trim();
        if output.is_empty() {
            Ok(())
        } else {
            Err(BerthError::ProcessNotFound {
                container: self.container.clone(),
                command: cmd,
                message: output.to_string(),
            })
        }
    }

    /// Started and passing `check_alive`. Any check failure counts as not alive.
    pub async fn is_alive(&self) -> bool {
        if !self.is_started() {
            return false;
        }
        match self.check_alive().await {
            Ok(()) => true,
            Err(e) => {
                tracing::trace!(container_id = %self.container, pid = self.pid, error = %e, "Process not alive");
                false
            }
        }
    }

    /// Signal the process. No-op if it was never started.
    pub async fn kill(&self) -> BerthResult<()> {
        if !self.is_started() {
            return Ok(());
        }
        let cmd = shell_command(DEFAULT_SHELL, kill_script(&self.pid_file));
        exec_output(self.engine.as_ref(), &self.container, cmd).await?;
        tracing::debug!(container_id = %self.container, pid = self.pid, "Killed process");
        Ok(())
    }
}

// ============================================================================
// Process table
// ============================================================================

/// pid → process for one machine. Cheap to clone; clones share the table.
#[derive(Clone, Debug, Default)]
pub struct ProcessTable {
    inner: Arc<RwLock<HashMap<u64, Arc<ContainerProcess>>>>,
}

impl ProcessTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, process: Arc<ContainerProcess>) {
        self.inner.write().insert(process.pid(), process);
    }

    pub fn get(&self, pid: u64) -> Option<Arc<ContainerProcess>> {
        self.inner.read().get(&pid).cloned()
    }

    pub fn remove(&self, pid: u64) -> Option<Arc<ContainerProcess>> {
        self.inner.write().remove(&pid)
    }

    /// All processes ordered by pid.
    pub fn list(&self) -> Vec<Arc<ContainerProcess>> {
        let mut processes: Vec<_> = self.inner.read().values().cloned().collect();
        processes.sort_by_key(|p| p.pid());
        processes
    }

    pub fn clear(&self) {
        self.inner.write().clear();
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

impl MachineStopListener for ProcessTable {
    fn on_machine_stopped(&self, event: &MachineLifecycleEvent) {
        let count = self.len();
        self.clear();
        tracing::debug!(
            container_id = %event.container_id,
            processes = count,
            "Cleared process table of stopped machine"
        );
    }
}
