//! A provisioned, running workspace machine.

use crate::engine::{ContainerEngine, ContainerInfo, RemoveContainerParams, RemoveImageParams};
use crate::images::{Snapshot, SnapshotPipeline};
use crate::lifecycle::LifecycleDetector;
use crate::logs::LogStreamExit;
use crate::process::{self, ContainerProcess, PidSequence, ProcessCommand, ProcessTable};
use crate::servers::{AddressStrategy, ServerConf, ServerMapping, evaluate_servers};
use berth_shared::errors::{BerthError, BerthResult};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Printed instead of file content when the file cannot be read.
pub const FILE_NOT_FOUND_MARKER: &str = "berth: file not found";

/// Shell script printing lines `from_line ..= from_line + limit - 1` of `path`.
///
/// The readability check runs before `sed`, so a missing file yields
/// [`FILE_NOT_FOUND_MARKER`] whatever `sed` implementation the image ships.
pub fn read_file_script(path: &str, from_line: u32, limit: u32) -> String {
    let to_line = from_line.saturating_add(limit.saturating_sub(1));
    let quoted = format!("'{}'", path.replace('\'', r"'\''"));
    format!(
        "[ -r {quoted} ] || {{ echo '{FILE_NOT_FOUND_MARKER}'; exit 0; }}; sed -n '{from_line},{to_line}p' {quoted}"
    )
}

/// Everything a machine needs from the provisioner that started it.
pub(crate) struct MachineParts {
    pub engine: Arc<dyn ContainerEngine>,
    pub container_id: String,
    pub machine_id: String,
    pub machine_name: String,
    pub workspace_id: String,
    pub image: String,
    pub info: ContainerInfo,
    pub server_overrides: HashMap<String, ServerConf>,
    pub processes: ProcessTable,
    pub pids: Arc<PidSequence>,
    pub detector: Arc<LifecycleDetector>,
    pub strategy: Arc<dyn AddressStrategy>,
    pub snapshots: Arc<SnapshotPipeline>,
    pub fallback_host: String,
    pub log_task: JoinHandle<LogStreamExit>,
}

pub struct WorkspaceMachine {
    engine: Arc<dyn ContainerEngine>,
    container_id: String,
    machine_id: String,
    machine_name: String,
    workspace_id: String,
    image: String,
    info: ContainerInfo,
    server_overrides: HashMap<String, ServerConf>,
    processes: ProcessTable,
    pids: Arc<PidSequence>,
    detector: Arc<LifecycleDetector>,
    strategy: Arc<dyn AddressStrategy>,
    snapshots: Arc<SnapshotPipeline>,
    fallback_host: String,
    log_task: Mutex<Option<JoinHandle<LogStreamExit>>>,
}

impl std::fmt::Debug for WorkspaceMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkspaceMachine")
            .field("container_id", &self.container_id)
            .field("machine_id", &self.machine_id)
            .field("machine_name", &self.machine_name)
            .field("image", &self.image)
            .finish()
    }
}

impl WorkspaceMachine {
    pub(crate) fn new(parts: MachineParts) -> Self {
        Self {
            engine: parts.engine,
            container_id: parts.container_id,
            machine_id: parts.machine_id,
            machine_name: parts.machine_name,
            workspace_id: parts.workspace_id,
            image: parts.image,
            info: parts.info,
            server_overrides: parts.server_overrides,
            processes: parts.processes,
            pids: parts.pids,
            detector: parts.detector,
            strategy: parts.strategy,
            snapshots: parts.snapshots,
            fallback_host: parts.fallback_host,
            log_task: Mutex::new(Some(parts.log_task)),
        }
    }

    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    pub fn machine_id(&self) -> &str {
        &self.machine_id
    }

    pub fn machine_name(&self) -> &str {
        &self.machine_name
    }

    pub fn workspace_id(&self) -> &str {
        &self.workspace_id
    }

    /// Image the container was created from.
    pub fn image(&self) -> &str {
        &self.image
    }

    /// Container state as inspected right after start.
    pub fn info(&self) -> &ContainerInfo {
        &self.info
    }

    /// Servers of the machine, from a fresh inspect of its container.
    pub async fn servers(&self) -> BerthResult<BTreeMap<String, ServerMapping>> {
        let info = self.engine.inspect_container(&self.container_id).await?;
        evaluate_servers(
            self.strategy.as_ref(),
            &info,
            &self.fallback_host,
            &self.server_overrides,
        )
    }

    // ---- processes ----

    /// Register a new, not yet started process.
    pub fn create_process(
        &self,
        command: ProcessCommand,
        shell: Option<String>,
    ) -> Arc<ContainerProcess> {
        let process = Arc::new(ContainerProcess::new(
            Arc::clone(&self.engine),
            &self.container_id,
            self.pids.next_pid(),
            command,
            shell,
        ));
        self.processes.insert(Arc::clone(&process));
        process
    }

    pub fn get_process(&self, pid: u64) -> BerthResult<Arc<ContainerProcess>> {
        self.processes.get(pid).ok_or_else(|| {
            BerthError::NotFound(format!(
                "process with pid {} not found in machine '{}'",
                pid, self.machine_name
            ))
        })
    }

    pub fn processes(&self) -> Vec<Arc<ContainerProcess>> {
        self.processes.list()
    }

    pub fn remove_process(&self, pid: u64) -> Option<Arc<ContainerProcess>> {
        self.processes.remove(pid)
    }

    /// Lines `from_line ..= from_line + limit - 1` (1-based) of a file in the container.
    pub async fn read_file(&self, path: &str, from_line: u32, limit: u32) -> BerthResult<String> {
        if from_line == 0 || limit == 0 {
            return Err(BerthError::InvalidArgument(format!(
                "invalid line range: from {} limit {}",
                from_line, limit
            )));
        }
        let cmd = vec![
            process::DEFAULT_SHELL.to_string(),
            "-c".to_string(),
            read_file_script(path, from_line, limit),
        ];
        let output = process::exec_output(self.engine.as_ref(), &self.container_id, cmd).await?;

        if output.trim_end() == FILE_NOT_FOUND_MARKER {
            return Err(BerthError::NotFound(format!(
                "file '{}' not found in machine '{}'",
                path, self.machine_name
            )));
        }
        Ok(output)
    }

    // ---- snapshots & teardown ----

    /// Commit the running container. The container is not paused.
    pub async fn save_to_snapshot(&self) -> BerthResult<Snapshot> {
        self.snapshots.save(&self.container_id).await
    }

    /// Remove the container and its image. Image removal errors are only logged.
    pub async fn destroy(&self) -> BerthResult<()> {
        self.detector.stop_detection(&self.container_id);
        self.processes.clear();
        if let Some(task) = self.log_task.lock().take() {
            task.abort();
        }

        let params = RemoveContainerParams::forced(&self.container_id);
        self.engine.remove_container(params).await.map_err(|e| {
            BerthError::Engine(format!(
                "Failed to remove container of machine '{}': {}",
                self.machine_name, e
            ))
        })?;

        if let Err(e) = self
            .engine
            .remove_image(RemoveImageParams {
                image: self.image.clone(),
                force: false,
            })
            .await
        {
            tracing::warn!(image = %self.image, error = %e, "Failed to remove machine image");
        }

        tracing::info!(
            machine = %self.machine_name,
            container_id = %self.container_id,
            "Machine destroyed"
        );
        Ok(())
    }
}
