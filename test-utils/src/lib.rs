//! Test doubles for berth integration tests.
//!
//! [`MockEngine`] is an in-memory [`ContainerEngine`] with scripted
//! responses and a log of every call. [`MockRegistry`] does the same for
//! the registry client used by snapshot removal.

use async_trait::async_trait;
use berth::engine::*;
use berth::images::{RegistryClient, RegistryError};
use futures::StreamExt;
use futures::stream::{self, BoxStream};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};

/// Engine operations that can be scripted to fail.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Op {
    InspectContainer,
    CreateContainer,
    StartContainer,
    RemoveContainer,
    CreateExec,
    StartExec,
    InspectImage,
    BuildImage,
    Pull,
    Tag,
    Push,
    Commit,
    RemoveImage,
    ListImages,
    CreateNetwork,
    RemoveNetwork,
    ConnectNetwork,
}

/// One recorded engine call.
#[derive(Clone, Debug)]
pub enum EngineCall {
    InspectContainer(String),
    CreateContainer(CreateContainerParams),
    StartContainer(String),
    RemoveContainer(RemoveContainerParams),
    CreateExec(CreateExecParams),
    StartExec { exec_id: String, detach: bool },
    InspectImage(String),
    BuildImage(BuildImageParams),
    Pull(PullParams),
    Tag(TagParams),
    Push(PushParams),
    Commit(CommitParams),
    RemoveImage(RemoveImageParams),
    ListImages(ListImagesParams),
    CreateNetwork(CreateNetworkParams),
    RemoveNetwork(String),
    ConnectNetwork(ConnectContainerParams),
    Events(EventsParams),
    Logs(LogsParams),
}

impl EngineCall {
    pub fn op_name(&self) -> &'static str {
        match self {
            EngineCall::InspectContainer(_) => "inspect_container",
            EngineCall::CreateContainer(_) => "create_container",
            EngineCall::StartContainer(_) => "start_container",
            EngineCall::RemoveContainer(_) => "remove_container",
            EngineCall::CreateExec(_) => "create_exec",
            EngineCall::StartExec { .. } => "start_exec",
            EngineCall::InspectImage(_) => "inspect_image",
            EngineCall::BuildImage(_) => "build_image",
            EngineCall::Pull(_) => "pull",
            EngineCall::Tag(_) => "tag",
            EngineCall::Push(_) => "push",
            EngineCall::Commit(_) => "commit",
            EngineCall::RemoveImage(_) => "remove_image",
            EngineCall::ListImages(_) => "list_images",
            EngineCall::CreateNetwork(_) => "create_network",
            EngineCall::RemoveNetwork(_) => "remove_network",
            EngineCall::ConnectNetwork(_) => "connect_container_to_network",
            EngineCall::Events(_) => "events",
            EngineCall::Logs(_) => "container_logs",
        }
    }
}

struct MockState {
    calls: Vec<EngineCall>,
    failures: HashMap<Op, EngineError>,
    containers: HashMap<String, ContainerInfo>,
    images: HashMap<String, ImageConfig>,
    local_images: HashSet<String>,
    started_state: ContainerState,
    network_settings: NetworkSettings,
    exec_outputs: VecDeque<Vec<LogMessage>>,
    event_streams: VecDeque<Vec<EngineResult<Event>>>,
    log_streams: VecDeque<Vec<EngineResult<LogMessage>>>,
    /// Pending mode: once scripted event streams run out, new ones never yield.
    events_pending_when_empty: bool,
    push_digest: String,
    next_id: u64,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            calls: Vec::new(),
            failures: HashMap::new(),
            containers: HashMap::new(),
            images: HashMap::new(),
            local_images: HashSet::new(),
            started_state: ContainerState {
                status: "running".to_string(),
                running: true,
                ..Default::default()
            },
            network_settings: NetworkSettings::default(),
            exec_outputs: VecDeque::new(),
            event_streams: VecDeque::new(),
            log_streams: VecDeque::new(),
            events_pending_when_empty: true,
            push_digest: "sha256:0000000000000000000000000000000000000000000000000000000000000000"
                .to_string(),
            next_id: 0,
        }
    }
}

impl MockState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}-{}", prefix, self.next_id)
    }

    fn check(&self, op: Op) -> EngineResult<()> {
        match self.failures.get(&op) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

/// Scripted in-memory container engine.
#[derive(Default)]
pub struct MockEngine {
    state: Mutex<MockState>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    // ---- scripting ----

    /// Every call of `op` fails with `error` until [`succeed`](Self::succeed).
    pub fn fail(&self, op: Op, error: EngineError) {
        self.state.lock().failures.insert(op, error);
    }

    pub fn succeed(&self, op: Op) {
        self.state.lock().failures.remove(&op);
    }

    /// Config returned by `inspect_image` for `image`. Unknown images have an empty config.
    pub fn set_image_config(&self, image: &str, config: ImageConfig) {
        self.state.lock().images.insert(image.to_string(), config);
    }

    /// Make `list_images` find `reference`.
    pub fn add_local_image(&self, reference: &str) {
        self.state.lock().local_images.insert(reference.to_string());
    }

    /// State containers get on `start_container`.
    pub fn set_started_state(&self, state: ContainerState) {
        self.state.lock().started_state = state;
    }

    /// Network settings containers get on `start_container`.
    pub fn set_network_settings(&self, settings: NetworkSettings) {
        self.state.lock().network_settings = settings;
    }

    /// Insert or replace a container returned by `inspect_container`.
    pub fn put_container(&self, info: ContainerInfo) {
        self.state.lock().containers.insert(info.id.clone(), info);
    }

    /// Output of the next `start_exec` call, one message per line.
    pub fn push_exec_output(&self, lines: &[&str]) {
        self.state
            .lock()
            .exec_outputs
            .push_back(lines.iter().map(|l| LogMessage::stdout(*l)).collect());
    }

    /// Items of the next `events` stream. The stream ends after them.
    pub fn push_event_stream(&self, items: Vec<EngineResult<Event>>) {
        self.state.lock().event_streams.push_back(items);
    }

    /// When no scripted event stream is left: `true` never yields, `false` ends at once.
    pub fn set_events_pending_when_empty(&self, pending: bool) {
        self.state.lock().events_pending_when_empty = pending;
    }

    /// Items of the next `container_logs` stream. Unscripted streams end at once.
    pub fn push_log_stream(&self, items: Vec<EngineResult<LogMessage>>) {
        self.state.lock().log_streams.push_back(items);
    }

    pub fn set_push_digest(&self, digest: &str) {
        self.state.lock().push_digest = digest.to_string();
    }

    // ---- inspection ----

    pub fn calls(&self) -> Vec<EngineCall> {
        self.state.lock().calls.clone()
    }

    /// Names of the recorded calls, in order.
    pub fn call_names(&self) -> Vec<&'static str> {
        self.state.lock().calls.iter().map(|c| c.op_name()).collect()
    }

    pub fn count(&self, name: &str) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| c.op_name() == name)
            .count()
    }

    pub fn created_containers(&self) -> Vec<CreateContainerParams> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                EngineCall::CreateContainer(p) => Some(p.clone()),
                _ => None,
            })
            .collect()
    }

    /// Commands of every exec, in order.
    pub fn exec_commands(&self) -> Vec<Vec<String>> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                EngineCall::CreateExec(p) => Some(p.cmd.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn has_container(&self, id: &str) -> bool {
        self.state.lock().containers.contains_key(id)
    }

    fn record(&self, call: EngineCall) {
        self.state.lock().calls.push(call);
    }
}

#[async_trait]
impl ContainerEngine for MockEngine {
    async fn inspect_container(&self, container: &str) -> EngineResult<ContainerInfo> {
        self.record(EngineCall::InspectContainer(container.to_string()));
        let state = self.state.lock();
        state.check(Op::InspectContainer)?;
        state
            .containers
            .get(container)
            .cloned()
            .ok_or_else(|| EngineError::ContainerNotFound(container.to_string()))
    }

    async fn create_container(
        &self,
        params: CreateContainerParams,
    ) -> EngineResult<ContainerCreated> {
        self.record(EngineCall::CreateContainer(params.clone()));
        let mut state = self.state.lock();
        state.check(Op::CreateContainer)?;
        let id = state.next_id("container");
        let info = ContainerInfo {
            id: id.clone(),
            name: params.name.map(|n| format!("/{}", n)).unwrap_or_default(),
            image: params.config.image.clone(),
            config: params.config,
            network_settings: NetworkSettings::default(),
            state: ContainerState {
                status: "created".to_string(),
                ..Default::default()
            },
        };
        state.containers.insert(id.clone(), info);
        Ok(ContainerCreated {
            id,
            warnings: Vec::new(),
        })
    }

    async fn start_container(&self, container: &str) -> EngineResult<()> {
        self.record(EngineCall::StartContainer(container.to_string()));
        let mut state = self.state.lock();
        state.check(Op::StartContainer)?;
        let started = state.started_state.clone();
        let settings = state.network_settings.clone();
        let info = state
            .containers
            .get_mut(container)
            .ok_or_else(|| EngineError::ContainerNotFound(container.to_string()))?;
        info.state = started;
        info.network_settings = settings;
        Ok(())
    }

    async fn remove_container(&self, params: RemoveContainerParams) -> EngineResult<()> {
        self.record(EngineCall::RemoveContainer(params.clone()));
        let mut state = self.state.lock();
        state.check(Op::RemoveContainer)?;
        state
            .containers
            .remove(&params.container)
            .map(|_| ())
            .ok_or(EngineError::ContainerNotFound(params.container))
    }

    async fn create_exec(&self, params: CreateExecParams) -> EngineResult<ExecCreated> {
        self.record(EngineCall::CreateExec(params));
        let mut state = self.state.lock();
        state.check(Op::CreateExec)?;
        Ok(ExecCreated {
            id: state.next_id("exec"),
        })
    }

    async fn start_exec(
        &self,
        exec_id: &str,
        detach: bool,
        output: Option<LogSender>,
    ) -> EngineResult<()> {
        self.record(EngineCall::StartExec {
            exec_id: exec_id.to_string(),
            detach,
        });
        let messages = {
            let mut state = self.state.lock();
            state.check(Op::StartExec)?;
            state.exec_outputs.pop_front().unwrap_or_default()
        };
        if let Some(output) = output {
            for message in messages {
                let _ = output.send(message);
            }
        }
        Ok(())
    }

    async fn inspect_image(&self, image: &str) -> EngineResult<ImageInfo> {
        self.record(EngineCall::InspectImage(image.to_string()));
        let state = self.state.lock();
        state.check(Op::InspectImage)?;
        Ok(ImageInfo {
            id: format!("sha256:{}", image),
            config: state.images.get(image).cloned().unwrap_or_default(),
        })
    }

    async fn build_image(
        &self,
        params: BuildImageParams,
        progress: Option<ProgressSender>,
    ) -> EngineResult<String> {
        if let BuildSource::Dockerfile(path) = &params.source {
            // The Dockerfile must still exist while the build runs.
            if !path.exists() {
                return Err(EngineError::Io(format!("{} does not exist", path.display())));
            }
        }
        self.record(EngineCall::BuildImage(params));
        let mut state = self.state.lock();
        state.check(Op::BuildImage)?;
        if let Some(progress) = progress {
            let _ = progress.send("Step 1/1".to_string());
        }
        Ok(state.next_id("image"))
    }

    async fn pull(&self, params: PullParams, progress: Option<ProgressSender>) -> EngineResult<()> {
        self.record(EngineCall::Pull(params));
        self.state.lock().check(Op::Pull)?;
        if let Some(progress) = progress {
            let _ = progress.send("Pull complete".to_string());
        }
        Ok(())
    }

    async fn tag(&self, params: TagParams) -> EngineResult<()> {
        self.record(EngineCall::Tag(params));
        self.state.lock().check(Op::Tag)
    }

    async fn push(
        &self,
        params: PushParams,
        _progress: Option<ProgressSender>,
    ) -> EngineResult<String> {
        self.record(EngineCall::Push(params));
        let state = self.state.lock();
        state.check(Op::Push)?;
        Ok(state.push_digest.clone())
    }

    async fn commit(&self, params: CommitParams) -> EngineResult<String> {
        self.record(EngineCall::Commit(params));
        let mut state = self.state.lock();
        state.check(Op::Commit)?;
        Ok(state.next_id("sha256:commit"))
    }

    async fn remove_image(&self, params: RemoveImageParams) -> EngineResult<()> {
        self.record(EngineCall::RemoveImage(params));
        self.state.lock().check(Op::RemoveImage)
    }

    async fn list_images(&self, params: ListImagesParams) -> EngineResult<Vec<ImageSummary>> {
        self.record(EngineCall::ListImages(params.clone()));
        let state = self.state.lock();
        state.check(Op::ListImages)?;
        let found = state
            .local_images
            .iter()
            .filter(|r| params.reference.as_deref().is_none_or(|wanted| wanted == r.as_str()))
            .map(|r| ImageSummary {
                id: format!("sha256:{}", r),
                repo_tags: vec![r.clone()],
            })
            .collect();
        Ok(found)
    }

    async fn create_network(&self, params: CreateNetworkParams) -> EngineResult<String> {
        self.record(EngineCall::CreateNetwork(params));
        let mut state = self.state.lock();
        state.check(Op::CreateNetwork)?;
        Ok(state.next_id("network"))
    }

    async fn remove_network(&self, network: &str) -> EngineResult<()> {
        self.record(EngineCall::RemoveNetwork(network.to_string()));
        self.state.lock().check(Op::RemoveNetwork)
    }

    async fn connect_container_to_network(
        &self,
        params: ConnectContainerParams,
    ) -> EngineResult<()> {
        self.record(EngineCall::ConnectNetwork(params));
        self.state.lock().check(Op::ConnectNetwork)
    }

    fn events(&self, params: EventsParams) -> BoxStream<'static, EngineResult<Event>> {
        self.record(EngineCall::Events(params));
        let mut state = self.state.lock();
        match state.event_streams.pop_front() {
            Some(items) => stream::iter(items).boxed(),
            None if state.events_pending_when_empty => stream::pending().boxed(),
            None => stream::empty().boxed(),
        }
    }

    fn container_logs(&self, params: LogsParams) -> BoxStream<'static, EngineResult<LogMessage>> {
        self.record(EngineCall::Logs(params));
        match self.state.lock().log_streams.pop_front() {
            Some(items) => stream::iter(items).boxed(),
            None => stream::empty().boxed(),
        }
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Registry client recording manifest deletions.
#[derive(Default)]
pub struct MockRegistry {
    deleted: Mutex<Vec<(String, String, String)>>,
    response: Mutex<Option<RegistryError>>,
}

impl MockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every following deletion fails with `error`.
    pub fn respond_with(&self, error: RegistryError) {
        *self.response.lock() = Some(error);
    }

    /// `(registry, repository, digest)` of every deletion attempt.
    pub fn deleted(&self) -> Vec<(String, String, String)> {
        self.deleted.lock().clone()
    }
}

#[async_trait]
impl RegistryClient for MockRegistry {
    async fn delete_manifest(
        &self,
        registry: &str,
        repository: &str,
        digest: &str,
    ) -> Result<(), RegistryError> {
        self.deleted.lock().push((
            registry.to_string(),
            repository.to_string(),
            digest.to_string(),
        ));
        match self.response.lock().clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

// ============================================================================
// Fixtures
// ============================================================================

/// Network settings with one host binding per `(container port, host port)`.
pub fn bound_ports(ip: &str, gateway: &str, ports: &[(&str, &str)]) -> NetworkSettings {
    NetworkSettings {
        ip_address: ip.to_string(),
        gateway: gateway.to_string(),
        ports: ports
            .iter()
            .map(|(port, host_port)| {
                (
                    port.to_string(),
                    Some(vec![PortBinding {
                        host_ip: "0.0.0.0".to_string(),
                        host_port: host_port.to_string(),
                    }]),
                )
            })
            .collect(),
    }
}

/// Container event at `time_secs` (plus `offset_ms`).
pub fn container_event(id: &str, status: &str, time_secs: i64, offset_ms: i64) -> Event {
    Event {
        kind: "container".to_string(),
        status: status.to_string(),
        id: id.to_string(),
        from: String::new(),
        time: time_secs + offset_ms / 1000,
        time_nano: time_secs * 1_000_000_000 + offset_ms * 1_000_000,
    }
}
