//! Container engine seam.
//!
//! Everything berth does against Docker goes through [`ContainerEngine`].
//! The trait mirrors the engine's remote API one call per method; policy
//! (retries, cleanup, naming) lives in the callers.

mod error;
mod types;

pub use error::EngineError;
pub use types::*;

use async_trait::async_trait;
use futures::stream::BoxStream;

pub type EngineResult<T> = Result<T, EngineError>;

/// Remote container engine API.
///
/// Implementations must be safe to share across tasks: the provisioner,
/// the lifecycle detector and every log streaming task hold the same
/// `Arc<dyn ContainerEngine>`.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    // ---- containers ----

    async fn inspect_container(&self, container: &str) -> EngineResult<ContainerInfo>;

    async fn create_container(&self, params: CreateContainerParams)
    -> EngineResult<ContainerCreated>;

    async fn start_container(&self, container: &str) -> EngineResult<()>;

    async fn remove_container(&self, params: RemoveContainerParams) -> EngineResult<()>;

    // ---- exec ----

    async fn create_exec(&self, params: CreateExecParams) -> EngineResult<ExecCreated>;

    /// Start an exec. With `detach == false` the call returns once the exec
    /// finishes; every output line is forwarded to `output` when present.
    async fn start_exec(
        &self,
        exec_id: &str,
        detach: bool,
        output: Option<LogSender>,
    ) -> EngineResult<()>;

    // ---- images ----

    async fn inspect_image(&self, image: &str) -> EngineResult<ImageInfo>;

    /// Build an image and return its id.
    async fn build_image(
        &self,
        params: BuildImageParams,
        progress: Option<ProgressSender>,
    ) -> EngineResult<String>;

    async fn pull(&self, params: PullParams, progress: Option<ProgressSender>)
    -> EngineResult<()>;

    async fn tag(&self, params: TagParams) -> EngineResult<()>;

    /// Push an image and return the manifest digest reported by the registry.
    async fn push(&self, params: PushParams, progress: Option<ProgressSender>)
    -> EngineResult<String>;

    /// Commit a container to an image and return the image id.
    async fn commit(&self, params: CommitParams) -> EngineResult<String>;

    async fn remove_image(&self, params: RemoveImageParams) -> EngineResult<()>;

    async fn list_images(&self, params: ListImagesParams) -> EngineResult<Vec<ImageSummary>>;

    // ---- networks ----

    /// Create a network and return its id.
    async fn create_network(&self, params: CreateNetworkParams) -> EngineResult<String>;

    async fn remove_network(&self, network: &str) -> EngineResult<()>;

    async fn connect_container_to_network(
        &self,
        params: ConnectContainerParams,
    ) -> EngineResult<()>;

    // ---- streams ----

    /// Engine event stream. Ends or yields an error when the connection drops.
    fn events(&self, params: EventsParams) -> BoxStream<'static, EngineResult<Event>>;

    /// Container log stream.
    fn container_logs(&self, params: LogsParams) -> BoxStream<'static, EngineResult<LogMessage>>;
}
