//! Workspace container orchestration.
//!
//! berth turns a [`MachineSpec`] into a running, reachable, monitored
//! container through a [`ContainerEngine`]:
//!
//! - [`images`] builds or pulls the machine image and manages snapshots
//! - [`provision`] assembles the container and starts it
//! - [`servers`] resolves the addresses a machine's servers are reachable on
//! - [`process`] runs processes inside machines on top of exec
//! - [`logs`] and [`lifecycle`] are the background loops following container
//!   output and engine events

pub mod agents;
pub mod engine;
pub mod images;
pub mod lifecycle;
pub mod logs;
pub mod metrics;
pub mod naming;
pub mod network;
pub mod options;
pub mod process;
pub mod provision;
pub mod servers;
pub mod util;

pub use berth_shared::errors::{BerthError, BerthResult};
pub use engine::{ContainerEngine, EngineError, EngineResult};
pub use lifecycle::{LifecycleDetector, LifecycleEventKind, MachineLifecycleEvent};
pub use metrics::{ProvisionerMetrics, ProvisionerMetricsStorage};
pub use options::ProvisionerOptions;
pub use provision::{MachineProvisioner, MachineSpec, RuntimeIdentity, WorkspaceMachine};
pub use servers::{ServerConf, ServerMapping};
pub use util::init_logging;
