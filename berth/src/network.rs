//! Workspace networks.

use crate::engine::{ContainerEngine, CreateNetworkParams, EngineError};
use berth_shared::constants::ids;
use berth_shared::errors::{BerthError, BerthResult};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Label carrying the owning workspace id.
pub const WORKSPACE_LABEL: &str = "che:workspace:id";

pub const DEFAULT_NETWORK_DRIVER: &str = "bridge";

/// Fresh network name for a workspace: `<workspace id>_<16 lowercase alnum>`.
pub fn generate_network_name(workspace_id: &str) -> String {
    format!(
        "{}_{}",
        workspace_id.to_lowercase(),
        nanoid::nanoid!({ ids::RANDOM_ID_LEN }, &ids::LOWER_ALNUM)
    )
}

/// Creates and removes the networks machines of one workspace share.
pub struct NetworkLifecycle {
    engine: Arc<dyn ContainerEngine>,
    driver: String,
}

impl NetworkLifecycle {
    pub fn new(engine: Arc<dyn ContainerEngine>) -> Self {
        Self {
            engine,
            driver: DEFAULT_NETWORK_DRIVER.to_string(),
        }
    }

    pub fn with_driver(mut self, driver: impl Into<String>) -> Self {
        self.driver = driver.into();
        self
    }

    /// Create `name` and return the network id.
    pub async fn create(&self, name: &str, workspace_id: &str) -> BerthResult<String> {
        let id = self
            .engine
            .create_network(CreateNetworkParams {
                name: name.to_string(),
                driver: Some(self.driver.clone()),
                labels: BTreeMap::from([(WORKSPACE_LABEL.to_string(), workspace_id.to_string())]),
                check_duplicate: true,
            })
            .await
            .map_err(|e| {
                BerthError::Provisioning(format!("Failed to create network '{}': {}", name, e))
            })?;
        tracing::debug!(network = name, network_id = %id, workspace_id, "Created network");
        Ok(id)
    }

    /// Remove `name`. Errors are logged, never returned.
    pub async fn destroy(&self, name: &str) {
        match self.engine.remove_network(name).await {
            Ok(()) => tracing::debug!(network = name, "Removed network"),
            Err(EngineError::NotFound(_)) => {
                tracing::debug!(network = name, "Network already gone")
            }
            Err(e) => tracing::warn!(network = name, error = %e, "Failed to remove network"),
        }
    }
}
