//! Machine snapshots: commit a running container, optionally through a registry.
//!
//! Containers are committed without pausing them: a paused container
//! breaks every exec session that is running inside it.

use super::{RegistryClient, RegistryError, Snapshot};
use crate::engine::{AuthConfigs, CommitParams, ContainerEngine, PushParams, RemoveImageParams};
use crate::metrics::ProvisionerMetricsStorage;
use crate::options::SnapshotOptions;
use berth_shared::constants::{ids, images};
use berth_shared::errors::{BerthError, BerthResult};
use std::sync::Arc;

/// Fresh snapshot repository name: `machine_snapshot_<16 lowercase alnum>`.
pub fn generate_snapshot_repository() -> String {
    format!(
        "{}{}",
        images::SNAPSHOT_PREFIX,
        nanoid::nanoid!({ ids::RANDOM_ID_LEN }, &ids::LOWER_ALNUM)
    )
}

pub struct SnapshotPipeline {
    engine: Arc<dyn ContainerEngine>,
    options: SnapshotOptions,
    auth: AuthConfigs,
    registry_client: Option<Arc<dyn RegistryClient>>,
    metrics: ProvisionerMetricsStorage,
}

impl SnapshotPipeline {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        options: SnapshotOptions,
        auth: AuthConfigs,
        metrics: ProvisionerMetricsStorage,
    ) -> Self {
        #[cfg(feature = "registry-http")]
        let registry_client: Option<Arc<dyn RegistryClient>> =
            Some(Arc::new(super::HttpRegistryClient::new()));
        #[cfg(not(feature = "registry-http"))]
        let registry_client: Option<Arc<dyn RegistryClient>> = None;

        Self {
            engine,
            options,
            auth,
            registry_client,
            metrics,
        }
    }

    pub fn with_registry_client(mut self, client: Arc<dyn RegistryClient>) -> Self {
        self.registry_client = Some(client);
        self
    }

    /// Commit `container_id` under a fresh repository name.
    pub async fn save(&self, container_id: &str) -> BerthResult<Snapshot> {
        let repository = generate_snapshot_repository();
        let tag = images::LATEST_TAG.to_string();

        let snapshot = if self.options.use_registry {
            let registry = self.registry()?.to_string();
            let full_repository = format!("{}/{}", registry, repository);

            self.commit(container_id, &full_repository, &tag).await?;

            let digest = self
                .engine
                .push(
                    PushParams {
                        repository: repository.clone(),
                        tag: Some(tag.clone()),
                        registry: Some(registry.clone()),
                        auth: self.auth.clone(),
                    },
                    None,
                )
                .await
                .map_err(|e| {
                    BerthError::Snapshot(format!(
                        "Failed to push snapshot '{}': {}",
                        full_repository, e
                    ))
                })?;

            let local = format!("{}:{}", full_repository, tag);
            if let Err(e) = self
                .engine
                .remove_image(RemoveImageParams {
                    image: local.clone(),
                    force: false,
                })
                .await
            {
                tracing::warn!(image = %local, error = %e, "Failed to remove local snapshot copy");
            }

            Snapshot {
                registry: Some(registry),
                repository,
                tag: Some(tag),
                digest: Some(digest),
            }
        } else {
            self.commit(container_id, &repository, &tag).await?;
            Snapshot {
                registry: None,
                repository,
                tag: Some(tag),
                digest: None,
            }
        };

        ProvisionerMetricsStorage::inc(&self.metrics.snapshots_saved);
        tracing::info!(container_id, snapshot = %snapshot, "Saved machine snapshot");
        Ok(snapshot)
    }

    /// Remove a snapshot previously returned by [`save`](Self::save).
    pub async fn remove(&self, snapshot: &Snapshot) -> BerthResult<()> {
        if !self.options.use_registry {
            let image = snapshot.location(false);
            if let Err(e) = self
                .engine
                .remove_image(RemoveImageParams {
                    image: image.clone(),
                    force: false,
                })
                .await
            {
                tracing::debug!(image = %image, error = %e, "Snapshot image removal failed");
            }
            return Ok(());
        }

        let (Some(registry), Some(digest)) = (&snapshot.registry, &snapshot.digest) else {
            return Err(BerthError::Snapshot(format!(
                "Snapshot removing failed. Snapshot attributes are not valid: {}",
                snapshot
            )));
        };
        if snapshot.repository.is_empty() {
            return Err(BerthError::Snapshot(
                "Snapshot removing failed. Snapshot attributes are not valid: empty repository"
                    .to_string(),
            ));
        }

        let client = self.registry_client.as_ref().ok_or_else(|| {
            BerthError::Snapshot("No registry client configured for snapshot removal".to_string())
        })?;

        match client
            .delete_manifest(registry, &snapshot.repository, digest)
            .await
        {
            Ok(()) => {
                tracing::info!(snapshot = %snapshot, "Removed snapshot from registry");
                Ok(())
            }
            Err(RegistryError::Status { status, body }) => {
                tracing::error!(snapshot = %snapshot, status, body = %body, "Registry refused snapshot removal");
                Err(BerthError::Snapshot(
                    "Internal server error occurs. Can't remove snapshot".to_string(),
                ))
            }
            Err(RegistryError::Transport(message)) => {
                tracing::error!(snapshot = %snapshot, error = %message, "Snapshot removal request failed");
                Ok(())
            }
        }
    }

    async fn commit(&self, container_id: &str, repository: &str, tag: &str) -> BerthResult<()> {
        self.engine
            .commit(CommitParams {
                container: container_id.to_string(),
                repository: repository.to_string(),
                tag: Some(tag.to_string()),
                comment: None,
            })
            .await
            .map(|_| ())
            .map_err(|e| {
                BerthError::Snapshot(format!(
                    "Failed to commit container '{}': {}",
                    container_id, e
                ))
            })
    }

    fn registry(&self) -> BerthResult<&str> {
        self.options
            .registry
            .as_deref()
            .filter(|r| !r.is_empty())
            .ok_or_else(|| {
                BerthError::Config("registry snapshots enabled without a registry".to_string())
            })
    }
}
