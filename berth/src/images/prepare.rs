//! Image preparation: build from a Dockerfile or pull, then tag for the machine.

use super::{Snapshot, is_snapshot_location};
use crate::engine::{
    BuildImageParams, BuildSource, ContainerEngine, EngineError, ListImagesParams, ProgressSender,
    PullParams, RemoveImageParams, TagParams,
};
use crate::options::ProvisionerOptions;
use crate::provision::{BuildSpec, MachineSpec};
use berth_shared::constants::images;
use berth_shared::errors::{BerthError, BerthResult};
use std::sync::Arc;

/// Repository an image prepared for `container_name` is tagged with.
pub fn machine_image_name(container_name: &str) -> String {
    format!("{}/{}", images::MACHINE_IMAGE_NAMESPACE, container_name)
}

/// Turns a [`MachineSpec`] image source into a local image named for the machine.
pub struct ImagePreparer {
    engine: Arc<dyn ContainerEngine>,
    options: Arc<ProvisionerOptions>,
    progress: Option<ProgressSender>,
}

impl ImagePreparer {
    pub fn new(engine: Arc<dyn ContainerEngine>, options: Arc<ProvisionerOptions>) -> Self {
        Self {
            engine,
            options,
            progress: None,
        }
    }

    /// Forward build and pull progress lines to `progress`.
    pub fn with_progress(mut self, progress: ProgressSender) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Prepare the image for a machine and return its name.
    ///
    /// Fails with [`BerthError::Provisioning`] before touching the engine
    /// when the machine spec has neither a build source nor an image reference.
    pub async fn prepare(&self, machine_name: &str, spec: &MachineSpec) -> BerthResult<String> {
        let image_name = machine_image_name(&spec.container_name);

        if let Some(build) = spec.buildable() {
            self.build(machine_name, &image_name, build, spec.mem_limit)
                .await?;
        } else if let Some(image) = &spec.image {
            self.pull(machine_name, &image_name, image).await?;
        } else {
            return Err(BerthError::Provisioning(format!(
                "Neither a build source nor an image is defined for machine '{}'",
                machine_name
            )));
        }

        Ok(image_name)
    }

    async fn build(
        &self,
        machine_name: &str,
        image_name: &str,
        build: &BuildSpec,
        mem_limit: i64,
    ) -> BerthResult<()> {
        // Keeps the materialized Dockerfile alive until the build returns.
        let mut _workdir = None;
        let source = match (&build.dockerfile_content, &build.context) {
            (Some(content), _) => {
                let dir = tempfile::tempdir()?;
                let path = dir.path().join("Dockerfile");
                tokio::fs::write(&path, content).await?;
                _workdir = Some(dir);
                BuildSource::Dockerfile(path)
            }
            (None, Some(location)) => BuildSource::Context {
                location: location.clone(),
                dockerfile: build.dockerfile_path.clone(),
            },
            (None, None) => {
                return Err(BerthError::Provisioning(format!(
                    "Build source of machine '{}' is empty",
                    machine_name
                )));
            }
        };

        let mut build_args = self.options.build_args.clone();
        build_args.extend(build.args.iter().map(|(k, v)| (k.clone(), v.clone())));

        let params = BuildImageParams {
            source,
            repository: image_name.to_string(),
            force_pull: self.options.always_pull_image,
            remove_intermediate_containers: true,
            build_args,
            memory_limit: mem_limit,
            memory_swap_limit: -1,
            cpuset_cpus: self.options.cpuset_cpus.clone(),
            cpu_period: self.options.cpu_period,
            cpu_quota: self.options.cpu_quota,
            auth: self.options.registry_auth.clone(),
        };

        tracing::info!(machine = machine_name, image = image_name, "Building machine image");
        let image_id = self
            .engine
            .build_image(params, self.progress.clone())
            .await
            .map_err(|e| {
                BerthError::Provisioning(format!(
                    "Failed to build image for machine '{}': {}",
                    machine_name, e
                ))
            })?;
        tracing::debug!(machine = machine_name, image_id = %image_id, "Machine image built");
        Ok(())
    }

    async fn pull(&self, machine_name: &str, image_name: &str, location: &str) -> BerthResult<()> {
        let source = Snapshot::parse(location).ok_or_else(|| {
            BerthError::Provisioning(format!(
                "Machine source '{}' of machine '{}' is invalid: no repository defined",
                location, machine_name
            ))
        })?;

        let is_snapshot = is_snapshot_location(location);
        let via_registry = is_snapshot && self.options.snapshots.use_registry;
        let tag = source.tag_or_latest().to_string();
        let full_name = format!("{}:{}", source.full_repository(), tag);

        let must_pull = if is_snapshot {
            via_registry
        } else {
            self.options.always_pull_image || !self.exists_locally(&full_name).await
        };

        if must_pull {
            tracing::info!(machine = machine_name, image = %full_name, "Pulling machine image");
            self.engine
                .pull(
                    PullParams {
                        repository: source.repository.clone(),
                        tag: tag.clone(),
                        registry: source.registry.clone(),
                        auth: self.options.registry_auth.clone(),
                    },
                    self.progress.clone(),
                )
                .await
                .map_err(|e| match e {
                    EngineError::ImageNotFound(_) | EngineError::NotFound(_) => {
                        BerthError::SourceNotFound(format!(
                            "Image '{}' of machine '{}' not found",
                            full_name, machine_name
                        ))
                    }
                    other => BerthError::Provisioning(format!(
                        "Failed to pull image '{}' for machine '{}': {}",
                        full_name, machine_name, other
                    )),
                })?;
        }

        self.engine
            .tag(TagParams {
                image: full_name.clone(),
                repository: image_name.to_string(),
                tag: None,
            })
            .await
            .map_err(|e| match e {
                EngineError::ImageNotFound(_) => BerthError::SourceNotFound(format!(
                    "Image '{}' of machine '{}' not found",
                    full_name, machine_name
                )),
                other => BerthError::Provisioning(format!(
                    "Failed to tag image '{}' as '{}': {}",
                    full_name, image_name, other
                )),
            })?;

        if via_registry {
            // The machine tag keeps the layers; the registry name is not needed locally.
            if let Err(e) = self
                .engine
                .remove_image(RemoveImageParams {
                    image: full_name.clone(),
                    force: false,
                })
                .await
            {
                tracing::warn!(image = %full_name, error = %e, "Failed to remove pulled snapshot tag");
            }
        }

        Ok(())
    }

    async fn exists_locally(&self, reference: &str) -> bool {
        match self
            .engine
            .list_images(ListImagesParams {
                reference: Some(reference.to_string()),
            })
            .await
        {
            Ok(found) => !found.is_empty(),
            Err(e) => {
                tracing::warn!(image = reference, error = %e, "Failed to check local image, assuming absent");
                false
            }
        }
    }
}
