//! Docker registry HTTP API, limited to what snapshot removal needs.

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// The registry answered with a non-success status.
    #[error("registry responded with status {status}: {body}")]
    Status { status: u16, body: String },

    /// The request never got an answer.
    #[error("registry request failed: {0}")]
    Transport(String),
}

/// Registry operations used by the snapshot pipeline.
#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// `DELETE /v2/<repository>/manifests/<digest>`
    async fn delete_manifest(
        &self,
        registry: &str,
        repository: &str,
        digest: &str,
    ) -> Result<(), RegistryError>;
}

pub(crate) fn manifest_url(registry: &str, repository: &str, digest: &str) -> String {
    format!("http://{}/v2/{}/manifests/{}", registry, repository, digest)
}

#[cfg(feature = "registry-http")]
pub use http::HttpRegistryClient;

#[cfg(feature = "registry-http")]
mod http {
    use super::{RegistryClient, RegistryError, manifest_url};
    use async_trait::async_trait;
    use reqwest::Client;

    /// Plain-HTTP registry client backed by reqwest.
    #[derive(Clone, Debug, Default)]
    pub struct HttpRegistryClient {
        client: Client,
    }

    impl HttpRegistryClient {
        pub fn new() -> Self {
            Self {
                client: Client::new(),
            }
        }
    }

    #[async_trait]
    impl RegistryClient for HttpRegistryClient {
        async fn delete_manifest(
            &self,
            registry: &str,
            repository: &str,
            digest: &str,
        ) -> Result<(), RegistryError> {
            let url = manifest_url(registry, repository, digest);
            tracing::debug!(%url, "Deleting registry manifest");

            let response = self
                .client
                .delete(&url)
                .send()
                .await
                .map_err(|e| RegistryError::Transport(e.to_string()))?;

            let status = response.status();
            if status.is_success() {
                return Ok(());
            }

            let body = response.text().await.unwrap_or_default();
            Err(RegistryError::Status {
                status: status.as_u16(),
                body,
            })
        }
    }
}
