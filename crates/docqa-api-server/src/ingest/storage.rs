use crate::config::StorageConfig;
use crate::utils::error::ApiError;
use reqwest::Client;
use tracing::debug;

/// Blob store client: PDFs are addressed by path under the storage base URL
/// and fetched with the service key.
pub struct BlobStore {
    client: Client,
    config: StorageConfig,
}

impl BlobStore {
    pub fn new(config: StorageConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()?;

        Ok(Self { client, config })
    }

    pub async fn download(&self, path: &str) -> Result<Vec<u8>, ApiError> {
        let url = format!(
            "{}/{}",
            self.config.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        );

        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.config.service_key)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ApiError::UpstreamTimeout(format!("blob download timed out: {}", e))
                } else {
                    ApiError::ServiceUnavailable(format!("blob store unreachable: {}", e))
                }
            })?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(ApiError::NotFound(format!("no blob at '{}'", path)));
        }
        if !response.status().is_success() {
            return Err(ApiError::ServiceUnavailable(format!(
                "blob store returned {} for '{}'",
                response.status(),
                path
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| ApiError::ServiceUnavailable(format!("blob read failed: {}", e)))?;

        debug!("Downloaded blob '{}' ({} bytes)", path, bytes.len());

        Ok(bytes.to_vec())
    }
}
