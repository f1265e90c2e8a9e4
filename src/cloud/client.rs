//! HTTP implementation of [`StatusClient`].

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{CloudError, StatusClient, UploadStatus};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Status client for the cloud REST API.
///
/// Issues `GET {api_url}/v2/project/{project_id}/upload/{upload_id}` with
/// bearer authentication. Non-2xx responses surface as [`CloudError::Http`]
/// so the poller can classify them.
#[derive(Clone)]
pub struct HttpStatusClient {
    http: reqwest::Client,
    api_url: String,
}

impl HttpStatusClient {
    pub fn new(api_url: impl Into<String>) -> Result<Self, CloudError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("flowshard/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| CloudError::Transport(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            api_url: api_url.into(),
        })
    }

    /// URL of the status resource for one upload.
    pub fn status_url(&self, upload_id: &str, project_id: &str) -> String {
        format!(
            "{}/v2/project/{}/upload/{}",
            self.api_url.trim_end_matches('/'),
            project_id,
            upload_id
        )
    }
}

#[async_trait]
impl StatusClient for HttpStatusClient {
    async fn fetch_status(
        &self,
        auth_token: &str,
        upload_id: &str,
        project_id: &str,
    ) -> Result<UploadStatus, CloudError> {
        let url = self.status_url(upload_id, project_id);

        let response = self
            .http
            .get(&url)
            .bearer_auth(auth_token)
            .send()
            .await
            .map_err(|e| {
                warn!(url = %url, error = %e, is_timeout = e.is_timeout(), "Status request failed");
                CloudError::Transport(e.to_string())
            })?;

        let status = response.status();
        debug!(url = %url, status = status.as_u16(), "Status response received");

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CloudError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| CloudError::Transport(format!("Failed to read response: {}", e)))?;

        serde_json::from_slice(&bytes).map_err(|e| CloudError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_url() {
        let client = HttpStatusClient::new("https://api.example.com/").unwrap();
        assert_eq!(
            client.status_url("up-42", "proj-7"),
            "https://api.example.com/v2/project/proj-7/upload/up-42"
        );
    }
}
