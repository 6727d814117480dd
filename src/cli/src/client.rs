//! HTTP client for the modelsync server API.

use anyhow::{Context, Result};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// API response wrapper matching the server's `ApiResponse` format.
#[derive(Debug, serde::Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

/// HTTP client for the modelsync API.
pub struct ApiClient {
    client: Client,
    base_url: String,
}

impl ApiClient {
    /// Create a new API client pointing at the given base URL.
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Return the configured base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Perform a GET request and unwrap the `ApiResponse` data.
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.url(path);
        let resp = ensure_success(send(self.client.get(&url), "GET", &url).await?).await?;

        let api_resp: ApiResponse<T> = resp
            .json()
            .await
            .with_context(|| format!("Failed to parse response from {}", url))?;

        match (api_resp.success, api_resp.data) {
            (true, Some(data)) => Ok(data),
            (true, None) => anyhow::bail!("{} returned success without data", path),
            (false, _) => anyhow::bail!(
                "{} failed: {}",
                path,
                api_resp.error.as_deref().unwrap_or("unknown error")
            ),
        }
    }

    /// Perform a raw GET request and return the full JSON value.
    pub async fn get_raw(&self, path: &str) -> Result<serde_json::Value> {
        let url = self.url(path);
        let resp = ensure_success(send(self.client.get(&url), "GET", &url).await?).await?;

        resp.json()
            .await
            .with_context(|| format!("Failed to parse response from {}", url))
    }

    /// POST a JSON body and return the status with the decoded JSON body,
    /// error statuses included.
    pub async fn post_json<B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<(StatusCode, serde_json::Value)> {
        let url = self.url(path);
        let resp = send(self.client.post(&url).json(body), "POST", &url).await?;

        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        let value = serde_json::from_str(&text)
            .unwrap_or_else(|_| serde_json::Value::String(text));
        Ok((status, value))
    }
}

/// Turn a non-2xx status into an error carrying the response body.
async fn ensure_success(resp: reqwest::Response) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    anyhow::bail!("API error ({}): {}", status, body)
}

async fn send(request: RequestBuilder, method: &str, url: &str) -> Result<reqwest::Response> {
    request
        .send()
        .await
        .with_context(|| format!("{} {} failed", method, url))
}
