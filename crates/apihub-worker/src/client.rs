//! HTTP client for the worker protocol
//!
//! Speaks to the `/api/v1/builds` routes of the server:
//!
//! | call            | route                              |
//! |-----------------|------------------------------------|
//! | lease           | `GET  next-build?builder_id=...`   |
//! | fetch source    | `GET  {id}/source`                 |
//! | heartbeat, fail | `PUT  {id}/status`                 |
//! | publish         | `POST {id}/result`                 |

use apihub_common::types::{BuildResult, BuildSourcePayload, BuildView, StatusUpdate};
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;

use crate::config::WorkerConfig;
use crate::error::{Result, WorkerError};

/// What the server reports after committing a build result
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PublishReceipt {
    pub build_id: String,
    pub package_id: String,
    pub version: String,
    pub revision: i32,
}

/// The server side of the worker protocol
///
/// Abstracted so the worker loop can run against an in-memory queue in tests.
#[async_trait]
pub trait BuildBackend: Send + Sync {
    /// Lease the next eligible build, `None` when the queue has nothing ready
    async fn next_build(&self, builder_id: &str) -> Result<Option<BuildView>>;

    async fn build_source(&self, build_id: &str) -> Result<BuildSourcePayload>;

    async fn update_status(&self, build_id: &str, update: &StatusUpdate) -> Result<()>;

    async fn upload_result(&self, build_id: &str, result: &BuildResult) -> Result<PublishReceipt>;
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    code: String,
    message: String,
}

pub struct WorkerApiClient {
    client: Client,
    base_url: String,
}

impl WorkerApiClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("apihub-worker/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn from_config(config: &WorkerConfig) -> Result<Self> {
        Self::new(config.server_url.clone(), config.api_timeout())
    }

    fn builds_url(&self, path: &str) -> String {
        format!("{}/api/v1/builds/{}", self.base_url, path)
    }

    /// Check server health
    pub async fn health_check(&self) -> bool {
        let url = format!("{}/health", self.base_url);
        match self.client.get(&url).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    /// Turn a non-success response into [`WorkerError::Api`]
    async fn check(response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let text = response.text().await.unwrap_or_default();
        let (code, message) = match serde_json::from_str::<ErrorBody>(&text) {
            Ok(body) => (body.code, body.message),
            Err(_) => (
                status
                    .canonical_reason()
                    .unwrap_or("HttpError")
                    .replace(' ', ""),
                text,
            ),
        };
        Err(WorkerError::Api {
            status: status.as_u16(),
            code,
            message,
        })
    }

    async fn data<T: DeserializeOwned>(response: Response) -> Result<T> {
        let envelope: Envelope<T> = Self::check(response).await?.json().await?;
        Ok(envelope.data)
    }
}

#[async_trait]
impl BuildBackend for WorkerApiClient {
    async fn next_build(&self, builder_id: &str) -> Result<Option<BuildView>> {
        let response = self
            .client
            .get(self.builds_url("next-build"))
            .query(&[("builder_id", builder_id)])
            .send()
            .await?;

        if response.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        Ok(Some(Self::data(response).await?))
    }

    async fn build_source(&self, build_id: &str) -> Result<BuildSourcePayload> {
        let response = self
            .client
            .get(self.builds_url(&format!("{}/source", build_id)))
            .send()
            .await?;
        Self::data(response).await
    }

    async fn update_status(&self, build_id: &str, update: &StatusUpdate) -> Result<()> {
        let response = self
            .client
            .put(self.builds_url(&format!("{}/status", build_id)))
            .json(update)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn upload_result(&self, build_id: &str, result: &BuildResult) -> Result<PublishReceipt> {
        let response = self
            .client
            .post(self.builds_url(&format!("{}/result", build_id)))
            .json(result)
            .send()
            .await?;
        Self::data(response).await
    }
}
