//! HTTP control plane of the inference backend: one-shot stream validation
//! plus the start/stop/status commands.
//!
//! Expected failures come back as `Err` values carrying the backend's
//! `detail` string verbatim; nothing here panics or retries.  The one
//! normalization rule: stopping inference that is already stopped is a
//! success, not an error (the liveness path or another tab may have beaten
//! us to it).

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::{Result, SessionError};

/// Backend detail substring that marks a stop as already done.
const STOP_NOT_RUNNING_MARKER: &str = "No active inference running";

/// Outcome of the per-camera status query.  `Unknown` covers transport
/// errors and unparseable bodies; callers treat it as "assume still active".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InferenceStatus {
    Active,
    Inactive,
    Unknown(String),
}

/// Outcome of a stop command.  `NotRunning` is the idempotent case: the
/// backend had nothing to stop, which callers present as "ready to start".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped(String),
    NotRunning,
}

#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// One-shot reachability gate for a source URI before any session is
    /// opened.  No retries; the user fixes the input and retries explicitly.
    async fn check_stream(&self, source_uri: &str) -> Result<()>;

    /// Ask the backend to start pulling and processing `source_uri`.
    /// Returns the backend's success message.
    async fn start_inference(
        &self,
        user_id: &str,
        camera_id: &str,
        source_uri: &str,
    ) -> Result<String>;

    async fn stop_inference(&self, camera_id: &str) -> Result<StopOutcome>;

    /// Whether the backend is still producing frames for `camera_id`.  Used
    /// by the supervisor to disambiguate silence from real termination.
    async fn inference_status(&self, camera_id: &str) -> InferenceStatus;
}

#[derive(Serialize)]
struct StartRequest<'a> {
    user_id: &'a str,
    camera_id: &'a str,
    rtsp_url: &'a str,
}

#[derive(Serialize)]
struct StopRequest<'a> {
    camera_id: &'a str,
}

#[derive(Deserialize)]
struct DetailBody {
    #[serde(default)]
    detail: Option<String>,
}

#[derive(Deserialize)]
struct MessageBody {
    #[serde(default)]
    message: Option<String>,
}

#[derive(Deserialize)]
struct StatusBody {
    active: bool,
}

/// reqwest-backed control plane.
pub struct HttpControlPlane {
    client: Client,
    base_url: String,
}

impl HttpControlPlane {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url)
    }
}

/// Pull the `detail` string out of a non-2xx response body, falling back to
/// a generic message with the status code.
async fn error_detail(response: reqwest::Response, fallback: &str) -> String {
    let status = response.status();
    match response.json::<DetailBody>().await {
        Ok(DetailBody { detail: Some(detail) }) => detail,
        _ => format!("{fallback} (HTTP {status})"),
    }
}

fn normalize_stop_failure(detail: String) -> Result<StopOutcome> {
    if detail.contains(STOP_NOT_RUNNING_MARKER) {
        Ok(StopOutcome::NotRunning)
    } else {
        Err(SessionError::Control(detail))
    }
}

#[async_trait]
impl ControlPlane for HttpControlPlane {
    async fn check_stream(&self, source_uri: &str) -> Result<()> {
        let response = self
            .client
            .get(self.url("check-stream"))
            .query(&[("rtsp_url", source_uri)])
            .send()
            .await
            .map_err(|err| SessionError::Validation(err.to_string()))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(SessionError::Validation(
                error_detail(response, "stream validation failed").await,
            ))
        }
    }

    async fn start_inference(
        &self,
        user_id: &str,
        camera_id: &str,
        source_uri: &str,
    ) -> Result<String> {
        let response = self
            .client
            .post(self.url("start-inference"))
            .json(&StartRequest {
                user_id,
                camera_id,
                rtsp_url: source_uri,
            })
            .send()
            .await
            .map_err(|err| SessionError::Control(err.to_string()))?;
        if response.status().is_success() {
            let message = response
                .json::<MessageBody>()
                .await
                .ok()
                .and_then(|body| body.message)
                .unwrap_or_else(|| "inference started".to_string());
            Ok(message)
        } else {
            Err(SessionError::Control(
                error_detail(response, "failed to start inference").await,
            ))
        }
    }

    async fn stop_inference(&self, camera_id: &str) -> Result<StopOutcome> {
        let response = self
            .client
            .post(self.url("stop-inference"))
            .json(&StopRequest { camera_id })
            .send()
            .await
            .map_err(|err| SessionError::Control(err.to_string()))?;
        if response.status().is_success() {
            let message = response
                .json::<MessageBody>()
                .await
                .ok()
                .and_then(|body| body.message)
                .unwrap_or_else(|| "inference stopped".to_string());
            Ok(StopOutcome::Stopped(message))
        } else {
            normalize_stop_failure(error_detail(response, "failed to stop inference").await)
        }
    }

    async fn inference_status(&self, camera_id: &str) -> InferenceStatus {
        let response = match self
            .client
            .get(self.url("inference-status"))
            .query(&[("camera_id", camera_id)])
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => return InferenceStatus::Unknown(err.to_string()),
        };
        if !response.status().is_success() {
            return InferenceStatus::Unknown(format!(
                "status endpoint returned HTTP {}",
                response.status()
            ));
        }
        match response.json::<StatusBody>().await {
            Ok(StatusBody { active: true }) => InferenceStatus::Active,
            Ok(StatusBody { active: false }) => InferenceStatus::Inactive,
            Err(err) => InferenceStatus::Unknown(err.to_string()),
        }
    }
}
