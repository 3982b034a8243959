// Authoritative recording backend
//
// The backend owns the long-lived record of which cameras are recording. The
// registry asks it two questions and never treats a negative or missing
// answer as a reason to drop local state.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::recording::StartRequest;

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("no backend configured")]
    Disabled,

    #[error("backend request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid backend URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
}

/// Backend's view of one camera
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackendRecording {
    pub is_recording: bool,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub camera_name: Option<String>,
    #[serde(default)]
    pub source_url: Option<String>,
    #[serde(default)]
    pub scenario_id: Option<String>,
    #[serde(default)]
    pub scenario_name: Option<String>,
}

impl BackendRecording {
    /// Start request for adopting this recording locally. None without a
    /// source address, since there is nothing to capture from.
    pub fn to_start_request(&self, camera_id: &str) -> Option<StartRequest> {
        let source_url = self.source_url.clone().filter(|u| !u.trim().is_empty())?;
        Some(StartRequest {
            camera_id: camera_id.to_string(),
            camera_name: self
                .camera_name
                .clone()
                .unwrap_or_else(|| camera_id.to_string()),
            source_url,
            scenario_id: self.scenario_id.clone(),
            scenario_name: self.scenario_name.clone(),
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EarliestStart {
    started_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait RecordingBackend: Send + Sync + 'static {
    /// Is this camera recording, according to the backend
    async fn recording_status(&self, camera_id: &str) -> Result<BackendRecording, BackendError>;

    /// Earliest start among all recordings the backend considers active
    async fn earliest_active_start(&self) -> Result<Option<DateTime<Utc>>, BackendError>;
}

/// Backend reached over HTTP/JSON
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: reqwest::Url,
}

impl HttpBackend {
    pub fn new(base_url: &str) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Self::with_client(client, base_url)
    }

    pub fn with_client(client: reqwest::Client, base_url: &str) -> Result<Self, BackendError> {
        let invalid = |reason: String| BackendError::InvalidUrl {
            url: base_url.to_string(),
            reason,
        };
        let base_url = reqwest::Url::parse(base_url).map_err(|e| invalid(e.to_string()))?;
        if base_url.cannot_be_a_base() {
            return Err(invalid("not a base URL".into()));
        }
        Ok(Self { client, base_url })
    }

    /// Base URL plus `segments`, each percent-encoded as one path segment
    fn url(&self, segments: &[&str]) -> reqwest::Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }
}

#[async_trait]
impl RecordingBackend for HttpBackend {
    async fn recording_status(&self, camera_id: &str) -> Result<BackendRecording, BackendError> {
        let record = self
            .client
            .get(self.url(&["recordings", camera_id]))
            .send()
            .await?
            .error_for_status()?
            .json::<BackendRecording>()
            .await?;
        Ok(record)
    }

    async fn earliest_active_start(&self) -> Result<Option<DateTime<Utc>>, BackendError> {
        let body = self
            .client
            .get(self.url(&["recordings", "earliest-start"]))
            .send()
            .await?
            .error_for_status()?
            .json::<EarliestStart>()
            .await?;
        Ok(body.started_at)
    }
}

/// Used when no backend is configured. Always unavailable, which the
/// registry treats as "no information".
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledBackend;

#[async_trait]
impl RecordingBackend for DisabledBackend {
    async fn recording_status(&self, _camera_id: &str) -> Result<BackendRecording, BackendError> {
        Err(BackendError::Disabled)
    }

    async fn earliest_active_start(&self) -> Result<Option<DateTime<Utc>>, BackendError> {
        Err(BackendError::Disabled)
    }
}
