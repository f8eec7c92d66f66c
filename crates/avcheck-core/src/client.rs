use std::{collections::BTreeMap, time::Duration};

use reqwest::{
    multipart::{Form, Part},
    Client, StatusCode,
};
use serde::{de::DeserializeOwned, Deserialize};
use tokio::time::sleep;
use tracing::{debug, instrument};

use crate::{
    error::{AvCheckError, Result},
    settings::AvCheckSettings,
    task::{
        exceeds_threshold, EngineResult, Submission, SubmissionTarget, TaskData, TaskId,
        TaskStatus,
    },
};

const CREATE_TASK_PATH: &str = "check/new/";
const TASK_STATUS_PATH: &str = "check/status/";
const MAX_BODY_SNIPPET: usize = 200;

/// Pacing for [`AvCheckClient::wait_for_task`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollOptions {
    pub interval: Duration,
    pub max_polls: u32,
}

impl Default for PollOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            max_polls: 12,
        }
    }
}

/// HTTP client for the AvCheck scanning service.
///
/// Holds only immutable state, so a single instance can be shared freely.
#[derive(Debug, Clone)]
pub struct AvCheckClient {
    http: Client,
    base_url: String,
    api_key: String,
}

impl AvCheckClient {
    /// Build a client, failing immediately when no API key is configured.
    pub fn new(settings: &AvCheckSettings) -> Result<Self> {
        let api_key = settings
            .api_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .ok_or(AvCheckError::ApiKeyMissing)?
            .to_string();
        let http = Client::builder()
            .user_agent(concat!("avcheck/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()?;
        Ok(Self {
            http,
            base_url: settings.endpoint.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    /// Build a client for the public endpoint with default settings.
    pub fn with_api_key(api_key: impl Into<String>) -> Result<Self> {
        Self::new(&AvCheckSettings::new(api_key))
    }

    pub fn endpoint(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    /// Submit a new scan task and return its identifier.
    #[instrument(skip_all, fields(task_type = %submission.kind()))]
    pub async fn create_new_task(&self, submission: &Submission) -> Result<TaskId> {
        submission.validate()?;

        let mut form = Form::new()
            .text("apikey", self.api_key.clone())
            .text("task_type", submission.kind().as_str());
        if !submission.engines.is_empty() {
            form = form.text("engines", submission.engines.join(","));
        }
        form = match &submission.target {
            SubmissionTarget::File(path) => {
                let bytes = tokio::fs::read(path).await.map_err(|err| {
                    AvCheckError::invalid_input(format!(
                        "failed to read {}: {err}",
                        path.display()
                    ))
                })?;
                let file_name = path
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "upload.bin".to_string());
                form.part("file", Part::bytes(bytes).file_name(file_name))
            }
            SubmissionTarget::Hash(value) | SubmissionTarget::Url(value) => {
                form.text("data", value.trim().to_string())
            }
        };

        let response = self
            .http
            .post(self.url(CREATE_TASK_PATH))
            .multipart(form)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        debug!(%status, "task submission answered");
        if !status.is_success() {
            return Err(AvCheckError::invalid_response(format!(
                "task submission returned {status}: {}",
                truncate(&body, MAX_BODY_SNIPPET)
            )));
        }

        let created = parse_envelope::<CreatedTask>(&body, "task submission")?.ok_or_else(|| {
            AvCheckError::invalid_response("task submission response is missing `data`")
        })?;
        match created.task_id {
            Some(task_id) if !task_id.as_str().trim().is_empty() => {
                debug!(%task_id, "task created");
                Ok(task_id)
            }
            _ => Err(AvCheckError::invalid_response(
                "task submission response is missing `task_id`",
            )),
        }
    }

    /// Fetch the current results of a task with a single status request.
    #[instrument(skip_all, fields(task_id = %task_id))]
    pub async fn get_task_data(&self, task_id: &TaskId) -> Result<TaskData> {
        if task_id.as_str().trim().is_empty() {
            return Err(AvCheckError::invalid_input("task id must not be blank"));
        }

        let response = self
            .http
            .post(self.url(TASK_STATUS_PATH))
            .form(&[
                ("apikey", self.api_key.as_str()),
                ("task_id", task_id.as_str()),
            ])
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        debug!(%status, "task status answered");
        if status == StatusCode::NOT_FOUND {
            return Err(AvCheckError::TaskNotFound {
                task_id: task_id.to_string(),
            });
        }
        if !status.is_success() {
            return Err(AvCheckError::invalid_response(format!(
                "task status returned {status}: {}",
                truncate(&body, MAX_BODY_SNIPPET)
            )));
        }

        let payload = parse_envelope::<StatusPayload>(&body, "task status")?.ok_or_else(|| {
            AvCheckError::TaskNotFound {
                task_id: task_id.to_string(),
            }
        })?;
        Ok(TaskData {
            task_id: task_id.clone(),
            status: payload.status,
            results: payload.results,
        })
    }

    /// Poll a task until it reaches a terminal status.
    ///
    /// Errors from individual status requests are returned as-is; only a
    /// pending task leads to another request.
    pub async fn wait_for_task(&self, task_id: &TaskId, options: &PollOptions) -> Result<TaskData> {
        let max_polls = options.max_polls.max(1);
        for poll in 1..=max_polls {
            let data = self.get_task_data(task_id).await?;
            if data.status.is_terminal() {
                return Ok(data);
            }
            debug!(%task_id, poll, status = ?data.status, "task still pending");
            if poll < max_polls {
                sleep(options.interval).await;
            }
        }
        Err(AvCheckError::TaskIncomplete {
            task_id: task_id.to_string(),
            polls: max_polls,
        })
    }

    /// Submit a task and wait for its results.
    pub async fn scan(&self, submission: &Submission, options: &PollOptions) -> Result<TaskData> {
        let task_id = self.create_new_task(submission).await?;
        self.wait_for_task(&task_id, options).await
    }

    /// Whether the total detections strictly exceed `detection_threshold`.
    pub fn is_detected(&self, task_data: &TaskData, detection_threshold: u32) -> bool {
        exceeds_threshold(task_data.total_detections(), detection_threshold)
    }

    /// Like [`Self::is_detected`], counting only the named engines.
    pub fn is_detected_by<S: AsRef<str>>(
        &self,
        task_data: &TaskData,
        engines: &[S],
        detection_threshold: u32,
    ) -> Result<bool> {
        let detections = task_data.detections_among(engines)?;
        Ok(exceeds_threshold(detections, detection_threshold))
    }
}

#[derive(Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    message: Option<String>,
    data: Option<T>,
}

#[derive(Deserialize)]
struct CreatedTask {
    #[serde(default)]
    task_id: Option<TaskId>,
}

#[derive(Deserialize)]
struct StatusPayload {
    status: TaskStatus,
    #[serde(default)]
    results: BTreeMap<String, EngineResult>,
}

fn parse_envelope<T: DeserializeOwned>(body: &str, operation: &str) -> Result<Option<T>> {
    let envelope: Envelope<T> = serde_json::from_str(body).map_err(|err| {
        AvCheckError::invalid_response(format!("failed to parse {operation} response: {err}"))
    })?;
    if !envelope.success {
        return Err(AvCheckError::invalid_response(format!(
            "{operation} rejected: {}",
            envelope
                .message
                .unwrap_or_else(|| "no message provided".to_string())
        )));
    }
    Ok(envelope.data)
}

fn truncate(input: &str, max_chars: usize) -> String {
    if input.chars().count() <= max_chars {
        return input.to_string();
    }
    input.chars().take(max_chars).collect::<String>() + "…"
}
