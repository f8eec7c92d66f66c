use std::{
    collections::BTreeMap,
    fmt, fs,
    path::{Path, PathBuf},
};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{AvCheckError, Result};

static HASH_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:[0-9A-Fa-f]{32}|[0-9A-Fa-f]{40}|[0-9A-Fa-f]{64})$")
        .expect("hash pattern should compile")
});

/// Opaque identifier returned by the task submission call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for TaskId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

// The service is inconsistent about encoding ids as strings or numbers.
impl<'de> Deserialize<'de> for TaskId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum RawId {
            Text(String),
            Unsigned(u64),
            Signed(i64),
        }

        Ok(match RawId::deserialize(deserializer)? {
            RawId::Text(text) => Self(text),
            RawId::Unsigned(number) => Self(number.to_string()),
            RawId::Signed(number) => Self(number.to_string()),
        })
    }
}

/// Kind of artifact submitted for scanning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    File,
    Hash,
    Url,
}

impl TaskKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Hash => "hash",
            Self::Url => "url",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Artifact carried by a [`Submission`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmissionTarget {
    File(PathBuf),
    Hash(String),
    Url(String),
}

/// Parameters of a new scan task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub target: SubmissionTarget,
    /// Restrict the scan to these engines; empty means the service default.
    pub engines: Vec<String>,
}

impl Submission {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self::from_target(SubmissionTarget::File(path.into()))
    }

    pub fn hash(hash: impl Into<String>) -> Self {
        Self::from_target(SubmissionTarget::Hash(hash.into()))
    }

    pub fn url(url: impl Into<String>) -> Self {
        Self::from_target(SubmissionTarget::Url(url.into()))
    }

    fn from_target(target: SubmissionTarget) -> Self {
        Self {
            target,
            engines: Vec::new(),
        }
    }

    pub fn with_engines<I, S>(mut self, engines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.engines = engines.into_iter().map(Into::into).collect();
        self
    }

    pub fn kind(&self) -> TaskKind {
        match self.target {
            SubmissionTarget::File(_) => TaskKind::File,
            SubmissionTarget::Hash(_) => TaskKind::Hash,
            SubmissionTarget::Url(_) => TaskKind::Url,
        }
    }

    /// Check the submission locally before anything is sent upstream.
    pub fn validate(&self) -> Result<()> {
        if let Some(engine) = self.engines.iter().find(|e| e.trim().is_empty()) {
            return Err(AvCheckError::invalid_input(format!(
                "engine names must not be blank (got `{engine}`)"
            )));
        }
        match &self.target {
            SubmissionTarget::File(path) => validate_file(path),
            SubmissionTarget::Hash(hash) => {
                if HASH_PATTERN.is_match(hash.trim()) {
                    Ok(())
                } else {
                    Err(AvCheckError::invalid_input(format!(
                        "`{hash}` is not an MD5, SHA-1 or SHA-256 hex digest"
                    )))
                }
            }
            SubmissionTarget::Url(raw) => {
                let url = reqwest::Url::parse(raw.trim()).map_err(|err| {
                    AvCheckError::invalid_input(format!("`{raw}` is not a valid URL: {err}"))
                })?;
                match url.scheme() {
                    "http" | "https" => Ok(()),
                    other => Err(AvCheckError::invalid_input(format!(
                        "unsupported URL scheme `{other}` (expected http or https)"
                    ))),
                }
            }
        }
    }
}

fn validate_file(path: &Path) -> Result<()> {
    let metadata = fs::metadata(path).map_err(|_| {
        AvCheckError::invalid_input(format!("file {} does not exist", path.display()))
    })?;
    if !metadata.is_file() {
        return Err(AvCheckError::invalid_input(format!(
            "{} is not a regular file",
            path.display()
        )));
    }
    if metadata.len() == 0 {
        return Err(AvCheckError::invalid_input(format!(
            "file {} is empty",
            path.display()
        )));
    }
    Ok(())
}

/// Processing state reported for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    #[serde(other)]
    Unknown,
}

impl TaskStatus {
    /// Whether the service will not update the task any further.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Verdict of a single engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Clean,
    #[serde(alias = "infected", alias = "detected")]
    Malicious,
    Suspicious,
    Error,
    #[serde(other)]
    Unknown,
}

impl Verdict {
    pub fn is_detection(self) -> bool {
        matches!(self, Self::Malicious)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineResult {
    pub verdict: Verdict,
    /// Signature name reported alongside a detection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threat: Option<String>,
}

/// Results of a task as returned by the status endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskData {
    pub task_id: TaskId,
    pub status: TaskStatus,
    /// Engine name to verdict, ordered by engine name.
    pub results: BTreeMap<String, EngineResult>,
}

impl TaskData {
    pub fn total_detections(&self) -> u32 {
        self.results
            .values()
            .filter(|result| result.verdict.is_detection())
            .count() as u32
    }

    /// Look up a single engine's result.
    pub fn engine(&self, name: &str) -> Result<&EngineResult> {
        self.results
            .get(name)
            .ok_or_else(|| AvCheckError::EngineNotFound {
                engine: name.to_string(),
            })
    }

    /// Detections counted only among `engines`; every name must be present.
    pub fn detections_among<S: AsRef<str>>(&self, engines: &[S]) -> Result<u32> {
        if engines.is_empty() {
            return Ok(self.total_detections());
        }
        let mut detections = 0;
        for name in engines {
            if self.engine(name.as_ref())?.verdict.is_detection() {
                detections += 1;
            }
        }
        Ok(detections)
    }

    pub fn detected_engines(&self) -> impl Iterator<Item = (&str, &EngineResult)> {
        self.results
            .iter()
            .filter(|(_, result)| result.verdict.is_detection())
            .map(|(name, result)| (name.as_str(), result))
    }
}

/// Detection is flagged only when detections strictly exceed the threshold.
pub fn exceeds_threshold(detections: u32, threshold: u32) -> bool {
    detections > threshold
}
