pub mod client;
pub mod error;
pub mod report;
pub mod settings;
pub mod task;

pub use client::{AvCheckClient, PollOptions};
pub use error::AvCheckError;
pub use report::{render_task, OutputFormat};
pub use settings::AvCheckSettings;
pub use task::{
    exceeds_threshold, EngineResult, Submission, SubmissionTarget, TaskData, TaskId, TaskKind,
    TaskStatus, Verdict,
};
