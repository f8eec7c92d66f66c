mod config;
mod server;

use std::{
    path::{Path, PathBuf},
    process::ExitCode,
    sync::Arc,
    time::Duration,
};

use anyhow::{bail, Context, Result};
use avcheck_core::{
    render_task, AvCheckClient, AvCheckSettings, OutputFormat, PollOptions, Submission, TaskId,
    TaskStatus,
};
use clap::{Args, Parser, Subcommand};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use crate::config::ServerConfig;
use crate::server::AvCheckScanner;

const DETECTED_EXIT_CODE: u8 = 3;

#[derive(Parser, Debug)]
#[command(
    name = "avcheck",
    author,
    version,
    about = "AvCheck malware scanning client and upload gate"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Submit an artifact, wait for the scan and evaluate the detections
    Check {
        #[command(flatten)]
        target: TargetArgs,
        /// Restrict the scan to an engine (repeatable)
        #[arg(long = "engine", value_name = "ENGINE")]
        engines: Vec<String>,
        /// Flag the artifact when detections exceed this count
        #[arg(long, default_value_t = 0)]
        threshold: u32,
        /// Delay between status requests (e.g. `5s`, `500ms`)
        #[arg(
            long,
            value_name = "DURATION",
            default_value = "5s",
            value_parser = humantime::parse_duration
        )]
        poll_interval: Duration,
        /// Maximum number of status requests before giving up
        #[arg(long, default_value_t = 12)]
        max_polls: u32,
        /// Emit the report as JSON instead of human-readable text
        #[arg(long)]
        json: bool,
    },
    /// Fetch the current results of an existing task
    Status {
        task_id: String,
        #[arg(long, default_value_t = 0)]
        threshold: u32,
        /// Emit the report as JSON instead of human-readable text
        #[arg(long)]
        json: bool,
    },
    /// Run the upload server that rejects malicious executables
    Serve {
        /// Server configuration file (TOML, YAML or JSON)
        #[arg(long, value_name = "FILE")]
        config: Option<PathBuf>,
        /// Address to listen on, overriding the configuration
        #[arg(long, value_name = "ADDR")]
        bind: Option<String>,
        /// Directory receiving accepted uploads, overriding the configuration
        #[arg(long, value_name = "DIR")]
        upload_dir: Option<PathBuf>,
    },
}

#[derive(Args, Debug)]
#[group(required = true, multiple = false)]
struct TargetArgs {
    /// Local file to upload
    #[arg(long, value_name = "PATH")]
    file: Option<PathBuf>,
    /// MD5, SHA-1 or SHA-256 digest to look up
    #[arg(long, value_name = "HASH")]
    hash: Option<String>,
    /// URL to scan
    #[arg(long, value_name = "URL")]
    url: Option<String>,
}

impl TargetArgs {
    fn into_submission(self) -> Result<Submission> {
        match (self.file, self.hash, self.url) {
            (Some(path), _, _) => Ok(Submission::file(path)),
            (_, Some(hash), _) => Ok(Submission::hash(hash)),
            (_, _, Some(url)) => Ok(Submission::url(url)),
            (None, None, None) => bail!("one of --file, --hash or --url is required"),
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<ExitCode> {
    init_tracing();
    let cli = Cli::parse();
    match cli.command {
        Commands::Check {
            target,
            engines,
            threshold,
            poll_interval,
            max_polls,
            json,
        } => {
            let submission = target.into_submission()?.with_engines(engines);
            let poll = PollOptions {
                interval: poll_interval,
                max_polls,
            };
            check(&submission, threshold, &poll, output_format(json)).await
        }
        Commands::Status {
            task_id,
            threshold,
            json,
        } => {
            status(&TaskId::new(task_id), threshold, output_format(json)).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Serve {
            config,
            bind,
            upload_dir,
        } => {
            serve(config.as_deref(), bind, upload_dir).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn output_format(json: bool) -> OutputFormat {
    if json {
        OutputFormat::Json
    } else {
        OutputFormat::Human
    }
}

fn client_from_env() -> Result<AvCheckClient> {
    let client = AvCheckClient::new(&AvCheckSettings::from_env())
        .context("failed to initialise AvCheck client")?;
    debug!(endpoint = client.endpoint(), "AvCheck client ready");
    Ok(client)
}

async fn check(
    submission: &Submission,
    threshold: u32,
    poll: &PollOptions,
    format: OutputFormat,
) -> Result<ExitCode> {
    let client = client_from_env()?;
    let task_id = client
        .create_new_task(submission)
        .await
        .context("failed to create scan task")?;
    info!(%task_id, "new task created");
    let data = client
        .wait_for_task(&task_id, poll)
        .await
        .with_context(|| format!("failed to retrieve results for task {task_id}"))?;

    if data.status != TaskStatus::Completed {
        bail!("task {task_id} ended with status {:?}", data.status);
    }

    let rendered = render_task(&data, threshold, format)?;
    println!("{}", rendered.trim_end());
    if client.is_detected(&data, threshold) {
        return Ok(ExitCode::from(DETECTED_EXIT_CODE));
    }
    Ok(ExitCode::SUCCESS)
}

async fn status(task_id: &TaskId, threshold: u32, format: OutputFormat) -> Result<()> {
    let client = client_from_env()?;
    let data = client
        .get_task_data(task_id)
        .await
        .with_context(|| format!("failed to retrieve results for task {task_id}"))?;
    let rendered = render_task(&data, threshold, format)?;
    println!("{}", rendered.trim_end());
    Ok(())
}

async fn serve(
    config_path: Option<&Path>,
    bind: Option<String>,
    upload_dir: Option<PathBuf>,
) -> Result<()> {
    let mut config = ServerConfig::load(config_path).with_context(|| match config_path {
        Some(path) => format!("failed to load server configuration from {}", path.display()),
        None => "failed to load server configuration".to_string(),
    })?;
    if let Some(bind) = bind {
        config.bind = bind;
    }
    if let Some(upload_dir) = upload_dir {
        config.upload_dir = upload_dir;
    }

    let client = client_from_env()?;
    let scanner = AvCheckScanner::new(client, config.detection_threshold, config.poll_options());
    server::serve(config, Arc::new(scanner)).await
}

fn init_tracing() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,tokio=warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .try_init();
}
