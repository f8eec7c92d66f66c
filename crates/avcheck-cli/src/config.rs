use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{bail, Context, Result};
use avcheck_core::PollOptions;
use config::{Config, Environment, File};
use serde::Deserialize;

/// Settings for the upload server, layered from defaults, an optional file and
/// `AVCHECK_SERVER_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServerConfig {
    pub bind: String,
    pub upload_dir: PathBuf,
    pub max_upload_bytes: usize,
    /// Extensions (with leading dot) whose uploads are scanned before acceptance.
    pub scan_extensions: Vec<String>,
    pub detection_threshold: u32,
    pub poll_interval_secs: u64,
    pub max_polls: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:5000".to_string(),
            upload_dir: PathBuf::from("uploads"),
            max_upload_bytes: 50 * 1024 * 1024,
            scan_extensions: vec![".exe".to_string(), ".msi".to_string()],
            detection_threshold: 0,
            poll_interval_secs: 5,
            max_polls: 12,
        }
    }
}

impl ServerConfig {
    const ENV_PREFIX: &'static str = "AVCHECK_SERVER";

    pub fn load(path: Option<&Path>) -> Result<Self> {
        let defaults = Self::default();
        let mut builder = Config::builder()
            .set_default("bind", defaults.bind)?
            .set_default(
                "upload_dir",
                defaults.upload_dir.to_string_lossy().into_owned(),
            )?
            .set_default("max_upload_bytes", defaults.max_upload_bytes as i64)?
            .set_default("scan_extensions", defaults.scan_extensions)?
            .set_default("detection_threshold", i64::from(defaults.detection_threshold))?
            .set_default("poll_interval_secs", defaults.poll_interval_secs as i64)?
            .set_default("max_polls", i64::from(defaults.max_polls))?;
        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }
        builder = builder.add_source(
            Environment::with_prefix(Self::ENV_PREFIX)
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("scan_extensions"),
        );

        let mut config: Self = builder
            .build()
            .context("failed to assemble server configuration")?
            .try_deserialize()
            .context("invalid server configuration")?;
        config.normalize()?;
        Ok(config)
    }

    fn normalize(&mut self) -> Result<()> {
        if self.max_upload_bytes == 0 {
            bail!("max_upload_bytes must be greater than zero");
        }
        self.scan_extensions = self
            .scan_extensions
            .iter()
            .map(|ext| ext.trim().to_lowercase())
            .filter(|ext| !ext.is_empty())
            .map(|ext| {
                if ext.starts_with('.') {
                    ext
                } else {
                    format!(".{ext}")
                }
            })
            .collect();
        Ok(())
    }

    /// Whether a sanitized file name carries one of the scanned extensions.
    pub fn should_scan(&self, filename: &str) -> bool {
        let extension = match Path::new(filename).extension() {
            Some(ext) => format!(".{}", ext.to_string_lossy().to_lowercase()),
            None => return false,
        };
        self.scan_extensions.iter().any(|ext| *ext == extension)
    }

    pub fn poll_options(&self) -> PollOptions {
        PollOptions {
            interval: Duration::from_secs(self.poll_interval_secs),
            max_polls: self.max_polls,
        }
    }
}
