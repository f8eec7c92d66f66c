use std::fmt::Write;

use serde::Serialize;

use crate::task::{exceeds_threshold, TaskData};

/// Format styles supported by [`render_task`].
#[derive(Debug, Clone, Copy)]
pub enum OutputFormat {
    Human,
    Json,
}

/// Produce a report string for a task evaluated against `threshold`.
pub fn render_task(
    data: &TaskData,
    threshold: u32,
    format: OutputFormat,
) -> anyhow::Result<String> {
    match format {
        OutputFormat::Human => render_human(data, threshold),
        OutputFormat::Json => Ok(serde_json::to_string_pretty(&JsonReport::new(
            data, threshold,
        ))?),
    }
}

fn render_human(data: &TaskData, threshold: u32) -> anyhow::Result<String> {
    let mut out = String::new();
    writeln!(out, "Task: {}", data.task_id)?;
    writeln!(out, "Status: {:?}", data.status)?;
    writeln!(out)?;

    if data.results.is_empty() {
        writeln!(out, "No engine results yet.")?;
    } else {
        writeln!(out, "Engines:")?;
        for (engine, result) in &data.results {
            let verdict = format!("{:?}", result.verdict).to_lowercase();
            match &result.threat {
                Some(threat) => writeln!(
                    out,
                    "  - {engine:<20} {verdict:<10} {threat}",
                    threat = sanitize(threat)
                )?,
                None => writeln!(out, "  - {engine:<20} {verdict}")?,
            }
        }
    }

    let detections = data.total_detections();
    writeln!(
        out,
        "\nDetections: {detections}/{engines} • Threshold: {threshold}",
        engines = data.results.len()
    )?;
    let detected_by: Vec<_> = data.detected_engines().map(|(name, _)| name).collect();
    if !detected_by.is_empty() {
        writeln!(out, "Detected by: {}", detected_by.join(", "))?;
    }
    let verdict = if exceeds_threshold(detections, threshold) {
        "DETECTED"
    } else {
        "clean"
    };
    writeln!(out, "Verdict: {verdict}")?;

    Ok(out)
}

fn sanitize(input: &str) -> String {
    input
        .chars()
        .map(|c| match c {
            '\n' | '\r' => ' ',
            _ => c,
        })
        .collect()
}

#[derive(Debug, Serialize)]
struct JsonReport<'a> {
    #[serde(flatten)]
    task: &'a TaskData,
    total_detections: u32,
    threshold: u32,
    detected: bool,
}

impl<'a> JsonReport<'a> {
    fn new(task: &'a TaskData, threshold: u32) -> Self {
        let total_detections = task.total_detections();
        Self {
            task,
            total_detections,
            threshold,
            detected: exceeds_threshold(total_detections, threshold),
        }
    }
}
