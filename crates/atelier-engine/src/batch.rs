//! Sequential batch driver: one correction task per image in an input directory.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use atelier_contracts::events::{BatchEvent, EventPayload, EventWriter};
use atelier_contracts::runs::summary::{write_summary, BatchSummary};
use chrono::{SecondsFormat, Utc};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::capability::ImagePart;
use crate::correction::{
    load_reference_assets, AttemptRecord, CorrectionLoop, CorrectionOutcome, CorrectionTask,
};
use crate::error::CorrectionError;
use crate::{extension_for_mime, map_object};

const INPUT_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp"];
const OUTPUT_EXTENSIONS: &[&str] = &["png", "jpg", "webp", "gif"];

#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub input_dir: PathBuf,
    pub processed_dir: PathBuf,
    pub failed_dir: PathBuf,
    pub events_path: PathBuf,
    pub summary_path: PathBuf,
    pub output_prefix: String,
    /// Skip images whose processed output already exists. Advisory only.
    pub skip_existing: bool,
    pub max_images: Option<usize>,
    pub task_delay: Duration,
    pub batch_id: Option<String>,
}

impl BatchConfig {
    /// Standard layout under `base`: `processed/`, `failed/`, `events.jsonl`, `summary.json`.
    pub fn for_base_dir(base: &Path, input_dir: impl Into<PathBuf>) -> Self {
        Self {
            input_dir: input_dir.into(),
            processed_dir: base.join("processed"),
            failed_dir: base.join("failed"),
            events_path: base.join("events.jsonl"),
            summary_path: base.join("summary.json"),
            output_prefix: "processed_".to_string(),
            skip_existing: false,
            max_images: None,
            task_delay: Duration::from_secs(1),
            batch_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskStatus {
    Succeeded { output: PathBuf, attempts_used: u32 },
    Failed { reason: String, attempts_used: u32 },
    Skipped { output: PathBuf },
}

impl TaskStatus {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Succeeded { .. } => "succeeded",
            Self::Failed { .. } => "failed",
            Self::Skipped { .. } => "skipped",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskReport {
    pub image: PathBuf,
    pub status: TaskStatus,
}

#[derive(Debug, Clone)]
pub struct BatchReport {
    pub batch_id: String,
    pub tasks: Vec<TaskReport>,
    pub summary: BatchSummary,
}

impl BatchReport {
    pub fn has_failures(&self) -> bool {
        self.summary.failed > 0
    }
}

pub struct BatchDriver {
    correction_loop: CorrectionLoop,
    base_prompt: String,
    reference_paths: Vec<PathBuf>,
    max_attempts: u32,
    config: BatchConfig,
}

impl BatchDriver {
    pub fn new(
        correction_loop: CorrectionLoop,
        base_prompt: impl Into<String>,
        reference_paths: Vec<PathBuf>,
        max_attempts: u32,
        config: BatchConfig,
    ) -> Self {
        Self {
            correction_loop,
            base_prompt: base_prompt.into(),
            reference_paths,
            max_attempts,
            config,
        }
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    pub fn run(&self) -> Result<BatchReport> {
        let images = list_input_images(&self.config.input_dir, self.config.max_images)?;
        let references = load_reference_assets(&self.reference_paths)
            .context("reference assets could not be loaded")?;
        fs::create_dir_all(&self.config.processed_dir)
            .with_context(|| format!("failed creating {}", self.config.processed_dir.display()))?;
        fs::create_dir_all(&self.config.failed_dir)
            .with_context(|| format!("failed creating {}", self.config.failed_dir.display()))?;

        let batch_id = self
            .config
            .batch_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let events = EventWriter::new(&self.config.events_path, batch_id.clone());
        let started_at = now_iso();
        events.emit(
            BatchEvent::BatchStarted,
            map_object(json!({
                "input_dir": self.config.input_dir.to_string_lossy(),
                "total": images.len(),
                "max_attempts": self.max_attempts,
                "references": self.reference_paths
                    .iter()
                    .map(|path| path.to_string_lossy().to_string())
                    .collect::<Vec<String>>(),
                "generator": self.correction_loop.generator_name(),
                "verified": self.correction_loop.has_verifier(),
                "inconclusive_policy": self.correction_loop.config().inconclusive_policy.as_str(),
            })),
        )?;
        info!(batch_id = %batch_id, total = images.len(), "batch started");

        let stems = self.output_stems(&images);
        let mut tasks = Vec::with_capacity(images.len());
        let mut ran_any = false;
        for (index, (image_path, stem)) in images.iter().zip(&stems).enumerate() {
            if let Some(output) = self.existing_output(stem) {
                info!(image = %image_path.display(), "output exists; skipping");
                emit_or_warn(
                    &events,
                    BatchEvent::TaskSkipped,
                    map_object(json!({
                        "image": image_path.to_string_lossy(),
                        "output": output.to_string_lossy(),
                    })),
                );
                tasks.push(TaskReport {
                    image: image_path.clone(),
                    status: TaskStatus::Skipped { output },
                });
                continue;
            }
            if ran_any && !self.config.task_delay.is_zero() {
                thread::sleep(self.config.task_delay);
            }
            ran_any = true;
            info!(
                image = %image_path.display(),
                position = index + 1,
                total = images.len(),
                "processing image"
            );
            let status = self.run_task(&events, image_path, stem, &references);
            tasks.push(TaskReport {
                image: image_path.clone(),
                status,
            });
        }

        let summary = summarize(&batch_id, started_at, &tasks);
        let context = map_object(json!({
            "input_dir": self.config.input_dir.to_string_lossy(),
            "max_attempts": self.max_attempts,
            "generator": self.correction_loop.generator_name(),
            "verified": self.correction_loop.has_verifier(),
        }));
        write_summary(&self.config.summary_path, &summary, Some(&context))?;
        emit_or_warn(
            &events,
            BatchEvent::BatchFinished,
            map_object(json!({
                "total": summary.total,
                "succeeded": summary.succeeded,
                "failed": summary.failed,
                "skipped": summary.skipped,
                "success_rate": summary.success_rate(),
            })),
        );
        info!(
            batch_id = %batch_id,
            succeeded = summary.succeeded,
            failed = summary.failed,
            skipped = summary.skipped,
            success_rate = summary.success_rate(),
            "batch finished"
        );

        Ok(BatchReport {
            batch_id,
            tasks,
            summary,
        })
    }

    fn run_task(
        &self,
        events: &EventWriter,
        image_path: &Path,
        stem: &str,
        references: &[ImagePart],
    ) -> TaskStatus {
        let label = image_path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| image_path.to_string_lossy().to_string());

        let bytes = match fs::read(image_path) {
            Ok(bytes) => bytes,
            Err(err) => {
                let err = CorrectionError::UnreadableSubject {
                    path: image_path.to_path_buf(),
                    message: err.to_string(),
                };
                warn!(image = %image_path.display(), error = %err, "subject unreadable");
                let status = TaskStatus::Failed {
                    reason: err.to_string(),
                    attempts_used: 0,
                };
                self.finish_task(events, image_path, &status);
                return status;
            }
        };
        emit_or_warn(
            events,
            BatchEvent::TaskStarted,
            map_object(json!({
                "image": image_path.to_string_lossy(),
                "subject_sha256": hex::encode(Sha256::digest(&bytes)),
                "subject_bytes": bytes.len(),
            })),
        );

        let task = CorrectionTask::new(
            label,
            ImagePart::from_bytes(bytes),
            references.to_vec(),
            self.base_prompt.clone(),
            self.max_attempts,
        );
        let mut observer = |task: &CorrectionTask, record: &AttemptRecord| {
            let payload = map_object(json!({
                "image": image_path.to_string_lossy(),
                "task": task.label(),
                "attempt": record.attempt_number,
                "verdict": record.verdict.label(),
                "reason": record.verdict.reason(),
                "resolved": record.resolved.label(),
                "resolved_reason": record.resolved.reason(),
                "prompt_chars": record.effective_prompt.chars().count(),
                "image_mime": record.generated_image.as_ref().map(|image| image.mime_type.clone()),
                "image_bytes": record.generated_image.as_ref().map(|image| image.bytes.len()),
            }));
            if let Err(err) = events.emit(BatchEvent::AttemptFinished, payload) {
                warn!(task = task.label(), error = %err, "failed writing attempt event");
            }
        };
        let result = self.correction_loop.run_observed(&task, &mut observer);

        let status = match result.outcome {
            CorrectionOutcome::Success {
                image,
                attempts_used,
            } => {
                let output = self.output_path(stem, extension_for_mime(&image.mime_type));
                match fs::write(&output, &image.bytes) {
                    Ok(()) => {
                        info!(output = %output.display(), attempts_used, "image accepted");
                        TaskStatus::Succeeded {
                            output,
                            attempts_used,
                        }
                    }
                    Err(err) => {
                        warn!(
                            output = %output.display(),
                            error = %err,
                            "accepted image could not be written"
                        );
                        TaskStatus::Failed {
                            reason: format!("failed writing {}: {err}", output.display()),
                            attempts_used,
                        }
                    }
                }
            }
            CorrectionOutcome::Failure {
                last_reason,
                attempts_used,
            } => {
                warn!(
                    image = %image_path.display(),
                    attempts_used,
                    reason = %last_reason,
                    "image failed"
                );
                TaskStatus::Failed {
                    reason: last_reason,
                    attempts_used,
                }
            }
        };
        self.finish_task(events, image_path, &status);
        status
    }

    fn finish_task(&self, events: &EventWriter, image_path: &Path, status: &TaskStatus) {
        let mut payload = EventPayload::new();
        payload.insert(
            "image".to_string(),
            Value::String(image_path.to_string_lossy().to_string()),
        );
        payload.insert("status".to_string(), Value::String(status.label().to_string()));
        match status {
            TaskStatus::Succeeded {
                output,
                attempts_used,
            } => {
                payload.insert("output".to_string(), json!(output.to_string_lossy()));
                payload.insert("attempts_used".to_string(), json!(attempts_used));
            }
            TaskStatus::Failed {
                reason,
                attempts_used,
            } => {
                let copy = self.failed_copy_path(image_path);
                match fs::copy(image_path, &copy) {
                    Ok(_) => {
                        payload.insert("failed_copy".to_string(), json!(copy.to_string_lossy()));
                    }
                    Err(err) => warn!(
                        image = %image_path.display(),
                        error = %err,
                        "failed copying input to failed dir"
                    ),
                }
                payload.insert("reason".to_string(), json!(reason));
                payload.insert("attempts_used".to_string(), json!(attempts_used));
            }
            TaskStatus::Skipped { .. } => {}
        }
        emit_or_warn(events, BatchEvent::TaskFinished, payload);
    }

    /// Output stem per image, in listing order.
    ///
    /// Inputs that share a stem (`a.png`, `a.jpg`) would write the same
    /// `processed_a.<ext>`, so each of those also carries its source extension.
    fn output_stems(&self, images: &[PathBuf]) -> Vec<String> {
        let mut seen = HashMap::<String, usize>::new();
        for image in images {
            *seen.entry(file_stem(image).to_lowercase()).or_default() += 1;
        }
        images
            .iter()
            .map(|image| {
                let stem = file_stem(image);
                let shared = seen.get(&stem.to_lowercase()).copied().unwrap_or(0) > 1;
                match image.extension().and_then(|value| value.to_str()) {
                    Some(extension) if shared => format!(
                        "{}{stem}_{}",
                        self.config.output_prefix,
                        extension.to_ascii_lowercase()
                    ),
                    _ => format!("{}{stem}", self.config.output_prefix),
                }
            })
            .collect()
    }

    fn output_path(&self, stem: &str, extension: &str) -> PathBuf {
        self.config.processed_dir.join(format!("{stem}.{extension}"))
    }

    fn failed_copy_path(&self, image_path: &Path) -> PathBuf {
        match image_path.file_name() {
            Some(name) => self.config.failed_dir.join(name),
            None => self.config.failed_dir.join(file_stem(image_path)),
        }
    }

    fn existing_output(&self, stem: &str) -> Option<PathBuf> {
        if !self.config.skip_existing {
            return None;
        }
        OUTPUT_EXTENSIONS
            .iter()
            .map(|extension| self.output_path(stem, extension))
            .find(|candidate| candidate.is_file())
    }
}

/// A task or attempt event that cannot be written costs the log a line, not the batch.
fn emit_or_warn(events: &EventWriter, event: BatchEvent, payload: EventPayload) {
    if let Err(err) = events.emit(event, payload) {
        warn!(event = %event, error = %err, "failed writing batch event");
    }
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_else(|| "image".to_string())
}

/// Image files directly under `dir`, hidden files excluded, sorted by name.
pub fn list_input_images(dir: &Path, max_images: Option<usize>) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        bail!("input directory not found: {}", dir.display());
    }
    let mut images = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("failed listing {}", dir.display()))? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let hidden = path
            .file_name()
            .and_then(|name| name.to_str())
            .map(|name| name.starts_with('.'))
            .unwrap_or(true);
        if hidden {
            continue;
        }
        let extension = path
            .extension()
            .and_then(|value| value.to_str())
            .map(|value| value.to_ascii_lowercase())
            .unwrap_or_default();
        if INPUT_EXTENSIONS.contains(&extension.as_str()) {
            images.push(path);
        }
    }
    images.sort();
    if let Some(max_images) = max_images {
        images.truncate(max_images);
    }
    Ok(images)
}

fn summarize(batch_id: &str, started_at: String, tasks: &[TaskReport]) -> BatchSummary {
    let mut summary = BatchSummary {
        batch_id: batch_id.to_string(),
        started_at,
        finished_at: now_iso(),
        total: tasks.len() as u64,
        succeeded: 0,
        failed: 0,
        skipped: 0,
        failures: Vec::new(),
    };
    for task in tasks {
        match &task.status {
            TaskStatus::Succeeded { .. } => summary.succeeded += 1,
            TaskStatus::Skipped { .. } => summary.skipped += 1,
            TaskStatus::Failed {
                reason,
                attempts_used,
            } => {
                summary.failed += 1;
                summary.failures.push(map_object(json!({
                    "image": task.image.to_string_lossy(),
                    "reason": reason,
                    "attempts_used": attempts_used,
                })));
            }
        }
    }
    summary
}

fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
