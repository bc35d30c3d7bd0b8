use std::env;
use std::path::Path;

use serde_json::{Map, Value};

pub mod batch;
pub mod capability;
pub mod correction;
pub mod dryrun;
pub mod error;
pub mod gemini;
pub mod prompt;

#[cfg(test)]
mod test_support;

pub use batch::{BatchConfig, BatchDriver, BatchReport, TaskReport, TaskStatus};
pub use capability::{
    decode_inline_payload, CapabilityRequest, CapabilityResponse, GenerationCapability,
    ImagePart, InlinePayload, ResponsePart, VerificationCapability,
};
pub use correction::{
    load_reference_assets, AttemptObserver, AttemptRecord, CorrectionConfig, CorrectionLoop,
    CorrectionOutcome, CorrectionResult, CorrectionTask, NO_IMAGE_AFTER_MAX_ATTEMPTS,
    NO_IMAGE_GENERATED, TRANSIENT_VERIFICATION_ERROR,
};
pub use dryrun::{DryrunGenerator, DryrunVerifier};
pub use error::{CorrectionError, TransientPatterns};
pub use gemini::{GeminiClient, GeminiConfig};
pub use prompt::{augment, augment_with, FeedbackLedger, DEFAULT_RETRY_SUFFIX};

pub(crate) fn error_chain_text(err: &anyhow::Error, max_chars: usize) -> String {
    let mut parts = Vec::new();
    for cause in err.chain() {
        let text = cause.to_string();
        let trimmed = text.trim();
        if trimmed.is_empty() {
            continue;
        }
        if parts
            .last()
            .map(|existing| existing == trimmed)
            .unwrap_or(false)
        {
            continue;
        }
        parts.push(trimmed.to_string());
    }
    if parts.is_empty() {
        return truncate_text(&err.to_string(), max_chars);
    }
    truncate_text(&parts.join(" | caused by: "), max_chars)
}

pub(crate) fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

pub(crate) fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub(crate) fn map_object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

pub(crate) fn mime_for_path(path: &Path) -> Option<&'static str> {
    let ext = path
        .extension()
        .and_then(|value| value.to_str())
        .map(|value| value.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "webp" => Some("image/webp"),
        "gif" => Some("image/gif"),
        _ => None,
    }
}

pub(crate) fn extension_for_mime(mime: &str) -> &'static str {
    match mime.trim().to_ascii_lowercase().as_str() {
        "image/jpeg" | "image/jpg" => "jpg",
        "image/webp" => "webp",
        "image/gif" => "gif",
        _ => "png",
    }
}
