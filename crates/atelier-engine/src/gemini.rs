use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde_json::{json, Value};
use tracing::warn;

use crate::capability::{
    CapabilityRequest, CapabilityResponse, GenerationCapability, InlinePayload, ResponsePart,
    VerificationCapability,
};
use crate::error::{is_retryable_transport_error, CorrectionError};
use crate::{error_chain_text, non_empty_env, truncate_text};

pub const DEFAULT_GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-2.5-flash-image";

/// Connection settings for the Gemini `generateContent` endpoint.
#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub api_base: String,
    pub api_key: String,
    pub model: String,
    pub aspect_ratio: Option<String>,
    pub request_timeout: Duration,
    pub transport_retries: usize,
    pub retry_backoff: Duration,
}

impl GeminiConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_base: DEFAULT_GEMINI_API_BASE.to_string(),
            api_key: api_key.into(),
            model: DEFAULT_GEMINI_MODEL.to_string(),
            aspect_ratio: None,
            request_timeout: Duration::from_secs(90),
            transport_retries: 2,
            retry_backoff: Duration::from_millis(1200),
        }
    }

    /// Reads `GEMINI_API_KEY` (or `GOOGLE_API_KEY`), `GEMINI_API_BASE` and `GEMINI_MODEL`.
    pub fn from_env() -> Result<Self> {
        let api_key = non_empty_env("GEMINI_API_KEY")
            .or_else(|| non_empty_env("GOOGLE_API_KEY"))
            .context("GEMINI_API_KEY or GOOGLE_API_KEY not set")?;
        let mut config = Self::new(api_key);
        if let Some(api_base) = non_empty_env("GEMINI_API_BASE") {
            config.api_base = api_base.trim_end_matches('/').to_string();
        }
        if let Some(model) = non_empty_env("GEMINI_MODEL") {
            config.model = model;
        }
        Ok(config)
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn endpoint(&self) -> String {
        let trimmed = self.model.trim();
        let model_path = if trimmed.starts_with("models/") {
            trimmed.to_string()
        } else {
            format!("models/{trimmed}")
        };
        format!(
            "{}/{}:generateContent",
            self.api_base.trim_end_matches('/'),
            model_path
        )
    }
}

pub struct GeminiClient {
    config: GeminiConfig,
    http: HttpClient,
}

impl GeminiClient {
    pub fn new(config: GeminiConfig) -> Self {
        Self {
            config,
            http: HttpClient::new(),
        }
    }

    fn build_parts(request: &CapabilityRequest) -> Vec<Value> {
        let mut parts = vec![json!({ "text": request.prompt })];
        for image in &request.images {
            parts.push(json!({
                "inlineData": {
                    "mimeType": image.mime_type,
                    "data": BASE64.encode(&image.bytes),
                }
            }));
        }
        parts
    }

    fn build_payload(&self, request: &CapabilityRequest, modalities: &[&str]) -> Value {
        let mut generation_config = json!({
            "responseModalities": modalities,
        });
        if modalities.contains(&"IMAGE") {
            if let Some(aspect_ratio) = self
                .config
                .aspect_ratio
                .as_deref()
                .map(str::trim)
                .filter(|value| !value.is_empty())
            {
                generation_config["imageConfig"] = json!({ "aspectRatio": aspect_ratio });
            }
        }
        json!({
            "contents": [{
                "role": "user",
                "parts": Self::build_parts(request),
            }],
            "generationConfig": generation_config,
        })
    }

    fn post_with_transport_retries(&self, payload: &Value) -> Result<HttpResponse> {
        let endpoint = self.config.endpoint();
        let max_retries = self.config.transport_retries;
        let mut attempt = 0;
        loop {
            let response = self
                .http
                .post(&endpoint)
                .query(&[("key", self.config.api_key.as_str())])
                .timeout(self.config.request_timeout)
                .json(payload)
                .send();

            match response {
                Ok(ok) => return Ok(ok),
                Err(raw) => {
                    let err = anyhow::Error::new(raw)
                        .context(format!("Gemini request failed ({endpoint})"));
                    if !is_retryable_transport_error(&err) || attempt >= max_retries {
                        return Err(err);
                    }
                    attempt += 1;
                    warn!(
                        attempt,
                        max_retries,
                        error = %error_chain_text(&err, 300),
                        "Gemini transport retry after transient request failure"
                    );
                    thread::sleep(self.config.retry_backoff * attempt as u32);
                }
            }
        }
    }

    fn send(&self, request: &CapabilityRequest, modalities: &[&str]) -> Result<CapabilityResponse> {
        let payload = self.build_payload(request, modalities);
        let response = self.post_with_transport_retries(&payload)?;
        let body = response_json_or_error("Gemini", response)?;
        Self::parse_response(&body)
    }

    fn parse_response(payload: &Value) -> Result<CapabilityResponse> {
        let candidates = payload
            .get("candidates")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let mut parts_out = Vec::new();

        for candidate in candidates {
            let parts = candidate
                .get("content")
                .and_then(Value::as_object)
                .and_then(|content| content.get("parts"))
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            for part in parts {
                if let Some(text) = part.get("text").and_then(Value::as_str) {
                    parts_out.push(ResponsePart::Text(text.to_string()));
                    continue;
                }
                let Some(inline) = part
                    .get("inlineData")
                    .or_else(|| part.get("inline_data"))
                    .and_then(Value::as_object)
                else {
                    continue;
                };
                let data = match inline.get("data") {
                    None | Some(Value::Null) => continue,
                    Some(Value::String(text)) => InlinePayload::Base64(text.clone()),
                    Some(other) => {
                        let detail = format!(
                            "payload type mismatch: inline_data.data is {}",
                            value_kind(other)
                        );
                        return Err(anyhow::Error::new(CorrectionError::TransientCapability(
                            detail,
                        )));
                    }
                };
                let mime_type = inline
                    .get("mimeType")
                    .or_else(|| inline.get("mime_type"))
                    .and_then(Value::as_str)
                    .map(str::to_string);
                parts_out.push(ResponsePart::InlineData { mime_type, data });
            }
        }

        Ok(CapabilityResponse::new(parts_out))
    }
}

impl GenerationCapability for GeminiClient {
    fn name(&self) -> &str {
        "gemini"
    }

    fn generate(&self, request: &CapabilityRequest) -> Result<CapabilityResponse> {
        self.send(request, &["TEXT", "IMAGE"])
            .context("Gemini generation failed")
    }
}

impl VerificationCapability for GeminiClient {
    fn name(&self) -> &str {
        "gemini"
    }

    fn verify(&self, request: &CapabilityRequest) -> Result<String> {
        let response = self
            .send(request, &["TEXT"])
            .context("Gemini verification failed")?;
        let text = response.text_content();
        if text.is_empty() && response.has_inline_data() {
            bail!("could not convert inline_data part to text verdict");
        }
        Ok(text)
    }
}

fn response_json_or_error(provider: &str, response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .with_context(|| format!("{provider} response body read failed"))?;
    if !status.is_success() {
        bail!(
            "{provider} request failed ({code}): {}",
            truncate_text(&body, 512)
        );
    }
    let parsed: Value = serde_json::from_str(&body)
        .with_context(|| format!("{provider} returned invalid JSON payload"))?;
    Ok(parsed)
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
