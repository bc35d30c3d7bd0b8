use std::io::Cursor;

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::{ImageFormat, Rgb, RgbImage};
use sha2::{Digest, Sha256};

use crate::capability::{
    CapabilityRequest, CapabilityResponse, GenerationCapability, InlinePayload, ResponsePart,
    VerificationCapability,
};

/// Offline generator: a solid-color PNG whose color is derived from the prompt
/// and the last request image, returned base64-encoded like a remote model would.
#[derive(Debug, Clone)]
pub struct DryrunGenerator {
    width: u32,
    height: u32,
}

impl DryrunGenerator {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width: width.max(1),
            height: height.max(1),
        }
    }
}

impl Default for DryrunGenerator {
    fn default() -> Self {
        Self::new(256, 384)
    }
}

impl GenerationCapability for DryrunGenerator {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn generate(&self, request: &CapabilityRequest) -> Result<CapabilityResponse> {
        let subject = request
            .images
            .last()
            .map(|image| image.bytes.as_slice())
            .unwrap_or_default();
        let (r, g, b) = color_from_prompt(&request.prompt, subject);
        let mut image = RgbImage::new(self.width, self.height);
        for pixel in image.pixels_mut() {
            *pixel = Rgb([r, g, b]);
        }
        let mut out = Cursor::new(Vec::new());
        image
            .write_to(&mut out, ImageFormat::Png)
            .context("dryrun image encode failed")?;
        Ok(CapabilityResponse::new(vec![
            ResponsePart::Text(format!("dryrun render {r:02x}{g:02x}{b:02x}")),
            ResponsePart::InlineData {
                mime_type: Some("image/png".to_string()),
                data: InlinePayload::Base64(BASE64.encode(out.into_inner())),
            },
        ]))
    }
}

/// Offline verifier that always answers with the same text.
#[derive(Debug, Clone)]
pub struct DryrunVerifier {
    answer: String,
}

impl DryrunVerifier {
    pub fn with_answer(answer: impl Into<String>) -> Self {
        Self {
            answer: answer.into(),
        }
    }
}

impl Default for DryrunVerifier {
    fn default() -> Self {
        Self::with_answer("PASS: dryrun")
    }
}

impl VerificationCapability for DryrunVerifier {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn verify(&self, _request: &CapabilityRequest) -> Result<String> {
        Ok(self.answer.clone())
    }
}

fn color_from_prompt(prompt: &str, subject: &[u8]) -> (u8, u8, u8) {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    hasher.update(subject);
    let digest = hasher.finalize();
    (digest[0], digest[1], digest[2])
}
