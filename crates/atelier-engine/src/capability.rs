use std::fs;
use std::io::Cursor;
use std::path::Path;

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::imageops::{self, FilterType};
use image::ImageFormat;

use crate::mime_for_path;

/// One image handed to, or received from, a capability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImagePart {
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

impl ImagePart {
    pub fn new(mime_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            mime_type: mime_type.into(),
            bytes,
        }
    }

    /// Builds a part whose MIME type is sniffed from the bytes, defaulting to PNG.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        let mime_type = sniff_mime(&bytes).unwrap_or("image/png");
        Self::new(mime_type, bytes)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let bytes = fs::read(path).with_context(|| format!("failed reading {}", path.display()))?;
        let mime_type = sniff_mime(&bytes)
            .or_else(|| mime_for_path(path))
            .unwrap_or("image/png");
        Ok(Self::new(mime_type, bytes))
    }

    /// Reads only the header; a part that passes is assumed decodable.
    pub fn dimensions(&self) -> Result<(u32, u32)> {
        image::ImageReader::new(Cursor::new(self.bytes.as_slice()))
            .with_guessed_format()
            .context("image header read failed")?
            .into_dimensions()
            .context("image header is not decodable")
    }

    /// Lanczos resample to exactly `width` x `height`, re-encoded as PNG.
    pub fn resized(&self, width: u32, height: u32) -> Result<Self> {
        let decoded =
            image::load_from_memory(&self.bytes).context("generated image is not decodable")?;
        if decoded.width() == width && decoded.height() == height {
            return Ok(self.clone());
        }
        let resized = imageops::resize(&decoded, width.max(1), height.max(1), FilterType::Lanczos3);
        let mut out = Cursor::new(Vec::new());
        resized
            .write_to(&mut out, ImageFormat::Png)
            .context("resized image encode failed")?;
        Ok(Self::new("image/png", out.into_inner()))
    }
}

fn sniff_mime(bytes: &[u8]) -> Option<&'static str> {
    image::guess_format(bytes)
        .ok()
        .map(|format| format.to_mime_type())
}

/// A single ordered request: instruction text followed by images.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilityRequest {
    pub prompt: String,
    pub images: Vec<ImagePart>,
}

impl CapabilityRequest {
    pub fn new(prompt: impl Into<String>, images: Vec<ImagePart>) -> Self {
        Self {
            prompt: prompt.into(),
            images,
        }
    }
}

/// Image data as a capability returned it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InlinePayload {
    Raw(Vec<u8>),
    Base64(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponsePart {
    Text(String),
    InlineData {
        mime_type: Option<String>,
        data: InlinePayload,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapabilityResponse {
    pub parts: Vec<ResponsePart>,
}

impl CapabilityResponse {
    pub fn new(parts: Vec<ResponsePart>) -> Self {
        Self { parts }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::new(vec![ResponsePart::Text(text.into())])
    }

    pub fn image(image: ImagePart) -> Self {
        Self::new(vec![ResponsePart::InlineData {
            mime_type: Some(image.mime_type),
            data: InlinePayload::Raw(image.bytes),
        }])
    }

    pub fn text_content(&self) -> String {
        self.parts
            .iter()
            .filter_map(|part| match part {
                ResponsePart::Text(text) => Some(text.trim()),
                ResponsePart::InlineData { .. } => None,
            })
            .filter(|text| !text.is_empty())
            .collect::<Vec<&str>>()
            .join("\n")
    }

    pub fn has_inline_data(&self) -> bool {
        self.parts
            .iter()
            .any(|part| matches!(part, ResponsePart::InlineData { .. }))
    }

    /// First inline part that decodes to image bytes.
    ///
    /// Parts tagged with a non-`image/` MIME type and empty payloads are skipped;
    /// untagged parts are accepted when their bytes sniff as an image.
    pub fn first_image(&self) -> Result<Option<ImagePart>> {
        for part in &self.parts {
            let ResponsePart::InlineData { mime_type, data } = part else {
                continue;
            };
            if let Some(mime) = mime_type.as_deref() {
                if !mime.trim().to_ascii_lowercase().starts_with("image/") {
                    continue;
                }
            }
            let bytes = decode_inline_payload(data)?;
            if bytes.is_empty() {
                continue;
            }
            let mime = match mime_type.as_deref() {
                Some(mime) => mime.trim().to_string(),
                None => match sniff_mime(&bytes) {
                    Some(mime) => mime.to_string(),
                    None => continue,
                },
            };
            return Ok(Some(ImagePart::new(mime, bytes)));
        }
        Ok(None)
    }
}

/// Normalizes either payload form to raw bytes.
pub fn decode_inline_payload(payload: &InlinePayload) -> Result<Vec<u8>> {
    match payload {
        InlinePayload::Raw(bytes) => Ok(bytes.clone()),
        InlinePayload::Base64(text) => BASE64
            .decode(text.trim().as_bytes())
            .context("image payload base64 decode failed"),
    }
}

pub trait GenerationCapability: Send + Sync {
    fn name(&self) -> &str;
    fn generate(&self, request: &CapabilityRequest) -> Result<CapabilityResponse>;
}

pub trait VerificationCapability: Send + Sync {
    fn name(&self) -> &str;
    /// Returns the verifier's free-text answer.
    fn verify(&self, request: &CapabilityRequest) -> Result<String>;
}
