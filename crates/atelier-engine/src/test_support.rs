use std::collections::VecDeque;
use std::io::Cursor;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::{ImageFormat, Rgb, RgbImage};

use crate::capability::{
    CapabilityRequest, CapabilityResponse, GenerationCapability, ImagePart, InlinePayload,
    ResponsePart, VerificationCapability,
};

pub(crate) fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let mut image = RgbImage::new(width, height);
    for pixel in image.pixels_mut() {
        *pixel = Rgb([width as u8, height as u8, 7]);
    }
    let mut out = Cursor::new(Vec::new());
    image
        .write_to(&mut out, ImageFormat::Png)
        .expect("encode test png");
    out.into_inner()
}

#[derive(Debug, Clone)]
pub(crate) enum GenStep {
    Image,
    Base64Image,
    NoImage,
    Error(String),
}

#[derive(Debug, Default)]
struct Recorded {
    prompts: Vec<String>,
    images: Vec<Vec<ImagePart>>,
}

/// Replays a fixed script; once it runs out every call answers with text only.
#[derive(Debug, Clone)]
pub(crate) struct ScriptedGenerator {
    script: Arc<Mutex<VecDeque<GenStep>>>,
    recorded: Arc<Mutex<Recorded>>,
}

impl ScriptedGenerator {
    pub(crate) fn new(steps: Vec<GenStep>) -> Self {
        Self {
            script: Arc::new(Mutex::new(steps.into())),
            recorded: Arc::new(Mutex::new(Recorded::default())),
        }
    }

    pub(crate) fn calls(&self) -> u32 {
        self.recorded.lock().expect("recorded").prompts.len() as u32
    }

    pub(crate) fn prompts(&self) -> Vec<String> {
        self.recorded.lock().expect("recorded").prompts.clone()
    }

    pub(crate) fn last_images(&self) -> Vec<ImagePart> {
        self.recorded
            .lock()
            .expect("recorded")
            .images
            .last()
            .cloned()
            .unwrap_or_default()
    }
}

impl GenerationCapability for ScriptedGenerator {
    fn name(&self) -> &str {
        "scripted"
    }

    fn generate(&self, request: &CapabilityRequest) -> Result<CapabilityResponse> {
        {
            let mut recorded = self.recorded.lock().expect("recorded");
            recorded.prompts.push(request.prompt.clone());
            recorded.images.push(request.images.clone());
        }
        let step = self
            .script
            .lock()
            .expect("script")
            .pop_front()
            .unwrap_or(GenStep::NoImage);
        match step {
            GenStep::Image => Ok(CapabilityResponse::image(ImagePart::new(
                "image/png",
                png_bytes(8, 8),
            ))),
            GenStep::Base64Image => Ok(CapabilityResponse::new(vec![
                ResponsePart::Text("Here is the corrected image.".to_string()),
                ResponsePart::InlineData {
                    mime_type: Some("image/png".to_string()),
                    data: InlinePayload::Base64(BASE64.encode(png_bytes(8, 8))),
                },
            ])),
            GenStep::NoImage => Ok(CapabilityResponse::text("I can't help with that image.")),
            GenStep::Error(message) => Err(anyhow!(message)),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct ScriptedVerifier {
    script: Arc<Mutex<VecDeque<Result<String, String>>>>,
    repeat: Option<Result<String, String>>,
    recorded: Arc<Mutex<Recorded>>,
}

impl ScriptedVerifier {
    pub(crate) fn new(answers: Vec<Result<String, String>>) -> Self {
        Self {
            script: Arc::new(Mutex::new(answers.into())),
            repeat: None,
            recorded: Arc::new(Mutex::new(Recorded::default())),
        }
    }

    pub(crate) fn repeating(answer: Result<String, String>) -> Self {
        Self {
            repeat: Some(answer),
            ..Self::new(Vec::new())
        }
    }

    pub(crate) fn calls(&self) -> u32 {
        self.recorded.lock().expect("recorded").prompts.len() as u32
    }

    pub(crate) fn last_prompt(&self) -> Option<String> {
        self.recorded
            .lock()
            .expect("recorded")
            .prompts
            .last()
            .cloned()
    }

    pub(crate) fn last_images(&self) -> Vec<ImagePart> {
        self.recorded
            .lock()
            .expect("recorded")
            .images
            .last()
            .cloned()
            .unwrap_or_default()
    }
}

impl VerificationCapability for ScriptedVerifier {
    fn name(&self) -> &str {
        "scripted"
    }

    fn verify(&self, request: &CapabilityRequest) -> Result<String> {
        {
            let mut recorded = self.recorded.lock().expect("recorded");
            recorded.prompts.push(request.prompt.clone());
            recorded.images.push(request.images.clone());
        }
        let answer = self
            .script
            .lock()
            .expect("script")
            .pop_front()
            .or_else(|| self.repeat.clone())
            .unwrap_or_else(|| Ok(String::new()));
        answer.map_err(|message| anyhow!(message))
    }
}
