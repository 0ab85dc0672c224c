use std::io::Cursor;

use artloop_contracts::error::{ConfigurationError, ServiceError};
use artloop_contracts::session::GeneratedArtifact;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, Rgba, RgbaImage};
use reqwest::blocking::Client as HttpClient;
use serde_json::{json, Value};

use crate::config::EngineConfig;
use crate::http::{http_client, post_chat_completion};
use crate::persona::{mutator_user_message, Persona, MUTATOR_INSTRUCTION};
use crate::{PromptMutator, VisionAnalysisClient};

const SERVICE: &str = "openai";
const VISION_MAX_DIM: u32 = 1024;

struct ChatEndpoint {
    api_base: String,
    api_key: String,
    model: String,
    max_tokens: u64,
    http: HttpClient,
}

impl ChatEndpoint {
    fn from_config(config: &EngineConfig, model: &str) -> Result<Self, ConfigurationError> {
        Ok(Self {
            api_base: config.openai_api_base.clone(),
            api_key: config.require_openai_key()?.to_string(),
            model: model.to_string(),
            max_tokens: config.max_tokens,
            http: http_client(config.request_timeout)?,
        })
    }

    fn complete(&self, messages: Value) -> Result<String, ServiceError> {
        let payload = json!({
            "model": self.model,
            "messages": messages,
            "max_tokens": self.max_tokens,
        });
        post_chat_completion(&self.http, SERVICE, &self.api_base, &self.api_key, &payload)
    }
}

pub struct OpenAiVisionClient {
    endpoint: ChatEndpoint,
}

impl OpenAiVisionClient {
    pub fn from_config(config: &EngineConfig) -> Result<Self, ConfigurationError> {
        Ok(Self {
            endpoint: ChatEndpoint::from_config(config, &config.vision_model)?,
        })
    }
}

impl VisionAnalysisClient for OpenAiVisionClient {
    fn name(&self) -> &str {
        SERVICE
    }

    fn analyze(
        &self,
        artifact: &GeneratedArtifact,
        persona: Persona,
    ) -> Result<String, ServiceError> {
        let text = self.endpoint.complete(vision_messages(artifact, persona))?;
        if text.is_empty() {
            return Err(ServiceError::invalid_response(
                SERVICE,
                format!("empty {} analysis", persona.as_str()),
            ));
        }
        Ok(text)
    }
}

pub struct OpenAiPromptMutator {
    endpoint: ChatEndpoint,
}

impl OpenAiPromptMutator {
    pub fn from_config(config: &EngineConfig) -> Result<Self, ConfigurationError> {
        Ok(Self {
            endpoint: ChatEndpoint::from_config(config, &config.mutator_model)?,
        })
    }
}

impl PromptMutator for OpenAiPromptMutator {
    fn name(&self) -> &str {
        SERVICE
    }

    fn synthesize(&self, description: &str, critique: &str) -> Result<String, ServiceError> {
        let prompt = self.endpoint.complete(mutator_messages(description, critique))?;
        if prompt.is_empty() {
            return Err(ServiceError::invalid_response(SERVICE, "empty prompt"));
        }
        Ok(prompt)
    }
}

fn vision_messages(artifact: &GeneratedArtifact, persona: Persona) -> Value {
    json!([
        {
            "role": "system",
            "content": persona.system_instruction(),
        },
        {
            "role": "user",
            "content": [
                {"type": "text", "text": persona.user_instruction()},
                {"type": "image_url", "image_url": {"url": vision_data_url(artifact)}},
            ],
        },
    ])
}

fn mutator_messages(description: &str, critique: &str) -> Value {
    json!([
        {"role": "system", "content": MUTATOR_INSTRUCTION},
        {"role": "user", "content": mutator_user_message(description, critique)},
    ])
}

fn vision_data_url(artifact: &GeneratedArtifact) -> String {
    let (bytes, mime) = prepare_vision_image(&artifact.bytes, VISION_MAX_DIM)
        .unwrap_or_else(|| (artifact.bytes.clone(), artifact.content_type.clone()));
    format!("data:{mime};base64,{}", BASE64.encode(bytes))
}

/// Flattens alpha onto white and bounds the longest side. `None` when the
/// bytes do not decode as an image.
fn prepare_vision_image(bytes: &[u8], max_dim: u32) -> Option<(Vec<u8>, String)> {
    let image = image::load_from_memory(bytes).ok()?;
    let rgba = image.to_rgba8();
    let mut flattened = RgbaImage::new(rgba.width(), rgba.height());
    for (x, y, pixel) in rgba.enumerate_pixels() {
        let alpha = u16::from(pixel[3]);
        let blend = |channel: u8| -> u8 {
            (((u16::from(channel) * alpha) + (255 * (255 - alpha))) / 255) as u8
        };
        flattened.put_pixel(
            x,
            y,
            Rgba([blend(pixel[0]), blend(pixel[1]), blend(pixel[2]), 255]),
        );
    }
    let mut flattened = DynamicImage::ImageRgba8(flattened);
    let dim = max_dim.max(128);
    if flattened.width() > dim || flattened.height() > dim {
        flattened = flattened.resize(dim, dim, FilterType::Triangle);
    }
    let rgb = flattened.to_rgb8();

    let mut out = Cursor::new(Vec::new());
    JpegEncoder::new_with_quality(&mut out, 90)
        .encode_image(&rgb)
        .ok()?;
    Some((out.into_inner(), "image/jpeg".to_string()))
}
