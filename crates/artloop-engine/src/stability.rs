use std::str::FromStr;

use artloop_contracts::error::{ConfigurationError, ServiceError};
use artloop_contracts::session::GeneratedArtifact;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use reqwest::blocking::multipart::Form as MultipartForm;
use reqwest::blocking::Client as HttpClient;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde_json::Value;

use crate::config::EngineConfig;
use crate::http::{ensure_success, http_client, transport_error};
use crate::GenerationClient;

const SERVICE: &str = "stability";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StylePreset {
    ThreeDModel,
    AnalogFilm,
    Anime,
    Cinematic,
    ComicBook,
    DigitalArt,
    Enhance,
    FantasyArt,
    Isometric,
    LineArt,
    LowPoly,
    ModelingCompound,
    NeonPunk,
    Origami,
    Photographic,
    PixelArt,
    TileTexture,
}

impl StylePreset {
    pub const ALL: [StylePreset; 17] = [
        Self::ThreeDModel,
        Self::AnalogFilm,
        Self::Anime,
        Self::Cinematic,
        Self::ComicBook,
        Self::DigitalArt,
        Self::Enhance,
        Self::FantasyArt,
        Self::Isometric,
        Self::LineArt,
        Self::LowPoly,
        Self::ModelingCompound,
        Self::NeonPunk,
        Self::Origami,
        Self::Photographic,
        Self::PixelArt,
        Self::TileTexture,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ThreeDModel => "3d-model",
            Self::AnalogFilm => "analog-film",
            Self::Anime => "anime",
            Self::Cinematic => "cinematic",
            Self::ComicBook => "comic-book",
            Self::DigitalArt => "digital-art",
            Self::Enhance => "enhance",
            Self::FantasyArt => "fantasy-art",
            Self::Isometric => "isometric",
            Self::LineArt => "line-art",
            Self::LowPoly => "low-poly",
            Self::ModelingCompound => "modeling-compound",
            Self::NeonPunk => "neon-punk",
            Self::Origami => "origami",
            Self::Photographic => "photographic",
            Self::PixelArt => "pixel-art",
            Self::TileTexture => "tile-texture",
        }
    }

    /// `none` (or an empty string) means no style hint.
    pub fn parse_hint(raw: &str) -> Result<Option<Self>, ConfigurationError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("none") {
            return Ok(None);
        }
        trimmed.parse().map(Some)
    }
}

impl FromStr for StylePreset {
    type Err = ConfigurationError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let wanted = raw.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|preset| preset.as_str() == wanted)
            .ok_or_else(|| ConfigurationError(format!("unknown style preset '{}'", raw.trim())))
    }
}

/// Form fields sent with every Stability request.
#[derive(Debug, Clone, PartialEq)]
pub struct StabilitySettings {
    pub endpoint_path: String,
    pub model: String,
    pub output_format: String,
    pub cfg_scale: f64,
    pub width: u32,
    pub height: u32,
    pub samples: u32,
    pub steps: u32,
}

impl Default for StabilitySettings {
    fn default() -> Self {
        Self {
            endpoint_path: "v2beta/stable-image/generate/sd3".to_string(),
            model: "sd3.5-medium".to_string(),
            output_format: "jpeg".to_string(),
            cfg_scale: 7.0,
            width: 1024,
            height: 1024,
            samples: 1,
            steps: 20,
        }
    }
}

pub struct StabilityGenerationClient {
    api_base: String,
    api_key: String,
    settings: StabilitySettings,
    http: HttpClient,
}

impl StabilityGenerationClient {
    pub fn from_config(config: &EngineConfig) -> Result<Self, ConfigurationError> {
        Ok(Self {
            api_base: config.stability_api_base.clone(),
            api_key: config.require_stability_key()?.to_string(),
            settings: StabilitySettings::default(),
            http: http_client(config.request_timeout)?,
        })
    }

    pub fn with_settings(mut self, settings: StabilitySettings) -> Self {
        self.settings = settings;
        self
    }

    fn endpoint(&self) -> String {
        let path = self.settings.endpoint_path.trim();
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        format!("{}/{}", self.api_base, path.trim_start_matches('/'))
    }

    fn form_fields(&self, prompt: &str, style: Option<StylePreset>) -> Vec<(&'static str, String)> {
        let settings = &self.settings;
        let mut fields = vec![
            ("model", settings.model.clone()),
            ("prompt", prompt.to_string()),
            ("output_format", settings.output_format.clone()),
            ("cfg_scale", trim_float(settings.cfg_scale)),
            ("height", settings.height.to_string()),
            ("width", settings.width.to_string()),
            ("samples", settings.samples.to_string()),
            ("steps", settings.steps.to_string()),
        ];
        if let Some(style) = style {
            fields.push(("style_preset", style.as_str().to_string()));
        }
        fields
    }

    fn decode_json_image(payload: &Value) -> Result<Vec<u8>, ServiceError> {
        let image_b64 = payload
            .get("image")
            .or_else(|| payload.get("base64"))
            .or_else(|| {
                payload
                    .get("artifacts")
                    .and_then(Value::as_array)
                    .and_then(|rows| rows.first())
                    .and_then(Value::as_object)
                    .and_then(|row| row.get("base64"))
            })
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| {
                ServiceError::invalid_response(SERVICE, "JSON response missing image bytes")
            })?;
        BASE64.decode(image_b64.as_bytes()).map_err(|err| {
            ServiceError::invalid_response(SERVICE, format!("image base64 decode failed: {err}"))
        })
    }
}

impl GenerationClient for StabilityGenerationClient {
    fn name(&self) -> &str {
        SERVICE
    }

    fn generate(
        &self,
        prompt: &str,
        style: Option<StylePreset>,
    ) -> Result<GeneratedArtifact, ServiceError> {
        let form = self
            .form_fields(prompt, style)
            .into_iter()
            .fold(MultipartForm::new(), |form, (key, value)| form.text(key, value));
        let response = self
            .http
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .header(ACCEPT, "image/*")
            .multipart(form)
            .send()
            .map_err(|err| transport_error(SERVICE, err))?;
        let response = ensure_success(SERVICE, response)?;

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.to_ascii_lowercase())
            .unwrap_or_default();
        if content_type.starts_with("image/") {
            let bytes = response
                .bytes()
                .map_err(|err| transport_error(SERVICE, err))?
                .to_vec();
            if bytes.is_empty() {
                return Err(ServiceError::invalid_response(SERVICE, "empty image body"));
            }
            return Ok(GeneratedArtifact::new(bytes, content_type));
        }

        let payload: Value = response.json().map_err(|err| {
            ServiceError::invalid_response(SERVICE, format!("failed parsing JSON response: {err}"))
        })?;
        let bytes = Self::decode_json_image(&payload)?;
        let content_type = sniff_content_type(&bytes, &self.settings.output_format);
        Ok(GeneratedArtifact::new(bytes, content_type))
    }
}

/// Base64 bodies carry no MIME type: trust the magic bytes, then the
/// requested `output_format`.
fn sniff_content_type(bytes: &[u8], output_format: &str) -> String {
    match image::guess_format(bytes) {
        Ok(format) => format.to_mime_type().to_string(),
        Err(_) => format!("image/{}", output_format.trim().to_ascii_lowercase()),
    }
}

fn trim_float(value: f64) -> String {
    let text = format!("{value:.4}");
    text.trim_end_matches('0').trim_end_matches('.').to_string()
}
