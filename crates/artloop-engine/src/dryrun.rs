use std::io::Cursor;

use artloop_contracts::error::ServiceError;
use artloop_contracts::session::GeneratedArtifact;
use image::{ImageFormat, Rgb, RgbImage};
use sha2::{Digest, Sha256};

use crate::persona::Persona;
use crate::stability::StylePreset;
use crate::{GenerationClient, PromptMutator, VisionAnalysisClient};

const SERVICE: &str = "dryrun";
const PROMPT_MAX_CHARS: usize = 240;

/// Solid-colour PNGs whose colour is derived from the prompt.
#[derive(Debug, Clone)]
pub struct DryrunGenerationClient {
    pub width: u32,
    pub height: u32,
}

impl Default for DryrunGenerationClient {
    fn default() -> Self {
        Self {
            width: 256,
            height: 256,
        }
    }
}

impl GenerationClient for DryrunGenerationClient {
    fn name(&self) -> &str {
        SERVICE
    }

    fn generate(
        &self,
        prompt: &str,
        style: Option<StylePreset>,
    ) -> Result<GeneratedArtifact, ServiceError> {
        let (r, g, b) = color_from_prompt(prompt, style);
        let image = RgbImage::from_pixel(self.width.max(1), self.height.max(1), Rgb([r, g, b]));
        let mut out = Cursor::new(Vec::new());
        image
            .write_to(&mut out, ImageFormat::Png)
            .map_err(|err| ServiceError::invalid_response(SERVICE, err.to_string()))?;
        Ok(GeneratedArtifact::new(out.into_inner(), "image/png"))
    }
}

/// Reads the image back and reports its dominant colour and size.
#[derive(Debug, Clone, Copy, Default)]
pub struct DryrunVisionClient;

impl VisionAnalysisClient for DryrunVisionClient {
    fn name(&self) -> &str {
        SERVICE
    }

    fn analyze(
        &self,
        artifact: &GeneratedArtifact,
        persona: Persona,
    ) -> Result<String, ServiceError> {
        let image = image::load_from_memory(&artifact.bytes)
            .map_err(|err| ServiceError::invalid_response(SERVICE, err.to_string()))?
            .to_rgb8();
        let color = image
            .pixels()
            .next()
            .map(|pixel| hex::encode(pixel.0))
            .unwrap_or_else(|| "000000".to_string());
        let text = match persona {
            Persona::Descriptive => format!(
                "A uniform field of colour #{color}, {}x{} pixels, with no figures or marks.",
                image.width(),
                image.height()
            ),
            Persona::Critical => format!(
                "The unbroken #{color} surface stages withholding as spectacle, a monochrome bet on scarcity in an economy of images."
            ),
        };
        Ok(text)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DryrunPromptMutator;

impl PromptMutator for DryrunPromptMutator {
    fn name(&self) -> &str {
        SERVICE
    }

    fn synthesize(&self, description: &str, critique: &str) -> Result<String, ServiceError> {
        let prompt = format!(
            "{} Reimagined as {}",
            first_sentence(description),
            first_sentence(critique).to_lowercase()
        );
        Ok(truncate_chars(&prompt, PROMPT_MAX_CHARS))
    }
}

fn color_from_prompt(prompt: &str, style: Option<StylePreset>) -> (u8, u8, u8) {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    if let Some(style) = style {
        hasher.update(style.as_str().as_bytes());
    }
    let digest = hasher.finalize();
    (digest[0], digest[1], digest[2])
}

fn first_sentence(text: &str) -> &str {
    let trimmed = text.trim();
    match trimmed.find(". ") {
        Some(idx) => &trimmed[..=idx],
        None => trimmed,
    }
}

fn truncate_chars(value: &str, max_chars: usize) -> String {
    value.chars().take(max_chars).collect()
}
