use std::str::FromStr;

use artloop_contracts::error::{ConfigurationError, ServiceError};
use artloop_contracts::session::GeneratedArtifact;

mod config;
mod dryrun;
mod http;
mod openai;
mod orchestrator;
mod persona;
mod stability;
#[cfg(test)]
mod test_http;

pub use config::EngineConfig;
pub use dryrun::{DryrunGenerationClient, DryrunPromptMutator, DryrunVisionClient};
pub use openai::{OpenAiPromptMutator, OpenAiVisionClient};
pub use orchestrator::{
    CancelToken, IterationFailure, LoopObserver, LoopOrchestrator, StatusHandle,
};
pub use persona::{Persona, MUTATOR_INSTRUCTION};
pub use stability::{StabilityGenerationClient, StabilitySettings, StylePreset};

/// Text-to-image synthesis.
pub trait GenerationClient: Send + Sync {
    fn name(&self) -> &str;
    fn generate(
        &self,
        prompt: &str,
        style: Option<StylePreset>,
    ) -> Result<GeneratedArtifact, ServiceError>;
}

/// Vision-language analysis of a generated image under a fixed persona.
pub trait VisionAnalysisClient: Send + Sync {
    fn name(&self) -> &str;
    fn analyze(&self, artifact: &GeneratedArtifact, persona: Persona)
        -> Result<String, ServiceError>;
}

/// Synthesizes the next prompt from a description and a critique.
pub trait PromptMutator: Send + Sync {
    fn name(&self) -> &str;
    fn synthesize(&self, description: &str, critique: &str) -> Result<String, ServiceError>;
}

pub struct Collaborators {
    pub generation: Box<dyn GenerationClient>,
    pub vision: Box<dyn VisionAnalysisClient>,
    pub mutator: Box<dyn PromptMutator>,
}

impl Collaborators {
    /// Fails before any request is sent when the backend lacks credentials.
    pub fn for_backend(
        backend: Backend,
        config: &EngineConfig,
    ) -> Result<Self, ConfigurationError> {
        match backend {
            Backend::Dryrun => Ok(Self {
                generation: Box::new(DryrunGenerationClient::default()),
                vision: Box::new(DryrunVisionClient),
                mutator: Box::new(DryrunPromptMutator),
            }),
            Backend::Stability => Ok(Self {
                generation: Box::new(StabilityGenerationClient::from_config(config)?),
                vision: Box::new(OpenAiVisionClient::from_config(config)?),
                mutator: Box::new(OpenAiPromptMutator::from_config(config)?),
            }),
        }
    }

    pub fn names(&self) -> [&str; 3] {
        [
            self.generation.name(),
            self.vision.name(),
            self.mutator.name(),
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// Stability image synthesis with OpenAI vision and prompt mutation.
    Stability,
    /// Offline, deterministic collaborators.
    Dryrun,
}

impl FromStr for Backend {
    type Err = ConfigurationError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "stability" | "live" => Ok(Self::Stability),
            "dryrun" | "dry-run" => Ok(Self::Dryrun),
            other => Err(ConfigurationError(format!(
                "unknown backend '{other}' (expected stability or dryrun)"
            ))),
        }
    }
}
