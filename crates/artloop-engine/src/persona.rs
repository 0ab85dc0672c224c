/// Behavioural instruction set handed to the vision-language collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Persona {
    /// Observational prose about visible content only.
    Descriptive,
    /// Interpretive, evaluative prose placing the work in current art discourse.
    Critical,
}

impl Persona {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Descriptive => "descriptive",
            Self::Critical => "critical",
        }
    }

    pub fn system_instruction(self) -> &'static str {
        match self {
            Self::Descriptive => DESCRIPTIVE_INSTRUCTION,
            Self::Critical => CRITICAL_INSTRUCTION,
        }
    }

    pub fn user_instruction(self) -> &'static str {
        match self {
            Self::Descriptive => "Describe this image.",
            Self::Critical => "Critique this image.",
        }
    }
}

const DESCRIPTIVE_INSTRUCTION: &str = "You return strictly descriptive, non-interpretive prose about the supplied image.\n\
Do not infer intent, symbolism, psychology, or narrative. Describe only what is visually present.\n\n\
Start with a brief tl;dr summary, then provide a concise description that is 40% shorter than typical responses.";

const CRITICAL_INSTRUCTION: &str = "You are a contemporary critical theorist with deep familiarity with art history, institutional critique, and the present art-market discourse.\n\
You focus specifically on what makes this image 'good' within the contemporary art scene. Analyze the work's strengths in relation to current artistic practices, market positioning, critical reception, and cultural relevance.\n\
You evaluate the work's merit within institutional discourse and contemporary art-market conditions.\n\n\
Start with a brief tl;dr summary, then provide a concise critique that is 40% shorter than typical responses.";

pub const MUTATOR_INSTRUCTION: &str = "You are given:\n\
(1) an artist statement, and\n\
(2) a critic's statement about an existing artwork.\n\n\
Your task is to generate a new image prompt for a different artwork that:\n\n\
- emphasizes one conceptual aspect present in the discourse\n\
- does not recreate or closely echo the original image's composition, motifs, or style\n\
- treats the statements as conceptual source material, not visual reference\n\n\
Output ONLY a concise, generatable image prompt describing an entirely new image that embodies a chosen conceptual aspect, with no mention of the original work, the discourse, or instructions. Do not include any other text, explanations, or formatting.";

pub(crate) fn mutator_user_message(description: &str, critique: &str) -> String {
    format!(
        "Artist Statement: {description}\n\nCritic's Opinion: {critique}\n\nGenerate a new image prompt based on the artist statement and critic's opinion provided."
    )
}
