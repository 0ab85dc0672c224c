use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopPhase {
    #[default]
    Idle,
    Generating,
    Describing,
    Critiquing,
    Mutating,
    Waiting,
}

impl LoopPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Generating => "generating",
            Self::Describing => "describing",
            Self::Critiquing => "critiquing",
            Self::Mutating => "mutating",
            Self::Waiting => "waiting",
        }
    }

    /// Within an iteration the phases only move forward one step at a time.
    /// Any phase may fall back to `Idle` (iteration done, failed, or cancelled).
    pub fn can_transition_to(self, next: LoopPhase) -> bool {
        match (self, next) {
            (_, LoopPhase::Idle) => true,
            (LoopPhase::Idle, LoopPhase::Generating | LoopPhase::Waiting) => true,
            (LoopPhase::Generating, LoopPhase::Describing) => true,
            (LoopPhase::Describing, LoopPhase::Critiquing) => true,
            (LoopPhase::Critiquing, LoopPhase::Mutating) => true,
            _ => false,
        }
    }
}

/// Transient view of a running session, published for callers to poll.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct LoopState {
    pub active: bool,
    pub phase: LoopPhase,
    /// 1-based index of the iteration in flight, 0 before the first one.
    pub iteration: u32,
    pub total: u32,
    pub working_prompt: String,
    pub last_error: Option<String>,
    pub completed: u32,
    pub failed: u32,
}

impl LoopState {
    pub fn started(total: u32, working_prompt: &str) -> Self {
        Self {
            active: true,
            total,
            working_prompt: working_prompt.to_string(),
            ..Self::default()
        }
    }

    pub fn progress_line(&self) -> String {
        let mut line = format!(
            "[{}/{}] {}",
            self.iteration,
            self.total,
            self.phase.as_str()
        );
        if let Some(err) = &self.last_error {
            line.push_str(&format!(" (last error: {err})"));
        }
        line
    }
}
