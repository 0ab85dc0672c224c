mod artifact;
mod recorder;
mod trace;

pub use artifact::GeneratedArtifact;
pub use recorder::{write_unique, SessionRecorder};
pub use trace::{IterationRecord, SessionTrace, TraceOrderError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Completed,
    Cancelled,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionOutcome {
    pub trace: SessionTrace,
    pub status: SessionStatus,
}
