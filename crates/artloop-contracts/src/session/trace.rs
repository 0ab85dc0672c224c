use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One completed generate/describe/critique/mutate pass.
///
/// Serialized field names are the saved-session contract read by downstream
/// tooling; do not rename them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IterationRecord {
    #[serde(rename = "generation")]
    pub index: u32,
    #[serde(rename = "prompt")]
    pub input_prompt: String,
    #[serde(rename = "imageFilename")]
    pub artifact_id: String,
    #[serde(rename = "artistStatement")]
    pub description: String,
    #[serde(rename = "criticOpinion")]
    pub critique: String,
    #[serde(rename = "newPrompt")]
    pub output_prompt: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("iteration {attempted} appended after iteration {last}")]
pub struct TraceOrderError {
    pub last: u32,
    pub attempted: u32,
}

/// Append-only history of one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionTrace {
    #[serde(rename = "timestamp")]
    started_at: String,
    #[serde(rename = "totalGenerations")]
    requested: u32,
    #[serde(rename = "loops")]
    records: Vec<IterationRecord>,
}

impl SessionTrace {
    pub fn new(requested: u32) -> Self {
        Self::with_start(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true), requested)
    }

    pub fn with_start(started_at: impl Into<String>, requested: u32) -> Self {
        Self {
            started_at: started_at.into(),
            requested,
            records: Vec::new(),
        }
    }

    pub fn started_at(&self) -> &str {
        &self.started_at
    }

    pub fn requested(&self) -> u32 {
        self.requested
    }

    pub fn records(&self) -> &[IterationRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn last(&self) -> Option<&IterationRecord> {
        self.records.last()
    }

    /// Records must arrive in strictly increasing iteration order.
    pub fn append(&mut self, record: IterationRecord) -> Result<(), TraceOrderError> {
        if let Some(last) = self.records.last() {
            if record.index <= last.index {
                return Err(TraceOrderError {
                    last: last.index,
                    attempted: record.index,
                });
            }
        }
        self.records.push(record);
        Ok(())
    }
}
