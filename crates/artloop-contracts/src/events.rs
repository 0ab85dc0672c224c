use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};
use uuid::Uuid;

pub const EVENTS_FILE_NAME: &str = "events.jsonl";

pub type EventPayload = Map<String, Value>;

/// Lifecycle points a session reports to its event log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    SessionStarted,
    IterationStarted,
    ArtifactReady,
    IterationCompleted,
    IterationFailed,
    SessionCancelled,
    SessionFinished,
}

impl SessionEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SessionStarted => "session_started",
            Self::IterationStarted => "iteration_started",
            Self::ArtifactReady => "artifact_ready",
            Self::IterationCompleted => "iteration_completed",
            Self::IterationFailed => "iteration_failed",
            Self::SessionCancelled => "session_cancelled",
            Self::SessionFinished => "session_finished",
        }
    }
}

/// Append-only log of one session.
///
/// Every line carries `type`, `session_id`, `seq` and `ts`, then the caller
/// payload (which may override them). `seq` starts at 1 and is assigned under
/// the same lock as the write, so line order and `seq` order agree even when
/// clones write from several threads.
#[derive(Debug, Clone)]
pub struct EventWriter {
    inner: Arc<SessionLog>,
}

#[derive(Debug)]
struct SessionLog {
    path: PathBuf,
    session_id: String,
    next_seq: Mutex<u64>,
}

impl EventWriter {
    /// Fresh session id, logging to `<dir>/events.jsonl`.
    pub fn for_session(dir: &Path) -> Self {
        Self::with_session_id(dir.join(EVENTS_FILE_NAME), new_session_id())
    }

    pub fn with_session_id(path: impl Into<PathBuf>, session_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(SessionLog {
                path: path.into(),
                session_id: session_id.into(),
                next_seq: Mutex::new(1),
            }),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    pub fn emit(&self, event: SessionEvent, payload: EventPayload) -> anyhow::Result<Value> {
        let log = &self.inner;
        if let Some(parent) = log.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut next_seq = log
            .next_seq
            .lock()
            .map_err(|_| anyhow::anyhow!("event log lock poisoned"))?;
        let mut line = Map::new();
        line.insert("type".to_string(), Value::from(event.as_str()));
        line.insert("session_id".to_string(), Value::from(log.session_id.as_str()));
        line.insert("seq".to_string(), Value::from(*next_seq));
        line.insert("ts".to_string(), Value::String(now_utc_iso()));
        line.extend(payload);

        let encoded = serde_json::to_string(&line)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log.path)?;
        file.write_all(encoded.as_bytes())?;
        file.write_all(b"\n")?;
        *next_seq += 1;

        Ok(Value::Object(line))
    }
}

fn new_session_id() -> String {
    format!("session-{}", Uuid::new_v4())
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}
