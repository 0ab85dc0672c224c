use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use tempfile::NamedTempFile;

use super::trace::SessionTrace;
use crate::error::StorageError;

const MAX_NAME_ATTEMPTS: u32 = 100;

/// Writes finished (or cancelled) session traces as pretty JSON documents.
#[derive(Debug, Clone)]
pub struct SessionRecorder {
    dir: PathBuf,
}

impl SessionRecorder {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Returns the path of the written file. The document lands in one rename,
    /// so a failed persist leaves nothing behind.
    pub fn persist(&self, trace: &SessionTrace) -> Result<PathBuf, StorageError> {
        let stamp = Utc::now().format("%Y-%m-%d_%H-%M-%S").to_string();
        self.persist_with_stamp(&stamp, trace)
    }

    fn persist_with_stamp(
        &self,
        stamp: &str,
        trace: &SessionTrace,
    ) -> Result<PathBuf, StorageError> {
        let payload = serde_json::to_string_pretty(trace).map_err(StorageError::Encode)?;
        write_unique(&self.dir, payload.as_bytes(), |attempt| {
            session_file_name(stamp, attempt)
        })
    }

    pub fn load(path: &Path) -> Result<SessionTrace, StorageError> {
        let raw = std::fs::read_to_string(path).map_err(|source| StorageError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| StorageError::Decode {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Writes `bytes` into `dir` under the first free name `name(1)`, `name(2)`,
/// ... and returns the path. The bytes go to a temp file that is renamed into
/// place, so a failed write never leaves a partial file under a final name.
pub fn write_unique(
    dir: &Path,
    bytes: &[u8],
    name: impl Fn(u32) -> String,
) -> Result<PathBuf, StorageError> {
    std::fs::create_dir_all(dir).map_err(write_error(dir))?;
    let mut file = NamedTempFile::new_in(dir).map_err(write_error(dir))?;
    file.write_all(bytes)
        .and_then(|_| file.as_file().sync_all())
        .map_err(write_error(file.path()))?;

    let mut attempt = 1;
    loop {
        let path = dir.join(name(attempt));
        match file.persist_noclobber(&path) {
            Ok(_) => return Ok(path),
            Err(err)
                if err.error.kind() == ErrorKind::AlreadyExists && attempt < MAX_NAME_ATTEMPTS =>
            {
                file = err.file;
                attempt += 1;
            }
            Err(err) => {
                return Err(StorageError::Write {
                    path,
                    source: err.error,
                })
            }
        }
    }
}

fn write_error(path: &Path) -> impl FnOnce(std::io::Error) -> StorageError {
    let path = path.to_path_buf();
    move |source| StorageError::Write { path, source }
}

fn session_file_name(stamp: &str, attempt: u32) -> String {
    if attempt <= 1 {
        format!("session-{stamp}.json")
    } else {
        format!("session-{stamp}-{attempt}.json")
    }
}
