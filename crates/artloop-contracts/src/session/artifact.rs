use chrono::{DateTime, SecondsFormat, Utc};

/// Output of one image synthesis call.
#[derive(Clone, PartialEq, Eq)]
pub struct GeneratedArtifact {
    pub id: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

impl GeneratedArtifact {
    pub fn new(bytes: Vec<u8>, content_type: impl Into<String>) -> Self {
        let content_type = content_type.into();
        Self {
            id: artifact_file_name(Utc::now(), &content_type),
            content_type,
            bytes,
        }
    }

    pub fn extension(&self) -> &'static str {
        extension_for_content_type(&self.content_type)
    }
}

impl std::fmt::Debug for GeneratedArtifact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeneratedArtifact")
            .field("id", &self.id)
            .field("content_type", &self.content_type)
            .field("bytes", &self.bytes.len())
            .finish()
    }
}

/// `painting-2025-01-02T03-04-05-678Z.jpg`: the ISO-8601 stamp with `:` and
/// `.` made filesystem safe.
pub fn artifact_file_name(at: DateTime<Utc>, content_type: &str) -> String {
    let stamp = at
        .to_rfc3339_opts(SecondsFormat::Millis, true)
        .replace([':', '.'], "-");
    format!(
        "painting-{stamp}.{}",
        extension_for_content_type(content_type)
    )
}

pub fn extension_for_content_type(content_type: &str) -> &'static str {
    let mime = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    match mime.as_str() {
        "image/jpeg" | "image/jpg" => "jpg",
        "image/webp" => "webp",
        "image/gif" => "gif",
        _ => "png",
    }
}
