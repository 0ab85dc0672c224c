use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use artloop_contracts::error::ConfigurationError;

const DEFAULT_STABILITY_API_BASE: &str = "https://api.stability.ai";
const DEFAULT_OPENAI_API_BASE: &str = "https://api.openai.com/v1";
const DEFAULT_TEXT_MODEL: &str = "gpt-4o";
const DEFAULT_MAX_TOKENS: u64 = 1000;
const DEFAULT_ITERATION_DELAY_MS: u64 = 2000;
const DEFAULT_REQUEST_TIMEOUT_S: u64 = 120;
const STABILITY_KEY_PLACEHOLDER: &str = "your-stability-api-key-here";

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub stability_api_key: Option<String>,
    pub stability_api_base: String,
    pub openai_api_key: Option<String>,
    pub openai_api_base: String,
    pub vision_model: String,
    pub mutator_model: String,
    pub max_tokens: u64,
    pub iteration_delay: Duration,
    pub request_timeout: Duration,
}

impl EngineConfig {
    /// Process environment first, then `.env` in the working directory or its
    /// parent.
    pub fn from_env() -> Result<Self, ConfigurationError> {
        let dotenv = env::current_dir()
            .map(|cwd| load_dotenv(&dotenv_candidates(&cwd)))
            .unwrap_or_default();
        Self::from_lookup(|key| {
            env::var(key)
                .ok()
                .or_else(|| dotenv.get(key).cloned())
        })
    }

    pub fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigurationError> {
        let first = |keys: &[&str]| -> Option<String> {
            keys.iter()
                .filter_map(|key| lookup(key))
                .map(|value| value.trim().to_string())
                .find(|value| !value.is_empty())
        };

        let stability_api_key = first(&["STABILITY_API_KEY", "VITE_STABILITY_API_KEY"])
            .filter(|value| value != STABILITY_KEY_PLACEHOLDER);
        let openai_api_key = first(&["OPENAI_API_KEY", "VITE_OPENAI_API_KEY"]);
        let stability_api_base = first(&["STABILITY_API_BASE"])
            .map(|value| value.trim_end_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_STABILITY_API_BASE.to_string());
        let openai_api_base = first(&["OPENAI_API_BASE", "OPENAI_BASE_URL"])
            .map(|value| normalize_openai_base(&value))
            .unwrap_or_else(|| DEFAULT_OPENAI_API_BASE.to_string());

        Ok(Self {
            stability_api_key,
            stability_api_base,
            openai_api_key,
            openai_api_base,
            vision_model: first(&["ARTLOOP_VISION_MODEL"])
                .unwrap_or_else(|| DEFAULT_TEXT_MODEL.to_string()),
            mutator_model: first(&["ARTLOOP_MUTATOR_MODEL"])
                .unwrap_or_else(|| DEFAULT_TEXT_MODEL.to_string()),
            max_tokens: parse_u64(&first, "ARTLOOP_MAX_TOKENS", DEFAULT_MAX_TOKENS)?,
            iteration_delay: Duration::from_millis(parse_u64(
                &first,
                "ARTLOOP_ITERATION_DELAY_MS",
                DEFAULT_ITERATION_DELAY_MS,
            )?),
            request_timeout: Duration::from_secs(parse_u64(
                &first,
                "ARTLOOP_REQUEST_TIMEOUT_S",
                DEFAULT_REQUEST_TIMEOUT_S,
            )?),
        })
    }

    pub fn require_stability_key(&self) -> Result<&str, ConfigurationError> {
        self.stability_api_key
            .as_deref()
            .ok_or_else(|| ConfigurationError::missing("STABILITY_API_KEY"))
    }

    pub fn require_openai_key(&self) -> Result<&str, ConfigurationError> {
        self.openai_api_key
            .as_deref()
            .ok_or_else(|| ConfigurationError::missing("OPENAI_API_KEY"))
    }
}

fn parse_u64(
    first: &impl Fn(&[&str]) -> Option<String>,
    key: &str,
    default: u64,
) -> Result<u64, ConfigurationError> {
    match first(&[key]) {
        None => Ok(default),
        Some(raw) => raw.parse::<u64>().map_err(|_| {
            ConfigurationError(format!("{key} must be a non-negative integer, got '{raw}'"))
        }),
    }
}

fn normalize_openai_base(raw: &str) -> String {
    let mut base = raw.trim().trim_end_matches('/').to_string();
    if let Ok(parsed) = reqwest::Url::parse(&base) {
        if parsed.path().trim().is_empty() || parsed.path() == "/" {
            base = format!("{base}/v1");
        }
    }
    base.trim_end_matches('/').to_string()
}

fn dotenv_candidates(cwd: &Path) -> Vec<PathBuf> {
    let mut paths = vec![cwd.join(".env")];
    if let Some(parent) = cwd.parent() {
        paths.push(parent.join(".env"));
    }
    paths
}

/// Earlier files win over later ones.
fn load_dotenv(paths: &[PathBuf]) -> HashMap<String, String> {
    let mut values = HashMap::new();
    for path in paths.iter().rev() {
        if let Ok(raw) = fs::read_to_string(path) {
            values.extend(parse_dotenv(&raw));
        }
    }
    values
}

fn parse_dotenv(raw: &str) -> HashMap<String, String> {
    let mut values = HashMap::new();
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|rest| rest.strip_suffix('"'))
            .or_else(|| {
                value
                    .strip_prefix('\'')
                    .and_then(|rest| rest.strip_suffix('\''))
            })
            .unwrap_or(value);
        values.insert(key.to_string(), value.to_string());
    }
    values
}
