//! Configuration management for the agent runtime.
//!
//! Configuration is read from environment variables:
//! - `RAGO_DATA_DIR` - Optional. Holds `plans.db`, `progress.db` and `plans/`. Defaults to `./.rago/data`.
//! - `RAGO_WORKSPACE_DIR` - Optional. Working directory for tool servers. Defaults to the current directory.
//! - `RAGO_TOOL_SERVERS_FILE` - Optional. JSON file with `{"servers": [...]}`.
//! - `RAGO_PROVIDERS_FILE` - Optional. JSON file with `{"strategy", "providers", "embedders"}`.
//! - `RAGO_LLM_BASE_URL` - Optional. Single generator endpoint when no providers file is given. Defaults to `http://localhost:11434/v1`.
//! - `RAGO_LLM_MODEL` - Optional. Defaults to `qwen3`.
//! - `RAGO_LLM_API_KEY` - Optional.
//! - `RAGO_EMBED_MODEL` - Optional. Embedding model on the same endpoint. Defaults to `nomic-embed-text`.
//! - `RAGO_AGENT_WORKERS` - Optional. Agent worker-pool size. Defaults to `3`.
//! - `RAGO_STEP_TIMEOUT_SECS` - Optional. Per tool call timeout. Defaults to `120`.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::llm::{PoolConfig, ProviderConfig};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),

    #[error("Failed to read {0}: {1}")]
    Unreadable(String, String),
}

impl From<ConfigError> for crate::error::Error {
    fn from(e: ConfigError) -> Self {
        crate::error::Error::Config(e.to_string())
    }
}

/// Runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory for the SQLite stores and plan files
    pub data_dir: PathBuf,

    /// Working directory for tool-server processes
    pub workspace_dir: PathBuf,

    /// Tool-server list; `None` runs without tools
    pub tool_servers_file: Option<PathBuf>,

    /// Generator and embedder endpoints
    pub llm: PoolConfig,

    pub agent_workers: usize,

    pub step_timeout: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` for unparsable numbers and
    /// `ConfigError::Unreadable` when the providers file cannot be read.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let data_dir = lookup("RAGO_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(".rago/data"));

        let workspace_dir = lookup("RAGO_WORKSPACE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

        let tool_servers_file = lookup("RAGO_TOOL_SERVERS_FILE").map(PathBuf::from);

        let llm = match lookup("RAGO_PROVIDERS_FILE") {
            Some(path) => load_providers(Path::new(&path))?,
            None => single_provider(&lookup),
        };

        let agent_workers: usize = parse_var(&lookup, "RAGO_AGENT_WORKERS", 3)?;
        if agent_workers == 0 {
            return Err(ConfigError::InvalidValue(
                "RAGO_AGENT_WORKERS".to_string(),
                "must be at least 1".to_string(),
            ));
        }
        let step_timeout_secs: u64 = parse_var(&lookup, "RAGO_STEP_TIMEOUT_SECS", 120)?;

        Ok(Self {
            data_dir,
            workspace_dir,
            tool_servers_file,
            llm,
            agent_workers,
            step_timeout: Duration::from_secs(step_timeout_secs.max(1)),
        })
    }

    /// Create a config rooted at `data_dir` with one local endpoint
    /// (useful for testing).
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            workspace_dir: data_dir.clone(),
            data_dir,
            tool_servers_file: None,
            llm: single_provider(&|_| None),
            agent_workers: 3,
            step_timeout: Duration::from_secs(120),
        }
    }

    pub fn plans_db(&self) -> PathBuf {
        self.data_dir.join("plans.db")
    }

    pub fn progress_db(&self) -> PathBuf {
        self.data_dir.join("progress.db")
    }

    pub fn plans_dir(&self) -> PathBuf {
        self.data_dir.join("plans")
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), format!("{}", e))),
        None => Ok(default),
    }
}

fn single_provider(lookup: &impl Fn(&str) -> Option<String>) -> PoolConfig {
    let base_url = lookup("RAGO_LLM_BASE_URL").unwrap_or_else(|| "http://localhost:11434/v1".to_string());
    let api_key = lookup("RAGO_LLM_API_KEY");

    let mut generator = ProviderConfig::new(
        "default",
        base_url.clone(),
        lookup("RAGO_LLM_MODEL").unwrap_or_else(|| "qwen3".to_string()),
    );
    generator.api_key = api_key.clone();

    let mut embedder = ProviderConfig::new(
        "default-embed",
        base_url,
        lookup("RAGO_EMBED_MODEL").unwrap_or_else(|| "nomic-embed-text".to_string()),
    );
    embedder.api_key = api_key;

    PoolConfig {
        providers: vec![generator],
        embedders: vec![embedder],
        ..PoolConfig::default()
    }
}

fn load_providers(path: &Path) -> Result<PoolConfig, ConfigError> {
    let display = path.display().to_string();
    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Unreadable(display.clone(), e.to_string()))?;
    serde_json::from_str(&content).map_err(|e| ConfigError::InvalidValue(display, e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn defaults() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.data_dir, PathBuf::from(".rago/data"));
        assert_eq!(config.agent_workers, 3);
        assert_eq!(config.step_timeout, Duration::from_secs(120));
        assert!(config.tool_servers_file.is_none());
        assert_eq!(config.llm.providers[0].model_name, "qwen3");
        assert_eq!(config.llm.embedders[0].model_name, "nomic-embed-text");
        assert_eq!(config.plans_db(), PathBuf::from(".rago/data/plans.db"));
    }

    #[test]
    fn overrides_and_bad_numbers() {
        let config = Config::from_lookup(lookup(&[
            ("RAGO_DATA_DIR", "/tmp/rago"),
            ("RAGO_AGENT_WORKERS", "5"),
            ("RAGO_LLM_MODEL", "llama3"),
            ("RAGO_LLM_API_KEY", "secret"),
        ]))
        .unwrap();
        assert_eq!(config.progress_db(), PathBuf::from("/tmp/rago/progress.db"));
        assert_eq!(config.agent_workers, 5);
        assert_eq!(config.llm.providers[0].model_name, "llama3");
        assert_eq!(config.llm.embedders[0].api_key.as_deref(), Some("secret"));

        let err = Config::from_lookup(lookup(&[("RAGO_STEP_TIMEOUT_SECS", "soon")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(name, _) if name == "RAGO_STEP_TIMEOUT_SECS"));
        assert!(Config::from_lookup(lookup(&[("RAGO_AGENT_WORKERS", "0")])).is_err());
    }

    #[test]
    fn providers_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("providers.json");
        std::fs::write(
            &path,
            r#"{"strategy": "least_load", "providers": [{"name": "a", "base_url": "http://a", "model_name": "m", "capability": 9}]}"#,
        )
        .unwrap();
        let config = Config::from_lookup(lookup(&[("RAGO_PROVIDERS_FILE", path.to_str().unwrap())])).unwrap();
        assert_eq!(config.llm.providers.len(), 1);
        assert!(config.llm.embedders.is_empty());

        let missing = dir.path().join("missing.json");
        let err = Config::from_lookup(lookup(&[("RAGO_PROVIDERS_FILE", missing.to_str().unwrap())])).unwrap_err();
        assert!(matches!(err, ConfigError::Unreadable(_, _)));
    }
}
