//! Configuration for Storyledger
//!
//! Every knob the budget, pruning and revision logic depends on lives here so
//! those algorithms can be exercised with injected values. A config file is
//! plain TOML; any missing field falls back to its default.
//!
//! ```toml
//! token_budget = 5000
//! recency_window = 3
//!
//! [model]
//! base_url = "http://localhost:11434/v1"
//! model = "llama3.1"
//! ```

use crate::{LedgerError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Default token budget for an assembled context block
pub const DEFAULT_TOKEN_BUDGET: usize = 5_000;

/// Units kept verbatim on the first assembly pass
pub const DEFAULT_RECENCY_WINDOW: u32 = 3;

/// Units kept verbatim on the degraded second pass
pub const DEFAULT_FALLBACK_RECENCY_WINDOW: u32 = 2;

/// Age (in units) after which used/expired callbacks are pruned
pub const DEFAULT_PRUNE_AGE: u32 = 3;

/// Any character scoring below this triggers a revision
pub const DEFAULT_REVISION_THRESHOLD: f64 = 0.8;

/// Per-call timeout for model requests
pub const DEFAULT_MODEL_TIMEOUT_SECS: u64 = 60;

/// Default model name when neither config nor environment set one
const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// Tunables for the continuity core
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContinuityConfig {
    /// Hard ceiling for the assembled context block (estimated tokens)
    pub token_budget: usize,

    /// Units kept in full detail on the first pass
    pub recency_window: u32,

    /// Units kept in full detail when the first pass is over budget
    pub fallback_recency_window: u32,

    /// Minimum age before a used/expired callback is dropped
    pub prune_age: u32,

    /// Authenticity score under which a character's voice is flagged
    pub revision_threshold: f64,

    /// Timeout applied to every model call, in seconds
    pub model_timeout_secs: u64,

    /// Directory used by the JSON file store
    pub store_dir: PathBuf,

    /// Language model endpoint settings
    pub model: ModelSettings,
}

impl Default for ContinuityConfig {
    fn default() -> Self {
        Self {
            token_budget: DEFAULT_TOKEN_BUDGET,
            recency_window: DEFAULT_RECENCY_WINDOW,
            fallback_recency_window: DEFAULT_FALLBACK_RECENCY_WINDOW,
            prune_age: DEFAULT_PRUNE_AGE,
            revision_threshold: DEFAULT_REVISION_THRESHOLD,
            model_timeout_secs: DEFAULT_MODEL_TIMEOUT_SECS,
            store_dir: default_store_dir(),
            model: ModelSettings::default(),
        }
    }
}

impl ContinuityConfig {
    /// Load a config from a TOML file, applying environment overrides.
    pub async fn load(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        let mut config: Self = toml::from_str(&content)?;
        config.apply_env_overrides();
        config.validate()?;
        info!(
            "Loaded config from {:?}: budget={}, window={}/{}, model='{}'",
            path,
            config.token_budget,
            config.recency_window,
            config.fallback_recency_window,
            config.model.model
        );
        Ok(config)
    }

    /// Load from `path` if it exists, otherwise fall back to defaults.
    pub async fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) if p.exists() => Self::load(p).await,
            Some(p) => {
                debug!("Config file {:?} not found, using defaults", p);
                let mut config = Self::default();
                config.apply_env_overrides();
                Ok(config)
            }
            None => {
                let mut config = Self::default();
                config.apply_env_overrides();
                Ok(config)
            }
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(model) = std::env::var("STORYLEDGER_MODEL") {
            let model = model.trim();
            if !model.is_empty() {
                self.model.model = model.to_string();
            }
        }
    }

    /// Reject combinations the assembler cannot honour.
    pub fn validate(&self) -> Result<()> {
        if self.token_budget == 0 {
            return Err(LedgerError::Config("token_budget must be positive".to_string()));
        }
        if self.fallback_recency_window > self.recency_window {
            return Err(LedgerError::Config(format!(
                "fallback_recency_window ({}) must not exceed recency_window ({})",
                self.fallback_recency_window, self.recency_window
            )));
        }
        if !(0.0..=1.0).contains(&self.revision_threshold) {
            return Err(LedgerError::Config(format!(
                "revision_threshold {} is outside [0, 1]",
                self.revision_threshold
            )));
        }
        Ok(())
    }

    pub fn model_timeout(&self) -> Duration {
        Duration::from_secs(self.model_timeout_secs)
    }

    pub fn with_token_budget(mut self, budget: usize) -> Self {
        self.token_budget = budget;
        self
    }

    pub fn with_recency_windows(mut self, primary: u32, fallback: u32) -> Self {
        self.recency_window = primary;
        self.fallback_recency_window = fallback;
        self
    }

    pub fn with_revision_threshold(mut self, threshold: f64) -> Self {
        self.revision_threshold = threshold;
        self
    }

    pub fn with_model_timeout(mut self, timeout: Duration) -> Self {
        self.model_timeout_secs = timeout.as_secs().max(1);
        self
    }

    pub fn with_store_dir(mut self, dir: PathBuf) -> Self {
        self.store_dir = dir;
        self
    }
}

/// OpenAI-compatible Chat Completions endpoint settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    /// Base URL, without the `/chat/completions` suffix
    pub base_url: String,

    /// Model identifier sent with each request
    pub model: String,

    /// Environment variable holding the API key (unset = no auth header)
    pub api_key_env: Option<String>,

    /// Completion cap for a single request
    pub max_tokens: u32,

    pub temperature: f32,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            base_url: std::env::var("OPENAI_BASE_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
            model: DEFAULT_MODEL.to_string(),
            api_key_env: Some("OPENAI_API_KEY".to_string()),
            max_tokens: 4096,
            temperature: 0.2,
        }
    }
}

/// `<data dir>/storyledger`, or a relative directory when no data dir exists.
fn default_store_dir() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("storyledger"))
        .unwrap_or_else(|| PathBuf::from(".storyledger"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ContinuityConfig::default();
        assert_eq!(config.token_budget, 5_000);
        assert_eq!(config.recency_window, 3);
        assert_eq!(config.fallback_recency_window, 2);
        assert_eq!(config.prune_age, 3);
        assert!((config.revision_threshold - 0.8).abs() < f64::EPSILON);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: ContinuityConfig = toml::from_str(
            r#"
token_budget = 1200

[model]
model = "local-model"
"#,
        )
        .unwrap();
        assert_eq!(config.token_budget, 1200);
        assert_eq!(config.recency_window, 3);
        assert_eq!(config.model.model, "local-model");
        assert_eq!(config.model.max_tokens, 4096);
    }

    #[test]
    fn test_validate_rejects_inverted_windows() {
        let config = ContinuityConfig::default().with_recency_windows(2, 3);
        assert!(matches!(config.validate(), Err(LedgerError::Config(_))));
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("storyledger.toml");
        tokio::fs::write(&path, "prune_age = 5\nrevision_threshold = 0.7\n")
            .await
            .unwrap();

        let config = ContinuityConfig::load(&path).await.unwrap();
        assert_eq!(config.prune_age, 5);
        assert!((config.revision_threshold - 0.7).abs() < f64::EPSILON);
    }
}
