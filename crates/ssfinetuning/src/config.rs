//! Configuration file support.
//!
//! A TOML file can set the text column, tokenizer fallback, metric and
//! profile overrides:
//!
//! ```toml
//! text_column_name = "tweet"
//!
//! [tokenizer]
//! fallback_model = "xlm-roberta-base"
//! fallback_policy = "on_not_found"
//!
//! [metric]
//! family = "glue"
//! config = "sst2"
//!
//! [profiles.supervised]
//! learning_rate = 3e-5
//!
//! [profiles.semisupervised]
//! num_train_epochs = 4
//! ```

use crate::encode::DEFAULT_TEXT_COLUMN;
use crate::error::{FinetuneError, FinetuneResult};
use crate::metrics::MetricConfig;
use crate::tokenizer::TokenizerConfig;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tracing::debug;

pub const ENV_FALLBACK_TOKENIZER: &str = "SSFT_FALLBACK_TOKENIZER";
pub const ENV_TOKENIZER_CACHE_DIR: &str = "SSFT_TOKENIZER_CACHE_DIR";
pub const ENV_TEXT_COLUMN: &str = "SSFT_TEXT_COLUMN";
pub const ENV_HF_TOKEN: &str = "HF_TOKEN";

/// Overrides applied on top of the built-in profiles.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfileOverrides {
    #[serde(default)]
    pub supervised: Map<String, Value>,
    #[serde(default)]
    pub semisupervised: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinetuneConfig {
    #[serde(default = "default_text_column_name")]
    pub text_column_name: String,

    #[serde(default)]
    pub tokenizer: TokenizerConfig,

    #[serde(default)]
    pub metric: MetricConfig,

    #[serde(default)]
    pub profiles: ProfileOverrides,
}

fn default_text_column_name() -> String {
    DEFAULT_TEXT_COLUMN.to_string()
}

impl Default for FinetuneConfig {
    fn default() -> Self {
        Self {
            text_column_name: default_text_column_name(),
            tokenizer: TokenizerConfig::default(),
            metric: MetricConfig::default(),
            profiles: ProfileOverrides::default(),
        }
    }
}

impl FinetuneConfig {
    /// Load configuration from a TOML file.
    pub fn load_from_file(path: &Path) -> FinetuneResult<Self> {
        if !path.exists() {
            return Err(FinetuneError::Config(format!("configuration file not found: {}", path.display())));
        }

        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| FinetuneError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;

        debug!(path = %path.display(), "loaded finetuning configuration");
        Ok(config)
    }

    /// Apply overrides from process environment variables.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    /// Apply overrides from `lookup`; empty values are ignored.
    pub fn apply_env_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(model) = get(ENV_FALLBACK_TOKENIZER) {
            self.tokenizer.fallback_model = model;
        }
        if let Some(dir) = get(ENV_TOKENIZER_CACHE_DIR) {
            self.tokenizer.cache_dir = Some(PathBuf::from(dir));
        }
        if let Some(column) = get(ENV_TEXT_COLUMN) {
            self.text_column_name = column;
        }
        if self.tokenizer.token.is_none() {
            self.tokenizer.token = get(ENV_HF_TOKEN);
        }
    }

    pub fn validate(&self) -> FinetuneResult<()> {
        if self.text_column_name.trim().is_empty() {
            return Err(FinetuneError::Config("text_column_name must not be empty".to_string()));
        }
        if self.tokenizer.fallback_model.trim().is_empty() {
            return Err(FinetuneError::Config("tokenizer.fallback_model must not be empty".to_string()));
        }
        if self.tokenizer.fallback_max_length == 0 {
            return Err(FinetuneError::Config("tokenizer.fallback_max_length must be >= 1".to_string()));
        }
        if self.tokenizer.map_batch_size == 0 {
            return Err(FinetuneError::Config("tokenizer.map_batch_size must be >= 1".to_string()));
        }
        if self.metric.family.trim().is_empty() {
            return Err(FinetuneError::Config("metric.family must not be empty".to_string()));
        }
        Ok(())
    }
}
