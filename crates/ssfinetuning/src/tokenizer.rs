//! Tokenizer loading for dataset encoding.
//!
//! Loading goes through the [`TokenizerLoader`] seam so the hub-backed loader can
//! be swapped out. Load failures are classified into [`TokenizerLoadError`] and
//! the [`FallbackPolicy`] decides whether the fixed fallback tokenizer is used.

use crate::error::{FinetuneError, FinetuneResult, TokenizerLoadError};
use hf_hub::api::sync::{Api, ApiBuilder, ApiError};
use hf_hub::{Repo, RepoType};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokenizers::{Tokenizer, TruncationParams};
use tracing::{debug, info, warn};

/// Tokenizer used when the requested one is unavailable.
pub const FALLBACK_TOKENIZER: &str = "cardiffnlp/twitter-xlm-roberta-base-sentiment";

/// Maximum sequence length forced on the fallback tokenizer.
pub const FALLBACK_MAX_LENGTH: usize = 512;

/// Values of `model_max_length` at or above this mean "no limit".
const UNBOUNDED_MAX_LENGTH: f64 = 1e12;

/// Model-ready fields for one text.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EncodedText {
    pub input_ids: Vec<u32>,
    pub attention_mask: Vec<u32>,
    pub token_type_ids: Option<Vec<u32>>,
}

pub trait TextTokenizer: Send + Sync + fmt::Debug {
    /// Model id or path the tokenizer was loaded from.
    fn name_or_path(&self) -> &str;

    fn model_max_length(&self) -> Option<usize>;

    /// Whether encodings carry `token_type_ids`.
    fn produces_token_type_ids(&self) -> bool {
        false
    }

    /// Encode texts with special tokens, truncated to `model_max_length`.
    fn encode_batch(&self, texts: &[String]) -> FinetuneResult<Vec<EncodedText>>;
}

pub type SharedTokenizer = Arc<dyn TextTokenizer>;

/// A fast tokenizer backed by a `tokenizer.json`.
#[derive(Clone)]
pub struct HfTokenizer {
    name_or_path: String,
    model_max_length: Option<usize>,
    inner: Tokenizer,
}

impl HfTokenizer {
    pub fn from_file(
        name_or_path: impl Into<String>,
        path: &Path,
        model_max_length: Option<usize>,
    ) -> Result<Self, TokenizerLoadError> {
        let name_or_path = name_or_path.into();
        let inner = Tokenizer::from_file(path).map_err(|e| TokenizerLoadError::Incompatible {
            model: name_or_path.clone(),
            message: format!("cannot parse {}: {e}", path.display()),
        })?;
        Self::new(name_or_path, inner, model_max_length)
    }

    pub fn new(
        name_or_path: impl Into<String>,
        mut inner: Tokenizer,
        model_max_length: Option<usize>,
    ) -> Result<Self, TokenizerLoadError> {
        let name_or_path = name_or_path.into();
        if let Some(max_length) = model_max_length {
            let params = TruncationParams { max_length, ..Default::default() };
            inner.with_truncation(Some(params)).map_err(|e| TokenizerLoadError::Incompatible {
                model: name_or_path.clone(),
                message: format!("invalid truncation length {max_length}: {e}"),
            })?;
        }
        Ok(Self { name_or_path, model_max_length, inner })
    }
}

impl fmt::Debug for HfTokenizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HfTokenizer")
            .field("name_or_path", &self.name_or_path)
            .field("model_max_length", &self.model_max_length)
            .finish_non_exhaustive()
    }
}

impl TextTokenizer for HfTokenizer {
    fn name_or_path(&self) -> &str {
        &self.name_or_path
    }

    fn model_max_length(&self) -> Option<usize> {
        self.model_max_length
    }

    fn produces_token_type_ids(&self) -> bool {
        true
    }

    fn encode_batch(&self, texts: &[String]) -> FinetuneResult<Vec<EncodedText>> {
        let encodings = self.inner.encode_batch(texts.to_vec(), true).map_err(|e| {
            FinetuneError::Other(anyhow::anyhow!("tokenizer `{}` failed to encode batch: {e}", self.name_or_path))
        })?;

        Ok(encodings
            .iter()
            .map(|enc| EncodedText {
                input_ids: enc.get_ids().to_vec(),
                attention_mask: enc.get_attention_mask().to_vec(),
                token_type_ids: Some(enc.get_type_ids().to_vec()),
            })
            .collect())
    }
}

/// What to load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenizerRequest {
    pub model_name: String,
    /// Only fast (`tokenizer.json`) tokenizers are available.
    pub use_fast: bool,
    /// Overrides the length read from `tokenizer_config.json`.
    pub model_max_length: Option<usize>,
}

impl TokenizerRequest {
    #[must_use]
    pub fn new(model_name: impl Into<String>) -> Self {
        Self { model_name: model_name.into(), use_fast: true, model_max_length: None }
    }

    #[must_use]
    pub fn with_max_length(mut self, max_length: usize) -> Self {
        self.model_max_length = Some(max_length);
        self
    }
}

pub trait TokenizerLoader: Send + Sync {
    fn load(&self, request: &TokenizerRequest) -> Result<SharedTokenizer, TokenizerLoadError>;
}

/// When to replace a failed load with the fallback tokenizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackPolicy {
    /// Any tokenizer load error.
    #[default]
    OnLoadError,
    /// Only when the model does not provide a tokenizer.
    OnNotFound,
    Never,
}

impl FallbackPolicy {
    #[must_use]
    pub fn allows(self, error: &TokenizerLoadError) -> bool {
        match self {
            Self::OnLoadError => true,
            Self::OnNotFound => error.is_not_found(),
            Self::Never => false,
        }
    }
}

/// Tokenizer selection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenizerConfig {
    #[serde(default = "default_fallback_model")]
    pub fallback_model: String,

    #[serde(default = "default_fallback_max_length")]
    pub fallback_max_length: usize,

    #[serde(default)]
    pub fallback_policy: FallbackPolicy,

    /// Hub revision (branch, tag or commit).
    #[serde(default = "default_revision")]
    pub revision: String,

    /// Hub cache directory; the hub client's default when unset.
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,

    #[serde(default)]
    pub token: Option<String>,

    /// Rows per batch when mapping the dataset.
    #[serde(default = "default_map_batch_size")]
    pub map_batch_size: usize,
}

fn default_fallback_model() -> String {
    FALLBACK_TOKENIZER.to_string()
}

fn default_fallback_max_length() -> usize {
    FALLBACK_MAX_LENGTH
}

fn default_revision() -> String {
    "main".to_string()
}

fn default_map_batch_size() -> usize {
    1000
}

impl Default for TokenizerConfig {
    fn default() -> Self {
        Self {
            fallback_model: default_fallback_model(),
            fallback_max_length: default_fallback_max_length(),
            fallback_policy: FallbackPolicy::default(),
            revision: default_revision(),
            cache_dir: None,
            token: None,
            map_batch_size: default_map_batch_size(),
        }
    }
}

impl TokenizerConfig {
    #[must_use]
    pub fn fallback_request(&self) -> TokenizerRequest {
        TokenizerRequest::new(&self.fallback_model).with_max_length(self.fallback_max_length)
    }
}

/// Load `request`, falling back to the configured tokenizer when `policy` allows.
pub fn load_with_fallback(
    loader: &dyn TokenizerLoader,
    request: &TokenizerRequest,
    config: &TokenizerConfig,
) -> FinetuneResult<SharedTokenizer> {
    match loader.load(request) {
        Ok(tokenizer) => {
            debug!(model = %request.model_name, "loaded tokenizer");
            Ok(tokenizer)
        }
        Err(e) if config.fallback_policy.allows(&e) => {
            warn!(
                model = %request.model_name,
                error = %e,
                fallback = %config.fallback_model,
                "tokenizer unavailable, using fallback tokenizer"
            );
            Ok(loader.load(&config.fallback_request())?)
        }
        Err(e) => Err(e.into()),
    }
}

/// Loads tokenizers from a local directory / file or from the Hugging Face hub.
#[derive(Debug, Clone, Default)]
pub struct HubTokenizerLoader {
    cache_dir: Option<PathBuf>,
    token: Option<String>,
    revision: Option<String>,
}

impl HubTokenizerLoader {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn from_config(config: &TokenizerConfig) -> Self {
        Self {
            cache_dir: config.cache_dir.clone(),
            token: config.token.clone(),
            revision: Some(config.revision.clone()),
        }
    }

    fn load_local(&self, request: &TokenizerRequest, path: &Path) -> Result<SharedTokenizer, TokenizerLoadError> {
        let (tokenizer_file, config_file) = if path.is_dir() {
            (path.join("tokenizer.json"), Some(path.join("tokenizer_config.json")))
        } else {
            (path.to_path_buf(), path.parent().map(|p| p.join("tokenizer_config.json")))
        };

        if !tokenizer_file.is_file() {
            return Err(TokenizerLoadError::NotFound { model: request.model_name.clone() });
        }

        let max_length = match request.model_max_length {
            Some(n) => Some(n),
            None => match config_file.filter(|p| p.is_file()) {
                Some(p) => read_model_max_length(&request.model_name, &p)?,
                None => None,
            },
        };

        info!(path = %tokenizer_file.display(), "loading tokenizer from local path");
        let tokenizer = HfTokenizer::from_file(&request.model_name, &tokenizer_file, max_length)?;
        Ok(Arc::new(tokenizer))
    }

    fn build_api(&self, model: &str) -> Result<Api, TokenizerLoadError> {
        let mut builder = ApiBuilder::new().with_token(self.token.clone());
        if let Some(dir) = &self.cache_dir {
            builder = builder.with_cache_dir(dir.clone());
        }
        builder.build().map_err(|e| classify_hub_error(model, e))
    }

    fn load_hub(&self, request: &TokenizerRequest) -> Result<SharedTokenizer, TokenizerLoadError> {
        let model = request.model_name.as_str();
        let api = self.build_api(model)?;
        let repo = match self.revision.as_deref() {
            None | Some("main") => api.model(model.to_string()),
            Some(rev) => api.repo(Repo::with_revision(model.to_string(), RepoType::Model, rev.to_string())),
        };

        let tokenizer_file = repo.get("tokenizer.json").map_err(|e| classify_hub_error(model, e))?;

        let max_length = match request.model_max_length {
            Some(n) => Some(n),
            None => match repo.get("tokenizer_config.json") {
                Ok(p) => read_model_max_length(model, &p)?,
                Err(e) => {
                    debug!(model, error = %e, "no tokenizer_config.json, leaving length unbounded");
                    None
                }
            },
        };

        info!(model, "loaded tokenizer from hub");
        let tokenizer = HfTokenizer::from_file(model, &tokenizer_file, max_length)?;
        Ok(Arc::new(tokenizer))
    }
}

impl TokenizerLoader for HubTokenizerLoader {
    fn load(&self, request: &TokenizerRequest) -> Result<SharedTokenizer, TokenizerLoadError> {
        if !request.use_fast {
            return Err(TokenizerLoadError::Incompatible {
                model: request.model_name.clone(),
                message: "only fast tokenizers are supported".to_string(),
            });
        }

        let path = Path::new(&request.model_name);
        if path.exists() {
            self.load_local(request, path)
        } else {
            self.load_hub(request)
        }
    }
}

fn read_model_max_length(model: &str, path: &Path) -> Result<Option<usize>, TokenizerLoadError> {
    let bytes = std::fs::read(path).map_err(|source| TokenizerLoadError::Io { model: model.to_string(), source })?;
    let config: serde_json::Value = serde_json::from_slice(&bytes).map_err(|e| TokenizerLoadError::Incompatible {
        model: model.to_string(),
        message: format!("cannot parse {}: {e}", path.display()),
    })?;

    let Some(value) = config.get("model_max_length").and_then(serde_json::Value::as_f64) else {
        return Ok(None);
    };
    if !value.is_finite() || value >= UNBOUNDED_MAX_LENGTH || value < 1.0 {
        return Ok(None);
    }
    Ok(Some(value as usize))
}

fn classify_hub_error(model: &str, error: ApiError) -> TokenizerLoadError {
    match error {
        ApiError::RequestError(e) => {
            let message = e.to_string();
            // The hub answers 401 for repos that do not exist when unauthenticated.
            if message.contains("404") || message.contains("401") {
                TokenizerLoadError::NotFound { model: model.to_string() }
            } else {
                TokenizerLoadError::Network { model: model.to_string(), message }
            }
        }
        other => TokenizerLoadError::Network { model: model.to_string(), message: other.to_string() },
    }
}
