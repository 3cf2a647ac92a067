use thiserror::Error;

pub type FinetuneResult<T> = std::result::Result<T, FinetuneError>;

#[derive(Debug, Error)]
pub enum FinetuneError {
    #[error("invalid training arguments: {0}")]
    InvalidArguments(String),

    #[error("invalid keyword argument `{key}`: {message}")]
    InvalidKwarg { key: String, message: String },

    #[error("dataset error: {0}")]
    Dataset(String),

    #[error(transparent)]
    Tokenizer(#[from] TokenizerLoadError),

    #[error("metric error: {0}")]
    Metric(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Why a tokenizer could not be loaded.
///
/// Only these failures are eligible for the fallback tokenizer; anything else
/// surfaces as a regular [`FinetuneError`].
#[derive(Debug, Error)]
pub enum TokenizerLoadError {
    /// The model id or path does not provide a tokenizer.
    #[error("tokenizer not found for `{model}`")]
    NotFound { model: String },

    /// The hub could not be reached or answered with an unexpected error.
    #[error("network error while fetching tokenizer for `{model}`: {message}")]
    Network { model: String, message: String },

    /// A tokenizer exists but cannot be used (corrupt cache, slow-only, bad json).
    #[error("tokenizer for `{model}` is incompatible: {message}")]
    Incompatible { model: String, message: String },

    #[error("i/o error while loading tokenizer for `{model}`: {source}")]
    Io {
        model: String,
        #[source]
        source: std::io::Error,
    },
}

impl TokenizerLoadError {
    #[must_use]
    pub fn model(&self) -> &str {
        match self {
            Self::NotFound { model }
            | Self::Network { model, .. }
            | Self::Incompatible { model, .. }
            | Self::Io { model, .. } => model,
        }
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}
