//! ssfinetuning
//!
//! Training-setup defaults for supervised and semisupervised fine-tuning:
//! - Argument profiles and the training arguments built from them (`DefaultArgs`)
//! - Tokenizer selection with typed fallback and dataset encoding (`encode`)
//! - The default compute-metrics callable (`default_compute_metrics`)
//! - Column-oriented datasets with a batched map (`Dataset`, `DatasetDict`)

pub mod args;
pub mod config;
pub mod dataset;
pub mod defaults;
pub mod encode;
pub mod error;
pub mod kwargs;
pub mod metrics;
pub mod profile;
pub mod tokenizer;

pub use args::{IntervalStrategy, SaveSteps, TrainingArguments};
pub use config::{FinetuneConfig, ProfileOverrides};
pub use dataset::{Batch, BatchMap, Dataset, DatasetDict};
pub use defaults::{DefaultArgs, PreparedDataset, Resolution, ResolveWarning};
pub use encode::{encode, encode_with, DatasetEncoder, DEFAULT_TEXT_COLUMN};
pub use error::{FinetuneError, FinetuneResult, TokenizerLoadError};
pub use kwargs::{extract_keys, DeclaredParams, KwargValue, Kwargs, TrainerParams};
pub use metrics::{
    compute_metrics_with, default_compute_metrics, BuiltinMetricLoader, ComputeMetrics, EvalPrediction, Metric,
    MetricConfig, MetricLoader, MetricOutput,
};
pub use profile::ArgumentProfile;
pub use tokenizer::{
    load_with_fallback, EncodedText, FallbackPolicy, HfTokenizer, HubTokenizerLoader, SharedTokenizer, TextTokenizer,
    TokenizerConfig, TokenizerLoader, TokenizerRequest, FALLBACK_MAX_LENGTH, FALLBACK_TOKENIZER,
};
