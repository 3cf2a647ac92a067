use crate::dataset::{Batch, BatchMap};
use crate::error::{FinetuneError, FinetuneResult};
use crate::tokenizer::{
    load_with_fallback, HubTokenizerLoader, SharedTokenizer, TokenizerConfig, TokenizerLoader, TokenizerRequest,
};
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

/// Column read by the encoder when the caller does not name one.
pub const DEFAULT_TEXT_COLUMN: &str = "sentence";

/// Tokenizes a text column into `input_ids`, `attention_mask` and `token_type_ids`.
#[derive(Clone)]
pub struct DatasetEncoder {
    loader: Arc<dyn TokenizerLoader>,
    config: TokenizerConfig,
}

impl DatasetEncoder {
    pub fn new(loader: Arc<dyn TokenizerLoader>, config: TokenizerConfig) -> Self {
        Self { loader, config }
    }

    /// Hub-backed encoder using `config` for fallback and cache settings.
    #[must_use]
    pub fn hub(config: TokenizerConfig) -> Self {
        Self::new(Arc::new(HubTokenizerLoader::from_config(&config)), config)
    }

    #[must_use]
    pub fn config(&self) -> &TokenizerConfig {
        &self.config
    }

    pub fn load_tokenizer(&self, model_name: &str) -> FinetuneResult<SharedTokenizer> {
        load_with_fallback(self.loader.as_ref(), &TokenizerRequest::new(model_name), &self.config)
    }

    /// Load the tokenizer for `model_name` and apply it to `text_column`.
    pub fn encode<D: BatchMap>(
        &self,
        dataset: D,
        model_name: &str,
        text_column: &str,
    ) -> FinetuneResult<(D, SharedTokenizer)> {
        let tokenizer = self.load_tokenizer(model_name)?;
        info!(
            model = model_name,
            tokenizer = tokenizer.name_or_path(),
            column = text_column,
            "encoding dataset"
        );

        let encoded = encode_with(dataset, &tokenizer, text_column, self.config.map_batch_size)?;
        Ok((encoded, tokenizer))
    }
}

impl Default for DatasetEncoder {
    fn default() -> Self {
        Self::hub(TokenizerConfig::default())
    }
}

impl std::fmt::Debug for DatasetEncoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatasetEncoder").field("config", &self.config).finish_non_exhaustive()
    }
}

/// Encode `dataset` with the hub tokenizer for `model_name`, falling back to the
/// default fallback tokenizer when it cannot be loaded.
pub fn encode<D: BatchMap>(
    dataset: D,
    model_name: &str,
    text_column_name: &str,
) -> FinetuneResult<(D, SharedTokenizer)> {
    DatasetEncoder::default().encode(dataset, model_name, text_column_name)
}

/// Apply an already loaded tokenizer to `text_column`, batch by batch.
pub fn encode_with<D: BatchMap>(
    dataset: D,
    tokenizer: &SharedTokenizer,
    text_column: &str,
    batch_size: usize,
) -> FinetuneResult<D> {
    dataset.map_batched(batch_size, |batch| tokenize_batch(tokenizer, batch, text_column))
}

fn tokenize_batch(tokenizer: &SharedTokenizer, batch: &Batch, text_column: &str) -> FinetuneResult<Batch> {
    let column = match batch.get(text_column) {
        Some(column) => column.as_slice(),
        // a split without rows may also have lost its schema
        None if batch.values().all(Vec::is_empty) => &[],
        None => return Err(FinetuneError::Dataset(format!("text column `{text_column}` not found"))),
    };

    let texts = column
        .iter()
        .enumerate()
        .map(|(idx, v)| match v {
            Value::String(s) => Ok(s.clone()),
            other => Err(FinetuneError::Dataset(format!(
                "text column `{text_column}` row {idx} is not a string: {other}"
            ))),
        })
        .collect::<FinetuneResult<Vec<String>>>()?;

    let encodings = tokenizer.encode_batch(&texts)?;
    if encodings.len() != texts.len() {
        return Err(FinetuneError::Dataset(format!(
            "tokenizer returned {} encodings for {} texts",
            encodings.len(),
            texts.len()
        )));
    }

    let with_types = tokenizer.produces_token_type_ids();
    let mut input_ids = Vec::with_capacity(texts.len());
    let mut attention_mask = Vec::with_capacity(texts.len());
    let mut token_type_ids = Vec::with_capacity(texts.len());
    for enc in encodings {
        input_ids.push(Value::from(enc.input_ids));
        attention_mask.push(Value::from(enc.attention_mask));
        if with_types {
            let types = enc.token_type_ids.ok_or_else(|| {
                FinetuneError::Dataset(format!(
                    "tokenizer `{}` returned an encoding without token_type_ids",
                    tokenizer.name_or_path()
                ))
            })?;
            token_type_ids.push(Value::from(types));
        }
    }

    let mut out = Batch::new();
    out.insert("input_ids".to_string(), input_ids);
    out.insert("attention_mask".to_string(), attention_mask);
    if with_types {
        out.insert("token_type_ids".to_string(), token_type_ids);
    }
    Ok(out)
}
