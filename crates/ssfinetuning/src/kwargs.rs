//! Keyword-argument requests and their partitioning by declared parameter names.

use crate::error::{FinetuneError, FinetuneResult};
use crate::metrics::ComputeMetrics;
use crate::tokenizer::SharedTokenizer;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// A parameter list declared by a downstream constructor.
pub trait DeclaredParams {
    const PARAMS: &'static [&'static str];

    fn accepts(key: &str) -> bool {
        Self::PARAMS.contains(&key)
    }
}

/// Parameters accepted by the trainer constructor.
#[derive(Debug, Clone, Copy)]
pub struct TrainerParams;

impl DeclaredParams for TrainerParams {
    const PARAMS: &'static [&'static str] = &[
        "model",
        "args",
        "data_collator",
        "train_dataset",
        "eval_dataset",
        "tokenizer",
        "model_init",
        "compute_metrics",
        "callbacks",
        "optimizers",
        "preprocess_logits_for_metrics",
    ];
}

#[derive(Clone)]
pub enum KwargValue {
    Value(Value),
    Tokenizer(SharedTokenizer),
    ComputeMetrics(ComputeMetrics),
}

impl KwargValue {
    #[must_use]
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Self::Value(v) => Some(v),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_tokenizer(&self) -> Option<&SharedTokenizer> {
        match self {
            Self::Tokenizer(t) => Some(t),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_compute_metrics(&self) -> Option<&ComputeMetrics> {
        match self {
            Self::ComputeMetrics(m) => Some(m),
            _ => None,
        }
    }

    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Self::Value(Value::Null) => "null",
            Self::Value(Value::Bool(_)) => "bool",
            Self::Value(Value::Number(_)) => "number",
            Self::Value(Value::String(_)) => "string",
            Self::Value(Value::Array(_)) => "array",
            Self::Value(Value::Object(_)) => "mapping",
            Self::Tokenizer(_) => "tokenizer",
            Self::ComputeMetrics(_) => "compute_metrics",
        }
    }
}

impl fmt::Debug for KwargValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(v) => f.debug_tuple("Value").field(v).finish(),
            Self::Tokenizer(t) => f.debug_tuple("Tokenizer").field(&t.name_or_path()).finish(),
            Self::ComputeMetrics(m) => f.debug_tuple("ComputeMetrics").field(m).finish(),
        }
    }
}

impl From<Value> for KwargValue {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

impl From<&str> for KwargValue {
    fn from(value: &str) -> Self {
        Self::Value(Value::from(value))
    }
}

impl From<String> for KwargValue {
    fn from(value: String) -> Self {
        Self::Value(Value::from(value))
    }
}

impl From<bool> for KwargValue {
    fn from(value: bool) -> Self {
        Self::Value(Value::from(value))
    }
}

impl From<i64> for KwargValue {
    fn from(value: i64) -> Self {
        Self::Value(Value::from(value))
    }
}

impl From<f64> for KwargValue {
    fn from(value: f64) -> Self {
        Self::Value(Value::from(value))
    }
}

impl From<SharedTokenizer> for KwargValue {
    fn from(value: SharedTokenizer) -> Self {
        Self::Tokenizer(value)
    }
}

impl From<ComputeMetrics> for KwargValue {
    fn from(value: ComputeMetrics) -> Self {
        Self::ComputeMetrics(value)
    }
}

/// Keyword arguments supplied by the caller of a training setup.
#[derive(Debug, Clone, Default)]
pub struct Kwargs(BTreeMap<String, KwargValue>);

impl Kwargs {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<KwargValue>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<KwargValue>) -> Option<KwargValue> {
        self.0.insert(key.into(), value.into())
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&KwargValue> {
        self.0.get(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<KwargValue> {
        self.0.remove(key)
    }

    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Move every entry of `other` into `self`, replacing existing keys.
    pub fn extend(&mut self, other: Self) {
        self.0.extend(other.0);
    }

    #[must_use]
    pub fn tokenizer(&self) -> Option<&SharedTokenizer> {
        self.get("tokenizer").and_then(KwargValue::as_tokenizer)
    }

    #[must_use]
    pub fn compute_metrics(&self) -> Option<&ComputeMetrics> {
        self.get("compute_metrics").and_then(KwargValue::as_compute_metrics)
    }

    /// Remove `key` as a string, or `default` when absent.
    /// The string under `key`, or `default` when absent. Does not remove the key.
    pub fn string_or(&self, key: &str, default: &str) -> FinetuneResult<String> {
        match self.get(key) {
            None => Ok(default.to_string()),
            Some(KwargValue::Value(Value::String(s))) => Ok(s.clone()),
            Some(other) => Err(FinetuneError::InvalidKwarg {
                key: key.to_string(),
                message: format!("expected a string, got {}", other.kind()),
            }),
        }
    }
}

impl<K: Into<String>, V: Into<KwargValue>> FromIterator<(K, V)> for Kwargs {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// Move the keys accepted by `T` out of `kwargs`.
pub fn extract_keys<T: DeclaredParams>(kwargs: &mut Kwargs) -> Kwargs {
    let accepted: Vec<String> = kwargs.keys().filter(|k| T::accepts(k)).map(str::to_string).collect();
    accepted
        .into_iter()
        .filter_map(|key| kwargs.remove(&key).map(|value| (key, value)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct TwoParams;

    impl DeclaredParams for TwoParams {
        const PARAMS: &'static [&'static str] = &["alpha", "beta"];
    }

    #[test]
    fn test_extract_keys_moves_only_declared_params() {
        let mut kwargs = Kwargs::new().with("alpha", 1_i64).with("gamma", "x").with("beta", true);

        let extracted = extract_keys::<TwoParams>(&mut kwargs);

        assert_eq!(extracted.keys().collect::<Vec<_>>(), vec!["alpha", "beta"]);
        assert_eq!(kwargs.keys().collect::<Vec<_>>(), vec!["gamma"]);
    }

    #[test]
    fn test_trainer_params_accept_tokenizer_and_metrics() {
        assert!(TrainerParams::accepts("tokenizer"));
        assert!(TrainerParams::accepts("compute_metrics"));
        assert!(!TrainerParams::accepts("text_column_name"));
        assert!(!TrainerParams::accepts("args_ta_sup"));
    }

    #[test]
    fn test_string_or_defaults_and_rejects_non_strings() {
        let kwargs = Kwargs::new().with("text_column_name", json!(3));
        assert!(kwargs.string_or("text_column_name", "sentence").is_err());
        assert!(kwargs.contains_key("text_column_name"));

        let kwargs = Kwargs::new().with("text_column_name", "tweet");
        assert_eq!(kwargs.string_or("text_column_name", "sentence").unwrap(), "tweet");
        assert_eq!(Kwargs::new().string_or("text_column_name", "sentence").unwrap(), "sentence");
    }

    #[test]
    fn test_extend_overwrites_existing_keys() {
        let mut kwargs = Kwargs::new().with("a", 1_i64);
        kwargs.extend(Kwargs::new().with("a", 2_i64).with("b", 3_i64));
        assert_eq!(kwargs.get("a").and_then(KwargValue::as_value), Some(&json!(2)));
        assert_eq!(kwargs.len(), 2);
    }
}
