use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// A named set of training-argument defaults, keyed by argument name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArgumentProfile(Map<String, Value>);

impl ArgumentProfile {
    #[must_use]
    pub fn from_map(map: Map<String, Value>) -> Self {
        Self(map)
    }

    /// Defaults for the supervised (labeled-only) run.
    #[must_use]
    pub fn supervised() -> Self {
        let defaults = [
            ("output_dir", json!("glue")),
            ("evaluation_strategy", json!("epoch")),
            ("learning_rate", json!(2e-5)),
            ("per_device_train_batch_size", json!(16)),
            ("per_device_eval_batch_size", json!(16)),
            ("num_train_epochs", json!(10)),
            ("weight_decay", json!(0.01)),
            ("metric_for_best_model", json!("matthews_correlation")),
            ("load_best_model_at_end", json!(true)),
            ("disable_tqdm", json!(true)),
            ("no_cuda", json!(true)),
        ];
        Self(defaults.into_iter().map(|(k, v)| (k.to_string(), v)).collect())
    }

    /// Supervised defaults with periodic checkpoint saving disabled.
    #[must_use]
    pub fn semisupervised() -> Self {
        let mut profile = Self::supervised();
        profile.set("save_steps", "inf");
        profile
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(key.into(), value.into())
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

    /// Overwrite keys from `overrides`, keeping everything else.
    pub fn merge(&mut self, overrides: &Map<String, Value>) {
        for (key, value) in overrides {
            self.0.insert(key.clone(), value.clone());
        }
    }

    /// A copy of `self` with `overrides` applied.
    #[must_use]
    pub fn merged(&self, overrides: &Map<String, Value>) -> Self {
        let mut next = self.clone();
        next.merge(overrides);
        next
    }

    #[must_use]
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    #[must_use]
    pub fn to_value(&self) -> Value {
        Value::Object(self.0.clone())
    }
}
