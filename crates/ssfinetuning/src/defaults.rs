//! Default training setup for supervised and semisupervised runs.
//!
//! [`DefaultArgs`] fills in what the caller left out of a trainer keyword
//! request (metrics callable, tokenizer, encoded dataset) and keeps the two
//! argument profiles the training arguments are built from.

use crate::args::TrainingArguments;
use crate::config::FinetuneConfig;
use crate::dataset::BatchMap;
use crate::encode::DatasetEncoder;
use crate::error::{FinetuneError, FinetuneResult};
use crate::kwargs::{extract_keys, DeclaredParams, KwargValue, Kwargs, TrainerParams};
use crate::metrics::{compute_metrics_with, BuiltinMetricLoader, MetricConfig, MetricLoader};
use crate::profile::ArgumentProfile;
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

/// Kwarg holding overrides for the supervised profile.
pub const SUPERVISED_OVERRIDES_KEY: &str = "args_ta_sup";

/// Kwarg holding overrides for the semisupervised profile.
pub const SEMISUPERVISED_OVERRIDES_KEY: &str = "args_ta";

/// Kwarg naming the text column to encode.
pub const TEXT_COLUMN_KEY: &str = "text_column_name";

/// The dataset as returned by [`DefaultArgs::resolve`].
#[derive(Debug, Clone, PartialEq)]
pub enum PreparedDataset<D> {
    /// Tokenized by the default encoder.
    Encoded(D),
    /// Returned untouched because the caller supplied a tokenizer.
    Passthrough(D),
}

impl<D> PreparedDataset<D> {
    #[must_use]
    pub fn is_encoded(&self) -> bool {
        matches!(self, Self::Encoded(_))
    }

    #[must_use]
    pub fn encoded(&self) -> Option<&D> {
        match self {
            Self::Encoded(d) => Some(d),
            Self::Passthrough(_) => None,
        }
    }

    pub fn into_inner(self) -> D {
        match self {
            Self::Encoded(d) | Self::Passthrough(d) => d,
        }
    }
}

/// Non-fatal findings from [`DefaultArgs::resolve`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveWarning {
    /// A tokenizer was supplied, so the dataset was not encoded.
    TokenizerSupplied,
    /// A profile override was not a mapping and was left in the kwargs.
    IgnoredOverride { key: String, kind: &'static str },
}

impl std::fmt::Display for ResolveWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TokenizerSupplied => f.write_str(
                "tokenizer found; the dataset is returned unencoded, encode it with the same tokenizer \
                 (see `encode_with`)",
            ),
            Self::IgnoredOverride { key, kind } => {
                write!(f, "`{key}` must be a mapping of argument overrides, got {kind}; ignored")
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct Resolution<D> {
    pub dataset: PreparedDataset<D>,
    /// Snapshot of the semisupervised profile after overrides.
    pub profile: ArgumentProfile,
    pub warnings: Vec<ResolveWarning>,
}

/// Holds the supervised (`sup`) and semisupervised (`full`) argument profiles.
///
/// Profiles are updated in place: overrides from successive [`resolve`](Self::resolve)
/// calls accumulate until [`reset_profiles`](Self::reset_profiles).
pub struct DefaultArgs {
    base_sup: ArgumentProfile,
    base_full: ArgumentProfile,
    sup: ArgumentProfile,
    full: ArgumentProfile,
    text_column_name: String,
    encoder: DatasetEncoder,
    metric_loader: Arc<dyn MetricLoader>,
    metric: MetricConfig,
}

impl DefaultArgs {
    #[must_use]
    pub fn new() -> Self {
        Self::from_config(&FinetuneConfig::default())
    }

    /// Build from configuration. Profile overrides in `config` become part of
    /// the base profiles.
    #[must_use]
    pub fn from_config(config: &FinetuneConfig) -> Self {
        let base_sup = ArgumentProfile::supervised().merged(&config.profiles.supervised);
        let base_full = ArgumentProfile::semisupervised().merged(&config.profiles.semisupervised);
        Self {
            sup: base_sup.clone(),
            full: base_full.clone(),
            base_sup,
            base_full,
            text_column_name: config.text_column_name.clone(),
            encoder: DatasetEncoder::hub(config.tokenizer.clone()),
            metric_loader: Arc::new(BuiltinMetricLoader),
            metric: config.metric.clone(),
        }
    }

    #[must_use]
    pub fn with_encoder(mut self, encoder: DatasetEncoder) -> Self {
        self.encoder = encoder;
        self
    }

    #[must_use]
    pub fn with_metric_loader(mut self, loader: Arc<dyn MetricLoader>) -> Self {
        self.metric_loader = loader;
        self
    }

    #[must_use]
    pub fn supervised_profile(&self) -> &ArgumentProfile {
        &self.sup
    }

    #[must_use]
    pub fn semisupervised_profile(&self) -> &ArgumentProfile {
        &self.full
    }

    /// Restore both profiles to their base values.
    pub fn reset_profiles(&mut self) {
        self.sup = self.base_sup.clone();
        self.full = self.base_full.clone();
    }

    /// Fill in defaults for a trainer keyword request.
    ///
    /// Trainer-accepted keys are pulled out of `kwargs`, completed with a
    /// compute-metrics callable and a tokenizer (encoding `dataset` with it when
    /// the caller did not bring one), and merged back. `args_ta_sup` / `args_ta`
    /// mappings are applied to the profiles and removed; `text_column_name` is
    /// consumed when the dataset is encoded.
    ///
    /// Override mappings may only name [`TrainingArguments`] fields. On error
    /// neither `kwargs` nor the profiles are modified.
    pub fn resolve<D: BatchMap>(
        &mut self,
        dataset: D,
        model_name: &str,
        kwargs: &mut Kwargs,
    ) -> FinetuneResult<Resolution<D>> {
        let mut override_warnings = Vec::new();
        let sup_overrides = override_mapping(kwargs, SUPERVISED_OVERRIDES_KEY, &mut override_warnings)?;
        let full_overrides = override_mapping(kwargs, SEMISUPERVISED_OVERRIDES_KEY, &mut override_warnings)?;

        let compute_metrics = if kwargs.contains_key("compute_metrics") {
            None
        } else {
            Some(compute_metrics_with(self.metric_loader.as_ref(), &self.metric)?)
        };

        let mut warnings = Vec::new();
        let (dataset, tokenizer) = if kwargs.contains_key("tokenizer") {
            warn!("{}", ResolveWarning::TokenizerSupplied);
            warnings.push(ResolveWarning::TokenizerSupplied);
            (PreparedDataset::Passthrough(dataset), None)
        } else {
            let text_column = kwargs.string_or(TEXT_COLUMN_KEY, &self.text_column_name)?;
            let (encoded, tokenizer) = self.encoder.encode(dataset, model_name, &text_column)?;
            (PreparedDataset::Encoded(encoded), Some(tokenizer))
        };
        warnings.extend(override_warnings);

        let mut trainer_kwargs = extract_keys::<TrainerParams>(kwargs);
        if let Some(compute_metrics) = compute_metrics {
            trainer_kwargs.insert("compute_metrics", compute_metrics);
        }
        if let Some(tokenizer) = tokenizer {
            kwargs.remove(TEXT_COLUMN_KEY);
            trainer_kwargs.insert("tokenizer", tokenizer);
        }

        if let Some(overrides) = sup_overrides {
            apply_overrides(kwargs, SUPERVISED_OVERRIDES_KEY, &overrides, &mut self.sup);
        }
        if let Some(overrides) = full_overrides {
            apply_overrides(kwargs, SEMISUPERVISED_OVERRIDES_KEY, &overrides, &mut self.full);
        }

        kwargs.extend(trainer_kwargs);
        Ok(Resolution { dataset, profile: self.full.clone(), warnings })
    }

    /// Training arguments for the supervised run.
    pub fn supervised_args(&mut self, logging_dir: impl AsRef<Path>) -> FinetuneResult<TrainingArguments> {
        self.sup.set("logging_dir", logging_dir.as_ref().to_string_lossy().into_owned());
        TrainingArguments::from_profile(&self.sup)
    }

    /// Training arguments for the semisupervised run.
    pub fn full_args(&mut self, logging_dir: impl AsRef<Path>) -> FinetuneResult<TrainingArguments> {
        self.full.set("logging_dir", logging_dir.as_ref().to_string_lossy().into_owned());
        TrainingArguments::from_profile(&self.full)
    }
}

impl Default for DefaultArgs {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DefaultArgs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DefaultArgs")
            .field("sup", &self.sup)
            .field("full", &self.full)
            .field("text_column_name", &self.text_column_name)
            .field("encoder", &self.encoder)
            .field("metric", &self.metric)
            .finish_non_exhaustive()
    }
}

fn apply_overrides(kwargs: &mut Kwargs, key: &str, overrides: &Map<String, Value>, profile: &mut ArgumentProfile) {
    debug!(key, overrides = ?overrides.keys().collect::<Vec<_>>(), "applying profile overrides");
    profile.merge(overrides);
    kwargs.remove(key);
}

/// The override mapping under `key`, checked against the training-argument fields.
///
/// A value that is not a mapping is reported and left alone.
fn override_mapping(
    kwargs: &Kwargs,
    key: &str,
    warnings: &mut Vec<ResolveWarning>,
) -> FinetuneResult<Option<Map<String, Value>>> {
    match kwargs.get(key) {
        None => Ok(None),
        Some(KwargValue::Value(Value::Object(overrides))) => {
            let unknown: Vec<&str> =
                overrides.keys().map(String::as_str).filter(|k| !TrainingArguments::accepts(k)).collect();
            if !unknown.is_empty() {
                return Err(FinetuneError::InvalidKwarg {
                    key: key.to_string(),
                    message: format!("unknown training arguments: {}", unknown.join(", ")),
                });
            }
            Ok(Some(overrides.clone()))
        }
        Some(other) => {
            let warning = ResolveWarning::IgnoredOverride { key: key.to_string(), kind: other.kind() };
            warn!("{warning}");
            warnings.push(warning);
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args::{IntervalStrategy, SaveSteps};
    use crate::dataset::Dataset;
    use crate::error::TokenizerLoadError;
    use crate::metrics::Metric;
    use crate::tokenizer::{EncodedText, SharedTokenizer, TextTokenizer, TokenizerConfig, TokenizerLoader, TokenizerRequest};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug)]
    struct CharTokenizer(String);

    impl TextTokenizer for CharTokenizer {
        fn name_or_path(&self) -> &str {
            &self.0
        }

        fn model_max_length(&self) -> Option<usize> {
            Some(8)
        }

        fn encode_batch(&self, texts: &[String]) -> FinetuneResult<Vec<EncodedText>> {
            Ok(texts
                .iter()
                .map(|t| {
                    let ids: Vec<u32> = t.chars().take(8).map(u32::from).collect();
                    EncodedText { attention_mask: vec![1; ids.len()], input_ids: ids, token_type_ids: None }
                })
                .collect())
        }
    }

    #[derive(Default)]
    struct CountingLoader {
        loads: AtomicUsize,
    }

    impl TokenizerLoader for CountingLoader {
        fn load(&self, request: &TokenizerRequest) -> Result<SharedTokenizer, TokenizerLoadError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(CharTokenizer(request.model_name.clone())))
        }
    }

    #[derive(Default)]
    struct CountingMetricLoader {
        loads: AtomicUsize,
    }

    impl MetricLoader for CountingMetricLoader {
        fn load(&self, family: &str, config: Option<&str>) -> FinetuneResult<Box<dyn Metric>> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            BuiltinMetricLoader.load(family, config)
        }
    }

    fn dataset() -> Dataset {
        Dataset::from_rows(vec![
            json!({"sentence": "good", "label": 1}).as_object().unwrap().clone(),
            json!({"sentence": "bad", "label": 0}).as_object().unwrap().clone(),
        ])
    }

    fn builder(loader: Arc<CountingLoader>) -> DefaultArgs {
        DefaultArgs::new().with_encoder(DatasetEncoder::new(loader, TokenizerConfig::default()))
    }

    #[test]
    fn test_resolve_encodes_and_stores_tokenizer() {
        let loader = Arc::new(CountingLoader::default());
        let mut defaults = builder(loader.clone());
        let mut kwargs = Kwargs::new();

        let resolution = defaults.resolve(dataset(), "albert-base-v2", &mut kwargs).unwrap();

        assert_eq!(loader.loads.load(Ordering::SeqCst), 1);
        let encoded = resolution.dataset.encoded().unwrap();
        assert_eq!(encoded.column("input_ids").unwrap()[1], json!([98, 97, 100]));
        assert_eq!(kwargs.tokenizer().unwrap().name_or_path(), "albert-base-v2");
        assert!(kwargs.compute_metrics().is_some());
        assert!(resolution.warnings.is_empty());
    }

    #[test]
    fn test_supplied_tokenizer_skips_encoder() {
        let loader = Arc::new(CountingLoader::default());
        let mut defaults = builder(loader.clone());
        let own: SharedTokenizer = Arc::new(CharTokenizer("mine".to_string()));
        let mut kwargs = Kwargs::new().with("tokenizer", own).with(TEXT_COLUMN_KEY, "text");

        let resolution = defaults.resolve(dataset(), "albert-base-v2", &mut kwargs).unwrap();

        assert_eq!(loader.loads.load(Ordering::SeqCst), 0);
        assert!(!resolution.dataset.is_encoded());
        assert_eq!(resolution.warnings, vec![ResolveWarning::TokenizerSupplied]);
        assert_eq!(kwargs.tokenizer().unwrap().name_or_path(), "mine");
        // not consumed when nothing is encoded
        assert!(kwargs.contains_key(TEXT_COLUMN_KEY));
    }

    #[test]
    fn test_caller_metrics_are_kept() {
        let metrics = Arc::new(CountingMetricLoader::default());
        let mut defaults = builder(Arc::new(CountingLoader::default())).with_metric_loader(metrics.clone());
        let own = compute_metrics_with(&BuiltinMetricLoader, &MetricConfig {
            family: "accuracy".to_string(),
            config: None,
        })
        .unwrap();
        let mut kwargs = Kwargs::new().with("compute_metrics", own);

        defaults.resolve(dataset(), "m", &mut kwargs).unwrap();

        assert_eq!(metrics.loads.load(Ordering::SeqCst), 0);
        assert_eq!(kwargs.compute_metrics().unwrap().name(), "accuracy");
    }

    #[test]
    fn test_profiles_unchanged_without_overrides() {
        let mut defaults = builder(Arc::new(CountingLoader::default()));
        let mut kwargs = Kwargs::new().with("num_labels", 2_i64);

        let resolution = defaults.resolve(dataset(), "m", &mut kwargs).unwrap();

        assert_eq!(defaults.supervised_profile(), &ArgumentProfile::supervised());
        assert_eq!(defaults.semisupervised_profile(), &ArgumentProfile::semisupervised());
        assert_eq!(resolution.profile, ArgumentProfile::semisupervised());
        assert!(kwargs.contains_key("num_labels"));
    }

    #[test]
    fn test_supervised_override_is_merged_and_removed() {
        let mut defaults = builder(Arc::new(CountingLoader::default()));
        let mut kwargs = Kwargs::new().with(SUPERVISED_OVERRIDES_KEY, json!({"learning_rate": 1e-4}));

        defaults.resolve(dataset(), "m", &mut kwargs).unwrap();

        let sup = defaults.supervised_profile();
        assert_eq!(sup.get("learning_rate"), Some(&json!(1e-4)));
        assert_eq!(sup.len(), ArgumentProfile::supervised().len());
        assert_eq!(sup.get("per_device_train_batch_size"), Some(&json!(16)));
        assert!(!kwargs.contains_key(SUPERVISED_OVERRIDES_KEY));
        assert_eq!(defaults.semisupervised_profile(), &ArgumentProfile::semisupervised());
    }

    #[test]
    fn test_non_mapping_override_is_left_in_place() {
        let mut defaults = builder(Arc::new(CountingLoader::default()));
        let mut kwargs = Kwargs::new().with(SEMISUPERVISED_OVERRIDES_KEY, "fast");

        let resolution = defaults.resolve(dataset(), "m", &mut kwargs).unwrap();

        assert!(kwargs.contains_key(SEMISUPERVISED_OVERRIDES_KEY));
        assert_eq!(
            resolution.warnings,
            vec![ResolveWarning::IgnoredOverride { key: SEMISUPERVISED_OVERRIDES_KEY.to_string(), kind: "string" }]
        );
        assert_eq!(defaults.semisupervised_profile(), &ArgumentProfile::semisupervised());
    }

    #[test]
    fn test_overrides_accumulate_until_reset() {
        let mut defaults = builder(Arc::new(CountingLoader::default()));

        let mut first = Kwargs::new().with(SEMISUPERVISED_OVERRIDES_KEY, json!({"seed": 1}));
        defaults.resolve(dataset(), "m", &mut first).unwrap();
        let mut second = Kwargs::new().with(SEMISUPERVISED_OVERRIDES_KEY, json!({"warmup_steps": 10}));
        let resolution = defaults.resolve(dataset(), "m", &mut second).unwrap();

        assert_eq!(resolution.profile.get("seed"), Some(&json!(1)));
        assert_eq!(resolution.profile.get("warmup_steps"), Some(&json!(10)));

        defaults.reset_profiles();
        assert_eq!(defaults.semisupervised_profile(), &ArgumentProfile::semisupervised());
    }

    #[test]
    fn test_full_args_never_saves_periodically() {
        let mut defaults = builder(Arc::new(CountingLoader::default()));

        let args = defaults.full_args("logs").unwrap();

        assert_eq!(args.save_steps, SaveSteps::Never);
        assert_eq!(args.logging_dir.as_deref(), Some(Path::new("logs")));
        assert_eq!(args.learning_rate, 2e-5);
    }

    #[test]
    fn test_supervised_args_use_sup_profile() {
        let mut defaults = builder(Arc::new(CountingLoader::default()));
        let mut kwargs = Kwargs::new().with(SUPERVISED_OVERRIDES_KEY, json!({"save_steps": 100}));
        defaults.resolve(dataset(), "m", &mut kwargs).unwrap();

        let args = defaults.supervised_args("runs/sup").unwrap();

        assert_eq!(args.save_steps, SaveSteps::Every(100));
        assert_eq!(args.per_device_eval_batch_size, 16);
        assert!(args.load_best_model_at_end);
        assert_eq!(defaults.supervised_profile().get("logging_dir"), Some(&json!("runs/sup")));
    }

    fn trainer_request() -> Kwargs {
        Kwargs::new()
            .with("model", "albert-base-v2")
            .with("train_dataset", "labeled")
            .with(SEMISUPERVISED_OVERRIDES_KEY, json!({"seed": 7}))
    }

    fn keys(kwargs: &Kwargs) -> Vec<String> {
        kwargs.keys().map(str::to_string).collect()
    }

    #[test]
    fn test_bad_text_column_leaves_kwargs_intact() {
        let mut defaults = builder(Arc::new(CountingLoader::default()));
        let mut kwargs = trainer_request().with(TEXT_COLUMN_KEY, 3_i64);
        let before = keys(&kwargs);

        let err = defaults.resolve(dataset(), "m", &mut kwargs).unwrap_err();

        assert!(matches!(err, FinetuneError::InvalidKwarg { ref key, .. } if key == TEXT_COLUMN_KEY));
        assert_eq!(keys(&kwargs), before);
        assert_eq!(defaults.semisupervised_profile(), &ArgumentProfile::semisupervised());
    }

    #[test]
    fn test_metric_load_failure_leaves_kwargs_intact() {
        let config = FinetuneConfig {
            metric: MetricConfig { family: "bleu".to_string(), config: None },
            ..FinetuneConfig::default()
        };
        let mut defaults = DefaultArgs::from_config(&config)
            .with_encoder(DatasetEncoder::new(Arc::new(CountingLoader::default()), TokenizerConfig::default()));
        let mut kwargs = trainer_request().with("eval_dataset", "validation");
        let before = keys(&kwargs);

        assert!(defaults.resolve(dataset(), "m", &mut kwargs).is_err());
        assert_eq!(keys(&kwargs), before);
    }

    #[test]
    fn test_encode_failure_leaves_kwargs_and_profiles_intact() {
        let mut defaults = builder(Arc::new(CountingLoader::default()));
        let mut kwargs = trainer_request().with(TEXT_COLUMN_KEY, "tweet");
        let before = keys(&kwargs);

        let err = defaults.resolve(dataset(), "m", &mut kwargs).unwrap_err();

        assert!(matches!(err, FinetuneError::Dataset(_)));
        assert_eq!(keys(&kwargs), before);
        assert!(kwargs.tokenizer().is_none());
        assert_eq!(defaults.semisupervised_profile(), &ArgumentProfile::semisupervised());
    }

    #[test]
    fn test_unknown_override_key_fails_before_merging() {
        let mut defaults = builder(Arc::new(CountingLoader::default()));
        let mut kwargs = trainer_request().with(SUPERVISED_OVERRIDES_KEY, json!({"learning_rat": 1e-4}));
        let before = keys(&kwargs);

        let err = defaults.resolve(dataset(), "m", &mut kwargs).unwrap_err();

        assert!(matches!(
            err,
            FinetuneError::InvalidKwarg { ref key, ref message }
                if key == SUPERVISED_OVERRIDES_KEY && message.contains("learning_rat")
        ));
        assert_eq!(keys(&kwargs), before);
        assert_eq!(defaults.supervised_profile(), &ArgumentProfile::supervised());
    }

    #[test]
    fn test_training_argument_overrides_reach_args() {
        let mut defaults = builder(Arc::new(CountingLoader::default()));
        let mut kwargs = Kwargs::new()
            .with(SUPERVISED_OVERRIDES_KEY, json!({"save_strategy": "no", "gradient_accumulation_steps": 4}));

        defaults.resolve(dataset(), "m", &mut kwargs).unwrap();
        let args = defaults.supervised_args("logs").unwrap();

        assert_eq!(args.save_strategy, IntervalStrategy::No);
        assert_eq!(args.gradient_accumulation_steps, 4);
    }
}
