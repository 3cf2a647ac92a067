//! Evaluation metrics for class predictions.
//!
//! A [`MetricLoader`] resolves a metric by family and config name (e.g. `glue` /
//! `cola`). [`compute_metrics_with`] wraps a freshly loaded metric into the
//! callable handed to the trainer: logits in, argmax per row, metric out.

use crate::error::{FinetuneError, FinetuneResult};
use ndarray::{Array1, Array2, ArrayView2};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Metric name → value.
pub type MetricOutput = BTreeMap<String, f64>;

pub trait Metric: Send + Sync {
    fn name(&self) -> &str;

    fn compute(&self, predictions: &[i64], references: &[i64]) -> FinetuneResult<MetricOutput>;
}

pub trait MetricLoader: Send + Sync {
    fn load(&self, family: &str, config: Option<&str>) -> FinetuneResult<Box<dyn Metric>>;
}

/// Which metric the default compute-metrics callable loads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricConfig {
    #[serde(default = "default_family")]
    pub family: String,
    #[serde(default = "default_config_name")]
    pub config: Option<String>,
}

fn default_family() -> String {
    "glue".to_string()
}

#[allow(clippy::unnecessary_wraps)]
fn default_config_name() -> Option<String> {
    Some("cola".to_string())
}

impl Default for MetricConfig {
    fn default() -> Self {
        Self { family: default_family(), config: default_config_name() }
    }
}

/// Logits and gold labels from an evaluation pass.
#[derive(Debug, Clone)]
pub struct EvalPrediction {
    pub predictions: Array2<f32>,
    pub label_ids: Array1<i64>,
}

type MetricsFn = dyn Fn(&EvalPrediction) -> FinetuneResult<MetricOutput> + Send + Sync;

/// The compute-metrics callable passed to the trainer.
#[derive(Clone)]
pub struct ComputeMetrics {
    name: String,
    func: Arc<MetricsFn>,
}

impl ComputeMetrics {
    pub fn new<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&EvalPrediction) -> FinetuneResult<MetricOutput> + Send + Sync + 'static,
    {
        Self { name: name.into(), func: Arc::new(func) }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn call(&self, eval: &EvalPrediction) -> FinetuneResult<MetricOutput> {
        (self.func)(eval)
    }
}

impl fmt::Debug for ComputeMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComputeMetrics").field("name", &self.name).finish_non_exhaustive()
    }
}

/// Index of the largest value in each row. Ties go to the first index.
pub fn argmax_rows(predictions: ArrayView2<'_, f32>) -> FinetuneResult<Vec<i64>> {
    if predictions.ncols() == 0 && predictions.nrows() > 0 {
        return Err(FinetuneError::Metric("cannot take argmax of predictions with zero columns".to_string()));
    }

    Ok(predictions
        .rows()
        .into_iter()
        .map(|row| {
            let mut best = 0;
            for (idx, value) in row.iter().enumerate() {
                if *value > row[best] {
                    best = idx;
                }
            }
            best as i64
        })
        .collect())
}

/// Load `selection` through `loader` and wrap it as a compute-metrics callable.
///
/// Every call loads the metric again; callables do not share state.
pub fn compute_metrics_with(loader: &dyn MetricLoader, selection: &MetricConfig) -> FinetuneResult<ComputeMetrics> {
    let metric = loader.load(&selection.family, selection.config.as_deref())?;
    debug!(family = %selection.family, config = ?selection.config, metric = metric.name(), "loaded metric");

    let name = metric.name().to_string();
    Ok(ComputeMetrics::new(name, move |eval: &EvalPrediction| {
        let predictions = argmax_rows(eval.predictions.view())?;
        let references = eval.label_ids.to_vec();
        metric.compute(&predictions, &references)
    }))
}

/// `glue` / `cola` through the builtin loader.
pub fn default_compute_metrics() -> FinetuneResult<ComputeMetrics> {
    compute_metrics_with(&BuiltinMetricLoader, &MetricConfig::default())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Score {
    Accuracy,
    F1,
    MatthewsCorrelation,
}

impl Score {
    fn key(self) -> &'static str {
        match self {
            Self::Accuracy => "accuracy",
            Self::F1 => "f1",
            Self::MatthewsCorrelation => "matthews_correlation",
        }
    }

    fn compute(self, predictions: &[i64], references: &[i64]) -> f64 {
        match self {
            Self::Accuracy => accuracy(predictions, references),
            Self::F1 => binary_f1(predictions, references),
            Self::MatthewsCorrelation => matthews_correlation(predictions, references),
        }
    }
}

/// A fixed set of scores reported together.
#[derive(Debug, Clone)]
pub struct ClassificationMetric {
    name: String,
    scores: Vec<Score>,
}

impl Metric for ClassificationMetric {
    fn name(&self) -> &str {
        &self.name
    }

    fn compute(&self, predictions: &[i64], references: &[i64]) -> FinetuneResult<MetricOutput> {
        if predictions.len() != references.len() {
            return Err(FinetuneError::Metric(format!(
                "{}: {} predictions for {} references",
                self.name,
                predictions.len(),
                references.len()
            )));
        }
        if predictions.is_empty() {
            return Err(FinetuneError::Metric(format!("{}: no predictions to score", self.name)));
        }

        Ok(self
            .scores
            .iter()
            .map(|s| (s.key().to_string(), s.compute(predictions, references)))
            .collect())
    }
}

/// GLUE classification configs and the standalone classification metrics.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuiltinMetricLoader;

impl MetricLoader for BuiltinMetricLoader {
    fn load(&self, family: &str, config: Option<&str>) -> FinetuneResult<Box<dyn Metric>> {
        let scores = match (family, config) {
            ("glue", Some("cola")) => vec![Score::MatthewsCorrelation],
            ("glue", Some("mrpc" | "qqp")) => vec![Score::Accuracy, Score::F1],
            (
                "glue",
                Some("sst2" | "mnli" | "mnli_matched" | "mnli_mismatched" | "qnli" | "rte" | "wnli" | "hans"),
            ) => vec![Score::Accuracy],
            ("glue", Some(other)) => {
                return Err(FinetuneError::Metric(format!("unsupported glue config `{other}`")));
            }
            ("glue", None) => {
                return Err(FinetuneError::Metric("glue requires a config name, e.g. `cola`".to_string()));
            }
            ("accuracy", _) => vec![Score::Accuracy],
            ("f1", _) => vec![Score::F1],
            ("matthews_correlation", _) => vec![Score::MatthewsCorrelation],
            (other, _) => return Err(FinetuneError::Metric(format!("unknown metric `{other}`"))),
        };

        let name = match config {
            Some(c) => format!("{family}/{c}"),
            None => family.to_string(),
        };
        Ok(Box::new(ClassificationMetric { name, scores }))
    }
}

fn accuracy(predictions: &[i64], references: &[i64]) -> f64 {
    let correct = predictions.iter().zip(references).filter(|(p, r)| p == r).count();
    correct as f64 / predictions.len() as f64
}

/// F1 of the positive class (label 1); zero when undefined.
fn binary_f1(predictions: &[i64], references: &[i64]) -> f64 {
    let (mut tp, mut fp, mut fn_) = (0_u64, 0_u64, 0_u64);
    for (&p, &r) in predictions.iter().zip(references) {
        match (p == 1, r == 1) {
            (true, true) => tp += 1,
            (true, false) => fp += 1,
            (false, true) => fn_ += 1,
            (false, false) => {}
        }
    }
    let denom = 2 * tp + fp + fn_;
    if denom == 0 {
        return 0.0;
    }
    (2 * tp) as f64 / denom as f64
}

/// Multiclass Matthews correlation coefficient; zero when undefined.
fn matthews_correlation(predictions: &[i64], references: &[i64]) -> f64 {
    let mut true_counts: BTreeMap<i64, f64> = BTreeMap::new();
    let mut pred_counts: BTreeMap<i64, f64> = BTreeMap::new();
    let mut correct = 0.0;

    for (&p, &r) in predictions.iter().zip(references) {
        *true_counts.entry(r).or_default() += 1.0;
        *pred_counts.entry(p).or_default() += 1.0;
        if p == r {
            correct += 1.0;
        }
    }

    let samples = predictions.len() as f64;
    let cov_ytyp = correct * samples
        - true_counts
            .iter()
            .map(|(label, t)| t * pred_counts.get(label).copied().unwrap_or(0.0))
            .sum::<f64>();
    let cov_ypyp = samples * samples - pred_counts.values().map(|p| p * p).sum::<f64>();
    let cov_ytyt = samples * samples - true_counts.values().map(|t| t * t).sum::<f64>();

    let denom = (cov_ytyt * cov_ypyp).sqrt();
    if denom == 0.0 {
        return 0.0;
    }
    cov_ytyp / denom
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingLoader {
        loads: AtomicUsize,
    }

    impl MetricLoader for CountingLoader {
        fn load(&self, family: &str, config: Option<&str>) -> FinetuneResult<Box<dyn Metric>> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            BuiltinMetricLoader.load(family, config)
        }
    }

    #[test]
    fn test_argmax_rows_prefers_first_of_ties() {
        let logits = array![[0.1_f32, 0.9], [2.0, -1.0], [0.5, 0.5]];
        assert_eq!(argmax_rows(logits.view()).unwrap(), vec![1, 0, 0]);
    }

    #[test]
    fn test_argmax_rows_rejects_zero_columns() {
        let logits = Array2::<f32>::zeros((2, 0));
        assert!(argmax_rows(logits.view()).is_err());
    }

    #[test]
    fn test_matthews_correlation_binary() {
        let mcc = matthews_correlation(&[1, 1, 0, 0], &[1, 0, 0, 0]);
        assert!((mcc - 0.577_350_269).abs() < 1e-6);
    }

    #[test]
    fn test_matthews_correlation_perfect_and_degenerate() {
        assert!((matthews_correlation(&[0, 1, 2], &[0, 1, 2]) - 1.0).abs() < 1e-12);
        assert_eq!(matthews_correlation(&[1, 1, 1], &[0, 1, 0]), 0.0);
    }

    #[test]
    fn test_binary_f1() {
        // tp = 1, fp = 1, fn = 1
        assert!((binary_f1(&[1, 1, 0, 0], &[1, 0, 1, 0]) - 0.5).abs() < 1e-12);
        assert_eq!(binary_f1(&[0, 0], &[0, 0]), 0.0);
    }

    #[test]
    fn test_default_compute_metrics_reports_matthews_correlation() {
        let cm = default_compute_metrics().unwrap();
        let eval = EvalPrediction {
            predictions: array![[0.2_f32, 0.8], [0.3, 0.7], [0.9, 0.1], [0.6, 0.4]],
            label_ids: array![1, 0, 0, 0],
        };

        let out = cm.call(&eval).unwrap();

        assert_eq!(out.keys().collect::<Vec<_>>(), vec!["matthews_correlation"]);
        assert!((out["matthews_correlation"] - 0.577_350_269).abs() < 1e-6);
    }

    #[test]
    fn test_compute_metrics_rejects_label_length_mismatch() {
        let cm = default_compute_metrics().unwrap();
        let eval = EvalPrediction { predictions: array![[0.2_f32, 0.8]], label_ids: array![1, 0] };
        assert!(matches!(cm.call(&eval), Err(FinetuneError::Metric(_))));
    }

    #[test]
    fn test_each_factory_call_loads_the_metric_again() {
        let loader = CountingLoader { loads: AtomicUsize::new(0) };
        let selection = MetricConfig::default();

        let first = compute_metrics_with(&loader, &selection).unwrap();
        let second = compute_metrics_with(&loader, &selection).unwrap();

        assert_eq!(loader.loads.load(Ordering::SeqCst), 2);
        assert!(!Arc::ptr_eq(&first.func, &second.func));
    }

    #[test]
    fn test_builtin_loader_glue_configs() {
        let mrpc = BuiltinMetricLoader.load("glue", Some("mrpc")).unwrap();
        let out = mrpc.compute(&[1, 0, 1], &[1, 0, 0]).unwrap();
        assert_eq!(out.keys().collect::<Vec<_>>(), vec!["accuracy", "f1"]);

        assert!(BuiltinMetricLoader.load("glue", Some("stsb")).is_err());
        assert!(BuiltinMetricLoader.load("glue", None).is_err());
        assert!(BuiltinMetricLoader.load("bleu", None).is_err());
    }
}
