use crate::error::{FinetuneError, FinetuneResult};
use crate::kwargs::DeclaredParams;
use crate::profile::ArgumentProfile;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntervalStrategy {
    #[default]
    No,
    Steps,
    Epoch,
}

/// Checkpoint save interval. `Never` stands for an infinite step count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveSteps {
    Every(u64),
    Never,
}

impl SaveSteps {
    #[must_use]
    pub fn is_finite(self) -> bool {
        matches!(self, Self::Every(_))
    }
}

impl Default for SaveSteps {
    fn default() -> Self {
        Self::Every(500)
    }
}

impl Serialize for SaveSteps {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Every(n) => serializer.serialize_u64(*n),
            Self::Never => serializer.serialize_str("inf"),
        }
    }
}

struct SaveStepsVisitor;

impl Visitor<'_> for SaveStepsVisitor {
    type Value = SaveSteps;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a non-negative step count, \"inf\", \"never\" or null")
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<SaveSteps, E> {
        Ok(SaveSteps::Every(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<SaveSteps, E> {
        u64::try_from(v)
            .map(SaveSteps::Every)
            .map_err(|_| E::invalid_value(de::Unexpected::Signed(v), &self))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<SaveSteps, E> {
        if (v.is_infinite() && v > 0.0) || v >= u64::MAX as f64 {
            return Ok(SaveSteps::Never);
        }
        if v.is_finite() && v >= 0.0 && v.fract() == 0.0 {
            return Ok(SaveSteps::Every(v as u64));
        }
        Err(E::invalid_value(de::Unexpected::Float(v), &self))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<SaveSteps, E> {
        match v.trim().to_ascii_lowercase().as_str() {
            "inf" | "infinity" | "never" => Ok(SaveSteps::Never),
            other => other
                .parse::<u64>()
                .map(SaveSteps::Every)
                .map_err(|_| E::invalid_value(de::Unexpected::Str(v), &self)),
        }
    }

    fn visit_unit<E: de::Error>(self) -> Result<SaveSteps, E> {
        Ok(SaveSteps::Never)
    }

    fn visit_none<E: de::Error>(self) -> Result<SaveSteps, E> {
        Ok(SaveSteps::Never)
    }
}

impl<'de> Deserialize<'de> for SaveSteps {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(SaveStepsVisitor)
    }
}

/// Arguments handed to the trainer for one optimisation run.
///
/// Built from an [`ArgumentProfile`]; unknown profile keys are rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrainingArguments {
    pub output_dir: PathBuf,
    #[serde(default)]
    pub evaluation_strategy: IntervalStrategy,
    #[serde(default)]
    pub eval_steps: Option<u64>,
    #[serde(default = "default_step_strategy")]
    pub logging_strategy: IntervalStrategy,
    #[serde(default = "default_step_strategy")]
    pub save_strategy: IntervalStrategy,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default = "default_batch_size")]
    pub per_device_train_batch_size: u32,
    #[serde(default = "default_batch_size")]
    pub per_device_eval_batch_size: u32,
    #[serde(default = "default_gradient_accumulation_steps")]
    pub gradient_accumulation_steps: u32,
    #[serde(default = "default_num_train_epochs")]
    pub num_train_epochs: f64,
    #[serde(default)]
    pub weight_decay: f64,
    #[serde(default)]
    pub metric_for_best_model: Option<String>,
    #[serde(default)]
    pub greater_is_better: Option<bool>,
    #[serde(default)]
    pub load_best_model_at_end: bool,
    #[serde(default)]
    pub save_steps: SaveSteps,
    #[serde(default)]
    pub save_total_limit: Option<u64>,
    #[serde(default = "default_logging_steps")]
    pub logging_steps: u64,
    #[serde(default)]
    pub warmup_steps: u64,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default)]
    pub disable_tqdm: bool,
    #[serde(default)]
    pub no_cuda: bool,
    #[serde(default)]
    pub logging_dir: Option<PathBuf>,
}

fn default_learning_rate() -> f64 {
    5e-5
}

fn default_batch_size() -> u32 {
    8
}

fn default_step_strategy() -> IntervalStrategy {
    IntervalStrategy::Steps
}

fn default_gradient_accumulation_steps() -> u32 {
    1
}

fn default_num_train_epochs() -> f64 {
    3.0
}

fn default_logging_steps() -> u64 {
    500
}

fn default_seed() -> u64 {
    42
}

impl DeclaredParams for TrainingArguments {
    const PARAMS: &'static [&'static str] = &[
        "output_dir",
        "evaluation_strategy",
        "eval_steps",
        "logging_strategy",
        "save_strategy",
        "learning_rate",
        "per_device_train_batch_size",
        "per_device_eval_batch_size",
        "gradient_accumulation_steps",
        "num_train_epochs",
        "weight_decay",
        "metric_for_best_model",
        "greater_is_better",
        "load_best_model_at_end",
        "save_steps",
        "save_total_limit",
        "logging_steps",
        "warmup_steps",
        "seed",
        "disable_tqdm",
        "no_cuda",
        "logging_dir",
    ];
}

impl TrainingArguments {
    pub fn from_profile(profile: &ArgumentProfile) -> FinetuneResult<Self> {
        let args: Self = serde_json::from_value(profile.to_value())
            .map_err(|e| FinetuneError::InvalidArguments(e.to_string()))?;
        args.validate()?;
        Ok(args)
    }

    /// Metric-based selection defaults to "higher is better" unless the
    /// metric is a loss.
    #[must_use]
    pub fn greater_is_better(&self) -> bool {
        self.greater_is_better.unwrap_or_else(|| {
            self.metric_for_best_model
                .as_deref()
                .is_some_and(|m| !m.ends_with("loss"))
        })
    }

    pub fn validate(&self) -> FinetuneResult<()> {
        if self.output_dir.as_os_str().is_empty() {
            return Err(FinetuneError::InvalidArguments("output_dir is required".to_string()));
        }
        if !self.learning_rate.is_finite() || self.learning_rate <= 0.0 {
            return Err(FinetuneError::InvalidArguments("learning_rate must be > 0".to_string()));
        }
        if self.per_device_train_batch_size == 0 || self.per_device_eval_batch_size == 0 {
            return Err(FinetuneError::InvalidArguments("batch sizes must be >= 1".to_string()));
        }
        if self.gradient_accumulation_steps == 0 {
            return Err(FinetuneError::InvalidArguments("gradient_accumulation_steps must be >= 1".to_string()));
        }
        if self.eval_steps == Some(0) {
            return Err(FinetuneError::InvalidArguments("eval_steps must be >= 1".to_string()));
        }
        if !self.num_train_epochs.is_finite() || self.num_train_epochs <= 0.0 {
            return Err(FinetuneError::InvalidArguments("num_train_epochs must be > 0".to_string()));
        }
        if !self.weight_decay.is_finite() || self.weight_decay < 0.0 {
            return Err(FinetuneError::InvalidArguments("weight_decay must be >= 0".to_string()));
        }
        if self.save_steps == SaveSteps::Every(0) {
            return Err(FinetuneError::InvalidArguments("save_steps must be >= 1".to_string()));
        }
        if self.load_best_model_at_end && self.evaluation_strategy == IntervalStrategy::No {
            return Err(FinetuneError::InvalidArguments(
                "load_best_model_at_end requires an evaluation_strategy".to_string(),
            ));
        }
        Ok(())
    }
}
