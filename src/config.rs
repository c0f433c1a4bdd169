use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PlsaError, Result};

/// How the change between two consecutive log-likelihoods is measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConvergenceCriterion {
    /// `|(new - old) / new|`
    #[default]
    Relative,
    /// `new - old`
    Absolute,
}

impl ConvergenceCriterion {
    pub fn change(self, old: f64, new: f64) -> f64 {
        match self {
            ConvergenceCriterion::Relative => {
                if new == 0.0 {
                    (new - old).abs()
                } else {
                    ((new - old) / new).abs()
                }
            }
            ConvergenceCriterion::Absolute => new - old,
        }
    }
}

/// Which factorization of P(d, w) the M-step re-estimates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ModelVariant {
    /// `P(d, w) = sum_z P(z) P(w|z) P(d|z)`
    #[default]
    Joint,
    /// `P(d, w) = P(w) sum_z P(d|z) P(z|w)` with P(w) taken from the counts.
    /// P(z) follows from the fitted P(z|w).
    Conditional,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlsaConfig {
    pub n_topics: usize,
    pub max_iterations: usize,
    pub tolerance: f64,
    pub warmup: usize, // Iterations before the convergence test kicks in
    pub n_restarts: usize,
    pub seed: u64, // Restart i is seeded with seed + i
    pub criterion: ConvergenceCriterion,
    pub variant: ModelVariant,
    pub tf_idf: bool,                // Weight counts by inverse document frequency before fitting
    pub parallel: bool,              // Run restarts on the rayon pool
    pub time_limit_secs: Option<f64>, // Wall-clock budget for the whole fit
}

impl Default for PlsaConfig {
    fn default() -> Self {
        PlsaConfig {
            n_topics: 10,
            max_iterations: 200,
            tolerance: 1e-5,
            warmup: 5,
            n_restarts: 1,
            seed: 42,
            criterion: ConvergenceCriterion::Relative,
            variant: ModelVariant::Joint,
            tf_idf: false,
            parallel: true,
            time_limit_secs: None,
        }
    }
}

impl PlsaConfig {
    pub fn new(n_topics: usize) -> Self {
        PlsaConfig {
            n_topics,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    #[must_use]
    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    #[must_use]
    pub fn with_warmup(mut self, warmup: usize) -> Self {
        self.warmup = warmup;
        self
    }

    #[must_use]
    pub fn with_restarts(mut self, n_restarts: usize) -> Self {
        self.n_restarts = n_restarts;
        self
    }

    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    #[must_use]
    pub fn with_criterion(mut self, criterion: ConvergenceCriterion) -> Self {
        self.criterion = criterion;
        self
    }

    #[must_use]
    pub fn with_variant(mut self, variant: ModelVariant) -> Self {
        self.variant = variant;
        self
    }

    #[must_use]
    pub fn with_tf_idf(mut self, tf_idf: bool) -> Self {
        self.tf_idf = tf_idf;
        self
    }

    #[must_use]
    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    #[must_use]
    pub fn with_time_limit(mut self, limit: Duration) -> Self {
        self.time_limit_secs = Some(limit.as_secs_f64());
        self
    }

    pub fn time_limit(&self) -> Option<Duration> {
        self.time_limit_secs
            .filter(|secs| secs.is_finite() && *secs >= 0.0)
            .map(Duration::from_secs_f64)
    }

    /// Reads a config from a JSON file. Missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: PlsaConfig = serde_json::from_str(&text)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.n_topics == 0 {
            return Err(PlsaError::invalid("number of topics must be at least 1"));
        }
        if self.n_restarts == 0 {
            return Err(PlsaError::invalid("number of restarts must be at least 1"));
        }
        validate_budget(self.max_iterations, self.tolerance)?;
        if let Some(secs) = self.time_limit_secs {
            if !secs.is_finite() || secs < 0.0 {
                return Err(PlsaError::invalid(format!(
                    "time limit must be a non-negative number of seconds, got {secs}"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FoldInConfig {
    pub max_iterations: usize,
    pub tolerance: f64,
    pub warmup: usize,
    pub criterion: ConvergenceCriterion,
}

impl Default for FoldInConfig {
    fn default() -> Self {
        FoldInConfig {
            max_iterations: 100,
            tolerance: 1e-6,
            warmup: 0,
            criterion: ConvergenceCriterion::Relative,
        }
    }
}

impl FoldInConfig {
    #[must_use]
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    #[must_use]
    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn validate(&self) -> Result<()> {
        validate_budget(self.max_iterations, self.tolerance)
    }
}

fn validate_budget(max_iterations: usize, tolerance: f64) -> Result<()> {
    if max_iterations == 0 {
        return Err(PlsaError::invalid("max_iterations must be at least 1"));
    }
    if !tolerance.is_finite() || tolerance < 0.0 {
        return Err(PlsaError::invalid(format!(
            "tolerance must be finite and non-negative, got {tolerance}"
        )));
    }
    Ok(())
}
