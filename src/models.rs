use std::fmt;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::PlsaConfig;
use crate::corpus::Vocabulary;
use crate::em::RestartRun;
use crate::error::{PlsaError, Result};
use crate::tensor::{argmax, normalize, Matrix, ProbabilityTables};

/// How an EM run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConvergenceStatus {
    /// Log-likelihood change fell below the tolerance.
    Converged,
    /// Ran out of iterations first.
    Exhausted,
    /// Stopped early by a cancel token or time limit.
    Cancelled,
}

impl ConvergenceStatus {
    pub fn is_converged(self) -> bool {
        self == ConvergenceStatus::Converged
    }

    /// Converged or exhausted, as opposed to interrupted.
    pub fn is_complete(self) -> bool {
        self != ConvergenceStatus::Cancelled
    }
}

impl fmt::Display for ConvergenceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConvergenceStatus::Converged => "converged",
            ConvergenceStatus::Exhausted => "exhausted",
            ConvergenceStatus::Cancelled => "cancelled",
        };
        f.pad(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestartSummary {
    pub index: usize,
    pub seed: u64,
    pub status: Option<ConvergenceStatus>, // None when the restart failed
    pub iterations: usize,
    pub log_likelihood: Option<f64>,
    pub error: Option<String>,
}

/// A fitted PLSA model: the winning restart's tables plus everything needed to report on them.
///
/// Everything here is read-only once fitted; fold-in borrows the word-topic
/// table and topic prior from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlsaModel {
    vocabulary: Vocabulary,
    config: PlsaConfig,
    tables: ProbabilityTables,
    #[serde(default)]
    term_weights: Option<Vec<f64>>, // Per-word idf applied to the counts before fitting
    log_likelihood_trace: Vec<f64>,
    log_likelihood: f64,
    status: ConvergenceStatus,
    iterations: usize,
    best_restart: usize,
    restarts: Vec<RestartSummary>,
    fitted_at: DateTime<Utc>,
}

impl PlsaModel {
    pub(crate) fn from_run(
        vocabulary: Vocabulary,
        config: PlsaConfig,
        term_weights: Option<Vec<f64>>,
        best_restart: usize,
        run: RestartRun,
        restarts: Vec<RestartSummary>,
    ) -> Self {
        PlsaModel {
            vocabulary,
            config,
            tables: run.tables,
            term_weights,
            log_likelihood_trace: run.trace,
            log_likelihood: run.log_likelihood,
            status: run.status,
            iterations: run.iterations,
            best_restart,
            restarts,
            fitted_at: Utc::now(),
        }
    }

    pub fn n_topics(&self) -> usize {
        self.tables.n_topics()
    }

    pub fn n_docs(&self) -> usize {
        self.tables.n_docs()
    }

    pub fn n_words(&self) -> usize {
        self.tables.n_words()
    }

    pub fn vocabulary(&self) -> &Vocabulary {
        &self.vocabulary
    }

    pub fn config(&self) -> &PlsaConfig {
        &self.config
    }

    pub fn tables(&self) -> &ProbabilityTables {
        &self.tables
    }

    /// P(z)
    pub fn topic_prior(&self) -> &[f64] {
        &self.tables.topic_prior
    }

    /// P(w|z), words x topics.
    pub fn word_topic(&self) -> &Matrix {
        &self.tables.word_topic
    }

    /// P(d|z), documents x topics.
    pub fn doc_topic(&self) -> &Matrix {
        &self.tables.doc_topic
    }

    /// The idf weights the training counts were scaled by, if any. Fold-in
    /// applies the same weights to new documents.
    pub fn term_weights(&self) -> Option<&[f64]> {
        self.term_weights.as_deref()
    }

    pub fn log_likelihood_trace(&self) -> &[f64] {
        &self.log_likelihood_trace
    }

    pub fn log_likelihood(&self) -> f64 {
        self.log_likelihood
    }

    pub fn status(&self) -> ConvergenceStatus {
        self.status
    }

    pub fn iterations(&self) -> usize {
        self.iterations
    }

    pub fn best_restart(&self) -> usize {
        self.best_restart
    }

    pub fn restarts(&self) -> &[RestartSummary] {
        &self.restarts
    }

    pub fn fitted_at(&self) -> DateTime<Utc> {
        self.fitted_at
    }

    /// P(w|z) for one topic, indexed by word.
    pub fn topic_word(&self, topic: usize) -> Vec<f64> {
        self.tables.word_topic.column(topic)
    }

    /// The `n` most probable words of every topic, most probable first.
    /// Equal probabilities keep vocabulary order.
    pub fn top_words(&self, n: usize) -> Vec<Vec<(String, f64)>> {
        (0..self.n_topics())
            .map(|topic| {
                let mut ranked: Vec<(usize, f64)> = self.topic_word(topic).into_iter().enumerate().collect();
                ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
                ranked
                    .into_iter()
                    .take(n)
                    .map(|(w, p)| (self.vocabulary.word(w).unwrap_or_default().to_string(), p))
                    .collect()
            })
            .collect()
    }

    /// P(z|d) proportional to P(d|z) P(z). Uniform for a document without counts.
    pub fn document_mixture(&self, doc: usize) -> Vec<f64> {
        let mut mixture: Vec<f64> = self
            .tables
            .doc_topic
            .row(doc)
            .iter()
            .zip(&self.tables.topic_prior)
            .map(|(p_d, p_z)| p_d * p_z)
            .collect();
        normalize(&mut mixture);
        mixture
    }

    /// Every document's topic mixture, documents x topics.
    pub fn document_mixtures(&self) -> Matrix {
        let k = self.n_topics();
        let data = (0..self.n_docs()).flat_map(|d| self.document_mixture(d)).collect();
        Matrix::from_vec(self.n_docs(), k, data).unwrap_or_else(|| Matrix::zeros(self.n_docs(), k))
    }

    /// Most probable topic of a document; the lowest index wins ties.
    pub fn primary_topic(&self, doc: usize) -> usize {
        argmax(&self.document_mixture(doc))
    }

    /// P(z|w) proportional to P(w|z) P(z).
    pub fn topic_given_word(&self, word: usize) -> Vec<f64> {
        let mut dist: Vec<f64> = self
            .tables
            .word_topic
            .row(word)
            .iter()
            .zip(&self.tables.topic_prior)
            .map(|(p_w, p_z)| p_w * p_z)
            .collect();
        normalize(&mut dist);
        dist
    }

    /// Topic indices ordered by descending P(z).
    pub fn topics_by_prevalence(&self) -> Vec<usize> {
        let prior = &self.tables.topic_prior;
        let mut order: Vec<usize> = (0..prior.len()).collect();
        order.sort_by(|&a, &b| prior[b].total_cmp(&prior[a]).then(a.cmp(&b)));
        order
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Reads a model written by [`PlsaModel::save`], rejecting files whose
    /// tables disagree on their dimensions.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let model: PlsaModel = serde_json::from_str(&json)?;
        model.check_consistency()?;
        Ok(model)
    }

    fn check_consistency(&self) -> Result<()> {
        self.tables.check_shape()?;
        if self.vocabulary.len() != self.n_words() {
            return Err(PlsaError::invalid(format!(
                "model vocabulary has {} words but the word-topic table has {} rows",
                self.vocabulary.len(),
                self.n_words()
            )));
        }
        if let Some(weights) = &self.term_weights {
            if weights.len() != self.n_words() {
                return Err(PlsaError::invalid(format!(
                    "model has {} term weights for {} words",
                    weights.len(),
                    self.n_words()
                )));
            }
        }
        if let Some(table) = self.tables.first_non_finite() {
            return Err(PlsaError::invalid(format!("model {table} holds a non-finite value")));
        }
        Ok(())
    }
}

impl fmt::Display for PlsaModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "PlsaModel:")?;
        writeln!(f, "==========")?;
        writeln!(f, "Number of topics:     {}", self.n_topics())?;
        writeln!(f, "Number of documents:  {}", self.n_docs())?;
        writeln!(f, "Number of words:      {}", self.n_words())?;
        writeln!(f, "Number of iterations: {}", self.iterations)?;
        writeln!(f, "Log-likelihood:       {:.6}", self.log_likelihood)?;
        write!(f, "Status:               {} (restart {} of {})", self.status, self.best_restart, self.restarts.len())
    }
}

/// New documents projected into a fitted topic space.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FoldInResult {
    pub mixtures: Matrix, // P(z|d) for the new documents, documents x topics
    pub log_likelihood_trace: Vec<f64>,
    pub status: ConvergenceStatus,
    pub iterations: usize,
    pub dropped_words: Vec<String>, // Out-of-vocabulary words ignored during alignment
    pub uninformative_words: Vec<usize>, // Columns with counts that every topic gives probability 0
}

impl FoldInResult {
    pub fn n_docs(&self) -> usize {
        self.mixtures.n_rows()
    }

    pub fn mixture(&self, doc: usize) -> &[f64] {
        self.mixtures.row(doc)
    }

    pub fn primary_topic(&self, doc: usize) -> usize {
        argmax(self.mixture(doc))
    }
}
