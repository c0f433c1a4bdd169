//! Projection of unseen documents into an already fitted topic space.
//!
//! The word-topic table stays fixed; only the new documents' topic mixtures
//! P(z|d) are estimated. The log-likelihood being maximized,
//! `sum n(d,w) ln sum_z P(z|d) P(w|z)`, is concave in the mixtures, so the
//! result does not depend on the starting point.
//!
//! A word that every topic gives probability zero carries no evidence about
//! the mixture. Its counts are ignored, the same as an out-of-vocabulary word.

use crate::cancel::CancelToken;
use crate::config::FoldInConfig;
use crate::corpus::{CountMatrix, Corpus};
use crate::em::StopRule;
use crate::error::{PlsaError, Result};
use crate::models::{ConvergenceStatus, FoldInResult, PlsaModel};
use crate::tensor::{normalize, normalize_rows, Matrix};

/// Folds `new_counts` into the topic space defined by `fixed_word_topic` (V x K).
///
/// Both borrowed tables are read-only. Every new document starts from
/// `fixed_topic_prior` as its mixture.
pub fn fold_in(
    new_counts: &CountMatrix,
    fixed_word_topic: &Matrix,
    fixed_topic_prior: &[f64],
    config: &FoldInConfig,
) -> Result<FoldInResult> {
    fold_in_with_cancel(new_counts, fixed_word_topic, fixed_topic_prior, config, &CancelToken::new())
}

pub fn fold_in_with_cancel(
    new_counts: &CountMatrix,
    fixed_word_topic: &Matrix,
    fixed_topic_prior: &[f64],
    config: &FoldInConfig,
    cancel: &CancelToken,
) -> Result<FoldInResult> {
    config.validate()?;
    validate(new_counts, fixed_word_topic, fixed_topic_prior)?;

    let n_docs = new_counts.n_docs();
    let n_topics = fixed_topic_prior.len();
    let rule = StopRule {
        max_iterations: config.max_iterations,
        tolerance: config.tolerance,
        warmup: config.warmup,
        criterion: config.criterion,
        cancel,
    };

    let mut start = fixed_topic_prior.to_vec();
    normalize(&mut start);
    let mut mixtures = Matrix::zeros(n_docs, n_topics);
    for d in 0..n_docs {
        mixtures.row_mut(d).copy_from_slice(&start);
    }

    let informative: Vec<bool> = (0..fixed_word_topic.n_rows())
        .map(|w| fixed_word_topic.row(w).iter().any(|&p| p > 0.0))
        .collect();
    let uninformative_words: Vec<usize> = (0..new_counts.n_words())
        .filter(|&w| !informative[w] && (0..n_docs).any(|d| new_counts.get(d, w) > 0.0))
        .collect();
    if !uninformative_words.is_empty() {
        log::warn!(
            "ignoring {} words that no topic gives any probability",
            uninformative_words.len()
        );
    }

    log::debug!("folding in {n_docs} documents over {n_topics} topics");

    let mut trace: Vec<f64> = Vec::new();
    let mut status = ConvergenceStatus::Exhausted;
    for iteration in 1..=rule.max_iterations {
        if rule.cancel.is_cancelled() {
            status = ConvergenceStatus::Cancelled;
            break;
        }

        let next = fold_in_iteration(new_counts, fixed_word_topic, &informative, &mixtures);
        if !next.is_finite() {
            return Err(PlsaError::NumericalInstability {
                restart: 0,
                iteration,
                detail: "non-finite value in fold-in mixtures".into(),
            });
        }
        let likelihood = fold_in_log_likelihood(new_counts, fixed_word_topic, &informative, &next);
        if !likelihood.is_finite() {
            return Err(PlsaError::NumericalInstability {
                restart: 0,
                iteration,
                detail: format!("fold-in log-likelihood is {likelihood}"),
            });
        }
        mixtures = next;

        let converged = rule.converged(iteration, trace.last().copied(), likelihood);
        trace.push(likelihood);
        if converged {
            status = ConvergenceStatus::Converged;
            break;
        }
    }

    let iterations = trace.len();
    log::debug!("fold-in {status} after {iterations} iterations");

    Ok(FoldInResult {
        mixtures,
        log_likelihood_trace: trace,
        status,
        iterations,
        dropped_words: Vec::new(),
        uninformative_words,
    })
}

fn validate(new_counts: &CountMatrix, word_topic: &Matrix, topic_prior: &[f64]) -> Result<()> {
    if new_counts.n_words() != word_topic.n_rows() {
        return Err(PlsaError::invalid(format!(
            "new documents have {} words but the fitted vocabulary has {}",
            new_counts.n_words(),
            word_topic.n_rows()
        )));
    }
    if topic_prior.is_empty() || topic_prior.len() != word_topic.n_cols() {
        return Err(PlsaError::invalid(format!(
            "topic prior has {} entries but the word-topic table has {} topics",
            topic_prior.len(),
            word_topic.n_cols()
        )));
    }
    if !word_topic.is_finite() || !topic_prior.iter().all(|p| p.is_finite() && *p >= 0.0) {
        return Err(PlsaError::invalid("fitted tables contain invalid probabilities"));
    }
    Ok(())
}

/// One E/M pass over the new documents with P(w|z) held fixed.
fn fold_in_iteration(counts: &CountMatrix, word_topic: &Matrix, informative: &[bool], mixtures: &Matrix) -> Matrix {
    let n_topics = mixtures.n_cols();
    let mut next = Matrix::zeros(counts.n_docs(), n_topics);
    let mut posterior = vec![0.0; n_topics];

    for d in 0..counts.n_docs() {
        let mixture = mixtures.row(d);
        for (w, &count) in counts.row(d).iter().enumerate() {
            if count == 0.0 || !informative[w] {
                continue;
            }
            let p_w = word_topic.row(w);
            for z in 0..n_topics {
                posterior[z] = mixture[z] * p_w[z];
            }
            if posterior.iter().all(|&q| q == 0.0) {
                // The mixture has no mass left on any topic producing this word
                continue;
            }
            normalize(&mut posterior);
            for (z, &q) in posterior.iter().enumerate() {
                next.add(d, z, count * q);
            }
        }
    }
    // Rows without counts come out uniform
    normalize_rows(&mut next);
    next
}

fn fold_in_log_likelihood(counts: &CountMatrix, word_topic: &Matrix, informative: &[bool], mixtures: &Matrix) -> f64 {
    let mut total = 0.0;
    for d in 0..counts.n_docs() {
        let mixture = mixtures.row(d);
        for (w, &count) in counts.row(d).iter().enumerate() {
            if count > 0.0 && informative[w] {
                let p: f64 = mixture.iter().zip(word_topic.row(w)).map(|(m, pw)| m * pw).sum();
                total += count * p.max(f64::MIN_POSITIVE).ln();
            }
        }
    }
    total
}

impl PlsaModel {
    /// Folds documents already indexed by this model's vocabulary. Counts are
    /// weighted the same way the training counts were. Words the model gives
    /// zero probability are listed in [`FoldInResult::dropped_words`].
    pub fn fold_in(&self, new_counts: &CountMatrix, config: &FoldInConfig) -> Result<FoldInResult> {
        let mut result = match self.term_weights() {
            Some(weights) if new_counts.n_words() == weights.len() => {
                fold_in(&new_counts.weighted(weights)?, self.word_topic(), self.topic_prior(), config)?
            }
            _ => fold_in(new_counts, self.word_topic(), self.topic_prior(), config)?,
        };
        result.dropped_words = result
            .uninformative_words
            .iter()
            .filter_map(|&w| self.vocabulary().word(w).map(str::to_string))
            .collect();
        Ok(result)
    }

    /// Folds documents indexed by their own vocabulary. Words this model has
    /// never seen are dropped and listed in [`FoldInResult::dropped_words`].
    pub fn fold_in_corpus(&self, corpus: &Corpus, config: &FoldInConfig) -> Result<FoldInResult> {
        let aligned = corpus.align_to(self.vocabulary());
        let mut result = self.fold_in(&aligned.counts, config)?;
        let mut dropped = aligned.dropped_words;
        dropped.append(&mut result.dropped_words);
        result.dropped_words = dropped;
        Ok(result)
    }
}
