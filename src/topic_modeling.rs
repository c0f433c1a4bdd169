use rayon::prelude::*;

use crate::cancel::CancelToken;
use crate::config::PlsaConfig;
use crate::corpus::{CountMatrix, Corpus, Vocabulary};
use crate::em::{self, RestartRun, StopRule};
use crate::error::{PlsaError, Result};
use crate::models::{PlsaModel, RestartSummary};

/// Fits PLSA models with best-of-N random restarts.
///
/// ```
/// use plsa::{CountMatrix, Plsa, PlsaConfig};
///
/// let counts = CountMatrix::from_counts(vec![
///     vec![3, 2, 0, 0],
///     vec![0, 0, 4, 1],
/// ]).expect("valid counts");
///
/// let model = Plsa::new(PlsaConfig::new(2).with_restarts(3))
///     .fit(&counts)
///     .expect("fit should succeed");
/// assert_eq!(model.n_topics(), 2);
/// ```
pub struct Plsa {
    config: PlsaConfig,
}

impl Plsa {
    pub fn new(config: PlsaConfig) -> Self {
        Plsa { config }
    }

    pub fn config(&self) -> &PlsaConfig {
        &self.config
    }

    /// Fits a count matrix whose columns have no names.
    pub fn fit(&self, counts: &CountMatrix) -> Result<PlsaModel> {
        self.fit_with_cancel(counts, Vocabulary::anonymous(counts.n_words()), &CancelToken::new())
    }

    pub fn fit_corpus(&self, corpus: &Corpus) -> Result<PlsaModel> {
        self.fit_with_cancel(&corpus.counts, corpus.vocabulary.clone(), &CancelToken::new())
    }

    /// Full entry point. Cancelling `cancel` (or hitting the configured time
    /// limit) stops every restart at its next iteration; the best restart
    /// that got at least one iteration in is returned.
    pub fn fit_with_cancel(&self, counts: &CountMatrix, vocabulary: Vocabulary, cancel: &CancelToken) -> Result<PlsaModel> {
        let n_topics = self.config.n_topics;
        let variant = self.config.variant;
        self.fit_restarts(counts, vocabulary, cancel, |counts, restart, seed, rule| {
            em::run_restart(counts, n_topics, variant, restart, seed, rule)
        })
    }

    /// Everything around the restarts themselves; `run` performs one restart.
    fn fit_restarts<F>(&self, counts: &CountMatrix, vocabulary: Vocabulary, cancel: &CancelToken, run: F) -> Result<PlsaModel>
    where
        F: Fn(&CountMatrix, usize, u64, &StopRule<'_>) -> Result<RestartRun> + Sync,
    {
        // Step 1: Reject bad input before doing any work
        self.config.validate()?;
        self.validate_input(counts, &vocabulary)?;

        let idf = self.config.tf_idf.then(|| counts.idf_weights());
        let weighted;
        let counts = match &idf {
            Some(idf) => {
                log::info!("weighting counts by inverse document frequency");
                weighted = counts.weighted(idf)?;
                &weighted
            }
            None => counts,
        };

        let n_topics = self.config.n_topics;
        if n_topics > counts.n_docs().min(counts.n_words()) {
            log::warn!(
                "{n_topics} topics for {} documents and {} words; expect redundant topics",
                counts.n_docs(),
                counts.n_words()
            );
        }

        let cancel = match self.config.time_limit() {
            Some(limit) => cancel.with_time_limit(limit),
            None => cancel.clone(),
        };
        let rule = StopRule {
            max_iterations: self.config.max_iterations,
            tolerance: self.config.tolerance,
            warmup: self.config.warmup,
            criterion: self.config.criterion,
            cancel: &cancel,
        };

        log::info!(
            "fitting {:?} PLSA: {} documents, {} words, {n_topics} topics, {} restarts",
            self.config.variant,
            counts.n_docs(),
            counts.n_words(),
            self.config.n_restarts
        );

        // Step 2: Run the restarts, each with its own seed and its own tables
        let run_one = |restart: usize| {
            let seed = self.config.seed.wrapping_add(restart as u64);
            (restart, seed, run(counts, restart, seed, &rule))
        };
        let outcomes: Vec<(usize, u64, Result<RestartRun>)> = if self.config.parallel {
            (0..self.config.n_restarts).into_par_iter().map(run_one).collect()
        } else {
            (0..self.config.n_restarts).map(run_one).collect()
        };

        // Step 3: Keep the best one
        let (best, summaries) = select_best(outcomes)?;
        let (best_restart, run) = best;

        log::info!(
            "best restart {best_restart}: {} after {} iterations, log-likelihood {:.6}",
            run.status,
            run.iterations,
            run.log_likelihood
        );
        if !run.status.is_converged() {
            log::warn!("best restart did not converge ({}); consider a larger iteration budget", run.status);
        }

        Ok(PlsaModel::from_run(vocabulary, self.config.clone(), idf, best_restart, run, summaries))
    }

    fn validate_input(&self, counts: &CountMatrix, vocabulary: &Vocabulary) -> Result<()> {
        if counts.n_docs() == 0 || counts.n_words() == 0 {
            return Err(PlsaError::invalid(format!(
                "count matrix must have at least one document and one word, got {}x{}",
                counts.n_docs(),
                counts.n_words()
            )));
        }
        if vocabulary.len() != counts.n_words() {
            return Err(PlsaError::invalid(format!(
                "vocabulary has {} words but count matrix has {} columns",
                vocabulary.len(),
                counts.n_words()
            )));
        }
        Ok(())
    }
}

/// Fits `counts` with `n_topics` topics using default settings for everything else.
pub fn fit(
    counts: &CountMatrix,
    n_topics: usize,
    max_iterations: usize,
    tolerance: f64,
    n_restarts: usize,
    seed: u64,
) -> Result<PlsaModel> {
    let config = PlsaConfig::new(n_topics)
        .with_max_iterations(max_iterations)
        .with_tolerance(tolerance)
        .with_restarts(n_restarts)
        .with_seed(seed);
    Plsa::new(config).fit(counts)
}

type Best = (usize, RestartRun);

/// Picks the restart with the highest log-likelihood. Restarts that ran to
/// completion beat interrupted ones; among equals the lowest index wins.
fn select_best(outcomes: Vec<(usize, u64, Result<RestartRun>)>) -> Result<(Best, Vec<RestartSummary>)> {
    let n_restarts = outcomes.len();
    let mut summaries = Vec::with_capacity(n_restarts);
    let mut best: Option<Best> = None;
    let mut last_error: Option<PlsaError> = None;

    for (index, seed, outcome) in outcomes {
        match outcome {
            Ok(run) => {
                summaries.push(RestartSummary {
                    index,
                    seed,
                    status: Some(run.status),
                    iterations: run.iterations,
                    log_likelihood: Some(run.log_likelihood),
                    error: None,
                });
                let better = match &best {
                    None => true,
                    Some((_, current)) => {
                        let rank = |r: &RestartRun| r.status.is_complete();
                        (rank(&run), run.log_likelihood) > (rank(current), current.log_likelihood)
                    }
                };
                if better {
                    best = Some((index, run));
                }
            }
            Err(err) => {
                match &err {
                    PlsaError::Cancelled => log::debug!("restart {index} cancelled before its first iteration"),
                    other => log::warn!("restart {index} abandoned: {other}"),
                }
                summaries.push(RestartSummary {
                    index,
                    seed,
                    status: None,
                    iterations: 0,
                    log_likelihood: None,
                    error: Some(err.to_string()),
                });
                // Keep the most informative error: an instability outranks a cancellation
                if !matches!((&last_error, &err), (Some(PlsaError::NumericalInstability { .. }), PlsaError::Cancelled)) {
                    last_error = Some(err);
                }
            }
        }
    }

    match best {
        Some(best) => Ok((best, summaries)),
        None => match last_error {
            Some(PlsaError::Cancelled) | None => Err(PlsaError::Cancelled),
            Some(err) => Err(PlsaError::AllRestartsFailed {
                restarts: n_restarts,
                last: err.to_string(),
            }),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelVariant;
    use crate::models::ConvergenceStatus;
    use crate::tensor::ProbabilityTables;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn run(log_likelihood: f64, status: ConvergenceStatus) -> RestartRun {
        RestartRun {
            tables: ProbabilityTables::initialize(1, 1, 1, &mut ChaCha8Rng::seed_from_u64(0)),
            trace: vec![log_likelihood],
            log_likelihood,
            status,
            iterations: 1,
        }
    }

    fn instability(restart: usize) -> PlsaError {
        PlsaError::NumericalInstability {
            restart,
            iteration: 3,
            detail: "log-likelihood is NaN".into(),
        }
    }

    #[test]
    fn test_select_best_picks_highest_likelihood() {
        let outcomes = vec![
            (0, 10, Ok(run(-50.0, ConvergenceStatus::Converged))),
            (1, 11, Ok(run(-40.0, ConvergenceStatus::Exhausted))),
            (2, 12, Ok(run(-45.0, ConvergenceStatus::Converged))),
        ];
        let ((index, best), summaries) = select_best(outcomes).unwrap();
        assert_eq!(index, 1);
        assert_eq!(best.log_likelihood, -40.0);
        assert_eq!(summaries.len(), 3);
    }

    #[test]
    fn test_select_best_ties_go_to_lowest_index() {
        let outcomes = vec![
            (0, 1, Ok(run(-40.0, ConvergenceStatus::Converged))),
            (1, 2, Ok(run(-40.0, ConvergenceStatus::Converged))),
        ];
        let ((index, _), _) = select_best(outcomes).unwrap();
        assert_eq!(index, 0);
    }

    #[test]
    fn test_select_best_prefers_completed_restarts() {
        let outcomes = vec![
            (0, 1, Ok(run(-10.0, ConvergenceStatus::Cancelled))),
            (1, 2, Ok(run(-90.0, ConvergenceStatus::Exhausted))),
        ];
        let ((index, _), _) = select_best(outcomes).unwrap();
        assert_eq!(index, 1);
    }

    #[test]
    fn test_select_best_skips_failed_restarts() {
        let outcomes = vec![
            (0, 1, Err(instability(0))),
            (1, 2, Ok(run(-70.0, ConvergenceStatus::Converged))),
        ];
        let ((index, _), summaries) = select_best(outcomes).unwrap();
        assert_eq!(index, 1);
        assert!(summaries[0].error.as_deref().unwrap().contains("numerical instability"));
        assert_eq!(summaries[0].status, None);
    }

    #[test]
    fn test_select_best_all_failed() {
        let outcomes = vec![(0, 1, Err(instability(0))), (1, 2, Err(PlsaError::Cancelled))];
        let err = select_best(outcomes).unwrap_err();
        assert!(matches!(err, PlsaError::AllRestartsFailed { restarts: 2, .. }));

        let outcomes = vec![(0, 1, Err(PlsaError::Cancelled))];
        assert!(matches!(select_best(outcomes).unwrap_err(), PlsaError::Cancelled));
    }

    #[test]
    fn test_rejects_empty_and_mismatched_input() {
        let plsa = Plsa::new(PlsaConfig::new(2));
        let empty = CountMatrix::from_rows(Vec::new()).unwrap();
        assert!(matches!(plsa.fit(&empty), Err(PlsaError::InvalidInput(_))));

        let counts = CountMatrix::from_counts(vec![vec![1, 2]]).unwrap();
        let vocab = Vocabulary::from_words(["only"]).unwrap();
        let err = plsa.fit_with_cancel(&counts, vocab, &CancelToken::new()).unwrap_err();
        assert!(matches!(err, PlsaError::InvalidInput(_)));
    }

    #[test]
    fn test_pre_cancelled_fit_fails() {
        let counts = CountMatrix::from_counts(vec![vec![1, 2], vec![2, 0]]).unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = Plsa::new(PlsaConfig::new(2).with_restarts(2))
            .fit_with_cancel(&counts, Vocabulary::anonymous(2), &cancel)
            .unwrap_err();
        assert!(matches!(err, PlsaError::Cancelled));
    }

    #[test]
    fn test_unstable_restart_does_not_sink_the_fit() {
        let counts = CountMatrix::from_counts(vec![vec![3, 1], vec![0, 4]]).unwrap();
        let overflowing = CountMatrix::from_rows(vec![vec![1e308, 1e308], vec![1e308, 0.0]]).unwrap();
        let plsa = Plsa::new(PlsaConfig::new(1).with_restarts(3));

        let model = plsa
            .fit_restarts(&counts, Vocabulary::anonymous(2), &CancelToken::new(), |counts, restart, seed, rule| {
                let input = if restart == 1 { &overflowing } else { counts };
                em::run_restart(input, 1, ModelVariant::Joint, restart, seed, rule)
            })
            .unwrap();

        let restarts = model.restarts();
        assert_eq!(restarts.len(), 3);
        assert_eq!(restarts[1].status, None);
        assert!(restarts[1].error.as_deref().unwrap().contains("numerical instability"));
        assert!(restarts[0].status.is_some());
        assert!(restarts[2].status.is_some());
        assert_ne!(model.best_restart(), 1);
        assert!(model.log_likelihood().is_finite());
    }

    #[test]
    fn test_tf_idf_weights_are_kept_on_the_model() {
        let counts = CountMatrix::from_counts(vec![vec![3, 1, 0], vec![2, 0, 4]]).unwrap();
        let model = Plsa::new(PlsaConfig::new(2).with_tf_idf(true)).fit(&counts).unwrap();
        assert_eq!(model.term_weights(), Some(counts.idf_weights().as_slice()));
        // Word 0 occurs everywhere, so it carries no weight and no probability
        assert_eq!(model.word_topic().row(0), &[0.0, 0.0]);

        let plain = Plsa::new(PlsaConfig::new(2)).fit(&counts).unwrap();
        assert_eq!(plain.term_weights(), None);
    }
}
