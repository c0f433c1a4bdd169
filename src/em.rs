//! One restart of expectation-maximization for the aspect model
//! `P(d, w) = sum_z P(z) P(w|z) P(d|z)`.

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::cancel::CancelToken;
use crate::config::{ConvergenceCriterion, ModelVariant};
use crate::corpus::CountMatrix;
use crate::error::{PlsaError, Result};
use crate::models::ConvergenceStatus;
use crate::tensor::{normalize, normalize_columns, Matrix, ProbabilityTables};

/// P(z|d,w) for every (document, word) cell with a non-zero count.
///
/// Zero-count cells are not stored: they carry no weight in the M-step.
#[derive(Debug, Clone, PartialEq)]
pub struct Posterior {
    n_topics: usize,
    cells: Vec<(usize, usize)>, // Sorted (doc, word)
    values: Vec<f64>,           // cells.len() * n_topics
}

impl Posterior {
    pub fn n_topics(&self) -> usize {
        self.n_topics
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// The distribution over topics for one cell, `None` for zero-count cells.
    pub fn get(&self, doc: usize, word: usize) -> Option<&[f64]> {
        let i = self.cells.binary_search(&(doc, word)).ok()?;
        Some(&self.values[i * self.n_topics..(i + 1) * self.n_topics])
    }

    pub fn iter(&self) -> impl Iterator<Item = ((usize, usize), &[f64])> {
        self.cells
            .iter()
            .copied()
            .zip(self.values.chunks_exact(self.n_topics.max(1)))
    }
}

/// Writes P(z|d,w) for one cell into `out`. Uniform when every topic has zero mass.
#[inline]
fn cell_posterior(tables: &ProbabilityTables, doc: usize, word: usize, out: &mut [f64]) {
    let p_w = tables.word_topic.row(word);
    let p_d = tables.doc_topic.row(doc);
    for (z, slot) in out.iter_mut().enumerate() {
        *slot = tables.topic_prior[z] * p_w[z] * p_d[z];
    }
    normalize(out);
}

pub fn e_step(counts: &CountMatrix, tables: &ProbabilityTables) -> Posterior {
    let n_topics = tables.n_topics();
    let mut cells = Vec::with_capacity(counts.nnz());
    let mut values = Vec::with_capacity(counts.nnz() * n_topics);
    let mut buf = vec![0.0; n_topics];

    for d in 0..counts.n_docs() {
        for (w, &count) in counts.row(d).iter().enumerate() {
            if count > 0.0 {
                cell_posterior(tables, d, w, &mut buf);
                cells.push((d, w));
                values.extend_from_slice(&buf);
            }
        }
    }

    Posterior {
        n_topics,
        cells,
        values,
    }
}

/// Accumulates count-weighted posterior mass into unnormalized tables.
struct Accumulator {
    topic: Vec<f64>,
    word_topic: Matrix,
    doc_topic: Matrix,
}

impl Accumulator {
    fn new(n_docs: usize, n_words: usize, n_topics: usize) -> Self {
        Accumulator {
            topic: vec![0.0; n_topics],
            word_topic: Matrix::zeros(n_words, n_topics),
            doc_topic: Matrix::zeros(n_docs, n_topics),
        }
    }

    #[inline]
    fn add(&mut self, doc: usize, word: usize, count: f64, posterior: &[f64]) {
        for (z, &q) in posterior.iter().enumerate() {
            let mass = count * q;
            self.word_topic.add(word, z, mass);
            self.doc_topic.add(doc, z, mass);
            self.topic[z] += mass;
        }
    }

    fn finish(mut self, counts: &CountMatrix, variant: ModelVariant) -> ProbabilityTables {
        normalize_columns(&mut self.doc_topic);
        match variant {
            ModelVariant::Joint => {
                normalize_columns(&mut self.word_topic);
                normalize(&mut self.topic);
            }
            ModelVariant::Conditional => {
                // Rows become P(z|w), then P(w) P(z|w) = P(w, z)
                let word_marginal = word_marginal(counts);
                for (w, &p_w) in word_marginal.iter().enumerate() {
                    let row = self.word_topic.row_mut(w);
                    normalize(row);
                    row.iter_mut().for_each(|p| *p *= p_w);
                }
                self.topic = self.word_topic.column_sums();
                normalize(&mut self.topic);
                normalize_columns(&mut self.word_topic);
            }
        }
        ProbabilityTables {
            topic_prior: self.topic,
            word_topic: self.word_topic,
            doc_topic: self.doc_topic,
        }
    }
}

/// Empirical P(w). Uniform when there are no counts at all.
fn word_marginal(counts: &CountMatrix) -> Vec<f64> {
    let mut totals = counts.word_totals();
    normalize(&mut totals);
    totals
}

/// Re-estimates all three tables from a posterior produced by [`e_step`] on the same counts.
pub fn m_step(counts: &CountMatrix, posterior: &Posterior, variant: ModelVariant) -> ProbabilityTables {
    let mut acc = Accumulator::new(counts.n_docs(), counts.n_words(), posterior.n_topics());
    for ((d, w), q) in posterior.iter() {
        acc.add(d, w, counts.get(d, w), q);
    }
    acc.finish(counts, variant)
}

/// E-step and M-step fused, computing each cell's posterior on the fly instead
/// of materializing the full posterior. Same result as `m_step(counts, &e_step(counts, tables), variant)`.
pub fn em_iteration(counts: &CountMatrix, tables: &ProbabilityTables, variant: ModelVariant) -> ProbabilityTables {
    let n_topics = tables.n_topics();
    let mut acc = Accumulator::new(counts.n_docs(), counts.n_words(), n_topics);
    let mut buf = vec![0.0; n_topics];

    for d in 0..counts.n_docs() {
        for (w, &count) in counts.row(d).iter().enumerate() {
            if count > 0.0 {
                cell_posterior(tables, d, w, &mut buf);
                acc.add(d, w, count, &buf);
            }
        }
    }
    acc.finish(counts, variant)
}

/// `sum_{d,w} n(d,w) ln P(d,w)`. Zero-count cells contribute nothing and
/// P(d,w) is floored at the smallest positive normal float.
pub fn log_likelihood(counts: &CountMatrix, tables: &ProbabilityTables) -> f64 {
    let mut total = 0.0;
    for d in 0..counts.n_docs() {
        for (w, &count) in counts.row(d).iter().enumerate() {
            if count > 0.0 {
                total += count * tables.joint(d, w).max(f64::MIN_POSITIVE).ln();
            }
        }
    }
    total
}

/// Iteration budget and stopping rule shared by fitting and fold-in.
#[derive(Debug, Clone)]
pub struct StopRule<'a> {
    pub max_iterations: usize,
    pub tolerance: f64,
    pub warmup: usize,
    pub criterion: ConvergenceCriterion,
    pub cancel: &'a CancelToken,
}

impl StopRule<'_> {
    /// True once `iteration` (1-based) is past warmup and the change from `previous` is small enough.
    pub fn converged(&self, iteration: usize, previous: Option<f64>, current: f64) -> bool {
        iteration > self.warmup
            && previous.is_some_and(|old| self.criterion.change(old, current) < self.tolerance)
    }
}

/// Outcome of one restart that produced usable tables.
#[derive(Debug, Clone)]
pub struct RestartRun {
    pub tables: ProbabilityTables,
    pub trace: Vec<f64>,
    pub log_likelihood: f64,
    pub status: ConvergenceStatus,
    pub iterations: usize,
}

/// Runs EM from a random start seeded with `seed` until convergence, budget
/// exhaustion or cancellation.
///
/// Cancellation before the first iteration completes is reported as
/// [`PlsaError::Cancelled`]; later cancellation returns the last tables with
/// status [`ConvergenceStatus::Cancelled`].
pub fn run_restart(
    counts: &CountMatrix,
    n_topics: usize,
    variant: ModelVariant,
    restart: usize,
    seed: u64,
    rule: &StopRule<'_>,
) -> Result<RestartRun> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut tables = ProbabilityTables::initialize(counts.n_docs(), counts.n_words(), n_topics, &mut rng);
    let mut trace: Vec<f64> = Vec::new();
    let mut status = ConvergenceStatus::Exhausted;

    for iteration in 1..=rule.max_iterations {
        if rule.cancel.is_cancelled() {
            if trace.is_empty() {
                return Err(PlsaError::Cancelled);
            }
            status = ConvergenceStatus::Cancelled;
            break;
        }

        let next = em_iteration(counts, &tables, variant);
        if let Some(table) = next.first_non_finite() {
            return Err(PlsaError::NumericalInstability {
                restart,
                iteration,
                detail: format!("non-finite value in {table}"),
            });
        }
        let likelihood = log_likelihood(counts, &next);
        if !likelihood.is_finite() {
            return Err(PlsaError::NumericalInstability {
                restart,
                iteration,
                detail: format!("log-likelihood is {likelihood}"),
            });
        }
        tables = next;

        let converged = rule.converged(iteration, trace.last().copied(), likelihood);
        trace.push(likelihood);

        if iteration % 50 == 0 {
            log::debug!("restart {restart}: iteration {iteration}/{}, log-likelihood {likelihood:.6}", rule.max_iterations);
        }
        if converged {
            status = ConvergenceStatus::Converged;
            break;
        }
    }

    let iterations = trace.len();
    let log_likelihood = trace.last().copied().unwrap_or(f64::NEG_INFINITY);
    log::debug!("restart {restart} (seed {seed}) finished: {status} after {iterations} iterations, log-likelihood {log_likelihood:.6}");

    Ok(RestartRun {
        tables,
        trace,
        log_likelihood,
        status,
        iterations,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toy_counts() -> CountMatrix {
        CountMatrix::from_counts(vec![
            vec![4, 2, 0, 0, 1],
            vec![3, 3, 1, 0, 0],
            vec![0, 0, 5, 4, 0],
            vec![0, 1, 2, 6, 2],
        ])
        .unwrap()
    }

    fn toy_tables(seed: u64) -> ProbabilityTables {
        ProbabilityTables::initialize(4, 5, 2, &mut ChaCha8Rng::seed_from_u64(seed))
    }

    #[test]
    fn test_e_step_slices_sum_to_one() {
        let counts = toy_counts();
        let posterior = e_step(&counts, &toy_tables(3));
        assert_eq!(posterior.len(), counts.nnz());
        for (_, q) in posterior.iter() {
            assert!((q.iter().sum::<f64>() - 1.0).abs() < 1e-12);
        }
        assert!(posterior.get(0, 2).is_none());
        assert!(posterior.get(2, 2).is_some());
    }

    #[test]
    fn test_fused_iteration_matches_separate_steps() {
        let counts = toy_counts();
        let tables = toy_tables(5);
        let separate = m_step(&counts, &e_step(&counts, &tables), ModelVariant::Joint);
        let fused = em_iteration(&counts, &tables, ModelVariant::Joint);
        assert_eq!(separate, fused);
    }

    #[test]
    fn test_m_step_tables_are_distributions() {
        let counts = toy_counts();
        let next = m_step(&counts, &e_step(&counts, &toy_tables(9)), ModelVariant::Joint);
        assert!((next.topic_prior.iter().sum::<f64>() - 1.0).abs() < 1e-9);
        for sum in next.word_topic.column_sums() {
            assert!((sum - 1.0).abs() < 1e-9);
        }
        for sum in next.doc_topic.column_sums() {
            assert!((sum - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_likelihood_never_decreases() {
        let counts = toy_counts();
        let mut tables = toy_tables(21);
        let mut previous = log_likelihood(&counts, &tables);
        for _ in 0..100 {
            tables = em_iteration(&counts, &tables, ModelVariant::Joint);
            let current = log_likelihood(&counts, &tables);
            assert!(current >= previous - 1e-10, "{current} < {previous}");
            previous = current;
        }
    }

    #[test]
    fn test_likelihood_of_single_topic_model() {
        // With K = 1 the model is P(d) P(w) and EM reaches it in one step.
        let counts = CountMatrix::from_counts(vec![vec![1, 1], vec![2, 0]]).unwrap();
        let tables = em_iteration(
            &counts,
            &ProbabilityTables::initialize(2, 2, 1, &mut ChaCha8Rng::seed_from_u64(0)),
            ModelVariant::Joint,
        );
        let expected = (0.5f64 * 0.75).ln() + (0.5f64 * 0.25).ln() + 2.0 * (0.5f64 * 0.75).ln();
        assert!((log_likelihood(&counts, &tables) - expected).abs() < 1e-12);
    }

    #[test]
    fn test_zero_row_gets_no_document_mass() {
        let counts = CountMatrix::from_counts(vec![vec![2, 1], vec![0, 0], vec![1, 3]]).unwrap();
        let next = em_iteration(
            &counts,
            &ProbabilityTables::initialize(3, 2, 2, &mut ChaCha8Rng::seed_from_u64(4)),
            ModelVariant::Joint,
        );
        assert_eq!(next.doc_topic.row(1), &[0.0, 0.0]);
        assert!(log_likelihood(&counts, &next).is_finite());
    }

    #[test]
    fn test_all_zero_counts_fall_back_to_uniform() {
        let counts = CountMatrix::from_counts(vec![vec![0, 0, 0], vec![0, 0, 0]]).unwrap();
        let next = em_iteration(
            &counts,
            &ProbabilityTables::initialize(2, 3, 2, &mut ChaCha8Rng::seed_from_u64(4)),
            ModelVariant::Joint,
        );
        assert_eq!(next.topic_prior, vec![0.5, 0.5]);
        for p in next.word_topic.as_slice() {
            assert!((p - 1.0 / 3.0).abs() < 1e-15);
        }
        assert_eq!(log_likelihood(&counts, &next), 0.0);
    }

    #[test]
    fn test_run_restart_stops_on_cancel() {
        let counts = toy_counts();
        let cancel = CancelToken::new();
        cancel.cancel();
        let rule = StopRule {
            max_iterations: 10,
            tolerance: 0.0,
            warmup: 0,
            criterion: ConvergenceCriterion::Relative,
            cancel: &cancel,
        };
        assert!(matches!(run_restart(&counts, 2, ModelVariant::Joint, 0, 1, &rule), Err(PlsaError::Cancelled)));
    }

    #[test]
    fn test_run_restart_exhausts_budget() {
        let counts = toy_counts();
        let cancel = CancelToken::new();
        let rule = StopRule {
            max_iterations: 3,
            tolerance: 0.0,
            warmup: 0,
            criterion: ConvergenceCriterion::Relative,
            cancel: &cancel,
        };
        let run = run_restart(&counts, 2, ModelVariant::Joint, 0, 1, &rule).unwrap();
        assert_eq!(run.status, ConvergenceStatus::Exhausted);
        assert_eq!(run.iterations, 3);
        assert_eq!(run.trace.len(), 3);
        assert_eq!(run.log_likelihood, run.trace[2]);
    }

    #[test]
    fn test_warmup_delays_convergence() {
        let counts = toy_counts();
        let cancel = CancelToken::new();
        let rule = StopRule {
            max_iterations: 100,
            tolerance: f64::MAX,
            warmup: 4,
            criterion: ConvergenceCriterion::Absolute,
            cancel: &cancel,
        };
        let run = run_restart(&counts, 2, ModelVariant::Joint, 0, 1, &rule).unwrap();
        assert_eq!(run.status, ConvergenceStatus::Converged);
        assert_eq!(run.iterations, 5);
    }

    #[test]
    fn test_overflowing_counts_abort_the_restart() {
        let counts = CountMatrix::from_rows(vec![vec![1e308, 1e308], vec![1e308, 0.0]]).unwrap();
        let cancel = CancelToken::new();
        let rule = StopRule {
            max_iterations: 10,
            tolerance: 0.0,
            warmup: 0,
            criterion: ConvergenceCriterion::Relative,
            cancel: &cancel,
        };
        let err = run_restart(&counts, 1, ModelVariant::Joint, 3, 7, &rule).unwrap_err();
        match err {
            PlsaError::NumericalInstability { restart, iteration, detail } => {
                assert_eq!(restart, 3);
                assert_eq!(iteration, 1);
                assert!(detail.contains("topic prior"), "{detail}");
            }
            other => panic!("expected numerical instability, got {other:?}"),
        }
    }

    #[test]
    fn test_conditional_fused_iteration_matches_separate_steps() {
        let counts = toy_counts();
        let tables = toy_tables(5);
        let separate = m_step(&counts, &e_step(&counts, &tables), ModelVariant::Conditional);
        let fused = em_iteration(&counts, &tables, ModelVariant::Conditional);
        assert_eq!(separate, fused);
    }

    #[test]
    fn test_conditional_tables_are_distributions() {
        let counts = toy_counts();
        let next = em_iteration(&counts, &toy_tables(9), ModelVariant::Conditional);
        assert!((next.topic_prior.iter().sum::<f64>() - 1.0).abs() < 1e-9);
        for sum in next.word_topic.column_sums() {
            assert!((sum - 1.0).abs() < 1e-9);
        }
        for sum in next.doc_topic.column_sums() {
            assert!((sum - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_conditional_keeps_empirical_word_marginal() {
        // sum_z P(z) P(w|z) reproduces P(w) from the counts
        let counts = toy_counts();
        let total = counts.total();
        let next = em_iteration(&counts, &toy_tables(13), ModelVariant::Conditional);
        for (w, word_total) in counts.word_totals().into_iter().enumerate() {
            let modeled: f64 = (0..next.n_topics())
                .map(|z| next.topic_prior[z] * next.word_topic.get(w, z))
                .sum();
            assert!((modeled - word_total / total).abs() < 1e-12, "word {w}: {modeled}");
        }
    }

    #[test]
    fn test_conditional_likelihood_never_decreases() {
        let counts = toy_counts();
        let mut tables = em_iteration(&counts, &toy_tables(21), ModelVariant::Conditional);
        let mut previous = log_likelihood(&counts, &tables);
        for _ in 0..100 {
            tables = em_iteration(&counts, &tables, ModelVariant::Conditional);
            let current = log_likelihood(&counts, &tables);
            assert!(current >= previous - 1e-10, "{current} < {previous}");
            previous = current;
        }
    }

    #[test]
    fn test_variants_agree_with_one_topic() {
        let counts = toy_counts();
        let start = ProbabilityTables::initialize(4, 5, 1, &mut ChaCha8Rng::seed_from_u64(2));
        let joint = em_iteration(&counts, &start, ModelVariant::Joint);
        let conditional = em_iteration(&counts, &start, ModelVariant::Conditional);
        assert_eq!(joint.topic_prior, conditional.topic_prior);
        for (a, b) in joint.word_topic.as_slice().iter().zip(conditional.word_topic.as_slice()) {
            assert!((a - b).abs() < 1e-12);
        }
        assert!((log_likelihood(&counts, &joint) - log_likelihood(&counts, &conditional)).abs() < 1e-9);
    }

    #[test]
    fn test_conditional_all_zero_counts_fall_back_to_uniform() {
        let counts = CountMatrix::from_counts(vec![vec![0, 0, 0], vec![0, 0, 0]]).unwrap();
        let next = em_iteration(
            &counts,
            &ProbabilityTables::initialize(2, 3, 2, &mut ChaCha8Rng::seed_from_u64(4)),
            ModelVariant::Conditional,
        );
        assert_eq!(next.topic_prior, vec![0.5, 0.5]);
        for p in next.word_topic.as_slice() {
            assert!((p - 1.0 / 3.0).abs() < 1e-15);
        }
    }
}
