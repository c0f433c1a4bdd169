//! Probability tables of the aspect model and the utilities keeping them normalized.
//!
//! Every table is stored column-stochastic: a column of [`ProbabilityTables::word_topic`]
//! is P(w|z) for one topic, a column of [`ProbabilityTables::doc_topic`] is P(d|z).

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{PlsaError, Result};

/// Smallest value a freshly initialized probability may take.
pub const PROBABILITY_FLOOR: f64 = 1e-12;

/// Dense row-major matrix of `f64`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Matrix {
    rows: usize,
    cols: usize,
    data: Vec<f64>,
}

impl Matrix {
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Matrix {
            rows,
            cols,
            data: vec![0.0; rows * cols],
        }
    }

    /// Returns `None` when `data` does not hold exactly `rows * cols` values.
    pub fn from_vec(rows: usize, cols: usize, data: Vec<f64>) -> Option<Self> {
        (data.len() == rows * cols).then_some(Matrix { rows, cols, data })
    }

    pub fn n_rows(&self) -> usize {
        self.rows
    }

    pub fn n_cols(&self) -> usize {
        self.cols
    }

    #[inline]
    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.data[row * self.cols + col]
    }

    #[inline]
    pub fn set(&mut self, row: usize, col: usize, value: f64) {
        self.data[row * self.cols + col] = value;
    }

    #[inline]
    pub fn add(&mut self, row: usize, col: usize, value: f64) {
        self.data[row * self.cols + col] += value;
    }

    pub fn row(&self, row: usize) -> &[f64] {
        &self.data[row * self.cols..(row + 1) * self.cols]
    }

    pub fn row_mut(&mut self, row: usize) -> &mut [f64] {
        &mut self.data[row * self.cols..(row + 1) * self.cols]
    }

    pub fn column(&self, col: usize) -> Vec<f64> {
        (0..self.rows).map(|r| self.get(r, col)).collect()
    }

    pub fn column_sums(&self) -> Vec<f64> {
        let mut sums = vec![0.0; self.cols];
        for r in 0..self.rows {
            for (sum, &value) in sums.iter_mut().zip(self.row(r)) {
                *sum += value;
            }
        }
        sums
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    pub fn is_finite(&self) -> bool {
        self.data.iter().all(|v| v.is_finite())
    }
}

/// Divides every column by its sum. A column summing to zero becomes uniform.
pub fn normalize_columns(matrix: &mut Matrix) {
    if matrix.rows == 0 {
        return;
    }
    let sums = matrix.column_sums();
    let uniform = 1.0 / matrix.rows as f64;
    for r in 0..matrix.rows {
        for (value, &sum) in matrix.row_mut(r).iter_mut().zip(&sums) {
            *value = if sum > 0.0 { *value / sum } else { uniform };
        }
    }
}

/// Divides every row by its sum. A row summing to zero becomes uniform.
pub fn normalize_rows(matrix: &mut Matrix) {
    for r in 0..matrix.rows {
        normalize(matrix.row_mut(r));
    }
}

/// Scales `values` to sum to 1, falling back to uniform when the sum is zero.
pub fn normalize(values: &mut [f64]) {
    if values.is_empty() {
        return;
    }
    let sum: f64 = values.iter().sum();
    if sum > 0.0 {
        values.iter_mut().for_each(|v| *v /= sum);
    } else {
        let uniform = 1.0 / values.len() as f64;
        values.iter_mut().for_each(|v| *v = uniform);
    }
}

/// Index of the largest value; the lowest index wins ties. Zero for an empty slice.
pub fn argmax(values: &[f64]) -> usize {
    let mut best = 0;
    for (i, &value) in values.iter().enumerate().skip(1) {
        if value > values[best] {
            best = i;
        }
    }
    best
}

/// The three tables parameterizing the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbabilityTables {
    pub topic_prior: Vec<f64>, // P(z), length K
    pub word_topic: Matrix,    // P(w|z), V x K
    pub doc_topic: Matrix,     // P(d|z), D x K
}

impl ProbabilityTables {
    /// Random positive tables, each distribution normalized.
    pub fn initialize<R: Rng + ?Sized>(n_docs: usize, n_words: usize, n_topics: usize, rng: &mut R) -> Self {
        let mut topic_prior: Vec<f64> = (0..n_topics).map(|_| draw(rng)).collect();
        normalize(&mut topic_prior);

        let mut word_topic = random_matrix(n_words, n_topics, rng);
        normalize_columns(&mut word_topic);

        let mut doc_topic = random_matrix(n_docs, n_topics, rng);
        normalize_columns(&mut doc_topic);

        ProbabilityTables {
            topic_prior,
            word_topic,
            doc_topic,
        }
    }

    pub fn n_topics(&self) -> usize {
        self.topic_prior.len()
    }

    pub fn n_words(&self) -> usize {
        self.word_topic.n_rows()
    }

    pub fn n_docs(&self) -> usize {
        self.doc_topic.n_rows()
    }

    /// P(d, w) = sum_z P(z) P(w|z) P(d|z).
    #[inline]
    pub fn joint(&self, doc: usize, word: usize) -> f64 {
        let p_w = self.word_topic.row(word);
        let p_d = self.doc_topic.row(doc);
        self.topic_prior
            .iter()
            .zip(p_w)
            .zip(p_d)
            .map(|((pz, pw), pd)| pz * pw * pd)
            .sum()
    }

    /// Checks that every matrix holds `rows x cols` values and that all three
    /// tables agree on the number of topics. Only deserialized tables can fail.
    pub fn check_shape(&self) -> Result<()> {
        for (name, m) in [("word-topic table", &self.word_topic), ("document-topic table", &self.doc_topic)] {
            if m.rows.checked_mul(m.cols) != Some(m.data.len()) {
                return Err(PlsaError::invalid(format!(
                    "{name} holds {} values for {}x{}",
                    m.data.len(),
                    m.rows,
                    m.cols
                )));
            }
        }
        let k = self.topic_prior.len();
        if k == 0 || self.word_topic.cols != k || self.doc_topic.cols != k {
            return Err(PlsaError::invalid(format!(
                "topic prior has {k} entries, word-topic table {} columns, document-topic table {} columns",
                self.word_topic.cols, self.doc_topic.cols
            )));
        }
        Ok(())
    }

    /// Names the first table holding a non-finite value.
    pub fn first_non_finite(&self) -> Option<&'static str> {
        if !self.topic_prior.iter().all(|v| v.is_finite()) {
            Some("topic prior")
        } else if !self.word_topic.is_finite() {
            Some("word-topic table")
        } else if !self.doc_topic.is_finite() {
            Some("document-topic table")
        } else {
            None
        }
    }
}

fn draw<R: Rng + ?Sized>(rng: &mut R) -> f64 {
    rng.gen::<f64>().max(PROBABILITY_FLOOR)
}

fn random_matrix<R: Rng + ?Sized>(rows: usize, cols: usize, rng: &mut R) -> Matrix {
    let data = (0..rows * cols).map(|_| draw(rng)).collect();
    Matrix { rows, cols, data }
}
