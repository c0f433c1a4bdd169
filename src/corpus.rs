use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{PlsaError, Result};

/// Ordered, deduplicated word list. Position is the word's column in a [`CountMatrix`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct Vocabulary {
    words: Vec<String>,
    index: HashMap<String, usize>,
}

impl Vocabulary {
    /// Builds a vocabulary, rejecting repeated words.
    pub fn from_words<I, S>(words: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut vocab = Vocabulary::default();
        for word in words {
            let word = word.into();
            if vocab.index.contains_key(&word) {
                return Err(PlsaError::invalid(format!(
                    "duplicate word '{word}' in vocabulary"
                )));
            }
            vocab.index.insert(word.clone(), vocab.words.len());
            vocab.words.push(word);
        }
        Ok(vocab)
    }

    /// Builds a vocabulary keeping the first occurrence of every word.
    pub fn dedup_from<I, S>(words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut vocab = Vocabulary::default();
        for word in words {
            let word = word.into();
            if !vocab.index.contains_key(&word) {
                vocab.index.insert(word.clone(), vocab.words.len());
                vocab.words.push(word);
            }
        }
        vocab
    }

    /// Placeholder names `w0`, `w1`, ... for matrices supplied without words.
    pub fn anonymous(n_words: usize) -> Self {
        Self::dedup_from((0..n_words).map(|i| format!("w{i}")))
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn word(&self, index: usize) -> Option<&str> {
        self.words.get(index).map(String::as_str)
    }

    pub fn index_of(&self, word: &str) -> Option<usize> {
        self.index.get(word).copied()
    }

    pub fn words(&self) -> &[String] {
        &self.words
    }
}

impl TryFrom<Vec<String>> for Vocabulary {
    type Error = PlsaError;

    fn try_from(words: Vec<String>) -> Result<Self> {
        Vocabulary::from_words(words)
    }
}

impl From<Vocabulary> for Vec<String> {
    fn from(vocab: Vocabulary) -> Self {
        vocab.words
    }
}

/// Dense documents x words matrix of non-negative word counts (or weights).
#[derive(Debug, Clone, PartialEq)]
pub struct CountMatrix {
    n_docs: usize,
    n_words: usize,
    data: Vec<f64>, // Row-major, one row per document
}

impl CountMatrix {
    pub fn new(n_docs: usize, n_words: usize, data: Vec<f64>) -> Result<Self> {
        if data.len() != n_docs * n_words {
            return Err(PlsaError::invalid(format!(
                "count matrix expects {} entries for {n_docs}x{n_words}, got {}",
                n_docs * n_words,
                data.len()
            )));
        }
        for (i, &value) in data.iter().enumerate() {
            if !value.is_finite() || value < 0.0 {
                return Err(PlsaError::invalid(format!(
                    "count at (doc {}, word {}) must be finite and non-negative, got {value}",
                    i / n_words.max(1),
                    i % n_words.max(1)
                )));
            }
        }
        Ok(CountMatrix {
            n_docs,
            n_words,
            data,
        })
    }

    pub fn from_rows(rows: Vec<Vec<f64>>) -> Result<Self> {
        let n_docs = rows.len();
        let n_words = rows.first().map_or(0, Vec::len);
        let mut data = Vec::with_capacity(n_docs * n_words);
        for (d, row) in rows.into_iter().enumerate() {
            if row.len() != n_words {
                return Err(PlsaError::invalid(format!(
                    "document {d} has {} columns, expected {n_words}",
                    row.len()
                )));
            }
            data.extend(row);
        }
        Self::new(n_docs, n_words, data)
    }

    pub fn from_counts(rows: Vec<Vec<u32>>) -> Result<Self> {
        Self::from_rows(
            rows.into_iter()
                .map(|row| row.into_iter().map(f64::from).collect())
                .collect(),
        )
    }

    pub fn n_docs(&self) -> usize {
        self.n_docs
    }

    pub fn n_words(&self) -> usize {
        self.n_words
    }

    #[inline]
    pub fn get(&self, doc: usize, word: usize) -> f64 {
        self.data[doc * self.n_words + word]
    }

    pub fn row(&self, doc: usize) -> &[f64] {
        &self.data[doc * self.n_words..(doc + 1) * self.n_words]
    }

    pub fn rows(&self) -> impl Iterator<Item = &[f64]> {
        // data is empty when there are no columns
        self.data.chunks_exact(self.n_words.max(1))
    }

    pub fn doc_totals(&self) -> Vec<f64> {
        (0..self.n_docs).map(|d| self.row(d).iter().sum()).collect()
    }

    pub fn word_totals(&self) -> Vec<f64> {
        let mut totals = vec![0.0; self.n_words];
        for row in self.rows() {
            for (total, &count) in totals.iter_mut().zip(row) {
                *total += count;
            }
        }
        totals
    }

    pub fn total(&self) -> f64 {
        self.data.iter().sum()
    }

    pub fn is_zero_row(&self, doc: usize) -> bool {
        self.row(doc).iter().all(|&c| c == 0.0)
    }

    /// Number of stored entries that are non-zero.
    pub fn nnz(&self) -> usize {
        self.data.iter().filter(|&&c| c > 0.0).count()
    }

    /// `ln(D / df)` per word, where `df` is the number of documents the word
    /// occurs in. Words in every document, and words in none, get 0.
    pub fn idf_weights(&self) -> Vec<f64> {
        let n_docs = self.n_docs as f64;
        let mut doc_freq = vec![0usize; self.n_words];
        for row in self.rows() {
            for (df, &count) in doc_freq.iter_mut().zip(row) {
                if count > 0.0 {
                    *df += 1;
                }
            }
        }
        doc_freq
            .iter()
            .map(|&df| if df == 0 { 0.0 } else { (n_docs / df as f64).ln() })
            .collect()
    }

    /// Scales every column by its weight, e.g. by [`CountMatrix::idf_weights`].
    pub fn weighted(&self, weights: &[f64]) -> Result<CountMatrix> {
        if weights.len() != self.n_words {
            return Err(PlsaError::invalid(format!(
                "{} column weights given for {} words",
                weights.len(),
                self.n_words
            )));
        }
        let mut data = self.data.clone();
        if self.n_words > 0 {
            for row in data.chunks_exact_mut(self.n_words) {
                for (value, weight) in row.iter_mut().zip(weights) {
                    *value *= weight;
                }
            }
        }
        CountMatrix::new(self.n_docs, self.n_words, data)
    }

    /// Keeps every n-th document (starting with the first) in the first matrix
    /// and the rest in the second, together with their original row indices.
    pub fn split_every(&self, nth: usize) -> Result<(CountMatrix, Vec<usize>, CountMatrix, Vec<usize>)> {
        if nth == 0 {
            return Err(PlsaError::invalid("split step must be at least 1"));
        }
        let (mut picked, mut picked_rows) = (Vec::new(), Vec::new());
        let (mut rest, mut rest_rows) = (Vec::new(), Vec::new());
        for d in 0..self.n_docs {
            if d % nth == 0 {
                picked.extend_from_slice(self.row(d));
                picked_rows.push(d);
            } else {
                rest.extend_from_slice(self.row(d));
                rest_rows.push(d);
            }
        }
        Ok((
            CountMatrix::new(picked_rows.len(), self.n_words, picked)?,
            picked_rows,
            CountMatrix::new(rest_rows.len(), self.n_words, rest)?,
            rest_rows,
        ))
    }
}

#[derive(Deserialize)]
struct RawCorpus {
    vocabulary: Option<Vec<String>>,
    counts: Vec<Vec<f64>>,
    #[serde(default)]
    labels: Option<Vec<String>>,
}

/// A count matrix together with the vocabulary naming its columns.
///
/// JSON shape: `{"vocabulary": [...], "counts": [[...], ...], "labels": [...]}`.
/// `vocabulary` and `labels` are optional.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Corpus {
    pub vocabulary: Vocabulary,
    #[serde(serialize_with = "serialize_counts")]
    pub counts: CountMatrix,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<Vec<String>>,
}

fn serialize_counts<S>(counts: &CountMatrix, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.collect_seq(counts.rows())
}

impl<'de> Deserialize<'de> for Corpus {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = RawCorpus::deserialize(deserializer)?;
        Corpus::from_raw(raw).map_err(serde::de::Error::custom)
    }
}

impl Corpus {
    fn from_raw(raw: RawCorpus) -> Result<Self> {
        let counts = CountMatrix::from_rows(raw.counts)?;
        let vocabulary = match raw.vocabulary {
            Some(words) => Vocabulary::from_words(words)?,
            None => Vocabulary::anonymous(counts.n_words()),
        };
        let corpus = Corpus::new(vocabulary, counts)?;
        match raw.labels {
            Some(labels) => corpus.with_labels(labels),
            None => Ok(corpus),
        }
    }
}

/// Result of re-indexing a corpus onto another vocabulary.
#[derive(Debug, Clone)]
pub struct Alignment {
    pub counts: CountMatrix,
    pub dropped_words: Vec<String>,
}

impl Corpus {
    pub fn new(vocabulary: Vocabulary, counts: CountMatrix) -> Result<Self> {
        if counts.n_docs() > 0 && vocabulary.len() != counts.n_words() {
            return Err(PlsaError::invalid(format!(
                "vocabulary has {} words but count matrix has {} columns",
                vocabulary.len(),
                counts.n_words()
            )));
        }
        Ok(Corpus {
            vocabulary,
            counts,
            labels: None,
        })
    }

    pub fn with_labels(mut self, labels: Vec<String>) -> Result<Self> {
        if labels.len() != self.counts.n_docs() {
            return Err(PlsaError::invalid(format!(
                "{} labels given for {} documents",
                labels.len(),
                self.counts.n_docs()
            )));
        }
        self.labels = Some(labels);
        Ok(self)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn to_json_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text)?;
        Ok(())
    }

    pub fn label(&self, doc: usize) -> String {
        self.labels
            .as_ref()
            .and_then(|labels| labels.get(doc).cloned())
            .unwrap_or_else(|| format!("doc {doc}"))
    }

    /// Re-indexes the counts onto `target`. Words unknown to `target` are dropped;
    /// target words missing here get zero counts.
    pub fn align_to(&self, target: &Vocabulary) -> Alignment {
        let mapping: Vec<Option<usize>> = self
            .vocabulary
            .words()
            .iter()
            .map(|word| target.index_of(word))
            .collect();
        let dropped_words: Vec<String> = self
            .vocabulary
            .words()
            .iter()
            .zip(&mapping)
            .filter(|(_, slot)| slot.is_none())
            .map(|(word, _)| word.clone())
            .collect();

        let n_docs = self.counts.n_docs();
        let mut data = vec![0.0; n_docs * target.len()];
        for d in 0..n_docs {
            for (w, &count) in self.counts.row(d).iter().enumerate() {
                if let Some(t) = mapping[w] {
                    data[d * target.len() + t] += count;
                }
            }
        }

        if !dropped_words.is_empty() {
            log::warn!(
                "dropped {} out-of-vocabulary words while aligning {} documents",
                dropped_words.len(),
                n_docs
            );
        }

        Alignment {
            counts: CountMatrix {
                n_docs,
                n_words: target.len(),
                data,
            },
            dropped_words,
        }
    }
}
