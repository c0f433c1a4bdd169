//! Probabilistic Latent Semantic Analysis.
//!
//! Fits the aspect model `P(d, w) = sum_z P(z) P(w|z) P(d|z)` to a dense
//! document-term count matrix with expectation-maximization, keeping the best
//! of several random restarts, and folds unseen documents into the fitted
//! topic space.
//!
//! ```
//! use plsa::{Corpus, CountMatrix, FoldInConfig, Plsa, PlsaConfig, Vocabulary};
//!
//! let vocabulary = Vocabulary::from_words(["rust", "cargo", "tea", "scone"]).unwrap();
//! let counts = CountMatrix::from_counts(vec![
//!     vec![4, 3, 0, 0],
//!     vec![3, 5, 0, 1],
//!     vec![0, 0, 6, 2],
//!     vec![1, 0, 3, 4],
//! ]).unwrap();
//! let corpus = Corpus::new(vocabulary, counts).unwrap();
//!
//! let model = Plsa::new(PlsaConfig::new(2).with_restarts(4)).fit_corpus(&corpus).unwrap();
//! for (topic, words) in model.top_words(2).iter().enumerate() {
//!     println!("topic {topic}: {words:?}");
//! }
//!
//! let new_doc = CountMatrix::from_counts(vec![vec![2, 2, 0, 0]]).unwrap();
//! let projected = model.fold_in(&new_doc, &FoldInConfig::default()).unwrap();
//! assert_eq!(projected.n_docs(), 1);
//! ```
//!
//! Tokenization and building the count matrix happen elsewhere; this crate
//! starts from counts.

pub mod cancel;
pub mod config;
pub mod corpus;
pub mod em;
pub mod error;
pub mod fold_in;
pub mod models;
pub mod tensor;
pub mod topic_modeling;

pub use cancel::CancelToken;
pub use config::{ConvergenceCriterion, FoldInConfig, ModelVariant, PlsaConfig};
pub use corpus::{Alignment, CountMatrix, Corpus, Vocabulary};
pub use error::{PlsaError, Result};
pub use fold_in::{fold_in, fold_in_with_cancel};
pub use models::{ConvergenceStatus, FoldInResult, PlsaModel, RestartSummary};
pub use tensor::{normalize_columns, Matrix, ProbabilityTables};
pub use topic_modeling::{fit, Plsa};
