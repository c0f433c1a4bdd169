use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlsaError {
    /// Bad counts, bad dimensions or bad hyperparameters. Raised before any iteration runs.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// NaN or infinity showed up in a table or the likelihood.
    #[error("numerical instability in restart {restart} at iteration {iteration}: {detail}")]
    NumericalInstability {
        restart: usize,
        iteration: usize,
        detail: String,
    },

    #[error("fit cancelled before any restart produced a result")]
    Cancelled,

    #[error("all {restarts} restarts failed, last error: {last}")]
    AllRestartsFailed { restarts: usize, last: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PlsaError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, PlsaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = PlsaError::invalid("negative count at (0, 3)");
        assert_eq!(e.to_string(), "invalid input: negative count at (0, 3)");

        let e = PlsaError::NumericalInstability {
            restart: 2,
            iteration: 17,
            detail: "log-likelihood is NaN".into(),
        };
        assert_eq!(
            e.to_string(),
            "numerical instability in restart 2 at iteration 17: log-likelihood is NaN"
        );

        let e = PlsaError::AllRestartsFailed {
            restarts: 3,
            last: "boom".into(),
        };
        assert!(e.to_string().contains("all 3 restarts failed"));
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing.json");
        let e: PlsaError = io.into();
        assert!(matches!(e, PlsaError::Io(_)));
    }
}
