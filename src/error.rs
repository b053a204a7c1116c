use chrono::NaiveDate;

/// Failures surfaced by the feature engine and its CSV store.
///
/// Missing history is not represented here: rolling statistics that cannot be
/// computed yet are `None` cells and get filtered out before training.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("invalid parameter `{name}`: {reason}")]
    InvalidParameter { name: &'static str, reason: String },

    #[error("data integrity violation for {coin_id} on {date}: {issue}")]
    DataIntegrity {
        coin_id: String,
        date: NaiveDate,
        issue: IntegrityIssue,
    },

    #[error("model fit failed for {coin_id}: {reason}")]
    ModelFit { coin_id: String, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrityIssue {
    DuplicateDate,
    NonIncreasingDate,
    InvalidPrice,
}

impl std::fmt::Display for IntegrityIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            IntegrityIssue::DuplicateDate => "duplicate (coin, date) observation",
            IntegrityIssue::NonIncreasingDate => "dates are not strictly increasing",
            IntegrityIssue::InvalidPrice => "price is negative or not finite",
        };
        f.write_str(msg)
    }
}

impl PipelineError {
    pub(crate) fn invalid(name: &'static str, reason: impl Into<String>) -> Self {
        PipelineError::InvalidParameter {
            name,
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
