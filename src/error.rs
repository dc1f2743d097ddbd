use thiserror::Error;

// ---------------------------------------------------------------------------
// Error taxonomy
// ---------------------------------------------------------------------------

/// Errors raised by the QC engine.
///
/// Only `ConfigInvalid` and `AggregationIncomplete` are fatal to a run.
/// `MalformedSpectrum` excludes a single sample and `PeakNotFound` is
/// folded into a boolean QC flag by the caller.
#[derive(Debug, Error)]
pub enum QcError {
    #[error("invalid SOP configuration: {0}")]
    ConfigInvalid(String),

    #[error("malformed spectrum '{sample_id}': {reason}")]
    MalformedSpectrum { sample_id: String, reason: String },

    #[error("no {multiplicity} found between {low:.3} and {high:.3} ppm")]
    PeakNotFound {
        multiplicity: String,
        low: f64,
        high: f64,
    },

    #[error("aggregation requires {expected} evaluated samples, received {received}")]
    AggregationIncomplete { expected: usize, received: usize },

    #[error("reading SOP: {0}")]
    Io(#[from] std::io::Error),

    #[error("building worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

impl QcError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        QcError::ConfigInvalid(msg.into())
    }

    pub(crate) fn malformed(sample_id: &str, reason: impl Into<String>) -> Self {
        QcError::MalformedSpectrum {
            sample_id: sample_id.to_string(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, QcError>;
