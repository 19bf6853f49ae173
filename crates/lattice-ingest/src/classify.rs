//! Retryable vs terminal failure classification.

use crate::error::{FrameError, StoreError, StoreErrorKind};

/// Whether a failure is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Classification {
    /// Environmental: the same frame may succeed later.
    Retryable,
    /// The frame itself is at fault: retrying cannot help.
    Terminal,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Retryable => "retryable",
            Self::Terminal => "terminal",
        }
    }
}

impl std::str::FromStr for Classification {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "retryable" => Ok(Self::Retryable),
            "terminal" => Ok(Self::Terminal),
            _ => Err(()),
        }
    }
}

/// Classify a store failure by its kind.
///
/// Unrecognised failures count as retryable; the retry budget bounds them.
pub fn classify_store(error: &StoreError) -> Classification {
    match error.kind {
        StoreErrorKind::Connectivity
        | StoreErrorKind::Timeout
        | StoreErrorKind::ResourceExhausted
        | StoreErrorKind::Other => Classification::Retryable,
        StoreErrorKind::Constraint | StoreErrorKind::Schema | StoreErrorKind::Validation => {
            Classification::Terminal
        }
    }
}

/// Classify a frame failure.
pub fn classify(error: &FrameError) -> Classification {
    match error {
        FrameError::TransientStoreFailure(e) | FrameError::PartialIndexFailure { source: e, .. } => {
            classify_store(e)
        }
        FrameError::FilteredOut(_)
        | FrameError::ValidationFailure(_)
        | FrameError::PoisonFrame { .. } => Classification::Terminal,
    }
}
