//! Error type for the patching core
//!
//! Every failure in the core is fatal: errors propagate to the caller and a
//! sweep that fails at any coordinate never yields a score matrix.

use crate::hooks::HookSite;
use crate::patching::HeadCoord;

/// Errors raised by tokenization, forward passes and the patching sweep
#[derive(Debug, thiserror::Error)]
pub enum PatchError {
    /// A sentence failed to tokenize, or a target word is not a single token
    #[error("tokenization error: {0}")]
    Tokenization(String),

    /// An override tensor does not match the activation at its site
    #[error("shape mismatch at {site}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        site: HookSite,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// The underlying forward pass failed
    #[error("model execution error: {0}")]
    ModelExecution(#[from] candle_core::Error),

    /// A failure while patching one head; aborts the whole sweep
    #[error("patching failed at {coord}: {source}")]
    AtCoordinate {
        coord: HeadCoord,
        #[source]
        source: Box<PatchError>,
    },

    /// The caller cancelled the sweep before every head was visited
    #[error("sweep cancelled after {completed}/{total} heads")]
    Cancelled { completed: usize, total: usize },

    /// Invalid configuration (targets, percentiles, pair files)
    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Heatmap rendering failed
    #[error("render error: {0}")]
    Render(String),
}

impl PatchError {
    /// Attach the head coordinate being processed when this error occurred
    pub fn at(self, coord: HeadCoord) -> Self {
        match self {
            // Already located (or not tied to a single head)
            PatchError::AtCoordinate { .. } | PatchError::Cancelled { .. } => self,
            other => PatchError::AtCoordinate {
                coord,
                source: Box::new(other),
            },
        }
    }

    /// The head coordinate this error is tied to, if any
    pub fn coordinate(&self) -> Option<HeadCoord> {
        match self {
            PatchError::AtCoordinate { coord, .. } => Some(*coord),
            _ => None,
        }
    }
}

/// Result alias for the patching core
pub type Result<T> = std::result::Result<T, PatchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_at_wraps_once() {
        let coord = HeadCoord::new(3, 7);
        let err = PatchError::Tokenization("bad".into()).at(coord);
        assert_eq!(err.coordinate(), Some(coord));

        // Re-wrapping keeps the innermost coordinate
        let err = err.at(HeadCoord::new(0, 0));
        assert_eq!(err.coordinate(), Some(coord));
    }

    #[test]
    fn test_message_reports_coordinate() {
        let err = PatchError::ShapeMismatch {
            site: HookSite::AttnZ(2),
            expected: vec![1, 5, 1, 64],
            actual: vec![1, 4, 1, 64],
        }
        .at(HeadCoord::new(2, 9));
        let msg = err.to_string();
        assert!(msg.contains("layer 2, head 9"), "{msg}");
        assert!(msg.contains("blocks.2.attn.hook_z"), "{msg}");
    }

    #[test]
    fn test_cancelled_is_not_wrapped() {
        let err = PatchError::Cancelled {
            completed: 4,
            total: 144,
        }
        .at(HeadCoord::new(0, 4));
        assert!(err.coordinate().is_none());
    }
}
