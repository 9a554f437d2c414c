//! Error types shared by the estimators, objectives and the rollout engine.

use thiserror::Error;

/// Errors raised by the optimization core and the rollout engine.
///
/// Budget overruns during rollout are not errors: they end a request in the
/// `Exceeded` state and travel with the batch as a flag.
#[derive(Debug, Error)]
pub enum RemoraError {
    /// A named policy or numeric setting is not valid.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The requested mode exists in the literature but has no implementation.
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// Two tensors that must share a shape do not.
    #[error("Shape mismatch for {what}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Which tensor was checked.
        what: &'static str,
        /// Expected shape.
        expected: Vec<usize>,
        /// Actual shape.
        actual: Vec<usize>,
    },

    /// An image or region cannot be used as a model input.
    #[error("Invalid image: {0}")]
    InvalidImage(String),

    /// A masked statistic needs more live elements than the mask provides.
    #[error("Degenerate mask: {0}")]
    DegenerateMask(String),

    /// An external collaborator (engine, scorer, classifier, tool) failed.
    #[error("Collaborator `{component}` failed: {source}")]
    Collaborator {
        /// The collaborator that failed.
        component: &'static str,
        /// Underlying failure.
        #[source]
        source: anyhow::Error,
    },

    /// A configured pattern failed to compile.
    #[error("Pattern error: {0}")]
    Pattern(#[from] regex::Error),
}

impl RemoraError {
    /// Wrap a collaborator failure with the component name.
    pub fn collaborator(component: &'static str, source: anyhow::Error) -> Self {
        Self::Collaborator { component, source }
    }

    /// Shorthand for a 2-D shape mismatch.
    pub(crate) fn shape(what: &'static str, expected: (usize, usize), actual: (usize, usize)) -> Self {
        Self::ShapeMismatch {
            what,
            expected: vec![expected.0, expected.1],
            actual: vec![actual.0, actual.1],
        }
    }
}

/// Result type for remora operations.
pub type Result<T> = std::result::Result<T, RemoraError>;
