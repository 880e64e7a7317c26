//! Error types for the jitter-solver library
//!
//! This module provides the main error and result types used throughout the
//! library. All errors use the `thiserror` crate for automatic trait
//! implementations.
//!
//! Failures inside residual evaluation never surface as errors: a projection
//! that misses the camera becomes a large fixed residual and the solve
//! continues. Everything else aborts with a single human-readable message.

use thiserror::Error;

/// Main result type used throughout the jitter-solver library
pub type JitterResult<T> = Result<T, JitterError>;

/// Main error type for the jitter-solver library
#[derive(Debug, Clone, Error)]
pub enum JitterError {
    /// Invalid or conflicting configuration options
    #[error("Configuration error: {0}")]
    Config(String),

    /// Degenerate interpolation sample range
    #[error("Interpolation error: {0}")]
    Interpolation(String),

    /// Ground-to-image projection failure
    #[error("Projection error: {0}")]
    Projection(String),

    /// Camera model errors (bad arrays, unsupported sensor kind)
    #[error("Camera model error: {0}")]
    Camera(String),

    /// Solver related errors
    #[error("Solver error: {0}")]
    Solver(String),

    /// Linear algebra errors (factorization failure, singular system)
    #[error("Linear algebra error: {0}")]
    LinearAlgebra(String),
}

impl JitterError {
    /// Shorthand for a degenerate sample-range error with the standard hint.
    pub fn degenerate_range() -> Self {
        JitterError::Interpolation(
            "Book-keeping error in interpolation. Likely image order is different \
             than camera order."
                .to_string(),
        )
    }
}
