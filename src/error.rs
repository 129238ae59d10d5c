//! Error types for caller-misuse conditions.
//!
//! These are the always-on precondition checks replacing the debug-only
//! asserts of older implementations: calling sequence errors are reported
//! as `Err`, never as silent state corruption. Device-resource failures
//! (allocation, kernel compilation, launch) are reported through `anyhow`
//! by the `gpu` module and are fatal to the current refinement pass.

use thiserror::Error;

/// Lifecycle and sizing errors for the model store.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProjectorError {
    /// Data initialization before dimensions were configured.
    #[error("model dimensions must be configured before data initialization")]
    NotConfigured,

    /// A second data initialization without an intervening `clear()`.
    #[error("model data already initialized; call clear() first")]
    AlreadyInitialized,

    /// Supplied plane length disagrees with the configured voxel count.
    #[error("plane has {got} elements but the configured model holds {expected}")]
    SizeMismatch { got: usize, expected: usize },
}

/// Shape and range errors in the statistics engine.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EngineError {
    /// A hypothesis index range exceeds the sampling enumeration.
    #[error("{what} range {min}..={max} exceeds sampling size {len}")]
    RangeOutOfBounds {
        what: &'static str,
        min: usize,
        max: usize,
        len: usize,
    },

    /// Weight matrix was allocated for a different hypothesis grid.
    #[error("weight matrix shaped for {expected} entries, sampling enumerates {got}")]
    WeightShapeMismatch { got: usize, expected: usize },

    /// Particle image does not match the expected full-size geometry.
    #[error("particle image has {got} Fourier samples, geometry expects {expected}")]
    ImageSizeMismatch { got: usize, expected: usize },

    /// An operation needing the unmasked image cache found none.
    #[error("shift cache was built without the unmasked variant")]
    MissingUnmaskedCache,
}
