//! Likelihood and statistics engine.
//!
//! One expectation pass over a particle runs in four stages, each a
//! function over plain data so coarse and fine passes compose freely:
//!
//! 1. [`precalculate_shifted_images`] builds the per-particle
//!    [`ShiftCache`]: phase-shifted images per translation hypothesis plus
//!    the inverse noise map and image norms.
//! 2. [`squared_differences`] scores every live (class, orientation,
//!    translation) hypothesis into a [`WeightMatrix`], projecting each
//!    reference slice once and reusing it across translations. A fine pass
//!    feeds the coarse pass's [`CoarseSignificance`] mask back in to skip
//!    pruned hypotheses.
//! 3. [`convert_to_weights`] maps scores to posterior weights in place and
//!    picks the significant-weight cutoff.
//! 4. [`store_weighted_sums`] folds the surviving hypotheses into a
//!    [`WeightedSums`] accumulator for the maximisation step.
//!
//! Workers run particles concurrently against shared read-only model
//! stores, each holding a private accumulator; accumulators combine with
//! [`WeightedSums::merge`].

mod config;
mod diff;
mod shifts;
mod types;
mod weights;

pub use config::ExpectationConfig;
pub use diff::squared_differences;
pub use shifts::{precalculate_shifted_images, ShiftCache};
pub use types::{
    CoarseSignificance, OrientationSamples, ParticleImage, ParticleStats, SamplingHandle,
    TranslationSamples, WeightMatrix,
};
pub use weights::{convert_to_weights, store_weighted_sums, ModelPriors, WeightedSums};
