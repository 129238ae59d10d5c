//! Accelerator-resident expectation core for cryo-EM refinement.
//!
//! This library holds the compute-heavy inner loop of a maximum-likelihood
//! refinement: comparing Fourier-space reference models against particle
//! images over grids of orientation, translation, and class hypotheses,
//! and folding the resulting posterior weights back into model-update
//! accumulators.
//!
//! # Architecture
//!
//! A pass over one particle runs in phases:
//! - Phase 1: model stores are configured and initialized once per class
//!   per iteration ([`projector`])
//! - Phase 2: shifted-image caches are precomputed per particle
//!   ([`engine::precalculate_shifted_images`])
//! - Phase 3: hypotheses are scored coarse-to-fine with significance
//!   pruning in between ([`engine::squared_differences`])
//! - Phase 4: scores become posterior weights and weighted sums
//!   ([`engine::convert_to_weights`], [`engine::store_weighted_sums`])
//!
//! The `gpu` feature adds a CUDA scoring path that mirrors the software
//! arithmetic; everything else runs on the host, with rayon across
//! translations and orientations.
//!
//! # Usage
//!
//! ```ignore
//! use cryoem_cuda::engine::{self, ExpectationConfig, WeightMatrix, CoarseSignificance};
//!
//! let cache = engine::precalculate_shifted_images(
//!     &particle, &sampling, &resol, &tables, &config, true)?;
//! let mut scores = WeightMatrix::new(nr_classes, nr_orient, nr_trans, 1, 1);
//! engine::squared_differences(
//!     &models, &particle, &cache, &sampling, &resol, &config, None, &mut scores)?;
//! let sig = CoarseSignificance::from_scores(&scores, config.significance_threshold)?;
//! // ... rebuild sampling at fine oversampling, rescore with Some(&sig),
//! // then convert_to_weights and store_weighted_sums.
//! ```

pub mod engine;
pub mod error;
#[cfg(feature = "gpu")]
pub mod gpu;
pub mod projector;
pub mod resolution;
pub mod tables;
pub mod test_utils;
pub mod timing;

/// Scalar type of model planes and image caches. Accumulation is always
/// done in `f64` regardless.
#[cfg(not(feature = "double-precision"))]
pub type Real = f32;
#[cfg(feature = "double-precision")]
pub type Real = f64;

pub use engine::{
    convert_to_weights, precalculate_shifted_images, squared_differences, store_weighted_sums,
    CoarseSignificance, ExpectationConfig, ModelPriors, ParticleImage, ParticleStats,
    SamplingHandle, ShiftCache, WeightMatrix, WeightedSums,
};
pub use error::{EngineError, ProjectorError};
pub use projector::{ModelDims, ProjectorStore};
pub use resolution::{FourierGeom, ResolutionMap};
pub use tables::TrigTables;

#[cfg(feature = "gpu")]
pub use gpu::{is_available as is_cuda_available, DeviceModel, GpuEngine};
