//! Score-to-weight conversion and weighted-sum accumulation.

use nalgebra::{Complex, Vector2};
use tracing::trace;

use super::config::ExpectationConfig;
use super::shifts::ShiftCache;
use super::types::{ParticleImage, ParticleStats, SamplingHandle, WeightMatrix};
use crate::error::EngineError;
use crate::projector::ProjectorStore;
use crate::resolution::ResolutionMap;
use crate::Real;

/// Model-level priors entering the posterior weights.
#[derive(Debug, Clone)]
pub struct ModelPriors {
    /// Per-class prior probability.
    pub pdf_class: Vec<f64>,
    /// Per-class, per-direction prior probability.
    pub pdf_direction: Vec<Vec<f64>>,
    /// Variance of the Gaussian translation prior, in pixels squared.
    pub sigma2_offset: f64,
}

impl ModelPriors {
    /// Flat priors over `nr_classes` classes and `nr_dir` directions with
    /// translation variance `sigma2_offset`.
    pub fn flat(nr_classes: usize, nr_dir: usize, sigma2_offset: f64) -> Self {
        Self {
            pdf_class: vec![1.0; nr_classes],
            pdf_direction: vec![vec![1.0; nr_dir]; nr_classes],
            sigma2_offset,
        }
    }

    /// Gaussian offset prior density at `offset` around `prior`. Below a
    /// hundredth of a pixel of variance the prior collapses to a delta.
    pub fn pdf_offset(&self, offset: Vector2<f64>, prior: Vector2<f64>) -> f64 {
        let d2 = (offset - prior).norm_squared();
        if self.sigma2_offset < 1e-4 {
            if d2 < 1e-8 {
                1.0
            } else {
                0.0
            }
        } else {
            (-d2 / (2.0 * self.sigma2_offset)).exp()
                / (2.0 * std::f64::consts::PI * self.sigma2_offset)
        }
    }
}

/// Convert scores in `weights` to unnormalised posterior weights in place
/// and gather the particle's weight statistics.
///
/// Squared-difference scores map through `prior · exp(min − score)`, so the
/// best hypothesis gets weight `prior` and the infinite sentinel maps to
/// exactly zero. Cross-correlation passes are winner-takes-all: the single
/// best hypothesis gets weight one.
///
/// The significant-weight cutoff is the smallest weight inside the top
/// `adaptive_fraction` of total mass.
pub fn convert_to_weights(
    weights: &mut WeightMatrix,
    sampling: &SamplingHandle,
    particle: &ParticleImage,
    config: &ExpectationConfig,
    priors: Option<&ModelPriors>,
) -> Result<ParticleStats, EngineError> {
    super::diff::check_grid(weights.nr_classes, sampling, weights)?;
    let min_diff2 = weights.min();
    let mut stats = ParticleStats {
        min_diff2,
        ..Default::default()
    };

    if config.cross_correlation_pass() {
        let mut best = None;
        for (i, &d) in weights.data().iter().enumerate() {
            if d == min_diff2 && best.is_none() {
                best = Some(i);
            }
        }
        for (i, w) in weights.data_mut().iter_mut().enumerate() {
            *w = if Some(i) == best { 1.0 } else { 0.0 };
        }
        stats.sum_weight = 1.0;
        stats.max_weight = 1.0;
        stats.significant_weight = 1.0;
        stats.nr_significant = 1;
        return Ok(stats);
    }

    for ic in 0..weights.nr_classes {
        for (iorient, orient) in sampling.orientations.iter().enumerate() {
            let pdf_orient = priors.map_or(1.0, |p| {
                p.pdf_class[ic] * p.pdf_direction[ic][orient.idir]
            });
            for iover_rot in 0..weights.nr_over_rot {
                for (itrans, trans) in sampling.translations.iter().enumerate() {
                    for (iover_trans, offset) in trans.offsets.iter().enumerate() {
                        let idx = weights.index(ic, iorient, iover_rot, itrans, iover_trans);
                        let d = weights.get(idx);
                        let w = if d.is_finite() {
                            let pdf_offset = priors.map_or(1.0, |p| {
                                p.pdf_offset(
                                    particle.old_offset + offset,
                                    particle.prior_offset,
                                )
                            });
                            pdf_orient * pdf_offset * (min_diff2 - d).exp()
                        } else {
                            0.0
                        };
                        weights.set(idx, w);
                        stats.sum_weight += w;
                        if w > stats.max_weight {
                            stats.max_weight = w;
                        }
                    }
                }
            }
        }
    }

    // Cutoff carrying adaptive_fraction of the mass, from the top down.
    let mut sorted: Vec<f64> = weights.data().iter().copied().filter(|&w| w > 0.0).collect();
    sorted.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
    let target = config.adaptive_fraction * stats.sum_weight;
    let mut acc = 0.0;
    for &w in &sorted {
        acc += w;
        stats.significant_weight = w;
        stats.nr_significant += 1;
        if acc >= target {
            break;
        }
    }

    trace!(
        sum_weight = stats.sum_weight,
        nr_significant = stats.nr_significant,
        "converted scores to weights"
    );
    Ok(stats)
}

/// Everything a particle contributes to the iteration's model update.
///
/// One instance per worker; instances from parallel workers combine with
/// [`WeightedSums::merge`] before the maximisation step reads them.
#[derive(Debug, Clone)]
pub struct WeightedSums {
    /// Weighted squared residual per shell.
    pub sigma2_noise: Vec<f64>,
    /// Scale-correction numerator per shell: reference dot unmasked image.
    pub scale_xa: Vec<f64>,
    /// Scale-correction denominator per shell: reference power.
    pub scale_aa: Vec<f64>,
    /// Weighted class occupancy.
    pub pdf_class: Vec<f64>,
    /// Weighted direction occupancy per class.
    pub pdf_direction: Vec<Vec<f64>>,
    /// Weighted translation per class, for the offset prior update.
    pub prior_offset_class: Vec<Vector2<f64>>,
    /// Weighted squared distance to the translation prior.
    pub sigma2_offset: f64,
    /// CTF-weighted unmasked image sum per class, the model-update
    /// numerator.
    pub class_data: Vec<Vec<Complex<f64>>>,
    /// CTF² weight sum per class, the model-update denominator.
    pub class_weight: Vec<Vec<f64>>,
    /// Total normalised weight folded in (one per particle).
    pub sum_weight: f64,
}

impl WeightedSums {
    pub fn new(nr_classes: usize, nr_dir: usize, nr_shells: usize, npix: usize) -> Self {
        Self {
            sigma2_noise: vec![0.0; nr_shells],
            scale_xa: vec![0.0; nr_shells],
            scale_aa: vec![0.0; nr_shells],
            pdf_class: vec![0.0; nr_classes],
            pdf_direction: vec![vec![0.0; nr_dir]; nr_classes],
            prior_offset_class: vec![Vector2::new(0.0, 0.0); nr_classes],
            sigma2_offset: 0.0,
            class_data: vec![vec![Complex::new(0.0, 0.0); npix]; nr_classes],
            class_weight: vec![vec![0.0; npix]; nr_classes],
            sum_weight: 0.0,
        }
    }

    /// Fold another accumulator into this one.
    pub fn merge(&mut self, other: &WeightedSums) {
        for (a, b) in self.sigma2_noise.iter_mut().zip(&other.sigma2_noise) {
            *a += b;
        }
        for (a, b) in self.scale_xa.iter_mut().zip(&other.scale_xa) {
            *a += b;
        }
        for (a, b) in self.scale_aa.iter_mut().zip(&other.scale_aa) {
            *a += b;
        }
        for (a, b) in self.pdf_class.iter_mut().zip(&other.pdf_class) {
            *a += b;
        }
        for (a, b) in self.pdf_direction.iter_mut().zip(&other.pdf_direction) {
            for (x, y) in a.iter_mut().zip(b) {
                *x += y;
            }
        }
        for (a, b) in self
            .prior_offset_class
            .iter_mut()
            .zip(&other.prior_offset_class)
        {
            *a += b;
        }
        self.sigma2_offset += other.sigma2_offset;
        for (a, b) in self.class_data.iter_mut().zip(&other.class_data) {
            for (x, y) in a.iter_mut().zip(b) {
                *x += y;
            }
        }
        for (a, b) in self.class_weight.iter_mut().zip(&other.class_weight) {
            for (x, y) in a.iter_mut().zip(b) {
                *x += y;
            }
        }
        self.sum_weight += other.sum_weight;
    }
}

/// The accumulator must span every class, direction, shell, and sample
/// the pass touches.
fn check_sums(
    sums: &WeightedSums,
    nr_classes: usize,
    sampling: &SamplingHandle,
    resol: &ResolutionMap,
) -> Result<(), EngineError> {
    if sums.class_data.len() != nr_classes
        || sums.class_weight.len() != nr_classes
        || sums.pdf_class.len() != nr_classes
        || sums.pdf_direction.len() != nr_classes
        || sums.prior_offset_class.len() != nr_classes
    {
        return Err(EngineError::WeightShapeMismatch {
            got: sums.class_data.len(),
            expected: nr_classes,
        });
    }
    let npix = resol.geom().npix();
    for (data, weight) in sums.class_data.iter().zip(&sums.class_weight) {
        if data.len() != npix || weight.len() != npix {
            return Err(EngineError::ImageSizeMismatch {
                got: data.len(),
                expected: npix,
            });
        }
    }
    if sums.sigma2_noise.len() < resol.nr_shells()
        || sums.scale_xa.len() < resol.nr_shells()
        || sums.scale_aa.len() < resol.nr_shells()
    {
        return Err(EngineError::RangeOutOfBounds {
            what: "shell accumulator",
            min: 0,
            max: resol.nr_shells() - 1,
            len: sums.sigma2_noise.len(),
        });
    }
    if sums.pdf_direction.iter().any(|d| d.len() < sampling.nr_dir) {
        return Err(EngineError::RangeOutOfBounds {
            what: "direction accumulator",
            min: 0,
            max: sampling.nr_dir - 1,
            len: sums.pdf_direction.iter().map(|d| d.len()).min().unwrap_or(0),
        });
    }
    Ok(())
}

/// Accumulate one particle's significant hypotheses into `sums`.
///
/// Weights are normalised by the particle's total on the fly, so each
/// particle contributes unit mass. Per significant hypothesis the
/// reference slice is re-projected (once per orientation, shared across
/// translations) and compared against the shifted images: the masked
/// residual feeds the noise and norm sums, the unmasked image feeds the
/// scale sums and the class model numerator.
#[allow(clippy::too_many_arguments)]
pub fn store_weighted_sums(
    projectors: &[ProjectorStore],
    particle: &ParticleImage,
    cache: &ShiftCache,
    sampling: &SamplingHandle,
    resol: &ResolutionMap,
    config: &ExpectationConfig,
    weights: &WeightMatrix,
    stats: &mut ParticleStats,
    sums: &mut WeightedSums,
) -> Result<(), EngineError> {
    super::diff::check_shapes(projectors, cache, sampling, weights)?;
    check_sums(sums, projectors.len(), sampling, resol)?;
    if stats.sum_weight <= 0.0 {
        return Ok(());
    }
    let geom = *resol.geom();
    let scale = if config.do_scale_correction {
        particle.scale as f64
    } else {
        1.0
    };
    let apply_ctf = config.apply_ctf_to_reference();

    let mut proj = vec![Complex::new(0.0 as Real, 0.0); geom.npix()];
    for (ic, projector) in projectors.iter().enumerate() {
        for (iorient, orient) in sampling.orientations.iter().enumerate() {
            for (iover_rot, rot) in orient.matrices.iter().enumerate() {
                let mut projected = false;
                for (itrans, trans) in sampling.translations.iter().enumerate() {
                    for (iover_trans, offset) in trans.offsets.iter().enumerate() {
                        let idx = weights.index(ic, iorient, iover_rot, itrans, iover_trans);
                        let w = weights.get(idx);
                        if w < stats.significant_weight || w <= 0.0 {
                            continue;
                        }
                        let wn = w / stats.sum_weight;
                        if !projected {
                            projector.project_slice(rot, &geom, &mut proj);
                            projected = true;
                        }
                        let ishift = itrans * sampling.nr_over_trans + iover_trans;
                        let shifted = &cache.shifted[ishift];
                        let nomask = cache.nomask(ishift)?;

                        for n in 0..geom.npix() {
                            let shell = resol.shell(n);
                            if shell < 0 {
                                continue;
                            }
                            let shell = shell as usize;
                            let ctf = if apply_ctf { cache.fctf[n] as f64 } else { 1.0 };
                            let r_re = proj[n].re as f64 * ctf * scale;
                            let r_im = proj[n].im as f64 * ctf * scale;

                            let d_re = r_re - shifted[n].re as f64;
                            let d_im = r_im - shifted[n].im as f64;
                            let wdiff2 = wn * (d_re * d_re + d_im * d_im);
                            sums.sigma2_noise[shell] += wdiff2;
                            if config.do_norm_correction {
                                stats.wsum_norm_correction += wdiff2;
                            }

                            if config.do_scale_correction {
                                sums.scale_xa[shell] += wn
                                    * (r_re * nomask[n].re as f64 + r_im * nomask[n].im as f64);
                                sums.scale_aa[shell] += wn * (r_re * r_re + r_im * r_im);
                            }

                            sums.class_data[ic][n] += Complex::new(
                                wn * ctf * nomask[n].re as f64,
                                wn * ctf * nomask[n].im as f64,
                            );
                            sums.class_weight[ic][n] += wn * ctf * ctf;
                        }

                        let actual = particle.old_offset + offset;
                        sums.prior_offset_class[ic] += wn * actual;
                        sums.sigma2_offset += wn * (actual - particle.prior_offset).norm_squared();
                        sums.pdf_class[ic] += wn;
                        sums.pdf_direction[ic][orient.idir] += wn;
                        sums.sum_weight += wn;
                    }
                }
            }
        }
    }
    Ok(())
}
