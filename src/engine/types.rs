//! Sampling handles, particle data, and the hypothesis weight matrix.

use nalgebra::{Complex, Matrix3, Vector2};

use super::config::ExpectationConfig;
use crate::error::EngineError;
use crate::Real;

/// One orientation of the sampling grid: a (direction, in-plane) pair and
/// the rotation matrices of its oversampled neighbourhood. The coarse pass
/// carries exactly one matrix per orientation.
#[derive(Debug, Clone)]
pub struct OrientationSamples {
    pub idir: usize,
    pub ipsi: usize,
    pub matrices: Vec<Matrix3<Real>>,
}

/// One translation of the sampling grid with its oversampled offsets,
/// in pixels.
#[derive(Debug, Clone)]
pub struct TranslationSamples {
    pub itrans: usize,
    pub offsets: Vec<Vector2<f64>>,
}

/// The orientational and translational grid evaluated in one pass.
#[derive(Debug, Clone)]
pub struct SamplingHandle {
    pub nr_dir: usize,
    pub nr_psi: usize,
    pub nr_over_rot: usize,
    pub nr_over_trans: usize,
    pub orientations: Vec<OrientationSamples>,
    pub translations: Vec<TranslationSamples>,
}

impl SamplingHandle {
    pub fn nr_orientations(&self) -> usize {
        self.orientations.len()
    }

    pub fn nr_translations(&self) -> usize {
        self.translations.len()
    }

    /// Total oversampled translations, flattened.
    pub fn nr_shifted(&self) -> usize {
        self.nr_translations() * self.nr_over_trans
    }

    /// The grid one pass actually searches, derived from the full
    /// sampling and the alignment flags.
    ///
    /// Skipping alignment leaves the identity orientation over the zero
    /// shift only; skipping rotation keeps the translations but collapses
    /// the psi loop. The coarse pass drops the oversampled entries, the
    /// fine pass keeps at most `2^order` rotations and `4^order` offsets
    /// per grid point, where `order` is the adaptive oversampling order.
    pub fn for_pass(&self, config: &ExpectationConfig, fine: bool) -> Self {
        if config.do_skip_align {
            return Self::identity_orientation(vec![TranslationSamples {
                itrans: 0,
                offsets: vec![Vector2::new(0.0, 0.0)],
            }]);
        }
        let order = if fine { config.adaptive_oversampling } else { 0 };
        let max_rot = 1usize << order;
        let max_trans = 1usize << (2 * order);
        let translations: Vec<TranslationSamples> = self
            .translations
            .iter()
            .map(|t| TranslationSamples {
                itrans: t.itrans,
                offsets: t.offsets.iter().take(max_trans).copied().collect(),
            })
            .collect();
        if config.do_skip_rotate {
            return Self::identity_orientation(translations);
        }
        Self {
            nr_dir: self.nr_dir,
            nr_psi: self.nr_psi,
            nr_over_rot: self.nr_over_rot.min(max_rot),
            nr_over_trans: self.nr_over_trans.min(max_trans),
            orientations: self
                .orientations
                .iter()
                .map(|o| OrientationSamples {
                    idir: o.idir,
                    ipsi: o.ipsi,
                    matrices: o.matrices.iter().take(max_rot).copied().collect(),
                })
                .collect(),
            translations,
        }
    }

    /// A degenerate grid holding only the identity orientation, used when
    /// alignment is skipped.
    pub fn identity_orientation(translations: Vec<TranslationSamples>) -> Self {
        let nr_over_trans = translations.first().map_or(1, |t| t.offsets.len());
        Self {
            nr_dir: 1,
            nr_psi: 1,
            nr_over_rot: 1,
            nr_over_trans,
            orientations: vec![OrientationSamples {
                idir: 0,
                ipsi: 0,
                matrices: vec![Matrix3::identity()],
            }],
            translations,
        }
    }
}

/// One particle's Fourier data and per-particle statistics for a pass.
///
/// `fimg` is the masked transform used for scoring; `fimg_nomask` the
/// unmasked one consumed by the scale and model accumulators. `sigma2_noise`
/// is the particle's group noise spectrum, one value per shell.
#[derive(Debug, Clone)]
pub struct ParticleImage {
    pub fimg: Vec<Complex<Real>>,
    pub fimg_nomask: Vec<Complex<Real>>,
    pub fctf: Vec<Real>,
    pub sigma2_noise: Vec<Real>,
    pub group: usize,
    pub scale: Real,
    pub old_offset: Vector2<f64>,
    pub prior_offset: Vector2<f64>,
}

/// Flat store of per-hypothesis scores or weights over
/// (class, orientation, oversampled rotation, translation, oversampled
/// translation).
///
/// Entries start at `f64::INFINITY`: an entry never evaluated scores as
/// infinitely poor, so `exp(min - d)` maps it to exactly zero weight
/// without any separate mask bookkeeping.
#[derive(Debug, Clone)]
pub struct WeightMatrix {
    pub nr_classes: usize,
    pub nr_orient: usize,
    pub nr_trans: usize,
    pub nr_over_rot: usize,
    pub nr_over_trans: usize,
    data: Vec<f64>,
}

impl WeightMatrix {
    pub fn new(
        nr_classes: usize,
        nr_orient: usize,
        nr_trans: usize,
        nr_over_rot: usize,
        nr_over_trans: usize,
    ) -> Self {
        let len = nr_classes * nr_orient * nr_trans * nr_over_rot * nr_over_trans;
        Self {
            nr_classes,
            nr_orient,
            nr_trans,
            nr_over_rot,
            nr_over_trans,
            data: vec![f64::INFINITY; len],
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn index(
        &self,
        ic: usize,
        iorient: usize,
        iover_rot: usize,
        itrans: usize,
        iover_trans: usize,
    ) -> usize {
        (((ic * self.nr_orient + iorient) * self.nr_over_rot + iover_rot) * self.nr_trans
            + itrans)
            * self.nr_over_trans
            + iover_trans
    }

    #[inline]
    pub fn get(&self, idx: usize) -> f64 {
        self.data[idx]
    }

    #[inline]
    pub fn set(&mut self, idx: usize, v: f64) {
        self.data[idx] = v;
    }

    /// Smallest finite entry, or `f64::INFINITY` when nothing was scored.
    pub fn min(&self) -> f64 {
        self.data.iter().copied().fold(f64::INFINITY, f64::min)
    }

    pub fn data(&self) -> &[f64] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f64] {
        &mut self.data
    }
}

/// Coarse-pass survivors per (class, orientation, translation).
///
/// The fine pass consults this before touching a hypothesis; everything
/// not marked here was pruned.
#[derive(Debug, Clone)]
pub struct CoarseSignificance {
    nr_classes: usize,
    nr_orient: usize,
    nr_trans: usize,
    mask: Vec<bool>,
}

impl CoarseSignificance {
    /// Derive the survivor mask from coarse scores: an entry survives when
    /// its score lies within `threshold` of the global minimum.
    pub fn from_scores(scores: &WeightMatrix, threshold: f64) -> Result<Self, EngineError> {
        if scores.nr_over_rot != 1 || scores.nr_over_trans != 1 {
            return Err(EngineError::WeightShapeMismatch {
                got: scores.len(),
                expected: scores.nr_classes * scores.nr_orient * scores.nr_trans,
            });
        }
        let min = scores.min();
        let mask = scores.data().iter().map(|&d| d <= min + threshold).collect();
        Ok(Self {
            nr_classes: scores.nr_classes,
            nr_orient: scores.nr_orient,
            nr_trans: scores.nr_trans,
            mask,
        })
    }

    /// A mask passing everything, for passes without a coarse stage.
    pub fn all_significant(nr_classes: usize, nr_orient: usize, nr_trans: usize) -> Self {
        Self {
            nr_classes,
            nr_orient,
            nr_trans,
            mask: vec![true; nr_classes * nr_orient * nr_trans],
        }
    }

    #[inline]
    pub fn is_significant(&self, ic: usize, iorient: usize, itrans: usize) -> bool {
        self.mask[(ic * self.nr_orient + iorient) * self.nr_trans + itrans]
    }

    /// Whether any translation survived for this class and orientation.
    /// Orientations failing this are skipped wholesale in the fine pass.
    pub fn any_translation(&self, ic: usize, iorient: usize) -> bool {
        let base = (ic * self.nr_orient + iorient) * self.nr_trans;
        self.mask[base..base + self.nr_trans].iter().any(|&s| s)
    }

    pub fn nr_significant(&self) -> usize {
        self.mask.iter().filter(|&&s| s).count()
    }
}

/// Per-particle outcome of weight conversion and accumulation.
#[derive(Debug, Clone, Copy, Default)]
pub struct ParticleStats {
    pub min_diff2: f64,
    pub sum_weight: f64,
    pub max_weight: f64,
    /// Weight cutoff carrying `adaptive_fraction` of the total mass.
    pub significant_weight: f64,
    pub nr_significant: usize,
    /// Weighted squared residual used to update the norm correction.
    pub wsum_norm_correction: f64,
}
