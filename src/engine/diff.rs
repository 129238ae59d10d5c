//! Squared-difference and cross-correlation scoring of hypotheses.

use nalgebra::Complex;
use rayon::prelude::*;
use tracing::trace;

use super::config::ExpectationConfig;
use super::shifts::ShiftCache;
use super::types::{CoarseSignificance, ParticleImage, SamplingHandle, WeightMatrix};
use crate::error::EngineError;
use crate::projector::ProjectorStore;
use crate::resolution::ResolutionMap;
use crate::Real;

/// Noise-weighted squared difference between a reference slice and a
/// shifted image, accumulated in double precision:
/// `Σ ½ |ref − img|² / σ²` plus half the particle's high-resolution power.
fn weighted_diff2(
    proj: &[Complex<Real>],
    shifted: &[Complex<Real>],
    cache: &ShiftCache,
    resol: &ResolutionMap,
    ctf_scale: Option<(&[Real], Real)>,
) -> f64 {
    let mut diff2 = 0.0f64;
    for n in 0..proj.len() {
        if resol.shell(n) < 0 {
            continue;
        }
        let mut r = proj[n];
        if let Some((fctf, scale)) = ctf_scale {
            r *= fctf[n] * scale;
        }
        let d = r - shifted[n];
        diff2 += 0.5
            * ((d.re as f64) * (d.re as f64) + (d.im as f64) * (d.im as f64))
            * cache.minvsigma2[n] as f64;
    }
    diff2 + cache.highres_xi2 / 2.0
}

/// Normalised cross-correlation score, negated so that smaller is better
/// like the squared difference.
fn cc_diff2(
    proj: &[Complex<Real>],
    shifted: &[Complex<Real>],
    cache: &ShiftCache,
    resol: &ResolutionMap,
    ctf_scale: Option<(&[Real], Real)>,
) -> f64 {
    let mut dot = 0.0f64;
    let mut suma2 = 0.0f64;
    for n in 0..proj.len() {
        if resol.shell(n) < 0 {
            continue;
        }
        let mut r = proj[n];
        if let Some((fctf, scale)) = ctf_scale {
            r *= fctf[n] * scale;
        }
        dot += (r.re as f64) * (shifted[n].re as f64) + (r.im as f64) * (shifted[n].im as f64);
        suma2 += (r.re as f64) * (r.re as f64) + (r.im as f64) * (r.im as f64);
    }
    let denom = suma2.sqrt() * cache.sqrt_xi2;
    if denom > 0.0 {
        -dot / denom
    } else {
        0.0
    }
}

/// The weight matrix must have one entry per hypothesis of the grid.
pub(super) fn check_grid(
    nr_classes: usize,
    sampling: &SamplingHandle,
    weights: &WeightMatrix,
) -> Result<(), EngineError> {
    let expected = weights.nr_classes
        * weights.nr_orient
        * weights.nr_trans
        * weights.nr_over_rot
        * weights.nr_over_trans;
    let got = nr_classes
        * sampling.nr_orientations()
        * sampling.nr_translations()
        * sampling.nr_over_rot
        * sampling.nr_over_trans;
    if nr_classes != weights.nr_classes
        || sampling.nr_orientations() != weights.nr_orient
        || sampling.nr_translations() != weights.nr_trans
        || sampling.nr_over_rot != weights.nr_over_rot
        || sampling.nr_over_trans != weights.nr_over_trans
    {
        return Err(EngineError::WeightShapeMismatch { got, expected });
    }
    Ok(())
}

pub(super) fn check_shapes(
    projectors: &[ProjectorStore],
    cache: &ShiftCache,
    sampling: &SamplingHandle,
    weights: &WeightMatrix,
) -> Result<(), EngineError> {
    check_grid(projectors.len(), sampling, weights)?;
    if cache.nr_shifted() != sampling.nr_shifted() {
        return Err(EngineError::RangeOutOfBounds {
            what: "shift cache",
            min: 0,
            max: cache.nr_shifted().saturating_sub(1),
            len: sampling.nr_shifted(),
        });
    }
    Ok(())
}

/// Score every live hypothesis of one particle into `weights`, returning
/// the smallest score found.
///
/// Each reference slice is projected once per (class, orientation,
/// oversampled rotation) and reused across all translations. With a
/// coarse-pass `significance` mask, orientations with no surviving
/// translation are skipped outright and pruned translations are left
/// unevaluated; their matrix entries keep the infinite sentinel.
/// Orientations are scored in parallel.
pub fn squared_differences(
    projectors: &[ProjectorStore],
    particle: &ParticleImage,
    cache: &ShiftCache,
    sampling: &SamplingHandle,
    resol: &ResolutionMap,
    config: &ExpectationConfig,
    significance: Option<&CoarseSignificance>,
    weights: &mut WeightMatrix,
) -> Result<f64, EngineError> {
    check_shapes(projectors, cache, sampling, weights)?;
    let geom = *resol.geom();
    let cc = config.cross_correlation_pass();
    let scale = if config.do_scale_correction {
        particle.scale
    } else {
        1.0
    };
    let ctf_scale: Option<(&[Real], Real)> = if config.apply_ctf_to_reference() {
        Some((&cache.fctf, scale))
    } else if config.do_scale_correction {
        Some((&[], scale)) // placeholder replaced below
    } else {
        None
    };
    // Scale without CTF still needs a per-sample pass; fold it through a
    // unit CTF.
    let unit_ctf: Vec<Real>;
    let ctf_scale = match ctf_scale {
        Some((c, s)) if c.is_empty() => {
            unit_ctf = vec![1.0; geom.npix()];
            Some((unit_ctf.as_slice(), s))
        }
        other => other,
    };

    let mut min_diff2 = f64::INFINITY;
    for (ic, projector) in projectors.iter().enumerate() {
        let scored: Vec<(usize, f64)> = sampling
            .orientations
            .par_iter()
            .enumerate()
            .filter(|(iorient, _)| {
                significance.map_or(true, |sig| sig.any_translation(ic, *iorient))
            })
            .flat_map_iter(|(iorient, orient)| {
                let mut out = Vec::new();
                let mut proj = vec![Complex::new(0.0 as Real, 0.0); geom.npix()];
                for (iover_rot, rot) in orient.matrices.iter().enumerate() {
                    projector.project_slice(rot, &geom, &mut proj);
                    for (itrans, trans) in sampling.translations.iter().enumerate() {
                        if let Some(sig) = significance {
                            if !sig.is_significant(ic, iorient, itrans) {
                                continue;
                            }
                        }
                        for iover_trans in 0..trans.offsets.len() {
                            let ishift = itrans * sampling.nr_over_trans + iover_trans;
                            let shifted = &cache.shifted[ishift];
                            let d = if cc {
                                cc_diff2(&proj, shifted, cache, resol, ctf_scale)
                            } else {
                                weighted_diff2(&proj, shifted, cache, resol, ctf_scale)
                            };
                            out.push((
                                weights.index(ic, iorient, iover_rot, itrans, iover_trans),
                                d,
                            ));
                        }
                    }
                }
                out
            })
            .collect();

        for (idx, d) in scored {
            weights.set(idx, d);
            if d < min_diff2 {
                min_diff2 = d;
            }
        }
    }

    trace!(min_diff2, cc, "scored hypotheses");
    Ok(min_diff2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::shifts::precalculate_shifted_images;
    use crate::tables::TrigTables;
    use crate::test_utils::{angular_test_model, no_shift, psi_sampling, synthetic_particle};
    use approx::assert_relative_eq;

    struct Setup {
        projectors: Vec<ProjectorStore>,
        particle: ParticleImage,
        cache: ShiftCache,
        sampling: SamplingHandle,
        resol: ResolutionMap,
        config: ExpectationConfig,
    }

    fn setup(nr_psi: usize, config: ExpectationConfig) -> Setup {
        let size = 16;
        let store = angular_test_model(size);
        let resol = ResolutionMap::build(size, size / 2);
        let particle = synthetic_particle(&store, 0.0, &resol);
        let sampling = psi_sampling(nr_psi, no_shift());
        let tables = TrigTables::default();
        let cache =
            precalculate_shifted_images(&particle, &sampling, &resol, &tables, &config, false)
                .unwrap();
        Setup {
            projectors: vec![store],
            particle,
            cache,
            sampling,
            resol,
            config,
        }
    }

    fn score(s: &Setup, significance: Option<&CoarseSignificance>) -> (WeightMatrix, f64) {
        let mut w = WeightMatrix::new(1, s.sampling.nr_orientations(), 1, 1, 1);
        let min = squared_differences(
            &s.projectors,
            &s.particle,
            &s.cache,
            &s.sampling,
            &s.resol,
            &s.config,
            significance,
            &mut w,
        )
        .unwrap();
        (w, min)
    }

    #[test]
    fn test_matching_orientation_scores_zero() {
        let s = setup(4, ExpectationConfig::default());
        let (w, min) = score(&s, None);
        // Slice 0 reproduces the particle exactly.
        assert_relative_eq!(w.get(w.index(0, 0, 0, 0, 0)), 0.0, epsilon = 1e-6);
        assert_relative_eq!(min, 0.0, epsilon = 1e-6);
        // Other rotations see a different slice.
        assert!(w.get(w.index(0, 1, 0, 0, 0)) > 1e-3);
    }

    #[test]
    fn test_cropped_power_enters_score() {
        let store = angular_test_model(16);
        let full = ResolutionMap::build(16, 8);
        // Shell limit 3 keeps the scored samples inside the projection
        // radius, so the matching slice leaves no residual.
        let coarse = ResolutionMap::build(8, 3);
        let particle = synthetic_particle(&store, 0.0, &full);
        let sampling = psi_sampling(1, no_shift());
        let config = ExpectationConfig::default();
        let cache = precalculate_shifted_images(
            &particle,
            &sampling,
            &coarse,
            &TrigTables::default(),
            &config,
            false,
        )
        .unwrap();
        assert!(cache.highres_xi2 > 0.0);

        let mut w = WeightMatrix::new(1, 1, 1, 1, 1);
        let min = squared_differences(
            std::slice::from_ref(&store),
            &particle,
            &cache,
            &sampling,
            &coarse,
            &config,
            None,
            &mut w,
        )
        .unwrap();
        // Half the power the crop discarded, nothing else.
        assert_relative_eq!(min, cache.highres_xi2 / 2.0, epsilon = 1e-5);
    }

    #[test]
    fn test_cross_correlation_prefers_matching_orientation() {
        let s = setup(8, ExpectationConfig {
            do_always_cc: true,
            ..Default::default()
        });
        let (w, min) = score(&s, None);
        let at_match = w.get(w.index(0, 0, 0, 0, 0));
        assert_relative_eq!(at_match, min, epsilon = 1e-12);
        // Perfect correlation: -dot / (|ref| |img|) = -1.
        assert_relative_eq!(at_match, -1.0, epsilon = 1e-4);
        for iorient in 1..8 {
            assert!(w.get(w.index(0, iorient, 0, 0, 0)) > at_match);
        }
    }

    #[test]
    fn test_cross_correlation_grid_fills_every_entry() {
        use crate::engine::TranslationSamples;
        use nalgebra::Vector2;

        let size = 16;
        let store = angular_test_model(size);
        let resol = ResolutionMap::build(size, size / 2);
        let particle = synthetic_particle(&store, 0.0, &resol);
        let translations = (0..4)
            .map(|itrans| TranslationSamples {
                itrans,
                offsets: vec![Vector2::new(itrans as f64, 0.0)],
            })
            .collect();
        let sampling = psi_sampling(4, translations);
        let config = ExpectationConfig {
            do_always_cc: true,
            ..Default::default()
        };
        let cache =
            precalculate_shifted_images(&particle, &sampling, &resol, &TrigTables::default(), &config, false)
                .unwrap();
        let projectors = vec![store];

        let mut w = WeightMatrix::new(1, 4, 4, 1, 1);
        let min = squared_differences(
            &projectors, &particle, &cache, &sampling, &resol, &config, None, &mut w,
        )
        .unwrap();

        for idx in 0..w.len() {
            assert!(w.get(idx).is_finite());
        }
        // The band marks exactly the entries within the threshold of the best.
        let threshold = 0.05;
        let sig = CoarseSignificance::from_scores(&w, threshold).unwrap();
        for iorient in 0..4 {
            for itrans in 0..4 {
                let d = w.get(w.index(0, iorient, 0, itrans, 0));
                assert_eq!(sig.is_significant(0, iorient, itrans), d <= min + threshold);
            }
        }
        assert!(sig.is_significant(0, 0, 0));
    }

    #[test]
    fn test_pruned_hypotheses_stay_unevaluated() {
        let s = setup(4, ExpectationConfig::default());
        let (coarse, min) = score(&s, None);
        // A tight band keeps only the exact match alive.
        let sig = CoarseSignificance::from_scores(&coarse, 1e-3).unwrap();
        assert_eq!(sig.nr_significant(), 1);

        let (fine, fine_min) = score(&s, Some(&sig));
        assert_relative_eq!(fine_min, min, epsilon = 1e-6);
        assert!(fine.get(fine.index(0, 0, 0, 0, 0)).is_finite());
        for iorient in 1..4 {
            assert!(fine.get(fine.index(0, iorient, 0, 0, 0)).is_infinite());
        }
    }

    #[test]
    fn test_ctf_attenuates_reference() {
        let mut s = setup(1, ExpectationConfig::default());
        for c in &mut s.particle.fctf {
            *c = 0.5;
        }
        let tables = TrigTables::default();
        s.cache = precalculate_shifted_images(
            &s.particle, &s.sampling, &s.resol, &tables, &s.config, false,
        )
        .unwrap();
        // Reference halves while the image stays: residual is half the
        // reference, so diff2 = Σ ½ |ref/2|² / σ².
        let (_, min) = score(&s, None);
        let mut expected = 0.0f64;
        for n in 0..s.resol.geom().npix() {
            if s.resol.shell(n) < 0 {
                continue;
            }
            let v = s.particle.fimg[n];
            expected +=
                0.5 * 0.25 * ((v.re as f64) * (v.re as f64) + (v.im as f64) * (v.im as f64));
        }
        assert_relative_eq!(min, expected, epsilon = 1e-4, max_relative = 1e-4);
    }

    #[test]
    fn test_scale_correction_applies_group_scale() {
        let mut cfg = ExpectationConfig::default();
        cfg.do_ctf_correction = false;
        cfg.do_scale_correction = true;
        let mut s = setup(1, cfg);
        s.particle.scale = 1.0;
        let (_, exact) = score(&s, None);
        assert_relative_eq!(exact, 0.0, epsilon = 1e-6);

        s.particle.scale = 0.5;
        let (_, scaled) = score(&s, None);
        assert!(scaled > 0.0);
    }

    #[test]
    fn test_noisy_particle_still_prefers_true_orientation() {
        use rand::{rngs::StdRng, SeedableRng};
        use rand_distr::{Distribution, Normal};

        let mut s = setup(8, ExpectationConfig::default());
        let mut rng = StdRng::seed_from_u64(7);
        let normal = Normal::new(0.0f64, 0.02).unwrap();
        for v in &mut s.particle.fimg {
            v.re += normal.sample(&mut rng) as Real;
            v.im += normal.sample(&mut rng) as Real;
        }
        let tables = TrigTables::default();
        s.cache = precalculate_shifted_images(
            &s.particle, &s.sampling, &s.resol, &tables, &s.config, false,
        )
        .unwrap();

        let (w, min) = score(&s, None);
        let at_true = w.get(w.index(0, 0, 0, 0, 0));
        assert_relative_eq!(at_true, min, epsilon = 1e-12);
        for iorient in 1..8 {
            assert!(w.get(w.index(0, iorient, 0, 0, 0)) > at_true);
        }
    }

    #[test]
    fn test_weight_shape_mismatch_rejected() {
        let s = setup(4, ExpectationConfig::default());
        let mut w = WeightMatrix::new(1, 3, 1, 1, 1);
        let err = squared_differences(
            &s.projectors,
            &s.particle,
            &s.cache,
            &s.sampling,
            &s.resol,
            &s.config,
            None,
            &mut w,
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::WeightShapeMismatch { .. }));
    }
}
