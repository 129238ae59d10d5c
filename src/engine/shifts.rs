//! Per-particle shift cache: phase-shifted images, inverse noise map,
//! and the norms feeding cross-correlation scoring.

use nalgebra::Complex;
use rayon::prelude::*;

use super::config::ExpectationConfig;
use super::types::{ParticleImage, SamplingHandle};
use crate::error::EngineError;
use crate::resolution::{window, FourierGeom, ResolutionMap};
use crate::tables::TrigTables;
use crate::Real;

/// Everything about one particle that every hypothesis shares: the
/// phase-shifted image per (translation, oversampled offset), the inverse
/// noise-variance map, and the image norm terms.
///
/// Built once per particle per pass; scoring loops only read it.
#[derive(Debug, Clone)]
pub struct ShiftCache {
    /// `[itrans * nr_over_trans + iover_trans][sample]`.
    pub shifted: Vec<Vec<Complex<Real>>>,
    /// Unmasked counterparts, present only when the pass accumulates
    /// scale or model sums.
    pub shifted_nomask: Option<Vec<Vec<Complex<Real>>>>,
    /// CTF sliced to the pass geometry.
    pub fctf: Vec<Real>,
    /// `1 / (sigma2_fudge * sigma2_noise[shell])` per sample; zero for
    /// excluded samples.
    pub minvsigma2: Vec<Real>,
    /// `sqrt(Σ |fimg|²)` over included samples.
    pub sqrt_xi2: f64,
    /// Power the pass excludes: everything of the full-size image beyond
    /// the crop and the shell range. Enters every squared-difference
    /// score as a constant.
    pub highres_xi2: f64,
}

impl ShiftCache {
    pub fn nr_shifted(&self) -> usize {
        self.shifted.len()
    }

    pub fn nomask(&self, ishift: usize) -> Result<&[Complex<Real>], EngineError> {
        self.shifted_nomask
            .as_deref()
            .map(|v| v[ishift].as_slice())
            .ok_or(EngineError::MissingUnmaskedCache)
    }
}

/// Apply the phase ramp for a shift of `(sx, sy)` pixels to `src`.
///
/// Sample `(kx, ky)` picks up `exp(-2πi (kx sx + ky sy) / size)`. In the
/// on-the-fly mode the trig factors come from the lookup tables; a
/// precomputed set is built once, so it affords exact trig.
fn apply_phase_shift(
    src: &[Complex<Real>],
    resol: &ResolutionMap,
    tables: &TrigTables,
    use_tables: bool,
    sx: f64,
    sy: f64,
) -> Vec<Complex<Real>> {
    let geom = resol.geom();
    let scale = -std::f64::consts::TAU / geom.size as f64;
    let mut out = vec![Complex::new(0.0, 0.0); src.len()];
    for y in 0..geom.ydim {
        let ky = geom.ky(y) as f64;
        for x in 0..geom.xdim {
            let n = geom.index(x, y);
            if resol.shell(n) < 0 {
                continue;
            }
            let phase = scale * (x as f64 * sx + ky * sy);
            let f = if use_tables {
                Complex::new(tables.cos(phase), tables.sin(phase))
            } else {
                let (s, c) = phase.sin_cos();
                Complex::new(c as Real, s as Real)
            };
            out[n] = src[n] * f;
        }
    }
    out
}

/// Build the shift cache for one particle.
///
/// Translations are the sampling grid's offsets composed with the
/// particle's rounded old offset, matching how extracted particles were
/// re-centered. The per-translation work is independent and runs in
/// parallel.
pub fn precalculate_shifted_images(
    particle: &ParticleImage,
    sampling: &SamplingHandle,
    resol: &ResolutionMap,
    tables: &TrigTables,
    config: &ExpectationConfig,
    with_nomask: bool,
) -> Result<ShiftCache, EngineError> {
    let geom = resol.geom();
    if particle.sigma2_noise.len() < resol.nr_shells() {
        return Err(EngineError::RangeOutOfBounds {
            what: "noise spectrum",
            min: 0,
            max: resol.nr_shells() - 1,
            len: particle.sigma2_noise.len(),
        });
    }

    // Particles arrive at full size; crop down to the pass geometry.
    let windowed: Option<(Vec<Complex<Real>>, Vec<Complex<Real>>, Vec<Real>)> =
        if particle.fimg.len() == geom.npix() {
            None
        } else {
            let from = FourierGeom::from_npix(particle.fimg.len())
                .filter(|f| f.size >= geom.size)
                .ok_or(EngineError::ImageSizeMismatch {
                    got: particle.fimg.len(),
                    expected: geom.npix(),
                })?;
            Some((
                window(&particle.fimg, &from, geom),
                window(&particle.fimg_nomask, &from, geom),
                window(&particle.fctf, &from, geom),
            ))
        };
    let (fimg, fimg_nomask, fctf): (&[Complex<Real>], &[Complex<Real>], &[Real]) = match &windowed {
        Some((i, n, c)) => (i, n, c),
        None => (&particle.fimg, &particle.fimg_nomask, &particle.fctf),
    };

    let offsets: Vec<(f64, f64)> = sampling
        .translations
        .iter()
        .flat_map(|t| {
            t.offsets.iter().map(|o| {
                (
                    o.x + particle.old_offset.x.round(),
                    o.y + particle.old_offset.y.round(),
                )
            })
        })
        .collect();

    let use_tables = config.do_shifts_onthefly;
    let shifted: Vec<Vec<Complex<Real>>> = offsets
        .par_iter()
        .map(|&(sx, sy)| apply_phase_shift(fimg, resol, tables, use_tables, sx, sy))
        .collect();
    let shifted_nomask = if with_nomask {
        Some(
            offsets
                .par_iter()
                .map(|&(sx, sy)| apply_phase_shift(fimg_nomask, resol, tables, use_tables, sx, sy))
                .collect(),
        )
    } else {
        None
    };

    let mut minvsigma2 = vec![0.0 as Real; geom.npix()];
    let mut xi2 = 0.0f64;
    for n in 0..geom.npix() {
        let shell = resol.shell(n);
        if shell < 0 {
            continue;
        }
        let s2 = particle.sigma2_noise[shell as usize] as f64 * config.sigma2_fudge;
        if s2 > 0.0 {
            minvsigma2[n] = (1.0 / s2) as Real;
        }
        let v = fimg[n];
        xi2 += (v.re as f64) * (v.re as f64) + (v.im as f64) * (v.im as f64);
    }
    let total: f64 = particle
        .fimg
        .iter()
        .map(|v| (v.re as f64) * (v.re as f64) + (v.im as f64) * (v.im as f64))
        .sum();

    Ok(ShiftCache {
        shifted,
        shifted_nomask,
        fctf: fctf.to_vec(),
        minvsigma2,
        sqrt_xi2: xi2.sqrt(),
        highres_xi2: total - xi2,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::types::TranslationSamples;
    use approx::assert_relative_eq;
    use nalgebra::Vector2;

    fn test_particle(resol: &ResolutionMap) -> ParticleImage {
        let npix = resol.geom().npix();
        let fimg: Vec<Complex<Real>> = (0..npix)
            .map(|n| Complex::new((n % 7) as Real - 3.0, (n % 5) as Real - 2.0))
            .collect();
        ParticleImage {
            fimg_nomask: fimg.clone(),
            fimg,
            fctf: vec![1.0; npix],
            sigma2_noise: vec![2.0; resol.nr_shells()],
            group: 0,
            scale: 1.0,
            old_offset: Vector2::new(0.0, 0.0),
            prior_offset: Vector2::new(0.0, 0.0),
        }
    }

    fn grid(offsets: Vec<Vector2<f64>>) -> SamplingHandle {
        SamplingHandle::identity_orientation(
            offsets
                .into_iter()
                .enumerate()
                .map(|(itrans, o)| TranslationSamples {
                    itrans,
                    offsets: vec![o],
                })
                .collect(),
        )
    }

    #[test]
    fn test_zero_shift_is_identity() {
        let resol = ResolutionMap::build(8, 4);
        let tables = TrigTables::default();
        let particle = test_particle(&resol);
        let cfg = ExpectationConfig::default();
        let sampling = grid(vec![Vector2::new(0.0, 0.0)]);

        let cache =
            precalculate_shifted_images(&particle, &sampling, &resol, &tables, &cfg, false)
                .unwrap();
        for n in 0..resol.geom().npix() {
            if resol.shell(n) < 0 {
                continue;
            }
            assert_relative_eq!(cache.shifted[0][n].re, particle.fimg[n].re, epsilon = 1e-4);
            assert_relative_eq!(cache.shifted[0][n].im, particle.fimg[n].im, epsilon = 1e-4);
        }
    }

    #[test]
    fn test_shift_preserves_modulus() {
        let resol = ResolutionMap::build(8, 4);
        let tables = TrigTables::default();
        let particle = test_particle(&resol);
        let cfg = ExpectationConfig::default();
        let sampling = grid(vec![Vector2::new(1.0, -2.0)]);

        let cache =
            precalculate_shifted_images(&particle, &sampling, &resol, &tables, &cfg, false)
                .unwrap();
        for n in 0..resol.geom().npix() {
            if resol.shell(n) < 0 {
                continue;
            }
            assert_relative_eq!(
                cache.shifted[0][n].norm_sqr(),
                particle.fimg[n].norm_sqr(),
                epsilon = 1e-3
            );
        }
    }

    #[test]
    fn test_opposite_shifts_are_conjugate_ramps() {
        let resol = ResolutionMap::build(8, 4);
        let tables = TrigTables::default();
        let mut particle = test_particle(&resol);
        // Real-valued spectrum makes the ramp the only complex factor.
        for v in &mut particle.fimg {
            v.im = 0.0;
        }
        let cfg = ExpectationConfig::default();
        let sampling = grid(vec![Vector2::new(2.0, 1.0), Vector2::new(-2.0, -1.0)]);

        let cache =
            precalculate_shifted_images(&particle, &sampling, &resol, &tables, &cfg, false)
                .unwrap();
        for n in 0..resol.geom().npix() {
            if resol.shell(n) < 0 {
                continue;
            }
            assert_relative_eq!(
                cache.shifted[0][n].re,
                cache.shifted[1][n].re,
                epsilon = 1e-3
            );
            assert_relative_eq!(
                cache.shifted[0][n].im,
                -cache.shifted[1][n].im,
                epsilon = 1e-3
            );
        }
    }

    #[test]
    fn test_tabulated_and_exact_shifts_agree() {
        let resol = ResolutionMap::build(8, 4);
        let tables = TrigTables::default();
        let particle = test_particle(&resol);
        let sampling = grid(vec![Vector2::new(1.5, -0.5)]);

        let on_the_fly = ExpectationConfig::default();
        let precomputed = ExpectationConfig {
            do_shifts_onthefly: false,
            ..Default::default()
        };
        let a = precalculate_shifted_images(
            &particle, &sampling, &resol, &tables, &on_the_fly, false,
        )
        .unwrap();
        let b = precalculate_shifted_images(
            &particle, &sampling, &resol, &tables, &precomputed, false,
        )
        .unwrap();
        for n in 0..resol.geom().npix() {
            assert_relative_eq!(a.shifted[0][n].re, b.shifted[0][n].re, epsilon = 5e-3);
            assert_relative_eq!(a.shifted[0][n].im, b.shifted[0][n].im, epsilon = 5e-3);
        }
    }

    #[test]
    fn test_minvsigma2_uses_fudge() {
        let resol = ResolutionMap::build(8, 4);
        let tables = TrigTables::default();
        let particle = test_particle(&resol);
        let cfg = ExpectationConfig {
            sigma2_fudge: 4.0,
            ..Default::default()
        };
        let sampling = grid(vec![Vector2::new(0.0, 0.0)]);

        let cache =
            precalculate_shifted_images(&particle, &sampling, &resol, &tables, &cfg, false)
                .unwrap();
        // sigma2 = 2.0, fudge 4.0: 1 / 8.
        let origin = resol.geom().index(1, 0);
        assert_relative_eq!(cache.minvsigma2[origin], 0.125);
        // Excluded samples map to zero.
        let far = resol.geom().index(resol.geom().xdim - 1, resol.geom().ydim / 2);
        assert_eq!(resol.shell(far), -1);
        assert_relative_eq!(cache.minvsigma2[far], 0.0);
    }

    #[test]
    fn test_full_size_particle_is_windowed() {
        let full = ResolutionMap::build(16, 8);
        let coarse = ResolutionMap::build(8, 4);
        let tables = TrigTables::default();
        let particle = test_particle(&full);
        let cfg = ExpectationConfig::default();
        let sampling = grid(vec![Vector2::new(0.0, 0.0)]);

        let cache =
            precalculate_shifted_images(&particle, &sampling, &coarse, &tables, &cfg, false)
                .unwrap();
        assert_eq!(cache.shifted[0].len(), coarse.geom().npix());
        assert_eq!(cache.fctf.len(), coarse.geom().npix());

        // Low frequencies survive the crop at their signed positions.
        let g_full = *full.geom();
        let g_coarse = *coarse.geom();
        let src = particle.fimg[g_full.index(1, 2)];
        let dst = cache.shifted[0][g_coarse.index(1, 2)];
        assert_relative_eq!(dst.re, src.re, epsilon = 1e-5);
        // Negative ky row 14 of the full layout is row 6 of the coarse one.
        let src_neg = particle.fimg[g_full.index(2, 14)];
        let dst_neg = cache.shifted[0][g_coarse.index(2, 6)];
        assert_relative_eq!(dst_neg.re, src_neg.re, epsilon = 1e-5);
    }

    #[test]
    fn test_excluded_power_is_recorded() {
        let full = ResolutionMap::build(16, 8);
        let coarse = ResolutionMap::build(8, 4);
        let tables = TrigTables::default();
        let particle = test_particle(&full);
        let cfg = ExpectationConfig::default();
        let sampling = grid(vec![Vector2::new(0.0, 0.0)]);

        let cache =
            precalculate_shifted_images(&particle, &sampling, &coarse, &tables, &cfg, false)
                .unwrap();
        // Kept power + excluded power add back to the full image's.
        let total: f64 = particle
            .fimg
            .iter()
            .map(|v| (v.re as f64) * (v.re as f64) + (v.im as f64) * (v.im as f64))
            .sum();
        assert!(cache.highres_xi2 > 0.0);
        assert_relative_eq!(
            cache.sqrt_xi2 * cache.sqrt_xi2 + cache.highres_xi2,
            total,
            epsilon = 1e-6 * total
        );
    }

    #[test]
    fn test_wrong_image_size_rejected() {
        let resol = ResolutionMap::build(8, 4);
        let tables = TrigTables::default();
        let mut particle = test_particle(&resol);
        particle.fimg.truncate(5);
        let cfg = ExpectationConfig::default();
        let sampling = grid(vec![Vector2::new(0.0, 0.0)]);

        let err =
            precalculate_shifted_images(&particle, &sampling, &resol, &tables, &cfg, false)
                .unwrap_err();
        assert!(matches!(err, EngineError::ImageSizeMismatch { got: 5, .. }));
    }

    #[test]
    fn test_nomask_cache_presence() {
        let resol = ResolutionMap::build(8, 4);
        let tables = TrigTables::default();
        let particle = test_particle(&resol);
        let cfg = ExpectationConfig::default();
        let sampling = grid(vec![Vector2::new(0.0, 0.0)]);

        let without =
            precalculate_shifted_images(&particle, &sampling, &resol, &tables, &cfg, false)
                .unwrap();
        assert!(matches!(
            without.nomask(0),
            Err(EngineError::MissingUnmaskedCache)
        ));

        let with =
            precalculate_shifted_images(&particle, &sampling, &resol, &tables, &cfg, true)
                .unwrap();
        assert!(with.nomask(0).is_ok());
    }
}
