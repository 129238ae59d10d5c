//! Synthetic model and sampling generators shared by unit tests.

use nalgebra::{Complex, Matrix3, Vector2};

use crate::engine::{OrientationSamples, ParticleImage, SamplingHandle, TranslationSamples};
use crate::projector::{ModelDims, ProjectorStore};
use crate::resolution::ResolutionMap;
use crate::Real;

/// In-plane rotation by `psi` radians, as a slice-extraction matrix.
pub fn psi_matrix(psi: Real) -> Matrix3<Real> {
    let (s, c) = psi.sin_cos();
    Matrix3::new(
        c, -s, 0.0, //
        s, c, 0.0, //
        0.0, 0.0, 1.0,
    )
}

/// A 2D Fourier model of logical size `size` whose amplitude falls off
/// radially and whose phase varies with direction, so rotated slices are
/// distinguishable from each other.
pub fn angular_test_model(size: usize) -> ProjectorStore {
    let half = (size / 2) as i32;
    let xdim = size / 2 + 1;
    let ydim = size + 1;
    let mut store = ProjectorStore::new();
    store.configure(ModelDims {
        x: xdim,
        y: ydim,
        z: 0,
        init_y: -half,
        init_z: 0,
        max_r: size / 2,
        padding_factor: 1,
    });
    let mut re = vec![0.0 as Real; xdim * ydim];
    let mut im = vec![0.0 as Real; xdim * ydim];
    for iy in 0..ydim {
        let ky = iy as i32 - half;
        for ix in 0..xdim {
            let n = iy * xdim + ix;
            let r2 = (ix * ix) as i32 + ky * ky;
            re[n] = 1.0 / (1.0 + r2 as Real);
            im[n] = 0.05 * ix as Real - 0.03 * ky as Real;
        }
    }
    store
        .init_planes(&re, &im)
        .unwrap_or_else(|e| panic!("model init: {e}"));
    store
}

/// `nr_psi` evenly spaced in-plane rotations, one matrix each.
pub fn psi_sampling(nr_psi: usize, translations: Vec<TranslationSamples>) -> SamplingHandle {
    let nr_over_trans = translations.first().map_or(1, |t| t.offsets.len());
    let orientations = (0..nr_psi)
        .map(|ipsi| OrientationSamples {
            idir: 0,
            ipsi,
            matrices: vec![psi_matrix(
                (ipsi as Real) * std::f64::consts::TAU as Real / nr_psi as Real,
            )],
        })
        .collect();
    SamplingHandle {
        nr_dir: 1,
        nr_psi,
        nr_over_rot: 1,
        nr_over_trans,
        orientations,
        translations,
    }
}

/// Single-offset translations covering `[-extent, extent]` in steps of
/// `step` pixels along both axes.
pub fn shift_grid(extent: f64, step: f64) -> Vec<TranslationSamples> {
    let n = (extent / step).round() as i64;
    let mut out = Vec::new();
    let mut itrans = 0;
    for iy in -n..=n {
        for ix in -n..=n {
            out.push(TranslationSamples {
                itrans,
                offsets: vec![Vector2::new(ix as f64 * step, iy as f64 * step)],
            });
            itrans += 1;
        }
    }
    out
}

/// The zero translation only.
pub fn no_shift() -> Vec<TranslationSamples> {
    vec![TranslationSamples {
        itrans: 0,
        offsets: vec![Vector2::new(0.0, 0.0)],
    }]
}

/// A noise-free particle: the model's own slice at `psi`, flat CTF, unit
/// noise spectrum.
pub fn synthetic_particle(store: &ProjectorStore, psi: Real, resol: &ResolutionMap) -> ParticleImage {
    let geom = resol.geom();
    let mut fimg = vec![Complex::new(0.0 as Real, 0.0); geom.npix()];
    store.project_slice(&psi_matrix(psi), geom, &mut fimg);
    ParticleImage {
        fimg_nomask: fimg.clone(),
        fimg,
        fctf: vec![1.0; geom.npix()],
        sigma2_noise: vec![1.0; resol.nr_shells()],
        group: 0,
        scale: 1.0,
        old_offset: Vector2::new(0.0, 0.0),
        prior_offset: Vector2::new(0.0, 0.0),
    }
}
