//! Linear interpolation and central-slice extraction.

use nalgebra::{Complex, Matrix3};

use super::store::ProjectorStore;
use crate::resolution::FourierGeom;
use crate::Real;

#[inline]
fn clampf(v: Real, lo: Real, hi: Real) -> Real {
    if v < lo {
        lo
    } else if v > hi {
        hi
    } else {
        v
    }
}

/// Bilinear sample of a 2D model at array coordinates derived from
/// frequency coordinates. `xp` is already non-negative (the caller has
/// folded Friedel mates); `yp` runs from `init_y` upward.
pub(super) fn sample_2d(store: &ProjectorStore, xp: Real, yp: Real) -> Complex<Real> {
    let dims = *store.dims();
    let fx = clampf(xp, 0.0, (dims.x - 1) as Real);
    let fy = clampf(yp - dims.init_y as Real, 0.0, (dims.y - 1) as Real);

    let x0 = fx.floor() as usize;
    let y0 = fy.floor() as usize;
    let x1 = (x0 + 1).min(dims.x - 1);
    let y1 = (y0 + 1).min(dims.y - 1);
    let dx = fx - x0 as Real;
    let dy = fy - y0 as Real;

    let row0 = store.at(y0 * dims.x + x0) * (1.0 - dx) + store.at(y0 * dims.x + x1) * dx;
    let row1 = store.at(y1 * dims.x + x0) * (1.0 - dx) + store.at(y1 * dims.x + x1) * dx;
    row0 * (1.0 - dy) + row1 * dy
}

/// Trilinear sample of a 3D model, same coordinate conventions as
/// [`sample_2d`] with `zp` running from `init_z` upward.
pub(super) fn sample_3d(store: &ProjectorStore, xp: Real, yp: Real, zp: Real) -> Complex<Real> {
    let dims = *store.dims();
    let fx = clampf(xp, 0.0, (dims.x - 1) as Real);
    let fy = clampf(yp - dims.init_y as Real, 0.0, (dims.y - 1) as Real);
    let fz = clampf(zp - dims.init_z as Real, 0.0, (dims.z - 1) as Real);

    let x0 = fx.floor() as usize;
    let y0 = fy.floor() as usize;
    let z0 = fz.floor() as usize;
    let x1 = (x0 + 1).min(dims.x - 1);
    let y1 = (y0 + 1).min(dims.y - 1);
    let z1 = (z0 + 1).min(dims.z - 1);
    let dx = fx - x0 as Real;
    let dy = fy - y0 as Real;
    let dz = fz - z0 as Real;

    let plane = dims.x * dims.y;
    let lerp_row = |z: usize, y: usize| -> Complex<Real> {
        let base = z * plane + y * dims.x;
        store.at(base + x0) * (1.0 - dx) + store.at(base + x1) * dx
    };
    let front = lerp_row(z0, y0) * (1.0 - dy) + lerp_row(z0, y1) * dy;
    let back = lerp_row(z1, y0) * (1.0 - dy) + lerp_row(z1, y1) * dy;
    front * (1.0 - dz) + back * dz
}

/// Extract the central slice of a model at orientation `rot` into `out`,
/// laid out as the half-plane transform described by `geom`.
///
/// Each pixel's (kx, ky) frequency is rotated into model space and scaled
/// by the padding factor. Negative model-space kx is folded through the
/// Friedel mate: all three coordinates are negated and the interpolated
/// value conjugated. Pixels outside the usable radius are zeroed.
pub(super) fn project_slice(
    store: &ProjectorStore,
    rot: &Matrix3<Real>,
    geom: &FourierGeom,
    out: &mut [Complex<Real>],
) {
    let dims = *store.dims();
    let max_r = dims.max_r.min(geom.size / 2);
    let max_r2 = (max_r * max_r) as i64;
    let pad = dims.padding_factor as Real;
    let is_3d = dims.z != 0;

    for y in 0..geom.ydim {
        let ky = geom.ky(y);
        for x in 0..geom.xdim {
            let kx = x as i32;
            let idx = y * geom.xdim + x;
            let r2 = (kx as i64) * (kx as i64) + (ky as i64) * (ky as i64);
            if r2 > max_r2 {
                out[idx] = Complex::new(0.0, 0.0);
                continue;
            }

            let kxr = kx as Real;
            let kyr = ky as Real;
            let mut xp = pad * (rot[(0, 0)] * kxr + rot[(0, 1)] * kyr);
            let mut yp = pad * (rot[(1, 0)] * kxr + rot[(1, 1)] * kyr);
            let mut zp = pad * (rot[(2, 0)] * kxr + rot[(2, 1)] * kyr);

            // Only half the transform is stored; reach the other half
            // through the Friedel mate.
            let conj = xp < 0.0;
            if conj {
                xp = -xp;
                yp = -yp;
                zp = -zp;
            }

            let v = if is_3d {
                sample_3d(store, xp, yp, zp)
            } else {
                sample_2d(store, xp, yp)
            };
            out[idx] = if conj { v.conj() } else { v };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::projector::store::ModelDims;
    use approx::assert_relative_eq;

    fn symmetric_2d_store(n: usize) -> ProjectorStore {
        // A Hermitian-consistent half-plane model: value depends only on
        // radius, real part only, so conjugation is exact.
        let half = (n / 2) as i32;
        let xdim = n / 2 + 1;
        let ydim = n + 1; // rows for ky = -half ..= half
        let mut store = ProjectorStore::new();
        store.configure(ModelDims {
            x: xdim,
            y: ydim,
            z: 0,
            init_y: -half,
            init_z: 0,
            max_r: n / 2,
            padding_factor: 1,
        });
        let mut re = vec![0.0 as Real; xdim * ydim];
        for iy in 0..ydim {
            let ky = iy as i32 - half;
            for ix in 0..xdim {
                let r2 = (ix * ix) as i32 + ky * ky;
                re[iy * xdim + ix] = 1.0 / (1.0 + r2 as Real);
            }
        }
        let im = vec![0.0 as Real; xdim * ydim];
        store.init_planes(&re, &im).unwrap();
        store
    }

    #[test]
    fn test_identity_slice_reproduces_model() {
        let n = 8;
        let store = symmetric_2d_store(n);
        let geom = FourierGeom::new(n);
        let mut out = vec![Complex::new(0.0, 0.0); geom.npix()];
        store.project_slice(&Matrix3::identity(), &geom, &mut out);

        // Inside the radius cutoff the slice matches the stored values
        // re-centered to the half-plane layout.
        for y in 0..geom.ydim {
            let ky = geom.ky(y);
            for x in 0..geom.xdim {
                let kx = x as i32;
                if kx * kx + ky * ky > ((n / 2) * (n / 2)) as i32 {
                    continue;
                }
                let expected = 1.0 / (1.0 + (kx * kx + ky * ky) as Real);
                assert_relative_eq!(out[y * geom.xdim + x].re, expected, epsilon = 1e-5);
            }
        }
    }

    #[test]
    fn test_pixels_beyond_radius_are_zero() {
        let n = 8;
        let store = symmetric_2d_store(n);
        let geom = FourierGeom::new(n);
        let mut out = vec![Complex::new(1.0, 1.0); geom.npix()];
        store.project_slice(&Matrix3::identity(), &geom, &mut out);

        // (4, 3): 16 + 9 = 25 > 16.
        let idx = 3 * geom.xdim + 4;
        assert_relative_eq!(out[idx].re, 0.0);
        assert_relative_eq!(out[idx].im, 0.0);
    }

    #[test]
    fn test_half_turn_slice_is_conjugate() {
        let n = 8;
        let store = symmetric_2d_store(n);
        let geom = FourierGeom::new(n);

        let mut fwd = vec![Complex::new(0.0, 0.0); geom.npix()];
        store.project_slice(&Matrix3::identity(), &geom, &mut fwd);

        // 180 degrees about z maps (kx, ky) to (-kx, -ky).
        let rot = Matrix3::new(
            -1.0, 0.0, 0.0, //
            0.0, -1.0, 0.0, //
            0.0, 0.0, 1.0,
        );
        let mut rev = vec![Complex::new(0.0, 0.0); geom.npix()];
        store.project_slice(&rot, &geom, &mut rev);

        for (a, b) in fwd.iter().zip(rev.iter()) {
            assert_relative_eq!(a.re, b.re, epsilon = 1e-5);
            assert_relative_eq!(a.im, -b.im, epsilon = 1e-5);
        }
    }
}
