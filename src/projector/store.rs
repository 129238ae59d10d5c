//! Model store lifecycle: configure, initialize, clear.

use std::sync::Arc;

use nalgebra::{Complex, Matrix3};

use super::interp;
use crate::error::ProjectorError;
use crate::resolution::FourierGeom;
use crate::Real;

/// Dimensions and indexing offsets of a Fourier model volume.
///
/// `init_y`/`init_z` give the (negative) frequency of the first row/section,
/// so array row `iy` holds frequency `iy + init_y`. `max_r` is the usable
/// radius in image-frequency voxels; `padding_factor` relates model-space
/// sampling to particle-space sampling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ModelDims {
    pub x: usize,
    pub y: usize,
    /// 0 for a 2D model.
    pub z: usize,
    pub init_y: i32,
    pub init_z: i32,
    pub max_r: usize,
    pub padding_factor: usize,
}

impl ModelDims {
    /// Total voxel count (X·Y for 2D, X·Y·Z for 3D).
    pub fn voxels(&self) -> usize {
        if self.z == 0 {
            self.x * self.y
        } else {
            self.x * self.y * self.z
        }
    }

    fn normalized(mut self) -> Self {
        // A single section is a 2D model.
        if self.z == 1 {
            self.z = 0;
        }
        self
    }
}

/// Backing storage for the two model planes.
///
/// The variant itself is the ownership tag: `Shared` data came from the
/// caller through [`ProjectorStore::init_interleaved`] and is merely
/// released (not freed) on clear.
#[derive(Debug, Clone)]
enum ModelData {
    Empty,
    Owned { real: Vec<Real>, imag: Vec<Real> },
    Shared(Arc<[Real]>),
}

/// Fourier model store for one reference class.
///
/// Lifecycle: created empty, dimensions fixed by [`configure`], populated
/// by one of the `init_*` calls, released by [`clear`] or reconfiguration.
/// All sequencing violations are reported as [`ProjectorError`]s.
///
/// [`configure`]: ProjectorStore::configure
/// [`clear`]: ProjectorStore::clear
#[derive(Debug, Clone)]
pub struct ProjectorStore {
    dims: ModelDims,
    data: ModelData,
}

impl Default for ProjectorStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ProjectorStore {
    pub fn new() -> Self {
        Self {
            dims: ModelDims::default(),
            data: ModelData::Empty,
        }
    }

    /// Fix the model dimensions, releasing prior storage.
    ///
    /// Identical reconfiguration is a no-op and returns `false`; otherwise
    /// any held data is cleared, the new dimensions are stored, and `true`
    /// is returned.
    pub fn configure(&mut self, dims: ModelDims) -> bool {
        let dims = dims.normalized();
        if dims == self.dims {
            return false;
        }
        self.clear();
        self.dims = dims;
        true
    }

    /// Copy full real and imaginary planes into the store.
    pub fn init_planes(&mut self, real: &[Real], imag: &[Real]) -> Result<(), ProjectorError> {
        self.check_ready()?;
        let expected = self.dims.voxels();
        for plane in [real, imag] {
            if plane.len() != expected {
                return Err(ProjectorError::SizeMismatch {
                    got: plane.len(),
                    expected,
                });
            }
        }
        self.data = ModelData::Owned {
            real: real.to_vec(),
            imag: imag.to_vec(),
        };
        Ok(())
    }

    /// Record a pre-packed interleaved (re, im) buffer without copying.
    ///
    /// The buffer stays owned by the caller; `clear()` drops the store's
    /// reference only.
    pub fn init_interleaved(&mut self, data: Arc<[Real]>) -> Result<(), ProjectorError> {
        self.check_ready()?;
        let expected = 2 * self.dims.voxels();
        if data.len() != expected {
            return Err(ProjectorError::SizeMismatch {
                got: data.len(),
                expected,
            });
        }
        self.data = ModelData::Shared(data);
        Ok(())
    }

    /// De-interleave complex samples into owned planes.
    ///
    /// O(voxel count) extra copy; runs once per class per iteration, never
    /// per particle.
    pub fn init_complex(&mut self, data: &[Complex<Real>]) -> Result<(), ProjectorError> {
        self.check_ready()?;
        let expected = self.dims.voxels();
        if data.len() != expected {
            return Err(ProjectorError::SizeMismatch {
                got: data.len(),
                expected,
            });
        }
        let real: Vec<Real> = data.iter().map(|c| c.re).collect();
        let imag: Vec<Real> = data.iter().map(|c| c.im).collect();
        self.init_planes(&real, &imag)
    }

    fn check_ready(&self) -> Result<(), ProjectorError> {
        if self.dims.voxels() == 0 {
            return Err(ProjectorError::NotConfigured);
        }
        if !matches!(self.data, ModelData::Empty) {
            return Err(ProjectorError::AlreadyInitialized);
        }
        Ok(())
    }

    /// Reset configuration and release storage. Safe to call repeatedly.
    pub fn clear(&mut self) {
        self.dims = ModelDims::default();
        self.data = ModelData::Empty;
    }

    pub fn dims(&self) -> &ModelDims {
        &self.dims
    }

    pub fn is_initialized(&self) -> bool {
        !matches!(self.data, ModelData::Empty)
    }

    /// Voxel value at a flat index, whichever storage backs the planes.
    #[inline]
    pub(crate) fn at(&self, idx: usize) -> Complex<Real> {
        match &self.data {
            ModelData::Owned { real, imag } => Complex::new(real[idx], imag[idx]),
            ModelData::Shared(data) => Complex::new(data[2 * idx], data[2 * idx + 1]),
            ModelData::Empty => Complex::new(0.0, 0.0),
        }
    }

    /// Owned or de-interleaved copies of the planes, for device upload.
    pub fn planes(&self) -> Option<(Vec<Real>, Vec<Real>)> {
        match &self.data {
            ModelData::Empty => None,
            ModelData::Owned { real, imag } => Some((real.clone(), imag.clone())),
            ModelData::Shared(data) => {
                let n = data.len() / 2;
                let mut real = Vec::with_capacity(n);
                let mut imag = Vec::with_capacity(n);
                for i in 0..n {
                    real.push(data[2 * i]);
                    imag.push(data[2 * i + 1]);
                }
                Some((real, imag))
            }
        }
    }

    /// Interpolated complex sample at fractional model coordinates.
    ///
    /// `yp`/`zp` are frequencies (may be negative down to `init_y`/`init_z`);
    /// out-of-range coordinates clamp to the volume edge. For a 2D model
    /// `zp` is ignored. An unconfigured store samples as zero everywhere.
    #[inline]
    pub fn sample(&self, xp: Real, yp: Real, zp: Real) -> Complex<Real> {
        if self.dims.x == 0 {
            return Complex::new(0.0, 0.0);
        }
        if self.dims.z == 0 {
            interp::sample_2d(self, xp, yp)
        } else {
            interp::sample_3d(self, xp, yp, zp)
        }
    }

    /// Extract the central slice at `rot` into `out`.
    ///
    /// Per included pixel the (kx, ky) frequency is rotated, scaled by the
    /// padding factor, Friedel-conjugated into the stored half volume where
    /// needed, and interpolated. Pixels beyond the usable radius are zeroed.
    pub fn project_slice(&self, rot: &Matrix3<Real>, geom: &FourierGeom, out: &mut [Complex<Real>]) {
        debug_assert_eq!(out.len(), geom.npix());
        if self.dims.x == 0 {
            out.fill(Complex::new(0.0, 0.0));
            return;
        }
        interp::project_slice(self, rot, geom, out);
    }
}
