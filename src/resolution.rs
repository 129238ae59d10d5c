//! Half-plane Fourier geometry and radial resolution-shell maps.
//!
//! Images live in the usual half-plane layout of a real-to-complex
//! transform: `xdim = size/2 + 1` columns of non-negative `kx`, `ydim =
//! size` rows whose upper half wraps to negative `ky`. The resolution map
//! assigns every sample its radial shell index so per-voxel contributions
//! can be bucketed by resolution; samples past the usable limit get `-1`.

/// Geometry of a square image's Fourier half-plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FourierGeom {
    /// Logical (real-space) image size.
    pub size: usize,
    /// Columns: `size/2 + 1`.
    pub xdim: usize,
    /// Rows: `size`.
    pub ydim: usize,
}

impl FourierGeom {
    pub fn new(size: usize) -> Self {
        Self {
            size,
            xdim: size / 2 + 1,
            ydim: size,
        }
    }

    /// Number of Fourier samples.
    #[inline]
    pub fn npix(&self) -> usize {
        self.xdim * self.ydim
    }

    /// Signed `ky` frequency for row `y`.
    #[inline]
    pub fn ky(&self, y: usize) -> i32 {
        if y < self.xdim {
            y as i32
        } else {
            y as i32 - self.ydim as i32
        }
    }

    /// Flat sample index for `(x, y)`.
    #[inline]
    pub fn index(&self, x: usize, y: usize) -> usize {
        y * self.xdim + x
    }

    /// Recover the geometry from a half-plane sample count, if `npix`
    /// corresponds to one.
    pub fn from_npix(npix: usize) -> Option<Self> {
        // npix = (size/2 + 1) * size, so size = sqrt(1 + 2 npix) - 1.
        let size = ((1.0 + 2.0 * npix as f64).sqrt() - 1.0).round() as usize;
        let geom = Self::new(size);
        (geom.npix() == npix).then_some(geom)
    }
}

/// Crop a half-plane transform from `from` down to `to`, keeping each
/// sample at its signed frequency. The low-frequency content is
/// preserved exactly; rows wrap so negative `ky` lands in the upper rows
/// of both layouts.
pub fn window<T: Copy + Default>(src: &[T], from: &FourierGeom, to: &FourierGeom) -> Vec<T> {
    debug_assert!(to.size <= from.size);
    let mut out = vec![T::default(); to.npix()];
    for y in 0..to.ydim {
        let ky = to.ky(y);
        let sy = if ky < 0 {
            (from.ydim as i32 + ky) as usize
        } else {
            ky as usize
        };
        for x in 0..to.xdim {
            out[to.index(x, y)] = src[from.index(x, sy)];
        }
    }
    out
}

/// Radial shell index per Fourier sample; `-1` marks excluded samples.
///
/// Built once per resolution configuration and shared by reference between
/// the engine and its accumulators.
#[derive(Debug, Clone)]
pub struct ResolutionMap {
    geom: FourierGeom,
    shells: Vec<i32>,
    nr_shells: usize,
}

impl ResolutionMap {
    /// Build the map for an image of `size`, keeping shells `0..=max_shell`.
    pub fn build(size: usize, max_shell: usize) -> Self {
        let geom = FourierGeom::new(size);
        let max_shell = max_shell.min(size / 2);
        let max_r2 = (max_shell * max_shell) as i32;
        let mut shells = Vec::with_capacity(geom.npix());
        for y in 0..geom.ydim {
            let ky = geom.ky(y);
            for x in 0..geom.xdim {
                let kx = x as i32;
                let r2 = kx * kx + ky * ky;
                if r2 > max_r2 {
                    shells.push(-1);
                } else {
                    shells.push(((r2 as f64).sqrt().round()) as i32);
                }
            }
        }
        Self {
            geom,
            shells,
            nr_shells: max_shell + 1,
        }
    }

    #[inline]
    pub fn geom(&self) -> &FourierGeom {
        &self.geom
    }

    /// Shell index for the flat sample index `n`, or `-1` if excluded.
    #[inline]
    pub fn shell(&self, n: usize) -> i32 {
        self.shells[n]
    }

    /// Number of shells covered (`max_shell + 1`).
    #[inline]
    pub fn nr_shells(&self) -> usize {
        self.nr_shells
    }

    pub fn as_slice(&self) -> &[i32] {
        &self.shells
    }
}
