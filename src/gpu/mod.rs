//! CUDA offload for slice projection and hypothesis scoring.
//!
//! The device path mirrors the software path sample for sample: the
//! scoring kernel projects its reference sample inline from model planes
//! uploaded once per class per iteration, so no intermediate slice ever
//! round-trips through host memory. One thread owns one (rotation,
//! shifted image) hypothesis and accumulates its score in double
//! precision, matching the host accumulators.
//!
//! The kernel scores the dense hypothesis grid; coarse-pass pruning is a
//! host-side concern and the fine pass feeds the device only its
//! surviving orientations.

use std::sync::Arc;

use anyhow::{Context, Result};
use cudarc::driver::{
    CudaContext, CudaFunction, CudaModule, CudaSlice, CudaStream, LaunchConfig, PushKernelArg,
};
use tracing::debug;

use crate::engine::{ExpectationConfig, ParticleImage, SamplingHandle, ShiftCache, WeightMatrix};
use crate::projector::{ModelDims, ProjectorStore};
use crate::resolution::ResolutionMap;
use crate::Real;

const BLOCK_SIZE: u32 = 128;

/// Whether a CUDA device can be opened. Callers fall back to the
/// software path when this is false.
pub fn is_available() -> bool {
    std::panic::catch_unwind(|| CudaContext::new(0).is_ok()).unwrap_or(false)
}

/// A model's planes resident on the device.
pub struct DeviceModel {
    real: CudaSlice<Real>,
    imag: CudaSlice<Real>,
    dims: ModelDims,
}

impl DeviceModel {
    pub fn dims(&self) -> &ModelDims {
        &self.dims
    }
}

/// Compiled kernels and the stream they run on.
pub struct GpuEngine {
    _context: Arc<CudaContext>,
    stream: Arc<CudaStream>,
    _module: Arc<CudaModule>,
    diff_fn: CudaFunction,
    exp_fn: CudaFunction,
}

impl GpuEngine {
    pub fn new() -> Result<Self> {
        let context = CudaContext::new(0).context("Failed to open CUDA device 0")?;
        let stream = context.default_stream();

        let source = format!(
            "typedef {} XFLOAT;\n{}",
            if cfg!(feature = "double-precision") {
                "double"
            } else {
                "float"
            },
            include_str!("kernels/projdiff.cu")
        );
        let ptx = cudarc::nvrtc::compile_ptx_with_opts(
            source,
            cudarc::nvrtc::CompileOptions {
                ..Default::default()
            },
        )
        .context("Failed to compile projdiff.cu")?;

        let module = context.load_module(ptx).context("Failed to load projdiff module")?;
        let diff_fn = module
            .load_function("squared_differences_kernel")
            .context("squared_differences_kernel not found")?;
        let exp_fn = module
            .load_function("exp_weights_kernel")
            .context("exp_weights_kernel not found")?;

        debug!("GPU scoring engine ready");
        Ok(Self {
            _context: context,
            stream,
            _module: module,
            diff_fn,
            exp_fn,
        })
    }

    /// Upload one class's model planes. Done once per class per
    /// iteration; every scoring call reuses the resident copy.
    pub fn upload_model(&self, store: &ProjectorStore) -> Result<DeviceModel> {
        let (host_real, host_imag) = store
            .planes()
            .context("model store holds no data to upload")?;
        let mut real = self
            .stream
            .alloc_zeros::<Real>(host_real.len())
            .context("Failed to allocate model real plane")?;
        let mut imag = self
            .stream
            .alloc_zeros::<Real>(host_imag.len())
            .context("Failed to allocate model imag plane")?;
        self.stream
            .memcpy_htod(&host_real, &mut real)
            .context("Failed to upload model real plane")?;
        self.stream
            .memcpy_htod(&host_imag, &mut imag)
            .context("Failed to upload model imag plane")?;
        Ok(DeviceModel {
            real,
            imag,
            dims: *store.dims(),
        })
    }

    /// Score the dense hypothesis grid of one class into `weights` and
    /// return the smallest score.
    #[allow(clippy::too_many_arguments)]
    pub fn squared_differences(
        &self,
        model: &DeviceModel,
        particle: &ParticleImage,
        cache: &ShiftCache,
        sampling: &SamplingHandle,
        resol: &ResolutionMap,
        config: &ExpectationConfig,
        ic: usize,
        weights: &mut WeightMatrix,
    ) -> Result<f64> {
        let geom = resol.geom();
        let npix = geom.npix();
        let nr_shift = cache.nr_shifted();
        let nr_rot = sampling.nr_orientations() * sampling.nr_over_rot;

        // Flatten host-side inputs.
        let mut rot_host: Vec<Real> = Vec::with_capacity(nr_rot * 9);
        for orient in &sampling.orientations {
            for m in &orient.matrices {
                rot_host.extend(m.transpose().iter().copied());
            }
        }
        let mut shifted_host: Vec<Real> = Vec::with_capacity(nr_shift * npix * 2);
        for img in &cache.shifted {
            for v in img {
                shifted_host.push(v.re);
                shifted_host.push(v.im);
            }
        }

        let mut d_rot = self.stream.alloc_zeros::<Real>(rot_host.len())?;
        let mut d_shifted = self.stream.alloc_zeros::<Real>(shifted_host.len())?;
        let mut d_fctf = self.stream.alloc_zeros::<Real>(npix)?;
        let mut d_minvsigma2 = self.stream.alloc_zeros::<Real>(npix)?;
        let mut d_shells = self.stream.alloc_zeros::<i32>(npix)?;
        let d_out = self.stream.alloc_zeros::<f64>(nr_rot * nr_shift)?;
        self.stream.memcpy_htod(&rot_host, &mut d_rot)?;
        self.stream.memcpy_htod(&shifted_host, &mut d_shifted)?;
        self.stream.memcpy_htod(&cache.fctf, &mut d_fctf)?;
        self.stream.memcpy_htod(&cache.minvsigma2, &mut d_minvsigma2)?;
        self.stream.memcpy_htod(resol.as_slice(), &mut d_shells)?;

        let dims = model.dims;
        let scale: Real = if config.do_scale_correction {
            particle.scale
        } else {
            1.0
        };
        let mode: i32 = if config.cross_correlation_pass() { 1 } else { 0 };
        let apply_ctf: i32 = config.apply_ctf_to_reference() as i32;
        let max_r = dims.max_r.min(geom.size / 2);

        let n_threads = (nr_rot * nr_shift) as u32;
        let cfg = LaunchConfig {
            grid_dim: (n_threads.div_ceil(BLOCK_SIZE), 1, 1),
            block_dim: (BLOCK_SIZE, 1, 1),
            shared_mem_bytes: 0,
        };
        unsafe {
            self.stream
                .launch_builder(&self.diff_fn)
                .arg(&model.real)
                .arg(&model.imag)
                .arg(&(dims.x as i32))
                .arg(&(dims.y as i32))
                .arg(&(dims.z as i32))
                .arg(&dims.init_y)
                .arg(&dims.init_z)
                .arg(&(dims.padding_factor as Real))
                .arg(&(max_r as i32))
                .arg(&d_rot)
                .arg(&d_shifted)
                .arg(&d_fctf)
                .arg(&d_minvsigma2)
                .arg(&d_shells)
                .arg(&(geom.size as i32))
                .arg(&(geom.xdim as i32))
                .arg(&(geom.ydim as i32))
                .arg(&(nr_rot as i32))
                .arg(&(nr_shift as i32))
                .arg(&apply_ctf)
                .arg(&mode)
                .arg(&scale)
                .arg(&cache.sqrt_xi2)
                .arg(&cache.highres_xi2)
                .arg(&d_out)
                .launch(cfg)
        }
        .context("Failed to launch squared_differences_kernel")?;

        let host_out: Vec<f64> = self
            .stream
            .clone_dtoh(&d_out)
            .context("Failed to download scores")?;

        let mut min_diff2 = f64::INFINITY;
        for (iorient, orient) in sampling.orientations.iter().enumerate() {
            for iover_rot in 0..orient.matrices.len() {
                let irot = iorient * sampling.nr_over_rot + iover_rot;
                for itrans in 0..sampling.nr_translations() {
                    for iover_trans in 0..sampling.nr_over_trans {
                        let ishift = itrans * sampling.nr_over_trans + iover_trans;
                        let d = host_out[irot * nr_shift + ishift];
                        weights.set(
                            weights.index(ic, iorient, iover_rot, itrans, iover_trans),
                            d,
                        );
                        if d < min_diff2 {
                            min_diff2 = d;
                        }
                    }
                }
            }
        }
        debug!(min_diff2, nr_rot, nr_shift, "device scoring done");
        Ok(min_diff2)
    }

    /// Map scores to `exp(min - d)` on the device, for weight matrices too
    /// large to convert serially.
    pub fn weight_exponentials(&self, diffs: &[Real], min_diff2: Real) -> Result<Vec<Real>> {
        let mut d_in = self.stream.alloc_zeros::<Real>(diffs.len())?;
        let d_out = self.stream.alloc_zeros::<Real>(diffs.len())?;
        self.stream.memcpy_htod(diffs, &mut d_in)?;

        let n = diffs.len() as u32;
        let cfg = LaunchConfig {
            grid_dim: (n.div_ceil(BLOCK_SIZE), 1, 1),
            block_dim: (BLOCK_SIZE, 1, 1),
            shared_mem_bytes: 0,
        };
        unsafe {
            self.stream
                .launch_builder(&self.exp_fn)
                .arg(&d_in)
                .arg(&d_out)
                .arg(&min_diff2)
                .arg(&(diffs.len() as i32))
                .launch(cfg)
        }
        .context("Failed to launch exp_weights_kernel")?;

        self.stream
            .clone_dtoh(&d_out)
            .context("Failed to download weights")
    }
}
