//! Device model store: a complex-valued 2D/3D Fourier reference volume
//! exposed for interpolated slice extraction.
//!
//! The store owns (or borrows) the real/imaginary planes of one reference
//! class and answers fractional-coordinate lookups through bilinear or
//! trilinear interpolation. Two strategies implement that contract: the
//! software interpolator in [`interp`] (always available), and the CUDA
//! kernels in the `gpu` module which run the same arithmetic device-side
//! against planes uploaded once per class per iteration.

mod interp;
mod store;

pub use store::{ModelDims, ProjectorStore};
