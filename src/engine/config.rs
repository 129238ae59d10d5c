//! Expectation-pass configuration flags.

use serde::{Deserialize, Serialize};

/// Switches and scalars steering one expectation pass.
///
/// Mirrors the optimiser-level flags: alignment control, CTF and scale
/// handling, the cross-correlation bootstrap, and the significance
/// thresholds that connect the coarse and fine passes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpectationConfig {
    /// Keep the prior orientation and only evaluate translations.
    pub do_skip_align: bool,
    /// Keep the prior in-plane rotation.
    pub do_skip_rotate: bool,
    /// Score by cross-correlation on the first iteration only.
    pub do_firstiter_cc: bool,
    /// Score by cross-correlation on every iteration.
    pub do_always_cc: bool,
    /// Apply the CTF to references before comparison.
    pub do_ctf_correction: bool,
    /// References already carry the CTF; skip re-applying it.
    pub refs_are_ctf_corrected: bool,
    /// Apply per-group intensity scales and accumulate their sums.
    pub do_scale_correction: bool,
    /// Track per-particle normalisation corrections.
    pub do_norm_correction: bool,
    /// Build shift caches per particle with tabulated trig (cheap,
    /// repeated) instead of exact trig (spent once on a precomputed set).
    pub do_shifts_onthefly: bool,
    /// Multiplier on the noise model when weighting differences.
    pub sigma2_fudge: f64,
    /// Coarse-pass band: entries within this of the minimum stay alive.
    pub significance_threshold: f64,
    /// Fraction of total probability mass kept when picking the
    /// significant-weight cutoff.
    pub adaptive_fraction: f64,
    /// Oversampling order for the fine pass (0 disables): the fine grid
    /// keeps up to `2^order` rotations and `4^order` offsets per coarse
    /// grid point.
    pub adaptive_oversampling: usize,
    /// 1-based expectation iteration.
    pub iteration: usize,
}

impl Default for ExpectationConfig {
    fn default() -> Self {
        Self {
            do_skip_align: false,
            do_skip_rotate: false,
            do_firstiter_cc: false,
            do_always_cc: false,
            do_ctf_correction: true,
            refs_are_ctf_corrected: false,
            do_scale_correction: false,
            do_norm_correction: true,
            do_shifts_onthefly: true,
            sigma2_fudge: 1.0,
            significance_threshold: 10.0,
            adaptive_fraction: 0.999,
            adaptive_oversampling: 1,
            iteration: 1,
        }
    }
}

impl ExpectationConfig {
    /// Whether this pass scores by cross-correlation instead of
    /// noise-weighted squared differences.
    pub fn cross_correlation_pass(&self) -> bool {
        self.do_always_cc || (self.do_firstiter_cc && self.iteration == 1)
    }

    /// Whether references need the CTF multiplied in at comparison time.
    pub fn apply_ctf_to_reference(&self) -> bool {
        self.do_ctf_correction && !self.refs_are_ctf_corrected
    }
}
