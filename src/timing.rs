//! Phase timing for expectation passes.
//!
//! Collection is active under the `profiling` feature; without it the
//! collector is a zero-sized no-op and timed closures run untimed.

use serde::{Deserialize, Serialize};
use std::time::Duration;
#[cfg(feature = "profiling")]
use std::time::Instant;

/// The phases of one pass over a particle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    /// Building the shifted-image cache.
    Shifts,
    /// Extracting reference slices.
    Projection,
    /// Scoring hypotheses.
    Diff,
    /// Converting scores and accumulating weighted sums.
    Weights,
}

impl Phase {
    pub const ALL: [Phase; 4] = [Phase::Shifts, Phase::Projection, Phase::Diff, Phase::Weights];
}

/// Milliseconds spent per [`Phase`].
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct PhaseBreakdown {
    ms: [f64; 4],
}

impl PhaseBreakdown {
    pub fn add(&mut self, phase: Phase, ms: f64) {
        self.ms[phase as usize] += ms;
    }

    pub fn get(&self, phase: Phase) -> f64 {
        self.ms[phase as usize]
    }

    pub fn total(&self) -> f64 {
        self.ms.iter().sum()
    }
}

/// One particle's share of a pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParticleTiming {
    pub particle: usize,
    pub total_ms: f64,
    pub phases: PhaseBreakdown,
}

/// A whole pass: wall-clock total, per-phase totals, and the per-particle
/// breakdown.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PassTiming {
    pub total_ms: f64,
    pub phases: PhaseBreakdown,
    pub particles: Vec<ParticleTiming>,
}

/// Collects phase timings over a pass.
#[cfg(feature = "profiling")]
#[derive(Debug, Default)]
pub struct TimingCollector {
    pass_start: Option<Instant>,
    particle_start: Option<Instant>,
    current: PhaseBreakdown,
    timing: PassTiming,
}

#[cfg(feature = "profiling")]
impl TimingCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_pass(&mut self) {
        self.pass_start = Some(Instant::now());
        self.timing = PassTiming::default();
    }

    pub fn start_particle(&mut self) {
        self.particle_start = Some(Instant::now());
        self.current = PhaseBreakdown::default();
    }

    /// Run `f`, charging its wall time to `phase`.
    pub fn time<R>(&mut self, phase: Phase, f: impl FnOnce() -> R) -> R {
        let start = Instant::now();
        let out = f();
        self.record(phase, start.elapsed());
        out
    }

    pub fn record(&mut self, phase: Phase, elapsed: Duration) {
        let ms = elapsed.as_secs_f64() * 1000.0;
        self.current.add(phase, ms);
        self.timing.phases.add(phase, ms);
    }

    pub fn end_particle(&mut self) {
        let total_ms = self
            .particle_start
            .take()
            .map(|s| s.elapsed().as_secs_f64() * 1000.0)
            .unwrap_or(0.0);
        self.timing.particles.push(ParticleTiming {
            particle: self.timing.particles.len(),
            total_ms,
            phases: self.current,
        });
    }

    pub fn finish(&mut self) -> PassTiming {
        self.timing.total_ms = self
            .pass_start
            .take()
            .map(|s| s.elapsed().as_secs_f64() * 1000.0)
            .unwrap_or(0.0);
        std::mem::take(&mut self.timing)
    }
}

/// No-op collector when profiling is disabled.
#[cfg(not(feature = "profiling"))]
#[derive(Debug, Default)]
pub struct TimingCollector;

#[cfg(not(feature = "profiling"))]
impl TimingCollector {
    #[inline(always)]
    pub fn new() -> Self {
        Self
    }

    #[inline(always)]
    pub fn start_pass(&mut self) {}

    #[inline(always)]
    pub fn start_particle(&mut self) {}

    #[inline(always)]
    pub fn time<R>(&mut self, _phase: Phase, f: impl FnOnce() -> R) -> R {
        f()
    }

    #[inline(always)]
    pub fn record(&mut self, _phase: Phase, _elapsed: Duration) {}

    #[inline(always)]
    pub fn end_particle(&mut self) {}

    #[inline(always)]
    pub fn finish(&mut self) -> PassTiming {
        PassTiming::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timed_closure_returns_value() {
        let mut collector = TimingCollector::new();
        collector.start_pass();
        collector.start_particle();
        let v = collector.time(Phase::Diff, || 6 * 7);
        assert_eq!(v, 42);
        collector.end_particle();
        let timing = collector.finish();

        #[cfg(feature = "profiling")]
        {
            assert_eq!(timing.particles.len(), 1);
            assert!(timing.phases.get(Phase::Diff) >= 0.0);
        }
        #[cfg(not(feature = "profiling"))]
        assert_eq!(timing.total_ms, 0.0);
    }

    #[cfg(feature = "profiling")]
    #[test]
    fn test_phases_accumulate_separately() {
        let mut collector = TimingCollector::new();
        collector.start_pass();
        collector.start_particle();
        collector.record(Phase::Shifts, Duration::from_millis(1));
        collector.record(Phase::Projection, Duration::from_millis(2));
        collector.record(Phase::Diff, Duration::from_millis(3));
        collector.record(Phase::Weights, Duration::from_millis(4));
        collector.end_particle();
        let timing = collector.finish();

        for (phase, expect) in Phase::ALL.into_iter().zip([1.0, 2.0, 3.0, 4.0]) {
            assert_eq!(timing.phases.get(phase), expect);
            assert_eq!(timing.particles[0].phases.get(phase), expect);
        }
        assert_eq!(timing.phases.total(), 10.0);
    }
}
