// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use canonical_error::CanonicalError;

/// The field of detected sources handed to the plate solver, brightest
/// first. Coordinates are image-frame (y already flipped back from memory
/// order); flux is the detector's magnitude value.
#[derive(Clone, Debug, Default)]
pub struct SolverField {
    pub x: Vec<f64>,
    pub y: Vec<f64>,
    pub flux: Vec<f64>,
}

impl SolverField {
    pub fn len(&self) -> usize {
        self.x.len()
    }

    pub fn is_empty(&self) -> bool {
        self.x.is_empty()
    }
}

/// Per-attempt solver configuration.
#[derive(Clone, Debug)]
pub struct SolveOptions {
    // Pixel scale search bounds, arcsec/px.
    pub funits_lower: f64,
    pub funits_upper: f64,

    // Use at most this many of the brightest sources.
    pub max_sources: usize,

    // Smallest allowed quad diagonal, pixels.
    pub quadsize_min: f64,

    // Natural log of the odds ratio required to accept a match.
    pub keep_logodds: f64,

    // Active field bounds, pixels.
    pub field_width: f64,
    pub field_height: f64,

    // Try both image parities.
    pub parity_both: bool,
}

/// One matched source: the detected centroid and, when the solver could
/// reproject the reference star through its distortion-wrapped WCS, the
/// reference star's pixel position. Unmatched or unprojectable
/// correspondences carry no reference pixel and are skipped by the pointing
/// RMS sum.
#[derive(Clone, Copy, Debug)]
pub struct MatchedSource {
    pub field_x: f64,
    pub field_y: f64,
    pub ref_pixel: Option<(f64, f64)>,
}

/// A successful plate solution, already evaluated at the image centre.
#[derive(Clone, Debug, Default)]
pub struct SolveMatch {
    // ICRS centre of the field, degrees.
    pub ra_deg: f64,
    pub dec_deg: f64,

    // Arcsec/px.
    pub pixel_scale: f64,

    // Field rotation, degrees.
    pub field_rotation: f64,

    pub matches: Vec<MatchedSource>,
}

/// Cooperative cancellation capability handed to the solver; the solver
/// calls this once per tick of its internal clock and stops when it returns
/// false.
pub trait SolveContinuation {
    fn should_continue(&mut self) -> bool;
}

/// The standard continuation: an integer tick budget reset from the solve
/// time limit on each attempt, zeroed immediately when the process is
/// shutting down.
pub struct SolveTicker {
    counter: i32,
    shutting_down: Arc<AtomicBool>,
}

impl SolveTicker {
    pub fn new(timelimit: i32, shutting_down: Arc<AtomicBool>) -> Self {
        SolveTicker { counter: timelimit, shutting_down }
    }

    pub fn reset(&mut self, timelimit: i32) {
        self.counter = timelimit;
    }

    pub fn remaining(&self) -> i32 {
        self.counter
    }
}

impl SolveContinuation for SolveTicker {
    fn should_continue(&mut self) -> bool {
        if self.shutting_down.load(Ordering::Relaxed) {
            self.counter = 0;
            return false;
        }
        if self.counter != 0 {
            self.counter -= 1;
        }
        self.counter != 0
    }
}

/// Abstracts the plate-solving library. The engine and index files are
/// loaded by the implementation at startup (a configuration failure there is
/// fatal); each call runs one attempt over the supplied field under the
/// given continuation.
///
/// Returns Ok(None) when no match reached the odds threshold within the
/// continuation budget. The implementation clears its per-attempt state
/// (field binding, loaded index set) before returning, either way.
pub trait SolverTrait {
    fn solve_field(&mut self,
                   field: &SolverField,
                   options: &SolveOptions,
                   continuation: &mut dyn SolveContinuation)
                   -> Result<Option<SolveMatch>, CanonicalError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ticker_counts_down() {
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut ticker = SolveTicker::new(3, shutdown);
        assert!(ticker.should_continue());  // 2 remaining.
        assert!(ticker.should_continue());  // 1 remaining.
        assert!(!ticker.should_continue()); // 0: stop.
        assert!(!ticker.should_continue()); // Stays stopped.
        ticker.reset(2);
        assert!(ticker.should_continue());
    }

    #[test]
    fn test_ticker_zeroed_by_shutdown() {
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut ticker = SolveTicker::new(1000, shutdown.clone());
        assert!(ticker.should_continue());
        shutdown.store(true, Ordering::Relaxed);
        assert!(!ticker.should_continue());
        assert_eq!(ticker.remaining(), 0);
    }
}  // mod tests.
