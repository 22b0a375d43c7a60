//! Pure score functions over validator state and metrics.
//!
//! These are total and deterministic: no clock reads, no allocation. The
//! engine feeds them a copy of the validator's record plus the stored base
//! reputation, and the snapshot path recomputes its own variant during
//! replay (see [`crate::Snapshot`]).

use crate::validator::{PerformanceMetrics, ValidatorState};
use crate::{
    AVAILABILITY_WEIGHT, BANDWIDTH_REFERENCE, BANDWIDTH_WEIGHT, BOOST_EPOCH, BOOST_FACTOR,
    DECAY_EPOCH_SIZE, LATENCY_WEIGHT, PENALTY_WEIGHT, THROUGHPUT_REFERENCE, THROUGHPUT_WEIGHT,
};

/// Number of authored blocks below which a validator counts as young and
/// keeps its reputation boost.
pub const BOOST_WINDOW_BLOCKS: u64 = BOOST_EPOCH * DECAY_EPOCH_SIZE;

/// Live reputation of a validator.
///
/// Starts from the stored base value (the decay target), multiplies by
/// [`BOOST_FACTOR`] while the validator is inside its boost window, then
/// subtracts the penalty term, floored at zero. Young validators may report
/// above 1.0, up to `base * BOOST_FACTOR`.
pub fn reputation(state: &ValidatorState, base: f64) -> f64 {
    let mut rep = base;
    if state.blocks_produced < BOOST_WINDOW_BLOCKS {
        rep *= BOOST_FACTOR;
    }
    if state.penalties > 0 {
        rep -= PENALTY_WEIGHT * state.penalties as f64;
    }
    rep.max(0.0)
}

/// Live performance of a validator, in `[0, 1]`.
///
/// Latency is scored against a one-second ceiling, throughput against
/// [`THROUGHPUT_REFERENCE`], bandwidth against [`BANDWIDTH_REFERENCE`];
/// availability is taken as reported.
pub fn performance(metrics: &PerformanceMetrics) -> f64 {
    let latency_score = (1.0 - metrics.latency.as_secs_f64()).max(0.0);
    let throughput_score = (metrics.throughput / THROUGHPUT_REFERENCE).min(1.0);
    let availability_score = metrics.availability;
    let bandwidth_score = (metrics.bandwidth / BANDWIDTH_REFERENCE).min(1.0);

    LATENCY_WEIGHT * latency_score
        + THROUGHPUT_WEIGHT * throughput_score
        + AVAILABILITY_WEIGHT * availability_score
        + BANDWIDTH_WEIGHT * bandwidth_score
}

/// Combined PoI score: `alpha * reputation + beta * performance`.
pub fn poi_score(reputation: f64, performance: f64, alpha: f64, beta: f64) -> f64 {
    alpha * reputation + beta * performance
}
