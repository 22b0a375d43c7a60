//! Proof-of-Importance (PoI) consensus engine.
//!
//! PoI elects the producer of every block from a set of authorised
//! validators, weighting the choice by two live scores:
//!
//! - **Reputation**: long-run behaviour (blocks authored, uptime,
//!   transaction success, penalties), decayed every epoch and boosted for
//!   young validators.
//! - **Performance**: short-run operation (latency, throughput,
//!   availability, bandwidth), maintained as a moving average.
//!
//! The combined score is `alpha * reputation + beta * performance`. Election
//! samples one candidate from the top scoring window with probability
//! proportional to its score, subject to cooldown windows, a consecutive
//! block limit, and recent-author exclusion.
//!
//! # Components
//!
//! - [`Poi`]: the engine — validator custody, election, header
//!   verification, sealing, snapshot retrieval.
//! - [`Snapshot`]: persistable consensus state, rebuilt deterministically by
//!   replaying headers forward from a checkpoint.
//! - [`KeyValueStore`]: storage abstraction with a memory implementation for
//!   tests.
//! - [`PoiApi`]: operator surface, also exposed as the `poi` RPC namespace.

mod api;
mod database;
mod engine;
mod error;
mod header;
mod score;
mod snapshot;
mod validator;

pub use api::{
    AlgorithmParams, NetworkStats, PoiApi, PoiRpcServer, ValidatorFullInfo, ValidatorHistory,
    ValidatorRanking,
};
pub use database::{KeyValueStore, MemoryKeyValueStore, NoopKeyValueStore};
pub use engine::{public_key_address, sign_fn_from_secret, HeaderVerifyHandle, Poi, SignerFn};
pub use error::PoiError;
pub use header::{seal_hash, Block, ChainHeaderReader, Header};
pub use snapshot::{PoiConfig, Snapshot, SnapshotValidator};
pub use validator::{PerformanceMetrics, ValidatorState};

/// Number of blocks in one reputation decay epoch.
pub const DECAY_EPOCH_SIZE: u64 = 1000;

/// Fraction of reputation kept at each decay pass.
pub const DECAY_FACTOR: f64 = 0.7;

/// Number of epochs during which a young validator keeps its boost.
pub const BOOST_EPOCH: u64 = 3;

/// Reputation multiplier for validators inside the boost window.
pub const BOOST_FACTOR: f64 = 1.1;

/// Number of blocks a validator stays ineligible after hitting the
/// consecutive block limit.
pub const COOLDOWN_BLOCKS: u64 = 10;

/// Maximum run of immediately consecutive blocks by one validator.
pub const CONSECUTIVE_LIMIT: u64 = 10;

/// Fraction of the eligible set retained as the election window.
pub const SLIDING_WINDOW_PERCENT: f64 = 0.4;

/// Reputation assigned to validators without any history.
pub const DEFAULT_REPUTATION: f64 = 0.5;

/// Performance score reported for validators without any metrics sample.
pub const DEFAULT_PERFORMANCE: f64 = 0.5;

/// Upper bound on the number of tracked validators.
pub const MAX_VALIDATORS: usize = 100;

/// Weight of the latency component in the performance score.
pub const LATENCY_WEIGHT: f64 = 0.25;

/// Weight of the throughput component in the performance score.
pub const THROUGHPUT_WEIGHT: f64 = 0.25;

/// Weight of the availability component in the performance score.
pub const AVAILABILITY_WEIGHT: f64 = 0.25;

/// Weight of the bandwidth component in the performance score.
pub const BANDWIDTH_WEIGHT: f64 = 0.25;

/// Weight of block production in the reputation score.
pub const BLOCK_SCORE_WEIGHT: f64 = 0.4;

/// Weight of uptime in the reputation score.
pub const UPTIME_WEIGHT: f64 = 0.3;

/// Weight of transaction success in the reputation score.
pub const TX_SUCCESS_WEIGHT: f64 = 0.3;

/// Reputation subtracted per accumulated penalty.
pub const PENALTY_WEIGHT: f64 = 0.05;

/// Floor applied to reputation by the epoch decay pass.
pub const MIN_REPUTATION: f64 = 0.1;

/// Throughput (transactions per second) that maps to a full throughput score.
pub const THROUGHPUT_REFERENCE: f64 = 100.0;

/// Bandwidth (bytes per second) that maps to a full bandwidth score.
pub const BANDWIDTH_REFERENCE: f64 = 100.0 * 1024.0 * 1024.0;

/// Default weight of reputation in the combined PoI score.
pub const DEFAULT_ALPHA: f64 = 0.6;

/// Default weight of performance in the combined PoI score.
pub const DEFAULT_BETA: f64 = 0.4;

/// Number of blocks after which to save the snapshot to the database.
pub const CHECKPOINT_INTERVAL: u64 = 1024;

/// Number of recent snapshots to keep in memory.
pub const INMEMORY_SNAPSHOTS: usize = 128;

/// Number of recent block signatures to keep in memory.
pub const INMEMORY_SIGNATURES: usize = 4096;

/// Fixed number of extra-data suffix bytes reserved for the seal signature.
pub const EXTRA_SEAL: usize = 65;

/// Database key prefix for persisted snapshots.
pub const SNAPSHOT_KEY_PREFIX: &[u8] = b"poi-snapshot";

/// Base fee filled in during block assembly when the header carries none.
pub const DEFAULT_BASE_FEE: u64 = 1_000_000_000;
