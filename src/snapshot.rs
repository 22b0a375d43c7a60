//! Snapshot - authoritative consensus state at a given block.
//!
//! A snapshot captures the validator set, recent authors, scores and
//! per-validator counters at one block hash. It is rebuilt by applying a
//! contiguous run of headers forward from a known checkpoint; replay reads
//! no clock and no randomness, so two nodes applying the same headers to the
//! same snapshot always converge on identical state.

use crate::database::KeyValueStore;
use crate::header::Header;
use crate::{
    PoiError, AVAILABILITY_WEIGHT, BANDWIDTH_WEIGHT, BLOCK_SCORE_WEIGHT, BOOST_EPOCH,
    BOOST_FACTOR, CONSECUTIVE_LIMIT, COOLDOWN_BLOCKS, DECAY_EPOCH_SIZE, DECAY_FACTOR,
    DEFAULT_PERFORMANCE, DEFAULT_REPUTATION, LATENCY_WEIGHT, MIN_REPUTATION,
    SNAPSHOT_KEY_PREFIX, THROUGHPUT_WEIGHT, TX_SUCCESS_WEIGHT, UPTIME_WEIGHT,
};
use alloy_primitives::{Address, B256};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::info;

/// PoI engine configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoiConfig {
    /// Number of seconds between blocks to enforce.
    pub period: u64,
    /// Epoch length for reputation decay and checkpointing.
    pub epoch: u64,
}

impl Default for PoiConfig {
    fn default() -> Self {
        Self { period: 2, epoch: DECAY_EPOCH_SIZE }
    }
}

/// Validator record carried inside a snapshot.
///
/// Counters only — wall-clock state stays in the live engine. `start_time`
/// is carried verbatim through replay and never refreshed; records created
/// during replay leave it at zero.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotValidator {
    /// Validator identity.
    pub address: Address,
    /// Number of blocks authored.
    pub blocks_produced: u64,
    /// Run of immediately consecutive blocks by this validator.
    pub consecutive_blocks: u64,
    /// Block number through which the validator is ineligible.
    pub cooldown_until_block: u64,
    /// Block number of the last authored block.
    pub last_active_block: u64,
    /// Blocks of observed liveness since joining.
    pub total_uptime: u64,
    /// Successful transactions included.
    pub successful_txs: u64,
    /// Total transactions included.
    pub total_txs: u64,
    /// Latency in milliseconds.
    pub latency: f64,
    /// Throughput in transactions per second.
    pub throughput: f64,
    /// Bandwidth, already normalised to `[0, 1]`.
    pub bandwidth: f64,
    /// Block at which the validator joined the set.
    pub joined_at_block: u64,
    /// Unix seconds of first initialisation, carried as persisted.
    pub start_time: u64,
    /// Administrative on/off flag.
    pub is_active: bool,
}

impl SnapshotValidator {
    fn joined(address: Address, number: u64) -> Self {
        Self {
            address,
            joined_at_block: number,
            latency: 100.0,
            throughput: 10.0,
            bandwidth: 1.0,
            is_active: true,
            ..Default::default()
        }
    }
}

/// Consensus state at a given point in time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    /// Engine configuration, restored after loading.
    #[serde(skip)]
    pub config: PoiConfig,

    /// Block number where the snapshot was created.
    pub number: u64,

    /// Block hash where the snapshot was created.
    pub hash: B256,

    /// Set of authorised validators at this moment.
    #[serde(rename = "validators")]
    pub validator_set: BTreeSet<Address>,

    /// Recent block authors for spam protection (block number -> author).
    pub recents: BTreeMap<u64, Address>,

    /// Reputation score per validator.
    pub reputation_scores: BTreeMap<Address, f64>,

    /// Performance score per validator.
    pub performance_scores: BTreeMap<Address, f64>,

    /// Detailed validator records.
    pub validator_states: BTreeMap<Address, SnapshotValidator>,

    /// Current epoch number.
    pub epoch: u64,

    /// Last block at which reputation decay ran.
    pub last_decay_block: u64,
}

impl Snapshot {
    /// Create a new snapshot with the specified startup parameters.
    ///
    /// Every validator starts with the default reputation and performance
    /// and a fresh record joined at `number`.
    pub fn new(config: PoiConfig, number: u64, hash: B256, validators: &[Address]) -> Self {
        let mut snap = Self {
            config,
            number,
            hash,
            validator_set: BTreeSet::new(),
            recents: BTreeMap::new(),
            reputation_scores: BTreeMap::new(),
            performance_scores: BTreeMap::new(),
            validator_states: BTreeMap::new(),
            epoch: if config.epoch > 0 { number / config.epoch } else { 0 },
            last_decay_block: 0,
        };

        for &validator in validators {
            snap.validator_set.insert(validator);
            snap.reputation_scores.insert(validator, DEFAULT_REPUTATION);
            snap.performance_scores.insert(validator, DEFAULT_PERFORMANCE);
            snap
                .validator_states
                .insert(validator, SnapshotValidator::joined(validator, number));
        }

        snap
    }

    /// Load a snapshot from the database by block hash.
    pub fn load<DB: KeyValueStore + ?Sized>(
        config: &PoiConfig,
        db: &DB,
        hash: B256,
    ) -> Result<Option<Snapshot>, PoiError> {
        let Some(blob) = db.get(&snapshot_key(&hash))? else {
            return Ok(None);
        };
        let mut snap: Snapshot = serde_json::from_slice(&blob)
            .map_err(|e| PoiError::Serialization { message: e.to_string() })?;
        snap.config = *config;
        Ok(Some(snap))
    }

    /// Persist the snapshot into the database.
    pub fn store<DB: KeyValueStore + ?Sized>(&self, db: &DB) -> Result<(), PoiError> {
        let blob = serde_json::to_vec(self)
            .map_err(|e| PoiError::Serialization { message: e.to_string() })?;
        db.put(&snapshot_key(&self.hash), blob)
    }

    /// The list of authorised validators in ascending address order.
    pub fn validators(&self) -> Vec<Address> {
        self.validator_set.iter().copied().collect()
    }

    /// Check if an address is an authorised validator.
    pub fn is_validator(&self, address: &Address) -> bool {
        self.validator_set.contains(address)
    }

    /// Whether `validator` is the address-sorted in-turn producer at
    /// `number`. Scheduling hint only, not an eligibility rule.
    pub fn inturn(&self, number: u64, validator: Address) -> bool {
        let validators = self.validators();
        if validators.is_empty() {
            return false;
        }
        let offset = ((number + 1) % validators.len() as u64) as usize;
        validators[offset] == validator
    }

    /// Whether a validator is authorised and out of cooldown at `number`.
    pub fn is_valid_validator(&self, validator: Address, number: u64) -> bool {
        if !self.validator_set.contains(&validator) {
            return false;
        }
        match self.validator_states.get(&validator) {
            Some(state) => number >= state.cooldown_until_block,
            None => true,
        }
    }

    /// Combined PoI score of a validator under the given weights.
    pub fn poi_score(&self, validator: Address, alpha: f64, beta: f64) -> f64 {
        let reputation = self.reputation_scores.get(&validator).copied().unwrap_or_default();
        let performance = self.performance_scores.get(&validator).copied().unwrap_or_default();
        alpha * reputation + beta * performance
    }

    /// Top `percentage` of validators by PoI score, skipping those in
    /// cooldown. At least one is returned when any qualify.
    pub fn top_validators(&self, alpha: f64, beta: f64, percentage: f64) -> Vec<Address> {
        let mut scores: Vec<(Address, f64)> = self
            .validator_set
            .iter()
            .filter(|v| self.is_valid_validator(**v, self.number))
            .map(|&v| (v, self.poi_score(v, alpha, beta)))
            .collect();

        scores.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });

        let mut count = (scores.len() as f64 * percentage) as usize;
        if count == 0 && !scores.is_empty() {
            count = 1;
        }

        scores.into_iter().take(count).map(|(v, _)| v).collect()
    }

    /// Create a new snapshot by applying the given headers to this one.
    ///
    /// Headers must form a contiguous run immediately following the
    /// snapshot's block number. The original snapshot is left untouched.
    pub fn apply(&self, headers: &[Header]) -> Result<Snapshot, PoiError> {
        if headers.is_empty() {
            return Ok(self.clone());
        }

        // Sanity check that the headers can be applied
        for i in 0..headers.len() - 1 {
            if headers[i + 1].number != headers[i].number + 1 {
                return Err(PoiError::InvalidChain);
            }
        }
        if headers[0].number != self.number + 1 {
            return Err(PoiError::InvalidChain);
        }

        let mut snap = self.clone();

        for header in headers {
            let number = header.number;
            let validator = header.coinbase;

            if snap.config.epoch > 0 {
                snap.epoch = number / snap.config.epoch;
                // Epoch boundaries reset the recent-author window
                if number % snap.config.epoch == 0 {
                    snap.recents.clear();
                }
            }

            if !snap.validator_set.contains(&validator) {
                return Err(PoiError::Unauthorized { validator });
            }

            // A missing entry at number-1 starts a fresh streak
            let prev_author = if snap.recents.is_empty() {
                None
            } else {
                snap.recents.get(&(number - 1)).copied()
            };

            let state = snap
                .validator_states
                .entry(validator)
                .or_insert_with(|| SnapshotValidator::joined(validator, number));

            state.blocks_produced += 1;
            state.last_active_block = number;
            state.total_uptime += 1;

            if prev_author == Some(validator) {
                state.consecutive_blocks += 1;
            } else {
                state.consecutive_blocks = 1;
            }

            if state.consecutive_blocks >= CONSECUTIVE_LIMIT {
                state.cooldown_until_block = number + COOLDOWN_BLOCKS;
                state.consecutive_blocks = 0;
            }

            snap.recents.insert(number, validator);

            if snap.config.epoch > 0
                && number % snap.config.epoch == 0
                && number > snap.last_decay_block
            {
                snap.apply_reputation_decay();
                snap.last_decay_block = number;
            }

            snap.update_scores(validator);

            let limit = (snap.validator_set.len() / 2 + 1) as u64;
            if number >= limit {
                snap.recents.remove(&(number - limit));
            }
        }

        snap.number += headers.len() as u64;
        snap.hash = headers.last().unwrap().hash();

        Ok(snap)
    }

    /// Multiply every reputation by the decay factor, floored at the
    /// minimum.
    fn apply_reputation_decay(&mut self) {
        for score in self.reputation_scores.values_mut() {
            *score = (*score * DECAY_FACTOR).max(MIN_REPUTATION);
        }
        info!(
            target: "poi::snapshot",
            factor = DECAY_FACTOR,
            validators = self.reputation_scores.len(),
            "applied reputation decay"
        );
    }

    /// Recompute reputation and performance scores for one validator.
    fn update_scores(&mut self, validator: Address) {
        let Some(state) = self.validator_states.get(&validator) else {
            return;
        };

        let block_score = (state.blocks_produced as f64 / (self.number + 1) as f64).min(1.0);

        let observed = (self.number + 1).saturating_sub(state.joined_at_block).max(1);
        let uptime_score = (state.total_uptime as f64 / observed as f64).min(1.0);

        let tx_success = if state.total_txs > 0 {
            state.successful_txs as f64 / state.total_txs as f64
        } else {
            1.0
        };

        let mut reputation = BLOCK_SCORE_WEIGHT * block_score
            + UPTIME_WEIGHT * uptime_score
            + TX_SUCCESS_WEIGHT * tx_success;

        if state.blocks_produced < BOOST_EPOCH * DECAY_EPOCH_SIZE {
            reputation *= BOOST_FACTOR;
        }
        if reputation > 1.0 {
            reputation = 1.0;
        }

        self.reputation_scores.insert(validator, reputation);

        let latency_score = (1.0 - state.latency / 1000.0).max(0.0);
        let throughput_score = (state.throughput / 100.0).min(1.0);
        let availability_score = uptime_score;
        let bandwidth_score = state.bandwidth.min(1.0);

        let performance = LATENCY_WEIGHT * latency_score
            + THROUGHPUT_WEIGHT * throughput_score
            + AVAILABILITY_WEIGHT * availability_score
            + BANDWIDTH_WEIGHT * bandwidth_score;

        self.performance_scores.insert(validator, performance);
    }

}

/// Database key for the snapshot sealed at `hash`.
pub fn snapshot_key(hash: &B256) -> Vec<u8> {
    let mut key = SNAPSHOT_KEY_PREFIX.to_vec();
    key.extend_from_slice(hash.as_slice());
    key
}
