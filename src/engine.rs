//! PoI consensus engine.
//!
//! The engine owns the live validator records, elects block producers,
//! verifies headers, seals blocks and materialises snapshots. It is shared
//! behind an `Arc` between the block production loop and RPC handlers.
//!
//! Three locks guard the shared state: `signer` (identity and signing
//! function), `validators` (state map and recent-author bookkeeping) and
//! `scores` (reputation and performance maps). When more than one is needed
//! they are taken in that order, never nested in reverse.

use crate::database::KeyValueStore;
use crate::header::{seal_hash, Block, ChainHeaderReader, Header};
use crate::score;
use crate::snapshot::{PoiConfig, Snapshot};
use crate::validator::{PerformanceMetrics, ValidatorState};
use crate::{
    PoiError, CHECKPOINT_INTERVAL, CONSECUTIVE_LIMIT, COOLDOWN_BLOCKS, DECAY_FACTOR,
    DEFAULT_ALPHA, DEFAULT_BASE_FEE, DEFAULT_BETA, DEFAULT_PERFORMANCE, DEFAULT_REPUTATION,
    EXTRA_SEAL, INMEMORY_SIGNATURES, INMEMORY_SNAPSHOTS, MIN_REPUTATION, SLIDING_WINDOW_PERCENT,
};
use alloy_primitives::{keccak256, Address, B256, B64, U256};
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use rand::{rngs::StdRng, Rng, SeedableRng};
use secp256k1::ecdsa::{RecoverableSignature, RecoveryId};
use secp256k1::{All, Message, PublicKey, Secp256k1, SecretKey};
use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, error, info, warn};

/// MIME type passed to the signing function alongside the seal digest.
pub const SEAL_MIME: &str = "application/x-ethereum-block";

/// Signing callback: receives the signer address, a MIME type and the
/// 32 byte seal digest, returns a 65 byte recoverable signature.
pub type SignerFn = dyn Fn(Address, &str, &[u8]) -> Result<Vec<u8>, PoiError> + Send + Sync;

/// Signer identity and capability, guarded together.
#[derive(Default)]
struct SignerState {
    signer: Option<Address>,
    sign_fn: Option<Arc<SignerFn>>,
}

/// Validator state map plus the recent-author bookkeeping the elector and
/// the sealer consult.
#[derive(Default)]
struct ValidatorRegistry {
    states: HashMap<Address, ValidatorState>,
    recents: HashMap<u64, Address>,
    last_author: Option<Address>,
}

/// Reputation and performance maps, guarded together.
#[derive(Default)]
struct ScoreRegistry {
    reputation: HashMap<Address, f64>,
    performance: HashMap<Address, PerformanceMetrics>,
}

/// Handle to a running batch header verification.
///
/// Results arrive in header order on `results`. Dropping the handle or
/// calling [`HeaderVerifyHandle::abort`] stops the worker after the header
/// currently being checked.
pub struct HeaderVerifyHandle {
    abort: Sender<()>,
    results: Receiver<Result<(), PoiError>>,
}

impl HeaderVerifyHandle {
    /// Request the verification to stop.
    pub fn abort(&self) {
        let _ = self.abort.send(());
    }

    /// Per-header results, in submission order.
    pub fn results(&self) -> &Receiver<Result<(), PoiError>> {
        &self.results
    }
}

/// Proof-of-Importance consensus engine.
pub struct Poi<DB> {
    /// Engine configuration.
    config: PoiConfig,

    /// Database for snapshot checkpoints.
    db: Arc<DB>,

    /// Snapshots for recent blocks to speed up retrieval.
    recent_snapshots: RwLock<LruCache<B256, Snapshot>>,

    /// Recovered signer addresses of recent blocks.
    signatures: RwLock<LruCache<B256, Address>>,

    /// Signer identity and signing function.
    signer: RwLock<SignerState>,

    /// Validator states and recent authors.
    validators: RwLock<ValidatorRegistry>,

    /// Reputation and performance stores.
    scores: RwLock<ScoreRegistry>,

    /// Last block at which the epoch decay ran.
    last_decay_block: RwLock<u64>,

    /// PRNG driving the weighted election draw.
    rng: Mutex<StdRng>,

    /// Weight of reputation in the PoI score.
    alpha: f64,

    /// Weight of performance in the PoI score.
    beta: f64,

    /// Secp256k1 context for signature recovery.
    secp: Secp256k1<All>,
}

impl<DB: KeyValueStore> Poi<DB> {
    /// Create a new PoI engine.
    pub fn new(config: PoiConfig, db: Arc<DB>) -> Self {
        info!(
            target: "poi::engine",
            period = config.period,
            epoch = config.epoch,
            alpha = DEFAULT_ALPHA,
            beta = DEFAULT_BETA,
            "PoI consensus engine initialized"
        );

        Self {
            config,
            db,
            recent_snapshots: RwLock::new(LruCache::new(
                NonZeroUsize::new(INMEMORY_SNAPSHOTS).unwrap(),
            )),
            signatures: RwLock::new(LruCache::new(
                NonZeroUsize::new(INMEMORY_SIGNATURES).unwrap(),
            )),
            signer: RwLock::new(SignerState::default()),
            validators: RwLock::new(ValidatorRegistry::default()),
            scores: RwLock::new(ScoreRegistry::default()),
            last_decay_block: RwLock::new(0),
            rng: Mutex::new(StdRng::from_entropy()),
            alpha: DEFAULT_ALPHA,
            beta: DEFAULT_BETA,
            secp: Secp256k1::new(),
        }
    }

    /// Replace the election PRNG with a seeded one, for reproducible tests.
    pub fn with_rng_seed(self, seed: u64) -> Self {
        *self.rng.lock() = StdRng::seed_from_u64(seed);
        self
    }

    /// Engine configuration.
    pub fn config(&self) -> &PoiConfig {
        &self.config
    }

    /// Weight of reputation in the PoI score.
    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    /// Weight of performance in the PoI score.
    pub fn beta(&self) -> f64 {
        self.beta
    }

    // ---------------------------------------------------------------------
    // Signer management
    // ---------------------------------------------------------------------

    /// Inject the signing identity and callback.
    pub fn authorize(&self, signer: Address, sign_fn: Arc<SignerFn>) {
        let mut state = self.signer.write();
        state.signer = Some(signer);
        state.sign_fn = Some(sign_fn);
        info!(target: "poi::engine", signer = ?signer, "signer authorized");
    }

    /// The configured signer, if any.
    pub fn signer(&self) -> Option<Address> {
        self.signer.read().signer
    }

    /// Whether both a signer and a signing function are configured.
    pub fn is_ready_to_seal(&self) -> Result<(), PoiError> {
        let state = self.signer.read();
        if state.signer.is_none() {
            return Err(PoiError::NoSigner);
        }
        if state.sign_fn.is_none() {
            return Err(PoiError::NoSignFn);
        }
        Ok(())
    }

    /// Seed the very first validator and adopt it as the signer when none
    /// is configured yet.
    pub fn initialize_from_genesis(&self, validator: Address) {
        if validator == Address::ZERO {
            warn!(target: "poi::engine", "genesis validator address is empty");
            return;
        }
        if let Err(err) = self.initialize_validator(validator, 0) {
            warn!(target: "poi::engine", %err, "failed to seed genesis validator");
            return;
        }

        let mut state = self.signer.write();
        if state.signer.is_none() {
            state.signer = Some(validator);
            info!(
                target: "poi::engine",
                signer = ?validator,
                "genesis validator adopted as default signer"
            );
        }
    }

    // ---------------------------------------------------------------------
    // Validator store
    // ---------------------------------------------------------------------

    /// Register a validator first seen at `block_number`. No-op when the
    /// validator already exists.
    pub fn initialize_validator(
        &self,
        validator: Address,
        block_number: u64,
    ) -> Result<(), PoiError> {
        if validator == Address::ZERO {
            return Err(PoiError::InvalidAddress);
        }

        {
            let mut reg = self.validators.write();
            if reg.states.contains_key(&validator) {
                return Ok(());
            }
            reg.states.insert(validator, ValidatorState::new(validator, block_number));
        }

        let mut scores = self.scores.write();
        scores.reputation.entry(validator).or_insert(DEFAULT_REPUTATION);
        scores.performance.entry(validator).or_insert_with(PerformanceMetrics::baseline);

        debug!(target: "poi::engine", validator = ?validator, block = block_number, "validator initialized");
        Ok(())
    }

    /// Snapshot of a validator's live state.
    pub fn validator_state(&self, validator: Address) -> Option<ValidatorState> {
        self.validators.read().states.get(&validator).cloned()
    }

    /// Snapshot of every validator's live state, unordered.
    pub fn validator_states(&self) -> Vec<ValidatorState> {
        self.validators.read().states.values().cloned().collect()
    }

    /// All tracked validator addresses, unordered.
    pub fn get_validators(&self) -> Vec<Address> {
        self.validators.read().states.keys().copied().collect()
    }

    /// Number of tracked validators.
    pub fn validator_count(&self) -> usize {
        self.validators.read().states.len()
    }

    /// Fold a metrics sample into a validator's moving averages. The first
    /// sample for an unknown validator is stored as reported.
    pub fn update_performance_metrics(
        &self,
        validator: Address,
        latency: Duration,
        throughput: u64,
        availability: f64,
        bandwidth: u64,
    ) -> Result<(), PoiError> {
        if validator == Address::ZERO {
            return Err(PoiError::InvalidAddress);
        }

        let mut scores = self.scores.write();
        match scores.performance.get_mut(&validator) {
            Some(metrics) => {
                metrics.update_sample(latency, throughput as f64, availability, bandwidth as f64)
            }
            None => {
                scores.performance.insert(
                    validator,
                    PerformanceMetrics {
                        latency,
                        throughput: throughput as f64,
                        availability,
                        bandwidth: bandwidth as f64,
                        last_updated: SystemTime::now(),
                    },
                );
            }
        }
        Ok(())
    }

    /// Record one penalty against a validator.
    pub fn add_penalty(&self, validator: Address) -> Result<(), PoiError> {
        if validator == Address::ZERO {
            return Err(PoiError::InvalidAddress);
        }
        let mut reg = self.validators.write();
        let state = reg
            .states
            .get_mut(&validator)
            .ok_or(PoiError::ValidatorNotFound { validator })?;
        state.penalties += 1;
        Ok(())
    }

    /// Flip a validator's administrative active flag.
    pub fn set_validator_active(&self, validator: Address, active: bool) -> Result<(), PoiError> {
        if validator == Address::ZERO {
            return Err(PoiError::InvalidAddress);
        }
        let mut reg = self.validators.write();
        let state = reg
            .states
            .get_mut(&validator)
            .ok_or(PoiError::ValidatorNotFound { validator })?;
        state.is_active = active;
        Ok(())
    }

    /// Force a cooldown window onto a validator.
    pub fn set_cooldown(&self, validator: Address, until_block: u64) -> Result<(), PoiError> {
        if validator == Address::ZERO {
            return Err(PoiError::InvalidAddress);
        }
        let mut reg = self.validators.write();
        let state = reg
            .states
            .get_mut(&validator)
            .ok_or(PoiError::ValidatorNotFound { validator })?;
        state.cooldown_until_block = until_block;
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Scores
    // ---------------------------------------------------------------------

    /// Live reputation of a validator. Unknown validators report the
    /// default.
    pub fn get_reputation(&self, validator: Address) -> f64 {
        let state = self.validators.read().states.get(&validator).cloned();
        let Some(state) = state else {
            return DEFAULT_REPUTATION;
        };
        let base =
            self.scores.read().reputation.get(&validator).copied().unwrap_or(DEFAULT_REPUTATION);
        score::reputation(&state, base)
    }

    /// Live performance of a validator. Unknown validators report the
    /// default.
    pub fn get_performance(&self, validator: Address) -> f64 {
        match self.scores.read().performance.get(&validator) {
            Some(metrics) => score::performance(metrics),
            None => DEFAULT_PERFORMANCE,
        }
    }

    /// Combined PoI score of a validator.
    pub fn poi_score(&self, validator: Address) -> f64 {
        score::poi_score(
            self.get_reputation(validator),
            self.get_performance(validator),
            self.alpha,
            self.beta,
        )
    }

    /// Validators that are active and out of cooldown at `number`,
    /// unordered.
    pub fn eligible_validators(&self, number: u64) -> Vec<Address> {
        self.validators
            .read()
            .states
            .values()
            .filter(|s| s.is_active && s.cooldown_until_block <= number)
            .map(|s| s.address)
            .collect()
    }

    // ---------------------------------------------------------------------
    // Election
    // ---------------------------------------------------------------------

    /// Elect the validator allowed to produce block `number`.
    ///
    /// Active validators out of cooldown form the eligible set; authors of
    /// the most recent half of the active set's blocks are excluded; the
    /// rest are ranked by PoI score and one is drawn from the top window
    /// with probability proportional to its score. Ties rank by ascending
    /// address.
    pub fn select_validator(&self, number: u64) -> Result<Address, PoiError> {
        let (eligible_count, candidates) = {
            let reg = self.validators.read();
            let active: Vec<&ValidatorState> =
                reg.states.values().filter(|s| s.is_active).collect();
            if active.is_empty() {
                return Err(PoiError::NoEligibleValidator);
            }

            let eligible: Vec<&&ValidatorState> =
                active.iter().filter(|s| s.cooldown_until_block <= number).collect();
            if eligible.is_empty() {
                return Err(PoiError::NoEligibleValidator);
            }

            let recent_limit = (active.len() / 2) as u64;
            let mut recent_authors: HashSet<Address> = HashSet::new();
            for back in 1..=recent_limit {
                if let Some(author) = reg.recents.get(&number.saturating_sub(back)) {
                    recent_authors.insert(*author);
                }
            }

            let candidates: Vec<(Address, ValidatorState)> = eligible
                .iter()
                .filter(|s| !recent_authors.contains(&s.address))
                .map(|s| (s.address, (***s).clone()))
                .collect();

            (eligible.len(), candidates)
        };

        if candidates.is_empty() {
            return Err(PoiError::NoEligibleValidator);
        }

        let mut scored: Vec<(Address, f64)> = {
            let scores = self.scores.read();
            candidates
                .iter()
                .map(|(addr, state)| {
                    let base =
                        scores.reputation.get(addr).copied().unwrap_or(DEFAULT_REPUTATION);
                    let reputation = score::reputation(state, base);
                    let performance = scores
                        .performance
                        .get(addr)
                        .map(score::performance)
                        .unwrap_or(DEFAULT_PERFORMANCE);
                    (*addr, score::poi_score(reputation, performance, self.alpha, self.beta))
                })
                .collect()
        };

        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });

        let mut window = (eligible_count as f64 * SLIDING_WINDOW_PERCENT) as usize;
        if window == 0 {
            window = 1;
        }
        let window = window.min(scored.len());

        let mut rng = self.rng.lock();
        Ok(weighted_pick(&mut rng, &scored[..window]))
    }

    /// Record that `validator` was selected to produce block `number`.
    ///
    /// Tracks consecutive production and opens a cooldown window once the
    /// limit is hit.
    pub fn record_selection(&self, validator: Address, number: u64) -> Result<(), PoiError> {
        self.initialize_validator(validator, number)?;

        let mut reg = self.validators.write();
        let total = reg.states.len();
        let extends_streak = reg.last_author == Some(validator);

        let state = reg
            .states
            .get_mut(&validator)
            .ok_or(PoiError::ValidatorNotFound { validator })?;

        if extends_streak {
            state.consecutive_blocks += 1;
        } else {
            state.consecutive_blocks = 1;
        }

        if state.consecutive_blocks >= CONSECUTIVE_LIMIT {
            state.cooldown_until_block = number + COOLDOWN_BLOCKS;
            state.consecutive_blocks = 0;
            debug!(
                target: "poi::engine",
                validator = ?validator,
                until = number + COOLDOWN_BLOCKS,
                "consecutive limit reached, entering cooldown"
            );
        }

        reg.recents.insert(number, validator);
        let limit = (total / 2 + 1) as u64;
        if number >= limit {
            reg.recents.remove(&(number - limit));
        }
        reg.last_author = Some(validator);
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Maintenance
    // ---------------------------------------------------------------------

    /// Run the epoch decay when `number` is an unapplied epoch boundary.
    pub fn maybe_decay(&self, number: u64) {
        if self.config.epoch == 0 || number % self.config.epoch != 0 {
            return;
        }
        let mut last = self.last_decay_block.write();
        if number <= *last {
            return;
        }

        let mut scores = self.scores.write();
        for reputation in scores.reputation.values_mut() {
            *reputation = (*reputation * DECAY_FACTOR).max(MIN_REPUTATION);
        }
        *last = number;
        info!(
            target: "poi::engine",
            block = number,
            validators = scores.reputation.len(),
            "applied epoch reputation decay"
        );
    }

    /// Unconditionally multiply every stored reputation by the decay
    /// factor. Does not advance the epoch bookkeeping.
    pub fn decay_all_reputation(&self) {
        let mut scores = self.scores.write();
        for reputation in scores.reputation.values_mut() {
            *reputation *= DECAY_FACTOR;
        }
        info!(
            target: "poi::engine",
            factor = DECAY_FACTOR,
            validators = scores.reputation.len(),
            "manual reputation decay"
        );
    }

    // ---------------------------------------------------------------------
    // Header verification
    // ---------------------------------------------------------------------

    /// The address credited with producing the block.
    pub fn author(&self, header: &Header) -> Result<Address, PoiError> {
        Ok(header.coinbase)
    }

    /// Block difficulty, constant under PoI.
    pub fn calc_difficulty(&self) -> U256 {
        U256::from(1)
    }

    /// Verify a header against the current validator store.
    ///
    /// Unknown coinbases are initialised and accepted; known ones must be
    /// out of cooldown. The seal signature must recover to the coinbase.
    pub fn verify_header(
        &self,
        chain: Option<&dyn ChainHeaderReader>,
        header: &Header,
    ) -> Result<(), PoiError> {
        self.verify_header_with_parent(chain, header, None)
    }

    fn verify_header_with_parent(
        &self,
        chain: Option<&dyn ChainHeaderReader>,
        header: &Header,
        parent: Option<&Header>,
    ) -> Result<(), PoiError> {
        if header.number == 0 {
            return Ok(());
        }
        if header.time == 0 {
            return Err(PoiError::InvalidTimestamp);
        }

        let validator = header.coinbase;
        if validator == Address::ZERO {
            return Err(PoiError::InvalidAddress);
        }

        let cooldown = self.validators.read().states.get(&validator).map(|s| s.cooldown_until_block);
        match cooldown {
            None => self.initialize_validator(validator, header.number)?,
            Some(until) if until > header.number => {
                return Err(PoiError::ValidatorInCooldown { validator, until });
            }
            Some(_) => {}
        }

        if self.config.period > 0 {
            let parent = match parent {
                Some(parent) => Some(parent.clone()),
                None => chain
                    .and_then(|c| c.get_header(header.parent_hash, header.number.saturating_sub(1))),
            };
            if let Some(parent) = parent {
                if header.time < parent.time + self.config.period {
                    return Err(PoiError::InvalidTimestamp);
                }
            }
        }

        self.verify_seal(header)
    }

    /// Check the seal signature against the header coinbase.
    fn verify_seal(&self, header: &Header) -> Result<(), PoiError> {
        let signer = self.ecrecover(header)?;
        if signer != header.coinbase {
            return Err(PoiError::InvalidSignature);
        }
        Ok(())
    }

    /// Extract the signing address from a sealed header, with caching.
    pub fn ecrecover(&self, header: &Header) -> Result<Address, PoiError> {
        let hash = header.hash();
        if let Some(address) = self.signatures.write().get(&hash) {
            return Ok(*address);
        }

        let signature = header.seal_signature()?;
        let digest = seal_hash(header);
        let address = recover_address(&self.secp, &digest, signature)?;

        self.signatures.write().put(hash, address);
        Ok(address)
    }

    /// Verify a batch of headers on a background thread.
    ///
    /// Headers are checked in order; consecutive headers serve as each
    /// other's parents for the period check. The returned handle streams
    /// one result per header and can abort the run.
    pub fn verify_headers(
        self: &Arc<Self>,
        chain: Option<Arc<dyn ChainHeaderReader>>,
        headers: Vec<Header>,
    ) -> HeaderVerifyHandle
    where
        DB: 'static,
    {
        let (abort_tx, abort_rx) = mpsc::channel::<()>();
        let (results_tx, results_rx) = mpsc::sync_channel(headers.len().max(1));

        let engine = Arc::clone(self);
        std::thread::spawn(move || {
            let chain_ref = chain.as_deref();
            for (i, header) in headers.iter().enumerate() {
                match abort_rx.try_recv() {
                    Ok(()) | Err(TryRecvError::Disconnected) => return,
                    Err(TryRecvError::Empty) => {}
                }

                let parent = if i > 0 && headers[i - 1].hash() == header.parent_hash {
                    Some(&headers[i - 1])
                } else {
                    None
                };
                let result = engine.verify_header_with_parent(chain_ref, header, parent);
                if results_tx.send(result).is_err() {
                    return;
                }
            }
        });

        HeaderVerifyHandle { abort: abort_tx, results: results_rx }
    }

    // ---------------------------------------------------------------------
    // Block production
    // ---------------------------------------------------------------------

    /// Prepare a header for production: elect the coinbase, zero the PoA
    /// fields, reserve the seal suffix and pick a period-respecting
    /// timestamp.
    pub fn prepare(
        &self,
        chain: &dyn ChainHeaderReader,
        header: &mut Header,
    ) -> Result<(), PoiError> {
        if header.number == 0 {
            return Err(PoiError::UnknownBlock);
        }

        if header.number == 1 && self.validator_count() == 0 && header.coinbase != Address::ZERO {
            info!(
                target: "poi::engine",
                validator = ?header.coinbase,
                "seeding genesis validator from coinbase"
            );
            self.initialize_from_genesis(header.coinbase);
        }

        let validator = self.select_validator(header.number)?;
        self.record_selection(validator, header.number)?;

        header.coinbase = validator;
        header.nonce = B64::ZERO;
        header.mix_digest = B256::ZERO;
        header.difficulty = self.calc_difficulty();
        if header.extra.len() < EXTRA_SEAL {
            let mut extra = header.extra.to_vec();
            extra.resize(EXTRA_SEAL, 0);
            header.extra = extra.into();
        }

        let parent = chain
            .get_header(header.parent_hash, header.number - 1)
            .ok_or(PoiError::UnknownAncestor)?;
        let min_time = parent.time + self.config.period;
        header.time = min_time.max(unix_now());

        debug!(
            target: "poi::engine",
            number = header.number,
            validator = ?validator,
            time = header.time,
            "header prepared"
        );
        Ok(())
    }

    /// Apply the block's observations to its author's record and run the
    /// epoch maintenance. `tx_count` is the number of successfully executed
    /// transactions, as filtered by the caller's receipts.
    pub fn finalize(
        &self,
        validator: Address,
        number: u64,
        tx_count: u64,
    ) -> Result<(), PoiError> {
        self.initialize_validator(validator, number)?;

        {
            let mut reg = self.validators.write();
            let total = reg.states.len();
            let state = reg
                .states
                .get_mut(&validator)
                .ok_or(PoiError::ValidatorNotFound { validator })?;

            state.blocks_produced += 1;
            state.last_active_block = number;
            state.total_transactions += tx_count;
            state.successful_tx += tx_count;
            state.up_time =
                SystemTime::now().duration_since(state.start_time).unwrap_or_default();

            reg.recents.insert(number, validator);
            let limit = (total / 2 + 1) as u64;
            if number >= limit {
                reg.recents.remove(&(number - limit));
            }
        }

        self.maybe_decay(number);
        Ok(())
    }

    /// Fill assembly defaults and wrap the header into a block.
    ///
    /// The hard-coded base fee default assumes the chain is past fee-market
    /// activation; callers on pre-activation chains must clear it.
    pub fn finalize_and_assemble(&self, mut header: Header) -> Result<Block, PoiError> {
        if header.difficulty.is_zero() {
            header.difficulty = self.calc_difficulty();
        }
        if header.base_fee.is_none() {
            header.base_fee = Some(DEFAULT_BASE_FEE);
        }
        Ok(Block::new(header))
    }

    /// Seal a prepared block.
    ///
    /// Synchronously validates the signer configuration and the
    /// recent-author constraint, then spawns a completion task that waits
    /// out the sealing delay, signs the seal digest and offers the sealed
    /// block on `results`. Closing `stop` before the delay elapses cancels
    /// the task; a full result channel drops the block silently.
    pub fn seal(
        self: &Arc<Self>,
        block: Block,
        results: tokio::sync::mpsc::Sender<Block>,
        stop: tokio::sync::oneshot::Receiver<()>,
    ) -> Result<(), PoiError>
    where
        DB: 'static,
    {
        let mut header = block.header().clone();
        if header.difficulty.is_zero() {
            header.difficulty = self.calc_difficulty();
        }
        if header.base_fee.is_none() {
            header.base_fee = Some(DEFAULT_BASE_FEE);
        }
        if header.extra.len() < EXTRA_SEAL {
            return Err(PoiError::MissingSignature);
        }

        let (signer, sign_fn) = {
            let state = self.signer.read();
            (state.signer, state.sign_fn.clone())
        };
        let signer = signer.ok_or(PoiError::NoSigner)?;
        let sign_fn = sign_fn.ok_or(PoiError::NoSignFn)?;

        if signer != header.coinbase {
            return Err(PoiError::SignerMismatch { signer, coinbase: header.coinbase });
        }

        let validator_count = self.validator_count();
        if validator_count > 1 {
            self.check_recent_signer(signer, header.number)?;
        }

        let delay = self.sealing_delay(&header, signer, validator_count);
        let number = header.number;

        let mut stop = stop;
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = &mut stop => {
                        debug!(target: "poi::engine", number, "sealing cancelled");
                        return;
                    }
                }
            }

            let digest = seal_hash(&header);
            let signature = match sign_fn(signer, SEAL_MIME, digest.as_slice()) {
                Ok(signature) => signature,
                Err(err) => {
                    error!(target: "poi::engine", number, %err, "failed to sign block");
                    return;
                }
            };
            if signature.len() != EXTRA_SEAL {
                error!(
                    target: "poi::engine",
                    number,
                    length = signature.len(),
                    "invalid signature length"
                );
                return;
            }

            let mut extra = header.extra.to_vec();
            let offset = extra.len() - EXTRA_SEAL;
            extra[offset..].copy_from_slice(&signature);
            header.extra = extra.into();

            match results.try_send(block.with_seal(header)) {
                Ok(()) => {
                    info!(target: "poi::engine", number, signer = ?signer, "block sealed");
                }
                Err(_) => {
                    debug!(target: "poi::engine", number, "sealed block dropped, no listener");
                }
            }
        });

        Ok(())
    }

    /// Reject sealing when the signer authored a block inside the
    /// recent-author window.
    fn check_recent_signer(&self, signer: Address, number: u64) -> Result<(), PoiError> {
        let reg = self.validators.read();
        let limit = (reg.states.len() / 2) as u64;
        for (&recent_block, &author) in &reg.recents {
            if author == signer && recent_block < number && recent_block + limit >= number {
                return Err(PoiError::RecentlySigned { signer, recent_block });
            }
        }
        Ok(())
    }

    /// How long to wait before completing the seal.
    ///
    /// The base term waits for the header timestamp; the jitter term grows
    /// with the signer's distance from the in-turn slot and stays below one
    /// period, so out-of-turn validators concede the race to the in-turn
    /// one.
    fn sealing_delay(&self, header: &Header, signer: Address, validator_count: usize) -> Duration {
        let base = Duration::from_secs(header.time.saturating_sub(unix_now()));
        if validator_count == 0 {
            return base;
        }

        let mut validators = self.get_validators();
        validators.sort();
        let len = validators.len().max(1);
        let index = validators.iter().position(|v| *v == signer).unwrap_or(0);
        let inturn = ((header.number + 1) % len as u64) as usize;
        let distance = (index + len - inturn) % len;

        let jitter_ms = self.config.period * 1000 * distance as u64 / len as u64;
        base + Duration::from_millis(jitter_ms)
    }

    // ---------------------------------------------------------------------
    // Snapshots
    // ---------------------------------------------------------------------

    /// Retrieve the snapshot at a given block, building it if necessary.
    ///
    /// Walks backwards through memory cache, on-disk checkpoints and the
    /// chain until a snapshot is found (or genesis is reached), then
    /// replays the gathered headers forward.
    pub fn snapshot(
        &self,
        chain: Option<&dyn ChainHeaderReader>,
        mut number: u64,
        mut hash: B256,
        parents: Option<&[Header]>,
    ) -> Result<Snapshot, PoiError> {
        let mut headers: Vec<Header> = Vec::new();
        let mut snap: Option<Snapshot> = None;

        while snap.is_none() {
            if let Some(cached) = self.recent_snapshots.write().get(&hash) {
                snap = Some(cached.clone());
                break;
            }

            if number % CHECKPOINT_INTERVAL == 0 {
                if let Some(stored) = Snapshot::load(&self.config, self.db.as_ref(), hash)? {
                    debug!(target: "poi::engine", number, "loaded snapshot checkpoint");
                    snap = Some(stored);
                    break;
                }
            }

            if number == 0 {
                let mut validators = self.get_validators();
                validators.sort();
                let genesis = Snapshot::new(self.config, 0, hash, &validators);
                genesis.store(self.db.as_ref())?;
                info!(
                    target: "poi::engine",
                    validators = validators.len(),
                    "created genesis snapshot"
                );
                snap = Some(genesis);
                break;
            }

            let header = if let Some(parents) = parents {
                parents.iter().find(|h| h.hash() == hash && h.number == number).cloned()
            } else {
                chain.and_then(|c| c.get_header(hash, number))
            };
            let Some(header) = header else {
                return Err(PoiError::UnknownAncestor);
            };

            hash = header.parent_hash;
            number -= 1;
            headers.push(header);
        }

        let mut snap = snap.ok_or(PoiError::UnknownBlock)?;

        headers.reverse();
        if !headers.is_empty() {
            snap = snap.apply(&headers)?;
        }

        self.recent_snapshots.write().put(snap.hash, snap.clone());

        if snap.number % CHECKPOINT_INTERVAL == 0 && !headers.is_empty() {
            snap.store(self.db.as_ref())?;
            debug!(target: "poi::engine", number = snap.number, "stored snapshot checkpoint");
        }

        Ok(snap)
    }

    // ---------------------------------------------------------------------
    // Test support
    // ---------------------------------------------------------------------

    #[cfg(test)]
    pub(crate) fn set_reputation(&self, validator: Address, reputation: f64) {
        self.scores.write().reputation.insert(validator, reputation);
    }

    #[cfg(test)]
    pub(crate) fn stored_reputation(&self, validator: Address) -> Option<f64> {
        self.scores.read().reputation.get(&validator).copied()
    }

    #[cfg(test)]
    pub(crate) fn set_blocks_produced(&self, validator: Address, blocks: u64) {
        if let Some(state) = self.validators.write().states.get_mut(&validator) {
            state.blocks_produced = blocks;
        }
    }

    #[cfg(test)]
    pub(crate) fn performance_metrics(&self, validator: Address) -> Option<PerformanceMetrics> {
        self.scores.read().performance.get(&validator).cloned()
    }
}

/// Draw one candidate with probability proportional to its score.
///
/// `candidates` must be non-empty; a non-positive total weight falls back
/// to the first (highest ranked) candidate.
fn weighted_pick(rng: &mut StdRng, candidates: &[(Address, f64)]) -> Address {
    let total: f64 = candidates.iter().map(|(_, score)| score.max(0.0)).sum();
    if total <= 0.0 {
        return candidates[0].0;
    }

    let mut target = rng.gen::<f64>() * total;
    for (address, score) in candidates {
        target -= score.max(0.0);
        if target <= 0.0 {
            return *address;
        }
    }
    candidates[candidates.len() - 1].0
}

/// Recover the signing address from a 65 byte recoverable signature over
/// `digest`.
fn recover_address(
    secp: &Secp256k1<All>,
    digest: &B256,
    signature: &[u8],
) -> Result<Address, PoiError> {
    if signature.len() != EXTRA_SEAL {
        return Err(PoiError::MissingSignature);
    }

    // Accept both 0/1 and 27/28 recovery id encodings
    let v = signature[64];
    let recovery_value = if v >= 27 { v - 27 } else { v } as i32;
    let recovery_id =
        RecoveryId::try_from(recovery_value).map_err(|_| PoiError::InvalidSignature)?;

    let recoverable = RecoverableSignature::from_compact(&signature[..64], recovery_id)
        .map_err(|_| PoiError::InvalidSignature)?;
    let message =
        Message::from_digest_slice(digest.as_slice()).map_err(|_| PoiError::InvalidSignature)?;
    let pubkey =
        secp.recover_ecdsa(&message, &recoverable).map_err(|_| PoiError::InvalidSignature)?;

    Ok(public_key_address(&pubkey))
}

/// Ethereum-style address of a secp256k1 public key: the low 20 bytes of
/// the keccak256 of the uncompressed key.
pub fn public_key_address(pubkey: &PublicKey) -> Address {
    let uncompressed = pubkey.serialize_uncompressed();
    let hash = keccak256(&uncompressed[1..]);
    Address::from_slice(&hash[12..])
}

/// Build a signing function from a raw secp256k1 secret key.
///
/// Intended for tests and single-node setups; production deployments inject
/// their own signer backed by external key management.
pub fn sign_fn_from_secret(secret: SecretKey) -> Arc<SignerFn> {
    Arc::new(move |_, _, digest: &[u8]| {
        let secp = Secp256k1::new();
        let message =
            Message::from_digest_slice(digest).map_err(|_| PoiError::InvalidSignature)?;
        let signature = secp.sign_ecdsa_recoverable(&message, &secret);
        let (recovery_id, compact) = signature.serialize_compact();

        let mut out = vec![0u8; EXTRA_SEAL];
        out[..64].copy_from_slice(&compact);
        out[64] = i32::from(recovery_id) as u8;
        Ok(out)
    })
}

fn unix_now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::MemoryKeyValueStore;
    use crate::{BOOST_FACTOR, DECAY_EPOCH_SIZE, DEFAULT_REPUTATION};

    fn test_engine() -> Arc<Poi<MemoryKeyValueStore>> {
        Arc::new(Poi::new(PoiConfig::default(), MemoryKeyValueStore::new_arc()).with_rng_seed(42))
    }

    fn addr(byte: u8) -> Address {
        Address::repeat_byte(byte)
    }

    fn test_key(byte: u8) -> (SecretKey, Address) {
        let secret = SecretKey::from_slice(&[byte; 32]).unwrap();
        let secp = Secp256k1::new();
        let address = public_key_address(&PublicKey::from_secret_key(&secp, &secret));
        (secret, address)
    }

    fn signed_header(secret: &SecretKey, mut header: Header) -> Header {
        if header.extra.len() < EXTRA_SEAL {
            let mut extra = header.extra.to_vec();
            extra.resize(EXTRA_SEAL, 0);
            header.extra = extra.into();
        }
        let digest = seal_hash(&header);
        let sign = sign_fn_from_secret(*secret);
        let signature = sign(Address::ZERO, SEAL_MIME, digest.as_slice()).unwrap();

        let mut extra = header.extra.to_vec();
        let offset = extra.len() - EXTRA_SEAL;
        extra[offset..].copy_from_slice(&signature);
        header.extra = extra.into();
        header
    }

    #[derive(Default)]
    struct MockChain {
        by_hash: HashMap<B256, Header>,
        by_number: HashMap<u64, B256>,
        head: Option<B256>,
    }

    impl MockChain {
        fn insert(&mut self, header: Header) {
            let hash = header.hash();
            self.by_number.insert(header.number, hash);
            self.by_hash.insert(hash, header);
            self.head = Some(hash);
        }
    }

    impl ChainHeaderReader for MockChain {
        fn current_header(&self) -> Option<Header> {
            self.head.and_then(|h| self.by_hash.get(&h).cloned())
        }

        fn get_header(&self, hash: B256, number: u64) -> Option<Header> {
            self.by_hash.get(&hash).filter(|h| h.number == number).cloned()
        }

        fn get_header_by_number(&self, number: u64) -> Option<Header> {
            self.by_number.get(&number).and_then(|h| self.by_hash.get(h)).cloned()
        }

        fn get_header_by_hash(&self, hash: B256) -> Option<Header> {
            self.by_hash.get(&hash).cloned()
        }
    }

    #[test]
    fn engine_defaults() {
        let engine = test_engine();
        assert_eq!(engine.alpha(), 0.6);
        assert_eq!(engine.beta(), 0.4);
        assert!(engine.signer().is_none());
        assert_eq!(engine.validator_count(), 0);
        assert!(engine.is_ready_to_seal().is_err());
    }

    #[test]
    fn initialize_validator_is_idempotent() {
        let engine = test_engine();
        let v = addr(0x01);

        engine.initialize_validator(v, 100).unwrap();
        let started = engine.validator_state(v).unwrap();
        assert_eq!(started.last_active_block, 100);
        assert!(started.is_active);

        // second call keeps the original record
        engine.initialize_validator(v, 500).unwrap();
        assert_eq!(engine.validator_state(v).unwrap().last_active_block, 100);
        assert_eq!(engine.validator_count(), 1);
    }

    #[test]
    fn initialize_rejects_zero_address() {
        let engine = test_engine();
        assert_eq!(
            engine.initialize_validator(Address::ZERO, 1),
            Err(PoiError::InvalidAddress)
        );
    }

    #[test]
    fn fresh_validator_reports_boosted_default_reputation() {
        let engine = test_engine();
        let v = addr(0x01);
        engine.initialize_validator(v, 100).unwrap();

        let reputation = engine.get_reputation(v);
        assert!((reputation - DEFAULT_REPUTATION * BOOST_FACTOR).abs() < 1e-9);
    }

    #[test]
    fn reputation_drops_once_boost_expires() {
        let engine = test_engine();
        let v = addr(0x01);
        engine.initialize_validator(v, 100).unwrap();
        engine.set_blocks_produced(v, score::BOOST_WINDOW_BLOCKS);

        let reputation = engine.get_reputation(v);
        assert!(reputation < DEFAULT_REPUTATION * BOOST_FACTOR);
    }

    #[test]
    fn unknown_validator_reports_defaults() {
        let engine = test_engine();
        let v = addr(0x99);
        assert_eq!(engine.get_reputation(v), DEFAULT_REPUTATION);
        assert_eq!(engine.get_performance(v), DEFAULT_PERFORMANCE);
    }

    #[test]
    fn penalties_lower_reputation() {
        let engine = test_engine();
        let v = addr(0x01);
        engine.initialize_validator(v, 100).unwrap();
        let before = engine.get_reputation(v);

        engine.add_penalty(v).unwrap();
        engine.add_penalty(v).unwrap();

        assert!(engine.get_reputation(v) < before);
        assert_eq!(
            engine.add_penalty(addr(0x77)),
            Err(PoiError::ValidatorNotFound { validator: addr(0x77) })
        );
    }

    #[test]
    fn first_metrics_sample_stored_raw_then_averaged() {
        let engine = test_engine();
        let v = addr(0x01);

        engine
            .update_performance_metrics(v, Duration::from_millis(100), 1000, 0.99, 100 << 20)
            .unwrap();
        let metrics = engine.performance_metrics(v).unwrap();
        assert_eq!(metrics.latency, Duration::from_millis(100));
        assert_eq!(metrics.throughput, 1000.0);
        assert_eq!(metrics.availability, 0.99);

        engine
            .update_performance_metrics(v, Duration::from_millis(200), 800, 0.95, 80 << 20)
            .unwrap();
        let metrics = engine.performance_metrics(v).unwrap();
        assert!(metrics.latency > Duration::from_millis(100));
        assert!(metrics.latency < Duration::from_millis(200));
    }

    #[test]
    fn poi_score_stays_in_expected_band() {
        let engine = test_engine();
        let v = addr(0x01);
        engine.initialize_validator(v, 100).unwrap();

        let score = engine.poi_score(v);
        assert!(score > 0.0);
        assert!(score <= BOOST_FACTOR);
    }

    #[test]
    fn select_with_no_validators_fails() {
        let engine = test_engine();
        assert_eq!(engine.select_validator(1), Err(PoiError::NoEligibleValidator));
    }

    #[test]
    fn select_skips_inactive_validators() {
        let engine = test_engine();
        let v = addr(0x01);
        engine.initialize_validator(v, 1).unwrap();
        engine.set_validator_active(v, false).unwrap();

        assert_eq!(engine.select_validator(10), Err(PoiError::NoEligibleValidator));

        engine.set_validator_active(v, true).unwrap();
        assert_eq!(engine.select_validator(10).unwrap(), v);
    }

    #[test]
    fn consecutive_limit_opens_cooldown() {
        let engine = test_engine();
        let v = addr(0x01);
        engine.initialize_validator(v, 100).unwrap();

        for i in 0..CONSECUTIVE_LIMIT {
            engine.record_selection(v, 100 + i).unwrap();
        }

        let state = engine.validator_state(v).unwrap();
        assert_eq!(state.consecutive_blocks, 0);
        assert_eq!(state.cooldown_until_block, 109 + COOLDOWN_BLOCKS);

        // ineligible through the cooldown window, eligible right after
        assert_eq!(engine.select_validator(110), Err(PoiError::NoEligibleValidator));
        assert_eq!(engine.select_validator(118), Err(PoiError::NoEligibleValidator));
        assert_eq!(engine.select_validator(119).unwrap(), v);
    }

    #[test]
    fn interrupted_streak_resets() {
        let engine = test_engine();
        let a = addr(0x01);
        let b = addr(0x02);
        engine.initialize_validator(a, 1).unwrap();
        engine.initialize_validator(b, 1).unwrap();

        engine.record_selection(a, 10).unwrap();
        engine.record_selection(a, 11).unwrap();
        engine.record_selection(b, 12).unwrap();
        engine.record_selection(a, 13).unwrap();

        assert_eq!(engine.validator_state(a).unwrap().consecutive_blocks, 1);
        assert_eq!(engine.validator_state(b).unwrap().consecutive_blocks, 1);
    }

    #[test]
    fn equal_scores_break_ties_by_address() {
        let engine = test_engine();
        let low = addr(0x01);
        let high = addr(0x02);
        engine.initialize_validator(high, 1).unwrap();
        engine.initialize_validator(low, 1).unwrap();

        // window of one, identical scores: the lower address wins
        for _ in 0..10 {
            assert_eq!(engine.select_validator(100).unwrap(), low);
        }
    }

    #[test]
    fn recent_author_exclusion_alternates_two_validators() {
        let engine = test_engine();
        let a = addr(0x01);
        let b = addr(0x02);
        engine.initialize_validator(a, 1).unwrap();
        engine.initialize_validator(b, 1).unwrap();

        let mut selections = Vec::new();
        for n in 100..110 {
            let selected = engine.select_validator(n).unwrap();
            engine.record_selection(selected, n).unwrap();
            selections.push(selected);
        }

        for pair in selections.windows(2) {
            assert_ne!(pair[0], pair[1], "recent author must be excluded");
        }
        let a_count = selections.iter().filter(|s| **s == a).count();
        let b_count = selections.iter().filter(|s| **s == b).count();
        assert_eq!(a_count, b_count);
    }

    #[test]
    fn weighted_window_dominates_selection() {
        let engine = test_engine();

        let mut validators = Vec::new();
        for i in 0..10u8 {
            let v = addr(i + 1);
            engine.initialize_validator(v, 100).unwrap();
            engine.set_reputation(v, 0.1 + f64::from(i) * 0.1);
            validators.push(v);
        }

        let mut counts: HashMap<Address, usize> = HashMap::new();
        for _ in 0..1000 {
            let selected = engine.select_validator(200).unwrap();
            *counts.entry(selected).or_default() += 1;
        }

        // window is floor(10 * 0.4) = 4: only the top four ever win
        let top: HashSet<Address> = validators[6..].iter().copied().collect();
        let top_selections: usize =
            counts.iter().filter(|(v, _)| top.contains(*v)).map(|(_, c)| *c).sum();
        assert_eq!(top_selections, 1000);

        // and the weighted draw spreads across the whole window
        for v in &validators[6..] {
            assert!(counts.get(v).copied().unwrap_or(0) > 120, "validator {v} starved");
        }
        for v in &validators[..6] {
            assert_eq!(counts.get(v).copied().unwrap_or(0), 0);
        }
    }

    #[test]
    fn manual_decay_is_exact_and_unfloored() {
        let engine = test_engine();
        let a = addr(0x01);
        let b = addr(0x02);
        engine.initialize_validator(a, 100).unwrap();
        engine.initialize_validator(b, 100).unwrap();
        engine.set_reputation(a, 0.8);
        engine.set_reputation(b, 0.05);

        engine.decay_all_reputation();

        assert!((engine.stored_reputation(a).unwrap() - 0.56).abs() < 1e-12);
        // no floor on the manual path
        assert!((engine.stored_reputation(b).unwrap() - 0.035).abs() < 1e-12);
    }

    #[test]
    fn epoch_decay_floors_and_runs_once() {
        let engine = test_engine();
        let v = addr(0x01);
        engine.initialize_validator(v, 100).unwrap();
        engine.set_reputation(v, 0.12);

        // not an epoch boundary
        engine.maybe_decay(999);
        assert_eq!(engine.stored_reputation(v).unwrap(), 0.12);

        engine.maybe_decay(1000);
        assert_eq!(engine.stored_reputation(v).unwrap(), MIN_REPUTATION);

        // repeated boundary is a no-op
        engine.set_reputation(v, 0.9);
        engine.maybe_decay(1000);
        assert_eq!(engine.stored_reputation(v).unwrap(), 0.9);
    }

    #[test]
    fn genesis_header_always_verifies() {
        let engine = test_engine();
        let header = Header::default();
        assert!(engine.verify_header(None, &header).is_ok());
    }

    #[test]
    fn zero_timestamp_rejected() {
        let engine = test_engine();
        let header = Header { number: 5, coinbase: addr(0x01), ..Default::default() };
        assert_eq!(engine.verify_header(None, &header), Err(PoiError::InvalidTimestamp));
    }

    #[test]
    fn signed_header_verifies_and_registers_author() {
        let engine = test_engine();
        let (secret, author) = test_key(0x11);

        let header = signed_header(
            &secret,
            Header { number: 5, time: unix_now(), coinbase: author, ..Default::default() },
        );

        assert!(engine.verify_header(None, &header).is_ok());
        // permissive mode registered the unknown coinbase
        assert!(engine.validator_state(author).is_some());
        assert_eq!(engine.author(&header).unwrap(), author);
    }

    #[test]
    fn tampered_signature_rejected() {
        let engine = test_engine();
        let (secret, author) = test_key(0x11);

        let header = signed_header(
            &secret,
            Header { number: 5, time: unix_now(), coinbase: author, ..Default::default() },
        );

        let mut tampered = header.clone();
        let mut extra = tampered.extra.to_vec();
        extra[10] ^= 0xff;
        tampered.extra = extra.into();
        assert!(engine.verify_header(None, &tampered).is_err());

        // signature by a different key than the coinbase
        let (other_secret, _) = test_key(0x22);
        let forged = signed_header(
            &other_secret,
            Header { number: 6, time: unix_now(), coinbase: author, ..Default::default() },
        );
        assert_eq!(engine.verify_header(None, &forged), Err(PoiError::InvalidSignature));
    }

    #[test]
    fn cooldown_blocks_header_verification() {
        let engine = test_engine();
        let (secret, author) = test_key(0x11);
        engine.initialize_validator(author, 100).unwrap();
        engine.set_cooldown(author, 200).unwrap();

        let header = signed_header(
            &secret,
            Header { number: 150, time: unix_now(), coinbase: author, ..Default::default() },
        );

        assert_eq!(
            engine.verify_header(None, &header),
            Err(PoiError::ValidatorInCooldown { validator: author, until: 200 })
        );
    }

    #[test]
    fn period_spacing_enforced_against_parent() {
        let config = PoiConfig { period: 15, epoch: DECAY_EPOCH_SIZE };
        let engine = Arc::new(Poi::new(config, MemoryKeyValueStore::new_arc()));
        let (secret, author) = test_key(0x11);

        let parent = signed_header(
            &secret,
            Header { number: 4, time: 1_700_000_000, coinbase: author, ..Default::default() },
        );
        let mut chain = MockChain::default();
        chain.insert(parent.clone());

        let too_soon = signed_header(
            &secret,
            Header {
                number: 5,
                parent_hash: parent.hash(),
                time: parent.time + 5,
                coinbase: author,
                ..Default::default()
            },
        );
        assert_eq!(
            engine.verify_header(Some(&chain), &too_soon),
            Err(PoiError::InvalidTimestamp)
        );

        let spaced = signed_header(
            &secret,
            Header {
                number: 5,
                parent_hash: parent.hash(),
                time: parent.time + 15,
                coinbase: author,
                ..Default::default()
            },
        );
        assert!(engine.verify_header(Some(&chain), &spaced).is_ok());
    }

    #[test]
    fn batch_verification_streams_results_in_order() {
        let engine = test_engine();
        let (secret, author) = test_key(0x11);

        let mut headers = Vec::new();
        let mut parent_hash = B256::ZERO;
        for number in 1..=3u64 {
            let header = signed_header(
                &secret,
                Header {
                    number,
                    parent_hash,
                    time: 1_700_000_000 + number * 2,
                    coinbase: author,
                    ..Default::default()
                },
            );
            parent_hash = header.hash();
            headers.push(header);
        }

        let handle = engine.verify_headers(None, headers);
        for _ in 0..3 {
            let result = handle.results().recv().expect("missing result");
            assert!(result.is_ok(), "unexpected failure: {result:?}");
        }
    }

    #[test]
    fn batch_verification_reports_bad_headers_and_aborts() {
        let engine = test_engine();
        let (secret, author) = test_key(0x11);

        let good = signed_header(
            &secret,
            Header { number: 1, time: unix_now(), coinbase: author, ..Default::default() },
        );
        let bad = Header { number: 2, time: 0, coinbase: author, ..Default::default() };

        let handle = engine.verify_headers(None, vec![good, bad]);
        assert!(handle.results().recv().unwrap().is_ok());
        assert_eq!(handle.results().recv().unwrap(), Err(PoiError::InvalidTimestamp));

        // aborting a finished run is harmless
        handle.abort();
    }

    #[test]
    fn prepare_elects_coinbase_and_respects_period() {
        let engine = test_engine();
        let v = addr(0x01);
        engine.initialize_validator(v, 0).unwrap();

        let parent = Header {
            number: 4,
            time: unix_now() + 100, // parent in the near future forces period spacing
            ..Default::default()
        };
        let mut chain = MockChain::default();
        chain.insert(parent.clone());

        let mut header = Header { number: 5, parent_hash: parent.hash(), ..Default::default() };
        engine.prepare(&chain, &mut header).unwrap();

        assert_eq!(header.coinbase, v);
        assert_eq!(header.nonce, B64::ZERO);
        assert_eq!(header.mix_digest, B256::ZERO);
        assert!(header.extra.len() >= EXTRA_SEAL);
        assert_eq!(header.time, parent.time + engine.config().period);
    }

    #[test]
    fn prepare_bootstraps_genesis_validator_at_height_one() {
        let engine = test_engine();
        let v = addr(0x42);

        let parent = Header { number: 0, time: 1_700_000_000, ..Default::default() };
        let mut chain = MockChain::default();
        chain.insert(parent.clone());

        let mut header = Header {
            number: 1,
            parent_hash: parent.hash(),
            coinbase: v,
            ..Default::default()
        };
        engine.prepare(&chain, &mut header).unwrap();

        assert_eq!(header.coinbase, v);
        assert_eq!(engine.signer(), Some(v));
        assert!(engine.validator_state(v).is_some());
    }

    #[test]
    fn prepare_without_parent_fails() {
        let engine = test_engine();
        engine.initialize_validator(addr(0x01), 0).unwrap();

        let chain = MockChain::default();
        let mut header = Header { number: 5, ..Default::default() };
        assert_eq!(engine.prepare(&chain, &mut header), Err(PoiError::UnknownAncestor));
    }

    #[test]
    fn finalize_accumulates_observations() {
        let engine = test_engine();
        let v = addr(0x01);

        engine.finalize(v, 7, 25).unwrap();
        engine.finalize(v, 8, 5).unwrap();

        let state = engine.validator_state(v).unwrap();
        assert_eq!(state.blocks_produced, 2);
        assert_eq!(state.last_active_block, 8);
        assert_eq!(state.total_transactions, 30);
        assert_eq!(state.successful_tx, 30);
        assert!(state.successful_tx <= state.total_transactions);
    }

    #[test]
    fn assemble_fills_defaults() {
        let engine = test_engine();
        let header = Header { number: 3, difficulty: U256::ZERO, ..Default::default() };

        let block = engine.finalize_and_assemble(header).unwrap();
        assert_eq!(block.header().difficulty, U256::from(1));
        assert_eq!(block.header().base_fee, Some(DEFAULT_BASE_FEE));
    }

    #[tokio::test]
    async fn seal_produces_recoverable_signature() {
        let engine = test_engine();
        let (secret, signer) = test_key(0x11);
        engine.initialize_validator(signer, 0).unwrap();
        engine.authorize(signer, sign_fn_from_secret(secret));

        let header = Header {
            number: 1,
            time: 1_700_000_000, // past timestamp, no sealing delay
            coinbase: signer,
            extra: vec![0u8; EXTRA_SEAL].into(),
            ..Default::default()
        };
        let block = Block::new(header);

        let (results_tx, mut results_rx) = tokio::sync::mpsc::channel(1);
        let (_stop_tx, stop_rx) = tokio::sync::oneshot::channel();
        engine.seal(block, results_tx, stop_rx).unwrap();

        let sealed = results_rx.recv().await.expect("no sealed block");
        assert_eq!(engine.ecrecover(sealed.header()).unwrap(), signer);
        assert!(engine.verify_header(None, sealed.header()).is_ok());
    }

    #[tokio::test]
    async fn seal_requires_matching_signer() {
        let engine = test_engine();
        let (secret, signer) = test_key(0x11);
        engine.authorize(signer, sign_fn_from_secret(secret));

        let header = Header {
            number: 1,
            time: 1_700_000_000,
            coinbase: addr(0x99),
            extra: vec![0u8; EXTRA_SEAL].into(),
            ..Default::default()
        };
        let (results_tx, _results_rx) = tokio::sync::mpsc::channel(1);
        let (_stop_tx, stop_rx) = tokio::sync::oneshot::channel();

        let err = engine.seal(Block::new(header), results_tx, stop_rx).unwrap_err();
        assert!(matches!(err, PoiError::SignerMismatch { .. }));
    }

    #[tokio::test]
    async fn seal_honours_stop_channel() {
        let engine = test_engine();
        let (secret, signer) = test_key(0x11);
        engine.initialize_validator(signer, 0).unwrap();
        engine.authorize(signer, sign_fn_from_secret(secret));

        let header = Header {
            number: 1,
            time: unix_now() + 30, // future timestamp forces a delay
            coinbase: signer,
            extra: vec![0u8; EXTRA_SEAL].into(),
            ..Default::default()
        };
        let (results_tx, mut results_rx) = tokio::sync::mpsc::channel(1);
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel();

        engine.seal(Block::new(header), results_tx, stop_rx).unwrap();
        drop(stop_tx); // closing the stop channel cancels the pending seal

        let outcome =
            tokio::time::timeout(Duration::from_millis(200), results_rx.recv()).await;
        assert!(outcome.is_err() || outcome.unwrap().is_none());
    }

    #[test]
    fn out_of_turn_validators_wait_longer() {
        let engine = test_engine();
        let a = addr(0x01);
        let b = addr(0x02);
        engine.initialize_validator(a, 0).unwrap();
        engine.initialize_validator(b, 0).unwrap();

        let header = Header { number: 1, time: 0, ..Default::default() };
        // offset (1+1) % 2 = 0: validator a is in turn at this height
        let delay_a = engine.sealing_delay(&header, a, 2);
        let delay_b = engine.sealing_delay(&header, b, 2);

        assert_eq!(delay_a, Duration::ZERO);
        assert!(delay_b > delay_a);
        assert!(delay_b <= Duration::from_secs(engine.config().period));
    }

    #[test]
    fn snapshot_walks_back_to_genesis_and_caches() {
        let engine = test_engine();
        let validators = vec![addr(0x01), addr(0x02), addr(0x03)];
        for v in &validators {
            engine.initialize_validator(*v, 0).unwrap();
        }

        let genesis = Header { number: 0, time: 1_700_000_000, ..Default::default() };
        let mut chain = MockChain::default();
        let mut parent = genesis.clone();
        chain.insert(genesis);

        for number in 1..=5u64 {
            let header = Header {
                number,
                parent_hash: parent.hash(),
                time: parent.time + 2,
                coinbase: validators[(number % 3) as usize],
                ..Default::default()
            };
            chain.insert(header.clone());
            parent = header;
        }

        let snap = engine.snapshot(Some(&chain), 5, parent.hash(), None).unwrap();
        assert_eq!(snap.number, 5);
        assert_eq!(snap.hash, parent.hash());
        assert_eq!(snap.validators(), validators);
        // heights 1..=5 rotate through indices 1, 2, 0, 1, 2
        assert_eq!(snap.validator_states[&validators[0]].blocks_produced, 1);
        assert_eq!(snap.validator_states[&validators[2]].blocks_produced, 2);

        // second retrieval hits the in-memory cache even without a chain
        let cached = engine.snapshot(None, 5, parent.hash(), None).unwrap();
        assert_eq!(cached.number, 5);
    }

    #[test]
    fn snapshot_uses_supplied_parents() {
        let engine = test_engine();
        let v = addr(0x01);
        engine.initialize_validator(v, 0).unwrap();

        let genesis = Header { number: 0, time: 1_700_000_000, ..Default::default() };
        let block1 = Header {
            number: 1,
            parent_hash: genesis.hash(),
            time: genesis.time + 2,
            coinbase: v,
            ..Default::default()
        };

        let mut chain = MockChain::default();
        chain.insert(genesis.clone());
        // block1 intentionally absent from the chain

        let parents = vec![block1.clone()];
        let snap = engine.snapshot(Some(&chain), 1, block1.hash(), Some(&parents)).unwrap();
        assert_eq!(snap.number, 1);
        assert_eq!(snap.validator_states[&v].blocks_produced, 1);
    }

    #[test]
    fn missing_ancestor_surfaces() {
        let engine = test_engine();
        engine.initialize_validator(addr(0x01), 0).unwrap();

        let chain = MockChain::default();
        let result = engine.snapshot(Some(&chain), 9, B256::repeat_byte(0xbb), None);
        assert_eq!(result.unwrap_err(), PoiError::UnknownAncestor);
    }
}
