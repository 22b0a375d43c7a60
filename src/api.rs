//! Operator surface for the PoI engine.
//!
//! [`PoiApi`] bundles the read and write operations operators and tests
//! drive directly; [`PoiRpc`] exposes the same operations as the `poi`
//! JSON-RPC namespace.

use crate::database::KeyValueStore;
use crate::engine::Poi;
use crate::header::ChainHeaderReader;
use crate::{
    PoiError, BOOST_EPOCH, BOOST_FACTOR, CONSECUTIVE_LIMIT, COOLDOWN_BLOCKS, DECAY_EPOCH_SIZE,
    DECAY_FACTOR, DEFAULT_REPUTATION, SLIDING_WINDOW_PERCENT,
};
use alloy_primitives::Address;
use jsonrpsee::core::{async_trait, RpcResult};
use jsonrpsee::proc_macros::rpc;
use jsonrpsee::types::{ErrorObject, ErrorObjectOwned};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// A validator's position in the PoI ranking.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidatorRanking {
    /// Validator address.
    pub validator: Address,
    /// 1-based rank by PoI score.
    pub rank: usize,
    /// Combined PoI score.
    pub poi_score: f64,
    /// Reputation component.
    pub reputation: f64,
    /// Performance component.
    pub performance: f64,
}

/// Election algorithm constants exposed to callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlgorithmParams {
    pub alpha: f64,
    pub beta: f64,
    pub decay_epoch_size: u64,
    pub decay_factor: f64,
    pub boost_epoch: u64,
    pub boost_factor: f64,
    pub cooldown_blocks: u64,
    pub consecutive_limit: u64,
    pub sliding_window_percent: f64,
    pub default_reputation: f64,
}

/// Aggregate network statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkStats {
    pub total_validators: usize,
    pub active_validators: usize,
    pub cooldown_validators: usize,
    pub average_reputation: f64,
    pub average_performance: f64,
}

/// Counters for a validator over a block window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidatorHistory {
    pub validator: Address,
    pub from_block: u64,
    pub to_block: u64,
    pub blocks_produced: u64,
    pub total_transactions: u64,
    pub successful_transactions: u64,
    pub penalties: u64,
    /// Observed uptime in seconds.
    pub up_time: u64,
}

/// Combined state and score view of one validator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidatorFullInfo {
    pub address: Address,
    pub poi_score: f64,
    pub reputation: f64,
    pub performance: f64,
    pub blocks_produced: u64,
    pub last_active_block: u64,
    pub consecutive_blocks: u64,
    #[serde(rename = "cooldownUntilBlock")]
    pub cooldown_until: u64,
    pub up_time: String,
    #[serde(rename = "totalTransactions")]
    pub total_tx: u64,
    pub successful_tx: u64,
    pub penalties: u64,
    pub is_active: bool,
}

/// Operator and test surface over a shared engine.
pub struct PoiApi<DB> {
    poi: Arc<Poi<DB>>,
    chain: Arc<dyn ChainHeaderReader>,
}

impl<DB: KeyValueStore> PoiApi<DB> {
    /// Create the surface around an engine and a chain reader.
    pub fn new(poi: Arc<Poi<DB>>, chain: Arc<dyn ChainHeaderReader>) -> Self {
        Self { poi, chain }
    }

    /// All validators ranked by PoI score, descending, ranks 1-based.
    pub fn validator_ranking(&self) -> Vec<ValidatorRanking> {
        let mut rankings: Vec<ValidatorRanking> = self
            .poi
            .get_validators()
            .into_iter()
            .map(|validator| ValidatorRanking {
                validator,
                rank: 0,
                poi_score: self.poi.poi_score(validator),
                reputation: self.poi.get_reputation(validator),
                performance: self.poi.get_performance(validator),
            })
            .collect();

        rankings.sort_by(|a, b| {
            b.poi_score
                .partial_cmp(&a.poi_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.validator.cmp(&b.validator))
        });
        for (i, ranking) in rankings.iter_mut().enumerate() {
            ranking.rank = i + 1;
        }
        rankings
    }

    /// The top `n` validators by PoI score; `n` is clamped to the set size.
    pub fn top_validators(&self, n: usize) -> Vec<ValidatorRanking> {
        let mut rankings = self.validator_ranking();
        rankings.truncate(n);
        rankings
    }

    /// Predict the validator for the next block height.
    pub fn next_validator(&self) -> Result<Address, PoiError> {
        let header = self.chain.current_header().ok_or(PoiError::UnknownBlock)?;
        self.poi.select_validator(header.number + 1)
    }

    /// Validators that are active and out of cooldown at the current
    /// height.
    pub fn eligible_validators(&self) -> Result<Vec<Address>, PoiError> {
        let header = self.chain.current_header().ok_or(PoiError::UnknownBlock)?;
        Ok(self.poi.eligible_validators(header.number))
    }

    /// The election algorithm constants.
    pub fn algorithm_params(&self) -> AlgorithmParams {
        AlgorithmParams {
            alpha: self.poi.alpha(),
            beta: self.poi.beta(),
            decay_epoch_size: DECAY_EPOCH_SIZE,
            decay_factor: DECAY_FACTOR,
            boost_epoch: BOOST_EPOCH,
            boost_factor: BOOST_FACTOR,
            cooldown_blocks: COOLDOWN_BLOCKS,
            consecutive_limit: CONSECUTIVE_LIMIT,
            sliding_window_percent: SLIDING_WINDOW_PERCENT,
            default_reputation: DEFAULT_REPUTATION,
        }
    }

    /// Aggregate counts and score averages over the validator set.
    pub fn stats(&self) -> NetworkStats {
        let current_block =
            self.chain.current_header().map(|h| h.number).unwrap_or_default();
        let states = self.poi.validator_states();

        let mut stats = NetworkStats {
            total_validators: states.len(),
            active_validators: 0,
            cooldown_validators: 0,
            average_reputation: 0.0,
            average_performance: 0.0,
        };

        let mut total_reputation = 0.0;
        let mut total_performance = 0.0;
        for state in &states {
            if state.is_active {
                stats.active_validators += 1;
            }
            if state.cooldown_until_block > current_block {
                stats.cooldown_validators += 1;
            }
            total_reputation += self.poi.get_reputation(state.address);
            total_performance += self.poi.get_performance(state.address);
        }

        if !states.is_empty() {
            stats.average_reputation = total_reputation / states.len() as f64;
            stats.average_performance = total_performance / states.len() as f64;
        }
        stats
    }

    /// Historical counters for a validator over `[from_block, to_block]`.
    pub fn validator_history(
        &self,
        validator: Address,
        from_block: u64,
        to_block: u64,
    ) -> Result<ValidatorHistory, PoiError> {
        let state = self
            .poi
            .validator_state(validator)
            .ok_or(PoiError::ValidatorNotFound { validator })?;

        Ok(ValidatorHistory {
            validator,
            from_block,
            to_block,
            blocks_produced: state.blocks_produced,
            total_transactions: state.total_transactions,
            successful_transactions: state.successful_tx,
            penalties: state.penalties,
            up_time: state.up_time.as_secs(),
        })
    }

    /// Combined state and score record for a validator.
    pub fn validator_full_info(&self, validator: Address) -> Result<ValidatorFullInfo, PoiError> {
        let state = self
            .poi
            .validator_state(validator)
            .ok_or(PoiError::ValidatorNotFound { validator })?;

        Ok(ValidatorFullInfo {
            address: validator,
            poi_score: self.poi.poi_score(validator),
            reputation: self.poi.get_reputation(validator),
            performance: self.poi.get_performance(validator),
            blocks_produced: state.blocks_produced,
            last_active_block: state.last_active_block,
            consecutive_blocks: state.consecutive_blocks,
            cooldown_until: state.cooldown_until_block,
            up_time: format!("{:?}", state.up_time),
            total_tx: state.total_transactions,
            successful_tx: state.successful_tx,
            penalties: state.penalties,
            is_active: state.is_active,
        })
    }

    /// Fold a metrics sample into a validator's moving averages.
    pub fn update_performance_metrics(
        &self,
        validator: Address,
        latency: Duration,
        throughput: u64,
        availability: f64,
        bandwidth: u64,
    ) -> Result<(), PoiError> {
        self.poi
            .update_performance_metrics(validator, latency, throughput, availability, bandwidth)
    }

    /// Multiply every stored reputation by the decay factor.
    pub fn trigger_decay(&self) {
        self.poi.decay_all_reputation();
    }

    /// Record one penalty against a validator.
    pub fn add_penalty(&self, validator: Address) -> Result<(), PoiError> {
        self.poi.add_penalty(validator)
    }

    /// Flip a validator's administrative active flag.
    pub fn set_validator_active(&self, validator: Address, active: bool) -> Result<(), PoiError> {
        self.poi.set_validator_active(validator, active)
    }
}

/// The `poi` JSON-RPC namespace.
#[rpc(server, namespace = "poi")]
pub trait PoiRpc {
    /// Validators ranked by PoI score.
    #[method(name = "getValidatorRanking")]
    async fn get_validator_ranking(&self) -> RpcResult<Vec<ValidatorRanking>>;

    /// The top `n` validators by PoI score.
    #[method(name = "getTopValidators")]
    async fn get_top_validators(&self, n: usize) -> RpcResult<Vec<ValidatorRanking>>;

    /// Predicted producer of the next block.
    #[method(name = "getNextValidator")]
    async fn get_next_validator(&self) -> RpcResult<Address>;

    /// Validators eligible for selection at the current height.
    #[method(name = "getEligibleValidators")]
    async fn get_eligible_validators(&self) -> RpcResult<Vec<Address>>;

    /// Election algorithm constants.
    #[method(name = "getAlgorithmParams")]
    async fn get_algorithm_params(&self) -> RpcResult<AlgorithmParams>;

    /// Aggregate network statistics.
    #[method(name = "getStats")]
    async fn get_stats(&self) -> RpcResult<NetworkStats>;

    /// Counters for a validator over a block window.
    #[method(name = "getValidatorHistory")]
    async fn get_validator_history(
        &self,
        validator: Address,
        from_block: u64,
        to_block: u64,
    ) -> RpcResult<ValidatorHistory>;

    /// Combined state and score record for a validator.
    #[method(name = "getValidatorFullInfo")]
    async fn get_validator_full_info(&self, validator: Address)
        -> RpcResult<ValidatorFullInfo>;

    /// Report a performance sample for a validator.
    #[method(name = "updatePerformanceMetrics")]
    async fn update_performance_metrics(
        &self,
        validator: Address,
        latency_ns: u64,
        throughput: u64,
        availability: f64,
        bandwidth: u64,
    ) -> RpcResult<bool>;

    /// Manually decay every reputation.
    #[method(name = "triggerDecay")]
    async fn trigger_decay(&self) -> RpcResult<bool>;

    /// Record one penalty against a validator.
    #[method(name = "addPenalty")]
    async fn add_penalty(&self, validator: Address) -> RpcResult<bool>;

    /// Flip a validator's administrative active flag.
    #[method(name = "setValidatorActive")]
    async fn set_validator_active(&self, validator: Address, active: bool) -> RpcResult<bool>;
}

fn rpc_err(err: PoiError) -> ErrorObjectOwned {
    ErrorObject::owned(-32000, err.to_string(), None::<()>)
}

#[async_trait]
impl<DB: KeyValueStore + 'static> PoiRpcServer for PoiApi<DB> {
    async fn get_validator_ranking(&self) -> RpcResult<Vec<ValidatorRanking>> {
        let rankings = self.validator_ranking();
        debug!(target: "poi::api", count = rankings.len(), "poi_getValidatorRanking");
        Ok(rankings)
    }

    async fn get_top_validators(&self, n: usize) -> RpcResult<Vec<ValidatorRanking>> {
        Ok(self.top_validators(n))
    }

    async fn get_next_validator(&self) -> RpcResult<Address> {
        self.next_validator().map_err(rpc_err)
    }

    async fn get_eligible_validators(&self) -> RpcResult<Vec<Address>> {
        self.eligible_validators().map_err(rpc_err)
    }

    async fn get_algorithm_params(&self) -> RpcResult<AlgorithmParams> {
        Ok(self.algorithm_params())
    }

    async fn get_stats(&self) -> RpcResult<NetworkStats> {
        Ok(self.stats())
    }

    async fn get_validator_history(
        &self,
        validator: Address,
        from_block: u64,
        to_block: u64,
    ) -> RpcResult<ValidatorHistory> {
        self.validator_history(validator, from_block, to_block).map_err(rpc_err)
    }

    async fn get_validator_full_info(
        &self,
        validator: Address,
    ) -> RpcResult<ValidatorFullInfo> {
        self.validator_full_info(validator).map_err(rpc_err)
    }

    async fn update_performance_metrics(
        &self,
        validator: Address,
        latency_ns: u64,
        throughput: u64,
        availability: f64,
        bandwidth: u64,
    ) -> RpcResult<bool> {
        self.update_performance_metrics(
            validator,
            Duration::from_nanos(latency_ns),
            throughput,
            availability,
            bandwidth,
        )
        .map_err(rpc_err)?;
        Ok(true)
    }

    async fn trigger_decay(&self) -> RpcResult<bool> {
        PoiApi::trigger_decay(self);
        Ok(true)
    }

    async fn add_penalty(&self, validator: Address) -> RpcResult<bool> {
        PoiApi::add_penalty(self, validator).map_err(rpc_err)?;
        Ok(true)
    }

    async fn set_validator_active(&self, validator: Address, active: bool) -> RpcResult<bool> {
        PoiApi::set_validator_active(self, validator, active).map_err(rpc_err)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::MemoryKeyValueStore;
    use crate::header::Header;
    use crate::snapshot::PoiConfig;
    use crate::{BOOST_FACTOR, DEFAULT_REPUTATION};
    use alloy_primitives::B256;
    use parking_lot::RwLock;

    struct FixedChain {
        head: RwLock<Option<Header>>,
    }

    impl FixedChain {
        fn at_height(number: u64) -> Arc<Self> {
            let head = Header { number, time: 1_700_000_000, ..Default::default() };
            Arc::new(Self { head: RwLock::new(Some(head)) })
        }

        fn empty() -> Arc<Self> {
            Arc::new(Self { head: RwLock::new(None) })
        }
    }

    impl ChainHeaderReader for FixedChain {
        fn current_header(&self) -> Option<Header> {
            self.head.read().clone()
        }

        fn get_header(&self, _hash: B256, _number: u64) -> Option<Header> {
            None
        }

        fn get_header_by_number(&self, _number: u64) -> Option<Header> {
            None
        }

        fn get_header_by_hash(&self, _hash: B256) -> Option<Header> {
            None
        }
    }

    fn test_api(height: u64) -> (Arc<Poi<MemoryKeyValueStore>>, PoiApi<MemoryKeyValueStore>) {
        let poi = Arc::new(
            Poi::new(PoiConfig::default(), MemoryKeyValueStore::new_arc()).with_rng_seed(7),
        );
        let api = PoiApi::new(Arc::clone(&poi), FixedChain::at_height(height));
        (poi, api)
    }

    fn addr(byte: u8) -> Address {
        Address::repeat_byte(byte)
    }

    #[test]
    fn ranking_sorts_descending_with_ranks() {
        let (poi, api) = test_api(100);
        for (byte, reputation) in [(0x01, 0.2), (0x02, 0.9), (0x03, 0.5)] {
            poi.initialize_validator(addr(byte), 100).unwrap();
            poi.set_reputation(addr(byte), reputation);
        }

        let rankings = api.validator_ranking();
        assert_eq!(rankings.len(), 3);
        assert_eq!(rankings[0].validator, addr(0x02));
        assert_eq!(rankings[1].validator, addr(0x03));
        assert_eq!(rankings[2].validator, addr(0x01));
        assert_eq!(rankings[0].rank, 1);
        assert_eq!(rankings[2].rank, 3);
        assert!(rankings[0].poi_score > rankings[1].poi_score);
    }

    #[test]
    fn top_validators_clamps_to_set_size() {
        let (poi, api) = test_api(100);
        poi.initialize_validator(addr(0x01), 100).unwrap();
        poi.initialize_validator(addr(0x02), 100).unwrap();

        assert_eq!(api.top_validators(1).len(), 1);
        assert_eq!(api.top_validators(10).len(), 2);
        assert!(api.top_validators(0).is_empty());
    }

    #[test]
    fn next_validator_predicts_from_current_height() {
        let (poi, api) = test_api(100);
        let v = addr(0x01);
        poi.initialize_validator(v, 100).unwrap();

        assert_eq!(api.next_validator().unwrap(), v);

        let empty_api = PoiApi::new(poi, FixedChain::empty());
        assert_eq!(empty_api.next_validator(), Err(PoiError::UnknownBlock));
    }

    #[test]
    fn eligible_excludes_cooldown_and_inactive() {
        let (poi, api) = test_api(100);
        let active = addr(0x01);
        let cooling = addr(0x02);
        let disabled = addr(0x03);
        for v in [active, cooling, disabled] {
            poi.initialize_validator(v, 50).unwrap();
        }
        poi.set_cooldown(cooling, 200).unwrap();
        poi.set_validator_active(disabled, false).unwrap();

        let eligible = api.eligible_validators().unwrap();
        assert_eq!(eligible, vec![active]);
    }

    #[test]
    fn stats_aggregates_counts_and_averages() {
        let (poi, api) = test_api(100);
        let a = addr(0x01);
        let b = addr(0x02);
        poi.initialize_validator(a, 50).unwrap();
        poi.initialize_validator(b, 50).unwrap();
        poi.set_cooldown(b, 500).unwrap();
        poi.set_validator_active(b, false).unwrap();

        let stats = api.stats();
        assert_eq!(stats.total_validators, 2);
        assert_eq!(stats.active_validators, 1);
        assert_eq!(stats.cooldown_validators, 1);
        assert!(
            (stats.average_reputation - DEFAULT_REPUTATION * BOOST_FACTOR).abs() < 1e-9
        );
        assert!(stats.average_performance > 0.0);
    }

    #[test]
    fn history_and_full_info_require_known_validator() {
        let (poi, api) = test_api(100);
        let v = addr(0x01);
        let missing = addr(0x99);

        poi.initialize_validator(v, 50).unwrap();
        poi.finalize(v, 60, 12).unwrap();
        poi.add_penalty(v).unwrap();

        let history = api.validator_history(v, 0, 100).unwrap();
        assert_eq!(history.blocks_produced, 1);
        assert_eq!(history.total_transactions, 12);
        assert_eq!(history.successful_transactions, 12);
        assert_eq!(history.penalties, 1);

        let info = api.validator_full_info(v).unwrap();
        assert_eq!(info.address, v);
        assert_eq!(info.blocks_produced, 1);
        assert_eq!(info.last_active_block, 60);
        assert!(info.is_active);
        assert!(info.poi_score > 0.0);

        assert_eq!(
            api.validator_history(missing, 0, 100),
            Err(PoiError::ValidatorNotFound { validator: missing })
        );
        assert_eq!(
            api.validator_full_info(missing),
            Err(PoiError::ValidatorNotFound { validator: missing })
        );
    }

    #[test]
    fn algorithm_params_surface_constants() {
        let (_, api) = test_api(0);
        let params = api.algorithm_params();

        assert_eq!(params.alpha, 0.6);
        assert_eq!(params.beta, 0.4);
        assert_eq!(params.decay_epoch_size, 1000);
        assert_eq!(params.decay_factor, 0.7);
        assert_eq!(params.boost_factor, 1.1);
        assert_eq!(params.cooldown_blocks, 10);
        assert_eq!(params.consecutive_limit, 10);
        assert_eq!(params.sliding_window_percent, 0.4);
        assert_eq!(params.default_reputation, 0.5);
    }

    #[test]
    fn admin_mutations_flow_through() {
        let (poi, api) = test_api(100);
        let v = addr(0x01);
        poi.initialize_validator(v, 50).unwrap();
        poi.set_reputation(v, 0.8);

        api.trigger_decay();
        assert!((poi.stored_reputation(v).unwrap() - 0.56).abs() < 1e-12);

        let before = poi.get_reputation(v);
        api.add_penalty(v).unwrap();
        assert!(poi.get_reputation(v) < before);

        api.set_validator_active(v, false).unwrap();
        assert!(!poi.validator_state(v).unwrap().is_active);

        api.update_performance_metrics(v, Duration::from_millis(50), 200, 0.9, 1 << 20)
            .unwrap();
        assert!(poi.get_performance(v) > 0.0);
    }

    #[tokio::test]
    async fn rpc_surface_maps_errors() {
        let (poi, api) = test_api(100);
        let v = addr(0x01);
        poi.initialize_validator(v, 50).unwrap();

        let stats = PoiRpcServer::get_stats(&api).await.unwrap();
        assert_eq!(stats.total_validators, 1);

        let rankings = PoiRpcServer::get_validator_ranking(&api).await.unwrap();
        assert_eq!(rankings.len(), 1);

        assert!(PoiRpcServer::add_penalty(&api, v).await.unwrap());

        let err = PoiRpcServer::get_validator_full_info(&api, addr(0x99)).await.unwrap_err();
        assert!(err.message().contains("not found"));

        let ok = PoiRpcServer::update_performance_metrics(
            &api,
            v,
            100_000_000, // 100ms in nanoseconds
            500,
            0.95,
            50 << 20,
        )
        .await
        .unwrap();
        assert!(ok);
    }
}
