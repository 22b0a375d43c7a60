//! Per-validator state records and performance metrics.

use alloy_primitives::Address;
use std::time::{Duration, SystemTime};

/// Mutable state tracked for every authorised validator.
#[derive(Debug, Clone)]
pub struct ValidatorState {
    /// Validator identity.
    pub address: Address,
    /// Number of accepted blocks authored.
    pub blocks_produced: u64,
    /// Block number of the last authored block, 0 if none.
    pub last_active_block: u64,
    /// Run of immediately preceding blocks authored by this validator.
    pub consecutive_blocks: u64,
    /// Block number through which the validator is ineligible.
    pub cooldown_until_block: u64,
    /// Instant the validator was first initialised.
    pub start_time: SystemTime,
    /// Time since `start_time`, refreshed at each authored block.
    pub up_time: Duration,
    /// Total transactions included in authored blocks.
    pub total_transactions: u64,
    /// Successful transactions included in authored blocks.
    pub successful_tx: u64,
    /// Accumulated penalties, each reduces reputation.
    pub penalties: u64,
    /// Administrative on/off flag.
    pub is_active: bool,
}

impl ValidatorState {
    /// Fresh state for a validator first seen at `block_number`.
    pub fn new(address: Address, block_number: u64) -> Self {
        Self {
            address,
            blocks_produced: 0,
            last_active_block: block_number,
            consecutive_blocks: 0,
            cooldown_until_block: 0,
            start_time: SystemTime::now(),
            up_time: Duration::ZERO,
            total_transactions: 0,
            successful_tx: 0,
            penalties: 0,
            is_active: true,
        }
    }
}

/// Operational metrics reported for a validator.
#[derive(Debug, Clone, PartialEq)]
pub struct PerformanceMetrics {
    /// Observed request latency.
    pub latency: Duration,
    /// Transactions per second.
    pub throughput: f64,
    /// Availability ratio in `[0, 1]`.
    pub availability: f64,
    /// Bandwidth in bytes per second.
    pub bandwidth: f64,
    /// Instant of the last sample.
    pub last_updated: SystemTime,
}

impl PerformanceMetrics {
    /// Nominal metrics assigned before the first real sample arrives.
    pub fn baseline() -> Self {
        Self {
            latency: Duration::from_secs(1),
            throughput: 100.0,
            availability: 1.0,
            bandwidth: 10.0 * 1024.0 * 1024.0,
            last_updated: SystemTime::now(),
        }
    }

    /// Fold a new sample into the metrics with a 0.5-weight moving average
    /// per field.
    pub fn update_sample(
        &mut self,
        latency: Duration,
        throughput: f64,
        availability: f64,
        bandwidth: f64,
    ) {
        self.latency =
            Duration::from_secs_f64((self.latency.as_secs_f64() + latency.as_secs_f64()) / 2.0);
        self.throughput = (self.throughput + throughput) / 2.0;
        self.availability = (self.availability + availability) / 2.0;
        self.bandwidth = (self.bandwidth + bandwidth) / 2.0;
        self.last_updated = SystemTime::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_state_defaults() {
        let addr = Address::repeat_byte(0x01);
        let state = ValidatorState::new(addr, 100);

        assert_eq!(state.address, addr);
        assert_eq!(state.blocks_produced, 0);
        assert_eq!(state.last_active_block, 100);
        assert_eq!(state.consecutive_blocks, 0);
        assert_eq!(state.cooldown_until_block, 0);
        assert_eq!(state.penalties, 0);
        assert!(state.is_active);
        assert!(state.successful_tx <= state.total_transactions);
    }

    #[test]
    fn moving_average_stays_strictly_between_samples() {
        let mut metrics = PerformanceMetrics::baseline();
        metrics.latency = Duration::from_millis(100);
        metrics.throughput = 1000.0;
        metrics.availability = 0.99;
        metrics.bandwidth = 100.0 * 1024.0 * 1024.0;

        metrics.update_sample(
            Duration::from_millis(200),
            800.0,
            0.95,
            80.0 * 1024.0 * 1024.0,
        );

        assert!(metrics.latency > Duration::from_millis(100));
        assert!(metrics.latency < Duration::from_millis(200));
        assert!(metrics.throughput > 800.0 && metrics.throughput < 1000.0);
        assert!(metrics.availability > 0.95 && metrics.availability < 0.99);
        assert!(
            metrics.bandwidth > 80.0 * 1024.0 * 1024.0
                && metrics.bandwidth < 100.0 * 1024.0 * 1024.0
        );
    }

    #[test]
    fn baseline_metrics() {
        let metrics = PerformanceMetrics::baseline();
        assert_eq!(metrics.latency, Duration::from_secs(1));
        assert_eq!(metrics.throughput, 100.0);
        assert_eq!(metrics.availability, 1.0);
    }
}
