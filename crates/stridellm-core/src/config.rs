//! Configuration types for the StrideLLM serving core
//!
//! The core never reads the environment or files. Callers build a fully
//! resolved [`EngineConfig`] (directly, from JSON, or through the `with_*`
//! builders) and hand it over at construction.

use crate::error::{Error, Result};
use crate::types::WorkerId;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Identity of this replica
    pub worker_id: WorkerId,

    /// Number of token IDs the compute step can emit
    pub vocab_size: usize,

    /// Cache pool configuration
    pub cache: CacheConfig,

    /// Scheduler configuration
    pub scheduler: SchedulerConfig,

    /// Speculative decoding configuration
    pub speculative: SpeculativeConfig,

    /// Per-tenant rate limiting (disabled when absent)
    pub rate_limit: Option<RateLimitConfig>,

    /// Channel sizing
    pub intake: IntakeConfig,
}

impl EngineConfig {
    /// Create a configuration for a pool of `num_blocks` blocks
    pub fn new(vocab_size: usize, num_blocks: usize) -> Self {
        Self {
            vocab_size,
            cache: CacheConfig {
                num_blocks,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Set the replica identity
    pub fn with_worker_id(mut self, worker_id: WorkerId) -> Self {
        self.worker_id = worker_id;
        self
    }

    /// Set tokens per block
    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.cache.block_size = block_size;
        self
    }

    /// Set the snapshot compression codec
    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.cache.snapshot.compression = compression;
        self
    }

    /// Enable speculation with the given tree shape
    pub fn with_speculation(mut self, width: usize, depth: usize) -> Self {
        self.speculative.enabled = true;
        self.speculative.max_draft_width = width;
        self.speculative.max_draft_depth = depth;
        self
    }

    /// Reserve `blocks` free blocks that only decode admissions may use
    pub fn with_decode_reserve(mut self, blocks: usize) -> Self {
        self.scheduler.placement.decode_reserved_blocks = Some(blocks);
        self
    }

    /// Cap the prompt tokens newly admitted prefill work feeds per tick
    pub fn with_prefill_token_budget(mut self, tokens: usize) -> Self {
        self.scheduler.placement.max_prefill_tokens_per_tick = tokens;
        self
    }

    /// Enable per-tenant rate limiting
    pub fn with_rate_limit(mut self, window: Duration, max_tokens: usize) -> Self {
        self.rate_limit = Some(RateLimitConfig {
            window_secs: window.as_secs_f64(),
            max_tokens_per_window: max_tokens,
        });
        self
    }

    /// Check the configuration for values the core cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.vocab_size == 0 {
            return Err(Error::InvalidConfig("vocab_size must be positive".into()));
        }
        self.cache.validate()?;
        self.scheduler.validate(&self.cache)?;
        self.speculative.validate()?;
        if let Some(rate_limit) = &self.rate_limit {
            rate_limit.validate()?;
        }
        self.intake.validate()
    }
}

/// Paged cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Tokens per block (power of two)
    pub block_size: usize,

    /// Number of blocks in the pool
    pub num_blocks: usize,

    /// Share full prompt blocks with equal content hashes
    pub enable_prefix_caching: bool,

    /// Eviction snapshot storage
    pub snapshot: SnapshotConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            block_size: 16,
            num_blocks: 1024,
            enable_prefix_caching: true,
            snapshot: SnapshotConfig::default(),
        }
    }
}

impl CacheConfig {
    fn validate(&self) -> Result<()> {
        if self.block_size == 0 || !self.block_size.is_power_of_two() {
            return Err(Error::InvalidConfig(format!(
                "block_size must be a power of two, got {}",
                self.block_size
            )));
        }
        if self.num_blocks == 0 {
            return Err(Error::InvalidConfig("num_blocks must be positive".into()));
        }
        if let Compression::Zstd { level } = self.snapshot.compression {
            if !(1..=22).contains(&level) {
                return Err(Error::InvalidConfig(format!(
                    "zstd level must be in 1..=22, got {level}"
                )));
            }
        }
        Ok(())
    }

    /// Total token capacity of the pool
    pub fn token_capacity(&self) -> usize {
        self.block_size * self.num_blocks
    }
}

/// Eviction snapshot storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    /// Byte budget for held snapshots; oldest are dropped beyond it
    pub capacity_bytes: usize,

    /// Codec applied to snapshot payloads
    pub compression: Compression,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            capacity_bytes: 64 * 1024 * 1024,
            compression: Compression::Zstd { level: 3 },
        }
    }
}

/// Snapshot codec
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "codec", rename_all = "lowercase")]
pub enum Compression {
    /// Store token content as-is
    None,
    /// zstd at the given level
    Zstd {
        /// zstd compression level
        level: i32,
    },
}

/// Scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maximum number of running sequences
    pub max_num_seqs: usize,

    /// Maximum number of waiting sequences across both queues
    pub max_waiting: usize,

    /// Allow higher-priority work to preempt running sequences
    pub enable_preemption: bool,

    /// Prefill/decode capacity split
    pub placement: PlacementConfig,

    /// Retry policy for failed migrations
    pub migration_backoff: BackoffConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_num_seqs: 256,
            max_waiting: 4096,
            enable_preemption: true,
            placement: PlacementConfig::default(),
            migration_backoff: BackoffConfig::default(),
        }
    }
}

impl SchedulerConfig {
    fn validate(&self, cache: &CacheConfig) -> Result<()> {
        if self.max_num_seqs == 0 {
            return Err(Error::InvalidConfig("max_num_seqs must be positive".into()));
        }
        let reserve = self.placement.decode_reserve(cache.num_blocks);
        if reserve >= cache.num_blocks {
            return Err(Error::InvalidConfig(format!(
                "decode_reserved_blocks ({}) must be smaller than the pool ({})",
                reserve, cache.num_blocks
            )));
        }
        if self.placement.max_prefill_tokens_per_tick == 0 {
            return Err(Error::InvalidConfig(
                "max_prefill_tokens_per_tick must be positive".into(),
            ));
        }
        self.migration_backoff.validate()
    }
}

/// Independent capacity pools for prefill and decode work
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlacementConfig {
    /// Prompt tokens that newly admitted prefill work may process per tick
    pub max_prefill_tokens_per_tick: usize,

    /// Free blocks that prefill admissions may not consume. Unset means
    /// 1/32 of the pool.
    pub decode_reserved_blocks: Option<usize>,
}

impl Default for PlacementConfig {
    fn default() -> Self {
        Self {
            max_prefill_tokens_per_tick: 8192,
            decode_reserved_blocks: None,
        }
    }
}

impl PlacementConfig {
    /// Decode reserve for a pool of `num_blocks`
    pub fn decode_reserve(&self, num_blocks: usize) -> usize {
        self.decode_reserved_blocks.unwrap_or(num_blocks / 32)
    }
}

/// Exponential backoff policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Delay before the first retry in milliseconds
    pub initial_ms: u64,

    /// Upper bound on the delay in milliseconds
    pub max_ms: u64,

    /// Growth factor per attempt
    pub multiplier: f64,

    /// Attempts before giving up
    pub max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: 50,
            max_ms: 5_000,
            multiplier: 2.0,
            max_attempts: 5,
        }
    }
}

impl BackoffConfig {
    /// Delay before retry number `attempt` (1-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self
            .multiplier
            .powi(attempt.saturating_sub(1).min(i32::MAX as u32) as i32);
        let ms = (self.initial_ms as f64 * exp).min(self.max_ms as f64);
        Duration::from_millis(ms as u64)
    }

    fn validate(&self) -> Result<()> {
        if self.multiplier < 1.0 {
            return Err(Error::InvalidConfig(
                "backoff multiplier must be at least 1.0".into(),
            ));
        }
        if self.initial_ms > self.max_ms {
            return Err(Error::InvalidConfig(
                "backoff initial_ms exceeds max_ms".into(),
            ));
        }
        Ok(())
    }
}

/// Speculative decoding configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeculativeConfig {
    /// Attach draft trees to eligible sequences
    pub enabled: bool,

    /// Maximum children per tree node
    pub max_draft_width: usize,

    /// Maximum tree depth
    pub max_draft_depth: usize,

    /// Longest n-gram the prompt-lookup proposer matches
    pub ngram_max: usize,

    /// Adjust depth from the observed acceptance rate
    pub adaptive: bool,

    /// Lower bound for adaptive depth
    pub min_draft_depth: usize,

    /// Acceptance rate the adaptive controller steers towards
    pub target_acceptance_rate: f32,
}

impl Default for SpeculativeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_draft_width: 2,
            max_draft_depth: 4,
            ngram_max: 3,
            adaptive: true,
            min_draft_depth: 1,
            target_acceptance_rate: 0.6,
        }
    }
}

impl SpeculativeConfig {
    fn validate(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        if self.max_draft_width == 0 || self.max_draft_depth == 0 {
            return Err(Error::InvalidConfig(
                "draft width and depth must be positive when speculation is enabled".into(),
            ));
        }
        if self.min_draft_depth == 0 || self.min_draft_depth > self.max_draft_depth {
            return Err(Error::InvalidConfig(format!(
                "min_draft_depth must be in 1..={}",
                self.max_draft_depth
            )));
        }
        if self.ngram_max == 0 {
            return Err(Error::InvalidConfig("ngram_max must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.target_acceptance_rate) {
            return Err(Error::InvalidConfig(
                "target_acceptance_rate must be in [0, 1]".into(),
            ));
        }
        Ok(())
    }
}

/// Sliding-window token budget per tenant
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Window length in seconds
    pub window_secs: f64,

    /// Tokens a tenant may submit within one window
    pub max_tokens_per_window: usize,
}

impl RateLimitConfig {
    /// Window length
    pub fn window(&self) -> Duration {
        Duration::from_secs_f64(self.window_secs)
    }

    fn validate(&self) -> Result<()> {
        if !(self.window_secs.is_finite() && self.window_secs > 0.0) {
            return Err(Error::InvalidConfig("window_secs must be positive".into()));
        }
        if self.max_tokens_per_window == 0 {
            return Err(Error::InvalidConfig(
                "max_tokens_per_window must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Channel sizing for request intake and telemetry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IntakeConfig {
    /// Capacity of the submission/cancellation channel
    pub channel_capacity: usize,

    /// Capacity of the tick summary channel
    pub telemetry_capacity: usize,

    /// Capacity of the migration inbox
    pub migration_inbox_capacity: usize,
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
            telemetry_capacity: 256,
            migration_inbox_capacity: 64,
        }
    }
}

impl IntakeConfig {
    fn validate(&self) -> Result<()> {
        if self.channel_capacity == 0
            || self.telemetry_capacity == 0
            || self.migration_inbox_capacity == 0
        {
            return Err(Error::InvalidConfig(
                "channel capacities must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_builder() {
        let config = EngineConfig::new(32_000, 12)
            .with_block_size(8)
            .with_worker_id(WorkerId(3))
            .with_speculation(2, 3);

        assert_eq!(config.cache.num_blocks, 12);
        assert_eq!(config.cache.block_size, 8);
        assert_eq!(config.worker_id, WorkerId(3));
        assert!(config.speculative.enabled);
        assert_eq!(config.speculative.max_draft_depth, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_bad_block_size() {
        let config = EngineConfig::new(100, 8).with_block_size(12);
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_oversized_reserve() {
        let mut config = EngineConfig::new(100, 8);
        config.scheduler.placement.decode_reserved_blocks = Some(8);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_default_decode_reserve_scales_with_pool() {
        let placement = PlacementConfig::default();
        assert_eq!(placement.decode_reserve(1024), 32);
        assert_eq!(placement.decode_reserve(16), 0);
        let config = EngineConfig::new(100, 64).with_decode_reserve(5);
        assert_eq!(config.scheduler.placement.decode_reserve(64), 5);
        assert!(EngineConfig::new(100, 1).validate().is_ok());
    }

    #[test]
    fn test_rejects_zero_width_when_enabled() {
        let config = EngineConfig::new(100, 8).with_speculation(0, 3);
        assert!(config.validate().is_err());

        let mut disabled = EngineConfig::new(100, 8);
        disabled.speculative.max_draft_width = 0;
        assert!(disabled.validate().is_ok());
    }

    #[test]
    fn test_backoff_delay() {
        let backoff = BackoffConfig {
            initial_ms: 10,
            max_ms: 100,
            multiplier: 2.0,
            max_attempts: 5,
        };
        assert_eq!(backoff.delay(1), Duration::from_millis(10));
        assert_eq!(backoff.delay(3), Duration::from_millis(40));
        assert_eq!(backoff.delay(10), Duration::from_millis(100));
    }

    #[test]
    fn test_config_from_json() {
        let config: EngineConfig = serde_json::from_str(
            r#"{
                "vocab_size": 256,
                "cache": {"block_size": 4, "num_blocks": 12, "snapshot": {"compression": {"codec": "none"}}},
                "rate_limit": {"window_secs": 1.5, "max_tokens_per_window": 100}
            }"#,
        )
        .unwrap();
        assert_eq!(config.cache.block_size, 4);
        assert_eq!(config.cache.snapshot.compression, Compression::None);
        assert!(config.cache.enable_prefix_caching);
        assert_eq!(
            config.rate_limit.as_ref().unwrap().window(),
            Duration::from_millis(1500)
        );
        assert!(config.validate().is_ok());
    }
}
