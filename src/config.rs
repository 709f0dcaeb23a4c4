//! Configuration types for refstream
//!
//! This module defines:
//! - CLI argument parsing using clap derive macros
//! - Runtime configuration for the worker pool, reference cache and
//!   import pipeline, with validation

use crate::error::ConfigError;
use clap::{Parser, ValueEnum};
use std::path::PathBuf;

/// Maximum reasonable worker count
pub const MAX_WORKERS: usize = 512;

/// Minimum queue size
const MIN_QUEUE_SIZE: usize = 1;

/// Maximum number of cache partitions
pub const MAX_PARTITIONS: usize = 256;

/// Batch size limits
const MIN_BATCH_SIZE: usize = 1;
const MAX_BATCH_SIZE: usize = 100_000;

/// How the pool shrinks when the worker factory fails to produce a worker
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PoolSizeAdaptation {
    /// Keep the configured bounds, only log the failure
    None,

    /// Decrement the bound the pool was growing toward
    #[default]
    Stepwise,

    /// Collapse the bounds to the current pool size
    Aggressive,
}

/// Worker pool bounds and queue size
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Workers kept alive while work is flowing
    pub core_pool_size: usize,

    /// Upper bound, reached only when the queue is full
    pub maximum_pool_size: usize,

    /// Work queue capacity
    pub queue_size: usize,

    /// Shrinking policy on worker creation failure
    pub adaptation: PoolSizeAdaptation,
}

impl PoolConfig {
    /// Create a pool configuration with the default adaptation policy
    pub fn new(core_pool_size: usize, maximum_pool_size: usize, queue_size: usize) -> Self {
        Self {
            core_pool_size,
            maximum_pool_size,
            queue_size,
            adaptation: PoolSizeAdaptation::default(),
        }
    }

    /// Set the adaptation policy
    pub fn with_adaptation(mut self, adaptation: PoolSizeAdaptation) -> Self {
        self.adaptation = adaptation;
        self
    }

    /// Validate pool bounds and queue size
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.maximum_pool_size == 0
            || self.maximum_pool_size > MAX_WORKERS
            || self.core_pool_size > self.maximum_pool_size
        {
            return Err(ConfigError::InvalidPoolSize {
                core: self.core_pool_size,
                max: self.maximum_pool_size,
                limit: MAX_WORKERS,
            });
        }

        if self.queue_size < MIN_QUEUE_SIZE {
            return Err(ConfigError::InvalidQueueSize {
                size: self.queue_size,
                min: MIN_QUEUE_SIZE,
            });
        }

        Ok(())
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        let cpus = num_cpus::get();
        Self::new(cpus, cpus * 2, 1000)
    }
}

/// Reference cache sizing
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Number of backing partitions
    pub partitions: usize,

    /// Hot-tier size that triggers an automatic drain
    pub capacity: usize,

    /// Share of `capacity` moved to the cold tier per automatic drain
    pub drain_factor: f64,

    /// Rows per batched insert
    pub batch_size: usize,

    /// Directory for the cache database (a temporary one when unset)
    pub cache_dir: Option<PathBuf>,
}

impl CacheConfig {
    /// Number of entries moved by one automatic drain
    pub fn drain_size(&self) -> usize {
        ((self.capacity as f64 * self.drain_factor).ceil() as usize).max(1)
    }

    /// Validate cache sizing
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.partitions == 0 || self.partitions > MAX_PARTITIONS {
            return Err(ConfigError::InvalidPartitions {
                count: self.partitions,
                max: MAX_PARTITIONS,
            });
        }

        if self.batch_size < MIN_BATCH_SIZE || self.batch_size > MAX_BATCH_SIZE {
            return Err(ConfigError::InvalidBatchSize {
                size: self.batch_size,
                min: MIN_BATCH_SIZE,
                max: MAX_BATCH_SIZE,
            });
        }

        if !(self.drain_factor > 0.0 && self.drain_factor <= 1.0) {
            return Err(ConfigError::InvalidDrainFactor(self.drain_factor));
        }

        if let Some(dir) = &self.cache_dir {
            if !dir.is_dir() {
                return Err(ConfigError::InvalidCacheDir {
                    path: dir.clone(),
                    reason: "Not an existing directory".to_string(),
                });
            }
        }

        Ok(())
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            partitions: 10,
            capacity: 10_000,
            drain_factor: 0.1,
            batch_size: 1000,
            cache_dir: None,
        }
    }
}

/// Streaming import/export demo driven by synthetic units
#[derive(Parser, Debug, Clone)]
#[command(
    name = "refstream",
    version,
    about = "Concurrent worker pool and cross-reference cache for streaming imports",
    long_about = "Runs a two-stage import over synthetic units: stage one stores units in \
                  parallel and registers their ids in the reference cache, stage two \
                  resolves deferred cross-unit references against the cache.",
    after_help = "EXAMPLES:\n    \
        refstream --units 100000 -p\n    \
        refstream --core-workers 2 --max-workers 4 --queue-size 16\n    \
        refstream --partitions 16 --cache-capacity 5000 --cache-dir /tmp/cache"
)]
pub struct CliArgs {
    /// Number of synthetic units to import
    #[arg(short = 'n', long, default_value = "10000", value_name = "NUM")]
    pub units: usize,

    /// Core pool size
    #[arg(long, default_value_t = num_cpus::get(), value_name = "NUM")]
    pub core_workers: usize,

    /// Maximum pool size
    #[arg(long, default_value_t = num_cpus::get() * 2, value_name = "NUM")]
    pub max_workers: usize,

    /// Work queue size
    #[arg(long, default_value = "1000", value_name = "NUM")]
    pub queue_size: usize,

    /// Pool shrinking policy on worker creation failure
    #[arg(long, value_enum, default_value_t = PoolSizeAdaptation::Stepwise)]
    pub adaptation: PoolSizeAdaptation,

    /// Number of reference cache partitions
    #[arg(long, default_value = "10", value_name = "NUM")]
    pub partitions: usize,

    /// Hot-tier capacity before entries are drained to disk
    #[arg(long, default_value = "10000", value_name = "NUM")]
    pub cache_capacity: usize,

    /// Share of the capacity drained at once
    #[arg(long, default_value = "0.1", value_name = "FACTOR")]
    pub drain_factor: f64,

    /// Rows per batched cache insert
    #[arg(short = 'b', long, default_value = "1000", value_name = "NUM")]
    pub batch_size: usize,

    /// Directory for cache tables (temporary directory if not set)
    #[arg(long, value_name = "DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Seed for the synthetic unit generator
    #[arg(long, default_value = "42", value_name = "NUM")]
    pub seed: u64,

    /// Show a progress spinner
    #[arg(short = 'p', long)]
    pub progress: bool,

    /// Quiet mode - suppress the summary
    #[arg(short = 'q', long)]
    pub quiet: bool,

    /// Verbose output (debug logging)
    #[arg(short = 'v', long)]
    pub verbose: bool,
}

/// Validated configuration for the import pipeline
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Pool used for both pipeline stages
    pub pool: PoolConfig,

    /// Reference cache sizing
    pub cache: CacheConfig,

    /// Deferred links read back per batch in the resolve stage
    pub deferred_batch_size: usize,

    /// Number of synthetic units
    pub units: usize,

    /// Seed for the synthetic unit generator
    pub seed: u64,

    /// Show progress indicator
    pub show_progress: bool,

    /// Print the final summary
    pub show_summary: bool,

    /// Verbose logging
    pub verbose: bool,
}

impl PipelineConfig {
    /// Create and validate configuration from CLI arguments
    pub fn from_args(args: CliArgs) -> Result<Self, ConfigError> {
        let pool = PoolConfig::new(args.core_workers, args.max_workers, args.queue_size)
            .with_adaptation(args.adaptation);
        pool.validate()?;

        let cache = CacheConfig {
            partitions: args.partitions,
            capacity: args.cache_capacity,
            drain_factor: args.drain_factor,
            batch_size: args.batch_size,
            cache_dir: args.cache_dir,
        };
        cache.validate()?;

        Ok(Self {
            pool,
            deferred_batch_size: cache.batch_size,
            cache,
            units: args.units,
            seed: args.seed,
            show_progress: args.progress && !args.quiet,
            show_summary: !args.quiet,
            verbose: args.verbose,
        })
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            cache: CacheConfig::default(),
            deferred_batch_size: 1000,
            units: 1000,
            seed: 42,
            show_progress: false,
            show_summary: false,
            verbose: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(extra: &[&str]) -> CliArgs {
        let mut argv = vec!["refstream"];
        argv.extend_from_slice(extra);
        CliArgs::parse_from(argv)
    }

    #[test]
    fn test_pool_config_validation() {
        assert!(PoolConfig::new(2, 4, 16).validate().is_ok());
        assert!(PoolConfig::new(0, 1, 1).validate().is_ok());

        assert!(matches!(
            PoolConfig::new(4, 2, 16).validate(),
            Err(ConfigError::InvalidPoolSize { .. })
        ));
        assert!(matches!(
            PoolConfig::new(0, 0, 16).validate(),
            Err(ConfigError::InvalidPoolSize { .. })
        ));
        assert!(matches!(
            PoolConfig::new(1, 1, 0).validate(),
            Err(ConfigError::InvalidQueueSize { .. })
        ));
    }

    #[test]
    fn test_cache_config_validation() {
        let mut config = CacheConfig::default();
        assert!(config.validate().is_ok());

        config.partitions = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidPartitions { .. })
        ));

        config.partitions = 4;
        config.drain_factor = 1.5;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidDrainFactor(_))
        ));
    }

    #[test]
    fn test_drain_size() {
        let config = CacheConfig {
            capacity: 1000,
            drain_factor: 0.25,
            ..CacheConfig::default()
        };
        assert_eq!(config.drain_size(), 250);

        let tiny = CacheConfig {
            capacity: 1,
            drain_factor: 0.1,
            ..CacheConfig::default()
        };
        assert_eq!(tiny.drain_size(), 1);
    }

    #[test]
    fn test_from_args() {
        let config = PipelineConfig::from_args(args(&[
            "--core-workers",
            "2",
            "--max-workers",
            "4",
            "--queue-size",
            "16",
            "--adaptation",
            "aggressive",
            "-q",
        ]))
        .unwrap();

        assert_eq!(config.pool.core_pool_size, 2);
        assert_eq!(config.pool.maximum_pool_size, 4);
        assert_eq!(config.pool.queue_size, 16);
        assert_eq!(config.pool.adaptation, PoolSizeAdaptation::Aggressive);
        assert!(!config.show_summary);
        assert!(!config.show_progress);
    }

    #[test]
    fn test_from_args_rejects_bad_bounds() {
        let result = PipelineConfig::from_args(args(&["--core-workers", "8", "--max-workers", "2"]));
        assert!(result.is_err());
    }
}
