//! Two-stage import pipeline
//!
//! The pipeline is responsible for:
//! - Setting up the cache tables, reference cache and worker pool
//! - Stage 1: dispatching units to import workers
//! - Draining the reference cache between stages
//! - Stage 2: dispatching deferred cross-unit links to resolve workers
//! - Signal handling (stop between items) and final statistics
//! - Dropping every cache table at the end of the run

pub mod synthetic;
pub mod worker;

pub use synthetic::{SyntheticConfig, SyntheticSource, SyntheticUnit, TextureParam};
pub use worker::{
    GroupRow, GroupRows, ImportContext, ImportStats, PipelineWork, PipelineWorker,
    PipelineWorkerFactory,
};

use crate::cache::{CacheTableManager, DeferredLinks, ReferenceCache, SqliteProvider};
use crate::config::PipelineConfig;
use crate::error::{EngineError, Result, WorkOutcome};
use crate::lock::LockRegistry;
use crate::pool::WorkerPool;
use crossbeam_channel::{unbounded, Receiver};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Units submitted between progress callbacks
const PROGRESS_INTERVAL: usize = 256;

/// Pipeline stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Import,
    Resolve,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Import => write!(f, "import"),
            Stage::Resolve => write!(f, "resolve"),
        }
    }
}

/// Point-in-time view of a running pipeline
#[derive(Debug, Clone)]
pub struct ImportProgress {
    pub stage: Stage,
    pub units: u64,
    pub deferred_links: u64,
    pub resolved_links: u64,
    pub queue_len: usize,
    pub pool_size: usize,
    pub active_workers: usize,
    pub elapsed: Duration,
}

impl ImportProgress {
    /// Units imported per second
    pub fn units_per_second(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.units as f64 / secs
        } else {
            0.0
        }
    }
}

/// Result of a completed pipeline run
#[derive(Debug, Clone)]
pub struct ImportResult {
    /// Units imported
    pub units: u64,

    /// Objects registered in the reference cache
    pub objects: u64,

    /// Xlinks resolved inside their unit
    pub local_xlinks: u64,

    /// Cross-unit references deferred to stage 2
    pub deferred_links: u64,

    /// Deferred references resolved through the cache
    pub resolved_links: u64,

    /// Deferred references with no registered target
    pub missing_links: u64,

    /// Units with a circular reference
    pub circular_units: u64,

    /// Rings with compiled texture coordinates
    pub textured_rings: u64,

    /// Shared group row updates
    pub group_updates: u64,

    /// Items processed only partially
    pub partial: u64,

    /// Items abandoned after an error
    pub failed: u64,

    /// Cache entries moved to disk between the stages
    pub drained: u64,

    /// Largest number of concurrent workers
    pub largest_pool_size: usize,

    /// Time taken for the run
    pub duration: Duration,

    /// Whether the run completed (vs was interrupted)
    pub completed: bool,
}

/// Outcome counts collected from the workers' channel
#[derive(Debug, Default)]
struct OutcomeTally {
    success: u64,
    partial: u64,
    failed: u64,
}

impl OutcomeTally {
    fn absorb(&mut self, outcomes: &Receiver<WorkOutcome>) {
        for outcome in outcomes.try_iter() {
            match outcome {
                WorkOutcome::Success { .. } => self.success += 1,
                WorkOutcome::Partial { .. } => self.partial += 1,
                WorkOutcome::Failed { key, reason } => {
                    debug!(key = %key, reason = %reason, "Item failed");
                    self.failed += 1;
                }
            }
        }
    }
}

type PipelinePool = WorkerPool<PipelineWork, PipelineWorkerFactory>;

/// Drives units through import and deferred link resolution
pub struct ImportPipeline {
    config: PipelineConfig,
    registry: Arc<LockRegistry>,
    shutdown: Arc<AtomicBool>,
}

impl ImportPipeline {
    /// Create a pipeline with its own lock registry
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            registry: Arc::new(LockRegistry::new()),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Share a lock registry with other subsystems of the same session
    pub fn with_registry(mut self, registry: Arc<LockRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Get a clone of the shutdown flag (for signal handlers)
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    fn table_manager(&self) -> Result<CacheTableManager> {
        let manager = match &self.config.cache.cache_dir {
            Some(dir) => CacheTableManager::new(Arc::new(SqliteProvider::new(dir)?)),
            None => CacheTableManager::temporary()?,
        };
        Ok(manager)
    }

    /// Run both stages over `units`
    ///
    /// `on_progress` is called from this thread at regular intervals.
    pub fn run<I>(&self, units: I, mut on_progress: impl FnMut(&ImportProgress)) -> Result<ImportResult>
    where
        I: IntoIterator<Item = SyntheticUnit>,
    {
        let start = Instant::now();

        let manager = self.table_manager()?;
        let cache = ReferenceCache::new(&manager, &self.config.cache)?;
        let deferred = DeferredLinks::new(&manager, self.config.deferred_batch_size)?;
        let ctx = Arc::new(ImportContext::new(
            cache,
            deferred,
            self.registry.manager::<GroupRows>(),
        ));

        let (sender, outcomes) = unbounded();
        let pool: PipelinePool = WorkerPool::new(
            &self.config.pool,
            PipelineWorkerFactory::new(Arc::clone(&ctx), sender),
        )?;
        let started = pool.prestart_core_workers();

        info!(
            core = self.config.pool.core_pool_size,
            max = self.config.pool.maximum_pool_size,
            queue = self.config.pool.queue_size,
            partitions = self.config.cache.partitions,
            started,
            "Starting import"
        );

        let mut tally = OutcomeTally::default();
        let mut completed = self.run_import_stage(&pool, &ctx, units, start, &mut on_progress)?;
        pool.join();
        tally.absorb(&outcomes);

        ctx.deferred.flush()?;
        let drained = ctx.cache.drain_all()? as u64;
        info!(
            units = ImportStats::get(&ctx.stats.units),
            deferred = ctx.deferred.len(),
            drained,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Import stage complete"
        );
        on_progress(&snapshot(Stage::Import, &ctx, &pool, start));

        if completed {
            completed = self.run_resolve_stage(&pool, &ctx, start, &mut on_progress)?;
            pool.join();
            tally.absorb(&outcomes);
        }

        if completed {
            pool.shutdown_and_wait();
        } else {
            let undispatched = pool.shutdown_now();
            warn!(undispatched = undispatched.len(), "Pipeline interrupted");
            pool.await_termination();
        }
        tally.absorb(&outcomes);

        let largest_pool_size = pool.largest_pool_size();
        drop(pool);

        ctx.deferred.drop_table()?;
        ctx.cache.drop_tables()?;

        let stats = &ctx.stats;
        let result = ImportResult {
            units: ImportStats::get(&stats.units),
            objects: ImportStats::get(&stats.objects),
            local_xlinks: ImportStats::get(&stats.local_xlinks),
            deferred_links: ImportStats::get(&stats.deferred_links),
            resolved_links: ImportStats::get(&stats.resolved_links),
            missing_links: ImportStats::get(&stats.missing_links),
            circular_units: ImportStats::get(&stats.circular_units),
            textured_rings: ImportStats::get(&stats.textured_rings),
            group_updates: ImportStats::get(&stats.group_updates),
            partial: tally.partial,
            failed: tally.failed,
            drained,
            largest_pool_size,
            duration: start.elapsed(),
            completed,
        };

        info!(
            units = result.units,
            resolved = result.resolved_links,
            missing = result.missing_links,
            failed = result.failed,
            duration_secs = result.duration.as_secs(),
            "Import completed"
        );

        Ok(result)
    }

    /// Returns false if interrupted before every unit was submitted
    fn run_import_stage<I>(
        &self,
        pool: &PipelinePool,
        ctx: &Arc<ImportContext>,
        units: I,
        start: Instant,
        on_progress: &mut impl FnMut(&ImportProgress),
    ) -> Result<bool>
    where
        I: IntoIterator<Item = SyntheticUnit>,
    {
        for (n, unit) in units.into_iter().enumerate() {
            if self.is_shutdown() {
                info!(submitted = n, "Shutdown signal received");
                return Ok(false);
            }

            pool.add_work(PipelineWork::Import(unit))?;

            if (n + 1) % PROGRESS_INTERVAL == 0 {
                on_progress(&snapshot(Stage::Import, ctx, pool, start));
            }
        }
        Ok(true)
    }

    /// Returns false if interrupted before every link was submitted
    fn run_resolve_stage(
        &self,
        pool: &PipelinePool,
        ctx: &Arc<ImportContext>,
        start: Instant,
        on_progress: &mut impl FnMut(&ImportProgress),
    ) -> Result<bool> {
        let batch_size = self.config.deferred_batch_size;

        let read = ctx.deferred.for_each_batch(batch_size, |links| -> Result<()> {
            for link in links {
                if self.is_shutdown() {
                    return Err(EngineError::Interrupted);
                }
                pool.add_work(PipelineWork::Resolve(link))?;
            }
            on_progress(&snapshot(Stage::Resolve, ctx, pool, start));
            Ok(())
        });

        match read {
            Ok(links) => {
                debug!(links, "Dispatched deferred links");
                Ok(true)
            }
            Err(EngineError::Interrupted) => {
                info!("Shutdown signal received");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}

fn snapshot(stage: Stage, ctx: &ImportContext, pool: &PipelinePool, start: Instant) -> ImportProgress {
    ImportProgress {
        stage,
        units: ImportStats::get(&ctx.stats.units),
        deferred_links: ImportStats::get(&ctx.stats.deferred_links),
        resolved_links: ImportStats::get(&ctx.stats.resolved_links)
            + ImportStats::get(&ctx.stats.missing_links),
        queue_len: pool.queue_len(),
        pool_size: pool.pool_size(),
        active_workers: pool.active_count(),
        elapsed: start.elapsed(),
    }
}
