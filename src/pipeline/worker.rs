//! Pipeline work items and the handler that processes them
//!
//! One handler instance lives on each pool worker. It owns the per-worker
//! resolvers and shares the cache, deferred link store and group rows with
//! every other worker through [`ImportContext`].

use crate::cache::{CacheEntry, DeferredLink, DeferredLinks, ReferenceCache};
use crate::error::{EngineError, WorkOutcome, WorkerError};
use crate::lock::LockManager;
use crate::pipeline::synthetic::SyntheticUnit;
use crate::pool::{WorkHandler, WorkerFactory};
use crate::resolve::{GeometryKind, GeometryNode, TargetKey, TexCoordAssembler, XlinkResolver};
use crossbeam_channel::Sender;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Object class id of a unit
const UNIT_TYPE_ID: i32 = 26;

/// Item dispatched to pipeline workers
#[derive(Debug)]
pub enum PipelineWork {
    /// Stage 1: import one unit
    Import(SyntheticUnit),

    /// Stage 2: resolve one deferred cross-unit reference
    Resolve(DeferredLink),
}

/// Counters shared by all pipeline workers
#[derive(Debug, Default)]
pub struct ImportStats {
    /// Units imported
    pub units: AtomicU64,

    /// Objects registered in the reference cache
    pub objects: AtomicU64,

    /// Xlinks resolved inside their own unit
    pub local_xlinks: AtomicU64,

    /// References handed to the resolve stage
    pub deferred_links: AtomicU64,

    /// Deferred references found in the cache
    pub resolved_links: AtomicU64,

    /// Deferred references whose target was never registered
    pub missing_links: AtomicU64,

    /// Units whose local resolution hit a circular reference
    pub circular_units: AtomicU64,

    /// Rings that received compiled texture coordinates
    pub textured_rings: AtomicU64,

    /// Rejected texture coordinate lists
    pub texture_errors: AtomicU64,

    /// Shared group row updates
    pub group_updates: AtomicU64,

    /// Items abandoned after an error
    pub failed: AtomicU64,
}

impl ImportStats {
    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }
}

/// A row shared by many units
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupRow {
    pub members: u64,
    pub last_member: i64,
}

/// Group rows updated by read-modify-write
///
/// The store itself only makes single reads and writes atomic; callers
/// serialize updates of one row through the group lock manager.
#[derive(Debug, Default)]
pub struct GroupRows {
    rows: RwLock<HashMap<String, GroupRow>>,
}

impl GroupRows {
    pub fn get(&self, key: &str) -> Option<GroupRow> {
        self.rows.read().get(key).cloned()
    }

    pub fn put(&self, key: &str, row: GroupRow) {
        self.rows.write().insert(key.to_string(), row);
    }

    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sum of members over all rows
    pub fn total_members(&self) -> u64 {
        self.rows.read().values().map(|r| r.members).sum()
    }
}

/// State shared by every worker of one pipeline run
pub struct ImportContext {
    pub cache: ReferenceCache,
    pub deferred: DeferredLinks,
    pub groups: GroupRows,
    pub group_locks: Arc<LockManager>,
    pub stats: ImportStats,
    next_id: AtomicI64,
}

impl ImportContext {
    pub fn new(cache: ReferenceCache, deferred: DeferredLinks, group_locks: Arc<LockManager>) -> Self {
        Self {
            cache,
            deferred,
            groups: GroupRows::default(),
            group_locks,
            stats: ImportStats::default(),
            next_id: AtomicI64::new(1),
        }
    }

    /// Allocate the next database id
    pub fn next_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

fn type_id(kind: GeometryKind) -> i32 {
    match kind {
        GeometryKind::Solid => 1,
        GeometryKind::CompositeSolid => 2,
        GeometryKind::MultiSurface => 3,
        GeometryKind::CompositeSurface => 4,
        GeometryKind::Polygon => 5,
        GeometryKind::LinearRing => 6,
    }
}

/// Handler living on one pool worker
pub struct PipelineWorker {
    id: usize,
    ctx: Arc<ImportContext>,
    outcomes: Sender<WorkOutcome>,
    xlinks: XlinkResolver,
    textures: TexCoordAssembler,
    processed: u64,
}

impl PipelineWorker {
    pub fn new(id: usize, ctx: Arc<ImportContext>, outcomes: Sender<WorkOutcome>) -> Self {
        Self {
            id,
            ctx,
            outcomes,
            xlinks: XlinkResolver::new(),
            textures: TexCoordAssembler::new(),
            processed: 0,
        }
    }

    fn import_unit(&mut self, mut unit: SyntheticUnit) -> Result<WorkOutcome, EngineError> {
        let ctx = Arc::clone(&self.ctx);
        let root_id = ctx.next_id();
        ctx.cache.put(unit.id.clone(), CacheEntry::new(root_id, root_id, UNIT_TYPE_ID))?;

        // Register every identified geometry node under the unit
        let mut registered = Vec::new();
        for root in &unit.geometry {
            root.walk(&mut |node: &GeometryNode| {
                if let Some(id) = &node.id {
                    registered.push((id.clone(), type_id(node.kind)));
                }
            });
        }

        let images: HashMap<&str, &str> = unit
            .textures
            .iter()
            .map(|t| (t.ring_id.as_str(), t.image.as_str()))
            .collect();
        for (gml_id, type_id) in &registered {
            let mut entry = CacheEntry::new(ctx.next_id(), root_id, *type_id);
            if let Some(image) = images.get(gml_id.as_str()) {
                entry = entry.with_mapping(*image);
            }
            ctx.cache.put(gml_id.clone(), entry)?;
        }
        ImportStats::add(&ctx.stats.objects, registered.len() as u64 + 1);

        let mut partial = None;

        match self.xlinks.resolve_unit(&unit.id, &mut unit.geometry) {
            Ok(resolution) => {
                ImportStats::add(&ctx.stats.local_xlinks, resolution.resolved as u64);
                for target in resolution.unresolved {
                    ctx.deferred
                        .push(DeferredLink::new(root_id, "geometry", "xlink_target", target))?;
                    ImportStats::add(&ctx.stats.deferred_links, 1);
                }
            }
            Err(e) if e.is_recoverable() => {
                ImportStats::add(&ctx.stats.circular_units, 1);
                partial = Some(e.to_string());
            }
            Err(e) => return Err(e.into()),
        }

        let known: HashSet<&str> = registered.iter().map(|(id, _)| id.as_str()).collect();
        if let Err(e) = self.assemble_textures(&unit, &known) {
            ImportStats::add(&ctx.stats.texture_errors, 1);
            partial.get_or_insert(e.to_string());
        }
        self.textures.clear();

        self.update_group(&unit.group, root_id);
        ImportStats::add(&ctx.stats.units, 1);

        Ok(match partial {
            Some(reason) => WorkOutcome::Partial { key: unit.id, reason },
            None => WorkOutcome::Success { key: unit.id },
        })
    }

    /// Rings are registered only if they exist in the unit's geometry;
    /// coordinates are sent for every parameter, half of them ahead of
    /// their ring
    fn assemble_textures(
        &mut self,
        unit: &SyntheticUnit,
        known: &HashSet<&str>,
    ) -> Result<(), EngineError> {
        let (early, late): (Vec<_>, Vec<_>) =
            unit.textures.iter().enumerate().partition(|(i, _)| i % 2 == 1);

        for (_, param) in &early {
            self.textures
                .add_coordinates(&param.ring_id, param.coords.clone())?;
        }

        for param in &unit.textures {
            if !known.contains(param.ring_id.as_str()) {
                continue;
            }
            if let Some(target) = self
                .textures
                .register_ring(param.target.clone(), param.ring_id.clone())
            {
                self.compile_target(&target);
            }
        }

        for (_, param) in &late {
            if let Some(target) = self
                .textures
                .add_coordinates(&param.ring_id, param.coords.clone())?
            {
                self.compile_target(&target);
            }
        }

        self.textures.finish()?;
        Ok(())
    }

    fn compile_target(&mut self, target: &TargetKey) {
        if let Some(rings) = self.textures.take_compiled(target) {
            trace!(surface = %target.surface_id, rings = rings.len(), "Compiled texture coordinates");
            ImportStats::add(&self.ctx.stats.textured_rings, rings.len() as u64);
        }
    }

    fn update_group(&self, group: &str, member: i64) {
        let ctx = &self.ctx;
        let _guard = ctx.group_locks.lock(group);

        let mut row = ctx.groups.get(group).unwrap_or_default();
        row.members += 1;
        row.last_member = member;
        ctx.groups.put(group, row);

        ImportStats::add(&ctx.stats.group_updates, 1);
    }

    fn resolve_link(&self, link: DeferredLink) -> Result<WorkOutcome, EngineError> {
        let key = format!("{}:{}", link.from_id, link.target);

        match self.ctx.cache.lookup(&link.target)? {
            Some(entry) => {
                trace!(
                    from = link.from_id,
                    column = %link.from_column,
                    target = entry.id,
                    "Resolved deferred link"
                );
                ImportStats::add(&self.ctx.stats.resolved_links, 1);
                Ok(WorkOutcome::Success { key })
            }
            None => {
                debug!(from = link.from_id, target = %link.target, "Deferred link target not found");
                ImportStats::add(&self.ctx.stats.missing_links, 1);
                Ok(WorkOutcome::Partial {
                    key,
                    reason: format!("Target '{}' not found", link.target),
                })
            }
        }
    }
}

impl WorkHandler<PipelineWork> for PipelineWorker {
    fn do_work(&mut self, item: PipelineWork) {
        let (key, result) = match item {
            PipelineWork::Import(unit) => (unit.id.clone(), self.import_unit(unit)),
            PipelineWork::Resolve(link) => (link.target.clone(), self.resolve_link(link)),
        };

        let outcome = result.unwrap_or_else(|e| {
            warn!(worker = self.id, key = %key, error = %e, "Abandoning work item");
            ImportStats::add(&self.ctx.stats.failed, 1);
            WorkOutcome::Failed {
                key,
                reason: e.to_string(),
            }
        });

        self.processed += 1;
        // The receiver only goes away once the run is over
        let _ = self.outcomes.send(outcome);
    }

    fn shutdown(&mut self) {
        self.xlinks.clear();
        self.textures.clear();
        debug!(worker = self.id, processed = self.processed, "Pipeline worker retired");
    }
}

/// Creates a [`PipelineWorker`] per pool worker
pub struct PipelineWorkerFactory {
    ctx: Arc<ImportContext>,
    outcomes: Sender<WorkOutcome>,
}

impl PipelineWorkerFactory {
    pub fn new(ctx: Arc<ImportContext>, outcomes: Sender<WorkOutcome>) -> Self {
        Self { ctx, outcomes }
    }
}

impl WorkerFactory<PipelineWork> for PipelineWorkerFactory {
    type Handler = PipelineWorker;

    fn create_worker(&self, id: usize) -> Result<PipelineWorker, WorkerError> {
        Ok(PipelineWorker::new(id, Arc::clone(&self.ctx), self.outcomes.clone()))
    }
}
