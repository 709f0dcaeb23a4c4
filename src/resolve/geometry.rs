//! Intra-unit geometry xlink resolution
//!
//! A unit's geometry tree may reference its own members by id instead of
//! repeating them. References can precede or follow their target, so each
//! unit is resolved in three passes:
//!
//! 1. scan: collect every referenced id
//! 2. collect: record a copy of every node carrying one of those ids
//! 3. resolve: replace each reference with a shared handle to the resolved
//!    copy of its target, tagging copy and original as shared
//!
//! A target copy is resolved once per unit. Every further reference to the
//! same id receives the same [`Arc`], so nested references cost one
//! substitution each instead of one per path through the tree.
//!
//! Pass 3 keeps the ids of all nodes it is descending through on a stack. A
//! reference to an id already on the stack is circular; resolution of the
//! unit stops there and the chain is reported. References resolved before
//! that point stay resolved.
//!
//! References to ids outside the unit stay as hrefs and are returned for
//! cache lookup.

use crate::error::{ResolveError, ResolveResult};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{trace, warn};

/// Geometry object class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GeometryKind {
    Solid,
    CompositeSolid,
    MultiSurface,
    CompositeSurface,
    Polygon,
    LinearRing,
}

/// Member of a geometry node
#[derive(Debug, Clone, PartialEq)]
pub enum GeometryProperty {
    /// Member given in place
    Inline(GeometryNode),

    /// Reference to a node by id
    Href(String),

    /// Resolved reference; every reference to the same target in a unit
    /// holds the same node
    Shared(Arc<GeometryNode>),
}

/// Node of a unit's geometry tree
#[derive(Debug, Clone, PartialEq)]
pub struct GeometryNode {
    pub id: Option<String>,
    pub kind: GeometryKind,
    pub members: Vec<GeometryProperty>,

    /// Node is the target of, or was substituted for, an xlink
    pub xlink_shared: bool,
}

impl GeometryNode {
    pub fn new(kind: GeometryKind) -> Self {
        Self {
            id: None,
            kind,
            members: Vec::new(),
            xlink_shared: false,
        }
    }

    pub fn with_id(kind: GeometryKind, id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Self::new(kind)
        }
    }

    pub fn member(mut self, node: GeometryNode) -> Self {
        self.members.push(GeometryProperty::Inline(node));
        self
    }

    pub fn href(mut self, target: impl Into<String>) -> Self {
        self.members.push(GeometryProperty::Href(target.into()));
        self
    }

    /// Visit this node and every inline descendant, depth first
    ///
    /// Shared members are not entered.
    pub fn walk<'a>(&'a self, f: &mut impl FnMut(&'a GeometryNode)) {
        f(self);
        for member in &self.members {
            if let GeometryProperty::Inline(child) = member {
                child.walk(f);
            }
        }
    }

    fn walk_mut(&mut self, f: &mut impl FnMut(&mut GeometryNode)) {
        f(self);
        for member in &mut self.members {
            if let GeometryProperty::Inline(child) = member {
                child.walk_mut(f);
            }
        }
    }

    /// Hrefs still present anywhere below this node
    pub fn hrefs(&self) -> Vec<&str> {
        let mut hrefs = Vec::new();
        self.walk(&mut |node| {
            for member in &node.members {
                if let GeometryProperty::Href(target) = member {
                    hrefs.push(target.as_str());
                }
            }
        });
        hrefs
    }
}

/// Result of resolving one unit
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct XlinkResolution {
    /// References replaced by their resolved target
    pub resolved: usize,

    /// Targets not found in the unit, in document order
    pub unresolved: Vec<String>,
}

/// Resolves xlinks inside one unit at a time
///
/// The resolver keeps its working sets between calls only to reuse their
/// allocations; they are cleared before and after every unit.
#[derive(Debug, Default)]
pub struct XlinkResolver {
    /// Ids referenced somewhere in the unit
    pending: HashSet<String>,

    /// Unresolved copies of referenced nodes
    targets: HashMap<String, GeometryNode>,

    /// Resolved copies, handed out to every reference of their id
    resolved: HashMap<String, Arc<GeometryNode>>,

    /// Ids of targets substituted at least once
    shared: HashSet<String>,

    /// Ids of the nodes being descended through
    ancestors: Vec<String>,
}

impl XlinkResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve the xlinks of one unit in place
    pub fn resolve_unit(
        &mut self,
        unit: &str,
        roots: &mut [GeometryNode],
    ) -> ResolveResult<XlinkResolution> {
        self.clear();

        // Pass 1: scan
        for root in roots.iter() {
            root.walk(&mut |node| {
                for member in &node.members {
                    if let GeometryProperty::Href(target) = member {
                        self.pending.insert(target.clone());
                    }
                }
            });
        }

        if self.pending.is_empty() {
            return Ok(XlinkResolution::default());
        }

        // Pass 2: collect
        for root in roots.iter() {
            root.walk(&mut |node| {
                if let Some(id) = &node.id {
                    if self.pending.contains(id) && !self.targets.contains_key(id) {
                        self.targets.insert(id.clone(), node.clone());
                    }
                }
            });
        }

        // Pass 3: resolve
        let mut resolution = XlinkResolution::default();
        let mut outcome = Ok(());
        for root in roots.iter_mut() {
            outcome = self.resolve_node(unit, root, &mut resolution);
            if outcome.is_err() {
                break;
            }
        }

        // Originals are tagged even when resolution stopped early
        if !self.shared.is_empty() {
            for root in roots.iter_mut() {
                root.walk_mut(&mut |node| {
                    if let Some(id) = &node.id {
                        if self.shared.contains(id) {
                            node.xlink_shared = true;
                        }
                    }
                });
            }
        }

        self.clear();

        match outcome {
            Ok(()) => {
                trace!(
                    unit,
                    resolved = resolution.resolved,
                    unresolved = resolution.unresolved.len(),
                    "Resolved geometry xlinks"
                );
                Ok(resolution)
            }
            Err(e) => {
                warn!(unit, error = %e, "Geometry xlink resolution aborted");
                Err(e)
            }
        }
    }

    fn resolve_node(
        &mut self,
        unit: &str,
        node: &mut GeometryNode,
        resolution: &mut XlinkResolution,
    ) -> ResolveResult<()> {
        let pushed = match &node.id {
            Some(id) => {
                self.ancestors.push(id.clone());
                true
            }
            None => false,
        };

        let result = self.resolve_members(unit, node, resolution);

        if pushed {
            self.ancestors.pop();
        }
        result
    }

    fn resolve_members(
        &mut self,
        unit: &str,
        node: &mut GeometryNode,
        resolution: &mut XlinkResolution,
    ) -> ResolveResult<()> {
        for member in node.members.iter_mut() {
            match member {
                GeometryProperty::Inline(child) => {
                    self.resolve_node(unit, child, resolution)?;
                }
                GeometryProperty::Href(target) => {
                    let cycle_start = self
                        .ancestors
                        .iter()
                        .position(|id| id.as_str() == target.as_str());
                    if let Some(start) = cycle_start {
                        let mut chain = self.ancestors[start..].to_vec();
                        chain.push(target.clone());
                        return Err(ResolveError::CircularReference {
                            unit: unit.to_string(),
                            chain,
                        });
                    }

                    let shared = match self.resolved.get(target.as_str()) {
                        Some(node) => Arc::clone(node),
                        None => {
                            let Some(mut copy) = self.targets.remove(target.as_str()) else {
                                resolution.unresolved.push(target.clone());
                                continue;
                            };
                            copy.xlink_shared = true;
                            self.resolve_node(unit, &mut copy, resolution)?;

                            let node = Arc::new(copy);
                            self.resolved.insert(target.clone(), Arc::clone(&node));
                            node
                        }
                    };

                    self.shared.insert(target.clone());
                    *member = GeometryProperty::Shared(shared);
                    resolution.resolved += 1;
                }
                GeometryProperty::Shared(_) => {}
            }
        }
        Ok(())
    }

    /// Forget all per-unit state
    pub fn clear(&mut self) {
        self.pending.clear();
        self.targets.clear();
        self.resolved.clear();
        self.shared.clear();
        self.ancestors.clear();
    }

    /// Check that no per-unit state is left over
    pub fn is_clear(&self) -> bool {
        self.pending.is_empty()
            && self.targets.is_empty()
            && self.resolved.is_empty()
            && self.shared.is_empty()
            && self.ancestors.is_empty()
    }
}
