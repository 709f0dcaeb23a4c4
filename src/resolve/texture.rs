//! Texture coordinate to ring assembly
//!
//! Texture coordinates arrive separately from the rings they annotate. Rings
//! are registered against the surface that owns them, together with the
//! orientation that surface is used in. A target's coordinates are held back
//! until every one of its rings has received a list, then compiled in one go.
//!
//! Either side may come first. A list for a ring that is not registered yet
//! is parked and attached when the ring shows up; lists still parked when the
//! unit is finished are reported as unknown rings.

use crate::error::{ResolveError, ResolveResult};
use std::collections::HashMap;
use tracing::trace;

/// Owning surface and the orientation it is used in
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetKey {
    pub surface_id: String,
    pub reverse: bool,
}

impl TargetKey {
    pub fn new(surface_id: impl Into<String>, reverse: bool) -> Self {
        Self {
            surface_id: surface_id.into(),
            reverse,
        }
    }
}

/// Rings of one target in registration order
#[derive(Debug, Default)]
struct TargetRings {
    rings: Vec<String>,
    coords: HashMap<String, Vec<f64>>,
}

impl TargetRings {
    fn is_complete(&self) -> bool {
        !self.rings.is_empty() && self.rings.iter().all(|r| self.coords.contains_key(r))
    }
}

/// Compiled coordinates of one ring
#[derive(Debug, Clone, PartialEq)]
pub struct RingCoordinates {
    pub ring_id: String,
    pub pairs: Vec<(f64, f64)>,
}

/// Buffers texture coordinates per target until all rings are covered
#[derive(Debug, Default)]
pub struct TexCoordAssembler {
    targets: HashMap<TargetKey, TargetRings>,
    ring_owner: HashMap<String, TargetKey>,

    /// Coordinates whose ring has not been registered yet
    orphans: HashMap<String, Vec<f64>>,
}

impl TexCoordAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `ring_id` as a ring of `target`
    ///
    /// Coordinates parked for the ring are attached; returns the target
    /// when that completed it. Registering a ring again moves it to the new
    /// target.
    pub fn register_ring(
        &mut self,
        target: TargetKey,
        ring_id: impl Into<String>,
    ) -> Option<TargetKey> {
        let ring_id = ring_id.into();

        if let Some(previous) = self.ring_owner.get(&ring_id) {
            if *previous == target {
                return None;
            }
            if let Some(rings) = self.targets.get_mut(previous) {
                rings.rings.retain(|r| *r != ring_id);
                rings.coords.remove(&ring_id);
            }
        }

        let rings = self.targets.entry(target.clone()).or_default();
        let was_complete = rings.is_complete();
        rings.rings.push(ring_id.clone());
        if let Some(coords) = self.orphans.remove(&ring_id) {
            rings.coords.insert(ring_id.clone(), coords);
        }
        let completed = !was_complete && rings.is_complete();
        self.ring_owner.insert(ring_id, target.clone());

        if completed {
            trace!(surface = %target.surface_id, "Texture target complete on ring registration");
            return Some(target);
        }
        None
    }

    /// Attach a flat `[s0, t0, s1, t1, ...]` list to a ring
    ///
    /// Returns the owning target when this list completed it. A list for an
    /// unregistered ring is parked until `register_ring`. A later list for
    /// the same ring replaces the earlier one.
    pub fn add_coordinates(
        &mut self,
        ring_id: &str,
        coords: Vec<f64>,
    ) -> ResolveResult<Option<TargetKey>> {
        if coords.len() % 2 != 0 {
            return Err(ResolveError::OddCoordinateList {
                ring: ring_id.to_string(),
                len: coords.len(),
            });
        }

        let Some(target) = self.ring_owner.get(ring_id) else {
            self.orphans.insert(ring_id.to_string(), coords);
            return Ok(None);
        };
        let rings = self
            .targets
            .get_mut(target)
            .ok_or_else(|| ResolveError::UnknownRing(ring_id.to_string()))?;

        let was_complete = rings.is_complete();
        rings.coords.insert(ring_id.to_string(), coords);

        if !was_complete && rings.is_complete() {
            trace!(surface = %target.surface_id, rings = rings.rings.len(), "Texture target complete");
            return Ok(Some(target.clone()));
        }
        Ok(None)
    }

    /// Check if every ring of `target` has coordinates
    pub fn is_complete(&self, target: &TargetKey) -> bool {
        self.targets.get(target).is_some_and(TargetRings::is_complete)
    }

    /// Compile and remove a complete target
    ///
    /// Returns `None` while any ring of the target still lacks coordinates.
    pub fn take_compiled(&mut self, target: &TargetKey) -> Option<Vec<RingCoordinates>> {
        if !self.is_complete(target) {
            return None;
        }
        let mut rings = self.targets.remove(target)?;

        let compiled = rings
            .rings
            .iter()
            .map(|ring_id| {
                self.ring_owner.remove(ring_id);
                let coords = rings.coords.remove(ring_id).unwrap_or_default();
                RingCoordinates {
                    ring_id: ring_id.clone(),
                    pairs: compile(&coords, target.reverse),
                }
            })
            .collect();

        Some(compiled)
    }

    /// Targets still waiting for coordinates
    pub fn pending_targets(&self) -> usize {
        self.targets.len()
    }

    /// Rings that received coordinates but were never registered
    pub fn orphaned_rings(&self) -> usize {
        self.orphans.len()
    }

    /// End the current unit
    ///
    /// Fails with `UnknownRing` for the first (by id) ring whose coordinates
    /// never found a registration. Everything is cleared either way.
    pub fn finish(&mut self) -> ResolveResult<()> {
        let orphan = self.orphans.keys().min().cloned();
        self.clear();
        match orphan {
            Some(ring) => Err(ResolveError::UnknownRing(ring)),
            None => Ok(()),
        }
    }

    /// Forget all buffered rings and coordinates
    pub fn clear(&mut self) {
        self.targets.clear();
        self.ring_owner.clear();
        self.orphans.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty() && self.ring_owner.is_empty() && self.orphans.is_empty()
    }
}

/// Turn a flat coordinate list into pairs, reversing the pair order for
/// reverse-oriented targets
pub fn compile(coords: &[f64], reverse: bool) -> Vec<(f64, f64)> {
    let pairs = coords.chunks_exact(2).map(|c| (c[0], c[1]));
    if reverse {
        let mut pairs: Vec<_> = pairs.collect();
        pairs.reverse();
        pairs
    } else {
        pairs.collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SQUARE: [f64; 8] = [0.0, 0.0, 1.0, 0.0, 1.0, 1.0, 0.0, 1.0];

    #[test]
    fn test_compile_forward() {
        assert_eq!(
            compile(&SQUARE, false),
            vec![(0.0, 0.0), (1.0, 0.0), (1.0, 1.0), (0.0, 1.0)]
        );
    }

    #[test]
    fn test_compile_reversed_pairwise() {
        assert_eq!(
            compile(&SQUARE, true),
            vec![(0.0, 1.0), (1.0, 1.0), (1.0, 0.0), (0.0, 0.0)]
        );
    }

    #[test]
    fn test_odd_list_rejected() {
        let mut assembler = TexCoordAssembler::new();
        assembler.register_ring(TargetKey::new("poly", false), "ring");

        let err = assembler.add_coordinates("ring", vec![0.0, 1.0, 2.0]).unwrap_err();
        assert_eq!(
            err,
            ResolveError::OddCoordinateList {
                ring: "ring".to_string(),
                len: 3
            }
        );
        assert!(!err.is_recoverable());
        assert!(!assembler.is_complete(&TargetKey::new("poly", false)));
    }

    #[test]
    fn test_unknown_ring_reported_on_finish() {
        let mut assembler = TexCoordAssembler::new();
        assert_eq!(assembler.add_coordinates("nope", vec![0.0, 0.0]), Ok(None));
        assert_eq!(assembler.orphaned_rings(), 1);

        assert_eq!(
            assembler.finish(),
            Err(ResolveError::UnknownRing("nope".to_string()))
        );
        assert!(assembler.is_empty());
        assert_eq!(assembler.finish(), Ok(()));
    }

    #[test]
    fn test_coordinates_before_ring() {
        let mut assembler = TexCoordAssembler::new();
        let target = TargetKey::new("poly", true);

        assert_eq!(assembler.add_coordinates("outer", SQUARE.to_vec()).unwrap(), None);
        assert_eq!(assembler.add_coordinates("inner", vec![0.5, 0.5]).unwrap(), None);

        // First ring completes the target on its own
        assert_eq!(assembler.register_ring(target.clone(), "outer"), Some(target.clone()));
        // Adding a second parked ring keeps it complete without reporting again
        assert_eq!(assembler.register_ring(target.clone(), "inner"), None);
        assert!(assembler.is_complete(&target));
        assert_eq!(assembler.orphaned_rings(), 0);

        let compiled = assembler.take_compiled(&target).unwrap();
        assert_eq!(
            compiled[0].pairs,
            vec![(0.0, 1.0), (1.0, 1.0), (1.0, 0.0), (0.0, 0.0)]
        );
        assert_eq!(compiled[1].pairs, vec![(0.5, 0.5)]);
        assert_eq!(assembler.finish(), Ok(()));
    }

    #[test]
    fn test_mixed_arrival_order() {
        let mut assembler = TexCoordAssembler::new();
        let target = TargetKey::new("poly", false);

        assert_eq!(assembler.add_coordinates("a", vec![0.0, 0.0]).unwrap(), None);
        assert_eq!(assembler.register_ring(target.clone(), "a"), Some(target.clone()));
        assert_eq!(assembler.register_ring(target.clone(), "b"), None);
        assert!(!assembler.is_complete(&target));

        assert_eq!(
            assembler.add_coordinates("b", vec![1.0, 1.0]).unwrap(),
            Some(target.clone())
        );
    }

    #[test]
    fn test_buffers_until_every_ring_has_coordinates() {
        let mut assembler = TexCoordAssembler::new();
        let target = TargetKey::new("poly_1", true);
        assembler.register_ring(target.clone(), "exterior");
        assembler.register_ring(target.clone(), "interior");

        // Interior first: arrival order does not matter
        assert_eq!(assembler.add_coordinates("interior", vec![0.5, 0.5]).unwrap(), None);
        assert!(!assembler.is_complete(&target));
        assert!(assembler.take_compiled(&target).is_none());

        assert_eq!(
            assembler.add_coordinates("exterior", SQUARE.to_vec()).unwrap(),
            Some(target.clone())
        );

        let compiled = assembler.take_compiled(&target).unwrap();
        assert_eq!(compiled.len(), 2);
        assert_eq!(compiled[0].ring_id, "exterior");
        assert_eq!(
            compiled[0].pairs,
            vec![(0.0, 1.0), (1.0, 1.0), (1.0, 0.0), (0.0, 0.0)]
        );
        assert_eq!(compiled[1].pairs, vec![(0.5, 0.5)]);

        assert!(assembler.is_empty());
    }

    #[test]
    fn test_same_surface_both_orientations() {
        let mut assembler = TexCoordAssembler::new();
        let forward = TargetKey::new("poly", false);
        let reverse = TargetKey::new("poly", true);
        assembler.register_ring(forward.clone(), "r_fwd");
        assembler.register_ring(reverse.clone(), "r_rev");

        assembler.add_coordinates("r_fwd", SQUARE.to_vec()).unwrap();
        assert!(assembler.is_complete(&forward));
        assert!(!assembler.is_complete(&reverse));
        assert_eq!(assembler.pending_targets(), 2);
    }

    #[test]
    fn test_clear_between_units() {
        let mut assembler = TexCoordAssembler::new();
        assembler.register_ring(TargetKey::new("poly", false), "ring");
        assembler.add_coordinates("ring", vec![0.0, 0.0]).unwrap();

        assembler.clear();
        assert!(assembler.is_empty());

        // The ring is unknown again in the next unit
        assembler.add_coordinates("ring", vec![0.0, 0.0]).unwrap();
        assert!(matches!(assembler.finish(), Err(ResolveError::UnknownRing(_))));
    }
}
