//! Deterministic synthetic document source
//!
//! Generates building-like units: a solid whose shell holds a handful of
//! polygons, plus an LoD2 multi-surface that refers back to some of those
//! polygons by xlink. Depending on the configured ratios a unit also
//! references a polygon of another unit, references an id defined nowhere,
//! carries a circular pair of surfaces, or has textured rings.
//!
//! The same seed always yields the same units.

use crate::resolve::{GeometryKind, GeometryNode, TargetKey};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Shape of the generated data
#[derive(Debug, Clone)]
pub struct SyntheticConfig {
    /// Number of units to produce
    pub units: usize,

    /// Generator seed
    pub seed: u64,

    /// Number of shared group rows units are spread across
    pub groups: usize,

    /// Probability of a reference to another unit's polygon
    pub cross_ref_ratio: f64,

    /// Probability of a reference to an id that does not exist
    pub dangling_ratio: f64,

    /// Probability of a circular pair of surfaces
    pub circular_ratio: f64,

    /// Probability of textured rings
    pub textured_ratio: f64,
}

impl SyntheticConfig {
    pub fn new(units: usize, seed: u64) -> Self {
        Self {
            units,
            seed,
            ..Self::default()
        }
    }
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            units: 1000,
            seed: 42,
            groups: 8,
            cross_ref_ratio: 0.3,
            dangling_ratio: 0.02,
            circular_ratio: 0.02,
            textured_ratio: 0.25,
        }
    }
}

/// Texture coordinates for one ring of a unit
#[derive(Debug, Clone)]
pub struct TextureParam {
    pub target: TargetKey,
    pub ring_id: String,
    pub image: String,
    pub coords: Vec<f64>,
}

/// One top-level object and everything below it
#[derive(Debug, Clone)]
pub struct SyntheticUnit {
    pub id: String,

    /// Shared row this unit is a member of
    pub group: String,

    pub geometry: Vec<GeometryNode>,
    pub textures: Vec<TextureParam>,

    /// References to polygons of other units
    pub external_refs: usize,

    /// References to ids no unit defines
    pub dangling_refs: usize,

    /// Unit contains a pair of mutually referencing surfaces
    pub circular: bool,
}

impl SyntheticUnit {
    /// Objects that receive a database id: the unit itself and every
    /// geometry node carrying an id
    pub fn object_count(&self) -> usize {
        let mut count = 1;
        for root in &self.geometry {
            root.walk(&mut |node| {
                if node.id.is_some() {
                    count += 1;
                }
            });
        }
        count
    }
}

/// Iterator over generated units
pub struct SyntheticSource {
    config: SyntheticConfig,
    rng: ChaCha8Rng,
    next: usize,
}

impl SyntheticSource {
    pub fn new(config: SyntheticConfig) -> Self {
        let rng = ChaCha8Rng::seed_from_u64(config.seed);
        Self {
            config,
            rng,
            next: 0,
        }
    }

    /// Id of polygon `face` of unit `unit`
    pub fn polygon_id(unit: usize, face: usize) -> String {
        format!("bldg_{}_p{}", unit, face)
    }

    fn ring_id(unit: usize, face: usize) -> String {
        format!("bldg_{}_p{}_ring", unit, face)
    }

    fn chance(&mut self, ratio: f64) -> bool {
        self.rng.gen_bool(ratio.clamp(0.0, 1.0))
    }

    fn build(&mut self, n: usize) -> SyntheticUnit {
        use GeometryKind::*;

        let id = format!("bldg_{}", n);
        let faces: usize = self.rng.gen_range(4..=8);

        let mut shell = GeometryNode::with_id(CompositeSurface, format!("{}_shell", id));
        for face in 0..faces {
            shell = shell.member(
                GeometryNode::with_id(Polygon, Self::polygon_id(n, face))
                    .member(GeometryNode::with_id(LinearRing, Self::ring_id(n, face))),
            );
        }
        let solid = GeometryNode::with_id(Solid, format!("{}_solid", id)).member(shell);

        let mut lod2 = GeometryNode::with_id(MultiSurface, format!("{}_lod2", id));
        let local: usize = self.rng.gen_range(1..=3);
        for face in 0..local {
            lod2 = lod2.href(Self::polygon_id(n, face));
        }

        let circular = self.chance(self.config.circular_ratio);
        let mut external_refs = 0;
        let mut dangling_refs = 0;

        // Circular units never reach the point of reporting unresolved refs
        if !circular {
            if self.config.units > 1 && self.chance(self.config.cross_ref_ratio) {
                let mut other = self.rng.gen_range(0..self.config.units - 1);
                if other >= n {
                    other += 1;
                }
                lod2 = lod2.href(Self::polygon_id(other, 0));
                external_refs += 1;
            }
            if self.chance(self.config.dangling_ratio) {
                lod2 = lod2.href(format!("missing_{}", n));
                dangling_refs += 1;
            }
        }

        let mut geometry = vec![solid, lod2];
        if circular {
            let x = format!("{}_cx", id);
            let y = format!("{}_cy", id);
            geometry.push(GeometryNode::with_id(CompositeSurface, x.clone()).href(y.clone()));
            geometry.push(GeometryNode::with_id(CompositeSurface, y).href(x));
        }

        let mut textures = Vec::new();
        if self.chance(self.config.textured_ratio) {
            let image = format!("tex_{}.png", n);
            for face in 0..faces {
                let scale = self.rng.gen_range(0.5..2.0);
                textures.push(TextureParam {
                    target: TargetKey::new(Self::polygon_id(n, face), self.chance(0.5)),
                    ring_id: Self::ring_id(n, face),
                    image: image.clone(),
                    coords: vec![0.0, 0.0, scale, 0.0, scale, scale, 0.0, scale],
                });
            }
        }

        SyntheticUnit {
            id,
            group: format!("group_{}", n % self.config.groups.max(1)),
            geometry,
            textures,
            external_refs,
            dangling_refs,
            circular,
        }
    }
}

impl Iterator for SyntheticSource {
    type Item = SyntheticUnit;

    fn next(&mut self) -> Option<SyntheticUnit> {
        if self.next >= self.config.units {
            return None;
        }
        let unit = self.build(self.next);
        self.next += 1;
        Some(unit)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.config.units - self.next;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for SyntheticSource {}
