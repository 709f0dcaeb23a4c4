//! In-memory resolution of references inside one unit
//!
//! Both resolvers are per-worker state: a worker creates one of each and
//! reuses it for every unit it processes. Neither touches the database;
//! whatever cannot be resolved locally goes to the reference cache.

pub mod geometry;
pub mod texture;

pub use geometry::{GeometryKind, GeometryNode, GeometryProperty, XlinkResolution, XlinkResolver};
pub use texture::{RingCoordinates, TargetKey, TexCoordAssembler};
