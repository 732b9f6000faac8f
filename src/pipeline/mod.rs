//! The GPU-driven cull → sort → draw pipeline.
//!
//! Each view (camera opaque/transparent split, every shadow sub-view) runs
//! the same chain: reset counter, frustum-cull into the survivor buffer,
//! bitonic-sort the survivors by key, expand them into packed indirect draw
//! arguments, and issue one indirect multi-draw whose count the GPU reads
//! from the live counter. Capacities are fixed at compile time; exceeding
//! them is a hard failure, not a truncation.

pub mod cull;
pub mod draw;
pub mod frame;
pub mod shadow;
pub mod sort;

use static_assertions::const_assert;

/// Maximum visible instances per frame, and the survivor capacity per view.
pub const MAX_INSTANCES: u32 = 16384;

/// Maximum entries in the per-frame material table.
pub const MAX_MATERIALS: u32 = 1024;

/// Maximum simultaneously active shadow-casting spot lights.
pub const MAX_SPOT_LIGHTS: u32 = 16;

/// Cascades per directional light, packed into one shadow atlas.
pub const CASCADE_COUNT: usize = 4;

// The bitonic network and the dispatch-slot layout both assume this.
const_assert!(MAX_INSTANCES.is_power_of_two());
const_assert!(MAX_INSTANCES >= sort::PRESORT_SPAN);
