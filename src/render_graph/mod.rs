//! Render graph: declarative pass scheduling over virtual resources.
//!
//! Passes declare which resources they read and write and in which state;
//! the graph inserts state-transition barriers where the tracked state
//! differs and executes passes in declaration order. Transient resources
//! live in the [`ResourceRegistry`] for exactly one frame.

pub mod graph;
pub mod pass;
pub mod registry;

pub use graph::{GraphStats, RenderGraph};
pub use pass::{PassBuilder, PassContext, PassId, ResourceAccess};
pub use registry::{ResourceHandle, ResourceKind, ResourceRegistry};
