//! GPU-driven rendering engine.
//!
//! Scene instances are culled, sorted, and turned into indirect draw
//! commands entirely on the compute device; the host never reads a count
//! back. A render graph sequences the work: passes declare their resource
//! reads/writes, the graph resolves state-transition barriers and transient
//! lifetimes, and executes in declaration order across three logical queues
//! (copy, compute, graphics).
//!
//! # Architecture
//!
//! - [`backend`]: object-safe [`GraphicsBackend`](backend::GraphicsBackend)
//!   trait over the GPU device, with a recording dummy backend (default) and
//!   a headless wgpu backend behind the `wgpu-backend` feature
//! - [`render_graph`]: pass scheduling, virtual resources, barriers
//! - [`scene`]: input types consumed from the scene/visibility collaborator
//! - [`pipeline`]: the cull → bitonic sort → indirect draw chain and the
//!   shadow map passes
//! - [`renderer`]: the context object owning pipelines and buffer sets,
//!   orchestrating one graph per frame

pub mod backend;
pub mod pipeline;
pub mod render_graph;
pub mod renderer;
pub mod scene;

pub use pipeline::{CASCADE_COUNT, MAX_INSTANCES, MAX_MATERIALS, MAX_SPOT_LIGHTS};
pub use render_graph::{RenderGraph, ResourceHandle, ResourceRegistry};
pub use renderer::{FrameStats, Renderer, TargetSize};
