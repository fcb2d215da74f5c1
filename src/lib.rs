//! Shader permutation, pipeline state and descriptor caches plus the pass
//! sequencer of a deferred Vulkan frame.
//!
//! All GPU access goes through [`gpu::Device`]. The `vkd-vulkan` feature
//! provides the `ash` implementation; [`gpu::null::NullDevice`] records
//! commands instead and backs the test suite.

pub mod config;
pub mod framegraph;
pub mod gpu;
pub mod shader;
pub mod sync;
pub mod utils;

pub use config::RendererConfig;
pub use framegraph::{Draw, FrameReport, PassDecl, PassTarget, Renderer};
pub use gpu::error::{CompileError, GPUError, ReflectionError, Result};
pub use gpu::{Device, Presenter};
pub use utils::{Handle, Pool};
