use ash::vk;
use thiserror::Error;

use super::structs::{PermutationId, ShaderType};
use crate::sync::ImageLayout;

/// Compiler diagnostics for one failed stage.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("failed to compile {stage:?} entry '{entry}': {diagnostics}")]
pub struct CompileError {
    pub stage: ShaderType,
    pub entry: String,
    pub macros: Vec<String>,
    pub diagnostics: String,
}

/// A reflected binding that does not belong to the per-frame or per-draw
/// descriptor space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{stage:?} stage declares binding {binding} in unsupported set {set}")]
pub struct ReflectionError {
    pub stage: ShaderType,
    pub set: u32,
    pub binding: u32,
}

#[derive(Debug, Error)]
pub enum GPUError {
    #[error("{0} (permutation {1:?})")]
    Compile(Box<CompileError>, PermutationId),
    #[error("{0}")]
    Reflection(#[from] ReflectionError),
    #[error("Vulkan Error: {0}")]
    Device(vk::Result),
    #[error("failed to load Vulkan library: {0}")]
    LoadingError(#[from] ash::LoadingError),
    #[error("swapchain is out of date")]
    SwapchainStale,
    #[error("descriptor pool exhausted")]
    PoolExhausted,
    #[error("tracked layout {tracked:?} does not match the caller's layout {believed:?}")]
    LayoutMismatch {
        tracked: ImageLayout,
        believed: ImageLayout,
    },
    #[error("unknown or destroyed handle")]
    InvalidHandle,
    #[error("shader stage {0:?} is not valid here")]
    UnsupportedShaderStage(ShaderType),
    #[error("invalid pass {0}")]
    InvalidPass(String),
    #[error("unimplemented: {0}")]
    Unimplemented(&'static str),
}

impl GPUError {
    /// Only a stale swapchain can be recovered from by skipping the frame.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, GPUError::SwapchainStale)
    }
}

impl From<vk::Result> for GPUError {
    fn from(res: vk::Result) -> Self {
        match res {
            vk::Result::ERROR_OUT_OF_DATE_KHR => GPUError::SwapchainStale,
            vk::Result::ERROR_OUT_OF_POOL_MEMORY | vk::Result::ERROR_FRAGMENTED_POOL => {
                GPUError::PoolExhausted
            }
            res => GPUError::Device(res),
        }
    }
}

/// Convenient crate-wide result type.
pub type Result<T, E = GPUError> = std::result::Result<T, E>;
