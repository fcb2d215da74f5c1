use ash::vk;

pub mod accel;
pub mod error;
pub mod execution;
pub mod null;
pub mod structs;
pub mod timing;
#[cfg(feature = "vkd-vulkan")]
pub mod vulkan;

pub use accel::*;
pub use error::{CompileError, GPUError, ReflectionError, Result};
pub use structs::*;

use crate::sync::ImageTransition;

/// Interface the caches and the frame orchestrator use to reach the GPU.
///
/// Every object the core creates or command it records goes through this
/// trait, so the same code drives a real Vulkan device or the recording
/// [`null::NullDevice`] used in tests.
///
/// # Examples
/// ```ignore
/// use vkdeferred::gpu::Device;
/// fn clear_frame<D: Device>(device: &D) -> vkdeferred::Result<()> {
///     let cmd = device.begin_frame()?;
///     device.end_frame(cmd)
/// }
/// ```
pub trait Device {
    fn create_shader_module(&self, spirv: &[u32]) -> Result<vk::ShaderModule>;
    fn destroy_shader_module(&self, module: vk::ShaderModule);

    fn create_descriptor_set_layout(
        &self,
        bindings: &[LayoutBinding],
    ) -> Result<vk::DescriptorSetLayout>;
    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout);

    /// Allocates from the shared descriptor pool. Exhaustion is reported as
    /// [`GPUError::PoolExhausted`].
    fn allocate_descriptor_set(&self, layout: vk::DescriptorSetLayout)
        -> Result<vk::DescriptorSet>;
    fn free_descriptor_set(&self, set: vk::DescriptorSet);
    fn update_descriptor_set(&self, set: vk::DescriptorSet, writes: &[DescriptorWrite]);

    fn create_pipeline_layout(
        &self,
        set_layouts: &[vk::DescriptorSetLayout],
    ) -> Result<vk::PipelineLayout>;
    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout);

    fn create_graphics_pipeline(&self, desc: &GraphicsPipelineDesc<'_>) -> Result<vk::Pipeline>;
    fn create_compute_pipeline(&self, desc: &ComputePipelineDesc<'_>) -> Result<vk::Pipeline>;
    fn create_ray_tracing_pipeline(
        &self,
        desc: &RayTracingPipelineDesc<'_>,
    ) -> Result<(vk::Pipeline, ShaderBindingTable)>;
    fn destroy_pipeline(&self, pipeline: vk::Pipeline);
    fn destroy_shader_binding_table(&self, table: &ShaderBindingTable);

    fn build_acceleration_structure(
        &self,
        desc: &AccelerationStructureDesc,
    ) -> Result<AccelerationStructure>;
    fn destroy_acceleration_structure(&self, accel: &AccelerationStructure);

    /// Resets and begins the per-frame command buffer.
    fn begin_frame(&self) -> Result<vk::CommandBuffer>;
    fn end_frame(&self, cmd: vk::CommandBuffer) -> Result<()>;
    fn submit(
        &self,
        cmd: vk::CommandBuffer,
        wait: &[(vk::Semaphore, vk::PipelineStageFlags)],
        signal: &[vk::Semaphore],
    ) -> Result<()>;
    fn wait_idle(&self) -> Result<()>;
    /// Drops a frame whose recording failed: the command buffer is reset
    /// without being submitted and the `wait` semaphores are consumed by an
    /// empty submit, so the next acquire can signal them again.
    fn abandon_frame(
        &self,
        cmd: vk::CommandBuffer,
        wait: &[(vk::Semaphore, vk::PipelineStageFlags)],
    ) -> Result<()>;
    /// Records into a transient command buffer, submits it and blocks until
    /// the queue finishes it.
    fn submit_once(
        &self,
        record: &mut dyn FnMut(vk::CommandBuffer) -> Result<()>,
    ) -> Result<()>;

    fn cmd_image_barriers(&self, cmd: vk::CommandBuffer, transitions: &[ImageTransition]);
    fn cmd_begin_render_pass(&self, cmd: vk::CommandBuffer, begin: &RenderPassBegin<'_>);
    fn cmd_end_render_pass(&self, cmd: vk::CommandBuffer);
    fn cmd_set_viewport_scissor(&self, cmd: vk::CommandBuffer, area: vk::Rect2D);
    fn cmd_bind_pipeline(
        &self,
        cmd: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    );
    fn cmd_bind_descriptor_sets(
        &self,
        cmd: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        sets: &[vk::DescriptorSet],
    );
    fn cmd_bind_vertex_buffer(&self, cmd: vk::CommandBuffer, buffer: vk::Buffer);
    fn cmd_bind_index_buffer(&self, cmd: vk::CommandBuffer, buffer: vk::Buffer);
    fn cmd_draw_indexed(&self, cmd: vk::CommandBuffer, draw: IndexedDraw);
    fn cmd_dispatch(&self, cmd: vk::CommandBuffer, groups: [u32; 3]);
    fn cmd_trace_rays(
        &self,
        cmd: vk::CommandBuffer,
        table: &ShaderBindingTable,
        extent: [u32; 3],
    );

    fn cmd_reset_timestamps(&self, cmd: vk::CommandBuffer, count: u32);
    fn cmd_write_timestamp(
        &self,
        cmd: vk::CommandBuffer,
        stage: vk::PipelineStageFlags,
        query: u32,
    );
    fn timestamp_results(&self, count: u32) -> Result<Vec<u64>>;
    /// Nanoseconds per timestamp tick.
    fn timestamp_period(&self) -> f32;
}

/// Swapchain image handed out for one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquiredImage {
    pub index: u32,
    pub acquired: vk::Semaphore,
    pub render_finished: vk::Semaphore,
}

/// Swapchain collaborator. Creation and resizing live outside this crate.
pub trait Presenter {
    /// Bumped every time the swapchain is recreated.
    fn generation(&self) -> u64;
    /// `None` when the surface is out of date.
    fn acquire(&mut self) -> Result<Option<AcquiredImage>>;
    fn present(&mut self, image: &AcquiredImage) -> Result<()>;
}
