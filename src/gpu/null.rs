//! Headless device that records instead of executing.
//!
//! Handles are minted from a counter, every recorded command is kept in
//! order, and descriptor writes are stored so tests can observe what a draw
//! would have read.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};

use ash::vk;
use ash::vk::Handle as _;

use super::accel::{AccelerationStructure, AccelerationStructureDesc};
use super::error::{GPUError, Result};
use super::structs::*;
use super::Device;
use crate::sync::ImageTransition;

/// One command recorded by [`NullDevice`].
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    BeginFrame,
    EndFrame,
    Submit,
    WaitIdle,
    AbandonFrame,
    SubmitOnceBegin,
    SubmitOnceEnd,
    ImageBarrier(ImageTransition),
    BeginRenderPass {
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
    },
    EndRenderPass,
    SetViewportScissor(vk::Rect2D),
    BindPipeline(vk::PipelineBindPoint, vk::Pipeline),
    BindDescriptorSets {
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        sets: Vec<vk::DescriptorSet>,
    },
    BindVertexBuffer(vk::Buffer),
    BindIndexBuffer(vk::Buffer),
    DrawIndexed(IndexedDraw),
    Dispatch([u32; 3]),
    TraceRays([u32; 3]),
    ResetTimestamps(u32),
    WriteTimestamp(u32),
}

/// Parameters a graphics pipeline was created with.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphicsPipelineRecord {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    pub stages: Vec<ShaderType>,
    pub state: RenderState,
    pub color_attachments: u32,
    pub render_pass: vk::RenderPass,
}

#[derive(Debug, Default)]
struct NullState {
    next: u64,
    commands: Vec<Command>,
    live: HashSet<u64>,
    shader_modules: usize,
    graphics: Vec<GraphicsPipelineRecord>,
    compute_pipelines: usize,
    ray_tracing_pipelines: usize,
    layouts: HashMap<vk::DescriptorSetLayout, Vec<LayoutBinding>>,
    pipeline_layouts: HashMap<vk::PipelineLayout, Vec<vk::DescriptorSetLayout>>,
    set_layouts: HashMap<vk::DescriptorSet, vk::DescriptorSetLayout>,
    contents: HashMap<(vk::DescriptorSet, u32), DescriptorResource>,
    allocated_sets: usize,
    pool_capacity: Option<usize>,
    fail_pipelines: bool,
    timestamps: [u64; 2],
}

pub struct NullDevice {
    state: RefCell<NullState>,
    period: f32,
}

impl Default for NullDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl NullDevice {
    pub fn new() -> Self {
        Self {
            state: RefCell::new(NullState {
                next: 1,
                ..Default::default()
            }),
            period: 1.0,
        }
    }

    /// Limits the number of descriptor sets that can be live at once.
    pub fn with_pool_capacity(self, sets: usize) -> Self {
        self.state.borrow_mut().pool_capacity = Some(sets);
        self
    }

    pub fn with_timestamps(mut self, start: u64, end: u64, period: f32) -> Self {
        self.state.borrow_mut().timestamps = [start, end];
        self.period = period;
        self
    }

    /// Every pipeline creation after this call reports a device error.
    pub fn fail_pipeline_creation(&self, fail: bool) {
        self.state.borrow_mut().fail_pipelines = fail;
    }

    pub fn commands(&self) -> Vec<Command> {
        self.state.borrow().commands.clone()
    }

    pub fn clear_commands(&self) {
        self.state.borrow_mut().commands.clear();
    }

    pub fn barriers(&self) -> Vec<ImageTransition> {
        self.state
            .borrow()
            .commands
            .iter()
            .filter_map(|c| match c {
                Command::ImageBarrier(t) => Some(*t),
                _ => None,
            })
            .collect()
    }

    pub fn shader_modules_created(&self) -> usize {
        self.state.borrow().shader_modules
    }

    pub fn graphics_pipelines(&self) -> Vec<GraphicsPipelineRecord> {
        self.state.borrow().graphics.clone()
    }

    pub fn compute_pipelines_created(&self) -> usize {
        self.state.borrow().compute_pipelines
    }

    pub fn ray_tracing_pipelines_created(&self) -> usize {
        self.state.borrow().ray_tracing_pipelines
    }

    pub fn descriptor_sets_allocated(&self) -> usize {
        self.state.borrow().allocated_sets
    }

    pub fn layout_bindings(&self, layout: vk::DescriptorSetLayout) -> Option<Vec<LayoutBinding>> {
        self.state.borrow().layouts.get(&layout).cloned()
    }

    pub fn pipeline_layout_sets(
        &self,
        layout: vk::PipelineLayout,
    ) -> Option<Vec<vk::DescriptorSetLayout>> {
        self.state.borrow().pipeline_layouts.get(&layout).cloned()
    }

    /// Latest resource written to `binding` of `set`.
    pub fn descriptor(&self, set: vk::DescriptorSet, binding: u32) -> Option<DescriptorResource> {
        self.state.borrow().contents.get(&(set, binding)).copied()
    }

    /// Number of objects created and not yet destroyed.
    pub fn live_objects(&self) -> usize {
        self.state.borrow().live.len()
    }

    fn mint(&self) -> u64 {
        let mut state = self.state.borrow_mut();
        let raw = state.next;
        state.next += 1;
        state.live.insert(raw);
        raw
    }

    fn retire(&self, raw: u64) {
        self.state.borrow_mut().live.remove(&raw);
    }

    fn record(&self, cmd: Command) {
        self.state.borrow_mut().commands.push(cmd);
    }

    fn check_pipeline_failure(&self) -> Result<()> {
        if self.state.borrow().fail_pipelines {
            return Err(GPUError::Device(vk::Result::ERROR_INITIALIZATION_FAILED));
        }
        Ok(())
    }
}

impl Device for NullDevice {
    fn create_shader_module(&self, spirv: &[u32]) -> Result<vk::ShaderModule> {
        if spirv.is_empty() {
            return Err(GPUError::Device(vk::Result::ERROR_INVALID_SHADER_NV));
        }
        self.state.borrow_mut().shader_modules += 1;
        Ok(vk::ShaderModule::from_raw(self.mint()))
    }

    fn destroy_shader_module(&self, module: vk::ShaderModule) {
        self.retire(module.as_raw());
    }

    fn create_descriptor_set_layout(
        &self,
        bindings: &[LayoutBinding],
    ) -> Result<vk::DescriptorSetLayout> {
        let layout = vk::DescriptorSetLayout::from_raw(self.mint());
        self.state
            .borrow_mut()
            .layouts
            .insert(layout, bindings.to_vec());
        Ok(layout)
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        self.state.borrow_mut().layouts.remove(&layout);
        self.retire(layout.as_raw());
    }

    fn allocate_descriptor_set(
        &self,
        layout: vk::DescriptorSetLayout,
    ) -> Result<vk::DescriptorSet> {
        {
            let state = self.state.borrow();
            if !state.layouts.contains_key(&layout) {
                return Err(GPUError::InvalidHandle);
            }
            if let Some(cap) = state.pool_capacity {
                if state.set_layouts.len() >= cap {
                    return Err(GPUError::PoolExhausted);
                }
            }
        }
        let set = vk::DescriptorSet::from_raw(self.mint());
        let mut state = self.state.borrow_mut();
        state.set_layouts.insert(set, layout);
        state.allocated_sets += 1;
        Ok(set)
    }

    fn free_descriptor_set(&self, set: vk::DescriptorSet) {
        {
            let mut state = self.state.borrow_mut();
            state.set_layouts.remove(&set);
            state.contents.retain(|(s, _), _| *s != set);
        }
        self.retire(set.as_raw());
    }

    fn update_descriptor_set(&self, set: vk::DescriptorSet, writes: &[DescriptorWrite]) {
        let mut state = self.state.borrow_mut();
        for w in writes {
            state.contents.insert((set, w.binding), w.resource);
        }
    }

    fn create_pipeline_layout(
        &self,
        set_layouts: &[vk::DescriptorSetLayout],
    ) -> Result<vk::PipelineLayout> {
        let layout = vk::PipelineLayout::from_raw(self.mint());
        self.state
            .borrow_mut()
            .pipeline_layouts
            .insert(layout, set_layouts.to_vec());
        Ok(layout)
    }

    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        self.state.borrow_mut().pipeline_layouts.remove(&layout);
        self.retire(layout.as_raw());
    }

    fn create_graphics_pipeline(&self, desc: &GraphicsPipelineDesc<'_>) -> Result<vk::Pipeline> {
        self.check_pipeline_failure()?;
        let pipeline = vk::Pipeline::from_raw(self.mint());
        self.state.borrow_mut().graphics.push(GraphicsPipelineRecord {
            pipeline,
            layout: desc.layout,
            stages: desc.stages.iter().map(|s| s.stage).collect(),
            state: *desc.state,
            color_attachments: desc.pass.color_attachments,
            render_pass: desc.pass.render_pass,
        });
        Ok(pipeline)
    }

    fn create_compute_pipeline(&self, _desc: &ComputePipelineDesc<'_>) -> Result<vk::Pipeline> {
        self.check_pipeline_failure()?;
        self.state.borrow_mut().compute_pipelines += 1;
        Ok(vk::Pipeline::from_raw(self.mint()))
    }

    fn create_ray_tracing_pipeline(
        &self,
        desc: &RayTracingPipelineDesc<'_>,
    ) -> Result<(vk::Pipeline, ShaderBindingTable)> {
        self.check_pipeline_failure()?;
        self.state.borrow_mut().ray_tracing_pipelines += 1;
        let pipeline = vk::Pipeline::from_raw(self.mint());

        const HANDLE: u64 = 32;
        let mut table = ShaderBindingTable::default();
        for (i, stage) in desc.stages.iter().enumerate() {
            let region = vk::StridedDeviceAddressRegionKHR {
                device_address: 0x1_0000 * (i as u64 + 1),
                stride: HANDLE,
                size: HANDLE,
            };
            match stage.stage {
                ShaderType::RayGeneration => table.raygen = region,
                ShaderType::RayMiss => table.miss = region,
                ShaderType::RayClosestHit => table.hit = region,
                other => return Err(GPUError::UnsupportedShaderStage(other)),
            }
        }
        for buffer in table.buffers.iter_mut() {
            *buffer = vk::Buffer::from_raw(self.mint());
        }
        Ok((pipeline, table))
    }

    fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        self.retire(pipeline.as_raw());
    }

    fn destroy_shader_binding_table(&self, table: &ShaderBindingTable) {
        for buffer in table.buffers {
            self.retire(buffer.as_raw());
        }
    }

    fn build_acceleration_structure(
        &self,
        desc: &AccelerationStructureDesc,
    ) -> Result<AccelerationStructure> {
        let raw = self.mint();
        Ok(AccelerationStructure {
            handle: vk::AccelerationStructureKHR::from_raw(raw),
            address: 0x100_0000 + raw * 0x100,
            level: desc.level,
            buffer: vk::Buffer::from_raw(self.mint()),
        })
    }

    fn destroy_acceleration_structure(&self, accel: &AccelerationStructure) {
        self.retire(accel.handle.as_raw());
        self.retire(accel.buffer.as_raw());
    }

    fn begin_frame(&self) -> Result<vk::CommandBuffer> {
        self.record(Command::BeginFrame);
        Ok(vk::CommandBuffer::from_raw(0xC0))
    }

    fn end_frame(&self, _cmd: vk::CommandBuffer) -> Result<()> {
        self.record(Command::EndFrame);
        Ok(())
    }

    fn submit(
        &self,
        _cmd: vk::CommandBuffer,
        _wait: &[(vk::Semaphore, vk::PipelineStageFlags)],
        _signal: &[vk::Semaphore],
    ) -> Result<()> {
        self.record(Command::Submit);
        Ok(())
    }

    fn wait_idle(&self) -> Result<()> {
        self.record(Command::WaitIdle);
        Ok(())
    }

    fn abandon_frame(
        &self,
        _cmd: vk::CommandBuffer,
        _wait: &[(vk::Semaphore, vk::PipelineStageFlags)],
    ) -> Result<()> {
        self.record(Command::AbandonFrame);
        Ok(())
    }

    fn submit_once(
        &self,
        record: &mut dyn FnMut(vk::CommandBuffer) -> Result<()>,
    ) -> Result<()> {
        self.record(Command::SubmitOnceBegin);
        record(vk::CommandBuffer::from_raw(0xC1))?;
        self.record(Command::SubmitOnceEnd);
        Ok(())
    }

    fn cmd_image_barriers(&self, _cmd: vk::CommandBuffer, transitions: &[ImageTransition]) {
        for t in transitions {
            self.record(Command::ImageBarrier(*t));
        }
    }

    fn cmd_begin_render_pass(&self, _cmd: vk::CommandBuffer, begin: &RenderPassBegin<'_>) {
        self.record(Command::BeginRenderPass {
            render_pass: begin.render_pass,
            framebuffer: begin.framebuffer,
        });
    }

    fn cmd_end_render_pass(&self, _cmd: vk::CommandBuffer) {
        self.record(Command::EndRenderPass);
    }

    fn cmd_set_viewport_scissor(&self, _cmd: vk::CommandBuffer, area: vk::Rect2D) {
        self.record(Command::SetViewportScissor(area));
    }

    fn cmd_bind_pipeline(
        &self,
        _cmd: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    ) {
        self.record(Command::BindPipeline(bind_point, pipeline));
    }

    fn cmd_bind_descriptor_sets(
        &self,
        _cmd: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        sets: &[vk::DescriptorSet],
    ) {
        self.record(Command::BindDescriptorSets {
            bind_point,
            layout,
            sets: sets.to_vec(),
        });
    }

    fn cmd_bind_vertex_buffer(&self, _cmd: vk::CommandBuffer, buffer: vk::Buffer) {
        self.record(Command::BindVertexBuffer(buffer));
    }

    fn cmd_bind_index_buffer(&self, _cmd: vk::CommandBuffer, buffer: vk::Buffer) {
        self.record(Command::BindIndexBuffer(buffer));
    }

    fn cmd_draw_indexed(&self, _cmd: vk::CommandBuffer, draw: IndexedDraw) {
        self.record(Command::DrawIndexed(draw));
    }

    fn cmd_dispatch(&self, _cmd: vk::CommandBuffer, groups: [u32; 3]) {
        self.record(Command::Dispatch(groups));
    }

    fn cmd_trace_rays(
        &self,
        _cmd: vk::CommandBuffer,
        _table: &ShaderBindingTable,
        extent: [u32; 3],
    ) {
        self.record(Command::TraceRays(extent));
    }

    fn cmd_reset_timestamps(&self, _cmd: vk::CommandBuffer, count: u32) {
        self.record(Command::ResetTimestamps(count));
    }

    fn cmd_write_timestamp(
        &self,
        _cmd: vk::CommandBuffer,
        _stage: vk::PipelineStageFlags,
        query: u32,
    ) {
        self.record(Command::WriteTimestamp(query));
    }

    fn timestamp_results(&self, count: u32) -> Result<Vec<u64>> {
        let stamps = self.state.borrow().timestamps;
        Ok(stamps.iter().copied().take(count as usize).collect())
    }

    fn timestamp_period(&self) -> f32 {
        self.period
    }
}
