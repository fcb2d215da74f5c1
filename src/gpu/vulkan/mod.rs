//! `ash` implementation of [`Device`].
//!
//! The instance, physical device, logical device and queue are created by
//! the application; [`VulkanDevice`] layers the descriptor pool, command
//! buffers, timestamp queries, ray-tracing loaders and a `vk-mem` allocator
//! on top of them.

use std::cell::RefCell;
use std::collections::HashMap;
use std::mem::ManuallyDrop;

use ash::extensions::khr;
use ash::vk;

use crate::config::DescriptorPoolConfig;
use crate::gpu::accel::{AccelerationStructure, AccelerationStructureDesc};
use crate::gpu::error::Result;
use crate::gpu::structs::*;
use crate::gpu::timing::QUERY_COUNT;
use crate::gpu::Device;
use crate::sync::ImageTransition;

mod accel;
mod command_pool;
pub mod conversions;
mod memory;
mod pipelines;
mod presenter;

use command_pool::CommandPool;
pub use presenter::SwapchainPresenter;

/// Objects the application created and hands to [`VulkanDevice::new`].
pub struct VulkanDeviceInfo<'a> {
    pub instance: &'a ash::Instance,
    pub physical_device: vk::PhysicalDevice,
    pub device: &'a ash::Device,
    pub queue: vk::Queue,
    pub queue_family: u32,
}

pub struct VulkanDevice {
    device: ash::Device,
    queue: vk::Queue,
    ray_tracing: khr::RayTracingPipeline,
    ray_tracing_properties: vk::PhysicalDeviceRayTracingPipelinePropertiesKHR,
    acceleration: khr::AccelerationStructure,
    allocator: ManuallyDrop<vk_mem::Allocator>,
    allocations: RefCell<HashMap<vk::Buffer, vk_mem::Allocation>>,
    descriptor_pool: vk::DescriptorPool,
    commands: CommandPool,
    query_pool: vk::QueryPool,
    timestamp_period: f32,
}

fn pool_sizes(cfg: &DescriptorPoolConfig) -> Vec<vk::DescriptorPoolSize> {
    [
        (vk::DescriptorType::SAMPLER, cfg.samplers),
        (vk::DescriptorType::SAMPLED_IMAGE, cfg.sampled_images),
        (
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            cfg.combined_image_samplers,
        ),
        (vk::DescriptorType::STORAGE_IMAGE, cfg.storage_images),
        (vk::DescriptorType::STORAGE_BUFFER, cfg.storage_buffers),
        (vk::DescriptorType::UNIFORM_BUFFER, cfg.uniform_buffers),
        (
            vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
            cfg.acceleration_structures,
        ),
    ]
    .into_iter()
    .filter(|(_, count)| *count > 0)
    .map(|(ty, descriptor_count)| vk::DescriptorPoolSize {
        ty,
        descriptor_count,
    })
    .collect()
}

impl VulkanDevice {
    pub fn new(info: &VulkanDeviceInfo<'_>, pool: &DescriptorPoolConfig) -> Result<Self> {
        let device = info.device.clone();
        let properties =
            unsafe { info.instance.get_physical_device_properties(info.physical_device) };
        let ray_tracing_properties = unsafe {
            khr::RayTracingPipeline::get_properties(info.instance, info.physical_device)
        };

        let allocator = vk_mem::Allocator::new(
            vk_mem::AllocatorCreateInfo::new(info.instance, &device, info.physical_device)
                .flags(vk_mem::AllocatorCreateFlags::BUFFER_DEVICE_ADDRESS),
        )?;

        let sizes = pool_sizes(pool);
        let descriptor_pool = unsafe {
            device.create_descriptor_pool(
                &vk::DescriptorPoolCreateInfo::builder()
                    .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
                    .max_sets(pool.max_sets)
                    .pool_sizes(&sizes),
                None,
            )?
        };

        let mut commands = match CommandPool::new(device.clone(), info.queue_family) {
            Ok(commands) => commands,
            Err(e) => {
                unsafe { device.destroy_descriptor_pool(descriptor_pool, None) };
                return Err(e);
            }
        };

        let query_pool = match unsafe {
            device.create_query_pool(
                &vk::QueryPoolCreateInfo::builder()
                    .query_type(vk::QueryType::TIMESTAMP)
                    .query_count(QUERY_COUNT),
                None,
            )
        } {
            Ok(pool) => pool,
            Err(e) => {
                commands.destroy();
                unsafe { device.destroy_descriptor_pool(descriptor_pool, None) };
                return Err(e.into());
            }
        };

        log::info!(
            "vulkan device ready: {} descriptor sets, timestamp period {} ns",
            pool.max_sets,
            properties.limits.timestamp_period
        );

        Ok(Self {
            ray_tracing: khr::RayTracingPipeline::new(info.instance, &device),
            acceleration: khr::AccelerationStructure::new(info.instance, &device),
            device,
            queue: info.queue,
            ray_tracing_properties,
            allocator: ManuallyDrop::new(allocator),
            allocations: RefCell::new(HashMap::new()),
            descriptor_pool,
            commands,
            query_pool,
            timestamp_period: properties.limits.timestamp_period,
        })
    }

    fn queue_submit(
        &self,
        cmds: &[vk::CommandBuffer],
        wait: &[(vk::Semaphore, vk::PipelineStageFlags)],
        signal: &[vk::Semaphore],
    ) -> Result<()> {
        let wait_semaphores: Vec<vk::Semaphore> = wait.iter().map(|(s, _)| *s).collect();
        let wait_stages: Vec<vk::PipelineStageFlags> = wait.iter().map(|(_, s)| *s).collect();
        let info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(cmds)
            .signal_semaphores(signal)
            .build();
        unsafe {
            self.device
                .queue_submit(self.queue, &[info], vk::Fence::null())?
        };
        Ok(())
    }

    /// Empty batch that only waits on `wait`.
    fn submit_waits(&self, wait: &[(vk::Semaphore, vk::PipelineStageFlags)]) -> Result<()> {
        self.queue_submit(&[], wait, &[])
    }

    pub fn raw(&self) -> &ash::Device {
        &self.device
    }

    pub fn queue(&self) -> vk::Queue {
        self.queue
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
        }
        let leaked: Vec<vk::Buffer> = self.allocations.borrow().keys().copied().collect();
        if !leaked.is_empty() {
            log::warn!("{} buffers still alive at device teardown", leaked.len());
        }
        for buffer in leaked {
            self.destroy_buffer(buffer);
        }
        unsafe {
            self.device.destroy_query_pool(self.query_pool, None);
            self.device
                .destroy_descriptor_pool(self.descriptor_pool, None);
            self.commands.destroy();
            ManuallyDrop::drop(&mut self.allocator);
        }
    }
}

impl Device for VulkanDevice {
    fn create_shader_module(&self, spirv: &[u32]) -> Result<vk::ShaderModule> {
        let info = vk::ShaderModuleCreateInfo::builder().code(spirv).build();
        Ok(unsafe { self.device.create_shader_module(&info, None)? })
    }

    fn destroy_shader_module(&self, module: vk::ShaderModule) {
        unsafe { self.device.destroy_shader_module(module, None) };
    }

    fn create_descriptor_set_layout(
        &self,
        bindings: &[LayoutBinding],
    ) -> Result<vk::DescriptorSetLayout> {
        let bindings: Vec<vk::DescriptorSetLayoutBinding> = bindings
            .iter()
            .map(|b| vk::DescriptorSetLayoutBinding {
                binding: b.binding,
                descriptor_type: b.kind.into(),
                descriptor_count: b.count,
                stage_flags: b.stages,
                ..Default::default()
            })
            .collect();
        let info = vk::DescriptorSetLayoutCreateInfo::builder()
            .bindings(&bindings)
            .build();
        Ok(unsafe { self.device.create_descriptor_set_layout(&info, None)? })
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        unsafe { self.device.destroy_descriptor_set_layout(layout, None) };
    }

    fn allocate_descriptor_set(
        &self,
        layout: vk::DescriptorSetLayout,
    ) -> Result<vk::DescriptorSet> {
        let layouts = [layout];
        let info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(self.descriptor_pool)
            .set_layouts(&layouts)
            .build();
        let sets = unsafe { self.device.allocate_descriptor_sets(&info)? };
        Ok(sets[0])
    }

    fn free_descriptor_set(&self, set: vk::DescriptorSet) {
        if let Err(e) = unsafe {
            self.device
                .free_descriptor_sets(self.descriptor_pool, &[set])
        } {
            log::warn!("failed to free descriptor set {:?}: {}", set, e);
        }
    }

    fn update_descriptor_set(&self, set: vk::DescriptorSet, writes: &[DescriptorWrite]) {
        let mut images = vec![vk::DescriptorImageInfo::default(); writes.len()];
        let mut buffers = vec![vk::DescriptorBufferInfo::default(); writes.len()];
        let mut structures = vec![vk::AccelerationStructureKHR::null(); writes.len()];

        for (i, w) in writes.iter().enumerate() {
            match w.resource {
                DescriptorResource::Sampler(sampler) => {
                    images[i].sampler = sampler;
                }
                DescriptorResource::SampledImage { view, layout }
                | DescriptorResource::StorageImage { view, layout } => {
                    images[i].image_view = view;
                    images[i].image_layout = layout;
                }
                DescriptorResource::CombinedImageSampler {
                    sampler,
                    view,
                    layout,
                } => {
                    images[i] = vk::DescriptorImageInfo {
                        sampler,
                        image_view: view,
                        image_layout: layout,
                    };
                }
                DescriptorResource::UniformBuffer {
                    buffer,
                    offset,
                    range,
                }
                | DescriptorResource::StorageBuffer {
                    buffer,
                    offset,
                    range,
                } => {
                    buffers[i] = vk::DescriptorBufferInfo {
                        buffer,
                        offset,
                        range,
                    };
                }
                DescriptorResource::AccelerationStructure(structure) => {
                    structures[i] = structure;
                }
            }
        }

        let mut structure_writes: Vec<vk::WriteDescriptorSetAccelerationStructureKHR> = structures
            .iter()
            .map(|s| vk::WriteDescriptorSetAccelerationStructureKHR {
                acceleration_structure_count: 1,
                p_acceleration_structures: s,
                ..Default::default()
            })
            .collect();

        let vk_writes: Vec<vk::WriteDescriptorSet> = writes
            .iter()
            .enumerate()
            .map(|(i, w)| {
                let mut write = vk::WriteDescriptorSet {
                    dst_set: set,
                    dst_binding: w.binding,
                    descriptor_count: 1,
                    descriptor_type: w.resource.kind().into(),
                    ..Default::default()
                };
                match w.resource {
                    DescriptorResource::Sampler(_)
                    | DescriptorResource::SampledImage { .. }
                    | DescriptorResource::CombinedImageSampler { .. }
                    | DescriptorResource::StorageImage { .. } => {
                        write.p_image_info = &images[i];
                    }
                    DescriptorResource::UniformBuffer { .. }
                    | DescriptorResource::StorageBuffer { .. } => {
                        write.p_buffer_info = &buffers[i];
                    }
                    DescriptorResource::AccelerationStructure(_) => {
                        write.p_next = &mut structure_writes[i] as *mut _ as *const _;
                    }
                }
                write
            })
            .collect();

        unsafe { self.device.update_descriptor_sets(&vk_writes, &[]) };
    }

    fn create_pipeline_layout(
        &self,
        set_layouts: &[vk::DescriptorSetLayout],
    ) -> Result<vk::PipelineLayout> {
        let info = vk::PipelineLayoutCreateInfo::builder()
            .set_layouts(set_layouts)
            .build();
        Ok(unsafe { self.device.create_pipeline_layout(&info, None)? })
    }

    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        unsafe { self.device.destroy_pipeline_layout(layout, None) };
    }

    fn create_graphics_pipeline(&self, desc: &GraphicsPipelineDesc<'_>) -> Result<vk::Pipeline> {
        self.build_graphics_pipeline(desc)
    }

    fn create_compute_pipeline(&self, desc: &ComputePipelineDesc<'_>) -> Result<vk::Pipeline> {
        self.build_compute_pipeline(desc)
    }

    fn create_ray_tracing_pipeline(
        &self,
        desc: &RayTracingPipelineDesc<'_>,
    ) -> Result<(vk::Pipeline, ShaderBindingTable)> {
        self.build_ray_tracing_pipeline(desc)
    }

    fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        unsafe { self.device.destroy_pipeline(pipeline, None) };
    }

    fn destroy_shader_binding_table(&self, table: &ShaderBindingTable) {
        for buffer in table.buffers {
            if buffer != vk::Buffer::null() {
                self.destroy_buffer(buffer);
            }
        }
    }

    fn build_acceleration_structure(
        &self,
        desc: &AccelerationStructureDesc,
    ) -> Result<AccelerationStructure> {
        self.build_structure(desc)
    }

    fn destroy_acceleration_structure(&self, accel: &AccelerationStructure) {
        unsafe {
            self.acceleration
                .destroy_acceleration_structure(accel.handle, None)
        };
        self.destroy_buffer(accel.buffer);
    }

    fn begin_frame(&self) -> Result<vk::CommandBuffer> {
        self.commands.begin_frame()
    }

    fn end_frame(&self, cmd: vk::CommandBuffer) -> Result<()> {
        unsafe { self.device.end_command_buffer(cmd)? };
        Ok(())
    }

    fn submit(
        &self,
        cmd: vk::CommandBuffer,
        wait: &[(vk::Semaphore, vk::PipelineStageFlags)],
        signal: &[vk::Semaphore],
    ) -> Result<()> {
        self.queue_submit(&[cmd], wait, signal)
    }

    fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle()? };
        Ok(())
    }

    fn abandon_frame(
        &self,
        cmd: vk::CommandBuffer,
        wait: &[(vk::Semaphore, vk::PipelineStageFlags)],
    ) -> Result<()> {
        if cmd != vk::CommandBuffer::null() {
            self.commands.discard(cmd)?;
        }
        if !wait.is_empty() {
            self.submit_waits(wait)?;
        }
        self.wait_idle()
    }

    fn submit_once(
        &self,
        record: &mut dyn FnMut(vk::CommandBuffer) -> Result<()>,
    ) -> Result<()> {
        let cmd = self.commands.begin_transient()?;
        let result = (|| -> Result<()> {
            record(cmd)?;
            unsafe { self.device.end_command_buffer(cmd)? };

            let fence = unsafe {
                self.device
                    .create_fence(&vk::FenceCreateInfo::builder(), None)?
            };
            let cmds = [cmd];
            let info = vk::SubmitInfo::builder().command_buffers(&cmds).build();
            let done = unsafe {
                self.device
                    .queue_submit(self.queue, &[info], fence)
                    .and_then(|_| self.device.wait_for_fences(&[fence], true, u64::MAX))
            };
            unsafe { self.device.destroy_fence(fence, None) };
            done?;
            Ok(())
        })();
        self.commands.release(cmd);
        result
    }

    fn cmd_image_barriers(&self, cmd: vk::CommandBuffer, transitions: &[ImageTransition]) {
        if transitions.is_empty() {
            return;
        }
        let barriers: Vec<vk::ImageMemoryBarrier2> =
            transitions.iter().map(ImageTransition::to_vk).collect();
        let deps = vk::DependencyInfo::builder()
            .image_memory_barriers(&barriers)
            .build();
        unsafe { self.device.cmd_pipeline_barrier2(cmd, &deps) };
    }

    fn cmd_begin_render_pass(&self, cmd: vk::CommandBuffer, begin: &RenderPassBegin<'_>) {
        let info = vk::RenderPassBeginInfo::builder()
            .render_pass(begin.render_pass)
            .framebuffer(begin.framebuffer)
            .render_area(begin.area)
            .clear_values(begin.clear_values)
            .build();
        unsafe {
            self.device
                .cmd_begin_render_pass(cmd, &info, vk::SubpassContents::INLINE)
        };
    }

    fn cmd_end_render_pass(&self, cmd: vk::CommandBuffer) {
        unsafe { self.device.cmd_end_render_pass(cmd) };
    }

    fn cmd_set_viewport_scissor(&self, cmd: vk::CommandBuffer, area: vk::Rect2D) {
        let viewport = vk::Viewport {
            x: area.offset.x as f32,
            y: area.offset.y as f32,
            width: area.extent.width as f32,
            height: area.extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        unsafe {
            self.device.cmd_set_viewport(cmd, 0, &[viewport]);
            self.device.cmd_set_scissor(cmd, 0, &[area]);
        }
    }

    fn cmd_bind_pipeline(
        &self,
        cmd: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    ) {
        unsafe { self.device.cmd_bind_pipeline(cmd, bind_point, pipeline) };
    }

    fn cmd_bind_descriptor_sets(
        &self,
        cmd: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        sets: &[vk::DescriptorSet],
    ) {
        unsafe {
            self.device
                .cmd_bind_descriptor_sets(cmd, bind_point, layout, 0, sets, &[])
        };
    }

    fn cmd_bind_vertex_buffer(&self, cmd: vk::CommandBuffer, buffer: vk::Buffer) {
        unsafe { self.device.cmd_bind_vertex_buffers(cmd, 0, &[buffer], &[0]) };
    }

    fn cmd_bind_index_buffer(&self, cmd: vk::CommandBuffer, buffer: vk::Buffer) {
        unsafe {
            self.device
                .cmd_bind_index_buffer(cmd, buffer, 0, vk::IndexType::UINT32)
        };
    }

    fn cmd_draw_indexed(&self, cmd: vk::CommandBuffer, draw: IndexedDraw) {
        unsafe {
            self.device.cmd_draw_indexed(
                cmd,
                draw.index_count,
                draw.instance_count,
                draw.first_index,
                draw.vertex_offset,
                0,
            )
        };
    }

    fn cmd_dispatch(&self, cmd: vk::CommandBuffer, groups: [u32; 3]) {
        unsafe { self.device.cmd_dispatch(cmd, groups[0], groups[1], groups[2]) };
    }

    fn cmd_trace_rays(
        &self,
        cmd: vk::CommandBuffer,
        table: &ShaderBindingTable,
        extent: [u32; 3],
    ) {
        unsafe {
            self.ray_tracing.cmd_trace_rays(
                cmd,
                &table.raygen,
                &table.miss,
                &table.hit,
                &table.callable,
                extent[0],
                extent[1],
                extent[2],
            )
        };
    }

    fn cmd_reset_timestamps(&self, cmd: vk::CommandBuffer, count: u32) {
        unsafe { self.device.cmd_reset_query_pool(cmd, self.query_pool, 0, count) };
    }

    fn cmd_write_timestamp(
        &self,
        cmd: vk::CommandBuffer,
        stage: vk::PipelineStageFlags,
        query: u32,
    ) {
        unsafe {
            self.device
                .cmd_write_timestamp(cmd, stage, self.query_pool, query)
        };
    }

    fn timestamp_results(&self, count: u32) -> Result<Vec<u64>> {
        let mut data = vec![0u64; count as usize];
        unsafe {
            self.device.get_query_pool_results(
                self.query_pool,
                0,
                count,
                &mut data,
                vk::QueryResultFlags::TYPE_64 | vk::QueryResultFlags::WAIT,
            )?;
        }
        Ok(data)
    }

    fn timestamp_period(&self) -> f32 {
        self.timestamp_period
    }
}
