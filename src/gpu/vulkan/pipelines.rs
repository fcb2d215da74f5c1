use std::mem::{offset_of, size_of};

use ash::vk;

use super::VulkanDevice;
use crate::gpu::error::{GPUError, Result};
use crate::gpu::structs::{
    ComputePipelineDesc, GraphicsPipelineDesc, RayTracingPipelineDesc, ShaderBindingTable,
    ShaderType, StageModule, Vertex,
};
use crate::gpu::Device;

fn stage_info(stage: &StageModule) -> vk::PipelineShaderStageCreateInfo {
    vk::PipelineShaderStageCreateInfo::builder()
        .stage(stage.stage.into())
        .module(stage.module)
        .name(stage.entry.as_c_str())
        .build()
}

/// Attribute layout of [`Vertex`] at binding 0.
fn vertex_attributes() -> [vk::VertexInputAttributeDescription; 5] {
    let attr = |location: u32, format: vk::Format, offset: usize| {
        vk::VertexInputAttributeDescription {
            location,
            binding: 0,
            format,
            offset: offset as u32,
        }
    };
    [
        attr(0, vk::Format::R32G32B32_SFLOAT, offset_of!(Vertex, position)),
        attr(1, vk::Format::R32G32B32_SFLOAT, offset_of!(Vertex, normal)),
        attr(2, vk::Format::R32G32B32_SFLOAT, offset_of!(Vertex, tangent)),
        attr(3, vk::Format::R32G32B32_SFLOAT, offset_of!(Vertex, bitangent)),
        attr(4, vk::Format::R32G32_SFLOAT, offset_of!(Vertex, uv)),
    ]
}

fn align_up(value: u32, alignment: u32) -> u32 {
    (value + alignment - 1) & !(alignment - 1)
}

impl VulkanDevice {
    pub(super) fn build_graphics_pipeline(
        &self,
        desc: &GraphicsPipelineDesc<'_>,
    ) -> Result<vk::Pipeline> {
        let stages: Vec<vk::PipelineShaderStageCreateInfo> =
            desc.stages.iter().map(stage_info).collect();
        let state = desc.state;

        let bindings = [vk::VertexInputBindingDescription {
            binding: 0,
            stride: size_of::<Vertex>() as u32,
            input_rate: vk::VertexInputRate::VERTEX,
        }];
        let attributes = vertex_attributes();
        let vertex_input = if state.vertex_stream {
            vk::PipelineVertexInputStateCreateInfo::builder()
                .vertex_binding_descriptions(&bindings)
                .vertex_attribute_descriptions(&attributes)
                .build()
        } else {
            vk::PipelineVertexInputStateCreateInfo::default()
        };

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
            .topology(state.topology.into())
            .primitive_restart_enable(false)
            .build();

        let viewport = vk::PipelineViewportStateCreateInfo::builder()
            .viewport_count(1)
            .scissor_count(1)
            .build();

        let rasterizer = vk::PipelineRasterizationStateCreateInfo::builder()
            .depth_clamp_enable(false)
            .rasterizer_discard_enable(false)
            .polygon_mode(state.fill_mode.into())
            .cull_mode(state.cull_mode.into())
            .front_face(state.front_face.into())
            .depth_bias_enable(false)
            .line_width(1.0)
            .build();

        let multisample = vk::PipelineMultisampleStateCreateInfo::builder()
            .rasterization_samples(vk::SampleCountFlags::TYPE_1)
            .build();

        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::builder()
            .depth_test_enable(desc.pass.has_depth)
            .depth_write_enable(desc.pass.has_depth && state.depth_write)
            .depth_compare_op(state.depth_func.into())
            .min_depth_bounds(0.0)
            .max_depth_bounds(1.0)
            .build();

        let blend_attachments = vec![
            vk::PipelineColorBlendAttachmentState {
                blend_enable: vk::FALSE,
                color_write_mask: vk::ColorComponentFlags::RGBA,
                ..Default::default()
            };
            desc.pass.color_attachments as usize
        ];
        let blend = vk::PipelineColorBlendStateCreateInfo::builder()
            .logic_op_enable(false)
            .attachments(&blend_attachments)
            .build();

        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic = vk::PipelineDynamicStateCreateInfo::builder()
            .dynamic_states(&dynamic_states)
            .build();

        let info = vk::GraphicsPipelineCreateInfo::builder()
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport)
            .rasterization_state(&rasterizer)
            .multisample_state(&multisample)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&blend)
            .dynamic_state(&dynamic)
            .layout(desc.layout)
            .render_pass(desc.pass.render_pass)
            .subpass(0)
            .build();

        let pipelines = unsafe {
            self.device
                .create_graphics_pipelines(vk::PipelineCache::null(), &[info], None)
                .map_err(|(_, e)| e)?
        };
        Ok(pipelines[0])
    }

    pub(super) fn build_compute_pipeline(
        &self,
        desc: &ComputePipelineDesc<'_>,
    ) -> Result<vk::Pipeline> {
        if desc.stage.stage != ShaderType::Compute {
            return Err(GPUError::UnsupportedShaderStage(desc.stage.stage));
        }
        let info = vk::ComputePipelineCreateInfo::builder()
            .layout(desc.layout)
            .stage(stage_info(desc.stage))
            .build();

        let pipelines = unsafe {
            self.device
                .create_compute_pipelines(vk::PipelineCache::null(), &[info], None)
                .map_err(|(_, e)| e)?
        };
        Ok(pipelines[0])
    }

    /// One group per stage: ray generation and miss as general groups, closest
    /// hit as a triangle hit group. Each group gets its own binding-table
    /// buffer.
    pub(super) fn build_ray_tracing_pipeline(
        &self,
        desc: &RayTracingPipelineDesc<'_>,
    ) -> Result<(vk::Pipeline, ShaderBindingTable)> {
        let stages: Vec<vk::PipelineShaderStageCreateInfo> =
            desc.stages.iter().map(stage_info).collect();

        let mut groups = Vec::with_capacity(desc.stages.len());
        for (i, stage) in desc.stages.iter().enumerate() {
            let group = vk::RayTracingShaderGroupCreateInfoKHR::builder()
                .general_shader(vk::SHADER_UNUSED_KHR)
                .closest_hit_shader(vk::SHADER_UNUSED_KHR)
                .any_hit_shader(vk::SHADER_UNUSED_KHR)
                .intersection_shader(vk::SHADER_UNUSED_KHR);
            let group = match stage.stage {
                ShaderType::RayGeneration | ShaderType::RayMiss => group
                    .ty(vk::RayTracingShaderGroupTypeKHR::GENERAL)
                    .general_shader(i as u32),
                ShaderType::RayClosestHit => group
                    .ty(vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP)
                    .closest_hit_shader(i as u32),
                other => return Err(GPUError::UnsupportedShaderStage(other)),
            };
            groups.push(group.build());
        }

        let info = vk::RayTracingPipelineCreateInfoKHR::builder()
            .stages(&stages)
            .groups(&groups)
            .max_pipeline_ray_recursion_depth(1)
            .layout(desc.layout)
            .build();

        let pipeline = unsafe {
            self.ray_tracing.create_ray_tracing_pipelines(
                vk::DeferredOperationKHR::null(),
                vk::PipelineCache::null(),
                &[info],
                None,
            )?
        }[0];

        match self.build_binding_table(pipeline, desc.stages) {
            Ok(table) => Ok((pipeline, table)),
            Err(e) => {
                unsafe { self.device.destroy_pipeline(pipeline, None) };
                Err(e)
            }
        }
    }

    fn build_binding_table(
        &self,
        pipeline: vk::Pipeline,
        stages: &[StageModule],
    ) -> Result<ShaderBindingTable> {
        let handle_size = self.ray_tracing_properties.shader_group_handle_size;
        let aligned = align_up(
            handle_size,
            self.ray_tracing_properties.shader_group_handle_alignment,
        ) as u64;
        let group_count = stages.len() as u32;

        let handles = unsafe {
            self.ray_tracing.get_ray_tracing_shader_group_handles(
                pipeline,
                0,
                group_count,
                (group_count * handle_size) as usize,
            )?
        };

        let mut table = ShaderBindingTable::default();
        for (i, stage) in stages.iter().enumerate() {
            let slot = match stage.stage {
                ShaderType::RayGeneration => 0,
                ShaderType::RayMiss => 1,
                ShaderType::RayClosestHit => 2,
                other => {
                    self.destroy_shader_binding_table(&table);
                    return Err(GPUError::UnsupportedShaderStage(other));
                }
            };
            if table.buffers[slot] != vk::Buffer::null() {
                self.destroy_shader_binding_table(&table);
                return Err(GPUError::UnsupportedShaderStage(stage.stage));
            }

            let start = i * handle_size as usize;
            let bytes = &handles[start..start + handle_size as usize];
            let (buffer, address) = match self.create_host_buffer(
                aligned,
                vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR
                    | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
                bytes,
            ) {
                Ok(created) => created,
                Err(e) => {
                    self.destroy_shader_binding_table(&table);
                    return Err(e);
                }
            };
            let region = vk::StridedDeviceAddressRegionKHR {
                device_address: address,
                stride: aligned,
                size: aligned,
            };
            match slot {
                0 => table.raygen = region,
                1 => table.miss = region,
                _ => table.hit = region,
            }
            table.buffers[slot] = buffer;
        }
        Ok(table)
    }
}
