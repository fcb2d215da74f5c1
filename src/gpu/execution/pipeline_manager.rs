use std::collections::HashMap;

use ash::vk;

use crate::gpu::error::{GPUError, Result};
use crate::gpu::structs::{
    ComputePipelineDesc, GraphicsPipelineDesc, PassDescription, RayTracingPipelineDesc,
    RenderState, ShaderBindingTable, ShaderType, StageModule, StateHash,
};
use crate::gpu::Device;

/// A pipeline ready to bind, plus what binding it needs.
#[derive(Debug, Clone, Copy)]
pub struct CachedPipeline {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    pub bind_point: vk::PipelineBindPoint,
    /// Present for ray-tracing pipelines only.
    pub binding_table: Option<ShaderBindingTable>,
}

/// Pipelines of one shader variant keyed by render-state hash.
///
/// The pipeline layout depends only on the variant's set layouts, so it is
/// created on the first miss and shared by every pipeline in the cache.
#[derive(Debug, Default)]
pub struct PipelineCache {
    layout: Option<vk::PipelineLayout>,
    pipelines: HashMap<StateHash, CachedPipeline>,
}

impl PipelineCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, hash: StateHash) -> Option<CachedPipeline> {
        self.pipelines.get(&hash).copied()
    }

    pub fn len(&self) -> usize {
        self.pipelines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pipelines.is_empty()
    }

    fn pipeline_layout<D: Device>(
        &mut self,
        device: &D,
        set_layouts: &[vk::DescriptorSetLayout],
    ) -> Result<vk::PipelineLayout> {
        if let Some(layout) = self.layout {
            return Ok(layout);
        }
        let layout = device.create_pipeline_layout(set_layouts)?;
        self.layout = Some(layout);
        Ok(layout)
    }

    /// Returns the pipeline for `state`, building it on a miss.
    ///
    /// Non-rasterizing states build a compute pipeline, or a ray-tracing
    /// pipeline with its binding table when the stages are ray-tracing
    /// stages. They all share [`StateHash::NON_RASTERIZING`], so such a
    /// variant never owns more than one pipeline.
    pub fn get_or_create<D: Device>(
        &mut self,
        device: &D,
        set_layouts: &[vk::DescriptorSetLayout],
        stages: &[StageModule],
        pass: &PassDescription,
        state: &RenderState,
    ) -> Result<CachedPipeline> {
        let key = state.hash();
        if let Some(cached) = self.pipelines.get(&key) {
            return Ok(*cached);
        }

        let layout = self.pipeline_layout(device, set_layouts)?;
        let cached = if !state.rasterizing {
            if stages.iter().any(|s| s.stage.is_ray_tracing()) {
                let (pipeline, table) = device.create_ray_tracing_pipeline(
                    &RayTracingPipelineDesc { layout, stages },
                )?;
                CachedPipeline {
                    pipeline,
                    layout,
                    bind_point: vk::PipelineBindPoint::RAY_TRACING_KHR,
                    binding_table: Some(table),
                }
            } else {
                let stage = match stages {
                    [s] if s.stage == ShaderType::Compute => s,
                    [s, ..] => return Err(GPUError::UnsupportedShaderStage(s.stage)),
                    [] => return Err(GPUError::UnsupportedShaderStage(ShaderType::Compute)),
                };
                let pipeline =
                    device.create_compute_pipeline(&ComputePipelineDesc { layout, stage })?;
                CachedPipeline {
                    pipeline,
                    layout,
                    bind_point: vk::PipelineBindPoint::COMPUTE,
                    binding_table: None,
                }
            }
        } else {
            if let Some(bad) = stages
                .iter()
                .find(|s| !matches!(s.stage, ShaderType::Vertex | ShaderType::Fragment))
            {
                return Err(GPUError::UnsupportedShaderStage(bad.stage));
            }
            let pipeline = device.create_graphics_pipeline(&GraphicsPipelineDesc {
                layout,
                stages,
                pass,
                state,
            })?;
            CachedPipeline {
                pipeline,
                layout,
                bind_point: vk::PipelineBindPoint::GRAPHICS,
                binding_table: None,
            }
        };

        log::debug!(
            "created {:?} pipeline {:?} for state {:?}",
            cached.bind_point,
            cached.pipeline,
            key
        );
        self.pipelines.insert(key, cached);
        Ok(cached)
    }

    pub fn destroy<D: Device>(&mut self, device: &D) {
        for (_, cached) in self.pipelines.drain() {
            if let Some(table) = &cached.binding_table {
                device.destroy_shader_binding_table(table);
            }
            device.destroy_pipeline(cached.pipeline);
        }
        if let Some(layout) = self.layout.take() {
            device.destroy_pipeline_layout(layout);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::null::NullDevice;
    use crate::gpu::structs::CullMode;
    use std::ffi::CString;

    fn stage(device: &NullDevice, stage: ShaderType) -> StageModule {
        StageModule {
            stage,
            entry: CString::new("main").unwrap(),
            module: device.create_shader_module(&[0x0723_0203]).unwrap(),
        }
    }

    #[test]
    fn non_rasterizing_states_share_one_pipeline() {
        let device = NullDevice::new();
        let stages = [stage(&device, ShaderType::Compute)];
        let mut cache = PipelineCache::new();
        let pass = PassDescription::default();

        let a = RenderState::non_rasterizing();
        let b = RenderState {
            cull_mode: CullMode::Back,
            ..RenderState::non_rasterizing()
        };
        let p0 = cache.get_or_create(&device, &[], &stages, &pass, &a).unwrap();
        let p1 = cache.get_or_create(&device, &[], &stages, &pass, &b).unwrap();
        assert_eq!(p0.pipeline, p1.pipeline);
        assert_eq!(p0.bind_point, vk::PipelineBindPoint::COMPUTE);
        assert_eq!(device.compute_pipelines_created(), 1);
    }

    #[test]
    fn compute_stage_cannot_rasterize() {
        let device = NullDevice::new();
        let stages = [stage(&device, ShaderType::Compute)];
        let mut cache = PipelineCache::new();
        let err = cache
            .get_or_create(
                &device,
                &[],
                &stages,
                &PassDescription::default(),
                &RenderState::default(),
            )
            .unwrap_err();
        assert!(matches!(
            err,
            GPUError::UnsupportedShaderStage(ShaderType::Compute)
        ));
        assert!(cache.is_empty());
    }

    #[test]
    fn destroy_releases_everything() {
        let device = NullDevice::new();
        let stages = [
            stage(&device, ShaderType::RayGeneration),
            stage(&device, ShaderType::RayMiss),
            stage(&device, ShaderType::RayClosestHit),
        ];
        let mut cache = PipelineCache::new();
        let p = cache
            .get_or_create(
                &device,
                &[],
                &stages,
                &PassDescription::default(),
                &RenderState::non_rasterizing(),
            )
            .unwrap();
        assert!(p.binding_table.is_some());
        cache.destroy(&device);
        for s in &stages {
            device.destroy_shader_module(s.module);
        }
        assert_eq!(device.live_objects(), 0);
    }
}
