//! Shader objects and their permutation variants.
//!
//! A [`ShaderObject`] holds the source text and the stages to compile from
//! it. Every [`PermutationId`] requested through [`ShaderObject::variant`]
//! is compiled once, reflected, and kept together with its pipeline and
//! descriptor set caches until the object is destroyed.

use std::collections::HashMap;
use std::ffi::CString;

use ash::vk;
use smallvec::SmallVec;

use crate::gpu::error::{CompileError, GPUError, Result};
use crate::gpu::execution::{
    merge_per_draw_bindings, BindingWriter, CachedPipeline, DescriptorSetCache, PerFrameLease,
    PerFrameRegistry, PipelineCache,
};
use crate::gpu::structs::{
    BindingDescriptor, LayoutBinding, PassDescription, PermutationId, RenderState, ShaderType,
    StageModule,
};
use crate::gpu::Device;

pub mod compiler;
pub mod disk_cache;
pub mod reflect;

pub use compiler::*;
pub use disk_cache::DiskCache;
pub use reflect::StageReflection;

/// Pipeline family a shader object produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderKind {
    Graphics,
    Compute,
    RayTracing,
}

impl ShaderKind {
    fn of(stages: &[(ShaderType, String)]) -> Result<Self> {
        let Some((first, _)) = stages.first() else {
            return Err(GPUError::Unimplemented("shader object without stages"));
        };

        if stages.iter().all(|(s, _)| s.is_ray_tracing()) {
            if !stages.iter().any(|(s, _)| *s == ShaderType::RayGeneration) {
                return Err(GPUError::UnsupportedShaderStage(*first));
            }
            // One shader per binding-table group.
            for (i, (s, _)) in stages.iter().enumerate() {
                if stages[..i].iter().any(|(prev, _)| prev == s) {
                    return Err(GPUError::UnsupportedShaderStage(*s));
                }
            }
            return Ok(ShaderKind::RayTracing);
        }
        if let [(ShaderType::Compute, _)] = stages {
            return Ok(ShaderKind::Compute);
        }
        match stages
            .iter()
            .find(|(s, _)| !matches!(s, ShaderType::Vertex | ShaderType::Fragment))
        {
            Some((bad, _)) => Err(GPUError::UnsupportedShaderStage(*bad)),
            None => Ok(ShaderKind::Graphics),
        }
    }

    pub fn bind_point(self) -> vk::PipelineBindPoint {
        match self {
            ShaderKind::Graphics => vk::PipelineBindPoint::GRAPHICS,
            ShaderKind::Compute => vk::PipelineBindPoint::COMPUTE,
            ShaderKind::RayTracing => vk::PipelineBindPoint::RAY_TRACING_KHR,
        }
    }
}

/// Everything needed to record work with one variant.
#[derive(Debug, Clone)]
pub struct DrawBinding {
    pub pipeline: CachedPipeline,
    /// Per-frame set, followed by the per-draw set when the variant has one.
    pub sets: SmallVec<[vk::DescriptorSet; 2]>,
}

/// One compiled permutation of a shader object.
#[derive(Debug)]
pub struct ShaderVariant {
    id: PermutationId,
    kind: ShaderKind,
    stages: Vec<StageModule>,
    set_layouts: SmallVec<[vk::DescriptorSetLayout; 2]>,
    per_frame_set: vk::DescriptorSet,
    per_draw_layout: Option<vk::DescriptorSetLayout>,
    per_draw_bindings: Vec<LayoutBinding>,
    pipelines: PipelineCache,
    sets: DescriptorSetCache,
}

impl ShaderVariant {
    pub fn id(&self) -> PermutationId {
        self.id
    }

    pub fn kind(&self) -> ShaderKind {
        self.kind
    }

    pub fn stages(&self) -> &[StageModule] {
        &self.stages
    }

    pub fn per_draw_layout(&self) -> Option<vk::DescriptorSetLayout> {
        self.per_draw_layout
    }

    pub fn per_draw_bindings(&self) -> &[LayoutBinding] {
        &self.per_draw_bindings
    }

    pub fn pipeline_count(&self) -> usize {
        self.pipelines.len()
    }

    pub fn binding_set_count(&self) -> usize {
        self.sets.len()
    }

    /// Pipeline for `state` against `pass`. Compute and ray-tracing variants
    /// ignore `state` and always use the non-rasterizing key.
    pub fn pipeline<D: Device>(
        &mut self,
        device: &D,
        pass: &PassDescription,
        state: &RenderState,
    ) -> Result<CachedPipeline> {
        let state = match self.kind {
            ShaderKind::Graphics => *state,
            ShaderKind::Compute | ShaderKind::RayTracing => RenderState::non_rasterizing(),
        };
        self.pipelines
            .get_or_create(device, &self.set_layouts, &self.stages, pass, &state)
    }

    /// Per-draw set for `mask`, `None` when the variant binds nothing per draw.
    pub fn binding_set<D: Device>(
        &mut self,
        device: &D,
        mask: u32,
    ) -> Result<Option<vk::DescriptorSet>> {
        self.sets.get_or_allocate(device, self.per_draw_layout, mask)
    }

    /// Writer for the per-draw set of `mask`. Writes land in the shared set,
    /// so every later draw with the same mask reads them.
    pub fn binder<D: Device>(&mut self, device: &D, mask: u32) -> Result<Option<BindingWriter>> {
        Ok(self.binding_set(device, mask)?.map(BindingWriter::new))
    }

    /// Resolves pipeline and descriptor sets for one draw, dispatch or trace.
    pub fn prepare<D: Device>(
        &mut self,
        device: &D,
        pass: &PassDescription,
        state: &RenderState,
        mask: u32,
    ) -> Result<DrawBinding> {
        let pipeline = self.pipeline(device, pass, state)?;
        let mut sets = SmallVec::new();
        sets.push(self.per_frame_set);
        if let Some(set) = self.binding_set(device, mask)? {
            sets.push(set);
        }
        Ok(DrawBinding { pipeline, sets })
    }

    fn destroy<D: Device>(mut self, device: &D) {
        self.pipelines.destroy(device);
        self.sets.release_all(device);
        if let Some(layout) = self.per_draw_layout.take() {
            device.destroy_descriptor_set_layout(layout);
        }
        for stage in self.stages.drain(..) {
            device.destroy_shader_module(stage.module);
        }
    }
}

/// Source text plus the stages compiled from it, and every variant built so
/// far.
#[derive(Debug)]
pub struct ShaderObject {
    name: String,
    source: String,
    stages: Vec<(ShaderType, String)>,
    kind: ShaderKind,
    lease: Option<PerFrameLease>,
    variants: HashMap<PermutationId, ShaderVariant>,
    disk_cache: Option<DiskCache>,
    strict_reflection: bool,
}

impl ShaderObject {
    /// Creates the object and takes a lease on the per-frame set.
    pub fn new<D: Device>(
        device: &D,
        registry: &mut PerFrameRegistry,
        name: impl Into<String>,
        source: impl Into<String>,
        stages: &[(ShaderType, &str)],
    ) -> Result<Self> {
        let stages: Vec<(ShaderType, String)> =
            stages.iter().map(|(s, e)| (*s, e.to_string())).collect();
        let kind = ShaderKind::of(&stages)?;
        let lease = registry.acquire(device)?;
        Ok(Self {
            name: name.into(),
            source: source.into(),
            stages,
            kind,
            lease: Some(lease),
            variants: HashMap::new(),
            disk_cache: None,
            strict_reflection: false,
        })
    }

    pub fn with_disk_cache(mut self, cache: Option<DiskCache>) -> Self {
        self.disk_cache = cache;
        self
    }

    /// Makes bindings outside sets 0 and 1 fail the variant.
    pub fn with_strict_reflection(mut self, strict: bool) -> Self {
        self.strict_reflection = strict;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ShaderKind {
        self.kind
    }

    pub fn variant_count(&self) -> usize {
        self.variants.len()
    }

    pub fn get_variant(&self, id: PermutationId) -> Option<&ShaderVariant> {
        self.variants.get(&id)
    }

    pub fn get_variant_mut(&mut self, id: PermutationId) -> Option<&mut ShaderVariant> {
        self.variants.get_mut(&id)
    }

    /// Returns the variant for `id`, compiling every stage on first request.
    ///
    /// A stage that fails to compile aborts the whole variant: modules built
    /// for earlier stages are destroyed and nothing is registered, so the
    /// next request for `id` compiles again.
    pub fn variant<D, C>(
        &mut self,
        device: &D,
        compiler: &C,
        id: PermutationId,
    ) -> Result<&mut ShaderVariant>
    where
        D: Device,
        C: ShaderCompiler + ?Sized,
    {
        if !self.variants.contains_key(&id) {
            let variant = self.build_variant(device, compiler, id)?;
            self.variants.insert(id, variant);
        }
        self.variants.get_mut(&id).ok_or(GPUError::InvalidHandle)
    }

    fn compile_stage<C: ShaderCompiler + ?Sized>(
        &self,
        compiler: &C,
        stage: ShaderType,
        entry: &str,
        macros: &[String],
    ) -> std::result::Result<Vec<u32>, CompileError> {
        let request = CompileRequest {
            source: &self.source,
            entry,
            stage,
            macros,
        };
        if let Some(spirv) = self.disk_cache.as_ref().and_then(|c| c.load(&request)) {
            log::debug!("{}: {:?} '{}' loaded from disk cache", self.name, stage, entry);
            return Ok(spirv);
        }
        let spirv = compiler.compile(&request)?;
        if let Some(cache) = &self.disk_cache {
            cache.store(&request, &spirv);
        }
        Ok(spirv)
    }

    fn build_variant<D, C>(&self, device: &D, compiler: &C, id: PermutationId) -> Result<ShaderVariant>
    where
        D: Device,
        C: ShaderCompiler + ?Sized,
    {
        let lease = self.lease.as_ref().ok_or(GPUError::InvalidHandle)?;
        let macros = permutation_macros(id);
        log::debug!("{}: compiling variant {:?} with {:?}", self.name, id, macros);

        let mut modules: Vec<StageModule> = Vec::with_capacity(self.stages.len());
        let mut per_draw: Vec<(ShaderType, Vec<BindingDescriptor>)> = Vec::new();

        let abort = |device: &D, modules: Vec<StageModule>| {
            for m in modules {
                device.destroy_shader_module(m.module);
            }
        };

        for (stage, entry) in &self.stages {
            let fail = |diagnostics: String| {
                GPUError::Compile(
                    Box::new(CompileError {
                        stage: *stage,
                        entry: entry.clone(),
                        macros: macros.clone(),
                        diagnostics,
                    }),
                    id,
                )
            };

            let spirv = match self.compile_stage(compiler, *stage, entry, &macros) {
                Ok(spirv) => spirv,
                Err(e) => {
                    log::error!("{}: {}", self.name, e);
                    abort(device, modules);
                    return Err(GPUError::Compile(Box::new(e), id));
                }
            };

            let bindings = match compiler.reflect(*stage, &spirv) {
                Ok(bindings) => bindings,
                Err(e) => {
                    log::error!("{}: {:?} '{}': {}", self.name, stage, entry, e);
                    abort(device, modules);
                    return Err(fail(e));
                }
            };
            let reflection = StageReflection::classify(*stage, bindings);
            if self.strict_reflection {
                if let Err(e) = reflection.check() {
                    log::error!("{}: {:?} '{}': {}", self.name, stage, entry, e);
                    abort(device, modules);
                    return Err(e);
                }
            }

            let entry_name = match CString::new(entry.as_str()) {
                Ok(name) => name,
                Err(_) => {
                    abort(device, modules);
                    return Err(fail("entry point contains a NUL byte".to_string()));
                }
            };
            let module = match device.create_shader_module(&spirv) {
                Ok(module) => module,
                Err(e) => {
                    abort(device, modules);
                    return Err(e);
                }
            };
            modules.push(StageModule {
                stage: *stage,
                entry: entry_name,
                module,
            });
            per_draw.push((*stage, reflection.per_draw));
        }

        let per_draw_bindings =
            merge_per_draw_bindings(per_draw.iter().map(|(s, b)| (*s, b.as_slice())));
        let per_draw_layout = if per_draw_bindings.is_empty() {
            None
        } else {
            match device.create_descriptor_set_layout(&per_draw_bindings) {
                Ok(layout) => Some(layout),
                Err(e) => {
                    abort(device, modules);
                    return Err(e);
                }
            }
        };

        let mut set_layouts = SmallVec::new();
        set_layouts.push(lease.layout());
        if let Some(layout) = per_draw_layout {
            set_layouts.push(layout);
        }

        Ok(ShaderVariant {
            id,
            kind: self.kind,
            stages: modules,
            set_layouts,
            per_frame_set: lease.set(),
            per_draw_layout,
            per_draw_bindings,
            pipelines: PipelineCache::new(),
            sets: DescriptorSetCache::new(),
        })
    }

    /// Releases every variant and returns the per-frame lease.
    pub fn destroy<D: Device>(mut self, device: &D, registry: &mut PerFrameRegistry) {
        for (_, variant) in self.variants.drain() {
            variant.destroy(device);
        }
        if let Some(lease) = self.lease.take() {
            registry.release(device, lease);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stages(list: &[ShaderType]) -> Vec<(ShaderType, String)> {
        list.iter().map(|s| (*s, "main".to_string())).collect()
    }

    #[test]
    fn kind_follows_stage_set() {
        use ShaderType::*;
        assert_eq!(
            ShaderKind::of(&stages(&[Vertex, Fragment])).unwrap(),
            ShaderKind::Graphics
        );
        assert_eq!(ShaderKind::of(&stages(&[Compute])).unwrap(), ShaderKind::Compute);
        assert_eq!(
            ShaderKind::of(&stages(&[RayGeneration, RayMiss, RayClosestHit])).unwrap(),
            ShaderKind::RayTracing
        );
        assert!(ShaderKind::of(&stages(&[RayMiss])).is_err());
        assert!(matches!(
            ShaderKind::of(&stages(&[RayGeneration, RayMiss, RayMiss])),
            Err(GPUError::UnsupportedShaderStage(RayMiss))
        ));
        assert!(ShaderKind::of(&stages(&[Vertex, Compute])).is_err());
        assert!(ShaderKind::of(&[]).is_err());
    }
}
