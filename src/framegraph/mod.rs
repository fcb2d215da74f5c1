//! Pass declarations and per-pass command recording.
//!
//! Passes run in exactly the order they are handed to
//! [`Renderer::render_frame`]; nothing is reordered or inferred. Each pass
//! lists the tracked images it touches together with the state it needs
//! them in, and the recorder inserts whatever barriers the tracked state
//! demands before binding and issuing the pass's work.

use ash::vk;
use smallvec::SmallVec;

use crate::gpu::error::{GPUError, Result};
use crate::gpu::structs::{
    IndexedDraw, PassDescription, PermutationId, RenderPassBegin, RenderState, ShaderBindingTable,
};
use crate::gpu::Device;
use crate::shader::{DrawBinding, ShaderCompiler, ShaderKind, ShaderObject};
use crate::sync::{BarrierBuilder, ImageTracker, ResState, TrackedImage};
use crate::utils::{Handle, Pool};

mod renderer;

pub use renderer::{FrameReport, Renderer};

/// Indices in the shared full-screen quad index buffer.
pub const FULLSCREEN_INDEX_COUNT: u32 = 6;

/// Describes usage of an image in a pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageUse {
    pub image: Handle<TrackedImage>,
    pub state: ResState,
}

/// Framebuffer a graphics pass renders into.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Framebuffer {
    Fixed(vk::Framebuffer),
    /// One framebuffer per swapchain image, picked by the acquired index.
    Swapchain(Vec<vk::Framebuffer>),
}

impl Framebuffer {
    fn resolve(&self, image_index: Option<u32>) -> Result<vk::Framebuffer> {
        match self {
            Framebuffer::Fixed(fb) => Ok(*fb),
            Framebuffer::Swapchain(fbs) => image_index
                .and_then(|i| fbs.get(i as usize).copied())
                .ok_or(GPUError::InvalidHandle),
        }
    }
}

/// Render target of a graphics pass.
#[derive(Clone)]
pub struct PassTarget {
    pub pass: PassDescription,
    pub framebuffer: Framebuffer,
    pub area: vk::Rect2D,
    pub clear_values: SmallVec<[vk::ClearValue; 4]>,
}

impl PassTarget {
    pub fn new(pass: PassDescription, framebuffer: Framebuffer, extent: vk::Extent2D) -> Self {
        Self {
            pass,
            framebuffer,
            area: vk::Rect2D {
                offset: vk::Offset2D::default(),
                extent,
            },
            clear_values: SmallVec::new(),
        }
    }

    pub fn clear_color(mut self, rgba: [f32; 4]) -> Self {
        self.clear_values.push(vk::ClearValue {
            color: vk::ClearColorValue { float32: rgba },
        });
        self
    }

    pub fn clear_depth(mut self, depth: f32) -> Self {
        self.clear_values.push(vk::ClearValue {
            depth_stencil: vk::ClearDepthStencilValue { depth, stencil: 0 },
        });
        self
    }
}

/// One indexed draw. Permutation and binding mask fall back to the pass's
/// when unset.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Draw {
    pub permutation: Option<PermutationId>,
    pub binding_mask: Option<u32>,
    pub vertex_buffer: Option<vk::Buffer>,
    pub index_buffer: vk::Buffer,
    pub draw: IndexedDraw,
}

impl Draw {
    pub fn new(index_buffer: vk::Buffer, index_count: u32) -> Self {
        Self {
            permutation: None,
            binding_mask: None,
            vertex_buffer: None,
            index_buffer,
            draw: IndexedDraw::new(index_count),
        }
    }

    /// Full-screen quad drawn from a shared index buffer, no vertex stream.
    pub fn fullscreen(index_buffer: vk::Buffer) -> Self {
        Self::new(index_buffer, FULLSCREEN_INDEX_COUNT)
    }

    pub fn mesh(vertex_buffer: vk::Buffer, index_buffer: vk::Buffer, index_count: u32) -> Self {
        Self {
            vertex_buffer: Some(vertex_buffer),
            ..Self::new(index_buffer, index_count)
        }
    }

    pub fn permutation(mut self, id: PermutationId) -> Self {
        self.permutation = Some(id);
        self
    }

    pub fn binding_mask(mut self, mask: u32) -> Self {
        self.binding_mask = Some(mask);
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PassWork {
    Draws(Vec<Draw>),
    Dispatch([u32; 3]),
    TraceRays([u32; 3]),
}

/// Declaration for a render, compute or ray-tracing pass.
#[derive(Clone)]
pub struct PassDecl {
    pub name: String,
    pub shader: Handle<ShaderObject>,
    pub permutation: PermutationId,
    pub binding_mask: u32,
    pub state: RenderState,
    pub images: SmallVec<[ImageUse; 4]>,
    pub target: Option<PassTarget>,
    pub work: PassWork,
}

impl PassDecl {
    fn new(name: impl Into<String>, shader: Handle<ShaderObject>, work: PassWork) -> Self {
        Self {
            name: name.into(),
            shader,
            permutation: PermutationId::default(),
            binding_mask: 0,
            state: RenderState::default(),
            images: SmallVec::new(),
            target: None,
            work,
        }
    }

    pub fn graphics(
        name: impl Into<String>,
        shader: Handle<ShaderObject>,
        target: PassTarget,
    ) -> Self {
        Self {
            target: Some(target),
            ..Self::new(name, shader, PassWork::Draws(Vec::new()))
        }
    }

    pub fn compute(name: impl Into<String>, shader: Handle<ShaderObject>, groups: [u32; 3]) -> Self {
        Self {
            state: RenderState::non_rasterizing(),
            ..Self::new(name, shader, PassWork::Dispatch(groups))
        }
    }

    pub fn trace_rays(
        name: impl Into<String>,
        shader: Handle<ShaderObject>,
        extent: [u32; 3],
    ) -> Self {
        Self {
            state: RenderState::non_rasterizing(),
            ..Self::new(name, shader, PassWork::TraceRays(extent))
        }
    }

    pub fn permutation(mut self, id: PermutationId) -> Self {
        self.permutation = id;
        self
    }

    pub fn binding_mask(mut self, mask: u32) -> Self {
        self.binding_mask = mask;
        self
    }

    pub fn state(mut self, state: RenderState) -> Self {
        self.state = state;
        self
    }

    pub fn uses(mut self, image: Handle<TrackedImage>, state: ResState) -> Self {
        self.images.push(ImageUse { image, state });
        self
    }

    pub fn draw(mut self, draw: Draw) -> Self {
        if let PassWork::Draws(draws) = &mut self.work {
            draws.push(draw);
        }
        self
    }
}

/// Canonical pass order of a deferred frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DeferredPass {
    ZPrepass,
    GBuffer,
    Ssao,
    ShadowRaytrace,
    Lighting,
    Skybox,
    Tonemap,
}

impl DeferredPass {
    pub const ORDER: [DeferredPass; 7] = [
        DeferredPass::ZPrepass,
        DeferredPass::GBuffer,
        DeferredPass::Ssao,
        DeferredPass::ShadowRaytrace,
        DeferredPass::Lighting,
        DeferredPass::Skybox,
        DeferredPass::Tonemap,
    ];

    pub fn name(self) -> &'static str {
        match self {
            DeferredPass::ZPrepass => "zprepass",
            DeferredPass::GBuffer => "gbuffer",
            DeferredPass::Ssao => "ssao",
            DeferredPass::ShadowRaytrace => "shadow_raytrace",
            DeferredPass::Lighting => "lighting",
            DeferredPass::Skybox => "skybox",
            DeferredPass::Tonemap => "tonemap",
        }
    }
}

/// Borrowed renderer state needed to record passes into one command buffer.
pub(crate) struct PassRecorder<'a, D: Device> {
    pub device: &'a D,
    pub compiler: &'a dyn ShaderCompiler,
    pub shaders: &'a mut Pool<ShaderObject>,
    pub images: &'a mut ImageTracker,
}

impl<'a, D: Device> PassRecorder<'a, D> {
    /// Records `pass` and returns the number of barriers it needed.
    pub fn record(
        &mut self,
        cmd: vk::CommandBuffer,
        pass: &PassDecl,
        image_index: Option<u32>,
    ) -> Result<usize> {
        let shader = self
            .shaders
            .get_mut_ref(pass.shader)
            .ok_or(GPUError::InvalidHandle)?;
        let expected = match pass.work {
            PassWork::Draws(_) => ShaderKind::Graphics,
            PassWork::Dispatch(_) => ShaderKind::Compute,
            PassWork::TraceRays(_) => ShaderKind::RayTracing,
        };
        if shader.kind() != expected {
            return Err(GPUError::InvalidPass(format!(
                "'{}' needs a {:?} shader but '{}' is {:?}",
                pass.name,
                expected,
                shader.name(),
                shader.kind()
            )));
        }

        // Plan the barriers, then resolve every pipeline and descriptor set.
        // Nothing is recorded or committed to the tracker until both
        // succeed.
        let mut barriers = BarrierBuilder::new(&mut *self.images);
        for usage in &pass.images {
            barriers.require(usage.image, usage.state)?;
        }

        let work = match &pass.work {
            PassWork::Draws(draws) => {
                let target = pass.target.as_ref().ok_or_else(|| {
                    GPUError::InvalidPass(format!("'{}' draws without a render target", pass.name))
                })?;
                let framebuffer = target.framebuffer.resolve(image_index)?;
                let mut resolved = Vec::with_capacity(draws.len());
                for draw in draws {
                    let id = draw.permutation.unwrap_or(pass.permutation);
                    let mask = draw.binding_mask.unwrap_or(pass.binding_mask);
                    let binding = shader
                        .variant(self.device, self.compiler, id)?
                        .prepare(self.device, &target.pass, &pass.state, mask)?;
                    resolved.push((draw, binding));
                }
                Resolved::Draws {
                    target,
                    framebuffer,
                    draws: resolved,
                }
            }
            PassWork::Dispatch(groups) => Resolved::Dispatch(
                shader.variant(self.device, self.compiler, pass.permutation)?.prepare(
                    self.device,
                    &PassDescription::default(),
                    &pass.state,
                    pass.binding_mask,
                )?,
                *groups,
            ),
            PassWork::TraceRays(extent) => {
                let binding = shader.variant(self.device, self.compiler, pass.permutation)?.prepare(
                    self.device,
                    &PassDescription::default(),
                    &pass.state,
                    pass.binding_mask,
                )?;
                let table = binding.pipeline.binding_table.ok_or_else(|| {
                    GPUError::InvalidPass(format!("'{}' has no shader binding table", pass.name))
                })?;
                Resolved::TraceRays(binding, table, *extent)
            }
        };

        let barrier_count = barriers.emit(self.device, cmd)?;

        log::trace!("recording pass '{}'", pass.name);
        match work {
            Resolved::Draws {
                target,
                framebuffer,
                draws,
            } => {
                self.device.cmd_begin_render_pass(
                    cmd,
                    &RenderPassBegin {
                        render_pass: target.pass.render_pass,
                        framebuffer,
                        area: target.area,
                        clear_values: &target.clear_values,
                    },
                );
                self.device.cmd_set_viewport_scissor(cmd, target.area);

                let mut bound_pipeline = vk::Pipeline::null();
                let mut bound_sets: SmallVec<[vk::DescriptorSet; 2]> = SmallVec::new();
                for (draw, binding) in draws {
                    let pipeline = binding.pipeline;
                    if pipeline.pipeline != bound_pipeline {
                        self.device
                            .cmd_bind_pipeline(cmd, pipeline.bind_point, pipeline.pipeline);
                        bound_pipeline = pipeline.pipeline;
                        bound_sets.clear();
                    }
                    if binding.sets != bound_sets {
                        self.device.cmd_bind_descriptor_sets(
                            cmd,
                            pipeline.bind_point,
                            pipeline.layout,
                            &binding.sets,
                        );
                        bound_sets = binding.sets;
                    }
                    if let Some(vertices) = draw.vertex_buffer {
                        self.device.cmd_bind_vertex_buffer(cmd, vertices);
                    }
                    self.device.cmd_bind_index_buffer(cmd, draw.index_buffer);
                    self.device.cmd_draw_indexed(cmd, draw.draw);
                }

                self.device.cmd_end_render_pass(cmd);
            }
            Resolved::Dispatch(binding, groups) => {
                self.bind(cmd, &binding);
                self.device.cmd_dispatch(cmd, groups);
            }
            Resolved::TraceRays(binding, table, extent) => {
                self.bind(cmd, &binding);
                self.device.cmd_trace_rays(cmd, &table, extent);
            }
        }
        Ok(barrier_count)
    }

    fn bind(&self, cmd: vk::CommandBuffer, binding: &DrawBinding) {
        let pipeline = &binding.pipeline;
        self.device
            .cmd_bind_pipeline(cmd, pipeline.bind_point, pipeline.pipeline);
        self.device
            .cmd_bind_descriptor_sets(cmd, pipeline.bind_point, pipeline.layout, &binding.sets);
    }
}

/// Pass work with its pipelines and sets already resolved.
enum Resolved<'p> {
    Draws {
        target: &'p PassTarget,
        framebuffer: vk::Framebuffer,
        draws: Vec<(&'p Draw, DrawBinding)>,
    },
    Dispatch(DrawBinding, [u32; 3]),
    TraceRays(DrawBinding, ShaderBindingTable, [u32; 3]),
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle as _;

    #[test]
    fn swapchain_framebuffer_follows_image_index() {
        let fbs = Framebuffer::Swapchain(vec![
            vk::Framebuffer::from_raw(10),
            vk::Framebuffer::from_raw(11),
        ]);
        assert_eq!(fbs.resolve(Some(1)).unwrap(), vk::Framebuffer::from_raw(11));
        assert!(fbs.resolve(Some(2)).is_err());
        assert!(fbs.resolve(None).is_err());

        let fixed = Framebuffer::Fixed(vk::Framebuffer::from_raw(3));
        assert_eq!(fixed.resolve(None).unwrap(), vk::Framebuffer::from_raw(3));
    }

    #[test]
    fn deferred_order_ends_with_tonemap() {
        let names: Vec<&str> = DeferredPass::ORDER.iter().map(|p| p.name()).collect();
        assert_eq!(names.first(), Some(&"zprepass"));
        assert_eq!(names.last(), Some(&"tonemap"));
        assert_eq!(names.len(), 7);
    }
}
