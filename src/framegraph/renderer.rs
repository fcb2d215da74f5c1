use ash::vk;

use super::{PassDecl, PassRecorder};
use crate::config::RendererConfig;
use crate::gpu::accel::{AccelerationStructure, AccelerationStructureBuilder};
use crate::gpu::error::{GPUError, Result};
use crate::gpu::execution::{BindingWriter, CachedPipeline, PerFrameRegistry};
use crate::gpu::structs::{PassDescription, PermutationId, RenderState, ShaderType};
use crate::gpu::timing::GpuTimer;
use crate::gpu::{Device, Presenter};
use crate::shader::{DiskCache, ShaderCompiler, ShaderObject, ShaderVariant};
use crate::sync::{ImageTracker, TrackedImage};
use crate::utils::{Handle, Pool};

/// Outcome of one presented frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameReport {
    pub image_index: u32,
    pub passes: usize,
    pub barriers: usize,
    /// Top-to-bottom-of-pipe GPU time.
    pub gpu_ms: f64,
}

/// Owns the device, the shader objects and the tracked images, and drives
/// one synchronous frame at a time.
pub struct Renderer<D: Device> {
    device: D,
    compiler: Box<dyn ShaderCompiler>,
    per_frame: PerFrameRegistry,
    images: ImageTracker,
    shaders: Pool<ShaderObject>,
    timer: GpuTimer,
    generation: Option<u64>,
    disk_cache: Option<DiskCache>,
    strict_reflection: bool,
}

impl<D: Device> Renderer<D> {
    pub fn new(device: D, compiler: Box<dyn ShaderCompiler>) -> Self {
        Self {
            device,
            compiler,
            per_frame: PerFrameRegistry::new(),
            images: ImageTracker::new(),
            shaders: Pool::default(),
            timer: GpuTimer::new(),
            generation: None,
            disk_cache: None,
            strict_reflection: false,
        }
    }

    pub fn with_config(device: D, compiler: Box<dyn ShaderCompiler>, cfg: &RendererConfig) -> Self {
        let mut r = Self::new(device, compiler);
        r.disk_cache = cfg.disk_cache();
        r.strict_reflection = cfg.strict_reflection;
        r
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn images(&self) -> &ImageTracker {
        &self.images
    }

    pub fn per_frame(&self) -> &PerFrameRegistry {
        &self.per_frame
    }

    /// Writer for the shared per-frame set, available while any shader lives.
    pub fn per_frame_binder(&self) -> Option<BindingWriter> {
        self.per_frame.binder()
    }

    pub fn last_gpu_ms(&self) -> Option<f64> {
        self.timer.last_ms()
    }

    pub fn create_shader(
        &mut self,
        name: &str,
        source: &str,
        stages: &[(ShaderType, &str)],
    ) -> Result<Handle<ShaderObject>> {
        let shader = ShaderObject::new(&self.device, &mut self.per_frame, name, source, stages)?
            .with_disk_cache(self.disk_cache.clone())
            .with_strict_reflection(self.strict_reflection);
        match self.shaders.insert(shader) {
            Some(handle) => Ok(handle),
            None => Err(GPUError::PoolExhausted),
        }
    }

    pub fn shader(&self, handle: Handle<ShaderObject>) -> Result<&ShaderObject> {
        self.shaders.get_ref(handle).ok_or(GPUError::InvalidHandle)
    }

    /// Compiles the variant now. Calling this for every permutation a frame
    /// uses moves compile errors to startup.
    pub fn variant(
        &mut self,
        handle: Handle<ShaderObject>,
        id: PermutationId,
    ) -> Result<&mut ShaderVariant> {
        let shader = self
            .shaders
            .get_mut_ref(handle)
            .ok_or(GPUError::InvalidHandle)?;
        shader.variant(&self.device, self.compiler.as_ref(), id)
    }

    /// Builds or fetches the pipeline of variant `id` for `state`.
    pub fn pipeline(
        &mut self,
        handle: Handle<ShaderObject>,
        id: PermutationId,
        pass: &PassDescription,
        state: &RenderState,
    ) -> Result<CachedPipeline> {
        let shader = self
            .shaders
            .get_mut_ref(handle)
            .ok_or(GPUError::InvalidHandle)?;
        shader
            .variant(&self.device, self.compiler.as_ref(), id)?
            .pipeline(&self.device, pass, state)
    }

    /// Writer for the per-draw set of `mask`; `None` when the variant has no
    /// per-draw bindings.
    pub fn binder(
        &mut self,
        handle: Handle<ShaderObject>,
        id: PermutationId,
        mask: u32,
    ) -> Result<Option<BindingWriter>> {
        let shader = self
            .shaders
            .get_mut_ref(handle)
            .ok_or(GPUError::InvalidHandle)?;
        shader
            .variant(&self.device, self.compiler.as_ref(), id)?
            .binder(&self.device, mask)
    }

    pub fn destroy_shader(&mut self, handle: Handle<ShaderObject>) {
        if let Some(shader) = self.shaders.take(handle) {
            shader.destroy(&self.device, &mut self.per_frame);
        }
    }

    pub fn register_image(
        &mut self,
        name: &str,
        image: vk::Image,
        view: vk::ImageView,
        aspect: vk::ImageAspectFlags,
    ) -> Result<Handle<TrackedImage>> {
        self.images.register(name, image, view, aspect)
    }

    pub fn unregister_image(&mut self, handle: Handle<TrackedImage>) -> Option<TrackedImage> {
        self.images.unregister(handle)
    }

    pub fn build_acceleration_structure(
        &self,
        builder: AccelerationStructureBuilder,
    ) -> Result<AccelerationStructure> {
        builder.build(&self.device)
    }

    pub fn destroy_acceleration_structure(&self, accel: &AccelerationStructure) {
        self.device.destroy_acceleration_structure(accel);
    }

    fn recorder(&mut self) -> PassRecorder<'_, D> {
        PassRecorder {
            device: &self.device,
            compiler: self.compiler.as_ref(),
            shaders: &mut self.shaders,
            images: &mut self.images,
        }
    }

    /// Records `passes` into a one-shot command buffer and waits for it.
    /// Barriers go through the same tracker as frame passes. Swapchain
    /// framebuffers cannot be used here.
    ///
    /// On error the tracked image states are rolled back to what they were
    /// on entry.
    pub fn submit_once(&mut self, passes: &[PassDecl]) -> Result<usize> {
        let saved = self.images.snapshot();
        let mut recorder = self.recorder();
        let device = recorder.device;
        let mut barriers = 0;
        let submitted = device.submit_once(&mut |cmd| {
            for pass in passes {
                barriers += recorder.record(cmd, pass, None)?;
            }
            Ok(())
        });
        if let Err(e) = submitted {
            self.images.restore(saved);
            return Err(e);
        }
        Ok(barriers)
    }

    /// Records, submits and presents one frame, then waits for the device
    /// and reads the frame's GPU time back.
    ///
    /// Returns [`GPUError::SwapchainStale`] without recording anything when
    /// the swapchain was replaced since the previous frame or the acquire
    /// reports it out of date. A pass that fails to record abandons the
    /// frame and rolls the tracked image states back. A failed present is
    /// returned only after the submitted frame has finished.
    pub fn render_frame<P: Presenter>(
        &mut self,
        presenter: &mut P,
        passes: &[PassDecl],
    ) -> Result<FrameReport> {
        let generation = presenter.generation();
        match self.generation {
            Some(seen) if seen != generation => {
                self.generation = Some(generation);
                log::warn!("swapchain generation {} -> {}, skipping frame", seen, generation);
                return Err(GPUError::SwapchainStale);
            }
            _ => self.generation = Some(generation),
        }

        let Some(acquired) = presenter.acquire()? else {
            log::warn!("swapchain out of date on acquire, skipping frame");
            return Err(GPUError::SwapchainStale);
        };
        let waits = [(
            acquired.acquired,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        )];

        let saved = self.images.snapshot();
        let cmd = match self.device.begin_frame() {
            Ok(cmd) => cmd,
            Err(e) => {
                self.abandon(vk::CommandBuffer::null(), &waits);
                return Err(e);
            }
        };
        let recorded = self.record_frame(cmd, passes, acquired.index).and_then(|barriers| {
            self.device
                .submit(cmd, &waits, &[acquired.render_finished])
                .map(|_| barriers)
        });
        let barriers = match recorded {
            Ok(barriers) => barriers,
            Err(e) => {
                log::error!("abandoning frame on image {}: {}", acquired.index, e);
                self.images.restore(saved);
                self.abandon(cmd, &waits);
                return Err(e);
            }
        };

        let presented = presenter.present(&acquired);
        self.device.wait_idle()?;
        let gpu_ms = self.timer.resolve(&self.device)?;
        if let Err(e) = presented {
            log::warn!("present of image {} failed: {}", acquired.index, e);
            return Err(e);
        }

        log::debug!(
            "frame on image {}: {} passes, {} barriers, {:.3} ms",
            acquired.index,
            passes.len(),
            barriers,
            gpu_ms
        );
        Ok(FrameReport {
            image_index: acquired.index,
            passes: passes.len(),
            barriers,
            gpu_ms,
        })
    }

    fn record_frame(
        &mut self,
        cmd: vk::CommandBuffer,
        passes: &[PassDecl],
        image_index: u32,
    ) -> Result<usize> {
        self.timer.begin(&self.device, cmd);
        let mut barriers = 0;
        {
            let mut recorder = self.recorder();
            for pass in passes {
                barriers += recorder.record(cmd, pass, Some(image_index))?;
            }
        }
        self.timer.end(&self.device, cmd);
        self.device.end_frame(cmd)?;
        Ok(barriers)
    }

    fn abandon(&self, cmd: vk::CommandBuffer, waits: &[(vk::Semaphore, vk::PipelineStageFlags)]) {
        if let Err(e) = self.device.abandon_frame(cmd, waits) {
            log::error!("failed to abandon frame: {}", e);
        }
    }
}

impl<D: Device> Drop for Renderer<D> {
    fn drop(&mut self) {
        if let Err(e) = self.device.wait_idle() {
            log::error!("wait idle failed during teardown: {}", e);
        }
        for shader in self.shaders.drain() {
            shader.destroy(&self.device, &mut self.per_frame);
        }
    }
}
