#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Once;

use ash::vk;
use ash::vk::Handle as _;
use vkdeferred::gpu::null::NullDevice;
use vkdeferred::gpu::structs::{BindingDescriptor, DescriptorKind, ShaderType};
use vkdeferred::gpu::{AcquiredImage, Presenter};
use vkdeferred::shader::{CompileRequest, ShaderCompiler};
use vkdeferred::{CompileError, GPUError, Renderer, Result};

static LOGGER: Once = Once::new();

pub fn init_logging() {
    LOGGER.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

/// What the fake compiler saw and what it should do next.
#[derive(Default)]
pub struct CompilerScript {
    pub bindings: HashMap<ShaderType, Vec<BindingDescriptor>>,
    /// Compiles of `stage` fail whenever this macro is defined.
    pub fail: Option<(ShaderType, String)>,
    pub compiles: Vec<(ShaderType, Vec<String>)>,
}

/// Compiler that never looks at the source. It emits a tiny word stream
/// and reports whatever bindings the script lists for the stage.
#[derive(Clone, Default)]
pub struct FakeCompiler {
    pub script: Rc<RefCell<CompilerScript>>,
}

impl FakeCompiler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_binding(self, stage: ShaderType, binding: BindingDescriptor) -> Self {
        self.script
            .borrow_mut()
            .bindings
            .entry(stage)
            .or_default()
            .push(binding);
        self
    }

    pub fn fail_on(&self, stage: ShaderType, macro_name: &str) {
        self.script.borrow_mut().fail = Some((stage, macro_name.to_string()));
    }

    pub fn stop_failing(&self) {
        self.script.borrow_mut().fail = None;
    }

    pub fn compile_count(&self) -> usize {
        self.script.borrow().compiles.len()
    }

    pub fn compiles_of(&self, stage: ShaderType) -> usize {
        self.script
            .borrow()
            .compiles
            .iter()
            .filter(|(s, _)| *s == stage)
            .count()
    }

    pub fn boxed(&self) -> Box<dyn ShaderCompiler> {
        Box::new(self.clone())
    }
}

impl ShaderCompiler for FakeCompiler {
    fn compile(&self, request: &CompileRequest<'_>) -> std::result::Result<Vec<u32>, CompileError> {
        let mut script = self.script.borrow_mut();
        script
            .compiles
            .push((request.stage, request.macros.to_vec()));
        if let Some((stage, name)) = &script.fail {
            if *stage == request.stage && request.macros.iter().any(|m| m == name) {
                return Err(CompileError {
                    stage: request.stage,
                    entry: request.entry.to_string(),
                    macros: request.macros.to_vec(),
                    diagnostics: format!("error: {} is not supported", name),
                });
            }
        }
        Ok(vec![0x0723_0203, request.stage as u32, request.macros.len() as u32])
    }

    fn reflect(
        &self,
        stage: ShaderType,
        _spirv: &[u32],
    ) -> std::result::Result<Vec<BindingDescriptor>, String> {
        Ok(self
            .script
            .borrow()
            .bindings
            .get(&stage)
            .cloned()
            .unwrap_or_default())
    }
}

pub fn per_draw(binding: u32, kind: DescriptorKind) -> BindingDescriptor {
    BindingDescriptor {
        set: 1,
        binding,
        size: 0,
        kind,
    }
}

/// Presenter over a pretend swapchain of `images` images.
pub struct FakePresenter {
    pub generation: u64,
    pub out_of_date: bool,
    /// Present reports the swapchain out of date.
    pub stale_on_present: bool,
    pub images: u32,
    pub next: u32,
    pub presented: Vec<u32>,
}

impl FakePresenter {
    pub fn new(images: u32) -> Self {
        Self {
            generation: 0,
            out_of_date: false,
            stale_on_present: false,
            images,
            next: 0,
            presented: Vec::new(),
        }
    }
}

impl Presenter for FakePresenter {
    fn generation(&self) -> u64 {
        self.generation
    }

    fn acquire(&mut self) -> Result<Option<AcquiredImage>> {
        if self.out_of_date {
            return Ok(None);
        }
        let index = self.next;
        self.next = (self.next + 1) % self.images;
        Ok(Some(AcquiredImage {
            index,
            acquired: vk::Semaphore::from_raw(0xA0),
            render_finished: vk::Semaphore::from_raw(0xA1),
        }))
    }

    fn present(&mut self, image: &AcquiredImage) -> Result<()> {
        if self.stale_on_present {
            return Err(GPUError::SwapchainStale);
        }
        self.presented.push(image.index);
        Ok(())
    }
}

pub fn renderer(compiler: &FakeCompiler) -> Renderer<NullDevice> {
    init_logging();
    Renderer::new(NullDevice::new(), compiler.boxed())
}

pub fn fake_image(raw: u64) -> (vk::Image, vk::ImageView) {
    (vk::Image::from_raw(raw), vk::ImageView::from_raw(raw + 1))
}
