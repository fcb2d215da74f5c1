mod common;

use ash::vk;
use vkdeferred::gpu::null::NullDevice;
use vkdeferred::gpu::structs::*;
use vkdeferred::shader::reflect::reflect_bindings;
use vkdeferred::shader::{CompileRequest, ShaderCompiler, StageReflection};
use vkdeferred::config::RendererConfig;
use vkdeferred::{CompileError, GPUError, Renderer};

static LIGHTING_FS: &[u32] = inline_spirv::inline_spirv!(
    r#"
    #version 450
    layout(set = 0, binding = 0) uniform Frame { mat4 view_proj; vec4 sun; } frame;
    layout(set = 1, binding = 256) uniform sampler2D albedo;
    layout(set = 1, binding = 384, rgba8) uniform writeonly image2D debug_out;
    layout(set = 2, binding = 0) uniform sampler2D stray;
    layout(location = 0) in vec2 uv;
    layout(location = 0) out vec4 color;
    void main() {
        vec4 c = texture(albedo, uv) * frame.sun + texture(stray, uv);
        imageStore(debug_out, ivec2(0), c);
        color = c;
    }
    "#,
    frag
);

static FULLSCREEN_VS: &[u32] = inline_spirv::inline_spirv!(
    r#"
    #version 450
    layout(location = 0) out vec2 uv;
    void main() {
        uv = vec2((gl_VertexIndex << 1) & 2, gl_VertexIndex & 2);
        gl_Position = vec4(uv * 2.0 - 1.0, 0.0, 1.0);
    }
    "#,
    vert
);

fn find(bindings: &[BindingDescriptor], set: u32, binding: u32) -> BindingDescriptor {
    *bindings
        .iter()
        .find(|b| b.set == set && b.binding == binding)
        .unwrap_or_else(|| panic!("no binding {}.{} in {:?}", set, binding, bindings))
}

#[test]
fn reflection_reports_every_space() {
    let bindings = reflect_bindings(ShaderType::Fragment, LIGHTING_FS).unwrap();
    assert_eq!(find(&bindings, 0, 0).kind, DescriptorKind::UniformBuffer);
    assert_eq!(find(&bindings, 0, 0).size, 80);
    assert_eq!(find(&bindings, 1, 256).kind, DescriptorKind::CombinedImageSampler);
    assert_eq!(find(&bindings, 1, 384).kind, DescriptorKind::StorageImage);
    assert_eq!(find(&bindings, 2, 0).kind, DescriptorKind::CombinedImageSampler);
}

#[test]
fn stray_sets_are_rejected_on_classification() {
    let bindings = reflect_bindings(ShaderType::Fragment, LIGHTING_FS).unwrap();
    let classified = StageReflection::classify(ShaderType::Fragment, bindings);
    assert_eq!(classified.per_frame.len(), 1);
    assert_eq!(classified.per_draw.len(), 2);
    assert_eq!(classified.rejected.len(), 1);
    assert_eq!(classified.rejected[0].set, 2);
    assert!(matches!(
        classified.check(),
        Err(GPUError::Reflection(e)) if e.set == 2
    ));
}

#[test]
fn garbage_is_a_reflection_failure() {
    assert!(reflect_bindings(ShaderType::Vertex, &[0xdead_beef, 1, 2, 3]).is_err());
}

/// Serves precompiled words and relies on the default `spirq` reflection.
struct Precompiled;

impl ShaderCompiler for Precompiled {
    fn compile(&self, request: &CompileRequest<'_>) -> Result<Vec<u32>, CompileError> {
        match request.stage {
            ShaderType::Vertex => Ok(FULLSCREEN_VS.to_vec()),
            ShaderType::Fragment => Ok(LIGHTING_FS.to_vec()),
            stage => Err(CompileError {
                stage,
                entry: request.entry.to_string(),
                macros: request.macros.to_vec(),
                diagnostics: "no precompiled module".to_string(),
            }),
        }
    }
}

#[test]
fn reflected_layout_is_fragment_visible() {
    common::init_logging();
    let mut r = Renderer::new(NullDevice::new(), Box::new(Precompiled));
    let shader = r
        .create_shader(
            "lighting",
            "",
            &[(ShaderType::Vertex, "main"), (ShaderType::Fragment, "main")],
        )
        .unwrap();

    let variant = r.variant(shader, PermutationId(0)).unwrap();
    let layout = variant.per_draw_layout().unwrap();
    let bindings = variant.per_draw_bindings().to_vec();
    assert_eq!(bindings.len(), 2);
    assert!(bindings
        .iter()
        .all(|b| b.stages == vk::ShaderStageFlags::FRAGMENT));
    assert_eq!(r.device().layout_bindings(layout), Some(bindings.clone()));

    let albedo = bindings.iter().find(|b| b.binding == 256).unwrap();
    assert_eq!(albedo.kind, DescriptorKind::CombinedImageSampler);
    assert_eq!(
        vk::DescriptorType::from(albedo.kind),
        vk::DescriptorType::COMBINED_IMAGE_SAMPLER
    );
}

#[test]
fn strict_reflection_fails_the_variant() {
    common::init_logging();
    let cfg = RendererConfig {
        strict_reflection: true,
        ..Default::default()
    };
    let mut r = Renderer::with_config(NullDevice::new(), Box::new(Precompiled), &cfg);
    let shader = r
        .create_shader(
            "lighting",
            "",
            &[(ShaderType::Vertex, "main"), (ShaderType::Fragment, "main")],
        )
        .unwrap();

    let err = r.variant(shader, PermutationId(0)).unwrap_err();
    assert!(matches!(err, GPUError::Reflection(e) if e.set == 2 && e.binding == 0));
    assert_eq!(r.shader(shader).unwrap().variant_count(), 0);
    assert_eq!(r.device().shader_modules_created(), 1);
}
