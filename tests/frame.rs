mod common;

use ash::vk;
use ash::vk::Handle as _;
use common::{fake_image, per_draw, renderer, FakeCompiler, FakePresenter};
use vkdeferred::framegraph::{DeferredPass, Framebuffer};
use vkdeferred::gpu::null::{Command, NullDevice};
use vkdeferred::gpu::structs::*;
use vkdeferred::shader::ShaderObject;
use vkdeferred::sync::{Access, ImageLayout, ImageTransition, ResState, TrackedImage};
use vkdeferred::{Draw, GPUError, Handle, PassDecl, PassTarget, Renderer};

const GRAPHICS: &[(ShaderType, &str)] = &[
    (ShaderType::Vertex, "MainVS"),
    (ShaderType::Fragment, "MainPS"),
];

const RAY_TRACING: &[(ShaderType, &str)] = &[
    (ShaderType::RayGeneration, "RayGen"),
    (ShaderType::RayMiss, "Miss"),
    (ShaderType::RayClosestHit, "ClosestHit"),
];

const EXTENT: vk::Extent2D = vk::Extent2D {
    width: 1280,
    height: 720,
};

fn quad() -> vk::Buffer {
    vk::Buffer::from_raw(0x1D0)
}

fn target(render_pass: u64, framebuffer: Framebuffer, colors: u32, depth: bool) -> PassTarget {
    PassTarget::new(
        PassDescription {
            render_pass: vk::RenderPass::from_raw(render_pass),
            color_attachments: colors,
            has_depth: depth,
        },
        framebuffer,
        EXTENT,
    )
}

fn fixed(raw: u64) -> Framebuffer {
    Framebuffer::Fixed(vk::Framebuffer::from_raw(raw))
}

fn register(r: &mut Renderer<NullDevice>, name: &str, raw: u64) -> Handle<TrackedImage> {
    let (image, view) = fake_image(raw);
    r.register_image(name, image, view, vk::ImageAspectFlags::COLOR)
        .unwrap()
}

struct ShadowSetup {
    r: Renderer<NullDevice>,
    shadows: Handle<ShaderObject>,
    lighting: Handle<ShaderObject>,
    mask: Handle<TrackedImage>,
}

fn shadow_setup(compiler: &FakeCompiler) -> ShadowSetup {
    let mut r = renderer(compiler);
    let shadows = r.create_shader("shadows", "// rt", RAY_TRACING).unwrap();
    let lighting = r.create_shader("lighting", "// lighting", GRAPHICS).unwrap();
    let mask = register(&mut r, "shadow_mask", 0x100);
    ShadowSetup {
        r,
        shadows,
        lighting,
        mask,
    }
}

fn shadow_then_lighting(s: &ShadowSetup) -> Vec<PassDecl> {
    vec![
        PassDecl::trace_rays("shadows", s.shadows, [EXTENT.width, EXTENT.height, 1])
            .uses(s.mask, ResState::RAY_TRACING_WRITE),
        PassDecl::graphics("lighting", s.lighting, target(0x50, fixed(0x60), 1, false))
            .state(RenderState::fullscreen())
            .uses(s.mask, ResState::FRAGMENT_READ)
            .draw(Draw::fullscreen(quad())),
    ]
}

#[test]
fn explicit_barriers_round_trip_through_the_tracker() {
    let compiler = FakeCompiler::new();
    let mut s = shadow_setup(&compiler);
    let mut present = FakePresenter::new(2);
    let passes = shadow_then_lighting(&s);
    s.r.render_frame(&mut present, &passes).unwrap();
    assert_eq!(
        s.r.images().get(s.mask).unwrap().state(),
        ResState::FRAGMENT_READ
    );
}

#[test]
fn first_use_transitions_from_undefined() {
    let compiler = FakeCompiler::new();
    let mut s = shadow_setup(&compiler);
    let mut present = FakePresenter::new(2);
    let passes = shadow_then_lighting(&s);

    s.r.render_frame(&mut present, &passes[..1]).unwrap();
    let barriers = s.r.device().barriers();
    assert_eq!(barriers.len(), 1);
    let first = barriers[0].to_vk();
    assert_eq!(first.old_layout, vk::ImageLayout::UNDEFINED);
    assert_eq!(first.new_layout, vk::ImageLayout::GENERAL);
    assert_eq!(first.src_access_mask, vk::AccessFlags2::empty());
    assert_eq!(barriers[0].src.access, Access::NONE);
}

#[test]
fn shadow_mask_ping_pongs_between_frames() {
    let compiler = FakeCompiler::new();
    let mut s = shadow_setup(&compiler);
    let mut present = FakePresenter::new(2);
    let passes = shadow_then_lighting(&s);
    let image = vk::Image::from_raw(0x100);

    let report = s.r.render_frame(&mut present, &passes).unwrap();
    assert_eq!(report.barriers, 2);
    assert_eq!(
        s.r.device().barriers(),
        vec![
            ImageTransition {
                image,
                aspect: vk::ImageAspectFlags::COLOR,
                src: ResState::UNDEFINED,
                dst: ResState::RAY_TRACING_WRITE,
            },
            ImageTransition {
                image,
                aspect: vk::ImageAspectFlags::COLOR,
                src: ResState::RAY_TRACING_WRITE,
                dst: ResState::FRAGMENT_READ,
            },
        ]
    );
    let to_read = s.r.device().barriers()[1].to_vk();
    assert_eq!(to_read.src_stage_mask, vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR);
    assert_eq!(to_read.dst_stage_mask, vk::PipelineStageFlags2::FRAGMENT_SHADER);
    assert_eq!(to_read.new_layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);

    s.r.device().clear_commands();
    s.r.render_frame(&mut present, &passes).unwrap();
    let second = s.r.device().barriers();
    assert_eq!(second.len(), 2);
    assert_eq!(second[0].src, ResState::FRAGMENT_READ);
    assert_eq!(second[0].dst, ResState::RAY_TRACING_WRITE);
    let to_write = second[0].to_vk();
    assert_eq!(to_write.src_stage_mask, vk::PipelineStageFlags2::FRAGMENT_SHADER);
    assert_eq!(to_write.dst_stage_mask, vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR);
    assert_eq!(to_write.old_layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
    assert_eq!(to_write.new_layout, vk::ImageLayout::GENERAL);
}

#[test]
fn repeated_reads_need_no_barrier() {
    let compiler = FakeCompiler::new();
    let mut r = renderer(&compiler);
    let ssao = r.create_shader("ssao", "// ssao", GRAPHICS).unwrap();
    let lighting = r.create_shader("lighting", "// lighting", GRAPHICS).unwrap();
    let depth = register(&mut r, "depth", 0x200);
    let mut present = FakePresenter::new(1);

    let passes = vec![
        PassDecl::graphics("ssao", ssao, target(0x51, fixed(0x61), 1, false))
            .uses(depth, ResState::FRAGMENT_READ)
            .draw(Draw::fullscreen(quad())),
        PassDecl::graphics("lighting", lighting, target(0x50, fixed(0x60), 1, false))
            .uses(depth, ResState::FRAGMENT_READ)
            .draw(Draw::fullscreen(quad())),
    ];
    let report = r.render_frame(&mut present, &passes).unwrap();
    assert_eq!(report.barriers, 1);
    assert_eq!(r.images().get(depth).unwrap().layout(), ImageLayout::SHADER_READ_ONLY);
}

#[test]
fn replaced_swapchain_skips_one_frame() {
    let compiler = FakeCompiler::new();
    let mut s = shadow_setup(&compiler);
    let mut present = FakePresenter::new(2);
    let passes = shadow_then_lighting(&s);

    s.r.render_frame(&mut present, &passes).unwrap();
    s.r.device().clear_commands();

    present.generation += 1;
    let err = s.r.render_frame(&mut present, &passes).unwrap_err();
    assert!(matches!(err, GPUError::SwapchainStale));
    assert!(err.is_recoverable());
    assert!(s.r.device().commands().is_empty());
    assert_eq!(present.presented, vec![0]);

    s.r.render_frame(&mut present, &passes).unwrap();
    assert_eq!(present.presented, vec![0, 1]);
}

#[test]
fn out_of_date_acquire_skips_the_frame() {
    let compiler = FakeCompiler::new();
    let mut s = shadow_setup(&compiler);
    let mut present = FakePresenter::new(2);
    present.out_of_date = true;
    let passes = shadow_then_lighting(&s);

    let err = s.r.render_frame(&mut present, &passes).unwrap_err();
    assert!(matches!(err, GPUError::SwapchainStale));
    assert!(s.r.device().commands().is_empty());
    assert_eq!(s.r.images().get(s.mask).unwrap().state(), ResState::UNDEFINED);
}

#[test]
fn stale_image_in_a_pass_commits_nothing() {
    let compiler = FakeCompiler::new();
    let mut s = shadow_setup(&compiler);
    let mut present = FakePresenter::new(2);
    let gone = register(&mut s.r, "gone", 0x110);
    s.r.unregister_image(gone);

    let passes = vec![
        PassDecl::trace_rays("shadows", s.shadows, [EXTENT.width, EXTENT.height, 1])
            .uses(s.mask, ResState::RAY_TRACING_WRITE)
            .uses(gone, ResState::RAY_TRACING_WRITE),
    ];
    let err = s.r.render_frame(&mut present, &passes).unwrap_err();
    assert!(matches!(err, GPUError::InvalidHandle));
    assert!(s.r.device().barriers().is_empty());
    assert_eq!(s.r.images().get(s.mask).unwrap().state(), ResState::UNDEFINED);

    let commands = s.r.device().commands();
    assert!(commands.contains(&Command::AbandonFrame));
    assert!(!commands.contains(&Command::Submit));
    assert!(present.presented.is_empty());
}

#[test]
fn failed_pass_rolls_back_the_frame() {
    let compiler = FakeCompiler::new();
    let mut s = shadow_setup(&compiler);
    let mut present = FakePresenter::new(2);
    let mut passes = shadow_then_lighting(&s);
    passes[1] = passes[1].clone().permutation(PermutationId(0b1));
    compiler.fail_on(ShaderType::Fragment, "_PERMUTATION0_");

    let err = s.r.render_frame(&mut present, &passes).unwrap_err();
    assert!(matches!(err, GPUError::Compile(..)));
    assert!(!err.is_recoverable());
    assert!(present.presented.is_empty());
    assert_eq!(s.r.images().get(s.mask).unwrap().state(), ResState::UNDEFINED);
    let commands = s.r.device().commands();
    assert_eq!(commands.last(), Some(&Command::AbandonFrame));
    assert!(!commands.contains(&Command::Submit));

    compiler.stop_failing();
    s.r.device().clear_commands();
    s.r.render_frame(&mut present, &passes).unwrap();
    assert_eq!(s.r.device().barriers()[0].src, ResState::UNDEFINED);
    assert_eq!(
        s.r.images().get(s.mask).unwrap().state(),
        ResState::FRAGMENT_READ
    );
}

#[test]
fn failed_present_still_waits_for_the_frame() {
    let compiler = FakeCompiler::new();
    let mut s = shadow_setup(&compiler);
    let mut present = FakePresenter::new(2);
    present.stale_on_present = true;
    let passes = shadow_then_lighting(&s);

    let err = s.r.render_frame(&mut present, &passes).unwrap_err();
    assert!(matches!(err, GPUError::SwapchainStale));
    let commands = s.r.device().commands();
    assert_eq!(
        &commands[commands.len() - 2..],
        &[Command::Submit, Command::WaitIdle]
    );
    assert!(s.r.last_gpu_ms().is_some());
    // The frame ran, so its transitions stand.
    assert_eq!(
        s.r.images().get(s.mask).unwrap().state(),
        ResState::FRAGMENT_READ
    );
}

#[test]
fn deferred_frame_records_passes_in_order() {
    let compiler = FakeCompiler::new()
        .with_binding(ShaderType::Fragment, per_draw(SRV_BINDING_OFFSET, DescriptorKind::SampledImage));
    let mut r = renderer(&compiler);
    let mut present = FakePresenter::new(3);

    let shaders: Vec<Handle<ShaderObject>> = DeferredPass::ORDER
        .iter()
        .map(|p| {
            let stages = match p {
                DeferredPass::ShadowRaytrace => RAY_TRACING,
                _ => GRAPHICS,
            };
            r.create_shader(p.name(), "// pass", stages).unwrap()
        })
        .collect();
    let depth = register(&mut r, "depth", 0x300);
    let shadow_mask = register(&mut r, "shadow_mask", 0x310);
    let ao = register(&mut r, "ao", 0x320);
    let hdr = register(&mut r, "hdr", 0x330);

    let mesh_vb = vk::Buffer::from_raw(0x400);
    let mesh_ib = vk::Buffer::from_raw(0x401);
    let swapchain = Framebuffer::Swapchain(vec![
        vk::Framebuffer::from_raw(0x70),
        vk::Framebuffer::from_raw(0x71),
        vk::Framebuffer::from_raw(0x72),
    ]);
    let passes = vec![
        PassDecl::graphics("zprepass", shaders[0], target(0x50, fixed(0x60), 0, true).clear_depth(1.0))
            .uses(depth, ResState::DEPTH_TARGET)
            .draw(Draw::mesh(mesh_vb, mesh_ib, 36)),
        PassDecl::graphics("gbuffer", shaders[1], target(0x51, fixed(0x61), 3, true))
            .permutation(PermutationId(0b1))
            .uses(depth, ResState::DEPTH_TARGET)
            .draw(Draw::mesh(mesh_vb, mesh_ib, 36))
            .draw(Draw::mesh(mesh_vb, mesh_ib, 36).binding_mask(1)),
        PassDecl::graphics("ssao", shaders[2], target(0x52, fixed(0x62), 1, false))
            .state(RenderState::fullscreen())
            .uses(depth, ResState::DEPTH_SAMPLED)
            .draw(Draw::fullscreen(quad())),
        PassDecl::trace_rays("shadow_raytrace", shaders[3], [EXTENT.width, EXTENT.height, 1])
            .uses(shadow_mask, ResState::RAY_TRACING_WRITE),
        PassDecl::graphics("lighting", shaders[4], target(0x54, fixed(0x64), 1, false))
            .state(RenderState::fullscreen())
            .uses(shadow_mask, ResState::FRAGMENT_READ)
            .uses(ao, ResState::FRAGMENT_READ)
            .uses(hdr, ResState::COLOR_TARGET)
            .draw(Draw::fullscreen(quad())),
        PassDecl::graphics("skybox", shaders[5], target(0x55, fixed(0x65), 1, true))
            .draw(Draw::mesh(mesh_vb, mesh_ib, 36)),
        PassDecl::graphics("tonemap", shaders[6], target(0x56, swapchain, 1, false))
            .state(RenderState::fullscreen())
            .uses(hdr, ResState::FRAGMENT_READ)
            .draw(Draw::fullscreen(quad())),
    ];

    present.next = 2;
    let report = r.render_frame(&mut present, &passes).unwrap();
    assert_eq!(report.image_index, 2);
    assert_eq!(report.passes, 7);
    // Depth: first use, write after write, sampled. Shadow mask: write, read.
    // AO and HDR: first use each, then HDR read by the tonemap.
    assert_eq!(report.barriers, 8);
    assert_eq!(r.images().get(depth).unwrap().layout(), ImageLayout::DEPTH_READ_ONLY);
    assert_eq!(present.presented, vec![2]);

    let commands = r.device().commands();
    assert_eq!(
        &commands[..3],
        &[
            Command::BeginFrame,
            Command::ResetTimestamps(2),
            Command::WriteTimestamp(0)
        ]
    );
    assert_eq!(
        &commands[commands.len() - 4..],
        &[
            Command::WriteTimestamp(1),
            Command::EndFrame,
            Command::Submit,
            Command::WaitIdle
        ]
    );

    let framebuffers: Vec<u64> = commands
        .iter()
        .filter_map(|c| match c {
            Command::BeginRenderPass { framebuffer, .. } => Some(framebuffer.as_raw()),
            _ => None,
        })
        .collect();
    assert_eq!(framebuffers, vec![0x60, 0x61, 0x62, 0x64, 0x65, 0x72]);

    let trace = commands
        .iter()
        .position(|c| matches!(c, Command::TraceRays(_)))
        .unwrap();
    let lighting = commands
        .iter()
        .position(|c| {
            matches!(c, Command::BeginRenderPass { framebuffer, .. } if framebuffer.as_raw() == 0x64)
        })
        .unwrap();
    let shadow_read = commands
        .iter()
        .position(|c| {
            matches!(c, Command::ImageBarrier(t)
                if t.image.as_raw() == 0x310 && t.dst == ResState::FRAGMENT_READ)
        })
        .unwrap();
    assert!(trace < shadow_read && shadow_read < lighting);

    let draws: Vec<u32> = commands
        .iter()
        .filter_map(|c| match c {
            Command::DrawIndexed(d) => Some(d.index_count),
            _ => None,
        })
        .collect();
    assert_eq!(draws, vec![36, 36, 36, 6, 6, 36, 6]);

    // Full-screen draws never bind a vertex stream.
    let vertex_binds = commands
        .iter()
        .filter(|c| matches!(c, Command::BindVertexBuffer(_)))
        .count();
    assert_eq!(vertex_binds, 4);

    // Both gbuffer draws share a pipeline but use different per-draw sets.
    let gbuffer = r.pipeline(
        shaders[1],
        PermutationId(0b1),
        &passes[1].target.as_ref().unwrap().pass,
        &RenderState::default(),
    );
    let gbuffer = gbuffer.unwrap().pipeline;
    let gbuffer_binds = commands
        .iter()
        .filter(|c| matches!(c, Command::BindPipeline(_, p) if *p == gbuffer))
        .count();
    assert_eq!(gbuffer_binds, 1);
}

#[test]
fn gpu_time_comes_from_timestamps() {
    let compiler = FakeCompiler::new();
    common::init_logging();
    let device = NullDevice::new().with_timestamps(1_000, 3_501_000, 2.0);
    let mut r = Renderer::new(device, compiler.boxed());
    let mut present = FakePresenter::new(2);
    assert_eq!(r.last_gpu_ms(), None);

    let report = r.render_frame(&mut present, &[]).unwrap();
    assert!((report.gpu_ms - 7.0).abs() < 1e-9);
    assert_eq!(r.last_gpu_ms(), Some(report.gpu_ms));
}

#[test]
fn one_shot_compute_transitions_its_images() {
    let compiler = FakeCompiler::new();
    let mut r = renderer(&compiler);
    let convert = r
        .create_shader("equirect_to_cube", "// cs", &[(ShaderType::Compute, "main")])
        .unwrap();
    let equirect = register(&mut r, "equirect", 0x500);
    let cube = register(&mut r, "cube", 0x510);

    let pass = PassDecl::compute("equirect_to_cube", convert, [32, 32, 6])
        .uses(equirect, ResState::COMPUTE_READ)
        .uses(cube, ResState::COMPUTE_WRITE);
    assert_eq!(r.submit_once(&[pass]).unwrap(), 2);

    let commands = r.device().commands();
    assert_eq!(commands.first(), Some(&Command::SubmitOnceBegin));
    assert_eq!(commands.last(), Some(&Command::SubmitOnceEnd));
    assert!(commands.contains(&Command::Dispatch([32, 32, 6])));
    assert_eq!(r.images().get(cube).unwrap().layout(), ImageLayout::GENERAL);

    let skybox = r.create_shader("skybox", "// sky", GRAPHICS).unwrap();
    let sample = PassDecl::graphics("skybox", skybox, target(0x55, fixed(0x65), 1, true))
        .uses(cube, ResState::FRAGMENT_READ)
        .draw(Draw::fullscreen(quad()));
    r.device().clear_commands();
    assert_eq!(r.submit_once(&[sample]).unwrap(), 1);
    let barrier = r.device().barriers()[0];
    assert_eq!(barrier.src, ResState::COMPUTE_WRITE);
    assert_eq!(barrier.dst, ResState::FRAGMENT_READ);
}

#[test]
fn work_must_match_the_shader_kind() {
    let compiler = FakeCompiler::new();
    let mut r = renderer(&compiler);
    let convert = r
        .create_shader("equirect_to_cube", "// cs", &[(ShaderType::Compute, "main")])
        .unwrap();
    let cube = register(&mut r, "cube", 0x510);

    let pass = PassDecl::trace_rays("not_rays", convert, [1, 1, 1])
        .uses(cube, ResState::RAY_TRACING_WRITE);
    let err = r.submit_once(&[pass]).unwrap_err();
    assert!(matches!(err, GPUError::InvalidPass(_)));
    assert!(r.device().barriers().is_empty());
    assert_eq!(r.images().get(cube).unwrap().state(), ResState::UNDEFINED);
}

#[test]
fn swapchain_targets_need_an_acquired_image() {
    let compiler = FakeCompiler::new();
    let mut r = renderer(&compiler);
    let tonemap = r.create_shader("tonemap", "// tonemap", GRAPHICS).unwrap();
    let swapchain = Framebuffer::Swapchain(vec![vk::Framebuffer::from_raw(0x70)]);
    let pass = PassDecl::graphics("tonemap", tonemap, target(0x56, swapchain, 1, false))
        .draw(Draw::fullscreen(quad()));

    let err = r.submit_once(&[pass]).unwrap_err();
    assert!(matches!(err, GPUError::InvalidHandle));
}
