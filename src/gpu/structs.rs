use std::ffi::CString;

use ash::vk;
use bytemuck::{Pod, Zeroable};

/// Descriptor set index shared by every shader and updated once per frame.
pub const PER_FRAME_SET: u32 = 0;
/// Descriptor set index aggregated per variant from reflection.
pub const PER_DRAW_SET: u32 = 1;

// Register shifts applied per descriptor space so that constant buffers,
// samplers, read-only and read-write resources never share a slot.
pub const BUFFER_BINDING_OFFSET: u32 = 0;
pub const SAMPLER_BINDING_OFFSET: u32 = 128;
pub const SRV_BINDING_OFFSET: u32 = 256;
pub const UAV_BINDING_OFFSET: u32 = 384;

/// Shader permutation bitmask. Bit `i` enables the `_PERMUTATION{i}_` macro.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PermutationId(pub u64);

impl PermutationId {
    pub fn bits(self) -> impl Iterator<Item = u32> {
        (0..u64::BITS).filter(move |i| self.0 & (1u64 << i) != 0)
    }
}

/// Pipeline cache key derived from a [`RenderState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StateHash(pub u64);

impl StateHash {
    /// Shared by every non-rasterizing state.
    pub const NON_RASTERIZING: StateHash = StateHash(u64::MAX);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "vkd-serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ShaderType {
    Vertex,
    Fragment,
    Compute,
    RayGeneration,
    RayMiss,
    RayClosestHit,
}

impl ShaderType {
    pub fn is_ray_tracing(self) -> bool {
        matches!(
            self,
            ShaderType::RayGeneration | ShaderType::RayMiss | ShaderType::RayClosestHit
        )
    }
}

impl From<ShaderType> for vk::ShaderStageFlags {
    fn from(stage: ShaderType) -> Self {
        match stage {
            ShaderType::Vertex => vk::ShaderStageFlags::VERTEX,
            ShaderType::Fragment => vk::ShaderStageFlags::FRAGMENT,
            ShaderType::Compute => vk::ShaderStageFlags::COMPUTE,
            ShaderType::RayGeneration => vk::ShaderStageFlags::RAYGEN_KHR,
            ShaderType::RayMiss => vk::ShaderStageFlags::MISS_KHR,
            ShaderType::RayClosestHit => vk::ShaderStageFlags::CLOSEST_HIT_KHR,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "vkd-serde", derive(serde::Serialize, serde::Deserialize))]
pub enum CullMode {
    #[default]
    None,
    Front,
    Back,
    FrontAndBack,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "vkd-serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Topology {
    Point,
    Line,
    #[default]
    Triangle,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "vkd-serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FillMode {
    #[default]
    Fill,
    Line,
    Point,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "vkd-serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FrontFace {
    Cw,
    #[default]
    Ccw,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "vkd-serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DepthFunc {
    Never,
    #[default]
    Less,
    Equal,
    LessEqual,
    Greater,
    NotEqual,
    GreaterEqual,
    Always,
}

/// Fixed-function state a graphics pipeline is baked with.
///
/// `rasterizing == false` marks compute and ray-tracing work; every other
/// field is then ignored and the state hashes to
/// [`StateHash::NON_RASTERIZING`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "vkd-serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "vkd-serde", serde(default))]
pub struct RenderState {
    pub cull_mode: CullMode,
    pub topology: Topology,
    pub fill_mode: FillMode,
    pub front_face: FrontFace,
    pub depth_func: DepthFunc,
    /// Pipeline consumes the interleaved [`Vertex`] stream.
    pub vertex_stream: bool,
    pub depth_write: bool,
    pub rasterizing: bool,
}

impl Default for RenderState {
    fn default() -> Self {
        Self {
            cull_mode: CullMode::None,
            topology: Topology::Triangle,
            fill_mode: FillMode::Fill,
            front_face: FrontFace::Ccw,
            depth_func: DepthFunc::Less,
            vertex_stream: true,
            depth_write: true,
            rasterizing: true,
        }
    }
}

impl RenderState {
    pub fn non_rasterizing() -> Self {
        Self {
            rasterizing: false,
            ..Default::default()
        }
    }

    /// Full-screen passes: no vertex stream, everything else default.
    pub fn fullscreen() -> Self {
        Self {
            vertex_stream: false,
            ..Default::default()
        }
    }

    /// Packs every field into its own bit range so that distinct states can
    /// never share a key.
    pub fn hash(&self) -> StateHash {
        if !self.rasterizing {
            return StateHash::NON_RASTERIZING;
        }

        let mut h = self.cull_mode as u64;
        h |= (self.topology as u64) << 2;
        h |= (self.fill_mode as u64) << 4;
        h |= (self.front_face as u64) << 6;
        h |= (self.depth_func as u64) << 7;
        h |= (self.vertex_stream as u64) << 10;
        h |= (self.depth_write as u64) << 11;
        StateHash(h)
    }
}

/// The single interleaved vertex record every mesh pipeline consumes.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    pub tangent: [f32; 3],
    pub bitangent: [f32; 3],
    pub uv: [f32; 2],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorKind {
    Sampler,
    SampledImage,
    /// GLSL `sampler2D` and friends: image and sampler in one descriptor.
    CombinedImageSampler,
    StorageImage,
    UniformBuffer,
    StorageBuffer,
    InputAttachment,
    AccelerationStructure,
}

impl From<DescriptorKind> for vk::DescriptorType {
    fn from(kind: DescriptorKind) -> Self {
        match kind {
            DescriptorKind::Sampler => vk::DescriptorType::SAMPLER,
            DescriptorKind::SampledImage => vk::DescriptorType::SAMPLED_IMAGE,
            DescriptorKind::CombinedImageSampler => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            DescriptorKind::StorageImage => vk::DescriptorType::STORAGE_IMAGE,
            DescriptorKind::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER,
            DescriptorKind::StorageBuffer => vk::DescriptorType::STORAGE_BUFFER,
            DescriptorKind::InputAttachment => vk::DescriptorType::INPUT_ATTACHMENT,
            DescriptorKind::AccelerationStructure => {
                vk::DescriptorType::ACCELERATION_STRUCTURE_KHR
            }
        }
    }
}

/// One binding found by reflecting a compiled module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindingDescriptor {
    pub set: u32,
    pub binding: u32,
    /// Declared block size in bytes, zero for non-buffer bindings.
    pub size: u32,
    pub kind: DescriptorKind,
}

/// Entry of a descriptor set layout, merged across stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutBinding {
    pub binding: u32,
    pub kind: DescriptorKind,
    pub count: u32,
    pub stages: vk::ShaderStageFlags,
}

/// Render-pass compatibility information a pipeline is built against.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassDescription {
    /// Null for compute and ray-tracing passes.
    pub render_pass: vk::RenderPass,
    pub color_attachments: u32,
    pub has_depth: bool,
}

/// Compiled stage wrapped into a device module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageModule {
    pub stage: ShaderType,
    pub entry: CString,
    pub module: vk::ShaderModule,
}

pub struct GraphicsPipelineDesc<'a> {
    pub layout: vk::PipelineLayout,
    pub stages: &'a [StageModule],
    pub pass: &'a PassDescription,
    pub state: &'a RenderState,
}

pub struct ComputePipelineDesc<'a> {
    pub layout: vk::PipelineLayout,
    pub stage: &'a StageModule,
}

pub struct RayTracingPipelineDesc<'a> {
    pub layout: vk::PipelineLayout,
    pub stages: &'a [StageModule],
}

/// Device-address regions handed to trace-rays.
#[derive(Debug, Default, Clone, Copy)]
pub struct ShaderBindingTable {
    pub raygen: vk::StridedDeviceAddressRegionKHR,
    pub miss: vk::StridedDeviceAddressRegionKHR,
    pub hit: vk::StridedDeviceAddressRegionKHR,
    pub callable: vk::StridedDeviceAddressRegionKHR,
    /// Backing buffers, owned by the device until the pipeline is destroyed.
    pub buffers: [vk::Buffer; 3],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorResource {
    Sampler(vk::Sampler),
    SampledImage {
        view: vk::ImageView,
        layout: vk::ImageLayout,
    },
    CombinedImageSampler {
        sampler: vk::Sampler,
        view: vk::ImageView,
        layout: vk::ImageLayout,
    },
    StorageImage {
        view: vk::ImageView,
        layout: vk::ImageLayout,
    },
    UniformBuffer {
        buffer: vk::Buffer,
        offset: u64,
        range: u64,
    },
    StorageBuffer {
        buffer: vk::Buffer,
        offset: u64,
        range: u64,
    },
    AccelerationStructure(vk::AccelerationStructureKHR),
}

impl DescriptorResource {
    pub fn kind(&self) -> DescriptorKind {
        match self {
            DescriptorResource::Sampler(_) => DescriptorKind::Sampler,
            DescriptorResource::SampledImage { .. } => DescriptorKind::SampledImage,
            DescriptorResource::CombinedImageSampler { .. } => {
                DescriptorKind::CombinedImageSampler
            }
            DescriptorResource::StorageImage { .. } => DescriptorKind::StorageImage,
            DescriptorResource::UniformBuffer { .. } => DescriptorKind::UniformBuffer,
            DescriptorResource::StorageBuffer { .. } => DescriptorKind::StorageBuffer,
            DescriptorResource::AccelerationStructure(_) => DescriptorKind::AccelerationStructure,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorWrite {
    pub binding: u32,
    pub resource: DescriptorResource,
}

pub struct RenderPassBegin<'a> {
    pub render_pass: vk::RenderPass,
    pub framebuffer: vk::Framebuffer,
    pub area: vk::Rect2D,
    pub clear_values: &'a [vk::ClearValue],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexedDraw {
    pub index_count: u32,
    pub instance_count: u32,
    pub first_index: u32,
    pub vertex_offset: i32,
}

impl IndexedDraw {
    pub fn new(index_count: u32) -> Self {
        Self {
            index_count,
            instance_count: 1,
            first_index: 0,
            vertex_offset: 0,
        }
    }
}
