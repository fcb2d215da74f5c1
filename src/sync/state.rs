use ash::vk;
use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};

use crate::gpu::error::{GPUError, Result};
use crate::utils::{Handle, Pool};

bitflags! {
    /// Memory access kinds a deferred frame synchronizes on. Values are the
    /// `VkAccessFlagBits2` bits.
    #[repr(transparent)]
    #[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Access: u64 {
        const NONE = 0;
        const SHADER_READ = vk::AccessFlags2::SHADER_READ.as_raw();
        const SHADER_WRITE = vk::AccessFlags2::SHADER_WRITE.as_raw();
        const COLOR_WRITE = vk::AccessFlags2::COLOR_ATTACHMENT_WRITE.as_raw();
        const DEPTH_READ = vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ.as_raw();
        const DEPTH_WRITE = vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE.as_raw();
        const TRANSFER_WRITE = vk::AccessFlags2::TRANSFER_WRITE.as_raw();
    }
}
unsafe impl Zeroable for Access {}
unsafe impl Pod for Access {}

impl Access {
    const WRITES: Access = Access::SHADER_WRITE
        .union(Access::COLOR_WRITE)
        .union(Access::DEPTH_WRITE)
        .union(Access::TRANSFER_WRITE);

    pub fn is_write(self) -> bool {
        self.intersects(Self::WRITES)
    }
}

bitflags! {
    /// Pipeline stages, as `VkPipelineStageFlagBits2`.
    #[repr(transparent)]
    #[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Stage: u64 {
        const NONE = 0;
        const TOP_OF_PIPE = vk::PipelineStageFlags2::TOP_OF_PIPE.as_raw();
        const FRAGMENT_SHADER = vk::PipelineStageFlags2::FRAGMENT_SHADER.as_raw();
        const COMPUTE_SHADER = vk::PipelineStageFlags2::COMPUTE_SHADER.as_raw();
        const RAY_TRACING_SHADER = vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR.as_raw();
        const DEPTH_TESTS = vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS.as_raw()
            | vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS.as_raw();
        const COLOR_OUTPUT = vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT.as_raw();
        const TRANSFER = vk::PipelineStageFlags2::TRANSFER.as_raw();
        const BOTTOM_OF_PIPE = vk::PipelineStageFlags2::BOTTOM_OF_PIPE.as_raw();
    }
}
unsafe impl Zeroable for Stage {}
unsafe impl Pod for Stage {}

#[repr(transparent)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Pod, Zeroable, Default)]
pub struct ImageLayout(pub i32);

impl ImageLayout {
    pub const UNDEFINED: ImageLayout = ImageLayout(vk::ImageLayout::UNDEFINED.as_raw());
    pub const GENERAL: ImageLayout = ImageLayout(vk::ImageLayout::GENERAL.as_raw());
    pub const SHADER_READ_ONLY: ImageLayout =
        ImageLayout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL.as_raw());
    pub const COLOR_ATTACHMENT: ImageLayout =
        ImageLayout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL.as_raw());
    pub const DEPTH_ATTACHMENT: ImageLayout =
        ImageLayout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL.as_raw());
    pub const DEPTH_READ_ONLY: ImageLayout =
        ImageLayout(vk::ImageLayout::DEPTH_READ_ONLY_OPTIMAL.as_raw());
    pub const TRANSFER_DST: ImageLayout =
        ImageLayout(vk::ImageLayout::TRANSFER_DST_OPTIMAL.as_raw());
    pub const PRESENT: ImageLayout = ImageLayout(vk::ImageLayout::PRESENT_SRC_KHR.as_raw());
}

impl From<ImageLayout> for vk::ImageLayout {
    fn from(layout: ImageLayout) -> Self {
        vk::ImageLayout::from_raw(layout.0)
    }
}

impl From<vk::ImageLayout> for ImageLayout {
    fn from(layout: vk::ImageLayout) -> Self {
        Self(layout.as_raw())
    }
}

impl From<Access> for vk::AccessFlags2 {
    fn from(acc: Access) -> Self {
        vk::AccessFlags2::from_raw(acc.bits())
    }
}

impl From<Stage> for vk::PipelineStageFlags2 {
    fn from(stage: Stage) -> Self {
        vk::PipelineStageFlags2::from_raw(stage.bits())
    }
}

/// Stage, access and layout an image was last synchronized with.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, Pod, Zeroable)]
pub struct ResState {
    pub access: Access,
    pub stages: Stage,
    pub layout: ImageLayout,
    pub _pad: u32,
}

impl ResState {
    /// State of a freshly created image: nothing to wait on, contents undefined.
    pub const UNDEFINED: ResState = ResState {
        access: Access::NONE,
        stages: Stage::TOP_OF_PIPE,
        layout: ImageLayout::UNDEFINED,
        _pad: 0,
    };

    pub const fn new(stages: Stage, access: Access, layout: ImageLayout) -> Self {
        Self {
            access,
            stages,
            layout,
            _pad: 0,
        }
    }

    pub const RAY_TRACING_WRITE: ResState =
        ResState::new(Stage::RAY_TRACING_SHADER, Access::SHADER_WRITE, ImageLayout::GENERAL);
    pub const FRAGMENT_READ: ResState = ResState::new(
        Stage::FRAGMENT_SHADER,
        Access::SHADER_READ,
        ImageLayout::SHADER_READ_ONLY,
    );
    pub const COMPUTE_WRITE: ResState =
        ResState::new(Stage::COMPUTE_SHADER, Access::SHADER_WRITE, ImageLayout::GENERAL);
    pub const COMPUTE_READ: ResState = ResState::new(
        Stage::COMPUTE_SHADER,
        Access::SHADER_READ,
        ImageLayout::SHADER_READ_ONLY,
    );
    pub const COLOR_TARGET: ResState =
        ResState::new(Stage::COLOR_OUTPUT, Access::COLOR_WRITE, ImageLayout::COLOR_ATTACHMENT);
    pub const DEPTH_TARGET: ResState = ResState::new(
        Stage::DEPTH_TESTS,
        Access::DEPTH_READ.union(Access::DEPTH_WRITE),
        ImageLayout::DEPTH_ATTACHMENT,
    );
    /// Depth sampled by a full-screen pass while staying bound for testing.
    pub const DEPTH_SAMPLED: ResState = ResState::new(
        Stage::FRAGMENT_SHADER.union(Stage::DEPTH_TESTS),
        Access::SHADER_READ.union(Access::DEPTH_READ),
        ImageLayout::DEPTH_READ_ONLY,
    );
    pub const UPLOAD: ResState =
        ResState::new(Stage::TRANSFER, Access::TRANSFER_WRITE, ImageLayout::TRANSFER_DST);
    pub const PRESENT: ResState =
        ResState::new(Stage::BOTTOM_OF_PIPE, Access::NONE, ImageLayout::PRESENT);

    /// State an image in `self` ends up in when `dst` is requested, and
    /// whether getting there needs a barrier. Read-after-read in the same
    /// layout folds the new reader in without one.
    pub fn settle(self, dst: ResState) -> (ResState, bool) {
        if self == dst {
            return (dst, dst.access.is_write());
        }
        if self.layout == dst.layout && !self.access.is_write() && !dst.access.is_write() {
            let mut folded = self;
            folded.stages |= dst.stages;
            folded.access |= dst.access;
            return (folded, false);
        }
        (dst, true)
    }
}

/// One recorded layout/visibility change.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ImageTransition {
    pub image: vk::Image,
    pub aspect: vk::ImageAspectFlags,
    pub src: ResState,
    pub dst: ResState,
}

impl ImageTransition {
    pub fn to_vk(&self) -> vk::ImageMemoryBarrier2 {
        vk::ImageMemoryBarrier2 {
            src_stage_mask: self.src.stages.into(),
            src_access_mask: self.src.access.into(),
            dst_stage_mask: self.dst.stages.into(),
            dst_access_mask: self.dst.access.into(),
            old_layout: self.src.layout.into(),
            new_layout: self.dst.layout.into(),
            src_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
            dst_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
            image: self.image,
            subresource_range: vk::ImageSubresourceRange {
                aspect_mask: self.aspect,
                base_mip_level: 0,
                level_count: vk::REMAINING_MIP_LEVELS,
                base_array_layer: 0,
                layer_count: vk::REMAINING_ARRAY_LAYERS,
            },
            ..Default::default()
        }
    }
}

/// An externally owned image whose synchronization state is tracked here.
#[derive(Debug, Clone)]
pub struct TrackedImage {
    pub name: String,
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub aspect: vk::ImageAspectFlags,
    state: ResState,
}

impl TrackedImage {
    pub fn state(&self) -> ResState {
        self.state
    }

    pub fn layout(&self) -> ImageLayout {
        self.state.layout
    }
}

/// Single source of truth for image layouts. State only changes through
/// [`ImageTracker::set_barrier`] and [`ImageTracker::request`].
#[derive(Default)]
pub struct ImageTracker {
    images: Pool<TrackedImage>,
}

impl ImageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts tracking `image` in [`ResState::UNDEFINED`].
    pub fn register(
        &mut self,
        name: impl Into<String>,
        image: vk::Image,
        view: vk::ImageView,
        aspect: vk::ImageAspectFlags,
    ) -> Result<Handle<TrackedImage>> {
        self.images
            .insert(TrackedImage {
                name: name.into(),
                image,
                view,
                aspect,
                state: ResState::UNDEFINED,
            })
            .ok_or(GPUError::PoolExhausted)
    }

    pub fn unregister(&mut self, handle: Handle<TrackedImage>) -> Option<TrackedImage> {
        self.images.take(handle)
    }

    pub fn get(&self, handle: Handle<TrackedImage>) -> Result<&TrackedImage> {
        self.images.get_ref(handle).ok_or(GPUError::InvalidHandle)
    }

    /// Transitions the image to `dst` unconditionally. `believed` is the
    /// layout the caller thinks the image is in and must match the tracked
    /// one.
    pub fn set_barrier(
        &mut self,
        handle: Handle<TrackedImage>,
        believed: ImageLayout,
        dst: ResState,
    ) -> Result<ImageTransition> {
        let cur = self.get(handle)?.state;
        check_belief(cur, believed)?;
        let transition = self.transition(handle, cur, dst)?;
        self.commit(handle, dst)?;
        Ok(transition)
    }

    /// Transitions to `dst` only when a hazard or a layout change exists.
    pub fn request(
        &mut self,
        handle: Handle<TrackedImage>,
        dst: ResState,
    ) -> Result<Option<ImageTransition>> {
        let cur = self.get(handle)?.state;
        let (next, needed) = cur.settle(dst);
        let transition = if needed {
            Some(self.transition(handle, cur, dst)?)
        } else {
            None
        };
        self.commit(handle, next)?;
        Ok(transition)
    }

    /// Barrier taking `handle` from `src` to `dst`. The tracked state is
    /// left alone.
    pub fn transition(
        &self,
        handle: Handle<TrackedImage>,
        src: ResState,
        dst: ResState,
    ) -> Result<ImageTransition> {
        let img = self.get(handle)?;
        Ok(ImageTransition {
            image: img.image,
            aspect: img.aspect,
            src,
            dst,
        })
    }

    pub(crate) fn commit(&mut self, handle: Handle<TrackedImage>, state: ResState) -> Result<()> {
        let img = self
            .images
            .get_mut_ref(handle)
            .ok_or(GPUError::InvalidHandle)?;
        img.state = state;
        Ok(())
    }

    /// Current state of every tracked image.
    pub fn snapshot(&self) -> TrackerSnapshot {
        TrackerSnapshot(self.images.iter().map(|(h, img)| (h, img.state)).collect())
    }

    /// Puts every image still tracked back into its snapshot state.
    pub fn restore(&mut self, snapshot: TrackerSnapshot) {
        for (handle, state) in snapshot.0 {
            if let Some(img) = self.images.get_mut_ref(handle) {
                img.state = state;
            }
        }
    }
}

/// Image states saved by [`ImageTracker::snapshot`].
#[derive(Debug, Clone)]
pub struct TrackerSnapshot(Vec<(Handle<TrackedImage>, ResState)>);

pub(crate) fn check_belief(cur: ResState, believed: ImageLayout) -> Result<()> {
    if cur.layout != believed {
        return Err(GPUError::LayoutMismatch {
            tracked: cur.layout,
            believed,
        });
    }
    Ok(())
}
