use ash::vk;
use smallvec::SmallVec;

use crate::gpu::error::Result;
use crate::gpu::Device;
use crate::sync::state::{
    check_belief, ImageLayout, ImageTracker, ImageTransition, ResState, TrackedImage,
};
use crate::utils::Handle;

/// A queued state change; `transition` is `None` for a read folded into the
/// tracked state.
#[derive(Debug, Clone, Copy)]
struct Planned {
    image: Handle<TrackedImage>,
    state: ResState,
    transition: Option<ImageTransition>,
}

/// Batches image transitions for one pipeline-barrier call.
///
/// Transitions are planned against the [`ImageTracker`] without touching it
/// and committed only by [`BarrierBuilder::emit`], so the tracked state
/// always equals the destination of the last barrier actually recorded.
/// Dropping the builder discards the plan.
pub struct BarrierBuilder<'a> {
    tracker: &'a mut ImageTracker,
    planned: SmallVec<[Planned; 4]>,
}

impl<'a> BarrierBuilder<'a> {
    pub fn new(tracker: &'a mut ImageTracker) -> Self {
        Self {
            tracker,
            planned: SmallVec::new(),
        }
    }

    /// State `image` will be in once the queued transitions are emitted.
    fn current(&self, image: Handle<TrackedImage>) -> Result<ResState> {
        match self.planned.iter().rev().find(|p| p.image == image) {
            Some(p) => Ok(p.state),
            None => Ok(self.tracker.get(image)?.state()),
        }
    }

    /// Explicit transition; the barrier is recorded even when the state does
    /// not change.
    pub fn image(
        &mut self,
        image: Handle<TrackedImage>,
        believed: ImageLayout,
        dst: ResState,
    ) -> Result<()> {
        let cur = self.current(image)?;
        check_belief(cur, believed)?;
        let transition = self.tracker.transition(image, cur, dst)?;
        self.planned.push(Planned {
            image,
            state: dst,
            transition: Some(transition),
        });
        Ok(())
    }

    /// Transition only if the tracked state requires one.
    pub fn require(&mut self, image: Handle<TrackedImage>, dst: ResState) -> Result<()> {
        let cur = self.current(image)?;
        let (state, needed) = cur.settle(dst);
        let transition = if needed {
            Some(self.tracker.transition(image, cur, dst)?)
        } else {
            None
        };
        self.planned.push(Planned {
            image,
            state,
            transition,
        });
        Ok(())
    }

    pub fn pending(&self) -> impl Iterator<Item = &ImageTransition> + '_ {
        self.planned.iter().filter_map(|p| p.transition.as_ref())
    }

    /// Records the queued barriers and commits their states to the tracker.
    /// Returns the number of barriers recorded.
    pub fn emit<D: Device>(&mut self, device: &D, cmd: vk::CommandBuffer) -> Result<usize> {
        let transitions: SmallVec<[ImageTransition; 4]> = self.pending().copied().collect();
        if !transitions.is_empty() {
            device.cmd_image_barriers(cmd, &transitions);
        }
        for p in self.planned.drain(..) {
            self.tracker.commit(p.image, p.state)?;
        }
        Ok(transitions.len())
    }
}
