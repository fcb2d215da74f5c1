use ash::vk;

use crate::gpu::error::Result;
use crate::gpu::structs::{
    BindingDescriptor, DescriptorKind, LayoutBinding, ShaderType, BUFFER_BINDING_OFFSET,
};
use crate::gpu::Device;

use super::bind_manager::BindingWriter;

/// Stages that may read the per-frame constants.
pub const PER_FRAME_STAGES: vk::ShaderStageFlags = vk::ShaderStageFlags::from_raw(
    vk::ShaderStageFlags::VERTEX.as_raw()
        | vk::ShaderStageFlags::GEOMETRY.as_raw()
        | vk::ShaderStageFlags::FRAGMENT.as_raw()
        | vk::ShaderStageFlags::COMPUTE.as_raw()
        | vk::ShaderStageFlags::RAYGEN_KHR.as_raw(),
);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PerFrameDescriptors {
    layout: vk::DescriptorSetLayout,
    set: vk::DescriptorSet,
}

/// Proof that a shader object holds a reference on the per-frame set.
///
/// Leases cannot be cloned; each one must go back through
/// [`PerFrameRegistry::release`].
#[derive(Debug, PartialEq, Eq)]
pub struct PerFrameLease {
    layout: vk::DescriptorSetLayout,
    set: vk::DescriptorSet,
}

impl PerFrameLease {
    pub fn layout(&self) -> vk::DescriptorSetLayout {
        self.layout
    }

    pub fn set(&self) -> vk::DescriptorSet {
        self.set
    }
}

/// Owns the set-0 layout and descriptor set shared by every shader.
///
/// The first lease creates both objects, the last release frees them, so
/// the per-frame set lives exactly as long as at least one shader object.
#[derive(Debug, Default)]
pub struct PerFrameRegistry {
    current: Option<PerFrameDescriptors>,
    leases: u32,
}

impl PerFrameRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire<D: Device>(&mut self, device: &D) -> Result<PerFrameLease> {
        let current = match self.current {
            Some(current) => current,
            None => {
                let layout = device.create_descriptor_set_layout(&[LayoutBinding {
                    binding: BUFFER_BINDING_OFFSET,
                    kind: DescriptorKind::UniformBuffer,
                    count: 1,
                    stages: PER_FRAME_STAGES,
                }])?;
                let set = match device.allocate_descriptor_set(layout) {
                    Ok(set) => set,
                    Err(e) => {
                        device.destroy_descriptor_set_layout(layout);
                        return Err(e);
                    }
                };
                log::debug!("created per-frame descriptor set {:?}", set);
                let created = PerFrameDescriptors { layout, set };
                self.current = Some(created);
                created
            }
        };

        self.leases += 1;
        Ok(PerFrameLease {
            layout: current.layout,
            set: current.set,
        })
    }

    pub fn release<D: Device>(&mut self, device: &D, lease: PerFrameLease) {
        debug_assert_eq!(self.current.map(|c| c.set), Some(lease.set));
        self.leases = self.leases.saturating_sub(1);
        if self.leases == 0 {
            if let Some(current) = self.current.take() {
                log::debug!("freeing per-frame descriptor set {:?}", current.set);
                device.free_descriptor_set(current.set);
                device.destroy_descriptor_set_layout(current.layout);
            }
        }
    }

    pub fn live_leases(&self) -> u32 {
        self.leases
    }

    pub fn layout(&self) -> Option<vk::DescriptorSetLayout> {
        self.current.map(|c| c.layout)
    }

    pub fn set(&self) -> Option<vk::DescriptorSet> {
        self.current.map(|c| c.set)
    }

    /// Writer for the per-frame set, `None` while no shader object exists.
    pub fn binder(&self) -> Option<BindingWriter> {
        self.set().map(BindingWriter::new)
    }
}

/// Merges the per-draw bindings of every stage into one layout.
///
/// Bindings sharing a slot are declared once with the union of their stage
/// visibility. Entries keep first-seen order.
pub fn merge_per_draw_bindings<'a>(
    stages: impl IntoIterator<Item = (ShaderType, &'a [BindingDescriptor])>,
) -> Vec<LayoutBinding> {
    let mut merged: Vec<LayoutBinding> = Vec::new();
    for (stage, bindings) in stages {
        let flags = vk::ShaderStageFlags::from(stage);
        for b in bindings {
            match merged.iter_mut().find(|m| m.binding == b.binding) {
                Some(existing) => {
                    if existing.kind != b.kind {
                        log::warn!(
                            "binding {} declared as {:?} and {:?}; keeping {:?}",
                            b.binding,
                            existing.kind,
                            b.kind,
                            existing.kind
                        );
                    }
                    existing.stages |= flags;
                }
                None => merged.push(LayoutBinding {
                    binding: b.binding,
                    kind: b.kind,
                    count: 1,
                    stages: flags,
                }),
            }
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::null::NullDevice;
    use crate::gpu::structs::PER_DRAW_SET;

    fn sampled(binding: u32) -> BindingDescriptor {
        BindingDescriptor {
            set: PER_DRAW_SET,
            binding,
            size: 0,
            kind: DescriptorKind::SampledImage,
        }
    }

    #[test]
    fn shared_slots_or_their_stages() {
        let vs = [sampled(256)];
        let fs = [sampled(256), sampled(257)];
        let merged = merge_per_draw_bindings([
            (ShaderType::Vertex, &vs[..]),
            (ShaderType::Fragment, &fs[..]),
        ]);
        assert_eq!(merged.len(), 2);
        assert_eq!(
            merged[0].stages,
            vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT
        );
        assert_eq!(merged[1].stages, vk::ShaderStageFlags::FRAGMENT);
    }

    #[test]
    fn per_frame_set_follows_lease_count() {
        let device = NullDevice::new();
        let mut registry = PerFrameRegistry::new();

        let a = registry.acquire(&device).unwrap();
        let b = registry.acquire(&device).unwrap();
        assert_eq!(a.set(), b.set());
        assert_eq!(device.descriptor_sets_allocated(), 1);

        registry.release(&device, a);
        assert!(registry.set().is_some());
        registry.release(&device, b);
        assert!(registry.set().is_none());
        assert_eq!(device.live_objects(), 0);

        let c = registry.acquire(&device).unwrap();
        assert_eq!(device.descriptor_sets_allocated(), 2);
        registry.release(&device, c);
    }
}
