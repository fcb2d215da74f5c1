use std::collections::HashMap;

use ash::vk;

use crate::gpu::error::Result;
use crate::gpu::structs::{
    DescriptorResource, DescriptorWrite, BUFFER_BINDING_OFFSET, SAMPLER_BINDING_OFFSET,
    SRV_BINDING_OFFSET, UAV_BINDING_OFFSET,
};
use crate::gpu::Device;

/// Per-variant cache of allocated per-draw descriptor sets, keyed by the
/// caller's binding mask.
#[derive(Debug, Default)]
pub struct DescriptorSetCache {
    sets: HashMap<u32, vk::DescriptorSet>,
}

impl DescriptorSetCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the set for `mask`, allocating it on first use. Variants
    /// without a per-draw layout have nothing to bind and get `None`.
    pub fn get_or_allocate<D: Device>(
        &mut self,
        device: &D,
        layout: Option<vk::DescriptorSetLayout>,
        mask: u32,
    ) -> Result<Option<vk::DescriptorSet>> {
        let Some(layout) = layout else {
            return Ok(None);
        };

        if let Some(set) = self.sets.get(&mask) {
            return Ok(Some(*set));
        }

        let set = device.allocate_descriptor_set(layout)?;
        log::debug!("allocated per-draw set {:?} for mask {:#x}", set, mask);
        self.sets.insert(mask, set);
        Ok(Some(set))
    }

    pub fn get(&self, mask: u32) -> Option<vk::DescriptorSet> {
        self.sets.get(&mask).copied()
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    pub fn release_all<D: Device>(&mut self, device: &D) {
        for (_, set) in self.sets.drain() {
            device.free_descriptor_set(set);
        }
    }
}

/// Accumulates descriptor writes for one set.
///
/// Locations are shader register indices; the descriptor-space offset for
/// the resource class is added here. Writing replaces whatever the set held,
/// so every draw sharing the set sees the last write.
#[derive(Debug)]
pub struct BindingWriter {
    set: vk::DescriptorSet,
    writes: Vec<DescriptorWrite>,
}

impl BindingWriter {
    pub fn new(set: vk::DescriptorSet) -> Self {
        Self {
            set,
            writes: Vec::with_capacity(16),
        }
    }

    fn push(mut self, binding: u32, resource: DescriptorResource) -> Self {
        self.writes.push(DescriptorWrite { binding, resource });
        self
    }

    pub fn sampler(self, sampler: vk::Sampler, location: u32) -> Self {
        self.push(SAMPLER_BINDING_OFFSET + location, DescriptorResource::Sampler(sampler))
    }

    pub fn image(self, view: vk::ImageView, location: u32) -> Self {
        self.image_with_layout(view, location, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
    }

    pub fn image_with_layout(
        self,
        view: vk::ImageView,
        location: u32,
        layout: vk::ImageLayout,
    ) -> Self {
        self.push(
            SRV_BINDING_OFFSET + location,
            DescriptorResource::SampledImage { view, layout },
        )
    }

    /// Image and sampler for a combined-image-sampler binding, in the
    /// image's register space.
    pub fn texture(self, sampler: vk::Sampler, view: vk::ImageView, location: u32) -> Self {
        self.push(
            SRV_BINDING_OFFSET + location,
            DescriptorResource::CombinedImageSampler {
                sampler,
                view,
                layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            },
        )
    }

    pub fn storage_image(self, view: vk::ImageView, location: u32) -> Self {
        self.push(
            UAV_BINDING_OFFSET + location,
            DescriptorResource::StorageImage {
                view,
                layout: vk::ImageLayout::GENERAL,
            },
        )
    }

    pub fn uniform_buffer(self, buffer: vk::Buffer, location: u32) -> Self {
        self.push(
            BUFFER_BINDING_OFFSET + location,
            DescriptorResource::UniformBuffer {
                buffer,
                offset: 0,
                range: vk::WHOLE_SIZE,
            },
        )
    }

    pub fn storage_buffer(self, buffer: vk::Buffer, location: u32) -> Self {
        self.push(
            UAV_BINDING_OFFSET + location,
            DescriptorResource::StorageBuffer {
                buffer,
                offset: 0,
                range: vk::WHOLE_SIZE,
            },
        )
    }

    pub fn storage_buffer_readonly(self, buffer: vk::Buffer, location: u32) -> Self {
        self.push(
            SRV_BINDING_OFFSET + location,
            DescriptorResource::StorageBuffer {
                buffer,
                offset: 0,
                range: vk::WHOLE_SIZE,
            },
        )
    }

    pub fn acceleration_structure(
        self,
        structure: vk::AccelerationStructureKHR,
        location: u32,
    ) -> Self {
        self.push(
            SRV_BINDING_OFFSET + location,
            DescriptorResource::AccelerationStructure(structure),
        )
    }

    pub fn set(&self) -> vk::DescriptorSet {
        self.set
    }

    pub fn writes(&self) -> &[DescriptorWrite] {
        &self.writes
    }

    pub fn bind<D: Device>(self, device: &D) {
        if self.writes.is_empty() {
            return;
        }
        device.update_descriptor_set(self.set, &self.writes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::null::NullDevice;
    use crate::gpu::structs::{DescriptorKind, LayoutBinding};
    use ash::vk::Handle as _;

    #[test]
    fn writer_applies_register_offsets() {
        let w = BindingWriter::new(vk::DescriptorSet::null())
            .uniform_buffer(vk::Buffer::from_raw(1), 0)
            .sampler(vk::Sampler::from_raw(2), 1)
            .image(vk::ImageView::from_raw(3), 2)
            .storage_image(vk::ImageView::from_raw(4), 3);
        let slots: Vec<u32> = w.writes().iter().map(|w| w.binding).collect();
        assert_eq!(slots, vec![0, 129, 258, 387]);
    }

    #[test]
    fn texture_lands_in_image_space() {
        let sampler = vk::Sampler::from_raw(5);
        let view = vk::ImageView::from_raw(6);
        let w = BindingWriter::new(vk::DescriptorSet::from_raw(9)).texture(sampler, view, 0);
        assert_eq!(w.set(), vk::DescriptorSet::from_raw(9));
        let write = w.writes()[0];
        assert_eq!(write.binding, SRV_BINDING_OFFSET);
        assert_eq!(write.resource.kind(), DescriptorKind::CombinedImageSampler);
        assert_eq!(
            vk::DescriptorType::from(write.resource.kind()),
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER
        );
    }

    #[test]
    fn no_layout_means_nothing_to_bind() {
        let device = NullDevice::new();
        let mut cache = DescriptorSetCache::new();
        assert_eq!(cache.get_or_allocate(&device, None, 3).unwrap(), None);
        assert_eq!(device.descriptor_sets_allocated(), 0);
    }

    #[test]
    fn masks_are_memoized() {
        let device = NullDevice::new();
        let layout = device
            .create_descriptor_set_layout(&[LayoutBinding {
                binding: 256,
                kind: DescriptorKind::SampledImage,
                count: 1,
                stages: vk::ShaderStageFlags::FRAGMENT,
            }])
            .unwrap();
        let mut cache = DescriptorSetCache::new();
        let a = cache.get_or_allocate(&device, Some(layout), 1).unwrap();
        let b = cache.get_or_allocate(&device, Some(layout), 1).unwrap();
        let c = cache.get_or_allocate(&device, Some(layout), 2).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(device.descriptor_sets_allocated(), 2);

        cache.release_all(&device);
        device.destroy_descriptor_set_layout(layout);
        assert_eq!(device.live_objects(), 0);
    }
}
