use ash::vk;
use vk_mem::Alloc;

use super::VulkanDevice;
use crate::gpu::error::{GPUError, Result};

impl VulkanDevice {
    /// Allocates a buffer through `vk-mem`. The allocation is owned by the
    /// device until [`Self::destroy_buffer`] is called with the same handle.
    pub(super) fn create_buffer(
        &self,
        size: u64,
        usage: vk::BufferUsageFlags,
        host_visible: bool,
    ) -> Result<(vk::Buffer, vk::DeviceAddress)> {
        let create_info = vk_mem::AllocationCreateInfo {
            usage: if host_visible {
                vk_mem::MemoryUsage::AutoPreferHost
            } else {
                vk_mem::MemoryUsage::AutoPreferDevice
            },
            flags: if host_visible {
                vk_mem::AllocationCreateFlags::HOST_ACCESS_SEQUENTIAL_WRITE
            } else {
                vk_mem::AllocationCreateFlags::empty()
            },
            ..Default::default()
        };

        let (buffer, allocation) = unsafe {
            self.allocator.create_buffer(
                &vk::BufferCreateInfo::builder()
                    .size(size.max(1))
                    .usage(usage | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS)
                    .sharing_mode(vk::SharingMode::EXCLUSIVE)
                    .build(),
                &create_info,
            )?
        };
        self.allocations.borrow_mut().insert(buffer, allocation);

        let address = unsafe {
            self.device
                .get_buffer_device_address(&vk::BufferDeviceAddressInfo::builder().buffer(buffer))
        };
        Ok((buffer, address))
    }

    /// Host-visible buffer initialised with `bytes`.
    pub(super) fn create_host_buffer(
        &self,
        size: u64,
        usage: vk::BufferUsageFlags,
        bytes: &[u8],
    ) -> Result<(vk::Buffer, vk::DeviceAddress)> {
        let (buffer, address) = self.create_buffer(size, usage, true)?;
        if let Err(e) = self.write_buffer(buffer, bytes) {
            self.destroy_buffer(buffer);
            return Err(e);
        }
        Ok((buffer, address))
    }

    fn write_buffer(&self, buffer: vk::Buffer, bytes: &[u8]) -> Result<()> {
        let mut allocations = self.allocations.borrow_mut();
        let allocation = allocations
            .get_mut(&buffer)
            .ok_or(GPUError::InvalidHandle)?;
        unsafe {
            let ptr = self.allocator.map_memory(allocation)?;
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr, bytes.len());
            self.allocator.unmap_memory(allocation);
        }
        Ok(())
    }

    pub(super) fn destroy_buffer(&self, buffer: vk::Buffer) {
        match self.allocations.borrow_mut().remove(&buffer) {
            Some(mut allocation) => unsafe { self.allocator.destroy_buffer(buffer, &mut allocation) },
            None => log::warn!("destroying unknown buffer {:?}", buffer),
        }
    }
}
