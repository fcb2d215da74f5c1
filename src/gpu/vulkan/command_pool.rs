use ash::vk;

use crate::gpu::error::Result;

/// Resettable pool holding the single frame command buffer, plus transient
/// buffers for one-shot uploads.
pub struct CommandPool {
    device: ash::Device,
    raw: vk::CommandPool,
    frame: vk::CommandBuffer,
}

fn one_time() -> vk::CommandBufferBeginInfo {
    vk::CommandBufferBeginInfo::builder()
        .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)
        .build()
}

impl CommandPool {
    pub(super) fn new(device: ash::Device, family: u32) -> Result<Self> {
        let raw = unsafe {
            device.create_command_pool(
                &vk::CommandPoolCreateInfo::builder()
                    .queue_family_index(family)
                    .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER),
                None,
            )?
        };
        let mut pool = Self {
            device,
            raw,
            frame: vk::CommandBuffer::null(),
        };
        match pool.allocate() {
            Ok(frame) => {
                pool.frame = frame;
                Ok(pool)
            }
            Err(e) => {
                pool.destroy();
                Err(e)
            }
        }
    }

    fn allocate(&self) -> Result<vk::CommandBuffer> {
        let cmds = unsafe {
            self.device.allocate_command_buffers(
                &vk::CommandBufferAllocateInfo::builder()
                    .command_pool(self.raw)
                    .level(vk::CommandBufferLevel::PRIMARY)
                    .command_buffer_count(1),
            )?
        };
        Ok(cmds[0])
    }

    /// Resets the frame buffer and opens it for recording. The previous
    /// frame must have finished executing.
    pub(super) fn begin_frame(&self) -> Result<vk::CommandBuffer> {
        unsafe {
            self.device
                .reset_command_buffer(self.frame, vk::CommandBufferResetFlags::empty())?;
            self.device.begin_command_buffer(self.frame, &one_time())?;
        }
        Ok(self.frame)
    }

    /// Throws away whatever was recorded into `cmd`.
    pub(super) fn discard(&self, cmd: vk::CommandBuffer) -> Result<()> {
        unsafe {
            self.device
                .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())?
        };
        Ok(())
    }

    /// Allocates and opens a buffer that is freed by [`Self::release`].
    pub(super) fn begin_transient(&self) -> Result<vk::CommandBuffer> {
        let cmd = self.allocate()?;
        if let Err(e) = unsafe { self.device.begin_command_buffer(cmd, &one_time()) } {
            self.release(cmd);
            return Err(e.into());
        }
        Ok(cmd)
    }

    pub(super) fn release(&self, cmd: vk::CommandBuffer) {
        unsafe { self.device.free_command_buffers(self.raw, &[cmd]) };
    }

    /// Frees the frame buffer along with the pool.
    pub(super) fn destroy(&mut self) {
        unsafe { self.device.destroy_command_pool(self.raw, None) };
        self.raw = vk::CommandPool::null();
        self.frame = vk::CommandBuffer::null();
    }
}
