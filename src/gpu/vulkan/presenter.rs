use ash::extensions::khr;
use ash::vk;

use crate::gpu::error::{GPUError, Result};
use crate::gpu::{AcquiredImage, Presenter};

/// Presents through a swapchain created and resized by the application.
///
/// Call [`SwapchainPresenter::replace`] after recreating the swapchain; the
/// generation bump makes the renderer skip the frame in flight.
pub struct SwapchainPresenter {
    device: ash::Device,
    loader: khr::Swapchain,
    swapchain: vk::SwapchainKHR,
    queue: vk::Queue,
    acquired: vk::Semaphore,
    render_finished: vk::Semaphore,
    generation: u64,
}

impl SwapchainPresenter {
    pub fn new(
        instance: &ash::Instance,
        device: &ash::Device,
        queue: vk::Queue,
        swapchain: vk::SwapchainKHR,
    ) -> Result<Self> {
        let info = vk::SemaphoreCreateInfo::builder().build();
        let acquired = unsafe { device.create_semaphore(&info, None)? };
        let render_finished = match unsafe { device.create_semaphore(&info, None) } {
            Ok(s) => s,
            Err(e) => {
                unsafe { device.destroy_semaphore(acquired, None) };
                return Err(e.into());
            }
        };
        Ok(Self {
            device: device.clone(),
            loader: khr::Swapchain::new(instance, device),
            swapchain,
            queue,
            acquired,
            render_finished,
            generation: 0,
        })
    }

    pub fn swapchain(&self) -> vk::SwapchainKHR {
        self.swapchain
    }

    pub fn replace(&mut self, swapchain: vk::SwapchainKHR) {
        self.swapchain = swapchain;
        self.generation += 1;
        log::info!("swapchain replaced, generation {}", self.generation);
    }

    pub fn destroy(self) {
        unsafe {
            self.device.destroy_semaphore(self.acquired, None);
            self.device.destroy_semaphore(self.render_finished, None);
        }
    }
}

impl Presenter for SwapchainPresenter {
    fn generation(&self) -> u64 {
        self.generation
    }

    fn acquire(&mut self) -> Result<Option<AcquiredImage>> {
        let res = unsafe {
            self.loader.acquire_next_image(
                self.swapchain,
                u64::MAX,
                self.acquired,
                vk::Fence::null(),
            )
        };
        match res {
            Ok((index, suboptimal)) => {
                if suboptimal {
                    log::debug!("swapchain image {} is suboptimal", index);
                }
                Ok(Some(AcquiredImage {
                    index,
                    acquired: self.acquired,
                    render_finished: self.render_finished,
                }))
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(None),
            Err(e) => Err(GPUError::from(e)),
        }
    }

    fn present(&mut self, image: &AcquiredImage) -> Result<()> {
        let wait = [image.render_finished];
        let swapchains = [self.swapchain];
        let indices = [image.index];
        let info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&wait)
            .swapchains(&swapchains)
            .image_indices(&indices)
            .build();
        unsafe { self.loader.queue_present(self.queue, &info)? };
        Ok(())
    }
}
