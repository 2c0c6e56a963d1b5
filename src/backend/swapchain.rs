// Swapchain - Window presentation
//
// Manages the chain of images we render to and present to the screen.
// Owns the surface so it can be rebuilt on resize without the window.
// Out-of-date and suboptimal are reported as values, never as errors.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::{AcquireOutcome, PresentOutcome, Presenter, Resolution, SwapchainImage, VulkanDevice};

pub struct Swapchain {
    swapchain: vk::SwapchainKHR,
    swapchain_loader: ash::khr::swapchain::Device,
    surface: vk::SurfaceKHR,
    surface_loader: ash::khr::surface::Instance,
    images: Vec<SwapchainImage>,
    pub format: vk::Format,
    pub present_mode: vk::PresentModeKHR,
    preferred_mode: vk::PresentModeKHR,
    resolution: Resolution,
    device: Arc<VulkanDevice>,
}

impl Swapchain {
    /// Takes ownership of `surface`.
    pub fn new(
        device: Arc<VulkanDevice>,
        surface: vk::SurfaceKHR,
        surface_loader: ash::khr::surface::Instance,
        requested: Resolution,
        preferred_mode: vk::PresentModeKHR,
    ) -> Result<Self> {
        let supported = unsafe {
            surface_loader.get_physical_device_surface_support(device.physical_device, device.queue_family, surface)
        }?;
        if !supported {
            anyhow::bail!("Queue family {} cannot present to this surface", device.queue_family);
        }

        let swapchain_loader = ash::khr::swapchain::Device::new(&device.instance, &device.device);
        let mut swapchain = Self {
            swapchain: vk::SwapchainKHR::null(),
            swapchain_loader,
            surface,
            surface_loader,
            images: Vec::new(),
            format: vk::Format::UNDEFINED,
            present_mode: vk::PresentModeKHR::FIFO,
            preferred_mode,
            resolution: Resolution::default(),
            device,
        };
        swapchain.build(requested)?;
        Ok(swapchain)
    }

    fn build(&mut self, requested: Resolution) -> Result<Resolution> {
        let physical_device = self.device.physical_device;

        // Query surface capabilities
        let surface_caps = unsafe {
            self.surface_loader
                .get_physical_device_surface_capabilities(physical_device, self.surface)
        }?;

        // Query supported formats
        let formats = unsafe {
            self.surface_loader
                .get_physical_device_surface_formats(physical_device, self.surface)
        }?;

        // Query supported present modes
        let present_modes = unsafe {
            self.surface_loader
                .get_physical_device_surface_present_modes(physical_device, self.surface)
        }?;

        // Composite writes the swapchain image from a compute shader, so
        // prefer UNORM (SRGB formats rarely allow storage)
        let surface_format = formats
            .iter()
            .find(|f| {
                f.format == vk::Format::B8G8R8A8_UNORM && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
            })
            .or_else(|| formats.first())
            .copied()
            .context("No suitable surface format")?;

        // FIFO is always supported
        let present_mode = present_modes
            .iter()
            .copied()
            .find(|&mode| mode == self.preferred_mode)
            .unwrap_or(vk::PresentModeKHR::FIFO);

        // Choose extent. A minimized window reports 0x0 here.
        let extent = if surface_caps.current_extent.width != u32::MAX {
            surface_caps.current_extent
        } else {
            vk::Extent2D {
                width: requested
                    .width
                    .clamp(surface_caps.min_image_extent.width, surface_caps.max_image_extent.width),
                height: requested
                    .height
                    .clamp(surface_caps.min_image_extent.height, surface_caps.max_image_extent.height),
            }
        };
        let resolution = Resolution::from(extent);

        self.destroy_images();
        if resolution.is_zero() {
            log::debug!("Surface is zero-sized, swapchain not rebuilt");
            self.resolution = resolution;
            return Ok(resolution);
        }

        // Triple buffering when the surface allows it
        let mut image_count = surface_caps.min_image_count + 1;
        if surface_caps.max_image_count > 0 && image_count > surface_caps.max_image_count {
            image_count = surface_caps.max_image_count;
        }

        let mut usage = vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST;
        if surface_caps.supported_usage_flags.contains(vk::ImageUsageFlags::STORAGE) {
            usage |= vk::ImageUsageFlags::STORAGE;
        }

        let old_swapchain = self.swapchain;
        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(self.surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(usage)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(surface_caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old_swapchain);

        let swapchain = unsafe { self.swapchain_loader.create_swapchain(&create_info, None) }
            .context("Failed to create swapchain")?;
        if old_swapchain != vk::SwapchainKHR::null() {
            unsafe { self.swapchain_loader.destroy_swapchain(old_swapchain, None) };
        }
        self.swapchain = swapchain;

        let images = unsafe { self.swapchain_loader.get_swapchain_images(swapchain) }?;
        for image in images {
            let create_info = vk::ImageViewCreateInfo::default()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(surface_format.format)
                .components(vk::ComponentMapping {
                    r: vk::ComponentSwizzle::IDENTITY,
                    g: vk::ComponentSwizzle::IDENTITY,
                    b: vk::ComponentSwizzle::IDENTITY,
                    a: vk::ComponentSwizzle::IDENTITY,
                })
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                });
            let view = unsafe { self.device.device.create_image_view(&create_info, None) }
                .context("Failed to create image view")?;
            self.images.push(SwapchainImage { image, view });
        }

        self.format = surface_format.format;
        self.present_mode = present_mode;
        self.resolution = resolution;
        log::info!(
            "Swapchain: {}x{}, {} images, {:?}, {:?}",
            extent.width,
            extent.height,
            self.images.len(),
            surface_format.format,
            present_mode
        );
        Ok(resolution)
    }

    fn destroy_images(&mut self) {
        for image in self.images.drain(..) {
            unsafe { self.device.device.destroy_image_view(image.view, None) };
        }
    }
}

impl Presenter for Swapchain {
    fn resolution(&self) -> Resolution {
        self.resolution
    }

    fn images(&self) -> &[SwapchainImage] {
        &self.images
    }

    fn acquire_next_image(&mut self, signal: vk::Semaphore) -> Result<AcquireOutcome> {
        if self.swapchain == vk::SwapchainKHR::null() || self.images.is_empty() {
            return Ok(AcquireOutcome::OutOfDate);
        }
        let result = unsafe {
            self.swapchain_loader
                .acquire_next_image(self.swapchain, u64::MAX, signal, vk::Fence::null())
        };

        match result {
            Ok((image_index, suboptimal)) => Ok(AcquireOutcome::Acquired {
                image_index,
                suboptimal,
            }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireOutcome::OutOfDate),
            Err(e) => Err(e).context("Failed to acquire swapchain image"),
        }
    }

    fn present(&mut self, image_index: u32, wait: vk::Semaphore) -> Result<PresentOutcome> {
        let swapchains = [self.swapchain];
        let image_indices = [image_index];
        let wait_semaphores = [wait];

        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let result = unsafe {
            self.swapchain_loader
                .queue_present(self.device.graphics_queue, &present_info)
        };

        match result {
            Ok(false) => Ok(PresentOutcome::Presented),
            Ok(true) => Ok(PresentOutcome::Suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentOutcome::OutOfDate),
            Err(e) => Err(e).context("Failed to present"),
        }
    }

    fn recreate(&mut self, requested: Resolution) -> Result<Resolution> {
        self.build(requested)
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device.device_wait_idle();
            self.destroy_images();
            if self.swapchain != vk::SwapchainKHR::null() {
                self.swapchain_loader.destroy_swapchain(self.swapchain, None);
            }
            self.surface_loader.destroy_surface(self.surface, None);
        }
    }
}
