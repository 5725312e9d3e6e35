//! Swapchain management.
//!
//! Each swapchain image slot is tracked as available or acquired. An image
//! must be acquired before it is presented, and presenting returns it to the
//! presentation engine.

use crate::device::Device;
use crate::driver::{SwapchainInfo, ViewInfo};
use crate::error::{GpuError, ProtocolViolation, Result};
use crate::sync::{Fence, Semaphore};
use ash::vk;

/// Swapchain creation parameters.
#[derive(Debug, Clone)]
pub struct SwapchainDesc {
    pub surface: vk::SurfaceKHR,
    /// Used when the surface leaves the extent to the application.
    pub width: u32,
    pub height: u32,
    pub vsync: bool,
    pub preferred_format: vk::SurfaceFormatKHR,
    pub image_usage: vk::ImageUsageFlags,
    /// Families that will use the images. Two or more make them concurrent.
    pub queue_families: Vec<u32>,
}

impl SwapchainDesc {
    pub fn new(surface: vk::SurfaceKHR, width: u32, height: u32) -> Self {
        Self {
            surface,
            width,
            height,
            vsync: false,
            preferred_format: vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            image_usage: vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST,
            queue_families: Vec::new(),
        }
    }

    pub fn vsync(mut self, vsync: bool) -> Self {
        self.vsync = vsync;
        self
    }

    pub fn preferred_format(mut self, format: vk::SurfaceFormatKHR) -> Self {
        self.preferred_format = format;
        self
    }
}

/// State of one swapchain image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Owned by the presentation engine.
    Available,
    /// Owned by the application until presented.
    Acquired,
}

/// Result of an acquire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    Acquired { index: u32, suboptimal: bool },
    /// No image was available and the timeout was zero.
    NotReady,
    TimedOut,
    /// The swapchain must be recreated before acquiring again.
    OutOfDate,
}

/// Swapchain wrapper.
pub struct Swapchain {
    device: Device,
    swapchain: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    views: Vec<vk::ImageView>,
    render_pass: vk::RenderPass,
    framebuffers: Vec<vk::Framebuffer>,
    format: vk::SurfaceFormatKHR,
    extent: vk::Extent2D,
    present_mode: vk::PresentModeKHR,
    slots: Vec<SlotState>,
    destroyed: bool,
}

impl std::fmt::Debug for Swapchain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Swapchain")
            .field("swapchain", &self.swapchain)
            .field("format", &self.format)
            .field("extent", &self.extent)
            .field("present_mode", &self.present_mode)
            .field("slots", &self.slots)
            .finish()
    }
}

impl Swapchain {
    /// Create a swapchain for `desc.surface`, with a view, a present render
    /// pass and a framebuffer per image.
    pub fn create(device: &Device, desc: &SwapchainDesc) -> Result<Self> {
        Self::build(device, desc, vk::SwapchainKHR::null())
    }

    fn build(device: &Device, desc: &SwapchainDesc, old: vk::SwapchainKHR) -> Result<Self> {
        device.ensure_alive("creating swapchain")?;
        let driver = device.driver();
        let result = unsafe { driver.surface_support(desc.surface) };
        let support = device.check(result, "querying surface support")?;
        let format = select_surface_format(&support.formats, desc.preferred_format)
            .ok_or_else(|| GpuError::Other("surface reports no formats".to_string()))?;
        let present_mode = select_present_mode(&support.present_modes, desc.vsync);
        let extent = calculate_extent(&support.capabilities, desc.width, desc.height);
        let image_count = select_image_count(&support.capabilities);

        let info = SwapchainInfo {
            surface: desc.surface,
            min_image_count: image_count,
            format,
            extent,
            image_usage: desc.image_usage,
            pre_transform: support.capabilities.current_transform,
            present_mode,
            old_swapchain: old,
            queue_families: &desc.queue_families,
        };
        let result = unsafe { driver.create_swapchain(&info) };
        let swapchain = device.check(result, "creating swapchain")?;

        let mut this = Self {
            device: device.clone(),
            swapchain,
            images: Vec::new(),
            views: Vec::new(),
            render_pass: vk::RenderPass::null(),
            framebuffers: Vec::new(),
            format,
            extent,
            present_mode,
            slots: Vec::new(),
            destroyed: false,
        };

        let result = unsafe { driver.swapchain_images(swapchain) };
        this.images = device.check(result, "getting swapchain images")?;
        for &image in &this.images {
            let view_info = ViewInfo {
                image,
                view_type: vk::ImageViewType::TYPE_2D,
                format: format.format,
                range: vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                },
            };
            let result = unsafe { driver.create_image_view(&view_info) };
            this.views.push(device.check(result, "creating swapchain image view")?);
        }

        let result = unsafe { driver.create_present_render_pass(format.format) };
        this.render_pass = device.check(result, "creating present render pass")?;
        for &view in &this.views {
            let result = unsafe { driver.create_framebuffer(this.render_pass, &[view], extent) };
            this.framebuffers
                .push(device.check(result, "creating swapchain framebuffer")?);
        }
        this.slots = vec![SlotState::Available; this.images.len()];

        tracing::info!(
            images = this.images.len(),
            width = extent.width,
            height = extent.height,
            format = ?format.format,
            present_mode = ?present_mode,
            "created swapchain"
        );
        Ok(this)
    }

    /// Replace the swapchain, for example after a resize or an out-of-date
    /// result.
    ///
    /// The device must be idle with respect to the old images.
    pub fn recreate(&mut self, desc: &SwapchainDesc) -> Result<()> {
        self.ensure_live()?;
        let replacement = Self::build(&self.device, desc, self.swapchain)?;
        let mut old = std::mem::replace(self, replacement);
        old.release();
        Ok(())
    }

    /// Get the raw swapchain handle.
    pub fn handle(&self) -> vk::SwapchainKHR {
        self.swapchain
    }

    pub fn images(&self) -> &[vk::Image] {
        &self.images
    }

    pub fn views(&self) -> &[vk::ImageView] {
        &self.views
    }

    pub fn framebuffers(&self) -> &[vk::Framebuffer] {
        &self.framebuffers
    }

    pub fn render_pass(&self) -> vk::RenderPass {
        self.render_pass
    }

    pub fn format(&self) -> vk::SurfaceFormatKHR {
        self.format
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn present_mode(&self) -> vk::PresentModeKHR {
        self.present_mode
    }

    pub fn image_count(&self) -> u32 {
        self.images.len() as u32
    }

    pub fn slot_state(&self, index: u32) -> Option<SlotState> {
        self.slots.get(index as usize).copied()
    }

    /// Number of images currently held by the application.
    pub fn acquired_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| **s == SlotState::Acquired)
            .count()
    }

    fn ensure_live(&self) -> Result<()> {
        if self.destroyed {
            return self
                .device
                .violation(ProtocolViolation::UseAfterDestroy { kind: "swapchain" });
        }
        Ok(())
    }

    /// Acquire the next image, signalling `semaphore` and/or `fence` when it
    /// is ready for use.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn acquire_next_image(
        &mut self,
        timeout_ns: u64,
        semaphore: Option<&Semaphore>,
        fence: Option<&Fence>,
    ) -> Result<AcquireOutcome> {
        self.ensure_live()?;
        self.device.ensure_alive("acquiring swapchain image")?;
        if semaphore.is_none() && fence.is_none() {
            return self.device.violation(ProtocolViolation::AcquireWithoutSync);
        }
        if let Some(semaphore) = semaphore {
            self.device.protocol(semaphore.check_live())?;
            if semaphore.has_pending_signal() {
                return self
                    .device
                    .violation(ProtocolViolation::SemaphoreAlreadySignalled);
            }
        }
        if let Some(fence) = fence {
            self.device.protocol(fence.check_submittable())?;
        }

        let result = unsafe {
            self.device.driver().acquire_next_image(
                self.swapchain,
                timeout_ns,
                semaphore.map_or(vk::Semaphore::null(), Semaphore::handle),
                fence.map_or(vk::Fence::null(), Fence::handle),
            )
        };
        let (index, suboptimal) = match result {
            Ok(acquired) => acquired,
            Err(vk::Result::NOT_READY) => return Ok(AcquireOutcome::NotReady),
            Err(vk::Result::TIMEOUT) => return Ok(AcquireOutcome::TimedOut),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => return Ok(AcquireOutcome::OutOfDate),
            Err(err) => return self.device.check(Err(err), "acquiring swapchain image"),
        };

        match self.slots.get(index as usize) {
            None => {
                return self.device.violation(ProtocolViolation::ImageIndexOutOfRange {
                    index,
                    count: self.image_count(),
                })
            }
            Some(SlotState::Acquired) => {
                return self.device.violation(ProtocolViolation::DoubleAcquire { index })
            }
            Some(SlotState::Available) => {}
        }
        self.slots[index as usize] = SlotState::Acquired;
        if let Some(semaphore) = semaphore {
            semaphore.set_pending(true);
        }
        if let Some(fence) = fence {
            fence.mark_pending();
        }
        Ok(AcquireOutcome::Acquired { index, suboptimal })
    }

    pub(crate) fn check_presentable(&self, index: u32) -> std::result::Result<(), ProtocolViolation> {
        if self.destroyed {
            return Err(ProtocolViolation::UseAfterDestroy { kind: "swapchain" });
        }
        match self.slots.get(index as usize) {
            None => Err(ProtocolViolation::ImageIndexOutOfRange {
                index,
                count: self.image_count(),
            }),
            Some(SlotState::Available) => Err(ProtocolViolation::PresentNotAcquired { index }),
            Some(SlotState::Acquired) => Ok(()),
        }
    }

    pub(crate) fn mark_presented(&mut self, index: u32) {
        if let Some(slot) = self.slots.get_mut(index as usize) {
            *slot = SlotState::Available;
        }
    }

    /// Destroy the swapchain and everything created with it.
    pub fn destroy(&mut self) -> Result<()> {
        self.ensure_live()?;
        self.release();
        Ok(())
    }

    fn release(&mut self) {
        let driver = self.device.driver();
        unsafe {
            for &framebuffer in &self.framebuffers {
                driver.destroy_framebuffer(framebuffer);
            }
            if self.render_pass != vk::RenderPass::null() {
                driver.destroy_render_pass(self.render_pass);
            }
            for &view in &self.views {
                driver.destroy_image_view(view);
            }
            driver.destroy_swapchain(self.swapchain);
        }
        self.framebuffers.clear();
        self.views.clear();
        self.destroyed = true;
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        if !self.destroyed {
            self.release();
        }
    }
}

/// Select the surface format.
///
/// A surface reporting a single `UNDEFINED` format accepts anything, so the
/// preferred format is used. Otherwise the preferred format is used if
/// listed, else the first one.
pub fn select_surface_format(
    available: &[vk::SurfaceFormatKHR],
    preferred: vk::SurfaceFormatKHR,
) -> Option<vk::SurfaceFormatKHR> {
    match available {
        [] => None,
        [only] if only.format == vk::Format::UNDEFINED => Some(preferred),
        _ => available
            .iter()
            .find(|f| f.format == preferred.format && f.color_space == preferred.color_space)
            .or_else(|| available.first())
            .copied(),
    }
}

/// Select the best present mode.
pub fn select_present_mode(available: &[vk::PresentModeKHR], vsync: bool) -> vk::PresentModeKHR {
    if vsync {
        return vk::PresentModeKHR::FIFO;
    }
    [vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::IMMEDIATE]
        .into_iter()
        .find(|mode| available.contains(mode))
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

/// Calculate swapchain extent.
pub fn calculate_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    desired_width: u32,
    desired_height: u32,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        capabilities.current_extent
    } else {
        vk::Extent2D {
            width: desired_width.clamp(
                capabilities.min_image_extent.width,
                capabilities.max_image_extent.width,
            ),
            height: desired_height.clamp(
                capabilities.min_image_extent.height,
                capabilities.max_image_extent.height,
            ),
        }
    }
}

/// One more than the minimum, capped by the maximum when there is one.
pub fn select_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let count = capabilities.min_image_count + 1;
    if capabilities.max_image_count > 0 {
        count.min(capabilities.max_image_count)
    } else {
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::soft::SoftDriver;
    use crate::queue::{PresentOutcome, QueuePresentation};
    use crate::test_support::{pool_and_queue, soft_device};
    use std::sync::Arc;

    fn format(format: vk::Format) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }
    }

    #[test]
    fn undefined_surface_format_takes_preferred() {
        let preferred = format(vk::Format::B8G8R8A8_UNORM);
        let chosen = select_surface_format(&[format(vk::Format::UNDEFINED)], preferred);
        assert_eq!(chosen, Some(preferred));
    }

    #[test]
    fn falls_back_to_first_format() {
        let preferred = format(vk::Format::B8G8R8A8_UNORM);
        let available = [format(vk::Format::R8G8B8A8_SRGB), format(vk::Format::R16G16B16A16_SFLOAT)];
        assert_eq!(
            select_surface_format(&available, preferred),
            Some(available[0])
        );
        assert_eq!(select_surface_format(&[], preferred), None);
    }

    #[test]
    fn present_mode_preference() {
        let all = [
            vk::PresentModeKHR::FIFO,
            vk::PresentModeKHR::IMMEDIATE,
            vk::PresentModeKHR::MAILBOX,
        ];
        assert_eq!(select_present_mode(&all, false), vk::PresentModeKHR::MAILBOX);
        assert_eq!(select_present_mode(&all, true), vk::PresentModeKHR::FIFO);
        assert_eq!(
            select_present_mode(&[vk::PresentModeKHR::IMMEDIATE], false),
            vk::PresentModeKHR::IMMEDIATE
        );
        assert_eq!(select_present_mode(&[], false), vk::PresentModeKHR::FIFO);
    }

    #[test]
    fn image_count_is_clamped() {
        let mut caps = vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 0,
            ..Default::default()
        };
        assert_eq!(select_image_count(&caps), 3);
        caps.max_image_count = 2;
        assert_eq!(select_image_count(&caps), 2);
    }

    #[test]
    fn extent_follows_surface_when_fixed() {
        let caps = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: 640,
                height: 480,
            },
            ..Default::default()
        };
        let extent = calculate_extent(&caps, 10, 10);
        assert_eq!((extent.width, extent.height), (640, 480));

        let caps = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            },
            min_image_extent: vk::Extent2D {
                width: 1,
                height: 1,
            },
            max_image_extent: vk::Extent2D {
                width: 100,
                height: 100,
            },
            ..Default::default()
        };
        let extent = calculate_extent(&caps, 400, 50);
        assert_eq!((extent.width, extent.height), (100, 50));
    }

    fn violation(err: GpuError) -> ProtocolViolation {
        err.as_violation().cloned().expect("expected a protocol violation")
    }

    fn swapchain(driver: &Arc<SoftDriver>, device: &Device) -> (vk::SurfaceKHR, Swapchain) {
        let surface = driver.create_surface();
        let swapchain = Swapchain::create(device, &SwapchainDesc::new(surface, 64, 64)).unwrap();
        (surface, swapchain)
    }

    #[test]
    fn create_builds_per_image_objects() {
        let (driver, device) = soft_device();
        let (_, swapchain) = swapchain(&driver, &device);
        assert_eq!(swapchain.image_count(), 3);
        assert_eq!(swapchain.views().len(), 3);
        assert_eq!(swapchain.framebuffers().len(), 3);
        assert_eq!(swapchain.present_mode(), vk::PresentModeKHR::MAILBOX);
        assert_eq!(swapchain.extent(), vk::Extent2D { width: 64, height: 64 });
        assert_eq!(swapchain.acquired_count(), 0);
        drop(swapchain);
        assert_eq!(driver.live_resources(), 0);
    }

    #[test]
    fn acquire_hands_out_each_image_once() {
        let (driver, device) = soft_device();
        let (_, mut swapchain) = swapchain(&driver, &device);
        let fences: Vec<Fence> = (0..4).map(|_| Fence::create(&device, false).unwrap()).collect();
        let mut indices = Vec::new();
        for fence in &fences[..3] {
            match swapchain.acquire_next_image(0, None, Some(fence)).unwrap() {
                AcquireOutcome::Acquired { index, .. } => indices.push(index),
                other => panic!("unexpected {other:?}"),
            }
        }
        indices.sort_unstable();
        assert_eq!(indices, vec![0, 1, 2]);
        assert_eq!(swapchain.acquired_count(), 3);
        assert_eq!(
            swapchain.acquire_next_image(0, None, Some(&fences[3])).unwrap(),
            AcquireOutcome::NotReady
        );
        assert_eq!(
            swapchain.acquire_next_image(1_000, None, Some(&fences[3])).unwrap(),
            AcquireOutcome::TimedOut
        );
        assert!(fences[0].is_signalled().unwrap());
    }

    #[test]
    fn acquire_needs_free_sync_objects() {
        let (driver, device) = soft_device();
        let (_, mut swapchain) = swapchain(&driver, &device);
        let err = swapchain.acquire_next_image(0, None, None).unwrap_err();
        assert_eq!(violation(err), ProtocolViolation::AcquireWithoutSync);

        let semaphore = Semaphore::create(&device).unwrap();
        swapchain.acquire_next_image(0, Some(&semaphore), None).unwrap();
        let err = swapchain.acquire_next_image(0, Some(&semaphore), None).unwrap_err();
        assert_eq!(violation(err), ProtocolViolation::SemaphoreAlreadySignalled);
        assert_eq!(swapchain.acquired_count(), 1);
    }

    #[test]
    fn only_acquired_images_are_presented() {
        let (driver, device) = soft_device();
        let (_, queue) = pool_and_queue(&device, 0);
        let (_, mut swapchain) = swapchain(&driver, &device);
        let fence = Fence::create(&device, false).unwrap();

        let err = queue
            .present(QueuePresentation::new().swapchain(&mut swapchain, 0))
            .unwrap_err();
        assert_eq!(violation(err), ProtocolViolation::PresentNotAcquired { index: 0 });

        let AcquireOutcome::Acquired { index, .. } =
            swapchain.acquire_next_image(0, None, Some(&fence)).unwrap()
        else {
            panic!("no image acquired");
        };
        let report = queue
            .present(QueuePresentation::new().swapchain(&mut swapchain, index))
            .unwrap();
        assert_eq!(report.outcomes, vec![PresentOutcome::Presented]);
        assert_eq!(swapchain.slot_state(index), Some(SlotState::Available));

        let err = queue
            .present(QueuePresentation::new().swapchain(&mut swapchain, index))
            .unwrap_err();
        assert_eq!(violation(err), ProtocolViolation::PresentNotAcquired { index });
        let err = queue
            .present(QueuePresentation::new().swapchain(&mut swapchain, 7))
            .unwrap_err();
        assert_eq!(
            violation(err),
            ProtocolViolation::ImageIndexOutOfRange { index: 7, count: 3 }
        );
    }

    #[test]
    fn resize_makes_the_swapchain_stale() {
        let (driver, device) = soft_device();
        let (surface, mut swapchain) = swapchain(&driver, &device);
        let semaphore = Semaphore::create(&device).unwrap();
        driver.resize_surface(surface, 32, 16);
        assert_eq!(
            swapchain.acquire_next_image(0, Some(&semaphore), None).unwrap(),
            AcquireOutcome::OutOfDate
        );
        assert!(!semaphore.has_pending_signal());

        swapchain.recreate(&SwapchainDesc::new(surface, 32, 16)).unwrap();
        assert_eq!(swapchain.extent(), vk::Extent2D { width: 32, height: 16 });
        assert!(matches!(
            swapchain.acquire_next_image(0, Some(&semaphore), None).unwrap(),
            AcquireOutcome::Acquired { .. }
        ));
    }

    #[test]
    fn destroyed_swapchain_rejects_use() {
        let (driver, device) = soft_device();
        let (_, mut swapchain) = swapchain(&driver, &device);
        let semaphore = Semaphore::create(&device).unwrap();
        swapchain.destroy().unwrap();
        let err = swapchain
            .acquire_next_image(0, Some(&semaphore), None)
            .unwrap_err();
        assert_eq!(violation(err), ProtocolViolation::UseAfterDestroy { kind: "swapchain" });
    }
}
