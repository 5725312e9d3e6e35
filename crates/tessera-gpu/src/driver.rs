//! The seam between the resource core and a Vulkan implementation.
//!
//! Everything above this trait tracks host-side state (mapping, layouts,
//! ownership, recorder and synchronization lifecycles) and validates it.
//! Everything below it only executes calls. Two implementations exist:
//! [`VulkanDriver`](crate::backend::vulkan::VulkanDriver) forwards to `ash`,
//! [`SoftDriver`](crate::backend::soft::SoftDriver) runs a deterministic
//! software device used by the tests and by headless tooling.

use crate::physical::PhysicalDevice;
use ash::prelude::VkResult;
use ash::vk;
use std::ptr::NonNull;

/// Parameters for buffer creation.
#[derive(Debug, Clone, Copy)]
pub struct BufferInfo<'a> {
    pub size: u64,
    pub usage: vk::BufferUsageFlags,
    pub sharing_mode: vk::SharingMode,
    /// Family indices, only read for concurrent sharing.
    pub queue_families: &'a [u32],
}

/// Parameters for image creation.
#[derive(Debug, Clone, Copy)]
pub struct ImageInfo<'a> {
    pub image_type: vk::ImageType,
    pub extent: vk::Extent3D,
    pub format: vk::Format,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub tiling: vk::ImageTiling,
    pub usage: vk::ImageUsageFlags,
    pub flags: vk::ImageCreateFlags,
    pub sharing_mode: vk::SharingMode,
    pub queue_families: &'a [u32],
}

/// Parameters for image view creation.
#[derive(Debug, Clone, Copy)]
pub struct ViewInfo {
    pub image: vk::Image,
    pub view_type: vk::ImageViewType,
    pub format: vk::Format,
    pub range: vk::ImageSubresourceRange,
}

/// One batch of a queue submission.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubmitBatch<'a> {
    pub wait_semaphores: &'a [vk::Semaphore],
    pub wait_stages: &'a [vk::PipelineStageFlags],
    pub command_buffers: &'a [vk::CommandBuffer],
    pub signal_semaphores: &'a [vk::Semaphore],
}

/// One presentation request covering any number of swapchains.
#[derive(Debug, Clone, Copy)]
pub struct PresentBatch<'a> {
    pub wait_semaphores: &'a [vk::Semaphore],
    pub swapchains: &'a [vk::SwapchainKHR],
    pub image_indices: &'a [u32],
}

/// Parameters for swapchain creation.
#[derive(Debug, Clone, Copy)]
pub struct SwapchainInfo<'a> {
    pub surface: vk::SurfaceKHR,
    pub min_image_count: u32,
    pub format: vk::SurfaceFormatKHR,
    pub extent: vk::Extent2D,
    pub image_usage: vk::ImageUsageFlags,
    pub pre_transform: vk::SurfaceTransformFlagsKHR,
    pub present_mode: vk::PresentModeKHR,
    pub old_swapchain: vk::SwapchainKHR,
    pub queue_families: &'a [u32],
}

/// What a surface supports, as needed to pick swapchain parameters.
#[derive(Debug, Clone, Default)]
pub struct SurfaceSupport {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

/// Raw device operations.
///
/// Methods mirror the Vulkan entry points they stand for. Fence waits report
/// a timeout as `Ok(false)` instead of an error. Present reports one result
/// per swapchain and only fails as a whole for errors that are not tied to a
/// single swapchain.
///
/// # Safety
/// Every handle passed to a method must have been created by the same
/// driver and not yet destroyed, and must satisfy the external
/// synchronization rules of the matching Vulkan command.
#[allow(clippy::missing_safety_doc)]
pub trait Driver: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &str;

    /// The physical device this driver runs on.
    fn physical(&self) -> &PhysicalDevice;

    /// Format support on the physical device.
    fn format_properties(&self, format: vk::Format) -> vk::FormatProperties;

    // Memory

    unsafe fn allocate_memory(&self, size: u64, memory_type_index: u32)
        -> VkResult<vk::DeviceMemory>;
    unsafe fn free_memory(&self, memory: vk::DeviceMemory);
    unsafe fn map_memory(
        &self,
        memory: vk::DeviceMemory,
        offset: u64,
        size: u64,
    ) -> VkResult<NonNull<u8>>;
    unsafe fn unmap_memory(&self, memory: vk::DeviceMemory);
    unsafe fn flush_mapped_range(
        &self,
        memory: vk::DeviceMemory,
        offset: u64,
        size: u64,
    ) -> VkResult<()>;
    unsafe fn invalidate_mapped_range(
        &self,
        memory: vk::DeviceMemory,
        offset: u64,
        size: u64,
    ) -> VkResult<()>;

    // Buffers and images

    unsafe fn create_buffer(&self, info: &BufferInfo<'_>) -> VkResult<vk::Buffer>;
    unsafe fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements;
    unsafe fn bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: u64,
    ) -> VkResult<()>;
    unsafe fn destroy_buffer(&self, buffer: vk::Buffer);

    unsafe fn create_image(&self, info: &ImageInfo<'_>) -> VkResult<vk::Image>;
    unsafe fn image_memory_requirements(&self, image: vk::Image) -> vk::MemoryRequirements;
    unsafe fn bind_image_memory(
        &self,
        image: vk::Image,
        memory: vk::DeviceMemory,
        offset: u64,
    ) -> VkResult<()>;
    unsafe fn destroy_image(&self, image: vk::Image);
    unsafe fn create_image_view(&self, info: &ViewInfo) -> VkResult<vk::ImageView>;
    unsafe fn destroy_image_view(&self, view: vk::ImageView);

    // Command pools and command buffers

    unsafe fn create_command_pool(
        &self,
        family: u32,
        flags: vk::CommandPoolCreateFlags,
    ) -> VkResult<vk::CommandPool>;
    unsafe fn reset_command_pool(&self, pool: vk::CommandPool) -> VkResult<()>;
    unsafe fn destroy_command_pool(&self, pool: vk::CommandPool);
    unsafe fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        level: vk::CommandBufferLevel,
        count: u32,
    ) -> VkResult<Vec<vk::CommandBuffer>>;
    unsafe fn free_command_buffers(&self, pool: vk::CommandPool, buffers: &[vk::CommandBuffer]);
    unsafe fn begin_command_buffer(
        &self,
        cmd: vk::CommandBuffer,
        flags: vk::CommandBufferUsageFlags,
    ) -> VkResult<()>;
    unsafe fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> VkResult<()>;
    unsafe fn reset_command_buffer(&self, cmd: vk::CommandBuffer) -> VkResult<()>;

    // Recorded commands

    unsafe fn cmd_pipeline_barrier(
        &self,
        cmd: vk::CommandBuffer,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        buffer_barriers: &[vk::BufferMemoryBarrier<'_>],
        image_barriers: &[vk::ImageMemoryBarrier<'_>],
    );
    unsafe fn cmd_copy_buffer(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    );
    unsafe fn cmd_copy_buffer_to_image(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    );
    unsafe fn cmd_copy_image_to_buffer(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Buffer,
        regions: &[vk::BufferImageCopy],
    );
    #[allow(clippy::too_many_arguments)]
    unsafe fn cmd_blit_image(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::ImageBlit],
        filter: vk::Filter,
    );
    unsafe fn cmd_fill_buffer(
        &self,
        cmd: vk::CommandBuffer,
        buffer: vk::Buffer,
        offset: u64,
        size: u64,
        data: u32,
    );
    unsafe fn cmd_clear_color_image(
        &self,
        cmd: vk::CommandBuffer,
        image: vk::Image,
        layout: vk::ImageLayout,
        color: &vk::ClearColorValue,
        ranges: &[vk::ImageSubresourceRange],
    );
    unsafe fn cmd_bind_compute_pipeline(&self, cmd: vk::CommandBuffer, pipeline: vk::Pipeline);
    unsafe fn cmd_bind_compute_descriptor_sets(
        &self,
        cmd: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
    );
    unsafe fn cmd_push_constants(
        &self,
        cmd: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        stages: vk::ShaderStageFlags,
        offset: u32,
        data: &[u8],
    );
    unsafe fn cmd_dispatch(&self, cmd: vk::CommandBuffer, x: u32, y: u32, z: u32);
    unsafe fn cmd_set_event(
        &self,
        cmd: vk::CommandBuffer,
        event: vk::Event,
        stage: vk::PipelineStageFlags,
    );
    unsafe fn cmd_reset_event(
        &self,
        cmd: vk::CommandBuffer,
        event: vk::Event,
        stage: vk::PipelineStageFlags,
    );
    unsafe fn cmd_wait_events(
        &self,
        cmd: vk::CommandBuffer,
        events: &[vk::Event],
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
    );

    // Fences, semaphores and events

    unsafe fn create_fence(&self, signalled: bool) -> VkResult<vk::Fence>;
    unsafe fn destroy_fence(&self, fence: vk::Fence);
    unsafe fn fence_status(&self, fence: vk::Fence) -> VkResult<bool>;
    unsafe fn wait_for_fences(
        &self,
        fences: &[vk::Fence],
        wait_all: bool,
        timeout_ns: u64,
    ) -> VkResult<bool>;
    unsafe fn reset_fences(&self, fences: &[vk::Fence]) -> VkResult<()>;

    unsafe fn create_semaphore(&self) -> VkResult<vk::Semaphore>;
    unsafe fn destroy_semaphore(&self, semaphore: vk::Semaphore);

    unsafe fn create_event(&self) -> VkResult<vk::Event>;
    unsafe fn destroy_event(&self, event: vk::Event);
    unsafe fn event_status(&self, event: vk::Event) -> VkResult<bool>;
    unsafe fn set_event(&self, event: vk::Event) -> VkResult<()>;
    unsafe fn reset_event(&self, event: vk::Event) -> VkResult<()>;

    // Queues

    unsafe fn get_queue(&self, family: u32, index: u32) -> vk::Queue;
    unsafe fn queue_submit(
        &self,
        queue: vk::Queue,
        batches: &[SubmitBatch<'_>],
        fence: vk::Fence,
    ) -> VkResult<()>;
    unsafe fn queue_present(
        &self,
        queue: vk::Queue,
        present: &PresentBatch<'_>,
    ) -> VkResult<Vec<vk::Result>>;
    unsafe fn queue_wait_idle(&self, queue: vk::Queue) -> VkResult<()>;
    unsafe fn device_wait_idle(&self) -> VkResult<()>;

    // Presentation

    unsafe fn surface_support(&self, surface: vk::SurfaceKHR) -> VkResult<SurfaceSupport>;
    unsafe fn create_swapchain(&self, info: &SwapchainInfo<'_>) -> VkResult<vk::SwapchainKHR>;
    unsafe fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> VkResult<Vec<vk::Image>>;
    unsafe fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR);
    /// Returns the image index and whether the swapchain is suboptimal.
    unsafe fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        timeout_ns: u64,
        semaphore: vk::Semaphore,
        fence: vk::Fence,
    ) -> VkResult<(u32, bool)>;
    /// Single color attachment render pass ending in `PRESENT_SRC_KHR`.
    unsafe fn create_present_render_pass(&self, format: vk::Format) -> VkResult<vk::RenderPass>;
    unsafe fn destroy_render_pass(&self, render_pass: vk::RenderPass);
    unsafe fn create_framebuffer(
        &self,
        render_pass: vk::RenderPass,
        attachments: &[vk::ImageView],
        extent: vk::Extent2D,
    ) -> VkResult<vk::Framebuffer>;
    unsafe fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer);
}
