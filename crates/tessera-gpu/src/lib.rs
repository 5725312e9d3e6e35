//! Resource, command and synchronization core over Vulkan.
//!
//! This crate provides:
//! - Device memory regions with explicit map/unmap
//! - Buffers and textures with bound memory, sharing modes and tracked layouts
//! - Command pools and recorders with a checked lifecycle
//! - Fences, semaphores and events with host-side bookkeeping
//! - Queue submission and presentation
//! - The swapchain acquire/present cycle and frames in flight
//!
//! Every object talks to the device through the [`Driver`] trait. The
//! [`backend::vulkan`] driver runs on real hardware, the [`backend::soft`]
//! driver is a deterministic software device for tests and headless tools.

pub mod backend;
pub mod buffer;
pub mod command;
pub mod deferred;
pub mod device;
pub mod driver;
pub mod error;
pub mod format;
pub mod frame;
pub mod memory;
pub mod physical;
pub mod queue;
pub mod sharing;
pub mod swapchain;
pub mod sync;
pub mod texture;

pub use backend::soft::{SoftDriver, SoftDriverConfig};
pub use backend::vulkan::{VulkanContext, VulkanContextBuilder, VulkanDriver};
pub use buffer::{Buffer, BufferDesc};
pub use command::{
    execute_single_time_commands, CommandPool, CommandRecorder, CommandRecorderArray,
    RecorderState,
};
pub use deferred::{DeferredDeletionQueue, Retired};
pub use device::{Device, DeviceConfig};
pub use driver::Driver;
pub use error::{GpuError, ProtocolViolation, Result, VkResultExt};
pub use frame::{FrameBegin, FrameSync, FrameSyncManager, FrameTarget};
pub use memory::DeviceMemory;
pub use physical::{GpuVendor, PhysicalDevice, QueueFamily};
pub use queue::{PresentOutcome, PresentReport, Queue, QueuePresentation, QueueSubmission};
pub use sharing::{Ownership, SharingMode};
pub use swapchain::{AcquireOutcome, SlotState, Swapchain, SwapchainDesc};
pub use sync::{wait_for_fences, Event, EventStatus, Fence, FenceState, FenceWait, Semaphore};
pub use texture::{BufferTextureCopy, Texture, TextureDesc};

#[cfg(test)]
pub(crate) mod test_support {
    use crate::backend::soft::{SoftDriver, SoftDriverConfig};
    use crate::command::CommandPool;
    use crate::device::{Device, DeviceConfig};
    use crate::queue::Queue;
    use ash::vk;
    use std::sync::Arc;

    /// Default software device with violations returned instead of raised.
    pub fn soft_device() -> (Arc<SoftDriver>, Device) {
        soft_device_with(SoftDriverConfig::default())
    }

    pub fn soft_device_with(config: SoftDriverConfig) -> (Arc<SoftDriver>, Device) {
        let driver = Arc::new(SoftDriver::new(config));
        let device = Device::new(driver.clone(), DeviceConfig::default().strict_protocol(false));
        (driver, device)
    }

    /// Resettable pool and the first queue of `family`.
    pub fn pool_and_queue(device: &Device, family: u32) -> (CommandPool, Queue) {
        let family = device.queue_family(family).unwrap();
        let pool = CommandPool::create(
            device,
            &family,
            vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
        )
        .unwrap();
        let queue = Queue::new(device, &family, 0).unwrap();
        (pool, queue)
    }
}
