//! Deterministic software device.
//!
//! Device memory is host memory, recorded commands are executed on the host
//! and the presentation engine is emulated. Queues run lazily: submitted work
//! only executes when the host blocks on it (fence waits, queue or device
//! idle waits, acquires that need a presented image) or when a test retires
//! it explicitly with [`SoftDriver::retire_next`] / [`SoftDriver::retire_all`].
//! That makes hazards such as freeing memory still referenced by queued work
//! observable, and they are reported through [`SoftDriver::diagnostics`].

mod exec;
mod kernel;
mod state;

pub use kernel::{Kernel, KernelContext, KernelImage, SoftBinding, MAX_PUSH_CONSTANTS};

use crate::driver::{
    BufferInfo, Driver, ImageInfo, PresentBatch, SubmitBatch, SurfaceSupport, SwapchainInfo,
    ViewInfo,
};
use crate::format;
use crate::physical::{GpuVendor, PhysicalDevice, QueueFamily};
use ash::prelude::VkResult;
use ash::vk;
use ash::vk::Handle;
use hashbrown::HashSet;
use parking_lot::{Mutex, MutexGuard};
use state::{
    BufferBarrier, HostMemory, ImageBarrier, QueueOp, RecordState, SoftBuffer, SoftCommand,
    SoftCommandBuffer, SoftImage, SoftMemory, SoftPool, SoftQueue, SoftState, SoftSurface,
    SoftSwapchain,
};
use std::collections::VecDeque;
use std::ptr::NonNull;
use std::sync::Arc;

/// PCI-style vendor id reported by the software device.
pub const SOFT_VENDOR_ID: u32 = 0x10005;

/// One queue family of the software device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SoftQueueFamily {
    pub flags: vk::QueueFlags,
    pub queue_count: u32,
    pub supports_present: bool,
}

/// Software device configuration.
#[derive(Debug, Clone)]
pub struct SoftDriverConfig {
    pub name: String,
    /// Property flags and heap index per memory type.
    pub memory_types: Vec<(vk::MemoryPropertyFlags, u32)>,
    pub memory_heaps: Vec<vk::MemoryHeap>,
    pub queue_families: Vec<SoftQueueFamily>,
    /// Alignment reported in every memory requirement.
    pub alignment: u64,
    pub non_coherent_atom_size: u64,
    /// Extent of newly created surfaces.
    pub surface_extent: vk::Extent2D,
    pub min_image_count: u32,
    /// Zero means no limit.
    pub max_image_count: u32,
    pub surface_formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
    /// Formats reported without any feature.
    pub unsupported_formats: Vec<vk::Format>,
    /// Formats reported without linear filtering.
    pub unfilterable_formats: Vec<vk::Format>,
}

impl Default for SoftDriverConfig {
    fn default() -> Self {
        Self {
            name: "Tessera software device".to_string(),
            memory_types: vec![
                (vk::MemoryPropertyFlags::DEVICE_LOCAL, 0),
                (
                    vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
                    1,
                ),
                (
                    vk::MemoryPropertyFlags::HOST_VISIBLE
                        | vk::MemoryPropertyFlags::HOST_COHERENT
                        | vk::MemoryPropertyFlags::HOST_CACHED,
                    1,
                ),
            ],
            memory_heaps: vec![
                vk::MemoryHeap {
                    size: 1 << 30,
                    flags: vk::MemoryHeapFlags::DEVICE_LOCAL,
                },
                vk::MemoryHeap {
                    size: 256 << 20,
                    flags: vk::MemoryHeapFlags::empty(),
                },
            ],
            queue_families: vec![
                SoftQueueFamily {
                    flags: vk::QueueFlags::GRAPHICS
                        | vk::QueueFlags::COMPUTE
                        | vk::QueueFlags::TRANSFER,
                    queue_count: 1,
                    supports_present: true,
                },
                SoftQueueFamily {
                    flags: vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
                    queue_count: 2,
                    supports_present: false,
                },
                SoftQueueFamily {
                    flags: vk::QueueFlags::TRANSFER,
                    queue_count: 1,
                    supports_present: false,
                },
            ],
            alignment: 256,
            non_coherent_atom_size: 64,
            surface_extent: vk::Extent2D {
                width: 64,
                height: 64,
            },
            min_image_count: 2,
            max_image_count: 8,
            surface_formats: vec![
                vk::SurfaceFormatKHR {
                    format: vk::Format::B8G8R8A8_UNORM,
                    color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
                },
                vk::SurfaceFormatKHR {
                    format: vk::Format::R8G8B8A8_UNORM,
                    color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
                },
            ],
            present_modes: vec![vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX],
            unsupported_formats: Vec::new(),
            unfilterable_formats: Vec::new(),
        }
    }
}

impl SoftDriverConfig {
    pub fn queue_families(mut self, families: Vec<SoftQueueFamily>) -> Self {
        self.queue_families = families;
        self
    }

    pub fn heap_size(mut self, heap: usize, size: u64) -> Self {
        if let Some(heap) = self.memory_heaps.get_mut(heap) {
            heap.size = size;
        }
        self
    }

    pub fn surface_extent(mut self, width: u32, height: u32) -> Self {
        self.surface_extent = vk::Extent2D { width, height };
        self
    }

    pub fn image_count(mut self, min: u32, max: u32) -> Self {
        self.min_image_count = min;
        self.max_image_count = max;
        self
    }

    pub fn unsupported_format(mut self, format: vk::Format) -> Self {
        self.unsupported_formats.push(format);
        self
    }

    pub fn unfilterable_format(mut self, format: vk::Format) -> Self {
        self.unfilterable_formats.push(format);
        self
    }
}

/// Driver calls that can be made to fail once with
/// [`SoftDriver::inject_failure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SoftCall {
    AllocateMemory,
    MapMemory,
    CreateBuffer,
    BindBufferMemory,
    CreateImage,
    BindImageMemory,
    CreateImageView,
    QueueSubmit,
    QueuePresent,
    WaitForFences,
    CreateSwapchain,
    AcquireNextImage,
}

/// An operation executed by a software queue, in execution order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceEvent {
    Submit {
        family: u32,
        command_buffers: usize,
    },
    ImageBarrier {
        image: vk::Image,
        base_mip_level: u32,
        level_count: u32,
        base_array_layer: u32,
        layer_count: u32,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
        src_family: u32,
        dst_family: u32,
    },
    BufferBarrier {
        buffer: vk::Buffer,
        src_family: u32,
        dst_family: u32,
    },
    CopyBuffer {
        src: vk::Buffer,
        dst: vk::Buffer,
        bytes: u64,
    },
    CopyBufferToImage {
        buffer: vk::Buffer,
        image: vk::Image,
        mip_level: u32,
    },
    CopyImageToBuffer {
        image: vk::Image,
        buffer: vk::Buffer,
        mip_level: u32,
    },
    Blit {
        src: vk::Image,
        src_level: u32,
        dst: vk::Image,
        dst_level: u32,
        layer_count: u32,
    },
    Fill {
        buffer: vk::Buffer,
        size: u64,
    },
    Clear {
        image: vk::Image,
        base_mip_level: u32,
        level_count: u32,
    },
    Dispatch {
        pipeline: vk::Pipeline,
        groups: [u32; 3],
    },
    SetEvent(vk::Event),
    ResetEvent(vk::Event),
    SignalFence(vk::Fence),
    Present {
        swapchain: vk::SwapchainKHR,
        image_index: u32,
    },
}

/// Misuse the software device detected. Nothing here stops execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Diagnostic {
    /// A command or barrier found a subresource in another layout than the
    /// one it declared.
    LayoutMismatch {
        image: vk::Image,
        mip_level: u32,
        array_layer: u32,
        expected: vk::ImageLayout,
        actual: vk::ImageLayout,
    },
    UseOfDestroyedObject {
        kind: &'static str,
        handle: u64,
    },
    /// An object was destroyed while queued work still referenced it.
    DestroyedWhileInUse {
        kind: &'static str,
        handle: u64,
    },
    MemoryFreedWhileInUse {
        memory: vk::DeviceMemory,
    },
    RecordingNotActive {
        command_buffer: vk::CommandBuffer,
    },
    CommandBufferNotExecutable {
        command_buffer: vk::CommandBuffer,
    },
    QueueFamilyMismatch {
        command_buffer: vk::CommandBuffer,
        pool_family: u32,
        queue_family: u32,
    },
    SemaphoreDoubleSignal {
        semaphore: vk::Semaphore,
    },
    WaitOnUnsetEvent {
        event: vk::Event,
    },
    MissingKernel {
        pipeline: vk::Pipeline,
    },
    /// A blocking wait found queued work that can never run.
    QueueStalled {
        family: u32,
    },
    OutOfBounds {
        what: &'static str,
    },
    Unsupported {
        what: &'static str,
    },
}

/// The software driver.
pub struct SoftDriver {
    physical: PhysicalDevice,
    config: SoftDriverConfig,
    state: Mutex<SoftState>,
}

impl std::fmt::Debug for SoftDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoftDriver")
            .field("device", &self.physical.name)
            .field("pending", &self.pending_operations())
            .finish()
    }
}

impl Default for SoftDriver {
    fn default() -> Self {
        Self::new(SoftDriverConfig::default())
    }
}

impl SoftDriver {
    pub fn new(config: SoftDriverConfig) -> Self {
        let mut memory = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: config.memory_types.len() as u32,
            memory_heap_count: config.memory_heaps.len() as u32,
            ..Default::default()
        };
        for (slot, (property_flags, heap_index)) in
            memory.memory_types.iter_mut().zip(&config.memory_types)
        {
            *slot = vk::MemoryType {
                property_flags: *property_flags,
                heap_index: *heap_index,
            };
        }
        for (slot, heap) in memory.memory_heaps.iter_mut().zip(&config.memory_heaps) {
            *slot = *heap;
        }
        let queue_families = config
            .queue_families
            .iter()
            .enumerate()
            .map(|(index, family)| QueueFamily {
                index: index as u32,
                flags: family.flags,
                queue_count: family.queue_count,
                supports_present: family.supports_present,
            })
            .collect::<Vec<_>>();

        let physical = PhysicalDevice {
            name: config.name.clone(),
            vendor: GpuVendor::from_vendor_id(SOFT_VENDOR_ID),
            device_type: vk::PhysicalDeviceType::CPU,
            api_version: vk::API_VERSION_1_3,
            memory,
            queue_families: queue_families.clone(),
            non_coherent_atom_size: config.non_coherent_atom_size,
        };

        let mut state = SoftState {
            heap_usage: vec![0; config.memory_heaps.len()],
            ..Default::default()
        };
        for family in &queue_families {
            for index in 0..family.queue_count {
                let queue = state.handle::<vk::Queue>();
                state.queues.insert(
                    queue,
                    SoftQueue {
                        family: family.index,
                        index,
                        ops: VecDeque::new(),
                    },
                );
                state.queue_order.push(queue);
            }
        }

        Self {
            physical,
            config,
            state: Mutex::new(state),
        }
    }

    /// Convenience for `Arc<SoftDriver>` with the default configuration.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn config(&self) -> &SoftDriverConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, SoftState> {
        self.state.lock()
    }

    /// Lock the state, failing once the device is lost.
    fn alive(&self) -> VkResult<MutexGuard<'_, SoftState>> {
        let state = self.state.lock();
        if state.lost {
            return Err(vk::Result::ERROR_DEVICE_LOST);
        }
        Ok(state)
    }

    /// Lock the state, failing with an injected result for `call` or once
    /// the device is lost.
    fn enter(&self, call: SoftCall) -> VkResult<MutexGuard<'_, SoftState>> {
        let mut state = self.alive()?;
        match state.injected(call) {
            Some(result) => Err(result),
            None => Ok(state),
        }
    }

    /// Register a kernel, returning the pipeline handle that binds it.
    pub fn create_kernel(
        &self,
        kernel: impl Fn(&mut KernelContext<'_>) + Send + Sync + 'static,
    ) -> vk::Pipeline {
        let mut state = self.lock();
        let pipeline = state.handle();
        state.kernels.insert(pipeline, Arc::new(kernel));
        pipeline
    }

    pub fn destroy_kernel(&self, pipeline: vk::Pipeline) {
        self.lock().kernels.remove(&pipeline);
    }

    /// Create a descriptor set for software kernels.
    pub fn create_descriptor_set(&self, bindings: &[SoftBinding]) -> vk::DescriptorSet {
        let mut state = self.lock();
        let set = state.handle();
        state.descriptor_sets.insert(set, bindings.to_vec());
        set
    }

    /// Create a surface with the configured extent.
    pub fn create_surface(&self) -> vk::SurfaceKHR {
        let mut state = self.lock();
        let surface = state.handle();
        state.surfaces.insert(
            surface,
            SoftSurface {
                extent: self.config.surface_extent,
            },
        );
        surface
    }

    /// Resize a surface. Swapchains with another extent become out of date.
    pub fn resize_surface(&self, surface: vk::SurfaceKHR, width: u32, height: u32) {
        if let Some(surface) = self.lock().surfaces.get_mut(&surface) {
            surface.extent = vk::Extent2D { width, height };
        }
    }

    /// Execute the next runnable queue operation. Returns false if none can
    /// run.
    pub fn retire_next(&self) -> bool {
        self.lock().step()
    }

    /// Execute every runnable queue operation.
    pub fn retire_all(&self) {
        self.lock().drain();
    }

    /// Queue operations submitted but not yet executed.
    pub fn pending_operations(&self) -> usize {
        self.lock().pending_operations()
    }

    /// Operations executed so far.
    pub fn trace(&self) -> Vec<TraceEvent> {
        self.lock().trace.clone()
    }

    pub fn clear_trace(&self) {
        self.lock().trace.clear();
    }

    /// Misuse detected so far.
    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        self.lock().diagnostics.clone()
    }

    pub fn take_diagnostics(&self) -> Vec<Diagnostic> {
        std::mem::take(&mut self.lock().diagnostics)
    }

    /// Actual layout of every subresource, indexed by
    /// `level * layers + layer`.
    pub fn image_layouts(&self, image: vk::Image) -> Option<Vec<vk::ImageLayout>> {
        self.lock().images.get(&image).map(|i| i.layouts.clone())
    }

    /// Tightly packed contents of one subresource.
    pub fn read_image(&self, image: vk::Image, level: u32, layer: u32) -> Option<Vec<u8>> {
        let state = self.lock();
        let extent = state.images.get(&image)?.level_extent(level);
        state.read_texels(
            image,
            level,
            layer,
            [0, 0, 0],
            [extent.width, extent.height, extent.depth],
        )
    }

    /// Number of live device memory objects.
    pub fn live_allocations(&self) -> usize {
        self.lock().memories.len()
    }

    /// Number of live buffers and images, swapchain images included.
    pub fn live_resources(&self) -> usize {
        let state = self.lock();
        state.buffers.len() + state.images.len()
    }

    /// Number of allocated command buffers across every pool.
    pub fn live_command_buffers(&self) -> usize {
        self.lock().command_buffers.len()
    }

    /// Bytes allocated from `heap`.
    pub fn heap_usage(&self, heap: usize) -> u64 {
        self.lock().heap_usage.get(heap).copied().unwrap_or(0)
    }

    /// Make every later call fail with `ERROR_DEVICE_LOST`.
    pub fn lose_device(&self) {
        tracing::warn!("soft device lost");
        self.lock().lost = true;
    }

    /// Make the next `call` fail with `result`.
    pub fn inject_failure(&self, call: SoftCall, result: vk::Result) {
        self.lock().failures.insert(call, result);
    }

    fn family_flags(&self, family: u32) -> vk::QueueFlags {
        self.physical
            .queue_family(family)
            .map_or(vk::QueueFlags::empty(), |f| f.flags)
    }

    fn memory_type_bits(&self, filter: impl Fn(vk::MemoryPropertyFlags) -> bool) -> u32 {
        self.physical
            .memory_types()
            .iter()
            .enumerate()
            .filter(|(_, t)| filter(t.property_flags))
            .fold(0, |bits, (index, _)| bits | (1 << index))
    }

    fn requirements(&self, size: u64, memory_type_bits: u32) -> vk::MemoryRequirements {
        let alignment = self.config.alignment.max(1);
        vk::MemoryRequirements {
            size: size.div_ceil(alignment) * alignment,
            alignment,
            memory_type_bits,
        }
    }

    /// Append a command to a recording command buffer.
    fn record(&self, cmd: vk::CommandBuffer, command: SoftCommand) {
        let mut state = self.lock();
        let recording = state
            .command_buffers
            .get(&cmd)
            .filter(|b| b.state == RecordState::Recording)
            .map(|b| b.family);
        let Some(family) = recording else {
            state.diagnose(Diagnostic::RecordingNotActive {
                command_buffer: cmd,
            });
            return;
        };
        let flags = self.family_flags(family);
        let supported = match &command {
            SoftCommand::BindPipeline(_)
            | SoftCommand::BindDescriptorSets { .. }
            | SoftCommand::Dispatch(_) => flags.contains(vk::QueueFlags::COMPUTE),
            SoftCommand::Blit { .. } => flags.contains(vk::QueueFlags::GRAPHICS),
            SoftCommand::Clear { .. } => {
                flags.intersects(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
            }
            _ => true,
        };
        if !supported {
            state.diagnose(Diagnostic::Unsupported {
                what: "command on a queue family without the needed capability",
            });
        }
        if let Some(buffer) = state.command_buffers.get_mut(&cmd) {
            buffer.commands.push(command);
        }
    }

    fn destroy_checked<H: Handle + Copy>(&self, state: &mut SoftState, kind: &'static str, handle: H) {
        let raw = handle.as_raw();
        if state.in_use(raw) {
            state.diagnose(Diagnostic::DestroyedWhileInUse { kind, handle: raw });
        }
    }
}

impl Driver for SoftDriver {
    fn name(&self) -> &str {
        "soft"
    }

    fn physical(&self) -> &PhysicalDevice {
        &self.physical
    }

    fn format_properties(&self, format: vk::Format) -> vk::FormatProperties {
        if format::texel_size(format).is_none() || self.config.unsupported_formats.contains(&format)
        {
            return vk::FormatProperties::default();
        }
        let mut features = vk::FormatFeatureFlags::SAMPLED_IMAGE
            | vk::FormatFeatureFlags::BLIT_SRC
            | vk::FormatFeatureFlags::TRANSFER_SRC
            | vk::FormatFeatureFlags::TRANSFER_DST;
        if format::has_depth(format) || format::has_stencil(format) {
            features |= vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT;
        } else {
            features |= vk::FormatFeatureFlags::COLOR_ATTACHMENT
                | vk::FormatFeatureFlags::STORAGE_IMAGE
                | vk::FormatFeatureFlags::BLIT_DST;
            if !self.config.unfilterable_formats.contains(&format) {
                features |= vk::FormatFeatureFlags::SAMPLED_IMAGE_FILTER_LINEAR;
            }
        }
        vk::FormatProperties {
            linear_tiling_features: features,
            optimal_tiling_features: features,
            buffer_features: vk::FormatFeatureFlags::STORAGE_TEXEL_BUFFER,
        }
    }

    unsafe fn allocate_memory(
        &self,
        size: u64,
        memory_type_index: u32,
    ) -> VkResult<vk::DeviceMemory> {
        let mut state = self.enter(SoftCall::AllocateMemory)?;
        let memory_type = *self
            .physical
            .memory_types()
            .get(memory_type_index as usize)
            .ok_or(vk::Result::ERROR_UNKNOWN)?;
        let heap = memory_type.heap_index as usize;
        let capacity = self.physical.memory_heaps()[heap].size;
        let used = state.heap_usage[heap];
        if size == 0 || used.saturating_add(size) > capacity {
            return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        }
        let len = usize::try_from(size).map_err(|_| vk::Result::ERROR_OUT_OF_HOST_MEMORY)?;
        state.heap_usage[heap] += size;
        let memory = state.handle();
        state.memories.insert(
            memory,
            SoftMemory {
                storage: HostMemory::zeroed(len),
                type_index: memory_type_index,
                heap_index: memory_type.heap_index,
                host_visible: memory_type
                    .property_flags
                    .contains(vk::MemoryPropertyFlags::HOST_VISIBLE),
                mapped: false,
            },
        );
        tracing::trace!(size, memory_type_index, "soft allocation");
        Ok(memory)
    }

    unsafe fn free_memory(&self, memory: vk::DeviceMemory) {
        let mut state = self.lock();
        if state.memory_in_use(memory) {
            state.diagnose(Diagnostic::MemoryFreedWhileInUse { memory });
        }
        match state.memories.remove(&memory) {
            Some(freed) => {
                let heap = freed.heap_index as usize;
                state.heap_usage[heap] -= freed.storage.len() as u64;
                tracing::trace!(type_index = freed.type_index, "soft free");
            }
            None => state.diagnose(Diagnostic::UseOfDestroyedObject {
                kind: "memory",
                handle: memory.as_raw(),
            }),
        }
    }

    unsafe fn map_memory(
        &self,
        memory: vk::DeviceMemory,
        offset: u64,
        size: u64,
    ) -> VkResult<NonNull<u8>> {
        let mut state = self.enter(SoftCall::MapMemory)?;
        let region = state
            .memories
            .get_mut(&memory)
            .ok_or(vk::Result::ERROR_MEMORY_MAP_FAILED)?;
        let len = region.storage.len() as u64;
        let size = if size == vk::WHOLE_SIZE {
            len.saturating_sub(offset)
        } else {
            size
        };
        if !region.host_visible || region.mapped || offset.saturating_add(size) > len {
            return Err(vk::Result::ERROR_MEMORY_MAP_FAILED);
        }
        let ptr = region
            .storage
            .ptr_at(offset as usize)
            .ok_or(vk::Result::ERROR_MEMORY_MAP_FAILED)?;
        region.mapped = true;
        Ok(ptr)
    }

    unsafe fn unmap_memory(&self, memory: vk::DeviceMemory) {
        if let Some(region) = self.lock().memories.get_mut(&memory) {
            region.mapped = false;
        }
    }

    unsafe fn flush_mapped_range(
        &self,
        memory: vk::DeviceMemory,
        _offset: u64,
        _size: u64,
    ) -> VkResult<()> {
        let state = self.alive()?;
        match state.memories.get(&memory) {
            Some(region) if region.mapped => Ok(()),
            _ => Err(vk::Result::ERROR_MEMORY_MAP_FAILED),
        }
    }

    unsafe fn invalidate_mapped_range(
        &self,
        memory: vk::DeviceMemory,
        offset: u64,
        size: u64,
    ) -> VkResult<()> {
        // Host memory is the device memory, so both directions are no-ops.
        unsafe { self.flush_mapped_range(memory, offset, size) }
    }

    unsafe fn create_buffer(&self, info: &BufferInfo<'_>) -> VkResult<vk::Buffer> {
        let mut state = self.enter(SoftCall::CreateBuffer)?;
        if info.size == 0 {
            return Err(vk::Result::ERROR_UNKNOWN);
        }
        let buffer = state.handle();
        state.buffers.insert(
            buffer,
            SoftBuffer {
                size: info.size,
                binding: None,
            },
        );
        Ok(buffer)
    }

    unsafe fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements {
        let size = self.lock().buffers.get(&buffer).map_or(0, |b| b.size);
        self.requirements(size, self.memory_type_bits(|_| true))
    }

    unsafe fn bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: u64,
    ) -> VkResult<()> {
        let mut state = self.enter(SoftCall::BindBufferMemory)?;
        let available = state
            .memories
            .get(&memory)
            .map(|m| m.storage.len() as u64)
            .ok_or(vk::Result::ERROR_UNKNOWN)?;
        let target = state
            .buffers
            .get_mut(&buffer)
            .ok_or(vk::Result::ERROR_UNKNOWN)?;
        if target.binding.is_some() || offset.saturating_add(target.size) > available {
            return Err(vk::Result::ERROR_UNKNOWN);
        }
        target.binding = Some((memory, offset));
        Ok(())
    }

    unsafe fn destroy_buffer(&self, buffer: vk::Buffer) {
        let mut state = self.lock();
        self.destroy_checked(&mut state, "buffer", buffer);
        if state.buffers.remove(&buffer).is_none() {
            state.diagnose(Diagnostic::UseOfDestroyedObject {
                kind: "buffer",
                handle: buffer.as_raw(),
            });
        }
    }

    unsafe fn create_image(&self, info: &ImageInfo<'_>) -> VkResult<vk::Image> {
        let mut state = self.enter(SoftCall::CreateImage)?;
        let texel_size = format::texel_size(info.format)
            .filter(|_| !self.config.unsupported_formats.contains(&info.format))
            .ok_or(vk::Result::ERROR_FORMAT_NOT_SUPPORTED)?;
        if info.mip_levels == 0 || info.array_layers == 0 {
            return Err(vk::Result::ERROR_UNKNOWN);
        }
        let image = state.handle();
        state.images.insert(
            image,
            SoftImage {
                format: info.format,
                extent: info.extent,
                mip_levels: info.mip_levels,
                layers: info.array_layers,
                texel_size,
                tiling: info.tiling,
                binding: None,
                layouts: vec![
                    vk::ImageLayout::UNDEFINED;
                    (info.mip_levels * info.array_layers) as usize
                ],
            },
        );
        Ok(image)
    }

    unsafe fn image_memory_requirements(&self, image: vk::Image) -> vk::MemoryRequirements {
        let (size, tiling) = self
            .lock()
            .images
            .get(&image)
            .map_or((0, vk::ImageTiling::OPTIMAL), |i| (i.total_size(), i.tiling));
        let bits = if tiling == vk::ImageTiling::LINEAR {
            self.memory_type_bits(|_| true)
        } else {
            match self.memory_type_bits(|f| f.contains(vk::MemoryPropertyFlags::DEVICE_LOCAL)) {
                0 => self.memory_type_bits(|_| true),
                bits => bits,
            }
        };
        self.requirements(size, bits)
    }

    unsafe fn bind_image_memory(
        &self,
        image: vk::Image,
        memory: vk::DeviceMemory,
        offset: u64,
    ) -> VkResult<()> {
        let mut state = self.enter(SoftCall::BindImageMemory)?;
        let available = state
            .memories
            .get(&memory)
            .map(|m| m.storage.len() as u64)
            .ok_or(vk::Result::ERROR_UNKNOWN)?;
        let target = state
            .images
            .get_mut(&image)
            .ok_or(vk::Result::ERROR_UNKNOWN)?;
        if target.binding.is_some() || offset.saturating_add(target.total_size()) > available {
            return Err(vk::Result::ERROR_UNKNOWN);
        }
        target.binding = Some((memory, offset));
        Ok(())
    }

    unsafe fn destroy_image(&self, image: vk::Image) {
        let mut state = self.lock();
        self.destroy_checked(&mut state, "image", image);
        state.image_storage.remove(&image);
        if state.images.remove(&image).is_none() {
            state.diagnose(Diagnostic::UseOfDestroyedObject {
                kind: "image",
                handle: image.as_raw(),
            });
        }
    }

    unsafe fn create_image_view(&self, info: &ViewInfo) -> VkResult<vk::ImageView> {
        let mut state = self.enter(SoftCall::CreateImageView)?;
        if !state.images.contains_key(&info.image) {
            return Err(vk::Result::ERROR_UNKNOWN);
        }
        let view = state.handle();
        state.views.insert(view, info.image);
        Ok(view)
    }

    unsafe fn destroy_image_view(&self, view: vk::ImageView) {
        self.lock().views.remove(&view);
    }

    unsafe fn create_command_pool(
        &self,
        family: u32,
        _flags: vk::CommandPoolCreateFlags,
    ) -> VkResult<vk::CommandPool> {
        let mut state = self.alive()?;
        if self.physical.queue_family(family).is_none() {
            return Err(vk::Result::ERROR_INITIALIZATION_FAILED);
        }
        let pool = state.handle();
        state.pools.insert(
            pool,
            SoftPool {
                family,
                buffers: HashSet::new(),
            },
        );
        Ok(pool)
    }

    unsafe fn reset_command_pool(&self, pool: vk::CommandPool) -> VkResult<()> {
        let mut state = self.alive()?;
        let buffers: Vec<vk::CommandBuffer> = state
            .pools
            .get(&pool)
            .ok_or(vk::Result::ERROR_UNKNOWN)?
            .buffers
            .iter()
            .copied()
            .collect();
        for buffer in buffers {
            if let Some(cmd) = state.command_buffers.get_mut(&buffer) {
                cmd.state = RecordState::Initial;
                cmd.commands.clear();
            }
        }
        Ok(())
    }

    unsafe fn destroy_command_pool(&self, pool: vk::CommandPool) {
        let mut state = self.lock();
        let Some(removed) = state.pools.remove(&pool) else {
            return;
        };
        for buffer in removed.buffers {
            self.destroy_checked(&mut state, "command buffer", buffer);
            state.command_buffers.remove(&buffer);
        }
    }

    unsafe fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        _level: vk::CommandBufferLevel,
        count: u32,
    ) -> VkResult<Vec<vk::CommandBuffer>> {
        let mut state = self.alive()?;
        let family = state
            .pools
            .get(&pool)
            .map(|p| p.family)
            .ok_or(vk::Result::ERROR_UNKNOWN)?;
        let mut buffers = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let buffer = state.handle();
            state.command_buffers.insert(
                buffer,
                SoftCommandBuffer {
                    pool,
                    family,
                    state: RecordState::Initial,
                    commands: Vec::new(),
                },
            );
            buffers.push(buffer);
        }
        if let Some(p) = state.pools.get_mut(&pool) {
            p.buffers.extend(buffers.iter().copied());
        }
        Ok(buffers)
    }

    unsafe fn free_command_buffers(&self, pool: vk::CommandPool, buffers: &[vk::CommandBuffer]) {
        let mut state = self.lock();
        for buffer in buffers {
            self.destroy_checked(&mut state, "command buffer", *buffer);
            match state.command_buffers.remove(buffer) {
                Some(freed) if freed.pool == pool => {}
                _ => state.diagnose(Diagnostic::UseOfDestroyedObject {
                    kind: "command buffer",
                    handle: buffer.as_raw(),
                }),
            }
            if let Some(p) = state.pools.get_mut(&pool) {
                p.buffers.remove(buffer);
            }
        }
    }

    unsafe fn begin_command_buffer(
        &self,
        cmd: vk::CommandBuffer,
        _flags: vk::CommandBufferUsageFlags,
    ) -> VkResult<()> {
        let mut state = self.alive()?;
        let buffer = state
            .command_buffers
            .get_mut(&cmd)
            .ok_or(vk::Result::ERROR_UNKNOWN)?;
        buffer.state = RecordState::Recording;
        buffer.commands.clear();
        Ok(())
    }

    unsafe fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> VkResult<()> {
        let mut state = self.alive()?;
        if let Some(buffer) = state
            .command_buffers
            .get_mut(&cmd)
            .filter(|b| b.state == RecordState::Recording)
        {
            buffer.state = RecordState::Executable;
            return Ok(());
        }
        state.diagnose(Diagnostic::RecordingNotActive {
            command_buffer: cmd,
        });
        Err(vk::Result::ERROR_UNKNOWN)
    }

    unsafe fn reset_command_buffer(&self, cmd: vk::CommandBuffer) -> VkResult<()> {
        let mut state = self.alive()?;
        let buffer = state
            .command_buffers
            .get_mut(&cmd)
            .ok_or(vk::Result::ERROR_UNKNOWN)?;
        buffer.state = RecordState::Initial;
        buffer.commands.clear();
        Ok(())
    }

    unsafe fn cmd_pipeline_barrier(
        &self,
        cmd: vk::CommandBuffer,
        _src_stage: vk::PipelineStageFlags,
        _dst_stage: vk::PipelineStageFlags,
        buffer_barriers: &[vk::BufferMemoryBarrier<'_>],
        image_barriers: &[vk::ImageMemoryBarrier<'_>],
    ) {
        let buffers = buffer_barriers
            .iter()
            .map(|b| BufferBarrier {
                buffer: b.buffer,
                src_family: b.src_queue_family_index,
                dst_family: b.dst_queue_family_index,
            })
            .collect();
        let images = image_barriers
            .iter()
            .map(|b| ImageBarrier {
                image: b.image,
                old_layout: b.old_layout,
                new_layout: b.new_layout,
                range: b.subresource_range,
                src_family: b.src_queue_family_index,
                dst_family: b.dst_queue_family_index,
            })
            .collect();
        self.record(cmd, SoftCommand::Barrier { buffers, images });
    }

    unsafe fn cmd_copy_buffer(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    ) {
        self.record(
            cmd,
            SoftCommand::CopyBuffer {
                src,
                dst,
                regions: regions.to_vec(),
            },
        );
    }

    unsafe fn cmd_copy_buffer_to_image(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    ) {
        self.record(
            cmd,
            SoftCommand::CopyBufferToImage {
                src,
                dst,
                layout: dst_layout,
                regions: regions.to_vec(),
            },
        );
    }

    unsafe fn cmd_copy_image_to_buffer(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Buffer,
        regions: &[vk::BufferImageCopy],
    ) {
        self.record(
            cmd,
            SoftCommand::CopyImageToBuffer {
                src,
                layout: src_layout,
                dst,
                regions: regions.to_vec(),
            },
        );
    }

    unsafe fn cmd_blit_image(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::ImageBlit],
        _filter: vk::Filter,
    ) {
        self.record(
            cmd,
            SoftCommand::Blit {
                src,
                src_layout,
                dst,
                dst_layout,
                regions: regions.to_vec(),
            },
        );
    }

    unsafe fn cmd_fill_buffer(
        &self,
        cmd: vk::CommandBuffer,
        buffer: vk::Buffer,
        offset: u64,
        size: u64,
        data: u32,
    ) {
        self.record(
            cmd,
            SoftCommand::Fill {
                buffer,
                offset,
                size,
                data,
            },
        );
    }

    unsafe fn cmd_clear_color_image(
        &self,
        cmd: vk::CommandBuffer,
        image: vk::Image,
        layout: vk::ImageLayout,
        color: &vk::ClearColorValue,
        ranges: &[vk::ImageSubresourceRange],
    ) {
        // All members of the union are four 32-bit values.
        let color = unsafe { color.uint32 };
        self.record(
            cmd,
            SoftCommand::Clear {
                image,
                layout,
                color,
                ranges: ranges.to_vec(),
            },
        );
    }

    unsafe fn cmd_bind_compute_pipeline(&self, cmd: vk::CommandBuffer, pipeline: vk::Pipeline) {
        self.record(cmd, SoftCommand::BindPipeline(pipeline));
    }

    unsafe fn cmd_bind_compute_descriptor_sets(
        &self,
        cmd: vk::CommandBuffer,
        _layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
    ) {
        self.record(
            cmd,
            SoftCommand::BindDescriptorSets {
                first_set,
                sets: sets.to_vec(),
            },
        );
    }

    unsafe fn cmd_push_constants(
        &self,
        cmd: vk::CommandBuffer,
        _layout: vk::PipelineLayout,
        _stages: vk::ShaderStageFlags,
        offset: u32,
        data: &[u8],
    ) {
        self.record(
            cmd,
            SoftCommand::PushConstants {
                offset,
                data: data.to_vec(),
            },
        );
    }

    unsafe fn cmd_dispatch(&self, cmd: vk::CommandBuffer, x: u32, y: u32, z: u32) {
        self.record(cmd, SoftCommand::Dispatch([x, y, z]));
    }

    unsafe fn cmd_set_event(
        &self,
        cmd: vk::CommandBuffer,
        event: vk::Event,
        _stage: vk::PipelineStageFlags,
    ) {
        self.record(cmd, SoftCommand::SetEvent(event));
    }

    unsafe fn cmd_reset_event(
        &self,
        cmd: vk::CommandBuffer,
        event: vk::Event,
        _stage: vk::PipelineStageFlags,
    ) {
        self.record(cmd, SoftCommand::ResetEvent(event));
    }

    unsafe fn cmd_wait_events(
        &self,
        cmd: vk::CommandBuffer,
        events: &[vk::Event],
        _src_stage: vk::PipelineStageFlags,
        _dst_stage: vk::PipelineStageFlags,
    ) {
        self.record(cmd, SoftCommand::WaitEvents(events.to_vec()));
    }

    unsafe fn create_fence(&self, signalled: bool) -> VkResult<vk::Fence> {
        let mut state = self.alive()?;
        let fence = state.handle();
        state.fences.insert(fence, signalled);
        Ok(fence)
    }

    unsafe fn destroy_fence(&self, fence: vk::Fence) {
        let mut state = self.lock();
        self.destroy_checked(&mut state, "fence", fence);
        state.fences.remove(&fence);
    }

    unsafe fn fence_status(&self, fence: vk::Fence) -> VkResult<bool> {
        let state = self.alive()?;
        state
            .fences
            .get(&fence)
            .copied()
            .ok_or(vk::Result::ERROR_UNKNOWN)
    }

    unsafe fn wait_for_fences(
        &self,
        fences: &[vk::Fence],
        wait_all: bool,
        timeout_ns: u64,
    ) -> VkResult<bool> {
        let mut state = self.enter(SoftCall::WaitForFences)?;
        let done = |state: &SoftState| {
            let mut signalled = fences
                .iter()
                .map(|f| state.fences.get(f).copied().unwrap_or(false));
            if wait_all {
                signalled.all(|s| s)
            } else {
                signalled.any(|s| s)
            }
        };
        if done(&*state) {
            return Ok(true);
        }
        if timeout_ns == 0 {
            return Ok(false);
        }
        if state.run_until(done) {
            return Ok(true);
        }
        state.report_stall();
        Ok(false)
    }

    unsafe fn reset_fences(&self, fences: &[vk::Fence]) -> VkResult<()> {
        let mut state = self.alive()?;
        for fence in fences {
            if let Some(signalled) = state.fences.get_mut(fence) {
                *signalled = false;
            }
        }
        Ok(())
    }

    unsafe fn create_semaphore(&self) -> VkResult<vk::Semaphore> {
        let mut state = self.alive()?;
        let semaphore = state.handle();
        state.semaphores.insert(semaphore, false);
        Ok(semaphore)
    }

    unsafe fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        let mut state = self.lock();
        self.destroy_checked(&mut state, "semaphore", semaphore);
        state.semaphores.remove(&semaphore);
    }

    unsafe fn create_event(&self) -> VkResult<vk::Event> {
        let mut state = self.alive()?;
        let event = state.handle();
        state.events.insert(event, false);
        Ok(event)
    }

    unsafe fn destroy_event(&self, event: vk::Event) {
        let mut state = self.lock();
        self.destroy_checked(&mut state, "event", event);
        state.events.remove(&event);
    }

    unsafe fn event_status(&self, event: vk::Event) -> VkResult<bool> {
        let state = self.alive()?;
        state
            .events
            .get(&event)
            .copied()
            .ok_or(vk::Result::ERROR_UNKNOWN)
    }

    unsafe fn set_event(&self, event: vk::Event) -> VkResult<()> {
        let mut state = self.alive()?;
        let set = state.events.get_mut(&event).ok_or(vk::Result::ERROR_UNKNOWN)?;
        *set = true;
        Ok(())
    }

    unsafe fn reset_event(&self, event: vk::Event) -> VkResult<()> {
        let mut state = self.alive()?;
        let set = state.events.get_mut(&event).ok_or(vk::Result::ERROR_UNKNOWN)?;
        *set = false;
        Ok(())
    }

    unsafe fn get_queue(&self, family: u32, index: u32) -> vk::Queue {
        let state = self.lock();
        state
            .queue_order
            .iter()
            .copied()
            .find(|q| {
                state
                    .queues
                    .get(q)
                    .is_some_and(|q| q.family == family && q.index == index)
            })
            .unwrap_or_default()
    }

    unsafe fn queue_submit(
        &self,
        queue: vk::Queue,
        batches: &[SubmitBatch<'_>],
        fence: vk::Fence,
    ) -> VkResult<()> {
        let mut state = self.enter(SoftCall::QueueSubmit)?;
        let queue_family = state
            .queues
            .get(&queue)
            .map(|q| q.family)
            .ok_or(vk::Result::ERROR_UNKNOWN)?;

        let mut ops = Vec::with_capacity(batches.len() + 1);
        for batch in batches {
            let mut commands = Vec::with_capacity(batch.command_buffers.len());
            for &cmd in batch.command_buffers {
                let snapshot = state.command_buffers.get(&cmd).map(|buffer| {
                    (
                        buffer.state == RecordState::Executable,
                        buffer.family,
                        buffer.commands.clone(),
                    )
                });
                let Some((executable, family, list)) = snapshot else {
                    state.diagnose(Diagnostic::UseOfDestroyedObject {
                        kind: "command buffer",
                        handle: cmd.as_raw(),
                    });
                    continue;
                };
                if !executable {
                    state.diagnose(Diagnostic::CommandBufferNotExecutable {
                        command_buffer: cmd,
                    });
                }
                if family != queue_family {
                    state.diagnose(Diagnostic::QueueFamilyMismatch {
                        command_buffer: cmd,
                        pool_family: family,
                        queue_family,
                    });
                }
                commands.push(list);
            }
            ops.push(QueueOp::Batch {
                waits: batch.wait_semaphores.to_vec(),
                command_buffers: batch.command_buffers.to_vec(),
                commands,
                signals: batch.signal_semaphores.to_vec(),
            });
        }
        if fence != vk::Fence::null() {
            if !state.fences.contains_key(&fence) {
                return Err(vk::Result::ERROR_UNKNOWN);
            }
            ops.push(QueueOp::SignalFence(fence));
        }
        if let Some(target) = state.queues.get_mut(&queue) {
            target.ops.extend(ops);
        }
        Ok(())
    }

    unsafe fn queue_present(
        &self,
        queue: vk::Queue,
        present: &PresentBatch<'_>,
    ) -> VkResult<Vec<vk::Result>> {
        let mut state = self.enter(SoftCall::QueuePresent)?;
        let family = state
            .queues
            .get(&queue)
            .map(|q| q.family)
            .ok_or(vk::Result::ERROR_UNKNOWN)?;
        if !self
            .physical
            .queue_family(family)
            .is_some_and(|f| f.supports_present)
        {
            state.diagnose(Diagnostic::Unsupported {
                what: "present on a family without present support",
            });
        }

        let mut results = Vec::with_capacity(present.swapchains.len());
        let mut images = Vec::with_capacity(present.swapchains.len());
        for (&swapchain, &index) in present.swapchains.iter().zip(present.image_indices) {
            let result = match state.swapchains.get(&swapchain) {
                None => vk::Result::ERROR_SURFACE_LOST_KHR,
                Some(chain) => {
                    let current = state.surfaces.get(&chain.surface).map(|s| s.extent);
                    if chain.retired || current != Some(chain.extent) {
                        vk::Result::ERROR_OUT_OF_DATE_KHR
                    } else {
                        vk::Result::SUCCESS
                    }
                }
            };
            if result != vk::Result::ERROR_SURFACE_LOST_KHR {
                images.push((swapchain, index));
            }
            results.push(result);
        }
        if let Some(target) = state.queues.get_mut(&queue) {
            target.ops.push_back(QueueOp::Present {
                waits: present.wait_semaphores.to_vec(),
                images,
            });
        }
        Ok(results)
    }

    unsafe fn queue_wait_idle(&self, queue: vk::Queue) -> VkResult<()> {
        let mut state = self.alive()?;
        let idle = state.run_until(|s| s.queues.get(&queue).map_or(true, |q| q.ops.is_empty()));
        if !idle {
            state.report_stall();
        }
        Ok(())
    }

    unsafe fn device_wait_idle(&self) -> VkResult<()> {
        let mut state = self.alive()?;
        if !state.run_until(|s| s.pending_operations() == 0) {
            state.report_stall();
        }
        Ok(())
    }

    unsafe fn surface_support(&self, surface: vk::SurfaceKHR) -> VkResult<SurfaceSupport> {
        let state = self.alive()?;
        let extent = state
            .surfaces
            .get(&surface)
            .map(|s| s.extent)
            .ok_or(vk::Result::ERROR_SURFACE_LOST_KHR)?;
        let capabilities = vk::SurfaceCapabilitiesKHR {
            min_image_count: self.config.min_image_count,
            max_image_count: self.config.max_image_count,
            current_extent: extent,
            min_image_extent: vk::Extent2D {
                width: 1,
                height: 1,
            },
            max_image_extent: vk::Extent2D {
                width: 4096,
                height: 4096,
            },
            max_image_array_layers: 1,
            supported_transforms: vk::SurfaceTransformFlagsKHR::IDENTITY,
            current_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
            supported_composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE,
            supported_usage_flags: vk::ImageUsageFlags::COLOR_ATTACHMENT
                | vk::ImageUsageFlags::TRANSFER_SRC
                | vk::ImageUsageFlags::TRANSFER_DST
                | vk::ImageUsageFlags::STORAGE,
        };
        Ok(SurfaceSupport {
            capabilities,
            formats: self.config.surface_formats.clone(),
            present_modes: self.config.present_modes.clone(),
        })
    }

    unsafe fn create_swapchain(&self, info: &SwapchainInfo<'_>) -> VkResult<vk::SwapchainKHR> {
        let mut state = self.enter(SoftCall::CreateSwapchain)?;
        if !state.surfaces.contains_key(&info.surface) {
            return Err(vk::Result::ERROR_SURFACE_LOST_KHR);
        }
        let texel_size = format::texel_size(info.format.format)
            .ok_or(vk::Result::ERROR_FORMAT_NOT_SUPPORTED)?;
        if let Some(old) = state.swapchains.get_mut(&info.old_swapchain) {
            old.retired = true;
        }

        let extent = vk::Extent3D {
            width: info.extent.width,
            height: info.extent.height,
            depth: 1,
        };
        let mut images = Vec::with_capacity(info.min_image_count as usize);
        for _ in 0..info.min_image_count {
            let image = state.handle();
            let soft_image = SoftImage {
                format: info.format.format,
                extent,
                mip_levels: 1,
                layers: 1,
                texel_size,
                tiling: vk::ImageTiling::OPTIMAL,
                binding: None,
                layouts: vec![vk::ImageLayout::UNDEFINED],
            };
            let storage = vec![0u8; soft_image.total_size() as usize];
            state.images.insert(image, soft_image);
            state.image_storage.insert(image, storage);
            images.push(image);
        }

        let swapchain = state.handle();
        state.swapchains.insert(
            swapchain,
            SoftSwapchain {
                surface: info.surface,
                available: (0..images.len() as u32).collect(),
                images,
                extent: info.extent,
                retired: false,
            },
        );
        Ok(swapchain)
    }

    unsafe fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> VkResult<Vec<vk::Image>> {
        let state = self.alive()?;
        state
            .swapchains
            .get(&swapchain)
            .map(|s| s.images.clone())
            .ok_or(vk::Result::ERROR_SURFACE_LOST_KHR)
    }

    unsafe fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        let mut state = self.lock();
        self.destroy_checked(&mut state, "swapchain", swapchain);
        if let Some(removed) = state.swapchains.remove(&swapchain) {
            for image in removed.images {
                state.images.remove(&image);
                state.image_storage.remove(&image);
            }
        }
    }

    unsafe fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        timeout_ns: u64,
        semaphore: vk::Semaphore,
        fence: vk::Fence,
    ) -> VkResult<(u32, bool)> {
        let mut state = self.enter(SoftCall::AcquireNextImage)?;
        let chain = state
            .swapchains
            .get(&swapchain)
            .ok_or(vk::Result::ERROR_SURFACE_LOST_KHR)?;
        let current = state.surfaces.get(&chain.surface).map(|s| s.extent);
        if chain.retired || current != Some(chain.extent) {
            return Err(vk::Result::ERROR_OUT_OF_DATE_KHR);
        }

        let has_image = |s: &SoftState| {
            s.swapchains
                .get(&swapchain)
                .is_some_and(|c| !c.available.is_empty())
        };
        if !has_image(&*state) {
            if timeout_ns == 0 {
                return Err(vk::Result::NOT_READY);
            }
            if !state.run_until(has_image) {
                return Err(vk::Result::TIMEOUT);
            }
        }
        let index = state
            .swapchains
            .get_mut(&swapchain)
            .and_then(|c| c.available.pop_front())
            .ok_or(vk::Result::TIMEOUT)?;

        if semaphore != vk::Semaphore::null() {
            if !state.semaphores.contains_key(&semaphore) {
                return Err(vk::Result::ERROR_UNKNOWN);
            }
            if state.semaphores.insert(semaphore, true) == Some(true) {
                state.diagnose(Diagnostic::SemaphoreDoubleSignal { semaphore });
            }
        }
        if fence != vk::Fence::null() {
            match state.fences.get_mut(&fence) {
                Some(signalled) => *signalled = true,
                None => return Err(vk::Result::ERROR_UNKNOWN),
            }
        }
        Ok((index, false))
    }

    unsafe fn create_present_render_pass(&self, _format: vk::Format) -> VkResult<vk::RenderPass> {
        let mut state = self.alive()?;
        let render_pass = state.handle();
        state.render_passes.insert(render_pass);
        Ok(render_pass)
    }

    unsafe fn destroy_render_pass(&self, render_pass: vk::RenderPass) {
        self.lock().render_passes.remove(&render_pass);
    }

    unsafe fn create_framebuffer(
        &self,
        render_pass: vk::RenderPass,
        attachments: &[vk::ImageView],
        _extent: vk::Extent2D,
    ) -> VkResult<vk::Framebuffer> {
        let mut state = self.alive()?;
        if !state.render_passes.contains(&render_pass)
            || attachments.iter().any(|v| !state.views.contains_key(v))
        {
            return Err(vk::Result::ERROR_UNKNOWN);
        }
        let framebuffer = state.handle();
        state.framebuffers.insert(framebuffer);
        Ok(framebuffer)
    }

    unsafe fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        self.lock().framebuffers.remove(&framebuffer);
    }
}
