//! Object tables of the software device.

use super::kernel::{Kernel, SoftBinding, MAX_PUSH_CONSTANTS};
use super::{Diagnostic, SoftCall, TraceEvent};
use ash::vk;
use ash::vk::Handle;
use hashbrown::{HashMap, HashSet};
use std::collections::VecDeque;
use std::ptr::NonNull;

/// Fixed-size zeroed host allocation backing one device memory object.
///
/// Accessed only through raw pointers so host mappings stay valid while the
/// device writes to the same bytes.
pub(super) struct HostMemory {
    ptr: NonNull<u8>,
    len: usize,
}

// The allocation is uniquely owned and every access happens under the
// driver's state lock or through a mapping the caller synchronizes.
unsafe impl Send for HostMemory {}
unsafe impl Sync for HostMemory {}

impl HostMemory {
    pub fn zeroed(len: usize) -> Self {
        let boxed: Box<[u8]> = vec![0u8; len].into_boxed_slice();
        let ptr = NonNull::from(Box::leak(boxed)).cast::<u8>();
        Self { ptr, len }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn ptr_at(&self, offset: usize) -> Option<NonNull<u8>> {
        (offset <= self.len).then(|| unsafe { NonNull::new_unchecked(self.ptr.as_ptr().add(offset)) })
    }

    pub fn read(&self, offset: usize, len: usize) -> Option<Vec<u8>> {
        let end = offset.checked_add(len)?;
        if end > self.len {
            return None;
        }
        let mut out = vec![0u8; len];
        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr.as_ptr().add(offset), out.as_mut_ptr(), len);
        }
        Some(out)
    }

    pub fn write(&self, offset: usize, data: &[u8]) -> bool {
        let Some(end) = offset.checked_add(data.len()) else {
            return false;
        };
        if end > self.len {
            return false;
        }
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.as_ptr().add(offset), data.len());
        }
        true
    }
}

impl Drop for HostMemory {
    fn drop(&mut self) {
        let slice = std::ptr::slice_from_raw_parts_mut(self.ptr.as_ptr(), self.len);
        drop(unsafe { Box::from_raw(slice) });
    }
}

pub(super) struct SoftMemory {
    pub storage: HostMemory,
    pub type_index: u32,
    pub heap_index: u32,
    pub host_visible: bool,
    pub mapped: bool,
}

pub(super) struct SoftBuffer {
    pub size: u64,
    pub binding: Option<(vk::DeviceMemory, u64)>,
}

pub(super) struct SoftImage {
    pub format: vk::Format,
    pub extent: vk::Extent3D,
    pub mip_levels: u32,
    pub layers: u32,
    pub texel_size: u32,
    pub tiling: vk::ImageTiling,
    pub binding: Option<(vk::DeviceMemory, u64)>,
    /// Actual layout per subresource, indexed by `level * layers + layer`.
    pub layouts: Vec<vk::ImageLayout>,
}

impl SoftImage {
    pub fn level_extent(&self, level: u32) -> vk::Extent3D {
        crate::format::mip_extent(self.extent, level)
    }

    /// Bytes of one layer of `level`.
    pub fn level_size(&self, level: u32) -> u64 {
        let e = self.level_extent(level);
        u64::from(e.width) * u64::from(e.height) * u64::from(e.depth) * u64::from(self.texel_size)
    }

    /// Data is stored level by level, each level holding all its layers.
    pub fn subresource_offset(&self, level: u32, layer: u32) -> u64 {
        let before: u64 = (0..level).map(|l| self.level_size(l)).sum();
        before * u64::from(self.layers) + u64::from(layer) * self.level_size(level)
    }

    pub fn total_size(&self) -> u64 {
        self.subresource_offset(self.mip_levels, 0)
    }

    pub fn layout_index(&self, level: u32, layer: u32) -> Option<usize> {
        (level < self.mip_levels && layer < self.layers)
            .then(|| (level * self.layers + layer) as usize)
    }

    pub fn texel_offset(&self, level: u32, layer: u32, x: u32, y: u32, z: u32) -> usize {
        let e = self.level_extent(level);
        let index = (u64::from(z) * u64::from(e.height) + u64::from(y)) * u64::from(e.width)
            + u64::from(x);
        (self.subresource_offset(level, layer) + index * u64::from(self.texel_size)) as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum RecordState {
    Initial,
    Recording,
    Executable,
}

pub(super) struct SoftCommandBuffer {
    pub pool: vk::CommandPool,
    pub family: u32,
    pub state: RecordState,
    pub commands: Vec<SoftCommand>,
}

pub(super) struct SoftPool {
    pub family: u32,
    pub buffers: HashSet<vk::CommandBuffer>,
}

#[derive(Debug, Clone, Copy)]
pub(super) struct ImageBarrier {
    pub image: vk::Image,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub range: vk::ImageSubresourceRange,
    pub src_family: u32,
    pub dst_family: u32,
}

#[derive(Debug, Clone, Copy)]
pub(super) struct BufferBarrier {
    pub buffer: vk::Buffer,
    pub src_family: u32,
    pub dst_family: u32,
}

/// A recorded command.
#[derive(Debug, Clone)]
pub(super) enum SoftCommand {
    Barrier {
        buffers: Vec<BufferBarrier>,
        images: Vec<ImageBarrier>,
    },
    CopyBuffer {
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: Vec<vk::BufferCopy>,
    },
    CopyBufferToImage {
        src: vk::Buffer,
        dst: vk::Image,
        layout: vk::ImageLayout,
        regions: Vec<vk::BufferImageCopy>,
    },
    CopyImageToBuffer {
        src: vk::Image,
        layout: vk::ImageLayout,
        dst: vk::Buffer,
        regions: Vec<vk::BufferImageCopy>,
    },
    Blit {
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: Vec<vk::ImageBlit>,
    },
    Fill {
        buffer: vk::Buffer,
        offset: u64,
        size: u64,
        data: u32,
    },
    Clear {
        image: vk::Image,
        layout: vk::ImageLayout,
        color: [u32; 4],
        ranges: Vec<vk::ImageSubresourceRange>,
    },
    BindPipeline(vk::Pipeline),
    BindDescriptorSets {
        first_set: u32,
        sets: Vec<vk::DescriptorSet>,
    },
    PushConstants {
        offset: u32,
        data: Vec<u8>,
    },
    Dispatch([u32; 3]),
    SetEvent(vk::Event),
    ResetEvent(vk::Event),
    WaitEvents(Vec<vk::Event>),
}

impl SoftCommand {
    /// Raw handles of every object the command touches directly.
    pub fn handles(&self) -> Vec<u64> {
        match self {
            Self::Barrier { buffers, images } => buffers
                .iter()
                .map(|b| b.buffer.as_raw())
                .chain(images.iter().map(|i| i.image.as_raw()))
                .collect(),
            Self::CopyBuffer { src, dst, .. } => vec![src.as_raw(), dst.as_raw()],
            Self::CopyBufferToImage { src, dst, .. } => vec![src.as_raw(), dst.as_raw()],
            Self::CopyImageToBuffer { src, dst, .. } => vec![src.as_raw(), dst.as_raw()],
            Self::Blit { src, dst, .. } => vec![src.as_raw(), dst.as_raw()],
            Self::Fill { buffer, .. } => vec![buffer.as_raw()],
            Self::Clear { image, .. } => vec![image.as_raw()],
            Self::BindPipeline(pipeline) => vec![pipeline.as_raw()],
            Self::BindDescriptorSets { sets, .. } => sets.iter().map(|s| s.as_raw()).collect(),
            Self::PushConstants { .. } | Self::Dispatch(_) => Vec::new(),
            Self::SetEvent(event) | Self::ResetEvent(event) => vec![event.as_raw()],
            Self::WaitEvents(events) => events.iter().map(|e| e.as_raw()).collect(),
        }
    }
}

/// Work waiting on a queue.
pub(super) enum QueueOp {
    Batch {
        waits: Vec<vk::Semaphore>,
        command_buffers: Vec<vk::CommandBuffer>,
        /// Snapshot taken at submit time.
        commands: Vec<Vec<SoftCommand>>,
        signals: Vec<vk::Semaphore>,
    },
    SignalFence(vk::Fence),
    Present {
        waits: Vec<vk::Semaphore>,
        images: Vec<(vk::SwapchainKHR, u32)>,
    },
}

impl QueueOp {
    pub fn handles(&self) -> Vec<u64> {
        match self {
            Self::Batch {
                waits,
                command_buffers,
                commands,
                signals,
            } => waits
                .iter()
                .chain(signals)
                .map(|s| s.as_raw())
                .chain(command_buffers.iter().map(|c| c.as_raw()))
                .chain(commands.iter().flatten().flat_map(SoftCommand::handles))
                .collect(),
            Self::SignalFence(fence) => vec![fence.as_raw()],
            Self::Present { waits, images } => waits
                .iter()
                .map(|s| s.as_raw())
                .chain(images.iter().map(|(s, _)| s.as_raw()))
                .collect(),
        }
    }
}

pub(super) struct SoftQueue {
    pub family: u32,
    pub index: u32,
    pub ops: VecDeque<QueueOp>,
}

pub(super) struct SoftSurface {
    pub extent: vk::Extent2D,
}

pub(super) struct SoftSwapchain {
    pub surface: vk::SurfaceKHR,
    pub images: Vec<vk::Image>,
    /// Indices the presentation engine can hand out, oldest first.
    pub available: VecDeque<u32>,
    pub extent: vk::Extent2D,
    /// Replaced by a newer swapchain through `old_swapchain`.
    pub retired: bool,
}

/// Execution state carried across the commands of one command buffer.
pub(super) struct Bindings {
    pub pipeline: Option<vk::Pipeline>,
    pub sets: Vec<vk::DescriptorSet>,
    pub push_constants: [u8; MAX_PUSH_CONSTANTS],
}

impl Default for Bindings {
    fn default() -> Self {
        Self {
            pipeline: None,
            sets: Vec::new(),
            push_constants: [0; MAX_PUSH_CONSTANTS],
        }
    }
}

#[derive(Default)]
pub(super) struct SoftState {
    pub next_handle: u64,
    pub lost: bool,
    pub failures: HashMap<SoftCall, vk::Result>,
    pub heap_usage: Vec<u64>,
    pub memories: HashMap<vk::DeviceMemory, SoftMemory>,
    pub buffers: HashMap<vk::Buffer, SoftBuffer>,
    pub images: HashMap<vk::Image, SoftImage>,
    /// Storage of swapchain images, which are not bound to device memory.
    pub image_storage: HashMap<vk::Image, Vec<u8>>,
    pub views: HashMap<vk::ImageView, vk::Image>,
    pub pools: HashMap<vk::CommandPool, SoftPool>,
    pub command_buffers: HashMap<vk::CommandBuffer, SoftCommandBuffer>,
    pub fences: HashMap<vk::Fence, bool>,
    pub semaphores: HashMap<vk::Semaphore, bool>,
    pub events: HashMap<vk::Event, bool>,
    pub queues: HashMap<vk::Queue, SoftQueue>,
    /// Queues in creation order, for deterministic scheduling.
    pub queue_order: Vec<vk::Queue>,
    pub surfaces: HashMap<vk::SurfaceKHR, SoftSurface>,
    pub swapchains: HashMap<vk::SwapchainKHR, SoftSwapchain>,
    pub render_passes: HashSet<vk::RenderPass>,
    pub framebuffers: HashSet<vk::Framebuffer>,
    pub kernels: HashMap<vk::Pipeline, Kernel>,
    pub descriptor_sets: HashMap<vk::DescriptorSet, Vec<SoftBinding>>,
    pub trace: Vec<TraceEvent>,
    pub diagnostics: Vec<Diagnostic>,
}

impl SoftState {
    /// Allocate a fresh non-null handle.
    pub fn handle<H: Handle>(&mut self) -> H {
        self.next_handle += 1;
        H::from_raw(self.next_handle)
    }

    /// Take a failure injected for `call`, if any.
    pub fn injected(&mut self, call: SoftCall) -> Option<vk::Result> {
        self.failures.remove(&call)
    }

    pub fn diagnose(&mut self, diagnostic: Diagnostic) {
        tracing::warn!(?diagnostic, "soft driver diagnostic");
        self.diagnostics.push(diagnostic);
    }

    /// Whether any queued, unexecuted operation touches `raw`.
    pub fn in_use(&self, raw: u64) -> bool {
        self.queues.values().any(|queue| {
            queue.ops.iter().any(|op| {
                op.handles().into_iter().any(|handle| {
                    handle == raw
                        || self
                            .descriptor_sets
                            .get(&vk::DescriptorSet::from_raw(handle))
                            .is_some_and(|bindings| bindings.iter().any(|b| binding_raw(b) == raw))
                })
            })
        })
    }

    /// Whether queued work touches a buffer or image bound to `memory`.
    pub fn memory_in_use(&self, memory: vk::DeviceMemory) -> bool {
        let buffers = self
            .buffers
            .iter()
            .filter(|(_, b)| b.binding.is_some_and(|(m, _)| m == memory))
            .map(|(h, _)| h.as_raw());
        let images = self
            .images
            .iter()
            .filter(|(_, i)| i.binding.is_some_and(|(m, _)| m == memory))
            .map(|(h, _)| h.as_raw());
        buffers.chain(images).any(|raw| self.in_use(raw))
    }

    /// Bytes of a bound buffer.
    pub fn buffer_bytes(&self, buffer: vk::Buffer) -> Option<(&HostMemory, usize, usize)> {
        let info = self.buffers.get(&buffer)?;
        let (memory, offset) = info.binding?;
        let memory = self.memories.get(&memory)?;
        Some((&memory.storage, offset as usize, info.size as usize))
    }

    pub fn read_buffer(&self, buffer: vk::Buffer, offset: u64, len: u64) -> Option<Vec<u8>> {
        let (storage, base, size) = self.buffer_bytes(buffer)?;
        if offset.checked_add(len)? > size as u64 {
            return None;
        }
        storage.read(base + offset as usize, len as usize)
    }

    pub fn write_buffer(&self, buffer: vk::Buffer, offset: u64, data: &[u8]) -> bool {
        let Some((storage, base, size)) = self.buffer_bytes(buffer) else {
            return false;
        };
        if offset + data.len() as u64 > size as u64 {
            return false;
        }
        storage.write(base + offset as usize, data)
    }

    /// Read a box of texels from one subresource, tightly packed.
    pub fn read_texels(
        &self,
        image: vk::Image,
        level: u32,
        layer: u32,
        origin: [u32; 3],
        extent: [u32; 3],
    ) -> Option<Vec<u8>> {
        let info = self.images.get(&image)?;
        let texel = info.texel_size as usize;
        let row = extent[0] as usize * texel;
        let mut out = Vec::with_capacity(row * extent[1] as usize * extent[2] as usize);
        for z in 0..extent[2] {
            for y in 0..extent[1] {
                let start =
                    info.texel_offset(level, layer, origin[0], origin[1] + y, origin[2] + z);
                out.extend_from_slice(&self.image_read(image, start, row)?);
            }
        }
        Some(out)
    }

    /// Write a tightly packed box of texels into one subresource.
    pub fn write_texels(
        &mut self,
        image: vk::Image,
        level: u32,
        layer: u32,
        origin: [u32; 3],
        extent: [u32; 3],
        data: &[u8],
    ) -> bool {
        let Some(info) = self.images.get(&image) else {
            return false;
        };
        let texel = info.texel_size as usize;
        let row = extent[0] as usize * texel;
        let mut rows = Vec::new();
        for z in 0..extent[2] {
            for y in 0..extent[1] {
                rows.push(info.texel_offset(level, layer, origin[0], origin[1] + y, origin[2] + z));
            }
        }
        if data.len() < rows.len() * row {
            return false;
        }
        rows.into_iter()
            .enumerate()
            .all(|(i, start)| self.image_write(image, start, &data[i * row..(i + 1) * row]))
    }

    fn image_read(&self, image: vk::Image, offset: usize, len: usize) -> Option<Vec<u8>> {
        if let Some(storage) = self.image_storage.get(&image) {
            return storage.get(offset..offset + len).map(<[u8]>::to_vec);
        }
        let info = self.images.get(&image)?;
        let (memory, base) = info.binding?;
        if (offset + len) as u64 > info.total_size() {
            return None;
        }
        self.memories
            .get(&memory)?
            .storage
            .read(base as usize + offset, len)
    }

    fn image_write(&mut self, image: vk::Image, offset: usize, data: &[u8]) -> bool {
        if let Some(storage) = self.image_storage.get_mut(&image) {
            return match storage.get_mut(offset..offset + data.len()) {
                Some(dst) => {
                    dst.copy_from_slice(data);
                    true
                }
                None => false,
            };
        }
        let Some(info) = self.images.get(&image) else {
            return false;
        };
        let Some((memory, base)) = info.binding else {
            return false;
        };
        if (offset + data.len()) as u64 > info.total_size() {
            return false;
        }
        self.memories
            .get(&memory)
            .is_some_and(|m| m.storage.write(base as usize + offset, data))
    }
}

pub(super) fn binding_raw(binding: &SoftBinding) -> u64 {
    match binding {
        SoftBinding::StorageImage(image) => image.as_raw(),
        SoftBinding::StorageBuffer(buffer) => buffer.as_raw(),
    }
}
