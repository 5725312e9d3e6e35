//! Buffers bound to their own memory region.

use crate::command::{execute_single_time_commands, CommandPool, CommandRecorder, QueueCapability};
use crate::device::Device;
use crate::driver::BufferInfo;
use crate::error::{ProtocolViolation, Result};
use crate::memory::{DeviceMemory, MemoryBinding};
use crate::queue::Queue;
use crate::sharing::{Ownership, Sharing, SharingMode};
use crate::texture::{BufferTextureCopy, Texture};
use ash::vk;

/// Buffer creation parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferDesc {
    pub size: u64,
    pub usage: vk::BufferUsageFlags,
    pub memory_properties: vk::MemoryPropertyFlags,
    /// Families that will use the buffer. Two or more make it concurrent.
    pub queue_families: Vec<u32>,
}

impl BufferDesc {
    pub fn new(
        size: u64,
        usage: vk::BufferUsageFlags,
        memory_properties: vk::MemoryPropertyFlags,
    ) -> Self {
        Self {
            size,
            usage,
            memory_properties,
            queue_families: Vec::new(),
        }
    }

    /// Host-visible source for uploads.
    pub fn staging(size: u64) -> Self {
        Self::new(
            size,
            vk::BufferUsageFlags::TRANSFER_SRC,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )
    }

    /// Host-visible destination for downloads.
    pub fn readback(size: u64) -> Self {
        Self::new(
            size,
            vk::BufferUsageFlags::TRANSFER_DST,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )
    }

    /// Register a family that will use the buffer.
    pub fn shared_with(mut self, family: u32) -> Self {
        self.queue_families.push(family);
        self
    }
}

/// A buffer and the memory backing it.
pub struct Buffer {
    device: Device,
    buffer: vk::Buffer,
    size: u64,
    usage: vk::BufferUsageFlags,
    memory_properties: vk::MemoryPropertyFlags,
    sharing: Sharing,
    requirements: vk::MemoryRequirements,
    binding: MemoryBinding,
    destroyed: bool,
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("buffer", &self.buffer)
            .field("size", &self.size)
            .field("usage", &self.usage)
            .field("memory_properties", &self.memory_properties)
            .finish()
    }
}

impl Buffer {
    /// Create a buffer with a dedicated memory region bound at offset 0.
    ///
    /// On failure nothing is left allocated.
    pub fn create(device: &Device, desc: &BufferDesc) -> Result<Self> {
        if desc.memory_properties.is_empty() {
            return device.violation(ProtocolViolation::MissingMemoryProperties);
        }
        let mut buffer = Self::create_unbound(device, desc)?;

        let memory = match DeviceMemory::allocate(
            device,
            desc.size,
            desc.memory_properties,
            buffer.requirements,
        ) {
            Ok(memory) => memory,
            Err(err) => {
                buffer.destroy_buffer_only();
                return Err(err);
            }
        };
        let result = unsafe {
            device
                .driver()
                .bind_buffer_memory(buffer.buffer, memory.handle(), 0)
        };
        if let Err(err) = device.check(result, "binding buffer memory") {
            buffer.destroy_buffer_only();
            drop(memory);
            return Err(err);
        }
        buffer.binding = MemoryBinding::Owned(memory);

        tracing::debug!(
            size = desc.size,
            usage = ?desc.usage,
            properties = ?desc.memory_properties,
            "created buffer"
        );
        Ok(buffer)
    }

    /// Create the buffer without memory. It becomes usable once
    /// [`bind_memory`](Self::bind_memory) succeeds.
    pub fn create_unbound(device: &Device, desc: &BufferDesc) -> Result<Self> {
        device.ensure_alive("creating buffer")?;
        if desc.size == 0 {
            return device.violation(ProtocolViolation::ZeroSized { what: "buffer size" });
        }
        if desc.usage.is_empty() {
            return device.violation(ProtocolViolation::MissingUsage);
        }

        let sharing = Sharing::from_families(&desc.queue_families);
        let (sharing_mode, queue_families) = sharing.vk_mode();
        let info = BufferInfo {
            size: desc.size,
            usage: desc.usage,
            sharing_mode,
            queue_families,
        };
        let result = unsafe { device.driver().create_buffer(&info) };
        let buffer = device.check(result, "creating buffer")?;
        let requirements = unsafe { device.driver().buffer_memory_requirements(buffer) };

        Ok(Self {
            device: device.clone(),
            buffer,
            size: desc.size,
            usage: desc.usage,
            memory_properties: desc.memory_properties,
            sharing,
            requirements,
            binding: MemoryBinding::Unbound,
            destroyed: false,
        })
    }

    /// Bind caller-owned memory at `offset`.
    pub fn bind_memory(&mut self, memory: &DeviceMemory, offset: u64) -> Result<()> {
        self.ensure_live()?;
        if self.binding.is_bound() {
            return self
                .device
                .violation(ProtocolViolation::AlreadyBound { kind: "buffer" });
        }
        self.device.protocol(MemoryBinding::check_external(
            memory,
            offset,
            &self.requirements,
        ))?;
        let result = unsafe {
            self.device
                .driver()
                .bind_buffer_memory(self.buffer, memory.handle(), offset)
        };
        self.device.check(result, "binding buffer memory")?;
        self.binding = MemoryBinding::External {
            memory: memory.handle(),
            offset,
        };
        self.memory_properties = memory.properties();
        Ok(())
    }

    fn destroy_buffer_only(&mut self) {
        unsafe { self.device.driver().destroy_buffer(self.buffer) };
        self.destroyed = true;
    }

    /// Get the raw buffer handle.
    pub fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    /// Size requested at creation.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn usage(&self) -> vk::BufferUsageFlags {
        self.usage
    }

    pub fn memory_properties(&self) -> vk::MemoryPropertyFlags {
        self.memory_properties
    }

    pub fn memory_requirements(&self) -> vk::MemoryRequirements {
        self.requirements
    }

    /// Memory allocated together with the buffer.
    pub fn memory(&self) -> Option<&DeviceMemory> {
        self.binding.owned()
    }

    pub fn memory_mut(&mut self) -> Option<&mut DeviceMemory> {
        self.binding.owned_mut()
    }

    pub fn is_bound(&self) -> bool {
        self.binding.is_bound()
    }

    /// Memory handle and offset backing the resource, owned or not.
    pub fn bound_memory(&self) -> Option<(vk::DeviceMemory, u64)> {
        self.binding.raw()
    }

    pub fn sharing_mode(&self) -> &SharingMode {
        self.sharing.mode()
    }

    pub fn ownership(&self) -> Ownership {
        self.sharing.ownership()
    }

    fn ensure_live(&self) -> Result<()> {
        if self.destroyed {
            return self
                .device
                .violation(ProtocolViolation::UseAfterDestroy { kind: "buffer" });
        }
        Ok(())
    }

    /// Fails unless the buffer is live and bound.
    pub(crate) fn ensure_usable(&self) -> Result<()> {
        self.ensure_live()?;
        if !self.binding.is_bound() {
            return self
                .device
                .violation(ProtocolViolation::Unbound { kind: "buffer" });
        }
        Ok(())
    }

    pub(crate) fn claim(&self, recorder: &CommandRecorder) -> Result<()> {
        self.device
            .protocol(self.sharing.access(recorder.family().index))
    }

    pub(crate) fn check_access(&self, recorder: &CommandRecorder) -> Result<()> {
        self.device
            .protocol(self.sharing.check(recorder.family().index))
    }

    pub(crate) fn require_usage(
        &self,
        usage: vk::BufferUsageFlags,
        name: &'static str,
    ) -> Result<()> {
        if !self.usage.contains(usage) {
            return self.device.violation(ProtocolViolation::MissingUsageFlag {
                kind: "buffer",
                required: name,
            });
        }
        Ok(())
    }

    pub(crate) fn check_range(&self, offset: u64, size: u64) -> Result<()> {
        if offset.checked_add(size).map_or(true, |end| end > self.size) {
            return self.device.violation(ProtocolViolation::OutOfBounds {
                offset,
                size,
                limit: self.size,
            });
        }
        Ok(())
    }

    fn owned_memory_mut(&mut self) -> Result<&mut DeviceMemory> {
        self.ensure_usable()?;
        match self.binding {
            MemoryBinding::Owned(ref mut memory) => Ok(memory),
            _ => self
                .device
                .violation(ProtocolViolation::Unbound { kind: "buffer memory" }),
        }
    }

    /// Map, write `data` at `offset`, and unmap.
    pub fn write(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        self.check_range(offset, data.len() as u64)?;
        let memory = self.owned_memory_mut()?;
        memory.map()?;
        let written = memory.write_bytes(offset, data);
        memory.unmap()?;
        written
    }

    /// Map, write plain data at offset 0, and unmap.
    pub fn write_pod<T: bytemuck::Pod>(&mut self, data: &[T]) -> Result<()> {
        self.write(0, bytemuck::cast_slice(data))
    }

    /// Map, read `len` bytes at `offset`, and unmap.
    pub fn read(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        self.check_range(offset, len as u64)?;
        let memory = self.owned_memory_mut()?;
        memory.map()?;
        let read = memory.read_vec(offset, len);
        memory.unmap()?;
        read
    }

    /// Copy `range` bytes into `dst`. A `range` of zero copies from
    /// `src_offset` to the end of this buffer.
    pub fn cmd_copy_to(
        &self,
        recorder: &mut CommandRecorder,
        dst: &Buffer,
        range: u64,
        src_offset: u64,
        dst_offset: u64,
    ) -> Result<()> {
        let cmd = recorder.recording()?;
        recorder.require(QueueCapability::Transfer)?;
        self.ensure_usable()?;
        dst.ensure_usable()?;
        self.require_usage(vk::BufferUsageFlags::TRANSFER_SRC, "TRANSFER_SRC")?;
        dst.require_usage(vk::BufferUsageFlags::TRANSFER_DST, "TRANSFER_DST")?;

        let range = if range == 0 {
            self.size.saturating_sub(src_offset)
        } else {
            range
        };
        if range == 0 {
            return self
                .device
                .violation(ProtocolViolation::ZeroSized { what: "copy range" });
        }
        self.check_range(src_offset, range)?;
        dst.check_range(dst_offset, range)?;
        self.check_access(recorder)?;
        dst.check_access(recorder)?;
        self.claim(recorder)?;
        dst.claim(recorder)?;

        let region = vk::BufferCopy {
            src_offset,
            dst_offset,
            size: range,
        };
        unsafe {
            self.device
                .driver()
                .cmd_copy_buffer(cmd, self.buffer, dst.buffer, &[region]);
        }
        Ok(())
    }

    /// Copy tightly packed texels into one mip level of `dst`.
    ///
    /// The level must be in `TRANSFER_DST_OPTIMAL` or `GENERAL`.
    pub fn cmd_copy_to_texture(
        &self,
        recorder: &mut CommandRecorder,
        dst: &Texture,
        region: &BufferTextureCopy,
    ) -> Result<()> {
        let cmd = recorder.recording()?;
        recorder.require(QueueCapability::Transfer)?;
        self.ensure_usable()?;
        dst.ensure_usable()?;
        self.require_usage(vk::BufferUsageFlags::TRANSFER_SRC, "TRANSFER_SRC")?;
        dst.require_usage(vk::ImageUsageFlags::TRANSFER_DST, "TRANSFER_DST")?;

        let (copy, layout, bytes) = dst.resolve_copy(
            region,
            &[
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::ImageLayout::GENERAL,
            ],
        )?;
        if let Some(bytes) = bytes {
            self.check_range(region.buffer_offset, bytes)?;
        }
        self.check_access(recorder)?;
        dst.check_access(recorder)?;
        self.claim(recorder)?;
        dst.claim(recorder)?;

        unsafe {
            self.device
                .driver()
                .cmd_copy_buffer_to_image(cmd, self.buffer, dst.handle(), layout, &[copy]);
        }
        Ok(())
    }

    /// Fill `size` bytes at `offset` with a repeated 32-bit word.
    pub fn cmd_fill(
        &self,
        recorder: &mut CommandRecorder,
        offset: u64,
        size: u64,
        data: u32,
    ) -> Result<()> {
        let cmd = recorder.recording()?;
        recorder.require(QueueCapability::Transfer)?;
        self.ensure_usable()?;
        self.require_usage(vk::BufferUsageFlags::TRANSFER_DST, "TRANSFER_DST")?;
        let size = if size == vk::WHOLE_SIZE {
            self.size.saturating_sub(offset) / 4 * 4
        } else {
            size
        };
        self.check_range(offset, size)?;
        self.claim(recorder)?;
        unsafe {
            self.device
                .driver()
                .cmd_fill_buffer(cmd, self.buffer, offset, size, data);
        }
        Ok(())
    }

    /// Record the release half of an ownership transfer to `to_family`.
    pub fn cmd_release_ownership(
        &self,
        recorder: &mut CommandRecorder,
        to_family: u32,
        src_stage: vk::PipelineStageFlags,
        src_access: vk::AccessFlags,
    ) -> Result<()> {
        let cmd = recorder.recording()?;
        self.ensure_usable()?;
        let from = recorder.family().index;
        self.device.protocol(self.sharing.release(from, to_family))?;
        let barrier = self.ownership_barrier(from, to_family, src_access, vk::AccessFlags::empty());
        unsafe {
            self.device.driver().cmd_pipeline_barrier(
                cmd,
                src_stage,
                vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                &[barrier],
                &[],
            );
        }
        Ok(())
    }

    /// Record the acquire half of an ownership transfer on the receiving
    /// family.
    pub fn cmd_acquire_ownership(
        &self,
        recorder: &mut CommandRecorder,
        dst_stage: vk::PipelineStageFlags,
        dst_access: vk::AccessFlags,
    ) -> Result<()> {
        let cmd = recorder.recording()?;
        self.ensure_usable()?;
        let to = recorder.family().index;
        let from = self.device.protocol(self.sharing.acquire(to))?;
        let barrier = self.ownership_barrier(from, to, vk::AccessFlags::empty(), dst_access);
        unsafe {
            self.device.driver().cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                dst_stage,
                &[barrier],
                &[],
            );
        }
        Ok(())
    }

    fn ownership_barrier(
        &self,
        from: u32,
        to: u32,
        src_access: vk::AccessFlags,
        dst_access: vk::AccessFlags,
    ) -> vk::BufferMemoryBarrier<'static> {
        vk::BufferMemoryBarrier::default()
            .src_access_mask(src_access)
            .dst_access_mask(dst_access)
            .src_queue_family_index(from)
            .dst_queue_family_index(to)
            .buffer(self.buffer)
            .offset(0)
            .size(vk::WHOLE_SIZE)
    }

    /// Create a host-visible staging buffer as large as this one.
    pub fn create_staging(&self) -> Result<Buffer> {
        Self::create(&self.device, &BufferDesc::staging(self.size))
    }

    /// Upload `data` at offset 0 through a staging buffer. Blocks until the
    /// copy completes.
    pub fn upload(&self, pool: &CommandPool, queue: &Queue, data: &[u8]) -> Result<()> {
        self.check_range(0, data.len() as u64)?;
        let mut staging = Self::create(&self.device, &BufferDesc::staging(data.len() as u64))?;
        staging.write(0, data)?;
        execute_single_time_commands(pool, queue, |recorder| {
            staging.cmd_copy_to(recorder, self, 0, 0, 0)
        })?;
        staging.destroy()
    }

    /// Destroy the buffer and any memory allocated with it.
    ///
    /// Memory allocated with the buffer must not be mapped.
    pub fn destroy(&mut self) -> Result<()> {
        self.ensure_live()?;
        if self.binding.owned().is_some_and(DeviceMemory::is_mapped) {
            return self.device.violation(ProtocolViolation::FreeWhileMapped);
        }
        self.release()
    }

    fn release(&mut self) -> Result<()> {
        unsafe { self.device.driver().destroy_buffer(self.buffer) };
        self.destroyed = true;
        self.binding.release()
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if !self.destroyed {
            if let Err(err) = self.release() {
                tracing::warn!(%err, "failed to release buffer");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::soft::SoftCall;
    use crate::error::GpuError;
    use crate::test_support::{pool_and_queue, soft_device};

    fn host_buffer(device: &Device, size: u64) -> Buffer {
        let desc = BufferDesc::new(
            size,
            vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
        );
        Buffer::create(device, &desc).unwrap()
    }

    fn violation(err: GpuError) -> ProtocolViolation {
        err.as_violation().cloned().expect("expected a protocol violation")
    }

    #[test]
    fn create_binds_a_dedicated_region() {
        let (driver, device) = soft_device();
        let buffer = Buffer::create(&device, &BufferDesc::staging(100)).unwrap();
        assert!(buffer.is_bound());
        let memory = buffer.memory().unwrap();
        assert!(memory.size() >= 100);
        assert!(memory.properties().contains(vk::MemoryPropertyFlags::HOST_VISIBLE));
        assert_eq!(driver.live_allocations(), 1);

        drop(buffer);
        assert_eq!(driver.live_allocations(), 0);
        assert_eq!(driver.live_resources(), 0);
    }

    #[test]
    fn invalid_descriptions_are_rejected() {
        let (driver, device) = soft_device();
        let usage = vk::BufferUsageFlags::STORAGE_BUFFER;
        let local = vk::MemoryPropertyFlags::DEVICE_LOCAL;

        let err = Buffer::create(&device, &BufferDesc::new(0, usage, local)).unwrap_err();
        assert_eq!(violation(err), ProtocolViolation::ZeroSized { what: "buffer size" });
        let err =
            Buffer::create(&device, &BufferDesc::new(64, vk::BufferUsageFlags::empty(), local))
                .unwrap_err();
        assert_eq!(violation(err), ProtocolViolation::MissingUsage);
        let err = Buffer::create(
            &device,
            &BufferDesc::new(64, usage, vk::MemoryPropertyFlags::empty()),
        )
        .unwrap_err();
        assert_eq!(violation(err), ProtocolViolation::MissingMemoryProperties);
        assert_eq!(driver.live_resources(), 0);
    }

    #[test]
    fn failed_bind_leaves_nothing_behind() {
        let (driver, device) = soft_device();
        driver.inject_failure(SoftCall::BindBufferMemory, vk::Result::ERROR_UNKNOWN);
        let err = Buffer::create(&device, &BufferDesc::staging(256)).unwrap_err();
        assert_eq!(err.vk_result(), Some(vk::Result::ERROR_UNKNOWN));
        assert_eq!(driver.live_allocations(), 0);
        assert_eq!(driver.live_resources(), 0);

        driver.inject_failure(SoftCall::AllocateMemory, vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        let err = Buffer::create(&device, &BufferDesc::staging(256)).unwrap_err();
        assert_eq!(err.vk_result(), Some(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY));
        assert_eq!(driver.live_resources(), 0);
    }

    #[test]
    fn host_writes_round_trip() {
        let (_, device) = soft_device();
        let mut buffer = host_buffer(&device, 64);
        buffer.write_pod(&[1u32, 2, 3, 4]).unwrap();
        buffer.write(16, &[9, 9]).unwrap();
        let bytes = buffer.read(0, 18).unwrap();
        assert_eq!(&bytes[..16], bytemuck::cast_slice::<u32, u8>(&[1, 2, 3, 4]));
        assert_eq!(&bytes[16..], &[9, 9]);
        assert!(!buffer.memory().unwrap().is_mapped());

        let err = buffer.write(60, &[0; 8]).unwrap_err();
        assert!(matches!(violation(err), ProtocolViolation::OutOfBounds { .. }));
    }

    #[test]
    fn destroy_is_not_repeatable() {
        let (driver, device) = soft_device();
        let mut buffer = host_buffer(&device, 64);
        buffer.destroy().unwrap();
        assert_eq!(driver.live_allocations(), 0);
        let err = buffer.destroy().unwrap_err();
        assert_eq!(violation(err), ProtocolViolation::UseAfterDestroy { kind: "buffer" });
    }

    #[test]
    fn unbound_buffers_share_caller_memory() {
        let (driver, device) = soft_device();
        let desc = BufferDesc::new(
            100,
            vk::BufferUsageFlags::TRANSFER_DST,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
        );
        let mut first = Buffer::create_unbound(&device, &desc).unwrap();
        let mut second = Buffer::create_unbound(&device, &desc).unwrap();
        assert!(!first.is_bound());
        assert_eq!(first.bound_memory(), None);
        let requirements = first.memory_requirements();
        let memory = DeviceMemory::allocate(
            &device,
            requirements.size * 2,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
            requirements,
        )
        .unwrap();

        let err = first.bind_memory(&memory, 1).unwrap_err();
        assert!(matches!(violation(err), ProtocolViolation::Misaligned { .. }));
        let err = first.bind_memory(&memory, requirements.size * 2).unwrap_err();
        assert!(matches!(violation(err), ProtocolViolation::MemoryTooSmall { .. }));

        first.bind_memory(&memory, 0).unwrap();
        second.bind_memory(&memory, requirements.size).unwrap();
        assert_eq!(first.bound_memory(), Some((memory.handle(), 0)));
        assert_eq!(
            second.bound_memory(),
            Some((memory.handle(), requirements.size))
        );
        let err = first.bind_memory(&memory, 0).unwrap_err();
        assert_eq!(violation(err), ProtocolViolation::AlreadyBound { kind: "buffer" });
        assert_eq!(driver.live_allocations(), 1);

        // External memory outlives the buffers bound to it.
        drop(first);
        drop(second);
        assert_eq!(driver.live_allocations(), 1);
    }

    #[test]
    fn copy_with_zero_range_runs_to_the_end() {
        let (_, device) = soft_device();
        let (pool, queue) = pool_and_queue(&device, 0);
        let mut src = host_buffer(&device, 16);
        let mut dst = host_buffer(&device, 32);
        src.write(0, &[7; 16]).unwrap();

        execute_single_time_commands(&pool, &queue, |recorder| {
            src.cmd_copy_to(recorder, &dst, 0, 4, 8)
        })
        .unwrap();

        let bytes = dst.read(0, 32).unwrap();
        assert_eq!(&bytes[..8], &[0; 8]);
        assert_eq!(&bytes[8..20], &[7; 12]);
        assert_eq!(&bytes[20..], &[0; 12]);
    }

    #[test]
    fn zero_range_is_sized_by_the_source_not_clamped() {
        let (_, device) = soft_device();
        let (pool, _) = pool_and_queue(&device, 0);
        let src = host_buffer(&device, 32);
        let dst = host_buffer(&device, 16);
        let mut recorder = pool.allocate(vk::CommandBufferLevel::PRIMARY).unwrap();
        recorder.begin(CommandRecorder::DEFAULT_USAGE).unwrap();

        let err = src.cmd_copy_to(&mut recorder, &dst, 0, 0, 0).unwrap_err();
        assert_eq!(
            violation(err),
            ProtocolViolation::OutOfBounds {
                offset: 0,
                size: 32,
                limit: 16
            }
        );
        dst.cmd_copy_to(&mut recorder, &src, 0, 0, 16).unwrap();
    }

    #[test]
    fn upload_goes_through_staging() {
        let (driver, device) = soft_device();
        let (pool, queue) = pool_and_queue(&device, 2);
        let mut buffer = host_buffer(&device, 8);
        buffer.upload(&pool, &queue, &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        assert_eq!(buffer.read(0, 8).unwrap(), vec![1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(driver.live_allocations(), 1);
    }

    #[test]
    fn sharing_mode_follows_registered_families() {
        let (_, device) = soft_device();
        let exclusive = Buffer::create(&device, &BufferDesc::staging(64).shared_with(1)).unwrap();
        assert_eq!(exclusive.sharing_mode(), &SharingMode::Exclusive);
        assert_eq!(exclusive.ownership(), Ownership::Owned(1));

        let concurrent = Buffer::create(
            &device,
            &BufferDesc::staging(64).shared_with(0).shared_with(1).shared_with(0),
        )
        .unwrap();
        assert_eq!(concurrent.sharing_mode(), &SharingMode::Concurrent(vec![0, 1]));
        assert_eq!(concurrent.ownership(), Ownership::Unclaimed);
    }

    #[test]
    fn exclusive_buffers_need_an_ownership_transfer() {
        let (_, device) = soft_device();
        let (graphics_pool, _) = pool_and_queue(&device, 0);
        let (transfer_pool, _) = pool_and_queue(&device, 2);
        let src = host_buffer(&device, 64);
        let dst = host_buffer(&device, 64);

        let mut graphics = graphics_pool.allocate(vk::CommandBufferLevel::PRIMARY).unwrap();
        graphics.begin(CommandRecorder::DEFAULT_USAGE).unwrap();
        src.cmd_copy_to(&mut graphics, &dst, 0, 0, 0).unwrap();
        assert_eq!(dst.ownership(), Ownership::Owned(0));

        let mut transfer = transfer_pool.allocate(vk::CommandBufferLevel::PRIMARY).unwrap();
        transfer.begin(CommandRecorder::DEFAULT_USAGE).unwrap();
        let err = dst.cmd_fill(&mut transfer, 0, vk::WHOLE_SIZE, 0).unwrap_err();
        assert_eq!(
            violation(err),
            ProtocolViolation::ExclusiveOwnership { owner: 0, family: 2 }
        );

        dst.cmd_release_ownership(
            &mut graphics,
            2,
            vk::PipelineStageFlags::TRANSFER,
            vk::AccessFlags::TRANSFER_WRITE,
        )
        .unwrap();
        assert_eq!(dst.ownership(), Ownership::Transferring { from: 0, to: 2 });
        dst.cmd_acquire_ownership(
            &mut transfer,
            vk::PipelineStageFlags::TRANSFER,
            vk::AccessFlags::TRANSFER_WRITE,
        )
        .unwrap();
        dst.cmd_fill(&mut transfer, 0, vk::WHOLE_SIZE, 0).unwrap();
        assert_eq!(dst.ownership(), Ownership::Owned(2));
    }
}
