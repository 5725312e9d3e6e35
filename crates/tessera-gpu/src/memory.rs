//! Device memory regions.
//!
//! A [`DeviceMemory`] is one allocation from a single memory type. It can be
//! mapped into host address space when it was requested as host visible and
//! not device local.

use crate::device::Device;
use crate::error::{ProtocolViolation, Result};
use ash::vk;
use std::ptr::NonNull;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MemoryState {
    Live,
    Mapped { ptr: NonNull<u8>, offset: u64, size: u64 },
    Freed,
}

/// An allocation of device memory.
pub struct DeviceMemory {
    device: Device,
    memory: vk::DeviceMemory,
    size: u64,
    properties: vk::MemoryPropertyFlags,
    memory_type_index: u32,
    state: MemoryState,
}

// The mapped pointer is only dereferenced through `&self`/`&mut self`
// methods, which follow normal borrow rules.
unsafe impl Send for DeviceMemory {}
unsafe impl Sync for DeviceMemory {}

impl std::fmt::Debug for DeviceMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceMemory")
            .field("memory", &self.memory)
            .field("size", &self.size)
            .field("properties", &self.properties)
            .field("memory_type_index", &self.memory_type_index)
            .field("mapped", &self.is_mapped())
            .finish()
    }
}

impl DeviceMemory {
    /// Allocate memory compatible with `requirements` and carrying all of
    /// `properties`.
    ///
    /// The allocation is at least `requirements.size` bytes.
    pub fn allocate(
        device: &Device,
        size: u64,
        properties: vk::MemoryPropertyFlags,
        requirements: vk::MemoryRequirements,
    ) -> Result<Self> {
        device.ensure_alive("allocating device memory")?;
        let size = size.max(requirements.size);
        if size == 0 {
            return device.violation(ProtocolViolation::ZeroSized {
                what: "allocation size",
            });
        }

        let memory_type_index =
            device.find_memory_type_index(requirements.memory_type_bits, properties)?;
        let result = unsafe { device.driver().allocate_memory(size, memory_type_index) };
        let memory = device.check(result, "allocating device memory")?;

        tracing::debug!(size, memory_type_index, ?properties, "allocated device memory");

        Ok(Self {
            device: device.clone(),
            memory,
            size,
            properties,
            memory_type_index,
            state: MemoryState::Live,
        })
    }

    /// Get the raw memory handle.
    pub fn handle(&self) -> vk::DeviceMemory {
        self.memory
    }

    /// Size of the allocation in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Properties requested at allocation time.
    pub fn properties(&self) -> vk::MemoryPropertyFlags {
        self.properties
    }

    /// Flags of the memory type actually used.
    pub fn memory_type_flags(&self) -> vk::MemoryPropertyFlags {
        self.device.physical().memory_types()[self.memory_type_index as usize].property_flags
    }

    pub fn memory_type_index(&self) -> u32 {
        self.memory_type_index
    }

    pub fn is_mapped(&self) -> bool {
        matches!(self.state, MemoryState::Mapped { .. })
    }

    pub fn is_freed(&self) -> bool {
        self.state == MemoryState::Freed
    }

    /// Whether [`map`](Self::map) can succeed on this region.
    pub fn is_mappable(&self) -> bool {
        Self::mappable(self.properties).is_ok()
    }

    fn mappable(properties: vk::MemoryPropertyFlags) -> std::result::Result<(), ProtocolViolation> {
        if properties.contains(vk::MemoryPropertyFlags::DEVICE_LOCAL) {
            return Err(ProtocolViolation::MapDeviceLocal);
        }
        if !properties.contains(vk::MemoryPropertyFlags::HOST_VISIBLE) {
            return Err(ProtocolViolation::NotHostVisible { properties });
        }
        Ok(())
    }

    pub(crate) fn ensure_live(&self) -> std::result::Result<(), ProtocolViolation> {
        match self.state {
            MemoryState::Freed => Err(ProtocolViolation::UseAfterDestroy {
                kind: "device memory",
            }),
            _ => Ok(()),
        }
    }

    /// Map the whole allocation.
    pub fn map(&mut self) -> Result<NonNull<u8>> {
        self.map_range(0, vk::WHOLE_SIZE)
    }

    /// Map `size` bytes starting at `offset`. `vk::WHOLE_SIZE` maps to the
    /// end of the allocation.
    pub fn map_range(&mut self, offset: u64, size: u64) -> Result<NonNull<u8>> {
        self.device.protocol(self.ensure_live())?;
        if self.is_mapped() {
            return self.device.violation(ProtocolViolation::AlreadyMapped);
        }
        self.device.protocol(Self::mappable(self.properties))?;

        let size = if size == vk::WHOLE_SIZE {
            self.size.saturating_sub(offset)
        } else {
            size
        };
        if size == 0 || offset.checked_add(size).map_or(true, |end| end > self.size) {
            return self.device.violation(ProtocolViolation::OutOfBounds {
                offset,
                size,
                limit: self.size,
            });
        }

        let result = unsafe { self.device.driver().map_memory(self.memory, offset, size) };
        let ptr = self.device.check(result, "mapping device memory")?;
        self.state = MemoryState::Mapped { ptr, offset, size };
        Ok(ptr)
    }

    /// Unmap the allocation.
    pub fn unmap(&mut self) -> Result<()> {
        self.device.protocol(self.ensure_live())?;
        if !self.is_mapped() {
            return self.device.violation(ProtocolViolation::NotMapped);
        }
        unsafe { self.device.driver().unmap_memory(self.memory) };
        self.state = MemoryState::Live;
        Ok(())
    }

    /// Pointer to the start of the mapped range, if mapped.
    pub fn mapped_ptr(&self) -> Option<NonNull<u8>> {
        match self.state {
            MemoryState::Mapped { ptr, .. } => Some(ptr),
            _ => None,
        }
    }

    /// Resolve a range given relative to the start of the allocation to an
    /// offset into the mapped range.
    fn mapped_window(&self, offset: u64, len: usize) -> Result<(NonNull<u8>, usize)> {
        let MemoryState::Mapped {
            ptr,
            offset: map_offset,
            size: map_size,
        } = self.state
        else {
            return self.device.violation(match self.state {
                MemoryState::Freed => ProtocolViolation::UseAfterDestroy {
                    kind: "device memory",
                },
                _ => ProtocolViolation::NotMapped,
            });
        };
        let len = len as u64;
        let in_range = offset >= map_offset
            && offset
                .checked_add(len)
                .is_some_and(|end| end <= map_offset + map_size);
        if !in_range {
            return self.device.violation(ProtocolViolation::OutOfBounds {
                offset,
                size: len,
                limit: map_offset + map_size,
            });
        }
        Ok((ptr, (offset - map_offset) as usize))
    }

    /// Copy `data` into the mapped range at `offset` bytes from the start of
    /// the allocation.
    pub fn write_bytes(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let (ptr, start) = self.mapped_window(offset, data.len())?;
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.as_ptr().add(start), data.len());
        }
        Ok(())
    }

    /// Copy plain data into the mapped range.
    pub fn write_pod<T: bytemuck::Pod>(&mut self, offset: u64, data: &[T]) -> Result<()> {
        self.write_bytes(offset, bytemuck::cast_slice(data))
    }

    /// Copy from the mapped range into `out`.
    pub fn read_bytes(&self, offset: u64, out: &mut [u8]) -> Result<()> {
        let (ptr, start) = self.mapped_window(offset, out.len())?;
        unsafe {
            std::ptr::copy_nonoverlapping(ptr.as_ptr().add(start), out.as_mut_ptr(), out.len());
        }
        Ok(())
    }

    /// Read `len` bytes from the mapped range.
    pub fn read_vec(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut out = vec![0; len];
        self.read_bytes(offset, &mut out)?;
        Ok(out)
    }

    /// Make host writes visible to the device. Only needed without
    /// `HOST_COHERENT`.
    pub fn flush(&self) -> Result<()> {
        let MemoryState::Mapped { offset, size, .. } = self.state else {
            return self.device.violation(ProtocolViolation::NotMapped);
        };
        let (offset, size) = self.atom_aligned(offset, size);
        let result = unsafe { self.device.driver().flush_mapped_range(self.memory, offset, size) };
        self.device.check(result, "flushing mapped memory")
    }

    /// Make device writes visible to the host. Only needed without
    /// `HOST_COHERENT`.
    pub fn invalidate(&self) -> Result<()> {
        let MemoryState::Mapped { offset, size, .. } = self.state else {
            return self.device.violation(ProtocolViolation::NotMapped);
        };
        let (offset, size) = self.atom_aligned(offset, size);
        let result = unsafe {
            self.device
                .driver()
                .invalidate_mapped_range(self.memory, offset, size)
        };
        self.device.check(result, "invalidating mapped memory")
    }

    fn atom_aligned(&self, offset: u64, size: u64) -> (u64, u64) {
        let atom = self.device.physical().non_coherent_atom_size.max(1);
        let start = offset / atom * atom;
        let end = (offset + size).div_ceil(atom) * atom;
        if end >= self.size {
            (start, vk::WHOLE_SIZE)
        } else {
            (start, end - start)
        }
    }

    /// Return the allocation to the device.
    ///
    /// The region must be unmapped first.
    pub fn free(&mut self) -> Result<()> {
        match self.state {
            MemoryState::Freed => self.device.violation(ProtocolViolation::UseAfterDestroy {
                kind: "device memory",
            }),
            MemoryState::Mapped { .. } => self.device.violation(ProtocolViolation::FreeWhileMapped),
            MemoryState::Live => {
                unsafe { self.device.driver().free_memory(self.memory) };
                self.state = MemoryState::Freed;
                tracing::debug!(size = self.size, "freed device memory");
                Ok(())
            }
        }
    }
}

impl Drop for DeviceMemory {
    fn drop(&mut self) {
        match self.state {
            MemoryState::Freed => {}
            MemoryState::Mapped { .. } => {
                tracing::warn!(size = self.size, "device memory dropped while mapped");
                unsafe {
                    self.device.driver().unmap_memory(self.memory);
                    self.device.driver().free_memory(self.memory);
                }
            }
            MemoryState::Live => unsafe { self.device.driver().free_memory(self.memory) },
        }
    }
}

/// How a buffer or texture is backed by memory.
#[derive(Debug)]
pub(crate) enum MemoryBinding {
    Unbound,
    /// Memory allocated for, and released with, the resource.
    Owned(DeviceMemory),
    /// Caller-provided memory. The caller keeps it alive.
    External { memory: vk::DeviceMemory, offset: u64 },
}

impl MemoryBinding {
    pub fn is_bound(&self) -> bool {
        !matches!(self, Self::Unbound)
    }

    pub fn owned(&self) -> Option<&DeviceMemory> {
        match self {
            Self::Owned(memory) => Some(memory),
            _ => None,
        }
    }

    pub fn owned_mut(&mut self) -> Option<&mut DeviceMemory> {
        match self {
            Self::Owned(memory) => Some(memory),
            _ => None,
        }
    }

    /// Raw memory handle and offset, if bound.
    pub fn raw(&self) -> Option<(vk::DeviceMemory, u64)> {
        match self {
            Self::Unbound => None,
            Self::Owned(memory) => Some((memory.handle(), 0)),
            Self::External { memory, offset } => Some((*memory, *offset)),
        }
    }

    /// Check that `memory` can back a resource with `requirements` at
    /// `offset`.
    pub fn check_external(
        memory: &DeviceMemory,
        offset: u64,
        requirements: &vk::MemoryRequirements,
    ) -> std::result::Result<(), ProtocolViolation> {
        memory.ensure_live()?;
        if requirements.memory_type_bits & (1 << memory.memory_type_index()) == 0 {
            return Err(ProtocolViolation::IncompatibleMemoryType {
                memory_type: memory.memory_type_index(),
                type_filter: requirements.memory_type_bits,
            });
        }
        if requirements.alignment > 1 && offset % requirements.alignment != 0 {
            return Err(ProtocolViolation::Misaligned {
                offset,
                alignment: requirements.alignment,
            });
        }
        if offset
            .checked_add(requirements.size)
            .map_or(true, |end| end > memory.size())
        {
            return Err(ProtocolViolation::MemoryTooSmall {
                offset,
                required: requirements.size,
                available: memory.size(),
            });
        }
        Ok(())
    }

    /// Release owned memory, unmapping it first if needed.
    pub fn release(&mut self) -> Result<()> {
        if let Self::Owned(memory) = self {
            if memory.is_mapped() {
                memory.unmap()?;
            }
            memory.free()?;
        }
        *self = Self::Unbound;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::soft::{SoftDriver, SoftDriverConfig};
    use crate::device::DeviceConfig;
    use crate::error::GpuError;
    use crate::test_support::soft_device;
    use std::sync::Arc;

    fn any_type(size: u64) -> vk::MemoryRequirements {
        vk::MemoryRequirements {
            size,
            alignment: 256,
            memory_type_bits: 0b111,
        }
    }

    #[test]
    fn allocation_picks_lowest_matching_type() {
        let (_, device) = soft_device();
        let local =
            DeviceMemory::allocate(&device, 0, vk::MemoryPropertyFlags::DEVICE_LOCAL, any_type(256))
                .unwrap();
        let host =
            DeviceMemory::allocate(&device, 0, vk::MemoryPropertyFlags::HOST_VISIBLE, any_type(256))
                .unwrap();
        let cached =
            DeviceMemory::allocate(&device, 0, vk::MemoryPropertyFlags::HOST_CACHED, any_type(256))
                .unwrap();
        assert_eq!(local.memory_type_index(), 0);
        assert_eq!(host.memory_type_index(), 1);
        assert_eq!(cached.memory_type_index(), 2);
        assert!(host.memory_type_flags().contains(vk::MemoryPropertyFlags::HOST_COHERENT));
    }

    #[test]
    fn incompatible_type_filter_is_an_error_not_a_fallback() {
        let (driver, device) = soft_device();
        let requirements = vk::MemoryRequirements {
            memory_type_bits: 0b001,
            ..any_type(256)
        };
        let err = DeviceMemory::allocate(
            &device,
            0,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
            requirements,
        )
        .unwrap_err();
        assert!(matches!(err, GpuError::NoCompatibleMemoryType { type_filter: 0b001, .. }));
        assert_eq!(driver.live_allocations(), 0);
    }

    #[test]
    fn mapping_device_local_memory_is_rejected() {
        let (_, device) = soft_device();
        let mut memory =
            DeviceMemory::allocate(&device, 0, vk::MemoryPropertyFlags::DEVICE_LOCAL, any_type(512))
                .unwrap();
        assert!(!memory.is_mappable());
        let err = memory.map().unwrap_err();
        assert_eq!(err.as_violation(), Some(&ProtocolViolation::MapDeviceLocal));
        assert!(!memory.is_mapped());
    }

    #[test]
    fn mapped_writes_are_bounds_checked() {
        let (_, device) = soft_device();
        let mut memory =
            DeviceMemory::allocate(&device, 0, vk::MemoryPropertyFlags::HOST_VISIBLE, any_type(256))
                .unwrap();
        memory.map_range(64, 64).unwrap();
        memory.write_pod(64, &[1u32, 2, 3, 4]).unwrap();
        assert_eq!(memory.read_vec(68, 4).unwrap(), 2u32.to_ne_bytes());

        let err = memory.write_bytes(120, &[0; 16]).unwrap_err();
        assert!(matches!(
            err.as_violation(),
            Some(ProtocolViolation::OutOfBounds { offset: 120, .. })
        ));
        let err = memory.read_vec(0, 4).unwrap_err();
        assert!(matches!(err.as_violation(), Some(ProtocolViolation::OutOfBounds { .. })));
    }

    #[test]
    fn double_map_and_free_while_mapped_leave_region_live() {
        let (driver, device) = soft_device();
        let mut memory =
            DeviceMemory::allocate(&device, 0, vk::MemoryPropertyFlags::HOST_VISIBLE, any_type(256))
                .unwrap();
        memory.map().unwrap();
        let err = memory.map().unwrap_err();
        assert_eq!(err.as_violation(), Some(&ProtocolViolation::AlreadyMapped));

        let err = memory.free().unwrap_err();
        assert_eq!(err.as_violation(), Some(&ProtocolViolation::FreeWhileMapped));
        assert!(memory.is_mapped());
        assert!(!memory.is_freed());
        assert_eq!(driver.live_allocations(), 1);

        memory.unmap().unwrap();
        memory.free().unwrap();
        assert!(memory.is_freed());
        assert_eq!(driver.live_allocations(), 0);
        let err = memory.free().unwrap_err();
        assert!(matches!(err.as_violation(), Some(ProtocolViolation::UseAfterDestroy { .. })));
    }

    #[test]
    fn dropping_releases_the_allocation() {
        let (driver, device) = soft_device();
        {
            let mut memory = DeviceMemory::allocate(
                &device,
                0,
                vk::MemoryPropertyFlags::HOST_VISIBLE,
                any_type(1024),
            )
            .unwrap();
            memory.map().unwrap();
            assert_eq!(driver.heap_usage(1), 1024);
        }
        assert_eq!(driver.live_allocations(), 0);
        assert_eq!(driver.heap_usage(1), 0);
    }

    #[test]
    fn exhausted_heap_reports_the_driver_result() {
        let config = SoftDriverConfig::default().heap_size(1, 4096);
        let driver = Arc::new(SoftDriver::new(config));
        let device = Device::new(driver, DeviceConfig::default().strict_protocol(false));
        let err = DeviceMemory::allocate(
            &device,
            8192,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
            any_type(256),
        )
        .unwrap_err();
        assert_eq!(err.vk_result(), Some(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY));
    }

    #[test]
    #[should_panic(expected = "protocol violation")]
    fn strict_devices_panic_on_violations() {
        let driver = Arc::new(SoftDriver::default());
        let device = Device::new(driver, DeviceConfig::default().strict_protocol(true));
        let mut memory =
            DeviceMemory::allocate(&device, 0, vk::MemoryPropertyFlags::DEVICE_LOCAL, any_type(256))
                .unwrap();
        let _ = memory.map();
    }
}
