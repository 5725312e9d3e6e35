//! Physical device description: memory types, queue families and format
//! selection.

use ash::vk;

/// GPU vendor identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Apple,
    /// Software implementation without a PCI vendor.
    Software,
    Other(u32),
}

impl GpuVendor {
    /// Identify vendor from PCI vendor ID.
    pub fn from_vendor_id(id: u32) -> Self {
        match id {
            0x10DE => Self::Nvidia,
            0x1002 => Self::Amd,
            0x8086 => Self::Intel,
            0x106B => Self::Apple,
            0x10005 => Self::Software,
            other => Self::Other(other),
        }
    }
}

/// One queue family as exposed by the logical device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamily {
    /// Family index.
    pub index: u32,
    /// Capability flags.
    pub flags: vk::QueueFlags,
    /// Number of queues created on the logical device for this family.
    pub queue_count: u32,
    /// Whether the family can present to surfaces.
    pub supports_present: bool,
}

impl QueueFamily {
    pub fn supports_graphics(&self) -> bool {
        self.flags.contains(vk::QueueFlags::GRAPHICS)
    }

    pub fn supports_compute(&self) -> bool {
        self.flags.contains(vk::QueueFlags::COMPUTE)
    }

    /// Graphics and compute families implicitly support transfer.
    pub fn supports_transfer(&self) -> bool {
        self.flags.intersects(
            vk::QueueFlags::TRANSFER | vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE,
        )
    }

    pub fn supports_present(&self) -> bool {
        self.supports_present
    }
}

/// Static description of the physical device behind a [`Driver`](crate::Driver).
#[derive(Debug, Clone)]
pub struct PhysicalDevice {
    /// Device name
    pub name: String,
    /// GPU vendor
    pub vendor: GpuVendor,
    /// Device type
    pub device_type: vk::PhysicalDeviceType,
    /// Vulkan API version
    pub api_version: u32,
    /// Memory types and heaps
    pub memory: vk::PhysicalDeviceMemoryProperties,
    /// Queue families enabled on the logical device
    pub queue_families: Vec<QueueFamily>,
    /// Minimum alignment for mapped memory ranges
    pub non_coherent_atom_size: u64,
}

impl PhysicalDevice {
    /// Memory types as a slice.
    pub fn memory_types(&self) -> &[vk::MemoryType] {
        &self.memory.memory_types[..self.memory.memory_type_count as usize]
    }

    /// Memory heaps as a slice.
    pub fn memory_heaps(&self) -> &[vk::MemoryHeap] {
        &self.memory.memory_heaps[..self.memory.memory_heap_count as usize]
    }

    /// Lowest memory type index that is in `type_filter` and has all of
    /// `required`.
    pub fn find_memory_type_index(
        &self,
        type_filter: u32,
        required: vk::MemoryPropertyFlags,
    ) -> Option<u32> {
        self.memory_types()
            .iter()
            .enumerate()
            .find(|(index, memory_type)| {
                type_filter & (1 << index) != 0 && memory_type.property_flags.contains(required)
            })
            .map(|(index, _)| index as u32)
    }

    /// Look up a queue family by index.
    pub fn queue_family(&self, index: u32) -> Option<&QueueFamily> {
        self.queue_families.iter().find(|f| f.index == index)
    }

    /// First family with all of `flags`.
    pub fn find_queue_family(&self, flags: vk::QueueFlags) -> Option<&QueueFamily> {
        self.queue_families.iter().find(|f| f.flags.contains(flags))
    }

    /// Family with `flags` and as few other capabilities as possible.
    ///
    /// Used to find dedicated transfer or compute families.
    pub fn find_dedicated_queue_family(&self, flags: vk::QueueFlags) -> Option<&QueueFamily> {
        self.queue_families
            .iter()
            .filter(|f| f.flags.contains(flags))
            .min_by_key(|f| f.flags.as_raw().count_ones())
    }

    /// Device-local memory in MB.
    pub fn device_local_memory_mb(&self) -> u64 {
        self.memory_heaps()
            .iter()
            .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|heap| heap.size / (1024 * 1024))
            .sum()
    }

    /// Get a human-readable summary.
    pub fn summary(&self) -> String {
        format!(
            "{} ({:?}) - Vulkan {}.{}.{} - {} MB VRAM - {} queue families",
            self.name,
            self.vendor,
            vk::api_version_major(self.api_version),
            vk::api_version_minor(self.api_version),
            vk::api_version_patch(self.api_version),
            self.device_local_memory_mb(),
            self.queue_families.len(),
        )
    }
}

/// Pick the first candidate whose properties for `tiling` contain `features`.
pub fn select_format(
    candidates: &[vk::Format],
    tiling: vk::ImageTiling,
    features: vk::FormatFeatureFlags,
    properties: impl Fn(vk::Format) -> vk::FormatProperties,
) -> Option<vk::Format> {
    candidates.iter().copied().find(|&format| {
        let props = properties(format);
        match tiling {
            vk::ImageTiling::LINEAR => props.linear_tiling_features.contains(features),
            vk::ImageTiling::OPTIMAL => props.optimal_tiling_features.contains(features),
            _ => false,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device_with_types(types: &[vk::MemoryPropertyFlags]) -> PhysicalDevice {
        let mut memory = vk::PhysicalDeviceMemoryProperties::default();
        memory.memory_heap_count = 1;
        memory.memory_heaps[0] = vk::MemoryHeap {
            size: 2048 * 1024 * 1024,
            flags: vk::MemoryHeapFlags::DEVICE_LOCAL,
        };
        memory.memory_type_count = types.len() as u32;
        for (i, flags) in types.iter().enumerate() {
            memory.memory_types[i] = vk::MemoryType {
                property_flags: *flags,
                heap_index: 0,
            };
        }
        PhysicalDevice {
            name: "test".into(),
            vendor: GpuVendor::Software,
            device_type: vk::PhysicalDeviceType::CPU,
            api_version: vk::API_VERSION_1_3,
            memory,
            queue_families: vec![
                QueueFamily {
                    index: 0,
                    flags: vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE,
                    queue_count: 1,
                    supports_present: true,
                },
                QueueFamily {
                    index: 1,
                    flags: vk::QueueFlags::TRANSFER,
                    queue_count: 2,
                    supports_present: false,
                },
            ],
            non_coherent_atom_size: 64,
        }
    }

    #[test]
    fn vendor_identification() {
        assert_eq!(GpuVendor::from_vendor_id(0x10DE), GpuVendor::Nvidia);
        assert_eq!(GpuVendor::from_vendor_id(0x1002), GpuVendor::Amd);
        assert_eq!(GpuVendor::from_vendor_id(0x8086), GpuVendor::Intel);
        assert_eq!(GpuVendor::from_vendor_id(0x1234), GpuVendor::Other(0x1234));
    }

    #[test]
    fn memory_type_respects_filter_and_properties() {
        let device = device_with_types(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        ]);
        let host = vk::MemoryPropertyFlags::HOST_VISIBLE;
        assert_eq!(device.find_memory_type_index(0b11, host), Some(1));
        assert_eq!(device.find_memory_type_index(0b01, host), None);
        assert_eq!(
            device.find_memory_type_index(0b11, vk::MemoryPropertyFlags::DEVICE_LOCAL),
            Some(0)
        );
    }

    #[test]
    fn dedicated_family_prefers_fewest_capabilities() {
        let device = device_with_types(&[vk::MemoryPropertyFlags::DEVICE_LOCAL]);
        let transfer = device
            .find_dedicated_queue_family(vk::QueueFlags::TRANSFER)
            .unwrap();
        assert_eq!(transfer.index, 1);
        assert!(device.queue_family(0).unwrap().supports_transfer());
        assert!(device.summary().contains("2048 MB"));
    }

    #[test]
    fn format_selection_uses_tiling() {
        let props = |format: vk::Format| {
            if format == vk::Format::D24_UNORM_S8_UINT {
                vk::FormatProperties {
                    optimal_tiling_features: vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT,
                    ..Default::default()
                }
            } else {
                vk::FormatProperties::default()
            }
        };
        let features = vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT;
        let candidates = [vk::Format::D32_SFLOAT, vk::Format::D24_UNORM_S8_UINT];
        assert_eq!(
            select_format(&candidates, vk::ImageTiling::OPTIMAL, features, props),
            Some(vk::Format::D24_UNORM_S8_UINT)
        );
        assert_eq!(
            select_format(&candidates, vk::ImageTiling::LINEAR, features, props),
            None
        );
    }
}
