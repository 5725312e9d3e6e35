//! Host-side compute kernels standing in for shaders.

use ash::vk;
use std::sync::Arc;

/// Maximum push constant range, matching the guaranteed Vulkan minimum.
pub const MAX_PUSH_CONSTANTS: usize = 128;

/// A kernel registered with [`SoftDriver::create_kernel`](super::SoftDriver::create_kernel).
pub type Kernel = Arc<dyn Fn(&mut KernelContext<'_>) + Send + Sync>;

/// A resource bound to a software descriptor set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SoftBinding {
    /// Level 0, layer 0 of an image in `GENERAL` layout.
    StorageImage(vk::Image),
    StorageBuffer(vk::Buffer),
}

/// Copy of a storage image handed to a kernel.
#[derive(Debug, Clone)]
pub struct KernelImage {
    pub width: u32,
    pub height: u32,
    pub format: vk::Format,
    pub texel_size: u32,
    /// Tightly packed rows.
    pub data: Vec<u8>,
}

impl KernelImage {
    fn index(&self, x: u32, y: u32) -> Option<usize> {
        (x < self.width && y < self.height)
            .then(|| ((y * self.width + x) * self.texel_size) as usize)
    }

    pub fn texel(&self, x: u32, y: u32) -> Option<&[u8]> {
        let start = self.index(x, y)?;
        self.data.get(start..start + self.texel_size as usize)
    }

    /// Write one texel. Out-of-range coordinates are ignored, like a shader
    /// store past the edge.
    pub fn write_texel(&mut self, x: u32, y: u32, texel: &[u8]) {
        let size = self.texel_size as usize;
        if let Some(start) = self.index(x, y) {
            let len = texel.len().min(size);
            self.data[start..start + len].copy_from_slice(&texel[..len]);
        }
    }
}

/// Everything a kernel sees during one dispatch.
#[derive(Debug)]
pub struct KernelContext<'a> {
    pub workgroups: [u32; 3],
    pub push_constants: &'a [u8],
    /// Storage images in binding order across the bound sets.
    pub images: Vec<KernelImage>,
    /// Storage buffers in binding order across the bound sets.
    pub buffers: Vec<Vec<u8>>,
}

impl KernelContext<'_> {
    /// Read a push constant value at `offset`.
    pub fn push_constant<T: bytemuck::Pod>(&self, offset: usize) -> Option<T> {
        let bytes = self
            .push_constants
            .get(offset..offset + std::mem::size_of::<T>())?;
        Some(bytemuck::pod_read_unaligned(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn texel_access_is_bounds_checked() {
        let mut image = KernelImage {
            width: 2,
            height: 2,
            format: vk::Format::R8G8B8A8_UNORM,
            texel_size: 4,
            data: vec![0; 16],
        };
        image.write_texel(1, 1, &[1, 2, 3, 4]);
        image.write_texel(2, 0, &[9, 9, 9, 9]);
        assert_eq!(image.texel(1, 1), Some(&[1, 2, 3, 4][..]));
        assert_eq!(image.texel(0, 2), None);
        assert_eq!(image.data.iter().filter(|b| **b == 9).count(), 0);
    }

    #[test]
    fn push_constants_read_unaligned() {
        let data = [0u8, 7, 0, 0, 0, 1, 0, 0, 0];
        let ctx = KernelContext {
            workgroups: [1, 1, 1],
            push_constants: &data,
            images: Vec::new(),
            buffers: Vec::new(),
        };
        assert_eq!(ctx.push_constant::<u32>(1), Some(7));
        assert_eq!(ctx.push_constant::<u32>(6), None);
    }
}
