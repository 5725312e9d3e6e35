//! Images with a default view, tracked layouts and mip generation.
//!
//! The host keeps the current layout of every mip level. Layout-changing
//! commands update it at record time, so the tracked layout describes the
//! image as it will be once everything recorded so far has executed.

use crate::buffer::{Buffer, BufferDesc};
use crate::command::{execute_single_time_commands, CommandPool, CommandRecorder, QueueCapability};
use crate::device::Device;
use crate::driver::{ImageInfo, ViewInfo};
use crate::error::{GpuError, ProtocolViolation, Result};
use crate::format;
use crate::memory::{DeviceMemory, MemoryBinding};
use crate::queue::Queue;
use crate::sharing::{Ownership, Sharing, SharingMode};
use ash::vk;

/// Stages that read textures in their steady layout.
const SHADER_STAGES: vk::PipelineStageFlags = vk::PipelineStageFlags::from_raw(
    vk::PipelineStageFlags::FRAGMENT_SHADER.as_raw()
        | vk::PipelineStageFlags::COMPUTE_SHADER.as_raw(),
);

/// Texture creation parameters.
#[derive(Debug, Clone)]
pub struct TextureDesc {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    /// Array layers. Six square layers make a cube map.
    pub layers: u32,
    /// Mip levels. Zero means the full chain down to 1x1.
    pub mip_levels: u32,
    pub format: vk::Format,
    /// Layout the texture settles in after uploads and mip generation.
    pub layout: vk::ImageLayout,
    pub usage: vk::ImageUsageFlags,
    pub tiling: vk::ImageTiling,
    pub memory_properties: vk::MemoryPropertyFlags,
    /// View aspect. `None` derives it from the format.
    pub aspect: Option<vk::ImageAspectFlags>,
    pub queue_families: Vec<u32>,
}

impl Default for TextureDesc {
    fn default() -> Self {
        Self {
            width: 0,
            height: 0,
            depth: 1,
            layers: 1,
            mip_levels: 1,
            format: vk::Format::UNDEFINED,
            layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            usage: vk::ImageUsageFlags::empty(),
            tiling: vk::ImageTiling::OPTIMAL,
            memory_properties: vk::MemoryPropertyFlags::DEVICE_LOCAL,
            aspect: None,
            queue_families: Vec::new(),
        }
    }
}

impl TextureDesc {
    /// A single-level 2D texture.
    pub fn new_2d(width: u32, height: u32, format: vk::Format) -> Self {
        Self {
            width,
            height,
            format,
            ..Self::default()
        }
    }

    pub fn usage(mut self, usage: vk::ImageUsageFlags) -> Self {
        self.usage = usage;
        self
    }

    pub fn layers(mut self, layers: u32) -> Self {
        self.layers = layers;
        self
    }

    pub fn depth(mut self, depth: u32) -> Self {
        self.depth = depth;
        self
    }

    pub fn mip_levels(mut self, mip_levels: u32) -> Self {
        self.mip_levels = mip_levels;
        self
    }

    pub fn full_mip_chain(self) -> Self {
        self.mip_levels(0)
    }

    pub fn layout(mut self, layout: vk::ImageLayout) -> Self {
        self.layout = layout;
        self
    }

    pub fn tiling(mut self, tiling: vk::ImageTiling) -> Self {
        self.tiling = tiling;
        self
    }

    pub fn memory_properties(mut self, properties: vk::MemoryPropertyFlags) -> Self {
        self.memory_properties = properties;
        self
    }

    pub fn aspect(mut self, aspect: vk::ImageAspectFlags) -> Self {
        self.aspect = Some(aspect);
        self
    }

    /// Register a family that will use the texture.
    pub fn shared_with(mut self, family: u32) -> Self {
        self.queue_families.push(family);
        self
    }
}

/// A copy between a buffer and one mip level of a texture.
///
/// Zero extent components extend to the end of the mip level, a zero layer
/// count covers every layer from `base_layer` on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferTextureCopy {
    pub buffer_offset: u64,
    pub mip_level: u32,
    pub base_layer: u32,
    pub layer_count: u32,
    pub offset: vk::Offset3D,
    pub extent: vk::Extent3D,
}

impl BufferTextureCopy {
    /// Whole mip level, all layers.
    pub fn level(mip_level: u32) -> Self {
        Self {
            mip_level,
            ..Self::default()
        }
    }
}

/// Access mask matching work that uses an image in `layout`.
pub fn access_mask(layout: vk::ImageLayout) -> vk::AccessFlags {
    match layout {
        vk::ImageLayout::UNDEFINED | vk::ImageLayout::PRESENT_SRC_KHR => vk::AccessFlags::empty(),
        vk::ImageLayout::PREINITIALIZED => vk::AccessFlags::HOST_WRITE,
        vk::ImageLayout::TRANSFER_DST_OPTIMAL => vk::AccessFlags::TRANSFER_WRITE,
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL => vk::AccessFlags::TRANSFER_READ,
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL => vk::AccessFlags::SHADER_READ,
        vk::ImageLayout::GENERAL => vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE,
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL => {
            vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE
        }
        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL => {
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE
        }
        vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL => {
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ | vk::AccessFlags::SHADER_READ
        }
        _ => vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE,
    }
}

/// An image, its memory and a view over every level and layer.
pub struct Texture {
    device: Device,
    image: vk::Image,
    view: vk::ImageView,
    extent: vk::Extent3D,
    layers: u32,
    mip_levels: u32,
    format: vk::Format,
    aspect: vk::ImageAspectFlags,
    usage: vk::ImageUsageFlags,
    tiling: vk::ImageTiling,
    flags: vk::ImageCreateFlags,
    steady_layout: vk::ImageLayout,
    memory_properties: vk::MemoryPropertyFlags,
    layouts: Vec<vk::ImageLayout>,
    sharing: Sharing,
    requirements: vk::MemoryRequirements,
    binding: MemoryBinding,
    destroyed: bool,
}

impl std::fmt::Debug for Texture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Texture")
            .field("image", &self.image)
            .field("extent", &self.extent)
            .field("layers", &self.layers)
            .field("mip_levels", &self.mip_levels)
            .field("format", &self.format)
            .field("layouts", &self.layouts)
            .finish()
    }
}

impl Texture {
    /// Create a texture, allocate memory for it, bind it and create its view.
    pub fn create(device: &Device, desc: &TextureDesc) -> Result<Self> {
        if desc.memory_properties.is_empty() {
            return device.violation(ProtocolViolation::MissingMemoryProperties);
        }
        let mut texture = Self::create_unbound(device, desc)?;

        let memory = match DeviceMemory::allocate(
            device,
            texture.requirements.size,
            desc.memory_properties,
            texture.requirements,
        ) {
            Ok(memory) => memory,
            Err(err) => {
                texture.destroy_image_only();
                return Err(err);
            }
        };
        let result = unsafe {
            device
                .driver()
                .bind_image_memory(texture.image, memory.handle(), 0)
        };
        if let Err(err) = device.check(result, "binding image memory") {
            texture.destroy_image_only();
            drop(memory);
            return Err(err);
        }
        texture.binding = MemoryBinding::Owned(memory);

        if let Err(err) = texture.create_view() {
            texture.binding = MemoryBinding::Unbound;
            texture.destroy_image_only();
            return Err(err);
        }

        tracing::debug!(
            width = desc.width,
            height = desc.height,
            layers = texture.layers,
            mip_levels = texture.mip_levels,
            format = ?desc.format,
            "created texture"
        );
        Ok(texture)
    }

    /// Create the image without memory. It becomes usable once
    /// [`bind_memory`](Self::bind_memory) succeeds.
    pub fn create_unbound(device: &Device, desc: &TextureDesc) -> Result<Self> {
        device.ensure_alive("creating texture")?;
        if desc.width == 0 || desc.height == 0 || desc.depth == 0 {
            return device.violation(ProtocolViolation::ZeroSized {
                what: "texture extent",
            });
        }
        if desc.layers == 0 {
            return device.violation(ProtocolViolation::ZeroSized {
                what: "texture layer count",
            });
        }
        if desc.format == vk::Format::UNDEFINED {
            return device.violation(ProtocolViolation::UndefinedFormat);
        }
        if desc.usage.is_empty() {
            return device.violation(ProtocolViolation::MissingUsage);
        }
        if matches!(
            desc.layout,
            vk::ImageLayout::UNDEFINED | vk::ImageLayout::PREINITIALIZED
        ) {
            return device.violation(ProtocolViolation::InvalidSteadyLayout {
                layout: desc.layout,
            });
        }

        let extent = vk::Extent3D {
            width: desc.width,
            height: desc.height,
            depth: desc.depth,
        };
        let full_chain = format::full_mip_chain(desc.width, desc.height, desc.depth);
        let mip_levels = if desc.mip_levels == 0 {
            full_chain
        } else {
            desc.mip_levels.min(full_chain)
        };
        let flags = if desc.layers == 6 && desc.width == desc.height && desc.depth == 1 {
            vk::ImageCreateFlags::CUBE_COMPATIBLE
        } else {
            vk::ImageCreateFlags::empty()
        };
        let image_type = if desc.depth > 1 {
            vk::ImageType::TYPE_3D
        } else {
            vk::ImageType::TYPE_2D
        };

        let sharing = Sharing::from_families(&desc.queue_families);
        let (sharing_mode, queue_families) = sharing.vk_mode();
        let info = ImageInfo {
            image_type,
            extent,
            format: desc.format,
            mip_levels,
            array_layers: desc.layers,
            tiling: desc.tiling,
            usage: desc.usage,
            flags,
            sharing_mode,
            queue_families,
        };
        let result = unsafe { device.driver().create_image(&info) };
        let image = device.check(result, "creating image")?;
        let requirements = unsafe { device.driver().image_memory_requirements(image) };

        Ok(Self {
            device: device.clone(),
            image,
            view: vk::ImageView::null(),
            extent,
            layers: desc.layers,
            mip_levels,
            format: desc.format,
            aspect: desc.aspect.unwrap_or_else(|| format::aspect_mask(desc.format)),
            usage: desc.usage,
            tiling: desc.tiling,
            flags,
            steady_layout: desc.layout,
            memory_properties: desc.memory_properties,
            layouts: vec![vk::ImageLayout::UNDEFINED; mip_levels as usize],
            sharing,
            requirements,
            binding: MemoryBinding::Unbound,
            destroyed: false,
        })
    }

    /// Bind caller-owned memory at `offset` and create the view.
    pub fn bind_memory(&mut self, memory: &DeviceMemory, offset: u64) -> Result<()> {
        self.ensure_live()?;
        if self.binding.is_bound() {
            return self
                .device
                .violation(ProtocolViolation::AlreadyBound { kind: "texture" });
        }
        self.device.protocol(MemoryBinding::check_external(
            memory,
            offset,
            &self.requirements,
        ))?;
        let result = unsafe {
            self.device
                .driver()
                .bind_image_memory(self.image, memory.handle(), offset)
        };
        self.device.check(result, "binding image memory")?;
        self.binding = MemoryBinding::External {
            memory: memory.handle(),
            offset,
        };
        self.create_view()
    }

    fn create_view(&mut self) -> Result<()> {
        let view_type = if self.flags.contains(vk::ImageCreateFlags::CUBE_COMPATIBLE) {
            vk::ImageViewType::CUBE
        } else if self.extent.depth > 1 {
            vk::ImageViewType::TYPE_3D
        } else if self.layers > 1 {
            vk::ImageViewType::TYPE_2D_ARRAY
        } else {
            vk::ImageViewType::TYPE_2D
        };
        let info = ViewInfo {
            image: self.image,
            view_type,
            format: self.format,
            range: self.full_range(),
        };
        let result = unsafe { self.device.driver().create_image_view(&info) };
        self.view = self.device.check(result, "creating image view")?;
        Ok(())
    }

    fn destroy_image_only(&mut self) {
        unsafe { self.device.driver().destroy_image(self.image) };
        self.destroyed = true;
    }

    /// Get the raw image handle.
    pub fn handle(&self) -> vk::Image {
        self.image
    }

    /// Get the default view.
    pub fn view(&self) -> vk::ImageView {
        self.view
    }

    pub fn extent(&self) -> vk::Extent3D {
        self.extent
    }

    pub fn width(&self) -> u32 {
        self.extent.width
    }

    pub fn height(&self) -> u32 {
        self.extent.height
    }

    pub fn layers(&self) -> u32 {
        self.layers
    }

    pub fn mip_levels(&self) -> u32 {
        self.mip_levels
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }

    pub fn aspect(&self) -> vk::ImageAspectFlags {
        self.aspect
    }

    pub fn usage(&self) -> vk::ImageUsageFlags {
        self.usage
    }

    pub fn tiling(&self) -> vk::ImageTiling {
        self.tiling
    }

    pub fn is_cube(&self) -> bool {
        self.flags.contains(vk::ImageCreateFlags::CUBE_COMPATIBLE)
    }

    /// Layout the texture settles in.
    pub fn steady_layout(&self) -> vk::ImageLayout {
        self.steady_layout
    }

    /// Tracked layout of mip level 0.
    pub fn layout(&self) -> vk::ImageLayout {
        self.layouts[0]
    }

    /// Tracked layout of one mip level.
    pub fn mip_layout(&self, level: u32) -> Option<vk::ImageLayout> {
        self.layouts.get(level as usize).copied()
    }

    /// Tracked layouts of all mip levels.
    pub fn layouts(&self) -> &[vk::ImageLayout] {
        &self.layouts
    }

    pub fn memory_properties(&self) -> vk::MemoryPropertyFlags {
        self.memory_properties
    }

    pub fn memory_requirements(&self) -> vk::MemoryRequirements {
        self.requirements
    }

    /// Memory allocated together with the texture.
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

    /// Extent of a mip level.
    pub fn mip_extent(&self, level: u32) -> vk::Extent3D {
        format::mip_extent(self.extent, level)
    }

    /// Every level and layer.
    pub fn full_range(&self) -> vk::ImageSubresourceRange {
        self.range(0, self.mip_levels)
    }

    fn range(&self, base_level: u32, level_count: u32) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange {
            aspect_mask: self.aspect,
            base_mip_level: base_level,
            level_count,
            base_array_layer: 0,
            layer_count: self.layers,
        }
    }

    /// Aspect usable in copies and blits, which take a single aspect.
    fn copy_aspect(&self) -> vk::ImageAspectFlags {
        if self.aspect.contains(vk::ImageAspectFlags::DEPTH) {
            vk::ImageAspectFlags::DEPTH
        } else {
            self.aspect
        }
    }

    fn ensure_live(&self) -> Result<()> {
        if self.destroyed {
            return self
                .device
                .violation(ProtocolViolation::UseAfterDestroy { kind: "texture" });
        }
        Ok(())
    }

    /// Fails unless the texture is live and bound.
    pub(crate) fn ensure_usable(&self) -> Result<()> {
        self.ensure_live()?;
        if !self.binding.is_bound() {
            return self
                .device
                .violation(ProtocolViolation::Unbound { kind: "texture" });
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
        usage: vk::ImageUsageFlags,
        name: &'static str,
    ) -> Result<()> {
        if !self.usage.contains(usage) {
            return self.device.violation(ProtocolViolation::MissingUsageFlag {
                kind: "texture",
                required: name,
            });
        }
        Ok(())
    }

    /// Fail unless `level` is in one of `allowed`.
    fn expect_layout(&self, level: u32, allowed: &[vk::ImageLayout]) -> Result<vk::ImageLayout> {
        let actual = self.layouts[level as usize];
        if !allowed.contains(&actual) {
            return self.device.violation(ProtocolViolation::LayoutMismatch {
                level,
                expected: allowed[0],
                actual,
            });
        }
        Ok(actual)
    }

    /// Validate a buffer copy region and resolve it against this texture.
    ///
    /// Returns the Vulkan region, the layout to use, and the number of
    /// buffer bytes it covers when the format size is known.
    pub(crate) fn resolve_copy(
        &self,
        region: &BufferTextureCopy,
        allowed: &[vk::ImageLayout],
    ) -> Result<(vk::BufferImageCopy, vk::ImageLayout, Option<u64>)> {
        let layer_count = if region.layer_count == 0 {
            self.layers.saturating_sub(region.base_layer)
        } else {
            region.layer_count
        };
        let layers_ok = layer_count > 0
            && region
                .base_layer
                .checked_add(layer_count)
                .is_some_and(|end| end <= self.layers);
        if region.mip_level >= self.mip_levels || !layers_ok {
            return self.device.violation(ProtocolViolation::SubresourceOutOfRange {
                level: region.mip_level,
                base_layer: region.base_layer,
                layer_count,
            });
        }

        let mip = self.mip_extent(region.mip_level);
        let origin = region.offset;
        if origin.x < 0 || origin.y < 0 || origin.z < 0 {
            return self.device.violation(ProtocolViolation::SubresourceOutOfRange {
                level: region.mip_level,
                base_layer: region.base_layer,
                layer_count,
            });
        }
        let (x, y, z) = (origin.x as u32, origin.y as u32, origin.z as u32);
        let resolve = |requested: u32, start: u32, limit: u32| {
            if requested == 0 {
                limit.saturating_sub(start)
            } else {
                requested
            }
        };
        let extent = vk::Extent3D {
            width: resolve(region.extent.width, x, mip.width),
            height: resolve(region.extent.height, y, mip.height),
            depth: resolve(region.extent.depth, z, mip.depth),
        };
        let fits = extent.width > 0
            && extent.height > 0
            && extent.depth > 0
            && x.checked_add(extent.width).is_some_and(|end| end <= mip.width)
            && y.checked_add(extent.height).is_some_and(|end| end <= mip.height)
            && z.checked_add(extent.depth).is_some_and(|end| end <= mip.depth);
        if !fits {
            return self.device.violation(ProtocolViolation::OutOfBounds {
                offset: u64::from(x),
                size: u64::from(extent.width),
                limit: u64::from(mip.width),
            });
        }

        let layout = self.expect_layout(region.mip_level, allowed)?;
        let bytes = format::texel_size(self.format).map(|texel| {
            u64::from(texel)
                * u64::from(extent.width)
                * u64::from(extent.height)
                * u64::from(extent.depth)
                * u64::from(layer_count)
        });
        let copy = vk::BufferImageCopy {
            buffer_offset: region.buffer_offset,
            buffer_row_length: 0,
            buffer_image_height: 0,
            image_subresource: vk::ImageSubresourceLayers {
                aspect_mask: self.copy_aspect(),
                mip_level: region.mip_level,
                base_array_layer: region.base_layer,
                layer_count,
            },
            image_offset: origin,
            image_extent: extent,
        };
        Ok((copy, layout, bytes))
    }

    fn layout_barrier(
        &self,
        base_level: u32,
        level_count: u32,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
    ) -> vk::ImageMemoryBarrier<'static> {
        vk::ImageMemoryBarrier::default()
            .src_access_mask(access_mask(old_layout))
            .dst_access_mask(access_mask(new_layout))
            .old_layout(old_layout)
            .new_layout(new_layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(self.image)
            .subresource_range(self.range(base_level, level_count))
    }

    /// Group consecutive levels sharing a layout into one barrier each.
    fn grouped_barriers(
        &self,
        base_level: u32,
        level_count: u32,
        new_layout: vk::ImageLayout,
    ) -> Vec<vk::ImageMemoryBarrier<'static>> {
        let mut barriers = Vec::new();
        let end = base_level + level_count;
        let mut start = base_level;
        while start < end {
            let old = self.layouts[start as usize];
            let mut stop = start + 1;
            while stop < end && self.layouts[stop as usize] == old {
                stop += 1;
            }
            barriers.push(self.layout_barrier(start, stop - start, old, new_layout));
            start = stop;
        }
        barriers
    }

    /// Transition every mip level to `new_layout`.
    pub fn cmd_transition_layout(
        &mut self,
        recorder: &mut CommandRecorder,
        new_layout: vk::ImageLayout,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
    ) -> Result<()> {
        self.cmd_transition_levels(recorder, 0, self.mip_levels, new_layout, src_stage, dst_stage)
    }

    /// Transition `level_count` levels starting at `base_level`.
    pub fn cmd_transition_levels(
        &mut self,
        recorder: &mut CommandRecorder,
        base_level: u32,
        level_count: u32,
        new_layout: vk::ImageLayout,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
    ) -> Result<()> {
        let cmd = recorder.recording()?;
        self.ensure_usable()?;
        let in_range = level_count > 0
            && base_level
                .checked_add(level_count)
                .is_some_and(|end| end <= self.mip_levels);
        if !in_range {
            return self.device.violation(ProtocolViolation::SubresourceOutOfRange {
                level: base_level,
                base_layer: 0,
                layer_count: self.layers,
            });
        }
        if matches!(
            new_layout,
            vk::ImageLayout::UNDEFINED | vk::ImageLayout::PREINITIALIZED
        ) {
            return self.device.violation(ProtocolViolation::InvalidSteadyLayout {
                layout: new_layout,
            });
        }
        self.claim(recorder)?;

        let barriers = self.grouped_barriers(base_level, level_count, new_layout);
        unsafe {
            self.device
                .driver()
                .cmd_pipeline_barrier(cmd, src_stage, dst_stage, &[], &barriers);
        }
        for level in base_level..base_level + level_count {
            self.layouts[level as usize] = new_layout;
        }
        Ok(())
    }

    /// Transition every level to the steady layout for shader access.
    pub fn cmd_transition_to_steady(
        &mut self,
        recorder: &mut CommandRecorder,
        src_stage: vk::PipelineStageFlags,
    ) -> Result<()> {
        let steady = self.steady_layout;
        self.cmd_transition_layout(recorder, steady, src_stage, SHADER_STAGES)
    }

    /// Fill every level from level 0 by successive linear blits.
    ///
    /// Each source level ends in `SHADER_READ_ONLY_OPTIMAL` once it has been
    /// blitted from; the last level ends in the steady layout.
    ///
    /// All levels must be in `TRANSFER_DST_OPTIMAL`, the recorder's family
    /// must support graphics, and the format must support linear filtering.
    pub fn cmd_generate_mipmaps(&mut self, recorder: &mut CommandRecorder) -> Result<()> {
        let cmd = recorder.recording()?;
        self.ensure_usable()?;
        recorder.require(QueueCapability::Graphics)?;
        self.require_usage(
            vk::ImageUsageFlags::TRANSFER_SRC | vk::ImageUsageFlags::TRANSFER_DST,
            "TRANSFER_SRC | TRANSFER_DST",
        )?;

        let properties = self.device.format_properties(self.format);
        let features = if self.tiling == vk::ImageTiling::LINEAR {
            properties.linear_tiling_features
        } else {
            properties.optimal_tiling_features
        };
        let needed = vk::FormatFeatureFlags::SAMPLED_IMAGE_FILTER_LINEAR;
        if !features.contains(needed) {
            return Err(GpuError::UnsupportedFormat {
                format: self.format,
                features: needed,
            });
        }
        for level in 0..self.mip_levels {
            self.expect_layout(level, &[vk::ImageLayout::TRANSFER_DST_OPTIMAL])?;
        }
        self.claim(recorder)?;

        let driver = self.device.driver();
        let steady = self.steady_layout;
        let aspect = self.copy_aspect();

        for level in 1..self.mip_levels {
            let src = level - 1;
            let to_src = vk::ImageMemoryBarrier::default()
                .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                .dst_access_mask(vk::AccessFlags::TRANSFER_READ)
                .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                .new_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .image(self.image)
                .subresource_range(self.range(src, 1));
            unsafe {
                driver.cmd_pipeline_barrier(
                    cmd,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::PipelineStageFlags::TRANSFER,
                    &[],
                    &[to_src],
                );
            }

            let src_extent = self.mip_extent(src);
            let dst_extent = self.mip_extent(level);
            let blit = vk::ImageBlit {
                src_subresource: vk::ImageSubresourceLayers {
                    aspect_mask: aspect,
                    mip_level: src,
                    base_array_layer: 0,
                    layer_count: self.layers,
                },
                src_offsets: [
                    vk::Offset3D::default(),
                    vk::Offset3D {
                        x: src_extent.width as i32,
                        y: src_extent.height as i32,
                        z: src_extent.depth as i32,
                    },
                ],
                dst_subresource: vk::ImageSubresourceLayers {
                    aspect_mask: aspect,
                    mip_level: level,
                    base_array_layer: 0,
                    layer_count: self.layers,
                },
                dst_offsets: [
                    vk::Offset3D::default(),
                    vk::Offset3D {
                        x: dst_extent.width as i32,
                        y: dst_extent.height as i32,
                        z: dst_extent.depth as i32,
                    },
                ],
            };
            unsafe {
                driver.cmd_blit_image(
                    cmd,
                    self.image,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    self.image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[blit],
                    vk::Filter::LINEAR,
                );
            }

            let to_sampled = vk::ImageMemoryBarrier::default()
                .src_access_mask(vk::AccessFlags::TRANSFER_READ)
                .dst_access_mask(vk::AccessFlags::SHADER_READ)
                .old_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
                .new_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .image(self.image)
                .subresource_range(self.range(src, 1));
            unsafe {
                driver.cmd_pipeline_barrier(
                    cmd,
                    vk::PipelineStageFlags::TRANSFER,
                    SHADER_STAGES,
                    &[],
                    &[to_sampled],
                );
            }
            self.layouts[src as usize] = vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL;
        }

        let last = self.mip_levels - 1;
        let final_barrier = vk::ImageMemoryBarrier::default()
            .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
            .dst_access_mask(access_mask(steady))
            .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
            .new_layout(steady)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(self.image)
            .subresource_range(self.range(last, 1));
        unsafe {
            driver.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TRANSFER,
                SHADER_STAGES,
                &[],
                &[final_barrier],
            );
        }
        self.layouts[last as usize] = steady;
        Ok(())
    }

    /// Clear every level and layer to `color`.
    ///
    /// Levels must be in `TRANSFER_DST_OPTIMAL` or `GENERAL`.
    pub fn cmd_clear_color(
        &self,
        recorder: &mut CommandRecorder,
        color: vk::ClearColorValue,
    ) -> Result<()> {
        let cmd = recorder.recording()?;
        self.ensure_usable()?;
        if !recorder.family().supports_graphics() {
            recorder.require(QueueCapability::Compute)?;
        }
        self.require_usage(vk::ImageUsageFlags::TRANSFER_DST, "TRANSFER_DST")?;
        let allowed = [
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::GENERAL,
        ];
        for level in 0..self.mip_levels {
            self.expect_layout(level, &allowed)?;
        }
        self.claim(recorder)?;

        for level in 0..self.mip_levels {
            let layout = self.layouts[level as usize];
            unsafe {
                self.device.driver().cmd_clear_color_image(
                    cmd,
                    self.image,
                    layout,
                    &color,
                    &[self.range(level, 1)],
                );
            }
        }
        Ok(())
    }

    /// Copy a region of one mip level into `dst`.
    ///
    /// The level must be in `TRANSFER_SRC_OPTIMAL` or `GENERAL`.
    pub fn cmd_copy_to_buffer(
        &self,
        recorder: &mut CommandRecorder,
        dst: &Buffer,
        region: &BufferTextureCopy,
    ) -> Result<()> {
        let cmd = recorder.recording()?;
        recorder.require(QueueCapability::Transfer)?;
        self.ensure_usable()?;
        dst.ensure_usable()?;
        self.require_usage(vk::ImageUsageFlags::TRANSFER_SRC, "TRANSFER_SRC")?;
        dst.require_usage(vk::BufferUsageFlags::TRANSFER_DST, "TRANSFER_DST")?;

        let (copy, layout, bytes) = self.resolve_copy(
            region,
            &[
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                vk::ImageLayout::GENERAL,
            ],
        )?;
        if let Some(bytes) = bytes {
            dst.check_range(region.buffer_offset, bytes)?;
        }
        self.check_access(recorder)?;
        dst.check_access(recorder)?;
        self.claim(recorder)?;
        dst.claim(recorder)?;

        unsafe {
            self.device
                .driver()
                .cmd_copy_image_to_buffer(cmd, self.image, layout, dst.handle(), &[copy]);
        }
        Ok(())
    }

    /// Record the release half of an ownership transfer to `to_family`.
    ///
    /// Layouts are kept unchanged.
    pub fn cmd_release_ownership(
        &self,
        recorder: &mut CommandRecorder,
        to_family: u32,
        src_stage: vk::PipelineStageFlags,
    ) -> Result<()> {
        let cmd = recorder.recording()?;
        self.ensure_usable()?;
        let from = recorder.family().index;
        self.device.protocol(self.sharing.release(from, to_family))?;
        let barriers = self.ownership_barriers(from, to_family, true);
        unsafe {
            self.device.driver().cmd_pipeline_barrier(
                cmd,
                src_stage,
                vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                &[],
                &barriers,
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
    ) -> Result<()> {
        let cmd = recorder.recording()?;
        self.ensure_usable()?;
        let to = recorder.family().index;
        let from = self.device.protocol(self.sharing.acquire(to))?;
        let barriers = self.ownership_barriers(from, to, false);
        unsafe {
            self.device.driver().cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                dst_stage,
                &[],
                &barriers,
            );
        }
        Ok(())
    }

    fn ownership_barriers(
        &self,
        from: u32,
        to: u32,
        release: bool,
    ) -> Vec<vk::ImageMemoryBarrier<'static>> {
        self.grouped_barriers(0, self.mip_levels, vk::ImageLayout::UNDEFINED)
            .into_iter()
            .map(|barrier| {
                let layout = barrier.old_layout;
                let (src_access, dst_access) = if release {
                    (access_mask(layout), vk::AccessFlags::empty())
                } else {
                    (vk::AccessFlags::empty(), access_mask(layout))
                };
                barrier
                    .new_layout(layout)
                    .src_access_mask(src_access)
                    .dst_access_mask(dst_access)
                    .src_queue_family_index(from)
                    .dst_queue_family_index(to)
            })
            .collect()
    }

    /// Upload `data` to every layer of level 0 through a staging buffer and
    /// bring the texture to its steady layout, generating mips if it has
    /// more than one level. With mips, every level but the last ends in
    /// `SHADER_READ_ONLY_OPTIMAL`.
    ///
    /// Blocks until the upload completes.
    pub fn upload(&mut self, pool: &CommandPool, queue: &Queue, data: &[u8]) -> Result<()> {
        self.ensure_usable()?;
        let mut staging = Buffer::create(&self.device, &BufferDesc::staging(data.len() as u64))?;
        staging.write(0, data)?;

        execute_single_time_commands(pool, queue, |recorder| {
            self.cmd_transition_layout(
                recorder,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::PipelineStageFlags::TRANSFER,
            )?;
            staging.cmd_copy_to_texture(recorder, self, &BufferTextureCopy::level(0))?;
            if self.mip_levels > 1 {
                self.cmd_generate_mipmaps(recorder)
            } else {
                self.cmd_transition_to_steady(recorder, vk::PipelineStageFlags::TRANSFER)
            }
        })?;

        staging.destroy()
    }

    /// Destroy the view, the image and any memory allocated with it.
    pub fn destroy(&mut self) -> Result<()> {
        self.ensure_live()?;
        if self.binding.owned().is_some_and(DeviceMemory::is_mapped) {
            return self.device.violation(ProtocolViolation::FreeWhileMapped);
        }
        self.release()
    }

    fn release(&mut self) -> Result<()> {
        unsafe {
            if self.view != vk::ImageView::null() {
                self.device.driver().destroy_image_view(self.view);
            }
            self.device.driver().destroy_image(self.image);
        }
        self.destroyed = true;
        self.binding.release()
    }
}

impl Drop for Texture {
    fn drop(&mut self) {
        if !self.destroyed {
            if let Err(err) = self.release() {
                tracing::warn!(%err, "failed to release texture");
            }
        }
    }
}
