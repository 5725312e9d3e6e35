//! Queue scheduling and command execution for the software device.

use super::kernel::{KernelContext, KernelImage, SoftBinding};
use super::state::{Bindings, ImageBarrier, QueueOp, SoftCommand, SoftState};
use super::{Diagnostic, TraceEvent};
use ash::vk;
use ash::vk::Handle;

impl SoftState {
    /// Run the first ready operation of any queue, in queue creation order.
    ///
    /// Returns false when no queue can make progress.
    pub fn step(&mut self) -> bool {
        let ready = self.queue_order.iter().copied().find(|queue| {
            self.queues
                .get(queue)
                .and_then(|q| q.ops.front())
                .is_some_and(|op| self.op_ready(op))
        });
        let Some(queue) = ready else {
            return false;
        };
        let Some((family, op)) = self
            .queues
            .get_mut(&queue)
            .and_then(|q| q.ops.pop_front().map(|op| (q.family, op)))
        else {
            return false;
        };
        self.run_op(family, op);
        true
    }

    /// Step until `done` holds or nothing can run. Returns `done`'s final
    /// value.
    pub fn run_until(&mut self, done: impl Fn(&Self) -> bool) -> bool {
        loop {
            if done(self) {
                return true;
            }
            if !self.step() {
                return false;
            }
        }
    }

    /// Run everything that can run.
    pub fn drain(&mut self) {
        while self.step() {}
    }

    /// Record a stall for every queue still holding work.
    pub fn report_stall(&mut self) {
        let stalled: Vec<u32> = self
            .queue_order
            .iter()
            .filter_map(|q| self.queues.get(q))
            .filter(|q| !q.ops.is_empty())
            .map(|q| q.family)
            .collect();
        for family in stalled {
            self.diagnose(Diagnostic::QueueStalled { family });
        }
    }

    pub fn pending_operations(&self) -> usize {
        self.queues.values().map(|q| q.ops.len()).sum()
    }

    fn op_ready(&self, op: &QueueOp) -> bool {
        let signalled = |semaphore: &vk::Semaphore| {
            // A destroyed semaphore cannot block; running the op reports it.
            self.semaphores.get(semaphore).copied().unwrap_or(true)
        };
        match op {
            QueueOp::Batch { waits, .. } | QueueOp::Present { waits, .. } => {
                waits.iter().all(signalled)
            }
            QueueOp::SignalFence(_) => true,
        }
    }

    fn consume_waits(&mut self, waits: &[vk::Semaphore]) {
        for semaphore in waits {
            match self.semaphores.get_mut(semaphore) {
                Some(signalled) => *signalled = false,
                None => self.diagnose(Diagnostic::UseOfDestroyedObject {
                    kind: "semaphore",
                    handle: semaphore.as_raw(),
                }),
            }
        }
    }

    fn run_op(&mut self, family: u32, op: QueueOp) {
        match op {
            QueueOp::Batch {
                waits,
                command_buffers,
                commands,
                signals,
            } => {
                self.consume_waits(&waits);
                self.trace.push(TraceEvent::Submit {
                    family,
                    command_buffers: command_buffers.len(),
                });
                for buffer in &command_buffers {
                    if !self.command_buffers.contains_key(buffer) {
                        self.diagnose(Diagnostic::UseOfDestroyedObject {
                            kind: "command buffer",
                            handle: buffer.as_raw(),
                        });
                    }
                }
                for list in &commands {
                    let mut bindings = Bindings::default();
                    for command in list {
                        self.execute(family, &mut bindings, command);
                    }
                }
                for semaphore in signals {
                    match self.semaphores.get_mut(&semaphore) {
                        Some(signalled) if *signalled => {
                            self.diagnose(Diagnostic::SemaphoreDoubleSignal { semaphore });
                        }
                        Some(signalled) => *signalled = true,
                        None => self.diagnose(Diagnostic::UseOfDestroyedObject {
                            kind: "semaphore",
                            handle: semaphore.as_raw(),
                        }),
                    }
                }
            }
            QueueOp::SignalFence(fence) => match self.fences.get_mut(&fence) {
                Some(signalled) => {
                    *signalled = true;
                    self.trace.push(TraceEvent::SignalFence(fence));
                }
                None => self.diagnose(Diagnostic::UseOfDestroyedObject {
                    kind: "fence",
                    handle: fence.as_raw(),
                }),
            },
            QueueOp::Present { waits, images } => {
                self.consume_waits(&waits);
                for (swapchain, image_index) in images {
                    match self.swapchains.get_mut(&swapchain) {
                        Some(chain) => {
                            chain.available.push_back(image_index);
                            self.trace.push(TraceEvent::Present {
                                swapchain,
                                image_index,
                            });
                        }
                        None => self.diagnose(Diagnostic::UseOfDestroyedObject {
                            kind: "swapchain",
                            handle: swapchain.as_raw(),
                        }),
                    }
                }
            }
        }
    }

    fn destroyed(&mut self, kind: &'static str, raw: u64) {
        self.diagnose(Diagnostic::UseOfDestroyedObject { kind, handle: raw });
    }

    fn execute(&mut self, family: u32, bindings: &mut Bindings, command: &SoftCommand) {
        match command {
            SoftCommand::Barrier { buffers, images } => {
                for barrier in buffers {
                    if !self.buffers.contains_key(&barrier.buffer) {
                        self.destroyed("buffer", barrier.buffer.as_raw());
                        continue;
                    }
                    self.trace.push(TraceEvent::BufferBarrier {
                        buffer: barrier.buffer,
                        src_family: barrier.src_family,
                        dst_family: barrier.dst_family,
                    });
                }
                for barrier in images {
                    self.image_barrier(barrier);
                }
            }
            SoftCommand::CopyBuffer { src, dst, regions } => {
                if !self.buffers.contains_key(src) {
                    return self.destroyed("buffer", src.as_raw());
                }
                if !self.buffers.contains_key(dst) {
                    return self.destroyed("buffer", dst.as_raw());
                }
                let mut bytes = 0;
                for region in regions {
                    let copied = self
                        .read_buffer(*src, region.src_offset, region.size)
                        .is_some_and(|data| self.write_buffer(*dst, region.dst_offset, &data));
                    if copied {
                        bytes += region.size;
                    } else {
                        self.diagnose(Diagnostic::OutOfBounds {
                            what: "buffer copy",
                        });
                    }
                }
                self.trace.push(TraceEvent::CopyBuffer {
                    src: *src,
                    dst: *dst,
                    bytes,
                });
            }
            SoftCommand::CopyBufferToImage {
                src,
                dst,
                layout,
                regions,
            } => {
                if !self.buffers.contains_key(src) {
                    return self.destroyed("buffer", src.as_raw());
                }
                for region in regions {
                    self.copy_buffer_to_image(*src, *dst, *layout, region);
                }
            }
            SoftCommand::CopyImageToBuffer {
                src,
                layout,
                dst,
                regions,
            } => {
                if !self.buffers.contains_key(dst) {
                    return self.destroyed("buffer", dst.as_raw());
                }
                for region in regions {
                    self.copy_image_to_buffer(*src, *layout, *dst, region);
                }
            }
            SoftCommand::Blit {
                src,
                src_layout,
                dst,
                dst_layout,
                regions,
            } => {
                for region in regions {
                    self.blit(*src, *src_layout, *dst, *dst_layout, region);
                }
            }
            SoftCommand::Fill {
                buffer,
                offset,
                size,
                data,
            } => self.fill(*buffer, *offset, *size, *data),
            SoftCommand::Clear {
                image,
                layout,
                color,
                ranges,
            } => {
                for range in ranges {
                    self.clear(*image, *layout, *color, range);
                }
            }
            SoftCommand::BindPipeline(pipeline) => bindings.pipeline = Some(*pipeline),
            SoftCommand::BindDescriptorSets { first_set, sets } => {
                let first = *first_set as usize;
                if bindings.sets.len() < first + sets.len() {
                    bindings
                        .sets
                        .resize(first + sets.len(), vk::DescriptorSet::null());
                }
                bindings.sets[first..first + sets.len()].copy_from_slice(sets);
            }
            SoftCommand::PushConstants { offset, data } => {
                let start = *offset as usize;
                match bindings.push_constants.get_mut(start..start + data.len()) {
                    Some(dst) => dst.copy_from_slice(data),
                    None => self.diagnose(Diagnostic::OutOfBounds {
                        what: "push constants",
                    }),
                }
            }
            SoftCommand::Dispatch(groups) => self.dispatch(family, bindings, *groups),
            SoftCommand::SetEvent(event) | SoftCommand::ResetEvent(event) => {
                let set = matches!(command, SoftCommand::SetEvent(_));
                match self.events.get_mut(event) {
                    Some(state) => {
                        *state = set;
                        self.trace.push(if set {
                            TraceEvent::SetEvent(*event)
                        } else {
                            TraceEvent::ResetEvent(*event)
                        });
                    }
                    None => self.destroyed("event", event.as_raw()),
                }
            }
            SoftCommand::WaitEvents(events) => {
                for event in events {
                    match self.events.get(event) {
                        Some(true) => {}
                        Some(false) => {
                            self.diagnose(Diagnostic::WaitOnUnsetEvent { event: *event });
                        }
                        None => self.destroyed("event", event.as_raw()),
                    }
                }
            }
        }
    }

    fn image_barrier(&mut self, barrier: &ImageBarrier) {
        let Some(info) = self.images.get_mut(&barrier.image) else {
            return self.destroyed("image", barrier.image.as_raw());
        };
        let range = barrier.range;
        let level_count = resolve_count(range.level_count, range.base_mip_level, info.mip_levels);
        let layer_count = resolve_count(range.layer_count, range.base_array_layer, info.layers);
        let transfer = barrier.src_family != barrier.dst_family
            && barrier.src_family != vk::QUEUE_FAMILY_IGNORED
            && barrier.dst_family != vk::QUEUE_FAMILY_IGNORED;

        let mut mismatches = Vec::new();
        for level in range.base_mip_level..range.base_mip_level + level_count {
            for layer in range.base_array_layer..range.base_array_layer + layer_count {
                let Some(index) = info.layout_index(level, layer) else {
                    continue;
                };
                let actual = info.layouts[index];
                let matches = barrier.old_layout == vk::ImageLayout::UNDEFINED
                    || actual == barrier.old_layout
                    || (transfer && actual == barrier.new_layout);
                if !matches {
                    mismatches.push(Diagnostic::LayoutMismatch {
                        image: barrier.image,
                        mip_level: level,
                        array_layer: layer,
                        expected: barrier.old_layout,
                        actual,
                    });
                }
                info.layouts[index] = barrier.new_layout;
            }
        }
        for mismatch in mismatches {
            self.diagnose(mismatch);
        }
        self.trace.push(TraceEvent::ImageBarrier {
            image: barrier.image,
            base_mip_level: range.base_mip_level,
            level_count,
            base_array_layer: range.base_array_layer,
            layer_count,
            old_layout: barrier.old_layout,
            new_layout: barrier.new_layout,
            src_family: barrier.src_family,
            dst_family: barrier.dst_family,
        });
    }

    /// Report every subresource not in `expected`. Returns false if the
    /// image does not exist.
    fn check_layout(
        &mut self,
        image: vk::Image,
        level: u32,
        base_layer: u32,
        layer_count: u32,
        expected: vk::ImageLayout,
    ) -> bool {
        let Some(info) = self.images.get(&image) else {
            self.destroyed("image", image.as_raw());
            return false;
        };
        let mismatches: Vec<Diagnostic> = (base_layer..base_layer + layer_count)
            .filter_map(|layer| {
                let actual = info.layouts[info.layout_index(level, layer)?];
                (actual != expected).then_some(Diagnostic::LayoutMismatch {
                    image,
                    mip_level: level,
                    array_layer: layer,
                    expected,
                    actual,
                })
            })
            .collect();
        for mismatch in mismatches {
            self.diagnose(mismatch);
        }
        true
    }

    fn copy_buffer_to_image(
        &mut self,
        src: vk::Buffer,
        dst: vk::Image,
        layout: vk::ImageLayout,
        region: &vk::BufferImageCopy,
    ) {
        let sub = region.image_subresource;
        if !self.check_layout(dst, sub.mip_level, sub.base_array_layer, sub.layer_count, layout) {
            return;
        }
        let (origin, extent) = box_of(region.image_offset, region.image_extent);
        let Some(layer_bytes) = self.box_bytes(dst, extent) else {
            return;
        };
        let mut ok = true;
        for i in 0..sub.layer_count {
            let offset = region.buffer_offset + u64::from(i) * layer_bytes;
            ok &= self
                .read_buffer(src, offset, layer_bytes)
                .is_some_and(|data| {
                    self.write_texels(dst, sub.mip_level, sub.base_array_layer + i, origin, extent, &data)
                });
        }
        if !ok {
            self.diagnose(Diagnostic::OutOfBounds {
                what: "buffer to image copy",
            });
        }
        self.trace.push(TraceEvent::CopyBufferToImage {
            buffer: src,
            image: dst,
            mip_level: sub.mip_level,
        });
    }

    fn copy_image_to_buffer(
        &mut self,
        src: vk::Image,
        layout: vk::ImageLayout,
        dst: vk::Buffer,
        region: &vk::BufferImageCopy,
    ) {
        let sub = region.image_subresource;
        if !self.check_layout(src, sub.mip_level, sub.base_array_layer, sub.layer_count, layout) {
            return;
        }
        let (origin, extent) = box_of(region.image_offset, region.image_extent);
        let Some(layer_bytes) = self.box_bytes(src, extent) else {
            return;
        };
        let mut ok = true;
        for i in 0..sub.layer_count {
            let offset = region.buffer_offset + u64::from(i) * layer_bytes;
            ok &= self
                .read_texels(src, sub.mip_level, sub.base_array_layer + i, origin, extent)
                .is_some_and(|data| self.write_buffer(dst, offset, &data));
        }
        if !ok {
            self.diagnose(Diagnostic::OutOfBounds {
                what: "image to buffer copy",
            });
        }
        self.trace.push(TraceEvent::CopyImageToBuffer {
            image: src,
            buffer: dst,
            mip_level: sub.mip_level,
        });
    }

    fn box_bytes(&self, image: vk::Image, extent: [u32; 3]) -> Option<u64> {
        let texel = self.images.get(&image)?.texel_size;
        Some(
            u64::from(texel)
                * u64::from(extent[0])
                * u64::from(extent[1])
                * u64::from(extent[2]),
        )
    }

    /// Nearest-texel blit, whatever the requested filter.
    fn blit(
        &mut self,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        region: &vk::ImageBlit,
    ) {
        let (src_sub, dst_sub) = (region.src_subresource, region.dst_subresource);
        if !self.check_layout(src, src_sub.mip_level, src_sub.base_array_layer, src_sub.layer_count, src_layout)
            || !self.check_layout(dst, dst_sub.mip_level, dst_sub.base_array_layer, dst_sub.layer_count, dst_layout)
        {
            return;
        }
        let (Some(texel), Some(dst_texel)) = (
            self.images.get(&src).map(|i| i.texel_size as usize),
            self.images.get(&dst).map(|i| i.texel_size as usize),
        ) else {
            return;
        };
        if texel != dst_texel {
            return self.diagnose(Diagnostic::Unsupported {
                what: "blit between formats of different sizes",
            });
        }

        let (src_origin, src_extent) = corners(region.src_offsets);
        let (dst_origin, dst_extent) = corners(region.dst_offsets);
        let layers = src_sub.layer_count.min(dst_sub.layer_count);
        let mut ok = true;
        for i in 0..layers {
            let Some(source) = self.read_texels(
                src,
                src_sub.mip_level,
                src_sub.base_array_layer + i,
                src_origin,
                src_extent,
            ) else {
                ok = false;
                continue;
            };
            let count = dst_extent.iter().map(|e| *e as usize).product::<usize>();
            let mut out = Vec::with_capacity(count * texel);
            for z in 0..dst_extent[2] {
                let sz = nearest(z, dst_extent[2], src_extent[2]);
                for y in 0..dst_extent[1] {
                    let sy = nearest(y, dst_extent[1], src_extent[1]);
                    for x in 0..dst_extent[0] {
                        let sx = nearest(x, dst_extent[0], src_extent[0]);
                        let index = ((sz * src_extent[1] + sy) * src_extent[0] + sx) as usize * texel;
                        out.extend_from_slice(&source[index..index + texel]);
                    }
                }
            }
            ok &= self.write_texels(
                dst,
                dst_sub.mip_level,
                dst_sub.base_array_layer + i,
                dst_origin,
                dst_extent,
                &out,
            );
        }
        if !ok {
            self.diagnose(Diagnostic::OutOfBounds { what: "blit" });
        }
        self.trace.push(TraceEvent::Blit {
            src,
            src_level: src_sub.mip_level,
            dst,
            dst_level: dst_sub.mip_level,
            layer_count: layers,
        });
    }

    fn fill(&mut self, buffer: vk::Buffer, offset: u64, size: u64, data: u32) {
        let Some(total) = self.buffers.get(&buffer).map(|b| b.size) else {
            return self.destroyed("buffer", buffer.as_raw());
        };
        let size = if size == vk::WHOLE_SIZE {
            total.saturating_sub(offset) & !3
        } else {
            size
        };
        let bytes: Vec<u8> = data
            .to_le_bytes()
            .into_iter()
            .cycle()
            .take(size as usize)
            .collect();
        if !self.write_buffer(buffer, offset, &bytes) {
            self.diagnose(Diagnostic::OutOfBounds { what: "fill" });
        }
        self.trace.push(TraceEvent::Fill { buffer, size });
    }

    fn clear(
        &mut self,
        image: vk::Image,
        layout: vk::ImageLayout,
        color: [u32; 4],
        range: &vk::ImageSubresourceRange,
    ) {
        let Some(info) = self.images.get(&image) else {
            return self.destroyed("image", image.as_raw());
        };
        let level_count = resolve_count(range.level_count, range.base_mip_level, info.mip_levels);
        let layer_count = resolve_count(range.layer_count, range.base_array_layer, info.layers);
        let format = info.format;
        let Some(texel) = encode_clear(format, color) else {
            return self.diagnose(Diagnostic::Unsupported {
                what: "clear of this format",
            });
        };

        let mut ok = true;
        for level in range.base_mip_level..range.base_mip_level + level_count {
            if !self.check_layout(image, level, range.base_array_layer, layer_count, layout) {
                return;
            }
            let Some(extent) = self.images.get(&image).map(|i| i.level_extent(level)) else {
                return;
            };
            let extent = [extent.width, extent.height, extent.depth];
            let count = extent.iter().map(|e| *e as usize).product::<usize>();
            let data = texel.repeat(count);
            for layer in range.base_array_layer..range.base_array_layer + layer_count {
                ok &= self.write_texels(image, level, layer, [0, 0, 0], extent, &data);
            }
        }
        if !ok {
            self.diagnose(Diagnostic::OutOfBounds { what: "clear" });
        }
        self.trace.push(TraceEvent::Clear {
            image,
            base_mip_level: range.base_mip_level,
            level_count,
        });
    }

    fn dispatch(&mut self, family: u32, bindings: &Bindings, groups: [u32; 3]) {
        let pipeline = bindings.pipeline.unwrap_or_default();
        let Some(kernel) = self.kernels.get(&pipeline).cloned() else {
            return self.diagnose(Diagnostic::MissingKernel { pipeline });
        };
        let bound: Vec<SoftBinding> = bindings
            .sets
            .iter()
            .filter_map(|set| self.descriptor_sets.get(set))
            .flatten()
            .copied()
            .collect();

        let mut images = Vec::new();
        let mut buffers = Vec::new();
        for binding in &bound {
            match *binding {
                SoftBinding::StorageImage(image) => {
                    if !self.check_layout(image, 0, 0, 1, vk::ImageLayout::GENERAL) {
                        continue;
                    }
                    let Some(info) = self.images.get(&image) else {
                        continue;
                    };
                    let (width, height, format, texel_size) =
                        (info.extent.width, info.extent.height, info.format, info.texel_size);
                    let data = self
                        .read_texels(image, 0, 0, [0, 0, 0], [width, height, 1])
                        .unwrap_or_default();
                    images.push(KernelImage {
                        width,
                        height,
                        format,
                        texel_size,
                        data,
                    });
                }
                SoftBinding::StorageBuffer(buffer) => {
                    let data = self
                        .buffers
                        .get(&buffer)
                        .and_then(|b| self.read_buffer(buffer, 0, b.size))
                        .unwrap_or_default();
                    buffers.push(data);
                }
            }
        }

        let mut context = KernelContext {
            workgroups: groups,
            push_constants: &bindings.push_constants,
            images,
            buffers,
        };
        (kernel.as_ref())(&mut context);

        let mut images = context.images.into_iter();
        let mut buffers = context.buffers.into_iter();
        for binding in &bound {
            match *binding {
                SoftBinding::StorageImage(image) => {
                    if !self.images.contains_key(&image) {
                        continue;
                    }
                    if let Some(out) = images.next() {
                        self.write_texels(image, 0, 0, [0, 0, 0], [out.width, out.height, 1], &out.data);
                    }
                }
                SoftBinding::StorageBuffer(buffer) => {
                    if let Some(out) = buffers.next() {
                        self.write_buffer(buffer, 0, &out);
                    }
                }
            }
        }
        tracing::trace!(family, ?groups, "soft dispatch");
        self.trace.push(TraceEvent::Dispatch { pipeline, groups });
    }
}

fn resolve_count(count: u32, base: u32, total: u32) -> u32 {
    if count == vk::REMAINING_MIP_LEVELS || count == vk::REMAINING_ARRAY_LAYERS {
        total.saturating_sub(base)
    } else {
        count
    }
}

fn box_of(offset: vk::Offset3D, extent: vk::Extent3D) -> ([u32; 3], [u32; 3]) {
    (
        [offset.x.max(0) as u32, offset.y.max(0) as u32, offset.z.max(0) as u32],
        [extent.width, extent.height, extent.depth],
    )
}

/// Origin and size of the box spanned by two blit corners.
fn corners(offsets: [vk::Offset3D; 2]) -> ([u32; 3], [u32; 3]) {
    let [a, b] = offsets;
    let span = |p: i32, q: i32| (p.min(q).max(0) as u32, p.abs_diff(q).max(1));
    let (x, w) = span(a.x, b.x);
    let (y, h) = span(a.y, b.y);
    let (z, d) = span(a.z, b.z);
    ([x, y, z], [w, h, d])
}

/// Source coordinate sampled by destination texel `dst` at its center.
fn nearest(dst: u32, dst_size: u32, src_size: u32) -> u32 {
    let scaled = (2 * u64::from(dst) + 1) * u64::from(src_size) / (2 * u64::from(dst_size));
    (scaled as u32).min(src_size - 1)
}

fn unorm8(value: f32) -> u8 {
    (value.clamp(0.0, 1.0) * 255.0).round() as u8
}

fn srgb8(value: f32) -> u8 {
    let value = value.clamp(0.0, 1.0);
    let encoded = if value <= 0.003_130_8 {
        value * 12.92
    } else {
        1.055 * value.powf(1.0 / 2.4) - 0.055
    };
    unorm8(encoded)
}

/// Texel bytes of a clear color, for the formats the software device can
/// clear.
pub(super) fn encode_clear(format: vk::Format, color: [u32; 4]) -> Option<Vec<u8>> {
    let float = color.map(f32::from_bits);
    let texel = match format {
        vk::Format::R8_UNORM => vec![unorm8(float[0])],
        vk::Format::R8G8_UNORM => vec![unorm8(float[0]), unorm8(float[1])],
        vk::Format::R8G8B8A8_UNORM => float.map(unorm8).to_vec(),
        vk::Format::B8G8R8A8_UNORM => {
            vec![unorm8(float[2]), unorm8(float[1]), unorm8(float[0]), unorm8(float[3])]
        }
        vk::Format::R8G8B8A8_SRGB => {
            vec![srgb8(float[0]), srgb8(float[1]), srgb8(float[2]), unorm8(float[3])]
        }
        vk::Format::B8G8R8A8_SRGB => {
            vec![srgb8(float[2]), srgb8(float[1]), srgb8(float[0]), unorm8(float[3])]
        }
        vk::Format::R8_UINT => vec![color[0] as u8],
        vk::Format::R8G8B8A8_UINT => color.map(|c| c as u8).to_vec(),
        vk::Format::R32_UINT | vk::Format::R32_SINT | vk::Format::R32_SFLOAT => {
            color[0].to_le_bytes().to_vec()
        }
        vk::Format::R32G32_UINT | vk::Format::R32G32_SFLOAT => {
            color[..2].iter().flat_map(|c| c.to_le_bytes()).collect()
        }
        vk::Format::R32G32B32_SFLOAT => color[..3].iter().flat_map(|c| c.to_le_bytes()).collect(),
        vk::Format::R32G32B32A32_UINT | vk::Format::R32G32B32A32_SFLOAT => {
            color.iter().flat_map(|c| c.to_le_bytes()).collect()
        }
        _ => return None,
    };
    Some(texel)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nearest_sampling_halves() {
        assert_eq!(nearest(0, 2, 4), 1);
        assert_eq!(nearest(1, 2, 4), 3);
        assert_eq!(nearest(0, 1, 1), 0);
        assert_eq!(nearest(0, 1, 3), 1);
    }

    #[test]
    fn corners_normalize_order() {
        let offsets = [
            vk::Offset3D { x: 4, y: 0, z: 0 },
            vk::Offset3D { x: 0, y: 2, z: 1 },
        ];
        assert_eq!(corners(offsets), ([0, 0, 0], [4, 2, 1]));
    }

    #[test]
    fn clear_colors_encode() {
        let red = [1.0f32, 0.0, 0.0, 1.0].map(f32::to_bits);
        assert_eq!(
            encode_clear(vk::Format::R8G8B8A8_UNORM, red),
            Some(vec![255, 0, 0, 255])
        );
        assert_eq!(
            encode_clear(vk::Format::B8G8R8A8_UNORM, red),
            Some(vec![0, 0, 255, 255])
        );
        let half = [0.5f32; 4].map(f32::to_bits);
        assert_eq!(encode_clear(vk::Format::R8G8B8A8_SRGB, half).map(|t| t[0]), Some(188));
        assert_eq!(
            encode_clear(vk::Format::R32_UINT, [7, 0, 0, 0]),
            Some(vec![7, 0, 0, 0])
        );
        assert_eq!(encode_clear(vk::Format::BC1_RGB_UNORM_BLOCK, red), None);
    }
}
