//! Deferred resource deletion for multi-frame-in-flight rendering.
//!
//! With several frames in flight a buffer or texture retired by the host may
//! still be read by a frame the device has not finished. Resources queued
//! here are destroyed once enough frames have passed.

use crate::buffer::Buffer;
use crate::error::Result;
use crate::texture::Texture;
use std::collections::VecDeque;

/// A resource awaiting destruction.
#[derive(Debug)]
pub enum Retired {
    Buffer(Buffer),
    Texture(Texture),
}

impl Retired {
    fn destroy(mut self) -> Result<()> {
        match &mut self {
            Self::Buffer(buffer) => buffer.destroy(),
            Self::Texture(texture) => texture.destroy(),
        }
    }
}

impl From<Buffer> for Retired {
    fn from(buffer: Buffer) -> Self {
        Self::Buffer(buffer)
    }
}

impl From<Texture> for Retired {
    fn from(texture: Texture) -> Self {
        Self::Texture(texture)
    }
}

struct PendingDeletion {
    resource: Retired,
    frame_queued: u64,
}

/// Queue for deferred deletions.
pub struct DeferredDeletionQueue {
    pending: VecDeque<PendingDeletion>,
    frames_in_flight: usize,
}

impl DeferredDeletionQueue {
    /// Resources will be kept for `frames_in_flight` frames before being
    /// destroyed.
    pub fn new(frames_in_flight: usize) -> Self {
        Self {
            pending: VecDeque::new(),
            frames_in_flight,
        }
    }

    /// Queue a resource retired during frame `frame_number`.
    pub fn queue(&mut self, resource: impl Into<Retired>, frame_number: u64) {
        self.pending.push_back(PendingDeletion {
            resource: resource.into(),
            frame_queued: frame_number,
        });
    }

    /// Destroy resources whose frame window has passed.
    ///
    /// Call this at the start of each frame, after waiting on its fence.
    pub fn process(&mut self, current_frame_number: u64) -> Result<usize> {
        let cutoff = current_frame_number.saturating_sub(self.frames_in_flight as u64);
        let mut destroyed = 0;
        // Frame numbers are non-decreasing, so only the front can mature.
        while self
            .pending
            .front()
            .is_some_and(|p| p.frame_queued < cutoff)
        {
            if let Some(pending) = self.pending.pop_front() {
                pending.resource.destroy()?;
                destroyed += 1;
            }
        }
        Ok(destroyed)
    }

    /// Destroy everything immediately.
    ///
    /// Only call this after `Device::wait_idle`.
    pub fn flush(&mut self) -> Result<()> {
        while let Some(pending) = self.pending.pop_front() {
            pending.resource.destroy()?;
        }
        Ok(())
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Call this when the number of frames in flight changes.
    pub fn set_frames_in_flight(&mut self, frames_in_flight: usize) {
        self.frames_in_flight = frames_in_flight;
    }
}

impl std::fmt::Debug for DeferredDeletionQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeferredDeletionQueue")
            .field("pending", &self.pending.len())
            .field("frames_in_flight", &self.frames_in_flight)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferDesc;
    use crate::test_support::soft_device;
    use crate::texture::TextureDesc;
    use ash::vk;

    fn buffer(device: &crate::device::Device) -> Buffer {
        let desc = BufferDesc::new(
            64,
            vk::BufferUsageFlags::STORAGE_BUFFER,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        );
        Buffer::create(device, &desc).unwrap()
    }

    #[test]
    fn resources_outlive_their_frames_in_flight() {
        let (driver, device) = soft_device();
        let mut queue = DeferredDeletionQueue::new(2);
        queue.queue(buffer(&device), 0);
        queue.queue(buffer(&device), 1);
        assert_eq!(driver.live_resources(), 2);

        assert_eq!(queue.process(1).unwrap(), 0);
        assert_eq!(queue.process(2).unwrap(), 0);
        assert_eq!(queue.process(3).unwrap(), 1);
        assert_eq!(queue.pending_count(), 1);
        assert_eq!(driver.live_resources(), 1);
        assert_eq!(queue.process(4).unwrap(), 1);
        assert!(queue.is_empty());
        assert_eq!(driver.live_resources(), 0);
        assert_eq!(driver.live_allocations(), 0);
    }

    #[test]
    fn flush_destroys_everything() {
        let (driver, device) = soft_device();
        let texture = Texture::create(
            &device,
            &TextureDesc::new_2d(4, 4, vk::Format::R8G8B8A8_UNORM).usage(vk::ImageUsageFlags::SAMPLED),
        )
        .unwrap();
        let mut queue = DeferredDeletionQueue::new(3);
        queue.queue(texture, 10);
        queue.queue(buffer(&device), 10);
        assert_eq!(queue.process(11).unwrap(), 0);

        queue.flush().unwrap();
        assert!(queue.is_empty());
        assert_eq!(driver.live_resources(), 0);
    }

    #[test]
    fn fewer_frames_in_flight_release_sooner() {
        let (_driver, device) = soft_device();
        let mut queue = DeferredDeletionQueue::new(3);
        queue.queue(buffer(&device), 5);
        assert_eq!(queue.process(7).unwrap(), 0);
        queue.set_frames_in_flight(1);
        assert_eq!(queue.process(7).unwrap(), 1);
    }
}
