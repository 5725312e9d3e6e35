//! Frames in flight.
//!
//! Each frame slot owns an image-available semaphore, a render-finished
//! semaphore and an in-flight fence. The manager also remembers which frame
//! last rendered to each swapchain image, so an image is never handed out
//! again while the submission that used it is still running.

use crate::command::CommandRecorder;
use crate::device::Device;
use crate::error::{GpuError, Result};
use crate::queue::{PresentOutcome, Queue, QueuePresentation, QueueSubmission};
use crate::swapchain::{AcquireOutcome, Swapchain};
use crate::sync::{Fence, FenceState, FenceWait, Semaphore};
use ash::vk;

/// Synchronization objects for a single frame in flight.
#[derive(Debug)]
pub struct FrameSync {
    /// Signalled when the acquired image is ready to be rendered to.
    pub image_available: Semaphore,
    /// Signalled when rendering is complete and the image can be presented.
    pub render_finished: Semaphore,
    /// Signalled when the frame's submission has retired. Created signalled.
    pub in_flight: Fence,
}

impl FrameSync {
    /// Create frame synchronization resources.
    pub fn new(device: &Device) -> Result<Self> {
        Ok(Self {
            image_available: Semaphore::create(device)?,
            render_finished: Semaphore::create(device)?,
            in_flight: Fence::create(device, true)?,
        })
    }

    /// Wait for this frame's previous submission to retire.
    pub fn wait(&self, timeout_ns: u64) -> Result<FenceWait> {
        self.in_flight.wait(timeout_ns)
    }

    /// Reset the fence for the next frame.
    pub fn reset(&self) -> Result<()> {
        self.in_flight.reset()
    }
}

/// An acquired image and the frame slot rendering to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameTarget {
    pub image_index: u32,
    pub frame_index: usize,
    /// Monotonic frame counter, usable with the deferred deletion queue.
    pub frame_number: u64,
    pub suboptimal: bool,
}

/// Result of [`FrameSyncManager::begin_frame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameBegin {
    Ready(FrameTarget),
    /// The swapchain must be recreated.
    OutOfDate,
    NotReady,
    TimedOut,
}

/// Manages synchronization for multiple frames in flight.
#[derive(Debug)]
pub struct FrameSyncManager {
    frames: Vec<FrameSync>,
    current: usize,
    images_in_flight: Vec<Option<usize>>,
    frame_number: u64,
}

impl FrameSyncManager {
    /// Create a sync manager for the given number of frames in flight.
    pub fn new(device: &Device, frames_in_flight: usize) -> Result<Self> {
        let frames_in_flight = frames_in_flight.max(1);
        let frames = (0..frames_in_flight)
            .map(|_| FrameSync::new(device))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            frames,
            current: 0,
            images_in_flight: Vec::new(),
            frame_number: 0,
        })
    }

    /// Get the current frame's sync resources.
    pub fn current(&self) -> &FrameSync {
        &self.frames[self.current]
    }

    pub fn frame(&self, index: usize) -> Option<&FrameSync> {
        self.frames.get(index)
    }

    /// Get the current frame index.
    pub fn current_frame(&self) -> usize {
        self.current
    }

    pub fn frames_in_flight(&self) -> usize {
        self.frames.len()
    }

    /// Number of frames begun and presented so far.
    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    /// Advance to the next frame.
    pub fn advance(&mut self) {
        self.current = (self.current + 1) % self.frames.len();
        self.frame_number += 1;
    }

    /// Forget per-image tracking after the swapchain was recreated.
    pub fn swapchain_recreated(&mut self) {
        self.images_in_flight.clear();
    }

    /// Wait for the current frame slot, then acquire the next image.
    ///
    /// The slot's fence is only reset once an image has been acquired, so an
    /// out-of-date swapchain leaves the frame ready to retry.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn begin_frame(&mut self, swapchain: &mut Swapchain, timeout_ns: u64) -> Result<FrameBegin> {
        let frame = &self.frames[self.current];
        if frame.wait(timeout_ns)? == FenceWait::TimedOut {
            return Ok(FrameBegin::TimedOut);
        }

        let outcome = swapchain.acquire_next_image(timeout_ns, Some(&frame.image_available), None)?;
        let (image_index, suboptimal) = match outcome {
            AcquireOutcome::Acquired { index, suboptimal } => (index, suboptimal),
            AcquireOutcome::OutOfDate => return Ok(FrameBegin::OutOfDate),
            AcquireOutcome::NotReady => return Ok(FrameBegin::NotReady),
            AcquireOutcome::TimedOut => return Ok(FrameBegin::TimedOut),
        };

        let image_count = swapchain.image_count() as usize;
        if self.images_in_flight.len() != image_count {
            self.images_in_flight = vec![None; image_count];
        }
        if let Some(previous) = self.images_in_flight[image_index as usize] {
            let fence = &self.frames[previous].in_flight;
            if previous != self.current && fence.state() == FenceState::Pending {
                tracing::trace!(image_index, previous, "waiting for image in flight");
                fence.wait(u64::MAX)?;
            }
        }
        self.images_in_flight[image_index as usize] = Some(self.current);
        self.frames[self.current].reset()?;

        Ok(FrameBegin::Ready(FrameTarget {
            image_index,
            frame_index: self.current,
            frame_number: self.frame_number,
            suboptimal,
        }))
    }

    /// Submit the frame's work, waiting on image-available at `wait_stage`
    /// and signalling render-finished and the in-flight fence.
    pub fn submit_frame(
        &self,
        queue: &Queue,
        target: &FrameTarget,
        recorders: &[&CommandRecorder],
        wait_stage: vk::PipelineStageFlags,
    ) -> Result<()> {
        let frame = &self.frames[target.frame_index];
        let submission = recorders
            .iter()
            .fold(
                QueueSubmission::new().wait(&frame.image_available, wait_stage),
                |submission, recorder| submission.commands(recorder),
            )
            .signal(&frame.render_finished);
        queue.submit_one(submission, Some(&frame.in_flight))
    }

    /// Present the frame's image once rendering finished, then advance.
    pub fn present_frame(
        &mut self,
        queue: &Queue,
        swapchain: &mut Swapchain,
        target: &FrameTarget,
    ) -> Result<PresentOutcome> {
        let frame = &self.frames[target.frame_index];
        let report = queue.present(
            QueuePresentation::new()
                .wait(&frame.render_finished)
                .swapchain(swapchain, target.image_index),
        )?;
        self.advance();
        report
            .outcomes
            .first()
            .copied()
            .ok_or_else(|| GpuError::Other("present returned no outcome".to_string()))
    }

    /// Wait for every submitted frame to retire.
    pub fn wait_all(&self) -> Result<()> {
        for frame in &self.frames {
            if frame.in_flight.state() == FenceState::Pending {
                frame.wait(u64::MAX)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandPool;
    use crate::swapchain::SwapchainDesc;
    use crate::test_support::{pool_and_queue, soft_device};

    fn executable(pool: &CommandPool) -> CommandRecorder {
        let mut recorder = pool.allocate(vk::CommandBufferLevel::PRIMARY).unwrap();
        recorder.begin(CommandRecorder::DEFAULT_USAGE).unwrap();
        recorder.end().unwrap();
        recorder
    }

    #[test]
    fn frames_cycle_through_their_slots() {
        let (driver, device) = soft_device();
        let (pool, queue) = pool_and_queue(&device, 0);
        let recorder = executable(&pool);
        let surface = driver.create_surface();
        let mut swapchain = Swapchain::create(&device, &SwapchainDesc::new(surface, 64, 64)).unwrap();
        let mut frames = FrameSyncManager::new(&device, 2).unwrap();

        for n in 0..6u64 {
            let FrameBegin::Ready(target) = frames.begin_frame(&mut swapchain, u64::MAX).unwrap()
            else {
                panic!("frame {n} did not start");
            };
            assert_eq!(target.frame_number, n);
            assert_eq!(target.frame_index, (n % 2) as usize);
            frames
                .submit_frame(
                    &queue,
                    &target,
                    &[&recorder],
                    vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                )
                .unwrap();
            assert_eq!(
                frames.present_frame(&queue, &mut swapchain, &target).unwrap(),
                PresentOutcome::Presented
            );
        }
        assert_eq!(frames.frame_number(), 6);
        assert_eq!(frames.current_frame(), 0);

        frames.wait_all().unwrap();
        for index in 0..2 {
            let fence = &frames.frame(index).unwrap().in_flight;
            assert_eq!(fence.state(), FenceState::Signalled);
            assert_eq!(fence.submissions(), 3);
        }
        assert!(driver.diagnostics().is_empty());
    }

    #[test]
    fn reused_slot_waits_for_its_previous_frame() {
        let (driver, device) = soft_device();
        let (pool, queue) = pool_and_queue(&device, 0);
        let recorder = executable(&pool);
        let surface = driver.create_surface();
        let mut swapchain = Swapchain::create(&device, &SwapchainDesc::new(surface, 64, 64)).unwrap();
        let mut frames = FrameSyncManager::new(&device, 1).unwrap();

        let FrameBegin::Ready(first) = frames.begin_frame(&mut swapchain, u64::MAX).unwrap() else {
            panic!("first frame did not start");
        };
        frames
            .submit_frame(&queue, &first, &[&recorder], vk::PipelineStageFlags::TRANSFER)
            .unwrap();
        frames.present_frame(&queue, &mut swapchain, &first).unwrap();
        let fence = &frames.current().in_flight;
        assert_eq!(fence.state(), FenceState::Pending);
        assert_eq!(fence.completed_submissions(), 0);

        let FrameBegin::Ready(second) = frames.begin_frame(&mut swapchain, u64::MAX).unwrap() else {
            panic!("second frame did not start");
        };
        assert_eq!(second.frame_index, first.frame_index);
        let fence = &frames.current().in_flight;
        assert_eq!(fence.completed_submissions(), 1);
        assert_eq!(fence.state(), FenceState::Unsubmitted);
    }

    #[test]
    fn out_of_date_keeps_the_slot_ready() {
        let (driver, device) = soft_device();
        let surface = driver.create_surface();
        let mut swapchain = Swapchain::create(&device, &SwapchainDesc::new(surface, 64, 64)).unwrap();
        let mut frames = FrameSyncManager::new(&device, 2).unwrap();

        driver.resize_surface(surface, 80, 40);
        assert_eq!(
            frames.begin_frame(&mut swapchain, u64::MAX).unwrap(),
            FrameBegin::OutOfDate
        );
        assert_eq!(frames.current().in_flight.state(), FenceState::Signalled);
        assert!(!frames.current().image_available.has_pending_signal());

        swapchain.recreate(&SwapchainDesc::new(surface, 80, 40)).unwrap();
        frames.swapchain_recreated();
        assert!(matches!(
            frames.begin_frame(&mut swapchain, u64::MAX).unwrap(),
            FrameBegin::Ready(FrameTarget { frame_number: 0, .. })
        ));
    }

    #[test]
    fn zero_frames_still_gets_one_slot() {
        let (_driver, device) = soft_device();
        let frames = FrameSyncManager::new(&device, 0).unwrap();
        assert_eq!(frames.frames_in_flight(), 1);
        assert!(frames.frame(1).is_none());
    }
}
