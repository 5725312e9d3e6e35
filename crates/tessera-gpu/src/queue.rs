//! Queue submission and presentation.
//!
//! Submissions are validated as a whole before anything reaches the driver:
//! a rejected call leaves every recorder, semaphore and fence untouched.

use crate::command::CommandRecorder;
use crate::device::Device;
use crate::driver::{PresentBatch, SubmitBatch};
use crate::error::{ProtocolViolation, Result};
use crate::physical::QueueFamily;
use crate::swapchain::Swapchain;
use crate::sync::{Fence, RetireToken, Semaphore};
use ash::vk;
use hashbrown::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// One batch of work: waits, command recorders and signals.
#[derive(Default)]
pub struct QueueSubmission<'a> {
    waits: Vec<(&'a Semaphore, vk::PipelineStageFlags)>,
    commands: Vec<&'a CommandRecorder>,
    signals: Vec<&'a Semaphore>,
}

impl<'a> QueueSubmission<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait on `semaphore` before `stage` of this batch runs.
    pub fn wait(mut self, semaphore: &'a Semaphore, stage: vk::PipelineStageFlags) -> Self {
        self.waits.push((semaphore, stage));
        self
    }

    /// Execute `recorder` as part of this batch.
    pub fn commands(mut self, recorder: &'a CommandRecorder) -> Self {
        self.commands.push(recorder);
        self
    }

    /// Signal `semaphore` when this batch completes.
    pub fn signal(mut self, semaphore: &'a Semaphore) -> Self {
        self.signals.push(semaphore);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.waits.is_empty() && self.commands.is_empty() && self.signals.is_empty()
    }
}

/// One present call covering one or more swapchains.
#[derive(Default)]
pub struct QueuePresentation<'a> {
    waits: Vec<&'a Semaphore>,
    targets: Vec<(&'a mut Swapchain, u32)>,
}

impl<'a> QueuePresentation<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait on `semaphore` before presenting.
    pub fn wait(mut self, semaphore: &'a Semaphore) -> Self {
        self.waits.push(semaphore);
        self
    }

    /// Present image `index` of `swapchain`.
    pub fn swapchain(mut self, swapchain: &'a mut Swapchain, index: u32) -> Self {
        self.targets.push((swapchain, index));
        self
    }
}

/// Result of presenting to one swapchain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    Presented,
    /// Presented, but the swapchain no longer matches the surface exactly.
    Suboptimal,
    /// The swapchain must be recreated.
    OutOfDate,
    SurfaceLost,
    Failed(vk::Result),
}

impl PresentOutcome {
    fn from_result(result: vk::Result) -> Self {
        match result {
            vk::Result::SUCCESS => Self::Presented,
            vk::Result::SUBOPTIMAL_KHR => Self::Suboptimal,
            vk::Result::ERROR_OUT_OF_DATE_KHR => Self::OutOfDate,
            vk::Result::ERROR_SURFACE_LOST_KHR => Self::SurfaceLost,
            other => Self::Failed(other),
        }
    }

    pub fn is_presented(self) -> bool {
        matches!(self, Self::Presented | Self::Suboptimal)
    }

    /// Whether the swapchain should be recreated.
    pub fn needs_recreate(self) -> bool {
        matches!(self, Self::Suboptimal | Self::OutOfDate)
    }
}

/// Per-swapchain outcomes of a present call, in the order the swapchains
/// were added.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresentReport {
    pub outcomes: Vec<PresentOutcome>,
}

impl PresentReport {
    pub fn all_presented(&self) -> bool {
        self.outcomes.iter().all(|o| o.is_presented())
    }

    pub fn needs_recreate(&self) -> bool {
        self.outcomes.iter().any(|o| o.needs_recreate())
    }
}

/// A device queue.
pub struct Queue {
    device: Device,
    queue: vk::Queue,
    family: QueueFamily,
    index: u32,
    last_submitted: AtomicU64,
    retired: Arc<AtomicU64>,
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("queue", &self.queue)
            .field("family", &self.family.index)
            .field("index", &self.index)
            .finish()
    }
}

impl Queue {
    /// Get queue `index` of `family`.
    pub fn new(device: &Device, family: &QueueFamily, index: u32) -> Result<Self> {
        let family = device.queue_family(family.index)?;
        if index >= family.queue_count {
            return device.violation(ProtocolViolation::QueueIndexOutOfRange {
                family: family.index,
                index,
                count: family.queue_count,
            });
        }
        let queue = unsafe { device.driver().get_queue(family.index, index) };
        Ok(Self {
            device: device.clone(),
            queue,
            family,
            index,
            last_submitted: AtomicU64::new(0),
            retired: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Get the raw queue handle.
    pub fn handle(&self) -> vk::Queue {
        self.queue
    }

    pub fn family(&self) -> &QueueFamily {
        &self.family
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Submit all batches in a single driver call, signalling `fence` when
    /// every batch has completed.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn submit(&self, submissions: &[QueueSubmission<'_>], fence: Option<&Fence>) -> Result<()> {
        self.device.ensure_alive("submitting to queue")?;
        self.validate_submit(submissions, fence)?;

        let waits: Vec<Vec<vk::Semaphore>> = submissions
            .iter()
            .map(|s| s.waits.iter().map(|(sem, _)| sem.handle()).collect())
            .collect();
        let stages: Vec<Vec<vk::PipelineStageFlags>> = submissions
            .iter()
            .map(|s| s.waits.iter().map(|(_, stage)| *stage).collect())
            .collect();
        let commands: Vec<Vec<vk::CommandBuffer>> = submissions
            .iter()
            .map(|s| s.commands.iter().map(|r| r.handle()).collect())
            .collect();
        let signals: Vec<Vec<vk::Semaphore>> = submissions
            .iter()
            .map(|s| s.signals.iter().map(|sem| sem.handle()).collect())
            .collect();
        let batches: Vec<SubmitBatch<'_>> = (0..submissions.len())
            .map(|i| SubmitBatch {
                wait_semaphores: &waits[i],
                wait_stages: &stages[i],
                command_buffers: &commands[i],
                signal_semaphores: &signals[i],
            })
            .collect();

        let fence_handle = fence.map_or(vk::Fence::null(), Fence::handle);
        let result = unsafe {
            self.device
                .driver()
                .queue_submit(self.queue, &batches, fence_handle)
        };
        self.device.check(result, "submitting to queue")?;

        let sequence = self.device.next_submission();
        self.last_submitted.fetch_max(sequence, Ordering::AcqRel);
        let token = RetireToken {
            sequence,
            queue_retired: Arc::clone(&self.retired),
            device_retired: self.device.retired_watermark(),
            fence: fence.map(Fence::mark_pending),
        };
        for submission in submissions {
            for (semaphore, _) in &submission.waits {
                semaphore.set_pending(false);
            }
            for recorder in &submission.commands {
                recorder.mark_submitted(token.clone());
            }
            for semaphore in &submission.signals {
                semaphore.set_pending(true);
            }
        }

        tracing::trace!(
            family = self.family.index,
            batches = submissions.len(),
            sequence,
            "submitted"
        );
        Ok(())
    }

    /// Convenience for a single batch.
    pub fn submit_one(&self, submission: QueueSubmission<'_>, fence: Option<&Fence>) -> Result<()> {
        self.submit(std::slice::from_ref(&submission), fence)
    }

    fn validate_submit(&self, submissions: &[QueueSubmission<'_>], fence: Option<&Fence>) -> Result<()> {
        let device = &self.device;
        let mut pending: HashMap<vk::Semaphore, bool> = HashMap::new();
        let mut seen_recorders: HashSet<vk::CommandBuffer> = HashSet::new();

        for submission in submissions {
            for (semaphore, stage) in &submission.waits {
                device.protocol(semaphore.check_live())?;
                if stage.is_empty() {
                    return device.violation(ProtocolViolation::EmptyWaitStage);
                }
                let signalled = pending
                    .entry(semaphore.handle())
                    .or_insert_with(|| semaphore.has_pending_signal());
                if !*signalled {
                    return device.violation(ProtocolViolation::SemaphoreNotSignalled);
                }
                *signalled = false;
            }

            for recorder in &submission.commands {
                if recorder.family().index != self.family.index {
                    return device.violation(ProtocolViolation::RecorderFamilyMismatch {
                        recorder: recorder.family().index,
                        queue: self.family.index,
                    });
                }
                device.protocol(recorder.check_submittable())?;
                let simultaneous = recorder
                    .usage()
                    .contains(vk::CommandBufferUsageFlags::SIMULTANEOUS_USE);
                if !seen_recorders.insert(recorder.handle()) && !simultaneous {
                    return device.violation(ProtocolViolation::RecorderState {
                        expected: "executable",
                        actual: "pending",
                    });
                }
            }

            for semaphore in &submission.signals {
                device.protocol(semaphore.check_live())?;
                let signalled = pending
                    .entry(semaphore.handle())
                    .or_insert_with(|| semaphore.has_pending_signal());
                if *signalled {
                    return device.violation(ProtocolViolation::SemaphoreAlreadySignalled);
                }
                *signalled = true;
            }
        }

        if let Some(fence) = fence {
            device.protocol(fence.check_submittable())?;
        }
        Ok(())
    }

    /// Present acquired images to their swapchains.
    ///
    /// Every slot named in the presentation returns to the presentation
    /// engine regardless of its individual outcome.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn present(&self, presentation: QueuePresentation<'_>) -> Result<PresentReport> {
        let device = &self.device;
        device.ensure_alive("presenting")?;
        let QueuePresentation { waits, mut targets } = presentation;

        if targets.is_empty() {
            return device.violation(ProtocolViolation::ZeroSized {
                what: "present target count",
            });
        }
        if !self.family.supports_present() {
            return device.violation(ProtocolViolation::UnsupportedByQueueFamily {
                family: self.family.index,
                operation: "present",
            });
        }

        let mut consumed: HashSet<vk::Semaphore> = HashSet::new();
        for semaphore in &waits {
            device.protocol(semaphore.check_live())?;
            if !semaphore.has_pending_signal() || !consumed.insert(semaphore.handle()) {
                return device.violation(ProtocolViolation::SemaphoreNotSignalled);
            }
        }

        let mut swapchains = Vec::with_capacity(targets.len());
        for (swapchain, index) in &targets {
            if swapchains.contains(&swapchain.handle()) {
                return device.violation(ProtocolViolation::DuplicateSwapchain);
            }
            device.protocol(swapchain.check_presentable(*index))?;
            swapchains.push(swapchain.handle());
        }

        let wait_handles: Vec<vk::Semaphore> = waits.iter().map(|s| s.handle()).collect();
        let indices: Vec<u32> = targets.iter().map(|(_, index)| *index).collect();
        let batch = PresentBatch {
            wait_semaphores: &wait_handles,
            swapchains: &swapchains,
            image_indices: &indices,
        };
        let result = unsafe { device.driver().queue_present(self.queue, &batch) };
        let results = device.check(result, "presenting")?;

        for semaphore in &waits {
            semaphore.set_pending(false);
        }
        let outcomes = targets
            .iter_mut()
            .zip(&results)
            .map(|((swapchain, index), result)| {
                swapchain.mark_presented(*index);
                PresentOutcome::from_result(*result)
            })
            .collect();
        let report = PresentReport { outcomes };
        if report.needs_recreate() {
            tracing::debug!(?report, "present reported stale swapchain");
        }
        Ok(report)
    }

    /// Block until this queue is idle.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn wait_idle(&self) -> Result<()> {
        self.device.ensure_alive("waiting for queue idle")?;
        let last = self.last_submitted.load(Ordering::Acquire);
        let result = unsafe { self.device.driver().queue_wait_idle(self.queue) };
        self.device.check(result, "waiting for queue idle")?;
        self.retired.fetch_max(last, Ordering::AcqRel);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::soft::SoftCall;
    use crate::command::{CommandRecorder, RecorderState};
    use crate::error::GpuError;
    use crate::test_support::{pool_and_queue, soft_device};

    fn violation(err: GpuError) -> ProtocolViolation {
        err.as_violation().cloned().expect("expected a protocol violation")
    }

    fn executable(pool: &crate::command::CommandPool) -> CommandRecorder {
        let mut recorder = pool.allocate(vk::CommandBufferLevel::PRIMARY).unwrap();
        recorder.begin(CommandRecorder::DEFAULT_USAGE).unwrap();
        recorder.end().unwrap();
        recorder
    }

    #[test]
    fn rejected_submit_changes_nothing() {
        let (driver, device) = soft_device();
        let (pool, queue) = pool_and_queue(&device, 0);
        let recorder = executable(&pool);
        let signalled = Semaphore::create(&device).unwrap();
        let never = Semaphore::create(&device).unwrap();
        let fence = Fence::create(&device, false).unwrap();

        let err = queue
            .submit(
                &[
                    QueueSubmission::new().commands(&recorder).signal(&signalled),
                    QueueSubmission::new().wait(&never, vk::PipelineStageFlags::ALL_COMMANDS),
                ],
                Some(&fence),
            )
            .unwrap_err();
        assert_eq!(violation(err), ProtocolViolation::SemaphoreNotSignalled);
        assert_eq!(recorder.state(), RecorderState::Executable);
        assert!(!signalled.has_pending_signal());
        assert_eq!(fence.state(), crate::sync::FenceState::Unsubmitted);
        assert_eq!(driver.pending_operations(), 0);
    }

    #[test]
    fn semaphores_chain_within_one_call() {
        let (driver, device) = soft_device();
        let (_, queue) = pool_and_queue(&device, 0);
        let semaphore = Semaphore::create(&device).unwrap();
        queue
            .submit(
                &[
                    QueueSubmission::new().signal(&semaphore),
                    QueueSubmission::new().wait(&semaphore, vk::PipelineStageFlags::TRANSFER),
                ],
                None,
            )
            .unwrap();
        assert!(!semaphore.has_pending_signal());
        queue.wait_idle().unwrap();
        assert_eq!(driver.pending_operations(), 0);
    }

    #[test]
    fn semaphore_signal_and_wait_rules() {
        let (_, device) = soft_device();
        let (_, queue) = pool_and_queue(&device, 0);
        let semaphore = Semaphore::create(&device).unwrap();
        queue
            .submit_one(QueueSubmission::new().signal(&semaphore), None)
            .unwrap();
        assert!(semaphore.has_pending_signal());

        let err = queue
            .submit_one(QueueSubmission::new().signal(&semaphore), None)
            .unwrap_err();
        assert_eq!(violation(err), ProtocolViolation::SemaphoreAlreadySignalled);
        let err = queue
            .submit_one(
                QueueSubmission::new().wait(&semaphore, vk::PipelineStageFlags::empty()),
                None,
            )
            .unwrap_err();
        assert_eq!(violation(err), ProtocolViolation::EmptyWaitStage);
    }

    #[test]
    fn recorders_submit_to_their_own_family() {
        let (_, device) = soft_device();
        let (compute_pool, _) = pool_and_queue(&device, 1);
        let (_, graphics) = pool_and_queue(&device, 0);
        let recorder = executable(&compute_pool);
        let err = graphics
            .submit_one(QueueSubmission::new().commands(&recorder), None)
            .unwrap_err();
        assert_eq!(
            violation(err),
            ProtocolViolation::RecorderFamilyMismatch {
                recorder: 1,
                queue: 0
            }
        );
    }

    #[test]
    fn unfinished_recorders_are_not_submittable() {
        let (_, device) = soft_device();
        let (pool, queue) = pool_and_queue(&device, 0);
        let mut recorder = pool.allocate(vk::CommandBufferLevel::PRIMARY).unwrap();
        recorder.begin(CommandRecorder::DEFAULT_USAGE).unwrap();
        let err = queue
            .submit_one(QueueSubmission::new().commands(&recorder), None)
            .unwrap_err();
        assert_eq!(
            violation(err),
            ProtocolViolation::RecorderState {
                expected: "executable",
                actual: "recording"
            }
        );
    }

    #[test]
    fn queue_index_is_checked() {
        let (_, device) = soft_device();
        let family = device.queue_family(1).unwrap();
        assert!(Queue::new(&device, &family, 1).is_ok());
        let err = Queue::new(&device, &family, 2).unwrap_err();
        assert_eq!(
            violation(err),
            ProtocolViolation::QueueIndexOutOfRange {
                family: 1,
                index: 2,
                count: 2
            }
        );
    }

    #[test]
    fn driver_failure_leaves_state_untouched() {
        let (driver, device) = soft_device();
        let (pool, queue) = pool_and_queue(&device, 0);
        let recorder = executable(&pool);
        let semaphore = Semaphore::create(&device).unwrap();
        driver.inject_failure(SoftCall::QueueSubmit, vk::Result::ERROR_OUT_OF_HOST_MEMORY);
        let err = queue
            .submit_one(
                QueueSubmission::new().commands(&recorder).signal(&semaphore),
                None,
            )
            .unwrap_err();
        assert_eq!(err.vk_result(), Some(vk::Result::ERROR_OUT_OF_HOST_MEMORY));
        assert_eq!(recorder.state(), RecorderState::Executable);
        assert!(!semaphore.has_pending_signal());
    }

    #[test]
    fn device_loss_is_latched() {
        let (driver, device) = soft_device();
        let (pool, queue) = pool_and_queue(&device, 0);
        let recorder = executable(&pool);
        driver.lose_device();
        let err = queue
            .submit_one(QueueSubmission::new().commands(&recorder), None)
            .unwrap_err();
        assert!(err.is_device_lost());
        assert!(device.is_lost());
        let err = Semaphore::create(&device).unwrap_err();
        assert!(err.is_device_lost());
    }

    #[test]
    fn empty_presentation_is_rejected() {
        let (_, device) = soft_device();
        let (_, queue) = pool_and_queue(&device, 0);
        let err = queue.present(QueuePresentation::new()).unwrap_err();
        assert_eq!(
            violation(err),
            ProtocolViolation::ZeroSized {
                what: "present target count"
            }
        );
    }
}
