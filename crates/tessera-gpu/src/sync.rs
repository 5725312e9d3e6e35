//! Synchronization primitives.
//!
//! Fences signal the host when a submission completes, semaphores order work
//! between queue operations, and events are fine-grained signals settable
//! from either side.

use crate::command::CommandRecorder;
use crate::device::Device;
use crate::error::{ProtocolViolation, Result};
use ash::vk;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Host-side state of a fence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceState {
    /// Not attached to any pending submission.
    Unsubmitted,
    /// Attached to a submission that has not been observed to complete.
    Pending,
    Signalled,
}

/// Outcome of a fence wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceWait {
    Signalled,
    TimedOut,
}

#[derive(Debug)]
struct FenceInner {
    state: FenceState,
    /// Number of submissions this fence has been attached to.
    submitted: u64,
    /// Highest submission known to have completed.
    completed: u64,
}

/// A fence's view of one submission, used to learn when it retired.
#[derive(Debug, Clone)]
pub(crate) struct FenceTicket {
    inner: Arc<Mutex<FenceInner>>,
    generation: u64,
}

impl FenceTicket {
    fn is_complete(&self) -> bool {
        self.inner.lock().completed >= self.generation
    }
}

/// Everything that can prove a submission has finished executing.
#[derive(Debug, Clone)]
pub(crate) struct RetireToken {
    pub sequence: u64,
    pub queue_retired: Arc<AtomicU64>,
    pub device_retired: Arc<AtomicU64>,
    pub fence: Option<FenceTicket>,
}

impl RetireToken {
    pub fn is_retired(&self) -> bool {
        self.queue_retired.load(Ordering::Acquire) >= self.sequence
            || self.device_retired.load(Ordering::Acquire) >= self.sequence
            || self.fence.as_ref().is_some_and(FenceTicket::is_complete)
    }
}

/// A host-waitable fence.
pub struct Fence {
    device: Device,
    fence: vk::Fence,
    inner: Arc<Mutex<FenceInner>>,
    destroyed: bool,
}

impl std::fmt::Debug for Fence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fence")
            .field("fence", &self.fence)
            .field("state", &self.state())
            .finish()
    }
}

impl Fence {
    /// Create a fence, optionally already signalled.
    pub fn create(device: &Device, signalled: bool) -> Result<Self> {
        device.ensure_alive("creating fence")?;
        let result = unsafe { device.driver().create_fence(signalled) };
        let fence = device.check(result, "creating fence")?;
        let state = if signalled {
            FenceState::Signalled
        } else {
            FenceState::Unsubmitted
        };
        Ok(Self {
            device: device.clone(),
            fence,
            inner: Arc::new(Mutex::new(FenceInner {
                state,
                submitted: 0,
                completed: 0,
            })),
            destroyed: false,
        })
    }

    /// Get the raw fence handle.
    pub fn handle(&self) -> vk::Fence {
        self.fence
    }

    pub fn state(&self) -> FenceState {
        self.inner.lock().state
    }

    /// Number of submissions this fence has been attached to.
    pub fn submissions(&self) -> u64 {
        self.inner.lock().submitted
    }

    /// Number of those submissions known to have completed.
    pub fn completed_submissions(&self) -> u64 {
        self.inner.lock().completed
    }

    fn ensure_live(&self) -> Result<()> {
        if self.destroyed {
            return self
                .device
                .violation(ProtocolViolation::UseAfterDestroy { kind: "fence" });
        }
        Ok(())
    }

    fn mark_signalled(&self) {
        let mut inner = self.inner.lock();
        if inner.state == FenceState::Pending {
            inner.state = FenceState::Signalled;
            inner.completed = inner.submitted;
        }
    }

    /// Poll the fence without blocking.
    pub fn is_signalled(&self) -> Result<bool> {
        self.ensure_live()?;
        match self.state() {
            FenceState::Unsubmitted => Ok(false),
            FenceState::Signalled => Ok(true),
            FenceState::Pending => {
                let result = unsafe { self.device.driver().fence_status(self.fence) };
                let signalled = self.device.check(result, "querying fence status")?;
                if signalled {
                    self.mark_signalled();
                }
                Ok(signalled)
            }
        }
    }

    /// Block until the fence signals or `timeout_ns` elapses.
    ///
    /// Waiting with a non-zero timeout on a fence that was never submitted is
    /// a violation, since nothing could ever signal it.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn wait(&self, timeout_ns: u64) -> Result<FenceWait> {
        wait_for_fences(&self.device, &[self], true, timeout_ns)
    }

    /// Return the fence to the unsignalled state.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn reset(&self) -> Result<()> {
        self.ensure_live()?;
        if self.state() == FenceState::Pending && !self.is_signalled()? {
            return self.device.violation(ProtocolViolation::FenceResetWhilePending);
        }
        let result = unsafe { self.device.driver().reset_fences(&[self.fence]) };
        self.device.check(result, "resetting fence")?;
        self.inner.lock().state = FenceState::Unsubmitted;
        Ok(())
    }

    /// Fails unless the fence can be attached to a new submission.
    pub(crate) fn check_submittable(&self) -> std::result::Result<(), ProtocolViolation> {
        if self.destroyed {
            return Err(ProtocolViolation::UseAfterDestroy { kind: "fence" });
        }
        match self.state() {
            FenceState::Unsubmitted => Ok(()),
            _ => Err(ProtocolViolation::FenceNotReset),
        }
    }

    /// Attach the fence to a submission that has just been issued.
    pub(crate) fn mark_pending(&self) -> FenceTicket {
        let mut inner = self.inner.lock();
        inner.state = FenceState::Pending;
        inner.submitted += 1;
        FenceTicket {
            inner: Arc::clone(&self.inner),
            generation: inner.submitted,
        }
    }

    /// Destroy the fence.
    pub fn destroy(&mut self) -> Result<()> {
        self.ensure_live()?;
        unsafe { self.device.driver().destroy_fence(self.fence) };
        self.destroyed = true;
        Ok(())
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        if !self.destroyed {
            unsafe { self.device.driver().destroy_fence(self.fence) };
        }
    }
}

/// Wait on several fences at once.
///
/// With `wait_all` false the wait ends as soon as any fence signals.
#[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
pub fn wait_for_fences(
    device: &Device,
    fences: &[&Fence],
    wait_all: bool,
    timeout_ns: u64,
) -> Result<FenceWait> {
    device.ensure_alive("waiting for fences")?;
    for fence in fences {
        fence.ensure_live()?;
    }

    let states: Vec<FenceState> = fences.iter().map(|f| f.state()).collect();
    let any_unsubmitted = states.contains(&FenceState::Unsubmitted);
    let any_signalled = states.contains(&FenceState::Signalled);
    let pending: Vec<&Fence> = fences
        .iter()
        .zip(&states)
        .filter(|(_, state)| **state == FenceState::Pending)
        .map(|(fence, _)| *fence)
        .collect();

    if !wait_all && any_signalled {
        return Ok(FenceWait::Signalled);
    }
    if (wait_all && any_unsubmitted) || pending.is_empty() {
        if !any_unsubmitted {
            return Ok(FenceWait::Signalled);
        }
        if timeout_ns == 0 {
            return Ok(FenceWait::TimedOut);
        }
        return device.violation(ProtocolViolation::FenceNeverSubmitted);
    }

    let handles: Vec<vk::Fence> = pending.iter().map(|f| f.fence).collect();
    let result = unsafe { device.driver().wait_for_fences(&handles, wait_all, timeout_ns) };
    let signalled = device.check(result, "waiting for fences")?;
    if !signalled {
        return Ok(FenceWait::TimedOut);
    }

    if wait_all {
        for fence in &pending {
            fence.mark_signalled();
        }
    } else {
        for fence in &pending {
            fence.is_signalled()?;
        }
    }
    Ok(FenceWait::Signalled)
}

/// A binary semaphore ordering work between queue operations.
pub struct Semaphore {
    device: Device,
    semaphore: vk::Semaphore,
    pending: AtomicBool,
    destroyed: bool,
}

impl std::fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Semaphore")
            .field("semaphore", &self.semaphore)
            .field("pending", &self.has_pending_signal())
            .finish()
    }
}

impl Semaphore {
    /// Create a semaphore.
    pub fn create(device: &Device) -> Result<Self> {
        device.ensure_alive("creating semaphore")?;
        let result = unsafe { device.driver().create_semaphore() };
        let semaphore = device.check(result, "creating semaphore")?;
        Ok(Self {
            device: device.clone(),
            semaphore,
            pending: AtomicBool::new(false),
            destroyed: false,
        })
    }

    /// Get the raw semaphore handle.
    pub fn handle(&self) -> vk::Semaphore {
        self.semaphore
    }

    /// Whether a signal operation has been issued that no wait has consumed.
    pub fn has_pending_signal(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    pub(crate) fn set_pending(&self, pending: bool) {
        self.pending.store(pending, Ordering::Release);
    }

    pub(crate) fn check_live(&self) -> std::result::Result<(), ProtocolViolation> {
        if self.destroyed {
            return Err(ProtocolViolation::UseAfterDestroy { kind: "semaphore" });
        }
        Ok(())
    }

    /// Destroy the semaphore.
    pub fn destroy(&mut self) -> Result<()> {
        self.device.protocol(self.check_live())?;
        unsafe { self.device.driver().destroy_semaphore(self.semaphore) };
        self.destroyed = true;
        Ok(())
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        if !self.destroyed {
            unsafe { self.device.driver().destroy_semaphore(self.semaphore) };
        }
    }
}

/// Status of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventStatus {
    Set,
    Reset,
}

/// An event settable and resettable from the host or from recorded commands.
pub struct Event {
    device: Device,
    event: vk::Event,
    destroyed: bool,
}

impl Event {
    /// Stage used when recording set and reset commands without a better
    /// choice.
    pub const DEFAULT_STAGE: vk::PipelineStageFlags = vk::PipelineStageFlags::BOTTOM_OF_PIPE;

    /// Create an event in the reset state.
    pub fn create(device: &Device) -> Result<Self> {
        device.ensure_alive("creating event")?;
        let result = unsafe { device.driver().create_event() };
        let event = device.check(result, "creating event")?;
        Ok(Self {
            device: device.clone(),
            event,
            destroyed: false,
        })
    }

    /// Get the raw event handle.
    pub fn handle(&self) -> vk::Event {
        self.event
    }

    fn ensure_live(&self) -> Result<()> {
        if self.destroyed {
            return self
                .device
                .violation(ProtocolViolation::UseAfterDestroy { kind: "event" });
        }
        Ok(())
    }

    pub fn status(&self) -> Result<EventStatus> {
        self.ensure_live()?;
        let result = unsafe { self.device.driver().event_status(self.event) };
        let set = self.device.check(result, "querying event status")?;
        Ok(if set {
            EventStatus::Set
        } else {
            EventStatus::Reset
        })
    }

    pub fn is_set(&self) -> Result<bool> {
        Ok(self.status()? == EventStatus::Set)
    }

    /// Set the event from the host.
    pub fn set(&self) -> Result<()> {
        self.ensure_live()?;
        let result = unsafe { self.device.driver().set_event(self.event) };
        self.device.check(result, "setting event")
    }

    /// Reset the event from the host.
    pub fn reset(&self) -> Result<()> {
        self.ensure_live()?;
        let result = unsafe { self.device.driver().reset_event(self.event) };
        self.device.check(result, "resetting event")
    }

    /// Record a command setting the event once `stage` completes.
    pub fn cmd_set(&self, recorder: &mut CommandRecorder, stage: vk::PipelineStageFlags) -> Result<()> {
        self.ensure_live()?;
        let cmd = recorder.recording()?;
        unsafe { self.device.driver().cmd_set_event(cmd, self.event, stage) };
        Ok(())
    }

    /// Record a command resetting the event once `stage` completes.
    pub fn cmd_reset(
        &self,
        recorder: &mut CommandRecorder,
        stage: vk::PipelineStageFlags,
    ) -> Result<()> {
        self.ensure_live()?;
        let cmd = recorder.recording()?;
        unsafe { self.device.driver().cmd_reset_event(cmd, self.event, stage) };
        Ok(())
    }

    /// Record a wait on all of `events` before `dst_stage` of later commands.
    pub fn cmd_wait(
        recorder: &mut CommandRecorder,
        events: &[&Self],
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
    ) -> Result<()> {
        for event in events {
            event.ensure_live()?;
        }
        let cmd = recorder.recording()?;
        let handles: Vec<vk::Event> = events.iter().map(|e| e.event).collect();
        unsafe {
            recorder
                .device()
                .driver()
                .cmd_wait_events(cmd, &handles, src_stage, dst_stage);
        }
        Ok(())
    }

    /// Destroy the event.
    pub fn destroy(&mut self) -> Result<()> {
        self.ensure_live()?;
        unsafe { self.device.driver().destroy_event(self.event) };
        self.destroyed = true;
        Ok(())
    }
}

impl Drop for Event {
    fn drop(&mut self) {
        if !self.destroyed {
            unsafe { self.device.driver().destroy_event(self.event) };
        }
    }
}
