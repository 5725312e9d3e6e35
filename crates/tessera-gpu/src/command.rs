//! Command pools and command recorders.

use crate::device::Device;
use crate::error::{ProtocolViolation, Result};
use crate::physical::QueueFamily;
use crate::queue::{Queue, QueueSubmission};
use crate::sync::{Fence, RetireToken};
use ash::vk;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// State shared between a pool and the recorders allocated from it.
#[derive(Debug, Default)]
struct PoolShared {
    /// Bumped on every pool reset.
    epoch: AtomicU64,
    destroyed: AtomicBool,
}

/// Command pool for allocating command recorders.
pub struct CommandPool {
    device: Device,
    pool: vk::CommandPool,
    family: QueueFamily,
    flags: vk::CommandPoolCreateFlags,
    shared: Arc<PoolShared>,
}

impl CommandPool {
    /// Create a pool whose recorders submit to `family`.
    pub fn create(
        device: &Device,
        family: &QueueFamily,
        flags: vk::CommandPoolCreateFlags,
    ) -> Result<Self> {
        device.ensure_alive("creating command pool")?;
        let family = device.queue_family(family.index)?;
        let result = unsafe { device.driver().create_command_pool(family.index, flags) };
        let pool = device.check(result, "creating command pool")?;
        Ok(Self {
            device: device.clone(),
            pool,
            family,
            flags,
            shared: Arc::default(),
        })
    }

    /// Get the raw pool handle.
    pub fn handle(&self) -> vk::CommandPool {
        self.pool
    }

    /// Get the queue family.
    pub fn family(&self) -> &QueueFamily {
        &self.family
    }

    pub fn flags(&self) -> vk::CommandPoolCreateFlags {
        self.flags
    }

    fn ensure_live(&self) -> Result<()> {
        if self.shared.destroyed.load(Ordering::Acquire) {
            return self
                .device
                .violation(ProtocolViolation::UseAfterDestroy { kind: "command pool" });
        }
        Ok(())
    }

    /// Allocate a single recorder.
    pub fn allocate(&self, level: vk::CommandBufferLevel) -> Result<CommandRecorder> {
        let mut recorders = self.allocate_many(level, 1)?;
        Ok(recorders.remove(0))
    }

    /// Allocate `count` recorders in one call.
    pub fn allocate_array(
        &self,
        level: vk::CommandBufferLevel,
        count: u32,
    ) -> Result<CommandRecorderArray> {
        let recorders = self.allocate_many(level, count)?;
        Ok(CommandRecorderArray {
            device: self.device.clone(),
            pool: self.pool,
            recorders,
        })
    }

    fn allocate_many(
        &self,
        level: vk::CommandBufferLevel,
        count: u32,
    ) -> Result<Vec<CommandRecorder>> {
        self.ensure_live()?;
        if count == 0 {
            return self.device.violation(ProtocolViolation::ZeroSized {
                what: "recorder count",
            });
        }
        let result = unsafe {
            self.device
                .driver()
                .allocate_command_buffers(self.pool, level, count)
        };
        let buffers = self.device.check(result, "allocating command buffers")?;
        let epoch = self.shared.epoch.load(Ordering::Acquire);
        Ok(buffers
            .into_iter()
            .map(|cmd| CommandRecorder {
                device: self.device.clone(),
                pool: self.pool,
                pool_flags: self.flags,
                pool_shared: Arc::clone(&self.shared),
                family: self.family,
                cmd,
                level,
                status: Mutex::new(RecorderStatus {
                    state: RecorderState::Initial,
                    usage: vk::CommandBufferUsageFlags::empty(),
                    epoch,
                    in_flight: Vec::new(),
                }),
            })
            .collect())
    }

    /// Reset the pool, returning every recorder allocated from it to the
    /// initial state.
    ///
    /// None of the recorders may be pending.
    pub fn reset(&mut self) -> Result<()> {
        self.ensure_live()?;
        let result = unsafe { self.device.driver().reset_command_pool(self.pool) };
        self.device.check(result, "resetting command pool")?;
        self.shared.epoch.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Destroy the pool. Recorders allocated from it become freed.
    pub fn destroy(&mut self) -> Result<()> {
        self.ensure_live()?;
        unsafe { self.device.driver().destroy_command_pool(self.pool) };
        self.shared.destroyed.store(true, Ordering::Release);
        Ok(())
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        if !self.shared.destroyed.swap(true, Ordering::AcqRel) {
            unsafe { self.device.driver().destroy_command_pool(self.pool) };
        }
    }
}

/// Lifecycle state of a recorder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecorderState {
    Initial,
    Recording,
    Executable,
    /// Submitted and not yet known to have finished.
    Pending,
    /// A one-time-submit recording that has finished executing.
    Invalid,
    Freed,
}

impl RecorderState {
    pub fn name(self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::Recording => "recording",
            Self::Executable => "executable",
            Self::Pending => "pending",
            Self::Invalid => "invalid",
            Self::Freed => "freed",
        }
    }
}

#[derive(Debug)]
struct RecorderStatus {
    state: RecorderState,
    usage: vk::CommandBufferUsageFlags,
    epoch: u64,
    in_flight: Vec<RetireToken>,
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum QueueCapability {
    Graphics,
    Compute,
    Transfer,
}

/// A command buffer together with its lifecycle state.
///
/// Recorders are not freed on drop. Their pool reclaims them when it is
/// reset or destroyed.
pub struct CommandRecorder {
    device: Device,
    pool: vk::CommandPool,
    pool_flags: vk::CommandPoolCreateFlags,
    pool_shared: Arc<PoolShared>,
    family: QueueFamily,
    cmd: vk::CommandBuffer,
    level: vk::CommandBufferLevel,
    status: Mutex<RecorderStatus>,
}

impl std::fmt::Debug for CommandRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandRecorder")
            .field("cmd", &self.cmd)
            .field("family", &self.family.index)
            .field("state", &self.state())
            .finish()
    }
}

impl CommandRecorder {
    /// Usage applied when the caller has no specific requirement.
    pub const DEFAULT_USAGE: vk::CommandBufferUsageFlags =
        vk::CommandBufferUsageFlags::SIMULTANEOUS_USE;

    /// Get the raw command buffer handle.
    pub fn handle(&self) -> vk::CommandBuffer {
        self.cmd
    }

    pub fn family(&self) -> &QueueFamily {
        &self.family
    }

    pub fn level(&self) -> vk::CommandBufferLevel {
        self.level
    }

    pub(crate) fn device(&self) -> &Device {
        &self.device
    }

    fn refresh(&self, status: &mut RecorderStatus) {
        if status.state == RecorderState::Freed {
            return;
        }
        if self.pool_shared.destroyed.load(Ordering::Acquire) {
            status.state = RecorderState::Freed;
            status.in_flight.clear();
            return;
        }
        let epoch = self.pool_shared.epoch.load(Ordering::Acquire);
        if status.epoch != epoch {
            status.epoch = epoch;
            status.state = RecorderState::Initial;
            status.in_flight.clear();
            return;
        }
        if status.state == RecorderState::Pending {
            status.in_flight.retain(|token| !token.is_retired());
            if status.in_flight.is_empty() {
                status.state = if status
                    .usage
                    .contains(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)
                {
                    RecorderState::Invalid
                } else {
                    RecorderState::Executable
                };
            }
        }
    }

    /// Current state, accounting for retired submissions and pool resets.
    pub fn state(&self) -> RecorderState {
        let mut status = self.status.lock();
        self.refresh(&mut status);
        status.state
    }

    /// Usage flags of the current recording.
    pub fn usage(&self) -> vk::CommandBufferUsageFlags {
        self.status.lock().usage
    }

    fn unexpected<T>(&self, expected: &'static str, actual: RecorderState) -> Result<T> {
        if actual == RecorderState::Freed {
            return self.device.violation(ProtocolViolation::UseAfterDestroy {
                kind: "command recorder",
            });
        }
        self.device.violation(ProtocolViolation::RecorderState {
            expected,
            actual: actual.name(),
        })
    }

    /// Start recording. The recorder must be in the initial state.
    pub fn begin(&mut self, usage: vk::CommandBufferUsageFlags) -> Result<()> {
        let state = self.state();
        if state != RecorderState::Initial {
            return self.unexpected("initial", state);
        }
        let result = unsafe { self.device.driver().begin_command_buffer(self.cmd, usage) };
        self.device.check(result, "beginning command buffer")?;
        let status = self.status.get_mut();
        status.state = RecorderState::Recording;
        status.usage = usage;
        Ok(())
    }

    /// Finish recording.
    pub fn end(&mut self) -> Result<()> {
        let state = self.state();
        if state != RecorderState::Recording {
            return self.unexpected("recording", state);
        }
        let result = unsafe { self.device.driver().end_command_buffer(self.cmd) };
        self.device.check(result, "ending command buffer")?;
        self.status.get_mut().state = RecorderState::Executable;
        Ok(())
    }

    /// Return to the initial state. The pool must allow individual resets
    /// and the recorder must not be pending.
    pub fn reset(&mut self) -> Result<()> {
        let state = self.state();
        if matches!(state, RecorderState::Pending | RecorderState::Freed) {
            return self.unexpected("not pending", state);
        }
        if !self
            .pool_flags
            .contains(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
        {
            return self.device.violation(ProtocolViolation::PoolNotResettable);
        }
        let result = unsafe { self.device.driver().reset_command_buffer(self.cmd) };
        self.device.check(result, "resetting command buffer")?;
        let status = self.status.get_mut();
        status.state = RecorderState::Initial;
        status.usage = vk::CommandBufferUsageFlags::empty();
        Ok(())
    }

    /// Return the command buffer to its pool.
    pub fn free(&mut self) -> Result<()> {
        let state = self.state();
        if matches!(state, RecorderState::Pending | RecorderState::Freed) {
            return self.unexpected("not pending", state);
        }
        unsafe { self.device.driver().free_command_buffers(self.pool, &[self.cmd]) };
        self.status.get_mut().state = RecorderState::Freed;
        Ok(())
    }

    /// Handle to record into, failing unless recording.
    pub(crate) fn recording(&self) -> Result<vk::CommandBuffer> {
        self.device.ensure_alive("recording commands")?;
        let state = self.state();
        if state != RecorderState::Recording {
            return self.unexpected("recording", state);
        }
        Ok(self.cmd)
    }

    /// Fail unless this recorder's family can run `capability` commands.
    pub(crate) fn require(&self, capability: QueueCapability) -> Result<()> {
        let (supported, operation) = match capability {
            QueueCapability::Graphics => (self.family.supports_graphics(), "graphics"),
            QueueCapability::Compute => (self.family.supports_compute(), "compute"),
            QueueCapability::Transfer => (self.family.supports_transfer(), "transfer"),
        };
        if !supported {
            return self.device.violation(ProtocolViolation::UnsupportedByQueueFamily {
                family: self.family.index,
                operation,
            });
        }
        Ok(())
    }

    pub(crate) fn check_submittable(&self) -> std::result::Result<(), ProtocolViolation> {
        let mut status = self.status.lock();
        self.refresh(&mut status);
        match status.state {
            RecorderState::Executable => Ok(()),
            RecorderState::Pending
                if status
                    .usage
                    .contains(vk::CommandBufferUsageFlags::SIMULTANEOUS_USE) =>
            {
                Ok(())
            }
            RecorderState::Freed => Err(ProtocolViolation::UseAfterDestroy {
                kind: "command recorder",
            }),
            state => Err(ProtocolViolation::RecorderState {
                expected: "executable",
                actual: state.name(),
            }),
        }
    }

    pub(crate) fn mark_submitted(&self, token: RetireToken) {
        let mut status = self.status.lock();
        status.state = RecorderState::Pending;
        status.in_flight.push(token);
    }

    /// Record a raw pipeline barrier.
    ///
    /// Texture layouts are not updated by this call; prefer the texture
    /// transition methods for image barriers.
    pub fn cmd_pipeline_barrier(
        &mut self,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        buffer_barriers: &[vk::BufferMemoryBarrier<'_>],
        image_barriers: &[vk::ImageMemoryBarrier<'_>],
    ) -> Result<()> {
        let cmd = self.recording()?;
        unsafe {
            self.device.driver().cmd_pipeline_barrier(
                cmd,
                src_stage,
                dst_stage,
                buffer_barriers,
                image_barriers,
            );
        }
        Ok(())
    }

    /// Bind a compute pipeline.
    pub fn cmd_bind_compute_pipeline(&mut self, pipeline: vk::Pipeline) -> Result<()> {
        let cmd = self.recording()?;
        self.require(QueueCapability::Compute)?;
        unsafe { self.device.driver().cmd_bind_compute_pipeline(cmd, pipeline) };
        Ok(())
    }

    /// Bind descriptor sets for compute dispatches.
    pub fn cmd_bind_compute_descriptor_sets(
        &mut self,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
    ) -> Result<()> {
        let cmd = self.recording()?;
        self.require(QueueCapability::Compute)?;
        unsafe {
            self.device
                .driver()
                .cmd_bind_compute_descriptor_sets(cmd, layout, first_set, sets);
        }
        Ok(())
    }

    /// Push constants.
    pub fn cmd_push_constants<T: bytemuck::Pod>(
        &mut self,
        layout: vk::PipelineLayout,
        stages: vk::ShaderStageFlags,
        offset: u32,
        data: &T,
    ) -> Result<()> {
        let cmd = self.recording()?;
        unsafe {
            self.device.driver().cmd_push_constants(
                cmd,
                layout,
                stages,
                offset,
                bytemuck::bytes_of(data),
            );
        }
        Ok(())
    }

    /// Dispatch compute workgroups.
    pub fn cmd_dispatch(&mut self, x: u32, y: u32, z: u32) -> Result<()> {
        let cmd = self.recording()?;
        self.require(QueueCapability::Compute)?;
        unsafe { self.device.driver().cmd_dispatch(cmd, x, y, z) };
        Ok(())
    }
}

/// Recorders allocated together and freed together.
#[derive(Debug)]
pub struct CommandRecorderArray {
    device: Device,
    pool: vk::CommandPool,
    recorders: Vec<CommandRecorder>,
}

impl CommandRecorderArray {
    pub fn len(&self) -> usize {
        self.recorders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recorders.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&CommandRecorder> {
        self.recorders.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut CommandRecorder> {
        self.recorders.get_mut(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &CommandRecorder> {
        self.recorders.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut CommandRecorder> {
        self.recorders.iter_mut()
    }

    /// Free every recorder in one call. None may be pending.
    pub fn free(&mut self) -> Result<()> {
        let mut handles = Vec::with_capacity(self.recorders.len());
        for recorder in &self.recorders {
            match recorder.state() {
                RecorderState::Freed => {}
                RecorderState::Pending => return recorder.unexpected("not pending", RecorderState::Pending),
                _ => handles.push(recorder.cmd),
            }
        }
        if !handles.is_empty() {
            unsafe { self.device.driver().free_command_buffers(self.pool, &handles) };
        }
        for recorder in &mut self.recorders {
            recorder.status.get_mut().state = RecorderState::Freed;
        }
        Ok(())
    }
}

impl std::ops::Index<usize> for CommandRecorderArray {
    type Output = CommandRecorder;

    fn index(&self, index: usize) -> &CommandRecorder {
        &self.recorders[index]
    }
}

impl std::ops::IndexMut<usize> for CommandRecorderArray {
    fn index_mut(&mut self, index: usize) -> &mut CommandRecorder {
        &mut self.recorders[index]
    }
}

/// Record, submit and wait for a one-off batch of commands.
#[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
pub fn execute_single_time_commands<F>(pool: &CommandPool, queue: &Queue, f: F) -> Result<()>
where
    F: FnOnce(&mut CommandRecorder) -> Result<()>,
{
    let mut recorder = pool.allocate(vk::CommandBufferLevel::PRIMARY)?;
    let result = record_submit_and_wait(pool, queue, &mut recorder, f);
    // The device may still be reading a recorder whose wait failed.
    if recorder.state() == RecorderState::Pending {
        return result;
    }
    let freed = recorder.free();
    result.and(freed)
}

fn record_submit_and_wait<F>(
    pool: &CommandPool,
    queue: &Queue,
    recorder: &mut CommandRecorder,
    f: F,
) -> Result<()>
where
    F: FnOnce(&mut CommandRecorder) -> Result<()>,
{
    recorder.begin(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)?;
    f(recorder)?;
    recorder.end()?;

    let fence = Fence::create(&pool.device, false)?;
    queue.submit(&[QueueSubmission::new().commands(recorder)], Some(&fence))?;
    fence.wait(u64::MAX)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GpuError;
    use crate::test_support::{pool_and_queue, soft_device};

    fn violation(err: GpuError) -> ProtocolViolation {
        err.as_violation().cloned().expect("expected a protocol violation")
    }

    #[test]
    fn recorder_walks_its_lifecycle() {
        let (_, device) = soft_device();
        let (pool, queue) = pool_and_queue(&device, 0);
        let mut recorder = pool.allocate(vk::CommandBufferLevel::PRIMARY).unwrap();
        assert_eq!(recorder.state(), RecorderState::Initial);

        recorder.begin(CommandRecorder::DEFAULT_USAGE).unwrap();
        assert_eq!(recorder.state(), RecorderState::Recording);
        let err = recorder.begin(CommandRecorder::DEFAULT_USAGE).unwrap_err();
        assert_eq!(
            violation(err),
            ProtocolViolation::RecorderState {
                expected: "initial",
                actual: "recording"
            }
        );
        recorder.end().unwrap();
        assert_eq!(recorder.state(), RecorderState::Executable);

        let fence = Fence::create(&device, false).unwrap();
        queue
            .submit_one(QueueSubmission::new().commands(&recorder), Some(&fence))
            .unwrap();
        assert_eq!(recorder.state(), RecorderState::Pending);
        let err = recorder.reset().unwrap_err();
        assert_eq!(
            violation(err),
            ProtocolViolation::RecorderState {
                expected: "not pending",
                actual: "pending"
            }
        );

        fence.wait(u64::MAX).unwrap();
        assert_eq!(recorder.state(), RecorderState::Executable);
        recorder.reset().unwrap();
        assert_eq!(recorder.state(), RecorderState::Initial);
        recorder.free().unwrap();
        assert_eq!(recorder.state(), RecorderState::Freed);
    }

    #[test]
    fn one_time_recordings_become_invalid() {
        let (_, device) = soft_device();
        let (pool, queue) = pool_and_queue(&device, 0);
        let mut recorder = pool.allocate(vk::CommandBufferLevel::PRIMARY).unwrap();
        recorder
            .begin(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)
            .unwrap();
        recorder.end().unwrap();
        queue
            .submit_one(QueueSubmission::new().commands(&recorder), None)
            .unwrap();
        queue.wait_idle().unwrap();
        assert_eq!(recorder.state(), RecorderState::Invalid);

        let err = queue
            .submit_one(QueueSubmission::new().commands(&recorder), None)
            .unwrap_err();
        assert_eq!(
            violation(err),
            ProtocolViolation::RecorderState {
                expected: "executable",
                actual: "invalid"
            }
        );
    }

    #[test]
    fn individual_reset_needs_a_resettable_pool() {
        let (_, device) = soft_device();
        let family = device.queue_family(0).unwrap();
        let pool = CommandPool::create(&device, &family, vk::CommandPoolCreateFlags::empty()).unwrap();
        let mut recorder = pool.allocate(vk::CommandBufferLevel::PRIMARY).unwrap();
        let err = recorder.reset().unwrap_err();
        assert_eq!(violation(err), ProtocolViolation::PoolNotResettable);
    }

    #[test]
    fn pool_reset_and_destroy_reach_every_recorder() {
        let (driver, device) = soft_device();
        let (mut pool, _) = pool_and_queue(&device, 1);
        let mut recorders = pool
            .allocate_array(vk::CommandBufferLevel::PRIMARY, 3)
            .unwrap();
        for recorder in recorders.iter_mut() {
            recorder.begin(CommandRecorder::DEFAULT_USAGE).unwrap();
            recorder.end().unwrap();
        }
        pool.reset().unwrap();
        assert!(recorders.iter().all(|r| r.state() == RecorderState::Initial));

        pool.destroy().unwrap();
        assert!(recorders.iter().all(|r| r.state() == RecorderState::Freed));
        let err = recorders[0].begin(CommandRecorder::DEFAULT_USAGE).unwrap_err();
        assert_eq!(
            violation(err),
            ProtocolViolation::UseAfterDestroy {
                kind: "command recorder"
            }
        );
        // Freeing recorders already reclaimed by their pool is a no-op.
        recorders.free().unwrap();
        assert!(driver.diagnostics().is_empty());
    }

    #[test]
    fn arrays_free_together() {
        let (_, device) = soft_device();
        let (pool, _) = pool_and_queue(&device, 0);
        let mut recorders = pool
            .allocate_array(vk::CommandBufferLevel::PRIMARY, 2)
            .unwrap();
        assert_eq!(recorders.len(), 2);
        recorders.free().unwrap();
        assert!(recorders.iter().all(|r| r.state() == RecorderState::Freed));

        let err = pool
            .allocate_array(vk::CommandBufferLevel::PRIMARY, 0)
            .unwrap_err();
        assert_eq!(
            violation(err),
            ProtocolViolation::ZeroSized {
                what: "recorder count"
            }
        );
    }

    #[test]
    fn commands_check_family_capabilities() {
        let (_, device) = soft_device();
        let (pool, _) = pool_and_queue(&device, 2);
        let mut recorder = pool.allocate(vk::CommandBufferLevel::PRIMARY).unwrap();
        let err = recorder.cmd_dispatch(1, 1, 1).unwrap_err();
        assert_eq!(
            violation(err),
            ProtocolViolation::RecorderState {
                expected: "recording",
                actual: "initial"
            }
        );

        recorder.begin(CommandRecorder::DEFAULT_USAGE).unwrap();
        let err = recorder.cmd_dispatch(1, 1, 1).unwrap_err();
        assert_eq!(
            violation(err),
            ProtocolViolation::UnsupportedByQueueFamily {
                family: 2,
                operation: "compute"
            }
        );
    }

    #[test]
    fn single_time_commands_free_their_recorder() {
        let (driver, device) = soft_device();
        let (pool, queue) = pool_and_queue(&device, 0);
        execute_single_time_commands(&pool, &queue, |recorder| {
            assert_eq!(recorder.usage(), vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            Ok(())
        })
        .unwrap();
        assert_eq!(driver.pending_operations(), 0);
        assert!(driver.diagnostics().is_empty());
    }

    #[test]
    fn single_time_commands_free_their_recorder_on_failure() {
        let (driver, device) = soft_device();
        let (pool, queue) = pool_and_queue(&device, 0);
        let before = driver.live_command_buffers();

        let err = execute_single_time_commands(&pool, &queue, |_| {
            Err(GpuError::Other("recording failed".to_string()))
        })
        .unwrap_err();
        assert!(matches!(err, GpuError::Other(_)));
        assert_eq!(driver.live_command_buffers(), before);

        execute_single_time_commands(&pool, &queue, |_| Ok(())).unwrap();
        assert_eq!(driver.live_command_buffers(), before);
        assert!(driver.diagnostics().is_empty());
    }
}
