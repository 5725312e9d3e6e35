//! Shared setup for integration tests.

#![allow(dead_code)]

use ash::vk;
use std::sync::Arc;
use tessera_gpu::{
    CommandPool, CommandRecorder, Device, DeviceConfig, Queue, SoftDriver, SoftDriverConfig,
};
use tracing_subscriber::EnvFilter;

/// Route crate logs to the test output. Safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Software device that reports violations as errors.
pub fn soft_device() -> (Arc<SoftDriver>, Device) {
    soft_device_with(SoftDriverConfig::default(), false)
}

pub fn soft_device_with(config: SoftDriverConfig, strict: bool) -> (Arc<SoftDriver>, Device) {
    init_tracing();
    let driver = Arc::new(SoftDriver::new(config));
    let device = Device::new(driver.clone(), DeviceConfig::default().strict_protocol(strict));
    (driver, device)
}

/// A queue on `family` with a resettable pool for it.
pub struct FamilyQueue {
    pub pool: CommandPool,
    pub queue: Queue,
}

impl FamilyQueue {
    pub fn new(device: &Device, family: u32) -> Self {
        let family = device.queue_family(family).expect("queue family");
        let pool = CommandPool::create(
            device,
            &family,
            vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
        )
        .expect("command pool");
        let queue = Queue::new(device, &family, 0).expect("queue");
        Self { pool, queue }
    }

    /// A primary recorder already in the recording state.
    pub fn recording(&self) -> CommandRecorder {
        let mut recorder = self
            .pool
            .allocate(vk::CommandBufferLevel::PRIMARY)
            .expect("recorder");
        recorder
            .begin(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)
            .expect("begin");
        recorder
    }
}
