//! Logical device handle shared by every resource.

use crate::driver::Driver;
use crate::error::{GpuError, ProtocolViolation, Result, VkResultExt};
use crate::format;
use crate::physical::{self, PhysicalDevice, QueueFamily};
use ash::prelude::VkResult;
use ash::vk;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Device-wide behavior switches.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Panic on protocol violations instead of returning them.
    pub strict_protocol: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            strict_protocol: cfg!(debug_assertions),
        }
    }
}

impl DeviceConfig {
    /// Set whether protocol violations panic.
    pub fn strict_protocol(mut self, strict: bool) -> Self {
        self.strict_protocol = strict;
        self
    }
}

struct DeviceShared {
    driver: Arc<dyn Driver>,
    config: DeviceConfig,
    lost: AtomicBool,
    /// Sequence number of the last submission on any queue.
    submitted: AtomicU64,
    /// Every submission up to this sequence number has retired.
    retired: Arc<AtomicU64>,
}

/// Cloneable handle to a logical device.
///
/// Resources keep a clone so they can release themselves on drop.
#[derive(Clone)]
pub struct Device {
    shared: Arc<DeviceShared>,
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("driver", &self.shared.driver.name())
            .field("device", &self.shared.driver.physical().name)
            .field("lost", &self.is_lost())
            .finish()
    }
}

impl Device {
    /// Wrap a driver.
    pub fn new(driver: Arc<dyn Driver>, config: DeviceConfig) -> Self {
        tracing::info!(
            backend = driver.name(),
            device = %driver.physical().summary(),
            strict = config.strict_protocol,
            "device ready"
        );
        Self {
            shared: Arc::new(DeviceShared {
                driver,
                config,
                lost: AtomicBool::new(false),
                submitted: AtomicU64::new(0),
                retired: Arc::new(AtomicU64::new(0)),
            }),
        }
    }

    /// The driver behind this device.
    pub fn driver(&self) -> &dyn Driver {
        self.shared.driver.as_ref()
    }

    pub fn physical(&self) -> &PhysicalDevice {
        self.shared.driver.physical()
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.shared.config
    }

    pub fn queue_families(&self) -> &[QueueFamily] {
        &self.physical().queue_families
    }

    /// Look up a queue family, reporting unknown indices as a violation.
    pub fn queue_family(&self, index: u32) -> Result<QueueFamily> {
        match self.physical().queue_family(index) {
            Some(family) => Ok(*family),
            None => self.violation(ProtocolViolation::UnknownQueueFamily { family: index }),
        }
    }

    /// Memory type for a resource's `type_filter` with all of `required`.
    pub fn find_memory_type_index(
        &self,
        type_filter: u32,
        required: vk::MemoryPropertyFlags,
    ) -> Result<u32> {
        self.physical()
            .find_memory_type_index(type_filter, required)
            .ok_or(GpuError::NoCompatibleMemoryType {
                type_filter,
                required,
            })
    }

    pub fn format_properties(&self, format: vk::Format) -> vk::FormatProperties {
        self.shared.driver.format_properties(format)
    }

    /// First candidate supporting `features` with the given tiling.
    pub fn find_supported_format(
        &self,
        candidates: &[vk::Format],
        tiling: vk::ImageTiling,
        features: vk::FormatFeatureFlags,
    ) -> Option<vk::Format> {
        physical::select_format(candidates, tiling, features, |f| self.format_properties(f))
    }

    /// Best depth format usable as an optimal-tiling attachment.
    pub fn find_depth_format(&self) -> Result<vk::Format> {
        let features = vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT;
        self.find_supported_format(&format::DEPTH_CANDIDATES, vk::ImageTiling::OPTIMAL, features)
            .ok_or(GpuError::UnsupportedFormat {
                format: format::DEPTH_CANDIDATES[0],
                features,
            })
    }

    /// Whether a device-lost error has been observed.
    pub fn is_lost(&self) -> bool {
        self.shared.lost.load(Ordering::Acquire)
    }

    /// Block until every queue is idle.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn wait_idle(&self) -> Result<()> {
        self.ensure_alive("waiting for device idle")?;
        let last = self.shared.submitted.load(Ordering::Acquire);
        let result = unsafe { self.driver().device_wait_idle() };
        self.check(result, "waiting for device idle")?;
        self.shared.retired.fetch_max(last, Ordering::AcqRel);
        Ok(())
    }

    /// Convert a driver result, latching device loss.
    pub(crate) fn check<T>(&self, result: VkResult<T>, context: &str) -> Result<T> {
        if result.as_ref().err() == Some(&vk::Result::ERROR_DEVICE_LOST)
            && !self.shared.lost.swap(true, Ordering::AcqRel)
        {
            tracing::error!(context, "device lost");
        }
        result.context(context)
    }

    /// Fail fast once the device is lost.
    pub(crate) fn ensure_alive(&self, context: &str) -> Result<()> {
        if self.is_lost() {
            return Err(GpuError::DeviceLost {
                context: context.to_string(),
            });
        }
        Ok(())
    }

    /// Report a protocol violation.
    ///
    /// Panics in strict mode, otherwise returns it as an error.
    #[track_caller]
    pub(crate) fn violation<T>(&self, violation: ProtocolViolation) -> Result<T> {
        tracing::error!(%violation, "protocol violation");
        if self.shared.config.strict_protocol {
            panic!("protocol violation: {violation}");
        }
        Err(GpuError::Protocol(violation))
    }

    /// Report the violation carried by `result`, if any.
    #[track_caller]
    pub(crate) fn protocol<T>(&self, result: std::result::Result<T, ProtocolViolation>) -> Result<T> {
        match result {
            Ok(value) => Ok(value),
            Err(violation) => self.violation(violation),
        }
    }

    /// Allocate the sequence number for a new submission.
    pub(crate) fn next_submission(&self) -> u64 {
        self.shared.submitted.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn retired_watermark(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.shared.retired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::soft::{SoftDriver, SoftDriverConfig};
    use crate::test_support::{soft_device, soft_device_with};

    #[test]
    fn depth_format_skips_unsupported_candidates() {
        let (_driver, device) = soft_device();
        assert_eq!(device.find_depth_format().unwrap(), vk::Format::D32_SFLOAT);

        let config = SoftDriverConfig::default().unsupported_format(vk::Format::D32_SFLOAT);
        let (_driver, device) = soft_device_with(config);
        assert_eq!(
            device.find_depth_format().unwrap(),
            vk::Format::D32_SFLOAT_S8_UINT
        );
    }

    #[test]
    fn unknown_queue_family_is_a_violation() {
        let (_driver, device) = soft_device();
        assert!(device.queue_family(2).is_ok());
        let err = device.queue_family(9).unwrap_err();
        assert_eq!(
            err.as_violation(),
            Some(&ProtocolViolation::UnknownQueueFamily { family: 9 })
        );
    }

    #[test]
    fn device_loss_is_sticky() {
        let (driver, device) = soft_device();
        device.wait_idle().unwrap();
        driver.lose_device();
        assert!(device.wait_idle().unwrap_err().is_device_lost());
        assert!(device.is_lost());
        assert!(device.ensure_alive("after loss").is_err());
    }

    #[test]
    #[should_panic(expected = "protocol violation")]
    fn strict_devices_panic_on_violations() {
        let driver = Arc::new(SoftDriver::new(SoftDriverConfig::default()));
        let device = Device::new(driver, DeviceConfig::default().strict_protocol(true));
        let _ = device.queue_family(5);
    }
}
