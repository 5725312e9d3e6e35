//! GPU error types.
//!
//! Two kinds of failure are kept apart:
//! - [`GpuError`] covers runtime failures reported by the driver or the
//!   environment (out of memory, device lost, missing format support).
//! - [`ProtocolViolation`] covers misuse of the API by the caller (mapping
//!   device-local memory, submitting an unfinished recorder, presenting an
//!   image that was never acquired). Violations are logged and, when the
//!   device runs in strict mode, turned into panics.

use ash::vk;
use thiserror::Error;

/// GPU-related errors.
#[derive(Error, Debug)]
pub enum GpuError {
    /// A driver call failed.
    #[error("Vulkan error while {context}: {result}")]
    Vulkan {
        /// The result code returned by the driver.
        result: vk::Result,
        /// What the library was doing when the call failed.
        context: String,
    },

    /// The device was lost. Every later call on the same device fails fast
    /// with this error.
    #[error("Device lost while {context}")]
    DeviceLost {
        /// What the library was doing when the loss was observed.
        context: String,
    },

    /// No suitable GPU found.
    #[error("No suitable GPU found")]
    NoSuitableDevice,

    /// Required extension not supported.
    #[error("Required extension not supported: {0}")]
    ExtensionNotSupported(String),

    /// No memory type satisfies both the resource and the requested properties.
    #[error("No memory type in filter {type_filter:#b} has properties {required:?}")]
    NoCompatibleMemoryType {
        /// Bitmask of acceptable memory type indices.
        type_filter: u32,
        /// Property flags that were requested.
        required: vk::MemoryPropertyFlags,
    },

    /// The format lacks a feature needed by the operation.
    #[error("Format {format:?} does not support {features:?}")]
    UnsupportedFormat {
        /// The format in question.
        format: vk::Format,
        /// Feature flags that were needed.
        features: vk::FormatFeatureFlags,
    },

    /// The caller broke a usage rule.
    #[error("Protocol violation: {0}")]
    Protocol(#[from] ProtocolViolation),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl GpuError {
    /// Returns the violation if this error is a protocol violation.
    pub fn as_violation(&self) -> Option<&ProtocolViolation> {
        match self {
            Self::Protocol(violation) => Some(violation),
            _ => None,
        }
    }

    /// Returns the raw driver result, if the error came from the driver.
    pub fn vk_result(&self) -> Option<vk::Result> {
        match self {
            Self::Vulkan { result, .. } => Some(*result),
            Self::DeviceLost { .. } => Some(vk::Result::ERROR_DEVICE_LOST),
            _ => None,
        }
    }

    /// Whether this error means the device is gone.
    pub fn is_device_lost(&self) -> bool {
        matches!(self, Self::DeviceLost { .. })
    }
}

/// Misuse of the API detected before it reached the driver.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolViolation {
    #[error("device-local memory cannot be mapped")]
    MapDeviceLocal,

    #[error("memory with properties {properties:?} is not host visible")]
    NotHostVisible { properties: vk::MemoryPropertyFlags },

    #[error("memory is already mapped")]
    AlreadyMapped,

    #[error("memory is not mapped")]
    NotMapped,

    #[error("memory must be unmapped before it is freed")]
    FreeWhileMapped,

    #[error("access [{offset}, {offset}+{size}) exceeds {limit} bytes")]
    OutOfBounds { offset: u64, size: u64, limit: u64 },

    #[error("{kind} used after it was destroyed")]
    UseAfterDestroy { kind: &'static str },

    #[error("{kind} has no memory bound")]
    Unbound { kind: &'static str },

    #[error("{kind} already has memory bound")]
    AlreadyBound { kind: &'static str },

    #[error("memory of {available} bytes cannot hold {required} bytes at offset {offset}")]
    MemoryTooSmall { offset: u64, required: u64, available: u64 },

    #[error("offset {offset} is not aligned to {alignment}")]
    Misaligned { offset: u64, alignment: u64 },

    #[error("memory type {memory_type} is not in filter {type_filter:#b}")]
    IncompatibleMemoryType { memory_type: u32, type_filter: u32 },

    #[error("{what} must not be zero")]
    ZeroSized { what: &'static str },

    #[error("usage flags must not be empty")]
    MissingUsage,

    #[error("memory properties must not be empty")]
    MissingMemoryProperties,

    #[error("{kind} lacks usage {required}")]
    MissingUsageFlag { kind: &'static str, required: &'static str },

    #[error("format must not be UNDEFINED")]
    UndefinedFormat,

    #[error("layout {layout:?} cannot be a steady layout")]
    InvalidSteadyLayout { layout: vk::ImageLayout },

    #[error("recorder is {actual}, expected {expected}")]
    RecorderState { expected: &'static str, actual: &'static str },

    #[error("recorder pool does not allow individual reset")]
    PoolNotResettable,

    #[error("recorder of family {recorder} cannot be submitted to a queue of family {queue}")]
    RecorderFamilyMismatch { recorder: u32, queue: u32 },

    #[error("queue family {family} does not support {operation}")]
    UnsupportedByQueueFamily { family: u32, operation: &'static str },

    #[error("queue index {index} is out of range for family {family} with {count} queues")]
    QueueIndexOutOfRange { family: u32, index: u32, count: u32 },

    #[error("queue family {family} does not exist on this device")]
    UnknownQueueFamily { family: u32 },

    #[error("exclusive resource owned by family {owner} used from family {family}")]
    ExclusiveOwnership { owner: u32, family: u32 },

    #[error("ownership transfer {from} -> {to} is incomplete")]
    OwnershipTransferPending { from: u32, to: u32 },

    #[error("no ownership transfer to family {family} was released")]
    NoOwnershipRelease { family: u32 },

    #[error("concurrent resources do not take part in ownership transfers")]
    ConcurrentOwnershipTransfer,

    #[error("mip level {level} is in {actual:?}, expected {expected:?}")]
    LayoutMismatch { level: u32, expected: vk::ImageLayout, actual: vk::ImageLayout },

    #[error("subresource (level {level}, layers {base_layer}+{layer_count}) is out of range")]
    SubresourceOutOfRange { level: u32, base_layer: u32, layer_count: u32 },

    #[error("semaphore waited on with no signal pending")]
    SemaphoreNotSignalled,

    #[error("semaphore signalled while a previous signal is still pending")]
    SemaphoreAlreadySignalled,

    #[error("wait stage mask must not be empty")]
    EmptyWaitStage,

    #[error("fence must be reset before it is submitted again")]
    FenceNotReset,

    #[error("fence cannot be reset while its submission is pending")]
    FenceResetWhilePending,

    #[error("fence was never submitted and would block forever")]
    FenceNeverSubmitted,

    #[error("acquire needs a semaphore or a fence")]
    AcquireWithoutSync,

    #[error("swapchain image {index} is already acquired")]
    DoubleAcquire { index: u32 },

    #[error("swapchain image {index} was not acquired before presenting")]
    PresentNotAcquired { index: u32 },

    #[error("swapchain image index {index} is out of range for {count} images")]
    ImageIndexOutOfRange { index: u32, count: u32 },

    #[error("the same swapchain appears twice in one present")]
    DuplicateSwapchain,
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, GpuError>;

/// Attach a description of the failing operation to raw driver results.
pub trait VkResultExt<T> {
    /// Convert to a [`GpuError`] describing what was being done.
    fn context(self, context: &str) -> Result<T>;
}

impl<T> VkResultExt<T> for std::result::Result<T, vk::Result> {
    fn context(self, context: &str) -> Result<T> {
        self.map_err(|result| match result {
            vk::Result::ERROR_DEVICE_LOST => GpuError::DeviceLost {
                context: context.to_string(),
            },
            result => GpuError::Vulkan {
                result,
                context: context.to_string(),
            },
        })
    }
}
