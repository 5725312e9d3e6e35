//! Driver implementations.

pub mod soft;
pub mod vulkan;
