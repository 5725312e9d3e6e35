//! Building a [`Device`] on top of a real Vulkan implementation.

use super::instance::{
    create_debug_messenger, create_instance, describe_physical_device, select_physical_device,
};
use super::VulkanDriver;
use crate::device::{Device, DeviceConfig};
use crate::error::{GpuError, Result, VkResultExt};
use ash::prelude::VkResult;
use ash::vk;
use std::ffi::{c_char, CStr};
use std::sync::Arc;

/// Creates the window surface once the instance exists.
pub type SurfaceFactory = Box<dyn FnOnce(&ash::Entry, &ash::Instance) -> VkResult<vk::SurfaceKHR>>;

/// A Vulkan-backed device together with its driver.
#[derive(Debug, Clone)]
pub struct VulkanContext {
    driver: Arc<VulkanDriver>,
    device: Device,
}

impl VulkanContext {
    /// Get the device handle shared by resources.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Get the driver for raw interop (pipelines, descriptor sets).
    pub fn driver(&self) -> &Arc<VulkanDriver> {
        &self.driver
    }

    /// The surface created through [`VulkanContextBuilder::with_presentation`].
    pub fn surface(&self) -> Option<vk::SurfaceKHR> {
        self.driver.surface()
    }
}

/// Builder for a Vulkan-backed [`Device`].
pub struct VulkanContextBuilder {
    app_name: String,
    enable_validation: bool,
    config: DeviceConfig,
    surface_factory: Option<SurfaceFactory>,
}

impl Default for VulkanContextBuilder {
    fn default() -> Self {
        Self {
            app_name: "Tessera".to_string(),
            enable_validation: cfg!(debug_assertions),
            config: DeviceConfig::default(),
            surface_factory: None,
        }
    }
}

impl std::fmt::Debug for VulkanContextBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanContextBuilder")
            .field("app_name", &self.app_name)
            .field("enable_validation", &self.enable_validation)
            .field("config", &self.config)
            .field("presentation", &self.surface_factory.is_some())
            .finish()
    }
}

impl VulkanContextBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the application name.
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = name.into();
        self
    }

    /// Enable or disable validation layers.
    pub fn validation(mut self, enable: bool) -> Self {
        self.enable_validation = enable;
        self
    }

    /// Panic on protocol violations instead of returning them.
    pub fn strict_protocol(mut self, strict: bool) -> Self {
        self.config.strict_protocol = strict;
        self
    }

    /// Enable presentation, creating the surface with `factory`.
    ///
    /// Queue family present support is queried against that surface.
    pub fn with_presentation(
        mut self,
        factory: impl FnOnce(&ash::Entry, &ash::Instance) -> VkResult<vk::SurfaceKHR> + 'static,
    ) -> Self {
        self.surface_factory = Some(Box::new(factory));
        self
    }

    /// Build the device.
    pub fn build(self) -> Result<VulkanContext> {
        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| GpuError::Other(format!("Failed to load Vulkan: {e}")))?;

        let presentation = self.surface_factory.is_some();
        let instance =
            unsafe { create_instance(&entry, &self.app_name, self.enable_validation, presentation) }?;

        let debug = if self.enable_validation {
            let debug_utils = ash::ext::debug_utils::Instance::new(&entry, &instance);
            match unsafe { create_debug_messenger(&debug_utils) } {
                Ok(messenger) => Some((debug_utils, messenger)),
                Err(e) => {
                    tracing::warn!(error = %e, "debug messenger unavailable");
                    None
                }
            }
        } else {
            None
        };

        let surface_loader =
            presentation.then(|| ash::khr::surface::Instance::new(&entry, &instance));
        let surface = match self.surface_factory {
            Some(factory) => Some(factory(&entry, &instance).context("creating surface")?),
            None => None,
        };

        let physical_device = unsafe { select_physical_device(&instance) }?;
        let physical = unsafe {
            describe_physical_device(&instance, physical_device, |family| {
                match (&surface_loader, surface) {
                    (Some(loader), Some(surface)) => loader
                        .get_physical_device_surface_support(physical_device, family, surface)
                        .unwrap_or(false),
                    _ => false,
                }
            })
        };
        tracing::info!("Selected GPU: {}", physical.summary());

        let device = unsafe { create_device(&instance, physical_device, &physical, presentation) }?;
        let swapchain_loader =
            presentation.then(|| ash::khr::swapchain::Device::new(&instance, &device));

        let driver = Arc::new(VulkanDriver {
            entry,
            instance,
            debug,
            physical_device,
            physical,
            device,
            surface_loader,
            swapchain_loader,
            surface,
        });
        let device = Device::new(driver.clone(), self.config);
        Ok(VulkanContext { driver, device })
    }
}

/// Create the logical device with every queue of every family.
///
/// # Safety
/// The instance and physical device must be valid.
unsafe fn create_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    physical: &crate::physical::PhysicalDevice,
    presentation: bool,
) -> Result<ash::Device> {
    let priorities: Vec<Vec<f32>> = physical
        .queue_families
        .iter()
        .map(|family| vec![1.0; family.queue_count as usize])
        .collect();
    let queue_create_infos: Vec<vk::DeviceQueueCreateInfo<'_>> = physical
        .queue_families
        .iter()
        .zip(&priorities)
        .map(|(family, priorities)| {
            vk::DeviceQueueCreateInfo::default()
                .queue_family_index(family.index)
                .queue_priorities(priorities)
        })
        .collect();

    let extensions: Vec<&CStr> = if presentation {
        vec![ash::khr::swapchain::NAME]
    } else {
        Vec::new()
    };
    let extension_names: Vec<*const c_char> = extensions.iter().map(|e| e.as_ptr()).collect();

    let device_create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_create_infos)
        .enabled_extension_names(&extension_names);

    let device = unsafe { instance.create_device(physical_device, &device_create_info, None) }
        .context("creating logical device")?;
    Ok(device)
}
