//! The `ash` backend.
//!
//! [`VulkanBackend`] owns the loader entry, the instance, the chosen physical device and the
//! logical device. [`VulkanBackend::create`] performs the whole bring-up and returns both the
//! backend (for the Vulkan-only helpers such as [`Swapchain`](crate::swapchain::Swapchain) and
//! [`Allocator`](crate::alloc::Allocator)) and the [`Device`] context every other component
//! takes.
//!
//! ```no_run
//! # use scoria::vulkan::{ContextConfig, VulkanBackend};
//! let (vulkan, device) = VulkanBackend::create(&ContextConfig::default()).unwrap();
//! println!("Decode family: {:?}", device.families().decode);
//! ```

use std::{
    borrow::Cow,
    collections::BTreeSet,
    ffi::{CStr, CString, c_void},
    sync::Arc,
};

use ash::{prelude::VkResult, vk};
use serde::Deserialize;

use crate::{
    Device, Error, Result,
    backend::DeviceBackend,
    device::QueueFamilies,
};

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Validation messages that are expected for this engine's usage patterns.
const MUTED_MESSAGE_IDS: &[u32] = &[
    0x086974c1, // BestPractices-vkCreateCommandPool-command-buffer-reset
    0xfd92477a, // BestPractices-vkAllocateMemory-small-allocation
    0x618ab1e7, // VUID-VkImageViewCreateInfo-usage-02275
    0x30f4ac70, // VUID-VkImageCreateInfo-pNext-06811
    0x77c5e4e8,
    0x79b1d0c3,
    0xfd38b0b6,
];

/// Settings for [`VulkanBackend::create`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Shown in debugging and capture tools.
    pub application_name: String,
    /// Enables the Khronos validation layer and routes its output through `tracing`.
    /// Silently skipped when the layer is not installed.
    pub validation: bool,
    /// Enables `VK_KHR_surface` and `VK_KHR_swapchain`.
    pub swapchain: bool,
    /// Additional instance extensions, typically the platform surface extension required by
    /// the windowing library.
    pub instance_extensions: Vec<String>,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            application_name: "scoria".to_owned(),
            validation: cfg!(debug_assertions),
            swapchain: true,
            instance_extensions: Vec::new(),
        }
    }
}

struct DebugMessenger {
    loader: ash::ext::debug_utils::Instance,
    messenger: vk::DebugUtilsMessengerEXT,
}

/// A Vulkan 1.3 device driven through `ash`.
pub struct VulkanBackend {
    entry: ash::Entry,
    instance: ash::Instance,
    debug: Option<DebugMessenger>,
    physical_device: vk::PhysicalDevice,
    properties: vk::PhysicalDeviceProperties,
    device: ash::Device,
    surface_loader: Option<ash::khr::surface::Instance>,
    swapchain_loader: Option<ash::khr::swapchain::Device>,
    families: QueueFamilies,
}

impl VulkanBackend {
    /// Brings up the instance and device and wraps the result in a [`Device`] context.
    pub fn create(config: &ContextConfig) -> Result<(Arc<VulkanBackend>, Device)> {
        let backend = Arc::new(Self::new(config)?);
        let device = Device::new(backend.clone(), backend.families);
        Ok((backend, device))
    }

    pub fn new(config: &ContextConfig) -> Result<Self> {
        let entry = unsafe { ash::Entry::load()? };
        let (instance, debug) = create_instance(&entry, config)?;

        let selected = select_physical_device(&instance).and_then(|physical_device| {
            let properties = unsafe { instance.get_physical_device_properties(physical_device) };
            let queue_families = unsafe {
                instance.get_physical_device_queue_family_properties(physical_device)
            };
            let families = discover_queue_families(&queue_families)?;
            Ok((physical_device, properties, families))
        });
        let (physical_device, properties, families) = match selected {
            Ok(selected) => selected,
            Err(err) => {
                unsafe { destroy_instance(&instance, debug.as_ref()) };
                return Err(err);
            }
        };
        tracing::info!(
            device = ?properties.device_name_as_c_str().unwrap_or(c"unknown"),
            device_type = ?properties.device_type,
            api_version = %format_version(properties.api_version),
            "Selected physical device"
        );

        let device = match create_device(&instance, physical_device, &families, config.swapchain)
        {
            Ok(device) => device,
            Err(err) => {
                unsafe { destroy_instance(&instance, debug.as_ref()) };
                return Err(err);
            }
        };

        let surface_loader = config
            .swapchain
            .then(|| ash::khr::surface::Instance::new(&entry, &instance));
        let swapchain_loader = config
            .swapchain
            .then(|| ash::khr::swapchain::Device::new(&instance, &device));

        Ok(Self {
            entry,
            instance,
            debug,
            physical_device,
            properties,
            device,
            surface_loader,
            swapchain_loader,
            families,
        })
    }

    pub fn entry(&self) -> &ash::Entry {
        &self.entry
    }

    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    pub fn properties(&self) -> &vk::PhysicalDeviceProperties {
        &self.properties
    }

    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    pub fn families(&self) -> QueueFamilies {
        self.families
    }

    /// The `VK_KHR_surface` loader, if swapchain support was requested.
    pub fn surface_loader(&self) -> Option<&ash::khr::surface::Instance> {
        self.surface_loader.as_ref()
    }

    /// The `VK_KHR_swapchain` loader, if swapchain support was requested.
    pub fn swapchain_loader(&self) -> Option<&ash::khr::swapchain::Device> {
        self.swapchain_loader.as_ref()
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        unsafe {
            if let Err(err) = self.device.device_wait_idle() {
                tracing::error!(?err, "Failed to wait for device idle before destruction");
            }
            self.device.destroy_device(None);
            destroy_instance(&self.instance, self.debug.as_ref());
        }
    }
}

unsafe fn destroy_instance(instance: &ash::Instance, debug: Option<&DebugMessenger>) {
    unsafe {
        if let Some(debug) = debug {
            debug
                .loader
                .destroy_debug_utils_messenger(debug.messenger, None);
        }
        instance.destroy_instance(None);
    }
}

fn format_version(version: u32) -> String {
    format!(
        "{}.{}.{}",
        vk::api_version_major(version),
        vk::api_version_minor(version),
        vk::api_version_patch(version)
    )
}

fn create_instance(
    entry: &ash::Entry,
    config: &ContextConfig,
) -> Result<(ash::Instance, Option<DebugMessenger>)> {
    let available_layers = unsafe { entry.enumerate_instance_layer_properties()? };
    let available_extensions = unsafe { entry.enumerate_instance_extension_properties(None)? };
    let has_extension = |name: &CStr| {
        available_extensions
            .iter()
            .any(|ext| ext.extension_name_as_c_str() == Ok(name))
    };

    let validation = config.validation
        && available_layers
            .iter()
            .any(|layer| layer.layer_name_as_c_str() == Ok(VALIDATION_LAYER));
    if config.validation && !validation {
        tracing::warn!("Validation requested but {VALIDATION_LAYER:?} is not installed");
    }
    let debug_utils = validation && has_extension(ash::ext::debug_utils::NAME);

    let mut extensions: Vec<Cow<'static, CStr>> = Vec::new();
    if debug_utils {
        extensions.push(Cow::Borrowed(ash::ext::debug_utils::NAME));
    }
    if config.swapchain {
        extensions.push(Cow::Borrowed(ash::khr::surface::NAME));
    }
    for name in &config.instance_extensions {
        let Ok(name) = CString::new(name.as_str()) else {
            tracing::warn!(extension = %name, "Ignoring malformed extension name");
            continue;
        };
        if !extensions.iter().any(|ext| ext.as_ref() == name.as_c_str()) {
            extensions.push(Cow::Owned(name));
        }
    }
    #[cfg(target_vendor = "apple")]
    let portability = has_extension(ash::khr::portability_enumeration::NAME);
    #[cfg(target_vendor = "apple")]
    if portability {
        extensions.push(Cow::Borrowed(ash::khr::portability_enumeration::NAME));
    }
    let extension_ptrs: Vec<_> = extensions.iter().map(|ext| ext.as_ptr()).collect();
    let layer_ptrs: Vec<_> = if validation {
        vec![VALIDATION_LAYER.as_ptr()]
    } else {
        Vec::new()
    };

    let application_name = CString::new(config.application_name.as_str())
        .unwrap_or_else(|_| c"scoria".to_owned());
    let application_info = vk::ApplicationInfo::default()
        .application_name(&application_name)
        .engine_name(c"scoria")
        .api_version(vk::API_VERSION_1_3);
    #[allow(unused_mut)]
    let mut flags = vk::InstanceCreateFlags::empty();
    #[cfg(target_vendor = "apple")]
    if portability {
        flags |= vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR;
    }
    let create_info = vk::InstanceCreateInfo::default()
        .flags(flags)
        .application_info(&application_info)
        .enabled_layer_names(&layer_ptrs)
        .enabled_extension_names(&extension_ptrs);
    let instance = unsafe { entry.create_instance(&create_info, None)? };

    let debug = if debug_utils {
        let loader = ash::ext::debug_utils::Instance::new(entry, &instance);
        let info = vk::DebugUtilsMessengerCreateInfoEXT::default()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                    | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::INFO,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));
        match unsafe { loader.create_debug_utils_messenger(&info, None) } {
            Ok(messenger) => Some(DebugMessenger { loader, messenger }),
            Err(err) => {
                tracing::warn!(?err, "Failed to create debug messenger");
                None
            }
        }
    } else {
        None
    };
    Ok((instance, debug))
}

unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    ty: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user_data: *mut c_void,
) -> vk::Bool32 {
    if data.is_null() {
        return vk::FALSE;
    }
    let data = unsafe { &*data };
    if MUTED_MESSAGE_IDS.contains(&(data.message_id_number as u32)) {
        return vk::FALSE;
    }
    let message = unsafe { data.message_as_c_str() }
        .map(CStr::to_string_lossy)
        .unwrap_or(Cow::Borrowed("(no message)"));
    let id = unsafe { data.message_id_name_as_c_str() }
        .map(CStr::to_string_lossy)
        .unwrap_or(Cow::Borrowed(""));
    match severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            tracing::error!(?ty, %id, "{message}")
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            tracing::warn!(?ty, %id, "{message}")
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::INFO => {
            tracing::debug!(?ty, %id, "{message}")
        }
        _ => tracing::trace!(?ty, %id, "{message}"),
    }
    vk::FALSE
}

fn select_physical_device(instance: &ash::Instance) -> Result<vk::PhysicalDevice> {
    let physical_devices = unsafe { instance.enumerate_physical_devices()? };
    physical_devices
        .into_iter()
        .filter(|&pd| {
            let properties = unsafe { instance.get_physical_device_properties(pd) };
            properties.api_version >= vk::API_VERSION_1_3
        })
        .min_by_key(|&pd| {
            let properties = unsafe { instance.get_physical_device_properties(pd) };
            match properties.device_type {
                vk::PhysicalDeviceType::DISCRETE_GPU => 0,
                vk::PhysicalDeviceType::INTEGRATED_GPU => 1,
                vk::PhysicalDeviceType::VIRTUAL_GPU => 2,
                vk::PhysicalDeviceType::CPU => 3,
                _ => 4,
            }
        })
        .ok_or(Error::NoDevice)
}

/// Picks a family for each role.
///
/// Compute and transfer prefer dedicated families so uploads and ownership transfers run on
/// their own hardware queues when the device has them.
fn discover_queue_families(properties: &[vk::QueueFamilyProperties]) -> Result<QueueFamilies> {
    let find = |required: vk::QueueFlags, excluded: vk::QueueFlags| {
        properties
            .iter()
            .position(|p| {
                p.queue_count > 0
                    && p.queue_flags.contains(required)
                    && !p.queue_flags.intersects(excluded)
            })
            .map(|i| i as u32)
    };
    let graphics = find(vk::QueueFlags::GRAPHICS, vk::QueueFlags::empty())
        .ok_or(Error::MissingQueueFamily(vk::QueueFlags::GRAPHICS))?;
    let compute = find(vk::QueueFlags::COMPUTE, vk::QueueFlags::GRAPHICS).unwrap_or(graphics);
    let transfer = find(
        vk::QueueFlags::TRANSFER,
        vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE,
    )
    .or_else(|| find(vk::QueueFlags::TRANSFER, vk::QueueFlags::GRAPHICS))
    .unwrap_or(graphics);
    Ok(QueueFamilies {
        graphics,
        compute,
        transfer,
        decode: find(vk::QueueFlags::VIDEO_DECODE_KHR, vk::QueueFlags::empty()),
        encode: find(vk::QueueFlags::VIDEO_ENCODE_KHR, vk::QueueFlags::empty()),
    })
}

fn create_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    families: &QueueFamilies,
    swapchain: bool,
) -> Result<ash::Device> {
    let available: BTreeSet<CString> =
        unsafe { instance.enumerate_device_extension_properties(physical_device)? }
            .iter()
            .filter_map(|ext| ext.extension_name_as_c_str().ok().map(CStr::to_owned))
            .collect();
    let mut extensions: Vec<&'static CStr> = Vec::new();
    if swapchain {
        if !available.contains(ash::khr::swapchain::NAME) {
            return Err(Error::NoDevice);
        }
        extensions.push(ash::khr::swapchain::NAME);
    }
    let video_extensions: &[(&CStr, bool)] = &[
        (ash::khr::video_queue::NAME, true),
        (ash::khr::video_decode_queue::NAME, families.decode.is_some()),
        (ash::khr::video_encode_queue::NAME, families.encode.is_some()),
    ];
    if families.decode.is_some() || families.encode.is_some() {
        for &(name, wanted) in video_extensions {
            if wanted && available.contains(name) {
                extensions.push(name);
            }
        }
    }
    #[cfg(target_vendor = "apple")]
    if available.contains(ash::khr::portability_subset::NAME) {
        tracing::warn!("Running on a Vulkan portability implementation");
        extensions.push(ash::khr::portability_subset::NAME);
    }
    let extension_ptrs: Vec<_> = extensions.iter().map(|ext| ext.as_ptr()).collect();

    let priorities = [1.0_f32];
    let queue_infos: Vec<_> = families
        .distinct()
        .into_iter()
        .map(|family| {
            vk::DeviceQueueCreateInfo::default()
                .queue_family_index(family)
                .queue_priorities(&priorities)
        })
        .collect();

    let mut features12 = vk::PhysicalDeviceVulkan12Features::default().timeline_semaphore(true);
    let mut features13 = vk::PhysicalDeviceVulkan13Features::default().synchronization2(true);
    let create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_infos)
        .enabled_extension_names(&extension_ptrs)
        .push_next(&mut features12)
        .push_next(&mut features13);
    let device = unsafe { instance.create_device(physical_device, &create_info, None)? };
    tracing::debug!(extensions = ?extensions, "Created logical device");
    Ok(device)
}

impl DeviceBackend for VulkanBackend {
    fn create_semaphore(
        &self,
        ty: vk::SemaphoreType,
        initial_value: u64,
    ) -> VkResult<vk::Semaphore> {
        let mut type_info = vk::SemaphoreTypeCreateInfo::default()
            .semaphore_type(ty)
            .initial_value(if ty == vk::SemaphoreType::TIMELINE {
                initial_value
            } else {
                0
            });
        let info = vk::SemaphoreCreateInfo::default().push_next(&mut type_info);
        unsafe { self.device.create_semaphore(&info, None) }
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe { self.device.destroy_semaphore(semaphore, None) }
    }

    fn semaphore_counter_value(&self, semaphore: vk::Semaphore) -> VkResult<u64> {
        unsafe { self.device.get_semaphore_counter_value(semaphore) }
    }

    fn wait_semaphores(
        &self,
        semaphores: &[vk::Semaphore],
        values: &[u64],
        wait_any: bool,
        timeout: u64,
    ) -> VkResult<()> {
        let info = vk::SemaphoreWaitInfo::default()
            .flags(if wait_any {
                vk::SemaphoreWaitFlags::ANY
            } else {
                vk::SemaphoreWaitFlags::empty()
            })
            .semaphores(semaphores)
            .values(values);
        unsafe { self.device.wait_semaphores(&info, timeout) }
    }

    fn signal_semaphore(&self, semaphore: vk::Semaphore, value: u64) -> VkResult<()> {
        let info = vk::SemaphoreSignalInfo::default()
            .semaphore(semaphore)
            .value(value);
        unsafe { self.device.signal_semaphore(&info) }
    }

    fn create_command_pool(&self, queue_family_index: u32) -> VkResult<vk::CommandPool> {
        let info = vk::CommandPoolCreateInfo::default()
            .flags(vk::CommandPoolCreateFlags::TRANSIENT)
            .queue_family_index(queue_family_index);
        unsafe { self.device.create_command_pool(&info, None) }
    }

    fn reset_command_pool(&self, pool: vk::CommandPool) -> VkResult<()> {
        unsafe {
            self.device
                .reset_command_pool(pool, vk::CommandPoolResetFlags::empty())
        }
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        unsafe { self.device.destroy_command_pool(pool, None) }
    }

    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> VkResult<vk::CommandBuffer> {
        let info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let buffers = unsafe { self.device.allocate_command_buffers(&info)? };
        buffers
            .into_iter()
            .next()
            .ok_or(vk::Result::ERROR_OUT_OF_HOST_MEMORY)
    }

    fn free_command_buffer(&self, pool: vk::CommandPool, command_buffer: vk::CommandBuffer) {
        unsafe { self.device.free_command_buffers(pool, &[command_buffer]) }
    }

    fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        let info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { self.device.begin_command_buffer(command_buffer, &info) }
    }

    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        unsafe { self.device.end_command_buffer(command_buffer) }
    }

    fn cmd_pipeline_barrier(
        &self,
        command_buffer: vk::CommandBuffer,
        image_barriers: &[vk::ImageMemoryBarrier2<'_>],
    ) {
        let info = vk::DependencyInfo::default().image_memory_barriers(image_barriers);
        unsafe { self.device.cmd_pipeline_barrier2(command_buffer, &info) }
    }

    fn cmd_copy_buffer_to_image(
        &self,
        command_buffer: vk::CommandBuffer,
        buffer: vk::Buffer,
        image: vk::Image,
        layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    ) {
        unsafe {
            self.device
                .cmd_copy_buffer_to_image(command_buffer, buffer, image, layout, regions)
        }
    }

    fn get_queue(&self, queue_family_index: u32, queue_index: u32) -> vk::Queue {
        unsafe { self.device.get_device_queue(queue_family_index, queue_index) }
    }

    fn queue_submit(
        &self,
        queue: vk::Queue,
        command_buffers: &[vk::CommandBuffer],
        waits: &[vk::SemaphoreSubmitInfo<'_>],
        signals: &[vk::SemaphoreSubmitInfo<'_>],
    ) -> VkResult<()> {
        let command_buffer_infos: Vec<_> = command_buffers
            .iter()
            .map(|&cb| vk::CommandBufferSubmitInfo::default().command_buffer(cb))
            .collect();
        let submit = vk::SubmitInfo2::default()
            .wait_semaphore_infos(waits)
            .command_buffer_infos(&command_buffer_infos)
            .signal_semaphore_infos(signals);
        unsafe {
            self.device
                .queue_submit2(queue, std::slice::from_ref(&submit), vk::Fence::null())
        }
    }

    fn wait_idle(&self) -> VkResult<()> {
        unsafe { self.device.device_wait_idle() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: 1,
            ..Default::default()
        }
    }

    #[test]
    fn prefers_dedicated_families() {
        let properties = [
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::VIDEO_DECODE_KHR),
            family(vk::QueueFlags::VIDEO_ENCODE_KHR),
        ];
        let families = discover_queue_families(&properties).unwrap();
        assert_eq!(
            families,
            QueueFamilies {
                graphics: 0,
                compute: 1,
                transfer: 2,
                decode: Some(3),
                encode: Some(4),
            }
        );
    }

    #[test]
    fn falls_back_to_the_graphics_family() {
        let properties =
            [family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER)];
        let families = discover_queue_families(&properties).unwrap();
        assert_eq!(families, QueueFamilies::single(0));
    }

    #[test]
    fn graphics_family_is_required() {
        let properties = [family(vk::QueueFlags::COMPUTE)];
        assert!(matches!(
            discover_queue_families(&properties),
            Err(Error::MissingQueueFamily(vk::QueueFlags::GRAPHICS))
        ));
    }

    #[test]
    fn config_defaults_fill_missing_fields() {
        let config = ContextConfig {
            application_name: "player".to_owned(),
            ..Default::default()
        };
        assert!(config.swapchain);
        assert!(config.instance_extensions.is_empty());
    }
}
