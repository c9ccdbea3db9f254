// SPDX-License-Identifier: CEPL-1.0
//! GPU context: loader, instance, surface, physical/logical device and the graphics queue.

use std::ffi::CStr;
use std::os::raw::{c_char, c_void};
use std::sync::Arc;

use ash::ext::debug_utils;
use ash::khr::{surface, swapchain};
use ash::{vk, Entry, Instance};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle, RawDisplayHandle, RawWindowHandle};
use tracing::{debug, error, info, warn};

use crate::error::{creation, RenderError, Result};

const APP_NAME: &CStr = c"Lumen";
const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// First enumerated device wins; there is no scoring.
pub(crate) fn select_physical_device(devices: &[vk::PhysicalDevice]) -> Result<vk::PhysicalDevice> {
    devices
        .first()
        .copied()
        .ok_or(RenderError::UnsupportedDevice("no physical device enumerated"))
}

/// Index of the first queue family advertising graphics support.
pub(crate) fn select_queue_family(families: &[vk::QueueFamilyProperties]) -> Result<u32> {
    families
        .iter()
        .position(|q| q.queue_flags.contains(vk::QueueFlags::GRAPHICS))
        .map(|i| i as u32)
        .ok_or(RenderError::UnsupportedDevice("no graphics queue family"))
}

unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _types: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user: *mut c_void,
) -> vk::Bool32 {
    if data.is_null() {
        return vk::FALSE;
    }
    let p_message = unsafe { (*data).p_message };
    if p_message.is_null() {
        return vk::FALSE;
    }
    let msg = unsafe { CStr::from_ptr(p_message) }.to_string_lossy();
    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        error!("[vulkan] {msg}");
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        warn!("[vulkan] {msg}");
    } else {
        debug!("[vulkan] {msg}");
    }
    vk::FALSE
}

/// Validation is a debug-build feature and only requested when the loader has it.
fn validation_layers(entry: &Entry) -> Vec<*const c_char> {
    if !cfg!(debug_assertions) {
        return Vec::new();
    }
    let available = unsafe { entry.enumerate_instance_layer_properties() }.unwrap_or_default();
    let found = available
        .iter()
        .any(|l| l.layer_name_as_c_str().is_ok_and(|name| name == VALIDATION_LAYER));
    if found {
        vec![VALIDATION_LAYER.as_ptr()]
    } else {
        warn!("validation layer requested but not installed; continuing without it");
        Vec::new()
    }
}

/// Instance-level objects. Torn down after the logical device.
struct InstanceBase {
    _entry: Entry,
    instance: Instance,
    debug: Option<(debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
    surface_loader: surface::Instance,
    surface: vk::SurfaceKHR,
}

impl InstanceBase {
    fn new(display: RawDisplayHandle, window: RawWindowHandle) -> Result<Self> {
        let entry = unsafe { Entry::load()? };
        let (instance, validation) = create_instance(&entry, display)?;
        let surface_loader = surface::Instance::new(&entry, &instance);

        let mut base = InstanceBase {
            debug: None,
            surface: vk::SurfaceKHR::null(),
            _entry: entry,
            instance,
            surface_loader,
        };

        if validation {
            base.debug = create_debug_messenger(&base._entry, &base.instance);
        }

        base.surface = unsafe {
            ash_window::create_surface(&base._entry, &base.instance, display, window, None)
        }
        .map_err(creation("vkCreateSurfaceKHR"))?;

        Ok(base)
    }
}

impl Drop for InstanceBase {
    fn drop(&mut self) {
        unsafe {
            if self.surface != vk::SurfaceKHR::null() {
                self.surface_loader.destroy_surface(self.surface, None);
            }
            if let Some((loader, messenger)) = self.debug.take() {
                loader.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
        debug!("instance destroyed");
    }
}

/// Returns the instance and whether the validation layer was enabled on it.
fn create_instance(entry: &Entry, display: RawDisplayHandle) -> Result<(Instance, bool)> {
    let app_info = vk::ApplicationInfo {
        p_application_name: APP_NAME.as_ptr(),
        application_version: 0,
        p_engine_name: APP_NAME.as_ptr(),
        engine_version: 0,
        api_version: vk::API_VERSION_1_0,
        ..Default::default()
    };

    let mut extensions = ash_window::enumerate_required_extensions(display)
        .map_err(creation("enumerate_required_extensions"))?
        .to_vec();
    let layers = validation_layers(entry);
    if !layers.is_empty() {
        extensions.push(debug_utils::NAME.as_ptr());
    }

    let create_info = vk::InstanceCreateInfo {
        p_application_info: &app_info,
        enabled_layer_count: layers.len() as u32,
        pp_enabled_layer_names: layers.as_ptr(),
        enabled_extension_count: extensions.len() as u32,
        pp_enabled_extension_names: extensions.as_ptr(),
        ..Default::default()
    };

    let instance = unsafe { entry.create_instance(&create_info, None) }
        .map_err(creation("vkCreateInstance"))?;
    Ok((instance, !layers.is_empty()))
}

fn create_debug_messenger(
    entry: &Entry,
    instance: &Instance,
) -> Option<(debug_utils::Instance, vk::DebugUtilsMessengerEXT)> {
    let loader = debug_utils::Instance::new(entry, instance);
    let ci = vk::DebugUtilsMessengerCreateInfoEXT {
        message_severity: vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
            | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
            | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
        message_type: vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
            | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
            | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        pfn_user_callback: Some(debug_callback),
        ..Default::default()
    };
    match unsafe { loader.create_debug_utils_messenger(&ci, None) } {
        Ok(messenger) => Some((loader, messenger)),
        Err(e) => {
            warn!("debug messenger unavailable: {e:?}");
            None
        }
    }
}

/// Everything created once at startup and never recreated.
///
/// Shared through `Arc` by every GPU resource so the device outlives them;
/// the last owner to drop tears down device, surface, messenger and instance in that order.
pub struct GpuContext {
    device: ash::Device,
    queue: vk::Queue,
    queue_family: u32,
    phys: vk::PhysicalDevice,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    swapchain_loader: swapchain::Device,
    base: InstanceBase,
}

impl GpuContext {
    pub fn new(window: &dyn HasWindowHandle, display: &dyn HasDisplayHandle) -> Result<Arc<Self>> {
        let dh = display.display_handle()?.as_raw();
        let wh = window.window_handle()?.as_raw();

        let base = InstanceBase::new(dh, wh)?;
        let instance = &base.instance;

        let devices = unsafe { instance.enumerate_physical_devices() }
            .map_err(creation("vkEnumeratePhysicalDevices"))?;
        let phys = select_physical_device(&devices)?;

        let families = unsafe { instance.get_physical_device_queue_family_properties(phys) };
        let queue_family = select_queue_family(&families)?;

        let can_present = unsafe {
            base.surface_loader
                .get_physical_device_surface_support(phys, queue_family, base.surface)
        }
        .unwrap_or(false);
        if !can_present {
            warn!("queue family {queue_family} does not report present support for this surface");
        }

        let props = unsafe { instance.get_physical_device_properties(phys) };
        let name = props
            .device_name_as_c_str()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        info!("GPU: {name} (queue family {queue_family})");

        let priorities = [1.0_f32];
        let qinfo = vk::DeviceQueueCreateInfo {
            queue_family_index: queue_family,
            queue_count: 1,
            p_queue_priorities: priorities.as_ptr(),
            ..Default::default()
        };
        let device_exts = [swapchain::NAME.as_ptr()];
        let dinfo = vk::DeviceCreateInfo {
            queue_create_info_count: 1,
            p_queue_create_infos: &qinfo,
            enabled_extension_count: device_exts.len() as u32,
            pp_enabled_extension_names: device_exts.as_ptr(),
            ..Default::default()
        };

        let device = unsafe { instance.create_device(phys, &dinfo, None) }
            .map_err(creation("vkCreateDevice"))?;
        let queue = unsafe { device.get_device_queue(queue_family, 0) };
        let swapchain_loader = swapchain::Device::new(instance, &device);
        let memory_properties = unsafe { instance.get_physical_device_memory_properties(phys) };

        Ok(Arc::new(GpuContext {
            device,
            queue,
            queue_family,
            phys,
            memory_properties,
            swapchain_loader,
            base,
        }))
    }

    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    pub fn queue(&self) -> vk::Queue {
        self.queue
    }

    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.phys
    }

    pub fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.memory_properties
    }

    pub(crate) fn surface(&self) -> vk::SurfaceKHR {
        self.base.surface
    }

    pub(crate) fn surface_loader(&self) -> &surface::Instance {
        &self.base.surface_loader
    }

    pub(crate) fn swapchain_loader(&self) -> &swapchain::Device {
        &self.swapchain_loader
    }

    /// Block until the GPU has drained every queue. Failures are logged; teardown proceeds regardless.
    pub fn wait_idle(&self) {
        if let Err(e) = unsafe { self.device.device_wait_idle() } {
            error!("device_wait_idle: {e:?}");
        }
    }
}

impl Drop for GpuContext {
    fn drop(&mut self) {
        self.wait_idle();
        unsafe { self.device.destroy_device(None) };
        debug!("logical device destroyed");
    }
}
