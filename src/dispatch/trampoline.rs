/*
 *  dispatch/trampoline.rs
 *
 *  gfx-loader - worth the squeeze
 *  (c) 2020-26 Stuart Hunter
 *
 *  Exported entry points applications link against
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU General Public License for more details.
 *
 *  See <http://www.gnu.org/licenses/> to get a copy of the GNU General
 *  Public License.
 *
 */

//! Trampolines
//!
//! The addresses applications hold. Each one finds the object behind its
//! first argument and jumps to the first stage of that object's chain.
//! The global functions and the two proc-address queries live here too.

use std::ffi::{c_char, c_void};
use log::warn;

use crate::api::*;
use crate::error::fail_fast;
use crate::extension;
use crate::handle::{registry, HandleKind};
use crate::instance::{InstanceObject, InstanceRequest};
use crate::layer;
use crate::loader::Loader;
use super::table::{self, Slot};
use super::unknown;

fn erase<F: Copy>(f: F) -> PfnVoidFunction {
    // SAFETY: only ever called with fn pointers
    unsafe { erase_pfn(f) }
}

unsafe fn instance_chain<F: Copy>(instance: &InstanceObject, slot: Slot) -> F {
    match unsafe { instance.dispatch().load::<F>(slot) } {
        Some(f) => f,
        None => fail_fast(&format!("GfxInstance 0x{:x} has no stage for {:?}", instance.handle(), slot)),
    }
}

unsafe fn physical_device_chain<F: Copy>(physical_device: PhysicalDevice, slot: Slot) -> F {
    let (record, _) = registry().physical_device(physical_device.as_raw());
    let instance = record.instance_or_abort();
    unsafe { instance_chain::<F>(&instance, slot) }
}

unsafe fn device_chain<F: Copy>(kind: HandleKind, handle: u64, slot: Slot) -> F {
    let (device, _) = registry().device_kind(kind, handle);
    match unsafe { device.dispatch().load::<F>(slot) } {
        Some(f) => f,
        None => fail_fast(&format!("GfxDevice 0x{:x} has no stage for {:?}", device.handle(), slot)),
    }
}

macro_rules! physical_device_trampoline {
    ($export:literal, $name:ident, $pfn:ty, $slot:ident, ($($arg:ident: $ty:ty),*) $(-> $ret:ty)?) => {
        #[unsafe(export_name = $export)]
        pub unsafe extern "C" fn $name(physical_device: PhysicalDevice, $($arg: $ty),*) $(-> $ret)? {
            let next = unsafe { physical_device_chain::<$pfn>(physical_device, Slot::$slot) };
            unsafe { next(physical_device, $($arg),*) }
        }
    };
}

// --- global functions ---------------------------------------------------------

fn global_function(name: &str) -> Option<PfnVoidFunction> {
    match name {
        "gfxCreateInstance" => Some(erase::<PfnCreateInstance>(create_instance)),
        "gfxEnumerateInstanceExtensionProperties" => {
            Some(erase::<PfnEnumerateInstanceExtensionProperties>(enumerate_instance_extension_properties))
        }
        "gfxEnumerateInstanceLayerProperties" => {
            Some(erase::<PfnEnumerateInstanceLayerProperties>(enumerate_instance_layer_properties))
        }
        "gfxEnumerateInstanceVersion" => Some(erase::<PfnEnumerateInstanceVersion>(enumerate_instance_version)),
        _ => None,
    }
}

#[unsafe(export_name = "gfxGetInstanceProcAddr")]
pub unsafe extern "C" fn get_instance_proc_addr(instance: Instance, name: *const c_char) -> Option<PfnVoidFunction> {
    let name = unsafe { c_str_opt(name) }?;
    if name == "gfxGetInstanceProcAddr" {
        return Some(erase::<PfnGetInstanceProcAddr>(get_instance_proc_addr));
    }
    if instance.is_null() {
        return global_function(name);
    }

    let object = registry().instance(instance.as_raw());
    if let Some(global) = global_function(name) {
        return (!extension::version_at_least(object.api_version(), API_VERSION_1_3)).then_some(global);
    }
    if name == "gfxGetDeviceProcAddr" {
        return Some(erase::<PfnGetDeviceProcAddr>(get_device_proc_addr));
    }
    if let Some(entry) = table::lookup(name) {
        return extension::visible_at_instance(entry, &*object).then_some(entry.trampoline);
    }
    unknown::instance_lookup(&object, name)
}

#[unsafe(export_name = "gfxGetDeviceProcAddr")]
pub unsafe extern "C" fn get_device_proc_addr(device: Device, name: *const c_char) -> Option<PfnVoidFunction> {
    let name = unsafe { c_str_opt(name) }?;
    if device.is_null() {
        return None;
    }
    if name == "gfxGetDeviceProcAddr" {
        return Some(erase::<PfnGetDeviceProcAddr>(get_device_proc_addr));
    }

    let (object, _) = registry().device(device.as_raw());
    if let Some(entry) = table::lookup(name) {
        return extension::visible_at_device(entry, object.api_version(), object.enabled_extensions())
            .then_some(entry.trampoline);
    }
    unknown::device_lookup(&object, name)
}

#[unsafe(export_name = "gfxCreateInstance")]
pub unsafe extern "C" fn create_instance(
    info: *const InstanceCreateInfo,
    allocator: *const c_void,
    instance: *mut Instance,
) -> GfxResult {
    if info.is_null() || instance.is_null() {
        return GfxResult::ERROR_INITIALIZATION_FAILED;
    }
    let mut request = unsafe { InstanceRequest::from_create_info(info) };
    request.allocator = Allocator(allocator);
    match Loader::global().create_instance(&request) {
        Ok(created) => {
            unsafe { *instance = Instance::from_raw(created.handle()) };
            GfxResult::SUCCESS
        }
        Err(e) => {
            warn!("gfxCreateInstance: {}", e);
            e.result()
        }
    }
}

#[unsafe(export_name = "gfxEnumerateInstanceExtensionProperties")]
pub unsafe extern "C" fn enumerate_instance_extension_properties(
    layer_name: *const c_char,
    count: *mut u32,
    properties: *mut ExtensionProperties,
) -> GfxResult {
    let layer_name = unsafe { c_str_opt(layer_name) };
    match Loader::global().enumerate_instance_extension_properties(layer_name) {
        Ok(extensions) => {
            let items: Vec<ExtensionProperties> =
                extensions.iter().map(|e| ExtensionProperties::new(&e.name, e.spec_version)).collect();
            unsafe { fill_enumeration(&items, count, properties) }
        }
        Err(e) => e.result(),
    }
}

#[unsafe(export_name = "gfxEnumerateInstanceLayerProperties")]
pub unsafe extern "C" fn enumerate_instance_layer_properties(
    count: *mut u32,
    properties: *mut LayerProperties,
) -> GfxResult {
    let items: Vec<LayerProperties> = Loader::global()
        .enumerate_instance_layer_properties()
        .iter()
        .map(layer::layer_properties)
        .collect();
    unsafe { fill_enumeration(&items, count, properties) }
}

#[unsafe(export_name = "gfxEnumerateInstanceVersion")]
pub unsafe extern "C" fn enumerate_instance_version(version: *mut u32) -> GfxResult {
    match unsafe { version.as_mut() } {
        Some(out) => {
            *out = LOADER_API_VERSION;
            GfxResult::SUCCESS
        }
        None => GfxResult::ERROR_INITIALIZATION_FAILED,
    }
}

// --- instance level -----------------------------------------------------------

#[unsafe(export_name = "gfxDestroyInstance")]
pub unsafe extern "C" fn destroy_instance(instance: Instance, allocator: *const c_void) {
    if instance.is_null() {
        return;
    }
    let object = registry().instance(instance.as_raw());
    let next = unsafe { instance_chain::<PfnDestroyInstance>(&object, Slot::DestroyInstance) };
    unsafe { next(instance, allocator) };
    object.retire();
}

#[unsafe(export_name = "gfxEnumeratePhysicalDevices")]
pub unsafe extern "C" fn enumerate_physical_devices(
    instance: Instance,
    count: *mut u32,
    devices: *mut PhysicalDevice,
) -> GfxResult {
    let object = registry().instance(instance.as_raw());
    let next = unsafe { instance_chain::<PfnEnumeratePhysicalDevices>(&object, Slot::EnumeratePhysicalDevices) };
    unsafe { next(instance, count, devices) }
}

physical_device_trampoline!("gfxGetPhysicalDeviceProperties", get_physical_device_properties,
    PfnGetPhysicalDeviceProperties, GetPhysicalDeviceProperties,
    (properties: *mut PhysicalDeviceProperties));
physical_device_trampoline!("gfxGetPhysicalDeviceProperties2", get_physical_device_properties2,
    PfnGetPhysicalDeviceProperties2, GetPhysicalDeviceProperties2,
    (properties: *mut PhysicalDeviceProperties2));
physical_device_trampoline!("gfxGetPhysicalDeviceFeatures", get_physical_device_features,
    PfnGetPhysicalDeviceFeatures, GetPhysicalDeviceFeatures,
    (features: *mut PhysicalDeviceFeatures));
physical_device_trampoline!("gfxGetPhysicalDeviceFeatures2", get_physical_device_features2,
    PfnGetPhysicalDeviceFeatures2, GetPhysicalDeviceFeatures2,
    (features: *mut PhysicalDeviceFeatures2));
physical_device_trampoline!("gfxGetPhysicalDeviceMemoryProperties", get_physical_device_memory_properties,
    PfnGetPhysicalDeviceMemoryProperties, GetPhysicalDeviceMemoryProperties,
    (properties: *mut PhysicalDeviceMemoryProperties));
physical_device_trampoline!("gfxGetPhysicalDeviceMemoryProperties2", get_physical_device_memory_properties2,
    PfnGetPhysicalDeviceMemoryProperties2, GetPhysicalDeviceMemoryProperties2,
    (properties: *mut PhysicalDeviceMemoryProperties2));
physical_device_trampoline!("gfxGetPhysicalDeviceFormatProperties", get_physical_device_format_properties,
    PfnGetPhysicalDeviceFormatProperties, GetPhysicalDeviceFormatProperties,
    (format: Format, properties: *mut FormatProperties));
physical_device_trampoline!("gfxGetPhysicalDeviceFormatProperties2", get_physical_device_format_properties2,
    PfnGetPhysicalDeviceFormatProperties2, GetPhysicalDeviceFormatProperties2,
    (format: Format, properties: *mut FormatProperties2));
physical_device_trampoline!("gfxGetPhysicalDeviceQueueFamilyProperties", get_physical_device_queue_family_properties,
    PfnGetPhysicalDeviceQueueFamilyProperties, GetPhysicalDeviceQueueFamilyProperties,
    (count: *mut u32, properties: *mut QueueFamilyProperties));
physical_device_trampoline!("gfxGetPhysicalDeviceQueueFamilyProperties2", get_physical_device_queue_family_properties2,
    PfnGetPhysicalDeviceQueueFamilyProperties2, GetPhysicalDeviceQueueFamilyProperties2,
    (count: *mut u32, properties: *mut QueueFamilyProperties2));
physical_device_trampoline!("gfxGetPhysicalDeviceSparseImageFormatProperties", get_physical_device_sparse_image_format_properties,
    PfnGetPhysicalDeviceSparseImageFormatProperties, GetPhysicalDeviceSparseImageFormatProperties,
    (format: Format, image_type: ImageType, samples: u32, usage: u32, tiling: ImageTiling,
     count: *mut u32, properties: *mut SparseImageFormatProperties));
physical_device_trampoline!("gfxGetPhysicalDeviceSparseImageFormatProperties2", get_physical_device_sparse_image_format_properties2,
    PfnGetPhysicalDeviceSparseImageFormatProperties2, GetPhysicalDeviceSparseImageFormatProperties2,
    (info: *const PhysicalDeviceSparseImageFormatInfo2, count: *mut u32, properties: *mut SparseImageFormatProperties2));
physical_device_trampoline!("gfxGetPhysicalDeviceExternalBufferProperties", get_physical_device_external_buffer_properties,
    PfnGetPhysicalDeviceExternalBufferProperties, GetPhysicalDeviceExternalBufferProperties,
    (info: *const PhysicalDeviceExternalBufferInfo, properties: *mut ExternalBufferProperties));
physical_device_trampoline!("gfxGetPhysicalDeviceExternalSemaphoreProperties", get_physical_device_external_semaphore_properties,
    PfnGetPhysicalDeviceExternalSemaphoreProperties, GetPhysicalDeviceExternalSemaphoreProperties,
    (info: *const PhysicalDeviceExternalSemaphoreInfo, properties: *mut ExternalSemaphoreProperties));
physical_device_trampoline!("gfxGetPhysicalDeviceExternalFenceProperties", get_physical_device_external_fence_properties,
    PfnGetPhysicalDeviceExternalFenceProperties, GetPhysicalDeviceExternalFenceProperties,
    (info: *const PhysicalDeviceExternalFenceInfo, properties: *mut ExternalFenceProperties));
physical_device_trampoline!("gfxEnumerateDeviceExtensionProperties", enumerate_device_extension_properties,
    PfnEnumerateDeviceExtensionProperties, EnumerateDeviceExtensionProperties,
    (layer_name: *const c_char, count: *mut u32, properties: *mut ExtensionProperties) -> GfxResult);
physical_device_trampoline!("gfxCreateDevice", create_device,
    PfnCreateDevice, CreateDevice,
    (info: *const DeviceCreateInfo, allocator: *const c_void, device: *mut Device) -> GfxResult);
physical_device_trampoline!("gfxGetPhysicalDeviceDisplayPropertiesKHR", get_physical_device_display_properties_khr,
    PfnGetPhysicalDeviceDisplayPropertiesKHR, GetPhysicalDeviceDisplayPropertiesKHR,
    (count: *mut u32, properties: *mut DisplayPropertiesKHR) -> GfxResult);
physical_device_trampoline!("gfxCreateDisplayModeKHR", create_display_mode_khr,
    PfnCreateDisplayModeKHR, CreateDisplayModeKHR,
    (display: DisplayKHR, info: *const DisplayModeCreateInfoKHR, allocator: *const c_void,
     mode: *mut DisplayModeKHR) -> GfxResult);
physical_device_trampoline!("gfxAcquireDrmDisplayEXT", acquire_drm_display_ext,
    PfnAcquireDrmDisplayEXT, AcquireDrmDisplayEXT,
    (drm_fd: i32, display: DisplayKHR) -> GfxResult);
physical_device_trampoline!("gfxGetPhysicalDeviceCalibrateableTimeDomainsEXT", get_physical_device_calibrateable_time_domains_ext,
    PfnGetPhysicalDeviceCalibrateableTimeDomainsEXT, GetPhysicalDeviceCalibrateableTimeDomainsEXT,
    (count: *mut u32, domains: *mut TimeDomainEXT) -> GfxResult);

// --- device level -------------------------------------------------------------

#[unsafe(export_name = "gfxDestroyDevice")]
pub unsafe extern "C" fn destroy_device(device: Device, allocator: *const c_void) {
    if device.is_null() {
        return;
    }
    let (object, _) = registry().device(device.as_raw());
    let next = unsafe { device_chain::<PfnDestroyDevice>(HandleKind::Device, device.as_raw(), Slot::DestroyDevice) };
    unsafe { next(device, allocator) };
    object.retire();
}

#[unsafe(export_name = "gfxGetDeviceQueue")]
pub unsafe extern "C" fn get_device_queue(device: Device, family: u32, index: u32, queue: *mut Queue) {
    let next = unsafe { device_chain::<PfnGetDeviceQueue>(HandleKind::Device, device.as_raw(), Slot::GetDeviceQueue) };
    unsafe { next(device, family, index, queue) }
}

#[unsafe(export_name = "gfxQueueWaitIdle")]
pub unsafe extern "C" fn queue_wait_idle(queue: Queue) -> GfxResult {
    let next = unsafe { device_chain::<PfnQueueWaitIdle>(HandleKind::Queue, queue.as_raw(), Slot::QueueWaitIdle) };
    unsafe { next(queue) }
}

#[unsafe(export_name = "gfxAllocateCommandBuffers")]
pub unsafe extern "C" fn allocate_command_buffers(
    device: Device,
    info: *const CommandBufferAllocateInfo,
    buffers: *mut CommandBuffer,
) -> GfxResult {
    let next = unsafe {
        device_chain::<PfnAllocateCommandBuffers>(HandleKind::Device, device.as_raw(), Slot::AllocateCommandBuffers)
    };
    unsafe { next(device, info, buffers) }
}

#[unsafe(export_name = "gfxFreeCommandBuffers")]
pub unsafe extern "C" fn free_command_buffers(device: Device, pool: u64, count: u32, buffers: *const CommandBuffer) {
    let (object, _) = registry().device(device.as_raw());
    let next = unsafe {
        device_chain::<PfnFreeCommandBuffers>(HandleKind::Device, device.as_raw(), Slot::FreeCommandBuffers)
    };
    unsafe { next(device, pool, count, buffers) };
    if !buffers.is_null() {
        let freed: Vec<u64> = (0..count as usize).map(|i| unsafe { (*buffers.add(i)).as_raw() }).collect();
        object.release_children(&freed);
    }
}

#[unsafe(export_name = "gfxCmdSetDeviceMask")]
pub unsafe extern "C" fn cmd_set_device_mask(command_buffer: CommandBuffer, mask: u32) {
    let next = unsafe {
        device_chain::<PfnCmdSetDeviceMask>(HandleKind::CommandBuffer, command_buffer.as_raw(), Slot::CmdSetDeviceMask)
    };
    unsafe { next(command_buffer, mask) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;

    fn gipa(name: &str) -> Option<PfnVoidFunction> {
        let c = CString::new(name).unwrap();
        unsafe { get_instance_proc_addr(Instance::NULL, c.as_ptr()) }
    }

    #[test]
    fn test_null_instance_returns_only_globals() {
        assert!(gipa("gfxCreateInstance").is_some());
        assert!(gipa("gfxEnumerateInstanceVersion").is_some());
        assert_eq!(
            gipa("gfxGetInstanceProcAddr").map(|f| f as usize),
            Some(get_instance_proc_addr as usize)
        );
        assert!(gipa("gfxGetPhysicalDeviceProperties").is_none());
        assert!(gipa("gfxVendorSomethingPrivate").is_none());
    }

    #[test]
    fn test_null_device_returns_null() {
        let c = CString::new("gfxQueueWaitIdle").unwrap();
        assert!(unsafe { get_device_proc_addr(Device::NULL, c.as_ptr()) }.is_none());
    }

    #[test]
    fn test_instance_version_is_loader_version() {
        let mut version = 0;
        assert_eq!(unsafe { enumerate_instance_version(&mut version) }, GfxResult::SUCCESS);
        assert_eq!(version, LOADER_API_VERSION);
    }
}
