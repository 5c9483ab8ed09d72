/*
 *  dispatch/terminator.rs
 *
 *  gfx-loader - worth the squeeze
 *  (c) 2020-26 Stuart Hunter
 *
 *  Final chain stage: unwrap handles and call the driver
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

//! Terminators
//!
//! Each terminator receives loader handles, looks them up in the
//! registry (aborting on anything stale) and calls the owning driver
//! with its own handles. The promoted extended queries fall back to the
//! driver's core query when the driver has no native version.

use std::ffi::{c_char, c_void};
use std::sync::Arc;
use log::{info, warn};

use crate::api::*;
use crate::device;
use crate::error::fail_fast;
use crate::handle::{registry, HandleKind};
use crate::instance::DriverInstance;
use crate::physical_device::PhysicalDeviceRecord;
use super::table::Slot;

struct Target {
    record: Arc<PhysicalDeviceRecord>,
    driver: Arc<DriverInstance>,
    handle: PhysicalDevice,
}

fn target(physical_device: PhysicalDevice) -> Target {
    let (record, driver_handle) = registry().physical_device(physical_device.as_raw());
    let driver = record.driver_or_abort();
    Target { record, driver, handle: PhysicalDevice::from_raw(driver_handle) }
}

impl Target {
    /// The driver's native implementation, if it has one
    unsafe fn native<F: Copy>(&self, slot: Slot) -> Option<F> {
        unsafe { self.driver.function::<F>(slot) }
    }

    /// A function every driver must provide
    unsafe fn required<F: Copy>(&self, slot: Slot, name: &str) -> F {
        match unsafe { self.native::<F>(slot) } {
            Some(f) => f,
            None => fail_fast(&format!("{}: driver \"{}\" does not export it", name, self.driver.name())),
        }
    }

    fn emulating(&self, name: &str) {
        info!("{}: emulating call in driver \"{}\"", name, self.driver.name());
    }
}

/// Clear the extension-only id block if the caller chained one
unsafe fn zero_id_properties(p_next: *mut c_void) {
    let mut next = p_next as *mut BaseOutStructure;
    while !next.is_null() {
        let (s_type, following) = unsafe { ((*next).s_type, (*next).p_next) };
        if s_type == StructureType::PHYSICAL_DEVICE_ID_PROPERTIES {
            let id = next as *mut PhysicalDeviceIdProperties;
            unsafe {
                *id = PhysicalDeviceIdProperties { p_next: following as *mut c_void, ..Default::default() };
            }
        }
        next = following;
    }
}

// --- instance ---------------------------------------------------------------

pub unsafe extern "C" fn destroy_instance(instance: Instance, allocator: *const c_void) {
    registry().instance(instance.as_raw()).destroy_drivers(Allocator(allocator));
}

pub unsafe extern "C" fn enumerate_physical_devices(
    instance: Instance,
    count: *mut u32,
    devices: *mut PhysicalDevice,
) -> GfxResult {
    let instance = registry().instance(instance.as_raw());
    unsafe { fill_enumeration(&instance.physical_device_handles(), count, devices) }
}

// --- core queries and their emulated extended forms ---------------------------

pub unsafe extern "C" fn get_physical_device_properties(
    physical_device: PhysicalDevice,
    properties: *mut PhysicalDeviceProperties,
) {
    let t = target(physical_device);
    unsafe {
        let f = t.required::<PfnGetPhysicalDeviceProperties>(Slot::GetPhysicalDeviceProperties, "gfxGetPhysicalDeviceProperties");
        f(t.handle, properties)
    }
}

pub unsafe extern "C" fn get_physical_device_properties2(
    physical_device: PhysicalDevice,
    properties: *mut PhysicalDeviceProperties2,
) {
    let t = target(physical_device);
    if let Some(native) = unsafe { t.native::<PfnGetPhysicalDeviceProperties2>(Slot::GetPhysicalDeviceProperties2) } {
        return unsafe { native(t.handle, properties) };
    }
    t.emulating("gfxGetPhysicalDeviceProperties2");
    unsafe {
        let core = t.required::<PfnGetPhysicalDeviceProperties>(Slot::GetPhysicalDeviceProperties, "gfxGetPhysicalDeviceProperties");
        let Some(out) = properties.as_mut() else { return };
        core(t.handle, &mut out.properties);
        zero_id_properties(out.p_next);
    }
}

pub unsafe extern "C" fn get_physical_device_features(
    physical_device: PhysicalDevice,
    features: *mut PhysicalDeviceFeatures,
) {
    let t = target(physical_device);
    unsafe {
        let f = t.required::<PfnGetPhysicalDeviceFeatures>(Slot::GetPhysicalDeviceFeatures, "gfxGetPhysicalDeviceFeatures");
        f(t.handle, features)
    }
}

pub unsafe extern "C" fn get_physical_device_features2(
    physical_device: PhysicalDevice,
    features: *mut PhysicalDeviceFeatures2,
) {
    let t = target(physical_device);
    if let Some(native) = unsafe { t.native::<PfnGetPhysicalDeviceFeatures2>(Slot::GetPhysicalDeviceFeatures2) } {
        return unsafe { native(t.handle, features) };
    }
    t.emulating("gfxGetPhysicalDeviceFeatures2");
    unsafe {
        let core = t.required::<PfnGetPhysicalDeviceFeatures>(Slot::GetPhysicalDeviceFeatures, "gfxGetPhysicalDeviceFeatures");
        let Some(out) = features.as_mut() else { return };
        core(t.handle, &mut out.features);
    }
}

pub unsafe extern "C" fn get_physical_device_memory_properties(
    physical_device: PhysicalDevice,
    properties: *mut PhysicalDeviceMemoryProperties,
) {
    let t = target(physical_device);
    unsafe {
        let f = t.required::<PfnGetPhysicalDeviceMemoryProperties>(
            Slot::GetPhysicalDeviceMemoryProperties,
            "gfxGetPhysicalDeviceMemoryProperties",
        );
        f(t.handle, properties)
    }
}

pub unsafe extern "C" fn get_physical_device_memory_properties2(
    physical_device: PhysicalDevice,
    properties: *mut PhysicalDeviceMemoryProperties2,
) {
    let t = target(physical_device);
    if let Some(native) =
        unsafe { t.native::<PfnGetPhysicalDeviceMemoryProperties2>(Slot::GetPhysicalDeviceMemoryProperties2) }
    {
        return unsafe { native(t.handle, properties) };
    }
    t.emulating("gfxGetPhysicalDeviceMemoryProperties2");
    unsafe {
        let core = t.required::<PfnGetPhysicalDeviceMemoryProperties>(
            Slot::GetPhysicalDeviceMemoryProperties,
            "gfxGetPhysicalDeviceMemoryProperties",
        );
        let Some(out) = properties.as_mut() else { return };
        core(t.handle, &mut out.memory_properties);
    }
}

pub unsafe extern "C" fn get_physical_device_format_properties(
    physical_device: PhysicalDevice,
    format: Format,
    properties: *mut FormatProperties,
) {
    let t = target(physical_device);
    unsafe {
        let f = t.required::<PfnGetPhysicalDeviceFormatProperties>(
            Slot::GetPhysicalDeviceFormatProperties,
            "gfxGetPhysicalDeviceFormatProperties",
        );
        f(t.handle, format, properties)
    }
}

pub unsafe extern "C" fn get_physical_device_format_properties2(
    physical_device: PhysicalDevice,
    format: Format,
    properties: *mut FormatProperties2,
) {
    let t = target(physical_device);
    if let Some(native) =
        unsafe { t.native::<PfnGetPhysicalDeviceFormatProperties2>(Slot::GetPhysicalDeviceFormatProperties2) }
    {
        return unsafe { native(t.handle, format, properties) };
    }
    t.emulating("gfxGetPhysicalDeviceFormatProperties2");
    unsafe {
        let core = t.required::<PfnGetPhysicalDeviceFormatProperties>(
            Slot::GetPhysicalDeviceFormatProperties,
            "gfxGetPhysicalDeviceFormatProperties",
        );
        let Some(out) = properties.as_mut() else { return };
        core(t.handle, format, &mut out.format_properties);
    }
}

pub unsafe extern "C" fn get_physical_device_queue_family_properties(
    physical_device: PhysicalDevice,
    count: *mut u32,
    properties: *mut QueueFamilyProperties,
) {
    let t = target(physical_device);
    unsafe {
        let f = t.required::<PfnGetPhysicalDeviceQueueFamilyProperties>(
            Slot::GetPhysicalDeviceQueueFamilyProperties,
            "gfxGetPhysicalDeviceQueueFamilyProperties",
        );
        f(t.handle, count, properties)
    }
}

pub unsafe extern "C" fn get_physical_device_queue_family_properties2(
    physical_device: PhysicalDevice,
    count: *mut u32,
    properties: *mut QueueFamilyProperties2,
) {
    let t = target(physical_device);
    if let Some(native) = unsafe {
        t.native::<PfnGetPhysicalDeviceQueueFamilyProperties2>(Slot::GetPhysicalDeviceQueueFamilyProperties2)
    } {
        return unsafe { native(t.handle, count, properties) };
    }
    t.emulating("gfxGetPhysicalDeviceQueueFamilyProperties2");
    unsafe {
        let core = t.required::<PfnGetPhysicalDeviceQueueFamilyProperties>(
            Slot::GetPhysicalDeviceQueueFamilyProperties,
            "gfxGetPhysicalDeviceQueueFamilyProperties",
        );
        if count.is_null() {
            return;
        }
        if properties.is_null() {
            return core(t.handle, count, std::ptr::null_mut());
        }
        let mut families = vec![QueueFamilyProperties::default(); *count as usize];
        core(t.handle, count, families.as_mut_ptr());
        for (i, family) in families.iter().take(*count as usize).enumerate() {
            (*properties.add(i)).queue_family_properties = *family;
        }
    }
}

pub unsafe extern "C" fn get_physical_device_sparse_image_format_properties(
    physical_device: PhysicalDevice,
    format: Format,
    image_type: ImageType,
    samples: u32,
    usage: u32,
    tiling: ImageTiling,
    count: *mut u32,
    properties: *mut SparseImageFormatProperties,
) {
    let t = target(physical_device);
    unsafe {
        let f = t.required::<PfnGetPhysicalDeviceSparseImageFormatProperties>(
            Slot::GetPhysicalDeviceSparseImageFormatProperties,
            "gfxGetPhysicalDeviceSparseImageFormatProperties",
        );
        f(t.handle, format, image_type, samples, usage, tiling, count, properties)
    }
}

pub unsafe extern "C" fn get_physical_device_sparse_image_format_properties2(
    physical_device: PhysicalDevice,
    info: *const PhysicalDeviceSparseImageFormatInfo2,
    count: *mut u32,
    properties: *mut SparseImageFormatProperties2,
) {
    let t = target(physical_device);
    if let Some(native) = unsafe {
        t.native::<PfnGetPhysicalDeviceSparseImageFormatProperties2>(Slot::GetPhysicalDeviceSparseImageFormatProperties2)
    } {
        return unsafe { native(t.handle, info, count, properties) };
    }
    t.emulating("gfxGetPhysicalDeviceSparseImageFormatProperties2");
    unsafe {
        let core = t.required::<PfnGetPhysicalDeviceSparseImageFormatProperties>(
            Slot::GetPhysicalDeviceSparseImageFormatProperties,
            "gfxGetPhysicalDeviceSparseImageFormatProperties",
        );
        let (Some(info), false) = (info.as_ref(), count.is_null()) else { return };
        if properties.is_null() {
            return core(t.handle, info.format, info.ty, info.samples, info.usage, info.tiling, count, std::ptr::null_mut());
        }
        let mut found = vec![SparseImageFormatProperties::default(); *count as usize];
        core(t.handle, info.format, info.ty, info.samples, info.usage, info.tiling, count, found.as_mut_ptr());
        for (i, props) in found.iter().take(*count as usize).enumerate() {
            (*properties.add(i)).properties = *props;
        }
    }
}

// The external capability queries have no core form to fall back on;
// without native support nothing is exportable or importable.

pub unsafe extern "C" fn get_physical_device_external_buffer_properties(
    physical_device: PhysicalDevice,
    info: *const PhysicalDeviceExternalBufferInfo,
    properties: *mut ExternalBufferProperties,
) {
    let t = target(physical_device);
    if let Some(native) = unsafe {
        t.native::<PfnGetPhysicalDeviceExternalBufferProperties>(Slot::GetPhysicalDeviceExternalBufferProperties)
    } {
        return unsafe { native(t.handle, info, properties) };
    }
    t.emulating("gfxGetPhysicalDeviceExternalBufferProperties");
    if let Some(out) = unsafe { properties.as_mut() } {
        out.external_memory_properties = ExternalMemoryProperties::default();
    }
}

pub unsafe extern "C" fn get_physical_device_external_semaphore_properties(
    physical_device: PhysicalDevice,
    info: *const PhysicalDeviceExternalSemaphoreInfo,
    properties: *mut ExternalSemaphoreProperties,
) {
    let t = target(physical_device);
    if let Some(native) = unsafe {
        t.native::<PfnGetPhysicalDeviceExternalSemaphoreProperties>(Slot::GetPhysicalDeviceExternalSemaphoreProperties)
    } {
        return unsafe { native(t.handle, info, properties) };
    }
    t.emulating("gfxGetPhysicalDeviceExternalSemaphoreProperties");
    if let Some(out) = unsafe { properties.as_mut() } {
        out.export_from_imported_handle_types = 0;
        out.compatible_handle_types = 0;
        out.external_semaphore_features = 0;
    }
}

pub unsafe extern "C" fn get_physical_device_external_fence_properties(
    physical_device: PhysicalDevice,
    info: *const PhysicalDeviceExternalFenceInfo,
    properties: *mut ExternalFenceProperties,
) {
    let t = target(physical_device);
    if let Some(native) = unsafe {
        t.native::<PfnGetPhysicalDeviceExternalFenceProperties>(Slot::GetPhysicalDeviceExternalFenceProperties)
    } {
        return unsafe { native(t.handle, info, properties) };
    }
    t.emulating("gfxGetPhysicalDeviceExternalFenceProperties");
    if let Some(out) = unsafe { properties.as_mut() } {
        out.export_from_imported_handle_types = 0;
        out.compatible_handle_types = 0;
        out.external_fence_features = 0;
    }
}

// --- device creation ----------------------------------------------------------

pub unsafe extern "C" fn enumerate_device_extension_properties(
    physical_device: PhysicalDevice,
    layer_name: *const c_char,
    count: *mut u32,
    properties: *mut ExtensionProperties,
) -> GfxResult {
    let t = target(physical_device);
    let declared = match unsafe { c_str_opt(layer_name) } {
        Some(name) => {
            let instance = t.record.instance_or_abort();
            match instance.chain().layer(name) {
                Some(layer) => layer.record().device_extensions.clone(),
                None => return GfxResult::ERROR_LAYER_NOT_PRESENT,
            }
        }
        None => t.record.extensions().to_vec(),
    };
    let items: Vec<ExtensionProperties> =
        declared.iter().map(|e| ExtensionProperties::new(&e.name, e.spec_version)).collect();
    unsafe { fill_enumeration(&items, count, properties) }
}

pub unsafe extern "C" fn create_device(
    physical_device: PhysicalDevice,
    info: *const DeviceCreateInfo,
    allocator: *const c_void,
    device: *mut Device,
) -> GfxResult {
    let t = target(physical_device);
    if device.is_null() {
        return GfxResult::ERROR_INITIALIZATION_FAILED;
    }
    match unsafe { device::create(&t.record, info, allocator) } {
        Ok(handle) => {
            unsafe { *device = Device::from_raw(handle) };
            GfxResult::SUCCESS
        }
        Err(result) => {
            warn!("gfxCreateDevice failed on \"{}\": {}", t.record.properties().name(), result);
            result
        }
    }
}

// --- display ------------------------------------------------------------------

pub unsafe extern "C" fn get_physical_device_display_properties_khr(
    physical_device: PhysicalDevice,
    count: *mut u32,
    properties: *mut DisplayPropertiesKHR,
) -> GfxResult {
    let t = target(physical_device);
    match unsafe { t.native::<PfnGetPhysicalDeviceDisplayPropertiesKHR>(Slot::GetPhysicalDeviceDisplayPropertiesKHR) } {
        Some(native) => unsafe { native(t.handle, count, properties) },
        // no displays on this driver
        None => unsafe { fill_enumeration::<DisplayPropertiesKHR>(&[], count, properties) },
    }
}

pub unsafe extern "C" fn create_display_mode_khr(
    physical_device: PhysicalDevice,
    display: DisplayKHR,
    info: *const DisplayModeCreateInfoKHR,
    allocator: *const c_void,
    mode: *mut DisplayModeKHR,
) -> GfxResult {
    let t = target(physical_device);
    match unsafe { t.native::<PfnCreateDisplayModeKHR>(Slot::CreateDisplayModeKHR) } {
        Some(native) => unsafe { native(t.handle, display, info, allocator, mode) },
        None => {
            warn!("gfxCreateDisplayModeKHR: driver \"{}\" has no display support", t.driver.name());
            GfxResult::ERROR_INITIALIZATION_FAILED
        }
    }
}

pub unsafe extern "C" fn acquire_drm_display_ext(
    physical_device: PhysicalDevice,
    drm_fd: i32,
    display: DisplayKHR,
) -> GfxResult {
    let t = target(physical_device);
    match unsafe { t.native::<PfnAcquireDrmDisplayEXT>(Slot::AcquireDrmDisplayEXT) } {
        Some(native) => unsafe { native(t.handle, drm_fd, display) },
        None => {
            warn!("gfxAcquireDrmDisplayEXT: driver \"{}\" has no DRM display support", t.driver.name());
            GfxResult::ERROR_INITIALIZATION_FAILED
        }
    }
}

pub unsafe extern "C" fn get_physical_device_calibrateable_time_domains_ext(
    physical_device: PhysicalDevice,
    count: *mut u32,
    domains: *mut TimeDomainEXT,
) -> GfxResult {
    let t = target(physical_device);
    match unsafe {
        t.native::<PfnGetPhysicalDeviceCalibrateableTimeDomainsEXT>(Slot::GetPhysicalDeviceCalibrateableTimeDomainsEXT)
    } {
        Some(native) => unsafe { native(t.handle, count, domains) },
        None => fail_fast(&format!(
            "gfxGetPhysicalDeviceCalibrateableTimeDomainsEXT: driver \"{}\" does not support it on GfxPhysicalDevice 0x{:x}",
            t.driver.name(),
            physical_device.as_raw()
        )),
    }
}

// --- device level -------------------------------------------------------------

pub unsafe extern "C" fn destroy_device(device: Device, allocator: *const c_void) {
    let (object, driver_handle) = registry().device(device.as_raw());
    match unsafe { object.driver_function::<PfnDestroyDevice>(Slot::DestroyDevice) } {
        Some(destroy) => unsafe { destroy(Device::from_raw(driver_handle), allocator) },
        None => warn!("driver \"{}\" has no gfxDestroyDevice", object.driver_name()),
    }
}

pub unsafe extern "C" fn get_device_queue(device: Device, family: u32, index: u32, queue: *mut Queue) {
    let (object, driver_handle) = registry().device(device.as_raw());
    let Some(f) = (unsafe { object.driver_function::<PfnGetDeviceQueue>(Slot::GetDeviceQueue) }) else {
        fail_fast(&format!("gfxGetDeviceQueue: driver \"{}\" does not export it", object.driver_name()));
    };
    let Some(out) = (unsafe { queue.as_mut() }) else { return };
    let mut native = Queue::NULL;
    unsafe { f(Device::from_raw(driver_handle), family, index, &mut native) };
    *out = if native.is_null() {
        Queue::NULL
    } else {
        Queue::from_raw(object.register_child(HandleKind::Queue, native.as_raw()))
    };
}

pub unsafe extern "C" fn queue_wait_idle(queue: Queue) -> GfxResult {
    let (object, driver_handle) = registry().device_kind(HandleKind::Queue, queue.as_raw());
    match unsafe { object.driver_function::<PfnQueueWaitIdle>(Slot::QueueWaitIdle) } {
        Some(f) => unsafe { f(Queue::from_raw(driver_handle)) },
        None => fail_fast(&format!("gfxQueueWaitIdle: driver \"{}\" does not export it", object.driver_name())),
    }
}

pub unsafe extern "C" fn allocate_command_buffers(
    device: Device,
    info: *const CommandBufferAllocateInfo,
    buffers: *mut CommandBuffer,
) -> GfxResult {
    let (object, driver_handle) = registry().device(device.as_raw());
    let Some(f) = (unsafe { object.driver_function::<PfnAllocateCommandBuffers>(Slot::AllocateCommandBuffers) }) else {
        fail_fast(&format!("gfxAllocateCommandBuffers: driver \"{}\" does not export it", object.driver_name()));
    };
    let result = unsafe { f(Device::from_raw(driver_handle), info, buffers) };
    if result != GfxResult::SUCCESS || buffers.is_null() {
        return result;
    }
    let count = unsafe { info.as_ref() }.map_or(0, |i| i.command_buffer_count) as usize;
    for i in 0..count {
        let slot = unsafe { &mut *buffers.add(i) };
        if !slot.is_null() {
            *slot = CommandBuffer::from_raw(object.register_child(HandleKind::CommandBuffer, slot.as_raw()));
        }
    }
    result
}

pub unsafe extern "C" fn free_command_buffers(device: Device, pool: u64, count: u32, buffers: *const CommandBuffer) {
    let (object, driver_handle) = registry().device(device.as_raw());
    let Some(f) = (unsafe { object.driver_function::<PfnFreeCommandBuffers>(Slot::FreeCommandBuffers) }) else {
        fail_fast(&format!("gfxFreeCommandBuffers: driver \"{}\" does not export it", object.driver_name()));
    };
    let count = if buffers.is_null() { 0 } else { count as usize };
    let native: Vec<CommandBuffer> = (0..count)
        .map(|i| unsafe { *buffers.add(i) })
        .map(|cb| {
            if cb.is_null() {
                cb
            } else {
                CommandBuffer::from_raw(registry().device_kind(HandleKind::CommandBuffer, cb.as_raw()).1)
            }
        })
        .collect();
    let ptr = if native.is_empty() { std::ptr::null() } else { native.as_ptr() };
    unsafe { f(Device::from_raw(driver_handle), pool, native.len() as u32, ptr) };
}

pub unsafe extern "C" fn cmd_set_device_mask(command_buffer: CommandBuffer, mask: u32) {
    let (object, driver_handle) = registry().device_kind(HandleKind::CommandBuffer, command_buffer.as_raw());
    match unsafe { object.driver_function::<PfnCmdSetDeviceMask>(Slot::CmdSetDeviceMask) } {
        Some(f) => unsafe { f(CommandBuffer::from_raw(driver_handle), mask) },
        None => fail_fast(&format!("gfxCmdSetDeviceMask: driver \"{}\" does not export it", object.driver_name())),
    }
}
