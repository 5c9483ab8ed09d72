/*
 *  device.rs
 *
 *  gfx-loader - worth the squeeze
 *  (c) 2020-26 Stuart Hunter
 *
 *  Device objects - device dispatch and queue/command buffer handles
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

use std::sync::{Arc, Mutex, OnceLock, Weak};
use log::{debug, info, warn};

use crate::api::*;
use crate::dispatch::table::{self, Capability, DispatchTable, Slot, StageTable};
use crate::dispatch::unknown::{self, UnknownDeviceFunction, MAX_UNKNOWN_FUNCTIONS};
use crate::error::fail_fast;
use crate::extension;
use crate::handle::{registry, HandleKind, HandleTarget};
use crate::instance::{DriverInstance, InstanceObject};
use crate::lock;
use crate::physical_device::PhysicalDeviceRecord;

/// A logical device created through the loader
pub struct DeviceObject {
    handle: u64,
    driver_handle: u64,
    owner: u64,
    driver_name: String,
    instance: Weak<InstanceObject>,
    physical_device: Weak<PhysicalDeviceRecord>,
    api_version: u32,
    enabled_extensions: Vec<String>,
    wraps_handles: bool,
    driver_table: StageTable,
    driver_gdpa: Option<PfnGetDeviceProcAddr>,
    driver_gipa: Option<(PfnGetInstanceProcAddr, u64)>,
    dispatch: OnceLock<DispatchTable>,
    children: Mutex<Vec<u64>>,
    unknown: [OnceLock<UnknownDeviceFunction>; MAX_UNKNOWN_FUNCTIONS],
}

impl DeviceObject {
    pub fn handle(&self) -> u64 {
        self.handle
    }

    pub fn driver_handle(&self) -> u64 {
        self.driver_handle
    }

    pub fn driver_name(&self) -> &str {
        &self.driver_name
    }

    pub fn api_version(&self) -> u32 {
        self.api_version
    }

    pub fn enabled_extensions(&self) -> &[String] {
        &self.enabled_extensions
    }

    pub fn wraps_handles(&self) -> bool {
        self.wraps_handles
    }

    pub fn instance(&self) -> Option<Arc<InstanceObject>> {
        self.instance.upgrade()
    }

    pub fn physical_device(&self) -> Option<Arc<PhysicalDeviceRecord>> {
        self.physical_device.upgrade()
    }

    pub fn dispatch(&self) -> &DispatchTable {
        self.dispatch.get().unwrap_or_else(|| {
            fail_fast(&format!("GfxDevice 0x{:x} used before creation finished", self.handle))
        })
    }

    /// The driver's implementation for a device-level slot
    ///
    /// # Safety
    /// `F` must be the signature of `slot`.
    pub unsafe fn driver_function<F: Copy>(&self, slot: Slot) -> Option<F> {
        self.driver_table[slot.index()].map(|f| unsafe { cast_pfn::<F>(f) })
    }

    /// Raw lookup through the driver's device proc-address hook
    pub fn driver_proc_addr(&self, name: &str) -> Option<PfnVoidFunction> {
        let c = std::ffi::CString::new(name).ok()?;
        match (self.driver_gdpa, self.driver_gipa) {
            (Some(gdpa), _) => unsafe { gdpa(Device::from_raw(self.driver_handle), c.as_ptr()) },
            (None, Some((gipa, instance))) => unsafe { gipa(Instance::from_raw(instance), c.as_ptr()) },
            (None, None) => None,
        }
    }

    /// Register a queue or command buffer the driver returned
    pub fn register_child(self: &Arc<Self>, kind: HandleKind, driver_handle: u64) -> u64 {
        let app = registry().register_with(kind, driver_handle, self.wraps_handles, self.owner, |_| {
            HandleTarget::Device(self.clone())
        });
        let mut children = lock(&self.children);
        if !children.contains(&app) {
            children.push(app);
        }
        app
    }

    /// Forget command buffers the application freed
    pub(crate) fn release_children(&self, handles: &[u64]) {
        let mut children = lock(&self.children);
        for handle in handles.iter().filter(|h| **h != 0) {
            children.retain(|c| c != handle);
            registry().retire(*handle);
        }
    }

    /// Retire the device and everything it handed out
    pub(crate) fn retire(&self) {
        let children = std::mem::take(&mut *lock(&self.children));
        for child in children {
            registry().retire(child);
        }
        registry().retire(self.handle);
        info!("destroyed device 0x{:x}", self.handle);
    }

    /// Unknown device-scope function `index`, resolved on first use
    pub(crate) fn unknown_function(&self, index: usize) -> Option<&UnknownDeviceFunction> {
        let slot = self.unknown.get(index)?;
        if let Some(resolved) = slot.get() {
            return Some(resolved);
        }
        let instance = self.instance()?;
        let name = instance.unknown().device_name(index)?;
        Some(slot.get_or_init(|| unknown::resolve_for_device(self, &instance, index, &name)))
    }

    /// Next stage after `layer` for a device-level function
    pub fn next_proc_addr(&self, layer: &str, name: &str) -> Option<PfnVoidFunction> {
        let instance = self.instance()?;
        let position = instance.chain().position(layer)?;
        if let Some(entry) = table::lookup(name).filter(|e| e.scope.is_device_level()) {
            return self.dispatch.get()?.next_after(position, entry.slot);
        }
        let index = instance.unknown().device_index(name)?;
        self.unknown_function(index)?.next_after(position)
    }

    #[cfg(test)]
    pub(crate) fn detached_for_tests() -> Self {
        Self {
            handle: 0,
            driver_handle: 0,
            owner: 0,
            driver_name: String::new(),
            instance: Weak::new(),
            physical_device: Weak::new(),
            api_version: API_VERSION_1_0,
            enabled_extensions: Vec::new(),
            wraps_handles: false,
            driver_table: table::EMPTY_STAGE,
            driver_gdpa: None,
            driver_gipa: None,
            dispatch: OnceLock::new(),
            children: Mutex::new(Vec::new()),
            unknown: std::array::from_fn(|_| OnceLock::new()),
        }
    }
}

/// Device extensions after validation
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct DeviceExtensions {
    /// Everything the application enabled
    pub enabled: Vec<String>,
    /// The subset the driver implements
    pub driver: Vec<String>,
}

/// Check requested device extensions against the device and active layers.
/// Layer-only extensions never reach the driver.
pub(crate) fn validate_extensions(
    requested: &[String],
    device_supports: impl Fn(&str) -> bool,
    layers_support: impl Fn(&str) -> bool,
) -> Result<DeviceExtensions, String> {
    let mut driver = Vec::new();
    for ext in requested {
        if device_supports(ext) {
            driver.push(ext.clone());
        } else if !layers_support(ext) {
            return Err(ext.clone());
        }
    }
    Ok(DeviceExtensions { enabled: requested.to_vec(), driver })
}

/// Create a driver device and wrap it in a loader device
///
/// # Safety
/// `info` must point at a valid create-info structure and `allocator` must
/// be whatever the application passed.
pub(crate) unsafe fn create(
    record: &Arc<PhysicalDeviceRecord>,
    info: *const DeviceCreateInfo,
    allocator: *const std::ffi::c_void,
) -> Result<u64, GfxResult> {
    let instance = record.instance_or_abort();
    let driver = record.driver_or_abort();
    let Some(info) = (unsafe { info.as_ref() }) else {
        return Err(GfxResult::ERROR_INITIALIZATION_FAILED);
    };

    let requested = unsafe { c_str_list(info.pp_enabled_extension_names, info.enabled_extension_count) };
    let extensions = validate_extensions(
        &requested,
        |e| record.supports_extension(e),
        |e| instance.chain().declares_device_extension(e),
    )
    .map_err(|ext| {
        warn!("device extension {} is not supported by {}", ext, record.properties().name());
        GfxResult::ERROR_EXTENSION_NOT_PRESENT
    })?;

    let Some(create_device) = (unsafe { driver.function::<PfnCreateDevice>(Slot::CreateDevice) }) else {
        fail_fast(&format!("gfxCreateDevice: driver \"{}\" does not export it", driver.name()));
    };

    let names = CStringArray::new(&extensions.driver);
    let driver_info = DeviceCreateInfo {
        enabled_layer_count: 0,
        pp_enabled_layer_names: std::ptr::null(),
        enabled_extension_count: names.len(),
        pp_enabled_extension_names: names.as_ptr(),
        ..*info
    };
    let mut driver_device = Device::NULL;
    let result = unsafe {
        create_device(PhysicalDevice::from_raw(record.driver_handle()), &driver_info, allocator, &mut driver_device)
    };
    if result != GfxResult::SUCCESS {
        return Err(result);
    }

    let api_version = extension::min_version(instance.api_version(), record.properties().api_version);
    let device = build(&instance, record, &driver, driver_device.as_raw(), api_version, extensions);
    Ok(device.handle())
}

fn build(
    instance: &Arc<InstanceObject>,
    record: &Arc<PhysicalDeviceRecord>,
    driver: &Arc<DriverInstance>,
    driver_device: u64,
    api_version: u32,
    extensions: DeviceExtensions,
) -> Arc<DeviceObject> {
    let driver_gdpa = driver.get_device_proc_addr();
    let driver_gipa = Some((driver.session().get_instance_proc_addr(), driver.handle()));

    let driver_table = table::resolve_stage(
        |e| {
            e.scope.is_device_level()
                && match e.capability {
                    Capability::Always => true,
                    Capability::Core(v) => extension::version_at_least(api_version, v),
                    Capability::DeviceExtension(ext) => extensions.driver.iter().any(|x| x == ext),
                    Capability::InstanceExtension(_) => false,
                }
        },
        |name| driver.device_proc_addr(driver_device, name),
    );

    let owner = driver.session().id();
    let wraps_handles = instance.chain().wraps_handles();
    let mut created = None;
    let handle = registry().register_with(HandleKind::Device, driver_device, wraps_handles, owner, |handle| {
        let device = Arc::new(DeviceObject {
            handle,
            driver_handle: driver_device,
            owner,
            driver_name: driver.name().to_string(),
            instance: Arc::downgrade(instance),
            physical_device: Arc::downgrade(record),
            api_version,
            enabled_extensions: extensions.enabled,
            wraps_handles,
            driver_table,
            driver_gdpa,
            driver_gipa,
            dispatch: OnceLock::new(),
            children: Mutex::new(Vec::new()),
            unknown: std::array::from_fn(|_| OnceLock::new()),
        });
        created = Some(device.clone());
        HandleTarget::Device(device)
    });
    let device = match created {
        Some(device) => device,
        None => registry().device(handle).0,
    };

    let layers: Vec<StageTable> = instance
        .chain()
        .layers()
        .iter()
        .map(|layer| {
            table::resolve_stage(|e| e.scope.is_device_level(), |name| layer.device_proc_addr(handle, name))
        })
        .collect();
    let terminators = table::terminator_stage(|e| e.scope.is_device_level());
    // set exactly once, right here
    let _ = device.dispatch.set(DispatchTable::new(layers, terminators));

    // functions the application already asked the instance for
    for index in 0..instance.unknown().device_count() {
        device.unknown_function(index);
    }

    debug!(
        "created device 0x{:x} (driver 0x{:x}) on {} api {}{}",
        handle,
        driver_device,
        record.properties().name(),
        version_string(api_version),
        if wraps_handles { ", wrapped" } else { "" }
    );
    device
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_layer_only_extensions_are_stripped() {
        let requested = names(&["GFX_KHR_swapchain", "GFX_EXT_debug_marker"]);
        let r = validate_extensions(&requested, |e| e == "GFX_KHR_swapchain", |e| e == "GFX_EXT_debug_marker").unwrap();
        assert_eq!(r.enabled, requested);
        assert_eq!(r.driver, names(&["GFX_KHR_swapchain"]));
    }

    #[test]
    fn test_unknown_extension_rejected() {
        let requested = names(&["GFX_KHR_swapchain", "GFX_EXT_nowhere"]);
        let r = validate_extensions(&requested, |e| e == "GFX_KHR_swapchain", |_| false);
        assert_eq!(r, Err("GFX_EXT_nowhere".to_string()));
    }

    #[test]
    fn test_children_are_tracked_and_released() {
        let device = Arc::new(DeviceObject::detached_for_tests());
        let a = device.register_child(HandleKind::CommandBuffer, 0xdead_0010);
        let b = device.register_child(HandleKind::CommandBuffer, 0xdead_0020);
        assert_eq!(lock(&device.children).len(), 2);
        device.release_children(&[a, 0]);
        assert!(registry().resolve(HandleKind::CommandBuffer, a).is_err());
        assert!(registry().resolve(HandleKind::CommandBuffer, b).is_ok());
        device.retire();
        assert!(registry().resolve(HandleKind::CommandBuffer, b).is_err());
    }
}
