/*
 *  physical_device.rs
 *
 *  gfx-loader - worth the squeeze
 *  (c) 2020-26 Stuart Hunter
 *
 *  Physical device aggregation and ordering
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

use std::sync::{Arc, Weak};
use log::debug;

use crate::api::*;
use crate::config::DeviceSelect;
use crate::driver::DriverSession;
use crate::error::fail_fast;
use crate::instance::{DriverInstance, InstanceObject};
use crate::manifest::ExtensionDecl;

/// One driver-local physical device as the loader exposes it.
///
/// Every back-reference is weak: a device record never keeps its
/// instance, driver instance or session alive.
pub struct PhysicalDeviceRecord {
    handle: u64,
    driver_handle: u64,
    instance: Weak<InstanceObject>,
    driver: Weak<DriverInstance>,
    session: Weak<DriverSession>,
    properties: PhysicalDeviceProperties,
    extensions: Vec<ExtensionDecl>,
}

impl std::fmt::Debug for PhysicalDeviceRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhysicalDeviceRecord")
            .field("handle", &format_args!("0x{:x}", self.handle))
            .field("driver_handle", &format_args!("0x{:x}", self.driver_handle))
            .field("name", &self.properties.name())
            .finish()
    }
}

impl PhysicalDeviceRecord {
    pub(crate) fn new(
        handle: u64,
        instance: Weak<InstanceObject>,
        driver: &Arc<DriverInstance>,
        probe: PhysicalDeviceProbe,
    ) -> Self {
        Self {
            handle,
            driver_handle: probe.driver_handle,
            instance,
            driver: Arc::downgrade(driver),
            session: Arc::downgrade(driver.session()),
            properties: probe.properties,
            extensions: probe.extensions,
        }
    }

    /// Loader-visible handle
    pub fn handle(&self) -> u64 {
        self.handle
    }

    /// The driver's own handle for this device
    pub fn driver_handle(&self) -> u64 {
        self.driver_handle
    }

    pub fn properties(&self) -> &PhysicalDeviceProperties {
        &self.properties
    }

    pub fn extensions(&self) -> &[ExtensionDecl] {
        &self.extensions
    }

    pub fn supports_extension(&self, name: &str) -> bool {
        self.extensions.iter().any(|e| e.name == name)
    }

    pub fn session(&self) -> Option<Arc<DriverSession>> {
        self.session.upgrade()
    }

    pub fn instance(&self) -> Option<Arc<InstanceObject>> {
        self.instance.upgrade()
    }

    pub fn driver(&self) -> Option<Arc<DriverInstance>> {
        self.driver.upgrade()
    }

    pub(crate) fn instance_or_abort(&self) -> Arc<InstanceObject> {
        self.instance().unwrap_or_else(|| {
            fail_fast(&format!(
                "GfxPhysicalDevice 0x{:x} used after its instance was destroyed",
                self.handle
            ))
        })
    }

    pub(crate) fn driver_or_abort(&self) -> Arc<DriverInstance> {
        self.driver().unwrap_or_else(|| {
            fail_fast(&format!(
                "GfxPhysicalDevice 0x{:x} used after its instance was destroyed",
                self.handle
            ))
        })
    }
}

/// What the loader learned about a device from its driver
#[derive(Debug, Clone)]
pub struct PhysicalDeviceProbe {
    pub driver_handle: u64,
    pub properties: PhysicalDeviceProperties,
    pub extensions: Vec<ExtensionDecl>,
}

/// Ask one driver instance for its devices
pub(crate) fn probe_driver(driver: &DriverInstance) -> Vec<PhysicalDeviceProbe> {
    use crate::dispatch::table::Slot;

    let enumerate = unsafe { driver.function::<PfnEnumeratePhysicalDevices>(Slot::EnumeratePhysicalDevices) };
    let properties = unsafe { driver.function::<PfnGetPhysicalDeviceProperties>(Slot::GetPhysicalDeviceProperties) };
    let (Some(enumerate), Some(properties)) = (enumerate, properties) else {
        log::warn!("driver {} cannot enumerate physical devices, ignoring it", driver.name());
        return Vec::new();
    };
    let extensions = unsafe {
        driver.function::<PfnEnumerateDeviceExtensionProperties>(Slot::EnumerateDeviceExtensionProperties)
    };

    let instance = Instance::from_raw(driver.handle());
    let mut count = 0u32;
    let result = unsafe { enumerate(instance, &mut count, std::ptr::null_mut()) };
    if result.is_error() {
        log::warn!("driver {} failed to count physical devices: {}", driver.name(), result);
        return Vec::new();
    }
    let mut handles = vec![PhysicalDevice::NULL; count as usize];
    let result = unsafe { enumerate(instance, &mut count, handles.as_mut_ptr()) };
    if result.is_error() {
        log::warn!("driver {} failed to enumerate physical devices: {}", driver.name(), result);
        return Vec::new();
    }
    handles.truncate(count as usize);

    handles
        .into_iter()
        .filter(|h| !h.is_null())
        .map(|handle| {
            let mut props = PhysicalDeviceProperties::default();
            unsafe { properties(handle, &mut props) };
            let exts = extensions
                .map(|f| query_device_extensions(f, handle))
                .unwrap_or_default();
            debug!(
                "driver {} device 0x{:x} \"{}\" {:04x}:{:04x} {}",
                driver.name(),
                handle.as_raw(),
                props.name(),
                props.vendor_id,
                props.device_id,
                props.device_type.name()
            );
            PhysicalDeviceProbe { driver_handle: handle.as_raw(), properties: props, extensions: exts }
        })
        .collect()
}

fn query_device_extensions(f: PfnEnumerateDeviceExtensionProperties, device: PhysicalDevice) -> Vec<ExtensionDecl> {
    let mut count = 0u32;
    if unsafe { f(device, std::ptr::null(), &mut count, std::ptr::null_mut()) }.is_error() {
        return Vec::new();
    }
    let mut props = vec![ExtensionProperties::default(); count as usize];
    if unsafe { f(device, std::ptr::null(), &mut count, props.as_mut_ptr()) }.is_error() {
        return Vec::new();
    }
    props.truncate(count as usize);
    props.iter().map(|p| ExtensionDecl::new(&p.name(), p.spec_version)).collect()
}

fn type_rank(device_type: PhysicalDeviceType) -> u8 {
    match device_type {
        PhysicalDeviceType::DISCRETE_GPU => 0,
        PhysicalDeviceType::INTEGRATED_GPU => 1,
        PhysicalDeviceType::VIRTUAL_GPU => 2,
        PhysicalDeviceType::CPU => 3,
        _ => 4,
    }
}

/// Ordering key: selected device, then type, then id
pub fn sort_key(properties: &PhysicalDeviceProperties, select: Option<DeviceSelect>) -> (u8, u8, u32) {
    let selected = select.is_some_and(|s| s.vendor_id == properties.vendor_id && s.device_id == properties.device_id);
    (
        u8::from(!selected),
        type_rank(properties.device_type),
        properties.device_id ^ properties.vendor_id,
    )
}

/// Reorder loader handles. Driver-local handles are untouched.
pub fn sort_devices(devices: &mut [Arc<PhysicalDeviceRecord>], select: Option<DeviceSelect>) {
    devices.sort_by_key(|d| sort_key(d.properties(), select));
}
