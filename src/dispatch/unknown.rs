/*
 *  dispatch/unknown.rs
 *
 *  gfx-loader - worth the squeeze
 *  (c) 2020-26 Stuart Hunter
 *
 *  Pass-through stubs for functions the loader does not know
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

//! Unknown-function pass-through
//!
//! A name missing from the static table still resolves when a driver or
//! layer exports it. The caller gets an assembly stub bound to a table
//! index (see [`stubs`](super::stubs)). The stub hands its first argument
//! to [`next_stage`], which looks up the function registered at that
//! index and, for terminators, swaps in the driver's handle. Every other
//! argument stays in its register or stack slot, so any signature passes.
//!
//! Each instance has [`MAX_UNKNOWN_FUNCTIONS`] physical-device slots and
//! as many device slots.

use std::sync::{Arc, Mutex};
use log::{debug, warn};

use crate::api::*;
use crate::device::DeviceObject;
use crate::dispatch::stubs::{stub, StubKind};
use crate::error::fail_fast;
use crate::handle::registry;
use crate::instance::InstanceObject;
use crate::lock;

pub const MAX_UNKNOWN_FUNCTIONS: usize = 64;

fn first_after(stages: &[Option<PfnVoidFunction>], start: usize) -> Option<PfnVoidFunction> {
    stages.iter().skip(start).find_map(|s| *s)
}

struct PhysDevFunction {
    name: String,
    layer_stages: Vec<Option<PfnVoidFunction>>,
}

/// Per-instance registry of unknown function names
#[derive(Default)]
pub struct UnknownFunctions {
    phys_dev: Mutex<Vec<PhysDevFunction>>,
    device: Mutex<Vec<String>>,
}

impl UnknownFunctions {
    pub fn phys_dev_index(&self, name: &str) -> Option<usize> {
        lock(&self.phys_dev).iter().position(|f| f.name == name)
    }

    pub fn phys_dev_name(&self, index: usize) -> Option<String> {
        lock(&self.phys_dev).get(index).map(|f| f.name.clone())
    }

    pub fn phys_dev_count(&self) -> usize {
        lock(&self.phys_dev).len()
    }

    /// First stage for physical-device function `index`
    fn phys_dev_top(&self, index: usize) -> Option<PfnVoidFunction> {
        let functions = lock(&self.phys_dev);
        let function = functions.get(index)?;
        first_after(&function.layer_stages, 0).or_else(|| stub(StubKind::PhysDevTerminator, index))
    }

    pub(crate) fn phys_dev_next_after(&self, name: &str, position: usize) -> Option<PfnVoidFunction> {
        let functions = lock(&self.phys_dev);
        let index = functions.iter().position(|f| f.name == name)?;
        first_after(&functions[index].layer_stages, position + 1)
            .or_else(|| stub(StubKind::PhysDevTerminator, index))
    }

    pub fn device_index(&self, name: &str) -> Option<usize> {
        lock(&self.device).iter().position(|n| n == name)
    }

    pub fn device_name(&self, index: usize) -> Option<String> {
        lock(&self.device).get(index).cloned()
    }

    pub fn device_count(&self) -> usize {
        lock(&self.device).len()
    }

    fn add_phys_dev(&self, name: &str, layer_stages: impl FnOnce() -> Vec<Option<PfnVoidFunction>>) -> Option<usize> {
        let mut functions = lock(&self.phys_dev);
        if let Some(index) = functions.iter().position(|f| f.name == name) {
            return Some(index);
        }
        if functions.len() >= MAX_UNKNOWN_FUNCTIONS {
            warn!("unknown physical-device function table is full, {} is not available", name);
            return None;
        }
        functions.push(PhysDevFunction { name: name.to_string(), layer_stages: layer_stages() });
        debug!("unknown physical-device function {} at index {}", name, functions.len() - 1);
        Some(functions.len() - 1)
    }

    fn add_device(&self, name: &str) -> Option<usize> {
        let mut names = lock(&self.device);
        if let Some(index) = names.iter().position(|n| n == name) {
            return Some(index);
        }
        if names.len() >= MAX_UNKNOWN_FUNCTIONS {
            warn!("unknown device function table is full, {} is not available", name);
            return None;
        }
        names.push(name.to_string());
        debug!("unknown device function {} at index {}", name, names.len() - 1);
        Some(names.len() - 1)
    }
}

/// One unknown device-scope function resolved on one device
#[derive(Debug, Clone)]
pub struct UnknownDeviceFunction {
    layer_stages: Vec<Option<PfnVoidFunction>>,
    driver: Option<PfnVoidFunction>,
    terminator: Option<PfnVoidFunction>,
}

impl UnknownDeviceFunction {
    pub fn top(&self) -> Option<PfnVoidFunction> {
        first_after(&self.layer_stages, 0).or(self.terminator)
    }

    pub fn next_after(&self, position: usize) -> Option<PfnVoidFunction> {
        first_after(&self.layer_stages, position + 1).or(self.terminator)
    }

    pub fn driver(&self) -> Option<PfnVoidFunction> {
        self.driver
    }
}

pub(crate) fn resolve_for_device(
    device: &DeviceObject,
    instance: &InstanceObject,
    index: usize,
    name: &str,
) -> UnknownDeviceFunction {
    let layer_stages = instance
        .chain()
        .layers()
        .iter()
        .map(|l| l.device_proc_addr(device.handle(), name))
        .collect();
    let driver = device.driver_proc_addr(name);
    // even pass-through handles may have been re-issued on collision
    let terminator = driver.and_then(|_| stub(StubKind::DevTerminator, index));
    UnknownDeviceFunction { layer_stages, driver, terminator }
}

/// Instance-level fallback for names missing from the static table
pub(crate) fn instance_lookup(instance: &InstanceObject, name: &str) -> Option<PfnVoidFunction> {
    physical_device_lookup(instance, name).or_else(|| device_lookup_from_instance(instance, name))
}

fn physical_device_lookup(instance: &InstanceObject, name: &str) -> Option<PfnVoidFunction> {
    let unknown = instance.unknown();
    if let Some(index) = unknown.phys_dev_index(name) {
        return stub(StubKind::PhysDevTrampoline, index);
    }

    let handle = instance.handle();
    let known = instance
        .drivers()
        .iter()
        .any(|d| d.session().physical_device_proc_addr(d.handle(), name).is_some())
        || instance
            .chain()
            .layers()
            .iter()
            .any(|l| l.physical_device_proc_addr(handle, name).is_some());
    if !known {
        return None;
    }

    let index = unknown.add_phys_dev(name, || {
        instance
            .chain()
            .layers()
            .iter()
            .map(|l| l.physical_device_proc_addr(handle, name))
            .collect()
    })?;
    stub(StubKind::PhysDevTrampoline, index)
}

fn device_lookup_from_instance(instance: &InstanceObject, name: &str) -> Option<PfnVoidFunction> {
    let unknown = instance.unknown();
    if let Some(index) = unknown.device_index(name) {
        return stub(StubKind::DevTrampoline, index);
    }

    let handle = instance.handle();
    let known = instance.drivers().iter().any(|d| d.session().proc_addr(d.handle(), name).is_some())
        || instance.chain().layers().iter().any(|l| l.instance_proc_addr(handle, name).is_some());
    if !known {
        return None;
    }
    let index = unknown.add_device(name)?;
    stub(StubKind::DevTrampoline, index)
}

/// Device-level fallback for names missing from the static table
pub(crate) fn device_lookup(device: &Arc<DeviceObject>, name: &str) -> Option<PfnVoidFunction> {
    let instance = device.instance()?;
    let index = match instance.unknown().device_index(name) {
        Some(index) => index,
        None => {
            let known = device.driver_proc_addr(name).is_some()
                || instance
                    .chain()
                    .layers()
                    .iter()
                    .any(|l| l.device_proc_addr(device.handle(), name).is_some());
            if !known {
                return None;
            }
            instance.unknown().add_device(name)?
        }
    };
    device.unknown_function(index)?.top()?;
    stub(StubKind::DevTrampoline, index)
}

/// Next function for the stub at `index` of group `kind`, plus the
/// handle to pass it as first argument
pub(crate) fn next_stage(kind: StubKind, index: usize, handle: u64) -> (PfnVoidFunction, u64) {
    match kind {
        StubKind::PhysDevTrampoline => {
            let (record, _) = registry().physical_device(handle);
            let instance = record.instance_or_abort();
            let Some(next) = instance.unknown().phys_dev_top(index) else {
                fail_fast(&format!("unknown physical-device function {} is not registered", index));
            };
            (next, handle)
        }
        StubKind::PhysDevTerminator => {
            let (record, driver_handle) = registry().physical_device(handle);
            let instance = record.instance_or_abort();
            let driver = record.driver_or_abort();
            let name = instance.unknown().phys_dev_name(index).unwrap_or_default();
            let Some(function) = driver.phys_dev_ext(index, &name) else {
                fail_fast(&format!(
                    "{}: driver \"{}\" does not support it on GfxPhysicalDevice 0x{:x}",
                    name,
                    driver.name(),
                    handle
                ));
            };
            (function, driver_handle)
        }
        StubKind::DevTrampoline => {
            let (device, _) = registry().device_child(handle);
            let Some(next) = device.unknown_function(index).and_then(UnknownDeviceFunction::top) else {
                fail_fast(&format!(
                    "unknown device function {} is not available on GfxDevice 0x{:x}",
                    index,
                    device.handle()
                ));
            };
            (next, handle)
        }
        StubKind::DevTerminator => {
            let (device, driver_handle) = registry().device_child(handle);
            let Some(function) = device.unknown_function(index).and_then(UnknownDeviceFunction::driver) else {
                fail_fast(&format!(
                    "unknown device function {}: driver \"{}\" does not export it",
                    index,
                    device.driver_name()
                ));
            };
            (function, driver_handle)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_get_stable_indices() {
        let table = UnknownFunctions::default();
        assert_eq!(table.add_device("gfxVendorA"), Some(0));
        assert_eq!(table.add_device("gfxVendorB"), Some(1));
        assert_eq!(table.add_device("gfxVendorA"), Some(0));
        assert_eq!(table.device_name(1).as_deref(), Some("gfxVendorB"));
        assert_eq!(table.device_count(), 2);
    }

    #[test]
    fn test_table_full_returns_none() {
        let table = UnknownFunctions::default();
        for i in 0..MAX_UNKNOWN_FUNCTIONS {
            assert_eq!(table.add_phys_dev(&format!("gfxVendor{}", i), Vec::new), Some(i));
        }
        assert_eq!(table.add_phys_dev("gfxOneTooMany", Vec::new), None);
        assert_eq!(table.phys_dev_count(), MAX_UNKNOWN_FUNCTIONS);
    }

    #[test]
    fn test_phys_dev_chain_falls_through_to_terminator() {
        unsafe extern "C" fn layer_hook() {}
        let table = UnknownFunctions::default();
        table.add_phys_dev("gfxVendorQuery", || vec![Some(layer_hook as PfnVoidFunction), None]);
        assert_eq!(table.phys_dev_top(0).map(|f| f as usize), Some(layer_hook as usize));
        assert_eq!(
            table.phys_dev_next_after("gfxVendorQuery", 0).map(|f| f as usize),
            stub(StubKind::PhysDevTerminator, 0).map(|f| f as usize)
        );
    }
}
