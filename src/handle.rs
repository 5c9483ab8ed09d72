/*
 *  handle.rs
 *
 *  gfx-loader - worth the squeeze
 *  (c) 2020-26 Stuart Hunter
 *
 *  Handle registry - maps application handles to loader records
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

//! Handle registry
//!
//! Instance and physical-device handles are always issued by the loader.
//! Device, queue and command-buffer handles pass the driver's value
//! straight through unless a layer in the chain asks for wrapping, or the
//! driver value collides with a live handle; then the loader issues its own
//! value and keeps a bijection with the driver's.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock, RwLock, RwLockReadGuard, RwLockWriteGuard};
use log::trace;

use crate::device::DeviceObject;
use crate::error::{fail_fast, InvalidHandle};
use crate::instance::InstanceObject;
use crate::physical_device::PhysicalDeviceRecord;

const HANDLE_MAGIC: u64 = 0x6766_785f_6c64_7200;
/// Loader-issued values live in a non-canonical range no driver pointer
/// can occupy
pub const FIRST_ISSUED: u64 = 0xfeed_0000_0000_1000;
const ISSUE_STRIDE: u64 = 0x10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u64)]
pub enum HandleKind {
    Instance = 1,
    PhysicalDevice = 2,
    Device = 3,
    Queue = 4,
    CommandBuffer = 5,
}

impl HandleKind {
    /// Class name used in diagnostics
    pub fn class(self) -> &'static str {
        match self {
            Self::Instance => "GfxInstance",
            Self::PhysicalDevice => "GfxPhysicalDevice",
            Self::Device => "GfxDevice",
            Self::Queue => "GfxQueue",
            Self::CommandBuffer => "GfxCommandBuffer",
        }
    }

    fn tag(self) -> u64 {
        HANDLE_MAGIC ^ self as u64
    }
}

/// The record a handle resolves to
#[derive(Clone)]
pub enum HandleTarget {
    Instance(Arc<InstanceObject>),
    PhysicalDevice(Arc<PhysicalDeviceRecord>),
    /// Devices and the queues/command buffers they own
    Device(Arc<DeviceObject>),
}

struct HandleEntry {
    tag: u64,
    kind: HandleKind,
    driver_handle: u64,
    owner: u64,
    target: HandleTarget,
}

impl HandleEntry {
    fn is_valid_for(&self, kind: HandleKind) -> bool {
        self.tag == kind.tag() && self.kind == kind
    }
}

/// Result of a successful lookup
#[derive(Clone)]
pub struct Resolved {
    pub kind: HandleKind,
    pub driver_handle: u64,
    pub target: HandleTarget,
}

#[derive(Default)]
struct Tables {
    entries: HashMap<u64, HandleEntry>,
    /// (owner, kind, driver value) -> application value
    reverse: HashMap<(u64, HandleKind, u64), u64>,
}

/// Process-wide handle registry
pub struct HandleRegistry {
    tables: RwLock<Tables>,
    next: AtomicU64,
}

static REGISTRY: LazyLock<HandleRegistry> = LazyLock::new(HandleRegistry::new);

/// The registry every entry point validates against
pub fn registry() -> &'static HandleRegistry {
    &REGISTRY
}

impl Default for HandleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HandleRegistry {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            next: AtomicU64::new(FIRST_ISSUED),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Tables> {
        self.tables.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Tables> {
        self.tables.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Reserve a fresh loader-issued value
    pub fn issue(&self) -> u64 {
        self.issue_in(&self.read())
    }

    fn issue_in(&self, tables: &Tables) -> u64 {
        loop {
            let value = self.next.fetch_add(ISSUE_STRIDE, Ordering::Relaxed);
            if value != 0 && !tables.entries.contains_key(&value) {
                return value;
            }
        }
    }

    /// Insert a record under a value previously returned by [`issue`](Self::issue)
    pub fn insert_issued(&self, app: u64, kind: HandleKind, driver_handle: u64, owner: u64, target: HandleTarget) {
        Self::insert_in(&mut self.write(), app, kind, driver_handle, owner, target);
    }

    fn insert_in(tables: &mut Tables, app: u64, kind: HandleKind, driver_handle: u64, owner: u64, target: HandleTarget) {
        tables.reverse.insert((owner, kind, driver_handle), app);
        tables.entries.insert(app, HandleEntry {
            tag: kind.tag(),
            kind,
            driver_handle,
            owner,
            target,
        });
        trace!("registered {} 0x{:x} -> driver 0x{:x}", kind.class(), app, driver_handle);
    }

    /// Register a driver handle, returning the application-visible value.
    ///
    /// Registering the same driver value for the same owner again returns
    /// the existing application value. `target` runs under the registry
    /// lock and must not call back into it.
    pub fn register_with(
        &self,
        kind: HandleKind,
        driver_handle: u64,
        wrap: bool,
        owner: u64,
        target: impl FnOnce(u64) -> HandleTarget,
    ) -> u64 {
        let mut tables = self.write();
        if let Some(&app) = tables.reverse.get(&(owner, kind, driver_handle)) {
            return app;
        }

        let collides = tables.entries.contains_key(&driver_handle);
        let app = if wrap || collides || driver_handle == 0 {
            self.issue_in(&tables)
        } else {
            driver_handle
        };
        Self::insert_in(&mut tables, app, kind, driver_handle, owner, target(app));
        app
    }

    /// Look up a handle, checking its structural tag
    pub fn resolve(&self, kind: HandleKind, app: u64) -> Result<Resolved, InvalidHandle> {
        let tables = self.read();
        match tables.entries.get(&app) {
            Some(entry) if entry.is_valid_for(kind) => Ok(Resolved {
                kind,
                driver_handle: entry.driver_handle,
                target: entry.target.clone(),
            }),
            _ => Err(InvalidHandle { class: kind.class(), value: app }),
        }
    }

    /// Look up any device-owned handle (device, queue or command buffer)
    pub fn resolve_device_child(&self, app: u64) -> Result<Resolved, InvalidHandle> {
        let tables = self.read();
        if let Some(entry) = tables.entries.get(&app) {
            if matches!(entry.kind, HandleKind::Device | HandleKind::Queue | HandleKind::CommandBuffer)
                && entry.is_valid_for(entry.kind)
            {
                return Ok(Resolved {
                    kind: entry.kind,
                    driver_handle: entry.driver_handle,
                    target: entry.target.clone(),
                });
            }
        }
        Err(InvalidHandle { class: "dispatchable device-level", value: app })
    }

    /// Look up any dispatchable handle
    pub fn resolve_any(&self, app: u64) -> Result<Resolved, InvalidHandle> {
        let tables = self.read();
        match tables.entries.get(&app) {
            Some(entry) if entry.is_valid_for(entry.kind) => Ok(Resolved {
                kind: entry.kind,
                driver_handle: entry.driver_handle,
                target: entry.target.clone(),
            }),
            _ => Err(InvalidHandle { class: "dispatchable", value: app }),
        }
    }

    /// Driver value for an application handle without the record
    pub fn driver_handle(&self, kind: HandleKind, app: u64) -> Result<u64, InvalidHandle> {
        self.resolve(kind, app).map(|r| r.driver_handle)
    }

    /// Remove a handle; later use of it is invalid
    pub fn retire(&self, app: u64) {
        let mut tables = self.write();
        if let Some(mut entry) = tables.entries.remove(&app) {
            tables.reverse.remove(&(entry.owner, entry.kind, entry.driver_handle));
            entry.tag = 0;
            trace!("retired {} 0x{:x}", entry.kind.class(), app);
        }
    }

    pub fn len(&self) -> usize {
        self.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn instance(&self, app: u64) -> Arc<InstanceObject> {
        match self.resolve(HandleKind::Instance, app) {
            Ok(Resolved { target: HandleTarget::Instance(i), .. }) => i,
            _ => invalid(HandleKind::Instance, app),
        }
    }

    pub fn physical_device(&self, app: u64) -> (Arc<PhysicalDeviceRecord>, u64) {
        match self.resolve(HandleKind::PhysicalDevice, app) {
            Ok(Resolved { target: HandleTarget::PhysicalDevice(p), driver_handle, .. }) => (p, driver_handle),
            _ => invalid(HandleKind::PhysicalDevice, app),
        }
    }

    pub fn device(&self, app: u64) -> (Arc<DeviceObject>, u64) {
        self.device_kind(HandleKind::Device, app)
    }

    /// Queue or command buffer, returned with its owning device
    pub fn device_kind(&self, kind: HandleKind, app: u64) -> (Arc<DeviceObject>, u64) {
        match self.resolve(kind, app) {
            Ok(Resolved { target: HandleTarget::Device(d), driver_handle, .. }) => (d, driver_handle),
            _ => invalid(kind, app),
        }
    }

    /// Device, queue or command buffer
    pub fn device_child(&self, app: u64) -> (Arc<DeviceObject>, u64) {
        match self.resolve_device_child(app) {
            Ok(Resolved { target: HandleTarget::Device(d), driver_handle, .. }) => (d, driver_handle),
            Ok(_) | Err(_) => fail_fast(&format!(
                "Invalid dispatchable device-level handle 0x{:x} [handle is unknown or already destroyed]",
                app
            )),
        }
    }
}

fn invalid(kind: HandleKind, app: u64) -> ! {
    fail_fast(&format!(
        "Invalid {} handle 0x{:x} [handle is unknown or already destroyed]",
        kind.class(),
        app
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use crate::device::DeviceObject;

    fn device_target() -> HandleTarget {
        HandleTarget::Device(Arc::new(DeviceObject::detached_for_tests()))
    }

    #[test]
    fn test_pass_through_keeps_driver_value() {
        let reg = HandleRegistry::new();
        let app = reg.register_with(HandleKind::Device, 0xabc0, false, 1, |_| device_target());
        assert_eq!(app, 0xabc0);
        let r = reg.resolve(HandleKind::Device, app).unwrap();
        assert_eq!(r.driver_handle, 0xabc0);
    }

    #[test]
    fn test_wrapping_is_a_bijection() {
        let reg = HandleRegistry::new();
        let a = reg.register_with(HandleKind::Queue, 0x10, true, 7, |_| device_target());
        let b = reg.register_with(HandleKind::Queue, 0x20, true, 7, |_| device_target());
        assert_ne!(a, 0x10);
        assert_ne!(a, b);
        // same driver value maps back to the same app value
        assert_eq!(reg.register_with(HandleKind::Queue, 0x10, true, 7, |_| device_target()), a);
        assert_eq!(reg.driver_handle(HandleKind::Queue, a), Ok(0x10));
        assert_eq!(reg.driver_handle(HandleKind::Queue, b), Ok(0x20));
    }

    #[test]
    fn test_collision_forces_wrapping() {
        let reg = HandleRegistry::new();
        let first = reg.register_with(HandleKind::Device, 0x500, false, 1, |_| device_target());
        let second = reg.register_with(HandleKind::Device, 0x500, false, 2, |_| device_target());
        assert_eq!(first, 0x500);
        assert_ne!(second, 0x500);
        assert_eq!(reg.driver_handle(HandleKind::Device, second), Ok(0x500));
    }

    #[test]
    fn test_kind_mismatch_and_retire() {
        let reg = HandleRegistry::new();
        let app = reg.register_with(HandleKind::CommandBuffer, 0x900, false, 1, |_| device_target());
        assert!(reg.resolve(HandleKind::Device, app).is_err());
        assert!(reg.resolve_device_child(app).is_ok());
        reg.retire(app);
        let err = reg.resolve(HandleKind::CommandBuffer, app).err().unwrap();
        assert_eq!(err.class, "GfxCommandBuffer");
        assert!(reg.is_empty());
    }

    #[test]
    fn test_issue_skips_live_values() {
        let reg = HandleRegistry::new();
        let a = reg.issue();
        reg.insert_issued(a, HandleKind::Device, 1, 1, device_target());
        let b = reg.issue();
        assert_ne!(a, b);
        assert!(a >= FIRST_ISSUED && b >= FIRST_ISSUED);
    }

    #[test]
    fn test_concurrent_registration_yields_one_value() {
        let reg = Arc::new(HandleRegistry::new());
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let reg = reg.clone();
                std::thread::spawn(move || {
                    (0..64)
                        .map(|i| reg.register_with(HandleKind::Queue, 0x7000 + i * 0x10, true, 3, |_| device_target()))
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let results: Vec<Vec<u64>> = threads.into_iter().map(|t| t.join().unwrap()).collect();
        for other in &results[1..] {
            assert_eq!(other, &results[0]);
        }
        assert_eq!(reg.len(), 64);
    }
}
