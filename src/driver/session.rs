/*
 *  driver/session.rs
 *
 *  gfx-loader - worth the squeeze
 *  (c) 2020-26 Stuart Hunter
 *
 *  Driver sessions - one loaded driver library, negotiated and cached
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

use std::collections::HashMap;
use std::ffi::CString;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use log::{debug, info, warn};

use crate::api::*;
use crate::error::DriverLoadError;
use crate::lock;
use crate::manifest::{DriverRecord, ExtensionDecl};
use crate::physical_device::PhysicalDeviceRecord;
use super::library::{
    open_library,
    DiscoveryService,
    DynamicLibrary,
    LibraryIdentity,
    LibraryKind,
    LibraryLoader,
};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// A loaded driver library with its negotiated interface.
///
/// Sessions are process-lifetime: once opened they are never unloaded.
pub struct DriverSession {
    id: u64,
    identity: LibraryIdentity,
    record: DriverRecord,
    library: Arc<dyn DynamicLibrary>,
    interface_version: u32,
    gipa: PfnGetInstanceProcAddr,
    gpdpa: Option<PfnGetPhysicalDeviceProcAddr>,
    create_instance: PfnCreateInstance,
    api_version: u32,
    extensions: Vec<ExtensionDecl>,
    physical_devices: Mutex<Vec<Weak<PhysicalDeviceRecord>>>,
}

impl std::fmt::Debug for DriverSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverSession")
            .field("id", &self.id)
            .field("identity", &self.identity)
            .field("interface_version", &self.interface_version)
            .field("api_version", &version_string(self.api_version))
            .finish()
    }
}

impl DriverSession {
    /// Load and negotiate with a driver library
    ///
    /// This performs the following steps:
    /// 1. Load the shared library
    /// 2. Negotiate the interface version, if the driver exports the hook
    /// 3. Resolve the instance-level proc-address entry point
    /// 4. Resolve the mandatory global entry points through it
    /// 5. Cache the driver's declared version and extensions
    pub fn open(
        record: &DriverRecord,
        libraries: &dyn LibraryLoader,
        service: Option<&dyn DiscoveryService>,
    ) -> Result<Self, DriverLoadError> {
        Self::negotiate(record, Self::load(record, libraries, service)?)
    }

    /// Step 1 alone: load the shared library without calling into it
    pub fn load(
        record: &DriverRecord,
        libraries: &dyn LibraryLoader,
        service: Option<&dyn DiscoveryService>,
    ) -> Result<Arc<dyn DynamicLibrary>, DriverLoadError> {
        let name = record.library.to_string();
        info!("Loading driver from: {}", name);
        open_library(&record.library, LibraryKind::Driver, libraries, service)
            .map_err(|reason| DriverLoadError::LibraryLoadFailed { library: name, reason })
    }

    /// Steps 2 to 5 on an already loaded library
    pub fn negotiate(record: &DriverRecord, library: Arc<dyn DynamicLibrary>) -> Result<Self, DriverLoadError> {
        let name = record.library.to_string();
        let interface_version = negotiate(&library, &name)?;
        debug!("driver {} interface version {}", name, interface_version);

        let gipa = library
            .symbol(DRIVER_GET_INSTANCE_PROC_ADDR_SYMBOL)
            .or_else(|| library.symbol(DRIVER_LEGACY_GET_INSTANCE_PROC_ADDR_SYMBOL))
            .ok_or_else(|| DriverLoadError::MissingRequiredEntryPoint {
                library: name.clone(),
                entry_point: DRIVER_GET_INSTANCE_PROC_ADDR_SYMBOL.to_string(),
            })?;
        // SAFETY: the driver contract fixes this symbol's signature
        let gipa: PfnGetInstanceProcAddr = unsafe { cast_pfn(gipa) };

        let gpdpa = if interface_version >= MIN_PHYS_DEV_EXTENSION_DRIVER_INTERFACE_VERSION {
            library
                .symbol(DRIVER_GET_PHYSICAL_DEVICE_PROC_ADDR_SYMBOL)
                .map(|f| unsafe { cast_pfn::<PfnGetPhysicalDeviceProcAddr>(f) })
        } else {
            None
        };

        let global = |entry: &str| -> Option<PfnVoidFunction> {
            let c = CString::new(entry).ok()?;
            unsafe { gipa(Instance::NULL, c.as_ptr()) }
        };
        let required = |entry: &'static str| {
            global(entry).ok_or_else(|| DriverLoadError::MissingRequiredEntryPoint {
                library: name.clone(),
                entry_point: entry.to_string(),
            })
        };

        let create_instance: PfnCreateInstance = unsafe { cast_pfn(required("gfxCreateInstance")?) };
        let enumerate_extensions: PfnEnumerateInstanceExtensionProperties =
            unsafe { cast_pfn(required("gfxEnumerateInstanceExtensionProperties")?) };

        let api_version = global("gfxEnumerateInstanceVersion")
            .and_then(|f| {
                let f: PfnEnumerateInstanceVersion = unsafe { cast_pfn(f) };
                let mut version = 0u32;
                let result = unsafe { f(&mut version) };
                (result == GfxResult::SUCCESS).then_some(version)
            })
            .unwrap_or(record.api_version);

        let extensions = match query_extensions(enumerate_extensions) {
            Some(extensions) => extensions,
            None => {
                warn!("driver {} failed to enumerate extensions, using manifest list", name);
                record.extensions.clone()
            }
        };

        info!(
            "Loaded driver: {} (interface {}, api {})",
            name,
            interface_version,
            version_string(api_version)
        );

        Ok(Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            identity: record.library.clone(),
            record: record.clone(),
            library,
            interface_version,
            gipa,
            gpdpa,
            create_instance,
            api_version,
            extensions,
            physical_devices: Mutex::new(Vec::new()),
        })
    }

    /// Unique per process, used to key handles this driver owns
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn identity(&self) -> &LibraryIdentity {
        &self.identity
    }

    pub fn record(&self) -> &DriverRecord {
        &self.record
    }

    pub fn name(&self) -> &str {
        self.library.name()
    }

    pub fn interface_version(&self) -> u32 {
        self.interface_version
    }

    pub fn api_version(&self) -> u32 {
        self.api_version
    }

    pub fn extensions(&self) -> &[ExtensionDecl] {
        &self.extensions
    }

    pub fn supports_extension(&self, name: &str) -> bool {
        self.extensions.iter().any(|e| e.name == name)
    }

    pub fn get_instance_proc_addr(&self) -> PfnGetInstanceProcAddr {
        self.gipa
    }

    /// Only present from interface version 2
    pub fn get_physical_device_proc_addr(&self) -> Option<PfnGetPhysicalDeviceProcAddr> {
        self.gpdpa
    }

    /// Look up an entry point through the driver's proc-address hook
    pub fn proc_addr(&self, instance: u64, name: &str) -> Option<PfnVoidFunction> {
        let c = CString::new(name).ok()?;
        unsafe { (self.gipa)(Instance::from_raw(instance), c.as_ptr()) }
    }

    /// Physical-device level lookup, `None` when the driver predates it
    pub fn physical_device_proc_addr(&self, instance: u64, name: &str) -> Option<PfnVoidFunction> {
        let gpdpa = self.gpdpa?;
        let c = CString::new(name).ok()?;
        unsafe { gpdpa(Instance::from_raw(instance), c.as_ptr()) }
    }

    /// Create a driver-level instance
    pub fn create_instance(
        &self,
        application_name: Option<&str>,
        api_version: u32,
        extensions: &[String],
        allocator: Allocator,
    ) -> Result<u64, GfxResult> {
        let app_name = application_name.and_then(|n| CString::new(n).ok());
        let app_info = ApplicationInfo {
            p_application_name: app_name.as_ref().map_or(std::ptr::null(), |n| n.as_ptr()),
            api_version,
            ..Default::default()
        };
        let names = CStringArray::new(extensions);
        let info = InstanceCreateInfo {
            p_application_info: &app_info,
            enabled_extension_count: names.len(),
            pp_enabled_extension_names: names.as_ptr(),
            ..Default::default()
        };

        let mut handle = Instance::NULL;
        let result = unsafe { (self.create_instance)(&info, allocator.as_ptr(), &mut handle) };
        if result != GfxResult::SUCCESS {
            return Err(result);
        }
        if handle.is_null() {
            return Err(GfxResult::ERROR_INITIALIZATION_FAILED);
        }
        Ok(handle.as_raw())
    }

    /// Remember a physical device this driver exposes
    pub fn track_physical_device(&self, record: &Arc<PhysicalDeviceRecord>) {
        let mut devices = lock(&self.physical_devices);
        devices.retain(|d| d.strong_count() > 0);
        devices.push(Arc::downgrade(record));
    }

    /// Live physical devices from every instance using this driver
    pub fn physical_devices(&self) -> Vec<Arc<PhysicalDeviceRecord>> {
        lock(&self.physical_devices).iter().filter_map(Weak::upgrade).collect()
    }
}

fn negotiate(library: &Arc<dyn DynamicLibrary>, name: &str) -> Result<u32, DriverLoadError> {
    let Some(negotiate) = library.symbol(DRIVER_NEGOTIATE_SYMBOL) else {
        debug!("driver {} has no negotiation entry point, using interface 0", name);
        return Ok(0);
    };
    // SAFETY: fixed signature from the driver contract
    let negotiate: PfnNegotiateLoaderDriverInterfaceVersion = unsafe { cast_pfn(negotiate) };

    let mut version = CURRENT_DRIVER_INTERFACE_VERSION;
    let result = unsafe { negotiate(&mut version) };
    if result != GfxResult::SUCCESS {
        return Err(DriverLoadError::InterfaceNegotiationFailed {
            library: name.to_string(),
            reason: format!("driver returned {}", result),
        });
    }
    if version > CURRENT_DRIVER_INTERFACE_VERSION {
        return Err(DriverLoadError::InterfaceNegotiationFailed {
            library: name.to_string(),
            reason: format!(
                "driver wants interface {} but loader supports up to {}",
                version, CURRENT_DRIVER_INTERFACE_VERSION
            ),
        });
    }
    Ok(version)
}

fn query_extensions(enumerate: PfnEnumerateInstanceExtensionProperties) -> Option<Vec<ExtensionDecl>> {
    let mut count = 0u32;
    let result = unsafe { enumerate(std::ptr::null(), &mut count, std::ptr::null_mut()) };
    if result != GfxResult::SUCCESS {
        return None;
    }
    let mut props = vec![ExtensionProperties::default(); count as usize];
    let result = unsafe { enumerate(std::ptr::null(), &mut count, props.as_mut_ptr()) };
    if result.is_error() {
        return None;
    }
    props.truncate(count as usize);
    Some(props.iter().map(|p| ExtensionDecl::new(&p.name(), p.spec_version)).collect())
}

#[derive(Default)]
struct SessionSlot {
    library: Mutex<Option<Arc<dyn DynamicLibrary>>>,
    session: OnceLock<Arc<DriverSession>>,
}

/// Process-wide arena of driver sessions keyed by canonical identity.
///
/// The map lock is only held to find the identity's slot. The slot's
/// library lock is held while that one library loads, so each identity is
/// opened exactly once while different drivers load in parallel. No lock
/// is held while calling into the driver; when two threads negotiate the
/// same library at once the first published session wins.
#[derive(Default)]
pub struct SessionCache {
    slots: Mutex<HashMap<LibraryIdentity, Arc<SessionSlot>>>,
}

impl SessionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Session for the record's library, opening it on first use
    pub fn get_or_open(
        &self,
        record: &DriverRecord,
        libraries: &dyn LibraryLoader,
        service: Option<&dyn DiscoveryService>,
    ) -> Result<Arc<DriverSession>, DriverLoadError> {
        let slot = lock(&self.slots).entry(record.library.clone()).or_default().clone();
        if let Some(session) = slot.session.get() {
            return Ok(session.clone());
        }

        let library = {
            let mut loaded = lock(&slot.library);
            match loaded.as_ref() {
                Some(library) => library.clone(),
                None => {
                    let library = DriverSession::load(record, libraries, service)?;
                    *loaded = Some(library.clone());
                    library
                }
            }
        };

        let session = Arc::new(DriverSession::negotiate(record, library)?);
        Ok(slot.session.get_or_init(|| session).clone())
    }

    /// Every session opened so far
    pub fn sessions(&self) -> Vec<Arc<DriverSession>> {
        let slots: Vec<Arc<SessionSlot>> = lock(&self.slots).values().cloned().collect();
        let mut out: Vec<Arc<DriverSession>> = slots.iter().filter_map(|s| s.session.get().cloned()).collect();
        out.sort_by_key(|s| s.id());
        out
    }
}
