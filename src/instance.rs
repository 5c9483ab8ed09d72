/*
 *  instance.rs
 *
 *  gfx-loader - worth the squeeze
 *  (c) 2020-26 Stuart Hunter
 *
 *  Instance objects - driver instances, device list and dispatch
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

use std::sync::{Arc, OnceLock};
use log::{debug, info, warn};

use crate::api::*;
use crate::config::LoaderSettings;
use crate::dispatch::table::{self, Capability, DispatchTable, Slot, StageTable};
use crate::dispatch::unknown::{UnknownFunctions, MAX_UNKNOWN_FUNCTIONS};
use crate::driver::DriverSession;
use crate::error::{fail_fast, LoaderError};
use crate::extension::{self, VisibilityContext};
use crate::handle::{registry, HandleKind, HandleTarget};
use crate::layer::LayerChain;
use crate::physical_device::{self, PhysicalDeviceProbe, PhysicalDeviceRecord};

/// What the application asked for when creating an instance
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceRequest {
    pub application_name: Option<String>,
    /// Zero means 1.0
    pub api_version: u32,
    pub layers: Vec<String>,
    pub extensions: Vec<String>,
    /// Passed to each driver's instance create and destroy
    pub allocator: Allocator,
}

impl InstanceRequest {
    pub fn new(api_version: u32) -> Self {
        Self { api_version, ..Default::default() }
    }

    pub fn layer(mut self, name: &str) -> Self {
        self.layers.push(name.to_string());
        self
    }

    pub fn extension(mut self, name: &str) -> Self {
        self.extensions.push(name.to_string());
        self
    }

    /// Read a request out of the C create-info block
    ///
    /// # Safety
    /// `info` must be null or point at a valid create-info structure.
    pub unsafe fn from_create_info(info: *const InstanceCreateInfo) -> Self {
        let Some(info) = (unsafe { info.as_ref() }) else {
            return Self::default();
        };
        let app = unsafe { info.p_application_info.as_ref() };
        unsafe {
            Self {
                application_name: app
                    .and_then(|a| c_str_opt(a.p_application_name))
                    .map(str::to_owned),
                api_version: app.map_or(0, |a| a.api_version),
                layers: c_str_list(info.pp_enabled_layer_names, info.enabled_layer_count),
                extensions: c_str_list(info.pp_enabled_extension_names, info.enabled_extension_count),
                allocator: Allocator::default(),
            }
        }
    }

    /// Version the instance will run at
    pub fn negotiated_version(&self) -> u32 {
        let requested = if self.api_version == 0 { API_VERSION_1_0 } else { self.api_version };
        extension::min_version(requested, LOADER_API_VERSION)
    }
}

/// A driver's own instance inside one loader instance
pub struct DriverInstance {
    session: Arc<DriverSession>,
    handle: u64,
    api_version: u32,
    extensions: Vec<String>,
    table: StageTable,
    gdpa: Option<PfnGetDeviceProcAddr>,
    phys_dev_ext: [OnceLock<Option<PfnVoidFunction>>; MAX_UNKNOWN_FUNCTIONS],
}

impl DriverInstance {
    fn create(session: &Arc<DriverSession>, request: &InstanceRequest, api_version: u32) -> Result<Self, GfxResult> {
        let driver_version = extension::min_version(api_version, session.api_version());

        let mut extensions: Vec<String> = request
            .extensions
            .iter()
            .filter(|e| session.supports_extension(e))
            .cloned()
            .collect();
        // a pre-1.1 driver only provides the promoted queries when asked
        if extension::version_at_least(api_version, API_VERSION_1_1)
            && !extension::version_at_least(session.api_version(), API_VERSION_1_1)
        {
            for ext in session.extensions() {
                if extension::is_promoted_to_1_1(&ext.name) && !extensions.contains(&ext.name) {
                    debug!("enabling {} on driver {}", ext.name, session.name());
                    extensions.push(ext.name.clone());
                }
            }
        }

        let handle = session.create_instance(
            request.application_name.as_deref(),
            driver_version,
            &extensions,
            request.allocator,
        )?;

        let table = table::resolve_stage(
            |e| {
                e.scope.is_instance_level()
                    && match e.capability {
                        Capability::Always => true,
                        Capability::Core(v) => extension::version_at_least(session.api_version(), v),
                        Capability::InstanceExtension(ext) => extensions.iter().any(|x| x == ext),
                        Capability::DeviceExtension(_) => true,
                    }
            },
            |name| session.proc_addr(handle, name),
        );
        let gdpa = session
            .proc_addr(handle, "gfxGetDeviceProcAddr")
            .map(|f| unsafe { cast_pfn::<PfnGetDeviceProcAddr>(f) });

        Ok(Self {
            session: session.clone(),
            handle,
            api_version: driver_version,
            extensions,
            table,
            gdpa,
            phys_dev_ext: std::array::from_fn(|_| OnceLock::new()),
        })
    }

    pub fn session(&self) -> &Arc<DriverSession> {
        &self.session
    }

    pub fn name(&self) -> &str {
        self.session.name()
    }

    /// The driver's instance handle
    pub fn handle(&self) -> u64 {
        self.handle
    }

    pub fn api_version(&self) -> u32 {
        self.api_version
    }

    pub fn extensions(&self) -> &[String] {
        &self.extensions
    }

    /// The driver's implementation for a slot, if it has one
    ///
    /// # Safety
    /// `F` must be the signature of `slot`.
    pub unsafe fn function<F: Copy>(&self, slot: Slot) -> Option<F> {
        self.table[slot.index()].map(|f| unsafe { cast_pfn::<F>(f) })
    }

    pub fn device_proc_addr(&self, device: u64, name: &str) -> Option<PfnVoidFunction> {
        match self.gdpa {
            Some(gdpa) => {
                let c = std::ffi::CString::new(name).ok()?;
                unsafe { gdpa(Device::from_raw(device), c.as_ptr()) }
            }
            None => self.session.proc_addr(self.handle, name),
        }
    }

    pub fn get_device_proc_addr(&self) -> Option<PfnGetDeviceProcAddr> {
        self.gdpa
    }

    /// Cached physical-device level lookup for an unknown function
    pub(crate) fn phys_dev_ext(&self, index: usize, name: &str) -> Option<PfnVoidFunction> {
        *self.phys_dev_ext.get(index)?.get_or_init(|| {
            self.session
                .physical_device_proc_addr(self.handle, name)
                .or_else(|| self.session.proc_addr(self.handle, name))
        })
    }

    fn destroy(&self, allocator: Allocator) {
        match unsafe { self.function::<PfnDestroyInstance>(Slot::DestroyInstance) } {
            Some(destroy) => unsafe { destroy(Instance::from_raw(self.handle), allocator.as_ptr()) },
            None => warn!("driver {} has no gfxDestroyInstance", self.name()),
        }
    }
}

/// A loader instance
pub struct InstanceObject {
    handle: u64,
    api_version: u32,
    enabled_extensions: Vec<String>,
    chain: LayerChain,
    drivers: Vec<Arc<DriverInstance>>,
    physical_devices: Vec<Arc<PhysicalDeviceRecord>>,
    dispatch: OnceLock<DispatchTable>,
    unknown: UnknownFunctions,
}

impl std::fmt::Debug for InstanceObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceObject")
            .field("handle", &self.handle)
            .field("api_version", &self.api_version)
            .field("enabled_extensions", &self.enabled_extensions)
            .finish_non_exhaustive()
    }
}

impl InstanceObject {
    pub fn handle(&self) -> u64 {
        self.handle
    }

    pub fn api_version(&self) -> u32 {
        self.api_version
    }

    pub fn enabled_extensions(&self) -> &[String] {
        &self.enabled_extensions
    }

    pub fn is_extension_enabled(&self, name: &str) -> bool {
        self.enabled_extensions.iter().any(|e| e == name)
    }

    pub fn chain(&self) -> &LayerChain {
        &self.chain
    }

    pub fn drivers(&self) -> &[Arc<DriverInstance>] {
        &self.drivers
    }

    /// In enumeration order
    pub fn physical_devices(&self) -> &[Arc<PhysicalDeviceRecord>] {
        &self.physical_devices
    }

    pub fn physical_device_handles(&self) -> Vec<PhysicalDevice> {
        self.physical_devices.iter().map(|p| PhysicalDevice::from_raw(p.handle())).collect()
    }

    pub(crate) fn unknown(&self) -> &UnknownFunctions {
        &self.unknown
    }

    pub fn dispatch(&self) -> &DispatchTable {
        self.dispatch.get().unwrap_or_else(|| {
            fail_fast(&format!("GfxInstance 0x{:x} used before creation finished", self.handle))
        })
    }

    /// Next stage after `layer` for an instance-level function
    pub fn next_proc_addr(&self, layer: &str, name: &str) -> Option<PfnVoidFunction> {
        let position = self.chain.position(layer)?;
        if let Some(entry) = table::lookup(name).filter(|e| e.scope.is_instance_level()) {
            return self.dispatch.get()?.next_after(position, entry.slot);
        }
        self.unknown.phys_dev_next_after(name, position)
    }

    /// Destroy every driver instance
    pub(crate) fn destroy_drivers(&self, allocator: Allocator) {
        for driver in &self.drivers {
            debug!("destroying driver instance 0x{:x} in {}", driver.handle(), driver.name());
            driver.destroy(allocator);
        }
    }

    /// Remove this instance and its physical devices from the registry
    pub(crate) fn retire(&self) {
        for device in &self.physical_devices {
            registry().retire(device.handle());
        }
        registry().retire(self.handle);
        info!("destroyed instance 0x{:x}", self.handle);
    }
}

impl VisibilityContext for InstanceObject {
    fn api_version(&self) -> u32 {
        self.api_version
    }

    fn instance_extension_enabled(&self, name: &str) -> bool {
        self.is_extension_enabled(name)
    }

    fn instance_extension_available(&self, name: &str) -> bool {
        self.drivers.iter().any(|d| d.session().supports_extension(name))
            || self.chain.declares_instance_extension(name)
    }

    fn device_extension_available(&self, name: &str) -> bool {
        self.physical_devices.iter().any(|p| p.supports_extension(name))
            || self.chain.declares_device_extension(name)
    }
}

/// Validate the request, create every driver instance and aggregate the
/// physical devices behind a new loader instance
pub(crate) fn create(
    request: &InstanceRequest,
    sessions: &[Arc<DriverSession>],
    chain: LayerChain,
    settings: &LoaderSettings,
) -> Result<Arc<InstanceObject>, LoaderError> {
    let api_version = request.negotiated_version();

    for ext in &request.extensions {
        let available = extension::is_emulated(ext)
            || sessions.iter().any(|s| s.supports_extension(ext))
            || chain.declares_instance_extension(ext);
        if !available {
            warn!("instance extension {} is not supported", ext);
            return Err(LoaderError::ExtensionNotPresent(ext.clone()));
        }
    }

    let mut drivers = Vec::new();
    let mut out_of_memory = false;
    for session in sessions {
        match DriverInstance::create(session, request, api_version) {
            Ok(driver) => drivers.push(Arc::new(driver)),
            Err(result) => {
                warn!("driver {} failed instance creation: {}", session.name(), result);
                out_of_memory |= result == GfxResult::ERROR_OUT_OF_HOST_MEMORY;
            }
        }
    }
    if drivers.is_empty() {
        // a single driver's refusal says nothing about the others
        return Err(if out_of_memory {
            LoaderError::Driver { call: "gfxCreateInstance", result: GfxResult::ERROR_OUT_OF_HOST_MEMORY }
        } else {
            LoaderError::IncompatibleDriver
        });
    }

    let probes: Vec<(Arc<DriverInstance>, Vec<PhysicalDeviceProbe>)> = drivers
        .iter()
        .map(|d| (d.clone(), physical_device::probe_driver(d)))
        .collect();

    let handle = registry().issue();
    let instance = Arc::new_cyclic(|weak| {
        let mut physical_devices: Vec<Arc<PhysicalDeviceRecord>> = probes
            .into_iter()
            .flat_map(|(driver, found)| {
                let weak = weak.clone();
                found.into_iter().map(move |probe| {
                    Arc::new(PhysicalDeviceRecord::new(registry().issue(), weak.clone(), &driver, probe))
                })
            })
            .collect();
        if !settings.disable_device_sort {
            physical_device::sort_devices(&mut physical_devices, settings.device_select);
        }

        InstanceObject {
            handle,
            api_version,
            enabled_extensions: request.extensions.clone(),
            chain,
            drivers,
            physical_devices,
            dispatch: OnceLock::new(),
            unknown: UnknownFunctions::default(),
        }
    });

    registry().insert_issued(handle, HandleKind::Instance, handle, handle, HandleTarget::Instance(instance.clone()));
    for device in &instance.physical_devices {
        registry().insert_issued(
            device.handle(),
            HandleKind::PhysicalDevice,
            device.driver_handle(),
            handle,
            HandleTarget::PhysicalDevice(device.clone()),
        );
        if let Some(session) = device.session() {
            session.track_physical_device(device);
        }
    }

    let layers: Vec<StageTable> = instance
        .chain
        .layers()
        .iter()
        .map(|layer| {
            table::resolve_stage(|e| e.scope.is_instance_level(), |name| layer.instance_proc_addr(handle, name))
        })
        .collect();
    let terminators = table::terminator_stage(|e| e.scope.is_instance_level());
    // set exactly once, right here
    let _ = instance.dispatch.set(DispatchTable::new(layers, terminators));

    info!(
        "created instance 0x{:x}: api {}, {} driver(s), {} layer(s), {} physical device(s)",
        handle,
        version_string(api_version),
        instance.drivers.len(),
        instance.chain.len(),
        instance.physical_devices.len()
    );
    Ok(instance)
}
