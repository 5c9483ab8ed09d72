/*
 *  tests/common/mod.rs
 *
 *  gfx-loader - worth the squeeze
 *  (c) 2020-26 Stuart Hunter
 *
 *  Shared integration-test fixtures: fake drivers and layers built from
 *  extern "C" functions, an in-memory library loader, a capturing logger
 *  and a manifest sandbox
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

#![allow(dead_code)]

use std::collections::HashMap;
use std::ffi::{c_char, c_void, CStr, CString};
use std::fs;
use std::path::Path;
use std::process::Command;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Once, OnceLock};

use gfx_loader::api::*;
use gfx_loader::config::{LoaderSettings, MapEnvironment, SearchRoots};
use gfx_loader::dispatch::trampoline as gfx;
use gfx_loader::instance::InstanceObject;
use gfx_loader::{DynamicLibrary, LibraryIdentity, LibraryKind, LibraryLoader, Loader};

// ---------------------------------------------------------------------------
// capturing logger
// ---------------------------------------------------------------------------

pub struct Capture {
    lines: Mutex<Vec<String>>,
}

impl log::Log for Capture {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        let line = format!("{} {}", record.level(), record.args());
        self.lines.lock().unwrap_or_else(|e| e.into_inner()).push(line);
    }

    fn flush(&self) {}
}

impl Capture {
    /// Lines containing every needle
    pub fn matching(&self, needles: &[&str]) -> Vec<String> {
        self.lines
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|l| needles.iter().all(|n| l.contains(n)))
            .cloned()
            .collect()
    }
}

static CAPTURE: Capture = Capture { lines: Mutex::new(Vec::new()) };
static INSTALL: Once = Once::new();

/// Install the capturing logger for this test binary
pub fn logs() -> &'static Capture {
    INSTALL.call_once(|| {
        if log::set_logger(&CAPTURE).is_ok() {
            log::set_max_level(log::LevelFilter::Trace);
        }
    });
    &CAPTURE
}

// ---------------------------------------------------------------------------
// fake drivers
// ---------------------------------------------------------------------------

pub struct FakeDriverSpec {
    pub library: &'static str,
    pub interface_version: u32,
    pub api_version: u32,
    pub vendor_id: u32,
    pub device_ids: &'static [u32],
    pub device_type: PhysicalDeviceType,
    /// Exports gfxGetPhysicalDeviceProperties2 itself
    pub native_properties2: bool,
    pub instance_extensions: &'static [&'static str],
    pub device_extensions: &'static [&'static str],
}

pub const MODERN: usize = 0;
pub const LEGACY: usize = 1;
pub const TRIPLE: usize = 2;
pub const DISPLAY: usize = 3;

pub static DRIVERS: [FakeDriverSpec; 4] = [
    FakeDriverSpec {
        library: "libfake_modern.so",
        interface_version: 3,
        api_version: API_VERSION_1_1,
        vendor_id: 0x1af4,
        device_ids: &[0x1050, 0x1051],
        device_type: PhysicalDeviceType::DISCRETE_GPU,
        native_properties2: true,
        instance_extensions: &[KHR_GET_PHYSICAL_DEVICE_PROPERTIES_2],
        device_extensions: &["GFX_FAKE_twiddle"],
    },
    FakeDriverSpec {
        library: "libfake_legacy.so",
        interface_version: 1,
        api_version: API_VERSION_1_0,
        vendor_id: 0x8086,
        device_ids: &[0x0a00],
        device_type: PhysicalDeviceType::INTEGRATED_GPU,
        native_properties2: false,
        instance_extensions: &[],
        device_extensions: &[],
    },
    FakeDriverSpec {
        library: "libfake_triple.so",
        interface_version: 3,
        api_version: API_VERSION_1_1,
        vendor_id: 0x10de,
        device_ids: &[0x2000, 0x2001, 0x2002],
        device_type: PhysicalDeviceType::VIRTUAL_GPU,
        native_properties2: true,
        instance_extensions: &[],
        device_extensions: &[],
    },
    FakeDriverSpec {
        library: "libfake_display.so",
        interface_version: 3,
        api_version: API_VERSION_1_1,
        vendor_id: 0x1002,
        device_ids: &[0x7300],
        device_type: PhysicalDeviceType::DISCRETE_GPU,
        native_properties2: true,
        instance_extensions: &[KHR_DISPLAY, EXT_ACQUIRE_DRM_DISPLAY],
        device_extensions: &[],
    },
];

/// Physical-device command the loader has never heard of
pub const FAKE_PHYS_DEV_FUNCTION: &str = "gfxFakeMeasurePhysicalDeviceEXT";
/// Physical-device command mixing float and stack-passed arguments
pub const FAKE_WEIGH_FUNCTION: &str = "gfxFakeWeighPhysicalDeviceEXT";
/// Device command the loader has never heard of
pub const FAKE_DEVICE_FUNCTION: &str = "gfxFakeTwiddleDeviceEXT";
/// Queue command the loader has never heard of
pub const FAKE_QUEUE_FUNCTION: &str = "gfxFakeTagQueueEXT";

pub type PfnFakeMeasure = unsafe extern "C" fn(u64, usize, usize) -> usize;
pub type PfnFakeTwiddle = unsafe extern "C" fn(u64, usize) -> usize;
pub type PfnFakeWeigh = unsafe extern "C" fn(u64, f32, u64, u64, u64, u64, u64, u64, u64, u64) -> f64;

pub struct FakeGpu {
    pub driver: usize,
    pub device_id: u32,
    pub properties2_calls: AtomicU32,
}

struct FakeInstance {
    driver: usize,
    gpus: Vec<FakeGpu>,
}

pub struct FakeQueue {
    pub waits: AtomicU32,
}

pub struct FakeDevice {
    pub serial: u64,
    pub queue: FakeQueue,
}

pub struct FakeCommandBuffer {
    pub device_mask: AtomicU32,
}

static NEXT_DEVICE_SERIAL: AtomicU64 = AtomicU64::new(1);

/// Every non-null allocator a fake driver was handed, with the call
static ALLOCATORS_SEEN: Mutex<Vec<(usize, &'static str)>> = Mutex::new(Vec::new());

fn note_allocator(allocator: *const c_void, call: &'static str) {
    if !allocator.is_null() {
        ALLOCATORS_SEEN.lock().unwrap().push((allocator as usize, call));
    }
}

/// Driver calls that received `allocator`, in order
pub fn allocator_calls(allocator: *const c_void) -> Vec<&'static str> {
    ALLOCATORS_SEEN
        .lock()
        .unwrap()
        .iter()
        .filter(|(seen, _)| *seen == allocator as usize)
        .map(|(_, call)| *call)
        .collect()
}

fn erase<F: Copy>(f: F) -> PfnVoidFunction {
    unsafe { erase_pfn(f) }
}

unsafe fn name_of<'a>(name: *const c_char) -> Option<&'a str> {
    if name.is_null() {
        return None;
    }
    unsafe { CStr::from_ptr(name) }.to_str().ok()
}

/// The fake GPU behind a driver-side physical-device handle
pub fn gpu(driver_handle: u64) -> &'static FakeGpu {
    unsafe { &*(driver_handle as *const FakeGpu) }
}

pub fn queue(driver_handle: u64) -> &'static FakeQueue {
    unsafe { &*(driver_handle as *const FakeQueue) }
}

pub fn command_buffer(driver_handle: u64) -> &'static FakeCommandBuffer {
    unsafe { &*(driver_handle as *const FakeCommandBuffer) }
}

unsafe extern "C" fn negotiate<const D: usize>(version: *mut u32) -> GfxResult {
    unsafe { *version = (*version).min(DRIVERS[D].interface_version) };
    GfxResult::SUCCESS
}

unsafe extern "C" fn driver_gipa<const D: usize>(_instance: Instance, name: *const c_char) -> Option<PfnVoidFunction> {
    let name = unsafe { name_of(name) }?;
    let spec = &DRIVERS[D];
    Some(match name {
        "gfxCreateInstance" => erase::<PfnCreateInstance>(create_instance::<D>),
        "gfxEnumerateInstanceExtensionProperties" => {
            erase::<PfnEnumerateInstanceExtensionProperties>(enumerate_instance_extensions::<D>)
        }
        "gfxEnumerateInstanceVersion" => erase::<PfnEnumerateInstanceVersion>(enumerate_instance_version::<D>),
        "gfxDestroyInstance" => erase::<PfnDestroyInstance>(destroy_instance),
        "gfxEnumeratePhysicalDevices" => erase::<PfnEnumeratePhysicalDevices>(driver_enumerate_physical_devices),
        "gfxGetPhysicalDeviceProperties" => erase::<PfnGetPhysicalDeviceProperties>(get_properties),
        "gfxGetPhysicalDeviceProperties2" if spec.native_properties2 => {
            erase::<PfnGetPhysicalDeviceProperties2>(get_properties2)
        }
        "gfxGetPhysicalDeviceFeatures" => erase::<PfnGetPhysicalDeviceFeatures>(get_features),
        "gfxGetPhysicalDeviceQueueFamilyProperties" => {
            erase::<PfnGetPhysicalDeviceQueueFamilyProperties>(get_queue_families)
        }
        "gfxEnumerateDeviceExtensionProperties" => {
            erase::<PfnEnumerateDeviceExtensionProperties>(enumerate_device_extensions)
        }
        "gfxCreateDevice" => erase::<PfnCreateDevice>(driver_create_device),
        "gfxGetPhysicalDeviceDisplayPropertiesKHR" if spec.instance_extensions.contains(&KHR_DISPLAY) => {
            erase::<PfnGetPhysicalDeviceDisplayPropertiesKHR>(get_display_properties)
        }
        FAKE_PHYS_DEV_FUNCTION => erase::<PfnFakeMeasure>(fake_measure),
        FAKE_WEIGH_FUNCTION => erase::<PfnFakeWeigh>(fake_weigh),
        other => return device_function(other),
    })
}

unsafe extern "C" fn driver_gpdpa<const D: usize>(_instance: Instance, name: *const c_char) -> Option<PfnVoidFunction> {
    match unsafe { name_of(name) }? {
        FAKE_PHYS_DEV_FUNCTION => Some(erase::<PfnFakeMeasure>(fake_measure)),
        FAKE_WEIGH_FUNCTION => Some(erase::<PfnFakeWeigh>(fake_weigh)),
        _ => None,
    }
}

unsafe extern "C" fn driver_gdpa(_device: Device, name: *const c_char) -> Option<PfnVoidFunction> {
    device_function(unsafe { name_of(name) }?)
}

fn device_function(name: &str) -> Option<PfnVoidFunction> {
    Some(match name {
        "gfxGetDeviceProcAddr" => erase::<PfnGetDeviceProcAddr>(driver_gdpa),
        "gfxDestroyDevice" => erase::<PfnDestroyDevice>(destroy_device),
        "gfxGetDeviceQueue" => erase::<PfnGetDeviceQueue>(get_device_queue),
        "gfxQueueWaitIdle" => erase::<PfnQueueWaitIdle>(queue_wait_idle),
        "gfxAllocateCommandBuffers" => erase::<PfnAllocateCommandBuffers>(allocate_command_buffers),
        "gfxFreeCommandBuffers" => erase::<PfnFreeCommandBuffers>(free_command_buffers),
        "gfxCmdSetDeviceMask" => erase::<PfnCmdSetDeviceMask>(cmd_set_device_mask),
        FAKE_DEVICE_FUNCTION => erase::<PfnFakeTwiddle>(fake_twiddle),
        FAKE_QUEUE_FUNCTION => erase::<PfnFakeTwiddle>(fake_tag_queue),
        _ => return None,
    })
}

/// Application name every fake driver refuses to create an instance for
pub const REFUSED_APPLICATION: &str = "refused-by-drivers";

unsafe extern "C" fn create_instance<const D: usize>(
    info: *const InstanceCreateInfo,
    allocator: *const c_void,
    instance: *mut Instance,
) -> GfxResult {
    note_allocator(allocator, "gfxCreateInstance");
    let app = unsafe { (*info).p_application_info };
    if !app.is_null() && unsafe { name_of((*app).p_application_name) } == Some(REFUSED_APPLICATION) {
        return GfxResult::ERROR_INITIALIZATION_FAILED;
    }
    let spec = &DRIVERS[D];
    let object = Box::new(FakeInstance {
        driver: D,
        gpus: spec
            .device_ids
            .iter()
            .map(|&device_id| FakeGpu { driver: D, device_id, properties2_calls: AtomicU32::new(0) })
            .collect(),
    });
    unsafe { *instance = Instance::from_raw(Box::into_raw(object) as u64) };
    GfxResult::SUCCESS
}

unsafe extern "C" fn enumerate_instance_extensions<const D: usize>(
    _layer: *const c_char,
    count: *mut u32,
    properties: *mut ExtensionProperties,
) -> GfxResult {
    let exts: Vec<ExtensionProperties> =
        DRIVERS[D].instance_extensions.iter().map(|e| ExtensionProperties::new(e, 1)).collect();
    unsafe { fill_enumeration(&exts, count, properties) }
}

unsafe extern "C" fn enumerate_instance_version<const D: usize>(version: *mut u32) -> GfxResult {
    unsafe { *version = DRIVERS[D].api_version };
    GfxResult::SUCCESS
}

unsafe extern "C" fn destroy_instance(instance: Instance, allocator: *const c_void) {
    note_allocator(allocator, "gfxDestroyInstance");
    if !instance.is_null() {
        drop(unsafe { Box::from_raw(instance.as_raw() as *mut FakeInstance) });
    }
}

unsafe extern "C" fn driver_enumerate_physical_devices(
    instance: Instance,
    count: *mut u32,
    devices: *mut PhysicalDevice,
) -> GfxResult {
    let object = unsafe { &*(instance.as_raw() as *const FakeInstance) };
    let handles: Vec<PhysicalDevice> = object
        .gpus
        .iter()
        .map(|g| PhysicalDevice::from_raw(g as *const FakeGpu as u64))
        .collect();
    unsafe { fill_enumeration(&handles, count, devices) }
}

unsafe extern "C" fn get_properties(physical_device: PhysicalDevice, properties: *mut PhysicalDeviceProperties) {
    let gpu = gpu(physical_device.as_raw());
    let spec = &DRIVERS[gpu.driver];
    let p = unsafe { &mut *properties };
    p.api_version = spec.api_version;
    p.driver_version = 42;
    p.vendor_id = spec.vendor_id;
    p.device_id = gpu.device_id;
    p.device_type = spec.device_type;
    p.device_name = to_c_array(&format!("fake {:04x}", gpu.device_id));
    p.pipeline_cache_uuid = [gpu.device_id as u8; UUID_SIZE];
}

unsafe extern "C" fn get_properties2(physical_device: PhysicalDevice, properties: *mut PhysicalDeviceProperties2) {
    gpu(physical_device.as_raw()).properties2_calls.fetch_add(1, Ordering::SeqCst);
    unsafe { get_properties(physical_device, &mut (*properties).properties) };
}

unsafe extern "C" fn get_features(_physical_device: PhysicalDevice, features: *mut PhysicalDeviceFeatures) {
    let f = unsafe { &mut *features };
    *f = PhysicalDeviceFeatures::default();
    f.geometry_shader = TRUE;
    f.sampler_anisotropy = TRUE;
}

unsafe extern "C" fn get_queue_families(
    _physical_device: PhysicalDevice,
    count: *mut u32,
    properties: *mut QueueFamilyProperties,
) {
    let families = [
        QueueFamilyProperties { queue_flags: 0x7, queue_count: 2, timestamp_valid_bits: 64, ..Default::default() },
        QueueFamilyProperties { queue_flags: 0x4, queue_count: 1, timestamp_valid_bits: 0, ..Default::default() },
    ];
    unsafe { fill_enumeration(&families, count, properties) };
}

unsafe extern "C" fn enumerate_device_extensions(
    physical_device: PhysicalDevice,
    _layer: *const c_char,
    count: *mut u32,
    properties: *mut ExtensionProperties,
) -> GfxResult {
    let spec = &DRIVERS[gpu(physical_device.as_raw()).driver];
    let exts: Vec<ExtensionProperties> =
        spec.device_extensions.iter().map(|e| ExtensionProperties::new(e, 1)).collect();
    unsafe { fill_enumeration(&exts, count, properties) }
}

unsafe extern "C" fn driver_create_device(
    _physical_device: PhysicalDevice,
    _info: *const DeviceCreateInfo,
    allocator: *const c_void,
    device: *mut Device,
) -> GfxResult {
    note_allocator(allocator, "gfxCreateDevice");
    let object = Box::new(FakeDevice {
        serial: NEXT_DEVICE_SERIAL.fetch_add(1, Ordering::Relaxed),
        queue: FakeQueue { waits: AtomicU32::new(0) },
    });
    unsafe { *device = Device::from_raw(Box::into_raw(object) as u64) };
    GfxResult::SUCCESS
}

unsafe extern "C" fn get_display_properties(
    _physical_device: PhysicalDevice,
    count: *mut u32,
    _properties: *mut DisplayPropertiesKHR,
) -> GfxResult {
    unsafe { *count = 1 };
    GfxResult::SUCCESS
}

unsafe extern "C" fn destroy_device(device: Device, allocator: *const c_void) {
    note_allocator(allocator, "gfxDestroyDevice");
    if !device.is_null() {
        drop(unsafe { Box::from_raw(device.as_raw() as *mut FakeDevice) });
    }
}

unsafe extern "C" fn get_device_queue(device: Device, _family: u32, _index: u32, queue: *mut Queue) {
    let object = unsafe { &*(device.as_raw() as *const FakeDevice) };
    unsafe { *queue = Queue::from_raw(&object.queue as *const FakeQueue as u64) };
}

unsafe extern "C" fn queue_wait_idle(queue: Queue) -> GfxResult {
    self::queue(queue.as_raw()).waits.fetch_add(1, Ordering::SeqCst);
    GfxResult::SUCCESS
}

unsafe extern "C" fn allocate_command_buffers(
    _device: Device,
    info: *const CommandBufferAllocateInfo,
    buffers: *mut CommandBuffer,
) -> GfxResult {
    let count = unsafe { (*info).command_buffer_count } as usize;
    for i in 0..count {
        let object = Box::new(FakeCommandBuffer { device_mask: AtomicU32::new(0) });
        unsafe { *buffers.add(i) = CommandBuffer::from_raw(Box::into_raw(object) as u64) };
    }
    GfxResult::SUCCESS
}

unsafe extern "C" fn free_command_buffers(_device: Device, _pool: u64, count: u32, buffers: *const CommandBuffer) {
    for i in 0..count as usize {
        let buffer = unsafe { *buffers.add(i) };
        if !buffer.is_null() {
            drop(unsafe { Box::from_raw(buffer.as_raw() as *mut FakeCommandBuffer) });
        }
    }
}

unsafe extern "C" fn cmd_set_device_mask(command_buffer: CommandBuffer, mask: u32) {
    self::command_buffer(command_buffer.as_raw()).device_mask.store(mask, Ordering::SeqCst);
}

/// Driver-private physical-device query
pub unsafe extern "C" fn fake_measure(physical_device: u64, a: usize, b: usize) -> usize {
    gpu(physical_device).device_id as usize * 1_000_000 + a * 1000 + b
}

/// Driver-private query taking a float and more integers than fit in
/// registers; each integer lands in its own decimal digit
#[allow(clippy::too_many_arguments)]
pub unsafe extern "C" fn fake_weigh(
    physical_device: u64,
    scale: f32,
    a: u64,
    b: u64,
    c: u64,
    d: u64,
    e: u64,
    f: u64,
    g: u64,
    h: u64,
) -> f64 {
    let digits = [a, b, c, d, e, f, g, h].iter().fold(0u64, |acc, x| acc * 10 + x % 10);
    gpu(physical_device).device_id as f64 * scale as f64 + digits as f64 / 1e8
}

/// Driver-private device command
pub unsafe extern "C" fn fake_twiddle(device: u64, x: usize) -> usize {
    let object = unsafe { &*(device as *const FakeDevice) };
    (x ^ 0xff) + object.serial as usize * 0x10000
}

/// Driver-private queue command
pub unsafe extern "C" fn fake_tag_queue(queue: u64, x: usize) -> usize {
    x * 3 + self::queue(queue).waits.load(Ordering::SeqCst) as usize
}

fn driver_symbols<const D: usize>() -> HashMap<String, PfnVoidFunction> {
    let mut symbols = HashMap::new();
    symbols.insert(
        DRIVER_NEGOTIATE_SYMBOL.to_string(),
        erase::<PfnNegotiateLoaderDriverInterfaceVersion>(negotiate::<D>),
    );
    symbols.insert(DRIVER_GET_INSTANCE_PROC_ADDR_SYMBOL.to_string(), erase::<PfnGetInstanceProcAddr>(driver_gipa::<D>));
    symbols.insert(
        DRIVER_GET_PHYSICAL_DEVICE_PROC_ADDR_SYMBOL.to_string(),
        erase::<PfnGetPhysicalDeviceProcAddr>(driver_gpdpa::<D>),
    );
    symbols
}

// ---------------------------------------------------------------------------
// fake layers
// ---------------------------------------------------------------------------

pub const COUNTER_LAYER: &str = "GFX_LAYER_fake_counter";
pub const WRAP_LAYER: &str = "GFX_LAYER_fake_wrap";

/// Calls seen by the counting layer's properties interception
pub static COUNTER_LAYER_CALLS: AtomicU64 = AtomicU64::new(0);
/// Queue waits seen by the wrapping layer, with the handle it was given
pub static WRAP_LAYER_WAITS: AtomicU64 = AtomicU64::new(0);
pub static WRAP_LAYER_LAST_QUEUE: AtomicU64 = AtomicU64::new(0);

static NEXT_PROC_ADDR: OnceLock<PfnGetNextProcAddr> = OnceLock::new();

unsafe fn next<F: Copy>(handle: u64, layer: &str, name: &str) -> F {
    let (Some(&get_next), Ok(layer), Ok(name)) = (NEXT_PROC_ADDR.get(), CString::new(layer), CString::new(name)) else {
        panic!("layer {} was never negotiated", layer);
    };
    let f = unsafe { get_next(handle, layer.as_ptr(), name.as_ptr()) }
        .unwrap_or_else(|| panic!("no stage after {} for {}", layer.to_string_lossy(), name.to_string_lossy()));
    unsafe { cast_pfn(f) }
}

unsafe extern "C" fn layer_negotiate<const L: usize>(interface: *mut LayerNegotiateInterface) -> GfxResult {
    let interface = unsafe { &mut *interface };
    if let Some(next) = interface.pfn_get_next_proc_addr {
        let _ = NEXT_PROC_ADDR.set(next);
    }
    interface.loader_layer_interface_version = interface.loader_layer_interface_version.min(2);
    match L {
        0 => interface.pfn_get_instance_proc_addr = Some(counter_gipa),
        _ => {
            interface.pfn_get_instance_proc_addr = Some(wrap_gipa);
            interface.pfn_get_device_proc_addr = Some(wrap_gdpa);
        }
    }
    GfxResult::SUCCESS
}

unsafe extern "C" fn counter_gipa(_instance: Instance, name: *const c_char) -> Option<PfnVoidFunction> {
    match unsafe { name_of(name) }? {
        "gfxGetPhysicalDeviceProperties" => Some(erase::<PfnGetPhysicalDeviceProperties>(counter_get_properties)),
        _ => None,
    }
}

unsafe extern "C" fn counter_get_properties(physical_device: PhysicalDevice, properties: *mut PhysicalDeviceProperties) {
    COUNTER_LAYER_CALLS.fetch_add(1, Ordering::SeqCst);
    let down: PfnGetPhysicalDeviceProperties =
        unsafe { next(physical_device.as_raw(), COUNTER_LAYER, "gfxGetPhysicalDeviceProperties") };
    unsafe { down(physical_device, properties) };
}

unsafe extern "C" fn wrap_gipa(_instance: Instance, _name: *const c_char) -> Option<PfnVoidFunction> {
    None
}

unsafe extern "C" fn wrap_gdpa(_device: Device, name: *const c_char) -> Option<PfnVoidFunction> {
    match unsafe { name_of(name) }? {
        "gfxQueueWaitIdle" => Some(erase::<PfnQueueWaitIdle>(wrap_queue_wait_idle)),
        _ => None,
    }
}

unsafe extern "C" fn wrap_queue_wait_idle(queue: Queue) -> GfxResult {
    WRAP_LAYER_WAITS.fetch_add(1, Ordering::SeqCst);
    WRAP_LAYER_LAST_QUEUE.store(queue.as_raw(), Ordering::SeqCst);
    let down: PfnQueueWaitIdle = unsafe { next(queue.as_raw(), WRAP_LAYER, "gfxQueueWaitIdle") };
    unsafe { down(queue) }
}

fn layer_symbols<const L: usize>() -> HashMap<String, PfnVoidFunction> {
    let mut symbols = HashMap::new();
    symbols.insert(
        format!("gfx{}", LAYER_NEGOTIATE_SUFFIX),
        erase::<PfnNegotiateLoaderLayerInterfaceVersion>(layer_negotiate::<L>),
    );
    symbols
}

// ---------------------------------------------------------------------------
// in-memory library loader
// ---------------------------------------------------------------------------

struct FakeLibrary {
    name: String,
    symbols: HashMap<String, PfnVoidFunction>,
}

impl DynamicLibrary for FakeLibrary {
    fn symbol(&self, name: &str) -> Option<PfnVoidFunction> {
        self.symbols.get(name).copied()
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Serves the fake drivers and layers by file name. Library names are
/// prefixed with a per-test tag so log lines can be told apart.
#[derive(Clone)]
pub struct FakeLibraries {
    tag: String,
    opens: Arc<Mutex<HashMap<String, usize>>>,
}

impl FakeLibraries {
    pub fn new(tag: &str) -> Self {
        Self { tag: tag.to_string(), opens: Arc::default() }
    }

    /// Name the loader will report for a fake library
    pub fn library_name(&self, file: &str) -> String {
        format!("{}:{}", self.tag, file)
    }

    pub fn opens(&self, file: &str) -> usize {
        self.opens.lock().unwrap().get(file).copied().unwrap_or(0)
    }
}

fn file_name(identity: &LibraryIdentity) -> String {
    match identity {
        LibraryIdentity::Path(p) => p.file_name().map(|f| f.to_string_lossy().into_owned()).unwrap_or_default(),
        LibraryIdentity::Name(n) | LibraryIdentity::Service(n) => n.clone(),
    }
}

impl LibraryLoader for FakeLibraries {
    fn open(&self, identity: &LibraryIdentity, _kind: LibraryKind) -> Result<Arc<dyn DynamicLibrary>, String> {
        let file = file_name(identity);
        *self.opens.lock().unwrap().entry(file.clone()).or_default() += 1;
        let symbols = match file.as_str() {
            "libfake_modern.so" => driver_symbols::<MODERN>(),
            "libfake_legacy.so" => driver_symbols::<LEGACY>(),
            "libfake_triple.so" => driver_symbols::<TRIPLE>(),
            "libfake_display.so" => driver_symbols::<DISPLAY>(),
            "libfake_counter_layer.so" => layer_symbols::<0>(),
            "libfake_wrap_layer.so" => layer_symbols::<1>(),
            _ => return Err(format!("{}: cannot open shared object file", file)),
        };
        Ok(Arc::new(FakeLibrary { name: self.library_name(&file), symbols }))
    }
}

// ---------------------------------------------------------------------------
// manifest sandbox
// ---------------------------------------------------------------------------

pub struct Sandbox {
    pub dir: tempfile::TempDir,
}

fn write(path: &Path, text: &str) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, text).unwrap();
}

impl Sandbox {
    pub fn new() -> Self {
        Self { dir: tempfile::tempdir().unwrap() }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Driver manifest for one of the fake drivers
    pub fn driver(&self, driver: usize) -> &Self {
        self.driver_library(DRIVERS[driver].library)
    }

    pub fn driver_library(&self, library: &str) -> &Self {
        let stem = library.trim_end_matches(".so");
        write(
            &self.root().join(format!("etc/gfx/icd.d/{}.json", stem)),
            &format!(
                r#"{{"file_format_version": "1.0.0", "ICD": {{"library_path": "{}", "api_version": "1.1.0"}}}}"#,
                library
            ),
        );
        self
    }

    fn layer(&self, dir: &str, name: &str, library: &str, extra: &str) -> &Self {
        write(
            &self.root().join(format!("etc/gfx/{}/{}.json", dir, name)),
            &format!(
                r#"{{"file_format_version": "1.0.0", "layer": {{"name": "{}", "type": "GLOBAL", "library_path": "{}", "api_version": "1.1.0", "implementation_version": "1", "description": "test layer"{}}}}}"#,
                name, library, extra
            ),
        );
        self
    }

    pub fn explicit_layer(&self, name: &str, library: &str, extra: &str) -> &Self {
        self.layer("explicit_layer.d", name, library, extra)
    }

    pub fn implicit_layer(&self, name: &str, library: &str, extra: &str) -> &Self {
        self.layer("implicit_layer.d", name, library, extra)
    }

    pub fn settings(&self) -> LoaderSettings {
        LoaderSettings {
            search_roots: SearchRoots {
                config_home: None,
                config_dirs: vec![],
                sysconf_dir: self.root().join("etc"),
                data_home: None,
                data_dirs: vec![],
            },
            ..Default::default()
        }
    }

    pub fn loader(&self, libraries: &FakeLibraries) -> Loader {
        self.loader_with(libraries, MapEnvironment::new(), self.settings())
    }

    pub fn loader_with(&self, libraries: &FakeLibraries, env: MapEnvironment, settings: LoaderSettings) -> Loader {
        Loader::builder()
            .environment(env)
            .library_loader(libraries.clone())
            .settings(settings)
            .build()
    }
}

// ---------------------------------------------------------------------------
// calling through the exported entry points
// ---------------------------------------------------------------------------

pub fn instance_handle(instance: &InstanceObject) -> Instance {
    Instance::from_raw(instance.handle())
}

pub fn enumerate_physical_devices(instance: Instance) -> Vec<PhysicalDevice> {
    let mut count = 0u32;
    assert_eq!(
        unsafe { gfx::enumerate_physical_devices(instance, &mut count, std::ptr::null_mut()) },
        GfxResult::SUCCESS
    );
    let mut devices = vec![PhysicalDevice::NULL; count as usize];
    assert_eq!(
        unsafe { gfx::enumerate_physical_devices(instance, &mut count, devices.as_mut_ptr()) },
        GfxResult::SUCCESS
    );
    devices.truncate(count as usize);
    devices
}

pub fn properties(physical_device: PhysicalDevice) -> PhysicalDeviceProperties {
    let mut properties = PhysicalDeviceProperties::default();
    unsafe { gfx::get_physical_device_properties(physical_device, &mut properties) };
    properties
}

pub fn instance_proc_addr(instance: Instance, name: &str) -> Option<PfnVoidFunction> {
    let name = CString::new(name).unwrap();
    unsafe { gfx::get_instance_proc_addr(instance, name.as_ptr()) }
}

pub fn device_proc_addr(device: Device, name: &str) -> Option<PfnVoidFunction> {
    let name = CString::new(name).unwrap();
    unsafe { gfx::get_device_proc_addr(device, name.as_ptr()) }
}

pub fn create_device(physical_device: PhysicalDevice, extensions: &[&str]) -> Result<Device, GfxResult> {
    let names = CStringArray::new(extensions);
    let queue_priority = 1.0f32;
    let queue_info = DeviceQueueCreateInfo {
        queue_family_index: 0,
        queue_count: 1,
        p_queue_priorities: &queue_priority,
        ..Default::default()
    };
    let info = DeviceCreateInfo {
        queue_create_info_count: 1,
        p_queue_create_infos: &queue_info,
        enabled_extension_count: names.len(),
        pp_enabled_extension_names: names.as_ptr(),
        ..Default::default()
    };
    let mut device = Device::NULL;
    match unsafe { gfx::create_device(physical_device, &info, std::ptr::null(), &mut device) } {
        GfxResult::SUCCESS => Ok(device),
        other => Err(other),
    }
}

// ---------------------------------------------------------------------------
// abort checks
// ---------------------------------------------------------------------------

const DEATH_VAR: &str = "GFX_LOADER_DEATH_TEST";

/// True inside the re-executed child of [`expect_abort`]
pub fn in_abort_child() -> bool {
    std::env::var_os(DEATH_VAR).is_some()
}

/// Re-run one test of this binary in a child process and assert it died
/// with `message` on stderr
pub fn expect_abort(test_name: &str, message: &str) {
    let exe = std::env::current_exe().unwrap();
    let output = Command::new(exe)
        .args([test_name, "--exact", "--nocapture", "--test-threads=1"])
        .env(DEATH_VAR, "1")
        .output()
        .unwrap();
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(!output.status.success(), "{} survived; stderr:\n{}", test_name, stderr);
    assert!(stderr.contains(message), "{} died without \"{}\"; stderr:\n{}", test_name, message, stderr);
}
