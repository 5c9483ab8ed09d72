/*
 *  gfx-loader Null Driver - Driver Implementation
 *
 *  Instances, one CPU physical device, devices and queues that do nothing
 */

use std::ffi::{c_char, c_void, CStr};
use std::panic::{catch_unwind, AssertUnwindSafe};

use crate::ffi::*;

const DEVICE_NAME: &str = "gfx null device (CPU)";
const VENDOR_ID: u32 = 0x10005;
const DEVICE_ID: u32 = 0x0001;
const QUEUE_FAMILY_COUNT: u32 = 1;
const HEAP_SIZE: u64 = 256 * 1024 * 1024;

/// Internal physical device state
struct NullGpu {
    _marker: u8,
}

/// Internal instance state, owned by the loader through its handle
struct NullInstance {
    /// keeps the device handle distinct from the instance handle
    _header: u64,
    gpu: NullGpu,
}

struct NullDevice {
    queue: u8,
}

struct NullCommandBuffer {
    _device_mask: u32,
}

fn erase<F: Copy>(f: F) -> PfnVoidFunction {
    debug_assert_eq!(std::mem::size_of::<F>(), std::mem::size_of::<PfnVoidFunction>());
    // SAFETY: only called with extern "C" function pointers
    unsafe { std::mem::transmute_copy(&f) }
}

unsafe fn name_of<'a>(name: *const c_char) -> Option<&'a [u8]> {
    if name.is_null() {
        return None;
    }
    Some(unsafe { CStr::from_ptr(name) }.to_bytes())
}

/// Guard against unwinding across the C boundary
fn guarded<T>(fallback: T, f: impl FnOnce() -> T) -> T {
    catch_unwind(AssertUnwindSafe(f)).unwrap_or(fallback)
}

// ---------------------------------------------------------------------------
// driver interface
// ---------------------------------------------------------------------------

#[no_mangle]
pub unsafe extern "C" fn gfx_icdNegotiateLoaderICDInterfaceVersion(version: *mut u32) -> GfxResult {
    if version.is_null() {
        return GfxResult::ERROR_INITIALIZATION_FAILED;
    }
    unsafe { *version = (*version).min(DRIVER_INTERFACE_VERSION) };
    GfxResult::SUCCESS
}

#[no_mangle]
pub unsafe extern "C" fn gfx_icdGetInstanceProcAddr(
    _instance: Handle,
    name: *const c_char,
) -> Option<PfnVoidFunction> {
    let name = unsafe { name_of(name) }?;
    let f = match name {
        b"gfxCreateInstance" => erase(create_instance as unsafe extern "C" fn(_, _, _) -> _),
        b"gfxEnumerateInstanceExtensionProperties" => {
            erase(enumerate_instance_extension_properties as unsafe extern "C" fn(_, _, _) -> _)
        }
        b"gfxEnumerateInstanceVersion" => erase(enumerate_instance_version as unsafe extern "C" fn(_) -> _),
        b"gfxDestroyInstance" => erase(destroy_instance as unsafe extern "C" fn(_, _)),
        b"gfxEnumeratePhysicalDevices" => erase(enumerate_physical_devices as unsafe extern "C" fn(_, _, _) -> _),
        b"gfxGetPhysicalDeviceProperties" => erase(get_physical_device_properties as unsafe extern "C" fn(_, _)),
        b"gfxGetPhysicalDeviceFeatures" => erase(get_physical_device_features as unsafe extern "C" fn(_, _)),
        b"gfxGetPhysicalDeviceMemoryProperties" => {
            erase(get_physical_device_memory_properties as unsafe extern "C" fn(_, _))
        }
        b"gfxGetPhysicalDeviceFormatProperties" => {
            erase(get_physical_device_format_properties as unsafe extern "C" fn(_, _, _))
        }
        b"gfxGetPhysicalDeviceQueueFamilyProperties" => {
            erase(get_physical_device_queue_family_properties as unsafe extern "C" fn(_, _, _))
        }
        b"gfxEnumerateDeviceExtensionProperties" => {
            erase(enumerate_device_extension_properties as unsafe extern "C" fn(_, _, _, _) -> _)
        }
        b"gfxCreateDevice" => erase(create_device as unsafe extern "C" fn(_, _, _, _) -> _),
        _ => return device_function(name),
    };
    Some(f)
}

/// The null device exposes no physical-device extension commands
#[no_mangle]
pub unsafe extern "C" fn gfx_icdGetPhysicalDeviceProcAddr(
    _instance: Handle,
    _name: *const c_char,
) -> Option<PfnVoidFunction> {
    None
}

fn device_function(name: &[u8]) -> Option<PfnVoidFunction> {
    let f = match name {
        b"gfxGetDeviceProcAddr" => erase(get_device_proc_addr as unsafe extern "C" fn(_, _) -> _),
        b"gfxDestroyDevice" => erase(destroy_device as unsafe extern "C" fn(_, _)),
        b"gfxGetDeviceQueue" => erase(get_device_queue as unsafe extern "C" fn(_, _, _, _)),
        b"gfxQueueWaitIdle" => erase(queue_wait_idle as unsafe extern "C" fn(_) -> _),
        b"gfxAllocateCommandBuffers" => erase(allocate_command_buffers as unsafe extern "C" fn(_, _, _) -> _),
        b"gfxFreeCommandBuffers" => erase(free_command_buffers as unsafe extern "C" fn(_, _, _, _)),
        _ => return None,
    };
    Some(f)
}

// ---------------------------------------------------------------------------
// global and instance commands
// ---------------------------------------------------------------------------

unsafe extern "C" fn create_instance(
    info: *const InstanceCreateInfo,
    _allocator: *const c_void,
    instance: *mut Handle,
) -> GfxResult {
    if info.is_null() || instance.is_null() {
        return GfxResult::ERROR_INITIALIZATION_FAILED;
    }
    if unsafe { (*info).enabled_extension_count } > 0 {
        return GfxResult::ERROR_EXTENSION_NOT_PRESENT;
    }

    guarded(GfxResult::ERROR_OUT_OF_HOST_MEMORY, || {
        let object = Box::new(NullInstance { _header: 0, gpu: NullGpu { _marker: 0 } });
        unsafe { *instance = Box::into_raw(object) as Handle };
        GfxResult::SUCCESS
    })
}

unsafe extern "C" fn enumerate_instance_extension_properties(
    layer_name: *const c_char,
    count: *mut u32,
    _properties: *mut ExtensionProperties,
) -> GfxResult {
    if !layer_name.is_null() {
        return GfxResult::ERROR_LAYER_NOT_PRESENT;
    }
    if count.is_null() {
        return GfxResult::ERROR_INITIALIZATION_FAILED;
    }
    unsafe { *count = 0 };
    GfxResult::SUCCESS
}

unsafe extern "C" fn enumerate_instance_version(version: *mut u32) -> GfxResult {
    if version.is_null() {
        return GfxResult::ERROR_INITIALIZATION_FAILED;
    }
    unsafe { *version = API_VERSION_1_0 };
    GfxResult::SUCCESS
}

unsafe extern "C" fn destroy_instance(instance: Handle, _allocator: *const c_void) {
    if instance != 0 {
        drop(unsafe { Box::from_raw(instance as *mut NullInstance) });
    }
}

unsafe extern "C" fn enumerate_physical_devices(instance: Handle, count: *mut u32, devices: *mut Handle) -> GfxResult {
    if instance == 0 || count.is_null() {
        return GfxResult::ERROR_INITIALIZATION_FAILED;
    }
    let object = unsafe { &*(instance as *const NullInstance) };
    if devices.is_null() {
        unsafe { *count = 1 };
        return GfxResult::SUCCESS;
    }
    if unsafe { *count } < 1 {
        return GfxResult::INCOMPLETE;
    }
    unsafe {
        *devices = &object.gpu as *const NullGpu as Handle;
        *count = 1;
    }
    GfxResult::SUCCESS
}

// ---------------------------------------------------------------------------
// physical device queries
// ---------------------------------------------------------------------------

unsafe extern "C" fn get_physical_device_properties(_gpu: Handle, properties: *mut PhysicalDeviceProperties) {
    let Some(p) = (unsafe { properties.as_mut() }) else {
        return;
    };
    p.api_version = API_VERSION_1_0;
    p.driver_version = 1;
    p.vendor_id = VENDOR_ID;
    p.device_id = DEVICE_ID;
    p.device_type = PHYSICAL_DEVICE_TYPE_CPU;
    fill_c_array(&mut p.device_name, DEVICE_NAME);
    p.pipeline_cache_uuid = *b"gfx-null-device\0";
}

unsafe extern "C" fn get_physical_device_features(_gpu: Handle, features: *mut PhysicalDeviceFeatures) {
    if let Some(f) = unsafe { features.as_mut() } {
        f.flags = [0; 15];
    }
}

unsafe extern "C" fn get_physical_device_memory_properties(_gpu: Handle, memory: *mut PhysicalDeviceMemoryProperties) {
    let Some(m) = (unsafe { memory.as_mut() }) else {
        return;
    };
    m.memory_type_count = 1;
    m.memory_types = [MemoryType::default(); MAX_MEMORY_TYPES];
    m.memory_types[0] = MemoryType {
        property_flags: MEMORY_PROPERTY_HOST_VISIBLE_BIT | MEMORY_PROPERTY_HOST_COHERENT_BIT,
        heap_index: 0,
    };
    m.memory_heap_count = 1;
    m.memory_heaps = [MemoryHeap::default(); MAX_MEMORY_HEAPS];
    m.memory_heaps[0] = MemoryHeap { size: HEAP_SIZE, flags: MEMORY_HEAP_DEVICE_LOCAL_BIT };
}

unsafe extern "C" fn get_physical_device_format_properties(_gpu: Handle, _format: i32, properties: *mut FormatProperties) {
    if let Some(p) = unsafe { properties.as_mut() } {
        p.linear_tiling_features = 0;
        p.optimal_tiling_features = 0;
        p.buffer_features = 0;
    }
}

unsafe extern "C" fn get_physical_device_queue_family_properties(
    _gpu: Handle,
    count: *mut u32,
    properties: *mut QueueFamilyProperties,
) {
    if count.is_null() {
        return;
    }
    if properties.is_null() {
        unsafe { *count = QUEUE_FAMILY_COUNT };
        return;
    }
    if unsafe { *count } == 0 {
        return;
    }
    unsafe {
        *properties = QueueFamilyProperties {
            queue_flags: QUEUE_GRAPHICS_BIT | QUEUE_COMPUTE_BIT | QUEUE_TRANSFER_BIT,
            queue_count: 1,
            timestamp_valid_bits: 64,
            min_image_transfer_granularity: Extent3D { width: 1, height: 1, depth: 1 },
        };
        *count = QUEUE_FAMILY_COUNT;
    }
}

unsafe extern "C" fn enumerate_device_extension_properties(
    _gpu: Handle,
    layer_name: *const c_char,
    count: *mut u32,
    _properties: *mut ExtensionProperties,
) -> GfxResult {
    if !layer_name.is_null() {
        return GfxResult::ERROR_LAYER_NOT_PRESENT;
    }
    if count.is_null() {
        return GfxResult::ERROR_INITIALIZATION_FAILED;
    }
    unsafe { *count = 0 };
    GfxResult::SUCCESS
}

unsafe extern "C" fn create_device(
    _gpu: Handle,
    info: *const DeviceCreateInfo,
    _allocator: *const c_void,
    device: *mut Handle,
) -> GfxResult {
    if info.is_null() || device.is_null() {
        return GfxResult::ERROR_INITIALIZATION_FAILED;
    }
    if unsafe { (*info).enabled_extension_count } > 0 {
        return GfxResult::ERROR_EXTENSION_NOT_PRESENT;
    }
    guarded(GfxResult::ERROR_OUT_OF_HOST_MEMORY, || {
        unsafe { *device = Box::into_raw(Box::new(NullDevice { queue: 0 })) as Handle };
        GfxResult::SUCCESS
    })
}

// ---------------------------------------------------------------------------
// device commands
// ---------------------------------------------------------------------------

unsafe extern "C" fn get_device_proc_addr(_device: Handle, name: *const c_char) -> Option<PfnVoidFunction> {
    device_function(unsafe { name_of(name) }?)
}

unsafe extern "C" fn destroy_device(device: Handle, _allocator: *const c_void) {
    if device != 0 {
        drop(unsafe { Box::from_raw(device as *mut NullDevice) });
    }
}

unsafe extern "C" fn get_device_queue(device: Handle, family: u32, index: u32, queue: *mut Handle) {
    if device == 0 || queue.is_null() {
        return;
    }
    let object = unsafe { &*(device as *const NullDevice) };
    let handle = if family == 0 && index == 0 { &object.queue as *const u8 as Handle } else { 0 };
    unsafe { *queue = handle };
}

unsafe extern "C" fn queue_wait_idle(_queue: Handle) -> GfxResult {
    GfxResult::SUCCESS
}

unsafe extern "C" fn allocate_command_buffers(
    _device: Handle,
    info: *const CommandBufferAllocateInfo,
    buffers: *mut Handle,
) -> GfxResult {
    let Some(info) = (unsafe { info.as_ref() }) else {
        return GfxResult::ERROR_INITIALIZATION_FAILED;
    };
    if buffers.is_null() && info.command_buffer_count > 0 {
        return GfxResult::ERROR_INITIALIZATION_FAILED;
    }
    for i in 0..info.command_buffer_count as usize {
        let buffer = Box::into_raw(Box::new(NullCommandBuffer { _device_mask: 1 })) as Handle;
        unsafe { *buffers.add(i) = buffer };
    }
    GfxResult::SUCCESS
}

unsafe extern "C" fn free_command_buffers(_device: Handle, _pool: u64, count: u32, buffers: *const Handle) {
    if buffers.is_null() {
        return;
    }
    for i in 0..count as usize {
        let buffer = unsafe { *buffers.add(i) };
        if buffer != 0 {
            drop(unsafe { Box::from_raw(buffer as *mut NullCommandBuffer) });
        }
    }
}
