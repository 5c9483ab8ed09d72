/*
 *  api.rs
 *
 *  gfx-loader - worth the squeeze
 *  (c) 2020-26 Stuart Hunter
 *
 *  C ABI surface shared with applications, drivers and layers
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

//! FFI types for the graphics API surface
//!
//! Everything here uses `#[repr(C)]` (or `#[repr(transparent)]` newtypes)
//! so the layout matches what drivers and layers compiled against the C
//! headers expect.

use std::ffi::{CStr, CString, c_char, c_void};
use std::fmt;

/// Maximum length of extension names, including the terminator
pub const MAX_EXTENSION_NAME_SIZE: usize = 256;
/// Maximum length of layer/device names and descriptions
pub const MAX_DESCRIPTION_SIZE: usize = 256;
pub const MAX_PHYSICAL_DEVICE_NAME_SIZE: usize = 256;
pub const UUID_SIZE: usize = 16;
pub const LUID_SIZE: usize = 8;
pub const MAX_MEMORY_TYPES: usize = 32;
pub const MAX_MEMORY_HEAPS: usize = 16;

pub type Bool32 = u32;
pub const TRUE: Bool32 = 1;
pub const FALSE: Bool32 = 0;

// ---------------------------------------------------------------------------
// versions
// ---------------------------------------------------------------------------

/// Pack a version using the API layout: variant(3) major(7) minor(10) patch(12)
pub const fn make_api_version(variant: u32, major: u32, minor: u32, patch: u32) -> u32 {
    (variant << 29) | (major << 22) | (minor << 12) | patch
}

pub const fn api_version_variant(version: u32) -> u32 {
    version >> 29
}

pub const fn api_version_major(version: u32) -> u32 {
    (version >> 22) & 0x7f
}

pub const fn api_version_minor(version: u32) -> u32 {
    (version >> 12) & 0x3ff
}

pub const fn api_version_patch(version: u32) -> u32 {
    version & 0xfff
}

/// Drop the patch component, versions are compared at minor granularity
pub const fn api_version_minor_only(version: u32) -> u32 {
    version & !0xfff
}

pub const API_VERSION_1_0: u32 = make_api_version(0, 1, 0, 0);
pub const API_VERSION_1_1: u32 = make_api_version(0, 1, 1, 0);
pub const API_VERSION_1_2: u32 = make_api_version(0, 1, 2, 0);
pub const API_VERSION_1_3: u32 = make_api_version(0, 1, 3, 0);

/// Highest API version this loader understands
pub const LOADER_API_VERSION: u32 = make_api_version(0, 1, 3, 0);

/// Render a packed version as "major.minor.patch"
pub fn version_string(version: u32) -> String {
    format!(
        "{}.{}.{}",
        api_version_major(version),
        api_version_minor(version),
        api_version_patch(version)
    )
}

// ---------------------------------------------------------------------------
// handles
// ---------------------------------------------------------------------------

macro_rules! define_handle {
    ($($(#[$meta:meta])* $name:ident),* $(,)?) => {
        $(
            $(#[$meta])*
            #[repr(transparent)]
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
            pub struct $name(pub u64);

            impl $name {
                pub const NULL: Self = Self(0);

                pub const fn from_raw(raw: u64) -> Self {
                    Self(raw)
                }

                pub const fn as_raw(self) -> u64 {
                    self.0
                }

                pub const fn is_null(self) -> bool {
                    self.0 == 0
                }
            }
        )*
    };
}

define_handle!(
    /// Application-visible instance handle
    Instance,
    PhysicalDevice,
    Device,
    Queue,
    CommandBuffer,
    DisplayKHR,
    DisplayModeKHR,
);

// ---------------------------------------------------------------------------
// result codes
// ---------------------------------------------------------------------------

/// API result code. Negative values are errors.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GfxResult(pub i32);

impl GfxResult {
    pub const SUCCESS: Self = Self(0);
    pub const NOT_READY: Self = Self(1);
    pub const INCOMPLETE: Self = Self(5);
    pub const ERROR_OUT_OF_HOST_MEMORY: Self = Self(-1);
    pub const ERROR_OUT_OF_DEVICE_MEMORY: Self = Self(-2);
    pub const ERROR_INITIALIZATION_FAILED: Self = Self(-3);
    pub const ERROR_LAYER_NOT_PRESENT: Self = Self(-6);
    pub const ERROR_EXTENSION_NOT_PRESENT: Self = Self(-7);
    pub const ERROR_FEATURE_NOT_PRESENT: Self = Self(-8);
    pub const ERROR_INCOMPATIBLE_DRIVER: Self = Self(-9);
    pub const ERROR_UNKNOWN: Self = Self(-13);

    pub fn is_success(self) -> bool {
        self.0 >= 0
    }

    pub fn is_error(self) -> bool {
        self.0 < 0
    }

    /// Symbolic name of the code, as spelled in the API headers
    pub fn name(self) -> &'static str {
        match self {
            Self::SUCCESS => "SUCCESS",
            Self::NOT_READY => "NOT_READY",
            Self::INCOMPLETE => "INCOMPLETE",
            Self::ERROR_OUT_OF_HOST_MEMORY => "ERROR_OUT_OF_HOST_MEMORY",
            Self::ERROR_OUT_OF_DEVICE_MEMORY => "ERROR_OUT_OF_DEVICE_MEMORY",
            Self::ERROR_INITIALIZATION_FAILED => "ERROR_INITIALIZATION_FAILED",
            Self::ERROR_LAYER_NOT_PRESENT => "ERROR_LAYER_NOT_PRESENT",
            Self::ERROR_EXTENSION_NOT_PRESENT => "ERROR_EXTENSION_NOT_PRESENT",
            Self::ERROR_FEATURE_NOT_PRESENT => "ERROR_FEATURE_NOT_PRESENT",
            Self::ERROR_INCOMPATIBLE_DRIVER => "ERROR_INCOMPATIBLE_DRIVER",
            Self::ERROR_UNKNOWN => "ERROR_UNKNOWN",
            _ => "UNRECOGNIZED_RESULT",
        }
    }
}

impl fmt::Display for GfxResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.0)
    }
}

// ---------------------------------------------------------------------------
// enums carried as integers
// ---------------------------------------------------------------------------

#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct StructureType(pub i32);

impl StructureType {
    pub const APPLICATION_INFO: Self = Self(0);
    pub const INSTANCE_CREATE_INFO: Self = Self(1);
    pub const DEVICE_QUEUE_CREATE_INFO: Self = Self(2);
    pub const DEVICE_CREATE_INFO: Self = Self(3);
    pub const COMMAND_BUFFER_ALLOCATE_INFO: Self = Self(40);
    pub const DISPLAY_MODE_CREATE_INFO_KHR: Self = Self(1000002000);
    pub const PHYSICAL_DEVICE_FEATURES_2: Self = Self(1000059000);
    pub const PHYSICAL_DEVICE_PROPERTIES_2: Self = Self(1000059001);
    pub const FORMAT_PROPERTIES_2: Self = Self(1000059002);
    pub const QUEUE_FAMILY_PROPERTIES_2: Self = Self(1000059005);
    pub const PHYSICAL_DEVICE_MEMORY_PROPERTIES_2: Self = Self(1000059006);
    pub const SPARSE_IMAGE_FORMAT_PROPERTIES_2: Self = Self(1000059007);
    pub const PHYSICAL_DEVICE_SPARSE_IMAGE_FORMAT_INFO_2: Self = Self(1000059008);
    pub const PHYSICAL_DEVICE_EXTERNAL_BUFFER_INFO: Self = Self(1000071002);
    pub const EXTERNAL_BUFFER_PROPERTIES: Self = Self(1000071003);
    pub const PHYSICAL_DEVICE_ID_PROPERTIES: Self = Self(1000071004);
    pub const PHYSICAL_DEVICE_EXTERNAL_SEMAPHORE_INFO: Self = Self(1000076000);
    pub const EXTERNAL_SEMAPHORE_PROPERTIES: Self = Self(1000076001);
    pub const PHYSICAL_DEVICE_EXTERNAL_FENCE_INFO: Self = Self(1000112000);
    pub const EXTERNAL_FENCE_PROPERTIES: Self = Self(1000112001);
}

#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PhysicalDeviceType(pub i32);

impl PhysicalDeviceType {
    pub const OTHER: Self = Self(0);
    pub const INTEGRATED_GPU: Self = Self(1);
    pub const DISCRETE_GPU: Self = Self(2);
    pub const VIRTUAL_GPU: Self = Self(3);
    pub const CPU: Self = Self(4);

    pub fn name(self) -> &'static str {
        match self {
            Self::INTEGRATED_GPU => "integrated",
            Self::DISCRETE_GPU => "discrete",
            Self::VIRTUAL_GPU => "virtual",
            Self::CPU => "cpu",
            _ => "other",
        }
    }
}

#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Format(pub i32);

#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ImageType(pub i32);

#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ImageTiling(pub i32);

#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TimeDomainEXT(pub i32);

// ---------------------------------------------------------------------------
// structures
// ---------------------------------------------------------------------------

/// Zeroed value with the correct structure type filled in
macro_rules! impl_zeroed_default {
    ($($name:ident $(= $s_type:expr)?),* $(,)?) => {
        $(
            impl Default for $name {
                fn default() -> Self {
                    // SAFETY: plain-old-data; all-zero is a valid bit pattern
                    // for every field (integers, raw pointers, arrays).
                    #[allow(unused_mut)]
                    let mut value: Self = unsafe { std::mem::zeroed() };
                    $( value.s_type = $s_type; )?
                    value
                }
            }
        )*
    };
}

/// Generic view of any output structure chain
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct BaseOutStructure {
    pub s_type: StructureType,
    pub p_next: *mut BaseOutStructure,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ApplicationInfo {
    pub s_type: StructureType,
    pub p_next: *const c_void,
    pub p_application_name: *const c_char,
    pub application_version: u32,
    pub p_engine_name: *const c_char,
    pub engine_version: u32,
    pub api_version: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct InstanceCreateInfo {
    pub s_type: StructureType,
    pub p_next: *const c_void,
    pub flags: u32,
    pub p_application_info: *const ApplicationInfo,
    pub enabled_layer_count: u32,
    pub pp_enabled_layer_names: *const *const c_char,
    pub enabled_extension_count: u32,
    pub pp_enabled_extension_names: *const *const c_char,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ExtensionProperties {
    pub extension_name: [c_char; MAX_EXTENSION_NAME_SIZE],
    pub spec_version: u32,
}

impl ExtensionProperties {
    pub fn new(name: &str, spec_version: u32) -> Self {
        Self {
            extension_name: to_c_array(name),
            spec_version,
        }
    }

    pub fn name(&self) -> String {
        from_c_array(&self.extension_name)
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct LayerProperties {
    pub layer_name: [c_char; MAX_EXTENSION_NAME_SIZE],
    pub spec_version: u32,
    pub implementation_version: u32,
    pub description: [c_char; MAX_DESCRIPTION_SIZE],
}

impl LayerProperties {
    pub fn name(&self) -> String {
        from_c_array(&self.layer_name)
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct DeviceQueueCreateInfo {
    pub s_type: StructureType,
    pub p_next: *const c_void,
    pub flags: u32,
    pub queue_family_index: u32,
    pub queue_count: u32,
    pub p_queue_priorities: *const f32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct DeviceCreateInfo {
    pub s_type: StructureType,
    pub p_next: *const c_void,
    pub flags: u32,
    pub queue_create_info_count: u32,
    pub p_queue_create_infos: *const DeviceQueueCreateInfo,
    pub enabled_layer_count: u32,
    pub pp_enabled_layer_names: *const *const c_char,
    pub enabled_extension_count: u32,
    pub pp_enabled_extension_names: *const *const c_char,
    pub p_enabled_features: *const PhysicalDeviceFeatures,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct CommandBufferAllocateInfo {
    pub s_type: StructureType,
    pub p_next: *const c_void,
    pub command_pool: u64,
    pub level: u32,
    pub command_buffer_count: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct PhysicalDeviceProperties {
    pub api_version: u32,
    pub driver_version: u32,
    pub vendor_id: u32,
    pub device_id: u32,
    pub device_type: PhysicalDeviceType,
    pub device_name: [c_char; MAX_PHYSICAL_DEVICE_NAME_SIZE],
    pub pipeline_cache_uuid: [u8; UUID_SIZE],
}

impl PhysicalDeviceProperties {
    pub fn name(&self) -> String {
        from_c_array(&self.device_name)
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct PhysicalDeviceProperties2 {
    pub s_type: StructureType,
    pub p_next: *mut c_void,
    pub properties: PhysicalDeviceProperties,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct PhysicalDeviceIdProperties {
    pub s_type: StructureType,
    pub p_next: *mut c_void,
    pub device_uuid: [u8; UUID_SIZE],
    pub driver_uuid: [u8; UUID_SIZE],
    pub device_luid: [u8; LUID_SIZE],
    pub device_node_mask: u32,
    pub device_luid_valid: Bool32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysicalDeviceFeatures {
    pub robust_buffer_access: Bool32,
    pub full_draw_index_uint32: Bool32,
    pub image_cube_array: Bool32,
    pub independent_blend: Bool32,
    pub geometry_shader: Bool32,
    pub tessellation_shader: Bool32,
    pub sample_rate_shading: Bool32,
    pub dual_src_blend: Bool32,
    pub logic_op: Bool32,
    pub multi_draw_indirect: Bool32,
    pub depth_clamp: Bool32,
    pub fill_mode_non_solid: Bool32,
    pub wide_lines: Bool32,
    pub sampler_anisotropy: Bool32,
    pub sparse_binding: Bool32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct PhysicalDeviceFeatures2 {
    pub s_type: StructureType,
    pub p_next: *mut c_void,
    pub features: PhysicalDeviceFeatures,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemoryType {
    pub property_flags: u32,
    pub heap_index: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemoryHeap {
    pub size: u64,
    pub flags: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysicalDeviceMemoryProperties {
    pub memory_type_count: u32,
    pub memory_types: [MemoryType; MAX_MEMORY_TYPES],
    pub memory_heap_count: u32,
    pub memory_heaps: [MemoryHeap; MAX_MEMORY_HEAPS],
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct PhysicalDeviceMemoryProperties2 {
    pub s_type: StructureType,
    pub p_next: *mut c_void,
    pub memory_properties: PhysicalDeviceMemoryProperties,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FormatProperties {
    pub linear_tiling_features: u32,
    pub optimal_tiling_features: u32,
    pub buffer_features: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct FormatProperties2 {
    pub s_type: StructureType,
    pub p_next: *mut c_void,
    pub format_properties: FormatProperties,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Extent2D {
    pub width: u32,
    pub height: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Extent3D {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueFamilyProperties {
    pub queue_flags: u32,
    pub queue_count: u32,
    pub timestamp_valid_bits: u32,
    pub min_image_transfer_granularity: Extent3D,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct QueueFamilyProperties2 {
    pub s_type: StructureType,
    pub p_next: *mut c_void,
    pub queue_family_properties: QueueFamilyProperties,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SparseImageFormatProperties {
    pub aspect_mask: u32,
    pub image_granularity: Extent3D,
    pub flags: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SparseImageFormatProperties2 {
    pub s_type: StructureType,
    pub p_next: *mut c_void,
    pub properties: SparseImageFormatProperties,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct PhysicalDeviceSparseImageFormatInfo2 {
    pub s_type: StructureType,
    pub p_next: *const c_void,
    pub format: Format,
    pub ty: ImageType,
    pub samples: u32,
    pub usage: u32,
    pub tiling: ImageTiling,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExternalMemoryProperties {
    pub external_memory_features: u32,
    pub export_from_imported_handle_types: u32,
    pub compatible_handle_types: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct PhysicalDeviceExternalBufferInfo {
    pub s_type: StructureType,
    pub p_next: *const c_void,
    pub flags: u32,
    pub usage: u32,
    pub handle_type: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ExternalBufferProperties {
    pub s_type: StructureType,
    pub p_next: *mut c_void,
    pub external_memory_properties: ExternalMemoryProperties,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct PhysicalDeviceExternalSemaphoreInfo {
    pub s_type: StructureType,
    pub p_next: *const c_void,
    pub handle_type: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ExternalSemaphoreProperties {
    pub s_type: StructureType,
    pub p_next: *mut c_void,
    pub export_from_imported_handle_types: u32,
    pub compatible_handle_types: u32,
    pub external_semaphore_features: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct PhysicalDeviceExternalFenceInfo {
    pub s_type: StructureType,
    pub p_next: *const c_void,
    pub handle_type: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ExternalFenceProperties {
    pub s_type: StructureType,
    pub p_next: *mut c_void,
    pub export_from_imported_handle_types: u32,
    pub compatible_handle_types: u32,
    pub external_fence_features: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct DisplayPropertiesKHR {
    pub display: DisplayKHR,
    pub display_name: *const c_char,
    pub physical_dimensions: Extent2D,
    pub physical_resolution: Extent2D,
    pub supported_transforms: u32,
    pub plane_reorder_possible: Bool32,
    pub persistent_content: Bool32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DisplayModeParametersKHR {
    pub visible_region: Extent2D,
    pub refresh_rate: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct DisplayModeCreateInfoKHR {
    pub s_type: StructureType,
    pub p_next: *const c_void,
    pub flags: u32,
    pub parameters: DisplayModeParametersKHR,
}

impl_zeroed_default!(
    ApplicationInfo = StructureType::APPLICATION_INFO,
    InstanceCreateInfo = StructureType::INSTANCE_CREATE_INFO,
    DeviceQueueCreateInfo = StructureType::DEVICE_QUEUE_CREATE_INFO,
    DeviceCreateInfo = StructureType::DEVICE_CREATE_INFO,
    CommandBufferAllocateInfo = StructureType::COMMAND_BUFFER_ALLOCATE_INFO,
    PhysicalDeviceProperties2 = StructureType::PHYSICAL_DEVICE_PROPERTIES_2,
    PhysicalDeviceIdProperties = StructureType::PHYSICAL_DEVICE_ID_PROPERTIES,
    PhysicalDeviceFeatures2 = StructureType::PHYSICAL_DEVICE_FEATURES_2,
    PhysicalDeviceMemoryProperties2 = StructureType::PHYSICAL_DEVICE_MEMORY_PROPERTIES_2,
    FormatProperties2 = StructureType::FORMAT_PROPERTIES_2,
    QueueFamilyProperties2 = StructureType::QUEUE_FAMILY_PROPERTIES_2,
    SparseImageFormatProperties2 = StructureType::SPARSE_IMAGE_FORMAT_PROPERTIES_2,
    PhysicalDeviceSparseImageFormatInfo2 = StructureType::PHYSICAL_DEVICE_SPARSE_IMAGE_FORMAT_INFO_2,
    PhysicalDeviceExternalBufferInfo = StructureType::PHYSICAL_DEVICE_EXTERNAL_BUFFER_INFO,
    ExternalBufferProperties = StructureType::EXTERNAL_BUFFER_PROPERTIES,
    PhysicalDeviceExternalSemaphoreInfo = StructureType::PHYSICAL_DEVICE_EXTERNAL_SEMAPHORE_INFO,
    ExternalSemaphoreProperties = StructureType::EXTERNAL_SEMAPHORE_PROPERTIES,
    PhysicalDeviceExternalFenceInfo = StructureType::PHYSICAL_DEVICE_EXTERNAL_FENCE_INFO,
    ExternalFenceProperties = StructureType::EXTERNAL_FENCE_PROPERTIES,
    DisplayModeCreateInfoKHR = StructureType::DISPLAY_MODE_CREATE_INFO_KHR,
    ExtensionProperties,
    LayerProperties,
    PhysicalDeviceProperties,
    PhysicalDeviceFeatures,
    PhysicalDeviceMemoryProperties,
    DisplayPropertiesKHR,
);

// ---------------------------------------------------------------------------
// string helpers
// ---------------------------------------------------------------------------

/// Copy `value` into a fixed, null-terminated C buffer, truncating if needed
pub fn to_c_array<const N: usize>(value: &str) -> [c_char; N] {
    let mut out = [0 as c_char; N];
    let bytes = value.as_bytes();
    let len = bytes.len().min(N.saturating_sub(1));

    for (i, &byte) in bytes.iter().take(len).enumerate() {
        out[i] = byte as c_char;
    }

    out
}

/// Extract a null-terminated string from a C buffer
pub fn from_c_array(buffer: &[c_char]) -> String {
    let len = buffer.iter()
        .position(|&c| c == 0)
        .unwrap_or(buffer.len());

    let bytes: Vec<u8> = buffer[..len]
        .iter()
        .map(|&c| c as u8)
        .collect();

    String::from_utf8_lossy(&bytes).into_owned()
}

/// Read a C string pointer, `None` for null
///
/// # Safety
/// `ptr` must be null or point at a valid null-terminated string.
pub unsafe fn c_str_opt<'a>(ptr: *const c_char) -> Option<&'a str> {
    if ptr.is_null() {
        return None;
    }
    unsafe { CStr::from_ptr(ptr) }.to_str().ok()
}

/// Read `count` C strings from a pointer array
///
/// # Safety
/// `names` must be null (with any count) or point at `count` valid strings.
pub unsafe fn c_str_list(names: *const *const c_char, count: u32) -> Vec<String> {
    if names.is_null() {
        return Vec::new();
    }
    (0..count as usize)
        .filter_map(|i| unsafe { c_str_opt(*names.add(i)) })
        .map(str::to_owned)
        .collect()
}

/// Owned array of C strings with a matching pointer table
#[derive(Debug, Default)]
pub struct CStringArray {
    strings: Vec<CString>,
    pointers: Vec<*const c_char>,
}

impl CStringArray {
    pub fn new<S: AsRef<str>>(items: &[S]) -> Self {
        let strings: Vec<CString> = items
            .iter()
            .filter_map(|s| CString::new(s.as_ref()).ok())
            .collect();
        let pointers = strings.iter().map(|s| s.as_ptr()).collect();
        Self { strings, pointers }
    }

    pub fn len(&self) -> u32 {
        self.strings.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }

    /// Pointer table, null when empty
    pub fn as_ptr(&self) -> *const *const c_char {
        if self.pointers.is_empty() {
            std::ptr::null()
        } else {
            self.pointers.as_ptr()
        }
    }
}

/// Apply the count+array enumeration contract
///
/// With a null `out` the total count is written. Otherwise up to `*count`
/// items are copied and `INCOMPLETE` is returned when they do not all fit.
///
/// # Safety
/// `count` must be valid; `out` must be null or hold `*count` elements.
pub unsafe fn fill_enumeration<T: Copy>(items: &[T], count: *mut u32, out: *mut T) -> GfxResult {
    if count.is_null() {
        return GfxResult::ERROR_INITIALIZATION_FAILED;
    }
    unsafe {
        if out.is_null() {
            *count = items.len() as u32;
            return GfxResult::SUCCESS;
        }
        let room = (*count as usize).min(items.len());
        std::ptr::copy_nonoverlapping(items.as_ptr(), out, room);
        *count = room as u32;
        if room < items.len() {
            GfxResult::INCOMPLETE
        } else {
            GfxResult::SUCCESS
        }
    }
}

/// Application allocation callbacks. The loader never calls them; it only
/// hands the pointer on to the driver that creates or destroys the object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocator(pub *const c_void);

// SAFETY: the pointer is opaque to the loader and never dereferenced
unsafe impl Send for Allocator {}
unsafe impl Sync for Allocator {}

impl Default for Allocator {
    fn default() -> Self {
        Self(std::ptr::null())
    }
}

impl Allocator {
    pub fn as_ptr(self) -> *const c_void {
        self.0
    }
}

// ---------------------------------------------------------------------------
// function pointer types
// ---------------------------------------------------------------------------

/// Untyped function pointer as returned by the proc-address queries
pub type PfnVoidFunction = unsafe extern "C" fn();

/// Reinterpret an untyped function pointer as its real signature
///
/// # Safety
/// `F` must be a function pointer type matching the function's actual ABI.
pub unsafe fn cast_pfn<F: Copy>(pfn: PfnVoidFunction) -> F {
    debug_assert_eq!(std::mem::size_of::<F>(), std::mem::size_of::<PfnVoidFunction>());
    unsafe { std::mem::transmute_copy(&pfn) }
}

/// Erase a typed function pointer
///
/// # Safety
/// `F` must be a function pointer type.
pub unsafe fn erase_pfn<F: Copy>(f: F) -> PfnVoidFunction {
    debug_assert_eq!(std::mem::size_of::<F>(), std::mem::size_of::<PfnVoidFunction>());
    unsafe { std::mem::transmute_copy(&f) }
}

pub type PfnGetInstanceProcAddr =
    unsafe extern "C" fn(Instance, *const c_char) -> Option<PfnVoidFunction>;
pub type PfnGetDeviceProcAddr =
    unsafe extern "C" fn(Device, *const c_char) -> Option<PfnVoidFunction>;
pub type PfnGetPhysicalDeviceProcAddr =
    unsafe extern "C" fn(Instance, *const c_char) -> Option<PfnVoidFunction>;

pub type PfnCreateInstance =
    unsafe extern "C" fn(*const InstanceCreateInfo, *const c_void, *mut Instance) -> GfxResult;
pub type PfnDestroyInstance = unsafe extern "C" fn(Instance, *const c_void);
pub type PfnEnumerateInstanceExtensionProperties =
    unsafe extern "C" fn(*const c_char, *mut u32, *mut ExtensionProperties) -> GfxResult;
pub type PfnEnumerateInstanceLayerProperties =
    unsafe extern "C" fn(*mut u32, *mut LayerProperties) -> GfxResult;
pub type PfnEnumerateInstanceVersion = unsafe extern "C" fn(*mut u32) -> GfxResult;
pub type PfnEnumeratePhysicalDevices =
    unsafe extern "C" fn(Instance, *mut u32, *mut PhysicalDevice) -> GfxResult;

pub type PfnGetPhysicalDeviceProperties =
    unsafe extern "C" fn(PhysicalDevice, *mut PhysicalDeviceProperties);
pub type PfnGetPhysicalDeviceProperties2 =
    unsafe extern "C" fn(PhysicalDevice, *mut PhysicalDeviceProperties2);
pub type PfnGetPhysicalDeviceFeatures =
    unsafe extern "C" fn(PhysicalDevice, *mut PhysicalDeviceFeatures);
pub type PfnGetPhysicalDeviceFeatures2 =
    unsafe extern "C" fn(PhysicalDevice, *mut PhysicalDeviceFeatures2);
pub type PfnGetPhysicalDeviceMemoryProperties =
    unsafe extern "C" fn(PhysicalDevice, *mut PhysicalDeviceMemoryProperties);
pub type PfnGetPhysicalDeviceMemoryProperties2 =
    unsafe extern "C" fn(PhysicalDevice, *mut PhysicalDeviceMemoryProperties2);
pub type PfnGetPhysicalDeviceFormatProperties =
    unsafe extern "C" fn(PhysicalDevice, Format, *mut FormatProperties);
pub type PfnGetPhysicalDeviceFormatProperties2 =
    unsafe extern "C" fn(PhysicalDevice, Format, *mut FormatProperties2);
pub type PfnGetPhysicalDeviceQueueFamilyProperties =
    unsafe extern "C" fn(PhysicalDevice, *mut u32, *mut QueueFamilyProperties);
pub type PfnGetPhysicalDeviceQueueFamilyProperties2 =
    unsafe extern "C" fn(PhysicalDevice, *mut u32, *mut QueueFamilyProperties2);
pub type PfnGetPhysicalDeviceSparseImageFormatProperties = unsafe extern "C" fn(
    PhysicalDevice,
    Format,
    ImageType,
    u32,
    u32,
    ImageTiling,
    *mut u32,
    *mut SparseImageFormatProperties,
);
pub type PfnGetPhysicalDeviceSparseImageFormatProperties2 = unsafe extern "C" fn(
    PhysicalDevice,
    *const PhysicalDeviceSparseImageFormatInfo2,
    *mut u32,
    *mut SparseImageFormatProperties2,
);
pub type PfnGetPhysicalDeviceExternalBufferProperties = unsafe extern "C" fn(
    PhysicalDevice,
    *const PhysicalDeviceExternalBufferInfo,
    *mut ExternalBufferProperties,
);
pub type PfnGetPhysicalDeviceExternalSemaphoreProperties = unsafe extern "C" fn(
    PhysicalDevice,
    *const PhysicalDeviceExternalSemaphoreInfo,
    *mut ExternalSemaphoreProperties,
);
pub type PfnGetPhysicalDeviceExternalFenceProperties = unsafe extern "C" fn(
    PhysicalDevice,
    *const PhysicalDeviceExternalFenceInfo,
    *mut ExternalFenceProperties,
);

pub type PfnEnumerateDeviceExtensionProperties = unsafe extern "C" fn(
    PhysicalDevice,
    *const c_char,
    *mut u32,
    *mut ExtensionProperties,
) -> GfxResult;
pub type PfnCreateDevice = unsafe extern "C" fn(
    PhysicalDevice,
    *const DeviceCreateInfo,
    *const c_void,
    *mut Device,
) -> GfxResult;

pub type PfnGetPhysicalDeviceDisplayPropertiesKHR =
    unsafe extern "C" fn(PhysicalDevice, *mut u32, *mut DisplayPropertiesKHR) -> GfxResult;
pub type PfnCreateDisplayModeKHR = unsafe extern "C" fn(
    PhysicalDevice,
    DisplayKHR,
    *const DisplayModeCreateInfoKHR,
    *const c_void,
    *mut DisplayModeKHR,
) -> GfxResult;
pub type PfnAcquireDrmDisplayEXT =
    unsafe extern "C" fn(PhysicalDevice, i32, DisplayKHR) -> GfxResult;
pub type PfnGetPhysicalDeviceCalibrateableTimeDomainsEXT =
    unsafe extern "C" fn(PhysicalDevice, *mut u32, *mut TimeDomainEXT) -> GfxResult;

pub type PfnDestroyDevice = unsafe extern "C" fn(Device, *const c_void);
pub type PfnGetDeviceQueue = unsafe extern "C" fn(Device, u32, u32, *mut Queue);
pub type PfnQueueWaitIdle = unsafe extern "C" fn(Queue) -> GfxResult;
pub type PfnAllocateCommandBuffers =
    unsafe extern "C" fn(Device, *const CommandBufferAllocateInfo, *mut CommandBuffer) -> GfxResult;
pub type PfnFreeCommandBuffers = unsafe extern "C" fn(Device, u64, u32, *const CommandBuffer);
pub type PfnCmdSetDeviceMask = unsafe extern "C" fn(CommandBuffer, u32);

// ---------------------------------------------------------------------------
// driver interface
// ---------------------------------------------------------------------------

/// Highest driver interface version the loader negotiates
pub const CURRENT_DRIVER_INTERFACE_VERSION: u32 = 3;
/// Drivers must reach this version before `GetPhysicalDeviceProcAddr` is used
pub const MIN_PHYS_DEV_EXTENSION_DRIVER_INTERFACE_VERSION: u32 = 2;

pub const DRIVER_NEGOTIATE_SYMBOL: &str = "gfx_icdNegotiateLoaderICDInterfaceVersion";
pub const DRIVER_GET_INSTANCE_PROC_ADDR_SYMBOL: &str = "gfx_icdGetInstanceProcAddr";
pub const DRIVER_LEGACY_GET_INSTANCE_PROC_ADDR_SYMBOL: &str = "gfxGetInstanceProcAddr";
pub const DRIVER_GET_PHYSICAL_DEVICE_PROC_ADDR_SYMBOL: &str = "gfx_icdGetPhysicalDeviceProcAddr";

pub type PfnNegotiateLoaderDriverInterfaceVersion = unsafe extern "C" fn(*mut u32) -> GfxResult;

// ---------------------------------------------------------------------------
// layer interface
// ---------------------------------------------------------------------------

pub const CURRENT_LAYER_INTERFACE_VERSION: u32 = 2;
pub const LAYER_NEGOTIATE_INTERFACE_STRUCT: u32 = 1;
pub const LAYER_NEGOTIATE_SUFFIX: &str = "NegotiateLoaderLayerInterfaceVersion";

/// Callback the loader hands to layers so they can reach the next stage.
/// `handle` is any dispatchable handle of the calling scope.
pub type PfnGetNextProcAddr =
    unsafe extern "C" fn(u64, *const c_char, *const c_char) -> Option<PfnVoidFunction>;

/// Negotiation block exchanged with a layer
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct LayerNegotiateInterface {
    pub s_type: u32,
    pub p_next: *mut c_void,
    pub loader_layer_interface_version: u32,
    pub pfn_get_instance_proc_addr: Option<PfnGetInstanceProcAddr>,
    pub pfn_get_device_proc_addr: Option<PfnGetDeviceProcAddr>,
    pub pfn_get_physical_device_proc_addr: Option<PfnGetPhysicalDeviceProcAddr>,
    pub pfn_get_next_proc_addr: Option<PfnGetNextProcAddr>,
}

impl Default for LayerNegotiateInterface {
    fn default() -> Self {
        Self {
            s_type: LAYER_NEGOTIATE_INTERFACE_STRUCT,
            p_next: std::ptr::null_mut(),
            loader_layer_interface_version: CURRENT_LAYER_INTERFACE_VERSION,
            pfn_get_instance_proc_addr: None,
            pfn_get_device_proc_addr: None,
            pfn_get_physical_device_proc_addr: None,
            pfn_get_next_proc_addr: None,
        }
    }
}

pub type PfnNegotiateLoaderLayerInterfaceVersion =
    unsafe extern "C" fn(*mut LayerNegotiateInterface) -> GfxResult;

// ---------------------------------------------------------------------------
// extension names
// ---------------------------------------------------------------------------

pub const KHR_GET_PHYSICAL_DEVICE_PROPERTIES_2: &str = "GFX_KHR_get_physical_device_properties2";
pub const KHR_EXTERNAL_MEMORY_CAPABILITIES: &str = "GFX_KHR_external_memory_capabilities";
pub const KHR_EXTERNAL_SEMAPHORE_CAPABILITIES: &str = "GFX_KHR_external_semaphore_capabilities";
pub const KHR_EXTERNAL_FENCE_CAPABILITIES: &str = "GFX_KHR_external_fence_capabilities";
pub const KHR_DISPLAY: &str = "GFX_KHR_display";
pub const EXT_ACQUIRE_DRM_DISPLAY: &str = "GFX_EXT_acquire_drm_display";
pub const EXT_CALIBRATED_TIMESTAMPS: &str = "GFX_EXT_calibrated_timestamps";
pub const KHR_DEVICE_GROUP: &str = "GFX_KHR_device_group";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_packing() {
        let v = make_api_version(0, 1, 2, 197);
        assert_eq!(api_version_variant(v), 0);
        assert_eq!(api_version_major(v), 1);
        assert_eq!(api_version_minor(v), 2);
        assert_eq!(api_version_patch(v), 197);
        assert_eq!(api_version_minor_only(v), API_VERSION_1_2);
        assert_eq!(version_string(v), "1.2.197");
        assert!(API_VERSION_1_0 < API_VERSION_1_1);
    }

    #[test]
    fn test_result_names() {
        assert_eq!(GfxResult::ERROR_INCOMPATIBLE_DRIVER.name(), "ERROR_INCOMPATIBLE_DRIVER");
        assert!(GfxResult::INCOMPLETE.is_success());
        assert!(GfxResult::ERROR_LAYER_NOT_PRESENT.is_error());
        assert_eq!(GfxResult(42).name(), "UNRECOGNIZED_RESULT");
    }

    #[test]
    fn test_c_array_roundtrip_truncates() {
        let arr: [c_char; 8] = to_c_array("GFX_KHR_display");
        assert_eq!(from_c_array(&arr), "GFX_KHR");
        assert_eq!(arr[7], 0);
    }

    #[test]
    fn test_default_sets_structure_type() {
        let props = PhysicalDeviceProperties2::default();
        assert_eq!(props.s_type, StructureType::PHYSICAL_DEVICE_PROPERTIES_2);
        assert!(props.p_next.is_null());
        assert_eq!(props.properties.vendor_id, 0);
    }

    #[test]
    fn test_fill_enumeration_incomplete() {
        let items = [1u32, 2, 3];
        let mut count = 0u32;
        let r = unsafe { fill_enumeration(&items, &mut count, std::ptr::null_mut()) };
        assert_eq!(r, GfxResult::SUCCESS);
        assert_eq!(count, 3);

        let mut out = [0u32; 2];
        count = 2;
        let r = unsafe { fill_enumeration(&items, &mut count, out.as_mut_ptr()) };
        assert_eq!(r, GfxResult::INCOMPLETE);
        assert_eq!(count, 2);
        assert_eq!(out, [1, 2]);
    }

    #[test]
    fn test_c_string_array() {
        let arr = CStringArray::new(&["a", "bb"]);
        assert_eq!(arr.len(), 2);
        let names = unsafe { c_str_list(arr.as_ptr(), arr.len()) };
        assert_eq!(names, vec!["a".to_string(), "bb".to_string()]);
        assert!(CStringArray::new::<&str>(&[]).as_ptr().is_null());
    }
}
