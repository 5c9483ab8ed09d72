/*
 *  dispatch/table.rs
 *
 *  gfx-loader - worth the squeeze
 *  (c) 2020-26 Stuart Hunter
 *
 *  Static entry-point table and per-object dispatch tables
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

//! Entry-point table
//!
//! Every function the loader knows by name has one [`EntryPoint`]: the
//! slot it dispatches through, the scope of its first argument, the
//! capability gating it, and the loader's trampoline and terminator.
//! Promoted aliases (`...KHR`) share the slot of their core name.
//!
//! A [`DispatchTable`] is a flat array of stages built once when its
//! object is created: stage 0 is the outermost layer, the last stage holds
//! the terminators. Calls jump straight to the first stage that fills the
//! slot; layers reach later stages through `get_next_proc_addr`.

use std::collections::HashMap;
use std::sync::LazyLock;

use crate::api::*;
use super::{terminator, trampoline};

macro_rules! slots {
    ($($name:ident),* $(,)?) => {
        /// Dispatch slot, shared by a core name and its aliases
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Slot {
            $($name),*
        }

        impl Slot {
            pub const ALL: &'static [Slot] = &[$(Slot::$name),*];
            pub const COUNT: usize = Self::ALL.len();

            pub fn index(self) -> usize {
                self as usize
            }
        }
    };
}

slots!(
    DestroyInstance,
    EnumeratePhysicalDevices,
    GetPhysicalDeviceProperties,
    GetPhysicalDeviceProperties2,
    GetPhysicalDeviceFeatures,
    GetPhysicalDeviceFeatures2,
    GetPhysicalDeviceMemoryProperties,
    GetPhysicalDeviceMemoryProperties2,
    GetPhysicalDeviceFormatProperties,
    GetPhysicalDeviceFormatProperties2,
    GetPhysicalDeviceQueueFamilyProperties,
    GetPhysicalDeviceQueueFamilyProperties2,
    GetPhysicalDeviceSparseImageFormatProperties,
    GetPhysicalDeviceSparseImageFormatProperties2,
    GetPhysicalDeviceExternalBufferProperties,
    GetPhysicalDeviceExternalSemaphoreProperties,
    GetPhysicalDeviceExternalFenceProperties,
    EnumerateDeviceExtensionProperties,
    CreateDevice,
    GetPhysicalDeviceDisplayPropertiesKHR,
    CreateDisplayModeKHR,
    AcquireDrmDisplayEXT,
    GetPhysicalDeviceCalibrateableTimeDomainsEXT,
    DestroyDevice,
    GetDeviceQueue,
    QueueWaitIdle,
    AllocateCommandBuffers,
    FreeCommandBuffers,
    CmdSetDeviceMask,
);

/// Object type of an entry point's first argument
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Global,
    Instance,
    PhysicalDevice,
    Device,
    Queue,
    CommandBuffer,
}

impl Scope {
    pub fn is_instance_level(self) -> bool {
        matches!(self, Scope::Instance | Scope::PhysicalDevice)
    }

    pub fn is_device_level(self) -> bool {
        matches!(self, Scope::Device | Scope::Queue | Scope::CommandBuffer)
    }
}

/// What must hold for an entry point to be visible
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Always,
    /// Core since this API version
    Core(u32),
    InstanceExtension(&'static str),
    DeviceExtension(&'static str),
}

pub struct EntryPoint {
    pub name: &'static str,
    pub slot: Slot,
    pub scope: Scope,
    pub capability: Capability,
    pub trampoline: PfnVoidFunction,
    pub terminator: PfnVoidFunction,
}

impl std::fmt::Debug for EntryPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryPoint")
            .field("name", &self.name)
            .field("slot", &self.slot)
            .field("scope", &self.scope)
            .field("capability", &self.capability)
            .finish()
    }
}

fn entry<F: Copy>(
    name: &'static str,
    slot: Slot,
    scope: Scope,
    capability: Capability,
    trampoline: F,
    terminator: F,
) -> EntryPoint {
    // SAFETY: F is always one of the api Pfn types
    let (trampoline, terminator) = unsafe { (erase_pfn(trampoline), erase_pfn(terminator)) };
    EntryPoint { name, slot, scope, capability, trampoline, terminator }
}

const V1_0: Capability = Capability::Core(API_VERSION_1_0);
const V1_1: Capability = Capability::Core(API_VERSION_1_1);

static ENTRIES: LazyLock<Vec<EntryPoint>> = LazyLock::new(|| {
    use Capability::{DeviceExtension as DevExt, InstanceExtension as InstExt};
    use Scope::{CommandBuffer as Cmd, Device as Dev, Instance as Inst, PhysicalDevice as Phys, Queue as Q};
    use trampoline as t;
    use terminator as x;

    vec![
        entry::<PfnDestroyInstance>("gfxDestroyInstance", Slot::DestroyInstance, Inst, V1_0,
            t::destroy_instance, x::destroy_instance),
        entry::<PfnEnumeratePhysicalDevices>("gfxEnumeratePhysicalDevices", Slot::EnumeratePhysicalDevices, Inst, V1_0,
            t::enumerate_physical_devices, x::enumerate_physical_devices),

        entry::<PfnGetPhysicalDeviceProperties>("gfxGetPhysicalDeviceProperties", Slot::GetPhysicalDeviceProperties, Phys, V1_0,
            t::get_physical_device_properties, x::get_physical_device_properties),
        entry::<PfnGetPhysicalDeviceProperties2>("gfxGetPhysicalDeviceProperties2", Slot::GetPhysicalDeviceProperties2, Phys, V1_1,
            t::get_physical_device_properties2, x::get_physical_device_properties2),
        entry::<PfnGetPhysicalDeviceProperties2>("gfxGetPhysicalDeviceProperties2KHR", Slot::GetPhysicalDeviceProperties2, Phys,
            InstExt(KHR_GET_PHYSICAL_DEVICE_PROPERTIES_2),
            t::get_physical_device_properties2, x::get_physical_device_properties2),

        entry::<PfnGetPhysicalDeviceFeatures>("gfxGetPhysicalDeviceFeatures", Slot::GetPhysicalDeviceFeatures, Phys, V1_0,
            t::get_physical_device_features, x::get_physical_device_features),
        entry::<PfnGetPhysicalDeviceFeatures2>("gfxGetPhysicalDeviceFeatures2", Slot::GetPhysicalDeviceFeatures2, Phys, V1_1,
            t::get_physical_device_features2, x::get_physical_device_features2),
        entry::<PfnGetPhysicalDeviceFeatures2>("gfxGetPhysicalDeviceFeatures2KHR", Slot::GetPhysicalDeviceFeatures2, Phys,
            InstExt(KHR_GET_PHYSICAL_DEVICE_PROPERTIES_2),
            t::get_physical_device_features2, x::get_physical_device_features2),

        entry::<PfnGetPhysicalDeviceMemoryProperties>("gfxGetPhysicalDeviceMemoryProperties", Slot::GetPhysicalDeviceMemoryProperties, Phys, V1_0,
            t::get_physical_device_memory_properties, x::get_physical_device_memory_properties),
        entry::<PfnGetPhysicalDeviceMemoryProperties2>("gfxGetPhysicalDeviceMemoryProperties2", Slot::GetPhysicalDeviceMemoryProperties2, Phys, V1_1,
            t::get_physical_device_memory_properties2, x::get_physical_device_memory_properties2),
        entry::<PfnGetPhysicalDeviceMemoryProperties2>("gfxGetPhysicalDeviceMemoryProperties2KHR", Slot::GetPhysicalDeviceMemoryProperties2, Phys,
            InstExt(KHR_GET_PHYSICAL_DEVICE_PROPERTIES_2),
            t::get_physical_device_memory_properties2, x::get_physical_device_memory_properties2),

        entry::<PfnGetPhysicalDeviceFormatProperties>("gfxGetPhysicalDeviceFormatProperties", Slot::GetPhysicalDeviceFormatProperties, Phys, V1_0,
            t::get_physical_device_format_properties, x::get_physical_device_format_properties),
        entry::<PfnGetPhysicalDeviceFormatProperties2>("gfxGetPhysicalDeviceFormatProperties2", Slot::GetPhysicalDeviceFormatProperties2, Phys, V1_1,
            t::get_physical_device_format_properties2, x::get_physical_device_format_properties2),
        entry::<PfnGetPhysicalDeviceFormatProperties2>("gfxGetPhysicalDeviceFormatProperties2KHR", Slot::GetPhysicalDeviceFormatProperties2, Phys,
            InstExt(KHR_GET_PHYSICAL_DEVICE_PROPERTIES_2),
            t::get_physical_device_format_properties2, x::get_physical_device_format_properties2),

        entry::<PfnGetPhysicalDeviceQueueFamilyProperties>("gfxGetPhysicalDeviceQueueFamilyProperties", Slot::GetPhysicalDeviceQueueFamilyProperties, Phys, V1_0,
            t::get_physical_device_queue_family_properties, x::get_physical_device_queue_family_properties),
        entry::<PfnGetPhysicalDeviceQueueFamilyProperties2>("gfxGetPhysicalDeviceQueueFamilyProperties2", Slot::GetPhysicalDeviceQueueFamilyProperties2, Phys, V1_1,
            t::get_physical_device_queue_family_properties2, x::get_physical_device_queue_family_properties2),
        entry::<PfnGetPhysicalDeviceQueueFamilyProperties2>("gfxGetPhysicalDeviceQueueFamilyProperties2KHR", Slot::GetPhysicalDeviceQueueFamilyProperties2, Phys,
            InstExt(KHR_GET_PHYSICAL_DEVICE_PROPERTIES_2),
            t::get_physical_device_queue_family_properties2, x::get_physical_device_queue_family_properties2),

        entry::<PfnGetPhysicalDeviceSparseImageFormatProperties>("gfxGetPhysicalDeviceSparseImageFormatProperties", Slot::GetPhysicalDeviceSparseImageFormatProperties, Phys, V1_0,
            t::get_physical_device_sparse_image_format_properties, x::get_physical_device_sparse_image_format_properties),
        entry::<PfnGetPhysicalDeviceSparseImageFormatProperties2>("gfxGetPhysicalDeviceSparseImageFormatProperties2", Slot::GetPhysicalDeviceSparseImageFormatProperties2, Phys, V1_1,
            t::get_physical_device_sparse_image_format_properties2, x::get_physical_device_sparse_image_format_properties2),
        entry::<PfnGetPhysicalDeviceSparseImageFormatProperties2>("gfxGetPhysicalDeviceSparseImageFormatProperties2KHR", Slot::GetPhysicalDeviceSparseImageFormatProperties2, Phys,
            InstExt(KHR_GET_PHYSICAL_DEVICE_PROPERTIES_2),
            t::get_physical_device_sparse_image_format_properties2, x::get_physical_device_sparse_image_format_properties2),

        entry::<PfnGetPhysicalDeviceExternalBufferProperties>("gfxGetPhysicalDeviceExternalBufferProperties", Slot::GetPhysicalDeviceExternalBufferProperties, Phys, V1_1,
            t::get_physical_device_external_buffer_properties, x::get_physical_device_external_buffer_properties),
        entry::<PfnGetPhysicalDeviceExternalBufferProperties>("gfxGetPhysicalDeviceExternalBufferPropertiesKHR", Slot::GetPhysicalDeviceExternalBufferProperties, Phys,
            InstExt(KHR_EXTERNAL_MEMORY_CAPABILITIES),
            t::get_physical_device_external_buffer_properties, x::get_physical_device_external_buffer_properties),
        entry::<PfnGetPhysicalDeviceExternalSemaphoreProperties>("gfxGetPhysicalDeviceExternalSemaphoreProperties", Slot::GetPhysicalDeviceExternalSemaphoreProperties, Phys, V1_1,
            t::get_physical_device_external_semaphore_properties, x::get_physical_device_external_semaphore_properties),
        entry::<PfnGetPhysicalDeviceExternalSemaphoreProperties>("gfxGetPhysicalDeviceExternalSemaphorePropertiesKHR", Slot::GetPhysicalDeviceExternalSemaphoreProperties, Phys,
            InstExt(KHR_EXTERNAL_SEMAPHORE_CAPABILITIES),
            t::get_physical_device_external_semaphore_properties, x::get_physical_device_external_semaphore_properties),
        entry::<PfnGetPhysicalDeviceExternalFenceProperties>("gfxGetPhysicalDeviceExternalFenceProperties", Slot::GetPhysicalDeviceExternalFenceProperties, Phys, V1_1,
            t::get_physical_device_external_fence_properties, x::get_physical_device_external_fence_properties),
        entry::<PfnGetPhysicalDeviceExternalFenceProperties>("gfxGetPhysicalDeviceExternalFencePropertiesKHR", Slot::GetPhysicalDeviceExternalFenceProperties, Phys,
            InstExt(KHR_EXTERNAL_FENCE_CAPABILITIES),
            t::get_physical_device_external_fence_properties, x::get_physical_device_external_fence_properties),

        entry::<PfnEnumerateDeviceExtensionProperties>("gfxEnumerateDeviceExtensionProperties", Slot::EnumerateDeviceExtensionProperties, Phys, V1_0,
            t::enumerate_device_extension_properties, x::enumerate_device_extension_properties),
        entry::<PfnCreateDevice>("gfxCreateDevice", Slot::CreateDevice, Phys, V1_0,
            t::create_device, x::create_device),

        entry::<PfnGetPhysicalDeviceDisplayPropertiesKHR>("gfxGetPhysicalDeviceDisplayPropertiesKHR", Slot::GetPhysicalDeviceDisplayPropertiesKHR, Phys,
            InstExt(KHR_DISPLAY),
            t::get_physical_device_display_properties_khr, x::get_physical_device_display_properties_khr),
        entry::<PfnCreateDisplayModeKHR>("gfxCreateDisplayModeKHR", Slot::CreateDisplayModeKHR, Phys,
            InstExt(KHR_DISPLAY),
            t::create_display_mode_khr, x::create_display_mode_khr),
        entry::<PfnAcquireDrmDisplayEXT>("gfxAcquireDrmDisplayEXT", Slot::AcquireDrmDisplayEXT, Phys,
            InstExt(EXT_ACQUIRE_DRM_DISPLAY),
            t::acquire_drm_display_ext, x::acquire_drm_display_ext),
        entry::<PfnGetPhysicalDeviceCalibrateableTimeDomainsEXT>("gfxGetPhysicalDeviceCalibrateableTimeDomainsEXT", Slot::GetPhysicalDeviceCalibrateableTimeDomainsEXT, Phys,
            DevExt(EXT_CALIBRATED_TIMESTAMPS),
            t::get_physical_device_calibrateable_time_domains_ext, x::get_physical_device_calibrateable_time_domains_ext),

        entry::<PfnDestroyDevice>("gfxDestroyDevice", Slot::DestroyDevice, Dev, V1_0,
            t::destroy_device, x::destroy_device),
        entry::<PfnGetDeviceQueue>("gfxGetDeviceQueue", Slot::GetDeviceQueue, Dev, V1_0,
            t::get_device_queue, x::get_device_queue),
        entry::<PfnAllocateCommandBuffers>("gfxAllocateCommandBuffers", Slot::AllocateCommandBuffers, Dev, V1_0,
            t::allocate_command_buffers, x::allocate_command_buffers),
        entry::<PfnFreeCommandBuffers>("gfxFreeCommandBuffers", Slot::FreeCommandBuffers, Dev, V1_0,
            t::free_command_buffers, x::free_command_buffers),
        entry::<PfnQueueWaitIdle>("gfxQueueWaitIdle", Slot::QueueWaitIdle, Q, V1_0,
            t::queue_wait_idle, x::queue_wait_idle),
        entry::<PfnCmdSetDeviceMask>("gfxCmdSetDeviceMask", Slot::CmdSetDeviceMask, Cmd, V1_1,
            t::cmd_set_device_mask, x::cmd_set_device_mask),
        entry::<PfnCmdSetDeviceMask>("gfxCmdSetDeviceMaskKHR", Slot::CmdSetDeviceMask, Cmd,
            DevExt(KHR_DEVICE_GROUP),
            t::cmd_set_device_mask, x::cmd_set_device_mask),
    ]
});

static BY_NAME: LazyLock<HashMap<&'static str, usize>> = LazyLock::new(|| {
    ENTRIES.iter().enumerate().map(|(i, e)| (e.name, i)).collect()
});

/// Every known entry point
pub fn entries() -> &'static [EntryPoint] {
    &ENTRIES
}

pub fn lookup(name: &str) -> Option<&'static EntryPoint> {
    BY_NAME.get(name).map(|&i| &ENTRIES[i])
}

/// One stage of a dispatch chain, indexed by [`Slot`]
pub type StageTable = [Option<PfnVoidFunction>; Slot::COUNT];

pub const EMPTY_STAGE: StageTable = [None; Slot::COUNT];

/// Fill a stage by querying every entry point accepted by `want`.
/// The first alias that resolves wins its slot.
pub fn resolve_stage(
    want: impl Fn(&EntryPoint) -> bool,
    mut query: impl FnMut(&str) -> Option<PfnVoidFunction>,
) -> StageTable {
    let mut stage = EMPTY_STAGE;
    for entry in entries().iter().filter(|e| want(e)) {
        let slot = &mut stage[entry.slot.index()];
        if slot.is_none() {
            *slot = query(entry.name);
        }
    }
    stage
}

/// The loader's terminators for every entry point accepted by `want`
pub fn terminator_stage(want: impl Fn(&EntryPoint) -> bool) -> StageTable {
    let mut stage = EMPTY_STAGE;
    for entry in entries().iter().filter(|e| want(e)) {
        stage[entry.slot.index()] = Some(entry.terminator);
    }
    stage
}

/// Flat, ordered call chain for one object
pub struct DispatchTable {
    stages: Vec<StageTable>,
    top: StageTable,
}

impl DispatchTable {
    /// `layers` are outermost first; `terminators` always closes the chain
    pub fn new(layers: Vec<StageTable>, terminators: StageTable) -> Self {
        let mut stages = layers;
        stages.push(terminators);

        let mut top = EMPTY_STAGE;
        for slot in Slot::ALL {
            top[slot.index()] = stages.iter().find_map(|s| s[slot.index()]);
        }
        Self { stages, top }
    }

    /// First stage implementing `slot`
    pub fn entry(&self, slot: Slot) -> Option<PfnVoidFunction> {
        self.top[slot.index()]
    }

    /// Typed first stage
    ///
    /// # Safety
    /// `F` must be the signature of `slot`.
    pub unsafe fn load<F: Copy>(&self, slot: Slot) -> Option<F> {
        self.entry(slot).map(|f| unsafe { cast_pfn::<F>(f) })
    }

    /// First stage after `stage` implementing `slot`
    pub fn next_after(&self, stage: usize, slot: Slot) -> Option<PfnVoidFunction> {
        self.stages.iter().skip(stage + 1).find_map(|s| s[slot.index()])
    }

    pub fn stage(&self, index: usize) -> Option<&StageTable> {
        self.stages.get(index)
    }

    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    unsafe extern "C" fn marker_a() {}
    unsafe extern "C" fn marker_b() {}

    #[test]
    fn test_names_are_unique_and_resolvable() {
        assert_eq!(BY_NAME.len(), entries().len());
        for e in entries() {
            assert!(e.name.starts_with("gfx"));
            assert_eq!(lookup(e.name).unwrap().slot, e.slot);
        }
        assert!(lookup("gfxNoSuchFunction").is_none());
    }

    #[test]
    fn test_aliases_share_slot_and_trampoline() {
        let core = lookup("gfxGetPhysicalDeviceFeatures2").unwrap();
        let khr = lookup("gfxGetPhysicalDeviceFeatures2KHR").unwrap();
        assert_eq!(core.slot, khr.slot);
        assert_eq!(core.trampoline as usize, khr.trampoline as usize);
        assert_eq!(core.capability, Capability::Core(API_VERSION_1_1));
    }

    #[test]
    fn test_every_slot_has_an_entry() {
        for slot in Slot::ALL {
            assert!(entries().iter().any(|e| e.slot == *slot), "{:?}", slot);
        }
    }

    #[test]
    fn test_first_alias_wins() {
        let stage = resolve_stage(
            |e| e.slot == Slot::GetPhysicalDeviceProperties2,
            |name| match name {
                "gfxGetPhysicalDeviceProperties2" => None,
                _ => Some(marker_b as PfnVoidFunction),
            },
        );
        assert_eq!(stage[Slot::GetPhysicalDeviceProperties2.index()].map(|f| f as usize), Some(marker_b as usize));
    }

    #[test]
    fn test_chain_order() {
        let mut layer = EMPTY_STAGE;
        layer[Slot::QueueWaitIdle.index()] = Some(marker_a as PfnVoidFunction);
        let mut terminators = EMPTY_STAGE;
        terminators[Slot::QueueWaitIdle.index()] = Some(marker_b as PfnVoidFunction);
        terminators[Slot::DestroyDevice.index()] = Some(marker_b as PfnVoidFunction);

        let table = DispatchTable::new(vec![layer, EMPTY_STAGE], terminators);
        assert_eq!(table.stage_count(), 3);
        assert_eq!(table.entry(Slot::QueueWaitIdle).map(|f| f as usize), Some(marker_a as usize));
        assert_eq!(table.next_after(0, Slot::QueueWaitIdle).map(|f| f as usize), Some(marker_b as usize));
        assert_eq!(table.entry(Slot::DestroyDevice).map(|f| f as usize), Some(marker_b as usize));
        assert!(table.next_after(2, Slot::DestroyDevice).is_none());
        assert!(table.entry(Slot::CreateDevice).is_none());
    }
}
