/*
 *  extension.rs
 *
 *  gfx-loader - worth the squeeze
 *  (c) 2020-26 Stuart Hunter
 *
 *  Extension resolution - visibility of gated entry points
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

use crate::api::*;
use crate::dispatch::table::{Capability, EntryPoint, Scope};
use crate::manifest::ExtensionDecl;

/// Instance extensions whose queries the loader can synthesize from a
/// driver's core queries. This family is closed.
pub const EMULATED_INSTANCE_EXTENSIONS: &[(&str, u32)] = &[
    (KHR_GET_PHYSICAL_DEVICE_PROPERTIES_2, 2),
    (KHR_EXTERNAL_MEMORY_CAPABILITIES, 1),
    (KHR_EXTERNAL_SEMAPHORE_CAPABILITIES, 1),
    (KHR_EXTERNAL_FENCE_CAPABILITIES, 1),
];

pub fn is_emulated(name: &str) -> bool {
    EMULATED_INSTANCE_EXTENSIONS.iter().any(|(n, _)| *n == name)
}

/// Extensions promoted to core 1.1 that drivers below 1.1 still need
/// enabled explicitly
pub fn is_promoted_to_1_1(name: &str) -> bool {
    is_emulated(name)
}

/// Compare versions ignoring variant and patch
pub fn version_at_least(version: u32, required: u32) -> bool {
    api_version_minor_only(version) >= api_version_minor_only(required)
}

/// Version-only comparison: `min` of two versions by major.minor
pub fn min_version(a: u32, b: u32) -> u32 {
    if api_version_minor_only(a) <= api_version_minor_only(b) { a } else { b }
}

pub fn declares(list: &[ExtensionDecl], name: &str) -> bool {
    list.iter().any(|e| e.name == name)
}

/// What an object knows about itself for visibility purposes
pub trait VisibilityContext {
    fn api_version(&self) -> u32;
    fn instance_extension_enabled(&self, name: &str) -> bool;
    /// Some driver or layer behind this object can service the extension
    fn instance_extension_available(&self, name: &str) -> bool;
    fn device_extension_available(&self, name: &str) -> bool;
}

/// Visibility of an entry point at instance level
pub fn visible_at_instance(entry: &EntryPoint, ctx: &dyn VisibilityContext) -> bool {
    match entry.capability {
        Capability::Always => true,
        Capability::Core(version) => version_at_least(ctx.api_version(), version),
        Capability::InstanceExtension(ext) => {
            ctx.instance_extension_enabled(ext)
                && (is_emulated(ext) || ctx.instance_extension_available(ext))
        }
        Capability::DeviceExtension(ext) => ctx.device_extension_available(ext),
    }
}

/// Visibility of an entry point from a device's proc-address query
pub fn visible_at_device(entry: &EntryPoint, api_version: u32, enabled: &[String]) -> bool {
    if !matches!(entry.scope, Scope::Device | Scope::Queue | Scope::CommandBuffer) {
        return false;
    }
    match entry.capability {
        Capability::Always => true,
        Capability::Core(version) => version_at_least(api_version, version),
        Capability::DeviceExtension(ext) => enabled.iter().any(|e| e == ext),
        Capability::InstanceExtension(_) => false,
    }
}
