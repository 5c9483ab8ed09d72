/*
 *  dispatch/mod.rs
 *
 *  gfx-loader - worth the squeeze
 *  (c) 2020-26 Stuart Hunter
 *
 *  Trampoline/terminator call chains
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

pub(crate) mod stubs;
pub mod table;
pub mod terminator;
pub mod trampoline;
pub mod unknown;

use std::ffi::c_char;
use log::trace;

use crate::api::{c_str_opt, PfnVoidFunction};
use crate::handle::{registry, HandleTarget};

/// Callback handed to every layer during negotiation.
///
/// Returns the first stage after `layer` that implements `name` for the
/// object behind `handle`, or null when nothing further down does.
///
/// # Safety
/// `layer` and `name` must be null or valid null-terminated strings.
pub unsafe extern "C" fn get_next_proc_addr(
    handle: u64,
    layer: *const c_char,
    name: *const c_char,
) -> Option<PfnVoidFunction> {
    let (Some(layer), Some(name)) = (unsafe { c_str_opt(layer) }, unsafe { c_str_opt(name) }) else {
        return None;
    };
    let resolved = registry().resolve_any(handle).ok()?;
    trace!("next stage for {} after {}", name, layer);
    match resolved.target {
        HandleTarget::Instance(instance) => instance.next_proc_addr(layer, name),
        HandleTarget::PhysicalDevice(record) => record.instance()?.next_proc_addr(layer, name),
        HandleTarget::Device(device) => device.next_proc_addr(layer, name),
    }
}
