/*
 *  lib.rs
 *
 *  gfx-loader - worth the squeeze
 *  (c) 2020-26 Stuart Hunter
 *
 *  Graphics API loader - dispatch and extension-resolution core
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

//! gfx-loader
//!
//! Sits between applications and vendor drivers, presenting one API
//! surface. Calls enter through exported trampolines, pass down the
//! ordered layer chain and end in terminators that resolve the handle and
//! call the owning driver.
//!
//! The library never installs a logger; embedders decide where the
//! `log` records go.

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod api;
pub mod config;
pub mod device;
pub mod dispatch;
pub mod driver;
pub mod error;
pub mod extension;
pub mod handle;
pub mod instance;
pub mod layer;
pub mod loader;
pub mod manifest;
pub mod physical_device;

pub use config::{Environment, LoaderSettings, MapEnvironment, ProcessEnvironment};
pub use driver::{DiscoveryService, DynamicLibrary, LibraryIdentity, LibraryKind, LibraryLoader, SystemLibraryLoader};
pub use error::{ConfigurationError, DriverLoadError, InvalidHandle, LayerError, LoaderError};
pub use instance::InstanceRequest;
pub use loader::{Loader, LoaderBuilder};

/// Lock a mutex, carrying on with the data if a panicking thread poisoned it
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
