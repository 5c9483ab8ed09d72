/*
 *  driver/library.rs
 *
 *  gfx-loader - worth the squeeze
 *  (c) 2020-26 Stuart Hunter
 *
 *  Library loading collaborators - platform loader and discovery service
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

use std::ffi::CString;
use std::fmt;
use std::fs;
use std::mem::ManuallyDrop;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use log::{debug, info};
use libloading::Library;

use crate::api::PfnVoidFunction;

/// Manifest library_path prefix meaning "ask the discovery service"
pub const SERVICE_PREFIX: &str = "service:";

/// Canonical identity of a driver or layer binary
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LibraryIdentity {
    /// Absolute, canonicalised where the file exists
    Path(PathBuf),
    /// Bare name resolved by the platform search
    Name(String),
    /// Image supplied by the discovery service
    Service(String),
}

impl LibraryIdentity {
    /// Interpret a manifest `library_path` value
    pub fn from_manifest_value(value: &str, manifest_dir: &Path) -> Self {
        let value = value.trim();
        if let Some(name) = value.strip_prefix(SERVICE_PREFIX) {
            return Self::Service(name.to_string());
        }
        if value.contains('/') || value.contains(std::path::MAIN_SEPARATOR) {
            let path = Path::new(value);
            let joined = if path.is_absolute() {
                path.to_path_buf()
            } else {
                manifest_dir.join(path)
            };
            return Self::Path(fs::canonicalize(&joined).unwrap_or(joined));
        }
        Self::Name(value.to_string())
    }
}

impl fmt::Display for LibraryIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Path(p) => write!(f, "{}", p.display()),
            Self::Name(n) => write!(f, "{}", n),
            Self::Service(n) => write!(f, "{}{}", SERVICE_PREFIX, n),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LibraryKind {
    Driver,
    Layer,
}

/// An opened binary
pub trait DynamicLibrary: Send + Sync {
    /// Look up an exported symbol, `None` when absent
    fn symbol(&self, name: &str) -> Option<PfnVoidFunction>;

    fn name(&self) -> &str;
}

/// Platform library loader
pub trait LibraryLoader: Send + Sync {
    fn open(&self, identity: &LibraryIdentity, kind: LibraryKind) -> Result<Arc<dyn DynamicLibrary>, String>;
}

/// Privileged discovery service present on some platforms
pub trait DiscoveryService: Send + Sync {
    /// Driver image for a service name
    fn get(&self, name: &str) -> Option<Arc<dyn DynamicLibrary>>;

    fn connect_to_device_namespace(&self) -> bool;

    /// Root of the service's manifest filesystem, if it exposes one
    fn connect_to_manifest_filesystem(&self) -> Option<PathBuf>;
}

/// Resolve an identity to a library, preferring the discovery service for
/// `service:` identities and falling back to opening the name directly
pub fn open_library(
    identity: &LibraryIdentity,
    kind: LibraryKind,
    libraries: &dyn LibraryLoader,
    service: Option<&dyn DiscoveryService>,
) -> Result<Arc<dyn DynamicLibrary>, String> {
    if let LibraryIdentity::Service(name) = identity {
        if let Some(library) = service.and_then(|s| s.get(name)) {
            return Ok(library);
        }
        debug!("discovery service cannot supply {}, opening by name", name);
        return libraries.open(&LibraryIdentity::Name(name.clone()), kind);
    }
    libraries.open(identity, kind)
}

/// A library opened through `libloading`
pub struct SystemLibrary {
    /// Driver libraries are never closed
    library: ManuallyDrop<Library>,
    name: String,
    kind: LibraryKind,
}

impl DynamicLibrary for SystemLibrary {
    fn symbol(&self, name: &str) -> Option<PfnVoidFunction> {
        let name = CString::new(name).ok()?;
        // SAFETY: the symbol is only ever called through the signature the
        // interface documents for that name
        unsafe {
            self.library
                .get::<PfnVoidFunction>(name.as_bytes_with_nul())
                .ok()
                .map(|s| *s)
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for SystemLibrary {
    fn drop(&mut self) {
        if self.kind == LibraryKind::Layer {
            debug!("closing layer library {}", self.name);
            // SAFETY: dropped exactly once, here
            unsafe { ManuallyDrop::drop(&mut self.library) };
        }
    }
}

/// dlopen-style loader
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemLibraryLoader;

impl LibraryLoader for SystemLibraryLoader {
    fn open(&self, identity: &LibraryIdentity, kind: LibraryKind) -> Result<Arc<dyn DynamicLibrary>, String> {
        let target = match identity {
            LibraryIdentity::Path(p) => p.as_os_str().to_owned(),
            LibraryIdentity::Name(n) | LibraryIdentity::Service(n) => n.into(),
        };
        info!("Loading {:?} library {}", kind, identity);

        // SAFETY: running a library's initialisers is inherent to loading it
        let library = unsafe { Library::new(&target) }.map_err(|e| e.to_string())?;

        Ok(Arc::new(SystemLibrary {
            library: ManuallyDrop::new(library),
            name: identity.to_string(),
            kind,
        }))
    }
}
