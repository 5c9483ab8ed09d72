/*
 *  loader.rs
 *
 *  gfx-loader - worth the squeeze
 *  (c) 2020-26 Stuart Hunter
 *
 *  Process-wide loader state: discovery, sessions, instance creation
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

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use log::{debug, info, warn};

use crate::api::*;
use crate::config::{Environment, LoaderSettings, ProcessEnvironment};
use crate::driver::{DiscoveryService, DriverSession, LibraryLoader, SessionCache, SystemLibraryLoader};
use crate::error::{LayerError, LoaderError};
use crate::extension::EMULATED_INSTANCE_EXTENSIONS;
use crate::instance::{self, InstanceObject, InstanceRequest};
use crate::layer::{implicit_layer_active, LayerChainBuilder};
use crate::lock;
use crate::manifest::{self, ExtensionDecl, LayerRecord, ManifestSet};

static GLOBAL: RwLock<Option<Loader>> = RwLock::new(None);

#[derive(Debug, Default)]
struct ServiceState {
    attempted: bool,
    device_namespace: bool,
    manifest_root: Option<PathBuf>,
}

struct LoaderShared {
    environment: Arc<dyn Environment>,
    libraries: Arc<dyn LibraryLoader>,
    service: Option<Arc<dyn DiscoveryService>>,
    settings: LoaderSettings,
    sessions: SessionCache,
    first_scan: OnceLock<()>,
    manifests: Mutex<ManifestSet>,
    service_state: Mutex<ServiceState>,
}

/// Handle to one loader configuration. Clones share state.
#[derive(Clone)]
pub struct Loader {
    shared: Arc<LoaderShared>,
}

impl std::fmt::Debug for Loader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Loader")
            .field("settings", &self.shared.settings)
            .field("sessions", &self.shared.sessions.sessions().len())
            .finish()
    }
}

/// Assemble a [`Loader`] from its collaborators
#[derive(Default)]
pub struct LoaderBuilder {
    environment: Option<Arc<dyn Environment>>,
    library_loader: Option<Arc<dyn LibraryLoader>>,
    discovery_service: Option<Arc<dyn DiscoveryService>>,
    settings: Option<LoaderSettings>,
}

impl LoaderBuilder {
    pub fn environment(mut self, environment: impl Environment + 'static) -> Self {
        self.environment = Some(Arc::new(environment));
        self
    }

    pub fn library_loader(mut self, loader: impl LibraryLoader + 'static) -> Self {
        self.library_loader = Some(Arc::new(loader));
        self
    }

    pub fn discovery_service(mut self, service: impl DiscoveryService + 'static) -> Self {
        self.discovery_service = Some(Arc::new(service));
        self
    }

    /// Use these settings instead of reading them from the environment
    pub fn settings(mut self, settings: LoaderSettings) -> Self {
        self.settings = Some(settings);
        self
    }

    pub fn build(self) -> Loader {
        let environment = self.environment.unwrap_or_else(|| Arc::new(ProcessEnvironment));
        let settings = self
            .settings
            .unwrap_or_else(|| LoaderSettings::from_environment(environment.as_ref()));
        Loader {
            shared: Arc::new(LoaderShared {
                environment,
                libraries: self.library_loader.unwrap_or_else(|| Arc::new(SystemLibraryLoader)),
                service: self.discovery_service,
                settings,
                sessions: SessionCache::new(),
                first_scan: OnceLock::new(),
                manifests: Mutex::new(ManifestSet::default()),
                service_state: Mutex::new(ServiceState::default()),
            }),
        }
    }
}

impl Default for Loader {
    fn default() -> Self {
        Self::new()
    }
}

impl Loader {
    /// Loader over the real process environment and system libraries
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> LoaderBuilder {
        LoaderBuilder::default()
    }

    /// The loader behind the exported entry points
    pub fn global() -> Loader {
        if let Some(loader) = GLOBAL.read().unwrap_or_else(|e| e.into_inner()).as_ref() {
            return loader.clone();
        }
        GLOBAL
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .get_or_insert_with(Loader::new)
            .clone()
    }

    /// Replace the global loader, returning the previous one
    pub fn set_global(loader: Loader) -> Option<Loader> {
        GLOBAL.write().unwrap_or_else(|e| e.into_inner()).replace(loader)
    }

    pub fn settings(&self) -> &LoaderSettings {
        &self.shared.settings
    }

    fn service(&self) -> Option<&dyn DiscoveryService> {
        self.shared.service.as_deref()
    }

    /// Connect to the discovery service once; later calls reuse the result
    fn service_manifest_root(&self) -> Option<PathBuf> {
        let service = self.service()?;
        let mut state = lock(&self.shared.service_state);
        if !state.attempted {
            state.attempted = true;
            state.device_namespace = service.connect_to_device_namespace();
            state.manifest_root = service.connect_to_manifest_filesystem();
            debug!(
                "discovery service: device namespace {}, manifest root {:?}",
                state.device_namespace, state.manifest_root
            );
        }
        state.manifest_root.clone()
    }

    fn scan(&self) -> ManifestSet {
        let root = self.service_manifest_root();
        manifest::scan(&self.shared.settings, self.shared.environment.as_ref(), root)
    }

    /// Current manifests. The first call in the process scans under a
    /// once barrier; later calls rescan.
    pub fn manifests(&self) -> ManifestSet {
        let mut scanned = false;
        self.shared.first_scan.get_or_init(|| {
            *lock(&self.shared.manifests) = self.scan();
            scanned = true;
        });
        if !scanned {
            let set = self.scan();
            *lock(&self.shared.manifests) = set;
        }
        lock(&self.shared.manifests).clone()
    }

    /// Open every discovered driver, dropping the ones that fail
    fn open_drivers(&self, set: &ManifestSet) -> Vec<Arc<DriverSession>> {
        let mut ids = HashSet::new();
        let mut out = Vec::new();
        for record in &set.drivers {
            match self.shared.sessions.get_or_open(record, self.shared.libraries.as_ref(), self.service()) {
                Ok(session) => {
                    if ids.insert(session.id()) {
                        out.push(session);
                    }
                }
                Err(e) => warn!("driver {} ignored: {}", record.manifest_path.display(), e),
            }
        }
        out
    }

    /// Every driver session opened so far
    pub fn sessions(&self) -> Vec<Arc<DriverSession>> {
        self.shared.sessions.sessions()
    }

    pub fn create_instance(&self, request: &InstanceRequest) -> Result<Arc<InstanceObject>, LoaderError> {
        let set = self.manifests();
        let chain = LayerChainBuilder::new(
            &self.shared.settings,
            self.shared.environment.as_ref(),
            self.shared.libraries.as_ref(),
            self.service(),
        )
        .build_chain(&request.layers, &set.layers)?;

        let sessions = self.open_drivers(&set);
        if sessions.is_empty() {
            warn!("no usable driver found");
            return Err(LoaderError::IncompatibleDriver);
        }
        instance::create(request, &sessions, chain, &self.shared.settings)
    }

    /// Destroy an instance created by [`create_instance`](Self::create_instance)
    /// through its full chain
    pub fn destroy_instance(&self, instance: &InstanceObject) {
        unsafe {
            crate::dispatch::trampoline::destroy_instance(Instance::from_raw(instance.handle()), std::ptr::null())
        };
    }

    /// Instance extensions available to applications, or those of one layer
    pub fn enumerate_instance_extension_properties(
        &self,
        layer_name: Option<&str>,
    ) -> Result<Vec<ExtensionDecl>, LoaderError> {
        let set = self.manifests();
        if let Some(name) = layer_name {
            return match set.layer(name) {
                Some(layer) => Ok(layer.instance_extensions.clone()),
                None => Err(LayerError::NotPresent(name.to_string()).into()),
            };
        }

        let mut names = HashSet::new();
        let mut out = Vec::new();
        let mut add = |ext: &ExtensionDecl| {
            if names.insert(ext.name.clone()) {
                out.push(ext.clone());
            }
        };
        for session in self.open_drivers(&set) {
            session.extensions().iter().for_each(&mut add);
        }
        for (name, spec_version) in EMULATED_INSTANCE_EXTENSIONS {
            add(&ExtensionDecl::new(name, *spec_version));
        }
        for layer in set.layers.iter().filter(|l| l.is_implicit()) {
            if implicit_layer_active(layer, self.shared.environment.as_ref()) {
                layer.instance_extensions.iter().for_each(&mut add);
            }
        }
        Ok(out)
    }

    /// Explicit layers and the implicit layers currently switched on
    pub fn enumerate_instance_layer_properties(&self) -> Vec<LayerRecord> {
        let env = self.shared.environment.as_ref();
        let layers: Vec<LayerRecord> = self
            .manifests()
            .layers
            .into_iter()
            .filter(|l| !l.is_implicit() || implicit_layer_active(l, env))
            .collect();
        info!("{} layer(s) available", layers.len());
        layers
    }

    pub fn instance_version(&self) -> u32 {
        LOADER_API_VERSION
    }
}
