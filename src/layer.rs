/*
 *  layer.rs
 *
 *  gfx-loader - worth the squeeze
 *  (c) 2020-26 Stuart Hunter
 *
 *  Layer selection, loading and negotiation
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

//! Layer chains
//!
//! A chain is built in two steps. [`LayerChainBuilder::select`] decides
//! which manifests take part and in what order (implicit layers, then
//! `GFX_INSTANCE_LAYERS`, then the enable filter, then the application's
//! request), expanding meta layers as it goes. Loading then opens each
//! binary and negotiates; a layer that fails here is skipped.

use std::collections::HashSet;
use std::ffi::CString;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use log::{debug, info, warn};

use crate::api::*;
use crate::config::{is_truthy, Environment, LoaderSettings};
use crate::driver::library::open_library;
use crate::driver::{DiscoveryService, DynamicLibrary, LibraryKind, LibraryLoader};
use crate::error::LayerError;
use crate::extension;
use crate::manifest::filter::{Filter, LayerDisableFilter};
use crate::manifest::LayerRecord;

/// Meta layers may nest, but not without bound
const MAX_META_DEPTH: usize = 8;

/// Whether an implicit layer's environment switches leave it on.
///
/// A layer listing `app_keys` only applies to those executables.
pub fn implicit_layer_active(layer: &LayerRecord, env: &dyn Environment) -> bool {
    if !layer.app_keys.is_empty() {
        let Some(exe) = env.executable_path() else {
            return false;
        };
        if !layer.app_keys.iter().any(|key| Path::new(key) == exe) {
            debug!("layer {} does not apply to {}", layer.name, exe.display());
            return false;
        }
    }
    if let Some(var) = &layer.disable_environment {
        if is_truthy(env.var(var).as_deref()) {
            return false;
        }
    }
    match &layer.enable_environment {
        Some((var, value)) => env.var(var).as_deref() == Some(value.as_str()),
        None => true,
    }
}

/// Layer manifest rendered for `gfxEnumerateInstanceLayerProperties`
pub fn layer_properties(layer: &LayerRecord) -> LayerProperties {
    LayerProperties {
        layer_name: to_c_array(&layer.name),
        spec_version: layer.api_version,
        implementation_version: layer.implementation_version,
        description: to_c_array(&layer.description),
    }
}

/// A loaded, negotiated layer
pub struct ActiveLayer {
    record: LayerRecord,
    library: Arc<dyn DynamicLibrary>,
    interface_version: u32,
    gipa: PfnGetInstanceProcAddr,
    gdpa: Option<PfnGetDeviceProcAddr>,
    gpdpa: Option<PfnGetPhysicalDeviceProcAddr>,
}

impl fmt::Debug for ActiveLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveLayer")
            .field("name", &self.record.name)
            .field("library", &self.library.name())
            .field("interface_version", &self.interface_version)
            .finish()
    }
}

impl ActiveLayer {
    fn load(
        record: &LayerRecord,
        libraries: &dyn LibraryLoader,
        service: Option<&dyn DiscoveryService>,
    ) -> Result<Self, String> {
        let identity = record.library.as_ref().ok_or("meta layer has no library")?;
        let library = open_library(identity, LibraryKind::Layer, libraries, service)?;

        let symbol = record.negotiate_symbol();
        let negotiate = library
            .symbol(&symbol)
            .ok_or_else(|| format!("{} does not export {}", library.name(), symbol))?;
        // SAFETY: the layer contract fixes the negotiation signature
        let negotiate: PfnNegotiateLoaderLayerInterfaceVersion = unsafe { cast_pfn(negotiate) };

        let mut interface = LayerNegotiateInterface {
            pfn_get_next_proc_addr: Some(crate::dispatch::get_next_proc_addr),
            ..Default::default()
        };
        let result = unsafe { negotiate(&mut interface) };
        if result != GfxResult::SUCCESS {
            return Err(format!("negotiation returned {}", result));
        }
        if interface.loader_layer_interface_version == 0
            || interface.loader_layer_interface_version > CURRENT_LAYER_INTERFACE_VERSION
        {
            return Err(format!("unsupported interface version {}", interface.loader_layer_interface_version));
        }
        let gipa = interface
            .pfn_get_instance_proc_addr
            .ok_or("negotiation did not supply gfxGetInstanceProcAddr")?;

        Ok(Self {
            record: record.clone(),
            library,
            interface_version: interface.loader_layer_interface_version,
            gipa,
            gdpa: interface.pfn_get_device_proc_addr,
            gpdpa: interface.pfn_get_physical_device_proc_addr,
        })
    }

    pub fn name(&self) -> &str {
        &self.record.name
    }

    pub fn record(&self) -> &LayerRecord {
        &self.record
    }

    pub fn interface_version(&self) -> u32 {
        self.interface_version
    }

    /// What the layer intercepts at instance level; `None` when it does not
    pub fn instance_proc_addr(&self, instance: u64, name: &str) -> Option<PfnVoidFunction> {
        let c = CString::new(name).ok()?;
        unsafe { (self.gipa)(Instance::from_raw(instance), c.as_ptr()) }
    }

    pub fn device_proc_addr(&self, device: u64, name: &str) -> Option<PfnVoidFunction> {
        let gdpa = self.gdpa?;
        let c = CString::new(name).ok()?;
        unsafe { gdpa(Device::from_raw(device), c.as_ptr()) }
    }

    pub fn physical_device_proc_addr(&self, instance: u64, name: &str) -> Option<PfnVoidFunction> {
        let gpdpa = self.gpdpa?;
        let c = CString::new(name).ok()?;
        unsafe { gpdpa(Instance::from_raw(instance), c.as_ptr()) }
    }
}

/// Ordered layers of one instance, outermost first
#[derive(Debug, Default)]
pub struct LayerChain {
    layers: Vec<ActiveLayer>,
}

impl LayerChain {
    pub fn layers(&self) -> &[ActiveLayer] {
        &self.layers
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.layers.iter().position(|l| l.name() == name)
    }

    pub fn layer(&self, name: &str) -> Option<&ActiveLayer> {
        self.layers.iter().find(|l| l.name() == name)
    }

    /// Any layer needs loader-issued handles
    pub fn wraps_handles(&self) -> bool {
        self.layers.iter().any(|l| l.record.requires_handle_wrapping)
    }

    pub fn declares_instance_extension(&self, name: &str) -> bool {
        self.layers.iter().any(|l| extension::declares(&l.record.instance_extensions, name))
    }

    pub fn declares_device_extension(&self, name: &str) -> bool {
        self.layers.iter().any(|l| extension::declares(&l.record.device_extensions, name))
    }
}

/// Why a layer is a chain candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Implicit,
    SettingsFile,
    Environment,
    EnableFilter,
    Application,
}

pub struct LayerChainBuilder<'a> {
    settings: &'a LoaderSettings,
    env: &'a dyn Environment,
    libraries: &'a dyn LibraryLoader,
    service: Option<&'a dyn DiscoveryService>,
}

impl<'a> LayerChainBuilder<'a> {
    pub fn new(
        settings: &'a LoaderSettings,
        env: &'a dyn Environment,
        libraries: &'a dyn LibraryLoader,
        service: Option<&'a dyn DiscoveryService>,
    ) -> Self {
        Self { settings, env, libraries, service }
    }

    /// Select, load and negotiate the layers for one instance
    pub fn build_chain(&self, requested: &[String], available: &[LayerRecord]) -> Result<LayerChain, LayerError> {
        let selected = self.select(requested, available)?;
        let mut layers = Vec::with_capacity(selected.len());
        for record in &selected {
            match ActiveLayer::load(record, self.libraries, self.service) {
                Ok(layer) => {
                    info!("Loaded layer: {} (interface {})", layer.name(), layer.interface_version());
                    layers.push(layer);
                }
                Err(reason) => warn!("skipping layer {}: {}", record.name, reason),
            }
        }
        Ok(LayerChain { layers })
    }

    /// Ordered, expanded and deduplicated layer manifests
    pub fn select(&self, requested: &[String], available: &[LayerRecord]) -> Result<Vec<LayerRecord>, LayerError> {
        let find = |name: &str| available.iter().find(|l| l.name == name);
        let enable = Filter::parse_opt(self.settings.layers_enable.as_deref());
        let disable = self.settings.layers_disable.as_deref().map(LayerDisableFilter::parse);

        let override_layer = available
            .iter()
            .find(|l| l.is_override() && l.is_implicit() && implicit_layer_active(l, self.env));
        let blacklist: &[String] = override_layer.map(|l| l.blacklisted_layers.as_slice()).unwrap_or_default();

        let mut candidates: Vec<(&LayerRecord, Origin)> = Vec::new();
        for layer in available.iter().filter(|l| l.is_implicit()) {
            if implicit_layer_active(layer, self.env) {
                candidates.push((layer, Origin::Implicit));
            }
        }
        let configured = self.settings.settings_file.as_ref().filter(|f| f.configures_layers());
        for name in configured.into_iter().flat_map(|f| f.forced_layers()) {
            match find(name) {
                Some(layer) => candidates.push((layer, Origin::SettingsFile)),
                None => warn!("layer {} from the settings file was not found", name),
            }
        }
        for name in &self.settings.instance_layers {
            match find(name) {
                Some(layer) => candidates.push((layer, Origin::Environment)),
                None => warn!("layer {} from GFX_INSTANCE_LAYERS was not found", name),
            }
        }
        if let Some(enable) = &enable {
            for layer in available.iter().filter(|l| !l.is_implicit() && enable.matches(&l.name)) {
                candidates.push((layer, Origin::EnableFilter));
            }
        }
        for name in requested {
            match find(name) {
                Some(layer) => candidates.push((layer, Origin::Application)),
                None => return Err(LayerError::NotPresent(name.clone())),
            }
        }

        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for (layer, origin) in candidates {
            let forced = origin == Origin::SettingsFile || enable.as_ref().is_some_and(|f| f.matches(&layer.name));
            if !forced && disable.as_ref().is_some_and(|d| d.matches(&layer.name, layer.is_implicit())) {
                if origin == Origin::Application {
                    warn!("layer {} was requested but is disabled by GFX_LOADER_LAYERS_DISABLE", layer.name);
                } else {
                    debug!("layer {} disabled by filter", layer.name);
                }
                continue;
            }
            if blacklist.contains(&layer.name) {
                info!("layer {} is blacklisted by {}", layer.name, crate::manifest::record::OVERRIDE_LAYER_NAME);
                continue;
            }

            let expanded = match expand(layer, available, 0) {
                Ok(expanded) => expanded,
                Err(missing) => {
                    warn!("meta layer {} dropped, component {} is missing", layer.name, missing);
                    continue;
                }
            };
            for record in expanded {
                if !blacklist.contains(&record.name) && seen.insert(record.name.clone()) {
                    out.push(record.clone());
                }
            }
        }
        if configured.is_some() {
            // the settings file fixes the order, and `available` is in it
            out.sort_by_key(|record| available.iter().position(|a| a.name == record.name));
        }
        Ok(out)
    }
}

/// Replace a meta layer by its components, recursively
fn expand<'r>(layer: &'r LayerRecord, available: &'r [LayerRecord], depth: usize) -> Result<Vec<&'r LayerRecord>, String> {
    if !layer.is_meta() {
        return Ok(vec![layer]);
    }
    if depth >= MAX_META_DEPTH {
        return Err(layer.name.clone());
    }
    let mut out = Vec::new();
    for component in &layer.component_layers {
        let record = available
            .iter()
            .find(|l| &l.name == component)
            .ok_or_else(|| component.clone())?;
        out.extend(expand(record, available, depth + 1)?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::settings::{LayerConfiguration, LayerControl, SettingsFile};
    use std::path::PathBuf;
    use crate::config::MapEnvironment;
    use crate::driver::LibraryIdentity;
    use crate::manifest::LayerType;

    struct NoLibraries;

    impl LibraryLoader for NoLibraries {
        fn open(&self, identity: &LibraryIdentity, _kind: LibraryKind) -> Result<Arc<dyn DynamicLibrary>, String> {
            Err(format!("{} not found", identity))
        }
    }

    fn layer(name: &str, layer_type: LayerType) -> LayerRecord {
        LayerRecord {
            manifest_path: PathBuf::from(format!("/etc/gfx/{}.json", name)),
            name: name.to_string(),
            layer_type,
            library: Some(LibraryIdentity::Name(format!("lib{}.so", name))),
            api_version: API_VERSION_1_1,
            implementation_version: 1,
            description: String::new(),
            entrypoint_prefix: "gfx".to_string(),
            instance_extensions: vec![],
            device_extensions: vec![],
            enable_environment: None,
            disable_environment: None,
            component_layers: vec![],
            override_paths: vec![],
            blacklisted_layers: vec![],
            app_keys: vec![],
            requires_handle_wrapping: false,
        }
    }

    fn meta(name: &str, components: &[&str], layer_type: LayerType) -> LayerRecord {
        LayerRecord {
            library: None,
            component_layers: components.iter().map(|c| c.to_string()).collect(),
            ..layer(name, layer_type)
        }
    }

    fn names(records: &[LayerRecord]) -> Vec<&str> {
        records.iter().map(|r| r.name.as_str()).collect()
    }

    fn select(settings: &LoaderSettings, env: &MapEnvironment, requested: &[&str], available: &[LayerRecord]) -> Result<Vec<LayerRecord>, LayerError> {
        let requested: Vec<String> = requested.iter().map(|s| s.to_string()).collect();
        LayerChainBuilder::new(settings, env, &NoLibraries, None).select(&requested, available)
    }

    #[test]
    fn test_implicit_layer_switches() {
        let mut l = layer("GFX_LAYER_imp", LayerType::Implicit);
        l.disable_environment = Some("DISABLE_IMP".into());
        assert!(implicit_layer_active(&l, &MapEnvironment::new()));
        assert!(!implicit_layer_active(&l, &MapEnvironment::new().set("DISABLE_IMP", "1")));
        assert!(implicit_layer_active(&l, &MapEnvironment::new().set("DISABLE_IMP", "0")));

        l.enable_environment = Some(("ENABLE_IMP".into(), "yes".into()));
        assert!(!implicit_layer_active(&l, &MapEnvironment::new()));
        assert!(implicit_layer_active(&l, &MapEnvironment::new().set("ENABLE_IMP", "yes")));
    }

    #[test]
    fn test_app_keys_limit_implicit_layer() {
        let mut l = layer("GFX_LAYER_keyed", LayerType::Implicit);
        l.app_keys = vec!["/opt/game/bin/game".into()];
        assert!(!implicit_layer_active(&l, &MapEnvironment::new()));
        assert!(!implicit_layer_active(&l, &MapEnvironment::new().executable("/usr/bin/other")));
        assert!(implicit_layer_active(&l, &MapEnvironment::new().executable("/opt/game/bin/game")));

        let settings = LoaderSettings::default();
        let other = MapEnvironment::new().executable("/usr/bin/other");
        assert!(select(&settings, &other, &[], &[l.clone()]).unwrap().is_empty());
        let game = MapEnvironment::new().executable("/opt/game/bin/game");
        assert_eq!(names(&select(&settings, &game, &[], &[l]).unwrap()), vec!["GFX_LAYER_keyed"]);
    }

    #[test]
    fn test_settings_file_forces_and_orders_layers() {
        let entry = |name: &str, control| LayerConfiguration {
            name: name.to_string(),
            path: Some(format!("/cfg/{}.json", name).into()),
            control,
            treat_as_implicit_manifest: false,
        };
        let mut settings = LoaderSettings {
            settings_file: Some(SettingsFile {
                source: None,
                stderr_log: vec![],
                layers: vec![
                    entry("GFX_LAYER_forced", LayerControl::On),
                    entry("GFX_LAYER_imp", LayerControl::Auto),
                    entry("GFX_LAYER_app", LayerControl::Auto),
                ],
            }),
            ..Default::default()
        };
        // scan has already arranged the records in file order
        let available = vec![
            layer("GFX_LAYER_forced", LayerType::Explicit),
            layer("GFX_LAYER_imp", LayerType::Implicit),
            layer("GFX_LAYER_app", LayerType::Explicit),
        ];
        let env = MapEnvironment::new();
        let out = select(&settings, &env, &["GFX_LAYER_app"], &available).unwrap();
        assert_eq!(names(&out), vec!["GFX_LAYER_forced", "GFX_LAYER_imp", "GFX_LAYER_app"]);

        settings.layers_disable = Some("~all~".into());
        let out = select(&settings, &env, &["GFX_LAYER_app"], &available).unwrap();
        assert_eq!(names(&out), vec!["GFX_LAYER_forced"]);
    }

    #[test]
    fn test_chain_order() {
        let available = vec![
            layer("GFX_LAYER_imp", LayerType::Implicit),
            layer("GFX_LAYER_app", LayerType::Explicit),
            layer("GFX_LAYER_env", LayerType::Explicit),
            layer("GFX_LAYER_filtered", LayerType::Explicit),
        ];
        let settings = LoaderSettings {
            instance_layers: vec!["GFX_LAYER_env".into()],
            layers_enable: Some("*filtered".into()),
            ..Default::default()
        };
        let out = select(&settings, &MapEnvironment::new(), &["GFX_LAYER_app", "GFX_LAYER_env"], &available).unwrap();
        assert_eq!(names(&out), vec!["GFX_LAYER_imp", "GFX_LAYER_env", "GFX_LAYER_filtered", "GFX_LAYER_app"]);
    }

    #[test]
    fn test_missing_requested_layer_is_not_present() {
        let err = select(&LoaderSettings::default(), &MapEnvironment::new(), &["GFX_LAYER_gone"], &[]).unwrap_err();
        assert!(matches!(err, LayerError::NotPresent(name) if name == "GFX_LAYER_gone"));
    }

    #[test]
    fn test_disable_filter_and_enable_override() {
        let available = vec![
            layer("GFX_LAYER_imp", LayerType::Implicit),
            layer("GFX_LAYER_keep", LayerType::Explicit),
        ];
        let settings = LoaderSettings {
            layers_disable: Some("~all~".into()),
            layers_enable: Some("GFX_LAYER_keep".into()),
            ..Default::default()
        };
        let out = select(&settings, &MapEnvironment::new(), &[], &available).unwrap();
        assert_eq!(names(&out), vec!["GFX_LAYER_keep"]);
    }

    #[test]
    fn test_enable_all_keyword() {
        let available = vec![
            layer("GFX_LAYER_one", LayerType::Explicit),
            layer("GFX_LAYER_two", LayerType::Explicit),
        ];
        let settings = LoaderSettings {
            layers_enable: Some("~all~".into()),
            ..Default::default()
        };
        let out = select(&settings, &MapEnvironment::new(), &[], &available).unwrap();
        assert_eq!(names(&out), vec!["GFX_LAYER_one", "GFX_LAYER_two"]);
    }

    #[test]
    fn test_meta_layer_expansion() {
        let available = vec![
            meta("GFX_LAYER_bundle", &["GFX_LAYER_a", "GFX_LAYER_b"], LayerType::Explicit),
            meta("GFX_LAYER_broken", &["GFX_LAYER_a", "GFX_LAYER_missing"], LayerType::Explicit),
            layer("GFX_LAYER_a", LayerType::Explicit),
            layer("GFX_LAYER_b", LayerType::Explicit),
        ];
        let settings = LoaderSettings::default();
        let out = select(&settings, &MapEnvironment::new(), &["GFX_LAYER_broken", "GFX_LAYER_bundle", "GFX_LAYER_a"], &available).unwrap();
        assert_eq!(names(&out), vec!["GFX_LAYER_a", "GFX_LAYER_b"]);
    }

    #[test]
    fn test_override_layer_blacklist() {
        let mut ovr = meta("GFX_LAYER_override", &["GFX_LAYER_forced"], LayerType::Implicit);
        ovr.blacklisted_layers = vec!["GFX_LAYER_banned".into()];
        let available = vec![
            ovr,
            layer("GFX_LAYER_forced", LayerType::Explicit),
            layer("GFX_LAYER_banned", LayerType::Explicit),
        ];
        let out = select(&LoaderSettings::default(), &MapEnvironment::new(), &["GFX_LAYER_banned"], &available).unwrap();
        assert_eq!(names(&out), vec!["GFX_LAYER_forced"]);
    }

    #[test]
    fn test_unloadable_layer_is_skipped() {
        let available = vec![layer("GFX_LAYER_app", LayerType::Explicit)];
        let settings = LoaderSettings::default();
        let env = MapEnvironment::new();
        let chain = LayerChainBuilder::new(&settings, &env, &NoLibraries, None)
            .build_chain(&["GFX_LAYER_app".to_string()], &available)
            .unwrap();
        assert!(chain.is_empty());
        assert!(!chain.wraps_handles());
    }

    #[test]
    fn test_layer_properties() {
        let mut l = layer("GFX_LAYER_props", LayerType::Explicit);
        l.description = "reports things".into();
        let props = layer_properties(&l);
        assert_eq!(props.name(), "GFX_LAYER_props");
        assert_eq!(props.spec_version, API_VERSION_1_1);
        assert_eq!(from_c_array(&props.description), "reports things");
    }
}
