/*
 *  manifest/mod.rs
 *
 *  gfx-loader - worth the squeeze
 *  (c) 2020-26 Stuart Hunter
 *
 *  Manifest discovery - locate, parse and filter driver/layer manifests
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

//! Manifest discovery
//!
//! Candidates come from the [`locator`], are parsed into records by
//! [`record`], and drivers are then run through the select/disable
//! [`filter`]. Layer filtering needs the chain context and happens in
//! the layer chain builder.

pub mod filter;
pub mod locator;
pub mod record;
pub mod settings;

use std::collections::HashSet;
use std::path::PathBuf;
use log::{info, warn};

use crate::config::{Environment, LoaderSettings};
use filter::Filter;
use locator::{ManifestCandidate, ManifestCategory, ManifestLocator};

pub use record::{DriverRecord, ExtensionDecl, LayerRecord, LayerType};

/// Everything discovery found, in priority order
#[derive(Debug, Clone, Default)]
pub struct ManifestSet {
    pub drivers: Vec<DriverRecord>,
    pub layers: Vec<LayerRecord>,
}

impl ManifestSet {
    pub fn layer(&self, name: &str) -> Option<&LayerRecord> {
        self.layers.iter().find(|l| l.name == name)
    }
}

/// Run a complete discovery pass
pub fn scan(settings: &LoaderSettings, env: &dyn Environment, service_root: Option<PathBuf>) -> ManifestSet {
    let locator = ManifestLocator::new(settings).with_service_root(service_root.clone());

    let select = Filter::parse_opt(settings.drivers_select.as_deref());
    let disable = Filter::parse_opt(settings.drivers_disable.as_deref());

    let mut drivers = Vec::new();
    for candidate in locator.locate(ManifestCategory::Driver) {
        match record::load_driver_manifest(&candidate.path) {
            Ok(rec) => {
                let verdict = filter::evaluate(&rec.filter_name(), select.as_ref(), disable.as_ref());
                if verdict.is_enabled() {
                    drivers.push(rec);
                } else {
                    info!("driver manifest {} {:?} by filter", candidate.path.display(), verdict);
                }
            }
            Err(e) => warn!("skipping driver manifest: {}", e),
        }
    }

    let implicit = load_layers(locator.locate(ManifestCategory::ImplicitLayer), LayerType::Implicit);

    // an active override layer relocates the explicit layer search
    let override_paths = implicit
        .iter()
        .find(|l| l.is_override() && crate::layer::implicit_layer_active(l, env))
        .map(|l| l.override_paths.clone())
        .unwrap_or_default();

    let explicit_locator = ManifestLocator::new(settings)
        .with_service_root(service_root)
        .with_override_paths(override_paths);
    let explicit = load_layers(explicit_locator.locate(ManifestCategory::ExplicitLayer), LayerType::Explicit);

    let mut names = HashSet::new();
    let mut layers = Vec::new();
    for layer in implicit.into_iter().chain(explicit) {
        if names.insert(layer.name.clone()) {
            layers.push(layer);
        } else {
            warn!(
                "layer {} in {} duplicates an earlier manifest, ignoring",
                layer.name,
                layer.manifest_path.display()
            );
        }
    }

    if let Some(file) = settings.settings_file.as_ref().filter(|f| f.configures_layers()) {
        layers = file.arrange_layers(layers);
    }

    info!("discovered {} driver(s) and {} layer(s)", drivers.len(), layers.len());
    ManifestSet { drivers, layers }
}

fn load_layers(candidates: Vec<ManifestCandidate>, layer_type: LayerType) -> Vec<LayerRecord> {
    let mut out = Vec::new();
    for candidate in candidates {
        match record::load_layer_manifest(&candidate.path, layer_type) {
            Ok(layers) => out.extend(layers),
            Err(e) => warn!("skipping layer manifest: {}", e),
        }
    }
    out
}
