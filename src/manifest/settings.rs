/*
 *  manifest/settings.rs
 *
 *  gfx-loader - worth the squeeze
 *  (c) 2020-26 Stuart Hunter
 *
 *  Loader settings file: per-application layer configuration
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

//! Loader settings file
//!
//! A JSON file written by configuration tools, looked up as
//! [`SETTINGS_FILE`] under the user data directory and then the system
//! configuration directory. It holds one settings object or an array of
//! them; an object whose `app_keys` list the running executable wins,
//! otherwise the first object without `app_keys` applies.
//!
//! When the chosen object lists layers it takes over layer discovery:
//! only the listed manifests are used, in the listed order, and
//! discovered layers only appear where an `unordered_layer_location`
//! entry puts them.

use std::fs;
use std::path::{Path, PathBuf};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::config::{Environment, SearchRoots};
use crate::error::ConfigurationError;
use super::record::{self, LayerRecord, LayerType};

/// Location relative to each search root
pub const SETTINGS_FILE: &str = "gfx/loader_settings.d/gfx_loader_settings.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerControl {
    /// Normal enable rules
    Auto,
    /// Always enabled, ignoring the disable filter
    On,
    /// Never enabled
    Off,
    /// Where discovered layers not named in the file go
    UnorderedLayerLocation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerConfiguration {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub path: Option<PathBuf>,
    pub control: LayerControl,
    #[serde(default)]
    pub treat_as_implicit_manifest: bool,
}

/// The settings object that applies to this process
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SettingsFile {
    pub source: Option<PathBuf>,
    pub stderr_log: Vec<String>,
    pub layers: Vec<LayerConfiguration>,
}

impl SettingsFile {
    /// Layers the file switches on regardless of filters
    pub fn forced_layers(&self) -> impl Iterator<Item = &str> {
        self.layers.iter().filter(|l| l.control == LayerControl::On).map(|l| l.name.as_str())
    }

    pub fn configures_layers(&self) -> bool {
        !self.layers.is_empty()
    }

    /// Listed manifests in file order, discovered layers spliced in at the
    /// unordered location or dropped when there is none
    pub fn arrange_layers(&self, discovered: Vec<LayerRecord>) -> Vec<LayerRecord> {
        let named = |name: &str| self.layers.iter().any(|l| l.name == name);
        let mut discovered = Some(discovered);
        let mut out = Vec::new();
        for entry in &self.layers {
            match entry.control {
                LayerControl::Off => debug!("layer {} switched off by settings file", entry.name),
                LayerControl::UnorderedLayerLocation => {
                    if let Some(discovered) = discovered.take() {
                        out.extend(discovered.into_iter().filter(|l| !named(&l.name)));
                    }
                }
                LayerControl::On | LayerControl::Auto => {
                    if let Some(layer) = entry.load() {
                        out.push(layer);
                    }
                }
            }
        }
        out
    }
}

impl LayerConfiguration {
    fn load(&self) -> Option<LayerRecord> {
        let path = self.path.as_ref()?;
        let layer_type = if self.treat_as_implicit_manifest { LayerType::Implicit } else { LayerType::Explicit };
        let layers = match record::load_layer_manifest(path, layer_type) {
            Ok(layers) => layers,
            Err(e) => {
                warn!("settings file layer {}: {}", self.name, e);
                return None;
            }
        };
        let found = layers.into_iter().find(|l| l.name == self.name);
        if found.is_none() {
            warn!("settings file names layer {} but {} does not declare it", self.name, path.display());
        }
        found
    }

    fn is_valid(&self) -> bool {
        self.control == LayerControl::UnorderedLayerLocation || (!self.name.is_empty() && self.path.is_some())
    }
}

#[derive(Deserialize)]
struct RawFile {
    file_format_version: String,
    settings: Option<RawSettings>,
    settings_array: Option<Vec<RawSettings>>,
}

#[derive(Deserialize)]
struct RawSettings {
    #[serde(default)]
    app_keys: Vec<String>,
    #[serde(default)]
    stderr_log: Vec<String>,
    #[serde(default)]
    layers: Vec<LayerConfiguration>,
}

/// Parse a settings file and pick the object for `executable`
pub fn parse(path: &Path, text: &str, executable: Option<&Path>) -> Result<Option<SettingsFile>, ConfigurationError> {
    let raw: RawFile = serde_json::from_str(text)
        .map_err(|source| ConfigurationError::Json { path: path.to_path_buf(), source })?;
    if !raw.file_format_version.starts_with("1.") {
        return Err(ConfigurationError::UnsupportedFormat {
            path: path.to_path_buf(),
            version: raw.file_format_version,
        });
    }

    let all: Vec<RawSettings> = raw.settings_array.or_else(|| raw.settings.map(|s| vec![s])).unwrap_or_default();
    let for_app = executable.and_then(|exe| all.iter().position(|s| s.app_keys.iter().any(|k| Path::new(k) == exe)));
    let Some(index) = for_app.or_else(|| all.iter().position(|s| s.app_keys.is_empty())) else {
        return Ok(None);
    };
    let chosen = &all[index];

    if let Some(bad) = chosen.layers.iter().find(|l| !l.is_valid()) {
        return Err(ConfigurationError::Invalid {
            path: path.to_path_buf(),
            message: format!("layer entry \"{}\" needs both name and path", bad.name),
        });
    }
    Ok(Some(SettingsFile {
        source: Some(path.to_path_buf()),
        stderr_log: chosen.stderr_log.clone(),
        layers: chosen.layers.clone(),
    }))
}

/// Candidate file locations in priority order
pub fn candidates(env: &dyn Environment, roots: &SearchRoots) -> Vec<PathBuf> {
    let mut out = Vec::new();
    if !env.is_elevated() {
        out.extend(roots.data_home.iter().map(|d| d.join(SETTINGS_FILE)));
    }
    out.push(roots.sysconf_dir.join(SETTINGS_FILE));
    out
}

/// First readable settings file that applies to this process
pub fn load(env: &dyn Environment, roots: &SearchRoots) -> Option<SettingsFile> {
    let path = candidates(env, roots).into_iter().find(|p| p.is_file())?;
    let text = match fs::read_to_string(&path) {
        Ok(text) => text,
        Err(e) => {
            warn!("cannot read loader settings {}: {}", path.display(), e);
            return None;
        }
    };
    match parse(&path, &text, env.executable_path().as_deref()) {
        Ok(Some(settings)) => {
            info!("using loader settings from {}", path.display());
            Some(settings)
        }
        Ok(None) => {
            debug!("loader settings {} do not apply to this executable", path.display());
            None
        }
        Err(e) => {
            warn!("ignoring loader settings: {}", e);
            None
        }
    }
}
