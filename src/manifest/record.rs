/*
 *  manifest/record.rs
 *
 *  gfx-loader - worth the squeeze
 *  (c) 2020-26 Stuart Hunter
 *
 *  Driver and layer records parsed from JSON manifests
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

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use serde::{Deserialize, Deserializer, Serialize};

use crate::api::API_VERSION_1_0;
use crate::config::parse_api_version;
use crate::driver::library::LibraryIdentity;
use crate::error::ConfigurationError;

/// Name of the meta layer that may force, block and relocate other layers
pub const OVERRIDE_LAYER_NAME: &str = "GFX_LAYER_override";
pub const DEFAULT_ENTRYPOINT_PREFIX: &str = "gfx";

/// Declared extension with its spec version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionDecl {
    pub name: String,
    #[serde(deserialize_with = "string_or_number")]
    pub spec_version: u32,
    #[serde(default)]
    pub entrypoints: Vec<String>,
}

impl ExtensionDecl {
    pub fn new(name: &str, spec_version: u32) -> Self {
        Self { name: name.to_string(), spec_version, entrypoints: Vec::new() }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StringOrNumber {
    Number(u32),
    String(String),
}

fn string_or_number<'de, D: Deserializer<'de>>(d: D) -> Result<u32, D::Error> {
    match StringOrNumber::deserialize(d)? {
        StringOrNumber::Number(n) => Ok(n),
        StringOrNumber::String(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

/// A driver manifest that passed parsing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverRecord {
    pub manifest_path: PathBuf,
    pub library: LibraryIdentity,
    pub api_version: u32,
    pub extensions: Vec<ExtensionDecl>,
}

impl DriverRecord {
    /// File name used by the driver select/disable filters
    pub fn filter_name(&self) -> String {
        self.manifest_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum LayerType {
    Explicit,
    Implicit,
}

/// A layer manifest entry that passed parsing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerRecord {
    pub manifest_path: PathBuf,
    pub name: String,
    pub layer_type: LayerType,
    /// `None` only for meta layers
    pub library: Option<LibraryIdentity>,
    pub api_version: u32,
    pub implementation_version: u32,
    pub description: String,
    pub entrypoint_prefix: String,
    pub instance_extensions: Vec<ExtensionDecl>,
    pub device_extensions: Vec<ExtensionDecl>,
    /// (variable, required value)
    pub enable_environment: Option<(String, String)>,
    pub disable_environment: Option<String>,
    pub component_layers: Vec<String>,
    pub override_paths: Vec<PathBuf>,
    pub blacklisted_layers: Vec<String>,
    pub app_keys: Vec<String>,
    pub requires_handle_wrapping: bool,
}

impl LayerRecord {
    pub fn is_implicit(&self) -> bool {
        self.layer_type == LayerType::Implicit
    }

    pub fn is_meta(&self) -> bool {
        !self.component_layers.is_empty()
    }

    pub fn is_override(&self) -> bool {
        self.is_meta() && self.name == OVERRIDE_LAYER_NAME
    }

    pub fn negotiate_symbol(&self) -> String {
        format!("{}{}", self.entrypoint_prefix, crate::api::LAYER_NEGOTIATE_SUFFIX)
    }
}

#[derive(Deserialize)]
struct RawDriverManifest {
    file_format_version: String,
    #[serde(rename = "ICD")]
    icd: RawDriver,
}

#[derive(Deserialize)]
struct RawDriver {
    library_path: String,
    #[serde(default)]
    api_version: Option<String>,
    #[serde(default)]
    extensions: Vec<ExtensionDecl>,
}

#[derive(Deserialize)]
struct RawLayerManifest {
    file_format_version: String,
    #[serde(default)]
    layer: Option<RawLayer>,
    #[serde(default)]
    layers: Option<Vec<RawLayer>>,
}

#[derive(Deserialize)]
struct RawLayer {
    name: String,
    #[serde(rename = "type")]
    _ty: String,
    #[serde(default)]
    library_path: Option<String>,
    api_version: String,
    #[serde(deserialize_with = "string_or_number")]
    implementation_version: u32,
    #[serde(default)]
    description: String,
    #[serde(default)]
    entrypoint_prefix: Option<String>,
    #[serde(default)]
    instance_extensions: Vec<ExtensionDecl>,
    #[serde(default)]
    device_extensions: Vec<ExtensionDecl>,
    #[serde(default)]
    enable_environment: BTreeMap<String, String>,
    #[serde(default)]
    disable_environment: BTreeMap<String, String>,
    #[serde(default)]
    component_layers: Vec<String>,
    #[serde(default)]
    override_paths: Vec<String>,
    #[serde(default)]
    blacklisted_layers: Vec<String>,
    #[serde(default)]
    app_keys: Vec<String>,
    #[serde(default)]
    requires_handle_wrapping: bool,
}

fn check_format(path: &Path, version: &str) -> Result<(), ConfigurationError> {
    let major = version.split('.').next().and_then(|m| m.trim().parse::<u32>().ok());
    if major != Some(1) {
        return Err(ConfigurationError::UnsupportedFormat {
            path: path.to_path_buf(),
            version: version.to_string(),
        });
    }
    Ok(())
}

fn api_version(path: &Path, value: &str) -> Result<u32, ConfigurationError> {
    parse_api_version(value).ok_or_else(|| ConfigurationError::Invalid {
        path: path.to_path_buf(),
        message: format!("bad api_version \"{}\"", value),
    })
}

fn manifest_dir(path: &Path) -> &Path {
    path.parent().unwrap_or_else(|| Path::new("."))
}

fn read(path: &Path) -> Result<String, ConfigurationError> {
    fs::read_to_string(path).map_err(|source| ConfigurationError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Parse driver manifest text
pub fn parse_driver_manifest(path: &Path, text: &str) -> Result<DriverRecord, ConfigurationError> {
    let raw: RawDriverManifest = serde_json::from_str(text).map_err(|source| ConfigurationError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    check_format(path, &raw.file_format_version)?;

    if raw.icd.library_path.trim().is_empty() {
        return Err(ConfigurationError::Invalid {
            path: path.to_path_buf(),
            message: "empty library_path".into(),
        });
    }

    Ok(DriverRecord {
        manifest_path: path.to_path_buf(),
        library: LibraryIdentity::from_manifest_value(&raw.icd.library_path, manifest_dir(path)),
        api_version: match raw.icd.api_version.as_deref() {
            Some(v) => api_version(path, v)?,
            None => API_VERSION_1_0,
        },
        extensions: raw.icd.extensions,
    })
}

/// Parse layer manifest text; one file may declare several layers
pub fn parse_layer_manifest(
    path: &Path,
    text: &str,
    layer_type: LayerType,
) -> Result<Vec<LayerRecord>, ConfigurationError> {
    let raw: RawLayerManifest = serde_json::from_str(text).map_err(|source| ConfigurationError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    check_format(path, &raw.file_format_version)?;

    let layers: Vec<RawLayer> = match (raw.layer, raw.layers) {
        (_, Some(layers)) => layers,
        (Some(layer), None) => vec![layer],
        (None, None) => {
            return Err(ConfigurationError::Invalid {
                path: path.to_path_buf(),
                message: "neither \"layer\" nor \"layers\" present".into(),
            })
        }
    };

    let dir = manifest_dir(path);
    layers
        .into_iter()
        .map(|l| {
            if l.library_path.is_none() && l.component_layers.is_empty() {
                return Err(ConfigurationError::Invalid {
                    path: path.to_path_buf(),
                    message: format!("layer {} has no library_path", l.name),
                });
            }
            Ok(LayerRecord {
                manifest_path: path.to_path_buf(),
                layer_type,
                library: l.library_path.as_deref().map(|p| LibraryIdentity::from_manifest_value(p, dir)),
                api_version: api_version(path, &l.api_version)?,
                implementation_version: l.implementation_version,
                description: l.description,
                entrypoint_prefix: l.entrypoint_prefix.unwrap_or_else(|| DEFAULT_ENTRYPOINT_PREFIX.to_string()),
                instance_extensions: l.instance_extensions,
                device_extensions: l.device_extensions,
                enable_environment: l.enable_environment.into_iter().next(),
                disable_environment: l.disable_environment.into_keys().next(),
                component_layers: l.component_layers,
                override_paths: l.override_paths.into_iter().map(|p| dir.join(p)).collect(),
                blacklisted_layers: l.blacklisted_layers,
                app_keys: l.app_keys,
                requires_handle_wrapping: l.requires_handle_wrapping,
                name: l.name,
            })
        })
        .collect()
}

pub fn load_driver_manifest(path: &Path) -> Result<DriverRecord, ConfigurationError> {
    parse_driver_manifest(path, &read(path)?)
}

pub fn load_layer_manifest(path: &Path, layer_type: LayerType) -> Result<Vec<LayerRecord>, ConfigurationError> {
    parse_layer_manifest(path, &read(path)?, layer_type)
}
