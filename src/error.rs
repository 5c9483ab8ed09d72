/*
 *  error.rs
 *
 *  gfx-loader - worth the squeeze
 *  (c) 2020-26 Stuart Hunter
 *
 *  Loader error taxonomy and the invalid-handle fail-fast path
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

use std::path::PathBuf;
use log::error;
use thiserror::Error;

use crate::api::GfxResult;

/// Malformed manifest or filter. The candidate is skipped, never fatal.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("I/O error reading {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("JSON parse error in {}: {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("{}: unsupported file_format_version {version}", path.display())]
    UnsupportedFormat { path: PathBuf, version: String },
    #[error("{}: {message}", path.display())]
    Invalid { path: PathBuf, message: String },
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Validation error: {0}")]
    Validation(String),
}

/// A driver that could not be brought into the active set
#[derive(Debug, Error)]
pub enum DriverLoadError {
    #[error("failed to load library {library}: {reason}")]
    LibraryLoadFailed { library: String, reason: String },
    #[error("library {library} does not export required entry point {entry_point}")]
    MissingRequiredEntryPoint { library: String, entry_point: String },
    #[error("interface negotiation with {library} failed: {reason}")]
    InterfaceNegotiationFailed { library: String, reason: String },
}

#[derive(Debug, Error)]
pub enum LayerError {
    #[error("requested layer {0} is not present")]
    NotPresent(String),
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
}

/// Handle with no live registry entry
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("invalid {class} handle 0x{value:x}")]
pub struct InvalidHandle {
    pub class: &'static str,
    pub value: u64,
}

/// Errors surfaced from the loader's public operations
#[derive(Debug, Error)]
pub enum LoaderError {
    #[error(transparent)]
    Layer(#[from] LayerError),
    #[error("no compatible driver found")]
    IncompatibleDriver,
    #[error("extension {0} is not supported by any driver or layer")]
    ExtensionNotPresent(String),
    #[error("driver call {call} failed: {result}")]
    Driver { call: &'static str, result: GfxResult },
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
}

impl LoaderError {
    /// The API result code reported for this failure
    pub fn result(&self) -> GfxResult {
        match self {
            LoaderError::Layer(LayerError::NotPresent(_)) => GfxResult::ERROR_LAYER_NOT_PRESENT,
            LoaderError::Layer(LayerError::Configuration(_)) => GfxResult::ERROR_INITIALIZATION_FAILED,
            LoaderError::IncompatibleDriver => GfxResult::ERROR_INCOMPATIBLE_DRIVER,
            LoaderError::ExtensionNotPresent(_) => GfxResult::ERROR_EXTENSION_NOT_PRESENT,
            LoaderError::Driver { result, .. } => *result,
            LoaderError::Configuration(_) => GfxResult::ERROR_INITIALIZATION_FAILED,
        }
    }
}

/// Report a corrupted or stale handle and abort the process.
///
/// Using an invalid handle is undefined behaviour in the API contract;
/// stopping here keeps the failure observable instead of letting a driver
/// dereference garbage.
pub fn fail_fast(message: &str) -> ! {
    error!("{}", message);
    eprintln!("gfx-loader: {}", message);
    std::process::abort()
}
