/*
 *  manifest/locator.rs
 *
 *  gfx-loader - worth the squeeze
 *  (c) 2020-26 Stuart Hunter
 *
 *  Manifest locator - enumerates candidate manifest files in priority order
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
use std::fs;
use std::path::{Path, PathBuf};
use log::{debug, trace};

use crate::config::LoaderSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ManifestCategory {
    Driver,
    ExplicitLayer,
    ImplicitLayer,
}

impl ManifestCategory {
    /// Directory below each search root
    pub fn subdir(self) -> &'static str {
        match self {
            Self::Driver => "gfx/icd.d",
            Self::ExplicitLayer => "gfx/explicit_layer.d",
            Self::ImplicitLayer => "gfx/implicit_layer.d",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
    System,
    EnvPrimary,
    EnvAdditional,
    Override,
}

/// One manifest file to try, lower priority value wins
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestCandidate {
    pub source_kind: SourceKind,
    pub path: PathBuf,
    pub priority: usize,
}

/// Manifest locator - searches the configured locations for manifests
pub struct ManifestLocator<'a> {
    settings: &'a LoaderSettings,
    override_paths: Option<Vec<PathBuf>>,
    service_root: Option<PathBuf>,
}

impl<'a> ManifestLocator<'a> {
    pub fn new(settings: &'a LoaderSettings) -> Self {
        Self { settings, override_paths: None, service_root: None }
    }

    /// Search paths supplied by an active override layer
    pub fn with_override_paths(mut self, paths: Vec<PathBuf>) -> Self {
        if !paths.is_empty() {
            self.override_paths = Some(paths);
        }
        self
    }

    /// Manifest filesystem exposed by a discovery service
    pub fn with_service_root(mut self, root: Option<PathBuf>) -> Self {
        self.service_root = root;
        self
    }

    /// Default search directories for a category, in priority order
    pub fn system_dirs(&self, category: ManifestCategory) -> Vec<PathBuf> {
        let mut dirs: Vec<PathBuf> = self.settings
            .search_roots
            .ordered()
            .into_iter()
            .map(|root| root.join(category.subdir()))
            .collect();
        if let Some(root) = self.service_root.as_ref() {
            dirs.push(root.join(category.subdir()));
        }
        dirs
    }

    /// Enumerate candidates for a category. Never fails; missing
    /// directories simply contribute nothing.
    pub fn locate(&self, category: ManifestCategory) -> Vec<ManifestCandidate> {
        let mut sources: Vec<(SourceKind, PathBuf)> = Vec::new();

        match category {
            ManifestCategory::Driver => {
                push_all(&mut sources, SourceKind::EnvAdditional, &self.settings.add_driver_files);
                match self.settings.driver_files.as_ref() {
                    Some(primary) => push_all(&mut sources, SourceKind::EnvPrimary, primary),
                    None => push_all(&mut sources, SourceKind::System, &self.system_dirs(category)),
                }
            }
            ManifestCategory::ExplicitLayer => {
                push_all(&mut sources, SourceKind::EnvAdditional, &self.settings.add_layer_paths);
                if let Some(paths) = self.override_paths.as_ref() {
                    push_all(&mut sources, SourceKind::Override, paths);
                } else if let Some(primary) = self.settings.layer_paths.as_ref() {
                    push_all(&mut sources, SourceKind::EnvPrimary, primary);
                } else {
                    push_all(&mut sources, SourceKind::System, &self.system_dirs(category));
                }
            }
            ManifestCategory::ImplicitLayer => {
                push_all(&mut sources, SourceKind::System, &self.system_dirs(category));
            }
        }

        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for (kind, source) in sources {
            for path in expand(&source) {
                if seen.insert(path.clone()) {
                    trace!("{:?} manifest candidate {}", category, path.display());
                    out.push(ManifestCandidate {
                        source_kind: kind,
                        priority: out.len(),
                        path,
                    });
                }
            }
        }

        debug!("located {} {:?} manifest(s)", out.len(), category);
        out
    }
}

fn push_all(sources: &mut Vec<(SourceKind, PathBuf)>, kind: SourceKind, paths: &[PathBuf]) {
    sources.extend(paths.iter().map(|p| (kind, p.clone())));
}

/// A file yields itself; a directory yields its `*.json` files sorted by name
fn expand(path: &Path) -> Vec<PathBuf> {
    if path.is_file() {
        return vec![path.to_path_buf()];
    }
    let Ok(entries) = fs::read_dir(path) else {
        return Vec::new();
    };
    let mut files: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| p.is_file() && p.extension().is_some_and(|e| e.eq_ignore_ascii_case("json")))
        .collect();
    files.sort();
    files
}
