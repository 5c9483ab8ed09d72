/*
 *  config.rs
 *
 *  gfx-loader - worth the squeeze
 *  (c) 2020-26 Stuart Hunter
 *
 *  Loader settings: environment variables, optional YAML file, CLI overrides
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

use std::collections::HashMap;
use std::{fs, path::{Path, PathBuf}};
use clap::{ArgAction, Parser, ValueHint};
use log::warn;
use serde::{Deserialize, Serialize};

use crate::error::ConfigurationError;
use crate::manifest::settings::{self, SettingsFile};

pub const ENV_DRIVER_FILES: &str = "GFX_DRIVER_FILES";
pub const ENV_ADD_DRIVER_FILES: &str = "GFX_ADD_DRIVER_FILES";
pub const ENV_LAYER_PATH: &str = "GFX_LAYER_PATH";
pub const ENV_ADD_LAYER_PATH: &str = "GFX_ADD_LAYER_PATH";
pub const ENV_DRIVERS_SELECT: &str = "GFX_LOADER_DRIVERS_SELECT";
pub const ENV_DRIVERS_DISABLE: &str = "GFX_LOADER_DRIVERS_DISABLE";
pub const ENV_LAYERS_ENABLE: &str = "GFX_LOADER_LAYERS_ENABLE";
pub const ENV_LAYERS_DISABLE: &str = "GFX_LOADER_LAYERS_DISABLE";
pub const ENV_INSTANCE_LAYERS: &str = "GFX_INSTANCE_LAYERS";
pub const ENV_DISABLE_SELECT: &str = "GFX_LOADER_DISABLE_SELECT";
pub const ENV_DEVICE_SELECT: &str = "GFX_LOADER_DEVICE_SELECT";
pub const ENV_LOADER_DEBUG: &str = "GFX_LOADER_DEBUG";

/// Source of environment variables and process identity.
///
/// The loader never reads `std::env` directly so tests and embedders can
/// supply their own view of the environment.
pub trait Environment: Send + Sync {
    /// Raw lookup. Empty values are reported as unset.
    fn var(&self, name: &str) -> Option<String>;

    /// Running setuid/setgid or otherwise elevated
    fn is_elevated(&self) -> bool;

    fn home_dir(&self) -> Option<PathBuf>;

    /// Path of the running program, matched against layer `app_keys`
    fn executable_path(&self) -> Option<PathBuf>;

    /// Lookup that ignores the environment entirely when elevated
    fn secure_var(&self, name: &str) -> Option<String> {
        if cfg!(feature = "unsafe-file-search") || !self.is_elevated() {
            self.var(name)
        } else {
            None
        }
    }
}

/// The real process environment
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessEnvironment;

impl Environment for ProcessEnvironment {
    fn var(&self, name: &str) -> Option<String> {
        std::env::var(name).ok().filter(|v| !v.is_empty())
    }

    #[cfg(unix)]
    fn is_elevated(&self) -> bool {
        // SAFETY: the id getters have no preconditions and cannot fail
        unsafe {
            libc::geteuid() != libc::getuid() || libc::getegid() != libc::getgid()
        }
    }

    #[cfg(not(unix))]
    fn is_elevated(&self) -> bool {
        false
    }

    fn home_dir(&self) -> Option<PathBuf> {
        dirs_next::home_dir()
    }

    fn executable_path(&self) -> Option<PathBuf> {
        std::env::current_exe().ok()
    }
}

/// In-memory environment
#[derive(Debug, Default, Clone)]
pub struct MapEnvironment {
    vars: HashMap<String, String>,
    elevated: bool,
    home: Option<PathBuf>,
    executable: Option<PathBuf>,
}

impl MapEnvironment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, name: &str, value: impl Into<String>) -> Self {
        self.vars.insert(name.to_string(), value.into());
        self
    }

    pub fn elevated(mut self, elevated: bool) -> Self {
        self.elevated = elevated;
        self
    }

    pub fn home(mut self, home: impl Into<PathBuf>) -> Self {
        self.home = Some(home.into());
        self
    }

    pub fn executable(mut self, path: impl Into<PathBuf>) -> Self {
        self.executable = Some(path.into());
        self
    }
}

impl Environment for MapEnvironment {
    fn var(&self, name: &str) -> Option<String> {
        self.vars.get(name).filter(|v| !v.is_empty()).cloned()
    }

    fn is_elevated(&self) -> bool {
        self.elevated
    }

    fn home_dir(&self) -> Option<PathBuf> {
        self.home.clone()
    }

    fn executable_path(&self) -> Option<PathBuf> {
        self.executable.clone()
    }
}

/// Non-empty and not "0"/"false"
pub fn is_truthy(value: Option<&str>) -> bool {
    match value {
        None => false,
        Some(v) => {
            let v = v.trim();
            !v.is_empty() && v != "0" && !v.eq_ignore_ascii_case("false")
        }
    }
}

/// Explicit physical device to sort first
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceSelect {
    pub vendor_id: u32,
    pub device_id: u32,
}

impl DeviceSelect {
    /// Parse "vendor:device" with hexadecimal ids, `0x` prefix optional
    pub fn parse(value: &str) -> Option<Self> {
        let (vendor, device) = value.trim().split_once(':')?;
        let hex = |s: &str| {
            let s = s.trim();
            let s = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s);
            u32::from_str_radix(s, 16).ok()
        };
        Some(Self { vendor_id: hex(vendor)?, device_id: hex(device)? })
    }
}

/// Base directories used to compute the default manifest search roots
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SearchRoots {
    pub config_home: Option<PathBuf>,
    pub config_dirs: Vec<PathBuf>,
    pub sysconf_dir: PathBuf,
    pub data_home: Option<PathBuf>,
    pub data_dirs: Vec<PathBuf>,
}

impl Default for SearchRoots {
    fn default() -> Self {
        Self {
            config_home: None,
            config_dirs: vec![PathBuf::from("/etc/xdg")],
            sysconf_dir: PathBuf::from("/etc"),
            data_home: None,
            data_dirs: vec![PathBuf::from("/usr/local/share"), PathBuf::from("/usr/share")],
        }
    }
}

impl SearchRoots {
    pub fn from_environment(env: &dyn Environment) -> Self {
        let home = env.home_dir();
        let defaults = Self::default();

        Self {
            config_home: env.secure_var("XDG_CONFIG_HOME")
                .map(PathBuf::from)
                .or_else(|| home.as_ref().map(|h| h.join(".config"))),
            config_dirs: env.secure_var("XDG_CONFIG_DIRS")
                .map(|v| split_path_list(&v))
                .unwrap_or(defaults.config_dirs),
            sysconf_dir: defaults.sysconf_dir,
            data_home: env.secure_var("XDG_DATA_HOME")
                .map(PathBuf::from)
                .or_else(|| home.as_ref().map(|h| h.join(".local/share"))),
            data_dirs: env.secure_var("XDG_DATA_DIRS")
                .map(|v| split_path_list(&v))
                .unwrap_or(defaults.data_dirs),
        }
    }

    /// Every root in priority order
    pub fn ordered(&self) -> Vec<PathBuf> {
        let mut roots = Vec::new();
        roots.extend(self.config_home.iter().cloned());
        roots.extend(self.config_dirs.iter().cloned());
        roots.push(self.sysconf_dir.clone());
        roots.extend(self.data_home.iter().cloned());
        roots.extend(self.data_dirs.iter().cloned());
        roots
    }
}

/// Effective loader configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct LoaderSettings {
    /// Replaces the system driver search when set
    pub driver_files: Option<Vec<PathBuf>>,
    /// Searched before the system locations
    pub add_driver_files: Vec<PathBuf>,
    /// Replaces the system explicit-layer search when set
    pub layer_paths: Option<Vec<PathBuf>>,
    pub add_layer_paths: Vec<PathBuf>,
    pub drivers_select: Option<String>,
    pub drivers_disable: Option<String>,
    pub layers_enable: Option<String>,
    pub layers_disable: Option<String>,
    /// Explicit layers enabled for every instance
    pub instance_layers: Vec<String>,
    pub disable_device_sort: bool,
    pub device_select: Option<DeviceSelect>,
    pub debug: Option<String>,
    pub search_roots: SearchRoots,
    /// Settings file object chosen for this executable
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settings_file: Option<SettingsFile>,
}

impl LoaderSettings {
    /// Collect settings from the discovery environment variables
    pub fn from_environment(env: &dyn Environment) -> Self {
        let device_select = env.secure_var(ENV_DEVICE_SELECT).and_then(|v| {
            let parsed = DeviceSelect::parse(&v);
            if parsed.is_none() {
                warn!("{} value \"{}\" is not vendor:device, ignoring", ENV_DEVICE_SELECT, v);
            }
            parsed
        });

        let search_roots = SearchRoots::from_environment(env);
        let settings_file = settings::load(env, &search_roots);
        let debug = env.var(ENV_LOADER_DEBUG).or_else(|| {
            settings_file
                .as_ref()
                .filter(|f| !f.stderr_log.is_empty())
                .map(|f| f.stderr_log.join(","))
        });

        Self {
            driver_files: env.secure_var(ENV_DRIVER_FILES).map(|v| split_path_list(&v)),
            add_driver_files: env.secure_var(ENV_ADD_DRIVER_FILES)
                .map(|v| split_path_list(&v))
                .unwrap_or_default(),
            layer_paths: env.secure_var(ENV_LAYER_PATH).map(|v| split_path_list(&v)),
            add_layer_paths: env.secure_var(ENV_ADD_LAYER_PATH)
                .map(|v| split_path_list(&v))
                .unwrap_or_default(),
            drivers_select: env.secure_var(ENV_DRIVERS_SELECT),
            drivers_disable: env.secure_var(ENV_DRIVERS_DISABLE),
            layers_enable: env.secure_var(ENV_LAYERS_ENABLE),
            layers_disable: env.secure_var(ENV_LAYERS_DISABLE),
            instance_layers: env.secure_var(ENV_INSTANCE_LAYERS)
                .map(|v| split_name_list(&v))
                .unwrap_or_default(),
            disable_device_sort: is_truthy(env.var(ENV_DISABLE_SELECT).as_deref()),
            device_select,
            debug,
            search_roots,
            settings_file,
        }
    }

    /// `env_logger` filter derived from the debug setting, most verbose wins
    pub fn log_filter(&self) -> &'static str {
        let Some(debug) = self.debug.as_deref() else {
            return "warn";
        };
        let mut level = 1;
        for token in debug.split(',').map(|t| t.trim().to_ascii_lowercase()) {
            let rank = match token.as_str() {
                "error" => 0,
                "warn" => 1,
                "info" | "perf" | "validation" => 2,
                "debug" | "driver" | "layer" => 3,
                "all" => 4,
                _ => continue,
            };
            level = level.max(rank);
        }
        ["error", "warn", "info", "debug", "trace"][level]
    }
}

fn split_path_list(value: &str) -> Vec<PathBuf> {
    std::env::split_paths(value)
        .filter(|p| !p.as_os_str().is_empty())
        .collect()
}

fn split_name_list(value: &str) -> Vec<String> {
    value.split([':', ','])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// gfxinfo command line. All fields are Options so they layer over the environment.
#[derive(Debug, Parser, Clone, Default)]
#[command(name = "gfxinfo", about = "Graphics loader diagnostics", disable_help_flag = false)]
pub struct Cli {
    /// Path to a YAML settings file merged over the environment
    #[arg(long, value_hint = ValueHint::FilePath)]
    pub config: Option<PathBuf>,
    #[arg(long)]
    pub log_level: Option<String>,
    /// Driver manifest files/directories, replacing the system search
    #[arg(long)]
    pub driver_files: Option<String>,
    /// Explicit layer manifest directories, replacing the system search
    #[arg(long)]
    pub layer_path: Option<String>,
    #[arg(long)]
    pub drivers_select: Option<String>,
    #[arg(long)]
    pub drivers_disable: Option<String>,
    #[arg(long)]
    pub layers_enable: Option<String>,
    #[arg(long)]
    pub layers_disable: Option<String>,
    /// "vendor:device" in hex
    #[arg(long)]
    pub device_select: Option<String>,
    #[arg(long, action = ArgAction::SetTrue)]
    pub disable_device_sort: bool,
    /// Layer to request when creating the probe instance (repeatable)
    #[arg(long = "layer")]
    pub layers: Vec<String>,
    /// Instance extension to request (repeatable)
    #[arg(long = "extension")]
    pub extensions: Vec<String>,
    /// API version to request, e.g. 1.1
    #[arg(long)]
    pub api_version: Option<String>,
    /// dump fully merged settings (after overrides) and exit
    #[arg(long, action = ArgAction::SetTrue)]
    pub dump_config: bool,
}

/// Environment, then YAML file, then CLI overrides, then validate
pub fn load(cli: &Cli, env: &dyn Environment) -> Result<LoaderSettings, ConfigurationError> {
    let mut settings = LoaderSettings::from_environment(env);

    if let Some(p) = cli.config.as_ref() {
        if !p.exists() {
            return Err(ConfigurationError::Validation(format!(
                "Config file not found: {}",
                p.display()
            )));
        }
        let file = read_yaml(p)?;
        merge(&mut settings, file);
    }

    if let Some(v) = cli.device_select.as_deref() {
        if DeviceSelect::parse(v).is_none() {
            return Err(ConfigurationError::Validation(format!(
                "device select \"{}\" must be vendor:device in hex",
                v
            )));
        }
    }

    apply_cli_overrides(&mut settings, cli);
    validate(&settings)?;

    Ok(settings)
}

/// Pretty YAML of the effective settings
pub fn dump(settings: &LoaderSettings) -> Result<String, ConfigurationError> {
    Ok(serde_yaml::to_string(settings)?)
}

fn read_yaml(path: &Path) -> Result<LoaderSettings, ConfigurationError> {
    let s = fs::read_to_string(path).map_err(|source| ConfigurationError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(serde_yaml::from_str(&s)?)
}

/// Shallow merge `src` into `dst`, Option-by-Option.
fn merge(dst: &mut LoaderSettings, src: LoaderSettings) {
    if src.driver_files.is_some()     { dst.driver_files = src.driver_files; }
    if !src.add_driver_files.is_empty() { dst.add_driver_files = src.add_driver_files; }
    if src.layer_paths.is_some()      { dst.layer_paths = src.layer_paths; }
    if !src.add_layer_paths.is_empty() { dst.add_layer_paths = src.add_layer_paths; }
    if src.drivers_select.is_some()   { dst.drivers_select = src.drivers_select; }
    if src.drivers_disable.is_some()  { dst.drivers_disable = src.drivers_disable; }
    if src.layers_enable.is_some()    { dst.layers_enable = src.layers_enable; }
    if src.layers_disable.is_some()   { dst.layers_disable = src.layers_disable; }
    if !src.instance_layers.is_empty() { dst.instance_layers = src.instance_layers; }
    if src.disable_device_sort        { dst.disable_device_sort = true; }
    if src.device_select.is_some()    { dst.device_select = src.device_select; }
    if src.debug.is_some()            { dst.debug = src.debug; }
    if src.search_roots != SearchRoots::default() { dst.search_roots = src.search_roots; }
    if src.settings_file.is_some()    { dst.settings_file = src.settings_file; }
}

fn apply_cli_overrides(settings: &mut LoaderSettings, cli: &Cli) {
    if let Some(v) = cli.driver_files.as_deref()  { settings.driver_files = Some(split_path_list(v)); }
    if let Some(v) = cli.layer_path.as_deref()    { settings.layer_paths = Some(split_path_list(v)); }
    if cli.drivers_select.is_some()   { settings.drivers_select = cli.drivers_select.clone(); }
    if cli.drivers_disable.is_some()  { settings.drivers_disable = cli.drivers_disable.clone(); }
    if cli.layers_enable.is_some()    { settings.layers_enable = cli.layers_enable.clone(); }
    if cli.layers_disable.is_some()   { settings.layers_disable = cli.layers_disable.clone(); }
    if cli.disable_device_sort        { settings.disable_device_sort = true; }
    if cli.log_level.is_some()        { settings.debug = cli.log_level.clone(); }
    if let Some(v) = cli.device_select.as_deref() { settings.device_select = DeviceSelect::parse(v); }
}

fn validate(settings: &LoaderSettings) -> Result<(), ConfigurationError> {
    if let Some(debug) = settings.debug.as_deref() {
        for token in debug.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            match token.to_ascii_lowercase().as_str() {
                "error" | "warn" | "info" | "perf" | "validation" | "debug" | "driver" | "layer" | "all"
                | "trace" => {}
                other => {
                    return Err(ConfigurationError::Validation(format!(
                        "unknown debug level \"{}\"",
                        other
                    )))
                }
            }
        }
    }
    if settings.driver_files.as_ref().is_some_and(|f| f.is_empty()) {
        return Err(ConfigurationError::Validation("driver_files must not be empty".into()));
    }
    Ok(())
}

/// Parse "1", "1.1" or "1.1.0" into a packed API version
pub fn parse_api_version(value: &str) -> Option<u32> {
    let mut parts = value.trim().split('.').map(|p| p.trim().parse::<u32>());
    let major = parts.next()?.ok()?;
    let minor = parts.next().transpose().ok()?.unwrap_or(0);
    let patch = parts.next().transpose().ok()?.unwrap_or(0);
    if parts.next().is_some() || major > 0x7f || minor > 0x3ff || patch > 0xfff {
        return None;
    }
    Some(crate::api::make_api_version(0, major, minor, patch))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secure_var_ignored_when_elevated() {
        let env = MapEnvironment::new()
            .set(ENV_DRIVER_FILES, "/tmp/icd.json")
            .elevated(true);
        assert_eq!(env.var(ENV_DRIVER_FILES).as_deref(), Some("/tmp/icd.json"));
        if cfg!(feature = "unsafe-file-search") {
            assert!(env.secure_var(ENV_DRIVER_FILES).is_some());
        } else {
            assert!(env.secure_var(ENV_DRIVER_FILES).is_none());
            let settings = LoaderSettings::from_environment(&env);
            assert!(settings.driver_files.is_none());
        }
    }

    #[test]
    fn test_settings_from_environment() {
        let env = MapEnvironment::new()
            .home("/home/tester")
            .set(ENV_DRIVER_FILES, "/a/icd.json:/b")
            .set(ENV_INSTANCE_LAYERS, "GFX_LAYER_one:GFX_LAYER_two")
            .set(ENV_DEVICE_SELECT, "10de:1f82")
            .set(ENV_DISABLE_SELECT, "1")
            .set("XDG_DATA_DIRS", "/opt/share");
        let s = LoaderSettings::from_environment(&env);
        assert_eq!(s.driver_files, Some(vec![PathBuf::from("/a/icd.json"), PathBuf::from("/b")]));
        assert_eq!(s.instance_layers, vec!["GFX_LAYER_one", "GFX_LAYER_two"]);
        assert_eq!(s.device_select, Some(DeviceSelect { vendor_id: 0x10de, device_id: 0x1f82 }));
        assert!(s.disable_device_sort);
        assert_eq!(s.search_roots.config_home, Some(PathBuf::from("/home/tester/.config")));
        assert_eq!(s.search_roots.data_dirs, vec![PathBuf::from("/opt/share")]);
    }

    #[test]
    fn test_search_roots_order() {
        let env = MapEnvironment::new().home("/h");
        let roots = SearchRoots::from_environment(&env).ordered();
        assert_eq!(
            roots,
            vec![
                PathBuf::from("/h/.config"),
                PathBuf::from("/etc/xdg"),
                PathBuf::from("/etc"),
                PathBuf::from("/h/.local/share"),
                PathBuf::from("/usr/local/share"),
                PathBuf::from("/usr/share"),
            ]
        );
    }

    #[test]
    fn test_truthy() {
        assert!(is_truthy(Some("1")));
        assert!(is_truthy(Some("yes")));
        assert!(!is_truthy(Some("0")));
        assert!(!is_truthy(Some("FALSE")));
        assert!(!is_truthy(Some("")));
        assert!(!is_truthy(None));
    }

    #[test]
    fn test_settings_file_log_filter_yields_to_environment() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".local/share").join(settings::SETTINGS_FILE);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, r#"{"file_format_version": "1.0.0", "settings": {"stderr_log": ["error", "layer"]}}"#).unwrap();

        let env = MapEnvironment::new().home(dir.path());
        let s = LoaderSettings::from_environment(&env);
        assert_eq!(s.settings_file.as_ref().and_then(|f| f.source.clone()), Some(path));
        assert_eq!(s.debug.as_deref(), Some("error,layer"));
        assert_eq!(s.log_filter(), "debug");

        let s = LoaderSettings::from_environment(&env.set(ENV_LOADER_DEBUG, "warn"));
        assert_eq!(s.debug.as_deref(), Some("warn"));
    }

    #[test]
    fn test_log_filter() {
        let mut s = LoaderSettings::default();
        assert_eq!(s.log_filter(), "warn");
        s.debug = Some("error,info".into());
        assert_eq!(s.log_filter(), "info");
        s.debug = Some("all".into());
        assert_eq!(s.log_filter(), "trace");
    }

    #[test]
    fn test_cli_overrides_and_validation() {
        let env = MapEnvironment::new().set(ENV_DRIVERS_SELECT, "*nvidia*");
        let cli = Cli {
            drivers_select: Some("*intel*".into()),
            disable_device_sort: true,
            ..Default::default()
        };
        let s = load(&cli, &env).unwrap();
        assert_eq!(s.drivers_select.as_deref(), Some("*intel*"));
        assert!(s.disable_device_sort);

        let cli = Cli { log_level: Some("chatty".into()), ..Default::default() };
        assert!(matches!(load(&cli, &env), Err(ConfigurationError::Validation(_))));
    }

    #[test]
    fn test_yaml_file_merge_and_dump() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.yaml");
        fs::write(&path, "layers_disable: \"~implicit~\"\ninstance_layers: [GFX_LAYER_x]\n").unwrap();

        let cli = Cli { config: Some(path), ..Default::default() };
        let s = load(&cli, &MapEnvironment::new()).unwrap();
        assert_eq!(s.layers_disable.as_deref(), Some("~implicit~"));
        assert_eq!(s.instance_layers, vec!["GFX_LAYER_x"]);

        let yaml = dump(&s).unwrap();
        assert!(yaml.contains("layers_disable"));
    }

    #[test]
    fn test_parse_api_version() {
        assert_eq!(parse_api_version("1.1"), Some(crate::api::API_VERSION_1_1));
        assert_eq!(parse_api_version("1.3.0"), Some(crate::api::API_VERSION_1_3));
        assert_eq!(parse_api_version("one"), None);
        assert_eq!(DeviceSelect::parse("0x8086:0x3e92"), Some(DeviceSelect { vendor_id: 0x8086, device_id: 0x3e92 }));
        assert_eq!(DeviceSelect::parse("8086"), None);
    }
}
