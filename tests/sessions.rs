/*
 *  tests/sessions.rs
 *
 *  gfx-loader - worth the squeeze
 *  (c) 2020-26 Stuart Hunter
 *
 *  Driver session caching, negotiation and discovery filtering
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

mod common;

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use common::*;
use gfx_loader::api::*;
use gfx_loader::driver::SessionCache;
use gfx_loader::manifest::DriverRecord;
use gfx_loader::{InstanceRequest, LibraryIdentity, LoaderError};

fn record(manifest: &str, library: &str) -> DriverRecord {
    DriverRecord {
        manifest_path: PathBuf::from(manifest),
        library: LibraryIdentity::Name(library.to_string()),
        api_version: API_VERSION_1_1,
        extensions: Vec::new(),
    }
}

#[test]
fn test_same_identity_same_session() {
    let libs = FakeLibraries::new("same-identity");
    let cache = SessionCache::new();

    let a = cache.get_or_open(&record("/a/modern.json", "libfake_modern.so"), &libs, None).unwrap();
    let b = cache.get_or_open(&record("/b/also_modern.json", "libfake_modern.so"), &libs, None).unwrap();

    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(libs.opens("libfake_modern.so"), 1);
    assert_eq!(cache.sessions().len(), 1);
}

#[test]
fn test_concurrent_opens_share_one_session() {
    let libs = FakeLibraries::new("concurrent");
    let cache = Arc::new(SessionCache::new());

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let cache = cache.clone();
            let libs = libs.clone();
            thread::spawn(move || {
                let library = if i % 2 == 0 { "libfake_modern.so" } else { "libfake_triple.so" };
                cache.get_or_open(&record(&format!("/m/{}.json", i), library), &libs, None).unwrap()
            })
        })
        .collect();
    let sessions: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let modern_identity = LibraryIdentity::Name("libfake_modern.so".into());
    let (modern, triple): (Vec<_>, Vec<_>) = sessions.iter().partition(|s| *s.identity() == modern_identity);
    assert_eq!((modern.len(), triple.len()), (4, 4));
    assert!(modern.iter().all(|s| Arc::ptr_eq(s, modern[0])));
    assert!(triple.iter().all(|s| Arc::ptr_eq(s, triple[0])));
    assert_eq!(libs.opens("libfake_modern.so"), 1);
    assert_eq!(libs.opens("libfake_triple.so"), 1);
}

#[test]
fn test_negotiation_and_driver_version() {
    let libs = FakeLibraries::new("negotiate");
    let cache = SessionCache::new();

    let modern = cache.get_or_open(&record("/m.json", "libfake_modern.so"), &libs, None).unwrap();
    assert_eq!(modern.interface_version(), 3);
    assert_eq!(modern.api_version(), API_VERSION_1_1);
    assert!(modern.supports_extension(KHR_GET_PHYSICAL_DEVICE_PROPERTIES_2));
    assert!(modern.get_physical_device_proc_addr().is_some());

    let legacy = cache.get_or_open(&record("/l.json", "libfake_legacy.so"), &libs, None).unwrap();
    assert_eq!(legacy.interface_version(), 1);
    assert_eq!(legacy.api_version(), API_VERSION_1_0);
    assert!(legacy.get_physical_device_proc_addr().is_none());
    assert_ne!(legacy.id(), modern.id());
}

#[test]
fn test_failed_open_is_not_cached_as_success() {
    let libs = FakeLibraries::new("missing");
    let cache = SessionCache::new();

    assert!(cache.get_or_open(&record("/x.json", "libfake_nowhere.so"), &libs, None).is_err());
    assert!(cache.sessions().is_empty());
}

#[test]
fn test_loader_reuses_sessions_across_instances() {
    let sandbox = Sandbox::new();
    sandbox.driver(MODERN);
    let libs = FakeLibraries::new("reuse");
    let loader = sandbox.loader(&libs);

    let first = loader.create_instance(&InstanceRequest::new(API_VERSION_1_1)).unwrap();
    let second = loader.create_instance(&InstanceRequest::new(API_VERSION_1_1)).unwrap();
    assert_ne!(first.handle(), second.handle());
    assert!(Arc::ptr_eq(first.drivers()[0].session(), second.drivers()[0].session()));
    assert_eq!(libs.opens("libfake_modern.so"), 1);

    loader.destroy_instance(&first);
    loader.destroy_instance(&second);
}

#[test]
fn test_unloadable_drivers_are_skipped() {
    let sandbox = Sandbox::new();
    sandbox.driver(MODERN).driver_library("libfake_nowhere.so");
    let libs = FakeLibraries::new("skip-driver");
    let loader = sandbox.loader(&libs);

    let instance = loader.create_instance(&InstanceRequest::new(API_VERSION_1_1)).unwrap();
    assert_eq!(instance.drivers().len(), 1);
    assert_eq!(libs.opens("libfake_nowhere.so"), 1);
    loader.destroy_instance(&instance);
}

#[test]
fn test_no_loadable_driver_is_incompatible() {
    let sandbox = Sandbox::new();
    sandbox.driver_library("libfake_nowhere.so");
    let loader = sandbox.loader(&FakeLibraries::new("no-driver"));

    let err = loader.create_instance(&InstanceRequest::new(API_VERSION_1_1)).unwrap_err();
    assert!(matches!(err, LoaderError::IncompatibleDriver));
    assert_eq!(err.result(), GfxResult::ERROR_INCOMPATIBLE_DRIVER);
}

#[test]
fn test_every_driver_refusing_is_incompatible() {
    let sandbox = Sandbox::new();
    sandbox.driver(MODERN).driver(LEGACY);
    let loader = sandbox.loader(&FakeLibraries::new("all-refuse"));

    let mut request = InstanceRequest::new(API_VERSION_1_1);
    request.application_name = Some(REFUSED_APPLICATION.to_string());
    let err = loader.create_instance(&request).unwrap_err();
    assert!(matches!(err, LoaderError::IncompatibleDriver));
    assert_eq!(err.result(), GfxResult::ERROR_INCOMPATIBLE_DRIVER);
}

#[test]
fn test_select_overrides_disable() {
    let sandbox = Sandbox::new();
    sandbox.driver(MODERN).driver(LEGACY).driver(TRIPLE);
    let libs = FakeLibraries::new("filters");

    let mut settings = sandbox.settings();
    settings.drivers_disable = Some("*".into());
    settings.drivers_select = Some("*modern*,*triple*".into());
    let loader = sandbox.loader_with(&libs, gfx_loader::MapEnvironment::new(), settings);

    let instance = loader.create_instance(&InstanceRequest::new(API_VERSION_1_1)).unwrap();
    assert_eq!(instance.drivers().len(), 2);
    assert_eq!(instance.physical_devices().len(), 5);
    assert_eq!(libs.opens("libfake_legacy.so"), 0);
    loader.destroy_instance(&instance);
}

#[test]
fn test_unsupported_instance_extension() {
    let sandbox = Sandbox::new();
    sandbox.driver(LEGACY);
    let loader = sandbox.loader(&FakeLibraries::new("bad-extension"));

    let err = loader
        .create_instance(&InstanceRequest::new(API_VERSION_1_0).extension(KHR_DISPLAY))
        .unwrap_err();
    assert_eq!(err.result(), GfxResult::ERROR_EXTENSION_NOT_PRESENT);

    // emulated extensions need no driver support
    let instance = loader
        .create_instance(&InstanceRequest::new(API_VERSION_1_0).extension(KHR_GET_PHYSICAL_DEVICE_PROPERTIES_2))
        .unwrap();
    assert!(instance.is_extension_enabled(KHR_GET_PHYSICAL_DEVICE_PROPERTIES_2));
    loader.destroy_instance(&instance);
}
