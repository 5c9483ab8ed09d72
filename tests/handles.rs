/*
 *  tests/handles.rs
 *
 *  gfx-loader - worth the squeeze
 *  (c) 2020-26 Stuart Hunter
 *
 *  Handle translation and the fail-fast path for stale handles
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

use std::ptr;

use common::*;
use gfx_loader::api::*;
use gfx_loader::dispatch::trampoline as gfx;
use gfx_loader::handle::{registry, HandleKind, FIRST_ISSUED};
use gfx_loader::InstanceRequest;

#[test]
fn test_pass_through_handles_are_driver_handles() {
    let sandbox = Sandbox::new();
    sandbox.driver(TRIPLE);
    let loader = sandbox.loader(&FakeLibraries::new("pass-through"));

    let instance = loader.create_instance(&InstanceRequest::new(API_VERSION_1_1)).unwrap();
    for pd in enumerate_physical_devices(instance_handle(&instance)) {
        let native = registry().driver_handle(HandleKind::PhysicalDevice, pd.as_raw()).unwrap();
        assert_eq!(native, pd.as_raw());
    }
    let pd = instance.physical_device_handles()[0];
    let device = create_device(pd, &[]).unwrap();
    let mut queue = Queue::NULL;
    unsafe { gfx::get_device_queue(device, 0, 0, &mut queue) };
    assert_eq!(registry().driver_handle(HandleKind::Queue, queue.as_raw()).unwrap(), queue.as_raw());

    unsafe { gfx::destroy_device(device, ptr::null()) };
    assert!(registry().driver_handle(HandleKind::Queue, queue.as_raw()).is_err());
    loader.destroy_instance(&instance);
}

#[test]
fn test_wrong_kind_is_rejected() {
    let sandbox = Sandbox::new();
    sandbox.driver(MODERN);
    let loader = sandbox.loader(&FakeLibraries::new("wrong-kind"));

    let instance = loader.create_instance(&InstanceRequest::new(API_VERSION_1_1)).unwrap();
    let pd = enumerate_physical_devices(instance_handle(&instance))[0];
    let err = registry().driver_handle(HandleKind::Device, pd.as_raw()).unwrap_err();
    assert_eq!(err.class, "GfxDevice");
    assert!(err.to_string().starts_with("invalid GfxDevice handle"));
    loader.destroy_instance(&instance);
}

#[test]
fn test_concurrent_queue_lookups_share_one_wrapped_value() {
    let sandbox = Sandbox::new();
    sandbox
        .driver(MODERN)
        .explicit_layer(WRAP_LAYER, "libfake_wrap_layer.so", r#", "requires_handle_wrapping": true"#);
    let loader = sandbox.loader(&FakeLibraries::new("concurrent-wrap"));

    let instance = loader.create_instance(&InstanceRequest::new(API_VERSION_1_1).layer(WRAP_LAYER)).unwrap();
    let pd = enumerate_physical_devices(instance_handle(&instance))[0];
    let device = create_device(pd, &[]).unwrap();

    let threads: Vec<_> = (0..8)
        .map(|_| {
            std::thread::spawn(move || {
                let mut queue = Queue::NULL;
                unsafe { gfx::get_device_queue(device, 0, 0, &mut queue) };
                queue
            })
        })
        .collect();
    let queues: Vec<Queue> = threads.into_iter().map(|t| t.join().unwrap()).collect();
    assert!(queues.iter().all(|q| *q == queues[0]));
    assert!(queues[0].as_raw() >= FIRST_ISSUED);

    unsafe { gfx::destroy_device(device, ptr::null()) };
    assert!(registry().driver_handle(HandleKind::Queue, queues[0].as_raw()).is_err());
    loader.destroy_instance(&instance);
}

#[test]
fn test_destroyed_instance_aborts() {
    if !in_abort_child() {
        return expect_abort("test_destroyed_instance_aborts", "Invalid GfxInstance handle");
    }
    let sandbox = Sandbox::new();
    sandbox.driver(MODERN);
    let loader = sandbox.loader(&FakeLibraries::new("destroyed-instance"));
    let instance = loader.create_instance(&InstanceRequest::new(API_VERSION_1_1)).unwrap();
    let handle = instance_handle(&instance);
    loader.destroy_instance(&instance);

    enumerate_physical_devices(handle);
}

#[test]
fn test_bogus_physical_device_aborts() {
    if !in_abort_child() {
        return expect_abort("test_bogus_physical_device_aborts", "Invalid GfxPhysicalDevice handle");
    }
    let _ = logs();
    properties(PhysicalDevice::from_raw(0xdead_0000));
}

#[test]
fn test_queue_of_destroyed_device_aborts() {
    if !in_abort_child() {
        return expect_abort("test_queue_of_destroyed_device_aborts", "Invalid GfxQueue handle");
    }
    let sandbox = Sandbox::new();
    sandbox.driver(MODERN);
    let loader = sandbox.loader(&FakeLibraries::new("stale-queue"));
    let instance = loader.create_instance(&InstanceRequest::new(API_VERSION_1_1)).unwrap();
    let pd = enumerate_physical_devices(instance_handle(&instance))[0];
    let device = create_device(pd, &[]).unwrap();
    let mut queue = Queue::NULL;
    unsafe {
        gfx::get_device_queue(device, 0, 0, &mut queue);
        gfx::destroy_device(device, ptr::null());
        gfx::queue_wait_idle(queue);
    }
}
