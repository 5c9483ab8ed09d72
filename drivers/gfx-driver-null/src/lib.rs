/*
 *  gfx-loader Null Driver
 *
 *  A driver library for the gfx-loader that exposes a single CPU
 *  device and accepts every call without doing any work.
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 */

//! # gfx-loader Null Driver
//!
//! Useful for exercising discovery and dispatch on machines without a GPU.
//!
//! ## Features
//!
//! - driver interface version 3 negotiation
//! - one CPU physical device per instance
//! - devices with a single queue family and throwaway command buffers
//!
//! ## Usage
//!
//! Point the loader at a manifest naming the built library:
//!
//! ```json
//! {
//!     "file_format_version": "1.0.0",
//!     "ICD": { "library_path": "./libgfx_driver_null.so", "api_version": "1.0.0" }
//! }
//! ```

mod driver;
mod ffi;

pub use driver::{
    gfx_icdGetInstanceProcAddr,
    gfx_icdGetPhysicalDeviceProcAddr,
    gfx_icdNegotiateLoaderICDInterfaceVersion,
};
