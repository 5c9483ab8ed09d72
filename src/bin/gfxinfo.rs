/*
 *  bin/gfxinfo.rs
 *
 *  gfx-loader - worth the squeeze
 *  (c) 2020-26 Stuart Hunter
 *
 *  Loader diagnostics: effective settings, manifests, drivers and devices
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

use anyhow::{Context, Result};
use clap::Parser;
use env_logger::Env;
use log::info;

use gfx_loader::api::{version_string, API_VERSION_1_1};
use gfx_loader::config::{self, Cli, ProcessEnvironment};
use gfx_loader::{InstanceRequest, Loader};

include!(concat!(env!("OUT_DIR"), "/build_info.rs"));

fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = config::load(&cli, &ProcessEnvironment).context("loading settings")?;

    let filter = cli.log_level.clone().unwrap_or_else(|| settings.log_filter().to_string());
    env_logger::Builder::from_env(Env::default().default_filter_or(filter))
        .format_timestamp_secs()
        .init();

    info!("This {} worth the Squeeze", env!("CARGO_PKG_NAME"));
    info!("v.{} built {}", env!("CARGO_PKG_VERSION"), BUILD_DATE);

    if cli.dump_config {
        print!("{}", config::dump(&settings)?);
        return Ok(());
    }

    let api_version = match cli.api_version.as_deref() {
        Some(v) => config::parse_api_version(v)
            .with_context(|| format!("api version \"{}\" is not major.minor[.patch]", v))?,
        None => API_VERSION_1_1,
    };

    let loader = Loader::builder()
        .environment(ProcessEnvironment)
        .settings(settings)
        .build();
    Loader::set_global(loader.clone());

    println!("loader interface {}", version_string(loader.instance_version()));

    let manifests = loader.manifests();
    println!("\ndriver manifests ({})", manifests.drivers.len());
    for d in &manifests.drivers {
        println!("  {} -> {} (api {})", d.manifest_path.display(), d.library, version_string(d.api_version));
    }
    println!("\nlayers");
    for l in loader.enumerate_instance_layer_properties() {
        println!(
            "  {:<40} {:?} api {} impl {}  {}",
            l.name,
            l.layer_type,
            version_string(l.api_version),
            l.implementation_version,
            l.description
        );
    }
    println!("\ninstance extensions");
    for e in loader.enumerate_instance_extension_properties(None)? {
        println!("  {:<48} rev {}", e.name, e.spec_version);
    }

    let mut request = InstanceRequest::new(api_version);
    request.application_name = Some("gfxinfo".to_string());
    for layer in &cli.layers {
        request = request.layer(layer);
    }
    for ext in &cli.extensions {
        request = request.extension(ext);
    }
    let instance = loader.create_instance(&request).context("creating instance")?;

    println!("\ndrivers");
    for session in loader.sessions() {
        println!(
            "  #{} {} interface v{} api {}",
            session.id(),
            session.identity(),
            session.interface_version(),
            version_string(session.api_version())
        );
    }
    println!("\nphysical devices (api {})", version_string(instance.api_version()));
    for (i, pd) in instance.physical_devices().iter().enumerate() {
        let p = pd.properties();
        println!(
            "  [{}] {} {:04x}:{:04x} {} api {}",
            i,
            p.name(),
            p.vendor_id,
            p.device_id,
            p.device_type.name(),
            version_string(p.api_version)
        );
    }

    loader.destroy_instance(&instance);
    Ok(())
}
