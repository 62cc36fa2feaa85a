// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

pub mod mesh;
pub mod vpn;

pub use mesh::MeshCommands;
pub use vpn::VpnCommands;

use crate::config::{CliConfig, Paths};
use console::style;
use cumulus_mesh_wireguard::HostFailure;
use serde::Serialize;

pub struct CliContext {
	pub config: CliConfig,
	pub paths: Paths,
	/// Print machine-readable JSON instead of styled text.
	pub json: bool,
}

impl CliContext {
	pub fn new(config: CliConfig, paths: Paths, json: bool) -> Self {
		Self { config, paths, json }
	}
}

pub(crate) fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
	println!("{}", serde_json::to_string_pretty(value)?);
	Ok(())
}

pub(crate) fn print_failures(failures: &[HostFailure]) {
	for failure in failures {
		let marker = if failure.unreachable {
			style("✗").red().bold()
		} else {
			style("!").yellow().bold()
		};
		eprintln!("  {} {}: {}", marker, style(&failure.host).bold(), failure.error);
	}
}
