// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use clap::{Parser, Subcommand};
use commands::{CliContext, MeshCommands, VpnCommands};
use config::{CliConfig, Paths};
use cumulus_common_version::BuildInfo;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

mod commands;
mod config;

#[derive(Parser, Debug)]
#[command(
	name = "cumulus",
	about = "Manage WireGuard and coordinator-based meshes across a fleet",
	version
)]
struct Cli {
	/// Path to the configuration file
	#[arg(long, global = true, env = "CUMULUS_CONFIG")]
	config: Option<PathBuf>,

	/// Log level used when RUST_LOG is not set
	#[arg(long, global = true, default_value = "info")]
	log_level: String,

	/// Emit logs as JSON lines
	#[arg(long, global = true)]
	json_logs: bool,

	/// Print command output as JSON
	#[arg(long, global = true)]
	json: bool,

	#[command(subcommand)]
	command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
	/// Manage WireGuard peers across a cluster's nodes
	#[command(subcommand)]
	Vpn(VpnCommands),
	/// Connect to a coordinator-based mesh
	#[command(subcommand)]
	Mesh(MeshCommands),
	/// Print build information
	Version,
}

fn init_tracing(level: &str, json: bool) {
	let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| level.into());
	let fmt_layer = if json {
		tracing_subscriber::fmt::layer()
			.json()
			.with_writer(std::io::stderr)
			.boxed()
	} else {
		tracing_subscriber::fmt::layer()
			.with_target(false)
			.with_writer(std::io::stderr)
			.boxed()
	};
	tracing_subscriber::registry().with(fmt_layer).with(filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let cli = Cli::parse();
	init_tracing(&cli.log_level, cli.json_logs);

	if let Command::Version = cli.command {
		let info = BuildInfo::current();
		if cli.json {
			commands::print_json(&info)?;
		} else {
			println!("{info}");
		}
		return Ok(());
	}

	let paths = Paths::resolve(cli.config.as_deref())?;
	let config = CliConfig::load(&paths.config_file, cli.config.is_some())?;
	tracing::debug!(config = %paths.config_file.display(), clusters = config.clusters.len(), "configuration loaded");
	let ctx = CliContext::new(config, paths, cli.json);

	match cli.command {
		Command::Vpn(command) => commands::vpn::handle(command, &ctx).await,
		Command::Mesh(command) => commands::mesh::handle(command, &ctx).await,
		Command::Version => Ok(()),
	}
}
