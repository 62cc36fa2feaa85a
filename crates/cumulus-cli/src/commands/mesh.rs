// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use super::{print_json, CliContext};
use anyhow::Context;
use clap::{Args, Subcommand};
use console::style;
use cumulus_mesh_tailscale::{
	termination_signal, DaemonController, DaemonError, EmbeddedMeshClient, ForegroundOptions, HeadscaleManager,
	MeshClientConfig, TailscaledBackend, TailscaledConfig, DEFAULT_READY_TIMEOUT, DEFAULT_STOP_GRACE,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument};

#[derive(Debug, Subcommand)]
pub enum MeshCommands {
	/// Join a coordinator-based mesh through the embedded client
	Connect(ConnectArgs),
	/// Stop the mesh daemon for a cluster
	Disconnect(DisconnectArgs),
	/// Show whether the mesh daemon is running
	Status(MeshClusterArg),
	/// Run the mesh daemon in this process (used by `connect`)
	#[command(hide = true)]
	Daemon(DaemonArgs),
}

#[derive(Debug, Clone, Args)]
pub struct MeshClusterArg {
	/// Cluster id from the config file
	#[arg(long, short = 'c', env = "CUMULUS_CLUSTER")]
	pub cluster: String,
}

#[derive(Debug, Clone, Args)]
pub struct ConnectArgs {
	#[command(flatten)]
	pub cluster: MeshClusterArg,

	/// Stay attached; Ctrl+C disconnects
	#[arg(long)]
	pub foreground: bool,

	/// Serve a SOCKS5 proxy on 127.0.0.1 through the mesh (0 picks a free port)
	#[arg(long)]
	pub proxy_port: Option<u16>,

	/// Seconds to wait for a detached daemon to become ready
	#[arg(long, default_value_t = DEFAULT_READY_TIMEOUT.as_secs())]
	pub ready_timeout: u64,
}

#[derive(Debug, Clone, Args)]
pub struct DisconnectArgs {
	#[command(flatten)]
	pub cluster: MeshClusterArg,

	/// Seconds to wait after SIGTERM before sending SIGKILL
	#[arg(long, default_value_t = DEFAULT_STOP_GRACE.as_secs())]
	pub grace: u64,
}

#[derive(Debug, Clone, Args)]
pub struct DaemonArgs {
	#[command(flatten)]
	pub cluster: MeshClusterArg,

	#[arg(long)]
	pub proxy_port: Option<u16>,
}

pub async fn handle(command: MeshCommands, ctx: &CliContext) -> anyhow::Result<()> {
	match command {
		MeshCommands::Connect(args) => handle_connect(args, ctx).await,
		MeshCommands::Disconnect(args) => handle_disconnect(args, ctx).await,
		MeshCommands::Status(args) => handle_status(args, ctx),
		MeshCommands::Daemon(args) => run_daemon(&args.cluster.cluster, args.proxy_port, ctx).await,
	}
}

fn controller(ctx: &CliContext) -> DaemonController {
	DaemonController::new(ctx.paths.run_dir())
}

fn mesh_client(ctx: &CliContext, cluster: &str) -> anyhow::Result<EmbeddedMeshClient> {
	let settings = ctx.config.headscale(cluster, |name| std::env::var(name).ok())?;
	let headscale = HeadscaleManager::new(settings.url.clone(), settings.api_key, settings.user);
	let backend = TailscaledBackend::new(TailscaledConfig::new(ctx.paths.mesh_state_dir(cluster)));
	let config = MeshClientConfig::new(settings.hostname, settings.url);
	Ok(EmbeddedMeshClient::new(Arc::new(backend), Arc::new(headscale), config))
}

#[instrument(skip(ctx))]
async fn handle_connect(args: ConnectArgs, ctx: &CliContext) -> anyhow::Result<()> {
	let cluster = args.cluster.cluster.as_str();
	// Fail on config problems here rather than inside a detached child.
	ctx.config.headscale(cluster, |name| std::env::var(name).ok())?;

	if args.foreground {
		println!("Press Ctrl+C to disconnect...");
		return run_daemon(cluster, args.proxy_port, ctx).await;
	}

	let exe = std::env::current_exe().context("locating the cumulus executable")?;
	let mut command = std::process::Command::new(exe);
	command
		.arg("--config")
		.arg(&ctx.paths.config_file)
		.arg("--json-logs")
		.args(["mesh", "daemon", "--cluster", cluster]);
	if let Some(port) = args.proxy_port {
		command.arg("--proxy-port").arg(port.to_string());
	}

	let controller = controller(ctx);
	let pid = match controller
		.start_detached(cluster, command, Duration::from_secs(args.ready_timeout))
		.await
	{
		Ok(pid) => pid,
		Err(DaemonError::AlreadyRunning { pid, .. }) => {
			println!(
				"{} Mesh daemon for {} is already running (pid {pid})",
				style("!").yellow().bold(),
				style(cluster).cyan()
			);
			return Ok(());
		}
		Err(e) => return Err(e).with_context(|| format!("starting mesh daemon for {cluster}")),
	};

	let status = controller.daemon_status(cluster);
	if ctx.json {
		return print_json(&status);
	}
	println!("{} Mesh connected", style("✓").green().bold());
	println!("  Cluster: {}", style(cluster).cyan());
	println!("  PID:     {pid}");
	if let Some(ip) = status.ready.as_ref().and_then(|r| r.mesh_ip) {
		println!("  Mesh IP: {}", style(ip).cyan());
	}
	if let Some(port) = status.proxy_port {
		println!("  SOCKS5:  {}", style(format!("127.0.0.1:{port}")).cyan());
	}
	println!("  Log:     {}", status.log.display());
	println!("\nRunning in background. Use 'cumulus mesh disconnect -c {cluster}' to stop.");
	Ok(())
}

/// Connects, serves until SIGINT/SIGTERM, then tears down.
async fn run_daemon(cluster: &str, proxy_port: Option<u16>, ctx: &CliContext) -> anyhow::Result<()> {
	let client = mesh_client(ctx, cluster)?;
	let options = ForegroundOptions {
		proxy_port,
		..Default::default()
	};
	info!(cluster, ?proxy_port, "mesh daemon starting");
	controller(ctx)
		.run_foreground(cluster, &client, &options, termination_signal())
		.await
		.with_context(|| format!("mesh daemon for {cluster}"))?;
	info!(cluster, "mesh daemon stopped");
	Ok(())
}

#[instrument(skip(ctx))]
async fn handle_disconnect(args: DisconnectArgs, ctx: &CliContext) -> anyhow::Result<()> {
	let cluster = args.cluster.cluster.as_str();
	let stopped = controller(ctx)
		.stop(cluster, Duration::from_secs(args.grace))
		.await
		.with_context(|| format!("stopping mesh daemon for {cluster}"))?;
	if stopped {
		println!("{} Mesh daemon for {} stopped", style("✓").green().bold(), style(cluster).cyan());
	} else {
		println!("{} No mesh daemon is running for {}", style("!").yellow().bold(), style(cluster).cyan());
	}
	Ok(())
}

fn handle_status(args: MeshClusterArg, ctx: &CliContext) -> anyhow::Result<()> {
	let status = controller(ctx).daemon_status(&args.cluster);
	if ctx.json {
		return print_json(&status);
	}
	if !status.running {
		println!("{} Not running", style("●").dim());
		return Ok(());
	}
	println!("{} Running", style("●").green());
	if let Some(pid) = status.pid {
		println!("  PID:     {pid}");
	}
	if let Some(ready) = &status.ready {
		if let Some(ip) = ready.mesh_ip {
			println!("  Mesh IP: {}", style(ip).cyan());
		}
		println!("  Since:   {}", ready.started_at.format("%Y-%m-%d %H:%M:%S UTC"));
	}
	if let Some(port) = status.proxy_port {
		println!("  SOCKS5:  127.0.0.1:{port}");
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use clap::Parser;

	#[derive(Debug, Parser)]
	struct Harness {
		#[command(subcommand)]
		command: MeshCommands,
	}

	#[test]
	fn connect_defaults() {
		let parsed = Harness::try_parse_from(["mesh", "connect", "-c", "edge"]).unwrap();
		match parsed.command {
			MeshCommands::Connect(args) => {
				assert!(!args.foreground);
				assert_eq!(args.proxy_port, None);
				assert_eq!(args.ready_timeout, DEFAULT_READY_TIMEOUT.as_secs());
			}
			other => panic!("unexpected command: {other:?}"),
		}
	}

	#[test]
	fn proxy_port_zero_is_allowed() {
		let parsed = Harness::try_parse_from(["mesh", "connect", "-c", "edge", "--proxy-port", "0"]).unwrap();
		assert!(matches!(
			parsed.command,
			MeshCommands::Connect(ConnectArgs { proxy_port: Some(0), .. })
		));
	}
}
