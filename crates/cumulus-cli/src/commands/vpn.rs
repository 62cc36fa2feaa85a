// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use super::{print_failures, print_json, CliContext};
use anyhow::Context;
use clap::{ArgGroup, Args, Subcommand};
use console::style;
use cumulus_mesh_common::{get_or_create_key, save_key_file, WgKeyPair, WgPublicKey};
use cumulus_mesh_remote::ConnectionManager;
use cumulus_mesh_wireguard::{
	ConfigManager, FileRegistryStore, JoinRequest, JsonlRecorder, LeaveSelector, PeerRegistry, VpnError, VpnManager,
	WgQuickTooling,
};
use serde::Serialize;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::instrument;

#[derive(Debug, Subcommand)]
pub enum VpnCommands {
	/// Add a peer to every node of a WireGuard cluster
	Join(JoinArgs),
	/// Remove a peer from every node of a WireGuard cluster
	Leave(LeaveArgs),
	/// List registered peers
	Peers(ClusterArg),
	/// Show bastion and node reachability plus registered peers
	Status(StatusArgs),
	/// Generate a WireGuard key pair
	Keygen(KeygenArgs),
}

#[derive(Debug, Clone, Args)]
pub struct ClusterArg {
	/// Cluster id from the config file
	#[arg(long, short = 'c', env = "CUMULUS_CLUSTER")]
	pub cluster: String,
}

#[derive(Debug, Clone, Args)]
pub struct JoinArgs {
	#[command(flatten)]
	pub cluster: ClusterArg,

	/// Human-readable peer name; re-joining with the same label replaces the old entry
	#[arg(long)]
	pub label: Option<String>,

	/// Request a specific mesh address instead of the next free one
	#[arg(long)]
	pub ip: Option<Ipv4Addr>,

	/// Use this public key; the private key stays with its owner
	#[arg(long, conflicts_with = "key_file")]
	pub public_key: Option<WgPublicKey>,

	/// Use (or create) a private key file for this peer
	#[arg(long)]
	pub key_file: Option<PathBuf>,

	/// Write the client configuration here instead of stdout
	#[arg(long, short = 'o')]
	pub output: Option<PathBuf>,
}

#[derive(Debug, Clone, Args)]
#[command(group(ArgGroup::new("peer").required(true).args(["public_key", "ip", "label"])))]
pub struct LeaveArgs {
	#[command(flatten)]
	pub cluster: ClusterArg,

	#[arg(long)]
	pub public_key: Option<WgPublicKey>,

	#[arg(long)]
	pub ip: Option<Ipv4Addr>,

	#[arg(long)]
	pub label: Option<String>,
}

#[derive(Debug, Clone, Args)]
pub struct StatusArgs {
	#[command(flatten)]
	pub cluster: ClusterArg,

	/// Also read the live peer table of every node
	#[arg(long)]
	pub live: bool,
}

#[derive(Debug, Clone, Args)]
pub struct KeygenArgs {
	/// Save the private key to this file (mode 0600) instead of printing it
	#[arg(long, short = 'o')]
	pub output: Option<PathBuf>,
}

pub async fn handle(command: VpnCommands, ctx: &CliContext) -> anyhow::Result<()> {
	match command {
		VpnCommands::Join(args) => handle_join(args, ctx).await,
		VpnCommands::Leave(args) => handle_leave(args, ctx).await,
		VpnCommands::Peers(args) => handle_peers(args, ctx).await,
		VpnCommands::Status(args) => handle_status(args, ctx).await,
		VpnCommands::Keygen(args) => handle_keygen(args, ctx).await,
	}
}

fn vpn_manager(ctx: &CliContext, cluster: &str) -> anyhow::Result<VpnManager> {
	let section = ctx.config.cluster_section(cluster)?;
	let interface = section.interface.clone().unwrap_or_else(|| "wg0".to_string());
	let store = FileRegistryStore::new(ctx.paths.registry_dir());
	let registry = Arc::new(PeerRegistry::new(Arc::new(store)));
	let config = ConfigManager::new(Arc::new(WgQuickTooling::new(interface)));
	let connections = ConnectionManager::ssh(ctx.config.retry_policy());

	Ok(VpnManager::new(registry, config, connections, ctx.config.ssh_settings())
		.with_fleet_options(ctx.config.fleet_options(cluster)?)
		.with_recorder(Arc::new(JsonlRecorder::new(ctx.paths.history_file()))))
}

/// Shows per-host detail before the error itself bubbles up.
fn report_vpn_error(err: VpnError) -> anyhow::Error {
	if let VpnError::AllHostsFailed { failures, .. } = &err {
		print_failures(failures);
	}
	err.into()
}

#[instrument(skip(ctx))]
async fn handle_join(args: JoinArgs, ctx: &CliContext) -> anyhow::Result<()> {
	let cluster_id = args.cluster.cluster.as_str();
	let cluster = ctx.config.wireguard_cluster(cluster_id)?;
	let manager = vpn_manager(ctx, cluster_id)?;

	let local_key = match &args.key_file {
		Some(path) => Some(
			get_or_create_key(path)
				.await
				.with_context(|| format!("loading key file {}", path.display()))?,
		),
		None => None,
	};
	let request = JoinRequest {
		label: args.label.clone(),
		vpn_ip: args.ip,
		public_key: args.public_key.or_else(|| local_key.as_ref().map(|k| *k.public_key())),
	};

	let mut outcome = manager
		.join(&cluster, request)
		.await
		.map_err(report_vpn_error)
		.with_context(|| format!("joining cluster {cluster_id}"))?;
	if let Some(key) = &local_key {
		outcome.client_config.private_key = Some(key.private_key().to_base64());
	}

	let rendered = outcome.client_config.render();
	if ctx.json {
		#[derive(Serialize)]
		struct JoinOutput<'a> {
			peer: &'a cumulus_mesh_common::RegisteredPeer,
			success_count: usize,
			failures: &'a [cumulus_mesh_wireguard::HostFailure],
			client_config: Option<&'a str>,
		}
		print_json(&JoinOutput {
			peer: &outcome.peer,
			success_count: outcome.success_count,
			failures: &outcome.failures,
			client_config: args.output.is_none().then_some(rendered.as_str()),
		})?;
	} else {
		eprintln!(
			"{} Joined {} as {} ({}/{} nodes)",
			style("✓").green().bold(),
			style(cluster_id).cyan(),
			style(outcome.peer.vpn_ip).cyan(),
			outcome.success_count,
			outcome.success_count + outcome.failures.len(),
		);
		eprintln!("  Public key: {}", outcome.peer.public_key);
		if let Some(replaced) = &outcome.replaced {
			eprintln!(
				"  Replaced:   {} ({})",
				replaced.display_name(),
				replaced.vpn_ip
			);
		}
		print_failures(&outcome.failures);
	}

	match &args.output {
		Some(path) => {
			write_private_file(path, &rendered)
				.await
				.with_context(|| format!("writing {}", path.display()))?;
			if !ctx.json {
				eprintln!("  Config:     {}", style(path.display()).cyan());
			}
		}
		None if !ctx.json => print!("{rendered}"),
		None => {}
	}
	Ok(())
}

#[instrument(skip(ctx))]
async fn handle_leave(args: LeaveArgs, ctx: &CliContext) -> anyhow::Result<()> {
	let cluster_id = args.cluster.cluster.as_str();
	let cluster = ctx.config.wireguard_cluster(cluster_id)?;
	let manager = vpn_manager(ctx, cluster_id)?;

	let selector = match (args.public_key, args.ip, args.label) {
		(Some(key), _, _) => LeaveSelector::PublicKey(key),
		(None, Some(ip), _) => LeaveSelector::Ip(ip),
		(None, None, Some(label)) => LeaveSelector::Label(label),
		(None, None, None) => anyhow::bail!("one of --public-key, --ip or --label is required"),
	};

	let outcome = manager
		.leave(&cluster, selector)
		.await
		.map_err(report_vpn_error)
		.with_context(|| format!("leaving cluster {cluster_id}"))?;

	if ctx.json {
		#[derive(Serialize)]
		struct LeaveOutput<'a> {
			public_key: String,
			removed: Option<&'a cumulus_mesh_common::RegisteredPeer>,
			success_count: usize,
			failures: &'a [cumulus_mesh_wireguard::HostFailure],
		}
		return print_json(&LeaveOutput {
			public_key: outcome.public_key.to_base64(),
			removed: outcome.removed.as_ref(),
			success_count: outcome.success_count,
			failures: &outcome.failures,
		});
	}

	let name = outcome
		.removed
		.as_ref()
		.map(|p| format!("{} ({})", p.display_name(), p.vpn_ip))
		.unwrap_or_else(|| outcome.public_key.short());
	println!(
		"{} Removed {} from {} ({}/{} nodes)",
		style("✓").green().bold(),
		style(name).cyan(),
		style(cluster_id).cyan(),
		outcome.success_count,
		outcome.success_count + outcome.failures.len(),
	);
	if outcome.removed.is_none() {
		println!("  {} peer was not in the registry", style("!").yellow().bold());
	}
	print_failures(&outcome.failures);
	Ok(())
}

async fn handle_peers(args: ClusterArg, ctx: &CliContext) -> anyhow::Result<()> {
	let manager = vpn_manager(ctx, &args.cluster)?;
	let peers = manager.peers(&args.cluster).await?;
	if ctx.json {
		return print_json(&peers);
	}
	if peers.is_empty() {
		println!("{} No peers registered in {}", style("!").yellow().bold(), args.cluster);
		return Ok(());
	}
	for peer in &peers {
		println!(
			"{:<16} {:<24} {}",
			style(peer.vpn_ip).cyan(),
			peer.label.as_deref().unwrap_or("-"),
			peer.public_key
		);
	}
	Ok(())
}

#[instrument(skip(ctx))]
async fn handle_status(args: StatusArgs, ctx: &CliContext) -> anyhow::Result<()> {
	let cluster_id = args.cluster.cluster.as_str();
	let cluster = ctx.config.wireguard_cluster(cluster_id)?;
	let manager = vpn_manager(ctx, cluster_id)?;
	let status = manager.status(&cluster).await?;

	let live = if args.live {
		let report = manager.live_peers(&cluster).await?;
		Some(report)
	} else {
		None
	};

	if ctx.json {
		#[derive(Serialize)]
		struct LiveNode {
			node: String,
			peers: usize,
			handshaken: usize,
		}
		#[derive(Serialize)]
		struct StatusOutput<'a> {
			#[serde(flatten)]
			status: &'a cumulus_mesh_wireguard::ClusterStatus,
			#[serde(skip_serializing_if = "Option::is_none")]
			live: Option<Vec<LiveNode>>,
		}
		let live = live.as_ref().map(|report| {
			report
				.successes
				.iter()
				.map(|(node, peers)| LiveNode {
					node: node.name.clone(),
					peers: peers.len(),
					handshaken: peers.iter().filter(|p| p.latest_handshake.is_some()).count(),
				})
				.collect()
		});
		return print_json(&StatusOutput { status: &status, live });
	}

	println!("Cluster:  {} ({})", style(&status.cluster).cyan(), status.mode);
	println!("Subnet:   {}", status.subnet);
	if let Some(bastion) = &status.bastion {
		match &status.bastion_error {
			None => println!("Bastion:  {} {}", bastion, style("reachable").green()),
			Some(e) => println!("Bastion:  {} {} ({e})", bastion, style("unreachable").red()),
		}
	}
	println!("Nodes:");
	for node in &status.nodes {
		let state = if node.reachable {
			style(format!("ok {}ms", node.latency_ms.unwrap_or_default())).green()
		} else {
			style(node.error.clone().unwrap_or_else(|| "unreachable".to_string())).red()
		};
		println!("  {:<16} {:<16} {}", node.name, node.address, state);
	}
	println!("Peers:    {}", status.peers.len());

	if let Some(report) = &live {
		println!("Live peers:");
		for (node, peers) in &report.successes {
			let handshaken = peers.iter().filter(|p| p.latest_handshake.is_some()).count();
			println!("  {:<16} {} peers, {} with handshake", node.name, peers.len(), handshaken);
		}
		print_failures(&report.failures);
	}
	Ok(())
}

async fn handle_keygen(args: KeygenArgs, ctx: &CliContext) -> anyhow::Result<()> {
	let keypair = WgKeyPair::generate().context("generating key pair")?;
	let public_key = keypair.public_key().to_base64();

	match &args.output {
		Some(path) => {
			save_key_file(&keypair, path)
				.await
				.with_context(|| format!("saving key to {}", path.display()))?;
			if ctx.json {
				return print_json(&serde_json::json!({
					"public_key": public_key,
					"private_key_file": path,
				}));
			}
			println!("{} Key saved to {}", style("✓").green().bold(), style(path.display()).cyan());
			println!("  Public key: {public_key}");
		}
		None => {
			let private_key = keypair.private_key().to_base64();
			if ctx.json {
				return print_json(&serde_json::json!({
					"public_key": public_key,
					"private_key": private_key.expose(),
				}));
			}
			println!("PrivateKey = {}", private_key.expose());
			println!("PublicKey = {public_key}");
		}
	}
	Ok(())
}

/// Client configs carry a private key, so they are written owner-only.
async fn write_private_file(path: &Path, contents: &str) -> std::io::Result<()> {
	if let Some(parent) = path.parent() {
		if !parent.as_os_str().is_empty() {
			tokio::fs::create_dir_all(parent).await?;
		}
	}
	let mut options = tokio::fs::OpenOptions::new();
	options.write(true).create(true).truncate(true);
	#[cfg(unix)]
	options.mode(0o600);
	let mut file = options.open(path).await?;
	file.write_all(contents.as_bytes()).await?;
	file.flush().await?;
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use clap::Parser;

	#[derive(Debug, Parser)]
	struct Harness {
		#[command(subcommand)]
		command: VpnCommands,
	}

	#[test]
	fn leave_requires_a_selector() {
		assert!(Harness::try_parse_from(["vpn", "leave", "--cluster", "prod"]).is_err());
		let parsed = Harness::try_parse_from(["vpn", "leave", "--cluster", "prod", "--ip", "10.8.0.100"]).unwrap();
		match parsed.command {
			VpnCommands::Leave(args) => assert_eq!(args.ip, Some(Ipv4Addr::new(10, 8, 0, 100))),
			other => panic!("unexpected command: {other:?}"),
		}
	}

	#[test]
	fn join_rejects_public_key_with_key_file() {
		let key = WgKeyPair::generate().unwrap().public_key().to_base64();
		let result = Harness::try_parse_from([
			"vpn",
			"join",
			"--cluster",
			"prod",
			"--public-key",
			&key,
			"--key-file",
			"/tmp/k",
		]);
		assert!(result.is_err());
	}

	#[test]
	fn join_parses_public_key() {
		let key = WgKeyPair::generate().unwrap();
		let encoded = key.public_key().to_base64();
		let parsed = Harness::try_parse_from(["vpn", "join", "-c", "prod", "--public-key", &encoded, "--label", "laptop"])
			.unwrap();
		match parsed.command {
			VpnCommands::Join(args) => {
				assert_eq!(args.public_key.as_ref(), Some(key.public_key()));
				assert_eq!(args.label.as_deref(), Some("laptop"));
			}
			other => panic!("unexpected command: {other:?}"),
		}
	}

	#[tokio::test]
	async fn client_config_file_is_private() {
		let dir = tempfile::TempDir::new().unwrap();
		let path = dir.path().join("out").join("wg-prod.conf");
		write_private_file(&path, "[Interface]\n").await.unwrap();
		assert_eq!(std::fs::read_to_string(&path).unwrap(), "[Interface]\n");
		#[cfg(unix)]
		{
			use std::os::unix::fs::PermissionsExt;
			assert_eq!(std::fs::metadata(&path).unwrap().permissions().mode() & 0o777, 0o600);
		}
	}

	#[tokio::test]
	async fn rewriting_client_config_replaces_old_contents() {
		let dir = tempfile::TempDir::new().unwrap();
		let path = dir.path().join("wg-prod.conf");
		std::fs::write(&path, "[Interface]\nPrivateKey = stale\nAddress = 10.8.0.100/32\n").unwrap();

		let rendered = "[Interface]\nAddress = 10.8.0.101/32\n";
		write_private_file(&path, rendered).await.unwrap();

		assert_eq!(std::fs::read_to_string(&path).unwrap(), rendered);
	}
}
