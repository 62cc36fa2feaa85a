// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Join and leave workflows for WireGuard clusters.

use crate::client_config::ClientConfig;
use crate::config_manager::{ConfigManager, LivePeer};
use crate::error::{HostFailure, RegistryError, Result, VpnError};
use crate::fleet::{apply_to_fleet, FleetOptions, FleetReport, HostOperation, HostTarget};
use crate::health::{HealthChecker, NodeHealth, SshSettings};
use crate::record::{OperationRecord, OperationRecorder, TracingRecorder};
use crate::registry::{Allocation, PeerRegistry};
use chrono::Utc;
use cumulus_common_secret::SecretString;
use cumulus_mesh_common::{
	validate_label, ClusterNetwork, IpRange, MeshMode, Node, RegisteredPeer, WgKeyPair, WgPublicKey,
};
use cumulus_mesh_remote::{Connection, ConnectionManager};
use futures::FutureExt;
use serde::Serialize;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// A cluster as seen by one mesh operation.
#[derive(Debug, Clone)]
pub struct Cluster {
	pub id: String,
	pub network: ClusterNetwork,
	pub nodes: Vec<Node>,
}

#[derive(Debug, Clone, Default)]
pub struct JoinRequest {
	pub label: Option<String>,
	pub vpn_ip: Option<Ipv4Addr>,
	/// Public key of a key pair the caller already holds. A fresh pair is
	/// generated when absent.
	pub public_key: Option<WgPublicKey>,
}

#[derive(Debug)]
pub struct JoinOutcome {
	pub peer: RegisteredPeer,
	pub replaced: Option<RegisteredPeer>,
	pub client_config: ClientConfig,
	pub success_count: usize,
	pub failures: Vec<HostFailure>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaveSelector {
	PublicKey(WgPublicKey),
	Ip(Ipv4Addr),
	Label(String),
}

#[derive(Debug)]
pub struct LeaveOutcome {
	pub public_key: WgPublicKey,
	/// Registry entry that was removed; `None` if the key was not registered.
	pub removed: Option<RegisteredPeer>,
	pub success_count: usize,
	pub failures: Vec<HostFailure>,
}

#[derive(Debug, Serialize)]
pub struct ClusterStatus {
	pub cluster: String,
	pub mode: MeshMode,
	pub subnet: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub bastion: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub bastion_error: Option<String>,
	pub nodes: Vec<NodeHealth>,
	pub peers: Vec<RegisteredPeer>,
}

pub struct VpnManager {
	registry: Arc<PeerRegistry>,
	config: ConfigManager,
	connections: ConnectionManager,
	health: HealthChecker,
	fleet: FleetOptions,
	recorder: Arc<dyn OperationRecorder>,
}

fn ensure_wireguard(cluster: &Cluster) -> Result<()> {
	if cluster.network.mode != MeshMode::WireGuard {
		return Err(VpnError::WrongMode {
			cluster: cluster.id.clone(),
			mode: cluster.network.mode.to_string(),
		});
	}
	if cluster.nodes.is_empty() {
		return Err(VpnError::NoNodes(cluster.id.clone()));
	}
	Ok(())
}

/// Configured reserved ranges plus every node's own mesh address.
fn reserved_ranges(cluster: &Cluster) -> Vec<IpRange> {
	let mut reserved = cluster.network.reserved.clone();
	reserved.extend(cluster.nodes.iter().filter_map(|n| n.mesh_ip).map(IpRange::single));
	reserved
}

impl VpnManager {
	pub fn new(
		registry: Arc<PeerRegistry>,
		config: ConfigManager,
		connections: ConnectionManager,
		ssh: SshSettings,
	) -> Self {
		Self {
			registry,
			config,
			health: HealthChecker::new(connections.clone(), ssh),
			connections,
			fleet: FleetOptions::default(),
			recorder: Arc::new(TracingRecorder),
		}
	}

	pub fn with_fleet_options(mut self, fleet: FleetOptions) -> Self {
		self.fleet = fleet;
		self
	}

	pub fn with_recorder(mut self, recorder: Arc<dyn OperationRecorder>) -> Self {
		self.recorder = recorder;
		self
	}

	pub fn registry(&self) -> &PeerRegistry {
		&self.registry
	}

	pub fn health(&self) -> &HealthChecker {
		&self.health
	}

	fn targets(&self, cluster: &Cluster) -> Vec<HostTarget> {
		let bastion = cluster.network.bastion.as_ref();
		cluster
			.nodes
			.iter()
			.map(|node| HostTarget {
				node: node.clone(),
				config: self.health.ssh().node_connection(node, bastion),
			})
			.collect()
	}

	/// Registers a new peer and installs it on every node of the cluster.
	///
	/// Partial success is success. When no node could be configured the
	/// registry is restored and [`VpnError::AllHostsFailed`] is returned.
	#[instrument(skip(self, cluster, request), fields(cluster = %cluster.id, label = ?request.label))]
	pub async fn join(&self, cluster: &Cluster, request: JoinRequest) -> Result<JoinOutcome> {
		ensure_wireguard(cluster)?;
		if let Some(label) = &request.label {
			validate_label(label)?;
		}
		self.health.check_bastion(&cluster.network).await?;

		let (public_key, private_key): (WgPublicKey, Option<SecretString>) = match request.public_key {
			Some(key) => (key, None),
			None => {
				let pair = WgKeyPair::generate()?;
				(*pair.public_key(), Some(pair.private_key().to_base64()))
			}
		};

		let started_at = Utc::now();
		let allocated = self
			.registry
			.allocate(
				&cluster.id,
				Allocation {
					public_key,
					label: request.label.clone(),
					vpn_ip: request.vpn_ip,
					subnet: cluster.network.subnet,
					reserved: reserved_ranges(cluster),
				},
			)
			.await?;
		let peer = allocated.peer;
		info!(vpn_ip = %peer.vpn_ip, public_key = %peer.public_key.short(), "address allocated");

		let peer_config = peer.to_peer_config(Some(cluster.network.keepalive));
		let config = self.config.clone();
		let op: Box<HostOperation<WgPublicKey>> = Box::new(move |_node: Node, conn: Arc<dyn Connection>| {
			let config = config.clone();
			let peer_config = peer_config.clone();
			async move {
				config.add_peer(conn.as_ref(), &peer_config).await?;
				config.node_public_key(conn.as_ref()).await
			}
			.boxed()
		});

		let mut report = apply_to_fleet("join", &self.connections, self.targets(cluster), &self.fleet, op.as_ref()).await;
		self.recorder
			.record(&OperationRecord::from_report(
				"join",
				&cluster.id,
				started_at,
				&report,
				Some(peer.vpn_ip.to_string()),
			))
			.await;

		if report.is_total_failure() {
			self.rollback_join(&cluster.id, &peer, allocated.replaced).await;
			return Err(VpnError::AllHostsFailed {
				operation: "join".to_string(),
				failures: report.failures,
			});
		}

		report
			.successes
			.sort_by_key(|(node, _)| cluster.nodes.iter().position(|n| n.name == node.name));
		let client_config = ClientConfig::for_nodes(
			peer.vpn_ip,
			private_key,
			report.successes.iter().map(|(node, key)| (node, key)),
			cluster.network.listen_port,
			cluster.network.keepalive,
		);

		Ok(JoinOutcome {
			peer,
			replaced: allocated.replaced,
			client_config,
			success_count: report.success_count(),
			failures: report.failures,
		})
	}

	async fn rollback_join(&self, cluster: &str, peer: &RegisteredPeer, replaced: Option<RegisteredPeer>) {
		if let Err(e) = self.registry.unregister(cluster, &peer.public_key).await {
			warn!(error = %e, "failed to roll back registration");
			return;
		}
		if let Some(previous) = replaced {
			if let Err(e) = self.registry.register(cluster, previous).await {
				warn!(error = %e, "failed to restore replaced registration");
			}
		}
	}

	async fn resolve(&self, cluster: &str, selector: &LeaveSelector) -> Result<(WgPublicKey, Option<RegisteredPeer>)> {
		match selector {
			LeaveSelector::PublicKey(key) => match self.registry.get_by_public_key(cluster, key).await {
				Ok(peer) => Ok((*key, Some(peer))),
				Err(RegistryError::NotFound { .. }) => Ok((*key, None)),
				Err(e) => Err(e.into()),
			},
			LeaveSelector::Ip(ip) => {
				let peer = self.registry.get_by_ip(cluster, *ip).await?;
				Ok((peer.public_key, Some(peer)))
			}
			LeaveSelector::Label(label) => {
				let peer = self.registry.get_by_label(cluster, label).await?;
				Ok((peer.public_key, Some(peer)))
			}
		}
	}

	/// Removes a peer from every node, then from the registry. A key that
	/// was never registered is still removed from the nodes.
	#[instrument(skip(self, cluster), fields(cluster = %cluster.id))]
	pub async fn leave(&self, cluster: &Cluster, selector: LeaveSelector) -> Result<LeaveOutcome> {
		ensure_wireguard(cluster)?;
		let (public_key, registered) = self.resolve(&cluster.id, &selector).await?;
		if registered.is_none() {
			warn!(public_key = %public_key.short(), "key not registered, removing from nodes anyway");
		}
		self.health.check_bastion(&cluster.network).await?;

		let started_at = Utc::now();
		let config = self.config.clone();
		let op: Box<HostOperation<()>> = Box::new(move |_node: Node, conn: Arc<dyn Connection>| {
			let config = config.clone();
			async move { config.remove_peer(conn.as_ref(), &public_key).await }.boxed()
		});
		let report = apply_to_fleet("leave", &self.connections, self.targets(cluster), &self.fleet, op.as_ref()).await;
		self.recorder
			.record(&OperationRecord::from_report(
				"leave",
				&cluster.id,
				started_at,
				&report,
				registered.as_ref().map(|p| p.vpn_ip.to_string()),
			))
			.await;

		if report.is_total_failure() {
			return Err(VpnError::AllHostsFailed {
				operation: "leave".to_string(),
				failures: report.failures,
			});
		}

		let removed = self.registry.unregister(&cluster.id, &public_key).await?;
		Ok(LeaveOutcome {
			public_key,
			removed,
			success_count: report.success_count(),
			failures: report.failures,
		})
	}

	pub async fn peers(&self, cluster: &str) -> Result<Vec<RegisteredPeer>> {
		Ok(self.registry.list(cluster).await?)
	}

	/// Registry contents plus per-node reachability. Never fails on
	/// unreachable hosts; they are reported in the result.
	#[instrument(skip(self, cluster), fields(cluster = %cluster.id))]
	pub async fn status(&self, cluster: &Cluster) -> Result<ClusterStatus> {
		let bastion_error = match self.health.check_bastion(&cluster.network).await {
			Ok(_) => None,
			Err(e) => Some(e.to_string()),
		};
		let nodes = self
			.health
			.probe_nodes(&cluster.nodes, cluster.network.bastion.as_ref())
			.await;
		let peers = self.registry.list(&cluster.id).await?;

		Ok(ClusterStatus {
			cluster: cluster.id.clone(),
			mode: cluster.network.mode,
			subnet: cluster.network.subnet.to_string(),
			bastion: cluster.network.bastion.as_ref().map(|b| b.host.clone()),
			bastion_error,
			nodes,
			peers,
		})
	}

	/// Live peer tables of every node.
	pub async fn live_peers(&self, cluster: &Cluster) -> Result<FleetReport<Vec<LivePeer>>> {
		ensure_wireguard(cluster)?;
		let config = self.config.clone();
		let op: Box<HostOperation<Vec<LivePeer>>> = Box::new(move |_node: Node, conn: Arc<dyn Connection>| {
			let config = config.clone();
			async move { config.live_peers(conn.as_ref()).await }.boxed()
		});
		Ok(apply_to_fleet("inspect", &self.connections, self.targets(cluster), &self.fleet, op.as_ref()).await)
	}
}
