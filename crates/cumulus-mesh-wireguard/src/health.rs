// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::error::{Result, VpnError};
use cumulus_mesh_common::{BastionConfig, ClusterNetwork, Node};
use cumulus_mesh_remote::{ConnectionConfig, ConnectionManager};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, instrument, warn};

/// How nodes are reached over SSH. Applied uniformly to every node of a
/// cluster.
#[derive(Debug, Clone)]
pub struct SshSettings {
	pub user: String,
	pub port: u16,
	pub identity_file: Option<PathBuf>,
	pub known_hosts_file: Option<PathBuf>,
	pub connect_timeout: Duration,
	pub command_timeout: Duration,
}

impl Default for SshSettings {
	fn default() -> Self {
		Self {
			user: "root".to_string(),
			port: 22,
			identity_file: None,
			known_hosts_file: None,
			connect_timeout: cumulus_mesh_remote::config::DEFAULT_CONNECT_TIMEOUT,
			command_timeout: cumulus_mesh_remote::config::DEFAULT_COMMAND_TIMEOUT,
		}
	}
}

impl SshSettings {
	pub fn connection_for(&self, host: impl Into<String>, bastion: Option<&BastionConfig>) -> ConnectionConfig {
		ConnectionConfig::new(host, self.user.clone())
			.with_port(self.port)
			.with_bastion(bastion.cloned())
			.with_identity_file(self.identity_file.clone())
			.with_known_hosts_file(self.known_hosts_file.clone())
			.with_connect_timeout(self.connect_timeout)
			.with_command_timeout(self.command_timeout)
	}

	pub fn node_connection(&self, node: &Node, bastion: Option<&BastionConfig>) -> ConnectionConfig {
		self.connection_for(node.ssh_address(bastion.is_some()).to_string(), bastion)
	}

	/// Direct connection to the bastion itself, using its own user and port.
	pub fn bastion_connection(&self, bastion: &BastionConfig) -> ConnectionConfig {
		self.connection_for(bastion.host.clone(), None)
			.with_port(bastion.port)
			.with_user(bastion.user.clone())
	}
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeHealth {
	pub name: String,
	pub address: String,
	pub reachable: bool,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub latency_ms: Option<u64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub error: Option<String>,
}

#[derive(Clone)]
pub struct HealthChecker {
	connections: ConnectionManager,
	ssh: SshSettings,
}

impl HealthChecker {
	pub fn new(connections: ConnectionManager, ssh: SshSettings) -> Self {
		Self { connections, ssh }
	}

	pub fn ssh(&self) -> &SshSettings {
		&self.ssh
	}

	/// Fails fast when the cluster's bastion cannot be reached, before any
	/// node is touched. Clusters without a bastion always pass.
	#[instrument(skip(self, network), fields(bastion = ?network.bastion.as_ref().map(|b| &b.host)))]
	pub async fn check_bastion(&self, network: &ClusterNetwork) -> Result<Option<Duration>> {
		let Some(bastion) = network.bastion.as_ref() else {
			return Ok(None);
		};

		match self.connections.probe(&self.ssh.bastion_connection(bastion)).await {
			Ok(latency) => {
				info!(latency_ms = latency.as_millis() as u64, "bastion reachable");
				Ok(Some(latency))
			}
			Err(cause) => Err(VpnError::BastionUnreachable {
				bastion: bastion.host.clone(),
				cause,
			}),
		}
	}

	/// Probes every node concurrently. Never fails; unreachable nodes are
	/// reported in the result.
	#[instrument(skip_all, fields(nodes = nodes.len()))]
	pub async fn probe_nodes(&self, nodes: &[Node], bastion: Option<&BastionConfig>) -> Vec<NodeHealth> {
		let probes = nodes.iter().map(|node| async move {
			let config = self.ssh.node_connection(node, bastion);
			match self.connections.probe(&config).await {
				Ok(latency) => NodeHealth {
					name: node.name.clone(),
					address: config.host,
					reachable: true,
					latency_ms: Some(latency.as_millis() as u64),
					error: None,
				},
				Err(e) => {
					warn!(host = %node.name, error = %e, "node unreachable");
					NodeHealth {
						name: node.name.clone(),
						address: config.host,
						reachable: false,
						latency_ms: None,
						error: Some(e.to_string()),
					}
				}
			}
		});
		futures::future::join_all(probes).await
	}
}
