// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
	Master,
	Worker,
}

impl fmt::Display for NodeRole {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			NodeRole::Master => write!(f, "master"),
			NodeRole::Worker => write!(f, "worker"),
		}
	}
}

/// A cluster node as reported by the provisioning system. Read-only for the
/// duration of a mesh operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
	pub name: String,
	pub provider: String,
	pub public_ip: IpAddr,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub private_ip: Option<IpAddr>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub mesh_ip: Option<Ipv4Addr>,
	pub role: NodeRole,
}

impl Node {
	/// Address used to reach the node over SSH. Behind a bastion the private
	/// address is preferred since the public one is often firewalled.
	pub fn ssh_address(&self, via_bastion: bool) -> IpAddr {
		match (via_bastion, self.private_ip) {
			(true, Some(private)) => private,
			_ => self.public_ip,
		}
	}

	pub fn is_master(&self) -> bool {
		self.role == NodeRole::Master
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn node(private_ip: Option<IpAddr>) -> Node {
		Node {
			name: "worker-1".to_string(),
			provider: "hetzner".to_string(),
			public_ip: "203.0.113.7".parse().unwrap(),
			private_ip,
			mesh_ip: None,
			role: NodeRole::Worker,
		}
	}

	#[test]
	fn ssh_address_prefers_private_behind_bastion() {
		let private: IpAddr = "172.16.0.7".parse().unwrap();
		let n = node(Some(private));
		assert_eq!(n.ssh_address(true), private);
		assert_eq!(n.ssh_address(false), n.public_ip);
	}

	#[test]
	fn ssh_address_falls_back_to_public() {
		let n = node(None);
		assert_eq!(n.ssh_address(true), n.public_ip);
	}

	#[test]
	fn deserializes_minimal_node() {
		let n: Node = serde_json::from_str(
			r#"{"name":"master-1","provider":"aws","public_ip":"198.51.100.1","role":"master"}"#,
		)
		.unwrap();
		assert!(n.is_master());
		assert!(n.mesh_ip.is_none());
	}
}
