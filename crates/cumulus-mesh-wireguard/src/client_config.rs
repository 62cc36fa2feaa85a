// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! wg-quick configuration for a peer that joined a cluster.

use cumulus_common_secret::SecretString;
use cumulus_mesh_common::{Node, WgPublicKey};
use ipnet::Ipv4Net;
use std::fmt::Write as _;
use std::net::{Ipv4Addr, SocketAddr};
use tracing::warn;

pub const PRIVATE_KEY_PLACEHOLDER: &str = "<your-private-key>";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientPeer {
	pub node: String,
	pub public_key: WgPublicKey,
	pub endpoint: SocketAddr,
	pub allowed_ips: Ipv4Net,
	pub persistent_keepalive: u16,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
	pub address: Ipv4Addr,
	/// Absent when the caller supplied its own public key.
	pub private_key: Option<SecretString>,
	pub peers: Vec<ClientPeer>,
}

impl ClientConfig {
	/// One peer per node that reported its key and has a mesh address.
	/// Nodes without a mesh address cannot be routed to and are skipped.
	pub fn for_nodes<'a, I>(
		address: Ipv4Addr,
		private_key: Option<SecretString>,
		nodes: I,
		listen_port: u16,
		keepalive: u16,
	) -> Self
	where
		I: IntoIterator<Item = (&'a Node, &'a WgPublicKey)>,
	{
		let peers = nodes
			.into_iter()
			.filter_map(|(node, public_key)| {
				let Some(mesh_ip) = node.mesh_ip else {
					warn!(host = %node.name, "node has no mesh address, left out of client config");
					return None;
				};
				Some(ClientPeer {
					node: node.name.clone(),
					public_key: *public_key,
					endpoint: SocketAddr::new(node.public_ip, listen_port),
					allowed_ips: Ipv4Net::from(mesh_ip),
					persistent_keepalive: keepalive,
				})
			})
			.collect();

		Self {
			address,
			private_key,
			peers,
		}
	}

	/// Renders the file. Contains the private key in clear when one is set.
	pub fn render(&self) -> String {
		let mut out = String::new();
		let private_key = self
			.private_key
			.as_ref()
			.map(|k| k.expose().as_str())
			.unwrap_or(PRIVATE_KEY_PLACEHOLDER);

		let _ = writeln!(out, "[Interface]");
		let _ = writeln!(out, "PrivateKey = {private_key}");
		let _ = writeln!(out, "Address = {}/32", self.address);

		for peer in &self.peers {
			let _ = writeln!(out);
			let _ = writeln!(out, "# {}", peer.node);
			let _ = writeln!(out, "[Peer]");
			let _ = writeln!(out, "PublicKey = {}", peer.public_key);
			let _ = writeln!(out, "Endpoint = {}", peer.endpoint);
			let _ = writeln!(out, "AllowedIPs = {}", peer.allowed_ips);
			let _ = writeln!(out, "PersistentKeepalive = {}", peer.persistent_keepalive);
		}
		out
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use cumulus_mesh_common::{NodeRole, WgKeyPair};

	fn node(name: &str, public_ip: &str, mesh_ip: Option<&str>) -> Node {
		Node {
			name: name.to_string(),
			provider: "hetzner".to_string(),
			public_ip: public_ip.parse().unwrap(),
			private_ip: None,
			mesh_ip: mesh_ip.map(|ip| ip.parse().unwrap()),
			role: NodeRole::Worker,
		}
	}

	#[test]
	fn renders_one_peer_per_routable_node() {
		let nodes = [
			node("master-1", "203.0.113.1", Some("10.8.0.10")),
			node("worker-1", "203.0.113.2", Some("10.8.0.11")),
			node("pending", "203.0.113.3", None),
		];
		let keys: Vec<WgPublicKey> = nodes
			.iter()
			.map(|_| *WgKeyPair::generate().unwrap().public_key())
			.collect();
		let pair = WgKeyPair::generate().unwrap();

		let config = ClientConfig::for_nodes(
			"10.8.0.100".parse().unwrap(),
			Some(pair.private_key().to_base64()),
			nodes.iter().zip(keys.iter()),
			51820,
			25,
		);
		let rendered = config.render();

		assert_eq!(rendered.matches("[Peer]").count(), 2);
		assert!(rendered.contains("Address = 10.8.0.100/32"));
		assert!(rendered.contains(&format!("PrivateKey = {}", pair.private_key().to_base64().expose())));
		assert!(rendered.contains(&format!("PublicKey = {}", keys[0])));
		assert!(rendered.contains("Endpoint = 203.0.113.2:51820"));
		assert!(rendered.contains("AllowedIPs = 10.8.0.11/32"));
		assert!(rendered.contains("PersistentKeepalive = 25"));
		assert!(!rendered.contains("203.0.113.3"));
	}

	#[test]
	fn placeholder_without_private_key() {
		let config = ClientConfig {
			address: "10.8.0.100".parse().unwrap(),
			private_key: None,
			peers: Vec::new(),
		};
		assert!(config.render().contains(PRIVATE_KEY_PLACEHOLDER));
	}

	#[test]
	fn debug_does_not_leak_private_key() {
		let pair = WgKeyPair::generate().unwrap();
		let config = ClientConfig {
			address: "10.8.0.100".parse().unwrap(),
			private_key: Some(pair.private_key().to_base64()),
			peers: Vec::new(),
		};
		let debug = format!("{config:?}");
		assert!(!debug.contains(pair.private_key().to_base64().expose().as_str()));
	}
}
