// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::ip::IpRange;
use crate::peer::DEFAULT_KEEPALIVE;
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const DEFAULT_LISTEN_PORT: u16 = 51820;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MeshMode {
	#[serde(rename = "wireguard")]
	WireGuard,
	#[serde(rename = "tailscale")]
	Tailscale,
}

impl fmt::Display for MeshMode {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			MeshMode::WireGuard => write!(f, "wireguard"),
			MeshMode::Tailscale => write!(f, "tailscale"),
		}
	}
}

fn default_ssh_port() -> u16 {
	22
}

fn default_listen_port() -> u16 {
	DEFAULT_LISTEN_PORT
}

fn default_keepalive() -> u16 {
	DEFAULT_KEEPALIVE
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BastionConfig {
	pub host: String,
	pub user: String,
	#[serde(default = "default_ssh_port")]
	pub port: u16,
}

impl BastionConfig {
	/// `user@host:port`, the form accepted by `ssh -J`.
	pub fn jump_spec(&self) -> String {
		format!("{}@{}:{}", self.user, self.host, self.port)
	}
}

/// Cluster-level mesh settings supplied by the provisioning system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterNetwork {
	pub mode: MeshMode,
	pub subnet: Ipv4Net,
	#[serde(default)]
	pub reserved: Vec<IpRange>,
	#[serde(default = "default_listen_port")]
	pub listen_port: u16,
	#[serde(default = "default_keepalive")]
	pub keepalive: u16,
	#[serde(default)]
	pub bastion: Option<BastionConfig>,
}

impl ClusterNetwork {
	pub fn wireguard(subnet: Ipv4Net) -> Self {
		Self {
			mode: MeshMode::WireGuard,
			subnet,
			reserved: Vec::new(),
			listen_port: DEFAULT_LISTEN_PORT,
			keepalive: DEFAULT_KEEPALIVE,
			bastion: None,
		}
	}

	pub fn with_reserved(mut self, reserved: Vec<IpRange>) -> Self {
		self.reserved = reserved;
		self
	}

	pub fn with_bastion(mut self, bastion: BastionConfig) -> Self {
		self.bastion = Some(bastion);
		self
	}
}
