// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::keys::WgPublicKey;
use chrono::{DateTime, Utc};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use thiserror::Error;

pub const DEFAULT_KEEPALIVE: u16 = 25;

const MAX_LABEL_LEN: usize = 63;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PeerError {
	#[error("label must be 1-63 characters, got {0}")]
	LabelLength(usize),

	#[error("label contains invalid character {0:?}; allowed: letters, digits, '.', '_', '-'")]
	LabelCharacter(char),
}

/// Labels end up in remote config comments and shell scripts, so they are
/// restricted to a conservative character set.
pub fn validate_label(label: &str) -> Result<(), PeerError> {
	if label.is_empty() || label.len() > MAX_LABEL_LEN {
		return Err(PeerError::LabelLength(label.len()));
	}
	if let Some(c) = label
		.chars()
		.find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')))
	{
		return Err(PeerError::LabelCharacter(c));
	}
	Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisteredPeer {
	pub public_key: WgPublicKey,
	pub vpn_ip: Ipv4Addr,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub label: Option<String>,
	pub allowed_ips: Vec<Ipv4Net>,
	pub created_at: DateTime<Utc>,
}

impl RegisteredPeer {
	pub fn new(public_key: WgPublicKey, vpn_ip: Ipv4Addr, label: Option<String>) -> Self {
		Self {
			public_key,
			vpn_ip,
			label,
			allowed_ips: vec![Ipv4Net::from(vpn_ip)],
			created_at: Utc::now(),
		}
	}

	pub fn display_name(&self) -> String {
		self.label
			.clone()
			.unwrap_or_else(|| self.public_key.short())
	}

	/// Peer block parameters for installing this peer on a mesh node.
	pub fn to_peer_config(&self, keepalive: Option<u16>) -> PeerConfig {
		PeerConfig {
			public_key: self.public_key,
			allowed_ips: self.allowed_ips.clone(),
			persistent_keepalive: keepalive,
			label: self.label.clone(),
		}
	}
}

/// One `[Peer]` block as written to a node's WireGuard configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
	pub public_key: WgPublicKey,
	pub allowed_ips: Vec<Ipv4Net>,
	#[serde(default)]
	pub persistent_keepalive: Option<u16>,
	#[serde(default)]
	pub label: Option<String>,
}

impl PeerConfig {
	pub fn allowed_ips_string(&self) -> String {
		self.allowed_ips
			.iter()
			.map(|net| net.to_string())
			.collect::<Vec<_>>()
			.join(", ")
	}
}
