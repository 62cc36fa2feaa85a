// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use cumulus_mesh_common::{IpError, KeyError, LockError, PeerError};
use cumulus_mesh_remote::RemoteError;
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RegistryError {
	#[error("public key {public_key} is already registered in cluster {cluster}")]
	DuplicateKey { cluster: String, public_key: String },

	#[error("address {address} is already assigned in cluster {cluster}")]
	DuplicateAddress { cluster: String, address: Ipv4Addr },

	#[error("address {address} is reserved in cluster {cluster}")]
	ReservedAddress { cluster: String, address: Ipv4Addr },

	#[error("no free address left in {subnet} for cluster {cluster}")]
	AddressSpaceExhausted { cluster: String, subnet: Ipv4Net },

	#[error("no peer with {what} in cluster {cluster}")]
	NotFound { cluster: String, what: String },

	#[error("invalid cluster id {0:?}")]
	InvalidCluster(String),

	#[error(transparent)]
	Address(#[from] IpError),

	#[error("registry storage error: {0}")]
	Store(#[from] std::io::Error),

	#[error("registry file {path} is corrupt: {source}")]
	Corrupt {
		path: PathBuf,
		#[source]
		source: serde_json::Error,
	},

	#[error("registry lock: {0}")]
	Lock(#[from] LockError),
}

/// Step of the remote reconfiguration script that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyStage {
	Backup,
	Strip,
	Append,
	Sync,
	Inspect,
	Unknown,
}

impl ApplyStage {
	pub fn as_str(&self) -> &'static str {
		match self {
			ApplyStage::Backup => "backup",
			ApplyStage::Strip => "strip",
			ApplyStage::Append => "append",
			ApplyStage::Sync => "sync",
			ApplyStage::Inspect => "inspect",
			ApplyStage::Unknown => "unknown",
		}
	}
}

impl fmt::Display for ApplyStage {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for ApplyStage {
	type Err = std::convert::Infallible;

	fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
		Ok(match s {
			"backup" => ApplyStage::Backup,
			"strip" => ApplyStage::Strip,
			"append" => ApplyStage::Append,
			"sync" => ApplyStage::Sync,
			"inspect" => ApplyStage::Inspect,
			_ => ApplyStage::Unknown,
		})
	}
}

#[derive(Error, Debug)]
pub enum ApplyCause {
	#[error(transparent)]
	Remote(#[from] RemoteError),

	#[error("unexpected output: {0}")]
	InvalidOutput(String),
}

/// Remote reconfiguration failed on a host that was reachable.
#[derive(Error, Debug)]
#[error("peer change on {host} failed during {stage}: {cause}")]
pub struct PeerApplyError {
	pub host: String,
	pub stage: ApplyStage,
	#[source]
	pub cause: ApplyCause,
}

/// Why one host of a fleet operation failed.
#[derive(Error, Debug)]
pub enum HostError {
	#[error(transparent)]
	Connect(RemoteError),

	#[error(transparent)]
	Apply(#[from] PeerApplyError),

	#[error("gave up after {0:?}")]
	Timeout(Duration),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostFailure {
	pub host: String,
	pub error: String,
	pub unreachable: bool,
}

impl fmt::Display for HostFailure {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}: {}", self.host, self.error)
	}
}

#[derive(Error, Debug)]
pub enum VpnError {
	#[error("bastion {bastion} is unreachable: {cause}")]
	BastionUnreachable {
		bastion: String,
		#[source]
		cause: RemoteError,
	},

	#[error("cluster {cluster} uses {mode} mode, not wireguard")]
	WrongMode { cluster: String, mode: String },

	#[error("cluster {0} has no nodes")]
	NoNodes(String),

	#[error("{operation} failed on all {} host(s): {}", .failures.len(), summarize(.failures))]
	AllHostsFailed {
		operation: String,
		failures: Vec<HostFailure>,
	},

	#[error(transparent)]
	Registry(#[from] RegistryError),

	#[error("key generation failed: {0}")]
	Key(#[from] KeyError),

	#[error("invalid peer: {0}")]
	Peer(#[from] PeerError),
}

fn summarize(failures: &[HostFailure]) -> String {
	failures
		.iter()
		.map(|f| f.to_string())
		.collect::<Vec<_>>()
		.join("; ")
}

pub type Result<T> = std::result::Result<T, VpnError>;
