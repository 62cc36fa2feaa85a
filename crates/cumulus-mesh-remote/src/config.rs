// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use cumulus_mesh_common::BastionConfig;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
	pub host: String,
	pub user: String,
	pub port: u16,
	pub bastion: Option<BastionConfig>,
	pub identity_file: Option<PathBuf>,
	pub known_hosts_file: Option<PathBuf>,
	/// Bounds a single connect handshake, bastion hop included.
	pub connect_timeout: Duration,
	/// Bounds a single `execute` call.
	pub command_timeout: Duration,
}

impl ConnectionConfig {
	pub fn new(host: impl Into<String>, user: impl Into<String>) -> Self {
		Self {
			host: host.into(),
			user: user.into(),
			port: 22,
			bastion: None,
			identity_file: None,
			known_hosts_file: None,
			connect_timeout: DEFAULT_CONNECT_TIMEOUT,
			command_timeout: DEFAULT_COMMAND_TIMEOUT,
		}
	}

	pub fn with_user(mut self, user: impl Into<String>) -> Self {
		self.user = user.into();
		self
	}

	pub fn with_port(mut self, port: u16) -> Self {
		self.port = port;
		self
	}

	pub fn with_bastion(mut self, bastion: Option<BastionConfig>) -> Self {
		self.bastion = bastion;
		self
	}

	pub fn with_identity_file(mut self, identity_file: Option<PathBuf>) -> Self {
		self.identity_file = identity_file;
		self
	}

	pub fn with_known_hosts_file(mut self, known_hosts_file: Option<PathBuf>) -> Self {
		self.known_hosts_file = known_hosts_file;
		self
	}

	pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
		self.connect_timeout = timeout;
		self
	}

	pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
		self.command_timeout = timeout;
		self
	}

	pub fn destination(&self) -> String {
		format!("{}@{}", self.user, self.host)
	}

	pub fn bastion_host(&self) -> Option<&str> {
		self.bastion.as_ref().map(|b| b.host.as_str())
	}
}
