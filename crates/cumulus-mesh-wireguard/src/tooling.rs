// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! The remote host contract: where the mesh configuration lives and which
//! commands dump, reload and identify the interface.

use cumulus_mesh_remote::shell_quote;

pub trait MeshTooling: Send + Sync {
	fn interface(&self) -> &str;

	/// Absolute path of the interface configuration file.
	fn config_path(&self) -> String;

	/// Shell lines that apply the configuration file to the live interface
	/// without tearing down established tunnels.
	fn sync_lines(&self) -> Vec<String>;

	/// Command printing the live peer table.
	fn dump_command(&self) -> String;

	/// Command printing the node's own public key.
	fn public_key_command(&self) -> String;

	/// Whether scripts must run with elevated privileges.
	fn needs_sudo(&self) -> bool;
}

/// `wg` / `wg-quick` layout under `/etc/wireguard`.
#[derive(Debug, Clone)]
pub struct WgQuickTooling {
	interface: String,
	config_dir: String,
	sudo: bool,
}

impl Default for WgQuickTooling {
	fn default() -> Self {
		Self::new("wg0")
	}
}

impl WgQuickTooling {
	pub fn new(interface: impl Into<String>) -> Self {
		Self {
			interface: interface.into(),
			config_dir: "/etc/wireguard".to_string(),
			sudo: true,
		}
	}

	pub fn with_config_dir(mut self, config_dir: impl Into<String>) -> Self {
		self.config_dir = config_dir.into();
		self
	}

	pub fn with_sudo(mut self, sudo: bool) -> Self {
		self.sudo = sudo;
		self
	}

	fn sudo_prefix(&self) -> &'static str {
		if self.sudo {
			"sudo -n "
		} else {
			""
		}
	}
}

impl MeshTooling for WgQuickTooling {
	fn interface(&self) -> &str {
		&self.interface
	}

	fn config_path(&self) -> String {
		format!("{}/{}.conf", self.config_dir.trim_end_matches('/'), self.interface)
	}

	fn sync_lines(&self) -> Vec<String> {
		let iface = shell_quote(&self.interface);
		vec![
			"stripped=$(mktemp)".to_string(),
			format!(
				"if ! wg-quick strip {iface} > \"$stripped\" || ! wg syncconf {iface} \"$stripped\"; then rm -f \"$stripped\"; exit 1; fi"
			),
			"rm -f \"$stripped\"".to_string(),
		]
	}

	fn dump_command(&self) -> String {
		format!("{}wg show {} dump", self.sudo_prefix(), shell_quote(&self.interface))
	}

	fn public_key_command(&self) -> String {
		let key_file = format!("{}/publickey", self.config_dir.trim_end_matches('/'));
		format!(
			"{sudo}cat {file} 2>/dev/null || {sudo}wg show {iface} public-key",
			sudo = self.sudo_prefix(),
			file = shell_quote(&key_file),
			iface = shell_quote(&self.interface),
		)
	}

	fn needs_sudo(&self) -> bool {
		self.sudo
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn default_layout() {
		let tooling = WgQuickTooling::default();
		assert_eq!(tooling.interface(), "wg0");
		assert_eq!(tooling.config_path(), "/etc/wireguard/wg0.conf");
		assert_eq!(tooling.dump_command(), "sudo -n wg show wg0 dump");
		assert!(tooling.needs_sudo());
	}

	#[test]
	fn sync_strips_then_syncs() {
		let lines = WgQuickTooling::new("mesh0").with_sudo(false).sync_lines().join("\n");
		assert!(lines.contains("wg-quick strip mesh0"));
		assert!(lines.contains("wg syncconf mesh0"));
		assert!(!lines.contains("sudo"));
	}

	#[test]
	fn public_key_prefers_key_file() {
		let cmd = WgQuickTooling::new("wg0")
			.with_config_dir("/etc/wireguard/")
			.with_sudo(false)
			.public_key_command();
		assert_eq!(
			cmd,
			"cat /etc/wireguard/publickey 2>/dev/null || wg show wg0 public-key"
		);
	}
}
