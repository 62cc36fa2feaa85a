// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Atomic, idempotent peer changes on a remote WireGuard node.
//!
//! `add_peer` runs one script per host:
//!
//! 1. copy the config to `<cfg>.bak.<timestamp>`, keeping the newest
//!    [`BACKUP_RETENTION`] backups
//! 2. rewrite the config without malformed lines (escape artifacts and stray
//!    heredoc terminators from earlier writers) and without any `[Peer]`
//!    block that claims the same key, address or label
//! 3. append the new `[Peer]` block
//! 4. strip-and-sync the live interface from the file
//!
//! Re-running it converges on exactly one block for the peer.

use crate::error::{ApplyCause, ApplyStage, PeerApplyError};
use crate::script::{failed_stage, RemoteScript};
use crate::tooling::MeshTooling;
use chrono::{DateTime, TimeZone, Utc};
use cumulus_mesh_common::{PeerConfig, WgPublicKey};
use cumulus_mesh_remote::{Connection, RemoteError};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

pub const BACKUP_RETENTION: usize = 5;

/// Drops malformed lines and `[Peer]` blocks matching `$CUMULUS_KEY`,
/// `$CUMULUS_IP` or `$CUMULUS_LABEL` (empty values never match).
const STRIP_AWK: &str = r#"
function flush(   i) {
	if (!drop && n > 0) {
		if (sep) print ""
		for (i = 1; i <= n; i++) print buf[i]
		printed = 1
	}
	n = 0; drop = 0; inpeer = 0; sep = 0
}
function value(line,   v) {
	v = line
	sub(/^[^=]*=[ \t]*/, "", v)
	sub(/[ \t\r]*$/, "", v)
	return v
}
BEGIN { key = ENVIRON["CUMULUS_KEY"]; ip = ENVIRON["CUMULUS_IP"]; label = ENVIRON["CUMULUS_LABEL"] }
/\\n|\\t/ || /^[ \t]*EOF[ \t\r]*$/ { next }
/^[ \t\r]*$/ { next }
/^[ \t]*\[/ {
	flush()
	sep = printed
	if ($0 ~ /^[ \t]*\[Peer\][ \t\r]*$/) inpeer = 1
}
inpeer {
	if (key != "" && $0 ~ /^[ \t]*PublicKey[ \t]*=/ && value($0) == key) drop = 1
	if (ip != "" && $0 ~ /^[ \t]*AllowedIPs[ \t]*=/) {
		m = split(value($0), parts, ",")
		for (j = 1; j <= m; j++) { p = parts[j]; gsub(/[ \t]/, "", p); if (p == ip) drop = 1 }
	}
	if (label != "" && $0 ~ /^[ \t]*#[ \t]*label:/) {
		l = $0; sub(/^[ \t]*#[ \t]*label:[ \t]*/, "", l); sub(/[ \t\r]*$/, "", l)
		if (l == label) drop = 1
	}
	buf[++n] = $0
	next
}
{
	if (sep) { print ""; sep = 0 }
	print
	printed = 1
}
END { flush() }
"#;

/// A `[Peer]` section as written in a node's configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConfiguredPeer {
	pub public_key: Option<WgPublicKey>,
	pub allowed_ips: Vec<String>,
	pub endpoint: Option<String>,
	pub persistent_keepalive: Option<u16>,
	pub label: Option<String>,
}

/// One peer row of `wg show <iface> dump`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LivePeer {
	pub public_key: WgPublicKey,
	pub endpoint: Option<SocketAddr>,
	pub allowed_ips: Vec<String>,
	pub latest_handshake: Option<DateTime<Utc>>,
	pub rx_bytes: u64,
	pub tx_bytes: u64,
	pub persistent_keepalive: Option<u16>,
}

#[derive(Clone)]
pub struct ConfigManager {
	tooling: Arc<dyn MeshTooling>,
}

impl ConfigManager {
	pub fn new(tooling: Arc<dyn MeshTooling>) -> Self {
		Self { tooling }
	}

	pub fn tooling(&self) -> &dyn MeshTooling {
		self.tooling.as_ref()
	}

	fn base_script(&self, key: &str, match_ip: &str, label: &str) -> RemoteScript {
		let backups = BACKUP_RETENTION + 1;
		RemoteScript::new()
			.line("umask 077")
			.assign("cfg", &self.tooling.config_path())
			.assign("key", key)
			.assign("match_ip", match_ip)
			.assign("label", label)
			.stage("backup")
			.line("ts=$(date +%Y%m%d%H%M%S)")
			.line("cp -p \"$cfg\" \"$cfg.bak.$ts\"")
			.line(format!(
				"ls -1t \"$cfg\".bak.* 2>/dev/null | tail -n +{backups} | while IFS= read -r old; do rm -f \"$old\"; done"
			))
			.stage("strip")
			.line(format!(
				"CUMULUS_KEY=\"$key\" CUMULUS_IP=\"$match_ip\" CUMULUS_LABEL=\"$label\" awk '{}' \"$cfg\" > \"$cfg.tmp.$$\"",
				STRIP_AWK.replace('\'', "")
			))
			.line("mv \"$cfg.tmp.$$\" \"$cfg\"")
	}

	pub(crate) fn add_peer_script(&self, peer: &PeerConfig) -> String {
		let match_ip = peer
			.allowed_ips
			.first()
			.map(|net| net.to_string())
			.unwrap_or_default();
		let keepalive = peer
			.persistent_keepalive
			.map(|k| k.to_string())
			.unwrap_or_default();

		self.base_script(
			&peer.public_key.to_base64(),
			&match_ip,
			peer.label.as_deref().unwrap_or(""),
		)
		.assign("allowed", &peer.allowed_ips_string())
		.assign("keepalive", &keepalive)
		.stage("append")
		.line("printf '\\n[Peer]\\n' >> \"$cfg\"")
		.line("if [ -n \"$label\" ]; then printf '# label: %s\\n' \"$label\" >> \"$cfg\"; fi")
		.line("printf 'PublicKey = %s\\n' \"$key\" >> \"$cfg\"")
		.line("printf 'AllowedIPs = %s\\n' \"$allowed\" >> \"$cfg\"")
		.line("if [ -n \"$keepalive\" ]; then printf 'PersistentKeepalive = %s\\n' \"$keepalive\" >> \"$cfg\"; fi")
		.stage("sync")
		.lines(self.tooling.sync_lines())
		.into_command(self.tooling.needs_sudo())
	}

	pub(crate) fn remove_peer_script(&self, public_key: &WgPublicKey) -> String {
		self.base_script(&public_key.to_base64(), "", "")
			.stage("sync")
			.lines(self.tooling.sync_lines())
			.into_command(self.tooling.needs_sudo())
	}

	async fn run(
		&self,
		conn: &dyn Connection,
		command: &str,
		default_stage: ApplyStage,
	) -> Result<String, PeerApplyError> {
		conn.execute(command).await.map_err(|e| {
			let stage = match &e {
				RemoteError::CommandFailed { output, .. } => failed_stage(output)
					.and_then(|s| s.parse().ok())
					.unwrap_or(default_stage),
				_ => default_stage,
			};
			PeerApplyError {
				host: conn.host().to_string(),
				stage,
				cause: ApplyCause::Remote(e),
			}
		})
	}

	/// Installs `peer` on the node, replacing any block with the same key,
	/// first allowed address, or label.
	#[instrument(skip(self, conn, peer), fields(host = %conn.host(), public_key = %peer.public_key.short()))]
	pub async fn add_peer(&self, conn: &dyn Connection, peer: &PeerConfig) -> Result<(), PeerApplyError> {
		let command = self.add_peer_script(peer);
		self.run(conn, &command, ApplyStage::Unknown).await?;
		info!("peer applied");
		Ok(())
	}

	/// Removes every block with `public_key`. Removing an absent peer succeeds.
	#[instrument(skip(self, conn), fields(host = %conn.host(), public_key = %public_key.short()))]
	pub async fn remove_peer(&self, conn: &dyn Connection, public_key: &WgPublicKey) -> Result<(), PeerApplyError> {
		let command = self.remove_peer_script(public_key);
		self.run(conn, &command, ApplyStage::Unknown).await?;
		info!("peer removed");
		Ok(())
	}

	#[instrument(skip(self, conn), fields(host = %conn.host()))]
	pub async fn node_public_key(&self, conn: &dyn Connection) -> Result<WgPublicKey, PeerApplyError> {
		let output = self
			.run(conn, &self.tooling.public_key_command(), ApplyStage::Inspect)
			.await?;
		let candidate = output.lines().map(str::trim).rfind(|l| !l.is_empty()).unwrap_or("");
		WgPublicKey::from_base64(candidate).map_err(|e| PeerApplyError {
			host: conn.host().to_string(),
			stage: ApplyStage::Inspect,
			cause: ApplyCause::InvalidOutput(format!("public key: {e}")),
		})
	}

	#[instrument(skip(self, conn), fields(host = %conn.host()))]
	pub async fn live_peers(&self, conn: &dyn Connection) -> Result<Vec<LivePeer>, PeerApplyError> {
		let output = self
			.run(conn, &self.tooling.dump_command(), ApplyStage::Inspect)
			.await?;
		Ok(parse_dump(&output))
	}

	#[instrument(skip(self, conn), fields(host = %conn.host()))]
	pub async fn configured_peers(&self, conn: &dyn Connection) -> Result<Vec<ConfiguredPeer>, PeerApplyError> {
		let command = RemoteScript::new()
			.assign("cfg", &self.tooling.config_path())
			.stage("inspect")
			.line("cat \"$cfg\"")
			.into_command(self.tooling.needs_sudo());
		let output = self.run(conn, &command, ApplyStage::Inspect).await?;
		Ok(parse_config_peers(&output))
	}
}

/// Parses the `[Peer]` sections of a wg-quick configuration file.
pub fn parse_config_peers(config: &str) -> Vec<ConfiguredPeer> {
	let mut peers = Vec::new();
	let mut current: Option<ConfiguredPeer> = None;

	for raw in config.lines() {
		let line = raw.trim();
		if line.starts_with('[') {
			if let Some(peer) = current.take() {
				peers.push(peer);
			}
			if line.eq_ignore_ascii_case("[peer]") {
				current = Some(ConfiguredPeer::default());
			}
			continue;
		}

		let Some(peer) = current.as_mut() else {
			continue;
		};

		if let Some(comment) = line.strip_prefix('#') {
			if let Some(label) = comment.trim().strip_prefix("label:") {
				peer.label = Some(label.trim().to_string());
			}
			continue;
		}

		let Some((name, value)) = line.split_once('=') else {
			continue;
		};
		let value = value.trim();
		match name.trim().to_ascii_lowercase().as_str() {
			"publickey" => match WgPublicKey::from_base64(value) {
				Ok(key) => peer.public_key = Some(key),
				Err(e) => warn!(error = %e, "ignoring unparsable PublicKey in config"),
			},
			"allowedips" => {
				peer.allowed_ips.extend(
					value
						.split(',')
						.map(str::trim)
						.filter(|s| !s.is_empty())
						.map(str::to_string),
				);
			}
			"endpoint" => peer.endpoint = Some(value.to_string()),
			"persistentkeepalive" => peer.persistent_keepalive = value.parse().ok(),
			_ => {}
		}
	}

	if let Some(peer) = current {
		peers.push(peer);
	}
	peers
}

/// Parses peer rows of `wg show <iface> dump`. The first row describes the
/// interface itself and is skipped.
pub fn parse_dump(dump: &str) -> Vec<LivePeer> {
	dump.lines()
		.filter_map(|line| {
			let fields: Vec<&str> = line.split('\t').collect();
			if fields.len() != 8 {
				return None;
			}
			let public_key = match WgPublicKey::from_base64(fields[0]) {
				Ok(key) => key,
				Err(e) => {
					debug!(error = %e, "skipping dump row with bad key");
					return None;
				}
			};
			let handshake: i64 = fields[4].parse().unwrap_or(0);
			Some(LivePeer {
				public_key,
				endpoint: fields[2].parse().ok(),
				allowed_ips: fields[3]
					.split(',')
					.filter(|s| !s.is_empty() && *s != "(none)")
					.map(str::to_string)
					.collect(),
				latest_handshake: (handshake > 0)
					.then(|| Utc.timestamp_opt(handshake, 0).single())
					.flatten(),
				rx_bytes: fields[5].parse().unwrap_or(0),
				tx_bytes: fields[6].parse().unwrap_or(0),
				persistent_keepalive: fields[7].parse().ok(),
			})
		})
		.collect()
}

#[cfg(test)]
mod tests {
	use super::*;
	use cumulus_mesh_common::{WgKeyPair, DEFAULT_KEEPALIVE};
	use cumulus_mesh_remote::testing::LocalShellConnection;
	use cumulus_mesh_remote::shell_quote;
	use std::path::{Path, PathBuf};
	use tempfile::TempDir;

	/// Points at a local file and treats sync as a no-op.
	struct FileTooling {
		path: PathBuf,
		sync_fails: bool,
	}

	impl MeshTooling for FileTooling {
		fn interface(&self) -> &str {
			"wg0"
		}

		fn config_path(&self) -> String {
			self.path.display().to_string()
		}

		fn sync_lines(&self) -> Vec<String> {
			vec![if self.sync_fails { "false" } else { "true" }.to_string()]
		}

		fn dump_command(&self) -> String {
			format!("cat {}", shell_quote(&format!("{}.dump", self.path.display())))
		}

		fn public_key_command(&self) -> String {
			format!("cat {}", shell_quote(&format!("{}.pub", self.path.display())))
		}

		fn needs_sudo(&self) -> bool {
			false
		}
	}

	const INTERFACE: &str = "[Interface]\nAddress = 10.8.0.1/24\nListenPort = 51820\nPrivateKey = cHJpdmF0ZQ==\n";

	fn setup(initial: &str) -> (TempDir, PathBuf, ConfigManager) {
		let dir = TempDir::new().unwrap();
		let path = dir.path().join("wg0.conf");
		std::fs::write(&path, initial).unwrap();
		let manager = ConfigManager::new(Arc::new(FileTooling {
			path: path.clone(),
			sync_fails: false,
		}));
		(dir, path, manager)
	}

	fn peer(label: Option<&str>, ip: &str) -> PeerConfig {
		PeerConfig {
			public_key: *WgKeyPair::generate().unwrap().public_key(),
			allowed_ips: vec![format!("{ip}/32").parse().unwrap()],
			persistent_keepalive: Some(DEFAULT_KEEPALIVE),
			label: label.map(str::to_string),
		}
	}

	fn blocks_for(path: &Path, key: &WgPublicKey) -> usize {
		let content = std::fs::read_to_string(path).unwrap();
		parse_config_peers(&content)
			.iter()
			.filter(|p| p.public_key.as_ref() == Some(key))
			.count()
	}

	fn backups(dir: &Path) -> usize {
		std::fs::read_dir(dir)
			.unwrap()
			.filter(|e| {
				e.as_ref()
					.unwrap()
					.file_name()
					.to_string_lossy()
					.starts_with("wg0.conf.bak.")
			})
			.count()
	}

	#[tokio::test]
	async fn add_peer_twice_leaves_one_block() {
		let (_dir, path, manager) = setup(INTERFACE);
		let conn = LocalShellConnection::new("master-1");
		let p = peer(Some("laptop"), "10.8.0.100");

		manager.add_peer(&conn, &p).await.unwrap();
		manager.add_peer(&conn, &p).await.unwrap();

		assert_eq!(blocks_for(&path, &p.public_key), 1);
		let content = std::fs::read_to_string(&path).unwrap();
		assert!(content.starts_with("[Interface]"));
		assert!(content.contains("# label: laptop"));
		assert!(content.contains("AllowedIPs = 10.8.0.100/32"));
		assert!(content.contains("PersistentKeepalive = 25"));

		let configured = manager.configured_peers(&conn).await.unwrap();
		assert_eq!(configured.len(), 1);
		assert_eq!(configured[0].label.as_deref(), Some("laptop"));
	}

	#[tokio::test]
	async fn rejoin_with_same_label_replaces_old_block() {
		let (_dir, path, manager) = setup(INTERFACE);
		let conn = LocalShellConnection::new("master-1");
		let old = peer(Some("laptop"), "10.8.0.100");
		let new = peer(Some("laptop"), "10.8.0.101");
		let other = peer(Some("desktop"), "10.8.0.102");

		manager.add_peer(&conn, &other).await.unwrap();
		manager.add_peer(&conn, &old).await.unwrap();
		manager.add_peer(&conn, &new).await.unwrap();

		assert_eq!(blocks_for(&path, &old.public_key), 0);
		assert_eq!(blocks_for(&path, &new.public_key), 1);
		assert_eq!(blocks_for(&path, &other.public_key), 1);
	}

	#[tokio::test]
	async fn same_address_different_key_is_replaced() {
		let (_dir, path, manager) = setup(INTERFACE);
		let conn = LocalShellConnection::new("master-1");
		let first = peer(None, "10.8.0.100");
		let second = peer(None, "10.8.0.100");

		manager.add_peer(&conn, &first).await.unwrap();
		manager.add_peer(&conn, &second).await.unwrap();

		assert_eq!(blocks_for(&path, &first.public_key), 0);
		assert_eq!(blocks_for(&path, &second.public_key), 1);
	}

	#[tokio::test]
	async fn malformed_lines_are_cleaned() {
		let dirty = format!(
			"{INTERFACE}\n[Peer]\\nPublicKey = broken\nEOF\n[Peer]\nPublicKey = {}\nAllowedIPs = 10.8.0.50/32\n",
			WgKeyPair::generate().unwrap().public_key()
		);
		let (_dir, path, manager) = setup(&dirty);
		let conn = LocalShellConnection::new("master-1");

		manager.add_peer(&conn, &peer(None, "10.8.0.100")).await.unwrap();

		let content = std::fs::read_to_string(&path).unwrap();
		assert!(!content.contains("\\n"));
		assert!(!content.lines().any(|l| l.trim() == "EOF"));
		assert!(content.contains("AllowedIPs = 10.8.0.50/32"));
		assert_eq!(parse_config_peers(&content).len(), 2);
	}

	#[tokio::test]
	async fn remove_peer_is_idempotent() {
		let (_dir, path, manager) = setup(INTERFACE);
		let conn = LocalShellConnection::new("master-1");
		let keep = peer(Some("keep"), "10.8.0.100");
		let gone = peer(Some("gone"), "10.8.0.101");

		manager.add_peer(&conn, &keep).await.unwrap();
		manager.add_peer(&conn, &gone).await.unwrap();
		manager.remove_peer(&conn, &gone.public_key).await.unwrap();
		manager.remove_peer(&conn, &gone.public_key).await.unwrap();

		assert_eq!(blocks_for(&path, &gone.public_key), 0);
		assert_eq!(blocks_for(&path, &keep.public_key), 1);
	}

	#[tokio::test]
	async fn backups_are_pruned() {
		let (dir, _path, manager) = setup(INTERFACE);
		let conn = LocalShellConnection::new("master-1");

		// Seed old backups with distinct mtimes so `ls -t` orders them.
		for i in 0..8 {
			let backup = dir.path().join(format!("wg0.conf.bak.2000010100000{i}"));
			std::fs::write(&backup, INTERFACE).unwrap();
			let status = std::process::Command::new("touch")
				.arg("-t")
				.arg(format!("20000101000{i}"))
				.arg(&backup)
				.status()
				.unwrap();
			assert!(status.success());
		}

		manager.add_peer(&conn, &peer(None, "10.8.0.100")).await.unwrap();
		assert_eq!(backups(dir.path()), BACKUP_RETENTION);
	}

	#[tokio::test]
	async fn sync_failure_reports_stage_and_host() {
		let dir = TempDir::new().unwrap();
		let path = dir.path().join("wg0.conf");
		std::fs::write(&path, INTERFACE).unwrap();
		let manager = ConfigManager::new(Arc::new(FileTooling {
			path,
			sync_fails: true,
		}));
		let conn = LocalShellConnection::new("worker-2");

		let err = manager
			.add_peer(&conn, &peer(None, "10.8.0.100"))
			.await
			.unwrap_err();
		assert_eq!(err.host, "worker-2");
		assert_eq!(err.stage, ApplyStage::Sync);
	}

	#[tokio::test]
	async fn missing_config_fails_at_backup() {
		let dir = TempDir::new().unwrap();
		let manager = ConfigManager::new(Arc::new(FileTooling {
			path: dir.path().join("absent.conf"),
			sync_fails: false,
		}));
		let conn = LocalShellConnection::new("worker-1");

		let err = manager
			.add_peer(&conn, &peer(None, "10.8.0.100"))
			.await
			.unwrap_err();
		assert_eq!(err.stage, ApplyStage::Backup);
	}

	#[tokio::test]
	async fn node_public_key_and_dump() {
		let (_dir, path, manager) = setup(INTERFACE);
		let conn = LocalShellConnection::new("master-1");
		let node_key = *WgKeyPair::generate().unwrap().public_key();
		let peer_key = *WgKeyPair::generate().unwrap().public_key();

		std::fs::write(format!("{}.pub", path.display()), format!("{node_key}\n")).unwrap();
		std::fs::write(
			format!("{}.dump", path.display()),
			format!(
				"cHJpdmF0ZQ==\t{node_key}\t51820\toff\n{peer_key}\t(none)\t198.51.100.4:51820\t10.8.0.100/32\t1700000000\t1024\t2048\t25\n"
			),
		)
		.unwrap();

		assert_eq!(manager.node_public_key(&conn).await.unwrap(), node_key);

		let live = manager.live_peers(&conn).await.unwrap();
		assert_eq!(live.len(), 1);
		assert_eq!(live[0].public_key, peer_key);
		assert_eq!(live[0].endpoint, Some("198.51.100.4:51820".parse().unwrap()));
		assert_eq!(live[0].allowed_ips, vec!["10.8.0.100/32".to_string()]);
		assert_eq!(live[0].rx_bytes, 1024);
		assert_eq!(live[0].persistent_keepalive, Some(25));
		assert!(live[0].latest_handshake.is_some());
	}

	#[test]
	fn dump_parsing_handles_idle_peers() {
		let key = *WgKeyPair::generate().unwrap().public_key();
		let dump = format!("{key}\t(none)\t(none)\t(none)\t0\t0\t0\toff\n");
		let peers = parse_dump(&dump);
		assert_eq!(peers.len(), 1);
		assert!(peers[0].endpoint.is_none());
		assert!(peers[0].allowed_ips.is_empty());
		assert!(peers[0].latest_handshake.is_none());
		assert!(peers[0].persistent_keepalive.is_none());
	}

	#[test]
	fn scripts_quote_untrusted_fields() {
		let manager = ConfigManager::new(Arc::new(crate::tooling::WgQuickTooling::default()));
		let p = peer(Some("laptop"), "10.8.0.100");
		let command = manager.add_peer_script(&p);
		assert!(command.starts_with("sudo -n sh -c '"));
		assert!(command.contains(&p.public_key.to_base64()));
		assert!(command.contains("wg syncconf wg0"));
	}
}
