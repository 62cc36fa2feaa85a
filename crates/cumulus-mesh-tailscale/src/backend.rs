// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! The network stack an [`EmbeddedMeshClient`](crate::EmbeddedMeshClient)
//! drives. The production backend runs `tailscaled` in userspace
//! networking mode, so no TUN device or root access is needed.

use crate::error::MeshClientError;
use crate::socks5::{connect_via, Dialer, TargetAddr};
use async_trait::async_trait;
use cumulus_common_secret::SecretString;
use serde::Deserialize;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};
use url::Url;

#[derive(Debug, Clone)]
pub struct ConnectParams {
	pub hostname: String,
	pub auth_key: SecretString,
	pub coordinator_url: Url,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendStatus {
	pub online: bool,
	pub mesh_ip: Option<IpAddr>,
	pub peer_count: usize,
}

#[async_trait]
pub trait MeshBackend: Dialer {
	/// Authenticates with the coordinator and brings the stack up.
	/// Must be safe to drop mid-flight; the caller cancels by dropping.
	async fn up(&self, params: &ConnectParams) -> Result<BackendStatus, MeshClientError>;

	async fn status(&self) -> Result<BackendStatus, MeshClientError>;

	/// Tears the stack down. Calling it when already down is a no-op.
	async fn down(&self) -> Result<(), MeshClientError>;
}

/// Lets a backend be handed to a [`Socks5Server`](crate::Socks5Server).
pub struct BackendDialer(pub Arc<dyn MeshBackend>);

#[async_trait]
impl Dialer for BackendDialer {
	async fn dial(&self, target: &TargetAddr) -> io::Result<TcpStream> {
		self.0.dial(target).await
	}
}

#[derive(Debug, Clone)]
pub struct TailscaledConfig {
	pub tailscaled_bin: PathBuf,
	pub tailscale_bin: PathBuf,
	pub state_dir: PathBuf,
	pub socket_wait: Duration,
}

impl TailscaledConfig {
	pub fn new(state_dir: impl Into<PathBuf>) -> Self {
		Self {
			tailscaled_bin: PathBuf::from("tailscaled"),
			tailscale_bin: PathBuf::from("tailscale"),
			state_dir: state_dir.into(),
			socket_wait: Duration::from_secs(10),
		}
	}

	fn socket(&self) -> PathBuf {
		self.state_dir.join("tailscaled.sock")
	}
}

struct Running {
	child: Child,
	socks: SocketAddr,
}

pub struct TailscaledBackend {
	config: TailscaledConfig,
	running: Mutex<Option<Running>>,
}

impl TailscaledBackend {
	pub fn new(config: TailscaledConfig) -> Self {
		Self {
			config,
			running: Mutex::new(None),
		}
	}

	fn cli(&self) -> Command {
		let mut cmd = Command::new(&self.config.tailscale_bin);
		cmd.arg("--socket").arg(self.config.socket());
		cmd.kill_on_drop(true);
		cmd
	}

	async fn cli_output(&self, args: &[String]) -> Result<String, MeshClientError> {
		let output = self
			.cli()
			.args(args)
			.stdin(Stdio::null())
			.output()
			.await
			.map_err(MeshClientError::Spawn)?;
		if !output.status.success() {
			let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
			return Err(MeshClientError::Backend(format!(
				"tailscale {} failed ({}): {stderr}",
				args.first().map(String::as_str).unwrap_or_default(),
				output.status
			)));
		}
		Ok(String::from_utf8_lossy(&output.stdout).into_owned())
	}

	async fn spawn_daemon(&self) -> Result<Running, MeshClientError> {
		tokio::fs::create_dir_all(&self.config.state_dir)
			.await
			.map_err(MeshClientError::Spawn)?;
		let socket = self.config.socket();
		let _ = tokio::fs::remove_file(&socket).await;

		let socks = free_loopback_port().map_err(MeshClientError::Spawn)?;
		let child = Command::new(&self.config.tailscaled_bin)
			.arg("--tun=userspace-networking")
			.arg("--statedir")
			.arg(&self.config.state_dir)
			.arg("--socket")
			.arg(&socket)
			.arg(format!("--socks5-server={socks}"))
			.stdin(Stdio::null())
			.stdout(Stdio::null())
			.stderr(Stdio::inherit())
			.kill_on_drop(true)
			.spawn()
			.map_err(MeshClientError::Spawn)?;
		info!(pid = ?child.id(), %socks, "tailscaled started");

		let deadline = tokio::time::Instant::now() + self.config.socket_wait;
		while !socket.exists() {
			if tokio::time::Instant::now() >= deadline {
				return Err(MeshClientError::Backend(format!(
					"tailscaled socket {} did not appear within {:?}",
					socket.display(),
					self.config.socket_wait
				)));
			}
			tokio::time::sleep(Duration::from_millis(100)).await;
		}
		Ok(Running { child, socks })
	}
}

fn free_loopback_port() -> io::Result<SocketAddr> {
	let listener = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
	listener.local_addr()
}

/// Writes the key where only this user can read it, so it never shows up
/// in the process table.
fn write_key_file(dir: &Path, key: &SecretString) -> io::Result<PathBuf> {
	use std::io::Write;
	let path = dir.join("authkey");
	let mut options = std::fs::OpenOptions::new();
	options.write(true).create(true).truncate(true);
	#[cfg(unix)]
	{
		use std::os::unix::fs::OpenOptionsExt;
		options.mode(0o600);
	}
	let mut file = options.open(&path)?;
	// `mode` only applies on create; a leftover file keeps its old bits.
	#[cfg(unix)]
	{
		use std::os::unix::fs::PermissionsExt;
		file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
	}
	file.write_all(key.expose().as_bytes())?;
	Ok(path)
}

#[async_trait]
impl Dialer for TailscaledBackend {
	async fn dial(&self, target: &TargetAddr) -> io::Result<TcpStream> {
		let socks = self
			.running
			.lock()
			.await
			.as_ref()
			.map(|r| r.socks)
			.ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "mesh backend is down"))?;
		connect_via(socks, target).await
	}
}

#[async_trait]
impl MeshBackend for TailscaledBackend {
	#[instrument(skip(self, params), fields(hostname = %params.hostname, coordinator = %params.coordinator_url))]
	async fn up(&self, params: &ConnectParams) -> Result<BackendStatus, MeshClientError> {
		let mut running = self.running.lock().await;
		if running.is_none() {
			*running = Some(self.spawn_daemon().await?);
		}
		drop(running);

		let key_file = write_key_file(&self.config.state_dir, &params.auth_key).map_err(MeshClientError::Spawn)?;
		let args = vec![
			"up".to_string(),
			format!("--login-server={}", params.coordinator_url),
			format!("--auth-key=file:{}", key_file.display()),
			format!("--hostname={}", params.hostname),
			"--accept-routes".to_string(),
			"--reset".to_string(),
		];
		debug!("running tailscale up");
		let result = self.cli_output(&args).await;
		if let Err(e) = std::fs::remove_file(&key_file) {
			warn!(path = %key_file.display(), error = %e, "failed to remove auth key file");
		}
		result?;

		self.status().await
	}

	async fn status(&self) -> Result<BackendStatus, MeshClientError> {
		if self.running.lock().await.is_none() {
			return Ok(BackendStatus::default());
		}
		let json = self.cli_output(&["status".to_string(), "--json".to_string()]).await?;
		parse_status(&json)
	}

	async fn down(&self) -> Result<(), MeshClientError> {
		let Some(mut running) = self.running.lock().await.take() else {
			return Ok(());
		};
		if let Err(e) = self.cli_output(&["down".to_string()]).await {
			warn!(error = %e, "tailscale down failed; stopping tailscaled anyway");
		}
		if let Err(e) = running.child.kill().await {
			warn!(error = %e, "failed to stop tailscaled");
		}
		info!("tailscaled stopped");
		Ok(())
	}
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StatusJson {
	#[serde(default)]
	backend_state: String,
	#[serde(rename = "Self", default)]
	self_node: Option<SelfJson>,
	#[serde(default)]
	peer: Option<std::collections::HashMap<String, serde_json::Value>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SelfJson {
	#[serde(rename = "TailscaleIPs", default)]
	tailscale_ips: Vec<IpAddr>,
}

/// Parses `tailscale status --json`. IPv4 mesh addresses win over IPv6.
pub fn parse_status(json: &str) -> Result<BackendStatus, MeshClientError> {
	let status: StatusJson = serde_json::from_str(json)
		.map_err(|e| MeshClientError::Backend(format!("unreadable status output: {e}")))?;
	let ips = status.self_node.map(|s| s.tailscale_ips).unwrap_or_default();
	let mesh_ip = ips
		.iter()
		.find(|ip| ip.is_ipv4())
		.or_else(|| ips.first())
		.copied();
	Ok(BackendStatus {
		online: status.backend_state == "Running",
		mesh_ip,
		peer_count: status.peer.map(|p| p.len()).unwrap_or(0),
	})
}

/// In-process backends for tests and local development.
pub mod testing {
	use super::*;
	use crate::socks5::DirectDialer;
	use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

	/// Comes up on a fixed address and dials straight out of the host.
	pub struct LoopbackBackend {
		mesh_ip: IpAddr,
		peer_count: usize,
		up_delay: Duration,
		fail_up: Option<String>,
		online: AtomicBool,
		up_calls: AtomicUsize,
		down_calls: AtomicUsize,
		last_params: std::sync::Mutex<Option<ConnectParams>>,
	}

	impl LoopbackBackend {
		pub fn new(mesh_ip: IpAddr) -> Self {
			Self {
				mesh_ip,
				peer_count: 0,
				up_delay: Duration::ZERO,
				fail_up: None,
				online: AtomicBool::new(false),
				up_calls: AtomicUsize::new(0),
				down_calls: AtomicUsize::new(0),
				last_params: std::sync::Mutex::new(None),
			}
		}

		pub fn with_peers(mut self, peer_count: usize) -> Self {
			self.peer_count = peer_count;
			self
		}

		/// Delays `up`, to exercise timeouts and cancellation.
		pub fn with_up_delay(mut self, delay: Duration) -> Self {
			self.up_delay = delay;
			self
		}

		pub fn failing(mut self, message: impl Into<String>) -> Self {
			self.fail_up = Some(message.into());
			self
		}

		pub fn is_online(&self) -> bool {
			self.online.load(Ordering::SeqCst)
		}

		pub fn up_calls(&self) -> usize {
			self.up_calls.load(Ordering::SeqCst)
		}

		pub fn down_calls(&self) -> usize {
			self.down_calls.load(Ordering::SeqCst)
		}

		pub fn last_params(&self) -> Option<ConnectParams> {
			self.last_params.lock().ok().and_then(|p| p.clone())
		}

		fn current(&self) -> BackendStatus {
			if self.is_online() {
				BackendStatus {
					online: true,
					mesh_ip: Some(self.mesh_ip),
					peer_count: self.peer_count,
				}
			} else {
				BackendStatus::default()
			}
		}
	}

	#[async_trait]
	impl Dialer for LoopbackBackend {
		async fn dial(&self, target: &TargetAddr) -> io::Result<TcpStream> {
			if !self.is_online() {
				return Err(io::Error::new(io::ErrorKind::NotConnected, "mesh backend is down"));
			}
			DirectDialer.dial(target).await
		}
	}

	#[async_trait]
	impl MeshBackend for LoopbackBackend {
		async fn up(&self, params: &ConnectParams) -> Result<BackendStatus, MeshClientError> {
			self.up_calls.fetch_add(1, Ordering::SeqCst);
			if let Ok(mut last) = self.last_params.lock() {
				*last = Some(params.clone());
			}
			if !self.up_delay.is_zero() {
				tokio::time::sleep(self.up_delay).await;
			}
			if let Some(message) = &self.fail_up {
				return Err(MeshClientError::Backend(message.clone()));
			}
			self.online.store(true, Ordering::SeqCst);
			Ok(self.current())
		}

		async fn status(&self) -> Result<BackendStatus, MeshClientError> {
			Ok(self.current())
		}

		async fn down(&self) -> Result<(), MeshClientError> {
			self.down_calls.fetch_add(1, Ordering::SeqCst);
			self.online.store(false, Ordering::SeqCst);
			Ok(())
		}
	}
}
