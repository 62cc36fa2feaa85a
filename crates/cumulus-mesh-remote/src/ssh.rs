// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! OpenSSH-backed connector.
//!
//! `connect` starts a backgrounded master (`ssh -M -N -f`) bound to a
//! private control socket; every `execute` multiplexes a new session over
//! that socket, so the handshake (and the bastion hop) happens once per
//! connection. `close` asks the master to exit and removes the socket
//! directory.

use crate::config::ConnectionConfig;
use crate::connection::{Connection, Connector};
use crate::error::{RemoteError, Result, TransportError};
use crate::quote::shell_quote;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tempfile::TempDir;
use tokio::process::Command;
use tracing::{debug, instrument, warn};

/// Exit status OpenSSH reserves for its own failures.
const SSH_ERROR_STATUS: i32 = 255;

#[derive(Debug, Clone)]
pub struct SshConnector {
	program: PathBuf,
}

impl Default for SshConnector {
	fn default() -> Self {
		Self::new()
	}
}

impl SshConnector {
	pub fn new() -> Self {
		Self {
			program: PathBuf::from("ssh"),
		}
	}

	pub fn with_program(program: impl Into<PathBuf>) -> Self {
		Self {
			program: program.into(),
		}
	}

	/// Options shared by the master, the bastion hop and every session.
	fn common_options(config: &ConnectionConfig) -> Vec<String> {
		let mut args = vec![
			"-o".to_string(),
			"BatchMode=yes".to_string(),
			"-o".to_string(),
			format!("ConnectTimeout={}", config.connect_timeout.as_secs().max(1)),
			"-o".to_string(),
			"StrictHostKeyChecking=accept-new".to_string(),
			"-o".to_string(),
			"ServerAliveInterval=15".to_string(),
			"-o".to_string(),
			"ServerAliveCountMax=3".to_string(),
		];
		if let Some(known_hosts) = &config.known_hosts_file {
			args.push("-o".to_string());
			args.push(format!("UserKnownHostsFile={}", known_hosts.display()));
		}
		if let Some(identity) = &config.identity_file {
			args.push("-i".to_string());
			args.push(identity.display().to_string());
		}
		args
	}

	/// `ProxyCommand` that relays through the bastion with `ssh -W`. Used
	/// instead of `-J` so the bastion hop gets the same identity and options.
	fn proxy_command(&self, config: &ConnectionConfig) -> Option<String> {
		let bastion = config.bastion.as_ref()?;
		let mut words = vec![shell_quote(&self.program.display().to_string())];
		words.extend(Self::common_options(config).iter().map(|w| shell_quote(w)));
		words.push("-W".to_string());
		words.push("%h:%p".to_string());
		words.push("-p".to_string());
		words.push(bastion.port.to_string());
		words.push(shell_quote(&format!("{}@{}", bastion.user, bastion.host)));
		Some(words.join(" "))
	}

	pub(crate) fn master_args(&self, config: &ConnectionConfig, control_path: &Path) -> Vec<String> {
		let mut args = vec![
			"-M".to_string(),
			"-N".to_string(),
			"-f".to_string(),
			"-S".to_string(),
			control_path.display().to_string(),
			"-o".to_string(),
			"ControlPersist=yes".to_string(),
		];
		args.extend(Self::common_options(config));
		if let Some(proxy) = self.proxy_command(config) {
			args.push("-o".to_string());
			args.push(format!("ProxyCommand={proxy}"));
		}
		args.push("-p".to_string());
		args.push(config.port.to_string());
		args.push(config.destination());
		args
	}
}

#[async_trait]
impl Connector for SshConnector {
	#[instrument(skip(self, config), fields(host = %config.host, bastion = ?config.bastion_host()))]
	async fn connect(
		&self,
		config: &ConnectionConfig,
	) -> std::result::Result<Box<dyn Connection>, TransportError> {
		let control_dir = tempfile::Builder::new()
			.prefix("cumulus-ssh-")
			.tempdir()
			.map_err(|e| TransportError::Spawn(format!("control directory: {e}")))?;
		let control_path = control_dir.path().join("ctl");
		let stderr_path = control_dir.path().join("master.err");

		// The backgrounded master keeps its stderr open, so it goes to a file
		// rather than a pipe the caller would wait on forever.
		let stderr_file = std::fs::File::create(&stderr_path)
			.map_err(|e| TransportError::Spawn(format!("stderr capture: {e}")))?;

		let mut cmd = Command::new(&self.program);
		cmd.args(self.master_args(config, &control_path))
			.stdin(Stdio::null())
			.stdout(Stdio::null())
			.stderr(Stdio::from(stderr_file))
			.kill_on_drop(true);

		debug!("starting ssh control master");

		// ConnectTimeout covers each TCP connect; this bounds the whole
		// handshake including the bastion hop and authentication.
		let budget = config.connect_timeout * 2;
		let status = match tokio::time::timeout(budget, cmd.status()).await {
			Ok(Ok(status)) => status,
			Ok(Err(e)) => return Err(TransportError::Spawn(e.to_string())),
			Err(_) => return Err(TransportError::Timeout(budget)),
		};

		if !status.success() {
			let stderr = std::fs::read_to_string(&stderr_path).unwrap_or_default();
			return Err(match status.code() {
				Some(SSH_ERROR_STATUS) | None => TransportError::classify(&stderr),
				Some(code) => TransportError::Transient(format!("ssh exited with {code}: {}", stderr.trim())),
			});
		}

		Ok(Box::new(SshConnection {
			program: self.program.clone(),
			host: config.host.clone(),
			port: config.port,
			destination: config.destination(),
			command_timeout: config.command_timeout,
			control_path,
			control_dir: Mutex::new(Some(control_dir)),
			closed: AtomicBool::new(false),
		}))
	}
}

pub struct SshConnection {
	program: PathBuf,
	host: String,
	port: u16,
	destination: String,
	command_timeout: std::time::Duration,
	control_path: PathBuf,
	control_dir: Mutex<Option<TempDir>>,
	closed: AtomicBool,
}

impl SshConnection {
	fn session_args(&self) -> Vec<String> {
		vec![
			"-S".to_string(),
			self.control_path.display().to_string(),
			"-o".to_string(),
			"ControlMaster=no".to_string(),
			"-o".to_string(),
			"BatchMode=yes".to_string(),
			"-p".to_string(),
			self.port.to_string(),
			self.destination.clone(),
		]
	}

	fn exit_master_command(&self) -> std::process::Command {
		let mut command = std::process::Command::new(&self.program);
		command
			.args(["-S", &self.control_path.display().to_string(), "-O", "exit"])
			.arg(&self.destination)
			.stdin(Stdio::null())
			.stdout(Stdio::null())
			.stderr(Stdio::null());
		command
	}

	fn drop_control_dir(&self) {
		if let Ok(mut dir) = self.control_dir.lock() {
			dir.take();
		}
	}
}

#[async_trait]
impl Connection for SshConnection {
	fn host(&self) -> &str {
		&self.host
	}

	#[instrument(skip(self, command), fields(host = %self.host))]
	async fn execute(&self, command: &str) -> Result<String> {
		if self.closed.load(Ordering::SeqCst) {
			return Err(RemoteError::Closed {
				host: self.host.clone(),
			});
		}

		let mut cmd = Command::new(&self.program);
		cmd.args(self.session_args())
			.arg("--")
			.arg(command)
			.stdin(Stdio::null())
			.stdout(Stdio::piped())
			.stderr(Stdio::piped())
			.kill_on_drop(true);

		let output = match tokio::time::timeout(self.command_timeout, cmd.output()).await {
			Ok(Ok(output)) => output,
			Ok(Err(e)) => {
				return Err(RemoteError::Transport {
					host: self.host.clone(),
					cause: TransportError::Spawn(e.to_string()),
				})
			}
			Err(_) => {
				return Err(RemoteError::CommandTimeout {
					host: self.host.clone(),
					timeout: self.command_timeout,
				})
			}
		};

		let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
		combined.push_str(&String::from_utf8_lossy(&output.stderr));

		match output.status.code() {
			Some(0) => Ok(combined),
			Some(SSH_ERROR_STATUS) | None => Err(RemoteError::Transport {
				host: self.host.clone(),
				cause: TransportError::classify(&String::from_utf8_lossy(&output.stderr)),
			}),
			Some(status) => Err(RemoteError::CommandFailed {
				host: self.host.clone(),
				status,
				output: combined.trim().to_string(),
			}),
		}
	}

	async fn close(&self) {
		if self.closed.swap(true, Ordering::SeqCst) {
			return;
		}

		let status = Command::from(self.exit_master_command()).status().await;
		if let Err(e) = status {
			warn!(host = %self.host, error = %e, "failed to stop ssh control master");
		}

		self.drop_control_dir();
		debug!(host = %self.host, "connection closed");
	}
}

/// A connection dropped without `close` (for instance when a caller's
/// timeout cancels it) still stops its master. Inside a runtime the exit
/// runs as a spawned task so no worker thread blocks on `ssh`.
impl Drop for SshConnection {
	fn drop(&mut self) {
		if self.closed.swap(true, Ordering::SeqCst) {
			return;
		}
		let control_dir = self.control_dir.get_mut().ok().and_then(Option::take);
		let command = self.exit_master_command();
		match tokio::runtime::Handle::try_current() {
			Ok(handle) => {
				let host = self.host.clone();
				handle.spawn(async move {
					if let Err(e) = Command::from(command).status().await {
						warn!(host = %host, error = %e, "failed to stop ssh control master");
					}
					drop(control_dir);
				});
			}
			Err(_) => {
				let mut command = command;
				let _ = command.status();
				drop(control_dir);
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use cumulus_mesh_common::BastionConfig;
	use std::time::Duration;

	fn config() -> ConnectionConfig {
		ConnectionConfig::new("10.0.0.5", "ops")
			.with_identity_file(Some(PathBuf::from("/keys/id ed25519")))
			.with_connect_timeout(Duration::from_secs(7))
	}

	#[test]
	fn master_args_direct() {
		let connector = SshConnector::new();
		let args = connector.master_args(&config(), Path::new("/tmp/x/ctl"));

		assert_eq!(&args[..5], &["-M", "-N", "-f", "-S", "/tmp/x/ctl"]);
		assert!(args.contains(&"ConnectTimeout=7".to_string()));
		assert!(args.contains(&"BatchMode=yes".to_string()));
		assert!(!args.iter().any(|a| a.starts_with("ProxyCommand=")));
		assert_eq!(args.last().unwrap(), "ops@10.0.0.5");
	}

	#[test]
	fn master_args_relay_through_bastion() {
		let connector = SshConnector::new();
		let config = config().with_bastion(Some(BastionConfig {
			host: "bastion.example.com".to_string(),
			user: "jump".to_string(),
			port: 2200,
		}));
		let args = connector.master_args(&config, Path::new("/tmp/x/ctl"));

		let proxy = args
			.iter()
			.find(|a| a.starts_with("ProxyCommand="))
			.expect("proxy command present");
		assert!(proxy.contains("-W %h:%p"));
		assert!(proxy.contains("-p 2200"));
		assert!(proxy.contains("jump@bastion.example.com"));
		assert!(proxy.contains("'/keys/id ed25519'"));
		assert_eq!(args.last().unwrap(), "ops@10.0.0.5");
	}

	#[cfg(unix)]
	#[tokio::test]
	async fn dropped_connection_stops_master_in_background() {
		use std::os::unix::fs::PermissionsExt;

		let bin = tempfile::tempdir().unwrap();
		let marker = bin.path().join("exit-args");
		let program = bin.path().join("fake-ssh");
		std::fs::write(&program, format!("#!/bin/sh\necho \"$@\" > '{}'\n", marker.display())).unwrap();
		std::fs::set_permissions(&program, std::fs::Permissions::from_mode(0o755)).unwrap();

		let control_dir = tempfile::tempdir().unwrap();
		let control_root = control_dir.path().to_path_buf();
		let conn = SshConnection {
			program,
			host: "10.0.0.5".to_string(),
			port: 22,
			destination: "ops@10.0.0.5".to_string(),
			command_timeout: Duration::from_secs(5),
			control_path: control_root.join("ctl"),
			control_dir: Mutex::new(Some(control_dir)),
			closed: AtomicBool::new(false),
		};
		drop(conn);

		let deadline = std::time::Instant::now() + Duration::from_secs(5);
		while control_root.exists() && std::time::Instant::now() < deadline {
			tokio::time::sleep(Duration::from_millis(20)).await;
		}
		assert!(!control_root.exists(), "control directory removed after exit");
		let args = std::fs::read_to_string(&marker).unwrap();
		assert!(args.contains("-O exit ops@10.0.0.5"), "{args}");
	}

	#[tokio::test]
	async fn missing_binary_is_a_spawn_error() {
		let connector = SshConnector::with_program("/nonexistent/ssh-binary");
		match connector.connect(&config()).await {
			Err(TransportError::Spawn(_)) => {}
			Err(other) => panic!("expected spawn error, got {other:?}"),
			Ok(_) => panic!("expected spawn error, got a connection"),
		}
	}
}
