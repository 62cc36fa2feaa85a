// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Single-instance mesh daemon per cluster.
//!
//! Runtime files, all under one directory:
//!
//! | file                   | written when                       |
//! |------------------------|------------------------------------|
//! | `<cluster>.lock`       | from `Connecting` until exit       |
//! | `<cluster>.pid`        | on reaching `Running`              |
//! | `<cluster>.ready`      | on reaching `Running` (JSON)       |
//! | `<cluster>.proxy-port` | when the SOCKS5 proxy is listening |
//! | `<cluster>.log`        | detached daemon output             |

use crate::client::{EmbeddedMeshClient, MeshState};
use crate::error::{DaemonError, MeshClientError};
use chrono::{DateTime, Utc};
use cumulus_mesh_common::{process_alive, read_pid, validate_label, LockError, PidFile};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::io;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(90);
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(10);
const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadyMarker {
	pub pid: u32,
	pub mesh_ip: Option<IpAddr>,
	pub proxy_port: Option<u16>,
	pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DaemonStatus {
	pub cluster: String,
	pub running: bool,
	pub pid: Option<u32>,
	pub proxy_port: Option<u16>,
	pub ready: Option<ReadyMarker>,
	pub log: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ForegroundOptions {
	pub proxy_port: Option<u16>,
	/// Bound on the disconnect step after a termination signal.
	pub disconnect_timeout: Duration,
}

impl Default for ForegroundOptions {
	fn default() -> Self {
		Self {
			proxy_port: None,
			disconnect_timeout: Duration::from_secs(10),
		}
	}
}

#[derive(Debug, Clone)]
pub struct DaemonController {
	runtime_dir: PathBuf,
}

impl DaemonController {
	pub fn new(runtime_dir: impl Into<PathBuf>) -> Self {
		Self {
			runtime_dir: runtime_dir.into(),
		}
	}

	pub fn runtime_dir(&self) -> &Path {
		&self.runtime_dir
	}

	fn file(&self, cluster: &str, suffix: &str) -> PathBuf {
		self.runtime_dir.join(format!("{cluster}.{suffix}"))
	}

	pub fn lock_path(&self, cluster: &str) -> PathBuf {
		self.file(cluster, "lock")
	}

	pub fn pid_path(&self, cluster: &str) -> PathBuf {
		self.file(cluster, "pid")
	}

	pub fn ready_path(&self, cluster: &str) -> PathBuf {
		self.file(cluster, "ready")
	}

	pub fn proxy_port_path(&self, cluster: &str) -> PathBuf {
		self.file(cluster, "proxy-port")
	}

	pub fn log_path(&self, cluster: &str) -> PathBuf {
		self.file(cluster, "log")
	}

	fn check_cluster(cluster: &str) -> Result<(), DaemonError> {
		validate_label(cluster).map_err(|_| DaemonError::InvalidCluster(cluster.to_string()))
	}

	/// PID of a live daemon that reached `Running`.
	pub fn running_pid(&self, cluster: &str) -> Option<u32> {
		read_pid(self.pid_path(cluster)).filter(|pid| process_alive(*pid))
	}

	/// PID of a live process holding the cluster lock, running or not.
	fn owner_pid(&self, cluster: &str) -> Option<u32> {
		self.running_pid(cluster)
			.or_else(|| read_pid(self.lock_path(cluster)).filter(|pid| process_alive(*pid)))
	}

	/// True when the PID file exists and the recorded process is alive.
	pub fn is_daemon_running(&self, cluster: &str) -> bool {
		self.running_pid(cluster).is_some()
	}

	pub fn proxy_port(&self, cluster: &str) -> Option<u16> {
		self.running_pid(cluster)?;
		std::fs::read_to_string(self.proxy_port_path(cluster))
			.ok()
			.and_then(|s| s.trim().parse().ok())
	}

	pub fn daemon_status(&self, cluster: &str) -> DaemonStatus {
		let pid = self.running_pid(cluster);
		let ready = pid.and_then(|_| {
			std::fs::read_to_string(self.ready_path(cluster))
				.ok()
				.and_then(|json| serde_json::from_str(&json).ok())
		});
		DaemonStatus {
			cluster: cluster.to_string(),
			running: pid.is_some(),
			pid,
			proxy_port: self.proxy_port(cluster),
			ready,
			log: self.log_path(cluster),
		}
	}

	fn remove_runtime_files(&self, cluster: &str) {
		for path in [
			self.pid_path(cluster),
			self.ready_path(cluster),
			self.proxy_port_path(cluster),
		] {
			match std::fs::remove_file(&path) {
				Ok(()) => debug!(path = %path.display(), "removed runtime file"),
				Err(e) if e.kind() == io::ErrorKind::NotFound => {}
				Err(e) => warn!(path = %path.display(), error = %e, "failed to remove runtime file"),
			}
		}
	}

	/// Spawns `command` as a detached daemon and waits for its ready marker.
	///
	/// The command is expected to end up in [`run_foreground`](Self::run_foreground)
	/// for the same cluster and runtime directory. Its output goes to the
	/// cluster log file.
	#[instrument(skip(self, command), fields(runtime_dir = %self.runtime_dir.display()))]
	pub async fn start_detached(
		&self,
		cluster: &str,
		command: std::process::Command,
		ready_timeout: Duration,
	) -> Result<u32, DaemonError> {
		Self::check_cluster(cluster)?;
		if let Some(pid) = self.owner_pid(cluster) {
			return Err(DaemonError::AlreadyRunning {
				cluster: cluster.to_string(),
				pid,
			});
		}
		std::fs::create_dir_all(&self.runtime_dir)?;
		self.remove_runtime_files(cluster);

		let log_path = self.log_path(cluster);
		let log = std::fs::OpenOptions::new()
			.create(true)
			.append(true)
			.open(&log_path)?;
		let log_err = log.try_clone()?;

		let mut command = command;
		command.stdin(Stdio::null()).stdout(log).stderr(log_err);
		#[cfg(unix)]
		{
			use std::os::unix::process::CommandExt;
			command.process_group(0);
		}
		let mut child = tokio::process::Command::from(command)
			.spawn()
			.map_err(DaemonError::Spawn)?;
		let pid = child.id().ok_or_else(|| {
			DaemonError::Spawn(io::Error::other("daemon exited before reporting its pid"))
		})?;
		info!(pid, log = %log_path.display(), "mesh daemon spawned");

		let ready = self.ready_path(cluster);
		let deadline = tokio::time::Instant::now() + ready_timeout;
		loop {
			if ready.exists() {
				break;
			}
			if let Some(status) = child.try_wait()? {
				return Err(DaemonError::ExitedEarly {
					cluster: cluster.to_string(),
					status: status.to_string(),
					log: log_path,
				});
			}
			if tokio::time::Instant::now() >= deadline {
				if let Err(e) = child.start_kill() {
					warn!(pid, error = %e, "failed to kill unready daemon");
				}
				let _ = child.wait().await;
				self.remove_runtime_files(cluster);
				return Err(DaemonError::ReadyTimeout {
					cluster: cluster.to_string(),
					timeout: ready_timeout,
					log: log_path,
				});
			}
			tokio::time::sleep(POLL_INTERVAL).await;
		}

		// Reap the daemon if it exits while this process is still around.
		tokio::spawn(async move {
			let _ = child.wait().await;
		});
		info!(pid, "mesh daemon ready");
		Ok(pid)
	}

	/// Sends SIGTERM to the cluster's daemon, escalating to SIGKILL after
	/// `grace`. Returns false when no live daemon was found. Stale runtime
	/// files are removed either way.
	#[instrument(skip(self))]
	pub async fn stop(&self, cluster: &str, grace: Duration) -> Result<bool, DaemonError> {
		Self::check_cluster(cluster)?;
		let Some(pid) = self.owner_pid(cluster) else {
			self.remove_runtime_files(cluster);
			return Ok(false);
		};
		if pid == std::process::id() {
			return Err(DaemonError::Io(io::Error::new(
				io::ErrorKind::InvalidInput,
				"refusing to signal the current process",
			)));
		}

		send_signal(pid, Signal::Terminate)?;
		if !wait_for_exit(pid, grace).await {
			warn!(pid, ?grace, "daemon ignored SIGTERM; sending SIGKILL");
			send_signal(pid, Signal::Kill)?;
			wait_for_exit(pid, Duration::from_secs(2)).await;
		}

		self.remove_runtime_files(cluster);
		if let Err(e) = PidFile::remove_if_stale(self.lock_path(cluster)) {
			warn!(error = %e, "failed to clear daemon lock file");
		}
		info!(pid, "mesh daemon stopped");
		Ok(true)
	}

	/// Runs the daemon state machine in this process until `shutdown`
	/// resolves: lock, connect, optional proxy, ready marker, then on
	/// shutdown stop the proxy, disconnect and remove runtime files.
	#[instrument(skip(self, client, options, shutdown))]
	pub async fn run_foreground<S>(
		&self,
		cluster: &str,
		client: &EmbeddedMeshClient,
		options: &ForegroundOptions,
		shutdown: S,
	) -> Result<(), DaemonError>
	where
		S: Future<Output = ()>,
	{
		Self::check_cluster(cluster)?;
		let lock = match PidFile::acquire(self.lock_path(cluster)) {
			Ok(lock) => lock,
			Err(LockError::Held { pid, .. }) => {
				return Err(DaemonError::AlreadyRunning {
					cluster: cluster.to_string(),
					pid,
				})
			}
			Err(e) => return Err(DaemonError::Lock(e)),
		};
		self.remove_runtime_files(cluster);

		tokio::pin!(shutdown);
		let mut shutdown_received = false;
		let cancel = CancellationToken::new();
		let connected = {
			let connect = client.connect(&cancel);
			tokio::pin!(connect);
			tokio::select! {
				result = &mut connect => result,
				_ = &mut shutdown => {
					shutdown_received = true;
					cancel.cancel();
					connect.await
				}
			}
		};

		let status = match connected {
			Ok(status) => status,
			Err(MeshClientError::Cancelled) if shutdown_received => {
				info!("shutdown requested while connecting");
				self.release(cluster, lock);
				return Ok(());
			}
			Err(e) => {
				self.release(cluster, lock);
				return Err(e.into());
			}
		};

		let started = self.publish_running(cluster, client, options, status.mesh_ip).await;
		if let Err(e) = started {
			self.teardown(cluster, client, options).await;
			self.release(cluster, lock);
			return Err(e);
		}
		info!(mesh_ip = ?status.mesh_ip, "mesh daemon running");

		if !shutdown_received {
			shutdown.await;
		}
		info!(state = %MeshState::Disconnecting, "shutdown requested");
		self.teardown(cluster, client, options).await;
		self.release(cluster, lock);
		Ok(())
	}

	async fn publish_running(
		&self,
		cluster: &str,
		client: &EmbeddedMeshClient,
		options: &ForegroundOptions,
		mesh_ip: Option<IpAddr>,
	) -> Result<(), DaemonError> {
		let proxy_port = match options.proxy_port {
			Some(port) => {
				let bound = client.start_socks5_proxy(port).await?;
				write_atomic(&self.proxy_port_path(cluster), &format!("{bound}\n"))?;
				Some(bound)
			}
			None => None,
		};

		let pid = std::process::id();
		write_atomic(&self.pid_path(cluster), &format!("{pid}\n"))?;
		let marker = ReadyMarker {
			pid,
			mesh_ip,
			proxy_port,
			started_at: Utc::now(),
		};
		let json = serde_json::to_string_pretty(&marker).map_err(io::Error::other)?;
		write_atomic(&self.ready_path(cluster), &json)?;
		Ok(())
	}

	async fn teardown(&self, cluster: &str, client: &EmbeddedMeshClient, options: &ForegroundOptions) {
		if let Some(port) = client.stop_proxy().await {
			debug!(port, "SOCKS5 proxy stopped");
		}
		match tokio::time::timeout(options.disconnect_timeout, client.disconnect()).await {
			Ok(Ok(())) => {}
			Ok(Err(e)) => warn!(error = %e, "mesh disconnect failed"),
			Err(_) => warn!(timeout = ?options.disconnect_timeout, "mesh disconnect timed out"),
		}
		self.remove_runtime_files(cluster);
	}

	fn release(&self, cluster: &str, lock: PidFile) {
		self.remove_runtime_files(cluster);
		if let Err(e) = lock.release() {
			warn!(error = %e, "failed to release daemon lock");
		}
	}
}

fn write_atomic(path: &Path, contents: &str) -> io::Result<()> {
	let tmp = path.with_extension("tmp");
	std::fs::write(&tmp, contents)?;
	std::fs::rename(&tmp, path)
}

#[derive(Debug, Clone, Copy)]
enum Signal {
	Terminate,
	Kill,
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: Signal) -> io::Result<()> {
	let pid = libc::pid_t::try_from(pid).map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
	let signo = match signal {
		Signal::Terminate => libc::SIGTERM,
		Signal::Kill => libc::SIGKILL,
	};
	if unsafe { libc::kill(pid, signo) } == 0 {
		return Ok(());
	}
	let err = io::Error::last_os_error();
	if err.raw_os_error() == Some(libc::ESRCH) {
		Ok(())
	} else {
		Err(err)
	}
}

#[cfg(not(unix))]
fn send_signal(_pid: u32, _signal: Signal) -> io::Result<()> {
	Err(io::Error::new(io::ErrorKind::Unsupported, "signals are not supported on this platform"))
}

async fn wait_for_exit(pid: u32, timeout: Duration) -> bool {
	let deadline = tokio::time::Instant::now() + timeout;
	while process_alive(pid) {
		if tokio::time::Instant::now() >= deadline {
			return false;
		}
		tokio::time::sleep(POLL_INTERVAL).await;
	}
	true
}

/// Resolves on SIGTERM or Ctrl-C.
pub async fn termination_signal() {
	#[cfg(unix)]
	{
		use tokio::signal::unix::{signal, SignalKind};
		match signal(SignalKind::terminate()) {
			Ok(mut term) => {
				tokio::select! {
					_ = term.recv() => debug!("received SIGTERM"),
					_ = tokio::signal::ctrl_c() => debug!("received SIGINT"),
				}
			}
			Err(e) => {
				warn!(error = %e, "failed to install SIGTERM handler; waiting for Ctrl-C only");
				let _ = tokio::signal::ctrl_c().await;
			}
		}
	}
	#[cfg(not(unix))]
	{
		let _ = tokio::signal::ctrl_c().await;
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::backend::testing::LoopbackBackend;
	use crate::client::MeshClientConfig;
	use crate::headscale::StaticAuthKey;
	use cumulus_common_secret::SecretString;
	use std::sync::Arc;
	use tempfile::TempDir;
	use tokio::sync::oneshot;
	use url::Url;

	fn client(backend: LoopbackBackend) -> EmbeddedMeshClient {
		EmbeddedMeshClient::new(
			Arc::new(backend),
			Arc::new(StaticAuthKey(SecretString::new("tskey-1".to_string()))),
			MeshClientConfig::new("ci-runner", Url::parse("https://hs.example.com").unwrap()),
		)
	}

	fn backend() -> LoopbackBackend {
		LoopbackBackend::new("100.64.0.9".parse().unwrap())
	}

	async fn wait_until(mut check: impl FnMut() -> bool) {
		for _ in 0..200 {
			if check() {
				return;
			}
			tokio::time::sleep(Duration::from_millis(25)).await;
		}
		panic!("condition not reached");
	}

	#[tokio::test]
	async fn foreground_lifecycle() {
		let dir = TempDir::new().unwrap();
		let controller = DaemonController::new(dir.path());
		let client = client(backend());
		let second = self::client(backend());
		let options = ForegroundOptions {
			proxy_port: Some(0),
			..Default::default()
		};
		let (tx, rx) = oneshot::channel::<()>();

		let run = controller.run_foreground("alpha", &client, &options, async {
			let _ = rx.await;
		});
		let drive = async {
			wait_until(|| controller.is_daemon_running("alpha")).await;
			assert_eq!(client.state(), MeshState::Running);

			let status = controller.daemon_status("alpha");
			assert_eq!(status.pid, Some(std::process::id()));
			let port = status.proxy_port.unwrap();
			assert_ne!(port, 0);
			let ready = status.ready.unwrap();
			assert_eq!(ready.mesh_ip, Some("100.64.0.9".parse().unwrap()));
			assert_eq!(ready.proxy_port, Some(port));

			let err = controller
				.run_foreground("alpha", &second, &ForegroundOptions::default(), async {})
				.await
				.unwrap_err();
			assert!(matches!(err, DaemonError::AlreadyRunning { pid, .. } if pid == std::process::id()));
			assert_eq!(second.state(), MeshState::Stopped);
			assert!(controller.is_daemon_running("alpha"));
			assert_eq!(controller.proxy_port("alpha"), Some(port));

			tx.send(()).unwrap();
		};

		let (result, ()) = tokio::join!(run, drive);
		result.unwrap();
		assert!(!controller.is_daemon_running("alpha"));
		assert_eq!(client.state(), MeshState::Stopped);
		assert!(!controller.pid_path("alpha").exists());
		assert!(!controller.ready_path("alpha").exists());
		assert!(!controller.proxy_port_path("alpha").exists());
		assert!(!controller.lock_path("alpha").exists());
	}

	#[tokio::test]
	async fn shutdown_while_connecting_exits_cleanly() {
		let dir = TempDir::new().unwrap();
		let controller = DaemonController::new(dir.path());
		let client = client(backend().with_up_delay(Duration::from_secs(30)));

		controller
			.run_foreground("alpha", &client, &ForegroundOptions::default(), async {
				tokio::time::sleep(Duration::from_millis(30)).await;
			})
			.await
			.unwrap();
		assert_eq!(client.state(), MeshState::Stopped);
		assert!(!controller.lock_path("alpha").exists());
		assert!(!controller.is_daemon_running("alpha"));
	}

	#[tokio::test]
	async fn connect_failure_releases_lock() {
		let dir = TempDir::new().unwrap();
		let controller = DaemonController::new(dir.path());
		let client = client(backend().failing("no route to coordinator"));

		let err = controller
			.run_foreground("alpha", &client, &ForegroundOptions::default(), std::future::pending())
			.await
			.unwrap_err();
		assert!(matches!(err, DaemonError::Client(MeshClientError::Backend(_))));
		assert!(!controller.lock_path("alpha").exists());
	}

	#[tokio::test]
	async fn rejects_path_like_cluster_ids() {
		let dir = TempDir::new().unwrap();
		let controller = DaemonController::new(dir.path());
		assert!(matches!(
			controller.stop("../etc", DEFAULT_STOP_GRACE).await,
			Err(DaemonError::InvalidCluster(_))
		));
	}

	#[tokio::test]
	async fn stale_pid_file_is_not_running() {
		let dir = TempDir::new().unwrap();
		let controller = DaemonController::new(dir.path());
		std::fs::write(controller.pid_path("alpha"), format!("{}\n", i32::MAX)).unwrap();
		std::fs::write(controller.proxy_port_path("alpha"), "1080\n").unwrap();

		assert!(!controller.is_daemon_running("alpha"));
		assert_eq!(controller.proxy_port("alpha"), None);
		assert!(!controller.stop("alpha", DEFAULT_STOP_GRACE).await.unwrap());
		assert!(!controller.pid_path("alpha").exists());
		assert!(!controller.proxy_port_path("alpha").exists());
	}

	fn fake_daemon(dir: &Path, cluster: &str) -> std::process::Command {
		let mut cmd = std::process::Command::new("sh");
		cmd.arg("-c")
			.arg(format!(
				"echo $$ > \"$0/{cluster}.pid\"; echo '{{}}' > \"$0/{cluster}.ready\"; exec sleep 30"
			))
			.arg(dir);
		cmd
	}

	#[tokio::test]
	async fn detached_start_and_stop() {
		let dir = TempDir::new().unwrap();
		let controller = DaemonController::new(dir.path());

		let pid = controller
			.start_detached("alpha", fake_daemon(dir.path(), "alpha"), Duration::from_secs(5))
			.await
			.unwrap();
		assert!(controller.is_daemon_running("alpha"));
		assert_eq!(controller.running_pid("alpha"), Some(pid));

		let err = controller
			.start_detached("alpha", fake_daemon(dir.path(), "alpha"), Duration::from_secs(5))
			.await
			.unwrap_err();
		assert!(matches!(err, DaemonError::AlreadyRunning { pid: owner, .. } if owner == pid));

		assert!(controller.stop("alpha", Duration::from_secs(5)).await.unwrap());
		wait_until(|| !process_alive(pid)).await;
		assert!(!controller.is_daemon_running("alpha"));
		assert!(!controller.stop("alpha", Duration::from_secs(1)).await.unwrap());
	}

	#[tokio::test]
	async fn detached_daemon_that_exits_is_reported() {
		let dir = TempDir::new().unwrap();
		let controller = DaemonController::new(dir.path());
		let mut cmd = std::process::Command::new("sh");
		cmd.arg("-c").arg("echo 'coordinator unreachable' >&2; exit 3");

		let err = controller
			.start_detached("alpha", cmd, Duration::from_secs(5))
			.await
			.unwrap_err();
		match err {
			DaemonError::ExitedEarly { log, .. } => {
				let output = std::fs::read_to_string(log).unwrap();
				assert!(output.contains("coordinator unreachable"));
			}
			other => panic!("unexpected error: {other}"),
		}
	}

	#[tokio::test]
	async fn detached_daemon_that_never_gets_ready_is_killed() {
		let dir = TempDir::new().unwrap();
		let controller = DaemonController::new(dir.path());
		let mut cmd = std::process::Command::new("sh");
		cmd.arg("-c").arg("exec sleep 30");

		let err = controller
			.start_detached("alpha", cmd, Duration::from_millis(200))
			.await
			.unwrap_err();
		assert!(matches!(err, DaemonError::ReadyTimeout { .. }));
		assert!(!controller.is_daemon_running("alpha"));
	}
}
