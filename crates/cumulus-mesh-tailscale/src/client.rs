// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Embedded mesh client.
//!
//! Joins the coordinator-based mesh from inside this process and can expose
//! the session to other local tools through a SOCKS5 proxy.

use crate::backend::{BackendDialer, BackendStatus, ConnectParams, MeshBackend};
use crate::error::{MeshClientError, ProxyStartError};
use crate::headscale::AuthKeySource;
use crate::socks5::Socks5Server;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use url::Url;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeshState {
	Stopped,
	Connecting,
	Running,
	Disconnecting,
}

impl MeshState {
	pub fn as_str(&self) -> &'static str {
		match self {
			MeshState::Stopped => "stopped",
			MeshState::Connecting => "connecting",
			MeshState::Running => "running",
			MeshState::Disconnecting => "disconnecting",
		}
	}
}

impl fmt::Display for MeshState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

#[derive(Debug, Clone)]
pub struct MeshClientConfig {
	pub hostname: String,
	pub coordinator_url: Url,
	/// Bound on credential issuance plus handshake.
	pub connect_timeout: Duration,
	pub ephemeral: bool,
}

impl MeshClientConfig {
	pub fn new(hostname: impl Into<String>, coordinator_url: Url) -> Self {
		Self {
			hostname: hostname.into(),
			coordinator_url,
			connect_timeout: DEFAULT_CONNECT_TIMEOUT,
			ephemeral: true,
		}
	}

	pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
		self.connect_timeout = timeout;
		self
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshStatus {
	pub state: MeshState,
	pub mesh_ip: Option<IpAddr>,
	pub peer_count: usize,
	pub coordinator_url: String,
	pub hostname: String,
	pub proxy_port: Option<u16>,
}

struct ProxyHandle {
	port: u16,
	cancel: CancellationToken,
	task: JoinHandle<()>,
}

pub struct EmbeddedMeshClient {
	backend: Arc<dyn MeshBackend>,
	auth: Arc<dyn AuthKeySource>,
	config: MeshClientConfig,
	state: watch::Sender<MeshState>,
	proxy: Mutex<Option<ProxyHandle>>,
}

impl EmbeddedMeshClient {
	pub fn new(backend: Arc<dyn MeshBackend>, auth: Arc<dyn AuthKeySource>, config: MeshClientConfig) -> Self {
		let (state, _) = watch::channel(MeshState::Stopped);
		Self {
			backend,
			auth,
			config,
			state,
			proxy: Mutex::new(None),
		}
	}

	pub fn config(&self) -> &MeshClientConfig {
		&self.config
	}

	pub fn state(&self) -> MeshState {
		*self.state.borrow()
	}

	pub fn subscribe(&self) -> watch::Receiver<MeshState> {
		self.state.subscribe()
	}

	/// Moves `from -> to` if the client is in one of `from`. Returns the
	/// state observed before the attempt.
	fn transition(&self, from: &[MeshState], to: MeshState) -> Result<MeshState, MeshState> {
		let mut observed = MeshState::Stopped;
		let moved = self.state.send_if_modified(|state| {
			observed = *state;
			if from.contains(state) {
				*state = to;
				true
			} else {
				false
			}
		});
		if moved {
			debug!(from = %observed, to = %to, "mesh state changed");
			Ok(observed)
		} else {
			Err(observed)
		}
	}

	/// Issues a credential, brings the backend up and waits for the
	/// handshake. Returns early on cancellation or when the connect timeout
	/// elapses; either way the backend is torn down again.
	#[instrument(skip(self, cancel), fields(hostname = %self.config.hostname, coordinator = %self.config.coordinator_url))]
	pub async fn connect(&self, cancel: &CancellationToken) -> Result<MeshStatus, MeshClientError> {
		if let Err(current) = self.transition(&[MeshState::Stopped], MeshState::Connecting) {
			return match current {
				MeshState::Running => self.status().await,
				other => Err(MeshClientError::Busy(other.as_str())),
			};
		}

		let timeout = self.config.connect_timeout;
		let result = tokio::select! {
			_ = cancel.cancelled() => Err(MeshClientError::Cancelled),
			outcome = tokio::time::timeout(timeout, self.establish()) => {
				outcome.unwrap_or(Err(MeshClientError::Timeout(timeout)))
			}
		};

		match result {
			Ok(backend) => {
				self.state.send_replace(MeshState::Running);
				info!(mesh_ip = ?backend.mesh_ip, peers = backend.peer_count, "mesh connected");
				Ok(self.snapshot(MeshState::Running, &backend, None))
			}
			Err(e) => {
				warn!(error = %e, "mesh connect failed");
				if let Err(down) = self.backend.down().await {
					warn!(error = %down, "failed to tear down backend after connect failure");
				}
				self.state.send_replace(MeshState::Stopped);
				Err(e)
			}
		}
	}

	async fn establish(&self) -> Result<BackendStatus, MeshClientError> {
		let auth_key = self.auth.auth_key(self.config.ephemeral).await?;
		let params = ConnectParams {
			hostname: self.config.hostname.clone(),
			auth_key,
			coordinator_url: self.config.coordinator_url.clone(),
		};
		let status = self.backend.up(&params).await?;
		if !status.online {
			return Err(MeshClientError::Backend(
				"backend finished login but is not online".to_string(),
			));
		}
		Ok(status)
	}

	fn snapshot(&self, state: MeshState, backend: &BackendStatus, proxy_port: Option<u16>) -> MeshStatus {
		MeshStatus {
			state,
			mesh_ip: backend.mesh_ip,
			peer_count: backend.peer_count,
			coordinator_url: self.config.coordinator_url.to_string(),
			hostname: self.config.hostname.clone(),
			proxy_port,
		}
	}

	pub async fn status(&self) -> Result<MeshStatus, MeshClientError> {
		let state = self.state();
		let backend = if state == MeshState::Running {
			self.backend.status().await?
		} else {
			BackendStatus::default()
		};
		let proxy_port = self.proxy.lock().await.as_ref().map(|p| p.port);
		Ok(self.snapshot(state, &backend, proxy_port))
	}

	/// Stops the proxy and tears the session down. A stopped client is left
	/// alone.
	#[instrument(skip(self), fields(hostname = %self.config.hostname))]
	pub async fn disconnect(&self) -> Result<(), MeshClientError> {
		match self.transition(&[MeshState::Running], MeshState::Disconnecting) {
			Ok(_) => {}
			Err(MeshState::Stopped) | Err(MeshState::Disconnecting) => return Ok(()),
			Err(other) => return Err(MeshClientError::Busy(other.as_str())),
		}

		self.stop_proxy().await;
		let result = self.backend.down().await;
		self.state.send_replace(MeshState::Stopped);
		match &result {
			Ok(()) => info!("mesh disconnected"),
			Err(e) => warn!(error = %e, "backend teardown reported an error"),
		}
		result
	}

	/// Serves SOCKS5 on loopback through the mesh session. Port 0 picks a
	/// free port; the bound port is returned. Starting again replaces the
	/// running proxy unless it already serves the requested port.
	#[instrument(skip(self))]
	pub async fn start_socks5_proxy(&self, port: u16) -> Result<u16, ProxyStartError> {
		if self.state() != MeshState::Running {
			return Err(ProxyStartError::NotConnected);
		}

		let mut slot = self.proxy.lock().await;
		if let Some(existing) = slot.as_ref() {
			if port == 0 || port == existing.port {
				return Ok(existing.port);
			}
		}
		if let Some(previous) = slot.take() {
			shutdown_proxy(previous).await;
		}

		let dialer = Arc::new(BackendDialer(Arc::clone(&self.backend)));
		let server = Socks5Server::bind(port, dialer)
			.await
			.map_err(|source| ProxyStartError::Bind { port, source })?;
		let bound = server
			.local_addr()
			.map_err(|source| ProxyStartError::Bind { port, source })?
			.port();

		let cancel = CancellationToken::new();
		let task = tokio::spawn(server.serve(cancel.clone()));
		*slot = Some(ProxyHandle {
			port: bound,
			cancel,
			task,
		});
		info!(port = bound, "SOCKS5 proxy started");
		Ok(bound)
	}

	/// Returns the port the proxy was serving, if any.
	pub async fn stop_proxy(&self) -> Option<u16> {
		let handle = self.proxy.lock().await.take()?;
		let port = handle.port;
		shutdown_proxy(handle).await;
		Some(port)
	}
}

async fn shutdown_proxy(handle: ProxyHandle) {
	handle.cancel.cancel();
	if let Err(e) = handle.task.await {
		warn!(port = handle.port, error = %e, "SOCKS5 proxy task ended abnormally");
	}
}
