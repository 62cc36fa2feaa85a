// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Per-cluster peer bookkeeping.
//!
//! Every mutation is a full load-mutate-save cycle under two locks: an
//! in-process mutex per cluster and the store's own cross-process lock.

use crate::error::RegistryError;
use async_trait::async_trait;
use cumulus_mesh_common::{ensure_usable_host, usable_hosts, validate_label, IpRange, PidFile, RegisteredPeer, WgPublicKey};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

pub type Result<T> = std::result::Result<T, RegistryError>;

const STORE_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

/// Held for the duration of one load-mutate-save cycle.
pub struct StoreLock {
	_file: Option<PidFile>,
}

impl StoreLock {
	pub fn none() -> Self {
		Self { _file: None }
	}
}

#[async_trait]
pub trait RegistryStore: Send + Sync {
	/// All peers of `cluster` in registration order; empty if none exist yet.
	async fn load(&self, cluster: &str) -> Result<Vec<RegisteredPeer>>;

	/// Replaces the stored peers of `cluster` in one write.
	async fn save(&self, cluster: &str, peers: &[RegisteredPeer]) -> Result<()>;

	/// Excludes other processes from mutating `cluster` until dropped.
	async fn lock(&self, cluster: &str) -> Result<StoreLock>;
}

#[derive(Debug, Serialize, Deserialize)]
struct RegistryFile {
	cluster: String,
	peers: Vec<RegisteredPeer>,
}

/// One JSON document per cluster under a directory, replaced atomically.
pub struct FileRegistryStore {
	dir: PathBuf,
}

impl FileRegistryStore {
	pub fn new(dir: impl Into<PathBuf>) -> Self {
		Self { dir: dir.into() }
	}

	fn cluster_path(&self, cluster: &str) -> Result<PathBuf> {
		validate_label(cluster).map_err(|_| RegistryError::InvalidCluster(cluster.to_string()))?;
		Ok(self.dir.join(format!("{cluster}.json")))
	}
}

#[async_trait]
impl RegistryStore for FileRegistryStore {
	async fn load(&self, cluster: &str) -> Result<Vec<RegisteredPeer>> {
		let path = self.cluster_path(cluster)?;
		let contents = match tokio::fs::read_to_string(&path).await {
			Ok(contents) => contents,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
				debug!(cluster, path = %path.display(), "registry file not found");
				return Ok(Vec::new());
			}
			Err(e) => return Err(e.into()),
		};
		let file: RegistryFile =
			serde_json::from_str(&contents).map_err(|source| RegistryError::Corrupt { path, source })?;
		Ok(file.peers)
	}

	async fn save(&self, cluster: &str, peers: &[RegisteredPeer]) -> Result<()> {
		tokio::fs::create_dir_all(&self.dir).await?;

		let path = self.cluster_path(cluster)?;
		let tmp_path = self.dir.join(format!("{cluster}.json.tmp"));
		let json = serde_json::to_string_pretty(&RegistryFile {
			cluster: cluster.to_string(),
			peers: peers.to_vec(),
		})
		.map_err(|source| RegistryError::Corrupt {
			path: path.clone(),
			source,
		})?;

		tokio::fs::write(&tmp_path, &json).await?;
		tokio::fs::rename(&tmp_path, &path).await?;

		debug!(cluster, peers = peers.len(), path = %path.display(), "saved registry");
		Ok(())
	}

	async fn lock(&self, cluster: &str) -> Result<StoreLock> {
		let path = self.cluster_path(cluster)?.with_extension("lock");
		let file = PidFile::acquire_timeout(&path, STORE_LOCK_TIMEOUT).await?;
		Ok(StoreLock { _file: Some(file) })
	}
}

#[derive(Default)]
pub struct MemoryRegistryStore {
	clusters: std::sync::Mutex<HashMap<String, Vec<RegisteredPeer>>>,
}

impl MemoryRegistryStore {
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait]
impl RegistryStore for MemoryRegistryStore {
	async fn load(&self, cluster: &str) -> Result<Vec<RegisteredPeer>> {
		let clusters = self.clusters.lock().unwrap_or_else(|e| e.into_inner());
		Ok(clusters.get(cluster).cloned().unwrap_or_default())
	}

	async fn save(&self, cluster: &str, peers: &[RegisteredPeer]) -> Result<()> {
		let mut clusters = self.clusters.lock().unwrap_or_else(|e| e.into_inner());
		clusters.insert(cluster.to_string(), peers.to_vec());
		Ok(())
	}

	async fn lock(&self, _cluster: &str) -> Result<StoreLock> {
		Ok(StoreLock::none())
	}
}

/// Input to [`PeerRegistry::allocate`].
#[derive(Debug, Clone)]
pub struct Allocation {
	pub public_key: WgPublicKey,
	pub label: Option<String>,
	/// Explicit address; the next free one is chosen when `None`.
	pub vpn_ip: Option<Ipv4Addr>,
	pub subnet: Ipv4Net,
	pub reserved: Vec<IpRange>,
}

#[derive(Debug, Clone)]
pub struct Allocated {
	pub peer: RegisteredPeer,
	/// Entry with the same label that this allocation replaced.
	pub replaced: Option<RegisteredPeer>,
}

pub struct PeerRegistry {
	store: Arc<dyn RegistryStore>,
	locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

fn first_free(
	cluster: &str,
	subnet: &Ipv4Net,
	reserved: &[IpRange],
	peers: &[RegisteredPeer],
) -> Result<Ipv4Addr> {
	let taken: HashSet<Ipv4Addr> = peers.iter().map(|p| p.vpn_ip).collect();
	usable_hosts(subnet)
		.find(|ip| !taken.contains(ip) && !reserved.iter().any(|r| r.contains(*ip)))
		.ok_or_else(|| RegistryError::AddressSpaceExhausted {
			cluster: cluster.to_string(),
			subnet: *subnet,
		})
}

fn check_unique(cluster: &str, peers: &[RegisteredPeer], candidate: &RegisteredPeer) -> Result<()> {
	if peers.iter().any(|p| p.public_key == candidate.public_key) {
		return Err(RegistryError::DuplicateKey {
			cluster: cluster.to_string(),
			public_key: candidate.public_key.to_base64(),
		});
	}
	if peers.iter().any(|p| p.vpn_ip == candidate.vpn_ip) {
		return Err(RegistryError::DuplicateAddress {
			cluster: cluster.to_string(),
			address: candidate.vpn_ip,
		});
	}
	Ok(())
}

impl PeerRegistry {
	pub fn new(store: Arc<dyn RegistryStore>) -> Self {
		Self {
			store,
			locks: Mutex::new(HashMap::new()),
		}
	}

	pub fn in_memory() -> Self {
		Self::new(Arc::new(MemoryRegistryStore::new()))
	}

	async fn cluster_lock(&self, cluster: &str) -> Arc<Mutex<()>> {
		let mut locks = self.locks.lock().await;
		locks
			.entry(cluster.to_string())
			.or_insert_with(|| Arc::new(Mutex::new(())))
			.clone()
	}

	/// Runs `mutate` inside one locked load-mutate-save cycle. The store is
	/// only rewritten when `mutate` reports a change.
	async fn mutate<T, F>(&self, cluster: &str, mutate: F) -> Result<T>
	where
		F: FnOnce(&mut Vec<RegisteredPeer>) -> Result<(T, bool)>,
	{
		let lock = self.cluster_lock(cluster).await;
		let _guard = lock.lock().await;
		let _store_lock = self.store.lock(cluster).await?;

		let mut peers = self.store.load(cluster).await?;
		let (value, changed) = mutate(&mut peers)?;
		if changed {
			self.store.save(cluster, &peers).await?;
		}
		Ok(value)
	}

	pub async fn list(&self, cluster: &str) -> Result<Vec<RegisteredPeer>> {
		self.store.load(cluster).await
	}

	/// First address of `subnet`, in increasing order, that is neither
	/// reserved nor registered.
	#[instrument(skip(self, reserved), fields(subnet = %subnet))]
	pub async fn next_available_ip(&self, cluster: &str, subnet: &Ipv4Net, reserved: &[IpRange]) -> Result<Ipv4Addr> {
		let peers = self.store.load(cluster).await?;
		first_free(cluster, subnet, reserved, &peers)
	}

	/// Inserts `peer`. Fails without touching the registry if its key or
	/// address is already present.
	#[instrument(skip(self, peer), fields(public_key = %peer.public_key.short(), vpn_ip = %peer.vpn_ip))]
	pub async fn register(&self, cluster: &str, peer: RegisteredPeer) -> Result<RegisteredPeer> {
		self.mutate(cluster, |peers| {
			check_unique(cluster, peers, &peer)?;
			peers.push(peer.clone());
			Ok((peer.clone(), true))
		})
		.await?;
		info!("peer registered");
		Ok(peer)
	}

	/// Chooses (or validates) an address and registers the peer in the same
	/// locked cycle. A registered peer with the same label is replaced, and
	/// its address reused when none is requested.
	#[instrument(skip(self, request), fields(public_key = %request.public_key.short()))]
	pub async fn allocate(&self, cluster: &str, request: Allocation) -> Result<Allocated> {
		let allocated = self
			.mutate(cluster, |peers| {
				let replaced = request.label.as_ref().and_then(|label| {
					peers
						.iter()
						.position(|p| p.label.as_ref() == Some(label))
						.map(|idx| peers.remove(idx))
				});

				let vpn_ip = match (request.vpn_ip, &replaced) {
					(Some(ip), _) => {
						ensure_usable_host(ip, &request.subnet)?;
						if request.reserved.iter().any(|r| r.contains(ip)) {
							return Err(RegistryError::ReservedAddress {
								cluster: cluster.to_string(),
								address: ip,
							});
						}
						ip
					}
					(None, Some(old)) => old.vpn_ip,
					(None, None) => first_free(cluster, &request.subnet, &request.reserved, peers)?,
				};

				let peer = RegisteredPeer::new(request.public_key, vpn_ip, request.label.clone());
				check_unique(cluster, peers, &peer)?;
				peers.push(peer.clone());
				Ok((Allocated { peer, replaced }, true))
			})
			.await?;

		info!(
			vpn_ip = %allocated.peer.vpn_ip,
			replaced = allocated.replaced.is_some(),
			"peer allocated"
		);
		Ok(allocated)
	}

	pub async fn get_by_label(&self, cluster: &str, label: &str) -> Result<RegisteredPeer> {
		self.find(cluster, |p| p.label.as_deref() == Some(label), || format!("label {label}"))
			.await
	}

	pub async fn get_by_ip(&self, cluster: &str, vpn_ip: Ipv4Addr) -> Result<RegisteredPeer> {
		self.find(cluster, |p| p.vpn_ip == vpn_ip, || format!("address {vpn_ip}"))
			.await
	}

	pub async fn get_by_public_key(&self, cluster: &str, public_key: &WgPublicKey) -> Result<RegisteredPeer> {
		self.find(cluster, |p| &p.public_key == public_key, || format!("public key {}", public_key.short()))
			.await
	}

	async fn find<P, D>(&self, cluster: &str, predicate: P, describe: D) -> Result<RegisteredPeer>
	where
		P: Fn(&RegisteredPeer) -> bool,
		D: FnOnce() -> String,
	{
		self.store
			.load(cluster)
			.await?
			.into_iter()
			.find(|p| predicate(p))
			.ok_or_else(|| RegistryError::NotFound {
				cluster: cluster.to_string(),
				what: describe(),
			})
	}

	/// Removes the peer with `public_key`, returning it. Removing an absent
	/// key is a successful no-op that returns `None` and writes nothing.
	#[instrument(skip(self, public_key), fields(public_key = %public_key.short()))]
	pub async fn unregister(&self, cluster: &str, public_key: &WgPublicKey) -> Result<Option<RegisteredPeer>> {
		let removed = self
			.mutate(cluster, |peers| {
				let removed = peers
					.iter()
					.position(|p| &p.public_key == public_key)
					.map(|idx| peers.remove(idx));
				let changed = removed.is_some();
				Ok((removed, changed))
			})
			.await?;

		if removed.is_some() {
			info!("peer unregistered");
		} else {
			debug!("peer was not registered");
		}
		Ok(removed)
	}
}
