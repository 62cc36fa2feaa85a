// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Self-managed WireGuard full mesh.
//!
//! [`VpnManager`] drives join and leave across a cluster: it allocates an
//! address in the [`PeerRegistry`], applies the peer to every node through
//! the [`ConfigManager`] and collects per-host results into a
//! [`FleetReport`].

pub mod client_config;
pub mod config_manager;
pub mod error;
pub mod fleet;
pub mod health;
pub mod manager;
pub mod record;
pub mod registry;
pub mod script;
pub mod tooling;

pub use client_config::{ClientConfig, ClientPeer};
pub use config_manager::{parse_config_peers, parse_dump, ConfigManager, ConfiguredPeer, LivePeer, BACKUP_RETENTION};
pub use error::{ApplyCause, ApplyStage, HostError, HostFailure, PeerApplyError, RegistryError, Result, VpnError};
pub use fleet::{apply_to_fleet, FleetOptions, FleetReport, HostOperation, HostTarget};
pub use health::{HealthChecker, NodeHealth, SshSettings};
pub use manager::{Cluster, ClusterStatus, JoinOutcome, JoinRequest, LeaveOutcome, LeaveSelector, VpnManager};
pub use record::{JsonlRecorder, OperationRecord, OperationRecorder, OperationStatus, TracingRecorder};
pub use registry::{Allocated, Allocation, FileRegistryStore, MemoryRegistryStore, PeerRegistry, RegistryStore};
pub use tooling::{MeshTooling, WgQuickTooling};
