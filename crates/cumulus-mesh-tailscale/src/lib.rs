// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Coordinator-based mesh.
//!
//! [`HeadscaleManager`] issues join credentials, [`EmbeddedMeshClient`]
//! joins the mesh from inside this process and optionally serves SOCKS5,
//! and [`DaemonController`] keeps one such client running per cluster.

pub mod backend;
pub mod client;
pub mod daemon;
pub mod error;
pub mod headscale;
pub mod socks5;

pub use backend::{BackendDialer, BackendStatus, ConnectParams, MeshBackend, TailscaledBackend, TailscaledConfig};
pub use client::{EmbeddedMeshClient, MeshClientConfig, MeshState, MeshStatus};
pub use daemon::{
	termination_signal, DaemonController, DaemonStatus, ForegroundOptions, ReadyMarker, DEFAULT_READY_TIMEOUT,
	DEFAULT_STOP_GRACE,
};
pub use error::{AuthKeyError, DaemonError, MeshClientError, ProxyStartError};
pub use headscale::{AuthKey, AuthKeyOptions, AuthKeySource, HeadscaleManager, HeadscaleUser, StaticAuthKey};
pub use socks5::{connect_via, Dialer, DirectDialer, Socks5Server, TargetAddr};
