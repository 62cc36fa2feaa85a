// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

pub mod ip;
pub mod keys;
pub mod keys_file;
pub mod lockfile;
pub mod network;
pub mod node;
pub mod peer;

pub use ip::{ensure_in_subnet, ensure_usable_host, usable_hosts, IpError, IpRange};
pub use keys::{clamp, is_clamped, KeyError, KeyGenerator, WgKeyPair, WgPrivateKey, WgPublicKey};
pub use keys_file::{get_or_create_key, load_key_file, save_key_file, KeyFileError};
pub use lockfile::{process_alive, read_pid, LockError, PidFile};
pub use network::{BastionConfig, ClusterNetwork, MeshMode, DEFAULT_LISTEN_PORT};
pub use node::{Node, NodeRole};
pub use peer::{validate_label, PeerConfig, PeerError, RegisteredPeer, DEFAULT_KEEPALIVE};
