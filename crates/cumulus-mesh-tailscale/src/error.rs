// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use cumulus_common_http::{is_retryable_status, RetryableError};
use cumulus_mesh_common::LockError;
use reqwest::StatusCode;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AuthKeyError {
	#[error("coordinator {url} is unreachable: {source}")]
	Unreachable {
		url: String,
		#[source]
		source: reqwest::Error,
	},

	#[error("coordinator rejected the API key ({status})")]
	Unauthorized { status: u16 },

	#[error("coordinator API error: {status} - {message}")]
	Api { status: u16, message: String },

	#[error("unexpected coordinator response: {0}")]
	InvalidResponse(String),

	#[error("invalid coordinator URL: {0}")]
	InvalidUrl(#[from] url::ParseError),
}

impl RetryableError for AuthKeyError {
	fn is_retryable(&self) -> bool {
		match self {
			AuthKeyError::Unreachable { source, .. } => source.is_retryable(),
			AuthKeyError::Api { status, .. } => StatusCode::from_u16(*status)
				.map(is_retryable_status)
				.unwrap_or(false),
			AuthKeyError::Unauthorized { .. } | AuthKeyError::InvalidResponse(_) | AuthKeyError::InvalidUrl(_) => {
				false
			}
		}
	}
}

#[derive(Error, Debug)]
pub enum MeshClientError {
	#[error("failed to obtain auth key: {0}")]
	AuthKey(#[from] AuthKeyError),

	#[error("mesh backend failed: {0}")]
	Backend(String),

	#[error("failed to start mesh backend: {0}")]
	Spawn(#[source] std::io::Error),

	#[error("mesh handshake did not complete within {0:?}")]
	Timeout(Duration),

	#[error("connect cancelled")]
	Cancelled,

	#[error("mesh client is not connected")]
	NotConnected,

	#[error("mesh client is already {0}")]
	Busy(&'static str),
}

#[derive(Error, Debug)]
pub enum ProxyStartError {
	#[error("failed to bind SOCKS5 proxy on 127.0.0.1:{port}: {source}")]
	Bind {
		port: u16,
		#[source]
		source: std::io::Error,
	},

	#[error("mesh client is not connected")]
	NotConnected,
}

#[derive(Error, Debug)]
pub enum DaemonError {
	#[error("mesh daemon for cluster {cluster} is already running (pid {pid})")]
	AlreadyRunning { cluster: String, pid: u32 },

	#[error("invalid cluster id {0:?}")]
	InvalidCluster(String),

	#[error("mesh daemon for cluster {cluster} did not become ready within {timeout:?}; see {}", .log.display())]
	ReadyTimeout {
		cluster: String,
		timeout: Duration,
		log: PathBuf,
	},

	#[error("mesh daemon for cluster {cluster} exited before becoming ready ({status}); see {}", .log.display())]
	ExitedEarly {
		cluster: String,
		status: String,
		log: PathBuf,
	},

	#[error("failed to spawn mesh daemon: {0}")]
	Spawn(#[source] std::io::Error),

	#[error("daemon lock: {0}")]
	Lock(#[source] LockError),

	#[error(transparent)]
	Client(#[from] MeshClientError),

	#[error(transparent)]
	Proxy(#[from] ProxyStartError),

	#[error("runtime file error: {0}")]
	Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn server_errors_are_retryable() {
		let err = AuthKeyError::Api {
			status: 503,
			message: "unavailable".to_string(),
		};
		assert!(err.is_retryable());
	}

	#[test]
	fn rejections_are_not_retryable() {
		assert!(!AuthKeyError::Unauthorized { status: 401 }.is_retryable());
		assert!(!AuthKeyError::Api {
			status: 400,
			message: "bad request".to_string(),
		}
		.is_retryable());
		assert!(!AuthKeyError::InvalidResponse("missing key".to_string()).is_retryable());
	}
}
