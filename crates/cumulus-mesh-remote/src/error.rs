// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use cumulus_common_http::RetryableError;
use std::time::Duration;
use thiserror::Error;

/// Failure to establish or keep a transport channel to a host.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
	#[error("timed out after {0:?}")]
	Timeout(Duration),

	#[error("connection refused: {0}")]
	Refused(String),

	#[error("could not resolve host: {0}")]
	Unresolvable(String),

	#[error("unreachable: {0}")]
	Unreachable(String),

	#[error("authentication failed: {0}")]
	AuthenticationFailed(String),

	#[error("host key verification failed: {0}")]
	HostKeyMismatch(String),

	#[error("transient ssh failure: {0}")]
	Transient(String),

	#[error("failed to run ssh: {0}")]
	Spawn(String),
}

impl TransportError {
	/// Maps OpenSSH client diagnostics (exit status 255) to a failure kind.
	pub fn classify(stderr: &str) -> Self {
		let message = stderr.trim().to_string();
		let lower = message.to_ascii_lowercase();

		if lower.contains("permission denied") || lower.contains("too many authentication failures") {
			TransportError::AuthenticationFailed(message)
		} else if lower.contains("host key verification failed")
			|| lower.contains("remote host identification has changed")
		{
			TransportError::HostKeyMismatch(message)
		} else if lower.contains("connection refused") {
			TransportError::Refused(message)
		} else if lower.contains("could not resolve hostname")
			|| lower.contains("name or service not known")
			|| lower.contains("nodename nor servname")
		{
			TransportError::Unresolvable(message)
		} else if lower.contains("no route to host") || lower.contains("network is unreachable") {
			TransportError::Unreachable(message)
		} else if lower.contains("timed out") {
			TransportError::Timeout(Duration::ZERO)
		} else {
			TransportError::Transient(message)
		}
	}
}

impl RetryableError for TransportError {
	fn is_retryable(&self) -> bool {
		!matches!(
			self,
			TransportError::AuthenticationFailed(_)
				| TransportError::HostKeyMismatch(_)
				| TransportError::Spawn(_)
		)
	}
}

#[derive(Error, Debug)]
pub enum RemoteError {
	#[error("failed to connect to {host} after {attempts} attempt(s): {cause}")]
	Connection {
		host: String,
		attempts: u32,
		#[source]
		cause: TransportError,
	},

	#[error("command on {host} exited with status {status}: {output}")]
	CommandFailed {
		host: String,
		status: i32,
		output: String,
	},

	#[error("command on {host} timed out after {timeout:?}")]
	CommandTimeout { host: String, timeout: Duration },

	#[error("connection to {host} lost: {cause}")]
	Transport {
		host: String,
		#[source]
		cause: TransportError,
	},

	#[error("connection to {host} is closed")]
	Closed { host: String },
}

impl RemoteError {
	pub fn host(&self) -> &str {
		match self {
			RemoteError::Connection { host, .. }
			| RemoteError::CommandFailed { host, .. }
			| RemoteError::CommandTimeout { host, .. }
			| RemoteError::Transport { host, .. }
			| RemoteError::Closed { host } => host,
		}
	}

	/// True when the host could not be reached at all, as opposed to a
	/// command failing on a reachable host.
	pub fn is_connection_failure(&self) -> bool {
		matches!(
			self,
			RemoteError::Connection { .. } | RemoteError::Transport { .. }
		)
	}
}

pub type Result<T> = std::result::Result<T, RemoteError>;
