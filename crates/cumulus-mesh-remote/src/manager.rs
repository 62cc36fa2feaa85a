// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::config::ConnectionConfig;
use crate::connection::{Connection, Connector};
use crate::error::{RemoteError, Result};
use crate::ssh::SshConnector;
use cumulus_common_http::{retry, RetryPolicy};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, instrument};

/// Opens connections with bounded retries. Each retry repeats the full
/// connect handshake.
#[derive(Clone)]
pub struct ConnectionManager {
	connector: Arc<dyn Connector>,
	policy: RetryPolicy,
}

impl ConnectionManager {
	pub fn new(connector: Arc<dyn Connector>, policy: RetryPolicy) -> Self {
		Self { connector, policy }
	}

	pub fn ssh(policy: RetryPolicy) -> Self {
		Self::new(Arc::new(SshConnector::new()), policy)
	}

	pub fn policy(&self) -> &RetryPolicy {
		&self.policy
	}

	#[instrument(skip(self, config), fields(host = %config.host, bastion = ?config.bastion_host()))]
	pub async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn Connection>> {
		let attempts = AtomicU32::new(0);
		let counter = &attempts;
		let connector = self.connector.as_ref();

		let result = retry(&self.policy, move || {
			counter.fetch_add(1, Ordering::Relaxed);
			connector.connect(config)
		})
		.await;

		match result {
			Ok(conn) => {
				debug!(attempts = attempts.load(Ordering::Relaxed), "connected");
				Ok(conn)
			}
			Err(cause) => Err(RemoteError::Connection {
				host: config.host.clone(),
				attempts: attempts.load(Ordering::Relaxed),
				cause,
			}),
		}
	}

	/// Connects, runs a no-op command and closes. Returns the round trip time.
	#[instrument(skip(self, config), fields(host = %config.host))]
	pub async fn probe(&self, config: &ConnectionConfig) -> Result<Duration> {
		let started = Instant::now();
		let conn = self.connect(config).await?;
		let result = conn.execute("true").await;
		conn.close().await;
		result.map(|_| started.elapsed())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::error::TransportError;
	use crate::testing::{HostBehavior, ScriptedConnector};
	use cumulus_common_http::Backoff;

	fn fast_policy(max_attempts: u32) -> RetryPolicy {
		RetryPolicy {
			max_attempts,
			backoff: Backoff::Fixed(Duration::from_millis(1)),
			jitter: false,
		}
	}

	#[tokio::test]
	async fn connects_first_try() {
		let connector = Arc::new(ScriptedConnector::new());
		let manager = ConnectionManager::new(connector.clone(), fast_policy(3));

		let conn = manager
			.connect(&ConnectionConfig::new("master-1", "ops"))
			.await
			.unwrap();
		assert_eq!(conn.host(), "master-1");
		conn.close().await;
		assert_eq!(connector.connect_attempts("master-1"), 1);
	}

	#[tokio::test]
	async fn retries_transient_failures() {
		let connector = Arc::new(ScriptedConnector::new().host("worker-1", HostBehavior::FlakyFor(2)));
		let manager = ConnectionManager::new(connector.clone(), fast_policy(3));

		let conn = manager
			.connect(&ConnectionConfig::new("worker-1", "ops"))
			.await
			.unwrap();
		conn.close().await;
		assert_eq!(connector.connect_attempts("worker-1"), 3);
	}

	#[tokio::test]
	async fn exhausted_retries_name_host_and_cause() {
		let connector = Arc::new(ScriptedConnector::new().host("worker-2", HostBehavior::Unreachable));
		let manager = ConnectionManager::new(connector.clone(), fast_policy(3));

		let err = manager
			.connect(&ConnectionConfig::new("worker-2", "ops"))
			.await
			.err()
			.unwrap();
		match err {
			RemoteError::Connection {
				host,
				attempts,
				cause,
			} => {
				assert_eq!(host, "worker-2");
				assert_eq!(attempts, 3);
				assert!(matches!(cause, TransportError::Refused(_)));
			}
			other => panic!("unexpected error: {other}"),
		}
	}

	#[tokio::test]
	async fn auth_failure_is_not_retried() {
		let connector = Arc::new(ScriptedConnector::new().host("worker-3", HostBehavior::AuthRejected));
		let manager = ConnectionManager::new(connector.clone(), fast_policy(5));

		let err = manager
			.connect(&ConnectionConfig::new("worker-3", "ops"))
			.await
			.err()
			.unwrap();
		assert!(matches!(err, RemoteError::Connection { attempts: 1, .. }));
		assert_eq!(connector.connect_attempts("worker-3"), 1);
	}

	#[tokio::test]
	async fn probe_runs_noop_and_closes() {
		let connector = Arc::new(ScriptedConnector::new());
		let manager = ConnectionManager::new(connector.clone(), fast_policy(1));

		manager
			.probe(&ConnectionConfig::new("master-1", "ops"))
			.await
			.unwrap();
		assert_eq!(connector.executed("master-1"), vec!["true".to_string()]);
		assert_eq!(connector.open_connections(), 0);
	}
}
