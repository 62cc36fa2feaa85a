// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Runs one operation against every node of a cluster.
//!
//! Each host is an independent unit of work with its own connection. Host
//! failures are collected and never abort the remaining hosts.

use crate::error::{HostError, HostFailure, PeerApplyError};
use cumulus_mesh_common::Node;
use cumulus_mesh_remote::{Connection, ConnectionConfig, ConnectionManager};
use futures::future::BoxFuture;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

pub const DEFAULT_WORKERS: usize = 4;
pub const DEFAULT_HOST_TIMEOUT: Duration = Duration::from_secs(180);

#[derive(Debug, Clone)]
pub struct FleetOptions {
	/// Hosts worked on concurrently. Zero is treated as one.
	pub workers: usize,
	/// Bounds connect plus operation on a single host.
	pub host_timeout: Duration,
	/// Minimum spacing between two host starts, to spare a shared bastion.
	pub inter_host_delay: Duration,
}

impl Default for FleetOptions {
	fn default() -> Self {
		Self {
			workers: DEFAULT_WORKERS,
			host_timeout: DEFAULT_HOST_TIMEOUT,
			inter_host_delay: Duration::ZERO,
		}
	}
}

impl FleetOptions {
	pub fn sequential(inter_host_delay: Duration) -> Self {
		Self {
			workers: 1,
			inter_host_delay,
			..Self::default()
		}
	}
}

#[derive(Debug, Clone)]
pub struct HostTarget {
	pub node: Node,
	pub config: ConnectionConfig,
}

#[derive(Debug)]
pub struct FleetReport<T> {
	/// Hosts that succeeded, in completion order.
	pub successes: Vec<(Node, T)>,
	pub failures: Vec<HostFailure>,
	pub duration: Duration,
}

impl<T> FleetReport<T> {
	pub fn success_count(&self) -> usize {
		self.successes.len()
	}

	pub fn fail_count(&self) -> usize {
		self.failures.len()
	}

	pub fn total(&self) -> usize {
		self.success_count() + self.fail_count()
	}

	/// True when hosts were attempted and none succeeded.
	pub fn is_total_failure(&self) -> bool {
		self.successes.is_empty() && !self.failures.is_empty()
	}
}

pub type HostOperation<T> =
	dyn Fn(Node, Arc<dyn Connection>) -> BoxFuture<'static, Result<T, PeerApplyError>> + Send + Sync;

struct StartGate {
	spacing: Duration,
	last: Mutex<Option<Instant>>,
}

impl StartGate {
	async fn wait(&self) {
		if self.spacing.is_zero() {
			return;
		}
		let mut last = self.last.lock().await;
		if let Some(previous) = *last {
			let elapsed = previous.elapsed();
			if elapsed < self.spacing {
				tokio::time::sleep(self.spacing - elapsed).await;
			}
		}
		*last = Some(Instant::now());
	}
}

/// Connect and operation share one deadline. A connection that outlives
/// the deadline is closed here before the timeout is reported.
async fn run_host<T>(
	connections: &ConnectionManager,
	target: &HostTarget,
	op: &HostOperation<T>,
	host_timeout: Duration,
) -> Result<T, HostError> {
	let deadline = tokio::time::Instant::now() + host_timeout;
	let conn: Arc<dyn Connection> = match tokio::time::timeout_at(deadline, connections.connect(&target.config)).await {
		Ok(conn) => Arc::from(conn.map_err(HostError::Connect)?),
		Err(_) => return Err(HostError::Timeout(host_timeout)),
	};
	let result = tokio::time::timeout_at(deadline, op(target.node.clone(), conn.clone())).await;
	conn.close().await;
	match result {
		Ok(outcome) => Ok(outcome?),
		Err(_) => Err(HostError::Timeout(host_timeout)),
	}
}

fn failure(node: &Node, error: &HostError) -> HostFailure {
	let unreachable = match error {
		HostError::Connect(_) | HostError::Timeout(_) => true,
		HostError::Apply(_) => false,
	};
	HostFailure {
		host: node.name.clone(),
		error: error.to_string(),
		unreachable,
	}
}

/// Applies `op` to every target and collects per-host outcomes. The report
/// is returned even when every host failed; callers decide what counts as
/// fatal.
#[instrument(skip_all, fields(operation = %operation, hosts = targets.len(), workers = options.workers))]
pub async fn apply_to_fleet<T>(
	operation: &str,
	connections: &ConnectionManager,
	targets: Vec<HostTarget>,
	options: &FleetOptions,
	op: &HostOperation<T>,
) -> FleetReport<T>
where
	T: Send,
{
	let started = Instant::now();
	let gate = StartGate {
		spacing: options.inter_host_delay,
		last: Mutex::new(None),
	};
	let gate = &gate;
	let workers = options.workers.max(1);
	let host_timeout = options.host_timeout;

	let outcomes: Vec<(Node, Result<T, HostError>)> = stream::iter(targets)
		.map(|target| async move {
			gate.wait().await;
			debug!(host = %target.node.name, address = %target.config.host, "starting host");
			let outcome = run_host(connections, &target, op, host_timeout).await;
			(target.node, outcome)
		})
		.buffer_unordered(workers)
		.collect()
		.await;

	let mut report = FleetReport {
		successes: Vec::new(),
		failures: Vec::new(),
		duration: Duration::ZERO,
	};
	for (node, outcome) in outcomes {
		match outcome {
			Ok(value) => report.successes.push((node, value)),
			Err(error) => {
				warn!(host = %node.name, error = %error, "{operation} failed on host");
				report.failures.push(failure(&node, &error));
			}
		}
	}
	report.duration = started.elapsed();

	info!(
		operation,
		success_count = report.success_count(),
		fail_count = report.fail_count(),
		duration_ms = report.duration.as_millis() as u64,
		"fleet operation finished"
	);
	report
}
