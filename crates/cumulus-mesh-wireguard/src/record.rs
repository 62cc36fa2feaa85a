// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Operation records emitted after every join and leave.

use crate::error::HostFailure;
use crate::fleet::FleetReport;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
	Success,
	Partial,
	Failed,
}

impl OperationStatus {
	pub fn from_counts(success_count: usize, fail_count: usize) -> Self {
		match (success_count, fail_count) {
			(_, 0) => OperationStatus::Success,
			(0, _) => OperationStatus::Failed,
			_ => OperationStatus::Partial,
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationRecord {
	pub id: Uuid,
	pub operation: String,
	pub cluster: String,
	pub status: OperationStatus,
	pub started_at: DateTime<Utc>,
	pub duration_ms: u64,
	pub affected_nodes: usize,
	pub success_count: usize,
	pub fail_count: usize,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub errors: Vec<HostFailure>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub detail: Option<String>,
}

impl OperationRecord {
	pub fn from_report<T>(
		operation: &str,
		cluster: &str,
		started_at: DateTime<Utc>,
		report: &FleetReport<T>,
		detail: Option<String>,
	) -> Self {
		Self {
			id: Uuid::new_v4(),
			operation: operation.to_string(),
			cluster: cluster.to_string(),
			status: OperationStatus::from_counts(report.success_count(), report.fail_count()),
			started_at,
			duration_ms: report.duration.as_millis() as u64,
			affected_nodes: report.total(),
			success_count: report.success_count(),
			fail_count: report.fail_count(),
			errors: report.failures.clone(),
			detail,
		}
	}
}

#[async_trait]
pub trait OperationRecorder: Send + Sync {
	/// Best effort; a recorder must not fail the operation it records.
	async fn record(&self, record: &OperationRecord);
}

/// Emits records as structured log events only.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingRecorder;

#[async_trait]
impl OperationRecorder for TracingRecorder {
	async fn record(&self, record: &OperationRecord) {
		info!(
			id = %record.id,
			operation = %record.operation,
			cluster = %record.cluster,
			status = ?record.status,
			duration_ms = record.duration_ms,
			success_count = record.success_count,
			fail_count = record.fail_count,
			"operation recorded"
		);
	}
}

/// Appends one JSON object per line.
pub struct JsonlRecorder {
	path: PathBuf,
	file: Mutex<Option<tokio::fs::File>>,
}

impl JsonlRecorder {
	pub fn new(path: impl Into<PathBuf>) -> Self {
		Self {
			path: path.into(),
			file: Mutex::new(None),
		}
	}

	pub fn path(&self) -> &std::path::Path {
		&self.path
	}

	async fn append(&self, line: &str) -> std::io::Result<()> {
		let mut guard = self.file.lock().await;
		if guard.is_none() {
			if let Some(parent) = self.path.parent() {
				tokio::fs::create_dir_all(parent).await?;
			}
			let file = OpenOptions::new()
				.create(true)
				.append(true)
				.open(&self.path)
				.await?;
			*guard = Some(file);
		}
		if let Some(file) = guard.as_mut() {
			file.write_all(line.as_bytes()).await?;
			file.flush().await?;
		}
		Ok(())
	}

	pub async fn read_all(&self) -> std::io::Result<Vec<OperationRecord>> {
		let contents = match tokio::fs::read_to_string(&self.path).await {
			Ok(contents) => contents,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
			Err(e) => return Err(e),
		};
		Ok(contents
			.lines()
			.filter_map(|line| serde_json::from_str(line).ok())
			.collect())
	}
}

#[async_trait]
impl OperationRecorder for JsonlRecorder {
	async fn record(&self, record: &OperationRecord) {
		let line = match serde_json::to_string(record) {
			Ok(json) => format!("{json}\n"),
			Err(e) => {
				warn!(error = %e, "failed to serialize operation record");
				return;
			}
		};
		if let Err(e) = self.append(&line).await {
			warn!(path = %self.path.display(), error = %e, "failed to append operation record");
		}
	}
}
