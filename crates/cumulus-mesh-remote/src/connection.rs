// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::config::ConnectionConfig;
use crate::error::{Result, TransportError};
use async_trait::async_trait;

/// An open remote-execution channel to one host. Owned by the caller that
/// opened it and never shared between concurrent operations.
#[async_trait]
pub trait Connection: Send + Sync {
	/// Host name or address this connection was opened to.
	fn host(&self) -> &str;

	/// Runs one command and returns its combined stdout and stderr. Never
	/// retries: a command is only safe to re-run if the caller made it so.
	async fn execute(&self, command: &str) -> Result<String>;

	/// Releases the channel. Safe to call more than once.
	async fn close(&self);
}

/// Performs one connect handshake. Retrying is the
/// [`ConnectionManager`](crate::ConnectionManager)'s job.
#[async_trait]
pub trait Connector: Send + Sync {
	async fn connect(
		&self,
		config: &ConnectionConfig,
	) -> std::result::Result<Box<dyn Connection>, TransportError>;
}
