// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Connectors for tests: a scripted in-memory fleet and a local shell.

use crate::config::ConnectionConfig;
use crate::connection::{Connection, Connector};
use crate::error::{RemoteError, Result, TransportError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::process::Command;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostBehavior {
	Reachable,
	/// Every connect is refused.
	Unreachable,
	/// The first `n` connects are refused, later ones succeed.
	FlakyFor(u32),
	/// Every connect fails authentication.
	AuthRejected,
	/// Connects succeed after sleeping.
	Slow(Duration),
}

#[derive(Debug, Clone)]
enum Reply {
	Output(String),
	Fail { status: i32, output: String },
}

#[derive(Debug, Clone)]
struct Rule {
	host: Option<String>,
	needle: String,
	reply: Reply,
}

#[derive(Debug, Default)]
struct State {
	attempts: HashMap<String, u32>,
	executed: HashMap<String, Vec<String>>,
	open: usize,
}

/// An in-memory fleet. Hosts default to [`HostBehavior::Reachable`];
/// commands return the first matching scripted reply or empty output.
#[derive(Debug, Default)]
pub struct ScriptedConnector {
	behaviors: HashMap<String, HostBehavior>,
	rules: Arc<Vec<Rule>>,
	state: Arc<Mutex<State>>,
}

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
	state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ScriptedConnector {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn host(mut self, host: impl Into<String>, behavior: HostBehavior) -> Self {
		self.behaviors.insert(host.into(), behavior);
		self
	}

	/// Commands on `host` (any host when `None`) containing `needle` print `output`.
	pub fn respond(mut self, host: Option<&str>, needle: impl Into<String>, output: impl Into<String>) -> Self {
		Arc::make_mut(&mut self.rules).push(Rule {
			host: host.map(str::to_string),
			needle: needle.into(),
			reply: Reply::Output(output.into()),
		});
		self
	}

	/// Commands on `host` (any host when `None`) containing `needle` exit with `status`.
	pub fn fail_on(
		mut self,
		host: Option<&str>,
		needle: impl Into<String>,
		status: i32,
		output: impl Into<String>,
	) -> Self {
		Arc::make_mut(&mut self.rules).push(Rule {
			host: host.map(str::to_string),
			needle: needle.into(),
			reply: Reply::Fail {
				status,
				output: output.into(),
			},
		});
		self
	}

	pub fn connect_attempts(&self, host: &str) -> u32 {
		lock(&self.state).attempts.get(host).copied().unwrap_or(0)
	}

	pub fn executed(&self, host: &str) -> Vec<String> {
		lock(&self.state)
			.executed
			.get(host)
			.cloned()
			.unwrap_or_default()
	}

	/// Connections opened and not yet closed.
	pub fn open_connections(&self) -> usize {
		lock(&self.state).open
	}
}

#[async_trait]
impl Connector for ScriptedConnector {
	async fn connect(
		&self,
		config: &ConnectionConfig,
	) -> std::result::Result<Box<dyn Connection>, TransportError> {
		let attempt = {
			let mut state = lock(&self.state);
			let counter = state.attempts.entry(config.host.clone()).or_default();
			*counter += 1;
			*counter
		};

		let behavior = self
			.behaviors
			.get(&config.host)
			.copied()
			.unwrap_or(HostBehavior::Reachable);

		match behavior {
			HostBehavior::Reachable => {}
			HostBehavior::Unreachable => {
				return Err(TransportError::Refused(format!("{}:{}", config.host, config.port)));
			}
			HostBehavior::FlakyFor(n) if attempt <= n => {
				return Err(TransportError::Refused(format!("{}:{}", config.host, config.port)));
			}
			HostBehavior::FlakyFor(_) => {}
			HostBehavior::AuthRejected => {
				return Err(TransportError::AuthenticationFailed(format!(
					"{}: Permission denied (publickey)",
					config.destination()
				)));
			}
			HostBehavior::Slow(delay) => tokio::time::sleep(delay).await,
		}

		lock(&self.state).open += 1;
		Ok(Box::new(ScriptedConnection {
			host: config.host.clone(),
			rules: self.rules.clone(),
			state: self.state.clone(),
			closed: AtomicBool::new(false),
		}))
	}
}

struct ScriptedConnection {
	host: String,
	rules: Arc<Vec<Rule>>,
	state: Arc<Mutex<State>>,
	closed: AtomicBool,
}

#[async_trait]
impl Connection for ScriptedConnection {
	fn host(&self) -> &str {
		&self.host
	}

	async fn execute(&self, command: &str) -> Result<String> {
		if self.closed.load(Ordering::SeqCst) {
			return Err(RemoteError::Closed {
				host: self.host.clone(),
			});
		}

		lock(&self.state)
			.executed
			.entry(self.host.clone())
			.or_default()
			.push(command.to_string());

		let rule = self.rules.iter().find(|rule| {
			rule.host.as_deref().map_or(true, |h| h == self.host) && command.contains(&rule.needle)
		});

		match rule.map(|r| &r.reply) {
			None => Ok(String::new()),
			Some(Reply::Output(output)) => Ok(output.clone()),
			Some(Reply::Fail { status, output }) => Err(RemoteError::CommandFailed {
				host: self.host.clone(),
				status: *status,
				output: output.clone(),
			}),
		}
	}

	async fn close(&self) {
		if !self.closed.swap(true, Ordering::SeqCst) {
			lock(&self.state).open -= 1;
		}
	}
}

/// Runs commands with the local `sh`, whatever host is requested.
#[derive(Debug, Default, Clone)]
pub struct LocalShellConnector;

#[async_trait]
impl Connector for LocalShellConnector {
	async fn connect(
		&self,
		config: &ConnectionConfig,
	) -> std::result::Result<Box<dyn Connection>, TransportError> {
		Ok(Box::new(LocalShellConnection {
			host: config.host.clone(),
			closed: AtomicBool::new(false),
		}))
	}
}

pub struct LocalShellConnection {
	host: String,
	closed: AtomicBool,
}

impl LocalShellConnection {
	pub fn new(host: impl Into<String>) -> Self {
		Self {
			host: host.into(),
			closed: AtomicBool::new(false),
		}
	}
}

#[async_trait]
impl Connection for LocalShellConnection {
	fn host(&self) -> &str {
		&self.host
	}

	async fn execute(&self, command: &str) -> Result<String> {
		if self.closed.load(Ordering::SeqCst) {
			return Err(RemoteError::Closed {
				host: self.host.clone(),
			});
		}

		let output = Command::new("sh")
			.arg("-c")
			.arg(command)
			.stdin(Stdio::null())
			.output()
			.await
			.map_err(|e| RemoteError::Transport {
				host: self.host.clone(),
				cause: TransportError::Spawn(e.to_string()),
			})?;

		let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
		combined.push_str(&String::from_utf8_lossy(&output.stderr));

		if output.status.success() {
			Ok(combined)
		} else {
			Err(RemoteError::CommandFailed {
				host: self.host.clone(),
				status: output.status.code().unwrap_or(-1),
				output: combined.trim().to_string(),
			})
		}
	}

	async fn close(&self) {
		self.closed.store(true, Ordering::SeqCst);
	}
}
