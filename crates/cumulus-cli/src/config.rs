// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! CLI configuration: a TOML file describing SSH defaults and clusters,
//! plus a few environment overrides.

use cumulus_common_http::RetryPolicy;
use cumulus_common_secret::SecretString;
use cumulus_mesh_common::{BastionConfig, ClusterNetwork, IpRange, MeshMode, Node, DEFAULT_KEEPALIVE, DEFAULT_LISTEN_PORT};
use cumulus_mesh_wireguard::{Cluster, FleetOptions, SshSettings};
use ipnet::Ipv4Net;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

pub const ENV_HEADSCALE_API_KEY: &str = "CUMULUS_HEADSCALE_API_KEY";
pub const ENV_STATE_DIR: &str = "CUMULUS_STATE_DIR";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
	#[error("I/O error reading {path}: {source}")]
	Io {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},

	#[error("TOML parse error in {path}: {source}")]
	TomlParse {
		path: PathBuf,
		#[source]
		source: toml::de::Error,
	},

	#[error("Could not determine home directory")]
	HomeDirNotFound,

	#[error("Cluster '{0}' not found in configuration")]
	UnknownCluster(String),

	#[error("Cluster '{cluster}' is configured for {actual}, this command needs {expected}")]
	ModeMismatch {
		cluster: String,
		expected: MeshMode,
		actual: MeshMode,
	},

	#[error("Missing required field: {0}")]
	MissingField(String),

	#[error("Invalid value for {field}: {message}")]
	InvalidValue { field: String, message: String },

	#[error("Environment error: {0}")]
	Env(String),
}

impl ConfigError {
	pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
		Self::InvalidValue {
			field: field.into(),
			message: message.into(),
		}
	}
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Where the CLI reads configuration and keeps state.
#[derive(Debug, Clone)]
pub struct Paths {
	pub config_file: PathBuf,
	pub state_dir: PathBuf,
}

impl Paths {
	/// XDG locations: `$XDG_CONFIG_HOME/cumulus/config.toml` and
	/// `$XDG_STATE_HOME/cumulus`. `CUMULUS_STATE_DIR` overrides the latter.
	pub fn resolve(config_override: Option<&Path>) -> Result<Self> {
		let home = dirs::home_dir().ok_or(ConfigError::HomeDirNotFound)?;
		let config_home = std::env::var_os("XDG_CONFIG_HOME")
			.map(PathBuf::from)
			.unwrap_or_else(|| home.join(".config"));
		let state_home = std::env::var_os("XDG_STATE_HOME")
			.map(PathBuf::from)
			.unwrap_or_else(|| home.join(".local/state"));

		let config_file = config_override
			.map(Path::to_path_buf)
			.unwrap_or_else(|| config_home.join("cumulus/config.toml"));
		let state_dir = std::env::var_os(ENV_STATE_DIR)
			.map(PathBuf::from)
			.unwrap_or_else(|| state_home.join("cumulus"));

		tracing::debug!(
			config_file = %config_file.display(),
			state_dir = %state_dir.display(),
			"resolved paths"
		);
		Ok(Self { config_file, state_dir })
	}

	pub fn registry_dir(&self) -> PathBuf {
		self.state_dir.join("registry")
	}

	pub fn run_dir(&self) -> PathBuf {
		self.state_dir.join("run")
	}

	pub fn history_file(&self) -> PathBuf {
		self.state_dir.join("history.jsonl")
	}

	pub fn mesh_state_dir(&self, cluster: &str) -> PathBuf {
		self.state_dir.join("mesh").join(cluster)
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SshSection {
	pub user: Option<String>,
	pub port: Option<u16>,
	pub identity_file: Option<PathBuf>,
	pub known_hosts_file: Option<PathBuf>,
	pub connect_timeout_secs: Option<u64>,
	pub command_timeout_secs: Option<u64>,
	pub retry_attempts: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HeadscaleSection {
	pub url: Url,
	#[serde(default = "default_headscale_user")]
	pub user: String,
	pub api_key: Option<SecretString>,
	/// Hostname announced to the coordinator; defaults to `cumulus-<cluster>`.
	pub hostname: Option<String>,
}

fn default_headscale_user() -> String {
	"cumulus".to_string()
}

fn default_mode() -> MeshMode {
	MeshMode::WireGuard
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClusterSection {
	#[serde(default = "default_mode")]
	pub mode: MeshMode,
	pub subnet: Option<Ipv4Net>,
	#[serde(default)]
	pub reserved: Vec<IpRange>,
	pub listen_port: Option<u16>,
	pub keepalive: Option<u16>,
	pub workers: Option<usize>,
	pub inter_host_delay_ms: Option<u64>,
	pub host_timeout_secs: Option<u64>,
	pub interface: Option<String>,
	pub bastion: Option<BastionConfig>,
	#[serde(default)]
	pub nodes: Vec<Node>,
	pub headscale: Option<HeadscaleSection>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CliConfig {
	#[serde(default)]
	pub ssh: SshSection,
	#[serde(default)]
	pub clusters: BTreeMap<String, ClusterSection>,
}

/// Coordinator settings with the API key resolved.
#[derive(Debug, Clone)]
pub struct HeadscaleSettings {
	pub url: Url,
	pub user: String,
	pub api_key: SecretString,
	pub hostname: String,
}

impl CliConfig {
	/// Reads `path`. A missing file yields the empty configuration unless
	/// `required` is set.
	pub fn load(path: &Path, required: bool) -> Result<Self> {
		let contents = match std::fs::read_to_string(path) {
			Ok(contents) => contents,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound && !required => {
				tracing::debug!(path = %path.display(), "no config file, using defaults");
				return Ok(Self::default());
			}
			Err(source) => {
				return Err(ConfigError::Io {
					path: path.to_path_buf(),
					source,
				})
			}
		};
		Self::parse(&contents, path)
	}

	pub fn parse(contents: &str, path: &Path) -> Result<Self> {
		let config: Self = toml::from_str(contents).map_err(|source| ConfigError::TomlParse {
			path: path.to_path_buf(),
			source,
		})?;
		config.validate()?;
		Ok(config)
	}

	fn validate(&self) -> Result<()> {
		for (id, cluster) in &self.clusters {
			cumulus_mesh_common::validate_label(id)
				.map_err(|e| ConfigError::invalid_value(format!("clusters.{id}"), e.to_string()))?;
			if cluster.workers == Some(0) {
				return Err(ConfigError::invalid_value(
					format!("clusters.{id}.workers"),
					"must be at least 1",
				));
			}
			if let Some(subnet) = cluster.subnet {
				for node in &cluster.nodes {
					if let Some(mesh_ip) = node.mesh_ip {
						if !subnet.contains(&mesh_ip) {
							return Err(ConfigError::invalid_value(
								format!("clusters.{id}.nodes.{}.mesh_ip", node.name),
								format!("{mesh_ip} is outside {subnet}"),
							));
						}
					}
				}
			}
		}
		Ok(())
	}

	pub fn ssh_settings(&self) -> SshSettings {
		let defaults = SshSettings::default();
		SshSettings {
			user: self.ssh.user.clone().unwrap_or(defaults.user),
			port: self.ssh.port.unwrap_or(defaults.port),
			identity_file: self.ssh.identity_file.clone().map(expand_home),
			known_hosts_file: self.ssh.known_hosts_file.clone().map(expand_home),
			connect_timeout: self
				.ssh
				.connect_timeout_secs
				.map(Duration::from_secs)
				.unwrap_or(defaults.connect_timeout),
			command_timeout: self
				.ssh
				.command_timeout_secs
				.map(Duration::from_secs)
				.unwrap_or(defaults.command_timeout),
		}
	}

	/// Retry policy for SSH connects.
	pub fn retry_policy(&self) -> RetryPolicy {
		match self.ssh.retry_attempts {
			Some(attempts) => RetryPolicy::default().with_max_attempts(attempts.max(1)),
			None => RetryPolicy::default(),
		}
	}

	pub fn cluster_section(&self, id: &str) -> Result<&ClusterSection> {
		self.clusters
			.get(id)
			.ok_or_else(|| ConfigError::UnknownCluster(id.to_string()))
	}

	fn expect_mode(&self, id: &str, expected: MeshMode) -> Result<&ClusterSection> {
		let section = self.cluster_section(id)?;
		if section.mode != expected {
			return Err(ConfigError::ModeMismatch {
				cluster: id.to_string(),
				expected,
				actual: section.mode,
			});
		}
		Ok(section)
	}

	/// The WireGuard view of a cluster, as handed to the mesh manager.
	pub fn wireguard_cluster(&self, id: &str) -> Result<Cluster> {
		let section = self.expect_mode(id, MeshMode::WireGuard)?;
		let subnet = section
			.subnet
			.ok_or_else(|| ConfigError::MissingField(format!("clusters.{id}.subnet")))?;
		let network = ClusterNetwork {
			mode: MeshMode::WireGuard,
			subnet,
			reserved: section.reserved.clone(),
			listen_port: section.listen_port.unwrap_or(DEFAULT_LISTEN_PORT),
			keepalive: section.keepalive.unwrap_or(DEFAULT_KEEPALIVE),
			bastion: section.bastion.clone(),
		};
		Ok(Cluster {
			id: id.to_string(),
			network,
			nodes: section.nodes.clone(),
		})
	}

	pub fn fleet_options(&self, id: &str) -> Result<FleetOptions> {
		let section = self.cluster_section(id)?;
		let mut options = FleetOptions::default();
		if let Some(workers) = section.workers {
			options.workers = workers;
		}
		if let Some(delay) = section.inter_host_delay_ms {
			options.inter_host_delay = Duration::from_millis(delay);
		}
		if let Some(timeout) = section.host_timeout_secs {
			options.host_timeout = Duration::from_secs(timeout);
		}
		Ok(options)
	}

	/// Coordinator settings for a Tailscale-mode cluster. The API key comes
	/// from the environment when set, otherwise from the file.
	pub fn headscale(&self, id: &str, env: impl Fn(&str) -> Option<String>) -> Result<HeadscaleSettings> {
		let section = self.expect_mode(id, MeshMode::Tailscale)?;
		let headscale = section
			.headscale
			.as_ref()
			.ok_or_else(|| ConfigError::MissingField(format!("clusters.{id}.headscale")))?;
		let api_key = match load_secret_env(ENV_HEADSCALE_API_KEY, env)? {
			Some(key) => key,
			None => headscale
				.api_key
				.clone()
				.ok_or_else(|| ConfigError::MissingField(format!("clusters.{id}.headscale.api_key")))?,
		};
		Ok(HeadscaleSettings {
			url: headscale.url.clone(),
			user: headscale.user.clone(),
			api_key,
			hostname: headscale
				.hostname
				.clone()
				.unwrap_or_else(|| format!("cumulus-{id}")),
		})
	}
}

/// Reads a secret from `NAME`, or from the file named by `NAME_FILE`.
/// Setting both is an error.
pub fn load_secret_env(name: &str, env: impl Fn(&str) -> Option<String>) -> Result<Option<SecretString>> {
	let file_var = format!("{name}_FILE");
	match (env(name), env(&file_var)) {
		(Some(_), Some(_)) => Err(ConfigError::Env(format!("set only one of {name} and {file_var}"))),
		(Some(value), None) => Ok(Some(SecretString::new(value))),
		(None, Some(path)) => {
			let contents = std::fs::read_to_string(&path).map_err(|source| ConfigError::Io {
				path: PathBuf::from(&path),
				source,
			})?;
			let value = contents.trim_end_matches(['\r', '\n']).to_string();
			if value.is_empty() {
				return Err(ConfigError::Env(format!("{file_var} points at an empty file")));
			}
			Ok(Some(SecretString::new(value)))
		}
		(None, None) => Ok(None),
	}
}

fn expand_home(path: PathBuf) -> PathBuf {
	match path.strip_prefix("~") {
		Ok(rest) => dirs::home_dir().map(|home| home.join(rest)).unwrap_or(path),
		Err(_) => path,
	}
}
