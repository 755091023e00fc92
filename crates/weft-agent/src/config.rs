// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Layered agent configuration.
//!
//! Precedence (highest to lowest):
//! 1. Command-line flags
//! 2. Environment variables (`WEFT_*`)
//! 3. Config file (`--config`, or `$XDG_CONFIG_HOME/weft/weftd.toml`)
//! 4. Built-in defaults

use clap::{Parser, ValueEnum};
use ipnet::IpNet;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, trace};
use url::Url;
use uuid::Uuid;
use weft_common::SecretString;
use weft_engine::BackendKind;

pub const DEFAULT_INTERFACE: &str = "wg0";
pub const DEFAULT_LISTEN_PORT: u16 = 51820;
pub const DEFAULT_RECONCILE_INTERVAL_SECS: u64 = 5;
pub const DEFAULT_PROBE_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_PROBE_BATCH_SIZE: usize = 10;
pub const DEFAULT_PROBE_TIMEOUT_MS: u64 = 1200;
pub const DEFAULT_NAT_RECHECK_INTERVAL_SECS: u64 = 20;
pub const DEFAULT_STATUS_LISTEN: &str = "127.0.0.1:7733";

#[derive(Debug, Error)]
pub enum ConfigError {
	#[error("failed to read config file {path}: {source}")]
	FileRead {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},

	#[error("failed to parse config file {path}: {source}")]
	TomlParse {
		path: PathBuf,
		#[source]
		source: toml::de::Error,
	},

	#[error("invalid value for {field}: {message}")]
	InvalidValue { field: String, message: String },

	#[error("missing required setting: {0}")]
	Missing(&'static str),
}

fn invalid(field: &str, message: impl Into<String>) -> ConfigError {
	ConfigError::InvalidValue {
		field: field.to_string(),
		message: message.into(),
	}
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
	#[default]
	Text,
	Json,
}

/// weftd: mesh agent for the weft overlay network.
#[derive(Debug, Default, Parser)]
#[command(name = "weftd", about = "weft mesh agent", version)]
pub struct CliArgs {
	/// Config file path
	#[arg(long, short, env = "WEFT_CONFIG")]
	pub config: Option<PathBuf>,

	/// Coordinator base URL
	#[arg(long)]
	pub coordinator_url: Option<String>,

	/// VPC to join
	#[arg(long)]
	pub vpc_id: Option<Uuid>,

	/// Tunnel interface name
	#[arg(long)]
	pub interface: Option<String>,

	/// WireGuard UDP listen port
	#[arg(long)]
	pub listen_port: Option<u16>,

	/// Tunnel backend: kernel or userspace
	#[arg(long, value_parser = parse_mode)]
	pub mode: Option<BackendKind>,

	/// Act as the organization's relay node
	#[arg(long)]
	pub relay: bool,

	/// Reach every other peer through the relay, never directly
	#[arg(long)]
	pub relay_only: bool,

	/// Allow a plain http:// coordinator URL
	#[arg(long)]
	pub insecure_http: bool,

	/// Address for the local status API
	#[arg(long)]
	pub status_listen: Option<SocketAddr>,

	/// Directory holding the private key
	#[arg(long)]
	pub state_dir: Option<PathBuf>,

	/// Log filter used when RUST_LOG is unset
	#[arg(long, default_value = "info")]
	pub log_level: String,

	#[arg(long, value_enum, default_value_t = LogFormat::Text)]
	pub log_format: LogFormat,
}

fn parse_mode(raw: &str) -> Result<BackendKind, String> {
	match raw.to_ascii_lowercase().as_str() {
		"kernel" => Ok(BackendKind::Kernel),
		"userspace" => Ok(BackendKind::Userspace),
		other => Err(format!("unknown mode '{other}', expected kernel or userspace")),
	}
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct AgentConfigLayer {
	pub coordinator_url: Option<String>,
	pub vpc_id: Option<Uuid>,
	pub auth_token: Option<SecretString>,
	pub username: Option<String>,
	pub password: Option<SecretString>,
	pub insecure_http: Option<bool>,
	pub interface: Option<String>,
	pub listen_port: Option<u16>,
	pub mode: Option<BackendKind>,
	pub relay: Option<bool>,
	pub relay_only: Option<bool>,
	pub advertise_cidrs: Option<Vec<IpNet>>,
	pub stun_servers: Option<Vec<String>>,
	pub reconcile_interval_secs: Option<u64>,
	pub probe_interval_secs: Option<u64>,
	pub probe_batch_size: Option<usize>,
	pub probe_timeout_ms: Option<u64>,
	pub nat_recheck_interval_secs: Option<u64>,
	pub status_listen: Option<SocketAddr>,
	pub state_dir: Option<PathBuf>,
}

macro_rules! merge_fields {
	($self:ident, $other:ident, $($field:ident),+ $(,)?) => {
		$(
			if $other.$field.is_some() {
				$self.$field = $other.$field;
			}
		)+
	};
}

impl AgentConfigLayer {
	pub fn merge(&mut self, other: Self) {
		merge_fields!(
			self,
			other,
			coordinator_url,
			vpc_id,
			auth_token,
			username,
			password,
			insecure_http,
			interface,
			listen_port,
			mode,
			relay,
			relay_only,
			advertise_cidrs,
			stun_servers,
			reconcile_interval_secs,
			probe_interval_secs,
			probe_batch_size,
			probe_timeout_ms,
			nat_recheck_interval_secs,
			status_listen,
			state_dir,
		);
	}

	pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
		if !path.exists() {
			debug!(path = %path.display(), "config file not found, skipping");
			return Ok(Self::default());
		}

		debug!(path = %path.display(), "loading config file");
		let content = std::fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
			path: path.to_path_buf(),
			source,
		})?;
		toml::from_str(&content).map_err(|source| ConfigError::TomlParse {
			path: path.to_path_buf(),
			source,
		})
	}

	/// Reads `WEFT_*` variables through `lookup`, so tests need not touch the
	/// process environment.
	pub fn from_env_with<F>(lookup: F) -> Result<Self, ConfigError>
	where
		F: Fn(&str) -> Option<String>,
	{
		let var = |name: &str| lookup(name).filter(|v| !v.is_empty());

		Ok(Self {
			coordinator_url: var("WEFT_COORDINATOR_URL"),
			vpc_id: parse_var(&var, "WEFT_VPC_ID")?,
			auth_token: var("WEFT_AUTH_TOKEN").map(SecretString::new),
			username: var("WEFT_USERNAME"),
			password: var("WEFT_PASSWORD").map(SecretString::new),
			insecure_http: bool_var(&var, "WEFT_INSECURE_HTTP"),
			interface: var("WEFT_INTERFACE"),
			listen_port: parse_var(&var, "WEFT_LISTEN_PORT")?,
			mode: var("WEFT_MODE")
				.map(|v| parse_mode(&v).map_err(|m| invalid("WEFT_MODE", m)))
				.transpose()?,
			relay: bool_var(&var, "WEFT_RELAY"),
			relay_only: bool_var(&var, "WEFT_RELAY_ONLY"),
			advertise_cidrs: list_var(&var, "WEFT_ADVERTISE_CIDRS")
				.map(|items| {
					items
						.iter()
						.map(|s| {
							s.parse::<IpNet>()
								.map_err(|e| invalid("WEFT_ADVERTISE_CIDRS", format!("'{s}': {e}")))
						})
						.collect::<Result<Vec<_>, _>>()
				})
				.transpose()?,
			stun_servers: list_var(&var, "WEFT_STUN_SERVERS"),
			reconcile_interval_secs: parse_var(&var, "WEFT_RECONCILE_INTERVAL_SECS")?,
			probe_interval_secs: parse_var(&var, "WEFT_PROBE_INTERVAL_SECS")?,
			probe_batch_size: parse_var(&var, "WEFT_PROBE_BATCH_SIZE")?,
			probe_timeout_ms: parse_var(&var, "WEFT_PROBE_TIMEOUT_MS")?,
			nat_recheck_interval_secs: parse_var(&var, "WEFT_NAT_RECHECK_INTERVAL_SECS")?,
			status_listen: parse_var(&var, "WEFT_STATUS_LISTEN")?,
			state_dir: var("WEFT_STATE_DIR").map(PathBuf::from),
		})
	}

	pub fn from_env() -> Result<Self, ConfigError> {
		Self::from_env_with(|name| std::env::var(name).ok())
	}

	pub fn from_cli(args: &CliArgs) -> Self {
		Self {
			coordinator_url: args.coordinator_url.clone(),
			vpc_id: args.vpc_id,
			interface: args.interface.clone(),
			listen_port: args.listen_port,
			mode: args.mode,
			relay: args.relay.then_some(true),
			relay_only: args.relay_only.then_some(true),
			insecure_http: args.insecure_http.then_some(true),
			status_listen: args.status_listen,
			state_dir: args.state_dir.clone(),
			..Self::default()
		}
	}
}

fn parse_var<T, F>(var: &F, name: &str) -> Result<Option<T>, ConfigError>
where
	T: std::str::FromStr,
	T::Err: std::fmt::Display,
	F: Fn(&str) -> Option<String>,
{
	match var(name) {
		Some(v) => v
			.parse()
			.map(Some)
			.map_err(|e| invalid(name, format!("'{v}': {e}"))),
		None => Ok(None),
	}
}

fn bool_var<F: Fn(&str) -> Option<String>>(var: &F, name: &str) -> Option<bool> {
	var(name).map(|v| v.eq_ignore_ascii_case("true") || v == "1")
}

fn list_var<F: Fn(&str) -> Option<String>>(var: &F, name: &str) -> Option<Vec<String>> {
	var(name).map(|v| {
		v.split(',')
			.map(str::trim)
			.filter(|s| !s.is_empty())
			.map(String::from)
			.collect()
	})
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
	pub username: String,
	pub password: SecretString,
}

/// Fully resolved agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
	pub coordinator_url: Url,
	pub vpc_id: Uuid,
	pub auth_token: Option<SecretString>,
	/// Reusable credentials allow a silent reconnect when the session expires.
	pub credentials: Option<Credentials>,
	pub interface: String,
	pub listen_port: u16,
	pub mode: BackendKind,
	pub relay: bool,
	/// Registered as symmetric NAT so peers also go through the relay.
	pub relay_only: bool,
	pub advertise_cidrs: Vec<IpNet>,
	pub stun_servers: Vec<String>,
	pub reconcile_interval: Duration,
	pub probe_interval: Duration,
	pub probe_batch_size: usize,
	pub probe_timeout: Duration,
	pub nat_recheck_interval: Duration,
	pub status_listen: SocketAddr,
	pub state_dir: PathBuf,
}

fn default_state_dir() -> PathBuf {
	dirs::data_dir()
		.map(|d| d.join("weft"))
		.unwrap_or_else(|| PathBuf::from("/var/lib/weft"))
}

pub fn default_config_path() -> Option<PathBuf> {
	dirs::config_dir().map(|d| d.join("weft").join("weftd.toml"))
}

fn positive(field: &str, value: u64) -> Result<u64, ConfigError> {
	if value == 0 {
		return Err(invalid(field, "must be greater than zero"));
	}
	Ok(value)
}

impl AgentConfigLayer {
	pub fn finalize(self) -> Result<AgentConfig, ConfigError> {
		let insecure_http = self.insecure_http.unwrap_or(false);
		let raw_url = self.coordinator_url.ok_or(ConfigError::Missing("coordinator_url"))?;
		let coordinator_url =
			Url::parse(&raw_url).map_err(|e| invalid("coordinator_url", e.to_string()))?;
		match coordinator_url.scheme() {
			"https" => {}
			"http" if insecure_http => {}
			"http" => {
				return Err(invalid(
					"coordinator_url",
					"must use https:// (set insecure_http = true to allow http://)",
				))
			}
			other => return Err(invalid("coordinator_url", format!("unsupported scheme '{other}'"))),
		}

		let vpc_id = self.vpc_id.ok_or(ConfigError::Missing("vpc_id"))?;

		let credentials = match (self.username, self.password) {
			(Some(username), Some(password)) => Some(Credentials { username, password }),
			(Some(_), None) => return Err(invalid("password", "required when username is set")),
			(None, Some(_)) => return Err(invalid("username", "required when password is set")),
			(None, None) => None,
		};
		let auth_token = self.auth_token.filter(|t| !t.is_empty());
		if auth_token.is_none() && credentials.is_none() {
			return Err(ConfigError::Missing("auth_token or username/password"));
		}

		let interface = self.interface.unwrap_or_else(|| DEFAULT_INTERFACE.to_string());
		if interface.is_empty() || interface.len() > 15 {
			return Err(invalid("interface", "must be 1 to 15 characters"));
		}

		let probe_batch_size = self.probe_batch_size.unwrap_or(DEFAULT_PROBE_BATCH_SIZE);
		if probe_batch_size == 0 {
			return Err(invalid("probe_batch_size", "must be greater than zero"));
		}

		let relay = self.relay.unwrap_or(false);
		let relay_only = self.relay_only.unwrap_or(false);
		if relay && relay_only {
			return Err(invalid("relay_only", "a relay node cannot be relay-only"));
		}

		let status_listen = match self.status_listen {
			Some(addr) => addr,
			None => DEFAULT_STATUS_LISTEN
				.parse()
				.map_err(|_| invalid("status_listen", DEFAULT_STATUS_LISTEN))?,
		};

		let config = AgentConfig {
			coordinator_url,
			vpc_id,
			auth_token,
			credentials,
			interface,
			listen_port: self.listen_port.unwrap_or(DEFAULT_LISTEN_PORT),
			mode: self.mode.unwrap_or_default(),
			relay,
			relay_only,
			advertise_cidrs: self.advertise_cidrs.unwrap_or_default(),
			stun_servers: self.stun_servers.unwrap_or_default(),
			reconcile_interval: Duration::from_secs(positive(
				"reconcile_interval_secs",
				self.reconcile_interval_secs.unwrap_or(DEFAULT_RECONCILE_INTERVAL_SECS),
			)?),
			probe_interval: Duration::from_secs(positive(
				"probe_interval_secs",
				self.probe_interval_secs.unwrap_or(DEFAULT_PROBE_INTERVAL_SECS),
			)?),
			probe_batch_size,
			probe_timeout: Duration::from_millis(positive(
				"probe_timeout_ms",
				self.probe_timeout_ms.unwrap_or(DEFAULT_PROBE_TIMEOUT_MS),
			)?),
			nat_recheck_interval: Duration::from_secs(positive(
				"nat_recheck_interval_secs",
				self
					.nat_recheck_interval_secs
					.unwrap_or(DEFAULT_NAT_RECHECK_INTERVAL_SECS),
			)?),
			status_listen,
			state_dir: self.state_dir.unwrap_or_else(default_state_dir),
		};

		info!(
			coordinator = %config.coordinator_url,
			vpc_id = %config.vpc_id,
			interface = %config.interface,
			listen_port = config.listen_port,
			mode = %config.mode,
			relay = config.relay,
			relay_only = config.relay_only,
			"agent configuration loaded"
		);
		Ok(config)
	}
}

/// Loads configuration from all sources with standard precedence.
pub fn load_config(args: &CliArgs) -> Result<AgentConfig, ConfigError> {
	let mut merged = AgentConfigLayer::default();

	match args.config.clone().or_else(default_config_path) {
		Some(path) => merged.merge(AgentConfigLayer::from_toml_file(&path)?),
		None => trace!("no config directory available"),
	}
	merged.merge(AgentConfigLayer::from_env()?);
	merged.merge(AgentConfigLayer::from_cli(args));

	merged.finalize()
}
