// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Kernel WireGuard backend driven through `ip(8)` and `wg(8)`.

use crate::backend::{BackendKind, InterfaceConfig, TunnelBackend};
use crate::error::BackendError;
use crate::selector::TunnelPeerConfig;
use async_trait::async_trait;
use ipnet::IpNet;
use std::path::PathBuf;
use tokio::process::Command;
use tracing::{debug, info, instrument};
use weft_common::WgPublicKey;

#[async_trait]
pub trait CommandRunner: Send + Sync {
	/// Runs `program args..` and returns stdout, or a
	/// [`BackendError::Command`] carrying stderr on a non-zero exit.
	async fn run(&self, program: &str, args: &[String]) -> Result<String, BackendError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
	async fn run(&self, program: &str, args: &[String]) -> Result<String, BackendError> {
		let output = Command::new(program)
			.args(args)
			.output()
			.await
			.map_err(|source| BackendError::Spawn {
				program: program.to_string(),
				source,
			})?;

		if !output.status.success() {
			let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
			debug!(program, args = %args.join(" "), %stderr, "command failed");
			return Err(BackendError::Command {
				program: program.to_string(),
				args: args.join(" "),
				status: output.status.code().unwrap_or(-1),
				stderr,
			});
		}

		Ok(String::from_utf8_lossy(&output.stdout).into_owned())
	}
}

fn family_flag(prefix: &IpNet) -> &'static str {
	match prefix {
		IpNet::V4(_) => "-4",
		IpNet::V6(_) => "-6",
	}
}

fn args<const N: usize>(parts: [&str; N]) -> Vec<String> {
	parts.iter().map(|s| s.to_string()).collect()
}

pub struct KernelBackend<R = SystemRunner> {
	interface: String,
	private_key_path: PathBuf,
	runner: R,
}

impl KernelBackend<SystemRunner> {
	pub fn new(interface: impl Into<String>, private_key_path: impl Into<PathBuf>) -> Self {
		Self::with_runner(interface, private_key_path, SystemRunner)
	}
}

impl<R: CommandRunner> KernelBackend<R> {
	pub fn with_runner(
		interface: impl Into<String>,
		private_key_path: impl Into<PathBuf>,
		runner: R,
	) -> Self {
		Self {
			interface: interface.into(),
			private_key_path: private_key_path.into(),
			runner,
		}
	}

	pub fn interface(&self) -> &str {
		&self.interface
	}

	async fn ip(&self, args: Vec<String>) -> Result<String, BackendError> {
		self.runner.run("ip", &args).await
	}

	async fn wg(&self, args: Vec<String>) -> Result<String, BackendError> {
		self.runner.run("wg", &args).await
	}
}

#[async_trait]
impl<R: CommandRunner> TunnelBackend for KernelBackend<R> {
	fn kind(&self) -> BackendKind {
		BackendKind::Kernel
	}

	#[instrument(skip(self), fields(interface = %self.interface))]
	async fn teardown_interface(&self) -> Result<(), BackendError> {
		if self.ip(args(["link", "show", self.interface.as_str()])).await.is_err() {
			return Ok(());
		}
		self
			.ip(args(["link", "del", self.interface.as_str()]))
			.await?;
		info!("removed stale tunnel interface");
		Ok(())
	}

	#[instrument(skip(self, config), fields(interface = %self.interface, listen_port = config.listen_port))]
	async fn setup_interface(&self, config: &InterfaceConfig) -> Result<(), BackendError> {
		if self.ip(args(["link", "show", self.interface.as_str()])).await.is_err() {
			self
				.ip(args(["link", "add", self.interface.as_str(), "type", "wireguard"]))
				.await?;
		}

		let port = config.listen_port.to_string();
		let key_path = self.private_key_path.display().to_string();
		self
			.wg(args([
				"set",
				self.interface.as_str(),
				"listen-port",
				port.as_str(),
				"private-key",
				key_path.as_str(),
			]))
			.await?;

		for address in &config.addresses {
			let address_str = address.to_string();
			self
				.ip(args([
					family_flag(address),
					"address",
					"replace",
					address_str.as_str(),
					"dev",
					self.interface.as_str(),
				]))
				.await?;
		}

		self
			.ip(args(["link", "set", self.interface.as_str(), "up"]))
			.await?;

		if config.relay {
			self
				.runner
				.run("sysctl", &args(["-w", "net.ipv4.ip_forward=1"]))
				.await?;
			self
				.runner
				.run("sysctl", &args(["-w", "net.ipv6.conf.all.forwarding=1"]))
				.await?;
		}

		info!(addresses = ?config.addresses, "tunnel interface ready");
		Ok(())
	}

	#[instrument(skip(self, peer), fields(peer = %peer.public_key, endpoint = %peer.endpoint, method = %peer.method))]
	async fn configure_peer(&self, peer: &TunnelPeerConfig) -> Result<(), BackendError> {
		let key = peer.public_key.to_base64();
		let endpoint = peer.endpoint.to_string();
		let keepalive = peer.persistent_keepalive.unwrap_or(0).to_string();
		let allowed_ips = peer
			.allowed_ips
			.iter()
			.map(IpNet::to_string)
			.collect::<Vec<_>>()
			.join(",");

		self
			.wg(args([
				"set",
				self.interface.as_str(),
				"peer",
				key.as_str(),
				"endpoint",
				endpoint.as_str(),
				"persistent-keepalive",
				keepalive.as_str(),
				"allowed-ips",
				allowed_ips.as_str(),
			]))
			.await?;
		debug!("peer configured");
		Ok(())
	}

	#[instrument(skip(self), fields(peer = %public_key))]
	async fn remove_peer(&self, public_key: &WgPublicKey) -> Result<(), BackendError> {
		let key = public_key.to_base64();
		self
			.wg(args(["set", self.interface.as_str(), "peer", key.as_str(), "remove"]))
			.await?;
		debug!("peer removed");
		Ok(())
	}

	/// Only routes through the tunnel interface count; the same prefix on
	/// a LAN device is not ours.
	async fn route_exists(&self, prefix: &IpNet) -> Result<bool, BackendError> {
		let prefix_str = prefix.to_string();
		let out = self
			.ip(args([
				family_flag(prefix),
				"route",
				"show",
				prefix_str.as_str(),
				"dev",
				self.interface.as_str(),
			]))
			.await?;
		Ok(out.lines().any(|line| !line.trim().is_empty()))
	}

	#[instrument(skip(self), fields(%prefix, interface = %self.interface))]
	async fn add_route(&self, prefix: &IpNet) -> Result<(), BackendError> {
		let prefix_str = prefix.to_string();
		match self
			.ip(args([
				family_flag(prefix),
				"route",
				"add",
				prefix_str.as_str(),
				"dev",
				self.interface.as_str(),
			]))
			.await
		{
			Err(e) if e.stderr_contains("File exists") => {
				debug!("route already present");
				Ok(())
			}
			other => other.map(|_| ()),
		}
	}

	#[instrument(skip(self), fields(%prefix, interface = %self.interface))]
	async fn del_route(&self, prefix: &IpNet) -> Result<(), BackendError> {
		let prefix_str = prefix.to_string();
		match self
			.ip(args([
				family_flag(prefix),
				"route",
				"del",
				prefix_str.as_str(),
				"dev",
				self.interface.as_str(),
			]))
			.await
		{
			Err(e) if e.stderr_contains("No such process") => {
				debug!("route already gone");
				Ok(())
			}
			other => other.map(|_| ()),
		}
	}
}
