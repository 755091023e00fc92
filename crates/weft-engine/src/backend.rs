// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::error::BackendError;
use crate::selector::TunnelPeerConfig;
use async_trait::async_trait;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::fmt;
use weft_common::WgPublicKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
	#[default]
	Kernel,
	Userspace,
}

impl fmt::Display for BackendKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			BackendKind::Kernel => f.write_str("kernel"),
			BackendKind::Userspace => f.write_str("userspace"),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceConfig {
	pub name: String,
	pub listen_port: u16,
	/// Tunnel addresses with their organization prefix length.
	pub addresses: Vec<IpNet>,
	/// Relays forward between peers.
	pub relay: bool,
}

/// The tunnel interface, kernel or in-process. Chosen once at startup; the
/// applier and reconciler only see this trait.
#[async_trait]
pub trait TunnelBackend: Send + Sync {
	fn kind(&self) -> BackendKind;

	/// Removes an interface left over from an earlier run so its socket no
	/// longer holds the listen port. Runs before NAT discovery, which has to
	/// send from that port. Backends with no host state have nothing to do.
	async fn teardown_interface(&self) -> Result<(), BackendError> {
		Ok(())
	}

	async fn setup_interface(&self, config: &InterfaceConfig) -> Result<(), BackendError>;

	/// Adds the peer or updates it in place.
	async fn configure_peer(&self, peer: &TunnelPeerConfig) -> Result<(), BackendError>;

	async fn remove_peer(&self, public_key: &WgPublicKey) -> Result<(), BackendError>;

	async fn route_exists(&self, prefix: &IpNet) -> Result<bool, BackendError>;

	async fn add_route(&self, prefix: &IpNet) -> Result<(), BackendError>;

	async fn del_route(&self, prefix: &IpNet) -> Result<(), BackendError>;
}
