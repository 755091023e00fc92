// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Per-peer path selection.
//!
//! First match wins:
//!
//! 1. Same reflexive IP as us: dial the peer's LAN endpoint. NAT type does not
//!    matter since the traffic never crosses the NAT.
//! 2. Peer is the relay: dial its reflexive endpoint with the relay supernet
//!    as allowed IPs. We are the relay: dial the peer's reflexive endpoint.
//! 3. Either side behind symmetric NAT, or this node is relay-only: go
//!    through a healthy relay, or give up.
//! 4. Otherwise dial the peer's reflexive endpoint.
//!
//! A relay-only node skips rule 1 for ordinary peers. It still dials the
//! relay itself, directly on a shared LAN.

use crate::local::LocalNodeState;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use weft_common::{dedup_prefixes, Endpoint, PeerRecord, WgPublicKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PeeringMethod {
	DirectLocal,
	RelayPeerDirectLocal,
	RelaySelfDirectLocal,
	RelayPeer,
	RelaySelf,
	ViaRelay,
	Reflexive,
}

impl PeeringMethod {
	pub fn as_str(&self) -> &'static str {
		match self {
			PeeringMethod::DirectLocal => "direct-local",
			PeeringMethod::RelayPeerDirectLocal => "relay-peer-direct-local",
			PeeringMethod::RelaySelfDirectLocal => "relay-self-direct-local",
			PeeringMethod::RelayPeer => "relay-peer",
			PeeringMethod::RelaySelf => "relay-self",
			PeeringMethod::ViaRelay => "via-relay",
			PeeringMethod::Reflexive => "reflexive",
		}
	}

	fn uses_relay_supernet(&self) -> bool {
		matches!(
			self,
			PeeringMethod::RelayPeer | PeeringMethod::RelayPeerDirectLocal
		)
	}
}

impl fmt::Display for PeeringMethod {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// What gets pushed to the tunnel interface for one peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TunnelPeerConfig {
	pub public_key: WgPublicKey,
	pub endpoint: SocketAddr,
	pub allowed_ips: Vec<IpNet>,
	/// `None` disables keepalive; liveness is probed out of band.
	pub persistent_keepalive: Option<u16>,
	pub method: PeeringMethod,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerPath {
	Direct(TunnelPeerConfig),
	/// Reached through the relay's supernet route. The peer's child prefixes
	/// ride on the relay's allowed IPs.
	ViaRelay { child_prefixes: Vec<IpNet> },
	/// The endpoint the method needs is not a valid address:port yet.
	Converging { method: PeeringMethod },
	/// Symmetric NAT with no healthy relay.
	Unreachable,
}

impl PeerPath {
	pub fn method(&self) -> Option<PeeringMethod> {
		match self {
			PeerPath::Direct(config) => Some(config.method),
			PeerPath::ViaRelay { .. } => Some(PeeringMethod::ViaRelay),
			PeerPath::Converging { method } => Some(*method),
			PeerPath::Unreachable => None,
		}
	}
}

pub fn select_path(
	local: &LocalNodeState,
	peer: &PeerRecord,
	healthy_relay_available: bool,
) -> PeerPath {
	let peer_reflexive = peer.reflexive_endpoint().and_then(Endpoint::socket_addr);

	let same_network = peer_reflexive.is_some_and(|r| r.ip() == local.reflexive.ip());
	if same_network && (peer.relay || local.relay || !local.relay_only) {
		let method = if peer.relay {
			PeeringMethod::RelayPeerDirectLocal
		} else if local.relay {
			PeeringMethod::RelaySelfDirectLocal
		} else {
			PeeringMethod::DirectLocal
		};
		let endpoint = peer.local_endpoint().and_then(Endpoint::socket_addr);
		return direct(local, peer, method, endpoint);
	}

	if peer.relay {
		return direct(local, peer, PeeringMethod::RelayPeer, peer_reflexive);
	}
	if local.relay {
		return direct(local, peer, PeeringMethod::RelaySelf, peer_reflexive);
	}

	if local.relay_only || local.symmetric_nat || peer.symmetric_nat {
		return if healthy_relay_available {
			PeerPath::ViaRelay {
				child_prefixes: peer.advertise_cidrs.clone(),
			}
		} else {
			PeerPath::Unreachable
		};
	}

	direct(local, peer, PeeringMethod::Reflexive, peer_reflexive)
}

fn direct(
	local: &LocalNodeState,
	peer: &PeerRecord,
	method: PeeringMethod,
	endpoint: Option<SocketAddr>,
) -> PeerPath {
	let Some(endpoint) = endpoint else {
		return PeerPath::Converging { method };
	};

	let base = if method.uses_relay_supernet() && !local.relay_supernet.is_empty() {
		&local.relay_supernet
	} else {
		&peer.allowed_ips
	};
	let allowed_ips = dedup_prefixes(
		base
			.iter()
			.chain(peer.advertise_cidrs.iter())
			.copied(),
	);

	PeerPath::Direct(TunnelPeerConfig {
		public_key: peer.public_key,
		endpoint,
		allowed_ips,
		persistent_keepalive: None,
		method,
	})
}
