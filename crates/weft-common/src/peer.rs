// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::ip::parse_endpoint;
use crate::keys::WgPublicKey;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(Uuid);

impl PeerId {
	pub fn new() -> Self {
		Self(Uuid::new_v4())
	}

	pub fn from_uuid(uuid: Uuid) -> Self {
		Self(uuid)
	}

	pub fn as_uuid(&self) -> &Uuid {
		&self.0
	}
}

impl Default for PeerId {
	fn default() -> Self {
		Self::new()
	}
}

impl fmt::Display for PeerId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl std::str::FromStr for PeerId {
	type Err = uuid::Error;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Ok(Self(s.parse()?))
	}
}

/// Where an endpoint was learned. On the wire this is `"local"` or
/// `"stun:<reflector host:port>"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum EndpointSource {
	Local,
	Stun(String),
}

impl EndpointSource {
	pub fn is_local(&self) -> bool {
		matches!(self, EndpointSource::Local)
	}
}

impl fmt::Display for EndpointSource {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			EndpointSource::Local => f.write_str("local"),
			EndpointSource::Stun(server) => write!(f, "stun:{server}"),
		}
	}
}

impl TryFrom<String> for EndpointSource {
	type Error = String;

	fn try_from(value: String) -> Result<Self, Self::Error> {
		if value == "local" {
			return Ok(EndpointSource::Local);
		}
		match value.strip_prefix("stun:") {
			Some(server) => Ok(EndpointSource::Stun(server.to_string())),
			None if value == "stun" => Ok(EndpointSource::Stun(String::new())),
			None => Err(format!("unknown endpoint source: {value}")),
		}
	}
}

impl From<EndpointSource> for String {
	fn from(value: EndpointSource) -> Self {
		value.to_string()
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
	pub source: EndpointSource,
	/// Kept as the raw string: the coordinator may publish a half-filled
	/// value while a device is still registering.
	pub address: String,
}

impl Endpoint {
	pub fn local(addr: SocketAddr) -> Self {
		Self {
			source: EndpointSource::Local,
			address: addr.to_string(),
		}
	}

	pub fn stun(server: impl Into<String>, addr: SocketAddr) -> Self {
		Self {
			source: EndpointSource::Stun(server.into()),
			address: addr.to_string(),
		}
	}

	pub fn socket_addr(&self) -> Option<SocketAddr> {
		parse_endpoint(&self.address)
	}
}

/// A device as listed by the coordinator. Replaced wholesale on every
/// refresh, never edited locally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
	pub id: PeerId,
	pub public_key: WgPublicKey,
	#[serde(default)]
	pub endpoints: Vec<Endpoint>,
	/// Tunnel address host prefixes plus anything the peer advertises.
	#[serde(default)]
	pub allowed_ips: Vec<IpNet>,
	/// Child prefixes: subnets reachable behind the peer.
	#[serde(default)]
	pub advertise_cidrs: Vec<IpNet>,
	#[serde(default)]
	pub tunnel_ipv4: Option<Ipv4Addr>,
	#[serde(default)]
	pub tunnel_ipv6: Option<Ipv6Addr>,
	#[serde(default)]
	pub hostname: String,
	#[serde(default)]
	pub relay: bool,
	#[serde(default)]
	pub symmetric_nat: bool,
	pub organization_id: Uuid,
}

impl PeerRecord {
	pub fn local_endpoint(&self) -> Option<&Endpoint> {
		self.endpoints.iter().find(|e| e.source.is_local())
	}

	pub fn reflexive_endpoint(&self) -> Option<&Endpoint> {
		self.endpoints.iter().find(|e| !e.source.is_local())
	}
}
