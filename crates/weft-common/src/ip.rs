// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IpError {
	#[error("unknown address family: {0} (expected v4 or v6)")]
	UnknownFamily(String),
}

/// `0.0.0.0/0` or `::/0`.
pub fn is_default_route(prefix: &IpNet) -> bool {
	prefix.prefix_len() == 0
}

/// `/32` for IPv4, `/128` for IPv6.
pub fn host_prefix(addr: IpAddr) -> IpNet {
	IpNet::from(addr)
}

/// Drops repeated prefixes while keeping first-seen order.
pub fn dedup_prefixes(prefixes: impl IntoIterator<Item = IpNet>) -> Vec<IpNet> {
	let mut seen = HashSet::new();
	prefixes
		.into_iter()
		.map(|p| p.trunc())
		.filter(|p| seen.insert(*p))
		.collect()
}

/// Parses `ip:port` or `[v6]:port`. Returns `None` for anything the
/// coordinator has not finished filling in (empty, host only, port 0).
pub fn parse_endpoint(raw: &str) -> Option<SocketAddr> {
	let addr: SocketAddr = raw.trim().parse().ok()?;
	if addr.port() == 0 || addr.ip().is_unspecified() {
		return None;
	}
	Some(addr)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpFamily {
	V4,
	V6,
}

impl IpFamily {
	pub fn matches(&self, addr: &IpAddr) -> bool {
		matches!(
			(self, addr),
			(IpFamily::V4, IpAddr::V4(_)) | (IpFamily::V6, IpAddr::V6(_))
		)
	}
}

impl fmt::Display for IpFamily {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			IpFamily::V4 => f.write_str("v4"),
			IpFamily::V6 => f.write_str("v6"),
		}
	}
}

impl std::str::FromStr for IpFamily {
	type Err = IpError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.to_ascii_lowercase().as_str() {
			"v4" | "ipv4" | "4" => Ok(IpFamily::V4),
			"v6" | "ipv6" | "6" => Ok(IpFamily::V6),
			other => Err(IpError::UnknownFamily(other.to_string())),
		}
	}
}
