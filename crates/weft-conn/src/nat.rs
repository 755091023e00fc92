// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! NAT classification.
//!
//! Two reflectors are queried from the tunnel's listen port. A node whose
//! mapping differs per reflector sits behind a symmetric NAT and cannot be
//! reached at a single learned address:port.

use crate::stun::{
	binding_request, bind_reusable, resolve_stun_servers, Result, StunError, StunServer,
	DEFAULT_STUN_SERVERS, STUN_TIMEOUT,
};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::{debug, info, instrument, warn};

const DEFAULT_ATTEMPTS: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Used only to ask the kernel which source address it would pick. No
/// packet is sent by a UDP connect.
const ROUTE_PROBE_TARGET: SocketAddr =
	SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)), 9);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NatDiscovery {
	/// LAN address and listen port.
	pub local: SocketAddr,
	/// Externally mapped address, or `local` when `fallback` is set.
	pub reflexive: SocketAddr,
	/// Reflector that reported `reflexive`.
	pub reflector: Option<String>,
	pub symmetric: bool,
	/// No reflector answered.
	pub fallback: bool,
}

/// One reflector answer between full discoveries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recheck {
	pub reflector: String,
	pub mapped: SocketAddr,
	/// The query left from the listen port. When false the port was held by
	/// a socket we cannot share (kernel WireGuard) and an ephemeral port
	/// was used, so only `mapped.ip()` says anything about the tunnel.
	pub from_listen_port: bool,
}

/// Mappings observed from one source port. Symmetric when any two differ.
pub fn is_symmetric(mappings: &[SocketAddr]) -> bool {
	match mappings.split_first() {
		Some((first, rest)) => rest.iter().any(|m| m != first),
		None => false,
	}
}

#[derive(Debug, Clone)]
pub struct NatDiscoverer {
	servers: Vec<String>,
	listen_port: u16,
	timeout: Duration,
	attempts: u32,
}

impl NatDiscoverer {
	pub fn new(servers: Vec<String>, listen_port: u16) -> Self {
		let servers = if servers.is_empty() {
			DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect()
		} else {
			servers
		};
		Self {
			servers,
			listen_port,
			timeout: STUN_TIMEOUT,
			attempts: DEFAULT_ATTEMPTS,
		}
	}

	pub fn with_timeout(mut self, timeout: Duration) -> Self {
		self.timeout = timeout;
		self
	}

	pub fn with_attempts(mut self, attempts: u32) -> Self {
		self.attempts = attempts.max(1);
		self
	}

	pub fn listen_port(&self) -> u16 {
		self.listen_port
	}

	/// Finds the local and reflexive endpoints and classifies the NAT.
	/// Never fails on unreachable reflectors: the node then falls back to its
	/// local address and is treated as not symmetric.
	#[instrument(skip(self), fields(listen_port = self.listen_port))]
	pub async fn discover(&self) -> NatDiscovery {
		let servers = resolve_stun_servers(&self.servers).await;
		let local_ip = local_ip(servers.first().map(|s| s.addr)).await;
		let local = SocketAddr::new(local_ip, self.listen_port);

		let mut mappings = Vec::new();
		for attempt in 1..=self.attempts {
			match self.query_pair(&servers).await {
				Ok(found) if !found.is_empty() => {
					mappings = found;
					break;
				}
				Ok(_) => debug!(attempt, "no reflector answered"),
				Err(e) => warn!(attempt, error = %e, "NAT discovery attempt failed"),
			}
			if attempt < self.attempts {
				tokio::time::sleep(RETRY_DELAY).await;
			}
		}

		let Some((reflector, reflexive)) = mappings.first().cloned() else {
			warn!(%local, "no STUN reflector reachable, using local address as reflexive endpoint");
			return NatDiscovery {
				local,
				reflexive: local,
				reflector: None,
				symmetric: false,
				fallback: true,
			};
		};

		let observed: Vec<SocketAddr> = mappings.iter().map(|(_, addr)| *addr).collect();
		let symmetric = is_symmetric(&observed);
		if symmetric {
			info!(mappings = ?observed, "symmetric NAT detected, peers will be reached through the relay");
		} else {
			info!(%reflexive, "reflexive endpoint discovered");
		}

		NatDiscovery {
			local,
			reflexive,
			reflector: Some(reflector),
			symmetric,
			fallback: false,
		}
	}

	/// Queries reflectors in order until one answers and returns its
	/// mapping. Used to notice a changed NAT binding between full
	/// discoveries.
	///
	/// Falls back to an ephemeral source port when the listen port is
	/// already bound without `SO_REUSEPORT`, as it is while the kernel
	/// interface is up.
	#[instrument(skip(self), fields(listen_port = self.listen_port))]
	pub async fn recheck(&self) -> Result<Recheck> {
		let servers = resolve_stun_servers(&self.servers).await;
		if servers.is_empty() {
			return Err(StunError::NoServers);
		}
		let (socket, from_listen_port) = match bind_reusable(self.listen_port) {
			Ok(socket) => (socket, true),
			Err(StunError::Io(e)) if e.kind() == std::io::ErrorKind::AddrInUse => {
				debug!("listen port held by the tunnel, rechecking from an ephemeral port");
				(bind_reusable(0)?, false)
			}
			Err(e) => return Err(e),
		};
		for server in &servers {
			match binding_request(&socket, server, self.timeout).await {
				Ok(mapped) => {
					return Ok(Recheck {
						reflector: server.name.clone(),
						mapped,
						from_listen_port,
					})
				}
				Err(e) => debug!(server = %server.name, error = %e, "reflector recheck failed"),
			}
		}
		Err(StunError::Timeout)
	}

	/// Asks up to two reflectors, from one socket so both see the same
	/// source port.
	async fn query_pair(&self, servers: &[StunServer]) -> Result<Vec<(String, SocketAddr)>> {
		let socket = bind_reusable(self.listen_port)?;
		let mut found = Vec::with_capacity(2);
		for server in servers {
			match binding_request(&socket, server, self.timeout).await {
				Ok(addr) => {
					debug!(server = %server.name, %addr, "reflector answered");
					found.push((server.name.clone(), addr));
					if found.len() == 2 {
						break;
					}
				}
				Err(e) => debug!(server = %server.name, error = %e, "reflector did not answer"),
			}
		}
		Ok(found)
	}
}

/// Source address the kernel would use towards `target`, loopback when the
/// host has no route at all.
async fn local_ip(target: Option<SocketAddr>) -> IpAddr {
	let target = target.unwrap_or(ROUTE_PROBE_TARGET);
	let probe = async {
		let socket = UdpSocket::bind("0.0.0.0:0").await?;
		socket.connect(target).await?;
		socket.local_addr()
	};
	match probe.await {
		Ok(addr) if !addr.ip().is_unspecified() => addr.ip(),
		Ok(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
		Err(e) => {
			warn!(error = %e, "no route to determine local address, using loopback");
			IpAddr::V4(Ipv4Addr::LOCALHOST)
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::stun::tests::fake_reflector;

	fn discoverer(servers: &[StunServer]) -> NatDiscoverer {
		NatDiscoverer::new(servers.iter().map(|s| s.addr.to_string()).collect(), 0)
			.with_timeout(Duration::from_millis(300))
			.with_attempts(1)
	}

	#[test]
	fn symmetric_when_mappings_differ() {
		let a: SocketAddr = "203.0.113.9:40000".parse().unwrap();
		let b: SocketAddr = "203.0.113.9:40001".parse().unwrap();
		assert!(is_symmetric(&[a, b]));
		assert!(!is_symmetric(&[a, a]));
		assert!(!is_symmetric(&[a]));
		assert!(!is_symmetric(&[]));
	}

	#[test]
	fn empty_server_list_uses_defaults() {
		let d = NatDiscoverer::new(vec![], 51820);
		assert_eq!(d.servers.len(), DEFAULT_STUN_SERVERS.len());
		assert_eq!(d.listen_port(), 51820);
	}

	#[tokio::test]
	async fn consistent_mapping_is_not_symmetric() {
		let servers = vec![fake_reflector(None).await, fake_reflector(None).await];
		let result = discoverer(&servers).discover().await;

		assert!(!result.fallback);
		assert!(!result.symmetric);
		assert_eq!(result.reflexive.ip(), IpAddr::V4(Ipv4Addr::new(203, 0, 113, 9)));
		assert_eq!(result.reflector.as_deref(), Some(servers[0].addr.to_string().as_str()));
	}

	#[tokio::test]
	async fn differing_ports_are_symmetric() {
		let servers = vec![
			fake_reflector(Some(1111)).await,
			fake_reflector(Some(2222)).await,
		];
		let result = discoverer(&servers).discover().await;

		assert!(!result.fallback);
		assert!(result.symmetric);
		assert_eq!(result.reflexive.port(), 1111);
	}

	#[tokio::test]
	async fn single_answer_is_not_symmetric() {
		let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
		let servers = vec![
			fake_reflector(Some(1111)).await,
			StunServer {
				name: "silent".to_string(),
				addr: silent.local_addr().unwrap(),
			},
		];
		let result = discoverer(&servers).discover().await;

		assert!(!result.fallback);
		assert!(!result.symmetric);
		assert_eq!(result.reflexive.port(), 1111);
	}

	#[tokio::test]
	async fn unreachable_reflectors_fall_back_to_local() {
		let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
		let servers = vec![StunServer {
			name: "silent".to_string(),
			addr: silent.local_addr().unwrap(),
		}];
		let result = discoverer(&servers).discover().await;

		assert!(result.fallback);
		assert!(!result.symmetric);
		assert_eq!(result.reflexive, result.local);
		assert!(result.reflector.is_none());
	}

	#[tokio::test]
	async fn recheck_returns_first_answer() {
		let servers = vec![fake_reflector(Some(4242)).await];
		let found = discoverer(&servers).recheck().await.unwrap();
		assert_eq!(found.reflector, servers[0].addr.to_string());
		assert_eq!(found.mapped.port(), 4242);
		assert!(found.from_listen_port);
	}

	#[tokio::test]
	async fn held_listen_port_makes_discovery_fall_back() {
		// A plain socket, like the kernel's, refuses to share its port.
		let holder = std::net::UdpSocket::bind("0.0.0.0:0").unwrap();
		let port = holder.local_addr().unwrap().port();
		let servers = vec![fake_reflector(None).await, fake_reflector(None).await];
		let nat = NatDiscoverer::new(servers.iter().map(|s| s.addr.to_string()).collect(), port)
			.with_timeout(Duration::from_millis(300))
			.with_attempts(1);

		assert!(nat.discover().await.fallback);

		drop(holder);
		let result = nat.discover().await;
		assert!(!result.fallback);
		assert_eq!(result.reflexive.port(), port);
	}

	#[tokio::test]
	async fn recheck_uses_ephemeral_port_while_listen_port_is_held() {
		let holder = std::net::UdpSocket::bind("0.0.0.0:0").unwrap();
		let port = holder.local_addr().unwrap().port();
		let servers = vec![fake_reflector(None).await];
		let nat = NatDiscoverer::new(vec![servers[0].addr.to_string()], port)
			.with_timeout(Duration::from_millis(300));

		let found = nat.recheck().await.unwrap();

		assert!(!found.from_listen_port);
		assert_ne!(found.mapped.port(), port);
		assert_eq!(found.mapped.ip(), IpAddr::V4(Ipv4Addr::new(203, 0, 113, 9)));
	}
}
