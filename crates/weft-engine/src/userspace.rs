// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! In-process WireGuard backend.
//!
//! Owns the UDP listen socket and one `Tunn` per peer. There is no OS
//! interface: the only traffic originated or terminated here is ICMP echo,
//! which is enough for the prober to measure peers through the tunnel and
//! for peers to measure us.

use crate::backend::{BackendKind, InterfaceConfig, TunnelBackend};
use crate::error::{BackendError, ProbeError};
use crate::icmp::{self, ICMPV4_ECHO_REPLY, ICMPV4_ECHO_REQUEST};
use crate::router::Router;
use crate::selector::TunnelPeerConfig;
use async_trait::async_trait;
use defguard_boringtun::noise::{Tunn, TunnResult};
use ipnet::IpNet;
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{oneshot, watch, Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, instrument, trace, warn};
use weft_common::{WgKeyPair, WgPublicKey};

const TIMER_TICK: Duration = Duration::from_millis(250);
const BUF_LEN: usize = 65536;
const PROBE_PAYLOAD: &[u8] = b"weft-probe";

struct PeerTunnel {
	tunn: Mutex<Tunn>,
	endpoint: RwLock<SocketAddr>,
}

pub struct UserspaceBackend {
	this: Weak<UserspaceBackend>,
	keypair: WgKeyPair,
	socket: RwLock<Option<Arc<UdpSocket>>>,
	tunnels: RwLock<HashMap<WgPublicKey, Arc<PeerTunnel>>>,
	router: RwLock<Router>,
	routes: RwLock<HashSet<IpNet>>,
	addresses: RwLock<Vec<IpNet>>,
	pending: Mutex<HashMap<u16, oneshot::Sender<Instant>>>,
	ident: u16,
	next_seq: AtomicU16,
	next_index: AtomicU32,
	shutdown_rx: watch::Receiver<bool>,
}

impl UserspaceBackend {
	pub fn new(keypair: WgKeyPair, shutdown_rx: watch::Receiver<bool>) -> Arc<Self> {
		Arc::new_cyclic(|this| Self {
			this: this.clone(),
			keypair,
			socket: RwLock::new(None),
			tunnels: RwLock::new(HashMap::new()),
			router: RwLock::new(Router::new()),
			routes: RwLock::new(HashSet::new()),
			addresses: RwLock::new(Vec::new()),
			pending: Mutex::new(HashMap::new()),
			ident: fastrand::u16(..),
			next_seq: AtomicU16::new(1),
			next_index: AtomicU32::new(1),
			shutdown_rx,
		})
	}

	pub fn public_key(&self) -> WgPublicKey {
		*self.keypair.public_key()
	}

	pub async fn peer_count(&self) -> usize {
		self.tunnels.read().await.len()
	}

	pub async fn local_addr(&self) -> Option<SocketAddr> {
		let socket = self.socket.read().await.clone()?;
		socket.local_addr().ok()
	}

	async fn socket(&self) -> Result<Arc<UdpSocket>, BackendError> {
		self
			.socket
			.read()
			.await
			.clone()
			.ok_or(BackendError::NotRunning)
	}

	/// Sends an ICMPv4 echo request through the tunnel and waits for the
	/// reply.
	#[instrument(skip(self), fields(%dst))]
	pub async fn ping(&self, dst: IpAddr, wait: Duration) -> Result<Duration, ProbeError> {
		let IpAddr::V4(dst_v4) = dst else {
			return Err(ProbeError::Unsupported("userspace probing is IPv4 only"));
		};
		let src = self
			.addresses
			.read()
			.await
			.iter()
			.find_map(|net| match net.addr() {
				IpAddr::V4(v4) => Some(v4),
				IpAddr::V6(_) => None,
			})
			.ok_or(ProbeError::NoRoute(dst))?;

		let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
		let (tx, rx) = oneshot::channel();
		self.pending.lock().await.insert(seq, tx);

		let packet = icmp::build_ipv4_echo(src, dst_v4, ICMPV4_ECHO_REQUEST, self.ident, seq, PROBE_PAYLOAD);
		let started = Instant::now();
		if let Err(e) = self.send_ip_packet(dst, &packet).await {
			self.pending.lock().await.remove(&seq);
			return Err(e);
		}

		match tokio::time::timeout(wait, rx).await {
			Ok(Ok(received)) => Ok(received.duration_since(started)),
			_ => {
				self.pending.lock().await.remove(&seq);
				Err(ProbeError::Timeout)
			}
		}
	}

	async fn send_ip_packet(&self, dst: IpAddr, packet: &[u8]) -> Result<(), ProbeError> {
		if !self.routes.read().await.iter().any(|r| r.contains(&dst)) {
			return Err(ProbeError::NoRoute(dst));
		}
		let peer_key = self
			.router
			.read()
			.await
			.route(dst)
			.copied()
			.ok_or(ProbeError::NoRoute(dst))?;
		let tunnel = self
			.tunnels
			.read()
			.await
			.get(&peer_key)
			.cloned()
			.ok_or(ProbeError::NoRoute(dst))?;

		self
			.encapsulate_and_send(&peer_key, &tunnel, packet)
			.await
			.map_err(|e| match e {
				BackendError::Io(io) => ProbeError::Io(io),
				_ => ProbeError::NoRoute(dst),
			})
	}

	async fn encapsulate_and_send(
		&self,
		peer_key: &WgPublicKey,
		tunnel: &PeerTunnel,
		packet: &[u8],
	) -> Result<(), BackendError> {
		let socket = self.socket().await?;
		let endpoint = *tunnel.endpoint.read().await;
		let mut dst_buf = vec![0u8; BUF_LEN];

		let mut tunn = tunnel.tunn.lock().await;
		match tunn.encapsulate(packet, &mut dst_buf) {
			TunnResult::WriteToNetwork(data) => {
				trace!(len = data.len(), peer = %peer_key, "sending encrypted packet");
				socket.send_to(data, endpoint).await?;
			}
			TunnResult::Done => trace!("encapsulate done, no output"),
			TunnResult::Err(e) => {
				debug!(peer = %peer_key, ?e, "tunnel encapsulate error");
				return Err(BackendError::WireGuard(format!("{e:?}")));
			}
			_ => {}
		}
		Ok(())
	}

	async fn find_tunnel(&self, from: SocketAddr) -> Option<(WgPublicKey, Arc<PeerTunnel>)> {
		let tunnels = self.tunnels.read().await;
		for (key, tunnel) in tunnels.iter() {
			if *tunnel.endpoint.read().await == from {
				return Some((*key, Arc::clone(tunnel)));
			}
		}
		None
	}

	async fn handle_datagram(&self, socket: &UdpSocket, from: SocketAddr, datagram: &[u8]) {
		let mut dst_buf = vec![0u8; BUF_LEN];

		// Known endpoint first; otherwise a roaming peer or a first
		// handshake, so try every tunnel until one accepts it.
		let candidates: Vec<(WgPublicKey, Arc<PeerTunnel>)> = match self.find_tunnel(from).await {
			Some(found) => vec![found],
			None => self
				.tunnels
				.read()
				.await
				.iter()
				.map(|(k, t)| (*k, Arc::clone(t)))
				.collect(),
		};

		for (peer_key, tunnel) in candidates {
			let mut tunn = tunnel.tunn.lock().await;
			let mut outbound = Vec::new();
			let mut inbound = None;
			let accepted = match tunn.decapsulate(Some(from.ip()), datagram, &mut dst_buf) {
				TunnResult::Err(e) => {
					trace!(peer = %peer_key, ?e, "tunnel decapsulate error");
					false
				}
				TunnResult::Done => true,
				TunnResult::WriteToNetwork(data) => {
					outbound.push(data.to_vec());
					// Flush anything queued behind the handshake.
					let mut flush = vec![0u8; BUF_LEN];
					while let TunnResult::WriteToNetwork(more) = tunn.decapsulate(None, &[], &mut flush) {
						outbound.push(more.to_vec());
					}
					true
				}
				TunnResult::WriteToTunnelV4(data, _) => {
					inbound = Some(data.to_vec());
					true
				}
				TunnResult::WriteToTunnelV6(data, _) => {
					trace!(len = data.len(), "dropping inbound IPv6 packet");
					true
				}
			};
			drop(tunn);

			if !accepted {
				continue;
			}

			{
				let mut endpoint = tunnel.endpoint.write().await;
				if *endpoint != from {
					debug!(peer = %peer_key, old = %*endpoint, new = %from, "peer endpoint roamed");
					*endpoint = from;
				}
			}
			for data in outbound {
				if let Err(e) = socket.send_to(&data, from).await {
					warn!(peer = %peer_key, error = %e, "failed to send handshake response");
				}
			}
			if let Some(packet) = inbound {
				self.handle_inbound_v4(&peer_key, &tunnel, &packet).await;
			}
			return;
		}
	}

	async fn handle_inbound_v4(&self, peer_key: &WgPublicKey, tunnel: &PeerTunnel, packet: &[u8]) {
		let Some((src, dst, echo)) = icmp::parse_ipv4_echo(packet) else {
			trace!(len = packet.len(), "dropping inbound non-echo packet");
			return;
		};

		match echo.kind {
			ICMPV4_ECHO_REPLY if echo.ident == self.ident => {
				if let Some(tx) = self.pending.lock().await.remove(&echo.seq) {
					let _ = tx.send(Instant::now());
				}
			}
			ICMPV4_ECHO_REQUEST if self.owns_address(IpAddr::V4(dst)).await => {
				let reply = icmp::build_ipv4_echo(
					dst,
					src,
					ICMPV4_ECHO_REPLY,
					echo.ident,
					echo.seq,
					&echo.payload,
				);
				if let Err(e) = self.encapsulate_and_send(peer_key, tunnel, &reply).await {
					debug!(peer = %peer_key, error = %e, "failed to answer echo request");
				}
			}
			_ => trace!(%src, %dst, "ignoring echo"),
		}
	}

	async fn owns_address(&self, addr: IpAddr) -> bool {
		self.addresses.read().await.iter().any(|net| net.addr() == addr)
	}

	fn spawn_recv_loop(self: Arc<Self>, socket: Arc<UdpSocket>) -> tokio::task::JoinHandle<()> {
		let mut shutdown_rx = self.shutdown_rx.clone();
		tokio::spawn(async move {
			let mut buf = vec![0u8; BUF_LEN];
			loop {
				tokio::select! {
					biased;

					_ = shutdown_rx.changed() => {
						if *shutdown_rx.borrow() {
							info!("userspace recv loop shutting down");
							break;
						}
					}

					result = socket.recv_from(&mut buf) => {
						match result {
							Ok((len, from)) => self.handle_datagram(&socket, from, &buf[..len]).await,
							Err(e) => warn!(error = %e, "tunnel socket recv error"),
						}
					}
				}
			}
		})
	}

	fn spawn_timer_loop(self: Arc<Self>, socket: Arc<UdpSocket>) -> tokio::task::JoinHandle<()> {
		let mut shutdown_rx = self.shutdown_rx.clone();
		tokio::spawn(async move {
			let mut dst_buf = vec![0u8; BUF_LEN];
			let mut interval = tokio::time::interval(TIMER_TICK);
			interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
			loop {
				tokio::select! {
					biased;

					_ = shutdown_rx.changed() => {
						if *shutdown_rx.borrow() {
							info!("userspace timer loop shutting down");
							break;
						}
					}

					_ = interval.tick() => {
						let tunnels: Vec<(WgPublicKey, Arc<PeerTunnel>)> = self
							.tunnels
							.read()
							.await
							.iter()
							.map(|(k, t)| (*k, Arc::clone(t)))
							.collect();
						for (peer_key, tunnel) in tunnels {
							let endpoint = *tunnel.endpoint.read().await;
							let mut tunn = tunnel.tunn.lock().await;
							match tunn.update_timers(&mut dst_buf) {
								TunnResult::WriteToNetwork(data) => {
									trace!(len = data.len(), peer = %peer_key, "sending handshake/keepalive");
									if let Err(e) = socket.send_to(data, endpoint).await {
										warn!(peer = %peer_key, error = %e, "failed to send timer packet");
									}
								}
								TunnResult::Err(e) => debug!(peer = %peer_key, ?e, "timer update error"),
								_ => {}
							}
						}
					}
				}
			}
		})
	}
}

fn bind_listen_socket(port: u16) -> std::io::Result<UdpSocket> {
	let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
	socket.set_reuse_address(true)?;
	#[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
	socket.set_reuse_port(true)?;
	socket.set_nonblocking(true)?;
	let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
	socket.bind(&addr.into())?;
	let std_socket: std::net::UdpSocket = socket.into();
	UdpSocket::from_std(std_socket)
}

#[async_trait]
impl TunnelBackend for UserspaceBackend {
	fn kind(&self) -> BackendKind {
		BackendKind::Userspace
	}

	#[instrument(skip(self, config), fields(listen_port = config.listen_port))]
	async fn setup_interface(&self, config: &InterfaceConfig) -> Result<(), BackendError> {
		*self.addresses.write().await = config.addresses.clone();

		if self.socket.read().await.is_some() {
			debug!("userspace tunnel already running, addresses updated");
			return Ok(());
		}

		let socket = Arc::new(bind_listen_socket(config.listen_port)?);
		*self.socket.write().await = Some(Arc::clone(&socket));

		let this = self.this.upgrade().ok_or(BackendError::NotRunning)?;
		Arc::clone(&this).spawn_recv_loop(Arc::clone(&socket));
		this.spawn_timer_loop(Arc::clone(&socket));

		info!(local = ?socket.local_addr().ok(), addresses = ?config.addresses, "userspace tunnel ready");
		Ok(())
	}

	#[instrument(skip(self, peer), fields(peer = %peer.public_key, endpoint = %peer.endpoint, method = %peer.method))]
	async fn configure_peer(&self, peer: &TunnelPeerConfig) -> Result<(), BackendError> {
		let existing = self.tunnels.read().await.get(&peer.public_key).cloned();
		match existing {
			Some(tunnel) => {
				*tunnel.endpoint.write().await = peer.endpoint;
			}
			None => {
				let tunn = Tunn::new(
					defguard_boringtun::x25519::StaticSecret::from(
						*self.keypair.private_key().expose_bytes(),
					),
					defguard_boringtun::x25519::PublicKey::from(*peer.public_key.as_bytes()),
					None,
					peer.persistent_keepalive.filter(|k| *k > 0),
					self.next_index.fetch_add(1, Ordering::Relaxed),
					None,
				);
				self.tunnels.write().await.insert(
					peer.public_key,
					Arc::new(PeerTunnel {
						tunn: Mutex::new(tunn),
						endpoint: RwLock::new(peer.endpoint),
					}),
				);
			}
		}

		self
			.router
			.write()
			.await
			.set_routes(peer.public_key, &peer.allowed_ips);
		debug!("peer configured");
		Ok(())
	}

	#[instrument(skip(self), fields(peer = %public_key))]
	async fn remove_peer(&self, public_key: &WgPublicKey) -> Result<(), BackendError> {
		if self.tunnels.write().await.remove(public_key).is_none() {
			debug!("peer was not configured");
		}
		self.router.write().await.remove_peer(public_key);
		Ok(())
	}

	async fn route_exists(&self, prefix: &IpNet) -> Result<bool, BackendError> {
		Ok(self.routes.read().await.contains(&prefix.trunc()))
	}

	async fn add_route(&self, prefix: &IpNet) -> Result<(), BackendError> {
		self.routes.write().await.insert(prefix.trunc());
		Ok(())
	}

	async fn del_route(&self, prefix: &IpNet) -> Result<(), BackendError> {
		self.routes.write().await.remove(&prefix.trunc());
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::selector::PeeringMethod;

	fn peer_config(key: WgPublicKey, endpoint: SocketAddr, allowed: &str) -> TunnelPeerConfig {
		TunnelPeerConfig {
			public_key: key,
			endpoint,
			allowed_ips: vec![allowed.parse().unwrap()],
			persistent_keepalive: None,
			method: PeeringMethod::DirectLocal,
		}
	}

	async fn node(
		address: &str,
		shutdown_rx: watch::Receiver<bool>,
	) -> (Arc<UserspaceBackend>, SocketAddr) {
		let backend = UserspaceBackend::new(WgKeyPair::generate(), shutdown_rx);
		backend
			.setup_interface(&InterfaceConfig {
				name: "weft-test".to_string(),
				listen_port: 0,
				addresses: vec![address.parse().unwrap()],
				relay: false,
			})
			.await
			.unwrap();
		let port = backend.local_addr().await.unwrap().port();
		(backend, SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port))
	}

	#[tokio::test]
	async fn ping_round_trips_through_tunnel() {
		let (shutdown_tx, shutdown_rx) = watch::channel(false);
		let (a, a_addr) = node("100.64.0.1/10", shutdown_rx.clone()).await;
		let (b, b_addr) = node("100.64.0.2/10", shutdown_rx).await;

		a.configure_peer(&peer_config(b.public_key(), b_addr, "100.64.0.2/32"))
			.await
			.unwrap();
		a.add_route(&"100.64.0.2/32".parse().unwrap()).await.unwrap();
		b.configure_peer(&peer_config(a.public_key(), a_addr, "100.64.0.1/32"))
			.await
			.unwrap();
		b.add_route(&"100.64.0.1/32".parse().unwrap()).await.unwrap();

		// The first echo rides the handshake; allow a couple of tries.
		let mut ok = false;
		for _ in 0..5 {
			if a
				.ping("100.64.0.2".parse().unwrap(), Duration::from_secs(2))
				.await
				.is_ok()
			{
				ok = true;
				break;
			}
		}
		assert!(ok, "echo through the tunnel never completed");

		let _ = shutdown_tx.send(true);
	}

	#[tokio::test]
	async fn ping_without_route_fails_fast() {
		let (_shutdown_tx, shutdown_rx) = watch::channel(false);
		let (a, _) = node("100.64.0.1/10", shutdown_rx).await;

		let err = a
			.ping("100.64.0.9".parse().unwrap(), Duration::from_millis(100))
			.await
			.unwrap_err();
		assert!(matches!(err, ProbeError::NoRoute(_)));
	}

	#[tokio::test]
	async fn ipv6_ping_is_unsupported() {
		let (_shutdown_tx, shutdown_rx) = watch::channel(false);
		let (a, _) = node("100.64.0.1/10", shutdown_rx).await;

		let err = a
			.ping("fd00::2".parse().unwrap(), Duration::from_millis(100))
			.await
			.unwrap_err();
		assert!(matches!(err, ProbeError::Unsupported(_)));
	}

	#[tokio::test]
	async fn remove_peer_drops_cryptokey_routes() {
		let (_shutdown_tx, shutdown_rx) = watch::channel(false);
		let (a, _) = node("100.64.0.1/10", shutdown_rx).await;
		let key = *WgKeyPair::generate().public_key();

		a.configure_peer(&peer_config(key, "127.0.0.1:9".parse().unwrap(), "100.64.0.5/32"))
			.await
			.unwrap();
		assert_eq!(a.peer_count().await, 1);

		a.remove_peer(&key).await.unwrap();
		assert_eq!(a.peer_count().await, 0);
		assert_eq!(a.router.read().await.route_count(), 0);
	}

	#[tokio::test]
	async fn routes_are_tracked() {
		let (_shutdown_tx, shutdown_rx) = watch::channel(false);
		let (a, _) = node("100.64.0.1/10", shutdown_rx).await;
		let prefix: IpNet = "10.20.0.0/16".parse().unwrap();

		assert!(!a.route_exists(&prefix).await.unwrap());
		a.add_route(&prefix).await.unwrap();
		assert!(a.route_exists(&prefix).await.unwrap());
		a.del_route(&prefix).await.unwrap();
		assert!(!a.route_exists(&prefix).await.unwrap());
	}
}
