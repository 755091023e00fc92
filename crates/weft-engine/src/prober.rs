// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Connectivity prober.
//!
//! Peers are probed in fixed-size batches: every probe in a batch runs
//! concurrently and the batch is awaited in full before the next starts.
//! Results only ever touch the health table of the device cache.

use crate::cache::{DeviceCache, HealthResult, ProbeTarget};
use crate::error::ProbeError;
use crate::icmp::{self, ICMPV4_ECHO_REPLY, ICMPV4_ECHO_REQUEST, ICMPV6_ECHO_REPLY, ICMPV6_ECHO_REQUEST};
use crate::local::LocalState;
use crate::shutdown::{shutdown_requested, until_shutdown};
use crate::userspace::UserspaceBackend;
use async_trait::async_trait;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::collections::HashMap;
use std::io::{self, Read};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, instrument, trace};
use weft_common::{IpFamily, WgPublicKey};

pub const DEFAULT_BATCH_SIZE: usize = 10;
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(1200);

const PROBE_PAYLOAD: &[u8] = b"weft-probe";

#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
	/// Round-trip time to `addr`, or why it could not be measured.
	async fn probe(&self, addr: IpAddr, timeout: Duration) -> Result<Duration, ProbeError>;
}

/// ICMP echo over the OS route table, for the kernel backend.
pub struct IcmpProbe {
	ident: u16,
	next_seq: AtomicU16,
}

impl Default for IcmpProbe {
	fn default() -> Self {
		Self::new()
	}
}

impl IcmpProbe {
	pub fn new() -> Self {
		Self {
			ident: fastrand::u16(..),
			next_seq: AtomicU16::new(1),
		}
	}
}

#[async_trait]
impl ReachabilityProbe for IcmpProbe {
	async fn probe(&self, addr: IpAddr, timeout: Duration) -> Result<Duration, ProbeError> {
		let ident = self.ident;
		let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
		tokio::task::spawn_blocking(move || echo_blocking(addr, ident, seq, timeout))
			.await
			.map_err(|e| ProbeError::Io(io::Error::other(e)))?
	}
}

/// Unprivileged datagram ICMP socket where the kernel allows it, raw
/// otherwise. Returns whether the socket is raw.
fn icmp_socket(addr: IpAddr) -> io::Result<(Socket, bool)> {
	let (domain, protocol) = match addr {
		IpAddr::V4(_) => (Domain::IPV4, Protocol::ICMPV4),
		IpAddr::V6(_) => (Domain::IPV6, Protocol::ICMPV6),
	};
	match Socket::new(domain, Type::DGRAM, Some(protocol)) {
		Ok(socket) => Ok((socket, false)),
		Err(e) => {
			trace!(error = %e, "datagram ICMP socket unavailable, trying raw");
			Ok((Socket::new(domain, Type::RAW, Some(protocol))?, true))
		}
	}
}

fn echo_blocking(addr: IpAddr, ident: u16, seq: u16, timeout: Duration) -> Result<Duration, ProbeError> {
	let (socket, raw) = icmp_socket(addr)?;
	let (request, reply) = match addr {
		IpAddr::V4(_) => (ICMPV4_ECHO_REQUEST, ICMPV4_ECHO_REPLY),
		IpAddr::V6(_) => (ICMPV6_ECHO_REQUEST, ICMPV6_ECHO_REPLY),
	};

	socket.connect(&SockAddr::from(SocketAddr::new(addr, 0)))?;
	let started = Instant::now();
	socket.send(&icmp::build_echo(request, ident, seq, PROBE_PAYLOAD))?;

	let mut buf = [0u8; 1500];
	loop {
		let remaining = timeout
			.checked_sub(started.elapsed())
			.filter(|d| !d.is_zero())
			.ok_or(ProbeError::Timeout)?;
		socket.set_read_timeout(Some(remaining))?;

		let len = match (&socket).read(&mut buf) {
			Ok(len) => len,
			Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
				return Err(ProbeError::Timeout);
			}
			Err(e) => return Err(e.into()),
		};

		let Some(echo) = icmp::parse_echo(icmp::strip_ipv4_header(&buf[..len])) else {
			continue;
		};
		// Datagram sockets have their identifier rewritten by the kernel.
		if echo.kind == reply && echo.seq == seq && (!raw || echo.ident == ident) {
			return Ok(started.elapsed());
		}
	}
}

/// ICMPv4 echo through the in-process tunnel, for the userspace backend.
pub struct UserspaceProbe {
	backend: Arc<UserspaceBackend>,
}

impl UserspaceProbe {
	pub fn new(backend: Arc<UserspaceBackend>) -> Self {
		Self { backend }
	}
}

#[async_trait]
impl ReachabilityProbe for UserspaceProbe {
	async fn probe(&self, addr: IpAddr, timeout: Duration) -> Result<Duration, ProbeError> {
		self.backend.ping(addr, timeout).await
	}
}

pub struct Prober {
	probe: Arc<dyn ReachabilityProbe>,
	batch_size: usize,
	timeout: Duration,
}

impl Prober {
	pub fn new(probe: Arc<dyn ReachabilityProbe>) -> Self {
		Self {
			probe,
			batch_size: DEFAULT_BATCH_SIZE,
			timeout: DEFAULT_PROBE_TIMEOUT,
		}
	}

	pub fn with_batch_size(mut self, batch_size: usize) -> Self {
		self.batch_size = batch_size.max(1);
		self
	}

	pub fn with_timeout(mut self, timeout: Duration) -> Self {
		self.timeout = timeout;
		self
	}

	#[instrument(skip_all, fields(targets = targets.len(), batch_size = self.batch_size))]
	pub async fn probe_all(&self, targets: &[ProbeTarget]) -> HashMap<WgPublicKey, HealthResult> {
		let mut results = HashMap::with_capacity(targets.len());

		for batch in targets.chunks(self.batch_size) {
			let probes = batch.iter().map(|target| async move {
				let result = match self.probe.probe(target.address, self.timeout).await {
					Ok(rtt) => {
						trace!(peer = %target.public_key, address = %target.address, ?rtt, "peer reachable");
						HealthResult::reachable(rtt)
					}
					Err(e) => {
						debug!(peer = %target.public_key, address = %target.address, error = %e, "peer unreachable");
						HealthResult::unreachable()
					}
				};
				(target.public_key, result)
			});
			for (key, result) in futures::future::join_all(probes).await {
				results.insert(key, result);
			}
		}

		results
	}

	/// Probes every cached peer with a tunnel address in `family` and records
	/// the results. A relay probes nobody.
	pub async fn probe_family(
		&self,
		cache: &DeviceCache,
		family: IpFamily,
		local_is_relay: bool,
	) -> HashMap<WgPublicKey, HealthResult> {
		if local_is_relay {
			return HashMap::new();
		}
		let targets = cache.probe_targets(family).await;
		let results = self.probe_all(&targets).await;
		cache.record_health(&results).await;
		results
	}

	/// One periodic pass over both families. A peer counts as reachable if
	/// either of its addresses answered.
	pub async fn probe_cycle(&self, cache: &DeviceCache, local_is_relay: bool) -> HashMap<WgPublicKey, HealthResult> {
		if local_is_relay {
			return HashMap::new();
		}
		let mut results = self.probe_all(&cache.probe_targets(IpFamily::V4).await).await;
		for (key, v6) in self.probe_all(&cache.probe_targets(IpFamily::V6).await).await {
			match results.get(&key) {
				Some(v4) if v4.reachable => {}
				_ => {
					results.insert(key, v6);
				}
			}
		}
		cache.record_health(&results).await;
		results
	}

	pub async fn run(
		&self,
		cache: Arc<DeviceCache>,
		local: LocalState,
		interval: Duration,
		mut shutdown_rx: watch::Receiver<bool>,
	) {
		let mut ticker = tokio::time::interval(interval);
		ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

		loop {
			tokio::select! {
				biased;

				stop = shutdown_requested(&mut shutdown_rx) => {
					if stop {
						info!("prober shutting down");
						return;
					}
				}

				_ = ticker.tick() => {
					let relay = local.snapshot().await.relay;
					let cycle = self.probe_cycle(&cache, relay);
					let Some(results) = until_shutdown(&mut shutdown_rx, cycle).await else {
						info!("prober shutting down mid-cycle");
						return;
					};
					let reachable = results.values().filter(|r| r.reachable).count();
					debug!(probed = results.len(), reachable, "probe cycle complete");
				}
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::cache::DeviceCacheEntry;
	use crate::selector::tests::peer;
	use std::collections::HashSet;
	use std::sync::atomic::AtomicUsize;
	use std::sync::Mutex;
	use weft_common::{PeerId, PeerRecord};

	#[derive(Default)]
	struct FakeProbe {
		down: Mutex<HashSet<IpAddr>>,
		in_flight: AtomicUsize,
		max_in_flight: AtomicUsize,
		calls: AtomicUsize,
	}

	#[async_trait]
	impl ReachabilityProbe for FakeProbe {
		async fn probe(&self, addr: IpAddr, _timeout: Duration) -> Result<Duration, ProbeError> {
			self.calls.fetch_add(1, Ordering::SeqCst);
			let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
			self.max_in_flight.fetch_max(now, Ordering::SeqCst);
			tokio::time::sleep(Duration::from_millis(5)).await;
			self.in_flight.fetch_sub(1, Ordering::SeqCst);

			if self.down.lock().unwrap().contains(&addr) {
				Err(ProbeError::Timeout)
			} else {
				Ok(Duration::from_millis(2))
			}
		}
	}

	fn target(i: u8) -> ProbeTarget {
		ProbeTarget {
			public_key: WgPublicKey::from_bytes([i; 32]),
			address: IpAddr::from([100, 64, 0, i]),
		}
	}

	async fn cache_with(records: Vec<PeerRecord>) -> DeviceCache {
		let cache = DeviceCache::new();
		let entries: HashMap<PeerId, DeviceCacheEntry> = records
			.into_iter()
			.map(|record| {
				(
					record.id,
					DeviceCacheEntry {
						allowed_ips: record.allowed_ips.clone(),
						record,
						method: None,
						endpoint: None,
					},
				)
			})
			.collect();
		cache.replace(entries).await;
		cache
	}

	#[tokio::test]
	async fn batches_bound_concurrency() {
		let fake = Arc::new(FakeProbe::default());
		let prober = Prober::new(fake.clone()).with_batch_size(10);
		let targets: Vec<ProbeTarget> = (1..=25).map(target).collect();

		let results = prober.probe_all(&targets).await;

		assert_eq!(results.len(), 25);
		assert_eq!(fake.calls.load(Ordering::SeqCst), 25);
		assert!(fake.max_in_flight.load(Ordering::SeqCst) <= 10);
		assert!(fake.max_in_flight.load(Ordering::SeqCst) > 1);
	}

	#[tokio::test]
	async fn failures_are_unreachable_results() {
		let fake = Arc::new(FakeProbe::default());
		fake.down.lock().unwrap().insert(IpAddr::from([100, 64, 0, 2]));
		let prober = Prober::new(fake);

		let results = prober.probe_all(&[target(1), target(2)]).await;

		assert!(results[&target(1).public_key].reachable);
		assert_eq!(results[&target(1).public_key].latency, Some(Duration::from_millis(2)));
		assert!(!results[&target(2).public_key].reachable);
		assert_eq!(results[&target(2).public_key].latency, None);
	}

	#[tokio::test]
	async fn probe_family_records_health() {
		let a = peer("2.2.2.2:1", "192.168.1.2:1", "100.64.0.2");
		let b = peer("3.3.3.3:1", "192.168.1.3:1", "100.64.0.3");
		let cache = cache_with(vec![a.clone(), b.clone()]).await;
		let fake = Arc::new(FakeProbe::default());
		fake.down.lock().unwrap().insert(IpAddr::from([100, 64, 0, 3]));
		let prober = Prober::new(fake);

		let results = prober.probe_family(&cache, IpFamily::V4, false).await;

		assert_eq!(results.len(), 2);
		assert!(cache.health(&a.public_key).await.unwrap().reachable);
		assert!(!cache.health(&b.public_key).await.unwrap().reachable);
	}

	#[tokio::test]
	async fn relay_does_not_probe() {
		let a = peer("2.2.2.2:1", "192.168.1.2:1", "100.64.0.2");
		let cache = cache_with(vec![a.clone()]).await;
		let fake = Arc::new(FakeProbe::default());
		let prober = Prober::new(fake.clone());

		assert!(prober.probe_family(&cache, IpFamily::V4, true).await.is_empty());
		assert!(prober.probe_cycle(&cache, true).await.is_empty());
		assert_eq!(fake.calls.load(Ordering::SeqCst), 0);
		assert!(cache.health(&a.public_key).await.is_none());
	}

	#[tokio::test]
	async fn cycle_prefers_any_reachable_family() {
		let mut a = peer("2.2.2.2:1", "192.168.1.2:1", "100.64.0.2");
		a.tunnel_ipv6 = Some("fd00::2".parse().unwrap());
		let cache = cache_with(vec![a.clone()]).await;
		let fake = Arc::new(FakeProbe::default());
		fake.down.lock().unwrap().insert("fd00::2".parse().unwrap());
		let prober = Prober::new(fake);

		let results = prober.probe_cycle(&cache, false).await;

		assert!(results[&a.public_key].reachable);
		assert!(cache.health(&a.public_key).await.unwrap().reachable);
	}

	/// Every address times out after a long wait.
	struct SilentProbe;

	#[async_trait]
	impl ReachabilityProbe for SilentProbe {
		async fn probe(&self, _addr: IpAddr, timeout: Duration) -> Result<Duration, ProbeError> {
			tokio::time::sleep(timeout).await;
			Err(ProbeError::Timeout)
		}
	}

	#[tokio::test]
	async fn shutdown_interrupts_a_running_cycle() {
		let records: Vec<PeerRecord> = (2..42)
			.map(|i| peer("2.2.2.2:1", "192.168.1.2:1", &format!("100.64.0.{i}")))
			.collect();
		let cache = Arc::new(cache_with(records).await);
		let local = LocalState::new(crate::selector::tests::local_state("1.1.1.1:1"));
		let prober = Prober::new(Arc::new(SilentProbe))
			.with_batch_size(10)
			.with_timeout(Duration::from_millis(1200));
		let (tx, rx) = watch::channel(false);

		let handle = tokio::spawn(async move {
			prober.run(cache, local, Duration::from_millis(10), rx).await;
		});
		tokio::time::sleep(Duration::from_millis(50)).await;
		tx.send(true).unwrap();

		tokio::time::timeout(Duration::from_millis(500), handle)
			.await
			.expect("prober did not stop promptly")
			.unwrap();
	}

	#[tokio::test]
	async fn run_stops_on_shutdown() {
		let cache = Arc::new(DeviceCache::new());
		let local = LocalState::new(crate::selector::tests::local_state("1.1.1.1:1"));
		let prober = Prober::new(Arc::new(FakeProbe::default()));
		let (tx, rx) = watch::channel(false);

		let handle = tokio::spawn(async move {
			prober.run(cache, local, Duration::from_millis(10), rx).await;
		});
		tokio::time::sleep(Duration::from_millis(30)).await;
		tx.send(true).unwrap();

		handle.await.unwrap();
	}
}
