// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Reconciliation loop.
//!
//! Each tick fetches the full peer listing, and when anything that feeds
//! path selection moved (the listing, relay health, local NAT state, or a
//! failed apply waiting for retry) recomputes every peer, swaps the device
//! cache and pushes only the tunnel-peer configs that differ from what is
//! already applied.

use crate::applier::{Applier, ApplyReport};
use crate::cache::{DeviceCache, DeviceCacheEntry};
use crate::error::{EngineError, Result, SourceError};
use crate::local::LocalState;
use crate::selector::{select_path, PeerPath, TunnelPeerConfig};
use crate::shutdown::{shutdown_requested, until_shutdown};
use async_trait::async_trait;
use ipnet::IpNet;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, trace, warn};
use weft_common::{dedup_prefixes, PeerId, PeerRecord, WgPublicKey};

/// Authoritative peer listing for the local node's organization.
#[async_trait]
pub trait PeerSource: Send + Sync {
	async fn fetch_listing(&self) -> std::result::Result<Vec<PeerRecord>, SourceError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReconcileState {
	Initializing,
	Steady,
	Reauthenticating,
}

impl fmt::Display for ReconcileState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			ReconcileState::Initializing => f.write_str("initializing"),
			ReconcileState::Steady => f.write_str("steady"),
			ReconcileState::Reauthenticating => f.write_str("reauthenticating"),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
	/// The listing fetch failed; nothing was touched.
	Skipped,
	Unchanged,
	Applied,
}

#[derive(Debug)]
pub struct ReconcileReport {
	pub outcome: TickOutcome,
	pub peers: usize,
	pub unreachable: usize,
	pub converging: usize,
	pub apply: ApplyReport,
}

impl ReconcileReport {
	fn without_changes(outcome: TickOutcome) -> Self {
		Self {
			outcome,
			peers: 0,
			unreachable: 0,
			converging: 0,
			apply: ApplyReport::default(),
		}
	}
}

pub struct Reconciler {
	source: Arc<dyn PeerSource>,
	cache: Arc<DeviceCache>,
	local: LocalState,
	applier: Applier,
	state: ReconcileState,
	steady_once: bool,
	applied: HashMap<WgPublicKey, TunnelPeerConfig>,
	/// Keys whose last apply failed; the tunnel state for them is unknown.
	dirty: HashSet<WgPublicKey>,
	last_relay_healthy: Option<bool>,
	last_generation: Option<u64>,
}

impl Reconciler {
	pub fn new(
		source: Arc<dyn PeerSource>,
		cache: Arc<DeviceCache>,
		local: LocalState,
		applier: Applier,
	) -> Self {
		Self {
			source,
			cache,
			local,
			applier,
			state: ReconcileState::Initializing,
			steady_once: false,
			applied: HashMap::new(),
			dirty: HashSet::new(),
			last_relay_healthy: None,
			last_generation: None,
		}
	}

	pub fn state(&self) -> ReconcileState {
		self.state
	}

	pub fn set_reauthenticating(&mut self) {
		warn!(from = %self.state, "reconciler waiting for reauthentication");
		self.state = ReconcileState::Reauthenticating;
	}

	/// Leaves `Reauthenticating` after the session was restored.
	pub fn resume(&mut self) {
		self.state = if self.steady_once {
			ReconcileState::Steady
		} else {
			ReconcileState::Initializing
		};
		info!(state = %self.state, "reconciler resumed");
	}

	pub fn applied(&self) -> &HashMap<WgPublicKey, TunnelPeerConfig> {
		&self.applied
	}

	#[instrument(skip(self), fields(state = %self.state))]
	pub async fn tick(&mut self) -> Result<ReconcileReport> {
		let listing = match self.source.fetch_listing().await {
			Ok(listing) => listing,
			Err(SourceError::Transient(reason)) => {
				warn!(%reason, "peer listing unavailable, skipping tick");
				return Ok(ReconcileReport::without_changes(TickOutcome::Skipped));
			}
			Err(e @ SourceError::Unauthorized(_)) => {
				self.set_reauthenticating();
				return Err(EngineError::from(e));
			}
		};

		let local = self.local.snapshot().await;
		let mut peers: Vec<PeerRecord> = listing.into_iter().filter(|p| !local.is_self(p)).collect();
		peers.sort_by_key(|p| p.id);
		peers.dedup_by_key(|p| p.id);

		let relay_healthy = self.cache.relay_healthy_among(peers.iter()).await;
		let listing_changed = self.log_listing_diff(&peers).await;

		let must_run = self.state != ReconcileState::Steady
			|| listing_changed
			|| !self.dirty.is_empty()
			|| self.last_relay_healthy != Some(relay_healthy)
			|| self.last_generation != Some(local.generation);
		if !must_run {
			trace!("nothing changed");
			return Ok(ReconcileReport::without_changes(TickOutcome::Unchanged));
		}

		let paths: Vec<(PeerRecord, PeerPath)> = peers
			.into_iter()
			.map(|peer| {
				let path = select_path(&local, &peer, relay_healthy);
				(peer, path)
			})
			.collect();

		let relayed_children: Vec<IpNet> = paths
			.iter()
			.filter_map(|(_, path)| match path {
				PeerPath::ViaRelay { child_prefixes } => Some(child_prefixes.iter().copied()),
				_ => None,
			})
			.flatten()
			.collect();

		let mut desired: HashMap<WgPublicKey, TunnelPeerConfig> = HashMap::new();
		let mut entries: HashMap<PeerId, DeviceCacheEntry> = HashMap::new();
		let mut unreachable = 0;
		let mut converging = 0;

		for (peer, path) in &paths {
			let config = match path {
				PeerPath::Direct(config) => Some(config.clone()),
				PeerPath::Converging { method } => {
					converging += 1;
					debug!(peer = %peer.public_key, %method, "endpoint not propagated yet");
					self.applied.get(&peer.public_key).cloned()
				}
				PeerPath::ViaRelay { .. } => None,
				PeerPath::Unreachable => {
					unreachable += 1;
					info!(peer = %peer.public_key, hostname = %peer.hostname, "peer unreachable, no healthy relay");
					None
				}
			};

			let config = config.map(|mut config| {
				if peer.relay && !relayed_children.is_empty() {
					config.allowed_ips = dedup_prefixes(
						config
							.allowed_ips
							.iter()
							.chain(relayed_children.iter())
							.copied(),
					);
				}
				config
			});

			let (endpoint, allowed_ips) = match (&config, path) {
				(Some(config), _) => (Some(config.endpoint), config.allowed_ips.clone()),
				(None, PeerPath::ViaRelay { child_prefixes }) => (
					None,
					dedup_prefixes(peer.allowed_ips.iter().chain(child_prefixes.iter()).copied()),
				),
				(None, _) => (None, Vec::new()),
			};

			// A converging peer keeps its old config on the tunnel; report that.
			let method = config.as_ref().map(|c| c.method).or_else(|| path.method());
			entries.insert(
				peer.id,
				DeviceCacheEntry {
					record: peer.clone(),
					method,
					endpoint,
					allowed_ips,
				},
			);
			if let Some(config) = config {
				desired.insert(config.public_key, config);
			}
		}

		let peer_count = entries.len();
		self.cache.replace(entries).await;

		let mut added: Vec<TunnelPeerConfig> = desired
			.values()
			.filter(|c| self.dirty.contains(&c.public_key) || self.applied.get(&c.public_key) != Some(*c))
			.cloned()
			.collect();
		added.sort_by_key(|c| c.public_key);
		let mut removed: Vec<WgPublicKey> = self
			.applied
			.keys()
			.chain(self.dirty.iter())
			.filter(|k| !desired.contains_key(*k))
			.copied()
			.collect();
		removed.sort();
		removed.dedup();

		let report = self.applier.apply(&added, &removed).await;

		for config in &added {
			if report.failed(&config.public_key) {
				self.applied.remove(&config.public_key);
				self.dirty.insert(config.public_key);
			} else {
				self.applied.insert(config.public_key, config.clone());
				self.dirty.remove(&config.public_key);
			}
		}
		for key in &removed {
			if report.failed(key) {
				self.dirty.insert(*key);
			} else {
				self.applied.remove(key);
				self.dirty.remove(key);
			}
		}

		self.last_relay_healthy = Some(relay_healthy);
		self.last_generation = Some(local.generation);
		if self.state != ReconcileState::Steady {
			info!(peers = peer_count, "initial peer listing applied");
		}
		self.state = ReconcileState::Steady;
		self.steady_once = true;

		info!(
			peers = peer_count,
			added = added.len(),
			removed = removed.len(),
			failed = report.failures.len(),
			unreachable,
			converging,
			"reconciliation complete"
		);

		Ok(ReconcileReport {
			outcome: TickOutcome::Applied,
			peers: peer_count,
			unreachable,
			converging,
			apply: report,
		})
	}

	/// Compares the listing against the cached records and logs the
	/// difference. Returns whether anything differs.
	async fn log_listing_diff(&self, peers: &[PeerRecord]) -> bool {
		let snapshot = self.cache.snapshot().await;
		let mut added = 0usize;
		let mut changed = 0usize;
		for peer in peers {
			match snapshot.get(&peer.id) {
				None => added += 1,
				Some(entry) if entry.record != *peer => changed += 1,
				Some(_) => {}
			}
		}
		let removed = snapshot
			.keys()
			.filter(|id| peers.binary_search_by_key(*id, |p| p.id).is_err())
			.count();

		if added + changed + removed > 0 {
			debug!(added, changed, removed, "peer listing changed");
			true
		} else {
			false
		}
	}

	/// Ticks every `interval` until shutdown. Returns an error only when the
	/// session is no longer authorized.
	pub async fn run(
		&mut self,
		interval: Duration,
		mut shutdown_rx: watch::Receiver<bool>,
	) -> Result<()> {
		let mut ticker = tokio::time::interval(interval);
		ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

		loop {
			tokio::select! {
				biased;

				stop = shutdown_requested(&mut shutdown_rx) => {
					if stop {
						info!("reconciler shutting down");
						return Ok(());
					}
				}

				_ = ticker.tick() => {
					match until_shutdown(&mut shutdown_rx, self.tick()).await {
						None => {
							info!("reconciler shutting down mid-tick");
							return Ok(());
						}
						Some(Ok(_)) => {}
						Some(Err(e)) if e.is_unauthorized() => return Err(e),
						Some(Err(e)) => error!(error = %e, "reconciliation failed"),
					}
				}
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::applier::tests::{Call, RecordingBackend};
	use crate::cache::HealthResult;
	use crate::local::LocalNodeState;
	use crate::selector::tests::peer;
	use crate::selector::PeeringMethod;
	use std::sync::Mutex;
	use weft_common::WgKeyPair;

	#[derive(Default)]
	struct MemorySource {
		listing: Mutex<Vec<PeerRecord>>,
		fail_next: Mutex<Option<SourceError>>,
	}

	impl MemorySource {
		fn set(&self, listing: Vec<PeerRecord>) {
			*self.listing.lock().unwrap() = listing;
		}

		fn fail_once(&self, e: SourceError) {
			*self.fail_next.lock().unwrap() = Some(e);
		}
	}

	#[async_trait]
	impl PeerSource for MemorySource {
		async fn fetch_listing(&self) -> std::result::Result<Vec<PeerRecord>, SourceError> {
			if let Some(e) = self.fail_next.lock().unwrap().take() {
				return Err(e);
			}
			Ok(self.listing.lock().unwrap().clone())
		}
	}

	struct Harness {
		source: Arc<MemorySource>,
		backend: Arc<RecordingBackend>,
		cache: Arc<DeviceCache>,
		local: LocalState,
		reconciler: Reconciler,
	}

	fn harness(local: LocalNodeState) -> Harness {
		let source = Arc::new(MemorySource::default());
		let backend = Arc::new(RecordingBackend::default());
		let cache = Arc::new(DeviceCache::new());
		let local = LocalState::new(local);
		let reconciler = Reconciler::new(
			source.clone(),
			cache.clone(),
			local.clone(),
			Applier::new(backend.clone()),
		);
		Harness {
			source,
			backend,
			cache,
			local,
			reconciler,
		}
	}

	fn local() -> LocalNodeState {
		LocalNodeState::new(*WgKeyPair::generate().public_key(), "1.1.1.1:51820".parse().unwrap())
			.with_relay_supernet(vec!["100.64.0.0/10".parse().unwrap()])
	}

	fn configures(calls: &[Call]) -> Vec<WgPublicKey> {
		calls
			.iter()
			.filter_map(|c| match c {
				Call::Configure(k) => Some(*k),
				_ => None,
			})
			.collect()
	}

	#[tokio::test]
	async fn first_run_applies_every_peer() {
		let mut h = harness(local());
		let a = peer("2.2.2.2:1", "192.168.1.2:1", "100.64.0.2");
		let b = peer("3.3.3.3:1", "192.168.1.3:1", "100.64.0.3");
		h.source.set(vec![a.clone(), b.clone()]);

		assert_eq!(h.reconciler.state(), ReconcileState::Initializing);
		let report = h.reconciler.tick().await.unwrap();

		assert_eq!(report.outcome, TickOutcome::Applied);
		assert_eq!(report.apply.configured.len(), 2);
		assert_eq!(h.reconciler.state(), ReconcileState::Steady);
		assert_eq!(h.cache.len().await, 2);
	}

	#[tokio::test]
	async fn first_run_with_empty_listing_becomes_steady() {
		let mut h = harness(local());

		let report = h.reconciler.tick().await.unwrap();

		assert_eq!(report.outcome, TickOutcome::Applied);
		assert_eq!(h.reconciler.state(), ReconcileState::Steady);
		assert!(h.backend.take_calls().is_empty());
	}

	#[tokio::test]
	async fn p10_unchanged_listing_makes_no_backend_calls() {
		let mut h = harness(local());
		h.source.set(vec![
			peer("2.2.2.2:1", "192.168.1.2:1", "100.64.0.2"),
			peer("3.3.3.3:1", "192.168.1.3:1", "100.64.0.3"),
		]);
		h.reconciler.tick().await.unwrap();
		h.backend.take_calls();

		let report = h.reconciler.tick().await.unwrap();

		assert_eq!(report.outcome, TickOutcome::Unchanged);
		assert!(h.backend.take_calls().is_empty());
	}

	#[tokio::test]
	async fn p11_failed_peer_is_retried_next_tick() {
		let mut h = harness(local());
		let a = peer("2.2.2.2:1", "192.168.1.2:1", "100.64.0.2");
		let b = peer("3.3.3.3:1", "192.168.1.3:1", "100.64.0.3");
		let c = peer("4.4.4.4:1", "192.168.1.4:1", "100.64.0.4");
		h.source.set(vec![a.clone(), b.clone(), c.clone()]);
		h.backend.fail_for(b.public_key);

		let first = h.reconciler.tick().await.unwrap();
		assert!(first.apply.failed(&b.public_key));
		assert_eq!(first.apply.configured.len(), 2);
		assert!(h.reconciler.applied().contains_key(&a.public_key));
		assert!(h.reconciler.applied().contains_key(&c.public_key));
		assert!(!h.reconciler.applied().contains_key(&b.public_key));
		h.backend.take_calls();

		h.backend.heal(&b.public_key);
		let second = h.reconciler.tick().await.unwrap();

		assert!(second.apply.is_clean());
		assert_eq!(configures(&h.backend.take_calls()), vec![b.public_key]);
		assert!(h.reconciler.applied().contains_key(&b.public_key));

		let third = h.reconciler.tick().await.unwrap();
		assert_eq!(third.outcome, TickOutcome::Unchanged);
	}

	#[tokio::test]
	async fn p12_removed_peer_is_torn_down_once() {
		let mut h = harness(local());
		let a = peer("2.2.2.2:1", "192.168.1.2:1", "100.64.0.2");
		let b = peer("3.3.3.3:1", "192.168.1.3:1", "100.64.0.3");
		h.source.set(vec![a.clone(), b.clone()]);
		h.reconciler.tick().await.unwrap();
		h.backend.take_calls();

		h.source.set(vec![a.clone()]);
		h.reconciler.tick().await.unwrap();

		assert_eq!(
			h.backend.take_calls(),
			vec![
				Call::Remove(b.public_key),
				Call::DelRoute("100.64.0.3/32".parse().unwrap()),
			]
		);
		assert_eq!(h.cache.len().await, 1);

		h.reconciler.tick().await.unwrap();
		assert!(h.backend.take_calls().is_empty());
	}

	#[tokio::test]
	async fn changed_endpoint_reapplies_only_that_peer() {
		let mut h = harness(local());
		let a = peer("2.2.2.2:1", "192.168.1.2:1", "100.64.0.2");
		let mut b = peer("3.3.3.3:1", "192.168.1.3:1", "100.64.0.3");
		h.source.set(vec![a.clone(), b.clone()]);
		h.reconciler.tick().await.unwrap();
		h.backend.take_calls();

		b.endpoints[1].address = "3.3.3.3:2".to_string();
		h.source.set(vec![a, b.clone()]);
		h.reconciler.tick().await.unwrap();

		assert_eq!(configures(&h.backend.take_calls()), vec![b.public_key]);
	}

	#[tokio::test]
	async fn local_node_is_excluded_from_cache() {
		let state = local();
		let mut me = peer("1.1.1.1:51820", "192.168.1.1:51820", "100.64.0.1");
		me.public_key = state.public_key;
		let mut h = harness(state);
		let a = peer("2.2.2.2:1", "192.168.1.2:1", "100.64.0.2");
		h.source.set(vec![me.clone(), a]);

		h.reconciler.tick().await.unwrap();

		assert_eq!(h.cache.len().await, 1);
		assert!(!h.reconciler.applied().contains_key(&me.public_key));
	}

	#[tokio::test]
	async fn transient_fetch_failure_skips_tick() {
		let mut h = harness(local());
		let a = peer("2.2.2.2:1", "192.168.1.2:1", "100.64.0.2");
		h.source.set(vec![a]);
		h.reconciler.tick().await.unwrap();
		h.backend.take_calls();

		h.source.fail_once(SourceError::Transient("connection reset".into()));
		let report = h.reconciler.tick().await.unwrap();

		assert_eq!(report.outcome, TickOutcome::Skipped);
		assert_eq!(h.cache.len().await, 1);
		assert!(h.backend.take_calls().is_empty());
	}

	#[tokio::test]
	async fn unauthorized_moves_to_reauthenticating() {
		let mut h = harness(local());
		h.source.fail_once(SourceError::Unauthorized("token expired".into()));

		let err = h.reconciler.tick().await.unwrap_err();

		assert!(err.is_unauthorized());
		assert_eq!(h.reconciler.state(), ReconcileState::Reauthenticating);

		h.reconciler.resume();
		assert_eq!(h.reconciler.state(), ReconcileState::Initializing);
		h.reconciler.tick().await.unwrap();
		assert_eq!(h.reconciler.state(), ReconcileState::Steady);
	}

	#[tokio::test]
	async fn converging_peer_keeps_previous_config() {
		let mut h = harness(local());
		let mut a = peer("2.2.2.2:1", "192.168.1.2:1", "100.64.0.2");
		h.source.set(vec![a.clone()]);
		h.reconciler.tick().await.unwrap();
		h.backend.take_calls();

		a.endpoints[1].address = "2.2.2.2".to_string();
		h.source.set(vec![a.clone()]);
		let report = h.reconciler.tick().await.unwrap();

		assert_eq!(report.converging, 1);
		assert!(h.backend.take_calls().is_empty());
		assert!(h.reconciler.applied().contains_key(&a.public_key));
	}

	#[tokio::test]
	async fn relay_health_flip_recomputes_unchanged_listing() {
		let mut h = harness(local().with_symmetric_nat(true));
		let mut relay = peer("5.5.5.5:1", "192.168.5.1:1", "100.64.0.1");
		relay.relay = true;
		let mut behind = peer("2.2.2.2:1", "192.168.1.2:1", "100.64.0.2");
		behind.advertise_cidrs = vec!["10.20.0.0/16".parse().unwrap()];
		h.source.set(vec![relay.clone(), behind.clone()]);

		h.reconciler.tick().await.unwrap();
		let relay_cfg = &h.reconciler.applied()[&relay.public_key];
		assert_eq!(relay_cfg.method, PeeringMethod::RelayPeer);
		assert!(relay_cfg
			.allowed_ips
			.contains(&"10.20.0.0/16".parse().unwrap()));
		assert!(!h.reconciler.applied().contains_key(&behind.public_key));
		let view = h.cache.list().await;
		assert!(view
			.iter()
			.any(|p| p.public_key == behind.public_key && p.method == Some(PeeringMethod::ViaRelay)));

		let mut results = HashMap::new();
		results.insert(relay.public_key, HealthResult::unreachable());
		h.cache.record_health(&results).await;
		h.backend.take_calls();

		let report = h.reconciler.tick().await.unwrap();
		assert_eq!(report.outcome, TickOutcome::Applied);
		assert_eq!(report.unreachable, 1);
		// The relay config drops the relayed child prefix.
		assert_eq!(configures(&h.backend.take_calls()), vec![relay.public_key]);
	}

	#[tokio::test]
	async fn local_state_change_recomputes_paths() {
		let mut h = harness(local());
		let a = peer("2.2.2.2:1", "192.168.1.2:1", "100.64.0.2");
		h.source.set(vec![a.clone()]);
		h.reconciler.tick().await.unwrap();
		assert_eq!(
			h.reconciler.applied()[&a.public_key].method,
			PeeringMethod::Reflexive
		);

		h.local
			.update(|s| s.reflexive = "2.2.2.2:40000".parse().unwrap())
			.await;
		h.reconciler.tick().await.unwrap();

		assert_eq!(
			h.reconciler.applied()[&a.public_key].method,
			PeeringMethod::DirectLocal
		);
	}

	#[tokio::test]
	async fn converging_peer_reports_the_config_still_applied() {
		let mut h = harness(local());
		let a = peer("2.2.2.2:1", "", "100.64.0.2");
		h.source.set(vec![a.clone()]);
		h.reconciler.tick().await.unwrap();

		// Same public address now, but no LAN endpoint to switch to.
		h.local
			.update(|s| s.reflexive = "2.2.2.2:40000".parse().unwrap())
			.await;
		h.reconciler.tick().await.unwrap();

		let views = h.cache.list().await;
		assert_eq!(views.len(), 1);
		assert_eq!(views[0].method, Some(PeeringMethod::Reflexive));
		assert_eq!(views[0].endpoint, Some("2.2.2.2:1".parse().unwrap()));
		assert_eq!(
			h.reconciler.applied()[&a.public_key].method,
			PeeringMethod::Reflexive
		);
	}

	#[tokio::test]
	async fn converging_peer_without_config_reports_intended_method() {
		let mut h = harness(local());
		h.source.set(vec![peer("2.2.2.2", "192.168.1.2:1", "100.64.0.2")]);

		h.reconciler.tick().await.unwrap();

		let views = h.cache.list().await;
		assert_eq!(views[0].method, Some(PeeringMethod::Reflexive));
		assert_eq!(views[0].endpoint, None);
	}

	/// Never answers, like a coordinator that stopped responding mid-request.
	struct StalledSource;

	#[async_trait]
	impl PeerSource for StalledSource {
		async fn fetch_listing(&self) -> std::result::Result<Vec<PeerRecord>, SourceError> {
			std::future::pending().await
		}
	}

	#[tokio::test]
	async fn shutdown_interrupts_a_stalled_tick() {
		let mut reconciler = Reconciler::new(
			Arc::new(StalledSource),
			Arc::new(DeviceCache::new()),
			LocalState::new(local()),
			Applier::new(Arc::new(RecordingBackend::default())),
		);
		let (tx, rx) = watch::channel(false);

		let handle = tokio::spawn(async move { reconciler.run(Duration::from_millis(10), rx).await });
		tokio::time::sleep(Duration::from_millis(50)).await;
		tx.send(true).unwrap();

		let result = tokio::time::timeout(Duration::from_secs(1), handle)
			.await
			.expect("reconciler did not stop promptly")
			.unwrap();
		assert!(result.is_ok());
	}

	#[tokio::test]
	async fn run_stops_on_shutdown() {
		let mut h = harness(local());
		let (tx, rx) = watch::channel(false);

		let handle = tokio::spawn(async move {
			h.reconciler.run(Duration::from_millis(10), rx).await
		});
		tokio::time::sleep(Duration::from_millis(30)).await;
		tx.send(true).unwrap();

		assert!(handle.await.unwrap().is_ok());
	}
}
