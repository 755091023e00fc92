// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Device cache.
//!
//! The record/method snapshot is replaced wholesale by the reconciler and
//! handed out as an `Arc`, so readers never see a half-written map. Health
//! lives in a separate table keyed by public key: the prober writes it
//! without touching the snapshot, and a snapshot replace never drops it.

use crate::selector::PeeringMethod;
use chrono::{DateTime, Utc};
use ipnet::IpNet;
use serde::Serialize;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;
use weft_common::{IpFamily, PeerId, PeerRecord, WgPublicKey};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCacheEntry {
	pub record: PeerRecord,
	/// `None` when the peer is currently unreachable.
	pub method: Option<PeeringMethod>,
	/// Endpoint the tunnel was pointed at, if any.
	pub endpoint: Option<SocketAddr>,
	pub allowed_ips: Vec<IpNet>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HealthResult {
	pub reachable: bool,
	#[serde(with = "latency_ms")]
	pub latency: Option<Duration>,
	pub checked_at: DateTime<Utc>,
}

impl HealthResult {
	pub fn reachable(latency: Duration) -> Self {
		Self {
			reachable: true,
			latency: Some(latency),
			checked_at: Utc::now(),
		}
	}

	pub fn unreachable() -> Self {
		Self {
			reachable: false,
			latency: None,
			checked_at: Utc::now(),
		}
	}
}

mod latency_ms {
	use serde::Serializer;
	use std::time::Duration;

	pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
		match value {
			Some(d) => s.serialize_some(&(d.as_micros() as f64 / 1000.0)),
			None => s.serialize_none(),
		}
	}
}

/// One peer as shown to status readers: cache entry merged with health.
#[derive(Debug, Clone, Serialize)]
pub struct PeerView {
	pub id: PeerId,
	pub hostname: String,
	pub public_key: WgPublicKey,
	pub method: Option<PeeringMethod>,
	pub healthy: Option<bool>,
	pub latency_ms: Option<f64>,
	pub endpoint: Option<SocketAddr>,
	pub allowed_ips: Vec<IpNet>,
	pub relay: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeTarget {
	pub public_key: WgPublicKey,
	pub address: IpAddr,
}

pub type Snapshot = Arc<HashMap<PeerId, DeviceCacheEntry>>;

#[derive(Debug, Default)]
pub struct DeviceCache {
	snapshot: RwLock<Snapshot>,
	health: RwLock<HashMap<WgPublicKey, HealthResult>>,
}

impl DeviceCache {
	pub fn new() -> Self {
		Self::default()
	}

	pub async fn snapshot(&self) -> Snapshot {
		Arc::clone(&*self.snapshot.read().await)
	}

	/// Swaps in a new snapshot. Health for keys that left the listing is
	/// dropped; everyone else keeps theirs.
	pub async fn replace(&self, entries: HashMap<PeerId, DeviceCacheEntry>) {
		let next = Arc::new(entries);
		{
			let mut health = self.health.write().await;
			health.retain(|key, _| next.values().any(|e| e.record.public_key == *key));
		}
		let count = next.len();
		*self.snapshot.write().await = next;
		debug!(peers = count, "device cache replaced");
	}

	/// Records probe results for peers still in the cache. Last writer wins.
	pub async fn record_health(&self, results: &HashMap<WgPublicKey, HealthResult>) {
		let snapshot = self.snapshot().await;
		let mut health = self.health.write().await;
		for (key, result) in results {
			if snapshot.values().any(|e| e.record.public_key == *key) {
				health.insert(*key, *result);
			}
		}
	}

	pub async fn health(&self, key: &WgPublicKey) -> Option<HealthResult> {
		self.health.read().await.get(key).copied()
	}

	/// A relay in `records` that has not failed its last probe. A relay that
	/// was never probed counts as healthy.
	pub async fn relay_healthy_among<'a>(
		&self,
		records: impl IntoIterator<Item = &'a PeerRecord>,
	) -> bool {
		let health = self.health.read().await;
		records
			.into_iter()
			.filter(|r| r.relay)
			.any(|r| health.get(&r.public_key).map_or(true, |h| h.reachable))
	}

	pub async fn healthy_relay(&self) -> bool {
		let snapshot = self.snapshot().await;
		self.relay_healthy_among(snapshot.values().map(|e| &e.record))
			.await
	}

	pub async fn list(&self) -> Vec<PeerView> {
		let snapshot = self.snapshot().await;
		let health = self.health.read().await;
		let mut peers: Vec<PeerView> = snapshot
			.values()
			.map(|entry| {
				let h = health.get(&entry.record.public_key);
				PeerView {
					id: entry.record.id,
					hostname: entry.record.hostname.clone(),
					public_key: entry.record.public_key,
					method: entry.method,
					healthy: h.map(|h| h.reachable),
					latency_ms: h
						.and_then(|h| h.latency)
						.map(|d| d.as_micros() as f64 / 1000.0),
					endpoint: entry.endpoint,
					allowed_ips: entry.allowed_ips.clone(),
					relay: entry.record.relay,
				}
			})
			.collect();
		peers.sort_by(|a, b| a.hostname.cmp(&b.hostname).then(a.public_key.cmp(&b.public_key)));
		peers
	}

	/// Tunnel addresses of every cached peer in `family`.
	pub async fn probe_targets(&self, family: IpFamily) -> Vec<ProbeTarget> {
		let snapshot = self.snapshot().await;
		let mut targets: Vec<ProbeTarget> = snapshot
			.values()
			.filter_map(|e| {
				let address = match family {
					IpFamily::V4 => e.record.tunnel_ipv4.map(IpAddr::V4),
					IpFamily::V6 => e.record.tunnel_ipv6.map(IpAddr::V6),
				}?;
				Some(ProbeTarget {
					public_key: e.record.public_key,
					address,
				})
			})
			.collect();
		targets.sort_by_key(|t| t.address);
		targets
	}

	pub async fn len(&self) -> usize {
		self.snapshot.read().await.len()
	}

	pub async fn is_empty(&self) -> bool {
		self.len().await == 0
	}
}
