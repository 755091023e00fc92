// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use ipnet::IpNet;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;
use weft_common::{PeerId, PeerRecord, WgPublicKey};

/// This node as the path selector sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalNodeState {
	/// Set once the coordinator has registered the device.
	pub id: Option<PeerId>,
	pub public_key: WgPublicKey,
	pub reflexive: SocketAddr,
	pub relay: bool,
	pub symmetric_nat: bool,
	/// Never dial ordinary peers directly; everything goes through the relay.
	pub relay_only: bool,
	/// Organization-wide prefixes routed through the relay.
	pub relay_supernet: Vec<IpNet>,
	/// Bumped on every change so the reconciler knows to recompute paths.
	pub generation: u64,
}

impl LocalNodeState {
	pub fn new(public_key: WgPublicKey, reflexive: SocketAddr) -> Self {
		Self {
			id: None,
			public_key,
			reflexive,
			relay: false,
			symmetric_nat: false,
			relay_only: false,
			relay_supernet: Vec::new(),
			generation: 0,
		}
	}

	pub fn with_relay(mut self, relay: bool) -> Self {
		self.relay = relay;
		self
	}

	pub fn with_symmetric_nat(mut self, symmetric_nat: bool) -> Self {
		self.symmetric_nat = symmetric_nat;
		self
	}

	pub fn with_relay_only(mut self, relay_only: bool) -> Self {
		self.relay_only = relay_only;
		self
	}

	pub fn with_relay_supernet(mut self, supernet: Vec<IpNet>) -> Self {
		self.relay_supernet = supernet;
		self
	}

	pub fn with_id(mut self, id: PeerId) -> Self {
		self.id = Some(id);
		self
	}

	/// The listing includes this node; it is matched by id or key.
	pub fn is_self(&self, record: &PeerRecord) -> bool {
		self.id == Some(record.id) || record.public_key == self.public_key
	}
}

/// Shared handle to [`LocalNodeState`]. Readers take a copy; writers go
/// through [`LocalState::update`] which bumps the generation.
#[derive(Debug, Clone)]
pub struct LocalState {
	inner: Arc<RwLock<LocalNodeState>>,
}

impl LocalState {
	pub fn new(state: LocalNodeState) -> Self {
		Self {
			inner: Arc::new(RwLock::new(state)),
		}
	}

	pub async fn snapshot(&self) -> LocalNodeState {
		self.inner.read().await.clone()
	}

	pub async fn update<F>(&self, f: F) -> u64
	where
		F: FnOnce(&mut LocalNodeState),
	{
		let mut guard = self.inner.write().await;
		f(&mut guard);
		guard.generation += 1;
		debug!(generation = guard.generation, "local node state updated");
		guard.generation
	}
}
