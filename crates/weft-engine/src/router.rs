// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Cryptokey routing table for the userspace tunnel: allowed-IP prefix to
//! peer, longest prefix wins.

use ipnet::IpNet;
use std::net::IpAddr;
use tracing::{debug, instrument, warn};
use weft_common::WgPublicKey;

#[derive(Debug, Default)]
pub struct Router {
	routes: Vec<(IpNet, WgPublicKey)>,
}

impl Router {
	pub fn new() -> Self {
		Self::default()
	}

	#[instrument(skip(self), fields(%prefix, peer = %peer))]
	pub fn add_route(&mut self, prefix: IpNet, peer: WgPublicKey) {
		let prefix = prefix.trunc();
		if let Some(slot) = self.routes.iter_mut().find(|(p, _)| *p == prefix) {
			if slot.1 == peer {
				return;
			}
			warn!(old_peer = %slot.1, "prefix reassigned to different peer");
			slot.1 = peer;
			return;
		}
		self.routes.push((prefix, peer));
		debug!("added route");
	}

	/// Makes `prefixes` the exact set routed to `peer`.
	pub fn set_routes(&mut self, peer: WgPublicKey, prefixes: &[IpNet]) {
		self.remove_peer(&peer);
		for prefix in prefixes {
			self.add_route(*prefix, peer);
		}
	}

	#[instrument(skip(self), fields(peer = %peer))]
	pub fn remove_peer(&mut self, peer: &WgPublicKey) {
		let before = self.routes.len();
		self.routes.retain(|(_, p)| p != peer);
		debug!(count = before - self.routes.len(), "removed routes for peer");
	}

	pub fn route(&self, dst: IpAddr) -> Option<&WgPublicKey> {
		self
			.routes
			.iter()
			.filter(|(prefix, _)| prefix.contains(&dst))
			.max_by_key(|(prefix, _)| prefix.prefix_len())
			.map(|(_, peer)| peer)
	}

	pub fn route_count(&self) -> usize {
		self.routes.len()
	}

	pub fn routes_for_peer(&self, peer: &WgPublicKey) -> Vec<IpNet> {
		self
			.routes
			.iter()
			.filter(|(_, p)| p == peer)
			.map(|(prefix, _)| *prefix)
			.collect()
	}
}
