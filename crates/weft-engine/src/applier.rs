// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Pushes tunnel-peer additions and removals to the backend.
//!
//! Every peer is handled on its own: a failure is recorded in the
//! [`ApplyReport`] and the pass moves on. Routes are tracked per peer so a
//! removal only deletes what this applier installed, and a prefix shared by
//! two peers stays until the last owner is gone.

use crate::backend::TunnelBackend;
use crate::error::BackendError;
use crate::selector::TunnelPeerConfig;
use ipnet::IpNet;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use weft_common::{is_default_route, WgPublicKey};

#[derive(Debug, Default)]
pub struct ApplyReport {
	pub configured: Vec<WgPublicKey>,
	pub removed: Vec<WgPublicKey>,
	pub failures: Vec<(WgPublicKey, BackendError)>,
	/// Peers advertising a default route. No route is installed for them.
	pub exit_node_candidates: Vec<WgPublicKey>,
}

impl ApplyReport {
	pub fn is_clean(&self) -> bool {
		self.failures.is_empty()
	}

	pub fn failed(&self, key: &WgPublicKey) -> bool {
		self.failures.iter().any(|(k, _)| k == key)
	}

	pub fn is_empty(&self) -> bool {
		self.configured.is_empty() && self.removed.is_empty() && self.failures.is_empty()
	}
}

pub struct Applier {
	backend: Arc<dyn TunnelBackend>,
	installed_routes: HashMap<WgPublicKey, Vec<IpNet>>,
}

impl Applier {
	pub fn new(backend: Arc<dyn TunnelBackend>) -> Self {
		Self {
			backend,
			installed_routes: HashMap::new(),
		}
	}

	pub fn backend(&self) -> &Arc<dyn TunnelBackend> {
		&self.backend
	}

	pub fn installed_routes(&self, key: &WgPublicKey) -> &[IpNet] {
		self
			.installed_routes
			.get(key)
			.map(Vec::as_slice)
			.unwrap_or_default()
	}

	#[instrument(skip_all, fields(added = added.len(), removed = removed.len()))]
	pub async fn apply(&mut self, added: &[TunnelPeerConfig], removed: &[WgPublicKey]) -> ApplyReport {
		let mut report = ApplyReport::default();

		for config in added {
			match self.apply_peer(config).await {
				Ok(exit_node) => {
					if exit_node {
						report.exit_node_candidates.push(config.public_key);
					}
					report.configured.push(config.public_key);
				}
				Err(e) => {
					warn!(peer = %config.public_key, method = %config.method, error = %e, "failed to apply peer");
					report.failures.push((config.public_key, e));
				}
			}
		}

		for key in removed {
			match self.remove_peer(key).await {
				Ok(()) => report.removed.push(*key),
				Err(e) => {
					warn!(peer = %key, error = %e, "failed to remove peer");
					report.failures.push((*key, e));
				}
			}
		}

		if !report.is_empty() {
			info!(
				configured = report.configured.len(),
				removed = report.removed.len(),
				failed = report.failures.len(),
				"applied tunnel changes"
			);
		}
		report
	}

	/// Returns whether the peer is an exit-node candidate.
	async fn apply_peer(&mut self, config: &TunnelPeerConfig) -> Result<bool, BackendError> {
		self.backend.configure_peer(config).await?;

		let mut exit_node = false;
		let mut owned = Vec::new();
		let mut result = Ok(());
		for prefix in &config.allowed_ips {
			if is_default_route(prefix) {
				exit_node = true;
				continue;
			}
			match self.ensure_route(prefix).await {
				Ok(()) => owned.push(*prefix),
				Err(e) => {
					result = Err(e);
					break;
				}
			}
		}

		let previous = self.installed_routes.remove(&config.public_key).unwrap_or_default();
		if let Err(e) = result {
			// Keep everything we may own so the retry can clean up.
			let mut keep = previous;
			for prefix in owned {
				if !keep.contains(&prefix) {
					keep.push(prefix);
				}
			}
			self.installed_routes.insert(config.public_key, keep);
			return Err(e);
		}

		for stale in previous.iter().filter(|p| !owned.contains(p)) {
			if !self.route_owned_elsewhere(&config.public_key, stale) {
				if let Err(e) = self.backend.del_route(stale).await {
					warn!(peer = %config.public_key, prefix = %stale, error = %e, "failed to delete stale route");
				}
			}
		}
		if !owned.is_empty() {
			self.installed_routes.insert(config.public_key, owned);
		}

		if exit_node {
			info!(peer = %config.public_key, "peer advertises a default route, exit node candidate");
		}
		debug!(peer = %config.public_key, method = %config.method, endpoint = %config.endpoint, "peer applied");
		Ok(exit_node)
	}

	async fn ensure_route(&self, prefix: &IpNet) -> Result<(), BackendError> {
		if self.backend.route_exists(prefix).await? {
			debug!(%prefix, "route already present");
			return Ok(());
		}
		self.backend.add_route(prefix).await
	}

	async fn remove_peer(&mut self, key: &WgPublicKey) -> Result<(), BackendError> {
		self.backend.remove_peer(key).await?;

		let routes = self.installed_routes.remove(key).unwrap_or_default();
		for prefix in &routes {
			if self.route_owned_elsewhere(key, prefix) {
				continue;
			}
			if let Err(e) = self.backend.del_route(prefix).await {
				warn!(peer = %key, %prefix, error = %e, "failed to delete route");
			}
		}
		debug!(peer = %key, routes = routes.len(), "peer removed");
		Ok(())
	}

	fn route_owned_elsewhere(&self, key: &WgPublicKey, prefix: &IpNet) -> bool {
		self
			.installed_routes
			.iter()
			.any(|(k, routes)| k != key && routes.contains(prefix))
	}
}

#[cfg(test)]
pub(crate) mod tests {
	use super::*;
	use crate::backend::{BackendKind, InterfaceConfig};
	use crate::selector::PeeringMethod;
	use async_trait::async_trait;
	use std::collections::HashSet;
	use std::sync::Mutex;
	use weft_common::WgKeyPair;

	#[derive(Debug, Clone, PartialEq, Eq)]
	pub(crate) enum Call {
		Configure(WgPublicKey),
		Remove(WgPublicKey),
		AddRoute(IpNet),
		DelRoute(IpNet),
	}

	/// Backend that records calls and keeps an in-memory route table.
	#[derive(Default)]
	pub(crate) struct RecordingBackend {
		calls: Mutex<Vec<Call>>,
		routes: Mutex<HashSet<IpNet>>,
		failing: Mutex<HashSet<WgPublicKey>>,
	}

	impl RecordingBackend {
		pub(crate) fn fail_for(&self, key: WgPublicKey) {
			self.failing.lock().unwrap().insert(key);
		}

		pub(crate) fn heal(&self, key: &WgPublicKey) {
			self.failing.lock().unwrap().remove(key);
		}

		pub(crate) fn take_calls(&self) -> Vec<Call> {
			std::mem::take(&mut *self.calls.lock().unwrap())
		}

		pub(crate) fn preinstall(&self, prefix: IpNet) {
			self.routes.lock().unwrap().insert(prefix);
		}

		pub(crate) fn has_route(&self, prefix: &IpNet) -> bool {
			self.routes.lock().unwrap().contains(prefix)
		}
	}

	#[async_trait]
	impl TunnelBackend for RecordingBackend {
		fn kind(&self) -> BackendKind {
			BackendKind::Userspace
		}

		async fn setup_interface(&self, _config: &InterfaceConfig) -> Result<(), BackendError> {
			Ok(())
		}

		async fn configure_peer(&self, peer: &TunnelPeerConfig) -> Result<(), BackendError> {
			self.calls.lock().unwrap().push(Call::Configure(peer.public_key));
			if self.failing.lock().unwrap().contains(&peer.public_key) {
				return Err(BackendError::WireGuard("injected failure".into()));
			}
			Ok(())
		}

		async fn remove_peer(&self, public_key: &WgPublicKey) -> Result<(), BackendError> {
			self.calls.lock().unwrap().push(Call::Remove(*public_key));
			Ok(())
		}

		async fn route_exists(&self, prefix: &IpNet) -> Result<bool, BackendError> {
			Ok(self.routes.lock().unwrap().contains(prefix))
		}

		async fn add_route(&self, prefix: &IpNet) -> Result<(), BackendError> {
			self.calls.lock().unwrap().push(Call::AddRoute(*prefix));
			self.routes.lock().unwrap().insert(*prefix);
			Ok(())
		}

		async fn del_route(&self, prefix: &IpNet) -> Result<(), BackendError> {
			self.calls.lock().unwrap().push(Call::DelRoute(*prefix));
			self.routes.lock().unwrap().remove(prefix);
			Ok(())
		}
	}

	pub(crate) fn config(key: WgPublicKey, allowed: &[&str]) -> TunnelPeerConfig {
		TunnelPeerConfig {
			public_key: key,
			endpoint: "2.2.2.2:51820".parse().unwrap(),
			allowed_ips: allowed.iter().map(|p| p.parse().unwrap()).collect(),
			persistent_keepalive: None,
			method: PeeringMethod::Reflexive,
		}
	}

	fn key() -> WgPublicKey {
		*WgKeyPair::generate().public_key()
	}

	fn net(s: &str) -> IpNet {
		s.parse().unwrap()
	}

	#[tokio::test]
	async fn configures_peer_and_installs_routes() {
		let backend = Arc::new(RecordingBackend::default());
		let mut applier = Applier::new(backend.clone());
		let pk = key();

		let report = applier
			.apply(&[config(pk, &["100.64.0.2/32", "10.20.0.0/16"])], &[])
			.await;

		assert!(report.is_clean());
		assert_eq!(report.configured, vec![pk]);
		assert_eq!(
			backend.take_calls(),
			vec![
				Call::Configure(pk),
				Call::AddRoute(net("100.64.0.2/32")),
				Call::AddRoute(net("10.20.0.0/16")),
			]
		);
		assert_eq!(applier.installed_routes(&pk).len(), 2);
	}

	#[tokio::test]
	async fn existing_route_is_not_added_again() {
		let backend = Arc::new(RecordingBackend::default());
		backend.preinstall(net("100.64.0.2/32"));
		let mut applier = Applier::new(backend.clone());
		let pk = key();

		let report = applier.apply(&[config(pk, &["100.64.0.2/32"])], &[]).await;

		assert!(report.is_clean());
		assert_eq!(backend.take_calls(), vec![Call::Configure(pk)]);
	}

	#[tokio::test]
	async fn default_route_marks_exit_node_without_route() {
		let backend = Arc::new(RecordingBackend::default());
		let mut applier = Applier::new(backend.clone());
		let pk = key();

		let report = applier
			.apply(&[config(pk, &["100.64.0.2/32", "0.0.0.0/0", "::/0"])], &[])
			.await;

		assert_eq!(report.exit_node_candidates, vec![pk]);
		assert!(!backend.has_route(&net("0.0.0.0/0")));
		assert!(!backend.has_route(&net("::/0")));
		assert!(backend.has_route(&net("100.64.0.2/32")));
	}

	#[tokio::test]
	async fn failure_for_one_peer_does_not_stop_others() {
		let backend = Arc::new(RecordingBackend::default());
		let mut applier = Applier::new(backend.clone());
		let (a, b, c) = (key(), key(), key());
		backend.fail_for(b);

		let report = applier
			.apply(
				&[
					config(a, &["100.64.0.2/32"]),
					config(b, &["100.64.0.3/32"]),
					config(c, &["100.64.0.4/32"]),
				],
				&[],
			)
			.await;

		assert_eq!(report.configured, vec![a, c]);
		assert!(report.failed(&b));
		assert!(!backend.has_route(&net("100.64.0.3/32")));
		assert!(backend.has_route(&net("100.64.0.4/32")));
	}

	#[tokio::test]
	async fn removal_deletes_owned_routes() {
		let backend = Arc::new(RecordingBackend::default());
		let mut applier = Applier::new(backend.clone());
		let pk = key();
		applier.apply(&[config(pk, &["100.64.0.2/32"])], &[]).await;
		backend.take_calls();

		let report = applier.apply(&[], &[pk]).await;

		assert_eq!(report.removed, vec![pk]);
		assert_eq!(
			backend.take_calls(),
			vec![Call::Remove(pk), Call::DelRoute(net("100.64.0.2/32"))]
		);
		assert!(applier.installed_routes(&pk).is_empty());
	}

	#[tokio::test]
	async fn shared_prefix_survives_until_last_owner_leaves() {
		let backend = Arc::new(RecordingBackend::default());
		let mut applier = Applier::new(backend.clone());
		let (a, b) = (key(), key());
		applier
			.apply(
				&[config(a, &["10.20.0.0/16"]), config(b, &["10.20.0.0/16"])],
				&[],
			)
			.await;

		applier.apply(&[], &[a]).await;
		assert!(backend.has_route(&net("10.20.0.0/16")));

		applier.apply(&[], &[b]).await;
		assert!(!backend.has_route(&net("10.20.0.0/16")));
	}

	#[tokio::test]
	async fn reapply_drops_stale_routes() {
		let backend = Arc::new(RecordingBackend::default());
		let mut applier = Applier::new(backend.clone());
		let pk = key();
		applier
			.apply(&[config(pk, &["100.64.0.2/32", "10.20.0.0/16"])], &[])
			.await;
		backend.take_calls();

		applier.apply(&[config(pk, &["100.64.0.2/32"])], &[]).await;

		assert_eq!(
			backend.take_calls(),
			vec![Call::Configure(pk), Call::DelRoute(net("10.20.0.0/16"))]
		);
	}
}
