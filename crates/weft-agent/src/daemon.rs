// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Startup sequence and task orchestration for `weftd`.

use crate::config::AgentConfig;
use crate::coordinator::{CoordinatorClient, CoordinatorError, DeviceRegistration};
use crate::error::{AgentError, Result};
use crate::status::{self, StatusState};
use ipnet::IpNet;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use weft_common::{
	get_or_create_device_key, host_prefix, Endpoint, PeerRecord, WgKeyPair, PRIVATE_KEY_FILE,
};
use weft_conn::{NatDiscoverer, NatDiscovery, Recheck};
use weft_engine::{
	Applier, BackendKind, DeviceCache, IcmpProbe, InterfaceConfig, KernelBackend, LocalNodeState,
	LocalState, PeerSource, Prober, ReachabilityProbe, Reconciler, TunnelBackend, UserspaceBackend,
	UserspaceProbe, shutdown_requested, until_shutdown,
};

const REAUTH_RETRY_DELAY: Duration = Duration::from_secs(5);

pub struct AgentDaemon {
	config: AgentConfig,
	coordinator: Arc<CoordinatorClient>,
	shutdown_tx: watch::Sender<bool>,
	shutdown_rx: watch::Receiver<bool>,
}

impl AgentDaemon {
	#[instrument(skip(config), fields(vpc_id = %config.vpc_id))]
	pub fn new(config: AgentConfig) -> Result<Self> {
		let coordinator = Arc::new(CoordinatorClient::new(&config)?);
		let (shutdown_tx, shutdown_rx) = watch::channel(false);
		Ok(Self {
			config,
			coordinator,
			shutdown_tx,
			shutdown_rx,
		})
	}

	pub fn shutdown(&self) {
		let _ = self.shutdown_tx.send(true);
	}

	/// A sender that stops the daemon, for signal handlers.
	pub fn shutdown_handle(&self) -> watch::Sender<bool> {
		self.shutdown_tx.clone()
	}

	/// Runs until shutdown is requested or the coordinator session can no
	/// longer be restored.
	#[instrument(skip(self))]
	pub async fn run(&self) -> Result<()> {
		let mut tasks = Vec::new();
		let result = self.run_inner(&mut tasks).await;

		self.shutdown();
		for task in tasks {
			if let Err(e) = task.await {
				warn!(error = %e, "background task ended abnormally");
			}
		}
		info!("weftd stopped");
		result
	}

	async fn run_inner(&self, tasks: &mut Vec<JoinHandle<()>>) -> Result<()> {
		let config = &self.config;
		info!(
			mode = %config.mode,
			relay = config.relay,
			relay_only = config.relay_only,
			"starting weftd"
		);

		let keypair = get_or_create_device_key(&config.state_dir).await?;
		info!(public_key = %keypair.public_key(), "device key loaded");

		if !self.coordinator.has_session().await {
			self.coordinator.login().await?;
		}
		let vpc = self.coordinator.fetch_vpc().await?;
		let supernet = vpc.supernet();
		debug!(supernet = ?supernet, "VPC loaded");

		let (backend, probe) = self.build_backend(&keypair);
		let nat = NatDiscoverer::new(config.stun_servers.clone(), config.listen_port);
		let discovery = discover_nat(backend.as_ref(), &nat).await?;
		let symmetric_nat = discovery.symmetric || config.relay_only;

		let registration = DeviceRegistration {
			vpc_id: config.vpc_id,
			public_key: *keypair.public_key(),
			endpoints: advertised_endpoints(&discovery),
			advertise_cidrs: config.advertise_cidrs.clone(),
			relay: config.relay,
			symmetric_nat,
			hostname: local_hostname(),
		};
		let record = self.coordinator.register_device(&registration).await?;
		let addresses = interface_addresses(&record);
		if addresses.is_empty() {
			return Err(AgentError::Registration(
				"coordinator assigned no tunnel address".to_string(),
			));
		}

		let local = LocalState::new(
			LocalNodeState::new(*keypair.public_key(), discovery.reflexive)
				.with_id(record.id)
				.with_relay(config.relay)
				.with_symmetric_nat(symmetric_nat)
				.with_relay_only(config.relay_only)
				.with_relay_supernet(supernet),
		);

		backend
			.setup_interface(&InterfaceConfig {
				name: config.interface.clone(),
				listen_port: config.listen_port,
				addresses,
				relay: config.relay,
			})
			.await?;
		info!(interface = %config.interface, backend = %backend.kind(), "tunnel interface ready");

		let cache = Arc::new(DeviceCache::new());
		let prober = Arc::new(
			Prober::new(probe)
				.with_batch_size(config.probe_batch_size)
				.with_timeout(config.probe_timeout),
		);

		tasks.push(tokio::spawn({
			let prober = Arc::clone(&prober);
			let cache = Arc::clone(&cache);
			let local = local.clone();
			let interval = config.probe_interval;
			let shutdown_rx = self.shutdown_rx.clone();
			async move { prober.run(cache, local, interval, shutdown_rx).await }
		}));

		if symmetric_nat {
			info!(relay_only = config.relay_only, "NAT binding watch disabled");
		} else {
			tasks.push(tokio::spawn(watch_nat_binding(
				nat,
				Arc::clone(&self.coordinator),
				registration,
				discovery,
				local.clone(),
				config.nat_recheck_interval,
				self.shutdown_rx.clone(),
			)));
		}

		tasks.push(tokio::spawn({
			let state = StatusState {
				cache: Arc::clone(&cache),
				local: local.clone(),
				prober: Arc::clone(&prober),
			};
			let listen = config.status_listen;
			let shutdown_rx = self.shutdown_rx.clone();
			async move {
				if let Err(e) = status::serve(listen, state, shutdown_rx).await {
					error!(error = %e, %listen, "status API failed");
				}
			}
		}));

		let source: Arc<dyn PeerSource> = self.coordinator.clone();
		let mut reconciler = Reconciler::new(source, cache, local, Applier::new(backend));
		self.reconcile_until_shutdown(&mut reconciler).await
	}

	fn build_backend(
		&self,
		keypair: &WgKeyPair,
	) -> (Arc<dyn TunnelBackend>, Arc<dyn ReachabilityProbe>) {
		match self.config.mode {
			BackendKind::Kernel => {
				let backend: Arc<dyn TunnelBackend> = Arc::new(KernelBackend::new(
					self.config.interface.clone(),
					self.config.state_dir.join(PRIVATE_KEY_FILE),
				));
				let probe: Arc<dyn ReachabilityProbe> = Arc::new(IcmpProbe::new());
				(backend, probe)
			}
			BackendKind::Userspace => {
				let userspace = UserspaceBackend::new(keypair.clone(), self.shutdown_rx.clone());
				let probe: Arc<dyn ReachabilityProbe> =
					Arc::new(UserspaceProbe::new(Arc::clone(&userspace)));
				let backend: Arc<dyn TunnelBackend> = userspace;
				(backend, probe)
			}
		}
	}

	/// Drives the reconciler and restores the coordinator session whenever
	/// it expires. A session that cannot be restored is fatal.
	async fn reconcile_until_shutdown(&self, reconciler: &mut Reconciler) -> Result<()> {
		loop {
			match reconciler
				.run(self.config.reconcile_interval, self.shutdown_rx.clone())
				.await
			{
				Ok(()) => return Ok(()),
				Err(e) if e.is_unauthorized() => {
					warn!(error = %e, "coordinator session expired");
					self.reauthenticate().await?;
					if *self.shutdown_rx.borrow() {
						return Ok(());
					}
					reconciler.resume();
				}
				Err(e) => return Err(e.into()),
			}
		}
	}

	async fn reauthenticate(&self) -> Result<()> {
		let mut shutdown_rx = self.shutdown_rx.clone();
		loop {
			match self.coordinator.reconnect().await {
				Ok(()) => {
					info!("coordinator session restored");
					return Ok(());
				}
				Err(e @ (CoordinatorError::NoCredentials | CoordinatorError::Unauthorized)) => {
					return Err(AgentError::Reauthentication(e.to_string()));
				}
				Err(e) => warn!(error = %e, "reauthentication attempt failed, retrying"),
			}

			tokio::select! {
				biased;

				stop = shutdown_requested(&mut shutdown_rx) => {
					if stop {
						return Ok(());
					}
				}

				_ = tokio::time::sleep(REAUTH_RETRY_DELAY) => {}
			}
		}
	}
}

/// Clears a tunnel interface left by an earlier run, then classifies the
/// NAT. Reflector queries have to leave from the listen port, which a stale
/// kernel interface would still hold.
async fn discover_nat(backend: &dyn TunnelBackend, nat: &NatDiscoverer) -> Result<NatDiscovery> {
	backend.teardown_interface().await?;
	let discovery = nat.discover().await;
	info!(
		local = %discovery.local,
		reflexive = %discovery.reflexive,
		symmetric = discovery.symmetric,
		fallback = discovery.fallback,
		"NAT discovery complete"
	);
	Ok(discovery)
}

/// The local endpoint always; the reflexive one only when a reflector
/// actually answered.
pub fn advertised_endpoints(discovery: &NatDiscovery) -> Vec<Endpoint> {
	let mut endpoints = vec![Endpoint::local(discovery.local)];
	if let Some(reflector) = &discovery.reflector {
		endpoints.push(Endpoint::stun(reflector.clone(), discovery.reflexive));
	}
	endpoints
}

/// Host prefixes for the tunnel addresses the coordinator assigned.
pub fn interface_addresses(record: &PeerRecord) -> Vec<IpNet> {
	record
		.tunnel_ipv4
		.map(IpAddr::V4)
		.into_iter()
		.chain(record.tunnel_ipv6.map(IpAddr::V6))
		.map(host_prefix)
		.collect()
}

fn local_hostname() -> String {
	match hostname::get() {
		Ok(name) => name.to_string_lossy().into_owned(),
		Err(e) => {
			warn!(error = %e, "could not read hostname");
			String::from("unknown")
		}
	}
}

/// Rechecks the NAT mapping of the listen port. When it moves, the device is
/// registered again with the new endpoint and the local generation bumped so
/// every path is recomputed on the next tick.
async fn watch_nat_binding(
	nat: NatDiscoverer,
	coordinator: Arc<CoordinatorClient>,
	mut registration: DeviceRegistration,
	mut discovery: NatDiscovery,
	local: LocalState,
	interval: Duration,
	mut shutdown_rx: watch::Receiver<bool>,
) {
	let mut ticker = tokio::time::interval(interval);
	ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
	ticker.tick().await;

	loop {
		tokio::select! {
			biased;

			stop = shutdown_requested(&mut shutdown_rx) => {
				if stop {
					info!("NAT binding watch shutting down");
					return;
				}
			}

			_ = ticker.tick() => {
				let recheck = match until_shutdown(&mut shutdown_rx, nat.recheck()).await {
					None => return,
					Some(Ok(found)) => found,
					Some(Err(e)) => {
						debug!(error = %e, "NAT recheck failed");
						continue;
					}
				};
				let reflexive = observed_reflexive(&discovery, &recheck);
				if !binding_moved(&discovery, reflexive) {
					continue;
				}

				info!(
					from = %discovery.reflexive,
					to = %reflexive,
					from_listen_port = recheck.from_listen_port,
					"NAT binding changed"
				);
				discovery.reflexive = reflexive;
				discovery.reflector = Some(recheck.reflector);
				discovery.fallback = false;

				registration.endpoints = advertised_endpoints(&discovery);
				if let Err(e) = coordinator.register_device(&registration).await {
					warn!(error = %e, "failed to publish new endpoint");
				}
				local.update(|state| state.reflexive = reflexive).await;
			}
		}
	}
}

/// The reflexive endpoint a recheck points at. An answer to an ephemeral
/// source port only tells us the public address, so the mapped port
/// learned at discovery is kept.
fn observed_reflexive(discovery: &NatDiscovery, recheck: &Recheck) -> SocketAddr {
	if recheck.from_listen_port {
		recheck.mapped
	} else {
		SocketAddr::new(recheck.mapped.ip(), discovery.reflexive.port())
	}
}

fn binding_moved(discovery: &NatDiscovery, observed: SocketAddr) -> bool {
	discovery.reflexive != observed
}
