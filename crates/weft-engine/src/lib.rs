// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

pub mod applier;
pub mod backend;
pub mod cache;
pub mod error;
pub mod icmp;
pub mod kernel;
pub mod local;
pub mod prober;
pub mod reconcile;
pub mod router;
pub mod selector;
pub mod shutdown;
pub mod userspace;

pub use applier::{Applier, ApplyReport};
pub use backend::{BackendKind, InterfaceConfig, TunnelBackend};
pub use cache::{DeviceCache, DeviceCacheEntry, HealthResult, PeerView, ProbeTarget};
pub use error::{BackendError, EngineError, ProbeError, Result, SourceError};
pub use kernel::{CommandRunner, KernelBackend, SystemRunner};
pub use local::{LocalNodeState, LocalState};
pub use prober::{
	IcmpProbe, Prober, ReachabilityProbe, UserspaceProbe, DEFAULT_BATCH_SIZE, DEFAULT_PROBE_TIMEOUT,
};
pub use reconcile::{PeerSource, ReconcileReport, ReconcileState, Reconciler, TickOutcome};
pub use router::Router;
pub use selector::{select_path, PeerPath, PeeringMethod, TunnelPeerConfig};
pub use shutdown::{shutdown_requested, until_shutdown};
pub use userspace::UserspaceBackend;
