// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Local status API on the loopback address.
//!
//! Handlers only read the device cache snapshot, so a failing reconciliation
//! tick never blocks a status query.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, instrument};
use weft_common::IpFamily;
use weft_engine::{DeviceCache, HealthResult, LocalState, PeerView, Prober};

#[derive(Clone)]
pub struct StatusState {
	pub cache: Arc<DeviceCache>,
	pub local: LocalState,
	pub prober: Arc<Prober>,
}

#[derive(Debug, Serialize)]
pub struct PeersResponse {
	pub peers: Vec<PeerView>,
	/// A relay entry in the cache has not failed its last probe.
	pub relay_present: bool,
	/// This node is behind a symmetric NAT.
	pub relay_required: bool,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
	pub status: &'static str,
	pub peers: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum StatusApiError {
	#[error("unknown address family '{0}', expected v4 or v6")]
	BadFamily(String),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
	error: String,
}

impl IntoResponse for StatusApiError {
	fn into_response(self) -> Response {
		let status = match &self {
			StatusApiError::BadFamily(_) => StatusCode::BAD_REQUEST,
		};
		(
			status,
			Json(ErrorBody {
				error: self.to_string(),
			}),
		)
			.into_response()
	}
}

pub fn router(state: StatusState) -> Router {
	Router::new()
		.route("/peers", get(list_peers))
		.route("/probe/{family}", post(probe_now))
		.route("/health", get(health))
		.with_state(state)
}

async fn list_peers(State(state): State<StatusState>) -> Json<PeersResponse> {
	let local = state.local.snapshot().await;
	Json(PeersResponse {
		peers: state.cache.list().await,
		relay_present: state.cache.healthy_relay().await,
		relay_required: local.symmetric_nat,
	})
}

/// Runs an out-of-cycle probe pass over one address family. Keys are the
/// peers' base64 public keys.
#[instrument(skip_all, fields(family = %family))]
async fn probe_now(
	State(state): State<StatusState>,
	Path(family): Path<String>,
) -> Result<Json<BTreeMap<String, HealthResult>>, StatusApiError> {
	let family: IpFamily = family
		.parse()
		.map_err(|_| StatusApiError::BadFamily(family.clone()))?;
	let relay = state.local.snapshot().await.relay;
	let results = state
		.prober
		.probe_family(&state.cache, family, relay)
		.await;
	Ok(Json(
		results
			.into_iter()
			.map(|(key, result)| (key.to_base64(), result))
			.collect(),
	))
}

async fn health(State(state): State<StatusState>) -> Json<HealthResponse> {
	Json(HealthResponse {
		status: "ok",
		peers: state.cache.len().await,
	})
}

/// Serves the status API until `shutdown_rx` flips to true.
pub async fn serve(
	listen: SocketAddr,
	state: StatusState,
	mut shutdown_rx: watch::Receiver<bool>,
) -> std::io::Result<()> {
	let listener = TcpListener::bind(listen).await?;
	info!(addr = %listen, "status API listening");

	axum::serve(listener, router(state))
		.with_graceful_shutdown(async move {
			while shutdown_rx.changed().await.is_ok() {
				if *shutdown_rx.borrow() {
					break;
				}
			}
		})
		.await?;

	info!("status API stopped");
	Ok(())
}
