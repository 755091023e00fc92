// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! HTTP client for the coordinator.

use crate::config::{AgentConfig, Credentials};
use async_trait::async_trait;
use ipnet::IpNet;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};
use url::Url;
use uuid::Uuid;
use weft_common::{Endpoint, PeerRecord, SecretString, WgPublicKey};
use weft_engine::{PeerSource, SourceError};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Error)]
pub enum CoordinatorError {
	#[error("HTTP request failed: {0}")]
	Http(#[from] reqwest::Error),

	#[error("API error: {status} - {message}")]
	Api { status: u16, message: String },

	#[error("session is not authorized")]
	Unauthorized,

	#[error("URL parse error: {0}")]
	UrlParse(#[from] url::ParseError),

	#[error("session expired and no reusable credentials are configured")]
	NoCredentials,
}

impl CoordinatorError {
	pub fn is_unauthorized(&self) -> bool {
		matches!(self, CoordinatorError::Unauthorized)
	}
}

pub type Result<T> = std::result::Result<T, CoordinatorError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VpcInfo {
	pub id: Uuid,
	pub organization_id: Uuid,
	#[serde(default)]
	pub ipv4_cidr: Option<IpNet>,
	#[serde(default)]
	pub ipv6_cidr: Option<IpNet>,
}

impl VpcInfo {
	/// The relay supernet: every tunnel prefix of the VPC.
	pub fn supernet(&self) -> Vec<IpNet> {
		self.ipv4_cidr.iter().chain(self.ipv6_cidr.iter()).copied().collect()
	}
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceRegistration {
	pub vpc_id: Uuid,
	pub public_key: WgPublicKey,
	pub endpoints: Vec<Endpoint>,
	pub advertise_cidrs: Vec<IpNet>,
	pub relay: bool,
	pub symmetric_nat: bool,
	pub hostname: String,
}

#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
	username: &'a str,
	password: &'a str,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
	access_token: String,
}

pub struct CoordinatorClient {
	http: Client,
	base_url: Url,
	vpc_id: Uuid,
	token: RwLock<Option<SecretString>>,
	credentials: Option<Credentials>,
}

impl CoordinatorClient {
	pub fn new(config: &AgentConfig) -> Result<Self> {
		let http = Client::builder()
			.user_agent(concat!("weftd/", env!("CARGO_PKG_VERSION")))
			.timeout(REQUEST_TIMEOUT)
			.build()?;
		Ok(Self {
			http,
			base_url: config.coordinator_url.clone(),
			vpc_id: config.vpc_id,
			token: RwLock::new(config.auth_token.clone()),
			credentials: config.credentials.clone(),
		})
	}

	fn api_url(&self, path: &str) -> Result<Url> {
		Ok(self.base_url.join(path)?)
	}

	async fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
		match self.token.read().await.as_ref() {
			Some(token) => request.bearer_auth(token.expose()),
			None => request,
		}
	}

	async fn check(response: Response) -> Result<Response> {
		let status = response.status();
		if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
			return Err(CoordinatorError::Unauthorized);
		}
		if !status.is_success() {
			let message = response.text().await.unwrap_or_default();
			return Err(CoordinatorError::Api {
				status: status.as_u16(),
				message,
			});
		}
		Ok(response)
	}

	pub async fn has_session(&self) -> bool {
		self.token.read().await.is_some()
	}

	/// Exchanges the configured username and password for a session token.
	#[instrument(skip(self))]
	pub async fn login(&self) -> Result<()> {
		let credentials = self.credentials.as_ref().ok_or(CoordinatorError::NoCredentials)?;
		let url = self.api_url("/api/login")?;

		let response = self
			.http
			.post(url)
			.json(&LoginRequest {
				username: &credentials.username,
				password: credentials.password.expose(),
			})
			.send()
			.await?;
		let login: LoginResponse = Self::check(response).await?.json().await?;

		*self.token.write().await = Some(SecretString::new(login.access_token));
		info!(username = %credentials.username, "coordinator session established");
		Ok(())
	}

	/// Restores an expired session. Without reusable credentials this is
	/// fatal for the caller.
	pub async fn reconnect(&self) -> Result<()> {
		if self.credentials.is_none() {
			warn!("session expired and cannot be renewed without credentials");
			return Err(CoordinatorError::NoCredentials);
		}
		self.login().await
	}

	#[instrument(skip(self), fields(vpc_id = %self.vpc_id))]
	pub async fn fetch_vpc(&self) -> Result<VpcInfo> {
		let url = self.api_url(&format!("/api/vpcs/{}", self.vpc_id))?;
		let response = self.authorized(self.http.get(url)).await.send().await?;
		Ok(Self::check(response).await?.json().await?)
	}

	#[instrument(skip(self), fields(vpc_id = %self.vpc_id))]
	pub async fn list_devices(&self) -> Result<Vec<PeerRecord>> {
		let url = self.api_url(&format!("/api/vpcs/{}/devices", self.vpc_id))?;
		let response = self.authorized(self.http.get(url)).await.send().await?;
		let devices: Vec<PeerRecord> = Self::check(response).await?.json().await?;
		debug!(count = devices.len(), "fetched device listing");
		Ok(devices)
	}

	/// Creates the device, or updates it when the public key is already
	/// registered. Returns the coordinator's record, which carries the
	/// assigned tunnel addresses.
	#[instrument(skip(self, registration), fields(public_key = %registration.public_key))]
	pub async fn register_device(&self, registration: &DeviceRegistration) -> Result<PeerRecord> {
		let url = self.api_url("/api/devices")?;
		let response = self
			.authorized(self.http.post(url).json(registration))
			.await
			.send()
			.await?;
		let record: PeerRecord = Self::check(response).await?.json().await?;
		info!(
			device_id = %record.id,
			tunnel_ipv4 = ?record.tunnel_ipv4,
			tunnel_ipv6 = ?record.tunnel_ipv6,
			"device registered"
		);
		Ok(record)
	}
}

#[async_trait]
impl PeerSource for CoordinatorClient {
	async fn fetch_listing(&self) -> std::result::Result<Vec<PeerRecord>, SourceError> {
		self.list_devices().await.map_err(|e| match e {
			CoordinatorError::Unauthorized => SourceError::Unauthorized(e.to_string()),
			other => SourceError::Transient(other.to_string()),
		})
	}
}
