// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use thiserror::Error;

/// Failures programming the tunnel interface or routes.
#[derive(Debug, Error)]
pub enum BackendError {
	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),

	#[error("failed to spawn {program}: {source}")]
	Spawn {
		program: String,
		#[source]
		source: std::io::Error,
	},

	#[error("{program} {args} exited with {status}: {stderr}")]
	Command {
		program: String,
		args: String,
		status: i32,
		stderr: String,
	},

	#[error("WireGuard error: {0}")]
	WireGuard(String),

	#[error("peer not found: {0}")]
	PeerNotFound(String),

	#[error("interface not set up")]
	NotRunning,
}

impl BackendError {
	/// True when a failed command reported `needle` on stderr.
	pub fn stderr_contains(&self, needle: &str) -> bool {
		matches!(self, BackendError::Command { stderr, .. } if stderr.contains(needle))
	}
}

#[derive(Debug, Error)]
pub enum ProbeError {
	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),

	#[error("probe timed out")]
	Timeout,

	#[error("no tunnel route to {0}")]
	NoRoute(std::net::IpAddr),

	#[error("probe unsupported: {0}")]
	Unsupported(&'static str),
}

/// Failures fetching the peer listing.
#[derive(Debug, Error)]
pub enum SourceError {
	/// Network hiccup or server error: skip this tick.
	#[error("transient listing failure: {0}")]
	Transient(String),

	/// The session is no longer valid.
	#[error("unauthorized: {0}")]
	Unauthorized(String),
}

#[derive(Debug, Error)]
pub enum EngineError {
	#[error("backend error: {0}")]
	Backend(#[from] BackendError),

	#[error("peer source error: {0}")]
	Source(#[from] SourceError),

	#[error("probe error: {0}")]
	Probe(#[from] ProbeError),
}

impl EngineError {
	pub fn is_unauthorized(&self) -> bool {
		matches!(self, EngineError::Source(SourceError::Unauthorized(_)))
	}
}

pub type Result<T> = std::result::Result<T, EngineError>;
