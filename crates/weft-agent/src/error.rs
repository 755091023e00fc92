// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::config::ConfigError;
use crate::coordinator::CoordinatorError;
use thiserror::Error;
use weft_common::KeyFileError;
use weft_engine::{BackendError, EngineError};

#[derive(Debug, Error)]
pub enum AgentError {
	#[error("configuration error: {0}")]
	Config(#[from] ConfigError),

	#[error("coordinator error: {0}")]
	Coordinator(#[from] CoordinatorError),

	#[error("device key error: {0}")]
	KeyFile(#[from] KeyFileError),

	#[error("engine error: {0}")]
	Engine(#[from] EngineError),

	#[error("tunnel backend error: {0}")]
	Backend(#[from] BackendError),

	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),

	#[error("registration incomplete: {0}")]
	Registration(String),

	#[error("could not re-establish coordinator session: {0}")]
	Reauthentication(String),
}

pub type Result<T> = std::result::Result<T, AgentError>;
