// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! The `weftd` agent: configuration, the coordinator client, the local
//! status API and the task wiring around the connectivity engine.

pub mod config;
pub mod coordinator;
pub mod daemon;
pub mod error;
pub mod status;

pub use config::{load_config, AgentConfig, AgentConfigLayer, CliArgs, ConfigError, LogFormat};
pub use coordinator::{CoordinatorClient, CoordinatorError, DeviceRegistration, VpcInfo};
pub use daemon::AgentDaemon;
pub use error::{AgentError, Result};
pub use status::{router, serve, StatusState};
