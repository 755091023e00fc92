// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::keys::{WgKeyPair, WgPrivateKey};
use std::path::Path;
use thiserror::Error;
use tokio::fs;
use tracing::{info, instrument};

pub const PRIVATE_KEY_FILE: &str = "private.key";

#[derive(Error, Debug)]
pub enum KeyFileError {
	#[error("failed to access key file: {0}")]
	Io(#[from] std::io::Error),

	#[error("invalid key format: {0}")]
	InvalidFormat(#[from] crate::keys::KeyError),
}

pub type Result<T> = std::result::Result<T, KeyFileError>;

#[instrument(skip_all, fields(path = %path.as_ref().display()))]
pub async fn load_key_file(path: impl AsRef<Path>) -> Result<WgKeyPair> {
	let content = fs::read_to_string(path.as_ref()).await?;
	let private = WgPrivateKey::from_base64(content.trim())?;
	Ok(WgKeyPair::from_private_key(private))
}

#[instrument(skip(key), fields(path = %path.as_ref().display()))]
pub async fn save_key_file(key: &WgKeyPair, path: impl AsRef<Path>) -> Result<()> {
	let path = path.as_ref();

	if let Some(parent) = path.parent() {
		fs::create_dir_all(parent).await?;
	}

	let private_b64 = key.private_key().to_base64();
	let content = zeroize::Zeroizing::new(format!("{}\n", private_b64.as_str()));

	#[cfg(unix)]
	{
		use tokio::fs::OpenOptions;
		use tokio::io::AsyncWriteExt;

		let mut file = OpenOptions::new()
			.write(true)
			.create(true)
			.truncate(true)
			.mode(0o600)
			.open(path)
			.await?;
		file.write_all(content.as_bytes()).await?;
		file.flush().await?;
	}

	#[cfg(not(unix))]
	{
		fs::write(path, content.as_bytes()).await?;
	}

	Ok(())
}

/// Loads `<state_dir>/private.key`, generating and persisting a fresh key
/// pair on first start.
#[instrument(skip(state_dir), fields(state_dir = %state_dir.as_ref().display()))]
pub async fn get_or_create_device_key(state_dir: impl AsRef<Path>) -> Result<WgKeyPair> {
	let key_path = state_dir.as_ref().join(PRIVATE_KEY_FILE);

	if fs::try_exists(&key_path).await? {
		return load_key_file(&key_path).await;
	}

	let keypair = WgKeyPair::generate();
	save_key_file(&keypair, &key_path).await?;
	info!(public_key = %keypair.public_key(), "generated new device key");
	Ok(keypair)
}
