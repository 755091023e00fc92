// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! WireGuard Curve25519 keys.
//!
//! Keys travel as padded standard base64, the encoding `wg(8)` prints and the
//! coordinator stores. Unpadded input is accepted on decode.

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine;
use rand::rngs::OsRng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, Zeroizing};

pub const KEY_LEN: usize = 32;

#[derive(Error, Debug)]
pub enum KeyError {
	#[error("invalid key length: expected 32 bytes, got {0}")]
	InvalidLength(usize),

	#[error("invalid base64 encoding: {0}")]
	InvalidBase64(#[from] base64::DecodeError),
}

pub type Result<T> = std::result::Result<T, KeyError>;

fn decode_key(s: &str) -> Result<[u8; KEY_LEN]> {
	let s = s.trim();
	let bytes = if s.ends_with('=') {
		STANDARD.decode(s)?
	} else {
		STANDARD_NO_PAD.decode(s)?
	};
	if bytes.len() != KEY_LEN {
		return Err(KeyError::InvalidLength(bytes.len()));
	}
	let mut arr = [0u8; KEY_LEN];
	arr.copy_from_slice(&bytes);
	Ok(arr)
}

#[derive(Clone, Zeroize)]
#[zeroize(drop)]
pub struct WgPrivateKey {
	bytes: [u8; KEY_LEN],
}

impl WgPrivateKey {
	pub fn generate() -> Self {
		let secret = StaticSecret::random_from_rng(OsRng);
		Self {
			bytes: secret.to_bytes(),
		}
	}

	pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
		Self { bytes }
	}

	pub fn from_base64(s: &str) -> Result<Self> {
		Ok(Self {
			bytes: decode_key(s)?,
		})
	}

	/// Encodes the key for `wg set ... private-key` or the key file.
	/// The returned buffer is wiped on drop.
	pub fn to_base64(&self) -> Zeroizing<String> {
		Zeroizing::new(STANDARD.encode(self.bytes))
	}

	pub fn public_key(&self) -> WgPublicKey {
		let secret = StaticSecret::from(self.bytes);
		WgPublicKey {
			bytes: *PublicKey::from(&secret).as_bytes(),
		}
	}

	/// Raw scalar for handing to the tunnel implementation.
	pub fn expose_bytes(&self) -> &[u8; KEY_LEN] {
		&self.bytes
	}
}

impl fmt::Debug for WgPrivateKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("WgPrivateKey([REDACTED])")
	}
}

impl fmt::Display for WgPrivateKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("[REDACTED]")
	}
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WgPublicKey {
	bytes: [u8; KEY_LEN],
}

impl WgPublicKey {
	pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
		Self { bytes }
	}

	pub fn from_base64(s: &str) -> Result<Self> {
		Ok(Self {
			bytes: decode_key(s)?,
		})
	}

	pub fn to_base64(&self) -> String {
		STANDARD.encode(self.bytes)
	}

	pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
		&self.bytes
	}

	/// First eight base64 characters, enough to tell peers apart in logs.
	pub fn short(&self) -> String {
		let mut b64 = self.to_base64();
		b64.truncate(8);
		b64
	}
}

impl fmt::Debug for WgPublicKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "WgPublicKey({}...)", self.short())
	}
}

impl fmt::Display for WgPublicKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.to_base64())
	}
}

impl std::str::FromStr for WgPublicKey {
	type Err = KeyError;

	fn from_str(s: &str) -> Result<Self> {
		Self::from_base64(s)
	}
}

impl Serialize for WgPublicKey {
	fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		serializer.serialize_str(&self.to_base64())
	}
}

impl<'de> Deserialize<'de> for WgPublicKey {
	fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
	where
		D: Deserializer<'de>,
	{
		let s = String::deserialize(deserializer)?;
		Self::from_base64(&s).map_err(serde::de::Error::custom)
	}
}

#[derive(Clone)]
pub struct WgKeyPair {
	private: WgPrivateKey,
	public: WgPublicKey,
}

impl WgKeyPair {
	pub fn generate() -> Self {
		Self::from_private_key(WgPrivateKey::generate())
	}

	pub fn from_private_key(private: WgPrivateKey) -> Self {
		let public = private.public_key();
		Self { private, public }
	}

	pub fn from_base64(private_key_base64: &str) -> Result<Self> {
		Ok(Self::from_private_key(WgPrivateKey::from_base64(
			private_key_base64,
		)?))
	}

	pub fn private_key(&self) -> &WgPrivateKey {
		&self.private
	}

	pub fn public_key(&self) -> &WgPublicKey {
		&self.public
	}
}

impl fmt::Debug for WgKeyPair {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("WgKeyPair")
			.field("private", &self.private)
			.field("public", &self.public)
			.finish()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use proptest::prelude::*;

	#[test]
	fn public_key_encodes_with_padding() {
		let keypair = WgKeyPair::generate();
		let b64 = keypair.public_key().to_base64();
		assert_eq!(b64.len(), 44);
		assert!(b64.ends_with('='));
	}

	#[test]
	fn decode_accepts_unpadded() {
		let keypair = WgKeyPair::generate();
		let padded = keypair.public_key().to_base64();
		let unpadded = padded.trim_end_matches('=');
		let parsed = WgPublicKey::from_base64(unpadded).unwrap();
		assert_eq!(&parsed, keypair.public_key());
	}

	#[test]
	fn decode_rejects_short_key() {
		let err = WgPublicKey::from_base64("AAAA").unwrap_err();
		assert!(matches!(err, KeyError::InvalidLength(3)));
	}

	#[test]
	fn private_key_output_is_redacted() {
		let keypair = WgKeyPair::generate();
		let encoded = keypair.private_key().to_base64();
		let debug = format!("{:?}", keypair);
		assert!(debug.contains("[REDACTED]"));
		assert!(!debug.contains(encoded.as_str()));
		assert_eq!(format!("{}", keypair.private_key()), "[REDACTED]");
	}

	#[test]
	fn public_key_json_is_base64_string() {
		let keypair = WgKeyPair::generate();
		let json = serde_json::to_string(keypair.public_key()).unwrap();
		assert_eq!(json, format!("\"{}\"", keypair.public_key().to_base64()));
		let restored: WgPublicKey = serde_json::from_str(&json).unwrap();
		assert_eq!(&restored, keypair.public_key());
	}

	proptest! {
		#[test]
		fn private_key_debug_never_leaks(seed in prop::array::uniform32(any::<u8>())) {
			let private = WgPrivateKey::from_bytes(seed);
			let debug = format!("{:?}", private);
			prop_assert!(!debug.contains(STANDARD.encode(seed).as_str()));
		}

		#[test]
		fn derived_public_key_survives_private_key_file_format(seed in prop::array::uniform32(any::<u8>())) {
			let keypair = WgKeyPair::from_private_key(WgPrivateKey::from_bytes(seed));
			let restored = WgKeyPair::from_base64(&keypair.private_key().to_base64()).unwrap();
			prop_assert_eq!(keypair.public_key(), restored.public_key());
		}
	}
}
