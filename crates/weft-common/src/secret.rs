// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Redacted wrapper for bearer tokens and passwords read from configuration.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use zeroize::Zeroize;

pub const REDACTED: &str = "[REDACTED]";

/// A string that never prints, serializes or logs its contents and is
/// zeroized on drop. Call [`SecretString::expose`] to read it.
#[derive(Clone, Zeroize, PartialEq, Eq)]
#[zeroize(drop)]
pub struct SecretString {
	inner: String,
}

impl SecretString {
	pub fn new(inner: impl Into<String>) -> Self {
		Self {
			inner: inner.into(),
		}
	}

	pub fn expose(&self) -> &str {
		&self.inner
	}

	pub fn is_empty(&self) -> bool {
		self.inner.is_empty()
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_tuple("SecretString").field(&REDACTED).finish()
	}
}

impl fmt::Display for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(REDACTED)
	}
}

impl From<String> for SecretString {
	fn from(value: String) -> Self {
		Self::new(value)
	}
}

impl Serialize for SecretString {
	fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		serializer.serialize_str(REDACTED)
	}
}

impl<'de> Deserialize<'de> for SecretString {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: Deserializer<'de>,
	{
		String::deserialize(deserializer).map(Self::new)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn debug_and_display_are_redacted() {
		let secret = SecretString::new("hunter2");
		assert_eq!(format!("{secret}"), REDACTED);
		assert_eq!(format!("{secret:?}"), "SecretString(\"[REDACTED]\")");
		assert_eq!(secret.expose(), "hunter2");
	}

	#[test]
	fn serializes_redacted_but_deserializes_plain() {
		let secret: SecretString = serde_json::from_str("\"tok-123\"").unwrap();
		assert_eq!(secret.expose(), "tok-123");
		assert_eq!(serde_json::to_string(&secret).unwrap(), "\"[REDACTED]\"");
	}
}
