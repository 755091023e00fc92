// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

pub mod ip;
pub mod keys;
pub mod keys_file;
pub mod peer;
pub mod secret;

pub use ip::{dedup_prefixes, host_prefix, is_default_route, parse_endpoint, IpError, IpFamily};
pub use keys::{KeyError, WgKeyPair, WgPrivateKey, WgPublicKey};
pub use keys_file::{
	get_or_create_device_key, load_key_file, save_key_file, KeyFileError, PRIVATE_KEY_FILE,
};
pub use peer::{Endpoint, EndpointSource, PeerId, PeerRecord};
pub use secret::SecretString;
