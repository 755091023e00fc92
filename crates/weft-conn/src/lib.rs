// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

pub mod nat;
pub mod stun;

pub use nat::{is_symmetric, NatDiscoverer, NatDiscovery, Recheck};
pub use stun::{
	binding_request, bind_reusable, build_binding_response, resolve_stun_servers, StunError, StunServer,
	DEFAULT_STUN_SERVERS,
};
