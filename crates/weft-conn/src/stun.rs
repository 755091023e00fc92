// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use socket2::{Domain, Protocol, Socket, Type};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, instrument, warn};

pub const STUN_TIMEOUT: Duration = Duration::from_secs(3);
const STUN_MAGIC_COOKIE: u32 = 0x2112A442;

const BINDING_REQUEST: u16 = 0x0001;
const BINDING_SUCCESS: u16 = 0x0101;

const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;

const ADDR_FAMILY_IPV4: u8 = 0x01;
const ADDR_FAMILY_IPV6: u8 = 0x02;

pub const DEFAULT_STUN_SERVERS: &[&str] = &[
	"stun1.l.google.com:19302",
	"stun2.l.google.com:19302",
	"stun.cloudflare.com:3478",
];

#[derive(Debug, Error)]
pub enum StunError {
	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),

	#[error("timeout waiting for STUN response")]
	Timeout,

	#[error("invalid STUN response")]
	InvalidResponse,

	#[error("no STUN servers available")]
	NoServers,
}

pub type Result<T> = std::result::Result<T, StunError>;

/// A reflector after DNS resolution. `name` is what gets published in the
/// endpoint source tag (`stun:<name>`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StunServer {
	pub name: String,
	pub addr: SocketAddr,
}

pub fn new_transaction_id() -> [u8; 12] {
	let mut id = [0u8; 12];
	fastrand::fill(&mut id);
	id
}

pub fn build_binding_request(transaction_id: &[u8; 12]) -> Vec<u8> {
	let mut request = Vec::with_capacity(20);
	request.extend_from_slice(&BINDING_REQUEST.to_be_bytes());
	request.extend_from_slice(&0u16.to_be_bytes());
	request.extend_from_slice(&STUN_MAGIC_COOKIE.to_be_bytes());
	request.extend_from_slice(transaction_id);
	request
}

/// Binding success carrying `mapped` as an XOR-MAPPED-ADDRESS. Lets a
/// node answer reflector queries itself.
pub fn build_binding_response(transaction_id: &[u8; 12], mapped: SocketAddrV4) -> Vec<u8> {
	let mut response = Vec::with_capacity(32);
	response.extend_from_slice(&BINDING_SUCCESS.to_be_bytes());
	response.extend_from_slice(&12u16.to_be_bytes());
	response.extend_from_slice(&STUN_MAGIC_COOKIE.to_be_bytes());
	response.extend_from_slice(transaction_id);

	response.extend_from_slice(&ATTR_XOR_MAPPED_ADDRESS.to_be_bytes());
	response.extend_from_slice(&8u16.to_be_bytes());
	response.push(0x00);
	response.push(ADDR_FAMILY_IPV4);

	let xor_port = mapped.port() ^ ((STUN_MAGIC_COOKIE >> 16) as u16);
	response.extend_from_slice(&xor_port.to_be_bytes());

	let magic_bytes = STUN_MAGIC_COOKIE.to_be_bytes();
	for (b, m) in mapped.ip().octets().iter().zip(magic_bytes) {
		response.push(b ^ m);
	}
	response
}

pub fn parse_binding_response(
	data: &[u8],
	expected_transaction_id: &[u8; 12],
) -> Result<SocketAddr> {
	if data.len() < 20 {
		return Err(StunError::InvalidResponse);
	}

	let message_type = u16::from_be_bytes([data[0], data[1]]);
	if message_type != BINDING_SUCCESS {
		return Err(StunError::InvalidResponse);
	}

	let message_length = u16::from_be_bytes([data[2], data[3]]) as usize;

	let magic = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
	if magic != STUN_MAGIC_COOKIE {
		return Err(StunError::InvalidResponse);
	}

	if &data[8..20] != expected_transaction_id {
		return Err(StunError::InvalidResponse);
	}

	if data.len() < 20 + message_length {
		return Err(StunError::InvalidResponse);
	}

	let mut xor_key = [0u8; 16];
	xor_key[..4].copy_from_slice(&STUN_MAGIC_COOKIE.to_be_bytes());
	xor_key[4..].copy_from_slice(expected_transaction_id);

	let mut offset = 20;
	let end = 20 + message_length;
	let mut fallback = None;

	while offset + 4 <= end {
		let attr_type = u16::from_be_bytes([data[offset], data[offset + 1]]);
		let attr_length = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
		offset += 4;

		if offset + attr_length > end {
			return Err(StunError::InvalidResponse);
		}

		let value = &data[offset..offset + attr_length];
		match attr_type {
			// XOR-MAPPED wins over MAPPED; some NATs rewrite the plain form.
			ATTR_XOR_MAPPED_ADDRESS => {
				if let Some(addr) = parse_mapped_address(value, Some(&xor_key)) {
					return Ok(addr);
				}
			}
			ATTR_MAPPED_ADDRESS if fallback.is_none() => {
				fallback = parse_mapped_address(value, None);
			}
			_ => {}
		}

		offset += (attr_length + 3) & !3;
	}

	fallback.ok_or(StunError::InvalidResponse)
}

/// `xor_key` is the magic cookie followed by the transaction id; IPv4
/// addresses use only its first four bytes.
fn parse_mapped_address(data: &[u8], xor_key: Option<&[u8; 16]>) -> Option<SocketAddr> {
	if data.len() < 4 {
		return None;
	}

	let family = data[1];
	let mut port = u16::from_be_bytes([data[2], data[3]]);
	if xor_key.is_some() {
		port ^= (STUN_MAGIC_COOKIE >> 16) as u16;
	}

	match family {
		ADDR_FAMILY_IPV4 if data.len() >= 8 => {
			let mut ip_bytes = [data[4], data[5], data[6], data[7]];
			if let Some(key) = xor_key {
				for (b, k) in ip_bytes.iter_mut().zip(key) {
					*b ^= k;
				}
			}
			Some(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::from(ip_bytes), port)))
		}
		ADDR_FAMILY_IPV6 if data.len() >= 20 => {
			let mut ip_bytes: [u8; 16] = data[4..20].try_into().ok()?;
			if let Some(key) = xor_key {
				for (b, k) in ip_bytes.iter_mut().zip(key) {
					*b ^= k;
				}
			}
			Some(SocketAddr::V6(SocketAddrV6::new(
				Ipv6Addr::from(ip_bytes),
				port,
				0,
				0,
			)))
		}
		_ => None,
	}
}

/// Binds a UDP socket on `port` that can coexist with other sockets on the
/// same port, so reflector queries leave from the tunnel's listen port.
pub fn bind_reusable(port: u16) -> Result<UdpSocket> {
	let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
	socket.set_reuse_address(true)?;
	#[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
	socket.set_reuse_port(true)?;
	socket.set_nonblocking(true)?;
	let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
	socket.bind(&addr.into())?;

	let std_socket: std::net::UdpSocket = socket.into();
	Ok(UdpSocket::from_std(std_socket)?)
}

/// Sends one binding request to `server` and waits up to `wait` for the
/// matching response.
#[instrument(skip(socket), fields(server = %server.name))]
pub async fn binding_request(
	socket: &UdpSocket,
	server: &StunServer,
	wait: Duration,
) -> Result<SocketAddr> {
	let transaction_id = new_transaction_id();
	let request = build_binding_request(&transaction_id);

	socket.send_to(&request, server.addr).await?;

	let deadline = tokio::time::Instant::now() + wait;
	let mut buf = [0u8; 1024];
	loop {
		let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
		let (len, from) = match timeout(remaining, socket.recv_from(&mut buf)).await {
			Ok(res) => res?,
			Err(_) => {
				debug!("STUN request timed out");
				return Err(StunError::Timeout);
			}
		};

		if from != server.addr {
			warn!(%from, expected = %server.addr, "STUN response from unexpected source");
			continue;
		}

		match parse_binding_response(&buf[..len], &transaction_id) {
			Ok(addr) => {
				debug!(%addr, "reflector reported mapping");
				return Ok(addr);
			}
			// Late answer to an earlier transaction; keep waiting for ours.
			Err(StunError::InvalidResponse) => continue,
			Err(e) => return Err(e),
		}
	}
}

/// Resolves `host:port` reflector names, keeping the IPv4 address of each
/// since the tunnel listens on IPv4.
pub async fn resolve_stun_servers<S: AsRef<str>>(servers: &[S]) -> Vec<StunServer> {
	let mut resolved = Vec::new();

	for server in servers {
		let name = server.as_ref();
		match tokio::net::lookup_host(name).await {
			Ok(addrs) => {
				match addrs.into_iter().find(SocketAddr::is_ipv4) {
					Some(addr) => resolved.push(StunServer {
						name: name.to_string(),
						addr,
					}),
					None => warn!(server = name, "STUN server has no IPv4 address"),
				}
			}
			Err(e) => {
				warn!(server = name, error = %e, "failed to resolve STUN server");
			}
		}
	}

	resolved
}
