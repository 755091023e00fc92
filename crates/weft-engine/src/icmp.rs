// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! ICMP echo encoding for reachability probes.

use std::net::Ipv4Addr;

pub const ICMPV4_ECHO_REPLY: u8 = 0;
pub const ICMPV4_ECHO_REQUEST: u8 = 8;
pub const ICMPV6_ECHO_REQUEST: u8 = 128;
pub const ICMPV6_ECHO_REPLY: u8 = 129;

const IPV4_HEADER_LEN: usize = 20;
const ICMP_HEADER_LEN: usize = 8;
const PROTO_ICMP: u8 = 1;
const DEFAULT_TTL: u8 = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Echo {
	pub kind: u8,
	pub ident: u16,
	pub seq: u16,
	pub payload: Vec<u8>,
}

/// Internet checksum (RFC 1071).
pub fn checksum(data: &[u8]) -> u16 {
	let mut sum: u32 = 0;
	let mut chunks = data.chunks_exact(2);
	for chunk in &mut chunks {
		sum += u32::from(u16::from_be_bytes([chunk[0], chunk[1]]));
	}
	if let [last] = chunks.remainder() {
		sum += u32::from(*last) << 8;
	}
	while sum >> 16 != 0 {
		sum = (sum & 0xffff) + (sum >> 16);
	}
	!(sum as u16)
}

/// Bare ICMP echo message, no IP header. The checksum field is filled for
/// ICMPv4; for ICMPv6 the kernel computes it.
pub fn build_echo(kind: u8, ident: u16, seq: u16, payload: &[u8]) -> Vec<u8> {
	let mut msg = Vec::with_capacity(ICMP_HEADER_LEN + payload.len());
	msg.push(kind);
	msg.push(0);
	msg.extend_from_slice(&[0, 0]);
	msg.extend_from_slice(&ident.to_be_bytes());
	msg.extend_from_slice(&seq.to_be_bytes());
	msg.extend_from_slice(payload);
	if kind == ICMPV4_ECHO_REQUEST || kind == ICMPV4_ECHO_REPLY {
		let sum = checksum(&msg);
		msg[2..4].copy_from_slice(&sum.to_be_bytes());
	}
	msg
}

pub fn parse_echo(msg: &[u8]) -> Option<Echo> {
	if msg.len() < ICMP_HEADER_LEN {
		return None;
	}
	let kind = msg[0];
	if !matches!(
		kind,
		ICMPV4_ECHO_REQUEST | ICMPV4_ECHO_REPLY | ICMPV6_ECHO_REQUEST | ICMPV6_ECHO_REPLY
	) {
		return None;
	}
	Some(Echo {
		kind,
		ident: u16::from_be_bytes([msg[4], msg[5]]),
		seq: u16::from_be_bytes([msg[6], msg[7]]),
		payload: msg[ICMP_HEADER_LEN..].to_vec(),
	})
}

/// Strips an IPv4 header if `buf` starts with one. Raw ICMPv4 sockets
/// deliver the header, datagram ICMP sockets do not.
pub fn strip_ipv4_header(buf: &[u8]) -> &[u8] {
	if buf.len() >= IPV4_HEADER_LEN && buf[0] >> 4 == 4 {
		let ihl = usize::from(buf[0] & 0x0f) * 4;
		if buf.len() >= ihl {
			return &buf[ihl..];
		}
	}
	buf
}

/// Full IPv4 packet carrying an ICMP echo, for writing into a tunnel.
pub fn build_ipv4_echo(
	src: Ipv4Addr,
	dst: Ipv4Addr,
	kind: u8,
	ident: u16,
	seq: u16,
	payload: &[u8],
) -> Vec<u8> {
	let icmp = build_echo(kind, ident, seq, payload);
	let total_len = (IPV4_HEADER_LEN + icmp.len()) as u16;

	let mut packet = Vec::with_capacity(usize::from(total_len));
	packet.push(0x45);
	packet.push(0);
	packet.extend_from_slice(&total_len.to_be_bytes());
	packet.extend_from_slice(&fastrand::u16(..).to_be_bytes());
	packet.extend_from_slice(&[0x40, 0x00]);
	packet.push(DEFAULT_TTL);
	packet.push(PROTO_ICMP);
	packet.extend_from_slice(&[0, 0]);
	packet.extend_from_slice(&src.octets());
	packet.extend_from_slice(&dst.octets());
	let sum = checksum(&packet[..IPV4_HEADER_LEN]);
	packet[10..12].copy_from_slice(&sum.to_be_bytes());
	packet.extend_from_slice(&icmp);
	packet
}

/// Source, destination and echo of an IPv4 ICMP echo packet.
pub fn parse_ipv4_echo(packet: &[u8]) -> Option<(Ipv4Addr, Ipv4Addr, Echo)> {
	if packet.len() < IPV4_HEADER_LEN || packet[0] >> 4 != 4 || packet[9] != PROTO_ICMP {
		return None;
	}
	let src = Ipv4Addr::new(packet[12], packet[13], packet[14], packet[15]);
	let dst = Ipv4Addr::new(packet[16], packet[17], packet[18], packet[19]);
	let echo = parse_echo(strip_ipv4_header(packet))?;
	Some((src, dst, echo))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn checksum_of_valid_message_is_zero() {
		let msg = build_echo(ICMPV4_ECHO_REQUEST, 0x1234, 7, b"weft");
		assert_eq!(checksum(&msg), 0);
	}

	#[test]
	fn checksum_handles_odd_length() {
		let msg = build_echo(ICMPV4_ECHO_REPLY, 1, 1, b"odd");
		assert_eq!(msg.len() % 2, 1);
		assert_eq!(checksum(&msg), 0);
	}

	#[test]
	fn ipv6_echo_leaves_checksum_to_kernel() {
		let msg = build_echo(ICMPV6_ECHO_REQUEST, 1, 2, b"");
		assert_eq!(&msg[2..4], &[0, 0]);
	}

	#[test]
	fn ipv4_packet_is_well_formed() {
		let src = Ipv4Addr::new(100, 64, 0, 1);
		let dst = Ipv4Addr::new(100, 64, 0, 2);
		let packet = build_ipv4_echo(src, dst, ICMPV4_ECHO_REQUEST, 9, 3, b"probe");

		assert_eq!(checksum(&packet[..20]), 0);
		assert_eq!(usize::from(u16::from_be_bytes([packet[2], packet[3]])), packet.len());

		let (s, d, echo) = parse_ipv4_echo(&packet).unwrap();
		assert_eq!((s, d), (src, dst));
		assert_eq!(echo.kind, ICMPV4_ECHO_REQUEST);
		assert_eq!((echo.ident, echo.seq), (9, 3));
		assert_eq!(echo.payload, b"probe");
	}

	#[test]
	fn strip_header_is_noop_for_bare_icmp() {
		let msg = build_echo(ICMPV4_ECHO_REPLY, 1, 1, b"x");
		assert_eq!(strip_ipv4_header(&msg), msg.as_slice());
	}

	#[test]
	fn non_echo_messages_are_ignored() {
		let mut msg = build_echo(ICMPV4_ECHO_REPLY, 1, 1, b"");
		msg[0] = 3;
		assert!(parse_echo(&msg).is_none());
	}
}
