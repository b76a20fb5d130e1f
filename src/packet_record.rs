/*
 * @copyright (C) 2024 Ruslan Iusupov <https://github.com/rus0000>
 *
 * SPDX-License-Identifier: MIT
 */
use std::time::Duration;

use etherparse::{EtherType, Ethernet2HeaderSlice, IpNumber, Ipv4HeaderSlice, TcpHeaderSlice, TcpOptionElement};

use crate::tcp_flow::TcpFlow;

/// Normalized view of one captured TCP segment. Derived per packet, never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketRecord {
    pub flow: TcpFlow,
    pub sequence_number: u32,
    pub ack_number: u32,
    /// IP total length - IP header length - TCP header length.
    /// SYN and FIN count as 1 byte, they consume one sequence number.
    pub payload_size: u32,
    /// TCP Timestamp option value. None, when the option is absent.
    pub tsval: Option<u32>,
    /// TCP Timestamp option echo reply. None, when the option is absent.
    pub tsecr: Option<u32>,
    pub ack_flag: bool,
    /// Capture timestamp. Monotonic within one capture.
    pub time: Duration,
    /// Position of the packet in the capture. Diagnostics only.
    pub index: u64,
}

impl PacketRecord {
    /// Expected acknowledgment: one past the last byte of this segment's payload.
    pub fn expected_ack(&self) -> u32 {
        self.sequence_number.wrapping_add(self.payload_size)
    }
}

/// Walk Ethernet II -> IPv4 -> TCP headers of one captured frame.
/// Anything else is not an error, the frame is just not ours to analyze.
/// Assume no MACsec, no VLANs, no AH.
pub fn slice_tcp_frame<'a>(frame: &'a [u8]) -> Option<(Ipv4HeaderSlice<'a>, TcpHeaderSlice<'a>)> {
    let Ok(ethernet_header_slice) = Ethernet2HeaderSlice::from_slice(frame) else {
        return None;
    };
    if ethernet_header_slice.ether_type() != EtherType::IPV4 {
        return None;
    }
    let ethernet_payload = &frame[ethernet_header_slice.slice().len()..];

    let Ok(ipv4_header_slice) = Ipv4HeaderSlice::from_slice(ethernet_payload) else {
        return None;
    };
    if ipv4_header_slice.protocol() != IpNumber::TCP {
        return None;
    }
    if ethernet_payload.len() < ipv4_header_slice.total_len() as usize {
        return None;
    }
    let ipv4_payload = &ethernet_payload[ipv4_header_slice.slice().len()..ipv4_header_slice.total_len() as usize];

    let Ok(tcp_header_slice) = TcpHeaderSlice::from_slice(ipv4_payload) else {
        return None;
    };

    Some((ipv4_header_slice, tcp_header_slice))
}

/// TSval and TSecr from the TCP Timestamp option, if present.
/// Malformed option lists are treated same as an absent option.
pub fn get_tcp_timestamps(tcp_header_slice: &TcpHeaderSlice) -> Option<(u32, u32)> {
    for option in tcp_header_slice.options_iterator() {
        if let Ok(TcpOptionElement::Timestamp(tsval, tsecr)) = option {
            return Some((tsval, tsecr));
        }
    }
    None
}

/// Build a [PacketRecord] from decoded header slices.
/// * `time`: capture timestamp of the frame.
/// * `index`: position of the frame in the capture, counted by the caller.
///
/// Returns None when the IPv4 payload length is inconsistent with the TCP data offset.
/// Such a packet is skipped, not an error.
pub fn extract_packet_record(
    ipv4_header_slice: &Ipv4HeaderSlice,
    tcp_header_slice: &TcpHeaderSlice,
    time: Duration,
    index: u64,
) -> Option<PacketRecord> {
    let Ok(ip_payload_len) = ipv4_header_slice.payload_len() else {
        return None;
    };
    let mut payload_size = (ip_payload_len as u32).checked_sub(tcp_header_slice.data_offset() as u32 * 4)?;
    if tcp_header_slice.syn() || tcp_header_slice.fin() {
        payload_size += 1;
    }

    let timestamps = get_tcp_timestamps(tcp_header_slice);

    Some(PacketRecord {
        flow: TcpFlow {
            source_ipv4_address: ipv4_header_slice.source().into(),
            source_port: tcp_header_slice.source_port(),
            destination_ipv4_address: ipv4_header_slice.destination().into(),
            destination_port: tcp_header_slice.destination_port(),
        },
        sequence_number: tcp_header_slice.sequence_number(),
        ack_number: tcp_header_slice.acknowledgment_number(),
        payload_size,
        tsval: timestamps.map(|(tsval, _)| tsval),
        tsecr: timestamps.map(|(_, tsecr)| tsecr),
        ack_flag: tcp_header_slice.ack(),
        time,
        index,
    })
}
