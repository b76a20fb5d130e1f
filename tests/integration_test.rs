/*
 * @copyright (C) 2024 Ruslan Iusupov <https://github.com/rus0000>
 *
 * SPDX-License-Identifier: MIT
 */
use std::time::Duration;

use etherparse::{EtherType, Ethernet2Header, IpNumber, Ipv4Header, Ipv4HeaderSlice, TcpHeader, TcpHeaderSlice, TcpOptionElement};
// Rng is used only for TCP payload, it will not introduce tests flakiness
use rand::Rng;

use pcap_rtt_analyzer::{
    extract_packet_record, slice_tcp_frame, PacketRecord, RttSampler, TooFastRetransAnalyzer, TsvalErrorRecord, UnsyncTsvalAnalyzer,
};

const CLIENT: ([u8; 4], u16) = ([192, 168, 1, 1], 1000);
const SERVER: ([u8; 4], u16) = ([192, 168, 1, 2], 80);

fn generate_headers_buffers(
    source: ([u8; 4], u16),
    destination: ([u8; 4], u16),
    sequence_number: u32,
    ack_number: u32,
    tcp_payload: &[u8],
    timestamps: Option<(u32, u32)>,
) -> (Vec<u8>, Vec<u8>) {
    let mut tcp_header = TcpHeader::new(source.1, destination.1, sequence_number, 65535);
    tcp_header.acknowledgment_number = ack_number;
    tcp_header.ack = true;
    if let Some((tsval, tsecr)) = timestamps {
        tcp_header.set_options(&[TcpOptionElement::Timestamp(tsval, tsecr)]).unwrap();
    }
    let mut tcp_header_buf = Vec::new();
    tcp_header.write(&mut tcp_header_buf).unwrap();
    tcp_header_buf.extend_from_slice(tcp_payload);

    let ipv4_header = Ipv4Header::new(tcp_header_buf.len() as u16, 64, IpNumber::TCP, source.0, destination.0).unwrap();
    let mut ipv4_header_buf = Vec::new();
    ipv4_header.write(&mut ipv4_header_buf).unwrap();

    (ipv4_header_buf, tcp_header_buf)
}

fn make_record(ipv4_header_buf: &[u8], tcp_header_buf: &[u8], time_millis: u64, index: u64) -> PacketRecord {
    let ipv4_header_slice = Ipv4HeaderSlice::from_slice(ipv4_header_buf).unwrap();
    let tcp_header_slice = TcpHeaderSlice::from_slice(tcp_header_buf).unwrap();
    extract_packet_record(&ipv4_header_slice, &tcp_header_slice, Duration::from_millis(time_millis), index).unwrap()
}

fn random_payload(size: usize) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    (0..size).map(|_| rng.gen::<u8>()).collect()
}

fn data_segment(
    source: ([u8; 4], u16),
    destination: ([u8; 4], u16),
    sequence_number: u32,
    ack_number: u32,
    payload_size: usize,
    timestamps: Option<(u32, u32)>,
    time_millis: u64,
    index: u64,
) -> PacketRecord {
    let (ipv4_header_buf, tcp_header_buf) =
        generate_headers_buffers(source, destination, sequence_number, ack_number, &random_payload(payload_size), timestamps);
    make_record(&ipv4_header_buf, &tcp_header_buf, time_millis, index)
}

#[test]
fn test_extractor_computes_payload_and_timestamps() {
    let record = data_segment(CLIENT, SERVER, 1000, 1, 50, Some((100, 5)), 0, 7);

    assert_eq!(record.flow.source_ipv4_address.octets(), CLIENT.0);
    assert_eq!(record.flow.source_port, CLIENT.1);
    assert_eq!(record.flow.destination_ipv4_address.octets(), SERVER.0);
    assert_eq!(record.flow.destination_port, SERVER.1);
    assert_eq!(record.sequence_number, 1000);
    assert_eq!(record.ack_number, 1);
    assert_eq!(record.payload_size, 50);
    assert_eq!(record.expected_ack(), 1050);
    assert_eq!(record.tsval, Some(100));
    assert_eq!(record.tsecr, Some(5));
    assert!(record.ack_flag);
    assert_eq!(record.index, 7);

    let bare = data_segment(CLIENT, SERVER, 1000, 1, 50, None, 0, 8);
    assert_eq!(bare.tsval, None);
    assert_eq!(bare.tsecr, None);
}

#[test]
fn test_extractor_counts_syn_as_one_byte() {
    let mut tcp_header = TcpHeader::new(CLIENT.1, SERVER.1, 1000, 65535);
    tcp_header.syn = true;
    let mut tcp_header_buf = Vec::new();
    tcp_header.write(&mut tcp_header_buf).unwrap();
    let ipv4_header = Ipv4Header::new(tcp_header_buf.len() as u16, 64, IpNumber::TCP, CLIENT.0, SERVER.0).unwrap();
    let mut ipv4_header_buf = Vec::new();
    ipv4_header.write(&mut ipv4_header_buf).unwrap();

    let record = make_record(&ipv4_header_buf, &tcp_header_buf, 0, 0);
    // SYN consumes one sequence number even without payload
    assert_eq!(record.payload_size, 1);
    assert_eq!(record.expected_ack(), 1001);
}

#[test]
fn test_slice_tcp_frame_filters_non_tcp() {
    let (ipv4_header_buf, tcp_header_buf) = generate_headers_buffers(CLIENT, SERVER, 1000, 1, &random_payload(10), Some((100, 5)));
    let ethernet_header = Ethernet2Header {
        destination: [2, 0, 0, 0, 0, 2],
        source: [2, 0, 0, 0, 0, 1],
        ether_type: EtherType::IPV4,
    };
    let mut frame = Vec::new();
    ethernet_header.write(&mut frame).unwrap();
    frame.extend_from_slice(&ipv4_header_buf);
    frame.extend_from_slice(&tcp_header_buf);

    let (ipv4_header_slice, tcp_header_slice) = slice_tcp_frame(&frame).unwrap();
    let record = extract_packet_record(&ipv4_header_slice, &tcp_header_slice, Duration::ZERO, 0).unwrap();
    assert_eq!(record.payload_size, 10);
    assert_eq!(record.tsval, Some(100));

    // Same frame with a non-IPv4 ether type
    let mut arp_frame = frame.clone();
    let ethernet_header = Ethernet2Header {
        destination: [2, 0, 0, 0, 0, 2],
        source: [2, 0, 0, 0, 0, 1],
        ether_type: EtherType::ARP,
    };
    let mut ethernet_header_buf = Vec::new();
    ethernet_header.write(&mut ethernet_header_buf).unwrap();
    arp_frame[..ethernet_header_buf.len()].copy_from_slice(&ethernet_header_buf);
    assert!(slice_tcp_frame(&arp_frame).is_none());

    // UDP inside IPv4
    let udp_ipv4_header = Ipv4Header::new(20, 64, IpNumber::UDP, CLIENT.0, SERVER.0).unwrap();
    let mut udp_frame = Vec::new();
    Ethernet2Header {
        destination: [2, 0, 0, 0, 0, 2],
        source: [2, 0, 0, 0, 0, 1],
        ether_type: EtherType::IPV4,
    }
    .write(&mut udp_frame)
    .unwrap();
    udp_ipv4_header.write(&mut udp_frame).unwrap();
    udp_frame.extend_from_slice(&[0u8; 20]);
    assert!(slice_tcp_frame(&udp_frame).is_none());
}

#[test]
fn test_cumulative_ack_bounds_rtt_sample() {
    let mut rtt_sampler = RttSampler::new(None, Some(&[u32::MAX]));

    rtt_sampler.handle_packet(&data_segment(CLIENT, SERVER, 1000, 1, 50, Some((100, 1)), 0, 0));
    rtt_sampler.handle_packet(&data_segment(CLIENT, SERVER, 1050, 1, 50, Some((100, 1)), 10, 1));
    rtt_sampler.handle_packet(&data_segment(SERVER, CLIENT, 1, 1100, 0, Some((900, 100)), 50, 2));

    let samples = rtt_sampler.into_samples().unwrap();
    assert_eq!(samples.len(), 1);
    assert_eq!(samples[0].min_rtt, Duration::from_millis(40));
    assert_eq!(samples[0].max_rtt, Duration::from_millis(50));
    assert_eq!(samples[0].rtt, Duration::from_millis(40));
    assert_eq!(samples[0].ack, 1100);
    assert!(!samples[0].retrans);
}

#[test]
fn test_rtt_sample_then_too_fast_retransmission() {
    // RTT view: one segment, one clean ack echoing its TSval
    let mut rtt_sampler = RttSampler::new(None, Some(&[u32::MAX]));
    let sent = data_segment(CLIENT, SERVER, 1000, 1, 50, Some((100, 1)), 0, 0);
    let client_flow = sent.flow.clone();
    let server_flow = client_flow.get_reverse_flow();
    rtt_sampler.handle_packet(&sent);
    rtt_sampler.handle_packet(&data_segment(SERVER, CLIENT, 1, 1050, 0, Some((900, 100)), 20, 1));

    let samples = rtt_sampler.into_samples().unwrap();
    assert_eq!(samples.len(), 1);
    assert_eq!(samples[0].rtt, Duration::from_millis(20));
    assert_eq!(samples[0].timestamp_rtt, Some(Duration::from_millis(20)));
    assert!(!samples[0].retrans);

    // Retransmission view: the same segment fires again while its TSval is
    // still outstanding. An echo purges the switch, so the retransmission
    // must come before any ack of it.
    let mut retrans_analyzer = TooFastRetransAnalyzer::new(None, Some(&[u32::MAX]));
    retrans_analyzer.handle_packet(&sent);
    let retransmission = data_segment(CLIENT, SERVER, 1000, 1, 50, Some((100, 1)), 5, 1);
    retrans_analyzer.handle_packet(&retransmission);

    assert_eq!(retrans_analyzer.flow_states[&client_flow].err_tsval.get(&100), Some(&1000));
    assert_eq!(retrans_analyzer.potential_errors.values().sum::<u64>(), 1);
    assert!(retrans_analyzer.errors.is_empty());

    // The echo of TSval 100 confirms the error
    let late_ack = data_segment(SERVER, CLIENT, 1, 1050, 0, Some((910, 100)), 60, 2);
    retrans_analyzer.handle_packet(&late_ack);
    let report = retrans_analyzer.into_report();
    assert_eq!(
        report.errors,
        vec![TsvalErrorRecord {
            packet_index: 2,
            flow: server_flow,
            tsecr: 100,
            ack: 1050,
        }]
    );
}

#[test]
fn test_unsync_tsval_detection_end_to_end() {
    let mut analyzer = UnsyncTsvalAnalyzer::new(None, Some(&[u32::MAX]));

    analyzer.handle_packet(&data_segment(CLIENT, SERVER, 1000, 1, 50, Some((100, 1)), 0, 0));
    analyzer.handle_packet(&data_segment(CLIENT, SERVER, 1050, 1, 50, Some((110, 1)), 10, 1));
    // Confirms data sent under TSval 110, but still echoes 100
    analyzer.handle_packet(&data_segment(SERVER, CLIENT, 1, 1100, 0, Some((900, 100)), 20, 2));
    // The stale TSval 110 arrives in an echo afterwards
    analyzer.handle_packet(&data_segment(SERVER, CLIENT, 1, 1100, 0, Some((910, 110)), 30, 3));

    let report = analyzer.into_report();
    assert_eq!(report.potential_errors.values().sum::<u64>(), 1);
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.errors[0].tsecr, 110);
    assert_eq!(report.errors[0].packet_index, 3);

    // Purge invariant: no switch at or below the last echoed TSval survives
    for flow_state in report.flow_states.values() {
        for &tsval in flow_state.tsval_switches.keys() {
            assert!(pcap_rtt_analyzer::sequence::grt(tsval, 110));
        }
    }
}

#[test]
fn test_detectors_are_deterministic_on_replay() {
    let records = vec![
        data_segment(CLIENT, SERVER, 1000, 1, 50, Some((100, 1)), 0, 0),
        data_segment(CLIENT, SERVER, 1050, 1, 50, Some((110, 1)), 10, 1),
        data_segment(SERVER, CLIENT, 1, 1100, 0, Some((900, 100)), 20, 2),
        data_segment(CLIENT, SERVER, 1000, 1, 50, Some((110, 900)), 25, 3),
        data_segment(SERVER, CLIENT, 1, 1100, 0, Some((910, 110)), 30, 4),
        data_segment(CLIENT, SERVER, 1100, 1, 50, Some((120, 910)), 40, 5),
        data_segment(SERVER, CLIENT, 1, 1150, 0, Some((920, 120)), 60, 6),
    ];

    let run_all = |records: &[PacketRecord]| {
        let mut unsync_tsval_analyzer = UnsyncTsvalAnalyzer::new(None, Some(&[u32::MAX]));
        let mut retrans_analyzer = TooFastRetransAnalyzer::new(None, Some(&[u32::MAX]));
        let mut rtt_sampler = RttSampler::new(None, Some(&[u32::MAX]));
        for record in records {
            unsync_tsval_analyzer.handle_packet(record);
            retrans_analyzer.handle_packet(record);
            rtt_sampler.handle_packet(record);
        }
        (
            format!("{:?}", unsync_tsval_analyzer.into_report()),
            format!("{:?}", retrans_analyzer.into_report()),
            format!("{:?}", rtt_sampler.into_report()),
        )
    };

    assert_eq!(run_all(&records), run_all(&records));
}

#[test]
fn test_report_summaries_render() {
    let mut analyzer = TooFastRetransAnalyzer::new(None, Some(&[u32::MAX]));
    analyzer.handle_packet(&data_segment(CLIENT, SERVER, 1000, 1, 50, Some((100, 1)), 0, 0));
    analyzer.handle_packet(&data_segment(SERVER, CLIENT, 1, 1050, 0, Some((900, 100)), 20, 1));

    let summary = analyzer.into_report().to_string();
    assert!(summary.contains("2 packets from 2 flows processed"));
    assert!(summary.contains("0 potential and 0 actual errors discovered"));
    assert!(summary.contains("weak errors discovered"));
}

#[test]
fn test_max_packets_truncation_is_safe() {
    let mut rtt_sampler = RttSampler::new(Some(1), Some(&[u32::MAX]));

    assert!(rtt_sampler.handle_packet(&data_segment(CLIENT, SERVER, 1000, 1, 50, Some((100, 1)), 0, 0)));
    assert!(rtt_sampler.handle_packet(&data_segment(CLIENT, SERVER, 1050, 1, 50, Some((100, 1)), 10, 1)));
    // The cap is reached, the rest of the capture is ignored
    assert!(!rtt_sampler.handle_packet(&data_segment(SERVER, CLIENT, 1, 1100, 0, Some((900, 100)), 50, 2)));

    // Partial state is simply discarded with the sampler, unmatched segments are no error
    assert!(rtt_sampler.into_samples().is_none());
}
