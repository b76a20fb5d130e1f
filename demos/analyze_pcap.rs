/*
 * @copyright (C) 2024 Ruslan Iusupov <https://github.com/rus0000>
 *
 * SPDX-License-Identifier: MIT
 */
use std::fs::File;
use std::io::BufReader;
use std::time::{Duration, UNIX_EPOCH};

use rpcap::read::PcapReader;

use pcap_rtt_analyzer::{extract_packet_record, slice_tcp_frame, RttSampler, TooFastRetransAnalyzer, UnsyncTsvalAnalyzer};

fn main() {
    let pcap_file_name = std::env::args().nth(1).expect("Expect path to PCAP file");

    let buf_reader = BufReader::new(File::open(pcap_file_name).expect("Cannot read file"));
    let (_, mut pcap_reader) = PcapReader::new(buf_reader).expect("Cannot read pcap");

    // Pass Some(&[]) to any of them to trace all flows of that pass.
    let mut unsync_tsval_analyzer = UnsyncTsvalAnalyzer::new(None, Some(&[u32::MAX]));
    let mut too_fast_retrans_analyzer = TooFastRetransAnalyzer::new(None, Some(&[u32::MAX]));
    let mut rtt_sampler = RttSampler::new(None, Some(&[u32::MAX]));

    let mut packet_index: u64 = 0;
    while let Some(captured_packet) = pcap_reader.next().expect("Cannot read next packet") {
        let index = packet_index;
        packet_index += 1;

        let Some((ipv4_header_slice, tcp_header_slice)) = slice_tcp_frame(captured_packet.data) else {
            continue;
        };
        let time = captured_packet.time.duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO);
        let Some(record) = extract_packet_record(&ipv4_header_slice, &tcp_header_slice, time, index) else {
            continue;
        };

        // Three independent passes over the same capture. Each keeps its own per-flow state,
        // feeding them from one read loop is equivalent to three reads.
        let mut keep_processing = unsync_tsval_analyzer.handle_packet(&record);
        keep_processing &= too_fast_retrans_analyzer.handle_packet(&record);
        keep_processing &= rtt_sampler.handle_packet(&record);
        if !keep_processing {
            break;
        }
    }

    println!("== Unsynchronized TSval updates ==");
    let unsync_tsval_report = unsync_tsval_analyzer.into_report();
    println!("{}", unsync_tsval_report);
    for error in &unsync_tsval_report.errors {
        println!("packet {}: flow {}, TSecr {}, ack {}", error.packet_index, error.flow, error.tsecr, error.ack);
    }

    println!("== Too fast retransmissions ==");
    let too_fast_retrans_report = too_fast_retrans_analyzer.into_report();
    println!("{}", too_fast_retrans_report);
    for error in &too_fast_retrans_report.errors {
        println!("packet {}: flow {}, TSecr {}, ack {}", error.packet_index, error.flow, error.tsecr, error.ack);
    }

    println!("== RTT samples ==");
    match rtt_sampler.into_samples() {
        Some(samples) => {
            for sample in &samples {
                println!(
                    "{:?}: flow {}, rtt {:?}, min {:?}, max {:?}, timestamp {:?}, retrans {}",
                    sample.time, sample.flow, sample.rtt, sample.min_rtt, sample.max_rtt, sample.timestamp_rtt, sample.retrans,
                );
            }
            println!("{} RTT samples", samples.len());
        }
        None => println!("No RTT samples, capture contains no acknowledgment matches"),
    }
}
