/*
 * @copyright (C) 2024 Ruslan Iusupov <https://github.com/rus0000>
 *
 * SPDX-License-Identifier: MIT
 */
use std::fmt;

use indexmap::IndexMap;

use crate::{
    packet_record::PacketRecord,
    sequence::{geq, grt},
    tcp_flow::{FlowIdRegistry, TcpFlow},
    trace,
    trace_macro::check_trace_flow,
    tsval_switch::{purge_acknowledged_tsvals, register_tsval_switch, TsvalErrorRecord, TsvalSwitch},
};

/// Tracking state for one direction of a TCP session.
#[derive(Debug)]
pub struct UnsyncTsvalFlowState {
    /// Highest TSval seen on a payload-bearing segment of this flow.
    pub last_tsval: Option<u32>,
    /// TSval -> first segment sent under it. Purged once the peer echoes at or past the TSval.
    pub tsval_switches: IndexMap<u32, TsvalSwitch>,
    /// TSvals suspected of inflating the peer's RTT estimate. Value is the ack that flagged them.
    /// Consumed when the suspicious TSval is actually echoed.
    pub inflated_rtt_tsval: IndexMap<u32, u32>,
    /// Raw sequence number of the first segment seen in this flow. Diagnostics only.
    pub start_sequence_number: u32,
}

/// Detects acknowledgments that confirm data sent under a stale TSval.
///
/// A sender that keeps an old TSval on a segment while the peer already echoed a newer
/// one makes timestamp-based RTT estimators attribute the ack to the wrong send time.
/// The detector flags the TSval as suspicious, when an ack confirms data recorded under
/// a TSval older than the echoed one, and confirms the error once that stale TSval is
/// actually echoed back.
///
/// * Create one instance per capture.
/// * Feed packets in capture order with [UnsyncTsvalAnalyzer::handle_packet()].
/// * Collect results with [UnsyncTsvalAnalyzer::into_report()].
#[derive(Debug)]
pub struct UnsyncTsvalAnalyzer<'a> {
    /// Stop processing packets whose capture index is beyond this cap.
    pub max_packets: Option<u64>,
    /// empty slice: trace all flows, positive values: specific flow Ids, u32::MAX: disable tracing.
    pub trace_flows: &'a [u32],
    /// IndexMap allows stable iteration order at the end of the capture.
    pub flow_states: IndexMap<TcpFlow, UnsyncTsvalFlowState>,
    pub flow_ids: FlowIdRegistry,

    /// Packets with timestamps processed, per flow.
    pub flow_packet_count: IndexMap<TcpFlow, u64>,
    /// TSval switches recorded, per flow.
    pub unique_tsvals: IndexMap<TcpFlow, u64>,
    /// Suspicious-TSval observations, counted for the acking flow.
    pub potential_errors: IndexMap<TcpFlow, u64>,
    /// Confirmed stale-TSval echoes, counted for the acking flow.
    pub actual_errors: IndexMap<TcpFlow, u64>,
    /// Confirmed errors in capture order.
    pub errors: Vec<TsvalErrorRecord>,
}

/// Everything the unsync-TSval pass produced over one capture.
#[derive(Debug)]
pub struct UnsyncTsvalReport {
    pub flow_packet_count: IndexMap<TcpFlow, u64>,
    pub unique_tsvals: IndexMap<TcpFlow, u64>,
    pub potential_errors: IndexMap<TcpFlow, u64>,
    pub actual_errors: IndexMap<TcpFlow, u64>,
    pub errors: Vec<TsvalErrorRecord>,
    /// Final per-flow state. Diagnostics and tests.
    pub flow_states: IndexMap<TcpFlow, UnsyncTsvalFlowState>,
}

impl fmt::Display for UnsyncTsvalReport {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let packets: u64 = self.flow_packet_count.values().sum();
        let potential: u64 = self.potential_errors.values().sum();
        writeln!(formatter, "{} packets from {} flows processed", packets, self.flow_packet_count.len())?;
        write!(formatter, "{} potential and {} actual errors discovered", potential, self.errors.len())
    }
}

impl Default for UnsyncTsvalAnalyzer<'_> {
    fn default() -> Self {
        UnsyncTsvalAnalyzer::new(None, Some(&[u32::MAX]))
    }
}

impl<'a> UnsyncTsvalAnalyzer<'a> {
    /// # Arguments
    /// * `max_packets`: process the capture only up to this packet index, None: whole capture.
    /// * `trace_flows`: empty slice: trace all flows, list of values: specific flow Ids, None: disable tracing.
    pub fn new(max_packets: Option<u64>, trace_flows: Option<&'a [u32]>) -> Self {
        Self {
            max_packets,
            trace_flows: if trace_flows.is_some() { trace_flows.unwrap() } else { &[u32::MAX] },
            flow_states: IndexMap::<TcpFlow, UnsyncTsvalFlowState>::new(),
            flow_ids: FlowIdRegistry::default(),
            flow_packet_count: IndexMap::new(),
            unique_tsvals: IndexMap::new(),
            potential_errors: IndexMap::new(),
            actual_errors: IndexMap::new(),
            errors: Vec::new(),
        }
    }

    /// Main function. Feed one packet in capture order.
    /// Returns false once `max_packets` is exhausted, so a drive loop can break.
    /// Packets without the TCP Timestamp option are skipped.
    pub fn handle_packet(&mut self, record: &PacketRecord) -> bool {
        if let Some(max_packets) = self.max_packets {
            if record.index > max_packets {
                return false;
            }
        }
        let (Some(tsval), Some(tsecr)) = (record.tsval, record.tsecr) else {
            return true;
        };

        let flow_id = self.flow_ids.get_flow_id(&record.flow);
        *self.flow_packet_count.entry(record.flow.clone()).or_insert(0) += 1;

        let eack = record.expected_ack();
        let flow_state = self.flow_states.entry(record.flow.clone()).or_insert_with(|| UnsyncTsvalFlowState {
            last_tsval: None,
            tsval_switches: IndexMap::new(),
            inflated_rtt_tsval: IndexMap::new(),
            start_sequence_number: record.sequence_number,
        });

        // new TSval
        if record.payload_size > 0
            && register_tsval_switch(
                &mut flow_state.last_tsval,
                &mut flow_state.tsval_switches,
                tsval,
                TsvalSwitch {
                    ack: record.ack_number,
                    seq: record.sequence_number,
                    eack,
                },
            )
        {
            *self.unique_tsvals.entry(record.flow.clone()).or_insert(0) += 1;
        }

        // Check how TSecr match against reverse flow
        let reverse_flow = record.flow.get_reverse_flow();
        let Some(reverse_state) = self.flow_states.get_mut(&reverse_flow) else {
            return true;
        };

        // Delete state for all TSval that have already been matched
        purge_acknowledged_tsvals(&mut reverse_state.tsval_switches, tsecr);

        // Check if acking old TSval (potential error)
        let UnsyncTsvalFlowState {
            tsval_switches,
            inflated_rtt_tsval,
            ..
        } = reverse_state;
        for (&reverse_tsval, switch) in tsval_switches.iter() {
            if grt(reverse_tsval, tsecr) && geq(record.ack_number, switch.eack) {
                trace!(
                    "[{}]: {} Potential error: TSecr {} < {} and ACK {} >= {}",
                    self.trace_flows,
                    flow_id,
                    record.index,
                    tsecr,
                    reverse_tsval,
                    record.ack_number,
                    switch.eack
                );
                *self.potential_errors.entry(record.flow.clone()).or_insert(0) += 1;
                inflated_rtt_tsval.insert(reverse_tsval, record.ack_number);
            }
        }

        // Check if troublesome TSecr is seen (actual error)
        if inflated_rtt_tsval.shift_remove(&tsecr).is_some() {
            trace!("[{}]: {} ERROR: TSecr {}", self.trace_flows, flow_id, record.index, tsecr);
            *self.actual_errors.entry(record.flow.clone()).or_insert(0) += 1;
            self.errors.push(TsvalErrorRecord {
                packet_index: record.index,
                flow: record.flow.clone(),
                tsecr,
                ack: record.ack_number,
            });
        }

        true
    }

    pub fn into_report(self) -> UnsyncTsvalReport {
        UnsyncTsvalReport {
            flow_packet_count: self.flow_packet_count,
            unique_tsvals: self.unique_tsvals,
            potential_errors: self.potential_errors,
            actual_errors: self.actual_errors,
            errors: self.errors,
            flow_states: self.flow_states,
        }
    }
}
