/*
 * @copyright (C) 2024 Ruslan Iusupov <https://github.com/rus0000>
 *
 * SPDX-License-Identifier: MIT
 */
use std::fmt;

use indexmap::IndexMap;

use crate::{
    packet_record::PacketRecord,
    sequence::{grt, wrap},
    tcp_flow::{FlowIdRegistry, TcpFlow},
    trace,
    trace_macro::check_trace_flow,
    tsval_switch::{purge_acknowledged_tsvals, register_tsval_switch, TsvalErrorRecord, TsvalSwitch},
};

/// Tracking state for one direction of a TCP session.
#[derive(Debug)]
pub struct RetransFlowState {
    /// Highest expected ack of new data sent so far. Segments not strictly
    /// past it are retransmissions.
    pub last_byte_sent: Option<u32>,
    /// Highest TSval seen on a payload-bearing segment of this flow.
    pub last_tsval: Option<u32>,
    /// TSval -> first segment sent under it. Purged once the peer echoes at or past the TSval.
    pub tsval_switches: IndexMap<u32, TsvalSwitch>,
    /// TSvals re-used by a full retransmission, same seq as the original. Value is the seq.
    pub err_tsval: IndexMap<u32, u32>,
    /// TSvals re-used by a partial retransmission, different seq. Value is the seq.
    pub partial_err_tsval: IndexMap<u32, u32>,
    /// Raw sequence number of the first segment seen in this flow. Diagnostics only.
    pub start_sequence_number: u32,
}

/// Detects retransmissions issued before their TSval could have changed.
///
/// Timestamps tick with wall-clock, not per segment. A genuine retransmission fires
/// after at least one RTO, so its TSval should have moved past the original segment's.
/// A retransmission that still carries the TSval of an outstanding segment means the
/// sender re-used a timestamp too early for an RTT estimator to trust the echo.
/// Re-using the TSval on the exact same segment is the strong signal, re-using it on a
/// different segment (partial retransmission) is the weak one.
///
/// * Create one instance per capture.
/// * Feed packets in capture order with [TooFastRetransAnalyzer::handle_packet()].
/// * Collect results with [TooFastRetransAnalyzer::into_report()].
#[derive(Debug)]
pub struct TooFastRetransAnalyzer<'a> {
    /// Stop processing packets whose capture index is beyond this cap.
    pub max_packets: Option<u64>,
    /// empty slice: trace all flows, positive values: specific flow Ids, u32::MAX: disable tracing.
    pub trace_flows: &'a [u32],
    /// IndexMap allows stable iteration order at the end of the capture.
    pub flow_states: IndexMap<TcpFlow, RetransFlowState>,
    pub flow_ids: FlowIdRegistry,

    /// Packets with timestamps processed, per flow.
    pub flow_packet_count: IndexMap<TcpFlow, u64>,
    /// Strong suspicions, counted for the flow that is expected to echo the re-used TSval.
    pub potential_errors: IndexMap<TcpFlow, u64>,
    /// Confirmed strong errors, counted for the acking flow.
    pub actual_errors: IndexMap<TcpFlow, u64>,
    /// Weak suspicions, counted for the flow that is expected to echo the re-used TSval.
    pub weak_potential_errors: IndexMap<TcpFlow, u64>,
    /// Confirmed weak errors, counted for the acking flow.
    pub weak_actual_errors: IndexMap<TcpFlow, u64>,
    /// Confirmed strong errors in capture order.
    pub errors: Vec<TsvalErrorRecord>,
    /// Confirmed weak errors in capture order.
    pub weak_errors: Vec<TsvalErrorRecord>,
}

/// Everything the too-fast-retransmission pass produced over one capture.
#[derive(Debug)]
pub struct TooFastRetransReport {
    pub flow_packet_count: IndexMap<TcpFlow, u64>,
    pub potential_errors: IndexMap<TcpFlow, u64>,
    pub actual_errors: IndexMap<TcpFlow, u64>,
    pub weak_potential_errors: IndexMap<TcpFlow, u64>,
    pub weak_actual_errors: IndexMap<TcpFlow, u64>,
    pub errors: Vec<TsvalErrorRecord>,
    pub weak_errors: Vec<TsvalErrorRecord>,
    /// Final per-flow state. Diagnostics and tests.
    pub flow_states: IndexMap<TcpFlow, RetransFlowState>,
}

impl fmt::Display for TooFastRetransReport {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let packets: u64 = self.flow_packet_count.values().sum();
        let potential: u64 = self.potential_errors.values().sum();
        let weak_potential: u64 = self.weak_potential_errors.values().sum();
        writeln!(formatter, "{} packets from {} flows processed", packets, self.flow_packet_count.len())?;
        writeln!(formatter, "{} potential and {} actual errors discovered", potential, self.errors.len())?;
        write!(
            formatter,
            "{} potential and {} actual weak errors discovered",
            weak_potential,
            self.weak_errors.len()
        )
    }
}

impl Default for TooFastRetransAnalyzer<'_> {
    fn default() -> Self {
        TooFastRetransAnalyzer::new(None, Some(&[u32::MAX]))
    }
}

impl<'a> TooFastRetransAnalyzer<'a> {
    /// # Arguments
    /// * `max_packets`: process the capture only up to this packet index, None: whole capture.
    /// * `trace_flows`: empty slice: trace all flows, list of values: specific flow Ids, None: disable tracing.
    pub fn new(max_packets: Option<u64>, trace_flows: Option<&'a [u32]>) -> Self {
        Self {
            max_packets,
            trace_flows: if trace_flows.is_some() { trace_flows.unwrap() } else { &[u32::MAX] },
            flow_states: IndexMap::<TcpFlow, RetransFlowState>::new(),
            flow_ids: FlowIdRegistry::default(),
            flow_packet_count: IndexMap::new(),
            potential_errors: IndexMap::new(),
            actual_errors: IndexMap::new(),
            weak_potential_errors: IndexMap::new(),
            weak_actual_errors: IndexMap::new(),
            errors: Vec::new(),
            weak_errors: Vec::new(),
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
        let reverse_flow = record.flow.get_reverse_flow();
        let flow_state = self.flow_states.entry(record.flow.clone()).or_insert_with(|| RetransFlowState {
            last_byte_sent: None,
            last_tsval: None,
            tsval_switches: IndexMap::new(),
            err_tsval: IndexMap::new(),
            partial_err_tsval: IndexMap::new(),
            start_sequence_number: record.sequence_number,
        });

        if record.payload_size > 0 {
            // New seq or retransmission?
            let is_new_data = match flow_state.last_byte_sent {
                None => true,
                Some(last_byte_sent) => grt(record.sequence_number, last_byte_sent),
            };
            if is_new_data {
                flow_state.last_byte_sent = Some(wrap(eack as i64 - 1));
            } else if let Some(switch) = flow_state.tsval_switches.get(&tsval) {
                // Retrans with same TSval as a currently outstanding TSval (potential error)
                if record.sequence_number == switch.seq {
                    flow_state.err_tsval.insert(tsval, record.sequence_number);
                    *self.potential_errors.entry(reverse_flow.clone()).or_insert(0) += 1;
                } else {
                    flow_state.partial_err_tsval.insert(tsval, record.sequence_number);
                    *self.weak_potential_errors.entry(reverse_flow.clone()).or_insert(0) += 1;
                }
                trace!(
                    "[{}]: {} Potential error: Retrans seq: {} - {}, TSval {}",
                    self.trace_flows,
                    flow_id,
                    record.index,
                    record.sequence_number,
                    eack,
                    tsval
                );
            }

            // new TSval. A retransmission can still register a fresh switch in the same pass.
            register_tsval_switch(
                &mut flow_state.last_tsval,
                &mut flow_state.tsval_switches,
                tsval,
                TsvalSwitch {
                    ack: record.ack_number,
                    seq: record.sequence_number,
                    eack,
                },
            );
        }

        // Check how TSecr match against reverse flow
        let Some(reverse_state) = self.flow_states.get_mut(&reverse_flow) else {
            return true;
        };

        // Delete state for all TSval that have already been matched
        purge_acknowledged_tsvals(&mut reverse_state.tsval_switches, tsecr);

        // Check if acking a retransmitted TSval. Strong and weak pools are independent,
        // each entry is consumed by its first matching echo.
        if reverse_state.err_tsval.shift_remove(&tsecr).is_some() {
            trace!("[{}]: {} ERROR: TSecr {}", self.trace_flows, flow_id, record.index, tsecr);
            *self.actual_errors.entry(record.flow.clone()).or_insert(0) += 1;
            self.errors.push(TsvalErrorRecord {
                packet_index: record.index,
                flow: record.flow.clone(),
                tsecr,
                ack: record.ack_number,
            });
        }
        if reverse_state.partial_err_tsval.shift_remove(&tsecr).is_some() {
            trace!("[{}]: {} ERROR (weak): TSecr {}", self.trace_flows, flow_id, record.index, tsecr);
            *self.weak_actual_errors.entry(record.flow.clone()).or_insert(0) += 1;
            self.weak_errors.push(TsvalErrorRecord {
                packet_index: record.index,
                flow: record.flow.clone(),
                tsecr,
                ack: record.ack_number,
            });
        }

        true
    }

    pub fn into_report(self) -> TooFastRetransReport {
        TooFastRetransReport {
            flow_packet_count: self.flow_packet_count,
            potential_errors: self.potential_errors,
            actual_errors: self.actual_errors,
            weak_potential_errors: self.weak_potential_errors,
            weak_actual_errors: self.weak_actual_errors,
            errors: self.errors,
            weak_errors: self.weak_errors,
            flow_states: self.flow_states,
        }
    }
}
