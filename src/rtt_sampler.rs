/*
 * @copyright (C) 2024 Ruslan Iusupov <https://github.com/rus0000>
 *
 * SPDX-License-Identifier: MIT
 */
use std::fmt;
use std::time::Duration;

use indexmap::IndexMap;

use crate::{
    packet_record::PacketRecord,
    sequence::{geq, grt},
    tcp_flow::{FlowIdRegistry, TcpFlow},
    trace,
    trace_macro::check_trace_flow,
};

/// One not-yet-acknowledged outgoing segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutstandingSegment {
    pub seq: u32,
    /// seq + payload size. What the peer acks to confirm full receipt.
    pub eack: u32,
    pub retrans: bool,
    pub tsval: Option<u32>,
    /// This segment was the first one sent under its TSval.
    pub new_tsval: bool,
    /// Capture timestamp of the segment.
    pub time: Duration,
}

/// Tracking state for one direction of a TCP session.
#[derive(Debug)]
pub struct RttFlowState {
    /// Sent segments in capture order. Entries leave as soon as an ack covers them.
    /// A flow that never receives an ack grows for the duration of the run.
    pub outstanding_packets: Vec<OutstandingSegment>,
    /// Highest expected ack sent so far. Segments behind it are retransmissions.
    pub last_expected_ack: u32,
    /// Highest TSval seen on a payload-bearing segment of this flow.
    pub last_tsval: Option<u32>,
    /// Raw sequence number of the first segment seen in this flow. Diagnostics only.
    pub start_sequence_number: u32,
}

/// One RTT sample, produced by one acknowledgment that covered at least one
/// outstanding segment of the reverse flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RttSample {
    /// Capture timestamp of the acknowledgment.
    pub time: Duration,
    /// Flow of the acknowledgment, not of the measured segments.
    pub flow: TcpFlow,
    /// Ack time minus the latest acknowledged send time. A cumulative ack cannot
    /// tell which segment triggered it, so min and max bound the true RTT.
    pub min_rtt: Duration,
    /// Ack time minus the earliest acknowledged send time.
    pub max_rtt: Duration,
    /// Ack time minus the send time of the segment whose fresh TSval equals the
    /// echoed TSecr. The most precise estimate, when available.
    pub timestamp_rtt: Option<Duration>,
    /// Primary estimate, same as min_rtt.
    pub rtt: Duration,
    pub ack: u32,
    pub tsecr: Option<u32>,
    /// Some acknowledged segment was a retransmission. The sample is ambiguous,
    /// treat it with reduced confidence rather than discarding it.
    pub retrans: bool,
}

/// Matches outgoing segments against acknowledgments in the reverse direction
/// to produce RTT samples.
///
/// Works also without TCP timestamps, sequence-based matching alone then bounds
/// the RTT with `min_rtt` and `max_rtt`.
///
/// * Create one instance per capture.
/// * Feed packets in capture order with [RttSampler::handle_packet()].
/// * Collect results with [RttSampler::into_samples()] or [RttSampler::into_report()].
#[derive(Debug)]
pub struct RttSampler<'a> {
    /// Stop processing packets whose capture index is beyond this cap.
    pub max_packets: Option<u64>,
    /// empty slice: trace all flows, positive values: specific flow Ids, u32::MAX: disable tracing.
    pub trace_flows: &'a [u32],
    /// IndexMap allows stable iteration order at the end of the capture.
    pub flow_states: IndexMap<TcpFlow, RttFlowState>,
    pub flow_ids: FlowIdRegistry,

    /// Samples in capture order.
    pub samples: Vec<RttSample>,
}

/// Everything the RTT pass produced over one capture.
#[derive(Debug)]
pub struct RttReport {
    pub samples: Vec<RttSample>,
    /// Final per-flow state. Diagnostics and tests.
    pub flow_states: IndexMap<TcpFlow, RttFlowState>,
}

impl fmt::Display for RttReport {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{} RTT samples from {} flows", self.samples.len(), self.flow_states.len())
    }
}

impl Default for RttSampler<'_> {
    fn default() -> Self {
        RttSampler::new(None, Some(&[u32::MAX]))
    }
}

impl<'a> RttSampler<'a> {
    /// # Arguments
    /// * `max_packets`: process the capture only up to this packet index, None: whole capture.
    /// * `trace_flows`: empty slice: trace all flows, list of values: specific flow Ids, None: disable tracing.
    pub fn new(max_packets: Option<u64>, trace_flows: Option<&'a [u32]>) -> Self {
        Self {
            max_packets,
            trace_flows: if trace_flows.is_some() { trace_flows.unwrap() } else { &[u32::MAX] },
            flow_states: IndexMap::<TcpFlow, RttFlowState>::new(),
            flow_ids: FlowIdRegistry::default(),
            samples: Vec::new(),
        }
    }

    /// Main function. Feed one packet in capture order.
    /// Returns false once `max_packets` is exhausted, so a drive loop can break.
    pub fn handle_packet(&mut self, record: &PacketRecord) -> bool {
        if let Some(max_packets) = self.max_packets {
            if record.index > max_packets {
                return false;
            }
        }

        let flow_id = self.flow_ids.get_flow_id(&record.flow);
        let eack = record.expected_ack();
        let flow_state = self.flow_states.entry(record.flow.clone()).or_insert_with(|| RttFlowState {
            outstanding_packets: Vec::new(),
            last_expected_ack: record.sequence_number,
            last_tsval: None,
            start_sequence_number: record.sequence_number,
        });

        // Add outgoing packets. SYN and FIN add 1 to the payload, so they are also included.
        if record.payload_size > 0 {
            // Detect retrans
            let retrans = if geq(record.sequence_number, flow_state.last_expected_ack) {
                flow_state.last_expected_ack = eack;
                false
            } else {
                true
            };

            // Detect TSval shift
            let mut new_tsval = false;
            if let Some(tsval) = record.tsval {
                let is_newer = match flow_state.last_tsval {
                    None => true,
                    Some(last_tsval) => grt(tsval, last_tsval),
                };
                if is_newer {
                    flow_state.last_tsval = Some(tsval);
                    new_tsval = true;
                }
            }

            flow_state.outstanding_packets.push(OutstandingSegment {
                seq: record.sequence_number,
                eack,
                retrans,
                tsval: record.tsval,
                new_tsval,
                time: record.time,
            });
            trace!(
                "[{}]: {} Adding - seq: {}, eack: {}, tsval: {:?}",
                self.trace_flows,
                flow_id,
                record.index,
                record.sequence_number,
                eack,
                record.tsval
            );
        }

        // Match the ACK against previous packets in the reverse direction
        let reverse_flow = record.flow.get_reverse_flow();
        let Some(reverse_state) = self.flow_states.get_mut(&reverse_flow) else {
            return true;
        };
        if !record.ack_flag {
            return true;
        }

        // Find packets that are acked and remove them from the outstanding list
        let mut acknowledged = Vec::new();
        reverse_state.outstanding_packets.retain(|segment| {
            if geq(record.ack_number, segment.eack) {
                acknowledged.push(*segment);
                false
            } else {
                true
            }
        });
        if acknowledged.is_empty() {
            return true;
        }

        let mut earliest_send_time = acknowledged[0].time;
        let mut latest_send_time = acknowledged[0].time;
        for segment in &acknowledged {
            trace!(
                "[{}]: {} Match against - ack: {}, seq: {}",
                self.trace_flows,
                flow_id,
                record.index,
                record.ack_number,
                segment.seq
            );
            earliest_send_time = earliest_send_time.min(segment.time);
            latest_send_time = latest_send_time.max(segment.time);
        }

        // Capture timestamps are monotonic, an earlier ack would mean a damaged capture.
        // Clamp to zero and keep going, partial results are still usable.
        let min_rtt = match record.time.checked_sub(latest_send_time) {
            Some(rtt) => rtt,
            None => {
                trace!(
                    "[{}]: {} Ack earlier than matched segment, clamping RTT to zero",
                    self.trace_flows,
                    flow_id,
                    record.index
                );
                Duration::ZERO
            }
        };
        let max_rtt = record.time.saturating_sub(earliest_send_time);

        // RTT based on the TCP timestamp echo, if available
        let mut timestamp_rtt = None;
        if let Some(tsecr) = record.tsecr {
            for segment in &acknowledged {
                if segment.new_tsval && segment.tsval == Some(tsecr) {
                    timestamp_rtt = record.time.checked_sub(segment.time);
                    break;
                }
            }
        }

        self.samples.push(RttSample {
            time: record.time,
            flow: record.flow.clone(),
            min_rtt,
            max_rtt,
            timestamp_rtt,
            rtt: min_rtt,
            ack: record.ack_number,
            tsecr: record.tsecr,
            retrans: acknowledged.iter().any(|segment| segment.retrans),
        });
        trace!(
            "[{}]: {} RTT - min_rtt: {:?}, max_rtt: {:?}",
            self.trace_flows,
            flow_id,
            record.index,
            min_rtt,
            max_rtt
        );

        true
    }

    /// All samples in capture order, or None when the capture yielded no
    /// acknowledgment matches. An empty capture is not an error.
    pub fn into_samples(self) -> Option<Vec<RttSample>> {
        if self.samples.is_empty() {
            None
        } else {
            Some(self.samples)
        }
    }

    pub fn into_report(self) -> RttReport {
        RttReport {
            samples: self.samples,
            flow_states: self.flow_states,
        }
    }
}
