/*
 * @copyright (C) 2024 Ruslan Iusupov <https://github.com/rus0000>
 *
 * SPDX-License-Identifier: MIT
 */
use indexmap::IndexMap;

use crate::sequence::{geq, grt};
use crate::tcp_flow::TcpFlow;

/// Summary of the first outgoing segment sent under a given TSval.
/// Keyed by that TSval in the per-flow switch map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TsvalSwitch {
    pub ack: u32,
    pub seq: u32,
    /// seq + payload size. What the peer acks to confirm full receipt.
    pub eack: u32,
}

/// One confirmed timestamp error. The packet at `packet_index` on `flow`
/// echoed a TSecr that was flagged as suspicious earlier in the capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TsvalErrorRecord {
    pub packet_index: u64,
    pub flow: TcpFlow,
    pub tsecr: u32,
    pub ack: u32,
}

/// Record a TSval switch, when `tsval` is strictly newer than `last_tsval`.
/// The first segment under a TSval defines the switch, later segments under
/// the same TSval never overwrite it.
/// Returns true when a new entry was recorded.
pub(crate) fn register_tsval_switch(
    last_tsval: &mut Option<u32>,
    tsval_switches: &mut IndexMap<u32, TsvalSwitch>,
    tsval: u32,
    switch: TsvalSwitch,
) -> bool {
    match *last_tsval {
        Some(last) if !grt(tsval, last) => false,
        _ => {
            *last_tsval = Some(tsval);
            tsval_switches.insert(tsval, switch);
            true
        }
    }
}

/// Drop every switch whose TSval the peer has already echoed at or past.
/// Keeps the map bounded to TSvals currently in flight.
pub(crate) fn purge_acknowledged_tsvals(tsval_switches: &mut IndexMap<u32, TsvalSwitch>, tsecr: u32) {
    tsval_switches.retain(|&tsval, _| !geq(tsecr, tsval));
}
