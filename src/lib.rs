/*
 * @copyright (C) 2024 Ruslan Iusupov <https://github.com/rus0000>
 *
 * SPDX-License-Identifier: MIT
 */

/// Wraparound-safe comparison over the 32-bit TCP sequence space
pub mod sequence;

mod trace_macro;
mod tcp_flow;
mod packet_record;
mod tsval_switch;
mod unsync_tsval;
mod too_fast_retrans;
mod rtt_sampler;
pub use packet_record::*;
pub use rtt_sampler::*;
pub use tcp_flow::*;
pub use too_fast_retrans::*;
pub use tsval_switch::{TsvalErrorRecord, TsvalSwitch};
pub use unsync_tsval::*;
