/*
 * @copyright (C) 2024 Ruslan Iusupov <https://github.com/rus0000>
 *
 * SPDX-License-Identifier: MIT
 */

pub fn check_trace_flow(trace_flows: &[u32], flow_id: u32) -> bool {
    trace_flows.contains(&flow_id) || trace_flows.len() == 0
}

#[macro_export]
macro_rules! trace {
    ($format_pattern: expr, $trace_flows: expr, $flow_id: expr, $($arg: expr),*) => {
        if check_trace_flow($trace_flows, $flow_id) {
            println!($format_pattern, $flow_id, $($arg),*);
        };
    }
}
