/*
 * @copyright (C) 2024 Ruslan Iusupov <https://github.com/rus0000>
 *
 * SPDX-License-Identifier: MIT
 */
use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;

/// TCP flow Four-tuple: two IPs + two ports. Traffic in one direction only.
/// TCP session consist of two flows in two directions.
/// Assumption, that IP Addresses are unique per VLAN, so VLAN is excluded from the flow tuple.
#[derive(Hash, Eq, PartialEq, PartialOrd, Ord, Clone)]
pub struct TcpFlow {
    pub source_ipv4_address: Ipv4Addr,
    pub source_port: u16,

    pub destination_ipv4_address: Ipv4Addr,
    pub destination_port: u16,
}
impl Default for TcpFlow {
    fn default() -> Self {
        Self {
            source_ipv4_address: Ipv4Addr::new(0, 0, 0, 0),
            source_port: 0,
            destination_ipv4_address: Ipv4Addr::new(0, 0, 0, 0),
            destination_port: 0,
        }
    }
}

impl fmt::Debug for TcpFlow {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            formatter,
            "(ip.addr == {} && ip.addr == {} && tcp.port == {} && tcp.port == {})",
            self.source_ipv4_address, self.destination_ipv4_address, self.source_port, self.destination_port,
        )
    }
}

impl fmt::Display for TcpFlow {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            formatter,
            "{}:{}+{}:{}",
            self.source_ipv4_address, self.source_port, self.destination_ipv4_address, self.destination_port,
        )
    }
}

impl TcpFlow {
    pub fn get_reverse_flow(&self) -> Self {
        TcpFlow {
            source_ipv4_address: self.destination_ipv4_address,
            source_port: self.destination_port,

            destination_ipv4_address: self.source_ipv4_address,
            destination_port: self.source_port,
        }
    }
}

/// Flow id is sequentially generated on a first seen basis, based on the TCP 4-tuple.
/// Forward and reverse flow ids of same TCP session are generated at once,
/// so odd and next even flow ids always form a TCP session.
#[derive(Debug, Default)]
pub struct FlowIdRegistry {
    pub flow_to_id: HashMap<TcpFlow, u32>,
    /// last generated flow Id
    pub last_flow_id: u32,
}

impl FlowIdRegistry {
    /// Get id of a flow, insert a new one, if missing. Creates also reverse flow id, if needed.
    pub fn get_flow_id(&mut self, tcp_flow: &TcpFlow) -> u32 {
        let flow_id = *self.flow_to_id.entry(tcp_flow.clone()).or_insert_with(|| {
            self.last_flow_id += 1;
            self.last_flow_id
        });

        self.flow_to_id.entry(tcp_flow.get_reverse_flow()).or_insert_with(|| {
            self.last_flow_id += 1;
            self.last_flow_id
        });

        flow_id
    }
}
