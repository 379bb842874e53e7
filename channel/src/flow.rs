// SPDX-License-Identifier: Apache-2.0
// Copyright NSaaS Authors

//! Network flow identification.

use core::fmt;
use std::net::Ipv4Addr;

use bytemuck::{Pod, Zeroable};

/// A flow 4-tuple identifying one network conversation.
///
/// Addresses and ports are kept in host byte order everywhere the tuple
/// appears in shared structures; the stack converts at the NIC boundary.
#[must_use]
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Pod, Zeroable)]
pub struct Flow {
    /// Source IPv4 address, host byte order.
    pub src_ip: u32,
    /// Destination IPv4 address, host byte order.
    pub dst_ip: u32,
    /// Source port, host byte order.
    pub src_port: u16,
    /// Destination port, host byte order.
    pub dst_port: u16,
}

const _: () = assert!(core::mem::size_of::<Flow>() == 12);

impl Flow {
    /// Build a flow from address types.
    pub fn new(src: Ipv4Addr, src_port: u16, dst: Ipv4Addr, dst_port: u16) -> Flow {
        Flow {
            src_ip: u32::from(src),
            dst_ip: u32::from(dst),
            src_port,
            dst_port,
        }
    }

    /// Source address of the flow.
    #[must_use]
    pub fn src_addr(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.src_ip)
    }

    /// Destination address of the flow.
    #[must_use]
    pub fn dst_addr(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.dst_ip)
    }
}

impl fmt::Display for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} -> {}:{}",
            self.src_addr(),
            self.src_port,
            self.dst_addr(),
            self.dst_port
        )
    }
}
