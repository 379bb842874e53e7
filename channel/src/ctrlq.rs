// SPDX-License-Identifier: Apache-2.0
// Copyright NSaaS Authors

//! Control queue entries carried on the in-channel SQ/CQ pair.

use core::mem::size_of;

use bytemuck::{Pod, Zeroable};

use crate::flow::Flow;

/// Completion status: request succeeded.
pub const CTRL_STATUS_OK: u32 = 0;

/// Completion status: request refused by the stack.
pub const CTRL_STATUS_FAILURE: u32 = 1;

/// Control operations the application may submit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum CtrlOp {
    /// Create a flow to a remote endpoint.
    CreateFlow = 1,
    /// Install a listener on a local address/port.
    Listen = 2,
}

/// Listener 2-tuple payload, host byte order.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct ListenerInfo {
    /// Local IPv4 address.
    pub ip: u32,
    /// Local port.
    pub port: u16,
    _pad: u16,
}

/// One fixed-size entry on the control submission or completion queue.
///
/// Submissions carry `id` and `opcode` plus the payload for that opcode;
/// completions echo the request `id` and fill `status` (and `flow_info` for
/// [`CtrlOp::CreateFlow`]). Only the payload named by the opcode is
/// meaningful; the other is left zeroed.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct CtrlQueueEntry {
    /// Per-channel monotonic request id, echoed on completion.
    pub id: u32,
    /// Raw [`CtrlOp`] discriminant.
    pub opcode: u32,
    /// [`CTRL_STATUS_OK`] or [`CTRL_STATUS_FAILURE`]; meaningful on
    /// completions only.
    pub status: u32,
    _pad0: u32,
    /// Flow payload for [`CtrlOp::CreateFlow`].
    pub flow_info: Flow,
    /// Listener payload for [`CtrlOp::Listen`].
    pub listener_info: ListenerInfo,
    _pad1: [u8; 28],
}

const _: () = assert!(size_of::<CtrlQueueEntry>() == 64);

impl CtrlQueueEntry {
    /// Build a `CreateFlow` submission. The stack fills in the source port
    /// it assigns, so only the addresses and destination port are carried.
    pub fn create_flow(id: u32, src_ip: u32, dst_ip: u32, dst_port: u16) -> CtrlQueueEntry {
        CtrlQueueEntry {
            id,
            opcode: CtrlOp::CreateFlow as u32,
            flow_info: Flow {
                src_ip,
                dst_ip,
                src_port: 0,
                dst_port,
            },
            ..Zeroable::zeroed()
        }
    }

    /// Build a `Listen` submission.
    pub fn listen(id: u32, ip: u32, port: u16) -> CtrlQueueEntry {
        CtrlQueueEntry {
            id,
            opcode: CtrlOp::Listen as u32,
            listener_info: ListenerInfo { ip, port, _pad: 0 },
            ..Zeroable::zeroed()
        }
    }

    /// Build the completion echoing `req`, with `status` and the completed
    /// flow (zero for listen completions).
    pub fn completion(req: &CtrlQueueEntry, status: u32, flow: Flow) -> CtrlQueueEntry {
        CtrlQueueEntry {
            id: req.id,
            opcode: req.opcode,
            status,
            flow_info: flow,
            ..Zeroable::zeroed()
        }
    }

    /// Decode the opcode, if recognized.
    #[must_use]
    pub fn op(&self) -> Option<CtrlOp> {
        match self.opcode {
            1 => Some(CtrlOp::CreateFlow),
            2 => Some(CtrlOp::Listen),
            _ => None,
        }
    }
}
