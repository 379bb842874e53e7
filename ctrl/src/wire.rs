// SPDX-License-Identifier: Apache-2.0
// Copyright NSaaS Authors

//! The fixed-size control-socket record.

use core::mem::size_of;

use bytemuck::{Pod, Zeroable};
use uuid::Uuid;

/// Size of every control-socket record. Peers read and write exactly this
/// many bytes per message; there is no length prefix.
pub const CTRL_MSG_BYTES: usize = 64;

/// Status on a successful response.
pub const STATUS_SUCCESS: i32 = 0;

/// Control-socket message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MsgKind {
    /// Register the application with the controller.
    ReqRegister = 1,
    /// Request a new shared-memory channel.
    ReqChannel = 2,
    /// Controller response to either request.
    Response = 3,
}

/// Channel parameters carried on `ReqChannel`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct ChannelInfo {
    /// UUID naming the requested channel.
    pub channel_uuid: [u8; 16],
    /// Requested slots per data descriptor ring.
    pub desc_ring_slots: u32,
    /// Requested message-buffer count.
    pub buf_count: u32,
}

/// One control-socket record.
///
/// Responses to `ReqChannel` additionally carry the channel file descriptor
/// as ancillary data; the record itself is identical in shape.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct CtrlMsg {
    /// Raw [`MsgKind`] discriminant.
    pub kind: u32,
    /// Per-process monotonic message id, echoed on responses.
    pub msg_id: u32,
    /// [`STATUS_SUCCESS`] or a controller-defined failure; meaningful on
    /// responses only.
    pub status: i32,
    _pad0: u32,
    /// The application's UUID, carried on every message.
    pub app_uuid: [u8; 16],
    /// Channel parameters; meaningful on `ReqChannel` only.
    pub channel_info: ChannelInfo,
    _pad1: [u8; 8],
}

const _: () = assert!(size_of::<CtrlMsg>() == CTRL_MSG_BYTES);

impl CtrlMsg {
    /// Build a registration request.
    #[must_use]
    pub fn register(msg_id: u32, app_uuid: Uuid) -> CtrlMsg {
        CtrlMsg {
            kind: MsgKind::ReqRegister as u32,
            msg_id,
            app_uuid: *app_uuid.as_bytes(),
            ..Zeroable::zeroed()
        }
    }

    /// Build a channel request.
    #[must_use]
    pub fn channel_request(
        msg_id: u32,
        app_uuid: Uuid,
        channel_uuid: Uuid,
        desc_ring_slots: u32,
        buf_count: u32,
    ) -> CtrlMsg {
        CtrlMsg {
            kind: MsgKind::ReqChannel as u32,
            msg_id,
            app_uuid: *app_uuid.as_bytes(),
            channel_info: ChannelInfo {
                channel_uuid: *channel_uuid.as_bytes(),
                desc_ring_slots,
                buf_count,
            },
            ..Zeroable::zeroed()
        }
    }

    /// Build the response echoing `req`. Used by the controller side (and
    /// the test stub standing in for it).
    #[must_use]
    pub fn response_to(req: &CtrlMsg, status: i32) -> CtrlMsg {
        CtrlMsg {
            kind: MsgKind::Response as u32,
            msg_id: req.msg_id,
            status,
            app_uuid: req.app_uuid,
            ..Zeroable::zeroed()
        }
    }

    /// Decode the message kind, if recognized.
    #[must_use]
    pub fn msg_kind(&self) -> Option<MsgKind> {
        match self.kind {
            1 => Some(MsgKind::ReqRegister),
            2 => Some(MsgKind::ReqChannel),
            3 => Some(MsgKind::Response),
            _ => None,
        }
    }

    /// The application UUID carried by the message.
    #[must_use]
    pub fn app_uuid(&self) -> Uuid {
        Uuid::from_bytes(self.app_uuid)
    }

    /// View the record as wire bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }

    /// Rebuild a record from wire bytes.
    #[must_use]
    pub fn from_bytes(bytes: &[u8; CTRL_MSG_BYTES]) -> CtrlMsg {
        bytemuck::pod_read_unaligned(bytes)
    }
}
