// SPDX-License-Identifier: Apache-2.0
// Copyright NSaaS Authors

//! Message headers crossing the datapath API.

use channel::{Flow, BUF_FLAG_NOTIFY_DELIVERY};

/// Largest message the datapath accepts, in bytes.
pub const MSG_MAX_LEN: u32 = 8 * 1024 * 1024;

/// Ask the stack to signal once the message has been delivered. The only
/// application-settable message flag; it is stamped onto the head buffer.
pub const MSG_NOTIFY_DELIVERY: u32 = BUF_FLAG_NOTIFY_DELIVERY;

/// An outgoing message: destination flow, flags, and the payload as a list
/// of segments gathered at copy time.
#[derive(Debug)]
pub struct SendMsgHdr<'a> {
    /// The flow to send on, as returned by `connect`.
    pub flow: Flow,
    /// Message flags; only [`MSG_NOTIFY_DELIVERY`] is honored.
    pub flags: u32,
    /// Payload segments, copied in order.
    pub segments: &'a [&'a [u8]],
}

impl SendMsgHdr<'_> {
    /// Total payload bytes across all segments.
    #[must_use]
    pub fn msg_size(&self) -> usize {
        self.segments.iter().map(|s| s.len()).sum()
    }
}

/// What a successful receive delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecvdMsg {
    /// Payload bytes scattered into the caller's segments.
    pub len: usize,
    /// The flow the message arrived on.
    pub flow: Flow,
}
