// SPDX-License-Identifier: Apache-2.0
// Copyright NSaaS Authors

//! Message buffers: fixed-size payload slots chained into messages.
//!
//! Every buffer starts with a 64-byte header followed by `buf_mss` payload
//! bytes. A message is a non-empty chain `b0 -> b1 -> ... -> bk` linked by
//! slot index: `b0` carries `SYN` plus the message metadata (`msg_len`,
//! `flow`, `last`), `bk` carries `FIN`, and every buffer with a successor
//! carries `SG` and a valid `next`.
//!
//! The header magic is checked on every access; a mismatch means the shared
//! region was corrupted (or the peer misbehaved) and the process aborts.

use core::marker::PhantomData;
use core::mem::size_of;
use core::ptr::NonNull;

use tracing::error;

use crate::flow::Flow;

/// Sentinel in the first four bytes of every message buffer header.
pub const MSGBUF_MAGIC: u32 = 0x4D42_5546;

/// Bytes of header before each buffer's payload.
pub const BUF_HDR_BYTES: usize = 64;

/// Head-of-message marker.
pub const BUF_FLAG_SYN: u32 = 1 << 0;
/// Last-buffer-of-message marker.
pub const BUF_FLAG_FIN: u32 = 1 << 1;
/// This buffer has a successor in `next`.
pub const BUF_FLAG_SG: u32 = 1 << 2;
/// Ask the stack to signal when the message has been delivered.
pub const BUF_FLAG_NOTIFY_DELIVERY: u32 = 1 << 3;

#[repr(C, align(64))]
pub(crate) struct MsgBufHdr {
    magic: u32,
    index: u32,
    flags: u32,
    next: u32,
    last: u32,
    data_len: u32,
    msg_len: u32,
    _pad0: u32,
    flow: Flow,
    _pad1: [u8; 20],
}

const _: () = assert!(size_of::<MsgBufHdr>() == BUF_HDR_BYTES);

impl MsgBufHdr {
    /// Stamp a fresh header at creation time.
    pub(crate) fn stamp(&mut self, index: u32) {
        self.magic = MSGBUF_MAGIC;
        self.index = index;
        self.flags = 0;
        self.next = 0;
        self.last = 0;
        self.data_len = 0;
        self.msg_len = 0;
        self.flow = Flow::default();
    }
}

/// A handle to one message buffer inside a mapped channel.
///
/// The handle borrows the channel mapping; it never outlives it. All header
/// reads verify nothing; the magic was checked when the handle was created
/// by the channel (see [`crate::Channel::buf`]).
pub struct BufRef<'a> {
    hdr: NonNull<MsgBufHdr>,
    payload: NonNull<u8>,
    mss: u32,
    _chan: PhantomData<&'a ()>,
}

impl<'a> BufRef<'a> {
    /// Materialize a buffer handle at `base`, aborting the process if the
    /// header magic does not match.
    ///
    /// # Safety
    ///
    /// `base` must point at a buffer slot of `BUF_HDR_BYTES + mss` bytes
    /// inside a mapping valid for `'a`.
    pub(crate) unsafe fn from_raw(base: NonNull<u8>, mss: u32) -> BufRef<'a> {
        let hdr = base.cast::<MsgBufHdr>();
        let magic = unsafe { hdr.as_ref().magic };
        if magic != MSGBUF_MAGIC {
            corruption_abort(magic, unsafe { hdr.as_ref().index });
        }
        BufRef {
            hdr,
            payload: unsafe { base.add(BUF_HDR_BYTES) },
            mss,
            _chan: PhantomData,
        }
    }

    fn hdr(&self) -> &MsgBufHdr {
        // SAFETY: the header lives in the mapping borrowed for 'a.
        unsafe { self.hdr.as_ref() }
    }

    fn hdr_mut(&mut self) -> &mut MsgBufHdr {
        // SAFETY: as above; ownership of the buffer follows the channel
        // protocol, under which exactly one endpoint holds this slot.
        unsafe { self.hdr.as_mut() }
    }

    /// This buffer's slot index.
    #[must_use]
    pub fn index(&self) -> u32 {
        self.hdr().index
    }

    /// Current flag bits.
    #[must_use]
    pub fn flags(&self) -> u32 {
        self.hdr().flags
    }

    /// True when every bit of `mask` is set.
    #[must_use]
    pub fn has_flags(&self, mask: u32) -> bool {
        self.hdr().flags & mask == mask
    }

    /// OR `mask` into the flag bits.
    pub fn set_flags(&mut self, mask: u32) {
        self.hdr_mut().flags |= mask;
    }

    /// Clear every bit of `mask`.
    pub fn clear_flags(&mut self, mask: u32) {
        self.hdr_mut().flags &= !mask;
    }

    /// Successor slot index; meaningful iff [`BUF_FLAG_SG`] is set.
    #[must_use]
    pub fn next(&self) -> u32 {
        self.hdr().next
    }

    /// Link the successor buffer.
    pub fn set_next(&mut self, next: u32) {
        self.hdr_mut().next = next;
    }

    /// Slot index of the final buffer of the message (head buffer only).
    #[must_use]
    pub fn last(&self) -> u32 {
        self.hdr().last
    }

    /// Record the final buffer of the message (head buffer only).
    pub fn set_last(&mut self, last: u32) {
        self.hdr_mut().last = last;
    }

    /// Total logical message length (head buffer only).
    #[must_use]
    pub fn msg_len(&self) -> u32 {
        self.hdr().msg_len
    }

    /// Record the total message length (head buffer only).
    pub fn set_msg_len(&mut self, len: u32) {
        self.hdr_mut().msg_len = len;
    }

    /// The flow the message belongs to (head buffer only).
    pub fn flow(&self) -> Flow {
        self.hdr().flow
    }

    /// Record the message's flow (head buffer only).
    pub fn set_flow(&mut self, flow: Flow) {
        self.hdr_mut().flow = flow;
    }

    /// Payload bytes currently written.
    #[must_use]
    pub fn data_len(&self) -> u32 {
        self.hdr().data_len
    }

    /// Payload bytes still free.
    #[must_use]
    pub fn tailroom(&self) -> u32 {
        self.mss - self.hdr().data_len
    }

    /// Reserve `n` payload bytes at the tail and return them for writing.
    ///
    /// # Panics
    ///
    /// Debug-asserts that `n <= tailroom()`; callers size their copies with
    /// [`BufRef::tailroom`] first.
    pub fn append(&mut self, n: u32) -> &'a mut [u8] {
        debug_assert!(n <= self.tailroom());
        let ofs = self.hdr().data_len;
        self.hdr_mut().data_len = ofs + n;
        // SAFETY: [ofs, ofs + n) is within the mss-sized payload area and
        // was unused until this reservation; the region lives in the
        // mapping borrowed for 'a.
        unsafe {
            core::slice::from_raw_parts_mut(self.payload.as_ptr().add(ofs as usize), n as usize)
        }
    }

    /// Written payload starting at byte `ofs`.
    #[must_use]
    pub fn data(&self, ofs: u32) -> &'a [u8] {
        let len = self.hdr().data_len;
        debug_assert!(ofs <= len);
        // SAFETY: [ofs, data_len) was written through `append` and lives in
        // the mapping borrowed for 'a.
        unsafe {
            core::slice::from_raw_parts(
                self.payload.as_ptr().add(ofs as usize),
                (len - ofs) as usize,
            )
        }
    }

    /// Return the buffer to its freshly-allocated state.
    pub fn reset(&mut self) {
        let index = self.hdr().index;
        self.hdr_mut().stamp(index);
    }
}

#[cold]
fn corruption_abort(found: u32, index: u32) -> ! {
    // A torn buffer header means the shared region is corrupt or the peer
    // is misbehaving; no local recovery is possible.
    error!(found, index, expected = MSGBUF_MAGIC, "message buffer magic mismatch, aborting");
    std::process::abort()
}
