// SPDX-License-Identifier: Apache-2.0
// Copyright NSaaS Authors

//! Segmented send and receive over the shared-memory channel.
//!
//! Messages larger than one buffer travel as a chain of slot indices. The
//! send path bulk-allocates the whole chain up front (no partial sends),
//! gathers the caller's segments into it with a greedy copy, stamps the
//! head and tail flags, and publishes only the head index on the
//! application ring. The receive path walks the chain, scattering into the
//! caller's segments and returning buffers to the pool in small batches so
//! long messages do not hold the whole chain until the end.
//!
//! Both paths are non-blocking: a full ring or an empty ring reports
//! immediately.

use channel::{Channel, Flow, BUF_FLAG_FIN, BUF_FLAG_SG, BUF_FLAG_SYN};
use tracing::{error, trace, warn};

use crate::msg::{RecvdMsg, SendMsgHdr, MSG_MAX_LEN, MSG_NOTIFY_DELIVERY};

/// Buffers returned to the pool per `buf_free_bulk` call on the receive
/// path.
const RECV_FREE_BATCH: usize = 16;

/// Errors enqueueing a message toward the stack.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// Empty messages are not representable on the wire.
    #[error("message is empty")]
    EmptyMessage,
    /// The message exceeds the datapath maximum.
    #[error("message of {len} bytes exceeds the {max}-byte maximum")]
    TooLong {
        /// Requested message size.
        len: usize,
        /// The [`MSG_MAX_LEN`] limit.
        max: u32,
    },
    /// The pool could not supply the whole chain.
    #[error("buffer pool cannot supply {needed} buffers")]
    NoBuffers {
        /// Buffers the message requires.
        needed: usize,
    },
    /// The application ring would not accept the message head.
    #[error("application ring is full")]
    RingFull,
}

/// Errors delivering a message to the caller.
#[derive(Debug, thiserror::Error)]
pub enum RecvError {
    /// The message did not fit the caller's segments. The whole chain was
    /// returned to the pool; nothing was delivered.
    #[error("message exceeds the {provided} bytes of receive segments")]
    Truncated {
        /// Total capacity the caller provided.
        provided: usize,
    },
}

/// Send a single contiguous buffer on `flow`.
///
/// Convenience wrapper over [`sendmsg`] with a one-segment header and no
/// flags.
///
/// # Errors
///
/// As for [`sendmsg`].
pub fn send(ch: &mut Channel, flow: Flow, buf: &[u8]) -> Result<(), SendError> {
    let segments = [buf];
    sendmsg(
        ch,
        &SendMsgHdr {
            flow,
            flags: 0,
            segments: &segments,
        },
    )
}

/// Gather `hdr`'s segments into a buffer chain and enqueue it.
///
/// All-or-nothing: on any failure no trace of the message remains visible
/// to the stack and every allocated buffer is back in the pool.
///
/// # Errors
///
/// Returns a [`SendError`] for an empty or oversize message, an exhausted
/// buffer pool, or a full application ring.
pub fn sendmsg(ch: &mut Channel, hdr: &SendMsgHdr<'_>) -> Result<(), SendError> {
    let msg_size = hdr.msg_size();
    if msg_size == 0 {
        return Err(SendError::EmptyMessage);
    }
    if msg_size > MSG_MAX_LEN as usize {
        return Err(SendError::TooLong {
            len: msg_size,
            max: MSG_MAX_LEN,
        });
    }

    // The chain length is fixed by the channel's buffer payload size.
    let mss = ch.buf_mss() as usize;
    let needed = msg_size.div_ceil(mss);
    let mut indices = vec![0u32; needed];
    if ch.buf_alloc_bulk(&mut indices) != needed {
        warn!(needed, msg_size, "buffer pool exhausted");
        return Err(SendError::NoBuffers { needed });
    }

    // Gather all segments. The segment walk is independent of the buffer
    // walk: one segment may span buffers and one buffer may take several
    // segments.
    let mut cur = 0usize;
    let mut copied = 0usize;
    for &segment in hdr.segments {
        let mut rest = segment;
        while !rest.is_empty() {
            let mut buf = ch.buf(indices[cur]);
            let take = rest.len().min(buf.tailroom() as usize);
            #[allow(clippy::cast_possible_truncation)] // take <= tailroom <= mss: u32
            buf.append(take as u32).copy_from_slice(&rest[..take]);
            rest = &rest[take..];
            copied += take;

            if buf.tailroom() == 0 && !rest.is_empty() {
                // This buffer is full with bytes still to place: link its
                // successor and move the cursor.
                debug_assert!(cur + 1 < needed);
                buf.set_flags(BUF_FLAG_SG);
                buf.set_next(indices[cur + 1]);
                cur += 1;
            }
        }
    }
    if copied != msg_size {
        // The gather loop and the size computation disagree: shared state
        // is no longer trustworthy.
        error!(copied, msg_size, "send gather integrity violation, aborting");
        std::process::abort();
    }

    // Tail first, then head: the head stamp is what makes the chain a
    // message.
    {
        let mut tail = ch.buf(indices[needed - 1]);
        tail.set_flags(BUF_FLAG_FIN);
        tail.clear_flags(BUF_FLAG_SG);
    }
    {
        let mut head = ch.buf(indices[0]);
        head.set_flags(BUF_FLAG_SYN | (hdr.flags & MSG_NOTIFY_DELIVERY));
        head.set_flow(hdr.flow);
        #[allow(clippy::cast_possible_truncation)] // bounded by MSG_MAX_LEN
        head.set_msg_len(msg_size as u32);
        head.set_last(indices[needed - 1]);
    }

    if ch.app_ring_enqueue(&indices[..1]) != 1 {
        // Undo the allocation so the failed message cannot drain the pool.
        let freed = ch.buf_free_bulk(&indices);
        debug_assert_eq!(freed, needed);
        warn!(msg_size, "application ring full, message dropped");
        return Err(SendError::RingFull);
    }
    trace!(msg_size, chain = needed, flow = %hdr.flow, "message enqueued");
    Ok(())
}

/// Send a batch of messages, stopping at the first failure.
///
/// Returns how many messages were successfully enqueued.
pub fn sendmmsg(ch: &mut Channel, msgs: &[SendMsgHdr<'_>]) -> usize {
    for (sent, hdr) in msgs.iter().enumerate() {
        if sendmsg(ch, hdr).is_err() {
            return sent;
        }
    }
    msgs.len()
}

/// Receive one message into a single contiguous buffer.
///
/// Returns `Ok(None)` when no message is waiting.
///
/// # Errors
///
/// As for [`recvmsg`].
pub fn recv(ch: &mut Channel, buf: &mut [u8]) -> Result<Option<(usize, Flow)>, RecvError> {
    let mut segments = [&mut *buf];
    Ok(recvmsg(ch, &mut segments)?.map(|msg| (msg.len, msg.flow)))
}

/// Poll for one message and scatter it into `segments`.
///
/// Non-blocking: returns `Ok(None)` when the stack ring is empty. Exactly
/// one message is consumed per call. Buffers are returned to the pool as
/// the chain drains, in batches of [`RECV_FREE_BATCH`].
///
/// # Errors
///
/// [`RecvError::Truncated`] when the message is larger than the segments
/// provided; the whole chain is reclaimed first, so the pool never leaks
/// from an application-sizing error.
pub fn recvmsg(
    ch: &mut Channel,
    segments: &mut [&mut [u8]],
) -> Result<Option<RecvdMsg>, RecvError> {
    let mut head = [0u32; 1];
    if ch.stack_ring_dequeue(&mut head) != 1 {
        return Ok(None);
    }
    let mut index = head[0];
    let flow = ch.buf(index).flow();

    let mut batch = [0u32; RECV_FREE_BATCH];
    let mut batch_len = 0usize;
    let mut buf_ofs: u32 = 0;
    let mut seg_i = 0usize;
    let mut seg_ofs = 0usize;
    let mut total = 0usize;

    loop {
        let buf = ch.buf(index);
        let avail = buf.data_len() - buf_ofs;
        if avail == 0 {
            break;
        }
        if seg_i >= segments.len() {
            // Out of receive space with chain left over: reclaim every
            // buffer before reporting the error.
            let provided: usize = segments.iter().map(|s| s.len()).sum();
            reclaim_chain(ch, index, &mut batch, batch_len);
            warn!(provided, "receive segments too small for message");
            return Err(RecvError::Truncated { provided });
        }
        let seg = &mut *segments[seg_i];
        if seg.is_empty() {
            seg_i += 1;
            continue;
        }

        let take = (avail as usize).min(seg.len() - seg_ofs);
        seg[seg_ofs..seg_ofs + take].copy_from_slice(&buf.data(buf_ofs)[..take]);
        #[allow(clippy::cast_possible_truncation)] // take <= avail, a u32
        let take_u32 = take as u32;
        buf_ofs += take_u32;
        seg_ofs += take;
        total += take;

        if buf_ofs == buf.data_len() {
            // Buffer drained: queue it for release and follow the chain.
            batch[batch_len] = index;
            batch_len += 1;
            if buf.has_flags(BUF_FLAG_SG) {
                index = buf.next();
                buf_ofs = 0;
            } else {
                if batch_len > 0 {
                    ch.buf_free_bulk(&batch[..batch_len]);
                    batch_len = 0;
                }
                break;
            }
            if batch_len == RECV_FREE_BATCH {
                ch.buf_free_bulk(&batch);
                batch_len = 0;
            }
        }
        if seg_ofs == seg.len() {
            seg_i += 1;
            seg_ofs = 0;
        }
    }

    if batch_len > 0 {
        ch.buf_free_bulk(&batch[..batch_len]);
    }
    trace!(len = total, flow = %flow, "message delivered");
    Ok(Some(RecvdMsg { len: total, flow }))
}

/// Walk the rest of a chain starting at `index`, returning every buffer to
/// the pool. Used on the truncation path so application sizing errors never
/// cost the stack buffers.
fn reclaim_chain(
    ch: &Channel,
    mut index: u32,
    batch: &mut [u32; RECV_FREE_BATCH],
    mut batch_len: usize,
) {
    loop {
        let (chained, next) = {
            let buf = ch.buf(index);
            (buf.has_flags(BUF_FLAG_SG), buf.next())
        };
        batch[batch_len] = index;
        batch_len += 1;
        if batch_len == RECV_FREE_BATCH {
            ch.buf_free_bulk(&batch[..]);
            batch_len = 0;
        }
        if chained {
            index = next;
        } else {
            break;
        }
    }
    if batch_len > 0 {
        ch.buf_free_bulk(&batch[..batch_len]);
    }
}
