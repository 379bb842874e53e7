// SPDX-License-Identifier: Apache-2.0
// Copyright NSaaS Authors

//! Flow-plane client: `connect` and `listen` over the in-channel control
//! queues.
//!
//! Both operations submit one entry on the control SQ and poll the CQ with
//! bounded retries. Control operations are rare and latency-insensitive, so
//! a sleepy poll beats burning a core; the overall budget is about ten
//! seconds. A completion that echoes the wrong id is a protocol violation
//! and is not retried.

use std::net::Ipv4Addr;
use std::time::Duration;

use channel::{Channel, CtrlQueueEntry, Flow, CTRL_STATUS_OK};
use tracing::{debug, warn};

/// CQ poll attempts before a request is declared lost.
const COMPLETION_ATTEMPTS: u32 = 10;

/// Delay between CQ poll attempts.
const COMPLETION_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Errors completing a flow-plane request.
#[derive(Debug, thiserror::Error)]
pub enum FlowError {
    /// An address argument did not parse as a usable IPv4 address.
    #[error("invalid IPv4 address: {given}")]
    InvalidAddress {
        /// The rejected input.
        given: String,
    },
    /// The control submission queue would not accept the request.
    #[error("control submission queue is full")]
    SubmitFull,
    /// No completion arrived within the retry budget.
    #[error("no completion after {COMPLETION_ATTEMPTS} poll attempts")]
    TimedOut,
    /// A completion arrived for a different request.
    #[error("completion echoes request id {got}, expected {expected}")]
    IdMismatch {
        /// The id this channel submitted.
        expected: u32,
        /// The id the completion carried.
        got: u32,
    },
    /// The stack refused the request.
    #[error("stack refused the request with status {status}")]
    Rejected {
        /// The completion status.
        status: u32,
    },
}

/// Parse a presentation-form IPv4 address, rejecting the all-ones
/// pseudo-address that C APIs conflate with parse failure.
fn parse_addr(given: &str) -> Result<Ipv4Addr, FlowError> {
    let addr: Ipv4Addr = given.parse().map_err(|_| FlowError::InvalidAddress {
        given: given.to_owned(),
    })?;
    if addr == Ipv4Addr::BROADCAST {
        return Err(FlowError::InvalidAddress {
            given: given.to_owned(),
        });
    }
    Ok(addr)
}

/// Submit `req` and poll for its completion, enforcing the id echo.
fn submit_and_await(ch: &mut Channel, req: &CtrlQueueEntry) -> Result<CtrlQueueEntry, FlowError> {
    if !ch.ctrl_sq_enqueue(req) {
        warn!(id = req.id, "control submission queue full");
        return Err(FlowError::SubmitFull);
    }
    debug!(id = req.id, opcode = req.opcode, "flow request submitted");

    for _ in 0..COMPLETION_ATTEMPTS {
        if let Some(resp) = ch.ctrl_cq_dequeue() {
            if resp.id != req.id {
                warn!(expected = req.id, got = resp.id, "completion id mismatch");
                return Err(FlowError::IdMismatch {
                    expected: req.id,
                    got: resp.id,
                });
            }
            if resp.status != CTRL_STATUS_OK {
                return Err(FlowError::Rejected {
                    status: resp.status,
                });
            }
            debug!(id = resp.id, "flow request completed");
            return Ok(resp);
        }
        std::thread::sleep(COMPLETION_RETRY_DELAY);
    }
    warn!(id = req.id, "flow request timed out");
    Err(FlowError::TimedOut)
}

/// Create a flow from `src_ip` to `dst_ip:dst_port` on this channel.
///
/// Returns the full 4-tuple, including the source port the stack assigned.
/// May block for up to the ten-second completion budget.
///
/// # Errors
///
/// Returns a [`FlowError`] on bad addresses (the destination must also not
/// be the wildcard address), a full submission queue, a refusal from the
/// stack, a completion-id mismatch, or a poll timeout.
pub fn connect(
    ch: &mut Channel,
    src_ip: &str,
    dst_ip: &str,
    dst_port: u16,
) -> Result<Flow, FlowError> {
    let src = parse_addr(src_ip)?;
    let dst = parse_addr(dst_ip)?;
    if dst == Ipv4Addr::UNSPECIFIED {
        return Err(FlowError::InvalidAddress {
            given: dst_ip.to_owned(),
        });
    }

    let id = ch.next_req_id();
    let req = CtrlQueueEntry::create_flow(id, src.into(), dst.into(), dst_port);
    let resp = submit_and_await(ch, &req)?;
    Ok(resp.flow_info)
}

/// Install a listener on `local_ip:local_port` for this channel.
///
/// May block for up to the ten-second completion budget.
///
/// # Errors
///
/// As for [`connect`], minus the wildcard-destination rule.
pub fn listen(ch: &mut Channel, local_ip: &str, local_port: u16) -> Result<(), FlowError> {
    let local = parse_addr(local_ip)?;

    let id = ch.next_req_id();
    let req = CtrlQueueEntry::listen(id, local.into(), local_port);
    submit_and_await(ch, &req)?;
    Ok(())
}
