// SPDX-License-Identifier: Apache-2.0
// Copyright NSaaS Authors

//! Application-side library for the NSaaS user-space network stack.
//!
//! Applications send and receive network messages through a privileged
//! out-of-process stack (the controller), which owns the NICs and
//! multiplexes them over shared-memory channels. This crate is everything
//! the application links: registration over the control socket, channel
//! attachment, flow setup, and the segmented datapath.
//!
//! The usual sequence:
//!
//! ```no_run
//! use nsaas::{attach, connect, recv, send, Client, ControllerConfig};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let client = Client::new(ControllerConfig::default());
//! client.register()?;
//! let mut ch = attach(&client)?;
//! let flow = connect(&mut ch, "10.0.0.1", "10.0.0.2", 888)?;
//! send(&mut ch, flow, b"hello")?;
//! let mut buf = [0u8; 2048];
//! while recv(&mut ch, &mut buf)?.is_none() {}
//! # Ok(())
//! # }
//! ```
//!
//! Channels are not synchronized internally: the datapath entry points take
//! `&mut` so that each channel has a single owning thread, the usual
//! queue-per-thread arrangement. The [`Client`] is freely shareable.

#![deny(
    unsafe_code,
    missing_docs,
    clippy::all,
    clippy::pedantic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic
)]

mod datapath;
mod flowctl;
mod msg;

pub use channel::{BindError, Channel, Flow};
pub use ctrl::{Client, ControllerConfig, CtrlError};
pub use datapath::{recv, recvmsg, send, sendmmsg, sendmsg, RecvError, SendError};
pub use flowctl::{connect, listen, FlowError};
pub use msg::{RecvdMsg, SendMsgHdr, MSG_MAX_LEN, MSG_NOTIFY_DELIVERY};

/// Errors attaching a channel.
#[derive(Debug, thiserror::Error)]
pub enum AttachError {
    /// The control-socket exchange failed.
    #[error(transparent)]
    Ctrl(#[from] CtrlError),
    /// The delivered descriptor did not map to a valid channel.
    #[error(transparent)]
    Bind(#[from] BindError),
}

/// Request a channel from the controller and map it.
///
/// Asks for the default geometry; the controller fixes the actual one in
/// the channel header.
///
/// # Errors
///
/// Returns an [`AttachError`] when the request is refused or the descriptor
/// does not hold a valid channel.
pub fn attach(client: &Client) -> Result<Channel, AttachError> {
    let fd = client.request_channel(channel::DEFAULT_DESC_RING_SLOTS, channel::DEFAULT_BUF_COUNT)?;
    Ok(Channel::bind(fd)?)
}

/// Release the application's handle on a channel.
///
/// No control-plane traffic happens here: the controller reclaims every
/// channel of an application when its registration socket closes. Dropping
/// the handle unmaps the region from this process.
pub fn detach(ch: Channel) {
    drop(ch);
}
