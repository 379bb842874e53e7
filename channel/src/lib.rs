// SPDX-License-Identifier: Apache-2.0
// Copyright NSaaS Authors

//! Shared-memory channel between an application and the NSaaS controller.
//!
//! A channel is a single memory-mapped region holding a header, four
//! descriptor rings (application to stack data, stack to application data,
//! control submission, control completion), a free-buffer ring, and a pool
//! of fixed-size message buffers addressed by 32-bit slot indices.
//!
//! The controller creates the region (see [`create`]) and hands the
//! application a file descriptor over the control socket; the application
//! maps it with [`Channel::bind`]. Buffers move between the two endpoints by
//! slot index only, so nothing in the shared region is address-space
//! dependent.

#![deny(
    missing_docs,
    clippy::all,
    clippy::pedantic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic
)]

pub mod buffer;
pub mod ctrlq;
pub mod flow;
pub mod layout;
pub mod ring;
mod shm;

pub use buffer::{
    BufRef, BUF_FLAG_FIN, BUF_FLAG_NOTIFY_DELIVERY, BUF_FLAG_SG, BUF_FLAG_SYN, MSGBUF_MAGIC,
};
pub use ctrlq::{CtrlOp, CtrlQueueEntry, CTRL_STATUS_FAILURE, CTRL_STATUS_OK};
pub use flow::Flow;
pub use layout::{
    ChannelConfig, ChannelGeometry, GeometryError, CHANNEL_MAGIC, DEFAULT_BUF_COUNT,
    DEFAULT_BUF_MSS, DEFAULT_DESC_RING_SLOTS,
};
pub use shm::{create, BindError, Channel, CreateError, StackChannel};
