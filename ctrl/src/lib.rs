// SPDX-License-Identifier: Apache-2.0
// Copyright NSaaS Authors

//! Control-socket protocol between an application and the NSaaS controller.
//!
//! Every exchange is one fixed-size record per direction over a local stream
//! socket. Registration happens once per process on a connection that stays
//! open for the application's lifetime (the controller treats its close as
//! de-registration); every other request opens a transient connection, which
//! keeps concurrent callers isolated without a lock or a response
//! demultiplexer.

#![deny(
    unsafe_code,
    missing_docs,
    clippy::all,
    clippy::pedantic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic
)]

mod client;
mod wire;

pub use client::{
    ctrl_request, Client, ControllerConfig, CtrlError, CONTROLLER_SOCKET_ENV,
    DEFAULT_CONTROLLER_SOCKET,
};
pub use wire::{ChannelInfo, CtrlMsg, MsgKind, CTRL_MSG_BYTES, STATUS_SUCCESS};
