// SPDX-License-Identifier: Apache-2.0
// Copyright NSaaS Authors

//! Registration and request plumbing toward the controller.

use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use nix::cmsg_space;
use nix::errno::Errno;
use nix::sys::socket::{recvmsg, sendmsg, ControlMessageOwned, MsgFlags};
use tracing::debug;
use uuid::Uuid;

use crate::wire::{CtrlMsg, MsgKind, CTRL_MSG_BYTES, STATUS_SUCCESS};

/// Well-known controller socket path.
pub const DEFAULT_CONTROLLER_SOCKET: &str = "/var/run/nsaas/ctrl.sock";

/// Environment variable overriding the controller socket path.
pub const CONTROLLER_SOCKET_ENV: &str = "NSAAS_CONTROLLER_SOCKET";

/// Where to find the controller.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Path of the controller's stream socket.
    pub socket_path: PathBuf,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        let socket_path = std::env::var_os(CONTROLLER_SOCKET_ENV)
            .map_or_else(|| PathBuf::from(DEFAULT_CONTROLLER_SOCKET), PathBuf::from);
        ControllerConfig { socket_path }
    }
}

impl ControllerConfig {
    /// Point at a controller socket explicitly.
    pub fn with_path(path: impl Into<PathBuf>) -> ControllerConfig {
        ControllerConfig {
            socket_path: path.into(),
        }
    }
}

/// Errors talking to the controller.
#[derive(Debug, thiserror::Error)]
pub enum CtrlError {
    /// Could not reach the controller socket.
    #[error("connect to controller at {path} failed: {source}")]
    Connect {
        /// The socket path tried.
        path: PathBuf,
        /// The underlying connect error.
        #[source]
        source: std::io::Error,
    },
    /// A send or receive on the control socket failed.
    #[error("control socket i/o failed: {0}")]
    Io(#[from] Errno),
    /// The record was not written in one piece.
    #[error("short write on control socket: {sent} of {expected} bytes")]
    ShortWrite {
        /// Bytes the kernel accepted.
        sent: usize,
        /// Bytes a record requires.
        expected: usize,
    },
    /// The record was not read in one piece.
    #[error("short read on control socket: {got} of {expected} bytes")]
    ShortRead {
        /// Bytes received.
        got: usize,
        /// Bytes a record requires.
        expected: usize,
    },
    /// The response carried an unexpected message kind.
    #[error("unexpected control message kind {kind}")]
    UnexpectedKind {
        /// The raw kind received.
        kind: u32,
    },
    /// The response echoed the wrong message id.
    #[error("control response echoes msg_id {got}, expected {sent}")]
    MsgIdMismatch {
        /// The id this process sent.
        sent: u32,
        /// The id the response carried.
        got: u32,
    },
    /// The controller answered with a failure status.
    #[error("controller refused the request with status {status}")]
    Refused {
        /// The status received.
        status: i32,
    },
    /// A channel response arrived without the promised descriptor.
    #[error("controller response did not carry a channel fd")]
    NoFdDelivered,
    /// A channel was requested before registration.
    #[error("application is not registered with the controller")]
    NotRegistered,
}

/// Send exactly one record on `fd`; anything but a full write is an error.
fn send_frame(fd: RawFd, msg: &CtrlMsg) -> Result<(), CtrlError> {
    let iov = [IoSlice::new(msg.as_bytes())];
    let sent = sendmsg::<()>(fd, &iov, &[], MsgFlags::empty(), None)?;
    if sent != CTRL_MSG_BYTES {
        return Err(CtrlError::ShortWrite {
            sent,
            expected: CTRL_MSG_BYTES,
        });
    }
    Ok(())
}

/// Receive exactly one record on `fd`, scanning the ancillary data for a
/// single passed descriptor.
#[allow(unsafe_code)] // adopting the fd SCM_RIGHTS installed is inherently raw
fn recv_frame(fd: RawFd) -> Result<(CtrlMsg, Option<OwnedFd>), CtrlError> {
    let mut wire = [0u8; CTRL_MSG_BYTES];
    let mut passed_fd = None;
    let got = {
        let mut iov = [IoSliceMut::new(&mut wire)];
        let mut cmsg_buffer = cmsg_space!([RawFd; 1]);
        let received = recvmsg::<()>(fd, &mut iov, Some(&mut cmsg_buffer), MsgFlags::empty())?;
        for cmsg in received.cmsgs()? {
            if let ControlMessageOwned::ScmRights(fds) = cmsg {
                if let Some(&raw) = fds.first() {
                    // SAFETY: the kernel just installed this descriptor in
                    // our table for us; nothing else owns it.
                    passed_fd = Some(unsafe { OwnedFd::from_raw_fd(raw) });
                }
            }
        }
        received.bytes
    };
    if got != CTRL_MSG_BYTES {
        return Err(CtrlError::ShortRead {
            got,
            expected: CTRL_MSG_BYTES,
        });
    }
    Ok((CtrlMsg::from_bytes(&wire), passed_fd))
}

/// Issue one request over a transient connection and collect the response.
///
/// A fresh connection per request keeps concurrent application threads
/// isolated from each other; the persistent registration socket is reserved
/// for liveness.
///
/// # Errors
///
/// Returns a [`CtrlError`] when the controller is unreachable or the
/// exchange is cut short.
pub fn ctrl_request(path: &Path, req: &CtrlMsg) -> Result<(CtrlMsg, Option<OwnedFd>), CtrlError> {
    let stream = UnixStream::connect(path).map_err(|source| CtrlError::Connect {
        path: path.to_owned(),
        source,
    })?;
    send_frame(stream.as_raw_fd(), req)?;
    recv_frame(stream.as_raw_fd())
}

/// Per-process identity and registration state toward the controller.
///
/// The `msg_id` counter only needs uniqueness across in-flight requests, so
/// a relaxed fetch-add is enough; the registration socket is written once
/// under the mutex and never used again after registration succeeds.
pub struct Client {
    config: ControllerConfig,
    app_uuid: Uuid,
    msg_id: AtomicU32,
    registration: Mutex<Option<UnixStream>>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("app_uuid", &self.app_uuid)
            .field("registered", &self.is_registered())
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Create an unregistered client with a fresh application UUID.
    #[must_use]
    pub fn new(config: ControllerConfig) -> Client {
        Client {
            config,
            app_uuid: Uuid::new_v4(),
            msg_id: AtomicU32::new(0),
            registration: Mutex::new(None),
        }
    }

    /// The application UUID carried in every control message.
    #[must_use]
    pub fn app_uuid(&self) -> Uuid {
        self.app_uuid
    }

    /// The controller this client talks to.
    #[must_use]
    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Take the next per-process message id.
    pub fn next_msg_id(&self) -> u32 {
        self.msg_id.fetch_add(1, Ordering::Relaxed)
    }

    /// True once registration has succeeded.
    #[must_use]
    pub fn is_registered(&self) -> bool {
        self.registration_slot().is_some()
    }

    fn registration_slot(&self) -> std::sync::MutexGuard<'_, Option<UnixStream>> {
        match self.registration.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Register this application with the controller.
    ///
    /// Idempotent: once registered, further calls return immediately with no
    /// network traffic. On success the connection is kept open for the
    /// process lifetime; the controller treats its close as application
    /// exit. On any failure the connection is dropped and the client stays
    /// unregistered, so a later call starts over.
    ///
    /// # Errors
    ///
    /// Returns a [`CtrlError`] when the controller is unreachable, answers
    /// out of protocol, or refuses the registration.
    pub fn register(&self) -> Result<(), CtrlError> {
        let mut slot = self.registration_slot();
        if slot.is_some() {
            return Ok(());
        }

        let stream =
            UnixStream::connect(&self.config.socket_path).map_err(|source| CtrlError::Connect {
                path: self.config.socket_path.clone(),
                source,
            })?;
        let req = CtrlMsg::register(self.next_msg_id(), self.app_uuid);
        send_frame(stream.as_raw_fd(), &req)?;
        let (resp, _fd) = recv_frame(stream.as_raw_fd())?;

        if resp.msg_kind() != Some(MsgKind::Response) {
            return Err(CtrlError::UnexpectedKind { kind: resp.kind });
        }
        if resp.msg_id != req.msg_id {
            return Err(CtrlError::MsgIdMismatch {
                sent: req.msg_id,
                got: resp.msg_id,
            });
        }
        if resp.status != STATUS_SUCCESS {
            return Err(CtrlError::Refused {
                status: resp.status,
            });
        }

        debug!(app_uuid = %self.app_uuid, "registered with controller");
        *slot = Some(stream);
        Ok(())
    }

    /// Request a new channel and return its descriptor.
    ///
    /// `desc_ring_slots` and `buf_count` are the application's preference;
    /// the controller fixes the actual geometry in the channel header.
    ///
    /// # Errors
    ///
    /// Returns a [`CtrlError`] when the client is unregistered, the
    /// controller refuses, or no descriptor arrives with the response.
    pub fn request_channel(
        &self,
        desc_ring_slots: u32,
        buf_count: u32,
    ) -> Result<OwnedFd, CtrlError> {
        if !self.is_registered() {
            return Err(CtrlError::NotRegistered);
        }
        let channel_uuid = Uuid::new_v4();
        let req = CtrlMsg::channel_request(
            self.next_msg_id(),
            self.app_uuid,
            channel_uuid,
            desc_ring_slots,
            buf_count,
        );
        let (resp, fd) = ctrl_request(&self.config.socket_path, &req)?;

        if resp.msg_kind() != Some(MsgKind::Response) {
            return Err(CtrlError::UnexpectedKind { kind: resp.kind });
        }
        if resp.msg_id != req.msg_id {
            return Err(CtrlError::MsgIdMismatch {
                sent: req.msg_id,
                got: resp.msg_id,
            });
        }
        if resp.status != STATUS_SUCCESS {
            return Err(CtrlError::Refused {
                status: resp.status,
            });
        }
        let fd = fd.ok_or(CtrlError::NoFdDelivered)?;
        debug!(channel_uuid = %channel_uuid, "controller delivered channel fd");
        Ok(fd)
    }
}
