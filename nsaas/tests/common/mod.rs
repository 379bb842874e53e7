// SPDX-License-Identifier: Apache-2.0
// Copyright NSaaS Authors

//! In-process stand-in for the NSaaS controller.
//!
//! Serves the control socket (registration and channel requests, with FD
//! passing) on a background thread and hands the created [`StackChannel`]s
//! back to the test body, which drives the shared-memory side itself so
//! each scenario controls exactly when submissions complete and messages
//! echo.

#![allow(dead_code)] // not every scenario uses every helper

use std::io::{IoSlice, Read};
use std::os::fd::AsRawFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use channel::{
    create, ChannelConfig, CtrlOp, CtrlQueueEntry, Flow, StackChannel, BUF_FLAG_SG,
};
use ctrl::{CtrlMsg, MsgKind, CTRL_MSG_BYTES, STATUS_SUCCESS};
use nix::sys::socket::{sendmsg, ControlMessage, MsgFlags};

/// How the stub answers registration requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterMode {
    /// Answer in protocol.
    Accept,
    /// Echo a wrong `msg_id` (protocol violation).
    WrongMsgId,
    /// Answer in protocol but with a failure status.
    Refuse,
}

pub struct StubController {
    path: PathBuf,
    registrations: Arc<AtomicUsize>,
    channels: mpsc::Receiver<StackChannel>,
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl StubController {
    /// Start a stub controller with the given registration behavior and
    /// channel geometry.
    pub fn spawn(mode: RegisterMode, config: ChannelConfig) -> StubController {
        static SEQ: AtomicUsize = AtomicUsize::new(0);
        let seq = SEQ.fetch_add(1, Ordering::Relaxed);
        let path = std::env::temp_dir().join(format!(
            "nsaas-stub-{}-{seq}.sock",
            std::process::id()
        ));
        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path).expect("bind stub controller socket");
        listener
            .set_nonblocking(true)
            .expect("nonblocking listener");

        let registrations = Arc::new(AtomicUsize::new(0));
        let shutdown = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel();

        let thread = {
            let registrations = registrations.clone();
            let shutdown = shutdown.clone();
            std::thread::spawn(move || {
                serve(&listener, mode, config, &registrations, &shutdown, &tx);
            })
        };

        StubController {
            path,
            registrations,
            channels: rx,
            shutdown,
            thread: Some(thread),
        }
    }

    /// The control socket path applications should connect to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Registration requests the stub has seen.
    pub fn register_count(&self) -> usize {
        self.registrations.load(Ordering::Relaxed)
    }

    /// The stack-side handle of the next channel the stub created.
    pub fn take_channel(&self) -> StackChannel {
        self.channels
            .recv_timeout(Duration::from_secs(5))
            .expect("stub controller created no channel")
    }
}

impl Drop for StubController {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        let _ = std::fs::remove_file(&self.path);
    }
}

fn serve(
    listener: &UnixListener,
    mode: RegisterMode,
    config: ChannelConfig,
    registrations: &AtomicUsize,
    shutdown: &AtomicBool,
    channels: &mpsc::Sender<StackChannel>,
) {
    // Registration connections stay open for the "application lifetime";
    // dropping them early would read as de-registration.
    let mut held = Vec::new();
    let mut chan_seq = 0usize;

    while !shutdown.load(Ordering::Relaxed) {
        match listener.accept() {
            Ok((stream, _)) => {
                stream.set_nonblocking(false).expect("blocking stream");
                if let Some(stream) =
                    handle_connection(stream, mode, config, registrations, &mut chan_seq, channels)
                {
                    held.push(stream);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(2));
            }
            Err(_) => break,
        }
    }
}

/// Answer one connection. Returns the stream when it must be kept open
/// (registration connections).
fn handle_connection(
    mut stream: UnixStream,
    mode: RegisterMode,
    config: ChannelConfig,
    registrations: &AtomicUsize,
    chan_seq: &mut usize,
    channels: &mpsc::Sender<StackChannel>,
) -> Option<UnixStream> {
    let mut wire = [0u8; CTRL_MSG_BYTES];
    stream.read_exact(&mut wire).ok()?;
    let req = CtrlMsg::from_bytes(&wire);

    match req.msg_kind() {
        Some(MsgKind::ReqRegister) => {
            registrations.fetch_add(1, Ordering::Relaxed);
            let resp = match mode {
                RegisterMode::Accept => CtrlMsg::response_to(&req, STATUS_SUCCESS),
                RegisterMode::WrongMsgId => {
                    let mut resp = CtrlMsg::response_to(&req, STATUS_SUCCESS);
                    resp.msg_id = req.msg_id.wrapping_add(1);
                    resp
                }
                RegisterMode::Refuse => CtrlMsg::response_to(&req, -1),
            };
            write_record(&stream, &resp, None);
            Some(stream)
        }
        Some(MsgKind::ReqChannel) => {
            *chan_seq += 1;
            let name = format!("nsaas-stub-chan-{chan_seq}");
            let (fd, stack) = create(&name, config).expect("stub channel creation");
            let resp = CtrlMsg::response_to(&req, STATUS_SUCCESS);
            write_record(&stream, &resp, Some(fd.as_raw_fd()));
            channels.send(stack).expect("hand channel to test");
            None
        }
        _ => None,
    }
}

fn write_record(stream: &UnixStream, msg: &CtrlMsg, fd: Option<i32>) {
    let iov = [IoSlice::new(msg.as_bytes())];
    let sent = if let Some(raw) = fd {
        let fds = [raw];
        let cmsgs = [ControlMessage::ScmRights(&fds)];
        sendmsg::<()>(stream.as_raw_fd(), &iov, &cmsgs, MsgFlags::empty(), None)
    } else {
        sendmsg::<()>(stream.as_raw_fd(), &iov, &[], MsgFlags::empty(), None)
    }
    .expect("stub response send");
    assert_eq!(sent, CTRL_MSG_BYTES);
}

/// One observed buffer of a chain on the stack side.
#[derive(Debug, Clone)]
pub struct ChainBuf {
    pub index: u32,
    pub flags: u32,
    pub data_len: u32,
    pub msg_len: u32,
    pub last: u32,
    pub next: u32,
    pub flow: Flow,
    pub payload: Vec<u8>,
}

/// Walk a message chain from its head index, copying what the stack would
/// see.
pub fn collect_chain(stack: &StackChannel, head: u32) -> Vec<ChainBuf> {
    let mut out = Vec::new();
    let mut index = head;
    loop {
        let buf = stack.buf(index);
        let chained = buf.has_flags(BUF_FLAG_SG);
        let next = buf.next();
        out.push(ChainBuf {
            index,
            flags: buf.flags(),
            data_len: buf.data_len(),
            msg_len: buf.msg_len(),
            last: buf.last(),
            next,
            flow: buf.flow(),
            payload: buf.data(0).to_vec(),
        });
        if chained {
            index = next;
        } else {
            break;
        }
    }
    out
}

/// Return every buffer of `chain` to the pool.
pub fn free_chain(stack: &StackChannel, chain: &[ChainBuf]) {
    let indices: Vec<u32> = chain.iter().map(|b| b.index).collect();
    assert_eq!(stack.buf_free_bulk(&indices), indices.len());
}

/// Move one pending message from the app ring back onto the stack ring,
/// unchanged. Returns the head index moved, if any was pending.
pub fn echo_one(stack: &StackChannel) -> Option<u32> {
    let mut head = [0u32; 1];
    if stack.app_ring_dequeue(&mut head) == 1 {
        assert_eq!(stack.stack_ring_enqueue(&head), 1);
        Some(head[0])
    } else {
        None
    }
}

/// [`echo_one`], waiting up to five seconds for a message to appear.
pub fn echo_one_blocking(stack: &StackChannel) -> u32 {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(head) = echo_one(stack) {
            return head;
        }
        assert!(Instant::now() < deadline, "no message reached the stub");
        std::thread::sleep(Duration::from_millis(1));
    }
}

/// Complete the next pending control submission with `status`. CreateFlow
/// completions get the stack-assigned source port filled in.
pub fn complete_next_ctrl(stack: &StackChannel, status: u32) -> bool {
    let Some(req) = stack.ctrl_sq_dequeue() else {
        return false;
    };
    let flow = match req.op() {
        Some(CtrlOp::CreateFlow) => Flow {
            src_ip: req.flow_info.src_ip,
            dst_ip: req.flow_info.dst_ip,
            src_port: 55_555,
            dst_port: req.flow_info.dst_port,
        },
        _ => Flow::default(),
    };
    assert!(stack.ctrl_cq_enqueue(&CtrlQueueEntry::completion(&req, status, flow)));
    true
}

/// Install the env-filtered test subscriber once per process.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
