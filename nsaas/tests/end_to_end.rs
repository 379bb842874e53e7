// SPDX-License-Identifier: Apache-2.0
// Copyright NSaaS Authors

//! End-to-end scenarios against the stub controller: the full register /
//! attach path over the control socket, flow setup over the in-channel
//! queues, and the segmented datapath in both directions.

mod common;

use std::time::{Duration, Instant};

use channel::{
    ChannelConfig, Channel, CtrlQueueEntry, Flow, StackChannel, BUF_FLAG_FIN, BUF_FLAG_SG,
    BUF_FLAG_SYN, CTRL_STATUS_FAILURE, CTRL_STATUS_OK,
};
use nsaas::{
    attach, connect, listen, recv, recvmsg, send, sendmmsg, sendmsg, Client, ControllerConfig,
    CtrlError, FlowError, RecvError, SendError, SendMsgHdr,
};

use common::{
    collect_chain, complete_next_ctrl, echo_one_blocking, free_chain, init_tracing, RegisterMode,
    StubController,
};

fn test_flow() -> Flow {
    Flow::new(
        "10.0.0.1".parse().unwrap(),
        1234,
        "10.0.0.2".parse().unwrap(),
        80,
    )
}

/// Register + attach against the stub, returning both channel ends.
fn attached_pair(stub: &StubController) -> (Client, Channel, StackChannel) {
    let client = Client::new(ControllerConfig::with_path(stub.path()));
    client.register().expect("registration");
    let ch = attach(&client).expect("attach");
    let stack = stub.take_channel();
    (client, ch, stack)
}

/// Create a channel directly, skipping the control socket, for datapath
/// scenarios.
fn direct_channel(config: ChannelConfig) -> (Channel, StackChannel) {
    let (fd, stack) = channel::create("e2e-direct", config).expect("create channel");
    (Channel::bind(fd).expect("bind channel"), stack)
}

#[test]
fn s1_single_buffer_send_recv() {
    init_tracing();
    let stub = StubController::spawn(
        RegisterMode::Accept,
        ChannelConfig {
            desc_ring_slots: 16,
            buf_count: 64,
            buf_mss: 2048,
        },
    );
    let (_client, mut ch, stack) = attached_pair(&stub);
    let baseline = ch.free_buf_count();
    let flow = test_flow();

    send(&mut ch, flow, b"hello").unwrap();

    // The stack observes a one-buffer chain carrying the whole message.
    let head = echo_one_blocking(&stack);
    let chain = collect_chain(&stack, head);
    assert_eq!(chain.len(), 1);
    assert_eq!(chain[0].flags, BUF_FLAG_SYN | BUF_FLAG_FIN);
    assert_eq!(chain[0].msg_len, 5);
    assert_eq!(chain[0].last, chain[0].index);
    assert_eq!(chain[0].flow, flow);
    assert_eq!(chain[0].payload, b"hello");

    // Echoed back: the application reads the same bytes and flow.
    let mut buf = [0u8; 64];
    let (len, got_flow) = recv(&mut ch, &mut buf).unwrap().expect("echoed message");
    assert_eq!(len, 5);
    assert_eq!(got_flow, flow);
    assert_eq!(&buf[..5], b"hello");

    assert_eq!(ch.free_buf_count(), baseline);
    assert!(recv(&mut ch, &mut buf).unwrap().is_none());
}

#[test]
fn s2_three_buffer_segmented_send() {
    init_tracing();
    let (mut ch, stack) = direct_channel(ChannelConfig {
        desc_ring_slots: 16,
        buf_count: 64,
        buf_mss: 100,
    });
    let baseline = ch.free_buf_count();

    #[allow(clippy::cast_possible_truncation)]
    let payload: Vec<u8> = (0..250).map(|i| i as u8).collect();
    send(&mut ch, test_flow(), &payload).unwrap();

    // Consume the message on the stack side and inspect the chain as the
    // stack would, without echoing it back.
    let mut head = [0u32; 1];
    assert_eq!(stack.app_ring_dequeue(&mut head), 1);
    let chain = collect_chain(&stack, head[0]);
    assert_eq!(chain.len(), 3);
    assert_eq!(chain[0].flags, BUF_FLAG_SYN | BUF_FLAG_SG);
    assert_eq!(chain[1].flags, BUF_FLAG_SG);
    assert_eq!(chain[2].flags, BUF_FLAG_FIN);
    assert_eq!(
        chain.iter().map(|b| b.data_len).collect::<Vec<_>>(),
        [100, 100, 50]
    );
    assert_eq!(chain[0].msg_len, 250);
    assert_eq!(chain[0].last, chain[2].index);
    let gathered: Vec<u8> = chain.iter().flat_map(|b| b.payload.clone()).collect();
    assert_eq!(gathered, payload);

    free_chain(&stack, &chain);
    assert_eq!(ch.free_buf_count(), baseline);
}

#[test]
fn s3_scatter_gather_round_trip() {
    init_tracing();
    let (mut ch, stack) = direct_channel(ChannelConfig {
        desc_ring_slots: 16,
        buf_count: 64,
        buf_mss: 200,
    });

    let first: Vec<u8> = (0..150u32).map(|i| (i % 251) as u8).collect();
    let second: Vec<u8> = (150..300u32).map(|i| (i % 251) as u8).collect();
    let segments: [&[u8]; 2] = [&first, &second];
    sendmsg(
        &mut ch,
        &SendMsgHdr {
            flow: test_flow(),
            flags: 0,
            segments: &segments,
        },
    )
    .unwrap();

    echo_one_blocking(&stack);

    let mut r0 = [0u8; 100];
    let mut r1 = [0u8; 100];
    let mut r2 = [0u8; 100];
    let mut recv_segments: [&mut [u8]; 3] = [&mut r0, &mut r1, &mut r2];
    let msg = recvmsg(&mut ch, &mut recv_segments)
        .unwrap()
        .expect("echoed message");
    assert_eq!(msg.len, 300);
    assert_eq!(msg.flow, test_flow());

    let mut sent = first.clone();
    sent.extend_from_slice(&second);
    let mut got = r0.to_vec();
    got.extend_from_slice(&r1);
    got.extend_from_slice(&r2);
    assert_eq!(got, sent);
}

#[test]
fn s4_control_plane_timeout() {
    init_tracing();
    let (mut ch, stack) = direct_channel(ChannelConfig::default());

    // Nobody completes the request: listen gives up after its ten-second
    // poll budget.
    let started = Instant::now();
    let err = listen(&mut ch, "10.0.0.1", 9000).unwrap_err();
    let elapsed = started.elapsed();
    assert!(matches!(err, FlowError::TimedOut));
    assert!(elapsed >= Duration::from_secs(9), "gave up after {elapsed:?}");

    // Exactly the one submission reached the stack, and nothing is left in
    // flight on the completion queue.
    assert!(stack.ctrl_sq_dequeue().is_some());
    assert!(stack.ctrl_sq_dequeue().is_none());
    assert!(ch.ctrl_cq_dequeue().is_none());
}

#[test]
fn s5_registration_protocol_mismatch() {
    init_tracing();
    let stub = StubController::spawn(RegisterMode::WrongMsgId, ChannelConfig::default());
    let client = Client::new(ControllerConfig::with_path(stub.path()));

    let err = client.register().unwrap_err();
    assert!(matches!(err, CtrlError::MsgIdMismatch { .. }));
    assert!(!client.is_registered());
    assert_eq!(stub.register_count(), 1);
}

#[test]
fn s6_overlength_receive_reclaims_chain() {
    init_tracing();
    let (mut ch, stack) = direct_channel(ChannelConfig {
        desc_ring_slots: 16,
        buf_count: 64,
        buf_mss: 256,
    });
    let baseline = ch.free_buf_count();

    // Five buffers' worth of message, one 256-byte receive segment.
    let payload = vec![0x5au8; 1200];
    send(&mut ch, test_flow(), &payload).unwrap();
    echo_one_blocking(&stack);

    let mut small = [0u8; 256];
    let err = recv(&mut ch, &mut small).unwrap_err();
    assert!(matches!(err, RecvError::Truncated { provided: 256 }));

    // Every buffer of the chain is back in the pool, and the message is
    // gone.
    assert_eq!(ch.free_buf_count(), baseline);
    assert!(recv(&mut ch, &mut small).unwrap().is_none());
}

#[test]
fn message_boundaries_survive_batched_sends() {
    init_tracing();
    let (mut ch, stack) = direct_channel(ChannelConfig {
        desc_ring_slots: 16,
        buf_count: 64,
        buf_mss: 8,
    });
    let baseline = ch.free_buf_count();

    let payloads: [&[u8]; 3] = [b"alpha", b"bravo-bravo", b"charlie-charlie-x"];
    let flow = test_flow();
    let seg0: [&[u8]; 1] = [payloads[0]];
    let seg1: [&[u8]; 1] = [payloads[1]];
    let seg2: [&[u8]; 1] = [payloads[2]];
    let msgs = [
        SendMsgHdr { flow, flags: 0, segments: &seg0 },
        SendMsgHdr { flow, flags: 0, segments: &seg1 },
        SendMsgHdr { flow, flags: 0, segments: &seg2 },
    ];
    assert_eq!(sendmmsg(&mut ch, &msgs), 3);
    for _ in 0..3 {
        echo_one_blocking(&stack);
    }

    // Three distinct messages come back, sizes and bytes intact, in order.
    for expected in payloads {
        let mut buf = [0u8; 64];
        let (len, _) = recv(&mut ch, &mut buf).unwrap().expect("message");
        assert_eq!(len, expected.len());
        assert_eq!(&buf[..len], expected);
    }
    assert!(recv(&mut ch, &mut [0u8; 64]).unwrap().is_none());
    assert_eq!(ch.free_buf_count(), baseline);
}

#[test]
fn ring_full_send_rolls_back_allocation() {
    init_tracing();
    let (mut ch, stack) = direct_channel(ChannelConfig {
        desc_ring_slots: 2,
        buf_count: 16,
        buf_mss: 64,
    });
    let baseline = ch.free_buf_count();
    let flow = test_flow();

    send(&mut ch, flow, b"one").unwrap();
    send(&mut ch, flow, b"two").unwrap();
    // Ring holds two heads; the third message must fail without costing
    // the pool anything.
    let err = send(&mut ch, flow, b"three").unwrap_err();
    assert!(matches!(err, SendError::RingFull));
    assert_eq!(ch.free_buf_count(), baseline - 2);

    // Drain and the pool returns to baseline.
    for _ in 0..2 {
        echo_one_blocking(&stack);
        let mut buf = [0u8; 64];
        recv(&mut ch, &mut buf).unwrap().expect("queued message");
    }
    assert_eq!(ch.free_buf_count(), baseline);
}

#[test]
fn pool_exhaustion_fails_send_without_side_effects() {
    init_tracing();
    let (mut ch, _stack) = direct_channel(ChannelConfig {
        desc_ring_slots: 16,
        buf_count: 8,
        buf_mss: 64,
    });
    let baseline = ch.free_buf_count();

    // Needs 16 buffers from a pool of 8.
    let payload = vec![0u8; 1024];
    let err = send(&mut ch, test_flow(), &payload).unwrap_err();
    assert!(matches!(err, SendError::NoBuffers { needed: 16 }));
    assert_eq!(ch.free_buf_count(), baseline);
}

#[test]
fn send_rejects_empty_and_oversize_messages() {
    init_tracing();
    let (mut ch, _stack) = direct_channel(ChannelConfig::default());

    assert!(matches!(
        send(&mut ch, test_flow(), b""),
        Err(SendError::EmptyMessage)
    ));

    // A segment list that sums to zero also counts as empty.
    let empty: [&[u8]; 0] = [];
    assert!(matches!(
        sendmsg(
            &mut ch,
            &SendMsgHdr {
                flow: test_flow(),
                flags: 0,
                segments: &empty
            }
        ),
        Err(SendError::EmptyMessage)
    ));

    let huge = vec![0u8; nsaas::MSG_MAX_LEN as usize + 1];
    assert!(matches!(
        send(&mut ch, test_flow(), &huge),
        Err(SendError::TooLong { .. })
    ));
}

#[test]
fn notify_delivery_flag_reaches_the_head_buffer() {
    init_tracing();
    let (mut ch, stack) = direct_channel(ChannelConfig {
        desc_ring_slots: 16,
        buf_count: 16,
        buf_mss: 64,
    });

    let segments: [&[u8]; 1] = [b"signal me"];
    sendmsg(
        &mut ch,
        &SendMsgHdr {
            flow: test_flow(),
            flags: nsaas::MSG_NOTIFY_DELIVERY,
            segments: &segments,
        },
    )
    .unwrap();

    let mut head = [0u32; 1];
    assert_eq!(stack.app_ring_dequeue(&mut head), 1);
    let chain = collect_chain(&stack, head[0]);
    assert_eq!(
        chain[0].flags,
        BUF_FLAG_SYN | BUF_FLAG_FIN | channel::BUF_FLAG_NOTIFY_DELIVERY
    );
    free_chain(&stack, &chain);
}

#[test]
fn detach_releases_the_mapping_silently() {
    init_tracing();
    let stub = StubController::spawn(RegisterMode::Accept, ChannelConfig::default());
    let (_client, ch, _stack) = attached_pair(&stub);
    // No control-plane traffic, no error: the handle is simply gone.
    nsaas::detach(ch);
}

#[test]
fn register_is_idempotent_through_the_stub() {
    init_tracing();
    let stub = StubController::spawn(RegisterMode::Accept, ChannelConfig::default());
    let client = Client::new(ControllerConfig::with_path(stub.path()));

    client.register().unwrap();
    client.register().unwrap();
    client.register().unwrap();
    assert_eq!(stub.register_count(), 1);
}

#[test]
fn registration_refusal_is_reported() {
    init_tracing();
    let stub = StubController::spawn(RegisterMode::Refuse, ChannelConfig::default());
    let client = Client::new(ControllerConfig::with_path(stub.path()));
    assert!(matches!(
        client.register(),
        Err(CtrlError::Refused { status: -1 })
    ));
    assert!(!client.is_registered());
}

#[test]
fn connect_completes_with_stack_assigned_port() {
    init_tracing();
    let (mut ch, stack) = direct_channel(ChannelConfig::default());

    std::thread::scope(|scope| {
        let worker = scope.spawn(|| connect(&mut ch, "10.0.0.1", "10.0.0.2", 888));

        // Service the submission like the controller would.
        let deadline = Instant::now() + Duration::from_secs(5);
        while !complete_next_ctrl(&stack, CTRL_STATUS_OK) {
            assert!(Instant::now() < deadline, "no submission observed");
            std::thread::sleep(Duration::from_millis(5));
        }

        let flow = worker.join().expect("connect thread").expect("connect");
        assert_eq!(flow.src_addr().to_string(), "10.0.0.1");
        assert_eq!(flow.dst_addr().to_string(), "10.0.0.2");
        assert_eq!(flow.dst_port, 888);
        assert_eq!(flow.src_port, 55_555);
    });
}

#[test]
fn listen_rejection_is_reported() {
    init_tracing();
    let (mut ch, stack) = direct_channel(ChannelConfig::default());

    std::thread::scope(|scope| {
        let worker = scope.spawn(|| listen(&mut ch, "10.0.0.1", 9000));

        let deadline = Instant::now() + Duration::from_secs(5);
        while !complete_next_ctrl(&stack, CTRL_STATUS_FAILURE) {
            assert!(Instant::now() < deadline, "no submission observed");
            std::thread::sleep(Duration::from_millis(5));
        }

        let err = worker.join().expect("listen thread").unwrap_err();
        assert!(matches!(err, FlowError::Rejected { status } if status == CTRL_STATUS_FAILURE));
    });
}

#[test]
fn flow_requests_reject_bad_addresses() {
    init_tracing();
    let (mut ch, _stack) = direct_channel(ChannelConfig::default());

    assert!(matches!(
        connect(&mut ch, "not-an-ip", "10.0.0.2", 1),
        Err(FlowError::InvalidAddress { .. })
    ));
    assert!(matches!(
        connect(&mut ch, "10.0.0.1", "0.0.0.0", 1),
        Err(FlowError::InvalidAddress { .. })
    ));
    assert!(matches!(
        listen(&mut ch, "255.255.255.255", 1),
        Err(FlowError::InvalidAddress { .. })
    ));
}

#[test]
fn mismatched_completion_id_is_a_protocol_error() {
    init_tracing();
    let (mut ch, stack) = direct_channel(ChannelConfig::default());

    // Pre-load a completion that echoes an id nothing submitted.
    let bogus = CtrlQueueEntry::completion(
        &CtrlQueueEntry::listen(41, 0x0a00_0001, 1),
        CTRL_STATUS_OK,
        Flow::default(),
    );
    assert!(stack.ctrl_cq_enqueue(&bogus));

    let err = listen(&mut ch, "10.0.0.1", 9000).unwrap_err();
    assert!(matches!(err, FlowError::IdMismatch { expected: 0, got: 41 }));
}
