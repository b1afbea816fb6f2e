//! Configuration memory exchanges over datagrams.

mod common;

use common::*;
use emlcb::core::Mti;
use emlcb::frame::FrameType;

#[test]
fn test_read_sixteen_bytes_two_step() {
    let frames = new_fifo();
    let mut stack = new_stack(&frames);
    stack.allocate_node(NODE_ID, &PARAMETERS).unwrap();
    run_login(&mut stack);
    let alias = node_alias(&stack);
    stack.platform().frames.clear();

    // Backing store holds 0x00..0x0F at address 0x80.
    frames
        .push(datagram_frame(alias, &[0x20, 0x41, 0x00, 0x00, 0x00, 0x80, 0x10]))
        .unwrap();
    stack.poll();

    // First outbound: the acknowledgement with the reply-pending flag.
    let acks = frames_with_mti(stack.platform(), Mti::DATAGRAM_OK_REPLY);
    assert_eq!(acks.len(), 1);
    assert_eq!(acks[0].dest_alias(), Some(PEER_ALIAS));
    assert_eq!(acks[0].data[2], 0x80);

    // Second outbound: the data reply as a datagram back to the peer.
    for _ in 0..8 {
        stack.poll();
    }
    let reply_frames = datagram_frames_to_peer(stack.platform());
    assert_eq!(reply_frames.len(), 3);
    assert_eq!(reply_frames[0].id.frame_type(), FrameType::DatagramFirst);
    assert_eq!(reply_frames[2].id.frame_type(), FrameType::DatagramFinal);

    let payload = reassemble_datagram(&reply_frames);
    let mut expected = vec![0x20, 0x51, 0x00, 0x00, 0x00, 0x80];
    expected.extend_from_slice(&[
        0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0A, 0x0B, 0x0C, 0x0D, 0x0E,
        0x0F,
    ]);
    assert_eq!(payload, expected);

    // The retained request buffer was released.
    assert_eq!(
        stack.node(0).unwrap().datagram_stage,
        emlcb::node::DatagramStage::Idle
    );
}

#[test]
fn test_out_of_bounds_read_rejected() {
    let frames = new_fifo();
    let mut stack = new_stack(&frames);
    stack.allocate_node(NODE_ID, &PARAMETERS).unwrap();
    run_login(&mut stack);
    let alias = node_alias(&stack);
    stack.platform().frames.clear();

    // Space 0xFD ends at 0x1FF.
    frames
        .push(datagram_frame(alias, &[0x20, 0x41, 0x00, 0x00, 0x02, 0x00, 0x08]))
        .unwrap();
    for _ in 0..4 {
        stack.poll();
    }

    let rejects = frames_with_mti(stack.platform(), Mti::DATAGRAM_REJECTED_REPLY);
    assert_eq!(rejects.len(), 1);
    assert_eq!(&rejects[0].data[2..], &[0x10, 0x02]);
    assert!(datagram_frames_to_peer(stack.platform()).is_empty());
}

#[test]
fn test_write_then_read_back() {
    let frames = new_fifo();
    let mut stack = new_stack(&frames);
    stack.allocate_node(NODE_ID, &PARAMETERS).unwrap();
    run_login(&mut stack);
    let alias = node_alias(&stack);
    stack.platform().frames.clear();

    frames
        .push(datagram_frame(
            alias,
            &[0x20, 0x01, 0x00, 0x00, 0x01, 0x00, 0xCA, 0xFE],
        ))
        .unwrap();
    for _ in 0..8 {
        stack.poll();
    }
    let write_reply = reassemble_datagram(&datagram_frames_to_peer(stack.platform()));
    assert_eq!(write_reply, vec![0x20, 0x11, 0x00, 0x00, 0x01, 0x00]);
    stack.platform().frames.clear();

    frames
        .push(datagram_frame(alias, &[0x20, 0x41, 0x00, 0x00, 0x01, 0x00, 0x02]))
        .unwrap();
    for _ in 0..8 {
        stack.poll();
    }
    let read_reply = reassemble_datagram(&datagram_frames_to_peer(stack.platform()));
    assert_eq!(read_reply, vec![0x20, 0x51, 0x00, 0x00, 0x01, 0x00, 0xCA, 0xFE]);
}

#[test]
fn test_reboot_command() {
    let frames = new_fifo();
    let mut stack = new_stack(&frames);
    stack.allocate_node(NODE_ID, &PARAMETERS).unwrap();
    run_login(&mut stack);
    let alias = node_alias(&stack);

    frames.push(datagram_frame(alias, &[0x20, 0xA9])).unwrap();
    for _ in 0..4 {
        stack.poll();
    }
    assert!(stack.platform().rebooted);
}
