//! Duplicate Node ID detection.

mod common;

use common::*;
use emlcb::core::{EventId, Mti};

#[test]
fn test_duplicate_node_id_reported_once() {
    let frames = new_fifo();
    let mut stack = new_stack(&frames);
    stack.allocate_node(NODE_ID, &PARAMETERS).unwrap();
    run_login(&mut stack);
    stack.platform().frames.clear();

    // Another node claims to hold our id.
    frames
        .push(global_frame(Mti::VERIFIED_NODE_ID, &NODE_ID.to_bytes()))
        .unwrap();
    for _ in 0..4 {
        stack.poll();
    }

    let reports = frames_with_mti(stack.platform(), Mti::PC_EVENT_REPORT);
    assert_eq!(reports.len(), 1);
    assert_eq!(
        &reports[0].data[..],
        &EventId::DUPLICATE_NODE_DETECTED.to_bytes()
    );
    assert!(stack.node(0).unwrap().flags.duplicate_id_detected);

    // The identical stimulus is now silent.
    frames
        .push(global_frame(Mti::VERIFIED_NODE_ID, &NODE_ID.to_bytes()))
        .unwrap();
    for _ in 0..4 {
        stack.poll();
    }
    assert_eq!(frames_with_mti(stack.platform(), Mti::PC_EVENT_REPORT).len(), 1);
}

#[test]
fn test_foreign_verified_id_ignored() {
    let frames = new_fifo();
    let mut stack = new_stack(&frames);
    stack.allocate_node(NODE_ID, &PARAMETERS).unwrap();
    run_login(&mut stack);
    stack.platform().frames.clear();

    let other = emlcb::core::NodeId::new(0x0A0B_0C0D_0E0F).unwrap();
    frames
        .push(global_frame(Mti::VERIFIED_NODE_ID, &other.to_bytes()))
        .unwrap();
    for _ in 0..4 {
        stack.poll();
    }
    assert!(frames_with_mti(stack.platform(), Mti::PC_EVENT_REPORT).is_empty());
    assert!(!stack.node(0).unwrap().flags.duplicate_id_detected);
}
