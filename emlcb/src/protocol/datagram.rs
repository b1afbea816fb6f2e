//! Datagram transport handler [4; 3]
//!
//! Every datagram is acknowledged before it is acted on: validation backs
//! an immediate Datagram Received OK (with the reply-pending hint when a
//! data reply will follow) or Datagram Rejected with the failing code. An
//! accepted request is retained on the node and the reply is produced on a
//! later dispatcher pass via [`DatagramStage`].

use emlcb_core::{ErrorCode, Mti};

use super::{config_mem, Outgoing};
use crate::buffer::{Handle, MsgView};
use crate::node::{DatagramStage, Node};
use crate::platform::Platform;

const REPLY_PENDING: u8 = 0x80;

/// Maps the platform's reply budget to the 2^N-seconds exponent of the
/// acknowledgement, clamped to the protocol's four bits.
fn reply_pending_exponent(seconds: u16) -> u8 {
    if seconds == 0 {
        return 0;
    }
    let mut exponent = 0u8;
    while (1u32 << exponent) < u32::from(seconds) && exponent < 15 {
        exponent += 1;
    }
    exponent.max(1)
}

fn load_received_ok(node: &Node, msg: &MsgView<'_>, out: &mut Outgoing, flags: u8) {
    out.msg
        .load_reply(node.alias, node.id, msg.header, Mti::DATAGRAM_OK_REPLY);
    unwrap!(out.msg.push(flags));
    out.valid = true;
}

fn load_rejected(node: &Node, msg: &MsgView<'_>, out: &mut Outgoing, code: ErrorCode) {
    out.msg
        .load_reply(node.alias, node.id, msg.header, Mti::DATAGRAM_REJECTED_REPLY);
    unwrap!(out.msg.extend(&code.to_bytes()));
    out.valid = true;
}

/// Step one of datagram processing. Returns `true` when the request was
/// accepted and its buffer handed to the node for the step-two reply.
pub fn handle_datagram<P: Platform>(
    node: &mut Node,
    msg: MsgView<'_>,
    handle: Handle,
    out: &mut Outgoing,
    platform: &mut P,
) -> bool {
    // A new request from the same peer before our reply drained supersedes
    // nothing; it is refused as busy and retried by the peer.
    if node.datagram_stage != DatagramStage::Idle {
        load_rejected(node, &msg, out, ErrorCode::TEMPORARY_BUFFER_UNAVAILABLE);
        return false;
    }

    let op = match config_mem::parse(msg.payload) {
        Ok(op) => op,
        Err(code) => {
            load_rejected(node, &msg, out, code);
            return false;
        }
    };
    if let Err(code) = config_mem::validate(node, &op) {
        load_rejected(node, &msg, out, code);
        return false;
    }

    let mut flags = 0;
    if op.expects_reply() {
        let space = match op {
            config_mem::Op::Read(t) | config_mem::Op::Write(t) | config_mem::Op::WriteUnderMask(t) => t.space,
            _ => 0,
        };
        flags = REPLY_PENDING | reply_pending_exponent(platform.delayed_reply_time(node.id, space));
    }
    load_received_ok(node, &msg, out, flags);

    node.datagram_stage = DatagramStage::AckSent(handle);
    node.last_received_datagram = Some(handle);
    true
}

/// Step two, run by the dispatcher once the acknowledgement has drained.
/// Returns the handle to release.
pub fn finish_datagram<P: Platform>(
    node: &mut Node,
    msg: MsgView<'_>,
    out: &mut Outgoing,
    platform: &mut P,
) -> Option<Handle> {
    let DatagramStage::AckSent(handle) = node.datagram_stage else {
        return None;
    };
    config_mem::execute(node, msg, out, platform);
    node.datagram_stage = DatagramStage::Idle;
    node.last_received_datagram = None;
    Some(handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{Class, Header, Store};
    use crate::node::test_support::TEST_PARAMETERS;
    use emlcb_core::{Alias, NodeId};
    use emlcb_driver::frame::CanFrame;

    struct FakeMem {
        delay: u16,
    }

    impl Platform for FakeMem {
        fn try_transmit(&mut self, _frame: &CanFrame) -> bool {
            true
        }

        fn config_memory_read(&mut self, _node: NodeId, _address: u32, buffer: &mut [u8]) -> usize {
            for (i, byte) in buffer.iter_mut().enumerate() {
                *byte = i as u8;
            }
            buffer.len()
        }

        fn delayed_reply_time(&mut self, _node: NodeId, _space: u8) -> u16 {
            self.delay
        }
    }

    fn test_node() -> Node {
        let mut node = Node::new(NodeId::new(0x0203_0405_0607).unwrap(), &TEST_PARAMETERS);
        node.alias = Alias::new(0x123).unwrap();
        node.flags.permitted = true;
        node.flags.initialized = true;
        node
    }

    fn header(node: &Node) -> Header {
        Header {
            mti: Mti::DATAGRAM,
            source_alias: Alias::new(0x777).unwrap(),
            source_id: NodeId::NULL,
            dest_alias: node.alias,
            dest_id: NodeId::NULL,
        }
    }

    #[test]
    fn test_exponent_encoding() {
        assert_eq!(reply_pending_exponent(0), 0);
        assert_eq!(reply_pending_exponent(1), 1);
        assert_eq!(reply_pending_exponent(2), 1);
        assert_eq!(reply_pending_exponent(3), 2);
        assert_eq!(reply_pending_exponent(4), 2);
        assert_eq!(reply_pending_exponent(1024), 10);
        assert_eq!(reply_pending_exponent(u16::MAX), 15);
    }

    #[test]
    fn test_two_step_read() {
        let mut node = test_node();
        let mut platform = FakeMem { delay: 2 };
        let mut store: Store<2, 2> = Store::new();
        let request = [0x20, 0x41, 0, 0, 0, 0, 0x10];

        let handle = store.allocate(Class::Extended).unwrap();
        *store.header_mut(handle) = header(&node);
        store.append(handle, &request).unwrap();

        let mut out = Outgoing::new();
        let retained = handle_datagram(
            &mut node,
            store.view(handle),
            handle,
            &mut out,
            &mut platform,
        );
        assert!(retained);
        assert_eq!(out.msg.header.mti, Mti::DATAGRAM_OK_REPLY);
        assert_eq!(out.msg.payload(), &[REPLY_PENDING | 1]);
        assert_eq!(node.datagram_stage, DatagramStage::AckSent(handle));

        // Ack drained; the dispatcher runs step two.
        let mut out = Outgoing::new();
        let released = finish_datagram(&mut node, store.view(handle), &mut out, &mut platform);
        assert_eq!(released, Some(handle));
        assert_eq!(node.datagram_stage, DatagramStage::Idle);
        assert!(out.valid);
        assert_eq!(out.msg.header.mti, Mti::DATAGRAM);
        assert_eq!(&out.msg.payload()[..6], &[0x20, 0x51, 0, 0, 0, 0]);
        assert_eq!(out.msg.payload().len(), 6 + 16);
    }

    #[test]
    fn test_rejected_without_retaining() {
        let mut node = test_node();
        let mut platform = FakeMem { delay: 0 };
        let request = [0x20u8, 0x41, 0, 0, 0x02, 0x00, 0x10];
        let head = header(&node);
        let msg = MsgView {
            header: &head,
            payload: &request,
        };

        let mut out = Outgoing::new();
        let retained = handle_datagram(
            &mut node,
            msg,
            crate::buffer::Store::<1, 1>::new().allocate(Class::Basic).unwrap(),
            &mut out,
            &mut platform,
        );
        assert!(!retained);
        assert_eq!(out.msg.header.mti, Mti::DATAGRAM_REJECTED_REPLY);
        assert_eq!(
            out.msg.payload(),
            &ErrorCode::PERMANENT_OUT_OF_BOUNDS.to_bytes()
        );
        assert_eq!(node.datagram_stage, DatagramStage::Idle);
    }

    #[test]
    fn test_busy_node_rejects_temporarily() {
        let mut node = test_node();
        let mut platform = FakeMem { delay: 0 };
        let mut store: Store<2, 2> = Store::new();
        let request = [0x20, 0x41, 0, 0, 0, 0, 0x08];

        let first = store.allocate(Class::Extended).unwrap();
        *store.header_mut(first) = header(&node);
        store.append(first, &request).unwrap();
        let mut out = Outgoing::new();
        assert!(handle_datagram(&mut node, store.view(first), first, &mut out, &mut platform));

        let second = store.allocate(Class::Extended).unwrap();
        *store.header_mut(second) = header(&node);
        store.append(second, &request).unwrap();
        let mut out = Outgoing::new();
        let retained =
            handle_datagram(&mut node, store.view(second), second, &mut out, &mut platform);
        assert!(!retained);
        assert_eq!(out.msg.header.mti, Mti::DATAGRAM_REJECTED_REPLY);
        assert_eq!(
            out.msg.payload(),
            &ErrorCode::TEMPORARY_BUFFER_UNAVAILABLE.to_bytes()
        );
    }

    #[test]
    fn test_no_reply_commands_skip_pending_flag() {
        let mut node = test_node();
        let mut platform = FakeMem { delay: 4 };
        let request = [0x20, 0xA9];
        let head = header(&node);
        let msg = MsgView {
            header: &head,
            payload: &request,
        };
        let handle = crate::buffer::Store::<1, 1>::new().allocate(Class::Basic).unwrap();

        let mut out = Outgoing::new();
        handle_datagram(&mut node, msg, handle, &mut out, &mut platform);
        assert_eq!(out.msg.payload(), &[0x00]);
    }
}
