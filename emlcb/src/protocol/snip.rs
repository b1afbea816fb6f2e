//! Simple Node Information Protocol handler
//!
//! The reply carries, in order: manufacturer version byte, four
//! null-terminated manufacturer strings, user version byte, and the two
//! null-terminated user strings read from configuration memory. A
//! well-formed reply contains exactly six terminators.

use emlcb_core::Mti;

use super::Outgoing;
use crate::buffer::{MsgView, EXTENDED_PAYLOAD};
use crate::node::params::acdi;
use crate::node::Node;
use crate::platform::Platform;

/// Terminators in a complete SNIP reply.
pub const NULL_COUNT: usize = 6;

/// Copies a string field capped at `max` bytes including its terminator:
/// longer sources truncate to `max - 1` and terminate.
pub(crate) fn push_string(out: &mut Outgoing, source: &str, max: usize) {
    let bytes = source.as_bytes();
    let take = bytes.len().min(max - 1);
    unwrap!(out.msg.extend(&bytes[..take]));
    unwrap!(out.msg.push(0));
}

/// Copies a user string out of configuration memory: reads up to `max - 1`
/// bytes at `address`, cuts at the first terminator, terminates.
fn push_config_string<P: Platform>(
    out: &mut Outgoing,
    node: &Node,
    platform: &mut P,
    address: u32,
    max: usize,
) {
    let mut buffer = [0u8; acdi::USER_DESCRIPTION_LEN];
    let read = platform.config_memory_read(node.id, address, &mut buffer[..max - 1]);
    let text = &buffer[..read];
    let end = text.iter().position(|&byte| byte == 0).unwrap_or(read);
    unwrap!(out.msg.extend(&text[..end]));
    unwrap!(out.msg.push(0));
}

pub fn handle_simple_node_info_request<P: Platform>(
    node: &Node,
    msg: MsgView<'_>,
    out: &mut Outgoing,
    platform: &mut P,
) {
    let snip = &node.parameters.snip;
    out.msg
        .load_reply(node.alias, node.id, msg.header, Mti::SIMPLE_NODE_INFO_REPLY);

    unwrap!(out.msg.push(snip.mfg_version));
    push_string(out, snip.name, acdi::MANUFACTURER_LEN);
    push_string(out, snip.model, acdi::MODEL_LEN);
    push_string(out, snip.hardware_version, acdi::HARDWARE_VERSION_LEN);
    push_string(out, snip.software_version, acdi::SOFTWARE_VERSION_LEN);

    unwrap!(out.msg.push(snip.user_version));
    let base = node.parameters.user_data_offset;
    push_config_string(out, node, platform, base, acdi::USER_NAME_LEN);
    push_config_string(
        out,
        node,
        platform,
        base + acdi::USER_NAME_LEN as u32,
        acdi::USER_DESCRIPTION_LEN,
    );

    out.valid = true;
}

/// Checks a received SNIP reply: right MTI, fits the extended buffer, and
/// exactly six terminators.
pub fn validate_reply(msg: MsgView<'_>) -> bool {
    msg.header.mti == Mti::SIMPLE_NODE_INFO_REPLY
        && msg.payload.len() <= EXTENDED_PAYLOAD
        && msg.payload.iter().filter(|&&byte| byte == 0).count() == NULL_COUNT
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::Header;
    use crate::node::test_support::TEST_PARAMETERS;
    use emlcb_core::{Alias, NodeId};
    use emlcb_driver::frame::CanFrame;

    struct FakeConfigMem;

    impl Platform for FakeConfigMem {
        fn try_transmit(&mut self, _frame: &CanFrame) -> bool {
            true
        }

        fn config_memory_read(&mut self, _node: NodeId, address: u32, buffer: &mut [u8]) -> usize {
            let stored: &[u8] = if address == 0 { b"Name\0" } else { b"Description\0" };
            let take = stored.len().min(buffer.len());
            buffer[..take].copy_from_slice(&stored[..take]);
            take
        }
    }

    #[test]
    fn test_snip_reply_layout() {
        let mut node = Node::new(NodeId::new(0x0203_0405_0607).unwrap(), &TEST_PARAMETERS);
        node.alias = Alias::new(0x123).unwrap();
        let header = Header {
            mti: Mti::SIMPLE_NODE_INFO_REQUEST,
            source_alias: Alias::new(0x777).unwrap(),
            source_id: NodeId::NULL,
            dest_alias: node.alias,
            dest_id: NodeId::NULL,
        };
        let mut out = Outgoing::new();
        handle_simple_node_info_request(
            &node,
            MsgView {
                header: &header,
                payload: &[],
            },
            &mut out,
            &mut FakeConfigMem,
        );

        assert!(out.valid);
        let mut expected = heapless::Vec::<u8, 128>::new();
        expected.push(0x04).unwrap();
        expected.extend_from_slice(b"Mustangpeak Engineering\0").unwrap();
        expected.extend_from_slice(b"TurnoutBOSS\0").unwrap();
        expected.extend_from_slice(b"Ver A\0").unwrap();
        expected.extend_from_slice(b"0.1\0").unwrap();
        expected.push(0x02).unwrap();
        expected.extend_from_slice(b"Name\0").unwrap();
        expected.extend_from_slice(b"Description\0").unwrap();
        assert_eq!(out.msg.payload(), &expected[..]);

        let reply_header = Header {
            mti: Mti::SIMPLE_NODE_INFO_REPLY,
            ..header
        };
        assert!(validate_reply(MsgView {
            header: &reply_header,
            payload: out.msg.payload(),
        }));
    }

    #[test]
    fn test_string_truncation() {
        let mut out = Outgoing::new();
        push_string(&mut out, "abcdefgh", 5);
        assert_eq!(out.msg.payload(), b"abcd\0");
    }

    #[test]
    fn test_validate_reply_null_count() {
        let header = Header {
            mti: Mti::SIMPLE_NODE_INFO_REPLY,
            source_alias: Alias::new(1).unwrap(),
            source_id: NodeId::NULL,
            dest_alias: Alias::new(2).unwrap(),
            dest_id: NodeId::NULL,
        };
        let five_nulls = [4, 0, 0, 0, 0, 2, 0];
        assert!(!validate_reply(MsgView {
            header: &header,
            payload: &five_nulls,
        }));
        let six_nulls = [4, 0, 0, 0, 0, 2, 0, 0];
        assert!(validate_reply(MsgView {
            header: &header,
            payload: &six_nulls,
        }));
    }
}
