//! Message network (identity layer) handler [2; 3.3]

use emlcb_core::{Alias, Mti, NodeId, ProtocolSupport};

use super::Outgoing;
use crate::buffer::MsgView;
use crate::node::Node;

fn payload_node_id(payload: &[u8]) -> Option<NodeId> {
    let bytes: [u8; 6] = payload.get(..6)?.try_into().ok()?;
    Some(NodeId::from_bytes(bytes))
}

fn load_verified_node_id(node: &Node, out: &mut Outgoing) {
    let mti = if node
        .parameters
        .protocol_support
        .contains(ProtocolSupport::SIMPLE)
    {
        Mti::VERIFIED_NODE_ID_SIMPLE
    } else {
        Mti::VERIFIED_NODE_ID
    };
    out.msg
        .load(node.alias, node.id, Alias::NULL, NodeId::NULL, mti);
    unwrap!(out.msg.push_node_id(node.id));
    out.valid = true;
}

/// Global verify: respond when the payload is empty or names us.
pub fn handle_verify_node_id_global(node: &Node, msg: MsgView<'_>, out: &mut Outgoing) {
    match payload_node_id(msg.payload) {
        None => load_verified_node_id(node, out),
        Some(id) if id == node.id => load_verified_node_id(node, out),
        Some(_) => {}
    }
}

/// Addressed verify: always respond, the dispatcher already matched the
/// destination.
pub fn handle_verify_node_id_addressed(node: &Node, _msg: MsgView<'_>, out: &mut Outgoing) {
    load_verified_node_id(node, out);
}

/// A Verified Node ID carrying our own id means another node shares it;
/// report the well-known event once per boot.
pub fn handle_verified_node_id(node: &mut Node, msg: MsgView<'_>, out: &mut Outgoing) {
    let Some(id) = payload_node_id(msg.payload) else {
        return;
    };
    if id != node.id || node.flags.duplicate_id_detected {
        return;
    }
    out.msg.load(
        node.alias,
        node.id,
        Alias::NULL,
        NodeId::NULL,
        Mti::PC_EVENT_REPORT,
    );
    unwrap!(out.msg.push_event_id(emlcb_core::EventId::DUPLICATE_NODE_DETECTED));
    out.valid = true;
    node.flags.duplicate_id_detected = true;
}

/// Protocol Support Inquiry: 6-byte flag reply; while a firmware upgrade is
/// running the upgrade-possible bit is swapped for upgrade-active [2; 3.3.6]
pub fn handle_protocol_support_inquiry(node: &Node, msg: MsgView<'_>, out: &mut Outgoing) {
    let mut support = node.parameters.protocol_support;
    if node.flags.firmware_upgrade_active {
        support.remove(ProtocolSupport::FIRMWARE_UPGRADE);
        support.insert(ProtocolSupport::FIRMWARE_UPGRADE_ACTIVE);
    }
    out.msg
        .load_reply(node.alias, node.id, msg.header, Mti::PROTOCOL_SUPPORT_REPLY);
    unwrap!(out.msg.extend(&support.to_reply_bytes()));
    out.valid = true;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::Header;
    use crate::node::test_support::TEST_PARAMETERS;
    use emlcb_core::EventId;

    fn test_node() -> Node {
        let mut node = Node::new(NodeId::new(0x0203_0405_0607).unwrap(), &TEST_PARAMETERS);
        node.alias = Alias::new(0x123).unwrap();
        node.flags.permitted = true;
        node.flags.initialized = true;
        node
    }

    fn incoming(mti: Mti, payload: &[u8]) -> (Header, heapless::Vec<u8, 16>) {
        let header = Header {
            mti,
            source_alias: Alias::new(0x777).unwrap(),
            source_id: NodeId::new(0x0A0B_0C0D_0E0F).unwrap(),
            dest_alias: Alias::new(0x123).unwrap(),
            dest_id: NodeId::NULL,
        };
        (header, heapless::Vec::from_slice(payload).unwrap())
    }

    #[test]
    fn test_verify_global_empty_payload() {
        let node = test_node();
        let (header, payload) = incoming(Mti::VERIFY_NODE_ID_GLOBAL, &[]);
        let mut out = Outgoing::new();
        handle_verify_node_id_global(
            &node,
            MsgView {
                header: &header,
                payload: &payload,
            },
            &mut out,
        );
        assert!(out.valid);
        // Simple protocol advertised, so the simple variant goes out.
        assert_eq!(out.msg.header.mti, Mti::VERIFIED_NODE_ID_SIMPLE);
        assert_eq!(out.msg.payload(), &node.id.to_bytes());
        assert!(out.msg.header.dest_alias.is_null());
    }

    #[test]
    fn test_verify_global_mismatched_id_is_silent() {
        let node = test_node();
        let other = NodeId::new(0x0A0B_0C0D_0E0F).unwrap();
        let (header, payload) = incoming(Mti::VERIFY_NODE_ID_GLOBAL, &other.to_bytes());
        let mut out = Outgoing::new();
        handle_verify_node_id_global(
            &node,
            MsgView {
                header: &header,
                payload: &payload,
            },
            &mut out,
        );
        assert!(!out.valid);
    }

    #[test]
    fn test_verified_node_id_duplicate_once() {
        let mut node = test_node();
        let (header, payload) = incoming(Mti::VERIFIED_NODE_ID, &node.id.to_bytes());
        let view = MsgView {
            header: &header,
            payload: &payload,
        };
        let mut out = Outgoing::new();
        handle_verified_node_id(&mut node, view, &mut out);
        assert!(out.valid);
        assert_eq!(out.msg.header.mti, Mti::PC_EVENT_REPORT);
        assert_eq!(
            out.msg.payload(),
            &EventId::DUPLICATE_NODE_DETECTED.to_bytes()
        );
        assert!(node.flags.duplicate_id_detected);

        // Identical stimulus produces nothing further.
        let mut out = Outgoing::new();
        handle_verified_node_id(&mut node, view, &mut out);
        assert!(!out.valid);
    }

    #[test]
    fn test_protocol_support_firmware_swap() {
        let mut node = test_node();
        let (header, payload) = incoming(Mti::PROTOCOL_SUPPORT_INQUIRY, &[]);
        let view = MsgView {
            header: &header,
            payload: &payload,
        };

        let mut out = Outgoing::new();
        handle_protocol_support_inquiry(&node, view, &mut out);
        let mut plain = [0u8; 6];
        plain.copy_from_slice(out.msg.payload());

        node.flags.firmware_upgrade_active = true;
        let mut out = Outgoing::new();
        handle_protocol_support_inquiry(&node, view, &mut out);
        let upgrading = out.msg.payload();

        assert_eq!(out.msg.header.dest_alias, header.source_alias);
        assert_eq!(plain[2] & 0x30, 0x00);
        assert_eq!(upgrading[2] & 0x30, 0x10);
    }
}
