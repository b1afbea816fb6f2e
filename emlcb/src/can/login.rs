//! Alias negotiation and login state machine
//!
//! Walks each node through the CAN alias handshake [1; 6.2]: derive a
//! 12-bit candidate from the seeded LFSR, probe it with CID7..CID4, hold it
//! through a 200 ms objection window, reserve with RID, publish the mapping
//! with AMD, then announce the node with Initialization Complete and a dump
//! of its producer/consumer events.
//!
//! Any bus frame carrying an alias we hold is a collision: during the walk
//! the node silently reseeds; once reserved, a CID probe is defended with
//! RID while anything else forfeits the alias (AMR, reseed, and a one-shot
//! duplicate-node event once the node is back).

use emlcb_core::{Alias, EventId, Mti, NodeId};
use emlcb_driver::frame::{CanFrame, CanId, ControlField, Data};

use crate::buffer::Header;
use crate::node::{self, Node, Registry, RunState};
use crate::platform::{AppCallbacks, Platform};

fn control_frame(variable_field: u16, alias: Alias) -> CanFrame {
    CanFrame::empty(CanId::control(variable_field, alias))
}

fn mapping_frame(variable_field: u16, alias: Alias, id: NodeId) -> CanFrame {
    CanFrame {
        id: CanId::control(variable_field, alias),
        data: unwrap!(Data::new(&id.to_bytes())),
    }
}

fn global_header(node: &Node, mti: Mti) -> Header {
    Header {
        mti,
        source_alias: node.alias,
        source_id: node.id,
        dest_alias: Alias::NULL,
        dest_id: NodeId::NULL,
    }
}

/// Runs one login step for a node that has not reached [`RunState::Run`].
///
/// Each step transmits at most one frame; a busy transmitter leaves the
/// state unchanged for a retry on the next pass.
pub fn process<P: Platform, A: AppCallbacks>(node: &mut Node, platform: &mut P, callbacks: &mut A) {
    match node.run_state {
        RunState::Init => {
            node.seed = node.id.into_u64();
            node.run_state = RunState::GenerateAlias;
        }
        RunState::GenerateSeed => {
            node.seed = node::next_seed(node.seed);
            node.run_state = RunState::GenerateAlias;
        }
        RunState::GenerateAlias => {
            let alias = node::alias_from_seed(node.seed);
            if alias.is_null() {
                node.run_state = RunState::GenerateSeed;
                return;
            }
            node.alias = alias;
            callbacks.on_alias_change(node.id, alias);
            node.run_state = RunState::SendCid7;
        }
        RunState::SendCid7 => send_cid(node, platform, 7, RunState::SendCid6),
        RunState::SendCid6 => send_cid(node, platform, 6, RunState::SendCid5),
        RunState::SendCid5 => send_cid(node, platform, 5, RunState::SendCid4),
        RunState::SendCid4 => {
            send_cid(node, platform, 4, RunState::Wait200ms);
            node.timer_ticks = 0;
        }
        RunState::Wait200ms => {
            // Ticks run at 100 ms; >3 guarantees the full objection window
            // regardless of tick phase.
            if node.timer_ticks > 3 {
                node.run_state = RunState::SendReserveId;
            }
        }
        RunState::SendReserveId => {
            if platform.try_transmit(&control_frame(CanId::CONTROL_RID, node.alias)) {
                node.run_state = RunState::SendAliasMapDefinition;
            }
        }
        RunState::SendAliasMapDefinition => {
            if platform.try_transmit(&mapping_frame(CanId::CONTROL_AMD, node.alias, node.id)) {
                node.flags.permitted = true;
                node.run_state = RunState::SendInitializationComplete;
            }
        }
        RunState::SendInitializationComplete => {
            let mti = if node
                .parameters
                .protocol_support
                .contains(emlcb_core::ProtocolSupport::SIMPLE)
            {
                Mti::INITIALIZATION_COMPLETE_SIMPLE
            } else {
                Mti::INITIALIZATION_COMPLETE
            };
            let header = global_header(node, mti);
            if super::tx::send_single(&header, &node.id.to_bytes(), platform) {
                node.flags.initialized = true;
                node.enumerator.index = 0;
                node.run_state = RunState::SendProducerEvents;
            }
        }
        RunState::SendProducerEvents => {
            let index = usize::from(node.enumerator.index);
            match node.producers.entries().get(index) {
                None => {
                    node.enumerator.index = 0;
                    node.run_state = RunState::SendConsumerEvents;
                }
                Some(entry) => {
                    let header = global_header(node, Mti::producer_identified(entry.status));
                    if super::tx::send_single(&header, &entry.id.to_bytes(), platform) {
                        node.enumerator.index += 1;
                    }
                }
            }
        }
        RunState::SendConsumerEvents => {
            let index = usize::from(node.enumerator.index);
            match node.consumers.entries().get(index) {
                None => {
                    node.enumerator.index = 0;
                    node.run_state = RunState::Run;
                }
                Some(entry) => {
                    let header = global_header(node, Mti::consumer_identified(entry.status));
                    if super::tx::send_single(&header, &entry.id.to_bytes(), platform) {
                        node.enumerator.index += 1;
                    }
                }
            }
        }
        RunState::Run => {}
    }
}

/// Emits the once-per-boot duplicate-node event if a collision flagged it
/// while the node was off the bus.
pub fn process_pending_events<P: Platform>(node: &mut Node, platform: &mut P) {
    if node.run_state != RunState::Run || !node.emit_duplicate_event {
        return;
    }
    if node.flags.duplicate_id_detected {
        node.emit_duplicate_event = false;
        return;
    }
    let header = global_header(node, Mti::PC_EVENT_REPORT);
    if super::tx::send_single(&header, &EventId::DUPLICATE_NODE_DETECTED.to_bytes(), platform) {
        node.flags.duplicate_id_detected = true;
        node.emit_duplicate_event = false;
    }
}

fn send_cid<P: Platform>(node: &mut Node, platform: &mut P, sequence: u8, next: RunState) {
    let shift = 12 * (u32::from(sequence) - 4);
    let fragment = ((node.id.into_u64() >> shift) & 0xFFF) as u16;
    let frame = CanFrame::empty(CanId::check_id(sequence, fragment, node.alias));
    if platform.try_transmit(&frame) {
        node.run_state = next;
    }
}

/// Applies a received frame to the alias state of every node.
///
/// Handles collision detection and the mapping-enquiry reply; the frame is
/// afterwards still routed to the adapter if it is an OpenLCB message.
pub fn observe_frame<P: Platform, const N: usize>(
    registry: &mut Registry<N>,
    frame: &CanFrame,
    platform: &mut P,
) {
    let source = frame.id.source_alias();
    let control = if frame.id.is_openlcb() {
        None
    } else {
        Some(frame.id.control_field())
    };

    for node in registry.iter_mut() {
        if !node.alias.is_null() && node.alias == source {
            if node.run_state < RunState::Run && !node.flags.permitted {
                // Objection during the CID walk or wait window.
                node.restart_login();
            } else if matches!(control, Some(ControlField::CheckId { .. })) {
                // A probe of our reserved alias is defended, not forfeited.
                let _ = platform.try_transmit(&control_frame(CanId::CONTROL_RID, node.alias));
            } else {
                let _ = platform.try_transmit(&mapping_frame(
                    CanId::CONTROL_AMR,
                    node.alias,
                    node.id,
                ));
                node.emit_duplicate_event = true;
                node.restart_login();
            }
        }

        if matches!(control, Some(ControlField::AliasMapEnquiry)) && node.flags.permitted {
            let queried = frame.data.len() >= 6 && {
                let mut id = [0u8; 6];
                id.copy_from_slice(&frame.data[..6]);
                NodeId::from_bytes(id) == node.id
            };
            if frame.data.is_empty() || queried {
                let _ = platform.try_transmit(&mapping_frame(
                    CanId::CONTROL_AMD,
                    node.alias,
                    node.id,
                ));
            }
        }
    }
}
