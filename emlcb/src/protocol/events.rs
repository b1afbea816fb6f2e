//! Event exchange handler [3]
//!
//! Identify queries are answered from the node's registration tables;
//! whole-table dumps and range queries emit one message per dispatcher pass
//! through the node's enumerator. Received event reports fan out to the
//! train and broadcast-time modules before the application callback.

use emlcb_core::{Alias, EventId, Mti, NodeId};

use super::{clock, traction, Outgoing};
use crate::buffer::MsgView;
use crate::node::{EnumPhase, Node};
use crate::platform::{AppCallbacks, Platform};

fn payload_event(payload: &[u8]) -> Option<EventId> {
    let bytes: [u8; 8] = payload.get(..8)?.try_into().ok()?;
    Some(EventId::from_bytes(bytes))
}

/// Decodes the wire form of an event range: the low bits equal to the
/// lowest bit form the mask [3; 3.2]
fn decode_range(encoded: u64) -> (u64, u64) {
    let flipped = if encoded & 1 != 0 { encoded } else { !encoded };
    let mask = (1u64 << flipped.trailing_ones().min(63)) - 1;
    (encoded & !mask, mask)
}

fn load_identified(node: &Node, out: &mut Outgoing, mti: Mti, event: EventId) {
    out.msg
        .load(node.alias, node.id, Alias::NULL, NodeId::NULL, mti);
    unwrap!(out.msg.push_event_id(event));
    out.valid = true;
}

/// Identify Consumer: reply with the stored status iff the event is in the
/// consumer list.
pub fn handle_consumer_identify(node: &Node, msg: MsgView<'_>, out: &mut Outgoing) {
    let Some(event) = payload_event(msg.payload) else {
        return;
    };
    if let Some(entry) = node.consumers.find(event) {
        load_identified(node, out, Mti::consumer_identified(entry.status), entry.id);
    }
}

pub fn handle_producer_identify(node: &Node, msg: MsgView<'_>, out: &mut Outgoing) {
    let Some(event) = payload_event(msg.payload) else {
        return;
    };
    if let Some(entry) = node.producers.find(event) {
        load_identified(node, out, Mti::producer_identified(entry.status), entry.id);
    }
}

/// Range identify: one identified reply per listed event intersecting the
/// queried range, spread across passes.
pub fn handle_consumer_identify_range(node: &mut Node, msg: MsgView<'_>, out: &mut Outgoing) {
    let Some(event) = payload_event(msg.payload) else {
        return;
    };
    let (base, mask) = decode_range(event.into_u64());
    if !node.enumerator.running {
        node.enumerator.start(EnumPhase::ConsumerEntries);
    }
    while let Some(entry) = node
        .consumers
        .entries()
        .get(usize::from(node.enumerator.index))
        .copied()
    {
        node.enumerator.index += 1;
        let value = entry.id.into_u64();
        if value >= base && value <= base + mask {
            load_identified(node, out, Mti::consumer_identified(entry.status), entry.id);
            out.enumerate = true;
            return;
        }
    }
    node.enumerator.stop();
    out.enumerate = false;
}

pub fn handle_producer_identify_range(node: &mut Node, msg: MsgView<'_>, out: &mut Outgoing) {
    let Some(event) = payload_event(msg.payload) else {
        return;
    };
    let (base, mask) = decode_range(event.into_u64());
    if !node.enumerator.running {
        node.enumerator.start(EnumPhase::ProducerEntries);
    }
    while let Some(entry) = node
        .producers
        .entries()
        .get(usize::from(node.enumerator.index))
        .copied()
    {
        node.enumerator.index += 1;
        let value = entry.id.into_u64();
        if value >= base && value <= base + mask {
            load_identified(node, out, Mti::producer_identified(entry.status), entry.id);
            out.enumerate = true;
            return;
        }
    }
    node.enumerator.stop();
    out.enumerate = false;
}

/// Identify Events: dump every producer and consumer registration,
/// singletons first, then the range registrations.
pub fn handle_events_identify(node: &mut Node, _msg: MsgView<'_>, out: &mut Outgoing) {
    if !node.enumerator.running {
        node.enumerator.start(EnumPhase::ProducerEntries);
    }
    loop {
        let index = usize::from(node.enumerator.index);
        match node.enumerator.phase {
            EnumPhase::ProducerEntries => match node.producers.entries().get(index).copied() {
                Some(entry) => {
                    node.enumerator.index += 1;
                    load_identified(node, out, Mti::producer_identified(entry.status), entry.id);
                    out.enumerate = true;
                    return;
                }
                None => {
                    node.enumerator.phase = EnumPhase::ProducerRanges;
                    node.enumerator.index = 0;
                }
            },
            EnumPhase::ProducerRanges => match node.producers.ranges().get(index).copied() {
                Some(range) => {
                    node.enumerator.index += 1;
                    load_identified(node, out, Mti::PRODUCER_IDENTIFY_RANGE, range.encode());
                    out.enumerate = true;
                    return;
                }
                None => {
                    node.enumerator.phase = EnumPhase::ConsumerEntries;
                    node.enumerator.index = 0;
                }
            },
            EnumPhase::ConsumerEntries => match node.consumers.entries().get(index).copied() {
                Some(entry) => {
                    node.enumerator.index += 1;
                    load_identified(node, out, Mti::consumer_identified(entry.status), entry.id);
                    out.enumerate = true;
                    return;
                }
                None => {
                    node.enumerator.phase = EnumPhase::ConsumerRanges;
                    node.enumerator.index = 0;
                }
            },
            EnumPhase::ConsumerRanges => match node.consumers.ranges().get(index).copied() {
                Some(range) => {
                    node.enumerator.index += 1;
                    load_identified(node, out, Mti::CONSUMER_IDENTIFY_RANGE, range.encode());
                    out.enumerate = true;
                    return;
                }
                None => {
                    node.enumerator.stop();
                    out.enumerate = false;
                    return;
                }
            },
        }
    }
}

/// PC Event Report: route to the train and clock modules, then the
/// application callback when this node consumes the event. No reply.
pub fn handle_pc_event_report<P: Platform, A: AppCallbacks>(
    node: &mut Node,
    msg: MsgView<'_>,
    platform: &mut P,
    callbacks: &mut A,
) {
    let Some(event) = payload_event(msg.payload) else {
        return;
    };
    let (id, alias) = (node.id, node.alias);
    if let Some(train) = node.train.as_mut() {
        traction::handle_well_known_event(id, train, event, callbacks);
    }
    if let Some(slot) = node.clock.as_mut() {
        clock::handle_event(id, alias, slot, event, platform, callbacks);
    }
    if node.consumers.holds(event) {
        callbacks.on_event_report(id, event);
    }
}

/// Producer Identified (set): carries clock state during a full sync; a
/// consumer clock accepts it like a report.
pub fn handle_producer_identified_set<P: Platform, A: AppCallbacks>(
    node: &mut Node,
    msg: MsgView<'_>,
    platform: &mut P,
    callbacks: &mut A,
) {
    let Some(event) = payload_event(msg.payload) else {
        return;
    };
    let (id, alias) = (node.id, node.alias);
    if let Some(slot) = node.clock.as_mut() {
        clock::handle_event(id, alias, slot, event, platform, callbacks);
    }
}

/// Event Learn: the application decides whether to bind the event into a
/// free consumer slot [3; 3.6]
pub fn handle_event_learn<A: AppCallbacks>(node: &mut Node, msg: MsgView<'_>, callbacks: &mut A) {
    let Some(event) = payload_event(msg.payload) else {
        return;
    };
    if callbacks.on_event_learn(node.id, event) {
        let _ = node.consumers.learn(event);
    }
}
