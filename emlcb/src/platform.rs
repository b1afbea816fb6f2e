//! Platform and application capability traits
//!
//! The stack injects all board-specific behavior through two bundles: the
//! [`Platform`] the stack calls *out* to (CAN transmit, persistent
//! configuration memory, reset paths) and the [`AppCallbacks`] it notifies
//! *in* on protocol activity. Both are owned by the
//! [`Stack`](crate::Stack) and borrowed into handlers.

use emlcb_core::{EventId, NodeId};
use emlcb_driver::frame::CanFrame;

use crate::protocol::clock::ClockState;

/// Board/driver services the stack depends on.
///
/// All methods must return promptly; they are called from the cooperative
/// main loop and, never, from interrupt context.
pub trait Platform {
    /// Hands one frame to the CAN transmitter. Returns `false` when the
    /// hardware queue is full; the stack retries on a later pass.
    fn try_transmit(&mut self, frame: &CanFrame) -> bool;

    /// Reads node configuration memory (space 0xFD). Returns the byte count
    /// actually read; 0 signals failure.
    fn config_memory_read(&mut self, node: NodeId, address: u32, buffer: &mut [u8]) -> usize {
        let _ = (node, address, buffer);
        0
    }

    /// Writes node configuration memory (space 0xFD). Returns the byte
    /// count actually written; a short count is reported to the peer as a
    /// transfer error.
    fn config_memory_write(&mut self, node: NodeId, address: u32, data: &[u8]) -> usize {
        let _ = (node, address, data);
        0
    }

    /// Override read for spaces without a built-in loader (0xFE, 0xF9, and
    /// firmware) or to replace the defaults. `None` falls through to the
    /// default handling.
    fn address_space_read(
        &mut self,
        node: NodeId,
        space: u8,
        address: u32,
        buffer: &mut [u8],
    ) -> Option<usize> {
        let _ = (node, space, address, buffer);
        None
    }

    /// Override write, symmetric to [`Platform::address_space_read`].
    fn address_space_write(
        &mut self,
        node: NodeId,
        space: u8,
        address: u32,
        data: &[u8],
    ) -> Option<usize> {
        let _ = (node, space, address, data);
        None
    }

    /// Reply-pending budget in seconds for a datagram touching `space`.
    /// Nonzero makes the acknowledgement carry a 2^N-seconds hint so slow
    /// storage does not trip peer timeouts.
    fn delayed_reply_time(&mut self, node: NodeId, space: u8) -> u16 {
        let _ = (node, space);
        0
    }

    /// Requested by the Memory Configuration reset/reboot command.
    fn reboot(&mut self) {}

    /// Requested by the factory-reset command after the node id matched.
    fn factory_reset(&mut self, node: NodeId) {
        let _ = node;
    }
}

/// Train emergency flavors reported through [`AppCallbacks::on_emergency`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Emergency {
    /// Point-to-point Emergency Stop from a throttle.
    Stop,
    /// Global Emergency Stop well-known event.
    GlobalStop,
    /// Global Emergency Off well-known event.
    GlobalOff,
}

/// Application notifications. Every method has an empty default so an
/// application implements only what it observes.
pub trait AppCallbacks {
    /// A consumed event fired on the network.
    fn on_event_report(&mut self, node: NodeId, event: EventId) {
        let _ = (node, event);
    }

    /// An Event Learn arrived. Return `true` to bind the event into a free
    /// consumer slot.
    fn on_event_learn(&mut self, node: NodeId, event: EventId) -> bool {
        let _ = (node, event);
        false
    }

    /// A train node's controller heartbeat expired; the stack has already
    /// zeroed the speed and raised the local emergency stop.
    fn on_heartbeat_timeout(&mut self, node: NodeId) {
        let _ = node;
    }

    /// A train node entered or left an emergency state.
    fn on_emergency(&mut self, node: NodeId, kind: Emergency, active: bool) {
        let _ = (node, kind, active);
    }

    /// Broadcast-time clock received or produced a new minute.
    fn on_clock_time(&mut self, node: NodeId, clock: &ClockState) {
        let _ = (node, clock);
    }

    fn on_clock_date(&mut self, node: NodeId, clock: &ClockState) {
        let _ = (node, clock);
    }

    fn on_clock_year(&mut self, node: NodeId, clock: &ClockState) {
        let _ = (node, clock);
    }

    fn on_clock_rate(&mut self, node: NodeId, clock: &ClockState) {
        let _ = (node, clock);
    }

    /// Clock started (`true`) or stopped (`false`).
    fn on_clock_running(&mut self, node: NodeId, clock: &ClockState, running: bool) {
        let _ = (node, clock, running);
    }

    /// The node's alias changed (negotiated or renegotiated after a
    /// collision).
    fn on_alias_change(&mut self, node: NodeId, alias: emlcb_core::Alias) {
        let _ = (node, alias);
    }
}

/// No-op callback bundle for applications that only send.
pub struct NullCallbacks;

impl AppCallbacks for NullCallbacks {}
