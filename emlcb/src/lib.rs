//! # Emlcb
//!
//! An OpenLCB (LCC — Layer Control Command) node stack for `no_std`
//! microcontrollers. It lets a device participate as one or more virtual
//! nodes on a CAN-based model railroad control network: alias negotiation,
//! message routing, event production/consumption, datagram transport,
//! configuration memory, Simple Node Information, Train Control, and
//! Broadcast Time.
//!
//! ## Architecture
//!
//! ```text
//!  CAN RX ISR ──► FrameFifo ──► Stack::poll() ─────► Platform::try_transmit
//!                               │
//!                  ┌────────────┴─────────────┐
//!                  │ rx adapter (reassembly)  │
//!                  │ alias login statemachine │
//!                  │ buffer store + FIFO      │
//!                  │ per-MTI protocol handlers│
//!                  │ tx adapter (fragmenter)  │
//!                  └──────────────────────────┘
//! ```
//!
//! The stack is polled cooperatively from a single main loop; nothing
//! blocks. A CAN receive interrupt pushes raw frames into a
//! [`FrameFifo`](emlcb_driver::fifo::FrameFifo); [`Stack::poll`] drains it,
//! adapts frames into OpenLCB messages, routes them to per-protocol
//! handlers, and fragments replies back into frames. A platform timer calls
//! [`Stack::tick_100ms`] to drive alias-negotiation waits, train heartbeats
//! and broadcast-time clocks.
//!
//! Platform behavior is injected through two capability traits:
//! [`Platform`](platform::Platform) (frame transmit, configuration memory
//! access, reboot, factory reset) and [`AppCallbacks`](platform::AppCallbacks)
//! (event notifications). Pool depths and table capacities are compile-time
//! configuration in [`consts`].
//!
//! ## Concurrency model
//!
//! Only the frame FIFO is shared with interrupt context; it is guarded by an
//! `embassy_sync` blocking mutex whose `RawMutex` flavor the platform
//! chooses (`CriticalSectionRawMutex` when the ISR is the producer,
//! `NoopRawMutex` in single-context setups). Everything else is owned by the
//! [`Stack`] and touched only from the main loop. Handlers complete in
//! bounded time; multi-message work (event enumeration, the two-step
//! datagram reply) is broken across `poll()` passes via explicit
//! continuation state.
//!
//! # References:
//!
//! * \[1\] OpenLCB CAN Frame Transfer Standard
//! * \[2\] OpenLCB Message Network Standard
//! * \[3\] OpenLCB Event Transport Standard
//! * \[4\] OpenLCB Memory Configuration Standard
//! * \[5\] OpenLCB Traction Control Standard
//! * \[6\] OpenLCB Broadcast Time Protocol Standard
#![no_std]

pub use emlcb_core as core;
pub use emlcb_driver::{fifo, frame, gridconnect};

// This mod MUST go first, so that the others see its macros.
pub(crate) mod fmt;

pub mod buffer;
pub mod can;
mod engine;
pub mod float16;
pub mod node;
pub mod platform;
pub mod protocol;

pub use engine::Stack;
pub use protocol::Outgoing;

/// Compile-time pool depths and table capacities.
///
/// The totals are sized for a small multi-node device; larger applications
/// adjust them here. The buffer count must stay below 255 so `{class, index}`
/// handles fit a byte.
pub mod consts {
    /// Raw CAN frames queued between the receive ISR and the main loop.
    pub const FRAME_FIFO_DEPTH: usize = 16;
    /// Basic (16-byte) message buffers in the store.
    pub const BASIC_BUFFER_DEPTH: usize = 10;
    /// Extended (256-byte) message buffers in the store.
    pub const EXTENDED_BUFFER_DEPTH: usize = 6;
    /// Inbound OpenLCB message FIFO depth (buffer handles).
    pub const MESSAGE_FIFO_DEPTH: usize = 16;
    /// Concurrent multi-frame reassembly contexts.
    pub const ASSEMBLY_DEPTH: usize = 4;
    /// Virtual node slots.
    pub const NODE_DEPTH: usize = 8;
    /// Consumer event entries per node.
    pub const CONSUMER_COUNT: usize = 16;
    /// Consumer event range registrations per node.
    pub const CONSUMER_RANGE_COUNT: usize = 4;
    /// Producer event entries per node.
    pub const PRODUCER_COUNT: usize = 16;
    /// Producer event range registrations per node.
    pub const PRODUCER_RANGE_COUNT: usize = 4;
    /// DCC functions tracked per train node (F0..F28).
    pub const TRAIN_FUNCTION_COUNT: usize = 29;
}
