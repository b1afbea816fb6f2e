//! Outgoing message fragmenter
//!
//! Splits an OpenLCB message into the CAN frame sequence for its transport:
//! global single-frame, addressed multi-frame with framing bits and the
//! destination alias in the first two payload bytes, or the dedicated
//! datagram frame types [1; 4.3]
//!
//! Transmission is resumable: a full hardware queue leaves the offset in
//! [`TxState`] and the same message continues on a later pass, preserving
//! frame order.

use emlcb_core::Mti;
use emlcb_driver::frame::{CanFrame, CanId, Data, Fragment, FrameType};

use crate::buffer::{Header, OutMessage};
use crate::platform::Platform;

/// Progress of the message currently being fragmented.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TxState {
    offset: usize,
    finished: bool,
}

impl TxState {
    pub const fn new() -> Self {
        Self {
            offset: 0,
            finished: false,
        }
    }

    pub fn reset(&mut self) {
        self.offset = 0;
        self.finished = false;
    }
}

impl Default for TxState {
    fn default() -> Self {
        Self::new()
    }
}

/// Pushes the remaining frames of `out` to the transmitter. Returns `true`
/// once the whole message is on the wire.
pub fn send_message<P: Platform>(out: &OutMessage, state: &mut TxState, platform: &mut P) -> bool {
    if state.finished {
        return true;
    }
    let sent = if out.header.mti == Mti::DATAGRAM {
        send_datagram(&out.header, out.payload(), state, platform)
    } else if out.header.mti.is_addressed() {
        send_addressed(&out.header, out.payload(), state, platform)
    } else {
        send_global(&out.header, out.payload(), platform)
    };
    state.finished = sent;
    sent
}

/// One-shot transmit for messages known to fit a single frame (login
/// traffic, event reports, traction pings). Returns `false` without side
/// effects when the transmitter is busy.
pub fn send_single<P: Platform>(header: &Header, payload: &[u8], platform: &mut P) -> bool {
    let mut state = TxState::new();
    if header.mti.is_addressed() {
        debug_assert!(payload.len() <= 6);
        send_addressed(header, payload, &mut state, platform)
    } else {
        send_global(header, payload, platform)
    }
}

fn send_global<P: Platform>(header: &Header, payload: &[u8], platform: &mut P) -> bool {
    // Global messages never fragment on CAN; everything sent here fits.
    debug_assert!(payload.len() <= Data::MAX);
    let id = CanId::openlcb(
        FrameType::GlobalAddressed,
        header.mti.can_variable_field(),
        header.source_alias,
    );
    let frame = CanFrame {
        id,
        data: unwrap!(Data::new(payload)),
    };
    platform.try_transmit(&frame)
}

fn send_addressed<P: Platform>(
    header: &Header,
    payload: &[u8],
    state: &mut TxState,
    platform: &mut P,
) -> bool {
    const CHUNK: usize = 6;
    let id = CanId::openlcb(
        FrameType::GlobalAddressed,
        header.mti.can_variable_field(),
        header.source_alias,
    );
    let dest = header.dest_alias.into_u16();

    loop {
        let remaining = payload.len() - state.offset;
        let fragment = match (state.offset == 0, remaining <= CHUNK) {
            (true, true) => Fragment::Only,
            (true, false) => Fragment::First,
            (false, true) => Fragment::Final,
            (false, false) => Fragment::Middle,
        };
        let take = remaining.min(CHUNK);

        let mut data = Data::empty();
        unwrap!(data.push(fragment.into_byte() | (dest >> 8) as u8));
        unwrap!(data.push(dest as u8));
        for &byte in &payload[state.offset..state.offset + take] {
            unwrap!(data.push(byte));
        }

        if !platform.try_transmit(&CanFrame { id, data }) {
            return false;
        }
        state.offset += take;
        if state.offset >= payload.len() {
            return true;
        }
    }
}

fn send_datagram<P: Platform>(
    header: &Header,
    payload: &[u8],
    state: &mut TxState,
    platform: &mut P,
) -> bool {
    const CHUNK: usize = 8;
    let single = payload.len() <= CHUNK;
    let dest = header.dest_alias.into_u16();

    loop {
        let remaining = payload.len() - state.offset;
        let frame_type = match (single, state.offset == 0, remaining <= CHUNK) {
            (true, _, _) => FrameType::DatagramOnly,
            (false, true, _) => FrameType::DatagramFirst,
            (false, false, true) => FrameType::DatagramFinal,
            (false, false, false) => FrameType::DatagramMiddle,
        };
        let take = remaining.min(CHUNK);

        let id = CanId::openlcb(frame_type, dest, header.source_alias);
        let frame = CanFrame {
            id,
            data: unwrap!(Data::new(&payload[state.offset..state.offset + take])),
        };
        if !platform.try_transmit(&frame) {
            return false;
        }
        state.offset += take;
        if state.offset >= payload.len() {
            return true;
        }
    }
}
