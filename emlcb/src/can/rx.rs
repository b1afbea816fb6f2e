//! Incoming frame adapter
//!
//! Decodes OpenLCB message frames into pool buffers, reassembling
//! multi-frame sequences per (source alias, dest alias, MTI). Completed
//! messages land in the inbound FIFO for the dispatcher.
//!
//! Sequence errors are answered directly with the matching reject (datagram
//! rejected for datagrams, optional-interaction rejected otherwise) carrying
//! the out-of-order or buffer-unavailable code [1; 5]; the node never
//! terminates.

use emlcb_core::{Alias, ErrorCode, Mti, NodeId};
use emlcb_driver::frame::{CanFrame, CanId, Data, Fragment, FrameType};

use crate::buffer::{Class, Handle, HandleFifo, Header, Store};
use crate::platform::Platform;

pub struct RxAdapter<const NA: usize> {
    in_process: heapless::Vec<Handle, NA>,
}

impl<const NA: usize> RxAdapter<NA> {
    pub const fn new() -> Self {
        Self {
            in_process: heapless::Vec::new(),
        }
    }

    /// Adapts one received OpenLCB message frame. Control frames are the
    /// login observer's business and ignored here.
    pub fn process_frame<P: Platform, const NB: usize, const NE: usize, const NF: usize>(
        &mut self,
        frame: &CanFrame,
        store: &mut Store<NB, NE>,
        inbound: &mut HandleFifo<NF>,
        platform: &mut P,
    ) {
        if !frame.id.is_openlcb() {
            return;
        }

        match frame.id.frame_type() {
            FrameType::GlobalAddressed => self.global_addressed(frame, store, inbound, platform),
            FrameType::DatagramOnly => {
                let key = datagram_key(frame);
                self.single(frame, 0, key, Class::Extended, store, inbound, platform);
            }
            FrameType::DatagramFirst => {
                let key = datagram_key(frame);
                self.first(frame, 0, key, Class::Extended, store, platform);
            }
            FrameType::DatagramMiddle => {
                let key = datagram_key(frame);
                self.middle(frame, 0, key, store, platform);
            }
            FrameType::DatagramFinal => {
                let key = datagram_key(frame);
                self.last(frame, 0, key, store, inbound, platform);
            }
            // Streams are not carried; reserved types are dropped.
            _ => {}
        }
    }

    /// True while any reassembly context is open; used by tests and
    /// diagnostics.
    pub fn assembling(&self) -> bool {
        !self.in_process.is_empty()
    }

    fn global_addressed<P: Platform, const NB: usize, const NE: usize, const NF: usize>(
        &mut self,
        frame: &CanFrame,
        store: &mut Store<NB, NE>,
        inbound: &mut HandleFifo<NF>,
        platform: &mut P,
    ) {
        let mti = Mti::new(frame.id.variable_field());
        if !mti.is_addressed() {
            let key = Header {
                mti,
                source_alias: frame.id.source_alias(),
                source_id: NodeId::NULL,
                dest_alias: Alias::NULL,
                dest_id: NodeId::NULL,
            };
            self.single(frame, 0, key, Class::Basic, store, inbound, platform);
            return;
        }

        let (Some(dest), Some(fragment)) = (frame.dest_alias(), frame.fragment()) else {
            return;
        };
        let key = Header {
            mti,
            source_alias: frame.id.source_alias(),
            source_id: NodeId::NULL,
            dest_alias: dest,
            dest_id: NodeId::NULL,
        };
        // SNIP replies predate the framing bits and can arrive as a run of
        // unmarked single frames; detect the end by counting terminators.
        let legacy_snip = mti == Mti::SIMPLE_NODE_INFO_REPLY;
        let class = if legacy_snip { Class::Extended } else { Class::Basic };

        match fragment {
            Fragment::Only if legacy_snip => {
                self.legacy_snip(frame, key, store, inbound, platform)
            }
            Fragment::Only => self.single(frame, 2, key, class, store, inbound, platform),
            Fragment::First => self.first(frame, 2, key, class, store, platform),
            Fragment::Middle => self.middle(frame, 2, key, store, platform),
            Fragment::Final => self.last(frame, 2, key, store, inbound, platform),
        }
    }

    fn find<const NB: usize, const NE: usize>(
        &self,
        store: &Store<NB, NE>,
        key: &Header,
    ) -> Option<usize> {
        self.in_process.iter().position(|&handle| {
            let header = store.header(handle);
            header.source_alias == key.source_alias
                && header.dest_alias == key.dest_alias
                && header.mti == key.mti
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn single<P: Platform, const NB: usize, const NE: usize, const NF: usize>(
        &mut self,
        frame: &CanFrame,
        data_start: usize,
        key: Header,
        class: Class,
        store: &mut Store<NB, NE>,
        inbound: &mut HandleFifo<NF>,
        platform: &mut P,
    ) {
        let Some(handle) = store.allocate(class) else {
            reject(platform, &key, ErrorCode::TEMPORARY_BUFFER_UNAVAILABLE);
            return;
        };
        *store.header_mut(handle) = key;
        unwrap!(store.append(handle, &frame.data[data_start.min(frame.data.len())..]));
        if inbound.push(handle).is_err() {
            store.free(handle);
            reject(platform, &key, ErrorCode::TEMPORARY_BUFFER_UNAVAILABLE);
        }
    }

    fn first<P: Platform, const NB: usize, const NE: usize>(
        &mut self,
        frame: &CanFrame,
        data_start: usize,
        key: Header,
        class: Class,
        store: &mut Store<NB, NE>,
        platform: &mut P,
    ) {
        if let Some(position) = self.find(store, &key) {
            // A fresh start supersedes the stale context.
            let stale = self.in_process.swap_remove(position);
            store.free(stale);
            reject(platform, &key, ErrorCode::TEMPORARY_START_BEFORE_LAST_END);
        }

        let Some(handle) = store.allocate(class) else {
            reject(platform, &key, ErrorCode::TEMPORARY_BUFFER_UNAVAILABLE);
            return;
        };
        *store.header_mut(handle) = key;
        store.set_in_process(handle, true);
        unwrap!(store.append(handle, &frame.data[data_start..]));
        if self.in_process.push(handle).is_err() {
            store.free(handle);
            reject(platform, &key, ErrorCode::TEMPORARY_BUFFER_UNAVAILABLE);
        }
    }

    fn middle<P: Platform, const NB: usize, const NE: usize>(
        &mut self,
        frame: &CanFrame,
        data_start: usize,
        key: Header,
        store: &mut Store<NB, NE>,
        platform: &mut P,
    ) {
        let Some(position) = self.find(store, &key) else {
            reject(platform, &key, ErrorCode::TEMPORARY_MIDDLE_END_WITH_NO_START);
            return;
        };
        let handle = self.in_process[position];
        if store.append(handle, &frame.data[data_start..]).is_err() {
            self.in_process.swap_remove(position);
            store.free(handle);
            reject(platform, &key, ErrorCode::TEMPORARY_BUFFER_UNAVAILABLE);
        }
    }

    fn last<P: Platform, const NB: usize, const NE: usize, const NF: usize>(
        &mut self,
        frame: &CanFrame,
        data_start: usize,
        key: Header,
        store: &mut Store<NB, NE>,
        inbound: &mut HandleFifo<NF>,
        platform: &mut P,
    ) {
        let Some(position) = self.find(store, &key) else {
            reject(platform, &key, ErrorCode::TEMPORARY_MIDDLE_END_WITH_NO_START);
            return;
        };
        let handle = self.in_process.swap_remove(position);
        if store.append(handle, &frame.data[data_start..]).is_err() {
            store.free(handle);
            reject(platform, &key, ErrorCode::TEMPORARY_BUFFER_UNAVAILABLE);
            return;
        }
        store.set_in_process(handle, false);
        if inbound.push(handle).is_err() {
            store.free(handle);
            reject(platform, &key, ErrorCode::TEMPORARY_BUFFER_UNAVAILABLE);
        }
    }

    fn legacy_snip<P: Platform, const NB: usize, const NE: usize, const NF: usize>(
        &mut self,
        frame: &CanFrame,
        key: Header,
        store: &mut Store<NB, NE>,
        inbound: &mut HandleFifo<NF>,
        platform: &mut P,
    ) {
        match self.find(store, &key) {
            None => self.first(frame, 2, key, Class::Extended, store, platform),
            Some(position) => {
                let handle = self.in_process[position];
                let nulls = count_nulls(store.payload(handle))
                    + count_nulls(&frame.data[2.min(frame.data.len())..]);
                if nulls < 6 {
                    self.middle(frame, 2, key, store, platform);
                } else {
                    self.last(frame, 2, key, store, inbound, platform);
                }
            }
        }
    }
}

impl<const NA: usize> Default for RxAdapter<NA> {
    fn default() -> Self {
        Self::new()
    }
}

fn datagram_key(frame: &CanFrame) -> Header {
    Header {
        mti: Mti::DATAGRAM,
        source_alias: frame.id.source_alias(),
        source_id: NodeId::NULL,
        dest_alias: Alias::from_u16_truncating(frame.id.variable_field()),
        dest_id: NodeId::NULL,
    }
}

fn count_nulls(bytes: &[u8]) -> usize {
    bytes.iter().filter(|&&byte| byte == 0).count()
}

/// Answers a sequence error toward the offending sender, best effort: a
/// busy transmitter drops the reject, which is a temporary error the peer
/// will time out on anyway.
fn reject<P: Platform>(platform: &mut P, key: &Header, code: ErrorCode) {
    let reject_mti = if key.mti == Mti::DATAGRAM {
        Mti::DATAGRAM_REJECTED_REPLY
    } else {
        Mti::OPTIONAL_INTERACTION_REJECTED
    };
    // Sourced from the alias the offending frame addressed; a reject for an
    // unaddressed frame has nowhere to go.
    if key.dest_alias.is_null() {
        return;
    }
    let id = CanId::openlcb(
        FrameType::GlobalAddressed,
        reject_mti.can_variable_field(),
        key.dest_alias,
    );
    let peer = key.source_alias.into_u16();
    let mut data = Data::empty();
    unwrap!(data.push((peer >> 8) as u8));
    unwrap!(data.push(peer as u8));
    unwrap!(data.push(code.to_bytes()[0]));
    unwrap!(data.push(code.to_bytes()[1]));
    let _ = platform.try_transmit(&CanFrame { id, data });
}

#[cfg(test)]
mod tests {
    use super::*;

    extern crate std;

    struct Capture(std::vec::Vec<CanFrame>);

    impl Platform for Capture {
        fn try_transmit(&mut self, frame: &CanFrame) -> bool {
            self.0.push(*frame);
            true
        }
    }

    type TestStore = Store<4, 2>;
    type TestFifo = HandleFifo<4>;

    fn setup() -> (RxAdapter<2>, TestStore, TestFifo, Capture) {
        (
            RxAdapter::new(),
            TestStore::new(),
            TestFifo::new(),
            Capture(std::vec::Vec::new()),
        )
    }

    fn datagram_frame(frame_type: FrameType, data: &[u8]) -> CanFrame {
        CanFrame::new(
            CanId::openlcb(frame_type, 0x0BC, Alias::new(0x123).unwrap()),
            data,
        )
        .unwrap()
    }

    #[test]
    fn test_single_global_message() {
        let (mut rx, mut store, mut fifo, mut platform) = setup();
        let frame = CanFrame::new(
            CanId::openlcb(FrameType::GlobalAddressed, 0x5B4, Alias::new(0x123).unwrap()),
            &[1, 2, 3, 4, 5, 6, 7, 8],
        )
        .unwrap();
        rx.process_frame(&frame, &mut store, &mut fifo, &mut platform);

        let handle = fifo.pop().unwrap();
        let view = store.view(handle);
        assert_eq!(view.header.mti, Mti::PC_EVENT_REPORT);
        assert_eq!(view.header.source_alias.into_u16(), 0x123);
        assert!(view.header.dest_alias.is_null());
        assert_eq!(view.payload, &[1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_datagram_reassembly() {
        let (mut rx, mut store, mut fifo, mut platform) = setup();
        rx.process_frame(
            &datagram_frame(FrameType::DatagramFirst, &[0x20, 0x00, 0, 0, 0, 0, 1, 2]),
            &mut store,
            &mut fifo,
            &mut platform,
        );
        assert!(rx.assembling());
        assert!(fifo.is_empty());

        rx.process_frame(
            &datagram_frame(FrameType::DatagramFinal, &[3, 4, 5]),
            &mut store,
            &mut fifo,
            &mut platform,
        );
        assert!(!rx.assembling());

        let handle = fifo.pop().unwrap();
        let view = store.view(handle);
        assert_eq!(view.header.mti, Mti::DATAGRAM);
        assert_eq!(view.header.dest_alias.into_u16(), 0x0BC);
        assert_eq!(view.payload, &[0x20, 0x00, 0, 0, 0, 0, 1, 2, 3, 4, 5]);
        assert!(platform.0.is_empty());
    }

    #[test]
    fn test_middle_with_no_start_rejected() {
        let (mut rx, mut store, mut fifo, mut platform) = setup();
        rx.process_frame(
            &datagram_frame(FrameType::DatagramMiddle, &[1, 2, 3]),
            &mut store,
            &mut fifo,
            &mut platform,
        );
        assert!(fifo.is_empty());
        assert_eq!(platform.0.len(), 1);
        let reject = &platform.0[0];
        assert_eq!(reject.id.variable_field(), 0xA48);
        assert_eq!(reject.id.source_alias().into_u16(), 0x0BC);
        assert_eq!(&reject.data[..], &[0x01, 0x23, 0x20, 0x41]);
    }

    #[test]
    fn test_start_before_last_end_supersedes() {
        let (mut rx, mut store, mut fifo, mut platform) = setup();
        rx.process_frame(
            &datagram_frame(FrameType::DatagramFirst, &[0xAA; 8]),
            &mut store,
            &mut fifo,
            &mut platform,
        );
        rx.process_frame(
            &datagram_frame(FrameType::DatagramFirst, &[0xBB; 8]),
            &mut store,
            &mut fifo,
            &mut platform,
        );
        // Old context discarded, error reported, new context live.
        assert_eq!(platform.0.len(), 1);
        assert_eq!(&platform.0[0].data[2..], &[0x20, 0x42]);

        rx.process_frame(
            &datagram_frame(FrameType::DatagramFinal, &[0xCC]),
            &mut store,
            &mut fifo,
            &mut platform,
        );
        let handle = fifo.pop().unwrap();
        assert_eq!(store.payload(handle)[0], 0xBB);
        assert_eq!(store.payload(handle).len(), 9);
    }

    #[test]
    fn test_addressed_two_frame_message() {
        let (mut rx, mut store, mut fifo, mut platform) = setup();
        let id = CanId::openlcb(FrameType::GlobalAddressed, 0x5EB, Alias::new(0x123).unwrap());
        let first = CanFrame::new(id, &[0x45, 0x67, 0x20, 0x01, 0x00, 0x01, 0x02, 0x03]).unwrap();
        let last = CanFrame::new(id, &[0x85, 0x67, 0x04, 0x05]).unwrap();
        rx.process_frame(&first, &mut store, &mut fifo, &mut platform);
        rx.process_frame(&last, &mut store, &mut fifo, &mut platform);

        let handle = fifo.pop().unwrap();
        let view = store.view(handle);
        assert_eq!(view.header.mti, Mti::TRACTION_PROTOCOL);
        assert_eq!(view.header.dest_alias.into_u16(), 0x567);
        assert_eq!(view.payload, &[0x20, 0x01, 0x00, 0x01, 0x02, 0x03, 0x04, 0x05]);
    }

    #[test]
    fn test_legacy_snip_null_counting() {
        let (mut rx, mut store, mut fifo, mut platform) = setup();
        let id = CanId::openlcb(FrameType::GlobalAddressed, 0xA08, Alias::new(0x123).unwrap());
        // Three unmarked frames carrying 6 terminators in total.
        let frames = [
            CanFrame::new(id, &[0x05, 0x67, 0x04, b'M', b'P', 0x00, b'T', 0x00]).unwrap(),
            CanFrame::new(id, &[0x05, 0x67, b'A', 0x00, b'1', 0x00, 0x02, b'N']).unwrap(),
            CanFrame::new(id, &[0x05, 0x67, 0x00, b'D', 0x00]).unwrap(),
        ];
        for frame in &frames {
            rx.process_frame(frame, &mut store, &mut fifo, &mut platform);
        }
        assert!(!rx.assembling());
        let handle = fifo.pop().unwrap();
        let view = store.view(handle);
        assert_eq!(view.payload.len(), 6 + 6 + 3);
        assert_eq!(view.payload[0], 0x04);
        assert_eq!(count_nulls(view.payload), 6);
    }

    #[test]
    fn test_buffer_exhaustion_rejected() {
        let (mut rx, mut store, mut fifo, mut platform) = setup();
        let _a = store.allocate(Class::Extended).unwrap();
        let _b = store.allocate(Class::Extended).unwrap();
        rx.process_frame(
            &datagram_frame(FrameType::DatagramFirst, &[0x20, 0x00]),
            &mut store,
            &mut fifo,
            &mut platform,
        );
        assert_eq!(platform.0.len(), 1);
        assert_eq!(&platform.0[0].data[2..], &[0x20, 0x20]);
        assert!(!rx.assembling());
    }
}
