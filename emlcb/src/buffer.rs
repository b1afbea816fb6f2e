//! Message buffer store and FIFO
//!
//! A fixed, preallocated pool of OpenLCB message buffers in two size
//! classes: **basic** for short single-frame traffic and **extended** for
//! SNIP replies and datagrams. Buffers are addressed by `{class, index}`
//! handles so queues hold plain indices and no pointers outlive the store.
//!
//! Allocation never waits: exhaustion is returned to the caller, which
//! either drops non-critical traffic or retries on a later pass.

use emlcb_core::{Alias, Mti, NodeId};
use heapless::Deque;

/// Basic-class payload capacity. Most messages fit one CAN frame, a few
/// protocols (Traction) take two.
pub const BASIC_PAYLOAD: usize = 16;

/// Extended-class payload capacity; covers the SNIP reply and anything
/// carried by datagram.
pub const EXTENDED_PAYLOAD: usize = 256;

/// Protocol limit on a datagram payload [4; 4.1]
pub const DATAGRAM_PAYLOAD_MAX: usize = 72;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Class {
    Basic,
    Extended,
}

/// Index of an allocated buffer in its class pool.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Handle {
    class: Class,
    index: u8,
}

impl Handle {
    pub const fn class(&self) -> Class {
        self.class
    }
}

/// Addressing and type information of an OpenLCB message.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Header {
    pub mti: Mti,
    pub source_alias: Alias,
    pub source_id: NodeId,
    pub dest_alias: Alias,
    pub dest_id: NodeId,
}

impl Header {
    pub const EMPTY: Header = Header {
        mti: Mti::new(0),
        source_alias: Alias::NULL,
        source_id: NodeId::NULL,
        dest_alias: Alias::NULL,
        dest_id: NodeId::NULL,
    };
}

/// Borrowed read view of a stored message.
#[derive(Debug, Copy, Clone)]
pub struct MsgView<'a> {
    pub header: &'a Header,
    pub payload: &'a [u8],
}

#[derive(Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Overflow;

struct Slot<const CAP: usize> {
    allocated: bool,
    in_process: bool,
    header: Header,
    count: u16,
    payload: [u8; CAP],
}

impl<const CAP: usize> Slot<CAP> {
    const FREE: Slot<CAP> = Slot {
        allocated: false,
        in_process: false,
        header: Header::EMPTY,
        count: 0,
        payload: [0; CAP],
    };

    fn reset(&mut self) {
        self.in_process = false;
        self.header = Header::EMPTY;
        self.count = 0;
        self.payload = [0; CAP];
    }
}

/// The two-class buffer pool.
pub struct Store<const NB: usize, const NE: usize> {
    basic: [Slot<BASIC_PAYLOAD>; NB],
    extended: [Slot<EXTENDED_PAYLOAD>; NE],
}

macro_rules! with_slot {
    ($self:ident, $handle:ident, $slot:ident => $body:expr) => {
        match $handle.class {
            Class::Basic => {
                let $slot = &$self.basic[usize::from($handle.index)];
                $body
            }
            Class::Extended => {
                let $slot = &$self.extended[usize::from($handle.index)];
                $body
            }
        }
    };
}

macro_rules! with_slot_mut {
    ($self:ident, $handle:ident, $slot:ident => $body:expr) => {
        match $handle.class {
            Class::Basic => {
                let $slot = &mut $self.basic[usize::from($handle.index)];
                $body
            }
            Class::Extended => {
                let $slot = &mut $self.extended[usize::from($handle.index)];
                $body
            }
        }
    };
}

impl<const NB: usize, const NE: usize> Store<NB, NE> {
    pub const fn new() -> Self {
        Self {
            basic: [Slot::FREE; NB],
            extended: [Slot::FREE; NE],
        }
    }

    /// Returns a zero-initialized buffer of the requested class, or `None`
    /// when the pool is exhausted.
    pub fn allocate(&mut self, class: Class) -> Option<Handle> {
        fn scan<const CAP: usize>(slots: &mut [Slot<CAP>]) -> Option<u8> {
            let (index, slot) = slots.iter_mut().enumerate().find(|(_, s)| !s.allocated)?;
            slot.allocated = true;
            slot.reset();
            Some(index as u8)
        }

        let index = match class {
            Class::Basic => scan(&mut self.basic)?,
            Class::Extended => scan(&mut self.extended)?,
        };
        Some(Handle { class, index })
    }

    /// Returns the buffer to its pool.
    pub fn free(&mut self, handle: Handle) {
        with_slot_mut!(self, handle, slot => {
            slot.allocated = false;
            slot.in_process = false;
        });
    }

    pub fn capacity(&self, handle: Handle) -> usize {
        match handle.class {
            Class::Basic => BASIC_PAYLOAD,
            Class::Extended => EXTENDED_PAYLOAD,
        }
    }

    pub fn free_count(&self, class: Class) -> usize {
        match class {
            Class::Basic => self.basic.iter().filter(|s| !s.allocated).count(),
            Class::Extended => self.extended.iter().filter(|s| !s.allocated).count(),
        }
    }

    pub fn header(&self, handle: Handle) -> &Header {
        with_slot!(self, handle, slot => &slot.header)
    }

    pub fn header_mut(&mut self, handle: Handle) -> &mut Header {
        with_slot_mut!(self, handle, slot => &mut slot.header)
    }

    pub fn payload(&self, handle: Handle) -> &[u8] {
        with_slot!(self, handle, slot => &slot.payload[..usize::from(slot.count)])
    }

    pub fn view(&self, handle: Handle) -> MsgView<'_> {
        with_slot!(self, handle, slot => MsgView {
            header: &slot.header,
            payload: &slot.payload[..usize::from(slot.count)],
        })
    }

    /// Appends bytes to the payload; fails without writing when the class
    /// capacity would be exceeded.
    pub fn append(&mut self, handle: Handle, bytes: &[u8]) -> Result<(), Overflow> {
        with_slot_mut!(self, handle, slot => {
            let count = usize::from(slot.count);
            if count + bytes.len() > slot.payload.len() {
                return Err(Overflow);
            }
            slot.payload[count..count + bytes.len()].copy_from_slice(bytes);
            slot.count = (count + bytes.len()) as u16;
            Ok(())
        })
    }

    pub fn payload_count(&self, handle: Handle) -> usize {
        with_slot!(self, handle, slot => usize::from(slot.count))
    }

    pub fn set_in_process(&mut self, handle: Handle, in_process: bool) {
        with_slot_mut!(self, handle, slot => slot.in_process = in_process);
    }

    pub fn in_process(&self, handle: Handle) -> bool {
        with_slot!(self, handle, slot => slot.in_process)
    }
}

impl<const NB: usize, const NE: usize> Default for Store<NB, NE> {
    fn default() -> Self {
        Self::new()
    }
}

/// Ordered queue of buffer handles between producer and consumer stages.
pub struct HandleFifo<const N: usize> {
    queue: Deque<Handle, N>,
}

impl<const N: usize> HandleFifo<N> {
    pub const fn new() -> Self {
        Self {
            queue: Deque::new(),
        }
    }

    pub fn push(&mut self, handle: Handle) -> Result<(), Handle> {
        self.queue.push_back(handle)
    }

    pub fn pop(&mut self) -> Option<Handle> {
        self.queue.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }
}

impl<const N: usize> Default for HandleFifo<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// The dispatcher's outgoing worker message.
///
/// Replies are built here rather than in the pool; the fragmenter drains it
/// into CAN frames before the next message is dispatched, so a single worker
/// suffices and pool exhaustion can never stall replies.
#[derive(Debug, Clone)]
pub struct OutMessage {
    pub header: Header,
    payload: heapless::Vec<u8, EXTENDED_PAYLOAD>,
}

impl OutMessage {
    pub const fn new() -> Self {
        Self {
            header: Header::EMPTY,
            payload: heapless::Vec::new(),
        }
    }

    pub fn load(
        &mut self,
        source_alias: Alias,
        source_id: NodeId,
        dest_alias: Alias,
        dest_id: NodeId,
        mti: Mti,
    ) {
        self.header = Header {
            mti,
            source_alias,
            source_id,
            dest_alias,
            dest_id,
        };
        self.payload.clear();
    }

    /// Convenience for addressed replies: swaps the incoming source into the
    /// destination.
    pub fn load_reply(&mut self, node_alias: Alias, node_id: NodeId, incoming: &Header, mti: Mti) {
        self.load(
            node_alias,
            node_id,
            incoming.source_alias,
            incoming.source_id,
            mti,
        );
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn push(&mut self, byte: u8) -> Result<(), Overflow> {
        self.payload.push(byte).map_err(|_| Overflow)
    }

    pub fn extend(&mut self, bytes: &[u8]) -> Result<(), Overflow> {
        self.payload
            .extend_from_slice(bytes)
            .map_err(|_| Overflow)
    }

    pub fn push_u16(&mut self, value: u16) -> Result<(), Overflow> {
        self.extend(&value.to_be_bytes())
    }

    pub fn push_node_id(&mut self, id: NodeId) -> Result<(), Overflow> {
        self.extend(&id.to_bytes())
    }

    pub fn push_event_id(&mut self, event: emlcb_core::EventId) -> Result<(), Overflow> {
        self.extend(&event.to_bytes())
    }
}

impl Default for OutMessage {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type TestStore = Store<2, 1>;

    #[test]
    fn test_allocate_zeroed_and_free() {
        let mut store = TestStore::new();
        let a = store.allocate(Class::Basic).unwrap();
        store.append(a, &[1, 2, 3]).unwrap();
        assert_eq!(store.payload(a), &[1, 2, 3]);
        store.free(a);

        // Same slot comes back zeroed.
        let b = store.allocate(Class::Basic).unwrap();
        assert_eq!(b, a);
        assert_eq!(store.payload(b), &[]);
        assert_eq!(store.payload_count(b), 0);
    }

    #[test]
    fn test_pool_exhaustion() {
        let mut store = TestStore::new();
        let _a = store.allocate(Class::Basic).unwrap();
        let _b = store.allocate(Class::Basic).unwrap();
        assert!(store.allocate(Class::Basic).is_none());
        assert!(store.allocate(Class::Extended).is_some());
        assert_eq!(store.free_count(Class::Basic), 0);
    }

    #[test]
    fn test_append_respects_capacity() {
        let mut store = TestStore::new();
        let handle = store.allocate(Class::Basic).unwrap();
        assert_eq!(store.capacity(handle), BASIC_PAYLOAD);
        store.append(handle, &[0; BASIC_PAYLOAD]).unwrap();
        assert!(store.append(handle, &[0]).is_err());
        assert_eq!(store.payload_count(handle), BASIC_PAYLOAD);
    }

    #[test]
    fn test_fifo_order() {
        let mut store = TestStore::new();
        let mut fifo: HandleFifo<4> = HandleFifo::new();
        let a = store.allocate(Class::Basic).unwrap();
        let b = store.allocate(Class::Extended).unwrap();
        fifo.push(a).unwrap();
        fifo.push(b).unwrap();
        assert_eq!(fifo.len(), 2);
        assert_eq!(fifo.pop(), Some(a));
        assert_eq!(fifo.pop(), Some(b));
        assert_eq!(fifo.pop(), None);
    }

    #[test]
    fn test_out_message_load_reply() {
        let incoming = Header {
            mti: Mti::SIMPLE_NODE_INFO_REQUEST,
            source_alias: Alias::new(0x123).unwrap(),
            source_id: NodeId::new(0x0101).unwrap(),
            dest_alias: Alias::new(0x456).unwrap(),
            dest_id: NodeId::NULL,
        };
        let mut out = OutMessage::new();
        out.load_reply(
            Alias::new(0x456).unwrap(),
            NodeId::new(0x0202).unwrap(),
            &incoming,
            Mti::SIMPLE_NODE_INFO_REPLY,
        );
        out.push(0x04).unwrap();
        assert_eq!(out.header.dest_alias, incoming.source_alias);
        assert_eq!(out.header.mti, Mti::SIMPLE_NODE_INFO_REPLY);
        assert_eq!(out.payload(), &[0x04]);
    }
}
