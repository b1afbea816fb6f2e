//! OpenLCB protocol core data types
//!
//! This crate provides basic data type definitions used by other Emlcb crates.
//! Emlcb users should not depend on this crate directly. Use `emlcb::core` reexport instead.
//!
//! # References:
//!
//! * \[1\] OpenLCB CAN Frame Transfer Standard
//! * \[2\] OpenLCB Message Network Standard
//! * \[3\] OpenLCB Event Transport Standard
//! * \[4\] OpenLCB Memory Configuration Standard
#![no_std]

#[derive(Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct InvalidValue;

/// A 48-bit node identifier, globally unique per physical device.
///
/// Immutable after node construction. Stored in the low 48 bits of a `u64`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct NodeId(u64);

impl NodeId {
    const MAX_VALUE: u64 = 0xFFFF_FFFF_FFFF;
    pub const MAX: NodeId = NodeId(Self::MAX_VALUE);
    pub const NULL: NodeId = NodeId(0);

    pub const fn new(value: u64) -> Option<Self> {
        if value <= Self::MAX_VALUE {
            Some(Self(value))
        } else {
            None
        }
    }

    pub const fn from_u64_truncating(value: u64) -> Self {
        Self(value & Self::MAX_VALUE)
    }

    pub const fn into_u64(self) -> u64 {
        self.0
    }

    pub const fn is_null(&self) -> bool {
        self.0 == 0
    }

    /// Big-endian 6-byte wire representation [2; 3.2]
    pub const fn to_bytes(self) -> [u8; 6] {
        [
            (self.0 >> 40) as u8,
            (self.0 >> 32) as u8,
            (self.0 >> 24) as u8,
            (self.0 >> 16) as u8,
            (self.0 >> 8) as u8,
            self.0 as u8,
        ]
    }

    pub const fn from_bytes(bytes: [u8; 6]) -> Self {
        Self(
            (bytes[0] as u64) << 40
                | (bytes[1] as u64) << 32
                | (bytes[2] as u64) << 24
                | (bytes[3] as u64) << 16
                | (bytes[4] as u64) << 8
                | bytes[5] as u64,
        )
    }
}

impl From<NodeId> for u64 {
    fn from(value: NodeId) -> Self {
        value.into_u64()
    }
}

impl TryFrom<u64> for NodeId {
    type Error = InvalidValue;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        Self::new(value).ok_or(InvalidValue)
    }
}

/// A 12-bit CAN short address dynamically bound to a [NodeId] on one segment.
///
/// The null alias (0) is reserved and never transmitted by a Permitted node;
/// it marks an unassigned alias or a global destination.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Alias(u16);

impl Alias {
    const MAX_VALUE: u16 = 0x0FFF;
    pub const MAX: Alias = Alias(Self::MAX_VALUE);
    pub const NULL: Alias = Alias(0);

    pub const fn new(value: u16) -> Option<Self> {
        if value <= Self::MAX_VALUE {
            Some(Self(value))
        } else {
            None
        }
    }

    pub const fn from_u16_truncating(value: u16) -> Self {
        Self(value & Self::MAX_VALUE)
    }

    pub const fn into_u16(self) -> u16 {
        self.0
    }

    pub const fn is_null(&self) -> bool {
        self.0 == 0
    }
}

impl From<Alias> for u16 {
    fn from(value: Alias) -> Self {
        value.into_u16()
    }
}

impl TryFrom<u16> for Alias {
    type Error = InvalidValue;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        Self::new(value).ok_or(InvalidValue)
    }
}

/// A 64-bit producer/consumer event identifier [3; 2]
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EventId(u64);

impl EventId {
    pub const NULL: EventId = EventId(0);

    // Well-known events, auto-routed between segments
    pub const EMERGENCY_OFF: EventId = EventId(0x0100_0000_0000_FFFF);
    pub const CLEAR_EMERGENCY_OFF: EventId = EventId(0x0100_0000_0000_FFFE);
    pub const EMERGENCY_STOP: EventId = EventId(0x0100_0000_0000_FFFD);
    pub const CLEAR_EMERGENCY_STOP: EventId = EventId(0x0100_0000_0000_FFFC);
    pub const NODE_RECORDED_NEW_LOG: EventId = EventId(0x0100_0000_0000_FFF8);
    pub const POWER_SUPPLY_BROWN_OUT_NODE: EventId = EventId(0x0100_0000_0000_FFF1);
    pub const POWER_SUPPLY_BROWN_OUT_STANDARD: EventId = EventId(0x0100_0000_0000_FFF0);
    pub const IDENT_BUTTON_COMBO_PRESSED: EventId = EventId(0x0100_0000_0000_FF00);

    // Well-known events, not auto-routed
    pub const DUPLICATE_NODE_DETECTED: EventId = EventId(0x0101_0000_0000_0201);
    pub const TRAIN: EventId = EventId(0x0101_0000_0000_0303);
    pub const FIRMWARE_CORRUPTED: EventId = EventId(0x0101_0000_0000_0601);
    pub const FIRMWARE_UPGRADE_BY_HARDWARE_SWITCH: EventId = EventId(0x0101_0000_0000_0602);

    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn into_u64(self) -> u64 {
        self.0
    }

    /// Builds an event in a node's reserved event space: the node id in the
    /// upper 6 bytes, `suffix` in the lower 2 [3; 2.1]
    pub const fn from_node_id(node_id: NodeId, suffix: u16) -> Self {
        Self(node_id.into_u64() << 16 | suffix as u64)
    }

    pub const fn to_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    pub const fn from_bytes(bytes: [u8; 8]) -> Self {
        Self(u64::from_be_bytes(bytes))
    }
}

impl From<EventId> for u64 {
    fn from(value: EventId) -> Self {
        value.into_u64()
    }
}

impl From<u64> for EventId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl core::ops::BitOr<u64> for EventId {
    type Output = Self;
    fn bitor(self, rhs: u64) -> Self::Output {
        Self(self.0 | rhs)
    }
}

/// Power-of-two width of an event range registration [3; 3.2]
///
/// Only widths that keep the range base aligned are representable.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EventRangeCount(u16);

impl EventRangeCount {
    pub const MIN: EventRangeCount = EventRangeCount(4);
    pub const MAX: EventRangeCount = EventRangeCount(32768);

    pub const fn new(value: u16) -> Option<Self> {
        if value.is_power_of_two() && value >= Self::MIN.0 {
            Some(Self(value))
        } else {
            None
        }
    }

    pub const fn into_u16(self) -> u16 {
        self.0
    }

    /// The all-ones mask covering the range's low bits.
    pub const fn mask(self) -> u64 {
        self.0 as u64 - 1
    }
}

/// A contiguous, power-of-two-aligned block of event identifiers.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EventRange {
    base: EventId,
    count: EventRangeCount,
}

impl EventRange {
    pub const fn new(base: EventId, count: EventRangeCount) -> Self {
        // Low bits of the base are forced clear so base | mask is the range end.
        Self {
            base: EventId::new(base.into_u64() & !count.mask()),
            count,
        }
    }

    pub const fn base(&self) -> EventId {
        self.base
    }

    pub const fn count(&self) -> EventRangeCount {
        self.count
    }

    pub const fn contains(&self, event: EventId) -> bool {
        let start = self.base.into_u64();
        event.into_u64() >= start && event.into_u64() <= start + self.count.mask()
    }

    /// Range-identified wire encoding: the base with the mask bits set to the
    /// complement of the base's low bit [3; 3.2]
    pub const fn encode(&self) -> EventId {
        let mask = self.count.mask();
        let base = self.base.into_u64();
        if base & (mask + 1) == 0 {
            EventId::new(base | mask)
        } else {
            EventId::new(base & !mask)
        }
    }
}

/// Status carried by producer/consumer identified replies [3; 3.1]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EventStatus {
    #[default]
    Unknown,
    Set,
    Clear,
    Reserved,
}

/// A 16-bit Message Type Indicator.
///
/// On CAN only the low 12 bits travel in the identifier's variable field;
/// the datagram and stream values exceed 12 bits and are reconstructed from
/// the frame type [1; 4.2]
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Mti(u16);

impl Mti {
    pub const INITIALIZATION_COMPLETE: Mti = Mti(0x0100);
    pub const INITIALIZATION_COMPLETE_SIMPLE: Mti = Mti(0x0101);
    pub const VERIFY_NODE_ID_ADDRESSED: Mti = Mti(0x0488);
    pub const VERIFY_NODE_ID_GLOBAL: Mti = Mti(0x0490);
    pub const VERIFIED_NODE_ID: Mti = Mti(0x0170);
    pub const VERIFIED_NODE_ID_SIMPLE: Mti = Mti(0x0171);
    pub const OPTIONAL_INTERACTION_REJECTED: Mti = Mti(0x0068);
    pub const TERMINATE_DUE_TO_ERROR: Mti = Mti(0x00A8);
    pub const PROTOCOL_SUPPORT_INQUIRY: Mti = Mti(0x0828);
    pub const PROTOCOL_SUPPORT_REPLY: Mti = Mti(0x0668);

    pub const CONSUMER_IDENTIFY: Mti = Mti(0x08F4);
    pub const CONSUMER_IDENTIFY_RANGE: Mti = Mti(0x04A4);
    pub const CONSUMER_IDENTIFIED_UNKNOWN: Mti = Mti(0x04C7);
    pub const CONSUMER_IDENTIFIED_SET: Mti = Mti(0x04C4);
    pub const CONSUMER_IDENTIFIED_CLEAR: Mti = Mti(0x04C5);
    pub const CONSUMER_IDENTIFIED_RESERVED: Mti = Mti(0x04C6);
    pub const PRODUCER_IDENTIFY: Mti = Mti(0x0914);
    pub const PRODUCER_IDENTIFY_RANGE: Mti = Mti(0x0524);
    pub const PRODUCER_IDENTIFIED_UNKNOWN: Mti = Mti(0x0547);
    pub const PRODUCER_IDENTIFIED_SET: Mti = Mti(0x0544);
    pub const PRODUCER_IDENTIFIED_CLEAR: Mti = Mti(0x0545);
    pub const PRODUCER_IDENTIFIED_RESERVED: Mti = Mti(0x0546);
    pub const EVENTS_IDENTIFY_DEST: Mti = Mti(0x0968);
    pub const EVENTS_IDENTIFY: Mti = Mti(0x0970);
    pub const EVENT_LEARN: Mti = Mti(0x0594);
    pub const PC_EVENT_REPORT: Mti = Mti(0x05B4);
    pub const PC_EVENT_REPORT_WITH_PAYLOAD: Mti = Mti(0x0F14);

    pub const SIMPLE_NODE_INFO_REQUEST: Mti = Mti(0x0DE8);
    pub const SIMPLE_NODE_INFO_REPLY: Mti = Mti(0x0A08);
    pub const SIMPLE_TRAIN_INFO_REQUEST: Mti = Mti(0x0DA8);
    pub const SIMPLE_TRAIN_INFO_REPLY: Mti = Mti(0x09C8);

    pub const TRACTION_PROTOCOL: Mti = Mti(0x05EB);
    pub const TRACTION_REPLY: Mti = Mti(0x01E9);

    pub const STREAM_INIT_REQUEST: Mti = Mti(0x0CC8);
    pub const STREAM_INIT_REPLY: Mti = Mti(0x0868);
    pub const STREAM_PROCEED: Mti = Mti(0x0888);
    pub const STREAM_COMPLETE: Mti = Mti(0x08A8);

    pub const DATAGRAM: Mti = Mti(0x1C48);
    pub const DATAGRAM_OK_REPLY: Mti = Mti(0x0A28);
    pub const DATAGRAM_REJECTED_REPLY: Mti = Mti(0x0A48);

    const MASK_STREAM_OR_DATAGRAM: u16 = 0x1000;
    const MASK_PRIORITY: u16 = 0x0C00;
    const MASK_SIMPLE_PROTOCOL: u16 = 0x0010;
    const MASK_DEST_ADDRESS_PRESENT: u16 = 0x0008;
    const MASK_EVENT_PRESENT: u16 = 0x0004;

    pub const fn new(value: u16) -> Self {
        Self(value)
    }

    pub const fn into_u16(self) -> u16 {
        self.0
    }

    /// Low 12 bits, as carried in the CAN identifier variable field.
    pub const fn can_variable_field(self) -> u16 {
        self.0 & 0x0FFF
    }

    pub const fn is_addressed(self) -> bool {
        self.0 & Self::MASK_DEST_ADDRESS_PRESENT != 0
    }

    pub const fn has_event(self) -> bool {
        self.0 & Self::MASK_EVENT_PRESENT != 0
    }

    pub const fn is_simple_protocol(self) -> bool {
        self.0 & Self::MASK_SIMPLE_PROTOCOL != 0
    }

    pub const fn is_stream_or_datagram(self) -> bool {
        self.0 & Self::MASK_STREAM_OR_DATAGRAM != 0
    }

    pub const fn priority(self) -> u8 {
        ((self.0 & Self::MASK_PRIORITY) >> 10) as u8
    }

    /// Consumer-identified reply MTI for a stored event status [3; 3.1]
    pub const fn consumer_identified(status: EventStatus) -> Mti {
        match status {
            EventStatus::Unknown => Self::CONSUMER_IDENTIFIED_UNKNOWN,
            EventStatus::Set => Self::CONSUMER_IDENTIFIED_SET,
            EventStatus::Clear => Self::CONSUMER_IDENTIFIED_CLEAR,
            EventStatus::Reserved => Self::CONSUMER_IDENTIFIED_RESERVED,
        }
    }

    pub const fn producer_identified(status: EventStatus) -> Mti {
        match status {
            EventStatus::Unknown => Self::PRODUCER_IDENTIFIED_UNKNOWN,
            EventStatus::Set => Self::PRODUCER_IDENTIFIED_SET,
            EventStatus::Clear => Self::PRODUCER_IDENTIFIED_CLEAR,
            EventStatus::Reserved => Self::PRODUCER_IDENTIFIED_RESERVED,
        }
    }
}

impl From<Mti> for u16 {
    fn from(value: Mti) -> Self {
        value.into_u16()
    }
}

/// The Protocol Support Indicator bitmap advertised by a node [2; 3.3.6]
///
/// Bit positions follow the wire encoding: the most significant defined bit
/// (Simple) is 0x80_0000, transmitted first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ProtocolSupport(u32);

impl ProtocolSupport {
    pub const NONE: Self = Self(0);

    pub const SIMPLE: Self = Self(0x80_0000);
    pub const DATAGRAM: Self = Self(0x40_0000);
    pub const STREAM: Self = Self(0x20_0000);
    pub const MEMORY_CONFIGURATION: Self = Self(0x10_0000);
    pub const RESERVATION: Self = Self(0x08_0000);
    pub const EVENT_EXCHANGE: Self = Self(0x04_0000);
    pub const IDENTIFICATION: Self = Self(0x02_0000);
    pub const TEACHING_LEARNING: Self = Self(0x01_0000);
    pub const REMOTE_BUTTON: Self = Self(0x00_8000);
    pub const ABBREVIATED_DEFAULT_CDI: Self = Self(0x00_4000);
    pub const DISPLAY: Self = Self(0x00_2000);
    pub const SIMPLE_NODE_INFORMATION: Self = Self(0x00_1000);
    pub const CONFIGURATION_DESCRIPTION_INFO: Self = Self(0x00_0800);
    pub const TRAIN_CONTROL: Self = Self(0x00_0400);
    pub const FUNCTION_DESCRIPTION: Self = Self(0x00_0200);
    pub const FUNCTION_CONFIGURATION: Self = Self(0x00_0040);
    pub const FIRMWARE_UPGRADE: Self = Self(0x00_0020);
    pub const FIRMWARE_UPGRADE_ACTIVE: Self = Self(0x00_0010);

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn into_bits(self) -> u32 {
        self.0
    }

    pub const fn contains(&self, flags: Self) -> bool {
        self.0 & flags.0 == flags.0
    }

    pub const fn insert(&mut self, flags: Self) {
        self.0 |= flags.0;
    }

    pub const fn remove(&mut self, flags: Self) {
        self.0 &= !flags.0;
    }

    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// The 6-byte Protocol Support Reply payload; only the first three bytes
    /// carry defined flags [2; 3.3.7]
    pub const fn to_reply_bytes(self) -> [u8; 6] {
        [
            (self.0 >> 16) as u8,
            (self.0 >> 8) as u8,
            self.0 as u8,
            0,
            0,
            0,
        ]
    }
}

impl core::ops::BitOr for ProtocolSupport {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

impl core::ops::BitOrAssign for ProtocolSupport {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// A two-byte OpenLCB error code [2; 3.5]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ErrorCode(u16);

impl ErrorCode {
    pub const PERMANENT: ErrorCode = ErrorCode(0x1000);
    pub const PERMANENT_ADDRESS_SPACE_UNKNOWN: ErrorCode = ErrorCode(0x1001);
    pub const PERMANENT_OUT_OF_BOUNDS: ErrorCode = ErrorCode(0x1002);
    pub const PERMANENT_WRITE_TO_READ_ONLY: ErrorCode = ErrorCode(0x1003);
    pub const PERMANENT_SOURCE_NOT_PERMITTED: ErrorCode = ErrorCode(0x1020);
    pub const PERMANENT_NOT_IMPLEMENTED: ErrorCode = ErrorCode(0x1040);
    pub const PERMANENT_UNKNOWN_SUBCOMMAND: ErrorCode = ErrorCode(0x1041);
    pub const PERMANENT_UNKNOWN_COMMAND: ErrorCode = ErrorCode(0x1042);
    pub const PERMANENT_UNKNOWN_MTI: ErrorCode = ErrorCode(0x1043);
    pub const PERMANENT_COUNT_OUT_OF_RANGE: ErrorCode = ErrorCode(0x1044);
    pub const PERMANENT_INVALID_ARGUMENTS: ErrorCode = ErrorCode(0x1080);

    pub const TEMPORARY: ErrorCode = ErrorCode(0x2000);
    pub const TEMPORARY_TIMEOUT: ErrorCode = ErrorCode(0x2010);
    pub const TEMPORARY_BUFFER_UNAVAILABLE: ErrorCode = ErrorCode(0x2020);
    pub const TEMPORARY_OUT_OF_ORDER: ErrorCode = ErrorCode(0x2040);
    pub const TEMPORARY_MIDDLE_END_WITH_NO_START: ErrorCode = ErrorCode(0x2041);
    pub const TEMPORARY_START_BEFORE_LAST_END: ErrorCode = ErrorCode(0x2042);
    pub const TEMPORARY_TRANSFER_ERROR: ErrorCode = ErrorCode(0x2080);

    pub const fn new(value: u16) -> Self {
        Self(value)
    }

    pub const fn into_u16(self) -> u16 {
        self.0
    }

    pub const fn is_permanent(self) -> bool {
        self.0 & 0xF000 == 0x1000
    }

    pub const fn is_temporary(self) -> bool {
        self.0 & 0xF000 == 0x2000
    }

    pub const fn to_bytes(self) -> [u8; 2] {
        self.0.to_be_bytes()
    }
}

impl From<ErrorCode> for u16 {
    fn from(value: ErrorCode) -> Self {
        value.into_u16()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_bytes() {
        let id = NodeId::new(0x0203_0405_0607).unwrap();
        assert_eq!(id.to_bytes(), [0x02, 0x03, 0x04, 0x05, 0x06, 0x07]);
        assert_eq!(NodeId::from_bytes(id.to_bytes()), id);
        assert!(NodeId::new(0x1_0000_0000_0000).is_none());
    }

    #[test]
    fn test_alias_range() {
        assert!(Alias::new(0x0FFF).is_some());
        assert!(Alias::new(0x1000).is_none());
        assert_eq!(Alias::from_u16_truncating(0x1AAA).into_u16(), 0x0AAA);
        assert!(Alias::NULL.is_null());
    }

    #[test]
    fn test_mti_predicates() {
        assert!(Mti::SIMPLE_NODE_INFO_REQUEST.is_addressed());
        assert!(!Mti::PC_EVENT_REPORT.is_addressed());
        assert!(Mti::PC_EVENT_REPORT.has_event());
        assert!(Mti::DATAGRAM.is_stream_or_datagram());
        assert_eq!(Mti::DATAGRAM.can_variable_field(), 0xC48);
    }

    #[test]
    fn test_protocol_support_reply_bytes() {
        let psi = ProtocolSupport::SIMPLE
            | ProtocolSupport::DATAGRAM
            | ProtocolSupport::SIMPLE_NODE_INFORMATION;
        assert_eq!(psi.to_reply_bytes(), [0xC0, 0x10, 0x00, 0, 0, 0]);
        assert!(psi.contains(ProtocolSupport::DATAGRAM));
        assert!(!psi.contains(ProtocolSupport::STREAM));
    }

    #[test]
    fn test_event_range() {
        let count = EventRangeCount::new(16).unwrap();
        let range = EventRange::new(EventId::new(0x0102_0304_0506_0708), count);
        assert_eq!(range.base().into_u64(), 0x0102_0304_0506_0700);
        assert!(range.contains(EventId::new(0x0102_0304_0506_070F)));
        assert!(!range.contains(EventId::new(0x0102_0304_0506_0710)));
        assert!(EventRangeCount::new(3).is_none());
        assert!(EventRangeCount::new(2).is_none());
    }

    #[test]
    fn test_event_range_encoding() {
        // Base with low range bit clear: mask bits are set.
        let count = EventRangeCount::new(256).unwrap();
        let range = EventRange::new(EventId::new(0x0101_0000_0001_0000), count);
        assert_eq!(range.encode().into_u64(), 0x0101_0000_0001_00FF);
    }

    #[test]
    fn test_error_code_families() {
        assert!(ErrorCode::PERMANENT_INVALID_ARGUMENTS.is_permanent());
        assert!(ErrorCode::TEMPORARY_TRANSFER_ERROR.is_temporary());
        assert_eq!(ErrorCode::TEMPORARY_MIDDLE_END_WITH_NO_START.to_bytes(), [0x20, 0x41]);
    }

    #[test]
    fn test_identified_mti_selection() {
        assert_eq!(Mti::consumer_identified(EventStatus::Set), Mti::CONSUMER_IDENTIFIED_SET);
        assert_eq!(Mti::producer_identified(EventStatus::Unknown), Mti::PRODUCER_IDENTIFIED_UNKNOWN);
    }
}
