//! Virtual node state and registry

use emlcb_core::{Alias, EventId, EventStatus, NodeId};

use crate::buffer::Handle;
use crate::consts;
use crate::protocol::clock::ClockSlot;
use crate::protocol::traction::TrainState;

pub mod events;
pub mod params;
mod registry;

pub use events::{EventEntry, EventTable, TableFull};
pub use params::{AddressSpace, ConfigurationOptions, NodeParameters, SnipIdent};
pub use registry::Registry;

pub type ConsumerTable = EventTable<{ consts::CONSUMER_COUNT }, { consts::CONSUMER_RANGE_COUNT }>;
pub type ProducerTable = EventTable<{ consts::PRODUCER_COUNT }, { consts::PRODUCER_RANGE_COUNT }>;

/// Login progression of a node, driven by main-loop passes, bus observations
/// and 100 ms ticks [1; 6.2]
///
/// The order is significant: everything below `Run` may not send addressed
/// traffic.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum RunState {
    Init,
    GenerateSeed,
    GenerateAlias,
    SendCid7,
    SendCid6,
    SendCid5,
    SendCid4,
    Wait200ms,
    SendReserveId,
    SendAliasMapDefinition,
    SendInitializationComplete,
    SendProducerEvents,
    SendConsumerEvents,
    Run,
}

/// Node state bits.
#[derive(Debug, Copy, Clone, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct NodeFlags {
    /// Alias reserved and announced; the CAN login is complete.
    pub permitted: bool,
    /// Initialization Complete sent; the node is live on the network.
    pub initialized: bool,
    /// Duplicate-node-id event already emitted this boot.
    pub duplicate_id_detected: bool,
    /// Firmware upgrade via space 0xEF is in progress.
    pub firmware_upgrade_active: bool,
}

/// Continuation of the two-step datagram reply.
///
/// The acknowledgement goes out on the pass that received the datagram; the
/// data reply is produced on a later pass while the original request stays
/// owned by the node.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DatagramStage {
    Idle,
    AckSent(Handle),
}

/// Multi-message reply progression for Identify Events and range identifies.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EnumPhase {
    ProducerEntries,
    ProducerRanges,
    ConsumerEntries,
    ConsumerRanges,
}

#[derive(Debug, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Enumerator {
    pub running: bool,
    pub phase: EnumPhase,
    pub index: u16,
}

impl Enumerator {
    pub const fn idle() -> Self {
        Self {
            running: false,
            phase: EnumPhase::ProducerEntries,
            index: 0,
        }
    }

    pub fn start(&mut self, phase: EnumPhase) {
        self.running = true;
        self.phase = phase;
        self.index = 0;
    }

    pub fn stop(&mut self) {
        self.running = false;
        self.index = 0;
    }
}

/// A virtual OpenLCB node.
///
/// Allocated from the [`Registry`] and alive for the program lifetime; a
/// node is never deallocated, though it can lose Permitted state and
/// renegotiate its alias.
pub struct Node {
    pub id: NodeId,
    pub alias: Alias,
    pub parameters: &'static NodeParameters,
    pub flags: NodeFlags,
    pub run_state: RunState,
    /// Seed the next alias is derived from; reseeded after collisions.
    pub seed: u64,
    /// 100 ms ticks since the last login state change.
    pub timer_ticks: u16,
    pub consumers: ConsumerTable,
    pub producers: ProducerTable,
    pub datagram_stage: DatagramStage,
    /// Datagram retained for the stage-two reply.
    pub last_received_datagram: Option<Handle>,
    /// Node id holding the Memory Configuration reservation lock, null when
    /// unlocked [4; 4.8]
    pub lock_node: NodeId,
    pub enumerator: Enumerator,
    /// Set when an alias collision demands the duplicate-node event after
    /// the node is back on the bus.
    pub emit_duplicate_event: bool,
    /// Sequence counter for Get Unique ID replies.
    pub unique_id_counter: u16,
    pub train: Option<TrainState>,
    pub clock: Option<ClockSlot>,
}

impl Node {
    pub fn new(id: NodeId, parameters: &'static NodeParameters) -> Self {
        let mut consumers = ConsumerTable::new();
        let mut producers = ProducerTable::new();

        // Autocreated events draw consecutive suffixes from the node's
        // reserved event space, consumers first.
        let consumer_count = u16::from(parameters.consumer_count_autocreate);
        for suffix in 0..consumer_count {
            let _ = consumers.register(EventId::from_node_id(id, suffix), EventStatus::Unknown);
        }
        for offset in 0..u16::from(parameters.producer_count_autocreate) {
            let _ = producers.register(
                EventId::from_node_id(id, consumer_count + offset),
                EventStatus::Unknown,
            );
        }

        Self {
            id,
            alias: Alias::NULL,
            parameters,
            flags: NodeFlags::default(),
            run_state: RunState::Init,
            seed: id.into_u64(),
            timer_ticks: 0,
            consumers,
            producers,
            datagram_stage: DatagramStage::Idle,
            last_received_datagram: None,
            lock_node: NodeId::NULL,
            enumerator: Enumerator::idle(),
            emit_duplicate_event: false,
            unique_id_counter: 0,
            train: None,
            clock: None,
        }
    }

    /// Drops the alias and restarts negotiation from a fresh seed.
    pub fn restart_login(&mut self) {
        self.alias = Alias::NULL;
        self.flags.permitted = false;
        self.flags.initialized = false;
        self.run_state = RunState::GenerateSeed;
        self.timer_ticks = 0;
    }
}

/// Advances the 48-bit alias seed; a pair of coupled 24-bit congruential
/// steps from the reference implementation.
pub fn next_seed(seed: u64) -> u64 {
    let lfsr1 = (seed & 0xFF_FFFF) as u32;
    let lfsr2 = ((seed >> 24) & 0xFF_FFFF) as u32;

    let temp1 = ((lfsr1 << 9) | ((lfsr2 >> 15) & 0x1FF)) & 0xFF_FFFF;
    let temp2 = (lfsr2 << 9) & 0xFF_FFFF;

    let lfsr1 = lfsr1.wrapping_add(temp1).wrapping_add(0x1B_0CA3);
    let lfsr2 = lfsr2.wrapping_add(temp2).wrapping_add(0x7A_4BA9);

    let lfsr1 = (lfsr1 & 0xFF_FFFF) + ((lfsr2 & 0xFF00_0000) >> 24);
    let lfsr2 = lfsr2 & 0xFF_FFFF;

    u64::from(lfsr1) << 24 | u64::from(lfsr2)
}

/// Folds the seed down to a 12-bit alias candidate; may yield the null
/// alias, in which case the caller reseeds.
pub fn alias_from_seed(seed: u64) -> Alias {
    let lfsr2 = (seed & 0xFF_FFFF) as u32;
    let lfsr1 = ((seed >> 24) & 0xFF_FFFF) as u32;
    Alias::from_u16_truncating(((lfsr1 ^ lfsr2 ^ (lfsr1 >> 12) ^ (lfsr2 >> 12)) & 0x0FFF) as u16)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::params::{
        AddressSpace, ConfigurationOptions, NodeParameters, SnipIdent, space,
    };
    use emlcb_core::ProtocolSupport;

    pub const TEST_CDI: &[u8] = b"<?xml version=\"1.0\"?><cdi></cdi>\0";

    pub const TEST_PARAMETERS: NodeParameters = NodeParameters {
        snip: SnipIdent {
            mfg_version: 4,
            name: "Mustangpeak Engineering",
            model: "TurnoutBOSS",
            hardware_version: "Ver A",
            software_version: "0.1",
            user_version: 2,
        },
        protocol_support: ProtocolSupport::from_bits(
            ProtocolSupport::SIMPLE.into_bits()
                | ProtocolSupport::DATAGRAM.into_bits()
                | ProtocolSupport::MEMORY_CONFIGURATION.into_bits()
                | ProtocolSupport::EVENT_EXCHANGE.into_bits()
                | ProtocolSupport::ABBREVIATED_DEFAULT_CDI.into_bits()
                | ProtocolSupport::SIMPLE_NODE_INFORMATION.into_bits()
                | ProtocolSupport::CONFIGURATION_DESCRIPTION_INFO.into_bits(),
        ),
        consumer_count_autocreate: 2,
        producer_count_autocreate: 2,
        cdi: TEST_CDI,
        fdi: &[],
        configuration_options: ConfigurationOptions {
            write_under_mask: true,
            unaligned_reads: true,
            unaligned_writes: true,
            read_acdi_manufacturer: true,
            read_acdi_user: true,
            write_acdi_user: true,
            stream_read_write: false,
            high_address_space: space::CONFIGURATION_DEFINITION,
            low_address_space: space::TRAIN_FUNCTION_CONFIG,
            description: "",
        },
        address_space_configuration_definition: AddressSpace::read_only(
            TEST_CDI.len() as u32 - 1,
            "Configuration definition info",
        ),
        address_space_all: AddressSpace::ABSENT,
        address_space_config_memory: AddressSpace::read_write(0x1FF, "Configuration memory"),
        address_space_acdi_manufacturer: AddressSpace::read_only(0x7C, "ACDI manufacturer"),
        address_space_acdi_user: AddressSpace::read_write(0x7F, "ACDI user"),
        address_space_train_function_definition: AddressSpace::ABSENT,
        address_space_train_function_config: AddressSpace::ABSENT,
        address_space_firmware: AddressSpace::read_write(0xFFFF, "Firmware"),
        user_data_offset: 0,
    };
}
