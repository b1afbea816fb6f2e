#![allow(dead_code)]

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use emlcb::core::{Alias, EventId, Mti, NodeId, ProtocolSupport};
use emlcb::fifo::FrameFifo;
use emlcb::frame::{CanFrame, CanId, FrameType};
use emlcb::node::params::space;
use emlcb::node::{AddressSpace, ConfigurationOptions, NodeParameters, SnipIdent};
use emlcb::platform::{AppCallbacks, Platform};
use emlcb::{consts, Stack};

pub const NODE_ID: NodeId = match NodeId::new(0x0203_0405_0607) {
    Some(id) => id,
    None => panic!(),
};
pub const PEER_ALIAS: Alias = match Alias::new(0x777) {
    Some(alias) => alias,
    None => panic!(),
};

pub const CDI: &[u8] = b"<?xml version=\"1.0\"?><cdi><identification/><segment space='253'/></cdi>\0";

pub static PARAMETERS: NodeParameters = NodeParameters {
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
            | ProtocolSupport::TRAIN_CONTROL.into_bits()
            | ProtocolSupport::ABBREVIATED_DEFAULT_CDI.into_bits()
            | ProtocolSupport::SIMPLE_NODE_INFORMATION.into_bits()
            | ProtocolSupport::CONFIGURATION_DESCRIPTION_INFO.into_bits(),
    ),
    consumer_count_autocreate: 2,
    producer_count_autocreate: 2,
    cdi: CDI,
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
        CDI.len() as u32 - 1,
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

/// Captures transmitted frames and backs configuration memory with a plain
/// array. The first 127 bytes hold the ACDI user name and description.
pub struct TestPlatform {
    pub frames: Vec<CanFrame>,
    pub accept: usize,
    pub memory: [u8; 512],
    pub rebooted: bool,
}

impl TestPlatform {
    pub fn new() -> Self {
        let mut memory = [0u8; 512];
        memory[..5].copy_from_slice(b"Name\0");
        memory[63..75].copy_from_slice(b"Description\0");
        memory[128..144].copy_from_slice(&[
            0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0A, 0x0B, 0x0C, 0x0D,
            0x0E, 0x0F,
        ]);
        Self {
            frames: Vec::new(),
            accept: usize::MAX,
            memory,
            rebooted: false,
        }
    }
}

impl Platform for TestPlatform {
    fn try_transmit(&mut self, frame: &CanFrame) -> bool {
        if self.frames.len() >= self.accept {
            return false;
        }
        self.frames.push(*frame);
        true
    }

    fn config_memory_read(&mut self, _node: NodeId, address: u32, buffer: &mut [u8]) -> usize {
        let start = address as usize;
        let take = buffer.len().min(self.memory.len().saturating_sub(start));
        buffer[..take].copy_from_slice(&self.memory[start..start + take]);
        take
    }

    fn config_memory_write(&mut self, _node: NodeId, address: u32, data: &[u8]) -> usize {
        let start = address as usize;
        let take = data.len().min(self.memory.len().saturating_sub(start));
        self.memory[start..start + take].copy_from_slice(&data[..take]);
        take
    }

    fn reboot(&mut self) {
        self.rebooted = true;
    }
}

#[derive(Default)]
pub struct TestCallbacks {
    pub reported_events: Vec<(NodeId, EventId)>,
    pub heartbeat_timeouts: Vec<NodeId>,
}

impl AppCallbacks for TestCallbacks {
    fn on_event_report(&mut self, node: NodeId, event: EventId) {
        self.reported_events.push((node, event));
    }

    fn on_heartbeat_timeout(&mut self, node: NodeId) {
        self.heartbeat_timeouts.push(node);
    }
}

pub type TestFifo = FrameFifo<CriticalSectionRawMutex, { consts::FRAME_FIFO_DEPTH }>;
pub type TestStack<'a> = Stack<'a, CriticalSectionRawMutex, TestPlatform, TestCallbacks>;

pub fn new_fifo() -> TestFifo {
    TestFifo::new()
}

pub fn new_stack(frames: &TestFifo) -> TestStack<'_> {
    Stack::new(frames, TestPlatform::new(), TestCallbacks::default())
}

/// Polls and ticks until the node at slot 0 reaches the run state.
pub fn run_login(stack: &mut TestStack<'_>) {
    for _ in 0..100 {
        stack.poll();
        stack.tick_100ms();
        let node = stack.node(0).unwrap();
        if node.flags.initialized && node.run_state == emlcb::node::RunState::Run {
            return;
        }
    }
    panic!("login did not complete");
}

pub fn node_alias(stack: &TestStack<'_>) -> Alias {
    stack.node(0).unwrap().alias
}

/// A global (unaddressed) message frame from the peer.
pub fn global_frame(mti: Mti, payload: &[u8]) -> CanFrame {
    CanFrame::new(
        CanId::openlcb(FrameType::GlobalAddressed, mti.can_variable_field(), PEER_ALIAS),
        payload,
    )
    .unwrap()
}

/// An addressed single-frame message from the peer toward `dest`.
pub fn addressed_frame(mti: Mti, dest: Alias, payload: &[u8]) -> CanFrame {
    let mut data = vec![(dest.into_u16() >> 8) as u8, dest.into_u16() as u8];
    data.extend_from_slice(payload);
    CanFrame::new(
        CanId::openlcb(FrameType::GlobalAddressed, mti.can_variable_field(), PEER_ALIAS),
        &data,
    )
    .unwrap()
}

/// A single-frame datagram from the peer toward `dest`.
pub fn datagram_frame(dest: Alias, payload: &[u8]) -> CanFrame {
    CanFrame::new(
        CanId::openlcb(FrameType::DatagramOnly, dest.into_u16(), PEER_ALIAS),
        payload,
    )
    .unwrap()
}

/// Frames transmitted with the given variable field (12-bit MTI).
pub fn frames_with_mti(platform: &TestPlatform, mti: Mti) -> Vec<CanFrame> {
    platform
        .frames
        .iter()
        .filter(|frame| frame.id.is_openlcb() && frame.id.variable_field() == mti.can_variable_field())
        .copied()
        .collect()
}

/// Reassembles the payload of addressed message frames, stripping the
/// two-byte destination prefix.
pub fn reassemble_addressed(frames: &[CanFrame]) -> Vec<u8> {
    frames.iter().flat_map(|frame| frame.data[2..].to_vec()).collect()
}

/// Reassembles datagram frames (the full frame data is payload).
pub fn reassemble_datagram(frames: &[CanFrame]) -> Vec<u8> {
    frames.iter().flat_map(|frame| frame.data.to_vec()).collect()
}

/// Datagram frames addressed to the peer (reply direction).
pub fn datagram_frames_to_peer(platform: &TestPlatform) -> Vec<CanFrame> {
    platform
        .frames
        .iter()
        .filter(|frame| {
            frame.id.is_openlcb()
                && matches!(
                    frame.id.frame_type(),
                    FrameType::DatagramOnly
                        | FrameType::DatagramFirst
                        | FrameType::DatagramMiddle
                        | FrameType::DatagramFinal
                )
                && frame.id.variable_field() == PEER_ALIAS.into_u16()
        })
        .copied()
        .collect()
}
