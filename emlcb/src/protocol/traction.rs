//! Train Control protocol handler [5]
//!
//! The train side of the Traction protocol: speed/function state, emergency
//! stops, controller assignment and the controller heartbeat. Well-known
//! emergency events are consumed when a node carries train state.
//!
//! Throttle-side send helpers live on the stack façade.

use emlcb_core::{Alias, EventId, EventStatus, Mti, NodeId};

use super::Outgoing;
use crate::buffer::{Header, MsgView};
use crate::consts::TRAIN_FUNCTION_COUNT;
use crate::float16;
use crate::node::Node;
use crate::platform::{AppCallbacks, Emergency, Platform};

/// Traction command bytes [5; 4.1]
pub mod cmd {
    pub const SET_SPEED_DIRECTION: u8 = 0x00;
    pub const SET_FUNCTION: u8 = 0x01;
    pub const EMERGENCY_STOP: u8 = 0x02;
    pub const QUERY_SPEEDS: u8 = 0x10;
    pub const QUERY_FUNCTION: u8 = 0x11;
    pub const CONTROLLER_CONFIG: u8 = 0x20;
    pub const LISTENER_CONFIG: u8 = 0x30;
    pub const MANAGEMENT: u8 = 0x40;

    pub const CONTROLLER_ASSIGN: u8 = 0x01;
    pub const CONTROLLER_RELEASE: u8 = 0x02;
    pub const CONTROLLER_QUERY: u8 = 0x03;

    pub const MGMT_RESERVE: u8 = 0x01;
    pub const MGMT_RELEASE: u8 = 0x02;
    pub const MGMT_NOOP: u8 = 0x03;
}

/// DCC speed step settings carried in the train configuration.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SpeedSteps {
    #[default]
    Default,
    Steps14,
    Steps28,
    Steps128,
}

/// Mutable runtime state of one train node.
pub struct TrainState {
    /// Last commanded speed, float16 with direction sign.
    pub set_speed: u16,
    /// Control algorithm output speed.
    pub commanded_speed: u16,
    /// Measured speed when feedback exists.
    pub actual_speed: u16,
    pub estop_active: bool,
    pub global_estop_active: bool,
    pub global_eoff_active: bool,
    /// Throttle currently assigned; null when free.
    pub controller: NodeId,
    /// Alias the assigned controller last used, for heartbeat tracking.
    pub controller_alias: Alias,
    /// Heartbeat deadline in seconds; 0 disables supervision.
    pub heartbeat_timeout_s: u32,
    /// Countdown in 100 ms ticks.
    pub heartbeat_counter_100ms: u32,
    /// Half-way ping already sent for the current countdown.
    ping_sent: bool,
    pub functions: [u16; TRAIN_FUNCTION_COUNT],
    pub dcc_address: u16,
    pub is_long_address: bool,
    pub speed_steps: SpeedSteps,
}

impl TrainState {
    pub fn new(
        dcc_address: u16,
        is_long_address: bool,
        speed_steps: SpeedSteps,
        heartbeat_timeout_s: u32,
    ) -> Self {
        Self {
            set_speed: float16::POSITIVE_ZERO,
            commanded_speed: float16::POSITIVE_ZERO,
            actual_speed: float16::NAN,
            estop_active: false,
            global_estop_active: false,
            global_eoff_active: false,
            controller: NodeId::NULL,
            controller_alias: Alias::NULL,
            heartbeat_timeout_s,
            heartbeat_counter_100ms: 0,
            ping_sent: false,
            functions: [0; TRAIN_FUNCTION_COUNT],
            dcc_address,
            is_long_address,
            speed_steps,
        }
    }

    fn feed_heartbeat(&mut self) {
        self.heartbeat_counter_100ms = self.heartbeat_timeout_s * 10;
        self.ping_sent = false;
    }
}

/// Registers the events a train produces and consumes [5; 3]
pub fn register_events(node: &mut Node) {
    let _ = node.producers.register(EventId::TRAIN, EventStatus::Set);
    for event in [
        EventId::EMERGENCY_OFF,
        EventId::EMERGENCY_STOP,
        EventId::CLEAR_EMERGENCY_OFF,
        EventId::CLEAR_EMERGENCY_STOP,
    ] {
        let _ = node.consumers.register(event, EventStatus::Set);
    }
}

fn payload_node_id(payload: &[u8], start: usize) -> Option<NodeId> {
    let bytes: [u8; 6] = payload.get(start..start + 6)?.try_into().ok()?;
    Some(NodeId::from_bytes(bytes))
}

fn load_reply(node_alias: Alias, node_id: NodeId, incoming: &Header, out: &mut Outgoing) {
    out.msg
        .load_reply(node_alias, node_id, incoming, Mti::TRACTION_REPLY);
}

/// Handles a throttle→train command addressed to this node.
pub fn handle_traction_protocol<A: AppCallbacks>(
    node: &mut Node,
    msg: MsgView<'_>,
    out: &mut Outgoing,
    callbacks: &mut A,
) {
    let (node_id, node_alias) = (node.id, node.alias);
    let Some(train) = node.train.as_mut() else {
        return;
    };
    let Some(&command) = msg.payload.first() else {
        return;
    };

    if msg.header.source_alias == train.controller_alias {
        train.feed_heartbeat();
    }

    match command {
        cmd::SET_SPEED_DIRECTION => {
            if let Some(bytes) = msg.payload.get(1..3) {
                train.set_speed = u16::from_be_bytes(unwrap!(bytes.try_into()));
                train.commanded_speed = train.set_speed;
                train.estop_active = false;
            }
        }
        cmd::SET_FUNCTION => {
            if let Some(bytes) = msg.payload.get(1..6) {
                let address =
                    u32::from(bytes[0]) << 16 | u32::from(bytes[1]) << 8 | u32::from(bytes[2]);
                let value = u16::from(bytes[3]) << 8 | u16::from(bytes[4]);
                if let Some(slot) = train.functions.get_mut(address as usize) {
                    *slot = value;
                }
            }
        }
        cmd::EMERGENCY_STOP => {
            train.estop_active = true;
            train.set_speed = float16::POSITIVE_ZERO;
            callbacks.on_emergency(node_id, Emergency::Stop, true);
        }
        cmd::QUERY_SPEEDS => {
            load_reply(node_alias, node_id, msg.header, out);
            unwrap!(out.msg.push(cmd::QUERY_SPEEDS));
            unwrap!(out.msg.push_u16(train.set_speed));
            unwrap!(out.msg.push(0));
            unwrap!(out.msg.push_u16(train.commanded_speed));
            unwrap!(out.msg.push_u16(train.actual_speed));
            out.valid = true;
        }
        cmd::QUERY_FUNCTION => {
            if let Some(bytes) = msg.payload.get(1..4) {
                let address =
                    u32::from(bytes[0]) << 16 | u32::from(bytes[1]) << 8 | u32::from(bytes[2]);
                let value = train
                    .functions
                    .get(address as usize)
                    .copied()
                    .unwrap_or(0);
                load_reply(node_alias, node_id, msg.header, out);
                unwrap!(out.msg.push(cmd::QUERY_FUNCTION));
                unwrap!(out.msg.extend(bytes));
                unwrap!(out.msg.push_u16(value));
                out.valid = true;
            }
        }
        cmd::CONTROLLER_CONFIG => match msg.payload.get(1) {
            Some(&cmd::CONTROLLER_ASSIGN) => {
                if let Some(id) = payload_node_id(msg.payload, 3) {
                    train.controller = id;
                    train.controller_alias = msg.header.source_alias;
                    train.feed_heartbeat();
                    load_reply(node_alias, node_id, msg.header, out);
                    unwrap!(out.msg.push(cmd::CONTROLLER_CONFIG));
                    unwrap!(out.msg.push(cmd::CONTROLLER_ASSIGN));
                    unwrap!(out.msg.push(0));
                    out.valid = true;
                }
            }
            Some(&cmd::CONTROLLER_RELEASE) => {
                if payload_node_id(msg.payload, 3) == Some(train.controller) {
                    train.controller = NodeId::NULL;
                    train.controller_alias = Alias::NULL;
                    train.heartbeat_counter_100ms = 0;
                }
            }
            Some(&cmd::CONTROLLER_QUERY) => {
                load_reply(node_alias, node_id, msg.header, out);
                unwrap!(out.msg.push(cmd::CONTROLLER_CONFIG));
                unwrap!(out.msg.push(cmd::CONTROLLER_QUERY));
                unwrap!(out.msg.push(0));
                unwrap!(out.msg.push_node_id(train.controller));
                out.valid = true;
            }
            _ => {}
        },
        cmd::MANAGEMENT => match msg.payload.get(1) {
            Some(&cmd::MGMT_RESERVE) => {
                load_reply(node_alias, node_id, msg.header, out);
                unwrap!(out.msg.push(cmd::MANAGEMENT));
                unwrap!(out.msg.push(cmd::MGMT_RESERVE));
                unwrap!(out.msg.push(0));
                out.valid = true;
            }
            // Release and noop have no reply; noop already fed the
            // heartbeat above.
            _ => {}
        },
        _ => {}
    }
}

/// Consumes the well-known emergency events for a train node.
pub fn handle_well_known_event<A: AppCallbacks>(
    node_id: NodeId,
    train: &mut TrainState,
    event: EventId,
    callbacks: &mut A,
) {
    match event {
        EventId::EMERGENCY_OFF => {
            train.global_eoff_active = true;
            train.set_speed = float16::POSITIVE_ZERO;
            callbacks.on_emergency(node_id, Emergency::GlobalOff, true);
        }
        EventId::CLEAR_EMERGENCY_OFF => {
            train.global_eoff_active = false;
            callbacks.on_emergency(node_id, Emergency::GlobalOff, false);
        }
        EventId::EMERGENCY_STOP => {
            train.global_estop_active = true;
            train.set_speed = float16::POSITIVE_ZERO;
            callbacks.on_emergency(node_id, Emergency::GlobalStop, true);
        }
        EventId::CLEAR_EMERGENCY_STOP => {
            train.global_estop_active = false;
            callbacks.on_emergency(node_id, Emergency::GlobalStop, false);
        }
        _ => {}
    }
}

/// 100 ms heartbeat supervision: ping the controller at the half-way point,
/// stop the train when the countdown expires.
pub fn tick_100ms<P: Platform, A: AppCallbacks>(
    node_id: NodeId,
    node_alias: Alias,
    train: &mut TrainState,
    platform: &mut P,
    callbacks: &mut A,
) {
    if train.heartbeat_timeout_s == 0 || train.controller.is_null() {
        return;
    }
    if train.heartbeat_counter_100ms == 0 {
        return;
    }
    train.heartbeat_counter_100ms -= 1;

    let half = train.heartbeat_timeout_s * 10 / 2;
    if train.heartbeat_counter_100ms == half && !train.ping_sent {
        let header = Header {
            mti: Mti::TRACTION_PROTOCOL,
            source_alias: node_alias,
            source_id: node_id,
            dest_alias: train.controller_alias,
            dest_id: train.controller,
        };
        if crate::can::tx::send_single(&header, &[cmd::MANAGEMENT, cmd::MGMT_NOOP], platform) {
            train.ping_sent = true;
        }
    }

    if train.heartbeat_counter_100ms == 0 {
        train.estop_active = true;
        train.set_speed = float16::POSITIVE_ZERO;
        callbacks.on_heartbeat_timeout(node_id);
    }
}
