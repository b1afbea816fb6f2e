//! The stack engine
//!
//! [`Stack`] owns every sub-context: buffer store, inbound FIFO, node
//! registry, reassembly adapter, the outgoing worker and the two capability
//! bundles. [`Stack::poll`] runs one cooperative pass of the main loop;
//! [`Stack::tick_100ms`] is driven by the platform's periodic timer. The
//! CAN receive interrupt pushes raw frames into the shared
//! [`FrameFifo`](emlcb_driver::fifo::FrameFifo) the stack was built around.
//!
//! One incoming message is dispatched per pass, to every initialized node
//! that should see it; a produced reply is fragmented onto the wire before
//! the next message is popped, so a single outgoing worker suffices.

use embassy_sync::blocking_mutex::raw::RawMutex;
use emlcb_core::{Alias, ErrorCode, EventId, EventStatus, Mti, NodeId};
use emlcb_driver::fifo::FrameFifo;

use crate::buffer::{Handle, HandleFifo, Header, MsgView, Store};
use crate::can::rx::RxAdapter;
use crate::can::{login, tx};
use crate::consts;
use crate::node::{DatagramStage, Node, NodeParameters, Registry, RunState};
use crate::platform::{AppCallbacks, Platform};
use crate::protocol::{
    clock, config_mem, datagram, events, message_network, snip, traction, Outgoing,
};

type StackStore = Store<{ consts::BASIC_BUFFER_DEPTH }, { consts::EXTENDED_BUFFER_DEPTH }>;
type StackFifo = HandleFifo<{ consts::MESSAGE_FIFO_DEPTH }>;
type StackRegistry = Registry<{ consts::NODE_DEPTH }>;
type StackRx = RxAdapter<{ consts::ASSEMBLY_DEPTH }>;

/// Progress through the per-node dispatch of one incoming message.
#[derive(Debug, Copy, Clone)]
struct Dispatch {
    handle: Handle,
    cursor: usize,
}

pub struct Stack<'a, M: RawMutex, P: Platform, A: AppCallbacks> {
    platform: P,
    callbacks: A,
    frames: &'a FrameFifo<M, { consts::FRAME_FIFO_DEPTH }>,
    store: StackStore,
    inbound: StackFifo,
    registry: StackRegistry,
    rx: StackRx,
    outgoing: Outgoing,
    tx_state: tx::TxState,
    current: Option<Dispatch>,
}

impl<'a, M: RawMutex, P: Platform, A: AppCallbacks> Stack<'a, M, P, A> {
    pub fn new(
        frames: &'a FrameFifo<M, { consts::FRAME_FIFO_DEPTH }>,
        platform: P,
        callbacks: A,
    ) -> Self {
        Self {
            platform,
            callbacks,
            frames,
            store: StackStore::new(),
            inbound: StackFifo::new(),
            registry: StackRegistry::new(),
            rx: StackRx::new(),
            outgoing: Outgoing::new(),
            tx_state: tx::TxState::new(),
            current: None,
        }
    }

    pub fn platform(&mut self) -> &mut P {
        &mut self.platform
    }

    pub fn callbacks(&mut self) -> &mut A {
        &mut self.callbacks
    }

    /// Creates a virtual node; it starts negotiating its alias on the
    /// following polls. Returns the node's slot index.
    pub fn allocate_node(&mut self, id: NodeId, parameters: &'static NodeParameters) -> Option<usize> {
        self.registry.allocate(id, parameters)
    }

    pub fn node(&self, index: usize) -> Option<&Node> {
        self.registry.get(index)
    }

    pub fn node_mut(&mut self, index: usize) -> Option<&mut Node> {
        self.registry.get_mut(index)
    }

    /// One pass of the cooperative main loop.
    pub fn poll(&mut self) {
        // Adapt everything the ISR queued since the last pass.
        while let Some(frame) = self.frames.pop() {
            login::observe_frame(&mut self.registry, &frame, &mut self.platform);
            self.rx
                .process_frame(&frame, &mut self.store, &mut self.inbound, &mut self.platform);
        }

        // A reply still draining blocks everything downstream of the wire.
        if !self.flush_outgoing() {
            return;
        }

        for index in 0..self.registry.len() {
            let node = unwrap!(self.registry.get_mut(index));
            if node.run_state != RunState::Run {
                login::process(node, &mut self.platform, &mut self.callbacks);
            } else {
                login::process_pending_events(node, &mut self.platform);
            }
        }

        self.finish_pending_datagram();
        self.dispatch_incoming();
        self.flush_outgoing();
    }

    /// Drives login waits, train heartbeats and clock minutes. Call every
    /// 100 ms.
    pub fn tick_100ms(&mut self) {
        let Self {
            registry,
            platform,
            callbacks,
            ..
        } = self;
        for node in registry.iter_mut() {
            node.timer_ticks = node.timer_ticks.saturating_add(1);
            if !node.flags.initialized {
                continue;
            }
            let (id, alias) = (node.id, node.alias);
            if let Some(train) = node.train.as_mut() {
                traction::tick_100ms(id, alias, train, platform, callbacks);
            }
            if let Some(slot) = node.clock.as_mut() {
                clock::tick_100ms(id, alias, slot, platform, callbacks);
            }
        }
    }

    fn flush_outgoing(&mut self) -> bool {
        if !self.outgoing.valid {
            return true;
        }
        if tx::send_message(&self.outgoing.msg, &mut self.tx_state, &mut self.platform) {
            self.outgoing.valid = false;
            self.tx_state.reset();
            return true;
        }
        false
    }

    /// Step two of an acknowledged datagram, once the wire is free.
    fn finish_pending_datagram(&mut self) {
        if self.outgoing.valid {
            return;
        }
        let Self {
            store,
            registry,
            outgoing,
            platform,
            ..
        } = self;
        for node in registry.iter_mut() {
            if let DatagramStage::AckSent(handle) = node.datagram_stage {
                let released = datagram::finish_datagram(node, store.view(handle), outgoing, platform);
                if let Some(released) = released {
                    store.free(released);
                }
                return;
            }
        }
    }

    fn dispatch_incoming(&mut self) {
        let Self {
            store,
            inbound,
            registry,
            outgoing,
            platform,
            callbacks,
            current,
            ..
        } = self;

        if current.is_none() {
            let Some(handle) = inbound.pop() else {
                return;
            };
            *current = Some(Dispatch { handle, cursor: 0 });
        }

        loop {
            if outgoing.valid {
                return;
            }
            let Some(mut dispatch) = *current else {
                return;
            };
            if dispatch.cursor >= registry.len() {
                store.free(dispatch.handle);
                *current = None;
                return;
            }

            let view = store.view(dispatch.handle);
            let node = unwrap!(registry.get_mut(dispatch.cursor));
            if does_node_process(node, view.header) {
                outgoing.enumerate = false;
                if dispatch_message(node, view, dispatch.handle, outgoing, platform, callbacks) {
                    // The buffer now belongs to the node; the walk must not
                    // touch it again.
                    *current = None;
                    return;
                }
                if !outgoing.enumerate {
                    dispatch.cursor += 1;
                }
            } else {
                dispatch.cursor += 1;
            }
            *current = Some(dispatch);
        }
    }
}

fn does_node_process(node: &Node, header: &Header) -> bool {
    if !node.flags.initialized {
        return false;
    }
    if !header.mti.is_addressed() {
        return true;
    }
    header.dest_alias == node.alias || (!header.dest_id.is_null() && header.dest_id == node.id)
}

fn load_interaction_rejected(node: &Node, msg: &MsgView<'_>, out: &mut Outgoing) {
    out.msg.load_reply(
        node.alias,
        node.id,
        msg.header,
        Mti::OPTIONAL_INTERACTION_REJECTED,
    );
    unwrap!(out.msg.extend(&ErrorCode::PERMANENT_UNKNOWN_MTI.to_bytes()));
    unwrap!(out.msg.push_u16(msg.header.mti.into_u16()));
    out.valid = true;
}

/// Routes one message to its handler. Returns `true` when the buffer was
/// retained by the node for later processing.
fn dispatch_message<P: Platform, A: AppCallbacks>(
    node: &mut Node,
    msg: MsgView<'_>,
    handle: Handle,
    out: &mut Outgoing,
    platform: &mut P,
    callbacks: &mut A,
) -> bool {
    match msg.header.mti {
        Mti::VERIFY_NODE_ID_GLOBAL => message_network::handle_verify_node_id_global(node, msg, out),
        Mti::VERIFY_NODE_ID_ADDRESSED => {
            message_network::handle_verify_node_id_addressed(node, msg, out)
        }
        Mti::VERIFIED_NODE_ID | Mti::VERIFIED_NODE_ID_SIMPLE => {
            message_network::handle_verified_node_id(node, msg, out)
        }
        Mti::PROTOCOL_SUPPORT_INQUIRY => {
            message_network::handle_protocol_support_inquiry(node, msg, out)
        }
        Mti::SIMPLE_NODE_INFO_REQUEST => {
            snip::handle_simple_node_info_request(node, msg, out, platform)
        }
        Mti::CONSUMER_IDENTIFY => events::handle_consumer_identify(node, msg, out),
        Mti::CONSUMER_IDENTIFY_RANGE => events::handle_consumer_identify_range(node, msg, out),
        Mti::PRODUCER_IDENTIFY => events::handle_producer_identify(node, msg, out),
        Mti::PRODUCER_IDENTIFY_RANGE => events::handle_producer_identify_range(node, msg, out),
        Mti::EVENTS_IDENTIFY | Mti::EVENTS_IDENTIFY_DEST => {
            events::handle_events_identify(node, msg, out)
        }
        Mti::PC_EVENT_REPORT | Mti::PC_EVENT_REPORT_WITH_PAYLOAD => {
            events::handle_pc_event_report(node, msg, platform, callbacks)
        }
        Mti::PRODUCER_IDENTIFIED_SET => {
            events::handle_producer_identified_set(node, msg, platform, callbacks)
        }
        Mti::EVENT_LEARN => events::handle_event_learn(node, msg, callbacks),
        Mti::TRACTION_PROTOCOL => {
            if node.train.is_some() {
                traction::handle_traction_protocol(node, msg, out, callbacks)
            } else {
                load_interaction_rejected(node, &msg, out)
            }
        }
        Mti::DATAGRAM => return datagram::handle_datagram(node, msg, handle, out, platform),
        // Informational traffic needs no action.
        Mti::INITIALIZATION_COMPLETE
        | Mti::INITIALIZATION_COMPLETE_SIMPLE
        | Mti::PROTOCOL_SUPPORT_REPLY
        | Mti::OPTIONAL_INTERACTION_REJECTED
        | Mti::TERMINATE_DUE_TO_ERROR
        | Mti::CONSUMER_IDENTIFIED_UNKNOWN
        | Mti::CONSUMER_IDENTIFIED_SET
        | Mti::CONSUMER_IDENTIFIED_CLEAR
        | Mti::CONSUMER_IDENTIFIED_RESERVED
        | Mti::PRODUCER_IDENTIFIED_UNKNOWN
        | Mti::PRODUCER_IDENTIFIED_CLEAR
        | Mti::PRODUCER_IDENTIFIED_RESERVED
        | Mti::SIMPLE_NODE_INFO_REPLY
        | Mti::TRACTION_REPLY
        | Mti::DATAGRAM_OK_REPLY
        | Mti::DATAGRAM_REJECTED_REPLY => {}
        mti if mti.is_addressed() => load_interaction_rejected(node, &msg, out),
        _ => {}
    }
    false
}

// Application façade: node setup, event registration and send helpers. All
// send helpers build into the outgoing worker and return `false` untouched
// when a previous reply is still draining; retry on a later pass.
impl<'a, M: RawMutex, P: Platform, A: AppCallbacks> Stack<'a, M, P, A> {
    /// Registers a consumed event with its initial status.
    pub fn register_consumer(&mut self, index: usize, event: EventId, status: EventStatus) -> bool {
        match self.registry.get_mut(index) {
            Some(node) => node.consumers.register(event, status).is_ok(),
            None => false,
        }
    }

    pub fn register_producer(&mut self, index: usize, event: EventId, status: EventStatus) -> bool {
        match self.registry.get_mut(index) {
            Some(node) => node.producers.register(event, status).is_ok(),
            None => false,
        }
    }

    pub fn register_consumer_range(&mut self, index: usize, range: emlcb_core::EventRange) -> bool {
        match self.registry.get_mut(index) {
            Some(node) => node.consumers.register_range(range).is_ok(),
            None => false,
        }
    }

    pub fn register_producer_range(&mut self, index: usize, range: emlcb_core::EventRange) -> bool {
        match self.registry.get_mut(index) {
            Some(node) => node.producers.register_range(range).is_ok(),
            None => false,
        }
    }

    pub fn clear_events(&mut self, index: usize) {
        if let Some(node) = self.registry.get_mut(index) {
            node.consumers.clear();
            node.producers.clear();
        }
    }

    /// Turns a node into a train: registers the well-known events and
    /// attaches train state. Call before the node logs in.
    pub fn setup_train(
        &mut self,
        index: usize,
        dcc_address: u16,
        is_long_address: bool,
        speed_steps: traction::SpeedSteps,
        heartbeat_timeout_s: u32,
    ) -> bool {
        let Some(node) = self.registry.get_mut(index) else {
            return false;
        };
        if node.train.is_some() {
            return true;
        }
        traction::register_events(node);
        node.train = Some(traction::TrainState::new(
            dcc_address,
            is_long_address,
            speed_steps,
            heartbeat_timeout_s,
        ));
        true
    }

    /// Subscribes a node to a broadcast-time clock as a consumer.
    pub fn setup_clock_consumer(&mut self, index: usize, clock_id: EventId) -> bool {
        self.setup_clock(index, clock_id, false)
    }

    /// Makes a node the generator for a broadcast-time clock.
    pub fn setup_clock_producer(&mut self, index: usize, clock_id: EventId) -> bool {
        self.setup_clock(index, clock_id, true)
    }

    fn setup_clock(&mut self, index: usize, clock_id: EventId, producer: bool) -> bool {
        let Some(node) = self.registry.get_mut(index) else {
            return false;
        };
        clock::register_ranges(node, clock_id);
        match node.clock.as_mut() {
            Some(slot) => {
                if producer {
                    slot.is_producer = true;
                } else {
                    slot.is_consumer = true;
                }
            }
            None => {
                node.clock = Some(clock::ClockSlot {
                    state: clock::ClockState::new(clock_id),
                    is_consumer: !producer,
                    is_producer: producer,
                });
            }
        }
        true
    }

    pub fn clock_state(&self, index: usize) -> Option<&clock::ClockState> {
        Some(&self.registry.get(index)?.clock.as_ref()?.state)
    }

    pub fn clock_state_mut(&mut self, index: usize) -> Option<&mut clock::ClockState> {
        Some(&mut self.registry.get_mut(index)?.clock.as_mut()?.state)
    }

    fn load_global(&mut self, index: usize, mti: Mti) -> Option<()> {
        if self.outgoing.valid {
            return None;
        }
        let node = self.registry.get(index)?;
        if !node.flags.initialized {
            return None;
        }
        self.outgoing
            .msg
            .load(node.alias, node.id, Alias::NULL, NodeId::NULL, mti);
        Some(())
    }

    fn commit_send(&mut self) -> bool {
        self.outgoing.valid = true;
        self.flush_outgoing();
        true
    }

    /// Fires a producer/consumer event report.
    pub fn send_event_pc_report(&mut self, index: usize, event: EventId) -> bool {
        if self.load_global(index, Mti::PC_EVENT_REPORT).is_none() {
            return false;
        }
        unwrap!(self.outgoing.msg.push_event_id(event));
        self.commit_send()
    }

    /// Teaches an event to listening nodes [3; 3.6]
    pub fn send_teach_event(&mut self, index: usize, event: EventId) -> bool {
        if self.load_global(index, Mti::EVENT_LEARN).is_none() {
            return false;
        }
        unwrap!(self.outgoing.msg.push_event_id(event));
        self.commit_send()
    }

    /// Re-announces the node with Initialization Complete.
    pub fn send_initialization_event(&mut self, index: usize) -> bool {
        let Some(node) = self.registry.get(index) else {
            return false;
        };
        let simple = node
            .parameters
            .protocol_support
            .contains(emlcb_core::ProtocolSupport::SIMPLE);
        let id = node.id;
        let mti = if simple {
            Mti::INITIALIZATION_COMPLETE_SIMPLE
        } else {
            Mti::INITIALIZATION_COMPLETE
        };
        if self.load_global(index, mti).is_none() {
            return false;
        }
        unwrap!(self.outgoing.msg.push_node_id(id));
        self.commit_send()
    }

    fn load_addressed(
        &mut self,
        index: usize,
        dest_alias: Alias,
        dest_id: NodeId,
        mti: Mti,
    ) -> Option<()> {
        if self.outgoing.valid {
            return None;
        }
        let node = self.registry.get(index)?;
        if !node.flags.permitted {
            return None;
        }
        self.outgoing
            .msg
            .load(node.alias, node.id, dest_alias, dest_id, mti);
        Some(())
    }

    /// Configuration-tool helper: requests a memory read from a remote
    /// node.
    pub fn send_config_mem_read_request(
        &mut self,
        index: usize,
        dest_alias: Alias,
        dest_id: NodeId,
        space: u8,
        address: u32,
        count: u8,
    ) -> bool {
        if self
            .load_addressed(index, dest_alias, dest_id, Mti::DATAGRAM)
            .is_none()
        {
            return false;
        }
        unwrap!(self.outgoing.msg.push(config_mem::cmd::CONFIG_PREFIX));
        unwrap!(self.outgoing.msg.push(config_mem::cmd::READ_SPACE_IN_BYTE_6));
        unwrap!(self.outgoing.msg.extend(&address.to_be_bytes()));
        unwrap!(self.outgoing.msg.push(space));
        unwrap!(self.outgoing.msg.push(count));
        self.commit_send()
    }

    /// Configuration-tool helper: writes memory on a remote node.
    pub fn send_config_mem_write_request(
        &mut self,
        index: usize,
        dest_alias: Alias,
        dest_id: NodeId,
        space: u8,
        address: u32,
        data: &[u8],
    ) -> bool {
        if data.is_empty() || data.len() > config_mem::MAX_TRANSFER {
            return false;
        }
        if self
            .load_addressed(index, dest_alias, dest_id, Mti::DATAGRAM)
            .is_none()
        {
            return false;
        }
        unwrap!(self.outgoing.msg.push(config_mem::cmd::CONFIG_PREFIX));
        unwrap!(self.outgoing.msg.push(config_mem::cmd::WRITE_SPACE_IN_BYTE_6));
        unwrap!(self.outgoing.msg.extend(&address.to_be_bytes()));
        unwrap!(self.outgoing.msg.push(space));
        unwrap!(self.outgoing.msg.extend(data));
        self.commit_send()
    }

    fn send_train_command(
        &mut self,
        index: usize,
        dest_alias: Alias,
        dest_id: NodeId,
        payload: &[u8],
    ) -> bool {
        if self
            .load_addressed(index, dest_alias, dest_id, Mti::TRACTION_PROTOCOL)
            .is_none()
        {
            return false;
        }
        unwrap!(self.outgoing.msg.extend(payload));
        self.commit_send()
    }

    /// Throttle helper: commands a train's speed and direction (float16).
    pub fn send_train_set_speed(
        &mut self,
        index: usize,
        dest_alias: Alias,
        dest_id: NodeId,
        speed: u16,
    ) -> bool {
        let mut payload = [traction::cmd::SET_SPEED_DIRECTION, 0, 0];
        payload[1..].copy_from_slice(&speed.to_be_bytes());
        self.send_train_command(index, dest_alias, dest_id, &payload)
    }

    pub fn send_train_set_function(
        &mut self,
        index: usize,
        dest_alias: Alias,
        dest_id: NodeId,
        fn_address: u32,
        fn_value: u16,
    ) -> bool {
        let payload = [
            traction::cmd::SET_FUNCTION,
            (fn_address >> 16) as u8,
            (fn_address >> 8) as u8,
            fn_address as u8,
            (fn_value >> 8) as u8,
            fn_value as u8,
        ];
        self.send_train_command(index, dest_alias, dest_id, &payload)
    }

    pub fn send_train_emergency_stop(
        &mut self,
        index: usize,
        dest_alias: Alias,
        dest_id: NodeId,
    ) -> bool {
        self.send_train_command(index, dest_alias, dest_id, &[traction::cmd::EMERGENCY_STOP])
    }

    pub fn send_train_query_speeds(
        &mut self,
        index: usize,
        dest_alias: Alias,
        dest_id: NodeId,
    ) -> bool {
        self.send_train_command(index, dest_alias, dest_id, &[traction::cmd::QUERY_SPEEDS])
    }

    pub fn send_train_query_function(
        &mut self,
        index: usize,
        dest_alias: Alias,
        dest_id: NodeId,
        fn_address: u32,
    ) -> bool {
        let payload = [
            traction::cmd::QUERY_FUNCTION,
            (fn_address >> 16) as u8,
            (fn_address >> 8) as u8,
            fn_address as u8,
        ];
        self.send_train_command(index, dest_alias, dest_id, &payload)
    }

    /// Throttle helper: claims a train; the payload carries our node id.
    pub fn send_train_assign_controller(
        &mut self,
        index: usize,
        dest_alias: Alias,
        dest_id: NodeId,
    ) -> bool {
        let Some(node) = self.registry.get(index) else {
            return false;
        };
        let id = node.id;
        let mut payload = [0u8; 9];
        payload[0] = traction::cmd::CONTROLLER_CONFIG;
        payload[1] = traction::cmd::CONTROLLER_ASSIGN;
        payload[3..].copy_from_slice(&id.to_bytes());
        self.send_train_command(index, dest_alias, dest_id, &payload)
    }

    pub fn send_train_release_controller(
        &mut self,
        index: usize,
        dest_alias: Alias,
        dest_id: NodeId,
    ) -> bool {
        let Some(node) = self.registry.get(index) else {
            return false;
        };
        let id = node.id;
        let mut payload = [0u8; 9];
        payload[0] = traction::cmd::CONTROLLER_CONFIG;
        payload[1] = traction::cmd::CONTROLLER_RELEASE;
        payload[3..].copy_from_slice(&id.to_bytes());
        self.send_train_command(index, dest_alias, dest_id, &payload)
    }

    /// Throttle helper: heartbeat ping toward a train.
    pub fn send_train_noop(&mut self, index: usize, dest_alias: Alias, dest_id: NodeId) -> bool {
        self.send_train_command(
            index,
            dest_alias,
            dest_id,
            &[traction::cmd::MANAGEMENT, traction::cmd::MGMT_NOOP],
        )
    }

    /// Emits the broadcast-time synchronization burst for a producer
    /// clock [6; 5.2]
    pub fn send_clock_full_sync(&mut self, index: usize, next_hour: u8, next_minute: u8) -> bool {
        let Self {
            registry, platform, ..
        } = self;
        let Some(node) = registry.get(index) else {
            return false;
        };
        let Some(slot) = node.clock.as_ref() else {
            return false;
        };
        if !node.flags.initialized || !slot.is_producer {
            return false;
        }
        clock::send_full_sync(node.id, node.alias, &slot.state, next_hour, next_minute, platform)
    }

    /// Consumer helper: asks the clock generator for a full sync.
    pub fn send_clock_query(&mut self, index: usize) -> bool {
        let Some(clock_id) = self.clock_state(index).map(|state| state.clock_id) else {
            return false;
        };
        self.send_event_pc_report(index, clock::command_event(clock_id, clock::QUERY))
    }

    pub fn send_clock_set_time(&mut self, index: usize, hour: u8, minute: u8) -> bool {
        let Some(clock_id) = self.clock_state(index).map(|state| state.clock_id) else {
            return false;
        };
        self.send_event_pc_report(index, clock::time_event(clock_id, hour, minute, true))
    }

    pub fn send_clock_set_rate(&mut self, index: usize, rate: i16) -> bool {
        let Some(clock_id) = self.clock_state(index).map(|state| state.clock_id) else {
            return false;
        };
        self.send_event_pc_report(index, clock::rate_event(clock_id, rate, true))
    }
}
