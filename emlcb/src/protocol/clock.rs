//! Broadcast Time protocol [6]
//!
//! A clock is identified by the upper six bytes of its event ids; the lower
//! two encode the payload: time, date, year, rate, their set-command
//! variants at +0x8000, and the control commands at 0xF000. A consumer
//! follows reports, a producer advances its own minute on the 100 ms tick
//! and answers queries with a full sync burst.

use emlcb_core::{Alias, EventId, EventRange, EventRangeCount, Mti, NodeId};

use crate::buffer::Header;
use crate::can::tx;
use crate::node::Node;
use crate::platform::{AppCallbacks, Platform};

/// Well-known clock identifiers (upper six bytes) [6; 2]
pub const DEFAULT_FAST_CLOCK: EventId = EventId::new(0x0101_0000_0100_0000);
pub const DEFAULT_REALTIME_CLOCK: EventId = EventId::new(0x0101_0000_0101_0000);
pub const ALTERNATE_CLOCK_1: EventId = EventId::new(0x0101_0000_0102_0000);
pub const ALTERNATE_CLOCK_2: EventId = EventId::new(0x0101_0000_0103_0000);

const MASK_CLOCK_ID: u64 = 0xFFFF_FFFF_FFFF_0000;
const MASK_COMMAND_DATA: u64 = 0x0000_0000_0000_FFFF;

const REPORT_DATE_BASE: u16 = 0x2100;
const REPORT_YEAR_BASE: u16 = 0x3000;
const REPORT_RATE_BASE: u16 = 0x4000;
const SET_OFFSET: u16 = 0x8000;

/// Control command data values [6; 4.1]
pub const QUERY: u16 = 0xF000;
pub const STOP: u16 = 0xF001;
pub const START: u16 = 0xF002;
pub const DATE_ROLLOVER: u16 = 0xF003;

/// Decoded clock event, set-commands distinguished from reports.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TimeEvent {
    ReportTime { hour: u8, minute: u8 },
    ReportDate { month: u8, day: u8 },
    ReportYear { year: u16 },
    ReportRate { rate: i16 },
    SetTime { hour: u8, minute: u8 },
    SetDate { month: u8, day: u8 },
    SetYear { year: u16 },
    SetRate { rate: i16 },
    Query,
    Stop,
    Start,
    DateRollover,
}

pub fn time_event(clock_id: EventId, hour: u8, minute: u8, set: bool) -> EventId {
    let data = u16::from(hour) << 8 | u16::from(minute);
    encode(clock_id, if set { data + SET_OFFSET } else { data })
}

pub fn date_event(clock_id: EventId, month: u8, day: u8, set: bool) -> EventId {
    let data = (0x20 + u16::from(month)) << 8 | u16::from(day);
    encode(clock_id, if set { data + SET_OFFSET } else { data })
}

pub fn year_event(clock_id: EventId, year: u16, set: bool) -> EventId {
    let data = REPORT_YEAR_BASE | (year & 0x0FFF);
    encode(clock_id, if set { data + SET_OFFSET } else { data })
}

pub fn rate_event(clock_id: EventId, rate: i16, set: bool) -> EventId {
    let data = REPORT_RATE_BASE | (rate as u16 & 0x0FFF);
    encode(clock_id, if set { data + SET_OFFSET } else { data })
}

pub fn command_event(clock_id: EventId, command: u16) -> EventId {
    encode(clock_id, command)
}

fn encode(clock_id: EventId, data: u16) -> EventId {
    EventId::new(clock_id.into_u64() & MASK_CLOCK_ID | u64::from(data))
}

/// Decodes an event against a clock id; `None` when the prefix differs or
/// the data is out of range.
pub fn decode(clock_id: EventId, event: EventId) -> Option<TimeEvent> {
    if event.into_u64() & MASK_CLOCK_ID != clock_id.into_u64() & MASK_CLOCK_ID {
        return None;
    }
    let data = (event.into_u64() & MASK_COMMAND_DATA) as u16;
    match data {
        QUERY => return Some(TimeEvent::Query),
        STOP => return Some(TimeEvent::Stop),
        START => return Some(TimeEvent::Start),
        DATE_ROLLOVER => return Some(TimeEvent::DateRollover),
        _ => {}
    }

    let set = data >= SET_OFFSET && data < QUERY;
    let data = if set { data - SET_OFFSET } else { data };
    match data {
        0x0000..=0x17FF => {
            let (hour, minute) = ((data >> 8) as u8, (data & 0xFF) as u8);
            if hour >= 24 || minute >= 60 {
                return None;
            }
            Some(if set {
                TimeEvent::SetTime { hour, minute }
            } else {
                TimeEvent::ReportTime { hour, minute }
            })
        }
        REPORT_DATE_BASE..=0x2CFF => {
            let (month, day) = (((data >> 8) - 0x20) as u8, (data & 0xFF) as u8);
            if !(1..=12).contains(&month) || !(1..=31).contains(&day) {
                return None;
            }
            Some(if set {
                TimeEvent::SetDate { month, day }
            } else {
                TimeEvent::ReportDate { month, day }
            })
        }
        REPORT_YEAR_BASE..=0x3FFF => {
            let year = data & 0x0FFF;
            Some(if set {
                TimeEvent::SetYear { year }
            } else {
                TimeEvent::ReportYear { year }
            })
        }
        REPORT_RATE_BASE..=0x4FFF => {
            // Sign-extend the 12-bit fixed point rate.
            let rate = ((data & 0x0FFF) << 4) as i16 >> 4;
            Some(if set {
                TimeEvent::SetRate { rate }
            } else {
                TimeEvent::ReportRate { rate }
            })
        }
        _ => None,
    }
}

/// Complete state of one broadcast-time clock.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ClockState {
    pub clock_id: EventId,
    pub hour: u8,
    pub minute: u8,
    pub time_valid: bool,
    pub month: u8,
    pub day: u8,
    pub date_valid: bool,
    pub year: u16,
    pub year_valid: bool,
    /// Signed 12-bit fixed point, two fractional bits: 0x0004 is 1.00×.
    pub rate: i16,
    pub rate_valid: bool,
    pub is_running: bool,
    /// Accumulated fast-clock milliseconds toward the next minute.
    fast_ms: u32,
}

impl ClockState {
    pub fn new(clock_id: EventId) -> Self {
        Self {
            clock_id: EventId::new(clock_id.into_u64() & MASK_CLOCK_ID),
            hour: 0,
            minute: 0,
            time_valid: false,
            month: 1,
            day: 1,
            date_valid: false,
            year: 0,
            year_valid: false,
            rate: 0x0004,
            rate_valid: false,
            is_running: false,
            fast_ms: 0,
        }
    }

    /// The minute after the current one, for query replies.
    pub fn next_minute(&self) -> (u8, u8) {
        if self.minute >= 59 {
            ((self.hour + 1) % 24, 0)
        } else {
            (self.hour, self.minute + 1)
        }
    }
}

/// A clock bound to a node, with its subscription roles.
pub struct ClockSlot {
    pub state: ClockState,
    pub is_consumer: bool,
    pub is_producer: bool,
}

/// Registers the two half-space ranges blanket-covering every event with
/// the clock prefix, in both directions [6; 6]
pub fn register_ranges(node: &mut Node, clock_id: EventId) {
    let count = unwrap!(EventRangeCount::new(32768));
    for base in [clock_id, clock_id | u64::from(SET_OFFSET)] {
        let range = EventRange::new(base, count);
        let _ = node.consumers.register_range(range);
        let _ = node.producers.register_range(range);
    }
}

fn send_event<P: Platform>(
    node_id: NodeId,
    node_alias: Alias,
    mti: Mti,
    event: EventId,
    platform: &mut P,
) -> bool {
    let header = Header {
        mti,
        source_alias: node_alias,
        source_id: node_id,
        dest_alias: Alias::NULL,
        dest_id: NodeId::NULL,
    };
    tx::send_single(&header, &event.to_bytes(), platform)
}

/// Emits the six-message synchronization burst: running state, rate, year,
/// date, the current minute as producer-identified, and the coming minute
/// as an event report. Aborts on the first transmit failure.
pub fn send_full_sync<P: Platform>(
    node_id: NodeId,
    node_alias: Alias,
    state: &ClockState,
    next_hour: u8,
    next_minute: u8,
    platform: &mut P,
) -> bool {
    let clock = state.clock_id;
    let running = command_event(clock, if state.is_running { START } else { STOP });
    let sequence = [
        (Mti::PC_EVENT_REPORT, running),
        (Mti::PC_EVENT_REPORT, rate_event(clock, state.rate, false)),
        (Mti::PC_EVENT_REPORT, year_event(clock, state.year, false)),
        (Mti::PC_EVENT_REPORT, date_event(clock, state.month, state.day, false)),
        (
            Mti::PRODUCER_IDENTIFIED_SET,
            time_event(clock, state.hour, state.minute, false),
        ),
        (
            Mti::PC_EVENT_REPORT,
            time_event(clock, next_hour, next_minute, false),
        ),
    ];
    for (mti, event) in sequence {
        if !send_event(node_id, node_alias, mti, event, platform) {
            return false;
        }
    }
    true
}

/// Applies a clock event to a node's clock slot.
pub fn handle_event<P: Platform, A: AppCallbacks>(
    node_id: NodeId,
    node_alias: Alias,
    slot: &mut ClockSlot,
    event: EventId,
    platform: &mut P,
    callbacks: &mut A,
) {
    let Some(decoded) = decode(slot.state.clock_id, event) else {
        return;
    };

    if slot.is_consumer {
        match decoded {
            TimeEvent::ReportTime { hour, minute } => {
                slot.state.hour = hour;
                slot.state.minute = minute;
                slot.state.time_valid = true;
                callbacks.on_clock_time(node_id, &slot.state);
            }
            TimeEvent::ReportDate { month, day } => {
                slot.state.month = month;
                slot.state.day = day;
                slot.state.date_valid = true;
                callbacks.on_clock_date(node_id, &slot.state);
            }
            TimeEvent::ReportYear { year } => {
                slot.state.year = year;
                slot.state.year_valid = true;
                callbacks.on_clock_year(node_id, &slot.state);
            }
            TimeEvent::ReportRate { rate } => {
                slot.state.rate = rate;
                slot.state.rate_valid = true;
                callbacks.on_clock_rate(node_id, &slot.state);
            }
            TimeEvent::Start => {
                slot.state.is_running = true;
                callbacks.on_clock_running(node_id, &slot.state, true);
            }
            TimeEvent::Stop => {
                slot.state.is_running = false;
                callbacks.on_clock_running(node_id, &slot.state, false);
            }
            _ => {}
        }
    }

    if slot.is_producer {
        let clock = slot.state.clock_id;
        match decoded {
            TimeEvent::SetTime { hour, minute } => {
                slot.state.hour = hour;
                slot.state.minute = minute;
                slot.state.time_valid = true;
                slot.state.fast_ms = 0;
                let _ = send_event(
                    node_id,
                    node_alias,
                    Mti::PC_EVENT_REPORT,
                    time_event(clock, hour, minute, false),
                    platform,
                );
                callbacks.on_clock_time(node_id, &slot.state);
            }
            TimeEvent::SetDate { month, day } => {
                slot.state.month = month;
                slot.state.day = day;
                slot.state.date_valid = true;
                let _ = send_event(
                    node_id,
                    node_alias,
                    Mti::PC_EVENT_REPORT,
                    date_event(clock, month, day, false),
                    platform,
                );
                callbacks.on_clock_date(node_id, &slot.state);
            }
            TimeEvent::SetYear { year } => {
                slot.state.year = year;
                slot.state.year_valid = true;
                let _ = send_event(
                    node_id,
                    node_alias,
                    Mti::PC_EVENT_REPORT,
                    year_event(clock, year, false),
                    platform,
                );
                callbacks.on_clock_year(node_id, &slot.state);
            }
            TimeEvent::SetRate { rate } => {
                slot.state.rate = rate;
                slot.state.rate_valid = true;
                let _ = send_event(
                    node_id,
                    node_alias,
                    Mti::PC_EVENT_REPORT,
                    rate_event(clock, rate, false),
                    platform,
                );
                callbacks.on_clock_rate(node_id, &slot.state);
            }
            TimeEvent::Start => {
                slot.state.is_running = true;
            }
            TimeEvent::Stop => {
                slot.state.is_running = false;
            }
            TimeEvent::Query => {
                let (hour, minute) = slot.state.next_minute();
                let _ = send_full_sync(node_id, node_alias, &slot.state, hour, minute, platform);
            }
            _ => {}
        }
    }
}

const fn is_leap_year(year: u16) -> bool {
    year % 4 == 0 && (year % 100 != 0 || year % 400 == 0)
}

const fn days_in_month(month: u8, year: u16) -> u8 {
    match month {
        2 => {
            if is_leap_year(year) {
                29
            } else {
                28
            }
        }
        4 | 6 | 9 | 11 => 30,
        _ => 31,
    }
}

/// Advances a producer clock by one 100 ms tick. Each tick adds
/// `25 × |rate|` fast milliseconds; crossing a minute emits a time report,
/// and crossing midnight a rollover with the new date and year.
pub fn tick_100ms<P: Platform, A: AppCallbacks>(
    node_id: NodeId,
    node_alias: Alias,
    slot: &mut ClockSlot,
    platform: &mut P,
    callbacks: &mut A,
) {
    if !slot.is_producer || !slot.state.is_running || slot.state.rate == 0 {
        return;
    }
    let state = &mut slot.state;
    state.fast_ms += 25 * state.rate.unsigned_abs() as u32;

    while state.fast_ms >= 60_000 {
        state.fast_ms -= 60_000;
        if state.rate > 0 {
            advance_minute_forward(state);
        } else {
            advance_minute_backward(state);
        }
        let clock = state.clock_id;
        let _ = send_event(
            node_id,
            node_alias,
            Mti::PC_EVENT_REPORT,
            time_event(clock, state.hour, state.minute, false),
            platform,
        );
        callbacks.on_clock_time(node_id, state);

        if state.hour == 0 && state.minute == 0 && state.rate > 0 {
            let _ = send_event(
                node_id,
                node_alias,
                Mti::PC_EVENT_REPORT,
                command_event(clock, DATE_ROLLOVER),
                platform,
            );
            let _ = send_event(
                node_id,
                node_alias,
                Mti::PC_EVENT_REPORT,
                date_event(clock, state.month, state.day, false),
                platform,
            );
            let _ = send_event(
                node_id,
                node_alias,
                Mti::PC_EVENT_REPORT,
                year_event(clock, state.year, false),
                platform,
            );
            callbacks.on_clock_date(node_id, state);
        }
    }
}

fn advance_minute_forward(state: &mut ClockState) {
    state.minute += 1;
    if state.minute < 60 {
        return;
    }
    state.minute = 0;
    state.hour += 1;
    if state.hour < 24 {
        return;
    }
    state.hour = 0;
    state.day += 1;
    if state.day <= days_in_month(state.month, state.year) {
        return;
    }
    state.day = 1;
    state.month += 1;
    if state.month > 12 {
        state.month = 1;
        state.year += 1;
    }
}

fn advance_minute_backward(state: &mut ClockState) {
    if state.minute > 0 {
        state.minute -= 1;
        return;
    }
    state.minute = 59;
    if state.hour > 0 {
        state.hour -= 1;
        return;
    }
    state.hour = 23;
    if state.day > 1 {
        state.day -= 1;
        return;
    }
    if state.month > 1 {
        state.month -= 1;
    } else {
        state.month = 12;
        state.year = state.year.saturating_sub(1);
    }
    state.day = days_in_month(state.month, state.year);
}
