//! Memory Configuration protocol handler [4]
//!
//! Decodes the `0x20`-prefixed datagram command families: read and write in
//! the short (space-encoded-in-command) and long (space-in-byte-6) forms,
//! write-under-mask, and the management commands (options, address-space
//! info, reservation lock, unique-id allocation, freeze/unfreeze, update
//! complete, reboot, factory reset).
//!
//! Runs in two steps per datagram: [`validate`] backs the acknowledgement
//! decision on the pass that received the request, [`execute`] builds the
//! data reply (or performs the side effect) on a later pass.

use emlcb_core::{ErrorCode, Mti, NodeId};

use super::Outgoing;
use crate::buffer::MsgView;
use crate::node::params::{acdi, space, AddressSpace};
use crate::node::Node;
use crate::platform::Platform;

/// Command bytes of the `0x20` configuration family [4; 4.3]
pub mod cmd {
    pub const CONFIG_PREFIX: u8 = 0x20;

    pub const READ_SPACE_IN_BYTE_6: u8 = 0x40;
    pub const READ_SPACE_FD: u8 = 0x41;
    pub const READ_SPACE_FE: u8 = 0x42;
    pub const READ_SPACE_FF: u8 = 0x43;

    pub const WRITE_SPACE_IN_BYTE_6: u8 = 0x00;
    pub const WRITE_SPACE_FD: u8 = 0x01;
    pub const WRITE_SPACE_FE: u8 = 0x02;
    pub const WRITE_SPACE_FF: u8 = 0x03;

    pub const WRITE_UNDER_MASK_SPACE_IN_BYTE_6: u8 = 0x08;
    pub const WRITE_UNDER_MASK_SPACE_FF: u8 = 0x0B;

    pub const REPLY_OK_OFFSET: u8 = 0x10;
    pub const REPLY_FAIL_OFFSET: u8 = 0x18;

    pub const OPTIONS_QUERY: u8 = 0x80;
    pub const OPTIONS_REPLY: u8 = 0x82;
    pub const SPACE_INFO_QUERY: u8 = 0x84;
    pub const SPACE_INFO_REPLY_NOT_PRESENT: u8 = 0x86;
    pub const SPACE_INFO_REPLY_PRESENT: u8 = 0x87;
    pub const LOCK_RESERVE: u8 = 0x88;
    pub const LOCK_RESERVE_REPLY: u8 = 0x8A;
    pub const GET_UNIQUE_ID: u8 = 0x8C;
    pub const GET_UNIQUE_ID_REPLY: u8 = 0x8D;
    pub const UNFREEZE: u8 = 0xA0;
    pub const FREEZE: u8 = 0xA1;
    pub const UPDATE_COMPLETE: u8 = 0xA8;
    pub const RESET_REBOOT: u8 = 0xA9;
    pub const FACTORY_RESET: u8 = 0xAA;
}

/// Largest data movement per datagram.
pub const MAX_TRANSFER: usize = 64;

/// A decoded read/write/write-under-mask transfer.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Transfer {
    pub command: u8,
    pub space: u8,
    pub address: u32,
    /// Requested byte count (reads) or carried data length (writes).
    pub count: u8,
    /// Offset of write data within the datagram payload.
    pub data_start: usize,
}

impl Transfer {
    fn long_form(&self) -> bool {
        self.command & 0x03 == 0
    }
}

/// A decoded Memory Configuration operation.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Op {
    Read(Transfer),
    Write(Transfer),
    WriteUnderMask(Transfer),
    OptionsQuery,
    SpaceInfoQuery { space: u8 },
    LockReserve { id: NodeId },
    GetUniqueId { count: u8 },
    Freeze { space: u8 },
    Unfreeze { space: u8 },
    UpdateComplete,
    Reboot,
    FactoryReset { id: NodeId },
}

impl Op {
    /// True when step two produces a reply datagram, making the
    /// acknowledgement carry the reply-pending flag.
    pub fn expects_reply(&self) -> bool {
        !matches!(
            self,
            Op::Freeze { .. }
                | Op::Unfreeze { .. }
                | Op::UpdateComplete
                | Op::Reboot
                | Op::FactoryReset { .. }
        )
    }
}

fn short_form_space(command: u8) -> u8 {
    match command & 0x03 {
        0x01 => space::CONFIG_MEMORY,
        0x02 => space::ALL,
        _ => space::CONFIGURATION_DEFINITION,
    }
}

fn be32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes(unwrap!(bytes[..4].try_into()))
}

fn payload_node_id(payload: &[u8], start: usize) -> Option<NodeId> {
    let bytes: [u8; 6] = payload.get(start..start + 6)?.try_into().ok()?;
    Some(NodeId::from_bytes(bytes))
}

/// Decodes a Memory Configuration datagram.
pub fn parse(payload: &[u8]) -> Result<Op, ErrorCode> {
    if payload.len() < 2 || payload[0] != cmd::CONFIG_PREFIX {
        return Err(ErrorCode::PERMANENT_NOT_IMPLEMENTED);
    }
    let command = payload[1];
    match command {
        cmd::READ_SPACE_IN_BYTE_6..=cmd::READ_SPACE_FF => {
            let long = command == cmd::READ_SPACE_IN_BYTE_6;
            let needed = if long { 8 } else { 7 };
            if payload.len() < needed {
                return Err(ErrorCode::PERMANENT_INVALID_ARGUMENTS);
            }
            Ok(Op::Read(Transfer {
                command,
                space: if long { payload[6] } else { short_form_space(command) },
                address: be32(&payload[2..]),
                count: payload[needed - 1],
                data_start: needed,
            }))
        }
        cmd::WRITE_SPACE_IN_BYTE_6..=cmd::WRITE_SPACE_FF
        | cmd::WRITE_UNDER_MASK_SPACE_IN_BYTE_6..=cmd::WRITE_UNDER_MASK_SPACE_FF => {
            let long = command & 0x03 == 0;
            let data_start = if long { 7 } else { 6 };
            if payload.len() < data_start {
                return Err(ErrorCode::PERMANENT_INVALID_ARGUMENTS);
            }
            let transfer = Transfer {
                command,
                space: if long { payload[6] } else { short_form_space(command) },
                address: be32(&payload[2..]),
                count: (payload.len() - data_start) as u8,
                data_start,
            };
            if command & 0x08 != 0 {
                Ok(Op::WriteUnderMask(transfer))
            } else {
                Ok(Op::Write(transfer))
            }
        }
        cmd::OPTIONS_QUERY => Ok(Op::OptionsQuery),
        cmd::SPACE_INFO_QUERY => match payload.get(2) {
            Some(&space) => Ok(Op::SpaceInfoQuery { space }),
            None => Err(ErrorCode::PERMANENT_INVALID_ARGUMENTS),
        },
        cmd::LOCK_RESERVE => Ok(Op::LockReserve {
            id: payload_node_id(payload, 2).unwrap_or(NodeId::NULL),
        }),
        cmd::GET_UNIQUE_ID => Ok(Op::GetUniqueId {
            count: payload.get(2).copied().unwrap_or(1),
        }),
        cmd::UNFREEZE => match payload.get(2) {
            Some(&space) => Ok(Op::Unfreeze { space }),
            None => Err(ErrorCode::PERMANENT_INVALID_ARGUMENTS),
        },
        cmd::FREEZE => match payload.get(2) {
            Some(&space) => Ok(Op::Freeze { space }),
            None => Err(ErrorCode::PERMANENT_INVALID_ARGUMENTS),
        },
        cmd::UPDATE_COMPLETE => Ok(Op::UpdateComplete),
        cmd::RESET_REBOOT => Ok(Op::Reboot),
        cmd::FACTORY_RESET => match payload_node_id(payload, 2) {
            Some(id) => Ok(Op::FactoryReset { id }),
            None => Err(ErrorCode::PERMANENT_INVALID_ARGUMENTS),
        },
        _ => Err(ErrorCode::PERMANENT_UNKNOWN_SUBCOMMAND),
    }
}

fn present_space<'a>(node: &'a Node, space_id: u8) -> Result<&'a AddressSpace, ErrorCode> {
    match node.parameters.address_space(space_id) {
        Some(space) if space.present => Ok(space),
        _ => Err(ErrorCode::PERMANENT_ADDRESS_SPACE_UNKNOWN),
    }
}

/// Backs the step-one acknowledgement: anything that fails here is answered
/// with Datagram Rejected carrying the code.
pub fn validate(node: &Node, op: &Op) -> Result<(), ErrorCode> {
    match op {
        Op::Read(t) => {
            let space = present_space(node, t.space)?;
            if t.count == 0 || usize::from(t.count) > MAX_TRANSFER {
                return Err(ErrorCode::PERMANENT_INVALID_ARGUMENTS);
            }
            if t.address > space.highest_address {
                return Err(ErrorCode::PERMANENT_OUT_OF_BOUNDS);
            }
            Ok(())
        }
        Op::Write(t) | Op::WriteUnderMask(t) => {
            let space = present_space(node, t.space)?;
            if space.read_only {
                return Err(ErrorCode::PERMANENT_WRITE_TO_READ_ONLY);
            }
            if t.count == 0 || usize::from(t.count) > MAX_TRANSFER {
                return Err(ErrorCode::PERMANENT_INVALID_ARGUMENTS);
            }
            if t.address > space.highest_address {
                return Err(ErrorCode::PERMANENT_OUT_OF_BOUNDS);
            }
            if matches!(op, Op::WriteUnderMask(_)) {
                if !node.parameters.configuration_options.write_under_mask {
                    return Err(ErrorCode::PERMANENT_UNKNOWN_SUBCOMMAND);
                }
                if t.count % 2 != 0 {
                    return Err(ErrorCode::PERMANENT_INVALID_ARGUMENTS);
                }
            }
            Ok(())
        }
        Op::Freeze { space } | Op::Unfreeze { space } => {
            present_space(node, *space).map(|_| ())
        }
        Op::FactoryReset { id } => {
            if *id == node.id {
                Ok(())
            } else {
                Err(ErrorCode::PERMANENT_INVALID_ARGUMENTS)
            }
        }
        _ => Ok(()),
    }
}

/// Fills `buffer` from a fixed-length, null-padded field whose content is
/// `text`; reads past the text see the padding, per the ACDI layout.
fn field_read(buffer: &mut [u8], text: &str, field_len: usize) -> usize {
    let take = buffer.len().min(field_len);
    let bytes = text.as_bytes();
    let content_end = bytes.len().min(field_len - 1);
    for (position, slot) in buffer[..take].iter_mut().enumerate() {
        *slot = if position < content_end { bytes[position] } else { 0 };
    }
    take
}

fn read_space<P: Platform>(
    node: &Node,
    platform: &mut P,
    space_id: u8,
    address: u32,
    buffer: &mut [u8],
) -> Result<usize, ErrorCode> {
    if let Some(read) = platform.address_space_read(node.id, space_id, address, buffer) {
        return if read > 0 {
            Ok(read)
        } else {
            Err(ErrorCode::TEMPORARY_TRANSFER_ERROR)
        };
    }

    match space_id {
        space::CONFIGURATION_DEFINITION => Ok(blob_read(buffer, address, node.parameters.cdi)),
        space::TRAIN_FUNCTION_DEFINITION if !node.parameters.fdi.is_empty() => {
            Ok(blob_read(buffer, address, node.parameters.fdi))
        }
        space::CONFIG_MEMORY => {
            let read = platform.config_memory_read(node.id, address, buffer);
            if read > 0 {
                Ok(read)
            } else {
                Err(ErrorCode::TEMPORARY_TRANSFER_ERROR)
            }
        }
        space::ACDI_MANUFACTURER => {
            let snip = &node.parameters.snip;
            match address {
                acdi::MANUFACTURER_VERSION_ADDRESS => {
                    buffer[0] = snip.mfg_version;
                    Ok(1)
                }
                acdi::MANUFACTURER_ADDRESS => {
                    Ok(field_read(buffer, snip.name, acdi::MANUFACTURER_LEN))
                }
                acdi::MODEL_ADDRESS => Ok(field_read(buffer, snip.model, acdi::MODEL_LEN)),
                acdi::HARDWARE_VERSION_ADDRESS => Ok(field_read(
                    buffer,
                    snip.hardware_version,
                    acdi::HARDWARE_VERSION_LEN,
                )),
                acdi::SOFTWARE_VERSION_ADDRESS => Ok(field_read(
                    buffer,
                    snip.software_version,
                    acdi::SOFTWARE_VERSION_LEN,
                )),
                _ => Err(ErrorCode::PERMANENT_NOT_IMPLEMENTED),
            }
        }
        space::ACDI_USER => match address {
            acdi::USER_VERSION_ADDRESS => {
                buffer[0] = node.parameters.snip.user_version;
                Ok(1)
            }
            // Name and description map onto configuration memory one byte
            // below the ACDI address (the version byte is synthetic).
            acdi::USER_NAME_ADDRESS..=0x7F => {
                let offset = node.parameters.user_data_offset + address - 1;
                let read = platform.config_memory_read(node.id, offset, buffer);
                if read > 0 {
                    Ok(read)
                } else {
                    Err(ErrorCode::TEMPORARY_TRANSFER_ERROR)
                }
            }
            _ => Err(ErrorCode::PERMANENT_NOT_IMPLEMENTED),
        },
        _ => Err(ErrorCode::PERMANENT_NOT_IMPLEMENTED),
    }
}

fn blob_read(buffer: &mut [u8], address: u32, blob: &[u8]) -> usize {
    let start = (address as usize).min(blob.len());
    let take = buffer.len().min(blob.len() - start);
    buffer[..take].copy_from_slice(&blob[start..start + take]);
    // Reads past the end of the blob within the advertised space see zeros.
    if take < buffer.len() {
        buffer[take..].fill(0);
        return buffer.len();
    }
    take
}

fn write_space<P: Platform>(
    node: &Node,
    platform: &mut P,
    space_id: u8,
    address: u32,
    data: &[u8],
) -> Result<(), ErrorCode> {
    if let Some(written) = platform.address_space_write(node.id, space_id, address, data) {
        return if written == data.len() {
            Ok(())
        } else {
            Err(ErrorCode::TEMPORARY_TRANSFER_ERROR)
        };
    }

    let (target_space, offset) = match space_id {
        space::CONFIG_MEMORY => (space_id, address),
        space::ACDI_USER => match address {
            acdi::USER_VERSION_ADDRESS => return Err(ErrorCode::PERMANENT_WRITE_TO_READ_ONLY),
            acdi::USER_NAME_ADDRESS..=0x7F => {
                (space::CONFIG_MEMORY, node.parameters.user_data_offset + address - 1)
            }
            _ => return Err(ErrorCode::PERMANENT_NOT_IMPLEMENTED),
        },
        _ => return Err(ErrorCode::PERMANENT_NOT_IMPLEMENTED),
    };
    let _ = target_space;

    let written = platform.config_memory_write(node.id, offset, data);
    if written == data.len() {
        Ok(())
    } else {
        Err(ErrorCode::TEMPORARY_TRANSFER_ERROR)
    }
}

fn load_reply_prefix(node: &Node, incoming: &MsgView<'_>, out: &mut Outgoing) {
    out.msg
        .load_reply(node.alias, node.id, incoming.header, Mti::DATAGRAM);
    unwrap!(out.msg.push(cmd::CONFIG_PREFIX));
}

fn push_transfer_echo(out: &mut Outgoing, transfer: &Transfer, reply_command: u8) {
    unwrap!(out.msg.push(reply_command));
    unwrap!(out.msg.extend(&transfer.address.to_be_bytes()));
    if transfer.long_form() {
        unwrap!(out.msg.push(transfer.space));
    }
}

fn reply_ok_command(transfer: &Transfer) -> u8 {
    // Write-under-mask is answered with the plain write reply family.
    (transfer.command & 0x43) | cmd::REPLY_OK_OFFSET
}

/// Builds the step-two reply datagram (or performs the management side
/// effect) for a previously acknowledged request.
pub fn execute<P: Platform>(
    node: &mut Node,
    incoming: MsgView<'_>,
    out: &mut Outgoing,
    platform: &mut P,
) {
    let Ok(op) = parse(incoming.payload) else {
        return;
    };

    match op {
        Op::Read(transfer) => {
            let space = unwrap!(node.parameters.address_space(transfer.space));
            // Clamp to the end of the space so a tail read cannot overrun.
            let count = (u32::from(transfer.count))
                .min(space.highest_address - transfer.address + 1) as usize;
            let mut buffer = [0u8; MAX_TRANSFER];
            let result = read_space(node, platform, transfer.space, transfer.address, &mut buffer[..count]);
            load_reply_prefix(node, &incoming, out);
            match result {
                Ok(read) => {
                    push_transfer_echo(out, &transfer, reply_ok_command(&transfer));
                    unwrap!(out.msg.extend(&buffer[..read]));
                }
                Err(code) => {
                    push_transfer_echo(out, &transfer, transfer.command | cmd::REPLY_FAIL_OFFSET);
                    unwrap!(out.msg.extend(&code.to_bytes()));
                }
            }
            out.valid = true;
        }
        Op::Write(transfer) => {
            let data = &incoming.payload[transfer.data_start..];
            let result = write_space(node, platform, transfer.space, transfer.address, data);
            load_reply_prefix(node, &incoming, out);
            match result {
                Ok(()) => push_transfer_echo(out, &transfer, reply_ok_command(&transfer)),
                Err(code) => {
                    push_transfer_echo(out, &transfer, transfer.command | cmd::REPLY_FAIL_OFFSET);
                    unwrap!(out.msg.extend(&code.to_bytes()));
                }
            }
            out.valid = true;
        }
        Op::WriteUnderMask(transfer) => {
            let pairs = &incoming.payload[transfer.data_start..];
            let target_len = pairs.len() / 2;
            let mut current = [0u8; MAX_TRANSFER / 2];
            let result = read_space(
                node,
                platform,
                transfer.space,
                transfer.address,
                &mut current[..target_len],
            )
            .and_then(|_| {
                for (index, pair) in pairs.chunks_exact(2).enumerate() {
                    let (mask, value) = (pair[0], pair[1]);
                    current[index] = (current[index] & !mask) | (value & mask);
                }
                write_space(
                    node,
                    platform,
                    transfer.space,
                    transfer.address,
                    &current[..target_len],
                )
            });
            load_reply_prefix(node, &incoming, out);
            match result {
                Ok(()) => push_transfer_echo(out, &transfer, reply_ok_command(&transfer)),
                Err(code) => {
                    push_transfer_echo(out, &transfer, transfer.command | cmd::REPLY_FAIL_OFFSET);
                    unwrap!(out.msg.extend(&code.to_bytes()));
                }
            }
            out.valid = true;
        }
        Op::OptionsQuery => {
            let options = &node.parameters.configuration_options;
            load_reply_prefix(node, &incoming, out);
            unwrap!(out.msg.push(cmd::OPTIONS_REPLY));
            unwrap!(out.msg.push_u16(options.to_available_bits()));
            // Write lengths: 1, 2, 4, 64-byte and arbitrary writes, plus the
            // stream bit when advertised.
            let write_lengths = 0xF2 | u8::from(options.stream_read_write);
            unwrap!(out.msg.push(write_lengths));
            unwrap!(out.msg.push(options.high_address_space));
            unwrap!(out.msg.push(options.low_address_space));
            if !options.description.is_empty() {
                unwrap!(out.msg.extend(options.description.as_bytes()));
                unwrap!(out.msg.push(0));
            }
            out.valid = true;
        }
        Op::SpaceInfoQuery { space: space_id } => {
            load_reply_prefix(node, &incoming, out);
            match node.parameters.address_space(space_id) {
                Some(space) if space.present => {
                    unwrap!(out.msg.push(cmd::SPACE_INFO_REPLY_PRESENT));
                    unwrap!(out.msg.push(space_id));
                    unwrap!(out.msg.extend(&space.highest_address.to_be_bytes()));
                    let flags =
                        u8::from(space.read_only) | u8::from(space.low_address_valid) << 1;
                    unwrap!(out.msg.push(flags));
                    if space.low_address_valid {
                        unwrap!(out.msg.extend(&space.low_address.to_be_bytes()));
                    }
                    if !space.description.is_empty() {
                        unwrap!(out.msg.extend(space.description.as_bytes()));
                        unwrap!(out.msg.push(0));
                    }
                }
                _ => {
                    unwrap!(out.msg.push(cmd::SPACE_INFO_REPLY_NOT_PRESENT));
                    unwrap!(out.msg.push(space_id));
                }
            }
            out.valid = true;
        }
        Op::LockReserve { id } => {
            // First-come lock; the null id releases [4; 4.8]
            if node.lock_node.is_null() || id.is_null() {
                node.lock_node = id;
            }
            load_reply_prefix(node, &incoming, out);
            unwrap!(out.msg.push(cmd::LOCK_RESERVE_REPLY));
            unwrap!(out.msg.push_node_id(node.lock_node));
            out.valid = true;
        }
        Op::GetUniqueId { count } => {
            let count = count.clamp(1, 8);
            load_reply_prefix(node, &incoming, out);
            unwrap!(out.msg.push(cmd::GET_UNIQUE_ID_REPLY));
            for _ in 0..count {
                let suffix = 0xFF00u16.wrapping_add(node.unique_id_counter);
                node.unique_id_counter = node.unique_id_counter.wrapping_add(1);
                unwrap!(out
                    .msg
                    .push_event_id(emlcb_core::EventId::from_node_id(node.id, suffix)));
            }
            out.valid = true;
        }
        Op::Freeze { space: space_id } => {
            if space_id == space::FIRMWARE {
                node.flags.firmware_upgrade_active = true;
            }
        }
        Op::Unfreeze { space: space_id } => {
            if space_id == space::FIRMWARE {
                node.flags.firmware_upgrade_active = false;
            }
        }
        Op::UpdateComplete => {
            node.flags.firmware_upgrade_active = false;
        }
        Op::Reboot => platform.reboot(),
        Op::FactoryReset { .. } => platform.factory_reset(node.id),
    }
}
