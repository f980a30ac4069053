//! The OpenFlow 1.3 wire codec.
//!
//! Each typed message from `message` gets a `MessageType` impl describing its
//! byte size, its parse and its marshal; `Message` itself implements
//! `OfpMessage` so sessions can frame complete messages.

use std::io::{Cursor, Read};
use std::mem::size_of;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use bytes::Buf;
use log::debug;

use crate::bits::{bytes_of_mac, mac_of_bytes};
use crate::message::*;
use crate::ofp_header::{OfpHeader, OPENFLOW_0_04_VERSION};
use crate::ofp_message::{OfpMessage, OfpSerializationError};
use crate::ofp_utils::{read_fixed_size_string, write_fixed_size_string, write_padding_bytes};
use crate::openflow::MsgCode;

/// Common API for message types implementing OpenFlow Message Codes (see `MsgCode` enum).
pub trait MessageType {
    /// Return the byte-size of a message.
    fn size_of(msg: &Self) -> usize;
    /// Parse a buffer into a message.
    fn parse(buf: &[u8]) -> Result<Self, OfpSerializationError>
    where
        Self: Sized;
    /// Marshal a message into a `u8` buffer.
    fn marshal(msg: Self, bytes: &mut Vec<u8>) -> Result<(), OfpSerializationError>;
}

const OFPXMC_OPENFLOW_BASIC: u16 = 0x8000;

const OFPXMT_OFB_IN_PORT: u8 = 0;
const OFPXMT_OFB_METADATA: u8 = 2;
const OFPXMT_OFB_ETH_TYPE: u8 = 5;
const OFPXMT_OFB_VLAN_VID: u8 = 6;

fn unexpected_value<T>(
    value: String,
    field: &str,
    message: &str,
) -> Result<T, OfpSerializationError> {
    Err(OfpSerializationError::UnexpectedValueError {
        value,
        field: field.to_string(),
        message: message.to_string(),
    })
}

fn skip(bytes: &mut Cursor<Vec<u8>>, count: usize) -> Result<(), OfpSerializationError> {
    if bytes.remaining() < count {
        return unexpected_value(
            format!("{} bytes remaining", bytes.remaining()),
            "length",
            "message body",
        );
    }
    Buf::advance(bytes, count);
    Ok(())
}

fn read_tail(bytes: &mut Cursor<Vec<u8>>) -> Result<Vec<u8>, OfpSerializationError> {
    let mut tail = vec![];
    bytes.read_to_end(&mut tail)?;
    Ok(tail)
}

fn read_exact(
    bytes: &mut Cursor<Vec<u8>>,
    count: usize,
) -> Result<Vec<u8>, OfpSerializationError> {
    if bytes.remaining() < count {
        return unexpected_value(
            format!("{} bytes remaining", bytes.remaining()),
            "length",
            "message body",
        );
    }
    let mut buf = vec![0; count];
    Read::read_exact(bytes, &mut buf)?;
    Ok(buf)
}

struct Match0x04;

impl Match0x04 {
    fn oxm_length(m: &Match) -> usize {
        let mut length = 0;
        if m.in_port.is_some() {
            length += 4 + 4;
        }
        if let Some(metadata) = &m.metadata {
            length += 4 + if metadata.mask.is_some() { 16 } else { 8 };
        }
        if m.eth_type.is_some() {
            length += 4 + 2;
        }
        if let Some(vlan_vid) = &m.vlan_vid {
            length += 4 + if vlan_vid.mask.is_some() { 4 } else { 2 };
        }
        length
    }

    /// Size on the wire, including the trailing pad to 8 bytes.
    fn size_of(m: &Match) -> usize {
        let length = 4 + Match0x04::oxm_length(m);
        length + (8 - length % 8) % 8
    }

    fn write_oxm_header(bytes: &mut Vec<u8>, field: u8, has_mask: bool, payload: u8) {
        bytes.write_u16::<BigEndian>(OFPXMC_OPENFLOW_BASIC).unwrap();
        bytes.write_u8(field << 1 | has_mask as u8).unwrap();
        bytes.write_u8(payload).unwrap();
    }

    fn marshal(m: Match, bytes: &mut Vec<u8>) {
        let length = 4 + Match0x04::oxm_length(&m);
        bytes.write_u16::<BigEndian>(1).unwrap(); // OFPMT_OXM
        bytes.write_u16::<BigEndian>(length as u16).unwrap();
        if let Some(in_port) = m.in_port {
            Match0x04::write_oxm_header(bytes, OFPXMT_OFB_IN_PORT, false, 4);
            bytes.write_u32::<BigEndian>(in_port).unwrap();
        }
        if let Some(metadata) = m.metadata {
            let has_mask = metadata.mask.is_some();
            Match0x04::write_oxm_header(
                bytes,
                OFPXMT_OFB_METADATA,
                has_mask,
                if has_mask { 16 } else { 8 },
            );
            bytes.write_u64::<BigEndian>(metadata.value).unwrap();
            if let Some(mask) = metadata.mask {
                bytes.write_u64::<BigEndian>(mask).unwrap();
            }
        }
        if let Some(eth_type) = m.eth_type {
            Match0x04::write_oxm_header(bytes, OFPXMT_OFB_ETH_TYPE, false, 2);
            bytes.write_u16::<BigEndian>(eth_type).unwrap();
        }
        if let Some(vlan_vid) = m.vlan_vid {
            let has_mask = vlan_vid.mask.is_some();
            Match0x04::write_oxm_header(
                bytes,
                OFPXMT_OFB_VLAN_VID,
                has_mask,
                if has_mask { 4 } else { 2 },
            );
            bytes.write_u16::<BigEndian>(vlan_vid.value).unwrap();
            if let Some(mask) = vlan_vid.mask {
                bytes.write_u16::<BigEndian>(mask).unwrap();
            }
        }
        write_padding_bytes(bytes, (8 - length % 8) % 8);
    }

    fn parse(bytes: &mut Cursor<Vec<u8>>) -> Result<Match, OfpSerializationError> {
        let match_type = bytes.read_u16::<BigEndian>()?;
        if match_type != 1 {
            return unexpected_value(format!("{}", match_type), "type", "match");
        }
        let length = bytes.read_u16::<BigEndian>()? as usize;
        if length < 4 {
            return unexpected_value(format!("{}", length), "length", "match");
        }

        let mut m = Match::match_all();
        let mut remaining = length - 4;
        while remaining > 0 {
            if remaining < 4 {
                return unexpected_value(format!("{}", remaining), "oxm length", "match");
            }
            let class = bytes.read_u16::<BigEndian>()?;
            let field_and_mask = bytes.read_u8()?;
            let payload = bytes.read_u8()? as usize;
            let field = field_and_mask >> 1;
            let has_mask = field_and_mask & 1 == 1;
            if 4 + payload > remaining {
                return unexpected_value(format!("{}", payload), "oxm payload", "match");
            }
            remaining -= 4 + payload;

            if class != OFPXMC_OPENFLOW_BASIC {
                skip(bytes, payload)?;
                continue;
            }
            match field {
                OFPXMT_OFB_IN_PORT => {
                    m.in_port = Some(bytes.read_u32::<BigEndian>()?);
                }
                OFPXMT_OFB_METADATA => {
                    let value = bytes.read_u64::<BigEndian>()?;
                    let mask = if has_mask {
                        Some(bytes.read_u64::<BigEndian>()?)
                    } else {
                        None
                    };
                    m.metadata = Some(Mask { value, mask });
                }
                OFPXMT_OFB_ETH_TYPE => {
                    m.eth_type = Some(bytes.read_u16::<BigEndian>()?);
                }
                OFPXMT_OFB_VLAN_VID => {
                    let value = bytes.read_u16::<BigEndian>()?;
                    let mask = if has_mask {
                        Some(bytes.read_u16::<BigEndian>()?)
                    } else {
                        None
                    };
                    m.vlan_vid = Some(Mask { value, mask });
                }
                _ => {
                    skip(bytes, payload)?;
                }
            }
        }
        skip(bytes, (8 - length % 8) % 8)?;
        Ok(m)
    }
}

#[repr(u16)]
enum OfpActionType {
    OFPATOutput = 0,
    OFPATPushVlan = 17,
    OFPATPopVlan = 18,
    OFPATSetQueue = 21,
    OFPATGroup = 22,
    OFPATSetField = 25,
}

struct Action0x04;

impl Action0x04 {
    fn size_of(a: &Action) -> usize {
        match a {
            Action::Output { .. } => 16,
            Action::Group(_) | Action::SetQueue(_) => 8,
            Action::PushVlan(_) | Action::PopVlan => 8,
            Action::SetVlanVid { .. } => 16,
            Action::Other { body, .. } => 4 + body.len(),
        }
    }

    fn size_of_sequence(actions: &[Action]) -> usize {
        actions.iter().map(Action0x04::size_of).sum()
    }

    fn marshal(act: Action, bytes: &mut Vec<u8>) {
        let size = Action0x04::size_of(&act) as u16;
        match act {
            Action::Output { port, max_len } => {
                bytes
                    .write_u16::<BigEndian>(OfpActionType::OFPATOutput as u16)
                    .unwrap();
                bytes.write_u16::<BigEndian>(size).unwrap();
                bytes.write_u32::<BigEndian>(port).unwrap();
                bytes.write_u16::<BigEndian>(max_len).unwrap();
                write_padding_bytes(bytes, 6);
            }
            Action::Group(group_id) => {
                bytes
                    .write_u16::<BigEndian>(OfpActionType::OFPATGroup as u16)
                    .unwrap();
                bytes.write_u16::<BigEndian>(size).unwrap();
                bytes.write_u32::<BigEndian>(group_id).unwrap();
            }
            Action::SetQueue(queue_id) => {
                bytes
                    .write_u16::<BigEndian>(OfpActionType::OFPATSetQueue as u16)
                    .unwrap();
                bytes.write_u16::<BigEndian>(size).unwrap();
                bytes.write_u32::<BigEndian>(queue_id).unwrap();
            }
            Action::PushVlan(eth_type) => {
                bytes
                    .write_u16::<BigEndian>(OfpActionType::OFPATPushVlan as u16)
                    .unwrap();
                bytes.write_u16::<BigEndian>(size).unwrap();
                bytes.write_u16::<BigEndian>(eth_type).unwrap();
                write_padding_bytes(bytes, 2);
            }
            Action::PopVlan => {
                bytes
                    .write_u16::<BigEndian>(OfpActionType::OFPATPopVlan as u16)
                    .unwrap();
                bytes.write_u16::<BigEndian>(size).unwrap();
                write_padding_bytes(bytes, 4);
            }
            Action::SetVlanVid { vid, mask } => {
                bytes
                    .write_u16::<BigEndian>(OfpActionType::OFPATSetField as u16)
                    .unwrap();
                bytes.write_u16::<BigEndian>(size).unwrap();
                let has_mask = mask.is_some();
                Match0x04::write_oxm_header(
                    bytes,
                    OFPXMT_OFB_VLAN_VID,
                    has_mask,
                    if has_mask { 4 } else { 2 },
                );
                bytes.write_u16::<BigEndian>(vid).unwrap();
                if let Some(mask) = mask {
                    bytes.write_u16::<BigEndian>(mask).unwrap();
                    write_padding_bytes(bytes, 4);
                } else {
                    write_padding_bytes(bytes, 6);
                }
            }
            Action::Other { action_type, body } => {
                bytes.write_u16::<BigEndian>(action_type).unwrap();
                bytes.write_u16::<BigEndian>(size).unwrap();
                bytes.extend_from_slice(&body);
            }
        }
    }

    fn marshal_sequence(actions: Vec<Action>, bytes: &mut Vec<u8>) {
        for action in actions {
            Action0x04::marshal(action, bytes);
        }
    }

    fn parse_one(bytes: &mut Cursor<Vec<u8>>) -> Result<Action, OfpSerializationError> {
        let action_type = bytes.read_u16::<BigEndian>()?;
        let length = bytes.read_u16::<BigEndian>()? as usize;
        if length < 4 {
            return unexpected_value(format!("{}", length), "length", "action");
        }
        let body_length = length - 4;

        let action = match action_type {
            t if t == OfpActionType::OFPATOutput as u16 => {
                let port = bytes.read_u32::<BigEndian>()?;
                let max_len = bytes.read_u16::<BigEndian>()?;
                skip(bytes, 6)?;
                Action::Output { port, max_len }
            }
            t if t == OfpActionType::OFPATGroup as u16 => {
                Action::Group(bytes.read_u32::<BigEndian>()?)
            }
            t if t == OfpActionType::OFPATSetQueue as u16 => {
                Action::SetQueue(bytes.read_u32::<BigEndian>()?)
            }
            t if t == OfpActionType::OFPATPushVlan as u16 => {
                let eth_type = bytes.read_u16::<BigEndian>()?;
                skip(bytes, 2)?;
                Action::PushVlan(eth_type)
            }
            t if t == OfpActionType::OFPATPopVlan as u16 => {
                skip(bytes, 4)?;
                Action::PopVlan
            }
            t if t == OfpActionType::OFPATSetField as u16 => {
                let body = read_exact(bytes, body_length)?;
                let mut oxm = Cursor::new(body.clone());
                let class = oxm.read_u16::<BigEndian>()?;
                let field_and_mask = oxm.read_u8()?;
                let _payload = oxm.read_u8()?;
                if class == OFPXMC_OPENFLOW_BASIC && field_and_mask >> 1 == OFPXMT_OFB_VLAN_VID {
                    let vid = oxm.read_u16::<BigEndian>()?;
                    let mask = if field_and_mask & 1 == 1 {
                        Some(oxm.read_u16::<BigEndian>()?)
                    } else {
                        None
                    };
                    Action::SetVlanVid { vid, mask }
                } else {
                    Action::Other {
                        action_type,
                        body,
                    }
                }
            }
            _ => Action::Other {
                action_type,
                body: read_exact(bytes, body_length)?,
            },
        };
        Ok(action)
    }

    fn parse_sequence(buf: Vec<u8>) -> Result<Vec<Action>, OfpSerializationError> {
        let mut bytes = Cursor::new(buf);
        let mut actions = vec![];
        while bytes.remaining() > 0 {
            actions.push(Action0x04::parse_one(&mut bytes)?);
        }
        Ok(actions)
    }
}

#[repr(u16)]
enum OfpInstructionType {
    OFPITGotoTable = 1,
    OFPITWriteMetadata = 2,
    OFPITWriteActions = 3,
    OFPITApplyActions = 4,
    OFPITClearActions = 5,
    OFPITMeter = 6,
}

struct Instruction0x04;

impl Instruction0x04 {
    fn size_of(instruction: &Instruction) -> usize {
        match instruction {
            Instruction::GotoTable(_) => 8,
            Instruction::WriteMetadata { .. } => 24,
            Instruction::WriteActions(actions) | Instruction::ApplyActions(actions) => {
                8 + Action0x04::size_of_sequence(actions)
            }
            Instruction::ClearActions => 8,
            Instruction::Meter(_) => 8,
            Instruction::Other { body, .. } => 4 + body.len(),
        }
    }

    fn size_of_sequence(instructions: &[Instruction]) -> usize {
        instructions.iter().map(Instruction0x04::size_of).sum()
    }

    fn marshal(instruction: Instruction, bytes: &mut Vec<u8>) {
        let size = Instruction0x04::size_of(&instruction) as u16;
        match instruction {
            Instruction::GotoTable(table_id) => {
                bytes
                    .write_u16::<BigEndian>(OfpInstructionType::OFPITGotoTable as u16)
                    .unwrap();
                bytes.write_u16::<BigEndian>(size).unwrap();
                bytes.write_u8(table_id).unwrap();
                write_padding_bytes(bytes, 3);
            }
            Instruction::WriteMetadata { metadata, mask } => {
                bytes
                    .write_u16::<BigEndian>(OfpInstructionType::OFPITWriteMetadata as u16)
                    .unwrap();
                bytes.write_u16::<BigEndian>(size).unwrap();
                write_padding_bytes(bytes, 4);
                bytes.write_u64::<BigEndian>(metadata).unwrap();
                bytes.write_u64::<BigEndian>(mask).unwrap();
            }
            Instruction::WriteActions(actions) => {
                bytes
                    .write_u16::<BigEndian>(OfpInstructionType::OFPITWriteActions as u16)
                    .unwrap();
                bytes.write_u16::<BigEndian>(size).unwrap();
                write_padding_bytes(bytes, 4);
                Action0x04::marshal_sequence(actions, bytes);
            }
            Instruction::ApplyActions(actions) => {
                bytes
                    .write_u16::<BigEndian>(OfpInstructionType::OFPITApplyActions as u16)
                    .unwrap();
                bytes.write_u16::<BigEndian>(size).unwrap();
                write_padding_bytes(bytes, 4);
                Action0x04::marshal_sequence(actions, bytes);
            }
            Instruction::ClearActions => {
                bytes
                    .write_u16::<BigEndian>(OfpInstructionType::OFPITClearActions as u16)
                    .unwrap();
                bytes.write_u16::<BigEndian>(size).unwrap();
                write_padding_bytes(bytes, 4);
            }
            Instruction::Meter(meter_id) => {
                bytes
                    .write_u16::<BigEndian>(OfpInstructionType::OFPITMeter as u16)
                    .unwrap();
                bytes.write_u16::<BigEndian>(size).unwrap();
                bytes.write_u32::<BigEndian>(meter_id).unwrap();
            }
            Instruction::Other {
                instruction_type,
                body,
            } => {
                bytes.write_u16::<BigEndian>(instruction_type).unwrap();
                bytes.write_u16::<BigEndian>(size).unwrap();
                bytes.extend_from_slice(&body);
            }
        }
    }

    fn marshal_sequence(instructions: Vec<Instruction>, bytes: &mut Vec<u8>) {
        for instruction in instructions {
            Instruction0x04::marshal(instruction, bytes);
        }
    }

    fn parse_one(bytes: &mut Cursor<Vec<u8>>) -> Result<Instruction, OfpSerializationError> {
        let instruction_type = bytes.read_u16::<BigEndian>()?;
        let length = bytes.read_u16::<BigEndian>()? as usize;
        if length < 4 {
            return unexpected_value(format!("{}", length), "length", "instruction");
        }

        let instruction = match instruction_type {
            t if t == OfpInstructionType::OFPITGotoTable as u16 => {
                let table_id = bytes.read_u8()?;
                skip(bytes, 3)?;
                Instruction::GotoTable(table_id)
            }
            t if t == OfpInstructionType::OFPITWriteMetadata as u16 => {
                skip(bytes, 4)?;
                let metadata = bytes.read_u64::<BigEndian>()?;
                let mask = bytes.read_u64::<BigEndian>()?;
                Instruction::WriteMetadata { metadata, mask }
            }
            t if t == OfpInstructionType::OFPITWriteActions as u16 => {
                if length < 8 {
                    return unexpected_value(format!("{}", length), "length", "instruction");
                }
                skip(bytes, 4)?;
                let actions = Action0x04::parse_sequence(read_exact(bytes, length - 8)?)?;
                Instruction::WriteActions(actions)
            }
            t if t == OfpInstructionType::OFPITApplyActions as u16 => {
                if length < 8 {
                    return unexpected_value(format!("{}", length), "length", "instruction");
                }
                skip(bytes, 4)?;
                let actions = Action0x04::parse_sequence(read_exact(bytes, length - 8)?)?;
                Instruction::ApplyActions(actions)
            }
            t if t == OfpInstructionType::OFPITClearActions as u16 => {
                skip(bytes, 4)?;
                Instruction::ClearActions
            }
            t if t == OfpInstructionType::OFPITMeter as u16 => {
                Instruction::Meter(bytes.read_u32::<BigEndian>()?)
            }
            _ => Instruction::Other {
                instruction_type,
                body: read_exact(bytes, length - 4)?,
            },
        };
        Ok(instruction)
    }

    fn parse_sequence(buf: Vec<u8>) -> Result<Vec<Instruction>, OfpSerializationError> {
        let mut bytes = Cursor::new(buf);
        let mut instructions = vec![];
        while bytes.remaining() > 0 {
            instructions.push(Instruction0x04::parse_one(&mut bytes)?);
        }
        Ok(instructions)
    }
}

#[repr(packed)]
struct OfpFlowMod(u64, u64, u8, u8, u16, u16, u16, u32, u32, u32, u16, u16);

impl MessageType for FlowMod {
    fn size_of(fm: &FlowMod) -> usize {
        size_of::<OfpFlowMod>()
            + Match0x04::size_of(&fm.pattern)
            + Instruction0x04::size_of_sequence(&fm.instructions)
    }

    fn parse(buf: &[u8]) -> Result<FlowMod, OfpSerializationError> {
        let mut bytes = Cursor::new(buf.to_vec());
        let cookie = bytes.read_u64::<BigEndian>()?;
        let cookie_mask = bytes.read_u64::<BigEndian>()?;
        let table_id = bytes.read_u8()?;
        let command = match bytes.read_u8()? {
            0 => FlowModCmd::AddFlow,
            1 => FlowModCmd::ModFlow,
            2 => FlowModCmd::ModStrictFlow,
            3 => FlowModCmd::DeleteFlow,
            4 => FlowModCmd::DeleteStrictFlow,
            c => return unexpected_value(format!("{}", c), "command", "flow mod"),
        };
        let idle_timeout = bytes.read_u16::<BigEndian>()?;
        let hard_timeout = bytes.read_u16::<BigEndian>()?;
        let priority = bytes.read_u16::<BigEndian>()?;
        let buffer_id = bytes.read_u32::<BigEndian>()?;
        let out_port = bytes.read_u32::<BigEndian>()?;
        let out_group = bytes.read_u32::<BigEndian>()?;
        let flags = bytes.read_u16::<BigEndian>()?;
        skip(&mut bytes, 2)?;
        let pattern = Match0x04::parse(&mut bytes)?;
        let instructions = Instruction0x04::parse_sequence(read_tail(&mut bytes)?)?;
        Ok(FlowMod {
            cookie,
            cookie_mask,
            table_id,
            command,
            idle_timeout,
            hard_timeout,
            priority,
            buffer_id,
            out_port,
            out_group,
            flags,
            pattern,
            instructions,
        })
    }

    fn marshal(fm: FlowMod, bytes: &mut Vec<u8>) -> Result<(), OfpSerializationError> {
        bytes.write_u64::<BigEndian>(fm.cookie).unwrap();
        bytes.write_u64::<BigEndian>(fm.cookie_mask).unwrap();
        bytes.write_u8(fm.table_id).unwrap();
        bytes.write_u8(fm.command as u8).unwrap();
        bytes.write_u16::<BigEndian>(fm.idle_timeout).unwrap();
        bytes.write_u16::<BigEndian>(fm.hard_timeout).unwrap();
        bytes.write_u16::<BigEndian>(fm.priority).unwrap();
        bytes.write_u32::<BigEndian>(fm.buffer_id).unwrap();
        bytes.write_u32::<BigEndian>(fm.out_port).unwrap();
        bytes.write_u32::<BigEndian>(fm.out_group).unwrap();
        bytes.write_u16::<BigEndian>(fm.flags).unwrap();
        write_padding_bytes(bytes, 2);
        Match0x04::marshal(fm.pattern, bytes);
        Instruction0x04::marshal_sequence(fm.instructions, bytes);
        Ok(())
    }
}

struct Bucket0x04;

impl Bucket0x04 {
    fn size_of(bucket: &Bucket) -> usize {
        16 + Action0x04::size_of_sequence(&bucket.actions)
    }

    fn marshal(bucket: Bucket, bytes: &mut Vec<u8>) {
        bytes
            .write_u16::<BigEndian>(Bucket0x04::size_of(&bucket) as u16)
            .unwrap();
        bytes.write_u16::<BigEndian>(bucket.weight).unwrap();
        bytes.write_u32::<BigEndian>(bucket.watch_port).unwrap();
        bytes.write_u32::<BigEndian>(bucket.watch_group).unwrap();
        write_padding_bytes(bytes, 4);
        Action0x04::marshal_sequence(bucket.actions, bytes);
    }

    fn parse(bytes: &mut Cursor<Vec<u8>>) -> Result<Bucket, OfpSerializationError> {
        let length = bytes.read_u16::<BigEndian>()? as usize;
        if length < 16 {
            return unexpected_value(format!("{}", length), "length", "bucket");
        }
        let weight = bytes.read_u16::<BigEndian>()?;
        let watch_port = bytes.read_u32::<BigEndian>()?;
        let watch_group = bytes.read_u32::<BigEndian>()?;
        skip(bytes, 4)?;
        let actions = Action0x04::parse_sequence(read_exact(bytes, length - 16)?)?;
        Ok(Bucket {
            weight,
            watch_port,
            watch_group,
            actions,
        })
    }
}

impl MessageType for GroupMod {
    fn size_of(gm: &GroupMod) -> usize {
        8 + gm.buckets.iter().map(Bucket0x04::size_of).sum::<usize>()
    }

    fn parse(buf: &[u8]) -> Result<GroupMod, OfpSerializationError> {
        let mut bytes = Cursor::new(buf.to_vec());
        let command = match bytes.read_u16::<BigEndian>()? {
            0 => GroupModCmd::Add,
            1 => GroupModCmd::Modify,
            2 => GroupModCmd::Delete,
            c => return unexpected_value(format!("{}", c), "command", "group mod"),
        };
        let group_type = match bytes.read_u8()? {
            0 => GroupType::All,
            1 => GroupType::Select,
            2 => GroupType::Indirect,
            3 => GroupType::FastFailover,
            t => return unexpected_value(format!("{}", t), "type", "group mod"),
        };
        skip(&mut bytes, 1)?;
        let group_id = bytes.read_u32::<BigEndian>()?;
        let mut buckets = vec![];
        while bytes.remaining() > 0 {
            buckets.push(Bucket0x04::parse(&mut bytes)?);
        }
        Ok(GroupMod {
            command,
            group_type,
            group_id,
            buckets,
        })
    }

    fn marshal(gm: GroupMod, bytes: &mut Vec<u8>) -> Result<(), OfpSerializationError> {
        bytes.write_u16::<BigEndian>(gm.command as u16).unwrap();
        bytes.write_u8(gm.group_type as u8).unwrap();
        write_padding_bytes(bytes, 1);
        bytes.write_u32::<BigEndian>(gm.group_id).unwrap();
        for bucket in gm.buckets {
            Bucket0x04::marshal(bucket, bytes);
        }
        Ok(())
    }
}

struct MeterBand0x04;

impl MeterBand0x04 {
    const OFPMBT_DROP_TYPE: u16 = 1;

    fn marshal(band: MeterBand, bytes: &mut Vec<u8>) {
        match band {
            MeterBand::Drop { rate, burst_size } => {
                bytes
                    .write_u16::<BigEndian>(MeterBand0x04::OFPMBT_DROP_TYPE)
                    .unwrap();
                bytes.write_u16::<BigEndian>(16).unwrap();
                bytes.write_u32::<BigEndian>(rate).unwrap();
                bytes.write_u32::<BigEndian>(burst_size).unwrap();
                write_padding_bytes(bytes, 4);
            }
        }
    }

    fn parse(bytes: &mut Cursor<Vec<u8>>) -> Result<Option<MeterBand>, OfpSerializationError> {
        let band_type = bytes.read_u16::<BigEndian>()?;
        let length = bytes.read_u16::<BigEndian>()? as usize;
        if length < 4 {
            return unexpected_value(format!("{}", length), "length", "meter band");
        }
        if band_type == MeterBand0x04::OFPMBT_DROP_TYPE {
            let rate = bytes.read_u32::<BigEndian>()?;
            let burst_size = bytes.read_u32::<BigEndian>()?;
            skip(bytes, 4)?;
            Ok(Some(MeterBand::Drop { rate, burst_size }))
        } else {
            // Band types the hypervisor never emits; skipped.
            skip(bytes, length - 4)?;
            Ok(None)
        }
    }
}

impl MessageType for MeterMod {
    fn size_of(mm: &MeterMod) -> usize {
        8 + 16 * mm.bands.len()
    }

    fn parse(buf: &[u8]) -> Result<MeterMod, OfpSerializationError> {
        let mut bytes = Cursor::new(buf.to_vec());
        let command = match bytes.read_u16::<BigEndian>()? {
            0 => MeterModCmd::Add,
            1 => MeterModCmd::Modify,
            2 => MeterModCmd::Delete,
            c => return unexpected_value(format!("{}", c), "command", "meter mod"),
        };
        let flags = bytes.read_u16::<BigEndian>()?;
        let meter_id = bytes.read_u32::<BigEndian>()?;
        let mut bands = vec![];
        while bytes.remaining() > 0 {
            if let Some(band) = MeterBand0x04::parse(&mut bytes)? {
                bands.push(band);
            }
        }
        Ok(MeterMod {
            command,
            flags,
            meter_id,
            bands,
        })
    }

    fn marshal(mm: MeterMod, bytes: &mut Vec<u8>) -> Result<(), OfpSerializationError> {
        bytes.write_u16::<BigEndian>(mm.command as u16).unwrap();
        bytes.write_u16::<BigEndian>(mm.flags).unwrap();
        bytes.write_u32::<BigEndian>(mm.meter_id).unwrap();
        for band in mm.bands {
            MeterBand0x04::marshal(band, bytes);
        }
        Ok(())
    }
}

struct Payload0x04;

impl Payload0x04 {
    fn marshal(payload: Payload, bytes: &mut Vec<u8>) {
        match payload {
            Payload::Buffered(_, buf) | Payload::NotBuffered(buf) => {
                bytes.extend_from_slice(&buf)
            }
        }
    }
}

impl MessageType for PacketIn {
    fn size_of(pi: &PacketIn) -> usize {
        16 + Match0x04::size_of(&pi.pattern) + 2 + Payload::size_of(&pi.payload)
    }

    fn parse(buf: &[u8]) -> Result<PacketIn, OfpSerializationError> {
        let mut bytes = Cursor::new(buf.to_vec());
        let buffer_id = match bytes.read_i32::<BigEndian>()? {
            -1 => None,
            n => Some(n as u32),
        };
        let total_len = bytes.read_u16::<BigEndian>()?;
        let reason = match bytes.read_u8()? {
            0 => PacketInReason::NoMatch,
            1 => PacketInReason::Action,
            2 => PacketInReason::InvalidTtl,
            r => return unexpected_value(format!("{}", r), "reason", "packet in"),
        };
        let table_id = bytes.read_u8()?;
        let cookie = bytes.read_u64::<BigEndian>()?;
        let pattern = Match0x04::parse(&mut bytes)?;
        skip(&mut bytes, 2)?;
        let data = read_tail(&mut bytes)?;
        Ok(PacketIn {
            total_len,
            reason,
            table_id,
            cookie,
            pattern,
            payload: match buffer_id {
                None => Payload::NotBuffered(data),
                Some(n) => Payload::Buffered(n, data),
            },
        })
    }

    fn marshal(pi: PacketIn, bytes: &mut Vec<u8>) -> Result<(), OfpSerializationError> {
        let buffer_id = match pi.payload {
            Payload::NotBuffered(_) => -1,
            Payload::Buffered(n, _) => n as i32,
        };
        bytes.write_i32::<BigEndian>(buffer_id).unwrap();
        bytes.write_u16::<BigEndian>(pi.total_len).unwrap();
        bytes.write_u8(pi.reason as u8).unwrap();
        bytes.write_u8(pi.table_id).unwrap();
        bytes.write_u64::<BigEndian>(pi.cookie).unwrap();
        Match0x04::marshal(pi.pattern, bytes);
        write_padding_bytes(bytes, 2);
        Payload0x04::marshal(pi.payload, bytes);
        Ok(())
    }
}

impl MessageType for PacketOut {
    fn size_of(po: &PacketOut) -> usize {
        16 + Action0x04::size_of_sequence(&po.actions) + Payload::size_of(&po.payload)
    }

    fn parse(buf: &[u8]) -> Result<PacketOut, OfpSerializationError> {
        let mut bytes = Cursor::new(buf.to_vec());
        let buffer_id = match bytes.read_i32::<BigEndian>()? {
            -1 => None,
            n => Some(n as u32),
        };
        let in_port = bytes.read_u32::<BigEndian>()?;
        let actions_len = bytes.read_u16::<BigEndian>()? as usize;
        skip(&mut bytes, 6)?;
        let actions = Action0x04::parse_sequence(read_exact(&mut bytes, actions_len)?)?;
        let data = read_tail(&mut bytes)?;
        Ok(PacketOut {
            payload: match buffer_id {
                None => Payload::NotBuffered(data),
                Some(n) => Payload::Buffered(n, data),
            },
            in_port,
            actions,
        })
    }

    fn marshal(po: PacketOut, bytes: &mut Vec<u8>) -> Result<(), OfpSerializationError> {
        let buffer_id = match po.payload {
            Payload::NotBuffered(_) => -1,
            Payload::Buffered(n, _) => n as i32,
        };
        bytes.write_i32::<BigEndian>(buffer_id).unwrap();
        bytes.write_u32::<BigEndian>(po.in_port).unwrap();
        bytes
            .write_u16::<BigEndian>(Action0x04::size_of_sequence(&po.actions) as u16)
            .unwrap();
        write_padding_bytes(bytes, 6);
        Action0x04::marshal_sequence(po.actions, bytes);
        Payload0x04::marshal(po.payload, bytes);
        Ok(())
    }
}

struct PortDesc0x04;

impl PortDesc0x04 {
    const SIZE: usize = 64;

    fn marshal(desc: PortDesc, bytes: &mut Vec<u8>) {
        bytes.write_u32::<BigEndian>(desc.port_no).unwrap();
        write_padding_bytes(bytes, 4);
        bytes.extend_from_slice(&bytes_of_mac(desc.hw_addr));
        write_padding_bytes(bytes, 2);
        write_fixed_size_string(bytes, &desc.name, 16);
        bytes.write_u32::<BigEndian>(desc.config.to_int()).unwrap();
        bytes.write_u32::<BigEndian>(desc.state.to_int()).unwrap();
        bytes.write_u32::<BigEndian>(desc.curr).unwrap();
        bytes.write_u32::<BigEndian>(desc.advertised).unwrap();
        bytes.write_u32::<BigEndian>(desc.supported).unwrap();
        bytes.write_u32::<BigEndian>(desc.peer).unwrap();
        bytes.write_u32::<BigEndian>(desc.curr_speed).unwrap();
        bytes.write_u32::<BigEndian>(desc.max_speed).unwrap();
    }

    fn parse(bytes: &mut Cursor<Vec<u8>>) -> Result<PortDesc, OfpSerializationError> {
        let port_no = bytes.read_u32::<BigEndian>()?;
        skip(bytes, 4)?;
        let hw_addr = {
            let mut arr = [0u8; 6];
            Read::read_exact(bytes, &mut arr)?;
            mac_of_bytes(arr)
        };
        skip(bytes, 2)?;
        let name = read_fixed_size_string(bytes, 16)?;
        let config = PortConfig::of_int(bytes.read_u32::<BigEndian>()?);
        let state = PortState::of_int(bytes.read_u32::<BigEndian>()?);
        Ok(PortDesc {
            port_no,
            hw_addr,
            name,
            config,
            state,
            curr: bytes.read_u32::<BigEndian>()?,
            advertised: bytes.read_u32::<BigEndian>()?,
            supported: bytes.read_u32::<BigEndian>()?,
            peer: bytes.read_u32::<BigEndian>()?,
            curr_speed: bytes.read_u32::<BigEndian>()?,
            max_speed: bytes.read_u32::<BigEndian>()?,
        })
    }
}

impl MessageType for PortStatus {
    fn size_of(_: &PortStatus) -> usize {
        8 + PortDesc0x04::SIZE
    }

    fn parse(buf: &[u8]) -> Result<PortStatus, OfpSerializationError> {
        let mut bytes = Cursor::new(buf.to_vec());
        let reason = match bytes.read_u8()? {
            0 => PortReason::PortAdd,
            1 => PortReason::PortDelete,
            2 => PortReason::PortModify,
            r => return unexpected_value(format!("{}", r), "reason", "port status"),
        };
        skip(&mut bytes, 7)?;
        let desc = PortDesc0x04::parse(&mut bytes)?;
        Ok(PortStatus { reason, desc })
    }

    fn marshal(ps: PortStatus, bytes: &mut Vec<u8>) -> Result<(), OfpSerializationError> {
        bytes.write_u8(ps.reason as u8).unwrap();
        write_padding_bytes(bytes, 7);
        PortDesc0x04::marshal(ps.desc, bytes);
        Ok(())
    }
}

impl MessageType for SwitchFeatures {
    fn size_of(_: &SwitchFeatures) -> usize {
        24
    }

    fn parse(buf: &[u8]) -> Result<SwitchFeatures, OfpSerializationError> {
        let mut bytes = Cursor::new(buf.to_vec());
        let datapath_id = bytes.read_u64::<BigEndian>()?;
        let num_buffers = bytes.read_u32::<BigEndian>()?;
        let num_tables = bytes.read_u8()?;
        let auxiliary_id = bytes.read_u8()?;
        skip(&mut bytes, 2)?;
        let supported_capabilities = Capabilities::of_int(bytes.read_u32::<BigEndian>()?);
        skip(&mut bytes, 4)?; // reserved
        Ok(SwitchFeatures {
            datapath_id,
            num_buffers,
            num_tables,
            auxiliary_id,
            supported_capabilities,
        })
    }

    fn marshal(sf: SwitchFeatures, bytes: &mut Vec<u8>) -> Result<(), OfpSerializationError> {
        bytes.write_u64::<BigEndian>(sf.datapath_id).unwrap();
        bytes.write_u32::<BigEndian>(sf.num_buffers).unwrap();
        bytes.write_u8(sf.num_tables).unwrap();
        bytes.write_u8(sf.auxiliary_id).unwrap();
        write_padding_bytes(bytes, 2);
        bytes
            .write_u32::<BigEndian>(sf.supported_capabilities.to_int())
            .unwrap();
        write_padding_bytes(bytes, 4);
        Ok(())
    }
}

impl MessageType for SwitchConfig {
    fn size_of(_: &SwitchConfig) -> usize {
        4
    }

    fn parse(buf: &[u8]) -> Result<SwitchConfig, OfpSerializationError> {
        let mut bytes = Cursor::new(buf.to_vec());
        Ok(SwitchConfig {
            flags: bytes.read_u16::<BigEndian>()?,
            miss_send_len: bytes.read_u16::<BigEndian>()?,
        })
    }

    fn marshal(sc: SwitchConfig, bytes: &mut Vec<u8>) -> Result<(), OfpSerializationError> {
        bytes.write_u16::<BigEndian>(sc.flags).unwrap();
        bytes.write_u16::<BigEndian>(sc.miss_send_len).unwrap();
        Ok(())
    }
}

impl MessageType for FlowRemoved {
    fn size_of(fr: &FlowRemoved) -> usize {
        40 + Match0x04::size_of(&fr.pattern)
    }

    fn parse(buf: &[u8]) -> Result<FlowRemoved, OfpSerializationError> {
        let mut bytes = Cursor::new(buf.to_vec());
        let cookie = bytes.read_u64::<BigEndian>()?;
        let priority = bytes.read_u16::<BigEndian>()?;
        let reason = match bytes.read_u8()? {
            0 => FlowRemovedReason::IdleTimeout,
            1 => FlowRemovedReason::HardTimeout,
            2 => FlowRemovedReason::Delete,
            3 => FlowRemovedReason::GroupDelete,
            r => return unexpected_value(format!("{}", r), "reason", "flow removed"),
        };
        let table_id = bytes.read_u8()?;
        let duration_sec = bytes.read_u32::<BigEndian>()?;
        let duration_nsec = bytes.read_u32::<BigEndian>()?;
        let idle_timeout = bytes.read_u16::<BigEndian>()?;
        let hard_timeout = bytes.read_u16::<BigEndian>()?;
        let packet_count = bytes.read_u64::<BigEndian>()?;
        let byte_count = bytes.read_u64::<BigEndian>()?;
        let pattern = Match0x04::parse(&mut bytes)?;
        Ok(FlowRemoved {
            cookie,
            priority,
            reason,
            table_id,
            duration_sec,
            duration_nsec,
            idle_timeout,
            hard_timeout,
            packet_count,
            byte_count,
            pattern,
        })
    }

    fn marshal(fr: FlowRemoved, bytes: &mut Vec<u8>) -> Result<(), OfpSerializationError> {
        bytes.write_u64::<BigEndian>(fr.cookie).unwrap();
        bytes.write_u16::<BigEndian>(fr.priority).unwrap();
        bytes.write_u8(fr.reason as u8).unwrap();
        bytes.write_u8(fr.table_id).unwrap();
        bytes.write_u32::<BigEndian>(fr.duration_sec).unwrap();
        bytes.write_u32::<BigEndian>(fr.duration_nsec).unwrap();
        bytes.write_u16::<BigEndian>(fr.idle_timeout).unwrap();
        bytes.write_u16::<BigEndian>(fr.hard_timeout).unwrap();
        bytes.write_u64::<BigEndian>(fr.packet_count).unwrap();
        bytes.write_u64::<BigEndian>(fr.byte_count).unwrap();
        Match0x04::marshal(fr.pattern, bytes);
        Ok(())
    }
}

impl MessageType for ErrorMsg {
    fn size_of(err: &ErrorMsg) -> usize {
        4 + err.data.len()
    }

    fn parse(buf: &[u8]) -> Result<ErrorMsg, OfpSerializationError> {
        let mut bytes = Cursor::new(buf.to_vec());
        let err_type = bytes.read_u16::<BigEndian>()?;
        let code = bytes.read_u16::<BigEndian>()?;
        let data = read_tail(&mut bytes)?;
        Ok(ErrorMsg {
            err_type,
            code,
            data,
        })
    }

    fn marshal(err: ErrorMsg, bytes: &mut Vec<u8>) -> Result<(), OfpSerializationError> {
        bytes.write_u16::<BigEndian>(err.err_type).unwrap();
        bytes.write_u16::<BigEndian>(err.code).unwrap();
        bytes.extend_from_slice(&err.data);
        Ok(())
    }
}

const DESC_STR_LEN: usize = 256;
const SERIAL_NUM_LEN: usize = 32;

impl MessageType for MultipartReq {
    fn size_of(req: &MultipartReq) -> usize {
        8 + match &req.body {
            MultipartReqBody::Desc
            | MultipartReqBody::GroupFeatures
            | MultipartReqBody::MeterFeatures
            | MultipartReqBody::PortDesc => 0,
            MultipartReqBody::Other { body, .. } => body.len(),
        }
    }

    fn parse(buf: &[u8]) -> Result<MultipartReq, OfpSerializationError> {
        let mut bytes = Cursor::new(buf.to_vec());
        let req_type = bytes.read_u16::<BigEndian>()?;
        let flags = bytes.read_u16::<BigEndian>()?;
        skip(&mut bytes, 4)?;
        let body = match req_type {
            t if t == MultipartType::Desc as u16 => MultipartReqBody::Desc,
            t if t == MultipartType::GroupFeatures as u16 => MultipartReqBody::GroupFeatures,
            t if t == MultipartType::MeterFeatures as u16 => MultipartReqBody::MeterFeatures,
            t if t == MultipartType::PortDesc as u16 => MultipartReqBody::PortDesc,
            t => MultipartReqBody::Other {
                req_type: t,
                body: read_tail(&mut bytes)?,
            },
        };
        Ok(MultipartReq { flags, body })
    }

    fn marshal(req: MultipartReq, bytes: &mut Vec<u8>) -> Result<(), OfpSerializationError> {
        bytes.write_u16::<BigEndian>(req.body.type_code()).unwrap();
        bytes.write_u16::<BigEndian>(req.flags).unwrap();
        write_padding_bytes(bytes, 4);
        if let MultipartReqBody::Other { body, .. } = req.body {
            bytes.extend_from_slice(&body);
        }
        Ok(())
    }
}

impl MessageType for MultipartResp {
    fn size_of(resp: &MultipartResp) -> usize {
        8 + match &resp.body {
            MultipartRespBody::Desc { .. } => 4 * DESC_STR_LEN + SERIAL_NUM_LEN,
            MultipartRespBody::GroupFeatures(_) => 40,
            MultipartRespBody::MeterFeatures(_) => 16,
            MultipartRespBody::PortDesc(ports) => ports.len() * PortDesc0x04::SIZE,
            MultipartRespBody::Other { body, .. } => body.len(),
        }
    }

    fn parse(buf: &[u8]) -> Result<MultipartResp, OfpSerializationError> {
        let mut bytes = Cursor::new(buf.to_vec());
        let resp_type = bytes.read_u16::<BigEndian>()?;
        let flags = bytes.read_u16::<BigEndian>()?;
        skip(&mut bytes, 4)?;
        let body = match resp_type {
            t if t == MultipartType::Desc as u16 => MultipartRespBody::Desc {
                manufacturer: read_fixed_size_string(&mut bytes, DESC_STR_LEN)?,
                hardware: read_fixed_size_string(&mut bytes, DESC_STR_LEN)?,
                software: read_fixed_size_string(&mut bytes, DESC_STR_LEN)?,
                serial_number: read_fixed_size_string(&mut bytes, SERIAL_NUM_LEN)?,
                datapath: read_fixed_size_string(&mut bytes, DESC_STR_LEN)?,
            },
            t if t == MultipartType::GroupFeatures as u16 => {
                let types = bytes.read_u32::<BigEndian>()?;
                let capabilities = bytes.read_u32::<BigEndian>()?;
                let mut max_groups = [0u32; 4];
                for group in max_groups.iter_mut() {
                    *group = bytes.read_u32::<BigEndian>()?;
                }
                let mut actions = [0u32; 4];
                for action in actions.iter_mut() {
                    *action = bytes.read_u32::<BigEndian>()?;
                }
                MultipartRespBody::GroupFeatures(GroupFeatures {
                    types,
                    capabilities,
                    max_groups,
                    actions,
                })
            }
            t if t == MultipartType::MeterFeatures as u16 => {
                let max_meter = bytes.read_u32::<BigEndian>()?;
                let band_types = bytes.read_u32::<BigEndian>()?;
                let capabilities = bytes.read_u32::<BigEndian>()?;
                let max_bands = bytes.read_u8()?;
                let max_color = bytes.read_u8()?;
                skip(&mut bytes, 2)?;
                MultipartRespBody::MeterFeatures(MeterFeatures {
                    max_meter,
                    band_types,
                    capabilities,
                    max_bands,
                    max_color,
                })
            }
            t if t == MultipartType::PortDesc as u16 => {
                let mut ports = vec![];
                while bytes.remaining() >= PortDesc0x04::SIZE {
                    ports.push(PortDesc0x04::parse(&mut bytes)?);
                }
                MultipartRespBody::PortDesc(ports)
            }
            t => MultipartRespBody::Other {
                resp_type: t,
                body: read_tail(&mut bytes)?,
            },
        };
        Ok(MultipartResp { flags, body })
    }

    fn marshal(resp: MultipartResp, bytes: &mut Vec<u8>) -> Result<(), OfpSerializationError> {
        bytes.write_u16::<BigEndian>(resp.body.type_code()).unwrap();
        bytes.write_u16::<BigEndian>(resp.flags).unwrap();
        write_padding_bytes(bytes, 4);
        match resp.body {
            MultipartRespBody::Desc {
                manufacturer,
                hardware,
                software,
                serial_number,
                datapath,
            } => {
                write_fixed_size_string(bytes, &manufacturer, DESC_STR_LEN);
                write_fixed_size_string(bytes, &hardware, DESC_STR_LEN);
                write_fixed_size_string(bytes, &software, DESC_STR_LEN);
                write_fixed_size_string(bytes, &serial_number, SERIAL_NUM_LEN);
                write_fixed_size_string(bytes, &datapath, DESC_STR_LEN);
            }
            MultipartRespBody::GroupFeatures(gf) => {
                bytes.write_u32::<BigEndian>(gf.types).unwrap();
                bytes.write_u32::<BigEndian>(gf.capabilities).unwrap();
                for group in gf.max_groups {
                    bytes.write_u32::<BigEndian>(group).unwrap();
                }
                for action in gf.actions {
                    bytes.write_u32::<BigEndian>(action).unwrap();
                }
            }
            MultipartRespBody::MeterFeatures(mf) => {
                bytes.write_u32::<BigEndian>(mf.max_meter).unwrap();
                bytes.write_u32::<BigEndian>(mf.band_types).unwrap();
                bytes.write_u32::<BigEndian>(mf.capabilities).unwrap();
                bytes.write_u8(mf.max_bands).unwrap();
                bytes.write_u8(mf.max_color).unwrap();
                write_padding_bytes(bytes, 2);
            }
            MultipartRespBody::PortDesc(ports) => {
                for port in ports {
                    PortDesc0x04::marshal(port, bytes);
                }
            }
            MultipartRespBody::Other { body, .. } => {
                bytes.extend_from_slice(&body);
            }
        }
        Ok(())
    }
}

/// Map `Message` to associated OpenFlow message type code `MsgCode`.
fn msg_code_of_message(msg: &Message) -> MsgCode {
    match msg {
        Message::Hello => MsgCode::Hello,
        Message::Error(_) => MsgCode::Error,
        Message::EchoRequest(_) => MsgCode::EchoReq,
        Message::EchoReply(_) => MsgCode::EchoResp,
        Message::FeaturesReq => MsgCode::FeaturesReq,
        Message::FeaturesReply(_) => MsgCode::FeaturesResp,
        Message::GetConfigReq => MsgCode::GetConfigReq,
        Message::GetConfigReply(_) => MsgCode::GetConfigResp,
        Message::SetConfig(_) => MsgCode::SetConfig,
        Message::PacketIn(_) => MsgCode::PacketIn,
        Message::FlowRemoved(_) => MsgCode::FlowRemoved,
        Message::PortStatus(_) => MsgCode::PortStatus,
        Message::PacketOut(_) => MsgCode::PacketOut,
        Message::FlowMod(_) => MsgCode::FlowMod,
        Message::GroupMod(_) => MsgCode::GroupMod,
        Message::MeterMod(_) => MsgCode::MeterMod,
        Message::MultipartReq(_) => MsgCode::MultipartReq,
        Message::MultipartReply(_) => MsgCode::MultipartResp,
        Message::BarrierRequest => MsgCode::BarrierReq,
        Message::BarrierReply => MsgCode::BarrierResp,
        Message::Unsupported { code } => *code,
    }
}

fn marshal_body(msg: Message, bytes: &mut Vec<u8>) -> Result<(), OfpSerializationError> {
    match msg {
        Message::Hello
        | Message::FeaturesReq
        | Message::GetConfigReq
        | Message::BarrierRequest
        | Message::BarrierReply => Ok(()),
        Message::Error(err) => ErrorMsg::marshal(err, bytes),
        Message::EchoRequest(buf) | Message::EchoReply(buf) => {
            bytes.extend_from_slice(&buf);
            Ok(())
        }
        Message::FeaturesReply(sf) => SwitchFeatures::marshal(sf, bytes),
        Message::GetConfigReply(sc) | Message::SetConfig(sc) => SwitchConfig::marshal(sc, bytes),
        Message::PacketIn(pi) => PacketIn::marshal(pi, bytes),
        Message::FlowRemoved(fr) => FlowRemoved::marshal(fr, bytes),
        Message::PortStatus(ps) => PortStatus::marshal(ps, bytes),
        Message::PacketOut(po) => PacketOut::marshal(po, bytes),
        Message::FlowMod(fm) => FlowMod::marshal(fm, bytes),
        Message::GroupMod(gm) => GroupMod::marshal(gm, bytes),
        Message::MeterMod(mm) => MeterMod::marshal(mm, bytes),
        Message::MultipartReq(req) => MultipartReq::marshal(req, bytes),
        Message::MultipartReply(resp) => MultipartResp::marshal(resp, bytes),
        Message::Unsupported { code } => Err(OfpSerializationError::UnsupportedMessageCode {
            version: OPENFLOW_0_04_VERSION,
            code,
        }),
    }
}

impl OfpMessage for Message {
    fn size_of(msg: &Message) -> Result<usize, OfpSerializationError> {
        let body = match msg {
            Message::Hello
            | Message::FeaturesReq
            | Message::GetConfigReq
            | Message::BarrierRequest
            | Message::BarrierReply => 0,
            Message::Error(err) => ErrorMsg::size_of(err),
            Message::EchoRequest(buf) | Message::EchoReply(buf) => buf.len(),
            Message::FeaturesReply(sf) => SwitchFeatures::size_of(sf),
            Message::GetConfigReply(sc) | Message::SetConfig(sc) => SwitchConfig::size_of(sc),
            Message::PacketIn(pi) => PacketIn::size_of(pi),
            Message::FlowRemoved(fr) => FlowRemoved::size_of(fr),
            Message::PortStatus(ps) => PortStatus::size_of(ps),
            Message::PacketOut(po) => PacketOut::size_of(po),
            Message::FlowMod(fm) => FlowMod::size_of(fm),
            Message::GroupMod(gm) => GroupMod::size_of(gm),
            Message::MeterMod(mm) => MeterMod::size_of(mm),
            Message::MultipartReq(req) => MultipartReq::size_of(req),
            Message::MultipartReply(resp) => MultipartResp::size_of(resp),
            Message::Unsupported { code } => {
                return Err(OfpSerializationError::UnsupportedMessageCode {
                    version: OPENFLOW_0_04_VERSION,
                    code: *code,
                })
            }
        };
        Ok(OfpHeader::size() + body)
    }

    fn header_of(xid: u32, msg: &Message) -> Result<OfpHeader, OfpSerializationError> {
        let length = Message::size_of(msg)?;
        Ok(OfpHeader::new(
            OPENFLOW_0_04_VERSION,
            msg_code_of_message(msg) as u8,
            length as u16,
            xid,
        ))
    }

    fn marshal(xid: u32, msg: Message) -> Result<Vec<u8>, OfpSerializationError> {
        let header = Message::header_of(xid, &msg)?;
        let mut bytes = vec![];
        OfpHeader::marshal(&mut bytes, header);
        marshal_body(msg, &mut bytes)?;
        Ok(bytes)
    }

    fn parse(header: &OfpHeader, buf: &[u8]) -> Result<(u32, Message), OfpSerializationError> {
        let typ = header.type_code()?;
        let msg = match typ {
            MsgCode::Hello => {
                debug!("Message received: Hello");
                Message::Hello
            }
            MsgCode::Error => Message::Error(ErrorMsg::parse(buf)?),
            MsgCode::EchoReq => Message::EchoRequest(buf.to_vec()),
            MsgCode::EchoResp => Message::EchoReply(buf.to_vec()),
            MsgCode::FeaturesReq => Message::FeaturesReq,
            MsgCode::FeaturesResp => {
                debug!("Message received: FeaturesResp");
                Message::FeaturesReply(SwitchFeatures::parse(buf)?)
            }
            MsgCode::GetConfigReq => Message::GetConfigReq,
            MsgCode::GetConfigResp => Message::GetConfigReply(SwitchConfig::parse(buf)?),
            MsgCode::SetConfig => Message::SetConfig(SwitchConfig::parse(buf)?),
            MsgCode::PacketIn => Message::PacketIn(PacketIn::parse(buf)?),
            MsgCode::FlowRemoved => Message::FlowRemoved(FlowRemoved::parse(buf)?),
            MsgCode::PortStatus => Message::PortStatus(PortStatus::parse(buf)?),
            MsgCode::PacketOut => Message::PacketOut(PacketOut::parse(buf)?),
            MsgCode::FlowMod => Message::FlowMod(FlowMod::parse(buf)?),
            MsgCode::GroupMod => Message::GroupMod(GroupMod::parse(buf)?),
            MsgCode::MeterMod => Message::MeterMod(MeterMod::parse(buf)?),
            MsgCode::MultipartReq => Message::MultipartReq(MultipartReq::parse(buf)?),
            MsgCode::MultipartResp => Message::MultipartReply(MultipartResp::parse(buf)?),
            MsgCode::BarrierReq => Message::BarrierRequest,
            MsgCode::BarrierResp => Message::BarrierReply,
            code => Message::Unsupported { code },
        };
        Ok((header.xid(), msg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ofp_header::OFP_HEADER_LENGTH;

    const TEST_XID: u32 = 0x12345678;
    const TEST_DPID: u64 = 0x1122334455667788;

    fn round_trip(message: Message) -> Message {
        let bytes = Message::marshal(TEST_XID, message).unwrap();
        let header = OfpHeader::parse(&bytes[..OFP_HEADER_LENGTH]).unwrap();
        assert_eq!(header.length(), bytes.len());
        let (xid, parsed) = Message::parse(&header, &bytes[OFP_HEADER_LENGTH..]).unwrap();
        assert_eq!(xid, TEST_XID);
        parsed
    }

    fn assert_round_trip(message: Message) {
        assert_eq!(round_trip(message.clone()), message);
    }

    fn packet_data() -> Vec<u8> {
        vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10]
    }

    fn port_desc() -> PortDesc {
        PortDesc {
            port_no: 3,
            hw_addr: 0xaabbccddeeff,
            name: "port_3".to_string(),
            config: PortConfig {
                down: false,
                no_recv: false,
                no_fwd: false,
                no_packet_in: false,
            },
            state: PortState {
                link_down: false,
                blocked: false,
                live: true,
            },
            curr: 0x840,
            advertised: 0,
            supported: 0,
            peer: 0,
            curr_speed: 10_000_000,
            max_speed: 10_000_000,
        }
    }

    fn flow_mod_pattern() -> Match {
        Match {
            in_port: Some(1),
            metadata: Some(Mask {
                value: 0x10,
                mask: Some(0x1ffe),
            }),
            eth_type: Some(0x0800),
            vlan_vid: Some(Mask {
                value: 0x1042,
                mask: None,
            }),
        }
    }

    fn flow_mod() -> FlowMod {
        FlowMod {
            priority: 20,
            table_id: 2,
            cookie: 0x1234567887654321,
            pattern: flow_mod_pattern(),
            instructions: vec![
                Instruction::ApplyActions(vec![Action::PopVlan]),
                Instruction::WriteMetadata {
                    metadata: 0x22,
                    mask: 0x3e,
                },
                Instruction::WriteActions(vec![
                    Action::PushVlan(0x8100),
                    Action::SetVlanVid {
                        vid: 0x1042,
                        mask: None,
                    },
                    Action::output(7),
                ]),
                Instruction::GotoTable(4),
            ],
            ..FlowMod::new(FlowModCmd::AddFlow)
        }
    }

    #[test]
    fn test_hello_round_trip() {
        assert_round_trip(Message::Hello);
    }

    #[test]
    fn test_echo_round_trip() {
        assert_round_trip(Message::EchoRequest(vec![0xab; 5]));
        assert_round_trip(Message::EchoReply(vec![0xcd; 3]));
    }

    #[test]
    fn test_barrier_round_trip() {
        assert_round_trip(Message::BarrierRequest);
        assert_round_trip(Message::BarrierReply);
    }

    #[test]
    fn test_error_round_trip() {
        assert_round_trip(Message::Error(ErrorMsg::bad_instruction(
            BadInstructionCode::UnsupMetadataMask,
            vec![0xab; 12],
        )));
    }

    #[test]
    fn test_features_round_trip() {
        assert_round_trip(Message::FeaturesReq);
        assert_round_trip(Message::FeaturesReply(SwitchFeatures {
            datapath_id: TEST_DPID,
            num_buffers: 256,
            num_tables: 254,
            auxiliary_id: 0,
            supported_capabilities: Capabilities {
                flow_stats: true,
                table_stats: true,
                port_stats: true,
                group_stats: true,
                ip_reasm: false,
                queue_stats: false,
                port_blocked: true,
            },
        }));
    }

    #[test]
    fn test_switch_config_round_trip() {
        assert_round_trip(Message::GetConfigReq);
        assert_round_trip(Message::GetConfigReply(SwitchConfig {
            flags: 0,
            miss_send_len: OFPCML_NO_BUFFER,
        }));
        assert_round_trip(Message::SetConfig(SwitchConfig {
            flags: 1,
            miss_send_len: 128,
        }));
    }

    #[test]
    fn test_flow_mod_round_trip() {
        assert_round_trip(Message::FlowMod(flow_mod()));
    }

    #[test]
    fn test_flow_mod_wire_size() {
        let bytes = Message::marshal(TEST_XID, Message::FlowMod(flow_mod())).unwrap();
        // Everything in a flow mod is 8-byte aligned.
        assert_eq!(bytes.len() % 8, 0);
    }

    #[test]
    fn test_flow_mod_with_raw_instruction_round_trip() {
        let fm = FlowMod {
            instructions: vec![Instruction::Other {
                instruction_type: 0xffff,
                body: vec![0; 12],
            }],
            ..FlowMod::new(FlowModCmd::AddFlow)
        };
        assert_round_trip(Message::FlowMod(fm));
    }

    #[test]
    fn test_masked_set_field_round_trip() {
        let fm = FlowMod {
            instructions: vec![Instruction::WriteActions(vec![Action::SetVlanVid {
                vid: 0x0fc0,
                mask: Some(0x0fc0),
            }])],
            ..FlowMod::new(FlowModCmd::AddFlow)
        };
        assert_round_trip(Message::FlowMod(fm));
    }

    #[test]
    fn test_group_mod_round_trip() {
        assert_round_trip(Message::GroupMod(GroupMod {
            command: GroupModCmd::Add,
            group_type: GroupType::Indirect,
            group_id: 5,
            buckets: vec![Bucket::indirect(vec![
                Action::PushVlan(0x8100),
                Action::SetVlanVid {
                    vid: 0x1fc1,
                    mask: None,
                },
                Action::output(2),
            ])],
        }));
    }

    #[test]
    fn test_meter_mod_round_trip() {
        assert_round_trip(Message::MeterMod(MeterMod {
            command: MeterModCmd::Add,
            flags: OFPMF_PKTPS,
            meter_id: 1,
            bands: vec![MeterBand::Drop {
                rate: 1000,
                burst_size: 0,
            }],
        }));
    }

    #[test]
    fn test_packet_in_round_trip() {
        assert_round_trip(Message::PacketIn(PacketIn {
            total_len: 10,
            reason: PacketInReason::Action,
            table_id: 0,
            cookie: 1,
            pattern: Match {
                in_port: Some(4),
                ..Match::match_all()
            },
            payload: Payload::NotBuffered(packet_data()),
        }));
    }

    #[test]
    fn test_packet_out_round_trip() {
        assert_round_trip(Message::PacketOut(PacketOut {
            payload: Payload::NotBuffered(packet_data()),
            in_port: OfpPort::OFPPController as u32,
            actions: vec![Action::output(2)],
        }));
    }

    #[test]
    fn test_port_status_round_trip() {
        assert_round_trip(Message::PortStatus(PortStatus {
            reason: PortReason::PortAdd,
            desc: port_desc(),
        }));
    }

    #[test]
    fn test_flow_removed_round_trip() {
        assert_round_trip(Message::FlowRemoved(FlowRemoved {
            cookie: 7,
            priority: 20,
            reason: FlowRemovedReason::IdleTimeout,
            table_id: 3,
            duration_sec: 100,
            duration_nsec: 5000,
            idle_timeout: 60,
            hard_timeout: 0,
            packet_count: 12,
            byte_count: 3400,
            pattern: flow_mod_pattern(),
        }));
    }

    #[test]
    fn test_multipart_round_trip() {
        assert_round_trip(Message::MultipartReq(MultipartReq {
            flags: 0,
            body: MultipartReqBody::PortDesc,
        }));
        assert_round_trip(Message::MultipartReply(MultipartResp {
            flags: 0,
            body: MultipartRespBody::PortDesc(vec![port_desc()]),
        }));
        assert_round_trip(Message::MultipartReply(MultipartResp {
            flags: 0,
            body: MultipartRespBody::GroupFeatures(GroupFeatures {
                types: 0b1111,
                capabilities: 0,
                max_groups: [16, 0, 16, 0],
                actions: [0; 4],
            }),
        }));
        assert_round_trip(Message::MultipartReply(MultipartResp {
            flags: 0,
            body: MultipartRespBody::MeterFeatures(MeterFeatures {
                max_meter: 64,
                band_types: 1 << OFPMBT_DROP as u32,
                capabilities: 0,
                max_bands: 4,
                max_color: 0,
            }),
        }));
    }

    #[test]
    fn test_multipart_desc_round_trip() {
        assert_round_trip(Message::MultipartReply(MultipartResp {
            flags: 0,
            body: MultipartRespBody::Desc {
                manufacturer: "ofvisor".to_string(),
                hardware: "virtual".to_string(),
                software: "0.1.0".to_string(),
                serial_number: "none".to_string(),
                datapath: "tenant datapath".to_string(),
            },
        }));
    }

    #[test]
    fn test_parse_skips_unknown_oxm_field() {
        // in_port plus an eth_src (field 4, 6 bytes) entry the hypervisor
        // does not model.
        let mut body = vec![];
        body.extend_from_slice(&1u16.to_be_bytes());
        let oxm_len: usize = 4 + (4 + 4) + (4 + 6);
        body.extend_from_slice(&(oxm_len as u16).to_be_bytes());
        body.extend_from_slice(&0x8000u16.to_be_bytes());
        body.push(OFPXMT_OFB_IN_PORT << 1);
        body.push(4);
        body.extend_from_slice(&7u32.to_be_bytes());
        body.extend_from_slice(&0x8000u16.to_be_bytes());
        body.push(4 << 1);
        body.push(6);
        body.extend_from_slice(&[0; 6]);
        let pad = (8 - oxm_len % 8) % 8;
        body.extend_from_slice(&vec![0; pad]);

        let mut cursor = Cursor::new(body);
        let m = Match0x04::parse(&mut cursor).unwrap();
        assert_eq!(m.in_port, Some(7));
        assert_eq!(m.eth_type, None);
    }

    #[test]
    fn test_unknown_message_code_is_unsupported() {
        let header = OfpHeader::new(OPENFLOW_0_04_VERSION, MsgCode::RoleReq as u8, 8, TEST_XID);
        let (_, message) = Message::parse(&header, &[]).unwrap();
        assert_eq!(
            message,
            Message::Unsupported {
                code: MsgCode::RoleReq
            }
        );
    }
}
