use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

use crate::ofp_message::OfpSerializationError;
use crate::openflow::MsgCode;

pub const OFP_HEADER_LENGTH: usize = 8;

pub type Xid = u32;

pub const OPENFLOW_0_04_VERSION: u8 = 4; // 1.3

/// OpenFlow Header
///
/// The first fields of every OpenFlow message, no matter the protocol version.
/// This is parsed to determine version and length of the remaining message, so that
/// it can be properly handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OfpHeader {
    version: u8,
    typ: u8,
    length: u16,
    xid: u32,
}

impl OfpHeader {
    /// Create an `OfpHeader` out of the arguments.
    pub fn new(version: u8, typ: u8, length: u16, xid: u32) -> OfpHeader {
        OfpHeader {
            version,
            typ,
            length,
            xid,
        }
    }

    /// Return the byte-size of an `OfpHeader`.
    pub fn size() -> usize {
        OFP_HEADER_LENGTH
    }

    /// Fills a message buffer with the header fields of an `OfpHeader`.
    pub fn marshal(bytes: &mut Vec<u8>, header: OfpHeader) {
        bytes.write_u8(header.version()).unwrap();
        bytes.write_u8(header.typ).unwrap();
        bytes.write_u16::<BigEndian>(header.length as u16).unwrap();
        bytes.write_u32::<BigEndian>(header.xid()).unwrap();
    }

    /// Takes a message buffer (sized for an `OfpHeader`) and returns an `OfpHeader`.
    pub fn parse(buf: &[u8]) -> Result<Self, OfpSerializationError> {
        let mut bytes = Cursor::new(buf);
        Ok(OfpHeader {
            version: bytes.read_u8()?,
            typ: bytes.read_u8()?,
            length: bytes.read_u16::<BigEndian>()?,
            xid: bytes.read_u32::<BigEndian>()?,
        })
    }

    /// Return the `version` field of a header.
    pub fn version(&self) -> u8 {
        self.version
    }

    /// Return the OpenFlow message type code of a header.
    pub fn type_code(&self) -> Result<MsgCode, OfpSerializationError> {
        MsgCode::of_u8(self.typ).ok_or_else(|| OfpSerializationError::UnexpectedValueError {
            value: format!("0x{:x}", self.typ),
            field: "type".to_string(),
            message: "message header".to_string(),
        })
    }

    /// Return the `length` field of a header. Includes the length of the header itself.
    pub fn length(&self) -> usize {
        self.length as usize
    }

    /// Return the `xid` field of a header, the transaction id associated with this packet.
    /// Replies use the same id to facilitate pairing.
    pub fn xid(&self) -> Xid {
        self.xid
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_round_trip() {
        let header = OfpHeader::new(OPENFLOW_0_04_VERSION, 14, 72, 0x12345678);
        let mut bytes = vec![];
        OfpHeader::marshal(&mut bytes, header);
        assert_eq!(bytes.len(), OFP_HEADER_LENGTH);

        let parsed = OfpHeader::parse(&bytes).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(parsed.type_code().unwrap(), MsgCode::FlowMod);
        assert_eq!(parsed.length(), 72);
        assert_eq!(parsed.xid(), 0x12345678);
    }

    #[test]
    fn test_header_rejects_unknown_type() {
        let bytes = [4u8, 0x77, 0, 8, 0, 0, 0, 1];
        let header = OfpHeader::parse(&bytes).unwrap();
        assert!(header.type_code().is_err());
    }
}
