use std::io;

use thiserror::Error;

use crate::ofp_header::{OfpHeader, Xid};
use crate::openflow::MsgCode;

#[derive(Debug, Error)]
pub enum OfpSerializationError {
    #[error("IO Error: {0}")]
    IoError(#[from] io::Error),
    #[error("Unexpected value '{value}' at field '{field}' of '{message}'")]
    UnexpectedValueError {
        value: String,
        field: String,
        message: String,
    },
    #[error("Feature not implemented in version {version}: {feature}")]
    UnimplementedFeatureInVersion { version: u8, feature: String },
    #[error("Unsupported message code {code} in version {version}")]
    UnsupportedMessageCode { version: u8, code: MsgCode },
    #[error("Unsupported OpenFlow version {version}")]
    UnsupportedVersion { version: u8 },
}

/// OpenFlow Message
///
/// Version-agnostic API for handling OpenFlow messages at the byte-buffer level.
pub trait OfpMessage {
    /// Return the byte-size of an `OfpMessage`.
    fn size_of(msg: &Self) -> Result<usize, OfpSerializationError>;
    /// Create an `OfpHeader` for the given transaction id and OpenFlow message.
    fn header_of(xid: Xid, msg: &Self) -> Result<OfpHeader, OfpSerializationError>;
    /// Return a marshaled buffer containing an OpenFlow header and the message `msg`.
    fn marshal(xid: Xid, msg: Self) -> Result<Vec<u8>, OfpSerializationError>;
    /// Returns a pair `(Xid, OfpMessage)` of the transaction id and OpenFlow message parsed from
    /// the given OpenFlow header `header`, and buffer `buf`.
    fn parse(header: &OfpHeader, buf: &[u8]) -> Result<(Xid, Self), OfpSerializationError>
    where
        Self: Sized;
}
