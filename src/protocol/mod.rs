/// The fixed 8-byte record bodies.
pub mod body;
mod fields;
/// Name-value pair streams as used by `Params` and `GetValues`.
pub mod nv;
/// Complete FastCGI records and messages in both directions.
pub mod record;
pub mod varint;
mod vars;

pub use fields::*;
pub use record::{FrameHead, Message, RequestRecord, ResponseRecord};
pub use vars::*;


/// Management records carry this request ID.
pub const FCGI_NULL_REQUEST_ID: u16 = 0;

/// The largest payload put into a single outgoing stream record.
///
/// Together with the header this makes for 8 KiB frames that never
/// need padding.
pub const MAX_STREAM_PAYLOAD: usize = 8184;


/// Everything that can be wrong with FastCGI bytes on the wire.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("unsupported FastCGI version {0}")]
    UnknownVersion(u8),
    #[error("invalid FastCGI record type {0}")]
    UnknownRecordType(u8),
    #[error("invalid FastCGI role {0}")]
    UnknownRole(u16),
    #[error("invalid FastCGI protocol status {0}")]
    UnknownStatus(u8),
    /// A `GetValues` query named a variable this crate does not know.
    #[error("unknown FastCGI management variable")]
    UnknownVariable,
    /// A name or value is longer than a length prefix can express.
    #[error("length exceeds the FastCGI name-value limit")]
    InvalidVarInt,

    /// Fewer than [`RecordHeader::LEN`] bytes were available for a header.
    #[error("FastCGI record header truncated after {0} bytes")]
    TruncatedHeader(usize),
    /// The record body (content and padding) ended early.
    #[error("FastCGI record body truncated: expected {expected} bytes, got {actual}")]
    TruncatedBody {
        /// Declared content plus padding length.
        expected: usize,
        /// Number of bytes actually available.
        actual: usize,
    },
    /// A record type that only a FastCGI application may send was received
    /// from the client.
    #[error("FastCGI record type {0:?} cannot be sent by a client")]
    ResponseOnly(RecordType),
    /// A record type that only a FastCGI client may send was decoded as
    /// application output.
    #[error("FastCGI record type {0:?} cannot be sent by an application")]
    RequestOnly(RecordType),
    /// A fixed-size record body has the wrong length.
    #[error("FastCGI {rtype:?} record has invalid length {len}")]
    InvalidBodyLength {
        /// The type of the offending record.
        rtype: RecordType,
        /// The declared content length.
        len: u16,
    },
    /// A record payload exceeds the 16-bit content length field.
    #[error("FastCGI record payload of {0} bytes exceeds the maximum of 65535")]
    PayloadTooLarge(usize),
}


/// The fixed-size header in front of every FastCGI record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecordHeader {
    /// The FastCGI version of this record.
    pub version: Version,
    /// The type of this record, defining its payload.
    pub rtype: RecordType,
    /// The ID of the request this record belongs to.
    pub request_id: u16,
    /// The length of this record's payload.
    pub content_length: u16,
    /// The amount of padding following the payload.
    pub padding_length: u8,
}

impl RecordHeader {
    /// The number of bytes in the wire format of a [`RecordHeader`].
    pub const LEN: usize = 8;

    /// Creates the header of a version 1 record carrying `content_length`
    /// bytes, padded up to the next multiple of 8.
    #[inline]
    #[must_use]
    pub fn for_content(rtype: RecordType, request_id: u16, content_length: u16) -> Self {
        Self {
            version: Version::V1,
            rtype,
            request_id,
            content_length,
            padding_length: padding_for(content_length),
        }
    }

    /// Parses a FastCGI [`RecordHeader`].
    ///
    /// # Errors
    /// Fails on an unknown version or record type. See [`FrameHead`] for a
    /// header which accepts unknown record types.
    pub fn from_bytes(data: [u8; Self::LEN]) -> Result<Self, Error> {
        let head = FrameHead::from_bytes(data)?;
        Ok(Self {
            version: Version::V1,
            rtype: head.rtype.map_err(Error::UnknownRecordType)?,
            request_id: head.request_id,
            content_length: head.content_length,
            padding_length: head.padding_length,
        })
    }

    /// Encodes the [`RecordHeader`] into its wire format. The reserved
    /// last byte is zero.
    #[must_use]
    pub fn to_bytes(self) -> [u8; Self::LEN] {
        let [id_hi, id_lo] = self.request_id.to_be_bytes();
        let [len_hi, len_lo] = self.content_length.to_be_bytes();
        [self.version.into(), self.rtype.into(), id_hi, id_lo, len_hi, len_lo, self.padding_length, 0]
    }
}

/// Returns the padding `(8 - len % 8) % 8` that aligns a record body of
/// `content_length` bytes to 8 bytes.
#[inline]
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub const fn padding_for(content_length: u16) -> u8 {
    (content_length.wrapping_neg() % 8) as u8
}
