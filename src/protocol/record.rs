use super::body::{BeginRequest, EndRequest, UnknownType};
use super::Error as ProtocolError;
use super::{RecordHeader, RecordType, Version};


/// A decoded record header whose type code may be unrecognized.
///
/// Unlike [`RecordHeader`], an unknown type code does not fail decoding. The
/// record body still has to be skipped, and the peer answered with an
/// [`UnknownType`] record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHead {
    /// The record type, or the raw type code if it is unrecognized.
    pub rtype: Result<RecordType, u8>,
    /// The ID of the request this record belongs to.
    pub request_id: u16,
    /// The length of this record's payload.
    pub content_length: u16,
    /// The amount of padding following the payload.
    pub padding_length: u8,
}

impl FrameHead {
    /// Parses a record header, tolerating unknown record types.
    ///
    /// # Errors
    /// Returns [`ProtocolError::UnknownVersion`] unless the version is 1.
    pub fn from_bytes(data: [u8; RecordHeader::LEN]) -> Result<Self, ProtocolError> {
        Version::try_from(data[0])?;
        Ok(Self {
            rtype: RecordType::try_from(data[1]).map_err(|_| data[1]),
            request_id: u16::from_be_bytes([data[2], data[3]]),
            content_length: u16::from_be_bytes([data[4], data[5]]),
            padding_length: data[6],
        })
    }

    /// Returns the number of bytes following the header, content and
    /// padding combined.
    #[inline]
    #[must_use]
    pub fn body_len(&self) -> usize {
        usize::from(self.content_length) + usize::from(self.padding_length)
    }
}


/// A record sent from the FastCGI client to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestRecord {
    /// Starts a new request.
    BeginRequest(BeginRequest),
    /// A [`RecordType::BeginRequest`] with a role outside of
    /// [`Role`](super::Role). The request must be rejected.
    BeginUnknownRole(u16),
    /// Aborts a request.
    AbortRequest,
    /// A fragment of the encoded request parameters. Empty at stream end.
    Params(Vec<u8>),
    /// A fragment of the request body. Empty at stream end.
    Stdin(Vec<u8>),
    /// A fragment of the filter data stream. Empty at stream end.
    Data(Vec<u8>),
    /// A query for protocol variables, encoded as name-value pairs.
    GetValues(Vec<u8>),
    /// A record with an unrecognized type code. Its body is discarded.
    Unrecognized(u8),
}

impl RequestRecord {
    /// Interprets `content` as the body of a record described by `head`.
    ///
    /// # Errors
    /// Records only an application may send fail with
    /// [`ProtocolError::ResponseOnly`]. A [`RecordType::BeginRequest`] body
    /// of the wrong size fails with [`ProtocolError::InvalidBodyLength`].
    pub fn decode(head: &FrameHead, content: Vec<u8>) -> Result<Self, ProtocolError> {
        let rtype = match head.rtype {
            Ok(t) => t,
            Err(code) => return Ok(Self::Unrecognized(code)),
        };

        Ok(match rtype {
            RecordType::BeginRequest => {
                let Ok(arr) = <[u8; BeginRequest::LEN]>::try_from(&content[..]) else {
                    return Err(ProtocolError::InvalidBodyLength { rtype, len: head.content_length });
                };
                match BeginRequest::from_bytes(arr) {
                    Ok(b) => Self::BeginRequest(b),
                    Err(ProtocolError::UnknownRole(role)) => Self::BeginUnknownRole(role),
                    Err(e) => return Err(e),
                }
            },
            RecordType::AbortRequest => Self::AbortRequest,
            RecordType::Params => Self::Params(content),
            RecordType::Stdin => Self::Stdin(content),
            RecordType::Data => Self::Data(content),
            RecordType::GetValues => Self::GetValues(content),
            t => return Err(ProtocolError::ResponseOnly(t)),
        })
    }

    /// Returns the wire type code of this record.
    #[must_use]
    pub fn type_code(&self) -> u8 {
        match self {
            Self::BeginRequest(_) | Self::BeginUnknownRole(_) => RecordType::BeginRequest.into(),
            Self::AbortRequest => RecordType::AbortRequest.into(),
            Self::Params(_) => RecordType::Params.into(),
            Self::Stdin(_) => RecordType::Stdin.into(),
            Self::Data(_) => RecordType::Data.into(),
            Self::GetValues(_) => RecordType::GetValues.into(),
            Self::Unrecognized(code) => *code,
        }
    }

    /// Encodes the record as a FastCGI client would send it.
    ///
    /// # Errors
    /// Returns [`ProtocolError::PayloadTooLarge`] if the body does not fit
    /// into a single record.
    pub fn encode(&self, request_id: u16, out: &mut Vec<u8>) -> Result<(), ProtocolError> {
        let mut begin = [0; BeginRequest::LEN];
        let content: &[u8] = match self {
            Self::BeginRequest(b) => {
                begin = b.to_bytes();
                &begin
            },
            Self::BeginUnknownRole(role) => {
                begin[..2].copy_from_slice(&role.to_be_bytes());
                &begin
            },
            Self::AbortRequest | Self::Unrecognized(_) => &[],
            Self::Params(b) | Self::Stdin(b) | Self::Data(b) | Self::GetValues(b) => b,
        };
        frame(self.type_code(), request_id, content, out)
    }
}


/// A record sent from the application to the FastCGI client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseRecord {
    /// Completes a request.
    EndRequest(EndRequest),
    /// A fragment of the response body. Empty at stream end.
    Stdout(Vec<u8>),
    /// A fragment of the diagnostic output. Empty at stream end.
    Stderr(Vec<u8>),
    /// The answer to a [`RequestRecord::GetValues`] query.
    GetValuesResult(Vec<u8>),
    /// Reports an unrecognized record type back to the client.
    UnknownType(UnknownType),
}

impl ResponseRecord {
    /// Returns the [`RecordType`] of this record.
    #[must_use]
    pub fn rtype(&self) -> RecordType {
        match self {
            Self::EndRequest(_) => RecordType::EndRequest,
            Self::Stdout(_) => RecordType::Stdout,
            Self::Stderr(_) => RecordType::Stderr,
            Self::GetValuesResult(_) => RecordType::GetValuesResult,
            Self::UnknownType(_) => RecordType::Unknown,
        }
    }

    /// Appends the complete wire format of this record to `out`: header,
    /// content and zero padding up to the next multiple of 8 bytes.
    ///
    /// # Errors
    /// Returns [`ProtocolError::PayloadTooLarge`] if the body exceeds 65535
    /// bytes. Nothing is appended in that case.
    pub fn encode(&self, request_id: u16, out: &mut Vec<u8>) -> Result<(), ProtocolError> {
        match self {
            Self::EndRequest(b) => out.extend_from_slice(&b.to_record(request_id)),
            Self::UnknownType(b) => {
                frame(RecordType::Unknown.into(), request_id, &b.to_bytes(), out)?;
            },
            Self::Stdout(b) | Self::Stderr(b) | Self::GetValuesResult(b) => {
                frame(self.rtype().into(), request_id, b, out)?;
            },
        }
        Ok(())
    }

    /// Interprets `content` as the body of a record described by `head`,
    /// as a FastCGI client would.
    ///
    /// # Errors
    /// Records only a client may send fail with [`ProtocolError::RequestOnly`],
    /// unknown types with [`ProtocolError::UnknownRecordType`]. Fixed-size
    /// bodies of the wrong size fail with [`ProtocolError::InvalidBodyLength`].
    pub fn decode(head: &FrameHead, content: &[u8]) -> Result<Self, ProtocolError> {
        let rtype = head.rtype.map_err(ProtocolError::UnknownRecordType)?;
        let invalid = || ProtocolError::InvalidBodyLength { rtype, len: head.content_length };

        Ok(match rtype {
            RecordType::EndRequest => {
                let arr = <[u8; EndRequest::LEN]>::try_from(content).map_err(|_| invalid())?;
                Self::EndRequest(EndRequest::from_bytes(arr)?)
            },
            RecordType::Unknown => {
                let arr = <[u8; UnknownType::LEN]>::try_from(content).map_err(|_| invalid())?;
                Self::UnknownType(UnknownType::from_bytes(arr))
            },
            RecordType::Stdout => Self::Stdout(content.to_vec()),
            RecordType::Stderr => Self::Stderr(content.to_vec()),
            RecordType::GetValuesResult => Self::GetValuesResult(content.to_vec()),
            t => return Err(ProtocolError::RequestOnly(t)),
        })
    }
}


/// A record together with the request it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message<R> {
    /// The request ID. 0 addresses the application itself.
    pub request_id: u16,
    /// The record carried by this message.
    pub record: R,
}

impl<R> Message<R> {
    /// Tests whether this message is a management message.
    #[inline]
    #[must_use]
    pub fn is_management(&self) -> bool {
        self.request_id == super::FCGI_NULL_REQUEST_ID
    }
}

impl Message<RequestRecord> {
    /// Decodes the first message in `input`, returning it together with
    /// the number of bytes it occupied.
    ///
    /// Returns `Ok(None)` if `input` is empty.
    ///
    /// # Errors
    /// Fails if the header or body is truncated, or with any error from
    /// [`FrameHead::from_bytes`] and [`RequestRecord::decode`].
    pub fn decode(input: &[u8]) -> Result<Option<(Self, usize)>, ProtocolError> {
        let Some((head, content, used)) = split_frame(input)? else {
            return Ok(None);
        };
        let record = RequestRecord::decode(&head, content.to_vec())?;
        Ok(Some((Self { request_id: head.request_id, record }, used)))
    }
}

impl Message<ResponseRecord> {
    /// Decodes the first message in `input` as a FastCGI client would.
    ///
    /// Returns `Ok(None)` if `input` is empty.
    ///
    /// # Errors
    /// Fails if the header or body is truncated, or with any error from
    /// [`FrameHead::from_bytes`] and [`ResponseRecord::decode`].
    pub fn decode(input: &[u8]) -> Result<Option<(Self, usize)>, ProtocolError> {
        let Some((head, content, used)) = split_frame(input)? else {
            return Ok(None);
        };
        let record = ResponseRecord::decode(&head, content)?;
        Ok(Some((Self { request_id: head.request_id, record }, used)))
    }

    /// Appends the wire format of this message to `out`.
    ///
    /// # Errors
    /// See [`ResponseRecord::encode`].
    #[inline]
    pub fn encode(&self, out: &mut Vec<u8>) -> Result<(), ProtocolError> {
        self.record.encode(self.request_id, out)
    }
}


/// Splits the first record off `input`, returning its header, its content
/// without padding and the total number of bytes used.
fn split_frame(input: &[u8]) -> Result<Option<(FrameHead, &[u8], usize)>, ProtocolError> {
    if input.is_empty() {
        return Ok(None);
    }
    let Some(head) = input.get(..RecordHeader::LEN).and_then(|h| <[u8; RecordHeader::LEN]>::try_from(h).ok()) else {
        return Err(ProtocolError::TruncatedHeader(input.len()));
    };
    let head = FrameHead::from_bytes(head)?;

    let rest = &input[RecordHeader::LEN..];
    if rest.len() < head.body_len() {
        return Err(ProtocolError::TruncatedBody { expected: head.body_len(), actual: rest.len() });
    }
    let content = &rest[..head.content_length.into()];
    Ok(Some((head, content, RecordHeader::LEN + head.body_len())))
}

/// Appends a complete record with an arbitrary type code to `out`.
fn frame(rtype: u8, request_id: u16, content: &[u8], out: &mut Vec<u8>) -> Result<(), ProtocolError> {
    let len = u16::try_from(content.len())
        .map_err(|_| ProtocolError::PayloadTooLarge(content.len()))?;
    // RecordHeader cannot hold unknown type codes, so the type is patched in
    let head = RecordHeader::for_content(RecordType::Unknown, request_id, len);
    let mut bytes = head.to_bytes();
    bytes[1] = rtype;

    let padding = usize::from(head.padding_length);
    out.reserve(bytes.len() + content.len() + padding);
    out.extend_from_slice(&bytes);
    out.extend_from_slice(content);
    out.resize(out.len() + padding, 0);
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ProtocolStatus, RequestFlags, Role};

    fn decode_all(mut input: &[u8]) -> Result<Vec<Message<RequestRecord>>, ProtocolError> {
        let mut msgs = Vec::new();
        while let Some((msg, used)) = Message::<RequestRecord>::decode(input)? {
            msgs.push(msg);
            input = &input[used..];
        }
        Ok(msgs)
    }

    #[test]
    fn request_roundtrip() -> Result<(), ProtocolError> {
        let records = [
            RequestRecord::BeginRequest(BeginRequest { role: Role::Responder, flags: RequestFlags::KeepConn }),
            RequestRecord::Params(b"\x0b\x02SERVER_PORT80".to_vec()),
            RequestRecord::Params(Vec::new()),
            RequestRecord::Stdin(vec![0xa5; 1001]),
            RequestRecord::Stdin(Vec::new()),
            RequestRecord::Data(vec![7; 3]),
            RequestRecord::AbortRequest,
            RequestRecord::BeginUnknownRole(0x1234),
        ];
        let mut buf = Vec::new();
        for (i, rec) in records.iter().enumerate() {
            rec.encode(i as u16 + 1, &mut buf)?;
            assert_eq!(buf.len() % 8, 0, "{rec:?} is not 8-byte aligned");
        }

        let msgs = decode_all(&buf)?;
        assert_eq!(msgs.len(), records.len());
        for (i, (msg, rec)) in msgs.iter().zip(&records).enumerate() {
            assert_eq!(msg.request_id, i as u16 + 1);
            assert_eq!(&msg.record, rec);
        }
        Ok(())
    }

    #[test]
    fn response_wire() -> Result<(), ProtocolError> {
        let mut buf = Vec::new();
        ResponseRecord::Stdout(b"hello".to_vec()).encode(1, &mut buf)?;
        assert_eq!(buf, b"\x01\x06\x00\x01\x00\x05\x03\x00hello\0\0\0");

        buf.clear();
        ResponseRecord::Stderr(Vec::new()).encode(0x0102, &mut buf)?;
        assert_eq!(buf, b"\x01\x07\x01\x02\x00\x00\x00\x00");

        buf.clear();
        let end = EndRequest { app_status: 3, protocol_status: ProtocolStatus::RequestComplete };
        Message { request_id: 9, record: ResponseRecord::EndRequest(end) }.encode(&mut buf)?;
        let (msg, used) = Message::<ResponseRecord>::decode(&buf)?.expect("one message");
        assert_eq!(used, 16);
        assert_eq!(msg.request_id, 9);
        assert_eq!(msg.record, ResponseRecord::EndRequest(end));
        Ok(())
    }

    #[test]
    fn payload_limit() {
        let mut buf = Vec::new();
        let ok = ResponseRecord::Stdout(vec![0; usize::from(u16::MAX)]).encode(1, &mut buf);
        assert!(ok.is_ok());
        assert_eq!(buf.len(), 8 + 65535 + 1);

        buf.clear();
        let big = ResponseRecord::Stdout(vec![0; usize::from(u16::MAX) + 1]).encode(1, &mut buf);
        assert!(matches!(big, Err(ProtocolError::PayloadTooLarge(65536))));
        assert!(buf.is_empty());
    }

    #[test]
    fn unrecognized_type() -> Result<(), ProtocolError> {
        let mut buf = Vec::new();
        RequestRecord::Unrecognized(0x42).encode(3, &mut buf)?;
        // Unknown types keep whatever body they had
        buf[5] = 4;
        buf.extend_from_slice(b"junk\0\0\0\0");
        buf[6] = 4;
        RequestRecord::Stdin(Vec::new()).encode(3, &mut buf)?;

        let msgs = decode_all(&buf)?;
        assert_eq!(msgs[0].record, RequestRecord::Unrecognized(0x42));
        assert_eq!(msgs[1].record, RequestRecord::Stdin(Vec::new()));
        Ok(())
    }

    #[test]
    fn decode_errors() {
        // Clean end of input
        assert!(matches!(Message::<RequestRecord>::decode(&[]), Ok(None)));

        let hdr = b"\x01\x05\x00\x01\x00\x04\x04\x00";
        assert!(matches!(
            Message::<RequestRecord>::decode(&hdr[..5]),
            Err(ProtocolError::TruncatedHeader(5)),
        ));
        // Padding must be present too
        let short = [&hdr[..], &b"abcd\0\0"[..]].concat();
        assert!(matches!(
            Message::<RequestRecord>::decode(&short),
            Err(ProtocolError::TruncatedBody { expected: 8, actual: 6 }),
        ));

        let v2 = b"\x02\x05\x00\x01\x00\x00\x00\x00";
        assert!(matches!(Message::<RequestRecord>::decode(v2), Err(ProtocolError::UnknownVersion(2))));

        let stdout = b"\x01\x06\x00\x01\x00\x00\x00\x00";
        assert!(matches!(
            Message::<RequestRecord>::decode(stdout),
            Err(ProtocolError::ResponseOnly(RecordType::Stdout)),
        ));

        let begin = b"\x01\x01\x00\x01\x00\x04\x04\x00\x00\x01\x00\x00\0\0\0\0";
        assert!(matches!(
            Message::<RequestRecord>::decode(begin),
            Err(ProtocolError::InvalidBodyLength { rtype: RecordType::BeginRequest, len: 4 }),
        ));
    }
}
