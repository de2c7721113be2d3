use super::Error as ProtocolError;
use super::{ProtocolStatus, RecordHeader, RecordType, RequestFlags, Role};


/// Frames a fixed-size record body with its header. The body length is a
/// multiple of 8, so the record needs no padding.
fn framed(rtype: RecordType, request_id: u16, body: [u8; 8]) -> [u8; 16] {
    let head = RecordHeader::for_content(rtype, request_id, 8);
    let mut buf = [0; 16];
    buf[..RecordHeader::LEN].copy_from_slice(&head.to_bytes());
    buf[RecordHeader::LEN..].copy_from_slice(&body);
    buf
}


/// Tells the web server that a record type is not understood.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnknownType {
    /// The unsupported type code.
    pub rtype: u8,
}

impl UnknownType {
    pub const LEN: usize = 8;

    #[inline]
    #[must_use]
    pub fn from_bytes([rtype, ..]: [u8; Self::LEN]) -> Self {
        Self { rtype }
    }

    #[inline]
    #[must_use]
    pub fn to_bytes(self) -> [u8; Self::LEN] {
        [self.rtype, 0, 0, 0, 0, 0, 0, 0]
    }
}


/// Opens a request: the role to play and whether to keep the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BeginRequest {
    pub role: Role,
    pub flags: RequestFlags,
}

impl BeginRequest {
    pub const LEN: usize = 8;

    /// Decodes the role and flags, ignoring reserved bytes.
    ///
    /// # Errors
    /// Returns [`ProtocolError::UnknownRole`] for role codes outside of
    /// [`Role`].
    pub fn from_bytes([role_hi, role_lo, flags, ..]: [u8; Self::LEN]) -> Result<Self, ProtocolError> {
        let role = Role::try_from(u16::from_be_bytes([role_hi, role_lo]))?;
        Ok(Self { role, flags: flags.into() })
    }

    #[must_use]
    pub fn to_bytes(self) -> [u8; Self::LEN] {
        let [role_hi, role_lo] = u16::from(self.role).to_be_bytes();
        [role_hi, role_lo, self.flags.into(), 0, 0, 0, 0, 0]
    }

    /// Tests whether the client wants to reuse the connection afterwards.
    #[inline]
    #[must_use]
    pub fn keep_conn(self) -> bool {
        self.flags.contains(RequestFlags::KeepConn)
    }
}


/// Closes a request with its final status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndRequest {
    /// The script's status, comparable to a CGI program's exit code.
    pub app_status: u32,
    pub protocol_status: ProtocolStatus,
}

impl EndRequest {
    pub const LEN: usize = 8;

    /// # Errors
    /// Returns [`ProtocolError::UnknownStatus`] for an invalid protocol
    /// status byte.
    pub fn from_bytes([a0, a1, a2, a3, status, ..]: [u8; Self::LEN]) -> Result<Self, ProtocolError> {
        Ok(Self {
            app_status: u32::from_be_bytes([a0, a1, a2, a3]),
            protocol_status: status.try_into()?,
        })
    }

    #[must_use]
    pub fn to_bytes(self) -> [u8; Self::LEN] {
        let [a0, a1, a2, a3] = self.app_status.to_be_bytes();
        [a0, a1, a2, a3, self.protocol_status.into(), 0, 0, 0]
    }

    #[inline]
    #[must_use]
    pub fn to_record(self, request_id: u16) -> [u8; 16] {
        framed(RecordType::EndRequest, request_id, self.to_bytes())
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn end_request_wire() {
        let end = EndRequest { app_status: 0x0102_0304, protocol_status: ProtocolStatus::Overloaded };
        assert_eq!(&end.to_record(0x1234), b"\x01\x03\x12\x34\x00\x08\0\0\x01\x02\x03\x04\x02\0\0\0");
        assert_eq!(EndRequest::from_bytes(end.to_bytes()), Ok(end));
        assert!(matches!(EndRequest::from_bytes([0, 0, 0, 0, 9, 0, 0, 0]), Err(ProtocolError::UnknownStatus(9))));
    }

    #[test]
    fn unknown_type_wire() {
        let unk = UnknownType { rtype: 0xa7 };
        let mut buf = Vec::new();
        assert_eq!(crate::protocol::ResponseRecord::UnknownType(unk).encode(0, &mut buf), Ok(()));
        assert_eq!(buf, b"\x01\x0b\0\0\x00\x08\0\0\xa7\0\0\0\0\0\0\0");
        assert_eq!(UnknownType::from_bytes(unk.to_bytes()), unk);
    }

    #[test]
    fn begin_request_wire() -> Result<(), ProtocolError> {
        const RAW: [u8; 8] = [0x00, 0x01, 0xfd, 0, 0, 0, 0, 0];
        let begin = BeginRequest::from_bytes(RAW)?;
        assert_eq!(begin.role, Role::Responder);
        assert!(begin.keep_conn());

        const FILTER: [u8; 8] = [0x00, 0x03, 0x00, 0, 0, 0, 0, 0];
        let begin = BeginRequest::from_bytes(FILTER)?;
        assert_eq!(begin.role, Role::Filter);
        assert!(!begin.keep_conn());
        assert_eq!(begin.to_bytes(), FILTER);

        let bad = BeginRequest::from_bytes([0x6e, 0xc4, 0x01, 0, 0, 0, 0, 0]);
        assert!(matches!(bad, Err(ProtocolError::UnknownRole(0x6ec4))));
        Ok(())
    }
}
