use std::fmt;

use super::Error as ProtocolError;


/// Implements the conversions between a fieldless wire enum and its
/// integer representation. Decoding fails with `$err` on unknown values.
macro_rules! wire_enum {
    ($name:ident: $repr:ty, $err:ident) => {
        impl TryFrom<$repr> for $name {
            type Error = ProtocolError;

            #[inline]
            fn try_from(v: $repr) -> Result<Self, Self::Error> {
                Self::from_repr(v.into()).ok_or(ProtocolError::$err(v))
            }
        }

        impl From<$name> for $repr {
            #[inline]
            fn from(v: $name) -> Self {
                v as Self
            }
        }
    };
}


/// The FastCGI protocol version. Only version 1 exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, strum::FromRepr)]
pub enum Version {
    #[allow(missing_docs)]
    V1 = 1,
}
wire_enum!(Version: u8, UnknownVersion);


/// The role a web server asks the application to play for a request.
///
/// Every role is run like a [`Role::Responder`]. Codes outside this enum
/// are answered with an unknown role status.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, strum::FromRepr)]
#[cfg_attr(test, derive(strum::EnumIter))]
pub enum Role {
    Responder = 1,
    Authorizer = 2,
    Filter = 3,
}
wire_enum!(Role: u16, UnknownRole);


bitflags::bitflags! {
    /// The flags byte of a begin request record.
    #[derive(Default, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct RequestFlags: u8 {
        /// The web server wants to reuse the connection after this request.
        const KeepConn = 1;
    }
}

impl From<u8> for RequestFlags {
    /// Reserved bits are ignored.
    #[inline]
    fn from(v: u8) -> Self {
        Self::from_bits_truncate(v)
    }
}

impl From<RequestFlags> for u8 {
    #[inline]
    fn from(v: RequestFlags) -> Self {
        v.bits()
    }
}

impl fmt::Debug for RequestFlags {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.contains(Self::KeepConn) {
            f.write_str("RequestFlags(KeepConn)")
        } else {
            f.write_str("RequestFlags()")
        }
    }
}


/// How a request ended from the protocol's point of view, as opposed to
/// the application's exit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, strum::FromRepr)]
#[cfg_attr(test, derive(strum::EnumIter))]
pub enum ProtocolStatus {
    /// The request ran to completion.
    RequestComplete = 0,
    /// The application serves one request per connection only.
    CantMpxConn = 1,
    /// The application ran out of request capacity.
    Overloaded = 2,
    /// The requested role is not supported.
    UnknownRole = 3,
}
wire_enum!(ProtocolStatus: u8, UnknownStatus);


/// The type code in a record header. It determines the layout of the
/// record's content.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, strum::FromRepr)]
#[cfg_attr(test, derive(strum::EnumIter))]
pub enum RecordType {
    BeginRequest = 1,
    AbortRequest = 2,
    EndRequest = 3,
    Params = 4,
    Stdin = 5,
    Stdout = 6,
    Stderr = 7,
    Data = 8,
    GetValues = 9,
    GetValuesResult = 10,
    Unknown = 11,
}
wire_enum!(RecordType: u8, UnknownRecordType);


#[cfg(test)]
mod tests {
    use strum::IntoEnumIterator;
    use super::*;

    #[test]
    fn flags() {
        assert_eq!(RequestFlags::from(0x01), RequestFlags::KeepConn);
        assert_eq!(RequestFlags::from(0xff), RequestFlags::KeepConn);
        assert_eq!(RequestFlags::from(0xfe), RequestFlags::empty());
        assert_eq!(format!("{:?}", RequestFlags::from(0x03)), "RequestFlags(KeepConn)");
    }

    #[test]
    fn type_codes() -> Result<(), ProtocolError> {
        for (code, rtype) in (1..).zip(RecordType::iter()) {
            assert_eq!(u8::from(rtype), code);
            assert_eq!(RecordType::try_from(code)?, rtype);
        }
        assert!(matches!(RecordType::try_from(0), Err(ProtocolError::UnknownRecordType(0))));
        assert!(matches!(RecordType::try_from(12), Err(ProtocolError::UnknownRecordType(12))));
        Ok(())
    }

    #[test]
    fn role_codes() -> Result<(), ProtocolError> {
        for role in Role::iter() {
            assert_eq!(Role::try_from(u16::from(role))?, role);
        }
        assert!(matches!(Role::try_from(0), Err(ProtocolError::UnknownRole(0))));
        assert!(matches!(Role::try_from(4), Err(ProtocolError::UnknownRole(4))));
        Ok(())
    }

    #[test]
    fn status_codes() {
        let codes: Vec<u8> = ProtocolStatus::iter().map(u8::from).collect();
        assert_eq!(codes, [0, 1, 2, 3]);
        assert!(matches!(ProtocolStatus::try_from(4), Err(ProtocolError::UnknownStatus(4))));
    }
}
