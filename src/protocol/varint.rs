use super::Error as ProtocolError;


/// The length prefix of a FastCGI name or value.
///
/// Lengths up to 127 take a single byte. Longer ones take 4 bytes in big
/// endian order, with the top bit of the first byte set.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VarInt(u32);

impl VarInt {
    /// Marks the 4-byte encoding in the first byte.
    const WIDE: u8 = 0x80;
    /// The largest encodable length.
    pub const MAX: u32 = 0x7fff_ffff;

    /// Splits a length prefix off the front of `input`.
    ///
    /// Returns [`None`] if `input` ends within the prefix.
    #[must_use]
    pub fn decode(input: &[u8]) -> Option<(Self, &[u8])> {
        let (&first, rest) = input.split_first()?;
        if first & Self::WIDE == 0 {
            return Some((Self(first.into()), rest));
        }
        match rest {
            [b1, b2, b3, rest @ ..] => {
                let v = u32::from_be_bytes([first & !Self::WIDE, *b1, *b2, *b3]);
                Some((Self(v), rest))
            },
            _ => None,
        }
    }

    /// Appends the encoded length to `out`, returning the number of bytes
    /// pushed (1 or 4).
    pub fn push_to(self, out: &mut Vec<u8>) -> usize {
        match u8::try_from(self.0) {
            Ok(b) if b < Self::WIDE => {
                out.push(b);
                1
            },
            _ => {
                let mut e = self.0.to_be_bytes();
                e[0] |= Self::WIDE;
                out.extend_from_slice(&e);
                e.len()
            },
        }
    }

    /// Converts the length into a [`usize`], saturating on platforms where
    /// it does not fit. No input can be that long anyway.
    #[inline]
    #[must_use]
    pub fn to_usize(self) -> usize {
        usize::try_from(self.0).unwrap_or(usize::MAX)
    }
}

impl From<VarInt> for u32 {
    #[inline]
    fn from(v: VarInt) -> Self {
        v.0
    }
}

impl TryFrom<usize> for VarInt {
    type Error = ProtocolError;

    /// # Errors
    /// Returns [`ProtocolError::InvalidVarInt`] for lengths above [`VarInt::MAX`].
    fn try_from(len: usize) -> Result<Self, Self::Error> {
        match u32::try_from(len) {
            Ok(v) if v <= Self::MAX => Ok(Self(v)),
            _ => Err(ProtocolError::InvalidVarInt),
        }
    }
}
