use super::varint::VarInt;
use super::Error as ProtocolError;


/// An iterator decoding complete name-value pairs from its input.
///
/// Iteration stops at the first incomplete pair. Whatever bytes are left
/// can be inspected with `NVIter::into_inner`.
#[derive(Debug, Clone)]
pub struct NVIter<'a> {
    data: &'a [u8],
}

impl<'a> NVIter<'a> {
    /// Creates a new [`NVIter`] over the referenced input bytes.
    #[inline]
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    /// Extracts the remaining input bytes from the iterator.
    #[inline]
    #[must_use]
    pub fn into_inner(self) -> &'a [u8] {
        self.data
    }
}

impl<'a> Iterator for NVIter<'a> {
    /// The name-value pair returned by the iterator.
    type Item = (&'a [u8], &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        let (name_len, cur) = VarInt::decode(self.data)?;
        let (val_len, cur) = VarInt::decode(cur)?;
        let (name_len, val_len) = (name_len.to_usize(), val_len.to_usize());
        let total_len = name_len.checked_add(val_len)?;

        if cur.len() >= total_len {
            self.data = &cur[total_len..];
            Some((&cur[..name_len], &cur[name_len..total_len]))
        } else {
            None
        }
    }
}

impl std::iter::FusedIterator for NVIter<'_> {}


/// Encodes a name-value pair into `out`, returning the number of bytes
/// appended.
///
/// # Errors
/// Returns [`ProtocolError::InvalidVarInt`] if either length exceeds
/// [`VarInt::MAX`]. Nothing is appended in that case.
pub fn write((name, value): (&[u8], &[u8]), out: &mut Vec<u8>) -> Result<usize, ProtocolError> {
    let name_len = VarInt::try_from(name.len())?;
    let val_len = VarInt::try_from(value.len())?;
    let mut written = name_len.push_to(out);
    written += val_len.push_to(out);
    out.extend_from_slice(name);
    out.extend_from_slice(value);
    Ok(written + name.len() + value.len())
}

/// Encodes a sequence of name-value pairs into `out`, returning the number
/// of bytes appended.
///
/// # Errors
/// Returns [`ProtocolError::InvalidVarInt`] if any name or value is longer
/// than [`VarInt::MAX`]. Pairs preceding the offending one stay in `out`.
pub fn encode<'a, I>(pairs: I, out: &mut Vec<u8>) -> Result<usize, ProtocolError>
where
    I: IntoIterator<Item = (&'a [u8], &'a [u8])>,
{
    let mut written = 0;
    for pair in pairs {
        written += write(pair, out)?;
    }
    Ok(written)
}
