use compact_str::{CompactString, ToCompactString};

use super::Error as ProtocolError;


/// A variable a web server may ask about in a
/// [`GetValues`](super::RecordType::GetValues) record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::IntoStaticStr, strum::EnumString)]
#[strum(use_phf)]
#[cfg_attr(test, derive(strum::EnumIter))]
pub enum ProtocolVariable {
    /// How many connections are served at once.
    #[strum(serialize = "FCGI_MAX_CONNS")]
    MaxConns,
    /// How many requests are served at once.
    #[strum(serialize = "FCGI_MAX_REQS")]
    MaxReqs,
    /// "1" if one connection may carry several requests.
    #[strum(serialize = "FCGI_MPXS_CONNS")]
    MpxsConns,
}

/// The capabilities reported for each [`ProtocolVariable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Limits {
    pub max_conns: usize,
    pub max_reqs: usize,
    pub mpxs_conns: bool,
}

impl ProtocolVariable {
    /// Looks up a variable by its name on the wire.
    ///
    /// # Errors
    /// Returns [`ProtocolError::UnknownVariable`] for any other name.
    pub fn from_name(name: &[u8]) -> Result<Self, ProtocolError> {
        std::str::from_utf8(name)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or(ProtocolError::UnknownVariable)
    }

    #[inline]
    #[must_use]
    pub fn name(self) -> &'static str {
        self.into()
    }

    /// The value reported for this variable under `limits`.
    #[must_use]
    pub fn value(self, limits: &Limits) -> CompactString {
        match self {
            Self::MaxConns => limits.max_conns.to_compact_string(),
            Self::MaxReqs => limits.max_reqs.to_compact_string(),
            Self::MpxsConns => CompactString::const_new(if limits.mpxs_conns { "1" } else { "0" }),
        }
    }
}


#[cfg(test)]
mod tests {
    use strum::IntoEnumIterator;
    use super::*;

    const LIMITS: Limits = Limits { max_conns: 4, max_reqs: 16, mpxs_conns: true };

    #[test]
    fn names() -> Result<(), ProtocolError> {
        let names: Vec<_> = ProtocolVariable::iter().map(ProtocolVariable::name).collect();
        assert_eq!(names, ["FCGI_MAX_CONNS", "FCGI_MAX_REQS", "FCGI_MPXS_CONNS"]);
        for var in ProtocolVariable::iter() {
            assert_eq!(ProtocolVariable::from_name(var.name().as_bytes())?, var);
        }
        Ok(())
    }

    #[test]
    fn unknown_names() {
        for name in [&b"MAX_CONNS"[..], b"fcgi_max_conns", b"FCGI_MAX\xFF", b""] {
            assert_eq!(ProtocolVariable::from_name(name), Err(ProtocolError::UnknownVariable));
        }
    }

    #[test]
    fn values() {
        assert_eq!(ProtocolVariable::MaxConns.value(&LIMITS), "4");
        assert_eq!(ProtocolVariable::MaxReqs.value(&LIMITS), "16");
        assert_eq!(ProtocolVariable::MpxsConns.value(&LIMITS), "1");
        let single = Limits { mpxs_conns: false, ..LIMITS };
        assert_eq!(ProtocolVariable::MpxsConns.value(&single), "0");
    }
}
