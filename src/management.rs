use crate::macros::trace;
use crate::protocol::{self as fcgi, Limits, ProtocolVariable, RequestRecord, ResponseRecord};


/// Answers a management record, i.e. one addressed to request ID 0.
///
/// Returns the record to send back at request ID 0, if any.
pub(crate) fn handle(record: RequestRecord, limits: &Limits) -> Option<ResponseRecord> {
    match record {
        RequestRecord::GetValues(query) => Some(get_values(&query, limits)),
        RequestRecord::Unrecognized(rtype) => {
            tracing::debug!(rtype, "unknown record type");
            Some(ResponseRecord::UnknownType(fcgi::body::UnknownType { rtype }))
        },
        r => {
            tracing::warn!(record = ?r, "unexpected management record ignored");
            None
        },
    }
}

/// Answers the known variables of a `GetValues` query in query order.
fn get_values(query: &[u8], limits: &Limits) -> ResponseRecord {
    let mut out = Vec::new();
    for (name, _) in fcgi::nv::NVIter::new(query) {
        let Ok(var) = ProtocolVariable::from_name(name) else {
            trace!(name = %String::from_utf8_lossy(name), "unknown protocol variable skipped");
            continue;
        };
        let value = var.value(limits);
        if let Err(e) = fcgi::nv::write((name, value.as_bytes()), &mut out) {
            let error: &dyn std::error::Error = &e;
            tracing::error!(error, "encoding protocol variable failed");
        }
    }
    ResponseRecord::GetValuesResult(out)
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::encode_params;

    const LIMITS: Limits = Limits { max_conns: 4, max_reqs: 16, mpxs_conns: true };

    #[test]
    fn values_in_query_order() {
        let query = encode_params(&[
            (b"FCGI_MPXS_CONNS", b""),
            (b"FCGI_UNKNOWN", b""),
            (b"FCGI_MAX_CONNS", b""),
            (b"FCGI_MAX_REQS", b"ignored"),
        ]);
        let expected = encode_params(&[
            (b"FCGI_MPXS_CONNS", b"1"),
            (b"FCGI_MAX_CONNS", b"4"),
            (b"FCGI_MAX_REQS", b"16"),
        ]);
        assert_eq!(handle(RequestRecord::GetValues(query), &LIMITS), Some(ResponseRecord::GetValuesResult(expected)));
        assert_eq!(
            handle(RequestRecord::GetValues(Vec::new()), &LIMITS),
            Some(ResponseRecord::GetValuesResult(Vec::new())),
        );
    }

    #[test]
    fn unknown_and_unexpected() {
        let resp = handle(RequestRecord::Unrecognized(42), &LIMITS);
        assert_eq!(resp, Some(ResponseRecord::UnknownType(fcgi::body::UnknownType { rtype: 42 })));
        assert_eq!(handle(RequestRecord::Stdin(b"stray".to_vec()), &LIMITS), None);
        assert_eq!(handle(RequestRecord::AbortRequest, &LIMITS), None);
    }
}
