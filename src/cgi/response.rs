use compact_str::{format_compact, CompactString};


/// The header block sent when a script produced no output and succeeded.
pub const EMPTY_HEADERS: &[u8] = b"\n";
/// The header block sent when a script produced no output and failed.
pub const FAILURE_HEADERS: &[u8] = b"Status:500 Internal Server Error\n\n";


/// Appends a CGI/1.1 header block to `out`.
///
/// Every pair is written as `Name:Value\n` in iteration order, followed by
/// the empty line separating headers from the body. Header values must be
/// single lines, which [`Headers`](super::Headers) ensures.
pub fn write_header_block<'a, I>(out: &mut Vec<u8>, headers: I)
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    for (name, val) in headers {
        debug_assert!(!val.contains(['\n', '\r']), "header value {val:?} spans multiple lines");
        out.extend_from_slice(name.as_bytes());
        out.push(b':');
        out.extend_from_slice(val.as_bytes());
        out.push(b'\n');
    }
    out.push(b'\n');
}

/// Formats the value of a `Status` header, such as `404 Not Found`.
///
/// Status codes without a canonical reason phrase are formatted as the
/// bare number.
#[must_use]
pub fn status_value(status: http::StatusCode) -> CompactString {
    match status.canonical_reason() {
        Some(reason) => format_compact!("{} {reason}", status.as_u16()),
        None => format_compact!("{}", status.as_u16()),
    }
}

/// Splits a CGI/1.1 response header line into its name and value.
///
/// A trailing `\n` or `\r\n` is ignored, as is whitespace around the
/// value. Returns [`None`] for lines without a colon, an empty name or
/// invalid UTF-8.
#[must_use]
pub fn parse_header_line(line: &[u8]) -> Option<(&str, &str)> {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    let line = std::str::from_utf8(line).ok()?;

    let (name, val) = line.split_once(':')?;
    if name.is_empty() || name.contains(char::is_whitespace) {
        return None;
    }
    Some((name, val.trim()))
}

/// Tests whether `line` ends a CGI/1.1 header block.
#[inline]
#[must_use]
pub fn is_block_end(line: &[u8]) -> bool {
    matches!(line, b"\n" | b"\r\n")
}
