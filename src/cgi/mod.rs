use compact_str::CompactString;
use smallvec::SmallVec;

/// Helpers for writing and parsing CGI/1.1 responses.
pub mod response;


type Values = SmallVec<[CompactString; 1]>;

/// The response headers of a script, in insertion order.
///
/// Header names are matched case-insensitively, as in HTTP. The spelling
/// of the first insertion is kept. Every name maps to a list of values,
/// each of which becomes its own header line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(CompactString, Values)>,
}

impl Headers {
    /// Creates an empty set of [`Headers`].
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.entries.iter().position(|(n, _)| n.eq_ignore_ascii_case(name))
    }

    /// Returns all values stored for `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> &[CompactString] {
        self.position(name).map_or(&[][..], |i| &self.entries[i].1[..])
    }

    /// Replaces all values of `name` with `values`.
    ///
    /// Passing no values removes `name` from the [`Headers`].
    pub fn set<I, V>(&mut self, name: &str, values: I)
    where
        I: IntoIterator<Item = V>,
        V: Into<CompactString>,
    {
        let values: Values = values.into_iter().map(|v| single_line(name, v.into())).collect();
        match (self.position(name), values.is_empty()) {
            (Some(i), true) => {
                self.entries.remove(i);
            },
            (Some(i), false) => self.entries[i].1 = values,
            (None, true) => (),
            (None, false) => self.entries.push((name.into(), values)),
        }
    }

    /// Appends `value` to the values of `name`.
    pub fn add(&mut self, name: &str, value: impl Into<CompactString>) {
        let value = single_line(name, value.into());
        match self.position(name) {
            Some(i) => self.entries[i].1.push(value),
            None => self.entries.push((name.into(), smallvec::smallvec![value])),
        }
    }

    /// Sets the `Status` header to `status` and its reason phrase.
    pub fn set_status(&mut self, status: http::StatusCode) {
        self.set("Status", [response::status_value(status)]);
    }

    /// Returns the number of distinct header names.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Tests whether no headers are set.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns an iterator over all header lines as name-value pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> + '_ {
        self.entries.iter()
            .flat_map(|(n, vals)| vals.iter().map(move |v| (n.as_str(), v.as_str())))
    }

    /// Appends the CGI/1.1 header block for these [`Headers`] to `out`.
    #[inline]
    pub fn write_block(&self, out: &mut Vec<u8>) {
        response::write_header_block(out, self.iter());
    }
}

/// Strips line breaks, which would end the header block early.
fn single_line(name: &str, value: CompactString) -> CompactString {
    if !value.contains(['\r', '\n']) {
        return value;
    }
    tracing::warn!(name, "line breaks removed from header value");
    value.chars().filter(|c| !matches!(c, '\r' | '\n')).collect()
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insertion_order() {
        let mut h = Headers::new();
        h.set("Content-Type", ["text/html"]);
        h.add("Set-Cookie", "a=1");
        h.add("set-cookie", "b=2");
        h.set_status(http::StatusCode::CREATED);

        let lines: Vec<_> = h.iter().collect();
        assert_eq!(lines, [
            ("Content-Type", "text/html"),
            ("Set-Cookie", "a=1"),
            ("Set-Cookie", "b=2"),
            ("Status", "201 Created"),
        ]);
        assert_eq!(h.len(), 3);

        let mut out = Vec::new();
        h.write_block(&mut out);
        assert_eq!(out, b"Content-Type:text/html\nSet-Cookie:a=1\nSet-Cookie:b=2\nStatus:201 Created\n\n");
    }

    #[test]
    fn replace_and_remove() {
        let mut h = Headers::new();
        h.set("X-A", ["1", "2"]);
        h.set("X-B", ["3"]);
        assert_eq!(h.get("x-a"), ["1", "2"]);

        h.set("x-a", ["4"]);
        assert_eq!(h.get("X-A"), ["4"]);
        assert_eq!(h.iter().next(), Some(("X-A", "4")));

        h.set("X-A", std::iter::empty::<&str>());
        assert!(h.get("X-A").is_empty());
        assert_eq!(h.len(), 1);
        h.set("X-Missing", std::iter::empty::<&str>());
        assert_eq!(h.len(), 1);
    }

    #[test]
    fn line_breaks_stripped() {
        let mut h = Headers::new();
        h.set("Location", ["/next\r\nSet-Cookie: evil=1"]);
        h.add("X-Note", "a\nb");
        assert_eq!(h.get("Location"), ["/nextSet-Cookie: evil=1"]);

        let mut out = Vec::new();
        h.write_block(&mut out);
        assert_eq!(out, b"Location:/nextSet-Cookie: evil=1\nX-Note:ab\n\n");
    }
}
