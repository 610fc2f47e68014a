/// A single byte range from a `Range: bytes=...` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteRange {
    /// `bytes=start-end`, inclusive
    Bounded { start: u64, end: u64 },
    /// `bytes=start-`
    From(u64),
    /// `bytes=-length`, the last `length` bytes
    Suffix(u64),
}

impl ByteRange {
    /// Parses a range header. Returns `None` for anything other than a single
    /// well-formed byte range, in which case the whole body should be sent.
    pub fn parse(header: &str) -> Option<Self> {
        let ranges = header.trim().strip_prefix("bytes=")?;

        if ranges.contains(',') {
            return None;
        }

        let (start, end) = ranges.split_once('-')?;
        let (start, end) = (start.trim(), end.trim());

        match (start.is_empty(), end.is_empty()) {
            (true, true) => None,
            (true, false) => end.parse().ok().map(Self::Suffix),
            (false, true) => start.parse().ok().map(Self::From),
            (false, false) => {
                let start = start.parse().ok()?;
                let end = end.parse().ok()?;

                (start <= end).then_some(Self::Bounded { start, end })
            }
        }
    }

    /// The inclusive `(first, last)` byte positions within a body of `size`
    /// bytes, or `None` if the range cannot be satisfied.
    pub fn resolve(&self, size: u64) -> Option<(u64, u64)> {
        if size == 0 {
            return None;
        }

        let last = size - 1;

        match *self {
            Self::Bounded { start, end } => (start <= last).then(|| (start, end.min(last))),
            Self::From(start) => (start <= last).then_some((start, last)),
            Self::Suffix(0) => None,
            Self::Suffix(length) => Some((size.saturating_sub(length), last)),
        }
    }
}

#[cfg(test)]
mod test {
    use super::ByteRange;

    #[test]
    fn parses_the_three_forms() {
        assert_eq!(
            ByteRange::parse("bytes=0-99"),
            Some(ByteRange::Bounded { start: 0, end: 99 })
        );
        assert_eq!(ByteRange::parse("bytes=100-"), Some(ByteRange::From(100)));
        assert_eq!(ByteRange::parse("bytes=-20"), Some(ByteRange::Suffix(20)));

        assert_eq!(ByteRange::parse("bytes=5-1"), None);
        assert_eq!(ByteRange::parse("bytes=0-1,4-5"), None);
        assert_eq!(ByteRange::parse("items=0-1"), None);
        assert_eq!(ByteRange::parse("bytes=-"), None);
    }

    #[test]
    fn resolves_against_the_body_size() {
        let size = 1000;

        assert_eq!(
            ByteRange::Bounded { start: 10, end: 5000 }.resolve(size),
            Some((10, 999))
        );
        assert_eq!(ByteRange::From(999).resolve(size), Some((999, 999)));
        assert_eq!(ByteRange::From(1000).resolve(size), None);
        assert_eq!(ByteRange::Suffix(50).resolve(size), Some((950, 999)));
        assert_eq!(ByteRange::Suffix(5000).resolve(size), Some((0, 999)));
        assert_eq!(ByteRange::Suffix(0).resolve(size), None);
    }
}
