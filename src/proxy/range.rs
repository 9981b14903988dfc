/// A parsed, clamped byte range: inclusive `start..=end` within an object of
/// known total size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }
}

/// Parses a `Range` header against an object of `total_size` bytes.
///
/// Accepted forms: `bytes=start-end`, `bytes=start-`, and `bytes=-suffix`.
/// Multiple ranges and anything else are rejected; `None` means the caller
/// must answer 416.
pub fn parse_range(header: &str, total_size: u64) -> Option<ByteRange> {
    let spec = header.strip_prefix("bytes=")?;
    let parts: Vec<&str> = spec.split('-').collect();
    if parts.len() != 2 {
        return None;
    }

    let (start, end) = if parts[0].is_empty() {
        // bytes=-N: the last N bytes.
        let suffix: u64 = parts[1].parse().ok()?;
        (total_size.saturating_sub(suffix), total_size.checked_sub(1)?)
    } else {
        let start: u64 = parts[0].parse().ok()?;
        let end = if parts[1].is_empty() {
            total_size.checked_sub(1)?
        } else {
            parts[1].parse().ok()?
        };
        (start, end)
    };

    if start > end || start >= total_size {
        return None;
    }
    let end = end.min(total_size - 1);

    Some(ByteRange { start, end })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_explicit_range() {
        let range = parse_range("bytes=0-1023", 4096).unwrap();
        assert_eq!(range, ByteRange { start: 0, end: 1023 });
        assert_eq!(range.len(), 1024);
    }

    #[test]
    fn parses_open_ended_range() {
        let range = parse_range("bytes=100-", 200).unwrap();
        assert_eq!(range, ByteRange { start: 100, end: 199 });
    }

    #[test]
    fn parses_suffix_range() {
        let range = parse_range("bytes=-50", 200).unwrap();
        assert_eq!(range, ByteRange { start: 150, end: 199 });
    }

    #[test]
    fn oversized_suffix_covers_whole_object() {
        let range = parse_range("bytes=-5000", 200).unwrap();
        assert_eq!(range, ByteRange { start: 0, end: 199 });
    }

    #[test]
    fn clamps_end_to_object_size() {
        let range = parse_range("bytes=10-99999", 100).unwrap();
        assert_eq!(range, ByteRange { start: 10, end: 99 });
    }

    #[test]
    fn whole_object_range_matches_full_body() {
        let range = parse_range("bytes=0-99", 100).unwrap();
        assert_eq!(range.len(), 100);
    }

    #[test]
    fn rejects_start_at_or_past_size() {
        assert!(parse_range("bytes=100-", 100).is_none());
        assert!(parse_range("bytes=500-600", 100).is_none());
    }

    #[test]
    fn rejects_inverted_range() {
        assert!(parse_range("bytes=50-10", 100).is_none());
    }

    #[test]
    fn rejects_malformed_specs() {
        assert!(parse_range("bytes=abc-def", 100).is_none());
        assert!(parse_range("bytes=", 100).is_none());
        assert!(parse_range("bytes=-", 100).is_none());
        assert!(parse_range("octets=0-5", 100).is_none());
        assert!(parse_range("0-5", 100).is_none());
    }

    #[test]
    fn rejects_multiple_ranges() {
        assert!(parse_range("bytes=0-5,10-15", 100).is_none());
    }

    #[test]
    fn rejects_any_range_on_empty_object() {
        assert!(parse_range("bytes=0-", 0).is_none());
        assert!(parse_range("bytes=-5", 0).is_none());
    }
}
