//! Parses the HTTP `Range` header for a single byte-range request and formats
//! the corresponding `Content-Range` response header.
//!
//! Only the single-range forms used by media players are accepted:
//! `bytes=A-B`, `bytes=A-`, `bytes=-N`. Multipart byteranges are not supported.

/// A half-open byte interval `[start, end)`. The wire form (`Content-Range`) is
/// inclusive (`start-(end-1)`); this type always holds the half-open form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

/// The outcome of parsing a `Range` header against a known `totalSize`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParsedRange {
    Satisfiable(ByteRange),
    NotSatisfiable,
}

/// Parses a raw `Range` header value (e.g. `"bytes=0-1023"`) against `total_size`.
///
/// `total_size` must be known and greater than zero for any range to be
/// satisfiable; callers with an unknown total size should treat every range
/// as not-yet-resolvable rather than calling this function.
pub fn parse(header_value: &str, total_size: u64) -> ParsedRange {
    let Some(spec) = header_value.strip_prefix("bytes=") else {
        return ParsedRange::NotSatisfiable;
    };

    // Multipart byteranges ("a-b,c-d") are rejected outright.
    if spec.contains(',') {
        return ParsedRange::NotSatisfiable;
    }

    let Some((raw_start, raw_end)) = spec.split_once('-') else {
        return ParsedRange::NotSatisfiable;
    };

    if total_size == 0 {
        return ParsedRange::NotSatisfiable;
    }

    if raw_start.is_empty() {
        // Suffix form: bytes=-N
        let Ok(n) = raw_end.parse::<u64>() else {
            return ParsedRange::NotSatisfiable;
        };
        if n == 0 {
            return ParsedRange::NotSatisfiable;
        }
        let start = total_size.saturating_sub(n);
        return ParsedRange::Satisfiable(ByteRange {
            start,
            end: total_size,
        });
    }

    let Ok(start) = raw_start.parse::<u64>() else {
        return ParsedRange::NotSatisfiable;
    };

    if raw_end.is_empty() {
        // Open-ended form: bytes=A-
        if start >= total_size {
            return ParsedRange::NotSatisfiable;
        }
        return ParsedRange::Satisfiable(ByteRange {
            start,
            end: total_size,
        });
    }

    // Bounded form: bytes=A-B
    let Ok(end_inclusive) = raw_end.parse::<u64>() else {
        return ParsedRange::NotSatisfiable;
    };
    if start > end_inclusive || end_inclusive >= total_size {
        return ParsedRange::NotSatisfiable;
    }
    ParsedRange::Satisfiable(ByteRange {
        start,
        end: end_inclusive + 1,
    })
}

/// Formats a satisfiable range as a `Content-Range` header value, e.g.
/// `"bytes 0-1023/10485760"`.
pub fn format_content_range(range: ByteRange, total_size: u64) -> String {
    format!("bytes {}-{}/{}", range.start, range.end - 1, total_size)
}

/// Formats the `Content-Range` header value used on a `416` response.
pub fn format_unsatisfiable_content_range(total_size: u64) -> String {
    format!("bytes */{}", total_size)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOTAL: u64 = 10_485_760; // 2 * 5 MiB

    #[test]
    fn bounded_range() {
        assert_eq!(
            parse("bytes=0-1023", TOTAL),
            ParsedRange::Satisfiable(ByteRange { start: 0, end: 1024 })
        );
    }

    #[test]
    fn open_ended_range() {
        assert_eq!(
            parse("bytes=1048576-", TOTAL),
            ParsedRange::Satisfiable(ByteRange {
                start: 1_048_576,
                end: TOTAL
            })
        );
    }

    #[test]
    fn suffix_range() {
        assert_eq!(
            parse("bytes=-100", 1000),
            ParsedRange::Satisfiable(ByteRange {
                start: 900,
                end: 1000
            })
        );
    }

    #[test]
    fn single_byte_range_bytes_0_0() {
        let ParsedRange::Satisfiable(r) = parse("bytes=0-0", TOTAL) else {
            panic!("expected satisfiable");
        };
        assert_eq!(r.len(), 1);
        assert_eq!(r, ByteRange { start: 0, end: 1 });
    }

    #[test]
    fn suffix_of_one_byte() {
        let ParsedRange::Satisfiable(r) = parse("bytes=-1", 1000) else {
            panic!("expected satisfiable");
        };
        assert_eq!(r, ByteRange { start: 999, end: 1000 });
        assert_eq!(format_content_range(r, 1000), "bytes 999-999/1000");
    }

    #[test]
    fn last_byte_open_ended() {
        let ParsedRange::Satisfiable(r) = parse("bytes=999-", 1000) else {
            panic!("expected satisfiable");
        };
        assert_eq!(r.len(), 1);
    }

    #[test]
    fn open_ended_at_total_size_is_not_satisfiable() {
        assert_eq!(parse("bytes=1000-", 1000), ParsedRange::NotSatisfiable);
    }

    #[test]
    fn out_of_bounds_is_not_satisfiable() {
        assert_eq!(parse("bytes=2000-3000", 1000), ParsedRange::NotSatisfiable);
    }

    #[test]
    fn start_after_end_is_not_satisfiable() {
        assert_eq!(parse("bytes=500-100", 1000), ParsedRange::NotSatisfiable);
    }

    #[test]
    fn zero_length_suffix_is_not_satisfiable() {
        assert_eq!(parse("bytes=-0", 1000), ParsedRange::NotSatisfiable);
    }

    #[test]
    fn malformed_syntax_is_not_satisfiable() {
        assert_eq!(parse("bytes=abc-def", 1000), ParsedRange::NotSatisfiable);
        assert_eq!(parse("not-a-range", 1000), ParsedRange::NotSatisfiable);
        assert_eq!(parse("bytes=", 1000), ParsedRange::NotSatisfiable);
    }

    #[test]
    fn multipart_byteranges_rejected() {
        assert_eq!(parse("bytes=0-100,200-300", 1000), ParsedRange::NotSatisfiable);
    }

    #[test]
    fn unknown_total_size_is_never_satisfiable() {
        assert_eq!(parse("bytes=0-100", 0), ParsedRange::NotSatisfiable);
    }

    #[test]
    fn format_unsatisfiable_header() {
        assert_eq!(format_unsatisfiable_content_range(1000), "bytes */1000");
    }

    #[test]
    fn round_trip_through_formatting() {
        let original = ByteRange { start: 42, end: 4096 };
        let header = format_content_range(original, TOTAL);
        // header is "bytes 42-4095/10485760"; reparse the equivalent request form.
        let request = header
            .strip_prefix("bytes ")
            .unwrap()
            .split('/')
            .next()
            .unwrap();
        let reparsed = parse(&format!("bytes={}", request), TOTAL);
        assert_eq!(reparsed, ParsedRange::Satisfiable(original));
    }

    proptest::proptest! {
        #[test]
        fn bounded_range_round_trips(start in 0u64..1_000_000, len in 1u64..1_000_000) {
            let total = start + len + 1;
            let end_inclusive = start + len - 1;
            let header = format!("bytes={}-{}", start, end_inclusive);
            if let ParsedRange::Satisfiable(r) = parse(&header, total) {
                prop_assert_eq!(r.start, start);
                prop_assert_eq!(r.end, end_inclusive + 1);
                let formatted = format_content_range(r, total);
                prop_assert_eq!(format!("bytes {}-{}/{}", start, end_inclusive, total), formatted);
            } else {
                prop_assert!(false, "expected a satisfiable range");
            }
        }
    }
}
