//! SCPI text-protocol helpers shared by the VISA-class instruments.
//!
//! Covers identity matching against `*IDN?` responses, IEEE 488.2
//! definite-length binary blocks (`#<n><len><payload>`) and the comma-separated
//! numeric lists returned by trace queries.

use regex::Regex;

/// Compile an identity pattern so it must match the whole (trimmed) response.
pub fn identity_regex(pattern: &str) -> Result<Regex, regex::Error> {
    Regex::new(&format!("^(?:{})$", pattern))
}

/// Check an `*IDN?` response against an anchored identity pattern.
pub fn identity_matches(pattern: &Regex, response: &str) -> bool {
    pattern.is_match(response.trim())
}

/// Progress of a definite-length block arriving in pieces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockStatus {
    /// More bytes are needed before the block is complete.
    Incomplete,
    /// The payload occupies `buffer[start..start + len]`.
    Complete { start: usize, len: usize },
    /// The header is not a valid definite-length block header.
    Malformed,
}

/// Locate a definite-length block inside `buffer`.
///
/// Leading bytes before the `#` marker (whitespace, echoed separators) are
/// skipped. Indefinite blocks (`#0`) are reported as malformed.
pub fn parse_definite_block(buffer: &[u8]) -> BlockStatus {
    let Some(marker) = buffer.iter().position(|b| *b == b'#') else {
        return if buffer.iter().all(u8::is_ascii_whitespace) {
            BlockStatus::Incomplete
        } else {
            BlockStatus::Malformed
        };
    };

    let Some(&digit_count) = buffer.get(marker + 1) else {
        return BlockStatus::Incomplete;
    };
    if !(b'1'..=b'9').contains(&digit_count) {
        return BlockStatus::Malformed;
    }
    let digits = usize::from(digit_count - b'0');

    let length_start = marker + 2;
    let Some(length_digits) = buffer.get(length_start..length_start + digits) else {
        return BlockStatus::Incomplete;
    };
    let Some(len) = std::str::from_utf8(length_digits)
        .ok()
        .and_then(|text| text.parse::<usize>().ok())
    else {
        return BlockStatus::Malformed;
    };

    let start = length_start + digits;
    if buffer.len() < start + len {
        BlockStatus::Incomplete
    } else {
        BlockStatus::Complete { start, len }
    }
}

/// Parse `"-80.1,-79.5,..."` into numbers; any bad element rejects the list.
pub fn parse_float_list(response: &str) -> Option<Vec<f64>> {
    let trimmed = response.trim();
    if trimmed.is_empty() {
        return None;
    }
    trimmed
        .split(',')
        .map(|item| item.trim().parse::<f64>().ok())
        .collect()
}

/// Quote a path argument for MMEM commands.
pub fn quoted(path: &str) -> String {
    format!("\"{}\"", path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_requires_full_match() {
        let pattern = identity_regex(r"Keysight Technologies,U([0-9]{4})X*(A|B),MY([0-9]+),.*").unwrap();
        assert!(identity_matches(
            &pattern,
            "Keysight Technologies,U2002A,MY12345678,A1.03.05\n"
        ));
        assert!(!identity_matches(
            &pattern,
            "Prefix Keysight Technologies,U2002A,MY12345678,A1.03.05"
        ));
        assert!(!identity_matches(&pattern, "Rigol Technologies,DS1054Z"));
    }

    #[test]
    fn test_definite_block_complete() {
        let buffer = b"#3005HELLO\n";
        assert_eq!(
            parse_definite_block(buffer),
            BlockStatus::Complete { start: 5, len: 5 }
        );
        assert_eq!(&buffer[5..10], b"HELLO");
    }

    #[test]
    fn test_definite_block_incomplete_then_complete() {
        assert_eq!(parse_definite_block(b""), BlockStatus::Incomplete);
        assert_eq!(parse_definite_block(b"#"), BlockStatus::Incomplete);
        assert_eq!(parse_definite_block(b"#21"), BlockStatus::Incomplete);
        assert_eq!(parse_definite_block(b"#210abc"), BlockStatus::Incomplete);
        assert_eq!(
            parse_definite_block(b"  #210abcdefghij"),
            BlockStatus::Complete { start: 6, len: 10 }
        );
    }

    #[test]
    fn test_definite_block_malformed() {
        assert_eq!(parse_definite_block(b"#0abc"), BlockStatus::Malformed);
        assert_eq!(parse_definite_block(b"#2x1"), BlockStatus::Malformed);
        assert_eq!(parse_definite_block(b"ERROR"), BlockStatus::Malformed);
    }

    #[test]
    fn test_float_list() {
        assert_eq!(
            parse_float_list("-80.5,-79.25, 1.5E+01\n"),
            Some(vec![-80.5, -79.25, 15.0])
        );
        assert_eq!(parse_float_list("-80.5,abc"), None);
        assert_eq!(parse_float_list("  "), None);
    }
}
