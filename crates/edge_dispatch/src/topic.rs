//! Hierarchical key matching with MQTT-style wildcards.
//!
//! Keys are split on `/` into segments and compared segment by segment:
//!
//! - `+` matches exactly one segment
//! - `#` matches the remainder of the key, including nothing at all, and is
//!   only legal as the final segment
//! - every other segment must be equal
//!
//! ```rust
//! use edge_dispatch::topic;
//!
//! assert!(topic::matches("plant/+/temp", "plant/line1/temp"));
//! assert!(topic::matches("plant/#", "plant"));
//! assert!(!topic::matches("plant/+/temp", "plant/line1/temp/raw"));
//! ```

/// Segment separator for hierarchical keys
pub const SEPARATOR: char = '/';
/// Matches exactly one segment
pub const SINGLE_LEVEL: &str = "+";
/// Matches the remainder of the key
pub const MULTI_LEVEL: &str = "#";

/// Returns true when `key` is matched by `pattern`.
///
/// Both segment sequences must be exhausted together unless the pattern ends
/// with `#`. A `#` in any position other than the last never matches.
pub fn matches(pattern: &str, key: &str) -> bool {
    let mut pattern_parts = pattern.split(SEPARATOR);
    let mut key_parts = key.split(SEPARATOR);

    loop {
        match (pattern_parts.next(), key_parts.next()) {
            (Some(MULTI_LEVEL), _) => return pattern_parts.next().is_none(),
            (Some(SINGLE_LEVEL), Some(_)) => continue,
            (Some(p), Some(k)) if p == k => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Returns true when the pattern contains a `+` or `#` segment.
pub fn has_wildcards(pattern: &str) -> bool {
    pattern
        .split(SEPARATOR)
        .any(|segment| segment == SINGLE_LEVEL || segment == MULTI_LEVEL)
}

/// Validates a subscription pattern.
///
/// Rejects empty patterns, a `#` that is not the final segment and wildcard
/// characters embedded inside a longer segment (`line+1`).
pub fn is_valid_pattern(pattern: &str) -> bool {
    if pattern.is_empty() {
        return false;
    }

    let segments: Vec<&str> = pattern.split(SEPARATOR).collect();
    let last = segments.len() - 1;

    segments.iter().enumerate().all(|(index, segment)| {
        if *segment == MULTI_LEVEL {
            index == last
        } else if *segment == SINGLE_LEVEL {
            true
        } else {
            !segment.contains('+') && !segment.contains('#')
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matching_table() {
        let cases = [
            ("a/+/c", "a/b/c", true),
            ("a/+/c", "a/b/c/d", false),
            ("a/#", "a/b/c", true),
            ("a/#", "a", true),
            ("a/b", "a/b", true),
            ("a/b", "a/c", false),
            ("+", "a", true),
            ("+", "a/b", false),
            ("#", "a/b/c", true),
            ("a/+", "a", false),
            ("a/#/c", "a/b/c", false),
            ("a/b/c", "a/b", false),
        ];

        for (pattern, key, expected) in cases {
            assert_eq!(
                matches(pattern, key),
                expected,
                "matches({pattern:?}, {key:?})"
            );
        }
    }

    #[test]
    fn test_wildcard_detection() {
        assert!(has_wildcards("plant/+/temp"));
        assert!(has_wildcards("plant/#"));
        assert!(!has_wildcards("plant/line1/temp"));
        assert!(!has_wildcards("Program:Main.Counter"));
    }

    #[test]
    fn test_pattern_validation() {
        assert!(is_valid_pattern("a/+/c"));
        assert!(is_valid_pattern("a/#"));
        assert!(is_valid_pattern("plain_tag"));
        assert!(!is_valid_pattern(""));
        assert!(!is_valid_pattern("a/#/c"));
        assert!(!is_valid_pattern("a/line+1"));
    }
}
