//! # Utility Functions
//!
//! Small helpers shared across the dispatch core.
//!
//! ## Key Functions
//!
//! - [`current_timestamp_ms()`] - Consistent timestamp generation
//! - [`short_type_name()`] - Readable type names for logs and errors

// ============================================================================
// Utility Functions
// ============================================================================

/// Returns the current Unix timestamp in milliseconds.
///
/// All reads and notifications are stamped with this function. A system clock
/// set before the Unix epoch yields `0` instead of panicking.
pub fn current_timestamp_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Strips module paths from a type name produced by [`std::any::type_name`].
///
/// `alloc::vec::Vec<my_app::Reading>` becomes `Vec<Reading>`.
pub fn short_type_name(full: &str) -> String {
    let mut out = String::with_capacity(full.len());
    let mut segment = String::new();
    for ch in full.chars() {
        match ch {
            '<' | '>' | ',' | ' ' | '[' | ']' | ';' | '(' | ')' | '&' => {
                out.push_str(last_path_segment(&segment));
                segment.clear();
                out.push(ch);
            }
            _ => segment.push(ch),
        }
    }
    out.push_str(last_path_segment(&segment));
    out
}

fn last_path_segment(path: &str) -> &str {
    path.rsplit("::").next().unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_type_name() {
        assert_eq!(short_type_name("alloc::vec::Vec<my_app::Reading>"), "Vec<Reading>");
        assert_eq!(short_type_name("u32"), "u32");
        assert_eq!(
            short_type_name("core::option::Option<(a::B, c::D)>"),
            "Option<(B, D)>"
        );
    }

    #[test]
    fn test_timestamp_is_recent() {
        // 2020-01-01 in milliseconds
        assert!(current_timestamp_ms() > 1_577_836_800_000);
    }
}
