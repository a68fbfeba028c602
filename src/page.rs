//! Page arithmetic
//!
//! Pages run 1..=99 and wrap in both directions.

/// First page
pub const PAGE_MIN: u32 = 1;
/// Last page
pub const PAGE_MAX: u32 = 99;

/// Bring any page number into 1..=99, wrapping past either end
///
/// 0 becomes 99 and 100 becomes 1; larger excursions keep wrapping.
pub fn wrap_page(page: i64) -> u32 {
    let span = i128::from(PAGE_MAX - PAGE_MIN + 1);
    ((i128::from(page) - i128::from(PAGE_MIN)).rem_euclid(span) + i128::from(PAGE_MIN)) as u32
}

pub fn increase_page(page: u32) -> u32 {
    wrap_page(page as i64 + 1)
}

pub fn decrease_page(page: u32) -> u32 {
    wrap_page(page as i64 - 1)
}

/// Page reached from `page` by a relative offset, e.g. for panels that span
/// several pages at once
pub fn offset_page(page: u32, offset: i32) -> u32 {
    wrap_page(page as i64 + offset as i64)
}

/// Parse a page number from user input
///
/// Accepts anything that reads as an integer (surrounding whitespace allowed)
/// and wraps it; rejects non-numeric input.
pub fn parse_page(value: &str) -> Option<u32> {
    value.trim().parse::<i64>().ok().map(wrap_page)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wraparound() {
        assert_eq!(increase_page(99), 1);
        assert_eq!(decrease_page(1), 99);
        assert_eq!(wrap_page(0), 99);
        assert_eq!(wrap_page(100), 1);
        assert_eq!(wrap_page(-1), 98);
        assert_eq!(wrap_page(199), 1);
        let low = wrap_page(i64::MIN);
        let high = wrap_page(i64::MAX);
        assert!((PAGE_MIN..=PAGE_MAX).contains(&low));
        assert!((PAGE_MIN..=PAGE_MAX).contains(&high));
    }

    #[test]
    fn test_in_range_unchanged() {
        for page in PAGE_MIN..=PAGE_MAX {
            assert_eq!(wrap_page(page as i64), page);
        }
    }

    #[test]
    fn test_offset_page() {
        assert_eq!(offset_page(98, 2), 1);
        assert_eq!(offset_page(2, -3), 98);
        assert_eq!(offset_page(5, 0), 5);
    }

    #[test]
    fn test_parse_page() {
        assert_eq!(parse_page(" 12 "), Some(12));
        assert_eq!(parse_page("0"), Some(99));
        assert_eq!(parse_page("twelve"), None);
        assert_eq!(parse_page("-9223372036854775808"), Some(wrap_page(i64::MIN)));
        assert_eq!(parse_page("9223372036854775807"), Some(wrap_page(i64::MAX)));
        assert_eq!(parse_page(""), None);
    }
}
