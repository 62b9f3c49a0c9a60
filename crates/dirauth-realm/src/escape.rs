//! Directory string escaping.
//!
//! Two distinct, context-specific escaping rule sets plus a normalizer:
//!
//! - [`filter_escape`] for values placed inside a search filter (RFC 4515)
//! - [`attribute_value_escape`] for values that become part of a
//!   distinguished name (RFC 4514)
//! - [`normalize_hex_escapes`] to canonicalize directory-returned names that
//!   use single-character `\x` escaping into the two-hex-digit form
//!
//! The hex case differs between the two escapers: filters use lower-case
//! digits, attribute values upper-case. Directory servers match on the exact
//! form, so both are reproduced as-is.

/// Escape a value for inclusion in a search filter.
///
/// Applied to every untrusted token substituted into a filter template:
/// usernames, DN components reused as filter arguments and group name values.
#[must_use]
pub fn filter_escape(input: &str) -> String {
    let mut buf = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '\\' => buf.push_str("\\5c"),
            '*' => buf.push_str("\\2a"),
            '(' => buf.push_str("\\28"),
            ')' => buf.push_str("\\29"),
            '\0' => buf.push_str("\\00"),
            _ => buf.push(c),
        }
    }
    buf
}

/// Escape a value for use inside a distinguished name.
///
/// A leading or trailing space and a leading `#` are hex-escaped; the DN
/// special characters are always hex-escaped; everything else passes through.
#[must_use]
pub fn attribute_value_escape(input: &str) -> String {
    let len = input.chars().count();
    let mut result = String::with_capacity(input.len());

    for (i, c) in input.chars().enumerate() {
        match c {
            ' ' => {
                if i == 0 || i == len - 1 {
                    result.push_str("\\20");
                } else {
                    result.push(c);
                }
            }
            '#' => {
                if i == 0 {
                    result.push_str("\\23");
                } else {
                    result.push(c);
                }
            }
            '"' => result.push_str("\\22"),
            '+' => result.push_str("\\2B"),
            ',' => result.push_str("\\2C"),
            ';' => result.push_str("\\3B"),
            '<' => result.push_str("\\3C"),
            '>' => result.push_str("\\3E"),
            '\\' => result.push_str("\\5C"),
            '\0' => result.push_str("\\00"),
            _ => result.push(c),
        }
    }

    result
}

/// Rewrite single-character backslash escapes into the two-hex-digit form.
///
/// Directory servers may return names escaped either way; the canonical form
/// is required before a name is re-emitted into a template or filter.
/// Unrecognized single-character escapes are preserved as backslash plus
/// character, and a trailing lone backslash is preserved.
#[must_use]
pub fn normalize_hex_escapes(input: &str) -> String {
    if !input.contains('\\') {
        // No escaping present. Return as-is.
        return input.to_string();
    }

    let mut result = String::with_capacity(input.len() + 6);
    let mut previous_slash = false;

    for c in input.chars() {
        if previous_slash {
            match c {
                ' ' => result.push_str("\\20"),
                '"' => result.push_str("\\22"),
                '#' => result.push_str("\\23"),
                '+' => result.push_str("\\2B"),
                ',' => result.push_str("\\2C"),
                ';' => result.push_str("\\3B"),
                '<' => result.push_str("\\3C"),
                '=' => result.push_str("\\3D"),
                '>' => result.push_str("\\3E"),
                '\\' => result.push_str("\\5C"),
                other => {
                    result.push('\\');
                    result.push(other);
                }
            }
            previous_slash = false;
        } else if c == '\\' {
            previous_slash = true;
        } else {
            result.push(c);
        }
    }

    if previous_slash {
        result.push('\\');
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_escape_specials() {
        assert_eq!(filter_escape("a*b(c)\\d\0"), "a\\2ab\\28c\\29\\5cd\\00");
    }

    #[test]
    fn test_filter_escape_passthrough() {
        assert_eq!(filter_escape("John Doe"), "John Doe");
        assert_eq!(filter_escape(""), "");
    }

    #[test]
    fn test_filter_escape_uses_lower_case_hex() {
        assert_eq!(filter_escape("\\"), "\\5c");
    }

    #[test]
    fn test_attribute_value_escape_spaces() {
        assert_eq!(attribute_value_escape(" a "), "\\20a\\20");
        // Interior spaces stay unescaped
        assert_eq!(attribute_value_escape("John Doe"), "John Doe");
    }

    #[test]
    fn test_attribute_value_escape_leading_hash() {
        assert_eq!(attribute_value_escape("#ab"), "\\23ab");
        assert_eq!(attribute_value_escape("a#b"), "a#b");
    }

    #[test]
    fn test_attribute_value_escape_specials() {
        assert_eq!(attribute_value_escape("a,b"), "a\\2Cb");
        assert_eq!(attribute_value_escape("a+b"), "a\\2Bb");
        assert_eq!(attribute_value_escape("a\"b"), "a\\22b");
        assert_eq!(attribute_value_escape("a;b"), "a\\3Bb");
        assert_eq!(attribute_value_escape("a<b>c"), "a\\3Cb\\3Ec");
        assert_eq!(attribute_value_escape("a\\b"), "a\\5Cb");
        assert_eq!(attribute_value_escape("a\0b"), "a\\00b");
    }

    #[test]
    fn test_attribute_value_escape_uses_upper_case_hex() {
        // The filter escaper emits \5c, this one must emit \5C
        assert_eq!(attribute_value_escape("\\"), "\\5C");
    }

    #[test]
    fn test_attribute_value_escape_injection_attempt() {
        assert_eq!(
            attribute_value_escape("admin,dc=evil,dc=com"),
            "admin\\2Cdc=evil\\2Cdc=com"
        );
    }

    #[test]
    fn test_normalize_hex_escapes_known_specials() {
        assert_eq!(normalize_hex_escapes("a\\,b"), "a\\2Cb");
        assert_eq!(normalize_hex_escapes("a\\ b"), "a\\20b");
        assert_eq!(normalize_hex_escapes("a\\=b"), "a\\3Db");
        assert_eq!(normalize_hex_escapes("a\\\\b"), "a\\5Cb");
    }

    #[test]
    fn test_normalize_hex_escapes_no_backslash_is_noop() {
        assert_eq!(normalize_hex_escapes("no-backslash"), "no-backslash");
    }

    #[test]
    fn test_normalize_hex_escapes_unknown_escape_preserved() {
        assert_eq!(normalize_hex_escapes("a\\qb"), "a\\qb");
    }

    #[test]
    fn test_normalize_hex_escapes_trailing_backslash_preserved() {
        assert_eq!(normalize_hex_escapes("abc\\"), "abc\\");
    }

    #[test]
    fn test_normalize_hex_escapes_multiple() {
        assert_eq!(
            normalize_hex_escapes("cn=a\\,b\\<c,ou=x"),
            "cn=a\\2Cb\\3Cc,ou=x"
        );
    }
}
