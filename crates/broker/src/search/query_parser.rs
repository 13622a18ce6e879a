//! Search query parser
//!
//! Parses queries with operators like:
//! - `mime:message/rfc822` - mime type filter
//! - `flag:\FLAGGED` or `flag:flagged` - flag filter
//! - `is:seen`, `is:unread`, `is:flagged` - flag shorthands
//! - `in:42` - collection filter
//! - `before:2024/12/01`, `after:2024/01/01` - modification date filters

use chrono::{DateTime, NaiveDate, TimeZone, Utc};

use crate::models::flags;

/// Parsed query with structured components
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedQuery {
    /// Free-text search terms
    pub terms: Vec<String>,
    /// mime: filter values, lowercased
    pub mime_types: Vec<String>,
    /// Flags every match must carry
    pub flags: Vec<String>,
    /// Flags no match may carry
    pub without_flags: Vec<String>,
    /// in: collection ids
    pub collections: Vec<i64>,
    /// before: date filter
    pub before: Option<DateTime<Utc>>,
    /// after: date filter
    pub after: Option<DateTime<Utc>>,
}

impl ParsedQuery {
    /// Check if the query is empty (no terms or filters)
    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
            && self.mime_types.is_empty()
            && self.flags.is_empty()
            && self.without_flags.is_empty()
            && self.collections.is_empty()
            && self.before.is_none()
            && self.after.is_none()
    }
}

/// Parse a search query string into structured components
///
/// Everything that is not a known `key:value` operator is treated as
/// free-text search terms.
pub fn parse_query(input: &str) -> ParsedQuery {
    let mut query = ParsedQuery::default();

    let mut i = 0;
    let chars: Vec<char> = input.chars().collect();

    while i < chars.len() {
        while i < chars.len() && chars[i].is_whitespace() {
            i += 1;
        }
        if i >= chars.len() {
            break;
        }

        let rest: String = chars[i..].iter().collect();

        if let Some((key, value, consumed)) = parse_operator(&rest) {
            match key.to_lowercase().as_str() {
                "mime" => query.mime_types.push(value.to_lowercase()),
                "flag" => query.flags.push(normalize_flag(&value)),
                "is" => match value.to_lowercase().as_str() {
                    "seen" | "read" => query.flags.push(flags::SEEN.to_string()),
                    "unseen" | "unread" => query.without_flags.push(flags::SEEN.to_string()),
                    "flagged" => query.flags.push(flags::FLAGGED.to_string()),
                    "deleted" => query.flags.push(flags::DELETED.to_string()),
                    _ => {}
                },
                "in" => {
                    if let Ok(id) = value.parse::<i64>() {
                        query.collections.push(id);
                    }
                }
                "before" => {
                    if let Some(date) = parse_date(&value) {
                        query.before = Some(date);
                    }
                }
                "after" => {
                    if let Some(date) = parse_date(&value) {
                        query.after = Some(date);
                    }
                }
                _ => {}
            }
            i += consumed;
        } else {
            let (word, consumed) = parse_quoted_or_bare(&rest);
            if !word.is_empty() {
                query.terms.push(word);
            }
            i += consumed;
        }
    }

    query
}

/// `flagged` and `\flagged` both mean `\FLAGGED`
fn normalize_flag(value: &str) -> String {
    let upper = value.to_uppercase();
    if upper.starts_with('\\') || upper.starts_with('$') {
        upper
    } else {
        format!("\\{}", upper)
    }
}

/// Parse an operator like "mime:value" or "in:\"42\""
fn parse_operator(input: &str) -> Option<(String, String, usize)> {
    let colon_pos = input.find(':')?;
    let key = &input[..colon_pos];

    let valid_ops = ["mime", "flag", "is", "in", "before", "after"];
    if !valid_ops.contains(&key.to_lowercase().as_str()) {
        return None;
    }

    let after_colon = &input[colon_pos + 1..];
    let (value, value_len) = parse_quoted_or_bare(after_colon);
    if value.is_empty() {
        return None;
    }

    Some((key.to_string(), value, colon_pos + 1 + value_len))
}

/// A quoted phrase or a run of non-whitespace; returns it with the number
/// of chars consumed
fn parse_quoted_or_bare(input: &str) -> (String, usize) {
    let chars: Vec<char> = input.chars().collect();

    if chars.first() == Some(&'"') {
        let mut value = String::new();
        let mut i = 1;
        while i < chars.len() && chars[i] != '"' {
            value.push(chars[i]);
            i += 1;
        }
        let consumed = if i < chars.len() { i + 1 } else { i };
        return (value, consumed);
    }

    let value: String = chars.iter().take_while(|c| !c.is_whitespace()).collect();
    let consumed = value.chars().count();
    (value, consumed)
}

/// Parse a date string (YYYY/MM/DD or YYYY-MM-DD)
fn parse_date(input: &str) -> Option<DateTime<Utc>> {
    ["%Y/%m/%d", "%Y-%m-%d"].iter().find_map(|format| {
        NaiveDate::parse_from_str(input, format)
            .ok()?
            .and_hms_opt(0, 0, 0)
            .map(|dt| Utc.from_utc_datetime(&dt))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_query() {
        let query = parse_query("hello world");
        assert_eq!(query.terms, vec!["hello", "world"]);
        assert!(query.mime_types.is_empty());
    }

    #[test]
    fn test_parse_quoted_phrase() {
        let query = parse_query("\"hello world\"");
        assert_eq!(query.terms, vec!["hello world"]);
    }

    #[test]
    fn test_parse_mime_operator() {
        let query = parse_query("mime:Message/RFC822 invoice");
        assert_eq!(query.mime_types, vec!["message/rfc822"]);
        assert_eq!(query.terms, vec!["invoice"]);
    }

    #[test]
    fn test_parse_flags() {
        let query = parse_query("flag:flagged is:unread flag:$TODO");
        assert_eq!(query.flags, vec!["\\FLAGGED", "$TODO"]);
        assert_eq!(query.without_flags, vec!["\\SEEN"]);

        let query = parse_query("is:seen");
        assert_eq!(query.flags, vec!["\\SEEN"]);
    }

    #[test]
    fn test_parse_collection() {
        let query = parse_query("in:42 in:abc");
        assert_eq!(query.collections, vec![42]);
    }

    #[test]
    fn test_parse_date_filters() {
        let query = parse_query("after:2024/01/01 before:2024-12-31");
        assert_eq!(
            query.after.unwrap().format("%Y-%m-%d").to_string(),
            "2024-01-01"
        );
        assert_eq!(
            query.before.unwrap().format("%Y-%m-%d").to_string(),
            "2024-12-31"
        );
    }

    #[test]
    fn test_parse_empty_query() {
        assert!(parse_query("").is_empty());
        assert!(parse_query("   ").is_empty());
    }

    #[test]
    fn test_unknown_operator_is_text() {
        let query = parse_query("foo:bar");
        assert_eq!(query.terms, vec!["foo:bar"]);
    }

    #[test]
    fn test_operator_with_empty_value() {
        let query = parse_query("mime: hello");
        assert!(query.mime_types.is_empty());
        assert_eq!(query.terms, vec!["mime:", "hello"]);
    }
}
