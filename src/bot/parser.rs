//! Command prefix recognition.
use chrono::{DateTime, Utc};
use log::debug;

use crate::logutil::escape_log;

/// A request extracted from a prefixed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub source_id: String,
    /// Never empty
    pub text: String,
    pub submitted_at: DateTime<Utc>,
}

/// Why a text message did not produce a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseNoOp {
    NotCommand,
    EmptyQuery,
}

/// Strip `prefix` once and trim. Returns the query text or the reason there is none.
pub fn parse_text<'a>(text: &'a str, prefix: &str) -> Result<&'a str, ParseNoOp> {
    let rest = text.strip_prefix(prefix).ok_or(ParseNoOp::NotCommand)?;
    let rest = rest.trim();
    if rest.is_empty() {
        debug!("Empty query after prefix: '{}'", escape_log(text));
        return Err(ParseNoOp::EmptyQuery);
    }
    Ok(rest)
}

pub fn parse(text: &str, prefix: &str) -> Option<Query> {
    parse_from("", text, prefix).ok()
}

/// Like [`parse`] but keeps the sender and the no-op reason.
pub fn parse_from(source_id: &str, text: &str, prefix: &str) -> Result<Query, ParseNoOp> {
    let body = parse_text(text, prefix)?;
    Ok(Query {
        source_id: source_id.to_string(),
        text: body.to_string(),
        submitted_at: Utc::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefixed_text_becomes_query() {
        assert_eq!(parse("!hello", "!").unwrap().text, "hello");
        assert_eq!(parse("!  what is LoRa?  ", "!").unwrap().text, "what is LoRa?");
    }

    #[test]
    fn unprefixed_or_empty_is_no_op() {
        assert!(parse("hello", "!").is_none());
        assert!(parse(" !hello", "!").is_none());
        assert_eq!(parse_from("!a", "!   ", "!"), Err(ParseNoOp::EmptyQuery));
        assert_eq!(parse_from("!a", "", "!"), Err(ParseNoOp::NotCommand));
    }

    #[test]
    fn prefix_is_stripped_once() {
        assert_eq!(parse("!!cmd", "!").unwrap().text, "!cmd");
    }

    #[test]
    fn multi_char_prefix() {
        let q = parse_from("!1234abcd", "@ai tell me a joke", "@ai").unwrap();
        assert_eq!(q.text, "tell me a joke");
        assert_eq!(q.source_id, "!1234abcd");
        assert!(parse("@a hi", "@ai").is_none());
    }

    #[test]
    fn inner_whitespace_is_kept() {
        assert_eq!(parse("!a  b\tc", "!").unwrap().text, "a  b\tc");
    }
}
