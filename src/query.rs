//! CGI-style query-string configuration.
//!
//! The websocket server passes the browser's request parameters through
//! the `QUERY_STRING` environment variable. Two keys matter to the
//! broker: `termid` names the session (and thereby its rendezvous socket
//! and log files), and `pream` is a preamble written to the PTY when the
//! session is first attached.

use std::env;

#[derive(Debug, Default, PartialEq, Eq)]
pub struct Query {
    pub termid: Option<String>,
    /// Kept as raw bytes: the preamble goes verbatim to the PTY and need
    /// not be valid UTF-8 after percent-decoding.
    pub pream: Option<Vec<u8>>,
}

impl Query {
    pub fn from_env() -> Self {
        match env::var("QUERY_STRING") {
            Ok(qs) => Self::parse(&qs),
            Err(_) => Self::default(),
        }
    }

    /// Later occurrences of a key win; unrecognized keys are skipped.
    pub fn parse(qs: &str) -> Self {
        let mut q = Self::default();
        for arg in qs.split('&') {
            if let Some(v) = arg.strip_prefix("termid=") {
                q.termid = Some(String::from_utf8_lossy(&percent_decode(v)).into_owned());
            } else if let Some(v) = arg.strip_prefix("pream=") {
                q.pream = Some(percent_decode(v));
            }
        }
        q
    }
}

/// `%HH` decoding; a `%` not followed by exactly two hex digits stays
/// literal.
fn percent_decode(s: &str) -> Vec<u8> {
    let b = s.as_bytes();
    let mut out = Vec::with_capacity(b.len());
    let mut i = 0;
    while i < b.len() {
        if b[i] == b'%' && i + 2 < b.len() {
            if let (Some(hi), Some(lo)) = (hex_val(b[i + 1]), hex_val(b[i + 2])) {
                out.push(hi << 4 | lo);
                i += 3;
                continue;
            }
        }
        out.push(b[i]);
        i += 1;
    }
    out
}

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn termid_and_pream_extracted() {
        let q = Query::parse("termid=work1&pream=stty%20-echo%0a");
        assert_eq!(q.termid.as_deref(), Some("work1"));
        assert_eq!(q.pream.as_deref(), Some(b"stty -echo\n".as_slice()));
    }

    #[test]
    fn unrecognized_keys_are_skipped() {
        let q = Query::parse("foo=bar&termid=t9&baz=1");
        assert_eq!(q.termid.as_deref(), Some("t9"));
        assert!(q.pream.is_none());
    }

    #[test]
    fn later_occurrence_wins() {
        let q = Query::parse("termid=first&termid=second");
        assert_eq!(q.termid.as_deref(), Some("second"));
    }

    #[test]
    fn malformed_percent_escape_is_literal() {
        let q = Query::parse("pream=50%25%2x%f");
        assert_eq!(q.pream.as_deref(), Some(b"50%%2x%f".as_slice()));
    }

    #[test]
    fn encoded_ampersand_does_not_split_values() {
        let q = Query::parse("pream=a%26b&termid=t");
        assert_eq!(q.pream.as_deref(), Some(b"a&b".as_slice()));
        assert_eq!(q.termid.as_deref(), Some("t"));
    }

    #[test]
    fn empty_and_missing_values() {
        let q = Query::parse("");
        assert_eq!(q, Query::default());
        let q = Query::parse("termid=");
        assert_eq!(q.termid.as_deref(), Some(""));
    }
}
