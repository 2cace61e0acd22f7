//! Per-request metric record and its line format.
//!
//! One record becomes one comma-separated, newline-terminated line:
//!
//! | Mode         | Layout                                         |
//! |--------------|------------------------------------------------|
//! | `upstream`   | `start_ms,response_ms,duration_ms,status,peer` |
//! | `local_addr` | `peer,response_ms,duration_ms,status`          |
//!
//! No header, no quoting, no escaping. Lines are capped at
//! [`MAX_LINE_LEN`] bytes; only the peer field is ever shortened.

use perfmetrics_core::config::PeerMode;
use serde::{Deserialize, Serialize};
use std::collections::TryReserveError;
use thiserror::Error;

/// Hard cap on a formatted line, trailing newline included.
pub const MAX_LINE_LEN: usize = 256;

/// Peer identity written when no address is available.
pub const PEER_ABSENT: &str = "-";

const DELIM: u8 = b',';

/// Metrics captured for one request at the log phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricRecord {
    pub mode: PeerMode,
    pub request_start_ms: i64,
    /// May be negative when the wall clock steps backwards.
    pub response_time_ms: i64,
    pub duration_ms: u64,
    pub status: u16,
    pub peer: String,
}

#[derive(Debug, Error)]
pub enum FormatError {
    #[error("line buffer allocation failed: {0}")]
    Alloc(#[from] TryReserveError),
}

/// A line read back from the output file.
///
/// `request_start_ms` is only present in `upstream` mode lines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_start_ms: Option<i64>,
    pub response_time_ms: i64,
    pub duration_ms: u64,
    pub status: u16,
    pub peer: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("expected {expected} fields, found {found}")]
    FieldCount { expected: usize, found: usize },

    #[error("invalid {field}: {value:?}")]
    InvalidField { field: &'static str, value: String },
}

impl MetricRecord {
    /// Render the record as a bounded, newline-terminated line.
    pub fn format_line(&self) -> Result<Vec<u8>, FormatError> {
        let mut buf = Vec::new();
        buf.try_reserve_exact(MAX_LINE_LEN)?;

        let mut ints = itoa::Buffer::new();
        match self.mode {
            PeerMode::Upstream => {
                buf.extend_from_slice(ints.format(self.request_start_ms).as_bytes());
                buf.push(DELIM);
                buf.extend_from_slice(ints.format(self.response_time_ms).as_bytes());
                buf.push(DELIM);
                buf.extend_from_slice(ints.format(self.duration_ms).as_bytes());
                buf.push(DELIM);
                buf.extend_from_slice(ints.format(self.status).as_bytes());
                buf.push(DELIM);
                let room = MAX_LINE_LEN - 1 - buf.len();
                buf.extend_from_slice(truncate_utf8(&self.peer, room).as_bytes());
            }
            PeerMode::LocalAddr => {
                // The numeric tail is never shortened, so size it first.
                let tail_len = 3
                    + ints.format(self.response_time_ms).len()
                    + ints.format(self.duration_ms).len()
                    + ints.format(self.status).len();
                let room = MAX_LINE_LEN - 1 - tail_len;
                buf.extend_from_slice(truncate_utf8(&self.peer, room).as_bytes());
                buf.push(DELIM);
                buf.extend_from_slice(ints.format(self.response_time_ms).as_bytes());
                buf.push(DELIM);
                buf.extend_from_slice(ints.format(self.duration_ms).as_bytes());
                buf.push(DELIM);
                buf.extend_from_slice(ints.format(self.status).as_bytes());
            }
        }
        buf.push(b'\n');

        Ok(buf)
    }

    /// Split a written line back into its fields.
    pub fn parse_line(line: &str, mode: PeerMode) -> Result<ParsedRecord, ParseError> {
        let line = line.trim_end_matches(['\n', '\r']);
        match mode {
            PeerMode::Upstream => {
                let fields: Vec<&str> = line.splitn(5, ',').collect();
                if fields.len() != 5 {
                    return Err(ParseError::FieldCount { expected: 5, found: fields.len() });
                }
                Ok(ParsedRecord {
                    request_start_ms: Some(parse_field("request_start_ms", fields[0])?),
                    response_time_ms: parse_field("response_time_ms", fields[1])?,
                    duration_ms: parse_field("duration_ms", fields[2])?,
                    status: parse_field("status", fields[3])?,
                    peer: fields[4].to_string(),
                })
            }
            PeerMode::LocalAddr => {
                // Numbers sit at the end, so split from the right.
                let fields: Vec<&str> = line.rsplitn(4, ',').collect();
                if fields.len() != 4 {
                    return Err(ParseError::FieldCount { expected: 4, found: fields.len() });
                }
                Ok(ParsedRecord {
                    request_start_ms: None,
                    status: parse_field("status", fields[0])?,
                    duration_ms: parse_field("duration_ms", fields[1])?,
                    response_time_ms: parse_field("response_time_ms", fields[2])?,
                    peer: fields[3].to_string(),
                })
            }
        }
    }

    /// The fields a reader recovers from this record's line.
    pub fn to_parsed(&self) -> ParsedRecord {
        ParsedRecord {
            request_start_ms: match self.mode {
                PeerMode::Upstream => Some(self.request_start_ms),
                PeerMode::LocalAddr => None,
            },
            response_time_ms: self.response_time_ms,
            duration_ms: self.duration_ms,
            status: self.status,
            peer: self.peer.clone(),
        }
    }
}

fn parse_field<T: std::str::FromStr>(field: &'static str, value: &str) -> Result<T, ParseError> {
    value.parse().map_err(|_| ParseError::InvalidField {
        field,
        value: value.to_string(),
    })
}

/// Longest prefix of `s` that fits in `max` bytes without splitting a char.
fn truncate_utf8(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
