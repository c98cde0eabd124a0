//! Memcached text protocol, client side.
//!
//! Encodes the requests the client issues and parses the server's replies:
//! - Retrieval: get
//! - Storage: set
//! - Deletion: delete
//! - Other: touch, version

use bytes::{BufMut, Bytes, BytesMut};
use std::str;

/// Maximum key length allowed by memcached protocol
pub const MAX_KEY_LENGTH: usize = 250;

/// Largest value a server may announce in a VALUE header (memcached's default item size)
pub const MAX_VALUE_SIZE: usize = 1024 * 1024;

/// A request sent to the server
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    /// Fetch a single key
    Get { key: String },

    /// Store a value
    Set {
        key: String,
        flags: u32,
        exptime: u32,
        data: Bytes,
    },

    /// Delete a key
    Delete { key: String },

    /// Update the expiration of a key
    Touch { key: String, exptime: u32 },

    /// Ask for the server version (used as a readiness probe)
    Version,
}

impl Request {
    /// Append the wire form of this request to `out`
    pub fn encode(&self, out: &mut BytesMut) {
        match self {
            Request::Get { key } => {
                out.put_slice(format!("get {}\r\n", key).as_bytes());
            }
            Request::Set {
                key,
                flags,
                exptime,
                data,
            } => {
                out.put_slice(
                    format!("set {} {} {} {}\r\n", key, flags, exptime, data.len()).as_bytes(),
                );
                out.put_slice(data);
                out.put_slice(b"\r\n");
            }
            Request::Delete { key } => {
                out.put_slice(format!("delete {}\r\n", key).as_bytes());
            }
            Request::Touch { key, exptime } => {
                out.put_slice(format!("touch {} {}\r\n", key, exptime).as_bytes());
            }
            Request::Version => out.put_slice(b"version\r\n"),
        }
    }

    /// The shape of reply this request expects
    pub fn reply_kind(&self) -> ReplyKind {
        match self {
            Request::Get { .. } => ReplyKind::Retrieval,
            Request::Set { .. } => ReplyKind::Storage,
            Request::Delete { .. } => ReplyKind::Deletion,
            Request::Touch { .. } => ReplyKind::Touch,
            Request::Version => ReplyKind::Version,
        }
    }
}

/// Reply shapes, used to pick the parser for the next pending request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    Retrieval,
    Storage,
    Deletion,
    Touch,
    Version,
}

/// A parsed server reply
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Result of a get; `None` when the key was not found
    Value(Option<Bytes>),
    Stored,
    NotStored,
    Exists,
    Deleted,
    Touched,
    NotFound,
    Version(String),
    /// Plain ERROR (unknown command)
    Error,
    /// CLIENT_ERROR <message>
    ClientError(String),
    /// SERVER_ERROR <message>
    ServerError(String),
}

/// Reply parsing errors
#[derive(Debug, Clone, PartialEq)]
pub enum ParseError {
    /// Line did not match any reply valid for the pending request
    UnexpectedReply(String),
    /// Malformed VALUE header
    InvalidValueHeader(String),
    /// Invalid UTF-8 in a reply line
    InvalidUtf8,
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseError::UnexpectedReply(line) => write!(f, "Unexpected reply: {}", line),
            ParseError::InvalidValueHeader(line) => write!(f, "Invalid VALUE header: {}", line),
            ParseError::InvalidUtf8 => write!(f, "Invalid UTF-8 in reply"),
        }
    }
}

impl std::error::Error for ParseError {}

/// Result of parsing a reply
#[derive(Debug)]
pub enum ParseResult {
    /// Successfully parsed reply with bytes consumed
    Complete(Reply, usize),
    /// Need more data to complete parsing
    Incomplete,
    /// Parse error; the stream can no longer be trusted
    Error(ParseError),
}

/// Parser for memcached replies
pub struct Parser;

impl Parser {
    /// Parse one reply of the given kind from the front of `buffer`
    pub fn parse(buffer: &[u8], kind: ReplyKind) -> ParseResult {
        let line_end = match find_crlf(buffer) {
            Some(pos) => pos,
            None => return ParseResult::Incomplete,
        };

        let line = match str::from_utf8(&buffer[..line_end]) {
            Ok(s) => s,
            Err(_) => return ParseResult::Error(ParseError::InvalidUtf8),
        };
        let line_bytes = line_end + 2; // Include \r\n

        // Error replies are valid for any request
        if let Some(reply) = Self::parse_error_line(line) {
            return ParseResult::Complete(reply, line_bytes);
        }

        match kind {
            ReplyKind::Retrieval => Self::parse_retrieval(buffer, line, line_bytes),
            ReplyKind::Storage => match line {
                "STORED" => ParseResult::Complete(Reply::Stored, line_bytes),
                "NOT_STORED" => ParseResult::Complete(Reply::NotStored, line_bytes),
                "EXISTS" => ParseResult::Complete(Reply::Exists, line_bytes),
                "NOT_FOUND" => ParseResult::Complete(Reply::NotFound, line_bytes),
                _ => Self::unexpected(line),
            },
            ReplyKind::Deletion => match line {
                "DELETED" => ParseResult::Complete(Reply::Deleted, line_bytes),
                "NOT_FOUND" => ParseResult::Complete(Reply::NotFound, line_bytes),
                _ => Self::unexpected(line),
            },
            ReplyKind::Touch => match line {
                "TOUCHED" => ParseResult::Complete(Reply::Touched, line_bytes),
                "NOT_FOUND" => ParseResult::Complete(Reply::NotFound, line_bytes),
                _ => Self::unexpected(line),
            },
            ReplyKind::Version => match line.strip_prefix("VERSION ") {
                Some(version) => {
                    ParseResult::Complete(Reply::Version(version.to_string()), line_bytes)
                }
                None => Self::unexpected(line),
            },
        }
    }

    /// Recognize ERROR / CLIENT_ERROR / SERVER_ERROR lines
    fn parse_error_line(line: &str) -> Option<Reply> {
        if line == "ERROR" {
            return Some(Reply::Error);
        }
        if let Some(msg) = line.strip_prefix("CLIENT_ERROR") {
            return Some(Reply::ClientError(msg.trim_start().to_string()));
        }
        if let Some(msg) = line.strip_prefix("SERVER_ERROR") {
            return Some(Reply::ServerError(msg.trim_start().to_string()));
        }
        None
    }

    /// Parse `END` or `VALUE <key> <flags> <bytes> [<cas>]\r\n<data>\r\nEND\r\n`
    fn parse_retrieval(buffer: &[u8], line: &str, line_bytes: usize) -> ParseResult {
        if line == "END" {
            return ParseResult::Complete(Reply::Value(None), line_bytes);
        }

        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.first() != Some(&"VALUE") {
            return Self::unexpected(line);
        }
        if parts.len() < 4 {
            return ParseResult::Error(ParseError::InvalidValueHeader(line.to_string()));
        }

        let data_bytes = match parts[3].parse::<usize>() {
            Ok(b) if b <= MAX_VALUE_SIZE => b,
            _ => return ParseResult::Error(ParseError::InvalidValueHeader(line.to_string())),
        };

        // Data block, its \r\n, then the END line
        let (data_end, total_needed) = match line_bytes
            .checked_add(data_bytes)
            .and_then(|end| Some((end, end.checked_add(2 + 5)?)))
        {
            Some(bounds) => bounds,
            None => return ParseResult::Error(ParseError::InvalidValueHeader(line.to_string())),
        };
        if buffer.len() < total_needed {
            return ParseResult::Incomplete;
        }

        if &buffer[data_end..data_end + 2] != b"\r\n" {
            return ParseResult::Error(ParseError::InvalidValueHeader(
                "Data block must end with \\r\\n".to_string(),
            ));
        }
        if &buffer[data_end + 2..total_needed] != b"END\r\n" {
            return ParseResult::Error(ParseError::UnexpectedReply(
                "Expected END after value".to_string(),
            ));
        }

        let data = Bytes::copy_from_slice(&buffer[line_bytes..data_end]);
        ParseResult::Complete(Reply::Value(Some(data)), total_needed)
    }

    fn unexpected(line: &str) -> ParseResult {
        ParseResult::Error(ParseError::UnexpectedReply(line.to_string()))
    }
}

/// Check that `key` can be sent in a text protocol command line.
///
/// Keys must be 1 to 250 bytes with no whitespace or control characters.
pub fn validate_key(key: &str) -> Result<(), String> {
    if key.is_empty() {
        return Err("key is empty".to_string());
    }
    if key.len() > MAX_KEY_LENGTH {
        return Err(format!("key exceeds {} bytes", MAX_KEY_LENGTH));
    }
    if key.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(format!("key contains whitespace or control characters: {:?}", key));
    }
    Ok(())
}

/// Find \r\n in buffer
fn find_crlf(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|w| w == b"\r\n")
}
