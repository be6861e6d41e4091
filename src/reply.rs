//! The store's reply representation.
//!
//! `ReplyValue` is what the command dispatcher produces for every command
//! and what a script invocation ultimately turns into. The wire codec that
//! frames it lives outside this crate.

use bytes::Bytes;

/// A typed command reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyValue {
    /// A signed 64-bit integer reply.
    Integer(i64),
    /// The nil reply.
    Nil,
    /// A binary-safe bulk string.
    Bulk(Bytes),
    /// A single-line status reply such as `OK`.
    Status(Bytes),
    /// An error reply; the payload is the full message, code included.
    Error(Bytes),
    /// An ordered sequence of replies.
    Array(Vec<ReplyValue>),
}

impl ReplyValue {
    /// Creates a bulk string reply.
    pub fn bulk(data: impl Into<Bytes>) -> Self {
        ReplyValue::Bulk(data.into())
    }

    /// Creates a status reply.
    pub fn status(msg: impl Into<Bytes>) -> Self {
        ReplyValue::Status(msg.into())
    }

    /// Creates an error reply.
    pub fn error(msg: impl Into<Bytes>) -> Self {
        ReplyValue::Error(msg.into())
    }

    /// The `+OK` status reply.
    pub fn ok() -> Self {
        ReplyValue::Status(Bytes::from_static(b"OK"))
    }

    /// Returns true for error replies.
    pub fn is_error(&self) -> bool {
        matches!(self, ReplyValue::Error(_))
    }
}

impl From<crate::Error> for ReplyValue {
    fn from(err: crate::Error) -> Self {
        ReplyValue::Error(Bytes::from(err.to_string()))
    }
}
