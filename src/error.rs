//! The typed error taxonomy for the runtime.
//!
//! Every variant here corresponds to one of the wire-visible RPC reply codes;
//! `std::io::Error` from the socket layer and ad-hoc codec failures are folded
//! in so a single type can flow from the reactor down to a waiting coroutine.

use std::io;

/// Errors surfaced across the reactor, channel, coroutine, and RPC layers.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A coroutine panicked while it held an outstanding RPC call.
    #[error("coroutine raised an exception while processing the call")]
    CoroutineException,

    /// A coroutine reached `Done(Failed)` without a panic (explicit failure return).
    #[error("coroutine failed to complete the call")]
    CoroutineFailed,

    /// `protocol_id` did not match any registered handler.
    #[error("unknown protocol id {0}")]
    UnknownProtocol(u16),

    /// The allocator or a bounded buffer refused to grow further.
    #[error("allocation failure")]
    AllocFailure,

    /// An RPC primitive was invoked from outside a coroutine context.
    #[error("operation requires an active coroutine")]
    NotInCoroutine,

    /// The channel's send buffer is at its configured capacity.
    #[error("send buffer is full")]
    BuffFull,

    /// A call did not receive a response within its caller-imposed deadline.
    #[error("call timed out")]
    Timeout,

    /// The header codec rejected the frame as malformed.
    #[error("invalid response framing")]
    InvalidResponseFraming,

    /// Lower-level I/O failure (socket, poll registration).
    #[error(transparent)]
    Io(#[from] io::Error),

    /// A codec could not encode or decode a value.
    #[error("codec error: {0}")]
    Codec(String),
}

/// The RPC error code occupying the `retcode` field of a sub-frame (see
/// the external-interfaces section of the runtime's wire format).
#[derive(Copy, Clone, Debug, Eq, PartialEq, num_derive::FromPrimitive, num_derive::ToPrimitive)]
#[repr(u8)]
pub enum RetCode {
    Success = 0,
    CoroutineException = 1,
    CoroutineFailed = 2,
    UnknownProtocol = 3,
    AllocFailure = 4,
    NotInCoroutine = 5,
    BuffFull = 6,
    Timeout = 7,
    InvalidResponseFraming = 8,
}

impl From<&Error> for RetCode {
    fn from(err: &Error) -> Self {
        match err {
            Error::CoroutineException => RetCode::CoroutineException,
            Error::CoroutineFailed => RetCode::CoroutineFailed,
            Error::UnknownProtocol(_) => RetCode::UnknownProtocol,
            Error::AllocFailure => RetCode::AllocFailure,
            Error::NotInCoroutine => RetCode::NotInCoroutine,
            Error::BuffFull => RetCode::BuffFull,
            Error::Timeout => RetCode::Timeout,
            Error::InvalidResponseFraming => RetCode::InvalidResponseFraming,
            Error::Io(_) | Error::Codec(_) => RetCode::CoroutineFailed,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
