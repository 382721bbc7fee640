//! QUIC Error Types
//!
//! RFC 9000 Section 20 defines the transport error space carried in
//! CONNECTION_CLOSE frames. Codec failures, transport errors and TLS alerts
//! all flow through the single [`Error`] type; the connection state machine
//! maps them onto a close code with [`Error::transport_code`].

#![forbid(unsafe_code)]

use crate::types::{ConnectionId, StreamId};
use core::fmt;
use thiserror::Error;

/// Transport Error Codes as defined in RFC 9000 Section 20.1
///
/// These errors trigger immediate connection closure and are sent in
/// CONNECTION_CLOSE frames of type 0x1c.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u64)]
pub enum TransportError {
    /// No error (0x00) - Used for graceful shutdown
    NoError = 0x00,

    /// Internal Error (0x01) - Implementation error
    InternalError = 0x01,

    /// Connection Refused (0x02) - Server refuses connection
    ConnectionRefused = 0x02,

    /// Flow Control Error (0x03) - Peer exceeded flow control limits
    FlowControlError = 0x03,

    /// Stream Limit Error (0x04) - Stream limit exceeded
    StreamLimitError = 0x04,

    /// Stream State Error (0x05) - Frame received in invalid stream state
    StreamStateError = 0x05,

    /// Final Size Error (0x06) - Final size violation
    FinalSizeError = 0x06,

    /// Frame Encoding Error (0x07) - Frame encoding error
    FrameEncodingError = 0x07,

    /// Transport Parameter Error (0x08) - Invalid transport parameters
    TransportParameterError = 0x08,

    /// Connection ID Limit Error (0x09) - Connection ID limit exceeded
    ConnectionIdLimitError = 0x09,

    /// Protocol Violation (0x0a) - Generic protocol violation
    ProtocolViolation = 0x0a,

    /// Invalid Token (0x0b)
    InvalidToken = 0x0b,

    /// Application Error (0x0c) - Application closed connection
    ApplicationError = 0x0c,

    /// Crypto Buffer Exceeded (0x0d) - CRYPTO data buffer overflowed
    CryptoBufferExceeded = 0x0d,

    /// Key Update Error (0x0e)
    KeyUpdateError = 0x0e,

    /// AEAD Limit Reached (0x0f)
    AeadLimitReached = 0x0f,

    /// No Viable Path (0x10)
    NoViablePath = 0x10,
}

impl TransportError {
    /// Wire value of the error code.
    pub fn code(self) -> u64 {
        self as u64
    }

    /// Map a wire value back to a transport error, if it is one of ours.
    pub fn from_code(code: u64) -> Option<Self> {
        use TransportError::*;
        Some(match code {
            0x00 => NoError,
            0x01 => InternalError,
            0x02 => ConnectionRefused,
            0x03 => FlowControlError,
            0x04 => StreamLimitError,
            0x05 => StreamStateError,
            0x06 => FinalSizeError,
            0x07 => FrameEncodingError,
            0x08 => TransportParameterError,
            0x09 => ConnectionIdLimitError,
            0x0a => ProtocolViolation,
            0x0b => InvalidToken,
            0x0c => ApplicationError,
            0x0d => CryptoBufferExceeded,
            0x0e => KeyUpdateError,
            0x0f => AeadLimitReached,
            0x10 => NoViablePath,
            _ => return None,
        })
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportError::NoError => "NO_ERROR",
            TransportError::InternalError => "INTERNAL_ERROR",
            TransportError::ConnectionRefused => "CONNECTION_REFUSED",
            TransportError::FlowControlError => "FLOW_CONTROL_ERROR",
            TransportError::StreamLimitError => "STREAM_LIMIT_ERROR",
            TransportError::StreamStateError => "STREAM_STATE_ERROR",
            TransportError::FinalSizeError => "FINAL_SIZE_ERROR",
            TransportError::FrameEncodingError => "FRAME_ENCODING_ERROR",
            TransportError::TransportParameterError => "TRANSPORT_PARAMETER_ERROR",
            TransportError::ConnectionIdLimitError => "CONNECTION_ID_LIMIT_ERROR",
            TransportError::ProtocolViolation => "PROTOCOL_VIOLATION",
            TransportError::InvalidToken => "INVALID_TOKEN",
            TransportError::ApplicationError => "APPLICATION_ERROR",
            TransportError::CryptoBufferExceeded => "CRYPTO_BUFFER_EXCEEDED",
            TransportError::KeyUpdateError => "KEY_UPDATE_ERROR",
            TransportError::AeadLimitReached => "AEAD_LIMIT_REACHED",
            TransportError::NoViablePath => "NO_VIABLE_PATH",
        };
        f.write_str(name)
    }
}

/// Base of the CRYPTO_ERROR range (RFC 9001 Section 4.8).
///
/// TLS alert codes are carried as `0x0100 + alert`.
pub const CRYPTO_ERROR_BASE: u64 = 0x0100;

/// TLS alert: unexpected_message
pub const ALERT_UNEXPECTED_MESSAGE: u8 = 10;

/// TLS alert: handshake_failure
pub const ALERT_HANDSHAKE_FAILURE: u8 = 40;

/// TLS alert: missing_extension
pub const ALERT_MISSING_EXTENSION: u8 = 109;

/// Generic Result Type for QUIC Operations
pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for codec, state machine and application calls.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A tag or length field does not describe the bytes that follow.
    #[error("malformed encoding: {0}")]
    MalformedEncoding(&'static str),

    /// A varint declared more bytes than remain in the buffer.
    #[error("truncated varint: needed {needed} bytes, {available} available")]
    TruncatedVarint { needed: usize, available: usize },

    /// A byte range reaches past the end of its sequence.
    #[error("range {lo}..{hi} out of bounds for length {len}")]
    OutOfRange { lo: usize, hi: usize, len: usize },

    /// Connection-fatal transport error.
    #[error("{code}: {reason}")]
    Transport {
        code: TransportError,
        reason: &'static str,
    },

    /// TLS alert raised while processing the handshake.
    #[error("crypto error: TLS alert {alert}")]
    Crypto { alert: u8 },

    /// Application call named a connection the registry does not hold.
    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),

    /// Application call on a connection that no longer accepts data.
    #[error("connection is closing or closed")]
    ConnectionClosed,

    /// Application call that the stream's current state forbids.
    #[error("stream {stream_id:?}: {reason}")]
    InvalidStreamOperation {
        stream_id: StreamId,
        reason: &'static str,
    },

    /// Application write exceeds the credit granted by the peer.
    #[error("stream {stream_id:?} blocked by peer flow control")]
    Blocked { stream_id: StreamId },
}

impl Error {
    pub fn transport(code: TransportError, reason: &'static str) -> Self {
        Error::Transport { code, reason }
    }

    pub fn protocol_violation(reason: &'static str) -> Self {
        Self::transport(TransportError::ProtocolViolation, reason)
    }

    pub fn frame_encoding(reason: &'static str) -> Self {
        Self::transport(TransportError::FrameEncodingError, reason)
    }

    pub fn flow_control(reason: &'static str) -> Self {
        Self::transport(TransportError::FlowControlError, reason)
    }

    pub fn stream_state(reason: &'static str) -> Self {
        Self::transport(TransportError::StreamStateError, reason)
    }

    pub fn final_size(reason: &'static str) -> Self {
        Self::transport(TransportError::FinalSizeError, reason)
    }

    pub fn stream_limit(reason: &'static str) -> Self {
        Self::transport(TransportError::StreamLimitError, reason)
    }

    pub fn connection_id_limit(reason: &'static str) -> Self {
        Self::transport(TransportError::ConnectionIdLimitError, reason)
    }

    pub fn transport_parameter(reason: &'static str) -> Self {
        Self::transport(TransportError::TransportParameterError, reason)
    }

    /// True for failures of the byte-level codec.
    pub fn is_codec(&self) -> bool {
        matches!(
            self,
            Error::MalformedEncoding(_) | Error::TruncatedVarint { .. } | Error::OutOfRange { .. }
        )
    }

    /// True when the error must close the connection it arose on.
    pub fn is_connection_fatal(&self) -> bool {
        self.is_codec() || matches!(self, Error::Transport { .. } | Error::Crypto { .. })
    }

    /// The transport error this condition is reported as, if any.
    pub fn transport_error(&self) -> Option<TransportError> {
        match self {
            Error::Transport { code, .. } => Some(*code),
            e if e.is_codec() => Some(TransportError::FrameEncodingError),
            _ => None,
        }
    }

    /// Error code carried in the CONNECTION_CLOSE frame for this condition.
    pub fn transport_code(&self) -> u64 {
        match self {
            Error::Crypto { alert } => CRYPTO_ERROR_BASE + u64::from(*alert),
            other => other
                .transport_error()
                .unwrap_or(TransportError::InternalError)
                .code(),
        }
    }
}
