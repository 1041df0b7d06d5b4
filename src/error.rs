//! Error types for the android auto usb stack

use crate::ChannelId;
use thiserror::Error;

/// The error type for every fallible operation in the crate
#[derive(Debug, Error)]
pub enum AutoError {
    /// A plain i/o failure on the transport
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    /// A failure reported by the usb stack
    #[error("usb error: {0}")]
    Usb(#[from] rusb::Error),
    /// A step of the accessory mode query chain failed
    #[error("accessory mode query step {step} failed: {source}")]
    AoapQuery {
        /// Which of the eight query steps failed, 1-based
        step: u8,
        /// The usb error returned for the control transfer
        source: rusb::Error,
    },
    /// The byte stream could not be parsed as a frame
    #[error("malformed frame: {0}")]
    Framing(String),
    /// The tls engine failed
    #[error("tls failure during {stage}: {source}")]
    Crypto {
        /// Which cryptor operation failed
        stage: &'static str,
        /// The error reported by the tls engine
        source: rustls::Error,
    },
    /// The peer violated the protocol
    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolViolation),
    /// The operation was cancelled before it completed
    #[error("operation cancelled")]
    Cancelled,
    /// The operation did not complete in time
    #[error("operation timed out")]
    Timeout,
    /// The peer asked for an orderly shutdown of the session
    #[error("remote requested shutdown")]
    Shutdown,
    /// There is no active session to operate on
    #[error("no active session")]
    NotConnected,
}

/// The ways a peer can violate the android auto protocol
#[derive(Debug, Error)]
pub enum ProtocolViolation {
    /// A message arrived that is not legal in the current state
    #[error("unexpected message {message_id:#06x} in state {state}")]
    UnexpectedMessage {
        /// The message id that was received
        message_id: u16,
        /// The name of the state the control channel was in
        state: &'static str,
    },
    /// The peer runs an incompatible protocol version
    #[error("version mismatch, peer is {major}.{minor}")]
    VersionMismatch {
        /// The major version reported by the peer
        major: u16,
        /// The minor version reported by the peer
        minor: u16,
    },
    /// A first frame arrived while an earlier message was still being reassembled
    #[error("new message started on channel {0:?} with reassembly in progress")]
    ReassemblyClash(ChannelId),
    /// A plaintext frame arrived after the session was established
    #[error("unencrypted frame on established session, channel {0:?}")]
    MissingEncryption(ChannelId),
    /// A frame carried a channel id outside the fixed channel table
    #[error("unknown channel id {0}")]
    UnknownChannel(u8),
    /// A message payload failed to decode
    #[error("undecodable message: {0}")]
    Decode(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_contains_step() {
        let e = AutoError::AoapQuery {
            step: 3,
            source: rusb::Error::Pipe,
        };
        let msg = format!("{}", e);
        assert!(msg.contains("step 3"));
    }

    #[test]
    fn violation_displays_message_id_in_hex() {
        let e = ProtocolViolation::UnexpectedMessage {
            message_id: 0x0005,
            state: "VersionPending",
        };
        assert!(format!("{}", e).contains("0x0005"));
    }
}
