use parking_lot::Mutex;
use spyglass_wire::{ClientMessage, encode_client_message_default};
use std::error::Error;
use std::fmt;
use std::sync::Arc;

/// Failures inside the capture path. All of them are absorbed before an
/// intercepted call returns to the application.
#[derive(Debug)]
pub enum SpyError {
    SymbolNotFound(String),
    FramebufferUnavailable,
    Encoding(String),
    ConnectionLost,
}

impl fmt::Display for SpyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SymbolNotFound(name) => write!(f, "symbol not found: {name}"),
            Self::FramebufferUnavailable => {
                write!(f, "no bound render target with queryable dimensions")
            }
            Self::Encoding(reason) => write!(f, "record encoding failed: {reason}"),
            Self::ConnectionLost => write!(f, "trace connection lost"),
        }
    }
}

impl Error for SpyError {}

impl From<spyglass_capture::CaptureError> for SpyError {
    fn from(value: spyglass_capture::CaptureError) -> Self {
        match value {
            // A failed readback is "nothing to sample here", same as a
            // missing render target.
            spyglass_capture::CaptureError::FramebufferUnavailable
            | spyglass_capture::CaptureError::ReadbackFailed(_) => Self::FramebufferUnavailable,
            spyglass_capture::CaptureError::SymbolNotFound(name) => Self::SymbolNotFound(name),
            other => Self::Encoding(other.to_string()),
        }
    }
}

/// The ordered byte sink the encoder writes finished frames to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionLost;

impl fmt::Display for ConnectionLost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "connection lost")
    }
}

impl Error for ConnectionLost {}

pub trait Connection: Send {
    fn send(&mut self, frame: &[u8]) -> Result<(), ConnectionLost>;
}

/// Discards every frame. Used when no stream address is configured, so the
/// spy still exercises the full capture path without a peer.
#[derive(Debug, Default)]
pub struct NullConnection;

impl Connection for NullConnection {
    fn send(&mut self, _frame: &[u8]) -> Result<(), ConnectionLost> {
        Ok(())
    }
}

/// In-memory sink capturing encoded frames for inspection.
#[derive(Debug, Default)]
pub struct MemoryConnection {
    frames: Arc<Mutex<Vec<Vec<u8>>>>,
    fail_after: Option<usize>,
}

impl MemoryConnection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts failing once `count` frames have been accepted.
    pub fn failing_after(count: usize) -> Self {
        Self {
            frames: Arc::new(Mutex::new(Vec::new())),
            fail_after: Some(count),
        }
    }

    /// Shared handle to the accepted frames.
    pub fn frames_handle(&self) -> Arc<Mutex<Vec<Vec<u8>>>> {
        Arc::clone(&self.frames)
    }
}

impl Connection for MemoryConnection {
    fn send(&mut self, frame: &[u8]) -> Result<(), ConnectionLost> {
        let mut frames = self.frames.lock();
        if let Some(limit) = self.fail_after {
            if frames.len() >= limit {
                return Err(ConnectionLost);
            }
        }
        frames.push(frame.to_vec());
        Ok(())
    }
}

/// Serializes finished records and hands the framed bytes to the connection.
///
/// A single logical writer: the dispatcher invokes it from inside its
/// critical section, so frames reach the connection in the order dispatch
/// decided to encode them. After the first `ConnectionLost` every further
/// encode short-circuits.
pub struct Encoder {
    connection: Box<dyn Connection>,
    lost: bool,
}

impl Encoder {
    pub fn new(connection: Box<dyn Connection>) -> Self {
        Self {
            connection,
            lost: false,
        }
    }

    pub fn is_lost(&self) -> bool {
        self.lost
    }

    pub fn encode(&mut self, message: &ClientMessage) -> Result<(), SpyError> {
        if self.lost {
            return Err(SpyError::ConnectionLost);
        }
        let frame =
            encode_client_message_default(message).map_err(|e| SpyError::Encoding(e.to_string()))?;
        match self.connection.send(&frame) {
            Ok(()) => Ok(()),
            Err(ConnectionLost) => {
                self.lost = true;
                Err(SpyError::ConnectionLost)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spyglass_types::TraceHeader;

    fn header_message() -> ClientMessage {
        ClientMessage::Header(TraceHeader {
            process_name: "quadbench".into(),
            pid: 1,
            capture_frames: 1,
            observe_frame_frequency: 0,
            observe_draw_frequency: 0,
        })
    }

    #[test]
    fn encoder_frames_reach_the_connection_in_order() {
        let connection = MemoryConnection::new();
        let frames = connection.frames_handle();
        let mut encoder = Encoder::new(Box::new(connection));

        encoder.encode(&header_message()).expect("encode should succeed");
        encoder.encode(&header_message()).expect("encode should succeed");
        assert_eq!(frames.lock().len(), 2);
        assert!(!encoder.is_lost());
    }

    #[test]
    fn lost_connection_short_circuits_further_encodes() {
        let connection = MemoryConnection::failing_after(1);
        let frames = connection.frames_handle();
        let mut encoder = Encoder::new(Box::new(connection));

        encoder.encode(&header_message()).expect("first encode should succeed");
        let err = encoder.encode(&header_message()).unwrap_err();
        assert!(matches!(err, SpyError::ConnectionLost));
        assert!(encoder.is_lost());

        let err = encoder.encode(&header_message()).unwrap_err();
        assert!(matches!(err, SpyError::ConnectionLost));
        assert_eq!(frames.lock().len(), 1);
    }
}
