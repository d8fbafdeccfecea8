use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvariantError {
    ZeroId(&'static str),
    EmptyField(&'static str),
    PixelSizeMismatch { expected: usize, actual: usize },
}

impl fmt::Display for InvariantError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ZeroId(field) => write!(f, "{field} must be non-zero"),
            Self::EmptyField(field) => write!(f, "{field} must be non-empty"),
            Self::PixelSizeMismatch { expected, actual } => {
                write!(f, "pixel data must be {expected} bytes, got {actual}")
            }
        }
    }
}

impl Error for InvariantError {}

/// Identity of a graphics context created by the application.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct ContextId(u64);

impl ContextId {
    pub fn new(value: u64) -> Result<Self, InvariantError> {
        if value == 0 {
            return Err(InvariantError::ZeroId("context_id"));
        }
        Ok(Self(value))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx#{:x}", self.0)
    }
}

/// Identity of an application thread issuing intercepted calls.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct ThreadId(u64);

impl ThreadId {
    pub fn new(value: u64) -> Result<Self, InvariantError> {
        if value == 0 {
            return Err(InvariantError::ZeroId("thread_id"));
        }
        Ok(Self(value))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "thread#{}", self.0)
    }
}

/// A GL error code as returned by `glGetError`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct GlError(u32);

impl GlError {
    pub const NO_ERROR: GlError = GlError(0);
    pub const INVALID_ENUM: GlError = GlError(0x0500);
    pub const INVALID_VALUE: GlError = GlError(0x0501);
    pub const INVALID_OPERATION: GlError = GlError(0x0502);
    pub const OUT_OF_MEMORY: GlError = GlError(0x0505);
    pub const INVALID_FRAMEBUFFER_OPERATION: GlError = GlError(0x0506);

    pub fn from_raw(value: u32) -> Self {
        Self(value)
    }

    pub fn raw(self) -> u32 {
        self.0
    }

    pub fn is_error(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for GlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GL_0x{:04x}", self.0)
    }
}

/// GL query enums the interception layer cares about.
pub mod glenum {
    pub const EXTENSIONS: u32 = 0x1F03;
    pub const NUM_PROGRAM_BINARY_FORMATS: u32 = 0x87FE;
    pub const PROGRAM_BINARY_FORMATS: u32 = 0x87FF;
    pub const NUM_SHADER_BINARY_FORMATS: u32 = 0x8DF9;
    pub const SHADER_BINARY_FORMATS: u32 = 0x8DF8;
}

/// The extension string hidden when precompiled-shader support is disabled.
pub const PROGRAM_BINARY_EXTENSION: &str = "GL_OES_get_program_binary";

/// Which API surface a frame/draw boundary belongs to.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ApiKind {
    Gles,
    Vulkan,
}

/// A recorded call argument, flattened to a small tagged value.
///
/// Large binary blobs (program/shader binaries, pixel uploads) are recorded
/// by length only; the replay side never needs driver-specific binary
/// contents.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ArgValue {
    U64(u64),
    I64(i64),
    Bool(bool),
    Str(String),
    Blob { len: u64 },
}

/// One intercepted call as it appears in the trace.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CallRecord {
    pub name: String,
    pub thread_id: ThreadId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_id: Option<ContextId>,
    pub args: Vec<ArgValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ret: Option<ArgValue>,
    pub frame_boundary: bool,
}

/// Pixel contents of the currently bound render target, RGBA8.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct FramebufferObservation {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

impl FramebufferObservation {
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> Result<Self, InvariantError> {
        let expected = width as usize * height as usize * 4;
        if data.len() != expected {
            return Err(InvariantError::PixelSizeMismatch {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }
}

/// One unit of the output trace.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TraceAtom {
    Call(CallRecord),
    Framebuffer(FramebufferObservation),
    ThreadSwitch { thread_id: ThreadId },
}

impl TraceAtom {
    pub fn is_frame_boundary(&self) -> bool {
        match self {
            Self::Call(call) => call.frame_boundary,
            _ => false,
        }
    }
}

/// Written exactly once, before the first recorded atom.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TraceHeader {
    pub process_name: String,
    pub pid: u32,
    pub capture_frames: u32,
    pub observe_frame_frequency: u32,
    pub observe_draw_frequency: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_reject_zero() {
        assert_eq!(
            ContextId::new(0),
            Err(InvariantError::ZeroId("context_id"))
        );
        assert_eq!(ThreadId::new(0), Err(InvariantError::ZeroId("thread_id")));
        assert_eq!(ContextId::new(7).map(ContextId::get), Ok(7));
    }

    #[test]
    fn framebuffer_observation_validates_pixel_size() {
        let obs = FramebufferObservation::new(2, 2, vec![0u8; 16]).expect("valid observation");
        assert_eq!(obs.width, 2);
        assert_eq!(obs.data.len(), 16);

        let err = FramebufferObservation::new(2, 2, vec![0u8; 15]).unwrap_err();
        assert_eq!(
            err,
            InvariantError::PixelSizeMismatch {
                expected: 16,
                actual: 15,
            }
        );
    }

    #[test]
    fn only_flagged_calls_are_frame_boundaries() {
        let thread_id = ThreadId::new(1).expect("valid thread id");
        let boundary = TraceAtom::Call(CallRecord {
            name: "frame_end".into(),
            thread_id,
            context_id: None,
            args: vec![],
            ret: None,
            frame_boundary: true,
        });
        assert!(boundary.is_frame_boundary());

        let observation = TraceAtom::Framebuffer(
            FramebufferObservation::new(1, 1, vec![0u8; 4]).expect("valid observation"),
        );
        assert!(!observation.is_frame_boundary());
    }

    #[test]
    fn gl_error_constants_match_gles_values() {
        assert_eq!(GlError::NO_ERROR.raw(), 0);
        assert_eq!(GlError::INVALID_ENUM.raw(), 0x0500);
        assert_eq!(GlError::INVALID_FRAMEBUFFER_OPERATION.raw(), 0x0506);
        assert!(!GlError::NO_ERROR.is_error());
        assert!(GlError::OUT_OF_MEMORY.is_error());
    }
}
