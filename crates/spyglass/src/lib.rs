//! In-process graphics API trace capture.
//!
//! Spyglass sits between an application and its native graphics driver. Each
//! intercepted entry point forwards to the real implementation and, while the
//! capture session is active, records the call — together with periodic
//! framebuffer snapshots — as one deterministically ordered stream of trace
//! atoms. The stream is framed by `spyglass-wire` and pushed to an analysis
//! tool over TCP by a background task.
//!
//! The spy is explicitly constructed and explicitly owned: whatever bootstraps
//! interception builds a [`Spy`] and hands a reference into every intercepted
//! entry point. There is no process-wide singleton.
//!
//! ```rust,no_run
//! use spyglass::{CallObserver, Spy};
//! # use std::sync::Arc;
//! # fn driver() -> Arc<dyn spyglass_capture::GlDriver> { unimplemented!() }
//!
//! let spy = Spy::from_env(driver());
//! let observer = CallObserver::current(None);
//! let err = spy.gl_get_error(&observer);
//! ```
//!
//! Capture failures never change the behavior an application observes: encode
//! errors are logged and swallowed, and a lost connection degrades every
//! subsequent intercepted call to a cheap-path forward.

pub(crate) const STREAM_MAX_QUEUED_FRAMES: usize = 4096;
pub(crate) const STREAM_CONNECT_ATTEMPTS: u32 = 10;
pub(crate) const STREAM_RECONNECT_DELAY_MS: u64 = 500;

pub(crate) mod config;
pub(crate) mod defer;
pub(crate) mod encoder;
pub(crate) mod observer;
pub(crate) mod spy;
pub(crate) mod stream;

pub use self::config::CaptureConfig;
pub use self::defer::{DeferStartJob, JobState};
pub use self::encoder::{
    Connection, ConnectionLost, MemoryConnection, NullConnection, SpyError,
};
pub use self::observer::{CallObserver, current_thread_id};
pub use self::spy::{SessionPhase, Spy};
pub use self::stream::StreamConnection;
