use parking_lot::Mutex;
use spyglass_capture::{
    CaptureError, GlDriver, RawSymbol, SymbolTable, capture_framebuffer, resolve_in_process,
};
use spyglass_types::{
    ApiKind, ArgValue, CallRecord, ContextId, FramebufferObservation, GlError,
    PROGRAM_BINARY_EXTENSION, ThreadId, TraceAtom, TraceHeader, glenum,
};
use spyglass_wire::ClientMessage;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use tokio::sync::watch;

use crate::config::CaptureConfig;
use crate::defer::{DeferStartJob, JobState};
use crate::encoder::{Connection, Encoder, NullConnection, SpyError};
use crate::observer::CallObserver;
use crate::stream::StreamConnection;

/// Capture lifecycle. The session is built directly into `Suspended`; the
/// countdown may already be zero, in which case activation happens during
/// construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Suspended,
    Active,
    Finished,
}

/// Everything mutable the dispatcher owns, behind one critical section.
///
/// Boundary detection, counter updates, pending-observation handling and
/// encoding all happen under this single mutex, so interleaved calls from
/// different threads cannot corrupt counters or reorder the stream.
struct SpyState {
    phase: SessionPhase,
    frames_captured: u32,
    draws_in_frame: u32,
    header_written: bool,
    pending_observation: Option<FramebufferObservation>,
    fake_errors: HashMap<ContextId, GlError>,
    last_thread: Option<ThreadId>,
    encoder: Encoder,
}

struct SpyShared {
    config: CaptureConfig,
    driver: Arc<dyn GlDriver>,
    symbols: SymbolTable,
    /// Frames left before activation. Atomic so the frame hook can decrement
    /// without more than a cheap check while the deferred job watches it.
    suspend_frames: AtomicI64,
    countdown_tx: Option<watch::Sender<i64>>,
    /// Cheap-path flag: true only while the session records.
    active: AtomicBool,
    /// Whether any fake error was ever installed; lets `gl_get_error` skip
    /// the lock entirely in the common case.
    fake_errors_installed: AtomicBool,
    state: Mutex<SpyState>,
}

impl SpyShared {
    fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    fn note_encode_failure(&self, state: &mut SpyState, err: SpyError) {
        match err {
            SpyError::ConnectionLost => {
                tracing::warn!("trace connection lost; capture disabled");
                state.phase = SessionPhase::Finished;
                self.active.store(false, Ordering::Release);
            }
            other => tracing::warn!(error = %other, "failed to encode trace record"),
        }
    }

    fn encode_locked(&self, state: &mut SpyState, atom: TraceAtom) {
        if let Err(err) = state.encoder.encode(&ClientMessage::Atom(atom)) {
            self.note_encode_failure(state, err);
        }
    }

    fn flush_pending_locked(&self, state: &mut SpyState) {
        if let Some(observation) = state.pending_observation.take() {
            self.encode_locked(state, TraceAtom::Framebuffer(observation));
        }
    }

    /// Emits one atom, attaching any pending observation first and handling
    /// thread-switch detection.
    fn record_atom_locked(&self, state: &mut SpyState, observer: &CallObserver, atom: TraceAtom) {
        let switched = state
            .last_thread
            .is_some_and(|last| last != observer.thread_id());
        if switched {
            // The held observation belongs to the previous thread; it must
            // leave before the switch is recorded.
            self.flush_pending_locked(state);
            self.encode_locked(
                state,
                TraceAtom::ThreadSwitch {
                    thread_id: observer.thread_id(),
                },
            );
        }
        state.last_thread = Some(observer.thread_id());
        self.flush_pending_locked(state);
        self.encode_locked(state, atom);
    }

    fn activate_locked(&self, state: &mut SpyState) {
        if state.phase != SessionPhase::Suspended {
            return;
        }
        if self.suspend_frames.load(Ordering::Acquire) != 0 {
            return;
        }
        if !state.header_written {
            state.header_written = true;
            let header = TraceHeader {
                process_name: process_name(),
                pid: std::process::id(),
                capture_frames: self.config.capture_frames,
                observe_frame_frequency: self.config.observe_frame_frequency,
                observe_draw_frequency: self.config.observe_draw_frequency,
            };
            if let Err(err) = state.encoder.encode(&ClientMessage::Header(header)) {
                self.note_encode_failure(state, err);
                if state.phase == SessionPhase::Finished {
                    return;
                }
            }
        }
        state.phase = SessionPhase::Active;
        self.active.store(true, Ordering::Release);
        tracing::info!(
            capture_frames = self.config.capture_frames,
            "capture activated"
        );
    }

    /// Bounded, lock-free on the counter itself; the watch send just wakes
    /// the deferred job.
    fn decrement_countdown(&self) -> i64 {
        let remaining = match self.suspend_frames.fetch_update(
            Ordering::AcqRel,
            Ordering::Acquire,
            |v| if v > 0 { Some(v - 1) } else { None },
        ) {
            Ok(previous) => previous - 1,
            Err(current) => current,
        };
        if let Some(tx) = &self.countdown_tx {
            let _ = tx.send(remaining);
        }
        remaining
    }

    fn observe_framebuffer_locked(
        &self,
        state: &mut SpyState,
        observer: &CallObserver,
        pend_messaging: bool,
    ) -> Result<(), SpyError> {
        let observation = match capture_framebuffer(self.driver.as_ref()) {
            Ok(observation) => observation,
            Err(CaptureError::FramebufferUnavailable) => {
                tracing::debug!("no framebuffer to observe at this boundary");
                return Err(SpyError::FramebufferUnavailable);
            }
            Err(err) => {
                tracing::warn!(error = %err, "framebuffer observation failed");
                return Err(err.into());
            }
        };
        if pend_messaging {
            if state.pending_observation.is_some() {
                // Logic error in the caller: a deferred snapshot was never
                // attached. Flush-then-replace so neither snapshot is lost.
                tracing::warn!(
                    "framebuffer observation requested while one is pending; flushing the held one"
                );
                self.flush_pending_locked(state);
            }
            state.pending_observation = Some(observation);
        } else {
            self.record_atom_locked(state, observer, TraceAtom::Framebuffer(observation));
        }
        Ok(())
    }
}

fn process_name() -> String {
    std::env::current_exe()
        .ok()
        .and_then(|path| path.file_name().map(|name| name.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "unknown".to_string())
}

/// The interceptor/dispatcher. One instance answers for every intercepted
/// entry point of the process.
///
/// Explicitly constructed and explicitly owned by whatever bootstraps
/// interception; intercepted shims receive it by reference together with a
/// per-call [`CallObserver`].
pub struct Spy {
    shared: Arc<SpyShared>,
    defer_job: Option<DeferStartJob>,
}

impl Spy {
    pub fn new(
        config: CaptureConfig,
        driver: Arc<dyn GlDriver>,
        connection: Box<dyn Connection>,
    ) -> Self {
        let suspend = i64::from(config.suspend_capture_frames);
        let (countdown_tx, countdown_rx) = if suspend > 0 {
            let (tx, rx) = watch::channel(suspend);
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        let shared = Arc::new(SpyShared {
            config,
            driver,
            symbols: SymbolTable::new(),
            suspend_frames: AtomicI64::new(suspend),
            countdown_tx,
            active: AtomicBool::new(false),
            fake_errors_installed: AtomicBool::new(false),
            state: Mutex::new(SpyState {
                phase: SessionPhase::Suspended,
                frames_captured: 0,
                draws_in_frame: 0,
                header_written: false,
                pending_observation: None,
                fake_errors: HashMap::new(),
                last_thread: None,
                encoder: Encoder::new(connection),
            }),
        });

        let defer_job = countdown_rx.map(|rx| {
            let weak = Arc::downgrade(&shared);
            DeferStartJob::spawn(rx, move || {
                if let Some(shared) = weak.upgrade() {
                    let mut state = shared.state.lock();
                    shared.activate_locked(&mut state);
                }
            })
        });

        if suspend == 0 {
            let mut state = shared.state.lock();
            shared.activate_locked(&mut state);
        }

        Self { shared, defer_job }
    }

    /// Builds a spy from `SPYGLASS_*` environment variables, streaming to
    /// `SPYGLASS_STREAM` when set and discarding frames otherwise.
    pub fn from_env(driver: Arc<dyn GlDriver>) -> Self {
        let config = CaptureConfig::from_env();
        let connection: Box<dyn Connection> = match &config.stream_addr {
            Some(addr) => Box::new(StreamConnection::connect(addr)),
            None => Box::new(NullConnection),
        };
        Self::new(config, driver, connection)
    }

    pub fn is_active(&self) -> bool {
        self.shared.is_active()
    }

    pub fn session_phase(&self) -> SessionPhase {
        self.shared.state.lock().phase
    }

    pub fn frames_captured(&self) -> u32 {
        self.shared.state.lock().frames_captured
    }

    pub fn defer_job_state(&self) -> Option<JobState> {
        self.defer_job.as_ref().map(DeferStartJob::state)
    }

    // ── Symbol redirection ──────────────────────────────────────────────

    pub fn register_symbol(&self, name: impl Into<String>, symbol: RawSymbol) {
        self.shared.symbols.register(name, symbol);
    }

    pub fn lookup_symbol(&self, name: &str) -> Option<RawSymbol> {
        self.shared.symbols.lookup(name)
    }

    /// The real implementation for a call the spy does not emulate.
    pub fn real_symbol(&self, name: &str) -> Result<RawSymbol, SpyError> {
        self.shared.symbols.lookup_or_err(name).map_err(Into::into)
    }

    /// Re-resolves the wanted imports through `loader`. May be called again
    /// whenever the underlying driver relinks.
    pub fn resolve_imports<'a, I, F>(&self, names: I, loader: F) -> usize
    where
        I: IntoIterator<Item = &'a str>,
        F: FnMut(&str) -> Option<RawSymbol>,
    {
        self.shared.symbols.resolve_imports(names, loader)
    }

    /// Resolves imports against the images already loaded in this process.
    pub fn resolve_imports_in_process<'a, I>(&self, names: I) -> usize
    where
        I: IntoIterator<Item = &'a str>,
    {
        self.resolve_imports(names, resolve_in_process)
    }

    // ── Intercepted entry points ────────────────────────────────────────

    pub fn egl_initialize(&self, observer: &CallObserver) -> bool {
        let ok = self.shared.driver.egl_initialize();
        self.record_call(
            observer,
            "eglInitialize",
            vec![],
            Some(ArgValue::Bool(ok)),
        );
        ok
    }

    pub fn egl_create_context(
        &self,
        observer: &CallObserver,
        share: Option<ContextId>,
    ) -> Option<ContextId> {
        let context = self.shared.driver.egl_create_context(share);
        self.record_call(
            observer,
            "eglCreateContext",
            vec![ArgValue::U64(share.map_or(0, ContextId::get))],
            context.map(|ctx| ArgValue::U64(ctx.get())),
        );
        context
    }

    /// Installs a synthetic error for `context`. The next error query on
    /// that context returns it instead of asking the driver, then clears it.
    /// A deliberate testing hook for downstream tools; never conflated with
    /// real driver errors.
    pub fn set_fake_gl_error(&self, context: ContextId, error: GlError) {
        let mut state = self.shared.state.lock();
        state.fake_errors.insert(context, error);
        self.shared
            .fake_errors_installed
            .store(true, Ordering::Release);
    }

    pub fn gl_get_error(&self, observer: &CallObserver) -> GlError {
        if self.shared.fake_errors_installed.load(Ordering::Acquire) {
            if let Some(context) = observer.context_id() {
                let fake = {
                    let mut state = self.shared.state.lock();
                    state.fake_errors.remove(&context)
                };
                if let Some(error) = fake {
                    if self.shared.config.record_gl_error_state {
                        self.record_call(
                            observer,
                            "glGetError",
                            vec![ArgValue::Str("synthetic".into())],
                            Some(ArgValue::U64(u64::from(error.raw()))),
                        );
                    }
                    return error;
                }
            }
        }
        let real = self.shared.driver.get_error();
        self.record_call(
            observer,
            "glGetError",
            vec![],
            Some(ArgValue::U64(u64::from(real.raw()))),
        );
        real
    }

    pub fn gl_program_binary(
        &self,
        observer: &CallObserver,
        program: u32,
        binary_format: u32,
        binary: &[u8],
    ) {
        self.record_call(
            observer,
            "glProgramBinary",
            program_binary_args(program, binary_format, binary),
            None,
        );
        if self.suppress_binary(observer) {
            return;
        }
        self.shared
            .driver
            .program_binary(program, binary_format, binary);
    }

    pub fn gl_program_binary_oes(
        &self,
        observer: &CallObserver,
        program: u32,
        binary_format: u32,
        binary: &[u8],
    ) {
        self.record_call(
            observer,
            "glProgramBinaryOES",
            program_binary_args(program, binary_format, binary),
            None,
        );
        if self.suppress_binary(observer) {
            return;
        }
        self.shared
            .driver
            .program_binary_oes(program, binary_format, binary);
    }

    pub fn gl_shader_binary(
        &self,
        observer: &CallObserver,
        shaders: &[u32],
        binary_format: u32,
        binary: &[u8],
    ) {
        self.record_call(
            observer,
            "glShaderBinary",
            vec![
                ArgValue::U64(shaders.len() as u64),
                ArgValue::U64(u64::from(binary_format)),
                ArgValue::Blob {
                    len: binary.len() as u64,
                },
            ],
            None,
        );
        if self.suppress_binary(observer) {
            return;
        }
        self.shared
            .driver
            .shader_binary(shaders, binary_format, binary);
    }

    pub fn gl_get_integerv(&self, observer: &CallObserver, pname: u32) -> Option<i32> {
        let value = if self.masks_binary_formats(pname) {
            Some(0)
        } else {
            self.shared.driver.get_integerv(pname)
        };
        self.record_call(
            observer,
            "glGetIntegerv",
            vec![ArgValue::U64(u64::from(pname))],
            value.map(|v| ArgValue::I64(i64::from(v))),
        );
        value
    }

    pub fn gl_get_integer64v(&self, observer: &CallObserver, pname: u32) -> Option<i64> {
        let value = if self.masks_binary_formats(pname) {
            Some(0)
        } else {
            self.shared.driver.get_integer64v(pname)
        };
        self.record_call(
            observer,
            "glGetInteger64v",
            vec![ArgValue::U64(u64::from(pname))],
            value.map(ArgValue::I64),
        );
        value
    }

    pub fn gl_get_string(&self, observer: &CallObserver, name: u32) -> Option<String> {
        let mut value = self.shared.driver.get_string(name);
        if name == glenum::EXTENSIONS && self.shared.config.disable_precompiled_shaders {
            value = value.map(|s| strip_extension(&s, PROGRAM_BINARY_EXTENSION));
        }
        self.record_call(
            observer,
            "glGetString",
            vec![ArgValue::U64(u64::from(name))],
            value.clone().map(ArgValue::Str),
        );
        value
    }

    /// Indexed variant; the suppressed extension reads as absent rather
    /// than shifting its siblings' indices.
    pub fn gl_get_stringi(
        &self,
        observer: &CallObserver,
        name: u32,
        index: u32,
    ) -> Option<String> {
        let mut value = self.shared.driver.get_stringi(name, index);
        if name == glenum::EXTENSIONS
            && self.shared.config.disable_precompiled_shaders
            && value.as_deref() == Some(PROGRAM_BINARY_EXTENSION)
        {
            value = None;
        }
        self.record_call(
            observer,
            "glGetStringi",
            vec![ArgValue::U64(u64::from(name)), ArgValue::U64(u64::from(index))],
            value.clone().map(ArgValue::Str),
        );
        value
    }

    /// Reads back the bound render target. With `pend_messaging` the
    /// observation is held as the single pending observation and attached
    /// to the next outgoing record; otherwise it is encoded immediately.
    pub fn observe_framebuffer(
        &self,
        observer: &CallObserver,
        pend_messaging: bool,
    ) -> Result<(), SpyError> {
        if !self.is_active() {
            return Ok(());
        }
        let mut state = self.shared.state.lock();
        if state.phase != SessionPhase::Active {
            return Ok(());
        }
        self.shared
            .observe_framebuffer_locked(&mut state, observer, pend_messaging)
    }

    // ── Frame/draw lifecycle hooks ──────────────────────────────────────

    pub fn on_pre_start_of_frame(&self, _api: ApiKind) {
        if !self.is_active() {
            return;
        }
        let mut state = self.shared.state.lock();
        if state.phase != SessionPhase::Active {
            return;
        }
        // Natural flush point: nothing from the previous frame may stay
        // pending across the boundary.
        self.shared.flush_pending_locked(&mut state);
    }

    pub fn on_post_start_of_frame(&self, observer: &CallObserver) {
        self.record_call(observer, "frame_start", vec![], None);
    }

    pub fn on_post_draw_call(&self, observer: &CallObserver, api: ApiKind) {
        if !self.is_active() {
            return;
        }
        let mut state = self.shared.state.lock();
        if state.phase != SessionPhase::Active {
            return;
        }
        let budget = self.shared.config.num_draws_per_frame;
        if budget != 0 && state.draws_in_frame >= budget {
            return;
        }
        state.draws_in_frame += 1;
        let record = CallRecord {
            name: "draw".into(),
            thread_id: observer.thread_id(),
            context_id: observer.context_id(),
            args: vec![api_arg(api)],
            ret: None,
            frame_boundary: false,
        };
        self.shared
            .record_atom_locked(&mut state, observer, TraceAtom::Call(record));

        let frequency = self.shared.config.observe_draw_frequency;
        if frequency != 0 && state.draws_in_frame % frequency == 0 {
            // Draw-boundary snapshots pend: the readback is expensive and
            // attaches at the next natural flush point instead of forcing a
            // synchronization here.
            let _ = self
                .shared
                .observe_framebuffer_locked(&mut state, observer, true);
        }
    }

    pub fn on_pre_end_of_frame(&self, observer: &CallObserver, _api: ApiKind) {
        if !self.is_active() {
            return;
        }
        let mut state = self.shared.state.lock();
        if state.phase != SessionPhase::Active {
            return;
        }
        let frequency = self.shared.config.observe_frame_frequency;
        if frequency != 0 && (state.frames_captured + 1) % frequency == 0 {
            let _ = self
                .shared
                .observe_framebuffer_locked(&mut state, observer, false);
        }
    }

    pub fn on_post_end_of_frame(&self, observer: &CallObserver) {
        let mut state = self.shared.state.lock();
        match state.phase {
            SessionPhase::Suspended => {
                if self.shared.decrement_countdown() == 0 {
                    self.shared.activate_locked(&mut state);
                }
            }
            SessionPhase::Active => {
                let record = CallRecord {
                    name: "frame_end".into(),
                    thread_id: observer.thread_id(),
                    context_id: observer.context_id(),
                    args: vec![],
                    ret: None,
                    frame_boundary: true,
                };
                self.shared
                    .record_atom_locked(&mut state, observer, TraceAtom::Call(record));
                state.frames_captured += 1;
                state.draws_in_frame = 0;
                let total = self.shared.config.capture_frames;
                if total != 0 && state.frames_captured >= total {
                    state.phase = SessionPhase::Finished;
                    self.shared.active.store(false, Ordering::Release);
                    tracing::info!(frames = state.frames_captured, "capture finished");
                }
            }
            SessionPhase::Finished => {}
        }
    }

    pub fn on_post_fence(&self, observer: &CallObserver) {
        self.record_call(observer, "fence", vec![], None);
    }

    /// Explicit thread-switch notification. The record path detects
    /// switches on its own; this hook exists for shims that know a switch
    /// happened without an accompanying record. A signal, not a lock.
    pub fn on_thread_switched(&self, observer: &CallObserver) {
        if !self.is_active() {
            return;
        }
        let mut state = self.shared.state.lock();
        if state.phase != SessionPhase::Active {
            return;
        }
        let switched = state
            .last_thread
            .is_some_and(|last| last != observer.thread_id());
        if switched {
            self.shared.flush_pending_locked(&mut state);
            self.shared.encode_locked(
                &mut state,
                TraceAtom::ThreadSwitch {
                    thread_id: observer.thread_id(),
                },
            );
        }
        state.last_thread = Some(observer.thread_id());
    }

    // ── Internals ───────────────────────────────────────────────────────

    fn record_call(
        &self,
        observer: &CallObserver,
        name: &str,
        args: Vec<ArgValue>,
        ret: Option<ArgValue>,
    ) {
        if !self.is_active() {
            return;
        }
        let mut state = self.shared.state.lock();
        if state.phase != SessionPhase::Active {
            return;
        }
        let record = CallRecord {
            name: name.into(),
            thread_id: observer.thread_id(),
            context_id: observer.context_id(),
            args,
            ret,
            frame_boundary: false,
        };
        self.shared
            .record_atom_locked(&mut state, observer, TraceAtom::Call(record));
    }

    fn suppress_binary(&self, observer: &CallObserver) -> bool {
        if !self.shared.config.disable_precompiled_shaders {
            return false;
        }
        // The application sees the same failure a driver without binary
        // support would report, and takes its source-shader fallback path.
        if let Some(context) = observer.context_id() {
            self.set_fake_gl_error(context, GlError::INVALID_ENUM);
        }
        true
    }

    fn masks_binary_formats(&self, pname: u32) -> bool {
        self.shared.config.disable_precompiled_shaders
            && matches!(
                pname,
                glenum::NUM_PROGRAM_BINARY_FORMATS | glenum::NUM_SHADER_BINARY_FORMATS
            )
    }
}

fn program_binary_args(program: u32, binary_format: u32, binary: &[u8]) -> Vec<ArgValue> {
    vec![
        ArgValue::U64(u64::from(program)),
        ArgValue::U64(u64::from(binary_format)),
        ArgValue::Blob {
            len: binary.len() as u64,
        },
    ]
}

fn api_arg(api: ApiKind) -> ArgValue {
    ArgValue::Str(
        match api {
            ApiKind::Gles => "gles",
            ApiKind::Vulkan => "vulkan",
        }
        .into(),
    )
}

fn strip_extension(extensions: &str, suppressed: &str) -> String {
    extensions
        .split_whitespace()
        .filter(|token| *token != suppressed)
        .collect::<Vec<_>>()
        .join(" ")
}
