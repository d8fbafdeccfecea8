use parking_lot::RwLock;
use spyglass_types::{ContextId, FramebufferObservation, GlError, InvariantError};
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::num::NonZeroUsize;

#[derive(Debug)]
pub enum CaptureError {
    FramebufferUnavailable,
    ReadbackFailed(String),
    SymbolNotFound(String),
    InvariantViolation {
        context: &'static str,
        source: InvariantError,
    },
}

impl CaptureError {
    fn invariant(context: &'static str, source: InvariantError) -> Self {
        Self::InvariantViolation { context, source }
    }
}

impl fmt::Display for CaptureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FramebufferUnavailable => {
                write!(f, "no bound render target with queryable dimensions")
            }
            Self::ReadbackFailed(reason) => write!(f, "framebuffer readback failed: {reason}"),
            Self::SymbolNotFound(name) => write!(f, "symbol not found: {name}"),
            Self::InvariantViolation { context, source } => {
                write!(f, "invariant violated in {context}: {source}")
            }
        }
    }
}

impl Error for CaptureError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::InvariantViolation { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// An opaque non-null function address resolved from the real driver.
///
/// Never dereferenced by this crate; callers that forward to the real
/// implementation transmute it to the concrete signature themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawSymbol(NonZeroUsize);

impl RawSymbol {
    pub fn new(addr: usize) -> Option<Self> {
        NonZeroUsize::new(addr).map(Self)
    }

    pub fn addr(self) -> usize {
        self.0.get()
    }
}

/// Name-to-function-pointer registry redirecting intercepted calls to the
/// real underlying implementation.
///
/// Entries are inserted at resolution time and looked up on every
/// intercepted call that forwards to the real driver. Re-resolution may
/// overwrite existing entries (runtime relinking); a concurrent lookup
/// observes either the old or the new pointer, never a torn value — the
/// whole map sits behind one `RwLock`.
pub struct SymbolTable {
    entries: RwLock<HashMap<String, RawSymbol>>,
}

impl Default for SymbolTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SymbolTable {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Idempotent; last write wins.
    pub fn register(&self, name: impl Into<String>, symbol: RawSymbol) {
        self.entries.write().insert(name.into(), symbol);
    }

    pub fn lookup(&self, name: &str) -> Option<RawSymbol> {
        self.entries.read().get(name).copied()
    }

    pub fn lookup_or_err(&self, name: &str) -> Result<RawSymbol, CaptureError> {
        self.lookup(name)
            .ok_or_else(|| CaptureError::SymbolNotFound(name.to_string()))
    }

    /// Resolves `names` through `loader`, overwriting prior entries for the
    /// names the loader can satisfy. Returns how many resolved. Safe to call
    /// repeatedly (driver reload) and concurrently with lookups.
    pub fn resolve_imports<'a, I, F>(&self, names: I, mut loader: F) -> usize
    where
        I: IntoIterator<Item = &'a str>,
        F: FnMut(&str) -> Option<RawSymbol>,
    {
        let mut resolved = 0;
        let mut entries = self.entries.write();
        for name in names {
            if let Some(symbol) = loader(name) {
                entries.insert(name.to_string(), symbol);
                resolved += 1;
            }
        }
        resolved
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

/// Resolves `name` against the already-loaded images of this process.
pub fn resolve_in_process(name: &str) -> Option<RawSymbol> {
    platform::resolve_in_process_impl(name)
}

#[cfg(unix)]
mod platform {
    use super::RawSymbol;
    use std::ffi::CString;

    pub fn resolve_in_process_impl(name: &str) -> Option<RawSymbol> {
        let c_name = CString::new(name).ok()?;
        let addr = unsafe { libc::dlsym(libc::RTLD_DEFAULT, c_name.as_ptr()) };
        RawSymbol::new(addr as usize)
    }
}

#[cfg(not(unix))]
mod platform {
    use super::RawSymbol;

    pub fn resolve_in_process_impl(_name: &str) -> Option<RawSymbol> {
        None
    }
}

/// The surface of the real driver the spy forwards to.
///
/// Implemented by whatever bootstraps interception; tests drive the spy
/// with a scripted fake.
pub trait GlDriver: Send + Sync {
    fn get_error(&self) -> GlError;
    fn get_integerv(&self, pname: u32) -> Option<i32>;
    fn get_integer64v(&self, pname: u32) -> Option<i64>;
    fn get_string(&self, name: u32) -> Option<String>;
    fn get_stringi(&self, name: u32, index: u32) -> Option<String>;
    fn program_binary(&self, program: u32, binary_format: u32, binary: &[u8]);
    fn program_binary_oes(&self, program: u32, binary_format: u32, binary: &[u8]);
    fn shader_binary(&self, shaders: &[u32], binary_format: u32, binary: &[u8]);
    fn bound_framebuffer_size(&self) -> Option<(u32, u32)>;
    fn read_pixels(&self, width: u32, height: u32) -> Result<Vec<u8>, String>;
    fn egl_initialize(&self) -> bool;
    fn egl_create_context(&self, share: Option<ContextId>) -> Option<ContextId>;
}

/// Reads back the currently bound render target.
///
/// `FramebufferUnavailable` means there is nothing to sample at this
/// boundary; callers skip the observation without treating it as fatal.
pub fn capture_framebuffer(driver: &dyn GlDriver) -> Result<FramebufferObservation, CaptureError> {
    let (width, height) = driver
        .bound_framebuffer_size()
        .ok_or(CaptureError::FramebufferUnavailable)?;
    let data = driver
        .read_pixels(width, height)
        .map_err(CaptureError::ReadbackFailed)?;
    FramebufferObservation::new(width, height, data)
        .map_err(|err| CaptureError::invariant("framebuffer_observation", err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn register_then_lookup() {
        let table = SymbolTable::new();
        let symbol = RawSymbol::new(0x1000).expect("non-null symbol");
        table.register("glDrawArrays", symbol);
        assert_eq!(table.lookup("glDrawArrays"), Some(symbol));
        assert_eq!(table.lookup("glDrawElements"), None);
    }

    #[test]
    fn lookup_or_err_reports_the_missing_name() {
        let table = SymbolTable::new();
        let err = table.lookup_or_err("eglSwapBuffers").unwrap_err();
        match err {
            CaptureError::SymbolNotFound(name) => assert_eq!(name, "eglSwapBuffers"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn re_resolution_overwrites() {
        let table = SymbolTable::new();
        let old = RawSymbol::new(0x1000).expect("non-null symbol");
        let new = RawSymbol::new(0x2000).expect("non-null symbol");
        table.register("glDrawArrays", old);

        let resolved = table.resolve_imports(["glDrawArrays", "glUnknown"], |name| {
            (name == "glDrawArrays").then_some(new)
        });
        assert_eq!(resolved, 1);
        assert_eq!(table.lookup("glDrawArrays"), Some(new));
        assert_eq!(table.lookup("glUnknown"), None);
    }

    #[test]
    fn concurrent_lookups_never_observe_torn_values() {
        let table = Arc::new(SymbolTable::new());
        let a = RawSymbol::new(0xAAAA_A000).expect("non-null symbol");
        let b = RawSymbol::new(0xBBBB_B000).expect("non-null symbol");
        table.register("foo", a);

        let stop = Arc::new(AtomicBool::new(false));
        let mut readers = Vec::new();
        for _ in 0..10 {
            let table = Arc::clone(&table);
            let stop = Arc::clone(&stop);
            readers.push(std::thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    let got = table.lookup("foo").expect("foo stays registered");
                    assert!(got == a || got == b, "torn symbol value: {got:?}");
                }
            }));
        }

        for _ in 0..1_000 {
            table.resolve_imports(["foo"], |_| Some(b));
            table.resolve_imports(["foo"], |_| Some(a));
        }
        stop.store(true, Ordering::Relaxed);
        for reader in readers {
            reader.join().expect("reader thread should not panic");
        }
    }

    struct FixedDriver {
        size: Option<(u32, u32)>,
        fail_readback: bool,
    }

    impl GlDriver for FixedDriver {
        fn get_error(&self) -> GlError {
            GlError::NO_ERROR
        }
        fn get_integerv(&self, _pname: u32) -> Option<i32> {
            None
        }
        fn get_integer64v(&self, _pname: u32) -> Option<i64> {
            None
        }
        fn get_string(&self, _name: u32) -> Option<String> {
            None
        }
        fn get_stringi(&self, _name: u32, _index: u32) -> Option<String> {
            None
        }
        fn program_binary(&self, _program: u32, _binary_format: u32, _binary: &[u8]) {}
        fn program_binary_oes(&self, _program: u32, _binary_format: u32, _binary: &[u8]) {}
        fn shader_binary(&self, _shaders: &[u32], _binary_format: u32, _binary: &[u8]) {}
        fn bound_framebuffer_size(&self) -> Option<(u32, u32)> {
            self.size
        }
        fn read_pixels(&self, width: u32, height: u32) -> Result<Vec<u8>, String> {
            if self.fail_readback {
                return Err("context lost".into());
            }
            Ok(vec![0u8; width as usize * height as usize * 4])
        }
        fn egl_initialize(&self) -> bool {
            true
        }
        fn egl_create_context(&self, _share: Option<ContextId>) -> Option<ContextId> {
            None
        }
    }

    #[test]
    fn capture_framebuffer_reads_bound_target() {
        let driver = FixedDriver {
            size: Some((4, 2)),
            fail_readback: false,
        };
        let obs = capture_framebuffer(&driver).expect("observation should capture");
        assert_eq!((obs.width, obs.height), (4, 2));
        assert_eq!(obs.data.len(), 32);
    }

    #[test]
    fn capture_framebuffer_without_bound_target_is_unavailable() {
        let driver = FixedDriver {
            size: None,
            fail_readback: false,
        };
        match capture_framebuffer(&driver) {
            Err(CaptureError::FramebufferUnavailable) => {}
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn capture_framebuffer_maps_readback_failure() {
        let driver = FixedDriver {
            size: Some((2, 2)),
            fail_readback: true,
        };
        match capture_framebuffer(&driver) {
            Err(CaptureError::ReadbackFailed(reason)) => assert_eq!(reason, "context lost"),
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
