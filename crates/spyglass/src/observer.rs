use spyglass_types::{ContextId, ThreadId};
use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT_THREAD_ID: Cell<u64> = const { Cell::new(0) };
}

/// Returns a stable per-thread identity, assigned on first use.
pub fn current_thread_id() -> ThreadId {
    CURRENT_THREAD_ID.with(|cell| {
        if cell.get() == 0 {
            cell.set(NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed));
        }
        ThreadId::new(cell.get())
            .expect("thread id invariant violated: generated id must be non-zero")
    })
}

/// Per-call context threading through an intercepted call.
///
/// One observer is scoped to the lifetime of a single intercepted call. It
/// carries the calling thread's identity and the graphics context the call
/// runs against; the dispatcher uses both to attribute records and to detect
/// thread switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallObserver {
    thread_id: ThreadId,
    context_id: Option<ContextId>,
}

impl CallObserver {
    /// Observer for a call issued by the current thread.
    pub fn current(context_id: Option<ContextId>) -> Self {
        Self {
            thread_id: current_thread_id(),
            context_id,
        }
    }

    /// Observer with an explicit thread identity. Used when the caller
    /// already tracks thread identity itself, and by tests simulating
    /// interleaved threads.
    pub fn with_thread_id(thread_id: ThreadId, context_id: Option<ContextId>) -> Self {
        Self {
            thread_id,
            context_id,
        }
    }

    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    pub fn context_id(&self) -> Option<ContextId> {
        self.context_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_id_is_stable_within_a_thread() {
        let first = current_thread_id();
        let second = current_thread_id();
        assert_eq!(first, second);
    }

    #[test]
    fn thread_ids_differ_across_threads() {
        let here = current_thread_id();
        let there = std::thread::spawn(current_thread_id)
            .join()
            .expect("thread should not panic");
        assert_ne!(here, there);
    }

    #[test]
    fn observer_carries_context() {
        let ctx = ContextId::new(5).expect("valid context id");
        let observer = CallObserver::current(Some(ctx));
        assert_eq!(observer.context_id(), Some(ctx));
        assert_eq!(observer.thread_id(), current_thread_id());
    }
}
