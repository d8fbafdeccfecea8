use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use tokio::sync::watch;

const STATE_PENDING: u8 = 0;
const STATE_COMPLETED: u8 = 1;
const STATE_CANCELLED: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// Waiting for the suspend-frame countdown to reach zero.
    Pending,
    /// Countdown elapsed; the completion action ran.
    Completed,
    /// The session was torn down first; capture was never activated.
    Cancelled,
}

/// Asynchronous countdown-to-activate.
///
/// The rendering thread only decrements an atomic and publishes the new
/// value on a watch channel; this job waits on the channel off-thread and
/// runs `on_complete` once the countdown reaches zero. Dropping the sender
/// before that cancels the job without running the action.
pub struct DeferStartJob {
    state: Arc<AtomicU8>,
}

impl DeferStartJob {
    pub fn spawn<F>(mut countdown: watch::Receiver<i64>, on_complete: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let state = Arc::new(AtomicU8::new(STATE_PENDING));
        let task_state = Arc::clone(&state);
        let run = async move {
            loop {
                let remaining = *countdown.borrow_and_update();
                if remaining <= 0 {
                    break;
                }
                if countdown.changed().await.is_err() {
                    task_state.store(STATE_CANCELLED, Ordering::Release);
                    return;
                }
            }
            task_state.store(STATE_COMPLETED, Ordering::Release);
            on_complete();
        };
        crate::stream::spawn_background(run);
        Self { state }
    }

    pub fn state(&self) -> JobState {
        match self.state.load(Ordering::Acquire) {
            STATE_COMPLETED => JobState::Completed,
            STATE_CANCELLED => JobState::Cancelled,
            _ => JobState::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[tokio::test]
    async fn completes_when_countdown_reaches_zero() {
        let (tx, rx) = watch::channel(2i64);
        let fired = Arc::new(AtomicBool::new(false));
        let task_fired = Arc::clone(&fired);
        let job = DeferStartJob::spawn(rx, move || {
            task_fired.store(true, Ordering::Release);
        });

        tokio::task::yield_now().await;
        assert_eq!(job.state(), JobState::Pending);

        tx.send_replace(1);
        tokio::task::yield_now().await;
        assert_eq!(job.state(), JobState::Pending);
        assert!(!fired.load(Ordering::Acquire));

        tx.send_replace(0);
        for _ in 0..16 {
            tokio::task::yield_now().await;
            if job.state() == JobState::Completed {
                break;
            }
        }
        assert_eq!(job.state(), JobState::Completed);
        assert!(fired.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn teardown_cancels_without_running_the_action() {
        let (tx, rx) = watch::channel(3i64);
        let fired = Arc::new(AtomicBool::new(false));
        let task_fired = Arc::clone(&fired);
        let job = DeferStartJob::spawn(rx, move || {
            task_fired.store(true, Ordering::Release);
        });

        tokio::task::yield_now().await;
        drop(tx);
        for _ in 0..16 {
            tokio::task::yield_now().await;
            if job.state() == JobState::Cancelled {
                break;
            }
        }
        assert_eq!(job.state(), JobState::Cancelled);
        assert!(!fired.load(Ordering::Acquire));
    }
}
