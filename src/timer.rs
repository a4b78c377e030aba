//! One-shot countdown timers on the tokio runtime.
//!
//! Sessions and clients arm these for the initial-freeze window, the
//! session lifetime and the client inactivity timeout. The callback runs
//! on a spawned task, never on a request handler, so a stalled handler
//! cannot starve a deadline.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;

struct Armed {
    handle: JoinHandle<()>,
    deadline: Instant,
}

/// A stoppable one-shot timer.
///
/// `stop` both aborts the sleeping task and invalidates the generation
/// the task captured, so a callback that already woke up becomes a no-op
/// instead of racing the cancellation.
pub struct Countdown {
    generation: Arc<AtomicU64>,
    armed: Mutex<Option<Armed>>,
}

impl Countdown {
    pub fn new() -> Self {
        Self {
            generation: Arc::new(AtomicU64::new(0)),
            armed: Mutex::new(None),
        }
    }

    /// Arm the timer. Ignored if it is already running.
    pub fn start<F>(&self, duration: Duration, on_fire: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut armed = self.armed.lock();
        if let Some(current) = armed.as_ref() {
            if !current.handle.is_finished() {
                return;
            }
        }

        let my_generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let generation = Arc::clone(&self.generation);
        let deadline = Instant::now() + duration;

        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if generation.load(Ordering::Acquire) == my_generation {
                on_fire();
            }
        });

        *armed = Some(Armed { handle, deadline });
    }

    /// Disarm the timer. A pending callback will not run.
    pub fn stop(&self) {
        let mut armed = self.armed.lock();
        self.generation.fetch_add(1, Ordering::AcqRel);
        if let Some(current) = armed.take() {
            current.handle.abort();
        }
    }

    /// Whether the timer is armed and has not fired yet.
    pub fn is_running(&self) -> bool {
        self.armed
            .lock()
            .as_ref()
            .map(|current| !current.handle.is_finished())
            .unwrap_or(false)
    }

    /// Time left until the deadline; zero when stopped or already fired.
    pub fn remaining(&self) -> Duration {
        let armed = self.armed.lock();
        match armed.as_ref() {
            Some(current) if !current.handle.is_finished() => {
                current.deadline.saturating_duration_since(Instant::now())
            }
            _ => Duration::ZERO,
        }
    }
}

impl Default for Countdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Countdown {
    fn drop(&mut self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        if let Some(current) = self.armed.get_mut().take() {
            current.handle.abort();
        }
    }
}
