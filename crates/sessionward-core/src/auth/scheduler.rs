//! Auto-logout watchdog.
//!
//! `Idle -> Armed -> Fired`, with `Armed -> Idle` on disarm. At most one
//! timer task is live at any time: arming again aborts the previous task,
//! and every arm/disarm bumps a generation counter so a task that already
//! woke up can tell it has been superseded.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Armed { deadline: DateTime<Utc> },
    Fired,
}

struct Inner {
    state: SchedulerState,
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

pub struct LogoutScheduler {
    inner: Arc<Mutex<Inner>>,
}

impl LogoutScheduler {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                state: SchedulerState::Idle,
                generation: 0,
                timer: None,
            })),
        }
    }

    /// Arm the timer for `deadline`, replacing any pending timer.
    ///
    /// When the deadline has already passed, `on_fire` runs before this
    /// method returns instead of waiting for the runtime to poll a task.
    ///
    /// # Panics
    ///
    /// Must be called from within a tokio runtime when the deadline lies in
    /// the future.
    pub fn arm<F>(&self, deadline: DateTime<Utc>, on_fire: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let delay = (deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO);

        let mut inner = self.inner.lock();
        if let Some(previous) = inner.timer.take() {
            previous.abort();
        }
        inner.generation += 1;
        let generation = inner.generation;

        if delay.is_zero() {
            inner.state = SchedulerState::Fired;
            drop(inner);
            warn!(%deadline, "Credential already expired when armed, logging out now");
            on_fire();
            return;
        }

        inner.state = SchedulerState::Armed { deadline };
        debug!(%deadline, delay_ms = delay.as_millis() as u64, "Logout timer armed");

        let shared = Arc::clone(&self.inner);
        inner.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if Self::begin_fire(&shared, generation) {
                warn!("Credential expired, logging out");
                on_fire();
            }
        }));
    }

    /// Cancel the pending timer, if any, and return to `Idle` without firing.
    pub fn disarm(&self) {
        let mut inner = self.inner.lock();
        if let Some(timer) = inner.timer.take() {
            timer.abort();
            debug!("Logout timer disarmed");
        }
        inner.generation += 1;
        inner.state = SchedulerState::Idle;
    }

    pub fn state(&self) -> SchedulerState {
        self.inner.lock().state
    }

    pub fn is_armed(&self) -> bool {
        matches!(self.state(), SchedulerState::Armed { .. })
    }

    /// Deadline of the live timer
    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        match self.state() {
            SchedulerState::Armed { deadline } => Some(deadline),
            _ => None,
        }
    }

    /// Claim the right to fire. Fails when the timer was re-armed or
    /// disarmed after this task was spawned.
    fn begin_fire(shared: &Mutex<Inner>, generation: u64) -> bool {
        let mut inner = shared.lock();
        if inner.generation != generation || !matches!(inner.state, SchedulerState::Armed { .. }) {
            return false;
        }
        inner.state = SchedulerState::Fired;
        // The handle belongs to the running task; detach instead of aborting it
        inner.timer = None;
        true
    }
}

impl Default for LogoutScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for LogoutScheduler {
    fn drop(&mut self) {
        if let Some(timer) = self.inner.lock().timer.take() {
            timer.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::Duration as ChronoDuration;

    fn counter() -> (Arc<AtomicUsize>, impl Fn() -> Box<dyn FnOnce() + Send>) {
        let fired = Arc::new(AtomicUsize::new(0));
        let handle = Arc::clone(&fired);
        let make = move || {
            let fired = Arc::clone(&handle);
            Box::new(move || {
                fired.fetch_add(1, Ordering::SeqCst);
            }) as Box<dyn FnOnce() + Send>
        };
        (fired, make)
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_after_deadline() {
        let scheduler = LogoutScheduler::new();
        let (fired, make) = counter();

        scheduler.arm(Utc::now() + ChronoDuration::milliseconds(50), make());
        assert!(scheduler.is_armed());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.state(), SchedulerState::Fired);
    }

    #[tokio::test(start_paused = true)]
    async fn test_past_deadline_fires_synchronously() {
        let scheduler = LogoutScheduler::new();
        let (fired, make) = counter();

        scheduler.arm(Utc::now() - ChronoDuration::seconds(1), make());
        // No await in between: the effect already ran
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.state(), SchedulerState::Fired);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_replaces_previous_timer() {
        let scheduler = LogoutScheduler::new();
        let (first, make_first) = counter();
        let (second, make_second) = counter();

        scheduler.arm(Utc::now() + ChronoDuration::milliseconds(50), make_first());
        let later = Utc::now() + ChronoDuration::milliseconds(500);
        scheduler.arm(later, make_second());
        assert_eq!(scheduler.deadline(), Some(later));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disarm_prevents_firing() {
        let scheduler = LogoutScheduler::new();
        let (fired, make) = counter();

        scheduler.arm(Utc::now() + ChronoDuration::milliseconds(50), make());
        scheduler.disarm();
        assert_eq!(scheduler.state(), SchedulerState::Idle);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        // Disarming again is harmless
        scheduler.disarm();
        assert_eq!(scheduler.state(), SchedulerState::Idle);
    }
}
