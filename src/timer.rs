//! # Timers
//!
//! ROS-style timers hosted on the node's runtime. A timer is periodic or
//! one-shot, with the period in seconds; each firing hands the callback
//! a [`TimerEvent`] with wall-clock bookkeeping. A panic inside the
//! callback is caught and logged — the timer keeps running.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::task::JoinHandle;
use tracing::error;

/// Wall-clock bookkeeping passed to each timer firing (UNIX seconds).
#[derive(Clone, Copy, Debug, Default)]
pub struct TimerEvent {
    /// When this firing actually ran.
    pub current_real: f64,
    /// When the previous firing ran (0.0 on the first).
    pub last_real: f64,
    /// When this firing was scheduled to run.
    pub expected_real: f64,
    /// Duration of the previous callback invocation, in milliseconds.
    pub last_duration_ms: i64,
}

pub type TimerCallback = Arc<dyn Fn(&TimerEvent) + Send + Sync>;

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

struct TimerShared {
    period: f64,
    oneshot: bool,
    running: bool,
    paused: bool,
    task: Option<JoinHandle<()>>,
    last_current: f64,
    last_expected: f64,
    last_duration_ms: i64,
}

struct TimerInner {
    callback: TimerCallback,
    shared: Mutex<TimerShared>,
}

impl TimerInner {
    fn fire(&self) {
        let start = now_secs();
        let event = {
            let shared = self.shared.lock().unwrap();
            TimerEvent {
                current_real: start,
                last_real: shared.last_current,
                expected_real: shared.last_expected + shared.period,
                last_duration_ms: shared.last_duration_ms,
            }
        };

        let cb = self.callback.clone();
        if catch_unwind(AssertUnwindSafe(|| cb(&event))).is_err() {
            error!("timer callback panicked");
        }

        let end = now_secs();
        let mut shared = self.shared.lock().unwrap();
        shared.last_duration_ms = ((end - start) * 1000.0) as i64;
        shared.last_current = start;
        shared.last_expected = event.expected_real;
    }
}

/// A running timer. Dropping the handle stops it.
pub struct Timer {
    inner: Arc<TimerInner>,
}

impl Timer {
    /// Create and start a timer. `period` is in seconds.
    pub fn start(period: f64, callback: TimerCallback, oneshot: bool) -> Self {
        let timer = Self {
            inner: Arc::new(TimerInner {
                callback,
                shared: Mutex::new(TimerShared {
                    period,
                    oneshot,
                    running: false,
                    paused: false,
                    task: None,
                    last_current: 0.0,
                    last_expected: 0.0,
                    last_duration_ms: 0,
                }),
            }),
        };
        timer.spawn(None);
        timer
    }

    /// Spawn the firing loop; `initial_delay` overrides the first wait
    /// (used by resume).
    fn spawn(&self, initial_delay: Option<f64>) {
        let mut shared = self.inner.shared.lock().unwrap();
        if shared.running {
            return;
        }
        shared.running = true;
        shared.paused = false;
        shared.last_expected = now_secs();

        let inner = self.inner.clone();
        let first_delay = initial_delay.unwrap_or(shared.period);
        shared.task = Some(tokio::spawn(async move {
            let mut delay = first_delay;
            loop {
                tokio::time::sleep(Duration::from_secs_f64(delay.max(0.0))).await;
                inner.fire();
                let mut shared = inner.shared.lock().unwrap();
                if shared.oneshot {
                    shared.running = false;
                    shared.task = None;
                    return;
                }
                delay = shared.period;
            }
        }));
    }

    pub fn period(&self) -> f64 {
        self.inner.shared.lock().unwrap().period
    }

    pub fn is_running(&self) -> bool {
        self.inner.shared.lock().unwrap().running
    }

    pub fn stop(&self) {
        let mut shared = self.inner.shared.lock().unwrap();
        if let Some(task) = shared.task.take() {
            task.abort();
        }
        shared.running = false;
        shared.paused = false;
    }

    /// Pause without losing phase; `resume` picks up the remaining wait.
    pub fn pause(&self) {
        let mut shared = self.inner.shared.lock().unwrap();
        if !shared.running || shared.paused {
            return;
        }
        if let Some(task) = shared.task.take() {
            task.abort();
        }
        shared.running = false;
        shared.paused = true;
    }

    pub fn resume(&self) {
        let remaining = {
            let shared = self.inner.shared.lock().unwrap();
            if shared.running || !shared.paused {
                return;
            }
            let elapsed = now_secs() - shared.last_current;
            (shared.period - elapsed.rem_euclid(shared.period.max(f64::EPSILON))).max(0.0)
        };
        self.spawn(Some(remaining));
    }

    pub fn set_period(&self, period: f64) {
        let was_running = self.is_running();
        if was_running {
            self.stop();
        }
        self.inner.shared.lock().unwrap().period = period;
        if was_running {
            self.spawn(None);
        }
    }

    pub fn set_oneshot(&self, oneshot: bool) {
        let was_running = self.is_running();
        if was_running {
            self.stop();
        }
        self.inner.shared.lock().unwrap().oneshot = oneshot;
        if was_running {
            self.spawn(None);
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn counter_callback(counter: Arc<AtomicU32>) -> TimerCallback {
        Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test]
    async fn periodic_timer_fires_repeatedly() {
        let count = Arc::new(AtomicU32::new(0));
        let timer = Timer::start(0.01, counter_callback(count.clone()), false);

        tokio::time::sleep(Duration::from_millis(200)).await;
        timer.stop();
        let fired = count.load(Ordering::SeqCst);
        assert!(fired >= 3, "expected several firings, got {fired}");
        assert!(!timer.is_running());
    }

    #[tokio::test]
    async fn oneshot_timer_fires_once() {
        let count = Arc::new(AtomicU32::new(0));
        let timer = Timer::start(0.01, counter_callback(count.clone()), true);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!timer.is_running());
    }

    #[tokio::test]
    async fn panicking_callback_does_not_kill_the_timer() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let timer = Timer::start(
            0.01,
            Arc::new(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
                panic!("boom");
            }),
            false,
        );

        tokio::time::sleep(Duration::from_millis(150)).await;
        timer.stop();
        assert!(count.load(Ordering::SeqCst) >= 2, "timer died after a panic");
    }

    #[tokio::test]
    async fn stop_prevents_further_firings() {
        let count = Arc::new(AtomicU32::new(0));
        let timer = Timer::start(0.02, counter_callback(count.clone()), false);

        tokio::time::sleep(Duration::from_millis(70)).await;
        timer.stop();
        let at_stop = count.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(count.load(Ordering::SeqCst), at_stop);
    }

    #[tokio::test]
    async fn pause_and_resume_keep_the_timer_alive() {
        let count = Arc::new(AtomicU32::new(0));
        let timer = Timer::start(0.01, counter_callback(count.clone()), false);

        tokio::time::sleep(Duration::from_millis(50)).await;
        timer.pause();
        assert!(!timer.is_running());
        let at_pause = count.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(count.load(Ordering::SeqCst), at_pause);

        timer.resume();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(count.load(Ordering::SeqCst) > at_pause);
        timer.stop();
    }

    #[tokio::test]
    async fn set_period_takes_effect() {
        let count = Arc::new(AtomicU32::new(0));
        let timer = Timer::start(10.0, counter_callback(count.clone()), false);
        assert_eq!(timer.period(), 10.0);

        // Shrinking the period restarts the firing loop with it.
        timer.set_period(0.01);
        tokio::time::sleep(Duration::from_millis(150)).await;
        timer.stop();
        assert!(count.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn event_bookkeeping_progresses() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let e = events.clone();
        let timer = Timer::start(
            0.01,
            Arc::new(move |ev: &TimerEvent| {
                e.lock().unwrap().push(*ev);
            }),
            false,
        );

        tokio::time::sleep(Duration::from_millis(120)).await;
        timer.stop();

        let events = events.lock().unwrap();
        assert!(events.len() >= 2);
        assert_eq!(events[0].last_real, 0.0);
        // Second firing carries the first firing's wall-clock time.
        assert!((events[1].last_real - events[0].current_real).abs() < 1e-9);
        assert!(events[1].expected_real > events[0].expected_real);
    }
}
