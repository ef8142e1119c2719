//! Single-shot, rearmable timer with tries-indexed delays. Drives both
//! socket reconnects and channel rejoins.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;

/// Maps the attempt number (1-based) to a delay.
pub type DelayFn = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

/// Default schedule for reconnect and rejoin: 1s, 2s, 5s, 10s, then 10s.
pub fn default_delay(tries: u32) -> Duration {
    const STEPS: [u64; 4] = [1, 2, 5, 10];
    let index = (tries.max(1) as usize - 1).min(STEPS.len() - 1);
    Duration::from_secs(STEPS[index])
}

/// At most one firing is pending at any moment; `schedule` re-arms and
/// `reset` disarms. The timer never reports errors, it simply fires.
pub struct BackoffTimer {
    callback: Arc<dyn Fn() + Send + Sync>,
    delay_fn: DelayFn,
    inner: Mutex<TimerState>,
}

struct TimerState {
    tries: u32,
    pending: Option<JoinHandle<()>>,
}

impl BackoffTimer {
    pub fn new(callback: Arc<dyn Fn() + Send + Sync>, delay_fn: DelayFn) -> Self {
        Self {
            callback,
            delay_fn,
            inner: Mutex::new(TimerState {
                tries: 0,
                pending: None,
            }),
        }
    }

    /// (Re)arms the timer, cancelling any pending firing. The delay is
    /// computed from the incremented try count.
    pub fn schedule(&self) {
        let mut state = self.inner.lock().expect("timer lock");
        if let Some(pending) = state.pending.take() {
            pending.abort();
        }
        state.tries += 1;
        let delay = (self.delay_fn)(state.tries);
        let callback = Arc::clone(&self.callback);
        state.pending = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            callback();
        }));
    }

    /// Cancels any pending firing and zeroes the try count.
    pub fn reset(&self) {
        let mut state = self.inner.lock().expect("timer lock");
        if let Some(pending) = state.pending.take() {
            pending.abort();
        }
        state.tries = 0;
    }

    #[cfg(test)]
    fn tries(&self) -> u32 {
        self.inner.lock().expect("timer lock").tries
    }
}

impl Drop for BackoffTimer {
    fn drop(&mut self) {
        if let Ok(mut state) = self.inner.lock() {
            if let Some(pending) = state.pending.take() {
                pending.abort();
            }
        }
    }
}
