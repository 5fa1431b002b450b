//! The Win32 message pump the plugin expects its process to run.
//!
//! GUI-less operation still needs this: plugins post messages to themselves
//! from timers and worker threads and hang if nobody dispatches them.

use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Nominal pump rate, roughly 60 Hz.
pub const TICK_INTERVAL: Duration = Duration::from_micros(16_667);

/// Lower bound between consecutive ticks. If the pump falls behind, for
/// example because a dispatched message blocked for a while, ticks are
/// spaced out instead of fired back to back to catch up.
pub const MIN_TICK_SPACING: Duration = Duration::from_millis(5);

pub struct EventLoop {
    interval: Duration,
    min_spacing: Duration,
}

impl Default for EventLoop {
    fn default() -> Self {
        Self {
            interval: TICK_INTERVAL,
            min_spacing: MIN_TICK_SPACING,
        }
    }
}

impl EventLoop {
    pub fn new(interval: Duration, min_spacing: Duration) -> Self {
        Self {
            interval,
            min_spacing,
        }
    }

    /// The deadline for the tick after one that was scheduled at `previous`
    /// and actually finished at `now`.
    pub fn next_deadline(&self, previous: Instant, now: Instant) -> Instant {
        std::cmp::max(previous + self.interval, now + self.min_spacing)
    }

    /// Call `tick` on schedule until the shutdown flag flips or its sender
    /// is gone.
    pub async fn run<F: FnMut()>(&self, mut shutdown: watch::Receiver<bool>, mut tick: F) {
        if *shutdown.borrow() {
            return;
        }
        let mut deadline = Instant::now() + self.interval;
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    tick();
                    deadline = self.next_deadline(deadline, Instant::now());
                }
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(windows)]
pub fn pump_messages() {
    use windows::Win32::UI::WindowsAndMessaging::{
        DispatchMessageW, PeekMessageW, TranslateMessage, MSG, PM_REMOVE,
    };

    let mut message = MSG::default();
    // SAFETY: plain message pumping on the thread that owns the queue.
    unsafe {
        while PeekMessageW(&mut message, None, 0, 0, PM_REMOVE).as_bool() {
            let _ = TranslateMessage(&message);
            DispatchMessageW(&message);
        }
    }
}

#[cfg(not(windows))]
pub fn pump_messages() {}
