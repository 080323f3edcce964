//! Cooperative timers, re-expressing the original's asyncio `Timekeeper` as cancellable tokio
//! tasks (spec.md §9 "cooperative task model"). Dropping a `Timekeeper` cancels it, so "at most
//! one ack timer / resend timer" (spec.md §3) falls out of normal `Option<Timekeeper>` ownership.

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;

pub struct Timekeeper {
    handle: JoinHandle<()>,
}

impl Timekeeper {
    /// Run `callback` once after `delay`.
    pub fn once<F, Fut>(delay: Duration, callback: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            callback().await;
        });
        Self { handle }
    }

    /// Run `callback` repeatedly, with the delay between calls starting at `initial` and
    /// multiplying by `scaling` after every firing, capped at `cap`.
    pub fn exponential<F, Fut>(initial: Duration, scaling: f64, cap: Duration, mut callback: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            let mut delay = initial;
            loop {
                tokio::time::sleep(delay).await;
                callback().await;
                delay = delay.mul_f64(scaling).min(cap);
            }
        });
        Self { handle }
    }

    /// Stop the timer. Equivalent to dropping it, spelled out for call-site clarity.
    pub fn cancel(self) {
        self.handle.abort();
    }
}

impl Drop for Timekeeper {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
