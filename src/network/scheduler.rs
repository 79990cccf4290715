//! Cancelable periodic tasks
//!
//! Used for the connection heartbeat and the populator round. Cancelling is
//! synchronous: once `cancel` returns, the tick closure is never invoked again.

use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// A closure run on a fixed period until cancelled
#[derive(Debug)]
pub struct ScheduledTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl ScheduledTask {
    /// Run `tick` every `period`, starting one period from now
    pub fn every<F>(period: Duration, token: CancellationToken, mut tick: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        let task_token = token.clone();
        let handle = tokio::spawn(async move {
            let mut interval = interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = task_token.cancelled() => break,
                    _ = interval.tick() => {
                        if task_token.is_cancelled() {
                            break;
                        }
                        tick();
                    }
                }
            }
        });
        Self { token, handle }
    }

    pub fn cancel(&self) {
        self.token.cancel();
        self.handle.abort();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.cancel();
    }
}
