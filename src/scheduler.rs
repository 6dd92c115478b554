// Jittered ticker. Each period is interval +/- uniform(0, delay); a tick the consumer
// has not drained yet is dropped rather than queued.

use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

/// Next period: `interval` shifted by a uniform offset in `[-delay, +delay]`, floored at zero.
pub fn jittered(interval: Duration, delay: Duration) -> Duration {
    let delay_ms = delay.as_millis() as u64;
    if delay_ms == 0 {
        return interval;
    }
    let offset = Duration::from_millis(fastrand::u64(0..=delay_ms));
    if fastrand::bool() {
        interval + offset
    } else {
        interval.saturating_sub(offset)
    }
}

pub struct JitterTicker {
    rx: mpsc::Receiver<Instant>,
    stop_tx: watch::Sender<bool>,
    handle: tokio::task::JoinHandle<()>,
}

impl JitterTicker {
    /// Starts emitting ticks. The first tick fires one jittered period from now.
    pub fn start(interval: Duration, delay: Duration) -> Self {
        let (tx, rx) = mpsc::channel(1);
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            loop {
                let period = jittered(interval, delay);
                tokio::select! {
                    _ = tokio::time::sleep(period) => {}
                    _ = stop_rx.changed() => break,
                }
                match tx.try_send(Instant::now()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        tracing::debug!("previous tick still pending; dropping tick");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => break,
                }
            }
        });
        Self {
            rx,
            stop_tx,
            handle,
        }
    }

    /// Waits for the next tick. Returns `None` once stopped.
    pub async fn tick(&mut self) -> Option<Instant> {
        self.rx.recv().await
    }

    /// Stops the ticker. Pending ticks are discarded and none are emitted afterwards.
    pub fn stop(&mut self) {
        let _ = self.stop_tx.send(true);
        self.handle.abort();
        self.rx.close();
        while self.rx.try_recv().is_ok() {}
    }
}

impl Drop for JitterTicker {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
