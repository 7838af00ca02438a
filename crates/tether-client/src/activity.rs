//! Smooths high-frequency session activity pings into batched updates.
//!
//! Significant changes (first sighting, `active` or `thinking` flipping, or a
//! timestamp jump past the staleness threshold) flush immediately together
//! with everything pending. Timestamp-only refreshes are coalesced per
//! session and flushed by a single debounce timer that further refreshes do
//! not push back.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityUpdate {
    pub id: String,
    pub active: bool,
    pub thinking: bool,
    pub active_at: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct AccumulatorConfig {
    pub debounce: Duration,
    /// Timestamp advance (ms) that forces an immediate flush.
    pub staleness_ms: u64,
}

impl AccumulatorConfig {
    /// The staleness threshold is half the presence timeout, so a session
    /// never looks offline because its refresh sat in the debounce buffer.
    pub fn new(debounce: Duration, disconnect_timeout: Duration) -> Self {
        Self {
            debounce,
            staleness_ms: disconnect_timeout.as_millis() as u64 / 2,
        }
    }
}

#[derive(Default)]
struct Inner {
    last_emitted: HashMap<String, ActivityUpdate>,
    pending: BTreeMap<String, ActivityUpdate>,
    timer: Option<JoinHandle<()>>,
    /// Bumped whenever the armed timer is superseded.
    generation: u64,
}

impl Inner {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        self.generation = self.generation.wrapping_add(1);
    }

    fn take_batch(&mut self) -> Vec<ActivityUpdate> {
        self.cancel_timer();
        let batch: Vec<ActivityUpdate> = std::mem::take(&mut self.pending).into_values().collect();
        for update in &batch {
            self.last_emitted.insert(update.id.clone(), update.clone());
        }
        batch
    }
}

#[derive(Clone)]
pub struct ActivityAccumulator {
    inner: Arc<Mutex<Inner>>,
    tx: mpsc::UnboundedSender<Vec<ActivityUpdate>>,
    config: AccumulatorConfig,
}

impl ActivityAccumulator {
    /// Batches arrive on the returned receiver, one `Vec` per flush.
    pub fn new(config: AccumulatorConfig) -> (Self, mpsc::UnboundedReceiver<Vec<ActivityUpdate>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let accumulator = Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            tx,
            config,
        };
        (accumulator, rx)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, batch: Vec<ActivityUpdate>) {
        if batch.is_empty() {
            return;
        }
        if self.tx.send(batch).is_err() {
            tracing::debug!("activity receiver dropped");
        }
    }

    fn is_significant(&self, last: Option<&ActivityUpdate>, update: &ActivityUpdate) -> bool {
        let Some(last) = last else {
            return true;
        };
        last.active != update.active
            || last.thinking != update.thinking
            || update.active_at > last.active_at.saturating_add(self.config.staleness_ms)
    }

    pub fn add_update(&self, update: ActivityUpdate) {
        let mut inner = self.lock();
        let significant = self.is_significant(inner.last_emitted.get(&update.id), &update);
        inner.pending.insert(update.id.clone(), update);

        if significant {
            let batch = inner.take_batch();
            drop(inner);
            self.emit(batch);
            return;
        }

        if inner.timer.is_none() {
            let generation = inner.generation;
            let this = self.clone();
            let debounce = self.config.debounce;
            inner.timer = Some(tokio::spawn(async move {
                tokio::time::sleep(debounce).await;
                let mut inner = this.lock();
                if inner.generation != generation {
                    return;
                }
                inner.timer = None;
                let batch = inner.take_batch();
                drop(inner);
                this.emit(batch);
            }));
        }
    }

    /// Emit everything pending now.
    pub fn flush(&self) {
        let batch = self.lock().take_batch();
        self.emit(batch);
    }

    /// Drop pending updates and disarm the timer.
    pub fn cancel(&self) {
        let mut inner = self.lock();
        inner.cancel_timer();
        inner.pending.clear();
    }

    /// `cancel`, and forget what was last emitted.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.cancel_timer();
        inner.pending.clear();
        inner.last_emitted.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEBOUNCE: Duration = Duration::from_millis(2000);

    fn accumulator() -> (ActivityAccumulator, mpsc::UnboundedReceiver<Vec<ActivityUpdate>>) {
        ActivityAccumulator::new(AccumulatorConfig::new(DEBOUNCE, Duration::from_secs(120)))
    }

    fn ping(id: &str, active: bool, thinking: bool, active_at: u64) -> ActivityUpdate {
        ActivityUpdate {
            id: id.to_string(),
            active,
            thinking,
            active_at,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn first_sighting_emits_immediately() {
        let (acc, mut rx) = accumulator();
        acc.add_update(ping("s1", true, false, 1_000));
        assert_eq!(rx.try_recv().unwrap(), vec![ping("s1", true, false, 1_000)]);
    }

    #[tokio::test(start_paused = true)]
    async fn flips_emit_immediately_with_pending() {
        let (acc, mut rx) = accumulator();
        acc.add_update(ping("s1", true, false, 1_000));
        acc.add_update(ping("s2", true, false, 1_000));
        rx.try_recv().unwrap();
        rx.try_recv().unwrap();

        acc.add_update(ping("s2", true, false, 2_000));
        assert!(rx.try_recv().is_err());

        acc.add_update(ping("s1", true, true, 3_000));
        let batch = rx.try_recv().unwrap();
        assert_eq!(
            batch,
            vec![ping("s1", true, true, 3_000), ping("s2", true, false, 2_000)]
        );

        tokio::time::sleep(DEBOUNCE * 2).await;
        assert!(rx.try_recv().is_err(), "timer must be cancelled by the flush");
    }

    #[tokio::test(start_paused = true)]
    async fn stale_timestamp_emits_immediately() {
        let (acc, mut rx) = accumulator();
        acc.add_update(ping("s1", true, false, 0));
        rx.try_recv().unwrap();
        acc.add_update(ping("s1", true, false, 60_001));
        assert_eq!(rx.try_recv().unwrap(), vec![ping("s1", true, false, 60_001)]);
    }

    #[tokio::test(start_paused = true)]
    async fn timer_is_not_reset_by_later_refreshes() {
        let (acc, mut rx) = accumulator();
        acc.add_update(ping("s1", true, false, 0));
        rx.try_recv().unwrap();

        acc.add_update(ping("s1", true, false, 100));
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        acc.add_update(ping("s1", true, false, 200));
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(rx.try_recv().unwrap(), vec![ping("s1", true, false, 200)]);

        tokio::time::sleep(DEBOUNCE * 2).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_drops_pending_and_reset_forgets_history() {
        let (acc, mut rx) = accumulator();
        acc.add_update(ping("s1", true, false, 0));
        rx.try_recv().unwrap();

        acc.add_update(ping("s1", true, false, 10));
        acc.cancel();
        tokio::time::sleep(DEBOUNCE * 2).await;
        assert!(rx.try_recv().is_err());

        acc.add_update(ping("s1", true, false, 20));
        acc.flush();
        assert_eq!(rx.try_recv().unwrap(), vec![ping("s1", true, false, 20)]);

        acc.reset();
        acc.add_update(ping("s1", true, false, 30));
        assert_eq!(rx.try_recv().unwrap(), vec![ping("s1", true, false, 30)]);
    }
}
