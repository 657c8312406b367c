use std::{
    mem,
    sync::{Arc, Mutex},
    time::Duration,
};

/// A queue that accumulates items one at a time and flushes them to a
/// consumer in batches.
///
/// A `push` schedules a flush signal after `latency`; once `capacity` items
/// accumulate an immediate signal is raised as well, deduplicating with the
/// delayed one at the consumer. The consumer reacts to a signal by calling
/// [`pop`](Batcher::pop), which takes the whole batch in insertion order.
///
/// No item is ever dropped, and a signal may find the batch already taken by
/// a previous one; consumers must tolerate an empty `pop`.
pub(crate) struct Batcher<T> {
    shared: Arc<Shared<T>>,
    latency: Duration,
    capacity: usize,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    signal: Box<dyn Fn() + Send + Sync>,
}

struct State<T> {
    items: Vec<T>,
    scheduled: bool,
}

impl<T> Clone for Batcher<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            latency: self.latency,
            capacity: self.capacity,
        }
    }
}

impl<T: Send + 'static> Batcher<T> {
    /// Creates a batcher that raises `signal` when a batch is ready.
    ///
    /// `capacity == 0` disables the size-triggered flush.
    pub(crate) fn new(
        latency: Duration,
        capacity: usize,
        signal: impl Fn() + Send + Sync + 'static,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    items: Vec::new(),
                    scheduled: false,
                }),
                signal: Box::new(signal),
            }),
            latency,
            capacity,
        }
    }

    /// Appends an item to the current batch, scheduling flush signals as
    /// needed. Thread-safe.
    pub(crate) fn push(&self, item: T) {
        let (schedule, immediate) = {
            let mut state = self.shared.state.lock().unwrap();
            state.items.push(item);
            let schedule = !state.scheduled;
            state.scheduled = true;
            let immediate = self.capacity > 0 && state.items.len() >= self.capacity;
            (schedule, immediate)
        };

        if schedule {
            if self.latency.is_zero() {
                (self.shared.signal)();
            } else {
                let shared = self.shared.clone();
                let latency = self.latency;
                tokio::spawn(async move {
                    tokio::time::sleep(latency).await;
                    (shared.signal)();
                });
            }
        }
        if immediate && !self.latency.is_zero() {
            (self.shared.signal)();
        }
    }

    /// Atomically takes the entire current batch, which may be empty, and
    /// clears the scheduled flag. Thread-safe.
    pub(crate) fn pop(&self) -> Vec<T> {
        let mut state = self.shared.state.lock().unwrap();
        state.scheduled = false;
        mem::take(&mut state.items)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test]
    async fn batches_in_insertion_order() {
        let signals = Arc::new(AtomicUsize::new(0));
        let s = signals.clone();
        let batcher = Batcher::new(Duration::ZERO, 0, move || {
            s.fetch_add(1, Ordering::SeqCst);
        });

        batcher.push(1);
        batcher.push(2);
        batcher.push(3);

        assert_eq!(batcher.pop(), vec![1, 2, 3]);
        // One signal for the whole batch: later pushes saw a scheduled flush.
        assert_eq!(signals.load(Ordering::SeqCst), 1);
        // After pop, a new push schedules again.
        batcher.push(4);
        assert_eq!(signals.load(Ordering::SeqCst), 2);
        assert_eq!(batcher.pop(), vec![4]);
    }

    #[tokio::test]
    async fn empty_pop_is_tolerated() {
        let batcher: Batcher<u8> = Batcher::new(Duration::ZERO, 0, || {});
        assert!(batcher.pop().is_empty());
    }

    #[tokio::test]
    async fn capacity_triggers_immediate_signal() {
        let signals = Arc::new(AtomicUsize::new(0));
        let s = signals.clone();
        let batcher = Batcher::new(Duration::from_secs(60), 2, move || {
            s.fetch_add(1, Ordering::SeqCst);
        });

        batcher.push(1);
        assert_eq!(signals.load(Ordering::SeqCst), 0); // only the delayed flush is pending
        batcher.push(2);
        assert_eq!(signals.load(Ordering::SeqCst), 1); // capacity reached
        assert_eq!(batcher.pop(), vec![1, 2]);
    }

    #[tokio::test]
    async fn delayed_signal_fires() {
        let signals = Arc::new(AtomicUsize::new(0));
        let s = signals.clone();
        let batcher = Batcher::new(Duration::from_millis(5), 0, move || {
            s.fetch_add(1, Ordering::SeqCst);
        });

        batcher.push(7);
        assert_eq!(signals.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(signals.load(Ordering::SeqCst), 1);
        assert_eq!(batcher.pop(), vec![7]);
    }
}
