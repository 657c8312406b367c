use std::{collections::VecDeque, sync::Mutex};

use super::event::{self, Notifier, Waiter};

/// A thread-safe FIFO handing items from producers to one async consumer.
///
/// The connection multiplexer pushes framed bytes into a `Channel` and the
/// transport writer task pops them. Closing the channel lets the consumer
/// drain whatever is queued: [`pop`](Channel::pop) keeps returning items
/// until the queue is empty and only then reports `None`.
pub(crate) struct Channel<T> {
    state: Mutex<State<T>>,
    notifier: Notifier,
    waiter: Waiter,
}

struct State<T> {
    queue: VecDeque<T>,
    closed: bool,
}

impl<T> Channel<T> {
    pub(crate) fn new() -> Self {
        let (notifier, waiter) = event::new();
        Self {
            state: Mutex::new(State {
                queue: VecDeque::new(),
                closed: false,
            }),
            notifier,
            waiter,
        }
    }

    /// Pushes a value to the back of the queue.
    ///
    /// Returns `true` iff the queue was empty before the push. Pushing to a
    /// closed channel drops the value and returns `false`.
    pub(crate) fn push(&self, t: T) -> bool {
        let was_empty = {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                return false;
            }
            let was_empty = state.queue.is_empty();
            state.queue.push_back(t);
            was_empty
        };
        let _ = self.notifier.notify();
        was_empty
    }

    /// Pops the next value, waiting until one is available.
    ///
    /// Returns `None` once the channel is closed and drained.
    pub(crate) async fn pop(&self) -> Option<T> {
        loop {
            {
                let mut state = self.state.lock().unwrap();
                if let Some(t) = state.queue.pop_front() {
                    return Some(t);
                }
                if state.closed {
                    return None;
                }
            }
            // The notification is level-triggered, so a push racing this
            // wait is never lost.
            if self.waiter.wait().await.is_err() {
                return self.pop_no_waiting();
            }
        }
    }

    /// Pops the next value without waiting; `None` if the queue is empty.
    pub(crate) fn pop_no_waiting(&self) -> Option<T> {
        self.state.lock().unwrap().queue.pop_front()
    }

    /// Closes the channel: once the queue empties, all waiters wake and all
    /// future pops return `None`.
    pub(crate) fn close(&self) {
        self.state.lock().unwrap().closed = true;
        let _ = self.notifier.notify();
    }

    /// Returns the number of queued items.
    #[allow(unused)]
    pub(crate) fn len(&self) -> usize {
        self.state.lock().unwrap().queue.len()
    }

    /// Returns a copy of the front item without popping it.
    #[allow(unused)]
    pub(crate) fn front(&self) -> Option<T>
    where
        T: Clone,
    {
        self.state.lock().unwrap().queue.front().cloned()
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use tokio::time::timeout;

    use super::*;

    #[tokio::test]
    async fn fifo_order() {
        let ch = Channel::new();
        assert!(ch.push(1));
        assert!(!ch.push(2));
        assert!(!ch.push(3));
        assert_eq!(ch.len(), 3);
        assert_eq!(ch.front(), Some(1));
        assert_eq!(ch.pop().await, Some(1));
        assert_eq!(ch.pop().await, Some(2));
        assert_eq!(ch.pop().await, Some(3));
        assert_eq!(ch.pop_no_waiting(), None);
    }

    #[tokio::test]
    async fn pop_blocks_until_push() {
        let ch = Arc::new(Channel::new());
        let consumer = {
            let ch = ch.clone();
            tokio::spawn(async move { ch.pop().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        ch.push(42);
        assert_eq!(consumer.await.unwrap(), Some(42));
    }

    #[tokio::test]
    async fn close_then_drain() {
        let ch = Channel::new();
        ch.push(1);
        ch.push(2);
        ch.close();
        // Queued items survive the close...
        assert_eq!(ch.pop().await, Some(1));
        assert_eq!(ch.pop().await, Some(2));
        // ...then pops return None instead of blocking.
        assert_eq!(
            timeout(Duration::from_millis(100), ch.pop()).await.unwrap(),
            None
        );
        // Pushes after close are dropped.
        assert!(!ch.push(3));
        assert_eq!(ch.len(), 0);
    }

    #[tokio::test]
    async fn close_wakes_waiter() {
        let ch: Arc<Channel<u8>> = Arc::new(Channel::new());
        let consumer = {
            let ch = ch.clone();
            tokio::spawn(async move { ch.pop().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        ch.close();
        assert_eq!(consumer.await.unwrap(), None);
    }

    #[tokio::test]
    async fn pushes_race_pops() {
        let ch = Arc::new(Channel::new());
        let producer = {
            let ch = ch.clone();
            tokio::spawn(async move {
                for i in 0..1000u32 {
                    ch.push(i);
                    if i % 64 == 0 {
                        tokio::task::yield_now().await;
                    }
                }
                ch.close();
            })
        };
        let mut seen = 0;
        while let Some(i) = ch.pop().await {
            assert_eq!(i, seen);
            seen += 1;
        }
        assert_eq!(seen, 1000);
        producer.await.unwrap();
    }
}
