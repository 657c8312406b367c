use std::sync::{
    Arc,
    atomic::{AtomicU8, Ordering},
};

use event_listener::{Event, IntoNotification};
use thiserror::Error;

/// Error returned when a wait operation fails because the notifier was
/// dropped.
#[derive(Debug, Error)]
#[error("no notifier available")]
pub(crate) struct WaitError;

/// Error returned when a notify operation fails because the waiter was
/// dropped.
#[derive(Debug, Error)]
#[error("no waiter available")]
pub(crate) struct NotifyError;

/// Event flag is unset (no notification pending).
const UNSET: u8 = 0;
/// Event flag is set (notification available).
const OK: u8 = 1 << 0;
/// Event flag indicates error (notifier or waiter dropped).
const ERR: u8 = 1 << 1;

/// Internal shared state for the event notification mechanism.
struct EventInner {
    event: Event,
    flag: AtomicU8,
}

impl EventInner {
    /// Checks and atomically clears the OK flag.
    fn check(&self) -> u8 {
        let f = self.flag.fetch_and(!OK, Ordering::AcqRel);
        if f & ERR != 0 { ERR } else { f }
    }

    /// Atomically sets the OK flag, returning false in error state.
    fn set(&self) -> bool {
        self.flag.fetch_or(OK, Ordering::AcqRel) & ERR == 0
    }

    /// Marks the event as errored (notifier or waiter dropped).
    fn err(&self) {
        self.flag.store(ERR, Ordering::Release);
        self.event.notify(1);
    }
}

/// Creates a connected single-event notifier/waiter pair.
///
/// A notification is level-triggered: it is preserved until consumed by a
/// wait, and multiple notifications before a wait coalesce into one.
pub(crate) fn new() -> (Notifier, Waiter) {
    let inner = Arc::new(EventInner {
        event: Event::new(),
        flag: AtomicU8::new(UNSET),
    });
    (Notifier(inner.clone()), Waiter(inner))
}

#[repr(transparent)]
pub(crate) struct Notifier(Arc<EventInner>);

impl Notifier {
    #[inline]
    pub(crate) fn notify(&self) -> Result<(), NotifyError> {
        if self.0.set() {
            self.0.event.notify(1.additional().relaxed());
            Ok(())
        } else {
            Err(NotifyError)
        }
    }
}

impl Drop for Notifier {
    fn drop(&mut self) {
        self.0.err();
    }
}

#[repr(transparent)]
pub(crate) struct Waiter(Arc<EventInner>);

impl Waiter {
    #[inline]
    pub(crate) async fn wait(&self) -> Result<(), WaitError> {
        loop {
            match self.0.check() {
                OK => return Ok(()),
                ERR => return Err(WaitError),
                _ => {}
            }

            let listener = self.0.event.listen();

            // Re-check: the flag may have been set between check and listen.
            match self.0.check() {
                OK => return Ok(()),
                ERR => return Err(WaitError),
                _ => {}
            }

            listener.await;
        }
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        self.0.err();
    }
}
