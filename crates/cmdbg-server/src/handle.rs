//! Scoped owners for reactor resources.
//!
//! Every thread or handle the server spawns is wrapped in an owner whose
//! `reset` is idempotent, requests close, and (where the underlying I/O can
//! be interrupted) joins with a bounded poll interval. Drop implies reset,
//! so tearing a server down cannot leave a handle running callbacks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::warn;

use crate::server::ServerEvent;

/// Poll interval for stoppable accept/read loops.
pub(crate) const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Cross-thread wake handle feeding the reactor queue.
///
/// `send` after `reset` is a silent no-op. The inner mutex closes the race
/// between a sender on one thread and a concurrent reset on another.
#[derive(Clone)]
pub struct EventSender {
    inner: Arc<Mutex<Option<Sender<ServerEvent>>>>,
}

/// Create the reactor queue and its wake handle.
#[must_use]
pub fn wake_channel() -> (EventSender, Receiver<ServerEvent>) {
    let (tx, rx) = channel();
    (
        EventSender {
            inner: Arc::new(Mutex::new(Some(tx))),
        },
        rx,
    )
}

impl EventSender {
    /// Push an event onto the reactor queue; false once reset.
    pub fn send(&self, event: ServerEvent) -> bool {
        let inner = self.inner.lock().expect("wake handle poisoned");
        match inner.as_ref() {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }

    /// Queue a message for every open connection.
    pub fn broadcast(&self, message: impl Into<String>) -> bool {
        self.send(ServerEvent::Broadcast(message.into()))
    }

    /// Disarm the handle. Idempotent.
    pub fn reset(&self) {
        *self.inner.lock().expect("wake handle poisoned") = None;
    }
}

/// A worker thread owned by its scope.
///
/// `join_on_reset` is false for threads parked in uninterruptible reads
/// (stdin); those are detached on reset instead of joined.
pub(crate) struct ScopedThread {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    join_on_reset: bool,
}

impl ScopedThread {
    pub(crate) fn spawn(
        join_on_reset: bool,
        f: impl FnOnce(&AtomicBool) + Send + 'static,
    ) -> ScopedThread {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let handle = thread::spawn(move || f(&thread_stop));
        ScopedThread {
            stop,
            handle: Some(handle),
            join_on_reset,
        }
    }

    pub(crate) fn reset(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if self.join_on_reset {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for ScopedThread {
    fn drop(&mut self) {
        self.reset();
    }
}

fn signal_slot() -> &'static Mutex<Option<EventSender>> {
    static SLOT: OnceLock<Mutex<Option<EventSender>>> = OnceLock::new();
    SLOT.get_or_init(|| Mutex::new(None))
}

/// Routes the process interrupt signal into the serving reactor.
///
/// The OS-level handler is installed once per process and forwards to
/// whatever sender currently occupies the slot; resetting the guard empties
/// the slot so later interrupts go nowhere.
pub(crate) struct SignalGuard;

impl SignalGuard {
    pub(crate) fn install(events: EventSender) -> SignalGuard {
        *signal_slot().lock().expect("signal slot poisoned") = Some(events);

        static HANDLER: OnceLock<()> = OnceLock::new();
        HANDLER.get_or_init(|| {
            let result = ctrlc::set_handler(|| {
                let slot = signal_slot().lock().expect("signal slot poisoned");
                if let Some(events) = slot.as_ref() {
                    events.send(ServerEvent::Signal(2));
                }
            });
            if let Err(err) = result {
                warn!("failed to install interrupt handler: {err}");
            }
        });
        SignalGuard
    }

    pub(crate) fn reset(&self) {
        *signal_slot().lock().expect("signal slot poisoned") = None;
    }
}

impl Drop for SignalGuard {
    fn drop(&mut self) {
        self.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_after_reset_is_a_noop() {
        let (events, queue) = wake_channel();
        assert!(events.broadcast("first"));
        events.reset();
        events.reset();
        assert!(!events.broadcast("second"));

        let received: Vec<ServerEvent> = queue.try_iter().collect();
        assert_eq!(received.len(), 1);
        assert!(matches!(&received[0], ServerEvent::Broadcast(m) if m == "first"));
    }

    #[test]
    fn scoped_thread_joins_on_reset() {
        let mut thread = ScopedThread::spawn(true, |stop| {
            while !stop.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(1));
            }
        });
        thread.reset();
        assert!(thread.handle.is_none());
        thread.reset();
    }
}
