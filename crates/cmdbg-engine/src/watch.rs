//! Variable-watch registry interface.
//!
//! The interpreter owns a [`VariableWatch`] and reports every variable
//! access to it. The engine only registers and removes callbacks; it never
//! drives the notifications itself.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use smol_str::SmolStr;

/// Kind of variable access reported by the interpreter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariableAccess {
    /// A defined variable was read.
    Read,
    /// An undefined variable was read.
    UnknownRead,
    /// A variable was written.
    Modified,
    /// An undefined variable came into existence.
    UnknownDefined,
    /// A variable was unset.
    Removed,
}

impl VariableAccess {
    /// Wire/console rendering of the access kind.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            VariableAccess::Read => "READ_ACCESS",
            VariableAccess::UnknownRead => "UNKNOWN_READ_ACCESS",
            VariableAccess::Modified => "MODIFIED_ACCESS",
            VariableAccess::UnknownDefined => "UNKNOWN_DEFINED_ACCESS",
            VariableAccess::Removed => "REMOVED_ACCESS",
        }
    }
}

/// Callback invoked with `(variable, access, new_value)` on a watched access.
pub type WatchCallback = Arc<dyn Fn(&str, VariableAccess, Option<&str>) + Send + Sync>;

struct WatchEntry {
    token: u64,
    callback: WatchCallback,
}

/// Registration sink for variable watches.
///
/// Callbacks are keyed by `(variable, token)` so a caller can remove exactly
/// the watch it installed.
#[derive(Default)]
pub struct VariableWatch {
    watches: Mutex<HashMap<SmolStr, Vec<WatchEntry>>>,
}

impl VariableWatch {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback for accesses to `variable`.
    pub fn add_watch(&self, variable: &str, token: u64, callback: WatchCallback) {
        let mut watches = self.watches.lock().expect("watch registry poisoned");
        watches
            .entry(SmolStr::new(variable))
            .or_default()
            .push(WatchEntry { token, callback });
    }

    /// Remove the callback registered under `(variable, token)`.
    pub fn remove_watch(&self, variable: &str, token: u64) {
        let mut watches = self.watches.lock().expect("watch registry poisoned");
        if let Some(entries) = watches.get_mut(variable) {
            entries.retain(|entry| entry.token != token);
            if entries.is_empty() {
                watches.remove(variable);
            }
        }
    }

    /// Report a variable access. Called by the interpreter.
    ///
    /// Callbacks run on the calling thread and may block it (a watchpoint
    /// hit pauses execution), so the registry lock is not held across them.
    pub fn notify(&self, variable: &str, access: VariableAccess, new_value: Option<&str>) {
        let callbacks: Vec<WatchCallback> = {
            let watches = self.watches.lock().expect("watch registry poisoned");
            match watches.get(variable) {
                Some(entries) => entries.iter().map(|e| Arc::clone(&e.callback)).collect(),
                None => return,
            }
        };
        for callback in callbacks {
            callback(variable, access, new_value);
        }
    }

    /// Number of live callbacks for `variable`.
    #[must_use]
    pub fn watch_count(&self, variable: &str) -> usize {
        let watches = self.watches.lock().expect("watch registry poisoned");
        watches.get(variable).map_or(0, Vec::len)
    }

    #[cfg(test)]
    pub(crate) fn callbacks_for(&self, variable: &str) -> Vec<WatchCallback> {
        let watches = self.watches.lock().expect("watch registry poisoned");
        watches.get(variable).map_or_else(Vec::new, |entries| {
            entries.iter().map(|e| Arc::clone(&e.callback)).collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn notify_reaches_only_matching_variable() {
        let watch = VariableWatch::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let recorded = Arc::clone(&hits);
        watch.add_watch(
            "FOO",
            1,
            Arc::new(move |name, access, value| {
                assert_eq!(name, "FOO");
                assert_eq!(access, VariableAccess::Modified);
                assert_eq!(value, Some("bar"));
                recorded.fetch_add(1, Ordering::SeqCst);
            }),
        );

        watch.notify("OTHER", VariableAccess::Modified, Some("x"));
        watch.notify("FOO", VariableAccess::Modified, Some("bar"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn remove_watch_is_token_scoped() {
        let watch = VariableWatch::new();
        watch.add_watch("FOO", 1, Arc::new(|_, _, _| {}));
        watch.add_watch("FOO", 2, Arc::new(|_, _, _| {}));
        assert_eq!(watch.watch_count("FOO"), 2);

        watch.remove_watch("FOO", 1);
        assert_eq!(watch.watch_count("FOO"), 1);
        watch.remove_watch("FOO", 2);
        assert_eq!(watch.watch_count("FOO"), 0);
    }
}
