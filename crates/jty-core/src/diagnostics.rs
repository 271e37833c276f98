//! Per-request error reporting and the aggregate failure flag.

use parking_lot::Mutex;
use std::fmt;
use std::io::Write;

/// Sink for per-request error messages.
///
/// The log destination and the failure flag live behind one lock: a report
/// writes its whole message and raises the flag before any other report can
/// start.
pub struct Diagnostics {
    state: Mutex<State>,
}

struct State {
    dest: Box<dyn Write + Send>,
    failed: bool,
    reported: usize,
}

impl Diagnostics {
    /// Create diagnostics that log to `dest`.
    pub fn new(dest: impl Write + Send + 'static) -> Self {
        Self {
            state: Mutex::new(State {
                dest: Box::new(dest),
                failed: false,
                reported: 0,
            }),
        }
    }

    /// Log `err` as one line and mark the run as failed.
    pub fn report(&self, err: &dyn fmt::Display) {
        let mut state = self.state.lock();
        tracing::debug!(error = %err, "request failed");
        // A broken log destination must not take the worker down.
        let _ = writeln!(state.dest, "{err}");
        let _ = state.dest.flush();
        state.failed = true;
        state.reported += 1;
    }

    /// Whether any error has been reported.
    pub fn has_failed(&self) -> bool {
        self.state.lock().failed
    }

    /// Number of errors reported so far.
    pub fn reported(&self) -> usize {
        self.state.lock().reported
    }
}

impl fmt::Debug for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Diagnostics")
            .field("failed", &state.failed)
            .field("reported", &state.reported)
            .finish()
    }
}
