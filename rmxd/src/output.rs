//! Output buffer shared between a job's poller and its attached sessions.

use rmx_common::{Cursor, OutputBuffer};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

#[derive(Default)]
struct State {
    buffer: OutputBuffer,
    closed: bool,
}

/// One writer appends, any number of sessions read with their own cursors.
#[derive(Default)]
pub struct SharedOutput {
    state: Mutex<State>,
    changed: Condvar,
}

/// Result of one read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputRead {
    pub chunk: String,
    pub cursor: Cursor,
    /// No more output will ever arrive.
    pub closed: bool,
}

impl SharedOutput {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn append_str(&self, text: &str) {
        if text.is_empty() {
            return;
        }
        self.lock().buffer.append_str(text);
        self.changed.notify_all();
    }

    /// Mark end of output and wake every reader.
    pub fn close(&self) {
        self.lock().closed = true;
        self.changed.notify_all();
    }

    pub fn read(&self, cursor: &Cursor) -> OutputRead {
        let state = self.lock();
        let (chunk, cursor) = state.buffer.read(cursor);
        OutputRead {
            chunk,
            cursor,
            closed: state.closed,
        }
    }

    /// Wait until there is something past `cursor` or output is closed.
    ///
    /// Returns `false` if `timeout` elapsed with nothing new.
    pub fn wait_for_change(&self, cursor: &Cursor, timeout: Duration) -> bool {
        let state = self.lock();
        let (state, result) = self
            .changed
            .wait_timeout_while(state, timeout, |s| !s.closed && s.buffer.cursor() == *cursor)
            .unwrap_or_else(|e| e.into_inner());
        drop(state);
        !result.timed_out()
    }
}
