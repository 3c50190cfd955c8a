//! Append-only log capture with restartable readers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

#[derive(Default)]
struct Inner {
    lines: Mutex<Vec<String>>,
    closed: AtomicBool,
    notify: Notify,
}

/// Lines written by an execution unit, shared between the writer and any
/// number of readers.
#[derive(Clone, Default)]
pub struct LogBuffer {
    inner: Arc<Inner>,
}

impl LogBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, line: impl Into<String>) {
        if let Ok(mut lines) = self.inner.lines.lock() {
            lines.push(line.into());
        }
        self.inner.notify.notify_waiters();
    }

    /// Marks the stream complete. Readers drain what is left and then end.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Copy of every line captured so far.
    pub fn lines(&self) -> Vec<String> {
        self.inner
            .lines
            .lock()
            .map(|lines| lines.clone())
            .unwrap_or_default()
    }

    /// A reader starting from the first line.
    pub fn cursor(&self) -> LogCursor {
        LogCursor {
            buffer: self.clone(),
            position: 0,
        }
    }

    fn line_at(&self, position: usize) -> Option<String> {
        self.inner
            .lines
            .lock()
            .ok()
            .and_then(|lines| lines.get(position).cloned())
    }
}

/// Independent read position in a [`LogBuffer`].
pub struct LogCursor {
    buffer: LogBuffer,
    position: usize,
}

impl LogCursor {
    /// Next line, waiting for the writer if needed. `None` once the stream is
    /// closed and fully read.
    pub async fn next_line(&mut self) -> Option<String> {
        loop {
            let notified = self.buffer.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(line) = self.buffer.line_at(self.position) {
                self.position += 1;
                return Some(line);
            }
            if self.buffer.is_closed() {
                return None;
            }
            notified.await;
        }
    }
}
