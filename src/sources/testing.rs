//! In-memory sessions for tests.

use crate::sources::*;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// A writer recording every line it accepts
#[derive(Default)]
pub struct RecordingWriter {
    lines: Mutex<Vec<String>>,
    raw: Mutex<Vec<Vec<u8>>>,
    reject_next: AtomicUsize,
    closed: AtomicBool,
}

impl RecordingWriter {
    pub fn new() -> RecordingWriter {
        RecordingWriter::default()
    }

    /// Makes the next `count` sends report "not accepted".
    pub fn reject_next(&self, count: usize) {
        self.reject_next.store(count, Ordering::SeqCst);
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().clone()
    }

    pub fn raw_lines(&self) -> Vec<Vec<u8>> {
        self.raw.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl SessionWriter for RecordingWriter {
    fn raw(&self, line: &[u8]) -> SessionResult<bool> {
        let pending = self.reject_next.load(Ordering::SeqCst);
        if pending > 0 {
            self.reject_next.store(pending - 1, Ordering::SeqCst);
            return Ok(false);
        }
        self.raw.lock().push(line.to_vec());
        self.lines
            .lock()
            .push(String::from_utf8_lossy(line).into_owned());
        Ok(true)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

pub type Script = Arc<dyn Fn(&mut dyn SessionHandler) + Send + Sync>;

pub struct MockSession {
    writer: Arc<RecordingWriter>,
    script: Script,
    block: bool,
    open_delay: Duration,
    opened: bool,
}

impl ChatSession for MockSession {
    fn open(&mut self, _: &Identity) -> SessionResult<()> {
        thread::sleep(self.open_delay);
        self.opened = true;
        Ok(())
    }

    fn writer(&self) -> Option<Arc<dyn SessionWriter>> {
        if self.opened {
            Some(self.writer.clone())
        } else {
            None
        }
    }

    fn run(&mut self, handler: &mut dyn SessionHandler) -> SessionResult<()> {
        (self.script)(handler);
        while self.block && !self.writer.is_closed() {
            thread::sleep(Duration::from_millis(5));
        }
        Err(SessionError::Closed)
    }
}

/// Hands out sessions sharing one recording writer. A fresh writer is used
/// once the previous one has been closed.
pub struct MockFactory {
    writer: Mutex<Arc<RecordingWriter>>,
    script: Script,
    block: bool,
    open_delay: Duration,
    created: AtomicUsize,
}

impl MockFactory {
    /// Sessions run the script then drop the connection.
    pub fn new(script: Script) -> MockFactory {
        MockFactory {
            writer: Mutex::new(Arc::new(RecordingWriter::new())),
            script,
            block: false,
            open_delay: Duration::from_millis(0),
            created: AtomicUsize::new(0),
        }
    }

    /// Sessions run the script then stay connected until closed.
    pub fn blocking(script: Script) -> MockFactory {
        MockFactory {
            block: true,
            ..MockFactory::new(script)
        }
    }

    /// Sessions that register and drop immediately.
    pub fn connecting() -> MockFactory {
        MockFactory::new(Arc::new(|h: &mut dyn SessionHandler| h.on_connect()))
    }

    /// Sessions take `delay` to open, like a slow TCP connect.
    pub fn slow_open(self, delay: Duration) -> MockFactory {
        MockFactory {
            open_delay: delay,
            ..self
        }
    }

    pub fn writer(&self) -> Arc<RecordingWriter> {
        self.writer.lock().clone()
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

impl SessionFactory for MockFactory {
    fn create(&self, _: &ServerInfo) -> SessionResult<Box<dyn ChatSession>> {
        self.created.fetch_add(1, Ordering::SeqCst);
        let mut writer = self.writer.lock();
        if writer.is_closed() {
            *writer = Arc::new(RecordingWriter::new());
        }
        Ok(Box::new(MockSession {
            writer: writer.clone(),
            script: self.script.clone(),
            block: self.block,
            open_delay: self.open_delay,
            opened: false,
        }))
    }
}
