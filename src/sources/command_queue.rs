//! Per-connection queue of outgoing commands.
//!
//! Commands are attempted strictly in order. A command the session does not
//! accept stays at the head and is attempted again on the next wake-up, so a
//! stuck command blocks the ones behind it until the queue is cleared.

use crate::sources::server::ServerStatus;
use crate::sources::{SessionResult, SessionWriter};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

type SendFn = Box<dyn FnMut(&dyn SessionWriter) -> SessionResult<bool> + Send>;
type ThenFn = Box<dyn FnOnce(&mut ServerStatus) + Send>;

/// A deferred send operation
pub struct QueuedCommand {
    label: String,
    send: SendFn,
    then: Option<ThenFn>,
}

impl QueuedCommand {
    pub fn new<F>(label: impl Into<String>, send: F) -> QueuedCommand
    where
        F: FnMut(&dyn SessionWriter) -> SessionResult<bool> + Send + 'static,
    {
        QueuedCommand {
            label: label.into(),
            send: Box::new(send),
            then: None,
        }
    }

    /// Adds a state update applied by the connection once the command has
    /// been accepted.
    pub fn then<F>(mut self, update: F) -> QueuedCommand
    where
        F: FnOnce(&mut ServerStatus) + Send + 'static,
    {
        self.then = Some(Box::new(update));
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

impl fmt::Debug for QueuedCommand {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("QueuedCommand")
            .field("label", &self.label)
            .finish()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DrainOutcome {
    Empty,
    Sent,
    Rejected,
}

#[derive(Default)]
struct Inner {
    items: VecDeque<QueuedCommand>,
    generation: u64,
    stopped: bool,
}

#[derive(Default)]
pub struct CommandQueue {
    inner: Mutex<Inner>,
    cond: Condvar,
}

impl CommandQueue {
    pub fn new() -> CommandQueue {
        CommandQueue::default()
    }

    pub fn enqueue(&self, command: QueuedCommand) {
        self.inner.lock().items.push_back(command);
        self.cond.notify_all();
    }

    /// Drops every pending command, including one being attempted right now
    /// if it ends up rejected.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.items.clear();
        inner.generation += 1;
    }

    /// Wakes the worker and makes it exit.
    pub fn stop(&self) {
        self.inner.lock().stopped = true;
        self.cond.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.lock().stopped
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().items.is_empty()
    }

    /// Attempts the head command. Without a writer the command counts as
    /// rejected.
    ///
    /// Only one thread may drain a queue.
    pub fn drain_one(
        &self,
        writer: Option<&dyn SessionWriter>,
        status: &Mutex<ServerStatus>,
    ) -> DrainOutcome {
        let (mut command, generation) = {
            let mut inner = self.inner.lock();
            match inner.items.pop_front() {
                Some(command) => (command, inner.generation),
                None => return DrainOutcome::Empty,
            }
        };

        let accepted = match writer {
            Some(writer) => match (command.send)(writer) {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("command {} failed: {}", command.label, e);
                    false
                }
            },
            None => false,
        };

        if accepted {
            debug!("sent {}", command.label);
            if let Some(update) = command.then.take() {
                update(&mut status.lock());
            }
            DrainOutcome::Sent
        } else {
            let mut inner = self.inner.lock();
            if inner.generation == generation {
                inner.items.push_front(command);
            }
            DrainOutcome::Rejected
        }
    }

    /// Blocks until there is something to send or the queue is stopped.
    /// With `retry`, waits at most that long, for re-attempting a rejected
    /// head. Returns false once stopped.
    pub fn wait_for_work(&self, retry: Option<Duration>) -> bool {
        let mut inner = self.inner.lock();
        match retry {
            Some(timeout) => {
                if !inner.stopped {
                    self.cond.wait_for(&mut inner, timeout);
                }
            }
            None => {
                while inner.items.is_empty() && !inner.stopped {
                    self.cond.wait(&mut inner);
                }
            }
        }
        !inner.stopped
    }
}
