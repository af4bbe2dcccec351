//! The control socket.
//!
//! Administrators connect over a Unix socket or TCP and exchange JSON
//! objects, each followed by a blank line. One thread serves every client
//! with a single poll loop; connected clients also receive every event the
//! plugins see.

use crate::config::ControlConfig;
use crate::core::IncomingEvent;
use nix::poll::{poll, PollFd, PollFlags};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

pub mod client;
pub mod commands;

pub use self::client::{Client, Stream};
pub use self::commands::{execute, Context};

/// Poll timeout of the control loop, in milliseconds
const POLL_TIMEOUT: i32 = 250;

quick_error! {
    #[derive(Debug)]
    pub enum ControlError {
        Io(err: io::Error) {
            from()
            display("I/O error: {}", err)
        }
        Poll(err: nix::Error) {
            from()
            display("poll failed: {}", err)
        }
    }
}

pub type ControlResult<T> = Result<T, ControlError>;

fn greeting() -> Value {
    let part = |s: &str| s.parse::<u32>().unwrap_or(0);
    json!({
        "program": env!("CARGO_PKG_NAME"),
        "major": part(env!("CARGO_PKG_VERSION_MAJOR")),
        "minor": part(env!("CARGO_PKG_VERSION_MINOR")),
        "patch": part(env!("CARGO_PKG_VERSION_PATCH")),
    })
}

enum Listener {
    Unix(UnixListener, PathBuf),
    Tcp(TcpListener),
}

impl Listener {
    fn fd(&self) -> RawFd {
        match *self {
            Listener::Unix(ref l, _) => l.as_raw_fd(),
            Listener::Tcp(ref l) => l.as_raw_fd(),
        }
    }

    fn accept(&self) -> io::Result<(Stream, String)> {
        match *self {
            Listener::Unix(ref l, ref path) => {
                let (stream, _) = l.accept()?;
                Ok((Stream::Unix(stream), path.display().to_string()))
            }
            Listener::Tcp(ref l) => {
                let (stream, addr) = l.accept()?;
                Ok((Stream::Tcp(stream), addr.to_string()))
            }
        }
    }
}

/// What a slot of the poll set belongs to
#[derive(Clone, Copy)]
enum Slot {
    Waker,
    Listener(usize),
    Client(u64),
}

pub struct ControlTransport {
    listeners: Vec<Listener>,
    clients: Mutex<BTreeMap<u64, Client>>,
    next_id: Mutex<u64>,
    context: Context,
    wake_rx: UnixStream,
    wake_tx: UnixStream,
    running: AtomicBool,
}

impl ControlTransport {
    /// Binds the configured endpoints. A stale Unix socket file is replaced.
    pub fn bind(config: &ControlConfig, context: Context) -> ControlResult<ControlTransport> {
        let mut listeners = Vec::new();
        if let Some(ref path) = config.unix {
            if path.exists() {
                fs::remove_file(path)?;
            }
            let listener = UnixListener::bind(path)?;
            listener.set_nonblocking(true)?;
            info!("control: listening on {}", path.display());
            listeners.push(Listener::Unix(listener, path.clone()));
        }
        if let Some(addr) = config.tcp {
            let listener = TcpListener::bind(addr)?;
            listener.set_nonblocking(true)?;
            info!("control: listening on {}", listener.local_addr()?);
            listeners.push(Listener::Tcp(listener));
        }

        let (wake_rx, wake_tx) = UnixStream::pair()?;
        wake_rx.set_nonblocking(true)?;
        wake_tx.set_nonblocking(true)?;
        Ok(ControlTransport {
            listeners,
            clients: Mutex::new(BTreeMap::new()),
            next_id: Mutex::new(0),
            context,
            wake_rx,
            wake_tx,
            running: AtomicBool::new(true),
        })
    }

    /// Address of the TCP listener, if any.
    pub fn tcp_addr(&self) -> Option<SocketAddr> {
        self.listeners.iter().find_map(|l| match *l {
            Listener::Tcp(ref l) => l.local_addr().ok(),
            Listener::Unix(..) => None,
        })
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().len()
    }

    pub fn start(self: &Arc<Self>) -> io::Result<JoinHandle<()>> {
        let transport = self.clone();
        thread::Builder::new()
            .name("control".to_owned())
            .spawn(move || {
                if let Err(e) = transport.run() {
                    error!("control: {}", e);
                }
                transport.cleanup();
            })
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.wake();
    }

    fn wake(&self) {
        let _ = (&self.wake_tx).write(&[1]);
    }

    /// Sends an event to every connected client.
    pub fn broadcast(&self, event: &IncomingEvent) {
        let message = match serde_json::to_value(event) {
            Ok(message) => message,
            Err(e) => {
                warn!("control: cannot serialize event: {}", e);
                return;
            }
        };
        {
            let mut clients = self.clients.lock();
            if clients.is_empty() {
                return;
            }
            clients.retain(|_, client| match client.queue(&message) {
                Ok(()) => true,
                Err(e) => {
                    warn!("control: {} dropped: {}", client.peer(), e);
                    false
                }
            });
        }
        self.wake();
    }

    fn run(&self) -> ControlResult<()> {
        while self.running.load(Ordering::SeqCst) {
            let mut slots = vec![Slot::Waker];
            let mut fds = vec![PollFd::new(self.wake_rx.as_raw_fd(), PollFlags::POLLIN)];
            for (i, listener) in self.listeners.iter().enumerate() {
                slots.push(Slot::Listener(i));
                fds.push(PollFd::new(listener.fd(), PollFlags::POLLIN));
            }
            for (&id, client) in self.clients.lock().iter() {
                let mut flags = PollFlags::POLLIN;
                if client.wants_write() {
                    flags |= PollFlags::POLLOUT;
                }
                slots.push(Slot::Client(id));
                fds.push(PollFd::new(client.fd(), flags));
            }

            match poll(&mut fds, POLL_TIMEOUT) {
                Ok(_) => {}
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }

            let mut requests = Vec::new();
            for (slot, fd) in slots.iter().zip(fds.iter()) {
                let revents = match fd.revents() {
                    Some(revents) if !revents.is_empty() => revents,
                    _ => continue,
                };
                match *slot {
                    Slot::Waker => self.drain_waker(),
                    Slot::Listener(i) => self.accept_all(&self.listeners[i]),
                    Slot::Client(id) => {
                        if let Some(batch) = self.service(id, revents) {
                            requests.push((id, batch));
                        }
                    }
                }
            }

            // requests run without the client table locked
            for (id, batch) in requests {
                let responses: Vec<Value> = batch
                    .iter()
                    .map(|body| commands::execute(&self.context, body))
                    .collect();
                let mut clients = self.clients.lock();
                if let Some(client) = clients.get_mut(&id) {
                    let sent = responses
                        .iter()
                        .try_for_each(|response| client.queue(response))
                        .and_then(|()| client.flush());
                    if let Err(e) = sent {
                        debug!("control: {} dropped: {}", client.peer(), e);
                        clients.remove(&id);
                    }
                }
            }
        }
        Ok(())
    }

    fn drain_waker(&self) {
        let mut buf = [0u8; 64];
        while let Ok(n) = (&self.wake_rx).read(&mut buf) {
            if n == 0 {
                break;
            }
        }
    }

    fn accept_all(&self, listener: &Listener) {
        loop {
            match listener.accept() {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nonblocking() {
                        warn!("control: cannot set up client {}: {}", peer, e);
                        continue;
                    }
                    debug!("control: client {} connected", peer);
                    let mut client = Client::new(stream, peer);
                    if let Err(e) = client.queue(&greeting()) {
                        warn!("control: cannot greet {}: {}", client.peer(), e);
                        continue;
                    }
                    let id = {
                        let mut next = self.next_id.lock();
                        *next += 1;
                        *next
                    };
                    self.clients.lock().insert(id, client);
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!("control: accept failed: {}", e);
                    break;
                }
            }
        }
    }

    /// Handles readiness of one client. Returns the requests it completed;
    /// a client that failed or hung up is removed.
    fn service(&self, id: u64, revents: PollFlags) -> Option<Vec<String>> {
        let mut clients = self.clients.lock();
        let client = clients.get_mut(&id)?;
        let result = (|| -> io::Result<Option<Vec<String>>> {
            if revents.contains(PollFlags::POLLOUT) {
                client.flush()?;
            }
            if revents.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR) {
                let open = client.read_available()?;
                let requests = client.take_requests()?;
                if !open {
                    return Err(io::Error::new(ErrorKind::UnexpectedEof, "disconnected"));
                }
                return Ok(Some(requests).filter(|r| !r.is_empty()));
            }
            Ok(None)
        })();

        match result {
            Ok(requests) => requests,
            Err(e) => {
                debug!("control: client {} gone: {}", client.peer(), e);
                clients.remove(&id);
                None
            }
        }
    }

    fn cleanup(&self) {
        self.clients.lock().clear();
        for listener in &self.listeners {
            if let Listener::Unix(_, ref path) = *listener {
                let _ = fs::remove_file(path);
            }
        }
        debug!("control: stopped");
    }
}
