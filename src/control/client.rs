use serde_json::Value;
use std::io::{self, ErrorKind, Read, Write};
use std::net::TcpStream;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;

/// Input accumulated without a request terminator before the client is
/// dropped
pub const MAX_PENDING_INPUT: usize = 64 * 1024;
/// Output a client may leave unread before it is dropped
pub const MAX_PENDING_OUTPUT: usize = 1024 * 1024;

const TERMINATOR: &[u8] = b"\r\n\r\n";

pub enum Stream {
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl Stream {
    pub fn set_nonblocking(&self) -> io::Result<()> {
        match *self {
            Stream::Unix(ref s) => s.set_nonblocking(true),
            Stream::Tcp(ref s) => s.set_nonblocking(true),
        }
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match *self {
            Stream::Unix(ref mut s) => s.read(buf),
            Stream::Tcp(ref mut s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match *self {
            Stream::Unix(ref mut s) => s.write(buf),
            Stream::Tcp(ref mut s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match *self {
            Stream::Unix(ref mut s) => s.flush(),
            Stream::Tcp(ref mut s) => s.flush(),
        }
    }
}

impl AsRawFd for Stream {
    fn as_raw_fd(&self) -> RawFd {
        match *self {
            Stream::Unix(ref s) => s.as_raw_fd(),
            Stream::Tcp(ref s) => s.as_raw_fd(),
        }
    }
}

/// Position of the first blank line in `buf`, as (end of request, start of
/// the next one). Both `\n\n` and `\r\n\r\n` end a request.
fn find_terminator(buf: &[u8]) -> Option<(usize, usize)> {
    for (i, &b) in buf.iter().enumerate() {
        if b != b'\n' {
            continue;
        }
        match buf.get(i + 1) {
            Some(b'\n') => return Some((i, i + 2)),
            Some(b'\r') if buf.get(i + 2) == Some(&b'\n') => return Some((i, i + 3)),
            _ => {}
        }
    }
    None
}

/// One connected control client
pub struct Client {
    stream: Stream,
    peer: String,
    input: Vec<u8>,
    output: Vec<u8>,
}

impl Client {
    pub fn new(stream: Stream, peer: String) -> Client {
        Client {
            stream,
            peer,
            input: Vec::new(),
            output: Vec::new(),
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    pub fn wants_write(&self) -> bool {
        !self.output.is_empty()
    }

    /// Reads whatever is available. Returns `false` once the peer closed
    /// the connection.
    pub fn read_available(&mut self) -> io::Result<bool> {
        let mut buf = [0u8; 4096];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => return Ok(false),
                Ok(n) => {
                    self.input.extend_from_slice(&buf[..n]);
                    // leave the rest in the socket until requests are taken
                    if self.input.len() > MAX_PENDING_INPUT {
                        return Ok(true);
                    }
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => return Ok(true),
                Err(ref e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }

    /// Splits the complete requests off the input buffer. Fails when the
    /// incomplete remainder grew past `MAX_PENDING_INPUT`.
    pub fn take_requests(&mut self) -> io::Result<Vec<String>> {
        let mut requests = Vec::new();
        while let Some((end, next)) = find_terminator(&self.input) {
            let request = String::from_utf8_lossy(&self.input[..end]).trim().to_owned();
            self.input.drain(..next);
            if !request.is_empty() {
                requests.push(request);
            }
        }
        if self.input.len() > MAX_PENDING_INPUT {
            return Err(io::Error::new(ErrorKind::InvalidData, "request too long"));
        }
        Ok(requests)
    }

    /// Appends a message to the output. Fails when the client has left
    /// more than `MAX_PENDING_OUTPUT` unread.
    pub fn queue(&mut self, message: &Value) -> io::Result<()> {
        let message = message.to_string();
        if self.output.len() + message.len() + TERMINATOR.len() > MAX_PENDING_OUTPUT {
            return Err(io::Error::new(ErrorKind::Other, "client is not reading"));
        }
        self.output.extend_from_slice(message.as_bytes());
        self.output.extend_from_slice(TERMINATOR);
        Ok(())
    }

    /// Writes as much pending output as the socket takes.
    pub fn flush(&mut self) -> io::Result<()> {
        while !self.output.is_empty() {
            match self.stream.write(&self.output) {
                Ok(0) => return Err(io::Error::new(ErrorKind::WriteZero, "client gone")),
                Ok(n) => {
                    self.output.drain(..n);
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(ref e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}
