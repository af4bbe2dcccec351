//! A small blocking IRC session over plain TCP.
//!
//! Only the part of the protocol the bot needs is understood: registration,
//! keepalive, and the messages that become events. Everything else is
//! ignored.

use crate::core::{decode_line, nick_of, WhoisInfo};
use crate::sources::*;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::{self, BufRead, BufReader, ErrorKind, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// A parsed protocol line. Message tags are skipped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IrcMessage {
    pub prefix: Option<String>,
    pub command: String,
    pub params: Vec<String>,
}

impl IrcMessage {
    pub fn parse(line: &str) -> Option<IrcMessage> {
        let mut rest = line.trim_end_matches(|c| c == '\r' || c == '\n');
        if rest.starts_with('@') {
            let end = rest.find(' ')?;
            rest = rest[end + 1..].trim_start_matches(' ');
        }

        let prefix = if let Some(stripped) = rest.strip_prefix(':') {
            let end = stripped.find(' ')?;
            let prefix = stripped[..end].to_owned();
            rest = stripped[end + 1..].trim_start_matches(' ');
            Some(prefix)
        } else {
            None
        };

        let (command, mut rest) = match rest.find(' ') {
            Some(space) => (&rest[..space], &rest[space + 1..]),
            None => (rest, ""),
        };
        if command.is_empty() {
            return None;
        }

        let mut params = Vec::new();
        while !rest.is_empty() {
            if let Some(trailing) = rest.strip_prefix(':') {
                params.push(trailing.to_owned());
                break;
            }
            match rest.find(' ') {
                Some(space) => {
                    if space > 0 {
                        params.push(rest[..space].to_owned());
                    }
                    rest = &rest[space + 1..];
                }
                None => {
                    params.push(rest.to_owned());
                    break;
                }
            }
        }

        Some(IrcMessage {
            prefix,
            command: command.to_ascii_uppercase(),
            params,
        })
    }

    /// Parameter `index`, or an empty string when absent.
    pub fn param(&self, index: usize) -> &str {
        self.params.get(index).map(String::as_str).unwrap_or("")
    }

    pub fn origin(&self) -> &str {
        self.prefix.as_deref().unwrap_or("")
    }
}

/// Splits the body of a CTCP ACTION, if the text is one.
fn ctcp_action(text: &str) -> Option<&str> {
    let inner = text.strip_prefix('\x01')?;
    let inner = inner.strip_suffix('\x01').unwrap_or(inner);
    inner.strip_prefix("ACTION").map(|body| body.trim_start_matches(' '))
}

/// Writing half of a connection
pub struct IrcWriter {
    stream: Mutex<TcpStream>,
    control: TcpStream,
    closed: AtomicBool,
}

impl IrcWriter {
    fn new(stream: &TcpStream) -> io::Result<IrcWriter> {
        Ok(IrcWriter {
            stream: Mutex::new(stream.try_clone()?),
            control: stream.try_clone()?,
            closed: AtomicBool::new(false),
        })
    }
}

impl SessionWriter for IrcWriter {
    fn raw(&self, line: &[u8]) -> SessionResult<bool> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SessionError::NotConnected);
        }
        let mut buf = Vec::with_capacity(line.len() + 2);
        buf.extend(line.iter().filter(|&&b| b != b'\r' && b != b'\n'));
        buf.extend_from_slice(b"\r\n");

        // a line that started going out is always finished
        let mut stream = self.stream.lock();
        let mut written = 0;
        while written < buf.len() {
            match stream.write(&buf[written..]) {
                Ok(0) => return Err(io::Error::from(ErrorKind::WriteZero).into()),
                Ok(n) => written += n,
                Err(ref e) if e.kind() == ErrorKind::Interrupted => {}
                Err(ref e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                    if written == 0 {
                        return Ok(false);
                    }
                    if self.closed.load(Ordering::SeqCst) {
                        return Err(SessionError::NotConnected);
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(true)
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.control.shutdown(Shutdown::Both);
        }
    }
}

pub struct IrcSession {
    info: ServerInfo,
    reader: Option<BufReader<TcpStream>>,
    writer: Option<Arc<IrcWriter>>,
    /// Nickname asked for at registration
    requested: String,
    nickname: String,
    registered: bool,
    names: HashMap<String, Vec<String>>,
    whois: HashMap<String, WhoisInfo>,
}

impl IrcSession {
    pub fn new(info: ServerInfo) -> IrcSession {
        IrcSession {
            info,
            reader: None,
            writer: None,
            requested: String::new(),
            nickname: String::new(),
            registered: false,
            names: HashMap::new(),
            whois: HashMap::new(),
        }
    }

    fn connect(&self) -> io::Result<TcpStream> {
        let mut last_error = None;
        for addr in (self.info.host.as_str(), self.info.port).to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT) {
                Ok(stream) => return Ok(stream),
                Err(e) => last_error = Some(e),
            }
        }
        Err(last_error.unwrap_or_else(|| {
            io::Error::new(ErrorKind::NotFound, "host resolved to no address")
        }))
    }

    fn send(&self, line: &str) -> SessionResult<bool> {
        match self.writer {
            Some(ref writer) => writer.send_line(line),
            None => Err(SessionError::NotConnected),
        }
    }

    fn handle(&mut self, msg: IrcMessage, handler: &mut dyn SessionHandler) -> SessionResult<()> {
        let origin = msg.origin();
        match msg.command.as_str() {
            "PING" => {
                if !self.send(&format!("PONG :{}", msg.param(0)))? {
                    warn!("{}: could not answer PING, output is stuck", self.info.host);
                }
            }
            "001" => {
                self.registered = true;
                let nickname = msg.param(0).to_owned();
                if !nickname.is_empty() && nickname != self.requested {
                    handler.on_nick(&self.requested, &nickname);
                }
                if !nickname.is_empty() {
                    self.nickname = nickname;
                }
                handler.on_connect();
            }
            "433" if !self.registered => {
                self.nickname.push('_');
                debug!("{}: nickname in use, trying {}", self.info.host, self.nickname);
                self.send(&format!("NICK {}", self.nickname))?;
            }
            "PRIVMSG" => match ctcp_action(msg.param(1)) {
                Some(action) => handler.on_me(origin, msg.param(0), action),
                None if msg.param(1).starts_with('\x01') => {}
                None => handler.on_message(origin, msg.param(0), msg.param(1)),
            },
            "NOTICE" => handler.on_notice(origin, msg.param(0), msg.param(1)),
            "JOIN" => handler.on_join(origin, msg.param(0)),
            "PART" => handler.on_part(origin, msg.param(0), msg.param(1)),
            "KICK" => handler.on_kick(origin, msg.param(0), msg.param(1), msg.param(2)),
            "NICK" => {
                if nick_of(origin) == self.nickname {
                    self.nickname = msg.param(0).to_owned();
                }
                handler.on_nick(origin, msg.param(0));
            }
            "MODE" if msg.params.len() >= 2 => {
                handler.on_mode(origin, msg.param(0), msg.param(1), &msg.params[2..])
            }
            "TOPIC" => handler.on_topic(origin, msg.param(0), msg.param(1)),
            "INVITE" => handler.on_invite(origin, msg.param(1), msg.param(0)),
            // RPL_NAMREPLY: <me> <type> <channel> :<names>
            "353" => {
                let names = self.names.entry(msg.param(2).to_owned()).or_default();
                names.extend(
                    msg.param(3)
                        .split(' ')
                        .filter(|n| !n.is_empty())
                        .map(|n| n.trim_start_matches(|c| "~&@%+".contains(c)).to_owned()),
                );
            }
            // RPL_ENDOFNAMES
            "366" => {
                let names = self.names.remove(msg.param(1)).unwrap_or_default();
                handler.on_names(msg.param(1), &names);
            }
            // RPL_WHOISUSER: <me> <nick> <user> <host> * :<realname>
            "311" => {
                let entry = self.whois.entry(msg.param(1).to_owned()).or_default();
                entry.nickname = msg.param(1).to_owned();
                entry.username = msg.param(2).to_owned();
                entry.hostname = msg.param(3).to_owned();
                entry.realname = msg.param(5).to_owned();
            }
            // RPL_WHOISCHANNELS
            "319" => {
                let entry = self.whois.entry(msg.param(1).to_owned()).or_default();
                entry.channels.extend(
                    msg.param(2)
                        .split(' ')
                        .filter(|c| !c.is_empty())
                        .map(|c| c.trim_start_matches(|p| "~&@%+".contains(p)).to_owned()),
                );
            }
            // RPL_ENDOFWHOIS
            "318" => {
                if let Some(mut entry) = self.whois.remove(msg.param(1)) {
                    if entry.nickname.is_empty() {
                        entry.nickname = msg.param(1).to_owned();
                    }
                    handler.on_whois(&entry);
                }
            }
            "ERROR" => {
                warn!("{}: server error: {}", self.info.host, msg.param(0));
            }
            _ => {}
        }
        Ok(())
    }
}

impl ChatSession for IrcSession {
    fn open(&mut self, identity: &Identity) -> SessionResult<()> {
        let stream = self.connect()?;
        stream.set_write_timeout(Some(WRITE_TIMEOUT))?;
        let writer = Arc::new(IrcWriter::new(&stream)?);
        self.reader = Some(BufReader::new(stream));
        self.writer = Some(writer);
        self.requested = identity.nickname.clone();
        self.nickname = identity.nickname.clone();
        self.registered = false;

        if let Some(ref password) = self.info.password {
            self.send(&format!("PASS {}", password))?;
        }
        self.send(&format!("NICK {}", identity.nickname))?;
        self.send(&format!("USER {} 0 * :{}", identity.username, identity.realname))?;
        Ok(())
    }

    fn writer(&self) -> Option<Arc<dyn SessionWriter>> {
        self.writer
            .clone()
            .map(|writer| writer as Arc<dyn SessionWriter>)
    }

    fn run(&mut self, handler: &mut dyn SessionHandler) -> SessionResult<()> {
        let mut reader = self.reader.take().ok_or(SessionError::NotConnected)?;
        let mut buf = Vec::new();
        loop {
            buf.clear();
            if reader.read_until(b'\n', &mut buf)? == 0 {
                return Err(SessionError::Closed);
            }
            let line = decode_line(&buf);
            match IrcMessage::parse(&line) {
                Some(msg) => self.handle(msg, handler)?,
                None => debug!("{}: ignoring {:?}", self.info.host, line),
            }
        }
    }
}

/// Creates plain TCP IRC sessions
#[derive(Default)]
pub struct IrcSessionFactory;

impl SessionFactory for IrcSessionFactory {
    fn create(&self, info: &ServerInfo) -> SessionResult<Box<dyn ChatSession>> {
        if info.ssl {
            return Err(SessionError::Unsupported("SSL connections".to_owned()));
        }
        Ok(Box::new(IrcSession::new(info.clone())))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::net::TcpListener;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn parse_full_line() {
        let msg = IrcMessage::parse(":jean!j@host PRIVMSG #rust :hello there\r\n").unwrap();
        assert_eq!(msg.prefix.as_deref(), Some("jean!j@host"));
        assert_eq!(msg.command, "PRIVMSG");
        assert_eq!(msg.params, vec!["#rust", "hello there"]);
    }

    #[test]
    fn parse_without_prefix_and_with_tags() {
        let msg = IrcMessage::parse("PING :irc.example.org").unwrap();
        assert_eq!(msg.prefix, None);
        assert_eq!(msg.params, vec!["irc.example.org"]);

        let msg = IrcMessage::parse("@time=2020-01-01T00:00:00Z :srv 001 bot :Welcome").unwrap();
        assert_eq!(msg.prefix.as_deref(), Some("srv"));
        assert_eq!(msg.command, "001");
        assert_eq!(msg.param(0), "bot");
        assert_eq!(msg.param(5), "");
    }

    #[test]
    fn parse_rejects_garbage() {
        assert_eq!(IrcMessage::parse(""), None);
        assert_eq!(IrcMessage::parse(":prefixonly"), None);
    }

    #[test]
    fn ctcp_actions() {
        assert_eq!(ctcp_action("\x01ACTION waves\x01"), Some("waves"));
        assert_eq!(ctcp_action("\x01ACTION waves"), Some("waves"));
        assert_eq!(ctcp_action("\x01VERSION\x01"), None);
        assert_eq!(ctcp_action("hello"), None);
    }

    #[test]
    fn ssl_is_rejected() {
        let info = ServerInfo {
            host: "localhost".to_owned(),
            port: 6697,
            password: None,
            ssl: true,
            ssl_verify: true,
        };
        assert!(IrcSessionFactory.create(&info).is_err());
    }

    #[test]
    fn stalled_peer_never_sees_a_broken_line() {
        const LINE: usize = 60_000;
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let stream = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (mut peer, _) = listener.accept().unwrap();
        stream.set_write_timeout(Some(Duration::from_millis(50))).unwrap();
        let writer = IrcWriter::new(&stream).unwrap();
        let line = vec![b'a'; LINE];

        // the peer only starts reading once our buffers are long full
        let reader = thread::spawn(move || {
            thread::sleep(Duration::from_millis(500));
            let mut received = Vec::new();
            io::Read::read_to_end(&mut peer, &mut received).unwrap();
            received
        });

        let mut accepted = 0;
        let mut stalled = false;
        let mut after_stall = 0;
        while after_stall < 3 {
            let start = Instant::now();
            if writer.raw(&line).unwrap() {
                accepted += 1;
                if stalled {
                    after_stall += 1;
                }
            }
            if start.elapsed() >= Duration::from_millis(40) {
                stalled = true;
            }
            assert!(accepted < 10_000, "peer buffers never filled up");
        }
        writer.close();
        drop(stream);

        let received = reader.join().unwrap();
        let lines: Vec<&[u8]> = received
            .split(|&b| b == b'\n')
            .filter(|l| !l.is_empty())
            .collect();
        assert_eq!(lines.len(), accepted);
        assert!(lines.iter().all(|l| l.len() == LINE + 1 && l.ends_with(b"\r")));
    }

    #[derive(Default)]
    struct Recorder {
        seen: Vec<String>,
    }

    impl SessionHandler for Recorder {
        fn on_connect(&mut self) {
            self.seen.push("connect".to_owned());
        }
        fn on_message(&mut self, origin: &str, target: &str, message: &str) {
            self.seen.push(format!("message {} {} {}", origin, target, message));
        }
        fn on_me(&mut self, origin: &str, target: &str, message: &str) {
            self.seen.push(format!("me {} {} {}", origin, target, message));
        }
        fn on_notice(&mut self, _: &str, _: &str, _: &str) {}
        fn on_join(&mut self, origin: &str, channel: &str) {
            self.seen.push(format!("join {} {}", origin, channel));
        }
        fn on_part(&mut self, _: &str, _: &str, _: &str) {}
        fn on_kick(&mut self, origin: &str, channel: &str, target: &str, reason: &str) {
            self.seen.push(format!("kick {} {} {} {}", origin, channel, target, reason));
        }
        fn on_nick(&mut self, origin: &str, nickname: &str) {
            self.seen.push(format!("nick {} {}", origin, nickname));
        }
        fn on_mode(&mut self, _: &str, target: &str, mode: &str, args: &[String]) {
            self.seen.push(format!("mode {} {} {}", target, mode, args.join(",")));
        }
        fn on_topic(&mut self, _: &str, _: &str, _: &str) {}
        fn on_invite(&mut self, _: &str, channel: &str, target: &str) {
            self.seen.push(format!("invite {} {}", channel, target));
        }
        fn on_names(&mut self, channel: &str, names: &[String]) {
            self.seen.push(format!("names {} {}", channel, names.join(",")));
        }
        fn on_whois(&mut self, whois: &WhoisInfo) {
            self.seen.push(format!(
                "whois {} {} {}",
                whois.nickname,
                whois.realname,
                whois.channels.join(",")
            ));
        }
    }

    #[test]
    fn session_against_local_server() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut out = stream;
            let mut received = Vec::new();
            let mut read_line = |received: &mut Vec<String>| {
                let mut line = String::new();
                reader.read_line(&mut line).unwrap();
                received.push(line.trim_end().to_owned());
            };
            for _ in 0..3 {
                read_line(&mut received);
            }
            out.write_all(b":srv 433 * bot :Nickname is already in use\r\n").unwrap();
            read_line(&mut received);
            let script = [
                ":srv 001 bot_ :Welcome",
                "PING :srv",
                ":jean!j@h PRIVMSG #rust :hello",
                ":jean!j@h PRIVMSG bot_ :\x01ACTION waves\x01",
                ":jean!j@h PRIVMSG bot_ :\x01VERSION\x01",
                ":bot_!b@h JOIN :#rust",
                ":srv 353 bot_ = #rust :@jean +bot_ anne",
                ":srv 366 bot_ #rust :End of /NAMES list.",
                ":jean!j@h MODE #rust +o anne",
                ":jean!j@h KICK #rust anne :behave",
                ":jean!j@h INVITE bot_ #other",
                ":srv 311 bot_ jean j h * :Jean Luc",
                ":srv 319 bot_ jean :@#rust #other",
                ":srv 318 bot_ jean :End of /WHOIS list.",
            ];
            for line in script.iter() {
                out.write_all(line.as_bytes()).unwrap();
                out.write_all(b"\r\n").unwrap();
            }
            read_line(&mut received);
            received
        });

        let info = ServerInfo {
            host: "127.0.0.1".to_owned(),
            port,
            password: Some("secret".to_owned()),
            ssl: false,
            ssl_verify: true,
        };
        let identity = Identity {
            nickname: "bot".to_owned(),
            username: "botuser".to_owned(),
            realname: "The Bot".to_owned(),
        };
        let mut session = IrcSessionFactory.create(&info).unwrap();
        session.open(&identity).unwrap();
        let mut recorder = Recorder::default();
        match session.run(&mut recorder) {
            Err(SessionError::Closed) => {}
            other => panic!("unexpected {:?}", other),
        }

        let received = server.join().unwrap();
        assert_eq!(
            received,
            vec!["PASS secret", "NICK bot", "USER botuser 0 * :The Bot", "NICK bot_", "PONG :srv"]
        );
        assert_eq!(
            recorder.seen,
            vec![
                "nick bot bot_",
                "connect",
                "message jean!j@h #rust hello",
                "me jean!j@h bot_ waves",
                "join bot_!b@h #rust",
                "names #rust jean,bot_,anne",
                "mode #rust +o anne",
                "kick jean!j@h #rust anne behave",
                "invite #other bot_",
                "whois jean Jean Luc #rust,#other",
            ]
        );
    }
}
