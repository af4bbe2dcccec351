//! Server connections and the session interface they drive.
//!
//! A session wraps one network connection. It reports what happens on the
//! network through a `SessionHandler` and accepts outgoing commands through a
//! shareable `SessionWriter`. The rest of this module (queues, state machine,
//! registry) only talks to sessions through these traits.

use crate::core::WhoisInfo;
use std::io;
use std::sync::Arc;

pub mod command_queue;
pub mod irc;
pub mod registry;
pub mod server;
#[cfg(test)]
pub mod testing;

pub use self::command_queue::{CommandQueue, DrainOutcome, QueuedCommand};
pub use self::irc::IrcSessionFactory;
pub use self::registry::ServerRegistry;
pub use self::server::{ChannelEntry, ReconnectPolicy, Server, ServerMachine, ServerState};

quick_error! {
    #[derive(Debug)]
    pub enum SessionError {
        Io(err: io::Error) {
            from()
            display("I/O error: {}", err)
        }
        NotConnected {
            display("not connected")
        }
        Closed {
            display("connection closed by the server")
        }
        Unsupported(what: String) {
            display("unsupported: {}", what)
        }
    }
}

pub type SessionResult<T> = Result<T, SessionError>;

/// Where and how to connect
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ServerInfo {
    pub host: String,
    pub port: u16,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    pub ssl: bool,
    pub ssl_verify: bool,
}

/// Who the bot is on a network
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Identity {
    pub nickname: String,
    pub username: String,
    pub realname: String,
}

/// Callbacks a session invokes while running, one per event it recognizes.
pub trait SessionHandler {
    /// Registration with the server completed
    fn on_connect(&mut self);
    fn on_message(&mut self, origin: &str, target: &str, message: &str);
    fn on_me(&mut self, origin: &str, target: &str, message: &str);
    fn on_notice(&mut self, origin: &str, target: &str, message: &str);
    fn on_join(&mut self, origin: &str, channel: &str);
    fn on_part(&mut self, origin: &str, channel: &str, reason: &str);
    fn on_kick(&mut self, origin: &str, channel: &str, target: &str, reason: &str);
    fn on_nick(&mut self, origin: &str, nickname: &str);
    fn on_mode(&mut self, origin: &str, target: &str, mode: &str, args: &[String]);
    fn on_topic(&mut self, origin: &str, channel: &str, topic: &str);
    fn on_invite(&mut self, origin: &str, channel: &str, target: &str);
    fn on_names(&mut self, channel: &str, names: &[String]);
    fn on_whois(&mut self, whois: &WhoisInfo);
}

/// Outgoing side of a session. Every operation reports whether the session
/// accepted it right now; `Ok(false)` means "try again later".
///
/// Only `raw` and `close` are required, the IRC commands are formatted on top
/// of `raw`.
pub trait SessionWriter: Send + Sync {
    fn raw(&self, line: &[u8]) -> SessionResult<bool>;

    /// Closes the connection, making a running session return.
    fn close(&self);

    fn join(&self, channel: &str, key: Option<&str>) -> SessionResult<bool> {
        match key {
            Some(key) if !key.is_empty() => self.send_line(&format!("JOIN {} {}", channel, key)),
            _ => self.send_line(&format!("JOIN {}", channel)),
        }
    }

    fn part(&self, channel: &str, reason: Option<&str>) -> SessionResult<bool> {
        match reason {
            Some(reason) if !reason.is_empty() => {
                self.send_line(&format!("PART {} :{}", channel, reason))
            }
            _ => self.send_line(&format!("PART {}", channel)),
        }
    }

    fn message(&self, target: &str, text: &str) -> SessionResult<bool> {
        self.send_line(&format!("PRIVMSG {} :{}", target, text))
    }

    fn me(&self, target: &str, text: &str) -> SessionResult<bool> {
        self.send_line(&format!("PRIVMSG {} :\x01ACTION {}\x01", target, text))
    }

    fn notice(&self, target: &str, text: &str) -> SessionResult<bool> {
        self.send_line(&format!("NOTICE {} :{}", target, text))
    }

    fn kick(&self, target: &str, channel: &str, reason: Option<&str>) -> SessionResult<bool> {
        match reason {
            Some(reason) if !reason.is_empty() => {
                self.send_line(&format!("KICK {} {} :{}", channel, target, reason))
            }
            _ => self.send_line(&format!("KICK {} {}", channel, target)),
        }
    }

    fn invite(&self, target: &str, channel: &str) -> SessionResult<bool> {
        self.send_line(&format!("INVITE {} {}", target, channel))
    }

    fn mode(&self, channel: &str, mode: &str) -> SessionResult<bool> {
        self.send_line(&format!("MODE {} {}", channel, mode))
    }

    fn umode(&self, nickname: &str, mode: &str) -> SessionResult<bool> {
        self.send_line(&format!("MODE {} {}", nickname, mode))
    }

    fn nick(&self, nickname: &str) -> SessionResult<bool> {
        self.send_line(&format!("NICK {}", nickname))
    }

    fn topic(&self, channel: &str, topic: &str) -> SessionResult<bool> {
        self.send_line(&format!("TOPIC {} :{}", channel, topic))
    }

    fn whois(&self, target: &str) -> SessionResult<bool> {
        self.send_line(&format!("WHOIS {}", target))
    }

    fn quit(&self, reason: &str) -> SessionResult<bool> {
        self.send_line(&format!("QUIT :{}", reason))
    }

    fn send_line(&self, line: &str) -> SessionResult<bool> {
        self.raw(line.as_bytes())
    }
}

/// One connection attempt to a server
pub trait ChatSession: Send {
    /// Opens the connection and starts registration.
    fn open(&mut self, identity: &Identity) -> SessionResult<()>;

    /// The writer of an opened session.
    fn writer(&self) -> Option<Arc<dyn SessionWriter>>;

    /// Processes incoming traffic until the connection drops.
    fn run(&mut self, handler: &mut dyn SessionHandler) -> SessionResult<()>;
}

/// Creates a fresh session for every connection attempt
pub trait SessionFactory: Send + Sync {
    fn create(&self, info: &ServerInfo) -> SessionResult<Box<dyn ChatSession>>;
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sources::testing::RecordingWriter;

    #[test]
    fn test_object_safety() {
        // if this compiles, the session traits can be used as trait objects
        let _f = |s: &mut dyn ChatSession, h: &mut dyn SessionHandler| {
            let _ = s.run(h);
        };
        let _g = |w: &dyn SessionWriter| {
            let _ = w.quit("bye");
        };
    }

    #[test]
    fn commands_are_formatted_as_irc_lines() {
        let writer = RecordingWriter::new();
        writer.join("#a", Some("secret")).unwrap();
        writer.join("#b", None).unwrap();
        writer.part("#a", Some("later")).unwrap();
        writer.me("#b", "waves").unwrap();
        writer.kick("jean", "#b", None).unwrap();
        writer.umode("bot", "+i").unwrap();
        assert_eq!(
            writer.lines(),
            vec![
                "JOIN #a secret",
                "JOIN #b",
                "PART #a :later",
                "PRIVMSG #b :\x01ACTION waves\x01",
                "KICK #b jean",
                "MODE bot +i",
            ]
        );
    }
}
