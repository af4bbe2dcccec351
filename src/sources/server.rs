//! One managed connection to a chat server.
//!
//! Each connection has two threads: the state machine, which spends most of
//! its life inside the session's blocking run call, and the command worker,
//! which drains the connection's `CommandQueue`. Other threads only enqueue
//! commands or read a snapshot of `ServerStatus`.

use crate::core::*;
use crate::sources::{
    ChatSession, CommandQueue, DrainOutcome, Identity, QueuedCommand, ServerInfo,
    SessionFactory, SessionHandler, SessionWriter,
};
use parking_lot::Mutex;
use std::net::ToSocketAddrs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// How long the command worker waits before retrying a rejected command
const RETRY_INTERVAL: Duration = Duration::from_millis(250);
/// Sleep granularity while waiting to reconnect
const WAIT_TICK: Duration = Duration::from_millis(100);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerState {
    Uninitialized,
    Connecting,
    Running,
    Disconnected,
    Waiting,
    Dead,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelEntry {
    pub name: String,
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
}

impl ChannelEntry {
    pub fn new(name: impl Into<String>, password: Option<String>) -> ChannelEntry {
        ChannelEntry {
            name: name.into(),
            password,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    /// Delay between attempts, in seconds
    pub delay: u64,
    /// Attempts before giving up, 0 means forever
    pub max_retries: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> ReconnectPolicy {
        ReconnectPolicy {
            enabled: true,
            delay: 30,
            max_retries: 0,
        }
    }
}

/// Mutable part of a connection
#[derive(Clone, Debug, Serialize)]
pub struct ServerStatus {
    pub state: ServerState,
    pub identity: Identity,
    pub channels: Vec<ChannelEntry>,
    pub reconnect: ReconnectPolicy,
    pub retries: u32,
}

impl ServerStatus {
    pub fn add_channel(&mut self, channel: ChannelEntry) {
        match self.channels.iter_mut().find(|c| c.name == channel.name) {
            Some(existing) => existing.password = channel.password,
            None => self.channels.push(channel),
        }
    }

    pub fn remove_channel(&mut self, name: &str) {
        self.channels.retain(|c| !c.name.eq_ignore_ascii_case(name));
    }

    #[cfg(test)]
    pub fn for_tests() -> ServerStatus {
        ServerStatus {
            state: ServerState::Uninitialized,
            identity: Identity {
                nickname: "bot".to_owned(),
                username: "bot".to_owned(),
                realname: "bot".to_owned(),
            },
            channels: Vec::new(),
            reconnect: ReconnectPolicy::default(),
            retries: 0,
        }
    }
}

pub struct Server {
    name: String,
    info: ServerInfo,
    pub(crate) status: Mutex<ServerStatus>,
    queue: CommandQueue,
    writer: Mutex<Option<Arc<dyn SessionWriter>>>,
    stop: AtomicBool,
    reconnect_now: AtomicBool,
}

impl Server {
    pub fn new(
        name: impl Into<String>,
        info: ServerInfo,
        identity: Identity,
        channels: Vec<ChannelEntry>,
        reconnect: ReconnectPolicy,
    ) -> Server {
        Server {
            name: name.into(),
            info,
            status: Mutex::new(ServerStatus {
                state: ServerState::Uninitialized,
                identity,
                channels,
                reconnect,
                retries: 0,
            }),
            queue: CommandQueue::new(),
            writer: Mutex::new(None),
            stop: AtomicBool::new(false),
            reconnect_now: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn info(&self) -> &ServerInfo {
        &self.info
    }

    pub fn snapshot(&self) -> ServerStatus {
        self.status.lock().clone()
    }

    pub fn state(&self) -> ServerState {
        self.status.lock().state
    }

    pub fn nickname(&self) -> String {
        self.status.lock().identity.nickname.clone()
    }

    pub fn queue(&self) -> &CommandQueue {
        &self.queue
    }

    pub fn enqueue(&self, command: QueuedCommand) {
        debug!("{}: queued {}", self.name, command.label());
        self.queue.enqueue(command);
    }

    pub fn writer(&self) -> Option<Arc<dyn SessionWriter>> {
        self.writer.lock().clone()
    }

    fn set_writer(&self, writer: Option<Arc<dyn SessionWriter>>) {
        *self.writer.lock() = writer;
    }

    fn is_self(&self, nickname: &str) -> bool {
        self.status
            .lock()
            .identity
            .nickname
            .eq_ignore_ascii_case(nickname)
    }

    /// Asks the connection to stop for good: pending commands are dropped
    /// and the current session is closed. Both workers exit on their own.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.queue.clear();
        self.queue.stop();
        if let Some(writer) = self.writer() {
            writer.close();
        }
    }

    pub fn is_stopping(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Drops the current session and connects again right away, even when
    /// automatic reconnection is disabled.
    pub fn reconnect(&self) {
        self.reconnect_now.store(true, Ordering::SeqCst);
        if let Some(writer) = self.writer() {
            writer.close();
        }
    }
}

/// Drains the command queue of a server until the queue is stopped.
pub fn run_command_worker(server: Arc<Server>) {
    let mut retry = None;
    while server.queue.wait_for_work(retry) {
        let writer = server.writer();
        retry = match server.queue.drain_one(writer.as_deref(), &server.status) {
            DrainOutcome::Rejected => Some(RETRY_INTERVAL),
            DrainOutcome::Sent | DrainOutcome::Empty => None,
        };
    }
    debug!("{}: command worker exiting", server.name);
}

/// Lifecycle driver of one connection
pub struct ServerMachine {
    server: Arc<Server>,
    factory: Arc<dyn SessionFactory>,
    events: Arc<EventQueue>,
    running: Arc<AtomicBool>,
    session: Option<Box<dyn ChatSession>>,
}

impl ServerMachine {
    pub fn new(
        server: Arc<Server>,
        factory: Arc<dyn SessionFactory>,
        events: Arc<EventQueue>,
        running: Arc<AtomicBool>,
    ) -> ServerMachine {
        ServerMachine {
            server,
            factory,
            events,
            running,
            session: None,
        }
    }

    /// Runs the machine until the connection is dead.
    pub fn run(mut self) {
        while self.step() != ServerState::Dead {}
        self.server.queue.stop();
        info!("{}: connection is dead", self.server.name);
    }

    /// Performs the work of the current state and moves to the next one.
    pub fn step(&mut self) -> ServerState {
        let current = self.server.state();
        let next = match current {
            ServerState::Uninitialized => ServerState::Connecting,
            ServerState::Connecting => self.connect(),
            ServerState::Running => self.run_session(),
            ServerState::Disconnected => self.disconnected(),
            ServerState::Waiting => self.wait(),
            ServerState::Dead => ServerState::Dead,
        };
        if next != current {
            trace!("{}: {:?} -> {:?}", self.server.name, current, next);
        }
        self.server.status.lock().state = next;
        next
    }

    fn should_stop(&self) -> bool {
        !self.running.load(Ordering::SeqCst) || self.server.is_stopping()
    }

    fn connect(&mut self) -> ServerState {
        let name = &self.server.name;
        let info = &self.server.info;

        match (info.host.as_str(), info.port).to_socket_addrs() {
            Ok(addrs) => {
                let addrs: Vec<_> = addrs.collect();
                debug!("{}: {} resolves to {:?}", name, info.host, addrs);
            }
            Err(e) => warn!("{}: could not resolve {}: {}", name, info.host, e),
        }

        let identity = self.server.status.lock().identity.clone();
        let opened = self.factory.create(info).and_then(|mut session| {
            session.open(&identity)?;
            Ok(session)
        });
        match opened {
            Ok(session) => {
                info!("{}: connecting to {}:{}", name, info.host, info.port);
                self.server.set_writer(session.writer());
                // a stop during open found no writer to close
                if self.should_stop() {
                    if let Some(writer) = session.writer() {
                        writer.close();
                    }
                }
                self.session = Some(session);
            }
            Err(e) => warn!("{}: unable to connect: {}", name, e),
        }
        ServerState::Running
    }

    fn run_session(&mut self) -> ServerState {
        if self.should_stop() {
            self.session = None;
        }
        if let Some(mut session) = self.session.take() {
            let mut handler = ServerHandler {
                server: &self.server,
                events: &self.events,
                writer: session.writer(),
            };
            match session.run(&mut handler) {
                Ok(()) => info!("{}: disconnected", self.server.name),
                Err(e) => warn!("{}: connection lost: {}", self.server.name, e),
            }
        }
        if let Some(writer) = self.server.writer.lock().take() {
            writer.close();
        }
        ServerState::Disconnected
    }

    fn disconnected(&mut self) -> ServerState {
        if self.should_stop() {
            return ServerState::Dead;
        }
        if self.server.reconnect_now.load(Ordering::SeqCst) {
            return ServerState::Waiting;
        }
        if !self.server.status.lock().reconnect.enabled {
            info!("{}: reconnection disabled, giving up", self.server.name);
            return ServerState::Dead;
        }
        info!("{}: disconnected", self.server.name);
        ServerState::Waiting
    }

    fn wait(&mut self) -> ServerState {
        let name = &self.server.name;
        if self.server.reconnect_now.swap(false, Ordering::SeqCst) {
            self.server.status.lock().retries = 0;
            return ServerState::Connecting;
        }

        let (policy, retries) = {
            let status = self.server.status.lock();
            (status.reconnect.clone(), status.retries)
        };
        if policy.max_retries > 0 && retries >= policy.max_retries {
            warn!("{}: giving up after {} attempts", name, retries);
            return ServerState::Dead;
        }

        info!("{}: retrying in {} seconds", name, policy.delay);
        let deadline = Instant::now() + Duration::from_secs(policy.delay);
        loop {
            if self.should_stop() {
                return ServerState::Dead;
            }
            if self.server.reconnect_now.swap(false, Ordering::SeqCst) {
                self.server.status.lock().retries = 0;
                return ServerState::Connecting;
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep(WAIT_TICK.min(deadline - now));
        }

        self.server.status.lock().retries += 1;
        ServerState::Connecting
    }
}

/// Turns session callbacks into events for the plugins
struct ServerHandler<'a> {
    server: &'a Server,
    events: &'a EventQueue,
    writer: Option<Arc<dyn SessionWriter>>,
}

impl<'a> ServerHandler<'a> {
    fn name(&self) -> String {
        self.server.name.clone()
    }

    /// Private messages are attributed to the sender so that replies reach
    /// them.
    fn reply_target(&self, origin: &str, target: &str) -> String {
        if self.server.is_self(target) {
            nick_of(origin).to_owned()
        } else {
            target.to_owned()
        }
    }
}

impl<'a> SessionHandler for ServerHandler<'a> {
    fn on_connect(&mut self) {
        let channels = {
            let mut status = self.server.status.lock();
            status.retries = 0;
            status.channels.clone()
        };
        info!("{}: connection complete", self.server.name);

        if let Some(ref writer) = self.writer {
            for channel in channels {
                match writer.join(&channel.name, channel.password.as_deref()) {
                    Ok(true) => debug!("{}: rejoining {}", self.server.name, channel.name),
                    Ok(false) => warn!("{}: could not rejoin {}", self.server.name, channel.name),
                    Err(e) => warn!("{}: could not rejoin {}: {}", self.server.name, channel.name, e),
                }
            }
        }

        self.events.add(IncomingEvent::Connect(ConnectEvent {
            server: self.name(),
        }));
    }

    fn on_message(&mut self, origin: &str, target: &str, message: &str) {
        self.events.add(IncomingEvent::Message(MessageEvent {
            server: self.name(),
            origin: origin.to_owned(),
            channel: self.reply_target(origin, target),
            message: message.to_owned(),
        }));
    }

    fn on_me(&mut self, origin: &str, target: &str, message: &str) {
        self.events.add(IncomingEvent::Me(MessageEvent {
            server: self.name(),
            origin: origin.to_owned(),
            channel: self.reply_target(origin, target),
            message: message.to_owned(),
        }));
    }

    fn on_notice(&mut self, origin: &str, target: &str, message: &str) {
        self.events.add(IncomingEvent::Notice(NoticeEvent {
            server: self.name(),
            origin: origin.to_owned(),
            channel: target.to_owned(),
            message: message.to_owned(),
        }));
    }

    fn on_join(&mut self, origin: &str, channel: &str) {
        self.events.add(IncomingEvent::Join(JoinEvent {
            server: self.name(),
            origin: origin.to_owned(),
            channel: channel.to_owned(),
        }));
    }

    fn on_part(&mut self, origin: &str, channel: &str, reason: &str) {
        if self.server.is_self(nick_of(origin)) {
            self.server.status.lock().remove_channel(channel);
        }
        self.events.add(IncomingEvent::Part(PartEvent {
            server: self.name(),
            origin: origin.to_owned(),
            channel: channel.to_owned(),
            reason: reason.to_owned(),
        }));
    }

    fn on_kick(&mut self, origin: &str, channel: &str, target: &str, reason: &str) {
        if self.server.is_self(target) {
            info!("{}: kicked from {} by {}", self.server.name, channel, nick_of(origin));
            self.server.status.lock().remove_channel(channel);
        }
        self.events.add(IncomingEvent::Kick(KickEvent {
            server: self.name(),
            origin: origin.to_owned(),
            channel: channel.to_owned(),
            target: target.to_owned(),
            reason: reason.to_owned(),
        }));
    }

    fn on_nick(&mut self, origin: &str, nickname: &str) {
        if self.server.is_self(nick_of(origin)) {
            self.server.status.lock().identity.nickname = nickname.to_owned();
        }
        self.events.add(IncomingEvent::Nick(NickEvent {
            server: self.name(),
            origin: origin.to_owned(),
            nickname: nickname.to_owned(),
        }));
    }

    fn on_mode(&mut self, origin: &str, target: &str, mode: &str, args: &[String]) {
        self.events.add(IncomingEvent::Mode(ModeEvent {
            server: self.name(),
            origin: origin.to_owned(),
            channel: target.to_owned(),
            mode: mode.to_owned(),
            args: args.to_vec(),
        }));
    }

    fn on_topic(&mut self, origin: &str, channel: &str, topic: &str) {
        self.events.add(IncomingEvent::Topic(TopicEvent {
            server: self.name(),
            origin: origin.to_owned(),
            channel: channel.to_owned(),
            topic: topic.to_owned(),
        }));
    }

    fn on_invite(&mut self, origin: &str, channel: &str, target: &str) {
        self.events.add(IncomingEvent::Invite(InviteEvent {
            server: self.name(),
            origin: origin.to_owned(),
            channel: channel.to_owned(),
            target: target.to_owned(),
        }));
    }

    fn on_names(&mut self, channel: &str, names: &[String]) {
        self.events.add(IncomingEvent::Names(NamesEvent {
            server: self.name(),
            channel: channel.to_owned(),
            names: names.to_vec(),
        }));
    }

    fn on_whois(&mut self, whois: &WhoisInfo) {
        self.events.add(IncomingEvent::Whois(WhoisEvent {
            server: self.name(),
            whois: whois.clone(),
        }));
    }
}
