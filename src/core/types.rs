use std::fmt;
use std::str::FromStr;

/// Extracts the nickname part of an IRC origin (`nick!user@host`).
pub fn nick_of(origin: &str) -> &str {
    match origin.find('!') {
        Some(pos) => &origin[..pos],
        None => origin,
    }
}

/// A message sent to a channel or directly to the bot
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct MessageEvent {
    pub server: String,
    pub origin: String,
    pub channel: String,
    pub message: String,
}

/// A message starting with the command character and a plugin name, as seen
/// by that plugin
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CommandEvent {
    pub server: String,
    pub origin: String,
    pub channel: String,
    pub message: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ConnectEvent {
    pub server: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct JoinEvent {
    pub server: String,
    pub origin: String,
    pub channel: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PartEvent {
    pub server: String,
    pub origin: String,
    pub channel: String,
    pub reason: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct KickEvent {
    pub server: String,
    pub origin: String,
    pub channel: String,
    pub target: String,
    pub reason: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct NickEvent {
    pub server: String,
    pub origin: String,
    pub nickname: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ModeEvent {
    pub server: String,
    pub origin: String,
    pub channel: String,
    pub mode: String,
    pub args: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TopicEvent {
    pub server: String,
    pub origin: String,
    pub channel: String,
    pub topic: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct NoticeEvent {
    pub server: String,
    pub origin: String,
    pub channel: String,
    pub message: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct InviteEvent {
    pub server: String,
    pub origin: String,
    pub channel: String,
    pub target: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct NamesEvent {
    pub server: String,
    pub channel: String,
    pub names: Vec<String>,
}

/// Result of a WHOIS query
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct WhoisInfo {
    pub nickname: String,
    pub username: String,
    pub hostname: String,
    pub realname: String,
    pub channels: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct WhoisEvent {
    pub server: String,
    #[serde(flatten)]
    pub whois: WhoisInfo,
}

/// Events produced by the server connections and consumed by the plugins
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "event")]
pub enum IncomingEvent {
    #[serde(rename = "onConnect")]
    Connect(ConnectEvent),
    #[serde(rename = "onMessage")]
    Message(MessageEvent),
    #[serde(rename = "onMe")]
    Me(MessageEvent),
    #[serde(rename = "onNotice")]
    Notice(NoticeEvent),
    #[serde(rename = "onJoin")]
    Join(JoinEvent),
    #[serde(rename = "onPart")]
    Part(PartEvent),
    #[serde(rename = "onKick")]
    Kick(KickEvent),
    #[serde(rename = "onNick")]
    Nick(NickEvent),
    #[serde(rename = "onMode")]
    Mode(ModeEvent),
    #[serde(rename = "onTopic")]
    Topic(TopicEvent),
    #[serde(rename = "onInvite")]
    Invite(InviteEvent),
    #[serde(rename = "onNames")]
    Names(NamesEvent),
    #[serde(rename = "onWhois")]
    Whois(WhoisEvent),
}

impl IncomingEvent {
    pub fn kind(&self) -> EventKind {
        match *self {
            IncomingEvent::Connect(_) => EventKind::Connect,
            IncomingEvent::Message(_) => EventKind::Message,
            IncomingEvent::Me(_) => EventKind::Me,
            IncomingEvent::Notice(_) => EventKind::Notice,
            IncomingEvent::Join(_) => EventKind::Join,
            IncomingEvent::Part(_) => EventKind::Part,
            IncomingEvent::Kick(_) => EventKind::Kick,
            IncomingEvent::Nick(_) => EventKind::Nick,
            IncomingEvent::Mode(_) => EventKind::Mode,
            IncomingEvent::Topic(_) => EventKind::Topic,
            IncomingEvent::Invite(_) => EventKind::Invite,
            IncomingEvent::Names(_) => EventKind::Names,
            IncomingEvent::Whois(_) => EventKind::Whois,
        }
    }

    pub fn server(&self) -> &str {
        match *self {
            IncomingEvent::Connect(ref ev) => &ev.server,
            IncomingEvent::Message(ref ev) | IncomingEvent::Me(ref ev) => &ev.server,
            IncomingEvent::Notice(ref ev) => &ev.server,
            IncomingEvent::Join(ref ev) => &ev.server,
            IncomingEvent::Part(ref ev) => &ev.server,
            IncomingEvent::Kick(ref ev) => &ev.server,
            IncomingEvent::Nick(ref ev) => &ev.server,
            IncomingEvent::Mode(ref ev) => &ev.server,
            IncomingEvent::Topic(ref ev) => &ev.server,
            IncomingEvent::Invite(ref ev) => &ev.server,
            IncomingEvent::Names(ref ev) => &ev.server,
            IncomingEvent::Whois(ref ev) => &ev.server,
        }
    }

    /// The channel the event happened on, empty for connection level events
    pub fn channel(&self) -> &str {
        match *self {
            IncomingEvent::Message(ref ev) | IncomingEvent::Me(ref ev) => &ev.channel,
            IncomingEvent::Notice(ref ev) => &ev.channel,
            IncomingEvent::Join(ref ev) => &ev.channel,
            IncomingEvent::Part(ref ev) => &ev.channel,
            IncomingEvent::Kick(ref ev) => &ev.channel,
            IncomingEvent::Mode(ref ev) => &ev.channel,
            IncomingEvent::Topic(ref ev) => &ev.channel,
            IncomingEvent::Invite(ref ev) => &ev.channel,
            IncomingEvent::Names(ref ev) => &ev.channel,
            IncomingEvent::Connect(_) | IncomingEvent::Nick(_) | IncomingEvent::Whois(_) => "",
        }
    }

    /// The nickname of whoever caused the event, empty when there is none
    pub fn nickname(&self) -> &str {
        let origin = match *self {
            IncomingEvent::Message(ref ev) | IncomingEvent::Me(ref ev) => &ev.origin,
            IncomingEvent::Notice(ref ev) => &ev.origin,
            IncomingEvent::Join(ref ev) => &ev.origin,
            IncomingEvent::Part(ref ev) => &ev.origin,
            IncomingEvent::Kick(ref ev) => &ev.origin,
            IncomingEvent::Nick(ref ev) => &ev.origin,
            IncomingEvent::Mode(ref ev) => &ev.origin,
            IncomingEvent::Topic(ref ev) => &ev.origin,
            IncomingEvent::Invite(ref ev) => &ev.origin,
            IncomingEvent::Whois(ref ev) => &ev.whois.nickname,
            IncomingEvent::Connect(_) | IncomingEvent::Names(_) => "",
        };
        nick_of(origin)
    }
}

/// Enum representing the hooks an event can be delivered to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    Command,
    Connect,
    Invite,
    Join,
    Kick,
    Me,
    Message,
    Mode,
    Names,
    Nick,
    Notice,
    Part,
    Topic,
    Whois,
}

impl EventKind {
    pub const ALL: [EventKind; 14] = [
        EventKind::Command,
        EventKind::Connect,
        EventKind::Invite,
        EventKind::Join,
        EventKind::Kick,
        EventKind::Me,
        EventKind::Message,
        EventKind::Mode,
        EventKind::Names,
        EventKind::Nick,
        EventKind::Notice,
        EventKind::Part,
        EventKind::Topic,
        EventKind::Whois,
    ];

    pub fn as_str(&self) -> &'static str {
        match *self {
            EventKind::Command => "onCommand",
            EventKind::Connect => "onConnect",
            EventKind::Invite => "onInvite",
            EventKind::Join => "onJoin",
            EventKind::Kick => "onKick",
            EventKind::Me => "onMe",
            EventKind::Message => "onMessage",
            EventKind::Mode => "onMode",
            EventKind::Names => "onNames",
            EventKind::Nick => "onNick",
            EventKind::Notice => "onNotice",
            EventKind::Part => "onPart",
            EventKind::Topic => "onTopic",
            EventKind::Whois => "onWhois",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<EventKind, String> {
        EventKind::ALL
            .iter()
            .find(|kind| kind.as_str() == s)
            .cloned()
            .ok_or_else(|| format!("unknown event {}", s))
    }
}
