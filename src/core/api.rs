use crate::core::{BotError, BotResult, Encoding, EventKind, RuleEngine};
use crate::sources::{ChannelEntry, QueuedCommand, Server, ServerRegistry, SessionError};
use std::sync::Arc;

/// Handle through which plugins and administrative commands act on servers.
///
/// Every operation becomes a command queued on the target server, so calls
/// return as soon as the command is queued and never block on the network.
#[derive(Clone)]
pub struct BotApi {
    servers: Arc<ServerRegistry>,
    rules: Arc<RuleEngine>,
    plugin: Option<String>,
}

impl BotApi {
    pub fn new(servers: Arc<ServerRegistry>, rules: Arc<RuleEngine>) -> BotApi {
        BotApi {
            servers,
            rules,
            plugin: None,
        }
    }

    /// The same handle acting on behalf of a plugin, which makes outgoing
    /// text follow the encoding rules for that plugin.
    pub fn for_plugin(&self, name: &str) -> BotApi {
        BotApi {
            plugin: Some(name.to_owned()),
            ..self.clone()
        }
    }

    pub fn plugin(&self) -> Option<&str> {
        self.plugin.as_deref()
    }

    pub fn servers(&self) -> &ServerRegistry {
        &self.servers
    }

    pub fn rules(&self) -> &RuleEngine {
        &self.rules
    }

    pub fn server_names(&self) -> Vec<String> {
        self.servers.names()
    }

    fn server(&self, name: &str) -> BotResult<Arc<Server>> {
        self.servers.get(name)
    }

    pub fn nickname(&self, server: &str) -> BotResult<String> {
        Ok(self.server(server)?.nickname())
    }

    fn encoding(&self, server: &str, target: &str) -> Option<Encoding> {
        let plugin = self.plugin.as_ref()?;
        let hint = self
            .rules
            .solve(server, target, "", plugin, EventKind::Message)
            .recode_hint?;
        let encoding = Encoding::from_hint(&hint);
        if encoding.is_none() {
            warn!("plugin {}: unknown encoding {}, using UTF-8", plugin, hint);
        }
        encoding
    }

    /// Queues a text command, converting it to the encoding the rules ask
    /// for when it is not UTF-8.
    fn send_text(&self, server: &str, command: &str, target: &str, text: String) -> BotResult<()> {
        let srv = self.server(server)?;
        let label = format!("{} {}", command, target);
        let target = target.to_owned();
        let queued = match self.encoding(server, &target) {
            Some(Encoding::Latin1) => {
                let line = Encoding::Latin1.encode(&format!("{} {} :{}", command, target, text));
                QueuedCommand::new(label, move |w| w.raw(&line))
            }
            _ => match command {
                "NOTICE" => QueuedCommand::new(label, move |w| w.notice(&target, &text)),
                _ => QueuedCommand::new(label, move |w| w.message(&target, &text)),
            },
        };
        srv.enqueue(queued);
        Ok(())
    }

    pub fn message(&self, server: &str, target: &str, text: &str) -> BotResult<()> {
        self.send_text(server, "PRIVMSG", target, text.to_owned())
    }

    pub fn me(&self, server: &str, target: &str, text: &str) -> BotResult<()> {
        self.send_text(server, "PRIVMSG", target, format!("\x01ACTION {}\x01", text))
    }

    pub fn notice(&self, server: &str, target: &str, text: &str) -> BotResult<()> {
        self.send_text(server, "NOTICE", target, text.to_owned())
    }

    pub fn join(&self, server: &str, channel: &str, password: Option<&str>) -> BotResult<()> {
        let entry = ChannelEntry::new(channel, password.map(str::to_owned));
        let key = entry.password.clone();
        let name = entry.name.clone();
        self.server(server)?.enqueue(
            QueuedCommand::new(format!("join {}", channel), move |w| w.join(&name, key.as_deref()))
                .then(move |status| status.add_channel(entry)),
        );
        Ok(())
    }

    pub fn part(&self, server: &str, channel: &str, reason: Option<&str>) -> BotResult<()> {
        let name = channel.to_owned();
        let reason = reason.map(str::to_owned);
        let removed = name.clone();
        self.server(server)?.enqueue(
            QueuedCommand::new(format!("part {}", channel), move |w| {
                w.part(&name, reason.as_deref())
            })
            .then(move |status| status.remove_channel(&removed)),
        );
        Ok(())
    }

    pub fn kick(&self, server: &str, target: &str, channel: &str, reason: Option<&str>) -> BotResult<()> {
        let (target, channel) = (target.to_owned(), channel.to_owned());
        let reason = reason.map(str::to_owned);
        self.server(server)?.enqueue(QueuedCommand::new(
            format!("kick {} {}", target, channel),
            move |w| w.kick(&target, &channel, reason.as_deref()),
        ));
        Ok(())
    }

    pub fn invite(&self, server: &str, target: &str, channel: &str) -> BotResult<()> {
        let (target, channel) = (target.to_owned(), channel.to_owned());
        self.server(server)?.enqueue(QueuedCommand::new(
            format!("invite {} {}", target, channel),
            move |w| w.invite(&target, &channel),
        ));
        Ok(())
    }

    pub fn mode(&self, server: &str, channel: &str, mode: &str) -> BotResult<()> {
        let (channel, mode) = (channel.to_owned(), mode.to_owned());
        self.server(server)?.enqueue(QueuedCommand::new(
            format!("mode {} {}", channel, mode),
            move |w| w.mode(&channel, &mode),
        ));
        Ok(())
    }

    pub fn umode(&self, server: &str, mode: &str) -> BotResult<()> {
        let srv = self.server(server)?;
        // nickname as of sending; weak since the server owns this command
        let owner = Arc::downgrade(&srv);
        let mode = mode.to_owned();
        srv.enqueue(QueuedCommand::new(format!("umode {}", mode), move |w| {
            match owner.upgrade() {
                Some(srv) => w.umode(&srv.nickname(), &mode),
                None => Err(SessionError::NotConnected),
            }
        }));
        Ok(())
    }

    pub fn nick(&self, server: &str, nickname: &str) -> BotResult<()> {
        if nickname.is_empty() || nickname.contains(' ') {
            return Err(BotError::InvalidArgument(format!("invalid nickname {:?}", nickname)));
        }
        let (sent, stored) = (nickname.to_owned(), nickname.to_owned());
        self.server(server)?.enqueue(
            QueuedCommand::new(format!("nick {}", nickname), move |w| w.nick(&sent))
                .then(move |status| status.identity.nickname = stored),
        );
        Ok(())
    }

    pub fn topic(&self, server: &str, channel: &str, topic: &str) -> BotResult<()> {
        let (channel, topic) = (channel.to_owned(), topic.to_owned());
        self.server(server)?.enqueue(QueuedCommand::new(
            format!("topic {}", channel),
            move |w| w.topic(&channel, &topic),
        ));
        Ok(())
    }

    pub fn whois(&self, server: &str, target: &str) -> BotResult<()> {
        let target = target.to_owned();
        self.server(server)?.enqueue(QueuedCommand::new(
            format!("whois {}", target),
            move |w| w.whois(&target),
        ));
        Ok(())
    }
}
