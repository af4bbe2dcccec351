use super::parse_config;
use crate::core::*;
use crate::logger::Logger;
use crate::plugins::{Plugin, PluginResult};
use std::path::PathBuf;
use toml::Value;

fn default_directory() -> PathBuf {
    PathBuf::from("logs")
}

#[derive(Clone, Debug, Deserialize)]
struct ChatlogConfig {
    #[serde(default = "default_directory")]
    directory: PathBuf,
}

/// Keeps daily transcripts of every channel the bot is in.
pub struct Chatlog {
    logger: Logger,
}

impl Chatlog {
    pub fn create(id: &str, config: &Value) -> PluginResult<Box<dyn Plugin>> {
        let config: ChatlogConfig = parse_config(id, config)?;
        Ok(Box::new(Chatlog {
            logger: Logger::new(config.directory),
        }))
    }

    fn write(&mut self, server: &str, channel: &str, line: String) -> PluginResult<()> {
        let source = if channel.is_empty() {
            vec![server]
        } else {
            vec![server, channel]
        };
        self.logger.log(&source, line)?;
        Ok(())
    }
}

impl Plugin for Chatlog {
    fn on_connect(&mut self, _: &BotApi, ev: &ConnectEvent) -> PluginResult<()> {
        self.write(&ev.server, "", "*** connected".to_owned())
    }

    fn on_message(&mut self, _: &BotApi, ev: &MessageEvent) -> PluginResult<()> {
        let line = format!("<{}> {}", nick_of(&ev.origin), ev.message);
        self.write(&ev.server, &ev.channel, line)
    }

    fn on_me(&mut self, _: &BotApi, ev: &MessageEvent) -> PluginResult<()> {
        let line = format!("* {} {}", nick_of(&ev.origin), ev.message);
        self.write(&ev.server, &ev.channel, line)
    }

    fn on_notice(&mut self, _: &BotApi, ev: &NoticeEvent) -> PluginResult<()> {
        let line = format!("-{}- {}", nick_of(&ev.origin), ev.message);
        self.write(&ev.server, &ev.channel, line)
    }

    fn on_join(&mut self, _: &BotApi, ev: &JoinEvent) -> PluginResult<()> {
        let line = format!("*** {} ({}) joined", nick_of(&ev.origin), ev.origin);
        self.write(&ev.server, &ev.channel, line)
    }

    fn on_part(&mut self, _: &BotApi, ev: &PartEvent) -> PluginResult<()> {
        let line = format!("*** {} left ({})", nick_of(&ev.origin), ev.reason);
        self.write(&ev.server, &ev.channel, line)
    }

    fn on_kick(&mut self, _: &BotApi, ev: &KickEvent) -> PluginResult<()> {
        let line = format!(
            "*** {} was kicked by {} ({})",
            ev.target,
            nick_of(&ev.origin),
            ev.reason
        );
        self.write(&ev.server, &ev.channel, line)
    }

    fn on_nick(&mut self, _: &BotApi, ev: &NickEvent) -> PluginResult<()> {
        let line = format!("*** {} is now known as {}", nick_of(&ev.origin), ev.nickname);
        self.write(&ev.server, "", line)
    }

    fn on_mode(&mut self, _: &BotApi, ev: &ModeEvent) -> PluginResult<()> {
        let line = format!(
            "*** {} sets mode {} {}",
            nick_of(&ev.origin),
            ev.mode,
            ev.args.join(" ")
        );
        self.write(&ev.server, &ev.channel, line.trim_end().to_owned())
    }

    fn on_topic(&mut self, _: &BotApi, ev: &TopicEvent) -> PluginResult<()> {
        let line = format!("*** {} changes topic to: {}", nick_of(&ev.origin), ev.topic);
        self.write(&ev.server, &ev.channel, line)
    }
}
