use super::parse_config;
use crate::core::{nick_of, BotApi, MessageEvent};
use crate::plugins::{Plugin, PluginResult};
use toml::Value;

#[derive(Clone, Debug, Serialize, Deserialize)]
struct MsgPipeConfig {
    server1: String,
    channel1: String,
    server2: String,
    channel2: String,
}

type Endpoint = (String, String);

/// Relays channel messages between two server/channel endpoints.
pub struct MsgPipe {
    endpoint1: Endpoint,
    endpoint2: Endpoint,
}

impl MsgPipe {
    pub fn create(id: &str, config: &Value) -> PluginResult<Box<dyn Plugin>> {
        let config: MsgPipeConfig = parse_config(id, config)?;
        Ok(Box::new(MsgPipe {
            endpoint1: (config.server1, config.channel1),
            endpoint2: (config.server2, config.channel2),
        }))
    }

    fn other_end(&self, event: &MessageEvent) -> Option<&Endpoint> {
        let matches = |(server, channel): &Endpoint| {
            *server == event.server && channel.eq_ignore_ascii_case(&event.channel)
        };
        if matches(&self.endpoint1) {
            Some(&self.endpoint2)
        } else if matches(&self.endpoint2) {
            Some(&self.endpoint1)
        } else {
            None
        }
    }

    fn relay(&self, api: &BotApi, event: &MessageEvent, text: String) -> PluginResult<()> {
        if let Some((server, channel)) = self.other_end(event) {
            api.message(server, channel, &text)?;
        }
        Ok(())
    }
}

impl Plugin for MsgPipe {
    fn on_message(&mut self, api: &BotApi, event: &MessageEvent) -> PluginResult<()> {
        let text = format!("[{}]: {}", nick_of(&event.origin), event.message);
        self.relay(api, event, text)
    }

    fn on_me(&mut self, api: &BotApi, event: &MessageEvent) -> PluginResult<()> {
        let text = format!("* {} {}", nick_of(&event.origin), event.message);
        self.relay(api, event, text)
    }
}
