use super::parse_config;
use crate::core::{nick_of, BotApi, CommandEvent};
use crate::plugins::{Plugin, PluginResult};
use rand::seq::SliceRandom;
use rand::thread_rng;
use toml::Value;

fn default_responses() -> Vec<String> {
    [
        "It is certain, %s.",
        "Without a doubt.",
        "Ask again later.",
        "Cannot predict now.",
        "Don't count on it, %s.",
        "Very doubtful.",
    ]
    .iter()
    .map(|s| (*s).to_owned())
    .collect()
}

#[derive(Clone, Debug, Deserialize)]
struct EightballConfig {
    #[serde(default = "default_responses")]
    responses: Vec<String>,
}

/// Answers questions asked with the `eightball` command. `%s` in a response
/// is replaced by the nickname of the asker.
pub struct Eightball {
    config: EightballConfig,
}

impl Eightball {
    pub fn create(id: &str, config: &Value) -> PluginResult<Box<dyn Plugin>> {
        let config: EightballConfig = parse_config(id, config)?;
        if config.responses.is_empty() {
            return Err(crate::plugins::PluginError::InvalidConfig(
                id.to_owned(),
                "no responses".to_owned(),
            ));
        }
        Ok(Box::new(Eightball { config }))
    }
}

impl Plugin for Eightball {
    fn on_command(&mut self, api: &BotApi, event: &CommandEvent) -> PluginResult<()> {
        if event.message.trim().is_empty() {
            return Ok(());
        }
        if let Some(response) = self.config.responses.choose(&mut thread_rng()) {
            let response = response.replace("%s", nick_of(&event.origin));
            api.message(&event.server, &event.channel, &response)?;
        }
        Ok(())
    }
}
