use super::parse_config;
use crate::core::{nick_of, BotApi, MessageEvent};
use crate::plugins::{Plugin, PluginResult};
use regex::Regex;
use serde::de::Error;
use serde::{Deserialize, Deserializer};
use toml::Value;

fn deserialize_regex<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Regex, D::Error> {
    let s = String::deserialize(deserializer)?;
    Regex::new(&s).map_err(|e| D::Error::custom(format!("invalid regex {}: {}", s, e)))
}

#[derive(Clone, Debug, Deserialize)]
struct Pattern {
    #[serde(deserialize_with = "deserialize_regex")]
    pattern: Regex,
    response: String,
}

#[derive(Clone, Debug, Deserialize)]
struct PatternsConfig {
    #[serde(default)]
    patterns: Vec<Pattern>,
}

/// Replies to messages matching configured regular expressions.
///
/// Responses may refer to capture groups (`$1`, `${name}`); `%s` is the
/// nickname of the sender. Every matching pattern answers.
pub struct Patterns {
    config: PatternsConfig,
}

impl Patterns {
    pub fn create(id: &str, config: &Value) -> PluginResult<Box<dyn Plugin>> {
        let config: PatternsConfig = parse_config(id, config)?;
        Ok(Box::new(Patterns { config }))
    }

    fn responses(&self, event: &MessageEvent) -> Vec<String> {
        let mut responses = Vec::new();
        for pattern in &self.config.patterns {
            if let Some(captures) = pattern.pattern.captures(&event.message) {
                let mut response = String::new();
                captures.expand(&pattern.response, &mut response);
                responses.push(response.replace("%s", nick_of(&event.origin)));
            }
        }
        responses
    }
}

impl Plugin for Patterns {
    fn on_message(&mut self, api: &BotApi, event: &MessageEvent) -> PluginResult<()> {
        for response in self.responses(event) {
            api.message(&event.server, &event.channel, &response)?;
        }
        Ok(())
    }
}
