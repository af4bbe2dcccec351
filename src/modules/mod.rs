//! Plugins shipped with the daemon.

use crate::plugins::{PluginBuilder, PluginError, PluginResult};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use toml::Value;

mod chatlog;
mod eightball;
mod msg_pipe;
mod patterns;

pub use self::chatlog::Chatlog;
pub use self::eightball::Eightball;
pub use self::msg_pipe::MsgPipe;
pub use self::patterns::Patterns;

/// Builders of the built-in plugins, by type name
pub fn builders() -> HashMap<String, PluginBuilder> {
    let mut builders = HashMap::<String, PluginBuilder>::new();
    builders.insert("chatlog".to_owned(), Chatlog::create);
    builders.insert("eightball".to_owned(), Eightball::create);
    builders.insert("msg_pipe".to_owned(), MsgPipe::create);
    builders.insert("patterns".to_owned(), Patterns::create);
    builders
}

fn parse_config<T: DeserializeOwned>(id: &str, config: &Value) -> PluginResult<T> {
    config
        .clone()
        .try_into()
        .map_err(|e| PluginError::InvalidConfig(id.to_owned(), e.to_string()))
}
