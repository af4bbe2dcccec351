//! Daemon core: events, rules, the event queue and the object wiring it all.

use crate::control::ControlError;
use crate::plugins::PluginError;
use crate::sources::SessionError;
use std::io;

pub mod api;
pub mod bot_core;
pub mod encoding;
pub mod event_queue;
pub mod rules;
pub mod types;

pub use self::api::BotApi;
pub use self::bot_core::BotCore;
pub use self::encoding::{decode_line, Encoding};
pub use self::event_queue::{Dispatcher, EventObserver, EventQueue};
pub use self::rules::{Rule, RuleAction, RuleEngine, RuleError, RuleResult, Solution};
pub use self::types::*;

quick_error! {
    #[derive(Debug)]
    pub enum BotError {
        ServerExists(name: String) {
            display("server {} already exists", name)
        }
        NoSuchServer(name: String) {
            display("no such server: {}", name)
        }
        InvalidServer(reason: String) {
            display("invalid server: {}", reason)
        }
        InvalidArgument(reason: String) {
            display("{}", reason)
        }
        Plugin(err: PluginError) {
            from()
            display("{}", err)
        }
        Rule(err: RuleError) {
            from()
            display("{}", err)
        }
        Session(err: SessionError) {
            from()
            display("{}", err)
        }
        Control(err: ControlError) {
            from()
            display("control: {}", err)
        }
        Config(reason: String) {
            display("configuration error: {}", reason)
        }
        Io(err: io::Error) {
            from()
            display("I/O error: {}", err)
        }
    }
}

pub type BotResult<T> = Result<T, BotError>;
