//! The administrative commands understood on the control socket.
//!
//! Each command names the fields it requires; they are checked before the
//! handler runs, so handlers only deal with optional fields and types.

use crate::config::ServerConfig;
use crate::core::{BotApi, BotError, Rule, RuleError};
use crate::plugins::{PluginError, PluginRegistry};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::convert::TryFrom;
use std::path::Path;
use std::sync::Arc;

quick_error! {
    #[derive(Debug)]
    pub enum CommandError {
        Missing(field: &'static str) {
            display("missing field: {}", field)
        }
        WrongType(field: &'static str, expected: &'static str) {
            display("field {} must be {}", field, expected)
        }
        Invalid(reason: String) {
            display("{}", reason)
        }
        Bot(err: BotError) {
            from()
            display("{}", err)
        }
        Plugin(err: PluginError) {
            from()
            display("{}", err)
        }
        Rule(err: RuleError) {
            from()
            display("{}", err)
        }
    }
}

pub type CommandResult = Result<Value, CommandError>;

/// What the handlers act on
pub struct Context {
    pub api: BotApi,
    pub plugins: Arc<PluginRegistry>,
}

/// Typed access to the fields of a request object
pub struct Request<'a> {
    fields: &'a Map<String, Value>,
}

impl<'a> Request<'a> {
    fn get(&self, field: &'static str) -> Option<&'a Value> {
        self.fields.get(field).filter(|v| !v.is_null())
    }

    pub fn str(&self, field: &'static str) -> Result<&'a str, CommandError> {
        self.opt_str(field)?.ok_or(CommandError::Missing(field))
    }

    pub fn opt_str(&self, field: &'static str) -> Result<Option<&'a str>, CommandError> {
        match self.get(field) {
            None => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.as_str())),
            Some(_) => Err(CommandError::WrongType(field, "a string")),
        }
    }

    pub fn index(&self, field: &'static str) -> Result<usize, CommandError> {
        self.opt_index(field)?.ok_or(CommandError::Missing(field))
    }

    pub fn opt_index(&self, field: &'static str) -> Result<Option<usize>, CommandError> {
        match self.get(field) {
            None => Ok(None),
            Some(v) => v
                .as_u64()
                .and_then(|n| usize::try_from(n).ok())
                .map(Some)
                .ok_or(CommandError::WrongType(field, "a non-negative integer")),
        }
    }

    fn object(&self) -> Value {
        Value::Object(self.fields.clone())
    }
}

type Handler = fn(&Context, &Request) -> CommandResult;

struct Command {
    required: &'static [&'static str],
    handler: Handler,
}

fn done(text: impl Into<String>) -> CommandResult {
    Ok(json!({ "result": text.into() }))
}

fn connect(ctx: &Context, req: &Request) -> CommandResult {
    let config: ServerConfig = serde_json::from_value(req.object())
        .map_err(|e| CommandError::Invalid(format!("invalid server: {}", e)))?;
    let server = config.to_server()?;
    let server = ctx.api.servers().connect(server)?;
    done(format!("connecting to {}", server.name()))
}

fn disconnect(ctx: &Context, req: &Request) -> CommandResult {
    let server = req.str("server")?;
    ctx.api.servers().disconnect(server)?;
    done(format!("disconnected from {}", server))
}

fn join(ctx: &Context, req: &Request) -> CommandResult {
    let channel = req.str("channel")?;
    ctx.api.join(req.str("server")?, channel, req.opt_str("password")?)?;
    done(format!("joining {}", channel))
}

fn part(ctx: &Context, req: &Request) -> CommandResult {
    let channel = req.str("channel")?;
    ctx.api.part(req.str("server")?, channel, req.opt_str("reason")?)?;
    done(format!("leaving {}", channel))
}

fn kick(ctx: &Context, req: &Request) -> CommandResult {
    let target = req.str("target")?;
    ctx.api.kick(
        req.str("server")?,
        target,
        req.str("channel")?,
        req.opt_str("reason")?,
    )?;
    done(format!("kicking {}", target))
}

fn invite(ctx: &Context, req: &Request) -> CommandResult {
    let target = req.str("target")?;
    ctx.api.invite(req.str("server")?, target, req.str("channel")?)?;
    done(format!("inviting {}", target))
}

fn message(ctx: &Context, req: &Request) -> CommandResult {
    ctx.api.message(req.str("server")?, req.str("target")?, req.str("message")?)?;
    done("message queued")
}

fn me(ctx: &Context, req: &Request) -> CommandResult {
    ctx.api.me(req.str("server")?, req.str("target")?, req.str("message")?)?;
    done("action queued")
}

fn notice(ctx: &Context, req: &Request) -> CommandResult {
    ctx.api.notice(req.str("server")?, req.str("target")?, req.str("message")?)?;
    done("notice queued")
}

fn cnotice(ctx: &Context, req: &Request) -> CommandResult {
    ctx.api.notice(req.str("server")?, req.str("channel")?, req.str("message")?)?;
    done("notice queued")
}

fn mode(ctx: &Context, req: &Request) -> CommandResult {
    ctx.api.mode(req.str("server")?, req.str("channel")?, req.str("mode")?)?;
    done("mode queued")
}

fn umode(ctx: &Context, req: &Request) -> CommandResult {
    ctx.api.umode(req.str("server")?, req.str("mode")?)?;
    done("mode queued")
}

fn nick(ctx: &Context, req: &Request) -> CommandResult {
    let nickname = req.str("nickname")?;
    ctx.api.nick(req.str("server")?, nickname)?;
    done(format!("changing nickname to {}", nickname))
}

fn topic(ctx: &Context, req: &Request) -> CommandResult {
    ctx.api.topic(req.str("server")?, req.str("channel")?, req.str("topic")?)?;
    done("topic queued")
}

fn load(ctx: &Context, req: &Request) -> CommandResult {
    let name = match (req.opt_str("path")?, req.opt_str("name")?) {
        (Some(path), None) => ctx.plugins.load_path(Path::new(path), &ctx.api)?,
        (None, Some(name)) => {
            ctx.plugins.load_name(name, &ctx.api)?;
            name.to_owned()
        }
        _ => {
            return Err(CommandError::Invalid(
                "exactly one of path and name is required".to_owned(),
            ))
        }
    };
    done(format!("plugin {} loaded", name))
}

fn unload(ctx: &Context, req: &Request) -> CommandResult {
    let plugin = req.str("plugin")?;
    ctx.plugins.unload(plugin, &ctx.api)?;
    done(format!("plugin {} unloaded", plugin))
}

fn reload(ctx: &Context, req: &Request) -> CommandResult {
    let plugin = req.str("plugin")?;
    ctx.plugins.reload(plugin, &ctx.api)?;
    done(format!("plugin {} reloaded", plugin))
}

fn reconnect(ctx: &Context, req: &Request) -> CommandResult {
    let server = req.opt_str("server")?;
    ctx.api.servers().reconnect(server)?;
    match server {
        Some(server) => done(format!("reconnecting to {}", server)),
        None => done("reconnecting to all servers"),
    }
}

fn server_list(ctx: &Context, _: &Request) -> CommandResult {
    let servers: Vec<Value> = ctx
        .api
        .servers()
        .list()
        .iter()
        .map(|server| {
            let status = server.snapshot();
            json!({
                "name": server.name(),
                "host": server.info().host,
                "port": server.info().port,
                "state": status.state,
                "nickname": status.identity.nickname,
            })
        })
        .collect();
    Ok(json!({ "result": "ok", "servers": servers }))
}

fn server_info(ctx: &Context, req: &Request) -> CommandResult {
    let server = ctx.api.servers().get(req.str("server")?)?;
    let status = server.snapshot();
    Ok(json!({
        "result": "ok",
        "server": {
            "name": server.name(),
            "info": server.info(),
            "state": status.state,
            "identity": status.identity,
            "channels": status.channels,
            "reconnect": status.reconnect,
            "retries": status.retries,
            "pending": server.queue().len(),
        },
    }))
}

fn plugin_list(ctx: &Context, _: &Request) -> CommandResult {
    Ok(json!({ "result": "ok", "plugins": ctx.plugins.list() }))
}

fn rule_add(ctx: &Context, req: &Request) -> CommandResult {
    let rule: Rule = serde_json::from_value(req.object())
        .map_err(|e| CommandError::Invalid(format!("invalid rule: {}", e)))?;
    let index = ctx.api.rules().add(rule, req.opt_index("index")?)?;
    Ok(json!({ "result": format!("rule {} added", index), "index": index }))
}

fn rule_remove(ctx: &Context, req: &Request) -> CommandResult {
    let index = req.index("index")?;
    ctx.api.rules().remove(index)?;
    done(format!("rule {} removed", index))
}

fn rule_info(ctx: &Context, req: &Request) -> CommandResult {
    let rule = ctx.api.rules().get(req.index("index")?)?;
    Ok(json!({ "result": "ok", "rule": rule }))
}

fn rule_list(ctx: &Context, _: &Request) -> CommandResult {
    Ok(json!({ "result": "ok", "rules": ctx.api.rules().list() }))
}

fn rule_move(ctx: &Context, req: &Request) -> CommandResult {
    let (from, to) = (req.index("from")?, req.index("to")?);
    ctx.api.rules().move_rule(from, to)?;
    done(format!("rule {} moved to {}", from, to))
}

lazy_static! {
    static ref COMMANDS: HashMap<&'static str, Command> = {
        let mut m = HashMap::new();
        let mut add = |name: &'static str, required: &'static [&'static str], handler: Handler| {
            m.insert(name, Command { required, handler });
        };
        add("connect", &["name", "host", "port"], connect);
        add("disconnect", &["server"], disconnect);
        add("join", &["server", "channel"], join);
        add("part", &["server", "channel"], part);
        add("kick", &["server", "target", "channel"], kick);
        add("invite", &["server", "target", "channel"], invite);
        add("message", &["server", "target", "message"], message);
        add("say", &["server", "target", "message"], message);
        add("me", &["server", "target", "message"], me);
        add("notice", &["server", "target", "message"], notice);
        add("cnotice", &["server", "channel", "message"], cnotice);
        add("mode", &["server", "channel", "mode"], mode);
        add("umode", &["server", "mode"], umode);
        add("nick", &["server", "nickname"], nick);
        add("topic", &["server", "channel", "topic"], topic);
        add("load", &[], load);
        add("unload", &["plugin"], unload);
        add("reload", &["plugin"], reload);
        add("reconnect", &[], reconnect);
        add("server-list", &[], server_list);
        add("server-info", &["server"], server_info);
        add("plugin-list", &[], plugin_list);
        add("rule-add", &[], rule_add);
        add("rule-remove", &["index"], rule_remove);
        add("rule-info", &["index"], rule_info);
        add("rule-list", &[], rule_list);
        add("rule-move", &["from", "to"], rule_move);
        m
    };
}

fn error(text: impl Into<String>) -> Value {
    json!({ "error": text.into() })
}

/// Runs one request and builds its response.
pub fn execute(ctx: &Context, body: &str) -> Value {
    let value: Value = match serde_json::from_str(body) {
        Ok(value) => value,
        Err(e) => return error(format!("invalid JSON: {}", e)),
    };
    let fields = match value {
        Value::Object(ref fields) => fields,
        _ => return error("request must be a JSON object"),
    };
    let name = match fields.get("command") {
        Some(Value::String(name)) => name.as_str(),
        Some(_) => return error("field command must be a string"),
        None => return error("missing field: command"),
    };
    let command = match COMMANDS.get(name) {
        Some(command) => command,
        None => return error(format!("unknown command: {}", name)),
    };
    if let Some(field) = command
        .required
        .iter()
        .find(|field| fields.get(**field).map_or(true, Value::is_null))
    {
        return error(format!("missing field: {}", field));
    }

    debug!("control: {}", name);
    match (command.handler)(ctx, &Request { fields }) {
        Ok(response) => response,
        Err(e) => {
            debug!("control: {} failed: {}", name, e);
            error(e.to_string())
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::plugins::test::test_api;
    use crate::plugins::{Plugin, PluginBuilder, PluginResult};
    use crate::sources::{Identity, ReconnectPolicy, Server, ServerInfo};

    struct Quiet;

    impl Plugin for Quiet {}

    fn quiet(_: &str, _: &toml::Value) -> PluginResult<Box<dyn Plugin>> {
        Ok(Box::new(Quiet))
    }

    fn context() -> Context {
        let mut builders: HashMap<String, PluginBuilder> = HashMap::new();
        builders.insert("quiet".to_owned(), quiet);
        Context {
            api: test_api(),
            plugins: Arc::new(PluginRegistry::new(builders, HashMap::new())),
        }
    }

    fn with_server(ctx: &Context) {
        let server = Server::new(
            "local",
            ServerInfo {
                host: "127.0.0.1".to_owned(),
                port: 6667,
                password: None,
                ssl: false,
                ssl_verify: true,
            },
            Identity {
                nickname: "bot".to_owned(),
                username: "bot".to_owned(),
                realname: "bot".to_owned(),
            },
            Vec::new(),
            ReconnectPolicy::default(),
        );
        ctx.api.servers().insert_detached(server).unwrap();
    }

    fn error_of(response: &Value) -> &str {
        response["error"].as_str().unwrap_or_else(|| panic!("no error in {}", response))
    }

    #[test]
    fn join_on_missing_server_is_an_error() {
        let ctx = context();
        let response = execute(&ctx, r##"{"command":"join","server":"nope","channel":"#a"}"##);
        assert_eq!(error_of(&response), "no such server: nope");
    }

    #[test]
    fn malformed_requests() {
        let ctx = context();
        assert!(error_of(&execute(&ctx, "{not json")).starts_with("invalid JSON"));
        assert_eq!(error_of(&execute(&ctx, "[1, 2]")), "request must be a JSON object");
        assert_eq!(error_of(&execute(&ctx, "{}")), "missing field: command");
        assert_eq!(error_of(&execute(&ctx, r#"{"command":"fly"}"#)), "unknown command: fly");
        assert_eq!(
            error_of(&execute(&ctx, r#"{"command":"part","server":"local"}"#)),
            "missing field: channel"
        );
        assert_eq!(
            error_of(&execute(&ctx, r#"{"command":"umode","server":1,"mode":"+i"}"#)),
            "field server must be a string"
        );
        assert_eq!(
            error_of(&execute(&ctx, r#"{"command":"rule-info","index":1.5}"#)),
            "field index must be a non-negative integer"
        );
        // past usize on narrow targets, out of range everywhere else
        assert!(execute(&ctx, r#"{"command":"rule-remove","index":18446744073709551615}"#)
            .get("error")
            .is_some());
    }

    #[test]
    fn commands_are_queued_on_the_server() {
        let ctx = context();
        with_server(&ctx);
        let response = execute(&ctx, r##"{"command":"join","server":"local","channel":"#a"}"##);
        assert_eq!(response["result"], "joining #a");
        let response = execute(
            &ctx,
            r##"{"command":"say","server":"local","target":"#a","message":"hi"}"##,
        );
        assert_eq!(response["result"], "message queued");

        let server = ctx.api.servers().get("local").unwrap();
        assert_eq!(server.queue().len(), 2);
        let info = execute(&ctx, r#"{"command":"server-info","server":"local"}"#);
        assert_eq!(info["server"]["pending"], 2);
        assert_eq!(info["server"]["state"], "uninitialized");
        assert!(info["server"]["info"].get("password").is_none());
    }

    #[test]
    fn connect_validates_before_registering() {
        let ctx = context();
        with_server(&ctx);
        let response = execute(
            &ctx,
            r#"{"command":"connect","name":"local","host":"irc.example.org","port":6667}"#,
        );
        assert_eq!(error_of(&response), "server local already exists");
        let response = execute(
            &ctx,
            r#"{"command":"connect","name":"tls","host":"irc.example.org","port":6697,"ssl":true}"#,
        );
        assert!(error_of(&response).contains("SSL"));
        let response = execute(
            &ctx,
            r#"{"command":"connect","name":"bad","host":"irc.example.org","port":"x"}"#,
        );
        assert!(error_of(&response).starts_with("invalid server"));
        assert_eq!(ctx.api.servers().names(), vec!["local"]);
    }

    #[test]
    fn rules_round_trip_through_commands() {
        let ctx = context();
        let response = execute(
            &ctx,
            r##"{"command":"rule-add","channels":["#staff"],"action":"drop"}"##,
        );
        assert_eq!(response["index"], 0);
        let response = execute(
            &ctx,
            r##"{"command":"rule-add","servers":["x"],"channels":["#staff"],"index":0}"##,
        );
        assert_eq!(response["index"], 0);
        execute(&ctx, r#"{"command":"rule-move","from":0,"to":1}"#);

        let list = execute(&ctx, r#"{"command":"rule-list"}"#);
        assert_eq!(list["rules"][0]["action"], "drop");
        assert_eq!(list["rules"][1]["action"], "accept");
        assert!(
            ctx.api
                .rules()
                .solve("x", "#staff", "", "p", crate::core::EventKind::Command)
                .enabled
        );

        assert_eq!(error_of(&execute(&ctx, r#"{"command":"rule-info","index":5}"#)), "rule 5 not found");
        assert_eq!(
            error_of(&execute(&ctx, r#"{"command":"rule-add","events":["onFly"]}"#)),
            "invalid event name: onFly"
        );
        assert_eq!(
            error_of(&execute(&ctx, r#"{"command":"rule-remove","index":-1}"#)),
            "field index must be a non-negative integer"
        );
        execute(&ctx, r#"{"command":"rule-remove","index":0}"#);
        assert_eq!(ctx.api.rules().len(), 1);
    }

    #[test]
    fn plugin_commands() {
        let ctx = context();
        let response = execute(&ctx, r#"{"command":"load","name":"quiet"}"#);
        assert_eq!(response["result"], "plugin quiet loaded");
        assert_eq!(
            error_of(&execute(&ctx, r#"{"command":"load"}"#)),
            "exactly one of path and name is required"
        );
        assert_eq!(
            error_of(&execute(&ctx, r#"{"command":"load","name":"quiet","path":"/x.toml"}"#)),
            "exactly one of path and name is required"
        );
        let list = execute(&ctx, r#"{"command":"plugin-list"}"#);
        assert_eq!(list["plugins"][0]["name"], "quiet");
        assert_eq!(
            execute(&ctx, r#"{"command":"reload","plugin":"quiet"}"#)["result"],
            "plugin quiet reloaded"
        );
        execute(&ctx, r#"{"command":"unload","plugin":"quiet"}"#);
        assert_eq!(
            error_of(&execute(&ctx, r#"{"command":"unload","plugin":"quiet"}"#)),
            "plugin quiet not found"
        );
    }
}
