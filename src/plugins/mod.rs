//! Loadable plugins and the registry holding them.
//!
//! A plugin is a set of hooks, one per event kind. Plugins are created by
//! builders registered under a type name; a plugin is loaded either by name,
//! taking its configuration from the daemon configuration, or from a TOML
//! file whose `type` key selects the builder.

use crate::core::*;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use toml::Value;

quick_error! {
    #[derive(Debug)]
    pub enum PluginError {
        NotFound(name: String) {
            display("plugin {} not found", name)
        }
        AlreadyLoaded(name: String) {
            display("plugin {} is already loaded", name)
        }
        UnknownType(kind: String) {
            display("unknown plugin type {}", kind)
        }
        InvalidConfig(name: String, reason: String) {
            display("invalid configuration for plugin {}: {}", name, reason)
        }
        InvalidPath(path: PathBuf) {
            display("invalid plugin path {}", path.display())
        }
        Io(err: io::Error) {
            from()
            display("I/O error: {}", err)
        }
        Toml(err: toml::de::Error) {
            from()
            display("TOML error: {}", err)
        }
        Bot(err: Box<BotError>) {
            display("{}", err)
        }
        Hook(reason: String) {
            from()
            from(s: &'static str) -> (s.to_owned())
            display("{}", reason)
        }
    }
}

impl From<BotError> for PluginError {
    fn from(err: BotError) -> PluginError {
        PluginError::Bot(Box::new(err))
    }
}

pub type PluginResult<T> = Result<T, PluginError>;

/// Hooks invoked by the event dispatcher. Every hook does nothing by default.
#[allow(unused_variables)]
pub trait Plugin: Send {
    fn on_load(&mut self, api: &BotApi) -> PluginResult<()> {
        Ok(())
    }
    fn on_unload(&mut self, api: &BotApi) -> PluginResult<()> {
        Ok(())
    }
    /// Called on the fresh instance replacing this plugin after a reload
    fn on_reload(&mut self, api: &BotApi) -> PluginResult<()> {
        Ok(())
    }
    fn on_command(&mut self, api: &BotApi, event: &CommandEvent) -> PluginResult<()> {
        Ok(())
    }
    fn on_connect(&mut self, api: &BotApi, event: &ConnectEvent) -> PluginResult<()> {
        Ok(())
    }
    fn on_message(&mut self, api: &BotApi, event: &MessageEvent) -> PluginResult<()> {
        Ok(())
    }
    fn on_me(&mut self, api: &BotApi, event: &MessageEvent) -> PluginResult<()> {
        Ok(())
    }
    fn on_notice(&mut self, api: &BotApi, event: &NoticeEvent) -> PluginResult<()> {
        Ok(())
    }
    fn on_join(&mut self, api: &BotApi, event: &JoinEvent) -> PluginResult<()> {
        Ok(())
    }
    fn on_part(&mut self, api: &BotApi, event: &PartEvent) -> PluginResult<()> {
        Ok(())
    }
    fn on_kick(&mut self, api: &BotApi, event: &KickEvent) -> PluginResult<()> {
        Ok(())
    }
    fn on_nick(&mut self, api: &BotApi, event: &NickEvent) -> PluginResult<()> {
        Ok(())
    }
    fn on_mode(&mut self, api: &BotApi, event: &ModeEvent) -> PluginResult<()> {
        Ok(())
    }
    fn on_topic(&mut self, api: &BotApi, event: &TopicEvent) -> PluginResult<()> {
        Ok(())
    }
    fn on_invite(&mut self, api: &BotApi, event: &InviteEvent) -> PluginResult<()> {
        Ok(())
    }
    fn on_names(&mut self, api: &BotApi, event: &NamesEvent) -> PluginResult<()> {
        Ok(())
    }
    fn on_whois(&mut self, api: &BotApi, event: &WhoisEvent) -> PluginResult<()> {
        Ok(())
    }
}

/// Creates a plugin from its id and configuration table
pub type PluginBuilder = fn(id: &str, config: &Value) -> PluginResult<Box<dyn Plugin>>;

pub type SharedPlugin = Arc<Mutex<Box<dyn Plugin>>>;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PluginInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

struct LoadedPlugin {
    name: String,
    kind: String,
    path: Option<PathBuf>,
    config: Value,
    instance: SharedPlugin,
}

fn empty_table() -> Value {
    Value::Table(Default::default())
}

fn kind_of(name: &str, config: &Value) -> String {
    config
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or(name)
        .to_owned()
}

/// Loaded plugins, in load order
pub struct PluginRegistry {
    builders: HashMap<String, PluginBuilder>,
    configs: HashMap<String, Value>,
    loaded: Mutex<Vec<LoadedPlugin>>,
}

impl PluginRegistry {
    pub fn new(builders: HashMap<String, PluginBuilder>, configs: HashMap<String, Value>) -> Self {
        PluginRegistry {
            builders,
            configs,
            loaded: Mutex::new(Vec::new()),
        }
    }

    fn build(&self, name: &str, config: &Value) -> PluginResult<(String, Box<dyn Plugin>)> {
        let kind = kind_of(name, config);
        let builder = self
            .builders
            .get(&kind)
            .ok_or_else(|| PluginError::UnknownType(kind.clone()))?;
        Ok((kind, builder(name, config)?))
    }

    fn read_file(path: &Path) -> PluginResult<(String, Value)> {
        let name = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .ok_or_else(|| PluginError::InvalidPath(path.to_path_buf()))?
            .to_owned();
        let config: Value = toml::from_str(&fs::read_to_string(path)?)?;
        Ok((name, config))
    }

    /// Loads a plugin by name, configured from the daemon configuration.
    pub fn load_name(&self, name: &str, api: &BotApi) -> PluginResult<()> {
        let config = self.configs.get(name).cloned().unwrap_or_else(empty_table);
        self.load(name.to_owned(), None, config, api)
    }

    /// Loads a plugin from a TOML file, named after the file stem.
    pub fn load_path(&self, path: &Path, api: &BotApi) -> PluginResult<String> {
        let (name, config) = Self::read_file(path)?;
        self.load(name.clone(), Some(path.to_path_buf()), config, api)?;
        Ok(name)
    }

    fn load(&self, name: String, path: Option<PathBuf>, config: Value, api: &BotApi) -> PluginResult<()> {
        if self.is_loaded(&name) {
            return Err(PluginError::AlreadyLoaded(name));
        }
        let (kind, mut instance) = self.build(&name, &config)?;
        instance.on_load(&api.for_plugin(&name))?;

        let mut loaded = self.loaded.lock();
        if loaded.iter().any(|p| p.name == name) {
            return Err(PluginError::AlreadyLoaded(name));
        }
        info!("plugin {}: loaded ({})", name, kind);
        loaded.push(LoadedPlugin {
            name,
            kind,
            path,
            config,
            instance: Arc::new(Mutex::new(instance)),
        });
        Ok(())
    }

    /// Adds an already built plugin.
    pub fn insert(&self, name: &str, plugin: Box<dyn Plugin>) -> PluginResult<()> {
        let mut loaded = self.loaded.lock();
        if loaded.iter().any(|p| p.name == name) {
            return Err(PluginError::AlreadyLoaded(name.to_owned()));
        }
        loaded.push(LoadedPlugin {
            name: name.to_owned(),
            kind: name.to_owned(),
            path: None,
            config: empty_table(),
            instance: Arc::new(Mutex::new(plugin)),
        });
        Ok(())
    }

    pub fn unload(&self, name: &str, api: &BotApi) -> PluginResult<()> {
        let removed = {
            let mut loaded = self.loaded.lock();
            let index = loaded
                .iter()
                .position(|p| p.name == name)
                .ok_or_else(|| PluginError::NotFound(name.to_owned()))?;
            loaded.remove(index)
        };
        let result = removed.instance.lock().on_unload(&api.for_plugin(name));
        info!("plugin {}: unloaded", name);
        result
    }

    /// Recreates the plugin from where it was loaded. On failure the running
    /// instance is kept.
    pub fn reload(&self, name: &str, api: &BotApi) -> PluginResult<()> {
        let (path, config) = {
            let loaded = self.loaded.lock();
            let plugin = loaded
                .iter()
                .find(|p| p.name == name)
                .ok_or_else(|| PluginError::NotFound(name.to_owned()))?;
            (plugin.path.clone(), plugin.config.clone())
        };
        let config = match path {
            Some(ref path) => Self::read_file(path)?.1,
            None => config,
        };
        let (kind, mut instance) = self.build(name, &config)?;
        instance.on_reload(&api.for_plugin(name))?;

        let mut loaded = self.loaded.lock();
        let plugin = loaded
            .iter_mut()
            .find(|p| p.name == name)
            .ok_or_else(|| PluginError::NotFound(name.to_owned()))?;
        plugin.kind = kind;
        plugin.config = config;
        plugin.instance = Arc::new(Mutex::new(instance));
        info!("plugin {}: reloaded", name);
        Ok(())
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.loaded.lock().iter().any(|p| p.name == name)
    }

    /// Plugins currently loaded, in load order.
    pub fn snapshot(&self) -> Vec<(String, SharedPlugin)> {
        self.loaded
            .lock()
            .iter()
            .map(|p| (p.name.clone(), p.instance.clone()))
            .collect()
    }

    pub fn list(&self) -> Vec<PluginInfo> {
        self.loaded
            .lock()
            .iter()
            .map(|p| PluginInfo {
                name: p.name.clone(),
                kind: p.kind.clone(),
                path: p.path.as_ref().map(|path| path.display().to_string()),
            })
            .collect()
    }

    /// Names of the plugins configured in the daemon configuration.
    pub fn configured(&self) -> Vec<String> {
        let mut names: Vec<String> = self.configs.keys().cloned().collect();
        names.sort();
        names
    }
}
