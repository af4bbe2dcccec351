use crate::core::{BotError, BotResult, Rule};
use crate::sources::{ChannelEntry, Identity, ReconnectPolicy, Server, ServerInfo};
use std::collections::HashMap;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BotConfig {
    pub command_char: String,
    pub logging: LoggingConfig,
    pub control: ControlConfig,
    pub servers: Vec<ServerConfig>,
    pub rules: Vec<Rule>,
    pub plugins: HashMap<String, toml::Value>,
}

impl Default for BotConfig {
    fn default() -> BotConfig {
        BotConfig {
            command_char: "!".to_owned(),
            logging: LoggingConfig::default(),
            control: ControlConfig::default(),
            servers: Vec::new(),
            rules: Vec::new(),
            plugins: HashMap::new(),
        }
    }
}

impl BotConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> BotResult<BotConfig> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        BotConfig::parse(&text)
            .map_err(|e| BotError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn parse(text: &str) -> Result<BotConfig, toml::de::Error> {
        toml::from_str(text)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> LoggingConfig {
        LoggingConfig {
            level: "info".to_owned(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub unix: Option<PathBuf>,
    pub tcp: Option<SocketAddr>,
}

/// A server as described in the configuration file or in a `connect`
/// control request.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ServerConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub ssl: bool,
    #[serde(default = "default_true")]
    pub ssl_verify: bool,
    #[serde(default = "default_nickname")]
    pub nickname: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub realname: Option<String>,
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
    #[serde(default = "default_true")]
    pub reconnect: bool,
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay: u64,
    #[serde(default)]
    pub max_retries: u32,
}

/// A channel given either as a bare name or as a table with a key
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChannelConfig {
    Name(String),
    Entry {
        name: String,
        #[serde(default)]
        password: Option<String>,
    },
}

impl From<ChannelConfig> for ChannelEntry {
    fn from(config: ChannelConfig) -> ChannelEntry {
        match config {
            ChannelConfig::Name(name) => ChannelEntry::new(name, None),
            ChannelConfig::Entry { name, password } => ChannelEntry::new(name, password),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_nickname() -> String {
    "chatbotd".to_owned()
}

fn default_reconnect_delay() -> u64 {
    30
}

impl ServerConfig {
    /// Checks the description and builds the connection it describes.
    pub fn to_server(&self) -> BotResult<Server> {
        if self.name.is_empty() || self.name.contains(char::is_whitespace) {
            return Err(BotError::InvalidServer(format!("invalid name {:?}", self.name)));
        }
        if self.host.is_empty() {
            return Err(BotError::InvalidServer(format!("{}: empty host", self.name)));
        }
        if self.port == 0 {
            return Err(BotError::InvalidServer(format!("{}: invalid port 0", self.name)));
        }
        if self.ssl {
            return Err(BotError::InvalidServer(format!("{}: SSL is not supported", self.name)));
        }
        if self.nickname.is_empty() || self.nickname.contains(' ') {
            return Err(BotError::InvalidServer(format!(
                "{}: invalid nickname {:?}",
                self.name, self.nickname
            )));
        }

        let info = ServerInfo {
            host: self.host.clone(),
            port: self.port,
            password: self.password.clone(),
            ssl: self.ssl,
            ssl_verify: self.ssl_verify,
        };
        let identity = Identity {
            nickname: self.nickname.clone(),
            username: self.username.clone().unwrap_or_else(|| self.nickname.clone()),
            realname: self.realname.clone().unwrap_or_else(|| self.nickname.clone()),
        };
        let channels = self.channels.iter().cloned().map(ChannelEntry::from).collect();
        let reconnect = ReconnectPolicy {
            enabled: self.reconnect,
            delay: self.reconnect_delay,
            max_retries: self.max_retries,
        };
        Ok(Server::new(self.name.clone(), info, identity, channels, reconnect))
    }
}
