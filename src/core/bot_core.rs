use crate::config::BotConfig;
use crate::control::{Context, ControlTransport};
use crate::core::*;
use crate::plugins::{PluginBuilder, PluginRegistry};
use crate::sources::{ServerRegistry, SessionFactory};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// The daemon: every shared component and the threads serving them.
pub struct BotCore {
    config: BotConfig,
    running: Arc<AtomicBool>,
    events: Arc<EventQueue>,
    rules: Arc<RuleEngine>,
    servers: Arc<ServerRegistry>,
    plugins: Arc<PluginRegistry>,
    api: BotApi,
    control: Option<Arc<ControlTransport>>,
    threads: Vec<JoinHandle<()>>,
}

impl BotCore {
    pub fn new(
        config: BotConfig,
        builders: HashMap<String, PluginBuilder>,
        factory: Arc<dyn SessionFactory>,
    ) -> BotResult<BotCore> {
        let running = Arc::new(AtomicBool::new(true));
        let events = Arc::new(EventQueue::new());
        let rules = Arc::new(RuleEngine::new());
        for rule in &config.rules {
            rules.add(rule.clone(), None)?;
        }
        let servers = Arc::new(ServerRegistry::new(factory, events.clone(), running.clone()));
        let plugins = Arc::new(PluginRegistry::new(builders, config.plugins.clone()));
        let api = BotApi::new(servers.clone(), rules.clone());

        Ok(BotCore {
            config,
            running,
            events,
            rules,
            servers,
            plugins,
            api,
            control: None,
            threads: Vec::new(),
        })
    }

    pub fn api(&self) -> &BotApi {
        &self.api
    }

    pub fn plugins(&self) -> &PluginRegistry {
        &self.plugins
    }

    pub fn control(&self) -> Option<&Arc<ControlTransport>> {
        self.control.as_ref()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Opens the control socket, starts the event worker, loads the
    /// configured plugins and connects the configured servers. Plugins and
    /// servers which fail are logged and skipped.
    pub fn start(&mut self) -> BotResult<()> {
        let control = &self.config.control;
        if control.unix.is_some() || control.tcp.is_some() {
            let context = Context {
                api: self.api.clone(),
                plugins: self.plugins.clone(),
            };
            let transport = Arc::new(ControlTransport::bind(control, context)?);
            self.threads.push(transport.start()?);
            self.control = Some(transport);
        } else {
            warn!("no control socket configured");
        }

        let mut dispatcher = Dispatcher::new(
            self.rules.clone(),
            self.plugins.clone(),
            self.api.clone(),
            self.config.command_char.clone(),
        );
        if let Some(ref transport) = self.control {
            let transport = transport.clone();
            dispatcher.observe(Box::new(move |event: &IncomingEvent| transport.broadcast(event)));
        }
        self.threads.push(self.events.start(dispatcher)?);

        for name in self.plugins.configured() {
            if let Err(e) = self.plugins.load_name(&name, &self.api) {
                warn!("plugin {}: not loaded: {}", name, e);
            }
        }

        for server in &self.config.servers {
            if let Err(e) = server.to_server().and_then(|s| self.servers.connect(s)) {
                warn!("server {}: not connected: {}", server.name, e);
            }
        }
        info!("started");
        Ok(())
    }

    /// Forgets the servers which gave up.
    pub fn reap(&self) {
        for name in self.servers.reap() {
            info!("{}: gave up", name);
        }
    }

    /// Stops everything and waits for every thread.
    pub fn shutdown(&mut self) {
        info!("shutting down");
        self.running.store(false, Ordering::SeqCst);
        if let Some(ref transport) = self.control {
            transport.stop();
        }
        self.servers.shutdown();
        self.events.stop();
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                warn!("a worker panicked");
            }
        }
        for plugin in self.plugins.list() {
            if let Err(e) = self.plugins.unload(&plugin.name, &self.api) {
                warn!("plugin {}: {}", plugin.name, e);
            }
        }
    }
}
