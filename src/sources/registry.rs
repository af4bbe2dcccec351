use crate::core::{BotError, BotResult, EventQueue};
use crate::sources::server::run_command_worker;
use crate::sources::{Server, ServerMachine, ServerState, SessionFactory};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

struct Entry {
    server: Arc<Server>,
    threads: Vec<JoinHandle<()>>,
}

/// Connections known to the daemon, by name
pub struct ServerRegistry {
    servers: Mutex<BTreeMap<String, Entry>>,
    retired: Mutex<Vec<JoinHandle<()>>>,
    factory: Arc<dyn SessionFactory>,
    events: Arc<EventQueue>,
    running: Arc<AtomicBool>,
}

impl ServerRegistry {
    pub fn new(
        factory: Arc<dyn SessionFactory>,
        events: Arc<EventQueue>,
        running: Arc<AtomicBool>,
    ) -> ServerRegistry {
        ServerRegistry {
            servers: Mutex::new(BTreeMap::new()),
            retired: Mutex::new(Vec::new()),
            factory,
            events,
            running,
        }
    }

    /// Registers a server and starts its workers. Fails if a server with the
    /// same name exists.
    pub fn connect(&self, server: Server) -> BotResult<Arc<Server>> {
        let mut servers = self.servers.lock();
        if servers.contains_key(server.name()) {
            return Err(BotError::ServerExists(server.name().to_owned()));
        }
        let server = Arc::new(server);
        let name = server.name().to_owned();

        let machine = ServerMachine::new(
            server.clone(),
            self.factory.clone(),
            self.events.clone(),
            self.running.clone(),
        );
        let machine_thread = thread::Builder::new()
            .name(format!("server:{}", name))
            .spawn(move || machine.run())?;
        let worker_server = server.clone();
        let queue_thread = match thread::Builder::new()
            .name(format!("queue:{}", name))
            .spawn(move || run_command_worker(worker_server))
        {
            Ok(handle) => handle,
            Err(e) => {
                server.stop();
                self.retired.lock().push(machine_thread);
                return Err(e.into());
            }
        };

        info!("{}: registered {}:{}", name, server.info().host, server.info().port);
        servers.insert(
            name,
            Entry {
                server: server.clone(),
                threads: vec![machine_thread, queue_thread],
            },
        );
        Ok(server)
    }

    /// Registers a server without starting any worker.
    #[cfg(test)]
    pub fn insert_detached(&self, server: Server) -> BotResult<Arc<Server>> {
        let mut servers = self.servers.lock();
        if servers.contains_key(server.name()) {
            return Err(BotError::ServerExists(server.name().to_owned()));
        }
        let server = Arc::new(server);
        servers.insert(
            server.name().to_owned(),
            Entry {
                server: server.clone(),
                threads: Vec::new(),
            },
        );
        Ok(server)
    }

    pub fn get(&self, name: &str) -> BotResult<Arc<Server>> {
        self.servers
            .lock()
            .get(name)
            .map(|entry| entry.server.clone())
            .ok_or_else(|| BotError::NoSuchServer(name.to_owned()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.servers.lock().contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.servers.lock().keys().cloned().collect()
    }

    pub fn list(&self) -> Vec<Arc<Server>> {
        self.servers
            .lock()
            .values()
            .map(|entry| entry.server.clone())
            .collect()
    }

    /// Stops a server and forgets it. Its workers are joined later, by
    /// `reap` or `shutdown`.
    pub fn disconnect(&self, name: &str) -> BotResult<()> {
        let entry = self
            .servers
            .lock()
            .remove(name)
            .ok_or_else(|| BotError::NoSuchServer(name.to_owned()))?;
        info!("{}: disconnecting", name);
        entry.server.stop();
        self.retired.lock().extend(entry.threads);
        Ok(())
    }

    /// Forces a reconnection of one server, or all of them.
    pub fn reconnect(&self, name: Option<&str>) -> BotResult<()> {
        match name {
            Some(name) => self.get(name)?.reconnect(),
            None => {
                for server in self.list() {
                    server.reconnect();
                }
            }
        }
        Ok(())
    }

    /// Forgets the servers which gave up and joins finished workers. Returns
    /// the names of the removed servers.
    pub fn reap(&self) -> Vec<String> {
        let dead: Vec<Entry> = {
            let mut servers = self.servers.lock();
            let names: Vec<String> = servers
                .iter()
                .filter(|(_, entry)| entry.server.state() == ServerState::Dead)
                .map(|(name, _)| name.clone())
                .collect();
            names.iter().filter_map(|name| servers.remove(name)).collect()
        };

        let mut removed = Vec::new();
        {
            let mut retired = self.retired.lock();
            for entry in dead {
                info!("{}: removed", entry.server.name());
                removed.push(entry.server.name().to_owned());
                retired.extend(entry.threads);
            }
        }

        let finished: Vec<JoinHandle<()>> = {
            let mut retired = self.retired.lock();
            let (finished, pending): (Vec<_>, Vec<_>) =
                retired.drain(..).partition(|h| h.is_finished());
            *retired = pending;
            finished
        };
        for handle in finished {
            if handle.join().is_err() {
                warn!("a server worker panicked");
            }
        }
        removed
    }

    /// Stops every server and waits for all workers.
    pub fn shutdown(&self) {
        let entries: Vec<Entry> = {
            let mut servers = self.servers.lock();
            let names: Vec<String> = servers.keys().cloned().collect();
            names.iter().filter_map(|name| servers.remove(name)).collect()
        };
        let mut handles: Vec<JoinHandle<()>> = self.retired.lock().drain(..).collect();
        for entry in entries {
            entry.server.stop();
            handles.extend(entry.threads);
        }
        for handle in handles {
            if handle.join().is_err() {
                warn!("a server worker panicked");
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sources::testing::MockFactory;
    use crate::sources::{ChannelEntry, Identity, ReconnectPolicy, ServerInfo, SessionHandler};
    use std::time::{Duration, Instant};

    fn server(name: &str, policy: ReconnectPolicy) -> Server {
        Server::new(
            name,
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
            vec![ChannelEntry::new("#test", None)],
            policy,
        )
    }

    fn wait_until<F: Fn() -> bool>(condition: F) {
        let start = Instant::now();
        while !condition() {
            assert!(start.elapsed() < Duration::from_secs(5), "timed out");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    fn registry(factory: MockFactory) -> (ServerRegistry, Arc<MockFactory>) {
        let factory = Arc::new(factory);
        let registry = ServerRegistry::new(
            factory.clone(),
            Arc::new(EventQueue::new()),
            Arc::new(AtomicBool::new(true)),
        );
        (registry, factory)
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let (registry, _) = registry(MockFactory::blocking(Arc::new(|h: &mut dyn SessionHandler| {
            h.on_connect()
        })));
        registry.connect(server("local", ReconnectPolicy::default())).unwrap();
        match registry.connect(server("local", ReconnectPolicy::default())) {
            Err(BotError::ServerExists(name)) => assert_eq!(name, "local"),
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
        assert_eq!(registry.names(), vec!["local"]);
        registry.shutdown();
        assert!(registry.names().is_empty());
    }

    #[test]
    fn disconnect_stops_and_forgets() {
        let (registry, factory) = registry(MockFactory::blocking(Arc::new(
            |h: &mut dyn SessionHandler| h.on_connect(),
        )));
        let srv = registry.connect(server("local", ReconnectPolicy::default())).unwrap();
        wait_until(|| srv.state() == ServerState::Running);

        registry.disconnect("local").unwrap();
        assert!(!registry.contains("local"));
        wait_until(|| srv.state() == ServerState::Dead);
        assert!(factory.writer().is_closed());
        assert!(registry.disconnect("local").is_err());
        registry.shutdown();
    }

    #[test]
    fn dead_servers_are_reaped() {
        let (registry, _) = registry(MockFactory::connecting());
        let srv = registry
            .connect(server(
                "flaky",
                ReconnectPolicy {
                    enabled: false,
                    delay: 0,
                    max_retries: 0,
                },
            ))
            .unwrap();
        wait_until(|| srv.state() == ServerState::Dead);
        assert_eq!(registry.reap(), vec!["flaky"]);
        assert!(registry.get("flaky").is_err());
        registry.shutdown();
    }

    #[test]
    fn reconnect_unknown_server_fails() {
        let (registry, _) = registry(MockFactory::connecting());
        assert!(registry.reconnect(Some("nope")).is_err());
        assert!(registry.reconnect(None).is_ok());
    }
}
