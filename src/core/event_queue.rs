//! The queue of events waiting to be offered to the plugins.
//!
//! A single worker dispatches events in arrival order. An event leaves the
//! queue only once every plugin has been offered it, so plugins never see
//! two events at the same time.

use crate::core::*;
use crate::plugins::{Plugin, PluginRegistry, PluginResult};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

#[derive(Default)]
struct Inner {
    events: VecDeque<IncomingEvent>,
    stopped: bool,
}

#[derive(Default)]
pub struct EventQueue {
    inner: Mutex<Inner>,
    cond: Condvar,
}

impl EventQueue {
    pub fn new() -> EventQueue {
        EventQueue::default()
    }

    pub fn add(&self, event: IncomingEvent) {
        self.inner.lock().events.push_back(event);
        self.cond.notify_one();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().events.is_empty()
    }

    /// Copy of the events not dispatched yet.
    pub fn pending(&self) -> Vec<IncomingEvent> {
        self.inner.lock().events.iter().cloned().collect()
    }

    /// Makes the worker exit after the event in dispatch, if any.
    pub fn stop(&self) {
        self.inner.lock().stopped = true;
        self.cond.notify_all();
    }

    /// Waits for the head event without removing it. `None` once stopped.
    fn peek(&self) -> Option<IncomingEvent> {
        let mut inner = self.inner.lock();
        while inner.events.is_empty() && !inner.stopped {
            self.cond.wait(&mut inner);
        }
        if inner.stopped {
            return None;
        }
        inner.events.front().cloned()
    }

    fn pop(&self) {
        self.inner.lock().events.pop_front();
    }

    /// Starts the dispatch worker.
    pub fn start(self: &Arc<Self>, dispatcher: Dispatcher) -> io::Result<JoinHandle<()>> {
        let queue = self.clone();
        thread::Builder::new()
            .name("events".to_owned())
            .spawn(move || {
                while let Some(event) = queue.peek() {
                    dispatcher.dispatch(&event);
                    queue.pop();
                }
                debug!("event worker exiting");
            })
    }
}

pub type EventObserver = Box<dyn Fn(&IncomingEvent) + Send + Sync>;

/// Offers events to the plugins the rules allow
pub struct Dispatcher {
    rules: Arc<RuleEngine>,
    plugins: Arc<PluginRegistry>,
    api: BotApi,
    command_char: String,
    observers: Vec<EventObserver>,
}

impl Dispatcher {
    pub fn new(
        rules: Arc<RuleEngine>,
        plugins: Arc<PluginRegistry>,
        api: BotApi,
        command_char: impl Into<String>,
    ) -> Dispatcher {
        Dispatcher {
            rules,
            plugins,
            api,
            command_char: command_char.into(),
            observers: Vec::new(),
        }
    }

    /// Registers a callback receiving every event after the plugins.
    pub fn observe(&mut self, observer: EventObserver) {
        self.observers.push(observer);
    }

    pub fn dispatch(&self, event: &IncomingEvent) {
        for (name, plugin) in self.plugins.snapshot() {
            let command = self.command_for(event, &name);
            let kind = if command.is_some() {
                EventKind::Command
            } else {
                event.kind()
            };

            let solution = self.rules.solve(
                event.server(),
                event.channel(),
                event.nickname(),
                &name,
                kind,
            );
            if !solution.enabled {
                debug!("plugin {}: {} discarded by rules", name, kind);
                continue;
            }

            let api = self.api.for_plugin(&name);
            let result = panic::catch_unwind(AssertUnwindSafe(|| {
                let mut plugin = plugin.lock();
                invoke(&mut **plugin, &api, event, command.as_ref())
            }));
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("plugin {}: {}: {}", name, kind, e),
                Err(_) => warn!("plugin {}: {}: panicked", name, kind),
            }
        }

        for observer in &self.observers {
            observer(event);
        }
    }

    /// A message is a command for a plugin when it starts with the command
    /// character immediately followed by the plugin name.
    fn command_for(&self, event: &IncomingEvent, plugin: &str) -> Option<CommandEvent> {
        let ev = match *event {
            IncomingEvent::Message(ref ev) => ev,
            _ => return None,
        };
        let rest = ev
            .message
            .strip_prefix(self.command_char.as_str())?
            .strip_prefix(plugin)?;
        if !(rest.is_empty() || rest.starts_with(char::is_whitespace)) {
            return None;
        }
        Some(CommandEvent {
            server: ev.server.clone(),
            origin: ev.origin.clone(),
            channel: ev.channel.clone(),
            message: rest.trim_start().to_owned(),
        })
    }
}

fn invoke(
    plugin: &mut dyn Plugin,
    api: &BotApi,
    event: &IncomingEvent,
    command: Option<&CommandEvent>,
) -> PluginResult<()> {
    if let Some(command) = command {
        return plugin.on_command(api, command);
    }
    match *event {
        IncomingEvent::Connect(ref ev) => plugin.on_connect(api, ev),
        IncomingEvent::Message(ref ev) => plugin.on_message(api, ev),
        IncomingEvent::Me(ref ev) => plugin.on_me(api, ev),
        IncomingEvent::Notice(ref ev) => plugin.on_notice(api, ev),
        IncomingEvent::Join(ref ev) => plugin.on_join(api, ev),
        IncomingEvent::Part(ref ev) => plugin.on_part(api, ev),
        IncomingEvent::Kick(ref ev) => plugin.on_kick(api, ev),
        IncomingEvent::Nick(ref ev) => plugin.on_nick(api, ev),
        IncomingEvent::Mode(ref ev) => plugin.on_mode(api, ev),
        IncomingEvent::Topic(ref ev) => plugin.on_topic(api, ev),
        IncomingEvent::Invite(ref ev) => plugin.on_invite(api, ev),
        IncomingEvent::Names(ref ev) => plugin.on_names(api, ev),
        IncomingEvent::Whois(ref ev) => plugin.on_whois(api, ev),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::plugins::test::test_api;
    use crate::plugins::PluginError;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    type Log = Arc<Mutex<Vec<String>>>;

    /// Records every hook call and checks nothing runs concurrently
    struct Recorder {
        name: &'static str,
        log: Log,
        in_flight: Arc<AtomicUsize>,
    }

    impl Recorder {
        fn record(&self, what: String) -> PluginResult<()> {
            assert_eq!(self.in_flight.fetch_add(1, Ordering::SeqCst), 0);
            thread::sleep(Duration::from_micros(200));
            self.log.lock().push(format!("{}:{}", self.name, what));
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    impl Plugin for Recorder {
        fn on_message(&mut self, _: &BotApi, ev: &MessageEvent) -> PluginResult<()> {
            self.record(ev.message.clone())
        }
        fn on_command(&mut self, _: &BotApi, ev: &CommandEvent) -> PluginResult<()> {
            self.record(format!("command({})", ev.message))
        }
        fn on_join(&mut self, _: &BotApi, ev: &JoinEvent) -> PluginResult<()> {
            self.record(format!("join({})", ev.channel))
        }
    }

    struct Failing;

    impl Plugin for Failing {
        fn on_message(&mut self, _: &BotApi, _: &MessageEvent) -> PluginResult<()> {
            Err(PluginError::Hook("broken".to_owned()))
        }
        fn on_join(&mut self, _: &BotApi, _: &JoinEvent) -> PluginResult<()> {
            panic!("plugin bug");
        }
    }

    fn message(channel: &str, text: &str) -> IncomingEvent {
        IncomingEvent::Message(MessageEvent {
            server: "x".to_owned(),
            origin: "jean!j@host".to_owned(),
            channel: channel.to_owned(),
            message: text.to_owned(),
        })
    }

    fn join(channel: &str) -> IncomingEvent {
        IncomingEvent::Join(JoinEvent {
            server: "x".to_owned(),
            origin: "jean!j@host".to_owned(),
            channel: channel.to_owned(),
        })
    }

    fn setup(names: &[&'static str]) -> (Dispatcher, Arc<RuleEngine>, Log) {
        let plugins = Arc::new(PluginRegistry::new(HashMap::new(), HashMap::new()));
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let in_flight = Arc::new(AtomicUsize::new(0));
        for &name in names {
            plugins
                .insert(
                    name,
                    Box::new(Recorder {
                        name,
                        log: log.clone(),
                        in_flight: in_flight.clone(),
                    }),
                )
                .unwrap();
        }
        let rules = Arc::new(RuleEngine::new());
        let dispatcher = Dispatcher::new(rules.clone(), plugins, test_api(), "!");
        (dispatcher, rules, log)
    }

    #[test]
    fn commands_are_routed_to_the_named_plugin() {
        let (dispatcher, _, log) = setup(&["ask", "logger"]);
        dispatcher.dispatch(&message("#a", "!ask will it rain?"));
        dispatcher.dispatch(&message("#a", "!asking"));
        dispatcher.dispatch(&message("#a", "!ask"));
        assert_eq!(
            *log.lock(),
            vec![
                "ask:command(will it rain?)",
                "logger:!ask will it rain?",
                "ask:!asking",
                "logger:!asking",
                "ask:command()",
                "logger:!ask",
            ]
        );
    }

    #[test]
    fn rules_filter_per_plugin() {
        let (dispatcher, rules, log) = setup(&["p", "q"]);
        let mut rule = Rule::new(RuleAction::Drop);
        rule.channels.insert("#staff".to_owned());
        rule.plugins.insert("p".to_owned());
        rules.add(rule, None).unwrap();
        let mut commands = Rule::new(RuleAction::Drop);
        commands.events.insert("onCommand".to_owned());
        rules.add(commands, None).unwrap();

        dispatcher.dispatch(&message("#staff", "hi"));
        dispatcher.dispatch(&message("#public", "!q run"));
        assert_eq!(*log.lock(), vec!["q:hi", "p:!q run"]);
    }

    #[test]
    fn plugin_failures_are_contained() {
        let plugins = Arc::new(PluginRegistry::new(HashMap::new(), HashMap::new()));
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        plugins.insert("failing", Box::new(Failing)).unwrap();
        plugins
            .insert(
                "recorder",
                Box::new(Recorder {
                    name: "recorder",
                    log: log.clone(),
                    in_flight: Arc::new(AtomicUsize::new(0)),
                }),
            )
            .unwrap();
        let dispatcher = Dispatcher::new(Arc::new(RuleEngine::new()), plugins, test_api(), "!");

        dispatcher.dispatch(&message("#a", "one"));
        dispatcher.dispatch(&join("#a"));
        dispatcher.dispatch(&join("#b"));
        assert_eq!(*log.lock(), vec!["recorder:one", "recorder:join(#a)", "recorder:join(#b)"]);
    }

    #[test]
    fn observers_see_every_event() {
        let (mut dispatcher, rules, _) = setup(&["p"]);
        rules.add(Rule::new(RuleAction::Drop), None).unwrap();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        dispatcher.observe(Box::new(move |_: &IncomingEvent| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        dispatcher.dispatch(&join("#a"));
        dispatcher.dispatch(&join("#b"));
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn one_event_in_flight_with_concurrent_producers() {
        let (dispatcher, _, log) = setup(&["a", "b", "c"]);
        let queue = Arc::new(EventQueue::new());
        let worker = queue.start(dispatcher).unwrap();

        let producers: Vec<_> = (0..4)
            .map(|p| {
                let queue = queue.clone();
                thread::spawn(move || {
                    for i in 0..25 {
                        queue.add(message("#a", &format!("{}-{}", p, i)));
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().unwrap();
        }

        let start = Instant::now();
        while log.lock().len() < 300 {
            assert!(start.elapsed() < Duration::from_secs(10), "timed out");
            thread::sleep(Duration::from_millis(5));
        }
        queue.stop();
        worker.join().unwrap();

        // every event is offered to a, b and c before the next one starts
        let log = log.lock();
        for chunk in log.chunks(3) {
            let payload = |entry: &String| entry.splitn(2, ':').nth(1).map(str::to_owned);
            assert!(chunk[0].starts_with("a:"));
            assert!(chunk[1].starts_with("b:"));
            assert!(chunk[2].starts_with("c:"));
            assert_eq!(payload(&chunk[0]), payload(&chunk[1]));
            assert_eq!(payload(&chunk[1]), payload(&chunk[2]));
        }
        assert!(queue.is_empty());
    }
}
