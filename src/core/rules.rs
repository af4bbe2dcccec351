//! Rules deciding whether an event reaches a plugin.
//!
//! Every rule is a set of criteria plus an action. Rules are evaluated in
//! order and the *last* one whose criteria all match decides, so a broad
//! rule appended after a narrow one overrides it. An empty criterion matches
//! anything.

use crate::core::EventKind;
use parking_lot::RwLock;
use std::collections::BTreeSet;
use std::str::FromStr;

quick_error! {
    #[derive(Debug, PartialEq)]
    pub enum RuleError {
        NotFound(index: usize) {
            display("rule {} not found", index)
        }
        InvalidEvent(name: String) {
            display("invalid event name: {}", name)
        }
        InvalidAction(name: String) {
            display("invalid action: {}", name)
        }
    }
}

pub type RuleResult<T> = Result<T, RuleError>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    Accept,
    Drop,
}

impl Default for RuleAction {
    fn default() -> RuleAction {
        RuleAction::Accept
    }
}

impl FromStr for RuleAction {
    type Err = RuleError;

    fn from_str(s: &str) -> RuleResult<RuleAction> {
        match s {
            "accept" => Ok(RuleAction::Accept),
            "drop" => Ok(RuleAction::Drop),
            _ => Err(RuleError::InvalidAction(s.to_owned())),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Rule {
    pub servers: BTreeSet<String>,
    pub channels: BTreeSet<String>,
    pub origins: BTreeSet<String>,
    pub plugins: BTreeSet<String>,
    pub events: BTreeSet<String>,
    pub action: RuleAction,
    /// Encoding outgoing text should be converted to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
}

fn matches(set: &BTreeSet<String>, value: &str) -> bool {
    set.is_empty() || set.contains(value)
}

impl Rule {
    pub fn new(action: RuleAction) -> Rule {
        Rule {
            action,
            ..Rule::default()
        }
    }

    /// Checks that every event name is a known hook.
    pub fn validate(&self) -> RuleResult<()> {
        for event in &self.events {
            if EventKind::from_str(event).is_err() {
                return Err(RuleError::InvalidEvent(event.clone()));
            }
        }
        Ok(())
    }

    pub fn matches(
        &self,
        server: &str,
        channel: &str,
        nickname: &str,
        plugin: &str,
        kind: EventKind,
    ) -> bool {
        matches(&self.servers, server)
            && matches(&self.channels, channel)
            && matches(&self.origins, nickname)
            && matches(&self.plugins, plugin)
            && matches(&self.events, kind.as_str())
    }
}

/// Outcome of evaluating the rules for one candidate
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Solution {
    pub enabled: bool,
    pub recode_hint: Option<String>,
}

#[derive(Debug, Default)]
pub struct RuleEngine {
    rules: RwLock<Vec<Rule>>,
}

impl RuleEngine {
    pub fn new() -> RuleEngine {
        RuleEngine::default()
    }

    pub fn solve(
        &self,
        server: &str,
        channel: &str,
        nickname: &str,
        plugin: &str,
        kind: EventKind,
    ) -> Solution {
        let mut solution = Solution {
            enabled: true,
            recode_hint: None,
        };
        for rule in self.rules.read().iter() {
            if rule.matches(server, channel, nickname, plugin, kind) {
                solution.enabled = rule.action == RuleAction::Accept;
                if let Some(ref encoding) = rule.encoding {
                    solution.recode_hint = Some(encoding.clone());
                }
            }
        }
        solution
    }

    /// Inserts the rule at `index`, or appends it when there is no index or
    /// the index is past the end. Returns the position of the rule.
    pub fn add(&self, rule: Rule, index: Option<usize>) -> RuleResult<usize> {
        rule.validate()?;
        let mut rules = self.rules.write();
        match index {
            Some(i) if i < rules.len() => {
                rules.insert(i, rule);
                Ok(i)
            }
            _ => {
                rules.push(rule);
                Ok(rules.len() - 1)
            }
        }
    }

    pub fn remove(&self, index: usize) -> RuleResult<Rule> {
        let mut rules = self.rules.write();
        if index >= rules.len() {
            return Err(RuleError::NotFound(index));
        }
        Ok(rules.remove(index))
    }

    pub fn get(&self, index: usize) -> RuleResult<Rule> {
        self.rules
            .read()
            .get(index)
            .cloned()
            .ok_or(RuleError::NotFound(index))
    }

    /// Moves a rule from one position to another, `to` past the end moves
    /// the rule to the end.
    pub fn move_rule(&self, from: usize, to: usize) -> RuleResult<()> {
        let mut rules = self.rules.write();
        if from >= rules.len() {
            return Err(RuleError::NotFound(from));
        }
        let rule = rules.remove(from);
        let to = to.min(rules.len());
        rules.insert(to, rule);
        Ok(())
    }

    pub fn list(&self) -> Vec<Rule> {
        self.rules.read().clone()
    }

    pub fn len(&self) -> usize {
        self.rules.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.read().is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| (*s).to_owned()).collect()
    }

    #[test]
    fn empty_list_allows_everything() {
        let engine = RuleEngine::new();
        let solution = engine.solve("x", "#a", "jean", "p", EventKind::Message);
        assert!(solution.enabled);
        assert_eq!(solution.recode_hint, None);
    }

    #[test]
    fn later_broad_rule_overrides_earlier_narrow_one() {
        let engine = RuleEngine::new();
        let mut staff = Rule::new(RuleAction::Drop);
        staff.channels = set(&["#staff"]);
        engine.add(staff, None).unwrap();

        let solution = engine.solve("x", "#staff", "", "p", EventKind::Command);
        assert!(!solution.enabled);

        let mut accept = Rule::new(RuleAction::Accept);
        accept.servers = set(&["x"]);
        accept.channels = set(&["#staff"]);
        engine.add(accept, None).unwrap();

        let solution = engine.solve("x", "#staff", "", "p", EventKind::Command);
        assert!(solution.enabled);
    }

    #[test]
    fn no_first_match_shortcut() {
        let engine = RuleEngine::new();
        engine.add(Rule::new(RuleAction::Drop), None).unwrap();
        let mut narrow = Rule::new(RuleAction::Accept);
        narrow.plugins = set(&["logger"]);
        engine.add(narrow, None).unwrap();
        engine.add(Rule::new(RuleAction::Drop), None).unwrap();

        assert!(!engine.solve("x", "#a", "", "logger", EventKind::Join).enabled);
        engine.remove(2).unwrap();
        assert!(engine.solve("x", "#a", "", "logger", EventKind::Join).enabled);
        assert!(!engine.solve("x", "#a", "", "other", EventKind::Join).enabled);
    }

    #[test]
    fn every_criterion_must_match() {
        let engine = RuleEngine::new();
        let mut rule = Rule::new(RuleAction::Drop);
        rule.servers = set(&["x"]);
        rule.origins = set(&["spammer"]);
        rule.events = set(&["onMessage", "onMe"]);
        engine.add(rule, None).unwrap();

        assert!(!engine.solve("x", "#a", "spammer", "p", EventKind::Message).enabled);
        assert!(!engine.solve("x", "#b", "spammer", "q", EventKind::Me).enabled);
        assert!(engine.solve("y", "#a", "spammer", "p", EventKind::Message).enabled);
        assert!(engine.solve("x", "#a", "jean", "p", EventKind::Message).enabled);
        assert!(engine.solve("x", "#a", "spammer", "p", EventKind::Join).enabled);
    }

    #[test]
    fn last_matching_encoding_is_reported() {
        let engine = RuleEngine::new();
        let mut first = Rule::new(RuleAction::Accept);
        first.encoding = Some("utf-8".to_owned());
        engine.add(first, None).unwrap();
        let mut second = Rule::new(RuleAction::Accept);
        second.channels = set(&["#legacy"]);
        second.encoding = Some("latin1".to_owned());
        engine.add(second, None).unwrap();

        let hint = engine.solve("x", "#legacy", "", "p", EventKind::Message).recode_hint;
        assert_eq!(hint.as_deref(), Some("latin1"));
        let hint = engine.solve("x", "#new", "", "p", EventKind::Message).recode_hint;
        assert_eq!(hint.as_deref(), Some("utf-8"));
    }

    #[test]
    fn add_inserts_at_index_or_appends() {
        let engine = RuleEngine::new();
        assert_eq!(engine.add(Rule::new(RuleAction::Drop), None), Ok(0));
        assert_eq!(engine.add(Rule::new(RuleAction::Accept), Some(0)), Ok(0));
        assert_eq!(engine.add(Rule::new(RuleAction::Drop), Some(42)), Ok(2));
        let actions: Vec<_> = engine.list().iter().map(|r| r.action).collect();
        assert_eq!(
            actions,
            vec![RuleAction::Accept, RuleAction::Drop, RuleAction::Drop]
        );
    }

    #[test]
    fn out_of_range_is_not_found() {
        let engine = RuleEngine::new();
        assert_eq!(engine.get(0), Err(RuleError::NotFound(0)));
        assert_eq!(engine.remove(3), Err(RuleError::NotFound(3)));
        assert_eq!(engine.move_rule(1, 0), Err(RuleError::NotFound(1)));
        engine.add(Rule::new(RuleAction::Drop), None).unwrap();
        assert_eq!(engine.get(0).map(|r| r.action), Ok(RuleAction::Drop));
    }

    #[test]
    fn move_changes_priority() {
        let engine = RuleEngine::new();
        engine.add(Rule::new(RuleAction::Drop), None).unwrap();
        engine.add(Rule::new(RuleAction::Accept), None).unwrap();
        assert!(engine.solve("x", "", "", "p", EventKind::Connect).enabled);
        engine.move_rule(0, 10).unwrap();
        assert!(!engine.solve("x", "", "", "p", EventKind::Connect).enabled);
    }

    #[test]
    fn unknown_event_is_rejected() {
        let engine = RuleEngine::new();
        let mut rule = Rule::new(RuleAction::Drop);
        rule.events = set(&["onQuit"]);
        assert_eq!(
            engine.add(rule, None),
            Err(RuleError::InvalidEvent("onQuit".to_owned()))
        );
        assert!(engine.is_empty());
    }

    #[test]
    fn concurrent_readers_and_writer() {
        let engine = Arc::new(RuleEngine::new());
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let engine = engine.clone();
                thread::spawn(move || {
                    for _ in 0..1000 {
                        let _ = engine.solve("x", "#a", "n", "p", EventKind::Message);
                    }
                })
            })
            .collect();
        for _ in 0..100 {
            engine.add(Rule::new(RuleAction::Accept), None).unwrap();
        }
        for reader in readers {
            reader.join().unwrap();
        }
        assert_eq!(engine.len(), 100);
    }
}
