//! Destination detection rules per inbound tag.
//!
//! A tag's rule list is an immutable `Arc<[DetectRule]>` swapped wholesale
//! on update, so an evaluation always sees either the old or the new list.
//! Hits are collected in a bounded, de-duplicated set that the reporting
//! cycle drains.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use regex::Regex;
use serde::Serialize;

use crate::config::DEFAULT_DETECT_RESULT_CAPACITY;

/// A pattern matched against routed destinations.
#[derive(Debug, Clone)]
pub struct DetectRule {
    pub id: u32,
    pub pattern: Regex,
}

impl DetectRule {
    pub fn new(id: u32, pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            id,
            pattern: Regex::new(pattern)?,
        })
    }
}

impl PartialEq for DetectRule {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.pattern.as_str() == other.pattern.as_str()
    }
}

impl Eq for DetectRule {}

/// A user that hit a rule since the last drain.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct DetectResult {
    pub user: String,
    pub rule_id: u32,
}

/// Rule sets and detection results of all inbound tags.
pub struct RuleManager {
    rules: DashMap<String, Arc<[DetectRule]>>,
    results: DashMap<String, HashSet<DetectResult>>,
    capacity: usize,
}

impl Default for RuleManager {
    fn default() -> Self {
        Self::new(DEFAULT_DETECT_RESULT_CAPACITY)
    }
}

impl RuleManager {
    /// Creates a manager keeping at most `capacity` pending results per tag.
    pub fn new(capacity: usize) -> Self {
        Self {
            rules: DashMap::new(),
            results: DashMap::new(),
            capacity,
        }
    }

    /// Replaces the rule list of `tag`. An identical list is left in place.
    pub fn update_rule(&self, tag: &str, rules: Vec<DetectRule>) {
        if let Some(current) = self.rules.get(tag)
            && current.value().as_ref() == rules.as_slice()
        {
            return;
        }
        let count = rules.len();
        self.rules.insert(tag.to_owned(), rules.into());
        tracing::debug!(tag = %tag, rules = count, "detection rules replaced");
    }

    /// Current rule list of `tag` (empty if none).
    pub fn rules(&self, tag: &str) -> Arc<[DetectRule]> {
        self.rules
            .get(tag)
            .map_or_else(|| Arc::from(Vec::new()), |e| Arc::clone(e.value()))
    }

    /// Matches `destination` against the rules of `tag`. The first matching
    /// rule wins and is recorded for `user` unless the tag's result set is
    /// full.
    pub fn detect(&self, tag: &str, destination: &str, user: &str) -> Detection {
        let rules = match self.rules.get(tag) {
            Some(entry) => Arc::clone(entry.value()),
            None => return Detection::Clean,
        };
        let Some(rule) = rules.iter().find(|r| r.pattern.is_match(destination)) else {
            return Detection::Clean;
        };

        let result = DetectResult {
            user: user.to_owned(),
            rule_id: rule.id,
        };
        let mut set = self.results.entry(tag.to_owned()).or_default();
        if set.contains(&result) || set.len() < self.capacity {
            set.insert(result);
            Detection::Hit { rule_id: rule.id }
        } else {
            Detection::HitUnrecorded { rule_id: rule.id }
        }
    }

    /// Takes all pending results of `tag`, leaving it empty.
    pub fn get_detect_result(&self, tag: &str) -> Vec<DetectResult> {
        self.results
            .remove(tag)
            .map(|(_, set)| set.into_iter().collect())
            .unwrap_or_default()
    }

    /// Drops rules and pending results of a tag.
    pub fn remove_tag(&self, tag: &str) {
        self.rules.remove(tag);
        self.results.remove(tag);
    }
}

/// Outcome of [`RuleManager::detect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Detection {
    Clean,
    Hit { rule_id: u32 },
    /// Matched, but the result set was full.
    HitUnrecorded { rule_id: u32 },
}

impl Detection {
    pub fn is_hit(self) -> bool {
        !matches!(self, Self::Clean)
    }
}
