//! Topic filters a connection wants, replayed after every new session

use crate::types::Qos;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionSet {
    filters: BTreeMap<String, Qos>,
}

impl SubscriptionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `topics` at `qos` and return the ones not already held at that QoS
    pub fn merge(&mut self, topics: &[String], qos: Qos) -> Vec<(String, Qos)> {
        let mut changed = Vec::new();
        for topic in topics {
            if self.filters.insert(topic.clone(), qos) != Some(qos) {
                changed.push((topic.clone(), qos));
            }
        }
        changed
    }

    pub fn remove(&mut self, topics: &[String]) {
        for topic in topics {
            self.filters.remove(topic);
        }
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.filters.contains_key(topic)
    }

    pub fn qos(&self, topic: &str) -> Option<Qos> {
        self.filters.get(topic).copied()
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn filters(&self) -> Vec<(String, Qos)> {
        self.filters
            .iter()
            .map(|(topic, qos)| (topic.clone(), *qos))
            .collect()
    }
}
