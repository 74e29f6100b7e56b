//! Retained message store
//!
//! Keeps the last payload published with the retain flag for each exact
//! topic. Entries are overwritten unconditionally and live as long as the
//! owning broker instance.

use std::collections::BTreeMap;

use bytes::Bytes;

use crate::broker::topic::topic_matches;

#[derive(Debug, Default, Clone)]
pub struct RetainedStore {
    entries: BTreeMap<String, Bytes>,
}

impl RetainedStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last-write-wins.
    pub fn put(&mut self, topic: &str, payload: Bytes) {
        self.entries.insert(topic.to_string(), payload);
    }

    /// The payload last retained on exactly `topic`.
    pub fn get(&self, topic: &str) -> Option<Bytes> {
        self.entries.get(topic).cloned()
    }

    /// Entries selected by `filter`, ordered by topic.
    pub fn matching_entries(&self, filter: &str) -> Vec<(String, Bytes)> {
        self.entries
            .iter()
            .filter(|(topic, _)| topic_matches(topic, filter))
            .map(|(topic, payload)| (topic.clone(), payload.clone()))
            .collect()
    }

    /// Number of retained topics.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
