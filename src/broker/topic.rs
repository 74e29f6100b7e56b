//! Topic routing
//!
//! A `Topic` holds the ordered list of subscriber handles registered under one
//! filter, and `TopicRouter` holds every `Topic` in registration order.
//! Duplicate subscriptions of a handle to the same filter are a no-op.
//!
//! Only two wildcard forms are evaluated: the bare `#`, and a filter ending in
//! `#` whose remaining characters must be a literal prefix of the topic. A
//! `+` is an ordinary character.
//!
//! Concurrency note: callers must synchronize access to `TopicRouter` (for
//! example via the broker lock) when modifying subscriptions.

pub type SubscriberId = String;

pub const MULTI_LEVEL_WILDCARD: &str = "#";

/// Returns true when `filter` selects `topic`.
pub fn topic_matches(topic: &str, filter: &str) -> bool {
    if filter == topic || filter == MULTI_LEVEL_WILDCARD {
        return true;
    }
    match filter.strip_suffix(MULTI_LEVEL_WILDCARD) {
        // `sensor/#` keeps its `/`, so `sensor` alone is not selected
        Some(prefix) => topic.starts_with(prefix),
        None => false,
    }
}

#[derive(Debug, Clone)]
pub struct Topic<H> {
    pub name: String,
    pub subscribers: Vec<H>,
}

impl<H: PartialEq> Topic<H> {
    /// Create a new topic filter entry with no subscribers.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            subscribers: Vec::new(),
        }
    }

    /// Add a subscriber to the topic. Duplicate adds are ignored.
    pub fn subscribe(&mut self, id: H) {
        if !self.subscribers.contains(&id) {
            self.subscribers.push(id);
        }
    }

    /// Remove a subscriber from the topic.
    pub fn unsubscribe(&mut self, id: &H) {
        self.subscribers.retain(|s| s != id);
    }
}

/// Subscription registry mapping filters to subscriber handles.
#[derive(Debug, Clone)]
pub struct TopicRouter<H = SubscriberId> {
    topics: Vec<Topic<H>>,
}

impl<H> Default for TopicRouter<H> {
    fn default() -> Self {
        Self { topics: Vec::new() }
    }
}

impl<H: Clone + PartialEq> TopicRouter<H> {
    /// Creates an empty router.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handle` under `filter`. Registering the same pair twice is
    /// a no-op.
    pub fn subscribe(&mut self, filter: &str, handle: H) {
        match self.topics.iter_mut().find(|t| t.name == filter) {
            Some(topic) => topic.subscribe(handle),
            None => {
                let mut topic = Topic::new(filter);
                topic.subscribe(handle);
                self.topics.push(topic);
            }
        }
    }

    /// Removes `handle` from `filter`, dropping the filter once it is empty.
    pub fn unsubscribe(&mut self, filter: &str, handle: &H) {
        if let Some(topic) = self.topics.iter_mut().find(|t| t.name == filter) {
            topic.unsubscribe(handle);
        }
        self.topics.retain(|t| !t.subscribers.is_empty());
    }

    /// Handles whose filters match `topic`, in registration order. A handle
    /// matched through several filters is listed once.
    pub fn publish(&self, topic: &str) -> Vec<H> {
        let mut matched: Vec<H> = Vec::new();
        for entry in self.topics.iter().filter(|t| topic_matches(topic, &t.name)) {
            for handle in &entry.subscribers {
                if !matched.contains(handle) {
                    matched.push(handle.clone());
                }
            }
        }
        matched
    }

    /// Drops every subscription held by `handle`. Returns the filters it held.
    pub fn remove_all_for(&mut self, handle: &H) -> Vec<String> {
        let mut removed = Vec::new();
        for topic in self.topics.iter_mut() {
            if topic.subscribers.contains(handle) {
                topic.unsubscribe(handle);
                removed.push(topic.name.clone());
            }
        }
        self.topics.retain(|t| !t.subscribers.is_empty());
        removed
    }

    /// True while `handle` owns at least one subscription.
    pub fn holds(&self, handle: &H) -> bool {
        self.topics.iter().any(|t| t.subscribers.contains(handle))
    }

    /// Registered filters, in registration order.
    pub fn filters(&self) -> impl Iterator<Item = &str> {
        self.topics.iter().map(|t| t.name.as_str())
    }

    /// Handles registered under exactly `filter`.
    pub fn subscribers_of(&self, filter: &str) -> Option<&[H]> {
        self.topics
            .iter()
            .find(|t| t.name == filter)
            .map(|t| t.subscribers.as_slice())
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }
}
