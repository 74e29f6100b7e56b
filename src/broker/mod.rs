pub mod engine;
pub mod message;
pub mod retained;
pub mod topic;

pub use engine::InProcessBroker;
pub use message::{Callback, CallbackResult, Message};
pub use retained::RetainedStore;
pub use topic::{SubscriberId, TopicRouter, topic_matches};
