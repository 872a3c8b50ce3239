use parking_lot::RwLock;
use tokio::sync::broadcast;

use crate::BusMessage;

const SUBSCRIBER_CAPACITY: usize = 64;

/// Returns true when `topic` is matched by `filter`.
///
/// `+` matches a single segment, `#` matches the rest of the topic (including
/// nothing) and is only honoured as the last segment.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut topic_segments = topic.split('/');
    let mut filter_segments = filter.split('/').peekable();
    while let Some(segment) = filter_segments.next() {
        if segment == "#" && filter_segments.peek().is_none() {
            return true;
        }
        match topic_segments.next() {
            Some(actual) if segment == "+" || segment == actual => continue,
            _ => return false,
        }
    }
    topic_segments.next().is_none()
}

#[derive(Debug)]
struct Subscription {
    filter: String,
    sender: broadcast::Sender<BusMessage>,
}

/// Fan-out of published messages to filter subscriptions.
#[derive(Debug, Default)]
pub struct TopicRouter {
    subscriptions: RwLock<Vec<Subscription>>,
}

impl TopicRouter {
    pub fn subscribe(&self, filter: &str) -> broadcast::Receiver<BusMessage> {
        let mut guard = self.subscriptions.write();
        guard.retain(|sub| sub.sender.receiver_count() > 0);
        if let Some(existing) = guard.iter().find(|sub| sub.filter == filter) {
            return existing.sender.subscribe();
        }
        let (sender, receiver) = broadcast::channel(SUBSCRIBER_CAPACITY);
        guard.push(Subscription {
            filter: filter.to_string(),
            sender,
        });
        receiver
    }

    /// Delivers `message` to every matching subscription and returns how many
    /// subscriptions accepted it.
    pub fn dispatch(&self, message: BusMessage) -> usize {
        let guard = self.subscriptions.read();
        guard
            .iter()
            .filter(|sub| topic_matches(&sub.filter, &message.topic))
            .filter(|sub| sub.sender.send(message.clone()).is_ok())
            .count()
    }

    /// Filters with at least one live receiver.
    #[cfg(test)]
    fn filters(&self) -> Vec<String> {
        self.subscriptions
            .read()
            .iter()
            .filter(|sub| sub.sender.receiver_count() > 0)
            .map(|sub| sub.filter.clone())
            .collect()
    }
}
