use std::collections::HashMap;
use tokio::sync::mpsc;
use voicecore::protocol::{MessageType, SignalingMessage};

/// Dispatches incoming control messages to subscribers by message type.
///
/// A message is delivered to every subscriber of its type, in subscription
/// order. Subscribers whose receiver was dropped are pruned on dispatch.
pub(crate) struct MessageRouter {
    routes: HashMap<MessageType, Vec<mpsc::UnboundedSender<SignalingMessage>>>,
}

impl MessageRouter {
    pub fn new() -> Self {
        Self {
            routes: HashMap::new(),
        }
    }

    pub fn subscribe(&mut self, types: &[MessageType], tx: mpsc::UnboundedSender<SignalingMessage>) {
        for kind in types {
            self.routes.entry(*kind).or_default().push(tx.clone());
        }
    }

    /// Returns `true` if at least one subscriber received the message.
    pub fn dispatch(&mut self, msg: &SignalingMessage) -> bool {
        let Some(subscribers) = self.routes.get_mut(&msg.message_type()) else {
            return false;
        };
        subscribers.retain(|tx| !tx.is_closed());
        let mut delivered = false;
        for tx in subscribers.iter() {
            delivered |= tx.send(msg.clone()).is_ok();
        }
        delivered
    }

    pub fn clear(&mut self) {
        self.routes.clear();
    }

    /// Get the number of live subscriptions (useful for testing).
    #[cfg(test)]
    fn subscription_count(&self) -> usize {
        self.routes
            .values()
            .flatten()
            .filter(|tx| !tx.is_closed())
            .count()
    }
}

impl Default for MessageRouter {
    fn default() -> Self {
        Self::new()
    }
}
