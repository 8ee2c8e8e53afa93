//! Client sessions. A channel holds at most one subscription at a time.

use std::sync::Arc;

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::broker::engine::Broker;
use crate::core::consumer::{Consumer, Deliver};
use crate::core::message::BasicProperties;
use crate::core::{Arguments, BrokerError, ExchangeType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Open,
    Subscribed,
    Closed,
}

#[derive(Debug)]
struct Session {
    state: ChannelState,
    consumer: Option<Arc<Consumer>>,
}

pub struct Channel {
    id: String,
    broker: Arc<Broker>,
    sink: Arc<dyn Deliver>,
    session: Mutex<Session>,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}

impl Channel {
    /// `sink` receives every message delivered to this channel's consumer.
    pub fn new(id: impl Into<String>, broker: Arc<Broker>, sink: Arc<dyn Deliver>) -> Self {
        Self {
            id: id.into(),
            broker,
            sink,
            session: Mutex::new(Session {
                state: ChannelState::Open,
                consumer: None,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> ChannelState {
        self.session.lock().state
    }

    fn is_closed(&self) -> bool {
        self.state() == ChannelState::Closed
    }

    pub fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeType,
        durable: bool,
        auto_delete: bool,
        args: Arguments,
    ) -> bool {
        !self.is_closed()
            && self
                .broker
                .declare_exchange(name, kind, durable, auto_delete, args)
    }

    pub fn delete_exchange(&self, name: &str) -> bool {
        !self.is_closed() && self.broker.delete_exchange(name)
    }

    pub fn declare_queue(
        &self,
        name: &str,
        durable: bool,
        exclusive: bool,
        auto_delete: bool,
        args: Arguments,
    ) -> bool {
        !self.is_closed()
            && self
                .broker
                .declare_queue(name, durable, exclusive, auto_delete, args)
    }

    pub fn delete_queue(&self, name: &str) -> bool {
        !self.is_closed() && self.broker.delete_queue(name)
    }

    pub fn queue_bind(&self, exchange: &str, queue: &str, binding_key: &str) -> bool {
        !self.is_closed() && self.broker.bind(exchange, queue, binding_key)
    }

    pub fn queue_unbind(&self, exchange: &str, queue: &str) -> bool {
        !self.is_closed() && self.broker.unbind(exchange, queue)
    }

    pub fn basic_publish(&self, exchange: &str, properties: BasicProperties, body: Bytes) -> bool {
        !self.is_closed() && self.broker.publish(exchange, properties, body)
    }

    pub fn basic_ack(&self, queue: &str, msg_id: &str) -> bool {
        !self.is_closed() && self.broker.ack(queue, msg_id)
    }

    /// Subscribes this channel to `queue` under `tag`. Fails without side
    /// effects unless the channel is `Open`.
    pub fn basic_consume(&self, tag: &str, queue: &str, auto_ack: bool) -> bool {
        let mut session = self.session.lock();
        match session.state {
            ChannelState::Open => {}
            ChannelState::Subscribed => {
                warn!(
                    target: "relaymq::channel",
                    channel = %self.id,
                    "{}",
                    BrokerError::Conflict(format!("channel already subscribed; rejecting consumer {tag}"))
                );
                return false;
            }
            ChannelState::Closed => return false,
        }

        let Some(consumer) = self
            .broker
            .subscribe(tag, queue, auto_ack, Arc::clone(&self.sink))
        else {
            return false;
        };
        debug!(target: "relaymq::channel", channel = %self.id, tag, queue, "Consumer subscribed");
        session.consumer = Some(consumer);
        session.state = ChannelState::Subscribed;
        true
    }

    /// Drops the channel's subscription, if any.
    pub fn basic_cancel(&self) -> bool {
        let mut session = self.session.lock();
        self.cancel_locked(&mut session);
        true
    }

    fn cancel_locked(&self, session: &mut Session) {
        if let Some(consumer) = session.consumer.take() {
            self.broker.cancel(&consumer.tag, &consumer.queue);
            debug!(target: "relaymq::channel", channel = %self.id, tag = %consumer.tag, "Consumer cancelled");
        }
        if session.state == ChannelState::Subscribed {
            session.state = ChannelState::Open;
        }
    }

    /// Cancels any subscription and refuses further requests.
    pub fn close(&self) {
        let mut session = self.session.lock();
        self.cancel_locked(&mut session);
        session.state = ChannelState::Closed;
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.close();
    }
}

/// Channels of one connection, keyed by channel id.
#[derive(Debug, Default)]
pub struct ChannelManager {
    channels: DashMap<String, Arc<Channel>>,
}

impl ChannelManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a channel. Returns `false` if the id is already in use.
    pub fn open(&self, id: &str, broker: Arc<Broker>, sink: Arc<dyn Deliver>) -> bool {
        match self.channels.entry(id.to_string()) {
            Entry::Occupied(_) => {
                warn!(target: "relaymq::channel", "{}", BrokerError::Conflict(format!("channel {id} already open")));
                false
            }
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(Channel::new(id, broker, sink)));
                true
            }
        }
    }

    pub fn close(&self, id: &str) {
        if let Some((_, channel)) = self.channels.remove(id) {
            channel.close();
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<Channel>> {
        self.channels.get(id).map(|c| Arc::clone(c.value()))
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn close_all(&self) {
        let ids: Vec<String> = self.channels.iter().map(|c| c.key().clone()).collect();
        for id in ids {
            self.close(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeliveryConfig;
    use crate::core::VirtualHost;
    use tempfile::TempDir;

    fn broker(dir: &TempDir) -> Arc<Broker> {
        let vhost = VirtualHost::open("test", dir.path()).unwrap();
        Arc::new(Broker::new(vhost, &DeliveryConfig::default()).unwrap())
    }

    fn sink() -> Arc<dyn Deliver> {
        Arc::new(|_: &str, _: &BasicProperties, _: &Bytes| {})
    }

    #[test]
    fn single_subscription_state_machine() {
        let dir = TempDir::new().unwrap();
        let b = broker(&dir);
        b.declare_queue("q", false, false, false, Arguments::new());
        let ch = Channel::new("ch1", Arc::clone(&b), sink());

        assert_eq!(ch.state(), ChannelState::Open);
        assert!(!ch.basic_consume("c1", "missing", false));
        assert_eq!(ch.state(), ChannelState::Open);

        assert!(ch.basic_consume("c1", "q", false));
        assert_eq!(ch.state(), ChannelState::Subscribed);
        assert!(!ch.basic_consume("c2", "q", false));

        assert!(ch.basic_cancel());
        assert_eq!(ch.state(), ChannelState::Open);
        assert!(ch.basic_cancel());

        assert!(ch.basic_consume("c2", "q", true));
        ch.close();
        assert_eq!(ch.state(), ChannelState::Closed);
        assert!(!ch.basic_consume("c3", "q", false));
        assert!(!ch.declare_queue("q2", false, false, false, Arguments::new()));
    }

    #[test]
    fn closing_channel_frees_consumer_tag() {
        let dir = TempDir::new().unwrap();
        let b = broker(&dir);
        b.declare_queue("q", false, false, false, Arguments::new());

        let mgr = ChannelManager::new();
        assert!(mgr.open("a", Arc::clone(&b), sink()));
        assert!(!mgr.open("a", Arc::clone(&b), sink()));
        assert!(mgr.get("a").unwrap().basic_consume("tag", "q", false));

        let other = Channel::new("b", Arc::clone(&b), sink());
        assert!(!other.basic_consume("tag", "q", false));

        mgr.close("a");
        assert!(mgr.get("a").is_none());
        assert!(other.basic_consume("tag", "q", false));
    }

    #[test]
    fn close_all_empties_manager() {
        let dir = TempDir::new().unwrap();
        let b = broker(&dir);
        let mgr = ChannelManager::new();
        mgr.open("a", Arc::clone(&b), sink());
        mgr.open("b", Arc::clone(&b), sink());
        assert_eq!(mgr.len(), 2);
        mgr.close_all();
        assert!(mgr.is_empty());
    }
}
