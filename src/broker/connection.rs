//! Transport connections and the channels multiplexed over them.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::broker::channel::{Channel, ChannelManager};
use crate::broker::engine::Broker;
use crate::broker::protocol::Response;
use crate::core::consumer::Deliver;
use crate::core::message::BasicProperties;

pub type ConnectionId = u64;

/// One client connection. Responses and deliveries for every channel are
/// queued on a single outbound sender drained by the connection's writer.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    peer: SocketAddr,
    broker: Arc<Broker>,
    outbound: mpsc::UnboundedSender<Response>,
    channels: ChannelManager,
}

impl Connection {
    pub fn new(
        id: ConnectionId,
        peer: SocketAddr,
        broker: Arc<Broker>,
        outbound: mpsc::UnboundedSender<Response>,
    ) -> Self {
        Self {
            id,
            peer,
            broker,
            outbound,
            channels: ChannelManager::new(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn open_channel(&self, cid: &str) -> bool {
        let sink: Arc<dyn Deliver> = Arc::new(ChannelSink {
            cid: cid.to_string(),
            outbound: self.outbound.clone(),
        });
        self.channels.open(cid, Arc::clone(&self.broker), sink)
    }

    pub fn close_channel(&self, cid: &str) {
        self.channels.close(cid);
    }

    pub fn channel(&self, cid: &str) -> Option<Arc<Channel>> {
        self.channels.get(cid)
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Queues a response for the writer. Returns `false` once the writer is
    /// gone.
    pub fn send(&self, response: Response) -> bool {
        self.outbound.send(response).is_ok()
    }

    /// Closes every channel, cancelling their consumers.
    pub fn close(&self) {
        self.channels.close_all();
    }
}

/// Turns consumer deliveries into `Deliver` responses for one channel.
struct ChannelSink {
    cid: String,
    outbound: mpsc::UnboundedSender<Response>,
}

impl Deliver for ChannelSink {
    fn deliver(&self, consumer_tag: &str, properties: &BasicProperties, body: &Bytes) {
        let response = Response::deliver(self.cid.clone(), consumer_tag, properties, body.clone());
        if self.outbound.send(response).is_err() {
            debug!(target: "relaymq::connection", channel = %self.cid, "Delivery to closed connection dropped");
        }
    }
}

/// Live connections, keyed by a server-assigned id.
#[derive(Debug, Default)]
pub struct ConnectionManager {
    next_id: AtomicU64,
    connections: DashMap<ConnectionId, Arc<Connection>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        peer: SocketAddr,
        broker: Arc<Broker>,
        outbound: mpsc::UnboundedSender<Response>,
    ) -> Arc<Connection> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let conn = Arc::new(Connection::new(id, peer, broker, outbound));
        self.connections.insert(id, Arc::clone(&conn));
        info!(target: "relaymq::connection", id, %peer, "Connection registered");
        conn
    }

    /// Removes a connection and closes its channels.
    pub fn remove(&self, id: ConnectionId) {
        if let Some((_, conn)) = self.connections.remove(&id) {
            conn.close();
            info!(target: "relaymq::connection", id, peer = %conn.peer(), "Connection closed");
        }
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections.get(&id).map(|c| Arc::clone(c.value()))
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn close_all(&self) {
        let ids: Vec<ConnectionId> = self.connections.iter().map(|c| *c.key()).collect();
        for id in ids {
            self.remove(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::protocol::response;
    use crate::config::DeliveryConfig;
    use crate::core::{Arguments, DeliveryMode, ExchangeType, VirtualHost};
    use tempfile::TempDir;

    fn broker(dir: &TempDir) -> Arc<Broker> {
        let vhost = VirtualHost::open("test", dir.path()).unwrap();
        Arc::new(Broker::new(vhost, &DeliveryConfig::default()).unwrap())
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    #[test]
    fn deliveries_are_tagged_with_channel_id() {
        let dir = TempDir::new().unwrap();
        let b = broker(&dir);
        b.declare_exchange("ex", ExchangeType::Direct, false, false, Arguments::new());
        b.declare_queue("q", false, false, false, Arguments::new());
        b.bind("ex", "q", "k");

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mgr = ConnectionManager::new();
        let conn = mgr.register(peer(), Arc::clone(&b), tx);
        assert!(conn.open_channel("ch"));
        assert!(!conn.open_channel("ch"));
        assert!(conn.channel("ch").unwrap().basic_consume("tag", "q", true));

        b.publish(
            "ex",
            BasicProperties::new("k", DeliveryMode::Undurable),
            Bytes::from_static(b"hi"),
        );
        b.shutdown();

        match rx.try_recv().unwrap().body {
            Some(response::Body::Deliver(d)) => {
                assert_eq!(d.cid, "ch");
                assert_eq!(d.consumer_tag, "tag");
                assert_eq!(d.body, Bytes::from_static(b"hi"));
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[test]
    fn removing_connection_cancels_consumers() {
        let dir = TempDir::new().unwrap();
        let b = broker(&dir);
        b.declare_queue("q", false, false, false, Arguments::new());

        let (tx, _rx) = mpsc::unbounded_channel();
        let mgr = ConnectionManager::new();
        let conn = mgr.register(peer(), Arc::clone(&b), tx);
        conn.open_channel("ch");
        conn.channel("ch").unwrap().basic_consume("tag", "q", false);
        assert_eq!(mgr.len(), 1);

        mgr.remove(conn.id());
        assert!(mgr.is_empty());
        assert_eq!(conn.channel_count(), 0);

        let (tx2, _rx2) = mpsc::unbounded_channel();
        let again = mgr.register(peer(), Arc::clone(&b), tx2);
        again.open_channel("ch");
        assert!(again.channel("ch").unwrap().basic_consume("tag", "q", false));
    }
}
