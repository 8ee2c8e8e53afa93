//! Async client for the broker's TCP protocol.
//!
//! One [`Client`] owns a connection; any number of [`ClientChannel`]s share it.
//! Each request waits for the response carrying its request id, and
//! deliveries are routed to the channel that subscribed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::broker::protocol::{self, decode_frame, encode_frame, request, response, Request, Response};
use crate::core::{Arguments, BasicProperties, ExchangeType};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// A message pushed to a subscribed channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub consumer_tag: String,
    pub properties: BasicProperties,
    pub body: Bytes,
}

#[derive(Debug)]
struct Shared {
    writer: Mutex<BufWriter<OwnedWriteHalf>>,
    next_rid: AtomicU64,
    pending: DashMap<u64, oneshot::Sender<bool>>,
    deliveries: DashMap<String, mpsc::UnboundedSender<Delivery>>,
}

impl Shared {
    async fn call(&self, cid: &str, body: request::Body) -> anyhow::Result<bool> {
        let rid = self.next_rid.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = oneshot::channel();
        self.pending.insert(rid, tx);

        let mut frame = BytesMut::new();
        encode_frame(&Request::new(rid, cid, body), &mut frame)?;
        let written = {
            let mut w = self.writer.lock().await;
            match w.write_all(&frame).await {
                Ok(()) => w.flush().await,
                Err(e) => Err(e),
            }
        };
        if let Err(e) = written {
            self.pending.remove(&rid);
            return Err(e).context("failed to send request");
        }

        match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(ok)) => Ok(ok),
            Ok(Err(_)) => Err(anyhow!("connection closed before response to request {rid}")),
            Err(_) => {
                self.pending.remove(&rid);
                Err(anyhow!("request {rid} timed out"))
            }
        }
    }
}

#[derive(Debug)]
pub struct Client {
    shared: Arc<Shared>,
    reader: JoinHandle<()>,
}

impl Client {
    pub async fn connect(addr: impl ToSocketAddrs) -> anyhow::Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .context("failed to connect to broker")?;
        stream.set_nodelay(true)?;
        let (reader_half, writer_half) = stream.into_split();

        let shared = Arc::new(Shared {
            writer: Mutex::new(BufWriter::new(writer_half)),
            next_rid: AtomicU64::new(0),
            pending: DashMap::new(),
            deliveries: DashMap::new(),
        });
        let reader = tokio::spawn(read_loop(reader_half, Arc::clone(&shared)));

        Ok(Self { shared, reader })
    }

    /// Opens a channel with a fresh id.
    pub async fn open_channel(&self) -> anyhow::Result<ClientChannel> {
        let cid = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared.deliveries.insert(cid.clone(), tx);

        let ok = self
            .shared
            .call(&cid, request::Body::OpenChannel(protocol::OpenChannel {}))
            .await;
        match ok {
            Ok(true) => Ok(ClientChannel {
                cid,
                shared: Arc::clone(&self.shared),
                deliveries: rx,
            }),
            Ok(false) => {
                self.shared.deliveries.remove(&cid);
                Err(anyhow!("broker refused channel {cid}"))
            }
            Err(e) => {
                self.shared.deliveries.remove(&cid);
                Err(e)
            }
        }
    }

    /// Closes the write side; the broker then tears down every channel.
    pub async fn close(self) -> anyhow::Result<()> {
        self.shared.writer.lock().await.shutdown().await?;
        Ok(())
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_loop(mut reader: OwnedReadHalf, shared: Arc<Shared>) {
    let mut inbuf = BytesMut::with_capacity(64 * 1024);
    'io: loop {
        loop {
            let resp: Response = match decode_frame(&mut inbuf) {
                Ok(Some(resp)) => resp,
                Ok(None) => break,
                Err(e) => {
                    warn!(target: "relaymq::client", error = %e, "Bad frame from broker");
                    break 'io;
                }
            };
            match resp.body {
                Some(response::Body::Common(c)) => {
                    if let Some((_, tx)) = shared.pending.remove(&c.rid) {
                        let _ = tx.send(c.ok);
                    }
                }
                Some(response::Body::Deliver(d)) => {
                    let delivery = Delivery {
                        consumer_tag: d.consumer_tag,
                        properties: d.properties.map(Into::into).unwrap_or_default(),
                        body: d.body,
                    };
                    match shared.deliveries.get(&d.cid) {
                        Some(tx) => {
                            let _ = tx.send(delivery);
                        }
                        None => debug!(target: "relaymq::client", channel = %d.cid, "Delivery for unknown channel"),
                    }
                }
                None => {}
            }
        }

        match reader.read_buf(&mut inbuf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
    }

    shared.pending.clear();
    shared.deliveries.clear();
}

/// One channel on a [`Client`] connection.
#[derive(Debug)]
pub struct ClientChannel {
    cid: String,
    shared: Arc<Shared>,
    deliveries: mpsc::UnboundedReceiver<Delivery>,
}

impl ClientChannel {
    pub fn id(&self) -> &str {
        &self.cid
    }

    async fn call(&self, body: request::Body) -> anyhow::Result<bool> {
        self.shared.call(&self.cid, body).await
    }

    pub async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeType,
        durable: bool,
        auto_delete: bool,
        args: Arguments,
    ) -> anyhow::Result<bool> {
        self.call(request::Body::DeclareExchange(protocol::DeclareExchange {
            name: name.to_string(),
            kind: kind.code(),
            durable,
            auto_delete,
            args,
        }))
        .await
    }

    pub async fn delete_exchange(&self, name: &str) -> anyhow::Result<bool> {
        self.call(request::Body::DeleteExchange(protocol::DeleteExchange {
            name: name.to_string(),
        }))
        .await
    }

    pub async fn declare_queue(
        &self,
        name: &str,
        durable: bool,
        exclusive: bool,
        auto_delete: bool,
        args: Arguments,
    ) -> anyhow::Result<bool> {
        self.call(request::Body::DeclareQueue(protocol::DeclareQueue {
            name: name.to_string(),
            durable,
            exclusive,
            auto_delete,
            args,
        }))
        .await
    }

    pub async fn delete_queue(&self, name: &str) -> anyhow::Result<bool> {
        self.call(request::Body::DeleteQueue(protocol::DeleteQueue {
            name: name.to_string(),
        }))
        .await
    }

    pub async fn queue_bind(
        &self,
        exchange: &str,
        queue: &str,
        binding_key: &str,
    ) -> anyhow::Result<bool> {
        self.call(request::Body::QueueBind(protocol::QueueBind {
            exchange: exchange.to_string(),
            queue: queue.to_string(),
            binding_key: binding_key.to_string(),
        }))
        .await
    }

    pub async fn queue_unbind(&self, exchange: &str, queue: &str) -> anyhow::Result<bool> {
        self.call(request::Body::QueueUnbind(protocol::QueueUnbind {
            exchange: exchange.to_string(),
            queue: queue.to_string(),
        }))
        .await
    }

    pub async fn basic_publish(
        &self,
        exchange: &str,
        properties: &BasicProperties,
        body: impl Into<Bytes>,
    ) -> anyhow::Result<bool> {
        self.call(request::Body::BasicPublish(protocol::BasicPublish {
            exchange: exchange.to_string(),
            properties: Some(properties.into()),
            body: body.into(),
        }))
        .await
    }

    pub async fn basic_ack(&self, queue: &str, message_id: &str) -> anyhow::Result<bool> {
        self.call(request::Body::BasicAck(protocol::BasicAck {
            queue: queue.to_string(),
            message_id: message_id.to_string(),
        }))
        .await
    }

    pub async fn basic_consume(
        &self,
        consumer_tag: &str,
        queue: &str,
        auto_ack: bool,
    ) -> anyhow::Result<bool> {
        self.call(request::Body::BasicConsume(protocol::BasicConsume {
            consumer_tag: consumer_tag.to_string(),
            queue: queue.to_string(),
            auto_ack,
        }))
        .await
    }

    pub async fn basic_cancel(&self, consumer_tag: &str, queue: &str) -> anyhow::Result<bool> {
        self.call(request::Body::BasicCancel(protocol::BasicCancel {
            consumer_tag: consumer_tag.to_string(),
            queue: queue.to_string(),
        }))
        .await
    }

    /// Next delivery for this channel; `None` once the connection is gone.
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.deliveries.recv().await
    }

    pub async fn close(self) -> anyhow::Result<bool> {
        let ok = self
            .call(request::Body::CloseChannel(protocol::CloseChannel {}))
            .await;
        self.shared.deliveries.remove(&self.cid);
        ok
    }
}
