//! TCP front end.
//!
//! Each connection gets a reader loop that handles requests one at a time and
//! a writer task that drains the connection's outbound queue.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::mpsc;
use tokio::task;
use tracing::{debug, error, info, warn};

use crate::broker::channel::Channel;
use crate::broker::connection::{Connection, ConnectionManager};
use crate::broker::engine::Broker;
use crate::broker::protocol::{decode_frame, encode_frame, request, Request, Response};
use crate::core::{BrokerError, ExchangeType};

const INBUF_INIT: usize = 64 * 1024;

pub struct Server {
    listener: TcpListener,
    broker: Arc<Broker>,
    connections: Arc<ConnectionManager>,
}

impl Server {
    pub async fn bind(addr: &str, broker: Arc<Broker>) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            broker,
            connections: Arc::new(ConnectionManager::new()),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn connections(&self) -> Arc<ConnectionManager> {
        Arc::clone(&self.connections)
    }

    /// Accepts connections until `shutdown` resolves, then closes every
    /// remaining connection's channels.
    pub async fn run<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()>,
    {
        info!(target: "relaymq::server", addr = %self.local_addr()?, "Listening");
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!(target: "relaymq::server", "Shutdown requested");
                    break;
                }
                accepted = self.listener.accept() => {
                    let (socket, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!(target: "relaymq::server", error = %e, "Accept failed");
                            continue;
                        }
                    };
                    if let Err(e) = socket.set_nodelay(true) {
                        debug!(target: "relaymq::server", %peer, error = %e, "Failed to set TCP_NODELAY");
                    }
                    let broker = Arc::clone(&self.broker);
                    let connections = Arc::clone(&self.connections);
                    task::spawn(async move {
                        if let Err(e) = handle_client(socket, peer, broker, connections).await {
                            error!(target: "relaymq::server", %peer, error = %e, "Connection error");
                        }
                    });
                }
            }
        }

        self.connections.close_all();
        Ok(())
    }
}

async fn handle_client(
    stream: TcpStream,
    peer: SocketAddr,
    broker: Arc<Broker>,
    connections: Arc<ConnectionManager>,
) -> anyhow::Result<()> {
    let (reader_half, writer_half) = stream.into_split();
    let mut reader = BufReader::new(reader_half);

    let (tx, rx) = mpsc::unbounded_channel::<Response>();
    let conn = connections.register(peer, broker, tx);
    let writer = task::spawn(write_loop(writer_half, rx));

    let result = read_loop(&mut reader, &conn).await;

    connections.remove(conn.id());
    drop(conn);
    if let Err(e) = writer.await {
        debug!(target: "relaymq::server", %peer, error = %e, "Writer task ended abnormally");
    }
    result
}

async fn read_loop(
    reader: &mut BufReader<tokio::net::tcp::OwnedReadHalf>,
    conn: &Connection,
) -> anyhow::Result<()> {
    let mut inbuf = BytesMut::with_capacity(INBUF_INIT);

    loop {
        loop {
            let req: Request = match decode_frame(&mut inbuf) {
                Ok(Some(req)) => req,
                Ok(None) => break,
                Err(e) => {
                    error!(target: "relaymq::server", peer = %conn.peer(), error = %e, "Dropping connection on bad frame");
                    return Ok(());
                }
            };
            if let Some(resp) = dispatch_on_runtime(conn, req) {
                if !conn.send(resp) {
                    return Ok(());
                }
            }
        }

        let n = reader.read_buf(&mut inbuf).await?;
        if n == 0 {
            return Ok(());
        }
    }
}

async fn write_loop(writer_half: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<Response>) {
    let mut writer = BufWriter::new(writer_half);
    let mut out = BytesMut::with_capacity(4096);

    while let Some(resp) = rx.recv().await {
        out.clear();
        if let Err(e) = encode_frame(&resp, &mut out) {
            error!(target: "relaymq::server", error = %e, "Failed to encode response");
            continue;
        }
        // Coalesce whatever else is already queued into the same flush.
        while let Ok(more) = rx.try_recv() {
            if let Err(e) = encode_frame(&more, &mut out) {
                error!(target: "relaymq::server", error = %e, "Failed to encode response");
            }
        }
        if writer.write_all(&out).await.is_err() || writer.flush().await.is_err() {
            break;
        }
    }
}

/// Publishes may block while the delivery pool is full, so on a
/// multi-threaded runtime they run under `block_in_place` and the worker's
/// other tasks move to another thread. A current-thread runtime stalls
/// until the pool has room.
fn dispatch_on_runtime(conn: &Connection, req: Request) -> Option<Response> {
    let publishing = matches!(req.body, Some(request::Body::BasicPublish(_)));
    if publishing && Handle::current().runtime_flavor() == RuntimeFlavor::MultiThread {
        task::block_in_place(|| dispatch(conn, req))
    } else {
        dispatch(conn, req)
    }
}

/// Runs one request against its channel. Requests for unknown channels and
/// requests without a body get no response.
fn dispatch(conn: &Connection, req: Request) -> Option<Response> {
    let Request { rid, cid, body } = req;
    let Some(body) = body else {
        warn!(target: "relaymq::server", rid, "Request without body");
        return None;
    };

    let ok = match body {
        request::Body::OpenChannel(_) => conn.open_channel(&cid),
        request::Body::CloseChannel(_) => {
            conn.close_channel(&cid);
            true
        }
        body => match conn.channel(&cid) {
            Some(channel) => apply(&channel, rid, body),
            None => {
                warn!(target: "relaymq::server", rid, "{}", BrokerError::not_found("channel", cid));
                return None;
            }
        },
    };

    Some(Response::common(rid, cid, ok))
}

fn apply(channel: &Channel, rid: u64, body: request::Body) -> bool {
    match body {
        request::Body::DeclareExchange(r) => match ExchangeType::from_code(r.kind) {
            Some(kind) => channel.declare_exchange(&r.name, kind, r.durable, r.auto_delete, r.args),
            None => {
                warn!(target: "relaymq::server", rid, "{}", BrokerError::malformed("exchange type", r.kind.to_string()));
                false
            }
        },
        request::Body::DeleteExchange(r) => channel.delete_exchange(&r.name),
        request::Body::DeclareQueue(r) => {
            channel.declare_queue(&r.name, r.durable, r.exclusive, r.auto_delete, r.args)
        }
        request::Body::DeleteQueue(r) => channel.delete_queue(&r.name),
        request::Body::QueueBind(r) => channel.queue_bind(&r.exchange, &r.queue, &r.binding_key),
        request::Body::QueueUnbind(r) => channel.queue_unbind(&r.exchange, &r.queue),
        request::Body::BasicPublish(r) => channel.basic_publish(
            &r.exchange,
            r.properties.map(Into::into).unwrap_or_default(),
            r.body,
        ),
        request::Body::BasicAck(r) => channel.basic_ack(&r.queue, &r.message_id),
        request::Body::BasicConsume(r) => {
            channel.basic_consume(&r.consumer_tag, &r.queue, r.auto_ack)
        }
        request::Body::BasicCancel(_) => channel.basic_cancel(),
        request::Body::OpenChannel(_) | request::Body::CloseChannel(_) => false,
    }
}
