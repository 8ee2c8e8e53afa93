use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use relaymq::config::DeliveryConfig;
use relaymq::core::{Arguments, BasicProperties, DeliveryMode, ExchangeType, VirtualHost};
use relaymq::{Broker, Client, Server};
use tempfile::TempDir;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

#[path = "common.rs"]
mod common;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

async fn serve(broker: Arc<Broker>) -> (std::net::SocketAddr, oneshot::Sender<()>, JoinHandle<()>) {
    common::init_logging();
    let server = Server::bind("127.0.0.1:0", Arc::clone(&broker)).await.unwrap();
    let addr = server.local_addr().unwrap();
    let (stop, stopped) = oneshot::channel::<()>();
    let handle = tokio::spawn(async move {
        server
            .run(async {
                let _ = stopped.await;
            })
            .await
            .unwrap();
        broker.shutdown();
    });
    (addr, stop, handle)
}

async fn start_server(dir: &TempDir) -> (std::net::SocketAddr, oneshot::Sender<()>, JoinHandle<()>) {
    serve(common::open_broker(dir)).await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn publish_consume_ack_over_tcp() {
    let dir = TempDir::new().unwrap();
    let (addr, stop, server) = start_server(&dir).await;

    let client = Client::connect(addr).await.unwrap();
    let admin = client.open_channel().await.unwrap();
    assert!(admin
        .declare_exchange("logs", ExchangeType::Topic, true, false, Arguments::new())
        .await
        .unwrap());
    assert!(admin
        .declare_queue("errors", true, false, false, Arguments::new())
        .await
        .unwrap());
    assert!(admin.queue_bind("logs", "errors", "app.*.error").await.unwrap());

    let mut sub = client.open_channel().await.unwrap();
    assert!(sub.basic_consume("c1", "errors", false).await.unwrap());
    // One subscription per channel.
    assert!(!sub.basic_consume("c2", "errors", false).await.unwrap());

    let props = BasicProperties::new("app.db.error", DeliveryMode::Durable);
    assert!(admin.basic_publish("logs", &props, "disk full").await.unwrap());
    let ignored = BasicProperties::new("app.db.info", DeliveryMode::Durable);
    assert!(admin.basic_publish("logs", &ignored, "all good").await.unwrap());

    let delivery = tokio::time::timeout(RECV_TIMEOUT, sub.recv())
        .await
        .expect("delivery timed out")
        .expect("connection closed");
    assert_eq!(delivery.consumer_tag, "c1");
    assert_eq!(delivery.properties.routing_key, "app.db.error");
    assert_eq!(&delivery.body[..], b"disk full");
    assert!(!delivery.properties.id.is_empty());

    assert!(sub.basic_ack("errors", &delivery.properties.id).await.unwrap());
    assert!(tokio::time::timeout(Duration::from_millis(200), sub.recv())
        .await
        .is_err());

    assert!(sub.basic_cancel("c1", "errors").await.unwrap());
    assert!(sub.close().await.unwrap());
    assert!(admin.close().await.unwrap());
    client.close().await.unwrap();

    stop.send(()).unwrap();
    server.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn refusals_are_reported() {
    let dir = TempDir::new().unwrap();
    let (addr, stop, server) = start_server(&dir).await;

    let client = Client::connect(addr).await.unwrap();
    let ch = client.open_channel().await.unwrap();

    // Unknown exchange.
    let props = BasicProperties::new("k", DeliveryMode::Undurable);
    assert!(!ch.basic_publish("missing", &props, "x").await.unwrap());
    // Binding to missing endpoints.
    assert!(!ch.queue_bind("missing", "nowhere", "k").await.unwrap());
    // Consuming a queue that does not exist.
    assert!(!ch.basic_consume("c", "nowhere", true).await.unwrap());
    // Queue names must be plain file names.
    assert!(!ch
        .declare_queue("../../outside", true, false, false, Arguments::new())
        .await
        .unwrap());

    assert!(ch
        .declare_exchange("direct", ExchangeType::Direct, false, false, Arguments::new())
        .await
        .unwrap());
    // Wildcards belong in binding keys only.
    let bad = BasicProperties::new("a.*", DeliveryMode::Undurable);
    assert!(!ch.basic_publish("direct", &bad, "x").await.unwrap());

    client.close().await.unwrap();
    stop.send(()).unwrap();
    server.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn two_clients_share_a_queue_round_robin() {
    let dir = TempDir::new().unwrap();
    let (addr, stop, server) = start_server(&dir).await;

    let publisher = Client::connect(addr).await.unwrap();
    let pch = publisher.open_channel().await.unwrap();
    pch.declare_exchange("fan", ExchangeType::Fanout, false, false, Arguments::new())
        .await
        .unwrap();
    pch.declare_queue("work", false, false, false, Arguments::new())
        .await
        .unwrap();
    pch.queue_bind("fan", "work", "").await.unwrap();

    let a = Client::connect(addr).await.unwrap();
    let b = Client::connect(addr).await.unwrap();
    let mut ach = a.open_channel().await.unwrap();
    let mut bch = b.open_channel().await.unwrap();
    assert!(ach.basic_consume("a", "work", true).await.unwrap());
    assert!(bch.basic_consume("b", "work", true).await.unwrap());

    let props = BasicProperties::new("any", DeliveryMode::Undurable);
    for i in 0..4 {
        assert!(pch.basic_publish("fan", &props, format!("job-{i}")).await.unwrap());
    }

    let mut received = 0;
    for _ in 0..2 {
        for ch in [&mut ach, &mut bch] {
            let d = tokio::time::timeout(RECV_TIMEOUT, ch.recv())
                .await
                .expect("delivery timed out")
                .expect("connection closed");
            assert!(d.body.starts_with(b"job-"));
            received += 1;
        }
    }
    assert_eq!(received, 4);

    // Dropping a client's connection releases its consumer.
    a.close().await.unwrap();
    drop(ach);
    b.close().await.unwrap();
    drop(bch);
    publisher.close().await.unwrap();

    stop.send(()).unwrap();
    server.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 1)]
async fn full_delivery_pool_does_not_stall_other_connections() {
    let dir = TempDir::new().unwrap();
    let vhost = VirtualHost::open("test", dir.path()).unwrap();
    let delivery = DeliveryConfig {
        worker_threads: 1,
        queue_capacity: 1,
    };
    let broker = Arc::new(Broker::new(vhost, &delivery).unwrap());
    broker.declare_exchange("ex", ExchangeType::Fanout, false, false, Arguments::new());
    broker.declare_queue("slow", false, false, false, Arguments::new());
    broker.bind("ex", "slow", "");

    // Each delivery waits until the gate closes.
    let (release, gate) = flume::unbounded::<()>();
    let slow = move |_: &str, _: &BasicProperties, _: &Bytes| {
        let _ = gate.recv();
    };
    assert!(broker.subscribe("slow-consumer", "slow", true, Arc::new(slow)).is_some());

    let (addr, stop, server) = serve(Arc::clone(&broker)).await;
    let publisher = Client::connect(addr).await.unwrap();
    let pch = publisher.open_channel().await.unwrap();
    let props = BasicProperties::new("any", DeliveryMode::Undurable);

    // One delivery occupies the worker, the next fills the only slot.
    assert!(pch.basic_publish("ex", &props, "one").await.unwrap());
    assert!(pch.basic_publish("ex", &props, "two").await.unwrap());
    let blocked = tokio::spawn(async move { pch.basic_publish("ex", &props, "three").await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let other = Client::connect(addr).await.unwrap();
    let och = tokio::time::timeout(Duration::from_secs(2), other.open_channel())
        .await
        .expect("open_channel stalled behind a blocked publish")
        .unwrap();
    let declared = tokio::time::timeout(
        Duration::from_secs(2),
        och.declare_queue("other", false, false, false, Arguments::new()),
    )
    .await
    .expect("declare_queue stalled behind a blocked publish")
    .unwrap();
    assert!(declared);
    assert!(!blocked.is_finished());

    drop(release);
    let published = tokio::time::timeout(RECV_TIMEOUT, blocked)
        .await
        .expect("blocked publish never completed")
        .unwrap()
        .unwrap();
    assert!(published);

    other.close().await.unwrap();
    publisher.close().await.unwrap();
    stop.send(()).unwrap();
    server.await.unwrap();
}
