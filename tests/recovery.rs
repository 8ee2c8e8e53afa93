use bytes::Bytes;
use relaymq::core::message::MessageManager;
use relaymq::core::{Arguments, BasicProperties, DeliveryMode, ExchangeType, VirtualHost};
use tempfile::TempDir;

#[path = "common.rs"]
mod common;

fn durable(rk: &str) -> BasicProperties {
    BasicProperties::new(rk, DeliveryMode::Durable)
}

#[test]
fn restart_yields_unacked_messages_in_order() {
    common::init_logging();
    let dir = TempDir::new().unwrap();
    let mut acked = Vec::new();
    {
        let vh = VirtualHost::open("test", dir.path()).unwrap();
        vh.declare_exchange("ex", ExchangeType::Direct, true, false, Arguments::new());
        vh.declare_queue("q", true, false, false, Arguments::new());
        vh.bind("ex", "q", "k");
        for i in 0..10 {
            vh.publish("ex", &durable("k"), &Bytes::from(format!("m{i}"))).unwrap();
        }
        // Ack every even message; odd ones stay awaiting ack or pending.
        for i in 0..6 {
            let msg = vh.basic_front("q").unwrap();
            if i % 2 == 0 {
                assert!(vh.basic_ack("q", msg.id()));
                acked.push(msg.body.clone());
            }
        }
    }

    let vh = VirtualHost::open("test", dir.path()).unwrap();
    let msgs = vh.messages();
    assert_eq!(msgs.pending_count("q"), 7);
    assert_eq!(msgs.valid_count("q"), 7);
    assert_eq!(msgs.total_count("q"), 7);

    let bodies: Vec<Bytes> = std::iter::from_fn(|| vh.basic_front("q"))
        .map(|m| m.body)
        .collect();
    let expected: Vec<Bytes> = [1, 3, 5, 6, 7, 8, 9]
        .iter()
        .map(|i| Bytes::from(format!("m{i}")))
        .collect();
    assert_eq!(bodies, expected);
    assert!(bodies.iter().all(|b| !acked.contains(b)));
}

#[test]
fn undurable_messages_do_not_survive_restart() {
    let dir = TempDir::new().unwrap();
    {
        let vh = VirtualHost::open("test", dir.path()).unwrap();
        vh.declare_exchange("ex", ExchangeType::Fanout, true, false, Arguments::new());
        vh.declare_queue("q", true, false, false, Arguments::new());
        vh.bind("ex", "q", "");
        vh.publish("ex", &BasicProperties::new("a", DeliveryMode::Undurable), &Bytes::from_static(b"gone"))
            .unwrap();
        vh.publish("ex", &durable("a"), &Bytes::from_static(b"kept")).unwrap();
    }

    let vh = VirtualHost::open("test", dir.path()).unwrap();
    assert_eq!(vh.messages().pending_count("q"), 1);
    assert_eq!(vh.basic_front("q").unwrap().body, Bytes::from_static(b"kept"));
}

#[test]
fn gc_boundary_through_manager() {
    let dir = TempDir::new().unwrap();
    let mgr = MessageManager::new(dir.path());

    mgr.init_queue_messages("exact", true).unwrap();
    for i in 0..2000 {
        mgr.insert("exact", durable("k"), Bytes::from(format!("{i}")), true);
    }
    while let Some(msg) = mgr.front("exact") {
        mgr.ack("exact", msg.id());
    }
    assert_eq!(mgr.total_count("exact"), 2000);

    mgr.init_queue_messages("over", true).unwrap();
    for i in 0..2001 {
        mgr.insert("over", durable("k"), Bytes::from(format!("{i}")), true);
    }
    for _ in 0..1001 {
        let msg = mgr.front("over").unwrap();
        mgr.ack("over", msg.id());
    }
    assert_eq!(mgr.total_count("over"), 1000);
    assert_eq!(mgr.valid_count("over"), 1000);
    assert_eq!(mgr.pending_count("over"), 1000);
    drop(mgr);

    let mgr = MessageManager::new(dir.path());
    mgr.init_queue_messages("over", true).unwrap();
    assert_eq!(mgr.pending_count("over"), 1000);
    assert_eq!(
        mgr.front("over").unwrap().body,
        Bytes::from_static(b"1001")
    );
}
