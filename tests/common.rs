#![allow(dead_code)]

use std::sync::{Arc, Once};

use relaymq::config::DeliveryConfig;
use relaymq::core::VirtualHost;
use relaymq::Broker;
use tempfile::TempDir;

pub fn init_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        relaymq::logging::init_logging("warn");
    });
}

pub fn open_broker(dir: &TempDir) -> Arc<Broker> {
    let vhost = VirtualHost::open("test", dir.path()).expect("failed to open vhost");
    let delivery = DeliveryConfig {
        worker_threads: 2,
        queue_capacity: 64,
    };
    Arc::new(Broker::new(vhost, &delivery).expect("failed to start delivery pool"))
}
