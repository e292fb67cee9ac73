//! Delivery-contract tests against the public trait object

use message_bus::{build_bus, BusMessage, EventBus, MessageHandler, TopicConfig};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn per_key_recorder(log: Arc<Mutex<HashMap<String, Vec<u8>>>>) -> MessageHandler {
    Arc::new(move |msg: BusMessage| {
        let log = log.clone();
        Box::pin(async move {
            log.lock()
                .unwrap()
                .entry(msg.key.clone())
                .or_default()
                .push(msg.payload[0]);
            Ok(())
        })
    })
}

async fn wait_for<F: Fn() -> bool>(cond: F) {
    tokio::time::timeout(Duration::from_secs(3), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition never held");
}

#[tokio::test]
async fn interleaved_keys_stay_ordered_per_key() {
    let bus = build_bus(&config::BusConfig::default()).unwrap();
    bus.start().await.unwrap();
    bus.create_topic(TopicConfig::new("trades", 8)).await.unwrap();

    let log = Arc::new(Mutex::new(HashMap::new()));
    bus.subscribe("trades", "scanner", per_key_recorder(log.clone()))
        .await
        .unwrap();

    let keys = ["BTCUSD", "ETHUSD", "SOLUSD"];
    for i in 0..30u8 {
        let key = keys[(i % 3) as usize];
        bus.publish("trades", key, vec![i]).await.unwrap();
    }

    wait_for(|| log.lock().unwrap().values().map(|v| v.len()).sum::<usize>() == 30).await;

    let log = log.lock().unwrap();
    for key in keys {
        let seen = &log[key];
        let mut expected = seen.clone();
        expected.sort_unstable();
        assert_eq!(seen, &expected, "out-of-order delivery for {key}");
        assert_eq!(seen.len(), 10);
    }

    bus.stop().await.unwrap();
}

#[tokio::test]
async fn publish_batch_stops_on_missing_topic() {
    let bus = build_bus(&config::BusConfig::default()).unwrap();
    bus.start().await.unwrap();
    bus.create_topic(TopicConfig::new("klines", 1)).await.unwrap();

    let batch = vec![
        BusMessage::new("klines", "BTCUSD", vec![1]),
        BusMessage::new("absent", "BTCUSD", vec![2]),
    ];
    assert!(bus.publish_batch(batch).await.is_err());

    let info = bus.topic_info("klines").await.unwrap();
    assert_eq!(info.published, 1);

    bus.stop().await.unwrap();
}
