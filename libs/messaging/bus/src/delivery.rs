//! Shared handler-invocation machinery: timeout, retry, dead-letter

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::message::BusMessage;
use crate::retry::RetryPolicy;
use crate::{MessageFilter, MessageHandler};

/// Delivery counters shared across workers of one bus instance.
#[derive(Debug, Default)]
pub struct DeliveryCounters {
    /// Messages successfully handled
    pub delivered: AtomicU64,
    /// Handler retries performed
    pub retried: AtomicU64,
    /// Messages routed to the dead-letter topic
    pub dead_lettered: AtomicU64,
}

/// Dead-letter routing settings for one subscription.
#[derive(Debug, Clone)]
pub struct DeadLetterRoute {
    /// Destination topic for exhausted messages
    pub topic: String,
}

/// Run one message through filter, handler timeout, retry schedule, and
/// dead-letter routing.
///
/// `publish_dead` is the implementation-specific way to get the dead-letter
/// copy back onto the bus. A message that already came off a dead-letter
/// topic is never re-routed; it is dropped with an error log so a poisoned
/// payload cannot cycle forever.
pub async fn deliver_with_retry<P, F>(
    msg: BusMessage,
    filter: Option<&MessageFilter>,
    handler: &MessageHandler,
    handler_timeout: Duration,
    policy: &RetryPolicy,
    dead_letter: Option<&DeadLetterRoute>,
    counters: &DeliveryCounters,
    publish_dead: P,
) where
    P: Fn(BusMessage) -> F,
    F: Future<Output = Result<(), crate::BusError>>,
{
    if let Some(filter) = filter {
        if !filter(&msg) {
            return;
        }
    }

    let mut attempt: u32 = 0;
    let last_error: String = loop {
        let outcome = tokio::time::timeout(handler_timeout, handler(msg.clone())).await;
        let error = match outcome {
            Ok(Ok(())) => {
                counters.delivered.fetch_add(1, Ordering::Relaxed);
                return;
            }
            Ok(Err(e)) => e,
            Err(_) => format!("handler timed out after {}ms", handler_timeout.as_millis()),
        };

        if attempt >= policy.max_retries {
            break error;
        }
        attempt += 1;
        counters.retried.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            topic = %msg.topic,
            key = %msg.key,
            attempt,
            error = %error,
            "handler failed, retrying"
        );
        tokio::time::sleep(policy.delay_for(attempt)).await;
    };

    match dead_letter {
        Some(route) if !msg.is_dead_letter() => {
            let topic = msg.topic.clone();
            let key = msg.key.clone();
            let dead = msg.into_dead_letter(&route.topic, &last_error, attempt);
            match publish_dead(dead).await {
                Ok(()) => {
                    counters.dead_lettered.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        topic = %topic,
                        key = %key,
                        retries = attempt,
                        error = %last_error,
                        "message dead-lettered"
                    );
                }
                Err(e) => {
                    tracing::error!(
                        topic = %topic,
                        key = %key,
                        error = %e,
                        "failed to dead-letter message, dropping"
                    );
                }
            }
        }
        Some(_) => {
            tracing::error!(
                topic = %msg.topic,
                key = %msg.key,
                error = %last_error,
                "dead-letter handler exhausted retries, dropping"
            );
        }
        None => {
            tracing::error!(
                topic = %msg.topic,
                key = %msg.key,
                error = %last_error,
                "retries exhausted and no dead-letter topic configured, dropping"
            );
        }
    }
}

/// Stable partition assignment for a key.
pub fn partition_for(key: &str, partitions: usize) -> usize {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() as usize) % partitions.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;

    fn handler_failing_n(times: u32, calls: Arc<AtomicU32>) -> MessageHandler {
        Arc::new(move |_msg| {
            let calls = calls.clone();
            Box::pin(async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < times {
                    Err(format!("induced failure {n}"))
                } else {
                    Ok(())
                }
            })
        })
    }

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::from_config(&config::BusRetryConfig {
            max_retries,
            initial_delay_ms: 1,
            max_delay_ms: 4,
            factor: 2.0,
            jitter: false,
        })
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let counters = DeliveryCounters::default();
        let msg = BusMessage::new("trades", "k", vec![1]);

        deliver_with_retry(
            msg,
            None,
            &handler_failing_n(2, calls.clone()),
            Duration::from_secs(1),
            &fast_policy(3),
            None,
            &counters,
            |_dead| async { Ok(()) },
        )
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(counters.delivered.load(Ordering::Relaxed), 1);
        assert_eq!(counters.retried.load(Ordering::Relaxed), 2);
        assert_eq!(counters.dead_lettered.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn exhausted_message_is_dead_lettered() {
        let calls = Arc::new(AtomicU32::new(0));
        let counters = DeliveryCounters::default();
        let captured: Arc<std::sync::Mutex<Option<BusMessage>>> =
            Arc::new(std::sync::Mutex::new(None));

        let msg = BusMessage::new("trades", "k", vec![1]);
        let route = DeadLetterRoute {
            topic: "dlq".to_string(),
        };
        let slot = captured.clone();

        deliver_with_retry(
            msg,
            None,
            &handler_failing_n(u32::MAX, calls.clone()),
            Duration::from_secs(1),
            &fast_policy(2),
            Some(&route),
            &counters,
            move |dead| {
                let slot = slot.clone();
                async move {
                    *slot.lock().unwrap() = Some(dead);
                    Ok(())
                }
            },
        )
        .await;

        // initial delivery + 2 retries
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(counters.dead_lettered.load(Ordering::Relaxed), 1);

        let dead = captured.lock().unwrap().take().expect("dead letter published");
        assert_eq!(dead.topic, "dlq");
        assert_eq!(dead.headers[crate::HEADER_ORIGINAL_TOPIC], "trades");
        assert_eq!(dead.headers[crate::HEADER_RETRY_COUNT], "2");
    }

    #[tokio::test]
    async fn filtered_message_never_reaches_handler() {
        let calls = Arc::new(AtomicU32::new(0));
        let counters = DeliveryCounters::default();
        let filter: MessageFilter = Arc::new(|msg| msg.key == "wanted");

        deliver_with_retry(
            BusMessage::new("trades", "other", vec![1]),
            Some(&filter),
            &handler_failing_n(0, calls.clone()),
            Duration::from_secs(1),
            &fast_policy(1),
            None,
            &counters,
            |_dead| async { Ok(()) },
        )
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn partitions_are_stable_and_bounded() {
        let a = partition_for("BTCUSD", 8);
        assert_eq!(a, partition_for("BTCUSD", 8));
        for key in ["a", "b", "c", "d"] {
            assert!(partition_for(key, 3) < 3);
        }
    }

}
