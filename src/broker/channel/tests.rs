use std::sync::atomic::{AtomicUsize, Ordering};

use futures::future::BoxFuture;

use super::*;

struct CountingHandler {
    count: Arc<AtomicUsize>,
}

impl MessageHandler for CountingHandler {
    fn handle(&self, _msg: BrokerMessage) -> BoxFuture<'static, Result<()>> {
        let count = self.count.clone();
        Box::pin(async move {
            count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }
}

#[tokio::test]
async fn publish_with_no_subscribers_does_not_error() {
    let broker = ChannelBroker::new();
    let msg = BrokerMessage::new("order-commands", "saga-1", b"{}".to_vec());
    assert!(broker.publish(msg).await.is_ok());
}

#[tokio::test]
async fn subscribe_then_publish_delivers_to_handler() {
    let broker = ChannelBroker::new();
    let count = Arc::new(AtomicUsize::new(0));
    let handler = CountingHandler {
        count: count.clone(),
    };

    broker
        .subscribe("order-commands", Box::new(handler))
        .await
        .unwrap();
    broker
        .start_consume(&["order-commands".to_string()])
        .await
        .unwrap();

    tokio::time::sleep(tokio::time::Duration::from_millis(10)).await;

    broker
        .publish(BrokerMessage::new("order-commands", "saga-1", b"{}".to_vec()))
        .await
        .unwrap();

    tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;

    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn subscribing_twice_to_the_same_topic_is_rejected() {
    let broker = ChannelBroker::new();
    let count = Arc::new(AtomicUsize::new(0));

    broker
        .subscribe(
            "order-commands",
            Box::new(CountingHandler {
                count: count.clone(),
            }),
        )
        .await
        .unwrap();

    let second = broker
        .subscribe(
            "order-commands",
            Box::new(CountingHandler {
                count: count.clone(),
            }),
        )
        .await;

    assert!(matches!(second, Err(BrokerError::AlreadySubscribed(_))));
}

#[tokio::test]
async fn messages_on_different_topics_do_not_cross_deliver() {
    let broker = ChannelBroker::new();
    let order_count = Arc::new(AtomicUsize::new(0));
    let inventory_count = Arc::new(AtomicUsize::new(0));

    broker
        .subscribe(
            "order-commands",
            Box::new(CountingHandler {
                count: order_count.clone(),
            }),
        )
        .await
        .unwrap();
    broker
        .subscribe(
            "inventory-commands",
            Box::new(CountingHandler {
                count: inventory_count.clone(),
            }),
        )
        .await
        .unwrap();
    broker
        .start_consume(&[
            "order-commands".to_string(),
            "inventory-commands".to_string(),
        ])
        .await
        .unwrap();

    tokio::time::sleep(tokio::time::Duration::from_millis(10)).await;

    broker
        .publish(BrokerMessage::new("order-commands", "saga-1", b"{}".to_vec()))
        .await
        .unwrap();

    tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;

    assert_eq!(order_count.load(Ordering::SeqCst), 1);
    assert_eq!(inventory_count.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn publish_batch_delivers_every_message() {
    let broker = ChannelBroker::new();
    let count = Arc::new(AtomicUsize::new(0));

    broker
        .subscribe(
            "order-commands",
            Box::new(CountingHandler {
                count: count.clone(),
            }),
        )
        .await
        .unwrap();
    broker
        .start_consume(&["order-commands".to_string()])
        .await
        .unwrap();

    tokio::time::sleep(tokio::time::Duration::from_millis(10)).await;

    let batch = vec![
        BrokerMessage::new("order-commands", "saga-1", b"{}".to_vec()),
        BrokerMessage::new("order-commands", "saga-2", b"{}".to_vec()),
        BrokerMessage::new("order-commands", "saga-3", b"{}".to_vec()),
    ];
    broker.publish_batch(batch).await.unwrap();

    tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;

    assert_eq!(count.load(Ordering::SeqCst), 3);
}
