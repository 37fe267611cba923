use crate::helpers::{endpoint, eventually, InMemoryBroker};
use amqp_tools::consumers::{Consumer, Handler, HandlerError, Incoming};
use shutdown_handler::ShutdownHandler;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

async fn ping_handler(incoming: Incoming<'_, ()>) -> Result<(), HandlerError> {
    if incoming.body == b"ping" {
        Ok(())
    } else {
        Err(anyhow::anyhow!("Unexpected payload").into())
    }
}

#[tokio::test]
async fn a_successfully_handled_message_is_acked_exactly_once() {
    // Arrange
    let broker = InMemoryBroker::new();
    let consumer = Consumer::builder(broker.clone(), endpoint(), ())
        .handler_fn(ping_handler)
        .build();
    let shutdown = Arc::new(ShutdownHandler::new());
    let handle = tokio::spawn(consumer.run_until_shutdown(shutdown.clone()));

    // Act
    broker.enqueue("ping");
    eventually(|| !broker.acked().is_empty()).await;
    shutdown.shutdown();
    handle.await.unwrap();

    // Assert
    assert_eq!(broker.acked(), vec![b"ping".to_vec()]);
    assert!(broker.rejected().is_empty());
}

#[derive(Default)]
struct Attempts(AtomicUsize);

async fn fails_three_times(incoming: Incoming<'_, Attempts>) -> Result<(), HandlerError> {
    let attempt = incoming.context.0.fetch_add(1, Ordering::SeqCst) + 1;
    if attempt <= 3 {
        Err(anyhow::anyhow!("Transient failure #{}", attempt).into())
    } else {
        Ok(())
    }
}

#[tokio::test]
async fn a_failed_message_is_requeued_and_redelivered() {
    // Arrange
    let broker = InMemoryBroker::new();
    let context = Arc::new(Attempts::default());
    let consumer = Consumer::<_, Attempts>::builder(broker.clone(), endpoint(), context.clone())
        .handler_fn(fails_three_times)
        .build();
    let shutdown = Arc::new(ShutdownHandler::new());
    let handle = tokio::spawn(consumer.run_until_shutdown(shutdown.clone()));

    // Act
    broker.enqueue("ping");
    eventually(|| !broker.acked().is_empty()).await;
    shutdown.shutdown();
    handle.await.unwrap();

    // Assert
    assert_eq!(context.0.load(Ordering::SeqCst), 4);
    assert_eq!(broker.rejected(), vec![(b"ping".to_vec(), true); 3]);
    assert_eq!(broker.acked(), vec![b"ping".to_vec()]);
}

#[tokio::test]
async fn without_a_handler_every_message_is_requeued() {
    // Arrange
    let broker = InMemoryBroker::new();
    let consumer = Consumer::builder(broker.clone(), endpoint(), ()).build();
    let shutdown = Arc::new(ShutdownHandler::new());
    let handle = tokio::spawn(consumer.run_until_shutdown(shutdown.clone()));

    // Act
    broker.enqueue("ping");
    eventually(|| broker.rejected().len() >= 3).await;
    shutdown.shutdown();
    handle.await.unwrap();

    // Assert
    assert!(broker.acked().is_empty());
    assert!(broker
        .rejected()
        .iter()
        .all(|(body, requeue)| body == b"ping" && *requeue));
}

#[derive(Default)]
struct Inbox(Mutex<Vec<String>>);

struct RecordingHandler;

#[async_trait::async_trait]
impl Handler<Inbox> for RecordingHandler {
    async fn handle(&self, incoming: Incoming<'_, Inbox>) -> Result<(), HandlerError> {
        let body = std::str::from_utf8(incoming.body).map_err(anyhow::Error::from)?;
        incoming.context.0.lock().unwrap().push(body.to_owned());
        Ok(())
    }
}

#[tokio::test]
async fn messages_are_handled_one_at_a_time_in_arrival_order() {
    // Arrange
    let broker = InMemoryBroker::new();
    let inbox = Arc::new(Inbox::default());
    let consumer = Consumer::<_, Inbox>::builder(broker.clone(), endpoint(), inbox.clone())
        .handler(RecordingHandler)
        .build();
    let shutdown = Arc::new(ShutdownHandler::new());
    let handle = tokio::spawn(consumer.run_until_shutdown(shutdown.clone()));

    // Act
    for body in ["first", "second", "third"] {
        broker.enqueue(body);
    }
    eventually(|| broker.acked().len() == 3).await;
    shutdown.shutdown();
    handle.await.unwrap();

    // Assert
    assert_eq!(
        *inbox.0.lock().unwrap(),
        vec!["first".to_owned(), "second".to_owned(), "third".to_owned()]
    );
}
