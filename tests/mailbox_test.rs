//! Local mailbox, lookup service and timer scenario tests

mod common;

use common::{TEST_MESSAGE_ID, TestMessage, test_fabric};
use postbus::{
    Error, LocalMailbox, MailboxAddress, MailboxProcessor, MessageHandlerList, TimerMessage,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;

#[tokio::test]
async fn local_round_trip_through_the_lookup_service() {
    let fabric = test_fabric("ne-local");

    let sender = LocalMailbox::create(&fabric, "A");
    let receiver = LocalMailbox::create(&fabric, "B");
    sender.activate().await.unwrap();
    receiver.activate().await.unwrap();

    let (tx, mut rx) = mpsc::channel::<String>(8);
    let handlers = MessageHandlerList::new();
    handlers.add(
        TEST_MESSAGE_ID,
        Arc::new(move |message| {
            if let Some(test) = message.as_any().downcast_ref::<TestMessage>() {
                let _ = tx.try_send(test.payload.clone());
            }
            0
        }),
    );

    let processor_receiver = receiver.clone();
    let processor_fabric = Arc::clone(&fabric);
    let processing = tokio::spawn(async move {
        MailboxProcessor::new(handlers, processor_receiver)
            .process_mailbox(1, processor_fabric.thread_manager())
            .await
    });

    let handle = fabric.find(&MailboxAddress::local("B")).await.unwrap();
    handle.post(Box::new(TestMessage::new("hi"))).await.unwrap();

    let delivered = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("delivery within a second")
        .expect("handler ran");
    assert_eq!(delivered, "hi");
    assert_eq!(receiver.sent_count(), 1);
    assert_eq!(receiver.received_count(), 1);

    receiver.deactivate().await.unwrap();
    processing.await.unwrap().unwrap();
    sender.deactivate().await.unwrap();
    fabric.shutdown().await;
}

#[tokio::test]
async fn local_find_miss_is_an_error() {
    let fabric = test_fabric("ne-miss");
    assert!(matches!(
        fabric.find(&MailboxAddress::local("nobody")).await,
        Err(Error::NotFound(_))
    ));
    assert!(matches!(
        fabric.find(&MailboxAddress::default()).await,
        Err(Error::InvalidArgument(_))
    ));
}

#[tokio::test]
async fn duplicate_local_registration_replaces_the_incumbent() {
    let fabric = test_fabric("ne-dup");

    let first = LocalMailbox::create(&fabric, "X");
    first.activate().await.unwrap();
    assert!(first.is_active());

    let second = LocalMailbox::create(&fabric, "X");
    second.activate().await.unwrap();

    // The first was deactivated as part of the replacement
    assert!(!first.is_active());
    assert!(second.is_active());

    // Finds now resolve to the second mailbox
    let handle = fabric.find(&MailboxAddress::local("X")).await.unwrap();
    handle.post(Box::new(TestMessage::new("to the winner"))).await.unwrap();
    assert_eq!(second.sent_count(), 1);
    assert_eq!(first.sent_count(), 0);

    second.deactivate().await.unwrap();
    fabric.shutdown().await;
}

#[tokio::test]
async fn deactivate_unblocks_a_waiting_consumer() {
    let fabric = test_fabric("ne-unblock");
    let owner = LocalMailbox::create(&fabric, "quiet");
    owner.activate().await.unwrap();

    let waiter = owner.clone();
    let blocked = tokio::spawn(async move { waiter.get_message(None).await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    owner.deactivate().await.unwrap();

    let observed = tokio::time::timeout(Duration::from_secs(1), blocked)
        .await
        .expect("consumer unblocked")
        .unwrap();
    assert!(observed.is_none());
    fabric.shutdown().await;
}

#[tokio::test]
async fn dropping_the_last_handle_deactivates_and_deregisters() {
    let fabric = test_fabric("ne-refcount");
    let owner = LocalMailbox::create(&fabric, "transient");
    owner.activate().await.unwrap();
    assert_eq!(owner.reference_count(), 1);

    let extra = fabric.find(&MailboxAddress::local("transient")).await.unwrap();
    assert_eq!(owner.reference_count(), 2);
    drop(extra);
    assert_eq!(owner.reference_count(), 1);

    drop(owner);
    // The deferred deactivate runs on the runtime; give it a moment
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(matches!(
        fabric.find(&MailboxAddress::local("transient")).await,
        Err(Error::NotFound(_))
    ));
    fabric.shutdown().await;
}

#[tokio::test]
async fn posting_to_an_inactive_mailbox_fails() {
    let fabric = test_fabric("ne-inactive");
    let owner = LocalMailbox::create(&fabric, "cold");
    assert!(matches!(
        owner.post(Box::new(TestMessage::new("nope"))).await,
        Err(Error::Inactive)
    ));
    fabric.shutdown().await;
}

#[tokio::test]
async fn one_shot_timer_fires_once_and_retires() {
    let fabric = test_fabric("ne-timer1");
    let owner = LocalMailbox::create(&fabric, "ticker");
    owner.activate().await.unwrap();

    let timer = TimerMessage::new(0x0099, Duration::from_millis(50), Duration::ZERO);
    owner.schedule_timer(timer).await.unwrap();
    assert_eq!(owner.active_timers(), 1);

    let fired = owner.get_message(Some(Duration::from_secs(1))).await.unwrap();
    assert_eq!(fired.message_id(), 0x0099);
    let fired = fired.as_any().downcast_ref::<TimerMessage>().unwrap();
    assert!(!fired.is_reusable());

    // Delivery retires a one-shot timer
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(owner.active_timers(), 0);

    owner.deactivate().await.unwrap();
    fabric.shutdown().await;
}

#[tokio::test]
async fn restart_timer_stops_after_interval_reset_to_zero() {
    let fabric = test_fabric("ne-timer2");
    let owner = LocalMailbox::create(&fabric, "metronome");
    owner.activate().await.unwrap();

    let timers_before = owner.active_timers();
    let timer =
        TimerMessage::new(0x009A, Duration::from_millis(100), Duration::from_millis(100));
    let timer_id = owner.schedule_timer(timer).await.unwrap();
    assert_eq!(owner.active_timers(), timers_before + 1);

    let fired = Arc::new(AtomicU32::new(0));
    for _ in 0..5 {
        let message = owner
            .get_message(Some(Duration::from_secs(2)))
            .await
            .expect("periodic delivery");
        assert_eq!(message.message_id(), 0x009A);
        fired.fetch_add(1, Ordering::Relaxed);
    }
    assert_eq!(fired.load(Ordering::Relaxed), 5);

    owner.reset_timer_interval(timer_id, Duration::ZERO).await.unwrap();

    // No further deliveries after the reset settles
    tokio::time::sleep(Duration::from_millis(250)).await;
    while owner.get_message_non_blocking().is_some() {}
    assert!(
        owner
            .get_message(Some(Duration::from_millis(300)))
            .await
            .is_none()
    );

    owner.cancel_timer(timer_id).await.unwrap();
    assert_eq!(owner.active_timers(), timers_before);
    assert!(matches!(
        owner.cancel_timer(timer_id).await,
        Err(Error::NotFound(_))
    ));

    owner.deactivate().await.unwrap();
    fabric.shutdown().await;
}

#[tokio::test]
async fn pooled_processing_keeps_every_message_exactly_once() {
    let fabric = test_fabric("ne-pool");
    let owner = LocalMailbox::create(&fabric, "fanin");
    owner.activate().await.unwrap();

    let handled = Arc::new(AtomicU32::new(0));
    let handlers = MessageHandlerList::new();
    let counter = Arc::clone(&handled);
    handlers.add(
        TEST_MESSAGE_ID,
        Arc::new(move |_| {
            counter.fetch_add(1, Ordering::Relaxed);
            0
        }),
    );

    for i in 0..40 {
        owner
            .post(Box::new(TestMessage::new(&format!("m{i}"))))
            .await
            .unwrap();
    }

    let processor_owner = owner.clone();
    let processor_fabric = Arc::clone(&fabric);
    let processing = tokio::spawn(async move {
        MailboxProcessor::new(handlers, processor_owner)
            .process_mailbox(4, processor_fabric.thread_manager())
            .await
    });

    tokio::time::sleep(Duration::from_millis(300)).await;
    owner.deactivate().await.unwrap();
    processing.await.unwrap().unwrap();

    assert_eq!(handled.load(Ordering::Relaxed), 40);
    assert_eq!(owner.received_count(), 40);
    fabric.shutdown().await;
}
