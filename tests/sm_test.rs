//! Shared-memory (POSIX message queue) mailbox scenario tests
#![cfg(target_os = "linux")]

mod common;

use common::{TestMessage, test_fabric};
use postbus::{Error, LocalSmMailbox, MailboxAddress};
use std::time::Duration;

fn unique_name(tag: &str) -> String {
    format!("{tag}-{}", std::process::id())
}

#[tokio::test]
async fn shared_memory_round_trip() {
    let receiver_fabric = test_fabric("ne-sm-recv");
    let sender_fabric = test_fabric("ne-sm-send");
    let name = unique_name("smtest");

    let receiver = LocalSmMailbox::create(&receiver_fabric, &name);
    receiver.activate().await.unwrap();

    let address = MailboxAddress::shared_memory(&name);
    let handle = sender_fabric.find(&address).await.unwrap();
    assert!(handle.is_proxy());

    handle
        .post(Box::new(TestMessage::new("across processes")))
        .await
        .unwrap();
    assert_eq!(handle.sent_count(), 1);

    let received = receiver
        .get_message(Some(Duration::from_secs(2)))
        .await
        .expect("frame drained from the kernel queue");
    let received = received.as_any().downcast_ref::<TestMessage>().unwrap();
    assert_eq!(received.payload, "across processes");

    drop(handle);
    receiver.deactivate().await.unwrap();
    sender_fabric.shutdown().await;
    receiver_fabric.shutdown().await;
}

#[tokio::test]
async fn full_queue_fails_the_non_blocking_post() {
    let sender_fabric = test_fabric("ne-sm-full");
    let name = unique_name("smfull");

    // No receiver is draining; the proxy creates the queue and fills it
    let address = MailboxAddress::shared_memory(&name);
    let handle = sender_fabric.find(&address).await.unwrap();

    let mut full_error = None;
    for i in 0..32 {
        match handle
            .post(Box::new(TestMessage::new(&format!("frame {i}"))))
            .await
        {
            Ok(()) => continue,
            Err(e) => {
                full_error = Some(e);
                break;
            }
        }
    }
    assert!(
        matches!(full_error, Some(Error::TransportTransient(_))),
        "a bounded kernel queue must eventually refuse the non-blocking post"
    );

    drop(handle);
    sender_fabric.shutdown().await;
    // The receiver normally unlinks the queue; no receiver ran here
    let _ = std::fs::remove_file(format!("/dev/mqueue/postbus_{name}"));
}

#[tokio::test]
async fn receiver_unlinks_the_queue_on_deactivate() {
    let fabric = test_fabric("ne-sm-unlink");
    let name = unique_name("smunlink");

    let receiver = LocalSmMailbox::create(&fabric, &name);
    receiver.activate().await.unwrap();
    let queue_path = format!("/dev/mqueue/postbus_{name}");
    assert!(std::path::Path::new(&queue_path).exists());

    receiver.deactivate().await.unwrap();
    assert!(!std::path::Path::new(&queue_path).exists());
    fabric.shutdown().await;
}
