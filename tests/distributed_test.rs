//! Distributed (TCP) mailbox scenario tests on the loopback interface

mod common;

use common::{TestMessage, test_fabric};
use postbus::{
    DistributedMailbox, DistributedMailboxConfig, LocationType, MailboxAddress, Message,
};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

fn endpoint(port: u16) -> SocketAddrV4 {
    SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)
}

#[tokio::test]
async fn tcp_round_trip_with_priority_tail() {
    let server_fabric = test_fabric("ne-server");
    let sender_fabric = test_fabric("ne-sender");

    let server = DistributedMailbox::create(
        &server_fabric,
        "R",
        endpoint(19310),
        DistributedMailboxConfig::default(),
    );
    server.activate().await.unwrap();

    // The sender fabric has no such mailbox; find synthesizes a proxy
    let address = MailboxAddress::distributed("R", endpoint(19310));
    let handle = sender_fabric.find(&address).await.unwrap();
    assert!(handle.is_proxy());

    handle
        .post(Box::new(TestMessage::with_priority("over tcp", 3)))
        .await
        .unwrap();
    assert_eq!(handle.sent_count(), 1);

    let received = server
        .get_message(Some(Duration::from_secs(2)))
        .await
        .expect("message crossed the stream");
    let received = received.as_any().downcast_ref::<TestMessage>().unwrap();
    assert_eq!(received.payload, "over tcp");
    assert_eq!(received.priority(), 3);
    // The receive path stamped the peer endpoint
    assert_eq!(
        received.source_address().location_type,
        LocationType::Distributed
    );

    drop(handle);
    server.deactivate().await.unwrap();
    sender_fabric.shutdown().await;
    server_fabric.shutdown().await;
}

#[tokio::test]
async fn same_process_senders_use_the_local_equivalent() {
    let fabric = test_fabric("ne-alias");

    let server = DistributedMailbox::create(
        &fabric,
        "aliased",
        endpoint(19311),
        DistributedMailboxConfig::default(),
    );
    server.activate().await.unwrap();

    // find(LOCAL, name) resolves to the server mailbox itself, bypassing
    // serialization entirely
    let handle = fabric
        .find(&MailboxAddress::local("aliased"))
        .await
        .unwrap();
    assert!(!handle.is_proxy());
    handle
        .post(Box::new(TestMessage::new("no serialization")))
        .await
        .unwrap();

    let received = server
        .get_message(Some(Duration::from_secs(1)))
        .await
        .expect("direct enqueue");
    let received = received.as_any().downcast_ref::<TestMessage>().unwrap();
    assert_eq!(received.payload, "no serialization");

    drop(handle);
    server.deactivate().await.unwrap();
    fabric.shutdown().await;
}

#[tokio::test]
async fn failover_by_dropping_and_refinding_the_handle() {
    let server_fabric = test_fabric("ne-failover-server");
    let sender_fabric = test_fabric("ne-failover-sender");
    let address = MailboxAddress::distributed("R2", endpoint(19312));

    let first_server = DistributedMailbox::create(
        &server_fabric,
        "R2",
        endpoint(19312),
        DistributedMailboxConfig::default(),
    );
    first_server.activate().await.unwrap();

    let handle = sender_fabric.find(&address).await.unwrap();
    handle.post(Box::new(TestMessage::new("m1"))).await.unwrap();
    let m1 = first_server
        .get_message(Some(Duration::from_secs(2)))
        .await
        .expect("first message");
    assert_eq!(
        m1.as_any().downcast_ref::<TestMessage>().unwrap().payload,
        "m1"
    );

    // Kill and restart the receiver on the same endpoint
    first_server.deactivate().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    let second_server = DistributedMailbox::create(
        &server_fabric,
        "R2",
        endpoint(19312),
        DistributedMailboxConfig::default(),
    );
    second_server.activate().await.unwrap();

    // The old stream may absorb one send into dead buffers; the caller's
    // contract is to drop the handle and re-find on any error
    let _ = handle.post(Box::new(TestMessage::new("stale"))).await;
    drop(handle);
    // Let the deferred proxy deactivation clear the registry entry
    tokio::time::sleep(Duration::from_millis(100)).await;

    let fresh = sender_fabric.find(&address).await.unwrap();
    fresh.post(Box::new(TestMessage::new("m2"))).await.unwrap();

    let mut seen_m2 = false;
    for _ in 0..3 {
        match second_server.get_message(Some(Duration::from_secs(2))).await {
            Some(message) => {
                let payload = &message.as_any().downcast_ref::<TestMessage>().unwrap().payload;
                if payload == "m2" {
                    seen_m2 = true;
                    break;
                }
            }
            None => break,
        }
    }
    assert!(seen_m2, "m2 must arrive on the restarted receiver");

    drop(fresh);
    second_server.deactivate().await.unwrap();
    sender_fabric.shutdown().await;
    server_fabric.shutdown().await;
}

#[tokio::test]
async fn repeated_find_reuses_the_registered_proxy() {
    let server_fabric = test_fabric("ne-reuse-server");
    let sender_fabric = test_fabric("ne-reuse-sender");
    let address = MailboxAddress::distributed("R3", endpoint(19313));

    let server = DistributedMailbox::create(
        &server_fabric,
        "R3",
        endpoint(19313),
        DistributedMailboxConfig::default(),
    );
    server.activate().await.unwrap();

    let first = sender_fabric.find(&address).await.unwrap();
    let second = sender_fabric.find(&address).await.unwrap();

    first.post(Box::new(TestMessage::new("a"))).await.unwrap();
    second.post(Box::new(TestMessage::new("b"))).await.unwrap();
    // Both handles drive the same proxy mailbox
    assert_eq!(first.sent_count(), 2);
    assert_eq!(second.sent_count(), 2);

    let mut payloads = Vec::new();
    for _ in 0..2 {
        let message = server
            .get_message(Some(Duration::from_secs(2)))
            .await
            .expect("delivery");
        payloads.push(
            message
                .as_any()
                .downcast_ref::<TestMessage>()
                .unwrap()
                .payload
                .clone(),
        );
    }
    payloads.sort();
    assert_eq!(payloads, ["a", "b"]);

    drop(first);
    drop(second);
    server.deactivate().await.unwrap();
    sender_fabric.shutdown().await;
    server_fabric.shutdown().await;
}

#[tokio::test]
async fn connect_to_a_dead_endpoint_fails_the_find() {
    let fabric = test_fabric("ne-dead");
    let address = MailboxAddress::distributed("ghost", endpoint(19315));
    let result = fabric.find(&address).await;
    assert!(result.is_err());
    fabric.shutdown().await;
}
