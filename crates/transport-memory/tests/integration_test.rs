//! Integration tests for memory transport

use std::time::Duration;

use bytes::Bytes;
use cachex_topology::NodeId;
use cachex_transport::{Config, Transport, TransportError};
use cachex_transport_memory::MemoryHub;
use futures::StreamExt;
use tokio::time::timeout;

#[tokio::test]
async fn test_envelopes_arrive_in_order() {
    let _ = tracing_subscriber::fmt::try_init();

    let hub = MemoryHub::new();
    let a = hub.transport(NodeId::from_seed(1));
    let b = hub.transport(NodeId::from_seed(2));
    let mut incoming = b.incoming();

    for i in 0..5u8 {
        a.send_envelope(&NodeId::from_seed(2), &Bytes::from(vec![i]), "test")
            .await
            .expect("send failed");
    }

    for i in 0..5u8 {
        let envelope = timeout(Duration::from_secs(1), incoming.next())
            .await
            .expect("timed out")
            .expect("stream ended");
        assert_eq!(envelope.sender, NodeId::from_seed(1));
        assert_eq!(envelope.message_type, "test");
        assert_eq!(envelope.payload.as_ref(), &[i]);
    }
}

#[tokio::test]
async fn test_disconnected_member_is_unreachable() {
    let hub = MemoryHub::new();
    let a = hub.transport(NodeId::from_seed(1));
    let _b = hub.transport(NodeId::from_seed(2));

    hub.disconnect(&NodeId::from_seed(2));

    let result = a
        .send_envelope(&NodeId::from_seed(2), &Bytes::from_static(b"x"), "test")
        .await;
    assert!(matches!(result, Err(TransportError::Unreachable(_))));
}

#[tokio::test]
async fn test_shutdown_keeps_replacement_route() {
    let hub = MemoryHub::new();
    let old = hub.transport(NodeId::from_seed(3));
    let _new = hub.transport(NodeId::from_seed(3));

    old.shutdown().await.unwrap();

    assert!(hub.is_connected(&NodeId::from_seed(3)));
}

#[tokio::test]
async fn test_oversized_payload_is_rejected() {
    let hub = MemoryHub::with_config(Config {
        max_message_size: 4,
    });
    let a = hub.transport(NodeId::from_seed(1));
    let _b = hub.transport(NodeId::from_seed(2));

    let result = a
        .send_envelope(&NodeId::from_seed(2), &Bytes::from_static(b"too big"), "test")
        .await;
    assert!(matches!(
        result,
        Err(TransportError::MessageTooLarge { size: 7, max: 4 })
    ));
}

#[tokio::test]
async fn test_incoming_can_be_taken_once() {
    let hub = MemoryHub::new();
    let a = hub.transport(NodeId::from_seed(1));

    let _first = a.incoming();
    let mut second = a.incoming();

    assert!(second.next().await.is_none());
}
