//! Publishing through a partially failed pool

use super::*;
use geochat::ChatError;
use geochat_client::ClientError;

#[tokio::test]
async fn test_publish_succeeds_with_one_relay_down() {
    let port_down = reserved_port().await;
    let relay = MockRelay::start().await;

    let chat = GeoChat::new(fast_config(vec![url_for(port_down), relay.url()])).unwrap();
    let key = chat.join_cell("u4pr").await.unwrap();
    wait_for_status(&chat, &key, ChannelStatus::Live).await;
    wait_for_connected(&chat, &relay.url()).await;

    let event = signed(EventClass::Ephemeral, "u4pr", "posted", now() + 10);
    let report = chat.publish(event.clone()).await.unwrap();
    assert_eq!(report.event_id, event.id);
    assert_eq!(report.accepted, vec![relay.url()]);
    assert_eq!(report.rejected.len(), 1);
    assert_eq!(report.rejected[0].0, url_for(port_down));

    // The relay echoes it back on the live subscription.
    let messages = wait_for_messages(&chat, &key, 1).await;
    assert_eq!(messages[0].id(), event.id);

    chat.shutdown().await;
}

#[tokio::test]
async fn test_publish_fails_when_every_relay_is_down() {
    let first = reserved_port().await;
    let second = reserved_port().await;

    let chat = GeoChat::new(fast_config(vec![url_for(first), url_for(second)])).unwrap();
    let event = signed(EventClass::Ephemeral, "u4pr", "nobody", now());

    match chat.publish(event).await {
        Err(ChatError::Client(ClientError::PublishFailed { reasons, .. })) => {
            assert_eq!(reasons.len(), 2);
        }
        other => panic!("expected publish failure, got {other:?}"),
    }

    chat.shutdown().await;
}

#[tokio::test]
async fn test_publish_after_shutdown_fails() {
    let relay = MockRelay::start().await;
    let chat = GeoChat::new(fast_config(vec![relay.url()])).unwrap();
    chat.shutdown().await;
    chat.shutdown().await;

    let event = signed(EventClass::Ephemeral, "u4pr", "late", now());
    assert!(matches!(
        chat.publish(event).await,
        Err(ChatError::Client(ClientError::PoolClosed))
    ));
}
