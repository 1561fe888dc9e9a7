//! Read/unread tracking against live traffic

use super::*;

#[tokio::test]
async fn test_mark_read_then_one_live_event_is_one_unread() {
    let relay = MockRelay::start().await;
    let t = now();
    relay.store(signed(EventClass::Durable, "u4pr", "old note", t - 300));

    let chat = GeoChat::new(fast_config(vec![relay.url()])).unwrap();
    let key = chat.join_cell("u4pr").await.unwrap();
    wait_for_messages(&chat, &key, 1).await;
    wait_for_status(&chat, &key, ChannelStatus::Live).await;
    assert_eq!(chat.unread(&key).await.unwrap(), 1);

    chat.mark_read(&key).await.unwrap();
    assert_eq!(chat.unread(&key).await.unwrap(), 0);
    assert!(chat.last_read_at(&key).await.unwrap().is_some());

    let mut changes = chat.watch(&key).await.unwrap();
    changes.borrow_and_update();
    relay.inject(signed(EventClass::Ephemeral, "u4pr", "hello", t + 10));
    tokio::time::timeout(WAIT, changes.changed())
        .await
        .unwrap()
        .unwrap();

    wait_for_messages(&chat, &key, 2).await;
    assert_eq!(chat.unread(&key).await.unwrap(), 1);

    chat.mark_read(&key).await.unwrap();
    assert_eq!(chat.unread(&key).await.unwrap(), 0);

    chat.shutdown().await;
}

#[tokio::test]
async fn test_unread_survives_relay_duplicates() {
    let relay_a = MockRelay::start().await;
    let relay_b = MockRelay::start().await;
    let t = now();

    let chat = GeoChat::new(fast_config(vec![relay_a.url(), relay_b.url()])).unwrap();
    let key = chat.join_cell("u4pr").await.unwrap();
    wait_for_status(&chat, &key, ChannelStatus::Live).await;
    chat.mark_read(&key).await.unwrap();

    // The same event delivered by both relays counts once.
    let event = signed(EventClass::Ephemeral, "u4pr", "twice", t + 10);
    relay_a.inject(event.clone());
    relay_b.inject(event);

    wait_for_messages(&chat, &key, 1).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(chat.messages(&key).await.unwrap().len(), 1);
    assert_eq!(chat.unread(&key).await.unwrap(), 1);

    chat.shutdown().await;
}
