//! Channel population, failover and dedup across relays

use super::*;
use geochat::ChatError;
use std::collections::HashSet;

#[tokio::test]
async fn test_channel_survives_unreachable_relay_and_dedups_on_reconnect() {
    let port_a = reserved_port().await;
    let relay_b = MockRelay::start().await;
    let t = now();

    let first = signed(EventClass::Ephemeral, "u4pr", "first", t + 5);
    let second = signed(EventClass::Ephemeral, "u4pr", "second", t + 6);
    let note = signed(EventClass::Durable, "u4pr", "note", t - 100);
    for event in [&first, &second, &note] {
        relay_b.store(event.clone());
    }

    let chat = GeoChat::new(fast_config(vec![url_for(port_a), relay_b.url()])).unwrap();
    let key = chat.join_cell("u4pr").await.unwrap();

    let messages = wait_for_messages(&chat, &key, 3).await;
    let contents: Vec<&str> = messages.iter().map(|m| m.content()).collect();
    assert_eq!(contents, vec!["note", "first", "second"]);
    wait_for_status(&chat, &key, ChannelStatus::Live).await;

    // New traffic reaches the channel through B alone while A is down.
    let live = signed(EventClass::Ephemeral, "u4pr", "while a is down", t + 7);
    relay_b.inject(live.clone());
    let messages = wait_for_messages(&chat, &key, 4).await;
    assert_eq!(messages.last().unwrap().content(), "while a is down");
    assert!(
        chat.relay_stats()
            .await
            .iter()
            .any(|s| s.url == url_for(port_a) && s.state != ConnectionState::Connected)
    );

    // Relay A comes up holding the same events plus one more.
    let relay_a = MockRelay::start_on(port_a).await;
    for event in [&first, &second, &note, &live] {
        relay_a.store(event.clone());
    }
    relay_a.store(signed(EventClass::Ephemeral, "u4pr", "third", t + 8));
    wait_for_connected(&chat, &relay_a.url()).await;

    let messages = wait_for_messages(&chat, &key, 5).await;
    let ids: HashSet<&str> = messages.iter().map(|m| m.id()).collect();
    assert_eq!(ids.len(), 5);
    assert_eq!(messages.last().unwrap().content(), "third");
    assert!(
        messages
            .windows(2)
            .all(|w| w[0].order_key() <= w[1].order_key())
    );

    let stats = chat.merge_stats(&key).await.unwrap();
    assert_eq!(stats.accepted, 5);
    assert!(stats.duplicates >= 4);
    assert_eq!(chat.status(&key).await.unwrap(), ChannelStatus::Live);

    chat.shutdown().await;
}

#[tokio::test]
async fn test_durable_event_for_another_cell_never_appears() {
    let relay = MockRelay::start().await;
    let t = now();
    relay.store(signed(EventClass::Durable, "u4pr", "here", t - 60));
    relay.store(signed(EventClass::Durable, "9q8y", "elsewhere", t - 30));
    // The relay returns notes from every cell despite the `#g` hint.
    relay.ignore_tag_queries();

    let chat = GeoChat::new(fast_config(vec![relay.url()])).unwrap();
    let key = chat.join_cell("u4pr").await.unwrap();

    wait_for_status(&chat, &key, ChannelStatus::Live).await;
    let messages = wait_for_messages(&chat, &key, 1).await;
    assert_eq!(messages[0].content(), "here");

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(chat.messages(&key).await.unwrap().len(), 1);
    assert_eq!(chat.merge_stats(&key).await.unwrap().off_channel, 1);

    chat.shutdown().await;
}

#[tokio::test]
async fn test_historical_query_asks_relay_for_channel_cells() {
    let relay = MockRelay::start().await;
    let t = now();
    relay.store(signed(EventClass::Durable, "u4pr", "here", t - 60));
    relay.store(signed(EventClass::Durable, "9q8y", "elsewhere", t - 30));

    let chat = GeoChat::new(fast_config(vec![relay.url()])).unwrap();
    let key = chat.join_cell("u4pr").await.unwrap();
    wait_for_status(&chat, &key, ChannelStatus::Live).await;
    wait_for_messages(&chat, &key, 1).await;

    // A relay honouring the hint never sends the other cell's note.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let stats = chat.merge_stats(&key).await.unwrap();
    assert_eq!(stats.accepted, 1);
    assert_eq!(stats.off_channel, 0);

    chat.shutdown().await;
}

#[tokio::test]
async fn test_leaving_one_channel_keeps_the_other() {
    let relay = MockRelay::start().await;
    let t = now();
    relay.store(signed(EventClass::Ephemeral, "u4pr", "paris", t + 5));
    relay.store(signed(EventClass::Ephemeral, "9q8y", "bay", t + 5));

    let chat = GeoChat::new(fast_config(vec![relay.url()])).unwrap();
    let paris = chat.join_cell("u4pr").await.unwrap();
    let bay = chat.join_cell("9q8y").await.unwrap();
    wait_for_messages(&chat, &paris, 1).await;
    wait_for_messages(&chat, &bay, 1).await;
    relay.wait_for_open_subscriptions(4).await;

    chat.leave(&paris).await.unwrap();
    relay.wait_for_open_subscriptions(2).await;
    assert!(matches!(
        chat.messages(&paris).await,
        Err(ChatError::ChannelNotFound(_))
    ));

    relay.inject(signed(EventClass::Ephemeral, "9q8y", "still here", t + 6));
    let messages = wait_for_messages(&chat, &bay, 2).await;
    assert_eq!(messages[1].content(), "still here");
    assert_eq!(chat.channels().await, vec![bay]);

    chat.shutdown().await;
}

#[tokio::test]
async fn test_relay_restart_reports_unavailable_then_recovers() {
    let relay = MockRelay::start().await;
    let port = relay.port();
    let url = relay.url();
    let t = now();

    let chat = GeoChat::new(fast_config(vec![url.clone()])).unwrap();
    let key = chat.join_cell("u4pr").await.unwrap();
    wait_for_status(&chat, &key, ChannelStatus::Live).await;
    assert!(relay.request_count() >= 2);

    relay.stop().await;
    wait_for_status(&chat, &key, ChannelStatus::Unavailable).await;

    let relay = MockRelay::start_on(port).await;
    relay.store(signed(EventClass::Ephemeral, "u4pr", "back", t + 5));
    wait_for_connected(&chat, &url).await;

    let messages = wait_for_messages(&chat, &key, 1).await;
    assert_eq!(messages[0].content(), "back");
    // Both subscriptions were replayed on the new connection.
    assert!(relay.request_count() >= 2);
    wait_for_status(&chat, &key, ChannelStatus::Live).await;

    chat.shutdown().await;
}
