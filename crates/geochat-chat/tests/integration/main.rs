//! Integration tests for channels merged from several relays
//!
//! Every test talks to in-process mock relays over real websockets on
//! 127.0.0.1.

pub mod channels;
pub mod publish;
pub mod read_state;

use futures::{SinkExt, StreamExt};
use geochat::{ChannelStatus, GeoChat, GeoChatConfig};
use geochat_client::{ConnectionState, Filter};
use geochat_core::{ChatEvent, Event, EventClass, GeoCell, UnsignedEvent};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Once};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(5);
const POLL: Duration = Duration::from_millis(20);

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
    });
}

pub fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

/// A port nothing is listening on.
pub async fn reserved_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

pub fn url_for(port: u16) -> String {
    format!("ws://127.0.0.1:{port}")
}

/// Config with timings short enough for tests.
pub fn fast_config(relays: Vec<String>) -> GeoChatConfig {
    init_tracing();
    let mut config = GeoChatConfig::with_relays(relays);
    config.connect_timeout_ms = 500;
    config.publish_timeout_ms = 1000;
    config.backoff.initial_ms = 50;
    config.backoff.max_ms = 200;
    config
}

pub fn signed(class: EventClass, cell: &str, content: &str, created_at: u64) -> Event {
    UnsignedEvent::new("a".repeat(64), class, cell, content, created_at)
        .attach_proof("0".repeat(128))
        .unwrap()
}

pub async fn wait_for_messages(chat: &GeoChat, key: &GeoCell, count: usize) -> Vec<ChatEvent> {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let messages = chat.messages(key).await.unwrap();
        if messages.len() == count {
            return messages;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("expected {count} messages in {key}, have {}", messages.len());
        }
        tokio::time::sleep(POLL).await;
    }
}

pub async fn wait_for_status(chat: &GeoChat, key: &GeoCell, status: ChannelStatus) {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let current = chat.status(key).await.unwrap();
        if current == status {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("expected {key} to be {status}, still {current}");
        }
        tokio::time::sleep(POLL).await;
    }
}

pub async fn wait_for_connected(chat: &GeoChat, url: &str) {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let connected = chat
            .relay_stats()
            .await
            .iter()
            .any(|s| s.url == url && s.state == ConnectionState::Connected);
        if connected {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("relay {url} never connected");
        }
        tokio::time::sleep(POLL).await;
    }
}

type Outbound = mpsc::UnboundedSender<String>;

#[derive(Default)]
struct RelayState {
    events: Vec<Event>,
    next_connection: u64,
    /// Open subscriptions by (connection, subscription id)
    live: HashMap<(u64, String), (Vec<Filter>, Outbound)>,
    requests: usize,
    /// Answer REQs as if tag queries were not indexed
    ignore_tags: bool,
}

impl RelayState {
    fn broadcast(&self, event: &Event) {
        for ((_, id), (filters, out)) in &self.live {
            if filters.iter().any(|f| f.matches(event)) {
                let _ = out.send(json!(["EVENT", id, event]).to_string());
            }
        }
    }
}

/// Minimal relay: answers REQ from stored events then EOSE, stores EVENTs
/// and forwards them to open subscriptions.
pub struct MockRelay {
    port: u16,
    state: Arc<Mutex<RelayState>>,
    cancel: CancellationToken,
    acceptor: Option<JoinHandle<()>>,
}

impl MockRelay {
    pub async fn start() -> Self {
        Self::start_on(0).await
    }

    pub async fn start_on(port: u16) -> Self {
        init_tracing();
        let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let state = Arc::new(Mutex::new(RelayState::default()));
        let cancel = CancellationToken::new();

        let acceptor = tokio::spawn({
            let state = Arc::clone(&state);
            let cancel = cancel.clone();
            async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        accepted = listener.accept() => {
                            let Ok((socket, _)) = accepted else { continue };
                            tokio::spawn(serve(socket, Arc::clone(&state), cancel.child_token()));
                        }
                    }
                }
            }
        });

        Self {
            port,
            state,
            cancel,
            acceptor: Some(acceptor),
        }
    }

    /// Stop honouring `#` tag queries in stored-event lookups.
    pub fn ignore_tag_queries(&self) {
        self.state.lock().unwrap().ignore_tags = true;
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn url(&self) -> String {
        url_for(self.port)
    }

    /// Store an event for later REQs.
    pub fn store(&self, event: Event) {
        self.state.lock().unwrap().events.push(event);
    }

    /// Store an event and push it to every matching open subscription.
    pub fn inject(&self, event: Event) {
        let mut state = self.state.lock().unwrap();
        state.broadcast(&event);
        state.events.push(event);
    }

    pub fn request_count(&self) -> usize {
        self.state.lock().unwrap().requests
    }

    pub fn open_subscriptions(&self) -> usize {
        self.state.lock().unwrap().live.len()
    }

    pub async fn wait_for_open_subscriptions(&self, count: usize) {
        let deadline = tokio::time::Instant::now() + WAIT;
        while self.open_subscriptions() != count {
            if tokio::time::Instant::now() > deadline {
                panic!(
                    "expected {count} open subscriptions, have {}",
                    self.open_subscriptions()
                );
            }
            tokio::time::sleep(POLL).await;
        }
    }

    /// Drop every connection and stop listening.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(acceptor) = self.acceptor.take() {
            let _ = acceptor.await;
        }
    }
}

impl Drop for MockRelay {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn serve(socket: TcpStream, state: Arc<Mutex<RelayState>>, cancel: CancellationToken) {
    let Ok(ws) = accept_async(socket).await else {
        return;
    };
    let (mut sink, mut stream) = ws.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    let connection = {
        let mut state = state.lock().unwrap();
        state.next_connection += 1;
        state.next_connection
    };

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
            Some(text) = out_rx.recv() => {
                if sink.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    handle_frame(&state, connection, text.as_str(), &out_tx);
                }
                Some(Ok(_)) => {}
                _ => break,
            },
        }
    }

    state
        .lock()
        .unwrap()
        .live
        .retain(|(conn, _), _| *conn != connection);
}

fn handle_frame(state: &Mutex<RelayState>, connection: u64, text: &str, out: &Outbound) {
    let Ok(Value::Array(parts)) = serde_json::from_str::<Value>(text) else {
        return;
    };
    let mut state = state.lock().unwrap();
    match parts.first().and_then(Value::as_str) {
        Some("REQ") => {
            let Some(id) = parts.get(1).and_then(Value::as_str) else {
                return;
            };
            let filters: Vec<Filter> = parts[2..]
                .iter()
                .filter_map(|f| serde_json::from_value(f.clone()).ok())
                .collect();
            state.requests += 1;

            for filter in &filters {
                let mut filter = filter.clone();
                if state.ignore_tags {
                    filter.tags.clear();
                }
                let mut matching: Vec<&Event> =
                    state.events.iter().filter(|e| filter.matches(e)).collect();
                matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
                if let Some(limit) = filter.limit {
                    matching.truncate(limit as usize);
                }
                for event in matching {
                    let _ = out.send(json!(["EVENT", id, event]).to_string());
                }
            }
            let _ = out.send(json!(["EOSE", id]).to_string());
            state
                .live
                .insert((connection, id.to_string()), (filters, out.clone()));
        }
        Some("CLOSE") => {
            if let Some(id) = parts.get(1).and_then(Value::as_str) {
                state.live.remove(&(connection, id.to_string()));
            }
        }
        Some("EVENT") => {
            let Some(event) = parts
                .get(1)
                .and_then(|v| serde_json::from_value::<Event>(v.clone()).ok())
            else {
                return;
            };
            let _ = out.send(json!(["OK", event.id, true, ""]).to_string());
            state.broadcast(&event);
            state.events.push(event);
        }
        _ => {}
    }
}
