//! In-memory gateway shared by the integration tests
//!
//! `MockConnector` hands every accepted connection to the test as a
//! `ServerConn`, which plays the platform side of the protocol.

#![allow(dead_code)]

use async_trait::async_trait;
use chat_gateway::error::GatewayError;
use chat_gateway::rest::{GatewayInfo, GatewayInfoSource, SessionStartLimit};
use chat_gateway::shard::{CloseInfo, Connector, Inbound, Transport};
use chat_gateway::{handler_fn, Event, EventHandler, SessionPolicy, Token, TokenSource};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

pub const ENDPOINT: &str = "wss://gateway.test/websocket";

/// What the n-th dial does
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialBehavior {
    Accept,
    Fail,
    /// Never completes; only the dial timeout or stop ends it
    Hang,
}

pub struct MockConnector {
    dials: AtomicUsize,
    behavior: Box<dyn Fn(usize) -> DialBehavior + Send + Sync>,
    accepted: mpsc::UnboundedSender<ServerConn>,
}

impl MockConnector {
    pub fn new(
        behavior: impl Fn(usize) -> DialBehavior + Send + Sync + 'static,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ServerConn>) {
        let (accepted, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            dials: AtomicUsize::new(0),
            behavior: Box::new(behavior),
            accepted,
        });
        (connector, rx)
    }

    pub fn accepting() -> (Arc<Self>, mpsc::UnboundedReceiver<ServerConn>) {
        Self::new(|_| DialBehavior::Accept)
    }

    pub fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn Transport>, GatewayError> {
        let n = self.dials.fetch_add(1, Ordering::SeqCst);
        match (self.behavior)(n) {
            DialBehavior::Accept => {
                let (to_client, inbound) = mpsc::unbounded_channel();
                let (outbound, from_client) = mpsc::unbounded_channel();
                let _ = self.accepted.send(ServerConn {
                    url: url.to_string(),
                    to_client,
                    from_client,
                });
                Ok(Box::new(MockTransport { inbound, outbound }))
            }
            DialBehavior::Fail => Err(GatewayError::Dial {
                url: url.to_string(),
                source: "connection refused".into(),
            }),
            DialBehavior::Hang => std::future::pending().await,
        }
    }
}

struct MockTransport {
    inbound: mpsc::UnboundedReceiver<Inbound>,
    outbound: mpsc::UnboundedSender<String>,
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&mut self, text: String) -> Result<(), GatewayError> {
        self.outbound
            .send(text)
            .map_err(|_| GatewayError::Transport("server went away".to_string()))
    }

    async fn recv(&mut self) -> Option<Result<Inbound, GatewayError>> {
        self.inbound.recv().await.map(Ok)
    }

    async fn close(&mut self) {
        self.inbound.close();
    }
}

/// Server side of one accepted connection
pub struct ServerConn {
    pub url: String,
    to_client: mpsc::UnboundedSender<Inbound>,
    from_client: mpsc::UnboundedReceiver<String>,
}

impl ServerConn {
    fn push(&self, payload: Value) {
        let _ = self.to_client.send(Inbound::Text(payload.to_string()));
    }

    pub fn send_raw(&self, text: &str) {
        let _ = self.to_client.send(Inbound::Text(text.to_string()));
    }

    pub fn hello(&self, heartbeat_interval_ms: u64) {
        self.push(json!({"op": 10, "d": {"heartbeat_interval": heartbeat_interval_ms}}));
    }

    pub fn ready(&self, session_id: &str, seq: u64) {
        self.push(json!({
            "op": 0,
            "s": seq,
            "t": "READY",
            "id": format!("READY:{seq}"),
            "d": {"session_id": session_id, "user": {"id": "1", "bot": true}}
        }));
    }

    pub fn resumed(&self) {
        self.push(json!({"op": 0, "t": "RESUMED", "d": ""}));
    }

    pub fn dispatch(&self, seq: u64, event_type: &str) {
        self.push(json!({
            "op": 0,
            "s": seq,
            "t": event_type,
            "id": format!("{event_type}:{seq}"),
            "d": {"seq": seq}
        }));
    }

    pub fn heartbeat_ack(&self) {
        self.push(json!({"op": 11}));
    }

    pub fn invalid_session(&self, resumable: bool) {
        self.push(json!({"op": 9, "d": resumable}));
    }

    pub fn close(&self, code: u16, reason: &str) {
        let _ = self.to_client.send(Inbound::Closed(Some(CloseInfo {
            code,
            reason: reason.to_string(),
        })));
    }

    /// Next raw payload from the shard; `None` once it dropped the connection
    pub async fn next_payload(&mut self) -> Option<Value> {
        let text = self.from_client.recv().await?;
        Some(serde_json::from_str(&text).expect("shard sent invalid json"))
    }

    /// Next payload with `op`, acknowledging heartbeats on the way
    pub async fn expect_op(&mut self, op: u64) -> Value {
        loop {
            let payload = self
                .next_payload()
                .await
                .unwrap_or_else(|| panic!("connection dropped while waiting for op {op}"));
            if payload["op"] == op {
                return payload;
            }
            if payload["op"] == 1 {
                self.heartbeat_ack();
                continue;
            }
            panic!("expected op {op}, got {payload}");
        }
    }

    /// Wait until the shard drops this connection, acknowledging heartbeats
    pub async fn closed_by_client(&mut self) {
        while let Some(payload) = self.next_payload().await {
            if payload["op"] == 1 {
                self.heartbeat_ack();
            }
        }
    }
}

/// One identify seen by the auto server
#[derive(Debug, Clone)]
pub struct IdentifyRecord {
    pub shard_id: u32,
    pub total_shards: u32,
    pub at: Instant,
}

/// Serve every accepted connection: hello, READY on identify, ack heartbeats
pub fn spawn_auto_server(
    accepted: mpsc::UnboundedReceiver<ServerConn>,
) -> Arc<Mutex<Vec<IdentifyRecord>>> {
    spawn_server(accepted, Duration::ZERO)
}

/// Like `spawn_auto_server`, but READY follows each identify after `ready_delay`
pub fn spawn_server(
    mut accepted: mpsc::UnboundedReceiver<ServerConn>,
    ready_delay: Duration,
) -> Arc<Mutex<Vec<IdentifyRecord>>> {
    let records = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&records);

    tokio::spawn(async move {
        while let Some(mut conn) = accepted.recv().await {
            let log = Arc::clone(&log);
            tokio::spawn(async move {
                conn.hello(45_000);
                while let Some(payload) = conn.next_payload().await {
                    match payload["op"].as_u64() {
                        Some(1) => conn.heartbeat_ack(),
                        Some(2) => {
                            let shard_id = payload["d"]["shard"][0].as_u64().unwrap() as u32;
                            let total_shards = payload["d"]["shard"][1].as_u64().unwrap() as u32;
                            log.lock().unwrap().push(IdentifyRecord {
                                shard_id,
                                total_shards,
                                at: Instant::now(),
                            });
                            if !ready_delay.is_zero() {
                                tokio::time::sleep(ready_delay).await;
                            }
                            conn.ready(&format!("session-{shard_id}"), 1);
                        }
                        _ => {}
                    }
                }
            });
        }
    });

    records
}

/// Gateway info source answering from a fixed value
pub struct StaticInfo(pub GatewayInfo);

#[async_trait]
impl GatewayInfoSource for StaticInfo {
    async fn gateway_info(&self, _token: &Token) -> Result<GatewayInfo, GatewayError> {
        Ok(self.0.clone())
    }
}

pub fn gateway_info(shards: u32, max_concurrency: u32) -> Arc<StaticInfo> {
    Arc::new(StaticInfo(GatewayInfo {
        url: ENDPOINT.to_string(),
        shards,
        session_start_limit: SessionStartLimit {
            total: 1000,
            remaining: 1000,
            reset_after: Duration::from_secs(86_400),
            max_concurrency,
        },
    }))
}

pub fn test_policy() -> SessionPolicy {
    SessionPolicy {
        backoff_base: Duration::from_millis(100),
        backoff_max: Duration::from_secs(2),
        ..SessionPolicy::default()
    }
}

pub fn token() -> Arc<Token> {
    Arc::new(Token::bot(1024, "s3cret"))
}

/// Answers the first `answered` calls, then never returns
pub struct StallingTokens {
    answered: usize,
    calls: AtomicUsize,
}

impl StallingTokens {
    pub fn after(answered: usize) -> Arc<Self> {
        Arc::new(Self {
            answered,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenSource for StallingTokens {
    async fn token(&self) -> Result<Token, GatewayError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) < self.answered {
            return Ok(Token::bot(1024, "s3cret"));
        }
        std::future::pending().await
    }
}

/// Handler that records every event it sees
pub fn recorder() -> (Arc<dyn EventHandler>, Arc<Mutex<Vec<Event>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&seen);
    let handler = handler_fn(move |event| {
        log.lock().unwrap().push(event.clone());
        Ok(())
    });
    (handler, seen)
}

/// Poll `condition` while letting paused time advance
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..100_000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}
