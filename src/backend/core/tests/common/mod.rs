//! Shared test doubles for the integration suites.
#![allow(dead_code)]

use async_trait::async_trait;
use modelsync_core::config::MessengerConfig;
use modelsync_core::db::{Database, MemoryDatabase};
use modelsync_core::dispatcher::Dispatcher;
use modelsync_core::error::Result;
use modelsync_core::messenger::{Connection, Messenger, Response};
use modelsync_core::model::Hooks;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

pub const RECV_TIMEOUT: Duration = Duration::from_secs(2);
pub const QUIET_PERIOD: Duration = Duration::from_millis(150);

// ============================================================================
// Counting / gated database
// ============================================================================

/// Wraps [`MemoryDatabase`], counts calls and can hold reads open.
pub struct CountingDatabase {
    inner: MemoryDatabase,
    reads: AtomicUsize,
    writes: AtomicUsize,
    gate: watch::Sender<bool>,
}

impl CountingDatabase {
    pub fn new(inner: MemoryDatabase) -> Self {
        let (gate, _) = watch::channel(true);
        Self {
            inner,
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
            gate,
        }
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Reads started from now on wait until [`open_reads`](Self::open_reads).
    pub fn hold_reads(&self) {
        self.gate.send_replace(false);
    }

    pub fn open_reads(&self) {
        self.gate.send_replace(true);
    }

    /// Wait until `n` reads have reached the database.
    pub async fn wait_for_reads(&self, n: usize) {
        tokio::time::timeout(RECV_TIMEOUT, async {
            while self.reads() < n {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("database reads did not arrive");
    }
}

#[async_trait]
impl Database for CountingDatabase {
    async fn read(&self, query: &str, params: &Value) -> Result<Value> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let mut gate = self.gate.subscribe();
        let _ = gate.wait_for(|open| *open).await;
        self.inner.read(query, params).await
    }

    async fn write(&self, query: &str, params: &Value) -> Result<Value> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.write(query, params).await
    }
}

/// `task` table with records 7 (open), 8 (open) and 9 (closed).
pub fn task_store() -> MemoryDatabase {
    let db = MemoryDatabase::with_entities(["task"]);
    db.seed(
        "task",
        vec![
            json!({"id": 7, "title": "ship release", "status": "open"}),
            json!({"id": 8, "title": "write notes", "status": "open"}),
            json!({"id": 9, "title": "triage", "status": "closed"}),
        ],
    )
    .unwrap();
    db
}

pub struct Harness {
    pub db: Arc<CountingDatabase>,
    pub messenger: Arc<Messenger>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_hooks(Hooks::default())
    }

    pub fn with_hooks(hooks: Hooks) -> Self {
        Self::build(hooks, MessengerConfig::default())
    }

    pub fn with_config(config: MessengerConfig) -> Self {
        Self::build(Hooks::default(), config)
    }

    fn build(hooks: Hooks, config: MessengerConfig) -> Self {
        let db = Arc::new(CountingDatabase::new(task_store()));
        let database: Arc<dyn Database> = db.clone();
        let mut dispatcher = Dispatcher::new();
        dispatcher.register_entity("task", database, hooks).unwrap();
        let messenger = Arc::new(Messenger::new(Arc::new(dispatcher), config));
        Self { db, messenger }
    }

    pub fn connect(&self) -> Client {
        let (connection, rx) = self.messenger.open_connection(false);
        Client { connection, rx }
    }

    pub fn connect_live(&self) -> Client {
        let (connection, rx) = self.messenger.open_connection(true);
        Client { connection, rx }
    }
}

// ============================================================================
// Channel-backed client
// ============================================================================

pub struct Client {
    pub connection: Connection,
    pub rx: mpsc::Receiver<Response>,
}

impl Client {
    pub async fn send(&self, messenger: &Messenger, frame: Value) {
        messenger.handle(&self.connection, &frame.to_string()).await;
    }

    /// Send `frame` and return the reply.
    pub async fn request(&mut self, messenger: &Messenger, frame: Value) -> Response {
        self.send(messenger, frame).await;
        self.recv().await
    }

    pub async fn recv(&mut self) -> Response {
        tokio::time::timeout(RECV_TIMEOUT, self.rx.recv())
            .await
            .expect("timed out waiting for a message")
            .expect("connection channel closed")
    }

    /// Assert nothing arrives for a short while.
    pub async fn assert_silent(&mut self) {
        match tokio::time::timeout(QUIET_PERIOD, self.rx.recv()).await {
            Ok(Some(message)) => panic!("unexpected message: {:?}", message),
            Ok(None) | Err(_) => {}
        }
    }
}

// ============================================================================
// Frames
// ============================================================================

pub fn frame(
    correlation_id: &str,
    method: &str,
    selector: Value,
    payload: Value,
    subscribe: Option<bool>,
) -> Value {
    json!({
        "head": {"correlationId": correlation_id},
        "body": {
            "entityType": "task",
            "method": method,
            "selector": selector,
            "payload": payload,
            "subscribe": subscribe,
        }
    })
}

pub fn read_id(correlation_id: &str, id: i64, subscribe: Option<bool>) -> Value {
    frame(correlation_id, "read", json!({"id": id}), Value::Null, subscribe)
}

pub fn read_open(correlation_id: &str, subscribe: Option<bool>) -> Value {
    frame(
        correlation_id,
        "read",
        json!({"filter": {"status": "open"}, "order": {"id": "asc"}}),
        Value::Null,
        subscribe,
    )
}

pub fn ids(result: &Value) -> Vec<i64> {
    result
        .as_array()
        .expect("result is a list")
        .iter()
        .map(|r| r["id"].as_i64().expect("record id"))
        .collect()
}
