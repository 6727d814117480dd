//! The reactive model.
//!
//! A [`Model`] owns the materialized value of one record ([`Selector::ById`])
//! or one filtered view ([`Selector::ByFilter`]), runs the read/write/delete
//! pipeline against its [`Database`], and pushes updates to the connections
//! bound to it.
//!
//! # Lifecycle
//!
//! ```text
//! Unbound ──read/write──▶ Populated ──delete / last unbind──▶ Destroyed
//!    └────────────────delete / unbind─────────────────────────────┘
//! ```
//!
//! # Concurrency
//!
//! All state sits behind one `parking_lot::Mutex` that is never held across
//! an `.await`. Reads of an unpopulated (or stale) model are single-flight:
//! the first caller queries the database, later callers wait on a oneshot
//! channel for the same result. Every mutation bumps a version counter so a
//! read that raced a write returns the written value instead of its own.

pub mod cache;
pub mod hooks;
pub mod identifier;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use crate::db::{query_name, query_params, Database, QueryKind};
use crate::error::{Result, SyncError};
use crate::events::{change_topic, ChangeEvent, ChangeMethod, EventBus, ListenerId};
use crate::messenger::{Connection, ConnectionId, Method, Response};
use crate::observability::metrics;

pub use cache::ModelCache;
pub use hooks::{AllowAll, Guard, HookContext, Hooks};
pub use identifier::{canonical_json, Identifier, RawSelector, Selector};

static NEXT_MODEL_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique model handle. Used to recognise self-originated change events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ModelId(u64);

impl ModelId {
    fn next() -> Self {
        Self(NEXT_MODEL_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "model-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelState {
    /// Fresh from the dispatcher, no value yet.
    Unbound,
    /// Holds a materialized value.
    Populated,
    /// Terminal. Every operation fails with `ModelDestroyed`.
    Destroyed,
}

/// A connection bound to a model, with the correlation id pushes are tagged with.
#[derive(Debug, Clone)]
pub struct Subscriber {
    pub connection: Connection,
    pub correlation_id: Value,
}

struct ModelLink {
    bus: Arc<EventBus<ChangeEvent>>,
    cache: Option<Weak<ModelCache>>,
}

type ReadWaiter = oneshot::Sender<Result<Value>>;

struct ModelInner {
    selector: Option<Selector>,
    value: Option<Value>,
    stale: bool,
    version: u64,
    state: ModelState,
    subscribers: HashMap<ConnectionId, Subscriber>,
    listener: Option<ListenerId>,
    pending_read: Option<Vec<ReadWaiter>>,
}

enum ReadPlan {
    Cached(Value),
    Query { version: u64 },
    Wait(oneshot::Receiver<Result<Value>>),
}

impl ModelInner {
    fn plan_read(&mut self) -> ReadPlan {
        if !self.stale {
            if let Some(value) = &self.value {
                return ReadPlan::Cached(value.clone());
            }
        }
        match self.pending_read {
            Some(ref mut waiters) => {
                let (tx, rx) = oneshot::channel();
                waiters.push(tx);
                ReadPlan::Wait(rx)
            }
            None => {
                self.pending_read = Some(Vec::new());
                ReadPlan::Query {
                    version: self.version,
                }
            }
        }
    }

    fn fresh_value(&self) -> Option<&Value> {
        if self.stale {
            None
        } else {
            self.value.as_ref()
        }
    }

    fn store(&mut self, value: Value) {
        self.value = Some(value);
        self.stale = false;
        if self.state == ModelState::Unbound {
            self.state = ModelState::Populated;
        }
    }
}

/// One cached entity or view.
pub struct Model {
    id: ModelId,
    entity_type: String,
    database: Arc<dyn Database>,
    hooks: Hooks,
    link: OnceLock<ModelLink>,
    changes_received: AtomicU64,
    inner: Mutex<ModelInner>,
}

impl fmt::Debug for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Model")
            .field("id", &self.id)
            .field("entity_type", &self.entity_type)
            .field("state", &inner.state)
            .field("selector", &inner.selector)
            .field("subscribers", &inner.subscribers.len())
            .finish()
    }
}

impl Model {
    pub fn new(entity_type: impl Into<String>, database: Arc<dyn Database>, hooks: Hooks) -> Self {
        Self {
            id: ModelId::next(),
            entity_type: entity_type.into(),
            database,
            hooks,
            link: OnceLock::new(),
            changes_received: AtomicU64::new(0),
            inner: Mutex::new(ModelInner {
                selector: None,
                value: None,
                stale: false,
                version: 0,
                state: ModelState::Unbound,
                subscribers: HashMap::new(),
                listener: None,
                pending_read: None,
            }),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    pub fn id(&self) -> ModelId {
        self.id
    }

    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    pub fn state(&self) -> ModelState {
        self.inner.lock().state
    }

    pub fn is_destroyed(&self) -> bool {
        self.state() == ModelState::Destroyed
    }

    pub fn selector(&self) -> Option<Selector> {
        self.inner.lock().selector.clone()
    }

    /// Defined once a selector has been assigned.
    pub fn identifier(&self) -> Option<Identifier> {
        self.inner
            .lock()
            .selector
            .as_ref()
            .map(|s| Identifier::new(&self.entity_type, s))
    }

    /// Last materialized value, stale or not.
    pub fn value(&self) -> Option<Value> {
        self.inner.lock().value.clone()
    }

    pub fn is_stale(&self) -> bool {
        self.inner.lock().stale
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }

    pub fn is_subscribed(&self, connection_id: ConnectionId) -> bool {
        self.inner.lock().subscribers.contains_key(&connection_id)
    }

    pub fn is_listening(&self) -> bool {
        self.inner.lock().listener.is_some()
    }

    /// Change events from other models that reached this model's handler.
    pub fn changes_received(&self) -> u64 {
        self.changes_received.load(Ordering::SeqCst)
    }

    fn label(&self) -> String {
        self.identifier()
            .map(|i| i.to_string())
            .unwrap_or_else(|| format!("{} ({})", self.entity_type, self.id))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Wiring
    // ─────────────────────────────────────────────────────────────────────────

    /// Connect the model to the event bus and, for cached models, to the
    /// cache it must leave when destroyed. Only the first call has an effect.
    pub fn attach(&self, bus: Arc<EventBus<ChangeEvent>>, cache: Option<&Arc<ModelCache>>) {
        let _ = self.link.set(ModelLink {
            bus,
            cache: cache.map(Arc::downgrade),
        });
    }

    /// Fix the selector on first use. A different selector later is rejected.
    pub fn assign_selector(&self, selector: Selector) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state == ModelState::Destroyed {
            drop(inner);
            return Err(SyncError::destroyed(self.label()));
        }
        if let Some(current) = &inner.selector {
            return if *current == selector {
                Ok(())
            } else {
                Err(SyncError::invalid_request(
                    "Selector does not match the model it was routed to",
                ))
            };
        }
        inner.selector = Some(selector);
        Ok(())
    }

    /// Start listening on `<entity>.change` if not already.
    pub fn ensure_listening(self: &Arc<Self>) {
        let Some(link) = self.link.get() else {
            return;
        };

        let mut inner = self.inner.lock();
        if inner.listener.is_some() || inner.state == ModelState::Destroyed {
            return;
        }

        let weak = Arc::downgrade(self);
        let own_id = self.id;
        let listener = link
            .bus
            .subscribe(&change_topic(&self.entity_type), move |event: &ChangeEvent| {
                if event.source == own_id {
                    return;
                }
                let Some(model) = weak.upgrade() else {
                    return;
                };
                // Invalidation happens before the publisher's reply goes out;
                // only the re-read for subscribers runs in the background.
                if let Some(refresh) = model.invalidate(event) {
                    let reason = event.reason.clone();
                    tokio::spawn(async move { model.refresh(refresh, &reason).await });
                }
            });
        inner.listener = Some(listener);
        trace!(model_id = %self.id, entity_type = %self.entity_type, "Listening for changes");
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Read
    // ─────────────────────────────────────────────────────────────────────────

    /// Return the cached value, or query the database once for all
    /// concurrent callers.
    pub async fn read(&self, selector: &Selector) -> Result<Value> {
        self.assign_selector(selector.clone())?;

        let plan = self.inner.lock().plan_read();
        match plan {
            ReadPlan::Cached(value) => Ok(value),
            ReadPlan::Wait(rx) => {
                metrics::record_coalesced_read();
                trace!(model_id = %self.id, "Read coalesced onto in-flight query");
                rx.await
                    .unwrap_or_else(|_| Err(SyncError::internal("in-flight read was abandoned")))
            }
            ReadPlan::Query { version } => self.query_read(selector, version).await,
        }
    }

    async fn query_read(&self, selector: &Selector, version: u64) -> Result<Value> {
        let outcome = self.fetch(selector).await;

        let (waiters, outcome) = {
            let mut inner = self.inner.lock();
            let waiters = inner.pending_read.take().unwrap_or_default();
            let outcome = match outcome {
                Ok(value) if inner.version == version => {
                    inner.store(value.clone());
                    Ok(value)
                }
                // A mutation landed while the query was in flight.
                Ok(value) => Ok(inner.fresh_value().cloned().unwrap_or(value)),
                Err(err) => Err(err),
            };
            (waiters, outcome)
        };

        if !waiters.is_empty() {
            debug!(model_id = %self.id, waiters = waiters.len(), "Resolving coalesced reads");
        }
        for waiter in waiters {
            let _ = waiter.send(outcome.clone());
        }
        outcome
    }

    async fn fetch(&self, selector: &Selector) -> Result<Value> {
        let params = query_params(Some(&selector.to_value()), &Value::Null);
        metrics::record_database_call(QueryKind::Read.as_str());
        self.database
            .read(&query_name(&self.entity_type, QueryKind::Read), &params)
            .await
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Write / Delete
    // ─────────────────────────────────────────────────────────────────────────

    /// Authorize, validate, write, then notify other models and subscribers.
    ///
    /// For a record model, an object returned by the database replaces the
    /// cached value; any other result merges the payload into it. A view
    /// re-reads itself after the write.
    pub async fn write(&self, payload: Value, origin: Option<ConnectionId>) -> Result<Value> {
        let selector = self.mutable_selector()?;
        self.run_hooks(Method::Write, &selector, &payload, origin).await?;

        let params = mutation_params(selector.as_ref(), &payload);
        metrics::record_database_call(QueryKind::Write.as_str());
        let result = self
            .database
            .write(&query_name(&self.entity_type, QueryKind::Write), &params)
            .await?;

        let value = match &selector {
            Some(view @ Selector::ByFilter { .. }) => match self.fetch(view).await {
                Ok(rows) => Some(rows),
                Err(err) => {
                    warn!(model_id = %self.id, error = %err, "View refresh after write failed");
                    None
                }
            },
            Some(Selector::ById(_)) => Some(apply_write_result(self.value(), &params, result.clone())),
            None => Some(result.clone()),
        };

        let subscribers = {
            let mut inner = self.inner.lock();
            inner.version += 1;
            match &value {
                Some(value) => inner.store(value.clone()),
                None => inner.stale = true,
            }
            others(&inner.subscribers, origin)
        };

        let value = value.unwrap_or(result);
        let reason = ChangeEvent::reason_for(ChangeMethod::Write, &self.entity_type, &payload);
        self.publish_change(ChangeMethod::Write, selector, reason.clone());
        self.push(&subscribers, Method::Write, &value, &reason);
        Ok(value)
    }

    /// Authorize, validate, delete, notify, then destroy the model.
    pub async fn delete(&self, payload: Value, origin: Option<ConnectionId>) -> Result<Value> {
        let selector = self.mutable_selector()?;
        self.run_hooks(Method::Delete, &selector, &payload, origin).await?;

        let params = mutation_params(selector.as_ref(), &payload);
        metrics::record_database_call(QueryKind::Delete.as_str());
        self.database
            .write(&query_name(&self.entity_type, QueryKind::Delete), &params)
            .await?;

        let subscribers = others(&self.inner.lock().subscribers, origin);

        let reason = ChangeEvent::reason_for(ChangeMethod::Delete, &self.entity_type, &payload);
        self.publish_change(ChangeMethod::Delete, selector, reason.clone());
        self.push(&subscribers, Method::Delete, &Value::Null, &reason);
        self.destroy();
        Ok(Value::Null)
    }

    fn mutable_selector(&self) -> Result<Option<Selector>> {
        let inner = self.inner.lock();
        if inner.state == ModelState::Destroyed {
            drop(inner);
            return Err(SyncError::destroyed(self.label()));
        }
        Ok(inner.selector.clone())
    }

    async fn run_hooks(
        &self,
        method: Method,
        selector: &Option<Selector>,
        payload: &Value,
        origin: Option<ConnectionId>,
    ) -> Result<()> {
        let ctx = HookContext {
            entity_type: self.entity_type.clone(),
            method,
            selector: selector.clone(),
            payload: payload.clone(),
            connection_id: origin,
        };
        self.hooks.run(&ctx).await
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Subscriptions
    // ─────────────────────────────────────────────────────────────────────────

    /// Add `connection` to the subscribers. Rebinding updates the
    /// correlation id used for later pushes.
    pub fn bind(self: &Arc<Self>, connection: Connection, correlation_id: Value) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            if inner.state == ModelState::Destroyed {
                drop(inner);
                return Err(SyncError::destroyed(self.label()));
            }
            debug!(model_id = %self.id, connection_id = %connection.id(), "Connection bound");
            inner.subscribers.insert(
                connection.id(),
                Subscriber {
                    connection,
                    correlation_id,
                },
            );
        }
        self.ensure_listening();
        Ok(())
    }

    /// Remove `connection_id` from the subscribers; destroys the model when
    /// none remain. Returns whether the model is destroyed afterwards.
    pub fn unbind(&self, connection_id: ConnectionId) -> bool {
        let empty = {
            let mut inner = self.inner.lock();
            if inner.state == ModelState::Destroyed {
                return true;
            }
            inner.subscribers.remove(&connection_id);
            inner.subscribers.is_empty()
        };

        debug!(model_id = %self.id, connection_id = %connection_id, "Connection unbound");
        if empty {
            self.destroy();
        }
        empty
    }

    /// Enter the terminal state: stop listening and leave the cache.
    pub fn destroy(&self) {
        let (listener, identifier) = {
            let mut inner = self.inner.lock();
            if inner.state == ModelState::Destroyed {
                return;
            }
            inner.state = ModelState::Destroyed;
            inner.subscribers.clear();
            (
                inner.listener.take(),
                inner
                    .selector
                    .as_ref()
                    .map(|s| Identifier::new(&self.entity_type, s)),
            )
        };

        if let Some(link) = self.link.get() {
            if let Some(listener) = listener {
                link.bus
                    .unsubscribe(&change_topic(&self.entity_type), listener);
            }
            let cache = link.cache.as_ref().and_then(Weak::upgrade);
            if let (Some(cache), Some(identifier)) = (cache, identifier.as_ref()) {
                cache.remove_if_owner(identifier, self.id);
            }
        }

        debug!(
            model_id = %self.id,
            identifier = ?identifier.as_ref().map(Identifier::as_str),
            "Model destroyed"
        );
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Change propagation
    // ─────────────────────────────────────────────────────────────────────────

    fn publish_change(&self, method: ChangeMethod, selector: Option<Selector>, reason: Value) {
        let Some(link) = self.link.get() else {
            return;
        };

        let event = ChangeEvent {
            method,
            entity_type: self.entity_type.clone(),
            source: self.id,
            source_selector: selector,
            reason,
        };
        let listeners = link.bus.publish(&event.topic(), &event);
        metrics::record_change_event(&self.entity_type);
        debug!(
            model_id = %self.id,
            entity_type = %self.entity_type,
            method = %method,
            listeners,
            "Change published"
        );
    }

    /// React to another model's write or delete.
    pub async fn on_change_event(&self, event: &ChangeEvent) {
        if let Some(refresh) = self.invalidate(event) {
            self.refresh(refresh, &event.reason).await;
        }
    }

    /// Mark the cached value stale for a change made elsewhere.
    ///
    /// A record model ignores changes to other records. Runs synchronously
    /// inside the bus, so the next read re-queries. Returns the refresh to
    /// run when connections are bound to the model.
    pub fn invalidate(&self, event: &ChangeEvent) -> Option<Refresh> {
        if event.source == self.id {
            return None;
        }
        self.changes_received.fetch_add(1, Ordering::SeqCst);

        let mut inner = self.inner.lock();
        if inner.state == ModelState::Destroyed {
            return None;
        }
        let selector = inner.selector.clone()?;
        if let (Selector::ById(own), Some(Selector::ById(other))) =
            (&selector, &event.source_selector)
        {
            if own != other {
                return None;
            }
        }

        inner.stale = true;
        inner.version += 1;
        if inner.subscribers.is_empty() {
            trace!(model_id = %self.id, "Idle model invalidated");
            return None;
        }
        Some(Refresh {
            selector,
            version: inner.version,
        })
    }

    /// Re-read and push to every subscriber, tagged with `reason`.
    ///
    /// The result is dropped if a later change or write bumped the version
    /// while the query was in flight; that one delivers the newer value.
    pub async fn refresh(&self, refresh: Refresh, reason: &Value) {
        let outcome = self.fetch(&refresh.selector).await;

        let subscribers = {
            let mut inner = self.inner.lock();
            if inner.state == ModelState::Destroyed {
                return;
            }
            if inner.version != refresh.version {
                trace!(
                    model_id = %self.id,
                    version = refresh.version,
                    current = inner.version,
                    "Refresh overtaken, dropping result"
                );
                return;
            }
            match &outcome {
                Ok(value) => inner.store(value.clone()),
                Err(err) => {
                    warn!(model_id = %self.id, error = %err, "Refresh after change failed");
                    return;
                }
            }
            others(&inner.subscribers, None)
        };

        if let Ok(value) = &outcome {
            self.push(&subscribers, Method::Read, value, reason);
        }
    }

    /// Never waits on a subscriber: a full outbound queue closes that
    /// connection instead of stalling the caller.
    fn push(&self, subscribers: &[Subscriber], method: Method, result: &Value, reason: &Value) {
        if subscribers.is_empty() {
            return;
        }
        let data = json!({
            "name": self.entity_type,
            "result": result,
            "reason": reason,
        });
        for subscriber in subscribers {
            subscriber.connection.push(Response::new(
                subscriber.correlation_id.clone(),
                method.as_str(),
                data.clone(),
            ));
        }
    }
}

/// A pending re-read, valid while the model is still at `version`.
#[derive(Debug, Clone)]
pub struct Refresh {
    selector: Selector,
    version: u64,
}

fn others(subscribers: &HashMap<ConnectionId, Subscriber>, origin: Option<ConnectionId>) -> Vec<Subscriber> {
    subscribers
        .values()
        .filter(|s| Some(s.connection.id()) != origin)
        .cloned()
        .collect()
}

/// Write and delete parameters. Only a record selector contributes its `id`;
/// a view's filter and order are not fields of the record.
fn mutation_params(selector: Option<&Selector>, payload: &Value) -> Value {
    match selector {
        Some(record @ Selector::ById(_)) => query_params(Some(&record.to_value()), payload),
        _ => query_params(None, payload),
    }
}

/// Replace with an object result, otherwise shallow-merge the written fields.
fn apply_write_result(current: Option<Value>, params: &Value, result: Value) -> Value {
    if result.is_object() {
        return result;
    }
    let mut merged = match current {
        Some(Value::Object(map)) => map,
        _ => serde_json::Map::new(),
    };
    if let Value::Object(fields) = params {
        for (key, value) in fields {
            merged.insert(key.clone(), value.clone());
        }
    }
    Value::Object(merged)
}
