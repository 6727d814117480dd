//! Request routing between client connections and models.
//!
//! One [`Messenger`] serves every connection of a server. For each inbound
//! request it:
//!
//! 1. decodes the envelope and checks entity type and method,
//! 2. resolves the model by [`Identifier`] from the shared [`ModelCache`],
//!    creating it through the [`Dispatcher`] on a miss,
//! 3. applies `subscribe` (bind or unbind) before running the method,
//! 4. runs `read`, `write` or `delete` on the model,
//! 5. replies to the requesting connection only, with the result or an error.
//!
//! Requests whose selector names neither an id nor a filter have no
//! identifier; they run on a throwaway model that is never cached or bound.

mod connection;
mod protocol;

pub use connection::{Connection, ConnectionId};
pub use protocol::{Method, Request, RequestEnvelope, RequestHead, Response};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, instrument, trace, warn};

use crate::config::MessengerConfig;
use crate::dispatcher::Dispatcher;
use crate::error::{ErrorCode, Result, SyncError};
use crate::events::{ChangeEvent, EventBus};
use crate::model::{Identifier, Model, ModelCache, ModelId, ModelState, Selector};
use crate::observability::metrics;

/// Method name used for frames that could not be decoded.
pub const DECODE_ERROR_METHOD: &str = "error";

/// Messenger statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessengerStats {
    pub connections: usize,
    pub cached_models: usize,
    pub bindings: usize,
    pub requests_handled: u64,
    pub connections_opened: u64,
    pub entity_types: Vec<String>,
}

pub struct Messenger {
    dispatcher: Arc<Dispatcher>,
    cache: Arc<ModelCache>,
    bus: Arc<EventBus<ChangeEvent>>,
    /// Models each open connection is bound to.
    bindings: RwLock<HashMap<ConnectionId, HashMap<ModelId, Arc<Model>>>>,
    config: MessengerConfig,
    requests_handled: AtomicU64,
    connections_opened: AtomicU64,
}

impl Messenger {
    pub fn new(dispatcher: Arc<Dispatcher>, config: MessengerConfig) -> Self {
        Self::with_bus(dispatcher, config, Arc::new(EventBus::new()))
    }

    /// Use an existing event bus, e.g. one shared with other components.
    pub fn with_bus(
        dispatcher: Arc<Dispatcher>,
        config: MessengerConfig,
        bus: Arc<EventBus<ChangeEvent>>,
    ) -> Self {
        Self {
            dispatcher,
            cache: Arc::new(ModelCache::new()),
            bus,
            bindings: RwLock::new(HashMap::new()),
            config,
            requests_handled: AtomicU64::new(0),
            connections_opened: AtomicU64::new(0),
        }
    }

    pub fn cache(&self) -> &Arc<ModelCache> {
        &self.cache
    }

    pub fn bus(&self) -> &Arc<EventBus<ChangeEvent>> {
        &self.bus
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn config(&self) -> &MessengerConfig {
        &self.config
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Connections
    // ─────────────────────────────────────────────────────────────────────────

    /// Register a new connection and return it with its outbound queue.
    pub fn open_connection(&self, live: bool) -> (Connection, mpsc::Receiver<Response>) {
        let (connection, rx) = Connection::channel(self.config.outbound_buffer, live);
        let open = {
            let mut bindings = self.bindings.write();
            bindings.insert(connection.id(), HashMap::new());
            bindings.len()
        };
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
        metrics::set_connections(open);
        debug!(connection_id = %connection.id(), live, "Connection opened");
        (connection, rx)
    }

    /// Close `connection`: nothing is sent to it afterwards and every model
    /// it was bound to is unbound.
    pub fn close_connection(&self, connection: &Connection) {
        connection.close();
        self.release_connection(connection.id());
    }

    fn release_connection(&self, connection_id: ConnectionId) {
        let (models, open) = {
            let mut bindings = self.bindings.write();
            let models = bindings.remove(&connection_id).unwrap_or_default();
            (models, bindings.len())
        };

        let mut destroyed = 0usize;
        for model in models.values() {
            if model.unbind(connection_id) {
                destroyed += 1;
            }
        }

        metrics::set_connections(open);
        debug!(
            connection_id = %connection_id,
            released = models.len(),
            destroyed,
            "Connection closed"
        );
    }

    /// Number of models `connection_id` is bound to.
    pub fn binding_count(&self, connection_id: ConnectionId) -> usize {
        self.bindings
            .read()
            .get(&connection_id)
            .map_or(0, HashMap::len)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Request handling
    // ─────────────────────────────────────────────────────────────────────────

    /// Handle one raw text frame from `connection` and send the reply.
    pub async fn handle(&self, connection: &Connection, raw: &str) {
        self.requests_handled.fetch_add(1, Ordering::Relaxed);

        let response = if raw.len() > self.config.max_message_size {
            let err = SyncError::invalid_request("Message too large").with_internal_message(format!(
                "frame of {} bytes exceeds limit of {}",
                raw.len(),
                self.config.max_message_size
            ));
            err.log();
            Response::error(Value::Null, DECODE_ERROR_METHOD, &err)
        } else {
            match RequestEnvelope::decode(raw) {
                Ok(envelope) => self.respond(connection, envelope).await,
                Err((correlation_id, err)) => {
                    err.log();
                    Response::error(correlation_id, DECODE_ERROR_METHOD, &err)
                }
            }
        };

        connection.send(response).await;
    }

    /// Handle the frames of one connection strictly in arrival order.
    ///
    /// Returns when `frames` is exhausted. Replies go out in request order,
    /// so a bind followed by an unbind can never be applied the other way
    /// round.
    pub async fn serve(&self, connection: &Connection, mut frames: mpsc::Receiver<String>) {
        while let Some(raw) = frames.recv().await {
            self.handle(connection, &raw).await;
        }
        trace!(connection_id = %connection.id(), "Frame worker finished");
    }

    /// Run a decoded request and build the reply, error replies included.
    pub async fn respond(&self, connection: &Connection, envelope: RequestEnvelope) -> Response {
        let RequestEnvelope { head, body } = envelope;
        let outcome = self.execute(connection, &head.correlation_id, &body).await;
        match outcome {
            Ok(data) => Response::new(head.correlation_id, body.method, data),
            Err(err) => {
                err.log();
                Response::error(head.correlation_id, body.method, &err)
            }
        }
    }

    /// Run a single request on a throwaway, non-live connection.
    ///
    /// `subscribe` is ignored. Used by the HTTP transport.
    pub async fn handle_once(&self, envelope: RequestEnvelope) -> Result<Response> {
        self.requests_handled.fetch_add(1, Ordering::Relaxed);

        let (connection, _rx) = self.open_connection(false);
        let RequestEnvelope { head, mut body } = envelope;
        body.subscribe = None;

        let outcome = self.execute(&connection, &head.correlation_id, &body).await;
        self.close_connection(&connection);
        outcome.map(|data| Response::new(head.correlation_id, body.method, data))
    }

    #[instrument(
        skip_all,
        fields(
            connection_id = %connection.id(),
            entity_type = %request.entity_type,
            method = %request.method,
        )
    )]
    async fn execute(
        &self,
        connection: &Connection,
        correlation_id: &Value,
        request: &Request,
    ) -> Result<Value> {
        if !self.dispatcher.contains(&request.entity_type) {
            return Err(SyncError::unknown_entity_type(&request.entity_type));
        }
        let method = Method::parse(&request.method)?;
        metrics::record_request(&request.entity_type, method.as_str());

        let Some(selector) = request.selector.to_selector() else {
            return self.execute_one_shot(connection, method, request).await;
        };
        let identifier = Identifier::new(&request.entity_type, &selector);
        let route = Route {
            request,
            method,
            identifier: &identifier,
            selector: &selector,
        };
        let model = self.resolve(&request.entity_type, &identifier, &selector)?;
        self.execute_routed(connection, correlation_id, &route, model).await
    }

    /// Run `route` on `model`. If the model was destroyed after it was
    /// resolved, e.g. by another connection's last unbind, resolve a fresh
    /// one and run once more.
    async fn execute_routed(
        &self,
        connection: &Connection,
        correlation_id: &Value,
        route: &Route<'_>,
        model: Arc<Model>,
    ) -> Result<Value> {
        match self.execute_on(connection, correlation_id, route, model).await {
            Err(err) if err.code() == ErrorCode::ModelDestroyed => {
                debug!(identifier = %route.identifier, "Model destroyed under request, retrying");
                let model = self.resolve(
                    &route.request.entity_type,
                    route.identifier,
                    route.selector,
                )?;
                self.execute_on(connection, correlation_id, route, model).await
            }
            outcome => outcome,
        }
    }

    async fn execute_on(
        &self,
        connection: &Connection,
        correlation_id: &Value,
        route: &Route<'_>,
        mut model: Arc<Model>,
    ) -> Result<Value> {
        let Route {
            request,
            method,
            identifier,
            selector,
        } = *route;

        match request.subscribe {
            Some(true) => self.bind(connection, &model, correlation_id)?,
            Some(false) => {
                if self.unbind(connection.id(), &model) {
                    model = self.resolve(&request.entity_type, identifier, selector)?;
                }
            }
            None => {}
        }

        let outcome = match method {
            Method::Read => model.read(selector).await,
            Method::Write => model.write(request.payload.clone(), Some(connection.id())).await,
            Method::Delete => model.delete(request.payload.clone(), Some(connection.id())).await,
        };

        let result = match outcome {
            Ok(result) => result,
            Err(err) => {
                // Nothing ever populated or bound it, so it must not stay cached.
                if model.state() == ModelState::Unbound && model.subscriber_count() == 0 {
                    model.destroy();
                }
                return Err(err);
            }
        };

        match method {
            Method::Read
                if request.subscribe.is_none()
                    && connection.is_live()
                    && !model.is_subscribed(connection.id()) =>
            {
                if let Err(err) = self.bind(connection, &model, correlation_id) {
                    debug!(identifier = %identifier, error = %err, "Live bind skipped");
                }
            }
            Method::Delete => self.forget_model(model.id()),
            _ => {}
        }

        Ok(envelope(&request.entity_type, result))
    }

    async fn execute_one_shot(
        &self,
        connection: &Connection,
        method: Method,
        request: &Request,
    ) -> Result<Value> {
        if request.subscribe.is_some() {
            debug!("Subscription ignored for request without identifier");
        }

        let model = self.create_model(&request.entity_type, false)?;
        let result = match method {
            Method::Read => {
                return Err(SyncError::invalid_request("A read needs an id or a filter"));
            }
            Method::Write => model.write(request.payload.clone(), Some(connection.id())).await?,
            Method::Delete => model.delete(request.payload.clone(), Some(connection.id())).await?,
        };
        Ok(envelope(&request.entity_type, result))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Models
    // ─────────────────────────────────────────────────────────────────────────

    fn create_model(&self, entity_type: &str, cached: bool) -> Result<Arc<Model>> {
        let model = Arc::new(self.dispatcher.get(entity_type)?);
        model.attach(Arc::clone(&self.bus), cached.then_some(&self.cache));
        Ok(model)
    }

    /// The live cached model for `identifier`, created on a miss.
    fn resolve(&self, entity_type: &str, identifier: &Identifier, selector: &Selector) -> Result<Arc<Model>> {
        loop {
            if let Some(model) = self.cache.get(identifier) {
                if !model.is_destroyed() {
                    return Ok(model);
                }
                self.cache.remove_if_owner(identifier, model.id());
                continue;
            }

            let model = self.create_model(entity_type, true)?;
            model.assign_selector(selector.clone())?;
            let (model, inserted) = self.cache.get_or_insert(identifier.clone(), model);
            if inserted {
                model.ensure_listening();
                debug!(identifier = %identifier, model_id = %model.id(), "Model cached");
            }
            if !model.is_destroyed() {
                return Ok(model);
            }
        }
    }

    fn bind(&self, connection: &Connection, model: &Arc<Model>, correlation_id: &Value) -> Result<()> {
        model.bind(connection.clone(), correlation_id.clone())?;
        self.bindings
            .write()
            .entry(connection.id())
            .or_default()
            .insert(model.id(), Arc::clone(model));

        // The connection may have closed while the request was in flight.
        if connection.is_closed() {
            warn!(connection_id = %connection.id(), "Bound after close, releasing");
            self.release_connection(connection.id());
        }
        Ok(())
    }

    /// Returns whether the model was destroyed.
    fn unbind(&self, connection_id: ConnectionId, model: &Arc<Model>) -> bool {
        if let Some(models) = self.bindings.write().get_mut(&connection_id) {
            models.remove(&model.id());
        }
        model.unbind(connection_id)
    }

    /// Drop every binding record of a destroyed model.
    fn forget_model(&self, model_id: ModelId) {
        for models in self.bindings.write().values_mut() {
            models.remove(&model_id);
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Statistics
    // ─────────────────────────────────────────────────────────────────────────

    pub fn stats(&self) -> MessengerStats {
        let bindings = self.bindings.read();
        MessengerStats {
            connections: bindings.len(),
            cached_models: self.cache.len(),
            bindings: bindings.values().map(HashMap::len).sum(),
            requests_handled: self.requests_handled.load(Ordering::Relaxed),
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            entity_types: self.dispatcher.entity_types(),
        }
    }
}

/// A decoded request together with where it is routed.
#[derive(Clone, Copy)]
struct Route<'a> {
    request: &'a Request,
    method: Method,
    identifier: &'a Identifier,
    selector: &'a Selector,
}

/// `{"name": <entity type>, "result": <value>}`
fn envelope(entity_type: &str, result: Value) -> Value {
    json!({ "name": entity_type, "result": result })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryDatabase;
    use crate::model::Hooks;

    fn messenger() -> Messenger {
        let db = MemoryDatabase::with_entities(["task"]);
        db.seed("task", vec![json!({"id": 7, "title": "ship"})]).unwrap();
        let mut dispatcher = Dispatcher::new();
        dispatcher
            .register_entity("task", Arc::new(db), Hooks::default())
            .unwrap();
        Messenger::new(Arc::new(dispatcher), MessengerConfig::default())
    }

    #[tokio::test]
    async fn test_undecodable_frame_gets_error_reply() {
        let messenger = messenger();
        let (conn, mut rx) = messenger.open_connection(false);

        messenger.handle(&conn, "{oops").await;
        let reply = rx.recv().await.unwrap();
        assert!(reply.correlation_id.is_null());
        assert_eq!(reply.method, DECODE_ERROR_METHOD);
        assert_eq!(reply.error_code(), Some("model.invalid-request"));
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let db = MemoryDatabase::with_entities(["task"]);
        let mut dispatcher = Dispatcher::new();
        dispatcher
            .register_entity("task", Arc::new(db), Hooks::default())
            .unwrap();
        let config = MessengerConfig {
            max_message_size: 16,
            ..Default::default()
        };
        let messenger = Messenger::new(Arc::new(dispatcher), config);
        let (conn, mut rx) = messenger.open_connection(false);

        messenger.handle(&conn, &"x".repeat(17)).await;
        assert_eq!(rx.recv().await.unwrap().error_code(), Some("model.invalid-request"));
    }

    #[tokio::test]
    async fn test_handle_once_reads_without_binding() {
        let messenger = messenger();
        let envelope: RequestEnvelope = serde_json::from_value(json!({
            "head": {"correlationId": "h-1"},
            "body": {"entityType": "task", "method": "read", "selector": {"id": 7}, "subscribe": true}
        }))
        .unwrap();

        let reply = messenger.handle_once(envelope).await.unwrap();
        assert_eq!(reply.data["result"]["title"], "ship");

        let stats = messenger.stats();
        assert_eq!(stats.connections, 0);
        assert_eq!(stats.bindings, 0);
        assert_eq!(stats.cached_models, 1);
    }

    #[tokio::test]
    async fn test_read_without_selector_rejected() {
        let messenger = messenger();
        let envelope: RequestEnvelope = serde_json::from_value(json!({
            "body": {"entityType": "task", "method": "read"}
        }))
        .unwrap();
        let err = messenger.handle_once(envelope).await.unwrap_err();
        assert_eq!(err.client_code(), "model.invalid-request");
    }

    #[tokio::test]
    async fn test_request_survives_model_destroyed_after_resolve() {
        let messenger = messenger();
        let (conn, _rx) = messenger.open_connection(false);
        let request: Request = serde_json::from_value(json!({
            "entityType": "task",
            "method": "read",
            "selector": {"id": 7},
            "subscribe": true
        }))
        .unwrap();
        let selector = Selector::ById(json!(7));
        let identifier = Identifier::new("task", &selector);
        let route = Route {
            request: &request,
            method: Method::Read,
            identifier: &identifier,
            selector: &selector,
        };

        // Another connection's last unbind lands between resolve and bind.
        let stale = messenger.resolve("task", &identifier, &selector).unwrap();
        stale.destroy();

        let data = messenger
            .execute_routed(&conn, &json!("c-1"), &route, Arc::clone(&stale))
            .await
            .unwrap();
        assert_eq!(data["result"]["title"], "ship");

        let fresh = messenger.cache().get(&identifier).unwrap();
        assert_ne!(fresh.id(), stale.id());
        assert!(fresh.is_subscribed(conn.id()));
        assert_eq!(messenger.binding_count(conn.id()), 1);
    }
}
