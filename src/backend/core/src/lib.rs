#![allow(clippy::result_large_err)]
//! # modelsync core
//!
//! Server-side reactive data synchronization: clients send read, write and
//! delete requests against named entities and may bind to an entity so that
//! later changes made by any client are pushed to them.
//!
//! ## Architecture
//!
//! - **Events**: in-process topic bus carrying change notifications
//! - **Database**: named-query store contract plus an in-memory reference store
//! - **Model**: one cached record or filtered view, with single-flight reads,
//!   hook-guarded mutations and subscriber pushes
//! - **Dispatcher**: entity type name to model factory
//! - **Messenger**: routes requests from connections to cached models
//! - **API**: WebSocket transport, one-shot HTTP transport, health and metrics
//! - **Observability**: structured logging, OTLP traces and Prometheus metrics

pub mod api;
pub mod config;
pub mod db;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod messenger;
pub mod model;
pub mod observability;

pub use error::{ErrorCode, Result, SyncError};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::db::{Database, MemoryDatabase, StoreError};
    pub use crate::dispatcher::{Dispatcher, ModelFactory};
    pub use crate::error::{ErrorCode, Result, SyncError};
    pub use crate::events::{ChangeEvent, ChangeMethod, EventBus};
    pub use crate::messenger::{
        Connection, ConnectionId, Messenger, MessengerStats, Method, Request, RequestEnvelope,
        Response,
    };
    pub use crate::model::{
        Guard, HookContext, Hooks, Identifier, Model, ModelCache, ModelId, ModelState,
        RawSelector, Selector,
    };
}
