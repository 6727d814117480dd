//! Authorization and validation hooks run before every write and delete.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use super::Selector;
use crate::error::Result;
use crate::messenger::{ConnectionId, Method};

/// What a hook gets to inspect.
#[derive(Debug, Clone)]
pub struct HookContext {
    pub entity_type: String,
    pub method: Method,
    /// `None` for one-shot requests.
    pub selector: Option<Selector>,
    pub payload: Value,
    /// `None` when the mutation did not come from a client connection.
    pub connection_id: Option<ConnectionId>,
}

/// A check that may reject a request before the database is touched.
///
/// Rejections are returned as [`SyncError`](crate::error::SyncError)s, usually
/// built with `SyncError::unauthorized` or `SyncError::invalid`, optionally
/// carrying a namespaced client code.
#[async_trait]
pub trait Guard: Send + Sync {
    async fn check(&self, ctx: &HookContext) -> Result<()>;
}

#[async_trait]
impl<F> Guard for F
where
    F: Fn(&HookContext) -> Result<()> + Send + Sync,
{
    async fn check(&self, ctx: &HookContext) -> Result<()> {
        self(ctx)
    }
}

/// Accepts everything.
pub struct AllowAll;

#[async_trait]
impl Guard for AllowAll {
    async fn check(&self, _ctx: &HookContext) -> Result<()> {
        Ok(())
    }
}

/// The authorize/validate pair attached to a model at construction.
#[derive(Clone)]
pub struct Hooks {
    authorize: Arc<dyn Guard>,
    validate: Arc<dyn Guard>,
}

impl Hooks {
    pub fn new() -> Self {
        Self {
            authorize: Arc::new(AllowAll),
            validate: Arc::new(AllowAll),
        }
    }

    pub fn with_authorize(mut self, guard: impl Guard + 'static) -> Self {
        self.authorize = Arc::new(guard);
        self
    }

    pub fn with_validate(mut self, guard: impl Guard + 'static) -> Self {
        self.validate = Arc::new(guard);
        self
    }

    /// Authorize, then validate. The first rejection wins.
    pub async fn run(&self, ctx: &HookContext) -> Result<()> {
        self.authorize.check(ctx).await?;
        self.validate.check(ctx).await
    }
}

impl Default for Hooks {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Hooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hooks").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorCode, SyncError};
    use serde_json::json;

    fn ctx(payload: Value) -> HookContext {
        HookContext {
            entity_type: "task".to_string(),
            method: Method::Write,
            selector: Some(Selector::ById(json!(1))),
            payload,
            connection_id: None,
        }
    }

    #[tokio::test]
    async fn test_default_hooks_allow() {
        assert!(Hooks::default().run(&ctx(json!({}))).await.is_ok());
    }

    #[tokio::test]
    async fn test_authorize_runs_before_validate() {
        let hooks = Hooks::new()
            .with_authorize(|_: &HookContext| -> Result<()> {
                Err(SyncError::unauthorized("no"))
            })
            .with_validate(|_: &HookContext| -> Result<()> { panic!("validate must not run") });

        let err = hooks.run(&ctx(json!({}))).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::AuthorizationFailed);
    }

    #[tokio::test]
    async fn test_validate_sees_payload() {
        let hooks = Hooks::new().with_validate(|ctx: &HookContext| -> Result<()> {
            if ctx.payload.get("title").is_some() {
                Ok(())
            } else {
                Err(SyncError::invalid("title is required").with_client_code("task.title-required"))
            }
        });

        assert!(hooks.run(&ctx(json!({"title": "a"}))).await.is_ok());
        let err = hooks.run(&ctx(json!({}))).await.unwrap_err();
        assert_eq!(err.client_code(), "task.title-required");
    }
}
