use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;
use weft_types::{CandidateEvent, Context};

use crate::error::InvocationError;
use crate::step::{StepKind, StepRef};

/// The external agent runtime / tool sandbox.
///
/// Called concurrently. Implementations receive a frozen context and must
/// produce their effect only through the returned candidate events.
#[async_trait]
pub trait StepBackend: Send + Sync {
    async fn invoke(
        &self,
        step: &StepRef,
        context: &Context,
        input: &Value,
    ) -> Result<Vec<CandidateEvent>, InvocationError>;
}

type Handler = Arc<
    dyn Fn(Context, Value) -> BoxFuture<'static, Result<Vec<CandidateEvent>, InvocationError>>
        + Send
        + Sync,
>;

/// A [`StepBackend`] dispatching to registered async functions by name.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: Arc<RwLock<HashMap<(StepKind, String), Handler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F, Fut>(&self, step: StepRef, handler: F)
    where
        F: Fn(Context, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<CandidateEvent>, InvocationError>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |ctx, input| Box::pin(handler(ctx, input)));
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((step.kind, step.name), handler);
    }

    pub fn register_tool<F, Fut>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(Context, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<CandidateEvent>, InvocationError>> + Send + 'static,
    {
        self.register(StepRef::tool(name), handler);
    }

    pub fn register_agent<F, Fut>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(Context, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<CandidateEvent>, InvocationError>> + Send + 'static,
    {
        self.register(StepRef::agent(name), handler);
    }

    pub fn contains(&self, step: &StepRef) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&(step.kind, step.name.clone()))
    }
}

#[async_trait]
impl StepBackend for HandlerRegistry {
    async fn invoke(
        &self,
        step: &StepRef,
        context: &Context,
        input: &Value,
    ) -> Result<Vec<CandidateEvent>, InvocationError> {
        let handler = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(step.kind, step.name.clone()))
            .cloned()
            .ok_or_else(|| InvocationError::permanent(format!("no handler registered for {step}")))?;
        handler(context.clone(), input.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn dispatches_by_kind_and_name() {
        let registry = HandlerRegistry::new();
        registry.register_tool("echo", |_ctx, input| async move {
            Ok(vec![CandidateEvent::parse("tool.response").unwrap().with("echo", input)])
        });

        let out = registry
            .invoke(&StepRef::tool("echo"), &Context::empty(), &json!({"q": 1}))
            .await
            .unwrap();
        assert_eq!(out[0].data["echo"], json!({"q": 1}));

        // Same name, other kind: not registered.
        let err = registry
            .invoke(&StepRef::agent("echo"), &Context::empty(), &json!(null))
            .await
            .unwrap_err();
        assert!(!err.is_transient());
    }
}
