//! Dynamic class resolution, replaced. The source resolves `class_name` by
//! `import_string("a.b.C")` at call time; here `class_name` stays an opaque
//! string in the database (forward/backward compatible) and resolves
//! through a registry of function pointers populated once at start-up.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// A user-supplied job body: deserialize `arguments`, do the work, return
/// `Ok(())` on success or any error to record a `FailedExecution`.
#[async_trait]
pub trait Callable: Send + Sync {
    async fn call(&self, arguments: Value) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> Callable for F
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn call(&self, arguments: Value) -> anyhow::Result<()> {
        (self)(arguments).await
    }
}

#[derive(Debug, thiserror::Error)]
pub struct DeserializationError {
    pub class_name: String,
    pub message: String,
}

impl fmt::Display for DeserializationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "failed to deserialize arguments for `{}`: {}",
            self.class_name, self.message
        )
    }
}

/// Maps `class_name` strings to registered callables. Built once during an
/// explicit discovery phase at start-up (no process-wide mutable registry
/// populated by decorators at import time).
#[derive(Clone, Default)]
pub struct CommandRegistry {
    callables: Arc<DashMap<String, Arc<dyn Callable>>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, class_name: impl Into<String>, callable: Arc<dyn Callable>) {
        self.callables.insert(class_name.into(), callable);
    }

    pub fn resolve(&self, class_name: &str) -> Option<Arc<dyn Callable>> {
        self.callables.get(class_name).map(|entry| entry.clone())
    }
}

impl fmt::Debug for CommandRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandRegistry")
            .field("registered", &self.callables.len())
            .finish()
    }
}
