//! Type-keyed registry of context-consuming factories.
//!
//! A provider is an async factory over [`CallContext`] registered under the
//! `TypeId` of the value it produces. The dispatcher consults this registry
//! before touching wire arguments, and the catalog uses it to resolve
//! variable data records.

use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::context::CallContext;
use crate::error::ProviderError;

type BoxedValue = Box<dyn Any + Send>;

/// Factories take the context by value to avoid lifetime issues with async
/// captures.
type Factory = Arc<
    dyn Fn(CallContext) -> Pin<Box<dyn Future<Output = Result<BoxedValue, ProviderError>> + Send>>
        + Send
        + Sync,
>;

struct ProviderEntry {
    type_name: &'static str,
    factory: Factory,
}

/// Registry of dependency providers, populated during setup and read-only at
/// serve time.
#[derive(Default)]
pub struct DependencyRegistry {
    entries: HashMap<TypeId, ProviderEntry>,
}

impl DependencyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an infallible factory for `T`. A later registration for the
    /// same type replaces the earlier one.
    pub fn add_provider<T, F, Fut>(&mut self, factory: F)
    where
        T: Send + Sync + 'static,
        F: Fn(CallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        self.insert::<T>(Arc::new(move |ctx| {
            let value = factory(ctx);
            Box::pin(async move { Ok(Box::new(value.await) as BoxedValue) })
        }));
    }

    /// Register a factory for `T` that may fail. The error becomes the call's
    /// error when the value is resolved for a method parameter, and is logged
    /// and skipped when resolved for a catalog variable.
    pub fn add_fallible<T, F, Fut>(&mut self, factory: F)
    where
        T: Send + Sync + 'static,
        F: Fn(CallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, ProviderError>> + Send + 'static,
    {
        self.insert::<T>(Arc::new(move |ctx| {
            let value = factory(ctx);
            Box::pin(async move { value.await.map(|v| Box::new(v) as BoxedValue) })
        }));
    }

    fn insert<T: 'static>(&mut self, factory: Factory) {
        let entry = ProviderEntry {
            type_name: type_name::<T>(),
            factory,
        };
        if self.entries.insert(TypeId::of::<T>(), entry).is_some() {
            tracing::debug!(provides = type_name::<T>(), "replacing dependency provider");
        }
    }

    pub fn contains(&self, key: TypeId) -> bool {
        self.entries.contains_key(&key)
    }

    /// Resolve a value of type `T` against this context.
    ///
    /// `None` means no provider is registered; absence, not failure.
    pub async fn resolve<T: Send + 'static>(
        &self,
        ctx: &CallContext,
    ) -> Option<Result<T, ProviderError>> {
        let entry = self.entries.get(&TypeId::of::<T>())?;
        let outcome = (entry.factory)(ctx.clone()).await;
        Some(match outcome {
            Ok(boxed) => match boxed.downcast::<T>() {
                Ok(value) => Ok(*value),
                Err(_) => Err(ProviderError::new(format!(
                    "provider for {} produced an unexpected type",
                    entry.type_name
                ))),
            },
            Err(err) => {
                tracing::error!(provides = entry.type_name, error = %err, "dependency provider failed");
                Err(err)
            }
        })
    }
}
