//! Service registration and type-directed argument binding.
//!
//! A service is a named set of methods. A method is any async function whose
//! parameters implement [`CallParam`] and whose result is a
//! [`MethodResult`]; registration captures a trampoline that binds each
//! parameter either to a dependency provider (when one is registered for the
//! parameter type) or to the next wire argument.

use std::any::{type_name, TypeId};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::codec::{Codec, RawValue};
use crate::context::CallContext;
use crate::dependency::DependencyRegistry;
use crate::error::CallError;

/// Error type for method handlers; any error converts via `?`, and its
/// message becomes the response's `error` string.
pub type MethodError = Box<dyn std::error::Error + Send + Sync>;

/// Return type of every method handler: one value or one error.
pub type MethodResult<T> = Result<T, MethodError>;

/// Predicate over the call context gating every method of a service.
pub type ServiceGuard = Arc<dyn Fn(&CallContext) -> bool + Send + Sync>;

pub(crate) type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

pub(crate) type MethodHandler =
    Arc<dyn Fn(CallScope) -> BoxFuture<Result<RawValue, CallError>> + Send + Sync>;

/// Everything a trampoline needs to materialize one call's arguments.
pub struct CallScope {
    ctx: CallContext,
    deps: Arc<DependencyRegistry>,
    codec: Codec,
    args: std::vec::IntoIter<RawValue>,
}

impl CallScope {
    pub(crate) fn new(
        ctx: CallContext,
        deps: Arc<DependencyRegistry>,
        codec: Codec,
        args: Vec<RawValue>,
    ) -> Self {
        Self {
            ctx,
            deps,
            codec,
            args: args.into_iter(),
        }
    }

    fn next_arg(&mut self) -> Result<RawValue, CallError> {
        self.args.next().ok_or(CallError::MissingArguments)
    }
}

/// A resolvable method parameter.
///
/// Blanket-implemented for every serde type: the dependency registry is
/// consulted first, so a provider-produced type never reaches the decoder,
/// and anything else is decoded from the next wire argument.
#[diagnostic::on_unimplemented(
    message = "`{Self}` cannot be used as a method parameter",
    label = "this type cannot be resolved for a call",
    note = "parameters must be `Deserialize + Clone + Send + Sync + 'static`; register a dependency provider for types that never travel on the wire"
)]
pub trait CallParam: Sized + Send {
    fn resolve(scope: &mut CallScope) -> impl Future<Output = Result<Self, CallError>> + Send;
}

impl<T> CallParam for T
where
    T: DeserializeOwned + Clone + Send + Sync + 'static,
{
    async fn resolve(scope: &mut CallScope) -> Result<Self, CallError> {
        if scope.deps.contains(TypeId::of::<T>()) {
            match scope.deps.resolve::<T>(&scope.ctx).await {
                Some(Ok(value)) => Ok(value),
                Some(Err(err)) => Err(CallError::Provider(err)),
                None => Err(CallError::MissingArguments),
            }
        } else {
            scope.next_arg()?.decode_into().map_err(CallError::Argument)
        }
    }
}

/// Async function registrable as a method. Implemented for arities 0..=8 by
/// the macro below; the tuple parameter only drives inference.
pub trait MethodFn<T>: Send + Sync + Sized + 'static {
    fn into_handler(self) -> MethodHandler;
}

macro_rules! impl_method_fn {
    ( $($param:ident),* ) => {
        #[allow(non_snake_case, unused_mut, unused_variables)]
        impl<F, Fut, R, $($param,)*> MethodFn<($($param,)*)> for F
        where
            F: Fn($($param),*) -> Fut + Clone + Send + Sync + 'static,
            Fut: Future<Output = MethodResult<R>> + Send + 'static,
            R: Serialize + 'static,
            $($param: CallParam + 'static,)*
        {
            fn into_handler(self) -> MethodHandler {
                Arc::new(move |mut scope: CallScope| {
                    let handler = self.clone();
                    Box::pin(async move {
                        let codec = scope.codec;
                        $( let $param = <$param as CallParam>::resolve(&mut scope).await?; )*
                        match handler($($param),*).await {
                            Ok(value) => {
                                RawValue::from_serialize(codec, &value).map_err(CallError::Encode)
                            }
                            Err(err) => Err(CallError::Method(err.to_string())),
                        }
                    })
                })
            }
        }
    };
}

impl_method_fn!();
impl_method_fn!(P1);
impl_method_fn!(P1, P2);
impl_method_fn!(P1, P2, P3);
impl_method_fn!(P1, P2, P3, P4);
impl_method_fn!(P1, P2, P3, P4, P5);
impl_method_fn!(P1, P2, P3, P4, P5, P6);
impl_method_fn!(P1, P2, P3, P4, P5, P6, P7);
impl_method_fn!(P1, P2, P3, P4, P5, P6, P7, P8);

// ── Service ─────────────────────────────────────────────────────────────────

/// A named collection of methods with an optional context guard.
pub struct Service {
    name: String,
    guard: Option<ServiceGuard>,
    methods: HashMap<String, MethodHandler>,
}

impl Service {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            guard: None,
            methods: HashMap::new(),
        }
    }

    /// Name the service after a receiver type's bare name.
    pub fn for_receiver<T: ?Sized>() -> Self {
        Self::new(bare_type_name::<T>())
    }

    /// Gate every method of this service behind a context predicate; a
    /// rejected call answers `Access Denied`.
    pub fn guard(mut self, guard: impl Fn(&CallContext) -> bool + Send + Sync + 'static) -> Self {
        self.guard = Some(Arc::new(guard));
        self
    }

    /// Register a method. Re-registering a name replaces the earlier handler.
    pub fn method<F, T>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: MethodFn<T>,
    {
        let name = name.into();
        if self
            .methods
            .insert(name.clone(), handler.into_handler())
            .is_some()
        {
            tracing::debug!(service = %self.name, method = %name, "replacing method handler");
        }
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn check_guard(&self, ctx: &CallContext) -> bool {
        self.guard.as_ref().map_or(true, |guard| guard(ctx))
    }

    pub(crate) fn handler(&self, method: &str) -> Option<&MethodHandler> {
        self.methods.get(method)
    }

    pub(crate) fn catalog(&self) -> BTreeMap<String, u8> {
        self.methods.keys().map(|name| (name.clone(), 1)).collect()
    }
}

fn bare_type_name<T: ?Sized>() -> &'static str {
    let full = type_name::<T>();
    full.rsplit("::").next().unwrap_or(full)
}

/// All registered services, keyed by name. Populated during setup only.
#[derive(Default)]
pub(crate) struct ServiceRegistry {
    services: HashMap<String, Service>,
}

impl ServiceRegistry {
    /// Register a service; a name collision overwrites the earlier service.
    pub fn insert(&mut self, service: Service) {
        if service.name.is_empty() {
            tracing::warn!("registering a service with an empty name");
        }
        if self
            .services
            .insert(service.name.clone(), service)
            .is_some()
        {
            tracing::debug!("replacing a registered service");
        }
    }

    pub fn get(&self, name: &str) -> Option<&Service> {
        self.services.get(name)
    }

    pub fn catalog(&self) -> BTreeMap<String, BTreeMap<String, u8>> {
        self.services
            .iter()
            .map(|(name, service)| (name.clone(), service.catalog()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::UserId;

    fn scope(deps: DependencyRegistry, ctx: CallContext, args: serde_json::Value) -> CallScope {
        let args = match args {
            serde_json::Value::Array(items) => items.into_iter().map(RawValue::Json).collect(),
            other => vec![RawValue::Json(other)],
        };
        CallScope::new(ctx, Arc::new(deps), Codec::Json, args)
    }

    async fn run(handler: &MethodHandler, scope: CallScope) -> Result<serde_json::Value, CallError> {
        match handler(scope).await? {
            RawValue::Json(value) => Ok(value),
            RawValue::Pack(_) => unreachable!("json scope"),
        }
    }

    #[tokio::test]
    async fn binds_wire_arguments_in_order() {
        let handler =
            MethodFn::into_handler(|x: i64, y: i64| async move { Ok::<_, MethodError>(x + y) });

        let out = run(
            &handler,
            scope(
                DependencyRegistry::new(),
                CallContext::new(),
                serde_json::json!([2, 3]),
            ),
        )
        .await
        .unwrap();
        assert_eq!(out, serde_json::json!(5));
    }

    #[tokio::test]
    async fn provider_fills_the_matching_slot() {
        #[derive(Clone, Debug, serde::Deserialize)]
        struct UserCtx {
            id: i64,
        }

        let mut deps = DependencyRegistry::new();
        deps.add_provider(|ctx: CallContext| async move {
            UserCtx {
                id: ctx.get::<UserId>().unwrap_or_default().0,
            }
        });

        // Two declared parameters, one wire argument: the provider covers
        // the second slot.
        let handler = MethodFn::into_handler(|x: i64, user: UserCtx| async move {
            Ok::<_, MethodError>(x + user.id)
        });

        let ctx = CallContext::new().with(UserId(40));
        let out = run(&handler, scope(deps, ctx, serde_json::json!([2])))
            .await
            .unwrap();
        assert_eq!(out, serde_json::json!(42));
    }

    #[tokio::test]
    async fn call_context_is_a_parameter() {
        let mut deps = DependencyRegistry::new();
        deps.add_provider(|ctx: CallContext| async move { ctx });

        let handler = MethodFn::into_handler(|ctx: CallContext| async move {
            Ok::<_, MethodError>(ctx.get::<UserId>().unwrap_or_default().0)
        });

        let ctx = CallContext::new().with(UserId(7));
        let out = run(&handler, scope(deps, ctx, serde_json::json!([])))
            .await
            .unwrap();
        assert_eq!(out, serde_json::json!(7));
    }

    #[tokio::test]
    async fn exhausted_arguments_fail_the_call() {
        let handler =
            MethodFn::into_handler(|x: i64, y: i64| async move { Ok::<_, MethodError>(x + y) });

        let err = run(
            &handler,
            scope(
                DependencyRegistry::new(),
                CallContext::new(),
                serde_json::json!([2]),
            ),
        )
        .await
        .unwrap_err();
        assert_eq!(err.to_string(), "invalid arguments");
    }

    #[tokio::test]
    async fn handler_error_message_travels() {
        let handler = MethodFn::into_handler(|x: i64| async move {
            if x == 0 {
                return Err::<i64, MethodError>("expected error".into());
            }
            Ok(x)
        });

        let err = run(
            &handler,
            scope(
                DependencyRegistry::new(),
                CallContext::new(),
                serde_json::json!([0]),
            ),
        )
        .await
        .unwrap_err();
        assert_eq!(err.to_string(), "expected error");
    }

    #[test]
    fn receiver_name_defaults_to_bare_type_name() {
        struct Calculator;
        let service = Service::for_receiver::<Calculator>();
        assert_eq!(service.name(), "Calculator");
    }

    #[test]
    fn catalog_lists_every_method() {
        let service = Service::new("Calc")
            .method("Add", |x: i64, y: i64| async move {
                Ok::<_, MethodError>(x + y)
            })
            .method("Neg", |x: i64| async move { Ok::<_, MethodError>(-x) });

        let catalog = service.catalog();
        assert_eq!(catalog.get("Add"), Some(&1));
        assert_eq!(catalog.get("Neg"), Some(&1));
        assert_eq!(catalog.len(), 2);
    }

    #[test]
    fn guard_checks_the_context() {
        let service = Service::new("Admin").guard(|ctx| ctx.get::<UserId>().is_some());
        assert!(!service.check_guard(&CallContext::new()));
        assert!(service.check_guard(&CallContext::new().with(UserId(1))));
    }

    #[test]
    fn service_collision_overwrites() {
        let mut registry = ServiceRegistry::default();
        registry.insert(Service::new("Calc").method("Add", |x: i64| async move {
            Ok::<_, MethodError>(x)
        }));
        registry.insert(Service::new("Calc").method("Sub", |x: i64| async move {
            Ok::<_, MethodError>(x)
        }));

        let catalog = registry.catalog();
        assert_eq!(catalog["Calc"].len(), 1);
        assert!(catalog["Calc"].contains_key("Sub"));
    }
}
