//! Server assembly and the catalog.
//!
//! All registration happens on the builder before serving; the built server
//! is a cheap-to-clone handle over frozen registries plus the running hub
//! actor.

use std::any::type_name;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;

use crate::codec::Codec;
use crate::context::{CallContext, ClientKey, ContextPipeline};
use crate::dependency::DependencyRegistry;
use crate::error::{ProviderError, RegisterError};
use crate::hub::{
    EventHub, HubConfig, PresenceChange, PresenceHandler, SessionInfo, SessionRegistry, TopicGuard,
};
use crate::service::{BoxFuture, Service, ServiceRegistry};

/// Per-server settings.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Wire encoding for bodies, catalogs, and socket frames.
    pub codec: Codec,
    /// Whether socket upgrades are served and advertised in the catalog.
    pub websocket: bool,
    /// Maximum inbound socket frame size in bytes.
    pub max_frame_size: usize,
    /// Maximum POST body size in bytes.
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            codec: Codec::Json,
            websocket: true,
            max_frame_size: 4000,
            max_body_bytes: 4 << 20,
        }
    }
}

/// Catalog snapshot handed to clients on GET.
#[derive(Debug, Serialize)]
pub struct Catalog {
    pub api: BTreeMap<String, BTreeMap<String, u8>>,
    pub data: BTreeMap<String, serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(skip_serializing_if = "is_false")]
    pub websocket: bool,
}

fn is_false(flag: &bool) -> bool {
    !*flag
}

type VariableResolver = Arc<
    dyn Fn(Arc<DependencyRegistry>, CallContext) -> BoxFuture<Result<serde_json::Value, ProviderError>>
        + Send
        + Sync,
>;

enum DataRecord {
    Constant(serde_json::Value),
    Variable {
        provides: &'static str,
        resolve: VariableResolver,
    },
}

// ── Builder ─────────────────────────────────────────────────────────────────

/// Collects registrations, then freezes them into a [`Server`].
pub struct ServerBuilder {
    config: ServerConfig,
    services: ServiceRegistry,
    data: HashMap<String, DataRecord>,
    deps: DependencyRegistry,
    pipeline: ContextPipeline,
    guards: HashMap<String, TopicGuard>,
    on_user: Option<PresenceHandler>,
    on_connection: Option<PresenceHandler>,
}

impl std::fmt::Debug for ServerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerBuilder").finish_non_exhaustive()
    }
}

impl ServerBuilder {
    fn new(config: ServerConfig) -> Self {
        Self {
            config,
            services: ServiceRegistry::default(),
            data: HashMap::new(),
            deps: DependencyRegistry::new(),
            pipeline: ContextPipeline::new(),
            guards: HashMap::new(),
            on_user: None,
            on_connection: None,
        }
    }

    /// Register a service; a name collision overwrites the earlier service.
    pub fn service(mut self, service: Service) -> Self {
        self.services.insert(service);
        self
    }

    /// Register a constant data record, resolved once at registration.
    pub fn constant<T: Serialize>(
        mut self,
        name: impl Into<String>,
        value: T,
    ) -> Result<Self, RegisterError> {
        let name = name.into();
        let value = serde_json::to_value(&value).map_err(|err| RegisterError::Constant {
            name: name.clone(),
            message: err.to_string(),
        })?;
        self.add_data(name, DataRecord::Constant(value))?;
        Ok(self)
    }

    /// Register a variable data record: its catalog value is produced by the
    /// dependency provider for `T` at catalog time.
    pub fn variable<T>(mut self, name: impl Into<String>) -> Result<Self, RegisterError>
    where
        T: Serialize + Send + 'static,
    {
        let resolve: VariableResolver = Arc::new(|deps, ctx| {
            Box::pin(async move {
                match deps.resolve::<T>(&ctx).await {
                    Some(Ok(value)) => {
                        serde_json::to_value(&value).map_err(ProviderError::new)
                    }
                    Some(Err(err)) => Err(err),
                    None => Err(ProviderError::new(format!(
                        "no provider registered for {}",
                        type_name::<T>()
                    ))),
                }
            })
        });
        self.add_data(
            name.into(),
            DataRecord::Variable {
                provides: type_name::<T>(),
                resolve,
            },
        )?;
        Ok(self)
    }

    fn add_data(&mut self, name: String, record: DataRecord) -> Result<(), RegisterError> {
        if self.data.contains_key(&name) {
            return Err(RegisterError::DataCollision { name });
        }
        self.data.insert(name, record);
        Ok(())
    }

    /// Register an infallible dependency provider for `T`.
    pub fn provider<T, F, Fut>(mut self, factory: F) -> Self
    where
        T: Send + Sync + 'static,
        F: Fn(CallContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = T> + Send + 'static,
    {
        self.deps.add_provider(factory);
        self
    }

    /// Register a dependency provider for `T` that may fail.
    pub fn fallible_provider<T, F, Fut>(mut self, factory: F) -> Self
    where
        T: Send + Sync + 'static,
        F: Fn(CallContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<T, ProviderError>> + Send + 'static,
    {
        self.deps.add_fallible(factory);
        self
    }

    /// Append a request→context provider to the pipeline.
    pub fn context_provider(
        mut self,
        provider: impl Fn(CallContext, &http::request::Parts) -> CallContext + Send + Sync + 'static,
    ) -> Self {
        self.pipeline.add_provider(provider);
        self
    }

    /// Append a context→response reaction to the pipeline.
    pub fn context_reaction(
        mut self,
        reaction: impl Fn(&CallContext, &mut http::HeaderMap, Option<&str>) + Send + Sync + 'static,
    ) -> Self {
        self.pipeline.add_reaction(reaction);
        self
    }

    /// Install cookie-based client keys under the given cookie name.
    pub fn cookie_client_key(mut self, cookie_name: impl Into<String>) -> Self {
        self.pipeline.use_cookie_client_key(cookie_name);
        self
    }

    /// Gate deliveries on a topic behind a predicate.
    pub fn topic_guard(
        mut self,
        topic: impl Into<String>,
        guard: impl Fn(&serde_json::Value, &SessionInfo) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.guards.insert(topic.into(), Arc::new(guard));
        self
    }

    /// Handle presence transitions across the 0↔1 session-count boundary.
    pub fn on_user(mut self, handler: impl Fn(&PresenceChange) + Send + Sync + 'static) -> Self {
        self.on_user = Some(Arc::new(handler));
        self
    }

    /// Handle presence transitions between existing sessions of a user.
    pub fn on_connection(
        mut self,
        handler: impl Fn(&PresenceChange) + Send + Sync + 'static,
    ) -> Self {
        self.on_connection = Some(Arc::new(handler));
        self
    }

    /// Freeze the registries, start the hub actor, and hand out the server.
    pub fn build(mut self) -> Server {
        // Built-in provider: handlers can take the context as a parameter.
        self.deps.add_provider(|ctx: CallContext| async move { ctx });

        let sessions: SessionRegistry = Arc::new(DashMap::new());
        let hub = EventHub::start(HubConfig {
            codec: self.config.codec,
            sessions: Arc::clone(&sessions),
            guards: self.guards,
            on_user: self.on_user,
            on_connection: self.on_connection,
        });

        Server {
            inner: Arc::new(ServerInner {
                config: self.config,
                services: self.services,
                data: self.data,
                deps: Arc::new(self.deps),
                pipeline: self.pipeline,
                hub,
                sessions,
                conn_seq: AtomicI64::new(0),
            }),
        }
    }
}

// ── Server ──────────────────────────────────────────────────────────────────

/// Shared server handle. Cloning shares all state.
#[derive(Clone)]
pub struct Server {
    pub(crate) inner: Arc<ServerInner>,
}

pub(crate) struct ServerInner {
    pub config: ServerConfig,
    pub services: ServiceRegistry,
    data: HashMap<String, DataRecord>,
    pub deps: Arc<DependencyRegistry>,
    pub pipeline: ContextPipeline,
    pub hub: EventHub,
    pub sessions: SessionRegistry,
    conn_seq: AtomicI64,
}

impl Server {
    pub fn builder(config: ServerConfig) -> ServerBuilder {
        ServerBuilder::new(config)
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    /// Handle to the event hub for server-side publishes.
    pub fn hub(&self) -> EventHub {
        self.inner.hub.clone()
    }

    /// Execute a serialized call batch against this context.
    pub async fn process(&self, body: &[u8], ctx: CallContext) -> Vec<crate::codec::Response> {
        self.inner.process(body, ctx).await
    }

    /// Project the catalog for this context.
    pub async fn catalog(&self, ctx: &CallContext) -> Catalog {
        self.inner.catalog(ctx).await
    }
}

impl ServerInner {
    pub(crate) fn next_conn_id(&self) -> i64 {
        self.conn_seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) async fn catalog(&self, ctx: &CallContext) -> Catalog {
        let mut data = BTreeMap::new();
        for (name, record) in &self.data {
            match record {
                DataRecord::Constant(value) => {
                    data.insert(name.clone(), value.clone());
                }
                DataRecord::Variable { provides, resolve } => {
                    match resolve(Arc::clone(&self.deps), ctx.clone()).await {
                        Ok(value) => {
                            data.insert(name.clone(), value);
                        }
                        Err(err) => {
                            tracing::error!(
                                name = %name,
                                provides,
                                error = %err,
                                "cannot resolve catalog variable"
                            );
                        }
                    }
                }
            }
        }

        Catalog {
            api: self.services.catalog(),
            data,
            key: ctx.get::<ClientKey>().map(|key| key.0),
            websocket: self.config.websocket,
        }
    }
}
