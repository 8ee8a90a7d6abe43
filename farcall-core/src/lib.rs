//! farcall-core: browser-facing RPC over HTTP and WebSocket.
//!
//! Clients discover a server's surface via a GET catalog, then invoke
//! registered methods by POSTing JSON or MessagePack call batches, or over a
//! long-lived socket that multiplexes the same batches with a topic-based
//! event stream. Method arguments are bound type-directed: a dependency
//! provider registered for the parameter type wins, anything else is decoded
//! from the wire.
//!
//! ```ignore
//! let server = Server::builder(ServerConfig::default())
//!     .service(Service::new("Calc").method("Add", |x: i64, y: i64| async move {
//!         Ok::<_, MethodError>(x + y)
//!     }))
//!     .build();
//! let app = axum::Router::new().nest_service("/api", server.router());
//! ```

pub mod codec;
pub mod context;
pub mod dependency;
pub mod error;
pub mod hub;
pub mod prelude;
pub mod server;
pub mod service;

mod dispatch;
mod http;
mod session;

pub use codec::{Action, Call, Codec, RawValue, Response};
pub use context::{
    AccessToken, CallContext, ClientKey, ConnId, ContextPipeline, ContextProvider,
    ContextReaction, UserId,
};
pub use dependency::DependencyRegistry;
pub use error::{CallError, CodecError, ProviderError, RegisterError};
pub use crate::http::TOKEN_HEADER;
pub use hub::{EventHub, HubStats, PresenceChange, PresenceHandler, SessionInfo, TopicGuard};
pub use server::{Catalog, Server, ServerBuilder, ServerConfig};
pub use service::{CallParam, MethodError, MethodFn, MethodResult, Service, ServiceGuard};
