//! Everything a host application typically needs.

pub use crate::codec::Codec;
pub use crate::context::{AccessToken, CallContext, ClientKey, ConnId, UserId};
pub use crate::error::ProviderError;
pub use crate::hub::EventHub;
pub use crate::server::{Server, ServerBuilder, ServerConfig};
pub use crate::service::{MethodError, MethodResult, Service};
