//! Per-request context and the provider/reaction pipeline.
//!
//! The context is the only channel for attaching user, session, and token
//! values to a call. Authentication, cookie parsing, and similar policies
//! live entirely in host-supplied providers; the core only reads the
//! well-known value types defined here.

use std::fmt;
use std::sync::Arc;

use http::request::Parts;
use http::{header, HeaderMap, HeaderValue};
use tokio_util::sync::CancellationToken;

/// Typed value bag threaded from the request into every call, provider, and
/// session. Cloning is cheap enough to hand one to each call worker.
#[derive(Clone, Default)]
pub struct CallContext {
    values: http::Extensions,
    cancel: CancellationToken,
}

impl CallContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a value, replacing any previous value of the same type.
    pub fn insert<T: Clone + Send + Sync + 'static>(&mut self, value: T) {
        self.values.insert(value);
    }

    /// Builder-style [`insert`](Self::insert).
    pub fn with<T: Clone + Send + Sync + 'static>(mut self, value: T) -> Self {
        self.insert(value);
        self
    }

    /// Retrieve a value by type, cloning it out of the context.
    pub fn get<T: Clone + Send + Sync + 'static>(&self) -> Option<T> {
        self.values.get::<T>().cloned()
    }

    /// Cancellation signal of the surrounding request or session.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub(crate) fn set_cancellation(&mut self, token: CancellationToken) {
        self.cancel = token;
    }
}

impl fmt::Debug for CallContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallContext")
            .field("value_count", &self.values.len())
            .finish()
    }
}

// A `CallContext` parameter is always satisfied by the server's built-in
// provider; it never arrives as a wire argument.
impl<'de> serde::Deserialize<'de> for CallContext {
    fn deserialize<D: serde::Deserializer<'de>>(_deserializer: D) -> Result<Self, D::Error> {
        Err(serde::de::Error::custom(
            "CallContext is supplied by the server, not by wire arguments",
        ))
    }
}

// ── Well-known context values ───────────────────────────────────────────────

/// Client correlation key, emitted in the catalog's `key` field when present.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ClientKey(pub String);

impl ClientKey {
    /// Mint a fresh random key.
    pub fn mint() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }
}

/// Expected request token. When a provider installs one, the front door
/// requires the matching value in the `x-farcall-token` header (POST) or the
/// `token` query parameter (socket upgrade).
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct AccessToken(pub String);

/// Authenticated user id; `0` when no provider installed one.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize,
)]
pub struct UserId(pub i64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-session connection id, monotonically increasing per server. Used to
/// target publishes and to correlate client-side state.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct ConnId(pub i64);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Pipeline ────────────────────────────────────────────────────────────────

/// Fills the context from the incoming request.
pub type ContextProvider = Arc<dyn Fn(CallContext, &Parts) -> CallContext + Send + Sync>;

/// Reacts to the outgoing response; the third argument is the catalog key
/// about to be emitted, if any.
pub type ContextReaction = Arc<dyn Fn(&CallContext, &mut HeaderMap, Option<&str>) + Send + Sync>;

/// Ordered chain of request→context providers and context→response reactions.
#[derive(Clone, Default)]
pub struct ContextPipeline {
    providers: Vec<ContextProvider>,
    reactions: Vec<ContextReaction>,
}

impl ContextPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_provider(
        &mut self,
        provider: impl Fn(CallContext, &Parts) -> CallContext + Send + Sync + 'static,
    ) {
        self.providers.push(Arc::new(provider));
    }

    pub fn add_reaction(
        &mut self,
        reaction: impl Fn(&CallContext, &mut HeaderMap, Option<&str>) + Send + Sync + 'static,
    ) {
        self.reactions.push(Arc::new(reaction));
    }

    /// Thread a fresh context through all providers in registration order.
    pub fn from_request(&self, parts: &Parts) -> CallContext {
        let mut ctx = CallContext::new();
        for provider in &self.providers {
            ctx = provider(ctx, parts);
        }
        ctx
    }

    /// Run all reactions in registration order.
    pub fn to_response(&self, ctx: &CallContext, headers: &mut HeaderMap, key: Option<&str>) {
        for reaction in &self.reactions {
            reaction(ctx, headers, key);
        }
    }

    /// Install cookie-based client keys: a provider that reads the key from
    /// the named cookie (minting a fresh one when absent) and a reaction that
    /// sets the cookie whenever a fresh key was minted.
    pub fn use_cookie_client_key(&mut self, cookie_name: impl Into<String>) {
        #[derive(Clone, Copy)]
        struct FreshKey;

        let name = cookie_name.into();
        let reaction_name = name.clone();

        self.add_provider(move |mut ctx, parts| {
            match cookie_value(&parts.headers, &name) {
                Some(value) => ctx.insert(ClientKey(value)),
                None => {
                    ctx.insert(ClientKey::mint());
                    ctx.insert(FreshKey);
                }
            }
            ctx
        });
        self.add_reaction(move |ctx, headers, _key| {
            if ctx.get::<FreshKey>().is_none() {
                return;
            }
            let Some(ClientKey(key)) = ctx.get::<ClientKey>() else {
                return;
            };
            if let Ok(value) = HeaderValue::from_str(&format!("{reaction_name}={key}; Path=/")) {
                headers.append(header::SET_COOKIE, value);
            }
        });
    }
}

fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    for header in headers.get_all(header::COOKIE) {
        let Ok(text) = header.to_str() else { continue };
        for pair in text.split(';') {
            if let Some((cookie, value)) = pair.trim().split_once('=') {
                if cookie == name {
                    return Some(value.to_owned());
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_parts(builder: http::request::Builder) -> Parts {
        let (parts, ()) = builder.body(()).unwrap().into_parts();
        parts
    }

    #[test]
    fn providers_run_in_registration_order() {
        let mut pipeline = ContextPipeline::new();
        pipeline.add_provider(|ctx, _parts| ctx.with(UserId(1)));
        pipeline.add_provider(|ctx, _parts| ctx.with(UserId(2)));

        let parts = request_parts(http::Request::get("/"));
        let ctx = pipeline.from_request(&parts);
        assert_eq!(ctx.get::<UserId>(), Some(UserId(2)));
    }

    #[test]
    fn reactions_see_the_key() {
        let mut pipeline = ContextPipeline::new();
        pipeline.add_reaction(|_ctx, headers, key| {
            if let Some(key) = key {
                headers.insert("x-key", HeaderValue::from_str(key).unwrap());
            }
        });

        let mut headers = HeaderMap::new();
        pipeline.to_response(&CallContext::new(), &mut headers, Some("abc"));
        assert_eq!(headers.get("x-key").unwrap(), "abc");
    }

    #[test]
    fn cookie_key_round_trip() {
        let mut pipeline = ContextPipeline::new();
        pipeline.use_cookie_client_key("farcall-key");

        // No cookie: a key is minted and the reaction sets it.
        let parts = request_parts(http::Request::get("/"));
        let ctx = pipeline.from_request(&parts);
        let minted = ctx.get::<ClientKey>().unwrap();
        let mut headers = HeaderMap::new();
        pipeline.to_response(&ctx, &mut headers, None);
        let cookie = headers.get(header::SET_COOKIE).unwrap().to_str().unwrap();
        assert!(cookie.starts_with(&format!("farcall-key={}", minted.0)));

        // Existing cookie: reused, no Set-Cookie.
        let parts = request_parts(
            http::Request::get("/").header(header::COOKIE, "other=1; farcall-key=abc"),
        );
        let ctx = pipeline.from_request(&parts);
        assert_eq!(ctx.get::<ClientKey>(), Some(ClientKey("abc".into())));
        let mut headers = HeaderMap::new();
        pipeline.to_response(&ctx, &mut headers, None);
        assert!(headers.get(header::SET_COOKIE).is_none());
    }

    #[test]
    fn context_values_clone_out() {
        let mut ctx = CallContext::new();
        ctx.insert(ClientKey("k".into()));
        assert_eq!(ctx.get::<ClientKey>(), Some(ClientKey("k".into())));
        assert_eq!(ctx.get::<UserId>(), None);
    }
}
