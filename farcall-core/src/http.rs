//! HTTP front door: one handler, three intents.
//!
//! `GET` returns the catalog, `GET` with a `ws` query parameter upgrades into
//! a socket session, `POST` dispatches a call batch. Authorization is
//! whatever the context pipeline installed: an [`AccessToken`] in the context
//! must match the `x-farcall-token` header (POST) or the `token` query
//! parameter (upgrade); without one the server is open.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{FromRequestParts, Request, State};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use http::{header, HeaderMap, HeaderValue, Method, StatusCode};

use crate::context::{AccessToken, CallContext, ClientKey};
use crate::server::{Server, ServerInner};
use crate::session;

/// Header carrying the request token for POST batches.
pub const TOKEN_HEADER: &str = "x-farcall-token";

impl Server {
    /// The front door as an axum router, ready to be nested by the host app.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/", any(handle))
            .with_state(Arc::clone(&self.inner))
    }
}

async fn handle(State(server): State<Arc<ServerInner>>, request: Request) -> Response {
    let (mut parts, body) = request.into_parts();
    let ctx = server.pipeline.from_request(&parts);

    let wants_socket =
        parts.method == Method::GET && query_param(parts.uri.query(), "ws").is_some();

    if wants_socket {
        if !server.config.websocket {
            return plain_error(StatusCode::BAD_REQUEST, "websocket is not enabled");
        }
        let supplied = query_param(parts.uri.query(), "token");
        if !authorized(&ctx, supplied.as_deref()) {
            tracing::debug!("rejected socket upgrade: invalid token");
            return plain_error(StatusCode::FORBIDDEN, "invalid token");
        }
        let upgrade = match WebSocketUpgrade::from_request_parts(&mut parts, &()).await {
            Ok(upgrade) => upgrade,
            Err(rejection) => return rejection.into_response(),
        };
        let max_frame = server.config.max_frame_size;
        return upgrade
            .max_message_size(max_frame)
            .on_upgrade(move |socket| session::run(socket, server, ctx))
            .into_response();
    }

    if parts.method == Method::GET {
        return serve_catalog(&server, &ctx).await;
    }

    if parts.method != Method::POST {
        return plain_error(
            StatusCode::METHOD_NOT_ALLOWED,
            "only GET and POST requests are supported",
        );
    }

    let supplied = parts
        .headers
        .get(TOKEN_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned);
    if !authorized(&ctx, supplied.as_deref()) {
        tracing::debug!("rejected batch: invalid token");
        return plain_error(StatusCode::FORBIDDEN, "invalid token");
    }

    let bytes = match axum::body::to_bytes(body, server.config.max_body_bytes).await {
        Ok(bytes) => bytes,
        Err(err) => {
            tracing::error!(error = %err, "cannot read request body");
            return plain_error(StatusCode::BAD_REQUEST, "cannot read request body");
        }
    };

    let responses = server.process(&bytes, ctx.clone()).await;
    // Encode failures are logged and answered with whatever we have.
    let encoded = match server.config.codec.encode(&responses) {
        Ok(encoded) => encoded,
        Err(err) => {
            tracing::error!(error = %err, "cannot encode batch response");
            Vec::new()
        }
    };
    respond(&server, &ctx, None, encoded)
}

async fn serve_catalog(server: &Arc<ServerInner>, ctx: &CallContext) -> Response {
    let key = ctx.get::<ClientKey>().map(|key| key.0);
    let catalog = server.catalog(ctx).await;
    match server.config.codec.encode(&catalog) {
        Ok(encoded) => respond(server, ctx, key.as_deref(), encoded),
        Err(err) => {
            tracing::error!(error = %err, "cannot encode catalog");
            plain_error(StatusCode::INTERNAL_SERVER_ERROR, "cannot encode catalog")
        }
    }
}

fn respond(
    server: &Arc<ServerInner>,
    ctx: &CallContext,
    key: Option<&str>,
    body: Vec<u8>,
) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(server.config.codec.content_type()),
    );
    server.pipeline.to_response(ctx, &mut headers, key);
    (StatusCode::OK, headers, Body::from(body)).into_response()
}

fn plain_error(status: StatusCode, message: &'static str) -> Response {
    (status, message).into_response()
}

fn authorized(ctx: &CallContext, supplied: Option<&str>) -> bool {
    match ctx.get::<AccessToken>() {
        None => true,
        Some(AccessToken(expected)) => supplied == Some(expected.as_str()),
    }
}

fn query_param(query: Option<&str>, name: &str) -> Option<String> {
    let query = query?;
    form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
}
