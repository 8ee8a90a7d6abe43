//! Batch fan-out execution with per-call isolation.
//!
//! Every call of a batch runs in its own task; responses are tagged with
//! their input index and gathered back in order. A panicking handler is
//! confined to its own call.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use tokio::sync::mpsc;

use crate::codec::{self, Call, RawValue, Response};
use crate::context::CallContext;
use crate::error::CallError;
use crate::server::ServerInner;
use crate::service::CallScope;

impl ServerInner {
    /// Execute a serialized batch. A malformed batch is logged and answered
    /// with an empty response list.
    pub(crate) async fn process(self: &Arc<Self>, body: &[u8], ctx: CallContext) -> Vec<Response> {
        match codec::decode_batch(self.config.codec, body) {
            Ok(calls) => self.run_batch(calls, ctx).await,
            Err(err) => {
                tracing::error!(error = %err, "cannot decode call batch");
                Vec::new()
            }
        }
    }

    /// Execute a batch arriving as a socket envelope body.
    pub(crate) async fn process_raw(
        self: &Arc<Self>,
        body: RawValue,
        ctx: CallContext,
    ) -> Vec<Response> {
        match codec::batch_from_raw(body) {
            Ok(calls) => self.run_batch(calls, ctx).await,
            Err(err) => {
                tracing::error!(error = %err, "cannot decode call batch");
                Vec::new()
            }
        }
    }

    async fn run_batch(self: &Arc<Self>, calls: Vec<Call>, ctx: CallContext) -> Vec<Response> {
        let count = calls.len();
        if count == 0 {
            return Vec::new();
        }

        let codec = self.config.codec;
        let (tx, mut rx) = mpsc::channel::<(usize, Response)>(count);
        for (index, call) in calls.into_iter().enumerate() {
            let server = Arc::clone(self);
            let ctx = ctx.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let response = server.run_call(call, ctx).await;
                let _ = tx.send((index, response)).await;
            });
        }
        drop(tx);

        // Gather with ordering: every worker tags its input index.
        let mut responses: Vec<Response> = (0..count)
            .map(|_| Response::data(String::new(), RawValue::null(codec)))
            .collect();
        while let Some((index, response)) = rx.recv().await {
            responses[index] = response;
        }
        responses
    }

    async fn run_call(self: &Arc<Self>, call: Call, ctx: CallContext) -> Response {
        let id = call.id.clone();
        let codec = self.config.codec;
        tracing::debug!(name = %call.name, "call");

        match AssertUnwindSafe(self.dispatch_call(call, ctx))
            .catch_unwind()
            .await
        {
            Ok(Ok(data)) => Response::data(id, data),
            Ok(Err(err)) => {
                tracing::debug!(error = %err, "call failed");
                Response::error(id, codec, &err)
            }
            Err(payload) => {
                tracing::error!(
                    panic = panic_message(payload.as_ref()),
                    backtrace = %std::backtrace::Backtrace::force_capture(),
                    "method call panicked"
                );
                Response::error(id, codec, &CallError::Panic)
            }
        }
    }

    async fn dispatch_call(&self, call: Call, ctx: CallContext) -> Result<RawValue, CallError> {
        let (service_name, method_name) =
            call.name.split_once('.').ok_or(CallError::InvalidMethod)?;
        let service = self
            .services
            .get(service_name)
            .ok_or(CallError::UnknownService)?;
        if !service.check_guard(&ctx) {
            return Err(CallError::AccessDenied);
        }
        let handler = service
            .handler(method_name)
            .ok_or(CallError::InvalidMethod)?;

        let cancelled = ctx.cancellation().clone();
        let scope = CallScope::new(
            ctx,
            Arc::clone(&self.deps),
            self.config.codec,
            call.args,
        );
        tokio::select! {
            _ = cancelled.cancelled() => Err(CallError::Cancelled),
            result = handler(scope) => result,
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::UserId;
    use crate::server::{Server, ServerConfig};
    use crate::service::{MethodError, Service};

    fn calc() -> Service {
        Service::new("Calc")
            .method("Add", |x: i64, y: i64| async move {
                Ok::<_, MethodError>(x + y)
            })
            .method("Fail", |_x: i64| async move {
                Err::<i64, MethodError>("expected error".into())
            })
            .method("Boom", |x: i64| async move {
                if x >= 0 {
                    panic!("boom");
                }
                Ok::<i64, MethodError>(x)
            })
    }

    async fn process(server: &Server, body: &str) -> serde_json::Value {
        let responses = server.process(body.as_bytes(), CallContext::new()).await;
        serde_json::to_value(&responses).unwrap()
    }

    #[tokio::test]
    async fn single_call() {
        let server = Server::builder(ServerConfig::default()).service(calc()).build();
        let out = process(&server, r#"[{"id":"1","name":"Calc.Add","args":[2,3]}]"#).await;
        assert_eq!(
            out,
            serde_json::json!([{"id": "1", "data": 5, "error": ""}])
        );
    }

    #[tokio::test]
    async fn batch_order_matches_input_order() {
        let server = Server::builder(ServerConfig::default()).service(calc()).build();
        let out = process(
            &server,
            r#"[{"id":"a","name":"Calc.Add","args":[2,3]},{"id":"b","name":"Calc.Add","args":[-2,3]}]"#,
        )
        .await;
        assert_eq!(
            out,
            serde_json::json!([
                {"id": "a", "data": 5, "error": ""},
                {"id": "b", "data": 1, "error": ""}
            ])
        );
    }

    #[tokio::test]
    async fn handler_error_becomes_the_response_error() {
        let server = Server::builder(ServerConfig::default()).service(calc()).build();
        let out = process(&server, r#"[{"id":"x","name":"Calc.Fail","args":[1]}]"#).await;
        assert_eq!(
            out,
            serde_json::json!([{"id": "x", "data": null, "error": "expected error"}])
        );
    }

    #[tokio::test]
    async fn malformed_batch_yields_an_empty_response_list() {
        let server = Server::builder(ServerConfig::default()).service(calc()).build();
        let responses = server.process(b"{oops", CallContext::new()).await;
        assert!(responses.is_empty());
    }

    #[tokio::test]
    async fn unknown_targets_are_per_call_errors() {
        let server = Server::builder(ServerConfig::default()).service(calc()).build();
        let out = process(
            &server,
            r#"[{"id":"a","name":"Nope.Add","args":[]},{"id":"b","name":"Calc.Nope","args":[]},{"id":"c","name":"nodot","args":[]}]"#,
        )
        .await;
        assert_eq!(out[0]["error"], "Unknown service");
        assert_eq!(out[1]["error"], "Invalid method name");
        assert_eq!(out[2]["error"], "Invalid method name");
    }

    #[tokio::test]
    async fn panic_is_isolated_to_its_call() {
        let server = Server::builder(ServerConfig::default()).service(calc()).build();
        let out = process(
            &server,
            r#"[{"id":"a","name":"Calc.Boom","args":[1]},{"id":"b","name":"Calc.Add","args":[2,3]}]"#,
        )
        .await;
        assert_eq!(out[0]["error"], "Method call error");
        assert_eq!(out[1]["data"], 5);
        assert_eq!(out[1]["error"], "");
    }

    #[tokio::test]
    async fn guard_denies_access() {
        let guarded = Service::new("Admin")
            .guard(|ctx| ctx.get::<UserId>().is_some())
            .method("Ping", || async move { Ok::<_, MethodError>("pong") });
        let server = Server::builder(ServerConfig::default()).service(guarded).build();

        let denied = process(&server, r#"[{"id":"1","name":"Admin.Ping"}]"#).await;
        assert_eq!(denied[0]["error"], "Access Denied");

        let ctx = CallContext::new().with(UserId(1));
        let allowed = server
            .process(br#"[{"id":"1","name":"Admin.Ping"}]"#, ctx)
            .await;
        assert_eq!(allowed[0].error, "");
    }

    #[tokio::test]
    async fn cancellation_wins_over_a_stuck_handler() {
        let stuck = Service::new("Slow").method("Wait", || async move {
            tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
            Ok::<_, MethodError>(())
        });
        let server = Server::builder(ServerConfig::default()).service(stuck).build();

        let ctx = CallContext::new();
        let token = ctx.cancellation().clone();
        let pending = tokio::spawn({
            let server = server.clone();
            async move {
                server
                    .process(br#"[{"id":"1","name":"Slow.Wait"}]"#, ctx)
                    .await
            }
        });
        tokio::task::yield_now().await;
        token.cancel();

        let out = pending.await.unwrap();
        assert_eq!(out[0].error, "Call cancelled");
    }
}
