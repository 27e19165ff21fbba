//! SSE streaming adapter.
//!
//! Serves functions that declare the streamable capability when the
//! request carries the `stream` extension with `accept = true`. The wire
//! format is one SSE event per chunk:
//!
//! ```text
//! event: connected          first event, carries the request id
//! data: {"seq":0,"data":...,"done":false}
//! data: {"seq":1,"data":...,"done":false}
//! data: {"seq":2,"done":true,"result":...}   (or "errors": [...])
//! ```
//!
//! `seq` is monotonic from 0. Client disconnect cancels the invocation
//! context; a drop guard makes that cleanup run exactly once on every
//! exit path. Before hooks run ahead of the stream (a short-circuit
//! falls back to a plain JSON response); after hooks run when the
//! generator finishes, before the final event.

use std::convert::Infallible;
use std::sync::Arc;

use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use futures::StreamExt;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::context::{wait_until, InvocationContext};
use crate::error::map_internal;
use crate::handler::{DispatchOutcome, RequestHandler};
use crate::pipeline::{self, ActiveHook, Outcome};

/// Guard that cancels the context when the stream ends for any reason.
struct CancelOnDrop(Arc<InvocationContext>);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

/// Serve a prepared, streamable invocation over SSE.
///
/// Returns `Err` with a normal JSON dispatch outcome when a before hook
/// short-circuits (deadline already expired, quota exhausted, ...).
pub async fn serve_stream(
    handler: Arc<RequestHandler>,
    ctx: Arc<InvocationContext>,
) -> Result<axum::response::Response, DispatchOutcome> {
    let hooks = match pipeline::active_hooks(handler.extensions(), &ctx) {
        Ok(hooks) => hooks,
        Err(err) => return Err(handler.assemble(&ctx, Err(vec![err]))),
    };

    if let Some((mut outcome, entered)) = pipeline::run_before(&hooks, &ctx).await {
        pipeline::run_after(&hooks, entered, &ctx, &mut outcome).await;
        return Err(handler.assemble(&ctx, outcome));
    }

    let (event_tx, event_rx) = mpsc::channel::<Event>(16);
    tokio::spawn(generate(handler, ctx, hooks, event_tx));

    let stream = ReceiverStream::new(event_rx).map(Ok::<_, Infallible>);
    let mut response = Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response();
    let headers = response.headers_mut();
    headers.insert("cache-control", "no-cache".parse().expect("static header"));
    headers.insert("connection", "keep-alive".parse().expect("static header"));
    headers.insert("x-accel-buffering", "no".parse().expect("static header"));
    Ok(response)
}

async fn generate(
    handler: Arc<RequestHandler>,
    ctx: Arc<InvocationContext>,
    hooks: Vec<ActiveHook>,
    event_tx: mpsc::Sender<Event>,
) {
    let _guard = CancelOnDrop(ctx.clone());

    let connected = Event::default()
        .event("connected")
        .data(json!({ "id": ctx.request_id() }).to_string());
    if event_tx.send(connected).await.is_err() {
        return;
    }

    let (chunk_tx, mut chunk_rx) = mpsc::channel::<serde_json::Value>(16);
    let invoke_ctx = ctx.clone();
    let invoke_task = tokio::spawn(async move {
        let function = invoke_ctx.function().clone();
        let args = invoke_ctx.args().clone();
        let cancel_token = invoke_ctx.cancel_token();
        tokio::select! {
            biased;
            _ = wait_until(invoke_ctx.deadline_instant()) => {
                Err(invoke_ctx.cancellation_error())
            }
            _ = cancel_token.cancelled() => {
                Err(invoke_ctx.cancellation_error())
            }
            result = function.invoke_stream(&invoke_ctx, args, chunk_tx) => result,
        }
    });

    let mut seq: u64 = 0;
    while let Some(chunk) = chunk_rx.recv().await {
        let payload = json!({ "seq": seq, "data": chunk, "done": false });
        if event_tx
            .send(Event::default().data(payload.to_string()))
            .await
            .is_err()
        {
            // Client went away. Cancel now so the invocation task is not
            // left blocked on a full chunk channel.
            tracing::debug!(request_id = %ctx.request_id(), "sse client disconnected");
            ctx.cancel();
            break;
        }
        seq += 1;
    }

    let mut outcome: Outcome = match invoke_task.await {
        Ok(Ok(result)) => Ok(result),
        Ok(Err(err)) => Err(vec![err]),
        Err(join) => {
            let cause = if join.is_panic() {
                "streaming worker panicked"
            } else {
                "streaming worker aborted"
            };
            Err(vec![map_internal(&anyhow::anyhow!(cause))])
        }
    };
    pipeline::run_after(&hooks, hooks.len(), &ctx, &mut outcome).await;
    if let Err(errors) = &mut outcome {
        handler.scrub_internal(errors);
    }

    let final_payload = match &outcome {
        Ok(result) => json!({ "seq": seq, "done": true, "result": result }),
        Err(errors) => json!({ "seq": seq, "done": true, "errors": errors }),
    };
    let _ = event_tx
        .send(Event::default().data(final_payload.to_string()))
        .await;
}
