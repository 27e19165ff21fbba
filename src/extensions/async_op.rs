//! Async extension.
//!
//! A request declaring `{"preferred": true}` is diverted to the operation
//! store: the extension creates a `pending` operation, spawns a detached
//! worker to run the function under the operation's cancellation token,
//! and short-circuits immediately with a `null` result plus an extension
//! output telling the caller how to poll.
//!
//! The worker publishes its terminal state through the store's transition
//! guard, so a result arriving after a cancel is a no-op.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::context::InvocationContext;
use crate::error::ErrorCode;
use crate::operation::{OperationStatus, OperationStore, TransitionPatch};
use crate::pipeline::{self, Extension, HookFlow, Priority};

pub const ASYNC_URN: &str = "urn:forrst:ext:async";

/// Poll target returned to the caller.
pub const STATUS_FN_URN: &str = "urn:forrst:system:fn:operation.status";

pub struct AsyncExtension {
    store: Arc<dyn OperationStore>,
}

impl AsyncExtension {
    pub fn new(store: Arc<dyn OperationStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Extension for AsyncExtension {
    fn urn(&self) -> &str {
        ASYNC_URN
    }

    fn priority(&self) -> Priority {
        Priority::Async
    }

    async fn before(&self, ctx: &InvocationContext, options: Option<&Value>) -> HookFlow {
        let preferred = options
            .and_then(|o| o.get("preferred"))
            .and_then(Value::as_bool)
            .unwrap_or(true);
        if !preferred {
            return HookFlow::Continue;
        }

        let descriptor = ctx.descriptor();
        let operation = self
            .store
            .create(
                descriptor.urn.as_str(),
                &descriptor.version.to_string(),
                &ctx.owner(),
            )
            .await;

        let token = CancellationToken::new();
        self.store.register_worker(&operation.id, token.clone());

        let worker_ctx = InvocationContext::new(
            ctx.request().clone(),
            ctx.function().clone(),
            ctx.args().clone(),
            None,
        )
        .with_cancel_token(token);
        let store = self.store.clone();
        let operation_id = operation.id.clone();
        tokio::spawn(async move {
            run_worker(store, operation_id, worker_ctx).await;
        });

        ctx.push_output(
            ASYNC_URN,
            Some(json!({
                "operation_id": operation.id,
                "status": operation.status.as_str(),
                "poll": {
                    "function": STATUS_FN_URN,
                    "arguments": { "operation_id": operation.id },
                },
                "retry_after": 1,
            })),
        );
        HookFlow::ShortCircuit(Ok(Value::Null))
    }
}

async fn run_worker(store: Arc<dyn OperationStore>, id: String, ctx: InvocationContext) {
    if store
        .transition(&id, OperationStatus::Processing, TransitionPatch::default())
        .await
        .is_err()
    {
        return;
    }

    match pipeline::invoke_guarded(&ctx).await {
        Ok(result) => {
            let _ = store
                .transition(
                    &id,
                    OperationStatus::Completed,
                    TransitionPatch {
                        result: Some(result),
                        ..Default::default()
                    },
                )
                .await;
        }
        Err(errors) => {
            let status = if errors
                .first()
                .map(|e| e.code == ErrorCode::Cancelled)
                .unwrap_or(false)
            {
                OperationStatus::Cancelled
            } else {
                OperationStatus::Failed
            };
            let _ = store
                .transition(
                    &id,
                    status,
                    TransitionPatch {
                        errors,
                        ..Default::default()
                    },
                )
                .await;
        }
    }
}
