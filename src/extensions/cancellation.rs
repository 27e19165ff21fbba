//! Cancellation extension.
//!
//! A request declares `{"token": "<opaque>"}` to make itself cancellable.
//! The extension maps the token to the request's cancellation signal in a
//! shared [`CancelRegistry`]; a second call to
//! `urn:forrst:ext:cancellation:fn:cancel` with the same token fires the
//! signal. Tokens are client-generated and live only as long as the
//! request they guard.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::context::InvocationContext;
use crate::error::{ErrorCode, ErrorObject};
use crate::function::{Function, FunctionDescriptor, FunctionResult};
use crate::pipeline::{Extension, HookFlow, Outcome, Priority};
use crate::protocol::JsonMap;
use crate::schema::{ArgumentSchema, FieldSpec, FieldType};
use tokio_util::sync::CancellationToken;

pub const CANCELLATION_URN: &str = "urn:forrst:ext:cancellation";
pub const CANCEL_FN_URN: &str = "urn:forrst:ext:cancellation:fn:cancel";

const SCRATCH_KEY: &str = "cancellation.token";

/// Token → signal map shared between the extension and the cancel
/// function.
#[derive(Default)]
pub struct CancelRegistry {
    tokens: Mutex<HashMap<String, CancellationToken>>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, token_id: &str, signal: CancellationToken) {
        self.tokens.lock().insert(token_id.to_string(), signal);
    }

    /// Fire the signal for a token. Returns false for unknown tokens.
    pub fn cancel(&self, token_id: &str) -> bool {
        match self.tokens.lock().remove(token_id) {
            Some(signal) => {
                signal.cancel();
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, token_id: &str) {
        self.tokens.lock().remove(token_id);
    }

    pub fn len(&self) -> usize {
        self.tokens.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.lock().is_empty()
    }
}

pub struct CancellationExtension {
    registry: Arc<CancelRegistry>,
}

impl CancellationExtension {
    pub fn new(registry: Arc<CancelRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl Extension for CancellationExtension {
    fn urn(&self) -> &str {
        CANCELLATION_URN
    }

    fn priority(&self) -> Priority {
        Priority::Cancellation
    }

    async fn before(&self, ctx: &InvocationContext, options: Option<&Value>) -> HookFlow {
        let token_id = options
            .and_then(|o| o.get("token"))
            .and_then(Value::as_str);
        let Some(token_id) = token_id else {
            return HookFlow::ShortCircuit(Err(vec![ErrorObject::new(
                ErrorCode::InvalidRequest,
                "cancellation extension requires a 'token' option",
            )
            .with_pointer("/extensions")]));
        };
        self.registry.register(token_id, ctx.cancel_token());
        ctx.set_scratch(SCRATCH_KEY, json!(token_id));
        HookFlow::Continue
    }

    async fn after(
        &self,
        ctx: &InvocationContext,
        _options: Option<&Value>,
        _outcome: &mut Outcome,
    ) {
        if let Some(token_id) = ctx.take_scratch(SCRATCH_KEY) {
            if let Some(token_id) = token_id.as_str() {
                self.registry.remove(token_id);
                ctx.push_output(
                    CANCELLATION_URN,
                    Some(json!({
                        "token": token_id,
                        "cancelled": ctx.is_cancelled(),
                    })),
                );
            }
        }
    }
}

/// `urn:forrst:ext:cancellation:fn:cancel`: fires a registered token.
pub struct CancelFunction {
    descriptor: FunctionDescriptor,
    registry: Arc<CancelRegistry>,
}

impl CancelFunction {
    pub fn new(registry: Arc<CancelRegistry>) -> Self {
        let descriptor = FunctionDescriptor::new(CANCEL_FN_URN, "1.0.0")
            .expect("static descriptor is valid")
            .with_summary("Cancel an in-flight request by its cancellation token")
            .with_arguments(ArgumentSchema::new(vec![FieldSpec::required(
                "token",
                FieldType::String,
            )]));
        Self {
            descriptor,
            registry,
        }
    }
}

#[async_trait]
impl Function for CancelFunction {
    fn descriptor(&self) -> &FunctionDescriptor {
        &self.descriptor
    }

    async fn invoke(&self, _ctx: &InvocationContext, args: JsonMap) -> FunctionResult {
        let token = args["token"].as_str().unwrap_or_default();
        if self.registry.cancel(token) {
            Ok(json!({ "token": token, "cancelled": true }))
        } else {
            Err(ErrorObject::new(
                ErrorCode::Custom("CANCEL_TOKEN_UNKNOWN".to_string()),
                format!("no in-flight request holds cancellation token '{token}'"),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_fires_signal_once() {
        let registry = CancelRegistry::new();
        let signal = CancellationToken::new();
        registry.register("t-1", signal.clone());

        assert!(registry.cancel("t-1"));
        assert!(signal.is_cancelled());
        // second cancel finds nothing
        assert!(!registry.cancel("t-1"));
    }

    #[test]
    fn test_unknown_token() {
        assert!(!CancelRegistry::new().cancel("nope"));
    }
}
