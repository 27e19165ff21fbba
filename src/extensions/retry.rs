//! Retry extension (response-only).
//!
//! Replaces the former boolean `retryable` field on error objects: when a
//! request fails with a retryable code, the extension attaches a strategy
//! the caller can follow. It never alters the outcome.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::context::InvocationContext;
use crate::error::ErrorCode;
use crate::pipeline::{Extension, Outcome, Priority};

pub const RETRY_URN: &str = "urn:forrst:ext:retry";

#[derive(Default)]
pub struct RetryExtension;

impl RetryExtension {
    pub fn new() -> Self {
        Self
    }
}

fn after_seconds(code: &ErrorCode) -> u64 {
    match code {
        ErrorCode::RateLimited => 60,
        ErrorCode::Unavailable => 10,
        ErrorCode::DependencyError => 5,
        _ => 1,
    }
}

#[async_trait]
impl Extension for RetryExtension {
    fn urn(&self) -> &str {
        RETRY_URN
    }

    fn priority(&self) -> Priority {
        Priority::Observer
    }

    fn always_runs(&self) -> bool {
        true
    }

    async fn after(
        &self,
        ctx: &InvocationContext,
        _options: Option<&Value>,
        outcome: &mut Outcome,
    ) {
        let Err(errors) = outcome else {
            return;
        };
        let Some(first) = errors.first() else {
            return;
        };
        if !first.code.is_retryable() {
            return;
        }
        ctx.push_output(
            RETRY_URN,
            Some(json!({
                "strategy": "exponential_backoff",
                "after_seconds": after_seconds(&first.code),
                "max_attempts": 5,
            })),
        );
    }
}
