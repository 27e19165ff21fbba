//! Deadline extension.
//!
//! Options are either relative (`{"value": 10, "unit": "millisecond"}`,
//! units `millisecond`/`second`/`minute`) or absolute
//! (`{"absolute": "2026-01-01T00:00:00Z"}`). `before` stamps the deadline
//! on the context and short-circuits with `DEADLINE_EXCEEDED` when it has
//! already passed; `after` reports `{specified, elapsed, remaining,
//! utilization}`.
//!
//! Runs on every request so a server-default deadline (set at context
//! construction) is also reported.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use crate::context::InvocationContext;
use crate::error::{ErrorCode, ErrorObject};
use crate::pipeline::{Extension, HookFlow, Outcome, Priority};

pub const DEADLINE_URN: &str = "urn:forrst:ext:deadline";

#[derive(Default)]
pub struct DeadlineExtension;

impl DeadlineExtension {
    pub fn new() -> Self {
        Self
    }
}

fn bad_options(message: impl Into<String>) -> HookFlow {
    HookFlow::ShortCircuit(Err(vec![ErrorObject::new(
        ErrorCode::InvalidRequest,
        message,
    )
    .with_pointer("/extensions")]))
}

/// Parse options into a millisecond budget relative to now.
fn parse_budget_ms(options: &Value) -> Result<i64, String> {
    if let Some(absolute) = options.get("absolute") {
        let raw = absolute
            .as_str()
            .ok_or("deadline 'absolute' must be an ISO-8601 string")?;
        let at: DateTime<Utc> = raw
            .parse()
            .map_err(|_| format!("deadline '{raw}' is not a valid ISO-8601 timestamp"))?;
        return Ok((at - Utc::now()).num_milliseconds());
    }

    let value = options
        .get("value")
        .and_then(Value::as_i64)
        .ok_or("deadline 'value' must be an integer")?;
    if value < 0 {
        return Err("deadline 'value' must not be negative".to_string());
    }
    let unit = options
        .get("unit")
        .and_then(Value::as_str)
        .unwrap_or("millisecond");
    let factor = match unit {
        "millisecond" => 1,
        "second" => 1_000,
        "minute" => 60_000,
        other => return Err(format!("unknown deadline unit '{other}'")),
    };
    Ok(value.saturating_mul(factor))
}

#[async_trait]
impl Extension for DeadlineExtension {
    fn urn(&self) -> &str {
        DEADLINE_URN
    }

    fn priority(&self) -> Priority {
        Priority::Deadline
    }

    fn always_runs(&self) -> bool {
        true
    }

    async fn before(&self, ctx: &InvocationContext, options: Option<&Value>) -> HookFlow {
        if let Some(options) = options {
            let budget_ms = match parse_budget_ms(options) {
                Ok(ms) => ms,
                Err(message) => return bad_options(message),
            };
            let specified = budget_ms.max(0) as u64;
            ctx.set_deadline(
                Instant::now() + Duration::from_millis(specified),
                specified,
            );
        }

        if ctx.deadline_expired() {
            let specified = ctx.deadline_specified_ms().unwrap_or(0);
            return HookFlow::ShortCircuit(Err(vec![ErrorObject::new(
                ErrorCode::DeadlineExceeded,
                "deadline expired before invocation",
            )
            .with_details(json!({
                "specified_ms": specified,
                "elapsed_ms": ctx.elapsed_ms(),
            }))]));
        }
        HookFlow::Continue
    }

    async fn after(
        &self,
        ctx: &InvocationContext,
        _options: Option<&Value>,
        _outcome: &mut Outcome,
    ) {
        let Some(specified) = ctx.deadline_specified_ms() else {
            return;
        };
        let elapsed = ctx.elapsed_ms();
        let remaining = specified.saturating_sub(elapsed);
        let utilization = elapsed as f64 / specified.max(1) as f64;
        ctx.push_output(
            DEADLINE_URN,
            Some(json!({
                "specified": { "value": specified, "unit": "millisecond" },
                "elapsed": { "value": elapsed, "unit": "millisecond" },
                "remaining": { "value": remaining, "unit": "millisecond" },
                "utilization": utilization,
            })),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_budget() {
        assert_eq!(parse_budget_ms(&json!({"value": 10})).unwrap(), 10);
        assert_eq!(
            parse_budget_ms(&json!({"value": 2, "unit": "second"})).unwrap(),
            2_000
        );
        assert_eq!(
            parse_budget_ms(&json!({"value": 1, "unit": "minute"})).unwrap(),
            60_000
        );
    }

    #[test]
    fn test_bad_options() {
        assert!(parse_budget_ms(&json!({"value": "ten"})).is_err());
        assert!(parse_budget_ms(&json!({"value": -5})).is_err());
        assert!(parse_budget_ms(&json!({"value": 1, "unit": "fortnight"})).is_err());
        assert!(parse_budget_ms(&json!({"absolute": "not-a-date"})).is_err());
    }

    #[test]
    fn test_absolute_in_past_yields_non_positive_budget() {
        let past = (Utc::now() - chrono::Duration::seconds(5)).to_rfc3339();
        assert!(parse_budget_ms(&json!({"absolute": past})).unwrap() <= 0);
    }
}
