//! Quota extension: fixed-window admission control.
//!
//! Counts requests per `(scope, window)` where the scope is the caller
//! identity from context (or `"global"`). Over-limit requests short-circuit
//! with `RATE_LIMITED`. Every counted request stamps `rate_limit` meta,
//! which the transport mirrors into `RateLimit-*` headers.

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::context::InvocationContext;
use crate::error::{ErrorCode, ErrorObject};
use crate::pipeline::{Extension, HookFlow, Priority};

pub const QUOTA_URN: &str = "urn:forrst:ext:quota";

/// Windows beyond which stale counters are pruned.
const PRUNE_THRESHOLD: usize = 4096;

pub struct QuotaExtension {
    enabled: bool,
    limit: u64,
    window: Duration,
    counters: Mutex<HashMap<(String, u64), u64>>,
}

impl QuotaExtension {
    pub fn new(enabled: bool, limit: u64, window: Duration) -> Self {
        Self {
            enabled,
            limit,
            window: window.max(Duration::from_secs(1)),
            counters: Mutex::new(HashMap::new()),
        }
    }

    fn admit(&self, scope: &str) -> (u64, u64, u64) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let window_secs = self.window.as_secs();
        let window_idx = now / window_secs;
        let reset = (window_idx + 1) * window_secs;

        let mut counters = self.counters.lock();
        if counters.len() > PRUNE_THRESHOLD {
            counters.retain(|(_, idx), _| *idx == window_idx);
        }
        let count = counters
            .entry((scope.to_string(), window_idx))
            .and_modify(|c| *c += 1)
            .or_insert(1);
        let remaining = self.limit.saturating_sub(*count);
        (*count, remaining, reset)
    }
}

#[async_trait]
impl Extension for QuotaExtension {
    fn urn(&self) -> &str {
        QUOTA_URN
    }

    fn priority(&self) -> Priority {
        Priority::Quota
    }

    fn always_runs(&self) -> bool {
        self.enabled
    }

    async fn before(&self, ctx: &InvocationContext, _options: Option<&Value>) -> HookFlow {
        if !self.enabled {
            return HookFlow::Continue;
        }
        let scope = ctx.caller().unwrap_or("global").to_string();
        let (count, remaining, reset) = self.admit(&scope);

        ctx.set_meta(
            "rate_limit",
            json!({ "limit": self.limit, "remaining": remaining, "reset": reset }),
        );

        if count > self.limit {
            return HookFlow::ShortCircuit(Err(vec![ErrorObject::new(
                ErrorCode::RateLimited,
                format!("quota of {} requests per window exhausted for '{scope}'", self.limit),
            )
            .with_details(json!({
                "scope": scope,
                "limit": self.limit,
                "reset": reset,
            }))]));
        }
        HookFlow::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_window_counting() {
        let quota = QuotaExtension::new(true, 2, Duration::from_secs(60));
        let (c1, r1, _) = quota.admit("svc-a");
        let (c2, r2, _) = quota.admit("svc-a");
        let (c3, r3, _) = quota.admit("svc-a");
        assert_eq!((c1, r1), (1, 1));
        assert_eq!((c2, r2), (2, 0));
        assert_eq!((c3, r3), (3, 0));
        // other scopes are unaffected
        let (c, _, _) = quota.admit("svc-b");
        assert_eq!(c, 1);
    }
}
