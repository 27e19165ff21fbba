//! Dry-run extension.
//!
//! Applicable only to functions whose declared operation is `write` or
//! `delete`. Argument binding has already validated the call by the time
//! the pipeline runs, so the extension short-circuits before the function
//! body executes and returns a validation-only payload, guaranteeing no
//! side effects.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::context::InvocationContext;
use crate::function::{FunctionDescriptor, OperationKind};
use crate::pipeline::{Extension, HookFlow, Priority};

pub const DRY_RUN_URN: &str = "urn:forrst:ext:dry-run";

#[derive(Default)]
pub struct DryRunExtension;

impl DryRunExtension {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Extension for DryRunExtension {
    fn urn(&self) -> &str {
        DRY_RUN_URN
    }

    fn priority(&self) -> Priority {
        Priority::DryRun
    }

    fn applicable_to(&self, descriptor: &FunctionDescriptor) -> bool {
        descriptor.capabilities.operation != OperationKind::Read
    }

    async fn before(&self, ctx: &InvocationContext, options: Option<&Value>) -> HookFlow {
        let enabled = options
            .and_then(|o| o.get("enabled"))
            .and_then(Value::as_bool)
            .unwrap_or(true);
        if !enabled {
            return HookFlow::Continue;
        }
        ctx.mark_dry_run();
        ctx.push_output(DRY_RUN_URN, Some(json!({ "applied": true })));
        let descriptor = ctx.descriptor();
        HookFlow::ShortCircuit(Ok(json!({
            "dry_run": true,
            "valid": true,
            "function": descriptor.urn.as_str(),
            "version": descriptor.version.to_string(),
        })))
    }
}
