//! Deprecation extension.
//!
//! Purely observational: when the resolved function version carries a
//! deprecation note, the response meta and extension output surface it so
//! callers can plan migrations without consulting the discovery document.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::context::InvocationContext;
use crate::pipeline::{Extension, Outcome, Priority};

pub const DEPRECATION_URN: &str = "urn:forrst:ext:deprecation";

#[derive(Default)]
pub struct DeprecationExtension;

impl DeprecationExtension {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Extension for DeprecationExtension {
    fn urn(&self) -> &str {
        DEPRECATION_URN
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
        _outcome: &mut Outcome,
    ) {
        let descriptor = ctx.descriptor();
        let Some(note) = &descriptor.deprecated else {
            return;
        };
        let notice = json!({
            "function": descriptor.urn.as_str(),
            "version": descriptor.version.to_string(),
            "note": note,
        });
        ctx.set_meta("deprecated", notice.clone());
        ctx.push_output(DEPRECATION_URN, Some(notice));
    }
}
