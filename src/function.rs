//! The function seam: the trait user code implements, plus descriptors.
//!
//! A function is uniquely identified by `(urn, version)` and immutable once
//! registered. Its [`FunctionDescriptor`] declares everything the runtime
//! and the discovery document need: argument schema, result schema, error
//! catalog, and capability flags.
//!
//! # Example
//!
//! ```rust
//! use async_trait::async_trait;
//! use serde_json::{json, Value};
//! use forrst::context::InvocationContext;
//! use forrst::error::ErrorObject;
//! use forrst::function::{Function, FunctionDescriptor, FunctionResult};
//! use forrst::protocol::JsonMap;
//! use forrst::schema::{ArgumentSchema, FieldSpec, FieldType};
//!
//! pub struct AddFunction {
//!     descriptor: FunctionDescriptor,
//! }
//!
//! impl AddFunction {
//!     pub fn new() -> Self {
//!         let descriptor = FunctionDescriptor::new("urn:acme:forrst:fn:math.add", "1.0.0")
//!             .unwrap()
//!             .with_summary("Add two numbers")
//!             .with_arguments(ArgumentSchema::new(vec![
//!                 FieldSpec::required("a", FieldType::Number),
//!                 FieldSpec::required("b", FieldType::Number),
//!             ]));
//!         Self { descriptor }
//!     }
//! }
//!
//! #[async_trait]
//! impl Function for AddFunction {
//!     fn descriptor(&self) -> &FunctionDescriptor {
//!         &self.descriptor
//!     }
//!
//!     async fn invoke(&self, _ctx: &InvocationContext, args: JsonMap) -> FunctionResult {
//!         let a = args["a"].as_f64().unwrap_or(0.0);
//!         let b = args["b"].as_f64().unwrap_or(0.0);
//!         Ok(json!({ "sum": a + b }))
//!     }
//! }
//! ```

use async_trait::async_trait;
use semver::Version;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::context::InvocationContext;
use crate::error::{ErrorCode, ErrorObject};
use crate::protocol::JsonMap;
use crate::schema::ArgumentSchema;
use crate::urn::Urn;
use crate::version::{parse_version, Stability};

/// What a function invocation produces: a JSON result or one error object.
pub type FunctionResult = Result<Value, ErrorObject>;

/// Channel on which a streaming function emits chunks.
pub type ChunkSender = mpsc::Sender<Value>;

/// The kind of operation a function performs, for dry-run gating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Read,
    Write,
    Delete,
}

/// Capability flags declared by a function.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct Capabilities {
    pub streamable: bool,
    pub idempotent: bool,
    pub operation: OperationKind,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            streamable: false,
            idempotent: false,
            operation: OperationKind::Read,
        }
    }
}

/// Everything the runtime knows about a registered function.
#[derive(Debug, Clone)]
pub struct FunctionDescriptor {
    pub urn: Urn,
    pub version: Version,
    pub summary: Option<String>,
    pub arguments: ArgumentSchema,
    pub result_schema: Option<Value>,
    /// Error codes this function may return, for the discovery document.
    pub errors: Vec<ErrorCode>,
    pub discoverable: bool,
    pub deprecated: Option<String>,
    pub capabilities: Capabilities,
}

impl FunctionDescriptor {
    /// Build a descriptor, validating URN shape and version strictness.
    pub fn new(urn: &str, version: &str) -> anyhow::Result<Self> {
        let urn = Urn::parse(urn).map_err(|e| anyhow::anyhow!("invalid function urn: {e}"))?;
        if !urn.is_function() {
            anyhow::bail!("'{urn}' is not a function urn (missing ':fn:' part)");
        }
        let version =
            parse_version(version).map_err(|e| anyhow::anyhow!("invalid function version: {e}"))?;
        Ok(Self {
            urn,
            version,
            summary: None,
            arguments: ArgumentSchema::empty(),
            result_schema: None,
            errors: Vec::new(),
            discoverable: true,
            deprecated: None,
            capabilities: Capabilities::default(),
        })
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }

    pub fn with_arguments(mut self, arguments: ArgumentSchema) -> Self {
        self.arguments = arguments;
        self
    }

    pub fn with_result_schema(mut self, schema: Value) -> Self {
        self.result_schema = Some(schema);
        self
    }

    pub fn with_errors(mut self, errors: Vec<ErrorCode>) -> Self {
        self.errors = errors;
        self
    }

    pub fn hidden(mut self) -> Self {
        self.discoverable = false;
        self
    }

    pub fn deprecated(mut self, note: impl Into<String>) -> Self {
        self.deprecated = Some(note.into());
        self
    }

    pub fn streamable(mut self) -> Self {
        self.capabilities.streamable = true;
        self
    }

    pub fn idempotent(mut self) -> Self {
        self.capabilities.idempotent = true;
        self
    }

    pub fn operation(mut self, kind: OperationKind) -> Self {
        self.capabilities.operation = kind;
        self
    }

    /// Stability class of this version.
    pub fn stability(&self) -> Option<Stability> {
        Stability::of(&self.version)
    }

    /// Descriptor entry for the discovery document.
    pub fn describe(&self) -> Value {
        serde_json::json!({
            "urn": self.urn.as_str(),
            "version": self.version.to_string(),
            "stability": self.stability().map(|s| s.as_str()),
            "summary": self.summary,
            "arguments": self.arguments.to_json_schema(),
            "result": self.result_schema,
            "errors": self.errors.iter().map(|e| e.as_str()).collect::<Vec<_>>(),
            "deprecated": self.deprecated,
            "capabilities": self.capabilities,
        })
    }
}

/// A callable function registered with the runtime.
#[async_trait]
pub trait Function: Send + Sync {
    fn descriptor(&self) -> &FunctionDescriptor;

    /// Invoke with bound arguments. Cooperative functions consult
    /// `ctx.check_cancelled()` / `ctx.sleep_cooperative()` at blocking
    /// points.
    async fn invoke(&self, ctx: &InvocationContext, args: JsonMap) -> FunctionResult;

    /// Streaming invocation: emit chunk payloads on `tx`, return the final
    /// result. The default wraps [`Function::invoke`] as a single chunk so
    /// non-streaming callers of streamable functions get the accumulated
    /// value and vice versa.
    async fn invoke_stream(
        &self,
        ctx: &InvocationContext,
        args: JsonMap,
        tx: ChunkSender,
    ) -> FunctionResult {
        let result = self.invoke(ctx, args).await?;
        let _ = tx.send(result.clone()).await;
        Ok(result)
    }
}

impl std::fmt::Debug for dyn Function {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("dyn Function")
            .field("descriptor", self.descriptor())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_validates_urn_and_version() {
        assert!(FunctionDescriptor::new("urn:acme:forrst:fn:echo", "1.0.0").is_ok());
        assert!(FunctionDescriptor::new("urn:forrst:ext:deadline", "1.0.0").is_err());
        assert!(FunctionDescriptor::new("urn:acme:forrst:fn:echo", "v1.0.0").is_err());
        assert!(FunctionDescriptor::new("nonsense", "1.0.0").is_err());
    }

    #[test]
    fn test_describe_shape() {
        let d = FunctionDescriptor::new("urn:acme:forrst:fn:echo", "2.1.0-beta.1")
            .unwrap()
            .with_summary("Echo back")
            .with_errors(vec![ErrorCode::InvalidArguments]);
        let doc = d.describe();
        assert_eq!(doc["urn"], "urn:acme:forrst:fn:echo");
        assert_eq!(doc["stability"], "beta");
        assert_eq!(doc["errors"][0], "INVALID_ARGUMENTS");
        assert_eq!(doc["capabilities"]["streamable"], false);
    }
}
