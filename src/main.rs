//! Forrst server binary.
//!
//! Registers a small demo function set so the server is exercisable out
//! of the box:
//!
//! | URN | Versions | Notes |
//! |-----|----------|-------|
//! | `urn:acme:forrst:fn:echo` | 1.0.0 | echoes its arguments |
//! | `urn:acme:forrst:fn:math.add` | 1.0.0, 2.0.0, 3.0.0-beta.2 | version resolution demo |
//! | `urn:acme:forrst:fn:slow.sleep` | 1.0.0 | cooperative sleep, deadline/cancel demo |
//! | `urn:acme:forrst:fn:stream.counter` | 1.0.0 | streamable counter |

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

use forrst::config::{load_config, Config};
use forrst::context::InvocationContext;
use forrst::function::{ChunkSender, Function, FunctionDescriptor, FunctionResult, OperationKind};
use forrst::protocol::JsonMap;
use forrst::runtime::ServerContext;
use forrst::schema::{ArgumentSchema, FieldSpec, FieldType};
use forrst::server::run_server;

#[derive(Parser)]
#[command(
    name = "forrst",
    about = "Forrst — a request/response RPC runtime with versioned function dispatch",
    version
)]
struct Cli {
    /// Path to configuration file
    #[arg(long, global = true, default_value = "./config/forrst.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server with the demo function set
    Serve,

    /// Validate the configuration file and exit
    Check,

    /// Print the discovery document for the demo function set as JSON
    Describe,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("forrst=info")),
        )
        .compact()
        .init();

    let cli = Cli::parse();
    let config = resolve_config(&cli.config)?;

    match cli.command {
        Commands::Serve => {
            let ctx = ServerContext::initialize(config, demo_functions())?;
            run_server(ctx).await
        }
        Commands::Check => {
            println!("configuration OK");
            Ok(())
        }
        Commands::Describe => {
            let ctx = ServerContext::initialize(config, demo_functions())?;
            let request = json!({
                "protocol": {"name": "forrst", "version": "0.1.0"},
                "id": "describe",
                "call": {"function": "urn:forrst:system:fn:describe"}
            });
            let outcome = ctx
                .handler
                .dispatch(serde_json::to_vec(&request)?.as_slice())
                .await;
            println!("{}", serde_json::to_string_pretty(&outcome.response)?);
            Ok(())
        }
    }
}

/// Load the config file; a missing file at the default path falls back to
/// built-in defaults, an explicitly given missing file is an error.
fn resolve_config(path: &PathBuf) -> Result<Config> {
    if path.exists() {
        return load_config(path);
    }
    if path == &PathBuf::from("./config/forrst.toml") {
        tracing::info!("no config file at {}, using defaults", path.display());
        return Ok(Config::default());
    }
    anyhow::bail!("config file not found: {}", path.display());
}

fn demo_functions() -> Vec<Arc<dyn Function>> {
    vec![
        Arc::new(EchoFunction::new()),
        Arc::new(AddFunction::new("1.0.0")),
        Arc::new(AddFunction::new("2.0.0")),
        Arc::new(AddFunction::new("3.0.0-beta.2")),
        Arc::new(SleepFunction::new()),
        Arc::new(CounterFunction::new()),
    ]
}

// ── demo functions ────────────────────────────────────────────────────

struct EchoFunction {
    descriptor: FunctionDescriptor,
}

impl EchoFunction {
    fn new() -> Self {
        let descriptor = FunctionDescriptor::new("urn:acme:forrst:fn:echo", "1.0.0")
            .expect("static descriptor is valid")
            .with_summary("Echo the supplied arguments back")
            .with_arguments(ArgumentSchema::empty().open())
            .idempotent();
        Self { descriptor }
    }
}

#[async_trait]
impl Function for EchoFunction {
    fn descriptor(&self) -> &FunctionDescriptor {
        &self.descriptor
    }

    async fn invoke(&self, _ctx: &InvocationContext, args: JsonMap) -> FunctionResult {
        Ok(Value::Object(args))
    }
}

struct AddFunction {
    descriptor: FunctionDescriptor,
}

impl AddFunction {
    fn new(version: &str) -> Self {
        let descriptor = FunctionDescriptor::new("urn:acme:forrst:fn:math.add", version)
            .expect("static descriptor is valid")
            .with_summary("Add two numbers")
            .with_arguments(ArgumentSchema::new(vec![
                FieldSpec::required("a", FieldType::Number),
                FieldSpec::required("b", FieldType::Number),
            ]))
            .with_result_schema(json!({
                "type": "object",
                "properties": {"sum": {"type": "number"}}
            }))
            .idempotent();
        Self { descriptor }
    }
}

#[async_trait]
impl Function for AddFunction {
    fn descriptor(&self) -> &FunctionDescriptor {
        &self.descriptor
    }

    async fn invoke(&self, _ctx: &InvocationContext, args: JsonMap) -> FunctionResult {
        let a = args.get("a").and_then(Value::as_f64).unwrap_or(0.0);
        let b = args.get("b").and_then(Value::as_f64).unwrap_or(0.0);
        Ok(json!({ "sum": a + b, "version": self.descriptor.version.to_string() }))
    }
}

struct SleepFunction {
    descriptor: FunctionDescriptor,
}

impl SleepFunction {
    fn new() -> Self {
        let descriptor = FunctionDescriptor::new("urn:acme:forrst:fn:slow.sleep", "1.0.0")
            .expect("static descriptor is valid")
            .with_summary("Sleep cooperatively for the given duration")
            .with_arguments(ArgumentSchema::new(vec![FieldSpec::optional(
                "duration_ms",
                FieldType::Integer,
            )
            .with_default(json!(50))]))
            .operation(OperationKind::Write);
        Self { descriptor }
    }
}

#[async_trait]
impl Function for SleepFunction {
    fn descriptor(&self) -> &FunctionDescriptor {
        &self.descriptor
    }

    async fn invoke(&self, ctx: &InvocationContext, args: JsonMap) -> FunctionResult {
        let duration_ms = args
            .get("duration_ms")
            .and_then(Value::as_u64)
            .unwrap_or(50);
        ctx.sleep_cooperative(Duration::from_millis(duration_ms))
            .await?;
        Ok(json!({ "slept_ms": duration_ms }))
    }
}

struct CounterFunction {
    descriptor: FunctionDescriptor,
}

impl CounterFunction {
    fn new() -> Self {
        let descriptor = FunctionDescriptor::new("urn:acme:forrst:fn:stream.counter", "1.0.0")
            .expect("static descriptor is valid")
            .with_summary("Emit an incrementing counter as a stream")
            .with_arguments(ArgumentSchema::new(vec![FieldSpec::optional(
                "count",
                FieldType::Integer,
            )
            .with_default(json!(5))]))
            .streamable();
        Self { descriptor }
    }
}

#[async_trait]
impl Function for CounterFunction {
    fn descriptor(&self) -> &FunctionDescriptor {
        &self.descriptor
    }

    async fn invoke(&self, ctx: &InvocationContext, args: JsonMap) -> FunctionResult {
        let count = args.get("count").and_then(Value::as_u64).unwrap_or(5);
        let mut values = Vec::new();
        for i in 0..count {
            ctx.check_cancelled()?;
            values.push(i);
        }
        Ok(json!({ "values": values }))
    }

    async fn invoke_stream(
        &self,
        ctx: &InvocationContext,
        args: JsonMap,
        tx: ChunkSender,
    ) -> FunctionResult {
        let count = args.get("count").and_then(Value::as_u64).unwrap_or(5);
        for i in 0..count {
            ctx.check_cancelled()?;
            if tx.send(json!({ "value": i })).await.is_err() {
                break;
            }
            ctx.sleep_cooperative(Duration::from_millis(10)).await?;
        }
        Ok(json!({ "count": count }))
    }
}
